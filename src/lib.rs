// Copyright 2026 The Darkroom Project
// SPDX-License-Identifier: Apache-2.0

pub mod auth;
pub mod config;
pub mod engine;
pub mod extract;
pub mod ratelimit;
pub mod relay;
pub mod storage;
pub mod stream;
pub mod upstream;
