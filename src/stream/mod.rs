// Copyright 2026 The Darkroom Project
// SPDX-License-Identifier: Apache-2.0

// SSE stream decoding.
//
// Responsibilities:
// - Cut frames on blank-line separators, regardless of transport chunking
// - Join multi-line `data:` payloads per the SSE spec
// - Accumulate `choices[0].delta.content` fragments in order
// - Skip and count malformed frames instead of failing the stream
// - Flush an unterminated trailing frame at end of stream

mod decoder;
mod types;

pub use decoder::{decode_stream, FrameDecoder};
pub use types::{DecodeError, DecodeOutcome};
