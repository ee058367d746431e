// Copyright 2026 The Darkroom Project
// SPDX-License-Identifier: Apache-2.0

// Stream decode types.
//
// The decoder consumes the upstream SSE byte stream and accumulates the
// assistant's text content. Malformed frames are counted, not fatal; a
// stream that yields frames we cannot parse can still succeed if any
// later frame carries content.

use std::fmt;

/// Final result of decoding one upstream stream to completion.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DecodeOutcome {
    /// All `choices[0].delta.content` fragments, concatenated in arrival
    /// order.
    pub content: String,
    /// Frames seen on the wire, including `[DONE]` and malformed ones.
    pub frames_seen: u64,
    /// Frames whose payload failed to parse as JSON. Skipped, never fatal.
    pub dropped_frames: u64,
    /// The upstream's stated completion reason, if any frame carried one.
    pub finish_reason: Option<String>,
}

/// Errors from the decode loop itself.
///
/// Malformed frames are NOT errors (they are skipped and counted); this
/// only covers transport failures underneath the stream.
#[derive(Debug)]
pub enum DecodeError<E> {
    /// The underlying byte stream failed mid-flight.
    Transport(E),
}

impl<E: fmt::Display> fmt::Display for DecodeError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::Transport(e) => write!(f, "stream transport failed: {e}"),
        }
    }
}

impl<E: fmt::Display + fmt::Debug> std::error::Error for DecodeError<E> {}
