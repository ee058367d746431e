// Copyright 2026 The Darkroom Project
// SPDX-License-Identifier: Apache-2.0

// Incremental SSE frame decoder.
//
// Buffers raw bytes and cuts frames on the blank-line separator, so the
// decoder is insensitive to how the transport chunks the stream. A chunk
// boundary may land anywhere, including inside a multi-byte UTF-8
// sequence; text conversion happens only on complete frames.

use super::types::{DecodeError, DecodeOutcome};
use bytes::Bytes;
use futures_util::{Stream, StreamExt};

/// SSE frame separators. Frames end at the first blank line.
const FRAME_SEPARATORS: [&[u8]; 2] = [b"\r\n\r\n", b"\n\n"];

/// Stateful decoder for one upstream SSE stream.
pub struct FrameDecoder {
    buffer: Vec<u8>,
    content: String,
    frames_seen: u64,
    dropped_frames: u64,
    finish_reason: Option<String>,
    done_seen: bool,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            content: String::new(),
            frames_seen: 0,
            dropped_frames: 0,
            finish_reason: None,
            done_seen: false,
        }
    }

    /// Feed one transport chunk. Returns the content fragments decoded
    /// from frames completed by this chunk, in order.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);

        let mut deltas = Vec::new();
        while let Some((pos, sep_len)) = find_separator(&self.buffer) {
            let frame: Vec<u8> = self.buffer.drain(..pos + sep_len).collect();
            if let Some(delta) = self.process_frame(&frame[..pos]) {
                deltas.push(delta);
            }
        }
        deltas
    }

    /// Consume the decoder at end of stream. Any trailing bytes that were
    /// never terminated by a blank line are decoded as a final frame.
    pub fn finish(mut self) -> DecodeOutcome {
        if !self.buffer.is_empty() {
            let trailing = std::mem::take(&mut self.buffer);
            self.process_frame(&trailing);
        }
        DecodeOutcome {
            content: self.content,
            frames_seen: self.frames_seen,
            dropped_frames: self.dropped_frames,
            finish_reason: self.finish_reason,
        }
    }

    /// Whether the upstream has sent its `[DONE]` sentinel.
    pub fn done_seen(&self) -> bool {
        self.done_seen
    }

    /// Decode one complete frame, returning its content fragment if any.
    fn process_frame(&mut self, frame: &[u8]) -> Option<String> {
        // The frame is complete, so lossy conversion cannot split a
        // multi-byte character at a chunk boundary.
        let text = String::from_utf8_lossy(frame);

        let payload = data_payload(&text)?;
        self.frames_seen += 1;

        // Joined payloads are trimmed so stray padding around a frame
        // (notably `[DONE]`) does not defeat the comparison.
        let payload = payload.trim();
        if payload == "[DONE]" {
            self.done_seen = true;
            return None;
        }

        let value: serde_json::Value = match serde_json::from_str(payload) {
            Ok(v) => v,
            Err(e) => {
                self.dropped_frames += 1;
                tracing::warn!(
                    error = %e,
                    dropped_frames = self.dropped_frames,
                    "skipping unparseable stream frame"
                );
                return None;
            }
        };

        let choice = value.get("choices").and_then(|c| c.get(0));

        if let Some(reason) = choice
            .and_then(|c| c.get("finish_reason"))
            .and_then(|r| r.as_str())
        {
            self.finish_reason = Some(reason.to_string());
        }

        let delta = choice
            .and_then(|c| c.get("delta"))
            .and_then(|d| d.get("content"))
            .and_then(|t| t.as_str())?;

        if delta.is_empty() {
            return None;
        }
        self.content.push_str(delta);
        Some(delta.to_string())
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Find the first frame separator, accepting both `\n\n` and `\r\n\r\n`.
/// Returns the frame length and the separator length.
fn find_separator(buffer: &[u8]) -> Option<(usize, usize)> {
    FRAME_SEPARATORS
        .iter()
        .filter_map(|sep| {
            buffer
                .windows(sep.len())
                .position(|w| w == *sep)
                .map(|pos| (pos, sep.len()))
        })
        .min_by_key(|&(pos, _)| pos)
}

/// Join the frame's `data:` lines with newlines, per the SSE spec.
/// Frames with no data lines (comments, bare event lines) yield None.
fn data_payload(frame: &str) -> Option<String> {
    let mut parts: Vec<&str> = Vec::new();
    for line in frame.lines() {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if let Some(rest) = line.strip_prefix("data:") {
            parts.push(rest.strip_prefix(' ').unwrap_or(rest));
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("\n"))
    }
}

/// Drive a decoder over a fallible byte stream to completion.
///
/// Transport errors abort the decode; everything decoded so far is
/// discarded with the error. Malformed frames are skipped and counted in
/// the outcome.
pub async fn decode_stream<S, E>(mut stream: S) -> Result<DecodeOutcome, DecodeError<E>>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
{
    let mut decoder = FrameDecoder::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(DecodeError::Transport)?;
        decoder.feed(&chunk);
    }
    Ok(decoder.finish())
}
