// Copyright 2026 The Darkroom Project
// SPDX-License-Identifier: Apache-2.0

// Image extraction from upstream output.
//
// Chat-style upstreams return the generated image as a Markdown image
// whose target is a base64 data URI; images-API upstreams return a JSON
// document with a `data` array. Either way the result is a normalized
// `ExtractedImage`.

use serde_json::Value;
use std::sync::OnceLock;

/// How much of an unextractable payload to keep in the error.
const EXCERPT_LEN: usize = 200;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// A generated image pulled out of the upstream's output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedImage {
    /// MIME subtype from the data URI, e.g. "png" or "jpeg".
    pub mime_subtype: String,
    /// Base64 payload with all embedded whitespace removed.
    pub base64_payload: String,
}

impl ExtractedImage {
    /// Reassemble the canonical data URI for this image.
    pub fn data_url(&self) -> String {
        format!(
            "data:image/{};base64,{}",
            self.mime_subtype, self.base64_payload
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    /// The output held no recognizable image. Carries a truncated excerpt
    /// of what the upstream actually produced.
    #[error("no image found in upstream output: {excerpt:?}")]
    NoImage { excerpt: String },
}

fn excerpt(content: &str) -> String {
    let mut end = content.len().min(EXCERPT_LEN);
    // Back off to a character boundary.
    while end > 0 && !content.is_char_boundary(end) {
        end -= 1;
    }
    content[..end].to_string()
}

// ---------------------------------------------------------------------------
// ImageExtractor trait
// ---------------------------------------------------------------------------

/// Pulls the generated image out of decoded upstream output.
pub trait ImageExtractor: Send + Sync {
    fn extract(&self, content: &str) -> Result<ExtractedImage, ExtractError>;
}

// ---------------------------------------------------------------------------
// Markdown extractor (chat mode)
// ---------------------------------------------------------------------------

/// Extracts the first Markdown-embedded base64 image from chat output.
///
/// Matches `![...](data:image/<subtype>;base64,<payload>)`, tolerating
/// whitespace and line breaks that some upstreams inject into the base64
/// payload. Only the first match counts; anything after it is ignored.
pub struct MarkdownImageExtractor;

fn markdown_image_re() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| {
        // The payload class includes whitespace so a line-wrapped base64
        // body still matches; the whitespace is stripped afterwards.
        regex::Regex::new(
            r"!\[[^\]]*\]\(\s*data:image/([a-zA-Z0-9.+-]+);base64,([A-Za-z0-9+/=\s]+)\)",
        )
        .expect("markdown image pattern is valid")
    })
}

impl ImageExtractor for MarkdownImageExtractor {
    fn extract(&self, content: &str) -> Result<ExtractedImage, ExtractError> {
        let captures = markdown_image_re()
            .captures(content)
            .ok_or_else(|| ExtractError::NoImage {
                excerpt: excerpt(content),
            })?;

        let payload: String = captures[2].chars().filter(|c| !c.is_whitespace()).collect();
        if payload.is_empty() {
            return Err(ExtractError::NoImage {
                excerpt: excerpt(content),
            });
        }

        Ok(ExtractedImage {
            mime_subtype: captures[1].to_string(),
            base64_payload: payload,
        })
    }
}

// ---------------------------------------------------------------------------
// Images-API extractor
// ---------------------------------------------------------------------------

/// Extracts from an images-API JSON document: `data[0].b64_json`
/// preferred, `data[0].url` as a fallback when it is itself a data URI.
pub struct ImagesApiExtractor;

impl ImageExtractor for ImagesApiExtractor {
    fn extract(&self, content: &str) -> Result<ExtractedImage, ExtractError> {
        let no_image = || ExtractError::NoImage {
            excerpt: excerpt(content),
        };

        let value: Value = serde_json::from_str(content).map_err(|_| no_image())?;
        let first = value
            .get("data")
            .and_then(|d| d.get(0))
            .ok_or_else(no_image)?;

        if let Some(b64) = first.get("b64_json").and_then(|b| b.as_str()) {
            let payload: String = b64.chars().filter(|c| !c.is_whitespace()).collect();
            if payload.is_empty() {
                return Err(no_image());
            }
            return Ok(ExtractedImage {
                mime_subtype: "png".to_string(),
                base64_payload: payload,
            });
        }

        if let Some(url) = first.get("url").and_then(|u| u.as_str()) {
            if let Some(rest) = url.strip_prefix("data:image/") {
                if let Some((subtype, payload)) = rest.split_once(";base64,") {
                    if !payload.is_empty() {
                        return Ok(ExtractedImage {
                            mime_subtype: subtype.to_string(),
                            base64_payload: payload.to_string(),
                        });
                    }
                }
            }
        }

        Err(no_image())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
