// Copyright 2026 The Darkroom Project
// SPDX-License-Identifier: Apache-2.0

// Generation engine.
//
// Wires the pipeline together: build the upstream request, stream the
// response, decode it, extract the image, and materialize a URL. The
// response mode decides both the upstream endpoint and the extractor;
// everything downstream of extraction is mode-independent.

use async_trait::async_trait;
use base64::Engine as _;
use bytes::Bytes;
use std::sync::Arc;
use uuid::Uuid;

use crate::auth::CallerIdentity;
use crate::config::{Config, ResponseMode};
use crate::extract::{
    ExtractError, ExtractedImage, ImageExtractor, ImagesApiExtractor, MarkdownImageExtractor,
};
use crate::relay::{GeneratedImage, GenerateRequest, GenerationBackend, RelayError};
use crate::storage::{object_key, ObjectStore};
use crate::stream::{decode_stream, DecodeError};
use crate::upstream::{build_chat_body, upstream_request, HttpResponse, HttpSender};

const CHAT_PATH: &str = "/v1/chat/completions";
const IMAGES_PATH: &str = "/v1/images/generations";

pub struct RelayEngine {
    config: Arc<Config>,
    sender: Arc<dyn HttpSender>,
    store: Option<Arc<dyn ObjectStore>>,
    extractor: Box<dyn ImageExtractor>,
}

impl RelayEngine {
    pub fn new(
        config: Arc<Config>,
        sender: Arc<dyn HttpSender>,
        store: Option<Arc<dyn ObjectStore>>,
    ) -> Self {
        let extractor: Box<dyn ImageExtractor> = match config.upstream.response_mode {
            ResponseMode::Chat => Box::new(MarkdownImageExtractor),
            ResponseMode::ImagesApi => Box::new(ImagesApiExtractor),
        };
        Self {
            config,
            sender,
            store,
            extractor,
        }
    }

    /// Serialize the mode-appropriate upstream body and its endpoint path.
    fn build_request_body(
        &self,
        request: &GenerateRequest,
    ) -> Result<(&'static str, Vec<u8>), RelayError> {
        let upstream = &self.config.upstream;
        match upstream.response_mode {
            ResponseMode::Chat => {
                let body = build_chat_body(
                    upstream,
                    &request.prompt,
                    &request.image_inputs,
                    request.model.as_deref(),
                );
                let bytes = serde_json::to_vec(&body)
                    .map_err(|e| RelayError::Internal(e.to_string()))?;
                Ok((CHAT_PATH, bytes))
            }
            ResponseMode::ImagesApi => {
                let body = serde_json::json!({
                    "model": request.model.as_deref().unwrap_or(&upstream.model),
                    "prompt": request.prompt,
                    "n": 1,
                    "response_format": "b64_json",
                });
                let bytes = serde_json::to_vec(&body)
                    .map_err(|e| RelayError::Internal(e.to_string()))?;
                Ok((IMAGES_PATH, bytes))
            }
        }
    }

    async fn send(
        &self,
        path: &str,
        body: Vec<u8>,
        stream: bool,
    ) -> Result<HttpResponse, RelayError> {
        let request = upstream_request(&self.config.upstream, path, Bytes::from(body), stream)
            .map_err(|e| RelayError::Internal(e.to_string()))?;
        self.sender
            .send(request)
            .await
            .map_err(|e| RelayError::Upstream(e.to_string()))
    }

    /// Decode the successful response into the text the extractor reads.
    async fn decoded_content(&self, response: HttpResponse) -> Result<String, RelayError> {
        match self.config.upstream.response_mode {
            ResponseMode::Chat => {
                let outcome = decode_stream(response.body.into_stream())
                    .await
                    .map_err(|DecodeError::Transport(e)| RelayError::Upstream(e.to_string()))?;
                if outcome.dropped_frames > 0 {
                    tracing::warn!(
                        dropped_frames = outcome.dropped_frames,
                        frames_seen = outcome.frames_seen,
                        "stream completed with unparseable frames"
                    );
                }
                tracing::debug!(
                    frames_seen = outcome.frames_seen,
                    content_len = outcome.content.len(),
                    finish_reason = outcome.finish_reason.as_deref().unwrap_or("none"),
                    "upstream stream decoded"
                );
                Ok(outcome.content)
            }
            ResponseMode::ImagesApi => {
                let body = response
                    .body
                    .collect()
                    .await
                    .map_err(|e| RelayError::Upstream(e.to_string()))?;
                Ok(String::from_utf8_lossy(&body).into_owned())
            }
        }
    }

    /// Turn an extracted image into a caller-facing URL: upload to the
    /// object store when configured, inline data URI otherwise. Upload
    /// failures degrade to the data URI rather than failing the request.
    async fn materialize(&self, caller: &CallerIdentity, image: &ExtractedImage) -> String {
        let Some(store) = &self.store else {
            return image.data_url();
        };

        let bytes = match base64::engine::general_purpose::STANDARD.decode(&image.base64_payload) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(error = %e, "image payload is not valid base64, returning inline");
                return image.data_url();
            }
        };

        let key = object_key(&caller.id, &image.mime_subtype);
        let content_type = format!("image/{}", image.mime_subtype);
        match store.put(&key, bytes, &content_type).await {
            Ok(stored) => {
                tracing::info!(caller_id = %caller.id, key = %stored.key, "image stored");
                stored.best_url().to_string()
            }
            Err(e) => {
                tracing::warn!(caller_id = %caller.id, error = %e, "upload failed, returning inline");
                image.data_url()
            }
        }
    }
}

#[async_trait]
impl GenerationBackend for RelayEngine {
    async fn generate(
        &self,
        caller: &CallerIdentity,
        request: &GenerateRequest,
    ) -> Result<GeneratedImage, RelayError> {
        let request_id = Uuid::new_v4();
        let started = std::time::Instant::now();
        tracing::info!(
            %request_id,
            caller_id = %caller.id,
            mode = %self.config.upstream.response_mode,
            prompt_chars = request.prompt.chars().count(),
            image_inputs = request.image_inputs.len(),
            "generation started"
        );

        let (path, body) = self.build_request_body(request)?;
        let stream = matches!(self.config.upstream.response_mode, ResponseMode::Chat);
        let response = self.send(path, body, stream).await?;

        if !response.status.is_success() {
            let status = response.status;
            let body = response
                .body
                .collect()
                .await
                .map_err(|e| RelayError::Upstream(e.to_string()))?;
            tracing::warn!(%request_id, status = %status, "upstream rejected generation");
            return Err(RelayError::UpstreamStatus { status, body });
        }

        let content = self.decoded_content(response).await?;
        let image = self.extractor.extract(&content).map_err(
            |ExtractError::NoImage { excerpt }| {
                tracing::warn!(%request_id, "upstream output held no image");
                RelayError::NoImage { excerpt }
            },
        )?;

        let url = self.materialize(caller, &image).await;
        tracing::info!(
            %request_id,
            caller_id = %caller.id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "generation finished"
        );
        Ok(GeneratedImage { url })
    }

    async fn generate_stream(
        &self,
        caller: &CallerIdentity,
        request: &GenerateRequest,
    ) -> Result<HttpResponse, RelayError> {
        let request_id = Uuid::new_v4();
        tracing::info!(
            %request_id,
            caller_id = %caller.id,
            "stream passthrough started"
        );

        let (path, body) = self.build_request_body(request)?;
        // Non-success statuses flow through to the caller untouched.
        self.send(path, body, true).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
