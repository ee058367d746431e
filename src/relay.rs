// Copyright 2026 The Darkroom Project
// SPDX-License-Identifier: Apache-2.0

// HTTP relay surface.
//
// Routes:
//   GET  /v1/heartbeat                    — liveness probe
//   POST /v1/images/generations          — full generation, JSON result
//   POST /v1/images/generations/stream   — raw SSE passthrough
//
// Every generation request walks the same gauntlet: bearer extraction,
// identity exchange, rate gate, input validation, then dispatch to the
// backend. The backend is a trait so router tests run without upstreams.

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::auth::{bearer_token, AuthError, CallerIdentity, IdentityVerifier};
use crate::ratelimit::RateLimiter;
use crate::upstream::{HttpResponse, IMAGE_DATA_URI_PREFIX, MAX_IMAGE_INPUTS};

/// Prompt length bounds, in characters, after trimming.
pub const MAX_PROMPT_CHARS: usize = 1500;

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

/// Body of a generation request.
#[derive(Debug, Clone, Deserialize)]
pub struct GenerateRequest {
    pub prompt: String,
    /// Inline reference images as data URIs. At most three are used.
    #[serde(default)]
    pub image_inputs: Vec<String>,
    /// Optional per-request model override.
    #[serde(default)]
    pub model: Option<String>,
}

impl GenerateRequest {
    /// Validate and normalize: trim the prompt, bound its length, require
    /// data-URI image inputs, and drop inputs beyond the limit.
    pub fn validated(mut self) -> Result<Self, RelayError> {
        self.prompt = self.prompt.trim().to_string();
        if self.prompt.is_empty() {
            return Err(RelayError::InvalidRequest("prompt must not be empty".into()));
        }
        if self.prompt.chars().count() > MAX_PROMPT_CHARS {
            return Err(RelayError::InvalidRequest(format!(
                "prompt exceeds {MAX_PROMPT_CHARS} characters"
            )));
        }
        for (i, input) in self.image_inputs.iter().enumerate() {
            if !input.starts_with(IMAGE_DATA_URI_PREFIX) {
                return Err(RelayError::InvalidRequest(format!(
                    "image_inputs[{i}] is not an image data URI"
                )));
            }
        }
        self.image_inputs.truncate(MAX_IMAGE_INPUTS);
        Ok(self)
    }
}

/// One generated image, ready to return to the caller.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct GeneratedImage {
    pub url: String,
}

/// Response envelope. The inner shape mirrors an images-API response so
/// existing clients can reuse their parsing.
#[derive(Debug, Serialize)]
pub struct GenerationEnvelope {
    pub data: ImagesPayload,
}

#[derive(Debug, Serialize)]
pub struct ImagesPayload {
    pub data: Vec<GeneratedImage>,
}

impl GenerationEnvelope {
    pub fn single(url: String) -> Self {
        Self {
            data: ImagesPayload {
                data: vec![GeneratedImage { url }],
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Everything that can go wrong between accepting a request and
/// returning a result.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("missing or malformed credential")]
    MissingCredential,

    #[error("credential rejected")]
    InvalidCredential,

    #[error("identity service unavailable: {0}")]
    IdentityUnavailable(String),

    #[error("rate limit exceeded")]
    RateLimited { retry_after_secs: u64 },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Upstream answered with a non-success status. Status and body are
    /// passed through to the caller verbatim.
    #[error("upstream returned status {status}")]
    UpstreamStatus { status: StatusCode, body: bytes::Bytes },

    #[error("upstream unreachable: {0}")]
    Upstream(String),

    /// The stream completed but carried no extractable image.
    #[error("upstream produced no image: {excerpt:?}")]
    NoImage { excerpt: String },

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<AuthError> for RelayError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::MissingCredential => RelayError::MissingCredential,
            AuthError::InvalidCredential => RelayError::InvalidCredential,
            AuthError::ExchangeFailed(msg) => RelayError::IdentityUnavailable(msg),
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            // A failed identity exchange is a credential problem from the
            // caller's point of view, whatever the cause.
            RelayError::MissingCredential
            | RelayError::InvalidCredential
            | RelayError::IdentityUnavailable(_) => (StatusCode::UNAUTHORIZED, self.to_string()),
            RelayError::RateLimited { retry_after_secs } => {
                let retry = *retry_after_secs;
                let mut resp = (
                    StatusCode::TOO_MANY_REQUESTS,
                    Json(serde_json::json!({ "error": self.to_string() })),
                )
                    .into_response();
                if let Ok(value) = HeaderValue::from_str(&retry.to_string()) {
                    resp.headers_mut().insert(header::RETRY_AFTER, value);
                }
                return resp;
            }
            RelayError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            RelayError::UpstreamStatus { status, body } => {
                // Verbatim passthrough of the upstream's failure.
                return (*status, body.clone()).into_response();
            }
            RelayError::Upstream(_) => (StatusCode::BAD_GATEWAY, self.to_string()),
            RelayError::NoImage { .. } => (StatusCode::BAD_GATEWAY, self.to_string()),
            RelayError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

// ---------------------------------------------------------------------------
// GenerationBackend trait
// ---------------------------------------------------------------------------

/// Runs one generation against the upstream.
#[async_trait::async_trait]
pub trait GenerationBackend: Send + Sync {
    /// Full pipeline: send, decode, extract, store. Returns the URL of
    /// the generated image.
    async fn generate(
        &self,
        caller: &CallerIdentity,
        request: &GenerateRequest,
    ) -> Result<GeneratedImage, RelayError>;

    /// Open the upstream stream and hand it back for raw passthrough.
    async fn generate_stream(
        &self,
        caller: &CallerIdentity,
        request: &GenerateRequest,
    ) -> Result<HttpResponse, RelayError>;
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub verifier: Arc<dyn IdentityVerifier>,
    pub limiter: Arc<dyn RateLimiter>,
    pub backend: Arc<dyn GenerationBackend>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/heartbeat", get(heartbeat))
        .route("/v1/images/generations", post(generate))
        .route("/v1/images/generations/stream", post(generate_stream))
        .with_state(state)
}

async fn heartbeat() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Admit a request through auth and the rate gate, yielding the caller.
async fn admit(state: &AppState, headers: &HeaderMap) -> Result<CallerIdentity, RelayError> {
    let token = bearer_token(headers)?;
    let caller = state.verifier.verify(token).await?;

    let decision = state.limiter.allow(&caller.id);
    if !decision.allowed {
        tracing::info!(caller_id = %caller.id, "rate gate rejected request");
        return Err(RelayError::RateLimited {
            retry_after_secs: decision.retry_after_secs,
        });
    }
    Ok(caller)
}

/// Parse the request body ourselves instead of through the `Json`
/// extractor: extractors run before the handler, which would reject a
/// malformed body ahead of the credential check and with an
/// extractor-shaped error instead of ours.
fn parse_request(body: &[u8]) -> Result<GenerateRequest, RelayError> {
    serde_json::from_slice(body)
        .map_err(|e| RelayError::InvalidRequest(format!("invalid request body: {e}")))
}

async fn generate(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Result<Json<GenerationEnvelope>, RelayError> {
    let caller = admit(&state, &headers).await?;
    let request = parse_request(&body)?.validated()?;

    let image = state.backend.generate(&caller, &request).await?;
    Ok(Json(GenerationEnvelope::single(image.url)))
}

async fn generate_stream(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Result<Response, RelayError> {
    let caller = admit(&state, &headers).await?;
    let request = parse_request(&body)?.validated()?;

    let upstream = state.backend.generate_stream(&caller, &request).await?;

    let content_type = upstream
        .headers
        .get(header::CONTENT_TYPE)
        .cloned()
        .unwrap_or_else(|| HeaderValue::from_static("text/event-stream"));

    // If the client disconnects, dropping this body tears down the
    // upstream connection with it.
    Response::builder()
        .status(upstream.status)
        .header(header::CONTENT_TYPE, content_type)
        .body(Body::from_stream(upstream.body.into_stream()))
        .map_err(|e| RelayError::Internal(e.to_string()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
