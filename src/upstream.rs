// Copyright 2026 The Darkroom Project
// SPDX-License-Identifier: Apache-2.0

// Upstream request construction and transport.
//
// Builds the chat-style generation request (text part first, then up to
// three image parts in input order) and sends it with the service's own
// API credential. Transport goes through the injected HttpSender trait so
// the pipeline can be tested without a network.

use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use bytes::Bytes;
use futures_util::stream::Stream;
use futures_util::{StreamExt, TryStreamExt};
use serde::Serialize;
use std::pin::Pin;

use crate::config::UpstreamConfig;

/// Image references beyond this count are silently dropped.
pub const MAX_IMAGE_INPUTS: usize = 3;

/// Prefix every accepted inline image reference must carry.
pub const IMAGE_DATA_URI_PREFIX: &str = "data:image/";

// ---------------------------------------------------------------------------
// Chat request body
// ---------------------------------------------------------------------------

/// One element of a chat message's content array.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum ContentPart {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image_url")]
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageUrl {
    pub url: String,
}

#[derive(Debug, Serialize)]
pub struct ChatMessage {
    pub role: &'static str,
    pub content: Vec<ContentPart>,
}

#[derive(Debug, Serialize)]
pub struct StreamOptions {
    pub include_usage: bool,
}

/// Wire body for `POST {base_url}/v1/chat/completions`.
#[derive(Debug, Serialize)]
pub struct ChatCompletionBody {
    pub model: String,
    pub temperature: f64,
    pub top_p: f64,
    pub messages: Vec<ChatMessage>,
    pub stream: bool,
    pub stream_options: StreamOptions,
}

/// Build the content array: the text segment first, then each accepted
/// image segment in input order. Excess images are dropped, not rejected.
pub fn build_content_parts(prompt: &str, image_inputs: &[String]) -> Vec<ContentPart> {
    let mut parts = Vec::with_capacity(1 + image_inputs.len().min(MAX_IMAGE_INPUTS));
    parts.push(ContentPart::Text {
        text: prompt.to_string(),
    });
    for input in image_inputs.iter().take(MAX_IMAGE_INPUTS) {
        parts.push(ContentPart::ImageUrl {
            image_url: ImageUrl { url: input.clone() },
        });
    }
    parts
}

/// Build the full streaming chat-completion body for one generation.
pub fn build_chat_body(
    config: &UpstreamConfig,
    prompt: &str,
    image_inputs: &[String],
    model_override: Option<&str>,
) -> ChatCompletionBody {
    ChatCompletionBody {
        model: model_override.unwrap_or(&config.model).to_string(),
        temperature: config.temperature,
        top_p: config.top_p,
        messages: vec![ChatMessage {
            role: "user",
            content: build_content_parts(prompt, image_inputs),
        }],
        stream: true,
        stream_options: StreamOptions {
            include_usage: true,
        },
    }
}

// ---------------------------------------------------------------------------
// Transport types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub timeout_ms: Option<u64>,
    pub stream: bool,
}

pub enum HttpBody {
    Full(Bytes),
    Stream(Pin<Box<dyn Stream<Item = Result<Bytes, HttpError>> + Send>>),
}

pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: HttpBody,
}

#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    #[error("upstream request failed: {0}")]
    Transport(String),
    #[error("upstream request timed out: {0}")]
    Timeout(String),
}

impl HttpBody {
    /// Collect the body into memory. Used for non-success responses whose
    /// status and payload are passed through verbatim.
    pub async fn collect(self) -> Result<Bytes, HttpError> {
        match self {
            HttpBody::Full(b) => Ok(b),
            HttpBody::Stream(mut s) => {
                let mut collected = Vec::new();
                while let Some(chunk) = s.next().await {
                    collected.extend_from_slice(&chunk?);
                }
                Ok(Bytes::from(collected))
            }
        }
    }

    /// View the body as a fallible byte stream regardless of variant.
    pub fn into_stream(self) -> Pin<Box<dyn Stream<Item = Result<Bytes, HttpError>> + Send>> {
        match self {
            HttpBody::Full(b) => Box::pin(futures_util::stream::once(async move { Ok(b) })),
            HttpBody::Stream(s) => s,
        }
    }
}

// ---------------------------------------------------------------------------
// Trait: HttpSender (dependency injection point)
// ---------------------------------------------------------------------------

/// Sends HTTP requests to the upstream model provider.
#[async_trait]
pub trait HttpSender: Send + Sync {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, HttpError>;
}

// ---------------------------------------------------------------------------
// Reqwest HTTP sender
// ---------------------------------------------------------------------------

pub struct ReqwestHttpSender {
    client: reqwest::Client,
}

impl ReqwestHttpSender {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HttpSender for ReqwestHttpSender {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, HttpError> {
        let mut req = self
            .client
            .request(request.method, &request.url)
            .headers(request.headers)
            .body(request.body);

        if let Some(timeout_ms) = request.timeout_ms {
            req = req.timeout(std::time::Duration::from_millis(timeout_ms));
        }

        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                HttpError::Timeout(e.to_string())
            } else {
                HttpError::Transport(e.to_string())
            }
        })?;

        let status = resp.status();
        let headers = resp.headers().clone();

        if request.stream {
            let stream = resp
                .bytes_stream()
                .map_err(|e| HttpError::Transport(e.to_string()));
            Ok(HttpResponse {
                status,
                headers,
                body: HttpBody::Stream(Box::pin(stream)),
            })
        } else {
            let body = resp
                .bytes()
                .await
                .map_err(|e| HttpError::Transport(e.to_string()))?;
            Ok(HttpResponse {
                status,
                headers,
                body: HttpBody::Full(body),
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Request assembly
// ---------------------------------------------------------------------------

/// Assemble an authenticated JSON POST to the given upstream path.
pub fn upstream_request(
    config: &UpstreamConfig,
    path: &str,
    body: Bytes,
    stream: bool,
) -> Result<HttpRequest, HttpError> {
    let mut headers = HeaderMap::new();
    headers.insert(
        axum::http::header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    let bearer = format!("Bearer {}", config.api_key);
    headers.insert(
        axum::http::header::AUTHORIZATION,
        HeaderValue::from_str(&bearer)
            .map_err(|_| HttpError::Transport("api key contains invalid header bytes".into()))?,
    );

    Ok(HttpRequest {
        method: Method::POST,
        url: format!("{}{}", config.base_url, path),
        headers,
        body,
        timeout_ms: config.timeout_ms,
        stream,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResponseMode;

    fn test_config() -> UpstreamConfig {
        UpstreamConfig {
            base_url: "https://api.example.com".to_string(),
            api_key: "sk-test".to_string(),
            model: "pixel-forge-2".to_string(),
            response_mode: ResponseMode::Chat,
            temperature: 0.7,
            top_p: 0.95,
            timeout_ms: Some(120_000),
        }
    }

    fn data_uri(n: usize) -> String {
        format!("data:image/png;base64,AAA{n}")
    }

    #[test]
    fn content_parts_text_only() {
        let parts = build_content_parts("a cat", &[]);
        assert_eq!(parts.len(), 1);
        assert_eq!(
            parts[0],
            ContentPart::Text {
                text: "a cat".to_string()
            }
        );
    }

    #[test]
    fn content_parts_text_first_images_in_order() {
        let inputs = vec![data_uri(0), data_uri(1), data_uri(2)];
        let parts = build_content_parts("a cat", &inputs);
        assert_eq!(parts.len(), 4);
        assert!(matches!(parts[0], ContentPart::Text { .. }));
        for (i, part) in parts[1..].iter().enumerate() {
            assert_eq!(
                *part,
                ContentPart::ImageUrl {
                    image_url: ImageUrl { url: data_uri(i) }
                }
            );
        }
    }

    #[test]
    fn content_parts_excess_images_dropped() {
        let inputs: Vec<String> = (0..7).map(data_uri).collect();
        let parts = build_content_parts("a cat", &inputs);
        // 1 + min(3, 7)
        assert_eq!(parts.len(), 4);
        assert_eq!(
            parts[3],
            ContentPart::ImageUrl {
                image_url: ImageUrl { url: data_uri(2) }
            }
        );
    }

    #[test]
    fn chat_body_wire_shape() {
        let config = test_config();
        let body = build_chat_body(&config, "a cat", &[data_uri(0)], None);
        let json = serde_json::to_value(&body).unwrap();

        assert_eq!(json["model"], "pixel-forge-2");
        assert_eq!(json["temperature"], 0.7);
        assert_eq!(json["top_p"], 0.95);
        assert_eq!(json["stream"], true);
        assert_eq!(json["stream_options"]["include_usage"], true);

        let content = json["messages"][0]["content"].as_array().unwrap();
        assert_eq!(json["messages"][0]["role"], "user");
        assert_eq!(content.len(), 2);
        assert_eq!(content[0]["type"], "text");
        assert_eq!(content[0]["text"], "a cat");
        assert_eq!(content[1]["type"], "image_url");
        assert_eq!(content[1]["image_url"]["url"], data_uri(0));
    }

    #[test]
    fn model_override_wins() {
        let config = test_config();
        let body = build_chat_body(&config, "a cat", &[], Some("pixel-forge-3"));
        assert_eq!(body.model, "pixel-forge-3");
    }

    #[test]
    fn upstream_request_carries_service_credential() {
        let config = test_config();
        let req = upstream_request(&config, "/v1/chat/completions", Bytes::from("{}"), true)
            .unwrap();
        assert_eq!(req.url, "https://api.example.com/v1/chat/completions");
        assert_eq!(
            req.headers
                .get(axum::http::header::AUTHORIZATION)
                .unwrap(),
            "Bearer sk-test"
        );
        assert_eq!(req.timeout_ms, Some(120_000));
        assert!(req.stream);
    }

    #[tokio::test]
    async fn collect_joins_stream_chunks() {
        let chunks: Vec<Result<Bytes, HttpError>> =
            vec![Ok(Bytes::from("hello ")), Ok(Bytes::from("world"))];
        let body = HttpBody::Stream(Box::pin(futures_util::stream::iter(chunks)));
        let collected = body.collect().await.unwrap();
        assert_eq!(&collected[..], b"hello world");
    }
}
