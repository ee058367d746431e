// Copyright 2026 The Darkroom Project
// SPDX-License-Identifier: Apache-2.0

// Object storage for generated images.
//
// Uploads go to an S3-compatible HTTP object store with a service-level
// credential. Storage is optional and best-effort: when it is not
// configured or an upload fails, the caller falls back to returning the
// image inline as a data URI.

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

use crate::config::StorageConfig;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// A stored object and the URLs it can be fetched through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    /// Key within the bucket.
    pub key: String,
    /// Unauthenticated URL. Only usable if the bucket is public.
    pub public_url: String,
    /// Time-limited signed URL, when signing succeeded.
    pub signed_url: Option<String>,
}

impl StoredObject {
    /// The URL to hand back to the caller: signed when available.
    pub fn best_url(&self) -> &str {
        self.signed_url.as_deref().unwrap_or(&self.public_url)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage request failed: {0}")]
    Transport(String),
    #[error("storage rejected upload: status {status}: {body}")]
    Rejected { status: u16, body: String },
}

/// Build the bucket key for one generated image. Keys are scoped by
/// caller so one caller's objects cannot collide with another's.
pub fn object_key(caller_id: &str, mime_subtype: &str) -> String {
    let ext = match mime_subtype {
        "jpeg" => "jpg",
        other => other,
    };
    format!(
        "generations/{}/{}-{}.{}",
        caller_id,
        Utc::now().format("%Y%m%d-%H%M%S"),
        Uuid::new_v4(),
        ext
    )
}

// ---------------------------------------------------------------------------
// ObjectStore trait (dependency injection point)
// ---------------------------------------------------------------------------

/// Stores generated image bytes and returns fetchable URLs.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<StoredObject, StorageError>;
}

// ---------------------------------------------------------------------------
// HTTP object store
// ---------------------------------------------------------------------------

/// Object store speaking the storage service's HTTP API.
///
/// Upload: `POST {endpoint}/object/{bucket}/{key}` with the raw bytes.
/// Signing: `POST {endpoint}/object/sign/{bucket}/{key}`; a signing
/// failure is logged and degrades to the public URL, it does not fail
/// the upload.
pub struct HttpObjectStore {
    client: reqwest::Client,
    endpoint: String,
    bucket: String,
    service_key: String,
    signed_url_ttl_secs: u64,
}

#[derive(Debug, Deserialize)]
struct SignResponse {
    #[serde(rename = "signedURL")]
    signed_url: String,
}

impl HttpObjectStore {
    pub fn new(client: reqwest::Client, config: &StorageConfig) -> Self {
        Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            bucket: config.bucket.clone(),
            service_key: config.service_key.clone(),
            signed_url_ttl_secs: config.signed_url_ttl_secs,
        }
    }

    async fn sign(&self, key: &str) -> Result<String, StorageError> {
        let url = format!("{}/object/sign/{}/{}", self.endpoint, self.bucket, key);
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.service_key)
            .json(&serde_json::json!({ "expiresIn": self.signed_url_ttl_secs }))
            .send()
            .await
            .map_err(|e| StorageError::Transport(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(StorageError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let sign: SignResponse = resp
            .json()
            .await
            .map_err(|e| StorageError::Transport(e.to_string()))?;

        // The service returns a path relative to the object API root.
        let path = sign.signed_url.trim_start_matches('/');
        Ok(format!("{}/{}", self.endpoint, path))
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<StoredObject, StorageError> {
        let url = format!("{}/object/{}/{}", self.endpoint, self.bucket, key);
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.service_key)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(bytes)
            .send()
            .await
            .map_err(|e| StorageError::Transport(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(StorageError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let public_url = format!(
            "{}/object/public/{}/{}",
            self.endpoint, self.bucket, key
        );

        let signed_url = match self.sign(key).await {
            Ok(url) => Some(url),
            Err(e) => {
                tracing::warn!(key, error = %e, "signing uploaded object failed");
                None
            }
        };

        Ok(StoredObject {
            key: key.to_string(),
            public_url,
            signed_url,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_key_scoped_by_caller() {
        let key = object_key("caller-1", "png");
        assert!(key.starts_with("generations/caller-1/"));
        assert!(key.ends_with(".png"));
    }

    #[test]
    fn object_key_maps_jpeg_extension() {
        let key = object_key("caller-1", "jpeg");
        assert!(key.ends_with(".jpg"));
    }

    #[test]
    fn object_keys_are_unique() {
        let a = object_key("caller-1", "png");
        let b = object_key("caller-1", "png");
        assert_ne!(a, b);
    }

    #[test]
    fn best_url_prefers_signed() {
        let stored = StoredObject {
            key: "k".into(),
            public_url: "https://store/object/public/b/k".into(),
            signed_url: Some("https://store/object/sign/b/k?token=x".into()),
        };
        assert_eq!(stored.best_url(), "https://store/object/sign/b/k?token=x");

        let unsigned = StoredObject {
            signed_url: None,
            ..stored
        };
        assert_eq!(unsigned.best_url(), "https://store/object/public/b/k");
    }
}
