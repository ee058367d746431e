// Copyright 2026 The Darkroom Project
// SPDX-License-Identifier: Apache-2.0

// Caller authentication.
//
// Extracts the bearer credential from the Authorization header and
// exchanges it for a caller identity at the external identity service.
// The caller's credential is used for this exchange only; it is never
// forwarded to the upstream model provider.

use axum::http::HeaderMap;
use serde::Deserialize;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// The resolved principal behind a bearer credential.
///
/// The id is the rate-limit key and the storage key scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerIdentity {
    pub id: String,
}

/// Errors from credential extraction and identity exchange.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("missing or malformed Authorization header")]
    MissingCredential,

    #[error("identity service rejected the credential")]
    InvalidCredential,

    #[error("identity service unreachable: {0}")]
    ExchangeFailed(String),
}

// ---------------------------------------------------------------------------
// Bearer extraction
// ---------------------------------------------------------------------------

/// Extract the bearer token from an Authorization header.
///
/// Accepts exactly `Bearer <token>` with a non-empty token; anything else
/// is `MissingCredential`.
pub fn bearer_token(headers: &HeaderMap) -> Result<&str, AuthError> {
    let value = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(AuthError::MissingCredential)?;

    let token = value
        .strip_prefix("Bearer ")
        .ok_or(AuthError::MissingCredential)?
        .trim();

    if token.is_empty() {
        return Err(AuthError::MissingCredential);
    }
    Ok(token)
}

// ---------------------------------------------------------------------------
// IdentityVerifier trait (dependency injection point)
// ---------------------------------------------------------------------------

/// Exchanges a bearer credential for a caller identity.
///
/// Implementations must be Send + Sync so they can be shared across request
/// handlers via `Arc`.
#[async_trait::async_trait]
pub trait IdentityVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<CallerIdentity, AuthError>;
}

// ---------------------------------------------------------------------------
// HTTP identity verifier
// ---------------------------------------------------------------------------

/// Verifier backed by the external identity service.
///
/// GET `{identity_url}/user` with the caller's bearer; a 200 response with
/// a JSON `id` field resolves the identity, anything else rejects it.
pub struct HttpIdentityVerifier {
    client: reqwest::Client,
    identity_url: String,
}

#[derive(Debug, Deserialize)]
struct IdentityResponse {
    id: String,
}

impl HttpIdentityVerifier {
    pub fn new(client: reqwest::Client, identity_url: impl Into<String>) -> Self {
        Self {
            client,
            identity_url: identity_url.into(),
        }
    }
}

#[async_trait::async_trait]
impl IdentityVerifier for HttpIdentityVerifier {
    async fn verify(&self, token: &str) -> Result<CallerIdentity, AuthError> {
        let url = format!("{}/user", self.identity_url);
        let resp = self
            .client
            .get(&url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| AuthError::ExchangeFailed(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(AuthError::InvalidCredential);
        }

        let identity: IdentityResponse = resp
            .json()
            .await
            .map_err(|e| AuthError::ExchangeFailed(e.to_string()))?;

        if identity.id.is_empty() {
            return Err(AuthError::InvalidCredential);
        }

        Ok(CallerIdentity { id: identity.id })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers_with_auth(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_str(value).unwrap(),
        );
        headers
    }

    #[test]
    fn bearer_token_extracts_value() {
        let headers = headers_with_auth("Bearer abc123");
        assert_eq!(bearer_token(&headers).unwrap(), "abc123");
    }

    #[test]
    fn missing_header_rejected() {
        let headers = HeaderMap::new();
        assert!(matches!(
            bearer_token(&headers),
            Err(AuthError::MissingCredential)
        ));
    }

    #[test]
    fn non_bearer_scheme_rejected() {
        let headers = headers_with_auth("Basic dXNlcjpwYXNz");
        assert!(matches!(
            bearer_token(&headers),
            Err(AuthError::MissingCredential)
        ));
    }

    #[test]
    fn empty_token_rejected() {
        let headers = headers_with_auth("Bearer ");
        assert!(matches!(
            bearer_token(&headers),
            Err(AuthError::MissingCredential)
        ));
    }

    #[test]
    fn bare_bearer_keyword_rejected() {
        let headers = headers_with_auth("Bearer");
        assert!(matches!(
            bearer_token(&headers),
            Err(AuthError::MissingCredential)
        ));
    }
}
