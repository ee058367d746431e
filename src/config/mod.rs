// Copyright 2026 The Darkroom Project
// SPDX-License-Identifier: Apache-2.0

// Config loader and validator
//
// Loads darkroom.yaml, validates structure, resolves ${VAR} interpolation
// for secrets, and computes a deterministic config hash for startup logging.

use std::fmt;
use std::path::PathBuf;

use sha2::{Digest, Sha256};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// All errors that can occur during config loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config source: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("undefined variable ${{{name}}} in config (not set in environment)")]
    UndefinedVariable { name: String },
}

// ---------------------------------------------------------------------------
// ConfigSource trait (interface-first, dependency injection)
// ---------------------------------------------------------------------------

/// Abstraction over where config YAML comes from.
///
/// `FileSource` reads from disk; `StringSource` provides content directly
/// (used in tests to avoid file I/O).
pub trait ConfigSource {
    fn load(&self) -> Result<String, ConfigError>;
}

/// Loads config from a file on disk.
pub struct FileSource {
    pub path: PathBuf,
}

impl ConfigSource for FileSource {
    fn load(&self) -> Result<String, ConfigError> {
        Ok(std::fs::read_to_string(&self.path)?)
    }
}

/// Provides config content directly as a string. Used for testing.
pub struct StringSource {
    pub content: String,
}

impl ConfigSource for StringSource {
    fn load(&self) -> Result<String, ConfigError> {
        Ok(self.content.clone())
    }
}

// ---------------------------------------------------------------------------
// Typed config structs
// ---------------------------------------------------------------------------

/// Top-level parsed and validated darkroom config.
#[derive(Debug)]
pub struct Config {
    /// Contract version. Always "v1".
    pub version: String,
    /// Upstream model provider settings.
    pub upstream: UpstreamConfig,
    /// Identity service settings.
    pub auth: AuthConfig,
    /// Rate gate settings.
    pub rate_limit: RateLimitConfig,
    /// Object storage settings. Absent means no archival: the relay
    /// always returns the raw data URI.
    pub storage: Option<StorageConfig>,
    /// Environment label (e.g. "staging", "production").
    pub environment: String,
    /// SHA256 hash of the raw YAML bytes: "sha256:{hex}".
    pub config_hash: String,
}

/// How the upstream provider returns generated images.
///
/// `Chat` streams a chat-completions SSE response whose final text embeds
/// the image as a Markdown data URI. `ImagesApi` is the non-streaming
/// images endpoint returning structured `b64_json` payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseMode {
    Chat,
    ImagesApi,
}

impl fmt::Display for ResponseMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseMode::Chat => write!(f, "chat"),
            ResponseMode::ImagesApi => write!(f, "images_api"),
        }
    }
}

/// Upstream model provider configuration.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// Base URL of the provider, without trailing slash.
    pub base_url: String,
    /// Service API credential. Never the caller's.
    pub api_key: String,
    /// Default model identifier when the request omits one.
    pub model: String,
    /// Response shape the provider uses.
    pub response_mode: ResponseMode,
    /// Sampling temperature sent with every request.
    pub temperature: f64,
    /// Nucleus sampling parameter sent with every request.
    pub top_p: f64,
    /// Request timeout in milliseconds.
    pub timeout_ms: Option<u64>,
}

/// Identity service configuration.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Base URL of the identity service, without trailing slash.
    pub identity_url: String,
}

/// Rate gate configuration.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Window duration in milliseconds.
    pub window_ms: u64,
    /// Maximum admitted requests per caller per window.
    pub max_requests: u32,
}

pub const DEFAULT_RATE_WINDOW_MS: u64 = 60_000;
pub const DEFAULT_RATE_MAX_REQUESTS: u32 = 5;

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_ms: DEFAULT_RATE_WINDOW_MS,
            max_requests: DEFAULT_RATE_MAX_REQUESTS,
        }
    }
}

/// S3-compatible object storage configuration.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Storage API endpoint, without trailing slash.
    pub endpoint: String,
    /// Bucket that receives generated images.
    pub bucket: String,
    /// Service storage credential.
    pub service_key: String,
    /// Lifetime of signed retrieval URLs in seconds.
    pub signed_url_ttl_secs: u64,
}

pub const DEFAULT_SIGNED_URL_TTL_SECS: u64 = 3_600;
pub const DEFAULT_TEMPERATURE: f64 = 0.7;
pub const DEFAULT_TOP_P: f64 = 0.95;

// ---------------------------------------------------------------------------
// Raw YAML deserialization types (internal)
// ---------------------------------------------------------------------------
// These are separate from the public Config structs because:
// 1. We do variable interpolation and validation between raw and public
// 2. Keeps the public API clean (no Option soup for defaulted fields)

mod raw {
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    pub struct RawConfig {
        pub darkroom: String,
        pub upstream: RawUpstreamConfig,
        pub auth: RawAuthConfig,
        pub rate_limit: Option<RawRateLimitConfig>,
        pub storage: Option<RawStorageConfig>,
        pub environment: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    pub struct RawUpstreamConfig {
        pub base_url: String,
        pub api_key: String,
        pub model: String,
        pub response_mode: Option<String>,
        pub temperature: Option<f64>,
        pub top_p: Option<f64>,
        pub timeout_ms: Option<u64>,
    }

    #[derive(Debug, Deserialize)]
    pub struct RawAuthConfig {
        pub identity_url: String,
    }

    #[derive(Debug, Deserialize)]
    pub struct RawRateLimitConfig {
        pub window_ms: Option<u64>,
        pub max_requests: Option<u32>,
    }

    #[derive(Debug, Deserialize)]
    pub struct RawStorageConfig {
        pub endpoint: String,
        pub bucket: String,
        pub service_key: String,
        pub signed_url_ttl_secs: Option<u64>,
    }
}

// ---------------------------------------------------------------------------
// Variable interpolation
// ---------------------------------------------------------------------------

/// Resolves `${VAR_NAME}` references in a string from environment variables.
/// Returns `ConfigError::UndefinedVariable` if a referenced variable is not set.
fn resolve_variables(input: &str) -> Result<String, ConfigError> {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            let mut found_close = false;
            for c in chars.by_ref() {
                if c == '}' {
                    found_close = true;
                    break;
                }
                var_name.push(c);
            }
            if !found_close || var_name.is_empty() {
                // Malformed interpolation -- treat literally
                result.push('$');
                result.push('{');
                result.push_str(&var_name);
                continue;
            }
            let value = std::env::var(&var_name).map_err(|_| ConfigError::UndefinedVariable {
                name: var_name.clone(),
            })?;
            result.push_str(&value);
        } else {
            result.push(ch);
        }
    }

    Ok(result)
}

// ---------------------------------------------------------------------------
// Config loading and validation
// ---------------------------------------------------------------------------

/// Load and validate a darkroom config from the given source.
///
/// Steps:
/// 1. Read raw YAML bytes from source
/// 2. Compute SHA256 config hash
/// 3. Parse YAML into raw deserialization types
/// 4. Validate required fields and values
/// 5. Resolve variable interpolation in credential fields
/// 6. Build typed Config struct
pub fn load_config(source: &dyn ConfigSource) -> Result<Config, ConfigError> {
    let raw_yaml = source.load()?;
    let config_hash = compute_hash(&raw_yaml);

    let raw: raw::RawConfig = serde_yaml::from_str(&raw_yaml)?;

    // Validate version
    if raw.darkroom != "v1" {
        return Err(ConfigError::Validation(format!(
            "unsupported config version \"{}\", expected \"v1\"",
            raw.darkroom
        )));
    }

    let upstream = build_upstream_config(raw.upstream)?;
    let auth = build_auth_config(raw.auth)?;
    let rate_limit = build_rate_limit_config(raw.rate_limit)?;
    let storage = raw.storage.map(build_storage_config).transpose()?;

    Ok(Config {
        version: raw.darkroom,
        upstream,
        auth,
        rate_limit,
        storage,
        environment: raw.environment.unwrap_or_default(),
        config_hash,
    })
}

pub fn compute_hash(raw_yaml: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw_yaml.as_bytes());
    let hash = hasher.finalize();
    format!("sha256:{:x}", hash)
}

fn build_upstream_config(raw: raw::RawUpstreamConfig) -> Result<UpstreamConfig, ConfigError> {
    if raw.base_url.trim().is_empty() {
        return Err(ConfigError::Validation(
            "upstream.base_url must not be empty".to_string(),
        ));
    }
    if raw.model.trim().is_empty() {
        return Err(ConfigError::Validation(
            "upstream.model must not be empty".to_string(),
        ));
    }

    let api_key = resolve_variables(&raw.api_key)?;
    if api_key.is_empty() {
        return Err(ConfigError::Validation(
            "upstream.api_key must not be empty".to_string(),
        ));
    }

    let response_mode = match raw.response_mode.as_deref() {
        Some("chat") | None => ResponseMode::Chat,
        Some("images_api") => ResponseMode::ImagesApi,
        Some(other) => {
            return Err(ConfigError::Validation(format!(
                "unknown upstream.response_mode \"{other}\", expected \"chat\" or \"images_api\""
            )));
        }
    };

    let temperature = raw.temperature.unwrap_or(DEFAULT_TEMPERATURE);
    if !(0.0..=2.0).contains(&temperature) {
        return Err(ConfigError::Validation(format!(
            "upstream.temperature must be in [0.0, 2.0], got {temperature}"
        )));
    }

    let top_p = raw.top_p.unwrap_or(DEFAULT_TOP_P);
    if !(0.0..=1.0).contains(&top_p) {
        return Err(ConfigError::Validation(format!(
            "upstream.top_p must be in [0.0, 1.0], got {top_p}"
        )));
    }

    Ok(UpstreamConfig {
        base_url: raw.base_url.trim_end_matches('/').to_string(),
        api_key,
        model: raw.model,
        response_mode,
        temperature,
        top_p,
        timeout_ms: raw.timeout_ms,
    })
}

fn build_auth_config(raw: raw::RawAuthConfig) -> Result<AuthConfig, ConfigError> {
    if raw.identity_url.trim().is_empty() {
        return Err(ConfigError::Validation(
            "auth.identity_url must not be empty".to_string(),
        ));
    }
    Ok(AuthConfig {
        identity_url: raw.identity_url.trim_end_matches('/').to_string(),
    })
}

fn build_rate_limit_config(
    raw: Option<raw::RawRateLimitConfig>,
) -> Result<RateLimitConfig, ConfigError> {
    let raw = match raw {
        Some(r) => r,
        None => return Ok(RateLimitConfig::default()),
    };

    let window_ms = raw.window_ms.unwrap_or(DEFAULT_RATE_WINDOW_MS);
    if window_ms == 0 {
        return Err(ConfigError::Validation(
            "rate_limit.window_ms must be > 0".to_string(),
        ));
    }

    let max_requests = raw.max_requests.unwrap_or(DEFAULT_RATE_MAX_REQUESTS);
    if max_requests == 0 {
        return Err(ConfigError::Validation(
            "rate_limit.max_requests must be >= 1".to_string(),
        ));
    }

    Ok(RateLimitConfig {
        window_ms,
        max_requests,
    })
}

fn build_storage_config(raw: raw::RawStorageConfig) -> Result<StorageConfig, ConfigError> {
    if raw.endpoint.trim().is_empty() {
        return Err(ConfigError::Validation(
            "storage.endpoint must not be empty".to_string(),
        ));
    }
    if raw.bucket.trim().is_empty() {
        return Err(ConfigError::Validation(
            "storage.bucket must not be empty".to_string(),
        ));
    }

    let service_key = resolve_variables(&raw.service_key)?;
    if service_key.is_empty() {
        return Err(ConfigError::Validation(
            "storage.service_key must not be empty".to_string(),
        ));
    }

    Ok(StorageConfig {
        endpoint: raw.endpoint.trim_end_matches('/').to_string(),
        bucket: raw.bucket,
        service_key,
        signed_url_ttl_secs: raw.signed_url_ttl_secs.unwrap_or(DEFAULT_SIGNED_URL_TTL_SECS),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    fn with_env<F: FnOnce()>(name: &str, value: &str, f: F) {
        let _guard = ENV_MUTEX.lock().unwrap();
        let previous = std::env::var(name).ok();
        std::env::set_var(name, value);
        f();
        match previous {
            Some(value) => std::env::set_var(name, value),
            None => std::env::remove_var(name),
        }
    }

    const EXAMPLE_YAML: &str = r#"darkroom: v1

upstream:
  base_url: https://api.example.com/
  api_key: "${DARKROOM_UPSTREAM_KEY}"
  model: pixel-forge-2
  response_mode: chat
  temperature: 0.8
  timeout_ms: 120000

auth:
  identity_url: https://auth.example.com/auth/v1

rate_limit:
  window_ms: 60000
  max_requests: 5

storage:
  endpoint: https://storage.example.com/storage/v1
  bucket: generations
  service_key: "${DARKROOM_STORAGE_KEY}"
  signed_url_ttl_secs: 900

environment: "test"
"#;

    fn load(yaml: &str) -> Result<Config, ConfigError> {
        load_config(&StringSource {
            content: yaml.to_string(),
        })
    }

    #[test]
    fn example_config_loads() {
        with_env("DARKROOM_UPSTREAM_KEY", "sk-upstream", || {
            with_inner_env("DARKROOM_STORAGE_KEY", "sk-storage", || {
                let config = load(EXAMPLE_YAML).unwrap();
                assert_eq!(config.version, "v1");
                assert_eq!(config.upstream.base_url, "https://api.example.com");
                assert_eq!(config.upstream.api_key, "sk-upstream");
                assert_eq!(config.upstream.model, "pixel-forge-2");
                assert_eq!(config.upstream.response_mode, ResponseMode::Chat);
                assert_eq!(config.upstream.temperature, 0.8);
                assert_eq!(config.upstream.top_p, DEFAULT_TOP_P);
                assert_eq!(config.upstream.timeout_ms, Some(120000));
                assert_eq!(config.auth.identity_url, "https://auth.example.com/auth/v1");
                assert_eq!(config.rate_limit.window_ms, 60000);
                assert_eq!(config.rate_limit.max_requests, 5);
                let storage = config.storage.unwrap();
                assert_eq!(storage.endpoint, "https://storage.example.com/storage/v1");
                assert_eq!(storage.bucket, "generations");
                assert_eq!(storage.service_key, "sk-storage");
                assert_eq!(storage.signed_url_ttl_secs, 900);
                assert_eq!(config.environment, "test");
                assert!(config.config_hash.starts_with("sha256:"));
            });
        });
    }

    // Nested env setter that does not re-take ENV_MUTEX.
    fn with_inner_env<F: FnOnce()>(name: &str, value: &str, f: F) {
        let previous = std::env::var(name).ok();
        std::env::set_var(name, value);
        f();
        match previous {
            Some(value) => std::env::set_var(name, value),
            None => std::env::remove_var(name),
        }
    }

    const MINIMAL_YAML: &str = r#"darkroom: v1
upstream:
  base_url: https://api.example.com
  api_key: sk-literal
  model: pixel-forge-2
auth:
  identity_url: https://auth.example.com/auth/v1
"#;

    #[test]
    fn minimal_config_applies_defaults() {
        let config = load(MINIMAL_YAML).unwrap();
        assert_eq!(config.rate_limit.window_ms, DEFAULT_RATE_WINDOW_MS);
        assert_eq!(config.rate_limit.max_requests, DEFAULT_RATE_MAX_REQUESTS);
        assert_eq!(config.upstream.response_mode, ResponseMode::Chat);
        assert_eq!(config.upstream.temperature, DEFAULT_TEMPERATURE);
        assert_eq!(config.upstream.top_p, DEFAULT_TOP_P);
        assert!(config.storage.is_none());
        assert_eq!(config.environment, "");
    }

    #[test]
    fn unsupported_version_rejected() {
        let yaml = MINIMAL_YAML.replace("darkroom: v1", "darkroom: v2");
        let err = load(&yaml).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
        assert!(err.to_string().contains("v2"));
    }

    #[test]
    fn unknown_response_mode_rejected() {
        let yaml = MINIMAL_YAML.replace(
            "  model: pixel-forge-2",
            "  model: pixel-forge-2\n  response_mode: carrier-pigeon",
        );
        let err = load(&yaml).unwrap_err();
        assert!(err.to_string().contains("carrier-pigeon"));
    }

    #[test]
    fn images_api_mode_parses() {
        let yaml = MINIMAL_YAML.replace(
            "  model: pixel-forge-2",
            "  model: pixel-forge-2\n  response_mode: images_api",
        );
        let config = load(&yaml).unwrap();
        assert_eq!(config.upstream.response_mode, ResponseMode::ImagesApi);
    }

    #[test]
    fn zero_rate_window_rejected() {
        let yaml = format!("{MINIMAL_YAML}rate_limit:\n  window_ms: 0\n");
        let err = load(&yaml).unwrap_err();
        assert!(err.to_string().contains("window_ms"));
    }

    #[test]
    fn zero_rate_ceiling_rejected() {
        let yaml = format!("{MINIMAL_YAML}rate_limit:\n  max_requests: 0\n");
        let err = load(&yaml).unwrap_err();
        assert!(err.to_string().contains("max_requests"));
    }

    #[test]
    fn empty_base_url_rejected() {
        let yaml = MINIMAL_YAML.replace("https://api.example.com", "\"\"");
        let err = load(&yaml).unwrap_err();
        assert!(err.to_string().contains("base_url"));
    }

    #[test]
    fn out_of_range_temperature_rejected() {
        let yaml = MINIMAL_YAML.replace(
            "  model: pixel-forge-2",
            "  model: pixel-forge-2\n  temperature: 3.5",
        );
        let err = load(&yaml).unwrap_err();
        assert!(err.to_string().contains("temperature"));
    }

    #[test]
    fn undefined_variable_reports_name() {
        let _guard = ENV_MUTEX.lock().unwrap();
        std::env::remove_var("DARKROOM_MISSING_KEY");
        let yaml = MINIMAL_YAML.replace("sk-literal", "\"${DARKROOM_MISSING_KEY}\"");
        let err = load_config(&StringSource { content: yaml }).unwrap_err();
        assert!(matches!(err, ConfigError::UndefinedVariable { .. }));
        assert!(err.to_string().contains("DARKROOM_MISSING_KEY"));
    }

    #[test]
    fn malformed_interpolation_kept_literal() {
        let resolved = resolve_variables("prefix-${unclosed").unwrap();
        assert_eq!(resolved, "prefix-${unclosed");
    }

    #[test]
    fn config_hash_is_stable() {
        assert_eq!(compute_hash("abc"), compute_hash("abc"));
        assert_ne!(compute_hash("abc"), compute_hash("abd"));
    }
}
