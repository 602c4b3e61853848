//! Cart engine configuration loaded from environment variables.
//!
//! # Environment Variables
//!
//! ## Required
//! - `CART_API_BASE_URL` - Base URL of the remote cart authority
//!
//! ## Optional
//! - `CART_API_TOKEN` - Bearer credential; when unset the session is anonymous
//! - `CART_REQUEST_TIMEOUT_MS` - Per-request timeout (default: 10000)
//! - `CART_DEBOUNCE_MS` - Quantity-edit debounce window (default: 100)
//! - `CART_REVALIDATE_MIN_INTERVAL_MS` - Minimum spacing between focus or
//!   visibility revalidations (default: 2000)
//! - `CART_GUEST_STORE_PATH` - Guest cart file (default: .np-cart/guest-cart.json)
//! - `SENTRY_DSN` - Sentry error tracking DSN
//! - `SENTRY_ENVIRONMENT` - Sentry environment name

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;
use thiserror::Error;
use url::Url;

const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_DEBOUNCE_MS: u64 = 100;
const DEFAULT_REVALIDATE_MIN_INTERVAL_MS: u64 = 2_000;
const DEFAULT_GUEST_STORE_PATH: &str = ".np-cart/guest-cart.json";

/// Blocklist of common placeholder patterns (case-insensitive)
const PLACEHOLDER_PATTERNS: &[&str] = &[
    "your-",
    "changeme",
    "replace",
    "placeholder",
    "example",
    "xxx",
    "todo",
    "insert",
    "put-your",
];

/// Configuration errors that can occur during loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),
    #[error("Invalid environment variable {0}: {1}")]
    InvalidEnvVar(String, String),
    #[error("Insecure secret in {0}: {1}")]
    InsecureSecret(String, String),
}

/// Full configuration for a cart client process.
#[derive(Debug, Clone)]
pub struct CartConfig {
    /// Remote authority connection settings
    pub remote: RemoteConfig,
    /// Engine timing settings
    pub sync: SyncConfig,
    /// Location of the guest cart file
    pub guest_store_path: PathBuf,
    /// Sentry DSN for error tracking
    pub sentry_dsn: Option<String>,
    /// Sentry environment name
    pub sentry_environment: Option<String>,
}

/// Remote cart authority connection settings.
///
/// Implements `Debug` manually to redact the bearer token.
#[derive(Clone)]
pub struct RemoteConfig {
    /// Base URL; cart endpoints are resolved below it
    pub base_url: Url,
    /// Bearer credential for an authenticated session
    pub bearer_token: Option<SecretString>,
    /// Per-request timeout applied by the HTTP client
    pub request_timeout: Duration,
}

impl std::fmt::Debug for RemoteConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteConfig")
            .field("base_url", &self.base_url.as_str())
            .field(
                "bearer_token",
                &self.bearer_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

impl RemoteConfig {
    /// Whether a credential is configured.
    #[must_use]
    pub const fn is_authenticated(&self) -> bool {
        self.bearer_token.is_some()
    }
}

/// Timing and cache settings for the synchronization engine.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Window within which quantity edits on one line are coalesced
    pub debounce: Duration,
    /// Deadline for every remote call; expiry counts as a network failure
    pub request_timeout: Duration,
    /// Minimum spacing between focus/visibility revalidations
    pub revalidate_min_interval: Duration,
    /// Maximum number of server removal batches remembered as notified
    pub notified_batch_capacity: u64,
    /// How long a notified removal batch is remembered
    pub notified_batch_ttl: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(DEFAULT_DEBOUNCE_MS),
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            revalidate_min_interval: Duration::from_millis(DEFAULT_REVALIDATE_MIN_INTERVAL_MS),
            notified_batch_capacity: 1_000,
            notified_batch_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl CartConfig {
    /// Load configuration from environment variables.
    ///
    /// Calls `dotenvy::dotenv()` to load from `.env` file if present.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if required variables are missing or invalid, or
    /// if the bearer token looks like a placeholder.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let base_url = parse_base_url(&get_required_env("CART_API_BASE_URL")?)?;
        let bearer_token = get_optional_env("CART_API_TOKEN")
            .map(|token| validate_token(&token, "CART_API_TOKEN").map(|()| SecretString::from(token)))
            .transpose()?;

        let request_timeout = get_duration_ms("CART_REQUEST_TIMEOUT_MS", DEFAULT_REQUEST_TIMEOUT_MS)?;
        let sync = SyncConfig {
            debounce: get_duration_ms("CART_DEBOUNCE_MS", DEFAULT_DEBOUNCE_MS)?,
            request_timeout,
            revalidate_min_interval: get_duration_ms(
                "CART_REVALIDATE_MIN_INTERVAL_MS",
                DEFAULT_REVALIDATE_MIN_INTERVAL_MS,
            )?,
            ..SyncConfig::default()
        };

        Ok(Self {
            remote: RemoteConfig {
                base_url,
                bearer_token,
                request_timeout,
            },
            sync,
            guest_store_path: PathBuf::from(get_env_or_default(
                "CART_GUEST_STORE_PATH",
                DEFAULT_GUEST_STORE_PATH,
            )),
            sentry_dsn: get_optional_env("SENTRY_DSN"),
            sentry_environment: get_optional_env("SENTRY_ENVIRONMENT"),
        })
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

/// Get a required environment variable.
fn get_required_env(key: &str) -> Result<String, ConfigError> {
    std::env::var(key).map_err(|_| ConfigError::MissingEnvVar(key.to_string()))
}

/// Get an optional environment variable, treating empty values as unset.
fn get_optional_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Get an environment variable with a default value.
fn get_env_or_default(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Get a millisecond duration with a default value.
fn get_duration_ms(key: &str, default_ms: u64) -> Result<Duration, ConfigError> {
    get_optional_env(key).map_or(Ok(Duration::from_millis(default_ms)), |raw| {
        raw.parse::<u64>()
            .map(Duration::from_millis)
            .map_err(|e| ConfigError::InvalidEnvVar(key.to_string(), e.to_string()))
    })
}

/// Parse and check the authority base URL.
fn parse_base_url(raw: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(raw)
        .map_err(|e| ConfigError::InvalidEnvVar("CART_API_BASE_URL".to_string(), e.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ConfigError::InvalidEnvVar(
            "CART_API_BASE_URL".to_string(),
            format!("unsupported scheme '{}'", url.scheme()),
        ));
    }
    if url.cannot_be_a_base() {
        return Err(ConfigError::InvalidEnvVar(
            "CART_API_BASE_URL".to_string(),
            "URL cannot be a base".to_string(),
        ));
    }
    Ok(url)
}

/// Reject bearer tokens that are obviously copied from a template.
fn validate_token(token: &str, var_name: &str) -> Result<(), ConfigError> {
    let lower = token.to_lowercase();

    for pattern in PLACEHOLDER_PATTERNS {
        if lower.contains(pattern) {
            return Err(ConfigError::InsecureSecret(
                var_name.to_string(),
                format!("appears to be a placeholder (contains '{pattern}')"),
            ));
        }
    }

    if token.chars().any(char::is_whitespace) {
        return Err(ConfigError::InsecureSecret(
            var_name.to_string(),
            "contains whitespace".to_string(),
        ));
    }

    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use secrecy::ExposeSecret;

    use super::*;

    #[test]
    fn test_validate_token_placeholder() {
        let result = validate_token("your-api-token", "TEST_VAR");
        assert!(matches!(result, Err(ConfigError::InsecureSecret(_, _))));
    }

    #[test]
    fn test_validate_token_changeme() {
        assert!(validate_token("changeme123", "TEST_VAR").is_err());
    }

    #[test]
    fn test_validate_token_whitespace() {
        assert!(validate_token("abc def", "TEST_VAR").is_err());
    }

    #[test]
    fn test_validate_token_valid() {
        assert!(validate_token("tok_9fQ2xL7mW3", "TEST_VAR").is_ok());
    }

    #[test]
    fn test_parse_base_url() {
        assert!(parse_base_url("https://carts.example.test/api/").is_ok());
        assert!(parse_base_url("ftp://carts.test/").is_err());
        assert!(parse_base_url("mailto:someone@test").is_err());
        assert!(parse_base_url("not a url").is_err());
    }

    #[test]
    fn test_sync_config_defaults() {
        let sync = SyncConfig::default();
        assert_eq!(sync.debounce, Duration::from_millis(100));
        assert_eq!(sync.request_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_remote_config_debug_redacts_token() {
        let config = RemoteConfig {
            base_url: Url::parse("https://carts.test/").unwrap(),
            bearer_token: Some(SecretString::from("super_secret_bearer")),
            request_timeout: Duration::from_secs(1),
        };

        let debug_output = format!("{config:?}");

        assert!(debug_output.contains("carts.test"));
        assert!(debug_output.contains("[REDACTED]"));
        assert!(!debug_output.contains("super_secret_bearer"));
        assert_eq!(
            config.bearer_token.as_ref().map(ExposeSecret::expose_secret),
            Some("super_secret_bearer")
        );
        assert!(config.is_authenticated());
    }
}
