//! Configuration module for atlaspub.
//!
//! Provides typed configuration structs that map to the YAML configuration file,
//! with loading, validation, defaults, and a builder pattern for programmatic use.
//!
//! Retry counts, backoff constants and the maximum layer size are policy
//! decisions, so they live here rather than in the code that applies them.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Config struct with sub-sections
// ---------------------------------------------------------------------------

/// Top-level configuration for atlaspub.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api: ApiConfig,
    pub retry: RetryConfig,
    pub upload: UploadConfig,
    pub export: ExportConfig,
    pub publish: PublishConfig,
    pub logging: LoggingConfig,
}

/// Remote service and OAuth endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Base URL of the REST API (no trailing slash needed).
    pub base_url: String,
    /// OAuth client identifier registered for the desktop application.
    pub client_id: String,
    /// RFC 8628 device authorization endpoint.
    pub device_authorization_url: String,
    /// OAuth token endpoint (device code exchange and refresh).
    pub token_url: String,
    /// Scopes requested at login.
    pub scopes: Vec<String>,
    /// Key under which credentials are persisted.
    pub account: String,
    /// Refresh the access token when it expires within this many seconds.
    pub refresh_margin_secs: u64,
    /// Per-request timeout in seconds.
    pub request_timeout_secs: u64,
    /// Give up waiting for device approval after this many seconds.
    pub login_timeout_secs: u64,
}

/// Retry/backoff policy for transient API failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts per call, including the first.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Upper bound on time spent sleeping between attempts of one call.
    pub max_total_wait_ms: u64,
}

/// Package upload settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Whole-package attempts when a part fails.
    pub max_attempts: u32,
    /// Parts in flight at once for multi-part uploads.
    pub part_parallelism: usize,
    /// Restarts with fresh parameters after they expire.
    pub expired_restarts: u32,
}

/// Layer export settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    /// Layers whose package would exceed this size are rejected.
    pub max_layer_bytes: u64,
}

/// Publish run settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishConfig {
    /// Layers exported and uploaded concurrently (clamped to 1..=8).
    pub concurrency: usize,
    /// Page size for list endpoints.
    pub page_size: u32,
}

/// Logging / tracing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: `trace`, `debug`, `info`, `warn`, or `error`.
    pub level: String,
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

impl Config {
    /// Load configuration from a YAML file at `path`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    /// Try to load from `path`; fall back to [`Config::default`] on any error.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "Using default configuration");
                Self::default()
            }
        }
    }

    /// Platform-appropriate default path for the configuration file.
    ///
    /// Typically `$XDG_CONFIG_HOME/atlaspub/config.yaml` on Linux.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join("atlaspub")
            .join("config.yaml")
    }

    /// Serializes the configuration back to YAML.
    pub fn to_yaml(&self) -> anyhow::Result<String> {
        serde_yaml::to_string(self).context("Failed to serialize configuration")
    }
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.atlaspub.example.com/v1".to_string(),
            client_id: "atlaspub-desktop".to_string(),
            device_authorization_url: "https://auth.atlaspub.example.com/oauth/device/code"
                .to_string(),
            token_url: "https://auth.atlaspub.example.com/oauth/token".to_string(),
            scopes: vec![
                "maps:read".to_string(),
                "maps:write".to_string(),
                "offline_access".to_string(),
            ],
            account: "default".to_string(),
            refresh_margin_secs: 60,
            request_timeout_secs: 30,
            login_timeout_secs: 600,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff_ms: 500,
            max_backoff_ms: 8_000,
            max_total_wait_ms: 30_000,
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            part_parallelism: 2,
            expired_restarts: 1,
        }
    }
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            max_layer_bytes: 512 * 1024 * 1024,
        }
    }
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            concurrency: 3,
            page_size: 50,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Derived values
// ---------------------------------------------------------------------------

/// Upper bound for [`PublishConfig::concurrency`].
pub const MAX_PUBLISH_CONCURRENCY: usize = 8;

impl ApiConfig {
    pub fn refresh_margin(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.refresh_margin_secs).unwrap_or(i64::MAX))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn login_timeout(&self) -> Duration {
        Duration::from_secs(self.login_timeout_secs)
    }
}

impl RetryConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn max_total_wait(&self) -> Duration {
        Duration::from_millis(self.max_total_wait_ms)
    }
}

impl PublishConfig {
    /// Worker pool size actually used for a run.
    pub fn effective_concurrency(&self) -> usize {
        self.concurrency.clamp(1, MAX_PUBLISH_CONCURRENCY)
    }
}

// ---------------------------------------------------------------------------
// Config::validate()
// ---------------------------------------------------------------------------

/// A single validation error found in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path to the offending field, e.g. `"retry.max_attempts"`.
    pub field: String,
    /// Human-readable explanation.
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Valid values for `logging.level`.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

fn check_url(errors: &mut Vec<ValidationError>, field: &str, value: &str) {
    match url::Url::parse(value) {
        Ok(parsed) if parsed.scheme() == "https" || parsed.scheme() == "http" => {}
        Ok(parsed) => errors.push(ValidationError {
            field: field.into(),
            message: format!("unsupported scheme '{}'", parsed.scheme()),
        }),
        Err(e) => errors.push(ValidationError {
            field: field.into(),
            message: format!("invalid URL '{value}': {e}"),
        }),
    }
}

fn check_positive(errors: &mut Vec<ValidationError>, field: &str, value: u64) {
    if value == 0 {
        errors.push(ValidationError {
            field: field.into(),
            message: "must be greater than 0".into(),
        });
    }
}

impl Config {
    /// Validate the configuration and return all errors found.
    ///
    /// An empty vector means the configuration is valid.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        // --- api ---
        check_url(&mut errors, "api.base_url", &self.api.base_url);
        check_url(
            &mut errors,
            "api.device_authorization_url",
            &self.api.device_authorization_url,
        );
        check_url(&mut errors, "api.token_url", &self.api.token_url);
        if self.api.client_id.trim().is_empty() {
            errors.push(ValidationError {
                field: "api.client_id".into(),
                message: "must not be empty".into(),
            });
        }
        if self.api.account.trim().is_empty() {
            errors.push(ValidationError {
                field: "api.account".into(),
                message: "must not be empty".into(),
            });
        }
        check_positive(&mut errors, "api.request_timeout_secs", self.api.request_timeout_secs);
        check_positive(&mut errors, "api.login_timeout_secs", self.api.login_timeout_secs);

        // --- retry ---
        check_positive(&mut errors, "retry.max_attempts", u64::from(self.retry.max_attempts));
        if self.retry.initial_backoff_ms > self.retry.max_backoff_ms {
            errors.push(ValidationError {
                field: "retry.initial_backoff_ms".into(),
                message: format!(
                    "initial_backoff_ms ({}) must not exceed max_backoff_ms ({})",
                    self.retry.initial_backoff_ms, self.retry.max_backoff_ms
                ),
            });
        }

        // --- upload ---
        check_positive(&mut errors, "upload.max_attempts", u64::from(self.upload.max_attempts));
        check_positive(
            &mut errors,
            "upload.part_parallelism",
            self.upload.part_parallelism as u64,
        );

        // --- export ---
        check_positive(&mut errors, "export.max_layer_bytes", self.export.max_layer_bytes);

        // --- publish ---
        if self.publish.concurrency == 0 || self.publish.concurrency > MAX_PUBLISH_CONCURRENCY {
            errors.push(ValidationError {
                field: "publish.concurrency".into(),
                message: format!("must be in range 1..={MAX_PUBLISH_CONCURRENCY}"),
            });
        }
        check_positive(&mut errors, "publish.page_size", u64::from(self.publish.page_size));

        // --- logging ---
        if !VALID_LOG_LEVELS.contains(&self.logging.level.as_str()) {
            errors.push(ValidationError {
                field: "logging.level".into(),
                message: format!(
                    "invalid level '{}'; valid options: {}",
                    self.logging.level,
                    VALID_LOG_LEVELS.join(", ")
                ),
            });
        }

        errors
    }
}

// ---------------------------------------------------------------------------
// ConfigBuilder
// ---------------------------------------------------------------------------

/// Builder for constructing a [`Config`] programmatically.
///
/// Starts from [`Config::default`] and allows selective overrides.
///
/// # Example
///
/// ```rust,no_run
/// use atlaspub_core::config::ConfigBuilder;
///
/// let config = ConfigBuilder::new()
///     .api_base_url("http://localhost:8080")
///     .retry_max_attempts(2)
///     .publish_concurrency(4)
///     .build();
/// ```
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder initialised with [`Config::default`] values.
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    // --- api ---

    pub fn api_base_url(mut self, url: impl Into<String>) -> Self {
        self.config.api.base_url = url.into();
        self
    }

    pub fn api_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.config.api.client_id = client_id.into();
        self
    }

    pub fn api_device_authorization_url(mut self, url: impl Into<String>) -> Self {
        self.config.api.device_authorization_url = url.into();
        self
    }

    pub fn api_token_url(mut self, url: impl Into<String>) -> Self {
        self.config.api.token_url = url.into();
        self
    }

    pub fn api_account(mut self, account: impl Into<String>) -> Self {
        self.config.api.account = account.into();
        self
    }

    pub fn api_refresh_margin_secs(mut self, secs: u64) -> Self {
        self.config.api.refresh_margin_secs = secs;
        self
    }

    pub fn api_request_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api.request_timeout_secs = secs;
        self
    }

    pub fn api_login_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api.login_timeout_secs = secs;
        self
    }

    /// Points every endpoint (REST and OAuth) at one server.
    ///
    /// Used against local mock servers.
    pub fn api_server(self, server_url: &str) -> Self {
        let base = server_url.trim_end_matches('/');
        self.api_base_url(base)
            .api_device_authorization_url(format!("{base}/oauth/device/code"))
            .api_token_url(format!("{base}/oauth/token"))
    }

    // --- retry ---

    pub fn retry_max_attempts(mut self, n: u32) -> Self {
        self.config.retry.max_attempts = n;
        self
    }

    pub fn retry_initial_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry.initial_backoff_ms = ms;
        self
    }

    pub fn retry_max_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry.max_backoff_ms = ms;
        self
    }

    pub fn retry_max_total_wait_ms(mut self, ms: u64) -> Self {
        self.config.retry.max_total_wait_ms = ms;
        self
    }

    // --- upload ---

    pub fn upload_max_attempts(mut self, n: u32) -> Self {
        self.config.upload.max_attempts = n;
        self
    }

    pub fn upload_part_parallelism(mut self, n: usize) -> Self {
        self.config.upload.part_parallelism = n;
        self
    }

    pub fn upload_expired_restarts(mut self, n: u32) -> Self {
        self.config.upload.expired_restarts = n;
        self
    }

    // --- export ---

    pub fn export_max_layer_bytes(mut self, bytes: u64) -> Self {
        self.config.export.max_layer_bytes = bytes;
        self
    }

    // --- publish ---

    pub fn publish_concurrency(mut self, n: usize) -> Self {
        self.config.publish.concurrency = n;
        self
    }

    pub fn publish_page_size(mut self, n: u32) -> Self {
        self.config.publish.page_size = n;
        self
    }

    // --- logging ---

    pub fn logging_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    // --- build ---

    /// Consume the builder and return the finished [`Config`].
    pub fn build(self) -> Config {
        self.config
    }

    /// Build and validate in one step. Returns `Err` with the list of
    /// validation errors if the configuration is invalid.
    pub fn build_validated(self) -> Result<Config, Vec<ValidationError>> {
        let config = self.build();
        let errors = config.validate();
        if errors.is_empty() {
            Ok(config)
        } else {
            Err(errors)
        }
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
