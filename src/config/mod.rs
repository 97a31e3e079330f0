//! Configuration loading for the commerce connectors service.
//!
//! Loads layered `.env` files and environment variables prefixed with
//! `CONNECTORS_`, producing a typed [`AppConfig`].

use std::{collections::BTreeMap, env, net::SocketAddr, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

const ENV_PREFIX: &str = "CONNECTORS_";
const REDACTED: &str = "[REDACTED]";

/// Hard ceiling for the Stripe-style replay window.
pub const MAX_REPLAY_TOLERANCE_SECONDS: u64 = 300;

/// Largest page size any adapter will request.
pub const MAX_PAGE_SIZE: u32 = 250;

/// Application configuration derived from `CONNECTORS_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct AppConfig {
    #[serde(default = "default_profile")]
    pub profile: String,
    #[serde(default = "default_api_bind_addr")]
    pub api_bind_addr: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,
    #[serde(default = "default_db_acquire_timeout_ms")]
    pub db_acquire_timeout_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crypto_key: Option<Vec<u8>>,
    #[serde(default)]
    pub webhooks: WebhookConfig,
    #[serde(default)]
    pub providers: ProviderEndpoints,
    #[serde(default)]
    pub queue: RequestQueueConfig,
    #[serde(default)]
    pub rate_limit_policy: RateLimitPolicyConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

/// Inbound webhook settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct WebhookConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shopify_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stripe_secret: Option<String>,
    /// Maximum age of a signed Stripe timestamp. Can be tightened below 300, never widened.
    #[serde(default = "default_webhook_replay_tolerance_seconds")]
    pub replay_tolerance_seconds: u64,
    /// Per-connection inbound ceiling
    #[serde(default = "default_webhook_rate_limit_per_minute")]
    pub rate_limit_per_minute: u32,
    #[serde(default = "default_webhook_max_body_kb")]
    pub max_body_kb: usize,
}

/// Outbound provider API endpoints. Overridable so tests can point at a mock server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct ProviderEndpoints {
    /// When set, replaces `https://{shop}` for every Shopify call
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shopify_api_base: Option<String>,
    #[serde(default = "default_shopify_api_version")]
    pub shopify_api_version: String,
    #[serde(default = "default_stripe_api_base")]
    pub stripe_api_base: String,
}

/// Per-connection outbound request queue settings.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct RequestQueueConfig {
    /// Admission ceiling per sliding window (default: 40)
    ///
    /// Environment variable: `CONNECTORS_QUEUE_REQUESTS_PER_SECOND`
    #[serde(default = "default_queue_requests_per_second")]
    #[schema(example = 40)]
    pub requests_per_second: u32,

    /// Sliding window length in milliseconds (default: 1000)
    #[serde(default = "default_queue_window_ms")]
    pub window_ms: u64,

    /// Timeout applied to every single outbound attempt (default: 30000)
    #[serde(default = "default_queue_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Pending requests a queue accepts before callers wait on enqueue (default: 1024)
    #[serde(default = "default_queue_capacity")]
    pub capacity: usize,

    /// Provider-specific admission ceilings
    ///
    /// Environment variable: `CONNECTORS_QUEUE_OVERRIDE_{PROVIDER}_REQUESTS_PER_SECOND`
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub provider_overrides: BTreeMap<String, u32>,
}

/// Retry/backoff policy for provider rate limits and transient failures
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct RateLimitPolicyConfig {
    /// Base retry interval in seconds (default: 1)
    ///
    /// Retries wait `base_seconds * multiplier^attempt`, capped at `max_seconds`.
    ///
    /// Environment variable: `CONNECTORS_RATE_LIMIT_BASE_SECONDS`
    #[serde(default = "default_rate_limit_base_seconds")]
    #[schema(example = 1)]
    pub base_seconds: u64,

    /// Growth factor between attempts (default: 2.0)
    #[serde(default = "default_rate_limit_multiplier")]
    #[schema(example = 2.0)]
    pub multiplier: f64,

    /// Maximum retry interval in seconds (default: 60)
    ///
    /// Environment variable: `CONNECTORS_RATE_LIMIT_MAX_SECONDS`
    #[serde(default = "default_rate_limit_max_seconds")]
    #[schema(example = 60)]
    pub max_seconds: u64,

    /// Total attempts including the first one (default: 5)
    #[serde(default = "default_rate_limit_max_attempts")]
    #[schema(example = 5)]
    pub max_attempts: u32,

    /// Jitter factor (default: 0.1, range: 0.0-1.0)
    ///
    /// Environment variable: `CONNECTORS_RATE_LIMIT_JITTER_FACTOR`
    #[serde(default = "default_rate_limit_jitter_factor")]
    #[schema(example = 0.1, minimum = 0.0, maximum = 1.0)]
    pub jitter_factor: f64,

    /// Provider-specific overrides
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub provider_overrides: BTreeMap<String, RateLimitProviderOverride>,
}

/// Provider-specific retry policy overrides
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct RateLimitProviderOverride {
    /// Environment variable: `CONNECTORS_RATE_LIMIT_OVERRIDE_{PROVIDER}_BASE_SECONDS`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multiplier: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jitter_factor: Option<f64>,
}

/// Backfill settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct SyncConfig {
    /// Window used on a connection's first-ever sync
    #[serde(default = "default_sync_lookback_days")]
    pub lookback_days: u32,
    /// Wall-clock budget for one entity type within a run
    #[serde(default = "default_sync_entity_timeout_seconds")]
    pub entity_timeout_seconds: u64,
    /// Transient test failures in a row before a connection flips to `error`
    #[serde(default = "default_sync_test_failure_threshold")]
    pub test_failure_threshold: u32,
    #[serde(default = "default_sync_page_size")]
    pub page_size: u32,
}

/// Scheduler-specific configuration parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct SchedulerConfig {
    #[serde(default = "default_sync_scheduler_enabled")]
    pub enabled: bool,
    #[serde(default = "default_sync_scheduler_tick_interval_seconds")]
    pub tick_interval_seconds: u64,
    #[serde(default = "default_sync_scheduler_default_interval_seconds")]
    pub default_interval_seconds: u64,
    #[serde(default = "default_sync_scheduler_jitter_pct_max")]
    pub jitter_pct_max: f64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            profile: default_profile(),
            api_bind_addr: default_api_bind_addr(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            database_url: default_database_url(),
            db_max_connections: default_db_max_connections(),
            db_acquire_timeout_ms: default_db_acquire_timeout_ms(),
            crypto_key: None,
            webhooks: WebhookConfig::default(),
            providers: ProviderEndpoints::default(),
            queue: RequestQueueConfig::default(),
            rate_limit_policy: RateLimitPolicyConfig::default(),
            sync: SyncConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            shopify_secret: None,
            stripe_secret: None,
            replay_tolerance_seconds: default_webhook_replay_tolerance_seconds(),
            rate_limit_per_minute: default_webhook_rate_limit_per_minute(),
            max_body_kb: default_webhook_max_body_kb(),
        }
    }
}

impl Default for ProviderEndpoints {
    fn default() -> Self {
        Self {
            shopify_api_base: None,
            shopify_api_version: default_shopify_api_version(),
            stripe_api_base: default_stripe_api_base(),
        }
    }
}

impl Default for RequestQueueConfig {
    fn default() -> Self {
        Self {
            requests_per_second: default_queue_requests_per_second(),
            window_ms: default_queue_window_ms(),
            request_timeout_ms: default_queue_request_timeout_ms(),
            capacity: default_queue_capacity(),
            provider_overrides: BTreeMap::new(),
        }
    }
}

impl Default for RateLimitPolicyConfig {
    fn default() -> Self {
        Self {
            base_seconds: default_rate_limit_base_seconds(),
            multiplier: default_rate_limit_multiplier(),
            max_seconds: default_rate_limit_max_seconds(),
            max_attempts: default_rate_limit_max_attempts(),
            jitter_factor: default_rate_limit_jitter_factor(),
            provider_overrides: BTreeMap::new(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            lookback_days: default_sync_lookback_days(),
            entity_timeout_seconds: default_sync_entity_timeout_seconds(),
            test_failure_threshold: default_sync_test_failure_threshold(),
            page_size: default_sync_page_size(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: default_sync_scheduler_enabled(),
            tick_interval_seconds: default_sync_scheduler_tick_interval_seconds(),
            default_interval_seconds: default_sync_scheduler_default_interval_seconds(),
            jitter_pct_max: default_sync_scheduler_jitter_pct_max(),
        }
    }
}

impl WebhookConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.replay_tolerance_seconds == 0
            || self.replay_tolerance_seconds > MAX_REPLAY_TOLERANCE_SECONDS
        {
            return Err(ConfigError::InvalidReplayTolerance {
                value: self.replay_tolerance_seconds,
            });
        }
        if self.rate_limit_per_minute == 0 {
            return Err(ConfigError::InvalidWebhookRateLimit);
        }
        if self.max_body_kb == 0 {
            return Err(ConfigError::InvalidWebhookMaxBody);
        }
        Ok(())
    }

    pub fn max_body_bytes(&self) -> usize {
        self.max_body_kb.saturating_mul(1024)
    }
}

impl RequestQueueConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.requests_per_second == 0 {
            return Err(ConfigError::InvalidQueueRate {
                provider: None,
                value: 0,
            });
        }
        for (provider, value) in &self.provider_overrides {
            if *value == 0 {
                return Err(ConfigError::InvalidQueueRate {
                    provider: Some(provider.clone()),
                    value: *value,
                });
            }
        }
        if self.window_ms == 0 {
            return Err(ConfigError::InvalidQueueWindow);
        }
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::InvalidQueueTimeout);
        }
        if self.capacity == 0 {
            return Err(ConfigError::InvalidQueueCapacity);
        }
        Ok(())
    }

    /// Admission ceiling for `provider`, honouring overrides.
    pub fn requests_per_second_for(&self, provider: &str) -> u32 {
        self.provider_overrides
            .get(provider)
            .copied()
            .unwrap_or(self.requests_per_second)
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl RateLimitPolicyConfig {
    /// Validate rate limit policy configuration bounds
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.check("default", &RateLimitProviderOverride::default())?;
        for (provider, override_config) in &self.provider_overrides {
            self.check(provider, override_config)?;
        }
        Ok(())
    }

    fn check(
        &self,
        provider: &str,
        override_config: &RateLimitProviderOverride,
    ) -> Result<(), ConfigError> {
        let base = override_config.base_seconds.unwrap_or(self.base_seconds);
        let max = override_config.max_seconds.unwrap_or(self.max_seconds);
        let multiplier = override_config.multiplier.unwrap_or(self.multiplier);
        let attempts = override_config.max_attempts.unwrap_or(self.max_attempts);
        let jitter = override_config.jitter_factor.unwrap_or(self.jitter_factor);

        if base > max {
            return Err(ConfigError::InvalidRateLimitBounds {
                provider: provider.to_string(),
                base,
                max,
            });
        }
        if multiplier.is_nan() || multiplier < 1.0 {
            return Err(ConfigError::InvalidRateLimitMultiplier {
                provider: provider.to_string(),
                value: multiplier,
            });
        }
        if attempts == 0 {
            return Err(ConfigError::InvalidRateLimitAttempts {
                provider: provider.to_string(),
            });
        }
        if !(0.0..=1.0).contains(&jitter) {
            return Err(ConfigError::InvalidRateLimitJitter {
                provider: provider.to_string(),
                value: jitter,
            });
        }
        Ok(())
    }

    /// Effective policy for `provider` with overrides applied.
    pub fn for_provider(&self, provider: &str) -> RetrySettings {
        let o = self
            .provider_overrides
            .get(provider)
            .cloned()
            .unwrap_or_default();
        RetrySettings {
            base_seconds: o.base_seconds.unwrap_or(self.base_seconds),
            multiplier: o.multiplier.unwrap_or(self.multiplier),
            max_seconds: o.max_seconds.unwrap_or(self.max_seconds),
            max_attempts: o.max_attempts.unwrap_or(self.max_attempts),
            jitter_factor: o.jitter_factor.unwrap_or(self.jitter_factor),
        }
    }
}

/// Retry settings for one provider after overrides are resolved.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetrySettings {
    pub base_seconds: u64,
    pub multiplier: f64,
    pub max_seconds: u64,
    pub max_attempts: u32,
    pub jitter_factor: f64,
}

impl SyncConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lookback_days == 0 {
            return Err(ConfigError::InvalidSyncLookback);
        }
        if self.entity_timeout_seconds == 0 {
            return Err(ConfigError::InvalidSyncEntityTimeout);
        }
        if self.test_failure_threshold == 0 {
            return Err(ConfigError::InvalidSyncFailureThreshold);
        }
        if self.page_size == 0 || self.page_size > MAX_PAGE_SIZE {
            return Err(ConfigError::InvalidSyncPageSize {
                value: self.page_size,
            });
        }
        Ok(())
    }
}

impl SchedulerConfig {
    /// Validate scheduler configuration bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_interval_seconds == 0 || self.tick_interval_seconds > 3600 {
            return Err(ConfigError::InvalidSchedulerTickInterval {
                value: self.tick_interval_seconds,
            });
        }
        if self.default_interval_seconds < 60 {
            return Err(ConfigError::InvalidSchedulerDefaultInterval {
                value: self.default_interval_seconds,
            });
        }
        if !(0.0..=1.0).contains(&self.jitter_pct_max) {
            return Err(ConfigError::InvalidSchedulerJitter {
                value: self.jitter_pct_max,
            });
        }
        Ok(())
    }
}

impl AppConfig {
    /// Returns the configured bind address as a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        self.api_bind_addr.parse()
    }

    /// Local and test profiles run without a crypto key or webhook secrets.
    pub fn is_development(&self) -> bool {
        matches!(self.profile.as_str(), "local" | "test")
    }

    /// Returns a redacted JSON representation (secrets are redacted).
    pub fn redacted_json(&self) -> serde_json::Result<String> {
        let mut config = self.clone();
        if config.crypto_key.is_some() {
            config.crypto_key = Some(REDACTED.as_bytes().to_vec());
        }
        if config.webhooks.shopify_secret.is_some() {
            config.webhooks.shopify_secret = Some(REDACTED.to_string());
        }
        if config.webhooks.stripe_secret.is_some() {
            config.webhooks.stripe_secret = Some(REDACTED.to_string());
        }
        if let Some((scheme, _)) = config.database_url.split_once("://") {
            config.database_url = format!("{scheme}://{REDACTED}");
        }
        serde_json::to_string_pretty(&config)
    }

    /// Validates the configuration, returning an error if required settings are missing.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.crypto_key {
            Some(ref key) if key.len() != 32 => {
                return Err(ConfigError::InvalidCryptoKeyLength { length: key.len() });
            }
            None if !self.is_development() => return Err(ConfigError::MissingCryptoKey),
            _ => {}
        }

        if self.db_max_connections == 0 {
            return Err(ConfigError::InvalidDbMaxConnections);
        }

        self.webhooks.validate()?;
        self.queue.validate()?;
        self.rate_limit_policy.validate()?;
        self.sync.validate()?;
        self.scheduler.validate()?;

        Ok(())
    }
}

fn default_profile() -> String {
    "local".to_string()
}

fn default_api_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_database_url() -> String {
    "sqlite://commerce-connectors.db?mode=rwc".to_string()
}

fn default_db_max_connections() -> u32 {
    10
}

fn default_db_acquire_timeout_ms() -> u64 {
    5000
}

fn default_webhook_replay_tolerance_seconds() -> u64 {
    MAX_REPLAY_TOLERANCE_SECONDS
}

fn default_webhook_rate_limit_per_minute() -> u32 {
    300
}

fn default_webhook_max_body_kb() -> usize {
    512
}

fn default_shopify_api_version() -> String {
    "2024-10".to_string()
}

fn default_stripe_api_base() -> String {
    "https://api.stripe.com".to_string()
}

fn default_queue_requests_per_second() -> u32 {
    40
}

fn default_queue_window_ms() -> u64 {
    1000
}

fn default_queue_request_timeout_ms() -> u64 {
    30_000
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_rate_limit_base_seconds() -> u64 {
    1
}

fn default_rate_limit_multiplier() -> f64 {
    2.0
}

fn default_rate_limit_max_seconds() -> u64 {
    60
}

fn default_rate_limit_max_attempts() -> u32 {
    5
}

fn default_rate_limit_jitter_factor() -> f64 {
    0.1 // 10% jitter
}

fn default_sync_lookback_days() -> u32 {
    30
}

fn default_sync_entity_timeout_seconds() -> u64 {
    900 // 15 minutes
}

fn default_sync_test_failure_threshold() -> u32 {
    3
}

fn default_sync_page_size() -> u32 {
    50
}

fn default_sync_scheduler_enabled() -> bool {
    true
}

fn default_sync_scheduler_tick_interval_seconds() -> u64 {
    60 // 1 minute
}

fn default_sync_scheduler_default_interval_seconds() -> u64 {
    3600 // 1 hour
}

fn default_sync_scheduler_jitter_pct_max() -> f64 {
    0.1
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load environment file {path}: {source}")]
    EnvFile {
        path: PathBuf,
        source: dotenvy::Error,
    },
    #[error("invalid api bind address '{value}': {source}")]
    InvalidBindAddr {
        value: String,
        source: std::net::AddrParseError,
    },
    #[error("invalid value '{value}' for CONNECTORS_{key}")]
    InvalidValue { key: String, value: String },
    #[error("crypto key is missing; set CONNECTORS_CRYPTO_KEY environment variable")]
    MissingCryptoKey,
    #[error("crypto key is invalid base64: {error}")]
    InvalidCryptoKeyBase64 { error: String },
    #[error("crypto key must decode to exactly 32 bytes, got {length} bytes")]
    InvalidCryptoKeyLength { length: usize },
    #[error("database max connections must be positive")]
    InvalidDbMaxConnections,
    #[error("webhook replay tolerance must be between 1 and 300 seconds, got {value}")]
    InvalidReplayTolerance { value: u64 },
    #[error("webhook rate limit per minute must be positive")]
    InvalidWebhookRateLimit,
    #[error("webhook max body size must be positive")]
    InvalidWebhookMaxBody,
    #[error("queue requests per second must be positive (provider: {provider:?}), got {value}")]
    InvalidQueueRate {
        provider: Option<String>,
        value: u32,
    },
    #[error("queue window must be positive")]
    InvalidQueueWindow,
    #[error("queue request timeout must be positive")]
    InvalidQueueTimeout,
    #[error("queue capacity must be positive")]
    InvalidQueueCapacity,
    #[error(
        "{provider} rate limit base seconds ({base}) cannot be greater than max seconds ({max})"
    )]
    InvalidRateLimitBounds {
        provider: String,
        base: u64,
        max: u64,
    },
    #[error("{provider} rate limit multiplier must be at least 1.0, got {value}")]
    InvalidRateLimitMultiplier { provider: String, value: f64 },
    #[error("{provider} rate limit max attempts must be positive")]
    InvalidRateLimitAttempts { provider: String },
    #[error("{provider} rate limit jitter factor must be between 0.0 and 1.0, got {value}")]
    InvalidRateLimitJitter { provider: String, value: f64 },
    #[error("sync lookback days must be positive")]
    InvalidSyncLookback,
    #[error("sync entity timeout must be positive")]
    InvalidSyncEntityTimeout,
    #[error("sync test failure threshold must be positive")]
    InvalidSyncFailureThreshold,
    #[error("sync page size must be between 1 and 250, got {value}")]
    InvalidSyncPageSize { value: u32 },
    #[error("sync scheduler tick interval must be between 1 and 3600 seconds, got {value}")]
    InvalidSchedulerTickInterval { value: u64 },
    #[error("sync scheduler default interval must be at least 60 seconds, got {value}")]
    InvalidSchedulerDefaultInterval { value: u64 },
    #[error("sync scheduler jitter percentage must be between 0.0 and 1.0, got {value}")]
    InvalidSchedulerJitter { value: f64 },
}

/// Loads configuration using layered `.env` files and `CONNECTORS_*` env vars.
pub struct ConfigLoader {
    base_dir: PathBuf,
}

impl ConfigLoader {
    /// Creates a new loader rooted at the current working directory.
    pub fn new() -> Self {
        Self {
            base_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    /// Creates a loader rooted at the provided directory (useful for tests).
    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let (mut layered, profile_hint) = self.collect_layered_env()?;

        // Overlay process environment last so it wins.
        for (key, value) in env::vars() {
            if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                layered.insert(stripped.to_string(), value);
            }
        }

        let mut vars = LayeredVars(layered);

        let profile = vars.string("PROFILE").unwrap_or(profile_hint);
        let api_bind_addr = vars.string("API_BIND_ADDR").unwrap_or_else(default_api_bind_addr);
        let log_level = vars.string("LOG_LEVEL").unwrap_or_else(default_log_level);
        let log_format = vars.string("LOG_FORMAT").unwrap_or_else(default_log_format);
        let database_url = vars.string("DATABASE_URL").unwrap_or_else(default_database_url);
        let db_max_connections = vars
            .parsed("DB_MAX_CONNECTIONS")?
            .unwrap_or_else(default_db_max_connections);
        let db_acquire_timeout_ms = vars
            .parsed("DB_ACQUIRE_TIMEOUT_MS")?
            .unwrap_or_else(default_db_acquire_timeout_ms);

        let crypto_key = match vars.string("CRYPTO_KEY") {
            Some(key_str) => {
                use base64::{Engine as _, engine::general_purpose};
                Some(general_purpose::STANDARD.decode(key_str.trim()).map_err(|e| {
                    ConfigError::InvalidCryptoKeyBase64 {
                        error: e.to_string(),
                    }
                })?)
            }
            None => None,
        };

        let webhooks = WebhookConfig {
            shopify_secret: vars.string("WEBHOOK_SHOPIFY_SECRET"),
            stripe_secret: vars.string("WEBHOOK_STRIPE_SECRET"),
            replay_tolerance_seconds: vars
                .parsed("WEBHOOK_REPLAY_TOLERANCE_SECONDS")?
                .unwrap_or_else(default_webhook_replay_tolerance_seconds),
            rate_limit_per_minute: vars
                .parsed("WEBHOOK_RATE_LIMIT_PER_MINUTE")?
                .unwrap_or_else(default_webhook_rate_limit_per_minute),
            max_body_kb: vars
                .parsed("WEBHOOK_MAX_BODY_KB")?
                .unwrap_or_else(default_webhook_max_body_kb),
        };

        let providers = ProviderEndpoints {
            shopify_api_base: vars.string("SHOPIFY_API_BASE"),
            shopify_api_version: vars
                .string("SHOPIFY_API_VERSION")
                .unwrap_or_else(default_shopify_api_version),
            stripe_api_base: vars
                .string("STRIPE_API_BASE")
                .unwrap_or_else(default_stripe_api_base),
        };

        let mut queue = RequestQueueConfig {
            requests_per_second: vars
                .parsed("QUEUE_REQUESTS_PER_SECOND")?
                .unwrap_or_else(default_queue_requests_per_second),
            window_ms: vars
                .parsed("QUEUE_WINDOW_MS")?
                .unwrap_or_else(default_queue_window_ms),
            request_timeout_ms: vars
                .parsed("QUEUE_REQUEST_TIMEOUT_MS")?
                .unwrap_or_else(default_queue_request_timeout_ms),
            capacity: vars
                .parsed("QUEUE_CAPACITY")?
                .unwrap_or_else(default_queue_capacity),
            provider_overrides: BTreeMap::new(),
        };

        let mut rate_limit_policy = RateLimitPolicyConfig {
            base_seconds: vars
                .parsed("RATE_LIMIT_BASE_SECONDS")?
                .unwrap_or_else(default_rate_limit_base_seconds),
            multiplier: vars
                .parsed("RATE_LIMIT_MULTIPLIER")?
                .unwrap_or_else(default_rate_limit_multiplier),
            max_seconds: vars
                .parsed("RATE_LIMIT_MAX_SECONDS")?
                .unwrap_or_else(default_rate_limit_max_seconds),
            max_attempts: vars
                .parsed("RATE_LIMIT_MAX_ATTEMPTS")?
                .unwrap_or_else(default_rate_limit_max_attempts),
            jitter_factor: vars
                .parsed("RATE_LIMIT_JITTER_FACTOR")?
                .unwrap_or_else(default_rate_limit_jitter_factor),
            provider_overrides: BTreeMap::new(),
        };

        let sync = SyncConfig {
            lookback_days: vars
                .parsed("SYNC_LOOKBACK_DAYS")?
                .unwrap_or_else(default_sync_lookback_days),
            entity_timeout_seconds: vars
                .parsed("SYNC_ENTITY_TIMEOUT_SECONDS")?
                .unwrap_or_else(default_sync_entity_timeout_seconds),
            test_failure_threshold: vars
                .parsed("SYNC_TEST_FAILURE_THRESHOLD")?
                .unwrap_or_else(default_sync_test_failure_threshold),
            page_size: vars
                .parsed("SYNC_PAGE_SIZE")?
                .unwrap_or_else(default_sync_page_size),
        };

        let scheduler = SchedulerConfig {
            enabled: vars
                .parsed("SYNC_SCHEDULER_ENABLED")?
                .unwrap_or_else(default_sync_scheduler_enabled),
            tick_interval_seconds: vars
                .parsed("SYNC_SCHEDULER_TICK_INTERVAL_SECONDS")?
                .unwrap_or_else(default_sync_scheduler_tick_interval_seconds),
            default_interval_seconds: vars
                .parsed("SYNC_SCHEDULER_DEFAULT_INTERVAL_SECONDS")?
                .unwrap_or_else(default_sync_scheduler_default_interval_seconds),
            jitter_pct_max: vars
                .parsed("SYNC_SCHEDULER_JITTER_PCT_MAX")?
                .unwrap_or_else(default_sync_scheduler_jitter_pct_max),
        };

        // Provider overrides: <GROUP>_OVERRIDE_<PROVIDER>_<SETTING>
        for (key, value) in vars.0.iter() {
            if let Some(suffix) = key.strip_prefix("QUEUE_OVERRIDE_") {
                if let Some(provider) = suffix.strip_suffix("_REQUESTS_PER_SECOND") {
                    let rate = parse_value(key, value)?;
                    queue
                        .provider_overrides
                        .insert(provider.to_lowercase(), rate);
                }
            } else if let Some(suffix) = key.strip_prefix("RATE_LIMIT_OVERRIDE_") {
                let Some((provider, setting)) = suffix.split_once('_') else {
                    continue;
                };
                let entry = rate_limit_policy
                    .provider_overrides
                    .entry(provider.to_lowercase())
                    .or_default();
                match setting {
                    "BASE_SECONDS" => entry.base_seconds = Some(parse_value(key, value)?),
                    "MULTIPLIER" => entry.multiplier = Some(parse_value(key, value)?),
                    "MAX_SECONDS" => entry.max_seconds = Some(parse_value(key, value)?),
                    "MAX_ATTEMPTS" => entry.max_attempts = Some(parse_value(key, value)?),
                    "JITTER_FACTOR" => entry.jitter_factor = Some(parse_value(key, value)?),
                    _ => {
                        // Unknown setting, ignore
                    }
                }
            }
        }

        let config = AppConfig {
            profile,
            api_bind_addr,
            log_level,
            log_format,
            database_url,
            db_max_connections,
            db_acquire_timeout_ms,
            crypto_key,
            webhooks,
            providers,
            queue,
            rate_limit_policy,
            sync,
            scheduler,
        };

        config.validate()?;

        match config.bind_addr() {
            Ok(_) => Ok(config),
            Err(source) => Err(ConfigError::InvalidBindAddr {
                value: config.api_bind_addr.clone(),
                source,
            }),
        }
    }

    fn collect_layered_env(&self) -> Result<(BTreeMap<String, String>, String), ConfigError> {
        let mut values = BTreeMap::new();

        self.merge_dotenv(self.base_dir.join(".env"), &mut values)?;
        self.merge_dotenv(self.base_dir.join(".env.local"), &mut values)?;

        let profile = env::var(format!("{ENV_PREFIX}PROFILE"))
            .ok()
            .or_else(|| values.get("PROFILE").cloned())
            .unwrap_or_else(default_profile);

        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}", &profile)),
            &mut values,
        )?;
        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}.local", &profile)),
            &mut values,
        )?;

        Ok((values, profile))
    }

    fn merge_dotenv(
        &self,
        path: PathBuf,
        values: &mut BTreeMap<String, String>,
    ) -> Result<(), ConfigError> {
        match dotenvy::from_path_iter(&path) {
            Ok(iter) => {
                for item in iter {
                    let (key, value) = item.map_err(|source| ConfigError::EnvFile {
                        path: path.clone(),
                        source,
                    })?;
                    if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                        values.insert(stripped.to_string(), value);
                    }
                }
                Ok(())
            }
            Err(dotenvy::Error::Io(ref io_err))
                if io_err.kind() == std::io::ErrorKind::NotFound =>
            {
                Ok(())
            }
            Err(err) => Err(ConfigError::EnvFile { path, source: err }),
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Prefix-stripped key/value pairs, consumed as settings are read.
struct LayeredVars(BTreeMap<String, String>);

impl LayeredVars {
    fn string(&mut self, key: &str) -> Option<String> {
        self.0
            .remove(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parsed<T: std::str::FromStr>(&mut self, key: &str) -> Result<Option<T>, ConfigError> {
        match self.string(key) {
            Some(value) => parse_value(key, &value).map(Some),
            None => Ok(None),
        }
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid_for_local_profile() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.queue.requests_per_second, 40);
        assert_eq!(config.rate_limit_policy.max_attempts, 5);
        assert_eq!(config.sync.lookback_days, 30);
    }

    #[test]
    fn production_requires_crypto_key() {
        let config = AppConfig {
            profile: "prod".to_string(),
            ..AppConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingCryptoKey)
        ));
    }

    #[test]
    fn replay_tolerance_cannot_be_widened() {
        let mut config = AppConfig::default();
        config.webhooks.replay_tolerance_seconds = 301;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidReplayTolerance { value: 301 })
        ));

        config.webhooks.replay_tolerance_seconds = 0;
        assert!(config.validate().is_err());

        config.webhooks.replay_tolerance_seconds = 120;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rate_limit_policy_validation() {
        let valid = RateLimitPolicyConfig::default();
        assert!(valid.validate().is_ok());

        let invalid_bounds = RateLimitPolicyConfig {
            base_seconds: 100,
            max_seconds: 50,
            ..RateLimitPolicyConfig::default()
        };
        assert!(invalid_bounds.validate().is_err());

        let invalid_jitter = RateLimitPolicyConfig {
            jitter_factor: 1.5,
            ..RateLimitPolicyConfig::default()
        };
        assert!(invalid_jitter.validate().is_err());

        let shrinking = RateLimitPolicyConfig {
            multiplier: 0.5,
            ..RateLimitPolicyConfig::default()
        };
        assert!(shrinking.validate().is_err());
    }

    #[test]
    fn test_provider_override_validation() {
        let mut policy = RateLimitPolicyConfig::default();
        policy.provider_overrides.insert(
            "shopify".to_string(),
            RateLimitProviderOverride {
                base_seconds: Some(100),
                max_seconds: Some(50),
                ..RateLimitProviderOverride::default()
            },
        );
        assert!(matches!(
            policy.validate(),
            Err(ConfigError::InvalidRateLimitBounds { ref provider, .. }) if provider == "shopify"
        ));
    }

    #[test]
    fn provider_policy_falls_back_to_defaults() {
        let mut policy = RateLimitPolicyConfig::default();
        policy.provider_overrides.insert(
            "stripe".to_string(),
            RateLimitProviderOverride {
                max_attempts: Some(3),
                ..RateLimitProviderOverride::default()
            },
        );

        let stripe = policy.for_provider("stripe");
        assert_eq!(stripe.max_attempts, 3);
        assert_eq!(stripe.base_seconds, 1);

        let shopify = policy.for_provider("shopify");
        assert_eq!(shopify.max_attempts, 5);
    }

    #[test]
    fn queue_override_applies_per_provider() {
        let mut queue = RequestQueueConfig::default();
        queue.provider_overrides.insert("shopify".to_string(), 2);
        assert_eq!(queue.requests_per_second_for("shopify"), 2);
        assert_eq!(queue.requests_per_second_for("stripe"), 40);
    }

    #[test]
    fn page_size_is_bounded() {
        let sync = SyncConfig {
            page_size: 251,
            ..SyncConfig::default()
        };
        assert!(sync.validate().is_err());
    }

    #[test]
    fn redacted_json_hides_secrets() {
        let mut config = AppConfig::default();
        config.webhooks.shopify_secret = Some("shpss_supersecret".to_string());
        config.webhooks.stripe_secret = Some("whsec_supersecret".to_string());
        config.database_url = "postgres://user:pw@db/connectors".to_string();

        let json = config.redacted_json().unwrap();
        assert!(!json.contains("supersecret"));
        assert!(!json.contains("pw@db"));
        assert!(json.contains(REDACTED));
    }
}
