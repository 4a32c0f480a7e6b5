//! Configuration management for Plurwatch

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::classifier::ErrorKind;
use crate::error::{ConfigError, Result};
use crate::journal::DEFAULT_JOURNAL_CAPACITY;
use crate::policy::BackoffStrategy;
use crate::rate_limiter::RateLimitConfig;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub polling: PollingConfig,
    pub rate_limit: RateLimitSection,
    pub circuit_breaker: CircuitBreakerSection,
    pub journal: JournalConfig,
    /// Per-kind overrides on top of the default retry policy table
    pub retry: HashMap<ErrorKind, RetryPolicyConfig>,
    pub platforms: HashMap<String, PlatformConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "~/.local/share/plurwatch/plurwatch.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    /// Seconds between sweeps in daemon mode
    pub interval_secs: u64,
    /// A connection checked more recently than this is skipped unless forced
    pub min_interval_secs: u64,
    /// Connections polled at the same time
    pub max_concurrency: usize,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            min_interval_secs: 240,
            max_concurrency: 4,
        }
    }
}

impl PollingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn min_interval(&self) -> Duration {
        Duration::from_secs(self.min_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSection {
    pub window_seconds: u64,
    pub max_requests: u32,
    pub burst_allowance: u32,
    pub key_ttl_slack_secs: u64,
}

impl Default for RateLimitSection {
    fn default() -> Self {
        let defaults = RateLimitConfig::default();
        Self {
            window_seconds: defaults.window.as_secs(),
            max_requests: defaults.max_requests,
            burst_allowance: defaults.burst_allowance,
            key_ttl_slack_secs: defaults.key_ttl_slack.as_secs(),
        }
    }
}

impl RateLimitSection {
    pub fn to_limiter_config(&self) -> RateLimitConfig {
        RateLimitConfig {
            window: Duration::from_secs(self.window_seconds),
            max_requests: self.max_requests,
            burst_allowance: self.burst_allowance,
            key_ttl_slack: Duration::from_secs(self.key_ttl_slack_secs),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSection {
    pub failure_threshold: u32,
    pub recovery_timeout_secs: u64,
    pub success_threshold: u32,
}

impl Default for CircuitBreakerSection {
    fn default() -> Self {
        let defaults = CircuitBreakerConfig::default();
        Self {
            failure_threshold: defaults.failure_threshold,
            recovery_timeout_secs: defaults.recovery_timeout.as_secs(),
            success_threshold: defaults.success_threshold,
        }
    }
}

impl CircuitBreakerSection {
    pub fn to_breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            recovery_timeout: Duration::from_secs(self.recovery_timeout_secs),
            success_threshold: self.success_threshold,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JournalConfig {
    pub capacity: usize,
    /// Window covered by the error summary in health reports
    pub summary_window_secs: u64,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_JOURNAL_CAPACITY,
            summary_window_secs: 3600,
        }
    }
}

/// Partial retry policy; unset fields keep the built-in value for the kind
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetryPolicyConfig {
    pub max_retries: Option<u32>,
    pub base_delay_secs: Option<f64>,
    pub max_delay_secs: Option<f64>,
    pub backoff: Option<BackoffStrategy>,
    pub jitter: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlatformConfig {
    /// External fetcher, e.g. `mastodon-mentions --account {account} --since {since_id}`
    pub fetch_command: Option<String>,
}

impl Config {
    /// Load configuration from the default location
    pub fn load() -> Result<Self> {
        let config_path = resolve_config_path()?;
        Self::load_from_path(&config_path)
    }

    /// Load configuration from the default location, falling back to
    /// defaults when no file exists there
    pub fn load_or_default() -> Result<Self> {
        let config_path = resolve_config_path()?;
        if !config_path.exists() {
            tracing::debug!(path = %config_path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }
        Self::load_from_path(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).map_err(ConfigError::ParseError)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the components cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.database.path.trim().is_empty() {
            return Err(ConfigError::MissingField("database.path".to_string()).into());
        }
        if self.rate_limit.window_seconds == 0 {
            return Err(invalid("rate_limit.window_seconds", "must be greater than zero"));
        }
        if self.rate_limit.max_requests == 0 {
            return Err(invalid("rate_limit.max_requests", "must be greater than zero"));
        }
        if self.rate_limit.burst_allowance == 0 {
            return Err(invalid(
                "rate_limit.burst_allowance",
                "must be at least 1 to count the request being admitted",
            ));
        }
        if self.rate_limit.burst_allowance > self.rate_limit.max_requests {
            return Err(invalid(
                "rate_limit.burst_allowance",
                "cannot exceed rate_limit.max_requests",
            ));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(invalid(
                "circuit_breaker.failure_threshold",
                "must be greater than zero",
            ));
        }
        if self.circuit_breaker.success_threshold == 0 {
            return Err(invalid(
                "circuit_breaker.success_threshold",
                "must be greater than zero",
            ));
        }
        if self.polling.max_concurrency == 0 {
            return Err(invalid("polling.max_concurrency", "must be greater than zero"));
        }
        for (kind, retry) in &self.retry {
            let negative = [retry.base_delay_secs, retry.max_delay_secs]
                .into_iter()
                .flatten()
                .any(|secs| secs < 0.0 || Duration::try_from_secs_f64(secs).is_err());
            if negative {
                return Err(invalid(
                    &format!("retry.{}", kind),
                    "delays must be non-negative and representable numbers of seconds",
                ));
            }
        }
        Ok(())
    }

    /// Database path with `~` expanded
    pub fn database_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.database.path).to_string())
    }
}

fn invalid(field: &str, reason: &str) -> crate::error::PlurwatchError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        reason: reason.to_string(),
    }
    .into()
}

/// Resolve the configuration file path following XDG Base Directory spec
pub fn resolve_config_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("PLURWATCH_CONFIG") {
        return Ok(PathBuf::from(shellexpand::tilde(&path).to_string()));
    }

    let config_dir = dirs::config_dir()
        .ok_or_else(|| ConfigError::MissingField("config directory".to_string()))?;

    Ok(config_dir.join("plurwatch").join("config.toml"))
}
