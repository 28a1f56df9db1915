//! Timing constants and TOML configuration for the progress client.
//!
//! Every timing decision the coordinator and poller make comes from a
//! [`ProgressConfig`]; nothing is derived at runtime. Durations are written
//! in milliseconds in TOML:
//!
//! ```toml
//! base_url = "http://localhost:8000/api/chat"
//!
//! [progress]
//! max_reconnect_attempts = 3
//! backoff_base_ms = 250
//! poll_interval_ms = 1500
//! ```

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Reconnect attempts allowed before switching to polling.
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 2;
/// Delay before the first reconnect; doubled per attempt.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(500);
/// Upper bound for the reconnect delay.
pub const DEFAULT_BACKOFF_CEILING: Duration = Duration::from_secs(4);
/// How long opening the progress stream may take before it counts as a failed attempt.
pub const DEFAULT_STREAM_OPEN_TIMEOUT: Duration = Duration::from_secs(10);
/// Delay before the first status poll.
pub const DEFAULT_FALLBACK_INITIAL_DELAY: Duration = Duration::from_secs(2);
/// Delay between status polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
/// Status polls allowed before giving up.
pub const DEFAULT_MAX_POLL_ATTEMPTS: u32 = 30;
/// How long a live stream may lag behind a returned answer.
pub const DEFAULT_ANSWER_GRACE: Duration = Duration::from_secs(2);
/// How long to wait for the answer once the stream reports completion.
pub const DEFAULT_ANSWER_TIMEOUT: Duration = Duration::from_secs(30);
/// Timeout for plain REST requests.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
/// Default chat API root.
pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8000/api/chat";

/// Timing policy for one ask.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressConfig {
    /// Reconnect attempts allowed before falling back.
    pub max_reconnect_attempts: u32,
    /// Base reconnect delay.
    #[serde(rename = "backoff_base_ms", with = "millis")]
    pub backoff_base: Duration,
    /// Reconnect delay ceiling.
    #[serde(rename = "backoff_ceiling_ms", with = "millis")]
    pub backoff_ceiling: Duration,
    /// Limit for one stream open, response headers included.
    #[serde(rename = "stream_open_timeout_ms", with = "millis")]
    pub stream_open_timeout: Duration,
    /// Delay before the first poll.
    #[serde(rename = "fallback_initial_delay_ms", with = "millis")]
    pub fallback_initial_delay: Duration,
    /// Delay between polls.
    #[serde(rename = "poll_interval_ms", with = "millis")]
    pub poll_interval: Duration,
    /// Poll attempt cap.
    pub max_poll_attempts: u32,
    /// Stream lag allowed after the answer arrived.
    #[serde(rename = "answer_grace_ms", with = "millis")]
    pub answer_grace: Duration,
    /// Wait for the answer after stream completion.
    #[serde(rename = "answer_timeout_ms", with = "millis")]
    pub answer_timeout: Duration,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            backoff_base: DEFAULT_BACKOFF_BASE,
            backoff_ceiling: DEFAULT_BACKOFF_CEILING,
            stream_open_timeout: DEFAULT_STREAM_OPEN_TIMEOUT,
            fallback_initial_delay: DEFAULT_FALLBACK_INITIAL_DELAY,
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_poll_attempts: DEFAULT_MAX_POLL_ATTEMPTS,
            answer_grace: DEFAULT_ANSWER_GRACE,
            answer_timeout: DEFAULT_ANSWER_TIMEOUT,
        }
    }
}

impl ProgressConfig {
    /// Delay before reconnect attempt `attempt` (1-based).
    ///
    /// `base * 2^(attempt - 1)`, capped at the ceiling.
    #[must_use]
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.backoff_base
            .checked_mul(1_u32 << exponent)
            .map_or(self.backoff_ceiling, |delay| delay.min(self.backoff_ceiling))
    }
}

/// Client configuration: where the backend lives plus the timing policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Chat API root, e.g. `http://localhost:8000/api/chat`.
    pub base_url: String,
    /// Timeout for REST requests.
    #[serde(rename = "request_timeout_ms", with = "millis")]
    pub request_timeout: Duration,
    /// Timing policy.
    pub progress: ProgressConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            progress: ProgressConfig::default(),
        }
    }
}

/// Configuration loader for client settings.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Loads client configuration from a TOML file.
    ///
    /// # Arguments
    /// * `path` - Path to the configuration file
    ///
    /// # Errors
    /// Returns error if file cannot be read, parsed or validated.
    pub fn load(path: &Path) -> Result<ClientConfig, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Parses and validates client configuration from TOML text.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<ClientConfig, ConfigError> {
        let config: ClientConfig = toml::from_str(content)?;
        Self::validate(&config)?;
        Ok(config)
    }

    /// Validates client configuration.
    ///
    /// # Errors
    /// Returns error if configuration is invalid.
    pub fn validate(config: &ClientConfig) -> Result<(), ConfigError> {
        let base_url = config.base_url.trim();
        if base_url.is_empty() {
            return Err(ConfigError::Validation("base_url must not be empty".to_string()));
        }
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(ConfigError::Validation(format!(
                "Invalid base_url: '{}'. Expected an http:// or https:// URL",
                base_url
            )));
        }

        let progress = &config.progress;
        if progress.poll_interval.is_zero() {
            return Err(ConfigError::Validation(
                "poll_interval_ms must be greater than 0".to_string(),
            ));
        }
        if progress.stream_open_timeout.is_zero() {
            return Err(ConfigError::Validation(
                "stream_open_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if progress.max_poll_attempts == 0 {
            return Err(ConfigError::Validation(
                "max_poll_attempts must be greater than 0".to_string(),
            ));
        }
        if progress.backoff_base > progress.backoff_ceiling {
            return Err(ConfigError::Validation(format!(
                "backoff_base_ms ({}) must be <= backoff_ceiling_ms ({})",
                progress.backoff_base.as_millis(),
                progress.backoff_ceiling.as_millis()
            )));
        }

        Ok(())
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
