//! Coordinator and backend API configuration

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A value is out of range
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue {
        /// Offending field
        field: &'static str,
        /// Why it was rejected
        reason: String,
    },
}

/// Call coordinator configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Bound on signaling channel warm-up
    pub warmup_timeout_ms: u64,
    /// Interval between remote-hangup status polls
    pub hangup_poll_interval_ms: u64,
    /// Maximum number of remote-hangup status polls per call
    pub hangup_poll_max_attempts: u32,
    /// How long a native answer waits for its session to be created
    pub session_wait_timeout_ms: u64,
    /// Initialize sessions without confirming signaling readiness
    pub lightweight_sessions: bool,
    /// Caller name when neither backend nor payload provide one
    pub default_caller_name: String,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            warmup_timeout_ms: 6_000,
            hangup_poll_interval_ms: 2_000,
            hangup_poll_max_attempts: 20,
            session_wait_timeout_ms: 10_000,
            lightweight_sessions: false,
            default_caller_name: "Porteiro".to_string(),
        }
    }
}

impl CoordinatorConfig {
    /// Signaling warm-up bound
    pub fn warmup_timeout(&self) -> Duration {
        Duration::from_millis(self.warmup_timeout_ms)
    }

    /// Remote-hangup poll interval
    pub fn hangup_poll_interval(&self) -> Duration {
        Duration::from_millis(self.hangup_poll_interval_ms)
    }

    /// Native answer wait bound
    pub fn session_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.session_wait_timeout_ms)
    }

    /// Copy with every zero timeout or interval replaced by its default
    #[must_use]
    pub fn sanitized(mut self) -> Self {
        let defaults = Self::default();
        let fields = [
            ("warmup_timeout_ms", &mut self.warmup_timeout_ms, defaults.warmup_timeout_ms),
            (
                "hangup_poll_interval_ms",
                &mut self.hangup_poll_interval_ms,
                defaults.hangup_poll_interval_ms,
            ),
            (
                "session_wait_timeout_ms",
                &mut self.session_wait_timeout_ms,
                defaults.session_wait_timeout_ms,
            ),
        ];
        for (field, value, default) in fields {
            if *value == 0 {
                tracing::warn!(field, default, "Zero duration in coordinator config, using default");
                *value = default;
            }
        }
        self
    }

    /// Reject values that would disable a bounded wait
    ///
    /// # Errors
    ///
    /// Returns error if any timeout or interval is zero
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            ("warmup_timeout_ms", self.warmup_timeout_ms),
            ("hangup_poll_interval_ms", self.hangup_poll_interval_ms),
            ("session_wait_timeout_ms", self.session_wait_timeout_ms),
        ];
        for (field, value) in checks {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    field,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }
        Ok(())
    }
}

/// Backend call API configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Base URL, without the `/api` suffix
    pub base_url: String,
    /// Per-request timeout
    pub request_timeout_ms: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3001".to_string(),
            request_timeout_ms: 10_000,
        }
    }
}

impl ApiConfig {
    /// Per-request timeout
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Complete configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntercomConfig {
    /// Coordinator settings
    pub coordinator: CoordinatorConfig,
    /// Backend API settings
    pub api: ApiConfig,
}

impl IntercomConfig {
    /// Defaults overlaid with `INTERCOM_*` environment variables
    ///
    /// # Errors
    ///
    /// Returns error if a variable is set but not a valid number, or the
    /// resulting configuration fails validation
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = Self::default();
        if let Ok(url) = std::env::var("INTERCOM_API_BASE_URL") {
            config.api.base_url = url;
        }
        if let Some(ms) = env_millis("INTERCOM_WARMUP_TIMEOUT_MS")? {
            config.coordinator.warmup_timeout_ms = ms;
        }
        if let Some(ms) = env_millis("INTERCOM_HANGUP_POLL_INTERVAL_MS")? {
            config.coordinator.hangup_poll_interval_ms = ms;
        }
        if let Some(ms) = env_millis("INTERCOM_SESSION_WAIT_TIMEOUT_MS")? {
            config.coordinator.session_wait_timeout_ms = ms;
        }
        config.coordinator.validate()?;
        Ok(config)
    }

    /// Parse a JSON document; missing fields take defaults
    ///
    /// # Errors
    ///
    /// Returns error on malformed JSON or invalid values
    pub fn from_json_str(json: &str) -> anyhow::Result<Self> {
        let config: Self = serde_json::from_str(json).context("Malformed configuration JSON")?;
        config.coordinator.validate()?;
        Ok(config)
    }

    /// Load a JSON configuration file
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Cannot read configuration file {}", path.display()))?;
        Self::from_json_str(&raw)
    }
}

fn env_millis(name: &str) -> anyhow::Result<Option<u64>> {
    match std::env::var(name) {
        Ok(raw) => {
            let ms = raw
                .trim()
                .parse::<u64>()
                .with_context(|| format!("{name} must be a number of milliseconds"))?;
            Ok(Some(ms))
        }
        Err(_) => Ok(None),
    }
}
