//! Orchestrator configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MigrationError, Result};

/// Default number of steps of one plan running at the same time.
pub const DEFAULT_MAX_CONCURRENT_STEPS: usize = 3;

/// Default number of handler attempts per step.
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;

/// Default delay between attempts in seconds.
pub const DEFAULT_RETRY_DELAY_SECS: u64 = 30;

/// Default cap for exponential backoff in seconds.
pub const DEFAULT_MAX_RETRY_DELAY_SECS: u64 = 600;

/// Default capacity of the progress stream buffer.
pub const DEFAULT_EVENT_BUFFER: usize = 1024;

/// Orchestrator configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Maximum steps of one plan in flight at once.
    pub max_concurrent_steps: usize,

    /// Handler attempts per step, including the first one.
    pub retry_attempts: u32,

    /// Delay before the first retry.
    #[serde(with = "serde_duration_ms")]
    pub retry_delay: Duration,

    /// Multiplier applied to the delay after every retry. 1.0 keeps it fixed.
    pub backoff_multiplier: f64,

    /// Upper bound for the retry delay.
    #[serde(with = "serde_duration_ms")]
    pub max_retry_delay: Duration,

    /// Hard limit for one handler attempt. None disables the limit.
    #[serde(with = "serde_opt_duration_ms")]
    pub step_timeout: Option<Duration>,

    /// Events buffered per progress stream before the oldest are dropped.
    pub event_buffer: usize,
}

impl OrchestratorConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self {
            max_concurrent_steps: DEFAULT_MAX_CONCURRENT_STEPS,
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            retry_delay: Duration::from_secs(DEFAULT_RETRY_DELAY_SECS),
            backoff_multiplier: 1.0,
            max_retry_delay: Duration::from_secs(DEFAULT_MAX_RETRY_DELAY_SECS),
            step_timeout: None,
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }

    /// Set the concurrency limit.
    pub fn with_max_concurrent_steps(mut self, limit: usize) -> Self {
        self.max_concurrent_steps = limit.max(1);
        self
    }

    /// Set the number of attempts per step.
    pub fn with_retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_attempts = attempts.max(1);
        self
    }

    /// Set the delay between attempts.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Enable exponential backoff.
    pub fn with_backoff(mut self, multiplier: f64, max_delay: Duration) -> Self {
        self.backoff_multiplier = if multiplier.is_finite() {
            multiplier.max(1.0)
        } else {
            1.0
        };
        self.max_retry_delay = max_delay;
        self
    }

    /// Set a hard timeout for each handler attempt.
    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = Some(timeout);
        self
    }

    /// Disable the per-attempt timeout.
    pub fn without_step_timeout(mut self) -> Self {
        self.step_timeout = None;
        self
    }

    /// Set the progress stream buffer size.
    pub fn with_event_buffer(mut self, capacity: usize) -> Self {
        self.event_buffer = capacity.max(1);
        self
    }

    /// Check values that did not go through the builder methods.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_steps == 0 {
            return Err(MigrationError::Configuration(
                "max_concurrent_steps must be at least 1".to_string(),
            ));
        }
        if self.retry_attempts == 0 {
            return Err(MigrationError::Configuration(
                "retry_attempts must be at least 1".to_string(),
            ));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(MigrationError::Configuration(format!(
                "backoff_multiplier must be >= 1.0, got {}",
                self.backoff_multiplier
            )));
        }
        if self.event_buffer == 0 {
            return Err(MigrationError::Configuration(
                "event_buffer must be at least 1".to_string(),
            ));
        }
        if self.step_timeout == Some(Duration::ZERO) {
            return Err(MigrationError::Configuration(
                "step_timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Parse and validate a JSON configuration document.
    ///
    /// Missing fields take their default values.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| MigrationError::Configuration(format!("invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check if a per-attempt timeout is configured.
    pub fn has_step_timeout(&self) -> bool {
        self.step_timeout.is_some()
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Serialize a `Duration` as whole milliseconds.
pub mod serde_duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Serialize an `Option<Duration>` as whole milliseconds or null.
pub mod serde_opt_duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        duration: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match duration {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(deserializer).map(|ms| ms.map(Duration::from_millis))
    }
}
