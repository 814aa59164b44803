//! Audit delivery configuration
//!
//! Every knob is supplied at construction. Defaults are the published ones;
//! there is no environment or dynamic discovery. Files are JSON with
//! camelCase keys and millisecond integers for durations.

use crate::breaker::BreakerConfig;
use crate::error::{AuditError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Configuration for an [`AuditLogger`](crate::AuditLogger)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct AuditConfig {
    /// Consecutive store failures before the breaker opens (>= 1)
    pub max_retries: u32,

    /// Base of the exponential backoff schedule
    pub initial_delay_ms: u64,

    /// Cap on the exponential part of the backoff
    pub max_delay_ms: u64,

    /// Upper bound of the random delay added to each backoff
    pub jitter_ms: u64,

    /// Period of the background retry drain
    pub drain_interval_ms: u64,

    /// Maximum retry queue length; the oldest entry is evicted beyond it
    pub max_queue_size: usize,

    /// Failed drain attempts after which an entry is permanently dropped
    pub max_attempts: u32,

    /// Deadline for a single store call
    pub call_timeout_ms: u64,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 250,
            max_delay_ms: 1_000,
            jitter_ms: 50,
            drain_interval_ms: 30_000,
            max_queue_size: 10_000,
            max_attempts: 5,
            call_timeout_ms: 5_000,
        }
    }
}

impl AuditConfig {
    /// Parse a configuration from JSON
    ///
    /// Missing keys take their defaults; unknown keys are rejected so a
    /// misspelling cannot silently fall back to a default.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: AuditConfig = serde_json::from_str(json).map_err(|e| {
            AuditError::Config(format!("Failed to parse audit config: {}", e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            AuditError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        let config = Self::from_json(&json)?;
        tracing::debug!(path = %path.display(), "Audit config loaded");
        Ok(config)
    }

    /// Reject configurations the delivery core cannot honour
    pub fn validate(&self) -> Result<()> {
        if self.max_retries == 0 {
            return Err(AuditError::Config("maxRetries must be at least 1".into()));
        }
        if self.max_attempts == 0 {
            return Err(AuditError::Config("maxAttempts must be at least 1".into()));
        }
        if self.max_queue_size == 0 {
            return Err(AuditError::Config("maxQueueSize must be at least 1".into()));
        }
        if self.drain_interval_ms == 0 {
            return Err(AuditError::Config("drainIntervalMs must be positive".into()));
        }
        if self.call_timeout_ms == 0 {
            return Err(AuditError::Config("callTimeoutMs must be positive".into()));
        }
        if self.max_delay_ms < self.initial_delay_ms {
            return Err(AuditError::Config(format!(
                "maxDelayMs ({}) must not be below initialDelayMs ({})",
                self.max_delay_ms, self.initial_delay_ms
            )));
        }
        Ok(())
    }

    pub fn drain_interval(&self) -> Duration {
        Duration::from_millis(self.drain_interval_ms)
    }

    /// Breaker settings derived from this configuration
    pub fn breaker(&self) -> BreakerConfig {
        BreakerConfig {
            max_retries: self.max_retries,
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            jitter: Duration::from_millis(self.jitter_ms),
            call_timeout: Duration::from_millis(self.call_timeout_ms),
        }
    }
}
