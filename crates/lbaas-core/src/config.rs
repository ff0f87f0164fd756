//! Configuration types for the convergence layer
//!
//! Every field has a serde default, so an empty document deserializes to the
//! stock behaviour: 1s doubling conflict backoff over 10 attempts, 2s polls,
//! and per-operation deadlines.

use crate::context::OperationContext;
use crate::retry::{DEFAULT_CONFLICT_KEYWORDS, DEFAULT_MAX_ATTEMPTS};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Longest accepted per-operation deadline (one day)
pub const MAX_OPERATION_TIMEOUT_SECS: u64 = 86_400;

/// Main convergence configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvergenceConfig {
    /// Conflict retry settings
    #[serde(default)]
    pub retry: RetryConfig,

    /// Polling settings
    #[serde(default)]
    pub poll: PollConfig,

    /// Per-operation deadlines
    #[serde(default)]
    pub timeouts: TimeoutConfig,

    /// Capacity of the engine event channel
    ///
    /// When full, events are dropped with a warning log.
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,
}

impl ConvergenceConfig {
    /// Create a new configuration with defaults
    pub fn new() -> Self {
        Self {
            retry: RetryConfig::default(),
            poll: PollConfig::default(),
            timeouts: TimeoutConfig::default(),
            event_channel_capacity: default_event_channel_capacity(),
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        self.retry.validate()?;
        self.poll.validate()?;
        self.timeouts.validate()?;

        if self.event_channel_capacity == 0 {
            return Err(crate::Error::config("Event channel capacity must be > 0"));
        }

        Ok(())
    }
}

impl Default for ConvergenceConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Conflict retry configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Wait before the first retry (in milliseconds)
    #[serde(default = "default_base_interval_ms")]
    pub base_interval_ms: u64,

    /// Growth factor applied to the wait after each retry
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Maximum invocations; `null` relies on the operation deadline alone
    #[serde(default = "default_max_attempts")]
    pub max_attempts: Option<u32>,

    /// Phrases in a 409 body that make the conflict retryable
    #[serde(default = "default_conflict_keywords")]
    pub conflict_keywords: Vec<String>,
}

impl RetryConfig {
    /// Initial backoff interval
    pub fn base_interval(&self) -> Duration {
        Duration::from_millis(self.base_interval_ms)
    }

    /// Validate the retry configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.base_interval_ms == 0 {
            return Err(crate::Error::config("Retry base interval must be > 0"));
        }
        if self.multiplier.is_nan() || self.multiplier < 1.0 {
            return Err(crate::Error::config("Retry multiplier must be >= 1.0"));
        }
        if self.max_attempts == Some(0) {
            return Err(crate::Error::config("Retry max attempts must be > 0"));
        }
        if self.conflict_keywords.is_empty() {
            return Err(crate::Error::config("Conflict keyword list cannot be empty"));
        }
        // A blank keyword matches every 409 body
        if self.conflict_keywords.iter().any(|k| k.trim().is_empty()) {
            return Err(crate::Error::config("Conflict keywords cannot be blank"));
        }
        Ok(())
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_interval_ms: default_base_interval_ms(),
            multiplier: default_multiplier(),
            max_attempts: default_max_attempts(),
            conflict_keywords: default_conflict_keywords(),
        }
    }
}

/// Polling configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollConfig {
    /// Interval between status fetches (in milliseconds)
    #[serde(default = "default_poll_interval_ms")]
    pub interval_ms: u64,

    /// Interval between fetches while waiting for deletion (in milliseconds)
    #[serde(default = "default_poll_interval_ms")]
    pub delete_interval_ms: u64,
}

impl PollConfig {
    /// Interval between status fetches
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Interval between fetches while waiting for deletion
    pub fn delete_interval(&self) -> Duration {
        Duration::from_millis(self.delete_interval_ms)
    }

    /// Validate the polling configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.interval_ms == 0 || self.delete_interval_ms == 0 {
            return Err(crate::Error::config("Poll interval must be > 0"));
        }
        Ok(())
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_poll_interval_ms(),
            delete_interval_ms: default_poll_interval_ms(),
        }
    }
}

/// Kind of logical controller operation, each with its own deadline budget
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    /// Create a resource and converge it
    Create,
    /// Read a resource
    Read,
    /// Update a resource and converge it
    Update,
    /// Delete a resource and wait for it to disappear
    Delete,
}

/// Per-operation deadlines (in seconds)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Create deadline
    #[serde(default = "default_create_timeout_secs")]
    pub create_secs: u64,

    /// Read deadline
    #[serde(default = "default_read_timeout_secs")]
    pub read_secs: u64,

    /// Update deadline
    #[serde(default = "default_update_timeout_secs")]
    pub update_secs: u64,

    /// Delete deadline
    #[serde(default = "default_delete_timeout_secs")]
    pub delete_secs: u64,
}

impl TimeoutConfig {
    /// Deadline budget for one operation kind
    pub fn timeout_for(&self, kind: OperationKind) -> Duration {
        let secs = match kind {
            OperationKind::Create => self.create_secs,
            OperationKind::Read => self.read_secs,
            OperationKind::Update => self.update_secs,
            OperationKind::Delete => self.delete_secs,
        };
        Duration::from_secs(secs)
    }

    /// A fresh context whose deadline starts now
    ///
    /// Deadlines are never shared across operations: call this once per
    /// logical operation.
    pub fn context_for(&self, kind: OperationKind) -> OperationContext {
        OperationContext::with_timeout(self.timeout_for(kind))
    }

    /// Validate the timeout configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        let timeouts = [self.create_secs, self.read_secs, self.update_secs, self.delete_secs];
        if timeouts.contains(&0) {
            return Err(crate::Error::config("Operation timeouts must be > 0"));
        }
        if timeouts.iter().any(|&secs| secs > MAX_OPERATION_TIMEOUT_SECS) {
            return Err(crate::Error::config(format!(
                "Operation timeouts must be <= {MAX_OPERATION_TIMEOUT_SECS} seconds"
            )));
        }
        Ok(())
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            create_secs: default_create_timeout_secs(),
            read_secs: default_read_timeout_secs(),
            update_secs: default_update_timeout_secs(),
            delete_secs: default_delete_timeout_secs(),
        }
    }
}

fn default_base_interval_ms() -> u64 {
    1000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_attempts() -> Option<u32> {
    Some(DEFAULT_MAX_ATTEMPTS)
}

fn default_conflict_keywords() -> Vec<String> {
    DEFAULT_CONFLICT_KEYWORDS.iter().map(|k| k.to_string()).collect()
}

fn default_poll_interval_ms() -> u64 {
    2000
}

fn default_create_timeout_secs() -> u64 {
    600
}

fn default_read_timeout_secs() -> u64 {
    300
}

fn default_update_timeout_secs() -> u64 {
    600
}

fn default_delete_timeout_secs() -> u64 {
    600
}

fn default_event_channel_capacity() -> usize {
    100
}
