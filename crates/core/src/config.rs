//! Configuration via TOML
//!
//! Two documents are involved:
//!
//! - [`SeepConfig`]: per-process settings (lock liveness, oracle retries,
//!   worker pool sizing). Every field has a default, so an empty file is a
//!   valid configuration.
//! - [`SharedConfig`]: the versioned, application-wide property bag that
//!   carries observer registrations. It is published by an admin component
//!   and only re-read when a worker is told it changed.

use crate::encoding::NotificationType;
use crate::error::{SeepError, SeepResult};
use crate::types::Column;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Bounded exponential backoff for transient failures
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts before giving up (at least 1)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay after the first failure
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Upper bound on any single delay
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    10
}

fn default_max_delay_ms() -> u64 {
    1_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-indexed), doubling each time
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(32)).unwrap_or(u64::MAX);
        let ms = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(ms)
    }
}

/// Transaction settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionConfig {
    /// Age after which another party may roll back a lock
    #[serde(default = "default_rollback_time_ms")]
    pub rollback_time_ms: u64,
    /// Backoff while waiting on a live lock during reads
    #[serde(default = "default_lock_wait")]
    pub lock_wait: RetryPolicy,
}

fn default_rollback_time_ms() -> u64 {
    300_000
}

fn default_lock_wait() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 20,
        base_delay_ms: 1,
        max_delay_ms: 250,
    }
}

impl Default for TransactionConfig {
    fn default() -> Self {
        TransactionConfig {
            rollback_time_ms: default_rollback_time_ms(),
            lock_wait: default_lock_wait(),
        }
    }
}

impl TransactionConfig {
    /// Lock liveness threshold
    pub fn rollback_time(&self) -> Duration {
        Duration::from_millis(self.rollback_time_ms)
    }
}

/// Worker pool settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Notification transactions in flight at once
    #[serde(default = "default_threads")]
    pub threads: usize,
    /// Queued notifications before the scanner backs off
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
    /// Pause between scans when idle
    #[serde(default = "default_scan_interval_ms")]
    pub scan_interval_ms: u64,
    /// Commit conflicts tolerated per notification in one pass
    #[serde(default = "default_max_commit_retries")]
    pub max_commit_retries: u32,
}

fn default_threads() -> usize {
    4
}

fn default_queue_depth() -> usize {
    1_024
}

fn default_scan_interval_ms() -> u64 {
    100
}

fn default_max_commit_retries() -> u32 {
    32
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            threads: default_threads(),
            queue_depth: default_queue_depth(),
            scan_interval_ms: default_scan_interval_ms(),
            max_commit_retries: default_max_commit_retries(),
        }
    }
}

/// Per-process configuration
///
/// # Example
///
/// ```toml
/// [transaction]
/// rollback_time_ms = 300000
///
/// [oracle]
/// max_attempts = 5
///
/// [worker]
/// threads = 4
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeepConfig {
    /// Transaction settings
    #[serde(default)]
    pub transaction: TransactionConfig,
    /// Oracle retry policy
    #[serde(default)]
    pub oracle: RetryPolicy,
    /// Worker pool settings
    #[serde(default)]
    pub worker: WorkerConfig,
}

impl SeepConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(content: &str) -> SeepResult<Self> {
        let config: SeepConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse config from a file path
    pub fn from_file(path: &Path) -> SeepResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content).map_err(|e| {
            SeepError::configuration(format!("{}: {}", path.display(), e))
        })
    }

    /// Reject values that can never work
    pub fn validate(&self) -> SeepResult<()> {
        if self.worker.threads == 0 {
            return Err(SeepError::configuration("worker.threads must be at least 1"));
        }
        if self.worker.queue_depth == 0 {
            return Err(SeepError::configuration(
                "worker.queue_depth must be at least 1",
            ));
        }
        if self.oracle.max_attempts == 0 {
            return Err(SeepError::configuration(
                "oracle.max_attempts must be at least 1",
            ));
        }
        Ok(())
    }

    /// Returns the default config file content with comments
    pub fn default_toml() -> &'static str {
        r#"# Seep configuration

[transaction]
# Locks older than this may be rolled back by other transactions
rollback_time_ms = 300000

[oracle]
max_attempts = 5
base_delay_ms = 10
max_delay_ms = 1000

[worker]
# Notification transactions in flight at once
threads = 4
queue_depth = 1024
scan_interval_ms = 100
max_commit_retries = 32
"#
    }
}

/// One observer registration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObserverSpecification {
    /// Identifier the observer factory was registered under
    pub id: String,
    /// Column family that triggers the observer
    pub family: String,
    /// Column qualifier that triggers the observer
    pub qualifier: String,
    /// Weak or strong
    pub notification: NotificationType,
    /// Free-form parameters handed to the factory
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

impl ObserverSpecification {
    /// Build a registration
    pub fn new(id: impl Into<String>, column: &Column, notification: NotificationType) -> Self {
        ObserverSpecification {
            id: id.into(),
            family: column.family.to_string(),
            qualifier: column.qualifier.to_string(),
            notification,
            params: BTreeMap::new(),
        }
    }

    /// Add a parameter
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Observed column
    pub fn column(&self) -> Column {
        Column::new(self.family.as_str(), self.qualifier.as_str())
    }
}

/// Versioned application-wide configuration
///
/// ```toml
/// version = 3
///
/// [app]
/// threshold = "10"
///
/// [[observers]]
/// id = "stat-summer"
/// family = "stat"
/// qualifier = "check"
/// notification = "weak"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedConfig {
    /// Bumped on every published change
    #[serde(default)]
    pub version: u64,
    /// Application properties visible to every observer
    #[serde(default)]
    pub app: BTreeMap<String, String>,
    /// Observer registrations
    #[serde(default)]
    pub observers: Vec<ObserverSpecification>,
}

impl SharedConfig {
    /// Parse a TOML document
    pub fn from_toml_str(content: &str) -> SeepResult<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Serialize to TOML
    pub fn to_toml_string(&self) -> SeepResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| SeepError::Serialization(format!("shared config: {}", e)))
    }
}
