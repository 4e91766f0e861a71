//! Engine timing and limit configuration.
//!
//! All windows are in milliseconds. Defaults follow the observed behavior of
//! the shared store (change notifications land between 100ms and 3000ms after
//! a write), so the self-write and acceptance windows default well above the
//! worst case.

use crate::error::SyncError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Synchronization engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Coalescing window for rapid successive persistence writes
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// How long a change notification is still expected after a commit.
    /// Must be strictly greater than `debounce_ms`.
    #[serde(default = "default_accept_window_ms")]
    pub accept_window_ms: u64,

    /// Lifetime of committed write-ids used for self-write detection
    #[serde(default = "default_self_write_ttl_ms")]
    pub self_write_ttl_ms: u64,

    /// Grace period after a restore during which the snapshot is retained
    /// and duplicate restore requests are acknowledged as already satisfied
    #[serde(default = "default_grace_window_ms")]
    pub grace_window_ms: u64,

    /// Interval between liveness probes to the coordinator
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Consecutive missed heartbeats before a reconnect is attempted
    #[serde(default = "default_heartbeat_miss_threshold")]
    pub heartbeat_miss_threshold: u32,

    /// Timeout for a single coordinator round trip
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Optimistic-write retry budget on revision conflicts
    #[serde(default = "default_max_write_retries")]
    pub max_write_retries: usize,

    /// Identity resolution retry budget
    #[serde(default = "default_max_identity_retries")]
    pub max_identity_retries: usize,

    /// Exponential backoff base delay
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Exponential backoff ceiling
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,

    /// Maximum mutations queued while identity is unresolved
    #[serde(default = "default_max_queued_ops")]
    pub max_queued_ops: usize,
}

fn default_debounce_ms() -> u64 {
    150
}

fn default_accept_window_ms() -> u64 {
    5000
}

fn default_self_write_ttl_ms() -> u64 {
    5000
}

fn default_grace_window_ms() -> u64 {
    300
}

fn default_heartbeat_interval_ms() -> u64 {
    2000
}

fn default_heartbeat_miss_threshold() -> u32 {
    3
}

fn default_request_timeout_ms() -> u64 {
    3000
}

fn default_max_write_retries() -> usize {
    3
}

fn default_max_identity_retries() -> usize {
    5
}

fn default_backoff_base_ms() -> u64 {
    100
}

fn default_backoff_cap_ms() -> u64 {
    5000
}

fn default_max_queued_ops() -> usize {
    64
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            accept_window_ms: default_accept_window_ms(),
            self_write_ttl_ms: default_self_write_ttl_ms(),
            grace_window_ms: default_grace_window_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_miss_threshold: default_heartbeat_miss_threshold(),
            request_timeout_ms: default_request_timeout_ms(),
            max_write_retries: default_max_write_retries(),
            max_identity_retries: default_max_identity_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            max_queued_ops: default_max_queued_ops(),
        }
    }
}

impl SyncConfig {
    /// Load configuration from an optional file plus `TABSYNC_*` environment
    /// overrides, falling back to defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, SyncError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(config::Environment::with_prefix("TABSYNC"));
        let cfg: SyncConfig = builder.build()?.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Validate cross-field constraints.
    ///
    /// The coalescing window must close before the acceptance window does,
    /// otherwise storage can report a change before any context has been told
    /// to expect it.
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.debounce_ms >= self.accept_window_ms {
            return Err(SyncError::Config(format!(
                "debounce_ms ({}) must be shorter than accept_window_ms ({})",
                self.debounce_ms, self.accept_window_ms
            )));
        }
        if self.self_write_ttl_ms < self.accept_window_ms {
            return Err(SyncError::Config(format!(
                "self_write_ttl_ms ({}) must cover accept_window_ms ({})",
                self.self_write_ttl_ms, self.accept_window_ms
            )));
        }
        if self.heartbeat_miss_threshold == 0 {
            return Err(SyncError::Config(
                "heartbeat_miss_threshold must be at least 1".to_string(),
            ));
        }
        if self.backoff_base_ms == 0 || self.backoff_cap_ms < self.backoff_base_ms {
            return Err(SyncError::Config(format!(
                "invalid backoff range: base {} cap {}",
                self.backoff_base_ms, self.backoff_cap_ms
            )));
        }
        Ok(())
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn grace_window(&self) -> Duration {
        Duration::from_millis(self.grace_window_ms)
    }

    pub fn self_write_ttl(&self) -> Duration {
        Duration::from_millis(self.self_write_ttl_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Exponential backoff delay for the given zero-based attempt.
    pub fn backoff_delay(&self, attempt: usize) -> Duration {
        let exp = attempt.min(16) as u32;
        let delay = self
            .backoff_base_ms
            .saturating_mul(1u64 << exp)
            .min(self.backoff_cap_ms);
        Duration::from_millis(delay)
    }
}
