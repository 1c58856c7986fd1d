//! Configuration for the governance engine

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::GovernanceError;
use crate::voting::MajorityPolicy;

/// Lower bound on the reconciliation interval.
pub const MIN_SYNC_INTERVAL: Duration = Duration::from_secs(5);

/// Off-chain governance configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GovernanceConfig {
    /// Approval fraction that must be strictly exceeded
    #[serde(default = "default_threshold_numerator")]
    pub threshold_numerator: u64,

    #[serde(default = "default_threshold_denominator")]
    pub threshold_denominator: u64,

    /// Maximum length of a usage category label
    #[serde(default = "default_max_category_len")]
    pub max_category_len: usize,

    /// Maximum length of a usage request title
    #[serde(default = "default_max_title_len")]
    pub max_title_len: usize,
}

impl Default for GovernanceConfig {
    fn default() -> Self {
        Self {
            threshold_numerator: default_threshold_numerator(),
            threshold_denominator: default_threshold_denominator(),
            max_category_len: default_max_category_len(),
            max_title_len: default_max_title_len(),
        }
    }
}

impl GovernanceConfig {
    pub fn majority(&self) -> Result<MajorityPolicy, GovernanceError> {
        MajorityPolicy::new(self.threshold_numerator, self.threshold_denominator)
    }
}

/// Reconciliation sync configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Pass interval in seconds, clamped to [`MIN_SYNC_INTERVAL`]
    #[serde(default = "default_sync_interval")]
    pub interval_secs: u64,

    /// Timeout for one authoritative lookup in seconds
    #[serde(default = "default_lookup_timeout")]
    pub lookup_timeout_secs: u64,

    /// Lifetime of a cached authoritative snapshot in seconds
    #[serde(default = "default_snapshot_ttl")]
    pub snapshot_ttl_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_sync_interval(),
            lookup_timeout_secs: default_lookup_timeout(),
            snapshot_ttl_secs: default_snapshot_ttl(),
        }
    }
}

impl SyncConfig {
    pub fn effective_interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs).max(MIN_SYNC_INTERVAL)
    }

    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_secs(self.lookup_timeout_secs.max(1))
    }

    /// Snapshot lifetime, never longer than one sync interval.
    pub fn snapshot_ttl(&self) -> Duration {
        Duration::from_secs(self.snapshot_ttl_secs).min(self.effective_interval())
    }
}

fn default_threshold_numerator() -> u64 {
    1
}

fn default_threshold_denominator() -> u64 {
    2
}

fn default_max_category_len() -> usize {
    64
}

fn default_max_title_len() -> usize {
    200
}

fn default_sync_interval() -> u64 {
    60
}

fn default_lookup_timeout() -> u64 {
    10
}

fn default_snapshot_ttl() -> u64 {
    30
}
