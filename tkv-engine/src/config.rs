//! # Local Cache Configuration
//!
//! Options for `LocalCache`, loadable from JSON using the camelCase names
//! (`autoSweep`, `sweepIntervalSec`, `sweepCapacity`, `policy`).

use std::time::Duration;

use serde::Deserialize;

use tkv_common::{TkvError, TkvResult};

/// Default sweep interval in seconds.
pub const DEFAULT_SWEEP_INTERVAL_SEC: i64 = 60;

/// Entries expiring within this window are candidates for near-expiry shedding.
pub const DEFAULT_SHED_WINDOW_SEC: u64 = 3600;

/// Only entries whose TTL exceeds this are shed early; shorter ones wait for hard expiry.
pub const DEFAULT_SHED_MIN_TTL_SEC: u64 = 3600;

/// Eviction policy applied by each sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum SweepPolicy {
    /// Evict expired entries, then shed cold entries that expire soon.
    #[default]
    ClearAll,
    /// Evict only entries already past their deadline.
    OnlyExpired,
}

/// Configuration for `LocalCache`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LocalCacheConfig {
    /// Start the background sweeper on construction.
    pub auto_sweep: bool,
    /// Seconds between sweeps; values `<= 0` fall back to 60.
    pub sweep_interval_sec: i64,
    /// Maximum entries evicted per sweep; `0` means unbounded.
    pub sweep_capacity: i64,
    /// Sweep policy.
    pub policy: SweepPolicy,
    /// Store values as JSON text instead of the in-memory value.
    pub json_serialize: bool,
    /// Near-expiry window used by `SweepPolicy::ClearAll`.
    pub shed_window_sec: u64,
    /// Minimum TTL (exclusive) for an entry to be shed before it expires.
    pub shed_min_ttl_sec: u64,
}

impl Default for LocalCacheConfig {
    fn default() -> Self {
        LocalCacheConfig {
            auto_sweep: true,
            sweep_interval_sec: DEFAULT_SWEEP_INTERVAL_SEC,
            sweep_capacity: 0,
            policy: SweepPolicy::ClearAll,
            json_serialize: false,
            shed_window_sec: DEFAULT_SHED_WINDOW_SEC,
            shed_min_ttl_sec: DEFAULT_SHED_MIN_TTL_SEC,
        }
    }
}

impl LocalCacheConfig {
    /// Parses a JSON document, applying defaults for missing fields.
    pub fn from_json(text: &str) -> TkvResult<Self> {
        let config: LocalCacheConfig =
            serde_json::from_str(text).map_err(|err| TkvError::Config(err.to_string()))?;
        Ok(config.normalized())
    }

    /// Clamps out-of-range values to their defaults.
    pub fn normalized(mut self) -> Self {
        if self.sweep_interval_sec <= 0 {
            self.sweep_interval_sec = DEFAULT_SWEEP_INTERVAL_SEC;
        }
        if self.sweep_capacity < 0 {
            self.sweep_capacity = 0;
        }
        self
    }

    /// Sweep interval as a `Duration`.
    pub fn sweep_interval(&self) -> Duration {
        let secs = if self.sweep_interval_sec <= 0 {
            DEFAULT_SWEEP_INTERVAL_SEC
        } else {
            self.sweep_interval_sec
        };
        Duration::from_secs(secs as u64)
    }

    /// Per-sweep eviction budget, `usize::MAX` when unbounded.
    pub fn sweep_budget(&self) -> usize {
        if self.sweep_capacity <= 0 {
            usize::MAX
        } else {
            self.sweep_capacity as usize
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_camel_case_json() {
        let config = LocalCacheConfig::from_json(
            r#"{"autoSweep": false, "sweepIntervalSec": 5, "sweepCapacity": 10, "policy": "OnlyExpired"}"#,
        )
        .unwrap();
        assert!(!config.auto_sweep);
        assert_eq!(config.sweep_interval(), Duration::from_secs(5));
        assert_eq!(config.sweep_budget(), 10);
        assert_eq!(config.policy, SweepPolicy::OnlyExpired);
        assert_eq!(config.shed_window_sec, DEFAULT_SHED_WINDOW_SEC);
    }

    #[test]
    fn clamps_out_of_range_values() {
        let config = LocalCacheConfig::from_json(r#"{"sweepIntervalSec": -3, "sweepCapacity": -1}"#)
            .unwrap();
        assert_eq!(config.sweep_interval_sec, DEFAULT_SWEEP_INTERVAL_SEC);
        assert_eq!(config.sweep_budget(), usize::MAX);
    }

    #[test]
    fn rejects_malformed_json() {
        assert!(matches!(
            LocalCacheConfig::from_json("{"),
            Err(TkvError::Config(_))
        ));
    }
}
