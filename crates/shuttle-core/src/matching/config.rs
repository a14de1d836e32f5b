//! Per-partition matching configuration.
//!
//! Durations are written as milliseconds in JSON (`"poller_history_ttl_ms": 300000`).
//! Missing fields take their defaults.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("occupancy_low_water ({low}) must be below occupancy_high_water ({high})")]
    InvertedWaterMarks { low: usize, high: usize },

    #[error("invalid config json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Knobs for one partition.
///
/// ## Field semantics
/// - `poller_history_ttl`: registry entries older than this are invisible and purged on read
/// - `default_poll_timeout`: poll deadline when the caller gives none
/// - `max_outstanding_dispatches`: read-but-unacked backlog tasks offered at once
/// - `backlog_recheck_interval`: reader re-reads the backlog at least this often when idle
/// - `target_poll_latency`, `occupancy_*`, `timeout_streak`, `max_scale_step`: scaling advisor
/// - `idle_unload_after`: manager evicts a partition idle for longer than this
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchingConfig {
    #[serde(with = "millis", rename = "poller_history_ttl_ms")]
    pub poller_history_ttl: Duration,

    #[serde(with = "millis", rename = "default_poll_timeout_ms")]
    pub default_poll_timeout: Duration,

    pub max_outstanding_dispatches: usize,

    #[serde(with = "millis", rename = "backlog_recheck_interval_ms")]
    pub backlog_recheck_interval: Duration,

    #[serde(with = "millis", rename = "target_poll_latency_ms")]
    pub target_poll_latency: Duration,

    pub occupancy_high_water: usize,
    pub occupancy_low_water: usize,
    pub timeout_streak: u32,
    pub max_scale_step: u32,

    #[serde(with = "millis", rename = "idle_unload_after_ms")]
    pub idle_unload_after: Duration,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            poller_history_ttl: Duration::from_secs(5 * 60),
            default_poll_timeout: Duration::from_secs(60),
            max_outstanding_dispatches: 8,
            backlog_recheck_interval: Duration::from_secs(1),
            target_poll_latency: Duration::from_millis(500),
            occupancy_high_water: 10,
            occupancy_low_water: 2,
            timeout_streak: 3,
            max_scale_step: 5,
            idle_unload_after: Duration::from_secs(5 * 60),
        }
    }
}

impl MatchingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let durations = [
            ("poller_history_ttl", self.poller_history_ttl),
            ("default_poll_timeout", self.default_poll_timeout),
            ("backlog_recheck_interval", self.backlog_recheck_interval),
            ("target_poll_latency", self.target_poll_latency),
            ("idle_unload_after", self.idle_unload_after),
        ];
        if let Some((field, _)) = durations.iter().find(|(_, d)| d.is_zero()) {
            return Err(ConfigError::Zero { field });
        }
        if self.max_outstanding_dispatches == 0 {
            return Err(ConfigError::Zero {
                field: "max_outstanding_dispatches",
            });
        }
        if self.timeout_streak == 0 {
            return Err(ConfigError::Zero {
                field: "timeout_streak",
            });
        }
        if self.max_scale_step == 0 {
            return Err(ConfigError::Zero {
                field: "max_scale_step",
            });
        }
        if self.occupancy_low_water >= self.occupancy_high_water {
            return Err(ConfigError::InvertedWaterMarks {
                low: self.occupancy_low_water,
                high: self.occupancy_high_water,
            });
        }
        Ok(())
    }

    /// Parse and validate a JSON config.
    pub fn from_json_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }
}

pub(crate) mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
