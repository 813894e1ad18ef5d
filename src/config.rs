//! # Configuration Module
//!
//! This module defines the configuration structure for the realtime core
//! service. It handles loading configuration from environment variables,
//! files, and defaults. Every knob has a default; no external configuration
//! is required for basic operation.

use serde::{Deserialize, Serialize};

use crate::error::{RealtimeError, Result};

/// Main configuration structure for the realtime core service
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Event bus configuration
    pub bus: EventBusConfig,

    /// Aggregation engine configuration
    pub aggregation: AggregationConfig,

    /// Durable queue configuration
    pub queue: SyncQueueConfig,

    /// Monitoring and metrics configuration
    pub monitoring: MonitoringConfig,

    /// Environment-specific settings
    pub environment: EnvironmentConfig,
}

impl Config {
    /// Load configuration from environment variables and files
    pub fn from_env() -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name("config/realtime-core").required(false))
            .add_source(config::File::with_name("config/realtime-core.local").required(false))
            .add_source(
                config::Environment::with_prefix("REALTIME_CORE")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()
            .map_err(|e| RealtimeError::configuration(e.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| RealtimeError::configuration(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.bus.batch_size == 0 {
            return Err(RealtimeError::configuration("bus.batch_size must be > 0"));
        }
        if self.bus.history_capacity == 0 {
            return Err(RealtimeError::configuration(
                "bus.history_capacity must be > 0",
            ));
        }
        if self.aggregation.window_minutes.is_empty() {
            return Err(RealtimeError::configuration(
                "aggregation.window_minutes must not be empty",
            ));
        }
        if self.aggregation.window_minutes.iter().any(|w| *w == 0) {
            return Err(RealtimeError::configuration(
                "aggregation.window_minutes entries must be > 0",
            ));
        }
        if !(0.0..=1.0).contains(&self.aggregation.memory_high_watermark) {
            return Err(RealtimeError::configuration(
                "aggregation.memory_high_watermark must be within 0.0..=1.0",
            ));
        }
        if self.queue.max_queue_size == 0 {
            return Err(RealtimeError::configuration(
                "queue.max_queue_size must be > 0",
            ));
        }
        Ok(())
    }
}

/// Event bus configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventBusConfig {
    /// Per-organization history capacity (FIFO eviction beyond this)
    pub history_capacity: usize,

    /// Recent-events snapshot size kept for fast replay lookups
    pub replay_cache_size: usize,

    /// TTL for cached replay query results, in seconds
    pub replay_cache_ttl_seconds: u64,

    /// Maximum age of history entries, in seconds
    pub max_history_age_seconds: u64,

    /// Events per pending batch before an early flush
    pub batch_size: usize,

    /// Maximum time a pending batch may wait, in milliseconds
    pub batch_interval_ms: u64,

    /// Bounded delivery channel capacity per consumer connection
    pub connection_buffer: usize,

    /// History/subscription cleanup cadence, in seconds
    pub cleanup_interval_seconds: u64,

    /// Subscriptions idle longer than this are swept, in seconds
    pub subscription_idle_timeout_seconds: u64,

    /// Default replay limit when callers pass none
    pub default_replay_limit: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            history_capacity: 1000,
            replay_cache_size: 100,
            replay_cache_ttl_seconds: 30,
            max_history_age_seconds: 86_400,
            batch_size: 10,
            batch_interval_ms: 200,
            connection_buffer: 256,
            cleanup_interval_seconds: 300,
            subscription_idle_timeout_seconds: 1800,
            default_replay_limit: 100,
        }
    }
}

/// Aggregation engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
    /// Window sizes to maintain, in minutes
    pub window_minutes: Vec<u32>,

    /// Flush ticker cadence, in seconds
    pub flush_interval_seconds: u64,

    /// Safety lag before a closed window becomes flush-eligible, in seconds
    pub flush_lag_seconds: u64,

    /// Dead-letter list capacity
    pub dead_letter_capacity: usize,

    /// Dead-letter retry cadence and minimum entry age, in milliseconds
    pub retry_delay_ms: u64,

    /// Retries before a dead-lettered event is dropped permanently
    pub max_retries: u32,

    /// Memory sampling cadence, in seconds
    pub memory_check_interval_seconds: u64,

    /// Process memory budget, in megabytes
    pub max_memory_usage_mb: u64,

    /// Fraction of the memory budget that triggers the high-memory signal
    pub memory_high_watermark: f64,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            window_minutes: vec![1, 5, 15, 60],
            flush_interval_seconds: 30,
            flush_lag_seconds: 60,
            dead_letter_capacity: 1000,
            retry_delay_ms: 30_000,
            max_retries: 3,
            memory_check_interval_seconds: 10,
            max_memory_usage_mb: 512,
            memory_high_watermark: 0.9,
        }
    }
}

/// Durable queue configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncQueueConfig {
    /// Maximum queued items before enqueue attempts space reclamation
    pub max_queue_size: usize,

    /// Items older than this are expired by cleanup, in seconds
    pub max_item_age_seconds: u64,

    /// Queue persistence cadence, in seconds
    pub persistence_interval_seconds: u64,

    /// Expiry cleanup cadence, in seconds
    pub cleanup_interval_seconds: u64,
}

impl Default for SyncQueueConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 10_000,
            max_item_age_seconds: 7 * 86_400,
            persistence_interval_seconds: 300,
            cleanup_interval_seconds: 3600,
        }
    }
}

/// Monitoring and metrics configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    /// Whether the prometheus registry is populated
    pub metrics_enabled: bool,

    /// Metric name prefix
    pub namespace: String,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            metrics_enabled: true,
            namespace: "realtime_core".to_string(),
        }
    }
}

/// Environment-specific settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvironmentConfig {
    /// Environment name (dev, staging, prod)
    pub name: String,

    /// Debug mode flag
    pub debug: bool,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            name: "development".to_string(),
            debug: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = Config::default();

        assert_eq!(config.bus.history_capacity, 1000);
        assert_eq!(config.bus.batch_size, 10);
        assert_eq!(config.bus.batch_interval_ms, 200);
        assert_eq!(config.bus.cleanup_interval_seconds, 300);
        assert_eq!(config.bus.subscription_idle_timeout_seconds, 1800);

        assert_eq!(config.aggregation.window_minutes, vec![1, 5, 15, 60]);
        assert_eq!(config.aggregation.flush_interval_seconds, 30);
        assert_eq!(config.aggregation.flush_lag_seconds, 60);
        assert_eq!(config.aggregation.max_retries, 3);
        assert_eq!(config.aggregation.memory_check_interval_seconds, 10);

        assert_eq!(config.queue.persistence_interval_seconds, 300);
        assert_eq!(config.queue.cleanup_interval_seconds, 3600);
    }

    #[test]
    fn test_default_config_validates() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_zero_batch_size() {
        let mut config = Config::default();
        config.bus.batch_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_empty_windows() {
        let mut config = Config::default();
        config.aggregation.window_minutes.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_bad_watermark() {
        let mut config = Config::default();
        config.aggregation.memory_high_watermark = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_serde_round_trip() {
        let config = Config::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);
    }
}
