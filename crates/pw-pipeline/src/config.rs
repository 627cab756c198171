//! Pipeline configuration
//!
//! Every section has defaults, so an empty JSON object is a valid config.
//! Durations are expressed in milliseconds.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use pw_core::dedup::{DEFAULT_DEDUP_CAPACITY, DEFAULT_DEDUP_TTL};
use pw_core::{DEFAULT_MIN_CONFIDENCE, DEFAULT_SESSION_CAP};

use crate::error::ConfigError;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub pool: PoolConfig,
    pub bus: BusConfig,
    pub dedup: DedupConfig,
    pub store: StoreConfig,
    pub health: HealthConfig,
    pub perf: PerfConfig,
    pub correlation: CorrelationConfig,
    pub matching: MatchingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub max_workers: usize,
    pub queue_timeout_ms: u64,
    pub dispatch_timeout_ms: u64,
    pub batch_size: usize,
    /// A worker is replaced once its error count exceeds this
    pub max_worker_errors: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            queue_timeout_ms: 5_000,
            dispatch_timeout_ms: 5_000,
            batch_size: 10,
            max_worker_errors: 5,
        }
    }
}

impl PoolConfig {
    pub fn queue_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_timeout_ms)
    }

    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatch_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub batch_size: usize,
    pub max_listeners: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            max_listeners: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    pub ttl_ms: u64,
    pub capacity: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            ttl_ms: DEFAULT_DEDUP_TTL.as_millis() as u64,
            capacity: DEFAULT_DEDUP_CAPACITY,
        }
    }
}

impl DedupConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub session_cap: usize,
    /// Keep history across navigations, separated by boundary markers
    pub retain_on_navigation: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            session_cap: DEFAULT_SESSION_CAP,
            retain_on_navigation: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub enabled: bool,
    pub check_interval_ms: u64,
    pub stall_threshold_ms: u64,
    pub recovery_delay_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval_ms: 30_000,
            stall_threshold_ms: 60_000,
            recovery_delay_ms: 100,
        }
    }
}

impl HealthConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    pub fn stall_threshold(&self) -> Duration {
        Duration::from_millis(self.stall_threshold_ms)
    }

    pub fn recovery_delay(&self) -> Duration {
        Duration::from_millis(self.recovery_delay_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerfConfig {
    pub enabled: bool,
    pub sample_interval_ms: u64,
    /// Latency samples kept for percentile estimates
    pub sample_window: usize,
    pub latency_budget_ms: u64,
    pub memory_budget_mb: u64,
    pub queue_depth_threshold: usize,
    pub min_dedup_hit_ratio: f64,
}

impl Default for PerfConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sample_interval_ms: 60_000,
            sample_window: 512,
            latency_budget_ms: 50,
            memory_budget_mb: 256,
            queue_depth_threshold: 8,
            min_dedup_hit_ratio: 0.05,
        }
    }
}

impl PerfConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    pub fn latency_budget(&self) -> Duration {
        Duration::from_millis(self.latency_budget_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelationConfig {
    pub window_ms: u64,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self { window_ms: 60_000 }
    }
}

impl CorrelationConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchingConfig {
    pub min_confidence: f64,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            min_confidence: DEFAULT_MIN_CONFIDENCE,
        }
    }
}

impl PipelineConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: PipelineConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.pool.max_workers == 0 {
            return invalid("pool.max_workers must be at least 1");
        }
        if self.pool.batch_size == 0 {
            return invalid("pool.batch_size must be at least 1");
        }
        if self.pool.queue_timeout_ms == 0 || self.pool.dispatch_timeout_ms == 0 {
            return invalid("pool timeouts must be non-zero");
        }
        if self.bus.batch_size == 0 {
            return invalid("bus.batch_size must be at least 1");
        }
        if self.bus.max_listeners == 0 {
            return invalid("bus.max_listeners must be at least 1");
        }
        if self.dedup.capacity == 0 {
            return invalid("dedup.capacity must be at least 1");
        }
        if self.store.session_cap == 0 {
            return invalid("store.session_cap must be at least 1");
        }
        if self.health.check_interval_ms == 0 {
            return invalid("health.check_interval_ms must be non-zero");
        }
        if self.perf.sample_interval_ms == 0 || self.perf.sample_window == 0 {
            return invalid("perf.sample_interval_ms and perf.sample_window must be non-zero");
        }
        let confidence = self.matching.min_confidence;
        if !(0.0..=1.0).contains(&confidence) {
            return invalid("matching.min_confidence must be within [0, 1]");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_object_uses_defaults() {
        let config = PipelineConfig::from_json("{}").expect("valid");
        assert_eq!(config, PipelineConfig::default());
        assert_eq!(config.pool.queue_timeout(), Duration::from_secs(5));
        assert_eq!(config.bus.batch_size, 50);
        assert_eq!(config.dedup.ttl(), Duration::from_secs(5));
        assert_eq!(config.correlation.window(), Duration::from_secs(60));
        assert_eq!(config.health.recovery_delay(), Duration::from_millis(100));
    }

    #[test]
    fn test_partial_sections() {
        let config = PipelineConfig::from_json(r#"{"pool": {"max_workers": 2}, "store": {"retain_on_navigation": true}}"#)
            .expect("valid");
        assert_eq!(config.pool.max_workers, 2);
        assert_eq!(config.pool.batch_size, 10);
        assert!(config.store.retain_on_navigation);
    }

    #[test]
    fn test_validation_rejects_nonsense() {
        for text in [
            r#"{"pool": {"max_workers": 0}}"#,
            r#"{"bus": {"batch_size": 0}}"#,
            r#"{"matching": {"min_confidence": 1.5}}"#,
            r#"{"store": {"session_cap": 0}}"#,
        ] {
            assert!(matches!(PipelineConfig::from_json(text), Err(ConfigError::Invalid(_))), "{text}");
        }
        assert!(matches!(PipelineConfig::from_json("[1, 2"), Err(ConfigError::Json(_))));
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            PipelineConfig::load_from_file("/nonexistent/pixelwatch.json"),
            Err(ConfigError::Io(_))
        ));
    }
}
