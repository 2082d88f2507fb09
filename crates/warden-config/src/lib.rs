//! Configuration management for Warden
//!
//! Provides hierarchical configuration loading from multiple sources:
//! 1. Environment variables (WARDEN_* prefix, `__` between section and key)
//! 2. warden.local.toml (gitignored, local overrides)
//! 3. warden.toml (git-tracked, project config)
//! 4. ~/.config/warden/config.toml (user defaults)
//! 5. Built-in defaults (lowest precedence)

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

mod error;
mod loader;
mod paths;

pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use paths::Paths;

/// Main Warden configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WardenConfig {
    pub sensor: SensorConfig,
    pub aggregator: AggregatorConfig,
    pub graph: GraphConfig,
    pub latency: LatencyConfig,
}

/// Local suspicion sensor tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    /// Tolerance factor applied to every expectation. Must exceed 1.0.
    pub suspicion_delta: f64,
    /// Period (in consensus instances) of leader reconfiguration.
    pub calculation_interval: i32,
    /// Offset within the period at which reconfiguration takes effect.
    /// Rounds at `calculation_delay + 1` are exempt from suspicion.
    pub calculation_delay: i32,
    /// Number of past proposal send times retained.
    pub history: usize,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            suspicion_delta: 1.5,
            calculation_interval: 1000,
            calculation_delay: 100,
            history: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    /// Consensus instances between two decay steps.
    pub decay_interval: u32,
    /// Weight removed per elapsed instance when a decay step runs.
    pub decay_rate: f64,
    /// Measurements older than `latest - gc_retention` are dropped.
    pub gc_retention: u32,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            decay_interval: 100,
            decay_rate: 0.1,
            gc_retention: 1000,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum CandidateStrategy {
    /// Matching and triangle heuristic only. Polynomial time.
    Heuristic,
    /// Budgeted maximum independent set search, heuristic as fallback.
    Exhaustive,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    pub strategy: CandidateStrategy,
    /// Wall-clock budget for the exhaustive search.
    pub exhaustive_budget_ms: u64,
    /// Views larger than this always use the heuristic.
    pub exhaustive_max_vertices: usize,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            strategy: CandidateStrategy::Heuristic,
            exhaustive_budget_ms: 100,
            exhaustive_max_vertices: 64,
        }
    }
}

impl GraphConfig {
    pub fn exhaustive_budget(&self) -> Duration {
        Duration::from_millis(self.exhaustive_budget_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LatencyConfig {
    /// Samples kept per peer by each latency sensor.
    pub monitoring_window: usize,
    /// Delay before the first latency dissemination.
    pub sync_delay_ms: u64,
    /// Period between latency disseminations.
    pub sync_period_ms: u64,
    /// Period between sensor expectation refreshes.
    pub expectation_refresh_ms: u64,
}

impl Default for LatencyConfig {
    fn default() -> Self {
        Self {
            monitoring_window: 1000,
            sync_delay_ms: 10_000,
            sync_period_ms: 10_000,
            expectation_refresh_ms: 1_000,
        }
    }
}

impl LatencyConfig {
    pub fn sync_delay(&self) -> Duration {
        Duration::from_millis(self.sync_delay_ms)
    }

    pub fn sync_period(&self) -> Duration {
        Duration::from_millis(self.sync_period_ms)
    }

    pub fn expectation_refresh(&self) -> Duration {
        Duration::from_millis(self.expectation_refresh_ms)
    }
}

impl WardenConfig {
    /// Load configuration from default locations
    pub fn load() -> Result<Self> {
        ConfigLoader::new().load()
    }

    /// Load configuration from specific project directory
    pub fn load_from_dir(project_dir: impl AsRef<Path>) -> Result<Self> {
        ConfigLoader::new().with_project_dir(project_dir).load()
    }

    /// Parse a single TOML file, without layering.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadError {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&content).map_err(|source| ConfigError::ParseError {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Configuration for tests and simulation: no start-up delay, fast timers.
    pub fn simulation() -> Self {
        Self {
            latency: LatencyConfig {
                sync_delay_ms: 0,
                sync_period_ms: 10,
                expectation_refresh_ms: 10,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Rejects values the monitor cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.sensor.suspicion_delta > 1.0) {
            return Err(ConfigError::ValidationError(format!(
                "sensor.suspicion_delta must be > 1.0, got {}",
                self.sensor.suspicion_delta
            )));
        }
        if self.sensor.calculation_interval <= 0 {
            return Err(ConfigError::ValidationError(
                "sensor.calculation_interval must be positive".to_string(),
            ));
        }
        if self.sensor.history < 2 {
            return Err(ConfigError::ValidationError(
                "sensor.history must keep at least two rounds".to_string(),
            ));
        }
        if self.aggregator.decay_interval == 0 {
            return Err(ConfigError::ValidationError(
                "aggregator.decay_interval must be positive".to_string(),
            ));
        }
        if !(self.aggregator.decay_rate >= 0.0 && self.aggregator.decay_rate.is_finite()) {
            return Err(ConfigError::ValidationError(format!(
                "aggregator.decay_rate must be a non-negative number, got {}",
                self.aggregator.decay_rate
            )));
        }
        if self.latency.monitoring_window == 0 {
            return Err(ConfigError::ValidationError(
                "latency.monitoring_window must be positive".to_string(),
            ));
        }
        if self.latency.sync_period_ms == 0 || self.latency.expectation_refresh_ms == 0 {
            return Err(ConfigError::ValidationError(
                "latency timer periods must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = WardenConfig::default();
        assert!((config.sensor.suspicion_delta - 1.5).abs() < f64::EPSILON);
        assert_eq!(config.aggregator.decay_interval, 100);
        assert_eq!(config.graph.strategy, CandidateStrategy::Heuristic);
        assert_eq!(config.latency.sync_period(), Duration::from_secs(10));
        config.validate().expect("defaults must validate");
    }

    #[test]
    fn test_simulation_config() {
        let config = WardenConfig::simulation();
        assert_eq!(config.latency.sync_delay(), Duration::ZERO);
        config.validate().expect("simulation config must validate");
    }

    #[test]
    fn test_rejects_delta_not_above_one() {
        let mut config = WardenConfig::default();
        config.sensor.suspicion_delta = 1.0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));

        config.sensor.suspicion_delta = f64::NAN;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_decay_interval() {
        let mut config = WardenConfig::default();
        config.aggregator.decay_interval = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_toml_file() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("custom.toml");
        std::fs::write(
            &path,
            r#"
[graph]
strategy = "exhaustive"
exhaustive_budget_ms = 25
"#,
        )
        .expect("Failed to write config");

        let config = WardenConfig::from_toml_file(&path).expect("Failed to parse config");
        assert_eq!(config.graph.strategy, CandidateStrategy::Exhaustive);
        assert_eq!(config.graph.exhaustive_budget(), Duration::from_millis(25));
        assert_eq!(config.aggregator, AggregatorConfig::default());
    }

    #[test]
    fn test_from_toml_file_missing() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let result = WardenConfig::from_toml_file(dir.path().join("absent.toml"));
        assert!(matches!(result, Err(ConfigError::ReadError { .. })));
    }

    #[test]
    fn test_from_toml_file_invalid() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[sensor]\nsuspicion_delta = \"fast\"\n").unwrap();
        assert!(matches!(
            WardenConfig::from_toml_file(&path),
            Err(ConfigError::ParseError { .. })
        ));
    }
}
