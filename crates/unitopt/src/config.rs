//! TOML-loadable configuration for the optimization pipeline.
//!
//! Every section has defaults, so an empty file (or no file) is valid.
//! Durations are plain millisecond integers to keep the file readable.
//!
//! ```toml
//! data_dir = "/var/cache/unitopt"
//!
//! [limits]
//! max_pass_instructions = 500000
//! max_expansion_ratio = 3.0
//!
//! [governor]
//! pass_failure_threshold = 5
//! cascade_threshold = 10
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Top-level pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Root of every persisted file (index, WAL, artifacts, governor state).
    pub data_dir: PathBuf,
    /// Input and transform limits.
    pub limits: LimitsConfig,
    /// Cache tier sizing.
    pub cache: CacheConfig,
    /// Failure thresholds and state-machine timing.
    pub governor: GovernorConfig,
    /// Transform worker pool.
    pub pool: PoolConfig,
    /// Heap backpressure monitor.
    pub heap: HeapConfig,
    /// Load-order recording and prewarm.
    pub accelerator: AcceleratorConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("unitopt-data"),
            limits: LimitsConfig::default(),
            cache: CacheConfig::default(),
            governor: GovernorConfig::default(),
            pool: PoolConfig::default(),
            heap: HeapConfig::default(),
            accelerator: AcceleratorConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Defaults rooted at `data_dir`.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate().map_err(ConfigError::Invalid)?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Validate configuration values, returning an error message on failure.
    pub fn validate(&self) -> Result<(), String> {
        let limits = &self.limits;
        if limits.min_unit_size > limits.max_unit_size {
            return Err(format!(
                "limits.min_unit_size ({}) must be <= limits.max_unit_size ({})",
                limits.min_unit_size, limits.max_unit_size
            ));
        }
        if limits.min_version > limits.max_version {
            return Err(format!(
                "limits.min_version ({}) must be <= limits.max_version ({})",
                limits.min_version, limits.max_version
            ));
        }
        if limits.max_pass_instructions == 0 {
            return Err("limits.max_pass_instructions must be > 0".to_string());
        }
        if limits.max_analysis_depth == 0 {
            return Err("limits.max_analysis_depth must be > 0".to_string());
        }
        if !(limits.max_expansion_ratio.is_finite() && limits.max_expansion_ratio >= 1.0) {
            return Err(format!(
                "limits.max_expansion_ratio must be a finite value >= 1.0, got {}",
                limits.max_expansion_ratio
            ));
        }
        if self.governor.pass_failure_threshold == 0 {
            return Err("governor.pass_failure_threshold must be > 0".to_string());
        }
        if self.governor.unit_failure_threshold == 0 {
            return Err("governor.unit_failure_threshold must be > 0".to_string());
        }
        if self.governor.cascade_threshold == 0 {
            return Err("governor.cascade_threshold must be > 0".to_string());
        }
        if self.governor.cascade_window_ms == 0 {
            return Err("governor.cascade_window_ms must be > 0".to_string());
        }
        if self.pool.workers == 0 {
            return Err("pool.workers must be > 0".to_string());
        }
        if self.pool.queue_capacity == 0 {
            return Err("pool.queue_capacity must be > 0".to_string());
        }
        if self.pool.watchdog_ms == 0 {
            return Err("pool.watchdog_ms must be > 0".to_string());
        }
        if self.heap.low_water_bytes > self.heap.high_water_bytes {
            return Err(format!(
                "heap.low_water_bytes ({}) must be <= heap.high_water_bytes ({})",
                self.heap.low_water_bytes, self.heap.high_water_bytes
            ));
        }
        Ok(())
    }
}

/// Input and per-transform limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Smallest accepted unit in bytes (default: 20).
    pub min_unit_size: usize,
    /// Largest accepted unit in bytes (default: 1 MiB).
    pub max_unit_size: usize,
    /// Lowest accepted format version (default: 1).
    pub min_version: u16,
    /// Highest accepted format version (default: 1).
    pub max_version: u16,
    /// Instructions a single pass may visit before it is aborted (default: 500_000).
    pub max_pass_instructions: u64,
    /// Nested analysis ceiling (default: 32).
    pub max_analysis_depth: u32,
    /// Reject outputs larger than `original * ratio` (default: 3.0).
    pub max_expansion_ratio: f64,
    /// Fold integer division/remainder by zero to `0` instead of leaving it (default: false).
    pub fold_division_by_zero: bool,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            min_unit_size: crate::unit::MIN_UNIT_SIZE,
            max_unit_size: 1 << 20,
            min_version: 1,
            max_version: 1,
            max_pass_instructions: 500_000,
            max_analysis_depth: 32,
            max_expansion_ratio: 3.0,
            fold_division_by_zero: false,
        }
    }
}

/// Cache tier sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum L1 entries; inserts beyond this are dropped (default: 4096).
    pub l1_max_entries: usize,
    /// Maximum live L2 mappings, FIFO eviction (default: 256).
    pub l2_max_entries: usize,
    /// Truncate the WAL once it grows past this many bytes (default: 1 MiB).
    pub wal_checkpoint_bytes: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            l1_max_entries: 4096,
            l2_max_entries: 256,
            wal_checkpoint_bytes: 1 << 20,
        }
    }
}

/// Governor thresholds and windows.
///
/// The `*_threshold` fields are failure counts that trip once reached: a
/// threshold of 3 acts on the third failure. `max_disabled_passes` is a
/// tolerance instead: that many disabled passes are allowed, one more
/// disables the optimizer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernorConfig {
    /// Distinct units a pass may fail on; the pass is disabled on reaching it (default: 5).
    pub pass_failure_threshold: u32,
    /// Disabled passes tolerated; exceeding it disables the governor (default: 8).
    pub max_disabled_passes: usize,
    /// Failures that blacklist a unit on reaching it (default: 3).
    pub unit_failure_threshold: u32,
    /// Cascade sliding window (default: 5000 ms).
    pub cascade_window_ms: u64,
    /// Failures inside the window that trigger emergency shutdown on reaching it (default: 10).
    pub cascade_threshold: usize,
    /// Time in WARMING before promotion to ACTIVE (default: 2000 ms).
    pub warming_settle_ms: u64,
    /// Failure-free time in DEGRADED before returning to ACTIVE (default: 30000 ms).
    pub degraded_recovery_ms: u64,
    /// Run the canary suite during bootstrap (default: true).
    pub run_canaries: bool,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            pass_failure_threshold: 5,
            max_disabled_passes: 8,
            unit_failure_threshold: 3,
            cascade_window_ms: 5_000,
            cascade_threshold: 10,
            warming_settle_ms: 2_000,
            degraded_recovery_ms: 30_000,
            run_canaries: true,
        }
    }
}

impl GovernorConfig {
    pub fn cascade_window(&self) -> Duration {
        Duration::from_millis(self.cascade_window_ms)
    }

    pub fn warming_settle(&self) -> Duration {
        Duration::from_millis(self.warming_settle_ms)
    }

    pub fn degraded_recovery(&self) -> Duration {
        Duration::from_millis(self.degraded_recovery_ms)
    }
}

/// Transform worker pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Worker threads (default: available parallelism, capped at 4).
    pub workers: usize,
    /// Pending jobs before callers get passthrough (default: 64).
    pub queue_capacity: usize,
    /// Hard per-transform timeout (default: 5000 ms).
    pub watchdog_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get().min(4))
            .unwrap_or(2);
        Self {
            workers,
            queue_capacity: 64,
            watchdog_ms: 5_000,
        }
    }
}

impl PoolConfig {
    pub fn watchdog(&self) -> Duration {
        Duration::from_millis(self.watchdog_ms)
    }
}

/// Heap backpressure monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeapConfig {
    /// Start the background sampler (default: true).
    pub enabled: bool,
    /// Pause optimization above this resident size (default: 2 GiB).
    pub high_water_bytes: u64,
    /// Resume below this resident size (default: 1.5 GiB).
    pub low_water_bytes: u64,
    /// Sampling period (default: 500 ms).
    pub sample_interval_ms: u64,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            high_water_bytes: 2 << 30,
            low_water_bytes: 3 << 29,
            sample_interval_ms: 500,
        }
    }
}

impl HeapConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }
}

/// Load-order recording and prewarm.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AcceleratorConfig {
    /// Record load order and prewarm at startup (default: true).
    pub enabled: bool,
    /// Maximum keys recorded per session (default: 10_000).
    pub max_recorded: usize,
    /// Maximum units promoted to L2 at startup (default: 256).
    pub prewarm_limit: usize,
}

impl Default for AcceleratorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_recorded: 10_000,
            prewarm_limit: 256,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.limits.max_pass_instructions, 500_000);
        assert_eq!(config.governor.cascade_threshold, 10);
        assert!(!config.limits.fold_division_by_zero);
    }

    #[test]
    fn empty_toml_uses_defaults() {
        let config = PipelineConfig::from_toml_str("").unwrap();
        assert_eq!(config.governor.pass_failure_threshold, 5);
        assert_eq!(config.pool.watchdog(), Duration::from_secs(5));
    }

    #[test]
    fn partial_toml_overrides_fields() {
        let toml = r#"
            data_dir = "/tmp/uo"

            [limits]
            max_expansion_ratio = 2.5
            fold_division_by_zero = true

            [governor]
            cascade_threshold = 3
        "#;
        let config = PipelineConfig::from_toml_str(toml).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/tmp/uo"));
        assert!((config.limits.max_expansion_ratio - 2.5).abs() < f64::EPSILON);
        assert!(config.limits.fold_division_by_zero);
        assert_eq!(config.governor.cascade_threshold, 3);
        assert_eq!(config.governor.unit_failure_threshold, 3);
    }

    #[test]
    fn validate_rejects_bad_ratio() {
        let mut config = PipelineConfig::default();
        config.limits.max_expansion_ratio = 0.5;
        assert!(config.validate().unwrap_err().contains("max_expansion_ratio"));
    }

    #[test]
    fn validate_rejects_inverted_watermarks() {
        let mut config = PipelineConfig::default();
        config.heap.low_water_bytes = config.heap.high_water_bytes + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn invalid_toml_is_config_error() {
        let err = PipelineConfig::from_toml_str("[limits]\nmax_pass_instructions = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
        let err = PipelineConfig::from_toml_str("limits = 3").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
