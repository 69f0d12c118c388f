//! TOML configuration for the streamwarden engine.
//!
//! A layered configuration model: an explicit path, then the
//! `STREAMWARDEN_CONFIG` environment variable, then the standard system
//! location, then compiled-in defaults. Every section falls back to its
//! defaults when omitted so partial files are valid.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::model::feature::Feature;

/// Environment variable naming an alternative config file.
pub const CONFIG_ENV_VAR: &str = "STREAMWARDEN_CONFIG";

/// Standard system location of the config file.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/streamwarden/streamwarden.toml";

/// Minimum periodic persist interval, and the amount it grows by each time a
/// periodic checkpoint finds the previous one still running.
pub const PERSIST_INTERVAL_INCREMENT_SECS: i64 = 300;

/// Longest permitted bucket: one year.
pub const MAX_BUCKET_LENGTH_SECS: i64 = 366 * 86_400;

/// Longest permitted latency window, about 35 thousand years.
pub const MAX_LATENCY_SECS: i64 = 1 << 40;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("bucket length must be between one second and one year, got {0}")]
    InvalidBucketLength(i64),
    #[error("latency of {0} buckets is too long")]
    InvalidLatency(u32),
    #[error("detector {index} uses function {function:?} which needs a field_name")]
    MissingFieldName { index: usize, function: DetectorFunction },
    #[error("creation chunk size must be positive")]
    InvalidChunkSize,
    #[error("invalid config update: {0}")]
    InvalidUpdate(String),
}

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration for an analytics job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub bucket: BucketConfig,
    #[serde(default)]
    pub detectors: Vec<DetectorConfig>,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub correlation: CorrelationConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl EngineConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config = Self::from_toml(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), detectors = config.detectors.len(), "loaded engine configuration");
        Ok(config)
    }

    /// Parse and validate configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Render as TOML.
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Try to load configuration from, in order:
    /// 1. `explicit`, when given.
    /// 2. The path in the `STREAMWARDEN_CONFIG` environment variable.
    /// 3. `/etc/streamwarden/streamwarden.toml`.
    /// 4. Compiled-in defaults.
    pub fn load_or_default(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            // An explicitly requested file must load.
            return Self::load(path);
        }

        if let Ok(env_path) = std::env::var(CONFIG_ENV_VAR) {
            let path = PathBuf::from(&env_path);
            match Self::load(&path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "STREAMWARDEN_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Ok(Self::default())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=MAX_BUCKET_LENGTH_SECS).contains(&self.bucket.length_secs) {
            return Err(ConfigError::InvalidBucketLength(self.bucket.length_secs));
        }
        if self.latency_secs() > MAX_LATENCY_SECS {
            return Err(ConfigError::InvalidLatency(self.bucket.latency_buckets));
        }
        for (index, detector) in self.detectors.iter().enumerate() {
            if detector.function.is_metric() && detector.field_name.is_none() {
                return Err(ConfigError::MissingFieldName {
                    index,
                    function: detector.function,
                });
            }
        }
        if self.limits.creation_chunk_size == 0 {
            return Err(ConfigError::InvalidChunkSize);
        }
        Ok(())
    }

    /// Latency window in seconds.
    pub fn latency_secs(&self) -> i64 {
        self.bucket
            .length_secs
            .saturating_mul(self.bucket.latency_buckets as i64)
    }

    /// Apply a runtime update received through the `u` control message.
    ///
    /// Either every key is applied or none is.
    pub fn apply_update(&mut self, json: &str) -> Result<(), ConfigError> {
        let update: ConfigUpdate =
            serde_json::from_str(json).map_err(|e| ConfigError::InvalidUpdate(e.to_string()))?;

        let mut next = self.clone();
        if let Some(window) = update.prune_window_buckets {
            next.model.prune_window_buckets = window;
        }
        if let Some(rate) = update.decay_rate {
            if !(rate.is_finite() && rate >= 0.0) {
                return Err(ConfigError::InvalidUpdate(format!("decay_rate {rate}")));
            }
            next.model.decay_rate = rate;
        }
        if let Some(max) = update.max_correlations {
            next.correlation.max_correlations = max;
        }
        if let Some(min) = update.min_significant_correlation {
            if !(0.0..=1.0).contains(&min) {
                return Err(ConfigError::InvalidUpdate(format!(
                    "min_significant_correlation {min}"
                )));
            }
            next.correlation.min_significant_correlation = min;
        }
        if let Some(latency) = update.latency_buckets {
            next.bucket.latency_buckets = latency;
        }
        next.validate()?;
        *self = next;
        Ok(())
    }
}

/// Keys accepted by a runtime config update.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigUpdate {
    pub prune_window_buckets: Option<u64>,
    pub decay_rate: Option<f64>,
    pub max_correlations: Option<usize>,
    pub min_significant_correlation: Option<f64>,
    pub latency_buckets: Option<u32>,
}

// ---------------------------------------------------------------------------
// Buckets
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BucketConfig {
    /// Bucket length in seconds.
    pub length_secs: i64,
    /// Number of buckets a record may arrive late and still be counted.
    pub latency_buckets: u32,
    /// Name of the record field carrying the event time.
    pub time_field: String,
    /// chrono strftime format of the time field. Absent means integer epoch
    /// seconds.
    pub time_format: Option<String>,
    /// Fast-forward over the gap between restored state and the first record.
    pub ignore_downtime: bool,
    /// A jump in time over more than this many buckets closes only the
    /// buckets that may hold data and treats the rest as downtime. Zero
    /// closes every bucket however long the gap.
    pub max_gap_buckets: u64,
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self {
            length_secs: 300,
            latency_buckets: 0,
            time_field: "_time".to_string(),
            time_format: None,
            ignore_downtime: false,
            max_gap_buckets: 100_000,
        }
    }
}

// ---------------------------------------------------------------------------
// Detectors
// ---------------------------------------------------------------------------

/// Aggregation function of a detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorFunction {
    Count,
    Mean,
    Sum,
    Min,
    Max,
}

impl DetectorFunction {
    pub fn is_metric(self) -> bool {
        !matches!(self, DetectorFunction::Count)
    }
}

/// One configured detector. Its 1-based position is its search key id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorConfig {
    pub function: DetectorFunction,
    #[serde(default)]
    pub field_name: Option<String>,
    /// Population analysis: model each value of this field inside the entity.
    #[serde(default)]
    pub over_field: Option<String>,
    /// Split the detector into one entity per value of this field.
    #[serde(default)]
    pub partition_field: Option<String>,
}

impl DetectorConfig {
    pub fn feature(&self) -> Feature {
        Feature::for_function(self.function, self.over_field.is_some())
    }

    pub fn description(&self) -> String {
        let mut out = match (&self.field_name, self.function) {
            (Some(field), f) if f.is_metric() => format!("{:?}({})", f, field).to_lowercase(),
            _ => "count".to_string(),
        };
        if let Some(over) = &self.over_field {
            out.push_str(&format!(" over {over}"));
        }
        if let Some(partition) = &self.partition_field {
            out.push_str(&format!(" partitionfield={partition}"));
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Base forgetting rate of priors and trends, per bucket.
    pub decay_rate: f64,
    /// Weight given to each bucket's sample.
    pub learn_rate: f64,
    /// Buckets of inactivity after which an entity's heavy state is pruned.
    pub prune_window_buckets: u64,
    /// Further buckets of inactivity after which a pruned entity's key is
    /// evicted and its slot freed for reuse. Zero keeps keys forever.
    pub eviction_window_buckets: u64,
    /// Adapt decay rates from prediction residuals.
    pub control_decay_rate: bool,
    /// Decay interval multiplier applied to brand new entities.
    pub initial_decay_rate_multiplier: f64,
    /// Period of the seasonal component tested by trends.
    pub seasonal_period_secs: i64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            decay_rate: 0.0005,
            learn_rate: 1.0,
            prune_window_buckets: 1000,
            eviction_window_buckets: 10_000,
            control_decay_rate: true,
            initial_decay_rate_multiplier: 4.0,
            seasonal_period_secs: 86_400,
        }
    }
}

// ---------------------------------------------------------------------------
// Correlation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelationConfig {
    pub enabled: bool,
    /// Maximum number of correlated pairs modelled per feature.
    pub max_correlations: usize,
    /// Cap on correlated pairs as a multiple of the entity count.
    pub models_overhead: f64,
    /// Coefficients below half of this are never modelled.
    pub min_significant_correlation: f64,
    /// Refresh the modelled pairs every this many buckets.
    pub refresh_every_buckets: u32,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_correlations: 5000,
            models_overhead: 10.0,
            min_significant_correlation: 0.3,
            refresh_every_buckets: 1,
        }
    }
}

// ---------------------------------------------------------------------------
// Limits
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Model memory limit in MiB. Zero disables the limit.
    pub memory_limit_mb: u64,
    /// Models are created in chunks of this many when a burst of new
    /// entities arrives.
    pub creation_chunk_size: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            memory_limit_mb: 4096,
            creation_chunk_size: 500,
        }
    }
}

impl LimitsConfig {
    pub fn memory_limit_bytes(&self) -> Option<usize> {
        match self.memory_limit_mb {
            0 => None,
            mb => Some((mb as usize).saturating_mul(1024 * 1024)),
        }
    }
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// SQLite database holding model snapshots.
    pub state_db: PathBuf,
    /// Seconds between periodic background checkpoints. Zero disables them.
    pub periodic_interval_secs: i64,
    /// Growth of the periodic interval each time the sink is found busy.
    pub interval_increment_secs: i64,
    /// Snapshots kept in the database after a run. Zero keeps all of them.
    pub keep_snapshots: usize,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            state_db: PathBuf::from("data/streamwarden.db"),
            periodic_interval_secs: 10_800,
            interval_increment_secs: PERSIST_INTERVAL_INCREMENT_SECS,
            keep_snapshots: 20,
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level (`trace`, `debug`, `info`, `warn`, `error`).
    pub level: String,
    /// Emit log lines as JSON.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
