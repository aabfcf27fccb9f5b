//! Engine configuration.
//!
//! Loaded from TOML, then overridden by `NACRE_*` environment variables.
//! Every field has a default so an empty file (or no file) is valid.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error reading config at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("config parse failed at {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid value for {var}: {value:?}")]
    InvalidEnvValue { var: &'static str, value: String },
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub apply: ApplyConfig,
    pub sweep: SweepSettings,
}

/// Knobs for the log application pipeline.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplyConfig {
    /// Applier lane count. 0 means one lane per available core.
    pub writer_threads: usize,
    /// Batch termination: entry count.
    pub batch_max_ops: usize,
    /// Batch termination: aggregate encoded bytes. A single oversized
    /// entry still forms a batch of one.
    pub batch_max_bytes: usize,
    /// Hold back entries younger than this many wall-clock seconds.
    /// 0 disables delayed application.
    pub slave_delay_secs: u64,
    /// Single-op applications slower than this are logged.
    pub slow_op_ms: u64,
    /// Base pacing unit for missing-document fetch retries; attempt `n`
    /// sleeps `n^2` of these.
    pub fetch_retry_base_ms: u64,
}

impl Default for ApplyConfig {
    fn default() -> Self {
        Self {
            writer_threads: 0,
            batch_max_ops: 5_000,
            batch_max_bytes: 100 * 1024 * 1024,
            slave_delay_secs: 0,
            slow_op_ms: 100,
            fetch_retry_base_ms: 1_000,
        }
    }
}

impl ApplyConfig {
    pub fn effective_writer_threads(&self) -> usize {
        if self.writer_threads != 0 {
            return self.writer_threads;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }

    pub fn slave_delay(&self) -> Duration {
        Duration::from_secs(self.slave_delay_secs)
    }
}

/// Knobs for the storage handle sweeper.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepSettings {
    /// Handles idle longer than this are eligible to close. 0 disables
    /// idle-based closing entirely.
    pub close_idle_time_secs: u64,
    /// How often the data handles are scanned.
    pub close_scan_interval_secs: u64,
    /// Never close below this many open handles.
    pub close_handle_minimum: usize,
    /// Timing stress for tests: divides the scan interval by 10.
    pub aggressive: bool,
}

impl Default for SweepSettings {
    fn default() -> Self {
        Self {
            close_idle_time_secs: 250,
            close_scan_interval_secs: 10,
            close_handle_minimum: 250,
            aggressive: false,
        }
    }
}

impl SweepSettings {
    /// Ephemeral engines keep every handle in memory anyway, so idle-based
    /// closing is forced off for them.
    pub fn for_engine(mut self, ephemeral: bool) -> Self {
        if ephemeral {
            self.close_idle_time_secs = 0;
        }
        self
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Config = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Missing file is not an error; defaults apply.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            let mut config = Config::default();
            config.apply_env_overrides()?;
            return Ok(config);
        }
        Self::load(path)
    }

    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        override_usize("NACRE_WRITER_THREADS", &mut self.apply.writer_threads)?;
        override_usize("NACRE_BATCH_MAX_OPS", &mut self.apply.batch_max_ops)?;
        override_usize("NACRE_BATCH_MAX_BYTES", &mut self.apply.batch_max_bytes)?;
        override_u64("NACRE_SLAVE_DELAY_SECS", &mut self.apply.slave_delay_secs)?;
        override_u64(
            "NACRE_SWEEP_IDLE_SECS",
            &mut self.sweep.close_idle_time_secs,
        )?;
        override_u64(
            "NACRE_SWEEP_INTERVAL_SECS",
            &mut self.sweep.close_scan_interval_secs,
        )?;
        override_usize(
            "NACRE_SWEEP_HANDLE_MINIMUM",
            &mut self.sweep.close_handle_minimum,
        )?;
        Ok(())
    }
}

fn override_u64(var: &'static str, slot: &mut u64) -> Result<(), ConfigError> {
    if let Ok(value) = std::env::var(var) {
        *slot = value
            .parse()
            .map_err(|_| ConfigError::InvalidEnvValue { var, value })?;
    }
    Ok(())
}

fn override_usize(var: &'static str, slot: &mut usize) -> Result<(), ConfigError> {
    if let Ok(value) = std::env::var(var) {
        *slot = value
            .parse()
            .map_err(|_| ConfigError::InvalidEnvValue { var, value })?;
    }
    Ok(())
}
