//! Settings management.
//!
//! Settings are loaded from a TOML file and may be overridden from the
//! environment with the `VME_DAQ_` prefix, nested keys separated by `__`:
//!
//! ```text
//! VME_DAQ_LOG_LEVEL=debug
//! VME_DAQ_POOL__BUFFER_COUNT=32
//! VME_DAQ_READOUT__READ_TIMEOUT_MS=250
//! ```

use crate::logging::OutputFormat;
use daq_core::listfile::SECTION_MAX_BYTES;
use daq_core::{validate_triggers, ControllerKind, DaqError, DaqResult, EventConfig, StackMap};
use daq_readout::{ListfileSetup, ReadoutSettings, RunSetup};
use daq_storage::ListfileFormat;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "VME_DAQ";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_format: OutputFormat,
    pub controller: ControllerKind,
    #[serde(default)]
    pub pool: PoolSettings,
    #[serde(default)]
    pub readout: ReadoutConfig,
    #[serde(default)]
    pub listfile: ListfileSettings,
    #[serde(default)]
    pub events: Vec<EventConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    pub buffer_count: usize,
    /// Capacity of each pool buffer in bytes.
    pub buffer_size: usize,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            buffer_count: 10,
            buffer_size: 1024 * 1024,
        }
    }
}

/// Readout loop timing. Converted into [`ReadoutSettings`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadoutConfig {
    pub read_buffer_size: usize,
    pub read_timeout_ms: u64,
    pub drain_timeout_ms: u64,
    pub acquire_timeout_ms: u64,
    pub error_log_interval_secs: u64,
    /// 0 disables timetick sections.
    pub timetick_interval_ms: u64,
    pub health_warning_threshold: u64,
    pub vmusb_header_words: usize,
}

impl Default for ReadoutConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: 256 * 1024,
            read_timeout_ms: 500,
            drain_timeout_ms: 100,
            acquire_timeout_ms: 250,
            error_log_interval_secs: 5,
            timetick_interval_ms: 1000,
            health_warning_threshold: 100,
            vmusb_header_words: 1,
        }
    }
}

impl ReadoutConfig {
    pub fn to_settings(&self) -> ReadoutSettings {
        ReadoutSettings {
            read_buffer_size: self.read_buffer_size,
            read_timeout: Duration::from_millis(self.read_timeout_ms),
            drain_timeout: Duration::from_millis(self.drain_timeout_ms),
            acquire_timeout: Duration::from_millis(self.acquire_timeout_ms),
            error_log_interval: Duration::from_secs(self.error_log_interval_secs),
            timetick_interval: (self.timetick_interval_ms > 0)
                .then(|| Duration::from_millis(self.timetick_interval_ms)),
            health_warning_threshold: self.health_warning_threshold,
            vmusb_header_words: self.vmusb_header_words,
            max_cycles: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListfileSettings {
    pub enabled: bool,
    pub output_dir: PathBuf,
    /// Base name; a timestamp is appended for each run.
    pub run_name: String,
    pub format: ListfileFormat,
    /// Deflate level for zip archives (`None` = library default).
    pub compression_level: Option<i64>,
}

impl Default for ListfileSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            output_dir: PathBuf::from("listfiles"),
            run_name: "run".to_string(),
            format: ListfileFormat::Zip,
            compression_level: Some(1),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Settings {
    /// Load `path` plus environment overrides, then validate.
    pub fn load(path: &Path) -> DaqResult<Self> {
        let settings: Settings = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Parse settings from a TOML string without environment overrides.
    pub fn from_toml(text: &str) -> DaqResult<Self> {
        let settings: Settings = config::Config::builder()
            .add_source(config::File::from_str(text, config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> DaqResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.pool.buffer_count == 0 {
            return Err(DaqError::Configuration(
                "pool.buffer_count must be at least 1".to_string(),
            ));
        }
        for (name, size) in [
            ("pool.buffer_size", self.pool.buffer_size),
            ("readout.read_buffer_size", self.readout.read_buffer_size),
        ] {
            if size == 0 || size % 4 != 0 {
                return Err(DaqError::Configuration(format!(
                    "{} must be a non-zero multiple of 4, got {}",
                    name, size
                )));
            }
        }
        // Normalized output carries section and module headers the raw
        // VMUSB data does not; 16-bit event headers grow to 32-bit ones.
        if self.pool.buffer_size < 3 * self.readout.read_buffer_size {
            return Err(DaqError::Configuration(format!(
                "pool.buffer_size ({}) must be at least three times readout.read_buffer_size ({})",
                self.pool.buffer_size, self.readout.read_buffer_size
            )));
        }
        if self.pool.buffer_size > SECTION_MAX_BYTES {
            return Err(DaqError::Configuration(format!(
                "pool.buffer_size ({}) exceeds the largest listfile section ({} bytes)",
                self.pool.buffer_size, SECTION_MAX_BYTES
            )));
        }
        if !(1..=2).contains(&self.readout.vmusb_header_words) {
            return Err(DaqError::Configuration(format!(
                "readout.vmusb_header_words must be 1 or 2, got {}",
                self.readout.vmusb_header_words
            )));
        }
        if let Some(level) = self.listfile.compression_level {
            if !(0..=9).contains(&level) {
                return Err(DaqError::Configuration(format!(
                    "Invalid listfile.compression_level {}. Must be 0-9",
                    level
                )));
            }
        }
        if self.listfile.run_name.trim().is_empty() {
            return Err(DaqError::Configuration(
                "listfile.run_name must not be empty".to_string(),
            ));
        }

        validate_triggers(&self.events)?;
        StackMap::build(self.controller, &self.events)?;
        Ok(())
    }

    /// Run setup for a run starting now. The serialized event list is
    /// stored in the listfile's config sections.
    pub fn run_setup(&self) -> DaqResult<RunSetup> {
        let run_name = format!(
            "{}_{}",
            self.listfile.run_name,
            chrono::Local::now().format("%y%m%d_%H%M%S")
        );
        let config = serde_json::to_vec_pretty(&self.events)
            .map_err(|e| DaqError::Configuration(format!("Cannot serialize events: {}", e)))?;
        let listfile = self.listfile.enabled.then(|| ListfileSetup {
            path: self
                .listfile
                .output_dir
                .join(&run_name)
                .with_extension(self.listfile.format.extension()),
            format: self.listfile.format,
            compression_level: self.listfile.compression_level,
        });

        Ok(RunSetup {
            run_name,
            events: self.events.clone(),
            listfile,
            config,
            ..RunSetup::default()
        })
    }
}
