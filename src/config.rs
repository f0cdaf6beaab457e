//! Configuration using Figment.
//!
//! Configuration is layered:
//! 1. Built-in defaults (every field has one, so no file is required)
//! 2. A TOML file, `config/scanlog.toml` unless another path is given
//! 3. Environment variables prefixed with `SCANLOG_`, nested keys separated by `__`
//!
//! # Example
//! ```no_run
//! use scanlog::config::AppConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = AppConfig::load()?;
//! config.validate()?;
//! println!("Writing to {}", config.storage.output_dir.display());
//! # Ok(())
//! # }
//! ```
//!
//! `SCANLOG_SERIAL__PORT=/dev/ttyACM0` overrides `serial.port`.

use crate::data::LogLayout;
use crate::discovery::DEFAULT_KEYWORDS;
use crate::error::{AppResult, ScanlogError};
use crate::ingest::IngestSettings;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/scanlog.toml";

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "SCANLOG_";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Scanner link settings
    pub serial: SerialConfig,
    /// Record log settings
    pub storage: StorageConfig,
    /// Observer channel settings
    pub events: EventsConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    pub log_format: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "scanlog".to_string(),
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

/// Scanner link configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Explicit port path; when set, discovery is skipped
    pub port: Option<String>,
    /// Bit rate
    pub baud_rate: u32,
    /// Read timeout in milliseconds
    pub read_timeout_ms: u64,
    /// Frame delimiter, exactly one byte
    pub delimiter: String,
    /// Largest accepted frame in bytes
    pub max_frame_len: usize,
    /// Keywords matched against port descriptions during discovery
    pub match_keywords: Vec<String>,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: crate::serial::DEFAULT_BAUD_RATE,
            read_timeout_ms: 100,
            delimiter: "\r".to_string(),
            max_frame_len: crate::framing::DEFAULT_MAX_FRAME_LEN,
            match_keywords: DEFAULT_KEYWORDS.iter().map(|k| k.to_string()).collect(),
        }
    }
}

/// Record log configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding the daily logs
    pub output_dir: PathBuf,
    /// File name after the `YYYYMMDD_` date prefix
    pub file_suffix: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("."),
            file_suffix: "scanlog.csv".to_string(),
        }
    }
}

/// Event channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Events buffered per observer
    pub channel_capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
        }
    }
}

/// Largest accepted `channel_capacity`; each observer buffers this many events.
pub const MAX_CHANNEL_CAPACITY: usize = 1 << 16;

const VALID_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
const VALID_FORMATS: [&str; 3] = ["pretty", "compact", "json"];

impl AppConfig {
    /// Load configuration from `config/scanlog.toml` and environment variables
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path. A missing file yields the defaults.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
    }

    /// Load from `path` (or the default location) and validate.
    pub fn load_validated(path: Option<&Path>) -> AppResult<Self> {
        let config = match path {
            Some(path) => Self::load_from(path)?,
            None => Self::load()?,
        };
        config.validate().map_err(ScanlogError::Configuration)?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        let level = self.application.log_level.to_lowercase();
        if !VALID_LEVELS.contains(&level.as_str()) {
            return Err(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                VALID_LEVELS.join(", ")
            ));
        }

        let format = self.application.log_format.to_lowercase();
        if !VALID_FORMATS.contains(&format.as_str()) {
            return Err(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                VALID_FORMATS.join(", ")
            ));
        }

        self.delimiter_byte()?;

        if self.serial.baud_rate == 0 {
            return Err("baud_rate must be greater than zero".to_string());
        }
        if self.serial.read_timeout_ms == 0 {
            return Err("read_timeout_ms must be greater than zero".to_string());
        }
        if self.serial.max_frame_len == 0 {
            return Err("max_frame_len must be greater than zero".to_string());
        }
        let capacity = self.events.channel_capacity;
        if capacity == 0 || capacity > MAX_CHANNEL_CAPACITY {
            return Err(format!(
                "Invalid channel_capacity {capacity}. Must be 1-{MAX_CHANNEL_CAPACITY}"
            ));
        }

        let suffix = &self.storage.file_suffix;
        if suffix.is_empty() {
            return Err("file_suffix must not be empty".to_string());
        }
        if suffix.contains('/') || suffix.contains('\\') {
            return Err(format!(
                "Invalid file_suffix '{suffix}'. Must not contain a path separator"
            ));
        }

        if self.serial.port.is_none() && self.serial.match_keywords.iter().all(String::is_empty) {
            return Err("match_keywords must not be empty when no port is configured".to_string());
        }

        Ok(())
    }

    /// The delimiter as a single byte.
    pub fn delimiter_byte(&self) -> Result<u8, String> {
        match self.serial.delimiter.as_bytes() {
            [byte] => Ok(*byte),
            _ => Err(format!(
                "Invalid delimiter {:?}. Must be exactly one byte",
                self.serial.delimiter
            )),
        }
    }

    /// Read loop settings derived from the `[serial]` and `[events]` sections.
    pub fn ingest_settings(&self) -> AppResult<IngestSettings> {
        Ok(IngestSettings {
            read_timeout: Duration::from_millis(self.serial.read_timeout_ms),
            delimiter: self.delimiter_byte().map_err(ScanlogError::Configuration)?,
            max_frame_len: self.serial.max_frame_len,
            channel_capacity: self.events.channel_capacity,
        })
    }

    /// Where the daily logs live.
    pub fn log_layout(&self) -> LogLayout {
        LogLayout::new(&self.storage.output_dir, &self.storage.file_suffix)
    }
}
