//! Custom error types for the application.
//!
//! This module defines the primary error type, `ScanlogError`, for the whole crate.
//! Using the `thiserror` crate, it gives one consistent way to report everything that
//! can go wrong between the serial line and the log file.
//!
//! ## Error Hierarchy
//!
//! - **`Framing`**: malformed input on the line. Never fatal; the ingestion loop reports it
//!   as an event and keeps reading.
//! - **`DeviceDisconnected`**: the link reported EOF or a hard read error. Ingestion stops.
//! - **`Persistence`**: the log file could not be opened, scanned or written. Ingestion stops
//!   rather than risk accepting a duplicate because an earlier append was lost.
//! - **`NoLinkAvailable`**: port discovery found no device matching the configured keywords.
//! - **`Config`** / **`Configuration`**: figment extraction errors and semantic validation
//!   errors respectively.
//!
//! By using `#[from]`, `ScanlogError` can be created from the underlying error types with `?`.

use crate::framing::FramingError;
use std::path::PathBuf;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, ScanlogError>;

/// Errors produced by the ingestion pipeline and its collaborators.
#[derive(Error, Debug)]
pub enum ScanlogError {
    /// Figment could not extract the configuration.
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// The configuration parsed but holds an invalid value.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// A frame could not be assembled from the byte stream.
    #[error("Framing error: {0}")]
    Framing(#[from] FramingError),

    /// The serial link is gone.
    #[error("Device disconnected: {0}")]
    DeviceDisconnected(String),

    /// The record log could not be read or written.
    #[error("Persistence failure on '{}': {source}", .path.display())]
    Persistence {
        /// Log file involved in the failure.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A record could not be encoded as a CSV row.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Device discovery found nothing to open.
    #[error("No serial device found matching keywords {keywords:?}")]
    NoLinkAvailable {
        /// Keywords that were searched for.
        keywords: Vec<String>,
    },

    /// The serial port could not be opened or enumerated.
    #[error("Serial port error: {0}")]
    Serial(String),

    /// The store refused an append after an earlier write failed.
    #[error("Record log '{}' is unusable after a failed write", .0.display())]
    StorePoisoned(PathBuf),

    /// The ingestion task ended without producing a result.
    #[error("Ingestion task failed: {0}")]
    TaskFailed(String),

    /// Serial support was compiled out.
    #[error("Serial support not enabled. Rebuild with --features instrument_serial")]
    SerialFeatureDisabled,
}

impl ScanlogError {
    /// Build a persistence error for `path`.
    pub fn persistence(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Persistence {
            path: path.into(),
            source,
        }
    }

    /// Whether this error must stop ingestion.
    ///
    /// Framing errors cost one frame; everything else stops the read loop.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ScanlogError::Framing(_))
    }
}
