//! # scanlog
//!
//! Ingests framed text messages from a serial barcode scanner, drops anything
//! that was already stored, and appends every new message with a timestamp to a
//! daily CSV log. The library holds the whole pipeline so the CLI (`main.rs`) stays
//! thin and the pipeline can be driven from tests over an in-memory link.
//!
//! ## Crate Structure
//!
//! - **`framing`**: `FrameAssembler`, turning the raw byte stream into delimited frames.
//! - **`data`**: the `Record` value, the `DedupIndex` of stored payloads and the
//!   append-only `RecordStore`.
//! - **`ingest`**: `IngestionController`, the read loop tying the pieces together,
//!   and the `IngestEvent`s it publishes to observers.
//! - **`serial`**: the `DeviceLink` abstraction and async serial port opening.
//! - **`discovery`**: picks the scanner's port by its device description.
//! - **`clock`**: the timestamp source, swappable in tests.
//! - **`config`**: Figment-based configuration (`AppConfig`).
//! - **`logging`**: tracing subscriber setup.
//! - **`error`**: the crate-wide `ScanlogError`.

pub mod clock;
pub mod config;
pub mod data;
pub mod discovery;
pub mod error;
pub mod framing;
pub mod ingest;
pub mod logging;
pub mod serial;

pub use error::{AppResult, ScanlogError};
