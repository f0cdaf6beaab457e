//! Record model, duplicate index and durable storage.
pub mod dedup;
pub mod record;
pub mod storage;

pub use dedup::DedupIndex;
pub use record::{Record, TIMESTAMP_FORMAT};
pub use storage::{scan_file, LogLayout, RecordStore, ScanOutcome};
