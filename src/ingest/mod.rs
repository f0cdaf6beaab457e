//! Ingestion: the read loop and the events it publishes.

pub mod controller;
pub mod events;

pub use controller::{
    ControllerState, IngestSettings, IngestSummary, IngestionController, IngestionHandle,
    StopHandle, StopReason,
};
pub use events::{spawn_observer, IngestEvent, IngestObserver};
