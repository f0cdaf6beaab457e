//! Events published by the ingestion loop and the observer side of the hand-off.
//!
//! The loop publishes on a `tokio::sync::broadcast` channel. Sending never waits
//! for receivers, so a slow display cannot stall ingestion; a receiver that falls
//! more than the channel capacity behind loses the oldest events and is told how
//! many it missed.

use crate::data::Record;
use crate::framing::FramingError;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Something observers may want to show.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestEvent {
    /// A new payload was durably stored.
    Accepted(Record),
    /// A payload that is already stored arrived again. Nothing was written.
    DuplicateSeen(String),
    /// Input was discarded; ingestion continues.
    FramingError(FramingError),
    /// Ingestion stopped because of an unrecoverable problem. Sent at most once.
    Fatal(String),
}

/// Receives ingestion events, in order, on a task separate from the read loop.
pub trait IngestObserver: Send + 'static {
    /// A record was appended to the log.
    fn on_accepted(&mut self, record: &Record);

    /// `payload` was already in the log.
    fn on_duplicate(&mut self, payload: &str);

    /// A frame was discarded.
    fn on_framing_error(&mut self, error: &FramingError) {
        let _ = error;
    }

    /// Ingestion has stopped for `reason`.
    fn on_fatal_error(&mut self, reason: &str);
}

/// Drive `observer` from `rx` until the sending side closes, then hand it back.
pub fn spawn_observer<O: IngestObserver>(
    mut rx: broadcast::Receiver<IngestEvent>,
    mut observer: O,
) -> JoinHandle<O> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => dispatch(&mut observer, &event),
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "Observer fell behind; events dropped");
                }
                Err(RecvError::Closed) => break,
            }
        }
        debug!("Observer channel closed");
        observer
    })
}

fn dispatch<O: IngestObserver>(observer: &mut O, event: &IngestEvent) {
    match event {
        IngestEvent::Accepted(record) => observer.on_accepted(record),
        IngestEvent::DuplicateSeen(payload) => observer.on_duplicate(payload),
        IngestEvent::FramingError(error) => observer.on_framing_error(error),
        IngestEvent::Fatal(reason) => observer.on_fatal_error(reason),
    }
}
