//! The ingestion read loop.
//!
//! [`IngestionController`] owns the record log, the duplicate index and the frame
//! assembler. [`IngestionController::start`] moves all of it onto a tokio task
//! together with the device link:
//!
//! ```text
//! link.read ─► FrameAssembler ─► DedupIndex::contains?
//!                                   ├─ no  ─► RecordStore::append ─► DedupIndex::add ─► Accepted
//!                                   └─ yes ─► DuplicateSeen
//! ```
//!
//! Store and index are only ever touched by that one task, so they need no locks.
//! Stopping is cooperative: the stop signal is raced against the pending read,
//! the read future is dropped (tokio reads are cancel-safe), the link is closed,
//! and any partial frame is discarded. An append that has started always finishes
//! before the signal is looked at again.
//!
//! # Example
//!
//! ```rust,ignore
//! let store = RecordStore::open_for_day(&layout, today)?;
//! let controller = IngestionController::new(store, IngestSettings::default())?;
//! let mut events = controller.subscribe();
//! let handle = controller.start(open_serial_async("/dev/ttyACM0", 9600, "scanner").await?);
//! // ...
//! let summary = handle.stop().await?;
//! ```

use super::events::IngestEvent;
use crate::clock::{Clock, SystemClock};
use crate::config::MAX_CHANNEL_CAPACITY;
use crate::data::{DedupIndex, Record, RecordStore};
use crate::error::{AppResult, ScanlogError};
use crate::framing::{
    Frame, FrameAssembler, FramingError, DEFAULT_DELIMITER, DEFAULT_MAX_FRAME_LEN,
};
use crate::serial::DeviceLink;
use chrono::NaiveDateTime;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Bytes requested from the link per read.
const READ_CHUNK_LEN: usize = 256;

/// Tunables for one ingestion session.
#[derive(Debug, Clone)]
pub struct IngestSettings {
    /// Upper bound on a single read; expiry just means the scanner is idle.
    pub read_timeout: Duration,
    /// Frame boundary byte.
    pub delimiter: u8,
    /// Largest frame accepted before the buffer is discarded.
    pub max_frame_len: usize,
    /// Events buffered per observer before the slowest one starts losing events.
    pub channel_capacity: usize,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_millis(100),
            delimiter: DEFAULT_DELIMITER,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            channel_capacity: 1024,
        }
    }
}

/// Lifecycle of a controller. `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    /// Hydrated, not reading yet.
    Idle,
    /// Read loop active.
    Running,
    /// Shutting down; no more frames are processed.
    Stopping,
    /// Link and log closed.
    Stopped,
}

/// Why the read loop ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// `stop()` was called (or every stop handle was dropped).
    Requested,
    /// The device link reported end of stream or a hard read error.
    Disconnected,
}

/// Counts for a finished session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestSummary {
    /// Records appended.
    pub accepted: u64,
    /// Frames rejected as already stored.
    pub duplicates: u64,
    /// Frames discarded by the assembler.
    pub framing_errors: u64,
    /// How the session ended.
    pub stop_reason: StopReason,
}

#[derive(Debug, Default)]
struct Counters {
    accepted: u64,
    duplicates: u64,
    framing_errors: u64,
}

impl Counters {
    fn summary(&self, stop_reason: StopReason) -> IngestSummary {
        IngestSummary {
            accepted: self.accepted,
            duplicates: self.duplicates,
            framing_errors: self.framing_errors,
            stop_reason,
        }
    }
}

enum ChunkFlow {
    Continue,
    StopRequested,
}

/// Orchestrates framing, duplicate detection and persistence for one link.
pub struct IngestionController {
    store: RecordStore,
    index: DedupIndex,
    assembler: FrameAssembler,
    settings: IngestSettings,
    clock: Arc<dyn Clock>,
    events: broadcast::Sender<IngestEvent>,
    state: watch::Sender<ControllerState>,
    last_timestamp: Option<NaiveDateTime>,
}

impl IngestionController {
    /// Build a controller around `store`, hydrating the duplicate index from it.
    ///
    /// Hydration completes before this returns, so no frame can be checked
    /// against a partially built index.
    ///
    /// # Errors
    ///
    /// [`ScanlogError::Persistence`] if the existing log cannot be read.
    pub fn new(store: RecordStore, settings: IngestSettings) -> AppResult<Self> {
        let existing = store.scan_all()?;

        let mut index = DedupIndex::new();
        index.hydrate(&existing);
        let last_timestamp = existing.iter().map(Record::timestamp).max();

        info!(
            path = %store.path().display(),
            records = existing.len(),
            distinct = index.len(),
            "Hydrated duplicate index"
        );

        let capacity = settings.channel_capacity.clamp(1, MAX_CHANNEL_CAPACITY);
        let (events, _) = broadcast::channel(capacity);
        let (state, _) = watch::channel(ControllerState::Idle);
        let assembler = FrameAssembler::new(settings.delimiter, settings.max_frame_len);

        Ok(Self {
            store,
            index,
            assembler,
            settings,
            clock: Arc::new(SystemClock),
            events,
            state,
            last_timestamp,
        })
    }

    /// Use `clock` for record timestamps.
    pub fn with_clock(mut self, clock: impl Clock) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Current lifecycle state; [`ControllerState::Idle`] until started.
    pub fn state(&self) -> ControllerState {
        *self.state.borrow()
    }

    /// The hydrated duplicate index.
    pub fn dedup_index(&self) -> &DedupIndex {
        &self.index
    }

    /// Path of the record log.
    pub fn store_path(&self) -> &Path {
        self.store.path()
    }

    /// Receive events from this controller.
    pub fn subscribe(&self) -> broadcast::Receiver<IngestEvent> {
        self.events.subscribe()
    }

    /// Start reading from `link` on a new tokio task.
    ///
    /// Consumes the controller: once stopped, a session cannot be resumed and a
    /// fresh controller must be built. Must be called from within a tokio runtime.
    pub fn start<L: DeviceLink + 'static>(self, link: L) -> IngestionHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        self.state.send_replace(ControllerState::Running);
        let state_rx = self.state.subscribe();
        let events = self.events.clone();
        let path = self.store.path().to_path_buf();

        let task = tokio::spawn(self.run(link, stop_rx));

        IngestionHandle {
            stop: StopHandle(Arc::new(stop_tx)),
            state: state_rx,
            events,
            path,
            task,
        }
    }

    async fn run<L: DeviceLink>(
        mut self,
        mut link: L,
        mut stop_rx: watch::Receiver<bool>,
    ) -> AppResult<IngestSummary> {
        info!(path = %self.store.path().display(), "Ingestion started");

        let mut counters = Counters::default();
        let mut buf = vec![0u8; READ_CHUNK_LEN];
        let read_timeout = self.settings.read_timeout;

        let outcome: AppResult<StopReason> = loop {
            if *stop_rx.borrow_and_update() {
                break Ok(StopReason::Requested);
            }

            let read = tokio::select! {
                biased;
                changed = stop_rx.changed() => {
                    if changed.is_err() {
                        debug!("All stop handles dropped");
                        break Ok(StopReason::Requested);
                    }
                    continue;
                }
                read = tokio::time::timeout(read_timeout, link.read(&mut buf)) => read,
            };

            let n = match read {
                Err(_elapsed) => continue,
                Ok(Ok(0)) => {
                    break Err(ScanlogError::DeviceDisconnected(
                        "link reported end of stream".into(),
                    ))
                }
                Ok(Ok(n)) => n,
                Ok(Err(e))
                    if matches!(
                        e.kind(),
                        ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
                    ) =>
                {
                    continue
                }
                Ok(Err(e)) => break Err(ScanlogError::DeviceDisconnected(e.to_string())),
            };

            trace!(bytes = n, "Read from link");
            match self.process_chunk(&buf[..n], &stop_rx, &mut counters) {
                Ok(ChunkFlow::Continue) => {}
                Ok(ChunkFlow::StopRequested) => break Ok(StopReason::Requested),
                Err(e) => break Err(e),
            }
        };

        self.state.send_replace(ControllerState::Stopping);

        drop(link);
        debug!("Device link closed");

        let pending = self.assembler.pending_len();
        if pending > 0 {
            debug!(pending, "Discarding partial frame");
        }
        self.assembler.reset();

        let result = match outcome {
            Ok(reason) => Ok(counters.summary(reason)),
            Err(ScanlogError::DeviceDisconnected(reason)) => {
                error!(%reason, "Device disconnected; ingestion stopped");
                self.publish(IngestEvent::Fatal(format!("device disconnected: {reason}")));
                Ok(counters.summary(StopReason::Disconnected))
            }
            Err(e) => {
                error!(error = %e, "Ingestion halted");
                self.publish(IngestEvent::Fatal(e.to_string()));
                Err(e)
            }
        };

        let closed = self.store.close();
        self.state.send_replace(ControllerState::Stopped);

        let summary = result?;
        closed?;
        info!(
            accepted = summary.accepted,
            duplicates = summary.duplicates,
            framing_errors = summary.framing_errors,
            reason = ?summary.stop_reason,
            "Ingestion stopped"
        );
        Ok(summary)
    }

    fn process_chunk(
        &mut self,
        chunk: &[u8],
        stop_rx: &watch::Receiver<bool>,
        counters: &mut Counters,
    ) -> AppResult<ChunkFlow> {
        for outcome in self.assembler.feed_chunk(chunk) {
            if *stop_rx.borrow() {
                return Ok(ChunkFlow::StopRequested);
            }
            match outcome {
                Ok(frame) => {
                    if let Err(e) = self.handle_frame(frame, counters) {
                        if e.is_fatal() {
                            return Err(e);
                        }
                        if let ScanlogError::Framing(e) = e {
                            self.framing_error(e, counters);
                        }
                    }
                }
                Err(e) => self.framing_error(e, counters),
            }
        }
        Ok(ChunkFlow::Continue)
    }

    fn framing_error(&self, error: FramingError, counters: &mut Counters) {
        counters.framing_errors += 1;
        self.publish(IngestEvent::FramingError(error));
    }

    fn handle_frame(&mut self, frame: Frame, counters: &mut Counters) -> AppResult<()> {
        let payload = frame.into_payload();

        if self.index.contains(&payload) {
            counters.duplicates += 1;
            info!(%payload, "Duplicate scan ignored");
            self.publish(IngestEvent::DuplicateSeen(payload));
            return Ok(());
        }

        let record = Record::new(self.next_timestamp(), payload);
        self.store.append(&record)?;
        self.index.add(record.payload());
        self.last_timestamp = Some(record.timestamp());
        counters.accepted += 1;

        info!(payload = record.payload(), "Scan stored");
        self.publish(IngestEvent::Accepted(record));
        Ok(())
    }

    /// Wall-clock time, held back to the last stored timestamp if the clock stepped backwards.
    fn next_timestamp(&self) -> NaiveDateTime {
        let now = self.clock.now();
        match self.last_timestamp {
            Some(last) if now < last => {
                warn!(%now, %last, "Clock went backwards; reusing last timestamp");
                last
            }
            _ => now,
        }
    }

    fn publish(&self, event: IngestEvent) {
        // No receivers is fine: nobody is watching.
        let _ = self.events.send(event);
    }
}

/// Cloneable way to request a stop from any task.
#[derive(Debug, Clone)]
pub struct StopHandle(Arc<watch::Sender<bool>>);

impl StopHandle {
    /// Ask the read loop to stop at its next iteration boundary.
    pub fn stop(&self) {
        self.0.send_replace(true);
    }
}

/// A running ingestion session.
///
/// Dropping the handle (and every [`StopHandle`] cloned from it) stops the session.
pub struct IngestionHandle {
    stop: StopHandle,
    state: watch::Receiver<ControllerState>,
    events: broadcast::Sender<IngestEvent>,
    path: PathBuf,
    task: JoinHandle<AppResult<IngestSummary>>,
}

impl IngestionHandle {
    /// A handle that can stop the session from another task.
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Receive events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<IngestEvent> {
        self.events.subscribe()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ControllerState {
        *self.state.borrow()
    }

    /// Path of the record log being written.
    pub fn store_path(&self) -> &Path {
        &self.path
    }

    /// Whether the read loop has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Request a stop and wait for the loop to wind down.
    pub async fn stop(self) -> AppResult<IngestSummary> {
        self.stop.stop();
        self.wait().await
    }

    /// Wait for the loop to end on its own (disconnect, fatal error, or a stop
    /// requested through a [`StopHandle`]).
    pub async fn wait(self) -> AppResult<IngestSummary> {
        let IngestionHandle { stop, task, .. } = self;
        let joined = task.await;
        drop(stop);
        joined.map_err(|e| ScanlogError::TaskFailed(e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::NaiveDate;
    use tempfile::tempdir;
    use tokio::io::AsyncWriteExt;
    use tokio::time::timeout;

    fn start_time() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2023, 3, 27)
            .and_then(|d| d.and_hms_opt(9, 0, 0))
            .unwrap()
    }

    async fn next_event(rx: &mut broadcast::Receiver<IngestEvent>) -> IngestEvent {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn controller_starts_idle_with_hydrated_index() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.csv");
        let mut store = RecordStore::open(&path).unwrap();
        store.append(&Record::new(start_time(), "A")).unwrap();

        let controller = IngestionController::new(store, IngestSettings::default()).unwrap();
        assert_eq!(controller.state(), ControllerState::Idle);
        assert!(controller.dedup_index().contains("A"));
        assert_eq!(controller.store_path(), path.as_path());
    }

    #[tokio::test]
    async fn oversized_channel_capacity_is_clamped() {
        let dir = tempdir().unwrap();
        let store = RecordStore::open(dir.path().join("log.csv")).unwrap();
        let settings = IngestSettings {
            channel_capacity: usize::MAX,
            ..IngestSettings::default()
        };
        let controller = IngestionController::new(store, settings).unwrap();
        let _rx = controller.subscribe();
        assert_eq!(controller.state(), ControllerState::Idle);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn failed_append_stops_with_one_fatal_event() {
        let full = Path::new("/dev/full");
        if !full.exists() {
            return;
        }
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.csv");
        let mut store = RecordStore::open(&path).unwrap();
        store.redirect_appends(std::fs::OpenOptions::new().write(true).open(full).unwrap());

        let controller = IngestionController::new(store, IngestSettings::default()).unwrap();
        let mut rx = controller.subscribe();

        let (mut host, device) = tokio::io::duplex(64);
        let handle = controller.start(device);
        host.write_all(b"A\rB\r").await.unwrap();

        let err = timeout(Duration::from_secs(2), handle.wait())
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, ScanlogError::Persistence { .. }));

        let mut events = Vec::new();
        while let Ok(event) = rx.recv().await {
            events.push(event);
        }
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], IngestEvent::Fatal(_)));
        assert!(crate::data::scan_file(&path).unwrap().records.is_empty());
    }

    #[tokio::test]
    async fn backwards_clock_does_not_reorder_timestamps() {
        let dir = tempdir().unwrap();
        let clock = ManualClock::new(start_time());
        let store = RecordStore::open(dir.path().join("log.csv")).unwrap();
        let controller = IngestionController::new(store, IngestSettings::default())
            .unwrap()
            .with_clock(clock.clone());
        let mut rx = controller.subscribe();

        let (mut host, device) = tokio::io::duplex(64);
        let handle = controller.start(device);

        host.write_all(b"A\r").await.unwrap();
        let first = next_event(&mut rx).await;

        clock.set(start_time() - chrono::Duration::hours(1));
        host.write_all(b"B\r").await.unwrap();
        let second = next_event(&mut rx).await;

        match (first, second) {
            (IngestEvent::Accepted(a), IngestEvent::Accepted(b)) => {
                assert_eq!(a.timestamp(), start_time());
                assert_eq!(b.timestamp(), start_time());
            }
            other => panic!("unexpected events: {other:?}"),
        }
        handle.stop().await.unwrap();
    }

    #[tokio::test]
    async fn state_moves_to_stopped() {
        let dir = tempdir().unwrap();
        let store = RecordStore::open(dir.path().join("log.csv")).unwrap();
        let controller = IngestionController::new(store, IngestSettings::default()).unwrap();

        let (_host, device) = tokio::io::duplex(64);
        let handle = controller.start(device);
        assert_eq!(handle.state(), ControllerState::Running);

        let mut state = handle.state.clone();
        let summary = handle.stop().await.unwrap();
        assert_eq!(summary.stop_reason, StopReason::Requested);
        assert_eq!(*state.borrow_and_update(), ControllerState::Stopped);
    }

    #[tokio::test]
    async fn stop_handle_works_from_another_task() {
        let dir = tempdir().unwrap();
        let store = RecordStore::open(dir.path().join("log.csv")).unwrap();
        let controller = IngestionController::new(store, IngestSettings::default()).unwrap();

        let (_host, device) = tokio::io::duplex(64);
        let handle = controller.start(device);
        let stopper = handle.stop_handle();

        tokio::spawn(async move { stopper.stop() }).await.unwrap();

        let summary = timeout(Duration::from_secs(2), handle.wait())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(summary.stop_reason, StopReason::Requested);
    }

    #[tokio::test]
    async fn idle_link_keeps_running_past_read_timeouts() {
        let dir = tempdir().unwrap();
        let store = RecordStore::open(dir.path().join("log.csv")).unwrap();
        let settings = IngestSettings {
            read_timeout: Duration::from_millis(5),
            ..IngestSettings::default()
        };
        let controller = IngestionController::new(store, settings).unwrap();
        let mut rx = controller.subscribe();

        let (mut host, device) = tokio::io::duplex(64);
        let handle = controller.start(device);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_finished());

        host.write_all(b"LATE\r").await.unwrap();
        assert!(matches!(next_event(&mut rx).await, IngestEvent::Accepted(_)));

        let summary = handle.stop().await.unwrap();
        assert_eq!(summary.accepted, 1);
    }
}
