//! Durable, append-only record log.
//!
//! One CSV file per day, named `YYYYMMDD_<suffix>`, one `timestamp,payload` row per
//! line. Every append is written with a single `write_all` and synced before it
//! returns, so a crash can leave at most one incomplete trailing row. Scans ignore
//! anything after the last newline, and [`RecordStore::open`] cuts such a torn tail
//! off before new rows are appended behind it.

use super::record::Record;
use crate::error::{AppResult, ScanlogError};
use crate::framing::FramingError;
use chrono::NaiveDate;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Chunk size used when searching backwards for the last complete row.
const TAIL_PROBE_LEN: usize = 4096;

/// Every row is `timestamp,payload`.
const ROW_FIELDS: usize = 2;

/// Naming scheme for daily log files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLayout {
    dir: PathBuf,
    suffix: String,
}

impl LogLayout {
    /// Logs live in `dir`, named `YYYYMMDD_<suffix>`.
    pub fn new(dir: impl Into<PathBuf>, suffix: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            suffix: suffix.into(),
        }
    }

    /// Directory holding the logs.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File name of the log for `date`.
    pub fn file_name(&self, date: NaiveDate) -> String {
        format!("{}_{}", date.format("%Y%m%d"), self.suffix)
    }

    /// Full path of the log for `date`.
    pub fn path_for(&self, date: NaiveDate) -> PathBuf {
        self.dir.join(self.file_name(date))
    }
}

/// Result of scanning a log file.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScanOutcome {
    /// Every well-formed record, in file order.
    pub records: Vec<Record>,
    /// Complete rows that could not be parsed.
    pub skipped: usize,
    /// Bytes after the last newline (an interrupted append).
    pub torn_tail_bytes: usize,
}

/// Append-only log of [`Record`]s backed by one file.
///
/// Lifecycle: [`open`](Self::open) → [`append`](Self::append)* → [`close`](Self::close).
#[derive(Debug)]
pub struct RecordStore {
    path: PathBuf,
    file: File,
    poisoned: bool,
}

impl RecordStore {
    /// Open the log at `path` for appending, creating it and its directory if needed.
    ///
    /// A torn trailing row left behind by a crash is removed first.
    pub fn open(path: impl Into<PathBuf>) -> AppResult<Self> {
        let path = path.into();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ScanlogError::persistence(parent, e))?;
            }
        }

        repair_torn_tail(&path).map_err(|e| ScanlogError::persistence(&path, e))?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| ScanlogError::persistence(&path, e))?;

        info!(path = %path.display(), "Record log opened");
        Ok(Self {
            path,
            file,
            poisoned: false,
        })
    }

    /// Open the log for `date` under `layout`.
    pub fn open_for_day(layout: &LogLayout, date: NaiveDate) -> AppResult<Self> {
        Self::open(layout.path_for(date))
    }

    /// Path of the underlying file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Send further appends to `file` while scans keep reading `path`.
    #[cfg(test)]
    pub(crate) fn redirect_appends(&mut self, file: File) {
        self.file = file;
    }

    /// Whether an earlier append failed and the store now refuses writes.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Durably append `record`.
    ///
    /// Returns only after the row has been synced to stable storage. Any write
    /// failure poisons the store, since the file may now end in a partial row.
    pub fn append(&mut self, record: &Record) -> AppResult<()> {
        if self.poisoned {
            return Err(ScanlogError::StorePoisoned(self.path.clone()));
        }
        if record.payload().contains(['\r', '\n']) {
            return Err(FramingError::EmbeddedLineBreak.into());
        }

        let row = encode_row(record)?;
        let written = self
            .file
            .write_all(&row)
            .and_then(|()| self.file.sync_data());

        if let Err(e) = written {
            self.poisoned = true;
            return Err(ScanlogError::persistence(&self.path, e));
        }

        debug!(payload = record.payload(), "Record appended");
        Ok(())
    }

    /// Every record in the log, in arrival order.
    pub fn scan_all(&self) -> AppResult<Vec<Record>> {
        Ok(self.scan()?.records)
    }

    /// Scan the log, reporting skipped rows and torn bytes as well.
    pub fn scan(&self) -> AppResult<ScanOutcome> {
        scan_file(&self.path)
    }

    /// Sync and release the file.
    pub fn close(self) -> AppResult<()> {
        self.file
            .sync_all()
            .map_err(|e| ScanlogError::persistence(&self.path, e))?;
        info!(path = %self.path.display(), "Record log closed");
        Ok(())
    }
}

/// Scan the log at `path` without owning it. A missing file scans as empty.
///
/// Safe to call while another handle appends: a row that is still being written
/// has no trailing newline yet and is ignored.
pub fn scan_file(path: &Path) -> AppResult<ScanOutcome> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(ScanOutcome::default()),
        Err(e) => return Err(ScanlogError::persistence(path, e)),
    };
    Ok(parse_log(&bytes))
}

fn parse_log(bytes: &[u8]) -> ScanOutcome {
    let complete = bytes
        .iter()
        .rposition(|&b| b == b'\n')
        .map_or(0, |pos| pos + 1);

    let mut outcome = ScanOutcome {
        torn_tail_bytes: bytes.len() - complete,
        ..ScanOutcome::default()
    };

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(&bytes[..complete]);

    for row in reader.records() {
        let parsed = row.map_err(|e| e.to_string()).and_then(|row| {
            if row.len() != ROW_FIELDS {
                return Err(format!("expected {ROW_FIELDS} fields, found {}", row.len()));
            }
            row.deserialize::<Record>(None).map_err(|e| e.to_string())
        });
        match parsed {
            Ok(record) => outcome.records.push(record),
            Err(error) => {
                outcome.skipped += 1;
                warn!(%error, "Skipping malformed log row");
            }
        }
    }

    if outcome.torn_tail_bytes > 0 {
        warn!(
            bytes = outcome.torn_tail_bytes,
            "Ignoring torn trailing record"
        );
    }
    outcome
}

fn encode_row(record: &Record) -> AppResult<Vec<u8>> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(Vec::with_capacity(64));
    writer.serialize(record)?;
    writer
        .into_inner()
        .map_err(|e| ScanlogError::Csv(csv::Error::from(e.into_error())))
}

/// Cut the file back to its last complete row.
fn repair_torn_tail(path: &Path) -> std::io::Result<()> {
    let mut file = match OpenOptions::new().read(true).write(true).open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };

    let total = file.metadata()?.len();
    let complete = complete_len(&mut file, total)?;
    if complete < total {
        warn!(
            path = %path.display(),
            torn_bytes = total - complete,
            "Removing torn trailing record from log"
        );
        file.set_len(complete)?;
        file.sync_all()?;
    }
    Ok(())
}

/// Length of the file up to and including its last newline.
fn complete_len(file: &mut File, total: u64) -> std::io::Result<u64> {
    let mut chunk = vec![0u8; TAIL_PROBE_LEN];
    let mut end = total;

    while end > 0 {
        let start = end.saturating_sub(TAIL_PROBE_LEN as u64);
        let len = (end - start) as usize;
        file.seek(SeekFrom::Start(start))?;
        file.read_exact(&mut chunk[..len])?;
        if let Some(pos) = chunk[..len].iter().rposition(|&b| b == b'\n') {
            return Ok(start + pos as u64 + 1);
        }
        end = start;
    }
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDateTime;
    use tempfile::tempdir;
    use tracing_test::traced_test;

    fn ts(s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2023, 3, 27)
            .and_then(|d| d.and_hms_opt(9, 0, s))
            .unwrap()
    }

    #[test]
    fn layout_names_file_by_date() {
        let layout = LogLayout::new("/var/scans", "scanlog.csv");
        let date = NaiveDate::from_ymd_opt(2023, 3, 7).unwrap();
        assert_eq!(layout.file_name(date), "20230307_scanlog.csv");
        assert_eq!(
            layout.path_for(date),
            PathBuf::from("/var/scans/20230307_scanlog.csv")
        );
    }

    #[test]
    fn append_then_scan_preserves_order() {
        let dir = tempdir().unwrap();
        let mut store = RecordStore::open(dir.path().join("log.csv")).unwrap();
        store.append(&Record::new(ts(1), "X1")).unwrap();
        store.append(&Record::new(ts(2), "X2")).unwrap();

        let records = store.scan_all().unwrap();
        assert_eq!(
            records,
            vec![Record::new(ts(1), "X1"), Record::new(ts(2), "X2")]
        );
    }

    #[test]
    fn rows_use_the_two_field_layout() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.csv");
        let mut store = RecordStore::open(&path).unwrap();
        store.append(&Record::new(ts(5), "ABC123")).unwrap();
        store.append(&Record::new(ts(6), "has,comma")).unwrap();
        store.close().unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            text,
            "2023-03-27 09:00:05,ABC123\n2023-03-27 09:00:06,\"has,comma\"\n"
        );
        let records = scan_file(&path).unwrap().records;
        assert_eq!(records[1].payload(), "has,comma");
    }

    #[test]
    fn reopening_appends_without_truncating() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("log.csv");

        let mut store = RecordStore::open(&path).unwrap();
        store.append(&Record::new(ts(1), "A")).unwrap();
        store.close().unwrap();

        let mut store = RecordStore::open(&path).unwrap();
        store.append(&Record::new(ts(2), "B")).unwrap();

        let payloads: Vec<_> = store
            .scan_all()
            .unwrap()
            .into_iter()
            .map(|r| r.payload().to_string())
            .collect();
        assert_eq!(payloads, vec!["A", "B"]);
    }

    #[test]
    fn missing_file_scans_empty() {
        let dir = tempdir().unwrap();
        let outcome = scan_file(&dir.path().join("absent.csv")).unwrap();
        assert_eq!(outcome, ScanOutcome::default());
    }

    #[test]
    #[traced_test]
    fn torn_tail_is_ignored_then_repaired() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.csv");
        std::fs::write(&path, "2023-03-27 09:00:01,A\n2023-03-27 09:00:02,B12").unwrap();

        let outcome = scan_file(&path).unwrap();
        assert_eq!(outcome.records, vec![Record::new(ts(1), "A")]);
        assert_eq!(outcome.torn_tail_bytes, 23);

        let mut store = RecordStore::open(&path).unwrap();
        assert!(logs_contain("Removing torn trailing record"));
        store.append(&Record::new(ts(3), "C")).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "2023-03-27 09:00:01,A\n2023-03-27 09:00:03,C\n");
    }

    #[test]
    fn torn_tail_longer_than_probe_chunk_is_repaired() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.csv");
        let mut content = String::from("2023-03-27 09:00:01,A\n");
        content.push_str(&"Z".repeat(TAIL_PROBE_LEN * 2 + 17));
        std::fs::write(&path, &content).unwrap();

        let store = RecordStore::open(&path).unwrap();
        let text = std::fs::read_to_string(store.path()).unwrap();
        assert_eq!(text, "2023-03-27 09:00:01,A\n");
    }

    #[test]
    fn file_without_any_newline_is_emptied() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.csv");
        std::fs::write(&path, "2023-03-27 09:0").unwrap();

        let store = RecordStore::open(&path).unwrap();
        assert!(store.scan_all().unwrap().is_empty());
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
    }

    #[test]
    fn malformed_rows_are_skipped_and_counted() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.csv");
        std::fs::write(
            &path,
            "timestamp,payload\n2023-03-27 09:00:01,A\nlonely\n\n2023-03-27 09:00:02,B\n",
        )
        .unwrap();

        let outcome = scan_file(&path).unwrap();
        assert_eq!(
            outcome.records,
            vec![Record::new(ts(1), "A"), Record::new(ts(2), "B")]
        );
        assert_eq!(outcome.skipped, 2);
    }

    #[test]
    fn malformed_rows_with_extra_fields_are_skipped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.csv");
        std::fs::write(
            &path,
            "2023-03-27 09:00:01,A,extra\r\n2023-03-27 09:00:02,B\r\n",
        )
        .unwrap();

        let outcome = scan_file(&path).unwrap();
        assert_eq!(outcome.records, vec![Record::new(ts(2), "B")]);
        assert_eq!(outcome.skipped, 1);

        let store = RecordStore::open(&path).unwrap();
        let mut index = crate::data::DedupIndex::new();
        index.hydrate(&store.scan_all().unwrap());
        assert!(!index.contains("A"));
        assert!(index.contains("B"));
    }

    #[test]
    fn payload_with_line_break_is_refused() {
        let dir = tempdir().unwrap();
        let mut store = RecordStore::open(dir.path().join("log.csv")).unwrap();
        let err = store.append(&Record::new(ts(1), "A\nB")).unwrap_err();
        assert!(matches!(
            err,
            ScanlogError::Framing(FramingError::EmbeddedLineBreak)
        ));
        assert!(!store.is_poisoned());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn failed_write_poisons_the_store() {
        let full = Path::new("/dev/full");
        if !full.exists() {
            return;
        }
        let mut store = RecordStore::open(full).unwrap();
        let err = store.append(&Record::new(ts(1), "A")).unwrap_err();
        assert!(matches!(err, ScanlogError::Persistence { .. }));
        assert!(store.is_poisoned());

        let err = store.append(&Record::new(ts(2), "B")).unwrap_err();
        assert!(matches!(err, ScanlogError::StorePoisoned(_)));
    }
}
