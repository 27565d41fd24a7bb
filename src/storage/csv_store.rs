//! CSV persistence with a single-slot write queue.
//!
//! - Reads parse the whole file or fail; nothing is applied partially
//! - Writes land in `<path>.new.tmp` first and are renamed over the destination
//! - One writer thread drains the slot; a newer submission replaces a pending
//!   one that has not started yet (latest wins)
//! - Failed writes are published on a broadcast channel where slow receivers
//!   lose the oldest failures first

use std::ffi::OsString;
use std::fs::{self, File};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

use super::StoreError;

/// Parsed CSV content, one `Vec` of fields per line.
pub type Rows = Vec<Vec<String>>;

/// Deferred row materialization, run by the writer thread at write time.
/// Returning `None` cancels the write.
pub type RowsProducer = Box<dyn FnOnce() -> Option<Rows> + Send>;

/// Suffix of the sibling file a write goes to before the rename.
const TEMP_SUFFIX: &str = ".new.tmp";

/// Number of write failures kept for slow error receivers.
const ERROR_CHANNEL_CAPACITY: usize = 16;

/// A failed write, as published to error receivers.
#[derive(Debug, Clone)]
pub struct WriteFailure {
    pub path: PathBuf,
    pub error: Arc<StoreError>,
}

struct WriteCommand {
    path: PathBuf,
    producer: RowsProducer,
}

#[derive(Default)]
struct SlotState {
    pending: Option<WriteCommand>,
    in_flight: bool,
    shutdown: bool,
}

struct WriteSlot {
    state: Mutex<SlotState>,
    /// Signalled when a command is submitted or shutdown is requested.
    wake: Condvar,
    /// Signalled after every finished write.
    idle: Condvar,
}

/// CSV reader/writer owning one writer thread.
pub struct CsvStore {
    slot: Arc<WriteSlot>,
    errors: broadcast::Sender<WriteFailure>,
    worker: Option<JoinHandle<()>>,
}

impl CsvStore {
    pub fn new() -> Self {
        let slot = Arc::new(WriteSlot {
            state: Mutex::new(SlotState::default()),
            wake: Condvar::new(),
            idle: Condvar::new(),
        });
        let (errors, _) = broadcast::channel(ERROR_CHANNEL_CAPACITY);

        let worker_slot = Arc::clone(&slot);
        let worker_errors = errors.clone();
        let worker = thread::Builder::new()
            .name("csv-writer".to_string())
            .spawn(move || writer_loop(worker_slot, worker_errors));

        let worker = match worker {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!(error = ?e, "Failed to spawn CSV writer thread, writes will be dropped");
                slot.state.lock().shutdown = true;
                None
            }
        };

        Self {
            slot,
            errors,
            worker,
        }
    }

    /// Parses a CSV file into rows of fields.
    ///
    /// The file has no header row of its own and lines may have different
    /// field counts.
    pub fn read(path: &Path) -> Result<Rows, StoreError> {
        let file = File::open(path).map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(file);

        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record.map_err(|source| StoreError::Csv {
                path: path.to_path_buf(),
                source,
            })?;
            rows.push(record.iter().map(str::to_string).collect());
        }

        trace!(?path, rows = rows.len(), "Read CSV file");
        Ok(rows)
    }

    /// Queues a write without blocking.
    ///
    /// If another write is waiting to start it is discarded in favor of this
    /// one. `producer` runs on the writer thread right before writing, so it
    /// should capture the freshest state rather than a snapshot. A producer
    /// returning `None` leaves the destination untouched.
    pub fn submit_write<F>(&self, path: impl Into<PathBuf>, producer: F)
    where
        F: FnOnce() -> Option<Rows> + Send + 'static,
    {
        let command = WriteCommand {
            path: path.into(),
            producer: Box::new(producer),
        };

        {
            let mut state = self.slot.state.lock();
            if state.shutdown {
                warn!(path = ?command.path, "CSV writer stopped, dropping write");
                return;
            }
            if let Some(replaced) = state.pending.replace(command) {
                trace!(path = ?replaced.path, "Replaced pending CSV write");
            }
        }

        self.slot.wake.notify_one();
    }

    /// Blocks until no write is pending or in flight.
    pub fn flush(&self) {
        let mut state = self.slot.state.lock();
        while state.pending.is_some() || state.in_flight {
            if self.worker.is_none() {
                return;
            }
            self.slot.idle.wait(&mut state);
        }
    }

    /// Whether nothing is pending or being written.
    pub fn is_idle(&self) -> bool {
        let state = self.slot.state.lock();
        state.pending.is_none() && !state.in_flight
    }

    /// Subscribes to write failures.
    pub fn watch_write_errors(&self) -> broadcast::Receiver<WriteFailure> {
        self.errors.subscribe()
    }

    /// Writes rows to the temporary sibling of `path` and returns its location.
    ///
    /// The destination itself is untouched until [`CsvStore::commit_temp`].
    /// Missing parent directories are created.
    pub fn write_temp(path: &Path, rows: &[Vec<String>]) -> Result<PathBuf, StoreError> {
        let temp_path = temp_path_for(path);
        let io_error = |source| StoreError::Io {
            path: temp_path.clone(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_error)?;
        }

        let file = File::create(&temp_path).map_err(io_error)?;
        let mut writer = csv::WriterBuilder::new()
            .flexible(true)
            .from_writer(file);

        for row in rows {
            writer
                .write_record(row)
                .map_err(|source| StoreError::Csv {
                    path: temp_path.clone(),
                    source,
                })?;
        }

        let file = writer
            .into_inner()
            .map_err(|e| io_error(e.into_error()))?;
        file.sync_all().map_err(io_error)?;

        Ok(temp_path)
    }

    /// Atomically replaces `path` with a file produced by [`CsvStore::write_temp`].
    pub fn commit_temp(temp_path: &Path, path: &Path) -> Result<(), StoreError> {
        fs::rename(temp_path, path).map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Writes rows to `path` through a temporary file and a rename.
    pub fn write_now(path: &Path, rows: &[Vec<String>]) -> Result<(), StoreError> {
        let result = Self::write_temp(path, rows).and_then(|temp| Self::commit_temp(&temp, path));
        if result.is_err() {
            let _ = fs::remove_file(temp_path_for(path));
        }
        result
    }
}

impl Default for CsvStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CsvStore {
    fn drop(&mut self) {
        self.slot.state.lock().shutdown = true;
        self.slot.wake.notify_all();

        // The writer drains a pending command before it observes shutdown.
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

pub fn temp_path_for(path: &Path) -> PathBuf {
    let mut temp: OsString = path.as_os_str().to_owned();
    temp.push(TEMP_SUFFIX);
    PathBuf::from(temp)
}

/// Writer thread loop.
fn writer_loop(slot: Arc<WriteSlot>, errors: broadcast::Sender<WriteFailure>) {
    debug!("CSV writer started");

    loop {
        let command = {
            let mut state = slot.state.lock();
            loop {
                if let Some(command) = state.pending.take() {
                    state.in_flight = true;
                    break command;
                }
                if state.shutdown {
                    debug!("CSV writer stopped");
                    return;
                }
                slot.wake.wait(&mut state);
            }
        };

        let path = command.path.clone();
        if let Err(error) = execute(command) {
            warn!(?path, %error, "CSV write failed");
            // No receivers is fine; failures are also logged above.
            let _ = errors.send(WriteFailure {
                path,
                error: Arc::new(error),
            });
        }

        slot.state.lock().in_flight = false;
        slot.idle.notify_all();
    }
}

/// Materializes and writes a single command.
fn execute(command: WriteCommand) -> Result<(), StoreError> {
    let WriteCommand { path, producer } = command;

    let rows = panic::catch_unwind(AssertUnwindSafe(producer))
        .map_err(|_| StoreError::Producer { path: path.clone() })?;
    let Some(rows) = rows else {
        trace!(?path, "CSV write cancelled by producer");
        return Ok(());
    };

    CsvStore::write_now(&path, &rows)?;
    trace!(?path, rows = rows.len(), "Wrote CSV file");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use tempfile::tempdir;

    fn rows(lines: &[&[&str]]) -> Rows {
        lines
            .iter()
            .map(|fields| fields.iter().map(|f| f.to_string()).collect())
            .collect()
    }

    #[test]
    fn test_read_missing_file_is_io_error() {
        let dir = tempdir().unwrap();
        let result = CsvStore::read(&dir.path().join("missing.csv"));
        assert!(matches!(result, Err(StoreError::Io { .. })));
    }

    #[test]
    fn test_read_invalid_utf8_is_csv_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.csv");
        fs::write(&path, [0xff, 0xfe, b',', b'a', b'\n']).unwrap();

        let result = CsvStore::read(&path);
        assert!(matches!(result, Err(StoreError::Csv { .. })));
    }

    #[test]
    fn test_write_then_read_preserves_fields() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tags.csv");
        let data = rows(&[
            &["filenames 2024-01-01_00:00:00.000", "a,b,\"quoted\""],
            &["img001", "a"],
            &["single"],
        ]);

        CsvStore::write_now(&path, &data).unwrap();
        assert_eq!(CsvStore::read(&path).unwrap(), data);
        assert!(!temp_path_for(&path).exists());
    }

    #[test]
    fn test_interrupted_write_keeps_destination_intact() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tags.csv");
        let original = rows(&[&["header", "a"], &["img001", "a"]]);
        let replacement = rows(&[&["header", "a,b"], &["img002", "b"]]);

        CsvStore::write_now(&path, &original).unwrap();

        // Stop between the temp write and the rename.
        let temp = CsvStore::write_temp(&path, &replacement).unwrap();
        assert!(temp.exists());
        assert_eq!(CsvStore::read(&path).unwrap(), original);

        CsvStore::commit_temp(&temp, &path).unwrap();
        assert_eq!(CsvStore::read(&path).unwrap(), replacement);
        assert!(!temp.exists());
    }

    #[test]
    fn test_pending_write_is_replaced_by_latest() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tags.csv");
        let store = CsvStore::new();

        let written = Arc::new(Mutex::new(Vec::new()));
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        let log = Arc::clone(&written);
        store.submit_write(&path, move || {
            started_tx.send(()).unwrap();
            release_rx.recv().unwrap();
            log.lock().push("w1");
            Some(rows(&[&["w1"]]))
        });
        started_rx.recv().unwrap();

        // W1 is executing; W2 waits in the slot until W3 replaces it.
        let log = Arc::clone(&written);
        store.submit_write(&path, move || {
            log.lock().push("w2");
            Some(rows(&[&["w2"]]))
        });
        let log = Arc::clone(&written);
        store.submit_write(&path, move || {
            log.lock().push("w3");
            Some(rows(&[&["w3"]]))
        });

        release_tx.send(()).unwrap();
        store.flush();

        assert_eq!(*written.lock(), ["w1", "w3"]);
        assert_eq!(CsvStore::read(&path).unwrap(), rows(&[&["w3"]]));
    }

    #[test]
    fn test_failed_write_is_reported_and_writer_continues() {
        let dir = tempdir().unwrap();
        let store = CsvStore::new();
        let mut errors = store.watch_write_errors();

        // A regular file where the parent directory should be.
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, "").unwrap();
        let bad_path = blocker.join("tags.csv");
        store.submit_write(&bad_path, || Some(rows(&[&["x"]])));
        let failure = errors.blocking_recv().unwrap();
        assert_eq!(failure.path, bad_path);
        assert!(matches!(*failure.error, StoreError::Io { .. }));

        let good_path = dir.path().join("tags.csv");
        store.submit_write(&good_path, || Some(rows(&[&["ok"]])));
        store.flush();
        assert_eq!(CsvStore::read(&good_path).unwrap(), rows(&[&["ok"]]));
    }

    #[test]
    fn test_panicking_producer_is_reported() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tags.csv");
        let store = CsvStore::new();
        let mut errors = store.watch_write_errors();

        store.submit_write(&path, || panic!("producer failure"));
        let failure = errors.blocking_recv().unwrap();
        assert!(matches!(*failure.error, StoreError::Producer { .. }));
        assert!(!path.exists());
    }

    #[test]
    fn test_drop_drains_pending_write() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tags.csv");
        {
            let store = CsvStore::new();
            store.submit_write(&path, || Some(rows(&[&["last"]])));
        }
        assert_eq!(CsvStore::read(&path).unwrap(), rows(&[&["last"]]));
    }

    #[test]
    fn test_cancelled_write_leaves_file_untouched() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tags.csv");
        let original = rows(&[&["header", "a"]]);
        CsvStore::write_now(&path, &original).unwrap();

        let store = CsvStore::new();
        let mut errors = store.watch_write_errors();
        store.submit_write(&path, || None);
        store.flush();

        assert!(store.is_idle());
        assert_eq!(CsvStore::read(&path).unwrap(), original);
        assert!(errors.try_recv().is_err());
    }

    #[test]
    fn test_write_creates_missing_parent_dirs() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fresh-config").join("nested").join("tags.csv");

        let store = CsvStore::new();
        let mut errors = store.watch_write_errors();
        store.submit_write(&path, || Some(rows(&[&["filenames", "a"], &["img001", "a"]])));
        store.flush();

        assert!(errors.try_recv().is_err());
        assert_eq!(
            CsvStore::read(&path).unwrap(),
            rows(&[&["filenames", "a"], &["img001", "a"]])
        );
    }
}
