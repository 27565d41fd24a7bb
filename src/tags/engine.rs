//! Authoritative in-memory tag matrix.
//!
//! - The matrix lives in a watch channel; readers clone the `Arc` and never
//!   observe a partial update
//! - Toggles are applied under one mutation lock, stamped, published, then
//!   persisted asynchronously through [`CsvStore`]
//! - A background task re-reads the CSV when the file or its configured path
//!   changes, but only while someone is subscribed

use std::collections::BTreeSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::{self, JoinHandle};
use tracing::{debug, info, trace, warn};

use super::TagMatrixError;
use crate::models::{filename_stem, TagHit, TagMatrix};
use crate::settings::{Settings, SettingsService};
use crate::storage::{CsvStore, FileAccess, StoreError, WriteFailure};

/// Attempts per re-read before giving up on a refresh.
const READ_ATTEMPTS: u32 = 3;

const READ_RETRY_DELAY: Duration = Duration::from_millis(100);

struct EngineInner {
    /// Shared with pending write producers so they can serialize the latest state.
    matrix_tx: Arc<watch::Sender<Arc<TagMatrix>>>,
    store: CsvStore,
    file_access: Arc<dyn FileAccess>,
    /// Only swapped together with the matrix, under `mutation`.
    csv_path: Arc<RwLock<PathBuf>>,
    mutation: Arc<Mutex<()>>,
    /// A refresh was skipped for lack of subscribers.
    dirty: AtomicBool,
    refresh: Notify,
}

/// Owner of the tag matrix.
pub struct TagMatrixEngine {
    inner: Arc<EngineInner>,
    task: JoinHandle<()>,
}

impl TagMatrixEngine {
    /// Loads the matrix from the configured CSV and starts the refresh task.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(settings: &SettingsService, file_access: Arc<dyn FileAccess>) -> Self {
        let mut settings_rx = settings.watch_settings();
        let csv_path = settings_rx
            .borrow_and_update()
            .album_viewing
            .tags_csv_path
            .clone();

        let matrix = match load(&csv_path) {
            Ok(matrix) if matrix.is_empty() => {
                info!(path = ?csv_path, "Tag matrix file has no tags yet");
                matrix
            }
            Ok(matrix) => {
                info!(
                    path = ?csv_path,
                    files = matrix.filenames().len(),
                    tags = matrix.tags().len(),
                    "Loaded tag matrix"
                );
                matrix
            }
            Err(e) => {
                warn!(path = ?csv_path, error = %e, "Starting with an empty tag matrix");
                TagMatrix::empty()
            }
        };

        let (matrix_tx, _) = watch::channel(Arc::new(matrix));
        let inner = Arc::new(EngineInner {
            matrix_tx: Arc::new(matrix_tx),
            store: CsvStore::new(),
            file_access,
            csv_path: Arc::new(RwLock::new(csv_path)),
            mutation: Arc::new(Mutex::new(())),
            dirty: AtomicBool::new(false),
            refresh: Notify::new(),
        });

        let task = tokio::spawn(refresh_loop(Arc::clone(&inner), settings_rx));

        Self { inner, task }
    }

    pub fn current(&self) -> Arc<TagMatrix> {
        self.inner.matrix_tx.borrow().clone()
    }

    pub fn csv_path(&self) -> PathBuf {
        self.inner.csv_path.read().clone()
    }

    /// Raw matrix receiver. Holding it keeps background refresh active.
    pub fn watch_matrix(&self) -> watch::Receiver<Arc<TagMatrix>> {
        let rx = self.inner.matrix_tx.subscribe();
        if self.inner.dirty.swap(false, Ordering::AcqRel) {
            debug!("Subscriber arrived after skipped refresh, refreshing");
            self.inner.refresh.notify_one();
        }
        rx
    }

    /// Tags carried by one filename stem.
    pub fn watch_tags_for(&self, filename: &str) -> TagsWatch<BTreeSet<String>> {
        let filename = filename.to_string();
        TagsWatch::new(self.watch_matrix(), move |m| m.tags_for(&filename))
    }

    /// The full vocabulary in matrix order.
    pub fn watch_all_tags(&self) -> TagsWatch<Vec<String>> {
        TagsWatch::new(self.watch_matrix(), |m| m.tags().to_vec())
    }

    /// Every tag paired with whether the file at `path` carries it.
    pub fn watch_tag_hits(&self, path: &Path) -> TagsWatch<Vec<TagHit>> {
        let filename = filename_stem(path);
        TagsWatch::new(self.watch_matrix(), move |m| m.tag_hits_for(&filename))
    }

    /// Sets or clears one tag on one filename stem.
    ///
    /// The new matrix is visible as soon as this returns; persisting happens
    /// on the writer thread and reports failures via [`Self::watch_write_errors`].
    pub fn write_tag_hit(&self, filename: &str, tag: &str, is_hit: bool) {
        let inner = &self.inner;
        let _guard = inner.mutation.lock();
        let current = inner.matrix_tx.borrow().clone();
        let updated = current.with_tag_hit(filename, tag, is_hit);
        if updated.same_content(&current) {
            trace!(filename, tag, is_hit, "Tag hit unchanged");
            return;
        }

        // Never stamp behind the current matrix, or our own write would
        // read back as stale.
        let now = Utc::now().timestamp_millis();
        let stamp = match current.timestamp() {
            Some(ts) if ts >= now => ts + 1,
            _ => now,
        };
        inner
            .matrix_tx
            .send_replace(Arc::new(updated.with_timestamp(Some(stamp))));
        debug!(filename, tag, is_hit, "Tag hit updated");

        let path = inner.csv_path.read().clone();
        let target = path.clone();
        let matrix_tx = Arc::clone(&inner.matrix_tx);
        let csv_path = Arc::clone(&inner.csv_path);
        let mutation = Arc::clone(&inner.mutation);
        inner.store.submit_write(path, move || {
            // The matrix belongs to whichever file is active when this runs.
            let _guard = mutation.lock();
            if *csv_path.read() != target {
                trace!(path = ?target, "Tag matrix moved to another file, skipping write");
                return None;
            }
            let rows = matrix_tx.borrow().to_rows();
            Some(rows)
        });
    }

    /// [`Self::write_tag_hit`] keyed by a full media path.
    pub fn set_tag_hit_for_path(&self, path: &Path, tag: &str, is_hit: bool) {
        self.write_tag_hit(&filename_stem(path), tag, is_hit);
    }

    /// Blocks until pending writes are on disk.
    pub fn flush(&self) {
        self.inner.store.flush();
    }

    pub fn watch_write_errors(&self) -> broadcast::Receiver<WriteFailure> {
        self.inner.store.watch_write_errors()
    }

    /// Re-reads the active CSV and applies it if it is not older than the
    /// in-memory matrix. Returns whether the matrix changed.
    pub async fn refresh(&self) -> Result<bool, TagMatrixError> {
        refresh_from_disk(&self.inner).await
    }
}

impl Drop for TagMatrixEngine {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// A projection of the matrix that only reports real changes.
pub struct TagsWatch<T> {
    rx: watch::Receiver<Arc<TagMatrix>>,
    project: Box<dyn Fn(&TagMatrix) -> T + Send + Sync>,
    last: T,
}

impl<T: Clone + PartialEq> TagsWatch<T> {
    fn new<F>(mut rx: watch::Receiver<Arc<TagMatrix>>, project: F) -> Self
    where
        F: Fn(&TagMatrix) -> T + Send + Sync + 'static,
    {
        let last = project(&rx.borrow_and_update());
        Self {
            rx,
            project: Box::new(project),
            last,
        }
    }

    pub fn current(&self) -> T {
        self.last.clone()
    }

    /// Waits until the projected value differs from the last one seen.
    /// Returns `None` once the engine is gone.
    pub async fn changed(&mut self) -> Option<T> {
        loop {
            self.rx.changed().await.ok()?;
            let value = (self.project)(&self.rx.borrow_and_update());
            if value != self.last {
                self.last = value.clone();
                return Some(value);
            }
        }
    }
}

fn load(path: &Path) -> Result<TagMatrix, StoreError> {
    CsvStore::read(path).map(|rows| TagMatrix::from_rows(&rows))
}

async fn read_with_retries(path: &Path) -> Result<TagMatrix, TagMatrixError> {
    let mut attempt = 1;
    loop {
        let read_path = path.to_path_buf();
        let result = task::spawn_blocking(move || load(&read_path))
            .await
            .unwrap_or_else(|e| {
                Err(StoreError::Io {
                    path: path.to_path_buf(),
                    source: io::Error::other(e),
                })
            });

        match result {
            Ok(matrix) => return Ok(matrix),
            Err(e) if attempt < READ_ATTEMPTS => {
                debug!(?path, attempt, error = %e, "Tag matrix read failed, retrying");
            }
            Err(e) => return Err(e.into()),
        }

        attempt += 1;
        tokio::time::sleep(READ_RETRY_DELAY).await;
    }
}

/// Publishes `parsed`, read from `path`, unless it is stale or `path` is no
/// longer the active file.
fn apply(inner: &EngineInner, path: &Path, parsed: TagMatrix) -> Result<bool, TagMatrixError> {
    let _guard = inner.mutation.lock();
    if *inner.csv_path.read() != path {
        trace!(?path, "Tag matrix file is no longer active, ignoring read");
        return Ok(false);
    }
    let current = inner.matrix_tx.borrow().clone();

    if !parsed.supersedes(&current) {
        return Err(TagMatrixError::Stale {
            parsed: parsed.timestamp(),
            current: current.timestamp(),
        });
    }
    if parsed == *current {
        return Ok(false);
    }

    inner.matrix_tx.send_replace(Arc::new(parsed));
    Ok(true)
}

async fn refresh_from_disk(inner: &EngineInner) -> Result<bool, TagMatrixError> {
    let path = inner.csv_path.read().clone();
    let parsed = read_with_retries(&path).await?;
    apply(inner, &path, parsed)
}

/// Makes `new_path` the active file with `parsed` as its matrix, regardless
/// of age.
///
/// Writes still queued for the old file would be skipped once the path
/// changes, so the old matrix is queued for the old file one last time.
fn switch_csv(inner: &EngineInner, new_path: PathBuf, parsed: TagMatrix) {
    let _guard = inner.mutation.lock();
    let old_path = std::mem::replace(&mut *inner.csv_path.write(), new_path);
    let current = inner.matrix_tx.borrow().clone();

    if !inner.store.is_idle() {
        debug!(path = ?old_path, "Saving pending tag changes before switching files");
        let snapshot = Arc::clone(&current);
        inner
            .store
            .submit_write(old_path, move || Some(snapshot.to_rows()));
    }

    if parsed != *current {
        inner.matrix_tx.send_replace(Arc::new(parsed));
    }
}

fn has_subscribers(inner: &EngineInner) -> bool {
    if inner.matrix_tx.receiver_count() == 0 {
        inner.dirty.store(true, Ordering::Release);
        trace!("No tag subscribers, deferring refresh");
        return false;
    }
    true
}

async fn refresh_loop(inner: Arc<EngineInner>, mut settings_rx: watch::Receiver<Arc<Settings>>) {
    let mut csv_watch = {
        let path = inner.csv_path.read().clone();
        inner.file_access.watch_changes(&path)
    };

    loop {
        tokio::select! {
            changed = settings_rx.changed() => {
                if changed.is_err() {
                    debug!("Settings closed, stopping tag refresh");
                    return;
                }
                let new_path = settings_rx
                    .borrow_and_update()
                    .album_viewing
                    .tags_csv_path
                    .clone();
                if new_path == *inner.csv_path.read() {
                    continue;
                }

                info!(path = ?new_path, "Tag matrix path changed");
                csv_watch = inner.file_access.watch_changes(&new_path);

                let parsed = match read_with_retries(&new_path).await {
                    Ok(matrix) => matrix,
                    Err(e) => {
                        warn!(path = ?new_path, error = %e, "Using an empty tag matrix");
                        TagMatrix::empty()
                    }
                };
                switch_csv(&inner, new_path, parsed);
            }
            _ = csv_watch.changed() => {
                if has_subscribers(&inner) {
                    log_refresh(refresh_from_disk(&inner).await);
                }
            }
            _ = inner.refresh.notified() => {
                log_refresh(refresh_from_disk(&inner).await);
            }
        }
    }
}

fn log_refresh(result: Result<bool, TagMatrixError>) {
    match result {
        Ok(true) => debug!("Tag matrix refreshed from disk"),
        Ok(false) => trace!("Tag matrix on disk unchanged"),
        Err(e @ TagMatrixError::Stale { .. }) => debug!(error = %e, "Discarded stale tag matrix"),
        Err(e) => warn!(error = %e, "Tag matrix refresh failed"),
    }
}
