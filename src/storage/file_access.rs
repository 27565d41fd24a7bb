//! Local filesystem access: listing, metadata and change notification.
//!
//! - Recursive listing via walkdir, regular files only
//! - Metadata failures degrade to zero values instead of erroring
//! - Change watches emit once immediately, then once per burst of events
//!   (pending notifications are conflated into a single slot)

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};
use walkdir::WalkDir;

use crate::models::FileMetadata;

/// Filesystem capability consumed by the selection pipeline and tag engine.
pub trait FileAccess: Send + Sync + 'static {
    /// Absolute paths of all regular files under `path`, recursively.
    /// A missing path yields an empty list.
    fn list_files(&self, path: &Path) -> Vec<PathBuf>;

    fn read_metadata(&self, path: &Path) -> FileMetadata;

    /// Change notifications for a directory tree or a single file.
    fn watch_changes(&self, path: &Path) -> ChangeWatch;
}

/// A stream of "something changed" signals.
///
/// The watch stays registered for as long as this value lives.
pub struct ChangeWatch {
    rx: flume::Receiver<()>,
    _guard: Mutex<Box<dyn Send>>,
}

impl ChangeWatch {
    /// Wraps a receiver; `guard` is kept alive alongside it.
    pub fn new(rx: flume::Receiver<()>, guard: impl Send + 'static) -> Self {
        Self {
            rx,
            _guard: Mutex::new(Box::new(guard)),
        }
    }

    /// Waits for the next change. Never completes once the source is gone.
    pub async fn changed(&self) {
        if self.rx.recv_async().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// [`FileAccess`] over the local filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFileAccess;

impl LocalFileAccess {
    pub fn new() -> Self {
        Self
    }
}

impl FileAccess for LocalFileAccess {
    fn list_files(&self, path: &Path) -> Vec<PathBuf> {
        if !path.exists() {
            trace!(?path, "Listing skipped, path does not exist");
            return Vec::new();
        }

        let root = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
        let files: Vec<PathBuf> = WalkDir::new(&root)
            .follow_links(false)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .collect();

        debug!(?root, count = files.len(), "Listed files");
        files
    }

    fn read_metadata(&self, path: &Path) -> FileMetadata {
        let metadata = match fs::metadata(path) {
            Ok(m) => m,
            Err(e) => {
                trace!(?path, error = %e, "Metadata unavailable");
                return FileMetadata::unreadable(path.to_path_buf());
            }
        };

        let modification_timestamp = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);

        FileMetadata {
            full_path: path.to_path_buf(),
            modification_timestamp,
            size: metadata.len(),
        }
    }

    fn watch_changes(&self, path: &Path) -> ChangeWatch {
        let (tx, rx) = flume::bounded(1);
        let _ = tx.try_send(());

        // Anything but a directory is watched through its parent, so a file
        // that does not exist yet is picked up once created.
        let (target, mode, file_name) = if path.is_dir() {
            (path.to_path_buf(), RecursiveMode::Recursive, None)
        } else {
            let parent = match path.parent() {
                Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
                _ => PathBuf::from("."),
            };
            (parent, RecursiveMode::NonRecursive, path.file_name().map(|n| n.to_owned()))
        };

        let event_tx = tx.clone();
        let watcher = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| {
                if let Ok(event) = res {
                    if is_relevant(&event, file_name.as_ref()) {
                        // Full slot means a signal is already queued.
                        let _ = event_tx.try_send(());
                    }
                }
            },
            Config::default(),
        );

        let watcher = match watcher {
            Ok(mut w) => match w.watch(&target, mode) {
                Ok(()) => {
                    debug!(path = ?target, "Watching for changes");
                    Some(w)
                }
                Err(e) => {
                    warn!(path = ?target, error = %e, "Failed to watch path");
                    None
                }
            },
            Err(e) => {
                warn!(error = %e, "Failed to create filesystem watcher");
                None
            }
        };

        // The sender is kept so a failed watch stays silent instead of closing.
        ChangeWatch::new(rx, (watcher, tx))
    }
}

fn is_relevant(event: &Event, file_name: Option<&OsString>) -> bool {
    if matches!(event.kind, EventKind::Access(_)) {
        return false;
    }
    match file_name {
        Some(name) => event
            .paths
            .iter()
            .any(|p| p.file_name() == Some(name.as_os_str())),
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    #[test]
    fn test_list_files_recursive() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("a/b")).unwrap();
        fs::write(dir.path().join("top.jpg"), b"x").unwrap();
        fs::write(dir.path().join("a/b/deep.png"), b"x").unwrap();

        let mut files = LocalFileAccess.list_files(dir.path());
        files.sort();

        assert_eq!(files.len(), 2);
        assert!(files.iter().all(|p| p.is_absolute()));
        assert!(files[0].ends_with("a/b/deep.png"));
        assert!(files[1].ends_with("top.jpg"));
    }

    #[test]
    fn test_list_missing_path_is_empty() {
        let dir = tempdir().unwrap();
        assert!(LocalFileAccess.list_files(&dir.path().join("gone")).is_empty());
    }

    #[test]
    fn test_read_metadata() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("img.jpg");
        fs::write(&path, b"12345").unwrap();

        let metadata = LocalFileAccess.read_metadata(&path);
        assert_eq!(metadata.size, 5);
        assert!(metadata.modification_timestamp > 0);

        let missing = LocalFileAccess.read_metadata(&dir.path().join("missing.jpg"));
        assert_eq!(missing.size, 0);
        assert_eq!(missing.modification_timestamp, 0);
    }

    #[tokio::test]
    async fn test_watch_emits_immediately_and_on_change() {
        let dir = tempdir().unwrap();
        let watch = LocalFileAccess.watch_changes(dir.path());

        tokio::time::timeout(Duration::from_secs(1), watch.changed())
            .await
            .unwrap();

        fs::write(dir.path().join("new.jpg"), b"x").unwrap();
        tokio::time::timeout(Duration::from_secs(5), watch.changed())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_file_watch_ignores_siblings() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("tags.csv");
        let watch = LocalFileAccess.watch_changes(&target);
        watch.changed().await;

        fs::write(dir.path().join("other.txt"), b"x").unwrap();
        let sibling = tokio::time::timeout(Duration::from_millis(300), watch.changed()).await;
        assert!(sibling.is_err());

        fs::write(&target, b"filenames,a\n").unwrap();
        tokio::time::timeout(Duration::from_secs(5), watch.changed())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_watch_without_source_stays_pending() {
        let (tx, rx) = flume::bounded(1);
        drop(tx);
        let watch = ChangeWatch::new(rx, ());

        let result = tokio::time::timeout(Duration::from_millis(50), watch.changed()).await;
        assert!(result.is_err());
    }
}
