//! Reactive media selection.
//!
//! A subscription owns one driver task that listens to settings, params, the
//! tag matrix and filesystem changes in the selected albums. Every trigger
//! drops the in-flight cycle and starts a new one, so only the result of the
//! latest inputs is ever published.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::watch;
use tokio::task::{self, JoinHandle};
use tracing::{debug, trace, warn};

use super::filter::{
    filter_by_tags, is_hidden, matches_media_type, selected_album_paths, sort_metadata,
    to_media_items,
};
use crate::models::{MediaItem, MediaSelectionParams, TagMatrix};
use crate::settings::{Settings, SettingsService};
use crate::storage::FileAccess;
use crate::tags::TagMatrixEngine;

type Cycle = Pin<Box<dyn Future<Output = Vec<MediaItem>> + Send>>;

/// Entry point for watching the selected media list.
pub struct MediaSelectionPipeline {
    settings: SettingsService,
    file_access: Arc<dyn FileAccess>,
    tags: Arc<TagMatrixEngine>,
}

impl MediaSelectionPipeline {
    pub fn new(
        settings: SettingsService,
        file_access: Arc<dyn FileAccess>,
        tags: Arc<TagMatrixEngine>,
    ) -> Self {
        Self {
            settings,
            file_access,
            tags,
        }
    }

    /// Starts watching the list for `params`.
    ///
    /// The first value is a single loading placeholder. `seed` fixes the
    /// random order until the params change.
    pub fn execute(&self, params: MediaSelectionParams, seed: u64) -> MediaListSubscription {
        let (list_tx, list_rx) = watch::channel(Arc::new(vec![MediaItem::loading()]));
        let (params_tx, params_rx) = watch::channel((params, seed));

        let task = tokio::spawn(drive(
            self.settings.watch_settings(),
            params_rx,
            self.tags.watch_matrix(),
            Arc::clone(&self.file_access),
            list_tx,
        ));

        MediaListSubscription {
            rx: list_rx,
            params_tx,
            task,
        }
    }
}

/// Handle to a running selection. Dropping it stops the driver.
pub struct MediaListSubscription {
    rx: watch::Receiver<Arc<Vec<MediaItem>>>,
    params_tx: watch::Sender<(MediaSelectionParams, u64)>,
    task: JoinHandle<()>,
}

impl MediaListSubscription {
    pub fn current(&self) -> Arc<Vec<MediaItem>> {
        self.rx.borrow().clone()
    }

    /// Waits for the next published list.
    pub async fn changed(&mut self) -> Option<Arc<Vec<MediaItem>>> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }

    pub fn params(&self) -> MediaSelectionParams {
        self.params_tx.borrow().0.clone()
    }

    pub fn seed(&self) -> u64 {
        self.params_tx.borrow().1
    }

    /// Replaces the params. A real change also advances the random seed by
    /// the params hash, so each selection gets its own stable shuffle.
    pub fn set_params(&self, params: MediaSelectionParams) {
        self.params_tx.send_if_modified(|(current, seed)| {
            if *current == params {
                return false;
            }
            *seed = seed.wrapping_add(params.stable_hash());
            *current = params;
            true
        });
    }

    /// Edits the current params in place, e.g. to cycle a tag.
    pub fn update_params(&self, edit: impl FnOnce(&mut MediaSelectionParams)) {
        let mut params = self.params();
        edit(&mut params);
        self.set_params(params);
    }
}

impl Drop for MediaListSubscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Forwarding tasks for album change watches, stopped on drop.
struct AlbumWatches(Vec<JoinHandle<()>>);

impl AlbumWatches {
    fn start(
        file_access: &Arc<dyn FileAccess>,
        album_paths: &[PathBuf],
        tx: &flume::Sender<()>,
    ) -> Self {
        let handles = album_paths
            .iter()
            .map(|path| {
                let file_access = Arc::clone(file_access);
                let path = path.clone();
                let tx = tx.clone();
                tokio::spawn(async move {
                    let watch_path = path.clone();
                    let watch =
                        match task::spawn_blocking(move || file_access.watch_changes(&watch_path))
                            .await
                        {
                            Ok(w) => w,
                            Err(e) => {
                                warn!(?path, error = %e, "Album watch setup failed");
                                return;
                            }
                        };
                    loop {
                        watch.changed().await;
                        trace!(?path, "Album changed");
                        if tx.try_send(()).is_err() && tx.is_disconnected() {
                            return;
                        }
                    }
                })
            })
            .collect();
        Self(handles)
    }
}

impl Drop for AlbumWatches {
    fn drop(&mut self) {
        for handle in &self.0 {
            handle.abort();
        }
    }
}

async fn next_result(cycle: &mut Option<Cycle>) -> Vec<MediaItem> {
    match cycle.as_mut() {
        Some(running) => running.await,
        None => std::future::pending().await,
    }
}

fn start_cycle(
    file_access: &Arc<dyn FileAccess>,
    album_paths: &[PathBuf],
    params: &MediaSelectionParams,
    matrix: &Arc<TagMatrix>,
    seed: u64,
) -> Option<Cycle> {
    Some(Box::pin(run_cycle(
        Arc::clone(file_access),
        album_paths.to_vec(),
        params.clone(),
        Arc::clone(matrix),
        seed,
    )))
}

fn album_paths_for(settings: &Settings, params: &MediaSelectionParams) -> Vec<PathBuf> {
    selected_album_paths(&settings.album_viewing.folder_paths, &params.album_names)
        .into_iter()
        .map(|p| std::path::absolute(&p).unwrap_or(p))
        .collect()
}

async fn drive(
    mut settings_rx: watch::Receiver<Arc<Settings>>,
    mut params_rx: watch::Receiver<(MediaSelectionParams, u64)>,
    mut matrix_rx: watch::Receiver<Arc<TagMatrix>>,
    file_access: Arc<dyn FileAccess>,
    list_tx: watch::Sender<Arc<Vec<MediaItem>>>,
) {
    let mut settings = settings_rx.borrow_and_update().clone();
    let (mut params, mut seed) = params_rx.borrow_and_update().clone();
    let mut matrix = matrix_rx.borrow_and_update().clone();

    let (album_tx, album_rx) = flume::bounded::<()>(1);
    let mut album_paths = album_paths_for(&settings, &params);
    let mut _album_watches = AlbumWatches::start(&file_access, &album_paths, &album_tx);

    let mut cycle = start_cycle(&file_access, &album_paths, &params, &matrix, seed);

    loop {
        tokio::select! {
            changed = settings_rx.changed() => {
                if changed.is_err() {
                    debug!("Settings closed, stopping selection");
                    return;
                }
                settings = settings_rx.borrow_and_update().clone();
                let paths = album_paths_for(&settings, &params);
                if paths != album_paths {
                    album_paths = paths;
                    _album_watches = AlbumWatches::start(&file_access, &album_paths, &album_tx);
                }
                trace!("Settings changed, restarting cycle");
            }
            changed = params_rx.changed() => {
                if changed.is_err() {
                    return;
                }
                (params, seed) = params_rx.borrow_and_update().clone();
                let paths = album_paths_for(&settings, &params);
                if paths != album_paths {
                    album_paths = paths;
                    _album_watches = AlbumWatches::start(&file_access, &album_paths, &album_tx);
                }
                trace!(seed, "Params changed, restarting cycle");
            }
            changed = matrix_rx.changed() => {
                if changed.is_err() {
                    debug!("Tag matrix closed, stopping selection");
                    return;
                }
                matrix = matrix_rx.borrow_and_update().clone();
                trace!("Tag matrix changed, restarting cycle");
            }
            Ok(()) = album_rx.recv_async() => {
                trace!("Album contents changed, restarting cycle");
            }
            items = next_result(&mut cycle) => {
                cycle = None;
                list_tx.send_replace(Arc::new(items));
                continue;
            }
        }

        // Replacing the future drops the previous cycle at its next await.
        cycle = start_cycle(&file_access, &album_paths, &params, &matrix, seed);
    }
}

/// One full pass from album listing to a sorted, non-empty list.
async fn run_cycle(
    file_access: Arc<dyn FileAccess>,
    album_paths: Vec<PathBuf>,
    params: MediaSelectionParams,
    matrix: Arc<TagMatrix>,
    seed: u64,
) -> Vec<MediaItem> {
    let started = Instant::now();

    let listing_access = Arc::clone(&file_access);
    let listing_paths = album_paths.clone();
    let files = task::spawn_blocking(move || {
        listing_paths
            .iter()
            .flat_map(|path| listing_access.list_files(path))
            .collect::<Vec<_>>()
    })
    .await
    .unwrap_or_else(|e| {
        warn!(error = %e, "Album listing failed");
        Vec::new()
    });
    let listed = files.len();
    task::yield_now().await;

    let files: Vec<PathBuf> = files
        .into_iter()
        .filter(|path| !is_hidden(path, &album_paths))
        .filter(|path| matches_media_type(path, &params.media_types))
        .collect();
    task::yield_now().await;

    let files = filter_by_tags(files, &params, &matrix);
    task::yield_now().await;

    let metadata_access = Arc::clone(&file_access);
    let metadata = task::spawn_blocking(move || {
        files
            .iter()
            .map(|path| metadata_access.read_metadata(path))
            .collect::<Vec<_>>()
    })
    .await
    .unwrap_or_else(|e| {
        warn!(error = %e, "Metadata read failed");
        Vec::new()
    });
    task::yield_now().await;

    let items = to_media_items(sort_metadata(metadata, params.sorting_type, seed));

    debug!(
        albums = album_paths.len(),
        listed,
        selected = items.iter().filter(|i| !i.is_placeholder()).count(),
        sort = %params.sorting_type,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Selection cycle finished"
    );
    items
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FileMetadata, MediaType, SortingType};
    use crate::storage::{ChangeWatch, LocalFileAccess};
    use std::fs;
    use std::path::Path;
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};

    /// Local listing with watches that only emit on subscribe.
    struct QuietFiles;

    impl FileAccess for QuietFiles {
        fn list_files(&self, path: &Path) -> Vec<PathBuf> {
            LocalFileAccess.list_files(path)
        }

        fn read_metadata(&self, path: &Path) -> FileMetadata {
            LocalFileAccess.read_metadata(path)
        }

        fn watch_changes(&self, _path: &Path) -> ChangeWatch {
            let (tx, rx) = flume::bounded(1);
            let _ = tx.try_send(());
            ChangeWatch::new(rx, tx)
        }
    }

    /// Local listing with album watches fired by the test.
    struct ManualFiles {
        trigger: flume::Receiver<()>,
        keep: flume::Sender<()>,
    }

    impl FileAccess for ManualFiles {
        fn list_files(&self, path: &Path) -> Vec<PathBuf> {
            LocalFileAccess.list_files(path)
        }

        fn read_metadata(&self, path: &Path) -> FileMetadata {
            LocalFileAccess.read_metadata(path)
        }

        fn watch_changes(&self, _path: &Path) -> ChangeWatch {
            ChangeWatch::new(self.trigger.clone(), self.keep.clone())
        }
    }

    struct Fixture {
        dir: TempDir,
        settings: SettingsService,
        engine: Arc<TagMatrixEngine>,
        pipeline: MediaSelectionPipeline,
    }

    fn fixture() -> Fixture {
        fixture_with(Arc::new(QuietFiles))
    }

    /// `album_files` backs the pipeline only; the engine always gets quiet watches.
    fn fixture_with(album_files: Arc<dyn FileAccess>) -> Fixture {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("trip/sub")).unwrap();
        fs::create_dir_all(dir.path().join("trip/.thumbs")).unwrap();
        fs::create_dir_all(dir.path().join("empty")).unwrap();

        for (name, size) in [
            ("trip/img001.jpg", 30),
            ("trip/img002.png", 10),
            ("trip/sub/anim.gif", 20),
            ("trip/sub/clip.mp4", 40),
            ("trip/.thumbs/img001.jpg", 1),
            ("trip/.hidden.jpg", 1),
            ("trip/notes.txt", 1),
        ] {
            fs::write(dir.path().join(name), vec![0u8; size]).unwrap();
        }

        let settings = SettingsService::open(dir.path().join("settings.json"));
        let mut updated = Settings::default();
        updated.album_viewing.folder_paths = vec![dir.path().join("trip"), dir.path().join("empty")];
        updated.album_viewing.tags_csv_path = dir.path().join("tags.csv");
        settings.update_settings(updated).unwrap();

        let engine = Arc::new(TagMatrixEngine::new(&settings, Arc::new(QuietFiles)));
        let pipeline =
            MediaSelectionPipeline::new(settings.clone(), album_files, Arc::clone(&engine));

        Fixture {
            dir,
            settings,
            engine,
            pipeline,
        }
    }

    fn params(album: &str, sort: SortingType) -> MediaSelectionParams {
        MediaSelectionParams::new(vec![album.to_string()], MediaType::selectable(), sort)
    }

    /// Waits for a list matching `done`.
    async fn wait_for(
        sub: &mut MediaListSubscription,
        done: impl Fn(&[MediaItem]) -> bool,
    ) -> Arc<Vec<MediaItem>> {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let current = sub.current();
                if done(current.as_slice()) {
                    return current;
                }
                sub.changed().await.unwrap();
            }
        })
        .await
        .unwrap()
    }

    fn loaded(items: &[MediaItem]) -> bool {
        items.first().map(|i| i.media_type) != Some(MediaType::Loading)
    }

    fn stems(items: &[MediaItem]) -> Vec<String> {
        items.iter().map(MediaItem::stem).collect()
    }

    #[tokio::test]
    async fn test_starts_with_loading() {
        let f = fixture();
        let sub = f.pipeline.execute(params("trip", SortingType::NameAToZ), 0);
        assert_eq!(*sub.current(), vec![MediaItem::loading()]);
    }

    #[tokio::test]
    async fn test_lists_visible_media_sorted() {
        let f = fixture();
        let mut sub = f.pipeline.execute(params("trip", SortingType::NameAToZ), 0);

        let items = wait_for(&mut sub, loaded).await;
        assert_eq!(stems(&items), ["anim", "clip", "img001", "img002"]);
        assert!(items.iter().all(|i| i.path.starts_with(f.dir.path())));
        assert_eq!(items[0].media_type, MediaType::Gif);
        assert!(items.iter().all(|i| i.version > 0));
    }

    #[tokio::test]
    async fn test_empty_album_gives_none_sentinel() {
        let f = fixture();
        let mut sub = f.pipeline.execute(params("empty", SortingType::Random), 0);
        let items = wait_for(&mut sub, loaded).await;
        assert_eq!(*items, vec![MediaItem::none()]);
    }

    #[tokio::test]
    async fn test_unknown_album_gives_none_sentinel() {
        let f = fixture();
        let mut sub = f.pipeline.execute(params("nowhere", SortingType::Random), 0);
        let items = wait_for(&mut sub, loaded).await;
        assert_eq!(*items, vec![MediaItem::none()]);
    }

    #[tokio::test]
    async fn test_params_change_restarts() {
        let f = fixture();
        let mut sub = f.pipeline.execute(params("trip", SortingType::SizeSmallToBig), 7);
        let items = wait_for(&mut sub, loaded).await;
        assert_eq!(stems(&items), ["img002", "anim", "img001", "clip"]);

        let seed = sub.seed();
        let next = params("trip", SortingType::SizeBigToSmall);
        let hash = next.stable_hash();
        sub.set_params(next);
        assert_eq!(sub.seed(), seed.wrapping_add(hash));

        let items = wait_for(&mut sub, |i| {
            i.first().map(MediaItem::stem).as_deref() == Some("clip")
        })
        .await;
        assert_eq!(stems(&items), ["clip", "img001", "anim", "img002"]);

        // Identical params keep the seed.
        sub.set_params(params("trip", SortingType::SizeBigToSmall));
        assert_eq!(sub.seed(), seed.wrapping_add(hash));
    }

    #[tokio::test]
    async fn test_tag_change_refilters() {
        let f = fixture();
        let mut sub = f
            .pipeline
            .execute(params("trip", SortingType::NameAToZ).with_included("beach"), 0);
        let items = wait_for(&mut sub, loaded).await;
        assert_eq!(*items, vec![MediaItem::none()]);

        f.engine.write_tag_hit("img002", "beach", true);
        let items = wait_for(&mut sub, |i| !i[0].is_placeholder()).await;
        assert_eq!(stems(&items), ["img002"]);

        sub.update_params(|p| p.switch_tag("beach", true));
        let items = wait_for(&mut sub, |i| i.len() == 3).await;
        assert_eq!(stems(&items), ["anim", "clip", "img001"]);
    }

    #[tokio::test]
    async fn test_random_order_is_stable_for_seed() {
        let f = fixture();
        let mut first = f.pipeline.execute(params("trip", SortingType::Random), 99);
        let mut second = f.pipeline.execute(params("trip", SortingType::Random), 99);

        let a = wait_for(&mut first, loaded).await;
        let b = wait_for(&mut second, loaded).await;
        assert_eq!(a, b);
        assert_eq!(a.len(), 4);
    }

    #[tokio::test]
    async fn test_album_change_restarts() {
        let (trigger, rx) = flume::unbounded();
        let f = fixture_with(Arc::new(ManualFiles {
            trigger: rx,
            keep: trigger.clone(),
        }));
        let mut sub = f.pipeline.execute(params("trip", SortingType::NameAToZ), 0);
        let items = wait_for(&mut sub, loaded).await;
        assert_eq!(stems(&items), ["anim", "clip", "img001", "img002"]);

        fs::write(f.dir.path().join("trip/img003.webp"), [0u8; 5]).unwrap();
        trigger.send(()).unwrap();

        let items = wait_for(&mut sub, |i| i.len() == 5).await;
        assert_eq!(stems(&items), ["anim", "clip", "img001", "img002", "img003"]);
    }

    #[tokio::test]
    async fn test_folder_settings_change_reselects() {
        let f = fixture();
        let mut sub = f.pipeline.execute(params("trip", SortingType::NameAToZ), 0);
        let items = wait_for(&mut sub, loaded).await;
        assert_eq!(items.len(), 4);

        // Another folder with the same album name replaces the first.
        let moved = f.dir.path().join("moved/trip");
        fs::create_dir_all(&moved).unwrap();
        fs::write(moved.join("beach.jpg"), [0u8; 3]).unwrap();

        let mut settings = (*f.settings.read_settings()).clone();
        settings.album_viewing.folder_paths = vec![moved.clone()];
        f.settings.update_settings(settings).unwrap();

        let items = wait_for(&mut sub, |i| i.len() == 1 && !i[0].is_placeholder()).await;
        assert_eq!(stems(&items), ["beach"]);
        assert!(items[0].path.starts_with(&moved));
    }

    #[tokio::test]
    async fn test_reordered_albums_keep_seed() {
        let f = fixture();
        let both = |albums: [&str; 2]| {
            MediaSelectionParams::new(
                albums.iter().map(|a| a.to_string()).collect(),
                MediaType::selectable(),
                SortingType::Random,
            )
        };
        let sub = f.pipeline.execute(both(["trip", "empty"]), 5);

        sub.set_params(both(["empty", "trip"]));
        assert_eq!(sub.seed(), 5);
    }
}
