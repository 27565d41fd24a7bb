//! User settings persisted as JSON.
//!
//! - Missing or unparseable files fall back to defaults (a schema change resets)
//! - Every update is published on a watch channel before it is written
//! - Writes go through a temporary file and a rename

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use directories::{ProjectDirs, UserDirs};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

const APP_NAME: &str = "ambient-gallery";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid settings JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("could not determine a configuration directory")]
    NoConfigDir,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Settings {
    #[serde(default)]
    pub album_viewing: AlbumViewingSettings,
    #[serde(default)]
    pub bluetooth_lights: BluetoothLightsSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlbumViewingSettings {
    /// Album root folders; the last path segment is the album name.
    #[serde(default = "default_folder_paths")]
    pub folder_paths: Vec<PathBuf>,
    #[serde(default = "default_tags_csv_path")]
    pub tags_csv_path: PathBuf,
    #[serde(default = "default_autoplay_presets")]
    pub autoplay_delay_presets_seconds: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BluetoothLightsSettings {
    #[serde(default)]
    pub mac_addresses: Vec<String>,
    /// ARGB colors offered as quick picks.
    #[serde(default = "default_color_presets")]
    pub color_presets: Vec<u32>,
}

impl Default for AlbumViewingSettings {
    fn default() -> Self {
        Self {
            folder_paths: default_folder_paths(),
            tags_csv_path: default_tags_csv_path(),
            autoplay_delay_presets_seconds: default_autoplay_presets(),
        }
    }
}

impl Default for BluetoothLightsSettings {
    fn default() -> Self {
        Self {
            mac_addresses: Vec::new(),
            color_presets: default_color_presets(),
        }
    }
}

impl AlbumViewingSettings {
    /// Album names derived from the configured folders, in folder order.
    pub fn album_names(&self) -> Vec<String> {
        self.folder_paths
            .iter()
            .filter_map(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .collect()
    }
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "", APP_NAME)
}

fn default_folder_paths() -> Vec<PathBuf> {
    let downloads = UserDirs::new().and_then(|d| {
        d.download_dir()
            .map(Path::to_path_buf)
            .or_else(|| Some(d.home_dir().join("Downloads")))
    });
    downloads.into_iter().collect()
}

fn default_tags_csv_path() -> PathBuf {
    project_dirs()
        .map(|d| d.config_dir().join("tags.csv"))
        .unwrap_or_else(|| PathBuf::from("tags.csv"))
}

fn default_autoplay_presets() -> Vec<u32> {
    vec![0, 5, 10, 20, 30]
}

fn default_color_presets() -> Vec<u32> {
    vec![
        0xFFFFFF00, 0xFF00FF00, 0xFF00FFFF, 0xFF0000FF, 0xFF000000, 0xFFFF0000, 0xFFFF00FF,
        0xFFFFFFFF,
    ]
}

/// Text-form view of the editable settings, one entry per line.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EditableSettings {
    pub album_paths: String,
    pub tags_csv_path: String,
    pub mac_addresses: String,
}

impl EditableSettings {
    pub fn from_settings(settings: &Settings) -> Self {
        let album_paths = settings
            .album_viewing
            .folder_paths
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join("\n");

        Self {
            album_paths,
            tags_csv_path: settings.album_viewing.tags_csv_path.display().to_string(),
            mac_addresses: settings.bluetooth_lights.mac_addresses.join("\n"),
        }
    }

    /// Writes the edited fields onto `settings`, keeping everything else.
    pub fn apply_to(&self, settings: &Settings) -> Settings {
        let mut updated = settings.clone();
        updated.album_viewing.folder_paths = lines(&self.album_paths).map(PathBuf::from).collect();
        updated.album_viewing.tags_csv_path = PathBuf::from(self.tags_csv_path.trim());
        updated.bluetooth_lights.mac_addresses = lines(&self.mac_addresses)
            .map(str::to_uppercase)
            .collect();
        updated
    }
}

fn lines(text: &str) -> impl Iterator<Item = &str> {
    text.lines().map(str::trim).filter(|l| !l.is_empty())
}

struct Inner {
    path: PathBuf,
    tx: watch::Sender<Arc<Settings>>,
    write_lock: Mutex<()>,
}

/// Shared handle to the settings file and its latest value.
#[derive(Clone)]
pub struct SettingsService {
    inner: Arc<Inner>,
}

impl SettingsService {
    /// Opens the settings at `path`, falling back to defaults.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let settings = Self::load(&path);
        let (tx, _) = watch::channel(Arc::new(settings));

        Self {
            inner: Arc::new(Inner {
                path,
                tx,
                write_lock: Mutex::new(()),
            }),
        }
    }

    pub fn open_default() -> Result<Self, SettingsError> {
        Ok(Self::open(Self::default_path()?))
    }

    /// `<config dir>/ambient-gallery/settings.json`
    pub fn default_path() -> Result<PathBuf, SettingsError> {
        project_dirs()
            .map(|d| d.config_dir().join("settings.json"))
            .ok_or(SettingsError::NoConfigDir)
    }

    fn load(path: &Path) -> Settings {
        let data = match fs::read_to_string(path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!(?path, "No settings file, using defaults");
                return Settings::default();
            }
            Err(e) => {
                warn!(?path, error = %e, "Failed to read settings, using defaults");
                return Settings::default();
            }
        };

        match serde_json::from_str(&data) {
            Ok(settings) => {
                debug!(?path, "Loaded settings");
                settings
            }
            Err(e) => {
                warn!(?path, error = %e, "Settings unreadable, resetting to defaults");
                Settings::default()
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn read_settings(&self) -> Arc<Settings> {
        self.inner.tx.borrow().clone()
    }

    /// Receiver that replays the latest settings to new subscribers.
    pub fn watch_settings(&self) -> watch::Receiver<Arc<Settings>> {
        self.inner.tx.subscribe()
    }

    /// Publishes `settings`, then persists them.
    ///
    /// Subscribers see the new value even if the write fails.
    pub fn update_settings(&self, settings: Settings) -> Result<(), SettingsError> {
        let _guard = self.inner.write_lock.lock();
        let settings = Arc::new(settings);
        self.inner.tx.send_replace(Arc::clone(&settings));
        self.persist(&settings)
    }

    pub fn apply_editable(&self, editable: &EditableSettings) -> Result<(), SettingsError> {
        let updated = editable.apply_to(&self.read_settings());
        self.update_settings(updated)
    }

    fn persist(&self, settings: &Settings) -> Result<(), SettingsError> {
        let path = &self.inner.path;
        let io_error = |source| SettingsError::Io {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_error)?;
        }

        let json = serde_json::to_string_pretty(settings)?;
        let temp_path = path.with_extension("json.tmp");
        fs::write(&temp_path, json).map_err(io_error)?;
        fs::rename(&temp_path, path).map_err(io_error)?;

        debug!(?path, "Saved settings");
        Ok(())
    }
}
