use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MediaType {
    Image,
    Gif,
    Video,
    None,
    Loading,
}

impl MediaType {
    pub fn from_extension(ext: &str) -> Self {
        match ext.to_lowercase().as_str() {
            "jpg" | "jpeg" | "png" | "webp" => Self::Image,
            "gif" => Self::Gif,
            "mp4" | "avi" | "mkv" | "webm" | "gifv" => Self::Video,
            _ => Self::None,
        }
    }

    pub fn from_path(path: &Path) -> Self {
        path.extension()
            .and_then(|e| e.to_str())
            .map(Self::from_extension)
            .unwrap_or(Self::None)
    }

    /// Types a user can select for display.
    pub fn selectable() -> [Self; 3] {
        [Self::Image, Self::Gif, Self::Video]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Gif => "gif",
            Self::Video => "video",
            Self::None => "none",
            Self::Loading => "loading",
        }
    }
}

/// One viewable file.
///
/// `version` is the modification time in milliseconds, so a file rewritten in
/// place still reloads even though its path is unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MediaItem {
    pub path: PathBuf,
    pub media_type: MediaType,
    pub version: i64,
}

impl MediaItem {
    pub fn new(path: PathBuf, media_type: MediaType, version: i64) -> Self {
        Self {
            path,
            media_type,
            version,
        }
    }

    /// Placeholder emitted instead of an empty list.
    pub fn none() -> Self {
        Self::new(PathBuf::new(), MediaType::None, 0)
    }

    /// Placeholder shown before the first selection cycle completes.
    pub fn loading() -> Self {
        Self::new(PathBuf::new(), MediaType::Loading, 0)
    }

    pub fn is_placeholder(&self) -> bool {
        matches!(self.media_type, MediaType::None | MediaType::Loading)
    }

    pub fn stem(&self) -> String {
        filename_stem(&self.path)
    }
}

/// File metadata used for sorting.
///
/// Unreadable files report zero for both fields, which sorts them as old and
/// small instead of failing the whole listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMetadata {
    pub full_path: PathBuf,
    pub modification_timestamp: i64,
    pub size: u64,
}

impl FileMetadata {
    pub fn unreadable(full_path: PathBuf) -> Self {
        Self {
            full_path,
            modification_timestamp: 0,
            size: 0,
        }
    }
}

/// File name without directory and extension, the tag matrix key.
pub fn filename_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}
