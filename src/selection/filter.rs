//! Pure stages of a selection cycle.

use std::cmp::Reverse;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::models::{
    filename_stem, FileMetadata, MediaItem, MediaSelectionParams, MediaType, SortingType, TagMatrix,
};

/// Folders whose last path segment is one of `album_names`.
pub fn selected_album_paths(folder_paths: &[PathBuf], album_names: &[String]) -> Vec<PathBuf> {
    folder_paths
        .iter()
        .filter(|path| {
            path.file_name()
                .map(|name| album_names.iter().any(|a| name == a.as_str()))
                .unwrap_or(false)
        })
        .cloned()
        .collect()
}

/// Whether any component below the containing album starts with a dot.
///
/// With nested albums the innermost one counts.
pub fn is_hidden(path: &Path, album_paths: &[PathBuf]) -> bool {
    let relative = album_paths
        .iter()
        .filter_map(|album| path.strip_prefix(album).ok())
        .min_by_key(|relative| relative.components().count())
        .unwrap_or_else(|| Path::new(path.file_name().unwrap_or_default()));

    relative
        .components()
        .any(|c| c.as_os_str().to_string_lossy().starts_with('.'))
}

pub fn matches_media_type(path: &Path, media_types: &BTreeSet<MediaType>) -> bool {
    match MediaType::from_path(path) {
        MediaType::None | MediaType::Loading => false,
        media_type => media_types.contains(&media_type),
    }
}

/// Applies the included/excluded tag selection.
///
/// With included tags, a file must carry all of them and none of the excluded
/// ones; an included tag missing from the vocabulary therefore matches
/// nothing. With exclusions only, files carrying any excluded tag are dropped
/// and untagged files are kept.
pub fn filter_by_tags(
    mut paths: Vec<PathBuf>,
    params: &MediaSelectionParams,
    matrix: &TagMatrix,
) -> Vec<PathBuf> {
    if !params.uses_tags() {
        return paths;
    }

    let column = |tag: &String| matrix.tags().iter().position(|t| t == tag);
    let excluded: Vec<usize> = params.excluded_tags().iter().filter_map(column).collect();

    if params.included_tags().is_empty() {
        paths.retain(|path| match matrix.row(&filename_stem(path)) {
            Some(row) => !excluded.iter().any(|&c| row[c]),
            None => true,
        });
        return paths;
    }

    let included: Option<Vec<usize>> = params.included_tags().iter().map(column).collect();
    let Some(included) = included else {
        return Vec::new();
    };

    paths.retain(|path| {
        matrix.row(&filename_stem(path)).is_some_and(|row| {
            included.iter().all(|&c| row[c]) && !excluded.iter().any(|&c| row[c])
        })
    });
    paths
}

/// Orders metadata for display.
///
/// Random order is a shuffle seeded by `seed` over path-sorted input, so the
/// same files and seed always give the same order.
pub fn sort_metadata(
    mut metadata: Vec<FileMetadata>,
    sorting_type: SortingType,
    seed: u64,
) -> Vec<FileMetadata> {
    match sorting_type {
        SortingType::Random => {
            metadata.sort_by(|a, b| a.full_path.cmp(&b.full_path));
            metadata.shuffle(&mut StdRng::seed_from_u64(seed));
        }
        SortingType::DateNewToOld => metadata.sort_by_key(|m| Reverse(m.modification_timestamp)),
        SortingType::DateOldToNew => metadata.sort_by_key(|m| m.modification_timestamp),
        SortingType::NameAToZ => metadata.sort_by_cached_key(|m| filename_stem(&m.full_path)),
        SortingType::NameZToA => {
            metadata.sort_by_cached_key(|m| Reverse(filename_stem(&m.full_path)))
        }
        SortingType::SizeSmallToBig => metadata.sort_by_key(|m| m.size),
        SortingType::SizeBigToSmall => metadata.sort_by_key(|m| Reverse(m.size)),
    }
    metadata
}

/// Converts sorted metadata into the published list; never empty.
pub fn to_media_items(metadata: Vec<FileMetadata>) -> Vec<MediaItem> {
    if metadata.is_empty() {
        return vec![MediaItem::none()];
    }

    metadata
        .into_iter()
        .map(|m| {
            let media_type = MediaType::from_path(&m.full_path);
            MediaItem::new(m.full_path, media_type, m.modification_timestamp)
        })
        .collect()
}
