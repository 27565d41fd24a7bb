//! User-facing selection request: which albums, which media types, how to sort,
//! and which tags to require or reject.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use xxhash_rust::xxh3::xxh3_64;

use super::media_item::MediaType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SortingType {
    #[default]
    Random,
    DateNewToOld,
    DateOldToNew,
    NameAToZ,
    NameZToA,
    SizeSmallToBig,
    SizeBigToSmall,
}

impl SortingType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Random => "random",
            Self::DateNewToOld => "date-new",
            Self::DateOldToNew => "date-old",
            Self::NameAToZ => "name-az",
            Self::NameZToA => "name-za",
            Self::SizeSmallToBig => "size-small",
            Self::SizeBigToSmall => "size-big",
        }
    }
}

impl fmt::Display for SortingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SortingType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "random" => Ok(Self::Random),
            "date-new" => Ok(Self::DateNewToOld),
            "date-old" => Ok(Self::DateOldToNew),
            "name-az" => Ok(Self::NameAToZ),
            "name-za" => Ok(Self::NameZToA),
            "size-small" => Ok(Self::SizeSmallToBig),
            "size-big" => Ok(Self::SizeBigToSmall),
            other => Err(format!("unknown sort order: {other}")),
        }
    }
}

/// The current filter/sort request.
///
/// Included and excluded tags never overlap: every mutator that adds a tag to
/// one set removes it from the other. Album order is not significant.
#[derive(Debug, Clone)]
pub struct MediaSelectionParams {
    pub album_names: Vec<String>,
    pub media_types: BTreeSet<MediaType>,
    pub sorting_type: SortingType,
    included_tags: BTreeSet<String>,
    excluded_tags: BTreeSet<String>,
}

impl MediaSelectionParams {
    pub fn new(
        album_names: Vec<String>,
        media_types: impl IntoIterator<Item = MediaType>,
        sorting_type: SortingType,
    ) -> Self {
        Self {
            album_names,
            media_types: media_types.into_iter().collect(),
            sorting_type,
            included_tags: BTreeSet::new(),
            excluded_tags: BTreeSet::new(),
        }
    }

    pub fn with_included(mut self, tag: impl Into<String>) -> Self {
        self.include(tag.into());
        self
    }

    pub fn with_excluded(mut self, tag: impl Into<String>) -> Self {
        self.exclude(tag.into());
        self
    }

    pub fn included_tags(&self) -> &BTreeSet<String> {
        &self.included_tags
    }

    pub fn excluded_tags(&self) -> &BTreeSet<String> {
        &self.excluded_tags
    }

    pub fn uses_tags(&self) -> bool {
        !self.included_tags.is_empty() || !self.excluded_tags.is_empty()
    }

    pub fn include(&mut self, tag: String) {
        self.excluded_tags.remove(&tag);
        self.included_tags.insert(tag);
    }

    pub fn exclude(&mut self, tag: String) {
        self.included_tags.remove(&tag);
        self.excluded_tags.insert(tag);
    }

    pub fn clear_tag(&mut self, tag: &str) {
        self.included_tags.remove(tag);
        self.excluded_tags.remove(tag);
    }

    /// Cycles one tag's selection state.
    ///
    /// An excluded tag goes back to neutral. Otherwise `toggle_exclusion`
    /// excludes it, and a plain switch flips inclusion.
    pub fn switch_tag(&mut self, tag: &str, toggle_exclusion: bool) {
        if self.excluded_tags.contains(tag) {
            self.clear_tag(tag);
        } else if toggle_exclusion {
            self.exclude(tag.to_string());
        } else if self.included_tags.contains(tag) {
            self.clear_tag(tag);
        } else {
            self.include(tag.to_string());
        }
    }

    pub fn include_all<'a>(&mut self, tags: impl IntoIterator<Item = &'a String>) {
        self.excluded_tags.clear();
        self.included_tags = tags.into_iter().cloned().collect();
    }

    pub fn exclude_all<'a>(&mut self, tags: impl IntoIterator<Item = &'a String>) {
        self.included_tags.clear();
        self.excluded_tags = tags.into_iter().cloned().collect();
    }

    pub fn clear_tags(&mut self) {
        self.included_tags.clear();
        self.excluded_tags.clear();
    }

    fn album_set(&self) -> BTreeSet<&str> {
        self.album_names.iter().map(String::as_str).collect()
    }

    /// Hash that stays the same across runs for equal params.
    pub fn stable_hash(&self) -> u64 {
        let mut data = Vec::with_capacity(128);
        for album in self.album_set() {
            data.extend_from_slice(album.as_bytes());
            data.push(0);
        }
        data.push(1);
        for media_type in &self.media_types {
            data.extend_from_slice(media_type.as_str().as_bytes());
            data.push(0);
        }
        data.push(1);
        data.extend_from_slice(self.sorting_type.as_str().as_bytes());
        data.push(1);
        for tag in &self.included_tags {
            data.push(b'+');
            data.extend_from_slice(tag.as_bytes());
            data.push(0);
        }
        for tag in &self.excluded_tags {
            data.push(b'-');
            data.extend_from_slice(tag.as_bytes());
            data.push(0);
        }
        xxh3_64(&data)
    }
}

impl PartialEq for MediaSelectionParams {
    fn eq(&self, other: &Self) -> bool {
        self.album_set() == other.album_set()
            && self.media_types == other.media_types
            && self.sorting_type == other.sorting_type
            && self.included_tags == other.included_tags
            && self.excluded_tags == other.excluded_tags
    }
}

impl Eq for MediaSelectionParams {}

impl Default for MediaSelectionParams {
    fn default() -> Self {
        Self::new(Vec::new(), MediaType::selectable(), SortingType::default())
    }
}
