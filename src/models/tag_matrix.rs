//! Filename × tag association matrix and its CSV row encoding.
//!
//! The matrix is kept in a normalized shape at all times:
//! - `filenames` are unique and sorted, so lookups use binary search
//! - `tags` keep header order, with tags discovered later appended
//! - every filename row has at least one set cell (tagless rows are pruned)
//!
//! Row layout on disk:
//! - header: `["filenames <yyyy-MM-dd_HH:mm:ss.SSS>", "tag1,tag2,..."]`
//! - body: `[filename_stem, "tagA,tagC"]`

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, NaiveDateTime};

/// chrono format of the write timestamp embedded in the header.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H:%M:%S%.3f";

/// Length of a formatted timestamp, e.g. `2024-01-01_00:00:00.000`.
const TIMESTAMP_LEN: usize = 23;

/// Label written before the timestamp in the first header field.
const HEADER_LABEL: &str = "filenames";

/// One tag and whether a given file carries it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagHit {
    pub name: String,
    pub is_hit: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagMatrix {
    filenames: Vec<String>,
    tags: Vec<String>,
    occurrence: Vec<Vec<bool>>,
    timestamp: Option<i64>,
}

impl TagMatrix {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Builds a matrix from parsed CSV rows.
    ///
    /// Every field after the first is read as a comma-joined tag list, so both
    /// `name,"a,b"` and `name,a,b` produce the same row. Rows with fewer than
    /// two fields or no tags are skipped, and repeated filenames are merged.
    pub fn from_rows(rows: &[Vec<String>]) -> Self {
        let mut rows_iter = rows.iter();
        let header = rows_iter.next();

        let timestamp = header
            .and_then(|h| h.first())
            .and_then(|field| parse_timestamp(field));

        let mut tags: Vec<String> = Vec::new();
        let mut tag_index: HashMap<String, usize> = HashMap::new();
        let mut remember_tag = |tag: &str, tags: &mut Vec<String>| {
            if !tag_index.contains_key(tag) {
                tag_index.insert(tag.to_string(), tags.len());
                tags.push(tag.to_string());
            }
        };

        if let Some(header) = header {
            for tag in header.iter().skip(1).flat_map(|f| split_to_tags(f)) {
                remember_tag(tag.as_str(), &mut tags);
            }
        }

        let mut by_filename: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for row in rows_iter {
            if row.len() < 2 {
                continue;
            }
            let filename = row[0].trim();
            if filename.is_empty() {
                continue;
            }
            let file_tags: Vec<String> = row[1..].iter().flat_map(|f| split_to_tags(f)).collect();
            if file_tags.is_empty() {
                continue;
            }
            for tag in &file_tags {
                remember_tag(tag.as_str(), &mut tags);
            }
            by_filename
                .entry(filename.to_string())
                .or_default()
                .extend(file_tags);
        }

        let mut filenames = Vec::with_capacity(by_filename.len());
        let mut occurrence = Vec::with_capacity(by_filename.len());
        for (filename, file_tags) in by_filename {
            occurrence.push(tags.iter().map(|t| file_tags.contains(t)).collect());
            filenames.push(filename);
        }

        Self {
            filenames,
            tags,
            occurrence,
            timestamp,
        }
    }

    /// Serializes the matrix into CSV rows, header first.
    pub fn to_rows(&self) -> Vec<Vec<String>> {
        let header_label = match self.timestamp.and_then(format_timestamp) {
            Some(ts) => format!("{HEADER_LABEL} {ts}"),
            None => HEADER_LABEL.to_string(),
        };

        let mut rows = Vec::with_capacity(self.filenames.len() + 1);
        rows.push(vec![header_label, self.tags.join(",")]);

        for (filename, row) in self.filenames.iter().zip(&self.occurrence) {
            let file_tags: Vec<&str> = self
                .tags
                .iter()
                .zip(row)
                .filter(|&(_, &set)| set)
                .map(|(tag, _)| tag.as_str())
                .collect();
            rows.push(vec![filename.clone(), file_tags.join(",")]);
        }

        rows
    }

    /// Returns a copy with one cell set or cleared.
    ///
    /// Filename and tag are trimmed the same way parsing trims them.
    /// A missing filename gets a new row at its sorted position. Setting an
    /// unknown tag appends it to the vocabulary, clearing one is a no-op.
    /// Rows left without any tag are pruned. The timestamp is carried over
    /// unchanged.
    pub fn with_tag_hit(&self, filename: &str, tag: &str, is_hit: bool) -> Self {
        let mut next = self.clone();
        let filename = filename.trim();
        let tag = tag.trim();
        if filename.is_empty() || tag.is_empty() || tag.contains(',') {
            return next;
        }

        let tag_index = match next.tags.iter().position(|t| t == tag) {
            Some(index) => index,
            None if is_hit => {
                next.tags.push(tag.to_string());
                for row in &mut next.occurrence {
                    row.push(false);
                }
                next.tags.len() - 1
            }
            None => return next,
        };

        let file_index = match next.filenames.binary_search_by(|f| f.as_str().cmp(filename)) {
            Ok(index) => index,
            Err(index) => {
                next.filenames.insert(index, filename.to_string());
                next.occurrence.insert(index, vec![false; next.tags.len()]);
                index
            }
        };

        next.occurrence[file_index][tag_index] = is_hit;
        next.prune();
        next
    }

    pub fn with_timestamp(mut self, timestamp: Option<i64>) -> Self {
        self.timestamp = timestamp;
        self
    }

    fn prune(&mut self) {
        let filenames = std::mem::take(&mut self.filenames);
        let occurrence = std::mem::take(&mut self.occurrence);
        for (filename, row) in filenames.into_iter().zip(occurrence) {
            if row.iter().any(|&set| set) {
                self.filenames.push(filename);
                self.occurrence.push(row);
            }
        }
    }

    pub fn filenames(&self) -> &[String] {
        &self.filenames
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    #[cfg(test)]
    pub fn occurrence(&self) -> &[Vec<bool>] {
        &self.occurrence
    }

    pub fn timestamp(&self) -> Option<i64> {
        self.timestamp
    }

    pub fn is_empty(&self) -> bool {
        self.filenames.is_empty() && self.tags.is_empty()
    }

    pub fn row(&self, filename: &str) -> Option<&[bool]> {
        self.filenames
            .binary_search_by(|f| f.as_str().cmp(filename))
            .ok()
            .map(|index| self.occurrence[index].as_slice())
    }

    pub fn tags_for(&self, filename: &str) -> BTreeSet<String> {
        match self.row(filename) {
            Some(row) => self
                .tags
                .iter()
                .zip(row)
                .filter(|&(_, &set)| set)
                .map(|(tag, _)| tag.clone())
                .collect(),
            None => BTreeSet::new(),
        }
    }

    /// Every tag of the vocabulary paired with whether `filename` carries it.
    pub fn tag_hits_for(&self, filename: &str) -> Vec<TagHit> {
        let row = self.row(filename);
        self.tags
            .iter()
            .enumerate()
            .map(|(index, tag)| TagHit {
                name: tag.clone(),
                is_hit: row.is_some_and(|r| r[index]),
            })
            .collect()
    }

    /// Whether a freshly parsed matrix may replace `current`.
    ///
    /// Only a matrix strictly older than a known current timestamp is rejected.
    pub fn supersedes(&self, current: &TagMatrix) -> bool {
        match (self.timestamp, current.timestamp) {
            (Some(new), Some(cur)) => new >= cur,
            _ => true,
        }
    }

    /// Equality that ignores the write timestamp.
    pub fn same_content(&self, other: &TagMatrix) -> bool {
        self.filenames == other.filenames
            && self.tags == other.tags
            && self.occurrence == other.occurrence
    }
}

/// Splits a comma-joined tag list, trimming and dropping empty or repeated tags.
pub fn split_to_tags(field: &str) -> Vec<String> {
    let mut seen = BTreeSet::new();
    field
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .filter(|t| seen.insert(*t))
        .map(str::to_string)
        .collect()
}

/// Reads a UTC timestamp from a header field.
///
/// The field may be the timestamp alone or end with it. Anything else yields
/// `None`, which callers treat as "age unknown".
pub fn parse_timestamp(field: &str) -> Option<i64> {
    let field = field.trim();
    let parse = |s: &str| {
        NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT)
            .ok()
            .map(|dt| dt.and_utc().timestamp_millis())
    };

    parse(field).or_else(|| {
        let start = field.len().checked_sub(TIMESTAMP_LEN)?;
        if !field.is_char_boundary(start) {
            return None;
        }
        parse(&field[start..])
    })
}

pub fn format_timestamp(millis: i64) -> Option<String> {
    DateTime::from_timestamp_millis(millis).map(|dt| dt.format(TIMESTAMP_FORMAT).to_string())
}
