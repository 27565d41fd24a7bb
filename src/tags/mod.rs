//! Tag matrix ownership and reactive tag views.

pub mod engine;

use thiserror::Error;

use crate::storage::StoreError;

pub use engine::TagMatrixEngine;

#[derive(Debug, Error)]
pub enum TagMatrixError {
    #[error("parsed tag matrix ({parsed:?}) is older than the current one ({current:?})")]
    Stale {
        parsed: Option<i64>,
        current: Option<i64>,
    },

    #[error("failed to read tag matrix: {0}")]
    Parse(#[from] StoreError),
}
