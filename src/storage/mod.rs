//! Filesystem and CSV persistence services.

pub mod csv_store;
pub mod file_access;

use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub use csv_store::{CsvStore, WriteFailure};
pub use file_access::{ChangeWatch, FileAccess, LocalFileAccess};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed CSV in {path:?}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("failed to prepare CSV rows for {path:?}")]
    Producer { path: PathBuf },
}
