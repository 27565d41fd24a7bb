//! Media list selection: album listing, filtering, sorting.

pub mod filter;
pub mod pipeline;

pub use pipeline::{MediaListSubscription, MediaSelectionPipeline};
