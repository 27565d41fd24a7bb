pub mod media_item;
pub mod selection;
pub mod tag_matrix;

pub use media_item::*;
pub use selection::*;
pub use tag_matrix::*;
