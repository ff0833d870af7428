pub mod date;
pub mod price;
pub mod record;
pub mod slug;

pub use record::{normalize_item, CategoryMapping, NormalizeContext};
