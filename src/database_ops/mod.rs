pub mod duga;
pub mod memory;
pub mod postgres;
pub mod repositories;
pub mod store;
pub mod upsert;

pub use crate::util::db;
