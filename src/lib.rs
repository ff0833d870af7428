pub mod batch;
pub mod config;
pub mod database_ops;
pub mod error;
pub mod models;
pub mod normalization;
pub mod orchestrator;
pub mod tracing;

pub mod util {
    pub mod db;
    pub mod env;
}

pub use config::{FetchFilters, IngestConfig};
pub use error::{IngestError, ValidationError};
pub use orchestrator::{Pipeline, RunSummary, Termination};
