pub mod client;

pub use client::{parse_page, DugaClient};

use async_trait::async_trait;
use serde_json::Value;

use crate::config::FetchFilters;
use crate::error::IngestError;

/// One page of raw catalog items plus the source-reported total.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CatalogPage {
    pub items: Vec<Value>,
    pub total_count: u64,
}

/// Paged access to a product catalog. `offset` is 1-based.
#[async_trait]
pub trait CatalogSource: Send + Sync {
    async fn fetch(
        &self,
        offset: u64,
        page_size: u32,
        filters: &FetchFilters,
    ) -> Result<CatalogPage, IngestError>;
}
