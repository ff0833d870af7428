//! Storage seam for the pipeline: one transaction per flush.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::IngestError;
use crate::models::{
    Checkpoint, ClassificationAttributes, ClassificationKind, NaturalKey, ProductRow,
    RawArchiveRecord,
};

/// A classification row as currently stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredClassification {
    pub id: i64,
    pub attributes: ClassificationAttributes,
}

/// Result of an insert-if-absent on a classification table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted(i64),
    /// A row with the same natural key already exists (possibly written
    /// concurrently); the caller re-reads it.
    Conflict,
}

#[async_trait]
pub trait IngestStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn FlushTx>, IngestError>;

    async fn load_checkpoint(&self, source: &str) -> Result<Option<Checkpoint>, IngestError>;
}

/// Operations available inside one flush transaction. Nothing is visible to
/// other readers until [`FlushTx::commit`].
#[async_trait]
pub trait FlushTx: Send {
    async fn upsert_raw_archive(&mut self, rows: &[RawArchiveRecord]) -> Result<u64, IngestError>;

    /// Surrogate ids of archive rows, keyed by external id. Missing ids are absent.
    async fn archive_ids(
        &mut self,
        source: &str,
        external_ids: &[String],
    ) -> Result<HashMap<String, i64>, IngestError>;

    async fn upsert_products(&mut self, rows: &[ProductRow]) -> Result<u64, IngestError>;

    async fn find_classification(
        &mut self,
        kind: ClassificationKind,
        key: &NaturalKey,
    ) -> Result<Option<StoredClassification>, IngestError>;

    async fn update_classification(
        &mut self,
        kind: ClassificationKind,
        id: i64,
        attributes: &ClassificationAttributes,
    ) -> Result<(), IngestError>;

    async fn insert_classification(
        &mut self,
        kind: ClassificationKind,
        key: &NaturalKey,
        attributes: &ClassificationAttributes,
    ) -> Result<InsertOutcome, IngestError>;

    /// Insert `(product external id, classification id)` pairs, ignoring ones
    /// that already exist. Returns the number of new pairs.
    async fn insert_junctions(
        &mut self,
        kind: ClassificationKind,
        pairs: &[(String, i64)],
    ) -> Result<u64, IngestError>;

    async fn save_checkpoint(&mut self, checkpoint: &Checkpoint) -> Result<(), IngestError>;

    async fn commit(self: Box<Self>) -> Result<(), IngestError>;

    async fn rollback(self: Box<Self>) -> Result<(), IngestError>;
}
