use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{Postgres, Transaction};
use tracing::debug;

use super::db::Db;
use super::repositories::Repositories;
use super::store::{FlushTx, IngestStore, InsertOutcome, StoredClassification};
use crate::error::IngestError;
use crate::models::{
    Checkpoint, ClassificationAttributes, ClassificationKind, NaturalKey, ProductRow,
    RawArchiveRecord,
};

/// PostgreSQL-backed [`IngestStore`].
#[derive(Clone)]
pub struct PgIngestStore {
    db: Db,
    repos: Arc<Repositories>,
}

impl PgIngestStore {
    pub fn new(db: Db) -> Self {
        Self {
            db,
            repos: Arc::new(Repositories::default()),
        }
    }
}

#[async_trait]
impl IngestStore for PgIngestStore {
    async fn begin(&self) -> Result<Box<dyn FlushTx>, IngestError> {
        let tx = self
            .db
            .pool
            .begin()
            .await
            .map_err(|e| IngestError::persistence("begin flush transaction", e))?;
        Ok(Box::new(PgFlushTx {
            tx,
            repos: Arc::clone(&self.repos),
        }))
    }

    async fn load_checkpoint(&self, source: &str) -> Result<Option<Checkpoint>, IngestError> {
        self.repos.checkpoints.load(&self.db.pool, source).await
    }
}

pub struct PgFlushTx {
    tx: Transaction<'static, Postgres>,
    repos: Arc<Repositories>,
}

#[async_trait]
impl FlushTx for PgFlushTx {
    async fn upsert_raw_archive(&mut self, rows: &[RawArchiveRecord]) -> Result<u64, IngestError> {
        self.repos.raw_archive.upsert(&mut self.tx, rows).await
    }

    async fn archive_ids(
        &mut self,
        source: &str,
        external_ids: &[String],
    ) -> Result<HashMap<String, i64>, IngestError> {
        self.repos.raw_archive.ids(&mut self.tx, source, external_ids).await
    }

    async fn upsert_products(&mut self, rows: &[ProductRow]) -> Result<u64, IngestError> {
        self.repos.products.upsert(&mut self.tx, rows).await
    }

    async fn find_classification(
        &mut self,
        kind: ClassificationKind,
        key: &NaturalKey,
    ) -> Result<Option<StoredClassification>, IngestError> {
        self.repos.classification(kind).find(&mut self.tx, key).await
    }

    async fn update_classification(
        &mut self,
        kind: ClassificationKind,
        id: i64,
        attributes: &ClassificationAttributes,
    ) -> Result<(), IngestError> {
        self.repos
            .classification(kind)
            .update(&mut self.tx, id, attributes)
            .await
    }

    async fn insert_classification(
        &mut self,
        kind: ClassificationKind,
        key: &NaturalKey,
        attributes: &ClassificationAttributes,
    ) -> Result<InsertOutcome, IngestError> {
        self.repos
            .classification(kind)
            .insert(&mut self.tx, key, attributes)
            .await
    }

    async fn insert_junctions(
        &mut self,
        kind: ClassificationKind,
        pairs: &[(String, i64)],
    ) -> Result<u64, IngestError> {
        if pairs.is_empty() {
            return Ok(0);
        }
        self.repos.junction(kind).insert(&mut self.tx, pairs).await
    }

    async fn save_checkpoint(&mut self, checkpoint: &Checkpoint) -> Result<(), IngestError> {
        self.repos.checkpoints.save(&mut self.tx, checkpoint).await
    }

    async fn commit(self: Box<Self>) -> Result<(), IngestError> {
        self.tx
            .commit()
            .await
            .map_err(|e| IngestError::persistence("commit flush transaction", e))?;
        debug!("flush transaction committed");
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), IngestError> {
        self.tx
            .rollback()
            .await
            .map_err(|e| IngestError::persistence("rollback flush transaction", e))
    }
}
