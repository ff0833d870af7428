//! In-memory [`IngestStore`] backing `--dry-run` and the test-suite.
//!
//! `begin` snapshots the committed state, `commit` publishes the snapshot,
//! `rollback` drops it. Fault and race injection hooks let tests exercise
//! the failure paths of a flush.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;

use super::store::{FlushTx, IngestStore, InsertOutcome, StoredClassification};
use crate::error::IngestError;
use crate::models::{
    Checkpoint, ClassificationAttributes, ClassificationKind, NaturalKey, ProductRow,
    RawArchiveRecord,
};

#[derive(Debug, Clone, PartialEq)]
pub struct StoredRaw {
    pub id: i64,
    pub record: RawArchiveRecord,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredProduct {
    pub row: ProductRow,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassificationRow {
    pub id: i64,
    pub external_id: Option<String>,
    pub attributes: ClassificationAttributes,
}

impl ClassificationRow {
    fn matches(&self, key: &NaturalKey) -> bool {
        match key {
            NaturalKey::ExternalId(id) => self.external_id.as_deref() == Some(id.as_str()),
            NaturalKey::Name(name) => self.external_id.is_none() && self.attributes.name == *name,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryState {
    pub raw: IndexMap<(String, String), StoredRaw>,
    pub products: IndexMap<(String, String), StoredProduct>,
    pub classifications: BTreeMap<ClassificationKind, Vec<ClassificationRow>>,
    pub junctions: BTreeMap<ClassificationKind, BTreeSet<(String, i64)>>,
    pub checkpoints: HashMap<String, Checkpoint>,
    next_id: i64,
}

impl MemoryState {
    fn allocate_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Row counts of the committed state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreCounts {
    pub raw: usize,
    pub products: usize,
    pub classifications: BTreeMap<ClassificationKind, usize>,
    pub junctions: BTreeMap<ClassificationKind, usize>,
}

/// Where an injected failure fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailPoint {
    UpsertRawArchive,
    UpsertProducts,
    InsertJunctions,
    Commit,
}

/// Makes the next classification insert of `kind` lose to a row written by
/// another session just before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RaceConflict {
    pub kind: ClassificationKind,
}

#[derive(Debug, Default)]
struct Faults {
    /// (point, 1-based transaction number)
    fail_at: Option<(FailPoint, usize)>,
    race: Option<RaceConflict>,
    race_winners: Vec<i64>,
    transactions_begun: usize,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
    faults: Arc<Mutex<Faults>>,
}

fn lock<T>(m: &Mutex<T>) -> Result<MutexGuard<'_, T>, IngestError> {
    m.lock()
        .map_err(|_| IngestError::persistence("memory store", "lock poisoned"))
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail at `point` during the `transaction`-th flush (1-based).
    pub fn fail_at(&self, point: FailPoint, transaction: usize) {
        if let Ok(mut f) = self.faults.lock() {
            f.fail_at = Some((point, transaction));
        }
    }

    pub fn inject_race(&self, race: RaceConflict) {
        if let Ok(mut f) = self.faults.lock() {
            f.race = Some(race);
        }
    }

    /// Ids of rows planted by injected races.
    pub fn race_winner_ids(&self) -> Vec<i64> {
        self.faults
            .lock()
            .map(|f| f.race_winners.clone())
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> MemoryState {
        self.state.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn counts(&self) -> StoreCounts {
        let s = self.snapshot();
        StoreCounts {
            raw: s.raw.len(),
            products: s.products.len(),
            classifications: s
                .classifications
                .iter()
                .map(|(k, rows)| (*k, rows.len()))
                .collect(),
            junctions: s.junctions.iter().map(|(k, set)| (*k, set.len())).collect(),
        }
    }
}

#[async_trait]
impl IngestStore for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn FlushTx>, IngestError> {
        let working = lock(&self.state)?.clone();
        let number = {
            let mut f = lock(&self.faults)?;
            f.transactions_begun += 1;
            f.transactions_begun
        };
        Ok(Box::new(MemoryTx {
            store: self.clone(),
            working,
            number,
        }))
    }

    async fn load_checkpoint(&self, source: &str) -> Result<Option<Checkpoint>, IngestError> {
        Ok(lock(&self.state)?.checkpoints.get(source).cloned())
    }
}

pub struct MemoryTx {
    store: MemoryStore,
    working: MemoryState,
    number: usize,
}

impl MemoryTx {
    fn check(&self, point: FailPoint) -> Result<(), IngestError> {
        let f = lock(&self.store.faults)?;
        if f.fail_at == Some((point, self.number)) {
            return Err(IngestError::persistence(
                format!("{point:?}"),
                "injected failure",
            ));
        }
        Ok(())
    }

    fn take_race(&self, kind: ClassificationKind) -> Result<bool, IngestError> {
        let mut f = lock(&self.store.faults)?;
        if f.race.map(|r| r.kind) == Some(kind) {
            f.race = None;
            return Ok(true);
        }
        Ok(false)
    }
}

#[async_trait]
impl FlushTx for MemoryTx {
    async fn upsert_raw_archive(&mut self, rows: &[RawArchiveRecord]) -> Result<u64, IngestError> {
        self.check(FailPoint::UpsertRawArchive)?;
        for row in rows {
            let key = (row.source.clone(), row.external_id.clone());
            match self.working.raw.get_mut(&key) {
                Some(existing) => {
                    existing.record.payload = row.payload.clone();
                    existing.record.fetched_at = row.fetched_at;
                    existing.record.updated_at = row.updated_at;
                }
                None => {
                    let id = self.working.allocate_id();
                    self.working.raw.insert(
                        key,
                        StoredRaw {
                            id,
                            record: row.clone(),
                        },
                    );
                }
            }
        }
        Ok(rows.len() as u64)
    }

    async fn archive_ids(
        &mut self,
        source: &str,
        external_ids: &[String],
    ) -> Result<HashMap<String, i64>, IngestError> {
        Ok(external_ids
            .iter()
            .filter_map(|ext| {
                self.working
                    .raw
                    .get(&(source.to_string(), ext.clone()))
                    .map(|r| (ext.clone(), r.id))
            })
            .collect())
    }

    async fn upsert_products(&mut self, rows: &[ProductRow]) -> Result<u64, IngestError> {
        self.check(FailPoint::UpsertProducts)?;
        let now = Utc::now();
        for row in rows {
            let key = (row.product.source.clone(), row.product.external_id.clone());
            let created_at = self
                .working
                .products
                .get(&key)
                .map(|p| p.created_at)
                .unwrap_or(now);
            self.working.products.insert(
                key,
                StoredProduct {
                    row: row.clone(),
                    created_at,
                    updated_at: now,
                },
            );
        }
        Ok(rows.len() as u64)
    }

    async fn find_classification(
        &mut self,
        kind: ClassificationKind,
        key: &NaturalKey,
    ) -> Result<Option<StoredClassification>, IngestError> {
        Ok(self
            .working
            .classifications
            .get(&kind)
            .and_then(|rows| rows.iter().find(|r| r.matches(key)))
            .map(|r| StoredClassification {
                id: r.id,
                attributes: r.attributes.clone(),
            }))
    }

    async fn update_classification(
        &mut self,
        kind: ClassificationKind,
        id: i64,
        attributes: &ClassificationAttributes,
    ) -> Result<(), IngestError> {
        let row = self
            .working
            .classifications
            .get_mut(&kind)
            .and_then(|rows| rows.iter_mut().find(|r| r.id == id))
            .ok_or_else(|| {
                IngestError::persistence(format!("update {}", kind.table()), "row not found")
            })?;
        row.attributes = attributes.clone();
        Ok(())
    }

    async fn insert_classification(
        &mut self,
        kind: ClassificationKind,
        key: &NaturalKey,
        attributes: &ClassificationAttributes,
    ) -> Result<InsertOutcome, IngestError> {
        let external_id = match key {
            NaturalKey::ExternalId(id) => Some(id.clone()),
            NaturalKey::Name(_) => None,
        };

        if self.take_race(kind)? {
            // Another session commits the same key first.
            let mut shared = lock(&self.store.state)?;
            let id = shared.allocate_id().max(self.working.next_id + 1);
            shared.next_id = id;
            let rival = ClassificationRow {
                id,
                external_id: external_id.clone(),
                attributes: attributes.clone(),
            };
            shared.classifications.entry(kind).or_default().push(rival.clone());
            self.working.next_id = self.working.next_id.max(id);
            self.working.classifications.entry(kind).or_default().push(rival);
            lock(&self.store.faults)?.race_winners.push(id);
            return Ok(InsertOutcome::Conflict);
        }

        let exists = self
            .working
            .classifications
            .get(&kind)
            .is_some_and(|rows| rows.iter().any(|r| r.matches(key)));
        if exists {
            return Ok(InsertOutcome::Conflict);
        }
        let id = self.working.allocate_id();
        self.working
            .classifications
            .entry(kind)
            .or_default()
            .push(ClassificationRow {
                id,
                external_id,
                attributes: attributes.clone(),
            });
        Ok(InsertOutcome::Inserted(id))
    }

    async fn insert_junctions(
        &mut self,
        kind: ClassificationKind,
        pairs: &[(String, i64)],
    ) -> Result<u64, IngestError> {
        self.check(FailPoint::InsertJunctions)?;
        let set = self.working.junctions.entry(kind).or_default();
        let inserted = pairs.iter().filter(|p| set.insert((*p).clone())).count();
        Ok(inserted as u64)
    }

    async fn save_checkpoint(&mut self, checkpoint: &Checkpoint) -> Result<(), IngestError> {
        self.working
            .checkpoints
            .insert(checkpoint.source.clone(), checkpoint.clone());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), IngestError> {
        self.check(FailPoint::Commit)?;
        let MemoryTx { store, working, .. } = *self;
        *lock(&store.state)? = working;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), IngestError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(ext: &str) -> RawArchiveRecord {
        RawArchiveRecord {
            source: "duga".into(),
            external_id: ext.into(),
            payload: json!({"productid": ext}),
            fetched_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn nothing_is_visible_before_commit() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.upsert_raw_archive(&[raw("a")]).await.unwrap();
        assert_eq!(store.counts().raw, 0);
        tx.commit().await.unwrap();
        assert_eq!(store.counts().raw, 1);
    }

    #[tokio::test]
    async fn rollback_discards_writes() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.upsert_raw_archive(&[raw("a"), raw("b")]).await.unwrap();
        tx.rollback().await.unwrap();
        assert_eq!(store.counts(), StoreCounts::default());
    }

    #[tokio::test]
    async fn raw_upsert_keeps_id_on_reingest() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.upsert_raw_archive(&[raw("a")]).await.unwrap();
        let first = tx.archive_ids("duga", &["a".into()]).await.unwrap()["a"];
        tx.upsert_raw_archive(&[raw("a")]).await.unwrap();
        let second = tx.archive_ids("duga", &["a".into()]).await.unwrap()["a"];
        assert_eq!(first, second);
        assert!(tx
            .archive_ids("duga", &["zzz".into()])
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn name_keys_ignore_rows_with_external_ids() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let a = ClassificationAttributes {
            name: "Drama".into(),
            slug: "drama".into(),
            kana: None,
        };
        let by_id = NaturalKey::ExternalId("1".into());
        let by_name = NaturalKey::Name("Drama".into());
        tx.insert_classification(ClassificationKind::Genre, &by_id, &a)
            .await
            .unwrap();
        assert!(tx
            .find_classification(ClassificationKind::Genre, &by_name)
            .await
            .unwrap()
            .is_none());
        assert!(matches!(
            tx.insert_classification(ClassificationKind::Genre, &by_id, &a)
                .await
                .unwrap(),
            InsertOutcome::Conflict
        ));
    }

    #[tokio::test]
    async fn injected_failure_fires_on_chosen_transaction() {
        let store = MemoryStore::new();
        store.fail_at(FailPoint::UpsertRawArchive, 2);
        let mut first = store.begin().await.unwrap();
        assert!(first.upsert_raw_archive(&[raw("a")]).await.is_ok());
        first.commit().await.unwrap();
        let mut second = store.begin().await.unwrap();
        let err = second.upsert_raw_archive(&[raw("b")]).await.unwrap_err();
        assert_eq!(err.kind(), "persistence");
    }
}
