//! Generic insert-or-update rendering and classification entity resolution.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use sqlx::query_builder::Separated;
use sqlx::{Postgres, QueryBuilder};
use tracing::{debug, warn};

use super::store::{FlushTx, InsertOutcome};
use crate::error::IngestError;
use crate::models::{ClassificationAttributes, ClassificationKind, NaturalKey, NormalizedRecord, ProductRow};

/// Postgres caps a statement at 65535 bind parameters.
const MAX_BIND_PARAMS: usize = 65_535;

/// `INSERT INTO table (columns) VALUES ... ON CONFLICT (unique) DO UPDATE/NOTHING`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsertStatement {
    pub table: &'static str,
    pub columns: Vec<&'static str>,
    pub update_columns: Vec<&'static str>,
    pub unique_columns: Vec<&'static str>,
}

impl UpsertStatement {
    pub fn new(
        table: &'static str,
        columns: &[&'static str],
        update_columns: &[&'static str],
        unique_columns: &[&'static str],
    ) -> Self {
        Self {
            table,
            columns: columns.to_vec(),
            update_columns: update_columns.to_vec(),
            unique_columns: unique_columns.to_vec(),
        }
    }

    pub fn insert_prefix(&self) -> String {
        format!("INSERT INTO {} ({}) ", self.table, self.columns.join(", "))
    }

    /// Empty when there are no unique columns; `DO NOTHING` when nothing is updatable.
    pub fn conflict_clause(&self) -> String {
        if self.unique_columns.is_empty() {
            return String::new();
        }
        let target = self.unique_columns.join(", ");
        if self.update_columns.is_empty() {
            return format!(" ON CONFLICT ({target}) DO NOTHING");
        }
        let sets = self
            .update_columns
            .iter()
            .map(|c| format!("{c} = EXCLUDED.{c}"))
            .collect::<Vec<_>>()
            .join(", ");
        format!(" ON CONFLICT ({target}) DO UPDATE SET {sets}")
    }

    /// Largest row count that stays under the bind parameter limit.
    pub fn rows_per_statement(&self) -> usize {
        (MAX_BIND_PARAMS / self.columns.len().max(1)).max(1)
    }

    /// Build a multi-row statement. `bind` must push one value per column.
    pub fn build<'a, T, F>(&self, rows: &'a [T], bind: F) -> QueryBuilder<'a, Postgres>
    where
        F: FnMut(Separated<'_, 'a, Postgres, &'static str>, &'a T),
    {
        let mut qb: QueryBuilder<'a, Postgres> = QueryBuilder::new(self.insert_prefix());
        qb.push_values(rows, bind);
        qb.push(self.conflict_clause());
        qb
    }
}

/// Return the surrogate id for `key`, creating the entity if needed and
/// refreshing its descriptive attributes when they changed.
pub async fn resolve_classification(
    tx: &mut dyn FlushTx,
    kind: ClassificationKind,
    key: &NaturalKey,
    attributes: &ClassificationAttributes,
) -> Result<i64, IngestError> {
    if let Some(existing) = tx.find_classification(kind, key).await? {
        if existing.attributes != *attributes {
            tx.update_classification(kind, existing.id, attributes).await?;
        }
        return Ok(existing.id);
    }

    match tx.insert_classification(kind, key, attributes).await? {
        InsertOutcome::Inserted(id) => {
            debug!(%kind, %key, id, "classification created");
            Ok(id)
        }
        InsertOutcome::Conflict => {
            debug!(%kind, %key, "classification insert conflicted; re-reading");
            let winner = tx
                .find_classification(kind, key)
                .await?
                .ok_or_else(|| IngestError::Conflict {
                    kind,
                    key: key.to_string(),
                })?;
            if winner.attributes != *attributes {
                tx.update_classification(kind, winner.id, attributes).await?;
            }
            Ok(winner.id)
        }
    }
}

/// Per-kind cache of committed resolutions: natural key to surrogate id and
/// the attributes last written.
#[derive(Debug, Clone, Default)]
pub struct ClassificationIndex {
    by_kind: BTreeMap<ClassificationKind, HashMap<NaturalKey, (i64, ClassificationAttributes)>>,
}

impl ClassificationIndex {
    /// Cached id, only when the stored attributes still match.
    pub fn fresh_id(
        &self,
        kind: ClassificationKind,
        key: &NaturalKey,
        attributes: &ClassificationAttributes,
    ) -> Option<i64> {
        self.by_kind
            .get(&kind)?
            .get(key)
            .filter(|(_, cached)| cached == attributes)
            .map(|(id, _)| *id)
    }

    pub fn record(
        &mut self,
        kind: ClassificationKind,
        key: NaturalKey,
        id: i64,
        attributes: ClassificationAttributes,
    ) {
        self.by_kind.entry(kind).or_default().insert(key, (id, attributes));
    }

    pub fn merge(&mut self, other: ClassificationIndex) {
        for (kind, entries) in other.by_kind {
            self.by_kind.entry(kind).or_default().extend(entries);
        }
    }

    /// Cached resolutions across all kinds.
    pub(crate) fn len(&self) -> usize {
        self.by_kind.values().map(HashMap::len).sum()
    }
}

/// What one batch wrote inside its (not yet committed) transaction.
#[derive(Debug, Default)]
pub struct BatchWrite {
    pub raw_rows: u64,
    pub products: u64,
    pub missing_archive_links: usize,
    pub junctions_inserted: u64,
    /// Resolutions made in this batch, merged into the run index on commit.
    pub resolved: ClassificationIndex,
}

/// Write one buffered batch: raw archive, products, classifications, junctions.
pub async fn write_batch(
    tx: &mut dyn FlushTx,
    records: &[&NormalizedRecord],
    index: &ClassificationIndex,
) -> Result<BatchWrite, IngestError> {
    let mut out = BatchWrite::default();
    if records.is_empty() {
        return Ok(out);
    }

    let raws: Vec<_> = records.iter().map(|r| r.raw.clone()).collect();
    out.raw_rows = tx.upsert_raw_archive(&raws).await?;

    let mut by_source: BTreeMap<&str, Vec<String>> = BTreeMap::new();
    for r in records {
        by_source
            .entry(r.product.source.as_str())
            .or_default()
            .push(r.product.external_id.clone());
    }
    let mut archive_ids: HashMap<(String, String), i64> = HashMap::new();
    for (source, ids) in by_source {
        for (ext, id) in tx.archive_ids(source, &ids).await? {
            archive_ids.insert((source.to_string(), ext), id);
        }
    }

    let mut products = Vec::with_capacity(records.len());
    for r in records {
        let link = archive_ids
            .get(&(r.product.source.clone(), r.product.external_id.clone()))
            .copied();
        if link.is_none() {
            out.missing_archive_links += 1;
            warn!(
                source = %r.product.source,
                external_id = %r.product.external_id,
                "raw archive row missing after upsert; product stored without link"
            );
        }
        products.push(ProductRow {
            product: r.product.clone(),
            raw_api_data_id: link,
        });
    }
    out.products = tx.upsert_products(&products).await?;

    let mut pairs: BTreeMap<ClassificationKind, BTreeSet<(String, i64)>> = BTreeMap::new();
    for r in records {
        for (kind, candidates) in &r.classifications {
            for c in candidates {
                let cached = out
                    .resolved
                    .fresh_id(*kind, &c.key, &c.attributes)
                    .or_else(|| index.fresh_id(*kind, &c.key, &c.attributes));
                let id = match cached {
                    Some(id) => id,
                    None => {
                        let id = resolve_classification(tx, *kind, &c.key, &c.attributes).await?;
                        out.resolved
                            .record(*kind, c.key.clone(), id, c.attributes.clone());
                        id
                    }
                };
                pairs
                    .entry(*kind)
                    .or_default()
                    .insert((r.product.external_id.clone(), id));
            }
        }
    }

    for (kind, set) in pairs {
        let pairs: Vec<(String, i64)> = set.into_iter().collect();
        out.junctions_inserted += tx.insert_junctions(kind, &pairs).await?;
    }
    Ok(out)
}
