use std::collections::HashMap;

use sqlx::PgConnection;

use crate::database_ops::upsert::UpsertStatement;
use crate::error::IngestError;
use crate::models::RawArchiveRecord;

/// `raw_api_data`: verbatim payloads, unique on `(source_name, external_id)`.
#[derive(Debug, Clone)]
pub struct RawArchiveRepository {
    upsert: UpsertStatement,
    select_ids: &'static str,
}

impl Default for RawArchiveRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl RawArchiveRepository {
    pub fn new() -> Self {
        Self {
            upsert: UpsertStatement::new(
                "raw_api_data",
                &["source_name", "external_id", "payload", "fetched_at", "updated_at"],
                &["payload", "fetched_at", "updated_at"],
                &["source_name", "external_id"],
            ),
            select_ids: "SELECT external_id, id FROM raw_api_data \
                         WHERE source_name = $1 AND external_id = ANY($2)",
        }
    }

    pub async fn upsert(
        &self,
        conn: &mut PgConnection,
        rows: &[RawArchiveRecord],
    ) -> Result<u64, IngestError> {
        let mut affected = 0;
        for chunk in rows.chunks(self.upsert.rows_per_statement()) {
            let mut qb = self.upsert.build(chunk, |mut b, r| {
                b.push_bind(&r.source)
                    .push_bind(&r.external_id)
                    .push_bind(&r.payload)
                    .push_bind(r.fetched_at)
                    .push_bind(r.updated_at);
            });
            affected += qb
                .build()
                .persistent(false)
                .execute(&mut *conn)
                .await
                .map_err(|e| IngestError::persistence("upsert raw_api_data", e))?
                .rows_affected();
        }
        Ok(affected)
    }

    pub async fn ids(
        &self,
        conn: &mut PgConnection,
        source: &str,
        external_ids: &[String],
    ) -> Result<HashMap<String, i64>, IngestError> {
        let rows: Vec<(String, i64)> = sqlx::query_as(self.select_ids)
            .persistent(false)
            .bind(source)
            .bind(external_ids)
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| IngestError::persistence("select raw_api_data ids", e))?;
        Ok(rows.into_iter().collect())
    }
}
