use sqlx::{PgConnection, PgPool, Row};

use crate::error::IngestError;
use crate::models::Checkpoint;

const UPSERT: &str = "INSERT INTO ingest_checkpoints (source_name, next_offset, filters_fingerprint, updated_at) \
                      VALUES ($1, $2, $3, $4) \
                      ON CONFLICT (source_name) DO UPDATE SET next_offset = EXCLUDED.next_offset, \
                      filters_fingerprint = EXCLUDED.filters_fingerprint, updated_at = EXCLUDED.updated_at";
const SELECT: &str = "SELECT source_name, next_offset, filters_fingerprint, updated_at \
                      FROM ingest_checkpoints WHERE source_name = $1";

#[derive(Debug, Clone, Default)]
pub struct CheckpointRepository;

impl CheckpointRepository {
    pub async fn save(
        &self,
        conn: &mut PgConnection,
        checkpoint: &Checkpoint,
    ) -> Result<(), IngestError> {
        let offset = i64::try_from(checkpoint.next_offset)
            .map_err(|e| IngestError::persistence("save checkpoint", e))?;
        sqlx::query(UPSERT)
            .persistent(false)
            .bind(&checkpoint.source)
            .bind(offset)
            .bind(&checkpoint.filters_fingerprint)
            .bind(checkpoint.updated_at)
            .execute(&mut *conn)
            .await
            .map_err(|e| IngestError::persistence("save checkpoint", e))?;
        Ok(())
    }

    pub async fn load(&self, pool: &PgPool, source: &str) -> Result<Option<Checkpoint>, IngestError> {
        let row = sqlx::query(SELECT)
            .persistent(false)
            .bind(source)
            .fetch_optional(pool)
            .await
            .map_err(|e| IngestError::persistence("load checkpoint", e))?;
        let Some(row) = row else {
            return Ok(None);
        };
        let decode = |e: sqlx::Error| IngestError::persistence("decode checkpoint", e);
        let offset: i64 = row.try_get("next_offset").map_err(decode)?;
        Ok(Some(Checkpoint {
            source: row.try_get("source_name").map_err(decode)?,
            next_offset: u64::try_from(offset).unwrap_or(1),
            filters_fingerprint: row.try_get("filters_fingerprint").map_err(decode)?,
            updated_at: row.try_get("updated_at").map_err(decode)?,
        }))
    }
}
