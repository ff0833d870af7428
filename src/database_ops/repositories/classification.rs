use sqlx::{PgConnection, Row};

use crate::database_ops::store::{InsertOutcome, StoredClassification};
use crate::error::IngestError;
use crate::models::{ClassificationAttributes, ClassificationKind, NaturalKey};

/// SQL for one classification table, rendered once per kind.
#[derive(Debug, Clone)]
pub struct ClassificationRepository {
    kind: ClassificationKind,
    find_by_external_id: String,
    find_by_name: String,
    update: String,
    insert: String,
}

impl ClassificationRepository {
    pub fn new(kind: ClassificationKind) -> Self {
        let table = kind.table();
        let kana_col = if kind.has_kana() { "kana" } else { "NULL::text AS kana" };
        let select = format!("SELECT id, name, slug, {kana_col} FROM {table}");
        let (update, insert) = if kind.has_kana() {
            (
                format!(
                    "UPDATE {table} SET name = $2, slug = $3, kana = $4, updated_at = now() WHERE id = $1"
                ),
                format!(
                    "INSERT INTO {table} (external_id, name, slug, kana, created_at, updated_at) \
                     VALUES ($1, $2, $3, $4, now(), now()) ON CONFLICT DO NOTHING RETURNING id"
                ),
            )
        } else {
            (
                format!("UPDATE {table} SET name = $2, slug = $3, updated_at = now() WHERE id = $1"),
                format!(
                    "INSERT INTO {table} (external_id, name, slug, created_at, updated_at) \
                     VALUES ($1, $2, $3, now(), now()) ON CONFLICT DO NOTHING RETURNING id"
                ),
            )
        };
        Self {
            kind,
            find_by_external_id: format!("{select} WHERE external_id = $1"),
            find_by_name: format!("{select} WHERE external_id IS NULL AND name = $1"),
            update,
            insert,
        }
    }

    pub fn kind(&self) -> ClassificationKind {
        self.kind
    }

    pub async fn find(
        &self,
        conn: &mut PgConnection,
        key: &NaturalKey,
    ) -> Result<Option<StoredClassification>, IngestError> {
        let sql = match key {
            NaturalKey::ExternalId(_) => self.find_by_external_id.as_str(),
            NaturalKey::Name(_) => self.find_by_name.as_str(),
        };
        let row = sqlx::query(sql)
            .persistent(false)
            .bind(key.value())
            .fetch_optional(&mut *conn)
            .await
            .map_err(|e| IngestError::persistence(format!("find {}", self.kind.table()), e))?;
        let Some(row) = row else {
            return Ok(None);
        };
        let decode = |e: sqlx::Error| IngestError::persistence(format!("decode {}", self.kind.table()), e);
        Ok(Some(StoredClassification {
            id: row.try_get("id").map_err(decode)?,
            attributes: ClassificationAttributes {
                name: row.try_get("name").map_err(decode)?,
                slug: row.try_get("slug").map_err(decode)?,
                kana: row.try_get("kana").map_err(decode)?,
            },
        }))
    }

    pub async fn update(
        &self,
        conn: &mut PgConnection,
        id: i64,
        attributes: &ClassificationAttributes,
    ) -> Result<(), IngestError> {
        let mut q = sqlx::query(&self.update)
            .persistent(false)
            .bind(id)
            .bind(&attributes.name)
            .bind(&attributes.slug);
        if self.kind.has_kana() {
            q = q.bind(&attributes.kana);
        }
        q.execute(&mut *conn)
            .await
            .map_err(|e| IngestError::persistence(format!("update {}", self.kind.table()), e))?;
        Ok(())
    }

    /// Insert-if-absent. No returned row means another row already holds the key.
    pub async fn insert(
        &self,
        conn: &mut PgConnection,
        key: &NaturalKey,
        attributes: &ClassificationAttributes,
    ) -> Result<InsertOutcome, IngestError> {
        let external_id = match key {
            NaturalKey::ExternalId(id) => Some(id.as_str()),
            NaturalKey::Name(_) => None,
        };
        let mut q = sqlx::query_scalar::<_, i64>(&self.insert)
            .persistent(false)
            .bind(external_id)
            .bind(&attributes.name)
            .bind(&attributes.slug);
        if self.kind.has_kana() {
            q = q.bind(&attributes.kana);
        }
        let id = q
            .fetch_optional(&mut *conn)
            .await
            .map_err(|e| IngestError::persistence(format!("insert {}", self.kind.table()), e))?;
        Ok(id.map_or(InsertOutcome::Conflict, InsertOutcome::Inserted))
    }
}
