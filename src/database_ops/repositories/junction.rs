use sqlx::PgConnection;

use crate::database_ops::upsert::UpsertStatement;
use crate::error::IngestError;
use crate::models::ClassificationKind;

/// `product_<kind>` link table; pairs are inserted once and never updated.
#[derive(Debug, Clone)]
pub struct JunctionRepository {
    kind: ClassificationKind,
    insert: UpsertStatement,
}

impl JunctionRepository {
    pub fn new(kind: ClassificationKind) -> Self {
        let columns = ["product_id", kind.fk_column()];
        Self {
            kind,
            insert: UpsertStatement::new(kind.junction_table(), &columns, &[], &columns),
        }
    }

    pub async fn insert(
        &self,
        conn: &mut PgConnection,
        pairs: &[(String, i64)],
    ) -> Result<u64, IngestError> {
        let mut inserted = 0;
        for chunk in pairs.chunks(self.insert.rows_per_statement()) {
            let mut qb = self.insert.build(chunk, |mut b, (product_id, id)| {
                b.push_bind(product_id).push_bind(*id);
            });
            inserted += qb
                .build()
                .persistent(false)
                .execute(&mut *conn)
                .await
                .map_err(|e| {
                    IngestError::persistence(format!("insert {}", self.kind.junction_table()), e)
                })?
                .rows_affected();
        }
        Ok(inserted)
    }
}
