use chrono::Utc;
use sqlx::PgConnection;

use crate::database_ops::upsert::UpsertStatement;
use crate::error::IngestError;
use crate::models::ProductRow;

const COLUMNS: &[&str] = &[
    "source_name",
    "external_id",
    "title",
    "original_title",
    "caption",
    "release_date",
    "maker_name",
    "item_no",
    "price",
    "volume",
    "url",
    "affiliate_url",
    "image_url_small",
    "image_url_medium",
    "image_url_large",
    "jacket_url_small",
    "jacket_url_medium",
    "jacket_url_large",
    "sample_movie_url",
    "sample_movie_capture_url",
    "raw_api_data_id",
    "created_at",
    "updated_at",
];

#[derive(Debug, Clone)]
pub struct ProductRepository {
    upsert: UpsertStatement,
}

impl Default for ProductRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl ProductRepository {
    pub fn new() -> Self {
        // Everything except the key and created_at is refreshed on re-ingest.
        let update: Vec<&'static str> = COLUMNS
            .iter()
            .copied()
            .filter(|c| !matches!(*c, "source_name" | "external_id" | "created_at"))
            .collect();
        Self {
            upsert: UpsertStatement::new("products", COLUMNS, &update, &["source_name", "external_id"]),
        }
    }

    pub async fn upsert(
        &self,
        conn: &mut PgConnection,
        rows: &[ProductRow],
    ) -> Result<u64, IngestError> {
        let now = Utc::now();
        let mut affected = 0;
        for chunk in rows.chunks(self.upsert.rows_per_statement()) {
            let mut qb = self.upsert.build(chunk, |mut b, r| {
                let p = &r.product;
                b.push_bind(&p.source)
                    .push_bind(&p.external_id)
                    .push_bind(&p.title)
                    .push_bind(&p.original_title)
                    .push_bind(&p.caption)
                    .push_bind(p.release_date)
                    .push_bind(&p.maker_name)
                    .push_bind(&p.item_no)
                    .push_bind(&p.price)
                    .push_bind(p.volume)
                    .push_bind(&p.url)
                    .push_bind(&p.affiliate_url)
                    .push_bind(&p.image_url_small)
                    .push_bind(&p.image_url_medium)
                    .push_bind(&p.image_url_large)
                    .push_bind(&p.jacket_url_small)
                    .push_bind(&p.jacket_url_medium)
                    .push_bind(&p.jacket_url_large)
                    .push_bind(&p.sample_movie_url)
                    .push_bind(&p.sample_movie_capture_url)
                    .push_bind(r.raw_api_data_id)
                    .push_bind(now)
                    .push_bind(now);
            });
            affected += qb
                .build()
                .persistent(false)
                .execute(&mut *conn)
                .await
                .map_err(|e| IngestError::persistence("upsert products", e))?
                .rows_affected();
        }
        Ok(affected)
    }
}
