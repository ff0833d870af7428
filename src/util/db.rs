use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::{
    postgres::{PgConnectOptions, PgPoolOptions, PgSslMode},
    PgPool,
};
use tracing::{info, instrument};

use super::env::env_flag;

/// Bundled DDL for every table the pipeline writes.
pub const CATALOG_SCHEMA: &str = include_str!("../../schema/catalog.sql");

#[derive(Clone)]
pub struct Db {
    pub pool: PgPool,
}

impl Db {
    // SECURITY: never include raw DSNs in tracing spans (they may contain credentials).
    #[instrument(skip(database_url))]
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let mut connect_options =
            PgConnectOptions::from_str(database_url).context("parse database url")?;

        if database_url.contains("sslmode=require") {
            connect_options = connect_options.ssl_mode(PgSslMode::Require);
        }

        if !env_flag("USE_PREPARED", false) {
            // PgBouncer txn mode safe
            connect_options = connect_options.statement_cache_capacity(0);
        }

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(600))
            .connect_with(connect_options)
            .await
            .context("connect to postgres")?;
        info!(max_connections, "connected to db");
        Ok(Self { pool })
    }

    /// Apply [`CATALOG_SCHEMA`]. Safe to repeat; every statement is `IF NOT EXISTS`.
    pub async fn apply_schema(&self) -> Result<()> {
        // raw_sql: multi-statement script, no prepared statements under PgBouncer
        sqlx::raw_sql(CATALOG_SCHEMA)
            .execute(&self.pool)
            .await
            .context("apply catalog schema")?;
        info!("catalog schema applied");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bundled_schema_is_idempotent_ddl() {
        for table in [
            "raw_api_data",
            "products",
            "actors",
            "product_actors",
            "ingest_checkpoints",
        ] {
            assert!(
                CATALOG_SCHEMA.contains(&format!("CREATE TABLE IF NOT EXISTS {table} ")),
                "{table} missing"
            );
        }
        assert!(!CATALOG_SCHEMA.contains("DROP "));
    }
}
