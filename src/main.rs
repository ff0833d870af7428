use std::path::PathBuf;

use anyhow::{Context, Result};
use catalog_ingest::config::{ConfigOverrides, FetchFilters, IngestConfig};
use catalog_ingest::database_ops::db::Db;
use catalog_ingest::database_ops::duga::DugaClient;
use catalog_ingest::database_ops::memory::MemoryStore;
use catalog_ingest::database_ops::postgres::PgIngestStore;
use catalog_ingest::database_ops::store::IngestStore;
use catalog_ingest::orchestrator::{Pipeline, RunSummary};
use catalog_ingest::util::env as env_util;
use catalog_ingest::IngestError;
use clap::{ArgAction, Parser};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(
    name = "catalog-ingest",
    version,
    about = "Ingest the DUGA product catalog into PostgreSQL"
)]
struct Cli {
    /// Earliest release date (YYYY-MM-DD or YYYY/MM/DD)
    #[arg(long = "start_date", alias = "start-date")]
    start_date: Option<String>,
    /// Latest release date
    #[arg(long = "end_date", alias = "end-date")]
    end_date: Option<String>,
    #[arg(long)]
    keyword: Option<String>,
    #[arg(long = "genre_id", alias = "genre-id")]
    genre_id: Option<String>,
    #[arg(long, default_value = "48043")]
    agentid: String,
    #[arg(long, default_value = "01")]
    bannerid: String,
    #[arg(long, default_value = "1")]
    adult: String,
    #[arg(long, default_value = "favorite")]
    sort: String,

    /// Items per API request (env DUGA_PAGE_SIZE, default 100)
    #[arg(long = "page-size", alias = "page_size")]
    page_size: Option<u32>,
    /// Buffered records per flush transaction (env INGEST_FLUSH_THRESHOLD, default 500)
    #[arg(long = "flush-threshold", alias = "flush_threshold")]
    flush_threshold: Option<usize>,
    /// Stop after this many pages; 0 = unlimited (env INGEST_MAX_PAGES)
    #[arg(long = "max-pages", alias = "max_pages")]
    max_pages: Option<u64>,
    /// Delay between page fetches in ms (env INGEST_PAGE_DELAY_MS, default 1000)
    #[arg(long = "page-delay-ms", alias = "page_delay_ms")]
    page_delay_ms: Option<u64>,
    /// Retries for network failures per page (env INGEST_FETCH_RETRIES, default 0)
    #[arg(long = "fetch-retries", alias = "fetch_retries")]
    fetch_retries: Option<u32>,
    /// Kinds fed by the source `category` node, e.g. `category,genre`
    #[arg(long = "category-targets", alias = "category_targets")]
    category_targets: Option<String>,

    /// Start from the stored checkpoint when the filters match
    #[arg(long, action = ArgAction::SetTrue)]
    resume: bool,
    /// Do not write resume checkpoints
    #[arg(long = "no-checkpoint", action = ArgAction::SetTrue)]
    no_checkpoint: bool,
    /// Fetch and normalize, but write into an in-memory store only
    #[arg(long = "dry-run", action = ArgAction::SetTrue)]
    dry_run: bool,
    /// Apply the bundled schema before ingesting (also AUTO_MIGRATE=1)
    #[arg(long = "apply-schema", action = ArgAction::SetTrue)]
    apply_schema: bool,
}

impl Cli {
    fn filters(&self) -> FetchFilters {
        FetchFilters {
            release_date_from: self.start_date.clone(),
            release_date_to: self.end_date.clone(),
            keyword: self.keyword.clone(),
            genre_id: self.genre_id.clone(),
            agent_id: self.agentid.clone(),
            banner_id: self.bannerid.clone(),
            adult: self.adult.clone(),
            sort: self.sort.clone(),
        }
    }

    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            page_size: self.page_size,
            flush_threshold: self.flush_threshold,
            max_pages: self.max_pages,
            page_delay_ms: self.page_delay_ms,
            fetch_retries: self.fetch_retries,
            category_targets: self.category_targets.clone(),
            resume: self.resume,
            no_checkpoint: self.no_checkpoint,
            ..ConfigOverrides::default()
        }
    }
}

async fn run_with<S: IngestStore>(
    client: DugaClient,
    store: S,
    config: IngestConfig,
) -> Result<RunSummary> {
    match Pipeline::new(client, store, config).run().await {
        Ok(summary) => Ok(summary),
        Err(err) => {
            log_fatal(&err);
            Err(err).context("ingest run aborted")
        }
    }
}

fn log_fatal(err: &IngestError) {
    error!(
        kind = err.kind(),
        location = err.location().as_deref().unwrap_or("-"),
        error = %err,
        "ingest failed"
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    env_util::init_env();
    let cli = Cli::parse();

    let log_dir = PathBuf::from(env_util::env_opt("INGEST_LOG_DIR").unwrap_or_else(|| "logs".into()));
    let _log_guard = catalog_ingest::tracing::init_tracing("info,sqlx=warn", Some(&log_dir))?;

    let config = match IngestConfig::resolve(cli.filters(), cli.overrides()) {
        Ok(config) => config,
        Err(err) => {
            log_fatal(&err);
            return Err(err).context("invalid configuration");
        }
    };
    env_util::preflight_check(
        "catalog-ingest",
        &[],
        &[
            "DUGA_API_URL",
            "DUGA_API_KEY",
            "DATABASE_URL",
            "DB_HOST",
            "DB_MAX_CONNS",
            "AUTO_MIGRATE",
        ],
    )?;

    let client = DugaClient::new(&config.api_url, config.api_key.clone(), config.request_timeout)?;

    let summary = if cli.dry_run {
        info!("dry run: writing to in-memory store only");
        let store = MemoryStore::new();
        let summary = run_with(client, store.clone(), config).await?;
        let counts = store.counts();
        info!(
            raw = counts.raw,
            products = counts.products,
            classifications = ?counts.classifications,
            junctions = ?counts.junctions,
            "dry run store contents"
        );
        summary
    } else {
        let url = env_util::db_url().context("resolve database url")?;
        let max_conns = env_util::env_parse("DB_MAX_CONNS", 2u32);
        let db = Db::connect(&url, max_conns).await?;
        if cli.apply_schema || env_util::env_flag("AUTO_MIGRATE", false) {
            db.apply_schema().await?;
        }
        run_with(client, PgIngestStore::new(db), config).await?
    };

    info!(
        summary = %serde_json::to_string(&summary).unwrap_or_default(),
        "done"
    );
    Ok(())
}
