//! Run configuration: defaults, then environment (`.env` via `util::env`),
//! then command-line overrides.

use std::time::Duration;

use crate::error::IngestError;
use crate::models::DEFAULT_SOURCE_NAME;
use crate::normalization::CategoryMapping;
use crate::util::env::{env_flag, env_opt, env_parse};

pub const DEFAULT_API_URL: &str = "http://affapi.duga.jp/search";
pub const API_VERSION: &str = "1.2";
const PLACEHOLDER_API_KEY: &str = "YOUR_DUGA_API_KEY_HERE";

/// Query filters forwarded to the catalog API. Empty values are not sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchFilters {
    pub release_date_from: Option<String>,
    pub release_date_to: Option<String>,
    pub keyword: Option<String>,
    pub genre_id: Option<String>,
    pub agent_id: String,
    pub banner_id: String,
    pub adult: String,
    pub sort: String,
}

impl Default for FetchFilters {
    fn default() -> Self {
        Self {
            release_date_from: None,
            release_date_to: None,
            keyword: None,
            genre_id: None,
            agent_id: "48043".into(),
            banner_id: "01".into(),
            adult: "1".into(),
            sort: "favorite".into(),
        }
    }
}

impl FetchFilters {
    /// `(name, value)` query pairs in a fixed order, skipping blanks.
    pub fn query_pairs(&self) -> Vec<(&'static str, &str)> {
        let pairs: [(&'static str, Option<&str>); 8] = [
            ("release_date_from", self.release_date_from.as_deref()),
            ("release_date_to", self.release_date_to.as_deref()),
            ("keyword", self.keyword.as_deref()),
            ("genre_id", self.genre_id.as_deref()),
            ("agentid", Some(self.agent_id.as_str())),
            ("bannerid", Some(self.banner_id.as_str())),
            ("adult", Some(self.adult.as_str())),
            ("sort", Some(self.sort.as_str())),
        ];
        pairs
            .into_iter()
            .filter_map(|(k, v)| v.map(str::trim).filter(|v| !v.is_empty()).map(|v| (k, v)))
            .collect()
    }

    /// Stable identity of the filter set, stored with the resume checkpoint.
    pub fn fingerprint(&self) -> String {
        self.query_pairs()
            .into_iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&")
    }
}

/// Values supplied on the command line; `None` keeps the env/default value.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub api_url: Option<String>,
    pub api_key: Option<String>,
    pub page_size: Option<u32>,
    pub flush_threshold: Option<usize>,
    pub max_pages: Option<u64>,
    pub page_delay_ms: Option<u64>,
    pub fetch_retries: Option<u32>,
    pub category_targets: Option<String>,
    pub resume: bool,
    pub no_checkpoint: bool,
}

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub source_name: String,
    pub api_url: String,
    pub api_key: String,
    pub request_timeout: Duration,
    pub page_size: u32,
    pub flush_threshold: usize,
    /// 0 means unlimited.
    pub max_pages: u64,
    pub page_delay: Duration,
    pub fetch_retries: u32,
    /// Multiplied by the attempt number between fetch retries.
    pub retry_backoff: Duration,
    pub category_mapping: CategoryMapping,
    pub filters: FetchFilters,
    pub resume: bool,
    pub write_checkpoint: bool,
}

impl IngestConfig {
    /// Built-in defaults, before env and flags are applied.
    pub fn with_defaults(api_key: impl Into<String>) -> Self {
        Self {
            source_name: DEFAULT_SOURCE_NAME.into(),
            api_url: DEFAULT_API_URL.into(),
            api_key: api_key.into(),
            request_timeout: Duration::from_secs(30),
            page_size: 100,
            flush_threshold: 500,
            max_pages: 0,
            page_delay: Duration::from_millis(1000),
            fetch_retries: 0,
            retry_backoff: Duration::from_millis(2000),
            category_mapping: CategoryMapping::default(),
            filters: FetchFilters::default(),
            resume: false,
            write_checkpoint: true,
        }
    }

    /// Resolve defaults, then env keys, then `overrides`, and validate.
    pub fn resolve(filters: FetchFilters, overrides: ConfigOverrides) -> Result<Self, IngestError> {
        let mut cfg = Self::with_defaults(String::new());
        cfg.filters = filters;

        cfg.api_url = overrides
            .api_url
            .or_else(|| env_opt("DUGA_API_URL"))
            .unwrap_or(cfg.api_url);
        cfg.api_key = overrides
            .api_key
            .or_else(|| env_opt("DUGA_API_KEY"))
            .unwrap_or_default();
        cfg.request_timeout =
            Duration::from_secs(env_parse("DUGA_TIMEOUT_SECS", cfg.request_timeout.as_secs()));
        cfg.page_size = overrides
            .page_size
            .unwrap_or_else(|| env_parse("DUGA_PAGE_SIZE", cfg.page_size));
        cfg.flush_threshold = overrides
            .flush_threshold
            .unwrap_or_else(|| env_parse("INGEST_FLUSH_THRESHOLD", cfg.flush_threshold));
        cfg.max_pages = overrides
            .max_pages
            .unwrap_or_else(|| env_parse("INGEST_MAX_PAGES", cfg.max_pages));
        cfg.page_delay = Duration::from_millis(
            overrides
                .page_delay_ms
                .unwrap_or_else(|| env_parse("INGEST_PAGE_DELAY_MS", 1000)),
        );
        cfg.fetch_retries = overrides
            .fetch_retries
            .unwrap_or_else(|| env_parse("INGEST_FETCH_RETRIES", cfg.fetch_retries));
        cfg.retry_backoff =
            Duration::from_millis(env_parse("INGEST_RETRY_BACKOFF_MS", 2000));
        if let Some(raw) = overrides
            .category_targets
            .or_else(|| env_opt("INGEST_CATEGORY_TARGETS"))
        {
            cfg.category_mapping = CategoryMapping::parse_list(&raw).map_err(IngestError::Config)?;
        }
        cfg.resume = overrides.resume || env_flag("INGEST_RESUME", false);
        cfg.write_checkpoint = !overrides.no_checkpoint;

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), IngestError> {
        let key = self.api_key.trim();
        if key.is_empty() || key == PLACEHOLDER_API_KEY {
            return Err(IngestError::Config(
                "DUGA_API_KEY is not set (or still the placeholder)".into(),
            ));
        }
        if url::Url::parse(&self.api_url).is_err() {
            return Err(IngestError::Config(format!(
                "invalid api url `{}`",
                self.api_url
            )));
        }
        if self.page_size == 0 {
            return Err(IngestError::Config("page size must be positive".into()));
        }
        if self.flush_threshold == 0 {
            return Err(IngestError::Config(
                "flush threshold must be positive".into(),
            ));
        }
        Ok(())
    }
}
