use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use tracing::{debug, warn};

use super::{CatalogPage, CatalogSource};
use crate::config::{FetchFilters, API_VERSION};
use crate::error::IngestError;

const BODY_LOG_LIMIT: usize = 2000;

fn truncate_for_log(mut s: String, max_len: usize) -> String {
    if s.len() > max_len {
        let mut cut = max_len;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        s.truncate(cut);
        s.push('…');
    }
    s
}

/// DUGA affiliate search API client.
///
/// `GET <base>?offset=&hits=&version=1.2&appid=&format=json` plus filter
/// parameters. One request per call, no internal retry.
#[derive(Debug, Clone)]
pub struct DugaClient {
    base_url: String,
    api_key: String,
    http: Client,
}

impl DugaClient {
    pub fn new(
        base_url: &str,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, IngestError> {
        let http = Client::builder()
            .user_agent(concat!("catalog-ingest/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|e| IngestError::Config(format!("build http client: {e}")))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            http,
        })
    }
}

#[async_trait]
impl CatalogSource for DugaClient {
    async fn fetch(
        &self,
        offset: u64,
        page_size: u32,
        filters: &FetchFilters,
    ) -> Result<CatalogPage, IngestError> {
        let offset_s = offset.to_string();
        let hits_s = page_size.to_string();
        let mut query: Vec<(&str, &str)> = vec![
            ("offset", offset_s.as_str()),
            ("hits", hits_s.as_str()),
            ("version", API_VERSION),
            ("appid", self.api_key.as_str()),
            ("format", "json"),
        ];
        query.extend(filters.query_pairs());

        debug!(offset, page_size, url = %self.base_url, "duga: fetching page");
        let resp = self
            .http
            .get(&self.base_url)
            .header("Accept", "application/json")
            .query(&query)
            .send()
            .await
            .map_err(|e| IngestError::transport(format!("GET offset={offset}"), e))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| IngestError::transport(format!("read body offset={offset}"), e))?;
        if !status.is_success() {
            let body = truncate_for_log(body, BODY_LOG_LIMIT);
            warn!(%status, offset, body = %body, "duga: non-success response");
            return Err(IngestError::Payload(format!(
                "status {status} at offset {offset}: {body}"
            )));
        }
        parse_page(&body)
    }
}

/// Decode a search response document.
///
/// A missing `items` array is an empty page; `count` may be a non-negative
/// integer or a numeric string and defaults to 0 when absent.
pub fn parse_page(body: &str) -> Result<CatalogPage, IngestError> {
    let doc: Value = serde_json::from_str(body).map_err(|e| {
        IngestError::Payload(format!(
            "undecodable body ({e}): {}",
            truncate_for_log(body.to_string(), BODY_LOG_LIMIT)
        ))
    })?;
    if !doc.is_object() {
        return Err(IngestError::Payload(
            "unexpected response shape (expected object)".into(),
        ));
    }
    let items = match doc.get("items") {
        Some(Value::Array(items)) => items.clone(),
        None | Some(Value::Null) => Vec::new(),
        Some(_) => {
            return Err(IngestError::Payload("`items` is not an array".into()));
        }
    };
    let total_count = match doc.get("count") {
        Some(Value::Number(n)) => n.as_u64().ok_or_else(|| {
            IngestError::Payload(format!("`count` is not a non-negative integer: {n}"))
        })?,
        Some(Value::String(s)) => s.trim().parse::<u64>().map_err(|_| {
            IngestError::Payload(format!("`count` is not numeric: {s}"))
        })?,
        None | Some(Value::Null) => 0,
        Some(other) => {
            return Err(IngestError::Payload(format!("`count` has unexpected type: {other}")));
        }
    };
    Ok(CatalogPage { items, total_count })
}
