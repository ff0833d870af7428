//! Paged fetch → normalize → buffer → flush loop.
//!
//! The run is a small state machine ([`Phase`]) over an explicit
//! [`PipelineState`]. Each flush is one store transaction; the buffer is only
//! cleared once that transaction commits.

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::batch::BatchBuffer;
use crate::config::IngestConfig;
use crate::database_ops::duga::{CatalogPage, CatalogSource};
use crate::database_ops::store::{FlushTx, IngestStore};
use crate::database_ops::upsert::{write_batch, BatchWrite, ClassificationIndex};
use crate::error::IngestError;
use crate::models::Checkpoint;
use crate::normalization::{normalize_item, NormalizeContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Fetching,
    Normalizing,
    Buffering,
    Flushing,
    Draining,
    Done,
}

/// Why the fetch loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    /// First page reported a total of zero.
    ZeroResults,
    /// A page came back with no items.
    EmptyPage,
    /// The next offset is past the reported total.
    CountExhausted,
    /// The configured page limit was reached.
    PageLimit,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub start_offset: u64,
    pub total_count: u64,
    pub pages_fetched: u64,
    pub items_seen: u64,
    pub records_skipped: u64,
    pub products_upserted: u64,
    pub flushes: u64,
    pub termination: Termination,
}

#[derive(Debug)]
pub struct PipelineState {
    pub phase: Phase,
    /// 1-based offset of the next page to fetch.
    pub next_offset: u64,
    pub total_count: Option<u64>,
    pub pages_fetched: u64,
    pub items_seen: u64,
    pub records_skipped: u64,
    pub products_upserted: u64,
    pub flushes: u64,
    pub buffer: BatchBuffer,
    pub index: ClassificationIndex,
    pub termination: Option<Termination>,
}

impl PipelineState {
    pub fn new(start_offset: u64) -> Self {
        Self {
            phase: Phase::Fetching,
            next_offset: start_offset.max(1),
            total_count: None,
            pages_fetched: 0,
            items_seen: 0,
            records_skipped: 0,
            products_upserted: 0,
            flushes: 0,
            buffer: BatchBuffer::new(),
            index: ClassificationIndex::default(),
            termination: None,
        }
    }

    fn summary(&self, start_offset: u64) -> RunSummary {
        RunSummary {
            start_offset,
            total_count: self.total_count.unwrap_or(0),
            pages_fetched: self.pages_fetched,
            items_seen: self.items_seen,
            records_skipped: self.records_skipped,
            products_upserted: self.products_upserted,
            flushes: self.flushes,
            termination: self.termination.unwrap_or(Termination::EmptyPage),
        }
    }

    /// What a flush started from the current phase is for: the final drain,
    /// or a full buffer while paging.
    fn flush_trigger(&self) -> &'static str {
        match self.phase {
            Phase::Draining => "drain",
            _ => "threshold",
        }
    }
}

pub struct Pipeline<C, S> {
    source: C,
    store: S,
    config: IngestConfig,
}

impl<C: CatalogSource, S: IngestStore> Pipeline<C, S> {
    pub fn new(source: C, store: S, config: IngestConfig) -> Self {
        Self {
            source,
            store,
            config,
        }
    }

    pub async fn run(&self) -> Result<RunSummary, IngestError> {
        let start_offset = self.start_offset().await?;
        let mut state = PipelineState::new(start_offset);
        info!(
            source = %self.config.source_name,
            start_offset,
            page_size = self.config.page_size,
            flush_threshold = self.config.flush_threshold,
            filters = %self.config.filters.fingerprint(),
            "ingest run starting"
        );

        loop {
            state.phase = Phase::Fetching;
            let page = self.fetch_with_retry(state.next_offset).await?;
            state.pages_fetched += 1;
            let total = *state.total_count.get_or_insert(page.total_count);
            debug!(
                offset = state.next_offset,
                items = page.items.len(),
                total,
                "page fetched"
            );

            if state.pages_fetched == 1 && total == 0 {
                info!("source reports zero results; nothing to ingest");
                state.termination = Some(Termination::ZeroResults);
                state.phase = Phase::Done;
                return Ok(state.summary(start_offset));
            }
            if page.items.is_empty() {
                state.termination = Some(Termination::EmptyPage);
                break;
            }

            self.absorb_page(&mut state, &page)?;
            state.next_offset += u64::from(self.config.page_size);

            if state.buffer.is_full(self.config.flush_threshold) {
                self.flush(&mut state).await?;
            }
            if state.next_offset > total {
                state.termination = Some(Termination::CountExhausted);
                break;
            }
            if self.config.max_pages > 0 && state.pages_fetched >= self.config.max_pages {
                state.termination = Some(Termination::PageLimit);
                break;
            }
            if !self.config.page_delay.is_zero() {
                tokio::time::sleep(self.config.page_delay).await;
            }
        }

        state.phase = Phase::Draining;
        if !state.buffer.is_empty() {
            self.flush(&mut state).await?;
        }
        state.phase = Phase::Done;

        let summary = state.summary(start_offset);
        info!(
            phase = ?state.phase,
            termination = ?summary.termination,
            pages = summary.pages_fetched,
            items = summary.items_seen,
            skipped = summary.records_skipped,
            products = summary.products_upserted,
            flushes = summary.flushes,
            "ingest run finished"
        );
        Ok(summary)
    }

    async fn start_offset(&self) -> Result<u64, IngestError> {
        if !self.config.resume {
            return Ok(1);
        }
        let fingerprint = self.config.filters.fingerprint();
        match self.store.load_checkpoint(&self.config.source_name).await? {
            Some(cp) if cp.filters_fingerprint == fingerprint => {
                info!(next_offset = cp.next_offset, saved_at = %cp.updated_at, "resuming from checkpoint");
                Ok(cp.next_offset.max(1))
            }
            Some(cp) => {
                warn!(
                    saved = %cp.filters_fingerprint,
                    current = %fingerprint,
                    "checkpoint filters differ; starting from offset 1"
                );
                Ok(1)
            }
            None => {
                info!("no checkpoint stored; starting from offset 1");
                Ok(1)
            }
        }
    }

    async fn fetch_with_retry(&self, offset: u64) -> Result<CatalogPage, IngestError> {
        let mut attempt: u32 = 0;
        loop {
            match self
                .source
                .fetch(offset, self.config.page_size, &self.config.filters)
                .await
            {
                Ok(page) => return Ok(page),
                Err(err @ IngestError::Transport { .. }) if attempt < self.config.fetch_retries => {
                    attempt += 1;
                    let backoff = self.config.retry_backoff * attempt;
                    warn!(%err, offset, attempt, ?backoff, "fetch failed; retrying");
                    if !backoff.is_zero() {
                        tokio::time::sleep(backoff).await;
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn absorb_page(&self, state: &mut PipelineState, page: &CatalogPage) -> Result<(), IngestError> {
        state.phase = Phase::Normalizing;
        let ctx = NormalizeContext {
            source: self.config.source_name.clone(),
            fetched_at: Utc::now(),
            category_mapping: self.config.category_mapping.clone(),
        };
        for (position, item) in page.items.iter().enumerate() {
            state.items_seen += 1;
            match normalize_item(item, &ctx) {
                Ok(record) => {
                    state.phase = Phase::Buffering;
                    if state.buffer.push(record) {
                        debug!(position, "duplicate external id in buffer; keeping latest");
                    }
                }
                Err(invalid) => {
                    let err = IngestError::from(invalid);
                    if !err.is_recoverable() {
                        return Err(err);
                    }
                    state.records_skipped += 1;
                    warn!(
                        offset = state.next_offset,
                        position,
                        error = %err,
                        "skipping invalid record"
                    );
                }
            }
        }
        Ok(())
    }

    async fn flush(&self, state: &mut PipelineState) -> Result<(), IngestError> {
        let trigger = state.flush_trigger();
        state.phase = Phase::Flushing;
        let size = state.buffer.len();
        let mut tx = self.store.begin().await?;

        let written = match self.write(tx.as_mut(), state).await {
            Ok(written) => written,
            Err(err) => {
                error!(kind = err.kind(), location = ?err.location(), %err, size, "flush failed; rolling back");
                if let Err(rb) = tx.rollback().await {
                    error!(%rb, "rollback failed");
                }
                return Err(err);
            }
        };
        tx.commit().await?;

        state.flushes += 1;
        state.products_upserted += size as u64;
        state.index.merge(written.resolved);
        state.buffer.clear();
        info!(
            flush = state.flushes,
            trigger,
            products = size,
            junctions = written.junctions_inserted,
            missing_archive_links = written.missing_archive_links,
            progress = state.products_upserted,
            total = state.total_count.unwrap_or(0),
            cached_classifications = state.index.len(),
            "flush committed"
        );
        Ok(())
    }

    async fn write(
        &self,
        tx: &mut dyn FlushTx,
        state: &PipelineState,
    ) -> Result<BatchWrite, IngestError> {
        let records = state.buffer.records();
        let written = write_batch(tx, &records, &state.index).await?;
        if self.config.write_checkpoint {
            tx.save_checkpoint(&Checkpoint {
                source: self.config.source_name.clone(),
                next_offset: state.next_offset,
                filters_fingerprint: self.config.filters.fingerprint(),
                updated_at: Utc::now(),
            })
            .await?;
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::{json, Value};

    use crate::config::FetchFilters;
    use crate::database_ops::memory::{FailPoint, MemoryStore, RaceConflict};
    use crate::models::ClassificationKind;

    /// Replays queued responses and records requested offsets.
    #[derive(Default)]
    struct ScriptedSource {
        responses: Mutex<VecDeque<Result<CatalogPage, IngestError>>>,
        offsets: Mutex<Vec<u64>>,
    }

    impl ScriptedSource {
        fn pages(pages: Vec<(Vec<Value>, u64)>) -> Self {
            let s = Self::default();
            for (items, total) in pages {
                s.push(Ok(CatalogPage {
                    items,
                    total_count: total,
                }));
            }
            s
        }

        fn push(&self, response: Result<CatalogPage, IngestError>) {
            self.responses.lock().unwrap().push_back(response);
        }

        fn offsets(&self) -> Vec<u64> {
            self.offsets.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CatalogSource for ScriptedSource {
        async fn fetch(
            &self,
            offset: u64,
            _page_size: u32,
            _filters: &FetchFilters,
        ) -> Result<CatalogPage, IngestError> {
            self.offsets.lock().unwrap().push(offset);
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(IngestError::Payload("script exhausted".into())))
        }
    }

    #[async_trait]
    impl CatalogSource for &ScriptedSource {
        async fn fetch(
            &self,
            offset: u64,
            page_size: u32,
            filters: &FetchFilters,
        ) -> Result<CatalogPage, IngestError> {
            (**self).fetch(offset, page_size, filters).await
        }
    }

    fn config() -> IngestConfig {
        let mut cfg = IngestConfig::with_defaults("test-key");
        cfg.page_size = 2;
        cfg.flush_threshold = 2;
        cfg.page_delay = Duration::ZERO;
        cfg.retry_backoff = Duration::ZERO;
        cfg
    }

    fn item(id: &str, genre_id: &str, genre_name: &str) -> Value {
        json!({"item": {
            "productid": id,
            "title": format!("Title {id}"),
            "price": "1,000円",
            "category": [{"data": {"id": genre_id, "name": genre_name}}],
            "performer": [{"data": {"id": "p1", "name": "Performer", "kana": "ぱ"}}]
        }})
    }

    fn transport_error() -> IngestError {
        let err = reqwest::Client::new()
            .get("not a url")
            .build()
            .unwrap_err();
        IngestError::transport("scripted", err)
    }

    #[tokio::test(start_paused = true)]
    async fn waits_between_pages_but_not_after_the_last() {
        let delay = Duration::from_millis(1_500);
        let mut cfg = config();
        cfg.page_delay = delay;
        let source = ScriptedSource::pages(vec![
            (vec![item("a", "10", "Drama"), item("b", "11", "Comedy")], 3),
            (vec![item("c", "10", "Drama")], 3),
        ]);
        let started = tokio::time::Instant::now();
        let summary = Pipeline::new(&source, MemoryStore::new(), cfg)
            .run()
            .await
            .unwrap();

        let elapsed = started.elapsed();
        assert_eq!(summary.pages_fetched, 2);
        assert!(elapsed >= delay, "{elapsed:?}");
        assert!(elapsed < delay * 2, "{elapsed:?}");
    }

    #[test]
    fn flush_trigger_follows_phase() {
        let mut state = PipelineState::new(1);
        state.phase = Phase::Buffering;
        assert_eq!(state.flush_trigger(), "threshold");
        state.phase = Phase::Draining;
        assert_eq!(state.flush_trigger(), "drain");
    }

    #[tokio::test]
    async fn two_pages_with_threshold_two_flush_twice() {
        let store = MemoryStore::new();
        let source = ScriptedSource::pages(vec![
            (vec![item("a", "10", "Drama"), item("b", "11", "Comedy")], 3),
            (vec![item("c", "10", "Drama")], 3),
        ]);
        let summary = Pipeline::new(&source, store.clone(), config())
            .run()
            .await
            .unwrap();

        assert_eq!(summary.flushes, 2);
        assert_eq!(summary.products_upserted, 3);
        assert_eq!(summary.termination, Termination::CountExhausted);
        assert_eq!(source.offsets(), vec![1, 3]);
        let counts = store.counts();
        assert_eq!(counts.products, 3);
        assert_eq!(counts.raw, 3);
        assert_eq!(counts.classifications[&ClassificationKind::Genre], 2);
        assert_eq!(counts.junctions[&ClassificationKind::Genre], 3);
        assert_eq!(counts.classifications[&ClassificationKind::Actor], 1);
    }

    #[test]
    fn summary_serializes_termination_in_snake_case() {
        let summary = PipelineState::new(1).summary(1);
        let v = serde_json::to_value(&summary).unwrap();
        assert_eq!(v["termination"], "empty_page");
        assert_eq!(v["start_offset"], 1);
    }

    #[tokio::test]
    async fn zero_total_writes_nothing() {
        let store = MemoryStore::new();
        let source = ScriptedSource::pages(vec![(vec![], 0)]);
        let summary = Pipeline::new(&source, store.clone(), config())
            .run()
            .await
            .unwrap();
        assert_eq!(summary.termination, Termination::ZeroResults);
        assert_eq!(summary.flushes, 0);
        assert_eq!(source.offsets(), vec![1]);
        assert_eq!(store.counts(), Default::default());
    }

    #[tokio::test]
    async fn empty_page_stops_before_count() {
        let store = MemoryStore::new();
        let source = ScriptedSource::pages(vec![
            (vec![item("a", "1", "x"), item("b", "1", "x")], 10),
            (vec![], 10),
        ]);
        let summary = Pipeline::new(&source, store.clone(), config())
            .run()
            .await
            .unwrap();
        assert_eq!(summary.termination, Termination::EmptyPage);
        assert_eq!(source.offsets(), vec![1, 3]);
        assert_eq!(store.counts().products, 2);
    }

    #[tokio::test]
    async fn records_without_id_are_skipped() {
        let store = MemoryStore::new();
        let mut cfg = config();
        cfg.page_size = 3;
        cfg.flush_threshold = 10;
        let source = ScriptedSource::pages(vec![(
            vec![
                item("a", "1", "x"),
                json!({"item": {"title": "no id"}}),
                item("c", "1", "x"),
            ],
            3,
        )]);
        let summary = Pipeline::new(&source, store.clone(), cfg).run().await.unwrap();
        assert_eq!(summary.items_seen, 3);
        assert_eq!(summary.records_skipped, 1);
        assert_eq!(summary.products_upserted, 2);
        assert_eq!(store.counts().products, 2);
    }

    #[tokio::test]
    async fn second_run_is_idempotent() {
        let store = MemoryStore::new();
        let pages = || {
            ScriptedSource::pages(vec![
                (vec![item("a", "10", "Drama"), item("b", "11", "Comedy")], 3),
                (vec![item("c", "10", "Drama")], 3),
            ])
        };
        let first = pages();
        Pipeline::new(&first, store.clone(), config()).run().await.unwrap();
        let after_first = store.snapshot();

        let second = pages();
        Pipeline::new(&second, store.clone(), config()).run().await.unwrap();
        let after_second = store.snapshot();

        assert_eq!(store.counts().products, 3);
        assert_eq!(after_first.classifications, after_second.classifications);
        assert_eq!(after_first.junctions, after_second.junctions);
        for (key, raw) in &after_first.raw {
            assert_eq!(after_second.raw[key].id, raw.id);
        }
        for (key, product) in &after_first.products {
            assert_eq!(after_second.products[key].created_at, product.created_at);
        }
    }

    #[tokio::test]
    async fn name_variants_of_one_key_share_an_id() {
        let store = MemoryStore::new();
        let mut cfg = config();
        cfg.flush_threshold = 1;
        let source = ScriptedSource::pages(vec![(
            vec![item("a", "10", "Drama"), item("b", "10", "  DRAMA Series ")],
            2,
        )]);
        Pipeline::new(&source, store.clone(), cfg).run().await.unwrap();

        let snap = store.snapshot();
        let cats = &snap.classifications[&ClassificationKind::Category];
        assert_eq!(cats.len(), 1);
        assert_eq!(cats[0].attributes.slug, "drama-series");
        let ids: Vec<i64> = snap.junctions[&ClassificationKind::Category]
            .iter()
            .map(|(_, id)| *id)
            .collect();
        assert_eq!(ids, vec![cats[0].id, cats[0].id]);
    }

    #[tokio::test]
    async fn flush_failure_rolls_back_and_aborts() {
        let store = MemoryStore::new();
        store.fail_at(FailPoint::UpsertProducts, 2);
        let source = ScriptedSource::pages(vec![
            (vec![item("a", "1", "x"), item("b", "1", "x")], 4),
            (vec![item("c", "2", "y"), item("d", "2", "y")], 4),
        ]);
        let err = Pipeline::new(&source, store.clone(), config())
            .run()
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "persistence");

        let counts = store.counts();
        assert_eq!(counts.products, 2);
        assert_eq!(counts.raw, 2);
        assert_eq!(counts.classifications[&ClassificationKind::Genre], 1);
        assert_eq!(
            store
                .snapshot()
                .checkpoints
                .get("duga")
                .map(|cp| cp.next_offset),
            Some(3)
        );
    }

    #[tokio::test]
    async fn commit_failure_keeps_store_unchanged() {
        let store = MemoryStore::new();
        store.fail_at(FailPoint::Commit, 1);
        let source = ScriptedSource::pages(vec![(vec![item("a", "1", "x")], 1)]);
        assert!(Pipeline::new(&source, store.clone(), config())
            .run()
            .await
            .is_err());
        assert_eq!(store.counts(), Default::default());
    }

    #[tokio::test]
    async fn raced_classification_links_to_winner() {
        let store = MemoryStore::new();
        store.inject_race(RaceConflict {
            kind: ClassificationKind::Genre,
        });
        let source = ScriptedSource::pages(vec![(vec![item("a", "10", "Drama")], 1)]);
        Pipeline::new(&source, store.clone(), config()).run().await.unwrap();

        let winner = store.race_winner_ids();
        assert_eq!(winner.len(), 1);
        let snap = store.snapshot();
        assert_eq!(snap.classifications[&ClassificationKind::Genre].len(), 1);
        let linked: Vec<i64> = snap.junctions[&ClassificationKind::Genre]
            .iter()
            .map(|(_, id)| *id)
            .collect();
        assert_eq!(linked, winner);
    }

    #[tokio::test]
    async fn resume_continues_from_checkpoint() {
        let store = MemoryStore::new();
        let mut cfg = config();
        cfg.max_pages = 1;
        let first = ScriptedSource::pages(vec![(vec![item("a", "1", "x"), item("b", "1", "x")], 4)]);
        let summary = Pipeline::new(&first, store.clone(), cfg.clone())
            .run()
            .await
            .unwrap();
        assert_eq!(summary.termination, Termination::PageLimit);

        let mut resumed = config();
        resumed.resume = true;
        let second = ScriptedSource::pages(vec![(vec![item("c", "1", "x"), item("d", "1", "x")], 4)]);
        let summary = Pipeline::new(&second, store.clone(), resumed)
            .run()
            .await
            .unwrap();
        assert_eq!(summary.start_offset, 3);
        assert_eq!(second.offsets(), vec![3]);
        assert_eq!(summary.termination, Termination::CountExhausted);
        assert_eq!(store.counts().products, 4);
    }

    #[tokio::test]
    async fn resume_ignores_checkpoint_for_other_filters() {
        let store = MemoryStore::new();
        let mut cfg = config();
        cfg.max_pages = 1;
        let first = ScriptedSource::pages(vec![(vec![item("a", "1", "x"), item("b", "1", "x")], 4)]);
        Pipeline::new(&first, store.clone(), cfg).run().await.unwrap();

        let mut other = config();
        other.resume = true;
        other.filters.keyword = Some("different".into());
        let second = ScriptedSource::pages(vec![(vec![], 4)]);
        Pipeline::new(&second, store.clone(), other).run().await.unwrap();
        assert_eq!(second.offsets(), vec![1]);
    }

    #[tokio::test]
    async fn transport_errors_retry_when_configured() {
        let store = MemoryStore::new();
        let mut cfg = config();
        cfg.fetch_retries = 1;
        let source = ScriptedSource::default();
        source.push(Err(transport_error()));
        source.push(Ok(CatalogPage {
            items: vec![item("a", "1", "x")],
            total_count: 1,
        }));
        let summary = Pipeline::new(&source, store.clone(), cfg).run().await.unwrap();
        assert_eq!(source.offsets(), vec![1, 1]);
        assert_eq!(summary.products_upserted, 1);
    }

    #[tokio::test]
    async fn transport_error_aborts_without_retries() {
        let store = MemoryStore::new();
        let source = ScriptedSource::default();
        source.push(Err(transport_error()));
        let err = Pipeline::new(&source, store.clone(), config())
            .run()
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "transport");
        assert_eq!(source.offsets(), vec![1]);
    }

    #[tokio::test]
    async fn payload_errors_are_never_retried() {
        let store = MemoryStore::new();
        let mut cfg = config();
        cfg.fetch_retries = 3;
        let source = ScriptedSource::default();
        source.push(Err(IngestError::Payload("bad".into())));
        assert!(Pipeline::new(&source, store, cfg).run().await.is_err());
        assert_eq!(source.offsets(), vec![1]);
    }
}
