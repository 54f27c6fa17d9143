use crate::cache::Invalidate;
use crate::domain::recommendation::Recommendation;
use crate::ingest::feed::{fetch_all_pages, FeedSource};
use crate::ingest::types::FeedOrdering;
use crate::storage::RecommendationStore;
use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Pause between feed pages during a full sync.
    pub page_delay: Duration,
    pub batch_size: usize,
    /// Pause after each batch upsert during a full sync.
    pub batch_delay: Duration,
    /// Pause between feed pages during an incremental sync.
    pub incremental_page_delay: Duration,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            page_delay: Duration::from_secs(2),
            batch_size: 100,
            batch_delay: Duration::from_millis(500),
            incremental_page_delay: Duration::from_secs(1),
        }
    }
}

impl SyncOptions {
    pub fn from_env() -> anyhow::Result<Self> {
        let mut out = Self::default();

        if let Some(ms) = env_millis("SYNC_PAGE_DELAY_MS") {
            out.page_delay = ms;
        }
        if let Some(ms) = env_millis("SYNC_BATCH_DELAY_MS") {
            out.batch_delay = ms;
        }
        if let Some(ms) = env_millis("SYNC_INCREMENTAL_PAGE_DELAY_MS") {
            out.incremental_page_delay = ms;
        }
        if let Ok(s) = std::env::var("SYNC_BATCH_SIZE") {
            if let Ok(n) = s.parse::<usize>() {
                out.batch_size = n;
            }
        }

        anyhow::ensure!(out.batch_size >= 1, "SYNC_BATCH_SIZE must be >= 1");
        Ok(out)
    }
}

fn env_millis(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_millis)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyncOutcome {
    /// Items read from the feed and kept for writing.
    pub fetched: usize,
    /// Rows reported written by the store.
    pub written: u64,
}

/// Reconciles the external feed with the local store.
pub struct Synchronizer {
    feed: Arc<dyn FeedSource>,
    store: Arc<dyn RecommendationStore>,
    caches: Vec<Arc<dyn Invalidate>>,
    opts: SyncOptions,
}

impl Synchronizer {
    pub fn new(
        feed: Arc<dyn FeedSource>,
        store: Arc<dyn RecommendationStore>,
        opts: SyncOptions,
    ) -> Self {
        Self {
            feed,
            store,
            caches: Vec::new(),
            opts,
        }
    }

    /// Registers a cache to be cleared after every successful sync.
    pub fn invalidates(mut self, cache: Arc<dyn Invalidate>) -> Self {
        self.caches.push(cache);
        self
    }

    /// Replaces the whole store with the current feed contents.
    ///
    /// An empty feed leaves the store untouched. Otherwise every row is deleted and the feed is
    /// re-inserted batch by batch, each batch in its own transaction. The delete and the batches
    /// are not one atomic unit: an error part-way leaves the store empty or partially filled and
    /// is returned as-is. Recover by running a full sync again.
    pub async fn full_sync(&self) -> anyhow::Result<SyncOutcome> {
        let t0 = std::time::Instant::now();
        let items = fetch_all_pages(self.feed.as_ref(), self.opts.page_delay)
            .await
            .context("full sync: feed fetch failed")?;

        if items.is_empty() {
            tracing::info!(source = self.feed.source_name(), "full sync: feed returned no recommendations");
            self.invalidate_caches().await;
            return Ok(SyncOutcome::default());
        }

        let deleted = self
            .store
            .delete_all_recommendations()
            .await
            .context("full sync: delete existing recommendations failed")?;
        tracing::info!(deleted, fetched = items.len(), "full sync: store cleared");

        let batch_size = self.opts.batch_size.max(1);
        let batches = items.len().div_ceil(batch_size);
        let mut written: u64 = 0;
        for (batch_idx, chunk) in items.chunks(batch_size).enumerate() {
            written += self
                .store
                .insert_recommendations(chunk)
                .await
                .with_context(|| {
                    format!(
                        "full sync: insert batch {}/{batches} failed; store is partially repopulated",
                        batch_idx + 1
                    )
                })?;
            tracing::debug!(batch = batch_idx + 1, batches, size = chunk.len(), "full sync: batch written");
            if batch_idx + 1 < batches {
                tokio::time::sleep(self.opts.batch_delay).await;
            }
        }

        self.invalidate_caches().await;
        tracing::info!(
            fetched = items.len(),
            written,
            elapsed_ms = t0.elapsed().as_millis(),
            "full sync completed"
        );
        Ok(SyncOutcome {
            fetched: items.len(),
            written,
        })
    }

    /// Inserts feed items newer than the latest stored recommendation.
    ///
    /// The feed is read from its first page on every run. For a newest-first feed the scan stops
    /// at the first item whose time is not strictly after the stored boundary; an unordered feed
    /// is read to the end and filtered instead. With an empty store everything is inserted.
    pub async fn incremental_sync(&self) -> anyhow::Result<SyncOutcome> {
        let t0 = std::time::Instant::now();
        let boundary = self
            .store
            .latest_recommendation()
            .await
            .context("incremental sync: read latest recommendation failed")?
            .map(|r| r.time);
        let ordering = self.feed.ordering();

        let mut fresh: Vec<Recommendation> = Vec::new();
        let mut token: Option<String> = None;
        let mut pages: usize = 0;

        'pages: loop {
            let page = self
                .feed
                .fetch_page(token.as_deref())
                .await
                .with_context(|| format!("incremental sync: fetch feed page {} failed", pages + 1))?;
            pages += 1;
            let next = page.next_token().map(str::to_string);

            for rec in page.items {
                let is_new = boundary.map_or(true, |b| rec.time > b);
                if is_new {
                    fresh.push(rec);
                } else if ordering == FeedOrdering::NewestFirst {
                    tracing::debug!(pages, ?boundary, "incremental sync: reached stored boundary");
                    break 'pages;
                }
            }

            match next {
                Some(next) => token = Some(next),
                None => break,
            }
            tokio::time::sleep(self.opts.incremental_page_delay).await;
        }

        let written = if fresh.is_empty() {
            0
        } else {
            self.store
                .insert_recommendations(&fresh)
                .await
                .context("incremental sync: insert failed")?
        };

        self.invalidate_caches().await;
        tracing::info!(
            pages,
            fetched = fresh.len(),
            written,
            ?boundary,
            ?ordering,
            elapsed_ms = t0.elapsed().as_millis(),
            "incremental sync completed"
        );
        Ok(SyncOutcome {
            fetched: fresh.len(),
            written,
        })
    }

    /// Full sync bounded by `timeout`. Failures and timeouts are logged, never returned, so a
    /// caller can go on serving whatever the store already holds.
    pub async fn bootstrap(&self, timeout: Duration) {
        match tokio::time::timeout(timeout, self.full_sync()).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => tracing::error!(error = %format!("{e:#}"), "bootstrap full sync failed"),
            Err(_) => tracing::warn!(
                timeout_secs = timeout.as_secs(),
                "bootstrap full sync timed out; serving existing data"
            ),
        }
    }

    /// Runs `incremental_sync` every `period`, starting one period from now, until the future is
    /// dropped. A failed run is logged and the next tick tries again.
    pub async fn run_incremental(&self, period: Duration) {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if let Err(e) = self.incremental_sync().await {
                tracing::error!(error = %format!("{e:#}"), "periodic incremental sync failed");
            }
        }
    }

    async fn invalidate_caches(&self) {
        for cache in &self.caches {
            cache.invalidate().await;
            tracing::debug!(cache = cache.cache_name(), "cache invalidated after sync");
        }
    }
}
