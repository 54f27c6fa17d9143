use crate::best::BestStocks;
use crate::domain::weights::ModelWeights;
use crate::ingest::feed::FeedSource;
use crate::scoring::Scorer;
use crate::service::stocks::StockService;
use crate::similarity::SimilarityEngine;
use crate::storage::RecommendationStore;
use crate::sync::{SyncOptions, Synchronizer};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Wires the store, feed and both caches together, with the synchronizer registered to clear
/// the caches after each successful sync. Without a feed the engine is read-only.
#[derive(Clone)]
pub struct Engine {
    pub stocks: StockService,
    pub best: Arc<BestStocks>,
    pub similar: Arc<SimilarityEngine>,
    pub sync: Option<Arc<Synchronizer>>,
}

impl Engine {
    pub fn new(
        store: Arc<dyn RecommendationStore>,
        feed: Option<Arc<dyn FeedSource>>,
        opts: SyncOptions,
    ) -> Self {
        let scorer = Scorer::new(ModelWeights::default());
        let best = Arc::new(BestStocks::new(store.clone(), scorer));
        let similar = Arc::new(SimilarityEngine::new(store.clone()));
        let sync = feed.map(|feed| {
            Arc::new(
                Synchronizer::new(feed, store.clone(), opts)
                    .invalidates(best.clone())
                    .invalidates(similar.clone()),
            )
        });

        Self {
            stocks: StockService::new(store),
            best,
            similar,
            sync,
        }
    }

    /// Spawns the bootstrap full sync followed by the periodic incremental loop. The loop runs on
    /// this engine's synchronizer, so every run clears the caches its readers use.
    ///
    /// Returns `None` for a read-only engine. Abort the handle to stop syncing.
    pub fn spawn_sync_loop(
        &self,
        bootstrap_timeout: Option<Duration>,
        period: Duration,
    ) -> Option<JoinHandle<()>> {
        let sync = self.sync.clone()?;
        Some(tokio::spawn(async move {
            if let Some(timeout) = bootstrap_timeout {
                sync.bootstrap(timeout).await;
            }
            sync.run_incremental(period).await;
        }))
    }

    pub fn require_sync(&self) -> anyhow::Result<&Synchronizer> {
        self.sync
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("no feed configured; set FEED_BASE_URL"))
    }
}
