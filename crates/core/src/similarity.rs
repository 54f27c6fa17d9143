use crate::cache::{Invalidate, KeyedCache};
use crate::domain::features;
use crate::domain::recommendation::{FeatureVector, SimilarStock, TickerFeatures};
use crate::storage::RecommendationStore;
use anyhow::Context;
use std::sync::Arc;
use tokio::task::JoinSet;

// Candidates scored between cooperative yields, so an aborted batch stops promptly.
const YIELD_EVERY: usize = 256;

/// Cosine similarity of `target` and `candidate`.
///
/// The dot product runs over the target's keys only (a key missing from the candidate adds 0),
/// while each magnitude covers all of that vector's own keys. A zero-magnitude side yields 0.
pub fn cosine_similarity(target: &FeatureVector, candidate: &FeatureVector) -> f64 {
    let mut dot = 0.0;
    let mut mag_target = 0.0;
    for (key, a) in target {
        if let Some(b) = candidate.get(key) {
            dot += a * b;
        }
        mag_target += a * a;
    }
    let mag_candidate: f64 = candidate.values().map(|b| b * b).sum();

    let mag_target = mag_target.sqrt();
    let mag_candidate = mag_candidate.sqrt();
    if mag_target == 0.0 || mag_candidate == 0.0 {
        return 0.0;
    }
    dot / (mag_target * mag_candidate)
}

fn default_workers() -> usize {
    std::env::var("SIMILARITY_WORKERS")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .filter(|n| *n >= 1)
        .unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        })
}

/// Nearest-neighbour search over per-ticker feature vectors.
///
/// Each ticker's full ranking is cached until `invalidate`; hits are cut to the caller's `k`.
pub struct SimilarityEngine {
    store: Arc<dyn RecommendationStore>,
    cache: KeyedCache<String, Arc<Vec<SimilarStock>>>,
    workers: usize,
}

impl SimilarityEngine {
    pub fn new(store: Arc<dyn RecommendationStore>) -> Self {
        Self::with_workers(store, default_workers())
    }

    pub fn with_workers(store: Arc<dyn RecommendationStore>, workers: usize) -> Self {
        Self {
            store,
            cache: KeyedCache::new(),
            workers: workers.max(1),
        }
    }

    /// Top `k` tickers most similar to `ticker`, never including `ticker` itself.
    ///
    /// A ticker with no stored recommendations has no neighbours and is not cached. Dropping the
    /// returned future aborts the similarity batches; a running batch stops at its next yield.
    pub async fn find_similar(&self, ticker: &str, k: usize) -> anyhow::Result<Vec<SimilarStock>> {
        if let Some(ranked) = self.cache.get(ticker).await {
            return Ok(ranked.iter().take(k).cloned().collect());
        }

        let target = self
            .store
            .stock_features(ticker)
            .await
            .with_context(|| format!("load features for {ticker} failed"))?;
        let known = target
            .get(features::TOTAL_RECOMMENDATIONS)
            .is_some_and(|n| *n > 0.0);
        if !known {
            tracing::debug!(ticker, "similarity requested for unknown ticker");
            return Ok(Vec::new());
        }
        let universe = self
            .store
            .all_stock_features()
            .await
            .context("load features for all tickers failed")?;

        let candidates: Vec<TickerFeatures> =
            universe.into_iter().filter(|c| c.ticker != ticker).collect();
        let ranked = Arc::new(self.rank(Arc::new(target), candidates).await?);

        self.cache.put(ticker.to_string(), ranked.clone()).await;
        Ok(ranked.iter().take(k).cloned().collect())
    }

    async fn rank(
        &self,
        target: Arc<FeatureVector>,
        candidates: Vec<TickerFeatures>,
    ) -> anyhow::Result<Vec<SimilarStock>> {
        let total = candidates.len();
        if total == 0 {
            return Ok(Vec::new());
        }

        let batch_size = total.div_ceil(self.workers);
        let mut tasks = JoinSet::new();
        let mut pending = candidates.into_iter().peekable();
        while pending.peek().is_some() {
            let batch: Vec<TickerFeatures> = pending.by_ref().take(batch_size).collect();
            let target = Arc::clone(&target);
            tasks.spawn(async move {
                let mut scored = Vec::with_capacity(batch.len());
                for (i, c) in batch.into_iter().enumerate() {
                    if i > 0 && i % YIELD_EVERY == 0 {
                        tokio::task::yield_now().await;
                    }
                    scored.push(SimilarStock {
                        similarity: cosine_similarity(&target, &c.features),
                        ticker: c.ticker,
                    });
                }
                scored
            });
        }

        // The JoinSet aborts every remaining task if this future is dropped.
        let mut ranked = Vec::with_capacity(total);
        while let Some(joined) = tasks.join_next().await {
            ranked.extend(joined.context("similarity batch panicked")?);
        }

        ranked.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.ticker.cmp(&b.ticker))
        });

        tracing::debug!(candidates = total, workers = self.workers, "similarity ranking computed");
        Ok(ranked)
    }
}

#[async_trait::async_trait]
impl Invalidate for SimilarityEngine {
    fn cache_name(&self) -> &'static str {
        "similar_stocks"
    }

    async fn invalidate(&self) {
        self.cache.clear().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::recommendation::Recommendation;
    use crate::storage::memory::MemoryStore;
    use chrono::{TimeZone, Utc};

    fn fv(pairs: &[(&str, f64)]) -> FeatureVector {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    fn rec(ticker: &str, secs: i64, action: &str, rating_to: &str, brokerage: &str, to: &str) -> Recommendation {
        Recommendation {
            ticker: ticker.to_string(),
            target_from: "$100.00".to_string(),
            target_to: to.to_string(),
            company: format!("{ticker} Inc."),
            action: action.to_string(),
            brokerage: brokerage.to_string(),
            rating_from: "Neutral".to_string(),
            rating_to: rating_to.to_string(),
            time: Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
        }
    }

    async fn universe() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store
            .insert_recommendations(&[
                rec("AAPL", 1, "target raised by", "Buy", "Goldman Sachs", "$120"),
                rec("AAPL", 2, "target raised by", "Buy", "Mizuho", "$130"),
                rec("MSFT", 1, "target raised by", "Buy", "BMO", "$125"),
                rec("MSFT", 2, "target raised by", "Buy", "BMO", "$121"),
                rec("XOM", 1, "target lowered by", "Sell", "Mizuho", "$90"),
                rec("NVDA", 1, "reiterated by", "Neutral", "JPMorgan", "$300"),
            ])
            .await
            .unwrap();
        store
    }

    #[test]
    fn cosine_is_symmetric_over_shared_keys() {
        let a = fv(&[("x", 1.0), ("y", 2.0), ("z", -0.5)]);
        let b = fv(&[("x", 3.0), ("y", -1.0), ("z", 4.0)]);
        assert!((cosine_similarity(&a, &b) - cosine_similarity(&b, &a)).abs() < 1e-12);
        assert!((cosine_similarity(&a, &a) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn cosine_counts_candidate_only_keys_in_magnitude() {
        let target = fv(&[("x", 1.0)]);
        let candidate = fv(&[("x", 1.0), ("extra", 1.0)]);
        let expected = 1.0 / 2.0_f64.sqrt();
        assert!((cosine_similarity(&target, &candidate) - expected).abs() < 1e-12);

        let missing = fv(&[("other", 5.0)]);
        assert_eq!(cosine_similarity(&target, &missing), 0.0);
    }

    #[test]
    fn cosine_zero_magnitude_is_zero() {
        let zero = fv(&[("x", 0.0), ("y", 0.0)]);
        let a = fv(&[("x", 1.0)]);
        assert_eq!(cosine_similarity(&zero, &a), 0.0);
        assert_eq!(cosine_similarity(&a, &zero), 0.0);
        assert_eq!(cosine_similarity(&FeatureVector::new(), &a), 0.0);
    }

    #[tokio::test]
    async fn excludes_query_ticker_and_sorts_descending() {
        let engine = SimilarityEngine::with_workers(universe().await, 2);
        let out = engine.find_similar("AAPL", 10).await.unwrap();

        assert_eq!(out.len(), 3);
        assert!(out.iter().all(|s| s.ticker != "AAPL"));
        assert!(out.windows(2).all(|w| w[0].similarity >= w[1].similarity));
        assert_eq!(out[0].ticker, "MSFT");
    }

    #[tokio::test]
    async fn worker_count_does_not_change_result() {
        let store = universe().await;
        let one = SimilarityEngine::with_workers(store.clone(), 1)
            .find_similar("MSFT", 10)
            .await
            .unwrap();
        let many = SimilarityEngine::with_workers(store, 16)
            .find_similar("MSFT", 10)
            .await
            .unwrap();
        assert_eq!(one, many);
    }

    #[tokio::test]
    async fn cache_hit_is_cut_to_requested_k() {
        let store = universe().await;
        let engine = SimilarityEngine::with_workers(store.clone(), 2);

        let two = engine.find_similar("AAPL", 2).await.unwrap();
        assert_eq!(two.len(), 2);

        // A later write is not seen until the cache is invalidated.
        store
            .insert_recommendations(&[rec("AMD", 1, "target raised by", "Buy", "BMO", "$125")])
            .await
            .unwrap();
        let three = engine.find_similar("AAPL", 3).await.unwrap();
        assert_eq!(three.len(), 3);
        assert_eq!(three[..2], two[..]);
        assert!(three.iter().all(|s| s.ticker != "AMD"));

        engine.invalidate().await;
        let after = engine.find_similar("AAPL", 10).await.unwrap();
        assert!(after.iter().any(|s| s.ticker == "AMD"));
    }

    #[tokio::test]
    async fn unknown_ticker_is_empty_and_not_cached() {
        let engine = SimilarityEngine::with_workers(universe().await, 2);

        assert!(engine.find_similar("NOPE", 5).await.unwrap().is_empty());
        assert!(engine.find_similar("zzz-123", 5).await.unwrap().is_empty());
        assert_eq!(engine.cache.len().await, 0);

        assert!(!engine.find_similar("AAPL", 5).await.unwrap().is_empty());
        assert_eq!(engine.cache.len().await, 1);
    }

    #[tokio::test]
    async fn large_universe_ranks_across_yields() {
        let store = Arc::new(MemoryStore::new());
        let batch: Vec<Recommendation> = (0..(YIELD_EVERY * 3))
            .map(|i| rec(&format!("T{i:04}"), 1, "target raised by", "Buy", "BMO", "$120"))
            .collect();
        store.insert_recommendations(&batch).await.unwrap();

        let engine = SimilarityEngine::with_workers(store, 2);
        let out = engine.find_similar("T0000", 10_000).await.unwrap();
        assert_eq!(out.len(), YIELD_EVERY * 3 - 1);
        assert!(out.iter().all(|s| s.ticker != "T0000"));
    }

    #[tokio::test]
    async fn single_ticker_universe_has_no_neighbours() {
        let store = Arc::new(MemoryStore::new());
        store
            .insert_recommendations(&[rec("AAPL", 1, "initiated by", "Buy", "BMO", "$120")])
            .await
            .unwrap();
        let engine = SimilarityEngine::new(store);
        assert!(engine.find_similar("AAPL", 5).await.unwrap().is_empty());
    }
}
