use crate::cache::{Invalidate, TtlSlot};
use crate::domain::recommendation::Recommendation;
use crate::scoring::Scorer;
use crate::storage::RecommendationStore;
use anyhow::Context;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_LIMIT: usize = 10;
pub const MAX_LIMIT: usize = 100;

const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);
const SCORING_WINDOW_DAYS: i64 = 30;

/// Limits outside `1..=MAX_LIMIT` fall back to `DEFAULT_LIMIT`.
pub fn clamp_limit(limit: i64) -> usize {
    if (1..=MAX_LIMIT as i64).contains(&limit) {
        limit as usize
    } else {
        DEFAULT_LIMIT
    }
}

/// Top-ranked tickers, one representative recommendation each, behind a short TTL cache.
///
/// Concurrent callers that find the cache expired each rebuild the ranking; there is no
/// request coalescing.
pub struct BestStocks {
    store: Arc<dyn RecommendationStore>,
    scorer: Scorer,
    cache: TtlSlot<Vec<Recommendation>>,
}

impl BestStocks {
    pub fn new(store: Arc<dyn RecommendationStore>, scorer: Scorer) -> Self {
        Self::with_ttl(store, scorer, DEFAULT_TTL)
    }

    pub fn with_ttl(store: Arc<dyn RecommendationStore>, scorer: Scorer, ttl: Duration) -> Self {
        Self {
            store,
            scorer,
            cache: TtlSlot::new(ttl),
        }
    }

    pub async fn best_stocks(&self, limit: i64) -> anyhow::Result<Vec<Recommendation>> {
        let limit = clamp_limit(limit);

        if let Some(mut cached) = self.cache.get_if(|list| !list.is_empty()).await {
            cached.truncate(limit);
            return Ok(cached);
        }

        let recent = self
            .store
            .recent_recommendations(chrono::Duration::days(SCORING_WINDOW_DAYS))
            .await
            .context("load recent recommendations failed")?;
        let ranked = self.scorer.rank_tickers(&recent, Utc::now());

        let mut best = Vec::with_capacity(limit.min(ranked.len()));
        for entry in &ranked {
            if best.len() >= limit {
                break;
            }
            let (items, _) = self
                .store
                .recommendations(Some(entry.ticker.as_str()), 1, 1)
                .await
                .with_context(|| format!("load detail for {} failed", entry.ticker))?;
            if let Some(rec) = items.into_iter().next() {
                best.push(rec);
            }
        }

        tracing::debug!(
            recent = recent.len(),
            ranked = ranked.len(),
            returned = best.len(),
            limit,
            "best stocks recomputed"
        );

        self.cache.put(best.clone()).await;
        Ok(best)
    }
}

#[async_trait::async_trait]
impl Invalidate for BestStocks {
    fn cache_name(&self) -> &'static str {
        "best_stocks"
    }

    async fn invalidate(&self) {
        self.cache.clear().await;
    }
}
