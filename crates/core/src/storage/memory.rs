use crate::domain::features;
use crate::domain::recommendation::{FeatureVector, Recommendation, TickerFeatures};
use crate::storage::RecommendationStore;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tokio::sync::RwLock;

type Key = (String, DateTime<Utc>);

/// Process-local store with the same upsert and ordering rules as the Postgres one.
/// Backs `--dry-run` runs and tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    rows: RwLock<BTreeMap<Key, Recommendation>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.read().await.is_empty()
    }

    pub async fn all(&self) -> Vec<Recommendation> {
        newest_first(self.rows.read().await.values().cloned().collect())
    }
}

fn newest_first(mut recs: Vec<Recommendation>) -> Vec<Recommendation> {
    recs.sort_by(|a, b| b.time.cmp(&a.time).then_with(|| a.ticker.cmp(&b.ticker)));
    recs
}

#[async_trait::async_trait]
impl RecommendationStore for MemoryStore {
    async fn recent_recommendations(
        &self,
        window: chrono::Duration,
    ) -> anyhow::Result<Vec<Recommendation>> {
        let since = Utc::now() - window;
        let rows = self.rows.read().await;
        Ok(newest_first(
            rows.values().filter(|r| r.time > since).cloned().collect(),
        ))
    }

    async fn recommendations(
        &self,
        ticker: Option<&str>,
        page: u32,
        limit: u32,
    ) -> anyhow::Result<(Vec<Recommendation>, i64)> {
        let rows = self.rows.read().await;
        let matching = newest_first(
            rows.values()
                .filter(|r| ticker.map_or(true, |t| t.is_empty() || r.ticker == t))
                .cloned()
                .collect(),
        );
        let total = matching.len() as i64;
        let offset = (page.max(1) as usize - 1) * limit as usize;
        let items = matching
            .into_iter()
            .skip(offset)
            .take(limit as usize)
            .collect();
        Ok((items, total))
    }

    async fn available_tickers(&self) -> anyhow::Result<Vec<String>> {
        let rows = self.rows.read().await;
        let mut tickers: Vec<String> = rows.keys().map(|(t, _)| t.clone()).collect();
        tickers.dedup();
        Ok(tickers)
    }

    async fn latest_recommendation(&self) -> anyhow::Result<Option<Recommendation>> {
        let rows = self.rows.read().await;
        Ok(rows.values().max_by_key(|r| r.time).cloned())
    }

    async fn insert_recommendations(&self, batch: &[Recommendation]) -> anyhow::Result<u64> {
        let mut rows = self.rows.write().await;
        for rec in batch {
            let mut rec = rec.clone();
            rec.ticker = rec.ticker.trim().to_string();
            rows.insert((rec.ticker.clone(), rec.time), rec);
        }
        Ok(batch.len() as u64)
    }

    async fn delete_all_recommendations(&self) -> anyhow::Result<u64> {
        let mut rows = self.rows.write().await;
        let n = rows.len() as u64;
        rows.clear();
        Ok(n)
    }

    async fn stock_features(&self, ticker: &str) -> anyhow::Result<FeatureVector> {
        let rows = self.rows.read().await;
        Ok(features::aggregate(
            rows.values().filter(|r| r.ticker == ticker),
        ))
    }

    async fn all_stock_features(&self) -> anyhow::Result<Vec<TickerFeatures>> {
        let rows = self.rows.read().await;
        let mut grouped: BTreeMap<&str, Vec<&Recommendation>> = BTreeMap::new();
        for rec in rows.values() {
            grouped.entry(rec.ticker.as_str()).or_default().push(rec);
        }
        Ok(grouped
            .into_iter()
            .map(|(ticker, recs)| TickerFeatures {
                ticker: ticker.to_string(),
                features: features::aggregate(recs),
            })
            .collect())
    }

    async fn ping(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
