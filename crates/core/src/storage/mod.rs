pub mod memory;
pub mod postgres;

use crate::domain::recommendation::{FeatureVector, Recommendation, TickerFeatures};
use anyhow::Context;

pub async fn migrate(pool: &sqlx::PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("sqlx migrations failed")?;
    Ok(())
}

/// Durable recommendation storage keyed by `(ticker, time)`.
#[async_trait::async_trait]
pub trait RecommendationStore: Send + Sync {
    /// Rows with `time` inside the trailing `window`, newest first.
    async fn recent_recommendations(
        &self,
        window: chrono::Duration,
    ) -> anyhow::Result<Vec<Recommendation>>;

    /// One page (1-based) of rows, newest first, optionally filtered by ticker, plus the total
    /// row count for the same filter.
    async fn recommendations(
        &self,
        ticker: Option<&str>,
        page: u32,
        limit: u32,
    ) -> anyhow::Result<(Vec<Recommendation>, i64)>;

    async fn available_tickers(&self) -> anyhow::Result<Vec<String>>;

    async fn latest_recommendation(&self) -> anyhow::Result<Option<Recommendation>>;

    /// Upserts the batch in one transaction; an existing key has all other columns replaced.
    async fn insert_recommendations(&self, batch: &[Recommendation]) -> anyhow::Result<u64>;

    async fn delete_all_recommendations(&self) -> anyhow::Result<u64>;

    async fn stock_features(&self, ticker: &str) -> anyhow::Result<FeatureVector>;

    async fn all_stock_features(&self) -> anyhow::Result<Vec<TickerFeatures>>;

    async fn ping(&self) -> anyhow::Result<()>;
}
