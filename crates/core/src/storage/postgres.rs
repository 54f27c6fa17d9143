use crate::domain::features;
use crate::domain::recommendation::{FeatureVector, Recommendation, TickerFeatures};
use crate::storage::RecommendationStore;
use anyhow::Context;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

// Postgres caps bind parameters at 65535 per statement; 9 per row.
const UPSERT_CHUNK_ROWS: usize = 1000;

const SELECT_COLUMNS: &str =
    "ticker, target_from, target_to, company, action, brokerage, rating_from, rating_to, time";

pub async fn connect(database_url: &str) -> anyhow::Result<sqlx::PgPool> {
    let max_connections = std::env::var("DB_MAX_CONNECTIONS")
        .ok()
        .and_then(|s| s.parse::<u32>().ok())
        .unwrap_or(5);

    sqlx::postgres::PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
        .context("connect DATABASE_URL failed")
}

#[derive(Debug, sqlx::FromRow)]
struct RecommendationRow {
    ticker: String,
    target_from: String,
    target_to: String,
    company: String,
    action: String,
    brokerage: String,
    rating_from: String,
    rating_to: String,
    time: DateTime<Utc>,
}

impl From<RecommendationRow> for Recommendation {
    fn from(row: RecommendationRow) -> Self {
        Self {
            ticker: row.ticker,
            target_from: row.target_from,
            target_to: row.target_to,
            company: row.company,
            action: row.action,
            brokerage: row.brokerage,
            rating_from: row.rating_from,
            rating_to: row.rating_to,
            time: row.time,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: sqlx::PgPool,
}

impl PgStore {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &sqlx::PgPool {
        &self.pool
    }
}

/// A single INSERT .. ON CONFLICT may not touch the same key twice; the last occurrence wins.
/// Keys use the trimmed ticker, which is what gets stored.
fn dedupe_by_key(batch: &[Recommendation]) -> Vec<&Recommendation> {
    let key = |rec: &Recommendation| (rec.ticker.trim().to_string(), rec.time);
    let mut last: HashMap<(String, DateTime<Utc>), usize> = HashMap::with_capacity(batch.len());
    for (idx, rec) in batch.iter().enumerate() {
        last.insert(key(rec), idx);
    }
    batch
        .iter()
        .enumerate()
        .filter(|(idx, rec)| last.get(&key(rec)) == Some(idx))
        .map(|(_, rec)| rec)
        .collect()
}

fn like_any(patterns: &[&str]) -> Vec<String> {
    patterns.iter().map(|p| format!("%{p}%")).collect()
}

#[async_trait::async_trait]
impl RecommendationStore for PgStore {
    async fn recent_recommendations(
        &self,
        window: chrono::Duration,
    ) -> anyhow::Result<Vec<Recommendation>> {
        let since = Utc::now() - window;
        let rows = sqlx::query_as::<_, RecommendationRow>(&format!(
            "SELECT {SELECT_COLUMNS} FROM recommendations WHERE time > $1 ORDER BY time DESC"
        ))
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .context("select recent recommendations failed")?;

        Ok(rows.into_iter().map(Recommendation::from).collect())
    }

    async fn recommendations(
        &self,
        ticker: Option<&str>,
        page: u32,
        limit: u32,
    ) -> anyhow::Result<(Vec<Recommendation>, i64)> {
        let ticker = ticker.unwrap_or("");
        let offset = i64::from(page.max(1) - 1) * i64::from(limit);

        let rows = sqlx::query_as::<_, RecommendationRow>(&format!(
            "SELECT {SELECT_COLUMNS} FROM recommendations \
             WHERE ($1 = '' OR ticker = $1) \
             ORDER BY time DESC, ticker ASC \
             LIMIT $2 OFFSET $3"
        ))
        .bind(ticker)
        .bind(i64::from(limit))
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("select recommendations failed (ticker={ticker:?})"))?;

        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM recommendations WHERE ($1 = '' OR ticker = $1)",
        )
        .bind(ticker)
        .fetch_one(&self.pool)
        .await
        .context("count recommendations failed")?;

        Ok((rows.into_iter().map(Recommendation::from).collect(), total))
    }

    async fn available_tickers(&self) -> anyhow::Result<Vec<String>> {
        sqlx::query_scalar("SELECT DISTINCT ticker FROM recommendations ORDER BY ticker")
            .fetch_all(&self.pool)
            .await
            .context("select distinct tickers failed")
    }

    async fn latest_recommendation(&self) -> anyhow::Result<Option<Recommendation>> {
        let row = sqlx::query_as::<_, RecommendationRow>(&format!(
            "SELECT {SELECT_COLUMNS} FROM recommendations ORDER BY time DESC LIMIT 1"
        ))
        .fetch_optional(&self.pool)
        .await
        .context("select latest recommendation failed")?;

        Ok(row.map(Recommendation::from))
    }

    async fn insert_recommendations(&self, batch: &[Recommendation]) -> anyhow::Result<u64> {
        if batch.is_empty() {
            return Ok(0);
        }

        let rows = dedupe_by_key(batch);
        let mut tx = self.pool.begin().await.context("begin transaction failed")?;

        let mut affected: u64 = 0;
        for chunk in rows.chunks(UPSERT_CHUNK_ROWS) {
            let t0 = std::time::Instant::now();
            let mut qb = sqlx::QueryBuilder::new(
                "INSERT INTO recommendations \
                 (ticker, target_from, target_to, company, action, brokerage, rating_from, rating_to, time) ",
            );
            qb.push_values(chunk, |mut b, rec| {
                b.push_bind(rec.ticker.trim())
                    .push_bind(&rec.target_from)
                    .push_bind(&rec.target_to)
                    .push_bind(&rec.company)
                    .push_bind(&rec.action)
                    .push_bind(&rec.brokerage)
                    .push_bind(&rec.rating_from)
                    .push_bind(&rec.rating_to)
                    .push_bind(rec.time);
            });
            qb.push(
                " ON CONFLICT (ticker, time) DO UPDATE SET \
                   target_from = EXCLUDED.target_from, \
                   target_to = EXCLUDED.target_to, \
                   company = EXCLUDED.company, \
                   action = EXCLUDED.action, \
                   brokerage = EXCLUDED.brokerage, \
                   rating_from = EXCLUDED.rating_from, \
                   rating_to = EXCLUDED.rating_to",
            );

            let res = qb
                .build()
                .persistent(false)
                .execute(&mut *tx)
                .await
                .context("batch upsert recommendations failed")?;
            affected += res.rows_affected();

            tracing::debug!(
                batch_size = chunk.len(),
                elapsed_ms = t0.elapsed().as_millis(),
                "recommendations batch upsert"
            );
        }

        tx.commit().await.context("commit transaction failed")?;
        Ok(affected)
    }

    async fn delete_all_recommendations(&self) -> anyhow::Result<u64> {
        let res = sqlx::query("DELETE FROM recommendations")
            .execute(&self.pool)
            .await
            .context("delete recommendations failed")?;
        Ok(res.rows_affected())
    }

    async fn stock_features(&self, ticker: &str) -> anyhow::Result<FeatureVector> {
        let row = sqlx::query_as::<
            _,
            (
                i64,
                Option<f64>,
                Option<f64>,
                Option<f64>,
                Option<f64>,
                Option<f64>,
                Option<f64>,
                i64,
            ),
        >(
            "WITH cleaned AS ( \
                 SELECT action, rating_to, brokerage, \
                        regexp_replace(target_from, '[$,[:space:]]', '', 'g') AS lo, \
                        regexp_replace(target_to, '[$,[:space:]]', '', 'g') AS hi \
                 FROM recommendations WHERE ticker = $1 \
             ), ranged AS ( \
                 SELECT action, rating_to, brokerage, \
                        CASE WHEN lo ~ $6 AND hi ~ $6 THEN hi::float8 - lo::float8 END AS target_range \
                 FROM cleaned \
             ) \
             SELECT COUNT(*)::int8, \
                    AVG(target_range), \
                    AVG(CASE WHEN action ILIKE ANY($2) THEN 1 ELSE 0 END)::float8, \
                    AVG(CASE WHEN action ILIKE ANY($3) THEN 1 ELSE 0 END)::float8, \
                    AVG(CASE WHEN rating_to ILIKE ANY($4) THEN 1 ELSE 0 END)::float8, \
                    AVG(CASE WHEN rating_to ILIKE ANY($5) THEN 1 ELSE 0 END)::float8, \
                    STDDEV(target_range), \
                    COUNT(DISTINCT brokerage)::int8 \
             FROM ranged",
        )
        .persistent(false)
        .bind(ticker)
        .bind(like_any(features::UPGRADE_PATTERNS))
        .bind(like_any(features::DOWNGRADE_PATTERNS))
        .bind(like_any(features::BUY_PATTERNS))
        .bind(like_any(features::SELL_PATTERNS))
        .bind(features::PRICE_PATTERN)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("aggregate stock features failed (ticker={ticker})"))?;

        let (total, range, upgrade, downgrade, buy, sell, volatility, brokers) = row;
        let diversity = if total == 0 {
            0.0
        } else {
            brokers as f64 / total as f64
        };

        let mut out = FeatureVector::new();
        out.insert(features::TOTAL_RECOMMENDATIONS.to_string(), total as f64);
        out.insert(features::TARGET_RANGE.to_string(), range.unwrap_or(0.0));
        out.insert(features::UPGRADE_PROBABILITY.to_string(), upgrade.unwrap_or(0.0));
        out.insert(features::DOWNGRADE_PROBABILITY.to_string(), downgrade.unwrap_or(0.0));
        out.insert(features::BUY_RATING.to_string(), buy.unwrap_or(0.0));
        out.insert(features::SELL_RATING.to_string(), sell.unwrap_or(0.0));
        out.insert(features::TARGET_VOLATILITY.to_string(), volatility.unwrap_or(0.0));
        out.insert(features::UNIQUE_BROKERS.to_string(), brokers as f64);
        out.insert(features::BROKER_DIVERSITY.to_string(), diversity);
        Ok(out)
    }

    async fn all_stock_features(&self) -> anyhow::Result<Vec<TickerFeatures>> {
        let tickers = self.available_tickers().await?;
        let mut out = Vec::with_capacity(tickers.len());
        for ticker in tickers {
            let res = self.stock_features(&ticker).await;
            match res {
                Ok(features) => out.push(TickerFeatures { ticker, features }),
                Err(err) => {
                    tracing::warn!(%ticker, error = %err, "stock features failed; skipping ticker");
                }
            }
        }
        Ok(out)
    }

    async fn ping(&self) -> anyhow::Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .context("database ping failed")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn rec(ticker: &str, secs: i64, company: &str) -> Recommendation {
        Recommendation {
            ticker: ticker.to_string(),
            target_from: "$1".to_string(),
            target_to: "$2".to_string(),
            company: company.to_string(),
            action: String::new(),
            brokerage: String::new(),
            rating_from: String::new(),
            rating_to: String::new(),
            time: Utc.timestamp_opt(secs, 0).unwrap(),
        }
    }

    #[test]
    fn dedupe_keeps_last_occurrence_in_order() {
        let batch = vec![
            rec("AAPL", 10, "old"),
            rec("MSFT", 10, "msft"),
            rec("AAPL", 10, "new"),
            rec("AAPL", 11, "other"),
        ];
        let out: Vec<&str> = dedupe_by_key(&batch)
            .into_iter()
            .map(|r| r.company.as_str())
            .collect();
        assert_eq!(out, vec!["msft", "new", "other"]);
    }

    #[test]
    fn dedupe_treats_padded_ticker_as_same_key() {
        let batch = vec![rec("AAPL", 10, "old"), rec("AAPL ", 10, "padded"), rec(" MSFT", 10, "msft")];
        let out: Vec<&str> = dedupe_by_key(&batch)
            .into_iter()
            .map(|r| r.company.as_str())
            .collect();
        assert_eq!(out, vec!["padded", "msft"]);
    }

    #[test]
    fn like_patterns_are_wrapped() {
        assert_eq!(like_any(&["buy", "comprar"]), vec!["%buy%", "%comprar%"]);
    }
}
