use crate::domain::recommendation::Recommendation;
use crate::storage::RecommendationStore;
use serde::Serialize;
use std::sync::Arc;

const DEFAULT_PAGE_LIMIT: u32 = 50;
const MAX_PAGE_LIMIT: u32 = 100;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Pagination {
    pub page: u32,
    pub limit: u32,
    pub total: i64,
    pub last_page: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecommendationPage {
    pub data: Vec<Recommendation>,
    pub pagination: Pagination,
}

/// Plain read access to stored recommendations.
#[derive(Clone)]
pub struct StockService {
    store: Arc<dyn RecommendationStore>,
}

impl StockService {
    pub fn new(store: Arc<dyn RecommendationStore>) -> Self {
        Self { store }
    }

    /// Pages below 1 become 1; limits outside `1..=100` become 50. A blank ticker means all.
    pub async fn recommendations(
        &self,
        ticker: Option<&str>,
        page: i64,
        limit: i64,
    ) -> anyhow::Result<RecommendationPage> {
        let page = u32::try_from(page.max(1)).unwrap_or(u32::MAX);
        let limit = match u32::try_from(limit) {
            Ok(l) if (1..=MAX_PAGE_LIMIT).contains(&l) => l,
            _ => DEFAULT_PAGE_LIMIT,
        };
        let ticker = ticker.map(str::trim).filter(|t| !t.is_empty());

        let (data, total) = self.store.recommendations(ticker, page, limit).await?;
        let last_page = (total + i64::from(limit) - 1) / i64::from(limit);

        Ok(RecommendationPage {
            data,
            pagination: Pagination {
                page,
                limit,
                total,
                last_page,
            },
        })
    }

    pub async fn available_tickers(&self) -> anyhow::Result<Vec<String>> {
        self.store.available_tickers().await
    }

    pub async fn health_check(&self) -> anyhow::Result<()> {
        self.store.ping().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStore;
    use chrono::{TimeZone, Utc};

    async fn service_with(n: i64) -> StockService {
        let store = Arc::new(MemoryStore::new());
        let batch: Vec<Recommendation> = (0..n)
            .map(|i| Recommendation {
                ticker: (if i % 2 == 0 { "AAPL" } else { "MSFT" }).to_string(),
                target_from: String::new(),
                target_to: String::new(),
                company: String::new(),
                action: String::new(),
                brokerage: String::new(),
                rating_from: String::new(),
                rating_to: String::new(),
                time: Utc.timestamp_opt(1_700_000_000 + i, 0).unwrap(),
            })
            .collect();
        store.insert_recommendations(&batch).await.unwrap();
        StockService::new(store)
    }

    #[tokio::test]
    async fn clamps_page_and_limit() {
        let svc = service_with(120).await;

        let out = svc.recommendations(None, 0, 0).await.unwrap();
        assert_eq!(out.pagination, Pagination { page: 1, limit: 50, total: 120, last_page: 3 });
        assert_eq!(out.data.len(), 50);

        let out = svc.recommendations(None, 3, 500).await.unwrap();
        assert_eq!(out.pagination.limit, 50);
        assert_eq!(out.data.len(), 20);
    }

    #[tokio::test]
    async fn filters_by_ticker_and_ignores_blank() {
        let svc = service_with(10).await;

        let out = svc.recommendations(Some("MSFT"), 1, 100).await.unwrap();
        assert_eq!(out.pagination.total, 5);
        assert!(out.data.iter().all(|r| r.ticker == "MSFT"));

        let out = svc.recommendations(Some("  "), 1, 100).await.unwrap();
        assert_eq!(out.pagination.total, 10);

        assert_eq!(svc.available_tickers().await.unwrap(), vec!["AAPL", "MSFT"]);
        assert!(svc.health_check().await.is_ok());
    }
}
