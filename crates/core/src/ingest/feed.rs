use crate::config::Settings;
use crate::domain::recommendation::Recommendation;
use crate::ingest::error::FeedError;
use crate::ingest::types::{FeedOrdering, FeedPage};
use anyhow::{Context, Result};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use std::time::Duration;

const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Paginated, read-only source of recommendations.
#[async_trait::async_trait]
pub trait FeedSource: Send + Sync {
    fn source_name(&self) -> &'static str;

    fn ordering(&self) -> FeedOrdering {
        FeedOrdering::NewestFirst
    }

    /// `None` requests the first page.
    async fn fetch_page(&self, page_token: Option<&str>) -> Result<FeedPage>;
}

/// Follows `next_page` tokens until the feed is exhausted, sleeping `pause` between requests.
pub async fn fetch_all_pages(feed: &dyn FeedSource, pause: Duration) -> Result<Vec<Recommendation>> {
    let mut all = Vec::new();
    let mut token: Option<String> = None;
    let mut pages: usize = 0;

    loop {
        let page = feed
            .fetch_page(token.as_deref())
            .await
            .with_context(|| format!("fetch feed page {} failed", pages + 1))?;
        pages += 1;

        let next = page.next_token().map(str::to_string);
        all.extend(page.items);

        tracing::debug!(source = feed.source_name(), pages, items = all.len(), "feed page fetched");

        match next {
            Some(next) => token = Some(next),
            None => break,
        }
        tokio::time::sleep(pause).await;
    }

    Ok(all)
}

#[derive(Debug, Clone)]
pub struct HttpFeedClient {
    http: reqwest::Client,
    url: String,
    api_token: Option<String>,
    /// Total tries per page: the first request plus `max_retries` retries.
    attempts: u32,
    ordering: FeedOrdering,
}

impl HttpFeedClient {
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let url = settings.require_feed_base_url()?.to_string();

        let timeout_secs = std::env::var("FEED_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(DEFAULT_TIMEOUT_SECS);

        let ordering = match std::env::var("FEED_ORDERING") {
            Ok(s) if !s.trim().is_empty() => s.parse::<FeedOrdering>()?,
            _ => FeedOrdering::default(),
        };

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .context("failed to build feed http client")?;

        Ok(Self {
            http,
            url,
            api_token: settings.feed_api_token.clone(),
            attempts: settings.max_retries.saturating_add(1),
            ordering,
        })
    }

    fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        if let Some(token) = &self.api_token {
            headers.insert(AUTHORIZATION, HeaderValue::from_str(&format!("Bearer {token}"))?);
        }
        Ok(headers)
    }

    fn error(
        &self,
        stage: &'static str,
        status: Option<reqwest::StatusCode>,
        page_token: Option<&str>,
        detail: String,
    ) -> FeedError {
        FeedError {
            source_name: self.source_name(),
            stage,
            status,
            page_token: page_token.map(str::to_string),
            detail,
        }
    }

    async fn fetch_once(&self, page_token: Option<&str>) -> std::result::Result<FeedPage, FeedError> {
        let headers = self
            .headers()
            .map_err(|e| self.error("request", None, page_token, e.to_string()))?;

        let mut req = self.http.get(&self.url).headers(headers);
        if let Some(token) = page_token {
            req = req.query(&[("next_page", token)]);
        }

        let res = req
            .send()
            .await
            .map_err(|e| self.error("request", None, page_token, e.to_string()))?;

        let status = res.status();
        let text = res
            .text()
            .await
            .map_err(|e| self.error("request", Some(status), page_token, e.to_string()))?;

        if !status.is_success() {
            return Err(self.error("status", Some(status), page_token, text));
        }

        let page = serde_json::from_str::<FeedPage>(&text)
            .map_err(|e| self.error("decode", Some(status), page_token, e.to_string()))?;
        normalize_page(page).map_err(|e| self.error("decode", Some(status), page_token, e.to_string()))
    }
}

#[async_trait::async_trait]
impl FeedSource for HttpFeedClient {
    fn source_name(&self) -> &'static str {
        "external_http_json"
    }

    fn ordering(&self) -> FeedOrdering {
        self.ordering
    }

    async fn fetch_page(&self, page_token: Option<&str>) -> Result<FeedPage> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.fetch_once(page_token).await {
                Ok(page) => return Ok(page),
                Err(err) => {
                    if attempt >= self.attempts || !err.is_retryable() {
                        return Err(err.into());
                    }
                    let backoff = Duration::from_secs(1 << (attempt - 1).min(6));
                    tracing::warn!(attempt, ?backoff, error = %err, "feed fetch failed; retrying");
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }
}

fn normalize_page(mut page: FeedPage) -> Result<FeedPage> {
    for item in &mut page.items {
        let ticker = item.ticker.trim();
        anyhow::ensure!(!ticker.is_empty(), "ticker must be non-empty (time={})", item.time);
        item.ticker = ticker.to_string();
    }
    Ok(page)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    #[test]
    fn parses_feed_page_shape() {
        let v = json!({
            "items": [
                {
                    "ticker": " AAPL ",
                    "target_from": "$150.00",
                    "target_to": "$175.00",
                    "company": "Apple Inc.",
                    "action": "target raised by",
                    "brokerage": "Goldman Sachs",
                    "rating_from": "Neutral",
                    "rating_to": "Buy",
                    "time": "2025-01-15T00:30:05.813548892Z"
                }
            ],
            "next_page": "AAPL"
        });

        let page = normalize_page(serde_json::from_value::<FeedPage>(v).unwrap()).unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].ticker, "AAPL");
        assert_eq!(page.items[0].target_to, "$175.00");
        assert_eq!(page.next_token(), Some("AAPL"));
    }

    #[test]
    fn empty_next_page_is_last_page() {
        let page: FeedPage = serde_json::from_value(json!({"items": [], "next_page": ""})).unwrap();
        assert_eq!(page.next_token(), None);

        let page: FeedPage = serde_json::from_value(json!({"items": []})).unwrap();
        assert_eq!(page.next_token(), None);
    }

    #[test]
    fn rejects_blank_ticker() {
        let v = json!({
            "items": [{"ticker": "  ", "time": "2025-01-15T00:00:00Z"}],
            "next_page": ""
        });
        let page: FeedPage = serde_json::from_value(v).unwrap();
        assert!(normalize_page(page).is_err());
    }

    fn settings_with_retries(max_retries: u32) -> Settings {
        Settings {
            database_url: None,
            sentry_dsn: None,
            feed_base_url: Some("http://127.0.0.1:9/feed".to_string()),
            feed_api_token: None,
            max_retries,
            worker_interval: Duration::from_secs(3600),
            bootstrap_timeout: Duration::from_secs(60),
            port: 3000,
        }
    }

    #[test]
    fn max_retries_counts_retries_after_first_attempt() {
        let client = HttpFeedClient::from_settings(&settings_with_retries(3)).unwrap();
        assert_eq!(client.attempts, 4);

        let client = HttpFeedClient::from_settings(&settings_with_retries(0)).unwrap();
        assert_eq!(client.attempts, 1);
    }

    struct Pages {
        pages: Vec<FeedPage>,
        seen: Mutex<Vec<Option<String>>>,
    }

    #[async_trait::async_trait]
    impl FeedSource for Pages {
        fn source_name(&self) -> &'static str {
            "pages"
        }

        async fn fetch_page(&self, page_token: Option<&str>) -> Result<FeedPage> {
            let mut seen = self.seen.lock().unwrap();
            let idx = seen.len();
            seen.push(page_token.map(str::to_string));
            Ok(self.pages[idx].clone())
        }
    }

    fn page(tickers: &[&str], next: &str) -> FeedPage {
        let items = tickers
            .iter()
            .map(|t| {
                serde_json::from_value(json!({"ticker": t, "time": "2025-01-15T00:00:00Z"})).unwrap()
            })
            .collect();
        FeedPage {
            items,
            next_page: next.to_string(),
        }
    }

    #[tokio::test]
    async fn fetch_all_follows_tokens_until_empty() {
        let feed = Pages {
            pages: vec![page(&["A", "B"], "p2"), page(&["C"], "p3"), page(&[], "")],
            seen: Mutex::new(Vec::new()),
        };

        let all = fetch_all_pages(&feed, Duration::ZERO).await.unwrap();
        let tickers: Vec<&str> = all.iter().map(|r| r.ticker.as_str()).collect();
        assert_eq!(tickers, vec!["A", "B", "C"]);
        assert_eq!(
            *feed.seen.lock().unwrap(),
            vec![None, Some("p2".to_string()), Some("p3".to_string())]
        );
    }
}
