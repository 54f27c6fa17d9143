pub mod best;
pub mod cache;
pub mod domain;
pub mod ingest;
pub mod scoring;
pub mod service;
pub mod similarity;
pub mod storage;
pub mod sync;

pub mod config {
    use anyhow::Context;
    use std::time::Duration;

    const DEFAULT_MAX_RETRIES: u32 = 3;
    const DEFAULT_WORKER_INTERVAL_SECS: u64 = 3600;
    const DEFAULT_BOOTSTRAP_TIMEOUT_SECS: u64 = 60;
    const DEFAULT_PORT: u16 = 3000;

    #[derive(Debug, Clone)]
    pub struct Settings {
        pub database_url: Option<String>,
        pub sentry_dsn: Option<String>,
        pub feed_base_url: Option<String>,
        pub feed_api_token: Option<String>,
        /// Retries per feed page after the first failed request (0 = no retry).
        pub max_retries: u32,
        pub worker_interval: Duration,
        pub bootstrap_timeout: Duration,
        pub port: u16,
    }

    impl Settings {
        pub fn from_env() -> anyhow::Result<Self> {
            Ok(Self {
                database_url: std::env::var("DATABASE_URL").ok(),
                sentry_dsn: std::env::var("SENTRY_DSN").ok(),
                feed_base_url: std::env::var("FEED_BASE_URL").ok(),
                feed_api_token: std::env::var("FEED_API_TOKEN").ok(),
                max_retries: env_parse("MAX_RETRIES")?.unwrap_or(DEFAULT_MAX_RETRIES),
                worker_interval: Duration::from_secs(
                    env_parse("WORKER_INTERVAL_SECS")?.unwrap_or(DEFAULT_WORKER_INTERVAL_SECS),
                ),
                bootstrap_timeout: Duration::from_secs(
                    env_parse("BOOTSTRAP_TIMEOUT_SECS")?.unwrap_or(DEFAULT_BOOTSTRAP_TIMEOUT_SECS),
                ),
                port: env_parse("PORT")?.unwrap_or(DEFAULT_PORT),
            })
        }

        pub fn require_database_url(&self) -> anyhow::Result<&str> {
            self.database_url
                .as_deref()
                .context("DATABASE_URL is required")
        }

        pub fn require_feed_base_url(&self) -> anyhow::Result<&str> {
            self.feed_base_url
                .as_deref()
                .context("FEED_BASE_URL is required")
        }
    }

    fn env_parse<T>(key: &str) -> anyhow::Result<Option<T>>
    where
        T: std::str::FromStr,
        T::Err: std::error::Error + Send + Sync + 'static,
    {
        match std::env::var(key) {
            Ok(s) if !s.trim().is_empty() => s
                .trim()
                .parse::<T>()
                .map(Some)
                .with_context(|| format!("{key} is not valid: {s}")),
            _ => Ok(None),
        }
    }
}
