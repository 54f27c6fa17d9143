use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use stockrec_core::config::Settings;
use stockrec_core::domain::recommendation::{Recommendation, SimilarStock};
use stockrec_core::ingest::feed::{FeedSource, HttpFeedClient};
use stockrec_core::service::engine::Engine;
use stockrec_core::service::stocks::RecommendationPage;
use stockrec_core::storage::postgres::PgStore;
use stockrec_core::sync::SyncOptions;

const DEFAULT_SIMILAR_K: usize = 5;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let settings = Settings::from_env()?;
    let _sentry_guard = init_sentry(&settings);

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .with(sentry_tracing::layer())
        .init();

    let engine = match connect_store(&settings).await {
        Ok(store) => Some(Engine::new(
            store,
            build_feed(&settings),
            SyncOptions::from_env()?,
        )),
        Err(e) => {
            sentry_anyhow::capture_anyhow(&e);
            tracing::error!(error = %e, "store unavailable; starting API in degraded mode");
            None
        }
    };

    if let Some(engine) = &engine {
        // Periodic syncs run in this process so they clear the caches the handlers read.
        let handle = engine.spawn_sync_loop(Some(settings.bootstrap_timeout), settings.worker_interval);
        match handle {
            Some(_) => tracing::info!(
                interval_secs = settings.worker_interval.as_secs(),
                "sync loop started"
            ),
            None => tracing::warn!("FEED_BASE_URL missing; serving stored data without syncing"),
        }
    }

    let state = AppState { engine };

    let app = app(state);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], settings.port));

    tracing::info!(%addr, "api listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn connect_store(
    settings: &Settings,
) -> anyhow::Result<Arc<dyn stockrec_core::storage::RecommendationStore>> {
    let pool = stockrec_core::storage::postgres::connect(settings.require_database_url()?).await?;
    stockrec_core::storage::migrate(&pool).await?;
    Ok(Arc::new(PgStore::new(pool)))
}

fn build_feed(settings: &Settings) -> Option<Arc<dyn FeedSource>> {
    settings.feed_base_url.as_ref()?;
    match HttpFeedClient::from_settings(settings) {
        Ok(client) => Some(Arc::new(client)),
        Err(e) => {
            sentry_anyhow::capture_anyhow(&e);
            tracing::error!(error = %e, "feed client init failed; sync disabled");
            None
        }
    }
}

fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .nest("/http/v1", v1_routes())
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Versioned surface the web front end calls.
fn v1_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/recommendations", get(list_recommendations))
        .route("/recommendations/tickers", get(list_tickers))
        .route("/recommendations/best", get(best_recommendations))
        .route("/recommendations/:ticker/similar", get(similar_stocks))
}

#[derive(Clone)]
struct AppState {
    engine: Option<Engine>,
}

impl AppState {
    fn engine(&self) -> Result<&Engine, StatusCode> {
        self.engine.as_ref().ok_or(StatusCode::SERVICE_UNAVAILABLE)
    }
}

fn internal_error(e: anyhow::Error) -> StatusCode {
    sentry_anyhow::capture_anyhow(&e);
    tracing::error!(error = %e, "request failed");
    StatusCode::INTERNAL_SERVER_ERROR
}

async fn healthz() -> &'static str {
    "ok"
}

#[derive(Debug, Serialize)]
struct HealthBody {
    status: &'static str,
    version: &'static str,
}

async fn health(State(state): State<AppState>) -> Result<Json<HealthBody>, StatusCode> {
    let engine = state.engine()?;
    engine.stocks.health_check().await.map_err(|e| {
        tracing::warn!(error = %e, "health check failed");
        StatusCode::SERVICE_UNAVAILABLE
    })?;

    Ok(Json(HealthBody {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
    }))
}

#[derive(Debug, Deserialize)]
struct ListParams {
    ticker: Option<String>,
    page: Option<i64>,
    limit: Option<i64>,
}

async fn list_recommendations(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<RecommendationPage>, StatusCode> {
    let engine = state.engine()?;
    let page = engine
        .stocks
        .recommendations(
            params.ticker.as_deref(),
            params.page.unwrap_or(1),
            params.limit.unwrap_or(0),
        )
        .await
        .map_err(internal_error)?;

    Ok(Json(page))
}

async fn list_tickers(State(state): State<AppState>) -> Result<Json<Vec<String>>, StatusCode> {
    let engine = state.engine()?;
    let tickers = engine
        .stocks
        .available_tickers()
        .await
        .map_err(internal_error)?;

    Ok(Json(tickers))
}

#[derive(Debug, Deserialize)]
struct BestParams {
    limit: Option<i64>,
}

#[derive(Debug, Serialize)]
struct BestBody {
    best_recommendations: Vec<Recommendation>,
    generated_at: DateTime<Utc>,
}

async fn best_recommendations(
    State(state): State<AppState>,
    Query(params): Query<BestParams>,
) -> Result<Json<BestBody>, StatusCode> {
    let engine = state.engine()?;
    let best = engine
        .best
        .best_stocks(params.limit.unwrap_or(0))
        .await
        .map_err(internal_error)?;

    Ok(Json(BestBody {
        best_recommendations: best,
        generated_at: Utc::now(),
    }))
}

#[derive(Debug, Deserialize)]
struct SimilarParams {
    k: Option<usize>,
}

async fn similar_stocks(
    State(state): State<AppState>,
    Path(ticker): Path<String>,
    Query(params): Query<SimilarParams>,
) -> Result<Json<Vec<SimilarStock>>, StatusCode> {
    let engine = state.engine()?;
    let ticker = ticker.trim();
    if ticker.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    let k = params.k.filter(|k| *k >= 1).unwrap_or(DEFAULT_SIMILAR_K);
    let similar = engine
        .similar
        .find_similar(ticker, k)
        .await
        .map_err(internal_error)?;

    Ok(Json(similar))
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

fn init_sentry(settings: &Settings) -> Option<sentry::ClientInitGuard> {
    let dsn = settings.sentry_dsn.as_deref()?;
    Some(sentry::init((
        dsn,
        sentry::ClientOptions {
            release: sentry::release_name!(),
            ..Default::default()
        },
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn serve_degraded() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app(AppState { engine: None })).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn data_routes_live_under_versioned_prefix() {
        let base = serve_degraded().await;
        let client = reqwest::Client::new();
        let status = |path: &'static str| {
            let client = client.clone();
            let url = format!("{base}{path}");
            async move { client.get(url).send().await.unwrap().status() }
        };

        assert_eq!(status("/healthz").await, StatusCode::OK);
        // Degraded mode answers 503 on every routed data path.
        for path in [
            "/http/v1/health",
            "/http/v1/recommendations",
            "/http/v1/recommendations/tickers",
            "/http/v1/recommendations/best",
            "/http/v1/recommendations/AAPL/similar",
        ] {
            assert_eq!(status(path).await, StatusCode::SERVICE_UNAVAILABLE, "{path}");
        }
        assert_eq!(status("/recommendations").await, StatusCode::NOT_FOUND);
    }
}
