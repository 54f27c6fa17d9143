use clap::{Parser, ValueEnum};
use std::fmt::Write as _;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use stockrec_core::config::Settings;
use stockrec_core::domain::recommendation::{Recommendation, SimilarStock};
use stockrec_core::ingest::feed::{FeedSource, HttpFeedClient};
use stockrec_core::service::engine::Engine;
use stockrec_core::storage::memory::MemoryStore;
use stockrec_core::storage::postgres::PgStore;
use stockrec_core::storage::RecommendationStore;
use stockrec_core::sync::{SyncOptions, SyncOutcome};

const REPORT_BEST: i64 = 5;
const REPORT_SIMILAR: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Full sync once, then an incremental sync every WORKER_INTERVAL_SECS until interrupted.
    Serve,
    /// One full sync, then exit.
    Full,
    /// One incremental sync, then exit.
    Incremental,
    /// Print the top stocks and the neighbours of the top pick, then exit. Needs no feed.
    Report,
}

#[derive(Debug, Parser)]
#[command(name = "stockrec_worker")]
struct Args {
    #[arg(long, value_enum, default_value_t = Mode::Serve)]
    mode: Mode,

    /// Use an in-memory store instead of the database.
    #[arg(long)]
    dry_run: bool,
}

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

    let args = Args::parse();

    let store: Arc<dyn RecommendationStore> = if args.dry_run {
        Arc::new(MemoryStore::new())
    } else {
        let pool = stockrec_core::storage::postgres::connect(settings.require_database_url()?).await?;
        stockrec_core::storage::migrate(&pool).await?;
        Arc::new(PgStore::new(pool))
    };

    let feed: Option<Arc<dyn FeedSource>> = match args.mode {
        Mode::Report => None,
        _ => Some(Arc::new(HttpFeedClient::from_settings(&settings)?)),
    };
    let engine = Engine::new(store.clone(), feed, SyncOptions::from_env()?);

    tracing::info!(mode = ?args.mode, dry_run = args.dry_run, "worker starting");

    match args.mode {
        Mode::Full => {
            let outcome = engine.require_sync()?.full_sync().await?;
            report_sync("full", &outcome, store.as_ref()).await;
        }
        Mode::Incremental => {
            let outcome = engine.require_sync()?.incremental_sync().await?;
            report_sync("incremental", &outcome, store.as_ref()).await;
        }
        Mode::Report => {
            let best = engine.best.best_stocks(REPORT_BEST).await?;
            let similar = match best.first() {
                Some(top) => engine.similar.find_similar(&top.ticker, REPORT_SIMILAR).await?,
                None => Vec::new(),
            };
            print!("{}", render_report(&best, &similar));
        }
        Mode::Serve => {
            let handle = engine
                .spawn_sync_loop(Some(settings.bootstrap_timeout), settings.worker_interval);
            if let Some(handle) = handle {
                tokio::signal::ctrl_c().await?;
                tracing::info!("shutdown signal received; worker stopping");
                handle.abort();
            }
        }
    }

    Ok(())
}

async fn report_sync(kind: &str, outcome: &SyncOutcome, store: &dyn RecommendationStore) {
    let latest = match store.latest_recommendation().await {
        Ok(latest) => latest.map(|r| r.time),
        Err(e) => {
            tracing::warn!(error = %e, "latest recommendation lookup failed");
            None
        }
    };
    tracing::info!(
        kind,
        fetched = outcome.fetched,
        written = outcome.written,
        latest = ?latest,
        "sync finished"
    );
}

fn render_report(best: &[Recommendation], similar: &[SimilarStock]) -> String {
    let mut out = String::new();
    if best.is_empty() {
        out.push_str("No recommendations stored yet.\n");
        return out;
    }

    out.push_str("\nTop stock recommendations:\n");
    for (i, rec) in best.iter().enumerate() {
        let _ = writeln!(out, "{}. {} ({})", i + 1, rec.ticker, rec.company);
        let _ = writeln!(out, "   Recommendation: {} -> {}", rec.rating_from, rec.rating_to);
        let _ = writeln!(out, "   Broker: {}, Action: {}", rec.brokerage, rec.action);
        let _ = writeln!(
            out,
            "   Target: {} - {}, Date: {}\n",
            rec.target_from,
            rec.target_to,
            rec.time.format("%Y-%m-%d")
        );
    }

    let _ = writeln!(out, "\nStocks similar to {}:", best[0].ticker);
    for s in similar {
        let _ = writeln!(out, "- {} (similarity: {:.2})", s.ticker, s.similarity);
    }
    out
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
