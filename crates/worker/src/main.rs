use anyhow::Context;
use clap::Parser;
use revrank_core::engine::{DatePlan, Engine, Mode};
use revrank_core::ingest::provider::HttpJsonDataProvider;
use revrank_core::notify::{LogSink, WebhookSink};
use revrank_core::ranking::RankingConfig;
use revrank_core::storage::{MemoryRankStore, PgRankStore, RankStore};
use revrank_core::time::market::{parse_date, resolve_as_of_date, MarketCalendar};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod universe;

#[derive(Debug, Parser)]
#[command(name = "revrank_worker")]
struct Args {
    /// Market as-of date (YYYY-MM-DD). Defaults to the latest closed session.
    #[arg(long, conflicts_with_all = ["from", "to"])]
    as_of_date: Option<String>,

    /// First date of a range (YYYY-MM-DD); trading days only.
    #[arg(long)]
    from: Option<String>,

    /// Last date of a range (YYYY-MM-DD). Defaults to the latest closed session.
    #[arg(long, requires = "from")]
    to: Option<String>,

    /// score-only | rank-only | full | recompute
    #[arg(long, default_value = "full")]
    mode: Mode,

    /// One ticker per line. Falls back to UNIVERSE_TICKERS.
    #[arg(long)]
    tickers_file: Option<PathBuf>,

    /// Run against an in-memory store; nothing is written to the database.
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    dotenvy::dotenv().ok();

    let settings = revrank_core::config::Settings::from_env()?;
    let _sentry_guard = init_sentry(&settings);

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .with(sentry_tracing::layer())
        .init();

    let args = Args::parse();

    match run(args, &settings).await {
        Ok(code) => Ok(code),
        Err(err) => {
            sentry_anyhow::capture_anyhow(&err);
            tracing::error!(error = %format!("{err:#}"), "worker run failed");
            Err(err)
        }
    }
}

async fn run(args: Args, settings: &revrank_core::config::Settings) -> anyhow::Result<ExitCode> {
    let calendar = MarketCalendar::from_env()?;
    let cfg = RankingConfig::from_env()?;

    let store: Arc<dyn RankStore> = if args.dry_run {
        tracing::info!(dry_run = true, "using in-memory store");
        Arc::new(MemoryRankStore::new())
    } else {
        let db_url = settings.require_database_url()?;
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(5)
            .connect(db_url)
            .await
            .context("connect DATABASE_URL failed")?;

        revrank_core::storage::migrate(&pool).await?;
        Arc::new(PgRankStore::new(pool)?)
    };

    let plan = build_plan(&args, &calendar, store.as_ref()).await?;
    anyhow::ensure!(!plan.is_empty(), "no dates to process in the requested range");

    let mut engine = Engine::new(store, cfg).with_sink(Box::new(LogSink));

    if let Some(url) = settings.notify_webhook_url.as_deref() {
        engine = engine.with_sink(Box::new(WebhookSink::new(url)?));
    }

    if acquires(args.mode) {
        if settings.data_provider_base_url.is_some() {
            let tickers = universe::load_tickers(args.tickers_file.as_deref())?;
            let provider = HttpJsonDataProvider::from_settings(settings)?;
            tracing::info!(tickers = tickers.len(), "data provider configured");
            engine = engine.with_provider(
                Arc::new(provider),
                tickers,
                universe::fetch_concurrency(),
            );
        } else {
            tracing::warn!("DATA_PROVIDER_BASE_URL not set; using stored snapshots");
        }
    }

    let summary = engine.run(args.mode, &plan).await?;

    for r in summary.reports.iter().filter(|r| r.error.is_some()) {
        tracing::warn!(as_of_date = %r.as_of_date, error = ?r.error, "date not completed");
    }

    let code = summary.exit_code();
    Ok(ExitCode::from(u8::try_from(code).unwrap_or(1)))
}

fn acquires(mode: Mode) -> bool {
    matches!(mode, Mode::ScoreOnly | Mode::Full)
}

/// Ranges over stored data (rank-only, recompute) cover the dates that hold
/// snapshots; acquiring modes cover every trading day.
async fn build_plan(
    args: &Args,
    calendar: &MarketCalendar,
    store: &dyn RankStore,
) -> anyhow::Result<DatePlan> {
    let now = chrono::Utc::now();

    let Some(from) = args.from.as_deref() else {
        let as_of_date = resolve_as_of_date(calendar, args.as_of_date.as_deref(), now)?;
        return Ok(DatePlan::single(as_of_date));
    };

    let from = parse_date(from)?;
    let to = resolve_as_of_date(calendar, args.to.as_deref(), now)?;
    anyhow::ensure!(from <= to, "--from {from} is after --to {to}");

    if acquires(args.mode) {
        return Ok(DatePlan::new(calendar.trading_days(from, to)));
    }
    let dates = store
        .snapshot_dates(from, to)
        .await
        .context("load snapshot dates failed")?;
    Ok(DatePlan::new(dates))
}

fn init_sentry(settings: &revrank_core::config::Settings) -> Option<sentry::ClientInitGuard> {
    let dsn = settings.sentry_dsn.as_deref()?;
    Some(sentry::init((
        dsn,
        sentry::ClientOptions {
            release: sentry::release_name!(),
            ..Default::default()
        },
    )))
}
