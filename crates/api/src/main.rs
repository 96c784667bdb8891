use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use chrono::NaiveDate;
use serde::Serialize;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use revrank_core::domain::shortlist::{DroppedEntry, Shortlist, ShortlistEntry};
use revrank_core::storage::{PgRankStore, RankStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let settings = revrank_core::config::Settings::from_env()?;
    let _sentry_guard = init_sentry(&settings);

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .with(sentry_tracing::layer())
        .init();
    let store = match connect_store(&settings).await {
        Ok(store) => Some(Arc::new(store)),
        Err(e) => {
            sentry_anyhow::capture_anyhow(&e);
            tracing::error!(error = %e, "store unavailable; starting API in degraded mode");
            None
        }
    };

    let state = AppState { store };

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/shortlists/latest", get(get_latest_shortlist))
        .route("/shortlists/:as_of_date", get(get_shortlist_by_date))
        .route(
            "/shortlists/:as_of_date/:ticker",
            get(get_ticker_by_date),
        )
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(3000);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));

    tracing::info!(%addr, "api listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn connect_store(settings: &revrank_core::config::Settings) -> anyhow::Result<PgRankStore> {
    let db_url = settings.require_database_url()?;
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(db_url)
        .await?;
    revrank_core::storage::migrate(&pool).await?;
    PgRankStore::new(pool)
}

async fn healthz() -> &'static str {
    "ok"
}

#[derive(Clone)]
struct AppState {
    store: Option<Arc<PgRankStore>>,
}

impl AppState {
    fn store(&self) -> Result<&PgRankStore, StatusCode> {
        self.store.as_deref().ok_or(StatusCode::SERVICE_UNAVAILABLE)
    }
}

/// One ticker's standing on a date: on the shortlist, dropped from it, or both absent (404).
#[derive(Debug, Serialize, PartialEq)]
struct TickerStanding {
    as_of_date: NaiveDate,
    cold_start: bool,
    entry: Option<ShortlistEntry>,
    dropped: Option<DroppedEntry>,
}

fn ticker_standing(shortlist: &Shortlist, ticker: &str) -> Option<TickerStanding> {
    let ticker = ticker.trim();
    let entry = shortlist
        .entries
        .iter()
        .find(|e| e.ticker.eq_ignore_ascii_case(ticker))
        .cloned();
    let dropped = shortlist
        .dropped
        .iter()
        .find(|d| d.ticker.eq_ignore_ascii_case(ticker))
        .cloned();

    if entry.is_none() && dropped.is_none() {
        return None;
    }
    Some(TickerStanding {
        as_of_date: shortlist.as_of_date,
        cold_start: shortlist.cold_start,
        entry,
        dropped,
    })
}

fn parse_date(s: &str) -> Result<NaiveDate, StatusCode> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|_| StatusCode::BAD_REQUEST)
}

async fn fetch_shortlist(
    store: &PgRankStore,
    as_of_date: Option<NaiveDate>,
) -> Result<Shortlist, StatusCode> {
    store
        .load_shortlist(as_of_date)
        .await
        .map_err(|e| {
            sentry_anyhow::capture_anyhow(&e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .ok_or(StatusCode::NOT_FOUND)
}

async fn get_latest_shortlist(
    State(state): State<AppState>,
) -> Result<Json<Shortlist>, StatusCode> {
    let shortlist = fetch_shortlist(state.store()?, None).await?;
    Ok(Json(shortlist))
}

async fn get_shortlist_by_date(
    State(state): State<AppState>,
    Path(as_of_date): Path<String>,
) -> Result<Json<Shortlist>, StatusCode> {
    let store = state.store()?;
    let as_of_date = parse_date(&as_of_date)?;
    let shortlist = fetch_shortlist(store, Some(as_of_date)).await?;
    Ok(Json(shortlist))
}

async fn get_ticker_by_date(
    State(state): State<AppState>,
    Path((as_of_date, ticker)): Path<(String, String)>,
) -> Result<Json<TickerStanding>, StatusCode> {
    let store = state.store()?;
    let as_of_date = parse_date(&as_of_date)?;
    let shortlist = fetch_shortlist(store, Some(as_of_date)).await?;

    ticker_standing(&shortlist, &ticker)
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
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

#[cfg(test)]
mod tests {
    use super::*;
    use revrank_core::domain::shortlist::{DropReason, FilterStage, Status};

    fn shortlist() -> Shortlist {
        Shortlist {
            as_of_date: NaiveDate::from_ymd_opt(2026, 3, 4).unwrap(),
            entries: vec![ShortlistEntry {
                ticker: "NVDA".to_string(),
                part2_rank: 1,
                weighted_rank: 1.3,
                composite_rank: 2,
                status: Status::Verified,
            }],
            dropped: vec![DroppedEntry {
                ticker: "XOM".to_string(),
                previous_part2_rank: 4,
                reason: DropReason::CommodityIndustry,
                failed_stages: vec![FilterStage::CommodityIndustry],
            }],
            cold_start: false,
        }
    }

    #[test]
    fn finds_listed_and_dropped_tickers() {
        let s = shortlist();
        let listed = ticker_standing(&s, "nvda").unwrap();
        assert_eq!(listed.entry.unwrap().part2_rank, 1);
        assert!(listed.dropped.is_none());

        let dropped = ticker_standing(&s, "XOM").unwrap();
        assert!(dropped.entry.is_none());
        assert_eq!(dropped.dropped.unwrap().reason, DropReason::CommodityIndustry);

        assert!(ticker_standing(&s, "AAPL").is_none());
    }

    #[test]
    fn rejects_malformed_dates() {
        assert_eq!(parse_date("2026-03-04").unwrap(), NaiveDate::from_ymd_opt(2026, 3, 4).unwrap());
        assert_eq!(parse_date("03/04/2026"), Err(StatusCode::BAD_REQUEST));
    }
}
