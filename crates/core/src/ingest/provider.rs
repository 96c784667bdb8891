use crate::config::Settings;
use crate::domain::snapshot::TickerSnapshot;
use crate::ingest::types::TickerSnapshotResponse;
use crate::ranking::error::RankingError;
use anyhow::{Context, Result};
use chrono::NaiveDate;
use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_PATH: &str = "/v1/ticker_snapshot";
const DEFAULT_RETRIES: u32 = 3;
pub const DEFAULT_FETCH_CONCURRENCY: usize = 10;

#[async_trait::async_trait]
pub trait DataProviderClient: Send + Sync {
    fn provider_name(&self) -> &'static str;

    async fn fetch_ticker_snapshot(
        &self,
        ticker: &str,
        as_of_date: NaiveDate,
    ) -> Result<TickerSnapshot>;
}

#[derive(Debug, Clone)]
pub struct HttpJsonDataProvider {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    path: String,
    retries: u32,
}

impl HttpJsonDataProvider {
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let base_url = settings.require_data_provider_base_url()?.to_string();
        let api_key = settings.data_provider_api_key.clone();

        let timeout_secs = std::env::var("DATA_PROVIDER_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(DEFAULT_TIMEOUT_SECS);

        let retries = std::env::var("DATA_PROVIDER_RETRIES")
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(DEFAULT_RETRIES)
            .max(1);

        let path = std::env::var("DATA_PROVIDER_SNAPSHOT_PATH")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_PATH.to_string());

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .context("failed to build data provider http client")?;

        Ok(Self {
            http,
            base_url,
            api_key,
            path,
            retries,
        })
    }

    fn url(&self) -> String {
        let path = if self.path.starts_with('/') {
            self.path.clone()
        } else {
            format!("/{}", self.path)
        };

        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        if let Some(api_key) = &self.api_key {
            headers.insert("x-api-key", HeaderValue::from_str(api_key)?);
        }
        Ok(headers)
    }

    async fn fetch_once(&self, ticker: &str, as_of_date: NaiveDate) -> Result<TickerSnapshotResponse> {
        let res = self
            .http
            .get(self.url())
            .headers(self.headers()?)
            .query(&[("ticker", ticker.to_string()), ("as_of_date", as_of_date.to_string())])
            .send()
            .await
            .context("data provider request failed")?;

        let status = res.status();
        let text = res
            .text()
            .await
            .context("failed to read provider response")?;
        let raw_json = serde_json::from_str::<Value>(&text)
            .with_context(|| format!("provider response is not valid JSON: {text}"))?;

        if !status.is_success() {
            anyhow::bail!("data provider HTTP {status}: {raw_json}");
        }

        serde_json::from_value::<TickerSnapshotResponse>(raw_json)
            .context("failed to parse provider response into TickerSnapshotResponse")
    }
}

fn validate(resp: &TickerSnapshotResponse, ticker: &str, expected: NaiveDate) -> Result<()> {
    anyhow::ensure!(
        resp.as_of_date == expected,
        "provider as_of_date mismatch: expected {expected}, got {}",
        resp.as_of_date
    );
    anyhow::ensure!(
        resp.ticker.trim().eq_ignore_ascii_case(ticker.trim()),
        "provider ticker mismatch: expected {ticker}, got {}",
        resp.ticker
    );
    Ok(())
}

#[async_trait::async_trait]
impl DataProviderClient for HttpJsonDataProvider {
    fn provider_name(&self) -> &'static str {
        "external_http_json"
    }

    async fn fetch_ticker_snapshot(
        &self,
        ticker: &str,
        as_of_date: NaiveDate,
    ) -> Result<TickerSnapshot> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.fetch_once(ticker, as_of_date).await {
                Ok(parsed) => {
                    validate(&parsed, ticker, as_of_date)?;
                    return Ok(parsed.into_snapshot());
                }
                Err(err) => {
                    if attempt >= self.retries {
                        return Err(err);
                    }
                    let backoff = backoff_delay(attempt);
                    tracing::warn!(attempt, ticker, ?backoff, error = %err, "data provider fetch failed; retrying");
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }
}

/// Exponential backoff after the given failed attempt, capped at 64s.
fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_secs(1u64 << attempt.saturating_sub(1).min(6))
}

#[derive(Debug, Default)]
pub struct Acquired {
    pub snapshots: Vec<TickerSnapshot>,
    pub failures: Vec<RankingError>,
}

/// Fetches every ticker with at most `concurrency` requests in flight. A
/// failed ticker is recorded and skipped; it never aborts the batch.
pub async fn acquire_universe(
    provider: Arc<dyn DataProviderClient>,
    tickers: &[String],
    as_of_date: NaiveDate,
    concurrency: usize,
) -> Acquired {
    let permits = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut join_set: JoinSet<(String, Result<TickerSnapshot>)> = JoinSet::new();

    for ticker in tickers {
        let provider = Arc::clone(&provider);
        let permits = Arc::clone(&permits);
        let ticker = ticker.clone();
        join_set.spawn(async move {
            let result = match permits.acquire_owned().await {
                Ok(_permit) => provider.fetch_ticker_snapshot(&ticker, as_of_date).await,
                Err(err) => Err(anyhow::Error::new(err)),
            };
            (ticker, result)
        });
    }

    let mut out = Acquired::default();
    let mut pending: BTreeSet<&str> = tickers.iter().map(String::as_str).collect();
    let mut logged_failures: usize = 0;
    while let Some(joined) = join_set.join_next().await {
        let (ticker, result) = match joined {
            Ok(pair) => pair,
            Err(join_error) => {
                tracing::error!(%as_of_date, error = %join_error, "fetch task panicked");
                continue;
            }
        };
        pending.remove(ticker.as_str());
        match result {
            Ok(snapshot) => out.snapshots.push(snapshot),
            Err(err) => {
                if logged_failures < 10 {
                    tracing::warn!(%as_of_date, ticker = %ticker, error = %err, "snapshot fetch failed; skipping ticker");
                    logged_failures += 1;
                }
                out.failures
                    .push(RankingError::insufficient(&ticker, format!("{err:#}")));
            }
        }
    }

    // Tasks that panicked never reported back.
    for ticker in pending {
        out.failures
            .push(RankingError::insufficient(ticker, "fetch task aborted"));
    }

    out.snapshots.sort_by(|a, b| a.ticker.cmp(&b.ticker));
    tracing::info!(
        %as_of_date,
        requested = tickers.len(),
        fetched = out.snapshots.len(),
        failures = out.failures.len(),
        "universe acquisition finished"
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn parses_snapshot_with_close_series() {
        let as_of = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();
        let closes: Vec<f64> = (1..=130).map(|v| v as f64).collect();
        let v = json!({
            "ticker": "NVDA",
            "as_of_date": as_of,
            "eps": {"current": 2.2, "d7": 2.0, "d30": 1.9, "d60": 1.8, "d90": null},
            "closes": closes,
            "fundamentals": {"revenue_growth": 0.4, "analyst_count": 40, "industry": "Semiconductors"},
            "gap": -3.5
        });

        let parsed: TickerSnapshotResponse = serde_json::from_value(v).unwrap();
        validate(&parsed, "nvda", as_of).unwrap();
        let snap = parsed.into_snapshot();
        assert_eq!(snap.price.price, Some(130.0));
        assert_eq!(snap.price.ma120, Some(70.5));
        assert_eq!(snap.estimates.d90, None);
        assert_eq!(snap.fundamentals.analyst_count, Some(40));
        assert_eq!(snap.fundamentals.gross_margin, None);
    }

    #[test]
    fn rejects_mismatched_date() {
        let as_of = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();
        let v = json!({"ticker": "AAPL", "as_of_date": "2026-03-01"});
        let parsed: TickerSnapshotResponse = serde_json::from_value(v).unwrap();
        assert!(validate(&parsed, "AAPL", as_of).is_err());
    }

    struct FlakyProvider {
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl DataProviderClient for FlakyProvider {
        fn provider_name(&self) -> &'static str {
            "flaky"
        }

        async fn fetch_ticker_snapshot(
            &self,
            ticker: &str,
            _as_of_date: NaiveDate,
        ) -> Result<TickerSnapshot> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if ticker.starts_with("BAD") {
                anyhow::bail!("upstream 404");
            }
            Ok(TickerSnapshot {
                ticker: ticker.to_string(),
                ..Default::default()
            })
        }
    }

    #[tokio::test]
    async fn failures_are_isolated_and_concurrency_bounded() {
        let provider = Arc::new(FlakyProvider {
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        });
        let tickers: Vec<String> = (0..25)
            .map(|i| if i % 5 == 0 { format!("BAD{i}") } else { format!("OK{i:02}") })
            .collect();
        let as_of = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();

        let out = acquire_universe(provider.clone(), &tickers, as_of, 3).await;
        assert_eq!(out.snapshots.len(), 20);
        assert_eq!(out.failures.len(), 5);
        assert!(provider.max_in_flight.load(Ordering::SeqCst) <= 3);
        assert!(out.snapshots.windows(2).all(|w| w[0].ticker < w[1].ticker));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff_delay(1), Duration::from_secs(1));
        assert_eq!(backoff_delay(3), Duration::from_secs(4));
        assert_eq!(backoff_delay(7), Duration::from_secs(64));
        assert_eq!(backoff_delay(100), Duration::from_secs(64));
        assert_eq!(backoff_delay(0), Duration::from_secs(1));
    }

    struct PanickingProvider;

    #[async_trait::async_trait]
    impl DataProviderClient for PanickingProvider {
        fn provider_name(&self) -> &'static str {
            "panicking"
        }

        async fn fetch_ticker_snapshot(
            &self,
            ticker: &str,
            _as_of_date: NaiveDate,
        ) -> Result<TickerSnapshot> {
            if ticker == "BOOM" {
                panic!("decoder bug");
            }
            Ok(TickerSnapshot {
                ticker: ticker.to_string(),
                ..Default::default()
            })
        }
    }

    #[tokio::test]
    async fn panicked_fetch_is_counted_as_a_failure() {
        let tickers: Vec<String> = ["AAA", "BOOM", "CCC"].iter().map(|t| t.to_string()).collect();
        let as_of = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();

        let out = acquire_universe(Arc::new(PanickingProvider), &tickers, as_of, 2).await;
        assert_eq!(out.snapshots.len(), 2);
        assert_eq!(
            out.failures,
            vec![RankingError::insufficient("BOOM", "fetch task aborted")]
        );
    }
}
