//! Per-date orchestration: acquire, score, rank, smooth, classify, persist.
//!
//! Dates are processed strictly in ascending order because smoothing date T
//! reads the persisted composite ranks of the dates before it.

use crate::domain::records::ScoreRecord;
use crate::domain::shortlist::Shortlist;
use crate::domain::snapshot::TickerSnapshot;
use crate::ingest::provider::{acquire_universe, DataProviderClient, DEFAULT_FETCH_CONCURRENCY};
use crate::notify::{publish_all, ShortlistSink};
use crate::ranking::eligibility::EligibilityFilter;
use crate::ranking::error::RankingError;
use crate::ranking::pipeline::{join_scores, rank_date, score_universe, ScoredUniverse};
use crate::ranking::smoother::{smooth, SmoothedRanking, REFERENCE_DATES};
use crate::ranking::status::{build_shortlist, STATUS_WINDOW};
use crate::ranking::RankingConfig;
use crate::storage::{RankStore, RunRecord};
use anyhow::Context;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

const MAX_LOGGED_SKIPS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    ScoreOnly,
    RankOnly,
    Full,
    /// Clears derived data for the whole plan, then re-derives it from
    /// persisted snapshots.
    Recompute,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::ScoreOnly => "score_only",
            Mode::RankOnly => "rank_only",
            Mode::Full => "full",
            Mode::Recompute => "recompute",
        }
    }

    fn scores(&self) -> bool {
        !matches!(self, Mode::RankOnly)
    }

    fn ranks(&self) -> bool {
        !matches!(self, Mode::ScoreOnly)
    }

    fn acquires(&self) -> bool {
        matches!(self, Mode::ScoreOnly | Mode::Full)
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "score_only" | "score" => Ok(Mode::ScoreOnly),
            "rank_only" | "rank" => Ok(Mode::RankOnly),
            "full" => Ok(Mode::Full),
            "recompute" => Ok(Mode::Recompute),
            other => anyhow::bail!("unknown mode: {other}"),
        }
    }
}

/// Dates to process, ascending and without duplicates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DatePlan {
    dates: Vec<NaiveDate>,
}

impl DatePlan {
    pub fn new(mut dates: Vec<NaiveDate>) -> Self {
        dates.sort_unstable();
        dates.dedup();
        Self { dates }
    }

    pub fn single(date: NaiveDate) -> Self {
        Self { dates: vec![date] }
    }

    pub fn dates(&self) -> &[NaiveDate] {
        &self.dates
    }

    pub fn first(&self) -> Option<NaiveDate> {
        self.dates.first().copied()
    }

    pub fn last(&self) -> Option<NaiveDate> {
        self.dates.last().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DateReport {
    pub as_of_date: NaiveDate,
    pub universe: usize,
    pub scored: usize,
    pub skipped: usize,
    pub eligible: usize,
    pub ranked: usize,
    pub shortlisted: usize,
    pub cold_start: bool,
    pub dependency_missing: bool,
    pub error: Option<String>,
}

impl DateReport {
    fn new(as_of_date: NaiveDate) -> Self {
        Self {
            as_of_date,
            universe: 0,
            scored: 0,
            skipped: 0,
            eligible: 0,
            ranked: 0,
            shortlisted: 0,
            cold_start: false,
            dependency_missing: false,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: uuid::Uuid,
    pub mode: Mode,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub reports: Vec<DateReport>,
}

impl RunSummary {
    pub fn failed_dates(&self) -> usize {
        self.reports.iter().filter(|r| r.error.is_some()).count()
    }

    /// True when no requested date produced anything: no eligible ticker when
    /// ranking, no scored ticker when only scoring.
    pub fn all_empty(&self) -> bool {
        self.reports.iter().all(|r| match self.mode {
            Mode::ScoreOnly => r.scored == 0,
            _ => r.eligible == 0,
        })
    }

    /// 0 on success, 1 when every date came out empty, 2 when any date failed.
    pub fn exit_code(&self) -> i32 {
        if self.failed_dates() > 0 {
            2
        } else if self.all_empty() {
            1
        } else {
            0
        }
    }

    fn status(&self) -> &'static str {
        match self.exit_code() {
            0 => "succeeded",
            1 => "empty",
            _ => "failed",
        }
    }
}

pub struct Engine {
    store: Arc<dyn RankStore>,
    cfg: RankingConfig,
    provider: Option<Arc<dyn DataProviderClient>>,
    tickers: Vec<String>,
    fetch_concurrency: usize,
    sinks: Vec<Box<dyn ShortlistSink>>,
    last_smoothed: Option<NaiveDate>,
    /// First date that failed to rank; later dates are refused until reset.
    failed_from: Option<NaiveDate>,
    /// Dates of the current run; their stored ranks are re-derived in order.
    planned: BTreeSet<NaiveDate>,
}

impl Engine {
    pub fn new(store: Arc<dyn RankStore>, cfg: RankingConfig) -> Self {
        Self {
            store,
            cfg,
            provider: None,
            tickers: Vec::new(),
            fetch_concurrency: DEFAULT_FETCH_CONCURRENCY,
            sinks: Vec::new(),
            last_smoothed: None,
            failed_from: None,
            planned: BTreeSet::new(),
        }
    }

    /// Without a provider, scoring modes read snapshots already in the store.
    pub fn with_provider(
        mut self,
        provider: Arc<dyn DataProviderClient>,
        tickers: Vec<String>,
        fetch_concurrency: usize,
    ) -> Self {
        self.provider = Some(provider);
        self.tickers = tickers;
        self.tickers.sort();
        self.tickers.dedup();
        self.fetch_concurrency = fetch_concurrency.max(1);
        self
    }

    pub fn with_sink(mut self, sink: Box<dyn ShortlistSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub async fn run(&mut self, mode: Mode, plan: &DatePlan) -> anyhow::Result<RunSummary> {
        let run_id = uuid::Uuid::new_v4();
        let started_at = Utc::now();
        self.last_smoothed = None;
        self.failed_from = None;
        self.planned = plan.dates().iter().copied().collect();

        tracing::info!(%run_id, %mode, dates = plan.dates().len(), "ranking run started");

        if let (Mode::Recompute, Some(from), Some(to)) = (mode, plan.first(), plan.last()) {
            // Clearing under a stale successor would orphan its part2 ranks;
            // the first date is rejected below instead.
            match self.ranked_successor(from).await? {
                Some(later) => tracing::warn!(
                    %from,
                    %to,
                    %later,
                    "ranked dates after the plan; derived data left in place"
                ),
                None => {
                    let cleared = self
                        .store
                        .clear_derived(from, to)
                        .await
                        .context("clear derived data failed")?;
                    tracing::info!(%from, %to, cleared, "cleared scores and ranks before recompute");
                }
            }
        }

        let mut reports = Vec::with_capacity(plan.dates().len());
        for as_of_date in plan.dates() {
            reports.push(self.process_date(mode, *as_of_date).await);
        }
        self.planned.clear();

        let summary = RunSummary {
            run_id,
            mode,
            started_at,
            finished_at: Utc::now(),
            reports,
        };

        if let (Some(from_date), Some(to_date)) = (plan.first(), plan.last()) {
            let record = RunRecord {
                id: run_id,
                mode: mode.as_str().to_string(),
                from_date,
                to_date,
                started_at: summary.started_at,
                finished_at: summary.finished_at,
                status: summary.status().to_string(),
                summary: serde_json::to_value(&summary.reports)
                    .context("serialize run reports failed")?,
            };
            self.store
                .record_run(&record)
                .await
                .context("record ranking run failed")?;
        }

        tracing::info!(
            %run_id,
            %mode,
            dates = summary.reports.len(),
            failed = summary.failed_dates(),
            eligible_total = summary.reports.iter().map(|r| r.eligible).sum::<usize>(),
            exit_code = summary.exit_code(),
            "ranking run finished"
        );

        Ok(summary)
    }

    /// Processes one date under the store's per-date lock. Failures are
    /// captured in the report. Once a ranking date fails, every later date
    /// is refused rather than smoothed against incomplete history.
    pub async fn process_date(&mut self, mode: Mode, as_of_date: NaiveDate) -> DateReport {
        let report = self.process_date_inner(mode, as_of_date).await;
        if mode.ranks() && report.error.is_some() && self.failed_from.is_none() {
            self.failed_from = Some(as_of_date);
        }
        report
    }

    async fn process_date_inner(&mut self, mode: Mode, as_of_date: NaiveDate) -> DateReport {
        let started = Instant::now();
        let mut report = DateReport::new(as_of_date);

        if mode.ranks() {
            let rejected = match (self.failed_from, self.last_smoothed) {
                (Some(failed), _) if failed < as_of_date => {
                    Some(RankingError::UpstreamFailed { as_of_date, failed })
                }
                (_, Some(last)) if as_of_date <= last => {
                    Some(RankingError::OutOfOrder { as_of_date, last })
                }
                _ => None,
            };
            if let Some(err) = rejected {
                tracing::error!(%as_of_date, "date rejected: {err}");
                report.error = Some(err.to_string());
                return report;
            }
        }

        match self.store.try_lock_date(as_of_date).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(%as_of_date, "date lock not acquired; another run in progress");
                report.error = Some("date locked by another run".to_string());
                return report;
            }
            Err(err) => {
                tracing::error!(%as_of_date, error = %err, "date lock failed");
                report.error = Some(format!("{err:#}"));
                return report;
            }
        }

        let outcome = self.process_locked(mode, as_of_date, &mut report).await;

        if let Err(err) = self.store.release_date(as_of_date).await {
            tracing::warn!(%as_of_date, error = %err, "date lock release failed");
        }

        match outcome {
            Ok(()) => tracing::info!(
                %as_of_date,
                %mode,
                universe = report.universe,
                scored = report.scored,
                skipped = report.skipped,
                eligible = report.eligible,
                ranked = report.ranked,
                shortlisted = report.shortlisted,
                cold_start = report.cold_start,
                dependency_missing = report.dependency_missing,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "date processed"
            ),
            Err(err) => {
                tracing::error!(%as_of_date, %mode, error = %format!("{err:#}"), "date failed");
                report.error = Some(format!("{err:#}"));
            }
        }

        report
    }

    async fn process_locked(
        &mut self,
        mode: Mode,
        as_of_date: NaiveDate,
        report: &mut DateReport,
    ) -> anyhow::Result<()> {
        // Every mode rewrites this date's scores or ranks, which later
        // dates were smoothed from.
        if let Some(last) = self.ranked_successor(as_of_date).await? {
            return Err(RankingError::OutOfOrder { as_of_date, last }.into());
        }

        let snapshots = self.snapshots_for(mode, as_of_date, report).await?;
        report.universe += snapshots.len();

        if !mode.ranks() {
            let cleared = self
                .store
                .clear_ranks(as_of_date)
                .await
                .context("clear ranks failed")?;
            if cleared > 0 {
                tracing::info!(%as_of_date, cleared, "ranks cleared; date needs re-ranking");
            }
        }

        let universe = if mode.scores() {
            let scored = score_universe(&snapshots, &self.cfg);
            let records: BTreeMap<String, ScoreRecord> = scored
                .scored
                .iter()
                .map(|t| (t.ticker().to_string(), t.score))
                .collect();
            self.store
                .replace_scores(as_of_date, &records)
                .await
                .context("persist scores failed")?;
            scored
        } else {
            let scores = self
                .store
                .load_scores(as_of_date)
                .await
                .context("load scores failed")?;
            join_scores(&snapshots, &scores)
        };

        report.scored = universe.scored.len();
        report.skipped += universe.skipped.len();
        log_skips(as_of_date, &universe.skipped);

        if !mode.ranks() {
            return Ok(());
        }

        let shortlist = self.rank_and_smooth(as_of_date, &universe, report).await?;
        self.last_smoothed = Some(as_of_date);

        let failed = publish_all(&self.sinks, &shortlist).await;
        if failed > 0 {
            tracing::warn!(%as_of_date, failed, "some shortlist sinks failed");
        }
        Ok(())
    }

    async fn snapshots_for(
        &self,
        mode: Mode,
        as_of_date: NaiveDate,
        report: &mut DateReport,
    ) -> anyhow::Result<Vec<TickerSnapshot>> {
        let provider = match (&self.provider, mode.acquires()) {
            (Some(provider), true) => Arc::clone(provider),
            _ => {
                return self
                    .store
                    .load_snapshots(as_of_date)
                    .await
                    .context("load snapshots failed")
            }
        };

        let acquired =
            acquire_universe(provider, &self.tickers, as_of_date, self.fetch_concurrency).await;
        report.universe += acquired.failures.len();
        report.skipped += acquired.failures.len();

        anyhow::ensure!(
            !acquired.snapshots.is_empty() || self.tickers.is_empty(),
            "no snapshot fetched for {as_of_date}; stored snapshots kept"
        );

        self.store
            .replace_snapshots(as_of_date, &acquired.snapshots)
            .await
            .context("persist snapshots failed")?;
        Ok(acquired.snapshots)
    }

    /// Latest date after `as_of_date` with composite ranks that the current
    /// run will not re-derive.
    async fn ranked_successor(&self, as_of_date: NaiveDate) -> anyhow::Result<Option<NaiveDate>> {
        let later = self
            .store
            .ranked_dates_after(as_of_date)
            .await
            .context("load ranked dates failed")?;
        Ok(later
            .into_iter()
            .filter(|d| !self.planned.contains(d))
            .max())
    }

    async fn rank_and_smooth(
        &self,
        as_of_date: NaiveDate,
        universe: &ScoredUniverse,
        report: &mut DateReport,
    ) -> anyhow::Result<Shortlist> {
        let cfg = &self.cfg;
        let ranking = rank_date(as_of_date, &universe.scored, cfg);
        report.eligible = ranking.eligible.len();
        report.ranked = ranking.composite.len();
        for diag in &ranking.composite.diagnostics {
            tracing::info!(%as_of_date, "{diag}");
        }

        self.store
            .replace_composite_ranks(as_of_date, &ranking.composite.ranks())
            .await
            .context("persist composite ranks failed")?;

        // Smoothing reads back from the store so it sees exactly what later
        // dates will see.
        let smoothed = if ranking.composite.is_empty() {
            tracing::warn!(%as_of_date, "no ranked tickers; smoothing skipped");
            SmoothedRanking {
                as_of_date,
                entries: Vec::new(),
                reference_dates: Vec::new(),
                diagnostics: Vec::new(),
            }
        } else {
            let today = self
                .store
                .load_composite_ranks(as_of_date)
                .await
                .context("load composite ranks failed")?;
            let history = self
                .store
                .composite_history(as_of_date, REFERENCE_DATES)
                .await
                .context("load composite history failed")?;
            smooth(&today, &history, cfg)?
        };

        report.dependency_missing = smoothed
            .diagnostics
            .iter()
            .any(|d| matches!(d, RankingError::DependencyMissing { .. }));
        for diag in &smoothed.diagnostics {
            tracing::info!(%as_of_date, reference_dates = ?smoothed.reference_dates, "{diag}");
        }

        self.store
            .replace_part2_ranks(as_of_date, &smoothed.part2_ranks())
            .await
            .context("persist part2 ranks failed")?;

        let previous = self
            .store
            .part2_history(as_of_date, STATUS_WINDOW - 1)
            .await
            .context("load part2 history failed")?;
        let filter = EligibilityFilter::for_universe(cfg, &universe.scored);
        let shortlist = build_shortlist(&smoothed, &previous, &universe.scored, &filter);

        report.shortlisted = shortlist.entries.len();
        report.cold_start = shortlist.cold_start;

        self.store
            .replace_shortlist(&shortlist)
            .await
            .context("persist shortlist failed")?;
        Ok(shortlist)
    }
}

fn log_skips(as_of_date: NaiveDate, skipped: &[RankingError]) {
    for err in skipped.iter().take(MAX_LOGGED_SKIPS) {
        tracing::debug!(%as_of_date, "ticker skipped: {err}");
    }
    if skipped.len() > MAX_LOGGED_SKIPS {
        tracing::debug!(
            %as_of_date,
            more = skipped.len() - MAX_LOGGED_SKIPS,
            "further skipped tickers not logged"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::shortlist::{DropReason, Status};
    use crate::domain::snapshot::{EstimateSnapshot, FundamentalsSnapshot, PriceSnapshot};
    use crate::storage::MemoryRankStore;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, day).unwrap()
    }

    fn snap(ticker: &str, gap: f64, revenue_growth: f64) -> TickerSnapshot {
        TickerSnapshot {
            ticker: ticker.to_string(),
            estimates: EstimateSnapshot {
                current: Some(2.2),
                d7: Some(2.0),
                d30: Some(1.9),
                d60: Some(1.8),
                d90: Some(1.7),
            },
            price: PriceSnapshot {
                price: Some(50.0),
                ma60: Some(45.0),
                ma120: Some(40.0),
            },
            fundamentals: FundamentalsSnapshot {
                revenue_growth: Some(revenue_growth),
                analyst_count: Some(12),
                revisions_up_30d: Some(8),
                revisions_down_30d: Some(1),
                operating_margin: Some(0.25),
                gross_margin: Some(0.55),
                industry: Some("Software".to_string()),
            },
            gap: Some(gap),
        }
    }

    /// 40 tickers whose gaps rotate with the day so ranks differ per date.
    fn day_snapshots(day: u32) -> Vec<TickerSnapshot> {
        (0..40)
            .map(|i| {
                let gap = ((i * 7 + day as usize * 11) % 40) as f64 - 20.0;
                snap(&format!("T{i:02}"), gap, 0.12 + (i % 9) as f64 / 50.0)
            })
            .collect()
    }

    async fn seeded_store(days: &[u32]) -> Arc<MemoryRankStore> {
        let store = Arc::new(MemoryRankStore::new());
        for day in days {
            store
                .replace_snapshots(d(*day), &day_snapshots(*day))
                .await
                .unwrap();
        }
        store
    }

    fn engine(store: &Arc<MemoryRankStore>) -> Engine {
        Engine::new(store.clone() as Arc<dyn RankStore>, RankingConfig::default())
    }

    async fn stored_ranks(
        store: &MemoryRankStore,
        days: &[u32],
    ) -> Vec<(BTreeMap<String, u32>, BTreeMap<String, u32>)> {
        let mut out = Vec::new();
        for day in days {
            let composite = store.load_composite_ranks(d(*day)).await.unwrap().ranks;
            let part2 = store.load_part2_ranks(d(*day)).await.unwrap().ranks;
            out.push((composite, part2));
        }
        out
    }

    #[test]
    fn plan_is_sorted_and_deduplicated() {
        let plan = DatePlan::new(vec![d(5), d(3), d(5), d(4)]);
        assert_eq!(plan.dates(), &[d(3), d(4), d(5)]);
        assert_eq!(plan.first(), Some(d(3)));
        assert_eq!(plan.last(), Some(d(5)));
    }

    #[test]
    fn parses_modes() {
        assert_eq!("score-only".parse::<Mode>().unwrap(), Mode::ScoreOnly);
        assert_eq!("RANK_ONLY".parse::<Mode>().unwrap(), Mode::RankOnly);
        assert_eq!("recompute".parse::<Mode>().unwrap(), Mode::Recompute);
        assert!("backtest".parse::<Mode>().is_err());
    }

    #[tokio::test]
    async fn full_run_persists_dense_ranks_and_shortlist() {
        let days = [2, 3, 4];
        let store = seeded_store(&days).await;
        let plan = DatePlan::new(days.iter().map(|x| d(*x)).collect());

        let summary = engine(&store).run(Mode::Full, &plan).await.unwrap();
        assert_eq!(summary.exit_code(), 0);
        assert_eq!(summary.reports.len(), 3);

        let first = &summary.reports[0];
        assert_eq!(first.universe, 40);
        assert_eq!(first.eligible, 40);
        assert_eq!(first.ranked, 40);
        assert_eq!(first.shortlisted, 30);
        assert!(first.cold_start);
        assert!(first.dependency_missing);

        let last = &summary.reports[2];
        assert!(!last.cold_start);
        assert!(!last.dependency_missing);

        for (composite, part2) in stored_ranks(&store, &days).await {
            let mut values: Vec<u32> = composite.values().copied().collect();
            values.sort_unstable();
            assert_eq!(values, (1..=40).collect::<Vec<u32>>());
            assert_eq!(part2.len(), 30);
            assert!(part2.keys().all(|t| composite.contains_key(t)));
        }

        let shortlist = store.load_shortlist(None).await.unwrap().unwrap();
        assert_eq!(shortlist.as_of_date, d(4));
        assert!(!shortlist.cold_start);
        let part2_d2 = store.load_part2_ranks(d(2)).await.unwrap().ranks;
        let part2_d3 = store.load_part2_ranks(d(3)).await.unwrap().ranks;
        for e in &shortlist.entries {
            let expected = match (part2_d2.contains_key(&e.ticker), part2_d3.contains_key(&e.ticker)) {
                (true, true) => Status::Verified,
                (false, false) => Status::New,
                _ => Status::Probation,
            };
            assert_eq!(e.status, expected, "{}", e.ticker);
        }

        let runs = store.runs().await;
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, "succeeded");
        assert_eq!(runs[0].from_date, d(2));
        assert_eq!(runs[0].to_date, d(4));
    }

    #[tokio::test]
    async fn recompute_twice_is_idempotent() {
        let days = [2, 3, 4, 5];
        let store = seeded_store(&days).await;
        let plan = DatePlan::new(days.iter().map(|x| d(*x)).collect());

        engine(&store).run(Mode::Recompute, &plan).await.unwrap();
        let first = stored_ranks(&store, &days).await;
        let first_shortlist = store.load_shortlist(Some(d(5))).await.unwrap();

        engine(&store).run(Mode::Recompute, &plan).await.unwrap();
        let second = stored_ranks(&store, &days).await;
        let second_shortlist = store.load_shortlist(Some(d(5))).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first_shortlist, second_shortlist);
    }

    #[tokio::test]
    async fn prior_part2_ranks_do_not_cascade() {
        let days = [2, 3, 4];
        let store = seeded_store(&days).await;
        let plan = DatePlan::new(days.iter().map(|x| d(*x)).collect());
        engine(&store).run(Mode::Full, &plan).await.unwrap();
        let before = store.load_part2_ranks(d(4)).await.unwrap();

        // Scramble T-1's part2 ranks without touching its composite ranks.
        let scrambled: BTreeMap<String, u32> = before
            .ranks
            .keys()
            .rev()
            .enumerate()
            .map(|(i, t)| (t.clone(), i as u32 + 1))
            .collect();
        store.replace_part2_ranks(d(3), &scrambled).await.unwrap();

        let report = engine(&store).process_date(Mode::RankOnly, d(4)).await;
        assert!(report.error.is_none());
        assert_eq!(store.load_part2_ranks(d(4)).await.unwrap(), before);
    }

    #[tokio::test]
    async fn rejects_dates_behind_the_watermark() {
        let store = seeded_store(&[2, 3]).await;
        let mut engine = engine(&store);

        assert!(engine.process_date(Mode::Full, d(3)).await.error.is_none());
        let report = engine.process_date(Mode::Full, d(2)).await;
        let error = report.error.unwrap();
        assert!(error.contains("out of order"), "{error}");

        // Rescoring d2 would invalidate ranks d3 was smoothed from.
        let error = engine.process_date(Mode::ScoreOnly, d(2)).await.error.unwrap();
        assert!(error.contains("last smoothed 2026-03-03"), "{error}");
    }

    #[tokio::test]
    async fn locked_date_is_skipped_and_reported() {
        let store = seeded_store(&[2]).await;
        assert!(store.try_lock_date(d(2)).await.unwrap());

        let summary = engine(&store)
            .run(Mode::Full, &DatePlan::single(d(2)))
            .await
            .unwrap();
        assert_eq!(summary.failed_dates(), 1);
        assert_eq!(summary.exit_code(), 2);
        assert!(store.load_scores(d(2)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_dates_exit_nonzero() {
        let store = Arc::new(MemoryRankStore::new());
        let summary = engine(&store)
            .run(Mode::Full, &DatePlan::new(vec![d(2), d(3)]))
            .await
            .unwrap();
        assert!(summary.all_empty());
        assert_eq!(summary.exit_code(), 1);
        assert_eq!(store.runs().await[0].status, "empty");
    }

    #[tokio::test]
    async fn emptied_date_reports_prior_members_as_dropped() {
        let store = seeded_store(&[2]).await;
        let mut weak = day_snapshots(3);
        for s in &mut weak {
            s.price.price = Some(5.0);
        }
        store.replace_snapshots(d(3), &weak).await.unwrap();

        let plan = DatePlan::new(vec![d(2), d(3)]);
        let summary = engine(&store).run(Mode::Full, &plan).await.unwrap();
        assert_eq!(summary.reports[1].eligible, 0);
        assert!(summary.reports[1].error.is_none());

        let shortlist = store.load_shortlist(Some(d(3))).await.unwrap().unwrap();
        assert!(shortlist.entries.is_empty());
        assert_eq!(shortlist.dropped.len(), 30);
        assert!(shortlist
            .dropped
            .iter()
            .all(|e| e.reason == DropReason::PriceBelowFloor));
    }

    struct StaticProvider;

    #[async_trait::async_trait]
    impl DataProviderClient for StaticProvider {
        fn provider_name(&self) -> &'static str {
            "static"
        }

        async fn fetch_ticker_snapshot(
            &self,
            ticker: &str,
            _as_of_date: NaiveDate,
        ) -> anyhow::Result<TickerSnapshot> {
            if ticker == "MISSING" {
                anyhow::bail!("no coverage");
            }
            Ok(snap(ticker, -1.0, 0.2))
        }
    }

    #[tokio::test]
    async fn score_only_acquires_and_persists() {
        let store = Arc::new(MemoryRankStore::new());
        let tickers = vec!["AAA".to_string(), "MISSING".to_string(), "BBB".to_string()];
        let mut engine = engine(&store).with_provider(Arc::new(StaticProvider), tickers, 2);

        let summary = engine
            .run(Mode::ScoreOnly, &DatePlan::single(d(2)))
            .await
            .unwrap();
        let report = &summary.reports[0];
        assert_eq!(report.universe, 3);
        assert_eq!(report.scored, 2);
        assert_eq!(report.skipped, 1);
        assert_eq!(summary.exit_code(), 0);

        assert_eq!(store.load_snapshots(d(2)).await.unwrap().len(), 2);
        assert_eq!(store.load_scores(d(2)).await.unwrap().len(), 2);
        assert!(store.load_composite_ranks(d(2)).await.unwrap().ranks.is_empty());
    }

    #[tokio::test]
    async fn failed_middle_date_blocks_later_dates() {
        let days = [2, 3, 4, 5];
        let store = seeded_store(&days).await;
        let plan = DatePlan::new(days.iter().map(|x| d(*x)).collect());
        engine(&store).run(Mode::Recompute, &plan).await.unwrap();

        assert!(store.try_lock_date(d(3)).await.unwrap());
        let summary = engine(&store).run(Mode::Recompute, &plan).await.unwrap();
        assert_eq!(summary.exit_code(), 2);
        assert!(summary.reports[0].error.is_none());
        assert_eq!(summary.reports[1].error.as_deref(), Some("date locked by another run"));
        for report in &summary.reports[2..] {
            let error = report.error.as_deref().unwrap();
            assert!(error.contains("earlier date 2026-03-03 failed"), "{error}");
        }

        for (composite, part2) in stored_ranks(&store, &[3, 4, 5]).await {
            assert!(composite.is_empty());
            assert!(part2.is_empty());
        }
        assert!(store.load_shortlist(Some(d(4))).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rerunning_an_older_date_is_rejected_while_later_dates_are_ranked() {
        let days = [2, 3, 4];
        let store = seeded_store(&days).await;
        let plan = DatePlan::new(days.iter().map(|x| d(*x)).collect());
        engine(&store).run(Mode::Full, &plan).await.unwrap();
        let before = stored_ranks(&store, &[3, 4]).await;

        store.replace_snapshots(d(3), &day_snapshots(9)).await.unwrap();
        let summary = engine(&store)
            .run(Mode::Full, &DatePlan::single(d(3)))
            .await
            .unwrap();
        let error = summary.reports[0].error.as_deref().unwrap();
        assert!(error.contains("last smoothed 2026-03-04"), "{error}");
        assert_eq!(summary.exit_code(), 2);
        assert_eq!(stored_ranks(&store, &[3, 4]).await, before);

        let rank_only = engine(&store).process_date(Mode::RankOnly, d(3)).await;
        assert!(rank_only.error.is_some());

        // Re-deriving through the latest ranked date is accepted.
        let tail = DatePlan::new(vec![d(3), d(4)]);
        let summary = engine(&store).run(Mode::Recompute, &tail).await.unwrap();
        assert_eq!(summary.exit_code(), 0);
        assert_ne!(stored_ranks(&store, &[3, 4]).await, before);
    }

    #[tokio::test]
    async fn score_only_clears_ranks_derived_from_old_scores() {
        let store = seeded_store(&[2]).await;
        let plan = DatePlan::single(d(2));
        engine(&store).run(Mode::Full, &plan).await.unwrap();
        assert!(store.load_shortlist(Some(d(2))).await.unwrap().is_some());

        let summary = engine(&store).run(Mode::ScoreOnly, &plan).await.unwrap();
        assert_eq!(summary.exit_code(), 0);
        assert_eq!(store.load_scores(d(2)).await.unwrap().len(), 40);
        assert!(store.load_composite_ranks(d(2)).await.unwrap().ranks.is_empty());
        assert!(store.load_part2_ranks(d(2)).await.unwrap().ranks.is_empty());
        assert!(store.load_shortlist(Some(d(2))).await.unwrap().is_none());
    }

    /// Serves a fixed universe; `flaky` only answers its first request.
    struct RefetchProvider {
        universe: BTreeMap<String, TickerSnapshot>,
        flaky: &'static str,
        flaky_calls: std::sync::atomic::AtomicUsize,
    }

    #[async_trait::async_trait]
    impl DataProviderClient for RefetchProvider {
        fn provider_name(&self) -> &'static str {
            "refetch"
        }

        async fn fetch_ticker_snapshot(
            &self,
            ticker: &str,
            _as_of_date: NaiveDate,
        ) -> anyhow::Result<TickerSnapshot> {
            use std::sync::atomic::Ordering;
            if ticker == self.flaky && self.flaky_calls.fetch_add(1, Ordering::SeqCst) > 0 {
                anyhow::bail!("upstream 503");
            }
            self.universe
                .get(ticker)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("unknown ticker {ticker}"))
        }
    }

    #[tokio::test]
    async fn ticker_missing_on_refetch_stays_out_of_later_recomputes() {
        let store = Arc::new(MemoryRankStore::new());
        let universe: BTreeMap<String, TickerSnapshot> = day_snapshots(2)
            .into_iter()
            .map(|s| (s.ticker.clone(), s))
            .collect();
        let tickers: Vec<String> = universe.keys().cloned().collect();
        let provider = Arc::new(RefetchProvider {
            universe,
            flaky: "T05",
            flaky_calls: std::sync::atomic::AtomicUsize::new(0),
        });
        let plan = DatePlan::single(d(2));

        let mut full = engine(&store).with_provider(provider, tickers, 4);
        full.run(Mode::Full, &plan).await.unwrap();
        assert!(store.load_composite_ranks(d(2)).await.unwrap().ranks.contains_key("T05"));

        let summary = full.run(Mode::Full, &plan).await.unwrap();
        assert_eq!(summary.reports[0].skipped, 1);
        let after_full = stored_ranks(&store, &[2]).await;
        assert!(!after_full[0].0.contains_key("T05"));

        engine(&store).run(Mode::Recompute, &plan).await.unwrap();
        assert!(store
            .load_snapshots(d(2))
            .await
            .unwrap()
            .iter()
            .all(|s| s.ticker != "T05"));
        assert_eq!(stored_ranks(&store, &[2]).await, after_full);
    }
}
