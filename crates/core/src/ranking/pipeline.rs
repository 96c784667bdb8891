//! Pure per-date stages shared by the daily run, range recomputes and any
//! offline replay: score the universe, filter it, rank it.

use crate::domain::records::ScoreRecord;
use crate::domain::snapshot::TickerSnapshot;
use crate::ranking::composite::{rank_composite, CompositeRanking};
use crate::ranking::config::RankingConfig;
use crate::ranking::eligibility::{EligibilityFilter, FunnelStep, ScoredTicker};
use crate::ranking::error::RankingError;
use crate::ranking::score::score_estimates;
use chrono::NaiveDate;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default)]
pub struct ScoredUniverse {
    /// Sorted by ticker.
    pub scored: Vec<ScoredTicker>,
    pub skipped: Vec<RankingError>,
}

pub fn score_universe(snapshots: &[TickerSnapshot], cfg: &RankingConfig) -> ScoredUniverse {
    let mut out = ScoredUniverse::default();
    for snap in snapshots {
        match score_estimates(&snap.ticker, &snap.estimates, cfg) {
            Ok(score) => out.scored.push(ScoredTicker {
                snapshot: snap.clone(),
                score,
            }),
            Err(err) => out.skipped.push(err),
        }
    }
    out.scored.sort_by(|a, b| a.ticker().cmp(b.ticker()));
    out
}

/// Joins snapshots with previously persisted scores. Snapshots without a
/// score are reported as insufficient data.
pub fn join_scores(
    snapshots: &[TickerSnapshot],
    scores: &BTreeMap<String, ScoreRecord>,
) -> ScoredUniverse {
    let mut out = ScoredUniverse::default();
    for snap in snapshots {
        match scores.get(&snap.ticker) {
            Some(score) => out.scored.push(ScoredTicker {
                snapshot: snap.clone(),
                score: *score,
            }),
            None => out
                .skipped
                .push(RankingError::insufficient(&snap.ticker, "no score for date")),
        }
    }
    out.scored.sort_by(|a, b| a.ticker().cmp(b.ticker()));
    out
}

#[derive(Debug, Clone)]
pub struct DateRanking {
    pub eligible: Vec<ScoredTicker>,
    pub funnel: Vec<FunnelStep>,
    pub revenue_gate_applied: bool,
    pub composite: CompositeRanking,
}

pub fn rank_date(
    as_of_date: NaiveDate,
    universe: &[ScoredTicker],
    cfg: &RankingConfig,
) -> DateRanking {
    let filter = EligibilityFilter::for_universe(cfg, universe);
    let outcome = filter.apply(universe.to_vec());
    let composite = rank_composite(as_of_date, &outcome.eligible, cfg);

    tracing::debug!(
        %as_of_date,
        universe = universe.len(),
        eligible = outcome.eligible.len(),
        ranked = composite.len(),
        method = ?composite.method,
        "composite ranking computed"
    );

    DateRanking {
        eligible: outcome.eligible,
        funnel: outcome.funnel,
        revenue_gate_applied: outcome.revenue_gate_applied,
        composite,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::snapshot::EstimateSnapshot;

    fn snap(ticker: &str, current: Option<f64>) -> TickerSnapshot {
        TickerSnapshot {
            ticker: ticker.to_string(),
            estimates: EstimateSnapshot {
                current,
                d7: Some(1.0),
                d30: Some(1.0),
                d60: Some(1.0),
                d90: Some(1.0),
            },
            ..Default::default()
        }
    }

    #[test]
    fn unscorable_tickers_are_skipped_not_fatal() {
        let cfg = RankingConfig::default();
        let snaps = [snap("B", Some(1.2)), snap("A", None), snap("C", Some(1.1))];
        let out = score_universe(&snaps, &cfg);
        let tickers: Vec<&str> = out.scored.iter().map(|t| t.ticker()).collect();
        assert_eq!(tickers, vec!["B", "C"]);
        assert_eq!(out.skipped.len(), 1);
    }

    #[test]
    fn join_reports_missing_scores() {
        let cfg = RankingConfig::default();
        let scored = score_universe(&[snap("A", Some(1.2))], &cfg);
        let scores: BTreeMap<String, ScoreRecord> = scored
            .scored
            .iter()
            .map(|t| (t.ticker().to_string(), t.score))
            .collect();
        let out = join_scores(&[snap("A", Some(1.2)), snap("B", Some(1.0))], &scores);
        assert_eq!(out.scored.len(), 1);
        assert_eq!(out.skipped.len(), 1);
    }

    #[test]
    fn snapshots_without_price_data_rank_nowhere() {
        let cfg = RankingConfig::default();
        let d = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();
        let universe = score_universe(&[snap("A", Some(2.0))], &cfg);
        let out = rank_date(d, &universe.scored, &cfg);
        assert!(out.eligible.is_empty());
        assert!(out.composite.is_empty());
    }
}
