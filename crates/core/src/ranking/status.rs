//! Shortlist lifecycle classification and drop attribution.

use crate::domain::shortlist::{
    DropReason, DroppedEntry, FilterStage, Shortlist, ShortlistEntry, Status,
};
use crate::ranking::eligibility::{EligibilityFilter, ScoredTicker};
use crate::ranking::smoother::SmoothedRanking;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const STATUS_WINDOW: usize = 3;

/// Persisted part2 ranks for one date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Part2Ranks {
    pub as_of_date: NaiveDate,
    pub ranks: BTreeMap<String, u32>,
}

/// Statuses for every ticker on the latest date of `window`.
///
/// `window` may hold any number of dates in any order; the latest
/// `STATUS_WINDOW` are used.
pub fn classify_statuses(window: &[Part2Ranks]) -> BTreeMap<String, Status> {
    let mut dates: Vec<&Part2Ranks> = window.iter().collect();
    dates.sort_by(|a, b| b.as_of_date.cmp(&a.as_of_date));
    dates.truncate(STATUS_WINDOW);

    let Some(latest) = dates.first() else {
        return BTreeMap::new();
    };

    latest
        .ranks
        .keys()
        .filter_map(|ticker| {
            let present = dates.iter().filter(|d| d.ranks.contains_key(ticker)).count();
            Status::from_presence(present).map(|s| (ticker.clone(), s))
        })
        .collect()
}

/// Attributes a drop to the first failing eligibility stage, or to the
/// top-N cutoff when the ticker is still eligible.
pub fn classify_drop(
    scored: Option<&ScoredTicker>,
    filter: &EligibilityFilter<'_>,
) -> (DropReason, Vec<FilterStage>) {
    let Some(t) = scored else {
        return (DropReason::InsufficientData, Vec::new());
    };
    let failed = filter.failing_stages(t);
    match failed.first() {
        Some(stage) => (DropReason::from(*stage), failed),
        None => (DropReason::RankCutoff, failed),
    }
}

/// Assembles the structured shortlist for `smoothed.as_of_date`.
///
/// `previous` holds part2 ranks of earlier dates (any order, current date
/// excluded). `universe` is the date's scored universe before eligibility.
pub fn build_shortlist(
    smoothed: &SmoothedRanking,
    previous: &[Part2Ranks],
    universe: &[ScoredTicker],
    filter: &EligibilityFilter<'_>,
) -> Shortlist {
    let current = Part2Ranks {
        as_of_date: smoothed.as_of_date,
        ranks: smoothed.part2_ranks(),
    };

    let mut earlier: Vec<&Part2Ranks> = previous
        .iter()
        .filter(|p| p.as_of_date < current.as_of_date && !p.ranks.is_empty())
        .collect();
    earlier.sort_by(|a, b| b.as_of_date.cmp(&a.as_of_date));
    earlier.truncate(STATUS_WINDOW - 1);

    let mut window: Vec<Part2Ranks> = vec![current.clone()];
    window.extend(earlier.iter().map(|p| (*p).clone()));
    let statuses = classify_statuses(&window);

    let entries = smoothed
        .entries
        .iter()
        .map(|e| ShortlistEntry {
            ticker: e.ticker.clone(),
            part2_rank: e.part2_rank,
            weighted_rank: e.weighted_rank,
            composite_rank: e.composite_rank,
            status: statuses.get(&e.ticker).copied().unwrap_or(Status::New),
        })
        .collect();

    let by_ticker: BTreeMap<&str, &ScoredTicker> =
        universe.iter().map(|t| (t.ticker(), t)).collect();

    let mut dropped: Vec<DroppedEntry> = earlier
        .first()
        .map(|prior| {
            prior
                .ranks
                .iter()
                .filter(|(ticker, _)| !current.ranks.contains_key(*ticker))
                .map(|(ticker, prev_rank)| {
                    let (reason, failed_stages) =
                        classify_drop(by_ticker.get(ticker.as_str()).copied(), filter);
                    DroppedEntry {
                        ticker: ticker.clone(),
                        previous_part2_rank: *prev_rank,
                        reason,
                        failed_stages,
                    }
                })
                .collect()
        })
        .unwrap_or_default();
    dropped.sort_by_key(|d| d.previous_part2_rank);

    Shortlist {
        as_of_date: current.as_of_date,
        entries,
        dropped,
        cold_start: window.len() < STATUS_WINDOW,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ranking::config::RankingConfig;
    use crate::ranking::eligibility::tests::passing;
    use crate::ranking::smoother::{smooth, CompositeRanks};

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, day).unwrap()
    }

    fn p2(date: NaiveDate, tickers: &[&str]) -> Part2Ranks {
        Part2Ranks {
            as_of_date: date,
            ranks: tickers
                .iter()
                .enumerate()
                .map(|(i, t)| (t.to_string(), i as u32 + 1))
                .collect(),
        }
    }

    #[test]
    fn presence_count_drives_status() {
        let window = vec![
            p2(d(3), &["A", "B", "C"]),
            p2(d(2), &["A", "B"]),
            p2(d(1), &["A"]),
        ];
        let s = classify_statuses(&window);
        assert_eq!(s["A"], Status::Verified);
        assert_eq!(s["B"], Status::Probation);
        assert_eq!(s["C"], Status::New);
    }

    #[test]
    fn only_latest_three_dates_count() {
        let window = vec![
            p2(d(4), &["A"]),
            p2(d(3), &[]),
            p2(d(2), &[]),
            p2(d(1), &["A"]),
        ];
        assert_eq!(classify_statuses(&window)["A"], Status::New);
    }

    #[test]
    fn probation_then_gone_when_ineligible() {
        // Present on T-2 and T-1, absent on T-3 and T.
        let t3 = p2(d(1), &["Y"]);
        let t2 = p2(d(2), &["X", "Y"]);
        let t1 = p2(d(3), &["X", "Y"]);
        let t0 = p2(d(4), &["Y"]);

        let on_t1 = classify_statuses(&[t3.clone(), t2.clone(), t1.clone()]);
        assert_eq!(on_t1["X"], Status::Probation);

        let on_t0 = classify_statuses(&[t2, t1, t0]);
        assert!(!on_t0.contains_key("X"));
        assert_eq!(on_t0["Y"], Status::Verified);
    }

    #[test]
    fn drop_reason_is_first_failing_stage() {
        let cfg = RankingConfig::default();
        let mut t = passing("X", -1.0, None);
        t.snapshot.price.price = Some(30.0); // below ma120=40
        t.snapshot.fundamentals.industry = Some("Coal".to_string());
        let filter = EligibilityFilter::for_universe(&cfg, std::slice::from_ref(&t));

        let (reason, failed) = classify_drop(Some(&t), &filter);
        assert_eq!(reason, DropReason::BelowMovingAverage);
        assert_eq!(
            failed,
            vec![FilterStage::MovingAverage, FilterStage::CommodityIndustry]
        );

        let ok = passing("Y", -1.0, None);
        assert_eq!(classify_drop(Some(&ok), &filter).0, DropReason::RankCutoff);
        assert_eq!(classify_drop(None, &filter).0, DropReason::InsufficientData);
    }

    #[test]
    fn builds_shortlist_with_drops_and_statuses() {
        let cfg = RankingConfig {
            shortlist_size: 2,
            ..RankingConfig::default()
        };
        let mut x = passing("X", 5.0, None);
        x.score.adjusted_score = 2.0;
        let universe = vec![
            passing("A", -3.0, None),
            passing("B", -2.0, None),
            passing("C", -1.0, None),
            x,
        ];
        let filter = EligibilityFilter::for_universe(&cfg, &universe);

        let today = CompositeRanks {
            as_of_date: d(4),
            ranks: [("A", 1), ("B", 2), ("C", 3)]
                .into_iter()
                .map(|(t, r)| (t.to_string(), r))
                .collect(),
        };
        let smoothed = smooth(&today, &[], &cfg).unwrap();
        let previous = vec![p2(d(3), &["A", "X", "C"]), p2(d(2), &["A"])];

        let out = build_shortlist(&smoothed, &previous, &universe, &filter);
        assert!(!out.cold_start);
        assert_eq!(out.entries.len(), 2);
        assert_eq!(out.entries[0].ticker, "A");
        assert_eq!(out.entries[0].status, Status::Verified);
        assert_eq!(out.entries[1].ticker, "B");
        assert_eq!(out.entries[1].status, Status::New);

        assert_eq!(out.dropped.len(), 2);
        assert_eq!(out.dropped[0].ticker, "X");
        assert_eq!(out.dropped[0].reason, DropReason::MomentumReversed);
        assert_eq!(out.dropped[1].ticker, "C");
        assert_eq!(out.dropped[1].reason, DropReason::RankCutoff);
    }

    #[test]
    fn first_run_is_cold_start() {
        let cfg = RankingConfig::default();
        let universe = vec![passing("A", -1.0, None)];
        let filter = EligibilityFilter::for_universe(&cfg, &universe);
        let today = CompositeRanks {
            as_of_date: d(4),
            ranks: [("A".to_string(), 1)].into_iter().collect(),
        };
        let smoothed = smooth(&today, &[], &cfg).unwrap();
        let out = build_shortlist(&smoothed, &[], &universe, &filter);
        assert!(out.cold_start);
        assert!(out.dropped.is_empty());
        assert_eq!(out.entries[0].status, Status::New);
    }
}
