//! Temporal smoother.
//!
//! Blends today's composite rank with the raw composite ranks of the two most
//! recent prior dates that have any. Only composite ranks are accepted as
//! history: a date's smoothed output never feeds another date's smoothing.

use crate::ranking::config::RankingConfig;
use crate::ranking::error::RankingError;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const REFERENCE_DATES: usize = 2;

/// Raw composite ranks persisted for one date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompositeRanks {
    pub as_of_date: NaiveDate,
    pub ranks: BTreeMap<String, u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmoothedEntry {
    pub ticker: String,
    pub composite_rank: u32,
    pub weighted_rank: f64,
    pub part2_rank: u32,
}

#[derive(Debug, Clone)]
pub struct SmoothedRanking {
    pub as_of_date: NaiveDate,
    /// Shortlist in part2 order.
    pub entries: Vec<SmoothedEntry>,
    pub reference_dates: Vec<NaiveDate>,
    pub diagnostics: Vec<RankingError>,
}

impl SmoothedRanking {
    pub fn part2_ranks(&self) -> BTreeMap<String, u32> {
        self.entries
            .iter()
            .map(|e| (e.ticker.clone(), e.part2_rank))
            .collect()
    }
}

pub fn weighted_rank(r0: u32, r1: Option<u32>, r2: Option<u32>, cfg: &RankingConfig) -> f64 {
    let [w0, w1, w2] = cfg.smoothing_weights;
    let p = cfg.penalty_rank;
    r0 as f64 * w0 + r1.map_or(p, f64::from) * w1 + r2.map_or(p, f64::from) * w2
}

/// `history` may be in any order and may contain more than two dates; the two
/// latest dates strictly before `today.as_of_date` are used.
pub fn smooth(
    today: &CompositeRanks,
    history: &[CompositeRanks],
    cfg: &RankingConfig,
) -> Result<SmoothedRanking, RankingError> {
    let as_of_date = today.as_of_date;
    if today.ranks.is_empty() {
        return Err(RankingError::StoreInconsistency {
            as_of_date,
            detail: "no composite_rank for the current date".to_string(),
        });
    }

    if let Some(later) = history.iter().find(|h| h.as_of_date >= as_of_date) {
        return Err(RankingError::OutOfOrder {
            as_of_date,
            last: later.as_of_date,
        });
    }

    let mut priors: Vec<&CompositeRanks> =
        history.iter().filter(|h| !h.ranks.is_empty()).collect();
    priors.sort_by(|a, b| b.as_of_date.cmp(&a.as_of_date));
    priors.truncate(REFERENCE_DATES);

    let mut diagnostics = Vec::new();
    if priors.len() < REFERENCE_DATES {
        diagnostics.push(RankingError::DependencyMissing {
            as_of_date,
            found: priors.len(),
            needed: REFERENCE_DATES,
        });
    }

    let prior_rank = |idx: usize, ticker: &str| -> Option<u32> {
        priors.get(idx).and_then(|p| p.ranks.get(ticker).copied())
    };

    let mut weighted: Vec<(&str, u32, f64)> = today
        .ranks
        .iter()
        .map(|(ticker, r0)| {
            let w = weighted_rank(*r0, prior_rank(0, ticker), prior_rank(1, ticker), cfg);
            (ticker.as_str(), *r0, w)
        })
        .collect();
    weighted.sort_by(|a, b| a.2.total_cmp(&b.2).then(a.1.cmp(&b.1)));

    let entries = weighted
        .into_iter()
        .take(cfg.shortlist_size)
        .enumerate()
        .map(|(i, (ticker, composite_rank, weighted_rank))| SmoothedEntry {
            ticker: ticker.to_string(),
            composite_rank,
            weighted_rank,
            part2_rank: i as u32 + 1,
        })
        .collect();

    Ok(SmoothedRanking {
        as_of_date,
        entries,
        reference_dates: priors.iter().map(|p| p.as_of_date).collect(),
        diagnostics,
    })
}
