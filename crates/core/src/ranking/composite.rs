//! Same-day composite ranking over the eligible set.

use crate::ranking::config::{FallbackPolicy, RankingConfig};
use crate::ranking::eligibility::ScoredTicker;
use crate::ranking::error::RankingError;
use crate::ranking::stats::zscores;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompositeMethod {
    /// `-z(gap) * w_gap + z(revenue) * w_rev`, descending.
    Blend,
    /// Ascending gap.
    GapOnly,
}

#[derive(Debug, Clone)]
pub struct CompositeRanking {
    pub as_of_date: NaiveDate,
    pub method: CompositeMethod,
    /// Tickers in rank order; position `i` holds composite rank `i + 1`.
    pub ordered: Vec<String>,
    pub revenue_covered: usize,
    pub diagnostics: Vec<RankingError>,
}

impl CompositeRanking {
    pub fn ranks(&self) -> BTreeMap<String, u32> {
        self.ordered
            .iter()
            .enumerate()
            .map(|(i, t)| (t.clone(), i as u32 + 1))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }
}

/// Ranks `eligible` for one date. Ties keep input order.
pub fn rank_composite(
    as_of_date: NaiveDate,
    eligible: &[ScoredTicker],
    cfg: &RankingConfig,
) -> CompositeRanking {
    let mut diagnostics = Vec::new();

    let rows: Vec<(&str, f64, Option<f64>)> = eligible
        .iter()
        .filter_map(|t| t.gap().map(|g| (t.ticker(), g, t.revenue_growth())))
        .collect();

    let revenue_covered = rows.iter().filter(|r| r.2.is_some()).count();
    let sample_ok = revenue_covered >= cfg.min_revenue_sample;
    if !sample_ok {
        diagnostics.push(RankingError::SampleTooSmall {
            as_of_date,
            have: revenue_covered,
            need: cfg.min_revenue_sample,
        });
    }

    if sample_ok && revenue_covered == rows.len() {
        let gaps: Vec<f64> = rows.iter().map(|r| r.1).collect();
        let revs: Vec<f64> = rows.iter().filter_map(|r| r.2).collect();
        if let (Some(z_gap), Some(z_rev)) = (zscores(&gaps), zscores(&revs)) {
            let mut scored: Vec<(&str, f64)> = rows
                .iter()
                .zip(z_gap.iter().zip(z_rev.iter()))
                .map(|(r, (zg, zr))| (r.0, -zg * cfg.gap_weight + zr * cfg.revenue_weight))
                .collect();
            scored.sort_by(|a, b| b.1.total_cmp(&a.1));

            return CompositeRanking {
                as_of_date,
                method: CompositeMethod::Blend,
                ordered: scored.into_iter().map(|(t, _)| t.to_string()).collect(),
                revenue_covered,
                diagnostics,
            };
        }
        tracing::debug!(%as_of_date, "zero factor variance; ranking by gap only");
    }

    let mut by_gap: Vec<(&str, f64)> = rows
        .iter()
        .filter(|r| match cfg.fallback_policy {
            FallbackPolicy::GapOverAll => true,
            FallbackPolicy::RevenueCoveredOnly => r.2.is_some(),
        })
        .map(|r| (r.0, r.1))
        .collect();
    by_gap.sort_by(|a, b| a.1.total_cmp(&b.1));

    CompositeRanking {
        as_of_date,
        method: CompositeMethod::GapOnly,
        ordered: by_gap.into_iter().map(|(t, _)| t.to_string()).collect(),
        revenue_covered,
        diagnostics,
    }
}
