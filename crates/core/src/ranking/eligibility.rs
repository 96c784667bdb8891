//! Eligibility filter.
//!
//! A fixed-order predicate pipeline. Every stage is an independent predicate,
//! so stage order changes only the funnel diagnostics and which failure is
//! reported first, never the final eligible set.

use crate::domain::records::ScoreRecord;
use crate::domain::shortlist::FilterStage;
use crate::domain::snapshot::TickerSnapshot;
use crate::ranking::config::RankingConfig;
use serde::{Deserialize, Serialize};

/// A snapshot joined with its score for the same date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredTicker {
    pub snapshot: TickerSnapshot,
    pub score: ScoreRecord,
}

impl ScoredTicker {
    pub fn ticker(&self) -> &str {
        &self.snapshot.ticker
    }

    pub fn gap(&self) -> Option<f64> {
        self.snapshot.gap
    }

    pub fn revenue_growth(&self) -> Option<f64> {
        self.snapshot.fundamentals.revenue_growth
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunnelStep {
    pub stage: FilterStage,
    pub passed: usize,
    pub eliminated: usize,
}

#[derive(Debug, Clone)]
pub struct EligibilityOutcome {
    pub eligible: Vec<ScoredTicker>,
    pub funnel: Vec<FunnelStep>,
    pub revenue_gate_applied: bool,
}

#[derive(Debug, Clone)]
pub struct EligibilityFilter<'a> {
    cfg: &'a RankingConfig,
    revenue_gate_applied: bool,
}

impl<'a> EligibilityFilter<'a> {
    /// The revenue stage is trusted only when enough of the date's scored
    /// universe reports revenue growth.
    pub fn for_universe(cfg: &'a RankingConfig, universe: &[ScoredTicker]) -> Self {
        let with_revenue = universe
            .iter()
            .filter(|t| t.revenue_growth().is_some())
            .count();
        Self {
            cfg,
            revenue_gate_applied: with_revenue >= cfg.min_revenue_sample,
        }
    }

    pub fn revenue_gate_applied(&self) -> bool {
        self.revenue_gate_applied
    }

    pub fn passes(&self, stage: FilterStage, t: &ScoredTicker) -> bool {
        let cfg = self.cfg;
        let snap = &t.snapshot;
        let f = &snap.fundamentals;
        match stage {
            FilterStage::AdjustedScore => t.score.adjusted_score > cfg.min_adjusted_score,
            FilterStage::EpsChange90d => match cfg.min_eps_change_90d {
                None => true,
                Some(min) => t.score.eps_change_90d.is_some_and(|c| c >= min),
            },
            FilterStage::GapMissing => snap.gap.is_some_and(f64::is_finite),
            FilterStage::PriceFloor => snap.price.price.is_some_and(|p| p >= cfg.min_price),
            FilterStage::MovingAverage => {
                match (snap.price.price, snap.price.trend_average()) {
                    (Some(p), Some(ma)) => p > ma,
                    _ => false,
                }
            }
            FilterStage::RevenueGrowth => {
                !self.revenue_gate_applied
                    || f.revenue_growth.is_some_and(|g| g >= cfg.min_revenue_growth)
            }
            FilterStage::CoverageQuality => {
                let enough_analysts = f
                    .analyst_count
                    .is_some_and(|n| n >= cfg.min_analyst_count);
                let revisions_ok = match (f.revisions_up_30d, f.revisions_down_30d) {
                    (Some(up), Some(down)) if up + down > 0 => {
                        (down as f64 / (up + down) as f64) <= cfg.max_down_revision_ratio
                    }
                    _ => true,
                };
                enough_analysts && revisions_ok
            }
            FilterStage::StructuralLowMargin => match (f.operating_margin, f.gross_margin) {
                (Some(op), Some(gross)) => {
                    !(op < cfg.structural_operating_margin && gross < cfg.structural_gross_margin)
                }
                _ => true,
            },
            FilterStage::LowProfitability => f
                .operating_margin
                .map_or(true, |op| op >= cfg.min_operating_margin),
            FilterStage::CommodityIndustry => match f.industry.as_deref() {
                None => true,
                Some(industry) => !self.is_commodity(industry),
            },
        }
    }

    fn is_commodity(&self, industry: &str) -> bool {
        let needle = industry.trim();
        self.cfg
            .commodity_industries
            .iter()
            .any(|c| c.eq_ignore_ascii_case(needle))
    }

    /// All failing stages, in stage order.
    pub fn failing_stages(&self, t: &ScoredTicker) -> Vec<FilterStage> {
        FilterStage::ALL
            .into_iter()
            .filter(|stage| !self.passes(*stage, t))
            .collect()
    }

    pub fn is_eligible(&self, t: &ScoredTicker) -> bool {
        FilterStage::ALL.into_iter().all(|stage| self.passes(stage, t))
    }

    pub fn apply(&self, universe: Vec<ScoredTicker>) -> EligibilityOutcome {
        let mut remaining = universe;
        let mut funnel = Vec::with_capacity(FilterStage::ALL.len());

        for stage in FilterStage::ALL {
            let before = remaining.len();
            remaining.retain(|t| self.passes(stage, t));
            funnel.push(FunnelStep {
                stage,
                passed: remaining.len(),
                eliminated: before - remaining.len(),
            });
        }

        EligibilityOutcome {
            eligible: remaining,
            funnel,
            revenue_gate_applied: self.revenue_gate_applied,
        }
    }
}
