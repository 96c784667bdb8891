//! Segment score calculator.
//!
//! Turns one ticker's NTM EPS revision history into four capped segment
//! changes, a raw score, a recency direction, and a direction-adjusted score.

use crate::domain::records::ScoreRecord;
use crate::domain::snapshot::EstimateSnapshot;
use crate::ranking::config::RankingConfig;
use crate::ranking::error::RankingError;

/// Percentage change from `earlier` to `later`; 0 when either side is missing
/// or `earlier` is within `epsilon` of zero.
pub fn pct_change(later: Option<f64>, earlier: Option<f64>, epsilon: f64) -> f64 {
    match (later, earlier) {
        (Some(l), Some(e)) if e.abs() > epsilon => (l - e) / e.abs() * 100.0,
        _ => 0.0,
    }
}

fn capped(v: f64, cap: f64) -> f64 {
    v.clamp(-cap, cap)
}

/// Recent half minus older half.
pub fn direction(segments: [f64; 4]) -> f64 {
    let [s1, s2, s3, s4] = segments;
    (s3 + s4) / 2.0 - (s1 + s2) / 2.0
}

/// Multiplier applied to the raw score, bounded to `1 ± clamp`.
pub fn direction_factor(direction: f64, cfg: &RankingConfig) -> f64 {
    1.0 + (direction / cfg.direction_divisor).clamp(-cfg.direction_clamp, cfg.direction_clamp)
}

/// 90-day NTM EPS change in percent. `None` when there is no 90-day-ago figure.
pub fn eps_change_90d(current: f64, d90: Option<f64>, cfg: &RankingConfig) -> Option<f64> {
    let d90 = d90?;
    if d90.abs() > cfg.change_epsilon {
        Some((current - d90) / d90.abs() * 100.0)
    } else if current > 0.0 {
        Some(cfg.turnaround_sentinel)
    } else {
        Some(0.0)
    }
}

pub fn score_estimates(
    ticker: &str,
    est: &EstimateSnapshot,
    cfg: &RankingConfig,
) -> Result<ScoreRecord, RankingError> {
    let current = est
        .current
        .filter(|v| v.is_finite())
        .ok_or_else(|| RankingError::insufficient(ticker, "current NTM EPS estimate missing"))?;

    let eps = cfg.change_epsilon;
    let cap = cfg.segment_cap;
    let seg1 = capped(pct_change(est.d60, est.d90, eps), cap);
    let seg2 = capped(pct_change(est.d30, est.d60, eps), cap);
    let seg3 = capped(pct_change(est.d7, est.d30, eps), cap);
    let seg4 = capped(pct_change(Some(current), est.d7, eps), cap);

    let raw_score = seg1 + seg2 + seg3 + seg4;
    let direction = direction([seg1, seg2, seg3, seg4]);
    let adjusted_score = raw_score * direction_factor(direction, cfg);

    Ok(ScoreRecord {
        seg1,
        seg2,
        seg3,
        seg4,
        raw_score,
        direction,
        adjusted_score,
        eps_change_90d: eps_change_90d(current, est.d90, cfg),
    })
}
