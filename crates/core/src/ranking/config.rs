use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// What the composite ranker does when the revenue factor is unusable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackPolicy {
    /// Rank every eligible ticker by ascending gap.
    GapOverAll,
    /// Rank by ascending gap only the tickers that carry revenue data.
    RevenueCoveredOnly,
}

impl FromStr for FallbackPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "gap_over_all" => Ok(Self::GapOverAll),
            "revenue_covered_only" => Ok(Self::RevenueCoveredOnly),
            other => anyhow::bail!("unknown fallback policy: {other}"),
        }
    }
}

/// Thresholds and weights shared by every caller of the ranking pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankingConfig {
    pub segment_cap: f64,
    pub change_epsilon: f64,
    pub direction_divisor: f64,
    pub direction_clamp: f64,
    pub turnaround_sentinel: f64,

    pub min_adjusted_score: f64,
    /// Minimum 90-day EPS change (percent), checked right after the score
    /// cutoff. Disabled when `None`, the default; `RANK_MIN_EPS_CHANGE_90D`
    /// enables it.
    pub min_eps_change_90d: Option<f64>,
    pub min_price: f64,
    pub min_revenue_growth: f64,
    pub min_revenue_sample: usize,
    pub min_analyst_count: u32,
    pub max_down_revision_ratio: f64,
    pub structural_operating_margin: f64,
    pub structural_gross_margin: f64,
    pub min_operating_margin: f64,
    pub commodity_industries: Vec<String>,

    pub gap_weight: f64,
    pub revenue_weight: f64,
    pub fallback_policy: FallbackPolicy,

    pub smoothing_weights: [f64; 3],
    pub penalty_rank: f64,
    pub shortlist_size: usize,
}

impl Default for RankingConfig {
    fn default() -> Self {
        Self {
            segment_cap: 100.0,
            change_epsilon: 0.01,
            direction_divisor: 30.0,
            direction_clamp: 0.3,
            turnaround_sentinel: 999.0,

            min_adjusted_score: 9.0,
            min_eps_change_90d: None,
            min_price: 10.0,
            min_revenue_growth: 0.10,
            min_revenue_sample: 10,
            min_analyst_count: 3,
            max_down_revision_ratio: 0.3,
            structural_operating_margin: 0.10,
            structural_gross_margin: 0.30,
            min_operating_margin: 0.05,
            commodity_industries: default_commodity_industries(),

            gap_weight: 0.7,
            revenue_weight: 0.3,
            fallback_policy: FallbackPolicy::GapOverAll,

            smoothing_weights: [0.5, 0.3, 0.2],
            penalty_rank: 50.0,
            shortlist_size: 30,
        }
    }
}

fn default_commodity_industries() -> Vec<String> {
    [
        "metals & mining",
        "steel",
        "aluminum",
        "copper",
        "gold",
        "silver",
        "other industrial metals",
        "other precious metals",
        "oil & gas e&p",
        "oil & gas integrated",
        "oil & gas refining",
        "oil & gas drilling",
        "oil & gas equipment",
        "coal",
        "agricultural inputs",
        "farm products",
        "lumber & wood production",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

impl RankingConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let mut out = Self::default();

        if let Some(v) = env_parse("RANK_MIN_ADJUSTED_SCORE") {
            out.min_adjusted_score = v;
        }
        if let Some(v) = env_parse("RANK_MIN_EPS_CHANGE_90D") {
            out.min_eps_change_90d = Some(v);
        }
        if let Some(v) = env_parse("RANK_MIN_PRICE") {
            out.min_price = v;
        }
        if let Some(v) = env_parse("RANK_MIN_REVENUE_GROWTH") {
            out.min_revenue_growth = v;
        }
        if let Some(v) = env_parse("RANK_MIN_REVENUE_SAMPLE") {
            out.min_revenue_sample = v;
        }
        if let Some(v) = env_parse("RANK_MIN_ANALYST_COUNT") {
            out.min_analyst_count = v;
        }
        if let Some(v) = env_parse("RANK_MAX_DOWN_REVISION_RATIO") {
            out.max_down_revision_ratio = v;
        }
        if let Some(v) = env_parse("RANK_MIN_OPERATING_MARGIN") {
            out.min_operating_margin = v;
        }
        if let Some(v) = env_parse("RANK_PENALTY") {
            out.penalty_rank = v;
        }
        if let Some(v) = env_parse("RANK_SHORTLIST_SIZE") {
            out.shortlist_size = v;
        }
        if let Ok(s) = std::env::var("RANK_FALLBACK_POLICY") {
            out.fallback_policy = s.parse()?;
        }
        if let Ok(s) = std::env::var("RANK_COMMODITY_INDUSTRIES") {
            let list: Vec<String> = s
                .split(',')
                .map(|p| p.trim().to_ascii_lowercase())
                .filter(|p| !p.is_empty())
                .collect();
            if !list.is_empty() {
                out.commodity_industries = list;
            }
        }

        out.validate()?;
        Ok(out)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.shortlist_size >= 1, "shortlist_size must be >= 1");
        anyhow::ensure!(self.segment_cap > 0.0, "segment_cap must be positive");
        anyhow::ensure!(
            self.direction_divisor > 0.0,
            "direction_divisor must be positive"
        );
        anyhow::ensure!(
            (0.0..1.0).contains(&self.direction_clamp),
            "direction_clamp must be in [0, 1)"
        );
        anyhow::ensure!(self.penalty_rank >= 1.0, "penalty_rank must be >= 1");
        Ok(())
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse::<T>().ok())
}
