use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Eligibility stages in evaluation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterStage {
    AdjustedScore,
    EpsChange90d,
    GapMissing,
    PriceFloor,
    MovingAverage,
    RevenueGrowth,
    CoverageQuality,
    StructuralLowMargin,
    LowProfitability,
    CommodityIndustry,
}

impl FilterStage {
    pub const ALL: [FilterStage; 10] = [
        FilterStage::AdjustedScore,
        FilterStage::EpsChange90d,
        FilterStage::GapMissing,
        FilterStage::PriceFloor,
        FilterStage::MovingAverage,
        FilterStage::RevenueGrowth,
        FilterStage::CoverageQuality,
        FilterStage::StructuralLowMargin,
        FilterStage::LowProfitability,
        FilterStage::CommodityIndustry,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AdjustedScore => "adjusted_score",
            Self::EpsChange90d => "eps_change_90d",
            Self::GapMissing => "gap_missing",
            Self::PriceFloor => "price_floor",
            Self::MovingAverage => "moving_average",
            Self::RevenueGrowth => "revenue_growth",
            Self::CoverageQuality => "coverage_quality",
            Self::StructuralLowMargin => "structural_low_margin",
            Self::LowProfitability => "low_profitability",
            Self::CommodityIndustry => "commodity_industry",
        }
    }
}

impl fmt::Display for FilterStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    New,
    Probation,
    Verified,
}

impl Status {
    /// Maps a 3-day membership count to a lifecycle status.
    pub fn from_presence(count: usize) -> Option<Self> {
        match count {
            0 => None,
            1 => Some(Self::New),
            2 => Some(Self::Probation),
            _ => Some(Self::Verified),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Probation => "probation",
            Self::Verified => "verified",
        }
    }
}

/// Why a ticker left the shortlist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    MomentumReversed,
    EpsTrendWeak,
    GapUnavailable,
    PriceBelowFloor,
    BelowMovingAverage,
    RevenueGrowthWeak,
    CoverageLost,
    StructuralLowMargin,
    LowProfitability,
    CommodityIndustry,
    /// Still eligible, outranked by the top-N cutoff.
    RankCutoff,
    /// No usable snapshot or score on the current date.
    InsufficientData,
}

impl From<FilterStage> for DropReason {
    fn from(stage: FilterStage) -> Self {
        match stage {
            FilterStage::AdjustedScore => Self::MomentumReversed,
            FilterStage::EpsChange90d => Self::EpsTrendWeak,
            FilterStage::GapMissing => Self::GapUnavailable,
            FilterStage::PriceFloor => Self::PriceBelowFloor,
            FilterStage::MovingAverage => Self::BelowMovingAverage,
            FilterStage::RevenueGrowth => Self::RevenueGrowthWeak,
            FilterStage::CoverageQuality => Self::CoverageLost,
            FilterStage::StructuralLowMargin => Self::StructuralLowMargin,
            FilterStage::LowProfitability => Self::LowProfitability,
            FilterStage::CommodityIndustry => Self::CommodityIndustry,
        }
    }
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MomentumReversed => "momentum_reversed",
            Self::EpsTrendWeak => "eps_trend_weak",
            Self::GapUnavailable => "gap_unavailable",
            Self::PriceBelowFloor => "price_below_floor",
            Self::BelowMovingAverage => "below_moving_average",
            Self::RevenueGrowthWeak => "revenue_growth_weak",
            Self::CoverageLost => "coverage_lost",
            Self::StructuralLowMargin => "structural_low_margin",
            Self::LowProfitability => "low_profitability",
            Self::CommodityIndustry => "commodity_industry",
            Self::RankCutoff => "rank_cutoff",
            Self::InsufficientData => "insufficient_data",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShortlistEntry {
    pub ticker: String,
    pub part2_rank: u32,
    pub weighted_rank: f64,
    pub composite_rank: u32,
    pub status: Status,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DroppedEntry {
    pub ticker: String,
    pub previous_part2_rank: u32,
    pub reason: DropReason,
    /// Every failing eligibility stage, in stage order. Empty for rank cutoffs.
    pub failed_stages: Vec<FilterStage>,
}

/// Structured output handed to delivery sinks and the API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shortlist {
    pub as_of_date: NaiveDate,
    pub entries: Vec<ShortlistEntry>,
    pub dropped: Vec<DroppedEntry>,
    pub cold_start: bool,
}
