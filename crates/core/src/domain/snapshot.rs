use serde::{Deserialize, Serialize};

pub const MA_SHORT_WINDOW: usize = 60;
pub const MA_LONG_WINDOW: usize = 120;

/// NTM EPS consensus as of the processing date and at fixed look-back offsets.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EstimateSnapshot {
    pub current: Option<f64>,
    pub d7: Option<f64>,
    pub d30: Option<f64>,
    pub d60: Option<f64>,
    pub d90: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PriceSnapshot {
    pub price: Option<f64>,
    pub ma60: Option<f64>,
    pub ma120: Option<f64>,
}

impl PriceSnapshot {
    /// Builds a snapshot from a trailing close series, oldest first.
    pub fn from_closes(closes: &[f64]) -> Self {
        Self {
            price: closes.last().copied(),
            ma60: moving_average(closes, MA_SHORT_WINDOW),
            ma120: moving_average(closes, MA_LONG_WINDOW),
        }
    }

    /// 120-day average when available, else 60-day.
    pub fn trend_average(&self) -> Option<f64> {
        self.ma120.or(self.ma60)
    }
}

/// Simple mean of the last `window` closes; `None` with fewer observations.
pub fn moving_average(closes: &[f64], window: usize) -> Option<f64> {
    if window == 0 || closes.len() < window {
        return None;
    }
    let tail = &closes[closes.len() - window..];
    Some(tail.iter().sum::<f64>() / window as f64)
}

/// Slower-moving fundamentals. Growth and margins are fractions (0.10 == 10%).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FundamentalsSnapshot {
    pub revenue_growth: Option<f64>,
    pub analyst_count: Option<u32>,
    pub revisions_up_30d: Option<u32>,
    pub revisions_down_30d: Option<u32>,
    pub operating_margin: Option<f64>,
    pub gross_margin: Option<f64>,
    pub industry: Option<String>,
}

/// Everything known about one ticker on one processing date.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TickerSnapshot {
    pub ticker: String,
    #[serde(default)]
    pub estimates: EstimateSnapshot,
    #[serde(default)]
    pub price: PriceSnapshot,
    #[serde(default)]
    pub fundamentals: FundamentalsSnapshot,
    /// Price-implied valuation drift; supplied upstream.
    pub gap: Option<f64>,
}
