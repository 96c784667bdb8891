use crate::domain::snapshot::{EstimateSnapshot, FundamentalsSnapshot, PriceSnapshot, TickerSnapshot};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Provider payload for one ticker on one date.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickerSnapshotResponse {
    pub ticker: String,
    pub as_of_date: NaiveDate,
    #[serde(default)]
    pub eps: EstimateSnapshot,
    /// Trailing daily closes, oldest first. Takes precedence over `price`.
    #[serde(default)]
    pub closes: Vec<f64>,
    #[serde(default)]
    pub price: Option<PriceSnapshot>,
    #[serde(default)]
    pub fundamentals: FundamentalsSnapshot,
    #[serde(default)]
    pub gap: Option<f64>,
}

impl TickerSnapshotResponse {
    pub fn into_snapshot(self) -> TickerSnapshot {
        let price = if self.closes.is_empty() {
            self.price.unwrap_or_default()
        } else {
            PriceSnapshot::from_closes(&self.closes)
        };

        TickerSnapshot {
            ticker: self.ticker.trim().to_string(),
            estimates: self.eps,
            price,
            fundamentals: self.fundamentals,
            gap: self.gap,
        }
    }
}
