use chrono::NaiveDate;
use thiserror::Error;

/// Ranking failures. `StoreInconsistency`, `OutOfOrder` and `UpstreamFailed`
/// abort a date; the rest are recorded as diagnostics and processing continues.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RankingError {
    #[error("insufficient data for {ticker}: {detail}")]
    InsufficientData { ticker: String, detail: String },

    #[error("revenue sample too small on {as_of_date}: {have} < {need}")]
    SampleTooSmall {
        as_of_date: NaiveDate,
        have: usize,
        need: usize,
    },

    #[error("prior composite ranks missing for {as_of_date}: found {found} of {needed} reference dates")]
    DependencyMissing {
        as_of_date: NaiveDate,
        found: usize,
        needed: usize,
    },

    #[error("store inconsistency on {as_of_date}: {detail}")]
    StoreInconsistency { as_of_date: NaiveDate, detail: String },

    /// `last` is a date that was already smoothed from this date's ranks.
    #[error("date {as_of_date} processed out of order (last smoothed {last})")]
    OutOfOrder {
        as_of_date: NaiveDate,
        last: NaiveDate,
    },

    #[error("date {as_of_date} not ranked: earlier date {failed} failed in this run")]
    UpstreamFailed {
        as_of_date: NaiveDate,
        failed: NaiveDate,
    },
}

impl RankingError {
    pub fn insufficient(ticker: &str, detail: impl Into<String>) -> Self {
        Self::InsufficientData {
            ticker: ticker.to_string(),
            detail: detail.into(),
        }
    }

    /// Whether this error should abort the affected date.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::StoreInconsistency { .. } | Self::OutOfOrder { .. } | Self::UpstreamFailed { .. }
        )
    }
}
