pub mod composite;
pub mod config;
pub mod eligibility;
pub mod error;
pub mod pipeline;
pub mod score;
pub mod smoother;
pub mod stats;
pub mod status;

pub use config::{FallbackPolicy, RankingConfig};
pub use error::RankingError;
