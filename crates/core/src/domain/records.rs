use serde::{Deserialize, Serialize};

/// Derived momentum figures for one ticker/date.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreRecord {
    pub seg1: f64,
    pub seg2: f64,
    pub seg3: f64,
    pub seg4: f64,
    pub raw_score: f64,
    pub direction: f64,
    pub adjusted_score: f64,
    pub eps_change_90d: Option<f64>,
}

impl ScoreRecord {
    pub fn segments(&self) -> [f64; 4] {
        [self.seg1, self.seg2, self.seg3, self.seg4]
    }
}

/// composite_rank is durable; part2_rank is rebuilt on every smoothing pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankRecord {
    pub composite_rank: Option<u32>,
    pub part2_rank: Option<u32>,
}
