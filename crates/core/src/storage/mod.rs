//! Snapshot/rank repository.
//!
//! Every write is clear-then-recompute for one date; nothing is patched
//! incrementally. Composite ranks and part2 ranks are stored separately so a
//! smoothing pass can only ever read the former.

pub mod lock;
pub mod memory;
pub mod postgres;

use crate::domain::records::ScoreRecord;
use crate::domain::shortlist::Shortlist;
use crate::domain::snapshot::TickerSnapshot;
use crate::ranking::smoother::CompositeRanks;
use crate::ranking::status::Part2Ranks;
use anyhow::Context;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub use memory::MemoryRankStore;
pub use postgres::PgRankStore;

pub async fn migrate(pool: &sqlx::PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("sqlx migrations failed")?;
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: uuid::Uuid,
    pub mode: String,
    pub from_date: NaiveDate,
    pub to_date: NaiveDate,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: String,
    pub summary: serde_json::Value,
}

#[async_trait::async_trait]
pub trait RankStore: Send + Sync {
    /// At most one in-flight recomputation per date.
    async fn try_lock_date(&self, as_of_date: NaiveDate) -> anyhow::Result<bool>;

    async fn release_date(&self, as_of_date: NaiveDate) -> anyhow::Result<()>;

    /// Replaces the date's whole snapshot set; tickers absent from `items`
    /// no longer have a snapshot for that date.
    async fn replace_snapshots(
        &self,
        as_of_date: NaiveDate,
        items: &[TickerSnapshot],
    ) -> anyhow::Result<u64>;

    async fn load_snapshots(&self, as_of_date: NaiveDate) -> anyhow::Result<Vec<TickerSnapshot>>;

    /// Dates in `[from, to]` that hold any snapshot, ascending.
    async fn snapshot_dates(&self, from: NaiveDate, to: NaiveDate)
        -> anyhow::Result<Vec<NaiveDate>>;

    async fn replace_scores(
        &self,
        as_of_date: NaiveDate,
        scores: &BTreeMap<String, ScoreRecord>,
    ) -> anyhow::Result<()>;

    async fn load_scores(&self, as_of_date: NaiveDate)
        -> anyhow::Result<BTreeMap<String, ScoreRecord>>;

    /// Replaces the date's composite ranks and clears its part2 ranks.
    async fn replace_composite_ranks(
        &self,
        as_of_date: NaiveDate,
        ranks: &BTreeMap<String, u32>,
    ) -> anyhow::Result<()>;

    async fn load_composite_ranks(&self, as_of_date: NaiveDate) -> anyhow::Result<CompositeRanks>;

    /// Dates strictly after `after` that hold composite ranks, ascending.
    async fn ranked_dates_after(&self, after: NaiveDate) -> anyhow::Result<Vec<NaiveDate>>;

    /// Up to `n` most recent dates strictly before `before` with composite ranks.
    async fn composite_history(
        &self,
        before: NaiveDate,
        n: usize,
    ) -> anyhow::Result<Vec<CompositeRanks>>;

    async fn replace_part2_ranks(
        &self,
        as_of_date: NaiveDate,
        ranks: &BTreeMap<String, u32>,
    ) -> anyhow::Result<()>;

    async fn load_part2_ranks(&self, as_of_date: NaiveDate) -> anyhow::Result<Part2Ranks>;

    /// Up to `n` most recent dates strictly before `before` with part2 ranks.
    async fn part2_history(&self, before: NaiveDate, n: usize)
        -> anyhow::Result<Vec<Part2Ranks>>;

    /// Clears the date's composite ranks, part2 ranks and shortlist.
    async fn clear_ranks(&self, as_of_date: NaiveDate) -> anyhow::Result<u64>;

    /// Clears scores, ranks and shortlists for every date in `[from, to]`.
    async fn clear_derived(&self, from: NaiveDate, to: NaiveDate) -> anyhow::Result<u64>;

    async fn replace_shortlist(&self, shortlist: &Shortlist) -> anyhow::Result<()>;

    /// The shortlist for `as_of_date`, or the latest one when `None`.
    async fn load_shortlist(&self, as_of_date: Option<NaiveDate>)
        -> anyhow::Result<Option<Shortlist>>;

    async fn record_run(&self, run: &RunRecord) -> anyhow::Result<()>;
}
