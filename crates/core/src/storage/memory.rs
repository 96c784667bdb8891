use crate::domain::records::{RankRecord, ScoreRecord};
use crate::domain::shortlist::Shortlist;
use crate::domain::snapshot::TickerSnapshot;
use crate::ranking::smoother::CompositeRanks;
use crate::ranking::status::Part2Ranks;
use crate::storage::{RankStore, RunRecord};
use chrono::NaiveDate;
use std::collections::{BTreeMap, HashSet};
use std::ops::Bound;
use tokio::sync::Mutex;

#[derive(Debug, Default, Clone)]
struct DateRecords {
    snapshots: BTreeMap<String, TickerSnapshot>,
    scores: BTreeMap<String, ScoreRecord>,
    ranks: BTreeMap<String, RankRecord>,
    shortlist: Option<Shortlist>,
}

impl DateRecords {
    fn composite(&self) -> BTreeMap<String, u32> {
        self.ranks
            .iter()
            .filter_map(|(t, r)| r.composite_rank.map(|c| (t.clone(), c)))
            .collect()
    }

    fn part2(&self) -> BTreeMap<String, u32> {
        self.ranks
            .iter()
            .filter_map(|(t, r)| r.part2_rank.map(|p| (t.clone(), p)))
            .collect()
    }

    fn has_composite(&self) -> bool {
        self.ranks.values().any(|r| r.composite_rank.is_some())
    }

    fn has_part2(&self) -> bool {
        self.ranks.values().any(|r| r.part2_rank.is_some())
    }
}

#[derive(Debug, Default)]
struct State {
    dates: BTreeMap<NaiveDate, DateRecords>,
    locked: HashSet<NaiveDate>,
    runs: Vec<RunRecord>,
}

/// Process-local store for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryRankStore {
    state: Mutex<State>,
}

impl MemoryRankStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn runs(&self) -> Vec<RunRecord> {
        self.state.lock().await.runs.clone()
    }
}

#[async_trait::async_trait]
impl RankStore for MemoryRankStore {
    async fn try_lock_date(&self, as_of_date: NaiveDate) -> anyhow::Result<bool> {
        Ok(self.state.lock().await.locked.insert(as_of_date))
    }

    async fn release_date(&self, as_of_date: NaiveDate) -> anyhow::Result<()> {
        self.state.lock().await.locked.remove(&as_of_date);
        Ok(())
    }

    async fn replace_snapshots(
        &self,
        as_of_date: NaiveDate,
        items: &[TickerSnapshot],
    ) -> anyhow::Result<u64> {
        let mut state = self.state.lock().await;
        state.dates.entry(as_of_date).or_default().snapshots = items
            .iter()
            .map(|item| (item.ticker.trim().to_string(), item.clone()))
            .collect();
        Ok(items.len() as u64)
    }

    async fn load_snapshots(&self, as_of_date: NaiveDate) -> anyhow::Result<Vec<TickerSnapshot>> {
        let state = self.state.lock().await;
        Ok(state
            .dates
            .get(&as_of_date)
            .map(|d| d.snapshots.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn snapshot_dates(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> anyhow::Result<Vec<NaiveDate>> {
        let state = self.state.lock().await;
        Ok(state
            .dates
            .range(from..=to)
            .filter(|(_, d)| !d.snapshots.is_empty())
            .map(|(date, _)| *date)
            .collect())
    }

    async fn replace_scores(
        &self,
        as_of_date: NaiveDate,
        scores: &BTreeMap<String, ScoreRecord>,
    ) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        state.dates.entry(as_of_date).or_default().scores = scores.clone();
        Ok(())
    }

    async fn load_scores(
        &self,
        as_of_date: NaiveDate,
    ) -> anyhow::Result<BTreeMap<String, ScoreRecord>> {
        let state = self.state.lock().await;
        Ok(state
            .dates
            .get(&as_of_date)
            .map(|d| d.scores.clone())
            .unwrap_or_default())
    }

    async fn replace_composite_ranks(
        &self,
        as_of_date: NaiveDate,
        ranks: &BTreeMap<String, u32>,
    ) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        let day = state.dates.entry(as_of_date).or_default();
        day.ranks = ranks
            .iter()
            .map(|(t, r)| {
                let record = RankRecord {
                    composite_rank: Some(*r),
                    part2_rank: None,
                };
                (t.clone(), record)
            })
            .collect();
        Ok(())
    }

    async fn load_composite_ranks(&self, as_of_date: NaiveDate) -> anyhow::Result<CompositeRanks> {
        let state = self.state.lock().await;
        Ok(CompositeRanks {
            as_of_date,
            ranks: state
                .dates
                .get(&as_of_date)
                .map(DateRecords::composite)
                .unwrap_or_default(),
        })
    }

    async fn ranked_dates_after(&self, after: NaiveDate) -> anyhow::Result<Vec<NaiveDate>> {
        let state = self.state.lock().await;
        Ok(state
            .dates
            .range((Bound::Excluded(after), Bound::Unbounded))
            .filter(|(_, d)| d.has_composite())
            .map(|(date, _)| *date)
            .collect())
    }

    async fn composite_history(
        &self,
        before: NaiveDate,
        n: usize,
    ) -> anyhow::Result<Vec<CompositeRanks>> {
        let state = self.state.lock().await;
        Ok(state
            .dates
            .range(..before)
            .rev()
            .filter(|(_, d)| d.has_composite())
            .take(n)
            .map(|(date, d)| CompositeRanks {
                as_of_date: *date,
                ranks: d.composite(),
            })
            .collect())
    }

    async fn replace_part2_ranks(
        &self,
        as_of_date: NaiveDate,
        ranks: &BTreeMap<String, u32>,
    ) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        let day = state.dates.entry(as_of_date).or_default();
        for (ticker, _) in ranks {
            anyhow::ensure!(
                day.ranks
                    .get(ticker)
                    .is_some_and(|r| r.composite_rank.is_some()),
                "part2 rank for {ticker} on {as_of_date} has no composite rank"
            );
        }
        for (ticker, record) in day.ranks.iter_mut() {
            record.part2_rank = ranks.get(ticker).copied();
        }
        Ok(())
    }

    async fn load_part2_ranks(&self, as_of_date: NaiveDate) -> anyhow::Result<Part2Ranks> {
        let state = self.state.lock().await;
        Ok(Part2Ranks {
            as_of_date,
            ranks: state
                .dates
                .get(&as_of_date)
                .map(DateRecords::part2)
                .unwrap_or_default(),
        })
    }

    async fn part2_history(
        &self,
        before: NaiveDate,
        n: usize,
    ) -> anyhow::Result<Vec<Part2Ranks>> {
        let state = self.state.lock().await;
        Ok(state
            .dates
            .range(..before)
            .rev()
            .filter(|(_, d)| d.has_part2())
            .take(n)
            .map(|(date, d)| Part2Ranks {
                as_of_date: *date,
                ranks: d.part2(),
            })
            .collect())
    }

    async fn clear_ranks(&self, as_of_date: NaiveDate) -> anyhow::Result<u64> {
        let mut state = self.state.lock().await;
        let Some(day) = state.dates.get_mut(&as_of_date) else {
            return Ok(0);
        };
        let cleared = day.ranks.len() as u64;
        day.ranks.clear();
        day.shortlist = None;
        Ok(cleared)
    }

    async fn clear_derived(&self, from: NaiveDate, to: NaiveDate) -> anyhow::Result<u64> {
        let mut state = self.state.lock().await;
        let mut cleared = 0;
        for (_, day) in state.dates.range_mut(from..=to) {
            cleared += (day.scores.len() + day.ranks.len()) as u64;
            day.scores.clear();
            day.ranks.clear();
            day.shortlist = None;
        }
        Ok(cleared)
    }

    async fn replace_shortlist(&self, shortlist: &Shortlist) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        state
            .dates
            .entry(shortlist.as_of_date)
            .or_default()
            .shortlist = Some(shortlist.clone());
        Ok(())
    }

    async fn load_shortlist(
        &self,
        as_of_date: Option<NaiveDate>,
    ) -> anyhow::Result<Option<Shortlist>> {
        let state = self.state.lock().await;
        Ok(match as_of_date {
            Some(d) => state.dates.get(&d).and_then(|r| r.shortlist.clone()),
            None => state
                .dates
                .values()
                .rev()
                .find_map(|r| r.shortlist.clone()),
        })
    }

    async fn record_run(&self, run: &RunRecord) -> anyhow::Result<()> {
        self.state.lock().await.runs.push(run.clone());
        Ok(())
    }
}
