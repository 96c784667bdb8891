use crate::domain::records::ScoreRecord;
use crate::domain::shortlist::Shortlist;
use crate::domain::snapshot::{
    EstimateSnapshot, FundamentalsSnapshot, PriceSnapshot, TickerSnapshot,
};
use crate::ranking::smoother::CompositeRanks;
use crate::ranking::status::Part2Ranks;
use crate::storage::lock;
use crate::storage::{RankStore, RunRecord};
use anyhow::Context;
use chrono::NaiveDate;
use sqlx::pool::PoolConnection;
use sqlx::{PgPool, Postgres};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::Mutex;

pub struct PgRankStore {
    pool: PgPool,
    // Advisory locks are session-scoped: keep the owning connection checked out.
    held: Mutex<HashMap<NaiveDate, PoolConnection<Postgres>>>,
    batch_size: usize,
}

impl PgRankStore {
    pub fn new(pool: PgPool) -> anyhow::Result<Self> {
        let batch_size: usize = std::env::var("RANK_STORE_UPSERT_BATCH")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(200);
        anyhow::ensure!(batch_size >= 1, "RANK_STORE_UPSERT_BATCH must be >= 1");

        Ok(Self {
            pool,
            held: Mutex::new(HashMap::new()),
            batch_size,
        })
    }

    async fn dates_with(
        &self,
        predicate_column: &str,
        before: NaiveDate,
        n: usize,
    ) -> anyhow::Result<Vec<NaiveDate>> {
        let sql = format!(
            "SELECT DISTINCT as_of_date FROM ticker_ranks \
             WHERE as_of_date < $1 AND {predicate_column} IS NOT NULL \
             ORDER BY as_of_date DESC \
             LIMIT $2"
        );
        let rows: Vec<(NaiveDate,)> = sqlx::query_as(&sql)
            .persistent(false)
            .bind(before)
            .bind(n as i64)
            .fetch_all(&self.pool)
            .await
            .with_context(|| format!("query dates with {predicate_column} failed"))?;
        Ok(rows.into_iter().map(|r| r.0).collect())
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SnapshotRow {
    ticker: String,
    eps_current: Option<f64>,
    eps_7d: Option<f64>,
    eps_30d: Option<f64>,
    eps_60d: Option<f64>,
    eps_90d: Option<f64>,
    price: Option<f64>,
    ma60: Option<f64>,
    ma120: Option<f64>,
    revenue_growth: Option<f64>,
    analyst_count: Option<i32>,
    revisions_up_30d: Option<i32>,
    revisions_down_30d: Option<i32>,
    operating_margin: Option<f64>,
    gross_margin: Option<f64>,
    industry: Option<String>,
    gap: Option<f64>,
}

impl From<SnapshotRow> for TickerSnapshot {
    fn from(r: SnapshotRow) -> Self {
        let count = |v: Option<i32>| v.and_then(|n| u32::try_from(n).ok());
        TickerSnapshot {
            ticker: r.ticker,
            estimates: EstimateSnapshot {
                current: r.eps_current,
                d7: r.eps_7d,
                d30: r.eps_30d,
                d60: r.eps_60d,
                d90: r.eps_90d,
            },
            price: PriceSnapshot {
                price: r.price,
                ma60: r.ma60,
                ma120: r.ma120,
            },
            fundamentals: FundamentalsSnapshot {
                revenue_growth: r.revenue_growth,
                analyst_count: count(r.analyst_count),
                revisions_up_30d: count(r.revisions_up_30d),
                revisions_down_30d: count(r.revisions_down_30d),
                operating_margin: r.operating_margin,
                gross_margin: r.gross_margin,
                industry: r.industry,
            },
            gap: r.gap,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ScoreRow {
    ticker: String,
    seg1: f64,
    seg2: f64,
    seg3: f64,
    seg4: f64,
    raw_score: f64,
    direction: f64,
    adjusted_score: f64,
    eps_change_90d: Option<f64>,
}

fn as_i32(v: Option<u32>) -> Option<i32> {
    v.and_then(|n| i32::try_from(n).ok())
}

fn rank_map(rows: Vec<(String, i32)>) -> BTreeMap<String, u32> {
    rows.into_iter()
        .filter_map(|(t, r)| u32::try_from(r).ok().map(|r| (t, r)))
        .collect()
}

#[async_trait::async_trait]
impl RankStore for PgRankStore {
    async fn try_lock_date(&self, as_of_date: NaiveDate) -> anyhow::Result<bool> {
        let mut held = self.held.lock().await;
        if held.contains_key(&as_of_date) {
            return Ok(false);
        }
        let mut conn = self
            .pool
            .acquire()
            .await
            .context("acquire lock connection failed")?;
        let acquired = lock::try_acquire_as_of_date_lock(&mut conn, as_of_date).await?;
        if acquired {
            held.insert(as_of_date, conn);
        }
        Ok(acquired)
    }

    async fn release_date(&self, as_of_date: NaiveDate) -> anyhow::Result<()> {
        let conn = self.held.lock().await.remove(&as_of_date);
        let Some(mut conn) = conn else {
            return Ok(());
        };
        if let Err(err) = lock::release_as_of_date_lock(&mut conn, as_of_date).await {
            // Closing the session drops its advisory locks; a pooled
            // connection would keep the date locked.
            if let Err(close_err) = conn.close().await {
                tracing::warn!(%as_of_date, error = %close_err, "close lock connection failed");
            }
            return Err(err);
        }
        Ok(())
    }

    async fn replace_snapshots(
        &self,
        as_of_date: NaiveDate,
        items: &[TickerSnapshot],
    ) -> anyhow::Result<u64> {
        let mut tx = self.pool.begin().await.context("begin transaction failed")?;
        sqlx::query("DELETE FROM ticker_snapshots WHERE as_of_date = $1")
            .persistent(false)
            .bind(as_of_date)
            .execute(&mut *tx)
            .await
            .context("clear ticker_snapshots failed")?;

        let mut affected: u64 = 0;

        for (batch_idx, chunk) in items.chunks(self.batch_size).enumerate() {
            let t0 = std::time::Instant::now();
            let mut qb = sqlx::QueryBuilder::new(
                "INSERT INTO ticker_snapshots (as_of_date, ticker, eps_current, eps_7d, eps_30d, \
                 eps_60d, eps_90d, price, ma60, ma120, revenue_growth, analyst_count, \
                 revisions_up_30d, revisions_down_30d, operating_margin, gross_margin, industry, gap) ",
            );
            qb.push_values(chunk, |mut b, item| {
                let e = &item.estimates;
                let p = &item.price;
                let f = &item.fundamentals;
                b.push_bind(as_of_date)
                    .push_bind(item.ticker.trim().to_string())
                    .push_bind(e.current)
                    .push_bind(e.d7)
                    .push_bind(e.d30)
                    .push_bind(e.d60)
                    .push_bind(e.d90)
                    .push_bind(p.price)
                    .push_bind(p.ma60)
                    .push_bind(p.ma120)
                    .push_bind(f.revenue_growth)
                    .push_bind(as_i32(f.analyst_count))
                    .push_bind(as_i32(f.revisions_up_30d))
                    .push_bind(as_i32(f.revisions_down_30d))
                    .push_bind(f.operating_margin)
                    .push_bind(f.gross_margin)
                    .push_bind(f.industry.clone())
                    .push_bind(item.gap);
            });
            let res = qb
                .build()
                .persistent(false)
                .execute(&mut *tx)
                .await
                .context("batch insert ticker_snapshots failed")?;
            affected += res.rows_affected();

            tracing::debug!(
                %as_of_date,
                batch_idx,
                batch_size = chunk.len(),
                elapsed_ms = t0.elapsed().as_millis(),
                "ticker_snapshots batch insert"
            );
        }

        tx.commit().await.context("commit transaction failed")?;
        Ok(affected)
    }

    async fn load_snapshots(&self, as_of_date: NaiveDate) -> anyhow::Result<Vec<TickerSnapshot>> {
        let rows: Vec<SnapshotRow> = sqlx::query_as(
            "SELECT ticker, eps_current, eps_7d, eps_30d, eps_60d, eps_90d, price, ma60, ma120, \
             revenue_growth, analyst_count, revisions_up_30d, revisions_down_30d, \
             operating_margin, gross_margin, industry, gap \
             FROM ticker_snapshots WHERE as_of_date = $1 ORDER BY ticker ASC",
        )
        .persistent(false)
        .bind(as_of_date)
        .fetch_all(&self.pool)
        .await
        .context("select ticker_snapshots failed")?;
        Ok(rows.into_iter().map(TickerSnapshot::from).collect())
    }

    async fn snapshot_dates(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> anyhow::Result<Vec<NaiveDate>> {
        let rows: Vec<(NaiveDate,)> = sqlx::query_as(
            "SELECT DISTINCT as_of_date FROM ticker_snapshots \
             WHERE as_of_date BETWEEN $1 AND $2 ORDER BY as_of_date ASC",
        )
        .persistent(false)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await
        .context("select snapshot dates failed")?;
        Ok(rows.into_iter().map(|r| r.0).collect())
    }

    async fn replace_scores(
        &self,
        as_of_date: NaiveDate,
        scores: &BTreeMap<String, ScoreRecord>,
    ) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await.context("begin transaction failed")?;
        sqlx::query("DELETE FROM ticker_scores WHERE as_of_date = $1")
            .persistent(false)
            .bind(as_of_date)
            .execute(&mut *tx)
            .await
            .context("clear ticker_scores failed")?;

        let rows: Vec<(&String, &ScoreRecord)> = scores.iter().collect();
        for chunk in rows.chunks(self.batch_size) {
            let mut qb = sqlx::QueryBuilder::new(
                "INSERT INTO ticker_scores (as_of_date, ticker, seg1, seg2, seg3, seg4, \
                 raw_score, direction, adjusted_score, eps_change_90d) ",
            );
            qb.push_values(chunk, |mut b, (ticker, s)| {
                b.push_bind(as_of_date)
                    .push_bind((*ticker).clone())
                    .push_bind(s.seg1)
                    .push_bind(s.seg2)
                    .push_bind(s.seg3)
                    .push_bind(s.seg4)
                    .push_bind(s.raw_score)
                    .push_bind(s.direction)
                    .push_bind(s.adjusted_score)
                    .push_bind(s.eps_change_90d);
            });
            qb.build()
                .persistent(false)
                .execute(&mut *tx)
                .await
                .context("insert ticker_scores failed")?;
        }

        tx.commit().await.context("commit transaction failed")?;
        Ok(())
    }

    async fn load_scores(
        &self,
        as_of_date: NaiveDate,
    ) -> anyhow::Result<BTreeMap<String, ScoreRecord>> {
        let rows: Vec<ScoreRow> = sqlx::query_as(
            "SELECT ticker, seg1, seg2, seg3, seg4, raw_score, direction, adjusted_score, \
             eps_change_90d FROM ticker_scores WHERE as_of_date = $1",
        )
        .persistent(false)
        .bind(as_of_date)
        .fetch_all(&self.pool)
        .await
        .context("select ticker_scores failed")?;

        Ok(rows
            .into_iter()
            .map(|r| {
                (
                    r.ticker,
                    ScoreRecord {
                        seg1: r.seg1,
                        seg2: r.seg2,
                        seg3: r.seg3,
                        seg4: r.seg4,
                        raw_score: r.raw_score,
                        direction: r.direction,
                        adjusted_score: r.adjusted_score,
                        eps_change_90d: r.eps_change_90d,
                    },
                )
            })
            .collect())
    }

    async fn replace_composite_ranks(
        &self,
        as_of_date: NaiveDate,
        ranks: &BTreeMap<String, u32>,
    ) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await.context("begin transaction failed")?;
        sqlx::query("DELETE FROM ticker_ranks WHERE as_of_date = $1")
            .persistent(false)
            .bind(as_of_date)
            .execute(&mut *tx)
            .await
            .context("clear ticker_ranks failed")?;

        let rows: Vec<(&String, &u32)> = ranks.iter().collect();
        for chunk in rows.chunks(self.batch_size) {
            let mut qb = sqlx::QueryBuilder::new(
                "INSERT INTO ticker_ranks (as_of_date, ticker, composite_rank, part2_rank) ",
            );
            qb.push_values(chunk, |mut b, (ticker, rank)| {
                b.push_bind(as_of_date)
                    .push_bind((*ticker).clone())
                    .push_bind(**rank as i32)
                    .push_bind(None::<i32>);
            });
            qb.build()
                .persistent(false)
                .execute(&mut *tx)
                .await
                .context("insert ticker_ranks failed")?;
        }

        tx.commit().await.context("commit transaction failed")?;
        Ok(())
    }

    async fn load_composite_ranks(&self, as_of_date: NaiveDate) -> anyhow::Result<CompositeRanks> {
        let rows: Vec<(String, i32)> = sqlx::query_as(
            "SELECT ticker, composite_rank FROM ticker_ranks \
             WHERE as_of_date = $1 AND composite_rank IS NOT NULL",
        )
        .persistent(false)
        .bind(as_of_date)
        .fetch_all(&self.pool)
        .await
        .context("select composite ranks failed")?;
        Ok(CompositeRanks {
            as_of_date,
            ranks: rank_map(rows),
        })
    }

    async fn ranked_dates_after(&self, after: NaiveDate) -> anyhow::Result<Vec<NaiveDate>> {
        let rows: Vec<(NaiveDate,)> = sqlx::query_as(
            "SELECT DISTINCT as_of_date FROM ticker_ranks \
             WHERE as_of_date > $1 AND composite_rank IS NOT NULL \
             ORDER BY as_of_date ASC",
        )
        .persistent(false)
        .bind(after)
        .fetch_all(&self.pool)
        .await
        .context("select ranked dates failed")?;
        Ok(rows.into_iter().map(|r| r.0).collect())
    }

    async fn composite_history(
        &self,
        before: NaiveDate,
        n: usize,
    ) -> anyhow::Result<Vec<CompositeRanks>> {
        let mut out = Vec::new();
        for date in self.dates_with("composite_rank", before, n).await? {
            out.push(self.load_composite_ranks(date).await?);
        }
        Ok(out)
    }

    async fn replace_part2_ranks(
        &self,
        as_of_date: NaiveDate,
        ranks: &BTreeMap<String, u32>,
    ) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await.context("begin transaction failed")?;
        sqlx::query(
            "UPDATE ticker_ranks SET part2_rank = NULL, computed_at = now() WHERE as_of_date = $1",
        )
        .bind(as_of_date)
        .execute(&mut *tx)
        .await
        .context("clear part2 ranks failed")?;

        for (ticker, rank) in ranks {
            let res = sqlx::query(
                "UPDATE ticker_ranks SET part2_rank = $3 \
                 WHERE as_of_date = $1 AND ticker = $2 AND composite_rank IS NOT NULL",
            )
            .persistent(false)
            .bind(as_of_date)
            .bind(ticker)
            .bind(*rank as i32)
            .execute(&mut *tx)
            .await
            .context("update part2 rank failed")?;
            anyhow::ensure!(
                res.rows_affected() == 1,
                "part2 rank for {ticker} on {as_of_date} has no composite rank"
            );
        }

        tx.commit().await.context("commit transaction failed")?;
        Ok(())
    }

    async fn load_part2_ranks(&self, as_of_date: NaiveDate) -> anyhow::Result<Part2Ranks> {
        let rows: Vec<(String, i32)> = sqlx::query_as(
            "SELECT ticker, part2_rank FROM ticker_ranks \
             WHERE as_of_date = $1 AND part2_rank IS NOT NULL",
        )
        .persistent(false)
        .bind(as_of_date)
        .fetch_all(&self.pool)
        .await
        .context("select part2 ranks failed")?;
        Ok(Part2Ranks {
            as_of_date,
            ranks: rank_map(rows),
        })
    }

    async fn part2_history(
        &self,
        before: NaiveDate,
        n: usize,
    ) -> anyhow::Result<Vec<Part2Ranks>> {
        let mut out = Vec::new();
        for date in self.dates_with("part2_rank", before, n).await? {
            out.push(self.load_part2_ranks(date).await?);
        }
        Ok(out)
    }

    async fn clear_ranks(&self, as_of_date: NaiveDate) -> anyhow::Result<u64> {
        let mut tx = self.pool.begin().await.context("begin transaction failed")?;
        let mut cleared: u64 = 0;
        for table in ["ticker_ranks", "shortlists"] {
            let sql = format!("DELETE FROM {table} WHERE as_of_date = $1");
            let res = sqlx::query(&sql)
                .persistent(false)
                .bind(as_of_date)
                .execute(&mut *tx)
                .await
                .with_context(|| format!("clear {table} failed"))?;
            cleared += res.rows_affected();
        }
        tx.commit().await.context("commit transaction failed")?;
        Ok(cleared)
    }

    async fn clear_derived(&self, from: NaiveDate, to: NaiveDate) -> anyhow::Result<u64> {
        let mut tx = self.pool.begin().await.context("begin transaction failed")?;
        let mut cleared: u64 = 0;
        for table in ["ticker_scores", "ticker_ranks", "shortlists"] {
            let sql = format!("DELETE FROM {table} WHERE as_of_date BETWEEN $1 AND $2");
            let res = sqlx::query(&sql)
                .persistent(false)
                .bind(from)
                .bind(to)
                .execute(&mut *tx)
                .await
                .with_context(|| format!("clear {table} failed"))?;
            cleared += res.rows_affected();
        }
        tx.commit().await.context("commit transaction failed")?;
        Ok(cleared)
    }

    async fn replace_shortlist(&self, shortlist: &Shortlist) -> anyhow::Result<()> {
        let payload = serde_json::to_value(shortlist).context("serialize shortlist failed")?;
        sqlx::query(
            "INSERT INTO shortlists (as_of_date, cold_start, payload) VALUES ($1, $2, $3) \
             ON CONFLICT (as_of_date) DO UPDATE \
             SET cold_start = EXCLUDED.cold_start, payload = EXCLUDED.payload, generated_at = now()",
        )
        .persistent(false)
        .bind(shortlist.as_of_date)
        .bind(shortlist.cold_start)
        .bind(payload)
        .execute(&self.pool)
        .await
        .context("upsert shortlists failed")?;
        Ok(())
    }

    async fn load_shortlist(
        &self,
        as_of_date: Option<NaiveDate>,
    ) -> anyhow::Result<Option<Shortlist>> {
        let row: Option<(serde_json::Value,)> = match as_of_date {
            Some(d) => {
                sqlx::query_as("SELECT payload FROM shortlists WHERE as_of_date = $1")
                    .persistent(false)
                    .bind(d)
                    .fetch_optional(&self.pool)
                    .await?
            }
            None => {
                sqlx::query_as(
                    "SELECT payload FROM shortlists ORDER BY as_of_date DESC LIMIT 1",
                )
                .persistent(false)
                .fetch_optional(&self.pool)
                .await?
            }
        };

        row.map(|(payload,)| {
            serde_json::from_value::<Shortlist>(payload).context("invalid shortlist payload in DB")
        })
        .transpose()
    }

    async fn record_run(&self, run: &RunRecord) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO ranking_runs (id, mode, from_date, to_date, started_at, finished_at, status, summary) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .persistent(false)
        .bind(run.id)
        .bind(&run.mode)
        .bind(run.from_date)
        .bind(run.to_date)
        .bind(run.started_at)
        .bind(run.finished_at)
        .bind(&run.status)
        .bind(&run.summary)
        .execute(&self.pool)
        .await
        .context("insert ranking_runs failed")?;
        Ok(())
    }
}
