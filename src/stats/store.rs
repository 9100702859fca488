//! Statistic Aggregate Store
//! Mission: Keyed persistence with insert-vs-replace semantics that keep
//! backfill atomic and duplicate races detectable

use crate::db::Db;
use crate::errors::classify_sqlite;
use crate::stats::aggregate::{StatisticAggregate, StatisticFact};
use crate::stats::timekey::{Granularity, TimeKey};
use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

#[derive(Clone)]
pub struct StatisticStore {
    db: Db,
}

impl StatisticStore {
    pub fn new(db: Db) -> Result<Self> {
        {
            let conn = db.lock();
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS statistic_aggregates (
                    subject_id TEXT NOT NULL,
                    time_type TEXT NOT NULL,
                    time_key TEXT NOT NULL,
                    period_start INTEGER NOT NULL,
                    statistic_id TEXT NOT NULL,
                    is_completed INTEGER NOT NULL DEFAULT 0,
                    completed_at INTEGER,
                    charge_kwh REAL NOT NULL DEFAULT 0,
                    discharge_kwh REAL NOT NULL DEFAULT 0,
                    earnings REAL NOT NULL DEFAULT 0,
                    carbon_reduction REAL NOT NULL DEFAULT 0,
                    PRIMARY KEY (subject_id, time_type, time_key)
                );
                CREATE INDEX IF NOT EXISTS idx_stats_subject_period
                    ON statistic_aggregates(subject_id, time_type, period_start);",
            )
            .context("create statistic_aggregates schema")?;
        }
        Ok(Self { db })
    }

    pub fn get(
        &self,
        subject_id: &str,
        granularity: Granularity,
        time_key: &str,
    ) -> Result<Option<StatisticAggregate>> {
        let conn = self.db.lock();
        Self::get_tx(&conn, subject_id, granularity, time_key)
    }

    pub fn get_tx(
        conn: &Connection,
        subject_id: &str,
        granularity: Granularity,
        time_key: &str,
    ) -> Result<Option<StatisticAggregate>> {
        let row = conn
            .query_row(
                "SELECT subject_id, time_type, time_key, period_start, statistic_id,
                        is_completed, completed_at,
                        charge_kwh, discharge_kwh, earnings, carbon_reduction
                 FROM statistic_aggregates
                 WHERE subject_id = ?1 AND time_type = ?2 AND time_key = ?3",
                params![subject_id, granularity.as_str(), time_key],
                row_to_aggregate,
            )
            .optional()?;
        Ok(row)
    }

    /// Plain insert; a unique-key violation surfaces as `Conflict` so the
    /// non-recalculate path can detect a lost duplicate-save race.
    pub fn insert_new_tx(conn: &Connection, agg: &StatisticAggregate) -> Result<()> {
        conn.execute(
            "INSERT INTO statistic_aggregates
                 (subject_id, time_type, time_key, period_start, statistic_id,
                  is_completed, completed_at, charge_kwh, discharge_kwh, earnings, carbon_reduction)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                agg.subject_id,
                agg.time_type.as_str(),
                agg.time_key,
                agg.period_start.timestamp(),
                agg.statistic_id,
                agg.is_completed as i64,
                agg.completed_at.map(|t| t.timestamp()),
                agg.fact.charge_kwh,
                agg.fact.discharge_kwh,
                agg.fact.earnings,
                agg.fact.carbon_reduction,
            ],
        )
        .map_err(classify_sqlite)?;
        Ok(())
    }

    /// Replace-on-key upsert for the backfill path: the whole fact and the
    /// completion stamp swap atomically.
    pub fn upsert_tx(conn: &Connection, agg: &StatisticAggregate) -> Result<()> {
        conn.execute(
            "INSERT INTO statistic_aggregates
                 (subject_id, time_type, time_key, period_start, statistic_id,
                  is_completed, completed_at, charge_kwh, discharge_kwh, earnings, carbon_reduction)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(subject_id, time_type, time_key) DO UPDATE SET
                 period_start = excluded.period_start,
                 statistic_id = excluded.statistic_id,
                 is_completed = excluded.is_completed,
                 completed_at = excluded.completed_at,
                 charge_kwh = excluded.charge_kwh,
                 discharge_kwh = excluded.discharge_kwh,
                 earnings = excluded.earnings,
                 carbon_reduction = excluded.carbon_reduction",
            params![
                agg.subject_id,
                agg.time_type.as_str(),
                agg.time_key,
                agg.period_start.timestamp(),
                agg.statistic_id,
                agg.is_completed as i64,
                agg.completed_at.map(|t| t.timestamp()),
                agg.fact.charge_kwh,
                agg.fact.discharge_kwh,
                agg.fact.earnings,
                agg.fact.carbon_reduction,
            ],
        )?;
        Ok(())
    }

    /// Children of a parent period: all aggregates of `granularity` with
    /// period_start in `[start, end)`, ascending.
    pub fn list_range(
        &self,
        subject_id: &str,
        granularity: Granularity,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<StatisticAggregate>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT subject_id, time_type, time_key, period_start, statistic_id,
                    is_completed, completed_at,
                    charge_kwh, discharge_kwh, earnings, carbon_reduction
             FROM statistic_aggregates
             WHERE subject_id = ?1 AND time_type = ?2
               AND period_start >= ?3 AND period_start < ?4
             ORDER BY period_start ASC",
        )?;
        let rows = stmt.query_map(
            params![
                subject_id,
                granularity.as_str(),
                start.timestamp(),
                end.timestamp()
            ],
            row_to_aggregate,
        )?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Children of `parent`, bounded by its canonical period.
    pub fn list_children(&self, subject_id: &str, parent: &TimeKey) -> Result<Vec<StatisticAggregate>> {
        let child = match parent.granularity.child() {
            Some(g) => g,
            None => return Ok(Vec::new()),
        };
        self.list_range(subject_id, child, parent.period_start, parent.period_end())
    }

    pub fn count(&self, granularity: Granularity) -> Result<i64> {
        let conn = self.db.lock();
        let n = conn.query_row(
            "SELECT COUNT(*) FROM statistic_aggregates WHERE time_type = ?1",
            params![granularity.as_str()],
            |r| r.get(0),
        )?;
        Ok(n)
    }
}

fn row_to_aggregate(row: &Row<'_>) -> rusqlite::Result<StatisticAggregate> {
    let time_type: String = row.get(1)?;
    let granularity = Granularity::parse(&time_type).map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            1,
            rusqlite::types::Type::Text,
            format!("bad time_type {}", time_type).into(),
        )
    })?;
    Ok(StatisticAggregate {
        subject_id: row.get(0)?,
        time_type: granularity,
        time_key: row.get(2)?,
        period_start: epoch(row.get(3)?),
        statistic_id: row.get(4)?,
        is_completed: row.get::<_, i64>(5)? != 0,
        completed_at: row.get::<_, Option<i64>>(6)?.map(epoch),
        fact: StatisticFact {
            charge_kwh: row.get(7)?,
            discharge_kwh: row.get(8)?,
            earnings: row.get(9)?,
            carbon_reduction: row.get(10)?,
        },
    })
}

fn epoch(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_default()
}
