//! Strategy Stores
//! Mission: Strategies, their calendars, and the append-only run trail

use crate::db::Db;
use crate::strategy::models::{RunOutcome, Strategy, StrategyCalendar, StrategyRun, StrategyTemplate};
use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

#[derive(Clone)]
pub struct StrategyStore {
    db: Db,
}

impl StrategyStore {
    pub fn new(db: Db) -> Result<Self> {
        {
            let conn = db.lock();
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS strategies (
                    id TEXT PRIMARY KEY,
                    tenant_id TEXT NOT NULL,
                    station_id TEXT NOT NULL,
                    name TEXT NOT NULL,
                    template_json TEXT NOT NULL,
                    auto_enabled INTEGER NOT NULL DEFAULT 0
                );
                CREATE TABLE IF NOT EXISTS strategy_calendars (
                    strategy_id TEXT NOT NULL,
                    weekday INTEGER NOT NULL,
                    start_minute INTEGER NOT NULL,
                    end_minute INTEGER NOT NULL,
                    enabled INTEGER NOT NULL DEFAULT 1,
                    PRIMARY KEY (strategy_id, weekday)
                );
                CREATE TABLE IF NOT EXISTS strategy_runs (
                    strategy_id TEXT NOT NULL,
                    ts INTEGER NOT NULL,
                    outcome TEXT NOT NULL,
                    detail TEXT,
                    command_id TEXT,
                    PRIMARY KEY (strategy_id, ts)
                );",
            )
            .context("create strategy schema")?;
        }
        Ok(Self { db })
    }

    pub fn upsert(&self, strategy: &Strategy) -> Result<()> {
        let conn = self.db.lock();
        conn.execute(
            "INSERT INTO strategies (id, tenant_id, station_id, name, template_json, auto_enabled)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 template_json = excluded.template_json,
                 auto_enabled = excluded.auto_enabled",
            params![
                strategy.id,
                strategy.tenant_id,
                strategy.station_id,
                strategy.name,
                strategy.template.encode(),
                strategy.auto_enabled as i64,
            ],
        )?;
        Ok(())
    }

    pub fn list_auto_enabled(&self) -> Result<Vec<Strategy>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, tenant_id, station_id, name, template_json, auto_enabled
             FROM strategies WHERE auto_enabled = 1 ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, i64>(5)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (id, tenant_id, station_id, name, template_json, auto_enabled) = row?;
            let template = match StrategyTemplate::decode(&template_json) {
                Ok(t) => t,
                Err(_) => continue, // unparseable templates are skipped, not fatal
            };
            out.push(Strategy {
                id,
                tenant_id,
                station_id,
                name,
                template,
                auto_enabled: auto_enabled != 0,
            });
        }
        Ok(out)
    }

    pub fn set_calendar(&self, calendar: &StrategyCalendar) -> Result<()> {
        let conn = self.db.lock();
        conn.execute(
            "INSERT INTO strategy_calendars (strategy_id, weekday, start_minute, end_minute, enabled)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(strategy_id, weekday) DO UPDATE SET
                 start_minute = excluded.start_minute,
                 end_minute = excluded.end_minute,
                 enabled = excluded.enabled",
            params![
                calendar.strategy_id,
                calendar.weekday as i64,
                calendar.start_minute as i64,
                calendar.end_minute as i64,
                calendar.enabled as i64,
            ],
        )?;
        Ok(())
    }

    pub fn calendar_for(&self, strategy_id: &str, weekday: u8) -> Result<Option<StrategyCalendar>> {
        let conn = self.db.lock();
        let row = conn
            .query_row(
                "SELECT start_minute, end_minute, enabled FROM strategy_calendars
                 WHERE strategy_id = ?1 AND weekday = ?2",
                params![strategy_id, weekday as i64],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                },
            )
            .optional()?;
        Ok(row.map(|(start, end, enabled)| StrategyCalendar {
            strategy_id: strategy_id.to_string(),
            weekday,
            start_minute: start as u32,
            end_minute: end as u32,
            enabled: enabled != 0,
        }))
    }

    pub fn append_run(&self, run: &StrategyRun) -> Result<()> {
        let conn = self.db.lock();
        conn.execute(
            "INSERT OR REPLACE INTO strategy_runs (strategy_id, ts, outcome, detail, command_id)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                run.strategy_id,
                run.ts.timestamp(),
                run.outcome.as_str(),
                run.detail,
                run.command_id.map(|id| id.to_string()),
            ],
        )?;
        Ok(())
    }

    pub fn list_runs(&self, strategy_id: &str, limit: usize) -> Result<Vec<StrategyRun>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT ts, outcome, detail, command_id FROM strategy_runs
             WHERE strategy_id = ?1 ORDER BY ts DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![strategy_id, limit as i64], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, Option<String>>(3)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (ts, outcome, detail, command_id) = row?;
            out.push(StrategyRun {
                strategy_id: strategy_id.to_string(),
                ts: epoch(ts),
                outcome: RunOutcome::parse(&outcome)
                    .unwrap_or(RunOutcome::Error),
                detail,
                command_id: command_id.and_then(|s| Uuid::parse_str(&s).ok()),
            });
        }
        Ok(out)
    }
}

fn epoch(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_default()
}
