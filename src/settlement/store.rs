//! Tariff & Settlement Stores
//! Mission: Plan lookup by station and month, versioned settlement upserts

use crate::db::Db;
use crate::settlement::tariff::{TariffMode, TariffPlan, TariffRule};
use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

#[derive(Clone)]
pub struct TariffStore {
    db: Db,
}

impl TariffStore {
    pub fn new(db: Db) -> Result<Self> {
        {
            let conn = db.lock();
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS tariff_plans (
                    id TEXT PRIMARY KEY,
                    tenant_id TEXT NOT NULL,
                    station_id TEXT NOT NULL,
                    month TEXT,
                    mode TEXT NOT NULL,
                    currency TEXT NOT NULL,
                    rules_json TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_tariff_station_month
                    ON tariff_plans(station_id, month);",
            )
            .context("create tariff_plans schema")?;
        }
        Ok(Self { db })
    }

    pub fn upsert(&self, plan: &TariffPlan) -> Result<()> {
        plan.validate()?;
        let rules_json = serde_json::to_string(&plan.rules).context("encode tariff rules")?;
        let conn = self.db.lock();
        conn.execute(
            "INSERT INTO tariff_plans (id, tenant_id, station_id, month, mode, currency, rules_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET
                 month = excluded.month,
                 mode = excluded.mode,
                 currency = excluded.currency,
                 rules_json = excluded.rules_json",
            params![
                plan.id,
                plan.tenant_id,
                plan.station_id,
                plan.month,
                plan.mode.as_str(),
                plan.currency,
                rules_json,
            ],
        )?;
        Ok(())
    }

    /// Active plan for a station and month key: a month-pinned plan wins,
    /// otherwise the station default.
    pub fn active_plan(
        &self,
        tenant_id: &str,
        station_id: &str,
        month: &str,
    ) -> Result<Option<TariffPlan>> {
        let conn = self.db.lock();
        let row = conn
            .query_row(
                "SELECT id, tenant_id, station_id, month, mode, currency, rules_json
                 FROM tariff_plans
                 WHERE tenant_id = ?1 AND station_id = ?2
                   AND (month = ?3 OR month IS NULL)
                 ORDER BY month IS NULL
                 LIMIT 1",
                params![tenant_id, station_id, month],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, String>(6)?,
                    ))
                },
            )
            .optional()?;

        let Some((id, tenant_id, station_id, month, mode, currency, rules_json)) = row else {
            return Ok(None);
        };
        let rules: Vec<TariffRule> =
            serde_json::from_str(&rules_json).context("decode tariff rules")?;
        Ok(Some(TariffPlan {
            id,
            tenant_id,
            station_id,
            month,
            mode: TariffMode::parse(&mode)?,
            currency,
            rules,
        }))
    }
}

pub const SETTLEMENT_CALCULATED: &str = "CALCULATED";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settlement {
    pub tenant_id: String,
    pub station_id: String,
    pub day_start: DateTime<Utc>,
    pub energy_kwh: f64,
    pub amount: f64,
    pub currency: String,
    pub status: String,
    pub version: i64,
}

#[derive(Clone)]
pub struct SettlementStore {
    db: Db,
}

impl SettlementStore {
    pub fn new(db: Db) -> Result<Self> {
        {
            let conn = db.lock();
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS settlements (
                    tenant_id TEXT NOT NULL,
                    station_id TEXT NOT NULL,
                    day_start INTEGER NOT NULL,
                    energy_kwh REAL NOT NULL,
                    amount REAL NOT NULL,
                    currency TEXT NOT NULL,
                    status TEXT NOT NULL,
                    version INTEGER NOT NULL,
                    PRIMARY KEY (tenant_id, station_id, day_start)
                );",
            )
            .context("create settlements schema")?;
        }
        Ok(Self { db })
    }

    /// Upsert the day's settlement; the version increments on every
    /// recalculation. Returns the resulting version.
    pub fn upsert_calculated_tx(
        conn: &Connection,
        tenant_id: &str,
        station_id: &str,
        day_start: DateTime<Utc>,
        energy_kwh: f64,
        amount: f64,
        currency: &str,
    ) -> Result<i64> {
        conn.execute(
            "INSERT INTO settlements
                 (tenant_id, station_id, day_start, energy_kwh, amount, currency, status, version)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1)
             ON CONFLICT(tenant_id, station_id, day_start) DO UPDATE SET
                 energy_kwh = excluded.energy_kwh,
                 amount = excluded.amount,
                 currency = excluded.currency,
                 status = excluded.status,
                 version = version + 1",
            params![
                tenant_id,
                station_id,
                day_start.timestamp(),
                energy_kwh,
                amount,
                currency,
                SETTLEMENT_CALCULATED,
            ],
        )?;
        let version: i64 = conn.query_row(
            "SELECT version FROM settlements
             WHERE tenant_id = ?1 AND station_id = ?2 AND day_start = ?3",
            params![tenant_id, station_id, day_start.timestamp()],
            |row| row.get(0),
        )?;
        Ok(version)
    }

    pub fn get(
        &self,
        tenant_id: &str,
        station_id: &str,
        day_start: DateTime<Utc>,
    ) -> Result<Option<Settlement>> {
        let conn = self.db.lock();
        let row = conn
            .query_row(
                "SELECT tenant_id, station_id, day_start, energy_kwh, amount, currency, status, version
                 FROM settlements
                 WHERE tenant_id = ?1 AND station_id = ?2 AND day_start = ?3",
                params![tenant_id, station_id, day_start.timestamp()],
                row_to_settlement,
            )
            .optional()?;
        Ok(row)
    }

    pub fn list_range(
        &self,
        tenant_id: &str,
        station_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Settlement>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT tenant_id, station_id, day_start, energy_kwh, amount, currency, status, version
             FROM settlements
             WHERE tenant_id = ?1 AND station_id = ?2 AND day_start >= ?3 AND day_start < ?4
             ORDER BY day_start ASC",
        )?;
        let rows = stmt.query_map(
            params![tenant_id, station_id, from.timestamp(), to.timestamp()],
            row_to_settlement,
        )?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

fn row_to_settlement(row: &rusqlite::Row<'_>) -> rusqlite::Result<Settlement> {
    Ok(Settlement {
        tenant_id: row.get(0)?,
        station_id: row.get(1)?,
        day_start: epoch(row.get(2)?),
        energy_kwh: row.get(3)?,
        amount: row.get(4)?,
        currency: row.get(5)?,
        status: row.get(6)?,
        version: row.get(7)?,
    })
}

fn epoch(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_default()
}
