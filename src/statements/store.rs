use crate::db::Db;
use crate::statements::models::{Statement, StatementItem, StatementStatus};
use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

#[derive(Clone)]
pub struct StatementStore {
    db: Db,
}

impl StatementStore {
    pub fn new(db: Db) -> Result<Self> {
        {
            let conn = db.lock();
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS statements (
                    id TEXT PRIMARY KEY,
                    tenant_id TEXT NOT NULL,
                    station_id TEXT NOT NULL,
                    month TEXT NOT NULL,
                    category TEXT NOT NULL,
                    status TEXT NOT NULL,
                    version INTEGER NOT NULL,
                    total_energy_kwh REAL NOT NULL,
                    total_amount REAL NOT NULL,
                    currency TEXT NOT NULL,
                    snapshot_hash TEXT,
                    frozen_at INTEGER,
                    void_reason TEXT,
                    voided_at INTEGER,
                    created_at INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_statements_key
                    ON statements(tenant_id, station_id, month, category, version DESC);
                CREATE TABLE IF NOT EXISTS statement_items (
                    statement_id TEXT NOT NULL,
                    day_start INTEGER NOT NULL,
                    energy_kwh REAL NOT NULL,
                    amount REAL NOT NULL,
                    currency TEXT NOT NULL,
                    PRIMARY KEY (statement_id, day_start)
                );",
            )
            .context("create statements schema")?;
        }
        Ok(Self { db })
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    /// Current (draft or frozen) statement for the key, highest version.
    pub fn find_current(
        &self,
        tenant_id: &str,
        station_id: &str,
        month: &str,
        category: &str,
    ) -> Result<Option<Statement>> {
        let conn = self.db.lock();
        let row = conn
            .query_row(
                &format!(
                    "SELECT {} FROM statements
                     WHERE tenant_id = ?1 AND station_id = ?2 AND month = ?3 AND category = ?4
                       AND status IN ('draft', 'frozen')
                     ORDER BY version DESC LIMIT 1",
                    STATEMENT_COLUMNS
                ),
                params![tenant_id, station_id, month, category],
                row_to_statement,
            )
            .optional()?;
        Ok(row)
    }

    pub fn max_version(
        &self,
        tenant_id: &str,
        station_id: &str,
        month: &str,
        category: &str,
    ) -> Result<i64> {
        let conn = self.db.lock();
        let version: Option<i64> = conn.query_row(
            "SELECT MAX(version) FROM statements
             WHERE tenant_id = ?1 AND station_id = ?2 AND month = ?3 AND category = ?4",
            params![tenant_id, station_id, month, category],
            |row| row.get(0),
        )?;
        Ok(version.unwrap_or(0))
    }

    pub fn insert_with_items_tx(
        conn: &Connection,
        statement: &Statement,
        items: &[StatementItem],
    ) -> Result<()> {
        conn.execute(
            "INSERT INTO statements
                 (id, tenant_id, station_id, month, category, status, version,
                  total_energy_kwh, total_amount, currency, snapshot_hash,
                  frozen_at, void_reason, voided_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                statement.id.to_string(),
                statement.tenant_id,
                statement.station_id,
                statement.month,
                statement.category,
                statement.status.as_str(),
                statement.version,
                statement.total_energy_kwh,
                statement.total_amount,
                statement.currency,
                statement.snapshot_hash,
                statement.frozen_at.map(|t| t.timestamp()),
                statement.void_reason,
                statement.voided_at.map(|t| t.timestamp()),
                statement.created_at.timestamp(),
            ],
        )?;
        let mut stmt = conn.prepare_cached(
            "INSERT INTO statement_items (statement_id, day_start, energy_kwh, amount, currency)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )?;
        for item in items {
            stmt.execute(params![
                item.statement_id.to_string(),
                item.day_start.timestamp(),
                item.energy_kwh,
                item.amount,
                item.currency,
            ])?;
        }
        Ok(())
    }

    pub fn get(&self, tenant_id: &str, id: Uuid) -> Result<Option<Statement>> {
        let conn = self.db.lock();
        let row = conn
            .query_row(
                &format!(
                    "SELECT {} FROM statements WHERE tenant_id = ?1 AND id = ?2",
                    STATEMENT_COLUMNS
                ),
                params![tenant_id, id.to_string()],
                row_to_statement,
            )
            .optional()?;
        Ok(row)
    }

    /// Items sorted by day; the order the snapshot hash is defined over.
    pub fn items(&self, statement_id: Uuid) -> Result<Vec<StatementItem>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT statement_id, day_start, energy_kwh, amount, currency
             FROM statement_items WHERE statement_id = ?1
             ORDER BY day_start ASC",
        )?;
        let rows = stmt.query_map(params![statement_id.to_string()], |row| {
            let id: String = row.get(0)?;
            Ok(StatementItem {
                statement_id: Uuid::parse_str(&id).unwrap_or_default(),
                day_start: epoch(row.get(1)?),
                energy_kwh: row.get(2)?,
                amount: row.get(3)?,
                currency: row.get(4)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn freeze(&self, id: Uuid, snapshot_hash: &str, now: DateTime<Utc>) -> Result<()> {
        let conn = self.db.lock();
        conn.execute(
            "UPDATE statements SET status = 'frozen', snapshot_hash = ?2, frozen_at = ?3
             WHERE id = ?1 AND status = 'draft'",
            params![id.to_string(), snapshot_hash, now.timestamp()],
        )?;
        Ok(())
    }

    pub fn void(&self, id: Uuid, reason: &str, now: DateTime<Utc>) -> Result<()> {
        let conn = self.db.lock();
        conn.execute(
            "UPDATE statements SET status = 'voided', void_reason = ?2, voided_at = ?3
             WHERE id = ?1 AND status != 'voided'",
            params![id.to_string(), reason, now.timestamp()],
        )?;
        Ok(())
    }
}

const STATEMENT_COLUMNS: &str = "id, tenant_id, station_id, month, category, status, version, \
                                 total_energy_kwh, total_amount, currency, snapshot_hash, \
                                 frozen_at, void_reason, voided_at, created_at";

fn row_to_statement(row: &Row<'_>) -> rusqlite::Result<Statement> {
    let id: String = row.get(0)?;
    let status: String = row.get(5)?;
    Ok(Statement {
        id: Uuid::parse_str(&id).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                e.to_string().into(),
            )
        })?,
        tenant_id: row.get(1)?,
        station_id: row.get(2)?,
        month: row.get(3)?,
        category: row.get(4)?,
        status: StatementStatus::parse(&status).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                5,
                rusqlite::types::Type::Text,
                e.to_string().into(),
            )
        })?,
        version: row.get(6)?,
        total_energy_kwh: row.get(7)?,
        total_amount: row.get(8)?,
        currency: row.get(9)?,
        snapshot_hash: row.get(10)?,
        frozen_at: row.get::<_, Option<i64>>(11)?.map(epoch),
        void_reason: row.get(12)?,
        voided_at: row.get::<_, Option<i64>>(13)?.map(epoch),
        created_at: epoch(row.get(14)?),
    })
}

fn epoch(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_default()
}
