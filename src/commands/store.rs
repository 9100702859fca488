use crate::commands::models::{Command, CommandStatus};
use crate::db::Db;
use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

#[derive(Clone)]
pub struct CommandStore {
    db: Db,
}

impl CommandStore {
    pub fn new(db: Db) -> Result<Self> {
        {
            let conn = db.lock();
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS commands (
                    command_id TEXT PRIMARY KEY,
                    tenant_id TEXT NOT NULL,
                    station_id TEXT NOT NULL,
                    device_id TEXT NOT NULL,
                    command_type TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    idempotency_key TEXT NOT NULL,
                    status TEXT NOT NULL,
                    created_at INTEGER NOT NULL,
                    sent_at INTEGER,
                    acked_at INTEGER,
                    error TEXT
                );
                CREATE INDEX IF NOT EXISTS idx_commands_idem
                    ON commands(tenant_id, idempotency_key, created_at DESC);
                CREATE INDEX IF NOT EXISTS idx_commands_station_created
                    ON commands(station_id, created_at DESC);
                CREATE INDEX IF NOT EXISTS idx_commands_status_sent
                    ON commands(status, sent_at);",
            )
            .context("create commands schema")?;
        }
        Ok(Self { db })
    }

    pub fn insert_tx(conn: &Connection, cmd: &Command) -> Result<()> {
        conn.execute(
            "INSERT INTO commands
                 (command_id, tenant_id, station_id, device_id, command_type, payload,
                  idempotency_key, status, created_at, sent_at, acked_at, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                cmd.command_id.to_string(),
                cmd.tenant_id,
                cmd.station_id,
                cmd.device_id,
                cmd.command_type,
                cmd.payload.to_string(),
                cmd.idempotency_key,
                cmd.status.as_str(),
                cmd.created_at.timestamp(),
                cmd.sent_at.map(|t| t.timestamp()),
                cmd.acked_at.map(|t| t.timestamp()),
                cmd.error,
            ],
        )?;
        Ok(())
    }

    /// Most recent command for `(tenant, idempotency_key)` created at or
    /// after `since`.
    pub fn find_recent_by_key(
        &self,
        tenant_id: &str,
        idempotency_key: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<Command>> {
        let conn = self.db.lock();
        let row = conn
            .query_row(
                &format!(
                    "SELECT {} FROM commands
                     WHERE tenant_id = ?1 AND idempotency_key = ?2 AND created_at >= ?3
                     ORDER BY created_at DESC LIMIT 1",
                    COMMAND_COLUMNS
                ),
                params![tenant_id, idempotency_key, since.timestamp()],
                row_to_command,
            )
            .optional()?;
        Ok(row)
    }

    pub fn get(&self, tenant_id: &str, command_id: Uuid) -> Result<Option<Command>> {
        let conn = self.db.lock();
        let row = conn
            .query_row(
                &format!(
                    "SELECT {} FROM commands WHERE tenant_id = ?1 AND command_id = ?2",
                    COMMAND_COLUMNS
                ),
                params![tenant_id, command_id.to_string()],
                row_to_command,
            )
            .optional()?;
        Ok(row)
    }

    pub fn mark_sent(&self, command_id: Uuid, now: DateTime<Utc>) -> Result<()> {
        let conn = self.db.lock();
        conn.execute(
            "UPDATE commands SET status = 'sent', sent_at = ?2
             WHERE command_id = ?1 AND status = 'created'",
            params![command_id.to_string(), now.timestamp()],
        )?;
        Ok(())
    }

    pub fn mark_acked_tx(conn: &Connection, command_id: Uuid, now: DateTime<Utc>) -> Result<()> {
        conn.execute(
            "UPDATE commands SET status = 'acked', acked_at = ?2
             WHERE command_id = ?1 AND status IN ('created', 'sent')",
            params![command_id.to_string(), now.timestamp()],
        )?;
        Ok(())
    }

    pub fn mark_failed_tx(conn: &Connection, command_id: Uuid, error: &str) -> Result<()> {
        conn.execute(
            "UPDATE commands SET status = 'failed', error = ?2
             WHERE command_id = ?1 AND status IN ('created', 'sent')",
            params![command_id.to_string(), error],
        )?;
        Ok(())
    }

    /// Flip `sent` commands older than `before` to `timeout`. Returns the
    /// number of orphans swept.
    pub fn mark_timeouts(&self, before: DateTime<Utc>) -> Result<usize> {
        let conn = self.db.lock();
        let n = conn.execute(
            "UPDATE commands SET status = 'timeout', error = 'device ack timeout'
             WHERE status = 'sent' AND sent_at < ?1",
            params![before.timestamp()],
        )?;
        Ok(n)
    }

    pub fn list_by_station(
        &self,
        tenant_id: &str,
        station_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Command>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM commands
             WHERE tenant_id = ?1 AND station_id = ?2
               AND created_at >= ?3 AND created_at < ?4
             ORDER BY created_at DESC",
            COMMAND_COLUMNS
        ))?;
        let rows = stmt.query_map(
            params![tenant_id, station_id, from.timestamp(), to.timestamp()],
            row_to_command,
        )?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

const COMMAND_COLUMNS: &str = "command_id, tenant_id, station_id, device_id, command_type, \
                               payload, idempotency_key, status, created_at, sent_at, acked_at, error";

fn row_to_command(row: &Row<'_>) -> rusqlite::Result<Command> {
    let id: String = row.get(0)?;
    let payload: String = row.get(5)?;
    let status: String = row.get(7)?;
    Ok(Command {
        command_id: Uuid::parse_str(&id).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                e.to_string().into(),
            )
        })?,
        tenant_id: row.get(1)?,
        station_id: row.get(2)?,
        device_id: row.get(3)?,
        command_type: row.get(4)?,
        payload: serde_json::from_str(&payload).unwrap_or(serde_json::Value::Null),
        idempotency_key: row.get(6)?,
        status: CommandStatus::parse(&status).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                7,
                rusqlite::types::Type::Text,
                e.to_string().into(),
            )
        })?,
        created_at: epoch(row.get(8)?),
        sent_at: row.get::<_, Option<i64>>(9)?.map(epoch),
        acked_at: row.get::<_, Option<i64>>(10)?.map(epoch),
        error: row.get(11)?,
    })
}

fn epoch(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_default()
}
