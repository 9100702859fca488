//! Transactional Outbox
//! Mission: Stage envelopes inside the caller's business transaction so a
//! publish is lost iff the enclosing transaction aborts
//!
//! `insert` is synchronous staging only; draining belongs to the dispatcher
//! tick. FIFO order is `(created_at, id)`.

use crate::db::Db;
use crate::errors::{classify_sqlite, CoreError};
use crate::events::envelope::EventEnvelope;
use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboxStatus {
    Pending,
    Sent,
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Sent => "sent",
            OutboxStatus::Failed => "failed",
        }
    }

    fn parse(s: &str) -> OutboxStatus {
        match s {
            "sent" => OutboxStatus::Sent,
            "failed" => OutboxStatus::Failed,
            _ => OutboxStatus::Pending,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OutboxRecord {
    pub id: i64,
    pub envelope: EventEnvelope,
    pub status: OutboxStatus,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct OutboxStore {
    db: Db,
}

impl OutboxStore {
    pub fn new(db: Db) -> Result<Self> {
        {
            let conn = db.lock();
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS event_outbox (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    event_id TEXT NOT NULL,
                    event_type TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'pending',
                    attempts INTEGER NOT NULL DEFAULT 0,
                    created_at INTEGER NOT NULL,
                    sent_at INTEGER
                );
                CREATE INDEX IF NOT EXISTS idx_outbox_pending
                    ON event_outbox(status, created_at, id);",
            )
            .context("create event_outbox schema")?;
        }
        Ok(Self { db })
    }

    /// Stage an envelope on the shared connection.
    pub fn insert(&self, env: &EventEnvelope, now: DateTime<Utc>) -> Result<i64> {
        let conn = self.db.lock();
        Self::insert_tx(&conn, env, now)
    }

    /// Stage an envelope inside an open transaction. The row commits or
    /// aborts together with the caller's business write.
    pub fn insert_tx(conn: &Connection, env: &EventEnvelope, now: DateTime<Utc>) -> Result<i64> {
        let payload = serde_json::to_string(env).context("encode envelope")?;
        conn.execute(
            "INSERT INTO event_outbox (event_id, event_type, payload, status, attempts, created_at)
             VALUES (?1, ?2, ?3, 'pending', 0, ?4)",
            params![
                env.event_id.to_string(),
                env.event_type,
                payload,
                now.timestamp()
            ],
        )
        .map_err(classify_sqlite)?;
        Ok(conn.last_insert_rowid())
    }

    /// Oldest pending rows, FIFO.
    pub fn list_pending(&self, limit: usize) -> Result<Vec<OutboxRecord>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT id, payload, status, attempts, created_at, sent_at
             FROM event_outbox
             WHERE status = 'pending'
             ORDER BY created_at ASC, id ASC
             LIMIT ?1",
        )?;

        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, u32>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, Option<i64>>(5)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (id, payload, status, attempts, created_at, sent_at) = row?;
            let envelope: EventEnvelope = serde_json::from_str(&payload)
                .map_err(|e| CoreError::Poison(format!("outbox row {}: {}", id, e)))?;
            records.push(OutboxRecord {
                id,
                envelope,
                status: OutboxStatus::parse(&status),
                attempts,
                created_at: epoch(created_at),
                sent_at: sent_at.map(epoch),
            });
        }
        Ok(records)
    }

    pub fn mark_sent(&self, id: i64, now: DateTime<Utc>) -> Result<()> {
        let conn = self.db.lock();
        conn.execute(
            "UPDATE event_outbox SET status = 'sent', sent_at = ?2 WHERE id = ?1",
            params![id, now.timestamp()],
        )?;
        Ok(())
    }

    /// Terminal failure; attempts bump so the DLQ record carries the tally.
    pub fn mark_failed(&self, id: i64) -> Result<()> {
        let conn = self.db.lock();
        conn.execute(
            "UPDATE event_outbox SET status = 'failed', attempts = attempts + 1 WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    /// Transient failure; the row stays pending for the next sweep.
    pub fn record_attempt(&self, id: i64) -> Result<u32> {
        let conn = self.db.lock();
        conn.execute(
            "UPDATE event_outbox SET attempts = attempts + 1 WHERE id = ?1",
            params![id],
        )?;
        let attempts: u32 = conn.query_row(
            "SELECT attempts FROM event_outbox WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        Ok(attempts)
    }

    pub fn get(&self, id: i64) -> Result<Option<(OutboxStatus, u32)>> {
        let conn = self.db.lock();
        let row = conn
            .query_row(
                "SELECT status, attempts FROM event_outbox WHERE id = ?1",
                params![id],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, u32>(1)?)),
            )
            .optional()?;
        Ok(row.map(|(s, a)| (OutboxStatus::parse(&s), a)))
    }

    pub fn pending_count(&self) -> Result<i64> {
        let conn = self.db.lock();
        let n = conn.query_row(
            "SELECT COUNT(*) FROM event_outbox WHERE status = 'pending'",
            [],
            |row| row.get(0),
        )?;
        Ok(n)
    }
}

fn epoch(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_default()
}
