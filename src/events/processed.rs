//! Processed Ledger & Dead-Letter Store
//! Mission: Per-consumer idempotency plus a terminal sink for poison events

use crate::db::Db;
use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, OptionalExtension};

#[derive(Clone)]
pub struct ProcessedStore {
    db: Db,
}

impl ProcessedStore {
    pub fn new(db: Db) -> Result<Self> {
        {
            let conn = db.lock();
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS processed_events (
                    event_id TEXT NOT NULL,
                    consumer_name TEXT NOT NULL,
                    processed_at INTEGER NOT NULL,
                    PRIMARY KEY (event_id, consumer_name)
                );",
            )
            .context("create processed_events schema")?;
        }
        Ok(Self { db })
    }

    pub fn has_processed(&self, event_id: &str, consumer: &str) -> Result<bool> {
        let conn = self.db.lock();
        let hit: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM processed_events WHERE event_id = ?1 AND consumer_name = ?2",
                params![event_id, consumer],
                |row| row.get(0),
            )
            .optional()?;
        Ok(hit.is_some())
    }

    /// Insert-or-ignore; replays are silent.
    pub fn mark_processed(&self, event_id: &str, consumer: &str, now: DateTime<Utc>) -> Result<()> {
        let conn = self.db.lock();
        conn.execute(
            "INSERT OR IGNORE INTO processed_events (event_id, consumer_name, processed_at)
             VALUES (?1, ?2, ?3)",
            params![event_id, consumer, now.timestamp()],
        )?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct DeadLetterRecord {
    pub event_id: String,
    pub event_type: String,
    pub payload: String,
    pub error: String,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub attempts: u32,
}

#[derive(Clone)]
pub struct DeadLetterStore {
    db: Db,
}

impl DeadLetterStore {
    pub fn new(db: Db) -> Result<Self> {
        {
            let conn = db.lock();
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS dead_letter_events (
                    event_id TEXT PRIMARY KEY,
                    event_type TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    error TEXT NOT NULL,
                    first_seen_at INTEGER NOT NULL,
                    last_seen_at INTEGER NOT NULL,
                    attempts INTEGER NOT NULL
                );",
            )
            .context("create dead_letter_events schema")?;
        }
        Ok(Self { db })
    }

    /// Upsert on event id: first sighting inserts, repeats bump the attempt
    /// tally and refresh the error message.
    pub fn record_failure(
        &self,
        event_id: &str,
        event_type: &str,
        payload: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.db.lock();
        conn.execute(
            "INSERT INTO dead_letter_events
                 (event_id, event_type, payload, error, first_seen_at, last_seen_at, attempts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5, 1)
             ON CONFLICT(event_id) DO UPDATE SET
                 attempts = attempts + 1,
                 last_seen_at = excluded.last_seen_at,
                 error = excluded.error",
            params![event_id, event_type, payload, error, now.timestamp()],
        )?;
        Ok(())
    }

    pub fn get(&self, event_id: &str) -> Result<Option<DeadLetterRecord>> {
        let conn = self.db.lock();
        let row = conn
            .query_row(
                "SELECT event_id, event_type, payload, error, first_seen_at, last_seen_at, attempts
                 FROM dead_letter_events WHERE event_id = ?1",
                params![event_id],
                |row| {
                    Ok(DeadLetterRecord {
                        event_id: row.get(0)?,
                        event_type: row.get(1)?,
                        payload: row.get(2)?,
                        error: row.get(3)?,
                        first_seen_at: epoch(row.get(4)?),
                        last_seen_at: epoch(row.get(5)?),
                        attempts: row.get(6)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn count(&self) -> Result<i64> {
        let conn = self.db.lock();
        let n = conn.query_row("SELECT COUNT(*) FROM dead_letter_events", [], |row| {
            row.get(0)
        })?;
        Ok(n)
    }
}

fn epoch(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_default()
}
