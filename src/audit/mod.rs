//! Audit Log Writer
//! Mission: Append-only record of admin actions with a tamper-evidence digest

use crate::db::Db;
use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::params;
use serde::Serialize;
use sha2::{Digest, Sha256};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub tenant_id: String,
    pub actor: String,
    pub role: String,
    pub action: String,
    pub resource_type: String,
    pub resource_id: String,
    pub station_id: Option<String>,
    pub metadata_json: Option<String>,
    pub payload_digest: Option<String>,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// What a caller supplies; id, digest and timestamp are filled on write.
#[derive(Debug, Clone, Default)]
pub struct AuditRecord {
    pub tenant_id: String,
    pub actor: String,
    pub role: String,
    pub action: String,
    pub resource_type: String,
    pub resource_id: String,
    pub station_id: Option<String>,
    pub metadata_json: Option<String>,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(Clone)]
pub struct AuditLog {
    db: Db,
}

impl AuditLog {
    pub fn new(db: Db) -> Result<Self> {
        {
            let conn = db.lock();
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS audit_logs (
                    id TEXT PRIMARY KEY,
                    tenant_id TEXT NOT NULL,
                    actor TEXT NOT NULL,
                    role TEXT NOT NULL,
                    action TEXT NOT NULL,
                    resource_type TEXT NOT NULL,
                    resource_id TEXT NOT NULL,
                    station_id TEXT,
                    metadata_json TEXT,
                    payload_digest TEXT,
                    ip TEXT,
                    user_agent TEXT,
                    created_at INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_audit_tenant_created
                    ON audit_logs(tenant_id, created_at DESC);",
            )
            .context("create audit_logs schema")?;
        }
        Ok(Self { db })
    }

    pub fn write(&self, record: AuditRecord, now: DateTime<Utc>) -> Result<Uuid> {
        let id = Uuid::new_v4();
        let payload_digest = record
            .metadata_json
            .as_ref()
            .map(|m| hex::encode(Sha256::digest(m.as_bytes())));

        let conn = self.db.lock();
        conn.execute(
            "INSERT INTO audit_logs
                 (id, tenant_id, actor, role, action, resource_type, resource_id,
                  station_id, metadata_json, payload_digest, ip, user_agent, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                id.to_string(),
                record.tenant_id,
                record.actor,
                record.role,
                record.action,
                record.resource_type,
                record.resource_id,
                record.station_id,
                record.metadata_json,
                payload_digest,
                record.ip,
                record.user_agent,
                now.timestamp(),
            ],
        )?;
        Ok(id)
    }

    pub fn list_recent(&self, tenant_id: &str, limit: usize) -> Result<Vec<AuditEntry>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, tenant_id, actor, role, action, resource_type, resource_id,
                    station_id, metadata_json, payload_digest, ip, user_agent, created_at
             FROM audit_logs
             WHERE tenant_id = ?1
             ORDER BY created_at DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![tenant_id, limit as i64], |row| {
            let id: String = row.get(0)?;
            Ok(AuditEntry {
                id: Uuid::parse_str(&id).unwrap_or_default(),
                tenant_id: row.get(1)?,
                actor: row.get(2)?,
                role: row.get(3)?,
                action: row.get(4)?,
                resource_type: row.get(5)?,
                resource_id: row.get(6)?,
                station_id: row.get(7)?,
                metadata_json: row.get(8)?,
                payload_digest: row.get(9)?,
                ip: row.get(10)?,
                user_agent: row.get(11)?,
                created_at: Utc
                    .timestamp_opt(row.get::<_, i64>(12)?, 0)
                    .single()
                    .unwrap_or_default(),
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}
