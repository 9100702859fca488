//! Command Service
//! Mission: Idempotent command issuance and the orphan timeout sweep
//!
//! The same `(tenant, idempotency_key)` inside the TTL window always
//! resolves to the same command row; retries are free.

use crate::clock::Clock;
use crate::commands::models::{Command, CommandStatus, IssueCommandRequest};
use crate::commands::store::CommandStore;
use crate::db::Db;
use crate::errors::CoreError;
use crate::events::envelope::EventEnvelope;
use crate::events::outbox::OutboxStore;
use crate::events::payloads::CommandIssued;
use crate::metrics::MetricsRegistry;
use anyhow::{Context, Result};
use chrono::Duration;
use sha1::{Digest, Sha1};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

pub struct CommandService {
    db: Db,
    store: CommandStore,
    metrics: Arc<MetricsRegistry>,
    clock: Arc<dyn Clock>,
    idempotency_ttl: Duration,
}

impl CommandService {
    pub fn new(
        db: Db,
        store: CommandStore,
        metrics: Arc<MetricsRegistry>,
        clock: Arc<dyn Clock>,
        idempotency_ttl: Duration,
    ) -> Self {
        Self {
            db,
            store,
            metrics,
            clock,
            idempotency_ttl,
        }
    }

    /// Issue a command for `caller_tenant`. Returns the command and whether
    /// it was deduplicated against an earlier issue.
    pub fn issue(
        &self,
        caller_tenant: &str,
        req: &IssueCommandRequest,
    ) -> Result<(Command, bool)> {
        if let Some(req_tenant) = &req.tenant_id {
            if req_tenant != caller_tenant {
                return Err(CoreError::TenantMismatch {
                    expected: req_tenant.clone(),
                    got: caller_tenant.to_string(),
                }
                .into());
            }
        }
        if req.station_id.is_empty() || req.device_id.is_empty() || req.command_type.is_empty() {
            return Err(
                CoreError::validation("station_id, device_id and command_type are required").into(),
            );
        }

        let key = match &req.idempotency_key {
            Some(k) if !k.is_empty() => k.clone(),
            _ => derive_idempotency_key(
                caller_tenant,
                &req.station_id,
                &req.device_id,
                &req.command_type,
                &req.payload,
            ),
        };

        let now = self.clock.now();
        if let Some(existing) =
            self.store
                .find_recent_by_key(caller_tenant, &key, now - self.idempotency_ttl)?
        {
            self.metrics
                .commands
                .deduplicated
                .fetch_add(1, Ordering::Relaxed);
            debug!(key, command = %existing.command_id, "idempotent issue resolved to existing command");
            return Ok((existing, true));
        }

        let command = Command {
            command_id: Uuid::new_v4(),
            tenant_id: caller_tenant.to_string(),
            station_id: req.station_id.clone(),
            device_id: req.device_id.clone(),
            command_type: req.command_type.clone(),
            payload: req.payload.clone(),
            idempotency_key: key,
            status: CommandStatus::Created,
            created_at: now,
            sent_at: None,
            acked_at: None,
            error: None,
        };

        let issued = CommandIssued {
            tenant_id: command.tenant_id.clone(),
            station_id: command.station_id.clone(),
            device_id: command.device_id.clone(),
            command_id: command.command_id,
            command_type: command.command_type.clone(),
            payload: command.payload.clone(),
            issued_at: now,
        };
        let envelope = EventEnvelope::build(&issued, now)?;

        {
            let mut conn = self.db.lock();
            let tx = conn.transaction().context("begin command issue tx")?;
            CommandStore::insert_tx(&tx, &command)?;
            OutboxStore::insert_tx(&tx, &envelope, now)?;
            tx.commit().context("commit command issue tx")?;
        }

        self.metrics.commands.issued.fetch_add(1, Ordering::Relaxed);
        info!(
            command = %command.command_id,
            device = command.device_id,
            command_type = command.command_type,
            "command issued"
        );
        Ok((command, false))
    }
}

/// Derived key for callers that don't supply one: stable across retries of
/// the same logical command.
pub fn derive_idempotency_key(
    tenant_id: &str,
    station_id: &str,
    device_id: &str,
    command_type: &str,
    payload: &serde_json::Value,
) -> String {
    let mut hasher = Sha1::new();
    hasher.update(tenant_id.as_bytes());
    hasher.update(b"|");
    hasher.update(station_id.as_bytes());
    hasher.update(b"|");
    hasher.update(device_id.as_bytes());
    hasher.update(b"|");
    hasher.update(command_type.as_bytes());
    hasher.update(b"|");
    hasher.update(payload.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// Scheduler-driven sweep flipping orphaned `sent` commands to `timeout`.
pub struct TimeoutSweeper {
    store: CommandStore,
    metrics: Arc<MetricsRegistry>,
    clock: Arc<dyn Clock>,
    ack_timeout: Duration,
}

impl TimeoutSweeper {
    pub fn new(
        store: CommandStore,
        metrics: Arc<MetricsRegistry>,
        clock: Arc<dyn Clock>,
        ack_timeout: Duration,
    ) -> Self {
        Self {
            store,
            metrics,
            clock,
            ack_timeout,
        }
    }

    pub fn sweep(&self) -> Result<usize> {
        let before = self.clock.now() - self.ack_timeout;
        let swept = self.store.mark_timeouts(before)?;
        if swept > 0 {
            self.metrics
                .commands
                .timed_out
                .fetch_add(swept as u64, Ordering::Relaxed);
            info!(swept, "command timeout sweep");
        }
        Ok(swept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::db::open_memory_db;
    use chrono::{TimeZone, Utc};

    struct Fixture {
        service: CommandService,
        store: CommandStore,
        outbox: OutboxStore,
        clock: ManualClock,
    }

    fn fixture() -> Fixture {
        let db = open_memory_db().unwrap();
        let store = CommandStore::new(db.clone()).unwrap();
        let outbox = OutboxStore::new(db.clone()).unwrap();
        let clock = ManualClock::at(Utc.with_ymd_and_hms(2026, 8, 1, 13, 0, 0).unwrap());
        let service = CommandService::new(
            db,
            store.clone(),
            Arc::new(MetricsRegistry::new()),
            Arc::new(clock.clone()),
            Duration::minutes(10),
        );
        Fixture {
            service,
            store,
            outbox,
            clock,
        }
    }

    fn request(key: Option<&str>) -> IssueCommandRequest {
        IssueCommandRequest {
            tenant_id: None,
            station_id: "station-S".into(),
            device_id: "pcs-1".into(),
            command_type: "set_power_limit".into(),
            payload: serde_json::json!({"limit_kw": 50.0}),
            idempotency_key: key.map(|k| k.to_string()),
        }
    }

    #[test]
    fn test_issue_persists_and_stages_event() {
        let f = fixture();
        let (cmd, deduped) = f.service.issue("t1", &request(Some("K"))).unwrap();
        assert!(!deduped);
        assert_eq!(cmd.status, CommandStatus::Created);

        let stored = f.store.get("t1", cmd.command_id).unwrap().unwrap();
        assert_eq!(stored.idempotency_key, "K");

        let pending = f.outbox.list_pending(10).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].envelope.event_type, "CommandIssued");
    }

    #[test]
    fn test_same_key_within_ttl_returns_same_command() {
        let f = fixture();
        let (first, _) = f.service.issue("t1", &request(Some("K"))).unwrap();
        f.clock.advance(Duration::minutes(5));
        let (second, deduped) = f.service.issue("t1", &request(Some("K"))).unwrap();

        assert!(deduped);
        assert_eq!(first.command_id, second.command_id);
        assert_eq!(f.outbox.pending_count().unwrap(), 1, "one event, not two");
    }

    #[test]
    fn test_same_key_after_ttl_creates_fresh_command() {
        let f = fixture();
        let (first, _) = f.service.issue("t1", &request(Some("K"))).unwrap();
        f.clock.advance(Duration::minutes(11));
        let (second, deduped) = f.service.issue("t1", &request(Some("K"))).unwrap();

        assert!(!deduped);
        assert_ne!(first.command_id, second.command_id);
    }

    #[test]
    fn test_derived_key_is_stable_and_payload_sensitive() {
        let a = derive_idempotency_key("t1", "s", "d", "set", &serde_json::json!({"x": 1}));
        let b = derive_idempotency_key("t1", "s", "d", "set", &serde_json::json!({"x": 1}));
        let c = derive_idempotency_key("t1", "s", "d", "set", &serde_json::json!({"x": 2}));
        assert_eq!(a, b);
        assert_ne!(a, c);

        // Missing explicit key falls back to the derivation.
        let f = fixture();
        let (first, _) = f.service.issue("t1", &request(None)).unwrap();
        let (second, deduped) = f.service.issue("t1", &request(None)).unwrap();
        assert!(deduped);
        assert_eq!(first.command_id, second.command_id);
    }

    #[test]
    fn test_tenant_mismatch_rejected() {
        let f = fixture();
        let mut req = request(Some("K"));
        req.tenant_id = Some("t2".into());
        let err = f.service.issue("t1", &req).unwrap_err();
        assert!(matches!(
            crate::errors::as_core(&err),
            Some(CoreError::TenantMismatch { .. })
        ));
    }
}
