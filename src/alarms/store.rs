//! Alarm Stores
//! Mission: Rules, pending debounce state, and the alarm rows themselves
//!
//! A partial unique index over open statuses enforces at-most-one open
//! alarm per `(tenant, rule, originator)`; writers detect the conflict and
//! reuse the surviving row.

use crate::db::Db;
use crate::errors::classify_sqlite;
use crate::alarms::models::{
    Alarm, AlarmRule, AlarmStatus, CmpOp, OriginatorType, PendingBreach, Severity,
};
use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

#[derive(Clone)]
pub struct AlarmRuleStore {
    db: Db,
}

impl AlarmRuleStore {
    pub fn new(db: Db) -> Result<Self> {
        {
            let conn = db.lock();
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS alarm_rules (
                    id TEXT PRIMARY KEY,
                    tenant_id TEXT NOT NULL,
                    station_id TEXT NOT NULL,
                    name TEXT NOT NULL,
                    semantic TEXT NOT NULL,
                    operator TEXT NOT NULL,
                    threshold REAL NOT NULL,
                    hysteresis REAL NOT NULL DEFAULT 0,
                    duration_seconds INTEGER NOT NULL DEFAULT 0,
                    severity TEXT NOT NULL DEFAULT 'warning',
                    enabled INTEGER NOT NULL DEFAULT 1
                );
                CREATE INDEX IF NOT EXISTS idx_alarm_rules_station
                    ON alarm_rules(station_id, semantic);",
            )
            .context("create alarm_rules schema")?;
        }
        Ok(Self { db })
    }

    pub fn upsert(&self, rule: &AlarmRule) -> Result<()> {
        rule.validate()?;
        let conn = self.db.lock();
        conn.execute(
            "INSERT INTO alarm_rules
                 (id, tenant_id, station_id, name, semantic, operator, threshold,
                  hysteresis, duration_seconds, severity, enabled)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 semantic = excluded.semantic,
                 operator = excluded.operator,
                 threshold = excluded.threshold,
                 hysteresis = excluded.hysteresis,
                 duration_seconds = excluded.duration_seconds,
                 severity = excluded.severity,
                 enabled = excluded.enabled",
            params![
                rule.id,
                rule.tenant_id,
                rule.station_id,
                rule.name,
                rule.semantic,
                rule.operator.as_str(),
                rule.threshold,
                rule.hysteresis,
                rule.duration_seconds,
                rule.severity.as_str(),
                rule.enabled as i64,
            ],
        )?;
        Ok(())
    }

    pub fn list_enabled_for_semantic(
        &self,
        station_id: &str,
        semantic: &str,
    ) -> Result<Vec<AlarmRule>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, tenant_id, station_id, name, semantic, operator, threshold,
                    hysteresis, duration_seconds, severity, enabled
             FROM alarm_rules
             WHERE station_id = ?1 AND semantic = ?2 AND enabled = 1
             ORDER BY id",
        )?;
        let rows = stmt.query_map(params![station_id, semantic], row_to_rule)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

fn row_to_rule(row: &Row<'_>) -> rusqlite::Result<AlarmRule> {
    let operator: String = row.get(5)?;
    let severity: String = row.get(9)?;
    Ok(AlarmRule {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        station_id: row.get(2)?,
        name: row.get(3)?,
        semantic: row.get(4)?,
        operator: CmpOp::parse(&operator).map_err(|e| conversion_err(5, &e))?,
        threshold: row.get(6)?,
        hysteresis: row.get(7)?,
        duration_seconds: row.get(8)?,
        severity: Severity::parse(&severity).map_err(|e| conversion_err(9, &e))?,
        enabled: row.get::<_, i64>(10)? != 0,
    })
}

#[derive(Clone)]
pub struct AlarmPendingStore {
    db: Db,
}

impl AlarmPendingStore {
    pub fn new(db: Db) -> Result<Self> {
        {
            let conn = db.lock();
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS alarm_pending (
                    tenant_id TEXT NOT NULL,
                    rule_id TEXT NOT NULL,
                    originator_type TEXT NOT NULL,
                    originator_id TEXT NOT NULL,
                    pending_since INTEGER NOT NULL,
                    last_value REAL NOT NULL,
                    PRIMARY KEY (tenant_id, rule_id, originator_type, originator_id)
                );",
            )
            .context("create alarm_pending schema")?;
        }
        Ok(Self { db })
    }

    pub fn get(
        &self,
        tenant_id: &str,
        rule_id: &str,
        originator_type: OriginatorType,
        originator_id: &str,
    ) -> Result<Option<PendingBreach>> {
        let conn = self.db.lock();
        let row = conn
            .query_row(
                "SELECT pending_since, last_value FROM alarm_pending
                 WHERE tenant_id = ?1 AND rule_id = ?2
                   AND originator_type = ?3 AND originator_id = ?4",
                params![tenant_id, rule_id, originator_type.as_str(), originator_id],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, f64>(1)?)),
            )
            .optional()?;
        Ok(row.map(|(since, value)| PendingBreach {
            tenant_id: tenant_id.to_string(),
            rule_id: rule_id.to_string(),
            originator_type,
            originator_id: originator_id.to_string(),
            pending_since: epoch(since),
            last_value: value,
        }))
    }

    pub fn upsert(&self, pending: &PendingBreach) -> Result<()> {
        let conn = self.db.lock();
        conn.execute(
            "INSERT INTO alarm_pending
                 (tenant_id, rule_id, originator_type, originator_id, pending_since, last_value)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(tenant_id, rule_id, originator_type, originator_id) DO UPDATE SET
                 last_value = excluded.last_value",
            params![
                pending.tenant_id,
                pending.rule_id,
                pending.originator_type.as_str(),
                pending.originator_id,
                pending.pending_since.timestamp(),
                pending.last_value,
            ],
        )?;
        Ok(())
    }

    pub fn clear(
        &self,
        tenant_id: &str,
        rule_id: &str,
        originator_type: OriginatorType,
        originator_id: &str,
    ) -> Result<()> {
        let conn = self.db.lock();
        conn.execute(
            "DELETE FROM alarm_pending
             WHERE tenant_id = ?1 AND rule_id = ?2
               AND originator_type = ?3 AND originator_id = ?4",
            params![tenant_id, rule_id, originator_type.as_str(), originator_id],
        )?;
        Ok(())
    }
}

#[derive(Clone)]
pub struct AlarmStore {
    db: Db,
}

impl AlarmStore {
    pub fn new(db: Db) -> Result<Self> {
        {
            let conn = db.lock();
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS alarms (
                    id TEXT PRIMARY KEY,
                    tenant_id TEXT NOT NULL,
                    station_id TEXT NOT NULL,
                    originator_type TEXT NOT NULL,
                    originator_id TEXT NOT NULL,
                    rule_id TEXT NOT NULL,
                    status TEXT NOT NULL,
                    start_at INTEGER NOT NULL,
                    end_at INTEGER,
                    last_value REAL NOT NULL,
                    acked_at INTEGER,
                    cleared_at INTEGER
                );
                CREATE UNIQUE INDEX IF NOT EXISTS idx_alarms_one_open
                    ON alarms(tenant_id, rule_id, originator_type, originator_id)
                    WHERE status IN ('active', 'acknowledged');
                CREATE INDEX IF NOT EXISTS idx_alarms_station_start
                    ON alarms(station_id, start_at DESC);",
            )
            .context("create alarms schema")?;
        }
        Ok(Self { db })
    }

    /// Insert a fresh open alarm. Loses with `Conflict` when another writer
    /// already holds the open slot for this `(tenant, rule, originator)`.
    pub fn insert_open(&self, alarm: &Alarm) -> Result<()> {
        let conn = self.db.lock();
        Self::insert_open_tx(&conn, alarm)
    }

    pub fn insert_open_tx(conn: &rusqlite::Connection, alarm: &Alarm) -> Result<()> {
        conn.execute(
            "INSERT INTO alarms
                 (id, tenant_id, station_id, originator_type, originator_id, rule_id,
                  status, start_at, end_at, last_value, acked_at, cleared_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                alarm.id.to_string(),
                alarm.tenant_id,
                alarm.station_id,
                alarm.originator_type.as_str(),
                alarm.originator_id,
                alarm.rule_id,
                alarm.status.as_str(),
                alarm.start_at.timestamp(),
                alarm.end_at.map(|t| t.timestamp()),
                alarm.last_value,
                alarm.acked_at.map(|t| t.timestamp()),
                alarm.cleared_at.map(|t| t.timestamp()),
            ],
        )
        .map_err(classify_sqlite)?;
        Ok(())
    }

    pub fn find_open(
        &self,
        tenant_id: &str,
        rule_id: &str,
        originator_type: OriginatorType,
        originator_id: &str,
    ) -> Result<Option<Alarm>> {
        let conn = self.db.lock();
        let row = conn
            .query_row(
                &format!(
                    "SELECT {} FROM alarms
                     WHERE tenant_id = ?1 AND rule_id = ?2
                       AND originator_type = ?3 AND originator_id = ?4
                       AND status IN ('active', 'acknowledged')",
                    ALARM_COLUMNS
                ),
                params![tenant_id, rule_id, originator_type.as_str(), originator_id],
                row_to_alarm,
            )
            .optional()?;
        Ok(row)
    }

    pub fn get(&self, tenant_id: &str, id: Uuid) -> Result<Option<Alarm>> {
        let conn = self.db.lock();
        let row = conn
            .query_row(
                &format!(
                    "SELECT {} FROM alarms WHERE tenant_id = ?1 AND id = ?2",
                    ALARM_COLUMNS
                ),
                params![tenant_id, id.to_string()],
                row_to_alarm,
            )
            .optional()?;
        Ok(row)
    }

    pub fn update_last_value(&self, id: Uuid, value: f64) -> Result<()> {
        let conn = self.db.lock();
        conn.execute(
            "UPDATE alarms SET last_value = ?2 WHERE id = ?1",
            params![id.to_string(), value],
        )?;
        Ok(())
    }

    pub fn acknowledge(&self, id: Uuid, now: DateTime<Utc>) -> Result<()> {
        let conn = self.db.lock();
        Self::acknowledge_tx(&conn, id, now)
    }

    pub fn acknowledge_tx(conn: &rusqlite::Connection, id: Uuid, now: DateTime<Utc>) -> Result<()> {
        conn.execute(
            "UPDATE alarms SET status = 'acknowledged', acked_at = ?2
             WHERE id = ?1 AND status = 'active'",
            params![id.to_string(), now.timestamp()],
        )?;
        Ok(())
    }

    pub fn clear(&self, id: Uuid, at: DateTime<Utc>, last_value: f64) -> Result<()> {
        let conn = self.db.lock();
        Self::clear_tx(&conn, id, at, last_value)
    }

    pub fn clear_tx(
        conn: &rusqlite::Connection,
        id: Uuid,
        at: DateTime<Utc>,
        last_value: f64,
    ) -> Result<()> {
        conn.execute(
            "UPDATE alarms SET status = 'cleared', end_at = ?2, cleared_at = ?2, last_value = ?3
             WHERE id = ?1",
            params![id.to_string(), at.timestamp(), last_value],
        )?;
        Ok(())
    }

    pub fn list_by_station(
        &self,
        tenant_id: &str,
        station_id: &str,
        status: Option<AlarmStatus>,
    ) -> Result<Vec<Alarm>> {
        let conn = self.db.lock();
        let mut out = Vec::new();
        match status {
            Some(status) => {
                let mut stmt = conn.prepare_cached(&format!(
                    "SELECT {} FROM alarms
                     WHERE tenant_id = ?1 AND station_id = ?2 AND status = ?3
                     ORDER BY start_at DESC",
                    ALARM_COLUMNS
                ))?;
                let rows =
                    stmt.query_map(params![tenant_id, station_id, status.as_str()], row_to_alarm)?;
                for row in rows {
                    out.push(row?);
                }
            }
            None => {
                let mut stmt = conn.prepare_cached(&format!(
                    "SELECT {} FROM alarms
                     WHERE tenant_id = ?1 AND station_id = ?2
                     ORDER BY start_at DESC",
                    ALARM_COLUMNS
                ))?;
                let rows = stmt.query_map(params![tenant_id, station_id], row_to_alarm)?;
                for row in rows {
                    out.push(row?);
                }
            }
        }
        Ok(out)
    }

    /// Open alarm count per `(tenant, rule, originator)`, for invariant checks.
    pub fn open_count(
        &self,
        tenant_id: &str,
        rule_id: &str,
        originator_type: OriginatorType,
        originator_id: &str,
    ) -> Result<i64> {
        let conn = self.db.lock();
        let n = conn.query_row(
            "SELECT COUNT(*) FROM alarms
             WHERE tenant_id = ?1 AND rule_id = ?2
               AND originator_type = ?3 AND originator_id = ?4
               AND status IN ('active', 'acknowledged')",
            params![tenant_id, rule_id, originator_type.as_str(), originator_id],
            |r| r.get(0),
        )?;
        Ok(n)
    }
}

const ALARM_COLUMNS: &str = "id, tenant_id, station_id, originator_type, originator_id, rule_id, \
                             status, start_at, end_at, last_value, acked_at, cleared_at";

fn row_to_alarm(row: &Row<'_>) -> rusqlite::Result<Alarm> {
    let id: String = row.get(0)?;
    let originator_type: String = row.get(3)?;
    let status: String = row.get(6)?;
    Ok(Alarm {
        id: Uuid::parse_str(&id)
            .map_err(|e| conversion_err(0, &e))?,
        tenant_id: row.get(1)?,
        station_id: row.get(2)?,
        originator_type: OriginatorType::parse(&originator_type)
            .map_err(|e| conversion_err(3, &e))?,
        originator_id: row.get(4)?,
        rule_id: row.get(5)?,
        status: AlarmStatus::parse(&status).map_err(|e| conversion_err(6, &e))?,
        start_at: epoch(row.get(7)?),
        end_at: row.get::<_, Option<i64>>(8)?.map(epoch),
        last_value: row.get(9)?,
        acked_at: row.get::<_, Option<i64>>(10)?.map(epoch),
        cleared_at: row.get::<_, Option<i64>>(11)?.map(epoch),
    })
}

fn conversion_err(idx: usize, err: &dyn std::fmt::Display) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        err.to_string().into(),
    )
}

fn epoch(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_memory_db;

    fn open_alarm(rule_id: &str, start: DateTime<Utc>) -> Alarm {
        Alarm {
            id: Uuid::new_v4(),
            tenant_id: "t1".into(),
            station_id: "station-S".into(),
            originator_type: OriginatorType::Device,
            originator_id: "pcs-1".into(),
            rule_id: rule_id.into(),
            status: AlarmStatus::Active,
            start_at: start,
            end_at: None,
            last_value: 120.0,
            acked_at: None,
            cleared_at: None,
        }
    }

    #[test]
    fn test_partial_unique_allows_one_open_alarm() {
        let db = open_memory_db().unwrap();
        let store = AlarmStore::new(db).unwrap();
        let t0 = Utc.with_ymd_and_hms(2026, 8, 1, 13, 0, 0).unwrap();

        store.insert_open(&open_alarm("r1", t0)).unwrap();
        let err = store.insert_open(&open_alarm("r1", t0)).unwrap_err();
        assert!(matches!(
            crate::errors::as_core(&err),
            Some(crate::errors::CoreError::Conflict(_))
        ));
        assert_eq!(
            store
                .open_count("t1", "r1", OriginatorType::Device, "pcs-1")
                .unwrap(),
            1
        );
    }

    #[test]
    fn test_cleared_alarm_frees_the_open_slot() {
        let db = open_memory_db().unwrap();
        let store = AlarmStore::new(db).unwrap();
        let t0 = Utc.with_ymd_and_hms(2026, 8, 1, 13, 0, 0).unwrap();

        let first = open_alarm("r1", t0);
        store.insert_open(&first).unwrap();
        store.clear(first.id, t0 + chrono::Duration::minutes(5), 90.0).unwrap();

        // History keeps the cleared row; a new open one is legal again.
        store.insert_open(&open_alarm("r1", t0 + chrono::Duration::minutes(10))).unwrap();
        let all = store.list_by_station("t1", "station-S", None).unwrap();
        assert_eq!(all.len(), 2);
        let open = store
            .find_open("t1", "r1", OriginatorType::Device, "pcs-1")
            .unwrap()
            .unwrap();
        assert_eq!(open.status, AlarmStatus::Active);
    }

    #[test]
    fn test_acknowledge_only_from_active() {
        let db = open_memory_db().unwrap();
        let store = AlarmStore::new(db).unwrap();
        let t0 = Utc.with_ymd_and_hms(2026, 8, 1, 13, 0, 0).unwrap();
        let alarm = open_alarm("r1", t0);
        store.insert_open(&alarm).unwrap();

        store.acknowledge(alarm.id, t0 + chrono::Duration::minutes(1)).unwrap();
        let got = store.get("t1", alarm.id).unwrap().unwrap();
        assert_eq!(got.status, AlarmStatus::Acknowledged);
        assert!(got.acked_at.is_some());

        // Acknowledged stays acknowledged on a second call.
        store.acknowledge(alarm.id, t0 + chrono::Duration::minutes(2)).unwrap();
        let got = store.get("t1", alarm.id).unwrap().unwrap();
        assert_eq!(got.acked_at, Some(t0 + chrono::Duration::minutes(1)));
    }

    #[test]
    fn test_pending_round_trip() {
        let db = open_memory_db().unwrap();
        let store = AlarmPendingStore::new(db).unwrap();
        let t0 = Utc.with_ymd_and_hms(2026, 8, 1, 13, 0, 0).unwrap();

        let pending = PendingBreach {
            tenant_id: "t1".into(),
            rule_id: "r1".into(),
            originator_type: OriginatorType::Device,
            originator_id: "pcs-1".into(),
            pending_since: t0,
            last_value: 101.0,
        };
        store.upsert(&pending).unwrap();

        // Re-upsert refreshes the value but keeps pending_since.
        store
            .upsert(&PendingBreach {
                last_value: 105.0,
                pending_since: t0 + chrono::Duration::minutes(3),
                ..pending.clone()
            })
            .unwrap();
        let got = store
            .get("t1", "r1", OriginatorType::Device, "pcs-1")
            .unwrap()
            .unwrap();
        assert_eq!(got.last_value, 105.0);
        assert_eq!(got.pending_since, t0);

        store.clear("t1", "r1", OriginatorType::Device, "pcs-1").unwrap();
        assert!(store
            .get("t1", "r1", OriginatorType::Device, "pcs-1")
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_rule_store_filters_by_semantic_and_enabled() {
        let db = open_memory_db().unwrap();
        let store = AlarmRuleStore::new(db).unwrap();
        let mut rule = AlarmRule {
            id: "r1".into(),
            tenant_id: "t1".into(),
            station_id: "station-S".into(),
            name: "overcharge".into(),
            semantic: "charge_power_kw".into(),
            operator: CmpOp::Gt,
            threshold: 100.0,
            hysteresis: 5.0,
            duration_seconds: 0,
            severity: Severity::Warning,
            enabled: true,
        };
        store.upsert(&rule).unwrap();
        rule.id = "r2".into();
        rule.enabled = false;
        store.upsert(&rule).unwrap();

        let hits = store
            .list_enabled_for_semantic("station-S", "charge_power_kw")
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "r1");
        assert!(store
            .list_enabled_for_semantic("station-S", "grid_export_kw")
            .unwrap()
            .is_empty());
    }
}
