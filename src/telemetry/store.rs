//! Measurement & Point-Mapping Stores
//! Mission: Idempotent measurement persistence and mapping lookups
//!
//! The measurement primary key is the full identity tuple, so re-ingesting
//! the same point is a no-op at the DB layer.

use crate::db::Db;
use crate::telemetry::models::{MeasurementRow, PointMapping};
use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};

#[derive(Clone)]
pub struct MeasurementStore {
    db: Db,
}

impl MeasurementStore {
    pub fn new(db: Db) -> Result<Self> {
        {
            let conn = db.lock();
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS measurements (
                    tenant_id TEXT NOT NULL,
                    station_id TEXT NOT NULL,
                    device_id TEXT NOT NULL,
                    point_key TEXT NOT NULL,
                    ts INTEGER NOT NULL,
                    value_numeric REAL,
                    value_text TEXT,
                    quality TEXT NOT NULL DEFAULT 'good',
                    PRIMARY KEY (tenant_id, station_id, device_id, point_key, ts)
                );
                CREATE INDEX IF NOT EXISTS idx_measurements_station_ts
                    ON measurements(station_id, ts);",
            )
            .context("create measurements schema")?;
        }
        Ok(Self { db })
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    /// Idempotent batch insert inside the caller's transaction.
    pub fn insert_batch_tx(conn: &Connection, rows: &[MeasurementRow]) -> Result<usize> {
        let mut stmt = conn.prepare_cached(
            "INSERT OR REPLACE INTO measurements
                 (tenant_id, station_id, device_id, point_key, ts, value_numeric, value_text, quality)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )?;
        for row in rows {
            stmt.execute(params![
                row.tenant_id,
                row.station_id,
                row.device_id,
                row.point_key,
                row.ts.timestamp(),
                row.value_numeric,
                row.value_text,
                row.quality,
            ])?;
        }
        Ok(rows.len())
    }

    /// All measurements for a station in `[start, end)`, time-ascending.
    pub fn query_window(
        &self,
        tenant_id: &str,
        station_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<MeasurementRow>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT tenant_id, station_id, device_id, point_key, ts, value_numeric, value_text, quality
             FROM measurements
             WHERE tenant_id = ?1 AND station_id = ?2 AND ts >= ?3 AND ts < ?4
             ORDER BY ts ASC",
        )?;
        let rows = stmt.query_map(
            params![tenant_id, station_id, start.timestamp(), end.timestamp()],
            row_to_measurement,
        )?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Latest numeric value for a point key, optionally scoped to a device.
    pub fn latest_numeric(
        &self,
        station_id: &str,
        device_id: Option<&str>,
        point_key: &str,
    ) -> Result<Option<(DateTime<Utc>, f64)>> {
        let conn = self.db.lock();
        let row = match device_id {
            Some(device) => conn
                .query_row(
                    "SELECT ts, value_numeric FROM measurements
                     WHERE station_id = ?1 AND device_id = ?2 AND point_key = ?3
                       AND value_numeric IS NOT NULL
                     ORDER BY ts DESC LIMIT 1",
                    params![station_id, device, point_key],
                    |row| Ok((row.get::<_, i64>(0)?, row.get::<_, f64>(1)?)),
                )
                .optional()?,
            None => conn
                .query_row(
                    "SELECT ts, value_numeric FROM measurements
                     WHERE station_id = ?1 AND point_key = ?2
                       AND value_numeric IS NOT NULL
                     ORDER BY ts DESC LIMIT 1",
                    params![station_id, point_key],
                    |row| Ok((row.get::<_, i64>(0)?, row.get::<_, f64>(1)?)),
                )
                .optional()?,
        };
        Ok(row.map(|(ts, v)| (epoch(ts), v)))
    }

    pub fn count(&self) -> Result<i64> {
        let conn = self.db.lock();
        let n = conn.query_row("SELECT COUNT(*) FROM measurements", [], |r| r.get(0))?;
        Ok(n)
    }
}

fn row_to_measurement(row: &rusqlite::Row<'_>) -> rusqlite::Result<MeasurementRow> {
    Ok(MeasurementRow {
        tenant_id: row.get(0)?,
        station_id: row.get(1)?,
        device_id: row.get(2)?,
        point_key: row.get(3)?,
        ts: epoch(row.get(4)?),
        value_numeric: row.get(5)?,
        value_text: row.get(6)?,
        quality: row.get(7)?,
    })
}

fn epoch(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_default()
}

#[derive(Clone)]
pub struct PointMappingStore {
    db: Db,
}

impl PointMappingStore {
    pub fn new(db: Db) -> Result<Self> {
        {
            let conn = db.lock();
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS point_mappings (
                    id TEXT PRIMARY KEY,
                    station_id TEXT NOT NULL,
                    device_id TEXT,
                    point_key TEXT NOT NULL,
                    semantic TEXT NOT NULL,
                    unit TEXT NOT NULL DEFAULT '',
                    factor REAL NOT NULL DEFAULT 1.0
                );
                CREATE INDEX IF NOT EXISTS idx_point_mappings_station
                    ON point_mappings(station_id);",
            )
            .context("create point_mappings schema")?;
        }
        Ok(Self { db })
    }

    pub fn upsert(&self, mapping: &PointMapping) -> Result<()> {
        let conn = self.db.lock();
        conn.execute(
            "INSERT INTO point_mappings (id, station_id, device_id, point_key, semantic, unit, factor)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET
                 station_id = excluded.station_id,
                 device_id = excluded.device_id,
                 point_key = excluded.point_key,
                 semantic = excluded.semantic,
                 unit = excluded.unit,
                 factor = excluded.factor",
            params![
                mapping.id,
                mapping.station_id,
                mapping.device_id,
                mapping.point_key,
                mapping.semantic,
                mapping.unit,
                mapping.factor,
            ],
        )?;
        Ok(())
    }

    pub fn list_by_station(&self, station_id: &str) -> Result<Vec<PointMapping>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, station_id, device_id, point_key, semantic, unit, factor
             FROM point_mappings WHERE station_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![station_id], |row| {
            Ok(PointMapping {
                id: row.get(0)?,
                station_id: row.get(1)?,
                device_id: row.get(2)?,
                point_key: row.get(3)?,
                semantic: row.get(4)?,
                unit: row.get(5)?,
                factor: row.get(6)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Mappings for one station filtered to a semantic, for strategy reads.
    pub fn list_by_semantic(&self, station_id: &str, semantic: &str) -> Result<Vec<PointMapping>> {
        Ok(self
            .list_by_station(station_id)?
            .into_iter()
            .filter(|m| m.semantic == semantic)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_memory_db;
    use crate::telemetry::models::{QUALITY_GOOD, SEMANTIC_CHARGE, SEMANTIC_GRID_EXPORT};

    fn row(point_key: &str, ts: DateTime<Utc>, value: f64) -> MeasurementRow {
        MeasurementRow {
            tenant_id: "t1".into(),
            station_id: "station-S".into(),
            device_id: "pcs-1".into(),
            point_key: point_key.into(),
            ts,
            value_numeric: Some(value),
            value_text: None,
            quality: QUALITY_GOOD.into(),
        }
    }

    #[test]
    fn test_duplicate_insert_is_idempotent() {
        let db = open_memory_db().unwrap();
        let store = MeasurementStore::new(db.clone()).unwrap();
        let ts = Utc.with_ymd_and_hms(2026, 8, 1, 13, 5, 0).unwrap();

        let rows = vec![row("p.charge", ts, 1.0)];
        {
            let conn = db.lock();
            MeasurementStore::insert_batch_tx(&conn, &rows).unwrap();
            MeasurementStore::insert_batch_tx(&conn, &rows).unwrap();
        }
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn test_query_window_is_half_open() {
        let db = open_memory_db().unwrap();
        let store = MeasurementStore::new(db.clone()).unwrap();
        let start = Utc.with_ymd_and_hms(2026, 8, 1, 13, 0, 0).unwrap();
        let end = start + chrono::Duration::hours(1);

        let rows = vec![
            row("p.charge", start, 1.0),
            row("p.charge", end - chrono::Duration::seconds(1), 2.0),
            row("p.charge", end, 3.0), // next window
        ];
        {
            let conn = db.lock();
            MeasurementStore::insert_batch_tx(&conn, &rows).unwrap();
        }

        let hits = store.query_window("t1", "station-S", start, end).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].value_numeric, Some(1.0));
        assert_eq!(hits[1].value_numeric, Some(2.0));
    }

    #[test]
    fn test_latest_numeric() {
        let db = open_memory_db().unwrap();
        let store = MeasurementStore::new(db.clone()).unwrap();
        let t0 = Utc.with_ymd_and_hms(2026, 8, 1, 13, 0, 0).unwrap();

        let rows = vec![
            row("p.export", t0, 10.0),
            row("p.export", t0 + chrono::Duration::minutes(5), 42.5),
        ];
        {
            let conn = db.lock();
            MeasurementStore::insert_batch_tx(&conn, &rows).unwrap();
        }

        let (ts, v) = store
            .latest_numeric("station-S", None, "p.export")
            .unwrap()
            .unwrap();
        assert_eq!(v, 42.5);
        assert_eq!(ts, t0 + chrono::Duration::minutes(5));
        assert!(store
            .latest_numeric("station-S", Some("pcs-9"), "p.export")
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_mapping_store_round_trip() {
        let db = open_memory_db().unwrap();
        let store = PointMappingStore::new(db).unwrap();
        store
            .upsert(&PointMapping {
                id: "m1".into(),
                station_id: "station-S".into(),
                device_id: None,
                point_key: "p.charge".into(),
                semantic: SEMANTIC_CHARGE.into(),
                unit: "kW".into(),
                factor: 0.001,
            })
            .unwrap();

        let listed = store.list_by_station("station-S").unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].factor, 0.001);
        assert!(store
            .list_by_semantic("station-S", SEMANTIC_GRID_EXPORT)
            .unwrap()
            .is_empty());
    }
}
