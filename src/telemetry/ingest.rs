//! Telemetry Ingest
//! Mission: Persist measurement batches and announce them on the bus in one
//! transaction

use crate::clock::Clock;
use crate::db::Db;
use crate::errors::CoreError;
use crate::events::envelope::EventEnvelope;
use crate::events::outbox::OutboxStore;
use crate::events::payloads::{TelemetryPoint, TelemetryReceived};
use crate::metrics::MetricsRegistry;
use crate::telemetry::models::{IngestBatch, MeasurementRow, QUALITY_GOOD};
use crate::telemetry::store::MeasurementStore;
use anyhow::{Context, Result};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::debug;

pub struct IngestService {
    db: Db,
    metrics: Arc<MetricsRegistry>,
    clock: Arc<dyn Clock>,
}

impl IngestService {
    pub fn new(db: Db, metrics: Arc<MetricsRegistry>, clock: Arc<dyn Clock>) -> Self {
        Self { db, metrics, clock }
    }

    /// Write the batch and stage `TelemetryReceived` atomically. Returns the
    /// number of measurement rows written.
    pub fn ingest(&self, batch: IngestBatch) -> Result<usize> {
        if batch.station_id.is_empty() || batch.device_id.is_empty() {
            self.metrics.ingest.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(CoreError::validation("station_id and device_id are required").into());
        }
        if batch.points.is_empty() {
            self.metrics.ingest.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(CoreError::validation("empty point batch").into());
        }

        let mut rows = Vec::new();
        let mut wire_points = Vec::new();
        let mut occurred_at = batch.points[0].ts;

        for point in &batch.points {
            if point.ts > occurred_at {
                occurred_at = point.ts;
            }
            let quality = point
                .quality
                .clone()
                .unwrap_or_else(|| QUALITY_GOOD.to_string());
            for (point_key, value) in &point.values {
                rows.push(MeasurementRow {
                    tenant_id: batch.tenant_id.clone(),
                    station_id: batch.station_id.clone(),
                    device_id: batch.device_id.clone(),
                    point_key: point_key.clone(),
                    ts: point.ts,
                    value_numeric: Some(*value),
                    value_text: None,
                    quality: quality.clone(),
                });
                wire_points.push(TelemetryPoint {
                    device_id: batch.device_id.clone(),
                    point_key: point_key.clone(),
                    ts: point.ts,
                    value: Some(*value),
                    text: None,
                    quality: quality.clone(),
                });
            }
        }
        if rows.is_empty() {
            self.metrics.ingest.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(CoreError::validation("points carry no values").into());
        }

        let received = TelemetryReceived {
            tenant_id: batch.tenant_id.clone(),
            station_id: batch.station_id.clone(),
            points: wire_points,
            occurred_at,
        };
        let now = self.clock.now();
        let envelope = EventEnvelope::build(&received, now)?;

        let inserted = {
            let mut conn = self.db.lock();
            let tx = conn.transaction().context("begin ingest tx")?;
            let inserted = MeasurementStore::insert_batch_tx(&tx, &rows)?;
            OutboxStore::insert_tx(&tx, &envelope, now)?;
            tx.commit().context("commit ingest tx")?;
            inserted
        };

        self.metrics.ingest.batches.fetch_add(1, Ordering::Relaxed);
        self.metrics
            .ingest
            .points
            .fetch_add(inserted as u64, Ordering::Relaxed);
        debug!(
            station = batch.station_id,
            points = inserted,
            "telemetry batch ingested"
        );
        Ok(inserted)
    }
}
