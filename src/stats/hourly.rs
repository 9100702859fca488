//! Hourly Statistic Service
//! Mission: Fold a closed hour of measurements into the HOUR aggregate,
//! the sole fact source of the rollup cascade

use crate::clock::Clock;
use crate::db::Db;
use crate::errors::{as_core, CoreError};
use crate::events::bus::{EventContext, EventHandler};
use crate::events::envelope::EventEnvelope;
use crate::events::outbox::OutboxStore;
use crate::events::payloads::{StatisticCalculated, TelemetryWindowClosed};
use crate::events::registry::EventPayload;
use crate::stats::aggregate::{StatisticAggregate, StatisticFact};
use crate::stats::store::StatisticStore;
use crate::stats::timekey::Granularity;
use crate::telemetry::models::{
    resolve_mapping, SEMANTIC_CARBON, SEMANTIC_CHARGE, SEMANTIC_DISCHARGE, SEMANTIC_EARNINGS,
};
use crate::telemetry::store::{MeasurementStore, PointMappingStore};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

pub struct HourlyStatService {
    db: Db,
    measurements: MeasurementStore,
    mappings: PointMappingStore,
    stats: StatisticStore,
    clock: Arc<dyn Clock>,
}

impl HourlyStatService {
    pub fn new(
        db: Db,
        measurements: MeasurementStore,
        mappings: PointMappingStore,
        stats: StatisticStore,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            db,
            measurements,
            mappings,
            stats,
            clock,
        }
    }

    /// Compute and freeze the HOUR aggregate for the window. Returns false
    /// when the hour was already present and no recalculation was asked.
    pub fn process(&self, ev: &TelemetryWindowClosed) -> Result<bool> {
        let agg_template =
            StatisticAggregate::new(&ev.station_id, Granularity::Hour, ev.window_start);

        if !ev.recalculate {
            if self
                .stats
                .get(&ev.station_id, Granularity::Hour, &agg_template.time_key)?
                .is_some()
            {
                debug!(
                    station = ev.station_id,
                    hour = agg_template.time_key,
                    "hour aggregate already present"
                );
                return Ok(false);
            }
        }

        let rows = self.measurements.query_window(
            &ev.tenant_id,
            &ev.station_id,
            ev.window_start,
            ev.window_end,
        )?;
        let mappings = self.mappings.list_by_station(&ev.station_id)?;

        let mut fact = StatisticFact::default();
        for row in &rows {
            let value = match row.value_numeric {
                Some(v) => v,
                None => continue,
            };
            let mapping = match resolve_mapping(&mappings, &row.device_id, &row.point_key) {
                Some(m) => m,
                None => continue, // unmapped points carry no semantics
            };
            let scaled = value * mapping.factor;
            match mapping.semantic.as_str() {
                SEMANTIC_CHARGE => fact.charge_kwh += scaled,
                SEMANTIC_DISCHARGE => fact.discharge_kwh += scaled,
                SEMANTIC_EARNINGS => fact.earnings += scaled,
                SEMANTIC_CARBON => fact.carbon_reduction += scaled,
                _ => {}
            }
        }

        let now = self.clock.now();
        let mut agg = agg_template;
        agg.complete(fact, now)?;

        let calculated = StatisticCalculated {
            tenant_id: ev.tenant_id.clone(),
            station_id: ev.station_id.clone(),
            granularity: Granularity::Hour,
            period_start: ev.window_start,
            recalculate: ev.recalculate,
        };
        let envelope = EventEnvelope::build(&calculated, now)?;

        {
            let mut conn = self.db.lock();
            let tx = conn.transaction().context("begin hour stat tx")?;
            let save = if ev.recalculate {
                StatisticStore::upsert_tx(&tx, &agg)
            } else {
                StatisticStore::insert_new_tx(&tx, &agg)
            };
            match save {
                Ok(()) => {}
                Err(e) if as_core(&e).map(CoreError::is_replay_noop).unwrap_or(false) => {
                    // Another writer won the race; theirs stands.
                    debug!(hour = agg.time_key, "duplicate hour save swallowed");
                    return Ok(false);
                }
                Err(e) => return Err(e),
            }
            OutboxStore::insert_tx(&tx, &envelope, now)?;
            tx.commit().context("commit hour stat tx")?;
        }

        info!(
            station = ev.station_id,
            hour = agg.time_key,
            charge = agg.fact.charge_kwh,
            discharge = agg.fact.discharge_kwh,
            recalculate = ev.recalculate,
            "hour aggregate completed"
        );
        Ok(true)
    }
}

#[async_trait]
impl EventHandler for HourlyStatService {
    fn name(&self) -> &str {
        "stat_hourly"
    }

    async fn handle(&self, _ctx: &EventContext, event: &EventPayload) -> Result<()> {
        match event {
            EventPayload::TelemetryWindowClosed(ev) => {
                self.process(ev)?;
                Ok(())
            }
            _ => Ok(()),
        }
    }
}
