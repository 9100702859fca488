//! Settlement Service
//! Mission: Price each completed day against the station's tariff plan and
//! upsert the versioned settlement row
//!
//! Emission policy: `SettlementCalculated` goes out on every computation,
//! recalculations included; consumers discriminate on `version`.

use crate::clock::Clock;
use crate::db::Db;
use crate::events::bus::{EventContext, EventHandler};
use crate::events::envelope::EventEnvelope;
use crate::events::outbox::OutboxStore;
use crate::events::payloads::{SettlementCalculated, StatisticCalculated};
use crate::events::registry::EventPayload;
use crate::settlement::store::{SettlementStore, TariffStore};
use crate::stats::store::StatisticStore;
use crate::stats::timekey::{Granularity, TimeKey};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Timelike;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct SettlementService {
    db: Db,
    stats: StatisticStore,
    tariffs: TariffStore,
    settlements: SettlementStore,
    clock: Arc<dyn Clock>,
}

impl SettlementService {
    pub fn new(
        db: Db,
        stats: StatisticStore,
        tariffs: TariffStore,
        settlements: SettlementStore,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            db,
            stats,
            tariffs,
            settlements,
            clock,
        }
    }

    /// Settle one day. Returns the settlement version, or None when the day
    /// aggregate or tariff plan is missing (no-op).
    pub fn settle_day(&self, ev: &StatisticCalculated) -> Result<Option<i64>> {
        let day_key = TimeKey::new(Granularity::Day, ev.period_start);
        let day = match self
            .stats
            .get(&ev.station_id, Granularity::Day, &day_key.key)?
        {
            Some(agg) if agg.is_completed => agg,
            _ => {
                // Event for an unborn aggregate: swallow, a later replay
                // will find it.
                warn!(station = ev.station_id, day = day_key.key, "day aggregate missing");
                return Ok(None);
            }
        };

        let month_key = TimeKey::new(Granularity::Month, ev.period_start);
        let plan = match self
            .tariffs
            .active_plan(&ev.tenant_id, &ev.station_id, &month_key.key)?
        {
            Some(plan) => plan,
            None => {
                warn!(
                    station = ev.station_id,
                    month = month_key.key,
                    "no active tariff plan, day left unsettled"
                );
                return Ok(None);
            }
        };

        // Day amount is the sum of hour energies priced at each hour boundary.
        let hours = self.stats.list_children(&ev.station_id, &day_key)?;
        let mut amount = 0.0;
        for hour in &hours {
            let minute_of_day = hour.period_start.hour() * 60 + hour.period_start.minute();
            let price = match plan.price_at_minute(minute_of_day) {
                Some(p) => p,
                None => {
                    debug!(minute = minute_of_day, "no tariff rule for hour, priced at 0");
                    0.0
                }
            };
            amount += hour.fact.energy_kwh() * price;
        }
        let energy_kwh = day.fact.energy_kwh();

        let now = self.clock.now();
        let version = {
            let mut conn = self.db.lock();
            let tx = conn.transaction().context("begin settlement tx")?;
            let version = SettlementStore::upsert_calculated_tx(
                &tx,
                &ev.tenant_id,
                &ev.station_id,
                day_key.period_start,
                energy_kwh,
                amount,
                &plan.currency,
            )?;
            let calculated = SettlementCalculated {
                tenant_id: ev.tenant_id.clone(),
                station_id: ev.station_id.clone(),
                day_start: day_key.period_start,
                energy_kwh,
                amount,
                currency: plan.currency.clone(),
                version,
            };
            let envelope = EventEnvelope::build(&calculated, now)?;
            OutboxStore::insert_tx(&tx, &envelope, now)?;
            tx.commit().context("commit settlement tx")?;
            version
        };

        info!(
            station = ev.station_id,
            day = day_key.key,
            energy_kwh,
            amount,
            version,
            "day settled"
        );
        Ok(Some(version))
    }
}

#[async_trait]
impl EventHandler for SettlementService {
    fn name(&self) -> &str {
        "settlement_daily"
    }

    async fn handle(&self, _ctx: &EventContext, event: &EventPayload) -> Result<()> {
        match event {
            EventPayload::StatisticCalculated(ev) if ev.granularity == Granularity::Day => {
                self.settle_day(ev)?;
                Ok(())
            }
            _ => Ok(()),
        }
    }
}
