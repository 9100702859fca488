//! Rollup Service
//! Mission: Derive DAY/MONTH/YEAR aggregates from completed children with
//! strict completeness gating
//!
//! One service shape per parent granularity, same algorithm. Partial data
//! leaves the parent unwritten; the next sibling completion retries it, so
//! delivery order between siblings never affects the result.

use crate::clock::Clock;
use crate::db::Db;
use crate::errors::{as_core, CoreError};
use crate::events::bus::{EventContext, EventHandler};
use crate::events::envelope::EventEnvelope;
use crate::events::outbox::OutboxStore;
use crate::events::payloads::StatisticCalculated;
use crate::events::registry::EventPayload;
use crate::stats::aggregate::{StatisticAggregate, StatisticFact};
use crate::stats::store::StatisticStore;
use crate::stats::timekey::{Granularity, TimeKey};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollupOutcome {
    Completed,
    AlreadyCompleted,
    IncompleteChildren { have: usize, expected: u32 },
    ChildNotCompleted,
    /// Event granularity is not this service's child; ignored.
    NotMyChild,
}

pub struct RollupService {
    parent: Granularity,
    consumer_name: String,
    db: Db,
    stats: StatisticStore,
    clock: Arc<dyn Clock>,
    /// Test hook; production uses the calendar-derived child count.
    expected_children_override: Option<u32>,
}

impl RollupService {
    pub fn new(parent: Granularity, db: Db, stats: StatisticStore, clock: Arc<dyn Clock>) -> Self {
        Self {
            consumer_name: format!("rollup_{}", parent.as_str().to_lowercase()),
            parent,
            db,
            stats,
            clock,
            expected_children_override: None,
        }
    }

    pub fn with_expected_children(mut self, expected: u32) -> Self {
        self.expected_children_override = Some(expected);
        self
    }

    pub fn process(&self, ev: &StatisticCalculated) -> Result<RollupOutcome> {
        if Some(ev.granularity) != self.parent.child() {
            return Ok(RollupOutcome::NotMyChild);
        }

        let parent_key = TimeKey::new(self.parent, ev.period_start);
        let existing = self
            .stats
            .get(&ev.station_id, self.parent, &parent_key.key)?;
        if let Some(existing) = &existing {
            if existing.is_completed && !ev.recalculate {
                debug!(
                    subject = ev.station_id,
                    period = parent_key.key,
                    granularity = %self.parent,
                    "rollup already completed"
                );
                return Ok(RollupOutcome::AlreadyCompleted);
            }
        }

        let children = self.stats.list_children(&ev.station_id, &parent_key)?;
        let expected = self
            .expected_children_override
            .unwrap_or_else(|| parent_key.expected_children());

        if (children.len() as u32) < expected {
            debug!(
                subject = ev.station_id,
                period = parent_key.key,
                have = children.len(),
                expected,
                "rollup waiting for more children"
            );
            return Ok(RollupOutcome::IncompleteChildren {
                have: children.len(),
                expected,
            });
        }
        if children.iter().any(|c| !c.is_completed) {
            return Ok(RollupOutcome::ChildNotCompleted);
        }

        let mut sum = StatisticFact::default();
        for child in &children {
            sum.add(&child.fact);
        }

        let now = self.clock.now();
        let mut agg = StatisticAggregate::new(&ev.station_id, self.parent, ev.period_start);
        agg.complete(sum, now)?;

        let calculated = StatisticCalculated {
            tenant_id: ev.tenant_id.clone(),
            station_id: ev.station_id.clone(),
            granularity: self.parent,
            period_start: agg.period_start,
            recalculate: ev.recalculate,
        };
        let envelope = EventEnvelope::build(&calculated, now)?;

        {
            let mut conn = self.db.lock();
            let tx = conn.transaction().context("begin rollup tx")?;
            let save = if ev.recalculate || existing.is_some() {
                StatisticStore::upsert_tx(&tx, &agg)
            } else {
                StatisticStore::insert_new_tx(&tx, &agg)
            };
            match save {
                Ok(()) => {}
                Err(e) if as_core(&e).map(CoreError::is_replay_noop).unwrap_or(false) => {
                    debug!(period = agg.time_key, "duplicate rollup save swallowed");
                    return Ok(RollupOutcome::AlreadyCompleted);
                }
                Err(e) => return Err(e),
            }
            OutboxStore::insert_tx(&tx, &envelope, now)?;
            tx.commit().context("commit rollup tx")?;
        }

        info!(
            subject = ev.station_id,
            period = agg.time_key,
            granularity = %self.parent,
            energy = agg.fact.energy_kwh(),
            recalculate = ev.recalculate,
            "rollup completed"
        );
        Ok(RollupOutcome::Completed)
    }
}

#[async_trait]
impl EventHandler for RollupService {
    fn name(&self) -> &str {
        &self.consumer_name
    }

    async fn handle(&self, _ctx: &EventContext, event: &EventPayload) -> Result<()> {
        match event {
            EventPayload::StatisticCalculated(ev) => {
                self.process(ev)?;
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::db::open_memory_db;
    use chrono::{DateTime, TimeZone, Utc};

    struct Fixture {
        db: Db,
        stats: StatisticStore,
        outbox: OutboxStore,
        clock: ManualClock,
    }

    fn fixture() -> Fixture {
        let db = open_memory_db().unwrap();
        let stats = StatisticStore::new(db.clone()).unwrap();
        let outbox = OutboxStore::new(db.clone()).unwrap();
        let clock = ManualClock::at(Utc.with_ymd_and_hms(2026, 8, 2, 0, 5, 0).unwrap());
        Fixture {
            db,
            stats,
            outbox,
            clock,
        }
    }

    fn day_service(f: &Fixture) -> RollupService {
        RollupService::new(
            Granularity::Day,
            f.db.clone(),
            f.stats.clone(),
            Arc::new(f.clock.clone()),
        )
    }

    fn seed_hour(f: &Fixture, t: DateTime<Utc>, completed: bool) {
        let mut agg = StatisticAggregate::new("station-S", Granularity::Hour, t);
        if completed {
            agg.complete(
                StatisticFact {
                    charge_kwh: 1.0,
                    discharge_kwh: 2.0,
                    earnings: 0.1,
                    carbon_reduction: 0.01,
                },
                t,
            )
            .unwrap();
        }
        let conn = f.db.lock();
        StatisticStore::upsert_tx(&conn, &agg).unwrap();
    }

    fn hour_event(t: DateTime<Utc>, recalculate: bool) -> StatisticCalculated {
        StatisticCalculated {
            tenant_id: "t1".into(),
            station_id: "station-S".into(),
            granularity: Granularity::Hour,
            period_start: t,
            recalculate,
        }
    }

    #[test]
    fn test_day_sums_24_hours() {
        let f = fixture();
        let day = Utc.with_ymd_and_hms(2026, 8, 1, 0, 0, 0).unwrap();
        for h in 0..24 {
            seed_hour(&f, day + chrono::Duration::hours(h), true);
        }

        let outcome = day_service(&f).process(&hour_event(day, false)).unwrap();
        assert_eq!(outcome, RollupOutcome::Completed);

        let agg = f
            .stats
            .get("station-S", Granularity::Day, "20260801")
            .unwrap()
            .unwrap();
        // Conservation: day fact equals the sum over its hours.
        assert_eq!(agg.fact.charge_kwh, 24.0);
        assert_eq!(agg.fact.discharge_kwh, 48.0);
        assert!((agg.fact.earnings - 2.4).abs() < 1e-9);
        assert!((agg.fact.carbon_reduction - 0.24).abs() < 1e-9);

        let pending = f.outbox.list_pending(10).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].envelope.event_type, "StatisticCalculated");
    }

    #[test]
    fn test_incomplete_children_defer() {
        let f = fixture();
        let day = Utc.with_ymd_and_hms(2026, 8, 1, 0, 0, 0).unwrap();
        for h in 0..23 {
            seed_hour(&f, day + chrono::Duration::hours(h), true);
        }

        let outcome = day_service(&f).process(&hour_event(day, false)).unwrap();
        assert_eq!(
            outcome,
            RollupOutcome::IncompleteChildren {
                have: 23,
                expected: 24
            }
        );
        assert!(f
            .stats
            .get("station-S", Granularity::Day, "20260801")
            .unwrap()
            .is_none());

        // The missing sibling arrives; the retry completes the day.
        seed_hour(&f, day + chrono::Duration::hours(23), true);
        let outcome = day_service(&f)
            .process(&hour_event(day + chrono::Duration::hours(23), false))
            .unwrap();
        assert_eq!(outcome, RollupOutcome::Completed);
    }

    #[test]
    fn test_uncompleted_child_blocks() {
        let f = fixture();
        let day = Utc.with_ymd_and_hms(2026, 8, 1, 0, 0, 0).unwrap();
        for h in 0..24 {
            seed_hour(&f, day + chrono::Duration::hours(h), h != 6);
        }

        let outcome = day_service(&f).process(&hour_event(day, false)).unwrap();
        assert_eq!(outcome, RollupOutcome::ChildNotCompleted);
    }

    #[test]
    fn test_completed_day_is_silent_without_recalculate() {
        let f = fixture();
        let day = Utc.with_ymd_and_hms(2026, 8, 1, 0, 0, 0).unwrap();
        for h in 0..24 {
            seed_hour(&f, day + chrono::Duration::hours(h), true);
        }
        let service = day_service(&f);
        assert_eq!(service.process(&hour_event(day, false)).unwrap(), RollupOutcome::Completed);
        assert_eq!(
            service.process(&hour_event(day, false)).unwrap(),
            RollupOutcome::AlreadyCompleted
        );
        assert_eq!(f.outbox.pending_count().unwrap(), 1, "no duplicate event");
    }

    #[test]
    fn test_recalculate_replaces_parent() {
        let f = fixture();
        let day = Utc.with_ymd_and_hms(2026, 8, 1, 0, 0, 0).unwrap();
        for h in 0..24 {
            seed_hour(&f, day + chrono::Duration::hours(h), true);
        }
        let service = day_service(&f);
        service.process(&hour_event(day, false)).unwrap();

        // Hour 6 is backfilled with a bigger fact, then the day recalculates.
        let h6 = day + chrono::Duration::hours(6);
        let mut agg = StatisticAggregate::new("station-S", Granularity::Hour, h6);
        agg.complete(
            StatisticFact {
                charge_kwh: 10.0,
                discharge_kwh: 20.0,
                earnings: 0.1,
                carbon_reduction: 0.01,
            },
            h6,
        )
        .unwrap();
        {
            let conn = f.db.lock();
            StatisticStore::upsert_tx(&conn, &agg).unwrap();
        }

        assert_eq!(
            service.process(&hour_event(h6, true)).unwrap(),
            RollupOutcome::Completed
        );
        let day_agg = f
            .stats
            .get("station-S", Granularity::Day, "20260801")
            .unwrap()
            .unwrap();
        assert_eq!(day_agg.fact.charge_kwh, 33.0);
        assert_eq!(day_agg.fact.discharge_kwh, 66.0);
        assert_eq!(f.stats.count(Granularity::Day).unwrap(), 1);
    }

    #[test]
    fn test_month_uses_calendar_days() {
        let f = fixture();
        let month = Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap();
        let service = RollupService::new(
            Granularity::Month,
            f.db.clone(),
            f.stats.clone(),
            Arc::new(f.clock.clone()),
        );

        for d in 0..28 {
            let t = month + chrono::Duration::days(d);
            let mut agg = StatisticAggregate::new("station-S", Granularity::Day, t);
            agg.complete(
                StatisticFact {
                    charge_kwh: 1.0,
                    ..Default::default()
                },
                t,
            )
            .unwrap();
            let conn = f.db.lock();
            StatisticStore::upsert_tx(&conn, &agg).unwrap();
        }

        let ev = StatisticCalculated {
            tenant_id: "t1".into(),
            station_id: "station-S".into(),
            granularity: Granularity::Day,
            period_start: month,
            recalculate: false,
        };
        assert_eq!(service.process(&ev).unwrap(), RollupOutcome::Completed);
        let agg = f
            .stats
            .get("station-S", Granularity::Month, "202602")
            .unwrap()
            .unwrap();
        assert_eq!(agg.fact.charge_kwh, 28.0);
    }

    #[test]
    fn test_foreign_granularity_is_ignored() {
        let f = fixture();
        let service = day_service(&f);
        let ev = StatisticCalculated {
            tenant_id: "t1".into(),
            station_id: "station-S".into(),
            granularity: Granularity::Day, // a DAY event is the MONTH service's food
            period_start: Utc.with_ymd_and_hms(2026, 8, 1, 0, 0, 0).unwrap(),
            recalculate: false,
        };
        assert_eq!(service.process(&ev).unwrap(), RollupOutcome::NotMyChild);
    }
}
