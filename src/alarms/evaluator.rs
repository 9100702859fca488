//! Alarm Evaluator
//! Mission: Drive the per-rule-per-originator lifecycle from telemetry with
//! hysteresis and duration debouncing
//!
//! The partial unique index is the last line of defense: on an insert race
//! the evaluator re-reads the surviving open alarm and reuses it.

use crate::alarms::models::{
    Alarm, AlarmRule, AlarmStatus, OriginatorType, PendingBreach,
};
use crate::alarms::store::{AlarmPendingStore, AlarmRuleStore, AlarmStore};
use crate::clock::Clock;
use crate::db::Db;
use crate::errors::{as_core, CoreError};
use crate::events::bus::{EventContext, EventHandler};
use crate::events::envelope::EventEnvelope;
use crate::events::outbox::OutboxStore;
use crate::events::payloads::{AlarmStateChanged, AlarmTransition, TelemetryReceived};
use crate::events::registry::EventPayload;
use crate::telemetry::models::resolve_mapping;
use crate::telemetry::store::PointMappingStore;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub struct AlarmEvaluator {
    db: Db,
    rules: AlarmRuleStore,
    pending: AlarmPendingStore,
    alarms: AlarmStore,
    mappings: PointMappingStore,
    clock: Arc<dyn Clock>,
}

impl AlarmEvaluator {
    pub fn new(
        db: Db,
        rules: AlarmRuleStore,
        pending: AlarmPendingStore,
        alarms: AlarmStore,
        mappings: PointMappingStore,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            db,
            rules,
            pending,
            alarms,
            mappings,
            clock,
        }
    }

    /// Evaluate every point of a telemetry batch against the station's rules.
    pub fn evaluate(&self, ev: &TelemetryReceived) -> Result<()> {
        let mappings = self.mappings.list_by_station(&ev.station_id)?;
        for point in &ev.points {
            let value = match point.value {
                Some(v) => v,
                None => continue,
            };
            let mapping = match resolve_mapping(&mappings, &point.device_id, &point.point_key) {
                Some(m) => m,
                None => continue,
            };
            let scaled = value * mapping.factor;

            // Device-scoped mappings alarm the device; station-wide mappings
            // alarm the station itself.
            let (originator_type, originator_id) = if mapping.device_id.is_some() {
                (OriginatorType::Device, point.device_id.clone())
            } else {
                (OriginatorType::Station, ev.station_id.clone())
            };

            let rules = self
                .rules
                .list_enabled_for_semantic(&ev.station_id, &mapping.semantic)?;
            for rule in rules {
                if rule.tenant_id != ev.tenant_id {
                    continue;
                }
                self.step(&rule, originator_type, &originator_id, scaled, point.ts)?;
            }
        }
        Ok(())
    }

    /// One state-machine step for `(rule, originator)` at `ts`.
    fn step(
        &self,
        rule: &AlarmRule,
        originator_type: OriginatorType,
        originator_id: &str,
        value: f64,
        ts: DateTime<Utc>,
    ) -> Result<()> {
        let breached = rule.operator.breached(value, rule.threshold);
        let open = self
            .alarms
            .find_open(&rule.tenant_id, &rule.id, originator_type, originator_id)?;

        if let Some(open) = open {
            if breached {
                self.alarms.update_last_value(open.id, value)?;
            } else if rule
                .operator
                .recovered(value, rule.threshold, rule.hysteresis)
            {
                self.clear_alarm(&open, value, ts)?;
            }
            // Inside the deadband: neither breach nor recovery, hold state.
            return Ok(());
        }

        if !breached {
            // Breach streak broken before the duration was satisfied.
            self.pending
                .clear(&rule.tenant_id, &rule.id, originator_type, originator_id)?;
            return Ok(());
        }

        if rule.duration_seconds == 0 {
            return self.open_alarm(rule, originator_type, originator_id, value, ts);
        }

        match self
            .pending
            .get(&rule.tenant_id, &rule.id, originator_type, originator_id)?
        {
            None => {
                self.pending.upsert(&PendingBreach {
                    tenant_id: rule.tenant_id.clone(),
                    rule_id: rule.id.clone(),
                    originator_type,
                    originator_id: originator_id.to_string(),
                    pending_since: ts,
                    last_value: value,
                })?;
                debug!(rule = rule.id, originator = originator_id, "breach pending");
                Ok(())
            }
            Some(pending) => {
                if (ts - pending.pending_since).num_seconds() >= rule.duration_seconds {
                    self.pending
                        .clear(&rule.tenant_id, &rule.id, originator_type, originator_id)?;
                    self.open_alarm(rule, originator_type, originator_id, value, ts)
                } else {
                    self.pending.upsert(&PendingBreach {
                        last_value: value,
                        ..pending
                    })?;
                    Ok(())
                }
            }
        }
    }

    fn open_alarm(
        &self,
        rule: &AlarmRule,
        originator_type: OriginatorType,
        originator_id: &str,
        value: f64,
        ts: DateTime<Utc>,
    ) -> Result<()> {
        let alarm = Alarm {
            id: Uuid::new_v4(),
            tenant_id: rule.tenant_id.clone(),
            station_id: rule.station_id.clone(),
            originator_type,
            originator_id: originator_id.to_string(),
            rule_id: rule.id.clone(),
            status: AlarmStatus::Active,
            start_at: ts,
            end_at: None,
            last_value: value,
            acked_at: None,
            cleared_at: None,
        };
        let now = self.clock.now();
        let envelope = EventEnvelope::build(
            &AlarmStateChanged {
                tenant_id: alarm.tenant_id.clone(),
                station_id: alarm.station_id.clone(),
                transition: AlarmTransition::Active,
                alarm: alarm.clone(),
                occurred_at: ts,
            },
            now,
        )?;

        let insert = {
            let mut conn = self.db.lock();
            let tx = conn.transaction().context("begin alarm open tx")?;
            match crate::alarms::store::AlarmStore::insert_open_tx(&tx, &alarm) {
                Ok(()) => {
                    OutboxStore::insert_tx(&tx, &envelope, now)?;
                    tx.commit().context("commit alarm open tx")?;
                    Ok(())
                }
                Err(e) => Err(e),
            }
        };

        match insert {
            Ok(()) => {
                info!(
                    rule = rule.name,
                    originator = originator_id,
                    value,
                    "alarm opened"
                );
                Ok(())
            }
            Err(e) if as_core(&e).map(CoreError::is_replay_noop).unwrap_or(false) => {
                // Lost the open-slot race; the winner's row absorbs the value.
                if let Some(winner) = self.alarms.find_open(
                    &rule.tenant_id,
                    &rule.id,
                    originator_type,
                    originator_id,
                )? {
                    self.alarms.update_last_value(winner.id, value)?;
                } else {
                    warn!(rule = rule.id, "open slot race with no surviving row");
                }
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn clear_alarm(&self, open: &Alarm, value: f64, ts: DateTime<Utc>) -> Result<()> {
        let mut cleared = open.clone();
        cleared.status = AlarmStatus::Cleared;
        cleared.end_at = Some(ts);
        cleared.cleared_at = Some(ts);
        cleared.last_value = value;

        let now = self.clock.now();
        let envelope = EventEnvelope::build(
            &AlarmStateChanged {
                tenant_id: cleared.tenant_id.clone(),
                station_id: cleared.station_id.clone(),
                transition: AlarmTransition::Cleared,
                alarm: cleared.clone(),
                occurred_at: ts,
            },
            now,
        )?;

        {
            let mut conn = self.db.lock();
            let tx = conn.transaction().context("begin alarm clear tx")?;
            AlarmStore::clear_tx(&tx, open.id, ts, value)?;
            OutboxStore::insert_tx(&tx, &envelope, now)?;
            tx.commit().context("commit alarm clear tx")?;
        }

        info!(alarm = %open.id, value, "alarm cleared");
        Ok(())
    }

    /// Operator acknowledgement. Active alarms transition and emit; an
    /// acknowledged alarm is a no-op; a cleared one is a conflict.
    pub fn acknowledge(&self, tenant_id: &str, alarm_id: Uuid) -> Result<Alarm> {
        let alarm = self
            .alarms
            .get(tenant_id, alarm_id)?
            .ok_or_else(|| CoreError::not_found(format!("alarm {}", alarm_id)))?;

        match alarm.status {
            AlarmStatus::Acknowledged => Ok(alarm),
            AlarmStatus::Cleared => {
                Err(CoreError::Conflict(format!("alarm {} already cleared", alarm_id)).into())
            }
            AlarmStatus::Active => {
                let now = self.clock.now();
                let mut acked = alarm;
                acked.status = AlarmStatus::Acknowledged;
                acked.acked_at = Some(now);

                let envelope = EventEnvelope::build(
                    &AlarmStateChanged {
                        tenant_id: acked.tenant_id.clone(),
                        station_id: acked.station_id.clone(),
                        transition: AlarmTransition::Acknowledged,
                        alarm: acked.clone(),
                        occurred_at: now,
                    },
                    now,
                )?;

                {
                    let mut conn = self.db.lock();
                    let tx = conn.transaction().context("begin alarm ack tx")?;
                    AlarmStore::acknowledge_tx(&tx, alarm_id, now)?;
                    OutboxStore::insert_tx(&tx, &envelope, now)?;
                    tx.commit().context("commit alarm ack tx")?;
                }
                Ok(acked)
            }
        }
    }
}

#[async_trait]
impl EventHandler for AlarmEvaluator {
    fn name(&self) -> &str {
        "alarm_evaluator"
    }

    async fn handle(&self, _ctx: &EventContext, event: &EventPayload) -> Result<()> {
        match event {
            EventPayload::TelemetryReceived(ev) => self.evaluate(ev),
            _ => Ok(()),
        }
    }
}
