//! Strategy Engine
//! Mission: Calendar-gated periodic evaluation turning live telemetry into
//! curtailment commands
//!
//! The per-minute idempotency key suppresses duplicate issues when ticks
//! overlap or the scheduler catches up after a stall.

use crate::clock::Clock;
use crate::commands::models::IssueCommandRequest;
use crate::commands::service::CommandService;
use crate::strategy::models::{RunOutcome, Strategy, StrategyRun, StrategyTemplate};
use crate::strategy::store::StrategyStore;
use crate::telemetry::models::SEMANTIC_GRID_EXPORT;
use crate::telemetry::store::{MeasurementStore, PointMappingStore};
use anyhow::Result;
use chrono::{Datelike, Timelike};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct StrategyEngine {
    strategies: StrategyStore,
    mappings: PointMappingStore,
    measurements: MeasurementStore,
    commands: Arc<CommandService>,
    clock: Arc<dyn Clock>,
}

impl StrategyEngine {
    pub fn new(
        strategies: StrategyStore,
        mappings: PointMappingStore,
        measurements: MeasurementStore,
        commands: Arc<CommandService>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            strategies,
            mappings,
            measurements,
            commands,
            clock,
        }
    }

    /// One scheduler tick: evaluate every auto-enabled strategy whose
    /// calendar covers this moment. Returns how many were evaluated.
    pub fn evaluate_all(&self) -> Result<usize> {
        let now = self.clock.now();
        let weekday = now.weekday().num_days_from_monday() as u8;
        let minute_of_day = now.hour() * 60 + now.minute();

        let mut evaluated = 0;
        for strategy in self.strategies.list_auto_enabled()? {
            let in_window = self
                .strategies
                .calendar_for(&strategy.id, weekday)?
                .map(|cal| cal.covers(minute_of_day))
                .unwrap_or(false);
            if !in_window {
                debug!(strategy = strategy.id, "outside calendar window");
                continue;
            }

            if let Err(e) = self.evaluate_one(&strategy) {
                // One broken strategy never starves the rest of the tick.
                warn!(strategy = strategy.id, error = %e, "strategy evaluation failed");
            }
            evaluated += 1;
        }
        Ok(evaluated)
    }

    fn evaluate_one(&self, strategy: &Strategy) -> Result<()> {
        match &strategy.template {
            StrategyTemplate::AntiBackflow {
                threshold_kw,
                min_kw,
                max_kw,
                device_id,
            } => self.anti_backflow(strategy, *threshold_kw, *min_kw, *max_kw, device_id.as_deref()),
        }
    }

    fn anti_backflow(
        &self,
        strategy: &Strategy,
        threshold_kw: f64,
        min_kw: f64,
        max_kw: f64,
        device_id: Option<&str>,
    ) -> Result<()> {
        let now = self.clock.now();

        // Grid export is the sum over every mapped export point's latest value.
        let mappings = self
            .mappings
            .list_by_semantic(&strategy.station_id, SEMANTIC_GRID_EXPORT)?;
        let mut export_kw = 0.0;
        let mut have_reading = false;
        for mapping in &mappings {
            if let Some((_, raw)) = self.measurements.latest_numeric(
                &strategy.station_id,
                mapping.device_id.as_deref(),
                &mapping.point_key,
            )? {
                export_kw += raw * mapping.factor;
                have_reading = true;
            }
        }

        if !have_reading {
            return self.record(strategy, RunOutcome::Error, Some("no grid export reading"), None);
        }
        if export_kw <= threshold_kw {
            return self.record(strategy, RunOutcome::NoAction, None, None);
        }
        let target = match device_id {
            Some(d) => d,
            None => {
                return self.record(
                    strategy,
                    RunOutcome::Error,
                    Some("no target device configured"),
                    None,
                )
            }
        };

        let limit_kw = round3(export_kw.clamp(min_kw, max_kw));
        let idempotency_key = format!(
            "strategy:{}:{}:{}",
            strategy.station_id,
            now.format("%Y%m%d%H%M"),
            target
        );
        let request = IssueCommandRequest {
            tenant_id: None,
            station_id: strategy.station_id.clone(),
            device_id: target.to_string(),
            command_type: "anti_backflow_limit".to_string(),
            payload: serde_json::json!({ "limit_kw": limit_kw }),
            idempotency_key: Some(idempotency_key),
        };
        let (command, deduped) = self.commands.issue(&strategy.tenant_id, &request)?;
        if !deduped {
            info!(
                strategy = strategy.id,
                export_kw,
                limit_kw,
                command = %command.command_id,
                "anti-backflow curtailment issued"
            );
        }
        self.record(
            strategy,
            RunOutcome::Issued,
            Some(&format!("limit_kw={}", limit_kw)),
            Some(command.command_id),
        )
    }

    fn record(
        &self,
        strategy: &Strategy,
        outcome: RunOutcome,
        detail: Option<&str>,
        command_id: Option<uuid::Uuid>,
    ) -> Result<()> {
        self.strategies.append_run(&StrategyRun {
            strategy_id: strategy.id.clone(),
            ts: self.clock.now(),
            outcome,
            detail: detail.map(|s| s.to_string()),
            command_id,
        })
    }
}

fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::commands::store::CommandStore;
    use crate::db::{open_memory_db, Db};
    use crate::events::outbox::OutboxStore;
    use crate::metrics::MetricsRegistry;
    use crate::strategy::models::StrategyCalendar;
    use crate::telemetry::models::{MeasurementRow, PointMapping, QUALITY_GOOD};
    use chrono::{TimeZone, Utc};

    struct Fixture {
        db: Db,
        engine: StrategyEngine,
        strategies: StrategyStore,
        commands: CommandStore,
        clock: ManualClock,
    }

    // 2026-08-03 is a Monday.
    fn fixture(device_id: Option<&str>) -> Fixture {
        let db = open_memory_db().unwrap();
        let strategies = StrategyStore::new(db.clone()).unwrap();
        let mappings = PointMappingStore::new(db.clone()).unwrap();
        let measurements = MeasurementStore::new(db.clone()).unwrap();
        let command_store = CommandStore::new(db.clone()).unwrap();
        OutboxStore::new(db.clone()).unwrap();
        let clock = ManualClock::at(Utc.with_ymd_and_hms(2026, 8, 3, 12, 0, 0).unwrap());
        let command_service = Arc::new(CommandService::new(
            db.clone(),
            command_store.clone(),
            Arc::new(MetricsRegistry::new()),
            Arc::new(clock.clone()),
            chrono::Duration::minutes(10),
        ));

        mappings
            .upsert(&PointMapping {
                id: "m-export".into(),
                station_id: "station-S".into(),
                device_id: None,
                point_key: "p.export".into(),
                semantic: SEMANTIC_GRID_EXPORT.into(),
                unit: "kW".into(),
                factor: 1.0,
            })
            .unwrap();

        strategies
            .upsert(&Strategy {
                id: "s1".into(),
                tenant_id: "t1".into(),
                station_id: "station-S".into(),
                name: "anti backflow".into(),
                template: StrategyTemplate::AntiBackflow {
                    threshold_kw: 5.0,
                    min_kw: 1.0,
                    max_kw: 50.0,
                    device_id: device_id.map(|d| d.to_string()),
                },
                auto_enabled: true,
            })
            .unwrap();
        strategies
            .set_calendar(&StrategyCalendar {
                strategy_id: "s1".into(),
                weekday: 0,
                start_minute: 0,
                end_minute: 1440,
                enabled: true,
            })
            .unwrap();

        let engine = StrategyEngine::new(
            strategies.clone(),
            mappings,
            measurements,
            command_service,
            Arc::new(clock.clone()),
        );
        Fixture {
            db,
            engine,
            strategies,
            commands: command_store,
            clock,
        }
    }

    fn seed_export(db: &Db, value: f64, ts: chrono::DateTime<Utc>) {
        let conn = db.lock();
        MeasurementStore::insert_batch_tx(
            &conn,
            &[MeasurementRow {
                tenant_id: "t1".into(),
                station_id: "station-S".into(),
                device_id: "meter-1".into(),
                point_key: "p.export".into(),
                ts,
                value_numeric: Some(value),
                value_text: None,
                quality: QUALITY_GOOD.into(),
            }],
        )
        .unwrap();
    }

    #[test]
    fn test_below_threshold_records_no_action() {
        let f = fixture(Some("pcs-1"));
        seed_export(&f.db, 3.0, f.clock.now());

        assert_eq!(f.engine.evaluate_all().unwrap(), 1);
        let runs = f.strategies.list_runs("s1", 10).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].outcome, RunOutcome::NoAction);
        assert!(runs[0].command_id.is_none());
    }

    #[test]
    fn test_breach_issues_clamped_rounded_command() {
        let f = fixture(Some("pcs-1"));
        seed_export(&f.db, 123.4567, f.clock.now());

        f.engine.evaluate_all().unwrap();
        let runs = f.strategies.list_runs("s1", 10).unwrap();
        assert_eq!(runs[0].outcome, RunOutcome::Issued);

        let command_id = runs[0].command_id.unwrap();
        let cmd = f.commands.get("t1", command_id).unwrap().unwrap();
        assert_eq!(cmd.command_type, "anti_backflow_limit");
        // 123.4567 clamps to max_kw=50.
        assert_eq!(cmd.payload["limit_kw"], serde_json::json!(50.0));
        assert!(cmd.idempotency_key.starts_with("strategy:station-S:"));
        assert!(cmd.idempotency_key.ends_with(":pcs-1"));
    }

    #[test]
    fn test_duplicate_tick_in_same_minute_is_deduplicated() {
        let f = fixture(Some("pcs-1"));
        seed_export(&f.db, 20.0, f.clock.now());

        f.engine.evaluate_all().unwrap();
        f.clock.advance(chrono::Duration::seconds(20));
        f.engine.evaluate_all().unwrap();

        let runs = f.strategies.list_runs("s1", 10).unwrap();
        assert_eq!(runs.len(), 2, "both runs recorded");
        assert_eq!(
            runs[0].command_id, runs[1].command_id,
            "same UTC minute resolves to the same command"
        );
    }

    #[test]
    fn test_missing_device_records_error_run() {
        let f = fixture(None);
        seed_export(&f.db, 20.0, f.clock.now());

        f.engine.evaluate_all().unwrap();
        let runs = f.strategies.list_runs("s1", 10).unwrap();
        assert_eq!(runs[0].outcome, RunOutcome::Error);
        assert!(runs[0].detail.as_deref().unwrap().contains("device"));
    }

    #[test]
    fn test_calendar_blocks_evaluation() {
        let f = fixture(Some("pcs-1"));
        seed_export(&f.db, 20.0, f.clock.now());
        f.strategies
            .set_calendar(&StrategyCalendar {
                strategy_id: "s1".into(),
                weekday: 0,
                start_minute: 0,
                end_minute: 60, // only the first hour of Monday
                enabled: true,
            })
            .unwrap();

        assert_eq!(f.engine.evaluate_all().unwrap(), 0);
        assert!(f.strategies.list_runs("s1", 10).unwrap().is_empty());
    }
}
