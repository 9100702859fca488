//! Background Scheduler
//! Mission: Cooperative periodic ticks for dispatch drain, strategy
//! evaluation, and the command timeout sweep
//!
//! Each loop is sequential, so an iteration can never overlap itself;
//! missed ticks are skipped instead of bursting to catch up.

use crate::commands::service::TimeoutSweeper;
use crate::events::dispatcher::Dispatcher;
use crate::strategy::engine::StrategyEngine;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, warn};

pub fn spawn_dispatcher_loop(
    dispatcher: Arc<Dispatcher>,
    interval_ms: u64,
    batch: usize,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_millis(interval_ms.max(10)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let (result, first_error) = dispatcher.dispatch(batch).await;
            if result.claimed > 0 {
                debug!(
                    claimed = result.claimed,
                    sent = result.sent,
                    failed = result.failed,
                    dlq = result.dlq,
                    "dispatch pass"
                );
            }
            if let Some(error) = first_error {
                // Non-fatal; the next tick retries whatever stayed pending.
                warn!(error, "dispatch pass had failures");
            }
        }
    })
}

pub fn spawn_strategy_loop(engine: Arc<StrategyEngine>, interval_secs: u64) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(interval_secs.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            match engine.evaluate_all() {
                Ok(evaluated) if evaluated > 0 => {
                    debug!(evaluated, "strategy tick");
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "strategy tick failed"),
            }
        }
    })
}

pub fn spawn_timeout_sweep_loop(sweeper: Arc<TimeoutSweeper>, interval_secs: u64) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(interval_secs.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if let Err(e) = sweeper.sweep() {
                warn!(error = %e, "timeout sweep failed");
            }
        }
    })
}
