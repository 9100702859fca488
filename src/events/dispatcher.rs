//! Outbox Dispatcher
//! Mission: At-least-once delivery from the outbox to the bus, with
//! per-consumer idempotency and dead-lettering for poison events
//!
//! Retry policy: transient handler failures leave the row pending and bump
//! the attempt counter; decode failures and rows past the attempt budget go
//! to the DLQ with the row marked failed.

use crate::clock::Clock;
use crate::errors::as_core;
use crate::events::bus::{EventContext, EventHandler, InProcessBus};
use crate::events::outbox::{OutboxRecord, OutboxStore};
use crate::events::processed::{DeadLetterStore, ProcessedStore};
use crate::events::registry::{EventPayload, EventRegistry};
use crate::metrics::MetricsRegistry;
use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct DispatchResult {
    pub requested: usize,
    pub claimed: usize,
    pub sent: usize,
    pub failed: usize,
    pub dlq: usize,
}

pub struct Dispatcher {
    outbox: OutboxStore,
    dlq: DeadLetterStore,
    registry: Arc<EventRegistry>,
    bus: Arc<InProcessBus>,
    metrics: Arc<MetricsRegistry>,
    clock: Arc<dyn Clock>,
    max_attempts: u32,
}

impl Dispatcher {
    pub fn new(
        outbox: OutboxStore,
        dlq: DeadLetterStore,
        registry: Arc<EventRegistry>,
        bus: Arc<InProcessBus>,
        metrics: Arc<MetricsRegistry>,
        clock: Arc<dyn Clock>,
        max_attempts: u32,
    ) -> Self {
        Self {
            outbox,
            dlq,
            registry,
            bus,
            metrics,
            clock,
            max_attempts: max_attempts.max(1),
        }
    }

    /// One delivery pass: claim up to `limit` pending rows FIFO and publish
    /// each. Errors are per-row; the pass itself always completes and the
    /// first error is carried in the result for the caller's logging.
    pub async fn dispatch(&self, limit: usize) -> (DispatchResult, Option<String>) {
        let mut result = DispatchResult {
            requested: limit,
            ..Default::default()
        };
        let mut first_error: Option<String> = None;

        let pending = match self.outbox.list_pending(limit) {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, "outbox claim failed");
                return (result, Some(e.to_string()));
            }
        };
        result.claimed = pending.len();

        for record in pending {
            match self.registry.decode(&record.envelope) {
                Ok(payload) => {
                    if let Err(e) = self.deliver(&record, payload, &mut result).await {
                        if first_error.is_none() {
                            first_error = Some(e.to_string());
                        }
                    }
                }
                Err(decode_err) => {
                    // Poison before any consumer ran.
                    self.dead_letter(&record, &decode_err.to_string(), &mut result);
                    if first_error.is_none() {
                        first_error = Some(decode_err.to_string());
                    }
                }
            }
        }

        self.metrics.dispatcher.ticks.fetch_add(1, Ordering::Relaxed);
        self.metrics
            .dispatcher
            .claimed
            .fetch_add(result.claimed as u64, Ordering::Relaxed);
        self.metrics
            .dispatcher
            .sent
            .fetch_add(result.sent as u64, Ordering::Relaxed);
        self.metrics
            .dispatcher
            .failed
            .fetch_add(result.failed as u64, Ordering::Relaxed);
        self.metrics
            .dispatcher
            .dead_lettered
            .fetch_add(result.dlq as u64, Ordering::Relaxed);

        (result, first_error)
    }

    /// Drain until the outbox has no deliverable pending rows left. Used by
    /// tests and the window-close fast path; production draining is the
    /// scheduler tick.
    pub async fn drain(&self, batch: usize) -> DispatchResult {
        let mut total = DispatchResult::default();
        loop {
            let (pass, _) = self.dispatch(batch).await;
            total.claimed += pass.claimed;
            total.sent += pass.sent;
            total.failed += pass.failed;
            total.dlq += pass.dlq;
            if pass.sent == 0 {
                break;
            }
        }
        total
    }

    async fn deliver(
        &self,
        record: &OutboxRecord,
        payload: EventPayload,
        result: &mut DispatchResult,
    ) -> Result<()> {
        let ctx = EventContext::with_envelope(record.envelope.clone());
        match self
            .bus
            .publish(&ctx, &record.envelope.event_type, &payload)
            .await
        {
            Ok(()) => {
                self.outbox.mark_sent(record.id, self.clock.now())?;
                result.sent += 1;
                Ok(())
            }
            Err(e) => {
                result.failed += 1;
                let poison = as_core(&e).map(|c| c.is_poison()).unwrap_or(false);
                if poison {
                    self.dead_letter(record, &e.to_string(), result);
                } else {
                    let attempts = self.outbox.record_attempt(record.id)?;
                    if attempts >= self.max_attempts {
                        self.dead_letter_exhausted(record, &e.to_string(), result);
                    } else {
                        debug!(
                            outbox_id = record.id,
                            attempts,
                            error = %e,
                            "delivery failed, row stays pending"
                        );
                    }
                }
                Err(e)
            }
        }
    }

    fn dead_letter(&self, record: &OutboxRecord, error: &str, result: &mut DispatchResult) {
        if let Err(e) = self.outbox.mark_failed(record.id) {
            warn!(outbox_id = record.id, error = %e, "mark_failed failed");
        }
        self.upsert_dlq(record, error, result);
    }

    /// Row already carries the bumped attempt count; only flip the status.
    fn dead_letter_exhausted(
        &self,
        record: &OutboxRecord,
        error: &str,
        result: &mut DispatchResult,
    ) {
        let conn_err = self.outbox.mark_failed(record.id).err();
        if let Some(e) = conn_err {
            warn!(outbox_id = record.id, error = %e, "mark_failed failed");
        }
        self.upsert_dlq(record, &format!("attempts exhausted: {}", error), result);
    }

    fn upsert_dlq(&self, record: &OutboxRecord, error: &str, result: &mut DispatchResult) {
        let payload = String::from_utf8_lossy(&record.envelope.payload).into_owned();
        if let Err(e) = self.dlq.record_failure(
            &record.envelope.event_id.to_string(),
            &record.envelope.event_type,
            &payload,
            error,
            self.clock.now(),
        ) {
            warn!(outbox_id = record.id, error = %e, "dlq upsert failed");
        }
        result.dlq += 1;
    }
}

/// Wrap a consumer so redeliveries become silent no-ops.
///
/// - Context without an envelope: pass straight through.
/// - Already in the processed ledger: skip.
/// - Otherwise run the inner handler; success marks the ledger, failure
///   propagates so the outbox row stays pending for retry.
pub fn wrap_handler(
    consumer: &'static str,
    inner: Arc<dyn EventHandler>,
    processed: ProcessedStore,
    metrics: Arc<MetricsRegistry>,
    clock: Arc<dyn Clock>,
) -> Arc<dyn EventHandler> {
    Arc::new(IdempotentHandler {
        consumer,
        inner,
        processed,
        metrics,
        clock,
    })
}

struct IdempotentHandler {
    consumer: &'static str,
    inner: Arc<dyn EventHandler>,
    processed: ProcessedStore,
    metrics: Arc<MetricsRegistry>,
    clock: Arc<dyn Clock>,
}

#[async_trait]
impl EventHandler for IdempotentHandler {
    fn name(&self) -> &str {
        self.consumer
    }

    async fn handle(&self, ctx: &EventContext, event: &EventPayload) -> Result<()> {
        let envelope = match &ctx.envelope {
            Some(env) => env,
            None => return self.inner.handle(ctx, event).await,
        };

        let event_id = envelope.event_id.to_string();
        if self.processed.has_processed(&event_id, self.consumer)? {
            self.metrics.consumer_skipped(self.consumer);
            debug!(
                consumer = self.consumer,
                event_id = %event_id,
                "replay skipped"
            );
            return Ok(());
        }

        match self.inner.handle(ctx, event).await {
            Ok(()) => {
                self.processed
                    .mark_processed(&event_id, self.consumer, self.clock.now())?;
                self.metrics.consumer_processed(self.consumer);
                Ok(())
            }
            Err(e) => {
                self.metrics.consumer_failed(self.consumer);
                Err(e)
            }
        }
    }
}
