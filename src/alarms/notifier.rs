//! Alarm Notification Fan-Out
//! Mission: Best-effort delivery to operators, SSE stream for the UI,
//! cooldown and dedup so flapping rules don't spam anyone
//!
//! Notification failures never fail the handler; the alarm row is already
//! durable by the time this runs.

use crate::clock::Clock;
use crate::events::bus::{EventContext, EventHandler};
use crate::events::payloads::AlarmStateChanged;
use crate::events::registry::EventPayload;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &AlarmStateChanged, message: &str) -> Result<()>;
}

/// Default transport: structured log lines. Real deployments plug a webhook
/// implementation in its place.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, event: &AlarmStateChanged, message: &str) -> Result<()> {
        info!(
            station = event.station_id,
            transition = ?event.transition,
            "🔔 {}",
            message
        );
        Ok(())
    }
}

/// Cooldown per `(rule, originator)` plus a dedup window keyed on the
/// rendered content hash.
pub struct NotifyGate {
    cooldown: Duration,
    dedup_window: Duration,
    last_sent: Mutex<HashMap<(String, String), DateTime<Utc>>>,
    seen_content: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl NotifyGate {
    pub fn new(cooldown: Duration, dedup_window: Duration) -> Self {
        Self {
            cooldown,
            dedup_window,
            last_sent: Mutex::new(HashMap::new()),
            seen_content: Mutex::new(HashMap::new()),
        }
    }

    pub fn allow(
        &self,
        rule_id: &str,
        originator_id: &str,
        content: &str,
        now: DateTime<Utc>,
    ) -> bool {
        let digest = hex::encode(Sha256::digest(content.as_bytes()));
        {
            let mut seen = self.seen_content.lock();
            seen.retain(|_, t| now - *t < self.dedup_window);
            if seen.contains_key(&digest) {
                return false;
            }
            seen.insert(digest, now);
        }

        let key = (rule_id.to_string(), originator_id.to_string());
        let mut last = self.last_sent.lock();
        if let Some(prev) = last.get(&key) {
            if now - *prev < self.cooldown {
                return false;
            }
        }
        last.insert(key, now);
        true
    }
}

/// Buffered fan-out for the SSE endpoint. Slow subscribers lag and drop
/// instead of blocking the broker.
pub struct SseBroker {
    tx: broadcast::Sender<String>,
}

impl SseBroker {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(16);
        Self { tx }
    }

    pub fn publish(&self, json: String) {
        // No subscribers is fine; send only fails then.
        let _ = self.tx.send(json);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }
}

impl Default for SseBroker {
    fn default() -> Self {
        Self::new()
    }
}

pub struct NotifierConsumer {
    notifier: Arc<dyn Notifier>,
    gate: NotifyGate,
    broker: Arc<SseBroker>,
    clock: Arc<dyn Clock>,
}

impl NotifierConsumer {
    pub fn new(
        notifier: Arc<dyn Notifier>,
        gate: NotifyGate,
        broker: Arc<SseBroker>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            notifier,
            gate,
            broker,
            clock,
        }
    }

    fn render(event: &AlarmStateChanged) -> String {
        format!(
            "alarm {:?} rule={} originator={}/{} value={:.3}",
            event.transition,
            event.alarm.rule_id,
            event.alarm.originator_type.as_str(),
            event.alarm.originator_id,
            event.alarm.last_value,
        )
    }
}

#[async_trait]
impl EventHandler for NotifierConsumer {
    fn name(&self) -> &str {
        "alarm_notifier"
    }

    async fn handle(&self, _ctx: &EventContext, event: &EventPayload) -> Result<()> {
        let ev = match event {
            EventPayload::AlarmStateChanged(ev) => ev,
            _ => return Ok(()),
        };

        if let Ok(json) = serde_json::to_string(ev) {
            self.broker.publish(json);
        }

        let message = Self::render(ev);
        let now = self.clock.now();
        if !self
            .gate
            .allow(&ev.alarm.rule_id, &ev.alarm.originator_id, &message, now)
        {
            debug!(rule = ev.alarm.rule_id, "notification suppressed by gate");
            return Ok(());
        }

        if let Err(e) = self.notifier.notify(ev, &message).await {
            // Best-effort: never bounce the event back to the outbox.
            warn!(error = %e, "notifier delivery failed");
        }
        Ok(())
    }
}
