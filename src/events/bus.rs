//! In-Process Event Bus
//! Mission: Fan events out to subscribers in insertion order, surviving
//! individual handler failures
//!
//! Publish never short-circuits: every handler runs, and the first error is
//! surfaced to the dispatcher afterwards.

use crate::events::envelope::EventEnvelope;
use crate::events::registry::EventPayload;
use anyhow::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// Per-delivery context. The dispatcher attaches the envelope; direct calls
/// (tests, local replays) may run detached.
#[derive(Debug, Clone, Default)]
pub struct EventContext {
    pub envelope: Option<EventEnvelope>,
}

impl EventContext {
    pub fn with_envelope(envelope: EventEnvelope) -> Self {
        Self {
            envelope: Some(envelope),
        }
    }

    pub fn detached() -> Self {
        Self::default()
    }
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Stable name, used for logging and the processed ledger.
    fn name(&self) -> &str;

    async fn handle(&self, ctx: &EventContext, event: &EventPayload) -> Result<()>;
}

/// Subscription seam; concrete buses decide how delivery happens.
pub trait Subscriber {
    fn subscribe(&self, type_name: &'static str, handler: Arc<dyn EventHandler>);
}

pub struct InProcessBus {
    handlers: RwLock<HashMap<&'static str, Vec<Arc<dyn EventHandler>>>>,
}

impl InProcessBus {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    pub fn handler_count(&self, type_name: &str) -> usize {
        self.handlers
            .read()
            .get(type_name)
            .map(|v| v.len())
            .unwrap_or(0)
    }

    /// Serially invoke every subscriber for the event's type. All handlers
    /// run even when an earlier one fails; the first error wins.
    pub async fn publish(
        &self,
        ctx: &EventContext,
        type_name: &str,
        event: &EventPayload,
    ) -> Result<()> {
        let handlers: Vec<Arc<dyn EventHandler>> = self
            .handlers
            .read()
            .get(type_name)
            .cloned()
            .unwrap_or_default();

        let mut first_err: Option<anyhow::Error> = None;
        for handler in handlers {
            if let Err(e) = handler.handle(ctx, event).await {
                warn!(
                    handler = handler.name(),
                    event_type = type_name,
                    error = %e,
                    "handler failed"
                );
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Subscriber for InProcessBus {
    fn subscribe(&self, type_name: &'static str, handler: Arc<dyn EventHandler>) {
        self.handlers
            .write()
            .entry(type_name)
            .or_default()
            .push(handler);
    }
}

impl Default for InProcessBus {
    fn default() -> Self {
        Self::new()
    }
}
