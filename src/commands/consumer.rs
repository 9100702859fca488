//! Command Dispatch Consumer
//! Mission: Carry issued commands to the device gateway and reconcile the
//! returned status into the command row

use crate::clock::Clock;
use crate::commands::gateway::{DeviceInvokeStatus, DeviceRpc};
use crate::commands::models::CommandStatus;
use crate::commands::store::CommandStore;
use crate::db::Db;
use crate::events::bus::{EventContext, EventHandler};
use crate::events::envelope::EventEnvelope;
use crate::events::outbox::OutboxStore;
use crate::events::payloads::{CommandAcked, CommandFailed, CommandIssued};
use crate::events::registry::EventPayload;
use crate::metrics::MetricsRegistry;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct CommandDispatchConsumer {
    db: Db,
    store: CommandStore,
    rpc: Arc<dyn DeviceRpc>,
    metrics: Arc<MetricsRegistry>,
    clock: Arc<dyn Clock>,
}

impl CommandDispatchConsumer {
    pub fn new(
        db: Db,
        store: CommandStore,
        rpc: Arc<dyn DeviceRpc>,
        metrics: Arc<MetricsRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            db,
            store,
            rpc,
            metrics,
            clock,
        }
    }

    async fn dispatch(&self, ev: &CommandIssued) -> Result<()> {
        let command = match self.store.get(&ev.tenant_id, ev.command_id)? {
            Some(c) => c,
            None => {
                // Unborn resource: swallow, the row may arrive on replay.
                warn!(command = %ev.command_id, "issued event without a command row");
                return Ok(());
            }
        };
        if command.status.is_terminal() {
            debug!(command = %ev.command_id, status = ?command.status, "already settled");
            return Ok(());
        }

        // Transport failures bubble up; the outbox row stays pending and a
        // later sweep retries the invoke.
        let result = self
            .rpc
            .invoke(
                &ev.tenant_id,
                &ev.station_id,
                &ev.device_id,
                &ev.command_type,
                &ev.payload,
            )
            .await?;

        let now = self.clock.now();
        match result.status {
            DeviceInvokeStatus::Acked => {
                let acked = CommandAcked {
                    tenant_id: ev.tenant_id.clone(),
                    station_id: ev.station_id.clone(),
                    command_id: ev.command_id,
                    acked_at: now,
                };
                let envelope = EventEnvelope::build(&acked, now)?;
                {
                    let mut conn = self.db.lock();
                    let tx = conn.transaction().context("begin command ack tx")?;
                    CommandStore::mark_acked_tx(&tx, ev.command_id, now)?;
                    OutboxStore::insert_tx(&tx, &envelope, now)?;
                    tx.commit().context("commit command ack tx")?;
                }
                self.metrics.commands.acked.fetch_add(1, Ordering::Relaxed);
                info!(command = %ev.command_id, "command acked");
            }
            DeviceInvokeStatus::Failed => {
                let error = result.error.unwrap_or_else(|| "device rejected".to_string());
                let failed = CommandFailed {
                    tenant_id: ev.tenant_id.clone(),
                    station_id: ev.station_id.clone(),
                    command_id: ev.command_id,
                    error: error.clone(),
                    failed_at: now,
                };
                let envelope = EventEnvelope::build(&failed, now)?;
                {
                    let mut conn = self.db.lock();
                    let tx = conn.transaction().context("begin command fail tx")?;
                    CommandStore::mark_failed_tx(&tx, ev.command_id, &error)?;
                    OutboxStore::insert_tx(&tx, &envelope, now)?;
                    tx.commit().context("commit command fail tx")?;
                }
                self.metrics.commands.failed.fetch_add(1, Ordering::Relaxed);
                warn!(command = %ev.command_id, error, "command failed");
            }
            DeviceInvokeStatus::Sent => {
                // Async device path: the timeout sweep owns orphans from here.
                if command.status == CommandStatus::Created {
                    self.store.mark_sent(ev.command_id, now)?;
                }
                debug!(command = %ev.command_id, "command sent, awaiting async ack");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl EventHandler for CommandDispatchConsumer {
    fn name(&self) -> &str {
        "command_dispatch"
    }

    async fn handle(&self, _ctx: &EventContext, event: &EventPayload) -> Result<()> {
        match event {
            EventPayload::CommandIssued(ev) => self.dispatch(ev).await,
            _ => Ok(()),
        }
    }
}
