//! Backbone Metrics
//! Mission: Cheap atomic counters for the event backbone, snapshotted on demand
//!
//! No exporter dependency; the registry is an explicit constructor argument
//! and the API serves a JSON snapshot.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

#[derive(Default)]
pub struct DispatcherMetrics {
    pub ticks: AtomicU64,
    pub claimed: AtomicU64,
    pub sent: AtomicU64,
    pub failed: AtomicU64,
    pub dead_lettered: AtomicU64,
}

#[derive(Default)]
pub struct CommandMetrics {
    pub issued: AtomicU64,
    pub deduplicated: AtomicU64,
    pub acked: AtomicU64,
    pub failed: AtomicU64,
    pub timed_out: AtomicU64,
}

#[derive(Default)]
pub struct IngestMetrics {
    pub batches: AtomicU64,
    pub points: AtomicU64,
    pub rejected: AtomicU64,
}

/// Per-consumer delivery counters, keyed by consumer name.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ConsumerCounters {
    pub processed: u64,
    pub skipped: u64,
    pub failed: u64,
}

pub struct MetricsRegistry {
    pub dispatcher: DispatcherMetrics,
    pub commands: CommandMetrics,
    pub ingest: IngestMetrics,
    consumers: Mutex<HashMap<String, ConsumerCounters>>,
    started_at: Instant,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            dispatcher: DispatcherMetrics::default(),
            commands: CommandMetrics::default(),
            ingest: IngestMetrics::default(),
            consumers: Mutex::new(HashMap::new()),
            started_at: Instant::now(),
        }
    }

    pub fn consumer_processed(&self, consumer: &str) {
        self.consumers.lock().entry(consumer.to_string()).or_default().processed += 1;
    }

    pub fn consumer_skipped(&self, consumer: &str) {
        self.consumers.lock().entry(consumer.to_string()).or_default().skipped += 1;
    }

    pub fn consumer_failed(&self, consumer: &str) {
        self.consumers.lock().entry(consumer.to_string()).or_default().failed += 1;
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.started_at.elapsed().as_secs_f64(),
            dispatcher: DispatcherSnapshot {
                ticks: self.dispatcher.ticks.load(Ordering::Relaxed),
                claimed: self.dispatcher.claimed.load(Ordering::Relaxed),
                sent: self.dispatcher.sent.load(Ordering::Relaxed),
                failed: self.dispatcher.failed.load(Ordering::Relaxed),
                dead_lettered: self.dispatcher.dead_lettered.load(Ordering::Relaxed),
            },
            commands: CommandSnapshot {
                issued: self.commands.issued.load(Ordering::Relaxed),
                deduplicated: self.commands.deduplicated.load(Ordering::Relaxed),
                acked: self.commands.acked.load(Ordering::Relaxed),
                failed: self.commands.failed.load(Ordering::Relaxed),
                timed_out: self.commands.timed_out.load(Ordering::Relaxed),
            },
            ingest: IngestSnapshot {
                batches: self.ingest.batches.load(Ordering::Relaxed),
                points: self.ingest.points.load(Ordering::Relaxed),
                rejected: self.ingest.rejected.load(Ordering::Relaxed),
            },
            consumers: self.consumers.lock().clone(),
        }
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: f64,
    pub dispatcher: DispatcherSnapshot,
    pub commands: CommandSnapshot,
    pub ingest: IngestSnapshot,
    pub consumers: HashMap<String, ConsumerCounters>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DispatcherSnapshot {
    pub ticks: u64,
    pub claimed: u64,
    pub sent: u64,
    pub failed: u64,
    pub dead_lettered: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommandSnapshot {
    pub issued: u64,
    pub deduplicated: u64,
    pub acked: u64,
    pub failed: u64,
    pub timed_out: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestSnapshot {
    pub batches: u64,
    pub points: u64,
    pub rejected: u64,
}
