//! Hour Window Closer
//! Mission: Announce that an hour of telemetry is ready for aggregation
//!
//! Triggered by an operator call or a scheduled job; the hourly statistic
//! service does the actual work when the event arrives.

use crate::clock::Clock;
use crate::errors::CoreError;
use crate::events::envelope::EventEnvelope;
use crate::events::outbox::OutboxStore;
use crate::events::payloads::TelemetryWindowClosed;
use anyhow::Result;
use chrono::{DateTime, Timelike, Utc};
use std::sync::Arc;
use tracing::info;

pub struct WindowCloser {
    outbox: OutboxStore,
    clock: Arc<dyn Clock>,
}

impl WindowCloser {
    pub fn new(outbox: OutboxStore, clock: Arc<dyn Clock>) -> Self {
        Self { outbox, clock }
    }

    /// Stage a `TelemetryWindowClosed` for `[window_start, window_end)`.
    /// `window_end` defaults to one hour after the start.
    pub fn close(
        &self,
        tenant_id: &str,
        station_id: &str,
        window_start: DateTime<Utc>,
        window_end: Option<DateTime<Utc>>,
        recalculate: bool,
    ) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
        if station_id.is_empty() {
            return Err(CoreError::validation("station_id is required").into());
        }
        if window_start.minute() != 0 || window_start.second() != 0 {
            return Err(CoreError::validation("windowStart must be hour-aligned").into());
        }
        let window_end = window_end.unwrap_or(window_start + chrono::Duration::hours(1));
        if window_end <= window_start {
            return Err(CoreError::validation("windowEnd must be after windowStart").into());
        }

        let payload = TelemetryWindowClosed {
            tenant_id: tenant_id.to_string(),
            station_id: station_id.to_string(),
            window_start,
            window_end,
            recalculate,
        };
        let now = self.clock.now();
        let envelope = EventEnvelope::build(&payload, now)?;
        self.outbox.insert(&envelope, now)?;

        info!(
            station = station_id,
            window_start = %window_start,
            recalculate,
            "telemetry window closed"
        );
        Ok((window_start, window_end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::db::open_memory_db;
    use chrono::TimeZone;

    fn closer(db: crate::db::Db) -> WindowCloser {
        let outbox = OutboxStore::new(db).unwrap();
        let clock = ManualClock::at(Utc.with_ymd_and_hms(2026, 8, 1, 14, 0, 5).unwrap());
        WindowCloser::new(outbox, Arc::new(clock))
    }

    #[test]
    fn test_close_defaults_to_one_hour() {
        let db = open_memory_db().unwrap();
        let closer = closer(db.clone());
        let start = Utc.with_ymd_and_hms(2026, 8, 1, 13, 0, 0).unwrap();

        let (s, e) = closer.close("t1", "station-S", start, None, false).unwrap();
        assert_eq!(s, start);
        assert_eq!(e, start + chrono::Duration::hours(1));

        let outbox = OutboxStore::new(db).unwrap();
        let pending = outbox.list_pending(10).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].envelope.event_type, "TelemetryWindowClosed");
    }

    #[test]
    fn test_close_rejects_unaligned_start() {
        let db = open_memory_db().unwrap();
        let closer = closer(db);
        let start = Utc.with_ymd_and_hms(2026, 8, 1, 13, 30, 0).unwrap();
        let err = closer.close("t1", "station-S", start, None, false).unwrap_err();
        assert!(matches!(
            crate::errors::as_core(&err),
            Some(CoreError::Validation(_))
        ));
    }
}
