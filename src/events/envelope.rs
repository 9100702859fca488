//! Event Envelope
//! Mission: Uniform metadata wrapper around every payload crossing the bus
//!
//! No reflection: payloads expose their metadata through the `EventMeta`
//! trait and a compile-time `TYPE_NAME` constant, and the builder calls
//! methods instead of poking at fields.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const SCHEMA_VERSION: u16 = 1;

/// Metadata every payload can answer for itself.
pub trait EventMeta {
    fn tenant_id(&self) -> &str;
    fn station_id(&self) -> Option<&str>;
    /// Event time if the payload carries one; the builder falls back to now.
    fn occurred_at(&self) -> Option<DateTime<Utc>>;
}

/// A payload kind the registry can name at compile time.
pub trait EventPayloadKind: EventMeta + Serialize {
    const TYPE_NAME: &'static str;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event_id: Uuid,
    pub event_type: String,
    pub occurred_at: DateTime<Utc>,
    pub correlation_id: Option<String>,
    pub tenant_id: String,
    pub station_id: Option<String>,
    pub schema_version: u16,
    /// JSON-encoded payload bytes.
    pub payload: Vec<u8>,
}

impl EventEnvelope {
    /// Build an envelope around `payload`. A fresh v4 event id is generated;
    /// `occurred_at` comes from the payload when it carries one, else `now`.
    pub fn build<P: EventPayloadKind>(payload: &P, now: DateTime<Utc>) -> Result<Self> {
        let bytes = serde_json::to_vec(payload)?;
        Ok(Self {
            event_id: Uuid::new_v4(),
            event_type: P::TYPE_NAME.to_string(),
            occurred_at: payload.occurred_at().unwrap_or(now),
            correlation_id: None,
            tenant_id: payload.tenant_id().to_string(),
            station_id: payload.station_id().map(|s| s.to_string()),
            schema_version: SCHEMA_VERSION,
            payload: bytes,
        })
    }

    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::payloads::TelemetryWindowClosed;
    use chrono::TimeZone;

    #[test]
    fn test_build_reads_payload_meta() {
        let start = Utc.with_ymd_and_hms(2026, 8, 1, 13, 0, 0).unwrap();
        let payload = TelemetryWindowClosed {
            tenant_id: "t1".into(),
            station_id: "station-S".into(),
            window_start: start,
            window_end: start + chrono::Duration::hours(1),
            recalculate: false,
        };

        let now = Utc.with_ymd_and_hms(2026, 8, 1, 14, 30, 0).unwrap();
        let env = EventEnvelope::build(&payload, now).unwrap();

        assert_eq!(env.event_type, TelemetryWindowClosed::TYPE_NAME);
        assert_eq!(env.tenant_id, "t1");
        assert_eq!(env.station_id.as_deref(), Some("station-S"));
        // Payload carries its own event time; `now` is only a fallback.
        assert_eq!(env.occurred_at, start);
        assert_eq!(env.schema_version, SCHEMA_VERSION);

        let decoded: TelemetryWindowClosed = serde_json::from_slice(&env.payload).unwrap();
        assert_eq!(decoded.station_id, "station-S");
    }

    #[test]
    fn test_event_ids_are_unique() {
        let start = Utc.with_ymd_and_hms(2026, 8, 1, 13, 0, 0).unwrap();
        let payload = TelemetryWindowClosed {
            tenant_id: "t1".into(),
            station_id: "s".into(),
            window_start: start,
            window_end: start + chrono::Duration::hours(1),
            recalculate: false,
        };
        let a = EventEnvelope::build(&payload, start).unwrap();
        let b = EventEnvelope::build(&payload, start).unwrap();
        assert_ne!(a.event_id, b.event_id);
    }
}
