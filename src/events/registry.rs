//! Event Type Registry
//! Mission: Decode envelopes into typed payloads by registered name
//!
//! Unregistered types fail with `UnknownEventType` and land in the DLQ.

use crate::errors::CoreError;
use crate::events::envelope::{EventEnvelope, EventPayloadKind};
use crate::events::payloads::{
    AlarmStateChanged, CommandAcked, CommandFailed, CommandIssued, SettlementCalculated,
    StatisticCalculated, TelemetryReceived, TelemetryWindowClosed,
};
use serde::de::DeserializeOwned;
use std::collections::HashMap;

/// Tagged union over every payload the core understands.
#[derive(Debug, Clone)]
pub enum EventPayload {
    TelemetryReceived(TelemetryReceived),
    TelemetryWindowClosed(TelemetryWindowClosed),
    StatisticCalculated(StatisticCalculated),
    SettlementCalculated(SettlementCalculated),
    CommandIssued(CommandIssued),
    CommandAcked(CommandAcked),
    CommandFailed(CommandFailed),
    AlarmStateChanged(AlarmStateChanged),
}

macro_rules! into_payload {
    ($ty:ident) => {
        impl From<$ty> for EventPayload {
            fn from(p: $ty) -> Self {
                EventPayload::$ty(p)
            }
        }
    };
}

into_payload!(TelemetryReceived);
into_payload!(TelemetryWindowClosed);
into_payload!(StatisticCalculated);
into_payload!(SettlementCalculated);
into_payload!(CommandIssued);
into_payload!(CommandAcked);
into_payload!(CommandFailed);
into_payload!(AlarmStateChanged);

type Decoder = fn(&[u8]) -> Result<EventPayload, CoreError>;

fn decode_as<P>(bytes: &[u8]) -> Result<EventPayload, CoreError>
where
    P: EventPayloadKind + DeserializeOwned + Into<EventPayload>,
{
    serde_json::from_slice::<P>(bytes)
        .map(Into::into)
        .map_err(|e| CoreError::Poison(format!("decode {}: {}", P::TYPE_NAME, e)))
}

pub struct EventRegistry {
    decoders: HashMap<&'static str, Decoder>,
}

impl EventRegistry {
    pub fn empty() -> Self {
        Self {
            decoders: HashMap::new(),
        }
    }

    /// Registry preloaded with every core payload kind.
    pub fn with_core_types() -> Self {
        let mut r = Self::empty();
        r.register::<TelemetryReceived>();
        r.register::<TelemetryWindowClosed>();
        r.register::<StatisticCalculated>();
        r.register::<SettlementCalculated>();
        r.register::<CommandIssued>();
        r.register::<CommandAcked>();
        r.register::<CommandFailed>();
        r.register::<AlarmStateChanged>();
        r
    }

    pub fn register<P>(&mut self)
    where
        P: EventPayloadKind + DeserializeOwned + Into<EventPayload>,
    {
        self.decoders.insert(P::TYPE_NAME, decode_as::<P>);
    }

    pub fn is_registered(&self, type_name: &str) -> bool {
        self.decoders.contains_key(type_name)
    }

    pub fn decode(&self, env: &EventEnvelope) -> Result<EventPayload, CoreError> {
        let decoder = self
            .decoders
            .get(env.event_type.as_str())
            .ok_or_else(|| CoreError::UnknownEventType(env.event_type.clone()))?;
        decoder(&env.payload)
    }
}

impl Default for EventRegistry {
    fn default() -> Self {
        Self::with_core_types()
    }
}
