//! Core Event Payloads
//! Mission: The wire contracts every subsystem speaks over the bus

use crate::alarms::models::Alarm;
use crate::events::envelope::{EventMeta, EventPayloadKind};
use crate::stats::timekey::Granularity;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One raw measurement as it crossed the webhook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryPoint {
    pub device_id: String,
    pub point_key: String,
    pub ts: DateTime<Utc>,
    pub value: Option<f64>,
    pub text: Option<String>,
    pub quality: String,
}

/// A measurement batch was persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryReceived {
    pub tenant_id: String,
    pub station_id: String,
    pub points: Vec<TelemetryPoint>,
    /// Max point timestamp in the batch.
    pub occurred_at: DateTime<Utc>,
}

impl EventMeta for TelemetryReceived {
    fn tenant_id(&self) -> &str {
        &self.tenant_id
    }
    fn station_id(&self) -> Option<&str> {
        Some(&self.station_id)
    }
    fn occurred_at(&self) -> Option<DateTime<Utc>> {
        Some(self.occurred_at)
    }
}

impl EventPayloadKind for TelemetryReceived {
    const TYPE_NAME: &'static str = "TelemetryReceived";
}

/// An hour window is ready for aggregation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryWindowClosed {
    pub tenant_id: String,
    pub station_id: String,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    #[serde(default)]
    pub recalculate: bool,
}

impl EventMeta for TelemetryWindowClosed {
    fn tenant_id(&self) -> &str {
        &self.tenant_id
    }
    fn station_id(&self) -> Option<&str> {
        Some(&self.station_id)
    }
    fn occurred_at(&self) -> Option<DateTime<Utc>> {
        Some(self.window_start)
    }
}

impl EventPayloadKind for TelemetryWindowClosed {
    const TYPE_NAME: &'static str = "TelemetryWindowClosed";
}

/// A statistic aggregate reached completion at some granularity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatisticCalculated {
    pub tenant_id: String,
    pub station_id: String,
    pub granularity: Granularity,
    pub period_start: DateTime<Utc>,
    #[serde(default)]
    pub recalculate: bool,
}

impl EventMeta for StatisticCalculated {
    fn tenant_id(&self) -> &str {
        &self.tenant_id
    }
    fn station_id(&self) -> Option<&str> {
        Some(&self.station_id)
    }
    fn occurred_at(&self) -> Option<DateTime<Utc>> {
        Some(self.period_start)
    }
}

impl EventPayloadKind for StatisticCalculated {
    const TYPE_NAME: &'static str = "StatisticCalculated";
}

/// A day settlement was priced and persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementCalculated {
    pub tenant_id: String,
    pub station_id: String,
    pub day_start: DateTime<Utc>,
    pub energy_kwh: f64,
    pub amount: f64,
    pub currency: String,
    pub version: i64,
}

impl EventMeta for SettlementCalculated {
    fn tenant_id(&self) -> &str {
        &self.tenant_id
    }
    fn station_id(&self) -> Option<&str> {
        Some(&self.station_id)
    }
    fn occurred_at(&self) -> Option<DateTime<Utc>> {
        Some(self.day_start)
    }
}

impl EventPayloadKind for SettlementCalculated {
    const TYPE_NAME: &'static str = "SettlementCalculated";
}

/// A device command was accepted for dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandIssued {
    pub tenant_id: String,
    pub station_id: String,
    pub device_id: String,
    pub command_id: Uuid,
    pub command_type: String,
    pub payload: serde_json::Value,
    pub issued_at: DateTime<Utc>,
}

impl EventMeta for CommandIssued {
    fn tenant_id(&self) -> &str {
        &self.tenant_id
    }
    fn station_id(&self) -> Option<&str> {
        Some(&self.station_id)
    }
    fn occurred_at(&self) -> Option<DateTime<Utc>> {
        Some(self.issued_at)
    }
}

impl EventPayloadKind for CommandIssued {
    const TYPE_NAME: &'static str = "CommandIssued";
}

/// The device gateway confirmed a command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandAcked {
    pub tenant_id: String,
    pub station_id: String,
    pub command_id: Uuid,
    pub acked_at: DateTime<Utc>,
}

impl EventMeta for CommandAcked {
    fn tenant_id(&self) -> &str {
        &self.tenant_id
    }
    fn station_id(&self) -> Option<&str> {
        Some(&self.station_id)
    }
    fn occurred_at(&self) -> Option<DateTime<Utc>> {
        Some(self.acked_at)
    }
}

impl EventPayloadKind for CommandAcked {
    const TYPE_NAME: &'static str = "CommandAcked";
}

/// The device gateway rejected a command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandFailed {
    pub tenant_id: String,
    pub station_id: String,
    pub command_id: Uuid,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

impl EventMeta for CommandFailed {
    fn tenant_id(&self) -> &str {
        &self.tenant_id
    }
    fn station_id(&self) -> Option<&str> {
        Some(&self.station_id)
    }
    fn occurred_at(&self) -> Option<DateTime<Utc>> {
        Some(self.failed_at)
    }
}

impl EventPayloadKind for CommandFailed {
    const TYPE_NAME: &'static str = "CommandFailed";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlarmTransition {
    Active,
    Acknowledged,
    Cleared,
}

/// An alarm crossed a lifecycle boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlarmStateChanged {
    pub tenant_id: String,
    pub station_id: String,
    pub transition: AlarmTransition,
    pub alarm: Alarm,
    pub occurred_at: DateTime<Utc>,
}

impl EventMeta for AlarmStateChanged {
    fn tenant_id(&self) -> &str {
        &self.tenant_id
    }
    fn station_id(&self) -> Option<&str> {
        Some(&self.station_id)
    }
    fn occurred_at(&self) -> Option<DateTime<Utc>> {
        Some(self.occurred_at)
    }
}

impl EventPayloadKind for AlarmStateChanged {
    const TYPE_NAME: &'static str = "AlarmEvent";
}
