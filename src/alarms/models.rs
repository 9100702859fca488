//! Alarm Models
//! Mission: Threshold rules, the pending debounce state, and the alarm row

use crate::errors::CoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CmpOp {
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
}

impl CmpOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            ">" => Ok(CmpOp::Gt),
            ">=" => Ok(CmpOp::Ge),
            "<" => Ok(CmpOp::Lt),
            "<=" => Ok(CmpOp::Le),
            other => Err(CoreError::validation(format!("unknown operator: {}", other))),
        }
    }

    pub fn breached(&self, value: f64, threshold: f64) -> bool {
        match self {
            CmpOp::Gt => value > threshold,
            CmpOp::Ge => value >= threshold,
            CmpOp::Lt => value < threshold,
            CmpOp::Le => value <= threshold,
        }
    }

    /// Recovery requires crossing back past the hysteresis deadband in the
    /// opposite direction. For `> T` with hysteresis H: `value <= T - H`.
    pub fn recovered(&self, value: f64, threshold: f64, hysteresis: f64) -> bool {
        match self {
            CmpOp::Gt | CmpOp::Ge => value <= threshold - hysteresis,
            CmpOp::Lt | CmpOp::Le => value >= threshold + hysteresis,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s.to_lowercase().as_str() {
            "info" => Ok(Severity::Info),
            "warning" => Ok(Severity::Warning),
            "critical" => Ok(Severity::Critical),
            other => Err(CoreError::validation(format!("unknown severity: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlarmRule {
    pub id: String,
    pub tenant_id: String,
    pub station_id: String,
    pub name: String,
    pub semantic: String,
    pub operator: CmpOp,
    pub threshold: f64,
    pub hysteresis: f64,
    pub duration_seconds: i64,
    pub severity: Severity,
    pub enabled: bool,
}

impl AlarmRule {
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.id.is_empty() || self.station_id.is_empty() || self.semantic.is_empty() {
            return Err(CoreError::validation("rule id, station and semantic are required"));
        }
        if self.hysteresis < 0.0 {
            return Err(CoreError::validation("hysteresis must be >= 0"));
        }
        if self.duration_seconds < 0 {
            return Err(CoreError::validation("duration_seconds must be >= 0"));
        }
        Ok(())
    }
}

/// The alarm subject: a whole station or one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OriginatorType {
    Station,
    Device,
}

impl OriginatorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OriginatorType::Station => "station",
            OriginatorType::Device => "device",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "station" => Ok(OriginatorType::Station),
            "device" => Ok(OriginatorType::Device),
            other => Err(CoreError::validation(format!("unknown originator type: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlarmStatus {
    Active,
    Acknowledged,
    Cleared,
}

impl AlarmStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlarmStatus::Active => "active",
            AlarmStatus::Acknowledged => "acknowledged",
            AlarmStatus::Cleared => "cleared",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "active" => Ok(AlarmStatus::Active),
            "acknowledged" => Ok(AlarmStatus::Acknowledged),
            "cleared" => Ok(AlarmStatus::Cleared),
            other => Err(CoreError::validation(format!("unknown alarm status: {}", other))),
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, AlarmStatus::Active | AlarmStatus::Acknowledged)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alarm {
    pub id: Uuid,
    pub tenant_id: String,
    pub station_id: String,
    pub originator_type: OriginatorType,
    pub originator_id: String,
    pub rule_id: String,
    pub status: AlarmStatus,
    pub start_at: DateTime<Utc>,
    pub end_at: Option<DateTime<Utc>>,
    pub last_value: f64,
    pub acked_at: Option<DateTime<Utc>>,
    pub cleared_at: Option<DateTime<Utc>>,
}

/// Debounce state between the first breach and either the duration-satisfied
/// transition or recovery.
#[derive(Debug, Clone)]
pub struct PendingBreach {
    pub tenant_id: String,
    pub rule_id: String,
    pub originator_type: OriginatorType,
    pub originator_id: String,
    pub pending_since: DateTime<Utc>,
    pub last_value: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_breach_per_operator() {
        assert!(CmpOp::Gt.breached(100.1, 100.0));
        assert!(!CmpOp::Gt.breached(100.0, 100.0));
        assert!(CmpOp::Ge.breached(100.0, 100.0));
        assert!(CmpOp::Lt.breached(9.9, 10.0));
        assert!(CmpOp::Le.breached(10.0, 10.0));
    }

    #[test]
    fn test_recovery_respects_hysteresis() {
        // Rule: value > 100, hysteresis 5. 97 sits in the deadband.
        assert!(!CmpOp::Gt.recovered(97.0, 100.0, 5.0));
        assert!(CmpOp::Gt.recovered(95.0, 100.0, 5.0));
        assert!(CmpOp::Gt.recovered(94.0, 100.0, 5.0));

        // Mirror for under-threshold rules.
        assert!(!CmpOp::Lt.recovered(12.0, 10.0, 5.0));
        assert!(CmpOp::Lt.recovered(15.0, 10.0, 5.0));
    }

    #[test]
    fn test_operator_round_trip() {
        for op in [CmpOp::Gt, CmpOp::Ge, CmpOp::Lt, CmpOp::Le] {
            assert_eq!(CmpOp::parse(op.as_str()).unwrap(), op);
        }
        assert!(CmpOp::parse("!=").is_err());
    }

    #[test]
    fn test_rule_validation() {
        let mut rule = AlarmRule {
            id: "r1".into(),
            tenant_id: "t1".into(),
            station_id: "station-S".into(),
            name: "overcharge".into(),
            semantic: "charge_power_kw".into(),
            operator: CmpOp::Gt,
            threshold: 100.0,
            hysteresis: 5.0,
            duration_seconds: 0,
            severity: Severity::Warning,
            enabled: true,
        };
        assert!(rule.validate().is_ok());
        rule.hysteresis = -1.0;
        assert!(rule.validate().is_err());
    }
}
