//! Strategy Models
//! Mission: Statically typed automation templates decoded from persisted JSON

use crate::errors::CoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Supported automation templates. The tag is the persisted discriminator;
/// unknown kinds fail decoding instead of limping along as loose maps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "template", rename_all = "snake_case")]
pub enum StrategyTemplate {
    AntiBackflow {
        /// Export power above this triggers a curtailment command.
        threshold_kw: f64,
        min_kw: f64,
        max_kw: f64,
        /// Device receiving the curtailment command.
        device_id: Option<String>,
    },
}

impl StrategyTemplate {
    pub fn kind(&self) -> &'static str {
        match self {
            StrategyTemplate::AntiBackflow { .. } => "anti_backflow",
        }
    }

    pub fn decode(json: &str) -> Result<Self, CoreError> {
        serde_json::from_str(json)
            .map_err(|e| CoreError::validation(format!("bad strategy template: {}", e)))
    }

    pub fn encode(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Strategy {
    pub id: String,
    pub tenant_id: String,
    pub station_id: String,
    pub name: String,
    pub template: StrategyTemplate,
    pub auto_enabled: bool,
}

/// Gates evaluation by weekday and minute-of-day window `[start, end)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyCalendar {
    pub strategy_id: String,
    /// 0 = Monday … 6 = Sunday.
    pub weekday: u8,
    pub start_minute: u32,
    pub end_minute: u32,
    pub enabled: bool,
}

impl StrategyCalendar {
    pub fn covers(&self, minute_of_day: u32) -> bool {
        self.enabled && minute_of_day >= self.start_minute && minute_of_day < self.end_minute
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Issued,
    NoAction,
    Error,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Issued => "issued",
            RunOutcome::NoAction => "no_action",
            RunOutcome::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "issued" => Ok(RunOutcome::Issued),
            "no_action" => Ok(RunOutcome::NoAction),
            "error" => Ok(RunOutcome::Error),
            other => Err(CoreError::validation(format!("unknown run outcome: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyRun {
    pub strategy_id: String,
    pub ts: DateTime<Utc>,
    pub outcome: RunOutcome,
    pub detail: Option<String>,
    pub command_id: Option<Uuid>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_template_round_trip() {
        let template = StrategyTemplate::AntiBackflow {
            threshold_kw: 5.0,
            min_kw: 1.0,
            max_kw: 100.0,
            device_id: Some("pcs-1".into()),
        };
        let json = template.encode();
        assert!(json.contains(r#""template":"anti_backflow""#));
        assert_eq!(StrategyTemplate::decode(&json).unwrap(), template);
    }

    #[test]
    fn test_unknown_template_kind_fails() {
        let err = StrategyTemplate::decode(r#"{"template":"peak_shaving","limit":1}"#).unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }

    #[test]
    fn test_calendar_window_is_half_open() {
        let cal = StrategyCalendar {
            strategy_id: "s1".into(),
            weekday: 0,
            start_minute: 8 * 60,
            end_minute: 18 * 60,
            enabled: true,
        };
        assert!(!cal.covers(8 * 60 - 1));
        assert!(cal.covers(8 * 60));
        assert!(cal.covers(18 * 60 - 1));
        assert!(!cal.covers(18 * 60));

        let disabled = StrategyCalendar {
            enabled: false,
            ..cal
        };
        assert!(!disabled.covers(12 * 60));
    }
}
