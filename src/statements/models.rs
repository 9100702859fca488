//! Statement Models
//! Mission: The versioned billing statement header and its immutable items

use crate::errors::CoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatementStatus {
    Draft,
    Frozen,
    Voided,
}

impl StatementStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatementStatus::Draft => "draft",
            StatementStatus::Frozen => "frozen",
            StatementStatus::Voided => "voided",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "draft" => Ok(StatementStatus::Draft),
            "frozen" => Ok(StatementStatus::Frozen),
            "voided" => Ok(StatementStatus::Voided),
            other => Err(CoreError::validation(format!("unknown statement status: {}", other))),
        }
    }

    /// Draft and frozen statements occupy the "current" slot for their key;
    /// voided ones are history.
    pub fn is_current(&self) -> bool {
        matches!(self, StatementStatus::Draft | StatementStatus::Frozen)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Statement {
    pub id: Uuid,
    pub tenant_id: String,
    pub station_id: String,
    /// Month key `YYYYMM`.
    pub month: String,
    pub category: String,
    pub status: StatementStatus,
    pub version: i64,
    pub total_energy_kwh: f64,
    pub total_amount: f64,
    pub currency: String,
    pub snapshot_hash: Option<String>,
    pub frozen_at: Option<DateTime<Utc>>,
    pub void_reason: Option<String>,
    pub voided_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatementItem {
    pub statement_id: Uuid,
    pub day_start: DateTime<Utc>,
    pub energy_kwh: f64,
    pub amount: f64,
    pub currency: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Pdf,
    Xlsx,
}

impl ExportFormat {
    pub fn content_type(&self) -> &'static str {
        match self {
            ExportFormat::Pdf => "application/pdf",
            ExportFormat::Xlsx => {
                "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in [
            StatementStatus::Draft,
            StatementStatus::Frozen,
            StatementStatus::Voided,
        ] {
            assert_eq!(StatementStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(StatementStatus::parse("open").is_err());
    }

    #[test]
    fn test_current_slot() {
        assert!(StatementStatus::Draft.is_current());
        assert!(StatementStatus::Frozen.is_current());
        assert!(!StatementStatus::Voided.is_current());
    }
}
