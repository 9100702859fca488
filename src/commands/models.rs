//! Command Models
//! Mission: The device command row and its lifecycle states

use crate::errors::CoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    Created,
    Sent,
    Acked,
    Failed,
    Timeout,
}

impl CommandStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandStatus::Created => "created",
            CommandStatus::Sent => "sent",
            CommandStatus::Acked => "acked",
            CommandStatus::Failed => "failed",
            CommandStatus::Timeout => "timeout",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "created" => Ok(CommandStatus::Created),
            "sent" => Ok(CommandStatus::Sent),
            "acked" => Ok(CommandStatus::Acked),
            "failed" => Ok(CommandStatus::Failed),
            "timeout" => Ok(CommandStatus::Timeout),
            other => Err(CoreError::validation(format!("unknown command status: {}", other))),
        }
    }

    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CommandStatus::Acked | CommandStatus::Failed | CommandStatus::Timeout
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub command_id: Uuid,
    pub tenant_id: String,
    pub station_id: String,
    pub device_id: String,
    pub command_type: String,
    pub payload: serde_json::Value,
    pub idempotency_key: String,
    pub status: CommandStatus,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub acked_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IssueCommandRequest {
    pub tenant_id: Option<String>,
    pub station_id: String,
    pub device_id: String,
    pub command_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub idempotency_key: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in [
            CommandStatus::Created,
            CommandStatus::Sent,
            CommandStatus::Acked,
            CommandStatus::Failed,
            CommandStatus::Timeout,
        ] {
            assert_eq!(CommandStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(CommandStatus::parse("queued").is_err());
    }

    #[test]
    fn test_terminal_states() {
        assert!(!CommandStatus::Created.is_terminal());
        assert!(!CommandStatus::Sent.is_terminal());
        assert!(CommandStatus::Acked.is_terminal());
        assert!(CommandStatus::Timeout.is_terminal());
    }
}
