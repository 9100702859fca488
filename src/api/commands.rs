//! Command Endpoints
//! Mission: Operator-issued device commands and their history

use crate::api::telemetry::parse_rfc3339;
use crate::api::{ApiError, AppState};
use crate::auth::models::{Identity, Role};
use crate::commands::models::{Command, CommandStatus, IssueCommandRequest};
use axum::extract::{Query, State};
use axum::{Extension, Json};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Serialize)]
pub struct IssueResponse {
    pub command_id: Uuid,
    pub status: CommandStatus,
    pub idempotency_key: String,
    pub deduplicated: bool,
}

pub async fn issue(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Json(request): Json<IssueCommandRequest>,
) -> Result<Json<IssueResponse>, ApiError> {
    identity.require_role(Role::Operator)?;

    let (command, deduplicated) = state.command_service.issue(&identity.tenant_id, &request)?;
    Ok(Json(IssueResponse {
        command_id: command.command_id,
        status: command.status,
        idempotency_key: command.idempotency_key,
        deduplicated,
    }))
}

#[derive(Debug, Deserialize)]
pub struct CommandsQuery {
    pub station_id: String,
    pub from: Option<String>,
    pub to: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CommandsResponse {
    pub commands: Vec<Command>,
    pub count: usize,
}

pub async fn list(
    Query(params): Query<CommandsQuery>,
    Extension(identity): Extension<Identity>,
    State(state): State<AppState>,
) -> Result<Json<CommandsResponse>, ApiError> {
    let now = state.clock.now();
    let from = match &params.from {
        Some(s) => parse_rfc3339(s)?,
        None => now - chrono::Duration::hours(24),
    };
    let to = match &params.to {
        Some(s) => parse_rfc3339(s)?,
        None => now + chrono::Duration::seconds(1),
    };

    let commands =
        state
            .command_store
            .list_by_station(&identity.tenant_id, &params.station_id, from, to)?;
    Ok(Json(CommandsResponse {
        count: commands.len(),
        commands,
    }))
}
