//! Statement Endpoints
//! Mission: Generate, freeze, void, export

use crate::api::{ApiError, AppState};
use crate::auth::models::{Identity, Role};
use crate::errors::CoreError;
use crate::statements::models::{ExportFormat, StatementStatus};
use crate::statements::service::Actor;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

fn actor(identity: &Identity) -> Actor {
    Actor {
        tenant_id: identity.tenant_id.clone(),
        subject: identity.subject.clone(),
        role: identity.role.as_str().to_string(),
    }
}

/// `YYYY-MM` body field to the internal `YYYYMM` month key.
fn month_key(month: &str) -> Result<String, ApiError> {
    let normalized = month.replace('-', "");
    if normalized.len() != 6 || normalized.chars().any(|c| !c.is_ascii_digit()) {
        return Err(ApiError::from(CoreError::validation(format!(
            "bad month: {}",
            month
        ))));
    }
    Ok(normalized)
}

#[derive(Debug, Deserialize)]
pub struct GenerateBody {
    pub station_id: String,
    /// `YYYY-MM`.
    pub month: String,
    pub category: String,
    #[serde(default)]
    pub regenerate: bool,
}

#[derive(Debug, Serialize)]
pub struct GenerateResponse {
    pub statement_id: Uuid,
    pub status: StatementStatus,
    pub version: i64,
}

pub async fn generate(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Json(body): Json<GenerateBody>,
) -> Result<Json<GenerateResponse>, ApiError> {
    identity.require_role(Role::Operator)?;

    let statement = state.statements.generate(
        &actor(&identity),
        &body.station_id,
        &month_key(&body.month)?,
        &body.category,
        body.regenerate,
    )?;
    Ok(Json(GenerateResponse {
        statement_id: statement.id,
        status: statement.status,
        version: statement.version,
    }))
}

#[derive(Debug, Serialize)]
pub struct LifecycleResponse {
    pub statement_id: Uuid,
    pub status: StatementStatus,
    pub version: i64,
    pub snapshot_hash: Option<String>,
}

pub async fn freeze(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<Uuid>,
) -> Result<Json<LifecycleResponse>, ApiError> {
    identity.require_role(Role::Admin)?;

    let statement = state.statements.freeze(&actor(&identity), id)?;
    Ok(Json(LifecycleResponse {
        statement_id: statement.id,
        status: statement.status,
        version: statement.version,
        snapshot_hash: statement.snapshot_hash,
    }))
}

#[derive(Debug, Deserialize)]
pub struct VoidBody {
    pub reason: String,
}

pub async fn void_statement(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<Uuid>,
    Json(body): Json<VoidBody>,
) -> Result<Json<LifecycleResponse>, ApiError> {
    identity.require_role(Role::Admin)?;

    let statement = state.statements.void(&actor(&identity), id, &body.reason)?;
    Ok(Json(LifecycleResponse {
        statement_id: statement.id,
        status: statement.status,
        version: statement.version,
        snapshot_hash: statement.snapshot_hash,
    }))
}

async fn export(
    state: AppState,
    identity: Identity,
    id: Uuid,
    format: ExportFormat,
) -> Result<Response, ApiError> {
    identity.require_role(Role::Admin)?;

    let bytes = state.statements.export(&actor(&identity), id, format)?;
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, format.content_type())],
        bytes,
    )
        .into_response())
}

pub async fn export_pdf(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    export(state, identity, id, ExportFormat::Pdf).await
}

pub async fn export_xlsx(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    export(state, identity, id, ExportFormat::Xlsx).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_month_key_normalization() {
        assert_eq!(month_key("2026-08").unwrap(), "202608");
        assert_eq!(month_key("202608").unwrap(), "202608");
        assert!(month_key("2026/08").is_err());
        assert!(month_key("2026-8").is_err());
    }
}
