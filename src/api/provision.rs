//! Provisioning Endpoints
//! Mission: Admin upserts for mappings, rules, tariffs, and strategies

use crate::alarms::models::AlarmRule;
use crate::api::{ApiError, AppState};
use crate::audit::AuditRecord;
use crate::auth::models::{Identity, Role};
use crate::settlement::tariff::TariffPlan;
use crate::strategy::models::{Strategy, StrategyCalendar};
use crate::telemetry::models::PointMapping;
use axum::extract::State;
use axum::{Extension, Json};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize)]
pub struct ProvisionResponse {
    pub status: &'static str,
    pub id: String,
}

fn audit_provision(
    state: &AppState,
    identity: &Identity,
    resource_type: &str,
    resource_id: &str,
    station_id: Option<String>,
) -> Result<(), ApiError> {
    state.audit.write(
        AuditRecord {
            tenant_id: identity.tenant_id.clone(),
            actor: identity.subject.clone(),
            role: identity.role.as_str().to_string(),
            action: format!("provision.{}", resource_type),
            resource_type: resource_type.to_string(),
            resource_id: resource_id.to_string(),
            station_id,
            ..Default::default()
        },
        state.clock.now(),
    )?;
    Ok(())
}

pub async fn upsert_mapping(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Json(mapping): Json<PointMapping>,
) -> Result<Json<ProvisionResponse>, ApiError> {
    identity.require_role(Role::Admin)?;

    state.mappings.upsert(&mapping)?;
    audit_provision(
        &state,
        &identity,
        "mapping",
        &mapping.id,
        Some(mapping.station_id.clone()),
    )?;
    Ok(Json(ProvisionResponse {
        status: "ok",
        id: mapping.id,
    }))
}

pub async fn upsert_rule(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Json(rule): Json<AlarmRule>,
) -> Result<Json<ProvisionResponse>, ApiError> {
    identity.require_role(Role::Admin)?;
    identity.ensure_tenant(&rule.tenant_id)?;

    state.alarm_rules.upsert(&rule)?;
    audit_provision(
        &state,
        &identity,
        "alarm_rule",
        &rule.id,
        Some(rule.station_id.clone()),
    )?;
    Ok(Json(ProvisionResponse {
        status: "ok",
        id: rule.id,
    }))
}

pub async fn upsert_tariff(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Json(plan): Json<TariffPlan>,
) -> Result<Json<ProvisionResponse>, ApiError> {
    identity.require_role(Role::Admin)?;
    identity.ensure_tenant(&plan.tenant_id)?;

    state.tariffs.upsert(&plan)?;
    audit_provision(
        &state,
        &identity,
        "tariff_plan",
        &plan.id,
        Some(plan.station_id.clone()),
    )?;
    Ok(Json(ProvisionResponse {
        status: "ok",
        id: plan.id,
    }))
}

#[derive(Debug, Deserialize)]
pub struct StrategyBody {
    #[serde(flatten)]
    pub strategy: Strategy,
    #[serde(default)]
    pub calendars: Vec<StrategyCalendar>,
}

pub async fn upsert_strategy(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Json(body): Json<StrategyBody>,
) -> Result<Json<ProvisionResponse>, ApiError> {
    identity.require_role(Role::Admin)?;
    identity.ensure_tenant(&body.strategy.tenant_id)?;

    state.strategies.upsert(&body.strategy)?;
    for calendar in &body.calendars {
        state.strategies.set_calendar(calendar)?;
    }
    audit_provision(
        &state,
        &identity,
        "strategy",
        &body.strategy.id,
        Some(body.strategy.station_id.clone()),
    )?;
    Ok(Json(ProvisionResponse {
        status: "ok",
        id: body.strategy.id,
    }))
}
