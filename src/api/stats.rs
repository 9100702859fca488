//! Statistics & Settlement Endpoints
//! Mission: Aggregate and settlement reads plus the metrics snapshot

use crate::api::telemetry::parse_rfc3339;
use crate::api::{ApiError, AppState};
use crate::auth::models::Identity;
use crate::metrics::MetricsSnapshot;
use crate::settlement::store::Settlement;
use crate::stats::aggregate::StatisticAggregate;
use crate::stats::timekey::Granularity;
use axum::extract::{Query, State};
use axum::{Extension, Json};
use chrono::Utc;
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub struct StatsQuery {
    pub station_id: String,
    pub from: String,
    pub to: String,
    pub granularity: String,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub aggregates: Vec<StatisticAggregate>,
    pub count: usize,
}

pub async fn get_stats(
    Query(params): Query<StatsQuery>,
    Extension(_identity): Extension<Identity>,
    State(state): State<AppState>,
) -> Result<Json<StatsResponse>, ApiError> {
    let granularity = Granularity::parse(&params.granularity)?;
    let from = parse_rfc3339(&params.from)?;
    let to = parse_rfc3339(&params.to)?;

    let aggregates = state
        .stats
        .list_range(&params.station_id, granularity, from, to)?;
    Ok(Json(StatsResponse {
        count: aggregates.len(),
        aggregates,
    }))
}

#[derive(Debug, Deserialize)]
pub struct SettlementsQuery {
    pub station_id: String,
    pub from: String,
    pub to: String,
}

#[derive(Debug, Serialize)]
pub struct SettlementsResponse {
    pub settlements: Vec<Settlement>,
    pub count: usize,
}

pub async fn get_settlements(
    Query(params): Query<SettlementsQuery>,
    Extension(identity): Extension<Identity>,
    State(state): State<AppState>,
) -> Result<Json<SettlementsResponse>, ApiError> {
    let from = parse_rfc3339(&params.from)?;
    let to = parse_rfc3339(&params.to)?;

    let settlements =
        state
            .settlements
            .list_range(&identity.tenant_id, &params.station_id, from, to)?;
    Ok(Json(SettlementsResponse {
        count: settlements.len(),
        settlements,
    }))
}

#[derive(Debug, Serialize)]
pub struct MetricsResponse {
    pub timestamp: String,
    #[serde(flatten)]
    pub snapshot: MetricsSnapshot,
}

pub async fn get_metrics(
    Extension(_identity): Extension<Identity>,
    State(state): State<AppState>,
) -> Json<MetricsResponse> {
    Json(MetricsResponse {
        timestamp: Utc::now().to_rfc3339(),
        snapshot: state.metrics.snapshot(),
    })
}
