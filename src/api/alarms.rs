//! Alarm Endpoints
//! Mission: Alarm reads, acknowledgement, and the live SSE stream

use crate::alarms::models::{Alarm, AlarmStatus};
use crate::api::{ApiError, AppState};
use crate::auth::models::{Identity, Role};
use axum::extract::{Path, Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::{Extension, Json};
use futures_util::stream::Stream;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct AlarmsQuery {
    pub station_id: String,
    pub status: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AlarmsResponse {
    pub alarms: Vec<Alarm>,
    pub count: usize,
}

pub async fn list(
    Query(params): Query<AlarmsQuery>,
    Extension(identity): Extension<Identity>,
    State(state): State<AppState>,
) -> Result<Json<AlarmsResponse>, ApiError> {
    let status = params
        .status
        .as_deref()
        .map(AlarmStatus::parse)
        .transpose()?;

    let alarms = state
        .alarm_store
        .list_by_station(&identity.tenant_id, &params.station_id, status)?;
    Ok(Json(AlarmsResponse {
        count: alarms.len(),
        alarms,
    }))
}

#[derive(Debug, Serialize)]
pub struct AckResponse {
    pub alarm: Alarm,
}

pub async fn ack(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<Uuid>,
) -> Result<Json<AckResponse>, ApiError> {
    identity.require_role(Role::Operator)?;

    let alarm = state.evaluator.acknowledge(&identity.tenant_id, id)?;
    Ok(Json(AckResponse { alarm }))
}

/// `text/event-stream` of alarm transitions. Slow consumers lag and drop;
/// the broker never blocks on them.
pub async fn stream(
    Extension(_identity): Extension<Identity>,
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.broker.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|msg| async move {
        match msg {
            Ok(json) => Some(Ok(Event::default().event("alarm").data(json))),
            // Lagged receivers skip the dropped backlog and continue.
            Err(_) => None,
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}
