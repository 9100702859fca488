//! Telemetry Endpoints
//! Mission: The station webhook and the analytics window-close call

use crate::api::{ApiError, AppState};
use crate::audit::AuditRecord;
use crate::auth::models::{Identity, Role};
use crate::errors::CoreError;
use crate::telemetry::models::{IngestBatch, IngestPoint};
use crate::telemetry::signature;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::{Extension, Json};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Epoch values above this are milliseconds.
const MILLIS_THRESHOLD: i64 = 1_000_000_000_000;

#[derive(Debug, Deserialize)]
struct RawPoint {
    ts: i64,
    values: HashMap<String, f64>,
    quality: Option<String>,
}

/// Webhook body: either a single `{ts, values}` or `{points: [...]}`.
#[derive(Debug, Deserialize)]
struct IngestBody {
    #[serde(alias = "tenantId")]
    tenant_id: String,
    #[serde(alias = "stationId")]
    station_id: String,
    #[serde(alias = "deviceId")]
    device_id: String,
    ts: Option<i64>,
    values: Option<HashMap<String, f64>>,
    quality: Option<String>,
    points: Option<Vec<RawPoint>>,
}

#[derive(Debug, Serialize)]
pub struct IngestResponse {
    pub inserted: usize,
}

fn parse_epoch(raw: i64) -> DateTime<Utc> {
    if raw > MILLIS_THRESHOLD {
        Utc.timestamp_millis_opt(raw).single().unwrap_or_default()
    } else {
        Utc.timestamp_opt(raw, 0).single().unwrap_or_default()
    }
}

pub async fn ingest(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<IngestResponse>, ApiError> {
    // Signature check runs over the raw body before any parsing.
    if let Some(secret) = &state.ingest_hmac_secret {
        let ts = headers
            .get(signature::TIMESTAMP_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ApiError::forbidden("missing X-Ingest-Timestamp"))?;
        let sig = headers
            .get(signature::SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ApiError::forbidden("missing X-Ingest-Signature"))?;
        signature::verify(
            secret,
            ts,
            sig,
            &body,
            state.clock.now(),
            state.ingest_skew_secs,
        )?;
    }

    let parsed: IngestBody = serde_json::from_slice(&body)
        .map_err(|e| ApiError::bad_request(format!("bad ingest body: {}", e)))?;
    if parsed.tenant_id.is_empty() {
        return Err(ApiError::bad_request("tenant_id is required"));
    }

    let mut points = Vec::new();
    if let (Some(ts), Some(values)) = (parsed.ts, parsed.values) {
        points.push(IngestPoint {
            ts: parse_epoch(ts),
            values,
            quality: parsed.quality.clone(),
        });
    }
    for point in parsed.points.unwrap_or_default() {
        points.push(IngestPoint {
            ts: parse_epoch(point.ts),
            values: point.values,
            quality: point.quality,
        });
    }

    let inserted = state.ingest.ingest(IngestBatch {
        tenant_id: parsed.tenant_id,
        station_id: parsed.station_id,
        device_id: parsed.device_id,
        points,
    })?;
    Ok(Json(IngestResponse { inserted }))
}

#[derive(Debug, Deserialize)]
pub struct WindowCloseBody {
    #[serde(alias = "stationId")]
    pub station_id: String,
    #[serde(alias = "windowStart")]
    pub window_start: String,
    #[serde(alias = "windowEnd")]
    pub window_end: Option<String>,
    #[serde(default)]
    pub recalculate: bool,
}

#[derive(Debug, Serialize)]
pub struct WindowCloseResponse {
    pub status: &'static str,
    #[serde(rename = "windowStart")]
    pub window_start: DateTime<Utc>,
    #[serde(rename = "windowEnd")]
    pub window_end: DateTime<Utc>,
}

pub async fn window_close(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Json(body): Json<WindowCloseBody>,
) -> Result<Json<WindowCloseResponse>, ApiError> {
    identity.require_role(Role::Admin)?;

    let window_start = parse_rfc3339(&body.window_start)?;
    let window_end = body.window_end.as_deref().map(parse_rfc3339).transpose()?;

    let (start, end) = state.window_closer.close(
        &identity.tenant_id,
        &body.station_id,
        window_start,
        window_end,
        body.recalculate,
    )?;

    state.audit.write(
        AuditRecord {
            tenant_id: identity.tenant_id.clone(),
            actor: identity.subject.clone(),
            role: identity.role.as_str().to_string(),
            action: "window.close".to_string(),
            resource_type: "station".to_string(),
            resource_id: body.station_id.clone(),
            station_id: Some(body.station_id),
            metadata_json: Some(
                serde_json::json!({"windowStart": start, "recalculate": body.recalculate})
                    .to_string(),
            ),
            ..Default::default()
        },
        state.clock.now(),
    )?;

    Ok(Json(WindowCloseResponse {
        status: "closed",
        window_start: start,
        window_end: end,
    }))
}

pub fn parse_rfc3339(s: &str) -> Result<DateTime<Utc>, ApiError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| ApiError::from(CoreError::validation(format!("bad timestamp: {}", s))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_epoch_unit_disambiguation() {
        let secs = parse_epoch(1_785_500_000);
        let millis = parse_epoch(1_785_500_000_000);
        assert_eq!(secs, millis);
        assert_eq!(secs.timestamp(), 1_785_500_000);
    }

    #[test]
    fn test_body_accepts_both_shapes() {
        let single: IngestBody = serde_json::from_str(
            r#"{"tenantId":"t1","stationId":"s","deviceId":"d","ts":1785500000,"values":{"p":1.0}}"#,
        )
        .unwrap();
        assert!(single.values.is_some());
        assert!(single.points.is_none());

        let batch: IngestBody = serde_json::from_str(
            r#"{"tenant_id":"t1","station_id":"s","device_id":"d",
                "points":[{"ts":1785500000,"values":{"p":1.0}},{"ts":1785503600,"values":{"p":2.0}}]}"#,
        )
        .unwrap();
        assert_eq!(batch.points.unwrap().len(), 2);
    }

    #[test]
    fn test_rfc3339_parsing() {
        assert!(parse_rfc3339("2026-08-01T13:00:00Z").is_ok());
        assert!(parse_rfc3339("2026-08-01 13:00").is_err());
    }
}
