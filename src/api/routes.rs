//! API Routes
//! Mission: Assemble the HTTP surface with auth, CORS, and tracing layers

use crate::api::{alarms, commands, provision, statements, stats, telemetry, AppState};
use crate::auth::{auth_middleware, JwtHandler};
use axum::{
    middleware as axum_mw,
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Build the full router.
///
/// - `/health` and `/ingest/telemetry` are open (ingest authenticates with
///   its HMAC signature instead of a bearer token).
/// - `/analytics/*` and `/api/v1/*` require a valid token; role gates live
///   in the handlers.
pub fn build_router(state: AppState, jwt: Arc<JwtHandler>) -> Router {
    let api = Router::new()
        .route("/stats", get(stats::get_stats))
        .route("/settlements", get(stats::get_settlements))
        .route("/metrics", get(stats::get_metrics))
        .route("/commands", post(commands::issue).get(commands::list))
        .route("/alarms", get(alarms::list))
        .route("/alarms/stream", get(alarms::stream))
        .route("/alarms/:id/ack", post(alarms::ack))
        .route("/statements/generate", post(statements::generate))
        .route("/statements/:id/freeze", post(statements::freeze))
        .route("/statements/:id/void", post(statements::void_statement))
        .route("/statements/:id/export.pdf", get(statements::export_pdf))
        .route("/statements/:id/export.xlsx", get(statements::export_xlsx))
        .route("/provision/mappings", post(provision::upsert_mapping))
        .route("/provision/rules", post(provision::upsert_rule))
        .route("/provision/tariffs", post(provision::upsert_tariff))
        .route("/provision/strategies", post(provision::upsert_strategy))
        .layer(axum_mw::from_fn_with_state(jwt.clone(), auth_middleware));

    let analytics = Router::new()
        .route("/window-close", post(telemetry::window_close))
        .layer(axum_mw::from_fn_with_state(jwt, auth_middleware));

    Router::new()
        .route("/health", get(health))
        .route("/ingest/telemetry", post(telemetry::ingest))
        .nest("/analytics", analytics)
        .nest("/api/v1", api)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
