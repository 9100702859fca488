//! API Interface
//! Mission: Expose the control-plane surface over HTTP

pub mod alarms;
pub mod commands;
pub mod provision;
pub mod routes;
pub mod statements;
pub mod stats;
pub mod telemetry;

use crate::alarms::evaluator::AlarmEvaluator;
use crate::alarms::notifier::SseBroker;
use crate::alarms::store::{AlarmRuleStore, AlarmStore};
use crate::audit::AuditLog;
use crate::clock::Clock;
use crate::commands::service::CommandService;
use crate::commands::store::CommandStore;
use crate::errors::{as_core, CoreError};
use crate::metrics::MetricsRegistry;
use crate::settlement::store::{SettlementStore, TariffStore};
use crate::statements::service::StatementService;
use crate::stats::store::StatisticStore;
use crate::strategy::store::StrategyStore;
use crate::telemetry::ingest::IngestService;
use crate::telemetry::store::{MeasurementStore, PointMappingStore};
use crate::telemetry::window::WindowCloser;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use std::sync::Arc;
use tracing::error;

pub use routes::build_router;

/// Everything the handlers need, cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub ingest: Arc<IngestService>,
    pub window_closer: Arc<WindowCloser>,
    pub stats: StatisticStore,
    pub settlements: SettlementStore,
    pub tariffs: TariffStore,
    pub command_service: Arc<CommandService>,
    pub command_store: CommandStore,
    pub alarm_store: AlarmStore,
    pub alarm_rules: AlarmRuleStore,
    pub evaluator: Arc<AlarmEvaluator>,
    pub statements: Arc<StatementService>,
    pub strategies: StrategyStore,
    pub mappings: PointMappingStore,
    pub measurements: MeasurementStore,
    pub broker: Arc<SseBroker>,
    pub metrics: Arc<MetricsRegistry>,
    pub audit: AuditLog,
    pub clock: Arc<dyn Clock>,
    pub ingest_hmac_secret: Option<String>,
    pub ingest_skew_secs: i64,
}

/// Error envelope translating the core taxonomy into status codes.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::FORBIDDEN,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            axum::Json(serde_json::json!({ "error": self.message })),
        )
            .into_response()
    }
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        let status = match &err {
            CoreError::Validation(_) => StatusCode::BAD_REQUEST,
            CoreError::TenantMismatch { .. } | CoreError::Forbidden(_) => StatusCode::FORBIDDEN,
            CoreError::NotFound(_) => StatusCode::NOT_FOUND,
            CoreError::Conflict(_) | CoreError::AlreadyCompleted(_) => StatusCode::CONFLICT,
            CoreError::Transient(_) | CoreError::Poison(_) | CoreError::UnknownEventType(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        // Tenant details never leak to the client.
        let message = match &err {
            CoreError::TenantMismatch { .. } => "tenant mismatch".to_string(),
            other => other.to_string(),
        };
        Self { status, message }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        if let Some(core) = as_core(&err) {
            return core.clone().into();
        }
        // No stack traces cross the API boundary.
        error!(error = %err, "internal error");
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: "internal error".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_taxonomy_maps_to_status_codes() {
        let cases = [
            (CoreError::validation("x"), StatusCode::BAD_REQUEST),
            (
                CoreError::TenantMismatch {
                    expected: "a".into(),
                    got: "b".into(),
                },
                StatusCode::FORBIDDEN,
            ),
            (CoreError::Forbidden("x".into()), StatusCode::FORBIDDEN),
            (CoreError::not_found("x"), StatusCode::NOT_FOUND),
            (CoreError::Conflict("x".into()), StatusCode::CONFLICT),
            (CoreError::transient("x"), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status, status);
        }
    }

    #[test]
    fn test_tenant_mismatch_does_not_leak_ids() {
        let err = ApiError::from(CoreError::TenantMismatch {
            expected: "secret-tenant".into(),
            got: "caller".into(),
        });
        assert!(!err.message.contains("secret-tenant"));
    }
}
