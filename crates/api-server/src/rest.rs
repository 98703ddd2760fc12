//! Shared REST state, operational endpoints and error mapping.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use eventdesk_journey::{JourneyEngine, JourneyError};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::error;

/// Shared application state for REST handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<JourneyEngine>,
    pub node_id: String,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(engine: Arc<JourneyEngine>, node_id: impl Into<String>) -> Self {
        Self {
            engine,
            node_id: node_id.into(),
            start_time: Instant::now(),
        }
    }
}

/// GET /health. Health check endpoint.
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        node_id: state.node_id.clone(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        automations: state.engine.list_automations().len(),
    })
}

/// GET /ready. Readiness probe. The engine is constructed before the
/// router, so a running server is ready.
pub async fn readiness(State(_state): State<AppState>) -> StatusCode {
    StatusCode::OK
}

/// GET /live. Liveness probe for Kubernetes.
pub async fn liveness() -> StatusCode {
    StatusCode::OK
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub node_id: String,
    pub uptime_secs: u64,
    pub automations: usize,
}

/// Engine error mapped onto an HTTP status and a JSON body.
#[derive(Debug)]
pub struct ApiError(pub JourneyError);

impl From<JourneyError> for ApiError {
    fn from(err: JourneyError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self.0 {
            JourneyError::Validation(_)
            | JourneyError::Predicate(_)
            | JourneyError::TriggerPredicate(_) => {
                (StatusCode::BAD_REQUEST, "invalid_request")
            }
            JourneyError::NotFound { .. } => (StatusCode::NOT_FOUND, "not_found"),
            JourneyError::InvalidTransition { .. } => (StatusCode::CONFLICT, "invalid_transition"),
            JourneyError::ClaimConflict(_) => (StatusCode::CONFLICT, "conflict"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        };

        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %self.0, "Request failed");
            metrics::counter!("api.errors").increment(1);
            "Internal processing error".to_string()
        } else {
            metrics::counter!("api.client_errors", "code" => code).increment(1);
            self.0.to_string()
        };

        (
            status,
            Json(ErrorResponse {
                error: code.to_string(),
                message,
            }),
        )
            .into_response()
    }
}
