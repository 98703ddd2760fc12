//! Automation, enrollment and event REST endpoints.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use eventdesk_core::DomainEvent;
use eventdesk_journey::types::{AutomationDefinition, AutomationStats, EnrollmentFilter};
use eventdesk_journey::{
    Automation, DefinitionUpdate, DispatchReport, Enrollment, ExecutionLogEntry, ExitReport,
    NewAutomation,
};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::rest::{ApiError, AppState};

type ApiResult<T> = Result<Json<T>, ApiError>;

/// An automation together with its current definition.
#[derive(Debug, Serialize)]
pub struct AutomationView {
    #[serde(flatten)]
    pub automation: Automation,
    pub definition: AutomationDefinition,
}

impl AutomationView {
    fn load(state: &AppState, id: Uuid) -> Result<Self, ApiError> {
        let automation = state.engine.get_automation(id)?;
        let definition = state.engine.definition(id, Some(automation.version))?;
        Ok(Self {
            automation,
            definition: definition.as_ref().clone(),
        })
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ExitRequest {
    pub reason: Option<String>,
}

/// POST /v1/automations. Create a draft automation.
pub async fn create_automation(
    State(state): State<AppState>,
    Json(request): Json<NewAutomation>,
) -> Result<(StatusCode, Json<AutomationView>), ApiError> {
    let automation = state.engine.create_automation(request, Utc::now())?;
    metrics::counter!("api.automations_created").increment(1);
    Ok((StatusCode::CREATED, Json(AutomationView::load(&state, automation.id)?)))
}

/// GET /v1/automations
pub async fn list_automations(State(state): State<AppState>) -> Json<Vec<Automation>> {
    Json(state.engine.list_automations())
}

/// GET /v1/automations/:id
pub async fn get_automation(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<AutomationView> {
    Ok(Json(AutomationView::load(&state, id)?))
}

/// PUT /v1/automations/:id/definition. Publish a new definition version.
pub async fn update_definition(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(update): Json<DefinitionUpdate>,
) -> ApiResult<AutomationView> {
    state.engine.update_definition(id, update, Utc::now())?;
    Ok(Json(AutomationView::load(&state, id)?))
}

/// POST /v1/automations/:id/activate
pub async fn activate(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Automation> {
    Ok(Json(state.engine.activate(id)?))
}

/// POST /v1/automations/:id/pause
pub async fn pause(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Automation> {
    Ok(Json(state.engine.pause(id)?))
}

/// POST /v1/automations/:id/resume
pub async fn resume(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Automation> {
    Ok(Json(state.engine.resume(id)?))
}

/// POST /v1/automations/:id/exit-active. Exit every active enrollment.
/// The body is optional.
pub async fn exit_active(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    body: Option<Json<ExitRequest>>,
) -> ApiResult<ExitReport> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let report = state
        .engine
        .exit_active_enrollments(id, request.reason.as_deref(), Utc::now())?;
    Ok(Json(report))
}

/// POST /v1/automations/:id/reconcile. Recount counters from enrollments.
pub async fn reconcile(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Automation> {
    Ok(Json(state.engine.reconcile_counters(id)?))
}

/// GET /v1/automations/:id/stats
pub async fn stats(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<AutomationStats> {
    Ok(Json(state.engine.stats(id)?))
}

/// GET /v1/enrollments?automation_id&contact_id&status
pub async fn list_enrollments(
    State(state): State<AppState>,
    Query(filter): Query<EnrollmentFilter>,
) -> Json<Vec<Enrollment>> {
    Json(state.engine.list_enrollments(&filter))
}

/// GET /v1/enrollments/:id/history. Step history, oldest first.
pub async fn enrollment_history(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Vec<ExecutionLogEntry>> {
    Ok(Json(state.engine.execution_history(id)?))
}

/// POST /v1/events. Feed a domain event to the trigger dispatcher.
pub async fn ingest_event(
    State(state): State<AppState>,
    Json(event): Json<DomainEvent>,
) -> Result<(StatusCode, Json<DispatchReport>), ApiError> {
    let report = state.engine.dispatch(&event, Utc::now())?;
    metrics::counter!("api.events_ingested", "type" => event.event_type.as_str()).increment(1);
    info!(
        event_id = %event.id,
        event_type = %event.event_type,
        enrolled = report.enrolled.len(),
        "Domain event ingested"
    );
    Ok((StatusCode::ACCEPTED, Json(report)))
}
