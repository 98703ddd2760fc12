//! Router-level tests: requests go through the full axum stack.

use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use eventdesk_api::{ApiServer, AppState};
use eventdesk_journey::collaborators::{InMemoryContacts, OutboxEmailSender, ScriptedWebhookCaller};
use eventdesk_journey::{Collaborators, JourneyEngine};

fn app() -> (Router, Arc<OutboxEmailSender>) {
    let email = Arc::new(OutboxEmailSender::new());
    let engine = JourneyEngine::in_memory(Collaborators {
        email: email.clone(),
        webhook: Arc::new(ScriptedWebhookCaller::new()),
        contacts: Arc::new(InMemoryContacts::new()),
    });
    (
        ApiServer::router(AppState::new(Arc::new(engine), "test-node")),
        email,
    )
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

fn welcome_automation() -> Value {
    json!({
        "name": "Welcome attendees",
        "scope_id": "edition-2026",
        "created_by": "organizer-1",
        "trigger": {"event": {"type": "ticket_purchased"}},
        "graph": {
            "start": 1,
            "steps": [
                {"id": 1, "action": {"type": "send_email", "template_id": "welcome", "next": 2}},
                {"id": 2, "action": {"type": "add_tag", "tag": "welcomed", "next": null}}
            ]
        }
    })
}

#[tokio::test]
async fn test_probes() {
    let (app, _) = app();
    let (status, body) = send(&app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["node_id"], "test-node");

    assert_eq!(send(&app, "GET", "/live", None).await.0, StatusCode::OK);
    assert_eq!(send(&app, "GET", "/ready", None).await.0, StatusCode::OK);
}

#[tokio::test]
async fn test_automation_lifecycle_over_http() {
    let (app, _) = app();
    let (status, created) = send(&app, "POST", "/v1/automations", Some(welcome_automation())).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["status"], "draft");
    assert_eq!(created["version"], 1);
    assert_eq!(created["definition"]["graph"]["start"], 1);
    let id = created["id"].as_str().unwrap().to_string();

    let (status, listed) = send(&app, "GET", "/v1/automations", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed.as_array().unwrap().len(), 1);

    let (status, active) = send(&app, "POST", &format!("/v1/automations/{id}/activate"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(active["status"], "active");

    // Activating twice is an invalid transition.
    let (status, err) = send(&app, "POST", &format!("/v1/automations/{id}/activate"), None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(err["error"], "invalid_transition");

    let update = json!({
        "trigger": {"event": {"type": "checked_in"}},
        "graph": {"start": 1, "steps": [{"id": 1, "action": {"type": "add_tag", "tag": "on-site", "next": null}}]}
    });
    let (status, updated) = send(&app, "PUT", &format!("/v1/automations/{id}/definition"), Some(update)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["version"], 2);
    assert_eq!(updated["trigger_type"], "checked_in");

    let (status, paused) = send(&app, "POST", &format!("/v1/automations/{id}/pause"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(paused["status"], "paused");

    let (status, report) = send(
        &app,
        "POST",
        &format!("/v1/automations/{id}/exit-active"),
        Some(json!({"reason": "edition cancelled"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["exited"], json!([]));

    let (status, resumed) = send(&app, "POST", &format!("/v1/automations/{id}/resume"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(resumed["status"], "active");
}

#[tokio::test]
async fn test_invalid_graph_is_rejected() {
    let (app, _) = app();
    let mut request = welcome_automation();
    // Edge to a step that does not exist.
    request["graph"]["steps"][1]["action"]["next"] = json!(9);
    let (status, _) = send(&app, "POST", "/v1/automations", Some(request)).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let mut unnamed = welcome_automation();
    unnamed["name"] = json!("");
    let (status, body) = send(&app, "POST", "/v1/automations", Some(unnamed)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_request");
}

#[tokio::test]
async fn test_unknown_ids_are_not_found() {
    let (app, _) = app();
    let missing = uuid::Uuid::new_v4();
    let (status, body) = send(&app, "GET", &format!("/v1/automations/{missing}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not_found");

    let (status, _) = send(&app, "GET", &format!("/v1/enrollments/{missing}/history"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_event_enrolls_contact_and_enrollment_is_queryable() {
    let (app, _) = app();
    let (_, created) = send(&app, "POST", "/v1/automations", Some(welcome_automation())).await;
    let id = created["id"].as_str().unwrap().to_string();
    send(&app, "POST", &format!("/v1/automations/{id}/activate"), None).await;

    let event = json!({
        "type": "ticket_purchased",
        "contact_id": "contact-42",
        "scope_id": "edition-2026",
        "payload": {"ticket_type": "early_bird"}
    });
    let (status, report) = send(&app, "POST", "/v1/events", Some(event.clone())).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(report["enrolled"].as_array().unwrap().len(), 1);
    let enrollment_id = report["enrolled"][0].as_str().unwrap().to_string();

    let (_, duplicate) = send(&app, "POST", "/v1/events", Some(event)).await;
    assert_eq!(duplicate["duplicates"], 1);

    let (status, enrollments) = send(
        &app,
        "GET",
        &format!("/v1/enrollments?automation_id={id}&status=active"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let enrollments = enrollments.as_array().unwrap();
    assert_eq!(enrollments.len(), 1);
    assert_eq!(enrollments[0]["contact_id"], "contact-42");

    let (status, history) = send(&app, "GET", &format!("/v1/enrollments/{enrollment_id}/history"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(history, json!([]));

    let (status, stats) = send(&app, "GET", &format!("/v1/automations/{id}/stats"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["enrollment_count"], 1);
    assert_eq!(stats["active"], 1);

    let (status, reconciled) = send(&app, "POST", &format!("/v1/automations/{id}/reconcile"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(reconciled["enrollment_count"], 1);
}
