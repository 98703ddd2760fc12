//! Interfaces to the services the engine calls out to: email delivery,
//! webhook delivery and the contact store. In-memory implementations are
//! provided for development and tests.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};
use uuid::Uuid;

/// Whether retrying an effect can help.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EffectErrorKind {
    /// Network failure, timeout, 5xx: retried with backoff.
    Transient,
    /// Validation or configuration error: recorded as failed immediately.
    Permanent,
}

impl fmt::Display for EffectErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EffectErrorKind::Transient => f.write_str("transient"),
            EffectErrorKind::Permanent => f.write_str("permanent"),
        }
    }
}

/// Failure reported by a collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EffectError {
    pub kind: EffectErrorKind,
    pub message: String,
    /// Extra data for the execution log (status code, response body, ...).
    pub detail: Option<Value>,
}

impl EffectError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: EffectErrorKind::Transient,
            message: message.into(),
            detail: None,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: EffectErrorKind::Permanent,
            message: message.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = Some(detail);
        self
    }

    pub fn is_transient(&self) -> bool {
        self.kind == EffectErrorKind::Transient
    }
}

impl fmt::Display for EffectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.kind)
    }
}

/// Answer to "was the effect keyed by this idempotency key already applied?"
#[derive(Debug, Clone, PartialEq)]
pub enum Confirmation {
    /// Applied; carries the collaborator's record of it.
    Applied(Value),
    NotApplied,
    /// The collaborator cannot answer.
    Unsupported,
}

// ─── Email ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailRequest {
    pub contact_id: String,
    pub template_id: String,
    pub context: Value,
    pub idempotency_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailReceipt {
    pub provider_message_id: Option<String>,
}

#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send(&self, request: EmailRequest) -> Result<EmailReceipt, EffectError>;

    async fn confirm(&self, _idempotency_key: &str) -> Confirmation {
        Confirmation::Unsupported
    }
}

// ─── Webhook ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookRequest {
    pub url: String,
    pub payload: Value,
    pub headers: BTreeMap<String, String>,
    pub idempotency_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookResponse {
    pub status_code: u16,
    pub body: String,
}

impl WebhookResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
}

/// `Err` is reserved for transport failures; any HTTP status is an `Ok`.
#[async_trait]
pub trait WebhookCaller: Send + Sync {
    async fn call(&self, request: WebhookRequest) -> Result<WebhookResponse, EffectError>;

    async fn confirm(&self, _idempotency_key: &str) -> Confirmation {
        Confirmation::Unsupported
    }
}

// ─── Contacts ───────────────────────────────────────────────────────────

/// Read model of a contact used for conditions and rendering.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContactSnapshot {
    pub contact_id: String,
    pub email: Option<String>,
    pub tags: BTreeSet<String>,
    pub fields: serde_json::Map<String, Value>,
}

impl ContactSnapshot {
    pub fn new(contact_id: impl Into<String>) -> Self {
        Self {
            contact_id: contact_id.into(),
            ..Default::default()
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }

    pub fn to_value(&self) -> Value {
        json!({
            "id": self.contact_id,
            "email": self.email,
            "tags": self.tags,
            "fields": self.fields,
        })
    }
}

#[async_trait]
pub trait ContactDirectory: Send + Sync {
    async fn snapshot(&self, contact_id: &str) -> Result<ContactSnapshot, EffectError>;
    async fn add_tag(&self, contact_id: &str, tag: &str) -> Result<(), EffectError>;
    async fn remove_tag(&self, contact_id: &str, tag: &str) -> Result<(), EffectError>;
    async fn update_field(&self, contact_id: &str, key: &str, value: Value)
        -> Result<(), EffectError>;
}

/// The set of collaborators handed to the step executor.
#[derive(Clone)]
pub struct Collaborators {
    pub email: Arc<dyn EmailSender>,
    pub webhook: Arc<dyn WebhookCaller>,
    pub contacts: Arc<dyn ContactDirectory>,
}

// ─── In-memory implementations ──────────────────────────────────────────

/// A message accepted by [`OutboxEmailSender`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentEmail {
    pub request: EmailRequest,
    pub provider_message_id: String,
    pub sent_at: DateTime<Utc>,
}

/// Email sender that records messages in an outbox keyed by idempotency key.
/// Failures can be scripted with [`OutboxEmailSender::fail_next`].
#[derive(Default)]
pub struct OutboxEmailSender {
    outbox: Mutex<Vec<SentEmail>>,
    by_key: DashMap<String, String>,
    scripted_failures: Mutex<VecDeque<EffectError>>,
}

impl OutboxEmailSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, error: EffectError) {
        self.scripted_failures.lock().push_back(error);
    }

    pub fn sent(&self) -> Vec<SentEmail> {
        self.outbox.lock().clone()
    }

    pub fn sent_to(&self, contact_id: &str, template_id: &str) -> usize {
        self.outbox
            .lock()
            .iter()
            .filter(|m| m.request.contact_id == contact_id && m.request.template_id == template_id)
            .count()
    }
}

#[async_trait]
impl EmailSender for OutboxEmailSender {
    async fn send(&self, request: EmailRequest) -> Result<EmailReceipt, EffectError> {
        if let Some(err) = self.scripted_failures.lock().pop_front() {
            return Err(err);
        }
        if let Some(existing) = self.by_key.get(&request.idempotency_key) {
            debug!(key = %request.idempotency_key, "Duplicate email send suppressed");
            return Ok(EmailReceipt {
                provider_message_id: Some(existing.clone()),
            });
        }

        let message_id = format!("msg-{}", Uuid::new_v4());
        info!(
            contact_id = %request.contact_id,
            template_id = %request.template_id,
            message_id = %message_id,
            "Email queued"
        );
        self.by_key
            .insert(request.idempotency_key.clone(), message_id.clone());
        self.outbox.lock().push(SentEmail {
            request,
            provider_message_id: message_id.clone(),
            sent_at: Utc::now(),
        });
        Ok(EmailReceipt {
            provider_message_id: Some(message_id),
        })
    }

    async fn confirm(&self, idempotency_key: &str) -> Confirmation {
        match self.by_key.get(idempotency_key) {
            Some(id) => Confirmation::Applied(json!({"provider_message_id": id.clone()})),
            None => Confirmation::NotApplied,
        }
    }
}

/// Webhook caller that replays scripted responses (default `200 OK`) and
/// records every call. Does not support confirmation.
#[derive(Default)]
pub struct ScriptedWebhookCaller {
    responses: Mutex<VecDeque<Result<WebhookResponse, EffectError>>>,
    calls: Mutex<Vec<WebhookRequest>>,
}

impl ScriptedWebhookCaller {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_response(&self, response: Result<WebhookResponse, EffectError>) {
        self.responses.lock().push_back(response);
    }

    pub fn push_status(&self, status_code: u16, times: usize) {
        let mut responses = self.responses.lock();
        for _ in 0..times {
            responses.push_back(Ok(WebhookResponse {
                status_code,
                body: String::new(),
            }));
        }
    }

    pub fn calls(&self) -> Vec<WebhookRequest> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl WebhookCaller for ScriptedWebhookCaller {
    async fn call(&self, request: WebhookRequest) -> Result<WebhookResponse, EffectError> {
        self.calls.lock().push(request);
        self.responses.lock().pop_front().unwrap_or_else(|| {
            Ok(WebhookResponse {
                status_code: 200,
                body: "ok".to_string(),
            })
        })
    }
}

/// Contact directory backed by a concurrent map. Unknown contacts read as
/// empty snapshots and are created on first mutation.
#[derive(Default)]
pub struct InMemoryContacts {
    contacts: DashMap<String, ContactSnapshot>,
    mutation_failures: Mutex<HashMap<String, EffectError>>,
}

impl InMemoryContacts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, contact: ContactSnapshot) {
        self.contacts.insert(contact.contact_id.clone(), contact);
    }

    pub fn get(&self, contact_id: &str) -> Option<ContactSnapshot> {
        self.contacts.get(contact_id).map(|c| c.clone())
    }

    /// Makes every mutation of `contact_id` fail with `error`.
    pub fn fail_mutations_for(&self, contact_id: &str, error: EffectError) {
        self.mutation_failures
            .lock()
            .insert(contact_id.to_string(), error);
    }

    fn check_failure(&self, contact_id: &str) -> Result<(), EffectError> {
        match self.mutation_failures.lock().get(contact_id) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ContactDirectory for InMemoryContacts {
    async fn snapshot(&self, contact_id: &str) -> Result<ContactSnapshot, EffectError> {
        Ok(self
            .get(contact_id)
            .unwrap_or_else(|| ContactSnapshot::new(contact_id)))
    }

    async fn add_tag(&self, contact_id: &str, tag: &str) -> Result<(), EffectError> {
        self.check_failure(contact_id)?;
        self.contacts
            .entry(contact_id.to_string())
            .or_insert_with(|| ContactSnapshot::new(contact_id))
            .tags
            .insert(tag.to_string());
        Ok(())
    }

    async fn remove_tag(&self, contact_id: &str, tag: &str) -> Result<(), EffectError> {
        self.check_failure(contact_id)?;
        if let Some(mut contact) = self.contacts.get_mut(contact_id) {
            contact.tags.remove(tag);
        }
        Ok(())
    }

    async fn update_field(
        &self,
        contact_id: &str,
        key: &str,
        value: Value,
    ) -> Result<(), EffectError> {
        self.check_failure(contact_id)?;
        self.contacts
            .entry(contact_id.to_string())
            .or_insert_with(|| ContactSnapshot::new(contact_id))
            .fields
            .insert(key.to_string(), value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn email(key: &str) -> EmailRequest {
        EmailRequest {
            contact_id: "c-1".into(),
            template_id: "welcome".into(),
            context: json!({}),
            idempotency_key: key.into(),
        }
    }

    #[tokio::test]
    async fn test_outbox_deduplicates_by_idempotency_key() {
        let sender = OutboxEmailSender::new();
        let first = sender.send(email("k-1")).await.unwrap();
        let second = sender.send(email("k-1")).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(sender.sent_to("c-1", "welcome"), 1);
        assert!(matches!(sender.confirm("k-1").await, Confirmation::Applied(_)));
        assert_eq!(sender.confirm("k-2").await, Confirmation::NotApplied);
    }

    #[tokio::test]
    async fn test_outbox_scripted_failure() {
        let sender = OutboxEmailSender::new();
        sender.fail_next(EffectError::permanent("unknown template"));
        assert!(sender.send(email("k-1")).await.is_err());
        assert!(sender.send(email("k-1")).await.is_ok());
    }

    #[tokio::test]
    async fn test_contacts_mutations() {
        let contacts = InMemoryContacts::new();
        contacts.add_tag("c-9", "vip").await.unwrap();
        contacts
            .update_field("c-9", "company", json!("Acme"))
            .await
            .unwrap();
        let snap = contacts.snapshot("c-9").await.unwrap();
        assert!(snap.tags.contains("vip"));
        assert_eq!(snap.to_value()["fields"]["company"], json!("Acme"));

        contacts.remove_tag("c-9", "vip").await.unwrap();
        assert!(contacts.get("c-9").unwrap().tags.is_empty());
    }

    #[tokio::test]
    async fn test_scripted_webhook_defaults_to_ok() {
        let hook = ScriptedWebhookCaller::new();
        hook.push_status(503, 1);
        let req = WebhookRequest {
            url: "https://hooks.example.org".into(),
            payload: json!({}),
            headers: BTreeMap::new(),
            idempotency_key: "k".into(),
        };
        assert_eq!(hook.call(req.clone()).await.unwrap().status_code, 503);
        assert!(hook.call(req).await.unwrap().is_success());
        assert_eq!(hook.calls().len(), 2);
    }
}
