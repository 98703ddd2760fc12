use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreError;

/// Domain event types that can start a contact journey.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    ContactCreated,
    TicketPurchased,
    CheckedIn,
    TagAdded,
    ConsentGiven,
    ScheduledDate,
    TalkSubmitted,
    TalkAccepted,
    TalkRejected,
}

impl TriggerType {
    pub const ALL: [TriggerType; 9] = [
        TriggerType::ContactCreated,
        TriggerType::TicketPurchased,
        TriggerType::CheckedIn,
        TriggerType::TagAdded,
        TriggerType::ConsentGiven,
        TriggerType::ScheduledDate,
        TriggerType::TalkSubmitted,
        TriggerType::TalkAccepted,
        TriggerType::TalkRejected,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::ContactCreated => "contact_created",
            TriggerType::TicketPurchased => "ticket_purchased",
            TriggerType::CheckedIn => "checked_in",
            TriggerType::TagAdded => "tag_added",
            TriggerType::ConsentGiven => "consent_given",
            TriggerType::ScheduledDate => "scheduled_date",
            TriggerType::TalkSubmitted => "talk_submitted",
            TriggerType::TalkAccepted => "talk_accepted",
            TriggerType::TalkRejected => "talk_rejected",
        }
    }
}

impl fmt::Display for TriggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TriggerType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TriggerType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| CoreError::UnknownEventType(s.to_string()))
    }
}

/// A domain event emitted by one of the platform's producers (ticketing,
/// check-in, consent, CFP, tagging). Delivery is at-least-once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainEvent {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    #[serde(rename = "type")]
    pub event_type: TriggerType,
    pub contact_id: String,
    /// Owning event or edition.
    pub scope_id: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default = "Utc::now")]
    pub occurred_at: DateTime<Utc>,
}

impl DomainEvent {
    pub fn new(
        event_type: TriggerType,
        contact_id: impl Into<String>,
        scope_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type,
            contact_id: contact_id.into(),
            scope_id: scope_id.into(),
            payload,
            occurred_at: Utc::now(),
        }
    }
}

/// Lifecycle notification emitted by the automation engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineEvent {
    pub event_id: Uuid,
    pub event_type: EngineEventType,
    pub automation_id: Uuid,
    pub enrollment_id: Option<Uuid>,
    pub contact_id: Option<String>,
    pub step_id: Option<u32>,
    pub detail: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EngineEventType {
    EnrollmentCreated,
    StepCompleted,
    StepFailed,
    EnrollmentParked,
    EnrollmentCompleted,
    EnrollmentFailed,
    EnrollmentExited,
    RecoveryPerformed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_type_round_trips_through_str() {
        for t in TriggerType::ALL {
            assert_eq!(t.as_str().parse::<TriggerType>().unwrap(), t);
        }
        assert!(matches!(
            "ticket_refunded".parse::<TriggerType>(),
            Err(CoreError::UnknownEventType(_))
        ));
    }

    #[test]
    fn test_domain_event_wire_shape() {
        let event: DomainEvent = serde_json::from_str(
            r#"{"type": "checked_in", "contact_id": "c-1", "scope_id": "devconf-2026"}"#,
        )
        .unwrap();
        assert_eq!(event.event_type, TriggerType::CheckedIn);
        assert!(event.payload.is_null());
    }
}
