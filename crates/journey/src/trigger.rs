//! Trigger configuration: which domain events enroll a contact.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use eventdesk_core::TriggerType;

use crate::error::{JourneyError, JourneyResult};
use crate::predicate::Predicate;

/// Typed per-event filters. Optional fields left unset match any value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum TriggerEvent {
    ContactCreated,
    TicketPurchased {
        #[serde(default)]
        ticket_type: Option<String>,
    },
    CheckedIn,
    TagAdded {
        #[serde(default)]
        tag: Option<String>,
    },
    ConsentGiven {
        #[serde(default)]
        purpose: Option<String>,
    },
    /// Fired by the date scheduler for a named schedule (e.g. `edition_start`).
    ScheduledDate { schedule: String },
    TalkSubmitted {
        #[serde(default)]
        track: Option<String>,
    },
    TalkAccepted {
        #[serde(default)]
        track: Option<String>,
    },
    TalkRejected {
        #[serde(default)]
        track: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerConfig {
    pub event: TriggerEvent,
    /// Additional filter evaluated against the event payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predicate: Option<Predicate>,
}

impl TriggerConfig {
    pub fn new(event: TriggerEvent) -> Self {
        Self {
            event,
            predicate: None,
        }
    }

    pub fn with_predicate(mut self, predicate: Predicate) -> Self {
        self.predicate = Some(predicate);
        self
    }

    pub fn trigger_type(&self) -> TriggerType {
        match &self.event {
            TriggerEvent::ContactCreated => TriggerType::ContactCreated,
            TriggerEvent::TicketPurchased { .. } => TriggerType::TicketPurchased,
            TriggerEvent::CheckedIn => TriggerType::CheckedIn,
            TriggerEvent::TagAdded { .. } => TriggerType::TagAdded,
            TriggerEvent::ConsentGiven { .. } => TriggerType::ConsentGiven,
            TriggerEvent::ScheduledDate { .. } => TriggerType::ScheduledDate,
            TriggerEvent::TalkSubmitted { .. } => TriggerType::TalkSubmitted,
            TriggerEvent::TalkAccepted { .. } => TriggerType::TalkAccepted,
            TriggerEvent::TalkRejected { .. } => TriggerType::TalkRejected,
        }
    }

    pub fn validate(&self) -> JourneyResult<()> {
        let filter = match &self.event {
            TriggerEvent::TicketPurchased { ticket_type: v }
            | TriggerEvent::TagAdded { tag: v }
            | TriggerEvent::ConsentGiven { purpose: v }
            | TriggerEvent::TalkSubmitted { track: v }
            | TriggerEvent::TalkAccepted { track: v }
            | TriggerEvent::TalkRejected { track: v } => v.as_deref(),
            TriggerEvent::ScheduledDate { schedule } => Some(schedule.as_str()),
            TriggerEvent::ContactCreated | TriggerEvent::CheckedIn => None,
        };
        if filter.is_some_and(|f| f.trim().is_empty()) {
            return Err(JourneyError::validation(format!(
                "{} trigger filter must not be empty",
                self.trigger_type()
            )));
        }
        if let Some(predicate) = &self.predicate {
            predicate.validate()?;
        }
        Ok(())
    }

    /// Evaluates the typed filter and the optional predicate against an
    /// event payload.
    pub fn matches(&self, payload: &Value) -> JourneyResult<bool> {
        let typed = match &self.event {
            TriggerEvent::TicketPurchased { ticket_type } => {
                field_matches(payload, "ticket_type", ticket_type.as_deref())
            }
            TriggerEvent::TagAdded { tag } => field_matches(payload, "tag", tag.as_deref()),
            TriggerEvent::ConsentGiven { purpose } => {
                field_matches(payload, "purpose", purpose.as_deref())
            }
            TriggerEvent::ScheduledDate { schedule } => {
                field_matches(payload, "schedule", Some(schedule.as_str()))
            }
            TriggerEvent::TalkSubmitted { track }
            | TriggerEvent::TalkAccepted { track }
            | TriggerEvent::TalkRejected { track } => {
                field_matches(payload, "track", track.as_deref())
            }
            TriggerEvent::ContactCreated | TriggerEvent::CheckedIn => true,
        };
        if !typed {
            return Ok(false);
        }
        match &self.predicate {
            Some(predicate) => predicate.evaluate(payload).map_err(|err| match err {
                JourneyError::Predicate(message) => JourneyError::TriggerPredicate(message),
                other => other,
            }),
            None => Ok(true),
        }
    }
}

fn field_matches(payload: &Value, key: &str, expected: Option<&str>) -> bool {
    match expected {
        None => true,
        Some(expected) => payload.get(key).and_then(Value::as_str) == Some(expected),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_typed_filter() {
        let trigger = TriggerConfig::new(TriggerEvent::TicketPurchased {
            ticket_type: Some("vip".into()),
        });
        assert_eq!(trigger.trigger_type(), TriggerType::TicketPurchased);
        assert!(trigger.matches(&json!({"ticket_type": "vip"})).unwrap());
        assert!(!trigger.matches(&json!({"ticket_type": "regular"})).unwrap());
        assert!(!trigger.matches(&json!({})).unwrap());
    }

    #[test]
    fn test_predicate_applies_after_filter() {
        let trigger = TriggerConfig::new(TriggerEvent::TalkAccepted { track: None })
            .with_predicate(Predicate::GreaterThan {
                field: "duration_minutes".into(),
                value: 30.0,
            });
        assert!(trigger.matches(&json!({"duration_minutes": 45})).unwrap());
        assert!(!trigger.matches(&json!({"duration_minutes": 20})).unwrap());
        assert!(matches!(
            trigger.matches(&json!({"duration_minutes": "long"})),
            Err(JourneyError::TriggerPredicate(_))
        ));
    }

    #[test]
    fn test_validation() {
        assert!(TriggerConfig::new(TriggerEvent::TagAdded {
            tag: Some(" ".into())
        })
        .validate()
        .is_err());
        assert!(TriggerConfig::new(TriggerEvent::CheckedIn).validate().is_ok());
    }

    #[test]
    fn test_wire_shape() {
        let trigger: TriggerConfig = serde_json::from_value(json!({
            "event": {"type": "consent_given", "purpose": "newsletter"},
            "predicate": {"op": "always"}
        }))
        .unwrap();
        assert_eq!(trigger.trigger_type(), TriggerType::ConsentGiven);
        assert!(trigger.matches(&json!({"purpose": "newsletter"})).unwrap());
    }
}
