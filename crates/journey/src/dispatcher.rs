//! Trigger dispatcher: turns domain events into enrollments.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use eventdesk_core::event_bus::{make_event, noop_sink, EventSink};
use eventdesk_core::types::{DomainEvent, EngineEventType};

use crate::error::JourneyResult;
use crate::store::Stores;
use crate::types::{Counter, Enrollment};

/// Per-event dispatch summary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DispatchReport {
    /// Enrollment ids created for this event.
    pub enrolled: Vec<Uuid>,
    /// Automations skipped because the contact is already enrolled.
    pub duplicates: usize,
    /// Automations whose trigger predicate could not be evaluated.
    pub predicate_errors: usize,
    /// Candidate automations whose trigger did not match.
    pub unmatched: usize,
    /// Store writes that failed for this event (enrollment or counter).
    #[serde(default)]
    pub store_errors: usize,
}

#[derive(Clone)]
pub struct TriggerDispatcher {
    stores: Stores,
    event_sink: Arc<dyn EventSink>,
}

impl TriggerDispatcher {
    pub fn new(stores: Stores) -> Self {
        Self {
            stores,
            event_sink: noop_sink(),
        }
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    /// Enrolls the event's contact into every active automation in the same
    /// scope whose trigger matches. A failure on one automation never stops
    /// the others.
    pub fn dispatch(&self, event: &DomainEvent, now: DateTime<Utc>) -> JourneyResult<DispatchReport> {
        let mut report = DispatchReport::default();
        let candidates = self
            .stores
            .automations
            .active_for_trigger(event.event_type, &event.scope_id);

        debug!(
            event_id = %event.id,
            event_type = %event.event_type,
            scope_id = %event.scope_id,
            candidates = candidates.len(),
            "Dispatching domain event"
        );

        for automation in candidates {
            let Some(definition) = self
                .stores
                .automations
                .definition(automation.id, automation.version)
            else {
                warn!(
                    automation_id = %automation.id,
                    version = automation.version,
                    "Active automation has no current definition, skipping"
                );
                continue;
            };

            match definition.trigger.matches(&event.payload) {
                Ok(true) => {}
                Ok(false) => {
                    report.unmatched += 1;
                    continue;
                }
                Err(err) => {
                    warn!(
                        automation_id = %automation.id,
                        event_id = %event.id,
                        error = %err,
                        "Trigger predicate failed, treating as no match"
                    );
                    metrics::counter!("journey.trigger_predicate_errors").increment(1);
                    report.predicate_errors += 1;
                    continue;
                }
            }

            let enrollment = Enrollment::new(&definition, event, now);
            let created = match self
                .stores
                .enrollments
                .create_enrollment(enrollment, automation.enrollment_policy)
            {
                Ok(created) => created,
                Err(err) => {
                    warn!(
                        automation_id = %automation.id,
                        event_id = %event.id,
                        contact_id = %event.contact_id,
                        error = %err,
                        "Enrollment write failed, skipping automation"
                    );
                    metrics::counter!("journey.dispatch_store_errors").increment(1);
                    report.store_errors += 1;
                    continue;
                }
            };
            match created {
                Some(created) => {
                    // The enrollment exists either way; a missed increment is
                    // repaired by reconcile.
                    if let Err(err) = self
                        .stores
                        .automations
                        .increment(automation.id, Counter::Enrolled)
                    {
                        warn!(
                            automation_id = %automation.id,
                            enrollment_id = %created.id,
                            error = %err,
                            "Enrollment counter not updated"
                        );
                        metrics::counter!("journey.dispatch_store_errors").increment(1);
                        report.store_errors += 1;
                    }
                    info!(
                        automation_id = %automation.id,
                        enrollment_id = %created.id,
                        contact_id = %created.contact_id,
                        version = created.definition_version,
                        "Contact enrolled"
                    );
                    metrics::counter!("journey.enrollments_created").increment(1);
                    self.event_sink.emit(make_event(
                        EngineEventType::EnrollmentCreated,
                        automation.id,
                        Some(created.id),
                        Some(created.contact_id.clone()),
                    ));
                    report.enrolled.push(created.id);
                }
                None => {
                    debug!(
                        automation_id = %automation.id,
                        contact_id = %event.contact_id,
                        "Contact already enrolled, event ignored"
                    );
                    report.duplicates += 1;
                }
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{FailurePolicy, Step, StepGraph, StepId, StepKind};
    use crate::store::{AutomationStore, EnrollmentStore, MemoryStore};
    use crate::trigger::{TriggerConfig, TriggerEvent};
    use crate::types::{
        Automation, AutomationDefinition, AutomationStatus, Claim, EnrollmentFilter,
        EnrollmentPolicy,
    };
    use crate::error::JourneyError;
    use eventdesk_core::TriggerType;
    use serde_json::json;

    /// Delegates to the memory store but refuses enrollments for one automation.
    struct RefusingEnrollments {
        inner: Arc<MemoryStore>,
        refused: Uuid,
    }

    impl EnrollmentStore for RefusingEnrollments {
        fn create_enrollment(
            &self,
            enrollment: Enrollment,
            policy: EnrollmentPolicy,
        ) -> JourneyResult<Option<Enrollment>> {
            if enrollment.automation_id == self.refused {
                return Err(JourneyError::Store("connection reset".into()));
            }
            self.inner.create_enrollment(enrollment, policy)
        }

        fn get_enrollment(&self, id: Uuid) -> Option<Enrollment> {
            self.inner.get_enrollment(id)
        }

        fn find_ready(&self, now: DateTime<Utc>, limit: usize) -> Vec<Enrollment> {
            self.inner.find_ready(now, limit)
        }

        fn try_claim(
            &self,
            id: Uuid,
            expected_revision: u64,
            claim: Claim,
            now: DateTime<Utc>,
        ) -> JourneyResult<Enrollment> {
            self.inner.try_claim(id, expected_revision, claim, now)
        }

        fn save_claimed(
            &self,
            enrollment: &Enrollment,
            token: Uuid,
            release: bool,
        ) -> JourneyResult<Enrollment> {
            self.inner.save_claimed(enrollment, token, release)
        }

        fn renew_claim(
            &self,
            id: Uuid,
            token: Uuid,
            expires_at: DateTime<Utc>,
            now: DateTime<Utc>,
        ) -> JourneyResult<Enrollment> {
            self.inner.renew_claim(id, token, expires_at, now)
        }

        fn list_enrollments(&self, filter: &EnrollmentFilter) -> Vec<Enrollment> {
            self.inner.list_enrollments(filter)
        }
    }

    fn seed(store: &MemoryStore, name: &str) -> Uuid {
        let now = Utc::now();
        let id = Uuid::new_v4();
        let graph = StepGraph::new(
            StepId(1),
            vec![Step::new(
                1,
                StepKind::AddTag {
                    tag: "attendee".into(),
                    next: None,
                    on_failure: FailurePolicy::Continue,
                },
            )],
        )
        .unwrap();
        let definition = AutomationDefinition {
            automation_id: id,
            version: 1,
            trigger: TriggerConfig::new(TriggerEvent::CheckedIn),
            graph,
            published_at: now,
        };
        let automation = Automation {
            id,
            name: name.into(),
            scope_id: "devconf-2026".into(),
            created_by: "ops".into(),
            status: AutomationStatus::Active,
            trigger_type: TriggerType::CheckedIn,
            enrollment_policy: EnrollmentPolicy::OneShot,
            version: 1,
            enrollment_count: 0,
            completed_count: 0,
            failed_count: 0,
            exited_count: 0,
            created_at: now,
            updated_at: now,
        };
        store.insert_automation(automation, definition).unwrap();
        id
    }

    #[test]
    fn test_store_error_does_not_stop_other_automations() {
        let memory = Arc::new(MemoryStore::new());
        let refused = seed(&memory, "Badge pickup");
        let healthy = seed(&memory, "Session feedback");
        let stores = Stores {
            automations: memory.clone(),
            enrollments: Arc::new(RefusingEnrollments {
                inner: memory.clone(),
                refused,
            }),
            log: memory.clone(),
        };
        let dispatcher = TriggerDispatcher::new(stores.clone());

        let event = DomainEvent::new(TriggerType::CheckedIn, "c-1", "devconf-2026", json!({}));
        let report = dispatcher.dispatch(&event, Utc::now()).unwrap();

        assert_eq!(report.store_errors, 1);
        assert_eq!(report.enrolled.len(), 1);
        let created = stores.enrollments.get_enrollment(report.enrolled[0]).unwrap();
        assert_eq!(created.automation_id, healthy);
        assert_eq!(stores.automations.get_automation(healthy).unwrap().enrollment_count, 1);
        assert_eq!(stores.automations.get_automation(refused).unwrap().enrollment_count, 0);
    }
}
