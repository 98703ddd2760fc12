//! Persistence seams: automations (with versioned definitions and counters),
//! enrollments (with conditional claims) and the execution log.
//!
//! All cross-worker coordination goes through these traits; workers share
//! no other state. [`MemoryStore`] implements all three over concurrent maps
//! and honors the same conditional-write contract a database backend would.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::debug;
use uuid::Uuid;

use eventdesk_core::TriggerType;

use crate::error::{JourneyError, JourneyResult};
use crate::state_machine::StateMachine;
use crate::types::{
    Automation, AutomationDefinition, AutomationStatus, Claim, Counter, CounterSnapshot,
    Enrollment, EnrollmentFilter, EnrollmentPolicy, EnrollmentStatus, ExecutionLogEntry,
};

pub trait AutomationStore: Send + Sync {
    /// Inserts a new automation together with its first definition.
    fn insert_automation(
        &self,
        automation: Automation,
        definition: AutomationDefinition,
    ) -> JourneyResult<()>;

    fn get_automation(&self, id: Uuid) -> Option<Automation>;

    fn list_automations(&self) -> Vec<Automation>;

    /// Active automations in `scope_id` listening for `trigger`.
    fn active_for_trigger(&self, trigger: TriggerType, scope_id: &str) -> Vec<Automation>;

    fn definition(&self, automation_id: Uuid, version: u32) -> Option<Arc<AutomationDefinition>>;

    /// Stores `definition` as the next version and points the automation at
    /// it. Returns the updated automation.
    fn publish_definition(&self, definition: AutomationDefinition) -> JourneyResult<Automation>;

    fn set_status(&self, id: Uuid, status: AutomationStatus) -> JourneyResult<Automation>;

    /// Atomic increment scoped to the single automation row.
    fn increment(&self, id: Uuid, counter: Counter) -> JourneyResult<()>;

    fn overwrite_counters(&self, id: Uuid, counters: CounterSnapshot) -> JourneyResult<Automation>;
}

pub trait EnrollmentStore: Send + Sync {
    /// Inserts `enrollment` unless the automation's policy forbids another
    /// enrollment for the same contact. Returns `None` on such a duplicate.
    fn create_enrollment(
        &self,
        enrollment: Enrollment,
        policy: EnrollmentPolicy,
    ) -> JourneyResult<Option<Enrollment>>;

    fn get_enrollment(&self, id: Uuid) -> Option<Enrollment>;

    /// Active, due and unclaimed enrollments, oldest first.
    fn find_ready(&self, now: DateTime<Utc>, limit: usize) -> Vec<Enrollment>;

    /// Conditional write: succeeds only if the row still has
    /// `expected_revision` and carries no live claim.
    fn try_claim(
        &self,
        id: Uuid,
        expected_revision: u64,
        claim: Claim,
        now: DateTime<Utc>,
    ) -> JourneyResult<Enrollment>;

    /// Writes `enrollment` back if `token` still owns the row. With
    /// `release` the claim is cleared in the same write.
    fn save_claimed(
        &self,
        enrollment: &Enrollment,
        token: Uuid,
        release: bool,
    ) -> JourneyResult<Enrollment>;

    /// Moves the expiry of a claim `token` still holds. Fails with a
    /// conflict once the claim has lapsed at `now`, even if no other worker
    /// has taken the row yet.
    fn renew_claim(
        &self,
        id: Uuid,
        token: Uuid,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> JourneyResult<Enrollment>;

    fn list_enrollments(&self, filter: &EnrollmentFilter) -> Vec<Enrollment>;
}

pub trait ExecutionLog: Send + Sync {
    fn append(&self, entry: &ExecutionLogEntry) -> JourneyResult<()>;

    /// Replaces an existing entry; only forward status moves are accepted.
    fn update(&self, entry: &ExecutionLogEntry) -> JourneyResult<()>;

    fn history(&self, enrollment_id: Uuid) -> Vec<ExecutionLogEntry>;

    fn latest(&self, enrollment_id: Uuid) -> Option<ExecutionLogEntry>;
}

/// The store handles shared by dispatcher, executor, scheduler and engine.
#[derive(Clone)]
pub struct Stores {
    pub automations: Arc<dyn AutomationStore>,
    pub enrollments: Arc<dyn EnrollmentStore>,
    pub log: Arc<dyn ExecutionLog>,
}

impl Stores {
    pub fn in_memory() -> Self {
        let store = Arc::new(MemoryStore::new());
        Self {
            automations: store.clone(),
            enrollments: store.clone(),
            log: store,
        }
    }
}

// ─── In-memory implementation ───────────────────────────────────────────

#[derive(Default)]
pub struct MemoryStore {
    automations: DashMap<Uuid, Automation>,
    definitions: DashMap<(Uuid, u32), Arc<AutomationDefinition>>,
    enrollments: DashMap<Uuid, Enrollment>,
    /// Uniqueness index over (automation, contact).
    pairs: DashMap<(Uuid, String), Vec<Uuid>>,
    log: DashMap<Uuid, Vec<ExecutionLogEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AutomationStore for MemoryStore {
    fn insert_automation(
        &self,
        automation: Automation,
        definition: AutomationDefinition,
    ) -> JourneyResult<()> {
        if definition.automation_id != automation.id || definition.version != automation.version {
            return Err(JourneyError::Store(
                "definition does not belong to automation".into(),
            ));
        }
        match self.automations.entry(automation.id) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(JourneyError::Store(format!(
                "automation {} already exists",
                automation.id
            ))),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                self.definitions
                    .insert((definition.automation_id, definition.version), Arc::new(definition));
                slot.insert(automation);
                Ok(())
            }
        }
    }

    fn get_automation(&self, id: Uuid) -> Option<Automation> {
        self.automations.get(&id).map(|r| r.clone())
    }

    fn list_automations(&self) -> Vec<Automation> {
        let mut all: Vec<Automation> = self.automations.iter().map(|r| r.value().clone()).collect();
        all.sort_by_key(|a| a.created_at);
        all
    }

    fn active_for_trigger(&self, trigger: TriggerType, scope_id: &str) -> Vec<Automation> {
        self.automations
            .iter()
            .filter(|r| {
                let a = r.value();
                a.status == AutomationStatus::Active
                    && a.trigger_type == trigger
                    && a.scope_id == scope_id
            })
            .map(|r| r.value().clone())
            .collect()
    }

    fn definition(&self, automation_id: Uuid, version: u32) -> Option<Arc<AutomationDefinition>> {
        self.definitions
            .get(&(automation_id, version))
            .map(|r| r.value().clone())
    }

    fn publish_definition(&self, definition: AutomationDefinition) -> JourneyResult<Automation> {
        let mut automation = self
            .automations
            .get_mut(&definition.automation_id)
            .ok_or_else(|| JourneyError::not_found("automation", definition.automation_id))?;
        if definition.version != automation.version + 1 {
            return Err(JourneyError::Store(format!(
                "expected definition version {}, got {}",
                automation.version + 1,
                definition.version
            )));
        }
        automation.version = definition.version;
        automation.trigger_type = definition.trigger.trigger_type();
        automation.updated_at = definition.published_at;
        self.definitions
            .insert((definition.automation_id, definition.version), Arc::new(definition));
        Ok(automation.clone())
    }

    fn set_status(&self, id: Uuid, status: AutomationStatus) -> JourneyResult<Automation> {
        let mut automation = self
            .automations
            .get_mut(&id)
            .ok_or_else(|| JourneyError::not_found("automation", id))?;
        let mut machine = StateMachine::automation(automation.status);
        machine.transition(status)?;
        automation.status = machine.state;
        automation.updated_at = Utc::now();
        Ok(automation.clone())
    }

    fn increment(&self, id: Uuid, counter: Counter) -> JourneyResult<()> {
        let mut automation = self
            .automations
            .get_mut(&id)
            .ok_or_else(|| JourneyError::not_found("automation", id))?;
        match counter {
            Counter::Enrolled => automation.enrollment_count += 1,
            Counter::Completed => automation.completed_count += 1,
            Counter::Failed => automation.failed_count += 1,
            Counter::Exited => automation.exited_count += 1,
        }
        Ok(())
    }

    fn overwrite_counters(&self, id: Uuid, counters: CounterSnapshot) -> JourneyResult<Automation> {
        let mut automation = self
            .automations
            .get_mut(&id)
            .ok_or_else(|| JourneyError::not_found("automation", id))?;
        automation.enrollment_count = counters.enrollment_count;
        automation.completed_count = counters.completed_count;
        automation.failed_count = counters.failed_count;
        automation.exited_count = counters.exited_count;
        Ok(automation.clone())
    }
}

impl EnrollmentStore for MemoryStore {
    fn create_enrollment(
        &self,
        enrollment: Enrollment,
        policy: EnrollmentPolicy,
    ) -> JourneyResult<Option<Enrollment>> {
        // The pair entry stays locked until the enrollment is inserted, so
        // two concurrent dispatches of the same event serialize here.
        let key = (enrollment.automation_id, enrollment.contact_id.clone());
        let mut existing = self.pairs.entry(key).or_default();

        let blocked = match policy {
            EnrollmentPolicy::OneShot => !existing.is_empty(),
            EnrollmentPolicy::ReEnterable => existing.iter().any(|id| {
                self.enrollments
                    .get(id)
                    .is_some_and(|e| e.status == EnrollmentStatus::Active)
            }),
        };
        if blocked {
            debug!(
                automation_id = %enrollment.automation_id,
                contact_id = %enrollment.contact_id,
                "Enrollment already exists for pair"
            );
            return Ok(None);
        }

        let mut stored = enrollment;
        stored.revision = 1;
        existing.push(stored.id);
        self.enrollments.insert(stored.id, stored.clone());
        Ok(Some(stored))
    }

    fn get_enrollment(&self, id: Uuid) -> Option<Enrollment> {
        self.enrollments.get(&id).map(|r| r.clone())
    }

    fn find_ready(&self, now: DateTime<Utc>, limit: usize) -> Vec<Enrollment> {
        let mut ready: Vec<Enrollment> = self
            .enrollments
            .iter()
            .filter(|r| r.value().is_ready(now))
            .map(|r| r.value().clone())
            .collect();
        ready.sort_by_key(|e| (e.wait_until.unwrap_or(e.updated_at), e.started_at));
        ready.truncate(limit);
        ready
    }

    fn try_claim(
        &self,
        id: Uuid,
        expected_revision: u64,
        claim: Claim,
        now: DateTime<Utc>,
    ) -> JourneyResult<Enrollment> {
        let mut row = self
            .enrollments
            .get_mut(&id)
            .ok_or_else(|| JourneyError::not_found("enrollment", id))?;
        if row.revision != expected_revision
            || row.status != EnrollmentStatus::Active
            || row.is_claimed(now)
        {
            return Err(JourneyError::ClaimConflict(id));
        }
        row.claim = Some(claim);
        row.revision += 1;
        Ok(row.clone())
    }

    fn save_claimed(
        &self,
        enrollment: &Enrollment,
        token: Uuid,
        release: bool,
    ) -> JourneyResult<Enrollment> {
        let mut row = self
            .enrollments
            .get_mut(&enrollment.id)
            .ok_or_else(|| JourneyError::not_found("enrollment", enrollment.id))?;
        if row.claim.as_ref().map(|c| c.token) != Some(token) {
            return Err(JourneyError::ClaimConflict(enrollment.id));
        }
        let mut updated = enrollment.clone();
        updated.revision = row.revision + 1;
        updated.claim = if release { None } else { row.claim.clone() };
        *row = updated.clone();
        Ok(updated)
    }

    fn renew_claim(
        &self,
        id: Uuid,
        token: Uuid,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> JourneyResult<Enrollment> {
        let mut row = self
            .enrollments
            .get_mut(&id)
            .ok_or_else(|| JourneyError::not_found("enrollment", id))?;
        match row.claim.as_mut() {
            Some(claim) if claim.token == token && claim.is_live(now) => {
                claim.expires_at = expires_at;
            }
            _ => return Err(JourneyError::ClaimConflict(id)),
        }
        row.revision += 1;
        Ok(row.clone())
    }

    fn list_enrollments(&self, filter: &EnrollmentFilter) -> Vec<Enrollment> {
        let mut matching: Vec<Enrollment> = self
            .enrollments
            .iter()
            .filter(|r| filter.matches(r.value()))
            .map(|r| r.value().clone())
            .collect();
        matching.sort_by_key(|e| e.started_at);
        matching
    }
}

impl ExecutionLog for MemoryStore {
    fn append(&self, entry: &ExecutionLogEntry) -> JourneyResult<()> {
        let mut entries = self.log.entry(entry.enrollment_id).or_default();
        if entries.iter().any(|e| e.id == entry.id) {
            return Err(JourneyError::Store(format!(
                "log entry {} already appended",
                entry.id
            )));
        }
        entries.push(entry.clone());
        Ok(())
    }

    fn update(&self, entry: &ExecutionLogEntry) -> JourneyResult<()> {
        let mut entries = self
            .log
            .get_mut(&entry.enrollment_id)
            .ok_or_else(|| JourneyError::not_found("log entry", entry.id))?;
        let slot = entries
            .iter_mut()
            .find(|e| e.id == entry.id)
            .ok_or_else(|| JourneyError::not_found("log entry", entry.id))?;
        if slot.status != entry.status && !slot.status.can_advance_to(entry.status) {
            return Err(JourneyError::InvalidTransition {
                from: format!("{:?}", slot.status),
                to: format!("{:?}", entry.status),
            });
        }
        *slot = entry.clone();
        Ok(())
    }

    fn history(&self, enrollment_id: Uuid) -> Vec<ExecutionLogEntry> {
        self.log
            .get(&enrollment_id)
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    fn latest(&self, enrollment_id: Uuid) -> Option<ExecutionLogEntry> {
        self.log
            .get(&enrollment_id)
            .and_then(|r| r.last().cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{FailurePolicy, Step, StepGraph, StepId, StepKind};
    use crate::trigger::{TriggerConfig, TriggerEvent};
    use chrono::Duration;
    use eventdesk_core::DomainEvent;
    use serde_json::json;

    fn seed(store: &MemoryStore) -> (Automation, AutomationDefinition) {
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
            name: "Tag attendees".into(),
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
        store
            .insert_automation(automation.clone(), definition.clone())
            .unwrap();
        (automation, definition)
    }

    fn enrollment(definition: &AutomationDefinition, contact: &str) -> Enrollment {
        let event = DomainEvent::new(TriggerType::CheckedIn, contact, "devconf-2026", json!({}));
        Enrollment::new(definition, &event, Utc::now())
    }

    #[test]
    fn test_one_shot_uniqueness_spans_lifetime() {
        let store = MemoryStore::new();
        let (_, def) = seed(&store);
        let first = store
            .create_enrollment(enrollment(&def, "c-1"), EnrollmentPolicy::OneShot)
            .unwrap()
            .unwrap();

        // Finish it, then try again.
        let now = Utc::now();
        let claimed = store
            .try_claim(first.id, first.revision, Claim::new("w", now + Duration::seconds(60)), now)
            .unwrap();
        let mut done = claimed.clone();
        done.complete(now).unwrap();
        store
            .save_claimed(&done, claimed.claim.unwrap().token, true)
            .unwrap();

        assert!(store
            .create_enrollment(enrollment(&def, "c-1"), EnrollmentPolicy::OneShot)
            .unwrap()
            .is_none());
        assert!(store
            .create_enrollment(enrollment(&def, "c-1"), EnrollmentPolicy::ReEnterable)
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_re_enterable_blocks_while_active() {
        let store = MemoryStore::new();
        let (_, def) = seed(&store);
        assert!(store
            .create_enrollment(enrollment(&def, "c-1"), EnrollmentPolicy::ReEnterable)
            .unwrap()
            .is_some());
        assert!(store
            .create_enrollment(enrollment(&def, "c-1"), EnrollmentPolicy::ReEnterable)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_claim_is_conditional_and_expires() {
        let store = MemoryStore::new();
        let (_, def) = seed(&store);
        let row = store
            .create_enrollment(enrollment(&def, "c-1"), EnrollmentPolicy::OneShot)
            .unwrap()
            .unwrap();
        let now = Utc::now();
        let ttl = Duration::seconds(120);

        let held = store
            .try_claim(row.id, row.revision, Claim::new("w1", now + ttl), now)
            .unwrap();
        // Stale revision and live claim both conflict.
        assert!(matches!(
            store.try_claim(row.id, row.revision, Claim::new("w2", now + ttl), now),
            Err(JourneyError::ClaimConflict(_))
        ));
        assert!(matches!(
            store.try_claim(row.id, held.revision, Claim::new("w2", now + ttl), now),
            Err(JourneyError::ClaimConflict(_))
        ));
        assert!(store.find_ready(now, 10).is_empty());

        // After expiry the row is selectable and claimable again.
        let later = now + ttl + Duration::seconds(1);
        let ready = store.find_ready(later, 10);
        assert_eq!(ready.len(), 1);
        let stolen = store
            .try_claim(row.id, ready[0].revision, Claim::new("w2", later + ttl), later)
            .unwrap();

        // The first worker lost its claim and cannot write.
        let stale_token = held.claim.unwrap().token;
        assert!(matches!(
            store.save_claimed(&stolen, stale_token, true),
            Err(JourneyError::ClaimConflict(_))
        ));
    }

    #[test]
    fn test_claim_renewal_requires_live_claim() {
        let store = MemoryStore::new();
        let (_, def) = seed(&store);
        let row = store
            .create_enrollment(enrollment(&def, "c-1"), EnrollmentPolicy::OneShot)
            .unwrap()
            .unwrap();
        let now = Utc::now();
        let ttl = Duration::seconds(120);
        let held = store
            .try_claim(row.id, row.revision, Claim::new("w1", now + ttl), now)
            .unwrap();
        let token = held.claim.as_ref().unwrap().token;

        let halfway = now + Duration::seconds(60);
        let renewed = store.renew_claim(row.id, token, halfway + ttl, halfway).unwrap();
        assert_eq!(renewed.claim.unwrap().expires_at, halfway + ttl);
        assert!(renewed.revision > held.revision);

        // Wrong token, then a lapsed claim.
        assert!(matches!(
            store.renew_claim(row.id, Uuid::new_v4(), halfway + ttl, halfway),
            Err(JourneyError::ClaimConflict(_))
        ));
        let lapsed = halfway + ttl + Duration::seconds(1);
        assert!(matches!(
            store.renew_claim(row.id, token, lapsed + ttl, lapsed),
            Err(JourneyError::ClaimConflict(_))
        ));
    }

    #[test]
    fn test_counters_and_status() {
        let store = MemoryStore::new();
        let (automation, _) = seed(&store);
        store.increment(automation.id, Counter::Enrolled).unwrap();
        store.increment(automation.id, Counter::Completed).unwrap();
        let a = store.get_automation(automation.id).unwrap();
        assert_eq!((a.enrollment_count, a.completed_count), (1, 1));

        store
            .set_status(automation.id, AutomationStatus::Paused)
            .unwrap();
        assert!(store
            .active_for_trigger(TriggerType::CheckedIn, "devconf-2026")
            .is_empty());
        assert!(store
            .set_status(automation.id, AutomationStatus::Draft)
            .is_err());
    }
}
