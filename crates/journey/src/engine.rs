use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use eventdesk_core::config::AutomationConfig;
use eventdesk_core::event_bus::{make_event, noop_sink, EventSink};
use eventdesk_core::types::{DomainEvent, EngineEventType};

use crate::collaborators::Collaborators;
use crate::dispatcher::{DispatchReport, TriggerDispatcher};
use crate::error::{JourneyError, JourneyResult};
use crate::executor::StepExecutor;
use crate::graph::StepGraph;
use crate::retry::RetryPolicy;
use crate::scheduler::{Scheduler, SchedulerSettings, TickReport};
use crate::store::Stores;
use crate::trigger::TriggerConfig;
use crate::types::{
    Automation, AutomationDefinition, AutomationStats, AutomationStatus, Claim, Counter,
    CounterSnapshot, Enrollment, EnrollmentFilter, EnrollmentPolicy, EnrollmentStatus,
    ExecutionLogEntry, LogStatus,
};

/// Exit reason recorded by [`JourneyEngine::exit_active_enrollments`] when
/// the caller gives none.
pub const AUTOMATION_PAUSED: &str = "automation_paused";

/// Request body for creating an automation. The graph is validated while
/// deserializing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewAutomation {
    pub name: String,
    pub scope_id: String,
    pub created_by: String,
    #[serde(default)]
    pub enrollment_policy: EnrollmentPolicy,
    pub trigger: TriggerConfig,
    pub graph: StepGraph,
}

/// A replacement trigger and graph, published as the next version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefinitionUpdate {
    pub trigger: TriggerConfig,
    pub graph: StepGraph,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExitReport {
    pub exited: Vec<Uuid>,
    /// Enrollments held by a running worker; retry once the claim clears.
    pub busy: Vec<Uuid>,
}

/// Facade over dispatcher, executor, scheduler and the stores.
#[derive(Clone)]
pub struct JourneyEngine {
    stores: Stores,
    dispatcher: TriggerDispatcher,
    executor: Arc<StepExecutor>,
    scheduler: Scheduler,
    claim_ttl: Duration,
    event_sink: Arc<dyn EventSink>,
}

impl std::fmt::Debug for JourneyEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JourneyEngine")
            .field("automations", &self.stores.automations.list_automations().len())
            .field("scheduler", self.scheduler.settings())
            .finish()
    }
}

impl JourneyEngine {
    pub fn new(
        stores: Stores,
        collaborators: Collaborators,
        config: &AutomationConfig,
        worker_id: impl Into<String>,
    ) -> Self {
        let settings = SchedulerSettings::from_config(worker_id, config);
        let executor = StepExecutor::new(stores.clone(), collaborators)
            .with_retry(RetryPolicy::from(&config.retry))
            .with_max_steps_per_tick(config.max_steps_per_tick)
            .with_claim_ttl(settings.claim_ttl);
        Self::assemble(stores, executor, settings, noop_sink())
    }

    /// Engine over fresh in-memory stores with default settings.
    pub fn in_memory(collaborators: Collaborators) -> Self {
        Self::new(
            Stores::in_memory(),
            collaborators,
            &AutomationConfig::default(),
            "local",
        )
    }

    /// Attach an event sink for engine lifecycle events.
    pub fn with_event_sink(self, sink: Arc<dyn EventSink>) -> Self {
        let executor = (*self.executor).clone();
        let settings = self.scheduler.settings().clone();
        Self::assemble(self.stores, executor, settings, sink)
    }

    fn assemble(
        stores: Stores,
        executor: StepExecutor,
        settings: SchedulerSettings,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let executor = Arc::new(executor.with_event_sink(sink.clone()));
        let claim_ttl = settings.claim_ttl;
        Self {
            dispatcher: TriggerDispatcher::new(stores.clone()).with_event_sink(sink.clone()),
            scheduler: Scheduler::new(stores.clone(), executor.clone(), settings),
            executor,
            stores,
            claim_ttl,
            event_sink: sink,
        }
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    // ─── Automation lifecycle ───────────────────────────────────────────

    /// Creates a draft automation with its definition as version 1.
    pub fn create_automation(
        &self,
        request: NewAutomation,
        now: DateTime<Utc>,
    ) -> JourneyResult<Automation> {
        if request.name.trim().is_empty() {
            return Err(JourneyError::validation("automation name must not be empty"));
        }
        if request.scope_id.trim().is_empty() {
            return Err(JourneyError::validation("scope_id must not be empty"));
        }
        request.trigger.validate()?;

        let automation = Automation {
            id: Uuid::new_v4(),
            name: request.name,
            scope_id: request.scope_id,
            created_by: request.created_by,
            status: AutomationStatus::Draft,
            trigger_type: request.trigger.trigger_type(),
            enrollment_policy: request.enrollment_policy,
            version: 1,
            enrollment_count: 0,
            completed_count: 0,
            failed_count: 0,
            exited_count: 0,
            created_at: now,
            updated_at: now,
        };
        let definition = AutomationDefinition {
            automation_id: automation.id,
            version: 1,
            trigger: request.trigger,
            graph: request.graph,
            published_at: now,
        };

        info!(
            automation_id = %automation.id,
            name = %automation.name,
            trigger = %automation.trigger_type,
            steps = definition.graph.len(),
            "Creating automation"
        );
        self.stores
            .automations
            .insert_automation(automation.clone(), definition)?;
        Ok(automation)
    }

    pub fn get_automation(&self, id: Uuid) -> JourneyResult<Automation> {
        self.stores
            .automations
            .get_automation(id)
            .ok_or_else(|| JourneyError::not_found("automation", id))
    }

    pub fn list_automations(&self) -> Vec<Automation> {
        self.stores.automations.list_automations()
    }

    /// The definition at `version`, or the current one.
    pub fn definition(
        &self,
        id: Uuid,
        version: Option<u32>,
    ) -> JourneyResult<Arc<AutomationDefinition>> {
        let version = match version {
            Some(version) => version,
            None => self.get_automation(id)?.version,
        };
        self.stores
            .automations
            .definition(id, version)
            .ok_or_else(|| JourneyError::not_found("definition", format!("{id}@v{version}")))
    }

    /// Publishes a new definition version. Enrollments already in flight
    /// keep the version they started on.
    pub fn update_definition(
        &self,
        id: Uuid,
        update: DefinitionUpdate,
        now: DateTime<Utc>,
    ) -> JourneyResult<Automation> {
        update.trigger.validate()?;
        let current = self.get_automation(id)?;
        let definition = AutomationDefinition {
            automation_id: id,
            version: current.version + 1,
            trigger: update.trigger,
            graph: update.graph,
            published_at: now,
        };
        let automation = self.stores.automations.publish_definition(definition)?;
        info!(
            automation_id = %id,
            version = automation.version,
            "Published automation definition"
        );
        Ok(automation)
    }

    pub fn activate(&self, id: Uuid) -> JourneyResult<Automation> {
        // Re-check the stored definition before it starts enrolling.
        self.definition(id, None)?.trigger.validate()?;
        let automation = self.stores.automations.set_status(id, AutomationStatus::Active)?;
        info!(automation_id = %id, "Automation activated");
        Ok(automation)
    }

    /// Stops new enrollments. In-flight enrollments keep running.
    pub fn pause(&self, id: Uuid) -> JourneyResult<Automation> {
        let automation = self.stores.automations.set_status(id, AutomationStatus::Paused)?;
        info!(automation_id = %id, "Automation paused");
        Ok(automation)
    }

    pub fn resume(&self, id: Uuid) -> JourneyResult<Automation> {
        let current = self.get_automation(id)?;
        if current.status != AutomationStatus::Paused {
            return Err(JourneyError::InvalidTransition {
                from: format!("{:?}", current.status),
                to: "Resumed".to_string(),
            });
        }
        let automation = self.stores.automations.set_status(id, AutomationStatus::Active)?;
        info!(automation_id = %id, "Automation resumed");
        Ok(automation)
    }

    /// Exits every active enrollment of the automation. Each row is claimed
    /// first; rows a worker currently holds are reported as busy.
    pub fn exit_active_enrollments(
        &self,
        id: Uuid,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> JourneyResult<ExitReport> {
        self.get_automation(id)?;
        let reason = reason.unwrap_or(AUTOMATION_PAUSED);
        let active = self.stores.enrollments.list_enrollments(&EnrollmentFilter {
            automation_id: Some(id),
            contact_id: None,
            status: Some(EnrollmentStatus::Active),
        });

        let mut report = ExitReport::default();
        for enrollment in active {
            let claim = Claim::new("exit-all", now + self.claim_ttl);
            let token = claim.token;
            let mut claimed =
                match self
                    .stores
                    .enrollments
                    .try_claim(enrollment.id, enrollment.revision, claim, now)
                {
                    Ok(claimed) => claimed,
                    Err(JourneyError::ClaimConflict(busy)) => {
                        report.busy.push(busy);
                        continue;
                    }
                    Err(err) => return Err(err),
                };

            claimed.exit(reason, now)?;
            let exited = self.stores.enrollments.save_claimed(&claimed, token, true)?;
            self.stores.automations.increment(id, Counter::Exited)?;
            let mut event = make_event(
                EngineEventType::EnrollmentExited,
                id,
                Some(exited.id),
                Some(exited.contact_id.clone()),
            );
            event.detail = Some(reason.to_string());
            self.event_sink.emit(event);
            report.exited.push(exited.id);
        }

        info!(
            automation_id = %id,
            exited = report.exited.len(),
            busy = report.busy.len(),
            reason,
            "Exited active enrollments"
        );
        Ok(report)
    }

    // ─── Runtime ────────────────────────────────────────────────────────

    pub fn dispatch(&self, event: &DomainEvent, now: DateTime<Utc>) -> JourneyResult<DispatchReport> {
        self.dispatcher.dispatch(event, now)
    }

    pub async fn tick(&self, now: DateTime<Utc>) -> TickReport {
        self.scheduler.tick(now).await
    }

    // ─── Queries ────────────────────────────────────────────────────────

    pub fn get_enrollment(&self, id: Uuid) -> JourneyResult<Enrollment> {
        self.stores
            .enrollments
            .get_enrollment(id)
            .ok_or_else(|| JourneyError::not_found("enrollment", id))
    }

    pub fn list_enrollments(&self, filter: &EnrollmentFilter) -> Vec<Enrollment> {
        self.stores.enrollments.list_enrollments(filter)
    }

    /// Step history of one enrollment, oldest first.
    pub fn execution_history(&self, enrollment_id: Uuid) -> JourneyResult<Vec<ExecutionLogEntry>> {
        self.get_enrollment(enrollment_id)?;
        Ok(self.stores.log.history(enrollment_id))
    }

    pub fn stats(&self, id: Uuid) -> JourneyResult<AutomationStats> {
        let automation = self.get_automation(id)?;
        let enrollments = self.list_enrollments(&EnrollmentFilter {
            automation_id: Some(id),
            ..EnrollmentFilter::default()
        });

        let mut stats = AutomationStats {
            automation_id: id,
            enrollment_count: automation.enrollment_count,
            active: 0,
            parked: 0,
            completed: 0,
            failed: 0,
            exited: 0,
            failed_step_attempts: 0,
            avg_completion_time_secs: 0.0,
        };
        let mut completion_secs = 0i64;

        for enrollment in &enrollments {
            match enrollment.status {
                EnrollmentStatus::Active => {
                    stats.active += 1;
                    if enrollment.wait_until.is_some() {
                        stats.parked += 1;
                    }
                }
                EnrollmentStatus::Completed => {
                    stats.completed += 1;
                    if let Some(done) = enrollment.completed_at {
                        completion_secs += (done - enrollment.started_at).num_seconds();
                    }
                }
                EnrollmentStatus::Failed => stats.failed += 1,
                EnrollmentStatus::Exited => stats.exited += 1,
            }
            stats.failed_step_attempts += self
                .stores
                .log
                .history(enrollment.id)
                .iter()
                .filter(|entry| entry.status == LogStatus::Failed)
                .count() as u64;
        }

        if stats.completed > 0 {
            stats.avg_completion_time_secs = completion_secs as f64 / stats.completed as f64;
        }
        Ok(stats)
    }

    /// Recounts the automation's counters from its enrollments and
    /// overwrites the stored values.
    pub fn reconcile_counters(&self, id: Uuid) -> JourneyResult<Automation> {
        let before = self.get_automation(id)?;
        let enrollments = self.list_enrollments(&EnrollmentFilter {
            automation_id: Some(id),
            ..EnrollmentFilter::default()
        });

        let count = |status: EnrollmentStatus| {
            enrollments.iter().filter(|e| e.status == status).count() as u64
        };
        let recount = CounterSnapshot {
            enrollment_count: enrollments.len() as u64,
            completed_count: count(EnrollmentStatus::Completed),
            failed_count: count(EnrollmentStatus::Failed),
            exited_count: count(EnrollmentStatus::Exited),
        };
        let stored = CounterSnapshot {
            enrollment_count: before.enrollment_count,
            completed_count: before.completed_count,
            failed_count: before.failed_count,
            exited_count: before.exited_count,
        };
        if recount != stored {
            warn!(
                automation_id = %id,
                stored = ?stored,
                recount = ?recount,
                "Counter drift corrected"
            );
        }
        self.stores.automations.overwrite_counters(id, recount)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{InMemoryContacts, OutboxEmailSender, ScriptedWebhookCaller};
    use crate::graph::{Step, StepKind};
    use crate::trigger::TriggerEvent;
    use serde_json::json;

    fn engine() -> JourneyEngine {
        JourneyEngine::in_memory(Collaborators {
            email: Arc::new(OutboxEmailSender::new()),
            webhook: Arc::new(ScriptedWebhookCaller::new()),
            contacts: Arc::new(InMemoryContacts::new()),
        })
    }

    fn email_graph(template: &str) -> StepGraph {
        StepGraph::new(
            crate::graph::StepId(1),
            vec![Step::new(
                1,
                StepKind::SendEmail {
                    template_id: template.into(),
                    next: None,
                    on_failure: Default::default(),
                },
            )],
        )
        .unwrap()
    }

    fn new_automation(name: &str) -> NewAutomation {
        NewAutomation {
            name: name.into(),
            scope_id: "org-1".into(),
            created_by: "u-1".into(),
            enrollment_policy: EnrollmentPolicy::OneShot,
            trigger: TriggerConfig::new(TriggerEvent::ContactCreated),
            graph: email_graph("welcome"),
        }
    }

    #[test]
    fn test_lifecycle_transitions() {
        let engine = engine();
        let created = engine.create_automation(new_automation("Welcome"), Utc::now()).unwrap();
        assert_eq!(created.status, AutomationStatus::Draft);
        assert_eq!(created.version, 1);

        // Resume only applies to paused automations.
        assert!(engine.resume(created.id).is_err());
        assert_eq!(engine.activate(created.id).unwrap().status, AutomationStatus::Active);
        assert_eq!(engine.pause(created.id).unwrap().status, AutomationStatus::Paused);
        assert_eq!(engine.resume(created.id).unwrap().status, AutomationStatus::Active);
    }

    #[test]
    fn test_empty_name_rejected() {
        let engine = engine();
        let err = engine.create_automation(new_automation("  "), Utc::now()).unwrap_err();
        assert!(matches!(err, JourneyError::Validation(_)));
    }

    #[test]
    fn test_update_definition_bumps_version() {
        let engine = engine();
        let created = engine.create_automation(new_automation("Welcome"), Utc::now()).unwrap();
        let updated = engine
            .update_definition(
                created.id,
                DefinitionUpdate {
                    trigger: TriggerConfig::new(TriggerEvent::CheckedIn),
                    graph: email_graph("welcome-v2"),
                },
                Utc::now(),
            )
            .unwrap();
        assert_eq!(updated.version, 2);
        assert_eq!(updated.trigger_type.as_str(), "checked_in");

        let v1 = engine.definition(created.id, Some(1)).unwrap();
        let v2 = engine.definition(created.id, None).unwrap();
        assert_eq!(v1.version, 1);
        assert_eq!(v2.version, 2);
        assert!(engine.definition(created.id, Some(3)).is_err());
    }

    #[test]
    fn test_unknown_automation_is_not_found() {
        let engine = engine();
        let err = engine.stats(Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, JourneyError::NotFound { .. }));
        let err = engine
            .exit_active_enrollments(Uuid::new_v4(), None, Utc::now())
            .unwrap_err();
        assert!(matches!(err, JourneyError::NotFound { .. }));
    }

    #[test]
    fn test_dispatch_skips_draft_automations() {
        let engine = engine();
        let created = engine.create_automation(new_automation("Welcome"), Utc::now()).unwrap();
        let event = DomainEvent::new(
            eventdesk_core::TriggerType::ContactCreated,
            "c-1",
            "org-1",
            json!({}),
        );
        let report = engine.dispatch(&event, Utc::now()).unwrap();
        assert!(report.enrolled.is_empty());
        assert_eq!(engine.get_automation(created.id).unwrap().enrollment_count, 0);
    }
}
