use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use eventdesk_core::{DomainEvent, TriggerType};

use crate::error::{JourneyError, JourneyResult};
use crate::graph::{StepGraph, StepId, StepType};
use crate::state_machine::StateMachine;
use crate::trigger::TriggerConfig;

/// An automation row: identity, lifecycle and running counters. The step
/// graph and trigger live in the versioned [`AutomationDefinition`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Automation {
    pub id: Uuid,
    pub name: String,
    /// Owning event or edition.
    pub scope_id: String,
    pub created_by: String,
    pub status: AutomationStatus,
    pub trigger_type: TriggerType,
    pub enrollment_policy: EnrollmentPolicy,
    /// Currently published definition version.
    pub version: u32,
    pub enrollment_count: u64,
    pub completed_count: u64,
    pub failed_count: u64,
    pub exited_count: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Lifecycle status of an automation definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutomationStatus {
    Draft,
    Active,
    Paused,
}

/// Whether a contact may go through the same automation more than once.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentPolicy {
    /// At most one enrollment per (automation, contact) over its lifetime.
    #[default]
    OneShot,
    /// A new enrollment is allowed once the previous one is terminal.
    ReEnterable,
}

/// Immutable, published version of an automation's trigger and steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationDefinition {
    pub automation_id: Uuid,
    pub version: u32,
    pub trigger: TriggerConfig,
    pub graph: StepGraph,
    pub published_at: DateTime<Utc>,
}

/// Counter slots on the automation row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    Enrolled,
    Completed,
    Failed,
    Exited,
}

/// Recomputed values for every counter of an automation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSnapshot {
    pub enrollment_count: u64,
    pub completed_count: u64,
    pub failed_count: u64,
    pub exited_count: u64,
}

/// Runtime status of an enrollment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentStatus {
    Active,
    Completed,
    Exited,
    Failed,
}

impl EnrollmentStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, EnrollmentStatus::Active)
    }
}

impl fmt::Display for EnrollmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            EnrollmentStatus::Active => "active",
            EnrollmentStatus::Completed => "completed",
            EnrollmentStatus::Exited => "exited",
            EnrollmentStatus::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Time-bounded exclusive lock held by one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    pub token: Uuid,
    pub worker_id: String,
    pub expires_at: DateTime<Utc>,
}

impl Claim {
    pub fn new(worker_id: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            token: Uuid::new_v4(),
            worker_id: worker_id.into(),
            expires_at,
        }
    }

    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// One contact's progress through one automation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Enrollment {
    pub id: Uuid,
    pub automation_id: Uuid,
    /// Definition version pinned at enrollment time.
    pub definition_version: u32,
    pub contact_id: String,
    pub scope_id: String,
    pub current_step: StepId,
    pub status: EnrollmentStatus,
    /// Payload of the domain event that created the enrollment.
    pub trigger_payload: Value,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub exited_at: Option<DateTime<Utc>>,
    pub exit_reason: Option<String>,
    pub wait_until: Option<DateTime<Utc>>,
    pub claim: Option<Claim>,
    /// Number of steps this enrollment has moved past. Also the sequence
    /// number stamped on the execution log entry of the next attempt.
    pub steps_executed: u32,
    /// Bumped by the store on every write; used for conditional updates.
    pub revision: u64,
    pub updated_at: DateTime<Utc>,
}

impl Enrollment {
    pub fn new(definition: &AutomationDefinition, event: &DomainEvent, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            automation_id: definition.automation_id,
            definition_version: definition.version,
            contact_id: event.contact_id.clone(),
            scope_id: event.scope_id.clone(),
            current_step: definition.graph.start(),
            status: EnrollmentStatus::Active,
            trigger_payload: event.payload.clone(),
            started_at: now,
            completed_at: None,
            exited_at: None,
            exit_reason: None,
            wait_until: None,
            claim: None,
            steps_executed: 0,
            revision: 0,
            updated_at: now,
        }
    }

    /// Active, not parked on a future wake time, and not claimed.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.status == EnrollmentStatus::Active
            && self.wait_until.map_or(true, |t| t <= now)
            && !self.is_claimed(now)
    }

    pub fn is_claimed(&self, now: DateTime<Utc>) -> bool {
        self.claim.as_ref().is_some_and(|c| c.is_live(now))
    }

    pub fn advance(&mut self, next: StepId, now: DateTime<Utc>) {
        self.current_step = next;
        self.steps_executed += 1;
        self.updated_at = now;
    }

    pub fn complete(&mut self, now: DateTime<Utc>) -> JourneyResult<()> {
        self.transition(EnrollmentStatus::Completed, now)?;
        self.steps_executed += 1;
        self.completed_at = Some(now);
        self.wait_until = None;
        Ok(())
    }

    pub fn fail(&mut self, reason: impl Into<String>, now: DateTime<Utc>) -> JourneyResult<()> {
        self.transition(EnrollmentStatus::Failed, now)?;
        self.exited_at = Some(now);
        self.exit_reason = Some(reason.into());
        self.wait_until = None;
        Ok(())
    }

    pub fn exit(&mut self, reason: impl Into<String>, now: DateTime<Utc>) -> JourneyResult<()> {
        self.transition(EnrollmentStatus::Exited, now)?;
        self.exited_at = Some(now);
        self.exit_reason = Some(reason.into());
        self.wait_until = None;
        Ok(())
    }

    fn transition(&mut self, to: EnrollmentStatus, now: DateTime<Utc>) -> JourneyResult<()> {
        let mut machine = StateMachine::enrollment(self.status);
        machine.transition(to)?;
        self.status = machine.state;
        self.updated_at = now;
        Ok(())
    }
}

/// Status of one step attempt in the execution log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStatus {
    Pending,
    Executing,
    Completed,
    Failed,
    Skipped,
}

impl LogStatus {
    pub fn is_final(&self) -> bool {
        matches!(self, LogStatus::Completed | LogStatus::Failed | LogStatus::Skipped)
    }

    /// Entries only move forward: pending → executing → final, or
    /// pending → skipped/failed when the attempt is abandoned.
    pub fn can_advance_to(&self, to: LogStatus) -> bool {
        match self {
            LogStatus::Pending => to != LogStatus::Pending,
            LogStatus::Executing => to.is_final() && to != LogStatus::Skipped,
            _ => false,
        }
    }
}

/// Append-only record of one step attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionLogEntry {
    /// Also the idempotency key handed to collaborators.
    pub id: Uuid,
    pub enrollment_id: Uuid,
    pub automation_id: Uuid,
    pub step_id: StepId,
    pub step_type: StepType,
    /// Value of `Enrollment::steps_executed` when the attempt started.
    pub sequence: u32,
    pub status: LogStatus,
    pub input: Value,
    pub output: Option<Value>,
    pub error: Option<String>,
    /// Local retries performed inside this attempt.
    pub attempts: u32,
    /// Set when this attempt re-executes an interrupted one.
    pub recovered_from: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ExecutionLogEntry {
    pub fn pending(
        enrollment: &Enrollment,
        step_id: StepId,
        step_type: StepType,
        input: Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            enrollment_id: enrollment.id,
            automation_id: enrollment.automation_id,
            step_id,
            step_type,
            sequence: enrollment.steps_executed,
            status: LogStatus::Pending,
            input,
            output: None,
            error: None,
            attempts: 0,
            recovered_from: None,
            created_at: now,
            finished_at: None,
        }
    }

    pub fn idempotency_key(&self) -> String {
        self.id.to_string()
    }

    pub fn mark(&mut self, status: LogStatus, now: DateTime<Utc>) -> JourneyResult<()> {
        if !self.status.can_advance_to(status) {
            return Err(JourneyError::InvalidTransition {
                from: format!("{:?}", self.status),
                to: format!("{:?}", status),
            });
        }
        self.status = status;
        if status.is_final() {
            self.finished_at = Some(now);
        }
        Ok(())
    }
}

/// Filter for the enrollment query API. Unset fields match everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnrollmentFilter {
    pub automation_id: Option<Uuid>,
    pub contact_id: Option<String>,
    pub status: Option<EnrollmentStatus>,
}

impl EnrollmentFilter {
    pub fn matches(&self, enrollment: &Enrollment) -> bool {
        self.automation_id.map_or(true, |id| enrollment.automation_id == id)
            && self
                .contact_id
                .as_deref()
                .map_or(true, |c| enrollment.contact_id == c)
            && self.status.map_or(true, |s| enrollment.status == s)
    }
}

/// Aggregate view of an automation for admin reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationStats {
    pub automation_id: Uuid,
    pub enrollment_count: u64,
    pub active: u64,
    pub parked: u64,
    pub completed: u64,
    pub failed: u64,
    pub exited: u64,
    /// Execution log entries finalized as failed, across all enrollments.
    pub failed_step_attempts: u64,
    pub avg_completion_time_secs: f64,
}
