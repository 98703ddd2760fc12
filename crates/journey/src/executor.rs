//! Step executor: drives one claimed enrollment forward.
//!
//! Pure steps (condition, elapsed waits) and effect steps chain inside a
//! single run until the enrollment parks on a wait, terminates, or hits the
//! per-tick step guard. Every effect is bracketed by execution log writes
//! (pending → executing → completed/failed) so an interrupted run can be
//! resumed without repeating effects that are known to have happened.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::time::Instant;
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use eventdesk_core::event_bus::{make_event, noop_sink, EventSink};
use eventdesk_core::types::EngineEventType;

use crate::collaborators::{
    Collaborators, Confirmation, EffectError, EmailRequest, WebhookRequest, WebhookResponse,
};
use crate::error::{JourneyError, JourneyResult};
use crate::graph::{FailurePolicy, Step, StepId, StepKind, WaitSpec};
use crate::predicate::lookup;
use crate::render::{render_str, render_value};
use crate::retry::RetryPolicy;
use crate::store::Stores;
use crate::types::{
    Automation, AutomationDefinition, Counter, Enrollment, ExecutionLogEntry, LogStatus,
};

/// How a run of the executor ended for one enrollment.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// Parked on a wait step until the given instant.
    Parked { until: DateTime<Utc> },
    /// Step guard reached; the next tick continues.
    Yielded,
    /// A precondition (contact lookup) failed; retried next tick.
    Deferred { reason: String },
    Completed,
    Failed { reason: String },
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub enrollment_id: Uuid,
    pub outcome: RunOutcome,
    pub steps_run: u32,
}

/// Decision taken after one step.
#[derive(Debug, Clone, PartialEq)]
enum Flow {
    Advance(Option<StepId>),
    Park { until: DateTime<Utc>, next: StepId },
    Fail(String),
    Retry(String),
}

/// What recovery decided about the step the enrollment is parked at.
enum Recovery {
    /// The interrupted attempt's outcome is known; apply it without executing.
    Resolved(Flow),
    /// Execute again, linking the new log entry to the interrupted one.
    Reexecute(Uuid),
}

struct RunContext {
    enrollment: Enrollment,
    token: Uuid,
    now: DateTime<Utc>,
    started: Instant,
    steps_run: u32,
}

impl RunContext {
    /// `now` advanced by the wall time this run has spent so far.
    fn clock(&self) -> DateTime<Utc> {
        Duration::from_std(self.started.elapsed())
            .ok()
            .and_then(|spent| self.now.checked_add_signed(spent))
            .unwrap_or(self.now)
    }
}

#[derive(Clone)]
pub struct StepExecutor {
    stores: Stores,
    collaborators: Collaborators,
    retry: RetryPolicy,
    max_steps_per_tick: u32,
    claim_ttl: Duration,
    event_sink: Arc<dyn EventSink>,
}

impl std::fmt::Debug for StepExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepExecutor")
            .field("retry", &self.retry)
            .field("max_steps_per_tick", &self.max_steps_per_tick)
            .field("claim_ttl", &self.claim_ttl)
            .finish()
    }
}

impl StepExecutor {
    pub fn new(stores: Stores, collaborators: Collaborators) -> Self {
        Self {
            stores,
            collaborators,
            retry: RetryPolicy::default(),
            max_steps_per_tick: 25,
            claim_ttl: Duration::seconds(120),
            event_sink: noop_sink(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_max_steps_per_tick(mut self, max_steps: u32) -> Self {
        self.max_steps_per_tick = max_steps.max(1);
        self
    }

    /// Lifetime granted to the claim each time it is renewed ahead of an
    /// effect step.
    pub fn with_claim_ttl(mut self, ttl: Duration) -> Self {
        self.claim_ttl = ttl;
        self
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    /// Runs a claimed enrollment. `token` must be the claim the caller holds.
    /// Step-level failures are contained in the returned outcome; an `Err`
    /// means the enrollment could not be read or written (e.g. lost claim).
    pub async fn run(
        &self,
        enrollment: Enrollment,
        token: Uuid,
        now: DateTime<Utc>,
    ) -> JourneyResult<RunReport> {
        let mut ctx = RunContext {
            enrollment,
            token,
            now,
            started: Instant::now(),
            steps_run: 0,
        };
        ctx.enrollment.wait_until = None;

        let automation_id = ctx.enrollment.automation_id;
        let version = ctx.enrollment.definition_version;
        let Some(automation) = self.stores.automations.get_automation(automation_id) else {
            return self.fail(&mut ctx, format!("automation {automation_id} no longer exists"));
        };
        let Some(definition) = self.stores.automations.definition(automation_id, version) else {
            return self.fail(&mut ctx, format!("definition version {version} is missing"));
        };

        let mut recovery = self.recover(&mut ctx, &definition).await?;

        loop {
            if ctx.steps_run >= self.max_steps_per_tick {
                debug!(
                    enrollment_id = %ctx.enrollment.id,
                    steps = ctx.steps_run,
                    "Step guard reached, yielding until next tick"
                );
                self.persist(&mut ctx, true)?;
                return Ok(self.report(&ctx, RunOutcome::Yielded));
            }

            let step_id = ctx.enrollment.current_step;
            let Some(step) = definition.graph.step(step_id) else {
                return self.fail(&mut ctx, format!("step {step_id} is not in the definition"));
            };

            // A lapsed claim may already belong to another worker; never
            // start an effect without first extending our own.
            let resolved = matches!(recovery, Some(Recovery::Resolved(_)));
            if !resolved && step.action.step_type().has_side_effect() {
                self.hold_claim(&mut ctx)?;
            }

            let flow = match recovery.take() {
                Some(Recovery::Resolved(flow)) => flow,
                Some(Recovery::Reexecute(from)) => {
                    self.execute_step(&ctx, &automation, step, Some(from)).await?
                }
                None => self.execute_step(&ctx, &automation, step, None).await?,
            };
            ctx.steps_run += 1;

            match flow {
                Flow::Advance(Some(next)) => {
                    ctx.enrollment.advance(next, ctx.now);
                    self.persist(&mut ctx, false)?;
                }
                Flow::Advance(None) => return self.complete(&mut ctx),
                Flow::Park { until, next } => {
                    ctx.enrollment.wait_until = Some(until);
                    ctx.enrollment.advance(next, ctx.now);
                    self.persist(&mut ctx, true)?;
                    self.emit(EngineEventType::EnrollmentParked, &ctx.enrollment, Some(step_id), None);
                    return Ok(self.report(&ctx, RunOutcome::Parked { until }));
                }
                Flow::Fail(reason) => return self.fail(&mut ctx, reason),
                Flow::Retry(reason) => {
                    warn!(
                        enrollment_id = %ctx.enrollment.id,
                        step_id = %step_id,
                        reason = %reason,
                        "Step deferred to next tick"
                    );
                    self.persist(&mut ctx, true)?;
                    return Ok(self.report(&ctx, RunOutcome::Deferred { reason }));
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Recovery
    // ------------------------------------------------------------------

    /// Inspects the latest log entry. If it belongs to the step the
    /// enrollment is still parked at, a previous run was interrupted between
    /// logging the attempt and persisting the enrollment.
    async fn recover(
        &self,
        ctx: &mut RunContext,
        definition: &AutomationDefinition,
    ) -> JourneyResult<Option<Recovery>> {
        let Some(mut entry) = self.stores.log.latest(ctx.enrollment.id) else {
            return Ok(None);
        };
        if entry.sequence != ctx.enrollment.steps_executed
            || entry.step_id != ctx.enrollment.current_step
            || !entry.step_type.has_side_effect()
        {
            return Ok(None);
        }
        let Some(step) = definition.graph.step(entry.step_id) else {
            return Ok(None);
        };

        match entry.status {
            LogStatus::Completed => Ok(Some(Recovery::Resolved(Flow::Advance(step.action.next())))),
            LogStatus::Failed => {
                let reason = entry.error.clone().unwrap_or_else(|| "step failed".to_string());
                Ok(Some(Recovery::Resolved(failure_flow(step, reason))))
            }
            LogStatus::Skipped => Ok(None),
            LogStatus::Pending => {
                // The effect was never started.
                entry.error = Some("attempt interrupted before the effect started".into());
                entry.mark(LogStatus::Skipped, ctx.now)?;
                self.stores.log.update(&entry)?;
                Ok(Some(Recovery::Reexecute(entry.id)))
            }
            LogStatus::Executing => {
                let unknown = JourneyError::UnknownOutcome {
                    enrollment: ctx.enrollment.id,
                    step: entry.step_id,
                };
                warn!(
                    enrollment_id = %ctx.enrollment.id,
                    log_entry = %entry.id,
                    error = %unknown,
                    "Resolving interrupted step"
                );
                metrics::counter!("journey.unknown_outcomes").increment(1);

                let confirmation = self.confirm(&step.action, &entry.idempotency_key()).await;
                let resolved = match confirmation {
                    Confirmation::Applied(record) => {
                        entry.output = Some(json!({"recovered": true, "confirmation": record}));
                        entry.mark(LogStatus::Completed, ctx.now)?;
                        self.stores.log.update(&entry)?;
                        Recovery::Resolved(Flow::Advance(step.action.next()))
                    }
                    Confirmation::NotApplied | Confirmation::Unsupported => {
                        let how = if confirmation == Confirmation::NotApplied {
                            "collaborator reports effect not applied"
                        } else {
                            "outcome unknown, re-executing"
                        };
                        entry.error = Some(format!("worker interrupted: {how}"));
                        entry.mark(LogStatus::Failed, ctx.now)?;
                        self.stores.log.update(&entry)?;
                        Recovery::Reexecute(entry.id)
                    }
                };

                let mut event = make_event(
                    EngineEventType::RecoveryPerformed,
                    ctx.enrollment.automation_id,
                    Some(ctx.enrollment.id),
                    Some(ctx.enrollment.contact_id.clone()),
                );
                event.step_id = Some(entry.step_id.0);
                event.detail = Some(match &resolved {
                    Recovery::Resolved(_) => "confirmed applied".to_string(),
                    Recovery::Reexecute(_) => "re-executing".to_string(),
                });
                self.event_sink.emit(event);
                Ok(Some(resolved))
            }
        }
    }

    async fn confirm(&self, action: &StepKind, key: &str) -> Confirmation {
        match action {
            StepKind::SendEmail { .. } => self.collaborators.email.confirm(key).await,
            StepKind::Webhook { .. } => self.collaborators.webhook.confirm(key).await,
            _ => Confirmation::Unsupported,
        }
    }

    // ------------------------------------------------------------------
    // Step dispatch
    // ------------------------------------------------------------------

    async fn execute_step(
        &self,
        ctx: &RunContext,
        automation: &Automation,
        step: &Step,
        recovered_from: Option<Uuid>,
    ) -> JourneyResult<Flow> {
        metrics::counter!(
            "journey.steps_executed",
            "step_type" => step.action.step_type().as_str()
        )
        .increment(1);

        match &step.action {
            StepKind::Wait { wait, next } => self.execute_wait(ctx, automation, step, wait, *next).await,
            StepKind::Condition {
                predicate,
                on_true,
                on_false,
            } => {
                let context = match self.render_context(ctx, automation).await {
                    Ok(context) => context,
                    Err(err) => return Ok(Flow::Retry(format!("contact lookup failed: {err}"))),
                };
                let mut entry = self.entry(ctx, step, json!({"predicate": predicate}));
                let flow = match predicate.evaluate(&context) {
                    Ok(result) => {
                        entry.output = Some(json!({"result": result}));
                        entry.mark(LogStatus::Completed, ctx.now)?;
                        Flow::Advance(if result { *on_true } else { *on_false })
                    }
                    Err(err) => {
                        warn!(
                            enrollment_id = %ctx.enrollment.id,
                            step_id = %step.id,
                            error = %err,
                            "Condition evaluation failed, taking false branch"
                        );
                        entry.error = Some(err.to_string());
                        entry.mark(LogStatus::Failed, ctx.now)?;
                        Flow::Advance(*on_false)
                    }
                };
                self.stores.log.append(&entry)?;
                Ok(flow)
            }
            _ => self.execute_effect(ctx, automation, step, recovered_from).await,
        }
    }

    async fn execute_wait(
        &self,
        ctx: &RunContext,
        automation: &Automation,
        step: &Step,
        wait: &WaitSpec,
        next: Option<StepId>,
    ) -> JourneyResult<Flow> {
        let Some(next) = next else {
            return Ok(Flow::Fail(format!("wait step {} has no next step", step.id)));
        };

        let mut entry = self.entry(ctx, step, json!({"wait": wait}));
        let until = match wait {
            WaitSpec::Duration { secs } => i64::try_from(*secs)
                .map_err(|_| format!("wait of {secs}s is out of range"))
                .and_then(|secs| shift_by_secs(ctx.now, secs)),
            WaitSpec::Until { at } => Ok(*at),
            WaitSpec::FieldDate { field, offset_secs } => {
                let context = match self.render_context(ctx, automation).await {
                    Ok(context) => context,
                    Err(err) => return Ok(Flow::Retry(format!("contact lookup failed: {err}"))),
                };
                resolve_field_date(&context, field).and_then(|at| shift_by_secs(at, *offset_secs))
            }
        };

        match until {
            Ok(until) => {
                let elapsed = until <= ctx.now;
                entry.output = Some(json!({"wait_until": until, "already_elapsed": elapsed}));
                entry.mark(LogStatus::Completed, ctx.now)?;
                self.stores.log.append(&entry)?;
                if elapsed {
                    Ok(Flow::Advance(Some(next)))
                } else {
                    Ok(Flow::Park { until, next })
                }
            }
            Err(reason) => {
                entry.error = Some(reason.clone());
                entry.mark(LogStatus::Failed, ctx.now)?;
                self.stores.log.append(&entry)?;
                Ok(Flow::Fail(reason))
            }
        }
    }

    async fn execute_effect(
        &self,
        ctx: &RunContext,
        automation: &Automation,
        step: &Step,
        recovered_from: Option<Uuid>,
    ) -> JourneyResult<Flow> {
        let context = match self.render_context(ctx, automation).await {
            Ok(context) => context,
            Err(err) => return Ok(Flow::Retry(format!("contact lookup failed: {err}"))),
        };
        let contact_id = ctx.enrollment.contact_id.as_str();
        let mut entry = self.entry(ctx, step, Value::Null);
        let effect = Effect::build(&step.action, contact_id, &context, &entry.idempotency_key())?;
        entry.input = effect.input();
        entry.recovered_from = recovered_from;
        self.stores.log.append(&entry)?;
        entry.mark(LogStatus::Executing, ctx.now)?;
        self.stores.log.update(&entry)?;

        let (result, attempts) = self.perform(&effect, contact_id).await;
        entry.attempts = attempts;

        match result {
            Ok(output) => {
                entry.output = Some(output);
                entry.mark(LogStatus::Completed, ctx.now)?;
                self.stores.log.update(&entry)?;
                self.emit(EngineEventType::StepCompleted, &ctx.enrollment, Some(step.id), None);
                Ok(Flow::Advance(step.action.next()))
            }
            Err(err) => {
                warn!(
                    enrollment_id = %ctx.enrollment.id,
                    step_id = %step.id,
                    step_type = %step.action.step_type(),
                    attempts,
                    error = %err,
                    "Step effect failed"
                );
                metrics::counter!(
                    "journey.step_failures",
                    "step_type" => step.action.step_type().as_str()
                )
                .increment(1);
                entry.output = err.detail.clone();
                entry.error = Some(err.to_string());
                entry.mark(LogStatus::Failed, ctx.now)?;
                self.stores.log.update(&entry)?;
                self.emit(
                    EngineEventType::StepFailed,
                    &ctx.enrollment,
                    Some(step.id),
                    Some(err.to_string()),
                );
                Ok(failure_flow(step, err.to_string()))
            }
        }
    }

    async fn perform(&self, effect: &Effect, contact_id: &str) -> (Result<Value, EffectError>, u32) {
        let collaborators = &self.collaborators;
        match effect {
            Effect::Email(request) => {
                let (result, attempts) = self
                    .retry
                    .run("send_email", move || async move {
                        collaborators.email.send(request.clone()).await
                    })
                    .await;
                (
                    result.map(|receipt| json!({"provider_message_id": receipt.provider_message_id})),
                    attempts,
                )
            }
            Effect::Webhook(request) => {
                self.retry
                    .run("webhook", move || async move {
                        let response = collaborators.webhook.call(request.clone()).await?;
                        classify_webhook_response(response)
                    })
                    .await
            }
            Effect::AddTag(tag) => {
                let (result, attempts) = self
                    .retry
                    .run("add_tag", move || async move {
                        collaborators.contacts.add_tag(contact_id, tag).await
                    })
                    .await;
                (result.map(|_| json!({"tag": tag})), attempts)
            }
            Effect::RemoveTag(tag) => {
                let (result, attempts) = self
                    .retry
                    .run("remove_tag", move || async move {
                        collaborators.contacts.remove_tag(contact_id, tag).await
                    })
                    .await;
                (result.map(|_| json!({"tag": tag})), attempts)
            }
            Effect::UpdateField { key, value } => {
                let (result, attempts) = self
                    .retry
                    .run("update_field", move || async move {
                        collaborators
                            .contacts
                            .update_field(contact_id, key, value.clone())
                            .await
                    })
                    .await;
                (result.map(|_| json!({"key": key, "value": value})), attempts)
            }
        }
    }

    /// Contact snapshot merged with trigger, automation and enrollment data.
    /// Used both for condition evaluation and template rendering.
    async fn render_context(
        &self,
        ctx: &RunContext,
        automation: &Automation,
    ) -> Result<Value, EffectError> {
        let contacts = &self.collaborators.contacts;
        let contact_id = ctx.enrollment.contact_id.as_str();
        let (snapshot, _) = self
            .retry
            .run("contact_snapshot", move || async move {
                contacts.snapshot(contact_id).await
            })
            .await;
        let snapshot = snapshot?;
        Ok(json!({
            "contact": snapshot.to_value(),
            "tags": snapshot.tags,
            "trigger": ctx.enrollment.trigger_payload,
            "automation": {
                "id": automation.id,
                "name": automation.name,
                "scope_id": automation.scope_id,
            },
            "enrollment": {
                "id": ctx.enrollment.id,
                "started_at": ctx.enrollment.started_at,
            },
        }))
    }

    // ------------------------------------------------------------------
    // Enrollment transitions
    // ------------------------------------------------------------------

    fn persist(&self, ctx: &mut RunContext, release: bool) -> JourneyResult<()> {
        ctx.enrollment = self
            .stores
            .enrollments
            .save_claimed(&ctx.enrollment, ctx.token, release)?;
        Ok(())
    }

    fn hold_claim(&self, ctx: &mut RunContext) -> JourneyResult<()> {
        let now = ctx.clock();
        let renewed = self
            .stores
            .enrollments
            .renew_claim(ctx.enrollment.id, ctx.token, now + self.claim_ttl, now)
            .map_err(|err| {
                warn!(
                    enrollment_id = %ctx.enrollment.id,
                    error = %err,
                    "Claim lapsed before effect step, abandoning run"
                );
                err
            })?;
        ctx.enrollment.claim = renewed.claim;
        ctx.enrollment.revision = renewed.revision;
        Ok(())
    }

    fn complete(&self, ctx: &mut RunContext) -> JourneyResult<RunReport> {
        ctx.enrollment.complete(ctx.now)?;
        self.persist(ctx, true)?;
        self.stores
            .automations
            .increment(ctx.enrollment.automation_id, Counter::Completed)?;
        info!(
            enrollment_id = %ctx.enrollment.id,
            automation_id = %ctx.enrollment.automation_id,
            contact_id = %ctx.enrollment.contact_id,
            "Enrollment completed"
        );
        metrics::counter!("journey.enrollments_completed").increment(1);
        self.emit(EngineEventType::EnrollmentCompleted, &ctx.enrollment, None, None);
        Ok(self.report(ctx, RunOutcome::Completed))
    }

    fn fail(&self, ctx: &mut RunContext, reason: String) -> JourneyResult<RunReport> {
        ctx.enrollment.fail(reason.clone(), ctx.now)?;
        self.persist(ctx, true)?;
        self.stores
            .automations
            .increment(ctx.enrollment.automation_id, Counter::Failed)?;
        warn!(
            enrollment_id = %ctx.enrollment.id,
            automation_id = %ctx.enrollment.automation_id,
            reason = %reason,
            "Enrollment failed"
        );
        metrics::counter!("journey.enrollments_failed").increment(1);
        self.emit(
            EngineEventType::EnrollmentFailed,
            &ctx.enrollment,
            Some(ctx.enrollment.current_step),
            Some(reason.clone()),
        );
        Ok(self.report(ctx, RunOutcome::Failed { reason }))
    }

    fn entry(&self, ctx: &RunContext, step: &Step, input: Value) -> ExecutionLogEntry {
        ExecutionLogEntry::pending(&ctx.enrollment, step.id, step.action.step_type(), input, ctx.now)
    }

    fn report(&self, ctx: &RunContext, outcome: RunOutcome) -> RunReport {
        RunReport {
            enrollment_id: ctx.enrollment.id,
            outcome,
            steps_run: ctx.steps_run,
        }
    }

    fn emit(
        &self,
        event_type: EngineEventType,
        enrollment: &Enrollment,
        step_id: Option<StepId>,
        detail: Option<String>,
    ) {
        let mut event = make_event(
            event_type,
            enrollment.automation_id,
            Some(enrollment.id),
            Some(enrollment.contact_id.clone()),
        );
        event.step_id = step_id.map(|s| s.0);
        event.detail = detail;
        self.event_sink.emit(event);
    }
}

/// A rendered, ready-to-send side effect.
enum Effect {
    Email(EmailRequest),
    Webhook(WebhookRequest),
    AddTag(String),
    RemoveTag(String),
    UpdateField { key: String, value: Value },
}

impl Effect {
    fn build(action: &StepKind, contact_id: &str, context: &Value, key: &str) -> JourneyResult<Self> {
        let effect = match action {
            StepKind::SendEmail { template_id, .. } => Effect::Email(EmailRequest {
                contact_id: contact_id.to_string(),
                template_id: template_id.clone(),
                context: context.clone(),
                idempotency_key: key.to_string(),
            }),
            StepKind::Webhook {
                url,
                payload,
                headers,
                ..
            } => Effect::Webhook(WebhookRequest {
                url: render_str(url, context),
                payload: render_value(payload, context),
                headers: headers
                    .iter()
                    .map(|(k, v)| (k.clone(), render_str(v, context)))
                    .collect(),
                idempotency_key: key.to_string(),
            }),
            StepKind::AddTag { tag, .. } => Effect::AddTag(render_str(tag, context)),
            StepKind::RemoveTag { tag, .. } => Effect::RemoveTag(render_str(tag, context)),
            StepKind::UpdateField { key, value, .. } => Effect::UpdateField {
                key: key.clone(),
                value: render_value(value, context),
            },
            StepKind::Wait { .. } | StepKind::Condition { .. } => {
                return Err(JourneyError::validation(format!(
                    "{} step has no side effect",
                    action.step_type()
                )))
            }
        };
        Ok(effect)
    }

    /// Input snapshot recorded in the execution log.
    fn input(&self) -> Value {
        match self {
            Effect::Email(request) => json!({"template_id": request.template_id}),
            Effect::Webhook(request) => json!({
                "url": request.url,
                "payload": request.payload,
                "headers": request.headers,
            }),
            Effect::AddTag(tag) | Effect::RemoveTag(tag) => json!({"tag": tag}),
            Effect::UpdateField { key, value } => json!({"key": key, "value": value}),
        }
    }
}

fn failure_flow(step: &Step, reason: String) -> Flow {
    match step.action.failure_policy() {
        FailurePolicy::Continue => Flow::Advance(step.action.next()),
        FailurePolicy::Fail => Flow::Fail(format!(
            "{} step {} failed: {reason}",
            step.action.step_type(),
            step.id
        )),
    }
}

/// 2xx succeeds; 5xx and 429 are transient; anything else is permanent.
fn classify_webhook_response(response: WebhookResponse) -> Result<Value, EffectError> {
    let detail = json!({"status_code": response.status_code, "body": response.body});
    if response.is_success() {
        return Ok(detail);
    }
    let message = format!("webhook responded with status {}", response.status_code);
    if response.status_code >= 500 || response.status_code == 429 {
        Err(EffectError::transient(message).with_detail(detail))
    } else {
        Err(EffectError::permanent(message).with_detail(detail))
    }
}

/// `at` moved by `secs`, or an error when the result leaves the
/// representable range.
fn shift_by_secs(at: DateTime<Utc>, secs: i64) -> Result<DateTime<Utc>, String> {
    Duration::try_seconds(secs)
        .and_then(|delta| at.checked_add_signed(delta))
        .ok_or_else(|| format!("wait of {secs}s from {} is out of range", at.to_rfc3339()))
}

fn resolve_field_date(context: &Value, field: &str) -> Result<DateTime<Utc>, String> {
    let raw = lookup(context, field)
        .and_then(Value::as_str)
        .ok_or_else(|| format!("wait date field '{field}' is missing"))?;
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| format!("wait date field '{field}' is not RFC 3339: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_webhook_classification() {
        let ok = classify_webhook_response(WebhookResponse {
            status_code: 204,
            body: String::new(),
        });
        assert!(ok.is_ok());

        let busy = classify_webhook_response(WebhookResponse {
            status_code: 503,
            body: "down".into(),
        })
        .unwrap_err();
        assert!(busy.is_transient());
        assert_eq!(busy.detail.unwrap()["status_code"], 503);

        let rejected = classify_webhook_response(WebhookResponse {
            status_code: 422,
            body: "bad".into(),
        })
        .unwrap_err();
        assert!(!rejected.is_transient());
    }

    #[test]
    fn test_field_date_resolution() {
        let context = json!({"contact": {"fields": {"edition_start": "2026-11-02T09:00:00+01:00"}}});
        let at = resolve_field_date(&context, "contact.fields.edition_start").unwrap();
        assert_eq!(at.to_rfc3339(), "2026-11-02T08:00:00+00:00");
        assert!(resolve_field_date(&context, "contact.fields.missing").is_err());
        assert!(resolve_field_date(&json!({"d": "tomorrow"}), "d").is_err());
    }

    #[test]
    fn test_wait_shift_rejects_overflow() {
        let now = Utc::now();
        assert_eq!(shift_by_secs(now, 3600).unwrap(), now + Duration::hours(1));
        assert_eq!(shift_by_secs(now, -60).unwrap(), now - Duration::minutes(1));
        assert!(shift_by_secs(now, 10_000_000_000_000).is_err());
        assert!(shift_by_secs(now, i64::MAX).is_err());
        assert!(shift_by_secs(DateTime::<Utc>::MAX_UTC, 1).is_err());
    }
}
