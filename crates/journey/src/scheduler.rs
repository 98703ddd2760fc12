//! Polling scheduler: selects due enrollments, claims them with a
//! conditional write and runs them on a bounded worker pool.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use eventdesk_core::config::AutomationConfig;

use crate::error::JourneyError;
use crate::executor::{RunOutcome, StepExecutor};
use crate::store::Stores;
use crate::types::Claim;

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub worker_id: String,
    pub tick_interval: std::time::Duration,
    pub claim_ttl: Duration,
    pub batch_size: usize,
    pub worker_pool_size: usize,
}

impl SchedulerSettings {
    pub fn from_config(worker_id: impl Into<String>, config: &AutomationConfig) -> Self {
        Self {
            worker_id: worker_id.into(),
            tick_interval: std::time::Duration::from_secs(config.tick_interval_secs.max(1)),
            claim_ttl: Duration::try_seconds(config.claim_ttl_secs.max(1) as i64)
                .unwrap_or_else(|| Duration::seconds(120)),
            batch_size: config.batch_size.max(1),
            worker_pool_size: config.worker_pool_size.max(1),
        }
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self::from_config("scheduler-0", &AutomationConfig::default())
    }
}

/// Outcome counts for one tick.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickReport {
    pub selected: usize,
    pub claimed: usize,
    /// Rows another worker claimed or modified first.
    pub conflicts: usize,
    /// Runs that parked, yielded or deferred.
    pub advanced: usize,
    pub completed: usize,
    pub failed: usize,
    pub errors: usize,
}

#[derive(Clone)]
pub struct Scheduler {
    stores: Stores,
    executor: Arc<StepExecutor>,
    settings: SchedulerSettings,
}

impl Scheduler {
    pub fn new(stores: Stores, executor: Arc<StepExecutor>, settings: SchedulerSettings) -> Self {
        Self {
            stores,
            executor,
            settings,
        }
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    /// Runs one scheduling pass at `now`. Never fails as a whole: per-row
    /// problems are counted in the report and logged.
    pub async fn tick(&self, now: DateTime<Utc>) -> TickReport {
        let started = Instant::now();
        let ready = self
            .stores
            .enrollments
            .find_ready(now, self.settings.batch_size);
        let mut report = TickReport {
            selected: ready.len(),
            ..TickReport::default()
        };

        let semaphore = Arc::new(Semaphore::new(self.settings.worker_pool_size));
        let mut workers = JoinSet::new();

        for enrollment in ready {
            // Claim only once a worker slot is free so a claim never ages
            // while queued.
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };

            // Rows may have queued for a permit; stamp the claim and the run
            // with the time actually reached.
            let at = Duration::from_std(started.elapsed())
                .ok()
                .and_then(|spent| now.checked_add_signed(spent))
                .unwrap_or(now);
            let claim = Claim::new(self.settings.worker_id.clone(), at + self.settings.claim_ttl);
            let token = claim.token;
            let claimed = match self.stores.enrollments.try_claim(
                enrollment.id,
                enrollment.revision,
                claim,
                at,
            ) {
                Ok(claimed) => claimed,
                Err(JourneyError::ClaimConflict(id)) => {
                    debug!(enrollment_id = %id, "Enrollment claimed elsewhere, skipping");
                    report.conflicts += 1;
                    continue;
                }
                Err(err) => {
                    warn!(enrollment_id = %enrollment.id, error = %err, "Claim failed");
                    report.errors += 1;
                    continue;
                }
            };
            report.claimed += 1;

            let executor = self.executor.clone();
            workers.spawn(async move {
                let _permit = permit;
                executor.run(claimed, token, at).await
            });
        }

        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(Ok(run)) => match run.outcome {
                    RunOutcome::Completed => report.completed += 1,
                    RunOutcome::Failed { .. } => report.failed += 1,
                    RunOutcome::Parked { .. } | RunOutcome::Yielded | RunOutcome::Deferred { .. } => {
                        report.advanced += 1
                    }
                },
                Ok(Err(JourneyError::ClaimConflict(id))) => {
                    warn!(enrollment_id = %id, "Claim lost during execution");
                    report.conflicts += 1;
                }
                Ok(Err(err)) => {
                    warn!(error = %err, "Enrollment run failed");
                    report.errors += 1;
                }
                Err(join_err) => {
                    error!(error = %join_err, "Enrollment worker panicked");
                    report.errors += 1;
                }
            }
        }

        metrics::counter!("journey.ticks").increment(1);
        metrics::histogram!("journey.tick_duration_ms")
            .record(started.elapsed().as_secs_f64() * 1000.0);
        if report.selected > 0 {
            info!(
                worker_id = %self.settings.worker_id,
                selected = report.selected,
                claimed = report.claimed,
                conflicts = report.conflicts,
                completed = report.completed,
                failed = report.failed,
                errors = report.errors,
                "Tick finished"
            );
        }
        report
    }

    /// Ticks on the configured interval until `shutdown` flips to `true` or
    /// its sender is dropped.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.settings.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            worker_id = %self.settings.worker_id,
            interval_secs = self.settings.tick_interval.as_secs(),
            "Scheduler started"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick(Utc::now()).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!(worker_id = %self.settings.worker_id, "Scheduler stopping");
                        break;
                    }
                }
            }
        }
    }
}
