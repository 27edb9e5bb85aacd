//! Dependency-aware step dispatch.
//!
//! One [`StepScheduler`] task drives one plan. It is a bounded variant of
//! Kahn's algorithm: on every pass it computes the frontier (PENDING steps
//! whose predecessors are all COMPLETED), dispatches frontier steps in
//! declaration order until `max_concurrent_steps` are in flight, then waits
//! for a completion or a control signal and recomputes.
//!
//! Dependents of a failed or cancelled step are never dispatched. Steps on
//! independent branches keep running until nothing else can progress. If
//! pending steps remain that are neither ready nor blocked by a failure, the
//! plan is aborted with a deadlock fault instead of waiting forever.

use std::collections::{BTreeMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::error::MigrationError;
use crate::executor::{StepExecutor, StepOutcome};
use crate::handler::StepContext;
use crate::metrics::{PlanOutcome, SharedOrchestratorMetrics, StepOutcomeKind};
use crate::plan::{PlanId, PlanInfo, PlanStatus, StepStatus};
use crate::progress::{EventKind, ProgressEmitter, ProgressEvent, ProgressReporter};
use crate::registry::{PlanEntry, PlanState};

type Completion = (String, StepOutcome);

/// What to do after a pass with nothing in flight.
enum Idle {
    /// The plan cannot progress any further.
    Finish,
    /// Dispatch is paused; wait for a control signal.
    Wait,
    /// Something became dispatchable.
    Retry,
}

/// Drives one plan to a terminal state.
pub(crate) struct StepScheduler {
    plan_id: PlanId,
    info: Arc<PlanInfo>,
    entry: Arc<PlanEntry>,
    executor: Arc<StepExecutor>,
    emitter: ProgressEmitter,
    metrics: SharedOrchestratorMetrics,
    max_concurrent: usize,
}

impl StepScheduler {
    pub(crate) fn new(
        entry: Arc<PlanEntry>,
        executor: Arc<StepExecutor>,
        emitter: ProgressEmitter,
        metrics: SharedOrchestratorMetrics,
        max_concurrent: usize,
    ) -> Self {
        let info = Arc::new(entry.lock().plan.info());
        Self {
            plan_id: info.id,
            info,
            entry,
            executor,
            emitter,
            metrics,
            max_concurrent: max_concurrent.max(1),
        }
    }

    /// Run until the plan is terminal. Returns the final derived status.
    pub(crate) async fn run(self) -> PlanStatus {
        info!(plan_id = %self.plan_id, max_concurrent = self.max_concurrent, "scheduler started");
        self.metrics.record_plan_started();
        {
            let state = self.entry.lock();
            self.emitter.emit(ProgressEvent::plan(
                self.plan_id,
                EventKind::PlanStarted,
                state.plan.status(),
                format!(
                    "migration {} -> {} started",
                    state.plan.source, state.plan.destination
                ),
            ));
        }

        let mut tasks: JoinSet<Completion> = JoinSet::new();
        let mut in_flight: HashSet<String> = HashSet::new();

        loop {
            self.dispatch(&mut tasks, &mut in_flight);

            if tasks.is_empty() {
                self.reconcile_lost(&mut in_flight);
                match self.idle() {
                    Idle::Finish => break,
                    Idle::Retry => continue,
                    Idle::Wait => {
                        tokio::select! {
                            _ = self.entry.wake.notified() => {}
                            _ = self.entry.cancel.cancelled() => {}
                        }
                        continue;
                    }
                }
            }

            tokio::select! {
                joined = tasks.join_next() => match joined {
                    Some(Ok((step_id, outcome))) => self.complete(step_id, outcome, &mut in_flight),
                    Some(Err(err)) => {
                        error!(plan_id = %self.plan_id, error = %err, "step task aborted");
                    }
                    None => {}
                },
                _ = self.entry.wake.notified() => {}
            }
        }

        self.finish()
    }

    /// Fill free slots from the frontier.
    fn dispatch(&self, tasks: &mut JoinSet<Completion>, in_flight: &mut HashSet<String>) {
        let mut state = self.entry.lock();
        if self.entry.cancel.is_cancelled() || state.paused {
            return;
        }

        while in_flight.len() < self.max_concurrent {
            let next = state
                .plan
                .frontier()
                .into_iter()
                .find(|&idx| !in_flight.contains(&state.plan.steps[idx].id));
            let Some(idx) = next else {
                break;
            };

            let step = &mut state.plan.steps[idx];
            if let Err(err) = step.start() {
                error!(plan_id = %self.plan_id, error = %err, "frontier step refused to start");
                break;
            }
            let step_id = step.id.clone();
            self.metrics.record_step_dispatched();
            debug!(plan_id = %self.plan_id, step_id = %step_id, "step dispatched");
            self.emitter.emit(ProgressEvent::step(
                self.plan_id,
                step,
                EventKind::StepStarted,
                format!("{} started", step.name),
            ));

            // Finished while paused: apply the result instead of re-running.
            if let Some(outcome) = state.parked.remove(&step_id) {
                debug!(plan_id = %self.plan_id, step_id = %step_id, "applying parked outcome");
                self.apply(&mut state, idx, &outcome);
                continue;
            }

            let ctx = self.context(&state, idx);
            let executor = self.executor.clone();
            in_flight.insert(step_id.clone());
            tasks.spawn(async move {
                let outcome = AssertUnwindSafe(executor.execute(ctx))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| StepOutcome::aborted("step executor panicked"));
                (step_id, outcome)
            });
        }
    }

    fn context(&self, state: &PlanState, idx: usize) -> StepContext {
        let step = state.plan.steps[idx].clone();
        let upstream: BTreeMap<String, serde_json::Value> = state
            .plan
            .ancestors_of(&step.id)
            .into_iter()
            .filter_map(|id| {
                state
                    .plan
                    .step(id)
                    .and_then(|s| s.result.clone())
                    .map(|r| (id.to_string(), r))
            })
            .collect();

        let entry = self.entry.clone();
        let emitter = self.emitter.clone();
        let plan_id = self.plan_id;
        let step_id = step.id.clone();
        let (retry_entry, retry_emitter, retry_step_id) =
            (entry.clone(), emitter.clone(), step_id.clone());
        let reporter = ProgressReporter::new(move |percent, message| {
            let mut state = entry.lock();
            let Some(step) = state.plan.step_mut(&step_id) else {
                return;
            };
            if step.status != StepStatus::Running {
                return;
            }
            step.set_progress(percent);
            emitter.emit(ProgressEvent::step(
                plan_id,
                step,
                EventKind::StepProgress,
                message.to_string(),
            ));
        })
        .with_retry_sink(move |message, error| {
            let state = retry_entry.lock();
            let Some(step) = state.plan.step(&retry_step_id) else {
                return false;
            };
            if step.status != StepStatus::Running {
                return false;
            }
            retry_emitter.emit(
                ProgressEvent::step(plan_id, step, EventKind::StepRetrying, message.to_string())
                    .with_error(error),
            );
            true
        });

        StepContext::new(
            self.info.clone(),
            step,
            upstream,
            self.entry.cancel.clone(),
            reporter,
        )
    }

    /// Handle an outcome returned by an executor task.
    fn complete(&self, step_id: String, outcome: StepOutcome, in_flight: &mut HashSet<String>) {
        in_flight.remove(&step_id);
        let mut state = self.entry.lock();
        let Some(idx) = state.plan.step_index(&step_id) else {
            return;
        };

        let status = state.plan.steps[idx].status;
        match status {
            StepStatus::Running => self.apply(&mut state, idx, &outcome),
            StepStatus::Paused => {
                debug!(plan_id = %self.plan_id, step_id = %step_id, "step finished while paused, outcome parked");
                state.parked.insert(step_id, outcome);
            }
            StepStatus::Pending => {
                // Resumed before its in-flight attempt returned.
                let step = &mut state.plan.steps[idx];
                if step.start().is_ok() {
                    self.emitter.emit(ProgressEvent::step(
                        self.plan_id,
                        step,
                        EventKind::StepStarted,
                        format!("{} started", step.name),
                    ));
                    self.apply(&mut state, idx, &outcome);
                }
            }
            _ => {
                debug!(
                    plan_id = %self.plan_id,
                    step_id = %step_id,
                    status = %status,
                    "discarding outcome of finished step"
                );
            }
        }
    }

    /// Record an outcome on a RUNNING step and emit its terminal event.
    fn apply(&self, state: &mut PlanState, idx: usize, outcome: &StepOutcome) {
        let step = &mut state.plan.steps[idx];
        if let Err(err) = StepExecutor::record(step, outcome) {
            error!(plan_id = %self.plan_id, error = %err, "could not record step outcome");
            return;
        }

        let elapsed = match (step.started_at, step.completed_at) {
            (Some(start), Some(end)) => (end - start).to_std().unwrap_or_default(),
            _ => Default::default(),
        };
        let (kind, metric, message) = match step.status {
            StepStatus::Completed => (
                EventKind::StepCompleted,
                StepOutcomeKind::Completed,
                format!("{} completed", step.name),
            ),
            StepStatus::Cancelled => (
                EventKind::StepCancelled,
                StepOutcomeKind::Cancelled,
                format!("{} cancelled", step.name),
            ),
            _ => (
                EventKind::StepFailed,
                StepOutcomeKind::Failed,
                format!(
                    "{} failed after {} attempt(s): {}",
                    step.name,
                    step.attempts,
                    step.error.as_deref().unwrap_or("unknown error")
                ),
            ),
        };
        self.metrics.record_step_finished(metric, elapsed);
        self.emitter
            .emit(ProgressEvent::step(self.plan_id, step, kind, message));

        if kind == EventKind::StepFailed {
            let step_id = step.id.clone();
            let blocked = state.plan.dependents_of(&step_id).len();
            warn!(
                plan_id = %self.plan_id,
                step_id = %step_id,
                blocked,
                "step failed, dependents will not run"
            );
        } else {
            info!(plan_id = %self.plan_id, step_id = %step.id, status = %step.status, "step finished");
        }
    }

    /// Fail steps whose task vanished without reporting back.
    fn reconcile_lost(&self, in_flight: &mut HashSet<String>) {
        if in_flight.is_empty() {
            return;
        }
        let mut state = self.entry.lock();
        for step_id in in_flight.drain() {
            let Some(idx) = state.plan.step_index(&step_id) else {
                continue;
            };
            if state.plan.steps[idx].status == StepStatus::Running {
                error!(plan_id = %self.plan_id, step_id = %step_id, "step task lost");
                self.apply(&mut state, idx, &StepOutcome::aborted("step task lost"));
            }
        }
    }

    /// Decide what to do when nothing is in flight.
    fn idle(&self) -> Idle {
        let mut state = self.entry.lock();
        if self.entry.cancel.is_cancelled() {
            return Idle::Finish;
        }
        let ready = !state.plan.frontier().is_empty();
        let suspended = state
            .plan
            .steps
            .iter()
            .any(|s| s.status == StepStatus::Paused);
        // A pause only holds the plan open while there is work to resume.
        if state.paused && (ready || suspended) {
            return Idle::Wait;
        }

        let pending: Vec<usize> = state
            .plan
            .steps
            .iter()
            .enumerate()
            .filter(|(_, s)| s.status == StepStatus::Pending)
            .map(|(idx, _)| idx)
            .collect();
        if pending.is_empty() {
            return Idle::Finish;
        }
        if ready {
            return Idle::Retry;
        }

        let blocked = state.plan.blocked_steps();
        let stuck: Vec<&str> = pending
            .iter()
            .filter(|idx| !blocked.contains(idx))
            .map(|&idx| state.plan.steps[idx].id.as_str())
            .collect();
        if stuck.is_empty() {
            debug!(plan_id = %self.plan_id, blocked = blocked.len(), "remaining steps blocked by failures");
            return Idle::Finish;
        }

        let fault = MigrationError::Deadlock {
            plan_id: self.plan_id,
            pending: stuck.len(),
            steps: stuck.join(", "),
        };
        error!(plan_id = %self.plan_id, error = %fault, "scheduler deadlock, aborting plan");
        self.metrics.record_deadlock();
        state.plan.fault = Some(fault.to_string());
        Idle::Finish
    }

    fn finish(&self) -> PlanStatus {
        let mut state = self.entry.lock();
        state.executing = false;
        state.paused = false;
        let status = state.plan.status();
        let counts = state.plan.counts();

        self.metrics.record_plan_finished(match status {
            PlanStatus::Completed => PlanOutcome::Completed,
            PlanStatus::Cancelled => PlanOutcome::Cancelled,
            _ => PlanOutcome::Failed,
        });

        let mut event = ProgressEvent::plan(
            self.plan_id,
            EventKind::PlanFinished,
            status,
            format!(
                "migration {}: {}/{} steps completed",
                status, counts.completed, counts.total
            ),
        )
        .with_progress(percent(counts.completed, counts.total));
        if let Some(fault) = &state.plan.fault {
            event = event.with_error(fault.clone());
        }
        self.emitter.emit(event.clone());
        self.entry.ended.set(event);

        info!(
            plan_id = %self.plan_id,
            status = %status,
            completed = counts.completed,
            failed = counts.failed,
            cancelled = counts.cancelled,
            total = counts.total,
            "scheduler finished"
        );
        status
    }
}

pub(crate) fn percent(done: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        done as f64 * 100.0 / total as f64
    }
}
