//! Orchestration controller.
//!
//! The public face of the engine. It owns the plan registry, the handler
//! registry and the progress emitter, and spawns one [`StepScheduler`] task
//! per executing plan. Control operations (pause, resume, cancel) mutate the
//! plan under its lock and then wake the scheduler.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::{FutureExt, StreamExt};
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use crate::capability::{BackupProvider, BackupRecord, BACKUP_STEP_ID};
use crate::config::OrchestratorConfig;
use crate::error::{MigrationError, Result};
use crate::executor::{RetryPolicy, StepExecutor};
use crate::handler::{HandlerRegistry, SharedHandler};
use crate::metrics::{new_shared_metrics, SharedOrchestratorMetrics, StepOutcomeKind};
use crate::plan::{MigrationPlan, PlanBuilder, PlanId, PlanStatus, Platform, Stage, StepStatus};
use crate::progress::{EventKind, ProgressEmitter, ProgressEvent, ProgressStream, SubscriptionId};
use crate::registry::{PlanEntry, PlanRegistry, PlanState, PlanSummary};
use crate::scheduler::StepScheduler;
use crate::status::StatusSnapshot;

/// Metadata key set once a plan has been rolled back.
const ROLLED_BACK_KEY: &str = "rolled_back_backup_id";

/// Builds, runs and controls migration plans.
pub struct OrchestrationController {
    config: OrchestratorConfig,
    plans: PlanRegistry,
    builder: PlanBuilder,
    handlers: Arc<HandlerRegistry>,
    emitter: ProgressEmitter,
    executor: Arc<StepExecutor>,
    metrics: SharedOrchestratorMetrics,
}

impl OrchestrationController {
    /// Create a controller. Must be called from within a tokio runtime.
    pub fn new(config: OrchestratorConfig) -> Result<Self> {
        Self::with_handlers(config, HandlerRegistry::new())
    }

    /// Create a controller with a pre-populated handler registry.
    pub fn with_handlers(config: OrchestratorConfig, handlers: HandlerRegistry) -> Result<Self> {
        config.validate()?;

        let metrics = new_shared_metrics();
        let handlers = Arc::new(handlers);
        let emitter = ProgressEmitter::new(config.event_buffer, metrics.clone());
        let executor = Arc::new(
            StepExecutor::new(
                handlers.clone(),
                RetryPolicy::from_config(&config),
                metrics.clone(),
            )
            .with_step_timeout(config.step_timeout),
        );

        info!(
            max_concurrent_steps = config.max_concurrent_steps,
            retry_attempts = config.retry_attempts,
            retry_delay_ms = config.retry_delay.as_millis() as u64,
            step_timeout_ms = config.step_timeout.map(|t| t.as_millis() as u64),
            "orchestration controller created"
        );

        Ok(Self {
            config,
            plans: PlanRegistry::new(),
            builder: PlanBuilder::new(),
            handlers,
            emitter,
            executor,
            metrics,
        })
    }

    /// Build a plan for a platform pair and register it under a fresh id.
    pub fn create_migration_plan(
        &self,
        source: &str,
        destination: &str,
        source_path: &str,
        destination_path: &str,
        options: &Map<String, Value>,
    ) -> Result<MigrationPlan> {
        let plan = self.builder.build_from_names(
            source,
            destination,
            source_path,
            destination_path,
            options,
        )?;
        Ok(self.store(plan))
    }

    /// Same as [`Self::create_migration_plan`] with parsed platforms.
    pub fn create_plan_for(
        &self,
        source: Platform,
        destination: Platform,
        source_path: &str,
        destination_path: &str,
        options: &Map<String, Value>,
    ) -> Result<MigrationPlan> {
        let plan = self
            .builder
            .build(source, destination, source_path, destination_path, options)?;
        Ok(self.store(plan))
    }

    /// Register a plan built by the caller.
    ///
    /// The plan is validated first. Its id must not be registered yet.
    pub fn register_plan(&self, plan: MigrationPlan) -> Result<PlanId> {
        plan.validate()?;
        if self.plans.contains(plan.id) {
            return Err(MigrationError::InvalidState {
                plan_id: plan.id,
                operation: "register",
                reason: "plan id already registered".to_string(),
            });
        }
        let plan_id = plan.id;
        self.store(plan);
        Ok(plan_id)
    }

    fn store(&self, plan: MigrationPlan) -> MigrationPlan {
        info!(
            plan_id = %plan.id,
            source = %plan.source,
            destination = %plan.destination,
            steps = plan.steps.len(),
            fingerprint = %plan.fingerprint(),
            "migration plan registered"
        );
        self.metrics.record_plan_created();
        self.plans.insert(plan.clone());
        plan
    }

    /// Current record of a plan.
    pub fn get_plan(&self, plan_id: PlanId) -> Result<MigrationPlan> {
        Ok(self.plans.get(plan_id)?.lock().plan.clone())
    }

    /// All registered plans, oldest first.
    pub fn list_plans(&self) -> Vec<PlanSummary> {
        self.plans.list()
    }

    /// Number of registered plans.
    pub fn plan_count(&self) -> usize {
        self.plans.len()
    }

    /// Forget a plan. Refused while it is executing.
    pub fn remove_plan(&self, plan_id: PlanId) -> Result<MigrationPlan> {
        let plan = self.plans.remove(plan_id)?;
        debug!(plan_id = %plan_id, "migration plan removed");
        Ok(plan)
    }

    /// Start executing a plan and return the stream of its progress events.
    ///
    /// The stream is subscribed before the scheduler starts, so it observes
    /// every event of the run and ends after `PlanFinished`. It also ends if
    /// a lagging consumer lost that event to newer ones.
    pub fn execute_migration(&self, plan_id: PlanId) -> Result<ProgressStream> {
        let entry = self.plans.get(plan_id)?;
        let stream = {
            let mut state = entry.lock();
            if state.executing {
                return Err(MigrationError::AlreadyRunning { plan_id });
            }
            let status = state.plan.status();
            if status.is_terminal() {
                return Err(MigrationError::InvalidState {
                    plan_id,
                    operation: "execute",
                    reason: format!("plan is {}", status),
                });
            }
            state.executing = true;
            self.emitter.stream(plan_id).until(&entry.ended)
        };

        let scheduler = StepScheduler::new(
            entry.clone(),
            self.executor.clone(),
            self.emitter.clone(),
            self.metrics.clone(),
            self.config.max_concurrent_steps,
        );
        let emitter = self.emitter.clone();
        tokio::spawn(async move {
            if AssertUnwindSafe(scheduler.run()).catch_unwind().await.is_err() {
                abort_after_panic(&entry, &emitter, plan_id);
            }
        });

        info!(plan_id = %plan_id, "migration execution started");
        Ok(stream)
    }

    /// Execute a plan and wait until it is terminal.
    pub async fn run_to_completion(&self, plan_id: PlanId) -> Result<StatusSnapshot> {
        let mut stream = self.execute_migration(plan_id)?;
        while stream.next().await.is_some() {}
        self.get_migration_status(plan_id)
    }

    /// Halt dispatch. Running steps become PAUSED; their handlers are not
    /// interrupted, and an outcome they return is kept until resume.
    pub fn pause_migration(&self, plan_id: PlanId) -> Result<()> {
        let entry = self.plans.get(plan_id)?;
        {
            let mut state = entry.lock();
            let status = state.plan.status();
            if settled(&state) {
                return Err(MigrationError::InvalidState {
                    plan_id,
                    operation: "pause",
                    reason: format!("plan is {}", status),
                });
            }
            if state.paused {
                debug!(plan_id = %plan_id, "plan already paused");
                return Ok(());
            }
            state.paused = true;

            let mut paused = 0usize;
            for step in state
                .plan
                .steps
                .iter_mut()
                .filter(|s| s.status == StepStatus::Running)
            {
                step.pause()?;
                paused += 1;
                self.emitter.emit(ProgressEvent::step(
                    plan_id,
                    step,
                    EventKind::StepPaused,
                    format!("{} paused", step.name),
                ));
            }
            self.emitter.emit(ProgressEvent::plan(
                plan_id,
                EventKind::PlanPaused,
                state.plan.status(),
                format!("migration paused ({} running step(s) suspended)", paused),
            ));
            info!(plan_id = %plan_id, paused, "migration paused");
        }
        entry.wake.notify_one();
        Ok(())
    }

    /// Resume a paused plan. Paused steps go back to PENDING and scheduling
    /// continues from the current frontier.
    pub fn resume_migration(&self, plan_id: PlanId) -> Result<()> {
        let entry = self.plans.get(plan_id)?;
        {
            let mut state = entry.lock();
            if !state.paused {
                return Err(MigrationError::InvalidState {
                    plan_id,
                    operation: "resume",
                    reason: "plan is not paused".to_string(),
                });
            }
            state.paused = false;

            let mut resumed = 0usize;
            for step in state
                .plan
                .steps
                .iter_mut()
                .filter(|s| s.status == StepStatus::Paused)
            {
                step.requeue()?;
                resumed += 1;
                self.emitter.emit(ProgressEvent::step(
                    plan_id,
                    step,
                    EventKind::StepResumed,
                    format!("{} resumed", step.name),
                ));
            }
            self.emitter.emit(ProgressEvent::plan(
                plan_id,
                EventKind::PlanResumed,
                state.plan.status(),
                format!("migration resumed ({} step(s) requeued)", resumed),
            ));
            info!(plan_id = %plan_id, resumed, "migration resumed");
        }
        entry.wake.notify_one();
        Ok(())
    }

    /// Cancel a plan. Every non-terminal step becomes CANCELLED and nothing
    /// new is dispatched. Completed work is not undone.
    ///
    /// Cancelling a finished plan is a no-op.
    pub fn cancel_migration(&self, plan_id: PlanId) -> Result<()> {
        let entry = self.plans.get(plan_id)?;
        {
            let mut state = entry.lock();
            if settled(&state) || state.plan.steps.iter().all(|s| s.is_terminal()) {
                let status = state.plan.status();
                debug!(plan_id = %plan_id, status = %status, "cancel of finished plan ignored");
                return Ok(());
            }

            let now = chrono::Utc::now();
            let mut cancelled = 0usize;
            for step in state.plan.steps.iter_mut().filter(|s| !s.is_terminal()) {
                let was_started = matches!(step.status, StepStatus::Running | StepStatus::Paused);
                step.cancel()?;
                cancelled += 1;
                if was_started {
                    let elapsed = step
                        .started_at
                        .map(|start| (now - start).to_std().unwrap_or_default())
                        .unwrap_or_default();
                    self.metrics
                        .record_step_finished(StepOutcomeKind::Cancelled, elapsed);
                }
                self.emitter.emit(ProgressEvent::step(
                    plan_id,
                    step,
                    EventKind::StepCancelled,
                    format!("{} cancelled", step.name),
                ));
            }
            state.parked.clear();
            state.paused = false;

            self.emitter.emit(ProgressEvent::plan(
                plan_id,
                EventKind::PlanCancelled,
                state.plan.status(),
                format!("migration cancelled ({} step(s))", cancelled),
            ));
            info!(plan_id = %plan_id, cancelled, executing = state.executing, "migration cancelled");
        }
        entry.cancel.cancel();
        entry.wake.notify_one();
        Ok(())
    }

    /// Snapshot of a plan's progress.
    pub fn get_migration_status(&self, plan_id: PlanId) -> Result<StatusSnapshot> {
        let entry = self.plans.get(plan_id)?;
        let state = entry.lock();
        Ok(StatusSnapshot::of(&state.plan))
    }

    /// Restore the backup taken by a FAILED or CANCELLED plan.
    ///
    /// Never invoked automatically. The backup record is the result of the
    /// plan's backup step, so the step must have completed.
    pub async fn rollback_migration(
        &self,
        plan_id: PlanId,
        provider: &dyn BackupProvider,
    ) -> Result<BackupRecord> {
        let entry = self.plans.get(plan_id)?;
        let (info, record) = {
            let state = entry.lock();
            let status = state.plan.status();
            if state.executing || !matches!(status, PlanStatus::Failed | PlanStatus::Cancelled) {
                return Err(MigrationError::InvalidState {
                    plan_id,
                    operation: "rollback",
                    reason: format!("plan is {}", status),
                });
            }
            if state.plan.metadata.contains_key(ROLLED_BACK_KEY) {
                return Err(MigrationError::InvalidState {
                    plan_id,
                    operation: "rollback",
                    reason: "plan was already rolled back".to_string(),
                });
            }
            let record = backup_record(&state.plan)?;
            (state.plan.info(), record)
        };

        info!(plan_id = %plan_id, backup_id = %record.backup_id, "rolling back migration");
        provider
            .rollback(&info, &record)
            .await
            .map_err(|err| MigrationError::Rollback {
                plan_id,
                reason: err.message,
            })?;

        {
            let mut state = entry.lock();
            state.plan.metadata.insert(
                ROLLED_BACK_KEY.to_string(),
                Value::String(record.backup_id.clone()),
            );
            self.emitter.emit(ProgressEvent::plan(
                plan_id,
                EventKind::PlanRolledBack,
                state.plan.status(),
                format!("restored backup {}", record.backup_id),
            ));
        }
        info!(plan_id = %plan_id, backup_id = %record.backup_id, "migration rolled back");
        Ok(record)
    }

    /// Handle one specific step.
    pub fn register_step_handler(&self, step_id: impl Into<String>, handler: SharedHandler) {
        self.handlers.register_step(step_id, handler);
    }

    /// Handle every step of a stage without a step specific handler.
    pub fn register_stage_handler(&self, stage: Stage, handler: SharedHandler) {
        self.handlers.register_stage(stage, handler);
    }

    /// Handle every step without a more specific handler.
    pub fn set_default_handler(&self, handler: SharedHandler) {
        self.handlers.set_default(handler);
    }

    /// Register a callback receiving every progress event of every plan.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&ProgressEvent) + Send + Sync + 'static,
    {
        self.emitter.subscribe(callback)
    }

    /// Remove a callback. Returns false if the id was unknown.
    pub fn unsubscribe(&self, subscription_id: SubscriptionId) -> bool {
        self.emitter.unsubscribe(subscription_id)
    }

    /// Open an additional event stream for a plan.
    ///
    /// Sees events emitted from now on. If the plan's run is already over,
    /// the stream yields only its `PlanFinished` event.
    pub fn watch(&self, plan_id: PlanId) -> Result<ProgressStream> {
        let entry = self.plans.get(plan_id)?;
        Ok(self.emitter.stream(plan_id).until(&entry.ended))
    }

    /// Shared metrics.
    pub fn metrics(&self) -> &SharedOrchestratorMetrics {
        &self.metrics
    }

    /// Configuration in use.
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }
}

/// A plan that is terminal and no longer driven by a scheduler.
fn settled(state: &PlanState) -> bool {
    !state.executing && state.plan.status().is_terminal()
}

fn backup_record(plan: &MigrationPlan) -> Result<BackupRecord> {
    let step = plan
        .step(BACKUP_STEP_ID)
        .filter(|s| s.status == StepStatus::Completed)
        .ok_or_else(|| MigrationError::Rollback {
            plan_id: plan.id,
            reason: "plan has no completed backup step".to_string(),
        })?;
    let payload = step.result.clone().ok_or_else(|| MigrationError::Rollback {
        plan_id: plan.id,
        reason: "backup step produced no record".to_string(),
    })?;
    serde_json::from_value(payload).map_err(|e| MigrationError::Rollback {
        plan_id: plan.id,
        reason: format!("unreadable backup record: {}", e),
    })
}

/// Leave a plan in a terminal, observable state after its scheduler
/// panicked.
fn abort_after_panic(entry: &PlanEntry, emitter: &ProgressEmitter, plan_id: PlanId) {
    let mut state = entry.lock();
    error!(plan_id = %plan_id, "scheduler panicked, aborting plan");
    state.executing = false;
    state.paused = false;
    state.plan.fault = Some("scheduler panicked".to_string());
    for step in state.plan.steps.iter_mut().filter(|s| !s.is_terminal()) {
        if let Err(err) = step.cancel() {
            warn!(plan_id = %plan_id, error = %err, "could not cancel step");
        }
    }
    let event = ProgressEvent::plan(
        plan_id,
        EventKind::PlanFinished,
        state.plan.status(),
        "migration aborted",
    )
    .with_error("scheduler panicked");
    emitter.emit(event.clone());
    entry.ended.set(event);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::generate_plan_id;
    use std::time::Duration;

    fn controller() -> OrchestrationController {
        OrchestrationController::new(
            OrchestratorConfig::new().with_retry_delay(Duration::ZERO),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_create_and_list() {
        let controller = controller();
        let plan = controller
            .create_migration_plan("wordpress", "hugo", "/srv/wp", "/srv/hugo", &Map::new())
            .unwrap();

        let rows = controller.list_plans();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].plan_id, plan.id);
        assert_eq!(rows[0].status, PlanStatus::Pending);
        assert_eq!(controller.metrics().plans_created(), 1);
        assert_eq!(controller.get_plan(plan.id).unwrap(), plan);
    }

    #[tokio::test]
    async fn test_unknown_platform_rejected() {
        let controller = controller();
        let err = controller
            .create_migration_plan("geocities", "hugo", "/a", "/b", &Map::new())
            .unwrap_err();
        assert!(matches!(err, MigrationError::Configuration(_)));
        assert!(controller.list_plans().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_plan_everywhere() {
        let controller = controller();
        let id = generate_plan_id();
        assert!(matches!(
            controller.execute_migration(id),
            Err(MigrationError::PlanNotFound { .. })
        ));
        assert!(controller.pause_migration(id).is_err());
        assert!(controller.resume_migration(id).is_err());
        assert!(controller.cancel_migration(id).is_err());
        assert!(controller.get_migration_status(id).is_err());
        assert!(controller.remove_plan(id).is_err());
    }

    #[tokio::test]
    async fn test_cancel_pending_plan() {
        let controller = controller();
        let plan = controller
            .create_migration_plan("ghost", "wordpress", "/a", "/b", &Map::new())
            .unwrap();

        controller.cancel_migration(plan.id).unwrap();
        let status = controller.get_migration_status(plan.id).unwrap();
        assert_eq!(status.status, PlanStatus::Cancelled);
        assert_eq!(status.cancelled_steps, status.total_steps);

        // Terminal now: cancel is a no-op, execute is refused.
        controller.cancel_migration(plan.id).unwrap();
        assert!(matches!(
            controller.execute_migration(plan.id),
            Err(MigrationError::InvalidState { operation: "execute", .. })
        ));
    }

    #[tokio::test]
    async fn test_resume_requires_pause() {
        let controller = controller();
        let plan = controller
            .create_migration_plan("drupal", "ghost", "/a", "/b", &Map::new())
            .unwrap();
        assert!(matches!(
            controller.resume_migration(plan.id),
            Err(MigrationError::InvalidState { operation: "resume", .. })
        ));
    }

    #[tokio::test]
    async fn test_register_plan_twice() {
        let controller = controller();
        let plan = PlanBuilder::new()
            .build(Platform::Hugo, Platform::Jekyll, "/a", "/b", &Map::new())
            .unwrap();
        controller.register_plan(plan.clone()).unwrap();
        assert!(matches!(
            controller.register_plan(plan),
            Err(MigrationError::InvalidState { operation: "register", .. })
        ));
    }

    #[tokio::test]
    async fn test_create_plan_for_parsed_platforms() {
        let controller = controller();
        let by_enum = controller
            .create_plan_for(Platform::Joomla, Platform::WordPress, "/a", "/b", &Map::new())
            .unwrap();
        let by_name = controller
            .create_migration_plan("joomla", "wordpress", "/a", "/b", &Map::new())
            .unwrap();

        assert_ne!(by_enum.id, by_name.id);
        assert_eq!(by_enum.fingerprint(), by_name.fingerprint());
        assert_eq!(controller.plan_count(), 2);
    }

    #[tokio::test]
    async fn test_watch_after_run_yields_finish() {
        let controller = controller();
        let plan = controller
            .create_migration_plan("hugo", "jekyll", "/a", "/b", &Map::new())
            .unwrap();
        let status = tokio::time::timeout(
            Duration::from_secs(5),
            controller.run_to_completion(plan.id),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(status.status, PlanStatus::Completed);

        let events: Vec<ProgressEvent> = tokio::time::timeout(
            Duration::from_secs(1),
            controller.watch(plan.id).unwrap().collect::<Vec<_>>(),
        )
        .await
        .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::PlanFinished);
        assert_eq!(events[0].plan_status, Some(PlanStatus::Completed));

        // Finished, so neither pause nor resume applies.
        assert!(controller.pause_migration(plan.id).is_err());
        assert!(controller.resume_migration(plan.id).is_err());
        assert!(matches!(
            controller.watch(generate_plan_id()),
            Err(MigrationError::PlanNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let mut config = OrchestratorConfig::new();
        config.max_concurrent_steps = 0;
        assert!(matches!(
            OrchestrationController::new(config),
            Err(MigrationError::Configuration(_))
        ));
    }
}
