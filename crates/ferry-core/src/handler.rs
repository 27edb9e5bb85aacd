//! Step handlers and their registry.
//!
//! A handler performs the actual work of a step. The orchestrator only
//! decides whether, when and how many times it runs. Handlers must be safe to
//! invoke more than once for the same step, since failed attempts are retried.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::error::StepExecutionError;
use crate::plan::{MigrationStep, PlanInfo, Stage};
use crate::progress::ProgressReporter;

/// Result type returned by handlers.
pub type HandlerResult = std::result::Result<Option<Value>, StepExecutionError>;

/// Everything a handler gets to see about the step it runs.
#[derive(Debug, Clone)]
pub struct StepContext {
    /// The plan the step belongs to.
    pub plan: Arc<PlanInfo>,
    /// Snapshot of the step at dispatch time.
    pub step: MigrationStep,
    /// Attempt number, starting at 1.
    pub attempt: u32,
    /// Result payloads of upstream steps (direct and transitive
    /// predecessors), by step id.
    pub predecessor_results: Arc<BTreeMap<String, Value>>,
    cancel: CancellationToken,
    pub(crate) progress: ProgressReporter,
}

impl StepContext {
    /// Create a context for the first attempt.
    pub fn new(
        plan: Arc<PlanInfo>,
        step: MigrationStep,
        predecessor_results: BTreeMap<String, Value>,
        cancel: CancellationToken,
        progress: ProgressReporter,
    ) -> Self {
        Self {
            plan,
            step,
            attempt: 1,
            predecessor_results: Arc::new(predecessor_results),
            cancel,
            progress,
        }
    }

    /// Same context for another attempt.
    pub fn for_attempt(&self, attempt: u32) -> Self {
        let mut ctx = self.clone();
        ctx.attempt = attempt;
        ctx
    }

    /// Result of a completed predecessor.
    pub fn predecessor_result(&self, step_id: &str) -> Option<&Value> {
        self.predecessor_results.get(step_id)
    }

    /// A plan option or metadata value.
    pub fn option(&self, key: &str) -> Option<&Value> {
        self.plan.metadata.get(key)
    }

    /// Whether the plan was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the plan is cancelled.
    ///
    /// Long running handlers should race their work against this.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// The plan's cancellation token.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Report intermediate progress for this step.
    pub fn report_progress(&self, percent: f64, message: &str) {
        self.progress.report(percent, message);
    }
}

/// Work performed for a step.
#[async_trait]
pub trait StepHandler: Send + Sync {
    /// Run the step once.
    ///
    /// `Ok(payload)` completes the step. An error fails the attempt; its
    /// `retriable` flag decides whether another attempt is made.
    async fn handle(&self, ctx: &StepContext) -> HandlerResult;
}

/// Shared handler handle.
pub type SharedHandler = Arc<dyn StepHandler>;

/// Handler that succeeds immediately without a payload.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHandler;

#[async_trait]
impl StepHandler for NoopHandler {
    async fn handle(&self, _ctx: &StepContext) -> HandlerResult {
        Ok(None)
    }
}

/// Handler that sleeps, reporting progress, then returns a small payload.
///
/// Useful for demos and dry runs. Stops early when the plan is cancelled.
#[derive(Debug, Clone, Copy)]
pub struct SimulatedHandler {
    delay: Duration,
    ticks: u32,
}

impl SimulatedHandler {
    /// Simulate a step taking `delay`.
    pub fn new(delay: Duration) -> Self {
        Self { delay, ticks: 4 }
    }

    /// Number of intermediate progress reports.
    pub fn with_ticks(mut self, ticks: u32) -> Self {
        self.ticks = ticks.max(1);
        self
    }
}

#[async_trait]
impl StepHandler for SimulatedHandler {
    async fn handle(&self, ctx: &StepContext) -> HandlerResult {
        let tick = self.delay / self.ticks;
        for n in 1..=self.ticks {
            tokio::select! {
                _ = ctx.cancelled() => {
                    return Err(StepExecutionError::fatal("cancelled"));
                }
                _ = tokio::time::sleep(tick) => {}
            }
            if n < self.ticks {
                let pct = f64::from(n) * 100.0 / f64::from(self.ticks);
                ctx.report_progress(pct, &ctx.step.name);
            }
        }

        Ok(Some(json!({
            "simulated": true,
            "step": ctx.step.id,
            "attempt": ctx.attempt,
        })))
    }
}

/// Adapts an async closure into a handler.
pub struct FnHandler<F> {
    func: F,
}

#[async_trait]
impl<F, Fut> StepHandler for FnHandler<F>
where
    F: Fn(StepContext) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send,
{
    async fn handle(&self, ctx: &StepContext) -> HandlerResult {
        (self.func)(ctx.clone()).await
    }
}

/// Build a handler from an async closure taking an owned context.
pub fn handler_fn<F, Fut>(func: F) -> FnHandler<F>
where
    F: Fn(StepContext) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send,
{
    FnHandler { func }
}

/// Handler lookup: step id first, then stage, then the default.
pub struct HandlerRegistry {
    by_step: DashMap<String, SharedHandler>,
    by_stage: DashMap<Stage, SharedHandler>,
    default: RwLock<SharedHandler>,
}

impl HandlerRegistry {
    /// Registry whose default handler is [`NoopHandler`].
    pub fn new() -> Self {
        Self::with_default(Arc::new(NoopHandler))
    }

    /// Registry with a specific default handler.
    pub fn with_default(default: SharedHandler) -> Self {
        Self {
            by_step: DashMap::new(),
            by_stage: DashMap::new(),
            default: RwLock::new(default),
        }
    }

    /// Register a handler for one step id. Replaces any previous one.
    pub fn register_step(&self, step_id: impl Into<String>, handler: SharedHandler) {
        self.by_step.insert(step_id.into(), handler);
    }

    /// Register a handler for every step of a stage.
    pub fn register_stage(&self, stage: Stage, handler: SharedHandler) {
        self.by_stage.insert(stage, handler);
    }

    /// Replace the fallback handler.
    pub fn set_default(&self, handler: SharedHandler) {
        *self.default.write() = handler;
    }

    /// Remove a step handler. Returns true if one was registered.
    pub fn unregister_step(&self, step_id: &str) -> bool {
        self.by_step.remove(step_id).is_some()
    }

    /// Find the handler for a step.
    pub fn resolve(&self, step: &MigrationStep) -> SharedHandler {
        if let Some(handler) = self.by_step.get(&step.id) {
            return handler.value().clone();
        }
        if let Some(handler) = self.by_stage.get(&step.stage) {
            return handler.value().clone();
        }
        self.default.read().clone()
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
