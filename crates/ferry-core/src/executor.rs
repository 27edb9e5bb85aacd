//! Single-step execution with retries.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::config::OrchestratorConfig;
use crate::error::{Result, StepExecutionError};
use crate::handler::{HandlerRegistry, StepContext, StepHandler};
use crate::metrics::SharedOrchestratorMetrics;
use crate::plan::MigrationStep;

/// How many times a step is attempted and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Attempts including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub delay: Duration,
    /// Growth factor of the delay. 1.0 keeps it fixed.
    pub backoff_multiplier: f64,
    /// Cap for the grown delay.
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Fixed delay between attempts.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
            backoff_multiplier: 1.0,
            max_delay: delay,
        }
    }

    /// Policy described by a configuration.
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self {
            max_attempts: config.retry_attempts.max(1),
            delay: config.retry_delay,
            backoff_multiplier: config.backoff_multiplier,
            max_delay: config.max_retry_delay,
        }
    }

    /// Delay to wait after failed attempt number `attempt` (1-indexed).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        if self.backoff_multiplier <= 1.0 {
            return self.delay;
        }
        let exponent = attempt.saturating_sub(1).min(64) as i32;
        let secs = self.delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }

    /// Whether a failed attempt number `attempt` may be followed by another.
    pub fn should_retry(&self, attempt: u32, error: &StepExecutionError) -> bool {
        error.retriable && attempt < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&OrchestratorConfig::default())
    }
}

/// What happened when a step was executed.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome {
    /// Whether the handler succeeded.
    pub success: bool,
    /// Whether the last failure was retriable. Meaningless on success.
    pub retriable: bool,
    /// Payload returned on success.
    pub result: Option<Value>,
    /// Message of the last failure.
    pub error: Option<String>,
    /// Handler invocations made.
    pub attempts: u32,
    /// Execution stopped because the plan was cancelled.
    pub cancelled: bool,
}

impl StepOutcome {
    fn succeeded(result: Option<Value>, attempts: u32) -> Self {
        Self {
            success: true,
            retriable: false,
            result,
            error: None,
            attempts,
            cancelled: false,
        }
    }

    fn failed(error: StepExecutionError, attempts: u32) -> Self {
        Self {
            success: false,
            retriable: error.retriable,
            result: None,
            error: Some(error.message),
            attempts,
            cancelled: false,
        }
    }

    /// Terminal failure not produced by the handler itself.
    pub(crate) fn aborted(message: impl Into<String>) -> Self {
        Self::failed(StepExecutionError::fatal(message), 0)
    }

    fn cancelled(attempts: u32) -> Self {
        Self {
            success: false,
            retriable: false,
            result: None,
            error: None,
            attempts,
            cancelled: true,
        }
    }
}

/// Runs one step through its handler, applying the retry policy.
pub struct StepExecutor {
    handlers: Arc<HandlerRegistry>,
    policy: RetryPolicy,
    step_timeout: Option<Duration>,
    metrics: SharedOrchestratorMetrics,
}

impl StepExecutor {
    /// Create an executor.
    pub fn new(
        handlers: Arc<HandlerRegistry>,
        policy: RetryPolicy,
        metrics: SharedOrchestratorMetrics,
    ) -> Self {
        Self {
            handlers,
            policy,
            step_timeout: None,
            metrics,
        }
    }

    /// Bound every handler attempt. A timed out attempt is a retriable
    /// failure.
    pub fn with_step_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.step_timeout = timeout;
        self
    }

    /// Execute the step described by `ctx` until it succeeds, fails
    /// terminally, runs out of attempts or the plan is cancelled.
    ///
    /// Never touches the plan record; apply the outcome with [`Self::record`].
    /// Retry notices go through the context's progress reporter, which drops
    /// them once the step has left RUNNING.
    pub async fn execute(&self, ctx: StepContext) -> StepOutcome {
        let handler = self.handlers.resolve(&ctx.step);
        let plan_id = ctx.plan.id;
        let mut attempt = 0u32;

        loop {
            if ctx.is_cancelled() {
                debug!(plan_id = %plan_id, step_id = %ctx.step.id, attempt, "step cancelled before attempt");
                return StepOutcome::cancelled(attempt);
            }

            attempt += 1;
            self.metrics.record_attempt();
            let attempt_ctx = ctx.for_attempt(attempt);

            let err = match self.attempt(handler.as_ref(), &attempt_ctx).await {
                Ok(result) => {
                    debug!(plan_id = %plan_id, step_id = %ctx.step.id, attempt, "step succeeded");
                    return StepOutcome::succeeded(result, attempt);
                }
                Err(err) => err,
            };

            if !self.policy.should_retry(attempt, &err) {
                warn!(
                    plan_id = %plan_id,
                    step_id = %ctx.step.id,
                    attempt,
                    retriable = err.retriable,
                    error = %err,
                    "step failed"
                );
                return StepOutcome::failed(err, attempt);
            }

            // A cancel during the attempt already ended the step.
            if ctx.is_cancelled() {
                debug!(plan_id = %plan_id, step_id = %ctx.step.id, attempt, error = %err, "attempt failed after cancel");
                return StepOutcome::cancelled(attempt);
            }

            let delay = self.policy.delay_after(attempt);
            self.metrics.record_retry();
            warn!(
                plan_id = %plan_id,
                step_id = %ctx.step.id,
                attempt,
                max_attempts = self.policy.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "step attempt failed, retrying"
            );
            let notice = format!(
                "{}: attempt {}/{} failed, retrying",
                ctx.step.name, attempt, self.policy.max_attempts
            );
            if !ctx.progress.retrying(&notice, &err.message) {
                debug!(plan_id = %plan_id, step_id = %ctx.step.id, attempt, "step left RUNNING, retry notice dropped");
            }

            tokio::select! {
                _ = ctx.cancelled() => {
                    debug!(plan_id = %plan_id, step_id = %ctx.step.id, attempt, "retry abandoned, plan cancelled");
                    return StepOutcome::cancelled(attempt);
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn attempt(
        &self,
        handler: &dyn StepHandler,
        ctx: &StepContext,
    ) -> std::result::Result<Option<Value>, StepExecutionError> {
        let run = AssertUnwindSafe(handler.handle(ctx)).catch_unwind();

        let joined = match self.step_timeout {
            Some(limit) => match tokio::time::timeout(limit, run).await {
                Ok(joined) => joined,
                Err(_) => {
                    self.metrics.record_timeout();
                    return Err(StepExecutionError::retriable(format!(
                        "attempt timed out after {}ms",
                        limit.as_millis()
                    )));
                }
            },
            None => run.await,
        };

        joined.unwrap_or_else(|panic| {
            self.metrics.record_handler_panic();
            let message = panic_message(panic.as_ref());
            error!(
                plan_id = %ctx.plan.id,
                step_id = %ctx.step.id,
                attempt = ctx.attempt,
                panic = %message,
                "step handler panicked"
            );
            Err(StepExecutionError::fatal(format!(
                "handler panicked: {}",
                message
            )))
        })
    }

    /// Apply an outcome to a RUNNING step record.
    pub fn record(step: &mut MigrationStep, outcome: &StepOutcome) -> Result<()> {
        step.attempts += outcome.attempts;
        if outcome.cancelled {
            step.cancel()
        } else if outcome.success {
            step.complete(outcome.result.clone())
        } else {
            step.fail(
                outcome
                    .error
                    .clone()
                    .unwrap_or_else(|| "step failed".to_string()),
            )
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
