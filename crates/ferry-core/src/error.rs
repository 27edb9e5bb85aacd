//! Orchestration error types.

use thiserror::Error;

use crate::plan::{PlanId, StepStatus};

/// Errors raised by plan construction and the orchestration control surface.
///
/// Handler failures are not represented here: they are absorbed by the
/// executor and surface as a FAILED step (see [`StepExecutionError`]).
#[derive(Debug, Error)]
pub enum MigrationError {
    /// Unknown platform identifier or malformed options.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A step references a missing predecessor, or the step graph has a cycle.
    #[error("dependency error: {0}")]
    Dependency(String),

    /// Control operation referenced an unknown plan.
    #[error("migration plan not found: {plan_id}")]
    PlanNotFound {
        /// The ID that was looked up.
        plan_id: PlanId,
    },

    /// The scheduler found pending steps that can never become ready.
    #[error("deadlock in plan {plan_id}: {pending} pending step(s) but no step is ready ({steps})")]
    Deadlock {
        /// The affected plan.
        plan_id: PlanId,
        /// Number of steps left pending.
        pending: usize,
        /// Comma separated ids of the stuck steps.
        steps: String,
    },

    /// A step state change not permitted by the step state machine.
    #[error("invalid transition for step {step_id}: {from} -> {to}")]
    InvalidTransition {
        /// The step being transitioned.
        step_id: String,
        /// Current status.
        from: StepStatus,
        /// Requested status.
        to: StepStatus,
    },

    /// The plan already has an active scheduler.
    #[error("migration plan {plan_id} is already executing")]
    AlreadyRunning {
        /// The affected plan.
        plan_id: PlanId,
    },

    /// The operation is not valid for the plan's current state.
    #[error("cannot {operation} plan {plan_id}: {reason}")]
    InvalidState {
        /// The affected plan.
        plan_id: PlanId,
        /// The attempted operation.
        operation: &'static str,
        /// Why it was refused.
        reason: String,
    },

    /// An explicitly requested rollback failed.
    #[error("rollback failed for plan {plan_id}: {reason}")]
    Rollback {
        /// The affected plan.
        plan_id: PlanId,
        /// The reason rollback failed.
        reason: String,
    },
}

/// Convenience result alias.
pub type Result<T> = std::result::Result<T, MigrationError>;

/// Failure reported by a step handler.
///
/// The `retriable` flag decides whether the executor may invoke the handler
/// again; non-retriable failures are terminal regardless of remaining attempts.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct StepExecutionError {
    /// Human readable failure description.
    pub message: String,
    /// Whether another attempt may succeed.
    pub retriable: bool,
}

impl StepExecutionError {
    /// A transient failure that may succeed on retry.
    pub fn retriable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retriable: true,
        }
    }

    /// A terminal failure that must not be retried.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retriable: false,
        }
    }
}
