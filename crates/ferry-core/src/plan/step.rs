//! Migration steps, stages and the step state machine.

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{MigrationError, Result};

/// Coarse phase a step belongs to.
///
/// Variants are declared in skeleton order, so `Ord` follows the order in
/// which stages run in a built plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Working directories, metadata.
    Preparation,
    /// Source analysis and destination checks.
    Validation,
    /// Safety copy of the source.
    Backup,
    /// Data extraction from the source.
    Export,
    /// Format conversion between platforms.
    Transform,
    /// Loading into the destination.
    Import,
    /// Destination settings.
    Configuration,
    /// Health and integrity checks.
    Verification,
    /// Temporary file removal.
    Cleanup,
    /// Final bookkeeping.
    Completion,
}

impl Stage {
    /// All stages in skeleton order.
    pub const ALL: [Stage; 10] = [
        Stage::Preparation,
        Stage::Validation,
        Stage::Backup,
        Stage::Export,
        Stage::Transform,
        Stage::Import,
        Stage::Configuration,
        Stage::Verification,
        Stage::Cleanup,
        Stage::Completion,
    ];

    /// Stable lowercase name, also used as the step id prefix.
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Preparation => "preparation",
            Stage::Validation => "validation",
            Stage::Backup => "backup",
            Stage::Export => "export",
            Stage::Transform => "transform",
            Stage::Import => "import",
            Stage::Configuration => "configuration",
            Stage::Verification => "verification",
            Stage::Cleanup => "cleanup",
            Stage::Completion => "completion",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a single step.
///
/// ```text
/// PENDING -> RUNNING -> COMPLETED | FAILED
/// RUNNING -> PAUSED -> PENDING
/// PENDING | RUNNING | PAUSED -> CANCELLED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Waiting for predecessors or for a dispatch slot.
    Pending,
    /// Handler invocation in progress.
    Running,
    /// Was running when the plan was paused.
    Paused,
    /// Finished successfully.
    Completed,
    /// Finished with a terminal failure.
    Failed,
    /// Cancelled before finishing.
    Cancelled,
}

impl StepStatus {
    /// Terminal statuses never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::Failed | StepStatus::Cancelled
        )
    }

    /// Check the step state machine.
    pub fn can_transition_to(self, next: StepStatus) -> bool {
        use StepStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Paused)
                | (Paused, Pending)
                | (Pending, Cancelled)
                | (Running, Cancelled)
                | (Paused, Cancelled)
        )
    }

    /// Stable lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Paused => "paused",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One atomic unit of work in a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationStep {
    /// Identifier, unique within the plan.
    pub id: String,
    /// Short display name.
    pub name: String,
    /// Stage this step belongs to.
    pub stage: Stage,
    /// Longer description.
    pub description: String,
    /// Advisory duration estimate, only used for ETA reporting.
    #[serde(with = "crate::config::serde_duration_ms")]
    pub estimated_duration: Duration,
    /// Ids of steps that must complete before this one may run.
    pub depends_on: BTreeSet<String>,
    /// Current status.
    pub status: StepStatus,
    /// When the step last entered RUNNING.
    pub started_at: Option<DateTime<Utc>>,
    /// When the step reached a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
    /// Progress percentage (0-100).
    pub progress: f64,
    /// Error message if the step failed.
    pub error: Option<String>,
    /// Payload returned by the handler on success.
    pub result: Option<Value>,
    /// Number of handler invocations so far.
    pub attempts: u32,
}

impl MigrationStep {
    /// Create a pending step with no predecessors.
    pub fn new(id: impl Into<String>, name: impl Into<String>, stage: Stage) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            stage,
            description: String::new(),
            estimated_duration: Duration::ZERO,
            depends_on: BTreeSet::new(),
            status: StepStatus::Pending,
            started_at: None,
            completed_at: None,
            progress: 0.0,
            error: None,
            result: None,
            attempts: 0,
        }
    }

    /// Set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set the advisory duration estimate.
    pub fn with_estimated_duration(mut self, duration: Duration) -> Self {
        self.estimated_duration = duration;
        self
    }

    /// Add a predecessor.
    pub fn depends_on(mut self, step_id: impl Into<String>) -> Self {
        self.depends_on.insert(step_id.into());
        self
    }

    /// Add several predecessors.
    pub fn with_dependencies<I, S>(mut self, step_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(step_ids.into_iter().map(Into::into));
        self
    }

    /// Check if the step is in a terminal status.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    fn transition(&mut self, next: StepStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(MigrationError::InvalidTransition {
                step_id: self.id.clone(),
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// PENDING -> RUNNING.
    pub fn start(&mut self) -> Result<()> {
        self.transition(StepStatus::Running)?;
        self.started_at = Some(Utc::now());
        self.error = None;
        Ok(())
    }

    /// RUNNING -> COMPLETED.
    pub fn complete(&mut self, result: Option<Value>) -> Result<()> {
        self.transition(StepStatus::Completed)?;
        self.completed_at = Some(Utc::now());
        self.progress = 100.0;
        self.result = result;
        Ok(())
    }

    /// RUNNING -> FAILED.
    pub fn fail(&mut self, error: impl Into<String>) -> Result<()> {
        self.transition(StepStatus::Failed)?;
        self.completed_at = Some(Utc::now());
        self.error = Some(error.into());
        Ok(())
    }

    /// RUNNING -> PAUSED.
    pub fn pause(&mut self) -> Result<()> {
        self.transition(StepStatus::Paused)
    }

    /// PAUSED -> PENDING.
    pub fn requeue(&mut self) -> Result<()> {
        self.transition(StepStatus::Pending)
    }

    /// Any non-terminal status -> CANCELLED.
    pub fn cancel(&mut self) -> Result<()> {
        self.transition(StepStatus::Cancelled)?;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Record intermediate progress while running.
    pub fn set_progress(&mut self, percent: f64) {
        if self.status == StepStatus::Running {
            self.progress = percent.clamp(0.0, 100.0);
        }
    }
}
