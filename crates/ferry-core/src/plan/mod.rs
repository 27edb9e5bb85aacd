//! Migration plans: the step graph and its derived state.
//!
//! A [`MigrationPlan`] is an acyclic graph of [`MigrationStep`]s. Steps are
//! kept in declaration order, which is only used as a tie-break between
//! equally ready steps; execution order follows the predecessor edges.
//!
//! Plan-level status is never stored. [`MigrationPlan::status`] derives it
//! from the step statuses every time it is asked.

mod builder;
mod platform;
mod step;

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{MigrationError, Result};

pub use builder::{PlanBuilder, PlanOptions};
pub use platform::Platform;
pub use step::{MigrationStep, Stage, StepStatus};

/// Identifier of a registered plan.
pub type PlanId = Uuid;

/// Generate a fresh plan ID.
pub fn generate_plan_id() -> PlanId {
    Uuid::new_v4()
}

/// Overall status of a plan, derived from its steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    /// No step has started yet.
    Pending,
    /// Steps are running or more steps can still be dispatched.
    Running,
    /// Execution halted by a pause request.
    Paused,
    /// Every step completed.
    Completed,
    /// A step failed terminally, or the scheduler aborted the plan.
    Failed,
    /// The plan was cancelled.
    Cancelled,
}

impl PlanStatus {
    /// Terminal plans never make further progress.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PlanStatus::Completed | PlanStatus::Failed | PlanStatus::Cancelled
        )
    }
}

impl std::fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlanStatus::Pending => write!(f, "pending"),
            PlanStatus::Running => write!(f, "running"),
            PlanStatus::Paused => write!(f, "paused"),
            PlanStatus::Completed => write!(f, "completed"),
            PlanStatus::Failed => write!(f, "failed"),
            PlanStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Per-status step counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepCounts {
    /// Total steps in the plan.
    pub total: usize,
    /// Steps waiting to run.
    pub pending: usize,
    /// Steps currently running.
    pub running: usize,
    /// Steps paused mid-run.
    pub paused: usize,
    /// Steps completed.
    pub completed: usize,
    /// Steps failed.
    pub failed: usize,
    /// Steps cancelled.
    pub cancelled: usize,
}

/// Read-only description of a plan handed to step handlers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanInfo {
    /// Plan ID.
    pub id: PlanId,
    /// Source platform.
    pub source: Platform,
    /// Destination platform.
    pub destination: Platform,
    /// Source location.
    pub source_path: String,
    /// Destination location.
    pub destination_path: String,
    /// Free-form metadata.
    pub metadata: Map<String, Value>,
}

/// One concrete dependency graph of steps for a single migration attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationPlan {
    /// Unique plan ID.
    pub id: PlanId,
    /// Source platform.
    pub source: Platform,
    /// Destination platform.
    pub destination: Platform,
    /// Source location.
    pub source_path: String,
    /// Destination location.
    pub destination_path: String,
    /// Steps in declaration order.
    pub steps: Vec<MigrationStep>,
    /// Sum of the steps' advisory estimates.
    #[serde(with = "crate::config::serde_duration_ms")]
    pub estimated_duration: Duration,
    /// Free-form metadata (resolved options, caller extras).
    pub metadata: Map<String, Value>,
    /// When the plan was created.
    pub created_at: DateTime<Utc>,
    /// Diagnostic recorded when the scheduler aborted the plan.
    pub fault: Option<String>,
}

impl MigrationPlan {
    /// Build a plan from caller supplied steps.
    ///
    /// Fails with [`MigrationError::Dependency`] if a predecessor is missing,
    /// a step id is duplicated, or the graph has a cycle.
    pub fn from_steps(
        source: Platform,
        destination: Platform,
        source_path: impl Into<String>,
        destination_path: impl Into<String>,
        steps: Vec<MigrationStep>,
        metadata: Map<String, Value>,
    ) -> Result<Self> {
        let estimated_duration = steps.iter().map(|s| s.estimated_duration).sum();
        let plan = Self {
            id: generate_plan_id(),
            source,
            destination,
            source_path: source_path.into(),
            destination_path: destination_path.into(),
            steps,
            estimated_duration,
            metadata,
            created_at: Utc::now(),
            fault: None,
        };
        plan.validate()?;
        Ok(plan)
    }

    /// Check structural soundness of the step graph.
    pub fn validate(&self) -> Result<()> {
        if self.steps.is_empty() {
            return Err(MigrationError::Configuration(
                "migration plan has no steps".to_string(),
            ));
        }

        let mut seen = HashSet::with_capacity(self.steps.len());
        for step in &self.steps {
            if !seen.insert(step.id.as_str()) {
                return Err(MigrationError::Dependency(format!(
                    "duplicate step id '{}'",
                    step.id
                )));
            }
        }

        for step in &self.steps {
            for dep in &step.depends_on {
                if dep == &step.id {
                    return Err(MigrationError::Dependency(format!(
                        "step '{}' depends on itself",
                        step.id
                    )));
                }
                if !seen.contains(dep.as_str()) {
                    return Err(MigrationError::Dependency(format!(
                        "step '{}' depends on unknown step '{}'",
                        step.id, dep
                    )));
                }
            }
        }

        self.topological_order().map(|_| ())
    }

    /// Topological order of step indices (Kahn's algorithm).
    ///
    /// Ties are broken by declaration order. Fails if the graph has a cycle.
    pub fn topological_order(&self) -> Result<Vec<usize>> {
        let index = self.index();
        let mut in_degree = vec![0usize; self.steps.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); self.steps.len()];

        for (idx, step) in self.steps.iter().enumerate() {
            for dep in &step.depends_on {
                let Some(&dep_idx) = index.get(dep.as_str()) else {
                    return Err(MigrationError::Dependency(format!(
                        "step '{}' depends on unknown step '{}'",
                        step.id, dep
                    )));
                };
                in_degree[idx] += 1;
                dependents[dep_idx].push(idx);
            }
        }

        let mut queue: VecDeque<usize> = (0..self.steps.len())
            .filter(|&idx| in_degree[idx] == 0)
            .collect();
        let mut order = Vec::with_capacity(self.steps.len());

        while let Some(idx) = queue.pop_front() {
            order.push(idx);
            for &next in &dependents[idx] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    queue.push_back(next);
                }
            }
        }

        if order.len() != self.steps.len() {
            let cyclic: Vec<&str> = (0..self.steps.len())
                .filter(|&idx| in_degree[idx] > 0)
                .map(|idx| self.steps[idx].id.as_str())
                .collect();
            return Err(MigrationError::Dependency(format!(
                "dependency cycle among steps: {}",
                cyclic.join(", ")
            )));
        }

        Ok(order)
    }

    fn index(&self) -> HashMap<&str, usize> {
        self.steps
            .iter()
            .enumerate()
            .map(|(idx, step)| (step.id.as_str(), idx))
            .collect()
    }

    /// Get a step by ID.
    pub fn step(&self, step_id: &str) -> Option<&MigrationStep> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    /// Get a step by ID (mutable).
    pub fn step_mut(&mut self, step_id: &str) -> Option<&mut MigrationStep> {
        self.steps.iter_mut().find(|s| s.id == step_id)
    }

    /// Position of a step in declaration order.
    pub fn step_index(&self, step_id: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.id == step_id)
    }

    /// Steps belonging to a stage, in declaration order.
    pub fn steps_in_stage(&self, stage: Stage) -> Vec<&MigrationStep> {
        self.steps.iter().filter(|s| s.stage == stage).collect()
    }

    /// Indices of PENDING steps whose predecessors are all COMPLETED,
    /// in declaration order.
    pub fn frontier(&self) -> Vec<usize> {
        let status: HashMap<&str, StepStatus> = self
            .steps
            .iter()
            .map(|s| (s.id.as_str(), s.status))
            .collect();

        self.steps
            .iter()
            .enumerate()
            .filter(|(_, step)| step.status == StepStatus::Pending)
            .filter(|(_, step)| {
                step.depends_on
                    .iter()
                    .all(|dep| status.get(dep.as_str()) == Some(&StepStatus::Completed))
            })
            .map(|(idx, _)| idx)
            .collect()
    }

    /// Indices of PENDING steps that can never run because a predecessor,
    /// directly or transitively, failed or was cancelled.
    pub fn blocked_steps(&self) -> HashSet<usize> {
        let index = self.index();
        let mut dead: HashSet<usize> = self
            .steps
            .iter()
            .enumerate()
            .filter(|(_, s)| matches!(s.status, StepStatus::Failed | StepStatus::Cancelled))
            .map(|(idx, _)| idx)
            .collect();
        let mut blocked = HashSet::new();

        loop {
            let mut changed = false;
            for (idx, step) in self.steps.iter().enumerate() {
                if step.status != StepStatus::Pending || blocked.contains(&idx) {
                    continue;
                }
                let hit = step
                    .depends_on
                    .iter()
                    .filter_map(|dep| index.get(dep.as_str()))
                    .any(|dep_idx| dead.contains(dep_idx));
                if hit {
                    blocked.insert(idx);
                    dead.insert(idx);
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }

        blocked
    }

    /// Ids of every step that transitively depends on `step_id`.
    pub fn dependents_of(&self, step_id: &str) -> Vec<&str> {
        let mut reached: HashSet<&str> = HashSet::new();
        let mut queue = VecDeque::from([step_id]);

        while let Some(current) = queue.pop_front() {
            for step in &self.steps {
                if step.depends_on.contains(current) && reached.insert(step.id.as_str()) {
                    queue.push_back(step.id.as_str());
                }
            }
        }

        self.steps
            .iter()
            .map(|s| s.id.as_str())
            .filter(|id| reached.contains(id))
            .collect()
    }

    /// Ids of every step `step_id` transitively depends on, in declaration
    /// order.
    pub fn ancestors_of(&self, step_id: &str) -> Vec<&str> {
        let mut reached: HashSet<&str> = HashSet::new();
        let mut queue: VecDeque<&str> = VecDeque::from([step_id]);

        while let Some(current) = queue.pop_front() {
            let Some(step) = self.step(current) else {
                continue;
            };
            for dep in &step.depends_on {
                if reached.insert(dep.as_str()) {
                    queue.push_back(dep.as_str());
                }
            }
        }

        self.steps
            .iter()
            .map(|s| s.id.as_str())
            .filter(|id| reached.contains(id))
            .collect()
    }

    /// Count steps per status.
    pub fn counts(&self) -> StepCounts {
        let mut counts = StepCounts {
            total: self.steps.len(),
            ..StepCounts::default()
        };
        for step in &self.steps {
            match step.status {
                StepStatus::Pending => counts.pending += 1,
                StepStatus::Running => counts.running += 1,
                StepStatus::Paused => counts.paused += 1,
                StepStatus::Completed => counts.completed += 1,
                StepStatus::Failed => counts.failed += 1,
                StepStatus::Cancelled => counts.cancelled += 1,
            }
        }
        counts
    }

    /// Derive the plan status from the step statuses.
    pub fn status(&self) -> PlanStatus {
        if self.fault.is_some() {
            return PlanStatus::Failed;
        }

        let counts = self.counts();
        if counts.completed == counts.total {
            PlanStatus::Completed
        } else if counts.cancelled > 0 {
            PlanStatus::Cancelled
        } else if counts.running > 0 {
            PlanStatus::Running
        } else if counts.paused > 0 {
            PlanStatus::Paused
        } else if counts.failed > 0 {
            // Independent branches may still be dispatchable.
            if self.frontier().is_empty() {
                PlanStatus::Failed
            } else {
                PlanStatus::Running
            }
        } else if counts.pending == counts.total {
            PlanStatus::Pending
        } else {
            PlanStatus::Running
        }
    }

    /// Read-only view for handlers.
    pub fn info(&self) -> PlanInfo {
        PlanInfo {
            id: self.id,
            source: self.source,
            destination: self.destination,
            source_path: self.source_path.clone(),
            destination_path: self.destination_path.clone(),
            metadata: self.metadata.clone(),
        }
    }

    /// Content hash of the plan graph.
    ///
    /// Covers platforms, locations and every step's id, stage and
    /// predecessors. Plans built from identical inputs share a fingerprint
    /// even though their IDs differ.
    pub fn fingerprint(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.source.as_str().as_bytes());
        hasher.update(b"\0");
        hasher.update(self.destination.as_str().as_bytes());
        hasher.update(b"\0");
        hasher.update(self.source_path.as_bytes());
        hasher.update(b"\0");
        hasher.update(self.destination_path.as_bytes());

        for step in &self.steps {
            hasher.update(b"\n");
            hasher.update(step.id.as_bytes());
            hasher.update(b"@");
            hasher.update(step.stage.as_str().as_bytes());
            for dep in &step.depends_on {
                hasher.update(b"<");
                hasher.update(dep.as_bytes());
            }
        }

        hex::encode(hasher.finalize().as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(id: &str, deps: &[&str]) -> MigrationStep {
        MigrationStep::new(id, id.to_uppercase(), Stage::Export).with_dependencies(deps.iter().copied())
    }

    fn plan(steps: Vec<MigrationStep>) -> Result<MigrationPlan> {
        MigrationPlan::from_steps(
            Platform::WordPress,
            Platform::Ghost,
            "/src",
            "/dst",
            steps,
            Map::new(),
        )
    }

    #[test]
    fn test_topological_order_respects_edges() {
        let plan = plan(vec![
            step("d", &["b", "c"]),
            step("b", &["a"]),
            step("c", &["a"]),
            step("a", &[]),
        ])
        .unwrap();

        let order: Vec<&str> = plan
            .topological_order()
            .unwrap()
            .into_iter()
            .map(|idx| plan.steps[idx].id.as_str())
            .collect();
        assert_eq!(order, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let err = plan(vec![step("a", &[]), step("b", &["missing"])]).unwrap_err();
        assert!(matches!(err, MigrationError::Dependency(_)));
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn test_cycle_rejected() {
        let err = plan(vec![step("a", &["c"]), step("b", &["a"]), step("c", &["b"])]).unwrap_err();
        assert!(matches!(err, MigrationError::Dependency(_)));
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_self_dependency_and_duplicates_rejected() {
        assert!(matches!(
            plan(vec![step("a", &["a"])]),
            Err(MigrationError::Dependency(_))
        ));
        assert!(matches!(
            plan(vec![step("a", &[]), step("a", &[])]),
            Err(MigrationError::Dependency(_))
        ));
    }

    #[test]
    fn test_empty_plan_rejected() {
        assert!(matches!(plan(vec![]), Err(MigrationError::Configuration(_))));
    }

    #[test]
    fn test_frontier_follows_completion() {
        let mut plan = plan(vec![step("a", &[]), step("b", &["a"]), step("c", &["a"])]).unwrap();
        assert_eq!(plan.frontier(), vec![0]);

        plan.steps[0].start().unwrap();
        assert!(plan.frontier().is_empty());

        plan.steps[0].complete(None).unwrap();
        assert_eq!(plan.frontier(), vec![1, 2]);
    }

    #[test]
    fn test_blocked_steps_propagate_transitively() {
        let mut plan = plan(vec![
            step("a", &[]),
            step("b", &["a"]),
            step("c", &["b"]),
            step("d", &[]),
        ])
        .unwrap();
        plan.steps[0].start().unwrap();
        plan.steps[0].fail("boom").unwrap();

        let blocked = plan.blocked_steps();
        assert!(blocked.contains(&1));
        assert!(blocked.contains(&2));
        assert!(!blocked.contains(&3));
        assert_eq!(plan.dependents_of("a"), vec!["b", "c"]);
        assert_eq!(plan.ancestors_of("c"), vec!["a", "b"]);
        assert!(plan.ancestors_of("d").is_empty());
    }

    #[test]
    fn test_derived_status() {
        let mut plan = plan(vec![step("a", &[]), step("b", &["a"])]).unwrap();
        assert_eq!(plan.status(), PlanStatus::Pending);

        plan.steps[0].start().unwrap();
        assert_eq!(plan.status(), PlanStatus::Running);

        plan.steps[0].pause().unwrap();
        assert_eq!(plan.status(), PlanStatus::Paused);

        plan.steps[0].requeue().unwrap();
        plan.steps[0].start().unwrap();
        plan.steps[0].complete(None).unwrap();
        assert_eq!(plan.status(), PlanStatus::Running);

        plan.steps[1].start().unwrap();
        plan.steps[1].fail("boom").unwrap();
        assert_eq!(plan.status(), PlanStatus::Failed);

        let mut faulted = plan.clone();
        faulted.fault = Some("deadlock".to_string());
        assert_eq!(faulted.status(), PlanStatus::Failed);
    }

    #[test]
    fn test_failure_with_ready_branch_is_still_running() {
        let mut plan = plan(vec![
            step("a", &[]),
            step("b", &["a"]),
            step("x", &[]),
            step("y", &["x"]),
        ])
        .unwrap();
        plan.steps[0].start().unwrap();
        plan.steps[0].fail("boom").unwrap();
        plan.steps[2].start().unwrap();
        plan.steps[2].complete(None).unwrap();

        // "y" is ready, so progress is still possible.
        assert_eq!(plan.frontier(), vec![3]);
        assert_eq!(plan.status(), PlanStatus::Running);
        assert!(!plan.status().is_terminal());

        plan.steps[3].start().unwrap();
        plan.steps[3].complete(None).unwrap();
        assert_eq!(plan.status(), PlanStatus::Failed);
    }

    #[test]
    fn test_steps_in_stage() {
        let plan = MigrationPlan::from_steps(
            Platform::WordPress,
            Platform::Ghost,
            "/src",
            "/dst",
            vec![
                MigrationStep::new("backup", "Backup", Stage::Backup),
                MigrationStep::new("posts", "Posts", Stage::Export).with_dependencies(["backup"]),
                MigrationStep::new("media", "Media", Stage::Export).with_dependencies(["backup"]),
            ],
            Map::new(),
        )
        .unwrap();

        let ids: Vec<&str> = plan
            .steps_in_stage(Stage::Export)
            .into_iter()
            .map(|s| s.id.as_str())
            .collect();
        assert_eq!(ids, vec!["posts", "media"]);
        assert!(plan.steps_in_stage(Stage::Import).is_empty());
    }

    #[test]
    fn test_cancelled_status_wins_over_pending() {
        let mut plan = plan(vec![step("a", &[]), step("b", &["a"])]).unwrap();
        plan.steps[0].start().unwrap();
        plan.steps[0].complete(None).unwrap();
        plan.steps[1].cancel().unwrap();
        assert_eq!(plan.status(), PlanStatus::Cancelled);
        assert!(plan.status().is_terminal());
    }

    #[test]
    fn test_fingerprint_ignores_identity() {
        let a = plan(vec![step("a", &[]), step("b", &["a"])]).unwrap();
        let b = plan(vec![step("a", &[]), step("b", &["a"])]).unwrap();
        let c = plan(vec![step("a", &[]), step("b", &[])]).unwrap();

        assert_ne!(a.id, b.id);
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
        assert_eq!(a.fingerprint().len(), 64);
    }
}
