//! Status snapshots.
//!
//! A snapshot is a pure function of the plan record: two snapshots taken
//! with no step mutation in between are identical. Elapsed time is therefore
//! measured up to the latest recorded transition, not up to "now".

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::plan::{MigrationPlan, PlanId, PlanStatus, Stage, StepStatus};
use crate::scheduler::percent;

/// Per-step part of a [`StatusSnapshot`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSnapshot {
    /// Step ID.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Stage.
    pub stage: Stage,
    /// Status.
    pub status: StepStatus,
    /// Progress percentage.
    pub progress: f64,
    /// Handler invocations so far.
    pub attempts: u32,
    /// When the step last started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the step finished.
    pub completed_at: Option<DateTime<Utc>>,
    /// Failure message.
    pub error: Option<String>,
}

/// Computed view of a plan's progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    /// Plan ID.
    pub plan_id: PlanId,
    /// Derived plan status.
    pub status: PlanStatus,
    /// Completed steps over total steps, as a percentage.
    pub progress: f64,
    /// Number of steps.
    pub total_steps: usize,
    /// Steps completed.
    pub completed_steps: usize,
    /// Steps failed.
    pub failed_steps: usize,
    /// Steps running.
    pub running_steps: usize,
    /// Steps pending.
    pub pending_steps: usize,
    /// Steps paused.
    pub paused_steps: usize,
    /// Steps cancelled.
    pub cancelled_steps: usize,
    /// Stage of the most recently started running step, else of the most
    /// recently completed step.
    pub current_stage: Option<Stage>,
    /// Time from the first step start to the latest recorded transition.
    #[serde(with = "crate::config::serde_duration_ms")]
    pub elapsed: Duration,
    /// Linear extrapolation of the remaining time.
    #[serde(with = "crate::config::serde_opt_duration_ms")]
    pub estimated_remaining: Option<Duration>,
    /// Scheduler fault, if the plan was aborted.
    pub error: Option<String>,
    /// Steps in declaration order.
    pub steps: Vec<StepSnapshot>,
}

impl StatusSnapshot {
    /// Compute a snapshot of `plan`.
    pub fn of(plan: &MigrationPlan) -> Self {
        let counts = plan.counts();
        let status = plan.status();
        let progress = percent(counts.completed, counts.total);
        let elapsed = elapsed(plan);

        Self {
            plan_id: plan.id,
            status,
            progress,
            total_steps: counts.total,
            completed_steps: counts.completed,
            failed_steps: counts.failed,
            running_steps: counts.running,
            pending_steps: counts.pending,
            paused_steps: counts.paused,
            cancelled_steps: counts.cancelled,
            current_stage: current_stage(plan),
            elapsed,
            estimated_remaining: estimate_remaining(plan, status, progress, elapsed),
            error: plan.fault.clone(),
            steps: plan
                .steps
                .iter()
                .map(|s| StepSnapshot {
                    id: s.id.clone(),
                    name: s.name.clone(),
                    stage: s.stage,
                    status: s.status,
                    progress: s.progress,
                    attempts: s.attempts,
                    started_at: s.started_at,
                    completed_at: s.completed_at,
                    error: s.error.clone(),
                })
                .collect(),
        }
    }

    /// Steps with the given status.
    pub fn steps_with_status(&self, status: StepStatus) -> impl Iterator<Item = &StepSnapshot> {
        self.steps.iter().filter(move |s| s.status == status)
    }
}

fn current_stage(plan: &MigrationPlan) -> Option<Stage> {
    let running = plan
        .steps
        .iter()
        .filter(|s| s.status == StepStatus::Running)
        .filter_map(|s| s.started_at.map(|t| (t, s.stage)))
        .max_by_key(|(t, _)| *t);
    if let Some((_, stage)) = running {
        return Some(stage);
    }

    plan.steps
        .iter()
        .filter(|s| s.status == StepStatus::Completed)
        .filter_map(|s| s.completed_at.map(|t| (t, s.stage)))
        .max_by_key(|(t, _)| *t)
        .map(|(_, stage)| stage)
}

fn elapsed(plan: &MigrationPlan) -> Duration {
    let first = plan.steps.iter().filter_map(|s| s.started_at).min();
    let last = plan
        .steps
        .iter()
        .flat_map(|s| [s.started_at, s.completed_at])
        .flatten()
        .max();
    match (first, last) {
        (Some(first), Some(last)) => (last - first).to_std().unwrap_or_default(),
        _ => Duration::ZERO,
    }
}

fn estimate_remaining(
    plan: &MigrationPlan,
    status: PlanStatus,
    progress: f64,
    elapsed: Duration,
) -> Option<Duration> {
    if status.is_terminal() {
        return Some(Duration::ZERO);
    }
    if progress > 0.0 && !elapsed.is_zero() {
        let total = elapsed.as_secs_f64() * 100.0 / progress;
        return Some(Duration::from_secs_f64((total - elapsed.as_secs_f64()).max(0.0)));
    }
    // Nothing observed yet: fall back to the advisory estimates.
    Some(
        plan.steps
            .iter()
            .filter(|s| !s.is_terminal())
            .map(|s| s.estimated_duration)
            .sum(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{MigrationStep, Platform};
    use chrono::TimeDelta;
    use serde_json::Map;

    fn chain() -> MigrationPlan {
        MigrationPlan::from_steps(
            Platform::WordPress,
            Platform::Hugo,
            "/src",
            "/dst",
            vec![
                MigrationStep::new("a", "A", Stage::Preparation)
                    .with_estimated_duration(Duration::from_secs(10)),
                MigrationStep::new("b", "B", Stage::Export)
                    .depends_on("a")
                    .with_estimated_duration(Duration::from_secs(20)),
                MigrationStep::new("c", "C", Stage::Import)
                    .depends_on("b")
                    .with_estimated_duration(Duration::from_secs(30)),
                MigrationStep::new("d", "D", Stage::Completion)
                    .depends_on("c")
                    .with_estimated_duration(Duration::from_secs(40)),
            ],
            Map::new(),
        )
        .unwrap()
    }

    #[test]
    fn test_fresh_plan() {
        let snapshot = StatusSnapshot::of(&chain());
        assert_eq!(snapshot.status, PlanStatus::Pending);
        assert_eq!(snapshot.progress, 0.0);
        assert_eq!(snapshot.pending_steps, 4);
        assert_eq!(snapshot.current_stage, None);
        assert_eq!(snapshot.elapsed, Duration::ZERO);
        assert_eq!(snapshot.estimated_remaining, Some(Duration::from_secs(100)));
    }

    #[test]
    fn test_progress_stage_and_eta() {
        let mut plan = chain();
        let t0 = Utc::now();

        plan.steps[0].start().unwrap();
        plan.steps[0].complete(None).unwrap();
        plan.steps[0].started_at = Some(t0);
        plan.steps[0].completed_at = Some(t0 + TimeDelta::seconds(60));
        plan.steps[1].start().unwrap();
        plan.steps[1].started_at = Some(t0 + TimeDelta::seconds(60));

        let snapshot = StatusSnapshot::of(&plan);
        assert_eq!(snapshot.status, PlanStatus::Running);
        assert_eq!(snapshot.progress, 25.0);
        assert_eq!(snapshot.current_stage, Some(Stage::Export));
        assert_eq!(snapshot.elapsed, Duration::from_secs(60));
        assert_eq!(snapshot.estimated_remaining, Some(Duration::from_secs(180)));
    }

    #[test]
    fn test_current_stage_falls_back_to_last_completed() {
        let mut plan = chain();
        plan.steps[0].start().unwrap();
        plan.steps[0].complete(None).unwrap();
        plan.steps[1].start().unwrap();
        plan.steps[1].cancel().unwrap();

        let snapshot = StatusSnapshot::of(&plan);
        assert_eq!(snapshot.status, PlanStatus::Cancelled);
        assert_eq!(snapshot.current_stage, Some(Stage::Preparation));
        assert_eq!(snapshot.estimated_remaining, Some(Duration::ZERO));
        assert_eq!(snapshot.steps_with_status(StepStatus::Cancelled).count(), 1);
    }

    #[test]
    fn test_snapshot_is_idempotent() {
        let mut plan = chain();
        plan.steps[0].start().unwrap();

        let first = StatusSnapshot::of(&plan);
        std::thread::sleep(Duration::from_millis(5));
        let second = StatusSnapshot::of(&plan);
        assert_eq!(first, second);
    }
}
