//! Registry of plans and their mutable run state.
//!
//! Every mutation of a plan's steps happens under that plan's mutex, whether
//! it comes from the scheduler task or from a control operation. The mutex is
//! a `parking_lot` one and is never held across an await point.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::error::{MigrationError, Result};
use crate::executor::StepOutcome;
use crate::plan::{MigrationPlan, PlanId, PlanStatus};
use crate::progress::RunEnd;

/// Mutable state of one plan.
pub(crate) struct PlanState {
    /// The plan record.
    pub(crate) plan: MigrationPlan,
    /// Dispatch is halted.
    pub(crate) paused: bool,
    /// A scheduler task is driving the plan.
    pub(crate) executing: bool,
    /// Outcomes that arrived while their step was paused, applied on
    /// re-dispatch instead of invoking the handler again.
    pub(crate) parked: HashMap<String, StepOutcome>,
}

/// A registered plan.
pub(crate) struct PlanEntry {
    state: Mutex<PlanState>,
    /// Cancelled by `cancel_migration`; observed by scheduler and handlers.
    pub(crate) cancel: CancellationToken,
    /// Wakes an idle scheduler after pause, resume or cancel.
    pub(crate) wake: Notify,
    /// Set by the scheduler once the run is over.
    pub(crate) ended: RunEnd,
}

impl PlanEntry {
    pub(crate) fn new(plan: MigrationPlan) -> Self {
        Self {
            state: Mutex::new(PlanState {
                plan,
                paused: false,
                executing: false,
                parked: HashMap::new(),
            }),
            cancel: CancellationToken::new(),
            wake: Notify::new(),
            ended: RunEnd::new(),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, PlanState> {
        self.state.lock()
    }
}

/// Summary row of [`PlanRegistry::list`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanSummary {
    /// Plan ID.
    pub plan_id: PlanId,
    /// Derived status.
    pub status: PlanStatus,
    /// Source platform identifier.
    pub source: String,
    /// Destination platform identifier.
    pub destination: String,
    /// Number of steps.
    pub total_steps: usize,
    /// Whether a scheduler is currently driving the plan.
    pub executing: bool,
}

/// Map of plan id to plan entry.
pub(crate) struct PlanRegistry {
    plans: DashMap<PlanId, Arc<PlanEntry>>,
}

impl PlanRegistry {
    pub(crate) fn new() -> Self {
        Self {
            plans: DashMap::new(),
        }
    }

    pub(crate) fn insert(&self, plan: MigrationPlan) -> Arc<PlanEntry> {
        let id = plan.id;
        let entry = Arc::new(PlanEntry::new(plan));
        self.plans.insert(id, entry.clone());
        entry
    }

    pub(crate) fn contains(&self, plan_id: PlanId) -> bool {
        self.plans.contains_key(&plan_id)
    }

    pub(crate) fn get(&self, plan_id: PlanId) -> Result<Arc<PlanEntry>> {
        self.plans
            .get(&plan_id)
            .map(|entry| entry.value().clone())
            .ok_or(MigrationError::PlanNotFound { plan_id })
    }

    /// Remove a plan unless a scheduler is driving it.
    pub(crate) fn remove(&self, plan_id: PlanId) -> Result<MigrationPlan> {
        let entry = self.get(plan_id)?;
        let plan = {
            let state = entry.lock();
            if state.executing {
                return Err(MigrationError::InvalidState {
                    plan_id,
                    operation: "remove",
                    reason: "plan is executing".to_string(),
                });
            }
            state.plan.clone()
        };
        self.plans.remove(&plan_id);
        Ok(plan)
    }

    pub(crate) fn list(&self) -> Vec<PlanSummary> {
        let mut rows: Vec<(chrono::DateTime<chrono::Utc>, PlanSummary)> = self
            .plans
            .iter()
            .map(|entry| {
                let state = entry.value().lock();
                (
                    state.plan.created_at,
                    PlanSummary {
                        plan_id: state.plan.id,
                        status: state.plan.status(),
                        source: state.plan.source.to_string(),
                        destination: state.plan.destination.to_string(),
                        total_steps: state.plan.steps.len(),
                        executing: state.executing,
                    },
                )
            })
            .collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.plan_id.cmp(&b.1.plan_id)));
        rows.into_iter().map(|(_, row)| row).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.plans.len()
    }
}
