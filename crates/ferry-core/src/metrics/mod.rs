//! Orchestrator metrics.
//!
//! Plan and step counters, a step-duration histogram, and progress event
//! delivery statistics. All counters are atomics, so a shared handle can be
//! updated from scheduler tasks without locking.
//!
//! # Usage
//!
//! ```ignore
//! use ferry_core::metrics::{new_shared_metrics, StepOutcomeKind};
//!
//! let metrics = new_shared_metrics();
//! metrics.record_step_dispatched();
//! metrics.record_step_finished(StepOutcomeKind::Completed, elapsed);
//!
//! let prometheus_text = metrics.to_prometheus();
//! ```

mod histogram;
mod registry;

pub use histogram::Histogram;
pub use registry::{
    new_shared_metrics, OrchestratorMetrics, PlanOutcome, SharedOrchestratorMetrics,
    StepOutcomeKind,
};
