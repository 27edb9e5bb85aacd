//! Ferry Core - Migration orchestration engine.
//!
//! Builds staged migration plans for platform pairs, runs their steps in
//! dependency order with bounded concurrency, retries and cooperative
//! cancellation, and reports progress as events and status snapshots.

pub mod capability;
pub mod config;
pub mod controller;
pub mod error;
pub mod executor;
pub mod handler;
pub mod metrics;
pub mod plan;
pub mod progress;
pub mod status;

mod registry;
mod scheduler;

pub use config::OrchestratorConfig;
pub use controller::OrchestrationController;
pub use error::{MigrationError, Result, StepExecutionError};
pub use executor::{RetryPolicy, StepExecutor, StepOutcome};
pub use handler::{
    handler_fn, FnHandler, HandlerRegistry, HandlerResult, NoopHandler, SharedHandler,
    SimulatedHandler, StepContext, StepHandler,
};
pub use plan::{
    generate_plan_id, MigrationPlan, MigrationStep, PlanBuilder, PlanId, PlanInfo, PlanOptions,
    PlanStatus, Platform, Stage, StepCounts, StepStatus,
};
pub use progress::{
    EventKind, ProgressEmitter, ProgressEvent, ProgressReporter, ProgressStream, SubscriptionId,
};
pub use registry::PlanSummary;
pub use status::{StatusSnapshot, StepSnapshot};

// Capability exports
pub use capability::{
    BackupProvider, BackupRecord, BackupStepHandler, HealthCheck, HealthCheckHandler,
    HealthReport, PlatformAdapter, PlatformOperation, PlatformStepHandler, BACKUP_STEP_ID,
};

// Metrics exports
pub use metrics::{new_shared_metrics, Histogram, OrchestratorMetrics, SharedOrchestratorMetrics};
