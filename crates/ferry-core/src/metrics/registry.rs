//! Orchestrator counters and their Prometheus export.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::histogram::Histogram;

/// Terminal outcome of a plan run, for metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanOutcome {
    /// Every step completed.
    Completed,
    /// A step failed or the scheduler aborted.
    Failed,
    /// The plan was cancelled.
    Cancelled,
}

/// Terminal outcome of a step, for metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcomeKind {
    /// Handler succeeded.
    Completed,
    /// Handler failed terminally.
    Failed,
    /// Step was cancelled.
    Cancelled,
}

/// Counters for every plan handled by one controller.
pub struct OrchestratorMetrics {
    started_at: Instant,

    // Plans
    plans_created: AtomicU64,
    plans_started: AtomicU64,
    plans_completed: AtomicU64,
    plans_failed: AtomicU64,
    plans_cancelled: AtomicU64,
    deadlocks: AtomicU64,

    // Steps
    steps_dispatched: AtomicU64,
    steps_completed: AtomicU64,
    steps_failed: AtomicU64,
    steps_cancelled: AtomicU64,
    step_duration: Histogram,

    // Attempts
    attempts: AtomicU64,
    retries: AtomicU64,
    timeouts: AtomicU64,
    panics: AtomicU64,

    // Events
    events_emitted: AtomicU64,
    events_lagged: AtomicU64,
    subscriber_panics: AtomicU64,
}

fn load(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl OrchestratorMetrics {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            plans_created: AtomicU64::new(0),
            plans_started: AtomicU64::new(0),
            plans_completed: AtomicU64::new(0),
            plans_failed: AtomicU64::new(0),
            plans_cancelled: AtomicU64::new(0),
            deadlocks: AtomicU64::new(0),
            steps_dispatched: AtomicU64::new(0),
            steps_completed: AtomicU64::new(0),
            steps_failed: AtomicU64::new(0),
            steps_cancelled: AtomicU64::new(0),
            step_duration: Histogram::step_duration(),
            attempts: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            panics: AtomicU64::new(0),
            events_emitted: AtomicU64::new(0),
            events_lagged: AtomicU64::new(0),
            subscriber_panics: AtomicU64::new(0),
        }
    }

    /// A plan was registered.
    pub fn record_plan_created(&self) {
        bump(&self.plans_created);
    }

    /// A scheduler started for a plan.
    pub fn record_plan_started(&self) {
        bump(&self.plans_started);
    }

    /// A scheduler finished.
    pub fn record_plan_finished(&self, outcome: PlanOutcome) {
        match outcome {
            PlanOutcome::Completed => bump(&self.plans_completed),
            PlanOutcome::Failed => bump(&self.plans_failed),
            PlanOutcome::Cancelled => bump(&self.plans_cancelled),
        }
    }

    /// The scheduler safety net aborted a plan.
    pub fn record_deadlock(&self) {
        bump(&self.deadlocks);
    }

    /// A step entered RUNNING.
    pub fn record_step_dispatched(&self) {
        bump(&self.steps_dispatched);
    }

    /// A step reached a terminal status after running for `elapsed`.
    pub fn record_step_finished(&self, outcome: StepOutcomeKind, elapsed: Duration) {
        match outcome {
            StepOutcomeKind::Completed => bump(&self.steps_completed),
            StepOutcomeKind::Failed => bump(&self.steps_failed),
            StepOutcomeKind::Cancelled => bump(&self.steps_cancelled),
        }
        self.step_duration.observe(elapsed.as_millis() as u64);
    }

    /// A handler was invoked.
    pub fn record_attempt(&self) {
        bump(&self.attempts);
    }

    /// A failed attempt will be retried.
    pub fn record_retry(&self) {
        bump(&self.retries);
    }

    /// An attempt hit the step timeout.
    pub fn record_timeout(&self) {
        bump(&self.timeouts);
    }

    /// A handler panicked.
    pub fn record_handler_panic(&self) {
        bump(&self.panics);
    }

    /// A progress event was published.
    pub fn record_event(&self) {
        bump(&self.events_emitted);
    }

    /// A stream consumer fell behind and lost `skipped` events.
    pub fn record_lagged(&self, skipped: u64) {
        self.events_lagged.fetch_add(skipped, Ordering::Relaxed);
    }

    /// A subscriber callback panicked.
    pub fn record_subscriber_panic(&self) {
        bump(&self.subscriber_panics);
    }

    /// Seconds since the registry was created.
    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// Plans registered.
    pub fn plans_created(&self) -> u64 {
        load(&self.plans_created)
    }

    /// Plans whose execution started.
    pub fn plans_started(&self) -> u64 {
        load(&self.plans_started)
    }

    /// Plans finished as completed.
    pub fn plans_completed(&self) -> u64 {
        load(&self.plans_completed)
    }

    /// Plans finished as failed.
    pub fn plans_failed(&self) -> u64 {
        load(&self.plans_failed)
    }

    /// Plans finished as cancelled.
    pub fn plans_cancelled(&self) -> u64 {
        load(&self.plans_cancelled)
    }

    /// Plans aborted by the deadlock safety net.
    pub fn deadlocks(&self) -> u64 {
        load(&self.deadlocks)
    }

    /// Steps moved to RUNNING.
    pub fn steps_dispatched(&self) -> u64 {
        load(&self.steps_dispatched)
    }

    /// Steps completed.
    pub fn steps_completed(&self) -> u64 {
        load(&self.steps_completed)
    }

    /// Steps failed.
    pub fn steps_failed(&self) -> u64 {
        load(&self.steps_failed)
    }

    /// Steps cancelled.
    pub fn steps_cancelled(&self) -> u64 {
        load(&self.steps_cancelled)
    }

    /// Handler invocations.
    pub fn attempts(&self) -> u64 {
        load(&self.attempts)
    }

    /// Retries scheduled.
    pub fn retries(&self) -> u64 {
        load(&self.retries)
    }

    /// Attempts that timed out.
    pub fn timeouts(&self) -> u64 {
        load(&self.timeouts)
    }

    /// Handler panics.
    pub fn handler_panics(&self) -> u64 {
        load(&self.panics)
    }

    /// Events published.
    pub fn events_emitted(&self) -> u64 {
        load(&self.events_emitted)
    }

    /// Events dropped for slow stream consumers.
    pub fn events_lagged(&self) -> u64 {
        load(&self.events_lagged)
    }

    /// Subscriber callback panics.
    pub fn subscriber_panics(&self) -> u64 {
        load(&self.subscriber_panics)
    }

    /// Step duration histogram.
    pub fn step_duration(&self) -> &Histogram {
        &self.step_duration
    }

    /// Export to Prometheus text format.
    pub fn to_prometheus(&self) -> String {
        let mut out = String::new();

        gauge(&mut out, "ferry_uptime_seconds", "Orchestrator uptime in seconds", self.uptime_secs());

        counter(&mut out, "ferry_plans_created_total", "Migration plans registered", self.plans_created());
        counter(&mut out, "ferry_plans_started_total", "Migration plans whose execution started", self.plans_started());
        counter(&mut out, "ferry_plans_completed_total", "Migration plans that completed", self.plans_completed());
        counter(&mut out, "ferry_plans_failed_total", "Migration plans that failed", self.plans_failed());
        counter(&mut out, "ferry_plans_cancelled_total", "Migration plans that were cancelled", self.plans_cancelled());
        counter(&mut out, "ferry_deadlocks_total", "Plans aborted because no pending step could become ready", self.deadlocks());

        counter(&mut out, "ferry_steps_dispatched_total", "Steps moved to running", self.steps_dispatched());
        counter(&mut out, "ferry_steps_completed_total", "Steps that completed", self.steps_completed());
        counter(&mut out, "ferry_steps_failed_total", "Steps that failed", self.steps_failed());
        counter(&mut out, "ferry_steps_cancelled_total", "Steps that were cancelled", self.steps_cancelled());

        counter(&mut out, "ferry_step_attempts_total", "Step handler invocations", self.attempts());
        counter(&mut out, "ferry_step_retries_total", "Step retries scheduled", self.retries());
        counter(&mut out, "ferry_step_timeouts_total", "Step attempts that timed out", self.timeouts());
        counter(&mut out, "ferry_handler_panics_total", "Step handler panics", self.handler_panics());

        counter(&mut out, "ferry_events_total", "Progress events published", self.events_emitted());
        counter(&mut out, "ferry_events_lagged_total", "Progress events dropped for slow stream consumers", self.events_lagged());
        counter(&mut out, "ferry_subscriber_panics_total", "Progress subscriber callback panics", self.subscriber_panics());

        let _ = writeln!(out, "# HELP ferry_step_duration_ms Step run time in milliseconds");
        let _ = writeln!(out, "# TYPE ferry_step_duration_ms histogram");
        for (bound, count) in self.step_duration.cumulative() {
            let _ = writeln!(out, "ferry_step_duration_ms_bucket{{le=\"{}\"}} {}", bound, count);
        }
        let _ = writeln!(
            out,
            "ferry_step_duration_ms_bucket{{le=\"+Inf\"}} {}",
            self.step_duration.count()
        );
        let _ = writeln!(out, "ferry_step_duration_ms_sum {}", self.step_duration.sum());
        let _ = writeln!(out, "ferry_step_duration_ms_count {}", self.step_duration.count());

        out
    }
}

fn counter(out: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP {} {}", name, help);
    let _ = writeln!(out, "# TYPE {} counter", name);
    let _ = writeln!(out, "{} {}\n", name, value);
}

fn gauge(out: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP {} {}", name, help);
    let _ = writeln!(out, "# TYPE {} gauge", name);
    let _ = writeln!(out, "{} {}\n", name, value);
}

impl Default for OrchestratorMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared metrics handle.
pub type SharedOrchestratorMetrics = Arc<OrchestratorMetrics>;

/// Create a shared metrics registry.
pub fn new_shared_metrics() -> SharedOrchestratorMetrics {
    Arc::new(OrchestratorMetrics::new())
}
