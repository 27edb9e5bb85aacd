//! Progress events and their delivery.
//!
//! Every plan or step transition becomes a [`ProgressEvent`]. The
//! [`ProgressEmitter`] delivers each event two ways:
//!
//! - to callback subscribers, through an unbounded queue drained by a
//!   dedicated dispatcher task, so a slow or panicking callback never blocks
//!   or aborts the scheduler;
//! - to [`ProgressStream`]s, through a bounded broadcast channel. A consumer
//!   that falls more than `event_buffer` events behind loses the oldest ones.
//!
//! Emitting never awaits, so callers may emit while holding a plan lock. That
//! keeps event order identical to transition order.
//!
//! A stream also watches its plan's [`RunEnd`]. If the `PlanFinished` event
//! itself is dropped by a lagging consumer, the stream still ends, and yields
//! the retained copy last.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{BoxStream, Stream, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::metrics::SharedOrchestratorMetrics;
use crate::plan::{MigrationStep, PlanId, PlanStatus, StepStatus};

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// The scheduler started driving the plan.
    PlanStarted,
    /// A step entered RUNNING.
    StepStarted,
    /// A running step reported intermediate progress.
    StepProgress,
    /// A step attempt failed and will be retried.
    StepRetrying,
    /// A step completed.
    StepCompleted,
    /// A step failed terminally.
    StepFailed,
    /// A running step was paused.
    StepPaused,
    /// A paused step went back to PENDING.
    StepResumed,
    /// A step was cancelled.
    StepCancelled,
    /// The plan was paused.
    PlanPaused,
    /// The plan was resumed.
    PlanResumed,
    /// The plan was cancelled.
    PlanCancelled,
    /// An explicit rollback was performed.
    PlanRolledBack,
    /// The scheduler stopped driving the plan. Always the last event of a run.
    PlanFinished,
}

impl EventKind {
    /// Whether the event is a terminal event for its step.
    pub fn is_step_terminal(self) -> bool {
        matches!(
            self,
            EventKind::StepCompleted | EventKind::StepFailed | EventKind::StepCancelled
        )
    }
}

/// A single progress notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// Plan the event belongs to.
    pub plan_id: PlanId,
    /// Step the event belongs to, if it is a step event.
    pub step_id: Option<String>,
    /// Event kind.
    pub kind: EventKind,
    /// Step status after the transition (step events).
    pub status: Option<StepStatus>,
    /// Derived plan status after the transition (plan events).
    pub plan_status: Option<PlanStatus>,
    /// Human readable message.
    pub message: String,
    /// When the event was produced.
    pub timestamp: DateTime<Utc>,
    /// Progress percentage: the step's for step events, the plan's otherwise.
    pub progress: Option<f64>,
    /// Error message, if any.
    pub error: Option<String>,
}

impl ProgressEvent {
    /// A plan-level event.
    pub fn plan(
        plan_id: PlanId,
        kind: EventKind,
        plan_status: PlanStatus,
        message: impl Into<String>,
    ) -> Self {
        Self {
            plan_id,
            step_id: None,
            kind,
            status: None,
            plan_status: Some(plan_status),
            message: message.into(),
            timestamp: Utc::now(),
            progress: None,
            error: None,
        }
    }

    /// A step-level event reflecting the step's current record.
    pub fn step(
        plan_id: PlanId,
        step: &MigrationStep,
        kind: EventKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            plan_id,
            step_id: Some(step.id.clone()),
            kind,
            status: Some(step.status),
            plan_status: None,
            message: message.into(),
            timestamp: Utc::now(),
            progress: Some(step.progress),
            error: step.error.clone(),
        }
    }

    /// Attach a progress percentage.
    pub fn with_progress(mut self, progress: f64) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Attach an error message.
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Identifier returned by [`ProgressEmitter::subscribe`].
pub type SubscriptionId = u64;

type Callback = Arc<dyn Fn(&ProgressEvent) + Send + Sync>;
type Subscribers = Arc<RwLock<HashMap<SubscriptionId, Callback>>>;

/// Fans progress events out to callbacks and streams.
#[derive(Clone)]
pub struct ProgressEmitter {
    inner: Arc<EmitterInner>,
}

struct EmitterInner {
    streams: broadcast::Sender<ProgressEvent>,
    queue: mpsc::UnboundedSender<ProgressEvent>,
    subscribers: Subscribers,
    next_subscription_id: AtomicU64,
    metrics: SharedOrchestratorMetrics,
}

impl ProgressEmitter {
    /// Create an emitter and spawn its callback dispatcher.
    ///
    /// Must be called from within a tokio runtime. The dispatcher stops once
    /// the last clone of the emitter is dropped.
    pub fn new(event_buffer: usize, metrics: SharedOrchestratorMetrics) -> Self {
        let (streams, _) = broadcast::channel(event_buffer.max(1));
        let (queue, rx) = mpsc::unbounded_channel();
        let subscribers: Subscribers = Arc::new(RwLock::new(HashMap::new()));

        let dispatcher = SubscriberDispatcher::new(rx, subscribers.clone(), metrics.clone());
        tokio::spawn(async move {
            dispatcher.run().await;
        });

        Self {
            inner: Arc::new(EmitterInner {
                streams,
                queue,
                subscribers,
                next_subscription_id: AtomicU64::new(1),
                metrics,
            }),
        }
    }

    /// Publish an event. Never blocks.
    pub fn emit(&self, event: ProgressEvent) {
        trace!(
            plan_id = %event.plan_id,
            step_id = event.step_id.as_deref().unwrap_or("-"),
            kind = ?event.kind,
            "progress event"
        );
        self.inner.metrics.record_event();

        // No open stream is not an error.
        let _ = self.inner.streams.send(event.clone());
        if self.inner.queue.send(event).is_err() {
            debug!("progress dispatcher stopped; callback delivery skipped");
        }
    }

    /// Register a callback invoked for every event of every plan.
    ///
    /// Callbacks run on the dispatcher task and must not block. A panic inside
    /// a callback is caught and logged.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&ProgressEvent) + Send + Sync + 'static,
    {
        let subscription_id = self
            .inner
            .next_subscription_id
            .fetch_add(1, Ordering::SeqCst);
        self.inner
            .subscribers
            .write()
            .insert(subscription_id, Arc::new(callback));
        debug!(subscription_id, "progress subscription created");
        subscription_id
    }

    /// Remove a callback. Returns false if the id was unknown.
    pub fn unsubscribe(&self, subscription_id: SubscriptionId) -> bool {
        let removed = self
            .inner
            .subscribers
            .write()
            .remove(&subscription_id)
            .is_some();
        if removed {
            debug!(subscription_id, "progress subscription removed");
        }
        removed
    }

    /// Number of registered callbacks.
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.read().len()
    }

    /// Open a stream of the events of one plan.
    ///
    /// Only events emitted after this call are observed.
    pub fn stream(&self, plan_id: PlanId) -> ProgressStream {
        ProgressStream {
            plan_id,
            inner: BroadcastStream::new(self.inner.streams.subscribe()).boxed(),
            metrics: self.inner.metrics.clone(),
            end: None,
            ended: None,
            finished: false,
        }
    }
}

/// Marks the end of a plan run and keeps its `PlanFinished` event.
#[derive(Clone, Default)]
pub(crate) struct RunEnd {
    token: CancellationToken,
    event: Arc<Mutex<Option<ProgressEvent>>>,
}

impl RunEnd {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Record the final event. Must be called after it was emitted.
    pub(crate) fn set(&self, event: ProgressEvent) {
        *self.event.lock() = Some(event);
        self.token.cancel();
    }

    pub(crate) fn is_set(&self) -> bool {
        self.token.is_cancelled()
    }

    fn wait(&self) -> BoxFuture<'static, Option<ProgressEvent>> {
        let token = self.token.clone();
        let event = self.event.clone();
        async move {
            token.cancelled().await;
            event.lock().clone()
        }
        .boxed()
    }
}

/// Background task delivering queued events to callbacks.
struct SubscriberDispatcher {
    rx: mpsc::UnboundedReceiver<ProgressEvent>,
    subscribers: Subscribers,
    metrics: SharedOrchestratorMetrics,
}

impl SubscriberDispatcher {
    fn new(
        rx: mpsc::UnboundedReceiver<ProgressEvent>,
        subscribers: Subscribers,
        metrics: SharedOrchestratorMetrics,
    ) -> Self {
        Self {
            rx,
            subscribers,
            metrics,
        }
    }

    async fn run(mut self) {
        debug!("progress dispatcher started");

        while let Some(event) = self.rx.recv().await {
            self.deliver(&event);
        }

        info!("progress dispatcher stopped (channel closed)");
    }

    fn deliver(&self, event: &ProgressEvent) {
        // Snapshot so callbacks may (un)subscribe without deadlocking.
        let callbacks: Vec<(SubscriptionId, Callback)> = self
            .subscribers
            .read()
            .iter()
            .map(|(id, cb)| (*id, cb.clone()))
            .collect();

        for (subscription_id, callback) in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                self.metrics.record_subscriber_panic();
                warn!(
                    subscription_id,
                    plan_id = %event.plan_id,
                    kind = ?event.kind,
                    "progress subscriber panicked; event skipped for this subscriber"
                );
            }
        }
    }
}

/// Asynchronous sequence of one plan's progress events.
///
/// Ends after the plan's [`EventKind::PlanFinished`] event.
pub struct ProgressStream {
    plan_id: PlanId,
    inner: BoxStream<'static, Result<ProgressEvent, BroadcastStreamRecvError>>,
    metrics: SharedOrchestratorMetrics,
    end: Option<BoxFuture<'static, Option<ProgressEvent>>>,
    /// Set once the run ended; holds the retained `PlanFinished` event.
    ended: Option<Option<ProgressEvent>>,
    finished: bool,
}

impl ProgressStream {
    /// The plan this stream follows.
    pub fn plan_id(&self) -> PlanId {
        self.plan_id
    }

    /// Also end once `end` is set, even if `PlanFinished` was lost to lag.
    pub(crate) fn until(mut self, end: &RunEnd) -> Self {
        self.end = Some(end.wait());
        self
    }
}

impl Stream for ProgressStream {
    type Item = ProgressEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }

        loop {
            match this.inner.poll_next_unpin(cx) {
                Poll::Ready(None) => {
                    this.finished = true;
                    return Poll::Ready(None);
                }
                Poll::Ready(Some(Ok(event))) => {
                    if event.plan_id != this.plan_id {
                        continue;
                    }
                    if event.kind == EventKind::PlanFinished {
                        this.finished = true;
                    }
                    return Poll::Ready(Some(event));
                }
                Poll::Ready(Some(Err(BroadcastStreamRecvError::Lagged(skipped)))) => {
                    this.metrics.record_lagged(skipped);
                    warn!(
                        plan_id = %this.plan_id,
                        skipped,
                        "progress stream lagging; oldest events dropped"
                    );
                    continue;
                }
                Poll::Pending => {}
            }

            // Nothing buffered. Once the run has ended, drain what it emitted
            // before the end was set, then finish with the retained event.
            if let Some(last) = this.ended.take() {
                this.finished = true;
                debug!(plan_id = %this.plan_id, "run ended without a buffered finish event");
                return Poll::Ready(last);
            }
            match this.end.as_mut().map(|end| end.poll_unpin(cx)) {
                Some(Poll::Ready(last)) => {
                    this.end = None;
                    this.ended = Some(last);
                }
                _ => return Poll::Pending,
            }
        }
    }
}

type ProgressSink = Arc<dyn Fn(f64, &str) + Send + Sync>;
type RetrySink = Arc<dyn Fn(&str, &str) -> bool + Send + Sync>;

/// Handle given to step handlers for intermediate progress updates.
#[derive(Clone)]
pub struct ProgressReporter {
    sink: Option<ProgressSink>,
    retry: Option<RetrySink>,
}

impl ProgressReporter {
    /// Reporter forwarding to `sink`.
    pub fn new<F>(sink: F) -> Self
    where
        F: Fn(f64, &str) + Send + Sync + 'static,
    {
        Self {
            sink: Some(Arc::new(sink)),
            retry: None,
        }
    }

    /// Reporter that discards updates.
    pub fn noop() -> Self {
        Self {
            sink: None,
            retry: None,
        }
    }

    /// Route retry notices to `sink`. It returns false when the step is no
    /// longer running and the notice was dropped.
    pub(crate) fn with_retry_sink<F>(mut self, sink: F) -> Self
    where
        F: Fn(&str, &str) -> bool + Send + Sync + 'static,
    {
        self.retry = Some(Arc::new(sink));
        self
    }

    /// Announce that a failed attempt will be retried. Returns false if the
    /// notice was dropped because the step left RUNNING.
    pub(crate) fn retrying(&self, message: &str, error: &str) -> bool {
        match &self.retry {
            Some(sink) => sink(message, error),
            None => true,
        }
    }

    /// Report a percentage (clamped to 0-100) with a short message.
    pub fn report(&self, percent: f64, message: &str) {
        if let Some(sink) = &self.sink {
            sink(percent.clamp(0.0, 100.0), message);
        }
    }
}

impl std::fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("attached", &self.sink.is_some())
            .field("retry_attached", &self.retry.is_some())
            .finish()
    }
}
