//! End-to-end tests driving plans through the orchestration controller.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use ferry_core::{
    handler_fn, BackupProvider, BackupRecord, BackupStepHandler, EventKind, MigrationError,
    MigrationPlan, MigrationStep, OrchestrationController, OrchestratorConfig, PlanId, PlanInfo,
    PlanStatus, Platform, ProgressEvent, ProgressStream, Stage, StepContext, StepExecutionError,
    StepStatus, BACKUP_STEP_ID,
};
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::{json, Map};
use tokio::sync::{mpsc, Barrier, Notify};

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

fn controller(max_concurrent: usize) -> OrchestrationController {
    OrchestrationController::new(
        OrchestratorConfig::new()
            .with_max_concurrent_steps(max_concurrent)
            .with_retry_delay(Duration::ZERO),
    )
    .unwrap()
}

fn step(id: &str, stage: Stage, deps: &[&str]) -> MigrationStep {
    MigrationStep::new(id, id.to_uppercase(), stage).with_dependencies(deps.iter().copied())
}

fn register(controller: &OrchestrationController, steps: Vec<MigrationStep>) -> MigrationPlan {
    let plan = MigrationPlan::from_steps(
        Platform::WordPress,
        Platform::Hugo,
        "/srv/wordpress",
        "/srv/hugo",
        steps,
        Map::new(),
    )
    .unwrap();
    controller.register_plan(plan.clone()).unwrap();
    plan
}

async fn drain(stream: ProgressStream) -> Vec<ProgressEvent> {
    tokio::time::timeout(TEST_TIMEOUT, stream.collect::<Vec<_>>())
        .await
        .expect("plan did not finish in time")
}

fn started(events: &[ProgressEvent]) -> Vec<&str> {
    events
        .iter()
        .filter(|e| e.kind == EventKind::StepStarted)
        .filter_map(|e| e.step_id.as_deref())
        .collect()
}

fn position(events: &[ProgressEvent], kind: EventKind, step_id: &str) -> Option<usize> {
    events
        .iter()
        .position(|e| e.kind == kind && e.step_id.as_deref() == Some(step_id))
}

/// Per step: intermediate updates only while started, nothing after the
/// terminal event.
fn assert_step_event_order(events: &[ProgressEvent]) {
    let mut running: HashSet<&str> = HashSet::new();
    let mut done: HashSet<&str> = HashSet::new();
    for event in events {
        let Some(id) = event.step_id.as_deref() else {
            continue;
        };
        assert!(
            !done.contains(id),
            "{:?} for {} after its terminal event",
            event.kind,
            id
        );
        match event.kind {
            EventKind::StepStarted => {
                assert!(running.insert(id), "{} started twice", id);
            }
            EventKind::StepProgress | EventKind::StepRetrying | EventKind::StepPaused => {
                assert!(running.contains(id), "{:?} for {} before start", event.kind, id);
            }
            EventKind::StepResumed => {
                running.remove(id);
            }
            kind if kind.is_step_terminal() => {
                running.remove(id);
                done.insert(id);
            }
            _ => {}
        }
    }
}

async fn wait_for_status(controller: &OrchestrationController, plan_id: PlanId, status: PlanStatus) {
    tokio::time::timeout(TEST_TIMEOUT, async {
        while controller.get_migration_status(plan_id).unwrap().status != status {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("plan did not reach the expected status");
}

#[tokio::test]
async fn test_independent_steps_run_concurrently() {
    let controller = controller(2);
    let plan = register(
        &controller,
        vec![
            step("a", Stage::Preparation, &[]),
            step("b", Stage::Export, &["a"]),
            step("c", Stage::Export, &["a"]),
        ],
    );

    // b and c only get past the barrier if both are running at once.
    let barrier = Arc::new(Barrier::new(2));
    controller.set_default_handler(Arc::new(handler_fn(move |ctx: StepContext| {
        let barrier = barrier.clone();
        async move {
            if ctx.step.id != "a" {
                barrier.wait().await;
            }
            Ok(Some(json!(ctx.step.id)))
        }
    })));

    let events = drain(controller.execute_migration(plan.id).unwrap()).await;

    let order = started(&events);
    assert_eq!(order[0], "a");
    assert_eq!(order[1..].iter().copied().collect::<HashSet<_>>(), HashSet::from(["b", "c"]));

    let a_done = position(&events, EventKind::StepCompleted, "a").unwrap();
    let b_start = position(&events, EventKind::StepStarted, "b").unwrap();
    let c_start = position(&events, EventKind::StepStarted, "c").unwrap();
    let b_done = position(&events, EventKind::StepCompleted, "b").unwrap();
    let c_done = position(&events, EventKind::StepCompleted, "c").unwrap();
    assert!(a_done < b_start && a_done < c_start);
    assert!(b_start < c_done && c_start < b_done);
    assert_step_event_order(&events);

    let status = controller.get_migration_status(plan.id).unwrap();
    assert_eq!(status.status, PlanStatus::Completed);
    assert_eq!(status.completed_steps, 3);
    assert_eq!(status.progress, 100.0);
    assert_eq!(events.last().unwrap().kind, EventKind::PlanFinished);
}

#[tokio::test]
async fn test_fatal_failure_blocks_dependents() {
    let controller = controller(3);
    let plan = register(
        &controller,
        vec![
            step("a", Stage::Preparation, &[]),
            step("b", Stage::Export, &["a"]),
            step("c", Stage::Import, &["b"]),
        ],
    );

    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    controller.register_step_handler(
        "b",
        Arc::new(handler_fn(move |_ctx: StepContext| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move { Err(StepExecutionError::fatal("export format not supported")) }
        })),
    );

    let events = drain(controller.execute_migration(plan.id).unwrap()).await;
    assert!(!started(&events).contains(&"c"));

    let status = controller.get_migration_status(plan.id).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(status.status, PlanStatus::Failed);
    assert!(status.completed_steps < status.total_steps);
    assert_eq!(status.failed_steps, 1);

    let plan = controller.get_plan(plan.id).unwrap();
    let b = plan.step("b").unwrap();
    assert_eq!(b.status, StepStatus::Failed);
    assert_eq!(b.attempts, 1);
    assert_eq!(b.error.as_deref(), Some("export format not supported"));
    assert_eq!(plan.step("c").unwrap().status, StepStatus::Pending);
}

#[tokio::test]
async fn test_cancel_while_running() {
    let controller = controller(3);
    let plan = register(
        &controller,
        vec![
            step("a", Stage::Preparation, &[]),
            step("b", Stage::Export, &["a"]),
            step("c", Stage::Transform, &["b"]),
            step("d", Stage::Import, &["c"]),
            step("e", Stage::Completion, &["d"]),
        ],
    );

    let (started_tx, mut started_rx) = mpsc::unbounded_channel();
    controller.register_step_handler(
        "b",
        Arc::new(handler_fn(move |ctx: StepContext| {
            let _ = started_tx.send(());
            async move {
                ctx.cancelled().await;
                Err(StepExecutionError::fatal("interrupted"))
            }
        })),
    );

    let stream = controller.execute_migration(plan.id).unwrap();
    tokio::time::timeout(TEST_TIMEOUT, started_rx.recv())
        .await
        .unwrap()
        .unwrap();
    controller.cancel_migration(plan.id).unwrap();
    let events = drain(stream).await;

    let status = controller.get_migration_status(plan.id).unwrap();
    assert_eq!(status.status, PlanStatus::Cancelled);
    assert_eq!(status.pending_steps, 0);
    assert_eq!(status.running_steps, 0);
    assert_eq!(status.completed_steps, 1);
    assert_eq!(status.cancelled_steps, 4);
    assert_eq!(status.current_stage, Some(Stage::Preparation));

    let snapshot = |id: &str| status.steps.iter().find(|s| s.id == id).unwrap().status;
    assert_eq!(snapshot("b"), StepStatus::Cancelled);
    assert_eq!(started(&events), vec!["a", "b"]);
    assert_step_event_order(&events);
    assert!(events.iter().any(|e| e.kind == EventKind::PlanCancelled));
    assert_eq!(controller.metrics().plans_cancelled(), 1);
}

#[tokio::test]
async fn test_cancel_during_retriable_failure() {
    let controller = controller(3);
    let plan = register(
        &controller,
        vec![
            step("a", Stage::Preparation, &[]),
            step("b", Stage::Export, &["a"]),
            step("c", Stage::Import, &["b"]),
        ],
    );

    let b_calls = Arc::new(AtomicU32::new(0));
    let (started_tx, mut started_rx) = mpsc::unbounded_channel();
    let counter = b_calls.clone();
    controller.register_step_handler(
        "b",
        Arc::new(handler_fn(move |ctx: StepContext| {
            counter.fetch_add(1, Ordering::SeqCst);
            let _ = started_tx.send(());
            async move {
                ctx.cancelled().await;
                Err(StepExecutionError::retriable("connection reset"))
            }
        })),
    );

    let stream = controller.execute_migration(plan.id).unwrap();
    tokio::time::timeout(TEST_TIMEOUT, started_rx.recv())
        .await
        .unwrap()
        .unwrap();
    controller.cancel_migration(plan.id).unwrap();
    let events = drain(stream).await;

    assert_step_event_order(&events);
    assert!(!events.iter().any(|e| e.kind == EventKind::StepRetrying));
    let b_terminal = position(&events, EventKind::StepCancelled, "b").unwrap();
    assert!(events[b_terminal + 1..]
        .iter()
        .all(|e| e.step_id.as_deref() != Some("b")));

    assert_eq!(b_calls.load(Ordering::SeqCst), 1);
    assert_eq!(controller.metrics().retries(), 0);
    let status = controller.get_migration_status(plan.id).unwrap();
    assert_eq!(status.status, PlanStatus::Cancelled);
    assert_eq!(status.cancelled_steps, 2);
}

#[tokio::test]
async fn test_plans_run_side_by_side() {
    let controller = controller(2);
    let first = register(
        &controller,
        vec![step("prepare", Stage::Preparation, &[]), step("meet", Stage::Export, &["prepare"])],
    );
    let second = register(
        &controller,
        vec![step("prepare", Stage::Preparation, &[]), step("meet", Stage::Export, &["prepare"])],
    );

    // "meet" in one plan only passes the barrier while the other plan's
    // "meet" is running too.
    let barrier = Arc::new(Barrier::new(2));
    controller.register_step_handler(
        "meet",
        Arc::new(handler_fn(move |ctx: StepContext| {
            let barrier = barrier.clone();
            async move {
                barrier.wait().await;
                Ok(Some(json!(ctx.plan.id.to_string())))
            }
        })),
    );

    let first_stream = controller.execute_migration(first.id).unwrap();
    let second_stream = controller.execute_migration(second.id).unwrap();
    let (first_events, second_events) = tokio::join!(drain(first_stream), drain(second_stream));

    for (plan, events) in [(&first, &first_events), (&second, &second_events)] {
        assert!(events.iter().all(|e| e.plan_id == plan.id));
        assert_eq!(events.last().unwrap().kind, EventKind::PlanFinished);
        assert_step_event_order(events);

        let record = controller.get_plan(plan.id).unwrap();
        assert_eq!(record.status(), PlanStatus::Completed);
        assert_eq!(
            record.step("meet").unwrap().result,
            Some(json!(plan.id.to_string()))
        );
    }
    assert_eq!(controller.metrics().plans_completed(), 2);
}

#[tokio::test]
async fn test_unpolled_stream_ends_after_other_plans_flood_buffer() {
    let controller = OrchestrationController::new(
        OrchestratorConfig::new()
            .with_max_concurrent_steps(2)
            .with_retry_delay(Duration::ZERO)
            .with_event_buffer(8),
    )
    .unwrap();

    let quiet = register(&controller, vec![step("only", Stage::Preparation, &[])]);
    let quiet_stream = controller.execute_migration(quiet.id).unwrap();
    wait_for_status(&controller, quiet.id, PlanStatus::Completed).await;

    let chain: Vec<MigrationStep> = (0..10)
        .map(|n| {
            let deps: Vec<String> = if n == 0 { vec![] } else { vec![format!("s{}", n - 1)] };
            MigrationStep::new(format!("s{n}"), format!("S{n}"), Stage::Transform)
                .with_dependencies(deps)
        })
        .collect();
    let busy = register(&controller, chain);
    let busy_events = drain(controller.execute_migration(busy.id).unwrap()).await;
    assert_eq!(busy_events.last().unwrap().kind, EventKind::PlanFinished);

    // The quiet plan's own finish event is long gone from the buffer.
    let quiet_events = drain(quiet_stream).await;
    let last = quiet_events.last().unwrap();
    assert_eq!(last.kind, EventKind::PlanFinished);
    assert_eq!(last.plan_id, quiet.id);
    assert_eq!(last.plan_status, Some(PlanStatus::Completed));
    assert!(controller.metrics().events_lagged() > 0);

    let status = tokio::time::timeout(TEST_TIMEOUT, controller.run_to_completion(busy.id)).await;
    assert!(matches!(status, Ok(Err(MigrationError::InvalidState { .. }))));
}

#[tokio::test]
async fn test_retry_bound() {
    let controller = controller(3);
    let plan = register(
        &controller,
        vec![
            step("flaky", Stage::Export, &[]),
            step("broken", Stage::Import, &[]),
        ],
    );

    let flaky_calls = Arc::new(AtomicU32::new(0));
    let broken_calls = Arc::new(AtomicU32::new(0));
    let (flaky, broken) = (flaky_calls.clone(), broken_calls.clone());
    controller.register_step_handler(
        "flaky",
        Arc::new(handler_fn(move |_ctx: StepContext| {
            flaky.fetch_add(1, Ordering::SeqCst);
            async move { Err(StepExecutionError::retriable("connection reset")) }
        })),
    );
    controller.register_step_handler(
        "broken",
        Arc::new(handler_fn(move |_ctx: StepContext| {
            broken.fetch_add(1, Ordering::SeqCst);
            async move { Err(StepExecutionError::fatal("schema mismatch")) }
        })),
    );

    let events = drain(controller.execute_migration(plan.id).unwrap()).await;
    let retries = events
        .iter()
        .filter(|e| e.kind == EventKind::StepRetrying)
        .count();

    let attempts = controller.config().retry_attempts;
    assert_eq!(flaky_calls.load(Ordering::SeqCst), attempts);
    assert_eq!(broken_calls.load(Ordering::SeqCst), 1);
    assert_eq!(retries as u32, attempts - 1);
    assert_step_event_order(&events);

    let plan = controller.get_plan(plan.id).unwrap();
    assert_eq!(plan.step("flaky").unwrap().status, StepStatus::Failed);
    assert_eq!(plan.step("flaky").unwrap().attempts, attempts);
    assert_eq!(plan.step("broken").unwrap().attempts, 1);
}

#[tokio::test]
async fn test_pause_resume_does_not_rerun() {
    let controller = controller(3);
    let plan = register(
        &controller,
        vec![
            step("a", Stage::Preparation, &[]),
            step("b", Stage::Export, &["a"]),
            step("c", Stage::Import, &["b"]),
        ],
    );

    let a_calls = Arc::new(AtomicU32::new(0));
    let release = Arc::new(Notify::new());
    let (started_tx, mut started_rx) = mpsc::unbounded_channel();
    {
        let (calls, release) = (a_calls.clone(), release.clone());
        controller.register_step_handler(
            "a",
            Arc::new(handler_fn(move |_ctx: StepContext| {
                calls.fetch_add(1, Ordering::SeqCst);
                let _ = started_tx.send(());
                let release = release.clone();
                async move {
                    release.notified().await;
                    Ok(Some(json!("prepared")))
                }
            })),
        );
    }

    let stream = controller.execute_migration(plan.id).unwrap();
    tokio::time::timeout(TEST_TIMEOUT, started_rx.recv())
        .await
        .unwrap()
        .unwrap();

    controller.pause_migration(plan.id).unwrap();
    let status = controller.get_migration_status(plan.id).unwrap();
    assert_eq!(status.status, PlanStatus::Paused);
    assert_eq!(status.paused_steps, 1);

    // a finishes while paused; nothing downstream may start.
    release.notify_one();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let paused = controller.get_plan(plan.id).unwrap();
    assert_eq!(paused.step("a").unwrap().status, StepStatus::Paused);
    assert_eq!(paused.step("b").unwrap().status, StepStatus::Pending);

    // Idempotent while nothing moves.
    assert_eq!(
        controller.get_migration_status(plan.id).unwrap(),
        controller.get_migration_status(plan.id).unwrap()
    );

    controller.resume_migration(plan.id).unwrap();
    let events = drain(stream).await;

    let status = controller.get_migration_status(plan.id).unwrap();
    assert_eq!(status.status, PlanStatus::Completed);
    assert_eq!(status.completed_steps, 3);
    assert_eq!(a_calls.load(Ordering::SeqCst), 1);

    let plan = controller.get_plan(plan.id).unwrap();
    assert_eq!(plan.step("a").unwrap().result, Some(json!("prepared")));
    for kind in [
        EventKind::PlanPaused,
        EventKind::StepPaused,
        EventKind::StepResumed,
        EventKind::PlanResumed,
    ] {
        assert!(events.iter().any(|e| e.kind == kind), "missing {:?}", kind);
    }
    assert_step_event_order(&events);
}

#[tokio::test]
async fn test_predecessors_complete_before_start() {
    let controller = controller(3);
    let plan = controller
        .create_migration_plan("wordpress", "hugo", "/srv/wp", "/srv/hugo", &Map::new())
        .unwrap();

    let order = plan.topological_order().unwrap();
    assert_eq!(order.len(), plan.steps.len());
    assert_eq!(order.iter().collect::<HashSet<_>>().len(), plan.steps.len());

    let events = drain(controller.execute_migration(plan.id).unwrap()).await;
    for (idx, event) in events.iter().enumerate() {
        if event.kind != EventKind::StepStarted {
            continue;
        }
        let step_id = event.step_id.as_deref().unwrap();
        for dep in &plan.step(step_id).unwrap().depends_on {
            let done = position(&events, EventKind::StepCompleted, dep)
                .unwrap_or_else(|| panic!("{} started before {} completed", step_id, dep));
            assert!(done < idx, "{} started before {} completed", step_id, dep);
        }
    }
    assert_step_event_order(&events);

    let first = controller.get_migration_status(plan.id).unwrap();
    let second = controller.get_migration_status(plan.id).unwrap();
    assert_eq!(first, second);
    assert_eq!(first.status, PlanStatus::Completed);
    assert_eq!(first.estimated_remaining, Some(Duration::ZERO));
}

#[tokio::test]
async fn test_execute_guards() {
    let controller = controller(3);
    let plan = register(&controller, vec![step("wait", Stage::Export, &[])]);
    controller.set_default_handler(Arc::new(handler_fn(|ctx: StepContext| async move {
        ctx.cancelled().await;
        Ok(None)
    })));

    let stream = controller.execute_migration(plan.id).unwrap();
    assert!(matches!(
        controller.execute_migration(plan.id),
        Err(MigrationError::AlreadyRunning { .. })
    ));
    assert!(matches!(
        controller.remove_plan(plan.id),
        Err(MigrationError::InvalidState { .. })
    ));

    controller.cancel_migration(plan.id).unwrap();
    drain(stream).await;

    assert!(matches!(
        controller.execute_migration(plan.id),
        Err(MigrationError::InvalidState { .. })
    ));
    controller.remove_plan(plan.id).unwrap();
    assert!(matches!(
        controller.get_migration_status(plan.id),
        Err(MigrationError::PlanNotFound { .. })
    ));
}

#[tokio::test]
async fn test_subscribers_see_the_run() {
    let controller = controller(3);
    let plan = register(
        &controller,
        vec![
            step("a", Stage::Preparation, &[]),
            step("b", Stage::Export, &["a"]),
        ],
    );

    let (tx, mut rx) = mpsc::unbounded_channel();
    let id = controller.subscribe(move |event| {
        let _ = tx.send(event.kind);
    });
    controller.subscribe(|_| panic!("broken subscriber"));

    drain(controller.execute_migration(plan.id).unwrap()).await;

    let mut kinds = Vec::new();
    while kinds.last() != Some(&EventKind::PlanFinished) {
        let kind = tokio::time::timeout(TEST_TIMEOUT, rx.recv())
            .await
            .unwrap()
            .unwrap();
        kinds.push(kind);
    }
    assert_eq!(kinds.first(), Some(&EventKind::PlanStarted));
    assert_eq!(
        kinds.iter().filter(|k| **k == EventKind::StepCompleted).count(),
        2
    );
    assert!(controller.unsubscribe(id));
    assert!(controller.metrics().subscriber_panics() > 0);
}

struct RecordingBackup {
    restored: Mutex<Vec<String>>,
}

#[async_trait]
impl BackupProvider for RecordingBackup {
    async fn create_backup(&self, plan: &PlanInfo) -> Result<BackupRecord, StepExecutionError> {
        Ok(BackupRecord {
            backup_id: format!("bk-{}", plan.id),
            location: format!("{}.bak", plan.source_path),
            created_at: Utc::now(),
        })
    }

    async fn rollback(
        &self,
        _plan: &PlanInfo,
        backup: &BackupRecord,
    ) -> Result<(), StepExecutionError> {
        self.restored.lock().push(backup.backup_id.clone());
        Ok(())
    }
}

#[tokio::test]
async fn test_explicit_rollback_after_failure() {
    let controller = controller(3);
    let provider = Arc::new(RecordingBackup {
        restored: Mutex::new(Vec::new()),
    });
    controller.register_step_handler(BACKUP_STEP_ID, Arc::new(BackupStepHandler::new(provider.clone())));
    controller.register_stage_handler(
        Stage::Import,
        Arc::new(handler_fn(|_ctx: StepContext| async move {
            Err(StepExecutionError::fatal("destination rejected content"))
        })),
    );

    let plan = controller
        .create_migration_plan("wordpress", "ghost", "/srv/wp", "/srv/ghost", &Map::new())
        .unwrap();
    let status = controller.run_to_completion(plan.id).await.unwrap();
    assert_eq!(status.status, PlanStatus::Failed);
    assert!(provider.restored.lock().is_empty());

    let record = controller
        .rollback_migration(plan.id, provider.as_ref())
        .await
        .unwrap();
    assert_eq!(record.backup_id, format!("bk-{}", plan.id));
    assert_eq!(*provider.restored.lock(), vec![record.backup_id.clone()]);

    assert!(matches!(
        controller.rollback_migration(plan.id, provider.as_ref()).await,
        Err(MigrationError::InvalidState { operation: "rollback", .. })
    ));
}

#[tokio::test]
async fn test_rollback_requires_backup() {
    let controller = controller(3);
    let provider = RecordingBackup {
        restored: Mutex::new(Vec::new()),
    };

    let options = Map::from_iter([("create_backup".to_string(), json!(false))]);
    let plan = controller
        .create_migration_plan("drupal", "wordpress", "/a", "/b", &options)
        .unwrap();
    controller.cancel_migration(plan.id).unwrap();
    assert!(matches!(
        controller.rollback_migration(plan.id, &provider).await,
        Err(MigrationError::Rollback { .. })
    ));

    let completed = controller
        .create_migration_plan("drupal", "wordpress", "/a", "/b", &Map::new())
        .unwrap();
    controller.run_to_completion(completed.id).await.unwrap();
    assert!(matches!(
        controller.rollback_migration(completed.id, &provider).await,
        Err(MigrationError::InvalidState { .. })
    ));
}
