//! Scheduler poll tests: lease expiry, dispatch planning, throttling,
//! failure rollback, and deadlettering.

use std::sync::Arc;

use chrono::{Duration, Utc};

use aof_core::executor::MockExecutor;
use aof_core::lease::{LeaseConfig, LeaseManager};
use aof_core::metrics::Metrics;
use aof_core::org::OrgChart;
use aof_core::scheduler::{Action, Scheduler, SchedulerConfig};
use aof_core::throttle::{ThrottleController, ThrottleLimits};
use aof_core::workflow::WorkflowSet;
use aof_store::{EventLogger, GateState, ListFilter, Priority, TaskPatch, TaskStatus, TaskStore};

use aof_test_utils::{create_test_vault, TaskSeed};

fn permissive_limits() -> ThrottleLimits {
    ThrottleLimits {
        max_dispatches: 100,
        team_max_concurrent: 100,
        min_dispatch_interval_ms: 0,
        team_min_interval_ms: 0,
        max_dispatches_per_poll: 100,
    }
}

fn build_scheduler(
    store: &TaskStore,
    executor: Arc<MockExecutor>,
    limits: ThrottleLimits,
    config: SchedulerConfig,
    workflows: WorkflowSet,
) -> Scheduler {
    let events = Arc::new(EventLogger::open(store.paths().events_dir()).unwrap());
    let leases = Arc::new(LeaseManager::new(store.clone(), LeaseConfig::default()));
    Scheduler::new(
        store.clone(),
        events,
        leases,
        ThrottleController::new(limits),
        workflows,
        OrgChart::default(),
        executor,
        Metrics::new().unwrap(),
        config,
    )
}

fn read_event_types(store: &TaskStore) -> Vec<String> {
    let logger = EventLogger::open(store.paths().events_dir()).unwrap();
    let day = Utc::now().format("%Y-%m-%d").to_string();
    logger
        .read_day(&day)
        .unwrap()
        .into_iter()
        .map(|e| e.event_type)
        .collect()
}

// ---------------------------------------------------------------------------
// Lease expiry
// ---------------------------------------------------------------------------

#[tokio::test]
async fn expired_lease_returns_task_to_ready() {
    let (_dir, store) = create_test_vault();
    let task = TaskSeed::new("expired")
        .status(TaskStatus::InProgress)
        .lease("bot-1", Duration::seconds(-1))
        .build(&store);

    let scheduler = build_scheduler(
        &store,
        Arc::new(MockExecutor::new()),
        permissive_limits(),
        SchedulerConfig::default(),
        WorkflowSet::builtin(),
    );
    let result = scheduler.poll("test").await.unwrap();

    assert!(result
        .actions
        .iter()
        .any(|a| matches!(a, Action::ExpireLease { task_id, .. } if task_id == &task.id)));

    let reloaded = store.require(&task.id).unwrap();
    assert_eq!(reloaded.status, TaskStatus::Ready);
    assert_eq!(reloaded.lease, None);

    let events = read_event_types(&store);
    assert_eq!(
        events.iter().filter(|t| t.as_str() == "lease.expired").count(),
        1
    );
}

#[tokio::test]
async fn blocked_holder_keeps_status_but_loses_lease() {
    let (_dir, store) = create_test_vault();
    let task = TaskSeed::new("blocked holder")
        .status(TaskStatus::Blocked)
        .lease("bot-1", Duration::seconds(-1))
        .build(&store);

    let scheduler = build_scheduler(
        &store,
        Arc::new(MockExecutor::new()),
        permissive_limits(),
        SchedulerConfig::default(),
        WorkflowSet::builtin(),
    );
    scheduler.poll("test").await.unwrap();

    let reloaded = store.require(&task.id).unwrap();
    assert_eq!(reloaded.status, TaskStatus::Blocked);
    assert_eq!(reloaded.lease, None);
}

#[tokio::test]
async fn active_lease_is_left_alone() {
    let (_dir, store) = create_test_vault();
    let task = TaskSeed::new("healthy")
        .status(TaskStatus::InProgress)
        .lease("bot-1", Duration::minutes(10))
        .build(&store);

    let scheduler = build_scheduler(
        &store,
        Arc::new(MockExecutor::new()),
        permissive_limits(),
        SchedulerConfig::default(),
        WorkflowSet::builtin(),
    );
    let result = scheduler.poll("test").await.unwrap();

    assert!(result.actions.is_empty());
    let reloaded = store.require(&task.id).unwrap();
    assert_eq!(reloaded.status, TaskStatus::InProgress);
    assert!(reloaded.lease.is_some());
}

// ---------------------------------------------------------------------------
// Dispatch planning
// ---------------------------------------------------------------------------

#[tokio::test]
async fn per_poll_cap_limits_assignments() {
    let (_dir, store) = create_test_vault();
    for i in 0..10 {
        TaskSeed::new(&format!("ready {i}"))
            .status(TaskStatus::Ready)
            .agent("bot-1")
            .build(&store);
    }

    let executor = Arc::new(MockExecutor::new());
    let scheduler = build_scheduler(
        &store,
        executor.clone(),
        ThrottleLimits {
            max_dispatches_per_poll: 3,
            ..permissive_limits()
        },
        SchedulerConfig::default(),
        WorkflowSet::builtin(),
    );
    let result = scheduler.poll("test").await.unwrap();

    let assigns = result
        .actions
        .iter()
        .filter(|a| matches!(a, Action::Assign { .. }))
        .count();
    assert_eq!(assigns, 3);
    assert_eq!(executor.spawn_count(), 3);

    let ready = store
        .list(&ListFilter {
            status: Some(TaskStatus::Ready),
            agent: None,
        })
        .unwrap();
    assert_eq!(ready.len(), 7, "remaining tasks untouched");
}

#[tokio::test]
async fn priority_order_wins_under_contention() {
    let (_dir, store) = create_test_vault();
    TaskSeed::new("low prio")
        .status(TaskStatus::Ready)
        .priority(Priority::Low)
        .agent("bot-1")
        .build(&store);
    let critical = TaskSeed::new("critical prio")
        .status(TaskStatus::Ready)
        .priority(Priority::Critical)
        .agent("bot-1")
        .build(&store);

    let scheduler = build_scheduler(
        &store,
        Arc::new(MockExecutor::new()),
        ThrottleLimits {
            max_dispatches_per_poll: 1,
            ..permissive_limits()
        },
        SchedulerConfig::default(),
        WorkflowSet::builtin(),
    );
    let result = scheduler.poll("test").await.unwrap();

    let assigned: Vec<&str> = result
        .actions
        .iter()
        .filter_map(|a| match a {
            Action::Assign { task_id, .. } => Some(task_id.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(assigned, vec![critical.id.as_str()]);
}

#[tokio::test]
async fn unmet_dependency_blocks_dispatch() {
    let (_dir, store) = create_test_vault();
    let blocker = TaskSeed::new("blocker")
        .status(TaskStatus::InProgress)
        .build(&store);
    let dependent = TaskSeed::new("dependent")
        .status(TaskStatus::Ready)
        .agent("bot-1")
        .depends_on(&[&blocker.id])
        .build(&store);

    let executor = Arc::new(MockExecutor::new());
    let scheduler = build_scheduler(
        &store,
        executor.clone(),
        permissive_limits(),
        SchedulerConfig::default(),
        WorkflowSet::builtin(),
    );
    scheduler.poll("test").await.unwrap();

    assert_eq!(executor.spawn_count(), 0);
    assert_eq!(
        store.require(&dependent.id).unwrap().status,
        TaskStatus::Ready
    );
}

#[tokio::test]
async fn every_non_done_blocker_status_prevents_dispatch() {
    for status in [
        TaskStatus::Backlog,
        TaskStatus::Ready,
        TaskStatus::InProgress,
        TaskStatus::Blocked,
        TaskStatus::Review,
    ] {
        let (_dir, store) = create_test_vault();
        let blocker = TaskSeed::new("blocker").status(status).build(&store);
        TaskSeed::new("dependent")
            .status(TaskStatus::Ready)
            .agent("bot-1")
            .depends_on(&[&blocker.id])
            .build(&store);

        let executor = Arc::new(MockExecutor::new());
        let scheduler = build_scheduler(
            &store,
            executor.clone(),
            permissive_limits(),
            SchedulerConfig::default(),
            WorkflowSet::builtin(),
        );
        scheduler.poll("test").await.unwrap();

        // The blocker itself may be dispatched when ready; the dependent
        // never is.
        let spawned = executor.spawned();
        assert!(
            !spawned.iter().any(|c| c.title == "dependent"),
            "dependent dispatched behind a {status} blocker"
        );
    }
}

#[tokio::test]
async fn done_dependency_allows_dispatch() {
    let (_dir, store) = create_test_vault();
    let blocker = TaskSeed::new("finished blocker")
        .status(TaskStatus::Done)
        .build(&store);
    let dependent = TaskSeed::new("dependent")
        .status(TaskStatus::Ready)
        .agent("bot-1")
        .depends_on(&[&blocker.id])
        .build(&store);

    let executor = Arc::new(MockExecutor::new());
    let scheduler = build_scheduler(
        &store,
        executor.clone(),
        permissive_limits(),
        SchedulerConfig::default(),
        WorkflowSet::builtin(),
    );
    scheduler.poll("test").await.unwrap();

    assert_eq!(executor.spawn_count(), 1);
    assert_eq!(
        store.require(&dependent.id).unwrap().status,
        TaskStatus::InProgress
    );
}

#[tokio::test]
async fn circular_dependency_is_blocked_with_reason() {
    let (_dir, store) = create_test_vault();
    let a = TaskSeed::new("cycle a")
        .status(TaskStatus::Ready)
        .agent("bot-1")
        .build(&store);
    let b = TaskSeed::new("cycle b")
        .status(TaskStatus::Ready)
        .agent("bot-1")
        .depends_on(&[&a.id])
        .build(&store);
    // Close the cycle behind the store's back via a raw file edit: the
    // add_dep API rejects cycles, but files can be edited by hand.
    let path = store.paths().task_file(TaskStatus::Ready, &a.id);
    let content = std::fs::read_to_string(&path).unwrap();
    let mut parsed = aof_store::frontmatter::parse(&content).unwrap();
    parsed.depends_on.push(b.id.clone());
    std::fs::write(&path, aof_store::frontmatter::render(&parsed).unwrap()).unwrap();

    let scheduler = build_scheduler(
        &store,
        Arc::new(MockExecutor::new()),
        permissive_limits(),
        SchedulerConfig::default(),
        WorkflowSet::builtin(),
    );
    let result = scheduler.poll("test").await.unwrap();

    let blocks: Vec<&Action> = result
        .actions
        .iter()
        .filter(|a| matches!(a, Action::Block { .. }))
        .collect();
    assert_eq!(blocks.len(), 2, "both cycle members blocked");

    assert_eq!(store.require(&a.id).unwrap().status, TaskStatus::Blocked);
    assert_eq!(store.require(&b.id).unwrap().status, TaskStatus::Blocked);
    let events = read_event_types(&store);
    assert_eq!(
        events.iter().filter(|t| t.as_str() == "task.blocked").count(),
        2
    );
}

#[tokio::test]
async fn occupied_resource_defers_dispatch() {
    let (_dir, store) = create_test_vault();
    TaskSeed::new("holder")
        .status(TaskStatus::InProgress)
        .resource("staging-db")
        .build(&store);
    let waiting = TaskSeed::new("waiting")
        .status(TaskStatus::Ready)
        .agent("bot-1")
        .resource("staging-db")
        .build(&store);

    let executor = Arc::new(MockExecutor::new());
    let scheduler = build_scheduler(
        &store,
        executor.clone(),
        permissive_limits(),
        SchedulerConfig::default(),
        WorkflowSet::builtin(),
    );
    scheduler.poll("test").await.unwrap();

    assert_eq!(executor.spawn_count(), 0);
    assert_eq!(store.require(&waiting.id).unwrap().status, TaskStatus::Ready);
}

#[tokio::test]
async fn two_ready_tasks_never_share_a_resource_in_one_poll() {
    let (_dir, store) = create_test_vault();
    TaskSeed::new("first claimant")
        .status(TaskStatus::Ready)
        .agent("bot-1")
        .resource("gpu-0")
        .build(&store);
    TaskSeed::new("second claimant")
        .status(TaskStatus::Ready)
        .agent("bot-1")
        .resource("gpu-0")
        .build(&store);

    let executor = Arc::new(MockExecutor::new());
    let scheduler = build_scheduler(
        &store,
        executor.clone(),
        permissive_limits(),
        SchedulerConfig::default(),
        WorkflowSet::builtin(),
    );
    scheduler.poll("test").await.unwrap();

    assert_eq!(executor.spawn_count(), 1);
    let in_progress = store
        .list(&ListFilter {
            status: Some(TaskStatus::InProgress),
            agent: None,
        })
        .unwrap();
    assert_eq!(in_progress.len(), 1);
}

// ---------------------------------------------------------------------------
// Dispatch failure handling
// ---------------------------------------------------------------------------

#[tokio::test]
async fn executor_failure_rolls_back_to_ready() {
    let (_dir, store) = create_test_vault();
    let task = TaskSeed::new("flaky target")
        .status(TaskStatus::Ready)
        .agent("bot-1")
        .build(&store);

    let executor = Arc::new(MockExecutor::new());
    executor.fail_next(1);
    let scheduler = build_scheduler(
        &store,
        executor,
        permissive_limits(),
        SchedulerConfig::default(),
        WorkflowSet::builtin(),
    );
    let result = scheduler.poll("test").await.unwrap();
    assert_eq!(result.actions_failed, 1);

    let reloaded = store.require(&task.id).unwrap();
    assert_eq!(reloaded.status, TaskStatus::Ready);
    assert_eq!(reloaded.lease, None);
    assert_eq!(reloaded.dispatch_failures, 1);

    let events = read_event_types(&store);
    assert!(events.iter().any(|t| t == "dispatch.failed"));
}

#[tokio::test]
async fn repeated_failures_deadletter_the_task() {
    let (_dir, store) = create_test_vault();
    let task = TaskSeed::new("poison pill")
        .status(TaskStatus::Ready)
        .agent("bot-1")
        .build(&store);

    let executor = Arc::new(MockExecutor::new());
    executor.fail_next(2);
    let scheduler = build_scheduler(
        &store,
        executor,
        permissive_limits(),
        SchedulerConfig {
            deadletter_threshold: 2,
            ..SchedulerConfig::default()
        },
        WorkflowSet::builtin(),
    );

    scheduler.poll("first").await.unwrap();
    assert_eq!(store.require(&task.id).unwrap().dispatch_failures, 1);

    scheduler.poll("second").await.unwrap();
    let reloaded = store.require(&task.id).unwrap();
    assert_eq!(reloaded.status, TaskStatus::Blocked);
    assert!(store
        .paths()
        .deadletter_dir()
        .join(format!("{}.md", task.id))
        .is_file());

    let events = read_event_types(&store);
    assert!(events.iter().any(|t| t == "task.deadlettered"));
}

#[tokio::test]
async fn success_resets_the_failure_counter() {
    let (_dir, store) = create_test_vault();
    let task = TaskSeed::new("recovers")
        .status(TaskStatus::Ready)
        .agent("bot-1")
        .build(&store);

    let executor = Arc::new(MockExecutor::new());
    executor.fail_next(1);
    let scheduler = build_scheduler(
        &store,
        executor,
        permissive_limits(),
        SchedulerConfig {
            deadletter_threshold: 3,
            ..SchedulerConfig::default()
        },
        WorkflowSet::builtin(),
    );

    scheduler.poll("first").await.unwrap();
    assert_eq!(store.require(&task.id).unwrap().dispatch_failures, 1);

    scheduler.poll("second").await.unwrap();
    let reloaded = store.require(&task.id).unwrap();
    assert_eq!(reloaded.status, TaskStatus::InProgress);
    assert_eq!(reloaded.dispatch_failures, 0);
}

// ---------------------------------------------------------------------------
// Gate timeouts
// ---------------------------------------------------------------------------

fn timeout_workflows() -> WorkflowSet {
    WorkflowSet::parse(
        r#"
workflows:
  - name: standard
    gates:
      - id: implement
        role: backend
        timeoutMinutes: 60
        escalateTo: lead
      - id: qa
        role: qa
        canReject: true
"#,
    )
    .unwrap()
}

#[tokio::test]
async fn gate_timeout_escalates_role_and_emits_event() {
    let (_dir, store) = create_test_vault();
    let task = TaskSeed::new("stuck at gate")
        .status(TaskStatus::InProgress)
        .lease("bot-1", Duration::minutes(30))
        .build(&store);
    store
        .update(
            &task.id,
            TaskPatch {
                gate: Some(Some(GateState {
                    current: "implement".to_string(),
                    entered: Utc::now() - Duration::hours(3),
                })),
                ..TaskPatch::default()
            },
        )
        .unwrap();

    let scheduler = build_scheduler(
        &store,
        Arc::new(MockExecutor::new()),
        permissive_limits(),
        SchedulerConfig::default(),
        timeout_workflows(),
    );
    let result = scheduler.poll("test").await.unwrap();

    assert!(result
        .actions
        .iter()
        .any(|a| matches!(a, Action::Alert { .. })));

    let reloaded = store.require(&task.id).unwrap();
    assert_eq!(reloaded.routing.role.as_deref(), Some("lead"));
    assert_eq!(reloaded.gate_history.len(), 1);
    assert_eq!(
        reloaded.gate_history[0].summary.as_deref(),
        Some("gate_timeout")
    );
    // The gate clock restarted for the escalated role.
    let entered = reloaded.gate.unwrap().entered;
    assert!(Utc::now() - entered < Duration::minutes(5));

    let events = read_event_types(&store);
    assert!(events.iter().any(|t| t == "gate_timeout"));
    assert!(events.iter().any(|t| t == "alert"));
}

#[tokio::test]
async fn gate_within_timeout_is_untouched() {
    let (_dir, store) = create_test_vault();
    let task = TaskSeed::new("on schedule")
        .status(TaskStatus::InProgress)
        .lease("bot-1", Duration::minutes(30))
        .build(&store);
    store
        .update(
            &task.id,
            TaskPatch {
                gate: Some(Some(GateState {
                    current: "implement".to_string(),
                    entered: Utc::now() - Duration::minutes(10),
                })),
                ..TaskPatch::default()
            },
        )
        .unwrap();

    let scheduler = build_scheduler(
        &store,
        Arc::new(MockExecutor::new()),
        permissive_limits(),
        SchedulerConfig::default(),
        timeout_workflows(),
    );
    let result = scheduler.poll("test").await.unwrap();

    assert!(result.actions.is_empty());
    let reloaded = store.require(&task.id).unwrap();
    assert!(reloaded.routing.role.is_none());
    assert!(reloaded.gate_history.is_empty());
}

// ---------------------------------------------------------------------------
// Dry run
// ---------------------------------------------------------------------------

#[tokio::test]
async fn dry_run_plans_expiries_but_executes_nothing() {
    let (_dir, store) = create_test_vault();
    let expired = TaskSeed::new("expired in dry run")
        .status(TaskStatus::InProgress)
        .lease("bot-1", Duration::seconds(-1))
        .build(&store);
    TaskSeed::new("ready in dry run")
        .status(TaskStatus::Ready)
        .agent("bot-1")
        .build(&store);

    let executor = Arc::new(MockExecutor::new());
    let scheduler = build_scheduler(
        &store,
        executor.clone(),
        permissive_limits(),
        SchedulerConfig {
            dry_run: true,
            ..SchedulerConfig::default()
        },
        WorkflowSet::builtin(),
    );
    let result = scheduler.poll("test").await.unwrap();

    assert!(result.dry_run);
    assert!(result
        .actions
        .iter()
        .all(|a| matches!(a, Action::ExpireLease { .. })));
    assert_eq!(result.actions_executed, 0);
    assert_eq!(executor.spawn_count(), 0);

    // Nothing mutated.
    assert_eq!(
        store.require(&expired.id).unwrap().status,
        TaskStatus::InProgress
    );
}
