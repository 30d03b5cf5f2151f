//! Tool surface tests: guarded dispatch, updates, the stepped completion
//! path, and status reporting.

use std::sync::Arc;

use chrono::Utc;

use aof_core::org::OrgChart;
use aof_core::permission::PermissionGuard;
use aof_core::tools::{DispatchRequest, GateReport, ToolError, Tools};
use aof_core::workflow::WorkflowSet;
use aof_store::{EventLogger, GateOutcome, Routing, TaskStatus, TaskStore};

use aof_test_utils::{create_test_vault, TaskSeed};

fn build_tools(store: &TaskStore) -> Tools {
    let events = Arc::new(EventLogger::open(store.paths().events_dir()).unwrap());
    Tools::new(
        store.clone(),
        events,
        PermissionGuard::default(),
        WorkflowSet::builtin(),
    )
}

fn build_tools_with_org(store: &TaskStore, org: &str) -> Tools {
    let events = Arc::new(EventLogger::open(store.paths().events_dir()).unwrap());
    Tools::new(
        store.clone(),
        events,
        PermissionGuard::new(OrgChart::parse(org).unwrap()),
        WorkflowSet::builtin(),
    )
}

fn read_events(store: &TaskStore) -> Vec<aof_store::Event> {
    let logger = EventLogger::open(store.paths().events_dir()).unwrap();
    let day = Utc::now().format("%Y-%m-%d").to_string();
    logger.read_day(&day).unwrap()
}

// ---------------------------------------------------------------------------
// dispatch
// ---------------------------------------------------------------------------

#[test]
fn dispatch_creates_ready_task_with_events() {
    let (_dir, store) = create_test_vault();
    let tools = build_tools(&store);

    let task = tools
        .dispatch(DispatchRequest {
            title: "build the widget".to_string(),
            brief: "all the details".to_string(),
            routing: Routing {
                agent: Some("bot-1".to_string()),
                ..Routing::default()
            },
            actor: "orchestrator".to_string(),
            ..DispatchRequest::default()
        })
        .unwrap();

    assert_eq!(task.status, TaskStatus::Ready);
    assert_eq!(task.created_by, "orchestrator");
    assert_eq!(task.body, "all the details");

    let events = read_events(&store);
    let types: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
    assert_eq!(types, vec!["task.created", "task.transitioned"]);
}

// ---------------------------------------------------------------------------
// task_update
// ---------------------------------------------------------------------------

#[test]
fn task_update_patches_body_and_transitions() {
    let (_dir, store) = create_test_vault();
    let tools = build_tools(&store);
    let task = TaskSeed::new("updatable").status(TaskStatus::Ready).build(&store);

    let updated = tools
        .task_update(
            &task.id,
            Some("progress notes"),
            Some(TaskStatus::Blocked),
            "waiting on api keys",
            "bot-1",
        )
        .unwrap();

    assert_eq!(updated.status, TaskStatus::Blocked);
    assert_eq!(updated.body, "progress notes\n");

    let events = read_events(&store);
    assert!(events.iter().any(|e| e.event_type == "task.updated"));
    assert!(events.iter().any(|e| e.event_type == "task.transitioned"));
}

#[test]
fn task_update_rejects_illegal_edges() {
    let (_dir, store) = create_test_vault();
    let tools = build_tools(&store);
    let task = TaskSeed::new("no shortcut")
        .status(TaskStatus::InProgress)
        .build(&store);

    let err = tools
        .task_update(&task.id, None, Some(TaskStatus::Done), "sneaky", "bot-1")
        .unwrap_err();
    assert!(matches!(err, ToolError::Store(_)));
    assert_eq!(
        store.require(&task.id).unwrap().status,
        TaskStatus::InProgress
    );
}

// ---------------------------------------------------------------------------
// task_complete
// ---------------------------------------------------------------------------

#[test]
fn complete_walks_the_full_lifecycle_from_ready() {
    let (_dir, store) = create_test_vault();
    let tools = build_tools(&store);
    let task = TaskSeed::new("stepper").status(TaskStatus::Ready).build(&store);

    let done = tools.task_complete(&task.id, Some("shipped"), "bot-1").unwrap();
    assert_eq!(done.status, TaskStatus::Done);

    // The transitions on record: ready -> in-progress -> review -> done.
    let events = read_events(&store);
    let hops: Vec<(String, String)> = events
        .iter()
        .filter(|e| e.event_type == "task.transitioned")
        .map(|e| {
            (
                e.payload["from"].as_str().unwrap().to_string(),
                e.payload["to"].as_str().unwrap().to_string(),
            )
        })
        .collect();
    assert_eq!(
        hops,
        vec![
            ("ready".to_string(), "in-progress".to_string()),
            ("in-progress".to_string(), "review".to_string()),
            ("review".to_string(), "done".to_string()),
        ]
    );
    assert!(events.iter().any(|e| e.event_type == "task.completed"));
}

#[test]
fn complete_unblocks_blocked_tasks_first() {
    let (_dir, store) = create_test_vault();
    let tools = build_tools(&store);
    let task = TaskSeed::new("blocked stepper")
        .status(TaskStatus::Blocked)
        .build(&store);

    let done = tools.task_complete(&task.id, None, "bot-1").unwrap();
    assert_eq!(done.status, TaskStatus::Done);

    let events = read_events(&store);
    let first_hop = events
        .iter()
        .find(|e| e.event_type == "task.transitioned")
        .unwrap();
    assert_eq!(first_hop.payload["from"], "blocked");
    assert_eq!(first_hop.payload["to"], "ready");
}

#[test]
fn complete_is_idempotent_on_done_tasks() {
    let (_dir, store) = create_test_vault();
    let tools = build_tools(&store);
    let task = TaskSeed::new("already done").status(TaskStatus::Done).build(&store);

    let done = tools.task_complete(&task.id, None, "bot-1").unwrap();
    assert_eq!(done.status, TaskStatus::Done);
    // No completion event for an idempotent no-op.
    assert!(read_events(&store).is_empty());
}

#[test]
fn complete_refuses_parent_with_open_children() {
    let (_dir, store) = create_test_vault();
    let tools = build_tools(&store);
    let parent = TaskSeed::new("parent").status(TaskStatus::Ready).build(&store);
    let child = TaskSeed::new("child")
        .status(TaskStatus::InProgress)
        .parent(&parent.id)
        .build(&store);

    let err = tools.task_complete(&parent.id, None, "bot-1").unwrap_err();
    match err {
        ToolError::OpenChildren { open, .. } => assert_eq!(open, vec![child.id.clone()]),
        other => panic!("expected OpenChildren, got {other:?}"),
    }
    assert_eq!(store.require(&parent.id).unwrap().status, TaskStatus::Ready);

    // Once the child is done the parent can complete.
    tools.task_complete(&child.id, None, "bot-1").unwrap();
    let done = tools.task_complete(&parent.id, None, "bot-1").unwrap();
    assert_eq!(done.status, TaskStatus::Done);
}

// ---------------------------------------------------------------------------
// gate_report
// ---------------------------------------------------------------------------

fn gate_report_for(role: &str, outcome: GateOutcome) -> GateReport {
    GateReport {
        outcome,
        caller_role: role.to_string(),
        summary: Some("reviewed".to_string()),
        blockers: vec![],
        rejection_notes: None,
        actor: "bot-1".to_string(),
    }
}

#[test]
fn gate_report_advances_through_the_workflow() {
    let (_dir, store) = create_test_vault();
    let tools = build_tools(&store);
    let task = TaskSeed::new("gated")
        .status(TaskStatus::InProgress)
        .build(&store);

    // No gate state yet: the first report starts at `implement`.
    let (updated, decision) = tools
        .gate_report(&task.id, gate_report_for("backend", GateOutcome::Complete))
        .unwrap();
    assert_eq!(decision.transition.from_gate, "implement");
    assert_eq!(decision.transition.to_gate.as_deref(), Some("code-review"));
    assert_eq!(
        updated.gate.as_ref().map(|g| g.current.as_str()),
        Some("code-review")
    );
    assert_eq!(updated.gate_history.len(), 1);

    let events = read_events(&store);
    assert!(events.iter().any(|e| e.event_type == "gate.transitioned"));
}

#[test]
fn gate_report_rejection_stamps_review_context() {
    let (_dir, store) = create_test_vault();
    let tools = build_tools(&store);
    let task = TaskSeed::new("bounced")
        .status(TaskStatus::InProgress)
        .build(&store);

    // Walk to qa, then reject from there.
    tools
        .gate_report(&task.id, gate_report_for("backend", GateOutcome::Complete))
        .unwrap();
    tools
        .gate_report(&task.id, gate_report_for("architect", GateOutcome::Complete))
        .unwrap();

    let mut report = gate_report_for("qa", GateOutcome::NeedsReview);
    report.rejection_notes = Some("flaky tests".to_string());
    let (updated, decision) = tools.gate_report(&task.id, report).unwrap();

    assert_eq!(decision.transition.to_gate.as_deref(), Some("implement"));
    let review = updated.review_context.expect("review context");
    assert_eq!(review.from_gate, "qa");
    assert_eq!(review.notes.as_deref(), Some("flaky tests"));
}

#[test]
fn gate_report_terminal_completes_via_review() {
    let (_dir, store) = create_test_vault();
    let tools = build_tools(&store);
    let task = TaskSeed::new("all gates passed")
        .status(TaskStatus::InProgress)
        .build(&store);

    for role in ["backend", "architect", "qa"] {
        tools
            .gate_report(&task.id, gate_report_for(role, GateOutcome::Complete))
            .unwrap();
    }
    // Security is skipped (no tag); po-accept completes the workflow.
    let (updated, decision) = tools
        .gate_report(&task.id, gate_report_for("product", GateOutcome::Complete))
        .unwrap();

    assert_eq!(decision.transition.to_gate, None);
    assert_eq!(updated.status, TaskStatus::Done);

    // The completion walked in-progress -> review -> done, never a jump.
    let events = read_events(&store);
    let hops: Vec<(String, String)> = events
        .iter()
        .filter(|e| e.event_type == "task.transitioned")
        .map(|e| {
            (
                e.payload["from"].as_str().unwrap().to_string(),
                e.payload["to"].as_str().unwrap().to_string(),
            )
        })
        .collect();
    assert!(hops.contains(&("in-progress".to_string(), "review".to_string())));
    assert!(hops.contains(&("review".to_string(), "done".to_string())));
    assert!(!hops.contains(&("in-progress".to_string(), "done".to_string())));
}

#[test]
fn gate_report_blocked_outcome_blocks_the_task() {
    let (_dir, store) = create_test_vault();
    let tools = build_tools(&store);
    let task = TaskSeed::new("stuck at gate")
        .status(TaskStatus::InProgress)
        .build(&store);

    let mut report = gate_report_for("backend", GateOutcome::Blocked);
    report.blockers = vec!["missing credentials".to_string()];
    let (updated, decision) = tools.gate_report(&task.id, report).unwrap();

    assert_eq!(updated.status, TaskStatus::Blocked);
    assert_eq!(
        decision.updates.gate.as_ref().map(|g| g.current.as_str()),
        Some("implement")
    );
}

#[test]
fn gate_report_wrong_role_is_unauthorized() {
    let (_dir, store) = create_test_vault();
    let tools = build_tools(&store);
    let task = TaskSeed::new("guarded gate")
        .status(TaskStatus::InProgress)
        .build(&store);

    let err = tools
        .gate_report(&task.id, gate_report_for("qa", GateOutcome::Complete))
        .unwrap_err();
    assert!(matches!(err, ToolError::Gate(_)));

    // Task unchanged.
    let reloaded = store.require(&task.id).unwrap();
    assert!(reloaded.gate.is_none());
    assert!(reloaded.gate_history.is_empty());
}

// ---------------------------------------------------------------------------
// status_report
// ---------------------------------------------------------------------------

#[test]
fn status_report_counts_and_caps() {
    let (_dir, store) = create_test_vault();
    let tools = build_tools(&store);
    for i in 0..5 {
        TaskSeed::new(&format!("ready {i}"))
            .status(TaskStatus::Ready)
            .build(&store);
    }
    TaskSeed::new("doing").status(TaskStatus::InProgress).build(&store);

    let report = tools.status_report(None, None, 3).unwrap();
    assert_eq!(report.counts.get("ready"), Some(&5));
    assert_eq!(report.counts.get("in-progress"), Some(&1));
    assert_eq!(report.tasks.len(), 3);
    assert!(report.truncated);

    let filtered = tools
        .status_report(None, Some(TaskStatus::InProgress), 10)
        .unwrap();
    assert_eq!(filtered.tasks.len(), 1);
    assert!(!filtered.truncated);
}

// ---------------------------------------------------------------------------
// Permissions
// ---------------------------------------------------------------------------

#[test]
fn unregistered_actor_cannot_dispatch() {
    let (_dir, store) = create_test_vault();
    let tools = build_tools_with_org(
        &store,
        "agents:\n  - name: worker\n    role: backend\n",
    );

    let err = tools
        .dispatch(DispatchRequest {
            title: "nope".to_string(),
            actor: "stranger".to_string(),
            ..DispatchRequest::default()
        })
        .unwrap_err();
    assert!(matches!(err, ToolError::Permission(_)));

    // The registered worker is fine.
    tools
        .dispatch(DispatchRequest {
            title: "yep".to_string(),
            actor: "worker".to_string(),
            ..DispatchRequest::default()
        })
        .unwrap();
}
