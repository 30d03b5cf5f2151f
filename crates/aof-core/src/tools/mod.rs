//! The public tool surface used by agents.
//!
//! Each tool is a thin guarded wrapper around store operations plus event
//! emission. Agents never touch the store directly.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;

use aof_store::store::NewTask;
use aof_store::{
    EventLogger, GateOutcome, ListFilter, Priority, Routing, StoreError, Task, TaskPatch,
    TaskStatus, TaskStore,
};

use crate::gate::evaluator::evaluate;
use crate::gate::{GateDecision, GateError, GateRequest};
use crate::permission::{Operation, PermissionDenied, PermissionGuard};
use crate::scheduler::children_index;
use crate::workflow::WorkflowSet;

/// Errors surfaced by the tool layer.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error(transparent)]
    Permission(#[from] PermissionDenied),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Gate(#[from] GateError),

    #[error("task {id} has unfinished children: {open:?}")]
    OpenChildren { id: String, open: Vec<String> },
}

/// Parameters for [`Tools::dispatch`].
#[derive(Debug, Clone, Default)]
pub struct DispatchRequest {
    pub title: String,
    pub brief: String,
    pub priority: Priority,
    pub routing: Routing,
    pub depends_on: Vec<String>,
    pub parent_id: Option<String>,
    pub resource: Option<String>,
    pub metadata: BTreeMap<String, String>,
    pub actor: String,
}

/// Read-only view returned by [`Tools::status_report`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub counts: BTreeMap<String, usize>,
    pub tasks: Vec<TaskSummary>,
    pub truncated: bool,
}

/// One row in a status report.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSummary {
    pub id: String,
    pub title: String,
    pub status: TaskStatus,
    pub priority: Priority,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gate: Option<String>,
}

/// Parameters for [`Tools::gate_report`].
#[derive(Debug, Clone)]
pub struct GateReport {
    pub outcome: GateOutcome,
    pub caller_role: String,
    pub summary: Option<String>,
    pub blockers: Vec<String>,
    pub rejection_notes: Option<String>,
    pub actor: String,
}

/// The guarded tool set for one project.
pub struct Tools {
    store: TaskStore,
    events: Arc<EventLogger>,
    guard: PermissionGuard,
    workflows: WorkflowSet,
}

impl Tools {
    pub fn new(
        store: TaskStore,
        events: Arc<EventLogger>,
        guard: PermissionGuard,
        workflows: WorkflowSet,
    ) -> Self {
        Self {
            store,
            events,
            guard,
            workflows,
        }
    }

    /// Create a task and move it straight to `ready` for scheduling.
    pub fn dispatch(&self, req: DispatchRequest) -> Result<Task, ToolError> {
        self.guard.check(&req.actor, Operation::CreateTask)?;

        let task = self.store.create_task(NewTask {
            title: req.title,
            body: req.brief,
            priority: req.priority,
            routing: req.routing,
            depends_on: req.depends_on,
            parent_id: req.parent_id,
            resource: req.resource,
            metadata: req.metadata,
            created_by: req.actor.clone(),
        })?;
        self.events.append(
            "task.created",
            &req.actor,
            Some(&task.id),
            serde_json::json!({ "title": task.title, "priority": task.priority.to_string() }),
        )?;

        let task = self.transition_with_event(&task.id, TaskStatus::Ready, "dispatched", &req.actor)?;
        Ok(task)
    }

    /// Update a task's body and/or move it along a legal status edge.
    pub fn task_update(
        &self,
        id: &str,
        body: Option<&str>,
        status: Option<TaskStatus>,
        reason: &str,
        actor: &str,
    ) -> Result<Task, ToolError> {
        self.guard.check(actor, Operation::UpdateTask)?;

        let mut task = self.store.require(id)?;
        if let Some(body) = body {
            task = self.store.update_body(id, body)?;
            self.events.append(
                "task.updated",
                actor,
                Some(id),
                serde_json::json!({ "reason": reason }),
            )?;
        }
        if let Some(to) = status {
            self.guard.check(actor, Operation::TransitionTask)?;
            task = self.transition_with_event(id, to, reason, actor)?;
        }
        Ok(task)
    }

    /// Complete a task by walking the full lifecycle path.
    ///
    /// A blocked task is first unblocked; any non-terminal status then steps
    /// through `in-progress -> review -> done`. There is no shortcut from
    /// `in-progress` straight to `done`.
    pub fn task_complete(
        &self,
        id: &str,
        summary: Option<&str>,
        actor: &str,
    ) -> Result<Task, ToolError> {
        self.guard.check(actor, Operation::CompleteTask)?;

        let task = self.store.require(id)?;
        if task.status == TaskStatus::Done {
            return Ok(task);
        }
        self.finish(id, summary, actor)
    }

    /// Report a gate outcome: run the evaluator and apply its decision.
    ///
    /// The evaluator's task updates land in a single front-matter write; a
    /// terminal decision walks the completion path and a blocked decision
    /// moves the task to `blocked`.
    pub fn gate_report(
        &self,
        id: &str,
        report: GateReport,
    ) -> Result<(Task, GateDecision), ToolError> {
        self.guard.check(&report.actor, Operation::TransitionTask)?;

        let task = self.store.require(id)?;
        let workflow =
            self.workflows
                .resolve(&task.routing)
                .ok_or_else(|| GateError::NoEnabledGate {
                    workflow: task.routing.workflow.clone().unwrap_or_default(),
                })?;

        let decision = evaluate(&GateRequest {
            task: &task,
            workflow,
            outcome: report.outcome,
            caller_role: &report.caller_role,
            agent: &report.actor,
            summary: report.summary.clone(),
            blockers: report.blockers.clone(),
            rejection_notes: report.rejection_notes.clone(),
            now: Utc::now(),
        })?;

        let updated = self.store.update(
            id,
            TaskPatch {
                gate: Some(decision.updates.gate.clone()),
                gate_history: Some(decision.updates.gate_history.clone()),
                review_context: Some(decision.updates.review_context.clone()),
                ..TaskPatch::default()
            },
        )?;

        self.events.append(
            "gate.transitioned",
            &report.actor,
            Some(id),
            serde_json::json!({
                "from": decision.transition.from_gate,
                "to": decision.transition.to_gate,
                "outcome": decision.transition.outcome.to_string(),
                "skipped": decision.skipped_gates,
            }),
        )?;

        let task = match decision.updates.status {
            Some(TaskStatus::Done) => {
                self.finish(id, decision.transition.summary.as_deref(), &report.actor)?
            }
            Some(TaskStatus::Blocked) => {
                let reason = if report.blockers.is_empty() {
                    "blocked at gate".to_string()
                } else {
                    report.blockers.join(", ")
                };
                let blocked = self.store.block(id, &reason)?;
                self.events.append(
                    "task.blocked",
                    &report.actor,
                    Some(id),
                    serde_json::json!({ "reason": reason }),
                )?;
                blocked
            }
            _ => updated,
        };

        Ok((task, decision))
    }

    /// The stepped completion walk shared by `task_complete` and terminal
    /// gate decisions.
    fn finish(&self, id: &str, summary: Option<&str>, actor: &str) -> Result<Task, ToolError> {
        // A parent never completes while a direct child is still open.
        let all = self.store.list(&ListFilter::default())?;
        let children = children_index(&all);
        if let Some(kids) = children.get(id) {
            let open: Vec<String> = kids
                .iter()
                .filter(|c| !c.status.is_terminal())
                .map(|c| c.id.clone())
                .collect();
            if !open.is_empty() {
                return Err(ToolError::OpenChildren {
                    id: id.to_string(),
                    open,
                });
            }
        }

        let mut task = self.store.require(id)?;
        let reason = "completing";
        loop {
            let next = match task.status {
                TaskStatus::Blocked => TaskStatus::Ready,
                TaskStatus::Backlog => TaskStatus::Ready,
                TaskStatus::Ready => TaskStatus::InProgress,
                TaskStatus::InProgress => TaskStatus::Review,
                TaskStatus::Review => TaskStatus::Done,
                TaskStatus::Done => break,
            };
            task = self.transition_with_event(id, next, reason, actor)?;
        }

        self.events.append(
            "task.completed",
            actor,
            Some(id),
            serde_json::json!({ "summary": summary }),
        )?;
        Ok(task)
    }

    /// Read-only status summary with a capped task list.
    pub fn status_report(
        &self,
        agent: Option<&str>,
        status: Option<TaskStatus>,
        limit: usize,
    ) -> Result<StatusReport, ToolError> {
        let filter = ListFilter {
            status,
            agent: agent.map(str::to_string),
        };
        let tasks = self.store.list(&filter)?;

        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        for task in &tasks {
            *counts.entry(task.status.to_string()).or_insert(0) += 1;
        }

        let truncated = tasks.len() > limit;
        let rows = tasks
            .into_iter()
            .take(limit)
            .map(|t| TaskSummary {
                id: t.id,
                title: t.title,
                status: t.status,
                priority: t.priority,
                agent: t.routing.agent,
                gate: t.gate.map(|g| g.current),
            })
            .collect();

        Ok(StatusReport {
            counts,
            tasks: rows,
            truncated,
        })
    }

    fn transition_with_event(
        &self,
        id: &str,
        to: TaskStatus,
        reason: &str,
        actor: &str,
    ) -> Result<Task, ToolError> {
        let before = self.store.require(id)?;
        let task = self.store.transition(id, to, Some(reason))?;
        self.events.append(
            "task.transitioned",
            actor,
            Some(id),
            serde_json::json!({
                "from": before.status.to_string(),
                "to": to.to_string(),
                "reason": reason,
            }),
        )?;
        Ok(task)
    }
}
