//! The scheduler: one poll cycle over a consistent snapshot of the task
//! set.
//!
//! A poll computes stats, expires leases, escalates gate timeouts, plans
//! dispatches under throttle limits, and executes the resulting actions in
//! a fixed order. One failing action never aborts the rest of the poll.

pub mod actions;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;

use aof_store::{
    EventLogger, GateHistoryEntry, GateState, StoreError, Task, TaskPatch, TaskStatus, TaskStore,
};

use crate::executor::{Executor, TaskContext};
use crate::lease::LeaseManager;
use crate::metrics::Metrics;
use crate::org::OrgChart;
use crate::throttle::{ThrottleController, ThrottleRequest};
use crate::workflow::WorkflowSet;

pub use actions::Action;

/// Scheduler tuning knobs.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Consecutive dispatch failures before a task is deadlettered.
    pub deadletter_threshold: u32,
    /// Attempts for transient I/O failures per action.
    pub io_retries: u32,
    /// Plan and report without executing anything.
    pub dry_run: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            deadletter_threshold: 3,
            io_retries: 3,
            dry_run: false,
        }
    }
}

/// Task counts for one snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PollStats {
    pub total: usize,
    pub backlog: usize,
    pub ready: usize,
    pub in_progress: usize,
    pub blocked: usize,
    pub review: usize,
    pub done: usize,
}

impl PollStats {
    fn from_tasks(tasks: &[Task]) -> Self {
        let mut stats = Self {
            total: tasks.len(),
            ..Self::default()
        };
        for task in tasks {
            match task.status {
                TaskStatus::Backlog => stats.backlog += 1,
                TaskStatus::Ready => stats.ready += 1,
                TaskStatus::InProgress => stats.in_progress += 1,
                TaskStatus::Blocked => stats.blocked += 1,
                TaskStatus::Review => stats.review += 1,
                TaskStatus::Done => stats.done += 1,
            }
        }
        stats
    }
}

/// Outcome of one poll.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PollResult {
    pub scanned_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub dry_run: bool,
    pub actions: Vec<Action>,
    pub stats: PollStats,
    pub actions_executed: usize,
    pub actions_failed: usize,
}

/// Index direct children by parent id.
pub fn children_index(tasks: &[Task]) -> HashMap<&str, Vec<&Task>> {
    let mut index: HashMap<&str, Vec<&Task>> = HashMap::new();
    for task in tasks {
        if let Some(parent) = &task.parent_id {
            index.entry(parent.as_str()).or_default().push(task);
        }
    }
    index
}

/// The scheduler for one project.
pub struct Scheduler {
    store: TaskStore,
    events: Arc<EventLogger>,
    leases: Arc<LeaseManager>,
    throttle: Mutex<ThrottleController>,
    workflows: WorkflowSet,
    org: OrgChart,
    executor: Arc<dyn Executor>,
    metrics: Metrics,
    config: SchedulerConfig,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: TaskStore,
        events: Arc<EventLogger>,
        leases: Arc<LeaseManager>,
        throttle: ThrottleController,
        workflows: WorkflowSet,
        org: OrgChart,
        executor: Arc<dyn Executor>,
        metrics: Metrics,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            events,
            leases,
            throttle: Mutex::new(throttle),
            workflows,
            org,
            executor,
            metrics,
            config,
        }
    }

    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Run one poll cycle.
    pub async fn poll(&self, reason: &str) -> Result<PollResult> {
        let started = Instant::now();
        let now = Utc::now();
        tracing::debug!(reason = %reason, "poll starting");

        // 1. Snapshot and stats.
        let snapshot = self.store.snapshot()?;
        let tasks = snapshot.tasks;
        let stats = PollStats::from_tasks(&tasks);
        self.export_task_gauges(&tasks);

        // 2. Resource occupancy from in-progress holders.
        let mut occupied: HashMap<String, String> = HashMap::new();
        for task in &tasks {
            if task.status == TaskStatus::InProgress {
                if let Some(resource) = &task.resource {
                    occupied.insert(resource.clone(), task.id.clone());
                }
            }
        }

        let mut actions: Vec<Action> = Vec::new();

        // 3. Lease expiry: in-progress and blocked holders both count.
        for task in &tasks {
            if !matches!(task.status, TaskStatus::InProgress | TaskStatus::Blocked) {
                continue;
            }
            if let Some(lease) = &task.lease {
                if lease.is_expired(now) {
                    actions.push(Action::ExpireLease {
                        task_id: task.id.clone(),
                        agent: lease.agent.clone(),
                        overdue_ms: (now - lease.expires_at).num_milliseconds(),
                    });
                }
            }
        }

        // 4. Gate timeouts with escalation.
        for task in &tasks {
            if task.status != TaskStatus::InProgress {
                continue;
            }
            if let Some(alert) = self.check_gate_timeout(task, now) {
                actions.push(alert);
            }
        }

        // 5. Dispatch planning (skipped entirely in dry-run mode).
        if !self.config.dry_run {
            self.plan_dispatches(&tasks, &stats, &mut occupied, now, &mut actions);
        }

        // 6. Execute in fixed order, each action crash-isolated.
        actions.sort_by_key(Action::order);
        let (executed, failed) = if self.config.dry_run {
            (0, 0)
        } else {
            self.execute_actions(&actions).await
        };

        let duration = started.elapsed();
        self.metrics.loop_duration.observe(duration.as_secs_f64());

        let result = PollResult {
            scanned_at: now,
            duration_ms: duration.as_millis() as i64,
            dry_run: self.config.dry_run,
            actions,
            stats,
            actions_executed: executed,
            actions_failed: failed,
        };
        tracing::info!(
            reason = %reason,
            total = stats.total,
            ready = stats.ready,
            in_progress = stats.in_progress,
            planned = result.actions.len(),
            executed = executed,
            failed = failed,
            duration_ms = result.duration_ms,
            "poll complete"
        );
        Ok(result)
    }

    // -- Planning ----------------------------------------------------------

    /// Escalate a timed-out gate; returns the alert action to plan.
    fn check_gate_timeout(&self, task: &Task, now: DateTime<Utc>) -> Option<Action> {
        let gate_state = task.gate.as_ref()?;
        let workflow = self.workflows.resolve(&task.routing)?;
        let gate = workflow.gate(&gate_state.current)?;
        let timeout = gate.timeout?;
        if now - gate_state.entered <= timeout {
            return None;
        }

        self.metrics
            .gate_timeouts
            .with_label_values(&[task.project.as_str(), workflow.name.as_str(), gate.id.as_str()])
            .inc();

        let mut history = task.gate_history.clone();
        history.push(GateHistoryEntry {
            gate: gate.id.clone(),
            role: gate.role.clone(),
            entered: gate_state.entered,
            exited: Some(now),
            outcome: None,
            summary: Some("gate_timeout".to_string()),
            blockers: Vec::new(),
            duration_ms: Some((now - gate_state.entered).num_milliseconds()),
        });

        let escalated_to = gate.escalate_to.clone();
        let mut patch = TaskPatch {
            gate_history: Some(history),
            ..TaskPatch::default()
        };
        if let Some(to_role) = &escalated_to {
            self.metrics
                .gate_escalations
                .with_label_values(&[
                    task.project.as_str(),
                    workflow.name.as_str(),
                    gate.id.as_str(),
                    to_role.as_str(),
                ])
                .inc();
            let mut routing = task.routing.clone();
            routing.role = Some(to_role.clone());
            patch.routing = Some(routing);
            // Restart the gate clock so the escalated role gets a full
            // timeout window.
            patch.gate = Some(Some(GateState {
                current: gate.id.clone(),
                entered: now,
            }));
        }

        if let Err(e) = self.store.update(&task.id, patch) {
            tracing::error!(task_id = %task.id, error = %e, "gate timeout update failed");
            return None;
        }

        let payload = serde_json::json!({
            "gate": gate.id,
            "workflow": workflow.name,
            "escalatedTo": escalated_to,
            "enteredAt": gate_state.entered,
        });
        if let Err(e) = self
            .events
            .append("gate_timeout", "scheduler", Some(&task.id), payload)
        {
            tracing::error!(task_id = %task.id, error = %e, "gate_timeout event append failed");
        }

        let message = match &escalated_to {
            Some(role) => format!("gate {} timed out, escalated to {role}", gate.id),
            None => format!("gate {} timed out", gate.id),
        };
        Some(Action::Alert {
            task_id: task.id.clone(),
            message,
        })
    }

    /// Plan `assign` (and circular-dependency `block`) actions over the
    /// ready set, in priority order.
    fn plan_dispatches(
        &self,
        tasks: &[Task],
        stats: &PollStats,
        occupied: &mut HashMap<String, String>,
        now: DateTime<Utc>,
        actions: &mut Vec<Action>,
    ) {
        let done_ids: HashSet<&str> = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Done)
            .map(|t| t.id.as_str())
            .collect();
        let deps: HashMap<&str, &[String]> = tasks
            .iter()
            .map(|t| (t.id.as_str(), t.depends_on.as_slice()))
            .collect();

        let mut ready: Vec<&Task> = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Ready)
            .collect();
        // Canonical dispatch order: priority first, then creation time.
        ready.sort_by(|a, b| {
            a.priority
                .rank()
                .cmp(&b.priority.rank())
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });

        let team_in_progress: HashMap<&str, usize> = {
            let mut counts: HashMap<&str, usize> = HashMap::new();
            for task in tasks {
                if task.status == TaskStatus::InProgress {
                    if let Some(team) = &task.routing.team {
                        *counts.entry(team.as_str()).or_insert(0) += 1;
                    }
                }
            }
            counts
        };

        let throttle = self.throttle.lock().expect("throttle lock poisoned");
        let mut planned = 0usize;

        for task in ready {
            // Dependency gating: a single unmet blocker disqualifies.
            let unmet: Vec<&str> = task
                .depends_on
                .iter()
                .map(String::as_str)
                .filter(|d| !done_ids.contains(d))
                .collect();
            if !unmet.is_empty() {
                if in_dependency_cycle(task.id.as_str(), &deps) {
                    actions.push(Action::Block {
                        task_id: task.id.clone(),
                        reason: "circular_dep".to_string(),
                    });
                } else {
                    tracing::debug!(task_id = %task.id, blockers = ?unmet, "dispatch blocked by dependencies");
                }
                continue;
            }

            // Resource exclusion: leave the task in ready, no mutation.
            if let Some(resource) = &task.resource {
                if let Some(holder) = occupied.get(resource) {
                    tracing::debug!(
                        task_id = %task.id,
                        resource = %resource,
                        holder = %holder,
                        "dispatch deferred, resource occupied"
                    );
                    continue;
                }
            }

            // Throttling: the first denial ends planning to preserve the
            // priority order (no queue jumping past a throttled task).
            let team = task.routing.team.as_deref();
            let team_def = team.and_then(|t| self.org.team(t));
            let decision = throttle.check(&ThrottleRequest {
                team,
                current_in_progress: stats.in_progress,
                team_in_progress: team
                    .and_then(|t| team_in_progress.get(t).copied())
                    .unwrap_or(0),
                pending_dispatches: planned,
                dispatches_this_poll: planned,
                team_max_concurrent: team_def.and_then(|d| d.max_concurrent),
                team_min_interval_ms: team_def.and_then(|d| d.min_interval_ms),
                now,
            });
            if !decision.allowed {
                tracing::debug!(
                    task_id = %task.id,
                    reason = ?decision.reason,
                    "throttled, ending dispatch planning"
                );
                break;
            }

            // Resolve the target agent: explicit routing first, then the
            // team's default.
            let agent = task
                .routing
                .agent
                .clone()
                .or_else(|| team.and_then(|t| self.org.default_agent_for_team(t).map(String::from)));
            let Some(agent) = agent else {
                tracing::debug!(task_id = %task.id, "no agent resolvable, skipping");
                continue;
            };

            if let Some(resource) = &task.resource {
                occupied.insert(resource.clone(), task.id.clone());
            }
            actions.push(Action::Assign {
                task_id: task.id.clone(),
                agent,
                team: team.map(String::from),
            });
            planned += 1;
        }
    }

    // -- Execution ---------------------------------------------------------

    async fn execute_actions(&self, actions: &[Action]) -> (usize, usize) {
        let mut executed = 0usize;
        let mut failed = 0usize;

        for action in actions {
            let mut attempt = 0u32;
            loop {
                match self.execute_action(action).await {
                    Ok(()) => {
                        executed += 1;
                        break;
                    }
                    Err(e) if is_transient(&e) && attempt + 1 < self.config.io_retries => {
                        attempt += 1;
                        tracing::warn!(
                            action = action.kind(),
                            task_id = action.task_id(),
                            attempt = attempt,
                            error = %e,
                            "transient action failure, retrying"
                        );
                        tokio::time::sleep(std::time::Duration::from_millis(50 * attempt as u64))
                            .await;
                    }
                    Err(e) => {
                        failed += 1;
                        tracing::error!(
                            action = action.kind(),
                            task_id = action.task_id(),
                            error = %e,
                            "action failed"
                        );
                        break;
                    }
                }
            }
        }

        (executed, failed)
    }

    async fn execute_action(&self, action: &Action) -> Result<()> {
        match action {
            Action::ExpireLease {
                task_id,
                agent,
                overdue_ms,
            } => self.execute_expire(task_id, agent, *overdue_ms),
            Action::Block { task_id, reason } => {
                self.store.block(task_id, reason)?;
                self.events.append(
                    "task.blocked",
                    "scheduler",
                    Some(task_id),
                    serde_json::json!({ "reason": reason }),
                )?;
                Ok(())
            }
            Action::Assign {
                task_id,
                agent,
                team,
            } => self.execute_assign(task_id, agent, team.as_deref()).await,
            Action::Alert { task_id, message } => {
                self.events.append(
                    "alert",
                    "scheduler",
                    Some(task_id),
                    serde_json::json!({ "message": message }),
                )?;
                Ok(())
            }
            Action::StaleHeartbeat { task_id, agent } => {
                self.events.append(
                    "stale_heartbeat",
                    "scheduler",
                    Some(task_id),
                    serde_json::json!({ "agent": agent }),
                )?;
                Ok(())
            }
            Action::SlaViolation { task_id, detail } => {
                self.events.append(
                    "sla_violation",
                    "scheduler",
                    Some(task_id),
                    serde_json::json!({ "detail": detail }),
                )?;
                Ok(())
            }
            Action::Deadletter { task_id, failures } => {
                self.store
                    .deadletter(task_id, &format!("{failures} consecutive dispatch failures"))?;
                self.events.append(
                    "task.deadlettered",
                    "scheduler",
                    Some(task_id),
                    serde_json::json!({ "failures": failures }),
                )?;
                Ok(())
            }
        }
    }

    fn execute_expire(&self, task_id: &str, agent: &str, overdue_ms: i64) -> Result<()> {
        let task = self.store.require(task_id)?;
        self.leases.expire(task_id)?;

        // In-progress holders return to ready; blocked holders stay put.
        if task.status == TaskStatus::InProgress {
            let reason = format!("lease expired: agent {agent} was {overdue_ms}ms overdue");
            self.store.transition(task_id, TaskStatus::Ready, Some(&reason))?;
        }

        self.events.append(
            "lease.expired",
            "scheduler",
            Some(task_id),
            serde_json::json!({ "agent": agent, "overdueMs": overdue_ms }),
        )?;
        Ok(())
    }

    async fn execute_assign(&self, task_id: &str, agent: &str, team: Option<&str>) -> Result<()> {
        let task = self.store.require(task_id)?;

        // Fail fast when a racing acquire won.
        self.leases.acquire(task_id, agent)?;

        if let Err(e) = self
            .store
            .transition(task_id, TaskStatus::InProgress, Some("dispatched"))
        {
            let _ = self.leases.expire(task_id);
            return Err(e.into());
        }

        self.leases.start_renewal(task_id, agent);

        let ctx = TaskContext::from_task(&task, agent);
        let spawn_result = self.executor.spawn(&ctx).await;

        let failure = match &spawn_result {
            Ok(outcome) if outcome.ok => None,
            Ok(outcome) => Some(
                outcome
                    .error
                    .clone()
                    .unwrap_or_else(|| "executor rejected the task".to_string()),
            ),
            Err(e) => Some(format!("{e:#}")),
        };

        if let Some(error) = failure {
            // Roll back: release the lease, return to ready, count the
            // failure, deadletter at the threshold.
            self.leases.stop_renewal(task_id);
            let _ = self.leases.expire(task_id);
            let _ = self
                .store
                .transition(task_id, TaskStatus::Ready, Some("dispatch failed"));

            let failures = task.dispatch_failures + 1;
            let _ = self.store.set_dispatch_failures(task_id, failures);

            self.metrics
                .dispatch_failures
                .with_label_values(&[agent])
                .inc();
            self.events.append(
                "dispatch.failed",
                "scheduler",
                Some(task_id),
                serde_json::json!({ "agent": agent, "error": error, "failures": failures }),
            )?;

            if failures >= self.config.deadletter_threshold {
                self.store.deadletter(
                    task_id,
                    &format!("{failures} consecutive dispatch failures"),
                )?;
                self.events.append(
                    "task.deadlettered",
                    "scheduler",
                    Some(task_id),
                    serde_json::json!({ "failures": failures }),
                )?;
            }
            anyhow::bail!("dispatch of {task_id} to {agent} failed: {error}");
        }

        // Success: reset the consecutive-failure counter and stamp the
        // throttle state.
        if task.dispatch_failures > 0 {
            let _ = self.store.set_dispatch_failures(task_id, 0);
        }
        self.throttle
            .lock()
            .expect("throttle lock poisoned")
            .record_dispatch(team);

        let session_id = spawn_result
            .ok()
            .and_then(|o| o.session_id)
            .unwrap_or_default();
        self.events.append(
            "task.assigned",
            "scheduler",
            Some(task_id),
            serde_json::json!({ "agent": agent, "sessionId": session_id }),
        )?;
        Ok(())
    }

    fn export_task_gauges(&self, tasks: &[Task]) {
        let mut counts: HashMap<(String, String), i64> = HashMap::new();
        for task in tasks {
            let agent = task
                .routing
                .agent
                .clone()
                .unwrap_or_else(|| "none".to_string());
            *counts
                .entry((task.status.to_string(), agent))
                .or_insert(0) += 1;
        }
        self.metrics.set_task_gauges(&counts);
    }
}

/// Whether `start` participates in a dependency cycle reachable from
/// itself.
fn in_dependency_cycle(start: &str, deps: &HashMap<&str, &[String]>) -> bool {
    let mut stack: Vec<&str> = deps.get(start).map_or(Vec::new(), |d| {
        d.iter().map(String::as_str).collect()
    });
    let mut seen: HashSet<&str> = HashSet::new();
    while let Some(current) = stack.pop() {
        if current == start {
            return true;
        }
        if !seen.insert(current) {
            continue;
        }
        if let Some(next) = deps.get(current) {
            stack.extend(next.iter().map(String::as_str));
        }
    }
    false
}

/// Transient failures worth retrying: underlying I/O errors.
fn is_transient(e: &anyhow::Error) -> bool {
    matches!(e.downcast_ref::<StoreError>(), Some(StoreError::Io(_)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dependency_cycle_detection() {
        let a = vec!["b".to_string()];
        let b = vec!["a".to_string()];
        let c = vec!["a".to_string()];
        let mut deps: HashMap<&str, &[String]> = HashMap::new();
        deps.insert("a", a.as_slice());
        deps.insert("b", b.as_slice());
        deps.insert("c", c.as_slice());

        assert!(in_dependency_cycle("a", &deps));
        assert!(in_dependency_cycle("b", &deps));
        // c depends on the cycle but is not part of it.
        assert!(!in_dependency_cycle("c", &deps));
    }
}
