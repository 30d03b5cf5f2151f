//! The `Executor` trait -- the adapter interface for starting agents.
//!
//! The scheduler hands an executor a read-only task context and does not
//! await the agent's completion; the agent reports back later through the
//! tool surface. The trait is object-safe so implementations can be stored
//! as `Arc<dyn Executor>`.

pub mod mock;

use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;

use aof_store::{Routing, Task};

pub use mock::MockExecutor;

/// Read-only view of a task handed to the executor at dispatch time.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskContext {
    pub task_id: String,
    pub project: String,
    pub title: String,
    /// The agent the task is being assigned to.
    pub agent: String,
    pub workflow: Option<String>,
    pub gate: Option<String>,
    pub routing: Routing,
    pub depends_on: Vec<String>,
    pub metadata: BTreeMap<String, String>,
}

impl TaskContext {
    /// Build a context from a task and the resolved agent.
    pub fn from_task(task: &Task, agent: &str) -> Self {
        Self {
            task_id: task.id.clone(),
            project: task.project.clone(),
            title: task.title.clone(),
            agent: agent.to_string(),
            workflow: task.routing.workflow.clone(),
            gate: task.gate.as_ref().map(|g| g.current.clone()),
            routing: task.routing.clone(),
            depends_on: task.depends_on.clone(),
            metadata: task.metadata.clone(),
        }
    }
}

/// Outcome of a spawn attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnOutcome {
    pub ok: bool,
    pub session_id: Option<String>,
    pub error: Option<String>,
}

impl SpawnOutcome {
    pub fn success(session_id: impl Into<String>) -> Self {
        Self {
            ok: true,
            session_id: Some(session_id.into()),
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            session_id: None,
            error: Some(error.into()),
        }
    }
}

/// Adapter interface for assigning a task to an agent (HTTP, subprocess,
/// or message -- the core does not care).
#[async_trait]
pub trait Executor: Send + Sync {
    /// Human-readable name for this executor (e.g. "mock", "subprocess").
    fn name(&self) -> &str;

    /// Start the agent for the given task.
    ///
    /// An `Err` means the spawn machinery itself failed; a
    /// `SpawnOutcome { ok: false, .. }` means the target rejected the task.
    /// The scheduler treats both as dispatch failures.
    async fn spawn(&self, ctx: &TaskContext) -> Result<SpawnOutcome>;
}

// Compile-time assertion: Executor must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn Executor) {}
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn executor_is_object_safe() {
        let executor: Box<dyn Executor> = Box::new(MockExecutor::new());
        assert_eq!(executor.name(), "mock");
    }
}
