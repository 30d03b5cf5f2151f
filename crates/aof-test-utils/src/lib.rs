//! Shared test utilities for aof integration tests.
//!
//! Provides temporary vaults seeded with a project, plus small builders for
//! tasks in specific states. The returned [`tempfile::TempDir`] must be kept
//! alive for the duration of the test.

use std::collections::BTreeMap;

use chrono::Duration;
use tempfile::TempDir;

use aof_store::store::NewTask;
use aof_store::{Priority, Routing, Task, TaskStatus, TaskStore};

/// Default project id used by the helpers.
pub const TEST_PROJECT: &str = "demo";

/// Create a temp vault containing one empty project and open its store.
pub fn create_test_vault() -> (TempDir, TaskStore) {
    let dir = TempDir::new().expect("failed to create temp vault");
    let store =
        TaskStore::create(dir.path(), TEST_PROJECT, "Demo Project").expect("failed to seed project");
    (dir, store)
}

/// Builder for seeding tasks in arbitrary states.
pub struct TaskSeed {
    title: String,
    priority: Priority,
    routing: Routing,
    depends_on: Vec<String>,
    parent_id: Option<String>,
    resource: Option<String>,
    status: TaskStatus,
    lease_ttl: Option<Duration>,
    lease_agent: String,
}

impl TaskSeed {
    pub fn new(title: &str) -> Self {
        Self {
            title: title.to_string(),
            priority: Priority::Normal,
            routing: Routing::default(),
            depends_on: Vec::new(),
            parent_id: None,
            resource: None,
            status: TaskStatus::Backlog,
            lease_ttl: None,
            lease_agent: "agent-1".to_string(),
        }
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn routing(mut self, routing: Routing) -> Self {
        self.routing = routing;
        self
    }

    pub fn tags(mut self, tags: &[&str]) -> Self {
        self.routing.tags = tags.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn agent(mut self, agent: &str) -> Self {
        self.routing.agent = Some(agent.to_string());
        self
    }

    pub fn team(mut self, team: &str) -> Self {
        self.routing.team = Some(team.to_string());
        self
    }

    pub fn workflow(mut self, workflow: &str) -> Self {
        self.routing.workflow = Some(workflow.to_string());
        self
    }

    pub fn depends_on(mut self, ids: &[&str]) -> Self {
        self.depends_on = ids.iter().map(|i| i.to_string()).collect();
        self
    }

    pub fn parent(mut self, id: &str) -> Self {
        self.parent_id = Some(id.to_string());
        self
    }

    pub fn resource(mut self, resource: &str) -> Self {
        self.resource = Some(resource.to_string());
        self
    }

    pub fn status(mut self, status: TaskStatus) -> Self {
        self.status = status;
        self
    }

    /// Attach a lease once the task is seeded. Negative TTLs produce an
    /// already-expired lease.
    pub fn lease(mut self, agent: &str, ttl: Duration) -> Self {
        self.lease_agent = agent.to_string();
        self.lease_ttl = Some(ttl);
        self
    }

    /// Create the task and walk it to the requested status.
    pub fn build(self, store: &TaskStore) -> Task {
        let task = store
            .create_task(NewTask {
                title: self.title,
                priority: self.priority,
                routing: self.routing,
                depends_on: self.depends_on,
                parent_id: self.parent_id,
                resource: self.resource,
                metadata: BTreeMap::new(),
                created_by: "test-seed".to_string(),
                ..NewTask::default()
            })
            .expect("failed to create seed task");

        let id = task.id.clone();
        let steps: &[TaskStatus] = match self.status {
            TaskStatus::Backlog => &[],
            TaskStatus::Ready => &[TaskStatus::Ready],
            TaskStatus::InProgress => &[TaskStatus::Ready, TaskStatus::InProgress],
            TaskStatus::Blocked => &[TaskStatus::Ready, TaskStatus::Blocked],
            TaskStatus::Review => &[
                TaskStatus::Ready,
                TaskStatus::InProgress,
                TaskStatus::Review,
            ],
            TaskStatus::Done => &[
                TaskStatus::Ready,
                TaskStatus::InProgress,
                TaskStatus::Review,
                TaskStatus::Done,
            ],
        };

        let mut current = task;
        for step in steps {
            current = store
                .transition(&id, *step, None)
                .expect("seed transition failed");
        }

        if let Some(ttl) = self.lease_ttl {
            store
                .set_lease(&id, &self.lease_agent, ttl)
                .expect("seed lease failed");
            current = store.require(&id).expect("reload after lease");
        }

        current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeds_reach_requested_status() {
        let (_dir, store) = create_test_vault();
        for status in TaskStatus::ALL {
            let task = TaskSeed::new(&format!("task {status}"))
                .status(status)
                .build(&store);
            assert_eq!(task.status, status);
        }
    }

    #[test]
    fn seed_lease_can_be_pre_expired() {
        let (_dir, store) = create_test_vault();
        let task = TaskSeed::new("expired lease")
            .status(TaskStatus::InProgress)
            .lease("agent-9", Duration::seconds(-5))
            .build(&store);
        let lease = task.lease.expect("lease should be set");
        assert!(lease.is_expired(chrono::Utc::now()));
        assert_eq!(lease.agent, "agent-9");
    }
}
