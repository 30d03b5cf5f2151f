//! Mock executor for tests and dry wiring.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;

use super::{Executor, SpawnOutcome, TaskContext};

/// Records every spawn and can be scripted to fail the next N attempts or
/// to take a fixed amount of time per spawn.
#[derive(Debug, Default)]
pub struct MockExecutor {
    spawned: Mutex<Vec<TaskContext>>,
    fail_next: AtomicUsize,
    delay_ms: AtomicUsize,
    counter: AtomicUsize,
}

impl MockExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` spawn calls report failure.
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Make every spawn take `ms` milliseconds.
    pub fn set_delay_ms(&self, ms: usize) {
        self.delay_ms.store(ms, Ordering::SeqCst);
    }

    /// Contexts of every spawn attempt so far, in order.
    pub fn spawned(&self) -> Vec<TaskContext> {
        self.spawned.lock().expect("mock lock poisoned").clone()
    }

    pub fn spawn_count(&self) -> usize {
        self.spawned.lock().expect("mock lock poisoned").len()
    }
}

#[async_trait]
impl Executor for MockExecutor {
    fn name(&self) -> &str {
        "mock"
    }

    async fn spawn(&self, ctx: &TaskContext) -> Result<SpawnOutcome> {
        self.spawned
            .lock()
            .expect("mock lock poisoned")
            .push(ctx.clone());

        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(delay as u64)).await;
        }

        let remaining = self.fail_next.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_next.store(remaining - 1, Ordering::SeqCst);
            return Ok(SpawnOutcome::failure("scripted failure"));
        }

        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        Ok(SpawnOutcome::success(format!("mock-session-{n}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aof_store::Routing;
    use std::collections::BTreeMap;

    fn ctx(id: &str) -> TaskContext {
        TaskContext {
            task_id: id.to_string(),
            project: "demo".to_string(),
            title: "t".to_string(),
            agent: "agent-1".to_string(),
            workflow: None,
            gate: None,
            routing: Routing::default(),
            depends_on: vec![],
            metadata: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn records_spawns_and_issues_session_ids() {
        let mock = MockExecutor::new();
        let outcome = mock.spawn(&ctx("T-1")).await.unwrap();
        assert!(outcome.ok);
        assert_eq!(outcome.session_id.as_deref(), Some("mock-session-0"));
        assert_eq!(mock.spawn_count(), 1);
        assert_eq!(mock.spawned()[0].task_id, "T-1");
    }

    #[tokio::test]
    async fn scripted_failures_are_consumed_in_order() {
        let mock = MockExecutor::new();
        mock.fail_next(2);

        assert!(!mock.spawn(&ctx("T-1")).await.unwrap().ok);
        assert!(!mock.spawn(&ctx("T-2")).await.unwrap().ok);
        assert!(mock.spawn(&ctx("T-3")).await.unwrap().ok);
    }
}
