//! The task store: the only component that reads or writes task files.
//!
//! Enforces the status transition graph, keeps the directory-equals-status
//! invariant, and performs every write atomically (temp sibling + rename).

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};

use crate::error::{Result, StoreError};
use crate::frontmatter;
use crate::fsutil;
use crate::layout::ProjectPaths;
use crate::model::{Lease, Priority, Routing, Task, TaskPatch, TaskStatus, SCHEMA_VERSION};
use crate::project;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Parameters for [`TaskStore::create`].
#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub title: String,
    pub body: String,
    pub priority: Priority,
    pub routing: Routing,
    pub depends_on: Vec<String>,
    pub parent_id: Option<String>,
    pub resource: Option<String>,
    pub metadata: BTreeMap<String, String>,
    pub created_by: String,
}

/// Filters for [`TaskStore::list`].
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub status: Option<TaskStatus>,
    pub agent: Option<String>,
}

/// A task file that failed to load.
#[derive(Debug, Clone)]
pub struct QuarantinedFile {
    pub path: PathBuf,
    pub reason: String,
}

/// Result of scanning every status directory once.
#[derive(Debug, Default)]
pub struct Snapshot {
    pub tasks: Vec<Task>,
    pub quarantined: Vec<QuarantinedFile>,
}

// ---------------------------------------------------------------------------
// TaskStore
// ---------------------------------------------------------------------------

/// Filesystem-backed task store for one project.
#[derive(Debug, Clone)]
pub struct TaskStore {
    project_id: String,
    paths: ProjectPaths,
}

impl TaskStore {
    /// Open the store for an existing project.
    pub fn open(vault: &Path, project_id: &str) -> Result<Self> {
        let paths = ProjectPaths::new(vault, project_id);
        if !paths.exists() {
            return Err(StoreError::ProjectNotFound(project_id.to_string()));
        }
        // Repair any missing status directories before first use.
        paths.ensure()?;
        Ok(Self {
            project_id: project_id.to_string(),
            paths,
        })
    }

    /// Create the project (manifest + skeleton) and open its store.
    pub fn create(vault: &Path, project_id: &str, name: &str) -> Result<Self> {
        project::create_project(vault, project_id, name, None)?;
        Self::open(vault, project_id)
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn paths(&self) -> &ProjectPaths {
        &self.paths
    }

    // -- Creation ----------------------------------------------------------

    /// Create a task in `backlog` with a freshly allocated id.
    pub fn create_task(&self, new: NewTask) -> Result<Task> {
        let now = Utc::now();
        let id = self.allocate_id(now)?;

        let task = Task {
            schema_version: SCHEMA_VERSION,
            id: id.clone(),
            project: self.project_id.clone(),
            title: new.title,
            status: TaskStatus::Backlog,
            priority: new.priority,
            routing: new.routing,
            depends_on: new.depends_on,
            parent_id: new.parent_id,
            resource: new.resource,
            lease: None,
            gate: None,
            gate_history: Vec::new(),
            review_context: None,
            dispatch_failures: 0,
            created_at: now,
            updated_at: now,
            last_transition_at: now,
            created_by: new.created_by,
            metadata: new.metadata,
            extra: BTreeMap::new(),
            body: new.body,
        };

        self.write(&task)?;
        Ok(task)
    }

    /// Allocate `<PREFIX>-<YYYYMMDD>-<seq>`, monotonic within the day.
    fn allocate_id(&self, now: DateTime<Utc>) -> Result<String> {
        let prefix = self.project_id.to_uppercase();
        let day = now.format("%Y%m%d").to_string();
        let stem = format!("{prefix}-{day}-");

        let mut max_seq = 0u32;
        for task in self.snapshot()?.tasks {
            if let Some(rest) = task.id.strip_prefix(&stem) {
                if let Ok(seq) = rest.parse::<u32>() {
                    max_seq = max_seq.max(seq);
                }
            }
        }
        Ok(format!("{stem}{:03}", max_seq + 1))
    }

    // -- Lookup ------------------------------------------------------------

    /// Exact id lookup across all status directories.
    pub fn get(&self, id: &str) -> Result<Option<Task>> {
        match self.locate(id)? {
            Some(path) => Ok(Some(self.load(&path)?)),
            None => Ok(None),
        }
    }

    /// Exact lookup that errors with [`StoreError::NotFound`].
    pub fn require(&self, id: &str) -> Result<Task> {
        self.get(id)?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    /// Case-sensitive prefix lookup. Errors when the prefix is ambiguous.
    pub fn get_by_prefix(&self, prefix: &str) -> Result<Option<Task>> {
        let matches: Vec<Task> = self
            .snapshot()?
            .tasks
            .into_iter()
            .filter(|t| t.id.starts_with(prefix))
            .collect();
        match matches.len() {
            0 => Ok(None),
            1 => Ok(matches.into_iter().next()),
            n => Err(StoreError::AmbiguousPrefix {
                prefix: prefix.to_string(),
                count: n,
            }),
        }
    }

    /// Enumerate tasks matching the filter, ordered by `created_at` then id.
    pub fn list(&self, filter: &ListFilter) -> Result<Vec<Task>> {
        let mut tasks = self.snapshot()?.tasks;
        if let Some(status) = filter.status {
            tasks.retain(|t| t.status == status);
        }
        if let Some(ref agent) = filter.agent {
            tasks.retain(|t| {
                t.routing.agent.as_deref() == Some(agent.as_str())
                    || t.lease.as_ref().is_some_and(|l| &l.agent == agent)
            });
        }
        Ok(tasks)
    }

    /// Count tasks per status.
    pub fn count_by_status(&self) -> Result<BTreeMap<TaskStatus, usize>> {
        let mut counts: BTreeMap<TaskStatus, usize> = BTreeMap::new();
        for status in TaskStatus::ALL {
            counts.insert(status, 0);
        }
        for task in self.snapshot()?.tasks {
            *counts.entry(task.status).or_insert(0) += 1;
        }
        Ok(counts)
    }

    /// Read every task file once. Corrupt files are quarantined (excluded
    /// from the task list, reported separately) rather than failing the scan.
    pub fn snapshot(&self) -> Result<Snapshot> {
        let mut snapshot = Snapshot::default();
        for status in TaskStatus::ALL {
            self.scan_dir(&self.paths.status_dir(status), &mut snapshot)?;
        }
        // Deadletter bucket lives under blocked/.
        self.scan_dir(&self.paths.deadletter_dir(), &mut snapshot)?;
        snapshot
            .tasks
            .sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(snapshot)
    }

    fn scan_dir(&self, dir: &Path, out: &mut Snapshot) -> Result<()> {
        if !dir.is_dir() {
            return Ok(());
        }
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("md") {
                continue;
            }
            match self.load(&path) {
                Ok(task) => out.tasks.push(task),
                Err(StoreError::Corrupt { path, reason }) => {
                    tracing::warn!(path = %path.display(), reason = %reason, "quarantining corrupt task file");
                    out.quarantined.push(QuarantinedFile { path, reason });
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    // -- Transitions -------------------------------------------------------

    /// Check whether `from -> to` is a legal edge in the status graph.
    ///
    /// ```text
    /// backlog     -> any          (administrative)
    /// ready       -> in-progress | blocked | backlog
    /// in-progress -> review | blocked | ready
    /// blocked     -> ready | backlog
    /// review      -> done | ready | in-progress | blocked
    /// ```
    ///
    /// `in-progress -> done` is never legal: completion must pass through
    /// `review`.
    pub fn is_valid_transition(from: TaskStatus, to: TaskStatus) -> bool {
        use TaskStatus::*;
        if from == to {
            return false;
        }
        matches!(
            (from, to),
            (Backlog, _)
                | (Ready, InProgress)
                | (Ready, Blocked)
                | (Ready, Backlog)
                | (InProgress, Review)
                | (InProgress, Blocked)
                | (InProgress, Ready)
                | (Blocked, Ready)
                | (Blocked, Backlog)
                | (Review, Done)
                | (Review, Ready)
                | (Review, InProgress)
                | (Review, Blocked)
        )
    }

    /// Move a task to a new status: validates the edge, rewrites
    /// front-matter, and renames the file into the destination directory.
    pub fn transition(&self, id: &str, to: TaskStatus, reason: Option<&str>) -> Result<Task> {
        let path = self
            .locate(id)?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let mut task = self.load(&path)?;
        let from = task.status;

        if !Self::is_valid_transition(from, to) {
            return Err(StoreError::InvalidTransition {
                id: id.to_string(),
                from,
                to,
            });
        }

        let now = Utc::now();
        task.status = to;
        task.updated_at = now;
        task.last_transition_at = now;
        if let Some(reason) = reason {
            task.metadata
                .insert("lastTransitionReason".to_string(), reason.to_string());
        }
        // Leaving in-progress releases the lease, except into blocked: a
        // blocked holder keeps its claim until the scheduler expires it.
        if from == TaskStatus::InProgress && to != TaskStatus::Blocked {
            task.lease = None;
        }

        let dest = self.paths.task_file(to, id);
        let content = self.render(&task)?;
        fsutil::move_with_content(&path, &dest, &content)?;
        Ok(task)
    }

    /// Cancel a task: stamp the reason and move it straight to `done`.
    ///
    /// Cancellation is administrative and bypasses the transition graph; the
    /// lease, if any, is cleared.
    pub fn cancel(&self, id: &str, reason: &str) -> Result<Task> {
        let path = self
            .locate(id)?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let mut task = self.load(&path)?;
        if task.status.is_terminal() {
            return Err(StoreError::InvalidTransition {
                id: id.to_string(),
                from: task.status,
                to: TaskStatus::Done,
            });
        }

        let now = Utc::now();
        task.status = TaskStatus::Done;
        task.lease = None;
        task.updated_at = now;
        task.last_transition_at = now;
        task.metadata
            .insert("cancelled".to_string(), reason.to_string());

        let dest = self.paths.task_file(TaskStatus::Done, id);
        let content = self.render(&task)?;
        fsutil::move_with_content(&path, &dest, &content)?;
        Ok(task)
    }

    /// Block a task with a reason.
    pub fn block(&self, id: &str, reason: &str) -> Result<Task> {
        self.transition(id, TaskStatus::Blocked, Some(reason))
    }

    /// Return a blocked task to `ready`.
    pub fn unblock(&self, id: &str) -> Result<Task> {
        self.transition(id, TaskStatus::Ready, Some("unblocked"))
    }

    /// Move a task into the deadletter bucket (`blocked/deadletter/`).
    pub fn deadletter(&self, id: &str, reason: &str) -> Result<Task> {
        let path = self
            .locate(id)?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let mut task = self.load(&path)?;

        let now = Utc::now();
        task.status = TaskStatus::Blocked;
        task.lease = None;
        task.updated_at = now;
        task.last_transition_at = now;
        task.metadata
            .insert("deadletter".to_string(), reason.to_string());

        let dest = self.paths.deadletter_dir().join(format!("{id}.md"));
        let content = self.render(&task)?;
        fsutil::move_with_content(&path, &dest, &content)?;
        Ok(task)
    }

    /// Delete a task file.
    pub fn delete(&self, id: &str) -> Result<()> {
        let path = self
            .locate(id)?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        std::fs::remove_file(path)?;
        Ok(())
    }

    // -- Mutation ----------------------------------------------------------

    /// Apply a partial front-matter patch. Identity and status fields are
    /// not reachable through this path.
    pub fn update(&self, id: &str, patch: TaskPatch) -> Result<Task> {
        self.mutate(id, |task| {
            if let Some(title) = patch.title {
                task.title = title;
            }
            if let Some(priority) = patch.priority {
                task.priority = priority;
            }
            if let Some(routing) = patch.routing {
                task.routing = routing;
            }
            if let Some(resource) = patch.resource {
                task.resource = resource;
            }
            if let Some(gate) = patch.gate {
                task.gate = gate;
            }
            if let Some(history) = patch.gate_history {
                task.gate_history = history;
            }
            if let Some(review) = patch.review_context {
                task.review_context = review;
            }
            if let Some(metadata) = patch.metadata {
                task.metadata = metadata;
            }
            Ok(())
        })
    }

    /// Replace the markdown body.
    pub fn update_body(&self, id: &str, body: &str) -> Result<Task> {
        self.mutate(id, |task| {
            task.body = body.to_string();
            if !task.body.is_empty() && !task.body.ends_with('\n') {
                task.body.push('\n');
            }
            Ok(())
        })
    }

    /// Record `count` consecutive dispatch failures on the task.
    pub fn set_dispatch_failures(&self, id: &str, count: u32) -> Result<Task> {
        self.mutate(id, |task| {
            task.dispatch_failures = count;
            Ok(())
        })
    }

    // -- Dependencies ------------------------------------------------------

    /// Add a dependency edge `id -> blocker_id`. Rejects self-references,
    /// unknown blockers, and cycles (DFS over `depends_on`).
    pub fn add_dep(&self, id: &str, blocker_id: &str) -> Result<Task> {
        if id == blocker_id {
            return Err(StoreError::CycleDetected(format!(
                "{id} cannot depend on itself"
            )));
        }
        if self.locate(blocker_id)?.is_none() {
            return Err(StoreError::NotFound(blocker_id.to_string()));
        }

        // Would adding id -> blocker_id close a cycle? Walk from blocker_id.
        let tasks = self.snapshot()?.tasks;
        let deps: HashMap<&str, &[String]> = tasks
            .iter()
            .map(|t| (t.id.as_str(), t.depends_on.as_slice()))
            .collect();
        let mut stack = vec![blocker_id];
        let mut seen: HashSet<&str> = HashSet::new();
        while let Some(current) = stack.pop() {
            if current == id {
                return Err(StoreError::CycleDetected(format!(
                    "{id} -> {blocker_id} closes a dependency cycle"
                )));
            }
            if !seen.insert(current) {
                continue;
            }
            if let Some(next) = deps.get(current) {
                stack.extend(next.iter().map(String::as_str));
            }
        }

        self.mutate(id, |task| {
            if !task.depends_on.iter().any(|d| d == blocker_id) {
                task.depends_on.push(blocker_id.to_string());
            }
            Ok(())
        })
    }

    /// Remove a dependency edge.
    pub fn remove_dep(&self, id: &str, blocker_id: &str) -> Result<Task> {
        self.mutate(id, |task| {
            task.depends_on.retain(|d| d != blocker_id);
            Ok(())
        })
    }

    // -- Leases ------------------------------------------------------------

    /// Acquire a lease. Fails with [`StoreError::LeaseHeld`] if an active
    /// lease exists. The rewrite-and-rename is the atomicity boundary.
    pub fn set_lease(&self, id: &str, agent: &str, ttl: Duration) -> Result<Lease> {
        let now = Utc::now();
        let lease = Lease {
            agent: agent.to_string(),
            acquired_at: now,
            expires_at: now + ttl,
            renewal_count: 0,
        };
        let stamped = lease.clone();
        self.mutate(id, move |task| {
            if let Some(existing) = &task.lease {
                if existing.is_active(now) {
                    return Err(StoreError::LeaseHeld {
                        id: task.id.clone(),
                        holder: existing.agent.clone(),
                    });
                }
            }
            task.lease = Some(stamped.clone());
            Ok(())
        })?;
        Ok(lease)
    }

    /// Renew the lease held by `agent`, extending expiry by `ttl` from now.
    pub fn renew_lease(&self, id: &str, agent: &str, ttl: Duration) -> Result<Lease> {
        let now = Utc::now();
        let task = self.mutate(id, |task| {
            let Some(lease) = task.lease.as_mut() else {
                return Err(StoreError::LeaseNotHeld {
                    id: task.id.clone(),
                    agent: agent.to_string(),
                });
            };
            if lease.agent != agent || lease.is_expired(now) {
                return Err(StoreError::LeaseNotHeld {
                    id: task.id.clone(),
                    agent: agent.to_string(),
                });
            }
            lease.expires_at = now + ttl;
            lease.renewal_count += 1;
            Ok(())
        })?;
        Ok(task.lease.expect("lease present after renewal"))
    }

    /// Clear the lease. With `Some(agent)` only the holder may clear; with
    /// `None` the clear is forced (scheduler expiry path).
    pub fn clear_lease(&self, id: &str, agent: Option<&str>) -> Result<Task> {
        self.mutate(id, |task| {
            if let Some(expected) = agent {
                let held = task
                    .lease
                    .as_ref()
                    .is_some_and(|l| l.agent == expected);
                if !held {
                    return Err(StoreError::LeaseNotHeld {
                        id: task.id.clone(),
                        agent: expected.to_string(),
                    });
                }
            }
            task.lease = None;
            Ok(())
        })
    }

    // -- Artifacts ---------------------------------------------------------

    /// Write an output file under `artifacts/<id>/`. The filename must be a
    /// bare name (no separators, no parent references).
    pub fn write_task_output(&self, id: &str, filename: &str, content: &str) -> Result<PathBuf> {
        if filename.is_empty()
            || filename.contains('/')
            || filename.contains('\\')
            || filename.contains("..")
        {
            return Err(StoreError::InvalidOutputName(filename.to_string()));
        }
        // The task must exist.
        self.require(id)?;

        let dir = self.paths.artifacts_dir(id);
        fsutil::ensure_dir(&dir)?;
        let path = dir.join(filename);
        fsutil::write_atomic(&path, content)?;
        Ok(path)
    }

    // -- Internals ---------------------------------------------------------

    /// Find the file for `id`, searching every status directory plus the
    /// deadletter bucket.
    fn locate(&self, id: &str) -> Result<Option<PathBuf>> {
        let file = format!("{id}.md");
        for status in TaskStatus::ALL {
            let candidate = self.paths.status_dir(status).join(&file);
            if candidate.is_file() {
                return Ok(Some(candidate));
            }
        }
        let deadletter = self.paths.deadletter_dir().join(&file);
        if deadletter.is_file() {
            return Ok(Some(deadletter));
        }
        Ok(None)
    }

    fn load(&self, path: &Path) -> Result<Task> {
        let content = std::fs::read_to_string(path)?;
        frontmatter::parse(&content).map_err(|e| StoreError::Corrupt {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    fn render(&self, task: &Task) -> Result<String> {
        frontmatter::render(task).map_err(|e| StoreError::Corrupt {
            path: self.paths.task_file(task.status, &task.id),
            reason: e.to_string(),
        })
    }

    /// Write a task at its status-derived location.
    fn write(&self, task: &Task) -> Result<()> {
        let path = self.paths.task_file(task.status, &task.id);
        let content = self.render(task)?;
        fsutil::write_atomic(&path, &content)?;
        Ok(())
    }

    /// Load, mutate in place, stamp `updated_at`, and write back. The write
    /// happens at the file's current location (status is untouched).
    fn mutate<F>(&self, id: &str, f: F) -> Result<Task>
    where
        F: FnOnce(&mut Task) -> Result<()>,
    {
        let path = self
            .locate(id)?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let mut task = self.load(&path)?;
        f(&mut task)?;
        task.updated_at = Utc::now();
        let content = self.render(&task)?;
        fsutil::write_atomic(&path, &content)?;
        Ok(task)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> (tempfile::TempDir, TaskStore) {
        let dir = tempfile::TempDir::new().unwrap();
        let store = TaskStore::create(dir.path(), "demo", "Demo").unwrap();
        (dir, store)
    }

    fn new_task(title: &str) -> NewTask {
        NewTask {
            title: title.to_string(),
            created_by: "tester".to_string(),
            ..NewTask::default()
        }
    }

    #[test]
    fn ids_are_project_prefixed_and_monotonic() {
        let (_dir, store) = temp_store();
        let a = store.create_task(new_task("a")).unwrap();
        let b = store.create_task(new_task("b")).unwrap();
        assert!(a.id.starts_with("DEMO-"));
        assert!(a.id.ends_with("-001"));
        assert!(b.id.ends_with("-002"));
    }

    #[test]
    fn in_progress_to_done_is_never_legal() {
        assert!(!TaskStore::is_valid_transition(
            TaskStatus::InProgress,
            TaskStatus::Done
        ));
    }

    #[test]
    fn self_transition_is_rejected() {
        assert!(!TaskStore::is_valid_transition(
            TaskStatus::Ready,
            TaskStatus::Ready
        ));
    }

    #[test]
    fn backlog_moves_anywhere() {
        for to in [
            TaskStatus::Ready,
            TaskStatus::InProgress,
            TaskStatus::Blocked,
            TaskStatus::Review,
            TaskStatus::Done,
        ] {
            assert!(
                TaskStore::is_valid_transition(TaskStatus::Backlog, to),
                "backlog -> {to} should be administrative"
            );
        }
    }

    #[test]
    fn add_dep_rejects_self_reference() {
        let (_dir, store) = temp_store();
        let t = store.create_task(new_task("t")).unwrap();
        let err = store.add_dep(&t.id, &t.id).unwrap_err();
        assert!(matches!(err, StoreError::CycleDetected(_)));
    }

    #[test]
    fn add_dep_rejects_cycle() {
        let (_dir, store) = temp_store();
        let a = store.create_task(new_task("a")).unwrap();
        let b = store.create_task(new_task("b")).unwrap();
        let c = store.create_task(new_task("c")).unwrap();
        store.add_dep(&a.id, &b.id).unwrap();
        store.add_dep(&b.id, &c.id).unwrap();
        let err = store.add_dep(&c.id, &a.id).unwrap_err();
        assert!(matches!(err, StoreError::CycleDetected(_)));
    }

    #[test]
    fn write_task_output_rejects_path_escapes() {
        let (_dir, store) = temp_store();
        let t = store.create_task(new_task("t")).unwrap();
        for bad in ["../evil", "a/b", "a\\b", ""] {
            let err = store.write_task_output(&t.id, bad, "x").unwrap_err();
            assert!(matches!(err, StoreError::InvalidOutputName(_)), "{bad}");
        }
        let path = store.write_task_output(&t.id, "notes.md", "ok").unwrap();
        assert!(path.ends_with(format!("artifacts/{}/notes.md", t.id)));
    }
}
