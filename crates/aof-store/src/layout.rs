//! Canonical vault layout.
//!
//! ```text
//! <vault>/Projects/<projectId>/
//!   project.yaml
//!   tasks/{backlog,ready,in-progress,blocked,review,done}/<task-id>.md
//!   events/YYYY-MM-DD.jsonl
//!   artifacts/<task-id>/
//!   state/
//! ```

use std::io;
use std::path::{Path, PathBuf};

use crate::fsutil;
use crate::model::TaskStatus;

/// Sub-directory of `blocked/` that holds deadlettered tasks.
pub const DEADLETTER_DIR: &str = "deadletter";

/// Paths within a single project directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectPaths {
    root: PathBuf,
}

impl ProjectPaths {
    /// Paths for `<vault>/Projects/<project_id>`.
    pub fn new(vault: &Path, project_id: &str) -> Self {
        Self {
            root: vault.join("Projects").join(project_id),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn manifest(&self) -> PathBuf {
        self.root.join("project.yaml")
    }

    pub fn tasks_dir(&self) -> PathBuf {
        self.root.join("tasks")
    }

    pub fn status_dir(&self, status: TaskStatus) -> PathBuf {
        self.tasks_dir().join(status.dir_name())
    }

    /// Deadletter bucket: a sub-directory of `blocked/` by convention.
    pub fn deadletter_dir(&self) -> PathBuf {
        self.status_dir(TaskStatus::Blocked).join(DEADLETTER_DIR)
    }

    pub fn task_file(&self, status: TaskStatus, task_id: &str) -> PathBuf {
        self.status_dir(status).join(format!("{task_id}.md"))
    }

    pub fn events_dir(&self) -> PathBuf {
        self.root.join("events")
    }

    pub fn artifacts_dir(&self, task_id: &str) -> PathBuf {
        self.root.join("artifacts").join(task_id)
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.join("state")
    }

    pub fn lint_report(&self) -> PathBuf {
        self.state_dir().join("lint-report.md")
    }

    /// Create the full directory skeleton. Idempotent.
    pub fn ensure(&self) -> io::Result<()> {
        for status in TaskStatus::ALL {
            fsutil::ensure_dir(&self.status_dir(status))?;
        }
        fsutil::ensure_dir(&self.deadletter_dir())?;
        fsutil::ensure_dir(&self.events_dir())?;
        fsutil::ensure_dir(&self.root.join("artifacts"))?;
        fsutil::ensure_dir(&self.state_dir())?;
        Ok(())
    }

    pub fn exists(&self) -> bool {
        self.manifest().is_file()
    }
}

/// Enumerate project ids present under `<vault>/Projects`.
pub fn list_project_ids(vault: &Path) -> io::Result<Vec<String>> {
    let projects = vault.join("Projects");
    if !projects.is_dir() {
        return Ok(Vec::new());
    }
    let mut ids = Vec::new();
    for entry in std::fs::read_dir(&projects)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            ids.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    ids.sort();
    Ok(ids)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_creates_full_skeleton() {
        let dir = tempfile::TempDir::new().unwrap();
        let paths = ProjectPaths::new(dir.path(), "demo");
        paths.ensure().unwrap();

        for status in TaskStatus::ALL {
            assert!(paths.status_dir(status).is_dir(), "{status} dir missing");
        }
        assert!(paths.deadletter_dir().is_dir());
        assert!(paths.events_dir().is_dir());
        assert!(paths.state_dir().is_dir());
        // Idempotent.
        paths.ensure().unwrap();
    }

    #[test]
    fn list_project_ids_is_sorted() {
        let dir = tempfile::TempDir::new().unwrap();
        for id in ["zeta", "alpha"] {
            ProjectPaths::new(dir.path(), id).ensure().unwrap();
        }
        let ids = list_project_ids(dir.path()).unwrap();
        assert_eq!(ids, vec!["alpha", "zeta"]);
    }

    #[test]
    fn list_project_ids_empty_vault() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(list_project_ids(dir.path()).unwrap().is_empty());
    }
}
