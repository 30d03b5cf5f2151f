//! Structural validation of a project's task tree.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use crate::error::Result;
use crate::frontmatter;
use crate::model::{Task, TaskStatus};
use crate::store::TaskStore;

/// Category of a lint finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueKind {
    /// A `.md` file inside `tasks/` but outside the status directories.
    StrayFile,
    /// Front-matter `status` disagrees with the enclosing directory.
    StatusMismatch,
    /// The same task id appears in more than one file.
    DuplicateId,
    /// `parent_id` or `depends_on` references a task that does not exist.
    DanglingReference,
    /// The file could not be parsed and is excluded from scheduling.
    Corrupt,
}

impl fmt::Display for IssueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::StrayFile => "stray-file",
            Self::StatusMismatch => "status-mismatch",
            Self::DuplicateId => "duplicate-id",
            Self::DanglingReference => "dangling-reference",
            Self::Corrupt => "corrupt",
        };
        f.write_str(s)
    }
}

/// One lint finding.
#[derive(Debug, Clone)]
pub struct LintIssue {
    pub kind: IssueKind,
    pub path: PathBuf,
    pub detail: String,
}

/// A task file together with the status implied by its directory.
struct WalkedFile {
    path: PathBuf,
    dir_status: TaskStatus,
    task: Task,
}

/// Run all structural checks over the project.
pub fn lint(store: &TaskStore) -> Result<Vec<LintIssue>> {
    let mut issues = Vec::new();
    let mut files: Vec<WalkedFile> = Vec::new();

    // Walk every status directory (plus the deadletter bucket) ourselves so
    // each finding carries the real source path.
    for status in TaskStatus::ALL {
        walk_dir(
            store.paths().status_dir(status),
            status,
            &mut files,
            &mut issues,
        )?;
    }
    walk_dir(
        store.paths().deadletter_dir(),
        TaskStatus::Blocked,
        &mut files,
        &mut issues,
    )?;

    // Stray .md files in non-status locations under tasks/.
    let tasks_dir = store.paths().tasks_dir();
    if tasks_dir.is_dir() {
        for entry in std::fs::read_dir(&tasks_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let is_status = TaskStatus::ALL.iter().any(|s| s.dir_name() == name);
            if entry.file_type()?.is_dir() && !is_status {
                for sub in std::fs::read_dir(entry.path())? {
                    let sub_path = sub?.path();
                    if sub_path.extension().and_then(|e| e.to_str()) == Some("md") {
                        issues.push(LintIssue {
                            kind: IssueKind::StrayFile,
                            path: sub_path,
                            detail: format!("directory {name:?} is not a status directory"),
                        });
                    }
                }
            } else if entry.file_type()?.is_file() && name.ends_with(".md") {
                issues.push(LintIssue {
                    kind: IssueKind::StrayFile,
                    path: entry.path(),
                    detail: "task file directly under tasks/".to_string(),
                });
            }
        }
    }

    // Directory-equals-status.
    for file in &files {
        if file.task.status != file.dir_status {
            issues.push(LintIssue {
                kind: IssueKind::StatusMismatch,
                path: file.path.clone(),
                detail: format!(
                    "front-matter says {} but file lives in {}/",
                    file.task.status,
                    file.dir_status.dir_name()
                ),
            });
        }
    }

    // Duplicate ids.
    let mut seen: HashMap<&str, &PathBuf> = HashMap::new();
    for file in &files {
        if let Some(first) = seen.get(file.task.id.as_str()) {
            issues.push(LintIssue {
                kind: IssueKind::DuplicateId,
                path: file.path.clone(),
                detail: format!("id {} also present at {}", file.task.id, first.display()),
            });
        } else {
            seen.insert(file.task.id.as_str(), &file.path);
        }
    }

    // Dangling parent/dependency references.
    for file in &files {
        if let Some(parent) = &file.task.parent_id {
            if !seen.contains_key(parent.as_str()) {
                issues.push(LintIssue {
                    kind: IssueKind::DanglingReference,
                    path: file.path.clone(),
                    detail: format!("parent {parent} does not exist"),
                });
            }
        }
        for dep in &file.task.depends_on {
            if !seen.contains_key(dep.as_str()) {
                issues.push(LintIssue {
                    kind: IssueKind::DanglingReference,
                    path: file.path.clone(),
                    detail: format!("dependency {dep} does not exist"),
                });
            }
        }
    }

    Ok(issues)
}

fn walk_dir(
    dir: PathBuf,
    dir_status: TaskStatus,
    files: &mut Vec<WalkedFile>,
    issues: &mut Vec<LintIssue>,
) -> Result<()> {
    if !dir.is_dir() {
        return Ok(());
    }
    for entry in std::fs::read_dir(&dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("md") {
            continue;
        }
        let content = std::fs::read_to_string(&path)?;
        match frontmatter::parse(&content) {
            Ok(task) => files.push(WalkedFile {
                path,
                dir_status,
                task,
            }),
            Err(e) => issues.push(LintIssue {
                kind: IssueKind::Corrupt,
                path,
                detail: e.to_string(),
            }),
        }
    }
    Ok(())
}

/// Render findings as the markdown lint report.
pub fn render_report(issues: &[LintIssue]) -> String {
    let mut out = String::from("# Lint Report\n\n");
    if issues.is_empty() {
        out.push_str("No issues found.\n");
        return out;
    }
    out.push_str(&format!("{} issue(s) found.\n\n", issues.len()));
    for issue in issues {
        out.push_str(&format!(
            "- **{}** `{}` — {}\n",
            issue.kind,
            issue.path.display(),
            issue.detail
        ));
    }
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
