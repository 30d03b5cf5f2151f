//! `aof status` command: read-only per-project counts and task listing.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;

use aof_store::{ListFilter, TaskStore};

/// Print status counts and the task list for a project.
pub fn run_status(vault: &Path, project: &str) -> Result<()> {
    let store = TaskStore::open(vault, project)
        .with_context(|| format!("failed to open project {project}"))?;

    let counts = store.count_by_status()?;
    let total: usize = counts.values().sum();
    println!("Project: {project} ({total} tasks)");
    let line = counts
        .iter()
        .map(|(status, count)| format!("{status}={count}"))
        .collect::<Vec<_>>()
        .join(" ");
    println!("  {line}");
    println!();

    let tasks = store.list(&ListFilter::default())?;
    if tasks.is_empty() {
        return Ok(());
    }

    let now = Utc::now();
    println!("Tasks:");
    for task in &tasks {
        let status_icon = match task.status {
            aof_store::TaskStatus::Backlog => ".",
            aof_store::TaskStatus::Ready => ">",
            aof_store::TaskStatus::InProgress => "*",
            aof_store::TaskStatus::Blocked => "x",
            aof_store::TaskStatus::Review => "?",
            aof_store::TaskStatus::Done => "+",
        };
        let lease = match &task.lease {
            Some(l) if l.is_active(now) => format!(" (leased by {})", l.agent),
            Some(l) => format!(" (expired lease: {})", l.agent),
            None => String::new(),
        };
        println!("  [{status_icon}] {} — {}{lease}", task.id, task.title);
    }
    Ok(())
}
