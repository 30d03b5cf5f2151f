//! `aof projects` subcommands: create, list, lint.

use std::path::Path;

use anyhow::{Context, Result};

use aof_store::{lint, project, TaskStore};

/// Create a project under the vault.
pub fn run_create(vault: &Path, id: &str, name: Option<&str>, parent: Option<&str>) -> Result<()> {
    let display_name = name.unwrap_or(id);
    let manifest = project::create_project(vault, id, display_name, parent)
        .with_context(|| format!("failed to create project {id}"))?;
    println!("Created project {} ({})", manifest.id, manifest.name);
    println!("  {}", vault.join("Projects").join(&manifest.id).display());
    Ok(())
}

/// List projects with task counts.
pub fn run_list(vault: &Path) -> Result<()> {
    let manifests = project::list_projects(vault)?;
    if manifests.is_empty() {
        println!("No projects found under {}", vault.display());
        return Ok(());
    }

    println!("{:<20} {:<30} {:>8}", "ID", "NAME", "TASKS");
    println!("{}", "-".repeat(60));
    for manifest in &manifests {
        let total = TaskStore::open(vault, &manifest.id)
            .and_then(|s| s.count_by_status())
            .map(|counts| counts.values().sum::<usize>())
            .unwrap_or(0);
        println!("{:<20} {:<30} {:>8}", manifest.id, manifest.name, total);
    }
    Ok(())
}

/// Lint every project; returns the total issue count.
pub fn run_lint_all(vault: &Path) -> Result<usize> {
    let manifests = project::list_projects(vault)?;
    let mut total = 0usize;
    for manifest in &manifests {
        let store = TaskStore::open(vault, &manifest.id)?;
        let issues = lint::lint(&store)?;
        if !issues.is_empty() {
            println!("{}: {} issue(s)", manifest.id, issues.len());
            for issue in &issues {
                println!("  [{}] {} — {}", issue.kind, issue.path.display(), issue.detail);
            }
        }
        total += issues.len();
    }
    if total == 0 {
        println!("All projects clean.");
    }
    Ok(total)
}
