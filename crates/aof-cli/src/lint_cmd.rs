//! `aof lint` command: structural validation plus report rendering.

use std::path::Path;

use anyhow::{Context, Result};

use aof_store::{fsutil, lint, TaskStore};

/// Lint one project, write `state/lint-report.md`, and print findings.
/// Returns the issue count so the caller can set the exit code.
pub fn run_lint(vault: &Path, project: &str) -> Result<usize> {
    let store = TaskStore::open(vault, project)
        .with_context(|| format!("failed to open project {project}"))?;

    let issues = lint::lint(&store)?;
    let report = lint::render_report(&issues);
    fsutil::write_atomic(&store.paths().lint_report(), &report)
        .context("failed to write lint report")?;

    if issues.is_empty() {
        println!("{project}: no issues found.");
    } else {
        println!("{project}: {} issue(s) found:", issues.len());
        for issue in &issues {
            println!("  [{}] {} — {}", issue.kind, issue.path.display(), issue.detail);
        }
        println!("Report written to {}", store.paths().lint_report().display());
    }
    Ok(issues.len())
}
