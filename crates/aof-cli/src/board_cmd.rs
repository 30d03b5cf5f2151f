//! `aof board` command: text kanban over one store snapshot.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use clap::ValueEnum;

use aof_store::{ListFilter, Task, TaskStatus, TaskStore};

/// How to group the board columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Swimlane {
    Status,
    Agent,
    Team,
}

/// Render the board for a project.
pub fn run_board(vault: &Path, project: &str, swimlane: Swimlane) -> Result<()> {
    let store = TaskStore::open(vault, project)
        .with_context(|| format!("failed to open project {project}"))?;
    let tasks = store.list(&ListFilter::default())?;

    if tasks.is_empty() {
        println!("{project}: no tasks.");
        return Ok(());
    }

    println!("Board for {project} ({} tasks)", tasks.len());
    println!();

    match swimlane {
        Swimlane::Status => {
            // Fixed pipeline order rather than alphabetical.
            for status in TaskStatus::ALL {
                let lane: Vec<&Task> = tasks.iter().filter(|t| t.status == status).collect();
                print_lane(&status.to_string(), &lane);
            }
        }
        Swimlane::Agent => {
            let lanes = group_by(&tasks, |t| {
                t.routing
                    .agent
                    .clone()
                    .unwrap_or_else(|| "(unassigned)".to_string())
            });
            for (agent, lane) in lanes {
                print_lane(&agent, &lane);
            }
        }
        Swimlane::Team => {
            let lanes = group_by(&tasks, |t| {
                t.routing
                    .team
                    .clone()
                    .unwrap_or_else(|| "(no team)".to_string())
            });
            for (team, lane) in lanes {
                print_lane(&team, &lane);
            }
        }
    }

    Ok(())
}

fn group_by<'a>(tasks: &'a [Task], key: impl Fn(&Task) -> String) -> BTreeMap<String, Vec<&'a Task>> {
    let mut lanes: BTreeMap<String, Vec<&Task>> = BTreeMap::new();
    for task in tasks {
        lanes.entry(key(task)).or_default().push(task);
    }
    lanes
}

fn print_lane(title: &str, lane: &[&Task]) {
    if lane.is_empty() {
        return;
    }
    println!("## {title} ({})", lane.len());
    for task in lane {
        let marker = match task.priority {
            aof_store::Priority::Critical => "!!",
            aof_store::Priority::High => "! ",
            aof_store::Priority::Normal => "  ",
            aof_store::Priority::Low => ". ",
        };
        let gate = task
            .gate
            .as_ref()
            .map(|g| format!(" [{}]", g.current))
            .unwrap_or_default();
        println!("  {marker} {} — {}{gate}", task.id, task.title);
    }
    println!();
}
