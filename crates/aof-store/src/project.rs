//! Project manifests.
//!
//! A project is a manifest (`project.yaml`) plus the directory tree created
//! by [`crate::layout::ProjectPaths::ensure`]. Projects may reference one
//! parent project; the chain must stay acyclic.

use std::collections::HashSet;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};
use crate::fsutil;
use crate::layout::{self, ProjectPaths};
use crate::model::SCHEMA_VERSION;

/// Contents of `project.yaml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectManifest {
    pub schema_version: u32,
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    /// Default workflow name for tasks that do not set `routing.workflow`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow: Option<String>,
}

/// Create a project: validate the parent chain, build the directory
/// skeleton, and write the manifest.
pub fn create_project(
    vault: &Path,
    id: &str,
    name: &str,
    parent: Option<&str>,
) -> Result<ProjectManifest> {
    if let Some(parent_id) = parent {
        // The parent must exist, and linking to it must not close a cycle.
        let parent_paths = ProjectPaths::new(vault, parent_id);
        if !parent_paths.exists() {
            return Err(StoreError::ProjectNotFound(parent_id.to_string()));
        }
        check_parent_chain(vault, id, parent_id)?;
    }

    let manifest = ProjectManifest {
        schema_version: SCHEMA_VERSION,
        id: id.to_string(),
        name: name.to_string(),
        created_at: Utc::now(),
        parent: parent.map(str::to_string),
        workflow: None,
    };

    let paths = ProjectPaths::new(vault, id);
    paths.ensure()?;
    write_manifest(&paths, &manifest)?;
    Ok(manifest)
}

/// Load a project manifest.
pub fn load_project(vault: &Path, id: &str) -> Result<ProjectManifest> {
    let paths = ProjectPaths::new(vault, id);
    let path = paths.manifest();
    let content = std::fs::read_to_string(&path)
        .map_err(|_| StoreError::ProjectNotFound(id.to_string()))?;
    serde_yaml::from_str(&content).map_err(|e| StoreError::Corrupt {
        path,
        reason: e.to_string(),
    })
}

/// List all project manifests in the vault. Unreadable manifests are
/// skipped with a warning.
pub fn list_projects(vault: &Path) -> Result<Vec<ProjectManifest>> {
    let mut manifests = Vec::new();
    for id in layout::list_project_ids(vault)? {
        match load_project(vault, &id) {
            Ok(m) => manifests.push(m),
            Err(e) => tracing::warn!(project = %id, error = %e, "skipping unreadable manifest"),
        }
    }
    Ok(manifests)
}

fn write_manifest(paths: &ProjectPaths, manifest: &ProjectManifest) -> Result<()> {
    let yaml = serde_yaml::to_string(manifest).map_err(|e| StoreError::Corrupt {
        path: paths.manifest(),
        reason: e.to_string(),
    })?;
    fsutil::write_atomic(&paths.manifest(), &yaml)?;
    Ok(())
}

/// Walk the parent chain from `parent_id` and fail if it reaches `child_id`.
fn check_parent_chain(vault: &Path, child_id: &str, parent_id: &str) -> Result<()> {
    let mut seen = HashSet::new();
    let mut current = parent_id.to_string();
    loop {
        if current == child_id {
            return Err(StoreError::ProjectCycle {
                id: child_id.to_string(),
                via: parent_id.to_string(),
            });
        }
        if !seen.insert(current.clone()) {
            // Pre-existing cycle among ancestors; refuse to extend it.
            return Err(StoreError::ProjectCycle {
                id: child_id.to_string(),
                via: current,
            });
        }
        let manifest = load_project(vault, &current)?;
        match manifest.parent {
            Some(next) => current = next,
            None => return Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
