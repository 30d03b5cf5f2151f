//! Typed errors for the task store.

use std::path::PathBuf;

use thiserror::Error;

use crate::model::TaskStatus;

/// Errors surfaced by store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("task {0} not found")]
    NotFound(String),

    #[error("ambiguous prefix {prefix:?}: matches {count} tasks")]
    AmbiguousPrefix { prefix: String, count: usize },

    #[error("invalid transition {from} -> {to} for task {id}")]
    InvalidTransition {
        id: String,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("operation {operation} denied for actor {actor}")]
    PermissionDenied { actor: String, operation: String },

    #[error("dependency cycle detected: {0}")]
    CycleDetected(String),

    #[error("task {id} already holds an active lease for {holder}")]
    LeaseHeld { id: String, holder: String },

    #[error("no lease on task {id} held by {agent}")]
    LeaseNotHeld { id: String, agent: String },

    #[error("task file {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("project {0} not found")]
    ProjectNotFound(String),

    #[error("project {id} parent chain contains a cycle via {via}")]
    ProjectCycle { id: String, via: String },

    #[error("invalid task output filename {0:?}")]
    InvalidOutputName(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Store result alias.
pub type Result<T> = std::result::Result<T, StoreError>;
