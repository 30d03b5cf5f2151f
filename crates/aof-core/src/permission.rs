//! Role-derived permission guard around store mutations.
//!
//! Every mutation on the tool surface names its operation; the guard maps
//! the actor to a role via the org chart and applies the policy. Read
//! operations are never restricted.

use std::fmt;

use thiserror::Error;

use crate::org::OrgChart;

/// Operations subject to permission checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    CreateTask,
    UpdateTask,
    TransitionTask,
    CompleteTask,
    BlockTask,
    CancelTask,
    DeleteTask,
    ReadTasks,
}

impl Operation {
    /// Destructive operations require an admin role.
    fn is_destructive(&self) -> bool {
        matches!(self, Self::CancelTask | Self::DeleteTask)
    }

    fn is_read(&self) -> bool {
        matches!(self, Self::ReadTasks)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::CreateTask => "create-task",
            Self::UpdateTask => "update-task",
            Self::TransitionTask => "transition-task",
            Self::CompleteTask => "complete-task",
            Self::BlockTask => "block-task",
            Self::CancelTask => "cancel-task",
            Self::DeleteTask => "delete-task",
            Self::ReadTasks => "read-tasks",
        };
        f.write_str(s)
    }
}

/// Raised when the guard denies an operation.
#[derive(Debug, Error)]
#[error("operation {operation} denied for actor {actor}: {reason}")]
pub struct PermissionDenied {
    pub actor: String,
    pub operation: Operation,
    pub reason: String,
}

/// Allow/deny wrapper derived from the org chart.
#[derive(Debug, Clone, Default)]
pub struct PermissionGuard {
    org: OrgChart,
}

impl PermissionGuard {
    pub fn new(org: OrgChart) -> Self {
        Self { org }
    }

    pub fn org(&self) -> &OrgChart {
        &self.org
    }

    /// Check whether `actor` may perform `operation`.
    ///
    /// - Reads are always allowed.
    /// - With an agent registry, unregistered actors are denied mutations.
    /// - Destructive operations additionally require an admin role.
    /// - Without a registry the guard is permissive except for destructive
    ///   operations, which still require a declared admin role.
    pub fn check(&self, actor: &str, operation: Operation) -> Result<(), PermissionDenied> {
        if operation.is_read() {
            return Ok(());
        }

        let role = self.org.role_of(actor);

        if self.org.has_agent_registry() && role.is_none() {
            return Err(PermissionDenied {
                actor: actor.to_string(),
                operation,
                reason: "actor is not registered in the org chart".to_string(),
            });
        }

        if operation.is_destructive() {
            let is_admin = role.is_some_and(|r| self.org.is_admin_role(r));
            if !is_admin {
                return Err(PermissionDenied {
                    actor: actor.to_string(),
                    operation,
                    reason: "requires an admin role".to_string(),
                });
            }
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
