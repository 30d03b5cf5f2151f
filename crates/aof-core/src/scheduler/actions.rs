//! Scheduler actions: the closed set of things a poll can decide to do.
//!
//! Keeping this a sum type makes the action executor exhaustive; adding a
//! variant forces every dispatch site to handle it.

use serde::Serialize;

/// One planned action, bound to a task.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    /// Clear an expired lease and return an in-progress holder to `ready`.
    ExpireLease {
        task_id: String,
        agent: String,
        overdue_ms: i64,
    },
    /// Block a task (e.g. a circular dependency was detected).
    Block { task_id: String, reason: String },
    /// Dispatch a ready task to an agent.
    Assign {
        task_id: String,
        agent: String,
        team: Option<String>,
    },
    /// Event-only alert.
    Alert { task_id: String, message: String },
    /// Event-only: a heartbeat went stale.
    StaleHeartbeat { task_id: String, agent: String },
    /// Event-only: a service-level expectation was missed.
    SlaViolation { task_id: String, detail: String },
    /// Move a repeatedly failing task to the deadletter bucket.
    Deadletter { task_id: String, failures: u32 },
}

impl Action {
    pub fn task_id(&self) -> &str {
        match self {
            Self::ExpireLease { task_id, .. }
            | Self::Block { task_id, .. }
            | Self::Assign { task_id, .. }
            | Self::Alert { task_id, .. }
            | Self::StaleHeartbeat { task_id, .. }
            | Self::SlaViolation { task_id, .. }
            | Self::Deadletter { task_id, .. } => task_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::ExpireLease { .. } => "expire_lease",
            Self::Block { .. } => "block",
            Self::Assign { .. } => "assign",
            Self::Alert { .. } => "alert",
            Self::StaleHeartbeat { .. } => "stale_heartbeat",
            Self::SlaViolation { .. } => "sla_violation",
            Self::Deadletter { .. } => "deadletter",
        }
    }

    /// Execution order within a poll: expiries before blocks before
    /// dispatches, event-only actions next, deadletters last.
    pub fn order(&self) -> u8 {
        match self {
            Self::ExpireLease { .. } => 0,
            Self::Block { .. } => 1,
            Self::Assign { .. } => 2,
            Self::Alert { .. } => 3,
            Self::StaleHeartbeat { .. } => 3,
            Self::SlaViolation { .. } => 3,
            Self::Deadletter { .. } => 4,
        }
    }
}
