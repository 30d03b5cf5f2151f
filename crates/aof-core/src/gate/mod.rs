//! Gate machinery: evaluation requests, decisions, and errors.

pub mod evaluator;

use chrono::{DateTime, Utc};
use thiserror::Error;

use aof_store::{GateHistoryEntry, GateOutcome, GateState, ReviewContext, Task, TaskStatus};

use crate::workflow::Workflow;

/// Errors raised while evaluating a gate outcome.
#[derive(Debug, Error)]
pub enum GateError {
    #[error("gate requires role {expected:?}, caller has {actual:?}")]
    Unauthorized { expected: String, actual: String },

    #[error("gate {gate:?} does not allow rejection")]
    RejectionNotAllowed { gate: String },

    #[error("gate {gate:?} is not part of workflow {workflow:?}")]
    InvalidGate { gate: String, workflow: String },

    #[error("workflow {workflow:?} has no enabled gate for this task")]
    NoEnabledGate { workflow: String },
}

/// Input to [`evaluator::evaluate`]. `now` is injected so the evaluator
/// stays a pure function.
#[derive(Debug, Clone)]
pub struct GateRequest<'a> {
    pub task: &'a Task,
    pub workflow: &'a Workflow,
    pub outcome: GateOutcome,
    pub caller_role: &'a str,
    pub agent: &'a str,
    pub summary: Option<String>,
    pub blockers: Vec<String>,
    pub rejection_notes: Option<String>,
    pub now: DateTime<Utc>,
}

/// The gate transition produced by an evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct GateTransition {
    pub from_gate: String,
    /// `None` means the workflow is exhausted and the task is terminal.
    pub to_gate: Option<String>,
    pub outcome: GateOutcome,
    pub exited_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub summary: Option<String>,
    pub blockers: Vec<String>,
    pub skipped_gates: Vec<String>,
}

/// Description of the task mutations implied by a decision. The caller
/// applies these through the store in a single write.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskUpdates {
    /// New gate position; `None` clears it (terminal).
    pub gate: Option<GateState>,
    /// Full replacement gate history (existing entries plus the new one).
    pub gate_history: Vec<GateHistoryEntry>,
    /// Review context to stamp when a rejection routed the task back.
    pub review_context: Option<ReviewContext>,
    /// Status change implied by the outcome, if any (`done` on workflow
    /// exhaustion, `blocked` on a blocked outcome).
    pub status: Option<TaskStatus>,
}

/// Result of a successful evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct GateDecision {
    pub transition: GateTransition,
    pub updates: TaskUpdates,
    pub skipped_gates: Vec<String>,
}
