//! The gate evaluator: a pure function from `(task, workflow, outcome,
//! caller role)` to a transition decision.
//!
//! The evaluator never touches the store. It returns a description of the
//! mutations; the scheduler or tool layer applies them in one write.

use chrono::{DateTime, Utc};

use aof_store::{GateHistoryEntry, GateOutcome, GateState, ReviewContext, TaskStatus};

use crate::workflow::{GateDef, RejectionStrategy};

use super::{GateDecision, GateError, GateRequest, GateTransition, TaskUpdates};

/// Evaluate a gate outcome for a task.
///
/// Decision order:
/// 1. Discover the current gate (`task.gate.current`, else the first
///    enabled gate).
/// 2. Rejection constraint: `needs_review` requires `can_reject`,
///    regardless of the caller's role.
/// 3. Authorization: the caller's role must match the gate's role.
/// 4. Route by outcome: advance past disabled gates, reject per the
///    workflow's rejection strategy, or block in place.
pub fn evaluate(req: &GateRequest<'_>) -> Result<GateDecision, GateError> {
    let (gate, gate_idx, entered) = current_gate(req)?;

    // Rejection constraint comes before authorization: a non-rejectable
    // gate refuses `needs_review` no matter who asks.
    if req.outcome == GateOutcome::NeedsReview && !gate.can_reject {
        return Err(GateError::RejectionNotAllowed {
            gate: gate.id.clone(),
        });
    }

    if req.caller_role != gate.role {
        return Err(GateError::Unauthorized {
            expected: gate.role.clone(),
            actual: req.caller_role.to_string(),
        });
    }

    match req.outcome {
        GateOutcome::Complete => advance(req, gate, gate_idx, entered),
        GateOutcome::NeedsReview => reject(req, gate, gate_idx, entered),
        GateOutcome::Blocked => block(req, gate, entered),
    }
}

/// Resolve the gate the task currently sits at.
///
/// Returns the gate, its index, and the time it was entered. A task with no
/// gate state is treated as entering the first enabled gate now.
fn current_gate<'a>(
    req: &GateRequest<'a>,
) -> Result<(&'a GateDef, usize, DateTime<Utc>), GateError> {
    match &req.task.gate {
        Some(state) => {
            let idx = req.workflow.gate_index(&state.current).ok_or_else(|| {
                GateError::InvalidGate {
                    gate: state.current.clone(),
                    workflow: req.workflow.name.clone(),
                }
            })?;
            Ok((&req.workflow.gates[idx], idx, state.entered))
        }
        None => {
            let idx = req
                .workflow
                .gates
                .iter()
                .position(|g| g.is_enabled(&req.task.routing, req.task.priority))
                .ok_or_else(|| GateError::NoEnabledGate {
                    workflow: req.workflow.name.clone(),
                })?;
            Ok((&req.workflow.gates[idx], idx, req.now))
        }
    }
}

/// `complete`: walk forward, skipping disabled gates, to the next enabled
/// gate or terminal `done`.
fn advance(
    req: &GateRequest<'_>,
    gate: &GateDef,
    gate_idx: usize,
    entered: DateTime<Utc>,
) -> Result<GateDecision, GateError> {
    let mut skipped = Vec::new();
    let mut target: Option<&GateDef> = None;
    for candidate in &req.workflow.gates[gate_idx + 1..] {
        if candidate.is_enabled(&req.task.routing, req.task.priority) {
            target = Some(candidate);
            break;
        }
        skipped.push(candidate.id.clone());
    }

    let to_gate = target.map(|g| g.id.clone());
    let transition = make_transition(req, gate, entered, to_gate.clone(), skipped.clone());

    let updates = TaskUpdates {
        gate: target.map(|g| GateState {
            current: g.id.clone(),
            entered: req.now,
        }),
        gate_history: history_with(req, gate, entered),
        review_context: None,
        status: if target.is_none() {
            Some(TaskStatus::Done)
        } else {
            None
        },
    };

    Ok(GateDecision {
        transition,
        updates,
        skipped_gates: skipped,
    })
}

/// `needs_review`: route back per the workflow's rejection strategy and
/// stamp a review context for the rework.
fn reject(
    req: &GateRequest<'_>,
    gate: &GateDef,
    gate_idx: usize,
    entered: DateTime<Utc>,
) -> Result<GateDecision, GateError> {
    let target = match req.workflow.rejection_strategy {
        RejectionStrategy::Origin => req
            .workflow
            .gates
            .iter()
            .find(|g| g.is_enabled(&req.task.routing, req.task.priority)),
        RejectionStrategy::Previous => req.workflow.gates[..gate_idx]
            .iter()
            .rev()
            .find(|g| g.is_enabled(&req.task.routing, req.task.priority))
            .or_else(|| {
                // No prior enabled gate: fall back to the workflow origin.
                req.workflow
                    .gates
                    .iter()
                    .find(|g| g.is_enabled(&req.task.routing, req.task.priority))
            }),
    };
    let target = target.ok_or_else(|| GateError::NoEnabledGate {
        workflow: req.workflow.name.clone(),
    })?;

    let transition = make_transition(req, gate, entered, Some(target.id.clone()), Vec::new());

    let updates = TaskUpdates {
        gate: Some(GateState {
            current: target.id.clone(),
            entered: req.now,
        }),
        gate_history: history_with(req, gate, entered),
        review_context: Some(ReviewContext {
            from_gate: gate.id.clone(),
            from_role: gate.role.clone(),
            notes: req.rejection_notes.clone(),
            blockers: req.blockers.clone(),
        }),
        status: None,
    };

    Ok(GateDecision {
        transition,
        updates,
        skipped_gates: Vec::new(),
    })
}

/// `blocked`: the task's status becomes blocked; the gate is not advanced.
fn block(
    req: &GateRequest<'_>,
    gate: &GateDef,
    entered: DateTime<Utc>,
) -> Result<GateDecision, GateError> {
    let transition = make_transition(req, gate, entered, None, Vec::new());

    let updates = TaskUpdates {
        // The gate position is preserved so an unblock resumes in place.
        gate: Some(GateState {
            current: gate.id.clone(),
            entered,
        }),
        gate_history: history_with(req, gate, entered),
        review_context: None,
        status: Some(TaskStatus::Blocked),
    };

    Ok(GateDecision {
        transition,
        updates,
        skipped_gates: Vec::new(),
    })
}

fn make_transition(
    req: &GateRequest<'_>,
    gate: &GateDef,
    entered: DateTime<Utc>,
    to_gate: Option<String>,
    skipped_gates: Vec<String>,
) -> GateTransition {
    GateTransition {
        from_gate: gate.id.clone(),
        to_gate,
        outcome: req.outcome,
        exited_at: req.now,
        duration_ms: (req.now - entered).num_milliseconds(),
        summary: req.summary.clone(),
        blockers: req.blockers.clone(),
        skipped_gates,
    }
}

/// The existing history plus the closing entry for the current gate.
fn history_with(
    req: &GateRequest<'_>,
    gate: &GateDef,
    entered: DateTime<Utc>,
) -> Vec<GateHistoryEntry> {
    let mut history = req.task.gate_history.clone();
    history.push(GateHistoryEntry {
        gate: gate.id.clone(),
        role: gate.role.clone(),
        entered,
        exited: Some(req.now),
        outcome: Some(req.outcome),
        summary: req.summary.clone(),
        blockers: req.blockers.clone(),
        duration_ms: Some((req.now - entered).num_milliseconds()),
    });
    history
}
