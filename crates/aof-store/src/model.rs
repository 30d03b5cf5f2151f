//! Task data model: status/priority enums and the on-disk task schema.
//!
//! A task is persisted as a markdown file with YAML front-matter; the
//! enclosing directory name always equals the task's `status`.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Current front-matter schema version.
pub const SCHEMA_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Status of a task. Encoded on disk as the directory the task file lives in.
/// Ordering follows the pipeline, so sorted maps read naturally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    Backlog,
    Ready,
    InProgress,
    Blocked,
    Review,
    Done,
}

impl TaskStatus {
    /// All statuses, in pipeline order. Also the set of status directories.
    pub const ALL: [TaskStatus; 6] = [
        Self::Backlog,
        Self::Ready,
        Self::InProgress,
        Self::Blocked,
        Self::Review,
        Self::Done,
    ];

    /// Directory name for this status under `tasks/`.
    pub fn dir_name(&self) -> &'static str {
        match self {
            Self::Backlog => "backlog",
            Self::Ready => "ready",
            Self::InProgress => "in-progress",
            Self::Blocked => "blocked",
            Self::Review => "review",
            Self::Done => "done",
        }
    }

    /// Terminal statuses admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

impl FromStr for TaskStatus {
    type Err = TaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "backlog" => Ok(Self::Backlog),
            "ready" => Ok(Self::Ready),
            "in-progress" => Ok(Self::InProgress),
            "blocked" => Ok(Self::Blocked),
            "review" => Ok(Self::Review),
            "done" => Ok(Self::Done),
            other => Err(TaskStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskStatus`] string.
#[derive(Debug, Clone)]
pub struct TaskStatusParseError(pub String);

impl fmt::Display for TaskStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task status: {:?}", self.0)
    }
}

impl std::error::Error for TaskStatusParseError {}

// ---------------------------------------------------------------------------

/// Priority of a task. Dispatch considers higher priorities first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    /// Dispatch rank: lower sorts first.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Critical => 0,
            Self::High => 1,
            Self::Normal => 2,
            Self::Low => 3,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        };
        f.write_str(s)
    }
}

impl FromStr for Priority {
    type Err = PriorityParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "critical" => Ok(Self::Critical),
            "high" => Ok(Self::High),
            "normal" => Ok(Self::Normal),
            "low" => Ok(Self::Low),
            other => Err(PriorityParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`Priority`] string.
#[derive(Debug, Clone)]
pub struct PriorityParseError(pub String);

impl fmt::Display for PriorityParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid priority: {:?}", self.0)
    }
}

impl std::error::Error for PriorityParseError {}

// ---------------------------------------------------------------------------

/// Outcome reported when a gate is exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateOutcome {
    Complete,
    NeedsReview,
    Blocked,
}

impl fmt::Display for GateOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Complete => "complete",
            Self::NeedsReview => "needs_review",
            Self::Blocked => "blocked",
        };
        f.write_str(s)
    }
}

impl FromStr for GateOutcome {
    type Err = GateOutcomeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "complete" => Ok(Self::Complete),
            "needs_review" => Ok(Self::NeedsReview),
            "blocked" => Ok(Self::Blocked),
            other => Err(GateOutcomeParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`GateOutcome`] string.
#[derive(Debug, Clone)]
pub struct GateOutcomeParseError(pub String);

impl fmt::Display for GateOutcomeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid gate outcome: {:?}", self.0)
    }
}

impl std::error::Error for GateOutcomeParseError {}

// ---------------------------------------------------------------------------
// Structs
// ---------------------------------------------------------------------------

/// Routing hints: which workflow, team, role, or agent should handle a task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Routing {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

/// A time-bounded single-writer claim by an agent on a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lease {
    pub agent: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub renewal_count: u32,
}

impl Lease {
    /// A lease expires the instant `now` reaches `expires_at` (closed on the
    /// right: `expires_at == now` is expired).
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Inverse of [`Lease::is_expired`].
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        !self.is_expired(now)
    }
}

/// The gate a task currently sits at within its workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GateState {
    pub current: String,
    pub entered: DateTime<Utc>,
}

/// One entry in a task's gate history log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GateHistoryEntry {
    pub gate: String,
    pub role: String,
    pub entered: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exited: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<GateOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blockers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
}

/// Context stamped on a task when a gate rejects it back for rework.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewContext {
    pub from_gate: String,
    pub from_role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blockers: Vec<String>,
}

/// A work item. The struct mirrors the on-disk front-matter exactly; the
/// markdown body and the id-derived file location are carried alongside.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub schema_version: u32,
    pub id: String,
    pub project: String,
    pub title: String,
    pub status: TaskStatus,
    pub priority: Priority,
    #[serde(default)]
    pub routing: Routing,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease: Option<Lease>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate: Option<GateState>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gate_history: Vec<GateHistoryEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review_context: Option<ReviewContext>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub dispatch_failures: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_transition_at: DateTime<Utc>,
    pub created_by: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
    /// Unknown front-matter fields, preserved verbatim on rewrite.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
    /// Markdown body below the front-matter. Not part of the front-matter.
    #[serde(skip)]
    pub body: String,
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

impl Task {
    /// Whether the task currently holds a lease that has not expired.
    pub fn has_active_lease(&self, now: DateTime<Utc>) -> bool {
        self.lease.as_ref().is_some_and(|l| l.is_active(now))
    }
}

/// A partial front-matter update. `None` fields are left untouched.
///
/// `id`, `created_at`, and `status` are deliberately absent: identity is
/// immutable and status changes only through `TaskStore::transition`.
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub title: Option<String>,
    pub priority: Option<Priority>,
    pub routing: Option<Routing>,
    pub resource: Option<Option<String>>,
    pub gate: Option<Option<GateState>>,
    pub gate_history: Option<Vec<GateHistoryEntry>>,
    pub review_context: Option<Option<ReviewContext>>,
    pub metadata: Option<BTreeMap<String, String>>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn task_status_display_roundtrip() {
        for v in &TaskStatus::ALL {
            let s = v.to_string();
            let parsed: TaskStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn task_status_invalid() {
        assert!("pending".parse::<TaskStatus>().is_err());
        assert!("in_progress".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn task_status_dir_name_matches_display() {
        assert_eq!(TaskStatus::InProgress.dir_name(), "in-progress");
        assert_eq!(TaskStatus::InProgress.to_string(), "in-progress");
    }

    #[test]
    fn priority_display_roundtrip() {
        let variants = [
            Priority::Critical,
            Priority::High,
            Priority::Normal,
            Priority::Low,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: Priority = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn priority_invalid() {
        assert!("urgent".parse::<Priority>().is_err());
    }

    #[test]
    fn priority_rank_orders_critical_first() {
        assert!(Priority::Critical.rank() < Priority::High.rank());
        assert!(Priority::High.rank() < Priority::Normal.rank());
        assert!(Priority::Normal.rank() < Priority::Low.rank());
    }

    #[test]
    fn gate_outcome_display_roundtrip() {
        let variants = [
            GateOutcome::Complete,
            GateOutcome::NeedsReview,
            GateOutcome::Blocked,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: GateOutcome = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn gate_outcome_invalid() {
        assert!("rejected".parse::<GateOutcome>().is_err());
    }

    #[test]
    fn lease_expiry_is_closed_on_the_right() {
        let now = Utc::now();
        let lease = Lease {
            agent: "dev-1".to_string(),
            acquired_at: now - Duration::seconds(60),
            expires_at: now,
            renewal_count: 0,
        };
        assert!(lease.is_expired(now), "expires_at == now must be expired");
        assert!(!lease.is_active(now));

        let fresh = Lease {
            expires_at: now + Duration::seconds(1),
            ..lease
        };
        assert!(fresh.is_active(now));
    }
}
