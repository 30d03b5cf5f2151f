//! Dispatch throttling: global and per-team concurrency plus rate limits.
//!
//! Rules are applied in a fixed order and the first failing rule wins, so
//! denials are deterministic for a given snapshot.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};

/// Why a dispatch was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleReason {
    GlobalConcurrency,
    TeamConcurrency,
    GlobalInterval,
    TeamInterval,
    PollCap,
}

impl fmt::Display for ThrottleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::GlobalConcurrency => "global concurrency limit",
            Self::TeamConcurrency => "team concurrency limit",
            Self::GlobalInterval => "global dispatch interval",
            Self::TeamInterval => "team dispatch interval",
            Self::PollCap => "per-poll dispatch cap",
        };
        f.write_str(s)
    }
}

/// Result of a throttle check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThrottleDecision {
    pub allowed: bool,
    pub reason: Option<ThrottleReason>,
    /// For interval denials: how long until the rule would pass.
    pub wait_ms: Option<i64>,
}

impl ThrottleDecision {
    fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
            wait_ms: None,
        }
    }

    fn deny(reason: ThrottleReason, wait_ms: Option<i64>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
            wait_ms,
        }
    }
}

/// Static throttle limits.
#[derive(Debug, Clone)]
pub struct ThrottleLimits {
    /// Global in-flight cap (`in-progress` + dispatches planned this poll).
    pub max_dispatches: usize,
    /// Default per-team in-flight cap.
    pub team_max_concurrent: usize,
    /// Minimum interval between any two dispatches.
    pub min_dispatch_interval_ms: i64,
    /// Default minimum interval between dispatches for one team.
    pub team_min_interval_ms: i64,
    /// Maximum `assign` actions planned within a single poll.
    pub max_dispatches_per_poll: usize,
}

impl Default for ThrottleLimits {
    fn default() -> Self {
        Self {
            max_dispatches: 8,
            team_max_concurrent: 3,
            min_dispatch_interval_ms: 1_000,
            team_min_interval_ms: 5_000,
            max_dispatches_per_poll: 5,
        }
    }
}

/// One throttle check for one dispatch candidate.
#[derive(Debug, Clone)]
pub struct ThrottleRequest<'a> {
    pub team: Option<&'a str>,
    pub current_in_progress: usize,
    pub team_in_progress: usize,
    pub pending_dispatches: usize,
    pub dispatches_this_poll: usize,
    /// Per-team overrides from the org chart; `None` uses the defaults.
    pub team_max_concurrent: Option<usize>,
    pub team_min_interval_ms: Option<i64>,
    pub now: DateTime<Utc>,
}

/// Process-global throttle state, surviving across polls.
#[derive(Debug, Default)]
pub struct ThrottleController {
    last_dispatch_at: Option<DateTime<Utc>>,
    last_dispatch_by_team: HashMap<String, DateTime<Utc>>,
    limits: ThrottleLimits,
}

impl ThrottleController {
    pub fn new(limits: ThrottleLimits) -> Self {
        Self {
            limits,
            ..Self::default()
        }
    }

    pub fn limits(&self) -> &ThrottleLimits {
        &self.limits
    }

    /// Apply the throttle rules in order; the first failing rule is
    /// returned.
    pub fn check(&self, req: &ThrottleRequest<'_>) -> ThrottleDecision {
        // 1. Global concurrency.
        if req.current_in_progress + req.pending_dispatches >= self.limits.max_dispatches {
            return ThrottleDecision::deny(ThrottleReason::GlobalConcurrency, None);
        }

        // 2. Per-team concurrency.
        if req.team.is_some() {
            let cap = req
                .team_max_concurrent
                .unwrap_or(self.limits.team_max_concurrent);
            if req.team_in_progress >= cap {
                return ThrottleDecision::deny(ThrottleReason::TeamConcurrency, None);
            }
        }

        // 3. Global interval.
        if let Some(last) = self.last_dispatch_at {
            let elapsed = (req.now - last).num_milliseconds();
            if elapsed < self.limits.min_dispatch_interval_ms {
                return ThrottleDecision::deny(
                    ThrottleReason::GlobalInterval,
                    Some(self.limits.min_dispatch_interval_ms - elapsed),
                );
            }
        }

        // 4. Per-team interval.
        if let Some(team) = req.team {
            if let Some(last) = self.last_dispatch_by_team.get(team) {
                let min = req
                    .team_min_interval_ms
                    .unwrap_or(self.limits.team_min_interval_ms);
                let elapsed = (req.now - *last).num_milliseconds();
                if elapsed < min {
                    return ThrottleDecision::deny(
                        ThrottleReason::TeamInterval,
                        Some(min - elapsed),
                    );
                }
            }
        }

        // 5. Per-poll cap.
        if req.dispatches_this_poll >= self.limits.max_dispatches_per_poll {
            return ThrottleDecision::deny(ThrottleReason::PollCap, None);
        }

        ThrottleDecision::allow()
    }

    /// Stamp the timestamps after a successful dispatch.
    pub fn record_dispatch(&mut self, team: Option<&str>) {
        let now = Utc::now();
        self.last_dispatch_at = Some(now);
        if let Some(team) = team {
            self.last_dispatch_by_team.insert(team.to_string(), now);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
