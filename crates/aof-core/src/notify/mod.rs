//! Rule-based notification routing.
//!
//! Every event appended to the event log is offered to the engine. The
//! first rule whose match section fits the event wins; the rendered message
//! is deduped per `(channel, message)` within the rule's window and handed
//! to the channel's adapter. Adapter failures are logged and never abort
//! routing.

pub mod watcher;

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;

use aof_store::{Event, EventSink};

/// Audiences the engine knows how to address. Unknown audiences in a rule
/// are filtered out at load time.
pub const KNOWN_AUDIENCES: [&str; 4] = ["operators", "leads", "agents", "all"];

// ---------------------------------------------------------------------------
// Severity
// ---------------------------------------------------------------------------

/// Notification severity. Unknown strings default to `info`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Severity {
    #[default]
    Info,
    Warning,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        };
        f.write_str(s)
    }
}

impl FromStr for Severity {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "warning" | "warn" => Self::Warning,
            "critical" | "error" => Self::Critical,
            "info" => Self::Info,
            other => {
                tracing::warn!(severity = %other, "unknown severity, defaulting to info");
                Self::Info
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RulesFile {
    rules: Vec<RawRule>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawRule {
    #[serde(rename = "match")]
    match_section: RawMatch,
    #[serde(default)]
    severity: Option<String>,
    #[serde(default)]
    audience: Vec<String>,
    channel: String,
    template: String,
    #[serde(default)]
    dedupe_window_ms: Option<i64>,
    #[serde(default)]
    never_suppress: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMatch {
    event_type: String,
    #[serde(default)]
    payload: Option<serde_json::Map<String, serde_json::Value>>,
}

/// A validated routing rule.
#[derive(Debug, Clone)]
pub struct Rule {
    pub event_type: String,
    pub payload_match: Option<serde_json::Map<String, serde_json::Value>>,
    pub severity: Severity,
    pub audience: Vec<String>,
    pub channel: String,
    pub template: String,
    pub dedupe_window: Option<Duration>,
    pub never_suppress: bool,
}

impl Rule {
    /// Exact event-type match plus partial equality on the payload.
    fn matches(&self, event: &Event) -> bool {
        if self.event_type != event.event_type {
            return false;
        }
        let Some(expected) = &self.payload_match else {
            return true;
        };
        let Some(actual) = event.payload.as_object() else {
            return expected.is_empty();
        };
        expected
            .iter()
            .all(|(key, value)| actual.get(key) == Some(value))
    }
}

/// An immutable, atomically swappable set of rules.
#[derive(Debug, Clone)]
pub struct RuleSet {
    pub rules: Vec<Rule>,
}

impl RuleSet {
    /// Parse rules YAML. Unknown severities default to info; unknown
    /// audiences are dropped. Returns `None` when the document is invalid
    /// or no valid rule remains -- callers fall back to the defaults.
    pub fn parse(content: &str) -> Option<Self> {
        let file: RulesFile = match serde_yaml::from_str(content) {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!(error = %e, "invalid notification rules file");
                return None;
            }
        };

        let mut rules = Vec::new();
        for raw in file.rules {
            let severity = raw
                .severity
                .as_deref()
                .map(|s| s.parse::<Severity>().expect("severity parse is infallible"))
                .unwrap_or_default();
            let audience: Vec<String> = raw
                .audience
                .into_iter()
                .filter(|a| {
                    let known = KNOWN_AUDIENCES.contains(&a.as_str());
                    if !known {
                        tracing::warn!(audience = %a, "dropping unknown audience");
                    }
                    known
                })
                .collect();
            rules.push(Rule {
                event_type: raw.match_section.event_type,
                payload_match: raw.match_section.payload,
                severity,
                audience,
                channel: raw.channel,
                template: raw.template,
                dedupe_window: raw.dedupe_window_ms.map(Duration::milliseconds),
                never_suppress: raw.never_suppress,
            });
        }

        if rules.is_empty() {
            tracing::warn!("rules file contains no valid rules");
            return None;
        }
        Some(Self { rules })
    }

    /// Load from a file, falling back to defaults on any problem.
    pub fn load_or_default(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => Self::parse(&content).unwrap_or_else(Self::defaults),
            Err(_) => Self::defaults(),
        }
    }

    /// Built-in defaults: surface the failure-shaped events to operators.
    pub fn defaults() -> Self {
        let rule = |event_type: &str, severity: Severity, template: &str| Rule {
            event_type: event_type.to_string(),
            payload_match: None,
            severity,
            audience: vec!["operators".to_string()],
            channel: "ops".to_string(),
            template: template.to_string(),
            dedupe_window: Some(Duration::minutes(5)),
            never_suppress: false,
        };
        Self {
            rules: vec![
                rule(
                    "task.deadlettered",
                    Severity::Critical,
                    "Task {taskId} deadlettered",
                ),
                rule(
                    "dispatch.failed",
                    Severity::Warning,
                    "Dispatch of {taskId} failed",
                ),
                rule(
                    "lease.expired",
                    Severity::Warning,
                    "Lease on {taskId} expired",
                ),
                rule("gate_timeout", Severity::Warning, "Gate timeout on {taskId}"),
                rule("system.startup", Severity::Info, "Scheduler started"),
                rule("system.shutdown", Severity::Info, "Scheduler stopped"),
            ],
        }
    }
}

// ---------------------------------------------------------------------------
// Adapters
// ---------------------------------------------------------------------------

/// A rendered notification on its way to a channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub channel: String,
    pub severity: Severity,
    pub audience: Vec<String>,
    pub message: String,
    pub event_type: String,
    pub task_id: Option<String>,
}

/// Delivery adapter for one channel (log line, Matrix, Slack, ...).
pub trait ChannelAdapter: Send + Sync {
    fn name(&self) -> &str;
    fn deliver(&self, notification: &Notification) -> anyhow::Result<()>;
}

/// Fallback adapter: renders notifications as log lines.
pub struct LogAdapter;

impl ChannelAdapter for LogAdapter {
    fn name(&self) -> &str {
        "log"
    }

    fn deliver(&self, n: &Notification) -> anyhow::Result<()> {
        tracing::info!(
            channel = %n.channel,
            severity = %n.severity,
            message = %n.message,
            "notification"
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Completion batch trigger
// ---------------------------------------------------------------------------

/// Digest-style trigger: fires once `threshold` completions accumulate
/// since the last review.
#[derive(Debug)]
pub struct CompletionBatchTrigger {
    threshold: u32,
    completions_since_last_review: u32,
}

impl CompletionBatchTrigger {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold,
            completions_since_last_review: 0,
        }
    }

    /// Record one completion; returns `true` when the batch fires (and
    /// resets the counter).
    pub fn record_completion(&mut self) -> bool {
        self.completions_since_last_review += 1;
        if self.fires() {
            self.completions_since_last_review = 0;
            true
        } else {
            false
        }
    }

    pub fn fires(&self) -> bool {
        self.completions_since_last_review >= self.threshold
    }

    pub fn pending(&self) -> u32 {
        self.completions_since_last_review
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// The notification engine. Implements [`EventSink`] so it can hang off
/// the event logger directly.
pub struct NotificationEngine {
    // Readers clone the Arc; hot reload swaps the pointer.
    rules: RwLock<Arc<RuleSet>>,
    adapters: RwLock<Vec<Arc<dyn ChannelAdapter>>>,
    dedupe: Mutex<HashMap<(String, String), DateTime<Utc>>>,
    batch: Mutex<CompletionBatchTrigger>,
    delivered: Mutex<Vec<Notification>>,
}

impl NotificationEngine {
    pub fn new(rules: RuleSet) -> Self {
        Self {
            rules: RwLock::new(Arc::new(rules)),
            adapters: RwLock::new(vec![Arc::new(LogAdapter)]),
            dedupe: Mutex::new(HashMap::new()),
            batch: Mutex::new(CompletionBatchTrigger::new(5)),
            delivered: Mutex::new(Vec::new()),
        }
    }

    pub fn with_batch_threshold(rules: RuleSet, threshold: u32) -> Self {
        let engine = Self::new(rules);
        *engine.batch.lock().expect("batch lock poisoned") =
            CompletionBatchTrigger::new(threshold);
        engine
    }

    /// Register an adapter. Later registrations with the same name shadow
    /// earlier ones.
    pub fn add_adapter(&self, adapter: Arc<dyn ChannelAdapter>) {
        self.adapters
            .write()
            .expect("adapter lock poisoned")
            .push(adapter);
    }

    /// Swap in a new rule set (hot reload). Readers observe either the old
    /// or the new set, never a mix.
    pub fn swap_rules(&self, rules: RuleSet) {
        *self.rules.write().expect("rules lock poisoned") = Arc::new(rules);
        tracing::info!("notification rules reloaded");
    }

    pub fn current_rules(&self) -> Arc<RuleSet> {
        self.rules.read().expect("rules lock poisoned").clone()
    }

    /// Notifications delivered so far (test observability).
    pub fn delivered(&self) -> Vec<Notification> {
        self.delivered
            .lock()
            .expect("delivered lock poisoned")
            .clone()
    }

    /// Route one event through the rules.
    pub fn route(&self, event: &Event) {
        let rules = self.current_rules();
        let Some(rule) = rules.rules.iter().find(|r| r.matches(event)) else {
            self.track_completion(event);
            return;
        };

        let message = render_template(&rule.template, event);

        if self.is_duplicate(rule, &message) {
            tracing::debug!(event_type = %event.event_type, "notification suppressed by dedupe");
            self.track_completion(event);
            return;
        }

        let notification = Notification {
            channel: rule.channel.clone(),
            severity: rule.severity,
            audience: rule.audience.clone(),
            message,
            event_type: event.event_type.clone(),
            task_id: event.task_id.clone(),
        };
        self.deliver(&notification);
        self.track_completion(event);
    }

    fn track_completion(&self, event: &Event) {
        if event.event_type != "task.completed" {
            return;
        }
        let fired = self
            .batch
            .lock()
            .expect("batch lock poisoned")
            .record_completion();
        if fired {
            let digest = Notification {
                channel: "ops".to_string(),
                severity: Severity::Info,
                audience: vec!["operators".to_string()],
                message: "Completion batch ready for review".to_string(),
                event_type: "completion.batch".to_string(),
                task_id: None,
            };
            self.deliver(&digest);
        }
    }

    fn is_duplicate(&self, rule: &Rule, message: &str) -> bool {
        if rule.never_suppress {
            return false;
        }
        let Some(window) = rule.dedupe_window else {
            return false;
        };
        let now = Utc::now();
        let key = (rule.channel.clone(), message.to_string());
        let mut seen = self.dedupe.lock().expect("dedupe lock poisoned");
        if let Some(last) = seen.get(&key) {
            if now - *last < window {
                return true;
            }
        }
        seen.insert(key, now);
        // Keep the table from growing without bound.
        if seen.len() > 10_000 {
            let cutoff = now - Duration::hours(24);
            seen.retain(|_, t| *t > cutoff);
        }
        false
    }

    fn deliver(&self, notification: &Notification) {
        self.delivered
            .lock()
            .expect("delivered lock poisoned")
            .push(notification.clone());

        let adapters = self.adapters.read().expect("adapter lock poisoned").clone();
        for adapter in adapters {
            if let Err(e) = adapter.deliver(notification) {
                tracing::warn!(
                    adapter = adapter.name(),
                    channel = %notification.channel,
                    error = %e,
                    "notification adapter failed"
                );
            }
        }
    }
}

impl EventSink for NotificationEngine {
    fn handle(&self, event: &Event) {
        self.route(event);
    }
}

/// Replace `{field}` placeholders from the event and its payload.
fn render_template(template: &str, event: &Event) -> String {
    let mut out = template.to_string();
    out = out.replace("{eventId}", &event.event_id.to_string());
    out = out.replace("{type}", &event.event_type);
    out = out.replace("{actor}", &event.actor);
    out = out.replace("{taskId}", event.task_id.as_deref().unwrap_or("-"));
    if let Some(payload) = event.payload.as_object() {
        for (key, value) in payload {
            let placeholder = format!("{{{key}}}");
            if out.contains(&placeholder) {
                let rendered = match value {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                out = out.replace(&placeholder, &rendered);
            }
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
