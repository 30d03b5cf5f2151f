//! Workflow definitions: named, ordered gate sequences.
//!
//! Workflows load from `<vault>/workflows.yaml` and are validated once:
//! duplicate gate ids are rejected and `when` sources are parsed up front so
//! evaluation never fails mid-poll. A built-in default workflow applies when
//! the file is absent.

pub mod when;

use std::collections::{HashMap, HashSet};
use std::path::Path;

use chrono::Duration;
use serde::Deserialize;
use thiserror::Error;

use aof_store::{Priority, Routing};

use when::{WhenExpr, WhenParseError};

/// Name of the built-in workflow.
pub const DEFAULT_WORKFLOW: &str = "standard";

/// Errors raised while loading or validating workflow definitions.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse workflows file: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("workflow {workflow:?} has no gates")]
    EmptyWorkflow { workflow: String },

    #[error("duplicate gate id {gate:?} in workflow {workflow:?}")]
    DuplicateGate { workflow: String, gate: String },

    #[error("duplicate workflow name {0:?}")]
    DuplicateWorkflow(String),

    #[error("bad `when` on gate {gate:?} in workflow {workflow:?}: {source}")]
    BadWhen {
        workflow: String,
        gate: String,
        source: WhenParseError,
    },
}

// ---------------------------------------------------------------------------
// Raw file format
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WorkflowsFile {
    workflows: Vec<RawWorkflow>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawWorkflow {
    name: String,
    #[serde(default)]
    rejection_strategy: RejectionStrategy,
    gates: Vec<RawGate>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawGate {
    id: String,
    role: String,
    #[serde(default)]
    can_reject: bool,
    #[serde(default)]
    timeout_minutes: Option<i64>,
    #[serde(default)]
    escalate_to: Option<String>,
    #[serde(default)]
    when: Option<String>,
}

// ---------------------------------------------------------------------------
// Validated model
// ---------------------------------------------------------------------------

/// Where a rejected task returns to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionStrategy {
    /// Back to the first gate with full history preserved.
    #[default]
    Origin,
    /// Back to the nearest prior enabled gate.
    Previous,
}

/// One gate within a workflow.
#[derive(Debug, Clone)]
pub struct GateDef {
    pub id: String,
    pub role: String,
    pub can_reject: bool,
    pub timeout: Option<Duration>,
    pub escalate_to: Option<String>,
    pub when: Option<WhenExpr>,
}

impl GateDef {
    /// Whether this gate applies to a task with the given routing.
    pub fn is_enabled(&self, routing: &Routing, priority: Priority) -> bool {
        match &self.when {
            Some(expr) => expr.eval(routing, priority),
            None => true,
        }
    }
}

/// A named, ordered sequence of gates.
#[derive(Debug, Clone)]
pub struct Workflow {
    pub name: String,
    pub rejection_strategy: RejectionStrategy,
    pub gates: Vec<GateDef>,
}

impl Workflow {
    pub fn gate(&self, id: &str) -> Option<&GateDef> {
        self.gates.iter().find(|g| g.id == id)
    }

    pub fn gate_index(&self, id: &str) -> Option<usize> {
        self.gates.iter().position(|g| g.id == id)
    }

    /// First `when`-enabled gate for the given routing.
    pub fn first_enabled(&self, routing: &Routing, priority: Priority) -> Option<&GateDef> {
        self.gates
            .iter()
            .find(|g| g.is_enabled(routing, priority))
    }
}

/// All workflows known to a vault, keyed by name.
#[derive(Debug, Clone)]
pub struct WorkflowSet {
    workflows: HashMap<String, Workflow>,
}

impl WorkflowSet {
    /// Load from `<vault>/workflows.yaml`, falling back to the built-in
    /// default set when the file does not exist.
    pub fn load(vault: &Path) -> Result<Self, WorkflowError> {
        let path = vault.join("workflows.yaml");
        if !path.is_file() {
            return Ok(Self::builtin());
        }
        let content = std::fs::read_to_string(&path).map_err(|e| WorkflowError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        Self::parse(&content)
    }

    /// Parse and validate a workflows YAML document.
    pub fn parse(content: &str) -> Result<Self, WorkflowError> {
        let file: WorkflowsFile = serde_yaml::from_str(content)?;
        let mut workflows = HashMap::new();

        for raw in file.workflows {
            if raw.gates.is_empty() {
                return Err(WorkflowError::EmptyWorkflow {
                    workflow: raw.name,
                });
            }

            let mut seen = HashSet::new();
            let mut gates = Vec::with_capacity(raw.gates.len());
            for gate in raw.gates {
                if !seen.insert(gate.id.clone()) {
                    return Err(WorkflowError::DuplicateGate {
                        workflow: raw.name,
                        gate: gate.id,
                    });
                }
                let when = match gate.when {
                    Some(source) => {
                        Some(WhenExpr::parse(&source).map_err(|e| WorkflowError::BadWhen {
                            workflow: raw.name.clone(),
                            gate: gate.id.clone(),
                            source: e,
                        })?)
                    }
                    None => None,
                };
                gates.push(GateDef {
                    id: gate.id,
                    role: gate.role,
                    can_reject: gate.can_reject,
                    timeout: gate.timeout_minutes.map(Duration::minutes),
                    escalate_to: gate.escalate_to,
                    when,
                });
            }

            let workflow = Workflow {
                name: raw.name.clone(),
                rejection_strategy: raw.rejection_strategy,
                gates,
            };
            if workflows.insert(raw.name.clone(), workflow).is_some() {
                return Err(WorkflowError::DuplicateWorkflow(raw.name));
            }
        }

        Ok(Self { workflows })
    }

    /// The built-in default set: one `standard` workflow.
    pub fn builtin() -> Self {
        let gate = |id: &str, role: &str, can_reject: bool, when: Option<&str>| GateDef {
            id: id.to_string(),
            role: role.to_string(),
            can_reject,
            timeout: None,
            escalate_to: None,
            when: when.map(|s| WhenExpr::parse(s).expect("builtin when must parse")),
        };

        let standard = Workflow {
            name: DEFAULT_WORKFLOW.to_string(),
            rejection_strategy: RejectionStrategy::Origin,
            gates: vec![
                gate("implement", "backend", false, None),
                gate("code-review", "architect", true, None),
                gate("qa", "qa", true, None),
                gate("security", "security", true, Some("tags.security")),
                gate("po-accept", "product", true, None),
            ],
        };

        let mut workflows = HashMap::new();
        workflows.insert(standard.name.clone(), standard);
        Self { workflows }
    }

    pub fn get(&self, name: &str) -> Option<&Workflow> {
        self.workflows.get(name)
    }

    /// Resolve a task's workflow: `routing.workflow` if set and known,
    /// otherwise the default.
    pub fn resolve(&self, routing: &Routing) -> Option<&Workflow> {
        if let Some(name) = &routing.workflow {
            if let Some(workflow) = self.workflows.get(name) {
                return Some(workflow);
            }
            tracing::warn!(workflow = %name, "unknown workflow, falling back to default");
        }
        self.workflows.get(DEFAULT_WORKFLOW)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.workflows.keys().map(String::as_str).collect();
        names.sort();
        names
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
