//! Org chart input.
//!
//! The core consumes a validated org chart (`<vault>/org.yaml`) as data: it
//! supplies team default agents and per-team throttle overrides to the
//! scheduler, and role assignments to the permission guard. Drift between
//! the chart and on-disk state is detected elsewhere; this module only
//! loads and indexes it.

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

/// Errors raised while loading the org chart.
#[derive(Debug, Error)]
pub enum OrgError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse org chart: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("duplicate team {0:?} in org chart")]
    DuplicateTeam(String),
}

/// A team definition.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TeamDef {
    pub name: String,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub default_agent: Option<String>,
    /// Per-team concurrency override for the throttle controller.
    #[serde(default)]
    pub max_concurrent: Option<usize>,
    /// Per-team dispatch interval override, in milliseconds.
    #[serde(default)]
    pub min_interval_ms: Option<i64>,
}

/// An agent registration.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentDef {
    pub name: String,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub team: Option<String>,
}

fn default_admin_roles() -> Vec<String> {
    vec!["lead".to_string(), "admin".to_string()]
}

/// The validated org chart.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OrgChart {
    #[serde(default)]
    pub teams: Vec<TeamDef>,
    #[serde(default)]
    pub agents: Vec<AgentDef>,
    /// Roles permitted to perform destructive operations.
    #[serde(default = "default_admin_roles")]
    pub admin_roles: Vec<String>,
}

impl Default for OrgChart {
    fn default() -> Self {
        Self {
            teams: Vec::new(),
            agents: Vec::new(),
            admin_roles: default_admin_roles(),
        }
    }
}

impl OrgChart {
    /// Load `<vault>/org.yaml`. An absent file yields the permissive
    /// default chart.
    pub fn load(vault: &Path) -> Result<Self, OrgError> {
        let path = vault.join("org.yaml");
        if !path.is_file() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path).map_err(|e| OrgError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        Self::parse(&content)
    }

    /// Parse and validate an org chart document.
    pub fn parse(content: &str) -> Result<Self, OrgError> {
        let chart: OrgChart = serde_yaml::from_str(content)?;
        let mut seen = std::collections::HashSet::new();
        for team in &chart.teams {
            if !seen.insert(team.name.as_str()) {
                return Err(OrgError::DuplicateTeam(team.name.clone()));
            }
        }
        Ok(chart)
    }

    pub fn team(&self, name: &str) -> Option<&TeamDef> {
        self.teams.iter().find(|t| t.name == name)
    }

    /// Default agent for a team, if configured.
    pub fn default_agent_for_team(&self, team: &str) -> Option<&str> {
        self.team(team)?.default_agent.as_deref()
    }

    /// Role assigned to an agent, if registered.
    pub fn role_of(&self, agent: &str) -> Option<&str> {
        self.agents
            .iter()
            .find(|a| a.name == agent)?
            .role
            .as_deref()
    }

    /// Whether the chart registers any agents at all. An empty registry
    /// means actor checks run in permissive mode.
    pub fn has_agent_registry(&self) -> bool {
        !self.agents.is_empty()
    }

    pub fn is_admin_role(&self, role: &str) -> bool {
        self.admin_roles.iter().any(|r| r == role)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
teams:
  - name: platform
    roles: [backend, architect]
    defaultAgent: platform-bot
    maxConcurrent: 4
    minIntervalMs: 2000
  - name: quality
    roles: [qa]
agents:
  - name: platform-bot
    role: backend
    team: platform
  - name: boss
    role: lead
"#;

    #[test]
    fn parse_sample() {
        let chart = OrgChart::parse(SAMPLE).unwrap();
        assert_eq!(chart.teams.len(), 2);
        assert_eq!(chart.default_agent_for_team("platform"), Some("platform-bot"));
        assert_eq!(chart.team("platform").unwrap().max_concurrent, Some(4));
        assert_eq!(chart.role_of("boss"), Some("lead"));
        assert!(chart.role_of("stranger").is_none());
        assert!(chart.is_admin_role("lead"));
        assert!(!chart.is_admin_role("backend"));
    }

    #[test]
    fn duplicate_team_rejected() {
        let bad = "teams:\n  - name: x\n  - name: x\n";
        assert!(matches!(
            OrgChart::parse(bad),
            Err(OrgError::DuplicateTeam(_))
        ));
    }

    #[test]
    fn missing_file_is_permissive_default() {
        let dir = tempfile::TempDir::new().unwrap();
        let chart = OrgChart::load(dir.path()).unwrap();
        assert!(!chart.has_agent_registry());
        assert_eq!(chart.admin_roles, vec!["lead", "admin"]);
    }
}
