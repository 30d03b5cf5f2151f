//! Configuration for the aof CLI.
//!
//! Provides a TOML config file at `~/.config/aof/config.toml` and a
//! resolution chain for the vault root: CLI flag > `AOF_ROOT` env > config
//! file > `./vault` default.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Default vault root when nothing else is configured.
pub const DEFAULT_VAULT: &str = "./vault";

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub vault: VaultSection,
    #[serde(default)]
    pub scheduler: SchedulerSection,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct VaultSection {
    pub root: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct SchedulerSection {
    pub poll_interval_secs: Option<u64>,
    pub port: Option<u16>,
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the aof config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/aof` or `~/.config/aof`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("aof");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("aof")
}

/// Return the path to the aof config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load and parse the config file. Returns an error if it does not exist.
pub fn load_config() -> Result<ConfigFile> {
    let path = config_path();
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents).context("failed to parse config file")?;
    Ok(config)
}

/// Serialize and write the config file, creating parent dirs as needed.
pub fn save_config(config: &ConfigFile) -> Result<()> {
    let path = config_path();
    let dir = config_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create config directory {}", dir.display()))?;

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;
    Ok(())
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Fully resolved configuration, ready for use.
#[derive(Debug)]
pub struct AofConfig {
    pub vault: PathBuf,
    pub poll_interval: Duration,
    pub port: u16,
}

impl AofConfig {
    /// Resolve using the chain: CLI flag > env var > config file > default.
    pub fn resolve(cli_root: Option<&str>) -> Self {
        let file_config = load_config().ok();

        let vault = if let Some(root) = cli_root {
            PathBuf::from(root)
        } else if let Ok(root) = std::env::var("AOF_ROOT") {
            PathBuf::from(root)
        } else if let Some(root) = file_config
            .as_ref()
            .and_then(|c| c.vault.root.clone())
        {
            PathBuf::from(root)
        } else {
            PathBuf::from(DEFAULT_VAULT)
        };

        let poll_interval = file_config
            .as_ref()
            .and_then(|c| c.scheduler.poll_interval_secs)
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(30));

        let port = file_config
            .as_ref()
            .and_then(|c| c.scheduler.port)
            .unwrap_or(4800);

        Self {
            vault,
            poll_interval,
            port,
        }
    }
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------
