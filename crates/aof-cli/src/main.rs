mod board_cmd;
mod config;
mod lint_cmd;
mod projects_cmd;
mod serve_cmd;
mod status_cmd;

use std::time::Duration;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};

use aof_store::StoreError;

use board_cmd::Swimlane;
use config::AofConfig;

#[derive(Parser)]
#[command(name = "aof", about = "File-backed workflow engine for agent fleets")]
struct Cli {
    /// Vault root (overrides AOF_ROOT env var and config file)
    #[arg(long, global = true)]
    root: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Bootstrap a vault with a first project and write the config file
    Init {
        /// Project id to create
        #[arg(long)]
        project: String,
        /// Human-readable project name (defaults to the id)
        #[arg(long)]
        name: Option<String>,
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },
    /// Project management
    Projects {
        #[command(subcommand)]
        command: ProjectCommands,
    },
    /// Render a text kanban board
    Board {
        /// Project id
        project: String,
        /// How to group lanes
        #[arg(long, value_enum, default_value = "status")]
        swimlane: Swimlane,
    },
    /// Validate a project's task tree and write the lint report
    Lint {
        /// Project id
        project: String,
    },
    /// Show task counts and the task list for a project
    Status {
        /// Project id
        project: String,
    },
    /// Run the scheduler daemon with the HTTP surface
    Serve {
        /// Project id
        project: String,
        /// Bind address
        #[arg(long, default_value = "127.0.0.1")]
        bind: String,
        /// HTTP port (overrides config file)
        #[arg(long)]
        port: Option<u16>,
        /// Poll interval in seconds (overrides config file)
        #[arg(long)]
        poll_interval_secs: Option<u64>,
        /// Plan actions without executing them
        #[arg(long)]
        dry_run: bool,
    },
    /// Generate shell completions
    Completions {
        /// Target shell
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
enum ProjectCommands {
    /// Create a project
    Create {
        /// Project id
        id: String,
        /// Human-readable name (defaults to the id)
        #[arg(long)]
        name: Option<String>,
        /// Parent project id
        #[arg(long)]
        parent: Option<String>,
    },
    /// List projects with task counts
    List,
    /// Lint every project
    Lint,
}

/// Execute the `aof init` command: create the vault, the first project,
/// and the config file.
fn cmd_init(cfg: &AofConfig, project: &str, name: Option<&str>, force: bool) -> anyhow::Result<()> {
    let path = config::config_path();
    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    projects_cmd::run_create(&cfg.vault, project, name, None)?;

    let file = config::ConfigFile {
        vault: config::VaultSection {
            root: Some(cfg.vault.display().to_string()),
        },
        scheduler: config::SchedulerSection::default(),
    };
    config::save_config(&file).context("failed to write config file")?;

    println!("Config written to {}", path.display());
    println!("  vault.root = {}", cfg.vault.display());
    println!();
    println!("Next: run `aof serve {project}` to start the scheduler.");
    Ok(())
}

/// Map an error to the documented exit codes: 1 for user-visible failures,
/// 2 for internal errors.
fn exit_code_for(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<StoreError>() {
        Some(StoreError::Io(_)) => 2,
        _ => 1,
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let cfg = AofConfig::resolve(cli.root.as_deref());

    match cli.command {
        Commands::Init {
            project,
            name,
            force,
        } => {
            cmd_init(&cfg, &project, name.as_deref(), force)?;
        }
        Commands::Projects { command } => match command {
            ProjectCommands::Create { id, name, parent } => {
                projects_cmd::run_create(&cfg.vault, &id, name.as_deref(), parent.as_deref())?;
            }
            ProjectCommands::List => {
                projects_cmd::run_list(&cfg.vault)?;
            }
            ProjectCommands::Lint => {
                let issues = projects_cmd::run_lint_all(&cfg.vault)?;
                if issues > 0 {
                    anyhow::bail!("{issues} lint issue(s) found");
                }
            }
        },
        Commands::Board { project, swimlane } => {
            board_cmd::run_board(&cfg.vault, &project, swimlane)?;
        }
        Commands::Lint { project } => {
            let issues = lint_cmd::run_lint(&cfg.vault, &project)?;
            if issues > 0 {
                anyhow::bail!("{issues} lint issue(s) found");
            }
        }
        Commands::Status { project } => {
            status_cmd::run_status(&cfg.vault, &project)?;
        }
        Commands::Serve {
            project,
            bind,
            port,
            poll_interval_secs,
            dry_run,
        } => {
            let opts = serve_cmd::ServeOptions {
                bind,
                port: port.unwrap_or(cfg.port),
                poll_interval: poll_interval_secs
                    .map(Duration::from_secs)
                    .unwrap_or(cfg.poll_interval),
                dry_run,
            };
            serve_cmd::run_serve(&cfg, &project, &opts).await?;
        }
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            let name = cmd.get_name().to_string();
            clap_complete::generate(shell, &mut cmd, name, &mut std::io::stdout());
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("{e:#}");
        std::process::exit(exit_code_for(&e));
    }
}
