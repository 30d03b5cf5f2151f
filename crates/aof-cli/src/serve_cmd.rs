//! `aof serve` command: run the supervisor and HTTP surface until ctrl-c.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use aof_core::executor::MockExecutor;
use aof_core::lease::{LeaseConfig, LeaseManager};
use aof_core::metrics::Metrics;
use aof_core::notify::watcher::RulesWatcher;
use aof_core::notify::{NotificationEngine, RuleSet};
use aof_core::org::OrgChart;
use aof_core::scheduler::{Scheduler, SchedulerConfig};
use aof_core::supervisor::{http, Supervisor, SupervisorConfig};
use aof_core::throttle::{ThrottleController, ThrottleLimits};
use aof_core::workflow::WorkflowSet;
use aof_store::{EventLogger, TaskStore};

use crate::config::AofConfig;

/// Options for the serve command.
#[derive(Debug, Clone)]
pub struct ServeOptions {
    pub bind: String,
    pub port: u16,
    pub poll_interval: Duration,
    pub dry_run: bool,
}

/// Wire the engine together and serve until interrupted.
pub async fn run_serve(config: &AofConfig, project: &str, opts: &ServeOptions) -> Result<()> {
    let store = TaskStore::open(&config.vault, project)
        .with_context(|| format!("failed to open project {project}"))?;

    let events = Arc::new(
        EventLogger::open(store.paths().events_dir()).context("failed to open event log")?,
    );

    // Notification engine consumes every appended event; rules hot-reload
    // from <vault>/notifications.yaml.
    let rules_path = config.vault.join("notifications.yaml");
    let engine = Arc::new(NotificationEngine::new(RuleSet::load_or_default(&rules_path)));
    events.add_sink(engine.clone());
    let _rules_watcher = match RulesWatcher::spawn(rules_path.clone(), engine.clone()) {
        Ok(watcher) => Some(watcher),
        Err(e) => {
            tracing::warn!(error = %e, "rules hot-reload disabled");
            None
        }
    };

    let metrics = Metrics::new().context("failed to build metrics registry")?;
    let leases = Arc::new(LeaseManager::new(store.clone(), LeaseConfig::default()));
    let workflows = WorkflowSet::load(&config.vault).context("failed to load workflows")?;
    let org = OrgChart::load(&config.vault).context("failed to load org chart")?;
    let throttle = ThrottleController::new(ThrottleLimits::default());

    // The core ships the mock executor; real adapters plug in through the
    // same trait.
    let executor = Arc::new(MockExecutor::new());

    let scheduler = Arc::new(Scheduler::new(
        store.clone(),
        events.clone(),
        leases.clone(),
        throttle,
        workflows,
        org,
        executor,
        metrics,
        SchedulerConfig {
            dry_run: opts.dry_run,
            ..SchedulerConfig::default()
        },
    ));

    let supervisor = Arc::new(Supervisor::new(
        scheduler,
        leases,
        events,
        store,
        SupervisorConfig {
            poll_interval: opts.poll_interval,
            ..SupervisorConfig::default()
        },
    ));

    supervisor.start().await.context("supervisor startup failed")?;

    let serve_result = http::run_serve(supervisor.clone(), &opts.bind, opts.port).await;

    supervisor.stop().await.context("supervisor shutdown failed")?;
    serve_result
}
