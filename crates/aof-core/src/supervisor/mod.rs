//! Service supervisor: lifecycle, poll loop, and reconciliation.
//!
//! The supervisor owns the periodic poll loop. Polls are serialized through
//! an async mutex, guarded by a timeout, and survive individual failures;
//! `stop` drains the in-flight poll up to a bound and then proceeds
//! regardless.

pub mod http;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use aof_store::{EventLogger, ListFilter, TaskStatus, TaskStore};

use crate::lease::LeaseManager;
use crate::scheduler::{PollResult, Scheduler};

/// Supervisor timing configuration.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub poll_interval: Duration,
    pub poll_timeout: Duration,
    pub drain_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            poll_timeout: Duration::from_secs(120),
            drain_timeout: Duration::from_secs(10),
        }
    }
}

/// Observable supervisor state.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SupervisorStatus {
    pub running: bool,
    pub last_poll_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub poll_interval_ms: u64,
}

#[derive(Debug, Default)]
struct SharedState {
    running: AtomicBool,
    last_poll_at: Mutex<Option<DateTime<Utc>>>,
    last_error: Mutex<Option<String>>,
}

/// The service supervisor for one project.
pub struct Supervisor {
    scheduler: Arc<Scheduler>,
    leases: Arc<LeaseManager>,
    events: Arc<EventLogger>,
    store: TaskStore,
    config: SupervisorConfig,
    state: Arc<SharedState>,
    cancel: CancellationToken,
    // Serializes polls: exactly one poll executes at a time.
    poll_lock: Arc<tokio::sync::Mutex<()>>,
    loop_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Supervisor {
    pub fn new(
        scheduler: Arc<Scheduler>,
        leases: Arc<LeaseManager>,
        events: Arc<EventLogger>,
        store: TaskStore,
        config: SupervisorConfig,
    ) -> Self {
        Self {
            scheduler,
            leases,
            events,
            store,
            config,
            state: Arc::new(SharedState::default()),
            cancel: CancellationToken::new(),
            poll_lock: Arc::new(tokio::sync::Mutex::new(())),
            loop_handle: Mutex::new(None),
        }
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    /// Start the supervisor: reconcile orphans, run the startup poll, and
    /// begin interval polling.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.store.paths().ensure()?;

        let reclaimed = self.reconcile_orphans()?;
        tracing::info!("{} task(s) reclaimed", reclaimed);

        self.state.running.store(true, Ordering::SeqCst);
        self.scheduler.metrics().scheduler_up.set(1);
        self.events.append(
            "system.startup",
            "supervisor",
            None,
            serde_json::json!({ "reclaimed": reclaimed }),
        )?;

        self.run_poll("startup").await;

        // Periodic polls until cancelled.
        let supervisor = Arc::clone(self);
        let cancel = self.cancel.clone();
        let interval = self.config.poll_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick fires immediately; the startup poll covered it.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        supervisor.run_poll("interval").await;
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        });
        *self.loop_handle.lock().expect("loop handle lock poisoned") = Some(handle);

        Ok(())
    }

    /// Graceful stop: drain the in-flight poll up to `drain_timeout`, then
    /// shut down regardless.
    pub async fn stop(&self) -> Result<()> {
        self.cancel.cancel();

        let drained =
            tokio::time::timeout(self.config.drain_timeout, self.poll_lock.lock()).await;
        match drained {
            Ok(_guard) => tracing::debug!("in-flight poll drained"),
            Err(_) => tracing::warn!(
                "drain timeout after {:?}, shutting down with poll in flight",
                self.config.drain_timeout
            ),
        }

        if let Some(handle) = self
            .loop_handle
            .lock()
            .expect("loop handle lock poisoned")
            .take()
        {
            handle.abort();
        }

        self.leases.stop_all();
        self.state.running.store(false, Ordering::SeqCst);
        self.scheduler.metrics().scheduler_up.set(0);
        self.events
            .append("system.shutdown", "supervisor", None, serde_json::Value::Null)?;
        Ok(())
    }

    /// Route an inbound protocol message, then poll immediately.
    pub async fn handle_message(&self, message: &str) {
        tracing::debug!(message = %message, "message received, triggering poll");
        self.run_poll("message").await;
    }

    /// Run one poll under the timeout guard. A timed-out or failed poll
    /// records `last_error` and leaves the supervisor running.
    pub async fn run_poll(&self, reason: &str) -> Option<PollResult> {
        let _guard = self.poll_lock.lock().await;

        let outcome =
            tokio::time::timeout(self.config.poll_timeout, self.scheduler.poll(reason)).await;

        match outcome {
            Ok(Ok(result)) => {
                *self
                    .state
                    .last_poll_at
                    .lock()
                    .expect("poll state lock poisoned") = Some(result.scanned_at);
                *self
                    .state
                    .last_error
                    .lock()
                    .expect("error state lock poisoned") = None;
                self.cleanup_renewal_timers();
                Some(result)
            }
            Ok(Err(e)) => {
                tracing::error!(reason = %reason, error = %format!("{e:#}"), "poll failed");
                self.scheduler.metrics().poll_failures.inc();
                *self
                    .state
                    .last_error
                    .lock()
                    .expect("error state lock poisoned") = Some(format!("{e:#}"));
                None
            }
            Err(_) => {
                tracing::error!(
                    reason = %reason,
                    timeout = ?self.config.poll_timeout,
                    "poll timed out, aborting"
                );
                self.scheduler.metrics().poll_failures.inc();
                *self
                    .state
                    .last_error
                    .lock()
                    .expect("error state lock poisoned") =
                    Some(format!("poll timed out after {:?}", self.config.poll_timeout));
                None
            }
        }
    }

    /// Observable surface.
    pub fn status(&self) -> SupervisorStatus {
        SupervisorStatus {
            running: self.state.running.load(Ordering::SeqCst),
            last_poll_at: *self
                .state
                .last_poll_at
                .lock()
                .expect("poll state lock poisoned"),
            last_error: self
                .state
                .last_error
                .lock()
                .expect("error state lock poisoned")
                .clone(),
            poll_interval_ms: self.config.poll_interval.as_millis() as u64,
        }
    }

    pub fn is_running(&self) -> bool {
        self.state.running.load(Ordering::SeqCst)
    }

    /// Return every orphan (in-progress, no active lease) to `ready`.
    ///
    /// Idempotent: a second run over a stable store reclaims nothing.
    fn reconcile_orphans(&self) -> Result<usize> {
        let now = Utc::now();
        let in_progress = self.store.list(&ListFilter {
            status: Some(TaskStatus::InProgress),
            agent: None,
        })?;

        let mut reclaimed = 0usize;
        for task in in_progress {
            if task.has_active_lease(now) {
                continue;
            }
            match self.store.transition(
                &task.id,
                TaskStatus::Ready,
                Some("reclaimed at startup: no active lease"),
            ) {
                Ok(_) => {
                    tracing::warn!(task_id = %task.id, "reclaimed orphaned task");
                    reclaimed += 1;
                }
                Err(e) => {
                    tracing::error!(task_id = %task.id, error = %e, "failed to reclaim orphan");
                }
            }
        }
        Ok(reclaimed)
    }

    /// Drop renewal timers for tasks that left `in-progress`.
    fn cleanup_renewal_timers(&self) {
        match self.store.list(&ListFilter {
            status: Some(TaskStatus::InProgress),
            agent: None,
        }) {
            Ok(tasks) => {
                let active: std::collections::HashSet<String> =
                    tasks.into_iter().map(|t| t.id).collect();
                self.leases.cleanup(&active);
            }
            Err(e) => tracing::warn!(error = %e, "renewal timer cleanup skipped"),
        }
    }
}
