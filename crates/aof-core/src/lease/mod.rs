//! Lease management: single-writer-per-task claims with in-process renewal
//! timers.
//!
//! The persisted lease field on the task file is the source of truth; the
//! store's rewrite-and-rename is the atomicity boundary for acquisition.
//! Renewal timers are keyed `project:task` and fire at half the TTL until
//! stopped, the holder changes, or the renewal budget is exhausted.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use chrono::{Duration, Utc};
use thiserror::Error;
use tokio::task::JoinHandle;

use aof_store::{Lease, StoreError, TaskStore};

/// Default cap on lease renewals.
pub const DEFAULT_MAX_RENEWALS: u32 = 20;

/// Errors raised by lease operations.
#[derive(Debug, Error)]
pub enum LeaseError {
    #[error("task {id} already leased by {holder}")]
    Held { id: String, holder: String },

    #[error("caller {agent} does not hold the lease on task {id}")]
    NotHeld { id: String, agent: String },

    #[error("lease on task {id} has exhausted its {max} renewals")]
    RenewalsExhausted { id: String, max: u32 },

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for LeaseError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::LeaseHeld { id, holder } => Self::Held { id, holder },
            StoreError::LeaseNotHeld { id, agent } => Self::NotHeld { id, agent },
            other => Self::Store(other),
        }
    }
}

/// Lease timing configuration.
#[derive(Debug, Clone)]
pub struct LeaseConfig {
    pub ttl: Duration,
    pub max_renewals: u32,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::minutes(15),
            max_renewals: DEFAULT_MAX_RENEWALS,
        }
    }
}

/// Manages leases for one project's store.
pub struct LeaseManager {
    store: TaskStore,
    config: LeaseConfig,
    timers: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
}

impl LeaseManager {
    pub fn new(store: TaskStore, config: LeaseConfig) -> Self {
        Self {
            store,
            config,
            timers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &LeaseConfig {
        &self.config
    }

    /// Acquire a lease for `agent`. Fails when an active lease exists.
    pub fn acquire(&self, task_id: &str, agent: &str) -> Result<Lease, LeaseError> {
        let lease = self.store.set_lease(task_id, agent, self.config.ttl)?;
        tracing::debug!(task_id = %task_id, agent = %agent, expires_at = %lease.expires_at, "lease acquired");
        Ok(lease)
    }

    /// Renew the lease held by `agent`, enforcing the renewal budget.
    pub fn renew(&self, task_id: &str, agent: &str) -> Result<Lease, LeaseError> {
        let lease = renew_once(&self.store, &self.config, task_id, agent)?;
        tracing::debug!(
            task_id = %task_id,
            agent = %agent,
            renewal_count = lease.renewal_count,
            "lease renewed"
        );
        Ok(lease)
    }

    /// Release the lease iff `agent` holds it.
    pub fn release(&self, task_id: &str, agent: &str) -> Result<(), LeaseError> {
        self.store.clear_lease(task_id, Some(agent))?;
        self.stop_renewal(task_id);
        tracing::debug!(task_id = %task_id, agent = %agent, "lease released");
        Ok(())
    }

    /// Force-clear an expired lease (scheduler expiry path).
    pub fn expire(&self, task_id: &str) -> Result<(), LeaseError> {
        self.store.clear_lease(task_id, None)?;
        self.stop_renewal(task_id);
        Ok(())
    }

    /// Whether a lease is active at `now`.
    pub fn is_active(lease: &Lease) -> bool {
        lease.is_active(Utc::now())
    }

    /// Start a background renewal timer firing at ttl/2. The timer stops
    /// itself once a renewal fails (holder change, exhaustion, task gone).
    pub fn start_renewal(&self, task_id: &str, agent: &str) {
        let key = self.timer_key(task_id);
        let store = self.store.clone();
        let config = self.config.clone();
        let task_id = task_id.to_string();
        let agent = agent.to_string();

        let interval = (self.config.ttl / 2)
            .to_std()
            .unwrap_or(std::time::Duration::from_secs(60));

        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;

                let renewed = renew_once(&store, &config, &task_id, &agent);
                match renewed {
                    Ok(lease) => {
                        tracing::debug!(
                            task_id = %task_id,
                            renewal_count = lease.renewal_count,
                            "renewal timer extended lease"
                        );
                    }
                    Err(e) => {
                        tracing::info!(task_id = %task_id, reason = %e, "renewal timer stopping");
                        break;
                    }
                }
            }
        });

        let mut timers = self.timers.lock().expect("timer lock poisoned");
        if let Some(old) = timers.insert(key, handle) {
            old.abort();
        }
    }

    /// Stop the renewal timer for a task, if any.
    pub fn stop_renewal(&self, task_id: &str) {
        let key = self.timer_key(task_id);
        if let Some(handle) = self
            .timers
            .lock()
            .expect("timer lock poisoned")
            .remove(&key)
        {
            handle.abort();
        }
    }

    /// Stop timers for tasks that are no longer live (not in `active_ids`).
    pub fn cleanup(&self, active_ids: &HashSet<String>) {
        let mut timers = self.timers.lock().expect("timer lock poisoned");
        let stale: Vec<String> = timers
            .keys()
            .filter(|key| {
                key.rsplit_once(':')
                    .is_none_or(|(_, id)| !active_ids.contains(id))
            })
            .cloned()
            .collect();
        for key in stale {
            if let Some(handle) = timers.remove(&key) {
                handle.abort();
                tracing::debug!(timer = %key, "stopped stale renewal timer");
            }
        }
    }

    /// Stop every timer (shutdown path).
    pub fn stop_all(&self) {
        let mut timers = self.timers.lock().expect("timer lock poisoned");
        for (_, handle) in timers.drain() {
            handle.abort();
        }
    }

    /// Number of live renewal timers.
    pub fn timer_count(&self) -> usize {
        self.timers.lock().expect("timer lock poisoned").len()
    }

    fn timer_key(&self, task_id: &str) -> String {
        format!("{}:{}", self.store.project_id(), task_id)
    }
}

/// One renewal attempt, shared between [`LeaseManager::renew`] and the
/// background timer.
fn renew_once(
    store: &TaskStore,
    config: &LeaseConfig,
    task_id: &str,
    agent: &str,
) -> Result<Lease, LeaseError> {
    let task = store.require(task_id)?;
    let current = task.lease.as_ref().ok_or_else(|| LeaseError::NotHeld {
        id: task_id.to_string(),
        agent: agent.to_string(),
    })?;
    if current.renewal_count >= config.max_renewals {
        return Err(LeaseError::RenewalsExhausted {
            id: task_id.to_string(),
            max: config.max_renewals,
        });
    }
    Ok(store.renew_lease(task_id, agent, config.ttl)?)
}
