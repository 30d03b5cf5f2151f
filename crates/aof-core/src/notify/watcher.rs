//! Hot reload for the notification rules file.
//!
//! Watches the rules YAML with `notify`; on any change the file is
//! re-parsed and the engine's rule set is swapped atomically. A broken
//! edit falls back to the built-in defaults rather than wedging routing.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use super::{NotificationEngine, RuleSet};

/// Handle keeping the filesystem watcher and reload task alive.
pub struct RulesWatcher {
    // Dropped with the handle, which stops event delivery.
    _watcher: RecommendedWatcher,
    task: tokio::task::JoinHandle<()>,
}

impl RulesWatcher {
    /// Watch `path` and push reloads into `engine`.
    ///
    /// The parent directory is watched (not the file itself) so
    /// atomic-rename editors keep working.
    pub fn spawn(path: PathBuf, engine: Arc<NotificationEngine>) -> Result<Self> {
        let (tx, mut rx) = mpsc::channel::<Result<Event, notify::Error>>(16);

        let mut watcher = notify::recommended_watcher(move |res| {
            // A full channel just drops an event; the next change wins.
            let _ = tx.blocking_send(res);
        })?;

        let watch_root = path
            .parent()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        watcher.watch(&watch_root, RecursiveMode::NonRecursive)?;

        let file_name = path.file_name().map(|n| n.to_owned());
        let task = tokio::spawn(async move {
            while let Some(res) = rx.recv().await {
                let event = match res {
                    Ok(event) => event,
                    Err(e) => {
                        tracing::warn!(error = %e, "rules watcher error");
                        continue;
                    }
                };
                if !matches!(
                    event.kind,
                    EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                ) {
                    continue;
                }
                let touches_rules = event.paths.iter().any(|p| {
                    p.file_name().map(|n| n.to_owned()) == file_name
                });
                if !touches_rules {
                    continue;
                }

                tracing::debug!(path = %path.display(), "rules file changed, reloading");
                engine.swap_rules(RuleSet::load_or_default(&path));
            }
        });

        Ok(Self {
            _watcher: watcher,
            task,
        })
    }

    /// Stop watching.
    pub fn stop(self) {
        self.task.abort();
    }
}
