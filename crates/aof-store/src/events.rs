//! Append-only event log.
//!
//! One JSON object per line in `events/YYYY-MM-DD.jsonl`. Event ids are
//! strictly monotonic per project across daily files; the counter is
//! recovered by scanning the newest file at open.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};
use crate::fsutil;

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// An immutable record of something that happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub event_id: u64,
    #[serde(rename = "type")]
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub actor: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub payload: serde_json::Value,
}

/// Consumer of appended events (notification engine, metrics bridge, ...).
///
/// Sink failures are logged and isolated; they never fail the append.
pub trait EventSink: Send + Sync {
    fn handle(&self, event: &Event);
}

// ---------------------------------------------------------------------------
// EventLogger
// ---------------------------------------------------------------------------

/// Appends events for one project and fans them out to registered sinks.
pub struct EventLogger {
    events_dir: PathBuf,
    next_id: AtomicU64,
    // Serializes appends so interleaved writers cannot produce torn lines
    // or out-of-order ids within a file.
    write_lock: Mutex<()>,
    sinks: Mutex<Vec<Arc<dyn EventSink>>>,
}

impl EventLogger {
    /// Open the logger, recovering the id counter from the newest file.
    pub fn open(events_dir: PathBuf) -> Result<Self> {
        fsutil::ensure_dir(&events_dir)?;
        let next_id = last_event_id(&events_dir)? + 1;
        Ok(Self {
            events_dir,
            next_id: AtomicU64::new(next_id),
            write_lock: Mutex::new(()),
            sinks: Mutex::new(Vec::new()),
        })
    }

    /// Register a sink to receive every event appended after this call.
    pub fn add_sink(&self, sink: Arc<dyn EventSink>) {
        self.sinks.lock().expect("sink lock poisoned").push(sink);
    }

    /// Append an event with a freshly assigned id and fan it out.
    pub fn append(
        &self,
        event_type: &str,
        actor: &str,
        task_id: Option<&str>,
        payload: serde_json::Value,
    ) -> Result<Event> {
        let event = Event {
            event_id: self.next_id.fetch_add(1, Ordering::SeqCst),
            event_type: event_type.to_string(),
            timestamp: Utc::now(),
            actor: actor.to_string(),
            task_id: task_id.map(str::to_string),
            payload,
        };

        let line = serde_json::to_string(&event).map_err(|e| StoreError::Corrupt {
            path: self.events_dir.clone(),
            reason: format!("event serialization failed: {e}"),
        })?;

        {
            let _guard = self.write_lock.lock().expect("write lock poisoned");
            let path = self.file_for(event.timestamp);
            let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
            file.write_all(line.as_bytes())?;
            file.write_all(b"\n")?;
        }

        let sinks = self.sinks.lock().expect("sink lock poisoned").clone();
        for sink in sinks {
            sink.handle(&event);
        }

        Ok(event)
    }

    /// Read all events from a single day's file, oldest first.
    pub fn read_day(&self, day: &str) -> Result<Vec<Event>> {
        let path = self.events_dir.join(format!("{day}.jsonl"));
        if !path.is_file() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&path)?;
        let mut events = Vec::new();
        for line in content.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let event: Event = serde_json::from_str(line).map_err(|e| StoreError::Corrupt {
                path: path.clone(),
                reason: format!("bad event line: {e}"),
            })?;
            events.push(event);
        }
        Ok(events)
    }

    fn file_for(&self, at: DateTime<Utc>) -> PathBuf {
        self.events_dir
            .join(format!("{}.jsonl", at.format("%Y-%m-%d")))
    }
}

/// Highest event id across all files, or 0 when none exist.
///
/// Ids are monotonic across files, so only the lexically newest file needs
/// a full scan; older files cannot hold a higher id.
fn last_event_id(events_dir: &std::path::Path) -> Result<u64> {
    let mut newest: Option<PathBuf> = None;
    for entry in std::fs::read_dir(events_dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
            continue;
        }
        if newest.as_ref().is_none_or(|n| path > *n) {
            newest = Some(path);
        }
    }
    let Some(path) = newest else {
        return Ok(0);
    };

    let content = std::fs::read_to_string(&path)?;
    let mut max_id = 0u64;
    for line in content.lines() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Event>(line) {
            Ok(event) => max_id = max_id.max(event.event_id),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "skipping bad event line");
            }
        }
    }
    Ok(max_id)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_logger() -> (tempfile::TempDir, EventLogger) {
        let dir = tempfile::TempDir::new().unwrap();
        let logger = EventLogger::open(dir.path().join("events")).unwrap();
        (dir, logger)
    }

    #[test]
    fn event_ids_are_strictly_increasing() {
        let (_dir, logger) = temp_logger();
        let mut last = 0;
        for i in 0..5 {
            let e = logger
                .append("task.created", "tester", None, serde_json::json!({ "n": i }))
                .unwrap();
            assert!(e.event_id > last, "id {} not > {}", e.event_id, last);
            last = e.event_id;
        }
    }

    #[test]
    fn counter_survives_reopen() {
        let dir = tempfile::TempDir::new().unwrap();
        let events_dir = dir.path().join("events");

        let first_id;
        {
            let logger = EventLogger::open(events_dir.clone()).unwrap();
            first_id = logger
                .append("system.startup", "supervisor", None, serde_json::Value::Null)
                .unwrap()
                .event_id;
        }

        let logger = EventLogger::open(events_dir).unwrap();
        let next = logger
            .append("system.startup", "supervisor", None, serde_json::Value::Null)
            .unwrap();
        assert!(next.event_id > first_id);
    }

    #[test]
    fn events_land_in_daily_file() {
        let (_dir, logger) = temp_logger();
        logger
            .append("task.created", "tester", Some("T-1"), serde_json::Value::Null)
            .unwrap();

        let day = Utc::now().format("%Y-%m-%d").to_string();
        let events = logger.read_day(&day).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "task.created");
        assert_eq!(events[0].task_id.as_deref(), Some("T-1"));
    }

    #[test]
    fn sinks_receive_appended_events() {
        use std::sync::atomic::AtomicUsize;

        struct Counting(AtomicUsize);
        impl EventSink for Counting {
            fn handle(&self, _event: &Event) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let (_dir, logger) = temp_logger();
        let sink = Arc::new(Counting(AtomicUsize::new(0)));
        logger.add_sink(sink.clone());

        logger
            .append("task.created", "tester", None, serde_json::Value::Null)
            .unwrap();
        logger
            .append("task.transitioned", "tester", None, serde_json::Value::Null)
            .unwrap();

        assert_eq!(sink.0.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn read_day_missing_file_is_empty() {
        let (_dir, logger) = temp_logger();
        assert!(logger.read_day("1999-01-01").unwrap().is_empty());
    }
}
