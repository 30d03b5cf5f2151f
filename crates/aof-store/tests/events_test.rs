//! Integration tests for the event log: monotonic ids across reopen and
//! daily file layout.

use std::sync::Arc;

use chrono::Utc;

use aof_store::{Event, EventLogger, EventSink};

#[test]
fn ids_are_strictly_increasing_within_a_file() {
    let dir = tempfile::TempDir::new().unwrap();
    let logger = EventLogger::open(dir.path().join("events")).unwrap();

    for i in 0..20 {
        logger
            .append(
                "task.transitioned",
                "tester",
                Some(&format!("T-{i}")),
                serde_json::json!({ "n": i }),
            )
            .unwrap();
    }

    let day = Utc::now().format("%Y-%m-%d").to_string();
    let events = logger.read_day(&day).unwrap();
    assert_eq!(events.len(), 20);
    for pair in events.windows(2) {
        assert!(
            pair[1].event_id > pair[0].event_id,
            "ids must be strictly increasing: {} then {}",
            pair[0].event_id,
            pair[1].event_id
        );
    }
}

#[test]
fn reopen_continues_the_sequence() {
    let dir = tempfile::TempDir::new().unwrap();
    let events_dir = dir.path().join("events");

    let last = {
        let logger = EventLogger::open(events_dir.clone()).unwrap();
        let mut last = 0;
        for _ in 0..3 {
            last = logger
                .append("task.created", "tester", None, serde_json::Value::Null)
                .unwrap()
                .event_id;
        }
        last
    };

    let logger = EventLogger::open(events_dir).unwrap();
    let next = logger
        .append("task.created", "tester", None, serde_json::Value::Null)
        .unwrap();
    assert_eq!(next.event_id, last + 1);
}

#[test]
fn event_lines_are_valid_json_with_dotted_types() {
    let dir = tempfile::TempDir::new().unwrap();
    let events_dir = dir.path().join("events");
    let logger = EventLogger::open(events_dir.clone()).unwrap();
    logger
        .append(
            "lease.expired",
            "scheduler",
            Some("T-1"),
            serde_json::json!({ "agent": "bot-1" }),
        )
        .unwrap();

    let day = Utc::now().format("%Y-%m-%d").to_string();
    let path = events_dir.join(format!("{day}.jsonl"));
    let raw = std::fs::read_to_string(path).unwrap();
    let line = raw.lines().next().unwrap();

    let value: serde_json::Value = serde_json::from_str(line).unwrap();
    assert_eq!(value["type"], "lease.expired");
    assert_eq!(value["actor"], "scheduler");
    assert_eq!(value["taskId"], "T-1");
    assert_eq!(value["payload"]["agent"], "bot-1");
    assert!(value["eventId"].is_u64());
}

#[test]
fn multiple_sinks_all_observe_events() {
    struct Remember(std::sync::Mutex<Vec<String>>);
    impl EventSink for Remember {
        fn handle(&self, event: &Event) {
            self.0
                .lock()
                .unwrap()
                .push(event.event_type.clone());
        }
    }

    let dir = tempfile::TempDir::new().unwrap();
    let logger = EventLogger::open(dir.path().join("events")).unwrap();
    let a = Arc::new(Remember(std::sync::Mutex::new(Vec::new())));
    let b = Arc::new(Remember(std::sync::Mutex::new(Vec::new())));
    logger.add_sink(a.clone());
    logger.add_sink(b.clone());

    logger
        .append("system.startup", "supervisor", None, serde_json::Value::Null)
        .unwrap();

    assert_eq!(a.0.lock().unwrap().as_slice(), ["system.startup"]);
    assert_eq!(b.0.lock().unwrap().as_slice(), ["system.startup"]);
}
