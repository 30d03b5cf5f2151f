//! Filesystem-backed task storage.
//!
//! Tasks live as front-mattered markdown files under a canonical vault
//! layout; a task's status is the directory it resides in. This crate owns
//! every on-disk mutation; all other components go through [`TaskStore`].

pub mod error;
pub mod events;
pub mod frontmatter;
pub mod fsutil;
pub mod layout;
pub mod lint;
pub mod model;
pub mod project;
pub mod store;

pub use error::{Result, StoreError};
pub use events::{Event, EventLogger, EventSink};
pub use layout::ProjectPaths;
pub use model::{
    GateHistoryEntry, GateOutcome, GateState, Lease, Priority, ReviewContext, Routing, Task,
    TaskPatch, TaskStatus, SCHEMA_VERSION,
};
pub use store::{ListFilter, NewTask, TaskStore};
