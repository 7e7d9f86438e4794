//! FleetGrid rollouts — layout diffing and the per-host update queue.
//!
//! This crate turns the gap between the planned and observed fleet into
//! per-host work items and serializes their delivery: each host is
//! exposed to at most one in-flight update at a time.
//!
//! # Components
//!
//! - **`diff`** — Pure `Desired × Current` delta computation
//! - **`queue`** — Per-host update queue state machine (queued, applying, success, fail)

pub mod diff;
pub mod error;
pub mod queue;

pub use diff::{LayoutDiff, diff};
pub use error::{QueueError, QueueResult};
pub use queue::{AppsUpdateState, UpdateQueue, UpdateState};
