//! fleetgrid-scheduler — the reconciliation engine of FleetGrid.
//!
//! Wires the stores, the planner, the update queue, and the trackers into
//! one control plane, and drives it:
//!
//! - The **responder** answers host checkins: it records the report,
//!   settles the host's in-flight update, and serves the next one
//! - The **planning pass** turns configuration, needs, and capacity into
//!   the next `Desired` layout
//! - **Scaling** grows the fleet when instances cannot be placed and
//!   terminates hosts left with nothing to run
//! - The **scheduler** runs Diff → queue → plan → scale on a timer, and a
//!   faster supervision tick that replaces dead hosts
//!
//! # Architecture
//!
//! ```text
//! Scheduler
//!   └── Arc<ControlPlane>
//!       ├── ConfigStore (redb) + NeedsStore
//!       ├── LayoutStore { current, desired }
//!       ├── ResourcePool
//!       ├── UpdateQueue
//!       ├── AppsStatusTracker
//!       ├── HostTracker ── HostCrashHandler
//!       └── CloudEngine
//! ```

pub mod control_plane;
pub mod error;
pub mod planning;
pub mod responder;
pub mod scaling;
pub mod scheduler;

pub use control_plane::ControlPlane;
pub use error::{SchedulerError, SchedulerResult};
pub use scheduler::Scheduler;
