//! fleetgrid-health — rollout ratings and host supervision for FleetGrid.
//!
//! Tracks how each app version behaves once deployed and whether each
//! host is still alive, and replaces hosts that are not.
//!
//! # Architecture
//!
//! ```text
//! AppsStatusTracker
//!   └── (app, version) → AppTrack { rating, running count, crash history }
//!
//! HostTracker
//!   ├── host → last checkin
//!   ├── checkin timeout scan / cloud provider scan / provider events
//!   └── HostCrashHandler
//!       └── old host → HostSpawn { new host, initiated, status }
//! ```
//!
//! # Ratings
//!
//! A version is `Stable` until its first crash or rollback, then `Crashed`
//! for good. Only a newer version can take its place in the plan.
//!
//! # Host replacement
//!
//! A host that misses its checkin deadline, is reported dead by the
//! provider, or is killed by a provider event gets a replacement spawned
//! through the cloud engine. The pending record is cleared when the
//! replacement checks in for the first time.

pub mod apps;
pub mod hosts;

pub use apps::{AppCrash, AppEvent, AppTrack, AppsStatusTracker, Rating};
pub use hosts::{HostCrashHandler, HostSpawn, HostSpawnStatus, HostTracker, HostTrackingInfo};
