//! FleetGrid placement planner — resource-aware bin-packing.
//!
//! This crate rewrites the `Desired` layout so every configured app
//! reaches its target instance count, using per-version needs to order
//! the work and the resource pool to pick hosts. It is pure: the caller
//! gathers snapshots, runs the planner, and commits the outcome.
//!
//! # Components
//!
//! - **`sort`** — Host ranking (headroom, watermark) and app ranking (aggregate need)
//! - **`planner`** — Slot keeping, in-place version migration, greedy placement
//! - **`convert`** — Build planner input from configurations, needs, and ratings

pub mod convert;
pub mod planner;
pub mod sort;

pub use convert::{app_plans, carried_needs};
pub use planner::{AppPlan, PlanOutcome, PlanRequest, Planner};
pub use sort::{PlannerPolicy, is_eligible, sort_apps, sort_hosts};
