//! fleetgrid-state — the shared stores of the FleetGrid control plane.
//!
//! Holds the data the reconciliation loop reads and writes: the `Current`
//! and `Desired` layouts, the resource pool, per-version needs, and the
//! persistent configuration store. Also defines the cloud engine contract
//! the control plane uses to replace hosts.
//!
//! # Architecture
//!
//! Every in-memory store guards its data with a single lock taken for the
//! duration of one method call and never across a call into another store.
//! The `ConfigStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and persists JSON-serialized `AppConfiguration` records in redb.

pub mod cloud;
pub mod config_store;
pub mod error;
pub mod layout;
pub mod needs;
pub mod resources;
pub mod tables;
pub mod types;

pub use cloud::{
    CloudEngine, CloudError, CloudResult, InstanceStatus, LocalEngine, ProviderEvent,
    ProviderEventKind,
};
pub use config_store::ConfigStore;
pub use error::{StateError, StateResult};
pub use layout::{Layout, LayoutStore};
pub use needs::{NeedsStore, WeeklyNeeds};
pub use resources::ResourcePool;
pub use types::*;
