//! Control plane — owns every store and the cloud engine.
//!
//! One `ControlPlane` is constructed at startup and shared (`Arc`) between
//! the host-facing request path and the periodic loops. Each store guards
//! itself; the control plane only sequences calls between them and never
//! holds a store lock while calling another store or the cloud engine.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Weekday;
use tracing::{info, warn};

use fleetgrid_health::{AppsStatusTracker, HostTracker};
use fleetgrid_placement::{Planner, PlannerPolicy};
use fleetgrid_rollout::UpdateQueue;
use fleetgrid_state::{
    AppConfiguration, AppNeeds, CloudEngine, ConfigStore, HostId, LayoutStore, NeedsStore,
    ResourcePool, Version,
};

use crate::error::SchedulerResult;

/// The reconciliation engine's shared state.
pub struct ControlPlane {
    pub(crate) config: ConfigStore,
    pub(crate) needs: NeedsStore,
    pub(crate) layouts: LayoutStore,
    pub(crate) pool: ResourcePool,
    pub(crate) queue: UpdateQueue,
    pub(crate) apps: AppsStatusTracker,
    pub(crate) hosts: HostTracker,
    pub(crate) engine: Arc<dyn CloudEngine>,
    /// Serializes planning passes.
    pub(crate) planner: Mutex<Planner>,
    /// Hosts spawned for capacity that have not checked in yet, with their spawn time.
    pub(crate) scale_outs: Mutex<BTreeMap<HostId, u64>>,
    /// How long a host spawned for capacity may take to check in.
    pub(crate) spawn_timeout: Duration,
}

/// Default time a host spawned for capacity gets to check in.
pub const DEFAULT_SPAWN_TIMEOUT: Duration = Duration::from_secs(600);

impl ControlPlane {
    /// Build the control plane over an opened store.
    ///
    /// Needs are reseeded for every stored app version, so a reopened store
    /// plans with the same needs it was configured with.
    pub fn new(config: ConfigStore, engine: Arc<dyn CloudEngine>) -> Self {
        let plane = Self {
            config,
            needs: NeedsStore::new(),
            layouts: LayoutStore::new(),
            pool: ResourcePool::new(),
            queue: UpdateQueue::new(),
            apps: AppsStatusTracker::new(),
            hosts: HostTracker::new(Arc::clone(&engine)),
            engine,
            planner: Mutex::new(Planner::default()),
            scale_outs: Mutex::new(BTreeMap::new()),
            spawn_timeout: DEFAULT_SPAWN_TIMEOUT,
        };
        plane.restore_needs();
        plane
    }

    fn restore_needs(&self) {
        let configs = match self.config.list_apps() {
            Ok(configs) => configs,
            Err(e) => {
                warn!(error = %e, "failed to list stored apps, needs not restored");
                return;
            }
        };
        let mut restored = 0;
        for conf in &configs {
            if !self.needs.contains(&conf.name, &conf.version) {
                self.needs.update_needs(&conf.name, &conf.version, conf.needs);
                restored += 1;
            }
        }
        if restored > 0 {
            info!(versions = restored, "app needs restored from store");
        }
    }

    /// Set the placement policy.
    pub fn with_policy(mut self, policy: PlannerPolicy) -> Self {
        self.planner = Mutex::new(Planner::new(policy));
        self
    }

    /// Set how long a host may stay silent before it is declared dead.
    pub fn with_checkin_timeout(mut self, timeout: Duration) -> Self {
        self.hosts = HostTracker::new(Arc::clone(&self.engine)).with_checkin_timeout(timeout);
        self
    }

    /// Set how long a host spawned for capacity may take to check in.
    pub fn with_spawn_timeout(mut self, timeout: Duration) -> Self {
        self.spawn_timeout = timeout;
        self
    }

    /// Set how many crash records are kept per app version.
    pub fn with_max_crash_details(mut self, max: usize) -> Self {
        self.apps = AppsStatusTracker::new().with_max_crash_details(max);
        self
    }

    pub fn config(&self) -> &ConfigStore {
        &self.config
    }

    pub fn needs(&self) -> &NeedsStore {
        &self.needs
    }

    pub fn layouts(&self) -> &LayoutStore {
        &self.layouts
    }

    pub fn pool(&self) -> &ResourcePool {
        &self.pool
    }

    pub fn queue(&self) -> &UpdateQueue {
        &self.queue
    }

    pub fn apps(&self) -> &AppsStatusTracker {
        &self.apps
    }

    pub fn hosts(&self) -> &HostTracker {
        &self.hosts
    }

    pub fn engine(&self) -> &Arc<dyn CloudEngine> {
        &self.engine
    }

    pub fn policy(&self) -> PlannerPolicy {
        *self
            .planner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .policy()
    }

    /// Store a new app version and seed its needs.
    ///
    /// Returns false if the identical record was already stored.
    pub fn configure_app(&self, conf: &AppConfiguration) -> SchedulerResult<bool> {
        let created = self.config.configure_app(conf)?;
        if !self.needs.contains(&conf.name, &conf.version) {
            self.needs.update_needs(&conf.name, &conf.version, conf.needs);
        }
        if created {
            info!(
                app = %conf.name,
                version = %conf.version,
                target = conf.effective_target(),
                "app configured"
            );
        }
        Ok(created)
    }

    /// Raise or lower a configured version's needs for one 15 minute slot of the week.
    pub fn forecast_needs(
        &self,
        app: &str,
        version: &Version,
        day: Weekday,
        minutes: u32,
        needs: AppNeeds,
    ) -> SchedulerResult<()> {
        self.needs.forecast(app, version, day, minutes, needs)?;
        info!(
            %app,
            %version,
            %day,
            minutes,
            cpu = needs.cpu,
            memory = needs.memory,
            network = needs.network,
            "needs forecast applied"
        );
        Ok(())
    }

    /// Make a host known to the planner before its first checkin.
    ///
    /// Capacity comes from the cloud engine. The host is not supervised for
    /// checkin timeouts until it checks in.
    pub fn register_host(&self, host_id: &str) -> SchedulerResult<()> {
        let resources = self.engine.get_resources(host_id)?;
        let ip = self.engine.get_ip(host_id).unwrap_or_default();
        self.pool.register(host_id, resources);
        self.queue.add_host(host_id);
        info!(
            host = %host_id,
            %ip,
            cpu = resources.total_cpu,
            memory = resources.total_memory,
            network = resources.total_network,
            "host registered"
        );
        Ok(())
    }

    /// Drop a dead or terminated host from every store.
    pub(crate) fn forget_host(&self, host_id: &str) {
        self.hosts.remove(host_id);
        self.pool.remove(host_id);
        self.layouts.remove_host(host_id);
        if !self.queue.remove_host(host_id) {
            warn!(host = %host_id, "removed host had no update queue");
        }
        info!(host = %host_id, "host removed from fleet");
    }
}
