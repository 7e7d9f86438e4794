//! Layout store — the `Current` and `Desired` views of the fleet.
//!
//! Each snapshot is an independent store with its own lock. Every method
//! takes the lock for exactly one operation, so callers can never hold
//! two snapshots (or a snapshot and another store) locked at once.
//!
//! # Components
//!
//! - **`Layout`** — one lockable snapshot (host → apps)
//! - **`LayoutStore`** — the `Current` (observed) and `Desired` (planned) pair

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::types::*;

/// A single lock-guarded layout snapshot.
#[derive(Debug, Default)]
pub struct Layout {
    name: &'static str,
    hosts: RwLock<CloudLayout>,
}

impl Layout {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            hosts: RwLock::new(CloudLayout::new()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, CloudLayout> {
        self.hosts.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, CloudLayout> {
        self.hosts.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a host with no apps. Existing hosts are left untouched.
    pub fn add_empty_host(&self, host_id: &str) {
        let mut hosts = self.write();
        if !hosts.contains_key(host_id) {
            hosts.insert(host_id.to_string(), CloudLayoutElement::new(host_id));
            debug!(layout = self.name, host = %host_id, "host added");
        }
    }

    /// Merge an observed element into this snapshot.
    ///
    /// A missing host is inserted as is. For a present host only apps it
    /// does not mention yet are added. Returns how many apps were adopted.
    pub fn adopt_host(&self, element: CloudLayoutElement) -> usize {
        let mut hosts = self.write();
        let target = hosts
            .entry(element.host_id.clone())
            .or_insert_with(|| CloudLayoutElement::new(element.host_id.as_str()));
        let mut adopted = 0;
        for (app, apps_version) in element.apps {
            if !target.apps.contains_key(&app) {
                target.apps.insert(app, apps_version);
                adopted += 1;
            }
        }
        if adopted > 0 {
            debug!(layout = self.name, host = %element.host_id, adopted, "observed apps adopted");
        }
        adopted
    }

    /// Set the instance count of one app on one host, replacing any other version.
    pub fn set_app(&self, host_id: &str, app: &str, apps_version: AppsVersion) -> StateResult<()> {
        let mut hosts = self.write();
        let element = hosts
            .get_mut(host_id)
            .ok_or_else(|| StateError::HostNotFound(host_id.to_string()))?;
        element.apps.insert(app.to_string(), apps_version);
        Ok(())
    }

    /// Remove an app from a host. Returns the entry if there was one.
    pub fn remove_app(&self, host_id: &str, app: &str) -> StateResult<Option<AppsVersion>> {
        let mut hosts = self.write();
        let element = hosts
            .get_mut(host_id)
            .ok_or_else(|| StateError::HostNotFound(host_id.to_string()))?;
        Ok(element.apps.remove(app))
    }

    /// Remove a host entirely. Returns true if it existed.
    pub fn remove_host(&self, host_id: &str) -> bool {
        let existed = self.write().remove(host_id).is_some();
        if existed {
            debug!(layout = self.name, host = %host_id, "host removed");
        }
        existed
    }

    pub fn get_host(&self, host_id: &str) -> StateResult<CloudLayoutElement> {
        self.read()
            .get(host_id)
            .cloned()
            .ok_or_else(|| StateError::HostNotFound(host_id.to_string()))
    }

    pub fn contains_host(&self, host_id: &str) -> bool {
        self.read().contains_key(host_id)
    }

    pub fn host_ids(&self) -> Vec<HostId> {
        self.read().keys().cloned().collect()
    }

    /// Copy of the whole snapshot.
    pub fn snapshot(&self) -> CloudLayout {
        self.read().clone()
    }

    /// Swap in a whole new snapshot.
    pub fn replace(&self, layout: CloudLayout) {
        *self.write() = layout;
    }

    /// Total instances of `app` at `version` across all hosts.
    pub fn deployment_count(&self, app: &str, version: &Version) -> DeploymentCount {
        self.read()
            .values()
            .filter_map(|element| element.apps.get(app))
            .filter(|av| av.version == *version)
            .map(|av| av.deployment_count)
            .sum()
    }

    /// Replace a host's element from its checkin report.
    ///
    /// Only live (non-dead) instances count. Per app the version of the
    /// newest running instance wins, falling back to the newest live one,
    /// so the snapshot keeps a single version per app per host.
    pub fn update_host(&self, info: &HostInfo) {
        let mut grouped: BTreeMap<&str, Vec<&AppInfo>> = BTreeMap::new();
        for app in info.apps.iter().filter(|a| a.status != AppStatus::Dead) {
            grouped.entry(app.name.as_str()).or_default().push(app);
        }

        let mut apps = BTreeMap::new();
        for (name, instances) in grouped {
            let running = instances
                .iter()
                .filter(|a| a.status == AppStatus::Running)
                .map(|a| &a.version)
                .max();
            let Some(version) = running.or_else(|| instances.iter().map(|a| &a.version).max())
            else {
                continue;
            };
            let count = instances.iter().filter(|a| a.version == *version).count();
            apps.insert(
                name.to_string(),
                AppsVersion::new(version.clone(), count as DeploymentCount),
            );
        }

        let mut hosts = self.write();
        let element = hosts
            .entry(info.host_id.clone())
            .or_insert_with(|| CloudLayoutElement::new(info.host_id.as_str()));
        element.ip_address = info.ip_addr.clone();
        element.habitat_version = info.habitat_version.clone();
        element.apps = apps;
        debug!(layout = self.name, host = %info.host_id, apps = element.apps.len(), "host layout updated");
    }
}

/// The observed and planned layouts.
#[derive(Debug)]
pub struct LayoutStore {
    pub current: Layout,
    pub desired: Layout,
}

impl LayoutStore {
    pub fn new() -> Self {
        Self {
            current: Layout::new("current"),
            desired: Layout::new("desired"),
        }
    }

    /// Track a host in both snapshots.
    pub fn add_empty_host(&self, host_id: &str) {
        self.current.add_empty_host(host_id);
        self.desired.add_empty_host(host_id);
    }

    /// Forget a host in both snapshots.
    pub fn remove_host(&self, host_id: &str) {
        self.current.remove_host(host_id);
        self.desired.remove_host(host_id);
    }
}

impl Default for LayoutStore {
    fn default() -> Self {
        Self::new()
    }
}
