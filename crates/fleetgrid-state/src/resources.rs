//! Resource pool — capacity and planned usage of every known host.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use tracing::{debug, info};

use crate::error::{StateError, StateResult};
use crate::types::{HostId, InstanceResources};

/// Per-host totals and planner-assigned usage.
#[derive(Debug, Default)]
pub struct ResourcePool {
    hosts: RwLock<BTreeMap<HostId, InstanceResources>>,
}

impl ResourcePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a host, or refresh the totals of a known one (usage is kept).
    pub fn register(&self, host_id: &str, totals: InstanceResources) {
        let mut hosts = self.hosts.write().unwrap_or_else(PoisonError::into_inner);
        match hosts.get_mut(host_id) {
            Some(existing) => {
                existing.total_cpu = totals.total_cpu;
                existing.total_memory = totals.total_memory;
                existing.total_network = totals.total_network;
            }
            None => {
                hosts.insert(host_id.to_string(), totals.cleared());
                info!(
                    host = %host_id,
                    cpu = totals.total_cpu,
                    memory = totals.total_memory,
                    network = totals.total_network,
                    "host added to resource pool"
                );
            }
        }
    }

    pub fn remove(&self, host_id: &str) -> bool {
        let existed = self
            .hosts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(host_id)
            .is_some();
        if existed {
            debug!(host = %host_id, "host removed from resource pool");
        }
        existed
    }

    pub fn contains(&self, host_id: &str) -> bool {
        self.hosts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(host_id)
    }

    pub fn get(&self, host_id: &str) -> StateResult<InstanceResources> {
        self.hosts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(host_id)
            .copied()
            .ok_or_else(|| StateError::HostNotFound(host_id.to_string()))
    }

    /// Copy of every host's resources, ordered by host id.
    pub fn snapshot(&self) -> BTreeMap<HostId, InstanceResources> {
        self.hosts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the used counters of every host with the given planning result.
    ///
    /// Hosts missing from `usage` are reset to zero usage. Hosts in `usage`
    /// that left the pool in the meantime are ignored.
    pub fn commit_usage(&self, usage: &BTreeMap<HostId, InstanceResources>) {
        let mut hosts = self.hosts.write().unwrap_or_else(PoisonError::into_inner);
        for (host_id, res) in hosts.iter_mut() {
            let planned = usage.get(host_id);
            res.used_cpu = planned.map_or(0, |p| p.used_cpu);
            res.used_memory = planned.map_or(0, |p| p.used_memory);
            res.used_network = planned.map_or(0, |p| p.used_network);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AppNeeds;

    #[test]
    fn register_keeps_usage_on_refresh() {
        let pool = ResourcePool::new();
        pool.register("h1", InstanceResources::with_totals(100, 100, 100));

        let mut usage = BTreeMap::new();
        let mut used = InstanceResources::with_totals(100, 100, 100);
        used.consume(&AppNeeds::new(10, 20, 30), 1);
        usage.insert("h1".to_string(), used);
        pool.commit_usage(&usage);

        pool.register("h1", InstanceResources::with_totals(200, 200, 200));
        let res = pool.get("h1").unwrap();
        assert_eq!(res.total_cpu, 200);
        assert_eq!(res.used_memory, 20);
    }

    #[test]
    fn commit_resets_unplanned_hosts() {
        let pool = ResourcePool::new();
        let mut loaded = InstanceResources::with_totals(100, 100, 100);
        loaded.used_cpu = 50;
        pool.register("h1", loaded);
        pool.register("h2", InstanceResources::with_totals(100, 100, 100));
        assert_eq!(pool.get("h1").unwrap().used_cpu, 0);

        let mut usage = BTreeMap::new();
        let mut h2 = InstanceResources::with_totals(100, 100, 100);
        h2.used_cpu = 40;
        usage.insert("h2".to_string(), h2);
        usage.insert("gone".to_string(), h2);
        pool.commit_usage(&usage);

        assert_eq!(pool.get("h2").unwrap().used_cpu, 40);
        assert!(!pool.contains("gone"));
    }

    #[test]
    fn unknown_host_is_not_found() {
        let pool = ResourcePool::new();
        assert!(matches!(pool.get("h1"), Err(StateError::HostNotFound(_))));
        assert!(!pool.remove("h1"));
    }
}
