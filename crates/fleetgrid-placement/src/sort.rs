//! Host and app ranking for placement decisions.
//!
//! Hosts are ranked by headroom (free CPU + memory + network). With
//! `try_to_remove_hosts` the tightest hosts come first, packing load so
//! lightly used hosts drain over time; otherwise the emptiest hosts come
//! first, spreading load. Hosts at or below the watermark on any
//! dimension are not candidates at all.
//!
//! Apps are ranked by aggregate outstanding need so the hardest ones to
//! fit are placed while the most room is left.
//!
//! Ties are broken by name so planning output is deterministic.

use std::collections::BTreeMap;

use fleetgrid_state::{AppName, AppNeeds, HostId, InstanceResources};

/// Placement policy knobs.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct PlannerPolicy {
    /// Fill the tightest hosts first instead of balancing load.
    pub try_to_remove_hosts: bool,
    /// Minimum fraction of each dimension a host must keep free to take new instances.
    pub watermark: f64,
}

impl Default for PlannerPolicy {
    fn default() -> Self {
        Self {
            try_to_remove_hosts: true,
            watermark: 0.2,
        }
    }
}

/// Whether a host keeps more than `watermark` of every dimension free.
pub fn is_eligible(res: &InstanceResources, watermark: f64) -> bool {
    let above = |free: u64, total: u64| free as f64 > total as f64 * watermark;
    above(res.free_cpu(), res.total_cpu)
        && above(res.free_memory(), res.total_memory)
        && above(res.free_network(), res.total_network)
}

/// Candidate hosts for new placements, best first.
pub fn sort_hosts(
    hosts: &BTreeMap<HostId, InstanceResources>,
    policy: &PlannerPolicy,
) -> Vec<HostId> {
    let mut ranked: Vec<(&HostId, u64)> = hosts
        .iter()
        .filter(|(_, res)| is_eligible(res, policy.watermark))
        .map(|(id, res)| (id, res.headroom()))
        .collect();

    ranked.sort_by(|a, b| {
        let by_headroom = if policy.try_to_remove_hosts {
            a.1.cmp(&b.1)
        } else {
            b.1.cmp(&a.1)
        };
        by_headroom.then_with(|| a.0.cmp(b.0))
    });

    ranked.into_iter().map(|(id, _)| id.clone()).collect()
}

/// App names ordered by descending aggregate need (`per-instance total × outstanding`).
pub fn sort_apps<'a>(apps: impl IntoIterator<Item = (&'a AppName, &'a AppNeeds, u32)>) -> Vec<AppName> {
    let mut ranked: Vec<(&AppName, u64)> = apps
        .into_iter()
        .map(|(name, needs, outstanding)| (name, needs.scaled(outstanding).total()))
        .collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
    ranked.into_iter().map(|(name, _)| name.clone()).collect()
}
