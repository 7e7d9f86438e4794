//! Placement planner — computes the next `Desired` layout.
//!
//! Given the observed layout, the previous plan, the resource pool, and
//! one [`AppPlan`] per configured app, the planner:
//! 1. Rebuilds every app's slots from the previous plan, falling back to
//!    the observed layout where the plan says nothing
//! 2. Keeps slots already on the target version (up to the target count)
//! 3. Migrates stale-version slots to the target version in place
//! 4. Drops slots beyond the target count
//! 5. Recomputes resource usage from scratch for the resulting layout
//! 6. Greedily places the outstanding instances, heaviest apps first,
//!    one instance per round over a freshly ranked host list
//!
//! Instances that fit nowhere are reported in [`PlanOutcome::unplaced`]
//! and retried on the next planning cycle.

use std::collections::BTreeMap;

use tracing::{debug, info, warn};

use fleetgrid_state::{
    AppName, AppNeeds, AppsVersion, CloudLayout, CloudLayoutElement, DeploymentCount, HostId,
    InstanceResources, Version,
};

use crate::sort::{PlannerPolicy, sort_apps, sort_hosts};

/// What the planner should achieve for one app.
#[derive(Debug, Clone, PartialEq)]
pub struct AppPlan {
    pub name: AppName,
    /// Version every instance should run.
    pub version: Version,
    /// Instance count to reach across the fleet.
    pub target: DeploymentCount,
    /// Per-instance needs of `version`.
    pub needs: AppNeeds,
}

/// Input snapshot for one planning pass.
#[derive(Debug, Clone, Default)]
pub struct PlanRequest {
    pub apps: Vec<AppPlan>,
    /// Observed layout.
    pub current: CloudLayout,
    /// Previous plan.
    pub desired: CloudLayout,
    /// Resource pool (usage is ignored and recomputed).
    pub hosts: BTreeMap<HostId, InstanceResources>,
    /// Needs of app versions the planner does not manage, for usage accounting.
    pub carried_needs: BTreeMap<(AppName, Version), AppNeeds>,
}

/// Result of one planning pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlanOutcome {
    pub desired: CloudLayout,
    /// Resource pool with usage matching `desired`.
    pub usage: BTreeMap<HostId, InstanceResources>,
    /// Instances per app that could not be placed anywhere.
    pub unplaced: BTreeMap<AppName, DeploymentCount>,
    /// Combined needs of every unplaced instance.
    pub missing_needs: AppNeeds,
}

impl PlanOutcome {
    pub fn is_satisfied(&self) -> bool {
        self.unplaced.is_empty()
    }
}

/// Resource-aware placement planner.
#[derive(Debug, Clone, Default)]
pub struct Planner {
    policy: PlannerPolicy,
}

impl Planner {
    pub fn new(policy: PlannerPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &PlannerPolicy {
        &self.policy
    }

    /// Run one planning pass.
    pub fn plan(&self, req: &PlanRequest) -> PlanOutcome {
        let mut desired = base_layout(req);
        let mut outstanding: BTreeMap<&AppName, DeploymentCount> = BTreeMap::new();

        for app in &req.apps {
            let remaining = reconcile_slots(&mut desired, app);
            if remaining > 0 {
                outstanding.insert(&app.name, remaining);
            }
        }

        let mut usage = compute_usage(&desired, req);
        let mut unplaced = BTreeMap::new();
        let mut missing_needs = AppNeeds::default();

        let plans: BTreeMap<&AppName, &AppPlan> = req.apps.iter().map(|a| (&a.name, a)).collect();
        let order = sort_apps(
            outstanding
                .iter()
                .filter_map(|(name, count)| plans.get(name).map(|p| (*name, &p.needs, *count))),
        );

        for name in &order {
            let (Some(app), Some(&count)) = (plans.get(name), outstanding.get(name)) else {
                continue;
            };
            let placed = self.place(app, count, &mut desired, &mut usage);
            if placed < count {
                let missing = count - placed;
                warn!(
                    app = %app.name,
                    version = %app.version,
                    missing,
                    "could not place all instances, insufficient fleet capacity"
                );
                unplaced.insert(app.name.clone(), missing);
                missing_needs = missing_needs.plus(&app.needs.scaled(missing));
            }
        }

        info!(
            hosts = desired.len(),
            apps = req.apps.len(),
            unplaced = unplaced.len(),
            "planning pass finished"
        );

        PlanOutcome {
            desired,
            usage,
            unplaced,
            missing_needs,
        }
    }

    /// Place up to `count` new instances of `app`, one per round. Returns how many were placed.
    fn place(
        &self,
        app: &AppPlan,
        count: DeploymentCount,
        desired: &mut CloudLayout,
        usage: &mut BTreeMap<HostId, InstanceResources>,
    ) -> DeploymentCount {
        let mut placed = 0;
        while placed < count {
            let candidates = sort_hosts(usage, &self.policy);
            let Some(host_id) = candidates
                .into_iter()
                .find(|id| usage.get(id).is_some_and(|res| res.fits(&app.needs)))
            else {
                break;
            };

            if let Some(res) = usage.get_mut(&host_id) {
                res.consume(&app.needs, 1);
            }
            let element = desired
                .entry(host_id.clone())
                .or_insert_with(|| CloudLayoutElement::new(host_id.as_str()));
            let slot = element
                .apps
                .entry(app.name.clone())
                .or_insert_with(|| AppsVersion::new(app.version.clone(), 0));
            slot.deployment_count += 1;
            placed += 1;

            debug!(host = %host_id, app = %app.name, version = %app.version, "instance placed");
        }
        placed
    }
}

/// Starting layout: every known host, with the previous plan's apps where
/// it has an entry and the observed apps otherwise.
fn base_layout(req: &PlanRequest) -> CloudLayout {
    let mut layout = CloudLayout::new();
    let host_ids = req.hosts.keys().chain(req.current.keys());

    for host_id in host_ids {
        if layout.contains_key(host_id) {
            continue;
        }
        let mut element = req
            .current
            .get(host_id)
            .cloned()
            .unwrap_or_else(|| CloudLayoutElement::new(host_id.as_str()));
        if let Some(planned) = req.desired.get(host_id) {
            for (app, wanted) in &planned.apps {
                element.apps.insert(app.clone(), wanted.clone());
            }
        }
        element.apps.retain(|_, av| av.deployment_count > 0);
        layout.insert(host_id.clone(), element);
    }
    layout
}

/// Keep, migrate, or drop the existing slots of one app. Returns the outstanding count.
fn reconcile_slots(desired: &mut CloudLayout, app: &AppPlan) -> DeploymentCount {
    let mut on_target: Vec<(HostId, DeploymentCount)> = Vec::new();
    let mut stale: Vec<(HostId, DeploymentCount)> = Vec::new();
    for (host_id, element) in desired.iter_mut() {
        if let Some(slot) = element.apps.remove(&app.name) {
            if slot.version == app.version {
                on_target.push((host_id.clone(), slot.deployment_count));
            } else {
                stale.push((host_id.clone(), slot.deployment_count));
            }
        }
    }

    let mut remaining = app.target;
    for (host_id, count) in on_target.into_iter().chain(stale) {
        let keep = count.min(remaining);
        if keep == 0 {
            debug!(host = %host_id, app = %app.name, count, "slot dropped");
            continue;
        }
        remaining -= keep;
        if let Some(element) = desired.get_mut(&host_id) {
            element
                .apps
                .insert(app.name.clone(), AppsVersion::new(app.version.clone(), keep));
        }
    }
    remaining
}

/// Resource usage implied by a layout, over the pool's hosts only.
fn compute_usage(
    desired: &CloudLayout,
    req: &PlanRequest,
) -> BTreeMap<HostId, InstanceResources> {
    let managed: BTreeMap<&AppName, &AppPlan> = req.apps.iter().map(|a| (&a.name, a)).collect();

    req.hosts
        .iter()
        .map(|(host_id, res)| {
            let mut res = res.cleared();
            if let Some(element) = desired.get(host_id) {
                for (app, slot) in &element.apps {
                    let needs = match managed.get(app) {
                        Some(plan) if plan.version == slot.version => plan.needs,
                        _ => req
                            .carried_needs
                            .get(&(app.clone(), slot.version.clone()))
                            .copied()
                            .unwrap_or_default(),
                    };
                    res.consume(&needs, slot.deployment_count);
                }
            }
            (host_id.clone(), res)
        })
        .collect()
}
