//! Planning pass assembly.
//!
//! Gathers snapshots from the stores, runs the planner outside every store
//! lock, then commits the new `Desired` layout and resource usage.

use std::sync::PoisonError;

use tracing::debug;

use fleetgrid_placement::{PlanOutcome, PlanRequest, app_plans, carried_needs};

use crate::control_plane::ControlPlane;
use crate::error::SchedulerResult;

impl ControlPlane {
    /// Snapshot of everything the planner needs.
    pub fn plan_request(&self) -> SchedulerResult<PlanRequest> {
        let configs = self.config.list_apps()?;
        let apps = app_plans(&configs, &self.needs, |app, version| {
            self.apps.is_crashed(app, version)
        });
        let current = self.layouts.current.snapshot();
        let desired = self.layouts.desired.snapshot();
        let carried = carried_needs(&current, &self.needs);

        Ok(PlanRequest {
            apps,
            current,
            desired,
            hosts: self.pool.snapshot(),
            carried_needs: carried,
        })
    }

    /// Run one planning pass and commit its result.
    ///
    /// The snapshot is taken before the planner lock; the lock only keeps
    /// two passes from interleaving their plan and commit.
    pub fn plan(&self) -> SchedulerResult<PlanOutcome> {
        let request = self.plan_request()?;
        let planner = self.planner.lock().unwrap_or_else(PoisonError::into_inner);
        let outcome = planner.plan(&request);

        self.layouts.desired.replace(outcome.desired.clone());
        self.pool.commit_usage(&outcome.usage);
        debug!(
            hosts = outcome.desired.len(),
            unplaced = outcome.unplaced.len(),
            "plan committed"
        );
        Ok(outcome)
    }
}
