//! Scheduler — the periodic driver of the control plane.
//!
//! Two loops run side by side:
//! - **planning**: diff `Desired` against `Current`, queue the changes,
//!   plan the next `Desired`, then size the fleet to it
//! - **supervision**: a faster tick that declares silent or dead hosts
//!   dead, triggers their replacement, and purges them from every store
//!
//! Both stop when the shutdown channel flips. Each cycle runs on the
//! blocking pool, since it does store I/O and cloud engine calls.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use fleetgrid_placement::PlanOutcome;
use fleetgrid_rollout::{LayoutDiff, diff};
use fleetgrid_state::{HostId, ProviderEvent, epoch_secs};

use crate::control_plane::ControlPlane;
use crate::error::SchedulerResult;

/// Drives reconciliation and host supervision for one control plane.
#[derive(Clone)]
pub struct Scheduler {
    plane: Arc<ControlPlane>,
}

impl Scheduler {
    pub fn new(plane: Arc<ControlPlane>) -> Self {
        Self { plane }
    }

    pub fn plane(&self) -> &Arc<ControlPlane> {
        &self.plane
    }

    /// One reconciliation cycle: Diff → queue → plan → scale.
    ///
    /// Queued updates the diff no longer asks for are withdrawn before
    /// they are served. Unplaced instances make the fleet grow by one host;
    /// hosts left idle are terminated when the policy allows it.
    ///
    /// Running it twice without any state change in between queues nothing
    /// new and produces the same plan.
    pub fn run_once(&self) -> SchedulerResult<PlanOutcome> {
        self.run_once_at(epoch_secs())
    }

    /// Run a cycle at an explicit time.
    pub fn run_once_at(&self, now: u64) -> SchedulerResult<PlanOutcome> {
        let desired = self.plane.layouts.desired.snapshot();
        let current = self.plane.layouts.current.snapshot();
        let mut changes = diff(&desired, &current);
        let skipped = self.drop_crashed(&mut changes);

        if !changes.is_empty() {
            let count: usize = changes.values().map(|apps| apps.len()).sum();
            debug!(hosts = changes.len(), changes = count, skipped, "queueing layout changes");
            self.plane.queue.apply(&changes);
        }
        self.plane.queue.withdraw_stale(&changes);

        let outcome = self.plane.plan()?;
        self.plane.scale_out(&outcome, now);
        let terminated = self.plane.remove_empty_hosts(&outcome);
        if !terminated.is_empty() {
            info!(count = terminated.len(), "idle hosts terminated");
        }
        Ok(outcome)
    }

    /// Run a cycle now, outside the timer.
    pub fn trigger_run(&self) -> SchedulerResult<PlanOutcome> {
        info!("manual scheduler run triggered");
        self.run_once()
    }

    /// Changes that would roll out a crashed version are never queued.
    /// Removals of crashed versions still go through.
    fn drop_crashed(&self, changes: &mut LayoutDiff) -> usize {
        let mut skipped = 0;
        changes.retain(|host_id, apps| {
            apps.retain(|app, wanted| {
                let crashed = wanted.deployment_count > 0
                    && self.plane.apps.is_crashed(app, &wanted.version);
                if crashed {
                    debug!(host = %host_id, %app, version = %wanted.version, "not queueing crashed version");
                    skipped += 1;
                }
                !crashed
            });
            !apps.is_empty()
        });
        skipped
    }

    /// Supervise hosts: checkin timeouts and cloud-provider health.
    ///
    /// Returns the hosts declared dead; they are gone from every store.
    pub fn check_hosts(&self, now: u64) -> Vec<HostId> {
        let mut dead = self.plane.hosts.check_checkin_timeout(now);
        for host_id in self.plane.hosts.check_cloud_provider() {
            if !dead.contains(&host_id) {
                dead.push(host_id);
            }
        }
        for host_id in &dead {
            self.plane.forget_host(host_id);
        }
        if !dead.is_empty() {
            warn!(count = dead.len(), "dead hosts removed");
        }
        let retried = self.plane.hosts.crash_handler().retry_failed();
        if !retried.is_empty() {
            info!(count = retried.len(), "replacement spawns retried");
        }
        dead
    }

    /// Apply an event pushed by the cloud provider.
    pub fn handle_provider_event(&self, event: &ProviderEvent) -> Option<HostId> {
        let dead = self.plane.hosts.handle_provider_event(event)?;
        self.plane.forget_host(&dead);
        Some(dead)
    }

    /// Run reconciliation cycles until shutdown.
    pub async fn run_planning(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "planning loop started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    let scheduler = self.clone();
                    match tokio::task::spawn_blocking(move || scheduler.run_once()).await {
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => error!(error = %e, "scheduler run failed"),
                        Err(e) => error!(error = %e, "scheduler run panicked"),
                    }
                }
                _ = shutdown.changed() => {
                    info!("planning loop shutting down");
                    break;
                }
            }
        }
    }

    /// Run host supervision until shutdown.
    pub async fn run_supervision(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "supervision loop started");
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let scheduler = self.clone();
                    match tokio::task::spawn_blocking(move || scheduler.check_hosts(epoch_secs())).await {
                        Ok(dead) if !dead.is_empty() => {
                            info!(count = dead.len(), "replaced dead hosts");
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "host supervision panicked"),
                    }
                }
                _ = shutdown.changed() => {
                    info!("supervision loop shutting down");
                    break;
                }
            }
        }
    }
}
