//! Fleet sizing after a planning pass.
//!
//! Instances the planner could not place make the fleet grow by one host,
//! sized by the cloud engine for the combined missing needs. With
//! `try_to_remove_hosts`, hosts left with nothing to run are terminated
//! once the fleet has settled.

use std::sync::PoisonError;

use tracing::{debug, info, warn};

use fleetgrid_placement::PlanOutcome;
use fleetgrid_state::{AppNeeds, CloudLayoutElement, HostId, InstanceResources};

use crate::control_plane::ControlPlane;

/// Capacity a host needs to take `needs` while keeping `watermark` free.
fn capacity_for(needs: &AppNeeds, watermark: f64) -> InstanceResources {
    let usable = (1.0 - watermark).max(f64::EPSILON);
    let scale = |value: u64| (value as f64 / usable).ceil() as u64;
    InstanceResources::with_totals(scale(needs.cpu), scale(needs.memory), scale(needs.network))
}

fn is_idle(element: &CloudLayoutElement) -> bool {
    element.apps.values().all(|a| a.deployment_count == 0)
}

impl ControlPlane {
    /// Spawn a host for the instances `outcome` could not place.
    ///
    /// Nothing is spawned while an earlier scale-out host is still on its
    /// way. Returns the new host, which is registered right away so the
    /// next pass plans onto it.
    pub fn scale_out(&self, outcome: &PlanOutcome, now: u64) -> Option<HostId> {
        let in_flight = self.expire_scale_outs(now);
        if outcome.unplaced.is_empty() {
            return None;
        }
        if in_flight > 0 {
            debug!(in_flight, "scale-out already in flight");
            return None;
        }

        let wanted = capacity_for(&outcome.missing_needs, self.policy().watermark);
        let instance_type = match self.engine.suitable_instance_types(&wanted).into_iter().next() {
            Some(instance_type) => instance_type,
            None => {
                let largest = self
                    .engine
                    .suitable_instance_types(&InstanceResources::default())
                    .pop()?;
                warn!(
                    cpu = wanted.total_cpu,
                    memory = wanted.total_memory,
                    network = wanted.total_network,
                    instance_type = %largest,
                    "no instance type fits every unplaced instance, using the largest"
                );
                largest
            }
        };

        let host_id = match self.engine.spawn_instance(&instance_type) {
            Ok(host_id) => host_id,
            Err(e) => {
                warn!(%instance_type, error = %e, "scale-out spawn failed");
                return None;
            }
        };
        if let Err(e) = self.register_host(&host_id) {
            warn!(host = %host_id, error = %e, "spawned host could not be registered");
        }
        self.scale_outs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(host_id.clone(), now);
        info!(
            host = %host_id,
            %instance_type,
            unplaced = outcome.unplaced.values().sum::<u32>(),
            "fleet scaled out"
        );
        Some(host_id)
    }

    /// Settle scale-out hosts. Returns how many are still expected to check in.
    ///
    /// Hosts that checked in or left the fleet are done. Hosts silent past
    /// the spawn timeout are terminated and dropped.
    fn expire_scale_outs(&self, now: u64) -> usize {
        let pending: Vec<(HostId, u64)> = self
            .scale_outs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(host, at)| (host.clone(), *at))
            .collect();

        let mut settled = Vec::new();
        let mut expired = Vec::new();
        for (host_id, spawned_at) in pending {
            if self.layouts.current.contains_host(&host_id) || !self.pool.contains(&host_id) {
                settled.push(host_id);
            } else if now.saturating_sub(spawned_at) >= self.spawn_timeout.as_secs() {
                expired.push(host_id);
            }
        }

        for host_id in &expired {
            warn!(host = %host_id, "scale-out host never checked in");
            if let Err(e) = self.engine.terminate_instance(host_id) {
                warn!(host = %host_id, error = %e, "failed to terminate scale-out host");
            }
            self.forget_host(host_id);
        }

        let mut scale_outs = self.scale_outs.lock().unwrap_or_else(PoisonError::into_inner);
        for host_id in settled.iter().chain(&expired) {
            scale_outs.remove(host_id);
        }
        scale_outs.len()
    }

    /// Terminate hosts that run nothing and are planned to run nothing.
    ///
    /// Only done with `try_to_remove_hosts`, when every instance is placed
    /// and no update is pending anywhere. Hosts that never checked in are
    /// left alone. Returns the terminated hosts.
    pub fn remove_empty_hosts(&self, outcome: &PlanOutcome) -> Vec<HostId> {
        if !self.policy().try_to_remove_hosts || !outcome.is_satisfied() {
            return Vec::new();
        }
        let pending = self.queue.pending();
        if pending > 0 {
            debug!(pending, "updates pending, keeping empty hosts");
            return Vec::new();
        }

        let current = self.layouts.current.snapshot();
        let idle: Vec<HostId> = outcome
            .desired
            .iter()
            .filter(|(host_id, element)| {
                is_idle(element) && current.get(*host_id).is_some_and(is_idle)
            })
            .map(|(host_id, _)| host_id.clone())
            .collect();

        let mut terminated = Vec::new();
        for host_id in idle {
            match self.engine.terminate_instance(&host_id) {
                Ok(_) => {
                    self.forget_host(&host_id);
                    info!(host = %host_id, "empty host terminated");
                    terminated.push(host_id);
                }
                Err(e) => warn!(host = %host_id, error = %e, "failed to terminate empty host"),
            }
        }
        terminated
    }
}
