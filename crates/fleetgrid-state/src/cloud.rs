//! Cloud engine contract and an in-memory engine.
//!
//! The control plane never talks to a provider directly. It spawns
//! replacement instances, polls instance health, and looks up instance
//! capacity through [`CloudEngine`]. [`LocalEngine`] implements the
//! contract over a static host list, for single-machine deployments and
//! tests.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::types::{HostId, InstanceResources};

/// Errors reported by a cloud engine.
#[derive(Debug, Error)]
pub enum CloudError {
    #[error("unknown instance: {0}")]
    UnknownInstance(HostId),

    #[error("failed to spawn instance like {host}: {reason}")]
    Spawn { host: HostId, reason: String },

    #[error("failed to spawn {instance_type} instance: {reason}")]
    Provision { instance_type: String, reason: String },

    #[error("failed to terminate instance {host}: {reason}")]
    Terminate { host: HostId, reason: String },
}

/// Result type alias for cloud engine calls.
pub type CloudResult<T> = Result<T, CloudError>;

/// Provider view of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    Healthy,
    Spawning,
    SpawnTriggered,
    Dead,
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Healthy => "healthy",
            Self::Spawning => "spawning",
            Self::SpawnTriggered => "spawn_triggered",
            Self::Dead => "dead",
        };
        f.write_str(s)
    }
}

/// Kind of event a provider pushes about an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProviderEventKind {
    Killed,
    Ready,
}

/// An event pushed by the provider about one instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderEvent {
    pub host_id: HostId,
    pub kind: ProviderEventKind,
}

/// Operations the control plane needs from a cloud provider.
///
/// Calls may be slow; callers must not hold any store lock across them.
pub trait CloudEngine: Send + Sync {
    /// Start a new instance with the same shape as `host_id`. Returns the new host id.
    fn spawn_instance_like(&self, host_id: &str) -> CloudResult<HostId>;

    /// Start a new instance of `instance_type`. Returns the new host id.
    fn spawn_instance(&self, instance_type: &str) -> CloudResult<HostId>;

    fn check_instance(&self, host_id: &str) -> CloudResult<InstanceStatus>;

    /// Returns true if the instance was running and is now being terminated.
    fn terminate_instance(&self, host_id: &str) -> CloudResult<bool>;

    fn get_ip(&self, host_id: &str) -> CloudResult<String>;

    fn get_instance_type(&self, host_id: &str) -> CloudResult<String>;

    /// Total capacity of `host_id`.
    fn get_resources(&self, host_id: &str) -> CloudResult<InstanceResources>;

    /// Instance types able to provide at least `resources`, smallest first.
    fn suitable_instance_types(&self, resources: &InstanceResources) -> Vec<String>;
}

/// Capacity assumed for instances the engine has no record of.
pub const DEFAULT_INSTANCE_RESOURCES: u64 = 1000;

#[derive(Debug, Clone)]
struct LocalInstance {
    ip: String,
    instance_type: String,
    status: InstanceStatus,
}

#[derive(Debug, Default)]
struct LocalState {
    instances: BTreeMap<HostId, LocalInstance>,
    instance_types: BTreeMap<String, InstanceResources>,
    spawned: Vec<(HostId, HostId)>,
    provisioned: Vec<HostId>,
    terminated: Vec<HostId>,
    fail_spawns: bool,
}

/// In-memory engine over a static host list.
///
/// Replacements are named `new_<old host>` and inherit the old host's
/// instance type; fresh instances are named `<type>-<n>`. Everything it
/// does is recorded for inspection.
#[derive(Debug, Default)]
pub struct LocalEngine {
    state: Mutex<LocalState>,
}

impl LocalEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LocalState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Declare an instance type and its capacity.
    pub fn with_instance_type(self, name: &str, resources: InstanceResources) -> Self {
        self.lock()
            .instance_types
            .insert(name.to_string(), resources.cleared());
        self
    }

    /// Add a healthy instance.
    pub fn with_host(self, host_id: &str, ip: &str, instance_type: &str) -> Self {
        self.add_host(host_id, ip, instance_type);
        self
    }

    pub fn add_host(&self, host_id: &str, ip: &str, instance_type: &str) {
        self.lock().instances.insert(
            host_id.to_string(),
            LocalInstance {
                ip: ip.to_string(),
                instance_type: instance_type.to_string(),
                status: InstanceStatus::Healthy,
            },
        );
    }

    /// Override the status the engine reports for an instance.
    pub fn set_status(&self, host_id: &str, status: InstanceStatus) {
        if let Some(instance) = self.lock().instances.get_mut(host_id) {
            instance.status = status;
        }
    }

    /// Make every subsequent spawn fail (or succeed again).
    pub fn fail_spawns(&self, fail: bool) {
        self.lock().fail_spawns = fail;
    }

    /// `(old, new)` pairs of every replacement spawned so far.
    pub fn spawned(&self) -> Vec<(HostId, HostId)> {
        self.lock().spawned.clone()
    }

    /// Hosts started by instance type, in spawn order.
    pub fn provisioned(&self) -> Vec<HostId> {
        self.lock().provisioned.clone()
    }

    pub fn terminated(&self) -> Vec<HostId> {
        self.lock().terminated.clone()
    }
}

impl CloudEngine for LocalEngine {
    fn spawn_instance_like(&self, host_id: &str) -> CloudResult<HostId> {
        let mut state = self.lock();
        if state.fail_spawns {
            return Err(CloudError::Spawn {
                host: host_id.to_string(),
                reason: "spawning disabled".to_string(),
            });
        }
        let instance_type = state
            .instances
            .get(host_id)
            .map(|i| i.instance_type.clone())
            .unwrap_or_default();
        let new_id = format!("new_{host_id}");
        state.instances.insert(
            new_id.clone(),
            LocalInstance {
                ip: String::new(),
                instance_type,
                status: InstanceStatus::Spawning,
            },
        );
        state.spawned.push((host_id.to_string(), new_id.clone()));
        info!(old = %host_id, new = %new_id, "local instance spawned");
        Ok(new_id)
    }

    fn spawn_instance(&self, instance_type: &str) -> CloudResult<HostId> {
        let mut state = self.lock();
        if state.fail_spawns {
            return Err(CloudError::Provision {
                instance_type: instance_type.to_string(),
                reason: "spawning disabled".to_string(),
            });
        }
        if !state.instance_types.contains_key(instance_type) {
            return Err(CloudError::Provision {
                instance_type: instance_type.to_string(),
                reason: "unknown instance type".to_string(),
            });
        }
        let new_id = format!("{instance_type}-{}", state.provisioned.len() + 1);
        state.instances.insert(
            new_id.clone(),
            LocalInstance {
                ip: String::new(),
                instance_type: instance_type.to_string(),
                status: InstanceStatus::Spawning,
            },
        );
        state.provisioned.push(new_id.clone());
        info!(host = %new_id, %instance_type, "local instance provisioned");
        Ok(new_id)
    }

    fn check_instance(&self, host_id: &str) -> CloudResult<InstanceStatus> {
        self.lock()
            .instances
            .get(host_id)
            .map(|i| i.status)
            .ok_or_else(|| CloudError::UnknownInstance(host_id.to_string()))
    }

    fn terminate_instance(&self, host_id: &str) -> CloudResult<bool> {
        let mut state = self.lock();
        let Some(instance) = state.instances.get_mut(host_id) else {
            warn!(host = %host_id, "terminate requested for unknown instance");
            return Ok(false);
        };
        let was_running = instance.status != InstanceStatus::Dead;
        instance.status = InstanceStatus::Dead;
        state.terminated.push(host_id.to_string());
        Ok(was_running)
    }

    fn get_ip(&self, host_id: &str) -> CloudResult<String> {
        self.lock()
            .instances
            .get(host_id)
            .map(|i| i.ip.clone())
            .ok_or_else(|| CloudError::UnknownInstance(host_id.to_string()))
    }

    fn get_instance_type(&self, host_id: &str) -> CloudResult<String> {
        self.lock()
            .instances
            .get(host_id)
            .map(|i| i.instance_type.clone())
            .ok_or_else(|| CloudError::UnknownInstance(host_id.to_string()))
    }

    fn get_resources(&self, host_id: &str) -> CloudResult<InstanceResources> {
        let state = self.lock();
        let resources = state
            .instances
            .get(host_id)
            .and_then(|i| state.instance_types.get(&i.instance_type))
            .copied()
            .unwrap_or_else(|| {
                InstanceResources::with_totals(
                    DEFAULT_INSTANCE_RESOURCES,
                    DEFAULT_INSTANCE_RESOURCES,
                    DEFAULT_INSTANCE_RESOURCES,
                )
            });
        Ok(resources)
    }

    fn suitable_instance_types(&self, resources: &InstanceResources) -> Vec<String> {
        let state = self.lock();
        let mut types: Vec<(&String, &InstanceResources)> = state
            .instance_types
            .iter()
            .filter(|(_, r)| {
                r.total_cpu >= resources.total_cpu
                    && r.total_memory >= resources.total_memory
                    && r.total_network >= resources.total_network
            })
            .collect();
        types.sort_by(|a, b| {
            let size = |r: &InstanceResources| r.total_cpu + r.total_memory + r.total_network;
            size(a.1).cmp(&size(b.1)).then_with(|| a.0.cmp(b.0))
        });
        types.into_iter().map(|(name, _)| name.clone()).collect()
    }
}
