//! Host supervision: checkin tracking and replacement of dead hosts.
//!
//! The `HostTracker` records when each host last checked in and, from a
//! periodic tick, declares hosts dead when they miss the checkin timeout
//! or the cloud provider reports them dead. Dead hosts are handed to the
//! `HostCrashHandler`, which spawns a replacement through the cloud engine
//! and remembers the old → new mapping until the new host checks in.
//!
//! Neither lock is held across a cloud engine call.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use fleetgrid_state::{
    CloudEngine, HostId, InstanceStatus, ProviderEvent, ProviderEventKind, epoch_secs,
};

/// Default time after which a silent host is declared dead.
pub const DEFAULT_CHECKIN_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Checkin bookkeeping for one host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostTrackingInfo {
    /// Unix timestamp (seconds) of the last checkin.
    pub last_checkin: u64,
}

/// Progress of a host replacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HostSpawnStatus {
    /// Reserved; the cloud engine call is in progress.
    SpawnRequested,
    /// The cloud engine accepted the spawn.
    SpawnTriggered,
    /// The cloud engine call failed; retried on the next supervision tick.
    SpawnFailed,
}

/// A pending host replacement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostSpawn {
    pub old_host_id: HostId,
    pub new_host_id: Option<HostId>,
    /// Unix timestamp (seconds) when the replacement was initiated.
    pub initiated: u64,
    pub status: HostSpawnStatus,
}

/// Spawns replacements for dead hosts and tracks them until they check in.
pub struct HostCrashHandler {
    engine: Arc<dyn CloudEngine>,
    /// Pending replacements keyed by the old host id.
    spawns: Mutex<BTreeMap<HostId, HostSpawn>>,
}

impl HostCrashHandler {
    pub fn new(engine: Arc<dyn CloudEngine>) -> Self {
        Self {
            engine,
            spawns: Mutex::new(BTreeMap::new()),
        }
    }

    /// Spawn a replacement for `host_id` unless one is already pending.
    ///
    /// Returns the new host id if a spawn was triggered by this call. A
    /// failed spawn is kept as `SpawnFailed` and retried by [`Self::retry_failed`].
    pub fn spawn_host(&self, host_id: &str) -> Option<HostId> {
        let now = epoch_secs();
        {
            let mut spawns = self.spawns.lock().unwrap_or_else(PoisonError::into_inner);
            match spawns.get_mut(host_id) {
                Some(spawn) if spawn.status == HostSpawnStatus::SpawnFailed => {
                    spawn.status = HostSpawnStatus::SpawnRequested;
                }
                Some(_) => {
                    debug!(host = %host_id, "replacement already pending");
                    return None;
                }
                None => {
                    spawns.insert(
                        host_id.to_string(),
                        HostSpawn {
                            old_host_id: host_id.to_string(),
                            new_host_id: None,
                            initiated: now,
                            status: HostSpawnStatus::SpawnRequested,
                        },
                    );
                }
            }
        }

        let result = self.engine.spawn_instance_like(host_id);

        let mut spawns = self.spawns.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(spawn) = spawns.get_mut(host_id) else {
            return None;
        };
        match result {
            Ok(new_id) => {
                spawn.new_host_id = Some(new_id.clone());
                spawn.status = HostSpawnStatus::SpawnTriggered;
                warn!(old = %host_id, new = %new_id, "host replacement triggered");
                Some(new_id)
            }
            Err(e) => {
                spawn.status = HostSpawnStatus::SpawnFailed;
                error!(host = %host_id, error = %e, "failed to spawn replacement host");
                None
            }
        }
    }

    /// Retry every replacement whose spawn failed. Returns the new host ids.
    pub fn retry_failed(&self) -> Vec<HostId> {
        let failed: Vec<HostId> = self
            .spawns
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|spawn| spawn.status == HostSpawnStatus::SpawnFailed)
            .map(|spawn| spawn.old_host_id.clone())
            .collect();

        failed
            .iter()
            .filter_map(|host_id| self.spawn_host(host_id))
            .collect()
    }

    /// Acknowledge the first checkin of a replacement host.
    ///
    /// Returns the id of the host it replaced, if `host_id` was a pending replacement.
    pub fn checkin_host(&self, host_id: &str) -> Option<HostId> {
        let mut spawns = self.spawns.lock().unwrap_or_else(PoisonError::into_inner);
        let old = spawns
            .iter()
            .find(|(_, spawn)| spawn.new_host_id.as_deref() == Some(host_id))
            .map(|(old, _)| old.clone())?;
        if let Some(spawn) = spawns.remove(&old) {
            info!(
                new = %host_id,
                old = %old,
                initiated = spawn.initiated,
                "replacement host checked in"
            );
        }
        Some(old)
    }

    pub fn get(&self, old_host_id: &str) -> Option<HostSpawn> {
        self.spawns
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(old_host_id)
            .cloned()
    }

    /// All pending replacements, ordered by old host id.
    pub fn pending(&self) -> Vec<HostSpawn> {
        self.spawns
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }
}

/// Tracks host checkins and declares hosts dead.
pub struct HostTracker {
    hosts: RwLock<BTreeMap<HostId, HostTrackingInfo>>,
    crash_handler: HostCrashHandler,
    engine: Arc<dyn CloudEngine>,
    checkin_timeout: Duration,
}

impl HostTracker {
    pub fn new(engine: Arc<dyn CloudEngine>) -> Self {
        Self {
            hosts: RwLock::new(BTreeMap::new()),
            crash_handler: HostCrashHandler::new(Arc::clone(&engine)),
            engine,
            checkin_timeout: DEFAULT_CHECKIN_TIMEOUT,
        }
    }

    /// Set the checkin timeout.
    pub fn with_checkin_timeout(mut self, timeout: Duration) -> Self {
        self.checkin_timeout = timeout;
        self
    }

    pub fn crash_handler(&self) -> &HostCrashHandler {
        &self.crash_handler
    }

    /// Record a checkin. Also acknowledges the host if it is a pending replacement.
    pub fn update(&self, host_id: &str, now: u64) {
        let first = self
            .hosts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(host_id.to_string(), HostTrackingInfo { last_checkin: now })
            .is_none();
        if first {
            info!(host = %host_id, "host discovered");
        }
        self.crash_handler.checkin_host(host_id);
    }

    pub fn get(&self, host_id: &str) -> Option<HostTrackingInfo> {
        self.hosts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(host_id)
            .copied()
    }

    pub fn remove(&self, host_id: &str) -> bool {
        self.hosts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(host_id)
            .is_some()
    }

    pub fn host_ids(&self) -> Vec<HostId> {
        self.hosts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Declare hosts dead whose last checkin is older than the timeout.
    ///
    /// Dead hosts stop being tracked and get a replacement spawned.
    /// Returns the dead hosts so the caller can purge them from other stores.
    pub fn check_checkin_timeout(&self, now: u64) -> Vec<HostId> {
        let timeout = self.checkin_timeout.as_secs();
        let expired: Vec<(HostId, u64)> = self
            .hosts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, info)| info.last_checkin.saturating_add(timeout) < now)
            .map(|(id, info)| (id.clone(), info.last_checkin))
            .collect();

        for (host_id, last_checkin) in &expired {
            warn!(host = %host_id, last_checkin, "host checkin timed out");
            self.declare_dead(host_id);
        }
        expired.into_iter().map(|(id, _)| id).collect()
    }

    /// Ask the cloud engine about every tracked host and replace the dead ones.
    pub fn check_cloud_provider(&self) -> Vec<HostId> {
        let mut dead = Vec::new();
        for host_id in self.host_ids() {
            match self.engine.check_instance(&host_id) {
                Ok(InstanceStatus::Dead) => {
                    warn!(host = %host_id, "cloud provider reports host dead");
                    self.declare_dead(&host_id);
                    dead.push(host_id);
                }
                Ok(status) => debug!(host = %host_id, %status, "cloud provider status"),
                Err(e) => warn!(host = %host_id, error = %e, "cloud provider check failed"),
            }
        }
        dead
    }

    /// Apply an event pushed by the cloud provider.
    ///
    /// Returns the host if the event killed a tracked host.
    pub fn handle_provider_event(&self, event: &ProviderEvent) -> Option<HostId> {
        info!(host = %event.host_id, kind = ?event.kind, "cloud provider event");
        match event.kind {
            ProviderEventKind::Killed => {
                if self.crash_handler.get(&event.host_id).is_some() {
                    debug!(host = %event.host_id, "kill event for host already being replaced");
                    return None;
                }
                warn!(host = %event.host_id, "cloud provider killed host");
                self.declare_dead(&event.host_id);
                Some(event.host_id.clone())
            }
            ProviderEventKind::Ready => {
                self.crash_handler.checkin_host(&event.host_id);
                None
            }
        }
    }

    fn declare_dead(&self, host_id: &str) {
        self.remove(host_id);
        self.crash_handler.spawn_host(host_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetgrid_state::LocalEngine;

    fn setup() -> (Arc<LocalEngine>, HostTracker) {
        let engine = Arc::new(
            LocalEngine::new()
                .with_host("h1", "10.0.0.1", "small")
                .with_host("h2", "10.0.0.2", "small"),
        );
        let tracker = HostTracker::new(engine.clone());
        (engine, tracker)
    }

    #[test]
    fn timeout_declares_host_dead_and_spawns() {
        let (engine, tracker) = setup();
        tracker.update("h1", 1000);
        tracker.update("h2", 1200);

        let dead = tracker.check_checkin_timeout(1000 + 301);
        assert_eq!(dead, vec!["h1"]);
        assert!(tracker.get("h1").is_none());
        assert!(tracker.get("h2").is_some());
        assert_eq!(engine.spawned(), vec![("h1".to_string(), "new_h1".to_string())]);

        let spawn = tracker.crash_handler().get("h1").unwrap();
        assert_eq!(spawn.new_host_id.as_deref(), Some("new_h1"));
        assert_eq!(spawn.status, HostSpawnStatus::SpawnTriggered);
    }

    #[test]
    fn timeout_boundary_is_exclusive() {
        let (_, tracker) = setup();
        tracker.update("h1", 1000);
        assert!(tracker.check_checkin_timeout(1300).is_empty());
        assert_eq!(tracker.check_checkin_timeout(1301), vec!["h1"]);
    }

    #[test]
    fn configurable_timeout() {
        let (_, tracker) = setup();
        let tracker = tracker.with_checkin_timeout(Duration::from_secs(10));
        tracker.update("h1", 1000);
        assert_eq!(tracker.check_checkin_timeout(1011), vec!["h1"]);
    }

    #[test]
    fn replacement_checkin_clears_pending() {
        let (_, tracker) = setup();
        tracker.update("h1", 1000);
        tracker.check_checkin_timeout(2000);
        assert_eq!(tracker.crash_handler().pending().len(), 1);

        tracker.update("new_h1", 2010);
        assert!(tracker.crash_handler().pending().is_empty());
        assert!(tracker.get("new_h1").is_some());
    }

    #[test]
    fn spawn_is_not_repeated_while_pending() {
        let (engine, tracker) = setup();
        let handler = tracker.crash_handler();
        assert_eq!(handler.spawn_host("h1").as_deref(), Some("new_h1"));
        assert_eq!(handler.spawn_host("h1"), None);
        assert_eq!(engine.spawned().len(), 1);
    }

    #[test]
    fn failed_spawn_is_retried_later() {
        let (engine, tracker) = setup();
        let handler = tracker.crash_handler();
        engine.fail_spawns(true);
        assert_eq!(handler.spawn_host("h1"), None);
        assert_eq!(handler.get("h1").unwrap().status, HostSpawnStatus::SpawnFailed);
        assert!(handler.retry_failed().is_empty());

        engine.fail_spawns(false);
        assert_eq!(handler.retry_failed(), vec!["new_h1"]);
        assert_eq!(handler.get("h1").unwrap().status, HostSpawnStatus::SpawnTriggered);
        assert!(handler.retry_failed().is_empty());
    }

    #[test]
    fn cloud_provider_dead_triggers_replacement() {
        let (engine, tracker) = setup();
        tracker.update("h1", 1000);
        tracker.update("h2", 1000);
        engine.set_status("h2", InstanceStatus::Dead);

        assert_eq!(tracker.check_cloud_provider(), vec!["h2"]);
        assert_eq!(tracker.host_ids(), vec!["h1"]);
        assert!(tracker.crash_handler().get("h2").is_some());
    }

    #[test]
    fn provider_events_drive_replacement() {
        let (engine, tracker) = setup();
        tracker.update("h1", 1000);

        let killed = ProviderEvent {
            host_id: "h1".into(),
            kind: ProviderEventKind::Killed,
        };
        assert_eq!(tracker.handle_provider_event(&killed).as_deref(), Some("h1"));
        assert_eq!(tracker.handle_provider_event(&killed), None);
        assert_eq!(engine.spawned().len(), 1);

        let ready = ProviderEvent {
            host_id: "new_h1".into(),
            kind: ProviderEventKind::Ready,
        };
        tracker.handle_provider_event(&ready);
        assert!(tracker.crash_handler().pending().is_empty());
    }
}
