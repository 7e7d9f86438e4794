//! Update queue — per-host state machine over pending layout changes.
//!
//! Every host has an ordered list of `(app, update)` entries. An entry is
//! created `Queued` from a diff, becomes `Applying` when first served to
//! the host, and ends `Success` or `Fail` once the host reports back.
//! Terminal entries are popped on the next access to the host's queue.
//!
//! Only the `Applying` entry (or, if none, the oldest `Queued` one) is
//! ever handed to a host, so each host applies one update at a time.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use fleetgrid_state::{AppName, AppsVersion, HostId, Version};

use crate::diff::LayoutDiff;
use crate::error::{QueueError, QueueResult};

/// Lifecycle state of a queued update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UpdateState {
    Queued,
    Applying,
    Success,
    Fail,
}

impl UpdateState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Fail)
    }

    /// Whether `self -> to` is a legal transition.
    pub fn can_become(self, to: UpdateState) -> bool {
        matches!(
            (self, to),
            (Self::Queued, Self::Applying) | (Self::Applying, Self::Success) | (Self::Applying, Self::Fail)
        )
    }
}

impl fmt::Display for UpdateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Queued => "QUEUED",
            Self::Applying => "APPLYING",
            Self::Success => "SUCCESS",
            Self::Fail => "FAIL",
        };
        f.write_str(s)
    }
}

/// One pending change for one app on one host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppsUpdateState {
    pub state: UpdateState,
    pub version: AppsVersion,
}

impl AppsUpdateState {
    pub fn queued(version: AppsVersion) -> Self {
        Self {
            state: UpdateState::Queued,
            version,
        }
    }
}

type HostQueue = Vec<(AppName, AppsUpdateState)>;

/// Pending updates for every host.
#[derive(Debug, Default)]
pub struct UpdateQueue {
    hosts: Mutex<BTreeMap<HostId, HostQueue>>,
}

/// Drop terminal entries from a host's queue.
fn pop_terminal(host_id: &str, entries: &mut HostQueue) {
    entries.retain(|(app, update)| {
        let keep = !update.state.is_terminal();
        if !keep {
            debug!(host = %host_id, %app, state = %update.state, "popped finished update");
        }
        keep
    });
}

/// Index of the entry a host is working on for `app`: the applying one, else the oldest queued one.
fn active_index(entries: &HostQueue, app: &str) -> Option<usize> {
    entries
        .iter()
        .position(|(a, u)| a == app && u.state == UpdateState::Applying)
        .or_else(|| {
            entries
                .iter()
                .position(|(a, u)| a == app && u.state == UpdateState::Queued)
        })
}

impl UpdateQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<HostId, HostQueue>> {
        self.hosts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start tracking a host with an empty queue.
    pub fn add_host(&self, host_id: &str) {
        self.lock().entry(host_id.to_string()).or_default();
    }

    /// Queue every change of a diff.
    ///
    /// A change for an app that already has a `Queued` entry replaces it.
    /// A change identical to the in-flight `Applying` entry is dropped;
    /// a different one queues behind it.
    pub fn apply(&self, diff: &LayoutDiff) {
        let mut hosts = self.lock();
        for (host_id, changes) in diff {
            let entries = hosts.entry(host_id.clone()).or_default();
            pop_terminal(host_id, entries);

            for (app, wanted) in changes {
                let in_flight = entries
                    .iter()
                    .any(|(a, u)| a == app && u.state == UpdateState::Applying && u.version == *wanted);
                if in_flight {
                    continue;
                }

                let queued = entries
                    .iter_mut()
                    .find(|(a, u)| a == app && u.state == UpdateState::Queued);
                match queued {
                    Some((_, update)) => {
                        if update.version != *wanted {
                            debug!(host = %host_id, %app, version = %wanted.version, count = wanted.deployment_count, "queued update replaced");
                            update.version = wanted.clone();
                        }
                    }
                    None => {
                        info!(host = %host_id, %app, version = %wanted.version, count = wanted.deployment_count, "update queued");
                        entries.push((app.clone(), AppsUpdateState::queued(wanted.clone())));
                    }
                }
            }
        }
    }

    /// Withdraw `Queued` entries the latest diff no longer asks for.
    ///
    /// Entries already being applied are left alone. Returns how many
    /// entries were withdrawn.
    pub fn withdraw_stale(&self, diff: &LayoutDiff) -> usize {
        let mut hosts = self.lock();
        let mut withdrawn = 0;
        for (host_id, entries) in hosts.iter_mut() {
            let wanted = diff.get(host_id);
            entries.retain(|(app, update)| {
                if update.state != UpdateState::Queued {
                    return true;
                }
                let still_wanted = wanted
                    .and_then(|changes| changes.get(app))
                    .is_some_and(|v| *v == update.version);
                if !still_wanted {
                    info!(host = %host_id, %app, version = %update.version.version, "queued update withdrawn");
                    withdrawn += 1;
                }
                still_wanted
            });
        }
        withdrawn
    }

    /// All pending entries of a host, oldest first.
    pub fn get(&self, host_id: &str) -> QueueResult<Vec<(AppName, AppsUpdateState)>> {
        let mut hosts = self.lock();
        let entries = hosts
            .get_mut(host_id)
            .ok_or_else(|| QueueError::UnknownHost(host_id.to_string()))?;
        pop_terminal(host_id, entries);
        Ok(entries.clone())
    }

    /// The entry the host is working on for `app`, if any.
    pub fn entry(&self, host_id: &str, app: &str) -> QueueResult<Option<AppsUpdateState>> {
        let mut hosts = self.lock();
        let entries = hosts
            .get_mut(host_id)
            .ok_or_else(|| QueueError::UnknownHost(host_id.to_string()))?;
        pop_terminal(host_id, entries);
        Ok(active_index(entries, app).map(|i| entries[i].1.clone()))
    }

    /// The update the host should apply now.
    ///
    /// Returns the `Applying` entry if there is one; otherwise promotes the
    /// oldest `Queued` entry to `Applying`. Repeated calls return the same
    /// entry until it reaches a terminal state.
    pub fn serve(&self, host_id: &str) -> QueueResult<Option<(AppName, AppsVersion)>> {
        let mut hosts = self.lock();
        let entries = hosts
            .get_mut(host_id)
            .ok_or_else(|| QueueError::UnknownHost(host_id.to_string()))?;
        pop_terminal(host_id, entries);

        if let Some((app, update)) = entries.iter().find(|(_, u)| u.state == UpdateState::Applying) {
            return Ok(Some((app.clone(), update.version.clone())));
        }

        match entries.iter_mut().find(|(_, u)| u.state == UpdateState::Queued) {
            Some((app, update)) => {
                update.state = UpdateState::Applying;
                info!(host = %host_id, %app, version = %update.version.version, count = update.version.deployment_count, "update served");
                Ok(Some((app.clone(), update.version.clone())))
            }
            None => Ok(None),
        }
    }

    /// Move the active entry for `app` to `state`. Returns the previous state.
    pub fn set_state(&self, host_id: &str, app: &str, state: UpdateState) -> QueueResult<UpdateState> {
        let mut hosts = self.lock();
        let entries = hosts
            .get_mut(host_id)
            .ok_or_else(|| QueueError::UnknownHost(host_id.to_string()))?;
        let index = active_index(entries, app).ok_or_else(|| QueueError::UnknownApp {
            host: host_id.to_string(),
            app: app.to_string(),
        })?;

        let update = &mut entries[index].1;
        let from = update.state;
        if !from.can_become(state) {
            return Err(QueueError::IllegalTransition { from, to: state });
        }
        update.state = state;
        debug!(host = %host_id, %app, %from, to = %state, "update state changed");
        Ok(from)
    }

    /// Drop every entry for `app` on a host. Returns how many were removed.
    pub fn remove(&self, host_id: &str, app: &str) -> QueueResult<usize> {
        let mut hosts = self.lock();
        let entries = hosts
            .get_mut(host_id)
            .ok_or_else(|| QueueError::UnknownHost(host_id.to_string()))?;
        let before = entries.len();
        entries.retain(|(a, _)| a != app);
        Ok(before - entries.len())
    }

    /// Forget a host and everything queued for it.
    pub fn remove_host(&self, host_id: &str) -> bool {
        let removed = self.lock().remove(host_id);
        if let Some(entries) = &removed {
            info!(host = %host_id, dropped = entries.len(), "host queue removed");
        }
        removed.is_some()
    }

    /// Purge pending entries for `app` at `version` on every host.
    ///
    /// Finished entries are left for the regular pop. Returns the number of
    /// entries removed.
    pub fn remove_app(&self, app: &str, version: &Version) -> usize {
        let mut hosts = self.lock();
        let mut removed = 0;
        for (host_id, entries) in hosts.iter_mut() {
            let before = entries.len();
            entries.retain(|(a, u)| {
                a != app || u.version.version != *version || u.state.is_terminal()
            });
            let dropped = before - entries.len();
            if dropped > 0 {
                debug!(host = %host_id, %app, %version, dropped, "purged updates");
            }
            removed += dropped;
        }
        if removed > 0 {
            info!(%app, %version, removed, "purged pending updates cluster-wide");
        }
        removed
    }

    pub fn hosts(&self) -> Vec<HostId> {
        self.lock().keys().cloned().collect()
    }

    /// Number of entries that are not yet finished, across all hosts.
    pub fn pending(&self) -> usize {
        self.lock()
            .values()
            .flat_map(|entries| entries.iter())
            .filter(|(_, u)| !u.state.is_terminal())
            .count()
    }
}
