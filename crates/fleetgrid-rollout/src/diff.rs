//! Layout diffing.
//!
//! `diff(master, slave)` answers "what does each host have to change so
//! that `slave` looks like `master`". It is pure and deterministic: the
//! result is ordered by host id and app name.

use std::collections::BTreeMap;

use fleetgrid_state::{AppName, AppsVersion, CloudLayout, HostId};

/// Per-host, per-app changes. Hosts without changes are absent.
pub type LayoutDiff = BTreeMap<HostId, BTreeMap<AppName, AppsVersion>>;

/// Compute the changes that turn `slave` into `master`.
///
/// Only hosts present in `master` are considered. For each of them:
/// - an app missing from `slave`, or present with a different version or
///   count, yields `master`'s entry;
/// - an app present only in `slave` yields its `slave` version with a
///   deployment count of zero, i.e. an explicit removal.
///
/// A host missing from `slave` contributes its whole app set.
pub fn diff(master: &CloudLayout, slave: &CloudLayout) -> LayoutDiff {
    let mut result = LayoutDiff::new();

    for (host_id, element) in master {
        let slave_apps = slave.get(host_id).map(|e| &e.apps);
        let mut changes = BTreeMap::new();

        for (app, wanted) in &element.apps {
            if slave_apps.and_then(|apps| apps.get(app)) != Some(wanted) {
                changes.insert(app.clone(), wanted.clone());
            }
        }

        if let Some(slave_apps) = slave_apps {
            for (app, running) in slave_apps {
                if !element.apps.contains_key(app) {
                    changes.insert(app.clone(), AppsVersion::new(running.version.clone(), 0));
                }
            }
        }

        if !changes.is_empty() {
            result.insert(host_id.clone(), changes);
        }
    }

    result
}
