//! Type conversions from state store types to planner input.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use fleetgrid_state::{AppConfiguration, AppName, AppNeeds, CloudLayout, NeedsStore, Version};

use crate::planner::AppPlan;

/// Build one [`AppPlan`] per configured app.
///
/// The target version is the newest version for which `is_crashed` is
/// false. Apps whose every version crashed are left out, so they stay as
/// they currently run. Needs come from the needs store, falling back to the
/// flat needs in the configuration record.
pub fn app_plans(
    configs: &[AppConfiguration],
    needs: &NeedsStore,
    is_crashed: impl Fn(&str, &Version) -> bool,
) -> Vec<AppPlan> {
    let mut by_name: BTreeMap<&AppName, Vec<&AppConfiguration>> = BTreeMap::new();
    for conf in configs {
        by_name.entry(&conf.name).or_default().push(conf);
    }

    let mut plans = Vec::with_capacity(by_name.len());
    for (name, mut versions) in by_name {
        versions.sort_by(|a, b| b.version.cmp(&a.version));
        let Some(conf) = versions.into_iter().find(|c| !is_crashed(name, &c.version)) else {
            warn!(app = %name, "every configured version crashed, leaving app as it runs");
            continue;
        };

        let app_needs = needs.get(name, &conf.version).unwrap_or_else(|e| {
            debug!(app = %name, version = %conf.version, error = %e, "using configured needs");
            conf.needs
        });

        plans.push(AppPlan {
            name: name.clone(),
            version: conf.version.clone(),
            target: conf.effective_target(),
            needs: app_needs,
        });
    }
    plans
}

/// Needs of every app version present in `layout`, for usage accounting.
///
/// Versions without recorded needs are omitted.
pub fn carried_needs(layout: &CloudLayout, needs: &NeedsStore) -> BTreeMap<(AppName, Version), AppNeeds> {
    let mut result = BTreeMap::new();
    for element in layout.values() {
        for (app, slot) in &element.apps {
            let key = (app.clone(), slot.version.clone());
            if result.contains_key(&key) {
                continue;
            }
            if let Ok(n) = needs.get(app, &slot.version) {
                result.insert(key, n);
            }
        }
    }
    result
}
