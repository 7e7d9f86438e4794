//! Responder — the host-facing side of the control plane.
//!
//! Hosts poll in with a report of every app instance they run. The
//! responder records the checkin, refreshes the host's `Current` element,
//! interprets the report against the host's update queue, and answers
//! with the update the host should apply next.
//!
//! # Update outcomes
//!
//! For an app whose queue entry is `Applying`:
//!
//! | Report                                               | Outcome     |
//! |------------------------------------------------------|-------------|
//! | any instance `dead`                                  | fatal       |
//! | target version only, all `running`, count matches    | success     |
//! | target version present otherwise                     | in progress |
//! | only other versions, `running` or `deploying`        | rollback    |
//! | only `init` instances                                | in progress |
//!
//! A removal (target count 0) succeeds once no live instance of the
//! removed version is reported; other versions are ignored.
//!
//! Apps without an `Applying` entry get a simple health check: `running`
//! instances check in, anything else counts as a crash.

use std::collections::BTreeMap;

use tracing::{debug, error, info, warn};

use fleetgrid_health::AppEvent;
use fleetgrid_rollout::{AppsUpdateState, LayoutDiff, UpdateState};
use fleetgrid_state::{
    AppInfo, AppStatus, AppsVersion, HostInfo, PushConfiguration, StateError, Version,
    epoch_secs,
};

use crate::control_plane::ControlPlane;
use crate::error::{SchedulerError, SchedulerResult};

/// How a host's report relates to the update it is applying.
#[derive(Debug, Clone, PartialEq, Eq)]
enum UpdateOutcome {
    Success,
    InProgress,
    /// The host went back to another version.
    Rollback,
    /// Instances died; carries the versions that died.
    Fatal(Vec<Version>),
}

fn classify(update: &AppsUpdateState, instances: &[&AppInfo]) -> UpdateOutcome {
    let target = &update.version;

    if target.deployment_count == 0 {
        // Removal: done once no live instance of the removed version is left.
        let live = instances
            .iter()
            .any(|a| a.version == target.version && a.status != AppStatus::Dead);
        return if live {
            UpdateOutcome::InProgress
        } else {
            UpdateOutcome::Success
        };
    }

    let mut dead: Vec<Version> = instances
        .iter()
        .filter(|a| a.status == AppStatus::Dead)
        .map(|a| a.version.clone())
        .collect();

    if !dead.is_empty() {
        dead.sort();
        dead.dedup();
        return UpdateOutcome::Fatal(dead);
    }

    let on_target: Vec<&&AppInfo> = instances
        .iter()
        .filter(|a| a.version == target.version)
        .collect();
    let others = instances.len() - on_target.len();

    if !on_target.is_empty() {
        let all_running = on_target.iter().all(|a| a.status == AppStatus::Running);
        if others == 0 && all_running && on_target.len() == target.deployment_count as usize {
            return UpdateOutcome::Success;
        }
        return UpdateOutcome::InProgress;
    }

    let reverted = instances
        .iter()
        .any(|a| matches!(a.status, AppStatus::Running | AppStatus::Deploying));
    if reverted {
        UpdateOutcome::Rollback
    } else {
        UpdateOutcome::InProgress
    }
}

impl ControlPlane {
    /// Handle a host checkin and return the update it should apply next.
    pub fn checkin(&self, info: &HostInfo) -> SchedulerResult<Option<PushConfiguration>> {
        self.checkin_at(info, epoch_secs())
    }

    /// Handle a host checkin at an explicit time.
    pub fn checkin_at(
        &self,
        info: &HostInfo,
        now: u64,
    ) -> SchedulerResult<Option<PushConfiguration>> {
        let host_id = info.host_id.as_str();
        debug!(host = %host_id, apps = info.apps.len(), "host checkin");

        self.hosts.update(host_id, now);

        if !self.pool.contains(host_id) {
            match self.engine.get_resources(host_id) {
                Ok(resources) => self.pool.register(host_id, resources),
                Err(e) => warn!(host = %host_id, error = %e, "no capacity known for host"),
            }
        }

        let first_report = !self.layouts.current.contains_host(host_id);
        self.layouts.current.update_host(info);
        if first_report {
            // Whatever a new host already runs stays planned until the planner decides otherwise.
            let observed = self.layouts.current.get_host(host_id)?;
            self.layouts.desired.adopt_host(observed);
        }
        self.queue.add_host(host_id);

        self.check_app_state(info);
        self.get_config_for_host(host_id)
    }

    /// The update `host_id` should apply now, if any.
    ///
    /// Serving a `Queued` entry promotes it to `Applying`; repeated calls
    /// return the same entry until the host's reports settle it. An entry
    /// whose configuration is missing is failed so the queue moves on.
    pub fn get_config_for_host(&self, host_id: &str) -> SchedulerResult<Option<PushConfiguration>> {
        let Some((app, target)) = self.queue.serve(host_id)? else {
            debug!(host = %host_id, "nothing queued");
            return Ok(None);
        };

        match self.config.get_app(&app, &target.version) {
            Ok(app_configuration) => Ok(Some(PushConfiguration {
                deployment_count: target.deployment_count,
                app_configuration,
            })),
            Err(StateError::AppNotFound { .. }) => {
                error!(host = %host_id, %app, version = %target.version, "served update has no configuration");
                if let Err(e) = self.queue.set_state(host_id, &app, UpdateState::Fail) {
                    warn!(host = %host_id, %app, error = %e, "could not fail unconfigured update");
                }
                Err(SchedulerError::AppNotConfigured {
                    name: app,
                    version: target.version,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Interpret a host report against the host's update queue.
    pub fn check_app_state(&self, info: &HostInfo) {
        let host_id = info.host_id.as_str();

        let mut reported: BTreeMap<&str, Vec<&AppInfo>> = BTreeMap::new();
        for app in &info.apps {
            reported.entry(app.name.as_str()).or_default().push(app);
        }

        for (app, instances) in &reported {
            let entry = match self.queue.entry(host_id, app) {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(host = %host_id, %app, error = %e, "no update queue for host");
                    None
                }
            };
            match entry {
                Some(update) if update.state == UpdateState::Applying => {
                    self.check_app_update(host_id, app, &update, instances);
                }
                _ => self.simple_app_check(host_id, instances),
            }
        }

        // Removals finish by the app disappearing from the report.
        let pending = match self.queue.get(host_id) {
            Ok(entries) => entries,
            Err(_) => return,
        };
        for (app, update) in pending {
            if update.state == UpdateState::Applying && !reported.contains_key(app.as_str()) {
                self.check_app_update(host_id, &app, &update, &[]);
            }
        }
    }

    fn simple_app_check(&self, host_id: &str, instances: &[&AppInfo]) {
        for instance in instances {
            let event = if instance.status == AppStatus::Running {
                AppEvent::Checkin
            } else {
                warn!(
                    host = %host_id,
                    app = %instance.name,
                    version = %instance.version,
                    status = %instance.status,
                    "app instance not running"
                );
                AppEvent::Crash
            };
            self.apps
                .update(host_id, &instance.name, &instance.version, event);
        }
    }

    fn check_app_update(
        &self,
        host_id: &str,
        app: &str,
        update: &AppsUpdateState,
        instances: &[&AppInfo],
    ) {
        let target = &update.version;
        match classify(update, instances) {
            UpdateOutcome::InProgress => {
                debug!(host = %host_id, %app, version = %target.version, "update still applying");
            }
            UpdateOutcome::Success => {
                if !self.transition(host_id, app, UpdateState::Success) {
                    return;
                }
                if target.deployment_count > 0 {
                    self.apps
                        .update(host_id, app, &target.version, AppEvent::SuccessfulUpdate);
                }
                info!(
                    host = %host_id,
                    %app,
                    version = %target.version,
                    count = target.deployment_count,
                    "update successful"
                );
            }
            UpdateOutcome::Rollback => {
                if !self.transition(host_id, app, UpdateState::Fail) {
                    return;
                }
                self.apps
                    .update(host_id, app, &target.version, AppEvent::Rollback);
                let purged = self.queue.remove_app(app, &target.version);
                error!(
                    host = %host_id,
                    %app,
                    version = %target.version,
                    purged,
                    "update rolled back, rollout abandoned"
                );
            }
            UpdateOutcome::Fatal(died) => {
                if !self.transition(host_id, app, UpdateState::Fail) {
                    return;
                }
                for version in &died {
                    self.apps.update(host_id, app, version, AppEvent::Crash);
                    error!(
                        host = %host_id,
                        %app,
                        target = %target.version,
                        %version,
                        "update was fatal for the app"
                    );
                }
                self.fall_back(host_id, app, target);
            }
        }
    }

    /// Queue the newest stable version of `app` in place of a fatal update.
    fn fall_back(&self, host_id: &str, app: &str, failed: &AppsVersion) {
        let Some(version) = self.apps.last_stable(app) else {
            debug!(host = %host_id, %app, "no stable version to fall back to");
            return;
        };
        if version == failed.version {
            return;
        }
        if let Err(e) = self.config.get_app(app, &version) {
            warn!(host = %host_id, %app, %version, error = %e, "stable version has no configuration");
            return;
        }

        let mut changes = LayoutDiff::new();
        changes.entry(host_id.to_string()).or_default().insert(
            app.to_string(),
            AppsVersion::new(version.clone(), failed.deployment_count),
        );
        self.queue.apply(&changes);
        info!(
            host = %host_id,
            %app,
            failed = %failed.version,
            %version,
            count = failed.deployment_count,
            "falling back to last stable version"
        );
    }

    /// Move the active entry to `state`. Illegal transitions are logged and ignored.
    fn transition(&self, host_id: &str, app: &str, state: UpdateState) -> bool {
        match self.queue.set_state(host_id, app, state) {
            Ok(_) => true,
            Err(e) => {
                warn!(host = %host_id, %app, to = %state, error = %e, "ignoring update report");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;

    use fleetgrid_health::Rating;
    use fleetgrid_state::{
        AppConfiguration, AppNeeds, AppType, ConfigStore, HostStats, LocalEngine, RawConfig,
    };

    fn plane() -> ControlPlane {
        let engine = Arc::new(
            LocalEngine::new()
                .with_host("h1", "10.0.0.1", "small")
                .with_host("h2", "10.0.0.2", "small"),
        );
        let plane = ControlPlane::new(ConfigStore::open_in_memory().unwrap(), engine);
        for version in ["1", "2"] {
            plane
                .configure_app(&AppConfiguration {
                    name: "web".into(),
                    app_type: AppType::Http,
                    version: version.into(),
                    min_deployment_count: 0,
                    target_deployment_count: 1,
                    max_deployment_count: 0,
                    raw_config: RawConfig::default(),
                    docker_config: None,
                    port_mappings: HashMap::new(),
                    env: HashMap::new(),
                    needs: AppNeeds::new(10, 10, 10),
                })
                .unwrap();
        }
        plane
    }

    fn instance(version: &str, status: AppStatus, id: &str) -> AppInfo {
        AppInfo {
            app_type: AppType::Http,
            name: "web".into(),
            version: version.into(),
            status,
            id: id.into(),
        }
    }

    fn report(host: &str, apps: Vec<AppInfo>) -> HostInfo {
        HostInfo {
            host_id: host.into(),
            ip_addr: "10.0.0.1".into(),
            os_info: String::new(),
            habitat_version: String::new(),
            apps,
            stats: HostStats::default(),
        }
    }

    fn queue_update(plane: &ControlPlane, host: &str, version: &str, count: u32) {
        let mut diff = LayoutDiff::new();
        diff.entry(host.to_string())
            .or_default()
            .insert("web".into(), AppsVersion::new(version, count));
        plane.queue.apply(&diff);
    }

    fn update(version: &str, count: u32) -> AppsUpdateState {
        AppsUpdateState {
            state: UpdateState::Applying,
            version: AppsVersion::new(version, count),
        }
    }

    #[test]
    fn classify_outcomes() {
        let running2 = instance("2", AppStatus::Running, "a");
        let deploying2 = instance("2", AppStatus::Deploying, "b");
        let running1 = instance("1", AppStatus::Running, "c");
        let init1 = instance("1", AppStatus::Init, "d");
        let dead1 = instance("1", AppStatus::Dead, "e");

        assert_eq!(classify(&update("2", 1), &[&running2]), UpdateOutcome::Success);
        assert_eq!(classify(&update("2", 2), &[&running2]), UpdateOutcome::InProgress);
        assert_eq!(classify(&update("2", 1), &[&deploying2]), UpdateOutcome::InProgress);
        assert_eq!(
            classify(&update("2", 1), &[&running2, &running1]),
            UpdateOutcome::InProgress
        );
        assert_eq!(classify(&update("2", 1), &[&running1]), UpdateOutcome::Rollback);
        assert_eq!(classify(&update("2", 1), &[&init1]), UpdateOutcome::InProgress);
        assert_eq!(
            classify(&update("2", 1), &[&running2, &dead1]),
            UpdateOutcome::Fatal(vec![Version::from("1")])
        );
        assert_eq!(classify(&update("1", 0), &[&running1]), UpdateOutcome::InProgress);
        assert_eq!(classify(&update("1", 0), &[]), UpdateOutcome::Success);
        assert_eq!(classify(&update("1", 0), &[&dead1]), UpdateOutcome::Success);
        assert_eq!(classify(&update("1", 0), &[&running2]), UpdateOutcome::Success);
        assert_eq!(
            classify(&update("1", 0), &[&running2, &init1]),
            UpdateOutcome::InProgress
        );
    }

    #[test]
    fn serving_promotes_and_repeats() {
        let plane = plane();
        plane.queue.add_host("h1");
        queue_update(&plane, "h1", "2", 1);

        let push = plane.get_config_for_host("h1").unwrap().unwrap();
        assert_eq!(push.deployment_count, 1);
        assert_eq!(push.app_configuration.version, Version::from("2"));

        let again = plane.get_config_for_host("h1").unwrap().unwrap();
        assert_eq!(again, push);
        assert_eq!(
            plane.queue.entry("h1", "web").unwrap().unwrap().state,
            UpdateState::Applying
        );
    }

    #[test]
    fn unknown_host_is_an_error() {
        let plane = plane();
        assert!(matches!(
            plane.get_config_for_host("ghost"),
            Err(SchedulerError::Queue(_))
        ));
    }

    #[test]
    fn unconfigured_update_is_failed() {
        let plane = plane();
        plane.queue.add_host("h1");
        queue_update(&plane, "h1", "9", 1);

        assert!(matches!(
            plane.get_config_for_host("h1"),
            Err(SchedulerError::AppNotConfigured { .. })
        ));
        assert!(plane.get_config_for_host("h1").unwrap().is_none());
    }

    #[test]
    fn successful_update_clears_queue() {
        let plane = plane();
        plane.queue.add_host("h1");
        queue_update(&plane, "h1", "2", 1);
        plane.get_config_for_host("h1").unwrap();

        let push = plane
            .checkin_at(&report("h1", vec![instance("2", AppStatus::Running, "a")]), 100)
            .unwrap();
        assert!(push.is_none());
        assert!(plane.queue.get("h1").unwrap().is_empty());
        assert_eq!(plane.apps.rating("web", &"2".into()), Some(Rating::Stable));
    }

    #[test]
    fn deploying_report_keeps_update_applying() {
        let plane = plane();
        plane.queue.add_host("h1");
        queue_update(&plane, "h1", "2", 1);
        plane.get_config_for_host("h1").unwrap();

        let push = plane
            .checkin_at(&report("h1", vec![instance("2", AppStatus::Deploying, "a")]), 100)
            .unwrap();
        assert_eq!(push.unwrap().app_configuration.version, Version::from("2"));
        assert_eq!(plane.apps.rating("web", &"2".into()), None);
    }

    #[test]
    fn rollback_purges_every_host() {
        let plane = plane();
        for host in ["h1", "h2"] {
            plane.queue.add_host(host);
            queue_update(&plane, host, "2", 1);
        }
        plane.get_config_for_host("h1").unwrap();

        plane
            .checkin_at(&report("h1", vec![instance("1", AppStatus::Running, "a")]), 100)
            .unwrap();

        assert!(plane.queue.get("h1").unwrap().is_empty());
        assert!(plane.queue.get("h2").unwrap().is_empty());
        assert!(plane.apps.is_crashed("web", &"2".into()));
        assert_eq!(plane.apps.rating("web", &"1".into()), None);
    }

    #[test]
    fn dead_instance_is_fatal() {
        let plane = plane();
        plane.queue.add_host("h1");
        queue_update(&plane, "h1", "2", 1);
        plane.get_config_for_host("h1").unwrap();

        plane
            .checkin_at(&report("h1", vec![instance("2", AppStatus::Dead, "a")]), 100)
            .unwrap();

        assert!(plane.queue.get("h1").unwrap().is_empty());
        let track = plane.apps.track("web", &"2".into()).unwrap();
        assert_eq!(track.rating, Rating::Crashed);
        assert_eq!(track.crash_details[0].cause, AppEvent::Crash);
    }

    #[test]
    fn removal_completes_while_other_version_runs() {
        let plane = plane();
        plane.queue.add_host("h1");
        queue_update(&plane, "h1", "1", 0);
        plane.get_config_for_host("h1").unwrap();

        let push = plane
            .checkin_at(&report("h1", vec![instance("2", AppStatus::Running, "a")]), 100)
            .unwrap();
        assert!(push.is_none());
        assert!(plane.queue.get("h1").unwrap().is_empty());
    }

    #[test]
    fn fatal_update_falls_back_to_stable_version() {
        let plane = plane();
        plane
            .apps
            .update("h1", "web", &"1".into(), AppEvent::SuccessfulUpdate);
        plane.queue.add_host("h1");
        queue_update(&plane, "h1", "2", 1);
        plane.get_config_for_host("h1").unwrap();

        let push = plane
            .checkin_at(&report("h1", vec![instance("2", AppStatus::Dead, "a")]), 100)
            .unwrap()
            .unwrap();
        assert_eq!(push.app_configuration.version, Version::from("1"));
        assert_eq!(push.deployment_count, 1);
        assert!(plane.apps.is_crashed("web", &"2".into()));
        assert_eq!(
            plane.queue.entry("h1", "web").unwrap().unwrap().version,
            AppsVersion::new("1", 1)
        );
    }

    #[test]
    fn queued_entry_gets_simple_check() {
        let plane = plane();
        plane.queue.add_host("h1");
        queue_update(&plane, "h1", "2", 1);

        plane.check_app_state(&report(
            "h1",
            vec![
                instance("1", AppStatus::Running, "a"),
                instance("1", AppStatus::Deploying, "b"),
            ],
        ));

        let track = plane.apps.track("web", &"1".into()).unwrap();
        assert_eq!(track.running_count, 1);
        assert_eq!(track.rating, Rating::Crashed);
        assert_eq!(
            plane.queue.entry("h1", "web").unwrap().unwrap().state,
            UpdateState::Queued
        );
    }

    #[test]
    fn removal_completes_when_app_is_gone() {
        let plane = plane();
        plane.queue.add_host("h1");
        queue_update(&plane, "h1", "1", 0);
        let push = plane.get_config_for_host("h1").unwrap().unwrap();
        assert_eq!(push.deployment_count, 0);

        plane
            .checkin_at(&report("h1", vec![instance("1", AppStatus::Running, "a")]), 100)
            .unwrap();
        assert_eq!(plane.queue.pending(), 1);

        plane.checkin_at(&report("h1", vec![]), 110).unwrap();
        assert_eq!(plane.queue.pending(), 0);
        assert!(!plane.layouts.current.get_host("h1").unwrap().has_app("web"));
    }

    #[test]
    fn checkin_registers_host() {
        let plane = plane();
        plane
            .checkin_at(&report("h1", vec![instance("1", AppStatus::Running, "a")]), 100)
            .unwrap();

        assert!(plane.pool.contains("h1"));
        assert_eq!(plane.hosts.get("h1").unwrap().last_checkin, 100);
        let element = plane.layouts.current.get_host("h1").unwrap();
        assert_eq!(element.ip_address, "10.0.0.1");
        assert_eq!(element.apps["web"], AppsVersion::new("1", 1));
    }
}
