//! Host supervision: silent hosts are replaced and the replacement is
//! planned onto once it checks in.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use fleetgrid_placement::PlannerPolicy;
use fleetgrid_scheduler::{ControlPlane, Scheduler};
use fleetgrid_state::*;

const APP: &str = "worker";

fn setup() -> (Arc<LocalEngine>, Scheduler) {
    let engine = Arc::new(
        LocalEngine::new()
            .with_instance_type("standard", InstanceResources::with_totals(100, 100, 100))
            .with_host("h1", "10.0.0.1", "standard")
            .with_host("h2", "10.0.0.2", "standard"),
    );
    // Spread load so an empty replacement is planned onto, not terminated.
    let plane = ControlPlane::new(ConfigStore::open_in_memory().unwrap(), engine.clone())
        .with_policy(PlannerPolicy {
            try_to_remove_hosts: false,
            ..Default::default()
        })
        .with_checkin_timeout(Duration::from_secs(300));
    (engine, Scheduler::new(Arc::new(plane)))
}

fn conf(target: u32) -> AppConfiguration {
    AppConfiguration {
        name: APP.into(),
        app_type: AppType::Worker,
        version: "1".into(),
        min_deployment_count: 0,
        target_deployment_count: target,
        max_deployment_count: 0,
        raw_config: RawConfig::default(),
        docker_config: None,
        port_mappings: HashMap::new(),
        env: HashMap::new(),
        needs: AppNeeds::new(10, 10, 10),
    }
}

fn report(host: &str, running: usize) -> HostInfo {
    HostInfo {
        host_id: host.into(),
        ip_addr: "10.0.0.9".into(),
        os_info: "linux".into(),
        habitat_version: "0.4.1".into(),
        apps: (0..running)
            .map(|i| AppInfo {
                app_type: AppType::Worker,
                name: APP.into(),
                version: "1".into(),
                status: AppStatus::Running,
                id: format!("{host}-{i}"),
            })
            .collect(),
        stats: HostStats::default(),
    }
}

#[test]
fn replacement_joins_fleet_and_absorbs_lost_instances() {
    let (engine, scheduler) = setup();
    let plane = scheduler.plane();
    plane.configure_app(&conf(2)).unwrap();
    plane.checkin_at(&report("h1", 1), 1000).unwrap();
    plane.checkin_at(&report("h2", 1), 1000).unwrap();
    scheduler.run_once().unwrap();
    assert!(scheduler.check_hosts(1100).is_empty());

    plane.checkin_at(&report("h2", 1), 1200).unwrap();
    assert_eq!(scheduler.check_hosts(1301), vec!["h1"]);
    assert_eq!(engine.spawned(), vec![("h1".to_string(), "new_h1".to_string())]);
    assert_eq!(plane.hosts().crash_handler().pending().len(), 1);

    plane.checkin_at(&report("new_h1", 0), 1310).unwrap();
    assert_eq!(plane.hosts().crash_handler().pending().len(), 0);
    assert!(plane.pool().contains("new_h1"));

    scheduler.run_once().unwrap();
    let desired = plane.layouts().desired.snapshot();
    assert!(!desired.contains_key("h1"));
    assert_eq!(desired["new_h1"].apps[APP], AppsVersion::new("1", 1));
    assert_eq!(plane.layouts().desired.deployment_count(APP, &"1".into()), 2);

    scheduler.run_once().unwrap();
    assert_eq!(plane.queue().pending(), 1);
    assert_eq!(plane.queue().get("new_h1").unwrap().len(), 1);
    assert!(engine.terminated().is_empty());
}

#[test]
fn failed_replacement_is_retried_next_tick() {
    let (engine, scheduler) = setup();
    let plane = scheduler.plane();
    plane.checkin_at(&report("h1", 0), 1000).unwrap();
    plane.checkin_at(&report("h2", 0), 1300).unwrap();

    engine.fail_spawns(true);
    assert_eq!(scheduler.check_hosts(1301), vec!["h1"]);
    assert!(engine.spawned().is_empty());

    engine.fail_spawns(false);
    assert!(scheduler.check_hosts(1302).is_empty());
    assert_eq!(engine.spawned(), vec![("h1".to_string(), "new_h1".to_string())]);
}
