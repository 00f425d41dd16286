use std::sync::Arc;

use lib_sip_pmi::PerfConfig;
use lib_sip_pmi::core::{
    AppDescriptor, AppIndex, LoadManager, LoadManagerConfig, LoadedApplicationsContainer, PerformanceMgr,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

#[test]
fn test_unload_empties_registry_and_disables_duration_monitoring() {
    let container = LoadedApplicationsContainer::new();
    container.set_task_duration_monitoring(true);

    let descriptor = AppDescriptor::new("AppA");
    let index = container.app_loaded("AppA", &descriptor);
    assert_eq!(index, Some(AppIndex(0)));
    assert_eq!(descriptor.app_index(), Some(AppIndex(0)));

    assert!(container.app_unloaded("AppA", AppIndex(0)));
    assert!(container.get_app_obj(Some(AppIndex(0))).is_none());
    assert!(!container.is_task_duration_monitoring());
}

#[test]
fn test_task_durations_collected_after_registry_refills() {
    let config = PerfConfig {
        task_duration_monitoring: true,
        ..PerfConfig::default()
    };
    let load_manager = Arc::new(LoadManager::new(LoadManagerConfig::from(&config)));
    let applications = Arc::new(LoadedApplicationsContainer::new());
    let mgr = PerformanceMgr::new(load_manager, applications.clone(), None);
    mgr.init(config);

    let a = AppDescriptor::new("AppA");
    let index = applications.app_loaded("AppA", &a).unwrap();
    applications.app_unloaded("AppA", index);

    let b = AppDescriptor::new("AppB");
    let index = applications.app_loaded("AppB", &b);
    mgr.update_task_duration("AppB", index, 40);

    let snapshot = mgr.flush_statistics().unwrap();
    assert_eq!(snapshot.applications[0].name, "AppB");
    assert_eq!(snapshot.applications[0].task_duration.count, 1);
    assert_eq!(snapshot.task_duration.count, 1);
}

#[test]
fn test_indices_strictly_increase_across_loads_and_unloads() {
    let mut rng = StdRng::seed_from_u64(11);
    let container = LoadedApplicationsContainer::new();
    let mut loaded: Vec<(String, AppIndex)> = Vec::new();
    let mut highest: Option<AppIndex> = None;

    for n in 0..500 {
        if !loaded.is_empty() && rng.random_bool(0.4) {
            let (name, index) = loaded.swap_remove(rng.random_range(0..loaded.len()));
            assert!(container.app_unloaded(&name, index));
        } else {
            let name = format!("app-{n}");
            let index = container.app_loaded(&name, &AppDescriptor::new(name.as_str())).unwrap();
            if let Some(previous) = highest {
                assert!(index > previous);
            }
            highest = Some(index);
            loaded.push((name, index));
        }
    }
    assert_eq!(container.len(), loaded.len());
}

#[test]
fn test_events_for_unknown_applications_change_nothing() {
    let config = PerfConfig {
        task_duration_monitoring: true,
        ..PerfConfig::default()
    };
    let load_manager = Arc::new(LoadManager::new(LoadManagerConfig::from(&config)));
    let applications = Arc::new(LoadedApplicationsContainer::new());
    let mgr = PerformanceMgr::new(load_manager, applications.clone(), None);
    mgr.init(config);

    let descriptor = AppDescriptor::new("AppA");
    applications.app_loaded("AppA", &descriptor);
    let before = applications.update_pmi();

    for index in [None, Some(AppIndex(7)), Some(AppIndex(u32::MAX))] {
        mgr.in_request("Ghost", index, "INVITE");
        mgr.out_request("Ghost", index, "OPTIONS");
        mgr.in_response("Ghost", index, 180);
        mgr.out_response("Ghost", index, 503);
    }

    assert_eq!(applications.update_pmi(), before);
    let module = applications.get_app_obj(descriptor.app_index()).unwrap();
    assert_eq!(module.sip_sessions(), 0);
    assert_eq!(module.app_sessions(), 0);
}

#[test]
fn test_snapshot_lists_applications_by_index() {
    let config = PerfConfig::default();
    let load_manager = Arc::new(LoadManager::new(LoadManagerConfig::from(&config)));
    let applications = Arc::new(LoadedApplicationsContainer::new());
    let mgr = PerformanceMgr::new(load_manager, applications.clone(), None);
    mgr.init(config);

    let names = ["registrar", "proxy", "b2bua"];
    let descriptors: Vec<AppDescriptor> = names.iter().map(|n| AppDescriptor::new(*n)).collect();
    for descriptor in &descriptors {
        applications.app_loaded(descriptor.name(), descriptor);
    }
    mgr.sip_session_created("proxy", descriptors[1].app_index());
    mgr.in_request("b2bua", descriptors[2].app_index(), "INVITE");

    let snapshot = mgr.flush_statistics().unwrap();
    let listed: Vec<&str> = snapshot.applications.iter().map(|a| a.name.as_str()).collect();
    assert_eq!(listed, names);
    assert_eq!(snapshot.applications[1].sip_sessions, 1);
    assert_eq!(snapshot.applications[2].in_requests.get("INVITE"), Some(&1));

    let json = serde_json::to_value(&snapshot).unwrap();
    assert_eq!(json["applications"][0]["name"], "registrar");
}
