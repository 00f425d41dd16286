use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use lib_sip_pmi::PerfConfig;
use lib_sip_pmi::core::{
    AppDescriptor, LoadManager, LoadManagerConfig, LoadedApplicationsContainer, PerformanceMgr,
};

const WORKERS: usize = 8;
const SESSIONS_PER_WORKER: usize = 50;
const ROUNDS: usize = 20;

#[test]
fn test_events_from_many_threads_settle_consistently() {
    let config = PerfConfig {
        max_app_sessions: 100,
        low_water_mark_size: 10,
        max_queue_size: 100,
        ..PerfConfig::default()
    };
    let load_manager = Arc::new(LoadManager::new(LoadManagerConfig::from(&config)));
    let applications = Arc::new(LoadedApplicationsContainer::new());
    let mgr = PerformanceMgr::new(load_manager, applications.clone(), None);
    mgr.init(config);

    let descriptor = AppDescriptor::new("AppA");
    let index = applications.app_loaded("AppA", &descriptor);
    let done = AtomicBool::new(false);

    thread::scope(|scope| {
        scope.spawn(|| {
            while !done.load(Ordering::Relaxed) {
                mgr.recalculate_weights();
                mgr.flush_statistics();
                thread::yield_now();
            }
        });

        let workers: Vec<_> = (0..WORKERS)
            .map(|worker| {
                let mgr = &mgr;
                scope.spawn(move || {
                    for _ in 0..ROUNDS {
                        for _ in 0..SESSIONS_PER_WORKER {
                            mgr.request_received();
                            mgr.sip_app_session_created("AppA", index);
                            mgr.sip_session_created("AppA", index);
                            mgr.in_request("AppA", index, "INVITE");
                            mgr.set_queue_size((worker * 10) as u64);
                        }
                        for _ in 0..SESSIONS_PER_WORKER {
                            mgr.sip_session_destroyed("AppA", index);
                            mgr.sip_app_session_destroyed("AppA", index);
                            mgr.out_response("AppA", index, 200);
                        }
                    }
                })
            })
            .collect();

        for worker in workers {
            worker.join().unwrap();
        }
        done.store(true, Ordering::Relaxed);
    });

    mgr.set_queue_size(0);
    mgr.recalculate_weights();
    mgr.recalculate_weights();
    assert!(!mgr.is_overload());
    assert_eq!(mgr.current_server_weight(), 3);

    let snapshot = mgr.flush_statistics().unwrap();
    assert_eq!(snapshot.app_sessions, 0);
    assert_eq!(snapshot.sip_sessions, 0);

    let module = applications.get_app_obj(index).unwrap();
    assert_eq!(module.app_sessions(), 0);
    assert_eq!(module.sip_sessions(), 0);
}
