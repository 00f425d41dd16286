use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use lib_sip_pmi::PerfConfig;
use lib_sip_pmi::core::cached_time::system_millis;
use lib_sip_pmi::core::{
    Dimension, LoadManager, LoadManagerConfig, LoadedApplicationsContainer, PerformanceMgr, PeriodicScheduler,
    WeightSteps,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn build(config: &PerfConfig, scheduler: Option<PeriodicScheduler>) -> Arc<PerformanceMgr> {
    let load_manager = Arc::new(LoadManager::new(LoadManagerConfig::from(config)));
    let mgr = PerformanceMgr::new(load_manager, Arc::new(LoadedApplicationsContainer::new()), scheduler);
    mgr.init(config.clone());
    mgr
}

#[test]
fn test_app_session_overload_enters_and_clears() {
    let config = PerfConfig {
        max_app_sessions: 2,
        low_water_mark_size: 1,
        overload_protection_enabled: true,
        ..PerfConfig::default()
    };
    let mgr = build(&config, None);

    for _ in 0..3 {
        mgr.sip_app_session_created("AppA", None);
    }
    mgr.recalculate_weights();
    assert_eq!(mgr.current_server_weight(), 0);
    assert!(mgr.is_overload());
    assert_eq!(mgr.overloaded_dimension(), Some(Dimension::AppSessions));

    for _ in 0..3 {
        mgr.sip_app_session_destroyed("AppA", None);
    }
    mgr.recalculate_weights();
    assert!(!mgr.is_overload());
    assert!(mgr.current_server_weight() >= config.weight_overload_mark);

    mgr.recalculate_weights();
    let transitions = mgr.load_manager().transitions();
    assert_eq!(transitions.entered, 1);
    assert_eq!(transitions.cleared, 1);
}

#[test]
fn test_overload_clears_when_band_exceeds_ceiling() {
    let config = PerfConfig {
        max_app_sessions: 50,
        max_response_time: 100,
        ..PerfConfig::default()
    };
    let mgr = build(&config, None);

    for _ in 0..50 {
        mgr.sip_app_session_created("AppA", None);
    }
    mgr.recalculate_weights();
    assert!(mgr.is_overload());
    for _ in 0..50 {
        mgr.sip_app_session_destroyed("AppA", None);
    }
    mgr.recalculate_weights();
    assert!(!mgr.is_overload());

    let now = system_millis();
    mgr.response_sent(now.saturating_sub(150));
    assert_eq!(mgr.recalculate_weights(), Some((0, Dimension::ResponseTime)));
    assert!(mgr.is_overload());
    // A window without samples averages to zero.
    assert_eq!(mgr.recalculate_weights(), Some((3, Dimension::AppSessions)));
    assert!(!mgr.is_overload());
    assert_eq!(mgr.load_manager().transitions().cleared, 2);
}

#[test]
fn test_slow_responses_without_listener_raise_overload() {
    let config = PerfConfig {
        max_response_time: 100,
        low_water_mark_size: 1,
        ..PerfConfig::default()
    };
    let mgr = build(&config, None);
    assert!(!mgr.is_pmi_enabled());

    let arrival = system_millis();
    std::thread::sleep(Duration::from_millis(300));
    mgr.response_sent(arrival);
    assert_eq!(mgr.recalculate_weights(), Some((0, Dimension::ResponseTime)));
    assert_eq!(mgr.overloaded_dimension(), Some(Dimension::ResponseTime));
}

#[test]
fn test_overload_flag_moves_only_at_zero_and_mark() {
    let mut rng = StdRng::seed_from_u64(2024);
    for _ in 0..50 {
        let manager = LoadManager::new(LoadManagerConfig {
            max_weight: 3,
            weight_overload_mark: 2,
            reject_in_overload: true,
        });
        let mut overloaded = false;
        for _ in 0..200 {
            let weight = rng.random_range(0..=3);
            let changed = manager.update_new_weight(Dimension::MessageRate, weight, 0);
            let now = manager.is_overloaded();
            assert_eq!(changed, now != overloaded);
            if now && !overloaded {
                assert_eq!(weight, 0);
            }
            if !now && overloaded {
                assert!(weight >= 2);
            }
            if weight == 1 {
                assert!(!changed, "weight 1 sits inside the band");
            }
            overloaded = now;
        }
    }
}

#[test]
fn test_published_weight_is_the_worst_counter() {
    let mut rng = StdRng::seed_from_u64(99);
    let config = PerfConfig {
        max_app_sessions: 40,
        max_message_rate: 40,
        max_queue_size: 40,
        low_water_mark_size: 5,
        averaging_period: 1000,
        load_update_period: 1000,
        ..PerfConfig::default()
    };
    let steps = WeightSteps::new(40, 5, config.max_weight);

    for _ in 0..100 {
        let mgr = build(&config, None);
        let sessions = rng.random_range(0..50u64);
        let messages = rng.random_range(0..50u64);
        let depth = rng.random_range(0..50u64);

        for _ in 0..sessions {
            mgr.sip_app_session_created("AppA", None);
        }
        for _ in 0..messages {
            mgr.request_received();
        }
        mgr.set_queue_size(depth);

        let expected = [
            (steps.weight_for(sessions), Dimension::AppSessions),
            (steps.weight_for(messages), Dimension::MessageRate),
            (config.max_weight, Dimension::ResponseTime),
            (steps.weight_for(depth), Dimension::QueueSize),
        ]
        .into_iter()
        .fold(None, |worst: Option<(u32, Dimension)>, (w, d)| match worst {
            Some((best, _)) if best <= w => worst,
            _ => Some((w, d)),
        });

        assert_eq!(
            mgr.recalculate_weights(),
            expected,
            "sessions={sessions} messages={messages} depth={depth}"
        );
        assert_eq!(Some(mgr.current_server_weight()), expected.map(|(w, _)| w));
    }
}

#[test]
fn test_disabled_response_time_never_influences_weight() {
    let config = PerfConfig {
        max_response_time: 0,
        ..PerfConfig::default()
    };
    let mgr = build(&config, None);
    let now = mgr.clock().now_millis();
    for latency in [10, 1_000, 100_000, 10_000_000] {
        mgr.response_sent(now.saturating_sub(latency));
    }

    assert_eq!(mgr.recalculate_weights(), Some((config.max_weight, Dimension::AppSessions)));
    assert!(!mgr.is_overload());
    assert!(mgr.counter_states()[Dimension::ResponseTime.index()].contains("disabled"));
}

#[test]
fn test_rate_normalization_in_snapshot() {
    let config = PerfConfig {
        averaging_period: 3000,
        stat_update_range: 5000,
        ..PerfConfig::default()
    };
    let mgr = build(&config, None);
    for _ in 0..1000 {
        mgr.request_received();
    }
    let snapshot = mgr.flush_statistics().unwrap();
    assert_eq!(snapshot.received_messages_rate, 600);
}

#[test]
fn test_thresholds_from_json_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"{{"maxAppSessions": 1, "lowWaterMarkSize": 1, "rejectInOverload": false}}"#
    )
    .unwrap();
    let config = PerfConfig::from_json_file(file.path()).unwrap();
    let mgr = build(&config, None);

    mgr.sip_app_session_created("AppA", None);
    assert!(mgr.is_overload());
    assert!(!mgr.load_manager().should_throw_msgs());
}

#[tokio::test(start_paused = true)]
async fn test_periodic_recalculation_catches_message_burst() {
    let config = PerfConfig {
        max_message_rate: 1000,
        averaging_period: 1000,
        load_update_period: 500,
        low_water_mark_size: 50,
        ..PerfConfig::default()
    };
    let mgr = build(&config, Some(PeriodicScheduler::current().unwrap()));

    // 400 arrivals in a 500ms window are 800 per second.
    for _ in 0..400 {
        mgr.request_received();
    }
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(mgr.current_server_weight(), 1);
    assert!(!mgr.is_overload());

    // 500 arrivals saturate the counter before the next recalculation.
    for _ in 0..500 {
        mgr.request_received();
    }
    assert!(mgr.is_overload());

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(!mgr.is_overload(), "quiet windows clear the overload");
    assert_eq!(mgr.load_manager().transitions().cleared, 1);

    mgr.stop_timers();
}
