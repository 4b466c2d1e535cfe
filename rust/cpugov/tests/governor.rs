// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! End-to-end decision scenarios driven through the fake platform.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use cpugov::cluster::ClusterSwitchState;
use cpugov::platform::CpuClock;
use cpugov::platform::CpuHotplug;
use cpugov::platform::UpPrediction;
use cpugov::testing::CoreLoad;
use cpugov::testing::TestRig;
use cpugov::Cluster;
use cpugov::GovErrno;
use cpugov::Governor;
use cpugov::QosClass;
use cpugov::Relation;
use cpugov::Tunables;

mod common;

fn no_bargain() -> Tunables {
    let mut tun = Tunables::default();
    tun.bargain.enabled = false;
    tun
}

#[test]
fn test_set_speed_cap_idempotent() {
    let rig = TestRig::new(4, 1, Cluster::Performance, 640000);
    let gov = common::governor(&rig);
    assert_eq!(gov.target(0, 1000000, Relation::RoundUp).unwrap(), 1000000);
    assert_eq!(rig.clock.set_rate_calls(), 1);

    assert_eq!(gov.set_speed_cap(0).unwrap(), 1000000);
    assert_eq!(gov.set_speed_cap(0).unwrap(), 1000000);
    assert_eq!(rig.clock.set_rate_calls(), 1);
    assert_eq!(gov.stats().speed_updates, 1);
}

#[test]
fn test_user_cap_monotonic() {
    let rig = TestRig::new(4, 1, Cluster::Performance, 640000);
    let gov = common::governor_with(&rig, no_bargain());
    gov.target(0, 1700000, Relation::RoundUp).unwrap();

    let caps = [204000, 475000, 760000, 1000000, 1300000, 1700000];
    let mut last = 0;
    for cap in caps {
        gov.set_user_cap(cap).unwrap();
        let rate = rig.clock.rate();
        assert_eq!(rate, cap);
        assert!(rate >= last);
        last = rate;
    }
    for cap in caps.iter().rev() {
        gov.set_user_cap(*cap).unwrap();
        let rate = rig.clock.rate();
        assert!(rate <= last);
        last = rate;
    }

    // Stored caps snap down to the table, 0 clears.
    gov.set_user_cap(1250000).unwrap();
    assert_eq!(gov.tunables().user_cap, 1200000);
    gov.set_user_cap(0).unwrap();
    assert_eq!(rig.clock.rate(), 1700000);
}

#[test]
fn test_economy_to_performance_after_up_delay() {
    let rig = TestRig::new(4, 1, Cluster::Economy, 475000);
    let gov = common::governor(&rig);

    gov.add_qos_request(QosClass::FreqMin, 1000000).unwrap();
    assert_eq!(gov.cluster_state(), ClusterSwitchState::SwitchToPerformance);
    // The economy cluster can't go past its ceiling.
    assert_eq!(rig.clock.rate(), 475000);

    assert_eq!(gov.run_pending_work(), 0);
    rig.time.advance(Duration::from_millis(79));
    assert_eq!(gov.run_pending_work(), 0);
    assert_eq!(rig.clock.cluster(), Cluster::Economy);

    rig.time.advance(Duration::from_millis(1));
    assert_eq!(gov.run_pending_work(), 1);
    assert_eq!(rig.clock.cluster(), Cluster::Performance);
    assert_eq!(rig.clock.rate(), 1000000);
    assert_eq!(gov.stats().cluster_to_performance, 1);
    assert_eq!(gov.cluster_state(), ClusterSwitchState::Idle);
}

#[test]
fn test_stale_switch_is_dropped() {
    let rig = TestRig::new(4, 1, Cluster::Economy, 475000);
    let gov = common::governor(&rig);
    let req = gov.add_qos_request(QosClass::FreqMin, 1000000).unwrap();
    gov.remove_qos_request(&req).unwrap();

    rig.time.advance(Duration::from_millis(80));
    gov.run_pending_work();
    assert_eq!(rig.clock.cluster(), Cluster::Economy);
    assert!(rig.clock.cluster_switches().is_empty());
}

#[test]
fn test_single_core_to_economy_after_down_delay() {
    let rig = TestRig::new(4, 1, Cluster::Performance, 640000);
    let gov = common::governor_with(&rig, no_bargain());

    assert_eq!(gov.target(0, 200000, Relation::RoundUp).unwrap(), 204000);
    assert_eq!(gov.cluster_state(), ClusterSwitchState::SwitchToLowPower);

    rig.time.advance(Duration::from_millis(799));
    assert_eq!(gov.run_pending_work(), 0);
    rig.time.advance(Duration::from_millis(1));
    assert_eq!(gov.run_pending_work(), 1);
    assert_eq!(rig.clock.cluster(), Cluster::Economy);
    assert_eq!(rig.clock.rate(), 204000);

    // A request past the ceiling moves straight back.
    gov.target(0, 1000000, Relation::RoundUp).unwrap();
    assert_eq!(rig.clock.cluster(), Cluster::Performance);
    assert_eq!(rig.clock.rate(), 1000000);
}

#[test]
fn test_no_economy_with_two_cores() {
    let rig = TestRig::new(4, 2, Cluster::Performance, 640000);
    let gov = common::governor_with(&rig, no_bargain());
    gov.target(0, 204000, Relation::RoundUp).unwrap();
    assert_eq!(gov.cluster_state(), ClusterSwitchState::Idle);
    rig.time.advance(Duration::from_secs(1));
    gov.run_pending_work();
    assert_eq!(rig.clock.cluster(), Cluster::Performance);
}

#[test]
fn test_bargainer_takes_economy_ticket() {
    let rig = TestRig::new(4, 1, Cluster::Performance, 640000);
    let gov = common::governor(&rig);

    gov.target(0, 204000, Relation::RoundUp).unwrap();
    assert_eq!(gov.cluster_state(), ClusterSwitchState::SwitchToLowPower);
    // No down delay, the bargainer already decided.
    assert_eq!(gov.run_pending_work(), 1);
    assert_eq!(rig.clock.cluster(), Cluster::Economy);
    assert_eq!(gov.stats().cluster_to_economy, 1);
}

fn critical_rig() -> (TestRig, Governor) {
    let rig = TestRig::new(4, 2, Cluster::Performance, 800000);
    let gov = Governor::new(
        common::table_with(&[800000, 900000]),
        rig.platform(),
        Tunables::default(),
        None,
    )
    .unwrap();
    gov.update_policy(0, 0, 900000).unwrap();
    rig.workload.set(
        0,
        CoreLoad {
            up: Some(UpPrediction {
                total: 1000,
                tradable: 300,
            }),
            nr_running: 4,
            tracked: 4,
            votes: 4,
            ..Default::default()
        },
    );
    (rig, gov)
}

#[test]
fn test_critical_bargain_brings_core_up() {
    let (rig, gov) = critical_rig();

    assert_eq!(gov.target(0, 900000, Relation::RoundUp).unwrap(), 900000);
    assert_eq!(rig.clock.rate(), 900000);
    // The hotplug runs deferred.
    assert!(rig.hotplug.log().is_empty());

    assert_eq!(gov.run_pending_work(), 1);
    assert_eq!(rig.hotplug.log(), vec![(3, true)]);
    assert!(rig.hotplug.is_online(3));
    assert_eq!(gov.stats().hotplug_up, 1);
}

#[test]
fn test_debounce_allows_single_hotplug() {
    let (rig, gov) = critical_rig();

    gov.target(0, 900000, Relation::RoundUp).unwrap();
    gov.run_pending_work();
    for _ in 0..6 {
        rig.time.advance(Duration::from_millis(10));
        gov.target(0, 900000, Relation::RoundUp).unwrap();
        gov.run_pending_work();
    }
    assert_eq!(rig.hotplug.log().len(), 1);
    assert!(gov.stats().bargain_skips >= 6);
}

#[test]
fn test_no_bargain_while_plugging() {
    let (rig, gov) = critical_rig();

    gov.target(0, 900000, Relation::RoundUp).unwrap();
    let bargains = gov.stats().bargains;
    // Hotplug still queued.
    rig.time.advance(Duration::from_millis(200));
    gov.target(0, 900000, Relation::RoundUp).unwrap();
    assert_eq!(gov.stats().bargains, bargains);
    assert_eq!(gov.run_pending_work(), 1);
    assert_eq!(rig.hotplug.log().len(), 1);
}

#[test]
fn test_failed_hotplug_counted() {
    let (rig, gov) = critical_rig();
    rig.hotplug.fail(true);
    gov.target(0, 900000, Relation::RoundUp).unwrap();
    gov.run_pending_work();
    assert!(!rig.hotplug.is_online(3));
    assert_eq!(gov.stats().hotplug_failures, 1);
}

#[test]
fn test_standalone_up_bargain() {
    let (rig, gov) = critical_rig();
    gov.bargain_standalone_up(0, 900000).unwrap();
    assert_eq!(gov.run_pending_work(), 1);
    assert_eq!(rig.hotplug.log(), vec![(3, true)]);
}

#[test]
fn test_suspend_busy() {
    let rig = TestRig::new(4, 1, Cluster::Performance, 640000);
    let gov = common::governor(&rig);

    gov.suspend_notify(true).unwrap();
    // Boost 1150000 snapped down to the table.
    assert_eq!(rig.clock.rate(), 1100000);

    let err = gov.set_speed_cap(0).unwrap_err();
    assert!(GovErrno::is_busy(&err));
    assert_eq!(gov.stats().busy, 1);

    assert_eq!(gov.suspended_target(1500000).unwrap(), 1500000);
    assert_eq!(rig.clock.rate(), 1500000);
    rig.thermal.set_cap(1200000);
    assert_eq!(gov.suspended_target(1500000).unwrap(), 1200000);
    rig.thermal.set_cap(1250000);
    assert_eq!(gov.suspended_target(1500000).unwrap(), 1200000);

    gov.suspend_notify(false).unwrap();
    assert!(gov.suspended_target(1500000).is_err());
    gov.set_speed_cap(0).unwrap();
}

#[test]
fn test_suspend_holds_cluster() {
    let rig = TestRig::new(4, 1, Cluster::Economy, 475000);
    let gov = common::governor(&rig);
    gov.suspend_notify(true).unwrap();
    assert_eq!(gov.cluster_state(), ClusterSwitchState::Idle);
    rig.time.advance(Duration::from_secs(1));
    assert_eq!(gov.run_pending_work(), 0);
    assert_eq!(rig.clock.cluster(), Cluster::Economy);
}

#[test]
fn test_screen_off_caps_cores() {
    let rig = TestRig::new(4, 4, Cluster::Performance, 1000000);
    let mut tun = Tunables::default();
    tun.suspend_cap_freq = 640000;
    let gov = common::governor_with(&rig, tun);
    gov.target(0, 1300000, Relation::RoundUp).unwrap();

    gov.early_suspend().unwrap();
    assert_eq!(rig.clock.rate(), 640000);
    gov.run_pending_work();
    assert_eq!(rig.hotplug.nr_online(), 2);

    // Screen on lifts both caps and boosts.
    gov.late_resume().unwrap();
    assert_eq!(rig.clock.rate(), 1100000);
    gov.end_resume_boost().unwrap();
}

#[test]
fn test_ril_boost_leaves_economy() {
    let rig = TestRig::new(4, 1, Cluster::Economy, 475000);
    let gov = common::governor(&rig);
    gov.early_suspend().unwrap();

    // Any write triggers the boost.
    gov.set_param("ril_boost", "1").unwrap();
    assert_eq!(rig.clock.cluster(), Cluster::Performance);
    assert_eq!(rig.clock.cluster_switches(), vec![Cluster::Performance]);
    assert_eq!(rig.clock.rate(), 1100000);
    assert_eq!(gov.stats().cluster_to_performance, 1);
}

#[test]
fn test_set_param_rejects_out_of_range() {
    let rig = TestRig::new(4, 1, Cluster::Performance, 640000);
    let gov = common::governor(&rig);

    let err = gov
        .set_param("debounce_up_ms", "18446744073709551615")
        .unwrap_err();
    assert_eq!(GovErrno::of(&err), Some(libc::EINVAL));
    assert_eq!(gov.tunables().bargain.debounce_up_ms, 70);
    assert!(gov.set_param("perf_critical_elevator", "4294967295").is_err());
    assert!(gov.set_param("big_hammer_limit", "0").is_err());
    assert!(gov.set_param("lp_down_delay_ms", "60001").is_err());
    gov.set_param("debounce_up_ms", "60000").unwrap();

    // The decision path keeps working with the widest accepted values.
    assert_eq!(gov.target(0, 1000000, Relation::RoundUp).unwrap(), 1000000);
}

#[test]
fn test_invalid_tunables_refused() {
    let rig = TestRig::new(4, 1, Cluster::Performance, 640000);
    let mut tun = Tunables::default();
    tun.bargain.debounce_lp_ms = u64::MAX;
    assert!(Governor::new(
        cpugov::FrequencyTable::reference(),
        rig.platform(),
        tun,
        None
    )
    .is_err());
}

#[test]
fn test_set_param() {
    let rig = TestRig::new(4, 1, Cluster::Performance, 640000);
    let gov = common::governor(&rig);
    gov.target(0, 1700000, Relation::RoundUp).unwrap();

    gov.set_param("debounce_up_ms", "90").unwrap();
    assert_eq!(gov.tunables().bargain.debounce_up_ms, 90);
    assert_eq!(gov.param("debounce_up_ms").unwrap(), "90");
    assert_eq!(gov.param("mp_overhead").unwrap(), "10,10,10,10");

    gov.set_param("user_cap", "1250000").unwrap();
    assert_eq!(gov.param("user_cap").unwrap(), "1200000");
    assert_eq!(rig.clock.rate(), 1200000);

    gov.set_param("cpu_freq_limits", "1000000").unwrap();
    assert_eq!(rig.clock.rate(), 1000000);

    let err = gov.set_param("bogus", "1").unwrap_err();
    assert_eq!(GovErrno::of(&err), Some(libc::EINVAL));
    let err = gov.set_param("min_cores", "0").unwrap_err();
    assert_eq!(GovErrno::of(&err), Some(libc::EINVAL));
    let err = gov.set_param("debounce_down_ms", "-1").unwrap_err();
    assert_eq!(GovErrno::of(&err), Some(libc::EINVAL));
}

#[test]
fn test_transition_listener() {
    let rig = TestRig::new(4, 2, Cluster::Performance, 640000);
    let gov = common::governor_with(&rig, no_bargain());
    let seen = Arc::new(std::sync::Mutex::new(vec![]));
    let sink = seen.clone();
    gov.add_transition_listener(Box::new(move |t| {
        sink.lock().unwrap().push((t.cpu, t.new, t.phase));
    }));
    gov.target(0, 1000000, Relation::RoundUp).unwrap();
    // Pre and post change for each online core.
    assert_eq!(seen.lock().unwrap().len(), 4);
}

#[test]
fn test_operating_point() {
    let rig = TestRig::new(4, 2, Cluster::Performance, 640000);
    let gov = common::governor(&rig);
    let op = gov.operating_point();
    assert_eq!(op.frequency, 640000);
    assert_eq!(op.active_cores, 2);
    assert_eq!(op.cluster, Cluster::Performance);
}

#[test]
fn test_worker_thread_drains_queue() {
    let rig = TestRig::new(4, 1, Cluster::Performance, 640000);
    let gov = common::governor(&rig);
    let shutdown = Arc::new(AtomicBool::new(false));
    let worker = gov.spawn_worker(shutdown.clone());

    gov.set_min_cores(2).unwrap();
    let start = Instant::now();
    while rig.hotplug.nr_online() < 2 && start.elapsed() < Duration::from_secs(5) {
        std::thread::sleep(Duration::from_millis(5));
    }
    shutdown.store(true, Ordering::Relaxed);
    worker.join().unwrap();
    assert_eq!(rig.hotplug.nr_online(), 2);
}
