// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use cpugov::platform::CpuClock;
use cpugov::platform::CpuHotplug;
use cpugov::testing::TestRig;
use cpugov::Cluster;
use cpugov::GovErrno;
use cpugov::QosClass;

mod common;

#[test]
fn test_min_max_reconciliation() {
    let rig = TestRig::new(4, 1, Cluster::Performance, 640000);
    let gov = common::governor(&rig);

    gov.set_min_cores(3).unwrap();
    assert_eq!(gov.run_pending_work(), 1);
    assert_eq!(rig.hotplug.log(), vec![(3, true), (2, true)]);
    assert_eq!(rig.hotplug.nr_online(), 3);

    // The conflicting minimum gives way to the maximum.
    gov.set_max_cores(2).unwrap();
    gov.run_pending_work();
    assert_eq!(rig.hotplug.log().last(), Some(&(2, false)));
    assert_eq!(rig.hotplug.nr_online(), 2);
    assert_eq!(gov.stats().hotplug_up, 2);
    assert_eq!(gov.stats().hotplug_down, 1);
}

#[test]
fn test_min_cores_leaves_economy() {
    let rig = TestRig::new(4, 1, Cluster::Economy, 475000);
    let gov = common::governor(&rig);

    gov.set_min_cores(2).unwrap();
    assert_eq!(rig.clock.cluster(), Cluster::Performance);
    gov.run_pending_work();
    assert_eq!(rig.hotplug.nr_online(), 2);
}

#[test]
fn test_min_cores_aborts_on_failed_switch() {
    let rig = TestRig::new(4, 1, Cluster::Economy, 475000);
    let gov = common::governor(&rig);
    rig.clock.fail_set_cluster(true);

    assert!(gov.set_min_cores(2).is_err());
    gov.run_pending_work();
    assert_eq!(rig.hotplug.nr_online(), 1);
}

#[test]
fn test_qos_core_requests() {
    let rig = TestRig::new(4, 4, Cluster::Performance, 1000000);
    let gov = common::governor(&rig);

    let req = gov.add_qos_request(QosClass::MaxCores, 2).unwrap();
    gov.run_pending_work();
    assert_eq!(rig.hotplug.nr_online(), 2);

    gov.update_qos_request(&req, 3).unwrap();
    gov.remove_qos_request(&req).unwrap();
    let min = gov.add_qos_request(QosClass::MinCores, 4).unwrap();
    gov.run_pending_work();
    assert_eq!(rig.hotplug.nr_online(), 4);
    gov.remove_qos_request(&min).unwrap();
}

#[test]
fn test_reconcile_skipped_when_disabled() {
    let rig = TestRig::new(4, 1, Cluster::Performance, 640000);
    let gov = common::governor(&rig);
    gov.set_cluster_switch_enabled(false);
    gov.set_min_cores(2).unwrap();
    gov.run_pending_work();
    assert_eq!(rig.hotplug.nr_online(), 1);
}

#[test]
fn test_manual_mode() {
    let rig = TestRig::new(4, 1, Cluster::Performance, 640000);
    let gov = common::governor(&rig);

    gov.set_cpus_allowed(3).unwrap();
    assert_eq!(gov.param("core_state").unwrap(), "3");
    assert_eq!(gov.run_pending_work(), 1);
    assert_eq!(rig.hotplug.log(), vec![(1, true), (2, true)]);

    let err = gov.set_min_cores(2).unwrap_err();
    assert!(GovErrno::is_busy(&err));

    // QoS core-count changes are ignored in manual mode.
    gov.add_qos_request(QosClass::MaxCores, 1).unwrap();
    assert_eq!(gov.run_pending_work(), 0);
    assert_eq!(rig.hotplug.nr_online(), 3);

    gov.set_core_state(0b100);
    gov.run_pending_work();
    assert!(!rig.hotplug.is_online(1));
    assert!(!rig.hotplug.is_online(2));
    assert!(rig.hotplug.is_online(3));

    // Back to automatic control, the QoS maximum applies again.
    gov.set_cpus_allowed(0).unwrap();
    assert_eq!(gov.param("cpus_allowed").unwrap(), "0");
    gov.run_pending_work();
    assert_eq!(rig.hotplug.nr_online(), 1);
}

#[test]
fn test_cpus_allowed_rejects_bad_count() {
    let rig = TestRig::new(4, 1, Cluster::Performance, 640000);
    let gov = common::governor(&rig);

    let err = gov.set_cpus_allowed(5).unwrap_err();
    assert_eq!(GovErrno::of(&err), Some(libc::EINVAL));
    assert_eq!(gov.param("manual_hotplug").unwrap(), "false");
    assert_eq!(gov.param("cpus_allowed").unwrap(), "0");
    assert_eq!(gov.run_pending_work(), 0);

    // Mask and mode land together.
    gov.set_cpus_allowed(2).unwrap();
    assert_eq!(gov.param("manual_hotplug").unwrap(), "true");
    assert_eq!(gov.param("cpus_allowed").unwrap(), "2");
    assert_eq!(gov.run_pending_work(), 1);
    assert_eq!(rig.hotplug.nr_online(), 2);
}

#[test]
fn test_manual_mode_leaves_economy() {
    let rig = TestRig::new(4, 1, Cluster::Economy, 475000);
    let gov = common::governor(&rig);
    gov.set_cpus_allowed(2).unwrap();
    gov.run_pending_work();
    assert_eq!(rig.clock.cluster(), Cluster::Performance);
    assert_eq!(rig.hotplug.log(), vec![(1, true)]);
}

#[test]
fn test_wake_and_quiesce() {
    let rig = TestRig::new(4, 1, Cluster::Performance, 640000);
    let gov = common::governor(&rig);

    gov.wake_core(2).unwrap();
    assert!(rig.hotplug.is_online(2));
    gov.quiesce_core(2).unwrap();
    assert!(!rig.hotplug.is_online(2));

    assert!(gov.quiesce_core(0).is_err());
    assert!(gov.wake_core(9).is_err());

    gov.set_max_cores(1).unwrap();
    assert!(GovErrno::is_busy(&gov.wake_core(1).unwrap_err()));
}

#[test]
fn test_wake_needs_screen_on_economy() {
    let rig = TestRig::new(4, 1, Cluster::Economy, 475000);
    let gov = common::governor(&rig);
    gov.early_suspend().unwrap();
    assert!(GovErrno::is_busy(&gov.wake_core(1).unwrap_err()));

    gov.late_resume().unwrap();
    gov.end_resume_boost().unwrap();
    gov.wake_core(1).unwrap();
    assert_eq!(rig.clock.cluster(), Cluster::Performance);
    assert_eq!(rig.hotplug.nr_online(), 2);
}
