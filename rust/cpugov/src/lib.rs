// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Power/performance governor for asymmetric multi-cluster SoCs
//!
//! This crate decides, for a SoC with one single-core economy cluster and
//! one multi-core performance cluster sharing a clock, at which frequency
//! the cores run, on which cluster, and how many performance cores are
//! online.
//!
//! The decision engine lives behind [`Governor`]. Every frequency request
//! runs through the same steps:
//!
//! 1. The [`limits::FrequencyResolver`] snaps the highest per-core target
//!    to the frequency table, bounded by the user cap, the thermal and EDP
//!    ceilings and the aggregated QoS requests.
//! 2. The [`bargain::Bargainer`] checks whether one core more or one core
//!    less delivers the same performance for less power.
//! 3. The [`speed::SpeedUpdater`] commits the frequency and the
//!    [`cluster::ClusterSwitch`] records whether the economy or the
//!    performance cluster should take over.
//!
//! Cluster switches and hotplug are slow and run deferred from a work
//! queue. All hardware access goes through the traits in [`platform`] so
//! the engine runs unchanged against sysfs or against the fakes in
//! [`testing`].

mod cpumask;
pub use cpumask::read_cpulist;
pub use cpumask::Cpumask;

mod errno;
pub use errno::GovErrno;

mod freq_table;
pub use freq_table::FrequencyTable;
pub use freq_table::Relation;
pub use freq_table::REFERENCE_FREQS;

pub mod bargain;
pub mod cluster;
pub mod cores;
pub mod debounce;
pub mod edp;
pub mod energy_model;
pub mod limits;
pub mod platform;
pub mod speed;
pub mod tunables;
pub mod workqueue;

mod stats;
pub use stats::GovernorStats;

mod governor;
pub use governor::Governor;
pub use governor::OperatingPoint;

pub use limits::QosClass;
pub use limits::QosRequest;
pub use platform::Cluster;
pub use platform::Platform;
pub use tunables::Tunables;

pub mod testing;
