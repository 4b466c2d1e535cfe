// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Platform collaborators
//!
//! The governor never touches hardware directly. Clock programming, core
//! hotplug, the power model, load prediction, thermal throttling and the
//! time source are all reached through the traits in this module so that
//! the decision engine can run against sysfs on a device or against fakes
//! in tests.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::Deserialize;
use serde::Serialize;

use crate::Cpumask;

/// The two clusters sharing the cluster clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Cluster {
    /// Single low-power core.
    Economy,
    /// Multi-core high-performance cluster.
    Performance,
}

/// Cluster clock control. All rates are in kHz.
pub trait CpuClock: Send + Sync {
    /// Current rate, 0 if unknown.
    fn rate(&self) -> u32;

    /// Rate the clock would actually run at if `khz` were requested.
    fn round_rate(&self, khz: u32) -> Result<u32>;

    fn set_rate(&self, khz: u32) -> Result<()>;

    /// Cluster currently parenting the clock.
    fn cluster(&self) -> Cluster;

    /// Reparent the clock onto `cluster`.
    fn set_cluster(&self, cluster: Cluster) -> Result<()>;

    fn has_performance_cluster(&self) -> bool {
        true
    }

    /// Vote for the memory bus rate matching a cpu rate. Raised before a
    /// cpu rate increase and lowered after a decrease.
    fn vote_memory_rate(&self, _cpu_khz: u32) -> Result<()> {
        Ok(())
    }
}

pub trait CpuHotplug: Send + Sync {
    fn nr_cpus(&self) -> usize;

    fn is_online(&self, cpu: usize) -> bool;

    fn cpu_up(&self, cpu: usize) -> Result<()>;

    fn cpu_down(&self, cpu: usize) -> Result<()>;

    fn online_mask(&self) -> Cpumask {
        let nr_cpus = self.nr_cpus();
        let mut mask = Cpumask::new(nr_cpus);
        for cpu in 0..nr_cpus {
            if self.is_online(cpu) {
                let _ = mask.set_cpu(cpu);
            }
        }
        mask
    }

    fn nr_online(&self) -> usize {
        (0..self.nr_cpus()).filter(|&cpu| self.is_online(cpu)).count()
    }
}

/// Estimated power draw of the performance cluster.
pub trait PowerModel: Send + Sync {
    /// Power at `freq_khz` with `cores` cores online, in mW.
    fn power(&self, freq_khz: u32, cores: usize) -> u32;

    /// Largest value power() can legitimately return.
    fn max_power(&self) -> u32;

    fn valid_power(&self, power: u32) -> bool {
        power > 0 && power <= self.max_power()
    }

    fn valid_power_diff(&self, diff: i64) -> bool {
        diff.unsigned_abs() <= self.max_power() as u64
    }
}

/// Outcome of predicting a core-up load balance from `cpu`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpPrediction {
    /// Compute capacity currently loaded on the core.
    pub total: u32,
    /// Part of it that can safely move to a freshly onlined core.
    pub tradable: u32,
}

/// Outcome of predicting that `cpu` absorbs the load of a core going down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownPrediction {
    pub total: u32,
    pub addable: u32,
}

/// Runqueue level view of the workload.
pub trait Workload: Send + Sync {
    fn predict_up(&self, cpu: usize) -> Option<UpPrediction>;

    fn predict_down(&self, cpu: usize, dest: usize) -> Option<DownPrediction>;

    fn nr_running(&self, cpu: usize) -> u32;

    /// Runnable tasks whose load history is already known. The rest are
    /// newcomers.
    fn tracked_tasks(&self, cpu: usize) -> u32 {
        self.nr_running(cpu)
    }

    /// Tasks on `cpu` currently asking for more performance.
    fn perf_votes(&self, _cpu: usize) -> u32 {
        0
    }
}

pub trait ThermalThrottle: Send + Sync {
    /// Frequency the throttle allows for `requested`.
    fn throttle_speed(&self, requested: u32) -> u32;

    /// Engage or cancel emergency throttling.
    fn throttle_now(&self, _engage: bool) {}
}

/// Thermal throttle that never caps.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoThrottle;

impl ThermalThrottle for NoThrottle {
    fn throttle_speed(&self, requested: u32) -> u32 {
        requested
    }
}

/// Monotonic nanosecond clock used for every debounce decision.
pub trait TimeSource: Send + Sync {
    fn now_ns(&self) -> u64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct MonotonicTime;

impl TimeSource for MonotonicTime {
    fn now_ns(&self) -> u64 {
        let mut time = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        let ret = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut time) };
        assert!(ret == 0);
        time.tv_sec as u64 * 1_000_000_000 + time.tv_nsec as u64
    }
}

/// Time source that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualTime {
    now: AtomicU64,
}

impl ManualTime {
    pub fn new(start_ns: u64) -> Self {
        Self {
            now: AtomicU64::new(start_ns),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_nanos() as u64, Ordering::SeqCst);
    }

    pub fn set(&self, now_ns: u64) {
        self.now.store(now_ns, Ordering::SeqCst);
    }
}

impl TimeSource for ManualTime {
    fn now_ns(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Everything the governor needs from the outside world.
#[derive(Clone)]
pub struct Platform {
    pub clock: Arc<dyn CpuClock>,
    pub hotplug: Arc<dyn CpuHotplug>,
    pub power: Arc<dyn PowerModel>,
    pub workload: Arc<dyn Workload>,
    pub thermal: Arc<dyn ThermalThrottle>,
    pub time: Arc<dyn TimeSource>,
}
