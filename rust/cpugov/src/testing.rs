// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! In-memory collaborators for driving the governor without hardware.

use std::collections::BTreeMap;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

use anyhow::bail;
use anyhow::Result;

use crate::energy_model::LinearPowerModel;
use crate::platform::Cluster;
use crate::platform::CpuClock;
use crate::platform::CpuHotplug;
use crate::platform::DownPrediction;
use crate::platform::ManualTime;
use crate::platform::Platform;
use crate::platform::ThermalThrottle;
use crate::platform::UpPrediction;
use crate::platform::Workload;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Debug, Default)]
struct ClockState {
    rate: u32,
    cluster: Option<Cluster>,
    set_rate_calls: usize,
    memory_votes: Vec<u32>,
    cluster_switches: Vec<Cluster>,
    fail_set_rate: bool,
    fail_set_cluster: bool,
}

#[derive(Debug)]
pub struct FakeClock {
    state: Mutex<ClockState>,
    has_performance: bool,
}

impl FakeClock {
    pub fn new(cluster: Cluster, rate: u32) -> Self {
        Self {
            state: Mutex::new(ClockState {
                rate,
                cluster: Some(cluster),
                ..Default::default()
            }),
            has_performance: true,
        }
    }

    pub fn without_performance_cluster(rate: u32) -> Self {
        Self {
            has_performance: false,
            ..Self::new(Cluster::Economy, rate)
        }
    }

    fn state(&self) -> MutexGuard<'_, ClockState> {
        lock(&self.state)
    }

    pub fn set_rate_calls(&self) -> usize {
        self.state().set_rate_calls
    }

    pub fn memory_votes(&self) -> Vec<u32> {
        self.state().memory_votes.clone()
    }

    pub fn cluster_switches(&self) -> Vec<Cluster> {
        self.state().cluster_switches.clone()
    }

    pub fn fail_set_rate(&self, fail: bool) {
        self.state().fail_set_rate = fail;
    }

    pub fn fail_set_cluster(&self, fail: bool) {
        self.state().fail_set_cluster = fail;
    }
}

impl CpuClock for FakeClock {
    fn rate(&self) -> u32 {
        self.state().rate
    }

    fn round_rate(&self, khz: u32) -> Result<u32> {
        Ok(khz)
    }

    fn set_rate(&self, khz: u32) -> Result<()> {
        let mut st = self.state();
        if st.fail_set_rate {
            bail!("set_rate refused");
        }
        st.rate = khz;
        st.set_rate_calls += 1;
        Ok(())
    }

    fn cluster(&self) -> Cluster {
        self.state().cluster.unwrap_or(Cluster::Performance)
    }

    fn set_cluster(&self, cluster: Cluster) -> Result<()> {
        let mut st = self.state();
        if st.fail_set_cluster {
            bail!("reparent refused");
        }
        st.cluster = Some(cluster);
        st.cluster_switches.push(cluster);
        Ok(())
    }

    fn has_performance_cluster(&self) -> bool {
        self.has_performance
    }

    fn vote_memory_rate(&self, cpu_khz: u32) -> Result<()> {
        self.state().memory_votes.push(cpu_khz);
        Ok(())
    }
}

#[derive(Debug)]
pub struct FakeHotplug {
    online: Mutex<Vec<bool>>,
    log: Mutex<Vec<(usize, bool)>>,
    fail: Mutex<bool>,
}

impl FakeHotplug {
    pub fn new(nr_cpus: usize, nr_online: usize) -> Self {
        Self {
            online: Mutex::new((0..nr_cpus).map(|cpu| cpu < nr_online.max(1)).collect()),
            log: Mutex::new(vec![]),
            fail: Mutex::new(false),
        }
    }

    pub fn set_online(&self, cpu: usize, online: bool) {
        lock(&self.online)[cpu] = online;
    }

    /// (cpu, up) of every successful hotplug, in order.
    pub fn log(&self) -> Vec<(usize, bool)> {
        lock(&self.log).clone()
    }

    pub fn fail(&self, fail: bool) {
        *lock(&self.fail) = fail;
    }

    fn change(&self, cpu: usize, up: bool) -> Result<()> {
        if *lock(&self.fail) {
            bail!("hotplug of cpu {} refused", cpu);
        }
        let mut online = lock(&self.online);
        if cpu >= online.len() || online[cpu] == up {
            bail!("cpu {} cannot go {}", cpu, if up { "up" } else { "down" });
        }
        online[cpu] = up;
        lock(&self.log).push((cpu, up));
        Ok(())
    }
}

impl CpuHotplug for FakeHotplug {
    fn nr_cpus(&self) -> usize {
        lock(&self.online).len()
    }

    fn is_online(&self, cpu: usize) -> bool {
        lock(&self.online).get(cpu).copied().unwrap_or(false)
    }

    fn cpu_up(&self, cpu: usize) -> Result<()> {
        self.change(cpu, true)
    }

    fn cpu_down(&self, cpu: usize) -> Result<()> {
        self.change(cpu, false)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CoreLoad {
    pub up: Option<UpPrediction>,
    pub down: Option<DownPrediction>,
    pub nr_running: u32,
    pub tracked: u32,
    pub votes: u32,
}

#[derive(Debug, Default)]
pub struct FakeWorkload {
    cores: Mutex<BTreeMap<usize, CoreLoad>>,
}

impl FakeWorkload {
    pub fn set(&self, cpu: usize, load: CoreLoad) {
        lock(&self.cores).insert(cpu, load);
    }

    fn get(&self, cpu: usize) -> CoreLoad {
        lock(&self.cores)
            .get(&cpu)
            .copied()
            .unwrap_or_default()
    }
}

impl Workload for FakeWorkload {
    fn predict_up(&self, cpu: usize) -> Option<UpPrediction> {
        self.get(cpu).up
    }

    fn predict_down(&self, cpu: usize, _dest: usize) -> Option<DownPrediction> {
        self.get(cpu).down
    }

    fn nr_running(&self, cpu: usize) -> u32 {
        self.get(cpu).nr_running
    }

    fn tracked_tasks(&self, cpu: usize) -> u32 {
        self.get(cpu).tracked
    }

    fn perf_votes(&self, cpu: usize) -> u32 {
        self.get(cpu).votes
    }
}

#[derive(Debug, Default)]
pub struct FakeThermal {
    cap: AtomicU32,
    engaged: Mutex<Vec<bool>>,
}

impl FakeThermal {
    /// Throttle to `cap` kHz, 0 lifts the throttle.
    pub fn set_cap(&self, cap: u32) {
        self.cap.store(cap, Ordering::SeqCst);
    }

    pub fn emergency_calls(&self) -> Vec<bool> {
        lock(&self.engaged).clone()
    }
}

impl ThermalThrottle for FakeThermal {
    fn throttle_speed(&self, requested: u32) -> u32 {
        match self.cap.load(Ordering::SeqCst) {
            0 => requested,
            cap => requested.min(cap),
        }
    }

    fn throttle_now(&self, engage: bool) {
        lock(&self.engaged).push(engage);
    }
}

/// A complete fake platform, with handles kept for poking at each piece.
pub struct TestRig {
    pub clock: Arc<FakeClock>,
    pub hotplug: Arc<FakeHotplug>,
    pub power: Arc<LinearPowerModel>,
    pub workload: Arc<FakeWorkload>,
    pub thermal: Arc<FakeThermal>,
    pub time: Arc<ManualTime>,
}

impl TestRig {
    pub fn new(nr_cpus: usize, nr_online: usize, cluster: Cluster, rate: u32) -> Self {
        Self {
            clock: Arc::new(FakeClock::new(cluster, rate)),
            hotplug: Arc::new(FakeHotplug::new(nr_cpus, nr_online)),
            power: Arc::new(LinearPowerModel::new(100, 1000, 1700000, nr_cpus)),
            workload: Arc::new(FakeWorkload::default()),
            thermal: Arc::new(FakeThermal::default()),
            time: Arc::new(ManualTime::new(1_000_000_000)),
        }
    }

    pub fn platform(&self) -> Platform {
        Platform {
            clock: self.clock.clone(),
            hotplug: self.hotplug.clone(),
            power: self.power.clone(),
            workload: self.workload.clone(),
            thermal: self.thermal.clone(),
            time: self.time.clone(),
        }
    }
}
