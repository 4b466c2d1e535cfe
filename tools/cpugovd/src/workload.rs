// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Utilization driven workload view.
//!
//! Per-core utilization is sampled from /proc/stat every tick. It feeds both
//! the per-core frequency requests and the load-balance predictions the
//! bargainer asks for. Load is expressed in capacity units, 1024 being one
//! core fully busy.

use std::collections::BTreeMap;
use std::sync::Mutex;

use ::fb_procfs as procfs;
use anyhow::anyhow;
use anyhow::bail;
use anyhow::Result;
use cpugov::platform::DownPrediction;
use cpugov::platform::UpPrediction;
use cpugov::platform::Workload;

const CAPACITY_SCALE: f64 = 1024.0;

/// Utilization above which a core is considered to have a runnable task.
const BUSY_UTIL: f64 = 0.05;

fn calc_util(curr: &procfs::CpuStat, prev: &procfs::CpuStat) -> Result<f64> {
    match (curr, prev) {
        (
            procfs::CpuStat {
                user_usec: Some(curr_user),
                nice_usec: Some(curr_nice),
                system_usec: Some(curr_system),
                idle_usec: Some(curr_idle),
                iowait_usec: Some(curr_iowait),
                irq_usec: Some(curr_irq),
                softirq_usec: Some(curr_softirq),
                stolen_usec: Some(curr_stolen),
                ..
            },
            procfs::CpuStat {
                user_usec: Some(prev_user),
                nice_usec: Some(prev_nice),
                system_usec: Some(prev_system),
                idle_usec: Some(prev_idle),
                iowait_usec: Some(prev_iowait),
                irq_usec: Some(prev_irq),
                softirq_usec: Some(prev_softirq),
                stolen_usec: Some(prev_stolen),
                ..
            },
        ) => {
            let idle_usec = curr_idle.saturating_sub(*prev_idle);
            let iowait_usec = curr_iowait.saturating_sub(*prev_iowait);
            let user_usec = curr_user.saturating_sub(*prev_user);
            let system_usec = curr_system.saturating_sub(*prev_system);
            let nice_usec = curr_nice.saturating_sub(*prev_nice);
            let irq_usec = curr_irq.saturating_sub(*prev_irq);
            let softirq_usec = curr_softirq.saturating_sub(*prev_softirq);
            let stolen_usec = curr_stolen.saturating_sub(*prev_stolen);

            let busy_usec =
                user_usec + system_usec + nice_usec + irq_usec + softirq_usec + stolen_usec;
            let total_usec = idle_usec + busy_usec + iowait_usec;
            if total_usec > 0 {
                Ok(((busy_usec as f64) / (total_usec as f64)).clamp(0.0, 1.0))
            } else {
                Ok(1.0)
            }
        }
        _ => {
            bail!("Missing stats in cpustat");
        }
    }
}

/// Frequency a core at `util` asks for, with 25% headroom.
pub fn schedutil_freq(util: f64, max_freq: u32) -> u32 {
    (1.25 * util.clamp(0.0, 1.0) * max_freq as f64).min(u32::MAX as f64) as u32
}

/// Reads per-core utilization deltas from /proc/stat.
pub struct UtilSampler {
    reader: procfs::ProcReader,
    prev: BTreeMap<u32, procfs::CpuStat>,
}

impl UtilSampler {
    pub fn new() -> Result<Self> {
        let reader = procfs::ProcReader::new();
        let prev = reader
            .read_stat()?
            .cpus_map
            .ok_or_else(|| anyhow!("Expected cpus_map to exist"))?;
        Ok(Self { reader, prev })
    }

    /// Utilization of each of `nr_cpus` cores since the last sample, None
    /// for cores that are offline.
    pub fn sample(&mut self, nr_cpus: usize) -> Result<Vec<Option<f64>>> {
        let curr = self
            .reader
            .read_stat()?
            .cpus_map
            .ok_or_else(|| anyhow!("Expected cpus_map to exist"))?;
        let mut utils = vec![None; nr_cpus];
        for (cpu, util) in utils.iter_mut().enumerate() {
            let cpu32 = cpu as u32;
            if let (Some(curr), Some(prev)) = (curr.get(&cpu32), self.prev.get(&cpu32)) {
                *util = Some(calc_util(curr, prev)?);
            }
        }
        self.prev = curr;
        Ok(utils)
    }
}

/// Latest utilization snapshot, shared with the governor.
#[derive(Debug, Default)]
pub struct UtilWorkload {
    utils: Mutex<Vec<Option<f64>>>,
}

impl UtilWorkload {
    pub fn update(&self, utils: Vec<Option<f64>>) {
        *self.utils.lock().unwrap_or_else(|e| e.into_inner()) = utils;
    }

    fn snapshot(&self) -> Vec<Option<f64>> {
        self.utils.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn load(utils: &[Option<f64>], cpu: usize) -> Option<f64> {
        utils.get(cpu).copied().flatten().map(|u| u * CAPACITY_SCALE)
    }
}

impl Workload for UtilWorkload {
    fn predict_up(&self, cpu: usize) -> Option<UpPrediction> {
        let utils = self.snapshot();
        let load = Self::load(&utils, cpu)?;
        let active = utils.iter().flatten().count();
        let sum: f64 = utils.iter().flatten().map(|u| u * CAPACITY_SCALE).sum();
        let even_share = sum / (active + 1) as f64;
        Some(UpPrediction {
            total: load as u32,
            tradable: (load - even_share).max(0.0) as u32,
        })
    }

    fn predict_down(&self, cpu: usize, dest: usize) -> Option<DownPrediction> {
        let utils = self.snapshot();
        let load = Self::load(&utils, cpu)?;
        let moving = Self::load(&utils, dest)?;
        Some(DownPrediction {
            total: (CAPACITY_SCALE - load).max(0.0) as u32,
            addable: moving as u32,
        })
    }

    fn nr_running(&self, cpu: usize) -> u32 {
        match self.snapshot().get(cpu).copied().flatten() {
            Some(util) if util > BUSY_UTIL => 1,
            _ => 0,
        }
    }
}
