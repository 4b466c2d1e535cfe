// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Core count controller
//!
//! Keeps the number of online performance-cluster cores within the bounds
//! set locally and by QoS requests, or follows a fixed manual mask. The
//! controller only plans; hotplug itself is performed by the governor on
//! the worker thread. Core 0 is never taken offline.

use anyhow::Result;

use crate::errno::busy;
use crate::errno::invalid;
use crate::tunables::CoreTunables;
use crate::Cpumask;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreAction {
    Up(usize),
    Down(usize),
}

#[derive(Debug, Clone)]
pub struct CoreCountController {
    nr_cpus: usize,
}

impl CoreCountController {
    pub fn new(nr_cpus: usize) -> Self {
        Self {
            nr_cpus: nr_cpus.max(1),
        }
    }

    pub fn nr_cpus(&self) -> usize {
        self.nr_cpus
    }

    fn bound(&self, cores: usize) -> usize {
        cores.clamp(1, self.nr_cpus)
    }

    /// Stricter of the local minimum and the QoS minimum.
    pub fn effective_min(&self, tun: &CoreTunables, qos_min: u32) -> usize {
        self.bound(tun.min_cores.max(qos_min as usize))
    }

    /// Stricter of the local maximum and the QoS maximum, 0 meaning none.
    pub fn effective_max(&self, tun: &CoreTunables, qos_max: u32) -> usize {
        let local = match tun.max_cores {
            0 => self.nr_cpus,
            max => max,
        };
        match qos_max {
            0 => self.bound(local),
            qos => self.bound(local.min(qos as usize)),
        }
    }

    /// `(min, max)` with a conflicting minimum clamped to the maximum.
    pub fn bounds(&self, tun: &CoreTunables, qos_min: u32, qos_max: u32) -> (usize, usize) {
        let max = self.effective_max(tun, qos_max);
        (self.effective_min(tun, qos_min).min(max), max)
    }

    /// Preferred core to bring up: the highest numbered offline core.
    pub fn best_core_to_turn_up(&self, online: &Cpumask) -> Option<usize> {
        (1..self.nr_cpus).rev().find(|&cpu| !online.test_cpu(cpu))
    }

    /// Preferred core to take down: the lowest numbered online core but 0.
    pub fn lowest_online_secondary(&self, online: &Cpumask) -> Option<usize> {
        (1..self.nr_cpus).find(|&cpu| online.test_cpu(cpu))
    }

    /// Hotplug steps bringing the online count into `[min, max]`.
    pub fn reconcile(&self, min: usize, max: usize, online: &Cpumask) -> Vec<CoreAction> {
        let mut online = online.clone();
        let mut actions = vec![];
        loop {
            let nr_online = online.weight();
            let (action, cpu) = if nr_online < min {
                match self.best_core_to_turn_up(&online) {
                    Some(cpu) => (CoreAction::Up(cpu), cpu),
                    None => break,
                }
            } else if nr_online > max {
                match self.lowest_online_secondary(&online) {
                    Some(cpu) => (CoreAction::Down(cpu), cpu),
                    None => break,
                }
            } else {
                break;
            };
            if online.assign_cpu(cpu, matches!(action, CoreAction::Up(_))).is_err() {
                break;
            }
            actions.push(action);
        }
        actions
    }

    /// Hotplug steps applying the manual mask, where bit i stands for core
    /// i + 1. Cores past the mask width are taken down.
    pub fn manual_plan(&self, core_state: u32, online: &Cpumask) -> Vec<CoreAction> {
        (1..self.nr_cpus)
            .filter_map(|cpu| {
                let want = 1u32
                    .checked_shl((cpu - 1) as u32)
                    .map_or(false, |bit| core_state & bit != 0);
                match (want, online.test_cpu(cpu)) {
                    (true, false) => Some(CoreAction::Up(cpu)),
                    (false, true) => Some(CoreAction::Down(cpu)),
                    _ => None,
                }
            })
            .collect()
    }

    fn check_count(&self, what: &str, cores: usize) -> Result<()> {
        if cores < 1 || cores > self.nr_cpus {
            return Err(invalid(format!(
                "{} {} outside [1, {}]",
                what, cores, self.nr_cpus
            )));
        }
        Ok(())
    }

    pub fn set_min_cores(&self, tun: &mut CoreTunables, cores: usize) -> Result<()> {
        if tun.manual_hotplug {
            return Err(busy("core count is under manual control"));
        }
        self.check_count("min_cores", cores)?;
        tun.min_cores = cores;
        Ok(())
    }

    pub fn set_max_cores(&self, tun: &mut CoreTunables, cores: usize) -> Result<()> {
        if tun.manual_hotplug {
            return Err(busy("core count is under manual control"));
        }
        self.check_count("max_cores", cores)?;
        tun.max_cores = cores;
        Ok(())
    }

    /// Manual mask letting `cores` cores run: the lowest secondary cores
    /// are enabled first.
    pub fn cpus_allowed_mask(&self, cores: usize) -> Result<u32> {
        self.check_count("cpus_allowed", cores)?;
        Ok(1u32
            .checked_shl((cores - 1) as u32)
            .map_or(u32::MAX, |bit| bit - 1))
    }
}
