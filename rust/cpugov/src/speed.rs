// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Speed updater
//!
//! Commits a resolved frequency to the cluster clock and tells interested
//! listeners about it before and after the change.

use anyhow::Context;
use anyhow::Result;
use log::debug;
use log::warn;

use crate::platform::Cluster;
use crate::platform::CpuClock;
use crate::Cpumask;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionPhase {
    PreChange,
    PostChange,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreqTransition {
    pub cpu: usize,
    pub old: u32,
    pub new: u32,
    pub phase: TransitionPhase,
}

pub type TransitionListener = Box<dyn Fn(&FreqTransition) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeedChange {
    Unchanged,
    Changed { old: u32, new: u32 },
}

#[derive(Default)]
pub struct SpeedUpdater {
    listeners: Vec<TransitionListener>,
}

impl SpeedUpdater {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(&mut self, listener: TransitionListener) {
        self.listeners.push(listener);
    }

    fn notify(&self, online: &Cpumask, old: u32, new: u32, phase: TransitionPhase) {
        for cpu in online.iter() {
            let freq = FreqTransition {
                cpu,
                old,
                new,
                phase,
            };
            for listener in self.listeners.iter() {
                listener(&freq);
            }
        }
    }

    /// Move the cluster clock to `rate`. While the economy cluster parents
    /// the clock the rate is held at `low_power_ceiling`, the cluster
    /// switch raises it once the performance cluster took over. The memory
    /// bus vote is raised before speeding up and lowered after slowing
    /// down.
    pub fn update(
        &self,
        clock: &dyn CpuClock,
        online: &Cpumask,
        rate: u32,
        low_power_ceiling: u32,
    ) -> Result<SpeedChange> {
        let old = clock.rate();
        let mut new = match clock.round_rate(rate) {
            Ok(rounded) if rounded > 0 => rounded,
            _ => rate,
        };

        if clock.cluster() == Cluster::Economy && new > low_power_ceiling {
            debug!(
                "holding {} kHz at the economy ceiling {} kHz",
                new, low_power_ceiling
            );
            new = low_power_ceiling;
        }

        if old == new {
            return Ok(SpeedChange::Unchanged);
        }

        if new > old {
            clock
                .vote_memory_rate(new)
                .with_context(|| format!("Failed to raise memory rate for {} kHz", new))?;
        }

        self.notify(online, old, new, TransitionPhase::PreChange);
        clock
            .set_rate(new)
            .with_context(|| format!("Failed to set cpu clock to {} kHz", new))?;
        self.notify(online, old, new, TransitionPhase::PostChange);

        if new < old {
            if let Err(e) = clock.vote_memory_rate(new) {
                warn!("Failed to lower memory rate for {} kHz: {:#}", new, e);
            }
        }

        Ok(SpeedChange::Changed { old, new })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeClock;
    use std::sync::Arc;
    use std::sync::Mutex;

    fn online() -> Cpumask {
        let mut mask = Cpumask::new(4);
        mask.set_cpu(0).unwrap();
        mask.set_cpu(1).unwrap();
        mask
    }

    #[test]
    fn test_update_notifies_each_online_core() {
        let clock = FakeClock::new(Cluster::Performance, 640000);
        let seen = Arc::new(Mutex::new(vec![]));
        let mut updater = SpeedUpdater::new();
        let seen_clone = seen.clone();
        updater.add_listener(Box::new(move |t: &FreqTransition| {
            seen_clone.lock().unwrap().push(*t)
        }));

        let change = updater.update(&clock, &online(), 1000000, 475000).unwrap();
        assert_eq!(
            change,
            SpeedChange::Changed {
                old: 640000,
                new: 1000000
            }
        );
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 4);
        assert_eq!(seen[0].phase, TransitionPhase::PreChange);
        assert_eq!(seen[3].phase, TransitionPhase::PostChange);
        assert_eq!(clock.memory_votes(), vec![1000000]);
    }

    #[test]
    fn test_update_same_rate_is_noop() {
        let clock = FakeClock::new(Cluster::Performance, 640000);
        let updater = SpeedUpdater::new();
        let change = updater.update(&clock, &online(), 640000, 475000).unwrap();
        assert_eq!(change, SpeedChange::Unchanged);
        assert_eq!(clock.set_rate_calls(), 0);
    }

    #[test]
    fn test_economy_cluster_ceiling() {
        let clock = FakeClock::new(Cluster::Economy, 340000);
        let updater = SpeedUpdater::new();
        updater.update(&clock, &online(), 1000000, 475000).unwrap();
        assert_eq!(clock.rate(), 475000);
    }

    #[test]
    fn test_lowering_votes_memory_after() {
        let clock = FakeClock::new(Cluster::Performance, 1000000);
        let updater = SpeedUpdater::new();
        updater.update(&clock, &online(), 640000, 475000).unwrap();
        assert_eq!(clock.rate(), 640000);
        assert_eq!(clock.memory_votes(), vec![640000]);
    }

    #[test]
    fn test_failed_set_rate_propagates() {
        let clock = FakeClock::new(Cluster::Performance, 640000);
        clock.fail_set_rate(true);
        let updater = SpeedUpdater::new();
        assert!(updater.update(&clock, &online(), 1000000, 475000).is_err());
        assert_eq!(clock.rate(), 640000);
    }
}
