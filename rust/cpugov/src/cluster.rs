// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Cluster switch
//!
//! Decides when the workload moves between the single-core economy cluster
//! and the performance cluster. Decisions are made on every frequency
//! change and executed later from the worker queue. The state recorded at
//! decision time is only a hint: the worker re-validates it against the
//! current situation before reparenting the clock.

use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use log::debug;
use serde::Deserialize;
use serde::Serialize;

use crate::platform::Cluster;
use crate::platform::CpuClock;
use crate::tunables::ClusterTunables;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterSwitchState {
    Disabled,
    Idle,
    SwitchToLowPower,
    SwitchToPerformance,
}

/// Platform state the decision depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterInputs {
    pub on_economy: bool,
    pub has_performance: bool,
    /// Effective minimum core count.
    pub min_cores: usize,
    pub nr_online: usize,
}

#[derive(Debug)]
pub struct ClusterSwitch {
    state: ClusterSwitchState,
    suspended: bool,
    lp_entered_at: u64,
}

impl Default for ClusterSwitch {
    fn default() -> Self {
        Self::new(true)
    }
}

impl ClusterSwitch {
    pub fn new(enabled: bool) -> Self {
        Self {
            state: match enabled {
                true => ClusterSwitchState::Idle,
                false => ClusterSwitchState::Disabled,
            },
            suspended: false,
            lp_entered_at: 0,
        }
    }

    pub fn state(&self) -> ClusterSwitchState {
        self.state
    }

    pub fn is_disabled(&self) -> bool {
        self.state == ClusterSwitchState::Disabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.state = match enabled {
            true => ClusterSwitchState::Idle,
            false => ClusterSwitchState::Disabled,
        };
    }

    /// Monotonic time the economy cluster was last entered, 0 if never.
    pub fn lp_entered_at(&self) -> u64 {
        self.lp_entered_at
    }

    pub fn lp_possible(inp: &ClusterInputs, tun: &ClusterTunables) -> bool {
        !inp.on_economy && !tun.no_lp && inp.min_cores < 2 && inp.nr_online == 1
    }

    /// Record the decision for target frequency `freq`. Returns the delay
    /// after which the worker should execute it, None if nothing is to be
    /// done.
    pub fn evaluate(
        &mut self,
        freq: u32,
        suspend: bool,
        inp: &ClusterInputs,
        tun: &ClusterTunables,
    ) -> Option<Duration> {
        if !inp.has_performance || self.is_disabled() {
            return None;
        }

        self.state = ClusterSwitchState::Idle;
        self.suspended = suspend;
        if suspend {
            return None;
        }

        if inp.on_economy && (freq > tun.low_power_ceiling || tun.no_lp) {
            self.state = ClusterSwitchState::SwitchToPerformance;
            Some(Duration::from_millis(tun.lp_up_delay_ms))
        } else if freq <= tun.low_power_ceiling && Self::lp_possible(inp, tun) {
            self.state = ClusterSwitchState::SwitchToLowPower;
            Some(Duration::from_millis(tun.lp_down_delay_ms))
        } else {
            None
        }
    }

    /// Switch to the economy cluster on behalf of the bargainer, bypassing
    /// the down delay. Fails if the economy cluster is not eligible.
    pub fn request_economy(&mut self, inp: &ClusterInputs, tun: &ClusterTunables) -> bool {
        if self.is_disabled() || !inp.has_performance || !Self::lp_possible(inp, tun) {
            return false;
        }
        self.state = ClusterSwitchState::SwitchToLowPower;
        true
    }

    /// Cluster the recorded decision still asks for, given the current
    /// target `freq`.
    pub fn pending_action(
        &self,
        freq: u32,
        inp: &ClusterInputs,
        tun: &ClusterTunables,
    ) -> Option<Cluster> {
        if self.suspended || !inp.has_performance {
            return None;
        }
        match self.state {
            ClusterSwitchState::SwitchToPerformance
                if inp.on_economy && (freq > tun.low_power_ceiling || tun.no_lp) =>
            {
                Some(Cluster::Performance)
            }
            ClusterSwitchState::SwitchToLowPower
                if freq <= tun.low_power_ceiling && Self::lp_possible(inp, tun) =>
            {
                Some(Cluster::Economy)
            }
            _ => None,
        }
    }

    pub fn mark_switched(&mut self, cluster: Cluster, now: u64) {
        if cluster == Cluster::Economy {
            self.lp_entered_at = now;
        }
        if !self.is_disabled() {
            self.state = ClusterSwitchState::Idle;
        }
    }
}

/// Reparent the clock onto the performance cluster. The rate is raised to
/// `ceiling` first so that it is valid for both parents.
pub fn switch_to_performance(clock: &dyn CpuClock, ceiling: u32) -> Result<()> {
    if clock.cluster() == Cluster::Performance {
        return Ok(());
    }
    if clock.rate() < ceiling {
        clock
            .set_rate(ceiling)
            .with_context(|| format!("Failed to raise rate to {} kHz before switch", ceiling))?;
    }
    clock
        .set_cluster(Cluster::Performance)
        .context("Failed to switch to the performance cluster")?;
    debug!("cluster: switched to performance");
    Ok(())
}

/// Reparent the clock onto the economy cluster, lowering the rate to
/// `ceiling` first when needed.
pub fn switch_to_economy(clock: &dyn CpuClock, ceiling: u32) -> Result<()> {
    if clock.cluster() == Cluster::Economy {
        return Ok(());
    }
    if clock.rate() > ceiling {
        clock
            .set_rate(ceiling)
            .with_context(|| format!("Failed to lower rate to {} kHz before switch", ceiling))?;
    }
    clock
        .set_cluster(Cluster::Economy)
        .context("Failed to switch to the economy cluster")?;
    debug!("cluster: switched to economy");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeClock;

    fn inputs(on_economy: bool, nr_online: usize) -> ClusterInputs {
        ClusterInputs {
            on_economy,
            has_performance: true,
            min_cores: 1,
            nr_online,
        }
    }

    #[test]
    fn test_economy_to_performance() {
        let tun = ClusterTunables::default();
        let mut cs = ClusterSwitch::default();
        let delay = cs.evaluate(1000000, false, &inputs(true, 1), &tun);
        assert_eq!(delay, Some(Duration::from_millis(80)));
        assert_eq!(cs.state(), ClusterSwitchState::SwitchToPerformance);
        assert_eq!(
            cs.pending_action(1000000, &inputs(true, 1), &tun),
            Some(Cluster::Performance)
        );
        // Demand dropped back during the delay.
        assert_eq!(cs.pending_action(300000, &inputs(true, 1), &tun), None);
    }

    #[test]
    fn test_performance_to_economy() {
        let tun = ClusterTunables::default();
        let mut cs = ClusterSwitch::default();
        let delay = cs.evaluate(200000, false, &inputs(false, 1), &tun);
        assert_eq!(delay, Some(Duration::from_millis(800)));
        assert_eq!(cs.state(), ClusterSwitchState::SwitchToLowPower);
        // A second core came up in the meantime.
        assert_eq!(cs.pending_action(200000, &inputs(false, 2), &tun), None);
        assert_eq!(
            cs.pending_action(200000, &inputs(false, 1), &tun),
            Some(Cluster::Economy)
        );
    }

    #[test]
    fn test_never_low_power_with_two_cores() {
        let tun = ClusterTunables::default();
        let mut cs = ClusterSwitch::default();
        for freq in [51000, 204000, 475000] {
            assert_eq!(cs.evaluate(freq, false, &inputs(false, 2), &tun), None);
            assert_eq!(cs.state(), ClusterSwitchState::Idle);
        }
        let mut inp = inputs(false, 1);
        inp.min_cores = 2;
        assert_eq!(cs.evaluate(51000, false, &inp, &tun), None);
    }

    #[test]
    fn test_suspend_and_disabled() {
        let tun = ClusterTunables::default();
        let mut cs = ClusterSwitch::default();
        assert_eq!(cs.evaluate(1000000, true, &inputs(true, 1), &tun), None);
        assert_eq!(cs.state(), ClusterSwitchState::Idle);

        cs.set_enabled(false);
        assert_eq!(cs.evaluate(1000000, false, &inputs(true, 1), &tun), None);
        assert!(cs.is_disabled());
        assert!(!cs.request_economy(&inputs(false, 1), &tun));
    }

    #[test]
    fn test_no_lp_forces_performance() {
        let tun = ClusterTunables {
            no_lp: true,
            ..Default::default()
        };
        let mut cs = ClusterSwitch::default();
        assert!(cs.evaluate(204000, false, &inputs(true, 1), &tun).is_some());
        assert_eq!(cs.state(), ClusterSwitchState::SwitchToPerformance);
        assert!(!cs.request_economy(&inputs(false, 1), &tun));
    }

    #[test]
    fn test_switch_raises_rate_first() {
        let clock = FakeClock::new(Cluster::Economy, 204000);
        switch_to_performance(&clock, 475000).unwrap();
        assert_eq!(clock.rate(), 475000);
        assert_eq!(clock.cluster(), Cluster::Performance);

        let clock = FakeClock::new(Cluster::Performance, 1000000);
        switch_to_economy(&clock, 475000).unwrap();
        assert_eq!(clock.rate(), 475000);
        assert_eq!(clock.cluster_switches(), vec![Cluster::Economy]);
    }

    #[test]
    fn test_failed_switch_leaves_cluster() {
        let clock = FakeClock::new(Cluster::Economy, 475000);
        clock.fail_set_cluster(true);
        assert!(switch_to_performance(&clock, 475000).is_err());
        assert_eq!(clock.cluster(), Cluster::Economy);
    }
}
