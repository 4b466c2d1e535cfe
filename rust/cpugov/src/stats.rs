// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::io::Write;

use anyhow::Result;
use serde::Deserialize;
use serde::Serialize;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GovernorStats {
    pub bargains: u64,
    pub bargain_skips: u64,
    pub hotplug_up: u64,
    pub hotplug_down: u64,
    pub hotplug_failures: u64,
    pub overclock_boosts: u64,
    pub vote_scalings: u64,

    pub cluster_to_performance: u64,
    pub cluster_to_economy: u64,
    pub cluster_switch_failures: u64,

    pub speed_updates: u64,
    pub busy: u64,
}

impl GovernorStats {
    pub fn format<W: Write>(&self, w: &mut W) -> Result<()> {
        writeln!(
            w,
            "bargain: total={:<6} skipped={:<6} oc={:<4} vote_scaled={}",
            self.bargains, self.bargain_skips, self.overclock_boosts, self.vote_scalings
        )?;
        writeln!(
            w,
            "hotplug: up={:<6} down={:<6} failed={}",
            self.hotplug_up, self.hotplug_down, self.hotplug_failures
        )?;
        writeln!(
            w,
            "cluster: to_perf={:<4} to_lp={:<4} failed={}",
            self.cluster_to_performance, self.cluster_to_economy, self.cluster_switch_failures
        )?;
        writeln!(
            w,
            "speed:   updates={:<6} busy={}",
            self.speed_updates, self.busy
        )?;
        Ok(())
    }
}
