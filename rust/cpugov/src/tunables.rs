// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Tunables
//!
//! Every runtime knob of the governor. Defaults match the reference
//! four-core platform. The struct deserializes with `#[serde(default)]` so a
//! configuration file only has to name the knobs it changes.

use anyhow::Result;
use serde::Deserialize;
use serde::Serialize;

use crate::errno::invalid;

/// Boost frequency used on resume and for the suspend rate.
pub const BOOST_FREQ: u32 = 1150000;
/// Highest frequency of core 0.
pub const FREQ_MAX_CPU0: u32 = 1700000;
/// Highest frequency of the other cores.
pub const FREQ_MAX: u32 = 1600000;
/// Highest frequency of any core with overclock enabled.
pub const FREQ_MAX_OC: u32 = 1700000;
/// Platform floor.
pub const FREQ_MIN: u32 = 51000;
/// Platform floor while audio playback is active.
pub const FREQ_MIN_AUDIO: u32 = 102000;
/// Highest frequency the economy cluster can run at.
pub const LOW_POWER_CEILING: u32 = 475000;
/// Lowest frequency hotplug bargaining is attempted at.
pub const MIN_HOTPLUG_SPEED: u32 = 340000;

/// Longest accepted debounce or delay interval.
pub const MAX_INTERVAL_MS: u64 = 60_000;
/// Largest accepted perf-critical elevator, in runnable tasks.
pub const MAX_PERF_CRITICAL_ELEVATOR: u32 = 1024;
/// Largest accepted overclock back-off multiplier.
pub const MAX_BIG_HAMMER: u32 = 1024;
/// Largest accepted percentage for overheads and vote factors.
pub const MAX_PERCENT: u32 = 1000;

fn check_ms(name: &str, ms: u64) -> Result<()> {
    if ms > MAX_INTERVAL_MS {
        return Err(invalid(format!(
            "{}: {} ms exceeds {} ms",
            name, ms, MAX_INTERVAL_MS
        )));
    }
    Ok(())
}

fn check_range(name: &str, val: u32, min: u32, max: u32) -> Result<()> {
    if val < min || val > max {
        return Err(invalid(format!("{}: {} outside [{}, {}]", name, val, min, max)));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BargainTunables {
    pub enabled: bool,
    pub debounce_up_ms: u64,
    pub debounce_down_ms: u64,
    pub debounce_lp_ms: u64,
    /// Refresh the hotplug timestamp once the slower debounce window passed.
    pub relax: bool,
    /// Multi-core overhead in percent, indexed by active core count - 1.
    pub mp_overhead: Vec<u32>,
    pub big_two_overhead_up: bool,
    pub big_two_overhead_down: bool,
    /// Percent of frequency added per performance vote, 0 disables.
    pub perfvote_factor: u32,
    /// The count of newly arrived tasks is shifted right by this much.
    pub newcomer_shift: u32,
    pub perf_critical_elevator: u32,
    pub overclock: bool,
    pub big_hammer_limit: u32,
    pub overclock_base_ms: u64,
    pub min_hotplug_speed: u32,
}

impl Default for BargainTunables {
    fn default() -> Self {
        Self {
            enabled: true,
            debounce_up_ms: 70,
            debounce_down_ms: 100,
            debounce_lp_ms: 200,
            relax: false,
            mp_overhead: vec![10, 10, 10, 10],
            big_two_overhead_up: false,
            big_two_overhead_down: true,
            perfvote_factor: 0,
            newcomer_shift: 1,
            perf_critical_elevator: 0,
            overclock: false,
            big_hammer_limit: 100,
            overclock_base_ms: 50,
            min_hotplug_speed: MIN_HOTPLUG_SPEED,
        }
    }
}

impl BargainTunables {
    /// Overhead for `idx`, 0 past the end of the table.
    pub fn overhead(&self, idx: usize) -> u64 {
        self.mp_overhead.get(idx).copied().unwrap_or(0) as u64
    }

    pub fn validate(&self) -> Result<()> {
        check_ms("debounce_up_ms", self.debounce_up_ms)?;
        check_ms("debounce_down_ms", self.debounce_down_ms)?;
        check_ms("debounce_lp_ms", self.debounce_lp_ms)?;
        check_ms("overclock_base_ms", self.overclock_base_ms)?;
        for &overhead in self.mp_overhead.iter() {
            check_range("mp_overhead", overhead, 0, 100)?;
        }
        check_range("perfvote_factor", self.perfvote_factor, 0, MAX_PERCENT)?;
        check_range("newcomer_shift", self.newcomer_shift, 0, 31)?;
        check_range(
            "perf_critical_elevator",
            self.perf_critical_elevator,
            0,
            MAX_PERF_CRITICAL_ELEVATOR,
        )?;
        check_range("big_hammer_limit", self.big_hammer_limit, 1, MAX_BIG_HAMMER)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterTunables {
    pub enabled: bool,
    /// Never switch to the economy cluster.
    pub no_lp: bool,
    pub low_power_ceiling: u32,
    pub lp_up_delay_ms: u64,
    pub lp_down_delay_ms: u64,
}

impl Default for ClusterTunables {
    fn default() -> Self {
        Self {
            enabled: true,
            no_lp: false,
            low_power_ceiling: LOW_POWER_CEILING,
            lp_up_delay_ms: 80,
            lp_down_delay_ms: 800,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreTunables {
    pub min_cores: usize,
    /// 0 means all cores.
    pub max_cores: usize,
    pub manual_hotplug: bool,
    /// Manual on/off state of cores 1.., bit i is core i + 1.
    pub core_state: u32,
}

impl Default for CoreTunables {
    fn default() -> Self {
        Self {
            min_cores: 1,
            max_cores: 0,
            manual_hotplug: false,
            core_state: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Tunables {
    /// User frequency ceiling, 0 for none.
    pub user_cap: u32,
    pub force_policy_max: bool,
    pub enable_overclock: bool,
    pub no_edp_limit: bool,
    pub no_thermal_limit: bool,
    /// Per-core ceiling overrides, 0 keeps the hardware maximum.
    pub cpu_freq_limits: Vec<u32>,
    /// Per-core floor overrides, 0 keeps the platform minimum.
    pub cpu_freq_limits_min: Vec<u32>,
    pub boost_freq: u32,
    pub suspend_cap_freq: u32,
    pub suspend_cap_cores: u32,
    pub power_save_freq: u32,
    pub power_save_cores: u32,
    pub audio_active: bool,
    pub log_hotplugging: bool,
    pub bargain: BargainTunables,
    pub cluster: ClusterTunables,
    pub cores: CoreTunables,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            user_cap: 0,
            force_policy_max: false,
            enable_overclock: false,
            no_edp_limit: false,
            no_thermal_limit: false,
            cpu_freq_limits: vec![],
            cpu_freq_limits_min: vec![],
            boost_freq: BOOST_FREQ,
            suspend_cap_freq: LOW_POWER_CEILING,
            suspend_cap_cores: 2,
            power_save_freq: BOOST_FREQ,
            power_save_cores: 3,
            audio_active: false,
            log_hotplugging: false,
            bargain: BargainTunables::default(),
            cluster: ClusterTunables::default(),
            cores: CoreTunables::default(),
        }
    }
}

impl Tunables {
    /// Hardware maximum of `cpu`.
    pub fn cpu_freq_max(&self, cpu: usize) -> u32 {
        match (self.enable_overclock, cpu) {
            (true, _) => FREQ_MAX_OC,
            (false, 0) => FREQ_MAX_CPU0,
            (false, _) => FREQ_MAX,
        }
    }

    /// Effective ceiling of `cpu`.
    pub fn cpu_freq_limit(&self, cpu: usize) -> u32 {
        match self.cpu_freq_limits.get(cpu) {
            Some(&limit) if limit != 0 => limit,
            _ => self.cpu_freq_max(cpu),
        }
    }

    /// Reject values the decision path cannot work with.
    pub fn validate(&self) -> Result<()> {
        self.bargain.validate()?;
        check_ms("lp_up_delay_ms", self.cluster.lp_up_delay_ms)?;
        check_ms("lp_down_delay_ms", self.cluster.lp_down_delay_ms)
    }

    /// Effective floor of `cpu`.
    pub fn cpu_freq_limit_min(&self, cpu: usize) -> u32 {
        match self.cpu_freq_limits_min.get(cpu) {
            Some(&limit) if limit != 0 => limit,
            _ if self.audio_active => FREQ_MIN_AUDIO,
            _ => FREQ_MIN,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_limits() {
        let mut tun = Tunables::default();
        assert_eq!(tun.cpu_freq_limit(0), 1700000);
        assert_eq!(tun.cpu_freq_limit(2), 1600000);
        tun.cpu_freq_limits = vec![0, 1000000];
        assert_eq!(tun.cpu_freq_limit(1), 1000000);
        assert_eq!(tun.cpu_freq_limit(0), 1700000);
        tun.enable_overclock = true;
        assert_eq!(tun.cpu_freq_limit(3), 1700000);

        assert_eq!(tun.cpu_freq_limit_min(1), 51000);
        tun.audio_active = true;
        assert_eq!(tun.cpu_freq_limit_min(1), 102000);
    }

    #[test]
    fn test_partial_deserialize() {
        let tun: Tunables = serde_json::from_str(r#"{"user_cap": 1000000}"#).unwrap();
        assert_eq!(tun.user_cap, 1000000);
        assert_eq!(tun.bargain, BargainTunables::default());
    }

    #[test]
    fn test_validate() {
        assert!(Tunables::default().validate().is_ok());

        let mut tun = Tunables::default();
        tun.bargain.debounce_up_ms = u64::MAX;
        let err = tun.validate().unwrap_err();
        assert_eq!(crate::GovErrno::of(&err), Some(libc::EINVAL));

        let mut tun = Tunables::default();
        tun.bargain.perf_critical_elevator = u32::MAX;
        assert!(tun.validate().is_err());

        let mut tun = Tunables::default();
        tun.bargain.big_hammer_limit = 0;
        assert!(tun.validate().is_err());

        let mut tun = Tunables::default();
        tun.cluster.lp_down_delay_ms = MAX_INTERVAL_MS + 1;
        assert!(tun.validate().is_err());
    }

    #[test]
    fn test_overhead_past_end() {
        let bt = BargainTunables::default();
        assert_eq!(bt.overhead(0), 10);
        assert_eq!(bt.overhead(12), 0);
    }
}
