// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # EDP governor
//!
//! Electrical design point limits: for the current thermal zone and the
//! number of online cores, the highest frequency the supply can sustain.
//! The tables themselves come from the platform as plain data.

use anyhow::bail;
use anyhow::Result;
use log::debug;
use log::warn;
use serde::Deserialize;
use serde::Serialize;

use crate::Cpumask;
use crate::FrequencyTable;

/// Ceilings for one thermal zone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdpLimit {
    /// Lower temperature bound of the zone.
    pub temperature: i32,
    /// Ceiling indexed by online core count - 1.
    pub freq_limits: Vec<u32>,
    /// Ceilings used instead of freq_limits with overclock enabled.
    #[serde(default)]
    pub freq_limits_oc: Vec<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EdpTables {
    /// Zones in ascending temperature order.
    pub limits: Vec<EdpLimit>,
    /// System-wide ceilings applied while the alarm is asserted, indexed by
    /// online core count - 1.
    pub system_limits: Vec<u32>,
}

impl EdpTables {
    pub fn is_empty(&self) -> bool {
        self.limits.is_empty()
    }
}

fn by_cores(limits: &[u32], cores: usize) -> Option<u32> {
    if limits.is_empty() {
        return None;
    }
    let idx = cores.clamp(1, limits.len()) - 1;
    Some(limits[idx])
}

#[derive(Debug)]
pub struct EdpGovernor {
    tables: EdpTables,
    zone: usize,
    alarm: bool,
    online: Cpumask,
    limit: u32,
    overclock: bool,
}

impl EdpGovernor {
    pub fn new(tables: EdpTables, online: Cpumask) -> Result<Self> {
        if tables.limits.is_empty() {
            bail!("EDP tables have no thermal zones");
        }
        for (i, zone) in tables.limits.iter().enumerate() {
            if zone.freq_limits.is_empty() {
                bail!("EDP zone {} has no frequency limits", i);
            }
            if i > 0 && zone.temperature <= tables.limits[i - 1].temperature {
                bail!("EDP zones are not in ascending temperature order");
            }
        }

        Ok(Self {
            tables,
            zone: 0,
            alarm: false,
            online,
            limit: 0,
            overclock: false,
        })
    }

    /// Zone for `temp`: the highest zone whose bound `temp` reached, zone 0
    /// below the first bound.
    pub fn zone_for(&self, temp: i32) -> usize {
        self.tables
            .limits
            .iter()
            .rposition(|zone| temp >= zone.temperature)
            .unwrap_or(0)
    }

    pub fn zone(&self) -> usize {
        self.zone
    }

    pub fn set_temperature(&mut self, temp: i32) {
        let zone = self.zone_for(temp);
        if zone != self.zone {
            debug!("EDP: temperature {} moves zone {} -> {}", temp, self.zone, zone);
        }
        self.zone = zone;
    }

    pub fn set_alarm(&mut self, alarm: bool) {
        self.alarm = alarm;
    }

    pub fn alarm(&self) -> bool {
        self.alarm
    }

    pub fn set_overclock(&mut self, overclock: bool) {
        self.overclock = overclock;
    }

    pub fn online(&self) -> &Cpumask {
        &self.online
    }

    pub fn set_online(&mut self, cpu: usize, online: bool) -> Result<()> {
        self.online.assign_cpu(cpu, online)
    }

    pub fn reset_online(&mut self, online: Cpumask) {
        self.online = online;
    }

    /// Ceiling for `cores` online cores in the current zone, before table
    /// snapping.
    pub fn predict_limit(&self, cores: usize) -> u32 {
        let zone = &self.tables.limits[self.zone];
        let zone_limits = match self.overclock && !zone.freq_limits_oc.is_empty() {
            true => &zone.freq_limits_oc,
            false => &zone.freq_limits,
        };
        let mut limit = by_cores(zone_limits, cores).unwrap_or(0);

        if self.alarm {
            if let Some(sys) = by_cores(&self.tables.system_limits, cores) {
                limit = limit.min(sys);
            }
        }
        limit
    }

    fn nr_limits(&self) -> usize {
        let zone = &self.tables.limits[self.zone];
        match self.overclock && !zone.freq_limits_oc.is_empty() {
            true => zone.freq_limits_oc.len(),
            false => zone.freq_limits.len(),
        }
    }

    /// Whether going from `n` to `n + 1` cores adds throughput once each
    /// extra core costs `mp_overhead` percent.
    pub fn favor_up(&self, n: usize, mp_overhead: u32) -> bool {
        if n == 0 {
            return true;
        }
        if n >= self.nr_limits() {
            return false;
        }
        let current = self.predict_limit(n) as u64;
        let next = self.predict_limit(n + 1) as u64;
        next * (n as u64 + 1) >= current * n as u64 * (100 + mp_overhead as u64) / 100
    }

    /// Whether going from `n` to `n - 1` cores adds throughput under the
    /// same overhead.
    pub fn favor_down(&self, n: usize, mp_overhead: u32) -> bool {
        if n <= 1 {
            return false;
        }
        if n > self.nr_limits() {
            return true;
        }
        let current = self.predict_limit(n) as u64;
        let next = self.predict_limit(n - 1) as u64;
        next * (n as u64 - 1) * (100 + mp_overhead as u64) / 100 > current * n as u64
    }

    /// Recompute the limit for the current online mask, snapped down to the
    /// table.
    pub fn update_limit(&mut self, table: &FrequencyTable) {
        let limit = self.predict_limit(self.online.weight());
        if limit < table.min() {
            warn!(
                "EDP: limit {} is below the lowest frequency {}",
                limit,
                table.min()
            );
        }
        self.limit = table.round_down_entry(limit);
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }
}

/// How the EDP stage of the pipeline is provided.
#[derive(Debug)]
pub enum FrequencyCapper {
    /// No EDP tables on this platform.
    Null,
    Edp(EdpGovernor),
}

impl FrequencyCapper {
    pub fn limit(&self) -> u32 {
        match self {
            FrequencyCapper::Null => 0,
            FrequencyCapper::Edp(edp) => edp.limit(),
        }
    }

    /// Without EDP tables more cores never lose throughput.
    pub fn favor_up(&self, n: usize, mp_overhead: u32) -> bool {
        match self {
            FrequencyCapper::Null => true,
            FrequencyCapper::Edp(edp) => edp.favor_up(n, mp_overhead),
        }
    }

    pub fn favor_down(&self, n: usize, mp_overhead: u32) -> bool {
        match self {
            FrequencyCapper::Null => false,
            FrequencyCapper::Edp(edp) => edp.favor_down(n, mp_overhead),
        }
    }

    /// Cap `requested` by the current limit.
    pub fn cap(&self, requested: u32) -> u32 {
        match self.limit() {
            0 => requested,
            limit => requested.min(limit),
        }
    }

    pub fn edp_mut(&mut self) -> Option<&mut EdpGovernor> {
        match self {
            FrequencyCapper::Null => None,
            FrequencyCapper::Edp(edp) => Some(edp),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tables() -> EdpTables {
        EdpTables {
            limits: vec![
                EdpLimit {
                    temperature: 23,
                    freq_limits: vec![1700000, 1600000, 1500000, 1400000],
                    freq_limits_oc: vec![],
                },
                EdpLimit {
                    temperature: 60,
                    freq_limits: vec![1500000, 1400000, 1300000, 1200000],
                    freq_limits_oc: vec![1700000, 1600000, 1500000, 1450000],
                },
                EdpLimit {
                    temperature: 75,
                    freq_limits: vec![1300000, 1200000, 1100000, 1000000],
                    freq_limits_oc: vec![],
                },
            ],
            system_limits: vec![1000000, 900000, 800000, 700000],
        }
    }

    fn online(n: usize) -> Cpumask {
        let mut mask = Cpumask::new(4);
        for cpu in 0..n {
            mask.set_cpu(cpu).unwrap();
        }
        mask
    }

    #[test]
    fn test_zone_ladder() {
        let edp = EdpGovernor::new(tables(), online(1)).unwrap();
        assert_eq!(edp.zone_for(0), 0);
        assert_eq!(edp.zone_for(23), 0);
        assert_eq!(edp.zone_for(59), 0);
        assert_eq!(edp.zone_for(60), 1);
        assert_eq!(edp.zone_for(74), 1);
        assert_eq!(edp.zone_for(120), 2);
    }

    #[test]
    fn test_limit_by_cores_and_alarm() {
        let table = FrequencyTable::reference();
        let mut edp = EdpGovernor::new(tables(), online(2)).unwrap();
        edp.update_limit(&table);
        assert_eq!(edp.limit(), 1600000);

        edp.set_temperature(80);
        edp.update_limit(&table);
        assert_eq!(edp.limit(), 1200000);

        edp.set_alarm(true);
        edp.update_limit(&table);
        assert_eq!(edp.limit(), 860000);

        edp.set_online(1, false).unwrap();
        edp.update_limit(&table);
        assert_eq!(edp.limit(), 1000000);
    }

    #[test]
    fn test_overclock_table() {
        let table = FrequencyTable::reference();
        let mut edp = EdpGovernor::new(tables(), online(4)).unwrap();
        edp.set_temperature(65);
        edp.set_overclock(true);
        edp.update_limit(&table);
        assert_eq!(edp.limit(), 1400000);

        // No overclock variant in this zone.
        edp.set_temperature(90);
        edp.update_limit(&table);
        assert_eq!(edp.limit(), 1000000);
    }

    #[test]
    fn test_favor_core_count() {
        let mut edp = EdpGovernor::new(tables(), online(1)).unwrap();
        assert!(edp.favor_up(0, 10));
        assert!(edp.favor_up(1, 10));
        assert!(edp.favor_up(3, 10));
        assert!(!edp.favor_up(3, 30));
        assert!(!edp.favor_up(4, 0));
        assert!(!edp.favor_down(1, 10));
        assert!(!edp.favor_down(2, 10));
        assert!(edp.favor_down(5, 0));

        // Alarm limits shrink the gain of the last core.
        edp.set_temperature(80);
        edp.set_alarm(true);
        assert!(!edp.favor_up(3, 50));
        assert!(edp.favor_down(4, 50));
    }

    #[test]
    fn test_rejects_bad_tables() {
        assert!(EdpGovernor::new(EdpTables::default(), online(1)).is_err());
        let mut bad = tables();
        bad.limits.swap(0, 1);
        assert!(EdpGovernor::new(bad, online(1)).is_err());
    }

    #[test]
    fn test_null_capper() {
        let capper = FrequencyCapper::Null;
        assert_eq!(capper.cap(1234), 1234);
        let mut edp = EdpGovernor::new(tables(), online(1)).unwrap();
        edp.update_limit(&FrequencyTable::reference());
        let capper = FrequencyCapper::Edp(edp);
        assert_eq!(capper.cap(1800000), 1700000);
    }
}
