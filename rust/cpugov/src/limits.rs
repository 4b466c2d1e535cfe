// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Limits
//!
//! Independent sources of frequency and core-count constraints, and the
//! resolver folding them into one admissible frequency.
//!
//! QoS requests are aggregated per class: floors by their maximum and
//! ceilings by their minimum. A request of 0 never constrains anything.
//! Once per decision cycle the governor captures a [`LimitSnapshot`] of all
//! sources and hands it to a [`FrequencyResolver`], which applies the
//! pipeline in a fixed order:
//!
//! 1. QoS floor, then QoS ceiling.
//! 2. Thermal throttle ceiling.
//! 3. EDP ceiling.
//! 4. User cap.
//!
//! and finally snaps the result to the frequency table.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

use crate::FrequencyTable;
use crate::Relation;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum QosClass {
    FreqMin,
    FreqMax,
    MinCores,
    MaxCores,
}

impl QosClass {
    fn is_floor(self) -> bool {
        matches!(self, QosClass::FreqMin | QosClass::MinCores)
    }
}

/// Handle of a registered QoS request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QosRequest {
    class: QosClass,
    id: u64,
}

impl QosRequest {
    pub fn class(&self) -> QosClass {
        self.class
    }
}

#[derive(Debug, Default)]
pub struct PmQos {
    requests: BTreeMap<QosRequest, u32>,
    next_id: u64,
}

impl PmQos {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, class: QosClass, value: u32) -> QosRequest {
        let req = QosRequest {
            class,
            id: self.next_id,
        };
        self.next_id += 1;
        self.requests.insert(req, value);
        req
    }

    /// Update `req` and return whether the aggregate of its class changed.
    /// Unknown handles are ignored.
    pub fn update(&mut self, req: &QosRequest, value: u32) -> bool {
        let before = self.value(req.class);
        match self.requests.get_mut(req) {
            Some(slot) => *slot = value,
            None => return false,
        }
        before != self.value(req.class)
    }

    pub fn remove(&mut self, req: &QosRequest) -> bool {
        let before = self.value(req.class);
        self.requests.remove(req);
        before != self.value(req.class)
    }

    /// Aggregate of `class`, 0 when unconstrained.
    pub fn value(&self, class: QosClass) -> u32 {
        let values = self
            .requests
            .iter()
            .filter(|(req, val)| req.class == class && **val != 0)
            .map(|(_, val)| *val);
        let agg = match class.is_floor() {
            true => values.max(),
            false => values.min(),
        };
        agg.unwrap_or(0)
    }
}

/// All caps as read at the start of one decision cycle. Every frequency
/// field is 0 when the source does not constrain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitSnapshot {
    pub user_cap: u32,
    pub thermal_cap: u32,
    pub edp_cap: u32,
    pub qos_min: u32,
    pub qos_max: u32,
    pub min_cores: usize,
    pub max_cores: usize,
}

fn ceil(freq: u32, cap: u32) -> u32 {
    match cap {
        0 => freq,
        cap => freq.min(cap),
    }
}

pub struct FrequencyResolver<'a> {
    table: &'a FrequencyTable,
    limits: &'a LimitSnapshot,
}

impl<'a> FrequencyResolver<'a> {
    pub fn new(table: &'a FrequencyTable, limits: &'a LimitSnapshot) -> Self {
        Self { table, limits }
    }

    pub fn limits(&self) -> &LimitSnapshot {
        self.limits
    }

    /// Run the capping pipeline without snapping.
    pub fn clamp(&self, requested: u32) -> u32 {
        let lim = self.limits;
        let mut freq = requested;
        if lim.qos_min != 0 && freq < lim.qos_min {
            freq = lim.qos_min;
        }
        freq = ceil(freq, lim.qos_max);
        freq = ceil(freq, lim.thermal_cap);
        freq = ceil(freq, lim.edp_cap);
        ceil(freq, lim.user_cap)
    }

    /// Only the thermal and EDP ceilings. Used while suspended.
    pub fn hard_clamp(&self, requested: u32) -> u32 {
        ceil(ceil(requested, self.limits.thermal_cap), self.limits.edp_cap)
    }

    /// Tightest ceiling of all sources, u32::MAX when none applies.
    pub fn ceiling(&self) -> u32 {
        let lim = self.limits;
        [lim.qos_max, lim.thermal_cap, lim.edp_cap, lim.user_cap]
            .into_iter()
            .filter(|&cap| cap != 0)
            .min()
            .unwrap_or(u32::MAX)
    }

    /// Resolve `requested` to a table entry. The entry never exceeds the
    /// tightest ceiling and never falls below the QoS floor, as long as the
    /// table has an entry between the two. Conflicting floors give way to
    /// ceilings. Returns 0 when the table is empty or has no entry at or
    /// below the tightest ceiling.
    pub fn resolve(&self, requested: u32, relation: Relation) -> u32 {
        if self.table.is_empty() {
            return 0;
        }
        let ceiling = self.ceiling();
        if ceiling < self.table.min() {
            return 0;
        }
        let floor = self.limits.qos_min.min(ceiling);

        let mut freq = self.table.snap(self.clamp(requested), relation);
        if freq > ceiling {
            freq = self.table.snap(ceiling, Relation::RoundDown);
        } else if freq < floor {
            let up = self.table.snap(floor, Relation::RoundUp);
            if up <= ceiling {
                freq = up;
            }
        }
        freq
    }
}
