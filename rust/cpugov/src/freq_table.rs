// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Frequency table
//!
//! The ordered set of operating frequencies (kHz) the cluster clock
//! supports. Every frequency the governor commits is snapped to one of
//! these entries.

use anyhow::bail;
use anyhow::Result;
use serde::Deserialize;
use serde::Serialize;

/// Frequencies of the reference platform in kHz.
pub const REFERENCE_FREQS: [u32; 16] = [
    51000, 102000, 204000, 340000, 475000, 640000, 760000, 860000, 1000000, 1100000, 1200000,
    1300000, 1400000, 1500000, 1600000, 1700000,
];

/// How a target that falls between two table entries is snapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Relation {
    /// Smallest entry at or above the target.
    RoundUp,
    /// Largest entry at or below the target.
    RoundDown,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FrequencyTable {
    freqs: Vec<u32>,
}

impl FrequencyTable {
    /// Build a table from the given frequencies. Order does not matter but
    /// the entries must be non-zero and distinct.
    pub fn new(mut freqs: Vec<u32>) -> Result<Self> {
        if freqs.is_empty() {
            bail!("Frequency table is empty");
        }
        if freqs.contains(&0) {
            bail!("Frequency table contains a zero entry");
        }
        freqs.sort_unstable();
        let len = freqs.len();
        freqs.dedup();
        if freqs.len() != len {
            bail!("Frequency table contains duplicate entries");
        }

        Ok(Self { freqs })
    }

    pub fn reference() -> Self {
        Self {
            freqs: REFERENCE_FREQS.to_vec(),
        }
    }

    pub fn len(&self) -> usize {
        self.freqs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.freqs.is_empty()
    }

    pub fn min(&self) -> u32 {
        self.freqs.first().copied().unwrap_or(0)
    }

    pub fn max(&self) -> u32 {
        self.freqs.last().copied().unwrap_or(0)
    }

    pub fn contains(&self, freq: u32) -> bool {
        self.freqs.binary_search(&freq).is_ok()
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.freqs.iter().copied()
    }

    /// Snap `target` to a table entry. When no entry lies on the preferred
    /// side the closest entry on the other side is used instead. An empty
    /// table yields 0.
    pub fn snap(&self, target: u32, relation: Relation) -> u32 {
        self.snap_within(target, 0, u32::MAX, relation)
    }

    /// Like snap() but only entries in `[lo, hi]` are candidates. Yields 0
    /// when no entry falls in the range.
    pub fn snap_within(&self, target: u32, lo: u32, hi: u32, relation: Relation) -> u32 {
        let mut candidates = self.freqs.iter().copied().filter(|&f| f >= lo && f <= hi);
        let (mut optimal, mut fallback): (Option<u32>, Option<u32>) = (None, None);

        match relation {
            Relation::RoundUp => {
                for freq in candidates.by_ref() {
                    if freq >= target {
                        optimal = Some(freq);
                        break;
                    }
                    fallback = Some(freq);
                }
            }
            Relation::RoundDown => {
                for freq in candidates.by_ref() {
                    if freq <= target {
                        optimal = Some(freq);
                    } else {
                        if optimal.is_none() {
                            fallback = Some(freq);
                        }
                        break;
                    }
                }
            }
        }

        optimal.or(fallback).unwrap_or(0)
    }

    /// Largest entry at or below `freq`, or the lowest entry when `freq` is
    /// below the whole table.
    pub fn round_down_entry(&self, freq: u32) -> u32 {
        match self.freqs.iter().rev().find(|&&f| f <= freq) {
            Some(f) => *f,
            None => self.min(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_sorts_and_validates() {
        let table = FrequencyTable::new(vec![300, 100, 200]).unwrap();
        assert_eq!(table.iter().collect::<Vec<_>>(), vec![100, 200, 300]);
        assert!(FrequencyTable::new(vec![]).is_err());
        assert!(FrequencyTable::new(vec![100, 0]).is_err());
        assert!(FrequencyTable::new(vec![100, 100]).is_err());
    }

    #[test]
    fn test_snap_exact_and_between() {
        let table = FrequencyTable::reference();
        assert_eq!(table.snap(1300000, Relation::RoundUp), 1300000);
        assert_eq!(table.snap(1300000, Relation::RoundDown), 1300000);
        assert_eq!(table.snap(500000, Relation::RoundUp), 640000);
        assert_eq!(table.snap(500000, Relation::RoundDown), 475000);
    }

    #[test]
    fn test_snap_falls_back_across() {
        let table = FrequencyTable::reference();
        assert_eq!(table.snap(2000000, Relation::RoundUp), 1700000);
        assert_eq!(table.snap(1000, Relation::RoundDown), 51000);
        assert_eq!(FrequencyTable::default().snap(1000, Relation::RoundUp), 0);
    }

    #[test]
    fn test_snap_within_policy() {
        let table = FrequencyTable::reference();
        assert_eq!(
            table.snap_within(1700000, 102000, 1000000, Relation::RoundUp),
            1000000
        );
        assert_eq!(
            table.snap_within(51000, 102000, 1000000, Relation::RoundDown),
            102000
        );
        assert_eq!(table.snap_within(500000, 490000, 500000, Relation::RoundUp), 0);
    }

    #[test]
    fn test_round_down_entry() {
        let table = FrequencyTable::reference();
        assert_eq!(table.round_down_entry(1250000), 1200000);
        assert_eq!(table.round_down_entry(10), 51000);
    }
}
