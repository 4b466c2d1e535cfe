// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Core masks
//!
//! A fixed-width bitmask of core ids. The governor sizes every mask to the
//! platform core count it was built for, so unlike a host-wide cpumask the
//! width travels with the value.
//!
//! ```rust
//! use cpugov::Cpumask;
//! let mut mask = Cpumask::new(4);
//! mask.set_cpu(0).unwrap();
//! mask.set_cpu(3).unwrap();
//! assert_eq!(mask.weight(), 2);
//! assert_eq!(format!("{}", mask), "9");
//! ```

use anyhow::bail;
use anyhow::Result;
use bitvec::prelude::*;
use sscanf::sscanf;
use std::fmt;

#[derive(Debug, Eq, Clone, Hash, PartialEq)]
pub struct Cpumask {
    mask: BitVec<u64, Lsb0>,
}

impl Cpumask {
    fn check_cpu(&self, cpu: usize) -> Result<()> {
        if cpu >= self.mask.len() {
            bail!("Invalid CPU {} passed, max {}", cpu, self.mask.len());
        }

        Ok(())
    }

    /// Build a new empty Cpumask covering `nr_cpus` cores.
    pub fn new(nr_cpus: usize) -> Cpumask {
        Cpumask {
            mask: bitvec![u64, Lsb0; 0; nr_cpus],
        }
    }

    /// Build a Cpumask with every core set.
    pub fn full(nr_cpus: usize) -> Cpumask {
        Cpumask {
            mask: bitvec![u64, Lsb0; 1; nr_cpus],
        }
    }

    /// Build a Cpumask from a kernel cpulist string such as "0-3,6".
    pub fn from_cpulist(cpulist: &str, nr_cpus: usize) -> Result<Cpumask> {
        let mut mask = Cpumask::new(nr_cpus);
        for cpu in read_cpulist(cpulist)? {
            mask.set_cpu(cpu)?;
        }

        Ok(mask)
    }

    /// Set a bit in the Cpumask. Returns an error if the specified CPU exceeds
    /// the size of the Cpumask.
    pub fn set_cpu(&mut self, cpu: usize) -> Result<()> {
        self.check_cpu(cpu)?;
        self.mask.set(cpu, true);
        Ok(())
    }

    /// Clear a bit from the Cpumask. Returns an error if the specified CPU
    /// exceeds the size of the Cpumask.
    pub fn clear_cpu(&mut self, cpu: usize) -> Result<()> {
        self.check_cpu(cpu)?;
        self.mask.set(cpu, false);
        Ok(())
    }

    pub fn assign_cpu(&mut self, cpu: usize, online: bool) -> Result<()> {
        match online {
            true => self.set_cpu(cpu),
            false => self.clear_cpu(cpu),
        }
    }

    /// Test whether the specified CPU bit is set in the Cpumask. Out of range
    /// CPUs read as clear.
    pub fn test_cpu(&self, cpu: usize) -> bool {
        match self.mask.get(cpu) {
            Some(bit) => *bit,
            None => false,
        }
    }

    /// Count the number of bits set in the Cpumask.
    pub fn weight(&self) -> usize {
        self.mask.count_ones()
    }

    pub fn is_empty(&self) -> bool {
        self.mask.not_any()
    }

    /// The total width of the mask.
    pub fn len(&self) -> usize {
        self.mask.len()
    }

    /// First set bit strictly above `cpu`.
    pub fn next_set(&self, cpu: usize) -> Option<usize> {
        self.iter().find(|&c| c > cpu)
    }

    /// Iterate over the indices of set bits in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.mask.iter_ones()
    }
}

pub fn read_cpulist(cpulist: &str) -> Result<Vec<usize>> {
    let cpulist = cpulist.trim_end_matches('\0').trim();
    let mut cpu_ids = vec![];
    if cpulist.is_empty() {
        return Ok(cpu_ids);
    }
    for group in cpulist.split(',') {
        let (min, max) = match sscanf!(group.trim(), "{usize}-{usize}") {
            Ok((x, y)) => (x, y),
            Err(_) => match sscanf!(group.trim(), "{usize}") {
                Ok(x) => (x, x),
                Err(_) => {
                    bail!("Failed to parse cpulist {}", group.trim());
                }
            },
        };
        cpu_ids.extend(min..=max);
    }

    Ok(cpu_ids)
}

impl fmt::Display for Cpumask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Build the words from live bits only, the raw storage may carry
        // stray bits past len().
        let mut words = vec![0u64; self.mask.len().div_ceil(64).max(1)];
        for cpu in self.mask.iter_ones() {
            words[cpu / 64] |= 1 << (cpu % 64);
        }
        let mut iter = words.iter().rev().skip_while(|w| **w == 0);
        match iter.next() {
            None => write!(f, "0"),
            Some(top) => {
                write!(f, "{:x}", top)?;
                for word in iter {
                    write!(f, ",{:016x}", word)?;
                }
                Ok(())
            }
        }
    }
}
