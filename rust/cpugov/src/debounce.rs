// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

/// Named timestamps gating the bargainer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timer {
    /// Last time a core was admitted to bargain.
    Kick,
    /// Last hotplug decision, successful or not.
    Hotplug,
    /// Arms the economy-cluster ticket.
    LpKick,
    /// Last overclock boost.
    Overclock,
}

impl Timer {
    fn idx(self) -> usize {
        match self {
            Timer::Kick => 0,
            Timer::Hotplug => 1,
            Timer::LpKick => 2,
            Timer::Overclock => 3,
        }
    }
}

/// All bargain debounce state in one place. Timestamps are monotonic
/// nanoseconds, 0 meaning never.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DebounceClock {
    stamps: [u64; 4],
}

impl DebounceClock {
    pub fn get(&self, timer: Timer) -> u64 {
        self.stamps[timer.idx()]
    }

    pub fn stamp(&mut self, timer: Timer, now: u64) {
        self.stamps[timer.idx()] = now;
    }

    /// Copy the timestamp of `from` into `to`.
    pub fn sync(&mut self, from: Timer, to: Timer) {
        self.stamps[to.idx()] = self.stamps[from.idx()];
    }

    /// `at` lies strictly after `timer` + `interval`.
    pub fn ready(&self, timer: Timer, interval: u64, at: u64) -> bool {
        at > self.get(timer).saturating_add(interval)
    }

    /// `at` lies strictly before `timer` + `interval`.
    pub fn within(&self, timer: Timer, interval: u64, at: u64) -> bool {
        at < self.get(timer).saturating_add(interval)
    }

    /// Ticket for switching to the economy cluster. The first claim after a
    /// hotplug only arms the ticket, a later claim succeeds once `interval`
    /// has passed since arming.
    pub fn claim_lp_ticket(&mut self, now: u64, interval: u64) -> bool {
        if self.get(Timer::LpKick) < self.get(Timer::Hotplug) {
            self.stamp(Timer::LpKick, now);
            return false;
        }
        self.ready(Timer::LpKick, interval, now)
    }
}

/// Exponential backoff of overclock boosts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverclockState {
    /// Core holding the current boost.
    pub cpu: Option<usize>,
    /// Multiplier of the base interval between boosts.
    pub big_hammer: u32,
}

impl Default for OverclockState {
    fn default() -> Self {
        Self {
            cpu: None,
            big_hammer: 1,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct KickerState {
    pub kick_cpu: Option<usize>,
    pub clock: DebounceClock,
    pub overclock: OverclockState,
}

/// Wait-free admission to the bargainer. Only one core at a time holds the
/// flag, the guard releases it on every exit path.
#[derive(Debug, Default)]
pub struct AdmissionFlag {
    kicking: AtomicBool,
}

pub struct AdmissionGuard<'a> {
    kicking: &'a AtomicBool,
}

impl AdmissionFlag {
    pub fn try_acquire(&self) -> Option<AdmissionGuard<'_>> {
        self.kicking
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| AdmissionGuard {
                kicking: &self.kicking,
            })
    }

    pub fn is_held(&self) -> bool {
        self.kicking.load(Ordering::Acquire)
    }
}

impl Drop for AdmissionGuard<'_> {
    fn drop(&mut self) {
        self.kicking.store(false, Ordering::Release);
    }
}
