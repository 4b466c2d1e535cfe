// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Best-trade bargainer
//!
//! Given the speed the cluster runs at and the speed the governors now ask
//! for, decide whether plugging or unplugging one core gives the same
//! performance for less power than scaling the frequency alone.
//!
//! One bargain works in a few stages:
//!
//! 1. Price the current and the requested operating point with the power
//!    model. Out-of-range speeds or powers skip straight to the idle
//!    stage.
//! 2. Evaluate one core up: load that can move to a new core lowers the
//!    speed this core needs, inflated again by the multi-core overhead.
//! 3. Evaluate one core down: the slowest core's load moves here and onto
//!    the fastest remaining core.
//! 4. Actuate the cheaper decision, or fall back to frequency scaling.
//! 5. Without a decision, scale up by performance votes, overclock, or
//!    shed cores once demand fits the economy cluster.
//!
//! The bargainer only plans and requests. The hotplug itself is performed
//! by a [`HotplugActuator`], which reports back whether the request was
//! taken and which target the requesting core should now hold.

use log::debug;

use crate::cores::CoreCountController;
use crate::debounce::KickerState;
use crate::debounce::Timer;
use crate::limits::FrequencyResolver;
use crate::platform::PowerModel;
use crate::platform::Workload;
use crate::stats::GovernorStats;
use crate::tunables::BargainTunables;
use crate::Cpumask;
use crate::FrequencyTable;
use crate::Relation;

const NSEC_PER_MSEC: u64 = 1_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preference {
    Any,
    Up,
    Down,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
}

/// One core up or down. A down request with `dest` 0 asks for the switch
/// to the economy cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HotplugRequest {
    pub direction: Direction,
    pub dest: usize,
    pub target_speed: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HotplugOutcome {
    pub applied: bool,
    /// Target the requesting core holds from now on.
    pub new_target: u32,
}

impl HotplugOutcome {
    pub fn rejected(current_target: u32) -> Self {
        Self {
            applied: false,
            new_target: current_target,
        }
    }
}

pub trait HotplugActuator {
    fn actuate(&mut self, req: &HotplugRequest, current_target: u32) -> HotplugOutcome;
}

/// Frequency and core-count bounds a bargain has to respect. A frequency
/// of 0 is unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QosBounds {
    pub min_freq: u32,
    pub max_freq: u32,
    pub min_cores: usize,
    pub max_cores: usize,
}

/// Read-only inputs of one bargain.
pub struct BargainInputs<'a> {
    /// Core running the bargain.
    pub cpu: usize,
    pub online: &'a Cpumask,
    pub table: &'a FrequencyTable,
    pub resolver: &'a FrequencyResolver<'a>,
    pub power: &'a dyn PowerModel,
    pub workload: &'a dyn Workload,
    pub tunables: &'a BargainTunables,
    pub bounds: QosBounds,
    /// Speed an overclock boost would run at.
    pub oc_speed: u32,
    /// At or below this speed the load fits the economy cluster.
    pub economy_threshold: u32,
    pub now: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BargainOutcome {
    pub speed: u32,
    /// Fewer cores than required are online, the caller should bring them
    /// up instead.
    pub catchup: bool,
}

/// Working set of one bargain.
#[derive(Debug)]
struct Trade {
    active: usize,
    prev: u32,
    next: u32,
    orig_power: i64,
    diff_power: i64,
    best_diff_power: i64,
    best_speed: u32,
    decision: Option<Direction>,
    dest: usize,
    votes: u32,
    critical: bool,
    bounds: QosBounds,
}

impl Trade {
    /// Core count of the best decision so far, counting only a decision
    /// in direction `other`.
    fn cores_of_best(&self, other: Direction) -> usize {
        match self.decision {
            Some(dir) if dir == other => match dir {
                Direction::Up => self.active + 1,
                Direction::Down => self.active - 1,
            },
            _ => self.active,
        }
    }
}

fn scale(speed: u32, percent: u64) -> u32 {
    (speed as u64 * percent / 100) as u32
}

/// Whether `i_speed` on `i_cpus` cores beats `c_speed` on `c_cpus` cores.
/// The side with fewer cores is credited with the multi-core overhead of
/// every core it lacks.
pub fn better_perf(
    tun: &BargainTunables,
    nr_cpus: usize,
    i_speed: u32,
    i_cpus: usize,
    c_speed: u32,
    c_cpus: usize,
) -> bool {
    if i_cpus == 0 || i_cpus > nr_cpus || c_cpus == 0 || c_cpus > nr_cpus {
        return false;
    }

    let mut i_perf = i_speed as u64 * i_cpus as u64;
    let mut c_perf = c_speed as u64 * c_cpus as u64;
    let mut idx = i_cpus.min(c_cpus) - 1;
    for _ in 0..i_cpus.abs_diff(c_cpus) {
        let inflate = 100 + tun.overhead(idx);
        idx += 1;
        if i_cpus < c_cpus {
            i_perf = i_perf * inflate / 100;
        } else {
            c_perf = c_perf * inflate / 100;
        }
    }
    i_perf > c_perf
}

/// Slowest online core other than core 0, the one to take down first.
pub fn slowest_secondary(online: &Cpumask, targets: &[u32]) -> Option<usize> {
    online
        .iter()
        .filter(|&cpu| cpu != 0)
        .min_by_key(|&cpu| (targets.get(cpu).copied().unwrap_or(0), cpu))
}

pub struct Bargainer<'a> {
    pub inputs: BargainInputs<'a>,
    pub targets: &'a mut [u32],
    pub kicker: &'a mut KickerState,
    pub stats: &'a mut GovernorStats,
}

impl<'a> Bargainer<'a> {
    fn nr_cpus(&self) -> usize {
        self.inputs.online.len()
    }

    fn power_at(&self, speed: u32, cores: usize) -> i64 {
        self.inputs.power.power(speed, cores) as i64
    }

    fn valid_speed(&self, speed: u32) -> bool {
        speed >= self.inputs.tunables.min_hotplug_speed && speed <= self.inputs.table.max()
    }

    fn perf_critical(&self, votes: u32) -> bool {
        let inp = &self.inputs;
        let nr_running = inp.workload.nr_running(inp.cpu);
        let newcomers = nr_running.saturating_sub(inp.workload.tracked_tasks(inp.cpu))
            >> inp.tunables.newcomer_shift.min(31);
        let votes = votes.saturating_add(newcomers);
        votes > 0
            && votes > (nr_running >> 1).saturating_add(inp.tunables.perf_critical_elevator)
    }

    /// Never let a decision starve the fastest other online core.
    fn big_two_adjustment(
        &self,
        speed: u32,
        direction: Direction,
        added: u32,
        exclude: usize,
        active: usize,
    ) -> u32 {
        let inp = &self.inputs;
        let tun = inp.tunables;
        let big = inp
            .online
            .iter()
            .filter(|&cpu| cpu != inp.cpu && cpu != exclude)
            .map(|cpu| self.targets.get(cpu).copied().unwrap_or(0))
            .max();
        let rate = match big {
            Some(rate) => rate,
            None => return speed,
        };

        match direction {
            Direction::Up => {
                let rate = match tun.big_two_overhead_up {
                    true => scale(rate, 100 + tun.overhead(active - 1)),
                    false => rate,
                };
                speed.max(inp.resolver.clamp(rate.saturating_add(added)))
            }
            Direction::Down => {
                let rate = match tun.big_two_overhead_down {
                    true => scale(rate, 100u64.saturating_sub(tun.overhead(active - 2))),
                    false => rate,
                };
                speed.max(rate.saturating_add(added))
            }
        }
    }

    fn accept_if_better(&self, trade: &mut Trade, direction: Direction, speed: u32, dest: usize) {
        let cores = match direction {
            Direction::Up => trade.active + 1,
            Direction::Down => trade.active - 1,
        };
        let diff = self.power_at(speed, cores) - trade.orig_power;
        if !self.inputs.power.valid_power_diff(diff) {
            return;
        }

        let other = match direction {
            Direction::Up => Direction::Down,
            Direction::Down => Direction::Up,
        };
        if trade.votes > 0
            && !better_perf(
                self.inputs.tunables,
                self.nr_cpus(),
                speed,
                cores,
                trade.best_speed,
                trade.cores_of_best(other),
            )
        {
            return;
        }

        let bar = match trade.votes > 0 {
            true => trade.diff_power,
            false => trade.best_diff_power,
        };
        if diff < bar {
            trade.best_diff_power = diff;
            trade.best_speed = speed;
            trade.decision = Some(direction);
            trade.dest = dest;
        }
    }

    fn consider_up(&self, trade: &mut Trade) {
        let inp = &self.inputs;
        let tun = inp.tunables;
        let dest = match CoreCountController::new(self.nr_cpus()).best_core_to_turn_up(inp.online)
        {
            Some(dest) => dest,
            None => return,
        };
        let (total, tradable) = match inp.workload.predict_up(inp.cpu) {
            Some(p) if p.total > 0 && p.tradable <= p.total => (p.total as u64, p.tradable as u64),
            _ => {
                debug!("bargain: cpu_up is a bad trade for cpu{}", inp.cpu);
                return;
            }
        };

        let help_ratio = tradable * 100 / total;
        if help_ratio == 0 && trade.votes == 0 && !trade.critical {
            return;
        }

        let overhead = 100 + tun.overhead(trade.active - 1);
        let mut speed = scale(scale(trade.next, 100 - help_ratio), overhead);
        if speed == 0 {
            speed = tun.min_hotplug_speed;
        }
        let offload = scale(scale(trade.next, help_ratio), overhead);
        speed = speed.max(offload);
        speed = self.big_two_adjustment(speed, Direction::Up, 0, inp.cpu, trade.active);

        if trade.bounds.min_freq != 0 && speed < trade.bounds.min_freq {
            speed = trade.bounds.min_freq;
        }
        if trade.bounds.max_freq != 0 && speed > trade.bounds.max_freq {
            speed = trade.bounds.max_freq;
        }
        speed = inp.table.snap(speed, Relation::RoundDown);
        if speed == 0 {
            return;
        }

        if trade.critical {
            speed = speed.max(trade.next);
            let diff = self.power_at(speed, trade.active + 1) - trade.orig_power;
            trade.best_diff_power = match inp.power.valid_power_diff(diff) {
                true => diff,
                false => inp.power.max_power() as i64 - trade.orig_power,
            };
            trade.best_speed = speed;
            trade.decision = Some(Direction::Up);
            trade.dest = dest;
            return;
        }

        self.accept_if_better(trade, Direction::Up, speed, dest);
    }

    fn consider_down(&self, trade: &mut Trade) {
        let inp = &self.inputs;
        let tun = inp.tunables;
        let dest = match slowest_secondary(inp.online, self.targets) {
            Some(dest) if dest != inp.cpu => dest,
            _ => return,
        };
        let (total, addable) = match inp.workload.predict_down(inp.cpu, dest) {
            Some(p)
                if p.addable <= p.total
                    && !(inp.workload.nr_running(dest) > 0 && p.total == 0) =>
            {
                (p.total as u64, p.addable as u64)
            }
            _ => {
                debug!("bargain: cpu_down is a bad trade for cpu{}", inp.cpu);
                return;
            }
        };

        let ratio = match total > 0 && addable > 0 {
            true => addable * 100 / total,
            false => 0,
        };
        let shrink = 100u64.saturating_sub(tun.overhead(trade.active - 2));
        let transferred = scale(self.targets.get(dest).copied().unwrap_or(0), shrink);

        let mut speed = scale(trade.next, shrink).saturating_add(scale(transferred, ratio));
        speed = self.big_two_adjustment(
            speed,
            Direction::Down,
            scale(transferred, 100u64.saturating_sub(ratio)),
            dest,
            trade.active,
        );

        if trade.bounds.min_freq != 0 && speed < trade.bounds.min_freq {
            speed = trade.bounds.min_freq;
        }
        // The leftover could push the remaining cores past what the chip
        // supports.
        if trade.bounds.max_freq != 0 && speed > trade.bounds.max_freq {
            return;
        }
        speed = inp.table.snap(speed, Relation::RoundDown);
        if speed == 0 || trade.critical {
            return;
        }

        self.accept_if_better(trade, Direction::Down, speed, dest);
    }

    /// Scale the requested speed by the number of performance votes,
    /// staying within the max bound.
    fn perf_votes_scaling(&self, trade: &mut Trade) -> u32 {
        let inp = &self.inputs;
        let factor = inp.tunables.perfvote_factor as u64;
        for k in (1..=trade.votes as u64).rev() {
            let scaled = scale(trade.next, 100 + k * factor);
            if trade.bounds.max_freq != 0 && scaled > trade.bounds.max_freq {
                continue;
            }
            let mut snapped = inp.table.snap(scaled, Relation::RoundUp);
            if trade.bounds.max_freq != 0 && snapped > trade.bounds.max_freq {
                snapped = inp.table.snap(trade.bounds.max_freq, Relation::RoundDown);
            }
            if snapped == 0 {
                return trade.next;
            }
            trade.best_diff_power = self.power_at(snapped, trade.active) - trade.orig_power;
            trade.best_speed = snapped;
            return snapped;
        }
        trade.next
    }

    /// Exponentially backed off overclock when the core is pinned at the
    /// max bound and still critical. Returns the boost speed.
    fn resolve_perf_low_by_oc(&mut self, trade: &Trade) -> Option<u32> {
        let inp = &self.inputs;
        let oc = &mut self.kicker.overclock;

        if oc.cpu == Some(inp.cpu) && trade.votes == 0 {
            oc.big_hammer >>= 1;
            if oc.big_hammer == 0 {
                oc.big_hammer = 1;
                oc.cpu = None;
            }
            return None;
        }

        if !trade.critical || trade.prev != trade.next || trade.prev != trade.bounds.max_freq {
            return None;
        }
        if inp.oc_speed <= trade.prev {
            return None;
        }

        if let Some(holder) = oc.cpu {
            if !inp.online.test_cpu(holder) || inp.workload.perf_votes(holder) == 0 {
                oc.cpu = None;
                oc.big_hammer = 1;
            }
        }
        oc.big_hammer = oc.big_hammer.min(inp.tunables.big_hammer_limit);

        let interval = inp
            .tunables
            .overclock_base_ms
            .saturating_mul(NSEC_PER_MSEC)
            .saturating_mul(oc.big_hammer as u64);
        if !self.kicker.clock.ready(Timer::Overclock, interval, inp.now) {
            return None;
        }
        let oc = &mut self.kicker.overclock;
        oc.cpu = Some(inp.cpu);
        oc.big_hammer = oc.big_hammer.saturating_mul(2);
        self.kicker.clock.stamp(Timer::Overclock, inp.now);
        Some(inp.oc_speed)
    }

    fn actuate(
        &mut self,
        actuator: &mut dyn HotplugActuator,
        direction: Direction,
        dest: usize,
        speed: u32,
    ) -> bool {
        let cpu = self.inputs.cpu;
        let req = HotplugRequest {
            direction,
            dest,
            target_speed: speed,
        };
        let outcome = actuator.actuate(&req, self.targets[cpu]);
        self.kicker.clock.stamp(Timer::Hotplug, self.inputs.now);
        if !outcome.applied {
            self.stats.hotplug_failures += 1;
            return false;
        }
        self.targets[cpu] = outcome.new_target;
        match direction {
            Direction::Up => self.stats.hotplug_up += 1,
            Direction::Down => self.stats.hotplug_down += 1,
        }
        true
    }

    /// Bargain between `prev` and `next` and return the speed to run at.
    /// The admission flag is owned by the caller.
    pub fn bargain(
        &mut self,
        prev: u32,
        next: u32,
        pref: Preference,
        actuator: &mut dyn HotplugActuator,
    ) -> BargainOutcome {
        let tun = self.inputs.tunables;
        let cpu = self.inputs.cpu;
        let active = self.inputs.online.weight();
        let kick = self.kicker.clock.get(Timer::Kick);
        let up_interval = tun.debounce_up_ms.saturating_mul(NSEC_PER_MSEC);
        let down_interval = tun.debounce_down_ms.saturating_mul(NSEC_PER_MSEC);

        if active < self.inputs.bounds.min_cores {
            self.kicker.clock.sync(Timer::Kick, Timer::Hotplug);
            return BargainOutcome {
                speed: next,
                catchup: true,
            };
        }

        let hotplugged = self.kicker.clock.get(Timer::Hotplug);
        if !tun.enabled
            || (hotplugged != 0
                && self
                    .kicker
                    .clock
                    .within(Timer::Hotplug, up_interval.min(down_interval), kick))
        {
            self.stats.bargain_skips += 1;
            return BargainOutcome {
                speed: next,
                catchup: false,
            };
        }
        self.stats.bargains += 1;

        let mut bounds = self.inputs.bounds;
        if bounds.max_freq != 0 && bounds.min_freq > bounds.max_freq {
            bounds.min_freq = bounds.max_freq;
        }
        let orig_power = self.power_at(prev, active);
        let diff_power = self.power_at(next, active) - orig_power;
        let votes = self.inputs.workload.perf_votes(cpu);
        let mut trade = Trade {
            active,
            prev,
            next,
            orig_power,
            diff_power,
            best_diff_power: diff_power,
            best_speed: next,
            decision: None,
            dest: 0,
            votes,
            critical: self.perf_critical(votes),
            bounds,
        };
        let mut scaled = next;

        let tradable = self.valid_speed(prev)
            && self.valid_speed(next)
            && self.inputs.power.valid_power(orig_power.max(0) as u32)
            && self.inputs.power.valid_power_diff(diff_power);

        if tradable {
            if tun.min_hotplug_speed <= trade.bounds.max_freq
                && tun.min_hotplug_speed > trade.bounds.min_freq
            {
                trade.bounds.min_freq = tun.min_hotplug_speed;
            }

            if matches!(pref, Preference::Any | Preference::Up)
                && active < self.nr_cpus()
                && active < trade.bounds.max_cores
                && self.kicker.clock.ready(Timer::Hotplug, up_interval, kick)
            {
                self.consider_up(&mut trade);
            }

            if matches!(pref, Preference::Any | Preference::Down)
                && active > trade.bounds.min_cores.max(1)
                && self.kicker.clock.ready(Timer::Hotplug, down_interval, kick)
            {
                self.consider_down(&mut trade);
            }

            if tun.relax
                && self
                    .kicker
                    .clock
                    .ready(Timer::Hotplug, up_interval.max(down_interval), kick)
            {
                self.kicker.clock.sync(Timer::Kick, Timer::Hotplug);
            }

            if let Some(direction) = trade.decision {
                if !self.actuate(actuator, direction, trade.dest, trade.best_speed) {
                    return BargainOutcome {
                        speed: next,
                        catchup: false,
                    };
                }
            }

            if trade.decision.is_none() && tun.perfvote_factor > 0 && trade.votes > 0 {
                scaled = self.perf_votes_scaling(&mut trade);
                // Staying on the performance cluster is cheaper than
                // bouncing through the economy one.
                if scaled >= self.inputs.economy_threshold {
                    if scaled > self.targets[cpu] {
                        self.targets[cpu] = scaled;
                    }
                    if scaled != next {
                        self.stats.vote_scalings += 1;
                    }
                } else {
                    scaled = next;
                    trade.best_speed = next;
                }
            }

            debug!(
                "bargain cpu{}: votes={} critical={} ({} -> {} kHz) x{} -> {:?} core{} at {} kHz ({:+} mW)",
                cpu,
                trade.votes,
                trade.critical,
                prev,
                next,
                active,
                trade.decision,
                trade.dest,
                trade.best_speed,
                trade.best_diff_power - trade.diff_power,
            );
        }

        if pref == Preference::Any && trade.decision.is_none() && scaled == next {
            let threshold = self.inputs.economy_threshold;
            if tun.overclock {
                if let Some(oc_speed) = self.resolve_perf_low_by_oc(&trade) {
                    debug!("cpu{}: oc boost ({} -> {})", cpu, next, oc_speed);
                    self.stats.overclock_boosts += 1;
                    return BargainOutcome {
                        speed: oc_speed,
                        catchup: false,
                    };
                }
            }

            if active > 1 && active > trade.bounds.min_cores && next <= threshold {
                if let Some(dest) = slowest_secondary(self.inputs.online, self.targets) {
                    if dest != cpu && !trade.critical {
                        self.actuate(actuator, Direction::Down, dest, next);
                    }
                }
            } else if active == 1 && next <= threshold {
                let lp_interval = tun.debounce_lp_ms.saturating_mul(NSEC_PER_MSEC);
                if self.kicker.clock.claim_lp_ticket(self.inputs.now, lp_interval) {
                    self.actuate(actuator, Direction::Down, 0, next);
                }
            }
        }

        BargainOutcome {
            speed: trade.best_speed,
            catchup: false,
        }
    }
}
