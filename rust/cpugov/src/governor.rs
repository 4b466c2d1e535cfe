// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Governor
//!
//! The orchestrator owning every decision component. All frequency
//! decisions are serialized by the state lock and run resolve, bargain and
//! apply in one go. Cluster switches and hotplug are slow and are queued on
//! the [`WorkQueue`], executed by [`Governor::run_pending_work`] or the
//! worker thread under a separate hotplug lock. The lock order is hotplug
//! lock, then state lock.

use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::TryLockError;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use log::debug;
use log::info;
use log::log;
use log::warn;
use log::Level;
use serde::Deserialize;
use serde::Serialize;

use crate::bargain::BargainInputs;
use crate::bargain::BargainOutcome;
use crate::bargain::Bargainer;
use crate::bargain::Direction;
use crate::bargain::HotplugActuator;
use crate::bargain::HotplugOutcome;
use crate::bargain::HotplugRequest;
use crate::bargain::Preference;
use crate::bargain::QosBounds;
use crate::cluster::switch_to_economy;
use crate::cluster::switch_to_performance;
use crate::cluster::ClusterInputs;
use crate::cluster::ClusterSwitch;
use crate::cluster::ClusterSwitchState;
use crate::cores::CoreAction;
use crate::cores::CoreCountController;
use crate::debounce::AdmissionFlag;
use crate::debounce::KickerState;
use crate::debounce::Timer;
use crate::edp::EdpGovernor;
use crate::edp::EdpTables;
use crate::edp::FrequencyCapper;
use crate::errno::busy;
use crate::errno::invalid;
use crate::limits::FrequencyResolver;
use crate::limits::LimitSnapshot;
use crate::limits::PmQos;
use crate::limits::QosClass;
use crate::limits::QosRequest;
use crate::platform::Cluster;
use crate::platform::Platform;
use crate::speed::SpeedChange;
use crate::speed::SpeedUpdater;
use crate::speed::TransitionListener;
use crate::stats::GovernorStats;
use crate::tunables::ClusterTunables;
use crate::tunables::Tunables;
use crate::workqueue::Work;
use crate::workqueue::WorkQueue;
use crate::Cpumask;
use crate::FrequencyTable;
use crate::GovErrno;
use crate::Relation;

/// Longest the worker sleeps when nothing is queued.
const WORKER_IDLE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatingPoint {
    pub frequency: u32,
    pub active_cores: usize,
    pub cluster: Cluster,
}

/// Per-core policy bounds, 0 meaning unset.
#[derive(Debug, Clone, Copy, Default)]
struct CorePolicy {
    min: u32,
    max: u32,
}

/// QoS requests the governor registers on its own behalf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum OwnRequest {
    ScreenOffFreq,
    ScreenOffCores,
    Boost,
    PowerSaveFreq,
    PowerSaveCores,
}

struct GovernorState {
    targets: Vec<u32>,
    policy: Vec<CorePolicy>,
    kicker: KickerState,
    capper: FrequencyCapper,
    cluster: ClusterSwitch,
    cores: CoreCountController,
    qos: PmQos,
    own: BTreeMap<OwnRequest, QosRequest>,
    tunables: Tunables,
    speed: SpeedUpdater,
    suspended: bool,
    boost_window: bool,
    /// Floor frequency and the monotonic time it expires at.
    boost_floor: (u32, u64),
    screen_on: bool,
    /// Speed the last set_speed_cap resolved, the cluster worker re-checks
    /// its decision against it.
    last_resolved: u32,
    stats: GovernorStats,
}

struct Inner {
    nr_cpus: usize,
    table: FrequencyTable,
    platform: Platform,
    state: Mutex<GovernorState>,
    hotplug_lock: Mutex<()>,
    kicking: AdmissionFlag,
    /// A hotplug requested by the bargainer is queued or running.
    plugging: AtomicBool,
    work: WorkQueue,
}

#[derive(Clone)]
pub struct Governor {
    inner: Arc<Inner>,
}

fn action_level(tun: &Tunables) -> Level {
    match tun.log_hotplugging {
        true => Level::Info,
        false => Level::Debug,
    }
}

fn duration_ns(d: Duration) -> u64 {
    d.as_nanos().min(u64::MAX as u128) as u64
}

/// Hands bargain decisions over to the worker queue.
struct WorkQueueActuator<'a> {
    inner: &'a Inner,
    cluster: &'a mut ClusterSwitch,
    cluster_inputs: ClusterInputs,
    cluster_tunables: &'a ClusterTunables,
    now: u64,
}

impl HotplugActuator for WorkQueueActuator<'_> {
    fn actuate(&mut self, req: &HotplugRequest, current_target: u32) -> HotplugOutcome {
        let applied = match (req.direction, req.dest) {
            (Direction::Down, 0) => {
                let ok = self
                    .cluster
                    .request_economy(&self.cluster_inputs, self.cluster_tunables);
                if ok {
                    self.inner.work.queue(Work::ClusterSwitch, self.now);
                }
                ok
            }
            (dir, cpu) => {
                let up = dir == Direction::Up;
                let hotplug = &self.inner.platform.hotplug;
                if cpu == 0
                    || cpu >= self.inner.nr_cpus
                    || hotplug.is_online(cpu) == up
                    || self.inner.plugging.swap(true, Ordering::AcqRel)
                {
                    false
                } else {
                    self.inner.work.queue(Work::Hotplug { cpu, up }, self.now);
                    true
                }
            }
        };

        match applied {
            true => HotplugOutcome {
                applied: true,
                new_target: req.target_speed,
            },
            false => HotplugOutcome::rejected(current_target),
        }
    }
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, GovernorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn hotplug_guard(&self) -> MutexGuard<'_, ()> {
        self.hotplug_lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn now(&self) -> u64 {
        self.platform.time.now_ns()
    }

    fn check_cpu(&self, cpu: usize) -> Result<()> {
        if cpu >= self.nr_cpus {
            return Err(invalid(format!("cpu {} out of range", cpu)));
        }
        Ok(())
    }

    fn policy_min(&self, st: &GovernorState, cpu: usize) -> u32 {
        let floor = st.tunables.cpu_freq_limit_min(cpu);
        match st.policy.get(cpu) {
            Some(p) => p.min.max(floor),
            None => floor,
        }
    }

    fn policy_max(&self, st: &GovernorState, cpu: usize) -> u32 {
        let ceiling = st.tunables.cpu_freq_limit(cpu);
        match st.policy.get(cpu) {
            Some(p) if p.max != 0 => p.max.min(ceiling),
            _ => ceiling,
        }
    }

    fn policy_max_speed(&self, st: &GovernorState, cpu: usize) -> u32 {
        self.table.snap(self.policy_max(st, cpu), Relation::RoundDown)
    }

    fn limits(&self, st: &GovernorState) -> LimitSnapshot {
        let thermal_cap = match st.tunables.no_thermal_limit {
            true => 0,
            false => match self.platform.thermal.throttle_speed(u32::MAX) {
                u32::MAX => 0,
                cap => cap,
            },
        };
        let edp_cap = match st.tunables.no_edp_limit {
            true => 0,
            false => match st.capper.limit() {
                limit if limit < 1000 => 0,
                limit => limit,
            },
        };
        let (min_cores, max_cores) = st.cores.bounds(
            &st.tunables.cores,
            st.qos.value(QosClass::MinCores),
            st.qos.value(QosClass::MaxCores),
        );
        LimitSnapshot {
            user_cap: st.tunables.user_cap,
            thermal_cap,
            edp_cap,
            qos_min: st.qos.value(QosClass::FreqMin),
            qos_max: st.qos.value(QosClass::FreqMax),
            min_cores,
            max_cores,
        }
    }

    /// Governor floor: the policy minimum of core 0 raised by an unexpired
    /// boost floor.
    fn min_speed(&self, st: &GovernorState, resolver: &FrequencyResolver, now: u64) -> u32 {
        let (floor, until) = st.boost_floor;
        let boost = match floor != 0 && now <= until {
            true => resolver.clamp(floor),
            false => 0,
        };
        self.policy_min(st, 0).max(boost)
    }

    fn cluster_inputs(&self, st: &GovernorState) -> ClusterInputs {
        let clock = &self.platform.clock;
        ClusterInputs {
            on_economy: clock.cluster() == Cluster::Economy,
            has_performance: clock.has_performance_cluster(),
            min_cores: st
                .cores
                .effective_min(&st.tunables.cores, st.qos.value(QosClass::MinCores)),
            nr_online: self.platform.hotplug.nr_online(),
        }
    }

    /// Commit `rate`, snapped down to the table.
    fn update_speed_locked(&self, st: &mut GovernorState, online: &Cpumask, rate: u32) -> Result<()> {
        if st.boost_window {
            return Ok(());
        }
        let rate = self.table.snap(rate, Relation::RoundDown);
        if rate == 0 {
            return Ok(());
        }
        let change = st.speed.update(
            &*self.platform.clock,
            online,
            rate,
            st.tunables.cluster.low_power_ceiling,
        )?;
        if let SpeedChange::Changed { old, new } = change {
            st.stats.speed_updates += 1;
            debug!("speed: {} -> {} kHz", old, new);
        }
        Ok(())
    }

    fn evaluate_cluster_locked(&self, st: &mut GovernorState, freq: u32, suspend: bool, now: u64) {
        let inp = self.cluster_inputs(st);
        if let Some(delay) = st
            .cluster
            .evaluate(freq, suspend, &inp, &st.tunables.cluster)
        {
            self.work
                .queue(Work::ClusterSwitch, now.saturating_add(duration_ns(delay)));
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn bargain_locked(
        &self,
        st: &mut GovernorState,
        resolver: &FrequencyResolver,
        online: &Cpumask,
        cpu: usize,
        prev: u32,
        next: u32,
        pref: Preference,
        now: u64,
    ) -> BargainOutcome {
        let limits = resolver.limits();
        let bounds = QosBounds {
            min_freq: self.min_speed(st, resolver, now),
            max_freq: resolver.clamp(self.policy_max(st, 0)),
            min_cores: limits.min_cores,
            max_cores: limits.max_cores,
        };
        let oc_speed = resolver.hard_clamp(self.policy_max(st, cpu));
        let cluster_inputs = self.cluster_inputs(st);

        let mut actuator = WorkQueueActuator {
            inner: self,
            cluster: &mut st.cluster,
            cluster_inputs,
            cluster_tunables: &st.tunables.cluster,
            now,
        };
        let mut bargainer = Bargainer {
            inputs: BargainInputs {
                cpu,
                online,
                table: &self.table,
                resolver,
                power: &*self.platform.power,
                workload: &*self.platform.workload,
                tunables: &st.tunables.bargain,
                bounds,
                oc_speed,
                economy_threshold: st.tunables.cluster.low_power_ceiling,
                now,
            },
            targets: st.targets.as_mut_slice(),
            kicker: &mut st.kicker,
            stats: &mut st.stats,
        };
        bargainer.bargain(prev, next, pref, &mut actuator)
    }

    fn set_speed_cap_locked(&self, st: &mut GovernorState, cpu: usize) -> Result<u32> {
        let clock = &self.platform.clock;
        let curr = clock.rate();
        let online = self.platform.hotplug.online_mask();
        let now = self.now();
        let limits = self.limits(st);
        let resolver = FrequencyResolver::new(&self.table, &limits);

        let mut highest = online
            .iter()
            .map(|c| st.targets.get(c).copied().unwrap_or(0))
            .max()
            .unwrap_or(0);
        if st.tunables.force_policy_max {
            if let Some(pmax) = online
                .iter()
                .map(|c| self.policy_max_speed(st, c))
                .filter(|&max| max != 0)
                .min()
            {
                highest = highest.min(pmax);
            }
        }

        let mut forced_kick = false;
        let min_speed = self.min_speed(st, &resolver, now);
        if highest < min_speed {
            highest = min_speed;
            forced_kick = cpu == 0;
        }
        let uncapped = highest;

        if st.boost_window {
            return Ok(curr);
        }
        if st.suspended {
            st.stats.busy += 1;
            return Err(busy("governor is suspended"));
        }

        let mut new = resolver.resolve(highest, Relation::RoundUp);
        if new == 0 {
            return Ok(curr);
        }
        st.last_resolved = new;

        if st.tunables.bargain.enabled && clock.cluster() != Cluster::Economy {
            if cpu == 0 && online.weight() > 1 && new < st.tunables.cluster.low_power_ceiling {
                forced_kick = true;
            }
            let requested = st.targets.get(cpu).copied().unwrap_or(0);
            if (requested >= uncapped || forced_kick) && !self.plugging.load(Ordering::Acquire) {
                if let Some(_guard) = self.kicking.try_acquire() {
                    st.kicker.kick_cpu = Some(cpu);
                    st.kicker.clock.stamp(Timer::Kick, now);
                    let before = new;
                    let out = self.bargain_locked(
                        st,
                        &resolver,
                        &online,
                        cpu,
                        curr,
                        new,
                        Preference::Any,
                        now,
                    );
                    if out.catchup {
                        self.work.queue(Work::MinMax, now);
                    }
                    new = out.speed.max(before);
                }
            }
        }

        if curr != new {
            self.update_speed_locked(st, &online, new)?;
        }
        self.evaluate_cluster_locked(st, new, false, now);
        Ok(new)
    }

    fn set_manual_hotplug_locked(&self, st: &mut GovernorState, manual: bool) {
        st.tunables.cores.manual_hotplug = manual;
        let work = match manual {
            true => Work::CoreState,
            false => Work::MinMax,
        };
        self.work.queue(work, self.now());
    }

    /// Pull recorded targets back within the per-core limits after those
    /// changed.
    fn clamp_targets_locked(&self, st: &mut GovernorState) {
        for cpu in 0..self.nr_cpus {
            let target = st.targets[cpu];
            if target == 0 {
                continue;
            }
            let (lo, hi) = (self.policy_min(st, cpu), self.policy_max(st, cpu));
            st.targets[cpu] = target.min(hi).max(lo);
        }
    }

    /// set_speed_cap for callers that only react to a changed input.
    fn refresh_locked(&self, st: &mut GovernorState) {
        match self.set_speed_cap_locked(st, 0) {
            Ok(_) => {}
            Err(e) if GovErrno::is_busy(&e) => debug!("speed refresh skipped: {:#}", e),
            Err(e) => warn!("Failed to refresh speed: {:#}", e),
        }
    }

    fn switch_cluster_locked(&self, st: &mut GovernorState, cluster: Cluster) -> Result<()> {
        let clock = &self.platform.clock;
        if clock.cluster() == cluster {
            return Ok(());
        }
        let ceiling = st.tunables.cluster.low_power_ceiling;
        let res = match cluster {
            Cluster::Performance => switch_to_performance(&**clock, ceiling),
            Cluster::Economy => switch_to_economy(&**clock, ceiling),
        };
        if let Err(e) = res {
            st.stats.cluster_switch_failures += 1;
            return Err(e);
        }

        st.cluster.mark_switched(cluster, self.now());
        match cluster {
            Cluster::Performance => st.stats.cluster_to_performance += 1,
            Cluster::Economy => st.stats.cluster_to_economy += 1,
        }
        log!(action_level(&st.tunables), "cluster: now on {:?}", cluster);

        if !st.suspended {
            self.refresh_locked(st);
        }
        Ok(())
    }

    fn force_performance_locked(&self, st: &mut GovernorState) -> Result<()> {
        if st.tunables.cluster.no_lp {
            return Err(busy("low-power cluster is disabled"));
        }
        if !self.platform.clock.has_performance_cluster() {
            return Err(busy("no performance cluster"));
        }
        if st.cluster.is_disabled() {
            return Err(busy("cluster switching is disabled"));
        }
        self.switch_cluster_locked(st, Cluster::Performance)
            .map_err(|e| e.context(GovErrno(libc::EBUSY)))
    }

    /// Add, update or drop (`value` 0) one of the governor's own QoS
    /// requests.
    fn set_own_request_locked(
        &self,
        st: &mut GovernorState,
        key: OwnRequest,
        class: QosClass,
        value: u32,
    ) -> Result<()> {
        let changed = match (st.own.get(&key).copied(), value) {
            (Some(req), 0) => {
                st.own.remove(&key);
                st.qos.remove(&req)
            }
            (Some(req), value) => st.qos.update(&req, value),
            (None, 0) => false,
            (None, value) => {
                let before = st.qos.value(class);
                let req = st.qos.add(class, value);
                st.own.insert(key, req);
                before != st.qos.value(class)
            }
        };
        match changed {
            true => self.qos_changed_locked(st, class),
            false => Ok(()),
        }
    }

    fn qos_changed_locked(&self, st: &mut GovernorState, class: QosClass) -> Result<()> {
        match class {
            QosClass::FreqMin | QosClass::FreqMax => {
                self.refresh_locked(st);
                Ok(())
            }
            QosClass::MinCores | QosClass::MaxCores => self.cores_changed_locked(st, class),
        }
    }

    fn cores_changed_locked(&self, st: &mut GovernorState, class: QosClass) -> Result<()> {
        if st.tunables.cores.manual_hotplug {
            debug!("cores: manual mode, ignoring {:?} change", class);
            return Ok(());
        }
        let limits = self.limits(st);
        let now = self.now();
        match class {
            QosClass::MinCores => {
                if limits.min_cores >= 2 && self.platform.clock.cluster() == Cluster::Economy {
                    self.switch_cluster_locked(st, Cluster::Performance)
                        .context("Failed to leave the economy cluster for more cores")?;
                }
                self.refresh_locked(st);
                self.work.queue(Work::MinMax, now);
            }
            _ => {
                if limits.max_cores < self.platform.hotplug.nr_online() {
                    self.work.queue(Work::MinMax, now);
                }
            }
        }
        Ok(())
    }

    /// EDP side of bringing `cpu` up. The limit for the new core count is
    /// applied before the core runs.
    fn edp_up_prepare_locked(&self, st: &mut GovernorState, cpu: usize) -> Result<()> {
        match st.capper.edp_mut() {
            Some(edp) => {
                edp.set_online(cpu, true)?;
                edp.update_limit(&self.table);
            }
            None => return Ok(()),
        }

        let curr = self.platform.clock.rate();
        if st.tunables.no_edp_limit || st.capper.cap(curr) >= curr {
            return Ok(());
        }
        if let Err(e) = self.set_speed_cap_locked(st, 0) {
            self.edp_clear_locked(st, cpu);
            return Err(e.context(format!("Failed to apply the EDP limit for cpu {}", cpu)));
        }
        Ok(())
    }

    fn edp_clear_locked(&self, st: &mut GovernorState, cpu: usize) -> bool {
        match st.capper.edp_mut() {
            Some(edp) => {
                if let Err(e) = edp.set_online(cpu, false) {
                    warn!("Failed to clear cpu {} from the EDP mask: {:#}", cpu, e);
                }
                edp.update_limit(&self.table);
                true
            }
            None => false,
        }
    }

    fn edp_dead_locked(&self, st: &mut GovernorState, cpu: usize) {
        if self.edp_clear_locked(st, cpu) {
            self.refresh_locked(st);
        }
    }

    /// Bring `cpu` up. Called without the state lock held.
    fn online_core(&self, cpu: usize) -> Result<()> {
        let level = {
            let mut st = self.state();
            self.edp_up_prepare_locked(&mut st, cpu)?;
            action_level(&st.tunables)
        };
        if let Err(e) = self.platform.hotplug.cpu_up(cpu) {
            let mut st = self.state();
            self.edp_clear_locked(&mut st, cpu);
            return Err(e.context(format!("Failed to bring cpu {} up", cpu)));
        }
        log!(level, "hotplug: cpu {} up", cpu);
        Ok(())
    }

    /// Take `cpu` down. Called without the state lock held.
    fn offline_core(&self, cpu: usize) -> Result<()> {
        self.platform
            .hotplug
            .cpu_down(cpu)
            .with_context(|| format!("Failed to take cpu {} down", cpu))?;
        let mut st = self.state();
        log!(action_level(&st.tunables), "hotplug: cpu {} down", cpu);
        self.edp_dead_locked(&mut st, cpu);
        Ok(())
    }

    /// Run planned core actions in order, stopping at the first failure.
    fn apply_core_actions(&self, actions: Vec<CoreAction>) {
        for action in actions {
            let (res, up) = match action {
                CoreAction::Up(cpu) => (self.online_core(cpu), true),
                CoreAction::Down(cpu) => (self.offline_core(cpu), false),
            };
            let mut st = self.state();
            match res {
                Ok(()) if up => st.stats.hotplug_up += 1,
                Ok(()) => st.stats.hotplug_down += 1,
                Err(e) => {
                    st.stats.hotplug_failures += 1;
                    warn!("{:#}", e);
                    break;
                }
            }
        }
    }

    fn run_cluster_switch(&self) {
        let _hp = self.hotplug_guard();
        let mut st = self.state();
        let inp = self.cluster_inputs(&st);
        let action = st
            .cluster
            .pending_action(st.last_resolved, &inp, &st.tunables.cluster);
        match action {
            Some(cluster) => {
                if let Err(e) = self.switch_cluster_locked(&mut st, cluster) {
                    warn!("Cluster switch to {:?} failed: {:#}", cluster, e);
                }
            }
            None => {
                if st.cluster.state() != ClusterSwitchState::Disabled {
                    debug!("cluster: stale {:?} dropped", st.cluster.state());
                }
            }
        }
    }

    fn run_min_max(&self) {
        let _hp = self.hotplug_guard();
        let actions = {
            let st = self.state();
            if st.cluster.is_disabled()
                || st.tunables.cores.manual_hotplug
                || self.platform.clock.cluster() == Cluster::Economy
            {
                return;
            }
            let limits = self.limits(&st);
            st.cores.reconcile(
                limits.min_cores,
                limits.max_cores,
                &self.platform.hotplug.online_mask(),
            )
        };
        self.apply_core_actions(actions);
    }

    fn run_core_state(&self) {
        let _hp = self.hotplug_guard();
        let actions = {
            let mut st = self.state();
            if !st.tunables.cores.manual_hotplug {
                return;
            }
            let actions = st
                .cores
                .manual_plan(st.tunables.cores.core_state, &self.platform.hotplug.online_mask());
            if actions.iter().any(|a| matches!(a, CoreAction::Up(_))) {
                if let Err(e) = self.switch_cluster_locked(&mut st, Cluster::Performance) {
                    warn!("Manual hotplug needs the performance cluster: {:#}", e);
                    return;
                }
            }
            actions
        };
        self.apply_core_actions(actions);
    }

    fn run_hotplug(&self, cpu: usize, up: bool) {
        let res = {
            let _hp = self.hotplug_guard();
            match (self.platform.hotplug.is_online(cpu) == up, up) {
                (true, _) => Ok(()),
                (false, true) => self.online_core(cpu),
                (false, false) => self.offline_core(cpu),
            }
        };
        self.plugging.store(false, Ordering::Release);
        if let Err(e) = res {
            self.state().stats.hotplug_failures += 1;
            warn!("{:#}", e);
        }
    }

    fn run_pending_work(&self) -> usize {
        let due = self.work.take_due(self.now());
        for work in due.iter() {
            match *work {
                Work::ClusterSwitch => self.run_cluster_switch(),
                Work::MinMax => self.run_min_max(),
                Work::CoreState => self.run_core_state(),
                Work::Hotplug { cpu, up } => self.run_hotplug(cpu, up),
            }
        }
        due.len()
    }
}

fn parse_num<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse::<T>()
        .map_err(|_| invalid(format!("{}: invalid value {:?}", name, value)))
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.trim() {
        "1" | "y" | "Y" | "true" | "on" => Ok(true),
        "0" | "n" | "N" | "false" | "off" => Ok(false),
        _ => Err(invalid(format!("{}: invalid value {:?}", name, value))),
    }
}

fn parse_list(name: &str, value: &str) -> Result<Vec<u32>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(|v| parse_num(name, v))
        .collect()
}

fn format_list(list: &[u32]) -> String {
    list.iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

impl Governor {
    /// Build a governor over `platform`. `edp` carries the EDP tables, if
    /// the platform has any.
    pub fn new(
        table: FrequencyTable,
        platform: Platform,
        tunables: Tunables,
        edp: Option<EdpTables>,
    ) -> Result<Self> {
        let nr_cpus = platform.hotplug.nr_cpus();
        if nr_cpus == 0 {
            return Err(invalid("platform reports no cpus"));
        }
        tunables.validate().context("Invalid tunables")?;
        let online = platform.hotplug.online_mask();

        let capper = match edp {
            Some(tables) if !tables.is_empty() => {
                let mut edp = EdpGovernor::new(tables, online.clone())
                    .context("Failed to set up EDP governor")?;
                edp.set_overclock(tunables.enable_overclock);
                edp.update_limit(&table);
                info!("EDP limit {} kHz for {} cores", edp.limit(), online.weight());
                FrequencyCapper::Edp(edp)
            }
            _ => FrequencyCapper::Null,
        };

        let state = GovernorState {
            targets: vec![0; nr_cpus],
            policy: vec![CorePolicy::default(); nr_cpus],
            kicker: KickerState::default(),
            capper,
            cluster: ClusterSwitch::new(tunables.cluster.enabled),
            cores: CoreCountController::new(nr_cpus),
            qos: PmQos::new(),
            own: BTreeMap::new(),
            tunables,
            speed: SpeedUpdater::new(),
            suspended: false,
            boost_window: false,
            boost_floor: (0, 0),
            screen_on: true,
            last_resolved: 0,
            stats: GovernorStats::default(),
        };

        Ok(Self {
            inner: Arc::new(Inner {
                nr_cpus,
                table,
                platform,
                state: Mutex::new(state),
                hotplug_lock: Mutex::new(()),
                kicking: AdmissionFlag::default(),
                plugging: AtomicBool::new(false),
                work: WorkQueue::new(),
            }),
        })
    }

    pub fn nr_cpus(&self) -> usize {
        self.inner.nr_cpus
    }

    pub fn table(&self) -> &FrequencyTable {
        &self.inner.table
    }

    /// Re-run the frequency decision on behalf of `cpu` and return the
    /// resolved speed. Busy while suspended.
    pub fn set_speed_cap(&self, cpu: usize) -> Result<u32> {
        self.inner.check_cpu(cpu)?;
        let mut st = self.inner.state();
        self.inner.set_speed_cap_locked(&mut st, cpu)
    }

    /// Per-core governor request for `freq`, snapped within the policy of
    /// `cpu`.
    pub fn target(&self, cpu: usize, freq: u32, relation: Relation) -> Result<u32> {
        let inner = &*self.inner;
        inner.check_cpu(cpu)?;
        let mut st = inner.state();
        let lo = inner.policy_min(&st, cpu);
        let hi = inner.policy_max(&st, cpu);
        let snapped = inner.table.snap_within(freq, lo, hi, relation);
        if snapped == 0 {
            return Err(invalid(format!(
                "no frequency within [{}, {}] kHz for cpu {}",
                lo, hi, cpu
            )));
        }

        st.targets[cpu] = snapped;
        if snapped > st.tunables.cluster.low_power_ceiling
            && inner.platform.clock.cluster() == Cluster::Economy
        {
            if let Err(e) = inner.force_performance_locked(&mut st) {
                debug!("target: staying on economy cluster: {:#}", e);
            }
        }
        inner.set_speed_cap_locked(&mut st, cpu)
    }

    /// Raise the speed to `freq` at once, bypassing the bargainer.
    pub fn input_boost(&self, cpu: usize, freq: u32) -> Result<u32> {
        let inner = &*self.inner;
        inner.check_cpu(cpu)?;
        let mut st = inner.state();
        let curr = inner.platform.clock.rate();
        let limits = inner.limits(&st);
        let target = FrequencyResolver::new(&inner.table, &limits)
            .clamp(freq)
            .min(st.tunables.cpu_freq_limit(cpu));
        let target = inner.table.snap(target, Relation::RoundDown);
        if curr == 0 || curr >= target {
            return Err(invalid(format!(
                "boost to {} kHz from {} kHz",
                target, curr
            )));
        }

        if target > st.tunables.cluster.low_power_ceiling
            && inner.platform.clock.cluster() == Cluster::Economy
        {
            if let Err(e) = inner.force_performance_locked(&mut st) {
                debug!("input boost: staying on economy cluster: {:#}", e);
            }
        }

        st.targets[cpu] = target;
        let online = inner.platform.hotplug.online_mask();
        inner.update_speed_locked(&mut st, &online, target)?;
        Ok(target)
    }

    /// Speed request while suspended. Only thermal and EDP caps apply.
    pub fn suspended_target(&self, freq: u32) -> Result<u32> {
        let inner = &*self.inner;
        let mut st = inner.state();
        if !st.suspended {
            return Err(busy("not suspended"));
        }
        let limits = inner.limits(&st);
        let capped = FrequencyResolver::new(&inner.table, &limits).hard_clamp(freq);
        let new = inner.table.snap(capped, Relation::RoundDown);
        let online = inner.platform.hotplug.online_mask();
        inner.update_speed_locked(&mut st, &online, new)?;
        Ok(new)
    }

    pub fn suspend_notify(&self, entering: bool) -> Result<()> {
        if !entering {
            return self.resume_notify();
        }
        let inner = &*self.inner;
        let mut st = inner.state();
        st.suspended = true;
        let boost = st.tunables.boost_freq.min(st.tunables.cpu_freq_limit(0));
        let freq = inner.table.snap(boost, Relation::RoundDown);
        let online = inner.platform.hotplug.online_mask();
        inner.update_speed_locked(&mut st, &online, freq)?;
        let now = inner.now();
        inner.evaluate_cluster_locked(&mut st, freq, true, now);
        info!("suspend: speed {} kHz", freq);
        Ok(())
    }

    pub fn resume_notify(&self) -> Result<()> {
        let inner = &*self.inner;
        let mut st = inner.state();
        st.suspended = false;
        let online = inner.platform.hotplug.online_mask();
        if let Some(edp) = st.capper.edp_mut() {
            edp.reset_online(online);
            edp.update_limit(&inner.table);
        }
        inner.set_speed_cap_locked(&mut st, 0).map(|_| ())
    }

    /// Screen off.
    pub fn early_suspend(&self) -> Result<()> {
        let inner = &*self.inner;
        let mut st = inner.state();
        st.boost_window = false;
        st.boost_floor = (0, 0);
        st.screen_on = false;
        inner.set_own_request_locked(&mut st, OwnRequest::Boost, QosClass::FreqMin, 0)?;

        let cap = st.tunables.suspend_cap_freq;
        inner.set_own_request_locked(&mut st, OwnRequest::ScreenOffFreq, QosClass::FreqMax, cap)?;
        if cap > st.tunables.cluster.low_power_ceiling {
            let cores = st.tunables.suspend_cap_cores;
            inner.set_own_request_locked(
                &mut st,
                OwnRequest::ScreenOffCores,
                QosClass::MaxCores,
                cores,
            )?;
        }
        Ok(())
    }

    /// Screen on. Opens the resume boost window until
    /// [`Governor::end_resume_boost`].
    pub fn late_resume(&self) -> Result<()> {
        let inner = &*self.inner;
        let mut st = inner.state();
        st.screen_on = true;
        if let Err(e) = inner.force_performance_locked(&mut st) {
            debug!("late resume: {:#}", e);
        }
        inner.set_own_request_locked(&mut st, OwnRequest::ScreenOffFreq, QosClass::FreqMax, 0)?;
        inner.set_own_request_locked(&mut st, OwnRequest::ScreenOffCores, QosClass::MaxCores, 0)?;

        let boost = st.tunables.boost_freq.min(st.tunables.cpu_freq_limit(0));
        let boost = inner.table.snap(boost, Relation::RoundDown);
        let online = inner.platform.hotplug.online_mask();
        inner.update_speed_locked(&mut st, &online, boost)?;
        st.boost_window = true;
        inner.set_own_request_locked(&mut st, OwnRequest::Boost, QosClass::FreqMin, boost)
    }

    pub fn end_resume_boost(&self) -> Result<()> {
        let inner = &*self.inner;
        let mut st = inner.state();
        st.boost_window = false;
        inner.set_own_request_locked(&mut st, OwnRequest::Boost, QosClass::FreqMin, 0)?;
        inner.refresh_locked(&mut st);
        Ok(())
    }

    /// Radio wakeup while the screen is off: leave the economy cluster, lift
    /// the screen-off frequency cap and hold the boost frequency as a floor
    /// until the next screen transition or [`Governor::end_resume_boost`].
    pub fn ril_boost(&self) -> Result<()> {
        let inner = &*self.inner;
        let mut st = inner.state();
        if let Err(e) = inner.force_performance_locked(&mut st) {
            debug!("ril boost: {:#}", e);
        }
        inner.set_own_request_locked(&mut st, OwnRequest::ScreenOffFreq, QosClass::FreqMax, 0)?;

        let boost = st.tunables.boost_freq.min(st.tunables.cpu_freq_limit(0));
        let boost = inner.table.snap(boost, Relation::RoundDown);
        info!("ril boost: {} kHz", boost);
        let online = inner.platform.hotplug.online_mask();
        inner.update_speed_locked(&mut st, &online, boost)?;
        inner.set_own_request_locked(&mut st, OwnRequest::Boost, QosClass::FreqMin, boost)
    }

    pub fn set_power_save(&self, on: bool) -> Result<()> {
        let inner = &*self.inner;
        let mut st = inner.state();
        let (freq, cores) = match on {
            true => (st.tunables.power_save_freq, st.tunables.power_save_cores),
            false => (0, 0),
        };
        inner.set_own_request_locked(&mut st, OwnRequest::PowerSaveFreq, QosClass::FreqMax, freq)?;
        inner.set_own_request_locked(
            &mut st,
            OwnRequest::PowerSaveCores,
            QosClass::MaxCores,
            cores,
        )
    }

    pub fn set_audio_active(&self, active: bool) {
        let mut st = self.inner.state();
        if st.tunables.audio_active != active {
            st.tunables.audio_active = active;
            self.inner.clamp_targets_locked(&mut st);
            self.inner.refresh_locked(&mut st);
        }
    }

    /// Keep the governor minimum at `freq` or above until `until_ns`.
    pub fn set_boost_floor(&self, freq: u32, until_ns: u64) {
        let mut st = self.inner.state();
        st.boost_floor = (freq, until_ns);
        self.inner.refresh_locked(&mut st);
    }

    /// Set the policy bounds of `cpu`, 0 meaning unset. A recorded target
    /// outside the new bounds is pulled in and the speed re-resolved.
    pub fn update_policy(&self, cpu: usize, min: u32, max: u32) -> Result<()> {
        self.inner.check_cpu(cpu)?;
        if max != 0 && min > max {
            return Err(invalid(format!("policy min {} above max {}", min, max)));
        }
        let inner = &*self.inner;
        let mut st = inner.state();
        st.policy[cpu] = CorePolicy { min, max };
        let before = st.targets[cpu];
        inner.clamp_targets_locked(&mut st);
        if st.targets[cpu] != before {
            inner.refresh_locked(&mut st);
        }
        Ok(())
    }

    pub fn set_force_policy_max(&self, on: bool) {
        let mut st = self.inner.state();
        if st.tunables.force_policy_max != on {
            st.tunables.force_policy_max = on;
            self.inner.refresh_locked(&mut st);
        }
    }

    /// Cap the speed at the table entry at or below `freq`, 0 clears the
    /// cap. Returns the resolved speed.
    pub fn set_user_cap(&self, freq: u32) -> Result<u32> {
        let inner = &*self.inner;
        let mut st = inner.state();
        st.tunables.user_cap = match freq {
            0 => 0,
            freq => inner.table.round_down_entry(freq),
        };
        inner.set_speed_cap_locked(&mut st, 0)
    }

    /// Opportunistic bargain for one more core, outside a frequency change.
    pub fn bargain_standalone_up(&self, cpu: usize, freq: u32) -> Result<()> {
        let inner = &*self.inner;
        inner.check_cpu(cpu)?;
        let mut st = match inner.state.try_lock() {
            Ok(st) => st,
            Err(TryLockError::Poisoned(e)) => e.into_inner(),
            Err(TryLockError::WouldBlock) => return Err(busy("governor state is locked")),
        };
        if st.suspended
            || !st.tunables.bargain.enabled
            || inner.platform.clock.cluster() == Cluster::Economy
        {
            return Ok(());
        }
        let _guard = match inner.kicking.try_acquire() {
            Some(guard) => guard,
            None => return Ok(()),
        };

        let now = inner.now();
        let online = inner.platform.hotplug.online_mask();
        let limits = inner.limits(&st);
        let resolver = FrequencyResolver::new(&inner.table, &limits);
        st.kicker.kick_cpu = Some(cpu);
        st.kicker.clock.stamp(Timer::Kick, now);
        let out = inner.bargain_locked(
            &mut st,
            &resolver,
            &online,
            cpu,
            freq,
            freq,
            Preference::Up,
            now,
        );
        if out.catchup {
            inner.work.queue(Work::MinMax, now);
        }
        Ok(())
    }

    /// Whether the EDP limits leave more throughput with `cores + 1` cores
    /// online than with `cores`, each extra core costing `mp_overhead`
    /// percent.
    pub fn edp_favor_up(&self, cores: usize, mp_overhead: u32) -> bool {
        self.inner.state().capper.favor_up(cores, mp_overhead)
    }

    /// Whether the EDP limits leave more throughput with `cores - 1` cores.
    pub fn edp_favor_down(&self, cores: usize, mp_overhead: u32) -> bool {
        self.inner.state().capper.favor_down(cores, mp_overhead)
    }

    pub fn set_thermal_temperature(&self, temp: i32) -> Result<()> {
        let inner = &*self.inner;
        let mut st = inner.state();
        match st.capper.edp_mut() {
            Some(edp) => {
                let zone = edp.zone();
                edp.set_temperature(temp);
                edp.update_limit(&inner.table);
                if edp.zone() != zone {
                    info!("EDP zone {} -> {}, limit {} kHz", zone, edp.zone(), edp.limit());
                }
            }
            None => return Ok(()),
        }
        if st.targets[0] != 0 {
            inner.set_speed_cap_locked(&mut st, 0)?;
        }
        Ok(())
    }

    /// Apply or lift the system EDP alarm. The emergency throttle engages
    /// when an asserted alarm could not be applied.
    pub fn set_system_alarm(&self, alarm: bool) -> Result<()> {
        let inner = &*self.inner;
        let mut st = inner.state();
        match st.capper.edp_mut() {
            Some(edp) => {
                edp.set_alarm(alarm);
                edp.update_limit(&inner.table);
            }
            None => return Ok(()),
        }
        let res = match st.targets[0] {
            0 => Ok(()),
            _ => inner.set_speed_cap_locked(&mut st, 0).map(|_| ()),
        };
        let engage = alarm && res.is_err();
        inner.platform.thermal.throttle_now(engage);
        if engage {
            warn!("EDP alarm could not be applied, throttling");
        }
        res
    }

    /// Hotplug notification before `cpu` comes up. An error refuses the
    /// hotplug.
    pub fn notify_cpu_up_prepare(&self, cpu: usize) -> Result<()> {
        self.inner.check_cpu(cpu)?;
        let mut st = self.inner.state();
        self.inner.edp_up_prepare_locked(&mut st, cpu)
    }

    pub fn notify_cpu_dead(&self, cpu: usize) -> Result<()> {
        self.inner.check_cpu(cpu)?;
        let mut st = self.inner.state();
        self.inner.edp_dead_locked(&mut st, cpu);
        Ok(())
    }

    pub fn add_qos_request(&self, class: QosClass, value: u32) -> Result<QosRequest> {
        let inner = &*self.inner;
        let mut st = inner.state();
        let before = st.qos.value(class);
        let req = st.qos.add(class, value);
        if before != st.qos.value(class) {
            inner.qos_changed_locked(&mut st, class)?;
        }
        Ok(req)
    }

    pub fn update_qos_request(&self, req: &QosRequest, value: u32) -> Result<()> {
        let inner = &*self.inner;
        let mut st = inner.state();
        match st.qos.update(req, value) {
            true => inner.qos_changed_locked(&mut st, req.class()),
            false => Ok(()),
        }
    }

    pub fn remove_qos_request(&self, req: &QosRequest) -> Result<()> {
        let inner = &*self.inner;
        let mut st = inner.state();
        match st.qos.remove(req) {
            true => inner.qos_changed_locked(&mut st, req.class()),
            false => Ok(()),
        }
    }

    pub fn force_performance_cluster(&self) -> Result<()> {
        let mut st = self.inner.state();
        self.inner.force_performance_locked(&mut st)
    }

    pub fn set_no_lp(&self, no_lp: bool) -> Result<()> {
        let inner = &*self.inner;
        let mut st = inner.state();
        st.tunables.cluster.no_lp = no_lp;
        if no_lp && inner.platform.clock.has_performance_cluster() {
            inner
                .switch_cluster_locked(&mut st, Cluster::Performance)
                .map_err(|e| e.context(GovErrno(libc::EBUSY)))?;
        }
        Ok(())
    }

    pub fn set_cluster_switch_enabled(&self, enabled: bool) {
        let mut st = self.inner.state();
        st.tunables.cluster.enabled = enabled;
        st.cluster.set_enabled(enabled);
        if enabled {
            self.inner.refresh_locked(&mut st);
        }
    }

    pub fn set_min_cores(&self, cores: usize) -> Result<()> {
        let inner = &*self.inner;
        let mut st = inner.state();
        let GovernorState {
            cores: ccc,
            tunables,
            ..
        } = &mut *st;
        ccc.set_min_cores(&mut tunables.cores, cores)?;
        inner.cores_changed_locked(&mut st, QosClass::MinCores)
    }

    pub fn set_max_cores(&self, cores: usize) -> Result<()> {
        let inner = &*self.inner;
        let mut st = inner.state();
        let GovernorState {
            cores: ccc,
            tunables,
            ..
        } = &mut *st;
        ccc.set_max_cores(&mut tunables.cores, cores)?;
        inner.cores_changed_locked(&mut st, QosClass::MaxCores)
    }

    pub fn set_manual_hotplug(&self, manual: bool) {
        let mut st = self.inner.state();
        self.inner.set_manual_hotplug_locked(&mut st, manual);
    }

    /// Set the manual core mask, bit i standing for core i + 1.
    pub fn set_core_state(&self, mask: u32) {
        let inner = &*self.inner;
        let mut st = inner.state();
        let width = inner.nr_cpus.saturating_sub(1) as u32;
        let keep = 1u32.checked_shl(width).map_or(u32::MAX, |bit| bit - 1);
        st.tunables.cores.core_state = mask & keep;
        if st.tunables.cores.manual_hotplug {
            inner.work.queue(Work::CoreState, inner.now());
        }
    }

    /// Run exactly `cores` cores under manual control, 0 returns to
    /// automatic control.
    pub fn set_cpus_allowed(&self, cores: usize) -> Result<()> {
        let inner = &*self.inner;
        let mut st = inner.state();
        if cores == 0 {
            inner.set_manual_hotplug_locked(&mut st, false);
            return Ok(());
        }
        st.tunables.cores.core_state = st.cores.cpus_allowed_mask(cores)?;
        inner.set_manual_hotplug_locked(&mut st, true);
        Ok(())
    }

    fn try_hotplug_guard(&self) -> Result<MutexGuard<'_, ()>> {
        match self.inner.hotplug_lock.try_lock() {
            Ok(guard) => Ok(guard),
            Err(TryLockError::Poisoned(e)) => Ok(e.into_inner()),
            Err(TryLockError::WouldBlock) => Err(busy("hotplug in progress")),
        }
    }

    /// Bring `cpu` up on request, within the core-count bounds.
    pub fn wake_core(&self, cpu: usize) -> Result<()> {
        let inner = &*self.inner;
        if cpu == 0 {
            return Ok(());
        }
        inner.check_cpu(cpu)?;
        let _hp = self.try_hotplug_guard()?;
        if inner.platform.hotplug.is_online(cpu) {
            return Ok(());
        }
        {
            let mut st = inner.state();
            let limits = inner.limits(&st);
            if inner.platform.hotplug.nr_online() + 1 > limits.max_cores {
                return Err(busy(format!("cpu {} would exceed max cores", cpu)));
            }
            if inner.platform.clock.cluster() == Cluster::Economy {
                if !st.screen_on {
                    return Err(busy("screen is off"));
                }
                inner
                    .switch_cluster_locked(&mut st, Cluster::Performance)
                    .map_err(|e| e.context(GovErrno(libc::EBUSY)))?;
            }
        }
        inner.apply_core_actions(vec![CoreAction::Up(cpu)]);
        match inner.platform.hotplug.is_online(cpu) {
            true => Ok(()),
            false => Err(busy(format!("cpu {} did not come up", cpu))),
        }
    }

    /// Take `cpu` down on request, within the core-count bounds.
    pub fn quiesce_core(&self, cpu: usize) -> Result<()> {
        let inner = &*self.inner;
        if cpu == 0 {
            return Err(invalid("cpu 0 cannot be taken down"));
        }
        inner.check_cpu(cpu)?;
        let _hp = self.try_hotplug_guard()?;
        if !inner.platform.hotplug.is_online(cpu) {
            return Ok(());
        }
        {
            let st = inner.state();
            let limits = inner.limits(&st);
            if inner.platform.hotplug.nr_online() <= limits.min_cores {
                return Err(busy(format!("cpu {} is needed for min cores", cpu)));
            }
        }
        inner.apply_core_actions(vec![CoreAction::Down(cpu)]);
        match inner.platform.hotplug.is_online(cpu) {
            true => Err(busy(format!("cpu {} did not go down", cpu))),
            false => Ok(()),
        }
    }

    /// Set a runtime parameter by name.
    pub fn set_param(&self, name: &str, value: &str) -> Result<()> {
        match name {
            "user_cap" => return self.set_user_cap(parse_num(name, value)?).map(|_| ()),
            "force_policy_max" => {
                self.set_force_policy_max(parse_bool(name, value)?);
                return Ok(());
            }
            "audio_active" => {
                self.set_audio_active(parse_bool(name, value)?);
                return Ok(());
            }
            "no_lp" => return self.set_no_lp(parse_bool(name, value)?),
            "cluster_enabled" => {
                self.set_cluster_switch_enabled(parse_bool(name, value)?);
                return Ok(());
            }
            "min_cores" => return self.set_min_cores(parse_num(name, value)?),
            "max_cores" => return self.set_max_cores(parse_num(name, value)?),
            "manual_hotplug" => {
                self.set_manual_hotplug(parse_bool(name, value)?);
                return Ok(());
            }
            "core_state" => {
                self.set_core_state(parse_num(name, value)?);
                return Ok(());
            }
            "cpus_allowed" => return self.set_cpus_allowed(parse_num(name, value)?),
            "ril_boost" => return self.ril_boost(),
            _ => {}
        }

        let inner = &*self.inner;
        let mut st = inner.state();
        let mut tun = st.tunables.clone();
        let mut refresh = true;
        match name {
            "enable_overclock" => tun.enable_overclock = parse_bool(name, value)?,
            "no_edp_limit" => tun.no_edp_limit = parse_bool(name, value)?,
            "no_thermal_limit" => tun.no_thermal_limit = parse_bool(name, value)?,
            "cpu_freq_limits" => tun.cpu_freq_limits = parse_list(name, value)?,
            "cpu_freq_limits_min" => tun.cpu_freq_limits_min = parse_list(name, value)?,
            "boost_freq" => tun.boost_freq = parse_num(name, value)?,
            "suspend_cap_freq" => tun.suspend_cap_freq = parse_num(name, value)?,
            "suspend_cap_cores" => tun.suspend_cap_cores = parse_num(name, value)?,
            "power_save_freq" => tun.power_save_freq = parse_num(name, value)?,
            "power_save_cores" => tun.power_save_cores = parse_num(name, value)?,
            "low_power_ceiling" => tun.cluster.low_power_ceiling = parse_num(name, value)?,
            "lp_up_delay_ms" => tun.cluster.lp_up_delay_ms = parse_num(name, value)?,
            "lp_down_delay_ms" => tun.cluster.lp_down_delay_ms = parse_num(name, value)?,
            _ => {
                refresh = false;
                let bt = &mut tun.bargain;
                match name {
                    "log_hotplugging" => tun.log_hotplugging = parse_bool(name, value)?,
                    "bargain_enabled" => bt.enabled = parse_bool(name, value)?,
                    "debounce_up_ms" => bt.debounce_up_ms = parse_num(name, value)?,
                    "debounce_down_ms" => bt.debounce_down_ms = parse_num(name, value)?,
                    "debounce_lp_ms" => bt.debounce_lp_ms = parse_num(name, value)?,
                    "relax" => bt.relax = parse_bool(name, value)?,
                    "mp_overhead" => bt.mp_overhead = parse_list(name, value)?,
                    "big_two_overhead_up" => bt.big_two_overhead_up = parse_bool(name, value)?,
                    "big_two_overhead_down" => {
                        bt.big_two_overhead_down = parse_bool(name, value)?
                    }
                    "perfvote_factor" => bt.perfvote_factor = parse_num(name, value)?,
                    "newcomer_shift" => bt.newcomer_shift = parse_num(name, value)?,
                    "perf_critical_elevator" => {
                        bt.perf_critical_elevator = parse_num(name, value)?
                    }
                    "overclock" => bt.overclock = parse_bool(name, value)?,
                    "big_hammer_limit" => bt.big_hammer_limit = parse_num(name, value)?,
                    "overclock_base_ms" => bt.overclock_base_ms = parse_num(name, value)?,
                    "min_hotplug_speed" => bt.min_hotplug_speed = parse_num(name, value)?,
                    _ => return Err(invalid(format!("unknown parameter {:?}", name))),
                }
            }
        }
        tun.validate()?;
        st.tunables = tun;

        if name == "enable_overclock" {
            let overclock = st.tunables.enable_overclock;
            if let Some(edp) = st.capper.edp_mut() {
                edp.set_overclock(overclock);
                edp.update_limit(&inner.table);
            }
        }
        if refresh {
            inner.clamp_targets_locked(&mut st);
            inner.refresh_locked(&mut st);
        }
        Ok(())
    }

    /// Current value of a runtime parameter.
    pub fn param(&self, name: &str) -> Result<String> {
        let st = self.inner.state();
        let tun = &st.tunables;
        let bt = &tun.bargain;
        let value = match name {
            "user_cap" => tun.user_cap.to_string(),
            "force_policy_max" => tun.force_policy_max.to_string(),
            "audio_active" => tun.audio_active.to_string(),
            "no_lp" => tun.cluster.no_lp.to_string(),
            "cluster_enabled" => (!st.cluster.is_disabled()).to_string(),
            "min_cores" => tun.cores.min_cores.to_string(),
            "max_cores" => tun.cores.max_cores.to_string(),
            "manual_hotplug" => tun.cores.manual_hotplug.to_string(),
            "core_state" => tun.cores.core_state.to_string(),
            "cpus_allowed" => match tun.cores.manual_hotplug {
                true => (tun.cores.core_state.count_ones() + 1).to_string(),
                false => "0".to_string(),
            },
            "ril_boost" => "0".to_string(),
            "enable_overclock" => tun.enable_overclock.to_string(),
            "no_edp_limit" => tun.no_edp_limit.to_string(),
            "no_thermal_limit" => tun.no_thermal_limit.to_string(),
            "cpu_freq_limits" => format_list(&tun.cpu_freq_limits),
            "cpu_freq_limits_min" => format_list(&tun.cpu_freq_limits_min),
            "boost_freq" => tun.boost_freq.to_string(),
            "suspend_cap_freq" => tun.suspend_cap_freq.to_string(),
            "suspend_cap_cores" => tun.suspend_cap_cores.to_string(),
            "power_save_freq" => tun.power_save_freq.to_string(),
            "power_save_cores" => tun.power_save_cores.to_string(),
            "low_power_ceiling" => tun.cluster.low_power_ceiling.to_string(),
            "lp_up_delay_ms" => tun.cluster.lp_up_delay_ms.to_string(),
            "lp_down_delay_ms" => tun.cluster.lp_down_delay_ms.to_string(),
            "log_hotplugging" => tun.log_hotplugging.to_string(),
            "bargain_enabled" => bt.enabled.to_string(),
            "debounce_up_ms" => bt.debounce_up_ms.to_string(),
            "debounce_down_ms" => bt.debounce_down_ms.to_string(),
            "debounce_lp_ms" => bt.debounce_lp_ms.to_string(),
            "relax" => bt.relax.to_string(),
            "mp_overhead" => format_list(&bt.mp_overhead),
            "big_two_overhead_up" => bt.big_two_overhead_up.to_string(),
            "big_two_overhead_down" => bt.big_two_overhead_down.to_string(),
            "perfvote_factor" => bt.perfvote_factor.to_string(),
            "newcomer_shift" => bt.newcomer_shift.to_string(),
            "perf_critical_elevator" => bt.perf_critical_elevator.to_string(),
            "overclock" => bt.overclock.to_string(),
            "big_hammer_limit" => bt.big_hammer_limit.to_string(),
            "overclock_base_ms" => bt.overclock_base_ms.to_string(),
            "min_hotplug_speed" => bt.min_hotplug_speed.to_string(),
            _ => return Err(invalid(format!("unknown parameter {:?}", name))),
        };
        Ok(value)
    }

    pub fn tunables(&self) -> Tunables {
        self.inner.state().tunables.clone()
    }

    pub fn cluster_state(&self) -> ClusterSwitchState {
        self.inner.state().cluster.state()
    }

    /// Execute every queued item that is due. Returns how many ran.
    pub fn run_pending_work(&self) -> usize {
        self.inner.run_pending_work()
    }

    /// Drain the work queue on a dedicated thread until `shutdown` is set.
    pub fn spawn_worker(&self, shutdown: Arc<AtomicBool>) -> thread::JoinHandle<()> {
        let inner = self.inner.clone();
        thread::spawn(move || {
            while !shutdown.load(Ordering::Relaxed) {
                inner.run_pending_work();
                let timeout = match inner.work.next_due() {
                    Some(due) => Duration::from_nanos(due.saturating_sub(inner.now()))
                        .min(WORKER_IDLE),
                    None => WORKER_IDLE,
                };
                inner.work.wait(timeout);
            }
            debug!("governor worker exiting");
        })
    }

    pub fn operating_point(&self) -> OperatingPoint {
        let platform = &self.inner.platform;
        OperatingPoint {
            frequency: platform.clock.rate(),
            active_cores: platform.hotplug.nr_online(),
            cluster: platform.clock.cluster(),
        }
    }

    pub fn stats(&self) -> GovernorStats {
        self.inner.state().stats.clone()
    }

    pub fn add_transition_listener(&self, listener: TransitionListener) {
        self.inner.state().speed.add_listener(listener);
    }
}
