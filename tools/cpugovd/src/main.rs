// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # cpugovd
//!
//! Drives the cpugov governor on a live system. Every tick the per-core
//! utilization is sampled from /proc/stat and turned into frequency requests
//! with 25% headroom. The governor picks the speed, the cluster and the
//! number of online cores; the resulting clock, cluster and hotplug changes
//! are written through sysfs. Slow actions run on a separate worker thread.

mod config;
mod sysfs;
mod workload;

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use anyhow::anyhow;
use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use cpugov::energy_model::EnergyModel;
use cpugov::energy_model::LinearPowerModel;
use cpugov::platform::CpuHotplug;
use cpugov::platform::MonotonicTime;
use cpugov::platform::NoThrottle;
use cpugov::platform::PowerModel;
use cpugov::Cluster;
use cpugov::FrequencyTable;
use cpugov::GovErrno;
use cpugov::Governor;
use cpugov::GovernorStats;
use cpugov::Platform;
use cpugov::Relation;
use log::debug;
use log::info;
use log::warn;
use metrics::counter;
use metrics::gauge;
use metrics::Counter;
use metrics::Gauge;
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::config::Config;
use crate::sysfs::SysfsClock;
use crate::sysfs::SysfsHotplug;
use crate::sysfs::ThermalZone;
use crate::workload::schedutil_freq;
use crate::workload::UtilSampler;
use crate::workload::UtilWorkload;

/// Frequency, cluster and core-count governor for asymmetric multi-cluster
/// SoCs.
///
/// The clock of core 0 must be under the cpufreq userspace governor so that
/// scaling_setspeed is writable.
#[derive(Debug, Parser)]
struct Opts {
    /// Configuration file. Defaults to the first of
    /// /etc/cpugovd/config.toml and /usr/share/cpugovd/config.toml.
    #[clap(short = 'c', long)]
    config: Option<String>,

    /// Runtime parameter override as name=value. May be repeated.
    #[clap(short = 'p', long = "param")]
    params: Vec<String>,

    /// Control loop interval in milliseconds.
    #[clap(short = 'i', long, default_value = "50")]
    interval_ms: u64,

    /// Interval in seconds between stats reports, 0 to only report on exit.
    #[clap(short = 's', long, default_value = "10")]
    stats_interval: u64,

    /// Enable verbose output. Specify multiple times to increase verbosity.
    #[clap(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Enable the Prometheus endpoint for metrics on port 9000.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    enable_prometheus: bool,
}

struct Metrics {
    frequency: Gauge,
    active_cores: Gauge,
    on_economy: Gauge,
    bargains: Counter,
    hotplug_up: Counter,
    hotplug_down: Counter,
    hotplug_failures: Counter,
    cluster_to_performance: Counter,
    cluster_to_economy: Counter,
    overclock_boosts: Counter,
    speed_updates: Counter,
    busy: Counter,
}

impl Metrics {
    fn new() -> Self {
        Self {
            frequency: gauge!("frequency_khz"),
            active_cores: gauge!("active_cores"),
            on_economy: gauge!("on_economy_cluster"),
            bargains: counter!("bargains_total"),
            hotplug_up: counter!("hotplug_total", "direction" => "up"),
            hotplug_down: counter!("hotplug_total", "direction" => "down"),
            hotplug_failures: counter!("hotplug_failures_total"),
            cluster_to_performance: counter!("cluster_switches_total", "to" => "performance"),
            cluster_to_economy: counter!("cluster_switches_total", "to" => "economy"),
            overclock_boosts: counter!("overclock_boosts_total"),
            speed_updates: counter!("speed_updates_total"),
            busy: counter!("busy_total"),
        }
    }

    fn update(&self, gov: &Governor, stats: &GovernorStats) {
        let op = gov.operating_point();
        self.frequency.set(op.frequency as f64);
        self.active_cores.set(op.active_cores as f64);
        self.on_economy
            .set((op.cluster == Cluster::Economy) as u32 as f64);

        self.bargains.absolute(stats.bargains);
        self.hotplug_up.absolute(stats.hotplug_up);
        self.hotplug_down.absolute(stats.hotplug_down);
        self.hotplug_failures.absolute(stats.hotplug_failures);
        self.cluster_to_performance
            .absolute(stats.cluster_to_performance);
        self.cluster_to_economy.absolute(stats.cluster_to_economy);
        self.overclock_boosts.absolute(stats.overclock_boosts);
        self.speed_updates.absolute(stats.speed_updates);
        self.busy.absolute(stats.busy);
    }
}

fn frequency_table(config: &Config, clock: &SysfsClock) -> Result<FrequencyTable> {
    if !config.frequencies.is_empty() {
        return config.frequency_table();
    }
    match clock.available_frequencies().and_then(FrequencyTable::new) {
        Ok(table) => Ok(table),
        Err(e) => {
            info!("Using the reference frequency table: {:#}", e);
            Ok(FrequencyTable::reference())
        }
    }
}

fn power_model(config: &Config, table: &FrequencyTable, nr_cpus: usize) -> Arc<dyn PowerModel> {
    let root = &config.power.energy_model;
    if EnergyModel::has_energy_model(root) {
        match EnergyModel::new(root, nr_cpus) {
            Ok(em) => {
                info!("Energy model:\n{}", em);
                return Arc::new(em);
            }
            Err(e) => warn!("Failed to load the energy model, using linear power: {:#}", e),
        }
    }
    Arc::new(LinearPowerModel::new(
        config.power.static_mw,
        config.power.dynamic_mw,
        table.max(),
        nr_cpus,
    ))
}

struct Daemon {
    gov: Governor,
    sampler: UtilSampler,
    workload: Arc<UtilWorkload>,
    thermal: Option<ThermalZone>,
    interval: Duration,
    stats_interval: Duration,
    metrics: Metrics,
}

impl Daemon {
    fn init(opts: &Opts, config: Config) -> Result<Self> {
        let sysfs = &config.sysfs;
        let hotplug = Arc::new(SysfsHotplug::new(&sysfs.cpu_root)?);
        let nr_cpus = hotplug.nr_cpus();
        let clock = SysfsClock::new(&sysfs.cpu_root, sysfs.cluster_node.as_deref());
        let table = frequency_table(&config, &clock)?;
        let power = power_model(&config, &table, nr_cpus);
        let workload = Arc::new(UtilWorkload::default());

        let mut tunables = config.tunables.clone();
        if sysfs.cluster_node.is_none() && tunables.cluster.enabled {
            info!("No cluster node configured, cluster switching disabled");
            tunables.cluster.enabled = false;
        }

        info!(
            "{} cpus, {}-{} kHz in {} steps",
            nr_cpus,
            table.min(),
            table.max(),
            table.len()
        );

        let platform = Platform {
            clock: Arc::new(clock),
            hotplug,
            power,
            workload: workload.clone(),
            thermal: Arc::new(NoThrottle),
            time: Arc::new(MonotonicTime),
        };
        let gov = Governor::new(table, platform, tunables, config.edp.clone())?;

        for param in opts.params.iter() {
            let (name, value) = config::split_param(param)?;
            gov.set_param(name, value)
                .with_context(|| format!("Failed to set {} to {:?}", name, value))?;
            info!("{} = {}", name, gov.param(name)?);
        }

        Ok(Self {
            gov,
            sampler: UtilSampler::new()?,
            workload,
            thermal: sysfs.thermal_zone.as_deref().map(ThermalZone::new),
            interval: Duration::from_millis(opts.interval_ms.max(1)),
            stats_interval: Duration::from_secs(opts.stats_interval),
            metrics: Metrics::new(),
        })
    }

    fn step(&mut self) -> Result<()> {
        let gov = &self.gov;
        let utils = self.sampler.sample(gov.nr_cpus())?;
        self.workload.update(utils.clone());

        if let Some(zone) = &self.thermal {
            match zone.temperature() {
                Ok(temp) => {
                    if let Err(e) = gov.set_thermal_temperature(temp) {
                        debug!("thermal update at {}C: {:#}", temp, e);
                    }
                }
                Err(e) => warn!("{:#}", e),
            }
        }

        let max_freq = gov.table().max();
        for (cpu, util) in utils.into_iter().enumerate() {
            let util = match util {
                Some(util) => util,
                None => continue,
            };
            let freq = schedutil_freq(util, max_freq);
            match gov.target(cpu, freq, Relation::RoundUp) {
                Ok(_) => {}
                Err(e) if GovErrno::is_busy(&e) => debug!("cpu{} target {}: {:#}", cpu, freq, e),
                Err(e) => warn!("cpu{} target {} kHz failed: {:#}", cpu, freq, e),
            }
        }

        self.metrics.update(gov, &gov.stats());
        Ok(())
    }

    fn report(&self) -> Result<()> {
        let op = self.gov.operating_point();
        let mut buf = vec![];
        self.gov.stats().format(&mut buf)?;
        info!(
            "{} kHz x{} on {:?}\n{}",
            op.frequency,
            op.active_cores,
            op.cluster,
            String::from_utf8_lossy(&buf).trim_end()
        );
        Ok(())
    }

    fn run(&mut self, shutdown: Arc<AtomicBool>) -> Result<()> {
        let worker = self.gov.spawn_worker(shutdown.clone());

        let now = Instant::now();
        let mut next_step_at = now + self.interval;
        let mut next_report_at = now + self.stats_interval;

        while !shutdown.load(Ordering::Relaxed) {
            let now = Instant::now();

            if now >= next_step_at {
                self.step()?;
                next_step_at += self.interval;
                if next_step_at < now {
                    next_step_at = now + self.interval;
                }
            }

            if !self.stats_interval.is_zero() && now >= next_report_at {
                self.report()?;
                next_report_at += self.stats_interval;
                if next_report_at < now {
                    next_report_at = now + self.stats_interval;
                }
            }

            let wake_at = match self.stats_interval.is_zero() {
                true => next_step_at,
                false => next_step_at.min(next_report_at),
            };
            std::thread::sleep(wake_at.saturating_duration_since(Instant::now()));
        }

        shutdown.store(true, Ordering::Relaxed);
        worker
            .join()
            .map_err(|_| anyhow!("Governor worker thread panicked"))?;
        self.report()
    }
}

fn main() -> Result<()> {
    let opts = Opts::parse();

    let llv = match opts.verbose {
        0 => simplelog::LevelFilter::Info,
        1 => simplelog::LevelFilter::Debug,
        _ => simplelog::LevelFilter::Trace,
    };
    let mut lcfg = simplelog::ConfigBuilder::new();
    lcfg.set_time_level(simplelog::LevelFilter::Error)
        .set_location_level(simplelog::LevelFilter::Off)
        .set_target_level(simplelog::LevelFilter::Off)
        .set_thread_level(simplelog::LevelFilter::Off);
    simplelog::TermLogger::init(
        llv,
        lcfg.build(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )?;

    let config = config::init_config(opts.config.as_deref())?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    ctrlc::set_handler(move || {
        shutdown_clone.store(true, Ordering::Relaxed);
    })
    .context("Error setting Ctrl-C handler")?;

    if opts.enable_prometheus {
        info!("Enabling Prometheus endpoint: http://localhost:9000");
        PrometheusBuilder::new()
            .install()
            .context("Failed to install Prometheus recorder")?;
    }

    let mut daemon = Daemon::init(&opts, config)?;
    daemon.run(shutdown)
}
