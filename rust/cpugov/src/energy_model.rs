// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Power models
//!
//! The bargainer compares the estimated power of candidate operating points.
//! Two models are provided: the kernel energy model as exported under
//! debugfs, and a linear static plus dynamic model for platforms without
//! one.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use glob::glob;
use serde::Deserialize;
use serde::Serialize;

use crate::platform::PowerModel;
use crate::Cpumask;

pub const EM_ROOT: &str = "/sys/kernel/debug/energy_model";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PerfState {
    pub cost: u64,
    /// kHz.
    pub frequency: u32,
    pub performance: u64,
    /// uW.
    pub power: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PerfDomain {
    pub id: usize,
    /// Cores of this performance domain.
    pub span: Cpumask,
    /// Performance states indexed by frequency.
    pub perf_table: BTreeMap<u32, PerfState>,
}

/// Energy model loaded from debugfs. Only the performance domain with the
/// highest reachable frequency is priced, the governor drives that one.
#[derive(Debug)]
pub struct EnergyModel {
    pub perf_doms: BTreeMap<usize, PerfDomain>,
    perf_dom: usize,
}

fn read_from_file<T>(path: &Path) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let val = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to open or read file {:?}", path))?;
    let val = val.trim_end_matches('\0');
    val.trim()
        .parse::<T>()
        .with_context(|| format!("Failed to parse {:?}", path))
}

impl EnergyModel {
    pub fn has_energy_model(root: &str) -> bool {
        get_pd_paths(root).is_ok()
    }

    /// Build the model from the debugfs tree at `root` for a platform of
    /// `nr_cpus` cores.
    pub fn new(root: &str, nr_cpus: usize) -> Result<EnergyModel> {
        let mut perf_doms = BTreeMap::new();
        let pd_paths = match get_pd_paths(root) {
            Ok(pd_paths) => pd_paths,
            Err(_) => {
                bail!("Fail to locate the energy model directory");
            }
        };

        for (pd_id, pd_path) in pd_paths {
            let pd = PerfDomain::new(pd_id, &pd_path, nr_cpus)?;
            perf_doms.insert(pd.id, pd);
        }

        let perf_dom = perf_doms
            .values()
            .max_by_key(|pd| pd.max_freq())
            .map(|pd| pd.id)
            .unwrap_or(0);

        Ok(EnergyModel {
            perf_doms,
            perf_dom,
        })
    }

    pub fn get_pd_by_cpu_id(&self, cpu_id: usize) -> Option<&PerfDomain> {
        self.perf_doms.values().find(|pd| pd.span.test_cpu(cpu_id))
    }

    fn priced(&self) -> Option<&PerfDomain> {
        self.perf_doms.get(&self.perf_dom)
    }
}

impl PerfDomain {
    pub fn new(id: usize, root: &str, nr_cpus: usize) -> Result<PerfDomain> {
        let mut perf_table = BTreeMap::new();
        let cpulist = std::fs::read_to_string(format!("{}/cpus", root))
            .with_context(|| format!("Failed to read {}/cpus", root))?;
        let span = Cpumask::from_cpulist(&cpulist, nr_cpus)?;

        for ps_path in get_ps_paths(root)? {
            let ps = PerfState::new(&ps_path)?;
            perf_table.insert(ps.frequency, ps);
        }
        if perf_table.is_empty() {
            bail!("Performance domain {} has no performance states", root);
        }

        Ok(PerfDomain {
            id,
            span,
            perf_table,
        })
    }

    pub fn max_freq(&self) -> u32 {
        self.perf_table.keys().last().copied().unwrap_or(0)
    }

    /// Lowest state running at `freq` or faster, the fastest state above
    /// the table.
    pub fn select_perf_state(&self, freq: u32) -> Option<&PerfState> {
        self.perf_table
            .range(freq..)
            .next()
            .or_else(|| self.perf_table.iter().last())
            .map(|(_, ps)| ps)
    }
}

impl PerfState {
    pub fn new(root: &str) -> Result<PerfState> {
        let field = |name: &str| format!("{}/{}", root, name);
        Ok(PerfState {
            cost: read_from_file(Path::new(&field("cost")))?,
            frequency: read_from_file(Path::new(&field("frequency")))?,
            performance: read_from_file(Path::new(&field("performance")))?,
            power: read_from_file(Path::new(&field("power")))?,
        })
    }
}

impl PowerModel for EnergyModel {
    fn power(&self, freq_khz: u32, cores: usize) -> u32 {
        let ps = match self.priced().and_then(|pd| pd.select_perf_state(freq_khz)) {
            Some(ps) => ps,
            None => return 0,
        };
        (ps.power * cores as u64 / 1000) as u32
    }

    fn max_power(&self) -> u32 {
        match self.priced() {
            Some(pd) => pd
                .perf_table
                .values()
                .map(|ps| ps.power * pd.span.weight() as u64 / 1000)
                .max()
                .unwrap_or(0) as u32,
            None => 0,
        }
    }
}

impl fmt::Display for EnergyModel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (_, pd) in self.perf_doms.iter() {
            writeln!(f, "{pd:#}")?;
        }
        Ok(())
    }
}

impl fmt::Display for PerfDomain {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "# perf domain: {:#}, cpus: {:#}", self.id, self.span)?;
        writeln!(f, "cost, frequency, performance, power")?;
        for (_, ps) in self.perf_table.iter() {
            writeln!(
                f,
                "{}, {}, {}, {}",
                ps.cost, ps.frequency, ps.performance, ps.power
            )?;
        }
        Ok(())
    }
}

fn get_ps_paths(root: &str) -> Result<Vec<String>> {
    let ps_paths = glob(&format!("{}/ps:[0-9]*", root))?;
    Ok(ps_paths
        .filter_map(Result::ok)
        .map(|p| p.to_string_lossy().into_owned())
        .collect())
}

fn get_pd_paths(root: &str) -> Result<Vec<(usize, String)>> {
    let prefix = format!("{}/cpu", root);
    let pd_paths = glob(&(prefix.clone() + "[0-9]*"))?;

    let mut pd_vec = vec![];
    for pd_path in pd_paths.filter_map(Result::ok) {
        let pd_str = pd_path.to_string_lossy().into_owned();
        let first_cpu: usize = pd_str[prefix.len()..].parse()?;
        pd_vec.push((first_cpu, pd_str));
    }
    if pd_vec.is_empty() {
        bail!("There is no performance domain.");
    }
    pd_vec.sort();

    Ok(pd_vec
        .into_iter()
        .enumerate()
        .map(|(id, (_, pd_str))| (id, pd_str))
        .collect())
}

/// `static + dynamic * freq / max_freq` per core, in mW.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinearPowerModel {
    pub static_mw: u32,
    /// Dynamic power of one core at max_freq.
    pub dynamic_mw: u32,
    pub max_freq: u32,
    pub nr_cpus: usize,
}

impl LinearPowerModel {
    pub fn new(static_mw: u32, dynamic_mw: u32, max_freq: u32, nr_cpus: usize) -> Self {
        Self {
            static_mw,
            dynamic_mw,
            max_freq: max_freq.max(1),
            nr_cpus,
        }
    }
}

impl PowerModel for LinearPowerModel {
    fn power(&self, freq_khz: u32, cores: usize) -> u32 {
        let dynamic = self.dynamic_mw as u64 * freq_khz as u64 / self.max_freq as u64;
        ((self.static_mw as u64 + dynamic) * cores as u64) as u32
    }

    fn max_power(&self) -> u32 {
        self.power(self.max_freq, self.nr_cpus)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write_ps(dir: &Path, idx: usize, freq: u32, power: u64) {
        let ps = dir.join(format!("ps:{}", idx));
        fs::create_dir_all(&ps).unwrap();
        fs::write(ps.join("cost"), format!("{}\n", power / 10)).unwrap();
        fs::write(ps.join("frequency"), format!("{}\n", freq)).unwrap();
        fs::write(ps.join("performance"), format!("{}\n", freq / 1000)).unwrap();
        fs::write(ps.join("power"), format!("{}\n", power)).unwrap();
    }

    fn em_tree() -> TempDir {
        let tmp = TempDir::new().unwrap();
        let little = tmp.path().join("cpu0");
        fs::create_dir_all(&little).unwrap();
        fs::write(little.join("cpus"), "0\n").unwrap();
        write_ps(&little, 0, 102000, 20000);
        write_ps(&little, 1, 475000, 90000);

        let big = tmp.path().join("cpu1");
        fs::create_dir_all(&big).unwrap();
        fs::write(big.join("cpus"), "1-3\n").unwrap();
        write_ps(&big, 0, 340000, 100000);
        write_ps(&big, 1, 1000000, 400000);
        write_ps(&big, 2, 1700000, 900000);
        tmp
    }

    #[test]
    fn test_load_energy_model() {
        let tmp = em_tree();
        let root = tmp.path().to_str().unwrap();
        assert!(EnergyModel::has_energy_model(root));
        let em = EnergyModel::new(root, 4).unwrap();
        assert_eq!(em.perf_doms.len(), 2);
        assert_eq!(em.get_pd_by_cpu_id(2).unwrap().id, 1);
        assert_eq!(em.get_pd_by_cpu_id(0).unwrap().max_freq(), 475000);
    }

    #[test]
    fn test_energy_model_pricing() {
        let tmp = em_tree();
        let em = EnergyModel::new(tmp.path().to_str().unwrap(), 4).unwrap();
        // Snaps up to the 1000000 state.
        assert_eq!(em.power(900000, 2), 800);
        assert_eq!(em.power(2000000, 1), 900);
        assert_eq!(em.max_power(), 2700);
        assert!(em.valid_power(em.power(340000, 1)));
    }

    #[test]
    fn test_missing_energy_model() {
        let tmp = TempDir::new().unwrap();
        assert!(!EnergyModel::has_energy_model(tmp.path().to_str().unwrap()));
        assert!(EnergyModel::new(tmp.path().to_str().unwrap(), 4).is_err());
    }

    #[test]
    fn test_linear_model() {
        let lin = LinearPowerModel::new(100, 1000, 1700000, 4);
        assert_eq!(lin.power(1700000, 1), 1100);
        assert_eq!(lin.power(850000, 2), 1200);
        assert_eq!(lin.max_power(), 4400);
        assert!(!lin.valid_power(0));
    }
}
