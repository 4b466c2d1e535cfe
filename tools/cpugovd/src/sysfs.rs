// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! sysfs backends of the platform traits.

use std::fs;
use std::path::Path;
use std::path::PathBuf;

use anyhow::anyhow;
use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use cpugov::platform::CpuClock;
use cpugov::platform::CpuHotplug;
use cpugov::read_cpulist;
use cpugov::Cluster;
use log::trace;

fn read_file(path: &Path) -> Result<String> {
    let val = fs::read_to_string(path)
        .with_context(|| format!("Failed to open or read file {:?}", path))?;
    Ok(val.trim_end_matches('\0').trim().to_string())
}

fn read_num<T>(path: &Path) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    read_file(path)?
        .parse::<T>()
        .with_context(|| format!("Failed to parse {:?}", path))
}

fn write_file(path: &Path, val: &str) -> Result<()> {
    trace!("write {:?} <- {}", path, val);
    fs::write(path, val).with_context(|| format!("Failed to write {:?} to {:?}", val, path))
}

/// Shared cluster clock driven through the cpufreq userspace governor of
/// core 0.
#[derive(Debug)]
pub struct SysfsClock {
    cpufreq: PathBuf,
    cluster_node: Option<PathBuf>,
}

impl SysfsClock {
    pub fn new(cpu_root: &str, cluster_node: Option<&str>) -> Self {
        Self {
            cpufreq: Path::new(cpu_root).join("cpu0/cpufreq"),
            cluster_node: cluster_node.map(PathBuf::from),
        }
    }

    /// Frequencies cpufreq advertises for the cluster, if any.
    pub fn available_frequencies(&self) -> Result<Vec<u32>> {
        read_file(&self.cpufreq.join("scaling_available_frequencies"))?
            .split_whitespace()
            .map(|f| {
                f.parse::<u32>()
                    .with_context(|| format!("Invalid frequency {:?}", f))
            })
            .collect()
    }
}

impl CpuClock for SysfsClock {
    fn rate(&self) -> u32 {
        read_num(&self.cpufreq.join("scaling_cur_freq")).unwrap_or(0)
    }

    fn round_rate(&self, khz: u32) -> Result<u32> {
        Ok(khz)
    }

    fn set_rate(&self, khz: u32) -> Result<()> {
        write_file(&self.cpufreq.join("scaling_setspeed"), &khz.to_string())
    }

    fn cluster(&self) -> Cluster {
        let node = match &self.cluster_node {
            Some(node) => node,
            None => return Cluster::Performance,
        };
        match read_file(node).as_deref() {
            Ok("LP") => Cluster::Economy,
            _ => Cluster::Performance,
        }
    }

    fn set_cluster(&self, cluster: Cluster) -> Result<()> {
        let val = match cluster {
            Cluster::Economy => "LP",
            Cluster::Performance => "G",
        };
        match &self.cluster_node {
            Some(node) => write_file(node, val),
            None if cluster == Cluster::Performance => Ok(()),
            None => bail!("No cluster node to switch to {:?}", cluster),
        }
    }

    fn has_performance_cluster(&self) -> bool {
        true
    }
}

/// Core hotplug through cpuN/online. Cores without an online node cannot
/// be hotplugged and are always online.
#[derive(Debug)]
pub struct SysfsHotplug {
    cpu_root: PathBuf,
    nr_cpus: usize,
}

impl SysfsHotplug {
    pub fn new(cpu_root: &str) -> Result<Self> {
        let cpu_root = PathBuf::from(cpu_root);
        let possible = read_file(&cpu_root.join("possible"))?;
        let nr_cpus = read_cpulist(&possible)?
            .into_iter()
            .max()
            .map(|max| max + 1)
            .ok_or_else(|| anyhow!("No possible cpus in {:?}", cpu_root))?;
        Ok(Self { cpu_root, nr_cpus })
    }

    fn online_node(&self, cpu: usize) -> PathBuf {
        self.cpu_root.join(format!("cpu{}/online", cpu))
    }

    fn set_online(&self, cpu: usize, online: bool) -> Result<()> {
        if cpu >= self.nr_cpus {
            bail!("cpu {} out of range", cpu);
        }
        let node = self.online_node(cpu);
        if !node.exists() {
            bail!("cpu {} cannot be hotplugged", cpu);
        }
        write_file(&node, if online { "1" } else { "0" })
    }
}

impl CpuHotplug for SysfsHotplug {
    fn nr_cpus(&self) -> usize {
        self.nr_cpus
    }

    fn is_online(&self, cpu: usize) -> bool {
        if cpu >= self.nr_cpus {
            return false;
        }
        let node = self.online_node(cpu);
        match node.exists() {
            true => read_num::<u32>(&node).map(|v| v != 0).unwrap_or(false),
            false => true,
        }
    }

    fn cpu_up(&self, cpu: usize) -> Result<()> {
        self.set_online(cpu, true)
    }

    fn cpu_down(&self, cpu: usize) -> Result<()> {
        self.set_online(cpu, false)
    }
}

/// Thermal zone temperature node.
#[derive(Debug)]
pub struct ThermalZone {
    path: PathBuf,
}

impl ThermalZone {
    pub fn new(path: &str) -> Self {
        Self {
            path: PathBuf::from(path),
        }
    }

    /// Temperature in degrees Celsius.
    pub fn temperature(&self) -> Result<i32> {
        let millideg: i64 = read_num(&self.path)?;
        Ok((millideg / 1000) as i32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn cpu_tree(nr_cpus: usize) -> TempDir {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        fs::write(root.join("possible"), format!("0-{}\n", nr_cpus - 1)).unwrap();
        fs::create_dir_all(root.join("cpu0/cpufreq")).unwrap();
        fs::write(root.join("cpu0/cpufreq/scaling_cur_freq"), "475000\n").unwrap();
        fs::write(
            root.join("cpu0/cpufreq/scaling_available_frequencies"),
            "51000 102000 475000 1000000 \n",
        )
        .unwrap();
        for cpu in 1..nr_cpus {
            let dir = root.join(format!("cpu{}", cpu));
            fs::create_dir_all(&dir).unwrap();
            fs::write(dir.join("online"), "0\n").unwrap();
        }
        dir
    }

    #[test]
    fn test_clock() {
        let dir = cpu_tree(2);
        let root = dir.path().to_str().unwrap();
        let node = dir.path().join("active");
        fs::write(&node, "LP\n").unwrap();

        let clock = SysfsClock::new(root, node.to_str());
        assert_eq!(clock.rate(), 475000);
        assert_eq!(
            clock.available_frequencies().unwrap(),
            vec![51000, 102000, 475000, 1000000]
        );
        assert_eq!(clock.cluster(), Cluster::Economy);

        clock.set_rate(1000000).unwrap();
        let setspeed = dir.path().join("cpu0/cpufreq/scaling_setspeed");
        assert_eq!(fs::read_to_string(setspeed).unwrap(), "1000000");
        clock.set_cluster(Cluster::Performance).unwrap();
        assert_eq!(clock.cluster(), Cluster::Performance);
    }

    #[test]
    fn test_clock_without_cluster_node() {
        let dir = cpu_tree(2);
        let clock = SysfsClock::new(dir.path().to_str().unwrap(), None);
        assert_eq!(clock.cluster(), Cluster::Performance);
        assert!(clock.set_cluster(Cluster::Performance).is_ok());
        assert!(clock.set_cluster(Cluster::Economy).is_err());
    }

    #[test]
    fn test_hotplug() {
        let dir = cpu_tree(4);
        let hotplug = SysfsHotplug::new(dir.path().to_str().unwrap()).unwrap();
        assert_eq!(hotplug.nr_cpus(), 4);
        assert!(hotplug.is_online(0));
        assert!(!hotplug.is_online(2));
        assert_eq!(hotplug.nr_online(), 1);

        hotplug.cpu_up(2).unwrap();
        assert!(hotplug.is_online(2));
        assert_eq!(hotplug.online_mask().weight(), 2);
        hotplug.cpu_down(2).unwrap();
        assert!(!hotplug.is_online(2));

        assert!(hotplug.cpu_down(0).is_err());
        assert!(hotplug.cpu_up(4).is_err());
        assert!(!hotplug.is_online(4));
    }

    #[test]
    fn test_thermal_zone() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("temp");
        fs::write(&path, "61500\n").unwrap();
        let zone = ThermalZone::new(path.to_str().unwrap());
        assert_eq!(zone.temperature().unwrap(), 61);
        fs::write(&path, "garbage\n").unwrap();
        assert!(zone.temperature().is_err());
    }
}
