// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::fs;
use std::path::Path;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use cpugov::edp::EdpTables;
use cpugov::FrequencyTable;
use cpugov::Tunables;
use serde::Deserialize;
use serde::Serialize;

const CONFIG_PATHS: [&str; 2] = [
    "/etc/cpugovd/config.toml",
    "/usr/share/cpugovd/config.toml",
];

// Maximum size for config file (1 MB)
const MAX_CONFIG_SIZE: u64 = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub tunables: Tunables,
    /// Frequency table in kHz, empty for the reference table.
    pub frequencies: Vec<u32>,
    pub edp: Option<EdpTables>,
    pub power: PowerConfig,
    pub sysfs: SysfsConfig,
}

/// Linear power model used when debugfs has no energy model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PowerConfig {
    pub static_mw: u32,
    /// Dynamic power of one core at the highest frequency.
    pub dynamic_mw: u32,
    pub energy_model: String,
}

impl Default for PowerConfig {
    fn default() -> Self {
        Self {
            static_mw: 100,
            dynamic_mw: 1000,
            energy_model: cpugov::energy_model::EM_ROOT.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SysfsConfig {
    /// Directory holding cpuN/ and cpufreq/.
    pub cpu_root: String,
    /// Node selecting the active cluster, "G" or "LP". Without one the
    /// platform is treated as performance cluster only.
    pub cluster_node: Option<String>,
    /// Thermal zone temperature in millidegrees Celsius.
    pub thermal_zone: Option<String>,
}

impl Default for SysfsConfig {
    fn default() -> Self {
        Self {
            cpu_root: "/sys/devices/system/cpu".to_string(),
            cluster_node: None,
            thermal_zone: None,
        }
    }
}

impl Config {
    pub fn frequency_table(&self) -> Result<FrequencyTable> {
        match self.frequencies.is_empty() {
            true => Ok(FrequencyTable::reference()),
            false => FrequencyTable::new(self.frequencies.clone())
                .context("Invalid frequency table in config"),
        }
    }
}

/// Load `path` if given, else the first config found in the default
/// locations, else the defaults.
pub fn init_config(path: Option<&str>) -> Result<Config> {
    match path {
        Some(path) => parse_config_file(path),
        None => match get_config_path() {
            Some(path) => parse_config_file(&path),
            None => Ok(Config::default()),
        },
    }
}

pub fn parse_config_file(filepath: &str) -> Result<Config> {
    let metadata = fs::metadata(filepath)
        .with_context(|| format!("Failed to read metadata for {}", filepath))?;
    if metadata.len() > MAX_CONFIG_SIZE {
        bail!(
            "Config file {} is too large: {} bytes exceeds maximum of {}",
            filepath,
            metadata.len(),
            MAX_CONFIG_SIZE
        );
    }

    let content = fs::read_to_string(filepath)
        .with_context(|| format!("Failed to read config file {}", filepath))?;
    parse_config_content(&content).with_context(|| format!("Invalid config file {}", filepath))
}

fn get_config_path() -> Option<String> {
    CONFIG_PATHS
        .iter()
        .find(|path| Path::new(path).exists())
        .map(|path| {
            log::info!("Using config file: {}", path);
            path.to_string()
        })
}

fn parse_config_content(content: &str) -> Result<Config> {
    if content.trim().is_empty() {
        bail!("The config file is empty!");
    }
    let config: Config = toml::from_str(content).context("Failed to parse TOML configuration")?;
    config.frequency_table()?;
    Ok(config)
}

/// Split a `--param name=value` argument.
pub fn split_param(param: &str) -> Result<(&str, &str)> {
    match param.split_once('=') {
        Some((name, value)) if !name.trim().is_empty() => Ok((name.trim(), value.trim())),
        _ => bail!("Expected name=value, got {:?}", param),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let config = parse_config_content(
            r#"
frequencies = [51000, 204000, 475000, 1000000, 1300000]

[tunables]
user_cap = 1000000
boost_freq = 1000000

[tunables.bargain]
debounce_up_ms = 100

[sysfs]
cluster_node = "/sys/kernel/cluster/active"

[edp]
system_limits = [1000000, 860000]

[[edp.limits]]
temperature = 23
freq_limits = [1300000, 1000000]
"#,
        )
        .unwrap();

        assert_eq!(config.tunables.user_cap, 1000000);
        assert_eq!(config.tunables.bargain.debounce_up_ms, 100);
        // Unset fields keep their defaults.
        assert_eq!(config.tunables.bargain.debounce_down_ms, 100);
        assert_eq!(config.frequency_table().unwrap().max(), 1300000);
        assert_eq!(config.sysfs.cpu_root, "/sys/devices/system/cpu");
        let edp = config.edp.unwrap();
        assert_eq!(edp.limits[0].freq_limits, vec![1300000, 1000000]);
        assert!(edp.limits[0].freq_limits_oc.is_empty());
    }

    #[test]
    fn test_parse_config_errors() {
        assert!(parse_config_content("").is_err());
        assert!(parse_config_content("frequencies = [0, 100]").is_err());
        assert!(parse_config_content("[tunables\n").is_err());
    }

    #[test]
    fn test_parse_config_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[power]\nstatic_mw = 50\n").unwrap();
        let config = init_config(path.to_str()).unwrap();
        assert_eq!(config.power.static_mw, 50);
        assert_eq!(config.power.dynamic_mw, 1000);
        assert!(init_config(dir.path().join("missing.toml").to_str()).is_err());
    }

    #[test]
    fn test_split_param() {
        assert_eq!(split_param("user_cap=1000000").unwrap(), ("user_cap", "1000000"));
        assert_eq!(split_param(" relax = 0 ").unwrap(), ("relax", "0"));
        assert!(split_param("user_cap").is_err());
        assert!(split_param("=1").is_err());
    }
}
