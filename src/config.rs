use crate::{
    LivemigError, Result,
    host::HostConfig,
    migration::MigrationConfig,
    monitor::MonitorConfig,
    vm::WorkloadConfig,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimConfig {
    #[serde(default = "default_source_host")]
    pub source_host: HostConfig,
    #[serde(default = "default_destination_host")]
    pub destination_host: HostConfig,
    #[serde(default)]
    pub migration: MigrationConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub workload: WorkloadConfig,
    /// VMs placed on the source host, in admission order.
    #[serde(default = "default_vms", rename = "vm")]
    pub vms: Vec<VmConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmConfig {
    pub id: u32,
    pub memory_mb: u64,
    #[serde(default)]
    pub dirty_rate_pps: u32,
    /// Delay before the VM is admitted, counted from simulation start.
    #[serde(default)]
    pub admit_after_ms: u64,
}

fn default_source_host() -> HostConfig {
    HostConfig {
        name: "Host-A".to_string(),
        capacity_mb: 8192,
    }
}

fn default_destination_host() -> HostConfig {
    HostConfig {
        name: "Host-B".to_string(),
        capacity_mb: 8192,
    }
}

// VM-1 goes first so the monitor picks it; VM-3 arrives later and tips
// Host-A over the threshold.
fn default_vms() -> Vec<VmConfig> {
    vec![
        VmConfig {
            id: 1,
            memory_mb: 2048,
            dirty_rate_pps: 15000,
            admit_after_ms: 0,
        },
        VmConfig {
            id: 2,
            memory_mb: 4096,
            dirty_rate_pps: 5000,
            admit_after_ms: 0,
        },
        VmConfig {
            id: 3,
            memory_mb: 2048,
            dirty_rate_pps: 8000,
            admit_after_ms: 10_000,
        },
    ]
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            source_host: default_source_host(),
            destination_host: default_destination_host(),
            migration: MigrationConfig::default(),
            monitor: MonitorConfig::default(),
            workload: WorkloadConfig::default(),
            vms: default_vms(),
        }
    }
}

impl SimConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_str(&contents)
    }

    pub fn from_str(contents: &str) -> Result<Self> {
        let config: SimConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| LivemigError::Serde(e.to_string()))?;
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, contents)?;
        Ok(())
    }

    /// `<config dir>/livemig/livemig.toml`, if the platform has a config dir.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("livemig").join("livemig.toml"))
    }

    pub fn validate(&self) -> Result<()> {
        for host in [&self.source_host, &self.destination_host] {
            if host.name.trim().is_empty() {
                return Err(invalid("host name must not be empty"));
            }
            if host.capacity_mb == 0 {
                return Err(invalid(format!("host '{}' has zero capacity", host.name)));
            }
        }
        if self.source_host.name == self.destination_host.name {
            return Err(invalid("source and destination hosts need distinct names"));
        }

        let migration = &self.migration;
        if !(migration.max_data_sent_factor > 0.0) {
            return Err(invalid("max_data_sent_factor must be positive"));
        }
        if !(migration.time_scale > 0.0) || !migration.time_scale.is_finite() {
            return Err(invalid("time_scale must be a positive number"));
        }
        if migration.post_copy_batch_pages == 0 {
            return Err(invalid("post_copy_batch_pages must be positive"));
        }

        let monitor = &self.monitor;
        if monitor.poll_interval_ms == 0 {
            return Err(invalid("poll_interval_ms must be positive"));
        }
        if !(1..=100).contains(&monitor.load_threshold_percent) {
            return Err(invalid("load_threshold_percent must be within 1..=100"));
        }
        if monitor.link_speed_mbps == 0 {
            return Err(invalid("link_speed_mbps must be positive"));
        }

        if self.workload.tick_ms == 0 {
            return Err(invalid("workload tick_ms must be positive"));
        }
        if self.workload.stop_timeout_ms == 0 {
            return Err(invalid("workload stop_timeout_ms must be positive"));
        }
        if self.monitor.shutdown_timeout_ms == 0 {
            return Err(invalid("monitor shutdown_timeout_ms must be positive"));
        }

        let mut seen = HashSet::new();
        for vm in &self.vms {
            if vm.memory_mb == 0 {
                return Err(invalid(format!("VM-{} has zero memory", vm.id)));
            }
            if !seen.insert(vm.id) {
                return Err(invalid(format!("VM id {} is used twice", vm.id)));
            }
        }
        Ok(())
    }
}

fn invalid(msg: impl Into<String>) -> LivemigError {
    LivemigError::InvalidConfig(msg.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::StrategyKind;
    use crate::vm::WorkloadPolicy;

    #[test]
    fn defaults_describe_the_overload_scenario() {
        let config = SimConfig::default();
        config.validate().unwrap();
        assert_eq!(config.source_host.capacity_mb, 8192);
        assert_eq!(config.vms.len(), 3);
        assert_eq!(config.vms[0].dirty_rate_pps, 15000);
        assert_eq!(config.vms[2].admit_after_ms, 10_000);
        assert_eq!(config.monitor.load_threshold_percent, 80);
        assert_eq!(config.workload.tick_ms, 100);
    }

    #[test]
    fn test_config_parsing() {
        let toml_str = r#"
[source_host]
name = "rack1"
capacity_mb = 4096

[destination_host]
name = "rack2"
capacity_mb = 4096

[migration]
strategy = "post-copy"
max_iterations = 10

[monitor]
poll_interval_ms = 1000
link_speed_mbps = 10000

[workload]
policy = "pause-during-migration"

[[vm]]
id = 7
memory_mb = 512
dirty_rate_pps = 2000
"#;

        let config = SimConfig::from_str(toml_str).unwrap();
        assert_eq!(config.source_host.name, "rack1");
        assert_eq!(config.migration.strategy, StrategyKind::PostCopy);
        assert_eq!(config.migration.max_iterations, 10);
        assert_eq!(config.migration.min_dirty_pages, 50);
        assert_eq!(config.monitor.link_speed_mbps, 10000);
        assert_eq!(config.monitor.load_threshold_percent, 80);
        assert_eq!(config.workload.policy, WorkloadPolicy::PauseDuringMigration);
        assert_eq!(
            config.vms,
            vec![VmConfig {
                id: 7,
                memory_mb: 512,
                dirty_rate_pps: 2000,
                admit_after_ms: 0,
            }]
        );
    }

    #[test]
    fn empty_file_uses_defaults() {
        let config = SimConfig::from_str("").unwrap();
        assert_eq!(config.vms, SimConfig::default().vms);
        assert_eq!(config.destination_host.name, "Host-B");
    }

    #[test]
    fn rejects_bad_values() {
        let duplicate = r#"
[[vm]]
id = 1
memory_mb = 512

[[vm]]
id = 1
memory_mb = 256
"#;
        assert!(matches!(
            SimConfig::from_str(duplicate),
            Err(LivemigError::InvalidConfig(_))
        ));

        let threshold = "[monitor]\nload_threshold_percent = 0\n";
        assert!(matches!(
            SimConfig::from_str(threshold),
            Err(LivemigError::InvalidConfig(_))
        ));

        let stop = "[workload]\nstop_timeout_ms = 0\n";
        assert!(matches!(
            SimConfig::from_str(stop),
            Err(LivemigError::InvalidConfig(_))
        ));

        let scale = "[migration]\ntime_scale = 0.0\n";
        assert!(SimConfig::from_str(scale).is_err());

        assert!(matches!(
            SimConfig::from_str("[monitor]\npoll_interval_ms = \"soon\"\n"),
            Err(LivemigError::Serde(_))
        ));
    }
}
