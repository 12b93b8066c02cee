//! batchscale.toml configuration parser.
//!
//! One explicit `Config` value is loaded at startup and handed to each
//! subsystem's constructor.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// System-wide config location.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/batchscale.toml";

/// Per-user config file name, resolved against `$HOME`.
pub const USER_CONFIG_FILE: &str = ".batchscale.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("no config file found (looked in {0})")]
    NotFound(String),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub autoscale: AutoscaleConfig,
    pub scheduler: SchedulerConfig,
    pub provision: ProvisionConfig,
    pub configure: ConfigureConfig,
    pub nodes: NodesConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoscaleConfig {
    /// Prefix for worker node names (`worker` → `worker0`, `worker1`, ...).
    pub node_prefix: String,
    /// Seconds a job must have been eligible before it counts as waiting.
    pub grace_period_secs: u64,
    /// Seconds between decision cycles.
    pub poll_interval_secs: u64,
}

impl Default for AutoscaleConfig {
    fn default() -> Self {
        Self {
            node_prefix: "worker".to_string(),
            grace_period_secs: 300,
            poll_interval_secs: 1800,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub squeue_bin: String,
    pub scontrol_bin: String,
    /// Reason recorded on nodes taken down for scale-down.
    pub down_reason: String,
    pub command_timeout_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            squeue_bin: "squeue".to_string(),
            scontrol_bin: "scontrol".to_string(),
            down_reason: "batchscale scale-down".to_string(),
            command_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisionConfig {
    pub openstack_bin: String,
    pub image_id: String,
    pub instance_type: String,
    pub network_id: String,
    pub key_pair: String,
    pub security_groups: Vec<String>,
    /// Port probed to decide an instance is reachable.
    pub ssh_port: u16,
    pub probe_timeout_secs: u64,
    pub retry_delay_secs: u64,
    pub max_attempts: u32,
    /// Upper bound on the backend create call (including its own wait).
    pub create_timeout_secs: u64,
    /// Used to drop stale `known_hosts` entries for recycled addresses.
    /// Empty disables the cleanup.
    pub ssh_keygen_bin: String,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            openstack_bin: "openstack".to_string(),
            image_id: String::new(),
            instance_type: "m1.large".to_string(),
            network_id: String::new(),
            key_pair: "batchscale".to_string(),
            security_groups: vec!["default".to_string()],
            ssh_port: 22,
            probe_timeout_secs: 5,
            retry_delay_secs: 5,
            max_attempts: 120,
            create_timeout_secs: 900,
            ssh_keygen_bin: "ssh-keygen".to_string(),
        }
    }
}

impl ProvisionConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn create_timeout(&self) -> Duration {
        Duration::from_secs(self.create_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigureConfig {
    pub ansible_playbook_bin: String,
    /// Working directory for the playbook run.
    pub playbook_root: PathBuf,
    /// Playbook path, relative to `playbook_root` unless absolute.
    pub playbook: PathBuf,
    /// Where the rendered inventory is written. Overwritten on every apply.
    pub inventory_path: PathBuf,
    /// Optional virtualenv whose `bin/` is put first on `PATH`.
    pub venv_path: Option<PathBuf>,
    /// Inventory host name of the cluster controller.
    pub controller: String,
    /// Inventory group holding the worker nodes.
    pub worker_group: String,
    /// Groups the controller host is listed in.
    pub controller_groups: Vec<String>,
    /// Groups that take the worker group as a child.
    pub worker_parent_groups: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for ConfigureConfig {
    fn default() -> Self {
        Self {
            ansible_playbook_bin: "ansible-playbook".to_string(),
            playbook_root: PathBuf::from("/opt/batchscale/playbook"),
            playbook: PathBuf::from("playbook.yml"),
            inventory_path: PathBuf::from("/opt/batchscale/playbook/inventory"),
            venv_path: None,
            controller: "localhost".to_string(),
            worker_group: "workers".to_string(),
            controller_groups: ["controllers", "slurmservers", "slurmclients"]
                .map(str::to_string)
                .to_vec(),
            worker_parent_groups: ["slurmclients", "slurmexechosts"].map(str::to_string).to_vec(),
            timeout_secs: 3600,
        }
    }
}

impl ConfigureConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodesConfig {
    /// Scheduler lookups made after a successful apply before giving up
    /// on seeing the new node.
    pub join_attempts: u32,
    pub join_delay_secs: u64,
}

impl Default for NodesConfig {
    fn default() -> Self {
        Self {
            join_attempts: 6,
            join_delay_secs: 10,
        }
    }
}

impl NodesConfig {
    pub fn join_delay(&self) -> Duration {
        Duration::from_secs(self.join_delay_secs)
    }
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source,
        })
    }

    /// Load from `explicit` if given, otherwise from the first existing
    /// default location (user file before system file).
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }

        let candidates = default_locations();
        for path in &candidates {
            if path.is_file() {
                return Self::from_file(path);
            }
        }

        let searched = candidates
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(", ");
        Err(ConfigError::NotFound(searched))
    }

    /// Check values a running daemon cannot do without.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.autoscale.node_prefix.is_empty() {
            return Err(ConfigError::Invalid("autoscale.node_prefix is empty".into()));
        }
        if self.autoscale.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "autoscale.poll_interval_secs must be positive".into(),
            ));
        }
        if self.provision.image_id.is_empty() {
            return Err(ConfigError::Invalid("provision.image_id is required".into()));
        }
        if self.provision.network_id.is_empty() {
            return Err(ConfigError::Invalid("provision.network_id is required".into()));
        }
        if self.provision.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "provision.max_attempts must be positive".into(),
            ));
        }
        if self.nodes.join_attempts == 0 {
            return Err(ConfigError::Invalid(
                "nodes.join_attempts must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn to_toml_string(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

fn default_locations() -> Vec<PathBuf> {
    let mut locations = Vec::new();
    if let Some(home) = std::env::var_os("HOME") {
        locations.push(PathBuf::from(home).join(USER_CONFIG_FILE));
    }
    locations.push(PathBuf::from(SYSTEM_CONFIG_PATH));
    locations
}
