//! armadad.toml configuration.
//!
//! Every field has a default, so an empty file is a valid config for a
//! single machine talking to a local etcd.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::machine::parse_metadata;

/// Which store the daemon coordinates through.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Etcd,
    /// In-process store; only meaningful for a single-machine cluster.
    Memory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub store: StoreBackend,
    pub etcd_servers: Vec<String>,
    pub etcd_key_prefix: String,
    pub etcd_request_timeout_ms: u64,
    pub public_ip: String,
    /// `"k=v,k2=v2"`
    pub metadata: String,
    pub agent_ttl_secs: u64,
    pub engine_reconcile_interval_secs: u64,
    pub unit_state_publish_interval_secs: u64,
    pub disable_engine: bool,
    pub enable_grpc: bool,
    pub rpc_port: u16,
    pub unit_spool_dir: PathBuf,
    pub machine_id_file: PathBuf,
    /// Overrides `machine_id_file` when set.
    pub machine_id: Option<String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            store: StoreBackend::Etcd,
            etcd_servers: vec!["http://127.0.0.1:2379".to_string()],
            etcd_key_prefix: "/fleet/".to_string(),
            etcd_request_timeout_ms: 1000,
            public_ip: String::new(),
            metadata: String::new(),
            agent_ttl_secs: 30,
            engine_reconcile_interval_secs: 2,
            unit_state_publish_interval_secs: 5,
            disable_engine: false,
            enable_grpc: false,
            rpc_port: 50059,
            unit_spool_dir: PathBuf::from("/var/lib/armada/units"),
            machine_id_file: PathBuf::from("/etc/machine-id"),
            machine_id: None,
        }
    }
}

impl DaemonConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let config: DaemonConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.store == StoreBackend::Etcd && self.etcd_servers.is_empty() {
            anyhow::bail!("etcd_servers must not be empty");
        }
        if self.agent_ttl_secs < 2 {
            anyhow::bail!("agent_ttl_secs must be at least 2");
        }
        if self.engine_reconcile_interval_secs == 0 {
            anyhow::bail!("engine_reconcile_interval_secs must be positive");
        }
        if self.unit_state_publish_interval_secs == 0 {
            anyhow::bail!("unit_state_publish_interval_secs must be positive");
        }
        parse_metadata(&self.metadata).map_err(anyhow::Error::msg)?;
        Ok(())
    }

    pub fn metadata_map(&self) -> anyhow::Result<BTreeMap<String, String>> {
        parse_metadata(&self.metadata).map_err(anyhow::Error::msg)
    }

    pub fn agent_ttl(&self) -> Duration {
        Duration::from_secs(self.agent_ttl_secs)
    }

    pub fn engine_reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.engine_reconcile_interval_secs)
    }

    pub fn unit_state_publish_interval(&self) -> Duration {
        Duration::from_secs(self.unit_state_publish_interval_secs)
    }

    pub fn etcd_request_timeout(&self) -> Duration {
        Duration::from_millis(self.etcd_request_timeout_ms)
    }
}
