//! Command-line flags. Every flag overrides the matching config field.

use std::path::PathBuf;

use anyhow::Context;
use armada_core::{DaemonConfig, StoreBackend};
use clap::{Parser, ValueEnum};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StoreArg {
    Etcd,
    Memory,
}

impl From<StoreArg> for StoreBackend {
    fn from(arg: StoreArg) -> Self {
        match arg {
            StoreArg::Etcd => StoreBackend::Etcd,
            StoreArg::Memory => StoreBackend::Memory,
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "armadad", version, about = "Armada cluster unit daemon")]
pub struct Cli {
    /// Path to armadad.toml.
    #[arg(long)]
    pub config: Option<PathBuf>,

    #[arg(long, value_enum, default_value = "text")]
    pub log_format: LogFormat,

    /// Print the effective configuration and exit.
    #[arg(long)]
    pub print_config: bool,

    #[arg(long, value_enum)]
    pub store: Option<StoreArg>,

    /// Comma-separated etcd endpoints.
    #[arg(long, value_delimiter = ',')]
    pub etcd_servers: Vec<String>,

    #[arg(long)]
    pub etcd_key_prefix: Option<String>,

    #[arg(long)]
    pub public_ip: Option<String>,

    /// `k=v,k2=v2`
    #[arg(long)]
    pub metadata: Option<String>,

    #[arg(long)]
    pub agent_ttl_secs: Option<u64>,

    #[arg(long)]
    pub engine_reconcile_interval_secs: Option<u64>,

    #[arg(long)]
    pub disable_engine: bool,

    #[arg(long)]
    pub enable_grpc: bool,

    #[arg(long)]
    pub rpc_port: Option<u16>,

    #[arg(long)]
    pub unit_spool_dir: Option<PathBuf>,

    #[arg(long)]
    pub machine_id: Option<String>,
}

impl Cli {
    /// Load the config file, if any, then apply flag overrides.
    pub fn load_config(&self) -> anyhow::Result<DaemonConfig> {
        let mut config = match &self.config {
            Some(path) => DaemonConfig::from_file(path)
                .with_context(|| format!("loading config {}", path.display()))?,
            None => DaemonConfig::default(),
        };
        self.apply(&mut config);
        config.validate().context("invalid configuration")?;
        Ok(config)
    }

    pub fn apply(&self, config: &mut DaemonConfig) {
        if let Some(store) = self.store {
            config.store = store.into();
        }
        if !self.etcd_servers.is_empty() {
            config.etcd_servers = self.etcd_servers.clone();
        }
        if let Some(prefix) = &self.etcd_key_prefix {
            config.etcd_key_prefix = prefix.clone();
        }
        if let Some(ip) = &self.public_ip {
            config.public_ip = ip.clone();
        }
        if let Some(metadata) = &self.metadata {
            config.metadata = metadata.clone();
        }
        if let Some(ttl) = self.agent_ttl_secs {
            config.agent_ttl_secs = ttl;
        }
        if let Some(interval) = self.engine_reconcile_interval_secs {
            config.engine_reconcile_interval_secs = interval;
        }
        config.disable_engine |= self.disable_engine;
        config.enable_grpc |= self.enable_grpc;
        if let Some(port) = self.rpc_port {
            config.rpc_port = port;
        }
        if let Some(dir) = &self.unit_spool_dir {
            config.unit_spool_dir = dir.clone();
        }
        if let Some(id) = &self.machine_id {
            config.machine_id = Some(id.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("armadad.toml");
        std::fs::write(&path, "agent_ttl_secs = 10\nmetadata = \"region=us-east\"\n").unwrap();

        let cli = Cli::try_parse_from([
            "armadad",
            "--config",
            path.to_str().unwrap(),
            "--store",
            "memory",
            "--metadata",
            "region=eu-west",
            "--enable-grpc",
        ])
        .unwrap();
        let config = cli.load_config().unwrap();
        assert_eq!(config.store, StoreBackend::Memory);
        assert_eq!(config.agent_ttl_secs, 10);
        assert_eq!(config.metadata, "region=eu-west");
        assert!(config.enable_grpc);
        assert!(!config.disable_engine);
    }

    #[test]
    fn etcd_servers_split_on_commas() {
        let cli = Cli::try_parse_from(["armadad", "--etcd-servers", "http://a:2379,http://b:2379"]).unwrap();
        let config = cli.load_config().unwrap();
        assert_eq!(config.etcd_servers, ["http://a:2379", "http://b:2379"]);
    }

    #[test]
    fn bad_metadata_is_rejected() {
        let cli = Cli::try_parse_from(["armadad", "--metadata", "novalue"]).unwrap();
        assert!(cli.load_config().is_err());
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let cli = Cli::try_parse_from(["armadad", "--config", "/nonexistent/armadad.toml"]).unwrap();
        assert!(cli.load_config().is_err());
    }

    #[test]
    fn json_log_format() {
        let cli = Cli::try_parse_from(["armadad", "--log-format", "json"]).unwrap();
        assert_eq!(cli.log_format, LogFormat::Json);
    }
}
