//! Runtime configuration.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Deserialize;

fn default_data_path() -> String {
    "/usr/local/nimbus/replica".into()
}
fn default_zone_name() -> String {
    "default".into()
}

/// Runtime configuration data.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The server's logging config, which uses Rust's `env_logger` directives.
    #[serde(default)]
    pub rust_log: String,
    /// The port which partition wire traffic is to use.
    pub listen: u16,
    /// The local node's own address, as the master and peers see it.
    pub local_addr: String,
    /// The addresses of the master nodes.
    #[serde(default)]
    pub master_addr: Vec<String>,
    /// The directory holding per-partition raft data.
    pub raft_dir: String,
    /// The port used for raft heartbeat traffic.
    pub raft_heartbeat_port: u16,
    /// The port used for raft replication traffic.
    pub raft_replica_port: u16,
    /// The root path for partition data on disk.
    #[serde(default = "default_data_path")]
    pub storage_data_path: String,
    /// The failure-domain zone this node reports to the master.
    #[serde(default = "default_zone_name")]
    pub zone_name: String,
}

impl Config {
    /// Create a new config instance from the runtime environment.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Result<Self> {
        let config: Config = envy::from_env().context("error building config from env")?;
        Ok(config)
    }

    /// Build an instance for use in tests.
    #[cfg(test)]
    pub fn new_test() -> Result<(Arc<Self>, tempfile::TempDir)> {
        let tmpdir = tempfile::tempdir_in("/tmp").context("error creating tmp dir in /tmp")?;
        Ok((
            Arc::new(Self {
                rust_log: "".into(),
                listen: 17310,
                local_addr: "127.0.0.1:17310".into(),
                master_addr: vec!["127.0.0.1:17010".into()],
                raft_dir: tmpdir.path().join("raft").to_string_lossy().to_string(),
                raft_heartbeat_port: 17311,
                raft_replica_port: 17312,
                storage_data_path: tmpdir.path().to_string_lossy().to_string(),
                zone_name: default_zone_name(),
            }),
            tmpdir,
        ))
    }
}
