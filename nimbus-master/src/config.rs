//! Runtime configuration.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Deserialize;

fn default_node_set_capacity() -> usize {
    18
}
fn default_meta_node_threshold() -> f32 {
    0.75
}
fn default_data_partition_timeout_sec() -> i64 {
    60
}
fn default_diff_space_usage() -> u64 {
    1024 * 1024 * 1024
}
fn default_zone_name() -> String {
    "default".into()
}
fn default_interval_check_partition_secs() -> u64 {
    60
}
fn default_time_to_wait_for_response_secs() -> u64 {
    120
}
fn default_retry_sync_task_interval_ms() -> u64 {
    500
}
fn default_meta_partition_inode_lag() -> u64 {
    1 << 22
}
fn default_count_difference_allowed() -> u64 {
    50
}

/// Runtime configuration data.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The server's logging config, which uses Rust's `env_logger` directives.
    #[serde(default)]
    pub rust_log: String,
    /// The port which admin network traffic is to use.
    pub listen: u16,
    /// The addresses of all master nodes, including this one.
    #[serde(default)]
    pub master_addr: Vec<String>,
    /// The local node's own address, as peers see it.
    pub local_addr: String,
    /// The directory holding the master's own raft data.
    pub raft_dir: String,
    /// The port used for raft heartbeat traffic.
    pub raft_heartbeat_port: u16,
    /// The port used for raft replication traffic.
    pub raft_replica_port: u16,

    /// Maximum number of nodes per node-set.
    #[serde(default = "default_node_set_capacity")]
    pub node_set_capacity: usize,
    /// Memory-usage ratio past which a meta node stops taking new ranges.
    #[serde(default = "default_meta_node_threshold")]
    pub meta_node_threshold: f32,
    /// Rate limit applied to data-node delete traffic.
    #[serde(default)]
    pub data_node_delete_limit_rate: u64,
    /// Batch size for meta-node delete workers.
    #[serde(default)]
    pub meta_node_delete_batch_count: u64,
    /// Sleep between meta-node delete worker batches, in milliseconds.
    #[serde(default)]
    pub meta_node_delete_worker_sleep_ms: u64,
    /// Rate limit applied to data-node auto repair.
    #[serde(default)]
    pub data_node_auto_repair_limit_rate: u64,
    /// Seconds without a report before a data partition replica is missing.
    #[serde(default = "default_data_partition_timeout_sec")]
    pub data_partition_timeout_sec: i64,
    /// Allowed spread of used-space between replicas of one partition.
    #[serde(default = "default_diff_space_usage")]
    pub diff_space_usage: u64,
    /// When set, no new partitions are allocated automatically.
    #[serde(default)]
    pub disable_auto_allocate: bool,
    /// Zone assigned to nodes which do not report one.
    #[serde(default = "default_zone_name")]
    pub default_zone_name: String,

    /// The path to the database on disk.
    #[serde(default = "crate::database::default_data_path")]
    pub storage_data_path: String,

    /// Period of the recovery and load-check sweepers.
    #[serde(default = "default_interval_check_partition_secs")]
    pub interval_check_partition_secs: u64,
    /// How long a load-check waits for every replica to respond.
    #[serde(default = "default_time_to_wait_for_response_secs")]
    pub time_to_wait_for_response_secs: u64,
    /// Sleep between attempts of a leader-first task dispatch.
    #[serde(default = "default_retry_sync_task_interval_ms")]
    pub retry_sync_task_interval_ms: u64,
    /// Max-inode-id spread under which a meta partition counts as caught up.
    #[serde(default = "default_meta_partition_inode_lag")]
    pub meta_partition_inode_lag: u64,
    /// Allowed inode/dentry count spread between replicas of one partition.
    #[serde(default = "default_count_difference_allowed")]
    pub count_difference_allowed: u64,
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
                listen: 17010,
                master_addr: vec!["127.0.0.1:17010".into()],
                local_addr: "127.0.0.1:17010".into(),
                raft_dir: tmpdir.path().join("raft").to_string_lossy().to_string(),
                raft_heartbeat_port: 17011,
                raft_replica_port: 17012,
                node_set_capacity: default_node_set_capacity(),
                meta_node_threshold: default_meta_node_threshold(),
                data_node_delete_limit_rate: 0,
                meta_node_delete_batch_count: 0,
                meta_node_delete_worker_sleep_ms: 0,
                data_node_auto_repair_limit_rate: 0,
                data_partition_timeout_sec: default_data_partition_timeout_sec(),
                diff_space_usage: default_diff_space_usage(),
                disable_auto_allocate: false,
                default_zone_name: default_zone_name(),
                storage_data_path: tmpdir.path().to_string_lossy().to_string(),
                interval_check_partition_secs: default_interval_check_partition_secs(),
                time_to_wait_for_response_secs: 1,
                retry_sync_task_interval_ms: 1,
                meta_partition_inode_lag: default_meta_partition_inode_lag(),
                count_difference_allowed: default_count_difference_allowed(),
            }),
            tmpdir,
        ))
    }
}
