use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;

use nimbus_core::admin::{AdminCmd, AdminTask, TaskResponse, TaskStatus};
use nimbus_core::raft::MemoryRaft;
use nimbus_core::types::{DataLoadResponse, MetaLoadResponse, NodeKind, Peer};
use nimbus_core::{PartitionId, GIB};

use crate::cluster::Cluster;
use crate::config::Config;
use crate::database::Database;
use crate::dispatch::TaskTransport;
use crate::journal::{Journal, RaftCmd};
use crate::partitions::{Partition, PartitionKind, ReplicaMeta};
use crate::topology::Node;
use crate::volumes::{Volume, VolumeStatus};

/// A task transport recording every dispatch, with per-address failure
/// injection and canned load responses.
#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<(String, AdminTask)>>,
    fail_addrs: Mutex<HashSet<String>>,
    meta_loads: Mutex<HashMap<(String, PartitionId), MetaLoadResponse>>,
    data_loads: Mutex<HashMap<(String, PartitionId), DataLoadResponse>>,
}

impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Everything sent so far, in dispatch order.
    pub fn sent(&self) -> Vec<(String, AdminTask)> {
        self.sent.lock().clone()
    }

    /// The operation names dispatched so far, in order.
    pub fn sent_ops(&self) -> Vec<&'static str> {
        self.sent.lock().iter().map(|(_, task)| task.cmd.name()).collect()
    }

    pub fn set_fail(&self, addr: &str) {
        self.fail_addrs.lock().insert(addr.to_string());
    }

    pub fn clear_fail(&self, addr: &str) {
        self.fail_addrs.lock().remove(addr);
    }

    pub fn set_meta_load(&self, addr: &str, partition_id: PartitionId, response: MetaLoadResponse) {
        self.meta_loads.lock().insert((addr.to_string(), partition_id), response);
    }

    pub fn set_data_load(&self, addr: &str, partition_id: PartitionId, response: DataLoadResponse) {
        self.data_loads.lock().insert((addr.to_string(), partition_id), response);
    }
}

#[async_trait]
impl TaskTransport for RecordingTransport {
    async fn send(&self, addr: &str, mut task: AdminTask) -> Result<AdminTask> {
        if self.fail_addrs.lock().contains(addr) {
            self.sent.lock().push((addr.to_string(), task.clone()));
            bail!("injected transport failure for {}", addr);
        }
        self.sent.lock().push((addr.to_string(), task.clone()));
        let body = match &task.cmd {
            AdminCmd::LoadPartition(req) => {
                let key = (addr.to_string(), req.partition_id);
                if let Some(response) = self.meta_loads.lock().get(&key) {
                    serde_json::to_vec(response)?
                } else if let Some(response) = self.data_loads.lock().get(&key) {
                    serde_json::to_vec(response)?
                } else {
                    serde_json::to_vec(&TaskResponse::default())?
                }
            }
            _ => serde_json::to_vec(&TaskResponse {
                status: TaskStatus::Succeeded,
                result: String::new(),
            })?,
        };
        task.response = Some(body);
        task.status = TaskStatus::Succeeded;
        Ok(task)
    }
}

/// A fully wired single-node cluster against the in-memory consensus group.
pub struct TestCluster {
    pub cluster: Arc<Cluster>,
    pub raft: Arc<MemoryRaft>,
    pub transport: Arc<RecordingTransport>,
    _db: Database,
    _tmpdir: tempfile::TempDir,
}

pub async fn test_cluster() -> Result<TestCluster> {
    let (config, tmpdir) = Config::new_test()?;
    let db = Database::new(config.clone()).await?;
    let tree = db.journal_state_tree().await?;
    let raft = MemoryRaft::new(1);
    let journal = Journal::new(raft.clone(), tree);
    let apply_journal = journal.clone();
    raft.set_apply(Arc::new(move |data| apply_journal.apply(data)));
    let transport = RecordingTransport::new();
    let cluster = Cluster::new("test-cluster", config, raft.clone(), journal, transport.clone());
    Ok(TestCluster {
        cluster,
        raft,
        transport,
        _db: db,
        _tmpdir: tmpdir,
    })
}

impl TestCluster {
    /// Register a node and mark it active with free space.
    pub async fn add_active_node(&self, kind: NodeKind, addr: &str, zone: &str) -> Result<Arc<Node>> {
        self.cluster.register_node(kind, addr, zone).await.context("error registering node")?;
        let node = self.cluster.topology.node(kind, addr)?;
        node.update_metrics(0, 10 * GIB, time::OffsetDateTime::now_utc().unix_timestamp());
        Ok(node)
    }

    pub fn add_volume(&self, id: u64, name: &str, replica_num: u8) {
        self.cluster.volumes.put(Volume {
            id,
            name: name.to_string(),
            dp_replica_num: replica_num,
            mp_replica_num: replica_num,
            status: VolumeStatus::Normal,
            capacity: 100 * GIB,
            owner: "tester".into(),
            zone_name: "default".into(),
            cross_zone: false,
            create_time: 0,
        });
    }

    /// Create a partition over the given hosts, with the first host as the
    /// reported raft leader, and journal its creation.
    pub async fn add_partition(&self, id: PartitionId, vol_id: u64, vol_name: &str, kind: PartitionKind, hosts: &[&str]) -> Result<Arc<Partition>> {
        self.add_partition_with_n(id, vol_id, vol_name, kind, hosts, hosts.len() as u8).await
    }

    /// Create a partition with an explicit replica count, which may exceed
    /// the number of seeded hosts (an under-replicated group).
    pub async fn add_partition_with_n(
        &self, id: PartitionId, vol_id: u64, vol_name: &str, kind: PartitionKind, hosts: &[&str], replica_num: u8,
    ) -> Result<Arc<Partition>> {
        let node_kind = Cluster::node_kind(kind);
        let partition = Arc::new(match kind {
            PartitionKind::Data => Partition::new(id, vol_id, vol_name, kind, replica_num),
            PartitionKind::Meta => Partition::new_meta(id, vol_id, vol_name, replica_num, 0, 1 << 24),
        });
        let mut peers = Vec::with_capacity(hosts.len());
        for host in hosts {
            let node = self.cluster.topology.node(node_kind, host)?;
            peers.push(Peer::new(node.id, *host));
        }
        partition
            .apply_membership(hosts.iter().map(|host| host.to_string()).collect(), peers, vec![])
            .context("error applying membership")?;
        let now = time::OffsetDateTime::now_utc().unix_timestamp();
        for (idx, host) in hosts.iter().enumerate() {
            partition.update_replica(ReplicaMeta {
                addr: host.to_string(),
                is_leader: idx == 0,
                used: GIB,
                total: 10 * GIB,
                last_report: now,
                ..Default::default()
            });
        }
        self.cluster.partitions.put(partition.clone());
        self.cluster.journal.sync_add_partition(&partition).await.context("error journaling partition")?;
        Ok(partition)
    }

    /// Decode every command committed through the consensus group.
    pub fn committed_cmds(&self) -> Vec<RaftCmd> {
        self.raft
            .committed()
            .iter()
            .map(|data| RaftCmd::unmarshal(data).expect("undecodable raft command in test log"))
            .collect()
    }
}
