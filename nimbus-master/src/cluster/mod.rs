//! The cluster control plane.
//!
//! `Cluster` aggregates the topology registry, the partition registry, the
//! persistent journal and the task transport, and carries the replica-set
//! transactions (`replica_sets`) and the leader-only reconciliation
//! sweepers (`sweepers`).

pub mod replica_sets;
#[cfg(test)]
mod replica_sets_test;
pub mod sweepers;

use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::RwLock;

use nimbus_core::raft::RaftGroup;
use nimbus_core::types::{HeartbeatReport, NodeKind};
use nimbus_core::NodeId;

use crate::config::Config;
use crate::dispatch::TaskTransport;
use crate::error::ClusterResult;
use crate::ids::IdAllocator;
use crate::journal::{self, ClusterValue, Journal, NodeSetValue, NodeValue, PartitionValue};
use crate::partitions::{PartitionKind, PartitionRegistry, ReplicaMeta};
use crate::topology::{Node, NodeSet, Topology};
use crate::volumes::{Volume, VolumeRegistry, VolumeStatus};

/// Seconds without a heartbeat before a node is marked inactive.
pub const NODE_TIMEOUT_SECS: i64 = 18;

/// Cluster-wide tunables, journaled under the cluster record.
#[derive(Clone, Debug)]
pub struct ClusterSettings {
    pub meta_node_threshold: f32,
    pub disable_auto_allocate: bool,
    pub data_node_delete_limit_rate: u64,
    pub meta_node_delete_batch_count: u64,
    pub meta_node_delete_worker_sleep_ms: u64,
    pub data_node_auto_repair_limit_rate: u64,
}

impl ClusterSettings {
    fn from_config(config: &Config) -> Self {
        Self {
            meta_node_threshold: config.meta_node_threshold,
            disable_auto_allocate: config.disable_auto_allocate,
            data_node_delete_limit_rate: config.data_node_delete_limit_rate,
            meta_node_delete_batch_count: config.meta_node_delete_batch_count,
            meta_node_delete_worker_sleep_ms: config.meta_node_delete_worker_sleep_ms,
            data_node_auto_repair_limit_rate: config.data_node_auto_repair_limit_rate,
        }
    }
}

/// The master's view of the whole cluster.
pub struct Cluster {
    pub name: String,
    pub config: Arc<Config>,
    pub raft: Arc<dyn RaftGroup>,
    pub journal: Arc<Journal>,
    pub topology: Arc<Topology>,
    pub volumes: Arc<VolumeRegistry>,
    pub partitions: Arc<PartitionRegistry>,
    pub ids: Arc<IdAllocator>,
    pub transport: Arc<dyn TaskTransport>,
    settings: RwLock<ClusterSettings>,
}

impl Cluster {
    pub fn new(
        name: impl Into<String>, config: Arc<Config>, raft: Arc<dyn RaftGroup>, journal: Arc<Journal>, transport: Arc<dyn TaskTransport>,
    ) -> Arc<Self> {
        let topology = Topology::new(config.default_zone_name.clone(), config.node_set_capacity);
        Arc::new(Self {
            name: name.into(),
            settings: RwLock::new(ClusterSettings::from_config(&config)),
            config,
            raft,
            journal,
            topology,
            volumes: Arc::new(VolumeRegistry::default()),
            partitions: Arc::new(PartitionRegistry::default()),
            ids: Arc::new(IdAllocator::default()),
            transport,
        })
    }

    pub fn is_leader(&self) -> bool {
        self.raft.is_leader()
    }

    pub fn settings(&self) -> ClusterSettings {
        self.settings.read().clone()
    }

    /// The node kind hosting replicas of the given partition kind.
    pub fn node_kind(kind: PartitionKind) -> NodeKind {
        match kind {
            PartitionKind::Data => NodeKind::Data,
            PartitionKind::Meta => NodeKind::Meta,
        }
    }

    fn now() -> i64 {
        time::OffsetDateTime::now_utc().unix_timestamp()
    }

    /// Register a node, creating its zone and node-set as needed.
    ///
    /// Idempotent per address; re-registration of a known address returns
    /// the existing ID.
    #[tracing::instrument(level = "trace", skip(self))]
    pub async fn register_node(&self, kind: NodeKind, addr: &str, zone_name: &str) -> ClusterResult<NodeId> {
        if let Ok(node) = self.topology.node(kind, addr) {
            return Ok(node.id);
        }
        let zone_name = if zone_name.is_empty() { self.topology.default_zone.clone() } else { zone_name.to_string() };

        let _guard = match kind {
            NodeKind::Data => self.topology.data_node_mutex.lock().await,
            NodeKind::Meta => self.topology.meta_node_mutex.lock().await,
        };
        let zone = self.topology.get_or_create_zone(&zone_name);
        let set = match zone.available_node_set(kind) {
            Some(set) => set,
            None => {
                let id = self.ids.next_common_id(&self.journal).await?;
                let set = NodeSet::new(id, self.topology.node_set_capacity, zone_name.clone());
                self.journal
                    .sync_add_node_set(&NodeSetValue {
                        id: set.id,
                        capacity: set.capacity,
                        zone_name: set.zone_name.clone(),
                    })
                    .await?;
                zone.put_node_set(set.clone());
                set
            }
        };

        let id = self.ids.next_common_id(&self.journal).await?;
        let node = Node::new(id, addr, kind, zone_name, Self::now());
        node.set_node_set_id(set.id);
        self.journal.sync_add_node(kind, &NodeValue::from_node(&node)).await?;
        self.topology.insert_node(node)?;
        tracing::info!(%kind, addr, node = id, "registered cluster node");
        Ok(id)
    }

    /// Remove a node from the roster by explicit admin action.
    pub async fn remove_node(&self, kind: NodeKind, addr: &str) -> ClusterResult<()> {
        let node = self.topology.node(kind, addr)?;
        self.journal.sync_delete_node(kind, &NodeValue::from_node(&node)).await?;
        self.topology.remove_node(kind, addr);
        Ok(())
    }

    /// Ingest a node heartbeat report.
    ///
    /// A node reporting for the first time is registered; a node reporting
    /// a different zone than recorded is atomically removed and reinserted
    /// under the node-kind mutex and journaled.
    #[tracing::instrument(level = "trace", skip(self, report), fields(addr = %report.addr))]
    pub async fn handle_heartbeat(&self, kind: NodeKind, report: HeartbeatReport) -> ClusterResult<()> {
        if self.topology.node(kind, &report.addr).is_err() {
            self.register_node(kind, &report.addr, &report.zone_name).await?;
        }
        let node = self.topology.node(kind, &report.addr)?;
        if node.to_be_offline() {
            return Ok(());
        }

        let zone_name = if report.zone_name.is_empty() { self.topology.default_zone.clone() } else { report.zone_name.clone() };
        if node.zone_name() != zone_name {
            self.adjust_node_zone(kind, &node, &zone_name).await?;
        }
        node.update_metrics(report.used, report.total, Self::now());

        for partition_report in &report.partition_reports {
            if !partition_report.vol_name.is_empty() {
                match self.volumes.get(&partition_report.vol_name) {
                    Ok(vol) if vol.status == VolumeStatus::MarkedDelete => continue,
                    Err(_) => continue,
                    _ => {}
                }
            }
            let Ok(partition) = self.partitions.get(partition_report.partition_id) else {
                continue;
            };
            if !partition.contains_host(&report.addr) {
                continue;
            }
            if partition_report.is_leader {
                partition.write().status = partition_report.status;
            }
            partition.update_replica(ReplicaMeta {
                addr: report.addr.clone(),
                disk_path: partition_report.disk_path.clone(),
                is_leader: partition_report.is_leader,
                status: partition_report.status,
                used: partition_report.used,
                total: partition_report.total,
                applied_id: partition_report.applied_id,
                max_inode_id: partition_report.max_inode_id,
                inode_count: partition_report.inode_count,
                dentry_count: partition_report.dentry_count,
                last_report: Self::now(),
            });
        }
        Ok(())
    }

    /// Move a node whose heartbeat reports a new zone.
    async fn adjust_node_zone(&self, kind: NodeKind, node: &Arc<Node>, zone_name: &str) -> ClusterResult<()> {
        let _guard = match kind {
            NodeKind::Data => self.topology.data_node_mutex.lock().await,
            NodeKind::Meta => self.topology.meta_node_mutex.lock().await,
        };
        let old_zone = node.zone_name();
        self.topology.remove_node(kind, &node.addr);
        node.set_zone_name(zone_name);

        let zone = self.topology.get_or_create_zone(zone_name);
        let set = match zone.available_node_set(kind) {
            Some(set) => set,
            None => {
                let id = self.ids.next_common_id(&self.journal).await?;
                let set = NodeSet::new(id, self.topology.node_set_capacity, zone_name.to_string());
                self.journal
                    .sync_add_node_set(&NodeSetValue {
                        id: set.id,
                        capacity: set.capacity,
                        zone_name: set.zone_name.clone(),
                    })
                    .await?;
                zone.put_node_set(set.clone());
                set
            }
        };
        let old_set = node.node_set_id();
        node.set_node_set_id(set.id);
        if let Err(err) = self.journal.sync_update_node(kind, &NodeValue::from_node(node)).await {
            node.set_node_set_id(old_set);
            node.set_zone_name(old_zone);
            return Err(err);
        }
        self.topology.insert_node(node.clone())?;
        tracing::warn!(addr = %node.addr, from = %old_zone, to = %zone_name, "node zone changed");
        Ok(())
    }

    /// Journal the current cluster-wide settings.
    pub async fn sync_put_cluster(&self) -> ClusterResult<()> {
        let settings = self.settings();
        self.journal
            .sync_put_cluster(&ClusterValue {
                name: self.name.clone(),
                threshold: settings.meta_node_threshold,
                disable_auto_allocate: settings.disable_auto_allocate,
                data_node_delete_limit_rate: settings.data_node_delete_limit_rate,
                meta_node_delete_batch_count: settings.meta_node_delete_batch_count,
                meta_node_delete_worker_sleep_ms: settings.meta_node_delete_worker_sleep_ms,
                data_node_auto_repair_limit_rate: settings.data_node_auto_repair_limit_rate,
            })
            .await
    }

    /// Rebuild the in-memory state from the journal's stored records.
    ///
    /// Loads in strict order: cluster config, node-sets, data nodes, meta
    /// nodes, volumes, meta partitions, data partitions, ID high-water
    /// marks. User/token/access-key records have no in-memory model inside
    /// the core and are left as stored records. Replaying twice produces
    /// identical in-memory state.
    pub fn restore(&self) -> Result<()> {
        self.load_cluster()?;
        self.load_node_sets()?;
        self.load_nodes(NodeKind::Data)?;
        self.load_nodes(NodeKind::Meta)?;
        self.load_vols()?;
        self.load_partitions(PartitionKind::Meta)?;
        self.load_partitions(PartitionKind::Data)?;
        self.load_ids()?;
        Ok(())
    }

    fn load_cluster(&self) -> Result<()> {
        for (_, value) in self.journal.scan_prefix(journal::PREFIX_CLUSTER)? {
            let cv: ClusterValue = serde_json::from_slice(&value).context("error decoding cluster record")?;
            let mut settings = self.settings.write();
            settings.meta_node_threshold = cv.threshold;
            settings.disable_auto_allocate = cv.disable_auto_allocate;
            settings.data_node_delete_limit_rate = cv.data_node_delete_limit_rate;
            settings.meta_node_delete_batch_count = cv.meta_node_delete_batch_count;
            settings.meta_node_delete_worker_sleep_ms = cv.meta_node_delete_worker_sleep_ms;
            settings.data_node_auto_repair_limit_rate = cv.data_node_auto_repair_limit_rate;
            tracing::info!(threshold = cv.threshold, "restored cluster settings");
        }
        Ok(())
    }

    fn load_node_sets(&self) -> Result<()> {
        for (_, value) in self.journal.scan_prefix(journal::PREFIX_NODE_SET)? {
            let nsv: NodeSetValue = serde_json::from_slice(&value).context("error decoding node-set record")?;
            let zone_name = if nsv.zone_name.is_empty() { self.topology.default_zone.clone() } else { nsv.zone_name };
            let zone = self.topology.get_or_create_zone(&zone_name);
            zone.put_node_set(NodeSet::new(nsv.id, nsv.capacity, zone_name));
        }
        Ok(())
    }

    fn load_nodes(&self, kind: NodeKind) -> Result<()> {
        let prefix = match kind {
            NodeKind::Data => journal::PREFIX_DATA_NODE,
            NodeKind::Meta => journal::PREFIX_META_NODE,
        };
        for (_, value) in self.journal.scan_prefix(prefix)? {
            let nv: NodeValue = serde_json::from_slice(&value).context("error decoding node record")?;
            // An address reused by a newer node ID wins over older records.
            if let Ok(existing) = self.topology.node(kind, &nv.addr) {
                if existing.id >= nv.id {
                    continue;
                }
                self.topology.remove_node(kind, &nv.addr);
            }
            let zone_name = if nv.zone_name.is_empty() { self.topology.default_zone.clone() } else { nv.zone_name };
            let zone = self.topology.get_or_create_zone(&zone_name);
            if zone.get_node_set(nv.node_set_id).is_err() {
                zone.put_node_set(NodeSet::new(nv.node_set_id, self.topology.node_set_capacity, zone_name.clone()));
            }
            let node = Node::new(nv.id, nv.addr, kind, zone_name, Self::now());
            node.set_node_set_id(nv.node_set_id);
            if let Err(err) = self.topology.insert_node(node) {
                tracing::error!(error = %err, "error restoring node record");
            }
        }
        Ok(())
    }

    fn load_vols(&self) -> Result<()> {
        for (_, value) in self.journal.scan_prefix(journal::PREFIX_VOL)? {
            let vol: Volume = serde_json::from_slice(&value).context("error decoding volume record")?;
            tracing::info!(vol = %vol.name, "restored volume");
            self.volumes.put(vol);
        }
        Ok(())
    }

    fn load_partitions(&self, kind: PartitionKind) -> Result<()> {
        let prefix = match kind {
            PartitionKind::Data => journal::PREFIX_DATA_PARTITION,
            PartitionKind::Meta => journal::PREFIX_META_PARTITION,
        };
        let node_kind = Self::node_kind(kind);
        for (key, value) in self.journal.scan_prefix(prefix)? {
            let mut pv: PartitionValue = serde_json::from_slice(&value).context("error decoding partition record")?;
            let Ok(vol) = self.volumes.get(&pv.vol_name) else {
                tracing::error!(key = %key, vol = %pv.vol_name, "partition record references an unknown volume");
                continue;
            };
            if vol.id != pv.vol_id {
                tracing::warn!(key = %key, vol = %pv.vol_name, "partition record references a stale volume id");
                continue;
            }
            // Rewrite peer IDs for addresses reused by newer node IDs.
            for peer in pv.peers.iter_mut() {
                if let Ok(node) = self.topology.node(node_kind, &peer.addr) {
                    if node.id != peer.id {
                        peer.id = node.id;
                    }
                }
            }
            for learner in pv.learners.iter_mut() {
                if let Ok(node) = self.topology.node(node_kind, &learner.addr) {
                    if node.id != learner.id {
                        learner.id = node.id;
                    }
                }
            }
            match pv.into_partition(kind) {
                Ok(partition) => self.partitions.put(Arc::new(partition)),
                Err(err) => tracing::error!(error = %err, key = %key, "error restoring partition record"),
            }
        }
        Ok(())
    }

    fn load_ids(&self) -> Result<()> {
        let mut marks = [0u64; 3];
        for (idx, key) in [journal::KEY_MAX_COMMON_ID, journal::KEY_MAX_DATA_PARTITION_ID, journal::KEY_MAX_META_PARTITION_ID]
            .into_iter()
            .enumerate()
        {
            if let Some(value) = self.journal.get(key)? {
                marks[idx] = serde_json::from_slice(&value).context("error decoding id high-water mark")?;
            }
        }
        self.ids.restore(marks[0], marks[1], marks[2]);
        Ok(())
    }
}
