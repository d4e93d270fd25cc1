//! The replica wire server.
//!
//! Answers the per-partition protocol (applied-ID probes and broadcasts,
//! size probes) and executes admin tasks dispatched by the master
//! (replica lifecycle and raft membership changes).

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use dashmap::DashMap;
use futures::stream::StreamExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;

use nimbus_core::admin::{AdminCmd, AdminTask, HeartbeatResponse, TaskResponse, TaskStatus};
use nimbus_core::raft::{MemberChange, RaftGroup};
use nimbus_core::types::{DataLoadResponse, HeartbeatReport, MetaLoadResponse, PartitionReport, PartitionStatus};
use nimbus_core::wire::{
    Packet, OP_ADMIN_TASK, OP_BROADCAST_MIN_APPLIED_ID, OP_GET_APPLIED_ID, OP_GET_MAX_EXTENT_ID_AND_PARTITION_SIZE, OP_GET_PARTITION_SIZE,
};
use nimbus_core::PartitionId;

use crate::applied::{self, PeerClient};
use crate::config::Config;
use crate::extent::ExtentStore;
use crate::meta::CreateType;
use crate::partition::{ReplicaConfig, ReplicaPartition};
use crate::repair;

pub type RaftFactory = Box<dyn Fn(PartitionId) -> Arc<dyn RaftGroup> + Send + Sync>;
pub type ExtentFactory = Box<dyn Fn(PartitionId) -> Arc<dyn ExtentStore> + Send + Sync>;

/// The replica node server.
pub struct ReplicaServer {
    config: Arc<Config>,
    node_id: u64,
    pub partitions: Arc<DashMap<PartitionId, Arc<ReplicaPartition>>>,
    client: Arc<dyn PeerClient>,
    raft_factory: RaftFactory,
    extent_factory: ExtentFactory,
    shutdown_tx: broadcast::Sender<()>,
}

impl ReplicaServer {
    pub fn new(
        config: Arc<Config>, node_id: u64, client: Arc<dyn PeerClient>, raft_factory: RaftFactory, extent_factory: ExtentFactory,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            node_id,
            partitions: Arc::new(DashMap::new()),
            client,
            raft_factory,
            extent_factory,
            shutdown_tx,
        })
    }

    fn partition(&self, id: PartitionId) -> Result<Arc<ReplicaPartition>> {
        self.partitions.get(&id).map(|p| p.value().clone()).with_context(|| format!("unknown partition {}", id))
    }

    fn partition_dir(&self, id: PartitionId) -> PathBuf {
        PathBuf::from(&self.config.storage_data_path).join("partitions").join(id.to_string())
    }

    /// Spawn the accept loop on the given listener.
    pub fn spawn(self: Arc<Self>, listener: TcpListener) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run(listener))
    }

    async fn run(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        tracing::info!(addr = ?listener.local_addr(), "replica server is online");
        let mut shutdown = BroadcastStream::new(self.shutdown_tx.subscribe());
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, _) = accepted.context("error accepting connection")?;
                    let this = self.clone();
                    tokio::spawn(async move { this.handle_conn(stream).await });
                }
                _ = shutdown.next() => break,
            }
        }
        tracing::info!("replica server has shutdown");
        Ok(())
    }

    async fn handle_conn(self: Arc<Self>, mut stream: TcpStream) {
        loop {
            let packet = match Packet::read_from(&mut stream).await {
                Ok(packet) => packet,
                Err(_) => return, // Peer hung up or sent garbage.
            };
            let response = self.dispatch(packet).await;
            if let Err(err) = response.write_to(&mut stream).await {
                tracing::warn!(error = ?err, "error writing response packet");
                return;
            }
        }
    }

    /// Dispatch a single request packet.
    #[tracing::instrument(level = "trace", skip(self, packet), fields(op = packet.opcode, partition = packet.partition_id))]
    pub async fn dispatch(&self, packet: Packet) -> Packet {
        let result = match packet.opcode {
            OP_GET_APPLIED_ID => self.handle_get_applied_id(&packet),
            OP_BROADCAST_MIN_APPLIED_ID => self.handle_broadcast_min(&packet),
            OP_GET_PARTITION_SIZE => self.handle_get_partition_size(&packet),
            OP_GET_MAX_EXTENT_ID_AND_PARTITION_SIZE => self.handle_get_max_extent_and_size(&packet),
            OP_ADMIN_TASK => self.handle_admin_task(&packet).await,
            other => Err(anyhow::anyhow!("unknown wire opcode {:#04x}", other)),
        };
        match result {
            Ok(payload) => packet.respond(payload),
            Err(err) => {
                tracing::warn!(error = ?err, partition = packet.partition_id, "request failed");
                packet.respond_err(err)
            }
        }
    }

    fn handle_get_applied_id(&self, packet: &Packet) -> Result<Vec<u8>> {
        let partition = self.partition(packet.partition_id)?;
        Ok(partition.applied_id().to_be_bytes().to_vec())
    }

    fn handle_broadcast_min(&self, packet: &Packet) -> Result<Vec<u8>> {
        let partition = self.partition(packet.partition_id)?;
        let min = packet.payload_u64()?;
        partition.set_min_applied_id(min);
        tracing::debug!(partition = partition.id, min, "received min applied id broadcast");
        Ok(Vec::new())
    }

    fn handle_get_partition_size(&self, packet: &Packet) -> Result<Vec<u8>> {
        let partition = self.partition(packet.partition_id)?;
        let extent_id = packet.payload_u64()?;
        let size = partition.extents.store_size_to_extent(extent_id);
        Ok(size.to_be_bytes().to_vec())
    }

    fn handle_get_max_extent_and_size(&self, packet: &Packet) -> Result<Vec<u8>> {
        let partition = self.partition(packet.partition_id)?;
        let max_extent_id = partition.extents.max_extent_id();
        let size = partition.extents.store_size_to_extent(max_extent_id);
        let mut payload = max_extent_id.to_be_bytes().to_vec();
        payload.extend_from_slice(&size.to_be_bytes());
        Ok(payload)
    }

    async fn handle_admin_task(&self, packet: &Packet) -> Result<Vec<u8>> {
        let mut task: AdminTask = serde_json::from_slice(&packet.payload).context("error decoding admin task")?;
        let body = match task.cmd.clone() {
            AdminCmd::Heartbeat => serde_json::to_vec(&self.heartbeat_response())?,
            AdminCmd::CreateReplica(req) => {
                self.create_replica(req).await?;
                serde_json::to_vec(&TaskResponse::default())?
            }
            AdminCmd::DeleteReplica(req) => {
                self.delete_replica(req.partition_id).await?;
                serde_json::to_vec(&TaskResponse::default())?
            }
            AdminCmd::LoadPartition(req) => self.load_partition(req.partition_id)?,
            AdminCmd::AddRaftMember(req) => {
                let partition = self.partition(req.partition_id)?;
                partition.raft().change_member(MemberChange::AddPeer(req.add_peer.clone())).await?;
                if partition.add_raft_node(req.add_peer) {
                    partition.persist_manifest().await?;
                }
                serde_json::to_vec(&TaskResponse::default())?
            }
            AdminCmd::RemoveRaftMember(req) => {
                let partition = self.partition(req.partition_id)?;
                partition.raft().change_member(MemberChange::RemovePeer(req.remove_peer.clone())).await?;
                let (updated, removed_self) = partition.remove_raft_node(&req.remove_peer);
                if removed_self {
                    partition.stop();
                    partition.raft().delete().await?;
                    self.partitions.remove(&req.partition_id);
                } else if updated {
                    partition.persist_manifest().await?;
                }
                serde_json::to_vec(&TaskResponse::default())?
            }
            AdminCmd::AddRaftLearner(req) => {
                let partition = self.partition(req.partition_id)?;
                partition.raft().change_member(MemberChange::AddLearner(req.add_learner.clone())).await?;
                if partition.add_raft_learner(req.add_learner) {
                    partition.persist_manifest().await?;
                }
                serde_json::to_vec(&TaskResponse::default())?
            }
            AdminCmd::PromoteRaftLearner(req) => {
                let partition = self.partition(req.partition_id)?;
                if !partition.promote_raft_learner(&req.promote_peer) {
                    bail!("partition {} has no learner {}", req.partition_id, req.promote_peer.addr);
                }
                partition.raft().change_member(MemberChange::PromoteLearner(req.promote_peer)).await?;
                partition.persist_manifest().await?;
                serde_json::to_vec(&TaskResponse::default())?
            }
            AdminCmd::ResetRaftMember(req) => {
                let partition = self.partition(req.partition_id)?;
                partition.raft().reset_member(req.new_peers.clone()).await?;
                partition.reset_raft_members(req.new_peers, req.new_learners);
                partition.persist_manifest().await?;
                serde_json::to_vec(&TaskResponse::default())?
            }
            AdminCmd::TryToLeader(req) => {
                let partition = self.partition(req.partition_id)?;
                partition.raft().try_to_leader(self.node_id).await?;
                serde_json::to_vec(&TaskResponse::default())?
            }
        };
        task.response = Some(body);
        task.status = TaskStatus::Succeeded;
        serde_json::to_vec(&task).context("error encoding admin task response")
    }

    /// Create a replica of a partition on this node. Idempotent.
    pub async fn create_replica(&self, req: nimbus_core::admin::CreateReplicaRequest) -> Result<()> {
        if self.partitions.contains_key(&req.partition_id) {
            return Ok(());
        }
        let dir = self.partition_dir(req.partition_id);
        tokio::fs::create_dir_all(&dir).await.context("error creating partition dir")?;

        let create_type = if req.repair { CreateType::Repair } else { CreateType::Normal };
        let config = ReplicaConfig {
            hosts: req.hosts,
            peers: req.peers,
            learners: req.learners,
            create_type,
            inode_range: req.inode_range,
        };
        let partition = ReplicaPartition::new(
            req.partition_id,
            req.vol_name,
            self.config.local_addr.clone(),
            self.node_id,
            dir,
            config,
            (self.raft_factory)(req.partition_id),
            (self.extent_factory)(req.partition_id),
        );
        partition.load_sidecar().await?;
        partition.persist_manifest().await?;

        match create_type {
            CreateType::Repair => {
                repair::spawn_wait_repair(partition.clone(), self.client.clone());
            }
            CreateType::Normal => {
                partition.start_raft()?;
            }
        }
        applied::spawn_log_schedule(partition.clone(), self.client.clone());
        self.partitions.insert(partition.id, partition);
        tracing::info!(partition = req.partition_id, ?create_type, "replica created");
        Ok(())
    }

    /// Stop and remove a replica, deleting its data directory.
    pub async fn delete_replica(&self, id: PartitionId) -> Result<()> {
        let Some((_, partition)) = self.partitions.remove(&id) else {
            return Ok(());
        };
        partition.stop();
        partition.raft().delete().await?;
        if let Err(err) = tokio::fs::remove_dir_all(&partition.path).await {
            tracing::warn!(error = ?err, partition = id, "error removing partition dir");
        }
        tracing::info!(partition = id, "replica deleted");
        Ok(())
    }

    fn load_partition(&self, id: PartitionId) -> Result<Vec<u8>> {
        let partition = self.partition(id)?;
        let do_compare = partition.is_raft_started() && partition.create_type() == CreateType::Normal;
        let body = if partition.config().inode_range.is_some() {
            serde_json::to_vec(&MetaLoadResponse {
                addr: self.config.local_addr.clone(),
                do_compare,
                applied_id: partition.applied_id(),
                max_inode_id: partition.max_inode_id.load(std::sync::atomic::Ordering::SeqCst),
                inode_count: partition.inode_count.load(std::sync::atomic::Ordering::SeqCst),
                dentry_count: partition.dentry_count.load(std::sync::atomic::Ordering::SeqCst),
            })?
        } else {
            let max_extent_id = partition.extents.max_extent_id();
            serde_json::to_vec(&DataLoadResponse {
                addr: self.config.local_addr.clone(),
                do_compare,
                applied_id: partition.applied_id(),
                used: partition.extents.store_size_to_extent(max_extent_id),
                extent_crcs: partition.extents.extent_crcs(),
            })?
        };
        Ok(body)
    }

    fn heartbeat_response(&self) -> HeartbeatResponse {
        let mut reports = Vec::with_capacity(self.partitions.len());
        let mut used = 0u64;
        for entry in self.partitions.iter() {
            let partition = entry.value();
            let max_extent_id = partition.extents.max_extent_id();
            let partition_used = partition.extents.store_size_to_extent(max_extent_id);
            used += partition_used;
            reports.push(PartitionReport {
                partition_id: partition.id,
                vol_name: partition.vol_name.clone(),
                is_leader: partition.is_raft_leader(),
                status: if partition.is_raft_started() { PartitionStatus::Writable } else { PartitionStatus::Unavailable },
                used: partition_used,
                total: 0,
                applied_id: partition.applied_id(),
                disk_path: partition.path.to_string_lossy().to_string(),
                max_inode_id: partition.max_inode_id.load(std::sync::atomic::Ordering::SeqCst),
                inode_count: partition.inode_count.load(std::sync::atomic::Ordering::SeqCst),
                dentry_count: partition.dentry_count.load(std::sync::atomic::Ordering::SeqCst),
            });
        }
        HeartbeatResponse {
            status: TaskStatus::Succeeded,
            result: String::new(),
            report: HeartbeatReport {
                addr: self.config.local_addr.clone(),
                zone_name: self.config.zone_name.clone(),
                used,
                total: 0,
                partition_reports: reports,
            },
        }
    }
}
