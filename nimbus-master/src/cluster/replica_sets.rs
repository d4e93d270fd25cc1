//! The replica-set controller.
//!
//! Each public operation is a transaction coordinating a remote
//! raft-membership RPC, a journal append, and the in-memory update, in that
//! order. Journal always precedes memory; a failure after a journal append
//! is not compensated automatically, the recovery sweeper re-evaluates the
//! partition on its next tick.

use std::sync::Arc;
use std::time::Duration;

use nimbus_core::admin::{
    AddRaftLearnerRequest, AddRaftMemberRequest, AdminCmd, AdminTask, CreateReplicaRequest, DeleteReplicaRequest, PromoteRaftLearnerRequest,
    RemoveRaftMemberRequest, ResetRaftMemberRequest, TryToLeaderRequest,
};
use nimbus_core::types::{Learner, Peer};
use nimbus_core::ClusterError;

use crate::cluster::Cluster;
use crate::error::ClusterResult;
use crate::partitions::{quorum_survives_removal, validate_membership, Partition, PartitionKind};
use crate::topology::Selection;

impl Cluster {
    /// Decommission one replica of a partition, backfilling a replacement.
    ///
    /// Rejected while the partition is recovering or while another offline
    /// operation is in flight. The victim's slot is refilled from the same
    /// node-set when possible, escalating to the zone and then cross-zone.
    #[tracing::instrument(level = "debug", skip(self, partition), fields(partition = partition.id))]
    pub async fn decommission(&self, partition: &Arc<Partition>, victim: &str) -> ClusterResult<()> {
        self.validate_decommission(partition, victim)?;
        let (target, _peer) = self.choose_target_host(partition, victim)?;

        self.delete_replica(partition, victim, false).await?;
        self.add_replica(partition, &target).await?;

        partition.write().is_recovering = true;
        self.partitions.mark_bad(victim, partition.id);
        self.journal.sync_update_partition(partition).await?;
        tracing::warn!(
            vol = %partition.vol_name,
            partition = partition.id,
            victim,
            target = %target,
            "partition replica decommissioned",
        );
        Ok(())
    }

    /// Validate that one replica of the partition may be taken offline.
    pub(crate) fn validate_decommission(&self, partition: &Partition, victim: &str) -> ClusterResult<()> {
        let state = partition.read();
        if !state.hosts.iter().any(|host| host == victim) {
            return Err(ClusterError::NotMember {
                partition: partition.id,
                addr: victim.to_string(),
            });
        }
        if state.is_recovering {
            return Err(ClusterError::InvariantViolation(format!(
                "partition {} is recovering, {} cannot be decommissioned",
                partition.id, victim
            )));
        }
        if state.offline_peer_id != 0 {
            return Err(ClusterError::ConcurrentOfflineInProgress {
                partition: partition.id,
                peer_id: state.offline_peer_id,
            });
        }
        if state.hosts.len() < partition.replica_num as usize {
            return Err(ClusterError::InvariantViolation(format!(
                "partition {} already misses a replica ({} of {})",
                partition.id,
                state.hosts.len(),
                partition.replica_num
            )));
        }
        let down = self.down_replicas_except(partition, victim);
        if !quorum_survives_removal(state.peers.len(), state.learners.len(), down, partition.replica_num) {
            return Err(ClusterError::QuorumWouldBreak {
                partition: partition.id,
                addr: victim.to_string(),
            });
        }
        Ok(())
    }

    /// Count the partition's replicas on inactive nodes, excluding `except`.
    pub(crate) fn down_replicas_except(&self, partition: &Partition, except: &str) -> usize {
        let kind = Self::node_kind(partition.kind);
        partition
            .read()
            .hosts
            .iter()
            .filter(|host| host.as_str() != except)
            .filter(|host| match self.topology.node(kind, host) {
                Ok(node) => !node.is_active(),
                Err(_) => true,
            })
            .count()
    }

    /// Pick a replacement host for a replica leaving `source`, with
    /// escalating exclusion: the source's node-set, then other sets in its
    /// zone, then other zones excluding the zones already hosting replicas.
    pub(crate) fn choose_target_host(&self, partition: &Partition, source: &str) -> ClusterResult<(String, Peer)> {
        let kind = Self::node_kind(partition.kind);
        let node = self.topology.node(kind, source)?;
        let zone_name = node.zone_name();

        let mut exclude_hosts = partition.read().hosts.clone();
        if !exclude_hosts.iter().any(|host| host == source) {
            exclude_hosts.push(source.to_string());
        }
        let topology = self.topology.clone();
        let mut exclude_zones = partition.live_zones(move |addr| topology.zone_of(addr), source);
        if exclude_zones.is_empty() {
            exclude_zones.push(zone_name.clone());
        }

        let (hosts, peers) = self
            .topology
            .get_avail_hosts(
                kind,
                Selection {
                    count: 1,
                    exclude_hosts: &exclude_hosts,
                    exclude_sets: &[],
                    exclude_zones: &exclude_zones,
                    preferred: Some((zone_name, node.node_set_id())),
                },
            )
            .map_err(|err| match err {
                ClusterError::InsufficientCapacity { .. } => ClusterError::NoEligibleTarget { partition: partition.id },
                other => other,
            })?;
        Ok((hosts[0].clone(), peers[0].clone()))
    }

    /// Add a voting replica on the given address.
    #[tracing::instrument(level = "debug", skip(self, partition), fields(partition = partition.id))]
    pub async fn add_replica(&self, partition: &Arc<Partition>, addr: &str) -> ClusterResult<()> {
        if partition.contains_host(addr) {
            return Err(ClusterError::AlreadyMember {
                partition: partition.id,
                addr: addr.to_string(),
            });
        }
        let kind = Self::node_kind(partition.kind);
        let node = self.topology.node(kind, addr)?;
        let add_peer = Peer::new(node.id, addr);

        self.send_task_leader_first(
            partition,
            AdminCmd::AddRaftMember(AddRaftMemberRequest {
                partition_id: partition.id,
                add_peer: add_peer.clone(),
            }),
        )
        .await?;

        let (hosts, peers, learners) = {
            let state = partition.read();
            let mut hosts = state.hosts.clone();
            let mut peers = state.peers.clone();
            hosts.push(add_peer.addr.clone());
            peers.push(add_peer.clone());
            (hosts, peers, state.learners.clone())
        };
        validate_membership(&hosts, &peers, &learners)?;
        self.journal.sync_update_partition_with(partition, &hosts, &peers, &learners).await?;
        partition.apply_membership(hosts, peers, learners)?;

        self.create_replica(partition, &add_peer).await?;
        Ok(())
    }

    /// Add a non-voting learner on the given address.
    #[tracing::instrument(level = "debug", skip(self, partition), fields(partition = partition.id))]
    pub async fn add_learner(&self, partition: &Arc<Partition>, addr: &str, auto_promote: bool, threshold: u8) -> ClusterResult<()> {
        if partition.contains_host(addr) {
            return Err(ClusterError::AlreadyMember {
                partition: partition.id,
                addr: addr.to_string(),
            });
        }
        let kind = Self::node_kind(partition.kind);
        let node = self.topology.node(kind, addr)?;
        let add_learner = Learner::new(node.id, addr, auto_promote, threshold);
        let add_peer = add_learner.as_peer();

        self.send_task_leader_first(
            partition,
            AdminCmd::AddRaftLearner(AddRaftLearnerRequest {
                partition_id: partition.id,
                add_learner: add_learner.clone(),
            }),
        )
        .await?;

        let (hosts, peers, learners) = {
            let state = partition.read();
            let mut hosts = state.hosts.clone();
            let mut peers = state.peers.clone();
            let mut learners = state.learners.clone();
            hosts.push(add_peer.addr.clone());
            peers.push(add_peer.clone());
            learners.push(add_learner);
            (hosts, peers, learners)
        };
        validate_membership(&hosts, &peers, &learners)?;
        self.journal.sync_update_partition_with(partition, &hosts, &peers, &learners).await?;
        partition.apply_membership(hosts, peers, learners)?;

        self.create_replica(partition, &add_peer).await?;
        Ok(())
    }

    /// Promote a learner to a voting member.
    ///
    /// A no-op at the membership level beyond dropping the learner entry;
    /// the peer is already present. Returns `NotMember` when the address is
    /// not a learner of this partition.
    #[tracing::instrument(level = "debug", skip(self, partition), fields(partition = partition.id))]
    pub async fn promote_learner(&self, partition: &Arc<Partition>, addr: &str) -> ClusterResult<()> {
        let promote_peer = {
            let state = partition.read();
            if !state.hosts.iter().any(|host| host == addr) {
                return Err(ClusterError::NotMember {
                    partition: partition.id,
                    addr: addr.to_string(),
                });
            }
            let learner = state.learners.iter().find(|learner| learner.addr == addr).ok_or_else(|| ClusterError::NotMember {
                partition: partition.id,
                addr: addr.to_string(),
            })?;
            learner.as_peer()
        };

        self.send_task_leader_first(
            partition,
            AdminCmd::PromoteRaftLearner(PromoteRaftLearnerRequest {
                partition_id: partition.id,
                promote_peer: promote_peer.clone(),
            }),
        )
        .await?;

        let (hosts, peers, learners) = {
            let state = partition.read();
            let learners: Vec<Learner> = state.learners.iter().filter(|learner| learner.id != promote_peer.id).cloned().collect();
            (state.hosts.clone(), state.peers.clone(), learners)
        };
        self.journal.sync_update_partition_with(partition, &hosts, &peers, &learners).await?;
        partition.apply_membership(hosts, peers, learners)?;
        Ok(())
    }

    /// Remove the replica on the given address.
    ///
    /// Serialized per partition through the offline mutex; `offline_peer_id`
    /// is journaled when set and when cleared so the exclusion survives a
    /// master failover.
    #[tracing::instrument(level = "debug", skip(self, partition), fields(partition = partition.id))]
    pub async fn delete_replica(&self, partition: &Arc<Partition>, addr: &str, validate: bool) -> ClusterResult<()> {
        if validate {
            self.validate_decommission(partition, addr)?;
        }
        let remove_peer = partition.peer_of(addr)?;

        let _offline = partition.offline_mutex.lock().await;
        {
            let state = partition.read();
            if state.offline_peer_id != 0 && state.offline_peer_id != remove_peer.id {
                return Err(ClusterError::ConcurrentOfflineInProgress {
                    partition: partition.id,
                    peer_id: state.offline_peer_id,
                });
            }
        }
        self.update_offline_peer(partition, remove_peer.id).await?;
        let res = self.remove_member_and_rewrite(partition, &remove_peer).await;
        let clear = self.update_offline_peer(partition, 0).await;
        res?;
        clear
    }

    async fn update_offline_peer(&self, partition: &Arc<Partition>, peer_id: u64) -> ClusterResult<()> {
        partition.write().offline_peer_id = peer_id;
        self.journal.sync_update_partition(partition).await
    }

    async fn remove_member_and_rewrite(&self, partition: &Arc<Partition>, remove_peer: &Peer) -> ClusterResult<()> {
        let leader_before = partition.leader_addr();
        self.send_task_leader_first(
            partition,
            AdminCmd::RemoveRaftMember(RemoveRaftMemberRequest {
                partition_id: partition.id,
                remove_peer: remove_peer.clone(),
            }),
        )
        .await?;

        let (hosts, peers, learners) = {
            let state = partition.read();
            let hosts: Vec<String> = state.hosts.iter().filter(|host| host.as_str() != remove_peer.addr).cloned().collect();
            let peers: Vec<Peer> = state
                .peers
                .iter()
                .filter(|peer| !(peer.addr == remove_peer.addr && peer.id == remove_peer.id))
                .cloned()
                .collect();
            let learners: Vec<Learner> = state
                .learners
                .iter()
                .filter(|learner| !(learner.addr == remove_peer.addr && learner.id == remove_peer.id))
                .cloned()
                .collect();
            (hosts, peers, learners)
        };
        validate_membership(&hosts, &peers, &learners)?;
        self.journal.sync_update_partition_with(partition, &hosts, &peers, &learners).await?;
        partition.apply_membership(hosts, peers, learners)?;

        // Best-effort cleanup of the removed node's replica.
        let task = AdminTask::new(
            remove_peer.addr.clone(),
            partition.id,
            AdminCmd::DeleteReplica(DeleteReplicaRequest { partition_id: partition.id }),
        );
        if let Err(err) = self.transport.send(&remove_peer.addr, task).await {
            tracing::warn!(error = ?err, partition = partition.id, addr = %remove_peer.addr, "error deleting removed replica");
        }

        if leader_before.as_deref() == Some(remove_peer.addr.as_str()) {
            let host0 = partition.read().hosts.first().cloned();
            if let Some(host0) = host0 {
                self.try_to_change_leader(partition, &host0).await;
            }
        }
        Ok(())
    }

    /// Out-of-band membership reset, used when quorum is lost.
    ///
    /// Preconditions: more than half of the replicas are down, but not all
    /// of them. Every survivor must acknowledge the reset before hosts,
    /// peers and learners are rewritten and journaled; this is not a
    /// consensus membership change.
    #[tracing::instrument(level = "debug", skip(self, partition), fields(partition = partition.id))]
    pub async fn reset_members(&self, partition: &Arc<Partition>, survivors: &[String]) -> ClusterResult<()> {
        let (hosts, peers, learners) = {
            let state = partition.read();
            (state.hosts.clone(), state.peers.clone(), state.learners.clone())
        };
        for survivor in survivors {
            if !hosts.iter().any(|host| host == survivor) {
                return Err(ClusterError::NotMember {
                    partition: partition.id,
                    addr: survivor.clone(),
                });
            }
        }
        let replica_num = partition.replica_num as usize;
        let down = hosts.len().saturating_sub(survivors.len());
        if down <= replica_num / 2 {
            return Err(ClusterError::InvariantViolation(format!(
                "partition {}: down replicas are no more than half, use decommission instead",
                partition.id
            )));
        }
        if down >= hosts.len() {
            return Err(ClusterError::InvariantViolation(format!("partition {}: no live replicas to reset onto", partition.id)));
        }

        let new_hosts: Vec<String> = hosts.iter().filter(|host| survivors.contains(host)).cloned().collect();
        let new_peers: Vec<Peer> = peers.iter().filter(|peer| survivors.contains(&peer.addr)).cloned().collect();
        let new_learners: Vec<Learner> = learners.iter().filter(|learner| survivors.contains(&learner.addr)).cloned().collect();

        // Every survivor must acknowledge before any state is rewritten.
        for host in &new_hosts {
            let task = AdminTask::new(
                host.clone(),
                partition.id,
                AdminCmd::ResetRaftMember(ResetRaftMemberRequest {
                    partition_id: partition.id,
                    new_peers: new_peers.clone(),
                    new_learners: new_learners.clone(),
                }),
            );
            self.transport.send(host, task).await.map_err(|err| ClusterError::RpcFailed {
                partition: partition.id,
                detail: err.to_string(),
            })?;
        }

        validate_membership(&new_hosts, &new_peers, &new_learners)?;
        self.journal.sync_update_partition_with(partition, &new_hosts, &new_peers, &new_learners).await?;
        partition.apply_membership(new_hosts.clone(), new_peers, new_learners)?;

        let leader = partition.leader_addr();
        if leader.map_or(true, |leader| !new_hosts.contains(&leader)) {
            if let Some(host0) = new_hosts.first() {
                self.try_to_change_leader(partition, host0).await;
            }
        }
        tracing::warn!(partition = partition.id, hosts = ?new_hosts, "partition membership reset");
        Ok(())
    }

    /// Emergency reset of a partition onto its surviving replicas.
    ///
    /// Derives the survivor set from node liveness, resets membership, and
    /// flags the partition readonly and recovering so the sweeper tracks
    /// its catch-up.
    #[tracing::instrument(level = "debug", skip(self, partition), fields(partition = partition.id))]
    pub async fn reset_partition(&self, partition: &Arc<Partition>) -> ClusterResult<()> {
        let kind = Self::node_kind(partition.kind);
        let hosts = partition.read().hosts.clone();
        let (survivors, bad): (Vec<String>, Vec<String>) = hosts
            .into_iter()
            .partition(|host| self.topology.node(kind, host).map_or(false, |node| node.is_active()));

        self.reset_members(partition, &survivors).await?;

        for addr in &bad {
            let task = AdminTask::new(
                addr.clone(),
                partition.id,
                AdminCmd::DeleteReplica(DeleteReplicaRequest { partition_id: partition.id }),
            );
            if let Err(err) = self.transport.send(addr, task).await {
                tracing::warn!(error = ?err, partition = partition.id, addr = %addr, "error deleting replica on reset");
            }
            self.partitions.mark_bad(addr, partition.id);
        }
        {
            let mut state = partition.write();
            state.is_recovering = true;
            state.status = nimbus_core::types::PartitionStatus::Readonly;
        }
        self.journal.sync_update_partition(partition).await?;
        Ok(())
    }

    /// Create the on-node replica after a membership add.
    async fn create_replica(&self, partition: &Arc<Partition>, add_peer: &Peer) -> ClusterResult<()> {
        let request = {
            let state = partition.read();
            CreateReplicaRequest {
                partition_id: partition.id,
                vol_name: partition.vol_name.clone(),
                hosts: state.hosts.clone(),
                peers: state.peers.clone(),
                learners: state.learners.clone(),
                inode_range: match partition.kind {
                    PartitionKind::Meta => Some((partition.inode_start, partition.inode_end)),
                    PartitionKind::Data => None,
                },
                partition_size: state.replicas.iter().map(|replica| replica.total).max().unwrap_or(0),
                repair: partition.kind == PartitionKind::Data && state.hosts.len() > 1,
            }
        };
        let task = AdminTask::new(add_peer.addr.clone(), partition.id, AdminCmd::CreateReplica(request));
        self.transport.send(&add_peer.addr, task).await.map_err(|err| ClusterError::RpcFailed {
            partition: partition.id,
            detail: err.to_string(),
        })?;
        Ok(())
    }

    /// Dispatch a task leader-first across the partition's hosts.
    ///
    /// When the leader is unknown and the candidate list is short of the
    /// replica count, each attempt is preceded by a settle delay so a new
    /// leader can emerge.
    pub(crate) async fn send_task_leader_first(&self, partition: &Arc<Partition>, cmd: AdminCmd) -> ClusterResult<AdminTask> {
        let retry = Duration::from_millis(self.config.retry_sync_task_interval_ms);
        let (candidates, leader_known) = {
            let state = partition.read();
            let leader = partition.leader_addr().filter(|leader| state.hosts.contains(leader));
            let mut candidates = Vec::with_capacity(state.hosts.len());
            if let Some(leader) = &leader {
                candidates.push(leader.clone());
            }
            for host in &state.hosts {
                if leader.as_deref() == Some(host.as_str()) {
                    continue;
                }
                candidates.push(host.clone());
            }
            (candidates, leader.is_some())
        };
        if candidates.is_empty() {
            return Err(ClusterError::RpcFailed {
                partition: partition.id,
                detail: "partition has no hosts".into(),
            });
        }

        let mut last_err = String::new();
        for (idx, host) in candidates.iter().enumerate() {
            if !leader_known && candidates.len() < partition.replica_num as usize {
                tokio::time::sleep(retry).await;
            }
            let task = AdminTask::new(host.clone(), partition.id, cmd.clone());
            match self.transport.send(host, task).await {
                Ok(task) => return Ok(task),
                Err(err) => {
                    tracing::warn!(error = ?err, partition = partition.id, host = %host, op = cmd.name(), "task dispatch attempt failed");
                    last_err = err.to_string();
                    if idx < candidates.len() - 1 {
                        tokio::time::sleep(retry).await;
                    }
                }
            }
        }
        Err(ClusterError::RpcFailed {
            partition: partition.id,
            detail: last_err,
        })
    }

    /// Best-effort leadership transfer hint to the given host.
    async fn try_to_change_leader(&self, partition: &Arc<Partition>, addr: &str) {
        let task = AdminTask::new(
            addr.to_string(),
            partition.id,
            AdminCmd::TryToLeader(TryToLeaderRequest { partition_id: partition.id }),
        );
        if let Err(err) = self.transport.send(addr, task).await {
            tracing::warn!(error = ?err, partition = partition.id, addr, "error requesting leadership transfer");
        }
    }
}
