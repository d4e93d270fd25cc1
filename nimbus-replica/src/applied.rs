//! The applied-ID reconciliation schedule.
//!
//! Runs on every partition with three independent timers:
//! collect applied IDs from the replica group (1 s, then 60 s once the
//! first collection succeeds), truncate the raft log up to the group-wide
//! minimum (10 min), and store the local applied ID to disk (10 s). All
//! timers observe the partition stop signal and the stop-raft-for-extent
//! signal at every select.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures::stream::StreamExt;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;

use nimbus_core::PartitionId;

use crate::meta;
use crate::partition::ReplicaPartition;

pub const GET_APPLIED_INITIAL_INTERVAL: Duration = Duration::from_secs(1);
pub const GET_APPLIED_INTERVAL: Duration = Duration::from_secs(60);
pub const TRUNCATE_INTERVAL: Duration = Duration::from_secs(60 * 10);
pub const STORE_APPLIED_INTERVAL: Duration = Duration::from_secs(10);

/// RPCs issued against peer replicas of a partition.
#[async_trait]
pub trait PeerClient: Send + Sync + 'static {
    async fn get_applied_id(&self, addr: &str, partition_id: PartitionId) -> Result<u64>;
    async fn broadcast_min_applied_id(&self, addr: &str, partition_id: PartitionId, min_applied_id: u64) -> Result<()>;
    async fn get_partition_size(&self, addr: &str, partition_id: PartitionId, extent_id: u64) -> Result<u64>;
    async fn get_max_extent_id_and_partition_size(&self, addr: &str, partition_id: PartitionId) -> Result<(u64, u64)>;
}

/// Spawn the applied-ID schedule for one partition.
pub fn spawn_log_schedule(partition: Arc<ReplicaPartition>, client: Arc<dyn PeerClient>) -> JoinHandle<Result<()>> {
    tokio::spawn(run_log_schedule(partition, client))
}

async fn run_log_schedule(partition: Arc<ReplicaPartition>, client: Arc<dyn PeerClient>) -> Result<()> {
    tracing::debug!(partition = partition.id, "applied-id schedule has started");
    let mut stop = BroadcastStream::new(partition.stop_rx());
    let mut stop_raft = BroadcastStream::new(partition.stop_raft_rx());

    let get_timer = tokio::time::sleep(GET_APPLIED_INITIAL_INTERVAL);
    tokio::pin!(get_timer);
    let truncate_timer = tokio::time::sleep(TRUNCATE_INTERVAL);
    tokio::pin!(truncate_timer);
    let store_timer = tokio::time::sleep(STORE_APPLIED_INTERVAL);
    tokio::pin!(store_timer);
    let mut collected_once = false;

    loop {
        tokio::select! {
            _ = stop.next() => break,
            Some(Ok(extent_id)) = stop_raft.next() => {
                partition.stop_raft().await;
                tracing::error!(partition = partition.id, extent = extent_id, "raft stopped for failed extent");
            }
            _ = &mut get_timer => {
                if collect_applied_ids(&partition, client.as_ref()).await {
                    collected_once = true;
                }
                let next = if collected_once { GET_APPLIED_INTERVAL } else { GET_APPLIED_INITIAL_INTERVAL };
                get_timer.set(tokio::time::sleep(next));
            }
            _ = &mut truncate_timer => {
                if let Err(err) = truncate_if_advanced(&partition).await {
                    tracing::error!(error = ?err, partition = partition.id, "error truncating raft log");
                }
                truncate_timer.set(tokio::time::sleep(TRUNCATE_INTERVAL));
            }
            _ = &mut store_timer => {
                if let Err(err) = meta::store_applied_id(&partition.path, partition.applied_id()).await {
                    tracing::error!(error = ?err, partition = partition.id, "error storing applied id");
                }
                store_timer.set(tokio::time::sleep(STORE_APPLIED_INTERVAL));
            }
        }
    }
    tracing::debug!(partition = partition.id, "applied-id schedule has shutdown");
    Ok(())
}

/// Collect applied IDs across the replica group, leader-only.
///
/// Only when every replica responds are the group minimum and maximum
/// computed; the minimum is broadcast to the non-local replicas and both
/// bounds are recorded locally. The broadcast minimum is monotonic: a
/// newly computed minimum below a previously broadcast one is clamped.
/// Returns true when a full collection round completed.
pub async fn collect_applied_ids(partition: &ReplicaPartition, client: &dyn PeerClient) -> bool {
    if !partition.is_raft_leader() {
        return false;
    }
    // Nothing applied locally yet; the group has no progress to reconcile.
    if partition.applied_id() == 0 {
        return false;
    }

    let hosts = partition.hosts();
    let mut applied_ids = Vec::with_capacity(hosts.len());
    for host in &hosts {
        if host == &partition.local_addr {
            applied_ids.push(partition.applied_id());
            continue;
        }
        match client.get_applied_id(host, partition.id).await {
            Ok(applied_id) => applied_ids.push(applied_id),
            Err(err) => {
                tracing::warn!(error = ?err, partition = partition.id, host = %host, "error collecting applied id");
            }
        }
    }
    if applied_ids.len() != hosts.len() || applied_ids.is_empty() {
        return false;
    }

    let min = applied_ids.iter().copied().min().unwrap_or(0).max(partition.min_applied_id());
    let max = applied_ids.iter().copied().max().unwrap_or(0);
    for host in &hosts {
        if host == &partition.local_addr {
            continue;
        }
        if let Err(err) = client.broadcast_min_applied_id(host, partition.id, min).await {
            tracing::warn!(error = ?err, partition = partition.id, host = %host, "error broadcasting min applied id");
        }
    }
    partition.set_min_applied_id(min);
    partition.set_max_applied_id(max);
    tracing::debug!(partition = partition.id, min, max, "applied ids reconciled");
    true
}

/// Truncate the raft log when the group minimum has advanced past the last
/// truncation watermark, then persist the metadata footer.
pub async fn truncate_if_advanced(partition: &ReplicaPartition) -> Result<()> {
    if !partition.is_raft_started() {
        return Ok(());
    }
    let min = partition.min_applied_id();
    if min <= partition.last_truncate_id() {
        return Ok(());
    }
    partition.raft().truncate(min).await?;
    partition.set_last_truncate_id(min);
    partition.persist_manifest().await?;
    tracing::info!(partition = partition.id, truncated_to = min, "raft log truncated");
    Ok(())
}
