//! Raft start after repair.
//!
//! A replica created to backfill an existing group must not join consensus
//! until its extent store has caught up with the leader. This loop polls
//! the leader's reported partition size with a fixed backoff and starts
//! raft once the local store size reaches it, or immediately when this
//! node is the leader.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::stream::StreamExt;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;

use crate::applied::PeerClient;
use crate::meta::CreateType;
use crate::partition::ReplicaPartition;

pub const REPAIR_BACKOFF: Duration = Duration::from_secs(5);

/// Spawn the repair-wait loop for a partition created in repair mode.
pub fn spawn_wait_repair(partition: Arc<ReplicaPartition>, client: Arc<dyn PeerClient>) -> JoinHandle<Result<()>> {
    tokio::spawn(wait_repair_then_start(partition, client, REPAIR_BACKOFF))
}

/// Poll until the local store has caught up with the leader, then flip the
/// create type to normal, persist, and start raft.
pub async fn wait_repair_then_start(partition: Arc<ReplicaPartition>, client: Arc<dyn PeerClient>, backoff: Duration) -> Result<()> {
    let mut stop = BroadcastStream::new(partition.stop_rx());
    let timer = tokio::time::sleep(Duration::ZERO);
    tokio::pin!(timer);
    let (mut init_max_extent_id, mut init_partition_size) = (0u64, 0u64);

    loop {
        tokio::select! {
            _ = stop.next() => return Ok(()),
            _ = &mut timer => {
                // The designated primary does not wait for repair.
                if partition.is_designated_leader() {
                    partition.start_raft()?;
                    tracing::debug!(partition = partition.id, "leader started without repair wait");
                    return Ok(());
                }
                let hosts = partition.hosts();
                let Some(leader_host) = hosts.first().cloned() else {
                    timer.set(tokio::time::sleep(backoff));
                    continue;
                };
                if init_max_extent_id == 0 || init_partition_size == 0 {
                    match client.get_max_extent_id_and_partition_size(&leader_host, partition.id).await {
                        Ok((max_extent_id, size)) => {
                            init_max_extent_id = max_extent_id;
                            init_partition_size = size;
                        }
                        Err(err) => {
                            tracing::error!(error = ?err, partition = partition.id, "error fetching leader max extent id");
                            timer.set(tokio::time::sleep(backoff));
                            continue;
                        }
                    }
                }
                let current_leader_size = match client.get_partition_size(&leader_host, partition.id, init_max_extent_id).await {
                    Ok(size) => size,
                    Err(err) => {
                        tracing::error!(error = ?err, partition = partition.id, "error fetching leader partition size");
                        timer.set(tokio::time::sleep(backoff));
                        continue;
                    }
                };
                // The leader may have compacted since the first probe.
                if current_leader_size < init_partition_size {
                    init_partition_size = current_leader_size;
                }
                let local_size = partition.extents.store_size_to_extent(init_max_extent_id);
                tracing::info!(
                    partition = partition.id,
                    max_extent_id = init_max_extent_id,
                    leader_size = init_partition_size,
                    local_size,
                    "repair wait progress",
                );
                if init_partition_size > local_size {
                    timer.set(tokio::time::sleep(backoff));
                    continue;
                }

                partition.set_create_type(CreateType::Normal);
                partition.persist_manifest().await?;
                partition.start_raft()?;
                tracing::info!(partition = partition.id, "raft started after repair");
                return Ok(());
            }
        }
    }
}
