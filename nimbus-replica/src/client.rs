//! The TCP peer client.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::net::TcpStream;

use nimbus_core::wire::{self, Packet};
use nimbus_core::PartitionId;

use crate::applied::PeerClient;

/// Peer RPCs framed over the cluster wire protocol.
pub struct TcpPeerClient;

impl TcpPeerClient {
    async fn roundtrip(addr: &str, packet: Packet) -> Result<Packet> {
        let mut stream = TcpStream::connect(addr).await.with_context(|| format!("error connecting to {}", addr))?;
        packet.write_to(&mut stream).await?;
        let response = Packet::read_from_timeout(&mut stream).await?;
        if response.is_failure() {
            bail!("request to {} failed: {}", addr, response.failure_message());
        }
        Ok(response)
    }
}

#[async_trait]
impl PeerClient for TcpPeerClient {
    async fn get_applied_id(&self, addr: &str, partition_id: PartitionId) -> Result<u64> {
        let response = Self::roundtrip(addr, wire::new_get_applied_id(partition_id)).await?;
        response.payload_u64()
    }

    async fn broadcast_min_applied_id(&self, addr: &str, partition_id: PartitionId, min_applied_id: u64) -> Result<()> {
        Self::roundtrip(addr, wire::new_broadcast_min_applied_id(partition_id, min_applied_id)).await?;
        Ok(())
    }

    async fn get_partition_size(&self, addr: &str, partition_id: PartitionId, extent_id: u64) -> Result<u64> {
        let response = Self::roundtrip(addr, wire::new_get_partition_size(partition_id, extent_id)).await?;
        response.payload_u64()
    }

    async fn get_max_extent_id_and_partition_size(&self, addr: &str, partition_id: PartitionId) -> Result<(u64, u64)> {
        let response = Self::roundtrip(addr, wire::new_get_max_extent_id_and_partition_size(partition_id)).await?;
        response.payload_u64_pair()
    }
}
