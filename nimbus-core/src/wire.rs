//! The per-partition wire protocol.
//!
//! Frame layout, all integers big-endian:
//!
//! ```text
//! | magic u8 | opcode u8 | partition id u64 | request id u64 | len u32 | payload |
//! ```
//!
//! Responses echo the request frame; a failed request is answered with
//! [`OP_FAILURE`] and a UTF-8 error message as the payload.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::PartitionId;

/// The protocol magic byte.
pub const MAGIC: u8 = 0x4e;
/// The read timeout applied to every RPC.
pub const READ_TIMEOUT: Duration = Duration::from_secs(60);
/// Frames larger than this are rejected as corrupt.
const MAX_PAYLOAD: u32 = 64 * 1024 * 1024;

// Wire opcodes recognized by the core.
pub const OP_BROADCAST_MIN_APPLIED_ID: u8 = 0x01;
pub const OP_GET_APPLIED_ID: u8 = 0x02;
pub const OP_GET_PARTITION_SIZE: u8 = 0x03;
pub const OP_GET_MAX_EXTENT_ID_AND_PARTITION_SIZE: u8 = 0x04;
pub const OP_ADMIN_TASK: u8 = 0x10;
pub const OP_FAILURE: u8 = 0xff;

static REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Generate a process-unique request ID.
pub fn next_request_id() -> u64 {
    REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

/// A single protocol frame.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Packet {
    pub opcode: u8,
    pub partition_id: PartitionId,
    pub request_id: u64,
    pub payload: Vec<u8>,
}

impl Packet {
    /// Build a new request packet with a fresh request ID.
    pub fn new(opcode: u8, partition_id: PartitionId, payload: Vec<u8>) -> Self {
        Self {
            opcode,
            partition_id,
            request_id: next_request_id(),
            payload,
        }
    }

    /// Build the success response to this packet.
    pub fn respond(&self, payload: Vec<u8>) -> Self {
        Self {
            opcode: self.opcode,
            partition_id: self.partition_id,
            request_id: self.request_id,
            payload,
        }
    }

    /// Build the failure response to this packet.
    pub fn respond_err(&self, detail: impl std::fmt::Display) -> Self {
        Self {
            opcode: OP_FAILURE,
            partition_id: self.partition_id,
            request_id: self.request_id,
            payload: detail.to_string().into_bytes(),
        }
    }

    /// True if this packet signals a failed request.
    pub fn is_failure(&self) -> bool {
        self.opcode == OP_FAILURE
    }

    /// Interpret the payload of a failure packet as its error message.
    pub fn failure_message(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    /// Interpret the payload as a single big-endian u64.
    pub fn payload_u64(&self) -> Result<u64> {
        match self.payload.as_slice() {
            [b0, b1, b2, b3, b4, b5, b6, b7] => Ok(u64::from_be_bytes([*b0, *b1, *b2, *b3, *b4, *b5, *b6, *b7])),
            _ => bail!("invalid payload given to decode as u64, invalid len {} needed 8", self.payload.len()),
        }
    }

    /// Interpret the payload as two consecutive big-endian u64s.
    pub fn payload_u64_pair(&self) -> Result<(u64, u64)> {
        if self.payload.len() != 16 {
            bail!("invalid payload given to decode as u64 pair, invalid len {} needed 16", self.payload.len());
        }
        let first = u64::from_be_bytes(self.payload[..8].try_into().context("error slicing u64 pair")?);
        let second = u64::from_be_bytes(self.payload[8..].try_into().context("error slicing u64 pair")?);
        Ok((first, second))
    }

    /// Write this packet to the given sink.
    pub async fn write_to<W: AsyncWrite + Unpin>(&self, w: &mut W) -> Result<()> {
        let mut header = [0u8; 22];
        header[0] = MAGIC;
        header[1] = self.opcode;
        header[2..10].copy_from_slice(&self.partition_id.to_be_bytes());
        header[10..18].copy_from_slice(&self.request_id.to_be_bytes());
        header[18..22].copy_from_slice(&(self.payload.len() as u32).to_be_bytes());
        w.write_all(&header).await.context("error writing packet header")?;
        w.write_all(&self.payload).await.context("error writing packet payload")?;
        w.flush().await.context("error flushing packet")?;
        Ok(())
    }

    /// Read a packet from the given source.
    pub async fn read_from<R: AsyncRead + Unpin>(r: &mut R) -> Result<Self> {
        let mut header = [0u8; 22];
        r.read_exact(&mut header).await.context("error reading packet header")?;
        if header[0] != MAGIC {
            bail!("bad magic byte {:#04x} in packet header", header[0]);
        }
        let opcode = header[1];
        let partition_id = u64::from_be_bytes(header[2..10].try_into().context("error decoding partition id")?);
        let request_id = u64::from_be_bytes(header[10..18].try_into().context("error decoding request id")?);
        let len = u32::from_be_bytes(header[18..22].try_into().context("error decoding payload length")?);
        if len > MAX_PAYLOAD {
            bail!("packet payload length {} exceeds maximum {}", len, MAX_PAYLOAD);
        }
        let mut payload = vec![0u8; len as usize];
        r.read_exact(&mut payload).await.context("error reading packet payload")?;
        Ok(Self {
            opcode,
            partition_id,
            request_id,
            payload,
        })
    }

    /// Read a packet, bounded by the protocol read timeout.
    pub async fn read_from_timeout<R: AsyncRead + Unpin>(r: &mut R) -> Result<Self> {
        tokio::time::timeout(READ_TIMEOUT, Self::read_from(r))
            .await
            .context("timeout reading packet")?
    }
}

/// Build a broadcast-min-applied-id request.
pub fn new_broadcast_min_applied_id(partition_id: PartitionId, min_applied_id: u64) -> Packet {
    Packet::new(OP_BROADCAST_MIN_APPLIED_ID, partition_id, min_applied_id.to_be_bytes().to_vec())
}

/// Build a get-applied-id request.
pub fn new_get_applied_id(partition_id: PartitionId) -> Packet {
    Packet::new(OP_GET_APPLIED_ID, partition_id, Vec::new())
}

/// Build a get-partition-size request for the given extent.
pub fn new_get_partition_size(partition_id: PartitionId, extent_id: u64) -> Packet {
    Packet::new(OP_GET_PARTITION_SIZE, partition_id, extent_id.to_be_bytes().to_vec())
}

/// Build a get-max-extent-id-and-partition-size request.
pub fn new_get_max_extent_id_and_partition_size(partition_id: PartitionId) -> Packet {
    Packet::new(OP_GET_MAX_EXTENT_ID_AND_PARTITION_SIZE, partition_id, Vec::new())
}
