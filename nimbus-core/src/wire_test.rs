use anyhow::Result;

use crate::wire::{self, Packet, MAGIC, OP_GET_APPLIED_ID};

#[tokio::test]
async fn test_packet_roundtrip() -> Result<()> {
    let (mut client, mut server) = tokio::io::duplex(1024);
    let sent = wire::new_broadcast_min_applied_id(42, 500);
    sent.write_to(&mut client).await?;

    let received = Packet::read_from(&mut server).await?;
    assert_eq!(received, sent, "decoded packet differs from encoded packet");
    assert_eq!(received.payload_u64()?, 500, "expected broadcast payload of 500");
    Ok(())
}

#[tokio::test]
async fn test_response_echoes_request_identity() -> Result<()> {
    let req = wire::new_get_applied_id(7);
    let res = req.respond(9_000u64.to_be_bytes().to_vec());
    assert_eq!(res.opcode, OP_GET_APPLIED_ID);
    assert_eq!(res.partition_id, req.partition_id);
    assert_eq!(res.request_id, req.request_id);
    assert_eq!(res.payload_u64()?, 9_000);
    Ok(())
}

#[tokio::test]
async fn test_failure_response() -> Result<()> {
    let req = wire::new_get_applied_id(7);
    let res = req.respond_err("partition not found");
    assert!(res.is_failure(), "expected failure packet");
    assert_eq!(res.failure_message(), "partition not found");
    Ok(())
}

#[tokio::test]
async fn test_bad_magic_rejected() -> Result<()> {
    let (mut client, mut server) = tokio::io::duplex(1024);
    let mut frame = Vec::new();
    wire::new_get_applied_id(1).write_to(&mut frame).await?;
    frame[0] = MAGIC.wrapping_add(1);
    tokio::io::AsyncWriteExt::write_all(&mut client, &frame).await?;

    let res = Packet::read_from(&mut server).await;
    assert!(res.is_err(), "expected bad magic to be rejected");
    Ok(())
}

#[tokio::test]
async fn test_u64_pair_payload() -> Result<()> {
    let req = wire::new_get_max_extent_id_and_partition_size(3);
    let mut payload = 11u64.to_be_bytes().to_vec();
    payload.extend_from_slice(&(4 * crate::GIB).to_be_bytes());
    let res = req.respond(payload);
    let (max_extent_id, size) = res.payload_u64_pair()?;
    assert_eq!(max_extent_id, 11);
    assert_eq!(size, 4 * crate::GIB);
    Ok(())
}
