//! Admin-task delivery.
//!
//! The controller talks to nodes through [`TaskTransport`] so the
//! transactions can be exercised against a recording fake; the production
//! implementation frames tasks over the cluster wire protocol.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::net::TcpStream;

use nimbus_core::admin::{AdminTask, TaskStatus};
use nimbus_core::wire::{Packet, OP_ADMIN_TASK};

/// Delivery of admin tasks to cluster nodes.
#[async_trait]
pub trait TaskTransport: Send + Sync + 'static {
    /// Send the task to the node at `addr` and await its completed echo.
    async fn send(&self, addr: &str, task: AdminTask) -> Result<AdminTask>;
}

/// The production transport, framing tasks over the wire protocol.
pub struct TcpTaskTransport;

#[async_trait]
impl TaskTransport for TcpTaskTransport {
    #[tracing::instrument(level = "trace", skip(self, task), fields(task = %task.id))]
    async fn send(&self, addr: &str, task: AdminTask) -> Result<AdminTask> {
        let mut stream = TcpStream::connect(addr).await.with_context(|| format!("error connecting to {}", addr))?;
        let payload = serde_json::to_vec(&task).context("error encoding admin task")?;
        let packet = Packet::new(OP_ADMIN_TASK, task.cmd.partition_id(), payload);
        packet.write_to(&mut stream).await?;

        let response = Packet::read_from_timeout(&mut stream).await?;
        if response.is_failure() {
            bail!("task {} failed on {}: {}", task.id, addr, response.failure_message());
        }
        let mut task: AdminTask = serde_json::from_slice(&response.payload).context("error decoding admin task response")?;
        task.status = TaskStatus::Succeeded;
        Ok(task)
    }
}
