use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing_subscriber::prelude::*;

use nimbus_core::raft::{MemoryRaft, RaftGroup};
use nimbus_replica::client::TcpPeerClient;
use nimbus_replica::extent::{ExtentStore, MemoryExtentStore};
use nimbus_replica::{Config, ReplicaServer};

#[tokio::main]
async fn main() -> Result<()> {
    // Setup tracing/logging system.
    tracing_subscriber::registry()
        // Filter spans based on the RUST_LOG env var.
        .with(tracing_subscriber::EnvFilter::from_default_env())
        // Send a copy of all spans to stdout in compact form.
        .with(tracing_subscriber::fmt::layer().with_target(true).with_level(true).with_ansi(true))
        // Install this registry as the global tracing registry.
        .try_init()
        .context("error initializing logging/tracing system")?;

    let cfg = Arc::new(Config::new()?);
    tracing::info!(
        listen = %cfg.listen,
        local_addr = %cfg.local_addr,
        raft_dir = %cfg.raft_dir,
        storage_data_path = %cfg.storage_data_path,
        zone = %cfg.zone_name,
        "starting nimbus replica",
    );

    let (shutdown_tx, _) = broadcast::channel(1);
    let listener = TcpListener::bind(("0.0.0.0", cfg.listen)).await.context("error binding wire listener")?;
    // Single-node bootstrap wiring; a deployment derives the node ID from
    // its master registration and builds raft groups via its consensus
    // library through the same factory seam.
    let node_id = 1;
    let server = ReplicaServer::new(
        cfg,
        node_id,
        Arc::new(TcpPeerClient),
        Box::new(move |_| -> Arc<dyn RaftGroup> { MemoryRaft::new(node_id) }),
        Box::new(|_| -> Arc<dyn ExtentStore> { MemoryExtentStore::new() }),
        shutdown_tx.clone(),
    );

    let handle = server.spawn(listener);
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).context("error building signal stream")?;
    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt()).context("error building signal stream")?;
    tokio::select! {
        _ = sigterm.recv() => (),
        _ = sigint.recv() => (),
    }
    tracing::debug!("signal received, beginning graceful shutdown");
    let _ = shutdown_tx.send(());
    if let Err(err) = handle.await.context("error joining server handle").and_then(|res| res) {
        tracing::error!(error = ?err, "error shutting down replica server");
    }

    // Ensure any pending output is flushed.
    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();

    Ok(())
}
