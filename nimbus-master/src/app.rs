use std::sync::Arc;

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, SignalStream};
use tokio_stream::StreamMap;

use nimbus_core::raft::MemoryRaft;

use crate::cluster::{sweepers, Cluster};
use crate::config::Config;
use crate::database::Database;
use crate::dispatch::TcpTaskTransport;
use crate::journal::Journal;

/// The application object for when the master is running as a server.
pub struct App {
    /// The application's runtime config.
    _config: Arc<Config>,
    /// The application's database system.
    _db: Database,
    /// The cluster control plane.
    pub cluster: Arc<Cluster>,

    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,

    /// The join handle of the bad-partition recovery sweeper.
    recovery_sweeper: JoinHandle<Result<()>>,
    /// The join handles of the per-kind load-check sweepers.
    load_sweepers: Vec<JoinHandle<Result<()>>>,
    /// The join handle of the node heartbeat monitor.
    node_monitor: JoinHandle<Result<()>>,
}

impl App {
    /// Create a new instance.
    ///
    /// The master's own consensus group is injected; the bundled
    /// `MemoryRaft` covers single-node bootstrap, a multi-node deployment
    /// wires its consensus library through the same capability set.
    pub async fn new(config: Arc<Config>, shutdown_tx: broadcast::Sender<()>, raft: Arc<MemoryRaft>) -> Result<Self> {
        // Initialize this node's storage and restore journaled state.
        let db = Database::new(config.clone()).await.context("error opening database")?;
        let tree = db.journal_state_tree().await?;
        let journal = Journal::new(raft.clone(), tree);
        let apply_journal = journal.clone();
        raft.set_apply(Arc::new(move |data| apply_journal.apply(data)));

        let cluster = Cluster::new("nimbus", config.clone(), raft, journal, Arc::new(TcpTaskTransport));
        cluster.restore().context("error restoring cluster state from journal")?;

        // Spawn the leader-only reconciliation sweepers.
        let recovery_sweeper = sweepers::spawn_recovery_sweeper(cluster.clone(), shutdown_tx.subscribe());
        let load_sweepers = vec![
            sweepers::spawn_load_sweeper(cluster.clone(), crate::partitions::PartitionKind::Data, shutdown_tx.subscribe()),
            sweepers::spawn_load_sweeper(cluster.clone(), crate::partitions::PartitionKind::Meta, shutdown_tx.subscribe()),
        ];
        let node_monitor = sweepers::spawn_node_monitor(cluster.clone(), shutdown_tx.subscribe());

        Ok(Self {
            _config: config,
            _db: db,
            cluster,
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
            shutdown_tx,
            recovery_sweeper,
            load_sweepers,
            node_monitor,
        })
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let mut signals = StreamMap::new();
        signals.insert("sigterm", SignalStream::new(signal(SignalKind::terminate()).context("error building signal stream")?));
        signals.insert("sigint", SignalStream::new(signal(SignalKind::interrupt()).context("error building signal stream")?));

        loop {
            tokio::select! {
                Some((_, sig)) = signals.next() => {
                    tracing::debug!(signal = ?sig, "signal received, beginning graceful shutdown");
                    let _ = self.shutdown_tx.send(());
                    break;
                }
                _ = self.shutdown_rx.next() => break,
            }
        }

        // Begin shutdown routine.
        tracing::debug!(leader = self.cluster.is_leader(), "nimbus master is shutting down");
        if let Err(err) = self.recovery_sweeper.await.context("error joining recovery sweeper handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down recovery sweeper");
        }
        for handle in self.load_sweepers {
            if let Err(err) = handle.await.context("error joining load sweeper handle").and_then(|res| res) {
                tracing::error!(error = ?err, "error shutting down load sweeper");
            }
        }
        if let Err(err) = self.node_monitor.await.context("error joining node monitor handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down node monitor");
        }

        tracing::debug!("nimbus master shutdown complete");
        Ok(())
    }
}
