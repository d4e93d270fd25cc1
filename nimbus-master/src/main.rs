use std::io::Write;
use std::mem::MaybeUninit;
use std::sync::{Arc, Once};

use anyhow::{Context, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusRecorder};
use tokio::sync::broadcast;
use tracing_subscriber::prelude::*;

use nimbus_master::cluster::sweepers::{METRIC_PARTITIONS_RECOVERED, METRIC_SWEEP_PANICS};
use nimbus_master::{App, Config};

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
    let recorder = get_metrics_recorder(&cfg);
    metrics::set_recorder(recorder).context("error setting prometheus metrics recorder")?;
    metrics::register_counter!(METRIC_SWEEP_PANICS, metrics::Unit::Count, "panics caught at sweeper task boundaries");
    metrics::register_counter!(METRIC_PARTITIONS_RECOVERED, metrics::Unit::Count, "partitions retired from the bad-partition index");

    tracing::info!(
        listen = %cfg.listen,
        local_addr = %cfg.local_addr,
        raft_dir = %cfg.raft_dir,
        storage_data_path = %cfg.storage_data_path,
        node_set_capacity = %cfg.node_set_capacity,
        "starting nimbus master",
    );
    let raft = nimbus_core::raft::MemoryRaft::new(1);
    let (shutdown_tx, _) = broadcast::channel(1);
    if let Err(err) = App::new(cfg, shutdown_tx.clone(), raft).await?.spawn().await {
        tracing::error!(error = ?err);
        let _res = shutdown_tx.send(());
    }

    // Ensure any pending output is flushed.
    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();

    Ok(())
}

/// Get a handle to the metrics recorder, initializing it as needed.
fn get_metrics_recorder(config: &Config) -> &'static PrometheusRecorder {
    static mut RECORDER: MaybeUninit<PrometheusRecorder> = MaybeUninit::uninit();
    static ONCE: Once = Once::new();
    unsafe {
        ONCE.call_once(|| {
            RECORDER.write(
                PrometheusBuilder::new()
                    .idle_timeout(metrics_util::MetricKindMask::ALL, Some(std::time::Duration::from_secs(60 * 60)))
                    .add_global_label("local_addr", config.local_addr.clone())
                    .build(),
            );
        });
        RECORDER.assume_init_ref()
    }
}
