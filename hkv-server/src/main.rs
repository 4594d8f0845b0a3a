//! # hkv-server
//!
//! Entry point: load configuration, open the engine (recovering from
//! snapshot + WAL), and accept RESP connections on the client port and
//! PSYNC handshakes on the replication port until a SHUTDOWN signal.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};

use hkv_engine::facade::{DataPaths, EngineConfig};
use hkv_engine::Engine;

use hkv_server::config::{self, Config};
use hkv_server::metrics::Metrics;
use hkv_server::server;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = Config::from_env().context("failed to load configuration")?;
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("failed to create data dir {:?}", config.data_dir))?;

    let engine_config = EngineConfig {
        shard_count: config.lock_stripe_count,
        max_memory_bytes: config.max_memory_bytes,
        eviction_policy: config.eviction_policy,
        fsync_policy: config.aof_fsync_policy,
        backlog_bytes: hkv_engine::replication::DEFAULT_BACKLOG_BYTES,
        ttl_check_interval: config.ttl_check_interval,
        paths: DataPaths::new(&config.data_dir),
    };

    let (engine, report) = Engine::open(engine_config).context("failed to open engine")?;
    info!(
        keys_from_snapshot = report.keys_from_snapshot,
        wal_records_applied = report.wal_records_applied,
        wal_corrupted = report.wal_corrupted,
        "engine recovered"
    );

    if config.replication_mode == config::ReplicationMode::Replica {
        engine.set_read_only(true);
        warn!("replica mode wiring (connecting to master) is not implemented by this front door; starting read-only with an empty replication stream");
    }

    let engine = Arc::new(engine);
    let metrics = Arc::new(Metrics::new());

    let client_listener = TcpListener::bind(("0.0.0.0", config.tcp_port))
        .await
        .with_context(|| format!("failed to bind client port {}", config.tcp_port))?;
    info!(port = config.tcp_port, "listening for client connections");

    let repl_listener = TcpListener::bind(("0.0.0.0", config.replication_port))
        .await
        .with_context(|| format!("failed to bind replication port {}", config.replication_port))?;
    info!(port = config.replication_port, "listening for replica PSYNC connections");

    let snapshot_engine = Arc::clone(&engine);
    let snapshot_interval = config.snapshot_interval;
    let snapshot_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(snapshot_interval);
        loop {
            ticker.tick().await;
            if let Err(err) = snapshot_engine.save() {
                error!(%err, "periodic snapshot failed");
            }
        }
    });

    let client_accept_engine = Arc::clone(&engine);
    let client_accept_metrics = Arc::clone(&metrics);
    let client_accept_task = tokio::spawn(async move {
        loop {
            match client_listener.accept().await {
                Ok((stream, addr)) => {
                    let engine = Arc::clone(&client_accept_engine);
                    let metrics = Arc::clone(&client_accept_metrics);
                    tokio::spawn(async move {
                        if let Err(err) = server::handle_connection(stream, engine, metrics).await
                        {
                            warn!(%addr, %err, "client connection ended with error");
                        }
                    });
                }
                Err(err) => {
                    error!(%err, "failed to accept client connection");
                }
            }
        }
    });

    let repl_accept_engine = Arc::clone(&engine);
    let repl_accept_task = tokio::spawn(async move {
        loop {
            match repl_listener.accept().await {
                Ok((stream, addr)) => {
                    let engine = Arc::clone(&repl_accept_engine);
                    tokio::spawn(async move {
                        if let Err(err) =
                            server::handle_replication_connection(stream, engine).await
                        {
                            warn!(%addr, %err, "replication connection ended with error");
                        }
                    });
                }
                Err(err) => {
                    error!(%err, "failed to accept replication connection");
                }
            }
        }
    });

    signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    info!("shutdown signal received, flushing snapshot before exit");

    snapshot_task.abort();
    client_accept_task.abort();
    repl_accept_task.abort();
    engine.stop_expirer();

    match tokio::time::timeout(Duration::from_secs(30), async { engine.save() }).await {
        Ok(Ok(())) => info!("final snapshot written"),
        Ok(Err(err)) => error!(%err, "final snapshot failed"),
        Err(err) => error!(%err, "snapshot flush on shutdown timed out"),
    }

    Ok(())
}
