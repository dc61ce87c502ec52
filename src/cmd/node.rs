//! `themis node` — run a node coordinator.
//!
//! Normally spawned over ssh by the cluster coordinator, which passes
//! `--hostname` and `--batch-nonce` explicitly. Logs go to a per-host
//! file under the shared log directory. Any of SIGUSR1, SIGINT, or
//! SIGTERM kills the whole process group, taking down a running
//! data-plane subprocess with it.

use std::path::Path;

use anyhow::{Context, Result};
use tracing::{error, info};

use crate::cmd::StoreOptions;
use crate::config::ClusterConfig;
use crate::node::keepalive::KeepaliveTask;
use crate::node::{NodeCoordinator, NodeSettings};
use crate::util::create_log_directory;

#[allow(clippy::too_many_arguments)]
pub async fn cmd_node(
    store: &StoreOptions,
    data_plane_binary: &str,
    config_path: &Path,
    log_directory: &str,
    hostname: Option<String>,
    batch_nonce: Option<String>,
    keepalive_refresh: u64,
    keepalive_timeout: u64,
) -> Result<()> {
    let hostname = hostname
        .or_else(|| std::env::var("HOSTNAME").ok())
        .context("No --hostname given and HOSTNAME is unset")?;

    let log_directory = create_log_directory(log_directory)?;

    let file_appender = tracing_appender::rolling::never(
        log_directory.join("node_coordinators"),
        format!("{hostname}.log"),
    );
    let (writer, _guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(writer)
        .with_ansi(false)
        .init();

    spawn_signal_handlers();

    let config_path = config_path
        .canonicalize()
        .context("Failed to resolve config file path")?;
    let config = ClusterConfig::load(&config_path)?;

    let db = store.connect()?;

    let keepalive = KeepaliveTask::start(
        db.clone(),
        hostname.clone(),
        keepalive_refresh,
        keepalive_timeout,
    )
    .await?;
    info!(hostname = %hostname, "node coordinator starting");

    let settings = NodeSettings {
        hostname,
        data_plane_binary: data_plane_binary.to_string(),
        config,
        config_path,
        log_directory,
        batch_nonce: batch_nonce
            .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string()),
        store_host: store.host.clone(),
        store_port: store.port,
        store_db: store.db,
    };

    let mut coordinator = NodeCoordinator::new(db, settings);
    let result = coordinator.run().await;

    if let Err(e) = &result {
        error!(error = %e, "node coordinator error; marking current batch as failed");
        let _ = coordinator
            .fail_current_batch(&format!("Node coordinator error: {e}"))
            .await;
    }

    keepalive.shutdown().await;
    result.map_err(Into::into)
}

/// SIGUSR1 (coordinator-initiated stop), SIGINT, and SIGTERM all kill
/// the process group so a running data-plane subprocess dies with us.
fn spawn_signal_handlers() {
    use tokio::signal::unix::{SignalKind, signal};

    for kind in [
        SignalKind::user_defined1(),
        SignalKind::interrupt(),
        SignalKind::terminate(),
    ] {
        let Ok(mut stream) = signal(kind) else {
            continue;
        };
        tokio::spawn(async move {
            stream.recv().await;
            error!("caught termination signal; killing process group");
            let _ = nix::sys::signal::killpg(
                nix::unistd::getpgrp(),
                nix::sys::signal::Signal::SIGKILL,
            );
            std::process::exit(1);
        });
    }
}
