//! `themis cluster` — run the cluster coordinator.

use std::path::Path;

use anyhow::{Context, Result};
use tracing::info;

use crate::cluster::{ClusterCoordinator, ClusterSettings};
use crate::cmd::StoreOptions;
use crate::config::ClusterConfig;
use crate::util::create_log_directory;

#[allow(clippy::too_many_arguments)]
pub async fn cmd_cluster(
    store: &StoreOptions,
    data_plane_binary: &str,
    config_path: &Path,
    log_directory: &str,
    keepalive_refresh: u64,
    keepalive_timeout: u64,
    themis_command: &str,
) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config_path = config_path
        .canonicalize()
        .context("Failed to resolve config file path")?;
    let config = ClusterConfig::load(&config_path)?;

    let log_directory = create_log_directory(log_directory)?;
    info!(log_directory = %log_directory.display(), "logging to");

    let db = store.connect()?;

    let settings = ClusterSettings {
        data_plane_binary: data_plane_binary.to_string(),
        config,
        config_path,
        log_directory,
        keepalive_refresh,
        keepalive_timeout,
        store_host: store.host.clone(),
        store_port: store.port,
        store_db: store.db,
        themis_command: themis_command.to_string(),
    };

    let mut coordinator = ClusterCoordinator::new(db, settings);
    coordinator.run().await?;

    Ok(())
}
