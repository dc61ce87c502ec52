//! Keepalive refresh task.
//!
//! Each node coordinator owns exactly one keepalive entry in the store.
//! A background task refreshes its TTL every `refresh_secs`; if the node
//! dies the entry expires and the cluster coordinator declares the node
//! dead. The task is shut down explicitly and joined so a clean exit
//! never leaves a refresher behind.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use themis_store::{CoordinatorDb, StoreError};

pub struct KeepaliveTask {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl KeepaliveTask {
    /// Record this process's pid in the keepalive entry and start
    /// refreshing its TTL.
    pub async fn start(
        db: CoordinatorDb,
        hostname: String,
        refresh_secs: u64,
        timeout_secs: u64,
    ) -> Result<Self, StoreError> {
        db.update_pid(&hostname, std::process::id()).await?;
        db.refresh_keepalive(&hostname, timeout_secs).await?;

        let (shutdown, mut shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(refresh_secs)) => {}
                    _ = shutdown_rx.changed() => break,
                }

                if let Err(error) = db.refresh_keepalive(&hostname, timeout_secs).await {
                    warn!(%error, "failed to refresh keepalive");
                }
            }
            info!("Keepalive task is down");
        });

        Ok(Self { shutdown, handle })
    }

    /// Signal the refresher to exit and wait for it.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.handle.await;
    }
}
