use crate::services::workspace::sweep_orphans;
use std::path::PathBuf;
use tokio::sync::watch;
use tokio::time::{Duration, sleep};

/// Periodically removes request workspaces abandoned by a crashed process
pub struct BackgroundWorker {
    scratch_dir: PathBuf,
    max_age: Duration,
    interval: Duration,
    shutdown: watch::Receiver<bool>,
}

impl BackgroundWorker {
    pub fn new(
        scratch_dir: PathBuf,
        max_age: Duration,
        interval: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            scratch_dir,
            max_age,
            interval,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        tracing::info!("🚀 Background worker started");

        loop {
            tokio::select! {
                _ = self.shutdown.changed() => {
                    tracing::info!("🛑 Background worker shutting down");
                    break;
                }
                _ = sleep(self.interval) => {
                    self.perform_cleanup().await;
                }
            }
        }
    }

    pub async fn perform_cleanup(&self) -> usize {
        tracing::info!("🧹 Sweeping orphaned workspaces...");

        match sweep_orphans(&self.scratch_dir, self.max_age).await {
            Ok(removed) => {
                tracing::info!("✅ Background cleanup completed ({} removed)", removed);
                removed
            }
            Err(e) => {
                tracing::error!(
                    "Failed to sweep {}: {}",
                    self.scratch_dir.display(),
                    e
                );
                0
            }
        }
    }
}
