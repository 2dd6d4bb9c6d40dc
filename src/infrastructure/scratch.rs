use crate::config::ServiceConfig;
use crate::services::workspace::sweep_orphans;
use std::time::Duration;
use tracing::info;

/// Create the scratch root if needed and clear out leftovers from a previous run.
///
/// No request is live yet, so every workspace found here is dead regardless of age.
pub async fn setup_scratch(config: &ServiceConfig) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(&config.scratch_dir).await?;
    info!("📂 Scratch directory: {}", config.scratch_dir.display());

    let removed = sweep_orphans(&config.scratch_dir, Duration::ZERO).await?;
    if removed > 0 {
        info!("🧹 Removed {} workspaces left by a previous run", removed);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_startup_removes_recent_workspaces() {
        let scratch = tempfile::tempdir().unwrap();
        let config = ServiceConfig {
            scratch_dir: scratch.path().join("uploads"),
            staging_cleanup_age_hours: 24,
            ..ServiceConfig::development()
        };
        std::fs::create_dir_all(config.scratch_dir.join("req-crashed/working")).unwrap();
        std::fs::write(config.scratch_dir.join("req-crashed/working/a.js"), "var a;").unwrap();
        std::fs::write(config.scratch_dir.join("notes.txt"), "kept").unwrap();

        setup_scratch(&config).await.unwrap();

        assert!(!config.scratch_dir.join("req-crashed").exists());
        assert!(config.scratch_dir.join("notes.txt").exists());
    }

    #[tokio::test]
    async fn test_missing_scratch_root_is_created() {
        let scratch = tempfile::tempdir().unwrap();
        let config = ServiceConfig {
            scratch_dir: scratch.path().join("nested/uploads"),
            ..ServiceConfig::development()
        };

        setup_scratch(&config).await.unwrap();
        assert!(config.scratch_dir.is_dir());
    }
}
