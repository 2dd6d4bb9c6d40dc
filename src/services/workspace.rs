use crate::api::error::{AppError, Stage};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};
use tempfile::TempDir;
use tokio::runtime::Handle;
use uuid::Uuid;

const WORKSPACE_PREFIX: &str = "req-";
const STAGING_DIR: &str = "staging";
const WORKING_DIR: &str = "working";
const OUTPUT_DIR: &str = "output";
const TEMP_DIR: &str = "tmp";

/// The directory on disk. Removed when the last handle to it goes away.
#[derive(Debug)]
struct WorkspaceRoot {
    id: Uuid,
    dir: Option<TempDir>,
    released: AtomicBool,
}

impl Drop for WorkspaceRoot {
    fn drop(&mut self) {
        let Some(dir) = self.dir.take() else {
            return;
        };
        let id = self.id;

        // remove_dir_all must not run on an executor thread
        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || remove_dir(id, dir));
            }
            Err(_) => remove_dir(id, dir),
        }
    }
}

fn remove_dir(id: Uuid, dir: TempDir) {
    let path = dir.path().to_path_buf();
    // A write still landing from a cancelled task can make the first pass fail
    let result = dir.close().or_else(|_| match std::fs::remove_dir_all(&path) {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    });
    match result {
        Ok(()) => tracing::debug!("🧹 Workspace {} released", id),
        Err(e) => tracing::warn!(
            "Failed to remove workspace {} at {}: {}",
            id,
            path.display(),
            e
        ),
    }
}

/// Scratch directory owned by exactly one request.
///
/// Layout under `<scratch>/req-<uuid>-XXXX/`:
/// `staging/` holds the upload, `working/` the extracted archive, `output/` the
/// transformed tree and `tmp/` the transformer's scratch files. Final artifacts sit
/// at the root. The tree is removed once the request lets go of it (on success,
/// error or cancellation) and no [`WorkspaceLease`] is left.
#[derive(Debug)]
pub struct RequestWorkspace {
    id: Uuid,
    root: PathBuf,
    inner: Arc<WorkspaceRoot>,
}

/// Keeps a workspace on disk while blocking work still writes into it.
#[derive(Debug, Clone)]
pub struct WorkspaceLease {
    inner: Arc<WorkspaceRoot>,
}

impl WorkspaceLease {
    /// The owning request is gone; work done under the lease should stop
    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::Acquire)
    }
}

impl RequestWorkspace {
    pub async fn create(scratch_root: &Path) -> Result<Self, AppError> {
        let id = Uuid::new_v4();
        let scratch_root = scratch_root.to_path_buf();
        let dir = tokio::task::spawn_blocking(move || {
            let prefix = format!("{}{}-", WORKSPACE_PREFIX, id);
            tempfile::Builder::new()
                .prefix(&prefix)
                .tempdir_in(&scratch_root)
        })
        .await
        .map_err(|e| AppError::Io {
            stage: Stage::Receive,
            source: std::io::Error::other(e),
        })?
        .map_err(AppError::io(Stage::Receive))?;

        let workspace = Self {
            id,
            root: dir.path().to_path_buf(),
            inner: Arc::new(WorkspaceRoot {
                id,
                dir: Some(dir),
                released: AtomicBool::new(false),
            }),
        };

        for sub in [STAGING_DIR, WORKING_DIR, OUTPUT_DIR, TEMP_DIR] {
            tokio::fs::create_dir(workspace.root.join(sub))
                .await
                .map_err(AppError::io(Stage::Receive))?;
        }

        tracing::debug!("📂 Workspace {} created at {}", id, workspace.root.display());
        Ok(workspace)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Where the uploaded payload is persisted. `filename` must already be sanitized.
    pub fn staging_path(&self, filename: &str) -> PathBuf {
        self.root.join(STAGING_DIR).join(filename)
    }

    pub fn working_dir(&self) -> PathBuf {
        self.root.join(WORKING_DIR)
    }

    pub fn output_dir(&self) -> PathBuf {
        self.root.join(OUTPUT_DIR)
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.root.join(TEMP_DIR)
    }

    /// Location for a finished artifact, outside the trees that get walked or packed
    pub fn artifact_path(&self, filename: &str) -> PathBuf {
        self.root.join(filename)
    }

    pub fn lease(&self) -> WorkspaceLease {
        WorkspaceLease {
            inner: self.inner.clone(),
        }
    }

    /// Remove the workspace and wait for it. If a lease is still out, removal
    /// happens when the last lease is dropped instead.
    pub async fn release(self) {
        let id = self.id;
        let inner = self.inner.clone();
        drop(self);

        let removal = tokio::task::spawn_blocking(move || match Arc::try_unwrap(inner) {
            Ok(mut root) => {
                if let Some(dir) = root.dir.take() {
                    remove_dir(root.id, dir);
                }
            }
            Err(_) => tracing::debug!("Workspace {} still leased, removal deferred", id),
        });

        if let Err(e) = removal.await {
            tracing::warn!("Workspace {} removal task failed: {}", id, e);
        }
    }
}

impl Drop for RequestWorkspace {
    fn drop(&mut self) {
        self.inner.released.store(true, Ordering::Release);
    }
}

/// Remove request workspaces under `scratch_root` older than `max_age`.
///
/// Only catches directories left behind when the process died mid-request; live
/// requests clean up after themselves.
pub async fn sweep_orphans(scratch_root: &Path, max_age: Duration) -> std::io::Result<usize> {
    let mut removed = 0;
    let mut entries = tokio::fs::read_dir(scratch_root).await?;
    let now = SystemTime::now();

    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        if !name.to_string_lossy().starts_with(WORKSPACE_PREFIX) {
            continue;
        }

        let metadata = match entry.metadata().await {
            Ok(m) if m.is_dir() => m,
            _ => continue,
        };
        let age = metadata
            .modified()
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
            .unwrap_or_default();

        if age < max_age {
            continue;
        }

        match tokio::fs::remove_dir_all(entry.path()).await {
            Ok(()) => {
                tracing::info!("🧹 Removed orphaned workspace {:?}", name);
                removed += 1;
            }
            Err(e) => tracing::warn!("Failed to remove orphaned workspace {:?}: {}", name, e),
        }
    }

    Ok(removed)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Removal after a plain drop runs on the blocking pool; poll for it
    pub(crate) async fn wait_until_empty(dir: &Path) -> usize {
        for _ in 0..200 {
            let count = std::fs::read_dir(dir).unwrap().count();
            if count == 0 {
                return 0;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        std::fs::read_dir(dir).unwrap().count()
    }

    #[tokio::test]
    async fn test_workspace_layout_and_release() {
        let scratch = tempfile::tempdir().unwrap();
        let workspace = RequestWorkspace::create(scratch.path()).await.unwrap();
        let root = workspace.path().to_path_buf();

        assert!(root.starts_with(scratch.path()));
        assert!(workspace.working_dir().is_dir());
        assert!(workspace.output_dir().is_dir());
        assert!(workspace.temp_dir().is_dir());
        assert_eq!(
            workspace.staging_path("app.js"),
            root.join("staging").join("app.js")
        );
        std::fs::write(workspace.staging_path("app.js"), "var a;").unwrap();

        workspace.release().await;
        assert!(!root.exists());
        assert_eq!(std::fs::read_dir(scratch.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_dropped_workspace_is_removed_in_background() {
        let scratch = tempfile::tempdir().unwrap();
        let workspace = RequestWorkspace::create(scratch.path()).await.unwrap();
        std::fs::write(workspace.staging_path("app.js"), "var a;").unwrap();

        drop(workspace);
        assert_eq!(wait_until_empty(scratch.path()).await, 0);
    }

    #[test]
    fn test_drop_outside_runtime_removes_inline() {
        let scratch = tempfile::tempdir().unwrap();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let workspace = runtime
            .block_on(RequestWorkspace::create(scratch.path()))
            .unwrap();
        drop(runtime);

        drop(workspace);
        assert_eq!(std::fs::read_dir(scratch.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_lease_keeps_workspace_until_dropped() {
        let scratch = tempfile::tempdir().unwrap();
        let workspace = RequestWorkspace::create(scratch.path()).await.unwrap();
        let root = workspace.path().to_path_buf();
        let lease = workspace.lease();
        assert!(!lease.is_released());

        workspace.release().await;
        assert!(lease.is_released());
        assert!(root.is_dir());

        drop(lease);
        assert_eq!(wait_until_empty(scratch.path()).await, 0);
    }

    #[tokio::test]
    async fn test_workspaces_never_share_paths() {
        let scratch = tempfile::tempdir().unwrap();
        let a = RequestWorkspace::create(scratch.path()).await.unwrap();
        let b = RequestWorkspace::create(scratch.path()).await.unwrap();
        assert_ne!(a.id(), b.id());
        assert_ne!(a.staging_path("same.js"), b.staging_path("same.js"));
        a.release().await;
        b.release().await;
    }

    #[tokio::test]
    async fn test_sweep_only_touches_old_workspaces() {
        let scratch = tempfile::tempdir().unwrap();
        std::fs::create_dir(scratch.path().join("req-stale")).unwrap();
        std::fs::create_dir(scratch.path().join("keep-me")).unwrap();

        let removed = sweep_orphans(scratch.path(), Duration::from_secs(3600))
            .await
            .unwrap();
        assert_eq!(removed, 0);

        let removed = sweep_orphans(scratch.path(), Duration::ZERO).await.unwrap();
        assert_eq!(removed, 1);
        assert!(!scratch.path().join("req-stale").exists());
        assert!(scratch.path().join("keep-me").exists());
    }
}
