use crate::services::workspace::WorkspaceLease;
use anyhow::{Context, Result, anyhow, bail};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};
use zip::CompressionMethod;
use zip::write::{FileOptions, ZipWriter};

/// Extract/pack utility for compressed directory trees.
///
/// Both operations write inside a request workspace and hold its lease until they
/// finish, so the workspace cannot be removed underneath them. They stop early once
/// the lease reports the request is gone.
#[async_trait::async_trait]
pub trait ArchiveCodec: Send + Sync {
    /// Extract `archive` into `dest`, which must already exist
    async fn extract(
        &self,
        archive: &Path,
        dest: &Path,
        lease: WorkspaceLease,
    ) -> Result<ExtractSummary>;

    /// Pack the contents of `source` (not `source` itself) into a new archive at `archive`
    async fn pack(&self, source: &Path, archive: &Path, lease: WorkspaceLease) -> Result<u64>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtractSummary {
    pub files: usize,
    pub directories: usize,
}

pub struct ZipCodec;

#[async_trait::async_trait]
impl ArchiveCodec for ZipCodec {
    async fn extract(
        &self,
        archive: &Path,
        dest: &Path,
        lease: WorkspaceLease,
    ) -> Result<ExtractSummary> {
        let archive = archive.to_path_buf();
        let dest = dest.to_path_buf();
        tokio::task::spawn_blocking(move || extract_zip(&archive, &dest, &lease))
            .await
            .map_err(|e| anyhow!("Extraction task failed: {}", e))?
    }

    async fn pack(&self, source: &Path, archive: &Path, lease: WorkspaceLease) -> Result<u64> {
        let source = source.to_path_buf();
        let archive = archive.to_path_buf();
        tokio::task::spawn_blocking(move || pack_zip(&source, &archive, &lease))
            .await
            .map_err(|e| anyhow!("Packing task failed: {}", e))?
    }
}

fn extract_zip(archive_path: &Path, dest: &Path, lease: &WorkspaceLease) -> Result<ExtractSummary> {
    if !dest.is_dir() {
        bail!("Extraction target {} does not exist", dest.display());
    }

    let file = File::open(archive_path).context("Failed to open archive")?;
    let mut archive =
        zip::ZipArchive::new(BufReader::new(file)).context("Failed to parse ZIP")?;
    let mut summary = ExtractSummary::default();

    for i in 0..archive.len() {
        if lease.is_released() {
            bail!("Extraction cancelled after {} entries", i);
        }

        let mut entry = archive
            .by_index(i)
            .with_context(|| format!("Failed to read ZIP entry #{}", i))?;

        // Entries escaping the destination (absolute paths, `..`) are refused outright
        let relative = entry
            .enclosed_name()
            .map(Path::to_path_buf)
            .ok_or_else(|| anyhow!("Unsafe path in archive: {}", entry.name()))?;
        let target = dest.join(&relative);

        if entry.is_dir() {
            create_dirs_under(dest, &relative)
                .with_context(|| format!("Failed to create {}", relative.display()))?;
            summary.directories += 1;
            continue;
        }

        if let Some(parent) = relative.parent() {
            create_dirs_under(dest, parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let mut out = BufWriter::new(
            File::create(&target)
                .with_context(|| format!("Failed to create {}", relative.display()))?,
        );
        io::copy(&mut entry, &mut out)
            .with_context(|| format!("Failed to inflate {}", relative.display()))?;
        summary.files += 1;
    }

    tracing::debug!(
        "Extracted {} files and {} directories from {}",
        summary.files,
        summary.directories,
        archive_path.display()
    );

    Ok(summary)
}

/// Create `relative` below `root` one level at a time. Nothing above `root` is ever
/// created, so a vanished `root` makes this fail.
fn create_dirs_under(root: &Path, relative: &Path) -> io::Result<()> {
    let mut current = root.to_path_buf();
    for component in relative.components() {
        current.push(component);
        match fs::create_dir(&current) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn pack_zip(source: &Path, archive_path: &Path, lease: &WorkspaceLease) -> Result<u64> {
    let file = File::create(archive_path).context("Failed to create archive")?;
    let mut zip = ZipWriter::new(BufWriter::new(file));
    let options = FileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .unix_permissions(0o644);

    let mut entries = Vec::new();
    collect_entries(source, Path::new(""), &mut entries)?;

    for (relative, is_dir) in entries {
        if lease.is_released() {
            bail!("Packing cancelled");
        }

        let name = entry_name(&relative);
        if is_dir {
            zip.add_directory(name.as_str(), options.unix_permissions(0o755))
                .with_context(|| format!("Failed to add directory {}", name))?;
        } else {
            zip.start_file(name.as_str(), options)
                .with_context(|| format!("Failed to add file {}", name))?;
            let mut input = BufReader::new(File::open(source.join(&relative))?);
            io::copy(&mut input, &mut zip)
                .with_context(|| format!("Failed to write {}", name))?;
        }
    }

    let mut writer = zip.finish().context("Failed to finalize ZIP archive")?;
    io::Write::flush(&mut writer)?;
    drop(writer);

    Ok(fs::metadata(archive_path)?.len())
}

/// Depth-first listing of `root`, sorted per directory so archives are reproducible
fn collect_entries(root: &Path, relative: &Path, out: &mut Vec<(PathBuf, bool)>) -> Result<()> {
    let mut children = fs::read_dir(root.join(relative))?
        .collect::<io::Result<Vec<_>>>()?;
    children.sort_by_key(|entry| entry.file_name());

    for child in children {
        let file_type = child.file_type()?;
        let child_relative = relative.join(child.file_name());
        if file_type.is_dir() {
            out.push((child_relative.clone(), true));
            collect_entries(root, &child_relative, out)?;
        } else if file_type.is_file() {
            out.push((child_relative, false));
        }
    }

    Ok(())
}

/// ZIP entry names always use forward slashes, directories end with one
fn entry_name(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::workspace::RequestWorkspace;
    use std::io::{Read, Write};

    fn write_zip(path: &Path, entries: &[(&str, Option<&str>)]) {
        let mut zip = ZipWriter::new(File::create(path).unwrap());
        let options = FileOptions::default();
        for (name, content) in entries {
            match content {
                Some(content) => {
                    zip.start_file(*name, options).unwrap();
                    zip.write_all(content.as_bytes()).unwrap();
                }
                None => zip.add_directory(*name, options).unwrap(),
            }
        }
        zip.finish().unwrap();
    }

    #[tokio::test]
    async fn test_extract_creates_files_and_empty_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        let workspace = RequestWorkspace::create(tmp.path()).await.unwrap();
        let archive = workspace.staging_path("in.zip");
        write_zip(
            &archive,
            &[("a/b.js", Some("var b;")), ("empty/", None), ("d.js", Some("var d;"))],
        );
        let dest = workspace.working_dir();

        let summary = ZipCodec
            .extract(&archive, &dest, workspace.lease())
            .await
            .unwrap();
        assert_eq!(summary.files, 2);
        assert_eq!(summary.directories, 1);
        assert_eq!(fs::read_to_string(dest.join("a/b.js")).unwrap(), "var b;");
        assert!(dest.join("empty").is_dir());
        workspace.release().await;
    }

    #[tokio::test]
    async fn test_extract_refuses_path_traversal() {
        let tmp = tempfile::tempdir().unwrap();
        let workspace = RequestWorkspace::create(tmp.path()).await.unwrap();
        let archive = workspace.staging_path("evil.zip");
        write_zip(&archive, &[("../escape.js", Some("alert(1)"))]);

        let result = ZipCodec
            .extract(&archive, &workspace.working_dir(), workspace.lease())
            .await;
        assert!(result.is_err());
        assert!(!workspace.path().join("escape.js").exists());
        workspace.release().await;
    }

    #[tokio::test]
    async fn test_extract_rejects_garbage() {
        let tmp = tempfile::tempdir().unwrap();
        let workspace = RequestWorkspace::create(tmp.path()).await.unwrap();
        let archive = workspace.staging_path("bad.zip");
        fs::write(&archive, b"this is not a zip").unwrap();

        let result = ZipCodec
            .extract(&archive, &workspace.working_dir(), workspace.lease())
            .await;
        assert!(result.is_err());
        workspace.release().await;
    }

    #[tokio::test]
    async fn test_extract_never_recreates_missing_destination() {
        let tmp = tempfile::tempdir().unwrap();
        let workspace = RequestWorkspace::create(tmp.path()).await.unwrap();
        let archive = workspace.staging_path("in.zip");
        write_zip(&archive, &[("a/b/c.js", Some("var c;"))]);
        let dest = workspace.working_dir();
        fs::remove_dir(&dest).unwrap();

        let result = ZipCodec.extract(&archive, &dest, workspace.lease()).await;
        assert!(result.is_err());
        assert!(!dest.exists());
        workspace.release().await;
    }

    #[tokio::test]
    async fn test_extract_stops_once_request_is_gone() {
        let tmp = tempfile::tempdir().unwrap();
        let workspace = RequestWorkspace::create(tmp.path()).await.unwrap();
        let archive = workspace.staging_path("in.zip");
        write_zip(&archive, &[("a.js", Some("var a;")), ("b.js", Some("var b;"))]);
        let dest = workspace.working_dir();
        let lease = workspace.lease();
        let staging = archive.clone();

        // The lease keeps the directory around after the owner is gone
        drop(workspace);
        assert!(staging.is_file());

        let err = ZipCodec.extract(&staging, &dest, lease).await.unwrap_err();
        assert!(err.to_string().contains("cancelled"), "{}", err);
        assert!(!dest.join("a.js").exists());
    }

    #[tokio::test]
    async fn test_pack_has_no_wrapper_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let workspace = RequestWorkspace::create(tmp.path()).await.unwrap();
        let source = workspace.output_dir();
        fs::create_dir_all(source.join("a/nested")).unwrap();
        fs::create_dir_all(source.join("empty")).unwrap();
        fs::write(source.join("a/b.js"), "b").unwrap();
        fs::write(source.join("d.js"), "d").unwrap();

        let archive_path = workspace.artifact_path("out.zip");
        let size = ZipCodec
            .pack(&source, &archive_path, workspace.lease())
            .await
            .unwrap();
        assert!(size > 0);

        let mut archive = zip::ZipArchive::new(File::open(&archive_path).unwrap()).unwrap();
        let mut names: Vec<String> = archive.file_names().map(String::from).collect();
        names.sort();
        assert_eq!(names, vec!["a/", "a/b.js", "a/nested/", "d.js", "empty/"]);

        let mut content = String::new();
        archive
            .by_name("a/b.js")
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "b");
        drop(archive);
        workspace.release().await;
    }
}
