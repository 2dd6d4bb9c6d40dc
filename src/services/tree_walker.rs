use crate::api::error::{AppError, Stage};
use crate::config::NonEligiblePolicy;
use crate::services::transformer::{ObfuscatorOptions, Transformer};
use futures::{StreamExt, TryStreamExt};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct WalkOptions {
    /// Extension (without dot, case-insensitive) of files passed to the transformer
    pub eligible_extension: String,
    pub non_eligible: NonEligiblePolicy,
    /// Maximum number of files transformed at once inside a single directory
    pub concurrency: usize,
    pub transform: ObfuscatorOptions,
}

/// Counts of what a walk did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WalkSummary {
    pub directories: usize,
    pub transformed: usize,
    pub copied: usize,
    pub skipped: usize,
}

/// Mirrors a source tree into a destination root, transforming eligible files on the way
pub struct TreeWalker {
    transformer: Arc<dyn Transformer>,
    options: WalkOptions,
}

impl TreeWalker {
    pub fn new(transformer: Arc<dyn Transformer>, options: WalkOptions) -> Self {
        Self {
            transformer,
            options,
        }
    }

    pub fn options(&self) -> &WalkOptions {
        &self.options
    }

    pub fn is_eligible(&self, path: &Path) -> bool {
        has_extension(path, &self.options.eligible_extension)
    }

    /// Walk `source` into `dest`. `dest` must exist; `source` is only read.
    /// The transformer keeps its intermediate files in `scratch`.
    ///
    /// The first read, transform or write failure aborts the walk. Files already written
    /// under `dest` are left in place for the caller to clean up.
    pub async fn walk(
        &self,
        source: &Path,
        dest: &Path,
        scratch: &Path,
    ) -> Result<WalkSummary, AppError> {
        let mut summary = WalkSummary::default();
        self.walk_dir(source, dest, scratch, &mut summary).await?;
        Ok(summary)
    }

    #[async_recursion::async_recursion]
    async fn walk_dir(
        &self,
        source: &Path,
        dest: &Path,
        scratch: &Path,
        summary: &mut WalkSummary,
    ) -> Result<(), AppError> {
        let mut entries = tokio::fs::read_dir(source)
            .await
            .map_err(AppError::io(Stage::Read))?;

        let mut subdirs = Vec::new();
        let mut jobs = Vec::new();

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(AppError::io(Stage::Read))?
        {
            // file_type() does not follow symlinks
            let file_type = entry.file_type().await.map_err(AppError::io(Stage::Read))?;
            let source_path = entry.path();
            let dest_path = dest.join(entry.file_name());

            if file_type.is_dir() {
                subdirs.push((source_path, dest_path));
            } else if file_type.is_file() && self.is_eligible(&source_path) {
                jobs.push((source_path, dest_path));
            } else if file_type.is_file() {
                match self.options.non_eligible {
                    NonEligiblePolicy::Skip => {
                        tracing::debug!("Skipping non-eligible file {}", source_path.display());
                        summary.skipped += 1;
                    }
                    NonEligiblePolicy::Copy => {
                        tokio::fs::copy(&source_path, &dest_path)
                            .await
                            .map_err(AppError::io(Stage::Write))?;
                        summary.copied += 1;
                    }
                }
            } else {
                tracing::warn!("Ignoring special file {}", source_path.display());
                summary.skipped += 1;
            }
        }

        let done: Vec<()> = futures::stream::iter(jobs)
            .map(|(src, dst)| {
                transform_file(
                    self.transformer.as_ref(),
                    &self.options.transform,
                    src,
                    dst,
                    scratch,
                )
            })
            .buffer_unordered(self.options.concurrency.max(1))
            .try_collect()
            .await?;
        summary.transformed += done.len();

        for (src, dst) in subdirs {
            match tokio::fs::create_dir(&dst).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
                Err(e) => {
                    return Err(AppError::Io {
                        stage: Stage::Write,
                        source: e,
                    });
                }
            }
            summary.directories += 1;
            self.walk_dir(&src, &dst, scratch, summary).await?;
        }

        Ok(())
    }
}

/// Read `source` as UTF-8, run it through the transformer and write the result to `dest`
pub async fn transform_file(
    transformer: &dyn Transformer,
    options: &ObfuscatorOptions,
    source: PathBuf,
    dest: PathBuf,
    scratch: &Path,
) -> Result<(), AppError> {
    let text = tokio::fs::read_to_string(&source)
        .await
        .map_err(AppError::io(Stage::Read))?;

    let transformed = transformer
        .transform(&text, options, scratch)
        .await
        .map_err(|e| AppError::Transform(format!("{}: {:#}", source.display(), e)))?;

    tokio::fs::write(&dest, transformed)
        .await
        .map_err(AppError::io(Stage::Write))?;

    tracing::debug!("Transformed {} -> {}", source.display(), dest.display());
    Ok(())
}

pub fn has_extension(path: &Path, extension: &str) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case(extension))
}
