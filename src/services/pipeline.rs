use crate::api::error::{AppError, Stage};
use crate::config::ServiceConfig;
use crate::services::archive::ArchiveCodec;
use crate::services::transformer::{ObfuscatorOptions, Transformer};
use crate::services::tree_walker::{TreeWalker, WalkOptions, transform_file};
use crate::services::workspace::RequestWorkspace;
use crate::utils::validation::{UploadKind, classify_upload, is_zip_header};
use axum::body::Body;
use futures::StreamExt;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio_util::io::ReaderStream;
use uuid::Uuid;

/// Download name for repackaged archives
pub const ARCHIVE_DOWNLOAD_NAME: &str = "obfuscated_files.zip";
/// Prefix added to the name of a single transformed script
pub const SINGLE_FILE_PREFIX: &str = "obfuscated-";
pub const REJECTED_MESSAGE: &str = "Please upload a ZIP file.";

const HEADER_LEN: usize = 16;
const COPY_BUFFER: usize = 64 * 1024;

/// Lifecycle of one upload, used for logging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    Received,
    Classified(UploadKind),
    Rejected,
    Ready,
    Sent,
    Done,
    Failed,
}

impl fmt::Display for UploadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UploadState::Received => f.write_str("RECEIVED"),
            UploadState::Classified(UploadKind::SingleFile) => f.write_str("CLASSIFIED/SINGLE_FILE"),
            UploadState::Classified(UploadKind::Archive) => f.write_str("CLASSIFIED/ARCHIVE"),
            UploadState::Rejected => f.write_str("REJECTED"),
            UploadState::Ready => f.write_str("READY"),
            UploadState::Sent => f.write_str("SENT"),
            UploadState::Done => f.write_str("DONE"),
            UploadState::Failed => f.write_str("FAILED"),
        }
    }
}

fn transition(request: Uuid, state: UploadState) {
    tracing::info!(request = %request, "🔁 Upload {}", state);
}

/// An upload persisted into its request workspace
#[derive(Debug)]
pub struct StagedUpload {
    pub workspace: RequestWorkspace,
    /// Sanitized original filename
    pub filename: String,
    pub kind: UploadKind,
    pub path: PathBuf,
    pub size: u64,
    /// First bytes of the payload, for signature checks
    pub header: Vec<u8>,
}

/// What processing left in the workspace for download
struct Artifact {
    path: PathBuf,
    download_name: String,
    content_type: &'static str,
    size: u64,
}

/// A finished artifact ready to be streamed back
#[derive(Debug)]
pub struct ProcessedUpload {
    workspace: RequestWorkspace,
    artifact: PathBuf,
    pub download_name: String,
    pub content_type: &'static str,
    pub size: u64,
}

impl ProcessedUpload {
    pub fn request_id(&self) -> Uuid {
        self.workspace.id()
    }

    /// Turn the artifact into a streaming body.
    ///
    /// The body owns the workspace: it is removed after the last chunk has been
    /// handed to the connection, or as soon as the body is dropped because the
    /// client went away.
    pub async fn into_body(self) -> Result<Body, AppError> {
        let file = match tokio::fs::File::open(&self.artifact).await {
            Ok(file) => file,
            Err(e) => {
                self.workspace.release().await;
                return Err(AppError::io(Stage::Send)(e));
            }
        };
        let workspace = self.workspace;
        let request = workspace.id();

        let stream = async_stream::stream! {
            let guard = workspace;
            let mut reader = ReaderStream::new(file);
            let mut failed = false;

            while let Some(chunk) = reader.next().await {
                if let Err(e) = &chunk {
                    tracing::error!(request = %request, "{} {}", Stage::Send.client_message(), e);
                    failed = true;
                }
                yield chunk;
            }

            if failed {
                transition(request, UploadState::Failed);
            } else {
                transition(request, UploadState::Sent);
            }
            drop(reader);
            guard.release().await;
            transition(request, UploadState::Done);
        };

        Ok(Body::from_stream(stream))
    }
}

/// Drives one upload from staging to a downloadable artifact
pub struct UploadPipeline {
    config: ServiceConfig,
    transformer: Arc<dyn Transformer>,
    codec: Arc<dyn ArchiveCodec>,
    walker: TreeWalker,
}

impl UploadPipeline {
    pub fn new(
        config: ServiceConfig,
        transformer: Arc<dyn Transformer>,
        codec: Arc<dyn ArchiveCodec>,
    ) -> Self {
        let walker = TreeWalker::new(
            transformer.clone(),
            WalkOptions {
                eligible_extension: config.eligible_extension.clone(),
                non_eligible: config.non_eligible_policy,
                concurrency: config.walk_concurrency,
                transform: ObfuscatorOptions::hardened(),
            },
        );

        Self {
            config,
            transformer,
            codec,
            walker,
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Reject anything that is neither an eligible script nor a ZIP archive
    pub fn classify(&self, filename: &str, content_type: Option<&str>) -> Result<UploadKind, AppError> {
        classify_upload(filename, content_type, &self.config.eligible_extension).ok_or_else(|| {
            tracing::info!("Rejected upload {} ({:?})", filename, content_type);
            AppError::InvalidInput(REJECTED_MESSAGE.to_string())
        })
    }

    /// Persist the payload into a fresh workspace
    pub async fn stage<R>(
        &self,
        filename: String,
        kind: UploadKind,
        reader: R,
    ) -> Result<StagedUpload, AppError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let workspace = RequestWorkspace::create(&self.config.scratch_dir).await?;
        let path = workspace.staging_path(&filename);

        let (size, header) = match self.write_staged(&path, reader).await {
            Ok(written) => written,
            Err(e) => {
                workspace.release().await;
                return Err(e);
            }
        };

        transition(workspace.id(), UploadState::Received);
        tracing::info!(
            request = %workspace.id(),
            "📥 Staged {} ({} bytes)",
            filename,
            size
        );

        Ok(StagedUpload {
            workspace,
            filename,
            kind,
            path,
            size,
            header,
        })
    }

    async fn write_staged<R>(&self, path: &Path, mut reader: R) -> Result<(u64, Vec<u8>), AppError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut file = tokio::fs::File::create(path)
            .await
            .map_err(AppError::io(Stage::Receive))?;

        let mut buffer = vec![0u8; COPY_BUFFER];
        let mut header = Vec::with_capacity(HEADER_LEN);
        let mut size: u64 = 0;

        loop {
            let n = reader.read(&mut buffer).await.map_err(|e| {
                if e.to_string().contains("length limit exceeded") {
                    AppError::PayloadTooLarge("File is too large.".to_string())
                } else {
                    AppError::Io {
                        stage: Stage::Receive,
                        source: e,
                    }
                }
            })?;
            if n == 0 {
                break;
            }

            size += n as u64;
            if size > self.config.max_file_size as u64 {
                return Err(AppError::PayloadTooLarge("File is too large.".to_string()));
            }
            if header.len() < HEADER_LEN {
                let take = (HEADER_LEN - header.len()).min(n);
                header.extend_from_slice(&buffer[..take]);
            }

            file.write_all(&buffer[..n])
                .await
                .map_err(AppError::io(Stage::Receive))?;
        }
        file.flush().await.map_err(AppError::io(Stage::Receive))?;

        Ok((size, header))
    }

    /// Transform a staged upload into its downloadable artifact
    pub async fn process(&self, upload: StagedUpload) -> Result<ProcessedUpload, AppError> {
        let StagedUpload {
            workspace,
            filename,
            kind,
            path,
            header,
            ..
        } = upload;
        let request = workspace.id();
        transition(request, UploadState::Classified(kind));

        let result = match kind {
            UploadKind::SingleFile => self.process_single(&workspace, &filename, path).await,
            UploadKind::Archive => {
                self.process_archive(&workspace, &filename, &path, &header)
                    .await
            }
        };

        match result {
            Ok(artifact) => {
                transition(request, UploadState::Ready);
                Ok(ProcessedUpload {
                    workspace,
                    artifact: artifact.path,
                    download_name: artifact.download_name,
                    content_type: artifact.content_type,
                    size: artifact.size,
                })
            }
            Err(e) => {
                match &e {
                    AppError::InvalidInput(_) => transition(request, UploadState::Rejected),
                    _ => transition(request, UploadState::Failed),
                }
                workspace.release().await;
                Err(e)
            }
        }
    }

    async fn process_single(
        &self,
        workspace: &RequestWorkspace,
        filename: &str,
        staged: PathBuf,
    ) -> Result<Artifact, AppError> {
        let download_name = format!("{}{}", SINGLE_FILE_PREFIX, filename);
        let artifact = workspace.output_dir().join(&download_name);

        transform_file(
            self.transformer.as_ref(),
            &ObfuscatorOptions::default(),
            staged,
            artifact.clone(),
            &workspace.temp_dir(),
        )
        .await?;

        let size = tokio::fs::metadata(&artifact)
            .await
            .map_err(AppError::io(Stage::Write))?
            .len();

        Ok(Artifact {
            path: artifact,
            download_name,
            content_type: "application/javascript",
            size,
        })
    }

    async fn process_archive(
        &self,
        workspace: &RequestWorkspace,
        filename: &str,
        staged: &Path,
        header: &[u8],
    ) -> Result<Artifact, AppError> {
        if !is_zip_header(header) {
            tracing::info!("{} is not a ZIP archive", filename);
            return Err(AppError::InvalidInput(REJECTED_MESSAGE.to_string()));
        }

        let request = workspace.id();
        let working = workspace.working_dir();
        let output = workspace.output_dir();

        let extracted = self
            .codec
            .extract(staged, &working, workspace.lease())
            .await
            .map_err(|e| AppError::packaging(Stage::Extract, format!("{:#}", e)))?;
        tracing::info!(
            request = %request,
            "📦 Extracted {} files, {} directories",
            extracted.files,
            extracted.directories
        );

        // The payload is no longer needed once its tree is on disk
        if let Err(e) = tokio::fs::remove_file(staged).await {
            tracing::debug!("Could not drop staged archive early: {}", e);
        }

        let summary = self
            .walker
            .walk(&working, &output, &workspace.temp_dir())
            .await?;
        tracing::info!(
            request = %request,
            "🌲 Walked tree: {} dirs, {} transformed, {} copied, {} skipped",
            summary.directories,
            summary.transformed,
            summary.copied,
            summary.skipped
        );

        let artifact = workspace.artifact_path(ARCHIVE_DOWNLOAD_NAME);
        let size = self
            .codec
            .pack(&output, &artifact, workspace.lease())
            .await
            .map_err(|e| AppError::packaging(Stage::Pack, format!("{:#}", e)))?;

        Ok(Artifact {
            path: artifact,
            download_name: ARCHIVE_DOWNLOAD_NAME.to_string(),
            content_type: "application/zip",
            size,
        })
    }
}
