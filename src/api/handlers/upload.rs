use crate::AppState;
use crate::api::error::{AppError, Stage};
use crate::services::pipeline::StagedUpload;
use crate::utils::validation::{attachment_disposition, sanitize_filename};
use axum::{
    extract::{Multipart, State},
    http::{StatusCode, header},
    response::Response,
};
use futures::TryStreamExt;
use tokio_util::io::StreamReader;

#[utoipa::path(
    post,
    path = "/upload",
    request_body(content = Multipart, description = "A single `.js` script or a `.zip` archive in the `file` field"),
    responses(
        (status = 200, description = "Obfuscated script or archive, sent as an attachment"),
        (status = 400, description = "Missing file or unsupported file type"),
        (status = 413, description = "File too large"),
        (status = 500, description = "Processing failed; the body names the failing stage")
    ),
    tag = "obfuscation"
)]
pub async fn upload_file(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Response, AppError> {
    let pipeline = state.pipeline.clone();

    let result: Result<StagedUpload, AppError> = async {
        let mut staged: Option<StagedUpload> = None;

        while let Some(field) = multipart.next_field().await.map_err(|e| {
            let err_msg = e.to_string();
            if err_msg.contains("length limit exceeded") {
                AppError::PayloadTooLarge("File is too large.".to_string())
            } else {
                AppError::InvalidInput(err_msg)
            }
        })? {
            let name = field.name().unwrap_or_default().to_string();

            if name != "file" || staged.is_some() {
                tracing::debug!("Ignoring multipart field '{}'", name);
                continue;
            }

            let original_filename = field.file_name().unwrap_or_default().to_string();
            let content_type = field.content_type().map(|s| s.to_string());

            // 1. Sanitize filename
            let filename = sanitize_filename(&original_filename)
                .map_err(|e| AppError::InvalidInput(e.to_string()))?;

            // 2. Classify before touching the disk
            let kind = pipeline.classify(&filename, content_type.as_deref())?;

            // 3. Stream into the request workspace
            let body_with_io_error = field.map_err(std::io::Error::other);
            let reader = StreamReader::new(body_with_io_error);
            staged = Some(pipeline.stage(filename, kind, reader).await?);
        }

        staged.ok_or(AppError::InvalidInput("No file uploaded.".to_string()))
    }
    .await;

    let staged = match result {
        Ok(staged) => staged,
        Err(e) => {
            // Drain remaining fields before answering
            tracing::warn!("Upload failed early: {}. Consuming remaining stream...", e);
            while let Ok(Some(mut field)) = multipart.next_field().await {
                while let Ok(Some(_)) = field.chunk().await {}
            }
            return Err(e);
        }
    };

    // 4. Process and stream back
    let processed = pipeline.process(staged).await?;
    tracing::info!(
        request = %processed.request_id(),
        "📤 Sending {} ({} bytes)",
        processed.download_name,
        processed.size
    );

    let content_type = processed.content_type;
    let content_length = processed.size;
    let content_disposition = attachment_disposition(&processed.download_name);
    let body = processed.into_body().await?;

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CONTENT_LENGTH, content_length)
        .header(header::CONTENT_DISPOSITION, content_disposition)
        .header(header::CACHE_CONTROL, "no-store")
        .body(body)
        .map_err(|e| AppError::Io {
            stage: Stage::Send,
            source: std::io::Error::other(e),
        })
}
