use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use std::fmt;
use thiserror::Error;

/// Pipeline step a failure is attributed to. The step decides the message the client sees.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Receive,
    Read,
    Extract,
    Transform,
    Write,
    Pack,
    Send,
}

impl Stage {
    pub fn client_message(&self) -> &'static str {
        match self {
            Stage::Receive => "Error receiving file.",
            Stage::Read => "Error reading file.",
            Stage::Extract => "Error extracting archive.",
            Stage::Transform => "Error obfuscating file.",
            Stage::Write => "Error saving obfuscated file.",
            Stage::Pack => "Error packaging archive.",
            Stage::Send => "Error sending the file.",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Receive => "receive",
            Stage::Read => "read",
            Stage::Extract => "extract",
            Stage::Transform => "transform",
            Stage::Write => "write",
            Stage::Pack => "pack",
            Stage::Send => "send",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Payload Too Large: {0}")]
    PayloadTooLarge(String),

    #[error("I/O failure during {stage}: {source}")]
    Io {
        stage: Stage,
        #[source]
        source: std::io::Error,
    },

    #[error("Transform failed: {0}")]
    Transform(String),

    #[error("Packaging failed during {stage}: {reason}")]
    Packaging { stage: Stage, reason: String },
}

impl AppError {
    pub fn io(stage: Stage) -> impl FnOnce(std::io::Error) -> AppError {
        move |source| AppError::Io { stage, source }
    }

    pub fn packaging(stage: Stage, reason: impl fmt::Display) -> AppError {
        AppError::Packaging {
            stage,
            reason: reason.to_string(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            AppError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            AppError::Io { .. } | AppError::Transform(_) | AppError::Packaging { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let message = match &self {
            AppError::InvalidInput(msg) => msg.clone(),
            AppError::PayloadTooLarge(msg) => msg.clone(),
            AppError::Io { stage, source } => {
                tracing::error!("I/O error during {}: {:?}", stage, source);
                stage.client_message().to_string()
            }
            AppError::Transform(reason) => {
                tracing::error!("Transform error: {}", reason);
                Stage::Transform.client_message().to_string()
            }
            AppError::Packaging { stage, reason } => {
                tracing::error!("Packaging error during {}: {}", stage, reason);
                stage.client_message().to_string()
            }
        };

        (self.status(), message).into_response()
    }
}
