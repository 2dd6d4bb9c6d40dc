use crate::AppState;
use axum::{Json, extract::State, response::IntoResponse};
use serde::Serialize;
use utoipa::ToSchema;

#[derive(Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub transformer: String,
    pub scratch_dir: String,
    pub version: String,
}

#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "System health status", body = HealthResponse)
    ),
    tag = "system"
)]
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let transformer_status = if state.transformer.health_check().await {
        "available"
    } else {
        "unavailable"
    };

    let scratch_status = match tokio::fs::metadata(&state.config.scratch_dir).await {
        Ok(meta) if meta.is_dir() => "ready",
        _ => "missing",
    };

    let status = if transformer_status == "available" && scratch_status == "ready" {
        "ok"
    } else {
        "degraded"
    };

    Json(HealthResponse {
        status: status.to_string(),
        transformer: transformer_status.to_string(),
        scratch_dir: scratch_status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}
