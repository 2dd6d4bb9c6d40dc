use crate::config::ServiceConfig;
use crate::services::transformer::{Transformer, create_transformer};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub async fn setup_transformer(config: &ServiceConfig) -> Arc<dyn Transformer> {
    let transformer = create_transformer(
        &config.transformer_type,
        &config.obfuscator_bin,
        Duration::from_secs(config.transform_timeout_secs),
    );

    // Warm up: surface a missing binary at startup
    if transformer.health_check().await {
        info!("🔐 Transformer '{}' ready", config.transformer_type);
    } else {
        tracing::warn!(
            "⚠️  Transformer '{}' unavailable ({}). Uploads will fail until it is installed.",
            config.transformer_type,
            config.obfuscator_bin
        );
    }

    transformer.into()
}
