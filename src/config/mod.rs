use std::env;
use std::path::PathBuf;
use std::str::FromStr;

/// What the tree walker does with files that the transformer cannot handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonEligiblePolicy {
    /// Leave the file out of the output tree
    Skip,
    /// Copy the file into the output tree unchanged
    Copy,
}

impl FromStr for NonEligiblePolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "skip" | "drop" => Ok(NonEligiblePolicy::Skip),
            "copy" | "passthrough" => Ok(NonEligiblePolicy::Copy),
            _ => Err(anyhow::anyhow!("Unknown non-eligible file policy: {}", s)),
        }
    }
}

/// Service configuration for uploads and obfuscation
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Maximum upload size in bytes (default: 256 MB)
    pub max_file_size: usize,

    /// Root under which every request gets its own scratch directory (default: "uploads")
    pub scratch_dir: PathBuf,

    /// Directory holding the upload page (default: "public")
    pub static_dir: PathBuf,

    /// Transformer backend: "javascript-obfuscator" or "noop"
    pub transformer_type: String,

    /// Path or name of the javascript-obfuscator executable
    pub obfuscator_bin: String,

    /// Upper bound for a single transformer invocation, in seconds (default: 120)
    pub transform_timeout_secs: u64,

    /// Extension (without dot) of files handed to the transformer (default: "js")
    pub eligible_extension: String,

    /// Handling of non-eligible files found inside archives (default: skip)
    pub non_eligible_policy: NonEligiblePolicy,

    /// Files transformed concurrently within one directory (default: 4)
    pub walk_concurrency: usize,

    /// Age after which an abandoned request directory is swept, in hours (default: 24)
    pub staging_cleanup_age_hours: u64,

    /// Allowed CORS origins (comma separated). Empty allows any origin.
    pub allowed_origins: Vec<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            max_file_size: 256 * 1024 * 1024, // 256 MB
            scratch_dir: PathBuf::from("uploads"),
            static_dir: PathBuf::from("public"),
            transformer_type: "javascript-obfuscator".to_string(),
            obfuscator_bin: "javascript-obfuscator".to_string(),
            transform_timeout_secs: 120,
            eligible_extension: "js".to_string(),
            non_eligible_policy: NonEligiblePolicy::Skip,
            walk_concurrency: 4,
            staging_cleanup_age_hours: 24,
            allowed_origins: Vec::new(),
        }
    }
}

impl ServiceConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let default = Self::default();

        Self {
            max_file_size: env::var("MAX_FILE_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.max_file_size),

            scratch_dir: env::var("SCRATCH_DIR")
                .map(PathBuf::from)
                .unwrap_or(default.scratch_dir),

            static_dir: env::var("STATIC_DIR")
                .map(PathBuf::from)
                .unwrap_or(default.static_dir),

            transformer_type: env::var("TRANSFORMER_TYPE").unwrap_or(default.transformer_type),

            obfuscator_bin: env::var("OBFUSCATOR_BIN").unwrap_or(default.obfuscator_bin),

            transform_timeout_secs: env::var("TRANSFORM_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.transform_timeout_secs),

            eligible_extension: env::var("ELIGIBLE_EXTENSION")
                .map(|v| v.trim_start_matches('.').to_lowercase())
                .unwrap_or(default.eligible_extension),

            non_eligible_policy: env::var("NON_ELIGIBLE_POLICY")
                .ok()
                .and_then(|v| match v.parse() {
                    Ok(policy) => Some(policy),
                    Err(e) => {
                        tracing::warn!("{}, falling back to skip", e);
                        None
                    }
                })
                .unwrap_or(default.non_eligible_policy),

            walk_concurrency: env::var("WALK_CONCURRENCY")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|n: &usize| *n > 0)
                .unwrap_or(default.walk_concurrency),

            staging_cleanup_age_hours: env::var("STAGING_CLEANUP_AGE_HOURS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.staging_cleanup_age_hours),

            allowed_origins: env::var("ALLOWED_ORIGINS")
                .map(|v| {
                    v.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or(default.allowed_origins),
        }
    }

    /// Create config for development (pass-through transformer, no external binary needed)
    pub fn development() -> Self {
        Self {
            transformer_type: "noop".to_string(),
            staging_cleanup_age_hours: 1,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServiceConfig::default();
        assert_eq!(config.max_file_size, 256 * 1024 * 1024);
        assert_eq!(config.scratch_dir, PathBuf::from("uploads"));
        assert_eq!(config.transformer_type, "javascript-obfuscator");
        assert_eq!(config.eligible_extension, "js");
        assert_eq!(config.non_eligible_policy, NonEligiblePolicy::Skip);
        assert!(config.allowed_origins.is_empty());
    }

    #[test]
    fn test_development_config() {
        let config = ServiceConfig::development();
        assert_eq!(config.transformer_type, "noop");
        assert_eq!(config.walk_concurrency, 4);
    }

    #[test]
    fn test_non_eligible_policy_parsing() {
        assert_eq!("skip".parse::<NonEligiblePolicy>().unwrap(), NonEligiblePolicy::Skip);
        assert_eq!("COPY".parse::<NonEligiblePolicy>().unwrap(), NonEligiblePolicy::Copy);
        assert_eq!(" drop ".parse::<NonEligiblePolicy>().unwrap(), NonEligiblePolicy::Skip);
        assert!("mirror".parse::<NonEligiblePolicy>().is_err());
    }
}
