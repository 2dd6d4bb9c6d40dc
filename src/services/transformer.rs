use anyhow::{Context, Result, anyhow};
use serde::Serialize;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// Options forwarded to the obfuscator. `None` fields fall back to the obfuscator's own defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ObfuscatorOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compact: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub control_flow_flattening: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub control_flow_flattening_threshold: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dead_code_injection: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dead_code_injection_threshold: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug_protection: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug_protection_interval: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disable_console_output: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain_lock: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identifier_names_generator: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identifiers_prefix: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub self_defending: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub simplify: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub string_array: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub string_array_calls_transform: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub string_array_calls_transform_threshold: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub string_array_threshold: Option<f64>,
}

impl ObfuscatorOptions {
    /// Option set applied to every script found inside an uploaded archive
    pub fn hardened() -> Self {
        Self {
            compact: Some(true),
            control_flow_flattening: Some(true),
            control_flow_flattening_threshold: Some(0.75),
            dead_code_injection: Some(true),
            dead_code_injection_threshold: Some(1.0),
            debug_protection: Some(true),
            debug_protection_interval: Some(1000),
            disable_console_output: Some(true),
            domain_lock: Some(Vec::new()),
            identifier_names_generator: Some("hexadecimal".to_string()),
            identifiers_prefix: Some(String::new()),
            self_defending: Some(true),
            simplify: Some(true),
            string_array: Some(true),
            string_array_calls_transform: Some(true),
            string_array_calls_transform_threshold: Some(0.5),
            string_array_threshold: Some(0.75),
        }
    }

    pub fn is_default(&self) -> bool {
        self == &Self::default()
    }
}

/// Trait for text-to-text source transformers
#[async_trait::async_trait]
pub trait Transformer: Send + Sync {
    /// Transform one script. Errors mean the transformer rejected the input or could not run.
    ///
    /// Any intermediate files go under `scratch`, which belongs to the calling request.
    async fn transform(
        &self,
        source: &str,
        options: &ObfuscatorOptions,
        scratch: &Path,
    ) -> Result<String>;

    /// Check if the transformer is available
    async fn health_check(&self) -> bool;
}

/// Runs the `javascript-obfuscator` command line tool.
///
/// Install with:
/// ```bash
/// npm install -g javascript-obfuscator
/// ```
pub struct JavaScriptObfuscatorCli {
    bin: String,
    timeout: Duration,
}

impl JavaScriptObfuscatorCli {
    pub fn new(bin: String, timeout: Duration) -> Self {
        Self { bin, timeout }
    }
}

#[async_trait::async_trait]
impl Transformer for JavaScriptObfuscatorCli {
    async fn transform(
        &self,
        source: &str,
        options: &ObfuscatorOptions,
        scratch: &Path,
    ) -> Result<String> {
        let input = tempfile::Builder::new()
            .prefix("obf-in-")
            .suffix(".js")
            .tempfile_in(scratch)?;
        tokio::fs::write(input.path(), source).await?;

        let output = tempfile::Builder::new()
            .prefix("obf-out-")
            .suffix(".js")
            .tempfile_in(scratch)?;

        let mut cmd = Command::new(&self.bin);
        cmd.arg(input.path()).arg("--output").arg(output.path());

        // Held until the process exits so the config file outlives the invocation
        let _config_file = if options.is_default() {
            None
        } else {
            let config = tempfile::Builder::new()
                .prefix("obf-config-")
                .suffix(".json")
                .tempfile_in(scratch)?;
            let json = serde_json::to_vec(options).context("Failed to serialize options")?;
            tokio::fs::write(config.path(), json).await?;
            cmd.arg("--config").arg(config.path());
            Some(config)
        };

        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let result = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| anyhow!("{} timed out after {:?}", self.bin, self.timeout))?
            .with_context(|| format!("Failed to spawn {}", self.bin))?;

        if !result.status.success() {
            let err_msg = String::from_utf8_lossy(&result.stderr);
            let out_msg = String::from_utf8_lossy(&result.stdout);
            tracing::error!("{} failed: {} {}", self.bin, err_msg.trim(), out_msg.trim());
            return Err(anyhow!("{} exited with {}", self.bin, result.status));
        }

        let code = tokio::fs::read_to_string(output.path()).await?;
        if code.is_empty() && !source.trim().is_empty() {
            return Err(anyhow!("{} produced no output", self.bin));
        }

        Ok(code)
    }

    async fn health_check(&self) -> bool {
        let version_check = Command::new(&self.bin)
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status();

        matches!(
            tokio::time::timeout(Duration::from_secs(10), version_check).await,
            Ok(Ok(status)) if status.success()
        )
    }
}

/// Pass-through transformer for development/testing
pub struct NoOpTransformer;

#[async_trait::async_trait]
impl Transformer for NoOpTransformer {
    async fn transform(
        &self,
        source: &str,
        _options: &ObfuscatorOptions,
        _scratch: &Path,
    ) -> Result<String> {
        tracing::warn!("NoOpTransformer: returning source unchanged (development mode)");
        Ok(source.to_string())
    }

    async fn health_check(&self) -> bool {
        true
    }
}

/// Factory function to create the transformer named in the config
pub fn create_transformer(
    transformer_type: &str,
    bin: &str,
    timeout: Duration,
) -> Box<dyn Transformer> {
    match transformer_type.to_lowercase().as_str() {
        "javascript-obfuscator" | "obfuscator" | "cli" => {
            Box::new(JavaScriptObfuscatorCli::new(bin.to_string(), timeout))
        }
        "noop" | "none" | "disabled" => Box::new(NoOpTransformer),
        _ => {
            tracing::warn!(
                "Unknown transformer type '{}', using javascript-obfuscator",
                transformer_type
            );
            Box::new(JavaScriptObfuscatorCli::new(bin.to_string(), timeout))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hardened_options_serialize_with_camel_case_keys() {
        let json = serde_json::to_value(ObfuscatorOptions::hardened()).unwrap();
        assert_eq!(json["compact"], true);
        assert_eq!(json["controlFlowFlattening"], true);
        assert_eq!(json["controlFlowFlatteningThreshold"], 0.75);
        assert_eq!(json["deadCodeInjection"], true);
        assert_eq!(json["deadCodeInjectionThreshold"], 1.0);
        assert_eq!(json["debugProtection"], true);
        assert_eq!(json["debugProtectionInterval"], 1000);
        assert_eq!(json["disableConsoleOutput"], true);
        assert_eq!(json["domainLock"], serde_json::json!([]));
        assert_eq!(json["identifierNamesGenerator"], "hexadecimal");
        assert_eq!(json["identifiersPrefix"], "");
        assert_eq!(json["selfDefending"], true);
        assert_eq!(json["simplify"], true);
        assert_eq!(json["stringArray"], true);
        assert_eq!(json["stringArrayCallsTransform"], true);
        assert_eq!(json["stringArrayCallsTransformThreshold"], 0.5);
        assert_eq!(json["stringArrayThreshold"], 0.75);
        assert_eq!(json.as_object().unwrap().len(), 17);
    }

    #[test]
    fn test_default_options_are_empty() {
        let options = ObfuscatorOptions::default();
        assert!(options.is_default());
        assert!(!ObfuscatorOptions::hardened().is_default());
        assert_eq!(serde_json::to_string(&options).unwrap(), "{}");
    }

    #[tokio::test]
    async fn test_noop_transformer() {
        let transformer = NoOpTransformer;
        let out = transformer
            .transform("var a=1;", &ObfuscatorOptions::hardened(), Path::new("."))
            .await
            .unwrap();
        assert_eq!(out, "var a=1;");
        assert!(transformer.health_check().await);
    }

    #[tokio::test]
    async fn test_missing_binary_fails() {
        let scratch = tempfile::tempdir().unwrap();
        let transformer = JavaScriptObfuscatorCli::new(
            "definitely-not-an-installed-obfuscator".to_string(),
            Duration::from_secs(5),
        );
        assert!(!transformer.health_check().await);
        assert!(
            transformer
                .transform("var a=1;", &ObfuscatorOptions::default(), scratch.path())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_create_transformer() {
        let transformer = create_transformer("noop", "unused", Duration::from_secs(1));
        assert!(transformer.health_check().await);

        let transformer = create_transformer("disabled", "unused", Duration::from_secs(1));
        assert!(transformer.health_check().await);
    }

    #[cfg(unix)]
    mod cli {
        use super::*;
        use std::os::unix::fs::PermissionsExt;
        use std::path::PathBuf;

        /// Shell script standing in for the obfuscator binary
        fn fake_obfuscator(dir: &Path, body: &str) -> PathBuf {
            let path = dir.join("fake-obfuscator");
            std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
            let mut permissions = std::fs::metadata(&path).unwrap().permissions();
            permissions.set_mode(0o755);
            std::fs::set_permissions(&path, permissions).unwrap();
            path
        }

        /// Records its arguments and config, then prefixes the input into `--output`
        fn recording_obfuscator(dir: &Path) -> JavaScriptObfuscatorCli {
            let dump = dir.display();
            let body = format!(
                "printf '%s\\n' \"$@\" > '{dump}/args'\n\
                 if [ \"$4\" = \"--config\" ]; then cp \"$5\" '{dump}/config.json'; fi\n\
                 {{ printf '/* fake */'; cat \"$1\"; }} > \"$3\""
            );
            let bin = fake_obfuscator(dir, &body);
            JavaScriptObfuscatorCli::new(bin.display().to_string(), Duration::from_secs(10))
        }

        fn recorded_args(dir: &Path) -> Vec<String> {
            std::fs::read_to_string(dir.join("args"))
                .unwrap()
                .lines()
                .map(String::from)
                .collect()
        }

        #[tokio::test]
        async fn test_hardened_options_are_passed_as_config_file() {
            let bin_dir = tempfile::tempdir().unwrap();
            let scratch = tempfile::tempdir().unwrap();
            let transformer = recording_obfuscator(bin_dir.path());

            let out = transformer
                .transform("var a=1;", &ObfuscatorOptions::hardened(), scratch.path())
                .await
                .unwrap();
            assert_eq!(out, "/* fake */var a=1;");

            let args = recorded_args(bin_dir.path());
            assert_eq!(args.len(), 5);
            assert!(args[0].ends_with(".js"));
            assert_eq!(args[1], "--output");
            assert!(args[2].ends_with(".js"));
            assert_eq!(args[3], "--config");
            assert!(args[4].ends_with(".json"));
            for arg in [&args[0], &args[2], &args[4]] {
                assert!(Path::new(arg).starts_with(scratch.path()), "{}", arg);
            }

            let written: serde_json::Value = serde_json::from_slice(
                &std::fs::read(bin_dir.path().join("config.json")).unwrap(),
            )
            .unwrap();
            assert_eq!(
                written,
                serde_json::to_value(ObfuscatorOptions::hardened()).unwrap()
            );

            // Intermediate files are gone once the call returns
            assert_eq!(std::fs::read_dir(scratch.path()).unwrap().count(), 0);
        }

        #[tokio::test]
        async fn test_default_options_pass_no_config() {
            let bin_dir = tempfile::tempdir().unwrap();
            let scratch = tempfile::tempdir().unwrap();
            let transformer = recording_obfuscator(bin_dir.path());

            let out = transformer
                .transform("let b = 2;", &ObfuscatorOptions::default(), scratch.path())
                .await
                .unwrap();
            assert_eq!(out, "/* fake */let b = 2;");

            let args = recorded_args(bin_dir.path());
            assert_eq!(args.len(), 3);
            assert_eq!(args[1], "--output");
            assert!(!bin_dir.path().join("config.json").exists());
        }

        #[tokio::test]
        async fn test_non_zero_exit_is_an_error() {
            let bin_dir = tempfile::tempdir().unwrap();
            let scratch = tempfile::tempdir().unwrap();
            let bin = fake_obfuscator(bin_dir.path(), "echo 'Line 1: Unexpected token' >&2\nexit 3");
            let transformer =
                JavaScriptObfuscatorCli::new(bin.display().to_string(), Duration::from_secs(10));

            let err = transformer
                .transform("var = ;", &ObfuscatorOptions::default(), scratch.path())
                .await
                .unwrap_err();
            assert!(err.to_string().contains("exited with"), "{}", err);
        }

        #[tokio::test]
        async fn test_empty_output_is_an_error() {
            let bin_dir = tempfile::tempdir().unwrap();
            let scratch = tempfile::tempdir().unwrap();
            let bin = fake_obfuscator(bin_dir.path(), ": > \"$3\"");
            let transformer =
                JavaScriptObfuscatorCli::new(bin.display().to_string(), Duration::from_secs(10));

            let err = transformer
                .transform("var a=1;", &ObfuscatorOptions::default(), scratch.path())
                .await
                .unwrap_err();
            assert!(err.to_string().contains("produced no output"), "{}", err);
        }

        #[tokio::test]
        async fn test_slow_obfuscator_times_out() {
            let bin_dir = tempfile::tempdir().unwrap();
            let scratch = tempfile::tempdir().unwrap();
            let bin = fake_obfuscator(bin_dir.path(), "sleep 5");
            let transformer =
                JavaScriptObfuscatorCli::new(bin.display().to_string(), Duration::from_millis(200));

            let err = transformer
                .transform("var a=1;", &ObfuscatorOptions::default(), scratch.path())
                .await
                .unwrap_err();
            assert!(err.to_string().contains("timed out"), "{}", err);
        }
    }
}
