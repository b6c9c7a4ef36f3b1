//! Configuration loading and schema definitions.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::emulator::EmulatorConfig;

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    /// Emulator bundle; absent when running against physical devices.
    #[serde(default)]
    pub emulator: Option<EmulatorConfig>,

    pub harness: Harness,
}

/// Identity of the instrumentation harness on the device.
#[derive(Debug, Clone, Deserialize)]
pub struct Harness {
    /// Package containing the instrumentation tests.
    pub test_package: String,
    /// Fully qualified instrumentation runner class.
    pub runner_class: String,
    /// Package of the application under test.
    pub app_package: String,
    /// Package of the on-device control service, when the control
    /// protocol is in use.
    #[serde(default)]
    pub service_package: Option<String>,
}

impl Harness {
    /// The `<package>/<runner>` component passed to the instrument
    /// command.
    pub fn instrumentation_component(&self) -> String {
        format!("{}/{}", self.test_package, self.runner_class)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorConfig {
    /// Maximum devices running suites at the same time. 0 means use the
    /// whole pool.
    #[serde(default)]
    pub max_concurrent: usize,

    /// Seconds before the whole test plan is abandoned.
    #[serde(default)]
    pub overall_timeout_secs: Option<u64>,

    /// Seconds a single test may run before its suite is errored.
    #[serde(default)]
    pub test_timeout_secs: Option<u64>,

    /// Directory for run artifacts (captured logs, marker files).
    #[serde(default = "default_artifact_dir")]
    pub artifact_dir: PathBuf,

    /// Extra arguments appended to the emulator launch command.
    #[serde(default)]
    pub emulator_args: String,
}

fn default_artifact_dir() -> PathBuf {
    PathBuf::from("artifacts")
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 0,
            overall_timeout_secs: None,
            test_timeout_secs: None,
            artifact_dir: default_artifact_dir(),
            emulator_args: String::new(),
        }
    }
}

impl OrchestratorConfig {
    pub fn overall_timeout(&self) -> Option<Duration> {
        self.overall_timeout_secs.map(Duration::from_secs)
    }

    pub fn test_timeout(&self) -> Option<Duration> {
        self.test_timeout_secs.map(Duration::from_secs)
    }

    /// Emulator launch arguments split shell-style.
    pub fn parsed_emulator_args(&self) -> Result<Vec<String>> {
        shell_words::split(&self.emulator_args)
            .with_context(|| format!("Invalid emulator arguments: {}", self.emulator_args))
    }
}

/// Load configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Load configuration from a string.
pub fn load_config_str(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Failed to parse config")?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_applies_defaults() {
        let config = load_config_str(
            r#"
            [harness]
            test_package = "com.example.test"
            runner_class = "androidx.test.runner.AndroidJUnitRunner"
            app_package = "com.example.app"
            "#,
        )
        .unwrap();
        assert_eq!(config.orchestrator.max_concurrent, 0);
        assert_eq!(config.orchestrator.artifact_dir, PathBuf::from("artifacts"));
        assert!(config.emulator.is_none());
        assert_eq!(
            config.harness.instrumentation_component(),
            "com.example.test/androidx.test.runner.AndroidJUnitRunner"
        );
    }

    #[test]
    fn full_config_parses() {
        let config = load_config_str(
            r#"
            [orchestrator]
            max_concurrent = 4
            overall_timeout_secs = 3600
            test_timeout_secs = 120
            artifact_dir = "/tmp/run1"
            emulator_args = "-no-window -gpu swiftshader_indirect"

            [emulator]
            sdk = "/opt/android-sdk"
            boot_timeout_secs = 240

            [harness]
            test_package = "com.example.test"
            runner_class = "Runner"
            app_package = "com.example.app"
            service_package = "com.example.butler"
            "#,
        )
        .unwrap();
        assert_eq!(config.orchestrator.overall_timeout(), Some(Duration::from_secs(3600)));
        assert_eq!(
            config.orchestrator.parsed_emulator_args().unwrap(),
            vec!["-no-window", "-gpu", "swiftshader_indirect"]
        );
        let emulator = config.emulator.unwrap();
        assert_eq!(emulator.boot_timeout(), Duration::from_secs(240));
        assert_eq!(config.harness.service_package.as_deref(), Some("com.example.butler"));
    }

    #[test]
    fn invalid_toml_is_rejected_with_context() {
        let err = load_config_str("not valid [toml").unwrap_err();
        assert!(err.to_string().contains("Failed to parse config"));
    }
}
