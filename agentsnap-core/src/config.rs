//! Configuration for snapshot runs

use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Result, SnapshotError};
use crate::normalize::NormalizerConfig;
use crate::verify::VerificationConfig;

/// Default configuration file looked up in the working directory
pub const CONFIG_FILE: &str = "agentsnap.toml";

/// Environment variable naming an extra configuration file
pub const CONFIG_PATH_ENV: &str = "AGENTSNAP_CONFIG_PATH";

/// Prefix of environment overrides
pub const ENV_PREFIX: &str = "AGENTSNAP_";

/// Instance-level configuration of an [`AgentSnapshot`](crate::AgentSnapshot)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    /// Root directory holding one sub-directory per case
    pub snapshot_dir: PathBuf,

    /// Case recorded by `generate` and consumed by `replay`
    pub case_name: String,

    /// Normalization rules applied before storing and comparing
    pub normalizer: NormalizerConfig,

    /// Which artifacts replay verifies
    pub verification: VerificationConfig,

    /// Rewrite the case from the live run instead of failing on divergence
    pub update_snapshots: bool,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            snapshot_dir: PathBuf::from("tests/snapshots"),
            case_name: "default".to_string(),
            normalizer: NormalizerConfig::default(),
            verification: VerificationConfig::default(),
            update_snapshots: false,
        }
    }
}

impl SnapshotConfig {
    pub fn new(snapshot_dir: impl Into<PathBuf>, case_name: impl Into<String>) -> Self {
        Self {
            snapshot_dir: snapshot_dir.into(),
            case_name: case_name.into(),
            ..Default::default()
        }
    }

    /// Load configuration from files and environment variables.
    ///
    /// Loads in this order:
    /// 1. Default configuration
    /// 2. `agentsnap.toml` in the working directory
    /// 3. The file named by `AGENTSNAP_CONFIG_PATH`
    /// 4. `AGENTSNAP_`-prefixed environment variables; nested keys use a
    ///    double underscore (`AGENTSNAP_VERIFICATION__VERIFY_TOOL_CALLS`)
    ///
    /// # Errors
    ///
    /// Returns an error if a configuration file is invalid or the result
    /// fails validation.
    pub fn load() -> Result<Self> {
        let mut figment = Figment::new().merge(Toml::file(CONFIG_FILE));

        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            figment = figment.merge(Toml::file(path));
        }

        figment = figment.merge(
            Env::prefixed(ENV_PREFIX)
                .ignore(&["CONFIG_PATH"])
                .split("__"),
        );

        Self::from_figment(figment)
    }

    /// Load configuration from a specific TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let figment = Figment::new().merge(Toml::file(path.as_ref()));
        Self::from_figment(figment).map_err(|e| match e {
            SnapshotError::Configuration(msg) => SnapshotError::Configuration(format!(
                "{} ({})",
                msg,
                path.as_ref().display()
            )),
            other => other,
        })
    }

    /// Extract and validate configuration from an assembled figment
    pub fn from_figment(figment: Figment) -> Result<Self> {
        let config: SnapshotConfig = figment.extract().map_err(|e| {
            SnapshotError::Configuration(format!("Failed to load configuration: {}", e))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that cannot address a case on disk
    pub fn validate(&self) -> Result<()> {
        validate_case_name(&self.case_name)?;

        if self.snapshot_dir.as_os_str().is_empty() {
            return Err(SnapshotError::Configuration(
                "snapshot_dir must not be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// Directory of the configured case
    pub fn case_dir(&self) -> PathBuf {
        self.snapshot_dir.join(&self.case_name)
    }

    pub fn with_snapshot_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.snapshot_dir = dir.into();
        self
    }

    pub fn with_case_name(mut self, name: impl Into<String>) -> Self {
        self.case_name = name.into();
        self
    }

    pub fn with_normalizer(mut self, normalizer: NormalizerConfig) -> Self {
        self.normalizer = normalizer;
        self
    }

    pub fn with_verification(mut self, verification: VerificationConfig) -> Self {
        self.verification = verification;
        self
    }

    pub fn with_update_snapshots(mut self, update: bool) -> Self {
        self.update_snapshots = update;
        self
    }
}

/// Case names become a single directory name
pub fn validate_case_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(SnapshotError::Configuration(
            "case_name must not be empty".to_string(),
        ));
    }
    if name.contains('/') || name.contains('\\') || name == "." || name == ".." {
        return Err(SnapshotError::Configuration(format!(
            "case_name '{}' must be a single path segment",
            name
        )));
    }
    Ok(())
}
