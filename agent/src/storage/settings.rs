//! Settings file management

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::deploy::runner::{HookTransport, DEFAULT_OUTPUT_LIMIT};
use crate::errors::DeployError;
use crate::filesys::file::File;
use crate::logs::LogLevel;
use crate::secrets::{EnvSecretStore, FileSecretStore, RetryPolicy, SecretStore};
use crate::utils::CooldownOptions;

/// Engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Emit JSON logs on stderr
    #[serde(default)]
    pub log_json: bool,

    /// Directory for rolling log files; none disables file logging
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// JSON lines history file; defaults to the storage layout's
    #[serde(default)]
    pub history_file: Option<PathBuf>,

    /// Captured hook output kept per invocation
    #[serde(default = "default_output_limit")]
    pub output_limit_bytes: usize,

    /// Where secrets are read from
    #[serde(default)]
    pub secret_store: SecretStoreSettings,

    /// Retries for an unreachable secret store
    #[serde(default)]
    pub secret_retry: SecretRetrySettings,

    /// How hook processes reach the hosts
    #[serde(default)]
    pub transport: HookTransport,

    /// Artifact registry client
    #[serde(default)]
    pub registry: RegistrySettings,

    /// Time budget for the running-workload probe
    #[serde(default = "default_probe_timeout")]
    pub workload_probe_timeout_secs: u64,

    /// Opaque authorization label handed to the secret store and hooks
    #[serde(default)]
    pub auth_context: Option<String>,
}

fn default_output_limit() -> usize {
    DEFAULT_OUTPUT_LIMIT
}

fn default_probe_timeout() -> u64 {
    30
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            log_json: false,
            log_dir: None,
            history_file: None,
            output_limit_bytes: default_output_limit(),
            secret_store: SecretStoreSettings::default(),
            secret_retry: SecretRetrySettings::default(),
            transport: HookTransport::default(),
            registry: RegistrySettings::default(),
            workload_probe_timeout_secs: default_probe_timeout(),
            auth_context: None,
        }
    }
}

impl Settings {
    /// Read settings from a JSON file
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, DeployError> {
        let file = File::new(path.as_ref());
        if !file.exists().await {
            return Err(DeployError::NotFound(format!(
                "settings file {}",
                path.as_ref().display()
            )));
        }
        let settings: Settings = file.read_json().await?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), DeployError> {
        if self.output_limit_bytes == 0 {
            return Err(DeployError::ConfigError(
                "output_limit_bytes must be greater than 0".to_string(),
            ));
        }
        if self.workload_probe_timeout_secs == 0 {
            return Err(DeployError::ConfigError(
                "workload_probe_timeout_secs must be greater than 0".to_string(),
            ));
        }
        if self.secret_retry.attempts == 0 {
            return Err(DeployError::ConfigError(
                "secret_retry.attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Secret store backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SecretStoreSettings {
    /// Process environment, path mapped to an upper-snake variable name
    Env {
        #[serde(default)]
        prefix: Option<String>,
    },

    /// JSON object file of path -> value
    File { path: PathBuf },
}

impl Default for SecretStoreSettings {
    fn default() -> Self {
        SecretStoreSettings::Env { prefix: None }
    }
}

impl SecretStoreSettings {
    pub fn build(&self) -> Arc<dyn SecretStore> {
        match self {
            SecretStoreSettings::Env { prefix: Some(prefix) } => {
                Arc::new(EnvSecretStore::with_prefix(prefix.clone()))
            }
            SecretStoreSettings::Env { prefix: None } => Arc::new(EnvSecretStore::new()),
            SecretStoreSettings::File { path } => Arc::new(FileSecretStore::new(path.clone())),
        }
    }
}

/// Secret store retry settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretRetrySettings {
    /// Attempts per secret, including the first
    #[serde(default = "default_attempts")]
    pub attempts: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    200
}

fn default_max_delay_ms() -> u64 {
    5000
}

impl Default for SecretRetrySettings {
    fn default() -> Self {
        Self {
            attempts: default_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl SecretRetrySettings {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.attempts,
            backoff: CooldownOptions {
                base_delay: Duration::from_millis(self.base_delay_ms),
                max_delay: Duration::from_millis(self.max_delay_ms),
                ..Default::default()
            },
        }
    }
}

/// Artifact registry settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrySettings {
    /// Pull the artifact on each host before `ApplicationStart`
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_pull_timeout")]
    pub pull_timeout_secs: u64,
}

fn default_pull_timeout() -> u64 {
    600
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            pull_timeout_secs: default_pull_timeout(),
        }
    }
}
