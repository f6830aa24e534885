//! Error types for the deployment engine

use thiserror::Error;

/// Main error type for the deployment engine
#[derive(Error, Debug)]
pub enum DeployError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Secret unavailable: {name}: {message}")]
    SecretUnavailable { name: String, message: String },

    #[error("Hook could not be started: {0}")]
    HookUnstartable(String),

    #[error("Ambiguous target state: {0} running workloads match the selector")]
    AmbiguousTargetState(usize),

    #[error("Workload probe failed: {0}")]
    WorkloadProbe(String),

    #[error("Registry authentication failed: {0}")]
    RegistryAuthError(String),

    #[error("Registry unreachable: {0}")]
    RegistryUnreachable(String),

    #[error("Artifact not found: {0}")]
    ArtifactNotFound(String),

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Descriptor error: {0}")]
    DescriptorError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<anyhow::Error> for DeployError {
    fn from(err: anyhow::Error) -> Self {
        DeployError::Internal(err.to_string())
    }
}
