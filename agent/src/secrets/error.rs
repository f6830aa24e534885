//! Error types for secret stores.

use thiserror::Error;

/// Errors returned by a [`SecretStore`](super::SecretStore).
#[derive(Debug, Error)]
pub enum SecretsError {
    /// The store could not be reached; the lookup may succeed when retried.
    #[error("secret store unavailable: {0}")]
    Unavailable(String),

    /// The path is not a valid name for this store.
    #[error("invalid secret path: {0}")]
    InvalidPath(String),

    /// The store answered but its content could not be used.
    #[error("backend error: {0}")]
    Backend(String),
}

impl SecretsError {
    /// Whether the resolver should retry the lookup.
    pub fn is_transient(&self) -> bool {
        matches!(self, SecretsError::Unavailable(_))
    }
}
