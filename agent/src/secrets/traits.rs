//! Secret store interface.

use async_trait::async_trait;

use super::error::SecretsError;
use super::types::SecretValue;

/// External key-value secret store.
///
/// Paths are hierarchical (`/app/registry/username`). A missing path is
/// `Ok(None)`, not an error.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Retrieves the current value stored at `path`.
    async fn get(&self, path: &str) -> Result<Option<SecretValue>, SecretsError>;
}
