//! Environment variable secret store.

use async_trait::async_trait;

use super::error::SecretsError;
use super::traits::SecretStore;
use super::types::SecretValue;

/// Read-only store mapping hierarchical paths onto environment variables.
///
/// `/app/registry/username` is looked up as `APP_REGISTRY_USERNAME`, or as
/// `<PREFIX>_APP_REGISTRY_USERNAME` when a prefix is configured.
#[derive(Debug, Clone, Default)]
pub struct EnvSecretStore {
    prefix: Option<String>,
}

impl EnvSecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        Self {
            prefix: (!prefix.is_empty()).then_some(prefix),
        }
    }

    /// Environment variable name for a secret path.
    pub fn variable_name(&self, path: &str) -> Result<String, SecretsError> {
        let trimmed = path.trim_matches('/');
        if trimmed.is_empty() {
            return Err(SecretsError::InvalidPath(path.to_string()));
        }

        let mut name = String::with_capacity(trimmed.len());
        for c in trimmed.chars() {
            match c {
                '/' | '-' | '.' => name.push('_'),
                c if c.is_ascii_alphanumeric() || c == '_' => name.push(c.to_ascii_uppercase()),
                _ => return Err(SecretsError::InvalidPath(path.to_string())),
            }
        }

        Ok(match &self.prefix {
            Some(prefix) => format!("{}_{}", prefix.to_ascii_uppercase(), name),
            None => name,
        })
    }
}

#[async_trait]
impl SecretStore for EnvSecretStore {
    fn name(&self) -> &str {
        "env"
    }

    async fn get(&self, path: &str) -> Result<Option<SecretValue>, SecretsError> {
        let var = self.variable_name(path)?;
        match std::env::var(&var) {
            Ok(value) => Ok(Some(SecretValue::new(value))),
            Err(std::env::VarError::NotPresent) => Ok(None),
            Err(std::env::VarError::NotUnicode(_)) => Err(SecretsError::Backend(format!(
                "{} is not valid unicode",
                var
            ))),
        }
    }
}
