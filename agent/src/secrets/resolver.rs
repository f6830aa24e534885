//! Secret resolver.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, warn};

use super::error::SecretsError;
use super::traits::SecretStore;
use super::types::{AuthContext, ResolvedSecrets, SecretValue};
use crate::errors::DeployError;
use crate::utils::{calc_exp_backoff, CooldownOptions};

/// Retry policy for transient store failures
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts per secret, including the first one
    pub attempts: u32,
    pub backoff: CooldownOptions,
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            attempts: 1,
            backoff: CooldownOptions::default(),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: CooldownOptions::default(),
        }
    }
}

/// Resolves logical credential names through a name -> path mapping.
///
/// Every call hits the store; nothing is cached between calls.
pub struct SecretResolver {
    store: Arc<dyn SecretStore>,
    retry: RetryPolicy,
}

impl SecretResolver {
    pub fn new(store: Arc<dyn SecretStore>) -> Self {
        Self {
            store,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Resolve every name in `mapping`
    pub async fn resolve_all(
        &self,
        mapping: &BTreeMap<String, String>,
        auth: &AuthContext,
    ) -> Result<ResolvedSecrets, DeployError> {
        self.resolve(mapping, mapping.keys().map(String::as_str), auth)
            .await
    }

    /// Resolve the given logical names. Fails with `SecretUnavailable` if any
    /// name is unmapped, missing from the store, or the store stays
    /// unreachable after retries.
    pub async fn resolve<'a>(
        &self,
        mapping: &BTreeMap<String, String>,
        names: impl IntoIterator<Item = &'a str>,
        auth: &AuthContext,
    ) -> Result<ResolvedSecrets, DeployError> {
        let mut resolved = ResolvedSecrets::new();
        for name in names {
            let path = mapping.get(name).ok_or_else(|| DeployError::SecretUnavailable {
                name: name.to_string(),
                message: "no secret store path mapped".to_string(),
            })?;

            let value = self
                .fetch(path, auth)
                .await
                .map_err(|e| DeployError::SecretUnavailable {
                    name: name.to_string(),
                    message: e.to_string(),
                })?
                .ok_or_else(|| DeployError::SecretUnavailable {
                    name: name.to_string(),
                    message: format!("{} not found in {} store", path, self.store.name()),
                })?;

            resolved.insert(name, value);
        }
        debug!(
            count = resolved.len(),
            store = self.store.name(),
            auth = auth.label(),
            "Resolved secrets"
        );
        Ok(resolved)
    }

    async fn fetch(
        &self,
        path: &str,
        auth: &AuthContext,
    ) -> Result<Option<SecretValue>, SecretsError> {
        let attempts = self.retry.attempts.max(1);
        let mut attempt = 0;
        loop {
            match self.store.get(path).await {
                Err(e) if e.is_transient() && attempt + 1 < attempts => {
                    let delay = calc_exp_backoff(&self.retry.backoff, attempt);
                    warn!(
                        path,
                        attempt = attempt + 1,
                        auth = auth.label(),
                        "Secret store unavailable, retrying in {:?}: {}",
                        delay,
                        e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}
