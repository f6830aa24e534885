//! In-memory secret store for tests and embedding.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::error::SecretsError;
use super::traits::SecretStore;
use super::types::SecretValue;

/// In-memory secret store.
///
/// Values can be replaced at any time, which is how tests model rotation.
#[derive(Debug, Clone, Default)]
pub struct MemorySecretStore {
    data: Arc<RwLock<HashMap<String, String>>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, path: impl Into<String>, value: impl Into<String>) {
        self.data.write().await.insert(path.into(), value.into());
    }

    pub async fn remove(&self, path: &str) -> bool {
        self.data.write().await.remove(path).is_some()
    }
}

impl<K, V> FromIterator<(K, V)> for MemorySecretStore
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let data = iter
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect::<HashMap<_, _>>();
        Self {
            data: Arc::new(RwLock::new(data)),
        }
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get(&self, path: &str) -> Result<Option<SecretValue>, SecretsError> {
        let data = self.data.read().await;
        Ok(data.get(path).map(|v| SecretValue::new(v.clone())))
    }
}
