//! JSON file secret store.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::PathBuf;

use async_trait::async_trait;

use super::error::SecretsError;
use super::traits::SecretStore;
use super::types::SecretValue;

/// Store backed by a JSON object of `path -> value`.
///
/// The file is read on every lookup so rotated values are picked up without
/// a restart.
#[derive(Debug, Clone)]
pub struct FileSecretStore {
    path: PathBuf,
}

impl FileSecretStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SecretStore for FileSecretStore {
    fn name(&self) -> &str {
        "file"
    }

    async fn get(&self, path: &str) -> Result<Option<SecretValue>, SecretsError> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::PermissionDenied => {
                return Err(SecretsError::Backend(format!(
                    "{}: {}",
                    self.path.display(),
                    e
                )))
            }
            Err(e) => {
                return Err(SecretsError::Unavailable(format!(
                    "{}: {}",
                    self.path.display(),
                    e
                )))
            }
        };

        let mut entries: HashMap<String, String> = serde_json::from_str(&contents)
            .map_err(|e| SecretsError::Backend(format!("{}: {}", self.path.display(), e)))?;
        Ok(entries.remove(path).map(SecretValue::new))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reads_fresh_on_every_get() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("secrets.json");
        std::fs::write(&file, r#"{"/app/password": "v1"}"#).unwrap();

        let store = FileSecretStore::new(&file);
        assert_eq!(store.get("/app/password").await.unwrap().unwrap().expose(), "v1");

        std::fs::write(&file, r#"{"/app/password": "v2"}"#).unwrap();
        assert_eq!(store.get("/app/password").await.unwrap().unwrap().expose(), "v2");
        assert!(store.get("/app/other").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_file_is_transient() {
        let store = FileSecretStore::new("/nonexistent/fleetdeploy/secrets.json");
        let err = store.get("/app/password").await.unwrap_err();
        assert!(err.is_transient());
    }
}
