//! Core types for secret resolution.

use std::collections::BTreeMap;
use std::fmt;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::errors::DeployError;

/// A secret value.
///
/// Stored as a `SecretString` so the value is zeroed on drop and never shows
/// up in `Debug` output.
pub struct SecretValue {
    inner: SecretString,
}

impl SecretValue {
    /// Creates a new secret value from a string.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            inner: SecretString::from(value.into()),
        }
    }

    /// Exposes the secret value for use.
    ///
    /// The returned reference must not be logged, stored, or placed on a
    /// command line.
    #[must_use]
    pub fn expose(&self) -> &str {
        self.inner.expose_secret()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.expose_secret().is_empty()
    }
}

impl fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

/// Opaque authorization context (role, profile) handed to the resolver and
/// the hook runner. The engine logs it but never interprets it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuthContext(Option<String>);

impl AuthContext {
    pub fn new(label: impl Into<String>) -> Self {
        Self(Some(label.into()))
    }

    pub fn anonymous() -> Self {
        Self(None)
    }

    pub fn label(&self) -> &str {
        self.0.as_deref().unwrap_or("default")
    }
}

/// Secrets resolved for a single hook execution, keyed by logical name.
#[derive(Default)]
pub struct ResolvedSecrets {
    values: BTreeMap<String, SecretValue>,
}

impl ResolvedSecrets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: SecretValue) {
        self.values.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&SecretValue> {
        self.values.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &SecretValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Assemble a registry credential from three resolved names.
    pub fn credential(
        &self,
        username_key: &str,
        password_key: &str,
        url_key: &str,
    ) -> Result<Credential, DeployError> {
        let lookup = |key: &str| {
            self.get(key).ok_or_else(|| DeployError::SecretUnavailable {
                name: key.to_string(),
                message: "not resolved".to_string(),
            })
        };
        Ok(Credential {
            username: lookup(username_key)?.expose().to_string(),
            password: SecretString::from(lookup(password_key)?.expose().to_string()),
            url: lookup(url_key)?.expose().to_string(),
        })
    }
}

impl fmt::Debug for ResolvedSecrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.values.keys()).finish()
    }
}

/// Username / password / URL triple for an artifact registry.
pub struct Credential {
    pub username: String,
    pub password: SecretString,
    pub url: String,
}

impl Credential {
    pub fn new(username: impl Into<String>, password: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: SecretString::from(password.into()),
            url: url.into(),
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("username", &"[REDACTED]")
            .field("password", &"[REDACTED]")
            .field("url", &self.url)
            .finish()
    }
}
