//! Secret resolution for lifecycle hooks
//!
//! Hooks receive credentials as environment entries resolved from an external
//! key-value store right before they run. Nothing here caches or persists a
//! resolved value, and no value is ever written to a log.
//!
//! # Stores
//!
//! - [`MemorySecretStore`]: in-memory store for tests and embedding
//! - [`EnvSecretStore`]: maps hierarchical paths onto environment variables
//! - [`FileSecretStore`]: JSON document re-read on every lookup

mod env;
mod error;
mod file;
mod memory;
mod resolver;
mod traits;
mod types;

pub use env::EnvSecretStore;
pub use error::SecretsError;
pub use file::FileSecretStore;
pub use memory::MemorySecretStore;
pub use resolver::{RetryPolicy, SecretResolver};
pub use traits::SecretStore;
pub use types::{AuthContext, Credential, ResolvedSecrets, SecretValue};
