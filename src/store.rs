//! Secure storage seam for tokens and client certificate material
//!
//! The engine only decides *what* to persist and under which alias; the
//! mechanics of platform keystores live behind [`SecureStore`]. Aliases are
//! derived from a stable hash of the normalized base URL so a session's
//! material can be deleted wholesale on invalidation.

use std::collections::HashMap;
use std::sync::RwLock;

use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 of a normalized base URL
pub(crate) fn url_hash(normalized_url: &str) -> String {
    let digest = Sha256::digest(normalized_url.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Storage alias for a session's bearer token
pub fn token_alias(normalized_url: &str) -> String {
    format!("{}-TOKEN", url_hash(normalized_url))
}

/// Storage alias for a session's client certificate identity
pub fn p12_alias(normalized_url: &str) -> String {
    format!("{}-P12", url_hash(normalized_url))
}

/// Process-wide secure key-value storage.
///
/// Implementations must be safe for concurrent access; last-write-wins per
/// alias is acceptable. The crate ships [`MemoryStore`] for hosts without a
/// platform keystore and for tests.
pub trait SecureStore: Send + Sync {
    /// Retrieve a value by alias
    fn retrieve(&self, alias: &str) -> Option<String>;

    /// Store a value under an alias, replacing any previous value
    fn store(&self, alias: &str, value: &str);

    /// Delete the value stored under an alias, if any
    fn delete(&self, alias: &str);
}

/// In-memory [`SecureStore`] implementation
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

impl SecureStore for MemoryStore {
    fn retrieve(&self, alias: &str) -> Option<String> {
        self.values.read().unwrap().get(alias).cloned()
    }

    fn store(&self, alias: &str, value: &str) {
        self.values
            .write()
            .unwrap()
            .insert(alias.to_string(), value.to_string());
    }

    fn delete(&self, alias: &str) {
        self.values.write().unwrap().remove(alias);
    }
}
