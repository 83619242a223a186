//! Session registry
//!
//! The single source of truth for session existence. Owned explicitly by the
//! host application and passed by reference into every entry point; there is
//! no implicit global. Create, header-merge and invalidate operations are
//! serialized against concurrent readers by the interior lock, so two racing
//! creations for the same URL can never both succeed.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::events::EventBus;
use crate::session::{Session, normalize_base_url};
use crate::store::{MemoryStore, SecureStore};
use crate::task::TaskRegistry;

/// Registry of active sessions keyed by normalized base URL
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    store: Arc<dyn SecureStore>,
    bus: EventBus,
    tasks: Arc<TaskRegistry>,
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("sessions", &self.sessions.read().unwrap().len())
            .finish_non_exhaustive()
    }
}

impl SessionRegistry {
    /// Create a registry with in-memory secure storage
    pub fn new() -> Self {
        Self::with_store(Arc::new(MemoryStore::new()))
    }

    /// Create a registry backed by host-provided secure storage
    pub fn with_store(store: Arc<dyn SecureStore>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            store,
            bus: EventBus::new(),
            tasks: Arc::new(TaskRegistry::new()),
        }
    }

    /// The event bus carrying progress, client-error and WebSocket events
    pub fn events(&self) -> &EventBus {
        &self.bus
    }

    /// The in-flight transfer registry
    pub fn tasks(&self) -> &Arc<TaskRegistry> {
        &self.tasks
    }

    pub(crate) fn secure_store(&self) -> &Arc<dyn SecureStore> {
        &self.store
    }

    /// Create a session for a base URL.
    ///
    /// Fails with [`Error::MalformedUrl`] for invalid input and
    /// [`Error::AlreadyExists`] when a session for the normalized URL is
    /// already registered.
    pub fn create_session(&self, base_url: &str, config: ClientConfig) -> Result<Arc<Session>> {
        let (url, identity) = normalize_base_url(base_url)?;

        let mut sessions = self.sessions.write().unwrap();
        if sessions.contains_key(&identity) {
            return Err(Error::AlreadyExists { url: identity });
        }

        let session = Arc::new(Session::new(
            url,
            identity.clone(),
            &config,
            self.store.clone(),
            self.bus.clone(),
        )?);
        tracing::debug!(%identity, "created session");
        sessions.insert(identity, session.clone());
        Ok(session)
    }

    /// Look up the session for a base URL
    pub fn get_session(&self, base_url: &str) -> Result<Arc<Session>> {
        let (_, identity) = normalize_base_url(base_url)?;
        self.sessions
            .read()
            .unwrap()
            .get(&identity)
            .cloned()
            .ok_or(Error::SessionNotFound { url: identity })
    }

    /// Merge headers into an existing session's header set
    pub fn add_headers(
        &self,
        base_url: &str,
        headers: &HashMap<String, String>,
    ) -> Result<Arc<Session>> {
        let session = self.get_session(base_url)?;
        session.add_headers(headers);
        Ok(session)
    }

    /// Invalidate the session for a base URL.
    ///
    /// Cancels its in-flight requests and transfer tasks, drops its transport
    /// (and with it the session-scoped cookie jar and connection cache) and
    /// deletes stored token/certificate material. Idempotent: invalidating an
    /// absent session is not an error.
    pub fn invalidate_session(&self, base_url: &str) -> Result<()> {
        let (_, identity) = normalize_base_url(base_url)?;

        let removed = self.sessions.write().unwrap().remove(&identity);
        if let Some(session) = removed {
            self.tasks.cancel_all_for(&identity);
            session.invalidate();
        }
        Ok(())
    }

    /// Find the session owning an arbitrary request URL.
    ///
    /// Query string and fragment are stripped, then the URL is walked back
    /// one path segment at a time and each prefix checked against the
    /// registry, terminating at the bare host. This lets transport-level
    /// hooks reattach client headers to requests that only carry their full
    /// URL.
    pub fn resolve_session_for_request(&self, request_url: &str) -> Option<Arc<Session>> {
        let mut url = url::Url::parse(request_url).ok()?;
        url.set_query(None);
        url.set_fragment(None);
        let normalized = url.as_str().trim_end_matches('/').to_string();

        let sessions = self.sessions.read().unwrap();
        let mut parts: Vec<&str> = normalized.split('/').collect();

        // ["https:", "", "host", ...] — stop once only the host remains
        while parts.len() >= 3 {
            let candidate = parts.join("/");
            if let Some(session) = sessions.get(candidate.as_str()) {
                return Some(session.clone());
            }
            parts.pop();
        }
        None
    }

    /// Invalidate every session, leaving the registry empty
    pub fn shutdown(&self) {
        let sessions = std::mem::take(&mut *self.sessions.write().unwrap());
        for (identity, session) in sessions {
            self.tasks.cancel_all_for(&identity);
            session.invalidate();
        }
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_creation_is_rejected() {
        let registry = SessionRegistry::new();
        registry
            .create_session("https://example.com", ClientConfig::default())
            .unwrap();

        // Trailing slashes normalize to the same identity
        let result = registry.create_session("https://example.com/", ClientConfig::default());
        assert!(matches!(result, Err(Error::AlreadyExists { .. })));
    }

    #[test]
    fn malformed_url_is_a_distinct_error() {
        let registry = SessionRegistry::new();
        assert!(matches!(
            registry.create_session("not a url", ClientConfig::default()),
            Err(Error::MalformedUrl { .. })
        ));
    }

    #[test]
    fn missing_session_lookup_fails() {
        let registry = SessionRegistry::new();
        assert!(matches!(
            registry.get_session("https://absent.example"),
            Err(Error::SessionNotFound { .. })
        ));
    }

    #[test]
    fn add_headers_merges_with_overwrite() {
        let registry = SessionRegistry::new();
        registry
            .create_session("https://example.com", ClientConfig::default())
            .unwrap();

        let mut headers = HashMap::new();
        headers.insert("X".to_string(), "1".to_string());
        registry.add_headers("https://example.com", &headers).unwrap();

        // Empty merge leaves the set unchanged
        registry
            .add_headers("https://example.com", &HashMap::new())
            .unwrap();
        let session = registry.get_session("https://example.com").unwrap();
        assert_eq!(session.headers().get("X").unwrap(), "1");

        headers.insert("X".to_string(), "2".to_string());
        registry.add_headers("https://example.com", &headers).unwrap();
        let current = session.headers();
        assert_eq!(current.get("X").unwrap(), "2");
        assert_eq!(current.len(), 1);
    }

    #[test]
    fn invalidation_is_idempotent() {
        let registry = SessionRegistry::new();
        registry
            .create_session("https://example.com", ClientConfig::default())
            .unwrap();
        registry.invalidate_session("https://example.com").unwrap();
        registry.invalidate_session("https://example.com").unwrap();
        assert!(registry.get_session("https://example.com").is_err());
    }

    #[test]
    fn resolves_owning_session_by_prefix() {
        let registry = SessionRegistry::new();
        registry
            .create_session("https://example.com/api", ClientConfig::default())
            .unwrap();

        let session = registry
            .resolve_session_for_request("https://example.com/api/v1/users/42")
            .unwrap();
        assert_eq!(session.identity(), "https://example.com/api");

        assert!(
            registry
                .resolve_session_for_request("https://other.example/api/v1")
                .is_none()
        );
    }

    #[test]
    fn resolution_ignores_query_and_fragment() {
        let registry = SessionRegistry::new();
        registry
            .create_session("https://example.com/api", ClientConfig::default())
            .unwrap();

        let session = registry
            .resolve_session_for_request("https://example.com/api/v1?x=1&y=2#frag")
            .unwrap();
        assert_eq!(session.identity(), "https://example.com/api");

        let session = registry
            .resolve_session_for_request("https://example.com/api?page=2")
            .unwrap();
        assert_eq!(session.identity(), "https://example.com/api");
    }

    #[test]
    fn shutdown_clears_everything() {
        let registry = SessionRegistry::new();
        registry
            .create_session("https://one.example", ClientConfig::default())
            .unwrap();
        registry
            .create_session("https://two.example", ClientConfig::default())
            .unwrap();
        registry.shutdown();
        assert!(registry.get_session("https://one.example").is_err());
        assert!(registry.get_session("https://two.example").is_err());
    }
}
