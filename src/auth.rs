//! Bearer token request adapter
//!
//! When a session is configured with a bearer-token response header, every
//! outgoing request gets the stored token attached, and every response is
//! inspected for a refreshed token to persist.

use std::collections::HashMap;
use std::sync::Arc;

use crate::store::{SecureStore, token_alias};

/// Adapter pairing token attachment with token capture for one session
pub(crate) struct BearerTokenAdapter {
    response_header: String,
    alias: String,
    store: Arc<dyn SecureStore>,
}

impl BearerTokenAdapter {
    pub(crate) fn new(
        response_header: String,
        session_identity: &str,
        store: Arc<dyn SecureStore>,
    ) -> Self {
        Self {
            response_header,
            alias: token_alias(session_identity),
            store,
        }
    }

    /// Attach the stored token as a bearer Authorization header.
    ///
    /// The adapter-managed header sits above per-request headers: a stored
    /// token replaces any caller-supplied Authorization value. Without a
    /// stored token the request is left untouched.
    pub(crate) fn attach(&self, headers: &mut HashMap<String, String>) {
        if let Some(token) = self.store.retrieve(&self.alias) {
            headers.retain(|k, _| !k.eq_ignore_ascii_case("authorization"));
            headers.insert("Authorization".to_string(), format!("Bearer {token}"));
        }
    }

    /// Capture a refreshed token from a response's headers
    pub(crate) fn capture(&self, headers: &http::HeaderMap) {
        if let Some(token) = headers
            .get(&self.response_header)
            .and_then(|v| v.to_str().ok())
        {
            self.store.store(&self.alias, token);
        }
    }
}
