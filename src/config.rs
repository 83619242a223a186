//! Typed client configuration
//!
//! Hosts hand over loosely-typed configuration bags (JSON values). They are
//! deserialized into one discriminated configuration type per client kind,
//! with explicit optional fields and documented defaults, and validated once
//! at session creation.

use std::collections::HashMap;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::retry::RetryPolicyConfiguration;
use crate::timeout::{DEFAULT_TIMEOUT_MS, TimeoutPolicy};

fn default_true() -> bool {
    true
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

/// Session-level transport configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionConfiguration {
    /// Whether requests may use cellular interfaces (advisory to the host)
    pub allows_cellular_access: bool,
    /// Whether the transport should wait for connectivity instead of failing
    pub waits_for_connectivity: bool,
    /// Read/connect timeout in milliseconds
    pub timeout_interval_for_request: u64,
    /// Write/resource timeout in milliseconds
    pub timeout_interval_for_resource: u64,
    /// Connection-pool bound per host; `None` uses the transport default
    pub http_maximum_connections_per_host: Option<usize>,
    /// Cancel all other in-flight requests on this session when a 401 arrives
    pub cancel_requests_on_unauthorized: bool,
    /// Accept self-signed server certificates
    pub trust_self_signed_server_certificate: bool,
    /// Follow HTTP redirects, recording the redirect chain
    pub follow_redirects: bool,
    /// Collect per-call measurements and attach them to responses
    pub collect_metrics: bool,
}

impl Default for SessionConfiguration {
    fn default() -> Self {
        Self {
            allows_cellular_access: true,
            waits_for_connectivity: false,
            timeout_interval_for_request: default_timeout_ms(),
            timeout_interval_for_resource: default_timeout_ms(),
            http_maximum_connections_per_host: None,
            cancel_requests_on_unauthorized: false,
            trust_self_signed_server_certificate: false,
            follow_redirects: default_true(),
            collect_metrics: false,
        }
    }
}

/// Bearer-token request adapter configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestAdapterConfiguration {
    /// Response header to capture a refreshed bearer token from
    pub bearer_auth_token_response_header: Option<String>,
}

/// Reference to a PKCS#12 client identity on disk
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientP12Configuration {
    /// Path of the `.p12` file
    pub path: String,
    /// Password protecting the identity, if any
    #[serde(default)]
    pub password: Option<String>,
}

/// Configuration bag for an API client
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientConfig {
    /// Headers applied to every request on the session
    pub headers: Option<HashMap<String, String>>,
    /// Transport-level session settings
    pub session_configuration: SessionConfiguration,
    /// Session-level retry policy
    pub retry_policy_configuration: Option<RetryPolicyConfiguration>,
    /// Bearer-token adapter settings
    pub request_adapter_configuration: Option<RequestAdapterConfiguration>,
    /// Client TLS identity to present during handshakes
    pub client_p12_configuration: Option<ClientP12Configuration>,
}

/// Configuration bag for a WebSocket client
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WebSocketConfig {
    /// Headers sent with the connection handshake
    pub headers: Option<HashMap<String, String>>,
    /// Handshake timeout in milliseconds
    pub timeout_interval: Option<u64>,
    /// Enable per-message compression
    pub enable_compression: bool,
    /// Accept self-signed server certificates
    pub trust_self_signed_server_certificate: bool,
    /// Client TLS identity to present during handshakes
    pub client_p12_configuration: Option<ClientP12Configuration>,
}

/// Materialized session settings, resolved once at creation
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Initial header set
    pub headers: HashMap<String, String>,
    /// Session default timeouts
    pub timeout: TimeoutPolicy,
    /// Session-level retry policy, if one was configured with a `type`
    pub retry_policy: Option<RetryPolicyConfiguration>,
    /// Follow redirects and record the chain
    pub follow_redirects: bool,
    /// Connection bound per host
    pub max_connections_per_host: Option<usize>,
    /// Accept self-signed server certificates
    pub trust_self_signed_server_certificate: bool,
    /// Cancel session's other in-flight requests on a 401
    pub cancel_requests_on_unauthorized: bool,
    /// Whether requests may use cellular interfaces (advisory)
    pub allows_cellular_access: bool,
    /// Wait for connectivity instead of failing fast (advisory)
    pub waits_for_connectivity: bool,
    /// Response header a bearer token is refreshed from
    pub bearer_auth_token_response_header: Option<String>,
    /// Attach per-call measurements to responses
    pub collect_metrics: bool,
}

impl ClientConfig {
    /// Deserialize a configuration bag, failing on structurally invalid input
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        serde_json::from_value(value).map_err(|e| Error::Config {
            message: e.to_string(),
        })
    }

    /// Resolve this configuration into materialized session settings.
    ///
    /// Pure except for validation; certificate import happens later so its
    /// failure can be reported as a non-fatal event rather than failing
    /// session creation.
    pub fn resolve(&self) -> Result<SessionSettings> {
        if let Some(retry) = &self.retry_policy_configuration {
            retry.validate()?;
        }

        let session = &self.session_configuration;
        let retry_policy = self
            .retry_policy_configuration
            .clone()
            .filter(|c| c.policy_type.is_some());

        Ok(SessionSettings {
            headers: self.headers.clone().unwrap_or_default(),
            timeout: TimeoutPolicy::from_millis(
                session.timeout_interval_for_request,
                session.timeout_interval_for_resource,
            ),
            retry_policy,
            follow_redirects: session.follow_redirects,
            max_connections_per_host: session.http_maximum_connections_per_host,
            trust_self_signed_server_certificate: session.trust_self_signed_server_certificate,
            cancel_requests_on_unauthorized: session.cancel_requests_on_unauthorized,
            allows_cellular_access: session.allows_cellular_access,
            waits_for_connectivity: session.waits_for_connectivity,
            bearer_auth_token_response_header: self
                .request_adapter_configuration
                .as_ref()
                .and_then(|a| a.bearer_auth_token_response_header.clone()),
            collect_metrics: session.collect_metrics,
        })
    }
}

impl WebSocketConfig {
    /// Deserialize a configuration bag, failing on structurally invalid input
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        serde_json::from_value(value).map_err(|e| Error::Config {
            message: e.to_string(),
        })
    }
}
