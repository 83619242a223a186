//! Response types returned across the host boundary

use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;

/// Transfer measurements collected for a call when the session opts in
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMetrics {
    /// Wall-clock duration of the call in milliseconds, retries included
    pub latency: u64,
    /// Payload bytes moved (response body, or transfer size for
    /// uploads/downloads)
    pub size: u64,
    /// Negotiated HTTP version of the final response
    pub http_version: String,
    /// Effective payload throughput in megabits per second
    pub speed_in_mbps: f64,
}

impl ResponseMetrics {
    pub(crate) fn measure(elapsed: Duration, size: u64, version: http::Version) -> Self {
        let secs = elapsed.as_secs_f64();
        let speed = if secs > 0.0 {
            (size as f64 * 8.0) / (secs * 1_000_000.0)
        } else {
            0.0
        };
        Self {
            latency: elapsed.as_millis() as u64,
            size,
            http_version: format!("{version:?}"),
            speed_in_mbps: (speed * 100.0).round() / 100.0,
        }
    }
}

/// Response shape handed back to the host for every API client call
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientResponse {
    /// Response headers
    pub headers: HashMap<String, String>,
    /// Response body; JSON when parseable, otherwise the raw text as a
    /// JSON string
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// HTTP status code
    pub code: u16,
    /// Whether the status code is in the 2xx range
    pub ok: bool,
    /// URL of the final request after any redirects
    pub last_requested_url: String,
    /// Chain of URLs visited when redirects were followed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirect_urls: Option<Vec<String>>,
    /// Set when the retry budget was consumed without resolution
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retries_exhausted: Option<bool>,
    /// Destination path of a completed download
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Measurements for the call, present when the session collects metrics
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<ResponseMetrics>,
}

impl ClientResponse {
    pub(crate) fn new(
        code: u16,
        headers: HashMap<String, String>,
        body: Option<&[u8]>,
        last_requested_url: String,
        redirect_urls: Option<Vec<String>>,
        retries_exhausted: Option<bool>,
    ) -> Self {
        let data = body.filter(|b| !b.is_empty()).map(|bytes| {
            match serde_json::from_slice::<serde_json::Value>(bytes) {
                Ok(value) => value,
                Err(_) => serde_json::Value::String(String::from_utf8_lossy(bytes).into_owned()),
            }
        });

        Self {
            headers,
            data,
            code,
            ok: (200..300).contains(&code),
            last_requested_url,
            redirect_urls,
            retries_exhausted,
            path: None,
            metrics: None,
        }
    }

    pub(crate) fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub(crate) fn with_metrics(mut self, metrics: ResponseMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

/// Flatten a header map into the string pairs the host expects.
///
/// Repeated header names keep the last value, matching the merge semantics
/// of the header layer above.
pub(crate) fn headers_to_map(headers: &http::HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                value.to_str().unwrap_or_default().to_string(),
            )
        })
        .collect()
}
