//! Request dispatch
//!
//! Builds outgoing requests (URL composition, header merge, body encoding),
//! resolves the retry and timeout policy that applies to each call, and
//! drives the bounded retry loop. Per-request policy lives in the call's own
//! execution context and is dropped when the call resolves; nothing is keyed
//! by request identity in a side table.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use http::Method;
use http::header::{CONTENT_TYPE, LOCATION};
use serde::Deserialize;
use url::Url;

use crate::auth::BearerTokenAdapter;
use crate::body::Body;
use crate::error::{Error, Result};
use crate::events::{self, ClientEvent};
use crate::response::{ClientResponse, ResponseMetrics, headers_to_map};
use crate::retry::{AttemptOutcome, RetryDecision, RetryPolicyConfiguration, RetryState};
use crate::session::Session;
use crate::timeout::TimeoutPolicy;

const MAX_REDIRECTS: usize = 10;

/// Per-request options for an API client call
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RequestOptions {
    /// Headers for this request, overriding session headers per key
    pub headers: Option<HashMap<String, String>>,
    /// Loosely-typed body value; encoding dispatches on its JSON type
    pub body: Option<serde_json::Value>,
    /// Single timeout overriding both read and write for this call only
    pub timeout_interval: Option<u64>,
    /// Retry policy overriding the session policy for this call only
    pub retry_policy_configuration: Option<RetryPolicyConfiguration>,
}

/// Multipart assembly options for uploads
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MultipartConfig {
    /// Form field name for the file part
    pub file_key: Option<String>,
    /// Additional form fields
    pub data: Option<HashMap<String, String>>,
}

/// Options for upload calls
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UploadOptions {
    /// Headers for this request, overriding session headers per key
    pub headers: Option<HashMap<String, String>>,
    /// HTTP method; defaults to POST
    pub method: Option<String>,
    /// Single timeout overriding both read and write for this call only
    pub timeout_interval: Option<u64>,
    /// Retry policy overriding the session policy for this call only
    pub retry_policy_configuration: Option<RetryPolicyConfiguration>,
    /// Byte offset to resume from; the source is advanced past this prefix
    pub skip_bytes: u64,
    /// Multipart form assembly; absent means a raw streamed body
    pub multipart: Option<MultipartConfig>,
}

/// Options for download calls
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DownloadOptions {
    /// Headers for this request, overriding session headers per key
    pub headers: Option<HashMap<String, String>>,
    /// HTTP method; defaults to GET
    pub method: Option<String>,
    /// Single timeout overriding both read and write for this call only
    pub timeout_interval: Option<u64>,
    /// Retry policy overriding the session policy for this call only
    pub retry_policy_configuration: Option<RetryPolicyConfiguration>,
}

/// Join a session base URL with an endpoint.
///
/// Exactly one layer of slashes is trimmed from each side of the endpoint
/// and the base path is preserved, so `https://host/api` + `/v1/ping/`
/// composes to `https://host/api/v1/ping`.
pub(crate) fn compose_url(base: &Url, endpoint: &str) -> Result<Url> {
    let base_str = base.as_str().trim_end_matches('/');
    let endpoint = endpoint.strip_prefix('/').unwrap_or(endpoint);
    let endpoint = endpoint.strip_suffix('/').unwrap_or(endpoint);

    let composed = if endpoint.is_empty() {
        base_str.to_string()
    } else {
        format!("{base_str}/{endpoint}")
    };

    Url::parse(&composed).map_err(|_| Error::MalformedUrl { url: composed })
}

/// Merge headers by precedence: session headers lowest, per-request headers
/// overriding per key.
pub(crate) fn merge_headers(
    session_headers: HashMap<String, String>,
    request_headers: Option<&HashMap<String, String>>,
) -> HashMap<String, String> {
    let mut merged = session_headers;
    if let Some(headers) = request_headers {
        for (key, value) in headers {
            merged.insert(key.clone(), value.clone());
        }
    }
    merged
}

/// Resolve the retry configuration for one call.
///
/// A per-request configuration fully overrides the session policy and is
/// narrowed to exactly this request's method; otherwise the session policy
/// applies with its idempotent-method default set.
pub(crate) fn resolve_retry(
    request_config: Option<RetryPolicyConfiguration>,
    session: &Session,
    method: &Method,
) -> Result<RetryPolicyConfiguration> {
    match request_config {
        Some(config) => {
            config.validate()?;
            Ok(config.for_method(method))
        }
        None => Ok(session
            .settings()
            .retry_policy
            .clone()
            .unwrap_or_default()),
    }
}

/// One completed HTTP exchange, after any redirect following
struct Exchange {
    status: u16,
    headers: http::HeaderMap,
    body: bytes::Bytes,
    last_url: String,
    redirect_urls: Option<Vec<String>>,
    version: http::Version,
}

/// Session-level reaction to a response status: a 401 on a session that
/// cancels on unauthorized tears down its other in-flight requests.
pub(crate) fn observe_status(session: &Session, status: u16) {
    if status == 401 && session.settings().cancel_requests_on_unauthorized {
        tracing::warn!(
            identity = session.identity(),
            "unauthorized response, cancelling session requests"
        );
        session.cancel_in_flight();
    }
}

/// Session-level reaction to an attempt failure: trust evaluation failures
/// are reported out-of-band and cancel the session's other requests.
pub(crate) fn observe_failure(session: &Session, error: &Error) {
    if let Error::ServerTrustEvaluation { .. } = error {
        session.event_bus().emit(ClientEvent::ClientError {
            server_url: session.identity().to_string(),
            error_code: events::ERROR_CODE_SERVER_TRUST_EVALUATION_FAILED,
            error_description: error.to_string(),
        });
        session.cancel_in_flight();
    }
}

async fn send_attempt(
    client: &reqwest::Client,
    method: &Method,
    url: &Url,
    headers: &HashMap<String, String>,
    body: Option<&Body>,
    timeout: TimeoutPolicy,
    follow_redirects: bool,
) -> Result<Exchange> {
    let mut current_url = url.clone();
    let mut current_method = method.clone();
    let mut send_body = body.is_some();
    let mut chain: Vec<String> = Vec::new();

    loop {
        let mut request = client
            .request(current_method.clone(), current_url.clone())
            .timeout(timeout.total());

        for (key, value) in headers {
            request = request.header(key, value);
        }

        if send_body && let Some(body) = body {
            if let Some(content_type) = body.content_type() {
                request = request.header(CONTENT_TYPE, content_type);
            }
            request = request.body(body.to_bytes()?.to_vec());
        }

        let response = request.send().await.map_err(Error::from_transport)?;
        let status = response.status();

        if follow_redirects && status.is_redirection() && chain.len() < MAX_REDIRECTS {
            let location = response
                .headers()
                .get(LOCATION)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            if let Some(location) = location {
                let next = current_url
                    .join(&location)
                    .map_err(|_| Error::MalformedUrl { url: location })?;
                tracing::debug!(from = %current_url, to = %next, code = status.as_u16(), "following redirect");
                chain.push(current_url.to_string());

                // 303 always becomes a bodyless GET; 301/302 downgrade POST
                // the way mainstream clients do.
                if status == http::StatusCode::SEE_OTHER
                    || ((status == http::StatusCode::MOVED_PERMANENTLY
                        || status == http::StatusCode::FOUND)
                        && current_method == Method::POST)
                {
                    current_method = Method::GET;
                    send_body = false;
                }

                current_url = next;
                continue;
            }
        }

        let last_url = response.url().to_string();
        let redirect_urls = if chain.is_empty() {
            None
        } else {
            chain.push(last_url.clone());
            Some(chain)
        };
        let response_headers = response.headers().clone();
        let version = response.version();
        let body = response.bytes().await.map_err(Error::from_transport)?;

        return Ok(Exchange {
            status: status.as_u16(),
            headers: response_headers,
            body,
            last_url,
            redirect_urls,
            version,
        });
    }
}

/// Execute a request on a session, honoring the resolved retry and timeout
/// policy and the session-wide cancellation signal.
pub(crate) async fn execute(
    session: &Arc<Session>,
    method: Method,
    endpoint: &str,
    options: RequestOptions,
) -> Result<ClientResponse> {
    let url = compose_url(session.base_url(), endpoint)?;
    let mut headers = merge_headers(session.headers(), options.headers.as_ref());

    let body = match &options.body {
        Some(value) => Some(Body::from_options_value(value)),
        // POST conventionally carries a body; an absent one is sent empty,
        // not omitted.
        None if method == Method::POST => Some(Body::Empty),
        None => None,
    };

    let timeout = TimeoutPolicy::resolve(options.timeout_interval, session.timeout());
    let retry_config = resolve_retry(options.retry_policy_configuration, session, &method)?;
    let mut state = RetryState::new(retry_config, method.clone());

    let adapter = session.settings().bearer_auth_token_response_header.clone().map(
        |response_header| {
            BearerTokenAdapter::new(
                response_header,
                session.identity(),
                session.secure_store().clone(),
            )
        },
    );
    if let Some(adapter) = &adapter {
        adapter.attach(&mut headers);
    }

    let client = session.client();
    let settings = session.settings();
    let mut cancel = session.cancel_signal();
    let started = Instant::now();

    let drive = async {
        loop {
            let attempt = send_attempt(
                &client,
                &method,
                &url,
                &headers,
                body.as_ref(),
                timeout,
                settings.follow_redirects,
            )
            .await;

            match attempt {
                Ok(exchange) => {
                    if let Some(adapter) = &adapter {
                        adapter.capture(&exchange.headers);
                    }

                    observe_status(session, exchange.status);

                    match state.observe(AttemptOutcome::Response(exchange.status)) {
                        RetryDecision::Done => {
                            let metrics = collect(settings, started, &exchange);
                            return Ok(build_response(exchange, None, metrics));
                        }
                        RetryDecision::RetryAfter(delay) => {
                            tracing::debug!(
                                status = exchange.status,
                                retry = state.retries(),
                                ?delay,
                                "scheduling retry"
                            );
                            tokio::time::sleep(delay).await;
                        }
                        RetryDecision::Exhausted => {
                            tracing::debug!(
                                status = exchange.status,
                                retries = state.retries(),
                                "retry budget exhausted"
                            );
                            let metrics = collect(settings, started, &exchange);
                            return Ok(build_response(exchange, Some(true), metrics));
                        }
                    }
                }
                Err(error) => {
                    observe_failure(session, &error);
                    match state.observe(AttemptOutcome::Failure(&error)) {
                        RetryDecision::Done | RetryDecision::Exhausted => return Err(error),
                        RetryDecision::RetryAfter(delay) => {
                            tracing::debug!(%error, retry = state.retries(), ?delay, "scheduling retry");
                            tokio::time::sleep(delay).await;
                        }
                    }
                }
            }
        }
    };
    tokio::pin!(drive);

    tokio::select! {
        biased;
        result = &mut drive => result,
        _ = cancel.changed() => Err(Error::Cancelled),
    }
}

fn collect(
    settings: &crate::config::SessionSettings,
    started: Instant,
    exchange: &Exchange,
) -> Option<ResponseMetrics> {
    settings.collect_metrics.then(|| {
        ResponseMetrics::measure(started.elapsed(), exchange.body.len() as u64, exchange.version)
    })
}

fn build_response(
    exchange: Exchange,
    retries_exhausted: Option<bool>,
    metrics: Option<ResponseMetrics>,
) -> ClientResponse {
    let response = ClientResponse::new(
        exchange.status,
        headers_to_map(&exchange.headers),
        Some(&exchange.body),
        exchange.last_url,
        exchange.redirect_urls,
        retries_exhausted,
    );
    match metrics {
        Some(metrics) => response.with_metrics(metrics),
        None => response,
    }
}
