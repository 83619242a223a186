//! High-level API client surface
//!
//! One façade over the session registry, exposing the operations a host
//! binds: client lifecycle, plain requests per HTTP method, streamed uploads
//! and downloads with progress, and task cancellation.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Instant;

use futures_util::StreamExt;
use http::Method;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio_util::io::ReaderStream;

use crate::auth::BearerTokenAdapter;
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::progress::{Direction, ProgressReader, ProgressTracker};
use crate::registry::SessionRegistry;
use crate::request::{self, DownloadOptions, RequestOptions, UploadOptions};
use crate::response::{ClientResponse, ResponseMetrics, headers_to_map};
use crate::retry::{AttemptOutcome, RetryDecision, RetryState};
use crate::session::Session;
use crate::timeout::TimeoutPolicy;

/// API client façade over a session registry.
///
/// # Examples
///
/// ```no_run
/// use hawser::{ApiClient, ClientConfig, RequestOptions};
///
/// # async fn run() -> Result<(), hawser::Error> {
/// let client = ApiClient::new();
/// client.create_client_for("https://example.com/api", ClientConfig::default())?;
/// let response = client
///     .get("https://example.com/api", "/v1/ping", RequestOptions::default())
///     .await?;
/// assert!(response.ok);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ApiClient {
    registry: Arc<SessionRegistry>,
}

impl ApiClient {
    /// Create a client with a fresh registry and in-memory secure storage
    pub fn new() -> Self {
        Self {
            registry: Arc::new(SessionRegistry::new()),
        }
    }

    /// Create a client over an existing registry
    pub fn with_registry(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    /// The underlying session registry
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Create a session for a base URL
    pub fn create_client_for(&self, base_url: &str, config: ClientConfig) -> Result<()> {
        self.registry.create_session(base_url, config)?;
        Ok(())
    }

    /// Current header set of a session
    pub fn get_client_headers_for(&self, base_url: &str) -> Result<HashMap<String, String>> {
        Ok(self.registry.get_session(base_url)?.headers())
    }

    /// Merge headers into a session's header set
    pub fn add_client_headers_for(
        &self,
        base_url: &str,
        headers: &HashMap<String, String>,
    ) -> Result<()> {
        self.registry.add_headers(base_url, headers)?;
        Ok(())
    }

    /// Import a PKCS#12 client identity into a session
    pub fn import_client_p12_for(
        &self,
        base_url: &str,
        path: &str,
        password: Option<&str>,
    ) -> Result<()> {
        self.registry
            .get_session(base_url)?
            .import_client_p12(path, password)
    }

    /// Invalidate a session, cancelling its work and deleting its stored
    /// credentials
    pub fn invalidate_client_for(&self, base_url: &str) -> Result<()> {
        self.registry.invalidate_session(base_url)
    }

    /// Execute a request with an arbitrary method
    pub async fn request(
        &self,
        method: Method,
        base_url: &str,
        endpoint: &str,
        options: RequestOptions,
    ) -> Result<ClientResponse> {
        let session = self.registry.get_session(base_url)?;
        request::execute(&session, method, endpoint, options).await
    }

    /// Execute a HEAD request
    pub async fn head(
        &self,
        base_url: &str,
        endpoint: &str,
        options: RequestOptions,
    ) -> Result<ClientResponse> {
        self.request(Method::HEAD, base_url, endpoint, options).await
    }

    /// Execute a GET request
    pub async fn get(
        &self,
        base_url: &str,
        endpoint: &str,
        options: RequestOptions,
    ) -> Result<ClientResponse> {
        self.request(Method::GET, base_url, endpoint, options).await
    }

    /// Execute a PUT request
    pub async fn put(
        &self,
        base_url: &str,
        endpoint: &str,
        options: RequestOptions,
    ) -> Result<ClientResponse> {
        self.request(Method::PUT, base_url, endpoint, options).await
    }

    /// Execute a POST request
    pub async fn post(
        &self,
        base_url: &str,
        endpoint: &str,
        options: RequestOptions,
    ) -> Result<ClientResponse> {
        self.request(Method::POST, base_url, endpoint, options).await
    }

    /// Execute a PATCH request
    pub async fn patch(
        &self,
        base_url: &str,
        endpoint: &str,
        options: RequestOptions,
    ) -> Result<ClientResponse> {
        self.request(Method::PATCH, base_url, endpoint, options).await
    }

    /// Execute a DELETE request
    pub async fn delete(
        &self,
        base_url: &str,
        endpoint: &str,
        options: RequestOptions,
    ) -> Result<ClientResponse> {
        self.request(Method::DELETE, base_url, endpoint, options).await
    }

    /// Upload a file, streaming its bytes and emitting `UploadProgress`
    /// events under the given task id.
    ///
    /// `skip_bytes` in the options resumes a previous transfer: the file is
    /// advanced past the skipped prefix and progress counts from there.
    /// With a multipart configuration the file becomes a form part; without
    /// one it streams as the raw request body. The resolved retry policy
    /// applies to the whole transfer, with the source re-read and progress
    /// restarted for each attempt.
    pub async fn upload(
        &self,
        base_url: &str,
        endpoint: &str,
        file_path: &str,
        task_id: &str,
        options: UploadOptions,
    ) -> Result<ClientResponse> {
        let session = self.registry.get_session(base_url)?;
        let url = request::compose_url(session.base_url(), endpoint)?;
        let method = parse_method(options.method.as_deref(), Method::POST)?;
        let mut headers = request::merge_headers(session.headers(), options.headers.as_ref());
        attach_bearer(&session, &mut headers);
        let timeout = TimeoutPolicy::resolve(options.timeout_interval, session.timeout());

        let metadata = tokio::fs::metadata(file_path)
            .await
            .map_err(|_| Error::FileSizeUnreadable {
                path: PathBuf::from(file_path),
            })?;
        let file_size = metadata.len();
        let skip = options.skip_bytes.min(file_size);

        let retry =
            request::resolve_retry(options.retry_policy_configuration.clone(), &session, &method)?;
        let collect_metrics = session.settings().collect_metrics;

        let cancelled = Arc::new(AtomicBool::new(false));
        let worker_cancelled = cancelled.clone();
        let client = session.client();
        let worker_session = session.clone();
        let bus = session.event_bus().clone();
        let source = file_path.to_string();
        let multipart = options.multipart.clone();
        let id = task_id.to_string();
        let file_name = Path::new(file_path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());

        let handle = tokio::spawn(async move {
            let mut cancel = worker_session.cancel_signal();
            let mut state = RetryState::new(retry, method.clone());
            let started = Instant::now();

            let drive = async {
                loop {
                    let attempt = async {
                        let mut file = tokio::fs::File::open(&source).await?;
                        if skip > 0 {
                            file.seek(std::io::SeekFrom::Start(skip)).await?;
                        }
                        // Each attempt re-reads the source and restarts
                        // progress from the skipped prefix.
                        let tracker = ProgressTracker::new(
                            &id,
                            Direction::Upload,
                            Some(file_size),
                            skip,
                            bus.clone(),
                            worker_cancelled.clone(),
                        );
                        let stream = ReaderStream::new(ProgressReader::new(file, tracker));
                        let body = reqwest::Body::wrap_stream(stream);

                        let mut builder = client
                            .request(method.clone(), url.clone())
                            .timeout(timeout.total());
                        for (key, value) in &headers {
                            builder = builder.header(key, value);
                        }

                        let builder = match &multipart {
                            Some(config) => {
                                let part = reqwest::multipart::Part::stream_with_length(
                                    body,
                                    file_size - skip,
                                )
                                .file_name(file_name.clone());
                                let mut form = reqwest::multipart::Form::new();
                                if let Some(data) = &config.data {
                                    for (key, value) in data {
                                        form = form.text(key.clone(), value.clone());
                                    }
                                }
                                let file_key = config
                                    .file_key
                                    .clone()
                                    .unwrap_or_else(|| "files".to_string());
                                builder.multipart(form.part(file_key, part))
                            }
                            None => builder.body(body),
                        };

                        builder.send().await.map_err(Error::from_transport)
                    };

                    match attempt.await {
                        Ok(response) => {
                            capture_bearer(&worker_session, response.headers());
                            let code = response.status().as_u16();
                            request::observe_status(&worker_session, code);

                            let retries_exhausted =
                                match state.observe(AttemptOutcome::Response(code)) {
                                    RetryDecision::RetryAfter(delay) => {
                                        tracing::debug!(
                                            code,
                                            retry = state.retries(),
                                            ?delay,
                                            "scheduling upload retry"
                                        );
                                        tokio::time::sleep(delay).await;
                                        continue;
                                    }
                                    RetryDecision::Exhausted => Some(true),
                                    RetryDecision::Done => None,
                                };

                            let response_headers = headers_to_map(response.headers());
                            let last_url = response.url().to_string();
                            let version = response.version();
                            let bytes = response.bytes().await.map_err(Error::from_transport)?;
                            let mut out = ClientResponse::new(
                                code,
                                response_headers,
                                Some(&bytes),
                                last_url,
                                None,
                                retries_exhausted,
                            );
                            if collect_metrics {
                                out = out.with_metrics(ResponseMetrics::measure(
                                    started.elapsed(),
                                    file_size - skip,
                                    version,
                                ));
                            }
                            return Ok(out);
                        }
                        Err(error) => {
                            request::observe_failure(&worker_session, &error);
                            match state.observe(AttemptOutcome::Failure(&error)) {
                                RetryDecision::RetryAfter(delay) => {
                                    tracing::debug!(
                                        %error,
                                        retry = state.retries(),
                                        ?delay,
                                        "scheduling upload retry"
                                    );
                                    tokio::time::sleep(delay).await;
                                }
                                RetryDecision::Done | RetryDecision::Exhausted => {
                                    return Err(error);
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
        });

        self.registry.tasks().register(
            task_id,
            session.identity(),
            handle.abort_handle(),
            cancelled,
        );
        self.await_transfer(task_id, handle).await
    }

    /// Download to a file, streaming the response body and emitting
    /// `DownloadProgress` events under the given task id.
    ///
    /// The destination's parent directories are created if missing; the
    /// returned response carries the destination path instead of a body.
    /// The resolved retry policy applies to the whole transfer.
    pub async fn download(
        &self,
        base_url: &str,
        endpoint: &str,
        file_path: &str,
        task_id: &str,
        options: DownloadOptions,
    ) -> Result<ClientResponse> {
        let session = self.registry.get_session(base_url)?;
        let url = request::compose_url(session.base_url(), endpoint)?;
        let method = parse_method(options.method.as_deref(), Method::GET)?;
        let mut headers = request::merge_headers(session.headers(), options.headers.as_ref());
        attach_bearer(&session, &mut headers);
        let timeout = TimeoutPolicy::resolve(options.timeout_interval, session.timeout());

        let retry =
            request::resolve_retry(options.retry_policy_configuration.clone(), &session, &method)?;
        let collect_metrics = session.settings().collect_metrics;

        let cancelled = Arc::new(AtomicBool::new(false));
        let worker_cancelled = cancelled.clone();
        let client = session.client();
        let worker_session = session.clone();
        let bus = session.event_bus().clone();
        let destination = file_path.to_string();
        let id = task_id.to_string();

        let handle = tokio::spawn(async move {
            let mut cancel = worker_session.cancel_signal();
            let mut state = RetryState::new(retry, method.clone());
            let started = Instant::now();

            let drive = async {
                loop {
                    let mut builder = client
                        .request(method.clone(), url.clone())
                        .timeout(timeout.total());
                    for (key, value) in &headers {
                        builder = builder.header(key, value);
                    }

                    match builder.send().await.map_err(Error::from_transport) {
                        Ok(response) => {
                            capture_bearer(&worker_session, response.headers());
                            let code = response.status().as_u16();
                            request::observe_status(&worker_session, code);

                            // The body is only streamed to disk once the
                            // outcome is terminal; a retried attempt drops
                            // its response unread.
                            let retries_exhausted =
                                match state.observe(AttemptOutcome::Response(code)) {
                                    RetryDecision::RetryAfter(delay) => {
                                        tracing::debug!(
                                            code,
                                            retry = state.retries(),
                                            ?delay,
                                            "scheduling download retry"
                                        );
                                        tokio::time::sleep(delay).await;
                                        continue;
                                    }
                                    RetryDecision::Exhausted => Some(true),
                                    RetryDecision::Done => None,
                                };

                            let response_headers = headers_to_map(response.headers());
                            let last_url = response.url().to_string();
                            let version = response.version();
                            let mut tracker = ProgressTracker::new(
                                &id,
                                Direction::Download,
                                response.content_length(),
                                0,
                                bus.clone(),
                                worker_cancelled.clone(),
                            );

                            if let Some(parent) = Path::new(&destination).parent()
                                && !parent.as_os_str().is_empty()
                            {
                                tokio::fs::create_dir_all(parent).await?;
                            }
                            let mut file = tokio::fs::File::create(&destination).await?;
                            let mut stream = response.bytes_stream();
                            while let Some(chunk) = stream.next().await {
                                let chunk = chunk.map_err(Error::from_transport)?;
                                file.write_all(&chunk).await?;
                                tracker.record(chunk.len() as u64);
                            }
                            file.flush().await?;
                            tracker.finish();

                            let mut out = ClientResponse::new(
                                code,
                                response_headers,
                                None,
                                last_url,
                                None,
                                retries_exhausted,
                            )
                            .with_path(destination.clone());
                            if collect_metrics {
                                out = out.with_metrics(ResponseMetrics::measure(
                                    started.elapsed(),
                                    tracker.bytes_read(),
                                    version,
                                ));
                            }
                            return Ok(out);
                        }
                        Err(error) => {
                            request::observe_failure(&worker_session, &error);
                            match state.observe(AttemptOutcome::Failure(&error)) {
                                RetryDecision::RetryAfter(delay) => {
                                    tracing::debug!(
                                        %error,
                                        retry = state.retries(),
                                        ?delay,
                                        "scheduling download retry"
                                    );
                                    tokio::time::sleep(delay).await;
                                }
                                RetryDecision::Done | RetryDecision::Exhausted => {
                                    return Err(error);
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
        });

        self.registry.tasks().register(
            task_id,
            session.identity(),
            handle.abort_handle(),
            cancelled,
        );
        self.await_transfer(task_id, handle).await
    }

    /// Cancel an in-flight upload or download. Unknown ids are a no-op.
    pub fn cancel_request(&self, task_id: &str) {
        self.registry.tasks().cancel(task_id);
    }

    async fn await_transfer(
        &self,
        task_id: &str,
        handle: JoinHandle<Result<ClientResponse>>,
    ) -> Result<ClientResponse> {
        let result = match handle.await {
            Ok(result) => result,
            Err(join_error) if join_error.is_cancelled() => Err(Error::Cancelled),
            Err(join_error) => Err(Error::Internal(join_error.to_string())),
        };
        self.registry.tasks().complete(task_id);
        result
    }
}

impl Default for ApiClient {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_method(raw: Option<&str>, default: Method) -> Result<Method> {
    match raw {
        None => Ok(default),
        Some(raw) => Method::from_bytes(raw.to_ascii_uppercase().as_bytes()).map_err(|_| {
            Error::Config {
                message: format!("unsupported method: {raw}"),
            }
        }),
    }
}

fn attach_bearer(session: &Arc<Session>, headers: &mut HashMap<String, String>) {
    if let Some(header) = session.settings().bearer_auth_token_response_header.clone() {
        BearerTokenAdapter::new(header, session.identity(), session.secure_store().clone())
            .attach(headers);
    }
}

fn capture_bearer(session: &Arc<Session>, headers: &http::HeaderMap) {
    if let Some(header) = session.settings().bearer_auth_token_response_header.clone() {
        BearerTokenAdapter::new(header, session.identity(), session.secure_store().clone())
            .capture(headers);
    }
}
