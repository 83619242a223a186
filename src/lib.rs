//! Session-oriented HTTP and WebSocket client engine
//!
//! This crate keeps a registry of long-lived client sessions, each bound to
//! a base URL and carrying its own headers, timeouts, retry policy and TLS
//! identity. On top of the sessions it provides plain requests, streamed
//! uploads and downloads with progress events, and WebSocket connections,
//! all designed to back a thin host-language binding.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(missing_docs)]

pub use body::Body;
pub use client::ApiClient;
pub use config::{
    ClientConfig, ClientP12Configuration, RequestAdapterConfiguration, SessionConfiguration,
    SessionSettings, WebSocketConfig,
};
pub use error::{Error, Result};
pub use events::{
    ClientEvent, ERROR_CODE_CLIENT_CERTIFICATE_MISSING, ERROR_CODE_SERVER_CERTIFICATE_INVALID,
    ERROR_CODE_SERVER_TRUST_EVALUATION_FAILED, EventBus, ReadyState,
};
pub use progress::{Direction, ProgressReader, ProgressTracker};
pub use registry::SessionRegistry;
pub use request::{DownloadOptions, MultipartConfig, RequestOptions, UploadOptions};
pub use response::{ClientResponse, ResponseMetrics};
pub use retry::{
    AttemptOutcome, RetryDecision, RetryPolicyConfiguration, RetryPolicyType, RetryState,
};
pub use session::Session;
pub use store::{MemoryStore, SecureStore, p12_alias, token_alias};
pub use task::TaskRegistry;
pub use timeout::{DEFAULT_TIMEOUT_MS, TimeoutPolicy};
pub use websocket::{WebSocketClient, WebSocketRegistry};

mod auth;
mod body;
mod client;
mod config;
mod error;
mod events;
mod progress;
mod registry;
mod request;
mod response;
mod retry;
mod session;
mod store;
mod task;
mod timeout;
mod tls;
mod websocket;
