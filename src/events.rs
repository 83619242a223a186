//! Out-of-band events emitted to the host application
//!
//! Progress, client-error and WebSocket lifecycle notifications are not tied
//! to a specific call's return value; hosts subscribe to the [`EventBus`]
//! owned by the registry and forward events over their own bridge.

use serde::Serialize;
use tokio::sync::broadcast;

/// Error code reported when a client certificate could not be imported
pub const ERROR_CODE_CLIENT_CERTIFICATE_MISSING: i32 = -200;
/// Error code reported when server trust evaluation fails
pub const ERROR_CODE_SERVER_TRUST_EVALUATION_FAILED: i32 = -298;
/// Error code reported for an invalid or untrusted server certificate
pub const ERROR_CODE_SERVER_CERTIFICATE_INVALID: i32 = -299;

/// WebSocket connection ready state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    /// Handshake in progress
    Connecting = 0,
    /// Connection established
    Open = 1,
    /// Close initiated
    Closing = 2,
    /// Connection closed
    Closed = 3,
}

// Ready states cross the boundary as their numeric values.
impl Serialize for ReadyState {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(*self as u8)
    }
}

/// Event emitted asynchronously during client operation
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum ClientEvent {
    /// Bytes were written for an upload task
    #[serde(rename_all = "camelCase")]
    UploadProgress {
        /// Caller-supplied task identifier
        task_id: String,
        /// Completed fraction in `[0, 1]`, rounded to two decimal places
        fraction_completed: f64,
        /// Bytes transferred so far, including any skipped prefix
        bytes_read: u64,
    },

    /// Bytes were received for a download task
    #[serde(rename_all = "camelCase")]
    DownloadProgress {
        /// Caller-supplied task identifier
        task_id: String,
        /// Completed fraction in `[0, 1]`, rounded to two decimal places
        fraction_completed: f64,
        /// Bytes transferred so far
        bytes_read: u64,
    },

    /// A non-fatal client-level failure (certificate import, trust evaluation)
    #[serde(rename_all = "camelCase")]
    ClientError {
        /// Base URL of the affected client
        server_url: String,
        /// Stable error code (see the `ERROR_CODE_*` constants)
        error_code: i32,
        /// Human-readable description
        error_description: String,
    },

    /// A WebSocket connection was established
    #[serde(rename_all = "camelCase")]
    WebSocketOpen {
        /// WebSocket URL
        url: String,
    },

    /// A WebSocket connection was closed
    #[serde(rename_all = "camelCase")]
    WebSocketClose {
        /// WebSocket URL
        url: String,
        /// Close code, when the peer supplied one
        code: Option<u16>,
        /// Close reason, when the peer supplied one
        reason: Option<String>,
    },

    /// A WebSocket error occurred
    #[serde(rename_all = "camelCase")]
    WebSocketError {
        /// WebSocket URL
        url: String,
        /// Error description
        message: String,
    },

    /// A WebSocket message was received
    #[serde(rename_all = "camelCase")]
    WebSocketMessage {
        /// WebSocket URL
        url: String,
        /// Message payload; text frames arrive as JSON when parseable
        message: serde_json::Value,
    },

    /// The WebSocket ready state changed
    #[serde(rename_all = "camelCase")]
    WebSocketReadyState {
        /// WebSocket URL
        url: String,
        /// New ready state
        state: ReadyState,
    },
}

/// Broadcast channel carrying [`ClientEvent`]s to any number of subscribers.
///
/// Events are fire-and-forget: emitting with no live subscriber is not an
/// error, and a slow subscriber only lags its own receiver.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ClientEvent>,
}

impl EventBus {
    pub(crate) fn new() -> Self {
        let (sender, _) = broadcast::channel(256);
        Self { sender }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.sender.subscribe()
    }

    pub(crate) fn emit(&self, event: ClientEvent) {
        // Send only fails when there are no receivers, which is fine.
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
