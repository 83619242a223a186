//! WebSocket clients
//!
//! WebSocket clients live in their own registry keyed by normalized ws(s)
//! URL, independent of API sessions. Lifecycle and inbound messages are
//! reported through the shared event bus; `send` is the only call with a
//! direct return value.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures_util::stream::{SplitSink, StreamExt};
use futures_util::SinkExt;
use tokio::net::TcpStream;
use tokio::task::AbortHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{
    Connector, MaybeTlsStream, WebSocketStream, connect_async_tls_with_config,
};
use url::Url;

use crate::config::WebSocketConfig;
use crate::error::{Error, Result};
use crate::events::{
    self, ClientEvent, EventBus, ReadyState,
};
use crate::session::normalize_base_url;
use crate::timeout::DEFAULT_TIMEOUT_MS;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

struct Connection {
    sink: WsSink,
    reader: AbortHandle,
}

/// One configured WebSocket client, created once and connected on demand
pub struct WebSocketClient {
    url: Url,
    identity: String,
    config: WebSocketConfig,
    bus: EventBus,
    connection: tokio::sync::Mutex<Option<Connection>>,
}

impl std::fmt::Debug for WebSocketClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketClient")
            .field("url", &self.identity)
            .finish_non_exhaustive()
    }
}

impl WebSocketClient {
    fn new(url: Url, identity: String, config: WebSocketConfig, bus: EventBus) -> Self {
        Self {
            url,
            identity,
            config,
            bus,
            connection: tokio::sync::Mutex::new(None),
        }
    }

    /// The normalized URL identifying this client
    pub fn identity(&self) -> &str {
        &self.identity
    }

    fn emit_ready_state(&self, state: ReadyState) {
        self.bus.emit(ClientEvent::WebSocketReadyState {
            url: self.identity.clone(),
            state,
        });
    }

    fn build_connector(&self) -> Result<Option<Connector>> {
        let mut builder = native_tls::TlsConnector::builder();
        let mut customized = false;

        if self.config.trust_self_signed_server_certificate {
            builder.danger_accept_invalid_certs(true);
            customized = true;
        }

        if let Some(p12) = &self.config.client_p12_configuration {
            builder.identity(crate::tls::load_native_identity(p12)?);
            customized = true;
        }

        if !customized {
            return Ok(None);
        }
        let connector = builder
            .build()
            .map_err(|e| Error::Internal(e.to_string()))?;
        Ok(Some(Connector::NativeTls(connector)))
    }

    /// Open the connection and start the read loop.
    ///
    /// Connecting an already-open client is a no-op. The handshake is bounded
    /// by the configured timeout interval.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        let mut guard = self.connection.lock().await;
        if guard.is_some() {
            return Ok(());
        }

        self.emit_ready_state(ReadyState::Connecting);

        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|_| Error::MalformedUrl {
                url: self.identity.clone(),
            })?;
        if let Some(headers) = &self.config.headers {
            let request_headers = request.headers_mut();
            for (key, value) in headers {
                let name = http::HeaderName::from_bytes(key.as_bytes());
                let value = http::HeaderValue::from_str(value);
                if let (Ok(name), Ok(value)) = (name, value) {
                    request_headers.insert(name, value);
                } else {
                    tracing::warn!(header = key, "skipping invalid handshake header");
                }
            }
        }

        let connector = self.build_connector()?;
        let timeout = Duration::from_millis(
            self.config.timeout_interval.unwrap_or(DEFAULT_TIMEOUT_MS),
        );

        let connect = connect_async_tls_with_config(request, None, false, connector);
        let (stream, _) = match tokio::time::timeout(timeout, connect).await {
            Err(_) => {
                self.emit_ready_state(ReadyState::Closed);
                return Err(Error::Timeout);
            }
            Ok(Err(error)) => {
                self.report_connect_failure(&error);
                self.emit_ready_state(ReadyState::Closed);
                return Err(match error {
                    tokio_tungstenite::tungstenite::Error::Tls(_) => {
                        Error::ServerTrustEvaluation {
                            url: self.identity.clone(),
                        }
                    }
                    other => Error::Transport {
                        message: other.to_string(),
                    },
                });
            }
            Ok(Ok(established)) => established,
        };

        let (sink, mut source) = stream.split();
        self.bus.emit(ClientEvent::WebSocketOpen {
            url: self.identity.clone(),
        });
        self.emit_ready_state(ReadyState::Open);

        let client = self.clone();
        let reader = tokio::spawn(async move {
            while let Some(message) = source.next().await {
                match message {
                    Ok(Message::Text(text)) => {
                        let payload = serde_json::from_str(&text)
                            .unwrap_or_else(|_| serde_json::Value::String(text.to_string()));
                        client.bus.emit(ClientEvent::WebSocketMessage {
                            url: client.identity.clone(),
                            message: payload,
                        });
                    }
                    Ok(Message::Binary(bytes)) => {
                        client.bus.emit(ClientEvent::WebSocketMessage {
                            url: client.identity.clone(),
                            message: serde_json::Value::String(
                                String::from_utf8_lossy(&bytes).into_owned(),
                            ),
                        });
                    }
                    Ok(Message::Close(frame)) => {
                        let (code, reason) = match frame {
                            Some(frame) => (
                                Some(u16::from(frame.code)),
                                Some(frame.reason.to_string()),
                            ),
                            None => (None, None),
                        };
                        client.emit_ready_state(ReadyState::Closing);
                        client.bus.emit(ClientEvent::WebSocketClose {
                            url: client.identity.clone(),
                            code,
                            reason,
                        });
                        break;
                    }
                    Ok(_) => {}
                    Err(error) => {
                        client.bus.emit(ClientEvent::WebSocketError {
                            url: client.identity.clone(),
                            message: error.to_string(),
                        });
                        break;
                    }
                }
            }
            client.emit_ready_state(ReadyState::Closed);
            *client.connection.lock().await = None;
        });

        *guard = Some(Connection {
            sink,
            reader: reader.abort_handle(),
        });
        Ok(())
    }

    /// Close the connection. Disconnecting an already-closed client is a
    /// no-op.
    pub async fn disconnect(&self) -> Result<()> {
        let mut guard = self.connection.lock().await;
        if let Some(mut connection) = guard.take() {
            self.emit_ready_state(ReadyState::Closing);
            let _ = connection.sink.send(Message::Close(None)).await;
            let _ = connection.sink.close().await;
            connection.reader.abort();
            self.bus.emit(ClientEvent::WebSocketClose {
                url: self.identity.clone(),
                code: Some(1000),
                reason: None,
            });
            self.emit_ready_state(ReadyState::Closed);
        }
        Ok(())
    }

    /// Send a message. Strings are sent verbatim; other JSON values are
    /// serialized to their compact text form.
    pub async fn send(&self, message: serde_json::Value) -> Result<()> {
        let mut guard = self.connection.lock().await;
        let connection = guard.as_mut().ok_or(Error::WebSocketClosed)?;

        let text = match message {
            serde_json::Value::String(text) => text,
            other => other.to_string(),
        };
        connection
            .sink
            .send(Message::text(text))
            .await
            .map_err(|e| Error::Transport {
                message: e.to_string(),
            })
    }

    fn report_connect_failure(&self, error: &tokio_tungstenite::tungstenite::Error) {
        if matches!(error, tokio_tungstenite::tungstenite::Error::Tls(_)) {
            self.bus.emit(ClientEvent::ClientError {
                server_url: self.identity.clone(),
                error_code: events::ERROR_CODE_SERVER_TRUST_EVALUATION_FAILED,
                error_description: error.to_string(),
            });
        }
        self.bus.emit(ClientEvent::WebSocketError {
            url: self.identity.clone(),
            message: error.to_string(),
        });
    }
}

/// Registry of WebSocket clients keyed by normalized URL
pub struct WebSocketRegistry {
    clients: RwLock<HashMap<String, Arc<WebSocketClient>>>,
    bus: EventBus,
}

impl std::fmt::Debug for WebSocketRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketRegistry")
            .field("clients", &self.clients.read().unwrap().len())
            .finish_non_exhaustive()
    }
}

impl WebSocketRegistry {
    /// Create an empty registry with its own event bus
    pub fn new() -> Self {
        Self::with_bus(EventBus::default())
    }

    /// Create a registry sharing an existing event bus
    pub fn with_bus(bus: EventBus) -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            bus,
        }
    }

    /// The event bus carrying WebSocket events
    pub fn events(&self) -> &EventBus {
        &self.bus
    }

    fn normalize(raw: &str) -> Result<(Url, String)> {
        let (url, identity) = normalize_base_url(raw)?;
        match url.scheme() {
            "ws" | "wss" => Ok((url, identity)),
            _ => Err(Error::MalformedUrl {
                url: raw.to_string(),
            }),
        }
    }

    /// Create a client for a ws(s) URL.
    ///
    /// Fails with [`Error::MalformedUrl`] for non-WebSocket URLs and
    /// [`Error::AlreadyExists`] when a client for the normalized URL is
    /// already registered.
    pub fn create_client(
        &self,
        url: &str,
        config: WebSocketConfig,
    ) -> Result<Arc<WebSocketClient>> {
        let (url, identity) = Self::normalize(url)?;

        let mut clients = self.clients.write().unwrap();
        if clients.contains_key(&identity) {
            return Err(Error::AlreadyExists { url: identity });
        }

        let client = Arc::new(WebSocketClient::new(
            url,
            identity.clone(),
            config,
            self.bus.clone(),
        ));
        tracing::debug!(%identity, "created websocket client");
        clients.insert(identity, client.clone());
        Ok(client)
    }

    /// Look up the client for a URL
    pub fn get_client(&self, url: &str) -> Result<Arc<WebSocketClient>> {
        let (_, identity) = Self::normalize(url)?;
        self.clients
            .read()
            .unwrap()
            .get(&identity)
            .cloned()
            .ok_or(Error::SessionNotFound { url: identity })
    }

    /// Connect the client for a URL
    pub async fn connect_for(&self, url: &str) -> Result<()> {
        self.get_client(url)?.connect().await
    }

    /// Disconnect the client for a URL
    pub async fn disconnect_for(&self, url: &str) -> Result<()> {
        self.get_client(url)?.disconnect().await
    }

    /// Send a message on the client for a URL
    pub async fn send_data_for(&self, url: &str, message: serde_json::Value) -> Result<()> {
        self.get_client(url)?.send(message).await
    }

    /// Disconnect and remove the client for a URL. Idempotent: invalidating
    /// an absent client is not an error.
    pub async fn invalidate_client_for(&self, url: &str) -> Result<()> {
        let (_, identity) = Self::normalize(url)?;
        let removed = self.clients.write().unwrap().remove(&identity);
        if let Some(client) = removed {
            client.disconnect().await?;
        }
        Ok(())
    }
}

impl Default for WebSocketRegistry {
    fn default() -> Self {
        Self::new()
    }
}
