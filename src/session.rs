//! Session objects binding a base URL to its networking defaults

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use arc_swap::ArcSwap;
use tokio::sync::watch;
use url::Url;

use crate::config::{ClientConfig, ClientP12Configuration, SessionSettings};
use crate::error::{Error, Result};
use crate::events::{self, ClientEvent, EventBus};
use crate::store::{self, SecureStore};
use crate::timeout::TimeoutPolicy;

/// Normalize a base URL: strip trailing slashes and require an absolute
/// http(s)/ws(s) URL. Returns the parsed URL and the normalized string that
/// serves as the session's identity.
pub(crate) fn normalize_base_url(raw: &str) -> Result<(Url, String)> {
    let trimmed = raw.trim_end_matches('/');
    let url = Url::parse(trimmed).map_err(|_| Error::MalformedUrl {
        url: raw.to_string(),
    })?;

    match url.scheme() {
        "http" | "https" | "ws" | "wss" => {}
        _ => {
            return Err(Error::MalformedUrl {
                url: raw.to_string(),
            });
        }
    }

    if url.host_str().is_none() {
        return Err(Error::MalformedUrl {
            url: raw.to_string(),
        });
    }

    Ok((url, trimmed.to_string()))
}

/// Build the reqwest transport for a session.
///
/// Redirects are never followed by the transport itself; the dispatcher
/// follows them manually so the redirect chain can be reported. Each session
/// owns its own cookie jar, which makes origin-scoped cookie clearing on
/// invalidation a matter of dropping the client.
pub(crate) fn build_transport(
    settings: &SessionSettings,
    identity: Option<reqwest::Identity>,
) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .cookie_store(true)
        .connect_timeout(settings.timeout.read);

    if let Some(max) = settings.max_connections_per_host {
        builder = builder.pool_max_idle_per_host(max);
    }

    if settings.trust_self_signed_server_certificate {
        builder = builder.danger_accept_invalid_certs(true);
    }

    if let Some(identity) = identity {
        // PKCS#12 identities require the native-tls backend.
        builder = builder.use_native_tls().identity(identity);
    }

    builder.build().map_err(|e| Error::Internal(e.to_string()))
}

/// A configured binding between a base URL and its networking defaults.
///
/// Sessions are created through the registry, mutated only by header merges
/// and certificate imports, and torn down by invalidation.
pub struct Session {
    base_url: Url,
    identity: String,
    headers: RwLock<HashMap<String, String>>,
    settings: SessionSettings,
    client: ArcSwap<reqwest::Client>,
    store: Arc<dyn SecureStore>,
    bus: EventBus,
    cancel_tx: watch::Sender<u64>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("base_url", &self.identity)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl Session {
    pub(crate) fn new(
        base_url: Url,
        identity: String,
        config: &ClientConfig,
        store: Arc<dyn SecureStore>,
        bus: EventBus,
    ) -> Result<Self> {
        let settings = config.resolve()?;

        let tls_identity = match &config.client_p12_configuration {
            Some(p12) => match crate::tls::load_identity(p12) {
                Ok(loaded) => {
                    store.store(&store::p12_alias(&identity), &p12.path);
                    Some(loaded)
                }
                Err(error) => {
                    tracing::warn!(%identity, %error, "client certificate import failed");
                    bus.emit(ClientEvent::ClientError {
                        server_url: identity.clone(),
                        error_code: events::ERROR_CODE_CLIENT_CERTIFICATE_MISSING,
                        error_description: error.to_string(),
                    });
                    None
                }
            },
            None => None,
        };

        let client = build_transport(&settings, tls_identity)?;
        let (cancel_tx, _) = watch::channel(0);

        Ok(Self {
            base_url,
            identity,
            headers: RwLock::new(settings.headers.clone()),
            settings,
            client: ArcSwap::from_pointee(client),
            store,
            bus,
            cancel_tx,
        })
    }

    /// The normalized base URL string identifying this session
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// The parsed base URL
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Resolved session settings
    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// Session default timeouts
    pub fn timeout(&self) -> TimeoutPolicy {
        self.settings.timeout
    }

    /// Current transport handle
    pub(crate) fn client(&self) -> Arc<reqwest::Client> {
        self.client.load_full()
    }

    pub(crate) fn event_bus(&self) -> &EventBus {
        &self.bus
    }

    pub(crate) fn secure_store(&self) -> &Arc<dyn SecureStore> {
        &self.store
    }

    /// Current session header set
    pub fn headers(&self) -> HashMap<String, String> {
        self.headers.read().unwrap().clone()
    }

    /// Merge additional headers into the session set, last write winning
    /// per key
    pub fn add_headers(&self, additional: &HashMap<String, String>) {
        let mut headers = self.headers.write().unwrap();
        for (key, value) in additional {
            headers.insert(key.clone(), value.clone());
        }
    }

    /// Import a PKCS#12 client identity and rebuild the TLS context.
    ///
    /// Subsequent requests present the identity; requests already in flight
    /// keep the transport they started with.
    pub fn import_client_p12(&self, path: &str, password: Option<&str>) -> Result<()> {
        let config = ClientP12Configuration {
            path: path.to_string(),
            password: password.map(str::to_string),
        };
        let identity = crate::tls::load_identity(&config)?;
        let client = build_transport(&self.settings, Some(identity))?;

        self.store.store(&store::p12_alias(&self.identity), path);
        self.client.store(Arc::new(client));
        tracing::debug!(identity = %self.identity, "rebuilt session transport with client identity");
        Ok(())
    }

    /// Subscribe to the session-wide cancellation signal
    pub(crate) fn cancel_signal(&self) -> watch::Receiver<u64> {
        self.cancel_tx.subscribe()
    }

    /// Cancel every request currently in flight on this session.
    ///
    /// Used on invalidation, on server trust failures, and on a 401 when
    /// `cancel_requests_on_unauthorized` is set.
    pub(crate) fn cancel_in_flight(&self) {
        self.cancel_tx.send_modify(|epoch| *epoch += 1);
    }

    /// Tear down session state: cancel in-flight requests and delete stored
    /// token and certificate material.
    pub(crate) fn invalidate(&self) {
        tracing::debug!(identity = %self.identity, "invalidating session");
        self.cancel_in_flight();
        self.store.delete(&store::token_alias(&self.identity));
        self.store.delete(&store::p12_alias(&self.identity));
    }
}
