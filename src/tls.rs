//! Client TLS identity handling

use crate::config::ClientP12Configuration;
use crate::error::{Error, Result};

/// Load a PKCS#12 client identity from disk.
///
/// The identity is presented during TLS handshakes once the session's
/// transport has been rebuilt with it. Import failures are reported to the
/// host as a non-fatal `ClientError` event by the caller; they never fail
/// session creation.
pub(crate) fn load_identity(config: &ClientP12Configuration) -> Result<reqwest::Identity> {
    let der = std::fs::read(&config.path).map_err(|e| Error::ClientCertificateImport {
        message: format!("unable to read {}: {e}", config.path),
    })?;

    reqwest::Identity::from_pkcs12_der(&der, config.password.as_deref().unwrap_or_default())
        .map_err(|e| Error::ClientCertificateImport {
            message: e.to_string(),
        })
}

/// Load a PKCS#12 client identity for the WebSocket connector, which
/// handshakes through native-tls directly.
pub(crate) fn load_native_identity(
    config: &ClientP12Configuration,
) -> Result<native_tls::Identity> {
    let der = std::fs::read(&config.path).map_err(|e| Error::ClientCertificateImport {
        message: format!("unable to read {}: {e}", config.path),
    })?;

    native_tls::Identity::from_pkcs12(&der, config.password.as_deref().unwrap_or_default())
        .map_err(|e| Error::ClientCertificateImport {
            message: e.to_string(),
        })
}
