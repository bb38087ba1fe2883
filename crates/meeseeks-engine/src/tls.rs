//! TLS context construction for peer and client connections, mirroring the
//! original implementation's `create_ssl_context`: a handful of config keys
//! (`cafile`, `cert`, `key`, `pass`, `verify`) map onto the connector/acceptor
//! builders this crate's TLS stack exposes.

use meeseeks_core::error::PeerError;

/// TLS settings for one peer link or the listener, taken from the `ssl`
/// sub-tree of a node/box config entry.
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    pub cafile: Option<String>,
    pub cert: Option<String>,
    pub key: Option<String>,
    pub pass: Option<String>,
    pub verify: bool,
}

pub fn build_connector(cfg: &TlsConfig) -> Result<native_tls::TlsConnector, PeerError> {
    let mut builder = native_tls::TlsConnector::builder();
    if !cfg.verify {
        builder.danger_accept_invalid_certs(true);
    }
    if let Some(cafile) = &cfg.cafile {
        let pem = std::fs::read(cafile).map_err(|e| PeerError::Tls(e.to_string()))?;
        let cert =
            native_tls::Certificate::from_pem(&pem).map_err(|e| PeerError::Tls(e.to_string()))?;
        builder.add_root_certificate(cert);
    }
    if let (Some(cert_path), Some(key_path)) = (&cfg.cert, &cfg.key) {
        let identity = load_identity(cert_path, key_path, cfg.pass.as_deref())?;
        builder.identity(identity);
    }
    builder.build().map_err(|e| PeerError::Tls(e.to_string()))
}

pub fn build_acceptor(cfg: &TlsConfig) -> Result<native_tls::TlsAcceptor, PeerError> {
    let cert_path = cfg
        .cert
        .as_deref()
        .ok_or_else(|| PeerError::Tls("tls listener requires cert".to_string()))?;
    let key_path = cfg
        .key
        .as_deref()
        .ok_or_else(|| PeerError::Tls("tls listener requires key".to_string()))?;
    let identity = load_identity(cert_path, key_path, cfg.pass.as_deref())?;
    native_tls::TlsAcceptor::new(identity).map_err(|e| PeerError::Tls(e.to_string()))
}

/// Builds the async listener acceptor directly from an optional config, so
/// callers (the daemon crate) never need to depend on `tokio-native-tls`
/// just to thread this type through.
pub fn build_listener_acceptor(
    cfg: Option<&TlsConfig>,
) -> Result<Option<tokio_native_tls::TlsAcceptor>, PeerError> {
    match cfg {
        Some(cfg) => Ok(Some(tokio_native_tls::TlsAcceptor::from(build_acceptor(cfg)?))),
        None => Ok(None),
    }
}

fn load_identity(
    cert_path: &str,
    key_path: &str,
    pass: Option<&str>,
) -> Result<native_tls::Identity, PeerError> {
    let cert_pem = std::fs::read(cert_path).map_err(|e| PeerError::Tls(e.to_string()))?;
    let key_pem = std::fs::read(key_path).map_err(|e| PeerError::Tls(e.to_string()))?;
    if pass.is_some() {
        // PKCS#8 PEM keys used here are unencrypted; an encrypted key would
        // need PKCS#12 (Identity::from_pkcs12) instead.
        tracing::warn!("tls `pass` is only honored for pkcs12 identities, ignoring for pem key");
    }
    native_tls::Identity::from_pkcs8(&cert_pem, &key_pem).map_err(|e| PeerError::Tls(e.to_string()))
}
