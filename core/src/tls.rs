//! Client TLS configuration.

use std::sync::{Arc, OnceLock};

use rustls::{ClientConfig, RootCertStore};

/// Build a client config trusting the Mozilla root set, offering only
/// `http/1.1` over ALPN.
pub fn default_client_config() -> Result<Arc<ClientConfig>, rustls::Error> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

/// Process-wide default config, built on first use. Immutable once built.
pub(crate) fn shared_client_config() -> Result<Arc<ClientConfig>, rustls::Error> {
    static CONFIG: OnceLock<Arc<ClientConfig>> = OnceLock::new();
    if let Some(config) = CONFIG.get() {
        return Ok(Arc::clone(config));
    }
    let config = default_client_config()?;
    Ok(Arc::clone(CONFIG.get_or_init(|| config)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_offers_http11_only() {
        let config = default_client_config().unwrap();
        assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);
    }

    #[test]
    fn shared_config_is_built_once() {
        let a = shared_client_config().unwrap();
        let b = shared_client_config().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
