//! TLS configuration for secure generations

use std::sync::Arc;

use rustls::crypto::ring::{self, cipher_suite};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use tileserver_cert::CertificateStore;
use tracing::warn;

use crate::ServerError;

/// Resolves every handshake to the store's current material
#[derive(Debug)]
pub struct MaterialResolver {
    store: Arc<CertificateStore>,
}

impl MaterialResolver {
    pub fn new(store: Arc<CertificateStore>) -> Self {
        Self { store }
    }
}

impl ResolvesServerCert for MaterialResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let material = self.store.current_material();
        if material.is_none() {
            warn!(
                sni = client_hello.server_name().unwrap_or("<none>"),
                "TLS handshake with no certificate installed"
            );
        }
        material.map(|m| m.certified_key())
    }
}

/// Server config restricted to TLS 1.2/1.3 and AEAD suites with forward secrecy
pub fn strict_server_config(
    resolver: Arc<dyn ResolvesServerCert>,
) -> Result<ServerConfig, ServerError> {
    let mut provider = ring::default_provider();
    provider.cipher_suites = vec![
        cipher_suite::TLS13_AES_256_GCM_SHA384,
        cipher_suite::TLS13_AES_128_GCM_SHA256,
        cipher_suite::TLS13_CHACHA20_POLY1305_SHA256,
        cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
        cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
        cipher_suite::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
        cipher_suite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
        cipher_suite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
        cipher_suite::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
    ];

    let mut config = ServerConfig::builder_with_provider(Arc::new(provider))
        .with_protocol_versions(&[&rustls::version::TLS13, &rustls::version::TLS12])
        .map_err(|e| ServerError::Tls(e.to_string()))?
        .with_no_client_auth()
        .with_cert_resolver(resolver);

    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    Ok(config)
}
