//! Certificate material: a parsed chain, its private key and expiry

use chrono::{DateTime, Duration, TimeZone, Utc};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::sign::CertifiedKey;
use std::sync::Arc;
use thiserror::Error;
use x509_parser::prelude::{FromDer, X509Certificate};

#[derive(Debug, Error)]
pub enum MaterialError {
    #[error("No certificate found in PEM data")]
    NoCertificate,

    #[error("No private key found in PEM data")]
    NoPrivateKey,

    #[error("Failed to parse PEM: {0}")]
    Pem(String),

    #[error("Unsupported private key: {0}")]
    UnsupportedKey(String),

    #[error("Private key does not match the certificate")]
    KeyMismatch,

    #[error("Failed to parse certificate: {0}")]
    X509(String),
}

/// A certificate chain together with its private key.
///
/// Built only by parsing PEM, so the cert/key pairing and expiry are checked
/// once up front. Never mutated after construction; a renewal replaces the
/// whole value.
#[derive(Debug)]
pub struct CertificateMaterial {
    certificate_pem: String,
    private_key_pem: String,
    expires_at: DateTime<Utc>,
    certified_key: Arc<CertifiedKey>,
}

impl CertificateMaterial {
    /// Parse a PEM certificate chain and a PEM private key
    pub fn from_pem(
        certificate_pem: impl Into<String>,
        private_key_pem: impl Into<String>,
    ) -> Result<Self, MaterialError> {
        let certificate_pem = certificate_pem.into();
        let private_key_pem = private_key_pem.into();

        let chain = rustls_pemfile::certs(&mut certificate_pem.as_bytes())
            .collect::<Result<Vec<CertificateDer<'static>>, _>>()
            .map_err(|e| MaterialError::Pem(e.to_string()))?;
        let leaf = chain.first().ok_or(MaterialError::NoCertificate)?;
        let expires_at = leaf_expiry(leaf)?;

        let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut private_key_pem.as_bytes())
            .map_err(|e| MaterialError::Pem(e.to_string()))?
            .ok_or(MaterialError::NoPrivateKey)?;
        let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)
            .map_err(|e| MaterialError::UnsupportedKey(e.to_string()))?;

        let certified_key = CertifiedKey::new(chain, signing_key);
        certified_key
            .keys_match()
            .map_err(|_| MaterialError::KeyMismatch)?;

        Ok(Self {
            certificate_pem,
            private_key_pem,
            expires_at,
            certified_key: Arc::new(certified_key),
        })
    }

    /// Parse the single-file form written by [`Self::to_combined_pem`]
    pub fn from_combined_pem(pem: &str) -> Result<Self, MaterialError> {
        let (certificate_pem, private_key_pem) =
            split_combined(pem).ok_or(MaterialError::NoPrivateKey)?;
        Self::from_pem(certificate_pem, private_key_pem)
    }

    /// Chain followed by key, so one rename replaces both together
    pub fn to_combined_pem(&self) -> String {
        let mut combined = self.certificate_pem.clone();
        if !combined.ends_with('\n') {
            combined.push('\n');
        }
        combined.push_str(&self.private_key_pem);
        combined
    }

    pub fn certificate_pem(&self) -> &str {
        &self.certificate_pem
    }

    pub fn private_key_pem(&self) -> &str {
        &self.private_key_pem
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// Key handed to rustls during the handshake
    pub fn certified_key(&self) -> Arc<CertifiedKey> {
        self.certified_key.clone()
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Instant at which renewal should start, `lead_time` before expiry
    pub fn renewal_due_at(&self, lead_time: Duration) -> DateTime<Utc> {
        self.expires_at - lead_time
    }

    pub fn needs_renewal(&self, lead_time: Duration) -> bool {
        Utc::now() >= self.renewal_due_at(lead_time)
    }

    pub fn days_until_expiry(&self) -> i64 {
        (self.expires_at - Utc::now()).num_days()
    }
}

fn leaf_expiry(leaf: &CertificateDer<'_>) -> Result<DateTime<Utc>, MaterialError> {
    let (_, cert) = X509Certificate::from_der(leaf.as_ref())
        .map_err(|e| MaterialError::X509(e.to_string()))?;
    let not_after = cert.validity().not_after.timestamp();
    Utc.timestamp_opt(not_after, 0)
        .single()
        .ok_or_else(|| MaterialError::X509(format!("invalid notAfter timestamp {}", not_after)))
}

/// Split at the first PEM block labelled as a private key
fn split_combined(pem: &str) -> Option<(&str, &str)> {
    let mut offset = 0;
    for line in pem.split_inclusive('\n') {
        let trimmed = line.trim();
        if trimmed.starts_with("-----BEGIN") && trimmed.ends_with("PRIVATE KEY-----") {
            return Some((&pem[..offset], &pem[offset..]));
        }
        offset += line.len();
    }
    None
}
