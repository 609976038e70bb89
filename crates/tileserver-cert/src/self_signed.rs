//! Self-signed certificate generation for development and tests

use chrono::{DateTime, Duration, Utc};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use thiserror::Error;
use time::OffsetDateTime;
use tracing::debug;

use crate::material::{CertificateMaterial, MaterialError};

#[derive(Debug, Error)]
pub enum SelfSignedError {
    #[error("Certificate generation failed: {0}")]
    Generation(#[from] rcgen::Error),

    #[error("Invalid validity window: {0}")]
    Validity(String),

    #[error("Generated material is invalid: {0}")]
    Material(#[from] MaterialError),
}

/// Generate self-signed material valid from now for `valid_for`
pub fn generate_self_signed_material(
    domains: &[String],
    valid_for: Duration,
) -> Result<CertificateMaterial, SelfSignedError> {
    let now = Utc::now();
    generate_self_signed_material_between(domains, now - Duration::minutes(5), now + valid_for)
}

/// Generate self-signed material with an explicit validity window.
///
/// The window may lie entirely in the past, which is how expired cache
/// entries are produced.
pub fn generate_self_signed_material_between(
    domains: &[String],
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
) -> Result<CertificateMaterial, SelfSignedError> {
    let mut params = CertificateParams::new(domains.to_vec())?;

    let mut distinguished_name = DistinguishedName::new();
    if let Some(first) = domains.first() {
        distinguished_name.push(DnType::CommonName, first.as_str());
    }
    distinguished_name.push(DnType::OrganizationName, "tileserver development");
    params.distinguished_name = distinguished_name;

    params.not_before = to_offset(not_before)?;
    params.not_after = to_offset(not_after)?;

    let key_pair = KeyPair::generate()?;
    let cert = params.self_signed(&key_pair)?;

    debug!(domains = ?domains, expires = %not_after, "Generated self-signed certificate");

    Ok(CertificateMaterial::from_pem(
        cert.pem(),
        key_pair.serialize_pem(),
    )?)
}

fn to_offset(at: DateTime<Utc>) -> Result<OffsetDateTime, SelfSignedError> {
    OffsetDateTime::from_unix_timestamp(at.timestamp())
        .map_err(|e| SelfSignedError::Validity(e.to_string()))
}
