//! Certificate management with ACME support
//!
//! Handles certificate provisioning via Let's Encrypt/ACME HTTP-01 challenges,
//! the on-disk certificate cache, and the in-memory material read by every
//! TLS handshake.

pub mod acme;
pub mod challenge;
pub mod material;
pub mod self_signed;
pub mod storage;

pub use acme::{
    validate_domain, AcmeChallengeSolver, AcmeConfig, AcmeError, ChallengeSolver,
    ExternalAccountBinding, LETS_ENCRYPT_PRODUCTION, LETS_ENCRYPT_STAGING,
};
pub use challenge::{ChallengeManager, ChallengeRegistration, ACME_CHALLENGE_PREFIX};
pub use material::{CertificateMaterial, MaterialError};
pub use self_signed::{
    generate_self_signed_material, generate_self_signed_material_between, SelfSignedError,
};
pub use storage::{CertificateMeta, CertificateStore, StorageError};
