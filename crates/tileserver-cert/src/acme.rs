//! ACME client for automatic certificate provisioning via Let's Encrypt
//!
//! Uses HTTP-01 challenges: tokens are published through a
//! [`ChallengeManager`] that the plain-HTTP listener answers from.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, ExternalAccountKey,
    Identifier, NewAccount, NewOrder, OrderStatus, RetryPolicy,
};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::challenge::ChallengeManager;
use crate::material::{CertificateMaterial, MaterialError};
use crate::storage::{CertificateStore, StorageError};

pub const LETS_ENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";
pub const LETS_ENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

const DEFAULT_CHALLENGE_TIMEOUT: Duration = Duration::from_secs(120);

/// ACME errors
#[derive(Debug, Error)]
pub enum AcmeError {
    #[error("ACME error: {0}")]
    Acme(#[from] instant_acme::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Invalid domain: {0}")]
    InvalidDomain(String),

    #[error("HTTP-01 challenge not offered by the ACME server")]
    NoHttp01Challenge,

    #[error("Order failed: {0}")]
    OrderFailed(String),

    #[error("Timeout waiting for order")]
    Timeout,

    #[error("Issued certificate is invalid: {0}")]
    Material(#[from] MaterialError),

    #[error("Invalid external account binding: {0}")]
    ExternalAccount(String),

    #[error("Account credentials error: {0}")]
    Credentials(#[from] serde_json::Error),
}

/// External account binding, required by some CAs
#[derive(Clone)]
pub struct ExternalAccountBinding {
    pub key_id: String,
    /// base64url-encoded HMAC key, as CAs hand it out
    pub hmac_key: String,
}

impl ExternalAccountBinding {
    fn to_key(&self) -> Result<ExternalAccountKey, AcmeError> {
        let hmac = URL_SAFE_NO_PAD
            .decode(self.hmac_key.trim_end_matches('='))
            .map_err(|e| AcmeError::ExternalAccount(e.to_string()))?;
        Ok(ExternalAccountKey::new(self.key_id.clone(), &hmac))
    }
}

impl std::fmt::Debug for ExternalAccountBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExternalAccountBinding")
            .field("key_id", &self.key_id)
            .field("hmac_key", &"<redacted>")
            .finish()
    }
}

/// ACME configuration
#[derive(Debug, Clone)]
pub struct AcmeConfig {
    /// Names the certificate must cover
    pub domains: Vec<String>,
    /// Contact email for the ACME account
    pub contact_email: String,
    pub directory_url: String,
    pub external_account: Option<ExternalAccountBinding>,
    /// Extra root CA for the directory's TLS certificate (test CAs such as Pebble)
    pub root_ca: Option<PathBuf>,
    /// Upper bound for one complete order
    pub challenge_timeout: Duration,
}

impl Default for AcmeConfig {
    fn default() -> Self {
        Self {
            domains: Vec::new(),
            contact_email: String::new(),
            directory_url: LETS_ENCRYPT_PRODUCTION.to_string(),
            external_account: None,
            root_ca: None,
            challenge_timeout: DEFAULT_CHALLENGE_TIMEOUT,
        }
    }
}

/// Source of fresh certificate material
#[async_trait]
pub trait ChallengeSolver: Send + Sync {
    /// Run one complete issuance and return the new material
    async fn solve(&self) -> Result<CertificateMaterial, AcmeError>;
}

/// HTTP-01 solver backed by instant-acme
pub struct AcmeChallengeSolver {
    config: AcmeConfig,
    store: Arc<CertificateStore>,
    challenges: ChallengeManager,
}

impl AcmeChallengeSolver {
    pub fn new(
        config: AcmeConfig,
        store: Arc<CertificateStore>,
        challenges: ChallengeManager,
    ) -> Result<Self, AcmeError> {
        if config.domains.is_empty() {
            return Err(AcmeError::InvalidDomain(
                "At least one domain is required".to_string(),
            ));
        }
        for domain in &config.domains {
            validate_domain(domain)?;
        }

        Ok(Self {
            config,
            store,
            challenges,
        })
    }

    pub fn config(&self) -> &AcmeConfig {
        &self.config
    }

    /// Restore the stored account or register a new one
    async fn account(&self) -> Result<Account, AcmeError> {
        let builder = match &self.config.root_ca {
            Some(path) => Account::builder_with_root(path)?,
            None => Account::builder()?,
        };

        if let Some(json) = self.store.load_account_credentials()? {
            let credentials: AccountCredentials = serde_json::from_str(&json)?;
            let account = builder.from_credentials(credentials).await?;
            debug!("Restored ACME account from cache");
            return Ok(account);
        }

        let contact = format!("mailto:{}", self.config.contact_email);
        let external_account = self
            .config
            .external_account
            .as_ref()
            .map(ExternalAccountBinding::to_key)
            .transpose()?;

        let (account, credentials) = builder
            .create(
                &NewAccount {
                    contact: &[&contact],
                    terms_of_service_agreed: true,
                    only_return_existing: false,
                },
                self.config.directory_url.clone(),
                external_account.as_ref(),
            )
            .await?;

        self.store
            .save_account_credentials(&serde_json::to_string_pretty(&credentials)?)?;
        info!(contact = %self.config.contact_email, "Created ACME account");

        Ok(account)
    }

    async fn issue(&self) -> Result<CertificateMaterial, AcmeError> {
        let account = self.account().await?;

        let identifiers: Vec<Identifier> = self
            .config
            .domains
            .iter()
            .map(|domain| Identifier::Dns(domain.clone()))
            .collect();
        let mut order = account.new_order(&NewOrder::new(&identifiers)).await?;
        debug!(domains = ?self.config.domains, "Created ACME order");

        // Tokens stay published until this drops, whichever way we leave
        let mut registration = self.challenges.registration();

        let mut authorizations = order.authorizations();
        while let Some(result) = authorizations.next().await {
            let mut authz = result?;
            match authz.status {
                AuthorizationStatus::Pending => {}
                AuthorizationStatus::Valid => continue,
                status => {
                    return Err(AcmeError::OrderFailed(format!(
                        "authorization is {:?}",
                        status
                    )))
                }
            }

            let mut challenge = authz
                .challenge(ChallengeType::Http01)
                .ok_or(AcmeError::NoHttp01Challenge)?;
            let key_authorization = challenge.key_authorization();
            registration.add(&challenge.token, key_authorization.as_str());
            challenge.set_ready().await?;
        }
        drop(authorizations);

        info!(challenges = registration.len(), "HTTP-01 challenges published");

        let retry = RetryPolicy::new()
            .timeout(self.config.challenge_timeout)
            .initial_delay(Duration::from_secs(1));

        let status = order.poll_ready(&retry).await?;
        if !matches!(status, OrderStatus::Ready | OrderStatus::Valid) {
            return Err(AcmeError::OrderFailed(format!(
                "order ended as {:?}",
                status
            )));
        }

        let private_key_pem = order.finalize().await?;
        let chain_pem = order.poll_certificate(&retry).await?;
        drop(registration);

        let material = CertificateMaterial::from_pem(chain_pem, private_key_pem)?;
        info!(
            domains = ?self.config.domains,
            expires = %material.expires_at(),
            "Certificate issued"
        );
        Ok(material)
    }
}

#[async_trait]
impl ChallengeSolver for AcmeChallengeSolver {
    async fn solve(&self) -> Result<CertificateMaterial, AcmeError> {
        match tokio::time::timeout(self.config.challenge_timeout, self.issue()).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    timeout_secs = self.config.challenge_timeout.as_secs(),
                    "ACME order timed out"
                );
                Err(AcmeError::Timeout)
            }
        }
    }
}

/// Validate domain name
pub fn validate_domain(domain: &str) -> Result<(), AcmeError> {
    if domain.is_empty() {
        return Err(AcmeError::InvalidDomain(
            "Domain cannot be empty".to_string(),
        ));
    }

    if domain.contains(' ') {
        return Err(AcmeError::InvalidDomain(format!(
            "Domain cannot contain spaces: {}",
            domain
        )));
    }

    if domain.starts_with('.') || domain.ends_with('.') {
        return Err(AcmeError::InvalidDomain(format!(
            "Domain cannot start or end with a dot: {}",
            domain
        )));
    }

    Ok(())
}
