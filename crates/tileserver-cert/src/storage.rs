//! On-disk certificate cache and the in-memory material it publishes
//!
//! # Directory Structure
//!
//! ```text
//! cache_dir/
//! ├── material.pem   # chain + key, the file load() reads
//! ├── cert.pem       # chain, for external tooling
//! ├── key.pem        # private key (0600)
//! ├── meta.json      # expiry, issue date, domains
//! └── account.json   # ACME account credentials (0600)
//! ```

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info, trace};

use crate::material::CertificateMaterial;

const MATERIAL_FILE: &str = "material.pem";
const CERT_FILE: &str = "cert.pem";
const KEY_FILE: &str = "key.pem";
const META_FILE: &str = "meta.json";
const ACCOUNT_FILE: &str = "account.json";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("No cached certificate in {0}")]
    NotFound(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Cached certificate is invalid: {0}")]
    InvalidMaterial(String),
}

/// Metadata written next to the certificate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CertificateMeta {
    pub expires: DateTime<Utc>,
    pub issued: DateTime<Utc>,
    pub domains: Vec<String>,
}

/// Certificate cache plus the material currently served.
///
/// The manager is the only writer. Handshakes read through
/// [`CertificateStore::current_material`], which never blocks.
#[derive(Debug)]
pub struct CertificateStore {
    cache_dir: PathBuf,
    current: ArcSwapOption<CertificateMaterial>,
}

impl CertificateStore {
    /// Open (and create if needed) the cache directory
    pub fn open(cache_dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        let cache_dir = cache_dir.as_ref().to_path_buf();
        fs::create_dir_all(&cache_dir)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&cache_dir, fs::Permissions::from_mode(0o700))?;
        }

        info!(cache_dir = %cache_dir.display(), "Opened certificate cache");

        Ok(Self {
            cache_dir,
            current: ArcSwapOption::empty(),
        })
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Read the cached material from disk without installing it
    pub fn load(&self) -> Result<CertificateMaterial, StorageError> {
        let path = self.cache_dir.join(MATERIAL_FILE);
        let pem = match fs::read_to_string(&path) {
            Ok(pem) => pem,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                trace!(path = %path.display(), "No cached certificate");
                return Err(StorageError::NotFound(path));
            }
            Err(e) => return Err(e.into()),
        };

        let material = CertificateMaterial::from_combined_pem(&pem)
            .map_err(|e| StorageError::InvalidMaterial(e.to_string()))?;

        debug!(expires = %material.expires_at(), "Loaded cached certificate");
        Ok(material)
    }

    /// Persist material; `material.pem` is replaced last
    pub fn save(&self, material: &CertificateMaterial, domains: &[String]) -> Result<(), StorageError> {
        let meta = CertificateMeta {
            expires: material.expires_at(),
            issued: Utc::now(),
            domains: domains.to_vec(),
        };

        self.write_atomic(CERT_FILE, material.certificate_pem().as_bytes(), false)?;
        self.write_atomic(KEY_FILE, material.private_key_pem().as_bytes(), true)?;
        self.write_atomic(META_FILE, serde_json::to_string_pretty(&meta)?.as_bytes(), false)?;
        self.write_atomic(MATERIAL_FILE, material.to_combined_pem().as_bytes(), true)?;

        info!(
            domains = ?domains,
            expires = %meta.expires,
            "Saved certificate to cache"
        );
        Ok(())
    }

    pub fn load_meta(&self) -> Result<Option<CertificateMeta>, StorageError> {
        let path = self.cache_dir.join(META_FILE);
        match fs::read_to_string(&path) {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Material served to new handshakes
    pub fn current_material(&self) -> Option<Arc<CertificateMaterial>> {
        self.current.load_full()
    }

    pub fn install(&self, material: Arc<CertificateMaterial>) {
        debug!(expires = %material.expires_at(), "Installing certificate");
        self.current.store(Some(material));
    }

    /// Load from disk and install
    pub fn reload_now(&self) -> Result<Arc<CertificateMaterial>, StorageError> {
        let material = Arc::new(self.load()?);
        self.install(material.clone());
        Ok(material)
    }

    /// Raw `instant_acme::AccountCredentials` JSON, if an account was created before
    pub fn load_account_credentials(&self) -> Result<Option<String>, StorageError> {
        let path = self.cache_dir.join(ACCOUNT_FILE);
        match fs::read_to_string(&path) {
            Ok(content) => {
                debug!("Loaded ACME account credentials");
                Ok(Some(content))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                trace!("No stored ACME account found");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn save_account_credentials(&self, json: &str) -> Result<(), StorageError> {
        self.write_atomic(ACCOUNT_FILE, json.as_bytes(), true)?;
        info!("Saved ACME account credentials");
        Ok(())
    }

    /// Write to a temp file in the cache dir, fsync, then rename over `name`
    fn write_atomic(&self, name: &str, contents: &[u8], private: bool) -> Result<(), StorageError> {
        let mut file = NamedTempFile::new_in(&self.cache_dir)?;

        #[cfg(unix)]
        if private {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(file.path(), fs::Permissions::from_mode(0o600))?;
        }
        #[cfg(not(unix))]
        let _ = private;

        file.write_all(contents)?;
        file.as_file().sync_all()?;
        file.persist(self.cache_dir.join(name))
            .map_err(|e| StorageError::Io(e.error))?;

        trace!(file = name, bytes = contents.len(), "Wrote cache file");
        Ok(())
    }
}
