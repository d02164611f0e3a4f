//! Per-identity certificate storage.
//!
//! Every identity owns one directory under the base path, named by its
//! [`IdentityKey`]. The issuance tool writes its artifacts straight into it.
//!
//! # Directory Structure
//!
//! ```text
//! base/
//! └── 5a0b54d5dc17e0aa/
//!     ├── csr             # CSR as uploaded by the caller
//!     ├── privkey.pem     # Key path handed to the tool
//!     ├── cert.pem        # Leaf certificate
//!     ├── chain.pem       # Intermediates
//!     ├── fullchain.pem   # Leaf + intermediates, served to the caller
//!     ├── work/           # Tool scratch state
//!     ├── config/         # Tool account and renewal state
//!     └── logs/           # Tool logs
//! ```
//!
//! An identity with no `fullchain.pem` has no certificate. The certificate's
//! age is read from the modification time of `fullchain.pem`.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use certgate_common::IdentityKey;

/// A filesystem operation on the certificate store failed.
#[derive(Debug, Error)]
#[error("storage error at {}: {source}", path.display())]
pub struct StorageError {
    pub path: PathBuf,
    #[source]
    pub source: io::Error,
}

impl StorageError {
    fn at(path: &Path) -> impl FnOnce(io::Error) -> Self + '_ {
        move |source| {
            warn!(path = %path.display(), error = %source, "Certificate storage operation failed");
            Self {
                path: path.to_path_buf(),
                source,
            }
        }
    }
}

/// Paths making up one identity's certificate state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateRecord {
    pub key: IdentityKey,
    pub dir: PathBuf,
    pub csr_path: PathBuf,
    pub key_path: PathBuf,
    pub cert_path: PathBuf,
    pub chain_path: PathBuf,
    pub fullchain_path: PathBuf,
    pub work_dir: PathBuf,
    pub config_dir: PathBuf,
    pub logs_dir: PathBuf,
}

/// Certificate state store.
///
/// The only component that creates or deletes files under the base path.
#[derive(Debug)]
pub struct CertificateStateStore {
    base_path: PathBuf,
}

impl CertificateStateStore {
    /// Open the store rooted at `base_path`, creating it with restrictive
    /// permissions (0700 on Unix) if it doesn't exist.
    pub fn new(base_path: &Path) -> Result<Self, StorageError> {
        let existed = base_path.is_dir();
        fs::create_dir_all(base_path).map_err(StorageError::at(base_path))?;

        if !existed {
            restrict_dir(base_path)?;
        }

        info!(
            storage_path = %base_path.display(),
            "Initialized certificate storage"
        );

        Ok(Self {
            base_path: base_path.to_path_buf(),
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Compute the record for `key`. Touches nothing on disk.
    pub fn locate(&self, key: &IdentityKey) -> CertificateRecord {
        let dir = self.base_path.join(key);
        CertificateRecord {
            key: key.clone(),
            csr_path: dir.join("csr"),
            key_path: dir.join("privkey.pem"),
            cert_path: dir.join("cert.pem"),
            chain_path: dir.join("chain.pem"),
            fullchain_path: dir.join("fullchain.pem"),
            work_dir: dir.join("work"),
            config_dir: dir.join("config"),
            logs_dir: dir.join("logs"),
            dir,
        }
    }

    /// Age of the stored fullchain at `now`, or `None` if there is none.
    ///
    /// An mtime in the future counts as age zero.
    pub fn current_age(
        &self,
        record: &CertificateRecord,
        now: SystemTime,
    ) -> Result<Option<Duration>, StorageError> {
        let metadata = match fs::metadata(&record.fullchain_path) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                trace!(key = %record.key, "No stored certificate found");
                return Ok(None);
            }
            Err(e) => return Err(StorageError::at(&record.fullchain_path)(e)),
        };

        let issued = metadata
            .modified()
            .map_err(StorageError::at(&record.fullchain_path))?;
        let age = now.duration_since(issued).unwrap_or(Duration::ZERO);

        debug!(
            key = %record.key,
            issued_at = %DateTime::<Utc>::from(issued),
            age_secs = age.as_secs(),
            "Found stored certificate"
        );
        Ok(Some(age))
    }

    /// Give the issuance tool a clean slate: wipe the identity directory and
    /// recreate it with empty `work/`, `config/` and `logs/`. Idempotent.
    pub fn prepare_for_issuance(&self, record: &CertificateRecord) -> Result<(), StorageError> {
        self.reset_to_empty(record)?;

        for dir in [&record.dir, &record.work_dir, &record.config_dir, &record.logs_dir] {
            fs::create_dir_all(dir).map_err(StorageError::at(dir))?;
            restrict_dir(dir)?;
        }

        debug!(key = %record.key, dir = %record.dir.display(), "Prepared identity directory");
        Ok(())
    }

    /// Delete the identity directory and everything in it. Missing is fine.
    pub fn reset_to_empty(&self, record: &CertificateRecord) -> Result<(), StorageError> {
        match fs::remove_dir_all(&record.dir) {
            Ok(()) => {
                debug!(key = %record.key, "Removed identity directory");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::at(&record.dir)(e)),
        }
    }

    /// Write the caller's CSR verbatim.
    pub fn write_csr(&self, record: &CertificateRecord, csr: &[u8]) -> Result<(), StorageError> {
        fs::write(&record.csr_path, csr).map_err(StorageError::at(&record.csr_path))?;
        trace!(key = %record.key, bytes = csr.len(), "Wrote CSR");
        Ok(())
    }

    /// Read the stored fullchain for serving.
    pub fn read_fullchain(&self, record: &CertificateRecord) -> Result<Vec<u8>, StorageError> {
        fs::read(&record.fullchain_path).map_err(StorageError::at(&record.fullchain_path))
    }
}

fn restrict_dir(path: &Path) -> Result<(), StorageError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o700))
            .map_err(StorageError::at(path))?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}
