//! Request orchestration.
//!
//! authenticate → derive identity key → look up stored certificate →
//! decide → serve cached or issue.

use std::io;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use http::StatusCode;
use thiserror::Error;
use tracing::{debug, info, warn};

use certgate_common::IdentityKey;
use certgate_config::Config;

use crate::auth::{AuthError, RequestAuthenticator, SignedRequest};
use crate::issuance::{IssuanceCoordinator, IssuanceError};
use crate::policy::{self, RenewalDecision};
use crate::store::{CertificateRecord, CertificateStateStore, StorageError};

/// PEM labels accepted for an uploaded CSR.
const CSR_PEM_TAGS: &[&str] = &["CERTIFICATE REQUEST", "NEW CERTIFICATE REQUEST"];

/// Everything that can go wrong serving a request, with its HTTP mapping.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("No CSR was uploaded.")]
    MissingCsr,

    #[error("Invalid CSR: {0}")]
    InvalidCsr(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Request body exceeds {limit} bytes.")]
    PayloadTooLarge { limit: usize },

    #[error("Too many requests, retry in {}s.", .retry_after.as_secs())]
    RateLimited { retry_after: Duration },

    #[error("Not found.")]
    NotFound,

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Issuance(#[from] IssuanceError),
}

impl ServiceError {
    /// Status code sent to the client.
    ///
    /// Authentication failures share 400 with malformed requests.
    pub fn status(&self) -> StatusCode {
        match self {
            ServiceError::Auth(_)
            | ServiceError::MissingCsr
            | ServiceError::InvalidCsr(_)
            | ServiceError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ServiceError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            ServiceError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ServiceError::NotFound => StatusCode::NOT_FOUND,
            ServiceError::Issuance(IssuanceError::AlreadyInProgress(_)) => StatusCode::CONFLICT,
            ServiceError::Storage(_) | ServiceError::Issuance(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Message safe to show the client. Never contains filesystem paths or
    /// the issuance command line.
    pub fn client_message(&self) -> String {
        match self {
            ServiceError::Storage(_) => "Internal storage error.".to_string(),
            ServiceError::Issuance(IssuanceError::AlreadyInProgress(_)) => {
                "Certificate issuance already in progress for this identity.".to_string()
            }
            ServiceError::Issuance(IssuanceError::Failed { stderr, .. }) => format!(
                "An error has occurred issuing the certificate. If necessary, contact the operator with the following log: {stderr}"
            ),
            ServiceError::Issuance(IssuanceError::TimedOut(_)) => {
                "Certificate issuance timed out.".to_string()
            }
            ServiceError::Issuance(_) => "Certificate issuance failed.".to_string(),
            other => other.to_string(),
        }
    }
}

/// Where a served certificate came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertificateSource {
    Cached,
    Issued,
}

/// A fullchain ready to be sent to the caller.
#[derive(Debug, Clone)]
pub struct IssuedCertificate {
    pub key: IdentityKey,
    pub source: CertificateSource,
    pub fullchain: Vec<u8>,
}

/// Single entry point from the HTTP layer into the core.
#[derive(Debug, Clone)]
pub struct CertificateService {
    authenticator: RequestAuthenticator,
    store: Arc<CertificateStateStore>,
    coordinator: IssuanceCoordinator,
    renewal_threshold: Duration,
    identity_key_length: usize,
}

impl CertificateService {
    pub fn new(config: &Config) -> Result<Self, StorageError> {
        let store = Arc::new(CertificateStateStore::new(&config.certificates.base_dir)?);
        let coordinator = IssuanceCoordinator::new(
            Arc::clone(&store),
            config.issuer.clone(),
            config.credentials_path(),
        );

        Ok(Self {
            authenticator: RequestAuthenticator::new(config.auth.clone()),
            store,
            coordinator,
            renewal_threshold: config.certificates.renewal_threshold(),
            identity_key_length: config.certificates.identity_key_length,
        })
    }

    /// Serve the caller's certificate, issuing one from `csr` if needed.
    ///
    /// `csr` is only required when a new certificate has to be issued.
    pub async fn request_certificate(
        &self,
        request: &SignedRequest,
        csr: Option<Bytes>,
        now: SystemTime,
    ) -> Result<IssuedCertificate, ServiceError> {
        let now_secs = now.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
        let caller = self.authenticator.authenticate(request, now_secs)?;

        let key = IdentityKey::derive(caller.address(), self.identity_key_length);
        let record = self.store.locate(&key);
        let age = self.store.current_age(&record, now)?;
        let decision = policy::decide(age, self.renewal_threshold, request.force());

        debug!(
            key = %key,
            age_secs = age.map(|a| a.as_secs()),
            force = request.force(),
            decision = ?decision,
            "Renewal decision"
        );

        match decision {
            RenewalDecision::ServeCached => self.serve_cached(key, record, csr).await,
            RenewalDecision::Reissue => self.reissue(key, record, csr).await,
        }
    }

    /// Read the stored fullchain. It can vanish between the age check and
    /// the read if a reissue for the same identity resets the directory.
    async fn serve_cached(
        &self,
        key: IdentityKey,
        record: CertificateRecord,
        csr: Option<Bytes>,
    ) -> Result<IssuedCertificate, ServiceError> {
        match self.store.read_fullchain(&record) {
            Ok(fullchain) => {
                info!(key = %key, "Serving cached certificate");
                Ok(IssuedCertificate {
                    key,
                    source: CertificateSource::Cached,
                    fullchain,
                })
            }
            Err(e) if e.source.kind() == io::ErrorKind::NotFound => {
                warn!(key = %key, "Cached fullchain disappeared before it could be served");
                if self.coordinator.locks().is_held(&key) {
                    return Err(IssuanceError::AlreadyInProgress(key).into());
                }
                self.reissue(key, record, csr).await
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn reissue(
        &self,
        key: IdentityKey,
        record: CertificateRecord,
        csr: Option<Bytes>,
    ) -> Result<IssuedCertificate, ServiceError> {
        let csr = csr.ok_or(ServiceError::MissingCsr)?;
        validate_csr(&csr)?;

        let fullchain_path = self.coordinator.issue(record.clone(), csr).await?;
        debug!(key = %key, path = %fullchain_path.display(), "Reading issued fullchain");
        let fullchain = self.store.read_fullchain(&record)?;
        Ok(IssuedCertificate {
            key,
            source: CertificateSource::Issued,
            fullchain,
        })
    }
}

/// Check that `csr` is a single PEM-encoded certificate request.
pub fn validate_csr(csr: &[u8]) -> Result<(), ServiceError> {
    let block = pem::parse(csr).map_err(|e| ServiceError::InvalidCsr(e.to_string()))?;
    if !CSR_PEM_TAGS.contains(&block.tag()) {
        return Err(ServiceError::InvalidCsr(format!(
            "expected a CERTIFICATE REQUEST, got {}",
            block.tag()
        )));
    }
    if block.contents().is_empty() {
        return Err(ServiceError::InvalidCsr("empty request".to_string()));
    }
    Ok(())
}
