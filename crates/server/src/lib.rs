//! Certgate
//!
//! Issues TLS certificates to callers that prove who they are by signing a
//! timestamp with the key behind their address, instead of logging in.
//!
//! A request is authenticated ([`auth`]), mapped to a filesystem-safe
//! identity key, and either answered from the identity's stored fullchain
//! or sent through the external issuance tool ([`issuance`]) when the
//! stored certificate is missing, stale or the caller forces a reissue
//! ([`policy`]). At most one issuance per identity runs at a time.
//!
//! ```ignore
//! use certgate::server;
//! use certgate_config::Config;
//!
//! let config = Config::from_file("/etc/certgate/certgate.kdl")?;
//! let handle = server::serve(&config).await?;
//! println!("listening on {}", handle.local_addr);
//! ```

// ============================================================================
// Module Declarations
// ============================================================================

pub mod auth;
pub mod http;
pub mod issuance;
pub mod logging;
pub mod policy;
pub mod rate_limit;
pub mod server;
pub mod service;
pub mod store;

// ============================================================================
// Public API Re-exports
// ============================================================================

pub use auth::{AuthError, RequestAuthenticator, SignedRequest, VerifiedCaller};
pub use issuance::{IssuanceCoordinator, IssuanceError};
pub use policy::RenewalDecision;
pub use server::{serve, ServerError, ServerHandle};
pub use service::{CertificateService, CertificateSource, IssuedCertificate, ServiceError};
pub use store::{CertificateRecord, CertificateStateStore, StorageError};
