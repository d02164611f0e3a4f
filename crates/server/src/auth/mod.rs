//! Signed-request authentication.
//!
//! A request carries `address`, `timestamp` and `signature` query
//! parameters. The signature covers a canonical, length-prefixed message
//! built from a fixed prefix, this service's signer label and the
//! timestamp:
//!
//! ```text
//! <prefix>\n<signer-label>\n<len(timestamp)>\n<timestamp>
//! ```
//!
//! Authentication succeeds when the signer recovered from that message is
//! the claimed address and the timestamp is within the freshness window of
//! server time, in either direction. The window bounds how long a captured
//! signature can be replayed.

pub mod signature;

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

use certgate_common::Address;
use certgate_config::AuthConfig;

pub use signature::{keccak256, RecoveryError, Secp256k1Verifier, SignatureVerifier};

/// Authentication failures.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Missing parameter(s): {0}")]
    MissingParameters(String),

    #[error("Malformed parameter '{field}': {reason}")]
    Malformed { field: &'static str, reason: String },

    #[error("Signing error: {0}")]
    Recovery(#[from] RecoveryError),

    #[error("Invalid address or signature.")]
    SignerMismatch,

    #[error("Timestamp out of sync. Is your server synchronized?")]
    TimestampOutOfSync { skew_secs: u64 },
}

impl AuthError {
    /// Whether the request itself was malformed, as opposed to well-formed
    /// but not authorized.
    pub fn is_bad_request(&self) -> bool {
        matches!(
            self,
            AuthError::MissingParameters(_) | AuthError::Malformed { .. } | AuthError::Recovery(_)
        )
    }
}

/// The parameters of an inbound certificate request.
///
/// Only produced by [`SignedRequest::from_query`] or [`SignedRequest::new`];
/// every field has already passed shape validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedRequest {
    address: Address,
    timestamp: u64,
    signature: Vec<u8>,
    force: bool,
}

impl SignedRequest {
    pub fn new(address: Address, timestamp: u64, signature: Vec<u8>, force: bool) -> Self {
        Self {
            address,
            timestamp,
            signature,
            force,
        }
    }

    /// Parse a URL query string, failing closed on any missing, duplicated
    /// or malformed field.
    ///
    /// `sig` is accepted as an alias of `signature`. `force` is optional and
    /// boolean-like; a bare `force` counts as set.
    pub fn from_query(query: Option<&str>) -> Result<Self, AuthError> {
        let mut address = None;
        let mut timestamp = None;
        let mut signature = None;
        let mut force = None;

        for (key, value) in url::form_urlencoded::parse(query.unwrap_or("").as_bytes()) {
            let (slot, field) = match key.as_ref() {
                "address" => (&mut address, "address"),
                "timestamp" => (&mut timestamp, "timestamp"),
                "signature" | "sig" => (&mut signature, "signature"),
                "force" => (&mut force, "force"),
                _ => continue,
            };
            if slot.is_some() {
                return Err(AuthError::Malformed {
                    field,
                    reason: "given more than once".to_string(),
                });
            }
            *slot = Some(value.into_owned());
        }

        let missing: Vec<&str> = [
            ("address", address.is_none()),
            ("timestamp", timestamp.is_none()),
            ("signature", signature.is_none()),
        ]
        .iter()
        .filter(|(_, absent)| *absent)
        .map(|(name, _)| *name)
        .collect();
        if !missing.is_empty() {
            return Err(AuthError::MissingParameters(missing.join(", ")));
        }

        let address = address.unwrap_or_default();
        let address = Address::parse(&address).map_err(|e| AuthError::Malformed {
            field: "address",
            reason: e.to_string(),
        })?;

        let timestamp = parse_timestamp(&timestamp.unwrap_or_default())?;
        let signature = parse_hex_bytes(&signature.unwrap_or_default())?;
        let force = force.map(|v| parse_flag(&v)).transpose()?.unwrap_or(false);

        Ok(Self::new(address, timestamp, signature, force))
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn signature(&self) -> &[u8] {
        &self.signature
    }

    pub fn force(&self) -> bool {
        self.force
    }
}

fn parse_timestamp(raw: &str) -> Result<u64, AuthError> {
    let malformed = |reason: &str| AuthError::Malformed {
        field: "timestamp",
        reason: reason.to_string(),
    };

    if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return Err(malformed("must be a positive integer"));
    }
    match raw.parse::<u64>() {
        Ok(0) => Err(malformed("must be a positive integer")),
        Ok(ts) => Ok(ts),
        Err(_) => Err(malformed("out of range")),
    }
}

fn parse_hex_bytes(raw: &str) -> Result<Vec<u8>, AuthError> {
    let malformed = |reason: String| AuthError::Malformed {
        field: "signature",
        reason,
    };

    let digits = raw
        .strip_prefix("0x")
        .ok_or_else(|| malformed("must start with 0x".to_string()))?;
    if digits.is_empty() {
        return Err(malformed("no hex digits".to_string()));
    }
    hex::decode(digits).map_err(|e| malformed(e.to_string()))
}

fn parse_flag(raw: &str) -> Result<bool, AuthError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "" | "true" | "yes" | "1" | "on" => Ok(true),
        "false" | "no" | "0" | "off" => Ok(false),
        _ => Err(AuthError::Malformed {
            field: "force",
            reason: format!("'{raw}' is not a boolean"),
        }),
    }
}

/// Proof that a request was signed by `address` within the freshness
/// window. Only [`RequestAuthenticator::authenticate`] constructs one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedCaller {
    address: Address,
}

impl VerifiedCaller {
    pub fn address(&self) -> &Address {
        &self.address
    }
}

/// Build the canonical message a caller signs for `timestamp`.
pub fn canonical_message(prefix: &str, signer_label: &str, timestamp: u64) -> String {
    let ts = timestamp.to_string();
    [prefix, signer_label, &ts.len().to_string(), &ts].join("\n")
}

/// Turns a [`SignedRequest`] into a [`VerifiedCaller`].
#[derive(Clone)]
pub struct RequestAuthenticator {
    config: AuthConfig,
    verifier: Arc<dyn SignatureVerifier>,
}

impl RequestAuthenticator {
    /// Authenticator backed by secp256k1 recovery.
    pub fn new(config: AuthConfig) -> Self {
        Self::with_verifier(config, Arc::new(Secp256k1Verifier))
    }

    pub fn with_verifier(config: AuthConfig, verifier: Arc<dyn SignatureVerifier>) -> Self {
        Self { config, verifier }
    }

    /// The message a caller has to sign for `timestamp`.
    pub fn message_for(&self, timestamp: u64) -> String {
        canonical_message(
            &self.config.signature_prefix,
            &self.config.signer_label,
            timestamp,
        )
    }

    /// Verify `request` against server time `now_secs`.
    pub fn authenticate(
        &self,
        request: &SignedRequest,
        now_secs: u64,
    ) -> Result<VerifiedCaller, AuthError> {
        let window = self.config.freshness_window_secs;
        let timestamp = request.timestamp();

        if window >= timestamp {
            warn!(
                window_secs = window,
                timestamp, "Freshness window is larger than the request timestamp"
            );
        }

        let hash = keccak256(self.message_for(timestamp).as_bytes());
        let signer = self.verifier.recover(&hash, request.signature())?;

        if &signer != request.address() {
            debug!(
                claimed = %request.address(),
                recovered = %signer,
                "Signature does not match claimed address"
            );
            return Err(AuthError::SignerMismatch);
        }

        let skew_secs = now_secs.abs_diff(timestamp);
        if skew_secs > window {
            debug!(
                address = %request.address(),
                skew_secs,
                window_secs = window,
                "Request timestamp outside freshness window"
            );
            return Err(AuthError::TimestampOutOfSync { skew_secs });
        }

        Ok(VerifiedCaller { address: signer })
    }
}

impl std::fmt::Debug for RequestAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestAuthenticator")
            .field("signer_label", &self.config.signer_label)
            .field("freshness_window_secs", &self.config.freshness_window_secs)
            .finish()
    }
}
