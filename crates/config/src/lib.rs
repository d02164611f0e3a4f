//! Configuration for certgate.
//!
//! The service is configured from a single KDL document. Every block and
//! every field is optional; anything left out falls back to the defaults
//! below, which match the public dyndns deployment.
//!
//! ```kdl
//! server {
//!     listen "0.0.0.0:5000"
//!     max-csr-bytes 10240
//! }
//!
//! auth {
//!     signer-label "https-portal.dnp.dappnode.eth"
//!     freshness-window-secs 600
//! }
//!
//! certificates {
//!     base-dir "/etc/letsencrypt"
//!     renewal-threshold-secs 6480000
//!     identity-key-length 16
//! }
//!
//! issuer {
//!     command "certbot"
//!     credentials "/etc/letsencrypt/creds.ini"
//!     email "ops@example.com"
//!     dns-plugin "rfc2136"
//!     staging #false
//!     timeout-secs 600
//! }
//!
//! rate-limit {
//!     window-secs 3600
//!     max-requests 5
//! }
//!
//! logging {
//!     level "info"
//!     format "json"
//! }
//! ```
//!
//! The configuration is built once at startup and handed to each component
//! constructor; nothing below `main` reads the environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

mod kdl;
pub mod validate;

pub use validate::{ErrorCategory, ValidationError, ValidationResult, ValidationWarning};

// ============================================================================
// Defaults
// ============================================================================

const MINUTE: u64 = 60;
const DAY: u64 = 24 * 60 * MINUTE;

/// Prefix mixed into every signed message so a signature can't be replayed
/// against another protocol.
pub const DEFAULT_SIGNATURE_PREFIX: &str = "\x1dDappnode Signed Message:";
/// Label identifying this service inside the signed message.
pub const DEFAULT_SIGNER_LABEL: &str = "https-portal.dnp.dappnode.eth";
pub const DEFAULT_FRESHNESS_WINDOW_SECS: u64 = 10 * MINUTE;
pub const DEFAULT_RENEWAL_THRESHOLD_SECS: u64 = 75 * DAY;
pub const DEFAULT_BASE_DIR: &str = "/etc/letsencrypt";
pub const DEFAULT_LISTEN: &str = "0.0.0.0:5000";
pub const DEFAULT_MAX_CSR_BYTES: usize = 10 * 1024;
pub const DEFAULT_IDENTITY_KEY_LENGTH: usize = 16;
pub const DEFAULT_ISSUER_COMMAND: &str = "certbot";
pub const DEFAULT_DNS_PLUGIN: &str = "rfc2136";
pub const DEFAULT_ISSUANCE_TIMEOUT_SECS: u64 = 10 * MINUTE;
pub const DEFAULT_RATE_LIMIT_WINDOW_SECS: u64 = 60 * MINUTE;
pub const DEFAULT_RATE_LIMIT_MAX_REQUESTS: u32 = 5;

/// File name of the DNS credentials file when none is configured.
const DEFAULT_CREDENTIALS_FILE: &str = "creds.ini";

// ============================================================================
// Errors
// ============================================================================

/// Configuration loading and validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse KDL:\n{0}")]
    Syntax(String),

    #[error("invalid config in '{block}': {message}")]
    Invalid { block: String, message: String },
}

impl ConfigError {
    pub(crate) fn invalid(block: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Invalid {
            block: block.into(),
            message: message.into(),
        }
    }
}

// ============================================================================
// Configuration types
// ============================================================================

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Config {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub certificates: CertificatesConfig,
    pub issuer: IssuerConfig,
    pub rate_limit: RateLimitConfig,
    pub logging: LoggingConfig,
}

/// HTTP listener settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Socket address to bind, e.g. `0.0.0.0:5000`
    pub listen: String,
    /// Upper bound on an uploaded CSR
    pub max_csr_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN.to_string(),
            max_csr_bytes: DEFAULT_MAX_CSR_BYTES,
        }
    }
}

/// Signed-request verification settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthConfig {
    pub signature_prefix: String,
    pub signer_label: String,
    /// Maximum allowed skew between the request timestamp and server time
    pub freshness_window_secs: u64,
}

impl AuthConfig {
    pub fn freshness_window(&self) -> Duration {
        Duration::from_secs(self.freshness_window_secs)
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            signature_prefix: DEFAULT_SIGNATURE_PREFIX.to_string(),
            signer_label: DEFAULT_SIGNER_LABEL.to_string(),
            freshness_window_secs: DEFAULT_FRESHNESS_WINDOW_SECS,
        }
    }
}

/// Per-identity certificate storage settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificatesConfig {
    /// Directory holding one subdirectory per identity key
    pub base_dir: PathBuf,
    /// Age after which a stored fullchain is reissued
    pub renewal_threshold_secs: u64,
    /// Hex digits of the address kept in the identity key
    pub identity_key_length: usize,
}

impl CertificatesConfig {
    pub fn renewal_threshold(&self) -> Duration {
        Duration::from_secs(self.renewal_threshold_secs)
    }
}

impl Default for CertificatesConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from(DEFAULT_BASE_DIR),
            renewal_threshold_secs: DEFAULT_RENEWAL_THRESHOLD_SECS,
            identity_key_length: DEFAULT_IDENTITY_KEY_LENGTH,
        }
    }
}

/// External issuance tool settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuerConfig {
    /// Executable to run (looked up on `PATH` if not absolute)
    pub command: PathBuf,
    /// DNS challenge credentials; defaults to `<base-dir>/creds.ini`
    pub credentials: Option<PathBuf>,
    /// ACME contact address; registration is done without one if unset
    pub email: Option<String>,
    /// DNS authenticator plugin name, e.g. `rfc2136`
    pub dns_plugin: String,
    /// Issue against the CA's staging environment
    pub staging: bool,
    pub timeout_secs: u64,
}

impl IssuerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for IssuerConfig {
    fn default() -> Self {
        Self {
            command: PathBuf::from(DEFAULT_ISSUER_COMMAND),
            credentials: None,
            email: None,
            dns_plugin: DEFAULT_DNS_PLUGIN.to_string(),
            staging: false,
            timeout_secs: DEFAULT_ISSUANCE_TIMEOUT_SECS,
        }
    }
}

/// Fixed-window, per-client request limiting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub window_secs: u64,
    pub max_requests: u32,
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_secs: DEFAULT_RATE_LIMIT_WINDOW_SECS,
            max_requests: DEFAULT_RATE_LIMIT_MAX_REQUESTS,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Json,
        }
    }
}

// ============================================================================
// Loading
// ============================================================================

impl Config {
    /// Load and validate configuration from a KDL file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        debug!(path = %path.display(), bytes = text.len(), "Read configuration file");
        Self::from_kdl_str(&text)
    }

    /// Parse and validate configuration from KDL text.
    pub fn from_kdl_str(text: &str) -> Result<Self, ConfigError> {
        let config = kdl::parse_document(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Check structural invariants that make the service unusable if broken.
    ///
    /// Environmental problems (missing credentials file and the like) are
    /// reported separately by [`validate::validate_runtime`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.listen.trim().is_empty() {
            return Err(ConfigError::invalid("server", "listen must not be empty"));
        }
        if self.server.max_csr_bytes == 0 {
            return Err(ConfigError::invalid("server", "max-csr-bytes must be positive"));
        }
        if self.auth.freshness_window_secs == 0 {
            return Err(ConfigError::invalid(
                "auth",
                "freshness-window-secs must be positive",
            ));
        }
        if self.auth.signer_label.contains('\n') || self.auth.signature_prefix.contains('\n') {
            return Err(ConfigError::invalid(
                "auth",
                "signer-label and signature-prefix must not contain newlines",
            ));
        }
        if self.certificates.renewal_threshold_secs == 0 {
            return Err(ConfigError::invalid(
                "certificates",
                "renewal-threshold-secs must be positive",
            ));
        }
        if !(1..=40).contains(&self.certificates.identity_key_length) {
            return Err(ConfigError::invalid(
                "certificates",
                "identity-key-length must be between 1 and 40",
            ));
        }
        if self.issuer.command.as_os_str().is_empty() {
            return Err(ConfigError::invalid("issuer", "command must not be empty"));
        }
        if self.issuer.dns_plugin.is_empty()
            || !self
                .issuer
                .dns_plugin
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(ConfigError::invalid(
                "issuer",
                "dns-plugin must be a plain plugin name",
            ));
        }
        if let Some(email) = &self.issuer.email {
            if !email.contains('@') || email.starts_with('-') {
                return Err(ConfigError::invalid(
                    "issuer",
                    format!("email '{email}' is not an address"),
                ));
            }
        }
        if self.issuer.timeout_secs == 0 {
            return Err(ConfigError::invalid("issuer", "timeout-secs must be positive"));
        }
        if self.rate_limit.enabled
            && (self.rate_limit.window_secs == 0 || self.rate_limit.max_requests == 0)
        {
            return Err(ConfigError::invalid(
                "rate-limit",
                "window-secs and max-requests must be positive when enabled",
            ));
        }
        Ok(())
    }

    /// DNS credentials path, falling back to `<base-dir>/creds.ini`.
    pub fn credentials_path(&self) -> PathBuf {
        self.issuer
            .credentials
            .clone()
            .unwrap_or_else(|| self.certificates.base_dir.join(DEFAULT_CREDENTIALS_FILE))
    }
}
