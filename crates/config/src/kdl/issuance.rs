//! Auth, certificate storage and issuer KDL parsing.

use std::path::PathBuf;

use tracing::trace;

use crate::{AuthConfig, CertificatesConfig, ConfigError, IssuerConfig};

use super::helpers::{get_bool_entry, get_string_entry, get_u64_entry, reject_unknown};

/// Parse auth configuration block
pub fn parse_auth(node: &::kdl::KdlNode) -> Result<AuthConfig, ConfigError> {
    trace!("Parsing auth configuration block");
    reject_unknown(
        node,
        &["signature-prefix", "signer-label", "freshness-window-secs"],
    )?;

    let defaults = AuthConfig::default();
    Ok(AuthConfig {
        signature_prefix: get_string_entry(node, "signature-prefix")?
            .unwrap_or(defaults.signature_prefix),
        signer_label: get_string_entry(node, "signer-label")?.unwrap_or(defaults.signer_label),
        freshness_window_secs: get_u64_entry(node, "freshness-window-secs")?
            .unwrap_or(defaults.freshness_window_secs),
    })
}

/// Parse certificates configuration block
pub fn parse_certificates(node: &::kdl::KdlNode) -> Result<CertificatesConfig, ConfigError> {
    trace!("Parsing certificates configuration block");
    reject_unknown(
        node,
        &["base-dir", "renewal-threshold-secs", "identity-key-length"],
    )?;

    let defaults = CertificatesConfig::default();
    let identity_key_length = match get_u64_entry(node, "identity-key-length")? {
        Some(v) => usize::try_from(v).map_err(|_| {
            ConfigError::invalid("certificates", "identity-key-length is too large")
        })?,
        None => defaults.identity_key_length,
    };

    let config = CertificatesConfig {
        base_dir: get_string_entry(node, "base-dir")?
            .map(PathBuf::from)
            .unwrap_or(defaults.base_dir),
        renewal_threshold_secs: get_u64_entry(node, "renewal-threshold-secs")?
            .unwrap_or(defaults.renewal_threshold_secs),
        identity_key_length,
    };

    trace!(
        base_dir = %config.base_dir.display(),
        renewal_threshold_secs = config.renewal_threshold_secs,
        "Parsed certificates configuration"
    );

    Ok(config)
}

/// Parse issuer configuration block
pub fn parse_issuer(node: &::kdl::KdlNode) -> Result<IssuerConfig, ConfigError> {
    trace!("Parsing issuer configuration block");
    reject_unknown(
        node,
        &[
            "command",
            "credentials",
            "email",
            "dns-plugin",
            "staging",
            "timeout-secs",
        ],
    )?;

    let defaults = IssuerConfig::default();
    let config = IssuerConfig {
        command: get_string_entry(node, "command")?
            .map(PathBuf::from)
            .unwrap_or(defaults.command),
        credentials: get_string_entry(node, "credentials")?.map(PathBuf::from),
        email: get_string_entry(node, "email")?.filter(|e| !e.is_empty()),
        dns_plugin: get_string_entry(node, "dns-plugin")?.unwrap_or(defaults.dns_plugin),
        staging: get_bool_entry(node, "staging")?.unwrap_or(defaults.staging),
        timeout_secs: get_u64_entry(node, "timeout-secs")?.unwrap_or(defaults.timeout_secs),
    };

    trace!(
        command = %config.command.display(),
        dns_plugin = %config.dns_plugin,
        staging = config.staging,
        has_email = config.email.is_some(),
        "Parsed issuer configuration"
    );

    Ok(config)
}
