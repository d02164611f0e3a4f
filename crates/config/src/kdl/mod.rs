//! KDL document parsing.
//!
//! Each top-level block is handled by its own parser; unknown blocks and
//! unknown fields are rejected so typos don't silently fall back to
//! defaults.

mod helpers;
mod issuance;
mod server;

use ::kdl::KdlDocument;
use tracing::trace;

use crate::{Config, ConfigError};

/// Parse a complete configuration document.
pub(crate) fn parse_document(text: &str) -> Result<Config, ConfigError> {
    let doc: KdlDocument = text.parse().map_err(|err: ::kdl::KdlError| {
        ConfigError::Syntax(format!("{:?}", miette::Report::new(err)))
    })?;

    let mut config = Config::default();

    for node in doc.nodes() {
        let name = node.name().value();
        trace!(block = %name, "Parsing configuration block");

        match name {
            "server" => config.server = server::parse_server(node)?,
            "rate-limit" => config.rate_limit = server::parse_rate_limit(node)?,
            "logging" => config.logging = server::parse_logging(node)?,
            "auth" => config.auth = issuance::parse_auth(node)?,
            "certificates" => config.certificates = issuance::parse_certificates(node)?,
            "issuer" => config.issuer = issuance::parse_issuer(node)?,
            other => {
                return Err(ConfigError::invalid(
                    other,
                    "unknown block; expected one of server, auth, certificates, issuer, rate-limit, logging",
                ));
            }
        }
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LogFormat;
    use std::path::PathBuf;

    #[test]
    fn test_empty_document_is_default() {
        assert_eq!(parse_document("").unwrap(), Config::default());
    }

    #[test]
    fn test_full_document() {
        let config = parse_document(
            r#"
            server {
                listen "127.0.0.1:5000"
                max-csr-bytes 4096
            }
            auth {
                signer-label "certs.example.eth"
                freshness-window-secs 120
            }
            certificates {
                base-dir "/var/lib/certgate"
                renewal-threshold-secs 86400
                identity-key-length 20
            }
            issuer {
                command "/usr/local/bin/certbot"
                credentials "/run/secrets/rfc2136.ini"
                email "ops@example.com"
                dns-plugin "cloudflare"
                staging #true
                timeout-secs 300
            }
            rate-limit {
                enabled #false
            }
            logging {
                level "debug"
                format "pretty"
            }
            "#,
        )
        .unwrap();

        assert_eq!(config.server.listen, "127.0.0.1:5000");
        assert_eq!(config.server.max_csr_bytes, 4096);
        assert_eq!(config.auth.signer_label, "certs.example.eth");
        assert_eq!(config.auth.freshness_window_secs, 120);
        assert_eq!(config.certificates.base_dir, PathBuf::from("/var/lib/certgate"));
        assert_eq!(config.certificates.renewal_threshold_secs, 86_400);
        assert_eq!(config.certificates.identity_key_length, 20);
        assert_eq!(config.issuer.command, PathBuf::from("/usr/local/bin/certbot"));
        assert_eq!(config.issuer.email.as_deref(), Some("ops@example.com"));
        assert_eq!(config.issuer.dns_plugin, "cloudflare");
        assert!(config.issuer.staging);
        assert_eq!(config.issuer.timeout_secs, 300);
        assert!(!config.rate_limit.enabled);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, LogFormat::Pretty);
    }

    #[test]
    fn test_unknown_block_rejected() {
        let err = parse_document("upstreams {\n}\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref block, .. } if block == "upstreams"));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let err = parse_document("server {\n    listne \"0.0.0.0:1\"\n}\n").unwrap_err();
        assert!(err.to_string().contains("listne"));
    }

    #[test]
    fn test_wrong_type_rejected() {
        let err = parse_document("auth {\n    freshness-window-secs \"ten\"\n}\n").unwrap_err();
        assert!(err.to_string().contains("freshness-window-secs"));
    }

    #[test]
    fn test_syntax_error() {
        let err = parse_document("server {").unwrap_err();
        assert!(matches!(err, ConfigError::Syntax(_)));
    }
}
