//! Server, rate-limit and logging KDL parsing.

use tracing::trace;

use crate::{ConfigError, LogFormat, LoggingConfig, RateLimitConfig, ServerConfig};

use super::helpers::{get_bool_entry, get_string_entry, get_u64_entry, reject_unknown};

/// Parse server configuration block
pub fn parse_server(node: &::kdl::KdlNode) -> Result<ServerConfig, ConfigError> {
    trace!("Parsing server configuration block");
    reject_unknown(node, &["listen", "max-csr-bytes"])?;

    let defaults = ServerConfig::default();
    let max_csr_bytes = match get_u64_entry(node, "max-csr-bytes")? {
        Some(v) => usize::try_from(v)
            .map_err(|_| ConfigError::invalid("server", "max-csr-bytes is too large"))?,
        None => defaults.max_csr_bytes,
    };

    let config = ServerConfig {
        listen: get_string_entry(node, "listen")?.unwrap_or(defaults.listen),
        max_csr_bytes,
    };

    trace!(
        listen = %config.listen,
        max_csr_bytes = config.max_csr_bytes,
        "Parsed server configuration"
    );

    Ok(config)
}

/// Parse rate-limit configuration block
pub fn parse_rate_limit(node: &::kdl::KdlNode) -> Result<RateLimitConfig, ConfigError> {
    trace!("Parsing rate-limit configuration block");
    reject_unknown(node, &["enabled", "window-secs", "max-requests"])?;

    let defaults = RateLimitConfig::default();
    let max_requests = match get_u64_entry(node, "max-requests")? {
        Some(v) => u32::try_from(v)
            .map_err(|_| ConfigError::invalid("rate-limit", "max-requests is too large"))?,
        None => defaults.max_requests,
    };

    Ok(RateLimitConfig {
        enabled: get_bool_entry(node, "enabled")?.unwrap_or(defaults.enabled),
        window_secs: get_u64_entry(node, "window-secs")?.unwrap_or(defaults.window_secs),
        max_requests,
    })
}

/// Parse logging configuration block
pub fn parse_logging(node: &::kdl::KdlNode) -> Result<LoggingConfig, ConfigError> {
    trace!("Parsing logging configuration block");
    reject_unknown(node, &["level", "format"])?;

    let defaults = LoggingConfig::default();
    let format = match get_string_entry(node, "format")? {
        None => defaults.format,
        Some(s) => match s.to_lowercase().as_str() {
            "json" => LogFormat::Json,
            "pretty" => LogFormat::Pretty,
            other => {
                return Err(ConfigError::invalid(
                    "logging",
                    format!("invalid format '{other}'. Valid formats: json, pretty"),
                ));
            }
        },
    };

    Ok(LoggingConfig {
        level: get_string_entry(node, "level")?.unwrap_or(defaults.level),
        format,
    })
}
