//! Configuration linting
//!
//! Flags settings that are accepted but rarely what an operator wants.

use super::{ValidationResult, ValidationWarning};
use crate::Config;

/// Signed timestamps older than this are a replay risk worth flagging.
const LONG_FRESHNESS_WINDOW_SECS: u64 = 60 * 60;

/// Let's Encrypt certificates last 90 days.
const CERTIFICATE_LIFETIME_SECS: u64 = 90 * 24 * 60 * 60;

/// Lint configuration for likely mistakes
pub fn lint_config(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::new();

    if config.auth.freshness_window_secs > LONG_FRESHNESS_WINDOW_SECS {
        result.add_warning(ValidationWarning::new(format!(
            "Freshness window of {}s lets a captured signature be replayed for over an hour",
            config.auth.freshness_window_secs
        )));
    }

    if config.certificates.renewal_threshold_secs >= CERTIFICATE_LIFETIME_SECS {
        result.add_warning(ValidationWarning::new(format!(
            "Renewal threshold of {}s is not shorter than the 90 day certificate lifetime; \
             expired certificates will be served from cache",
            config.certificates.renewal_threshold_secs
        )));
    }

    if config.issuer.email.is_none() && !config.issuer.staging {
        result.add_warning(ValidationWarning::new(
            "No issuer email configured; expiry notices from the CA will not be delivered",
        ));
    }

    if !config.rate_limit.enabled {
        result.add_warning(ValidationWarning::new(
            "Rate limiting is disabled (recommended for public deployments)",
        ));
    }

    result
}
