//! Serve-or-reissue decision.

use std::time::Duration;

/// What to do with an identity's stored certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewalDecision {
    ServeCached,
    Reissue,
}

/// Decide from the certificate's age.
///
/// Reissue when there is no certificate, when it is at least `threshold`
/// old, or when the caller forces it.
pub fn decide(age: Option<Duration>, threshold: Duration, force: bool) -> RenewalDecision {
    match age {
        _ if force => RenewalDecision::Reissue,
        None => RenewalDecision::Reissue,
        Some(age) if age >= threshold => RenewalDecision::Reissue,
        Some(_) => RenewalDecision::ServeCached,
    }
}
