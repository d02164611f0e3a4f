//! Filesystem and binary checks
//!
//! Validates that the storage directory, DNS credentials and issuer
//! command are usable before the first request arrives.

use std::path::Path;

use super::{ErrorCategory, ValidationError, ValidationResult, ValidationWarning};
use crate::Config;

/// Validate storage, credentials and issuer paths
pub fn validate_paths(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::new();

    let base_dir = &config.certificates.base_dir;
    if base_dir.exists() && !base_dir.is_dir() {
        result.add_error(ValidationError::new(
            ErrorCategory::Storage,
            format!("Certificate base directory is not a directory: {:?}", base_dir),
        ));
    } else if !base_dir.exists() {
        result.add_warning(ValidationWarning::new(format!(
            "Certificate base directory {:?} does not exist yet; it will be created on startup",
            base_dir
        )));
    }

    let credentials = config.credentials_path();
    if !credentials.is_file() {
        result.add_error(ValidationError::new(
            ErrorCategory::Credentials,
            format!("DNS credentials not found: {:?}", credentials),
        ));
    }

    if !command_resolves(&config.issuer.command) {
        result.add_error(ValidationError::new(
            ErrorCategory::Issuer,
            format!("Issuer command not found: {:?}", config.issuer.command),
        ));
    }

    result
}

/// Whether `command` names an existing file, directly or through `PATH`
fn command_resolves(command: &Path) -> bool {
    if command.components().count() > 1 {
        return command.is_file();
    }

    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(command).is_file()))
        .unwrap_or(false)
}
