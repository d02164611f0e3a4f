//! Runtime validation of a parsed configuration.
//!
//! [`Config::validate`](crate::Config::validate) rejects documents that are
//! structurally unusable. The checks here look at the environment the
//! service will run in (directories, credentials, issuer binary) and at
//! settings that are legal but probably unintended. They back the
//! `certgate test` command.

mod lint;
mod paths;

use std::fmt;

use crate::Config;

pub use lint::lint_config;
pub use paths::validate_paths;

/// Category of a validation error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Storage,
    Credentials,
    Issuer,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Storage => write!(f, "storage"),
            ErrorCategory::Credentials => write!(f, "credentials"),
            ErrorCategory::Issuer => write!(f, "issuer"),
        }
    }
}

/// A problem that will make issuance fail
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub category: ErrorCategory,
    pub message: String,
}

impl ValidationError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.category, self.message)
    }
}

/// A setting that is legal but likely unintended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationWarning {
    pub message: String,
}

impl ValidationWarning {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Accumulated errors and warnings
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<ValidationWarning>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_error(&mut self, error: ValidationError) {
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: ValidationWarning) {
        self.warnings.push(warning);
    }

    pub fn merge(&mut self, other: ValidationResult) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }

    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Run every runtime check.
pub fn validate_runtime(config: &Config) -> ValidationResult {
    let mut result = validate_paths(config);
    result.merge(lint_config(config));
    result
}
