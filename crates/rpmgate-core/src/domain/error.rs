//! Domain-level error taxonomy for rpmgate.

use serde::{Deserialize, Serialize};

/// The five failure classes the pipeline reacts to.
///
/// Retry policy is keyed on this class: only `Infrastructure` failures are
/// retried, and only with a fresh VM session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Bad template variable, unresolved image, invalid config. Never retried.
    Configuration,
    /// Boot timeout, unreachable guest, name collision, busy build root.
    Infrastructure,
    /// Dependency resolution, compilation or signing failure.
    Build,
    /// A test suite ran and failed.
    Validation,
    /// Metadata regeneration or commit failure.
    Repository,
}

impl ErrorClass {
    /// Whether the coordinator may retry a branch that failed with this class.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorClass::Infrastructure)
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorClass::Configuration => "configuration",
            ErrorClass::Infrastructure => "infrastructure",
            ErrorClass::Build => "build",
            ErrorClass::Validation => "validation",
            ErrorClass::Repository => "repository",
        };
        f.write_str(s)
    }
}

/// Implemented by every subsystem error so callers can route on class.
pub trait Classify {
    fn class(&self) -> ErrorClass;
}

/// Errors from parsing domain values.
#[derive(Debug, thiserror::Error)]
pub enum DomainError {
    #[error("unknown architecture: {0}")]
    UnknownArch(String),

    #[error("invalid epoch/version/release: {0}")]
    InvalidEvr(String),

    #[error("not an rpm file name: {0}")]
    InvalidRpmName(String),
}

impl Classify for DomainError {
    fn class(&self) -> ErrorClass {
        ErrorClass::Configuration
    }
}

/// Result type for domain parsing.
pub type Result<T> = std::result::Result<T, DomainError>;
