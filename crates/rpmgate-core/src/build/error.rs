//! Error types for the build executor.

use crate::domain::{Arch, Classify, DomainError, ErrorClass, PackageKey};
use crate::render::RenderError;

/// Errors produced while building packages.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("unresolved build dependencies for {package}: {detail}")]
    DependencyUnresolved { package: String, detail: String },

    #[error("build of {package} failed: {detail}")]
    CompileFailed { package: String, detail: String },

    #[error("signing failed: {0}")]
    SignFailed(String),

    #[error("artifact {0} was already produced by an earlier build")]
    DuplicateArtifact(PackageKey),

    #[error("no free build root for {arch}")]
    RootBusy { arch: Arch },

    #[error("build root setup failed: {0}")]
    Setup(String),

    #[error("render error: {0}")]
    Render(#[from] RenderError),

    #[error("unexpected build output: {0}")]
    Output(#[from] DomainError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Classify for BuildError {
    fn class(&self) -> ErrorClass {
        match self {
            BuildError::RootBusy { .. } | BuildError::Setup(_) | BuildError::Io(_) => {
                ErrorClass::Infrastructure
            }
            BuildError::Render(_) => ErrorClass::Configuration,
            _ => ErrorClass::Build,
        }
    }
}

/// Result type for build operations.
pub type BuildResult<T> = std::result::Result<T, BuildError>;
