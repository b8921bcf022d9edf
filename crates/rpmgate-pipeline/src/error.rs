//! Pipeline error type.

use rpmgate_core::{BuildError, Classify, ConfigError, ErrorClass, RenderError, SessionError};
use rpmgate_state::{AnnexError, RepoError};

/// Everything that can end a branch early.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Render(#[from] RenderError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Repository(#[from] RepoError),

    #[error(transparent)]
    Annex(#[from] AnnexError),

    #[error("guest preparation failed: {0}")]
    Prepare(String),

    #[error("validation failed: {}", .0.join(", "))]
    ValidationFailed(Vec<String>),

    #[error("validation could not complete: {}", .0.join(", "))]
    ValidationIncomplete(Vec<String>),

    #[error("transaction {transaction_id} rejected: {}", .reasons.join("; "))]
    Rejected {
        transaction_id: u64,
        reasons: Vec<String>,
    },

    #[error("cancelled")]
    Cancelled,

    #[error("worker task failed: {0}")]
    Join(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Classify for PipelineError {
    fn class(&self) -> ErrorClass {
        match self {
            PipelineError::Config(e) => e.class(),
            PipelineError::Render(e) => e.class(),
            PipelineError::Session(e) => e.class(),
            PipelineError::Build(e) => e.class(),
            PipelineError::Repository(e) => e.class(),
            PipelineError::Annex(e) => e.class(),
            PipelineError::ValidationFailed(_) => ErrorClass::Validation,
            PipelineError::Rejected { .. } => ErrorClass::Repository,
            PipelineError::Prepare(_)
            | PipelineError::ValidationIncomplete(_)
            | PipelineError::Cancelled
            | PipelineError::Join(_)
            | PipelineError::Io(_) => ErrorClass::Infrastructure,
        }
    }
}

/// Result type for pipeline operations.
pub type PipelineResult<T> = std::result::Result<T, PipelineError>;
