//! Errors for the repository store.

use rpmgate_core::{Classify, ErrorClass};

/// Errors that can occur while mutating or reading a repository.
#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    /// Metadata regeneration failed; the previous state is still published.
    #[error("metadata regeneration failed for transaction {transaction_id}: {detail}")]
    MetadataConflict { transaction_id: u64, detail: String },

    /// Stored metadata does not match what the generator produces for the
    /// current package set.
    #[error("repository {repo} generation {generation} has stale metadata")]
    Inconsistent { repo: String, generation: u64 },

    #[error("staged file missing: {0}")]
    StagedFileMissing(String),

    #[error("corrupt repository state: {0}")]
    Corrupt(String),

    #[error("metadata generator failed: {0}")]
    Generator(String),

    /// The repository actor has shut down.
    #[error("repository {0} is closed")]
    Closed(String),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Classify for RepoError {
    fn class(&self) -> ErrorClass {
        match self {
            RepoError::Closed(_) | RepoError::Io(_) => ErrorClass::Infrastructure,
            _ => ErrorClass::Repository,
        }
    }
}

pub type RepoResult<T> = std::result::Result<T, RepoError>;
