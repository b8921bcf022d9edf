use rpmgate_core::{Classify, ErrorClass};

/// Errors from the artifact annex.
#[derive(Debug, thiserror::Error)]
pub enum AnnexError {
    #[error("no annex object {0}")]
    NotFound(String),

    #[error("annex object {digest} is corrupt: {detail}")]
    Corrupt { digest: String, detail: String },

    #[error("backup selection matched no entries")]
    EmptySelection,

    #[error("backup archive {0} is missing; refusing to purge")]
    NotBackedUp(String),

    #[error("invalid backup archive {archive}: {detail}")]
    BadArchive { archive: String, detail: String },

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Classify for AnnexError {
    fn class(&self) -> ErrorClass {
        match self {
            AnnexError::Io(_) => ErrorClass::Infrastructure,
            AnnexError::EmptySelection => ErrorClass::Configuration,
            _ => ErrorClass::Repository,
        }
    }
}

pub type AnnexResult<T> = std::result::Result<T, AnnexError>;
