//! Per-architecture YUM repositories with atomic, versioned metadata.

mod actor;
pub mod error;
pub mod generator;
mod handle;
pub mod history;
pub mod model;

pub use error::{RepoError, RepoResult};
pub use generator::{CreaterepoGenerator, IndexGenerator, MetadataGenerator};
pub use handle::{PublishGuard, RepositoryHandle, RepositoryStore};
pub use history::{History, HistoryIter};
pub use model::{
    ChangeAction, ChangeOp, ChangeRecord, CommitResult, LivePackage, RepoSnapshot,
    RetentionPolicy, StagedChange, Transaction, TransactionOutcome,
};
