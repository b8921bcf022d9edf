//! rpmgate-state: on-disk state for rpmgate
//!
//! - [`repository`]: per-architecture YUM repositories. Each
//!   (repository, arch) pair has a single writer actor that publishes
//!   generations atomically and keeps an append-only transaction history.
//! - [`annex`]: content-addressed archive of build outputs with tar.gz
//!   backup, restore and purge.

pub mod annex;
pub mod fakes;
pub mod repository;

pub use annex::{Annex, AnnexEntry, AnnexError, AnnexListing, AnnexResult, BackupManifest, BackupSelector};
pub use repository::{
    ChangeOp, CommitResult, CreaterepoGenerator, History, IndexGenerator, MetadataGenerator,
    PublishGuard, RepoError, RepoResult, RepoSnapshot, RepositoryHandle, RepositoryStore,
    RetentionPolicy, StagedChange, Transaction, TransactionOutcome,
};
