//! rpmgate pipeline - build, validate, publish
//!
//! Fans a [`BuildRequest`] out over its target architectures. Each branch:
//! - builds every package in a clean build root
//! - validates the result in a fresh guest against a private staging repo
//! - commits to the live repository only if every suite passed
//! - archives the published artifacts in the annex
//!
//! Branches succeed or fail independently; a request can partially succeed.

pub mod coordinator;
pub mod error;
pub mod request;
pub mod state;

pub use coordinator::{Coordinator, RequestHandle};
pub use error::{PipelineError, PipelineResult};
pub use request::{BranchOutcome, BuildRequest, ProgressEvent, RequestOutcome, RequestStatus};
pub use state::BranchState;
