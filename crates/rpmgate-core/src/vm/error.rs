//! Error types for VM sessions.

use std::path::PathBuf;

use crate::domain::{Classify, ErrorClass};

use super::state::SessionState;
use super::FsTransport;

/// Errors produced by the VM session layer.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("VM {name} is already running")]
    AlreadyRunning { name: String },

    #[error("VM {name} did not become ready within {waited_secs}s")]
    BootTimeout { name: String, waited_secs: u64 },

    #[error("VM image not found: {0}")]
    ImageNotFound(PathBuf),

    #[error("guest kernel does not support {transport} for share {tag}")]
    TransportUnsupported { transport: FsTransport, tag: String },

    #[error("mounting share {tag} failed (exit {exit_code}): {output}")]
    MountFailed { tag: String, exit_code: i32, output: String },

    #[error("share {0} was not declared when the VM was launched")]
    UndeclaredMount(String),

    #[error("command {command_id} timed out after {limit_ms}ms")]
    Timeout { command_id: String, limit_ms: u64 },

    #[error("guest unreachable: {0}")]
    GuestUnreachable(String),

    #[error("VM {name} did not shut down within {waited_secs}s and was killed")]
    ShutdownTimeout { name: String, waited_secs: u64 },

    #[error("invalid session transition {from:?} -> {to:?}")]
    InvalidTransition { from: SessionState, to: SessionState },

    #[error("failed to launch VM: {0}")]
    Launch(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Classify for SessionError {
    fn class(&self) -> ErrorClass {
        match self {
            SessionError::ImageNotFound(_)
            | SessionError::TransportUnsupported { .. }
            | SessionError::UndeclaredMount(_) => ErrorClass::Configuration,
            _ => ErrorClass::Infrastructure,
        }
    }
}

/// Result type for session operations.
pub type SessionResult<T> = std::result::Result<T, SessionError>;
