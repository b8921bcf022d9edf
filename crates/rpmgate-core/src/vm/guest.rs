//! Hypervisor and guest abstractions.
//!
//! [`Hypervisor`] launches guest processes; [`GuestHandle`] drives one of
//! them. The QEMU implementation lives in [`super::qemu`]; deterministic fakes
//! live in [`crate::fakes`].

use async_trait::async_trait;

use super::descriptor::{FsTransport, SharedMount, VmDescriptor};
use super::error::SessionResult;

/// Output of one command run in the guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i32,
    /// Combined stdout and stderr.
    pub output: String,
}

/// Starts guest processes.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Start a guest for `descriptor`. Returns once the process exists and the
    /// console is attached; the guest is not yet ready.
    async fn launch(&self, descriptor: &VmDescriptor) -> SessionResult<Box<dyn GuestHandle>>;
}

/// Control channel to one running guest.
#[async_trait]
pub trait GuestHandle: Send {
    /// Next chunk of console output. `None` once the console has closed.
    async fn read_console(&mut self) -> SessionResult<Option<String>>;

    /// Whether the guest process is still running.
    fn is_alive(&mut self) -> bool;

    /// Shared-filesystem transports the guest kernel can mount.
    async fn supported_transports(&mut self) -> SessionResult<Vec<FsTransport>>;

    async fn mount(&mut self, mount: &SharedMount) -> SessionResult<()>;

    /// Run a shell script in the guest and wait for it.
    ///
    /// Fails with `GuestUnreachable` when the command channel is down; a
    /// script that runs and exits non-zero is `Ok`.
    async fn exec(&mut self, script: &str) -> SessionResult<ExecOutput>;

    /// Ask the guest to power off. Does not wait.
    async fn request_poweroff(&mut self) -> SessionResult<()>;

    /// Wait for the guest process to exit.
    async fn wait_exit(&mut self) -> SessionResult<()>;

    /// Terminate the guest process and its helpers, and reap them.
    async fn kill(&mut self) -> SessionResult<()>;

    /// Start terminating without waiting. Used from `Drop`.
    fn kill_now(&mut self);
}
