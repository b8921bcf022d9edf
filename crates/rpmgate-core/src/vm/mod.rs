//! Virtual machine sessions.
//!
//! A [`VmSession`] owns one guest from boot to teardown. Session names are
//! reserved in a [`SessionRegistry`]; the guest itself comes from a
//! [`Hypervisor`] ([`QemuHypervisor`] in production).

pub mod descriptor;
pub mod error;
pub mod guest;
pub mod qemu;
pub mod registry;
pub mod session;
pub mod state;

pub use descriptor::{CloudInitSeed, FsTransport, SharedMount, VmDescriptor};
pub use error::{SessionError, SessionResult};
pub use guest::{ExecOutput, GuestHandle, Hypervisor};
pub use qemu::{QemuHypervisor, QemuOptions};
pub use registry::{NameLease, SessionRegistry};
pub use session::VmSession;
pub use state::SessionState;
