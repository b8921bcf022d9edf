//! Package builds in isolated build roots.

pub mod error;
pub mod executor;
pub mod mock;
pub mod root;
pub mod signer;

pub use error::{BuildError, BuildResult};
pub use executor::BuildExecutor;
pub use mock::{MockBuildRoot, MockProvider};
pub use root::{BuildRoot, BuildRootProvider, PackageSpec, RootLease, RootSlots};
pub use signer::{RpmSigner, Signer};
