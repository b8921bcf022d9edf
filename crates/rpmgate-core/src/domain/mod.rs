//! Domain models for rpmgate.
//!
//! - `Arch`: target architecture
//! - `Evr`: epoch/version/release with RPM ordering
//! - `PackageKey` / `BuildArtifact`: package identity and build output
//! - `ErrorClass`: failure taxonomy shared by every subsystem

pub mod arch;
pub mod artifact;
pub mod error;
pub mod evr;

pub use arch::Arch;
pub use artifact::{ArtifactSet, BuildArtifact, PackageKey, SigningState};
pub use error::{Classify, DomainError, ErrorClass};
pub use evr::{rpmvercmp, Evr};
