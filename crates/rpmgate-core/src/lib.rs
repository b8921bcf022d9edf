//! rpmgate core library
//!
//! Domain model, configuration, document rendering, VM sessions, the test
//! runner and the build executor. Repository and annex state live in
//! `rpmgate-state`; the end-to-end coordinator in `rpmgate-pipeline`.

pub mod build;
pub mod config;
pub mod domain;
pub mod fakes;
pub mod obs;
pub mod render;
pub mod telemetry;
pub mod testing;
pub mod vm;

pub use build::{
    BuildError, BuildExecutor, BuildResult, BuildRoot, BuildRootProvider, MockProvider,
    PackageSpec, RpmSigner, Signer,
};
pub use config::{ConfigError, ConfigResult, ProjectConfig, RepoConfig};
pub use domain::{
    Arch, ArtifactSet, BuildArtifact, Classify, DomainError, ErrorClass, Evr, PackageKey,
    SigningState,
};
pub use render::{ProxyConfig, RenderContext, RenderError};
pub use testing::{GuestCommand, TestOutcome, TestReport, TestResult, TestRunner, TestSuite};
pub use vm::{
    FsTransport, Hypervisor, QemuHypervisor, QemuOptions, SessionError, SessionRegistry,
    SessionResult, SessionState, SharedMount, VmDescriptor, VmSession,
};
