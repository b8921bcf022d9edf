//! Build executor: one clean build per invocation.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::config::RepoConfig;
use crate::domain::{Arch, ArtifactSet, BuildArtifact, PackageKey};

use super::error::{BuildError, BuildResult};
use super::root::{BuildRoot, BuildRootProvider, PackageSpec, RootSlots};
use super::signer::Signer;

/// Builds packages in isolated roots and hands back immutable artifacts.
///
/// Every build starts from a reset root. On any failure the output directory
/// of that build is removed, so no partial artifact outlives the call.
/// Each (name, version, release, arch) tuple is produced at most once per
/// executor. `noarch` packages count once per target architecture, since
/// every arch's repository carries its own copy.
pub struct BuildExecutor {
    provider: Arc<dyn BuildRootProvider>,
    signer: Option<Arc<dyn Signer>>,
    slots: RootSlots,
    output_root: PathBuf,
    produced: Mutex<HashSet<(PackageKey, Arch)>>,
}

impl BuildExecutor {
    pub fn new(provider: Arc<dyn BuildRootProvider>, output_root: impl Into<PathBuf>, roots_per_arch: usize) -> Self {
        Self {
            provider,
            signer: None,
            slots: RootSlots::new(roots_per_arch),
            output_root: output_root.into(),
            produced: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_signer(mut self, signer: Arc<dyn Signer>) -> Self {
        self.signer = Some(signer);
        self
    }

    /// Build `spec` for `arch`, resolving dependencies from `repos` only.
    #[instrument(skip(self, spec, arch, repos), fields(package = %spec.name, arch = %arch))]
    pub async fn build(&self, spec: &PackageSpec, arch: &Arch, repos: &[RepoConfig]) -> BuildResult<ArtifactSet> {
        let lease = self.slots.acquire(arch)?;
        let build_id = format!("{}-{}-{}", spec.name, arch, Uuid::new_v4().simple());
        let outdir = self.output_root.join(&build_id);

        let mut root = self.provider.create(arch, lease.slot(), repos)?;
        root.reset().await?;
        tokio::fs::create_dir_all(&outdir).await?;
        let mut guard = OutputGuard::new(&outdir);

        let result = async {
            let files = root.build(spec, &outdir).await?;
            let set = collect(root.as_mut(), &build_id, &spec.name, arch, &files).await?;
            self.sign_all(set).await
        }
        .await;

        let set = match result {
            Ok(set) => set,
            Err(e) => {
                warn!(build_id = %build_id, error = %e, "build failed; discarding output");
                drop(guard);
                if let Err(reset) = root.reset().await {
                    warn!(build_id = %build_id, error = %reset, "build root reset after failure failed");
                }
                return Err(e);
            }
        };

        self.register(&set, arch)?;
        guard.keep();

        info!(
            build_id = %build_id,
            binaries = set.binaries.len(),
            signed = set.iter().all(BuildArtifact::is_signed),
            "build succeeded"
        );
        Ok(set)
    }

    /// Remove the output directory of a finished build once its artifacts
    /// have been published and archived, or abandoned.
    pub async fn release(&self, set: &ArtifactSet) {
        let dir = self.output_root.join(&set.build_id);
        if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(dir = %dir.display(), error = %e, "failed to release build output");
            }
        }
    }

    async fn sign_all(&self, set: ArtifactSet) -> BuildResult<ArtifactSet> {
        let Some(signer) = &self.signer else {
            return Ok(set);
        };
        let source = match set.source {
            Some(a) => Some(signer.sign(a).await?),
            None => None,
        };
        let mut binaries = Vec::with_capacity(set.binaries.len());
        for artifact in set.binaries {
            binaries.push(signer.sign(artifact).await?);
        }
        Ok(ArtifactSet {
            build_id: set.build_id,
            source,
            binaries,
        })
    }

    fn register(&self, set: &ArtifactSet, target: &Arch) -> BuildResult<()> {
        let mut produced = self.produced.lock().unwrap_or_else(|p| p.into_inner());
        let tuple = |a: &BuildArtifact| (a.key.clone(), target.clone());
        if let Some(dup) = set.iter().find(|a| produced.contains(&tuple(a))) {
            return Err(BuildError::DuplicateArtifact(dup.key.clone()));
        }
        produced.extend(set.iter().map(tuple));
        Ok(())
    }
}

async fn collect(
    root: &mut dyn BuildRoot,
    build_id: &str,
    package: &str,
    arch: &Arch,
    files: &[PathBuf],
) -> BuildResult<ArtifactSet> {
    let mut set = ArtifactSet {
        build_id: build_id.to_string(),
        ..ArtifactSet::default()
    };
    for file in files {
        let artifact = root.describe(file, build_id).await?;
        if artifact.is_source() {
            set.source = Some(artifact);
        } else if artifact.key.arch.installs_on(arch) {
            set.binaries.push(artifact);
        } else {
            warn!(file = %file.display(), target = %arch, "ignoring rpm for another architecture");
        }
    }
    if set.binaries.is_empty() {
        return Err(BuildError::CompileFailed {
            package: package.to_string(),
            detail: "build produced no binary rpms".into(),
        });
    }
    Ok(set)
}

/// Removes a build's output directory unless told to keep it. Also covers a
/// build future dropped mid-flight.
struct OutputGuard {
    dir: PathBuf,
    keep: bool,
}

impl OutputGuard {
    fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            keep: false,
        }
    }

    fn keep(&mut self) {
        self.keep = true;
    }
}

impl Drop for OutputGuard {
    fn drop(&mut self) {
        if self.keep {
            return;
        }
        if let Err(e) = std::fs::remove_dir_all(&self.dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(dir = %self.dir.display(), error = %e, "failed to remove build output");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{FakeBuildRoot, FakeSigner};

    fn arch() -> Arch {
        "x86_64".parse().unwrap()
    }

    fn spec() -> PackageSpec {
        PackageSpec::new("foo", "/src/foo.spec", "/src")
    }

    #[tokio::test]
    async fn builds_and_signs() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(FakeBuildRoot::new().produces("foo", "1.0", "1"));
        let exec = BuildExecutor::new(provider.clone(), dir.path(), 1)
            .with_signer(Arc::new(FakeSigner::new("KEY1")));
        let set = exec.build(&spec(), &arch(), &[]).await.unwrap();
        assert_eq!(set.binaries.len(), 1);
        assert!(set.source.is_some());
        assert!(set.iter().all(BuildArtifact::is_signed));
        assert!(set.binaries[0].path.exists());
        assert_eq!(provider.resets(), 1);
    }

    #[tokio::test]
    async fn epoch_comes_from_the_package_not_its_file_name() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(FakeBuildRoot::new().produces_with_epoch("foo", 1, "1.0", "1"));
        let exec = BuildExecutor::new(provider, dir.path(), 1);
        let set = exec.build(&spec(), &arch(), &[]).await.unwrap();
        let key = &set.binaries[0].key;
        assert_eq!(key.evr.epoch, 1);
        assert_eq!(key.file_name(), "foo-1.0-1.x86_64.rpm");
        assert!(key.evr > crate::domain::Evr::new(0, "2.0", "1"));
    }

    #[tokio::test]
    async fn failed_build_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(FakeBuildRoot::new().failing_with_dependency("libbar-devel"));
        let exec = BuildExecutor::new(provider.clone(), dir.path(), 1);
        let err = exec.build(&spec(), &arch(), &[]).await.unwrap_err();
        assert!(matches!(err, BuildError::DependencyUnresolved { .. }));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
        assert_eq!(provider.resets(), 2);
    }

    #[tokio::test]
    async fn sign_failure_discards_output() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(FakeBuildRoot::new().produces("foo", "1.0", "1"));
        let exec = BuildExecutor::new(provider, dir.path(), 1).with_signer(Arc::new(FakeSigner::failing()));
        let err = exec.build(&spec(), &arch(), &[]).await.unwrap_err();
        assert!(matches!(err, BuildError::SignFailed(_)));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn same_tuple_is_produced_once() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(FakeBuildRoot::new().produces("foo", "1.0", "1"));
        let exec = BuildExecutor::new(provider, dir.path(), 1);
        exec.build(&spec(), &arch(), &[]).await.unwrap();
        let err = exec.build(&spec(), &arch(), &[]).await.unwrap_err();
        assert!(matches!(err, BuildError::DuplicateArtifact(_)));
    }

    #[tokio::test]
    async fn busy_root_is_reported_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(FakeBuildRoot::new().produces("foo", "1.0", "1"));
        let exec = BuildExecutor::new(provider, dir.path(), 1);
        let _held = exec.slots.acquire(&arch()).unwrap();
        let err = exec.build(&spec(), &arch(), &[]).await.unwrap_err();
        assert!(matches!(err, BuildError::RootBusy { .. }));
    }

    #[tokio::test]
    async fn release_removes_output() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(FakeBuildRoot::new().produces("foo", "1.0", "1"));
        let exec = BuildExecutor::new(provider, dir.path(), 1);
        let set = exec.build(&spec(), &arch(), &[]).await.unwrap();
        assert!(set.binaries[0].path.exists());
        exec.release(&set).await;
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
        exec.release(&set).await;
    }

    #[tokio::test]
    async fn cancelled_build_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(
            FakeBuildRoot::new()
                .produces("foo", "1.0", "1")
                .with_delay(std::time::Duration::from_secs(60)),
        );
        let exec = BuildExecutor::new(provider.clone(), dir.path(), 1);
        let res = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            exec.build(&spec(), &arch(), &[]),
        )
        .await;
        assert!(res.is_err());
        assert_eq!(provider.active_builds(), 0);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
        assert!(exec.slots.acquire(&arch()).is_ok());
    }
}
