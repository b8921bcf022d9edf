//! Build-root abstraction and slot accounting.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::RepoConfig;
use crate::domain::{Arch, BuildArtifact};

use super::error::{BuildError, BuildResult};

/// Inputs for building one package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageSpec {
    pub name: String,
    /// Path to the `.spec` file.
    pub spec: PathBuf,
    /// Directory holding sources and patches.
    pub sources: PathBuf,
}

impl PackageSpec {
    pub fn new(name: impl Into<String>, spec: impl Into<PathBuf>, sources: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            spec: spec.into(),
            sources: sources.into(),
        }
    }
}

/// An isolated environment that turns a spec into rpms.
#[async_trait]
pub trait BuildRoot: Send {
    /// Return the root to a clean state, discarding any previous output.
    async fn reset(&mut self) -> BuildResult<()>;

    /// Build `spec`, writing every produced rpm (source and binary) into
    /// `outdir`, and return their paths.
    async fn build(&mut self, spec: &PackageSpec, outdir: &Path) -> BuildResult<Vec<PathBuf>>;

    /// Identify a produced rpm. File names carry no epoch, so roots that
    /// can read rpm headers should override this.
    async fn describe(&mut self, rpm: &Path, build_id: &str) -> BuildResult<BuildArtifact> {
        Ok(BuildArtifact::from_path(rpm, build_id)?)
    }
}

/// Creates build roots for an architecture and repository universe.
pub trait BuildRootProvider: Send + Sync {
    /// `slot` identifies which of the per-arch roots is being used, so that
    /// concurrent roots of one arch never share on-disk state.
    fn create(&self, arch: &Arch, slot: usize, repos: &[RepoConfig]) -> BuildResult<Box<dyn BuildRoot>>;
}

/// Fixed number of build roots per architecture.
///
/// Acquiring beyond the limit fails immediately with `RootBusy`.
#[derive(Debug, Clone)]
pub struct RootSlots {
    per_arch: usize,
    in_use: Arc<Mutex<HashMap<Arch, Vec<bool>>>>,
}

impl RootSlots {
    pub fn new(per_arch: usize) -> Self {
        Self {
            per_arch: per_arch.max(1),
            in_use: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn acquire(&self, arch: &Arch) -> BuildResult<RootLease> {
        let mut map = self.in_use.lock().unwrap_or_else(|p| p.into_inner());
        let slots = map
            .entry(arch.clone())
            .or_insert_with(|| vec![false; self.per_arch]);
        let slot = slots
            .iter()
            .position(|busy| !busy)
            .ok_or_else(|| BuildError::RootBusy { arch: arch.clone() })?;
        slots[slot] = true;
        Ok(RootLease {
            arch: arch.clone(),
            slot,
            in_use: Arc::clone(&self.in_use),
        })
    }
}

/// One occupied build-root slot; freed on drop.
#[derive(Debug)]
pub struct RootLease {
    arch: Arch,
    slot: usize,
    in_use: Arc<Mutex<HashMap<Arch, Vec<bool>>>>,
}

impl RootLease {
    pub fn slot(&self) -> usize {
        self.slot
    }
}

impl Drop for RootLease {
    fn drop(&mut self) {
        let mut map = self.in_use.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(slot) = map.get_mut(&self.arch).and_then(|s| s.get_mut(self.slot)) {
            *slot = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_when_all_slots_taken() {
        let slots = RootSlots::new(2);
        let arch: Arch = "x86_64".parse().unwrap();
        let a = slots.acquire(&arch).unwrap();
        let b = slots.acquire(&arch).unwrap();
        assert_ne!(a.slot(), b.slot());
        assert!(matches!(slots.acquire(&arch), Err(BuildError::RootBusy { .. })));

        let other: Arch = "aarch64".parse().unwrap();
        assert!(slots.acquire(&other).is_ok());

        drop(a);
        assert_eq!(slots.acquire(&arch).unwrap().slot(), 0);
    }
}
