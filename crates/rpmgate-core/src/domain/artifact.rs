//! Package identity and built artifacts.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::arch::Arch;
use super::error::{DomainError, Result};
use super::evr::Evr;

/// Name, epoch/version/release and architecture of one package (NEVRA).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PackageKey {
    pub name: String,
    pub evr: Evr,
    pub arch: Arch,
}

impl PackageKey {
    pub fn new(name: impl Into<String>, evr: Evr, arch: Arch) -> Self {
        Self {
            name: name.into(),
            evr,
            arch,
        }
    }

    /// Canonical file name, `name-version-release.arch.rpm`.
    pub fn file_name(&self) -> String {
        format!(
            "{}-{}-{}.{}.rpm",
            self.name, self.evr.version, self.evr.release, self.arch
        )
    }

    /// Parse a file name of the form `name-version-release.arch.rpm`.
    ///
    /// Epoch is not part of file names and is reported as `0`.
    pub fn from_file_name(file_name: &str) -> Result<Self> {
        static RPM_NAME: OnceLock<Regex> = OnceLock::new();
        let re = RPM_NAME.get_or_init(|| {
            Regex::new(r"^(?P<name>.+)-(?P<version>[^-]+)-(?P<release>[^-]+)\.(?P<arch>[^.]+)\.rpm$")
                .expect("rpm file name pattern is valid")
        });
        let caps = re
            .captures(file_name)
            .ok_or_else(|| DomainError::InvalidRpmName(file_name.to_string()))?;
        let arch: Arch = caps["arch"].parse()?;
        Ok(Self::new(
            &caps["name"],
            Evr::new(0, &caps["version"], &caps["release"]),
            arch,
        ))
    }
}

/// Name, then arch, then RPM version order. Spellings that compare equal
/// under RPM rules ("1.01" and "1.1") are told apart by their raw text.
impl Ord for PackageKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.name
            .cmp(&other.name)
            .then_with(|| self.arch.cmp(&other.arch))
            .then_with(|| self.evr.cmp(&other.evr))
    }
}

impl PartialOrd for PackageKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for PackageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}.{}", self.name, self.evr, self.arch)
    }
}

/// Whether an artifact carries a GPG signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SigningState {
    Unsigned,
    Signed { key_id: String },
}

/// One RPM produced by a build.
///
/// Immutable: signing yields a new value via [`BuildArtifact::into_signed`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildArtifact {
    pub key: PackageKey,
    pub signing: SigningState,
    /// Identifier of the build invocation that produced this artifact.
    pub source_build: String,
    /// Location of the `.rpm` file on the host.
    pub path: PathBuf,
}

impl BuildArtifact {
    /// Describe the rpm at `path`, deriving its key from the file name.
    pub fn from_path(path: impl AsRef<Path>, source_build: impl Into<String>) -> Result<Self> {
        let path = path.as_ref();
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| DomainError::InvalidRpmName(path.display().to_string()))?;
        Ok(Self {
            key: PackageKey::from_file_name(file_name)?,
            signing: SigningState::Unsigned,
            source_build: source_build.into(),
            path: path.to_path_buf(),
        })
    }

    pub fn is_signed(&self) -> bool {
        matches!(self.signing, SigningState::Signed { .. })
    }

    pub fn is_source(&self) -> bool {
        self.key.arch.is_source()
    }

    pub fn file_name(&self) -> String {
        self.key.file_name()
    }

    pub fn into_signed(self, key_id: impl Into<String>) -> Self {
        Self {
            signing: SigningState::Signed {
                key_id: key_id.into(),
            },
            ..self
        }
    }
}

/// Everything one build invocation produced.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArtifactSet {
    pub build_id: String,
    pub source: Option<BuildArtifact>,
    pub binaries: Vec<BuildArtifact>,
}

impl ArtifactSet {
    pub fn iter(&self) -> impl Iterator<Item = &BuildArtifact> {
        self.source.iter().chain(self.binaries.iter())
    }

    /// Binary packages to publish into the repository for `arch`.
    pub fn installable_on<'a>(&'a self, arch: &'a Arch) -> impl Iterator<Item = &'a BuildArtifact> {
        self.binaries.iter().filter(move |a| a.key.arch.installs_on(arch))
    }

    pub fn package_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.binaries.iter().map(|a| a.key.name.clone()).collect();
        names.sort();
        names.dedup();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_rpm_file_name() {
        let key = PackageKey::from_file_name("python3-foo-bar-1.10-2.el9.noarch.rpm").unwrap();
        assert_eq!(key.name, "python3-foo-bar");
        assert_eq!(key.evr, Evr::new(0, "1.10", "2.el9"));
        assert_eq!(key.arch.as_str(), "noarch");
        assert_eq!(key.file_name(), "python3-foo-bar-1.10-2.el9.noarch.rpm");
    }

    #[test]
    fn parse_source_rpm() {
        let key = PackageKey::from_file_name("foo-1.0-1.src.rpm").unwrap();
        assert!(key.arch.is_source());
    }

    #[test]
    fn reject_garbage() {
        assert!(PackageKey::from_file_name("README.md").is_err());
        assert!(PackageKey::from_file_name("foo-1.0-1.m68k.rpm").is_err());
    }

    #[test]
    fn signing_produces_new_value() {
        let art = BuildArtifact::from_path("/tmp/out/foo-1.0-1.x86_64.rpm", "b1").unwrap();
        assert!(!art.is_signed());
        let signed = art.clone().into_signed("ABCD1234");
        assert!(signed.is_signed());
        assert_eq!(signed.key, art.key);
    }

    #[test]
    fn installable_filters_by_arch() {
        let set = ArtifactSet {
            build_id: "b1".into(),
            source: Some(BuildArtifact::from_path("foo-1-1.src.rpm", "b1").unwrap()),
            binaries: vec![
                BuildArtifact::from_path("foo-1-1.x86_64.rpm", "b1").unwrap(),
                BuildArtifact::from_path("foo-doc-1-1.noarch.rpm", "b1").unwrap(),
            ],
        };
        let arm: Arch = "aarch64".parse().unwrap();
        let names: Vec<_> = set.installable_on(&arm).map(|a| a.key.name.as_str()).collect();
        assert_eq!(names, vec!["foo-doc"]);
        assert_eq!(set.iter().count(), 3);
    }
}
