//! Project configuration.
//!
//! [`ProjectConfig`] is the typed form of a project's `rpmgate.toml`. Every
//! section is optional except `name` and `arch`; omitted values fall back to
//! the defaults documented on each field.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::{Arch, Classify, ErrorClass};
use crate::vm::FsTransport;

/// Errors from loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("architecture {arch} is referenced by {section} but not listed in `arch`")]
    UnlistedArch { arch: Arch, section: String },

    #[error("no VM image configured for {0}")]
    MissingImage(Arch),
}

impl Classify for ConfigError {
    fn class(&self) -> ErrorClass {
        ErrorClass::Configuration
    }
}

/// Result type for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Top-level project configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    /// Project name; used for build-root and repository names.
    pub name: String,
    /// Target architectures, in fan-out order.
    pub arch: Vec<Arch>,
    /// HTTP proxy handed to build roots and guests.
    #[serde(default)]
    pub proxy: Option<String>,
    #[serde(default)]
    pub no_proxy: Option<String>,
    /// Dependency repositories, in priority order.
    #[serde(default)]
    pub repos: Vec<RepoEntry>,
    #[serde(default)]
    pub vm: VmSettings,
    #[serde(default)]
    pub build: BuildSettings,
    #[serde(default)]
    pub gpg: Option<GpgSettings>,
    #[serde(default)]
    pub repository: RepositorySettings,
    #[serde(default)]
    pub annex: AnnexSettings,
    #[serde(default)]
    pub pipeline: PipelineSettings,
}

/// A dependency repository as written in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoEntry {
    pub name: String,
    /// Base URL; may contain `$basearch`. `file://` or absolute paths are local.
    pub url: String,
    /// Explicit priority; otherwise assigned by declaration order.
    #[serde(default)]
    pub priority: Option<u32>,
    #[serde(default)]
    pub module_hotfixes: bool,
    #[serde(default)]
    pub excludepkgs: Vec<String>,
    #[serde(default)]
    pub proxy: Option<String>,
    /// Restrict this repository to some architectures.
    #[serde(default)]
    pub arches: Option<Vec<Arch>>,
}

/// A repository resolved for one architecture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoConfig {
    pub name: String,
    /// URL with the architecture substituted.
    pub url: String,
    /// URL with the architecture replaced by `$basearch`.
    pub generic_url: String,
    pub priority: u32,
    pub module_hotfixes: bool,
    pub excludepkgs: Vec<String>,
    pub proxy: Option<String>,
}

const BASEARCH: &str = "$basearch";
const FIRST_PRIORITY: u32 = 1000;

impl RepoConfig {
    /// A repository on the host filesystem, reachable without network.
    pub fn local(name: impl Into<String>, path: impl AsRef<Path>) -> Self {
        let url = format!("file://{}", path.as_ref().display());
        Self {
            name: name.into(),
            generic_url: url.clone(),
            url,
            priority: 1,
            module_hotfixes: true,
            excludepkgs: Vec::new(),
            proxy: None,
        }
    }

    pub fn is_local(&self) -> bool {
        self.url.starts_with("file://") || self.url.starts_with('/')
    }

    /// Host path of a local repository.
    pub fn path(&self) -> Option<PathBuf> {
        if let Some(rest) = self.url.strip_prefix("file://") {
            Some(PathBuf::from(rest))
        } else if self.url.starts_with('/') {
            Some(PathBuf::from(&self.url))
        } else {
            None
        }
    }
}

impl RepoEntry {
    fn applies_to(&self, arch: &Arch) -> bool {
        self.arches.as_ref().map_or(true, |list| list.contains(arch))
    }

    fn resolve(&self, arch: &Arch, priority: u32) -> RepoConfig {
        let generic_url = self.url.replace(arch.as_str(), BASEARCH);
        let url = self.url.replace(BASEARCH, arch.as_str());
        RepoConfig {
            name: self.name.clone(),
            url,
            generic_url,
            priority,
            module_hotfixes: self.module_hotfixes,
            excludepkgs: self.excludepkgs.clone(),
            proxy: self.proxy.clone(),
        }
    }
}

/// Virtual machine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VmSettings {
    /// Base qcow2 image per architecture.
    pub images: BTreeMap<Arch, PathBuf>,
    /// Default 4.
    pub cpus: u32,
    /// Guest memory in MiB. Default 8192.
    pub memory: u32,
    /// Seconds to wait for the ready marker. Default 300.
    pub boot_timeout: u64,
    /// Seconds to wait for a graceful poweroff. Default 60.
    pub shutdown_timeout: u64,
    /// Line printed on the console once the guest accepts commands.
    pub ready_marker: String,
    pub shared_fs_type: FsTransport,
    /// QEMU binary; `{arch}` is substituted. Default `qemu-system-{arch}`.
    pub qemu: String,
    pub qemu_img: String,
    pub virtiofsd: PathBuf,
    /// UEFI firmware used for aarch64 guests.
    pub uefi_firmware: PathBuf,
    /// Guest address in the user-mode network. Default `10.0.2.15`.
    pub address: String,
    /// Inclusive-exclusive range for forwarded ssh ports.
    pub port_range: (u16, u16),
    /// Private key used to reach the guest over ssh.
    pub ssh_key: Option<PathBuf>,
    /// Public key injected through cloud-init.
    pub ssh_pubkey: Option<String>,
}

impl Default for VmSettings {
    fn default() -> Self {
        Self {
            images: BTreeMap::new(),
            cpus: 4,
            memory: 8192,
            boot_timeout: 300,
            shutdown_timeout: 60,
            ready_marker: "rpmgate-ready".to_string(),
            shared_fs_type: FsTransport::NineP,
            qemu: "qemu-system-{arch}".to_string(),
            qemu_img: "qemu-img".to_string(),
            virtiofsd: PathBuf::from("/usr/libexec/virtiofsd"),
            uefi_firmware: PathBuf::from("/usr/share/edk2/aarch64/QEMU_EFI.silent.fd"),
            address: "10.0.2.15".to_string(),
            port_range: (10000, 15000),
            ssh_key: None,
            ssh_pubkey: None,
        }
    }
}

impl VmSettings {
    pub fn boot_timeout(&self) -> Duration {
        Duration::from_secs(self.boot_timeout)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout)
    }

    pub fn qemu_for(&self, arch: &Arch) -> String {
        self.qemu.replace("{arch}", arch.as_str())
    }
}

/// Build-root settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildSettings {
    /// Mock executable. Default `mock`.
    pub mock: String,
    /// Used to read epoch, version and release from built packages.
    /// Default `rpm`.
    pub rpm: String,
    /// Directory holding rendered mock configs. A temp dir when unset.
    pub config_dir: Option<PathBuf>,
    /// Build roots available per architecture. Default 1.
    pub roots_per_arch: usize,
    /// Sign packages after a successful build.
    pub sign: bool,
    /// Seconds before a build is abandoned. Default 3600.
    pub timeout: u64,
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self {
            mock: "mock".to_string(),
            rpm: "rpm".to_string(),
            config_dir: None,
            roots_per_arch: 1,
            sign: false,
            timeout: 3600,
        }
    }
}

/// GPG signing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpgSettings {
    /// Key identifier passed to `%_gpg_name`.
    pub key: String,
    pub keyring: PathBuf,
    #[serde(default)]
    pub passphrase: Option<String>,
    #[serde(default = "default_rpmsign")]
    pub rpmsign: String,
}

fn default_rpmsign() -> String {
    "rpmsign".to_string()
}

/// Published repository settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositorySettings {
    /// Root of the published repositories.
    pub path: PathBuf,
    /// Metadata generator. Default `createrepo_c`.
    pub createrepo: String,
    /// Highest versions kept live per package name. Default 2.
    pub keep_versions: usize,
}

impl Default for RepositorySettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from("repo"),
            createrepo: "createrepo_c".to_string(),
            keep_versions: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnnexSettings {
    pub path: PathBuf,
    /// Where backup archives are written.
    pub backup_dir: PathBuf,
}

impl Default for AnnexSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from("annex"),
            backup_dir: PathBuf::from("annex-backups"),
        }
    }
}

/// Coordinator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    /// Concurrent (request, arch) branches. Default 2.
    pub workers: usize,
    /// Retries of a branch after an infrastructure error. Default 1.
    pub infra_retries: u32,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            workers: 2,
            infra_retries: 1,
        }
    }
}

impl ProjectConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(text: &str) -> ConfigResult<Self> {
        let config: ProjectConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate the file at `path`.
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::Invalid("name must not be empty".into()));
        }
        if self.arch.is_empty() {
            return Err(ConfigError::Invalid("arch list must not be empty".into()));
        }
        for arch in self.vm.images.keys() {
            if !self.arch.contains(arch) {
                return Err(ConfigError::UnlistedArch {
                    arch: arch.clone(),
                    section: "vm.images".into(),
                });
            }
        }
        for repo in &self.repos {
            for arch in repo.arches.iter().flatten() {
                if !self.arch.contains(arch) {
                    return Err(ConfigError::UnlistedArch {
                        arch: arch.clone(),
                        section: format!("repos.{}", repo.name),
                    });
                }
            }
        }
        let (low, high) = self.vm.port_range;
        if low >= high {
            return Err(ConfigError::Invalid(format!(
                "vm.port_range is empty: {low}..{high}"
            )));
        }
        if self.pipeline.workers == 0 {
            return Err(ConfigError::Invalid("pipeline.workers must be at least 1".into()));
        }
        if self.repository.keep_versions == 0 {
            return Err(ConfigError::Invalid(
                "repository.keep_versions must be at least 1".into(),
            ));
        }
        if self.build.roots_per_arch == 0 {
            return Err(ConfigError::Invalid(
                "build.roots_per_arch must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Repositories that apply to `arch`, with priorities assigned.
    ///
    /// Repositories without an explicit priority count down from 1000 in
    /// declaration order.
    pub fn repos_for(&self, arch: &Arch) -> Vec<RepoConfig> {
        let mut next = FIRST_PRIORITY;
        self.repos
            .iter()
            .filter(|r| r.applies_to(arch))
            .map(|r| {
                let priority = r.priority.unwrap_or(next);
                next = next.saturating_sub(1);
                r.resolve(arch, priority)
            })
            .collect()
    }

    /// Base image for `arch`.
    pub fn image_for(&self, arch: &Arch) -> ConfigResult<&Path> {
        self.vm
            .images
            .get(arch)
            .map(PathBuf::as_path)
            .ok_or_else(|| ConfigError::MissingImage(arch.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
name = "acme"
arch = ["x86_64", "aarch64"]
proxy = "http://proxy:3128"

[[repos]]
name = "os"
url = "https://mirror.example/el9/$basearch/os"

[[repos]]
name = "extras"
url = "https://mirror.example/el9/x86_64/extras"
module_hotfixes = true
excludepkgs = ["kernel*"]
arches = ["x86_64"]

[[repos]]
name = "local"
url = "file:///srv/local"
priority = 5

[vm.images]
x86_64 = "/srv/images/el9-x86_64.qcow2"
aarch64 = "/srv/images/el9-aarch64.qcow2"

[pipeline]
workers = 3
"#;

    fn arch(s: &str) -> Arch {
        s.parse().unwrap()
    }

    #[test]
    fn parses_with_defaults() {
        let config = ProjectConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.arch.len(), 2);
        assert_eq!(config.vm.cpus, 4);
        assert_eq!(config.vm.memory, 8192);
        assert_eq!(config.vm.port_range, (10000, 15000));
        assert_eq!(config.vm.shared_fs_type, FsTransport::NineP);
        assert_eq!(config.repository.createrepo, "createrepo_c");
        assert_eq!(config.repository.keep_versions, 2);
        assert_eq!(config.pipeline.workers, 3);
        assert_eq!(config.vm.qemu_for(&arch("aarch64")), "qemu-system-aarch64");
    }

    #[test]
    fn priorities_count_down_in_declaration_order() {
        let config = ProjectConfig::from_toml_str(SAMPLE).unwrap();
        let repos = config.repos_for(&arch("x86_64"));
        let prio: Vec<_> = repos.iter().map(|r| (r.name.as_str(), r.priority)).collect();
        assert_eq!(prio, vec![("os", 1000), ("extras", 999), ("local", 5)]);
    }

    #[test]
    fn per_arch_restriction_and_url_substitution() {
        let config = ProjectConfig::from_toml_str(SAMPLE).unwrap();
        let repos = config.repos_for(&arch("aarch64"));
        assert_eq!(repos.len(), 2);
        assert_eq!(repos[0].url, "https://mirror.example/el9/aarch64/os");
        assert_eq!(repos[0].generic_url, "https://mirror.example/el9/$basearch/os");

        let x86 = config.repos_for(&arch("x86_64"));
        assert_eq!(x86[1].generic_url, "https://mirror.example/el9/$basearch/extras");
    }

    #[test]
    fn local_repos_expose_path() {
        let config = ProjectConfig::from_toml_str(SAMPLE).unwrap();
        let local = &config.repos_for(&arch("x86_64"))[2];
        assert!(local.is_local());
        assert_eq!(local.path(), Some(PathBuf::from("/srv/local")));
        let staging = RepoConfig::local("staging", "/tmp/stage");
        assert_eq!(staging.priority, 1);
        assert!(staging.module_hotfixes);
    }

    #[test]
    fn rejects_empty_arch_list() {
        let err = ProjectConfig::from_toml_str("name = \"x\"\narch = []\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_image_for_unlisted_arch() {
        let text = "name = \"x\"\narch = [\"x86_64\"]\n[vm.images]\naarch64 = \"/i.qcow2\"\n";
        let err = ProjectConfig::from_toml_str(text).unwrap_err();
        assert!(matches!(err, ConfigError::UnlistedArch { .. }));
        assert_eq!(err.class(), ErrorClass::Configuration);
    }

    #[test]
    fn rejects_inverted_port_range() {
        let text = "name = \"x\"\narch = [\"x86_64\"]\n[vm]\nport_range = [2000, 1000]\n";
        assert!(ProjectConfig::from_toml_str(text).is_err());
    }

    #[test]
    fn rejects_unknown_arch() {
        let text = "name = \"x\"\narch = [\"vax\"]\n";
        assert!(matches!(
            ProjectConfig::from_toml_str(text),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn missing_image_is_reported() {
        let text = "name = \"x\"\narch = [\"x86_64\"]\n";
        let config = ProjectConfig::from_toml_str(text).unwrap();
        assert!(matches!(
            config.image_for(&arch("x86_64")),
            Err(ConfigError::MissingImage(_))
        ));
    }

    #[test]
    fn load_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = ProjectConfig::load(dir.path().join("nope.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
