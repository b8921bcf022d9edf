use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::Arch;
use crate::render::ProxyConfig;

/// Shared-directory transport between host and guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FsTransport {
    #[serde(rename = "9p")]
    NineP,
    #[serde(rename = "virtiofs")]
    VirtioFs,
}

impl FsTransport {
    /// Filesystem type passed to `mount -t`.
    pub fn fs_type(self) -> &'static str {
        match self {
            FsTransport::NineP => "9p",
            FsTransport::VirtioFs => "virtiofs",
        }
    }
}

impl fmt::Display for FsTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.fs_type())
    }
}

/// One host directory exposed to the guest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedMount {
    /// Device tag the guest mounts by.
    pub tag: String,
    pub host_path: PathBuf,
    pub guest_path: String,
    pub transport: FsTransport,
    #[serde(default)]
    pub read_only: bool,
}

impl SharedMount {
    pub fn new(
        tag: impl Into<String>,
        host_path: impl Into<PathBuf>,
        guest_path: impl Into<String>,
        transport: FsTransport,
    ) -> Self {
        Self {
            tag: tag.into(),
            host_path: host_path.into(),
            guest_path: guest_path.into(),
            transport,
            read_only: false,
        }
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }
}

/// cloud-init seed documents for first boot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudInitSeed {
    pub user_data: String,
    pub meta_data: String,
}

/// Everything needed to boot one guest. Immutable once a session starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmDescriptor {
    /// Unique among live sessions.
    pub name: String,
    pub arch: Arch,
    /// Base image; never written to.
    pub image: PathBuf,
    pub mounts: Vec<SharedMount>,
    pub proxy: ProxyConfig,
    pub cpus: u32,
    /// MiB.
    pub memory: u32,
    pub boot_timeout: Duration,
    pub shutdown_timeout: Duration,
    /// Console line that signals the guest is ready for commands.
    pub ready_marker: String,
    pub seed: Option<CloudInitSeed>,
}

impl VmDescriptor {
    pub fn new(name: impl Into<String>, arch: Arch, image: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            arch,
            image: image.into(),
            mounts: Vec::new(),
            proxy: ProxyConfig::default(),
            cpus: 4,
            memory: 8192,
            boot_timeout: Duration::from_secs(300),
            shutdown_timeout: Duration::from_secs(60),
            ready_marker: "rpmgate-ready".to_string(),
            seed: None,
        }
    }

    pub fn with_mount(mut self, mount: SharedMount) -> Self {
        self.mounts.push(mount);
        self
    }

    pub fn with_boot_timeout(mut self, timeout: Duration) -> Self {
        self.boot_timeout = timeout;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}
