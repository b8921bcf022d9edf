//! Deterministic in-memory collaborators.
//!
//! `FakeHypervisor`, `FakeBuildRoot` and `FakeSigner` stand in for qemu,
//! mock and rpmsign so the session, build and pipeline layers can be driven
//! end to end without any of them installed.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use crate::build::{BuildError, BuildResult, BuildRoot, BuildRootProvider, PackageSpec, Signer};
use crate::config::RepoConfig;
use crate::domain::{Arch, BuildArtifact};
use crate::vm::{
    ExecOutput, FsTransport, GuestHandle, Hypervisor, SessionError, SessionResult, SharedMount,
    VmDescriptor,
};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

// ---------------------------------------------------------------------------
// FakeHypervisor
// ---------------------------------------------------------------------------

/// How a fake guest behaves while booting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootBehavior {
    /// Prints the ready marker at once.
    Ready,
    /// Never prints anything.
    Hang,
    /// Console closes immediately.
    Crash,
}

#[derive(Debug, Clone)]
enum ExecAction {
    Exit(i32, String),
    Hang,
    Unreachable,
}

#[derive(Debug, Clone)]
struct ExecRule {
    guest: Option<String>,
    pattern: String,
    action: ExecAction,
}

#[derive(Debug, Clone)]
struct BootRule {
    guest: String,
    behavior: BootBehavior,
    once: bool,
}

#[derive(Debug)]
struct HvState {
    default_boot: BootBehavior,
    boot_rules: Mutex<Vec<BootRule>>,
    transports: Vec<FsTransport>,
    ignore_poweroff: bool,
    rules: Mutex<Vec<ExecRule>>,
    launches: Mutex<Vec<String>>,
    live: AtomicUsize,
    execs: Mutex<Vec<(String, String)>>,
    mounted: Mutex<Vec<(String, String)>>,
    failing_mounts: Mutex<Vec<String>>,
}

/// Scriptable hypervisor. Clones share state.
#[derive(Debug, Clone)]
pub struct FakeHypervisor {
    state: Arc<HvState>,
}

impl Default for FakeHypervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeHypervisor {
    pub fn new() -> Self {
        Self {
            state: Arc::new(HvState {
                default_boot: BootBehavior::Ready,
                boot_rules: Mutex::new(Vec::new()),
                transports: vec![FsTransport::NineP, FsTransport::VirtioFs],
                ignore_poweroff: false,
                rules: Mutex::new(Vec::new()),
                launches: Mutex::new(Vec::new()),
                live: AtomicUsize::new(0),
                execs: Mutex::new(Vec::new()),
                mounted: Mutex::new(Vec::new()),
                failing_mounts: Mutex::new(Vec::new()),
            }),
        }
    }

    fn configure(mut self, f: impl FnOnce(&mut HvState)) -> Self {
        if let Some(state) = Arc::get_mut(&mut self.state) {
            f(state);
        }
        self
    }

    pub fn with_boot(self, behavior: BootBehavior) -> Self {
        self.configure(|s| s.default_boot = behavior)
    }

    pub fn with_transports(self, transports: Vec<FsTransport>) -> Self {
        self.configure(|s| s.transports = transports)
    }

    /// Guests never exit on a poweroff request.
    pub fn ignoring_poweroff(self) -> Self {
        self.configure(|s| s.ignore_poweroff = true)
    }

    /// Guests whose name contains `fragment` boot with `behavior`.
    pub fn boot_for(&self, fragment: &str, behavior: BootBehavior) {
        lock(&self.state.boot_rules).push(BootRule {
            guest: fragment.to_string(),
            behavior,
            once: false,
        });
    }

    /// Like [`boot_for`](Self::boot_for) but only for the next matching launch.
    pub fn boot_once_for(&self, fragment: &str, behavior: BootBehavior) {
        lock(&self.state.boot_rules).push(BootRule {
            guest: fragment.to_string(),
            behavior,
            once: true,
        });
    }

    fn push_rule(&self, guest: Option<&str>, pattern: &str, action: ExecAction) {
        lock(&self.state.rules).push(ExecRule {
            guest: guest.map(str::to_string),
            pattern: pattern.to_string(),
            action,
        });
    }

    /// Scripts containing `pattern` exit with `code` and print `output`.
    pub fn script_exit(&self, pattern: &str, code: i32, output: &str) {
        self.push_rule(None, pattern, ExecAction::Exit(code, output.to_string()));
    }

    /// Same as [`script_exit`](Self::script_exit), for guests whose name contains `guest`.
    pub fn script_exit_on(&self, guest: &str, pattern: &str, code: i32, output: &str) {
        self.push_rule(Some(guest), pattern, ExecAction::Exit(code, output.to_string()));
    }

    /// Scripts containing `pattern` never finish.
    pub fn script_hang(&self, pattern: &str) {
        self.push_rule(None, pattern, ExecAction::Hang);
    }

    /// Scripts containing `pattern` lose the connection to the guest.
    pub fn script_unreachable(&self, pattern: &str) {
        self.push_rule(None, pattern, ExecAction::Unreachable);
    }

    /// Mounting share `tag` exits 32, as `mount` does for a tag the guest cannot see.
    pub fn fail_mount(&self, tag: &str) {
        lock(&self.state.failing_mounts).push(tag.to_string());
    }

    pub fn launches(&self) -> usize {
        lock(&self.state.launches).len()
    }

    pub fn launched_names(&self) -> Vec<String> {
        lock(&self.state.launches).clone()
    }

    /// Guest processes not yet terminated.
    pub fn live_guests(&self) -> usize {
        self.state.live.load(Ordering::SeqCst)
    }

    pub fn exec_count(&self) -> usize {
        lock(&self.state.execs).len()
    }

    pub fn exec_count_matching(&self, pattern: &str) -> usize {
        lock(&self.state.execs)
            .iter()
            .filter(|(_, script)| script.contains(pattern))
            .count()
    }

    /// `(guest, script)` pairs in execution order.
    pub fn execs(&self) -> Vec<(String, String)> {
        lock(&self.state.execs).clone()
    }

    /// Mounted share tags, across all guests.
    pub fn mounted(&self) -> Vec<String> {
        lock(&self.state.mounted).iter().map(|(_, tag)| tag.clone()).collect()
    }

    fn boot_behavior(&self, name: &str) -> BootBehavior {
        let mut rules = lock(&self.state.boot_rules);
        match rules.iter().position(|r| name.contains(&r.guest)) {
            Some(i) if rules[i].once => rules.remove(i).behavior,
            Some(i) => rules[i].behavior,
            None => self.state.default_boot,
        }
    }
}

#[async_trait]
impl Hypervisor for FakeHypervisor {
    async fn launch(&self, descriptor: &VmDescriptor) -> SessionResult<Box<dyn GuestHandle>> {
        lock(&self.state.launches).push(descriptor.name.clone());
        self.state.live.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeGuest {
            name: descriptor.name.clone(),
            marker: descriptor.ready_marker.clone(),
            boot: self.boot_behavior(&descriptor.name),
            console_done: false,
            alive: true,
            state: Arc::clone(&self.state),
        }))
    }
}

struct FakeGuest {
    name: String,
    marker: String,
    boot: BootBehavior,
    console_done: bool,
    alive: bool,
    state: Arc<HvState>,
}

impl FakeGuest {
    fn terminate(&mut self) {
        if self.alive {
            self.alive = false;
            self.state.live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl GuestHandle for FakeGuest {
    async fn read_console(&mut self) -> SessionResult<Option<String>> {
        match self.boot {
            BootBehavior::Crash => Ok(None),
            BootBehavior::Ready if !self.console_done => {
                self.console_done = true;
                Ok(Some(format!("[    0.000000] Linux version\n{}\n", self.marker)))
            }
            _ => std::future::pending().await,
        }
    }

    fn is_alive(&mut self) -> bool {
        self.alive
    }

    async fn supported_transports(&mut self) -> SessionResult<Vec<FsTransport>> {
        Ok(self.state.transports.clone())
    }

    async fn mount(&mut self, mount: &SharedMount) -> SessionResult<()> {
        if lock(&self.state.failing_mounts).contains(&mount.tag) {
            return Err(SessionError::MountFailed {
                tag: mount.tag.clone(),
                exit_code: 32,
                output: format!("mount: {}: special device {} does not exist", mount.guest_path, mount.tag),
            });
        }
        lock(&self.state.mounted).push((self.name.clone(), mount.tag.clone()));
        Ok(())
    }

    async fn exec(&mut self, script: &str) -> SessionResult<ExecOutput> {
        if !self.alive {
            return Err(SessionError::GuestUnreachable(format!("{} is not running", self.name)));
        }
        lock(&self.state.execs).push((self.name.clone(), script.to_string()));
        let action = lock(&self.state.rules)
            .iter()
            .find(|r| {
                r.guest.as_ref().map_or(true, |g| self.name.contains(g.as_str()))
                    && script.contains(&r.pattern)
            })
            .map(|r| r.action.clone());
        match action {
            None => Ok(ExecOutput {
                exit_code: 0,
                output: String::new(),
            }),
            Some(ExecAction::Exit(exit_code, output)) => Ok(ExecOutput { exit_code, output }),
            Some(ExecAction::Hang) => std::future::pending().await,
            Some(ExecAction::Unreachable) => Err(SessionError::GuestUnreachable(format!(
                "connection to {} reset",
                self.name
            ))),
        }
    }

    async fn request_poweroff(&mut self) -> SessionResult<()> {
        Ok(())
    }

    async fn wait_exit(&mut self) -> SessionResult<()> {
        if self.state.ignore_poweroff {
            return std::future::pending().await;
        }
        self.terminate();
        Ok(())
    }

    async fn kill(&mut self) -> SessionResult<()> {
        self.terminate();
        Ok(())
    }

    fn kill_now(&mut self) {
        self.terminate();
    }
}

// ---------------------------------------------------------------------------
// FakeBuildRoot
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum FakeFailure {
    Dependency(String),
    Compile(String),
}

#[derive(Debug, Default)]
struct BuildCounters {
    resets: AtomicUsize,
    builds: AtomicUsize,
    active: AtomicUsize,
}

#[derive(Debug, Clone)]
struct FakePackage {
    name: String,
    epoch: u32,
    version: String,
    release: String,
    noarch: bool,
}

impl FakePackage {
    fn new(name: &str, epoch: u32, version: &str, release: &str, noarch: bool) -> Self {
        Self {
            name: name.into(),
            epoch,
            version: version.into(),
            release: release.into(),
            noarch,
        }
    }
}

/// Build-root provider that writes placeholder rpm files.
#[derive(Debug, Clone, Default)]
pub struct FakeBuildRoot {
    packages: Vec<FakePackage>,
    failure: Option<FakeFailure>,
    fail_arches: HashMap<Arch, FakeFailure>,
    delay: Option<Duration>,
    counters: Arc<BuildCounters>,
}

impl FakeBuildRoot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every build yields `name-version-release` for the root's arch.
    pub fn produces(mut self, name: &str, version: &str, release: &str) -> Self {
        self.packages
            .push(FakePackage::new(name, 0, version, release, false));
        self
    }

    /// Like [`produces`](Self::produces), with an `Epoch:` that only the
    /// package header carries.
    pub fn produces_with_epoch(mut self, name: &str, epoch: u32, version: &str, release: &str) -> Self {
        self.packages
            .push(FakePackage::new(name, epoch, version, release, false));
        self
    }

    /// Every build also yields a noarch package.
    pub fn produces_noarch(mut self, name: &str, version: &str, release: &str) -> Self {
        self.packages
            .push(FakePackage::new(name, 0, version, release, true));
        self
    }

    pub fn failing_with_dependency(mut self, missing: &str) -> Self {
        self.failure = Some(FakeFailure::Dependency(missing.into()));
        self
    }

    /// Builds for `arch` fail to compile.
    pub fn failing_on(mut self, arch: &str, detail: &str) -> Self {
        if let Ok(arch) = arch.parse() {
            self.fail_arches.insert(arch, FakeFailure::Compile(detail.into()));
        }
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn resets(&self) -> usize {
        self.counters.resets.load(Ordering::SeqCst)
    }

    pub fn builds(&self) -> usize {
        self.counters.builds.load(Ordering::SeqCst)
    }

    /// Builds currently in progress.
    pub fn active_builds(&self) -> usize {
        self.counters.active.load(Ordering::SeqCst)
    }
}

impl BuildRootProvider for FakeBuildRoot {
    fn create(&self, arch: &Arch, _slot: usize, _repos: &[RepoConfig]) -> BuildResult<Box<dyn BuildRoot>> {
        let failure = self
            .fail_arches
            .get(arch)
            .cloned()
            .or_else(|| self.failure.clone());
        Ok(Box::new(FakeRoot {
            arch: arch.clone(),
            packages: self.packages.clone(),
            failure,
            delay: self.delay,
            counters: Arc::clone(&self.counters),
        }))
    }
}

struct FakeRoot {
    arch: Arch,
    packages: Vec<FakePackage>,
    failure: Option<FakeFailure>,
    delay: Option<Duration>,
    counters: Arc<BuildCounters>,
}

struct ActiveGuard(Arc<BuildCounters>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl BuildRoot for FakeRoot {
    async fn reset(&mut self) -> BuildResult<()> {
        self.counters.resets.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn build(&mut self, spec: &PackageSpec, outdir: &Path) -> BuildResult<Vec<PathBuf>> {
        self.counters.builds.fetch_add(1, Ordering::SeqCst);
        self.counters.active.fetch_add(1, Ordering::SeqCst);
        let _active = ActiveGuard(Arc::clone(&self.counters));

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match &self.failure {
            Some(FakeFailure::Dependency(missing)) => {
                return Err(BuildError::DependencyUnresolved {
                    package: spec.name.clone(),
                    detail: format!("No matching package to install: '{missing}'"),
                })
            }
            Some(FakeFailure::Compile(detail)) => {
                return Err(BuildError::CompileFailed {
                    package: spec.name.clone(),
                    detail: detail.clone(),
                })
            }
            None => {}
        }

        let mut files = Vec::new();
        for (i, FakePackage { name, version, release, noarch, .. }) in self.packages.iter().enumerate() {
            if i == 0 {
                let srpm = outdir.join(format!("{name}-{version}-{release}.src.rpm"));
                tokio::fs::write(&srpm, format!("srpm {name}")).await?;
                files.push(srpm);
            }
            let arch = if *noarch { "noarch" } else { self.arch.as_str() };
            let rpm = outdir.join(format!("{name}-{version}-{release}.{arch}.rpm"));
            tokio::fs::write(&rpm, format!("rpm {name} {version}-{release} {arch}")).await?;
            files.push(rpm);
        }
        Ok(files)
    }

    async fn describe(&mut self, rpm: &Path, build_id: &str) -> BuildResult<BuildArtifact> {
        let mut artifact = BuildArtifact::from_path(rpm, build_id)?;
        let key = &artifact.key;
        if let Some(pkg) = self.packages.iter().find(|p| {
            p.name == key.name && p.version == key.evr.version && p.release == key.evr.release
        }) {
            artifact.key.evr.epoch = pkg.epoch;
        }
        Ok(artifact)
    }
}

// ---------------------------------------------------------------------------
// FakeSigner
// ---------------------------------------------------------------------------

/// Marks artifacts signed without touching them.
#[derive(Debug, Clone)]
pub struct FakeSigner {
    key: String,
    fail: bool,
}

impl FakeSigner {
    pub fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
            fail: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            key: String::new(),
            fail: true,
        }
    }
}

#[async_trait]
impl Signer for FakeSigner {
    async fn sign(&self, artifact: BuildArtifact) -> BuildResult<BuildArtifact> {
        if self.fail {
            return Err(BuildError::SignFailed(format!("no secret key for {}", artifact.key)));
        }
        Ok(artifact.into_signed(&self.key))
    }
}
