//! One VM session: boot, share, execute, stop.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::obs;
use crate::testing::{GuestCommand, TestResult};

use super::descriptor::{SharedMount, VmDescriptor};
use super::error::{SessionError, SessionResult};
use super::guest::{GuestHandle, Hypervisor};
use super::registry::{NameLease, SessionRegistry};
use super::state::SessionState;

/// Console bytes kept for diagnostics.
const CONSOLE_KEEP: usize = 64 * 1024;

/// A live guest bound to a reserved name.
///
/// The guest process is terminated on every exit path: [`VmSession::stop`],
/// a failed boot, or dropping the session.
pub struct VmSession {
    descriptor: VmDescriptor,
    state: SessionState,
    guest: Option<Box<dyn GuestHandle>>,
    console: String,
    mounted: Vec<String>,
    _lease: NameLease,
}

impl std::fmt::Debug for VmSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VmSession")
            .field("name", &self.descriptor.name)
            .field("state", &self.state)
            .finish()
    }
}

impl VmSession {
    /// Reserve the name, launch the guest and wait for its ready marker.
    ///
    /// On `BootTimeout` the guest process has been killed and reaped before
    /// the error is returned.
    pub async fn start(
        registry: &SessionRegistry,
        hypervisor: &dyn Hypervisor,
        descriptor: VmDescriptor,
    ) -> SessionResult<Self> {
        let lease = registry.acquire(&descriptor.name)?;

        if !descriptor.image.exists() {
            return Err(SessionError::ImageNotFound(descriptor.image.clone()));
        }

        let mut session = Self {
            descriptor,
            state: SessionState::Created,
            guest: None,
            console: String::new(),
            mounted: Vec::new(),
            _lease: lease,
        };

        session.transition(SessionState::Booting)?;
        match hypervisor.launch(&session.descriptor).await {
            Ok(guest) => session.guest = Some(guest),
            Err(e) => {
                session.transition(SessionState::Failed)?;
                return Err(e);
            }
        }

        if let Err(e) = session.wait_ready().await {
            session.terminate().await;
            session.transition(SessionState::Failed)?;
            return Err(e);
        }
        session.transition(SessionState::Ready)?;
        Ok(session)
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn descriptor(&self) -> &VmDescriptor {
        &self.descriptor
    }

    /// Console output captured so far (tail only).
    pub fn console_log(&self) -> &str {
        &self.console
    }

    fn transition(&mut self, next: SessionState) -> SessionResult<()> {
        let from = self.state;
        self.state.advance(next)?;
        obs::emit_session_state(&self.descriptor.name, from.as_str(), next.as_str());
        Ok(())
    }

    fn guest(&mut self) -> SessionResult<&mut Box<dyn GuestHandle>> {
        let name = self.descriptor.name.clone();
        self.guest
            .as_mut()
            .ok_or_else(|| SessionError::GuestUnreachable(format!("VM {name} has no guest process")))
    }

    fn record_console(&mut self, chunk: &str) {
        self.console.push_str(chunk);
        if self.console.len() > CONSOLE_KEEP {
            let mut cut = self.console.len() - CONSOLE_KEEP;
            while !self.console.is_char_boundary(cut) {
                cut += 1;
            }
            self.console.drain(..cut);
        }
    }

    async fn wait_ready(&mut self) -> SessionResult<()> {
        let limit = self.descriptor.boot_timeout;
        let deadline = Instant::now() + limit;
        let marker = self.descriptor.ready_marker.clone();

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(self.boot_timeout());
            }
            let next = {
                let guest = self.guest()?;
                tokio::time::timeout(remaining, guest.read_console()).await
            };
            match next {
                Err(_) => return Err(self.boot_timeout()),
                Ok(Ok(Some(chunk))) => {
                    self.record_console(&chunk);
                    if self.console.contains(&marker) {
                        debug!(session = %self.descriptor.name, "ready marker seen");
                        return Ok(());
                    }
                }
                Ok(Ok(None)) => {
                    return Err(SessionError::GuestUnreachable(format!(
                        "console of {} closed during boot",
                        self.descriptor.name
                    )))
                }
                Ok(Err(e)) => return Err(e),
            }
        }
    }

    fn boot_timeout(&self) -> SessionError {
        SessionError::BootTimeout {
            name: self.descriptor.name.clone(),
            waited_secs: self.descriptor.boot_timeout.as_secs(),
        }
    }

    async fn terminate(&mut self) {
        if let Some(mut guest) = self.guest.take() {
            if let Err(e) = guest.kill().await {
                warn!(session = %self.descriptor.name, error = %e, "failed to kill guest");
                guest.kill_now();
            }
        }
    }

    fn require_ready(&self) -> SessionResult<()> {
        if self.state != SessionState::Ready {
            return Err(SessionError::GuestUnreachable(format!(
                "VM {} is {}",
                self.descriptor.name,
                self.state.as_str()
            )));
        }
        Ok(())
    }

    /// Mount shares declared in the descriptor.
    ///
    /// Each share's transport must be supported by the guest kernel; an
    /// unsupported transport is reported, never swapped for the other one.
    pub async fn mount_shared(&mut self, mounts: &[SharedMount]) -> SessionResult<()> {
        self.require_ready()?;
        for mount in mounts {
            if !self.descriptor.mounts.iter().any(|m| m.tag == mount.tag) {
                return Err(SessionError::UndeclaredMount(mount.tag.clone()));
            }
        }

        let supported = self.guest()?.supported_transports().await?;
        for mount in mounts {
            if !supported.contains(&mount.transport) {
                return Err(SessionError::TransportUnsupported {
                    transport: mount.transport,
                    tag: mount.tag.clone(),
                });
            }
        }

        for mount in mounts {
            if self.mounted.contains(&mount.tag) {
                continue;
            }
            self.guest()?.mount(mount).await?;
            debug!(session = %self.descriptor.name, tag = %mount.tag, path = %mount.guest_path, "share mounted");
            self.mounted.push(mount.tag.clone());
        }
        Ok(())
    }

    /// Mount every share declared in the descriptor.
    pub async fn mount_all(&mut self) -> SessionResult<()> {
        let mounts = self.descriptor.mounts.clone();
        self.mount_shared(&mounts).await
    }

    /// Run `command` in the guest, bounded by `timeout`.
    ///
    /// A command that runs to completion yields a `TestResult` whatever its
    /// exit code. An unreachable guest fails the session.
    pub async fn exec(&mut self, command: &GuestCommand, timeout: Duration) -> SessionResult<TestResult> {
        self.require_ready()?;
        self.transition(SessionState::Executing)?;

        let started = Instant::now();
        let script = command.wrapped();
        let outcome = {
            let guest = self.guest()?;
            tokio::time::timeout(timeout, guest.exec(&script)).await
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(Ok(output)) => {
                self.transition(SessionState::Ready)?;
                Ok(TestResult::from_exit(
                    &command.id,
                    output.exit_code,
                    duration_ms,
                    output.output,
                ))
            }
            Ok(Err(e)) => {
                warn!(session = %self.descriptor.name, command = %command.id, error = %e, "guest command failed");
                self.transition(SessionState::Failed)?;
                Err(e)
            }
            Err(_) => {
                self.transition(SessionState::Ready)?;
                Err(SessionError::Timeout {
                    command_id: command.id.clone(),
                    limit_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Read a file from the guest, bounded by `timeout`.
    pub async fn read_guest_file(&mut self, path: &str, timeout: Duration) -> SessionResult<String> {
        self.require_ready()?;
        let script = format!("cat '{path}'");
        let guest = self.guest()?;
        match tokio::time::timeout(timeout, guest.exec(&script)).await {
            Ok(Ok(out)) if out.exit_code == 0 => Ok(out.output),
            Ok(Ok(out)) => Err(SessionError::GuestUnreachable(format!(
                "cannot read {path}: exit {}",
                out.exit_code
            ))),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(SessionError::Timeout {
                command_id: format!("read {path}"),
                limit_ms: timeout.as_millis() as u64,
            }),
        }
    }

    /// Shut the guest down.
    ///
    /// With `force` the process is killed at once. Otherwise the guest is asked
    /// to power off and given `shutdown_timeout`; if it overruns it is killed
    /// and `ShutdownTimeout` is returned. The process is gone either way.
    pub async fn stop(&mut self, force: bool) -> SessionResult<()> {
        if self.state.is_terminal() {
            self.terminate().await;
            return Ok(());
        }
        if self.state != SessionState::Ready {
            self.terminate().await;
            return self.transition(SessionState::Failed);
        }
        self.transition(SessionState::ShuttingDown)?;

        if force {
            self.terminate().await;
            return self.transition(SessionState::Stopped);
        }

        let limit = self.descriptor.shutdown_timeout;
        let graceful = {
            let guest = self.guest()?;
            let _ = guest.request_poweroff().await;
            tokio::time::timeout(limit, guest.wait_exit()).await
        };

        match graceful {
            Ok(Ok(())) => {
                self.guest = None;
                self.transition(SessionState::Stopped)
            }
            Ok(Err(e)) => {
                self.terminate().await;
                self.transition(SessionState::Failed)?;
                Err(e)
            }
            Err(_) => {
                self.terminate().await;
                self.transition(SessionState::Failed)?;
                Err(SessionError::ShutdownTimeout {
                    name: self.descriptor.name.clone(),
                    waited_secs: limit.as_secs(),
                })
            }
        }
    }
}

impl Drop for VmSession {
    fn drop(&mut self) {
        if let Some(guest) = self.guest.as_mut() {
            warn!(session = %self.descriptor.name, state = self.state.as_str(), "session dropped with live guest; killing");
            guest.kill_now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Classify, ErrorClass};
    use crate::fakes::{BootBehavior, FakeHypervisor};
    use crate::vm::FsTransport;

    fn descriptor(dir: &tempfile::TempDir, name: &str) -> VmDescriptor {
        let image = dir.path().join("base.qcow2");
        std::fs::write(&image, b"qcow").unwrap();
        VmDescriptor::new(name, "x86_64".parse().unwrap(), image)
            .with_boot_timeout(Duration::from_secs(30))
            .with_shutdown_timeout(Duration::from_secs(5))
    }

    #[tokio::test]
    async fn boots_and_stops() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SessionRegistry::new();
        let hv = FakeHypervisor::new();
        let mut session = VmSession::start(&registry, &hv, descriptor(&dir, "vm1")).await.unwrap();
        assert_eq!(session.state(), SessionState::Ready);
        assert!(session.console_log().contains("rpmgate-ready"));

        session.stop(false).await.unwrap();
        assert_eq!(session.state(), SessionState::Stopped);
        assert_eq!(hv.live_guests(), 0);
    }

    #[tokio::test]
    async fn missing_image_is_reported_before_launch() {
        let registry = SessionRegistry::new();
        let hv = FakeHypervisor::new();
        let desc = VmDescriptor::new("vm1", "x86_64".parse().unwrap(), "/nonexistent/base.qcow2");
        let err = VmSession::start(&registry, &hv, desc).await.unwrap_err();
        assert!(matches!(err, SessionError::ImageNotFound(_)));
        assert_eq!(hv.launches(), 0);
        assert!(!registry.is_live("vm1"));
    }

    #[tokio::test]
    async fn duplicate_name_never_launches_second_guest() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SessionRegistry::new();
        let hv = FakeHypervisor::new();
        let _first = VmSession::start(&registry, &hv, descriptor(&dir, "vm1")).await.unwrap();
        let err = VmSession::start(&registry, &hv, descriptor(&dir, "vm1")).await.unwrap_err();
        assert!(matches!(err, SessionError::AlreadyRunning { .. }));
        assert_eq!(hv.launches(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn boot_timeout_kills_guest() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SessionRegistry::new();
        let hv = FakeHypervisor::new().with_boot(BootBehavior::Hang);
        let err = VmSession::start(&registry, &hv, descriptor(&dir, "vm1")).await.unwrap_err();
        assert!(matches!(err, SessionError::BootTimeout { waited_secs: 30, .. }));
        assert_eq!(hv.live_guests(), 0);
        assert_eq!(hv.exec_count(), 0);
        assert!(!registry.is_live("vm1"));
    }

    #[tokio::test]
    async fn unsupported_transport_is_not_downgraded() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SessionRegistry::new();
        let hv = FakeHypervisor::new().with_transports(vec![FsTransport::NineP]);
        let mount = SharedMount::new("staging", dir.path(), "/rpmgate.staging", FsTransport::VirtioFs);
        let desc = descriptor(&dir, "vm1").with_mount(mount.clone());
        let mut session = VmSession::start(&registry, &hv, desc).await.unwrap();
        let err = session.mount_shared(&[mount]).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::TransportUnsupported { transport: FsTransport::VirtioFs, .. }
        ));
        assert!(hv.mounted().is_empty());
    }

    #[tokio::test]
    async fn mount_failure_after_support_check_is_infrastructure() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SessionRegistry::new();
        let hv = FakeHypervisor::new().with_transports(vec![FsTransport::NineP]);
        hv.fail_mount("staging");
        let mount = SharedMount::new("staging", dir.path(), "/rpmgate.staging", FsTransport::NineP);
        let desc = descriptor(&dir, "vm1").with_mount(mount.clone());
        let mut session = VmSession::start(&registry, &hv, desc).await.unwrap();

        let err = session.mount_shared(&[mount]).await.unwrap_err();
        assert!(matches!(err, SessionError::MountFailed { exit_code: 32, .. }));
        assert_eq!(err.class(), ErrorClass::Infrastructure);
        assert!(err.class().is_retryable());
        assert!(hv.mounted().is_empty());
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[tokio::test]
    async fn undeclared_mount_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SessionRegistry::new();
        let hv = FakeHypervisor::new();
        let mut session = VmSession::start(&registry, &hv, descriptor(&dir, "vm1")).await.unwrap();
        let stray = SharedMount::new("stray", dir.path(), "/stray", FsTransport::NineP);
        assert!(matches!(
            session.mount_shared(&[stray]).await,
            Err(SessionError::UndeclaredMount(_))
        ));
    }

    #[tokio::test]
    async fn exec_reports_exit_codes() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SessionRegistry::new();
        let hv = FakeHypervisor::new();
        hv.script_exit("exit 3", 3, "failing");
        let mut session = VmSession::start(&registry, &hv, descriptor(&dir, "vm1")).await.unwrap();

        let ok = session
            .exec(&GuestCommand::new("ok", "true"), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(ok.passed());

        let failed = session
            .exec(&GuestCommand::new("bad", "exit 3"), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(failed.exit_code, Some(3));
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn exec_timeout_leaves_session_usable() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SessionRegistry::new();
        let hv = FakeHypervisor::new();
        hv.script_hang("sleep forever");
        let mut session = VmSession::start(&registry, &hv, descriptor(&dir, "vm1")).await.unwrap();
        let err = session
            .exec(&GuestCommand::new("slow", "sleep forever"), Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Timeout { limit_ms: 2000, .. }));
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_timeout_still_kills() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SessionRegistry::new();
        let hv = FakeHypervisor::new().ignoring_poweroff();
        let mut session = VmSession::start(&registry, &hv, descriptor(&dir, "vm1")).await.unwrap();
        let err = session.stop(false).await.unwrap_err();
        assert!(matches!(err, SessionError::ShutdownTimeout { .. }));
        assert_eq!(session.state(), SessionState::Failed);
        assert_eq!(hv.live_guests(), 0);
    }

    #[tokio::test]
    async fn drop_kills_guest_and_releases_name() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SessionRegistry::new();
        let hv = FakeHypervisor::new();
        let session = VmSession::start(&registry, &hv, descriptor(&dir, "vm1")).await.unwrap();
        assert_eq!(hv.live_guests(), 1);
        drop(session);
        assert_eq!(hv.live_guests(), 0);
        assert!(!registry.is_live("vm1"));
    }
}
