//! QEMU-backed hypervisor.
//!
//! Each guest runs from a throw-away qcow2 overlay on top of the base image,
//! exposes its serial console on a unix socket and forwards a host port to
//! the guest's ssh daemon. Commands run over ssh as root.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::config::VmSettings;
use crate::domain::Arch;

use super::descriptor::{FsTransport, SharedMount, VmDescriptor};
use super::error::{SessionError, SessionResult};
use super::guest::{ExecOutput, GuestHandle, Hypervisor};

/// ssh exits with 255 when the connection itself failed.
const SSH_CONNECT_FAILURE: i32 = 255;
const ATTACH_RETRIES: u32 = 50;
const ATTACH_INTERVAL: Duration = Duration::from_millis(100);

/// Host-side settings for launching guests.
#[derive(Debug, Clone)]
pub struct QemuOptions {
    /// QEMU binary, `{arch}` substituted.
    pub qemu: String,
    pub qemu_img: String,
    pub virtiofsd: PathBuf,
    pub uefi_firmware: PathBuf,
    pub genisoimage: String,
    pub port_range: (u16, u16),
    pub ssh_key: Option<PathBuf>,
    pub host_arch: Arch,
}

impl QemuOptions {
    pub fn from_settings(settings: &VmSettings) -> Self {
        Self {
            qemu: settings.qemu.clone(),
            qemu_img: settings.qemu_img.clone(),
            virtiofsd: settings.virtiofsd.clone(),
            uefi_firmware: settings.uefi_firmware.clone(),
            genisoimage: "genisoimage".to_string(),
            port_range: settings.port_range,
            ssh_key: settings.ssh_key.clone(),
            host_arch: Arch::host(),
        }
    }
}

/// Forwarded ssh port for a session name, stable across runs.
pub fn ssh_port_for(name: &str, range: (u16, u16)) -> u16 {
    let (low, high) = range;
    let span = u64::from(high.saturating_sub(low)).max(1);
    let hash = Sha256::digest(name.as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&hash[..8]);
    low + (u64::from_be_bytes(head) % span) as u16
}

/// Files a launch needs on the host.
#[derive(Debug, Clone)]
pub struct LaunchPaths {
    pub disk: PathBuf,
    pub console: PathBuf,
    pub seed: Option<PathBuf>,
    /// virtiofsd socket per share tag.
    pub virtiofs_sockets: Vec<(String, PathBuf)>,
}

/// Full QEMU command line, program first.
pub fn qemu_command_line(
    descriptor: &VmDescriptor,
    options: &QemuOptions,
    paths: &LaunchPaths,
    port: u16,
) -> Vec<String> {
    let arch = &descriptor.arch;
    let aarch64 = arch.as_str() == "aarch64";
    let mut cmd: Vec<String> = options
        .qemu
        .replace("{arch}", arch.as_str())
        .split_whitespace()
        .map(str::to_string)
        .collect();
    let mut push = |args: &[&str]| cmd.extend(args.iter().map(|a| a.to_string()));

    let kvm = *arch == options.host_arch;
    if kvm {
        push(&["-enable-kvm", "-cpu", "host"]);
    } else {
        push(&["-machine", "virt"]);
        push(&["-cpu", if aarch64 { "cortex-a72" } else { "max" }]);
    }

    let memory = descriptor.memory.to_string();
    let cpus = descriptor.cpus.to_string();
    push(&["-name", &descriptor.name, "-display", "none"]);
    push(&["-m", &memory, "-smp", &cpus]);

    if aarch64 {
        let firmware = options.uefi_firmware.display().to_string();
        push(&["-bios", &firmware]);
    }

    let drive = format!(
        "file={},if=virtio,format=qcow2,cache=unsafe",
        paths.disk.display()
    );
    push(&["-drive", &drive]);

    let console = format!(
        "socket,id=charserial0,path={},server=on,wait=off",
        paths.console.display()
    );
    push(&["-chardev", &console]);
    if aarch64 {
        push(&["-device", "virtio-serial,id=ser0,max_ports=8"]);
        push(&["-serial", "chardev:charserial0"]);
    } else {
        push(&["-device", "isa-serial,chardev=charserial0,id=serial0"]);
    }

    let netdev = format!(
        "user,id=hostnet0,hostname={},hostfwd=tcp::{port}-:22",
        descriptor.name
    );
    push(&["-netdev", &netdev]);
    if aarch64 {
        push(&["-device", "virtio-net-device,netdev=hostnet0"]);
    } else {
        push(&["-device", "virtio-net-pci,netdev=hostnet0,bus=pci.0,addr=0x3"]);
    }

    let virtiofs: Vec<&SharedMount> = descriptor
        .mounts
        .iter()
        .filter(|m| m.transport == FsTransport::VirtioFs)
        .collect();
    if !virtiofs.is_empty() {
        let backend = format!(
            "memory-backend-file,id=mem,size={}M,mem-path=/dev/shm,share=on",
            descriptor.memory
        );
        push(&["-object", &backend, "-numa", "node,memdev=mem"]);
    }

    for (i, mount) in descriptor.mounts.iter().enumerate() {
        match mount.transport {
            FsTransport::NineP => {
                let mut share = format!(
                    "local,id={tag},path={path},mount_tag={tag},security_model=none",
                    tag = mount.tag,
                    path = mount.host_path.display()
                );
                if mount.read_only {
                    share.push_str(",readonly=on");
                }
                push(&["-virtfs", &share]);
            }
            FsTransport::VirtioFs => {
                let Some((_, socket)) = paths.virtiofs_sockets.iter().find(|(t, _)| *t == mount.tag)
                else {
                    continue;
                };
                let chardev = format!("socket,id=vfs{i},path={}", socket.display());
                let device = format!(
                    "vhost-user-fs-pci,queue-size=1024,chardev=vfs{i},tag={}",
                    mount.tag
                );
                push(&["-chardev", &chardev, "-device", &device]);
            }
        }
    }

    if let Some(seed) = &paths.seed {
        let drive = format!("driver=raw,file={},if=virtio", seed.display());
        push(&["-drive", &drive]);
    }

    cmd
}

/// Launches QEMU guests.
pub struct QemuHypervisor {
    options: QemuOptions,
}

impl QemuHypervisor {
    pub fn new(options: QemuOptions) -> Self {
        Self { options }
    }

    async fn run_tool(program: &str, args: &[String], cwd: Option<&Path>) -> SessionResult<()> {
        let mut cmd = Command::new(program);
        cmd.args(args).stdin(Stdio::null()).stdout(Stdio::null()).stderr(Stdio::piped());
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }
        let output = cmd
            .output()
            .await
            .map_err(|e| SessionError::Launch(format!("{program}: {e}")))?;
        if !output.status.success() {
            return Err(SessionError::Launch(format!(
                "{program} failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    async fn create_overlay(&self, base: &Path, overlay: &Path) -> SessionResult<()> {
        let args = vec![
            "create".to_string(),
            "-f".to_string(),
            "qcow2".to_string(),
            "-F".to_string(),
            "qcow2".to_string(),
            "-o".to_string(),
            format!("backing_file={}", base.display()),
            overlay.display().to_string(),
        ];
        Self::run_tool(&self.options.qemu_img, &args, None).await
    }

    async fn build_seed(&self, descriptor: &VmDescriptor, dir: &Path) -> SessionResult<Option<PathBuf>> {
        let Some(seed) = &descriptor.seed else {
            return Ok(None);
        };
        tokio::fs::write(dir.join("user-data"), &seed.user_data).await?;
        tokio::fs::write(dir.join("meta-data"), &seed.meta_data).await?;
        let iso = dir.join("seed.iso");
        let args: Vec<String> = [
            "-output",
            "seed.iso",
            "-input-charset",
            "utf-8",
            "-volid",
            "cidata",
            "-joliet",
            "-rock",
            "user-data",
            "meta-data",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        Self::run_tool(&self.options.genisoimage, &args, Some(dir)).await?;
        Ok(Some(iso))
    }

    fn spawn_virtiofsd(&self, mount: &SharedMount, socket: &Path) -> SessionResult<Child> {
        let mut cmd = Command::new(&self.options.virtiofsd);
        cmd.arg("--socket-path")
            .arg(socket)
            .arg("--shared-dir")
            .arg(&mount.host_path)
            .args(["--sandbox=none", "--cache", "auto"]);
        if mount.read_only {
            cmd.arg("--readonly");
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SessionError::Launch(format!("virtiofsd for {}: {e}", mount.tag)))
    }

    async fn wait_for_path(path: &Path) -> bool {
        for _ in 0..ATTACH_RETRIES {
            if path.exists() {
                return true;
            }
            tokio::time::sleep(ATTACH_INTERVAL).await;
        }
        false
    }

    async fn attach_console(path: &Path, child: &mut Child) -> SessionResult<UnixStream> {
        for _ in 0..ATTACH_RETRIES {
            if let Ok(Some(status)) = child.try_wait() {
                return Err(SessionError::Launch(format!("qemu exited early: {status}")));
            }
            if let Ok(stream) = UnixStream::connect(path).await {
                return Ok(stream);
            }
            tokio::time::sleep(ATTACH_INTERVAL).await;
        }
        Err(SessionError::Launch(format!(
            "console socket {} never appeared",
            path.display()
        )))
    }
}

#[async_trait]
impl Hypervisor for QemuHypervisor {
    async fn launch(&self, descriptor: &VmDescriptor) -> SessionResult<Box<dyn GuestHandle>> {
        let workdir = tempfile::Builder::new()
            .prefix(&format!("rpmgate-{}-", descriptor.name))
            .tempdir()?;
        let disk = workdir.path().join("disk.qcow2");
        self.create_overlay(&descriptor.image, &disk).await?;
        let seed = self.build_seed(descriptor, workdir.path()).await?;

        let mut helpers = Vec::new();
        let mut virtiofs_sockets = Vec::new();
        for mount in descriptor.mounts.iter().filter(|m| m.transport == FsTransport::VirtioFs) {
            let socket = workdir.path().join(format!("vfs-{}.sock", mount.tag));
            info!(session = %descriptor.name, tag = %mount.tag, "starting virtiofsd");
            helpers.push(self.spawn_virtiofsd(mount, &socket)?);
            if !Self::wait_for_path(&socket).await {
                return Err(SessionError::Launch(format!(
                    "virtiofsd socket for {} never appeared",
                    mount.tag
                )));
            }
            virtiofs_sockets.push((mount.tag.clone(), socket));
        }

        let paths = LaunchPaths {
            disk,
            console: workdir.path().join("console.sock"),
            seed,
            virtiofs_sockets,
        };
        let port = ssh_port_for(&descriptor.name, self.options.port_range);
        let argv = qemu_command_line(descriptor, &self.options, &paths, port);
        debug!(session = %descriptor.name, command = %argv.join(" "), "launching qemu");

        let (program, args) = argv
            .split_first()
            .ok_or_else(|| SessionError::Launch("empty qemu command".into()))?;
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SessionError::Launch(format!("{program}: {e}")))?;

        let console = match Self::attach_console(&paths.console, &mut child).await {
            Ok(stream) => stream,
            Err(e) => {
                let _ = child.kill().await;
                return Err(e);
            }
        };
        info!(session = %descriptor.name, pid = ?child.id(), port, "qemu started");

        Ok(Box::new(QemuGuest {
            name: descriptor.name.clone(),
            child,
            helpers,
            console: Some(console),
            port,
            ssh_key: self.options.ssh_key.clone(),
            _workdir: workdir,
        }))
    }
}

/// A running QEMU process.
pub struct QemuGuest {
    name: String,
    child: Child,
    helpers: Vec<Child>,
    console: Option<UnixStream>,
    port: u16,
    ssh_key: Option<PathBuf>,
    _workdir: TempDir,
}

impl QemuGuest {
    fn ssh(&self) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.args([
            "-oStrictHostKeyChecking=no",
            "-oUserKnownHostsFile=/dev/null",
            "-oLogLevel=ERROR",
            "-oBatchMode=yes",
            "-oConnectTimeout=10",
        ]);
        if let Some(key) = &self.ssh_key {
            cmd.arg("-i").arg(key);
        }
        cmd.arg("-p").arg(self.port.to_string()).arg("root@127.0.0.1");
        cmd
    }

    fn kill_helpers(&mut self) {
        for helper in &mut self.helpers {
            let _ = helper.start_kill();
        }
    }
}

#[async_trait]
impl GuestHandle for QemuGuest {
    async fn read_console(&mut self) -> SessionResult<Option<String>> {
        let Some(console) = self.console.as_mut() else {
            return Ok(None);
        };
        let mut buf = [0u8; 4096];
        let n = console.read(&mut buf).await?;
        if n == 0 {
            self.console = None;
            return Ok(None);
        }
        Ok(Some(String::from_utf8_lossy(&buf[..n]).into_owned()))
    }

    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    async fn supported_transports(&mut self) -> SessionResult<Vec<FsTransport>> {
        let detect = "for fs in 9p virtiofs; do \
                     if grep -qw \"$fs\" /proc/filesystems || modinfo \"$fs\" >/dev/null 2>&1; \
                     then echo \"$fs\"; fi; done";
        let out = self.exec(detect).await?;
        Ok(out
            .output
            .lines()
            .filter_map(|line| match line.trim() {
                "9p" => Some(FsTransport::NineP),
                "virtiofs" => Some(FsTransport::VirtioFs),
                _ => None,
            })
            .collect())
    }

    async fn mount(&mut self, mount: &SharedMount) -> SessionResult<()> {
        let mut options = crate::render::mount_options(mount.transport).to_string();
        if mount.read_only {
            options.push_str(",ro");
        }
        let script = format!(
            "mkdir -p '{path}' && mount -t {fs} -o {options} {tag} '{path}'",
            path = mount.guest_path,
            fs = mount.transport.fs_type(),
            tag = mount.tag,
        );
        let out = self.exec(&script).await?;
        if out.exit_code != 0 {
            return Err(SessionError::MountFailed {
                tag: mount.tag.clone(),
                exit_code: out.exit_code,
                output: out.output.trim().to_string(),
            });
        }
        Ok(())
    }

    async fn exec(&mut self, script: &str) -> SessionResult<ExecOutput> {
        if !self.is_alive() {
            return Err(SessionError::GuestUnreachable(format!("{} is not running", self.name)));
        }
        let mut child = self
            .ssh()
            .args(["-T", "bash", "-s"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(script.as_bytes()).await?;
        }
        let output = child.wait_with_output().await?;
        let exit_code = output.status.code().unwrap_or(-1);
        if exit_code == SSH_CONNECT_FAILURE {
            return Err(SessionError::GuestUnreachable(format!(
                "ssh to {} on port {} failed: {}",
                self.name,
                self.port,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(ExecOutput {
            exit_code,
            output: text,
        })
    }

    async fn request_poweroff(&mut self) -> SessionResult<()> {
        let status = self
            .ssh()
            .arg("systemctl poweroff || poweroff")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status()
            .await?;
        debug!(session = %self.name, ?status, "poweroff requested");
        Ok(())
    }

    async fn wait_exit(&mut self) -> SessionResult<()> {
        self.child.wait().await?;
        self.kill_helpers();
        Ok(())
    }

    async fn kill(&mut self) -> SessionResult<()> {
        self.kill_helpers();
        if let Err(e) = self.child.kill().await {
            warn!(session = %self.name, error = %e, "kill failed");
            return Err(e.into());
        }
        for helper in &mut self.helpers {
            let _ = helper.wait().await;
        }
        Ok(())
    }

    fn kill_now(&mut self) {
        let _ = self.child.start_kill();
        self.kill_helpers();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(host: &str) -> QemuOptions {
        let mut opts = QemuOptions::from_settings(&VmSettings::default());
        opts.host_arch = host.parse().unwrap();
        opts
    }

    fn paths() -> LaunchPaths {
        LaunchPaths {
            disk: PathBuf::from("/run/vm/disk.qcow2"),
            console: PathBuf::from("/run/vm/console.sock"),
            seed: Some(PathBuf::from("/run/vm/seed.iso")),
            virtiofs_sockets: vec![("project".into(), PathBuf::from("/run/vm/vfs-project.sock"))],
        }
    }

    fn joined(args: &[String]) -> String {
        args.join(" ")
    }

    #[test]
    fn native_arch_uses_kvm() {
        let desc = VmDescriptor::new("vm1", "x86_64".parse().unwrap(), "/img");
        let args = qemu_command_line(&desc, &options("x86_64"), &paths(), 10022);
        let line = joined(&args);
        assert_eq!(args[0], "qemu-system-x86_64");
        assert!(line.contains("-enable-kvm"));
        assert!(line.contains("isa-serial,chardev=charserial0"));
        assert!(line.contains("hostfwd=tcp::10022-:22"));
        assert!(line.contains("file=/run/vm/disk.qcow2,if=virtio,format=qcow2"));
        assert!(line.contains("driver=raw,file=/run/vm/seed.iso,if=virtio"));
    }

    #[test]
    fn foreign_aarch64_is_emulated_with_uefi() {
        let desc = VmDescriptor::new("vm1", "aarch64".parse().unwrap(), "/img");
        let line = joined(&qemu_command_line(&desc, &options("x86_64"), &paths(), 10022));
        assert!(line.starts_with("qemu-system-aarch64 -machine virt -cpu cortex-a72"));
        assert!(line.contains("-bios /usr/share/edk2/aarch64/QEMU_EFI.silent.fd"));
        assert!(line.contains("-serial chardev:charserial0"));
        assert!(line.contains("virtio-net-device,netdev=hostnet0"));
    }

    #[test]
    fn shares_per_transport() {
        let desc = VmDescriptor::new("vm1", "x86_64".parse().unwrap(), "/img")
            .with_mount(SharedMount::new("staging", "/srv/stage", "/rpmgate.staging", FsTransport::NineP))
            .with_mount(
                SharedMount::new("project", "/srv/proj", "/rpmgate.project", FsTransport::VirtioFs).read_only(),
            );
        let line = joined(&qemu_command_line(&desc, &options("x86_64"), &paths(), 10022));
        assert!(line.contains(
            "-virtfs local,id=staging,path=/srv/stage,mount_tag=staging,security_model=none"
        ));
        assert!(line.contains("memory-backend-file,id=mem,size=8192M,mem-path=/dev/shm,share=on"));
        assert!(line.contains("socket,id=vfs1,path=/run/vm/vfs-project.sock"));
        assert!(line.contains("vhost-user-fs-pci,queue-size=1024,chardev=vfs1,tag=project"));
    }

    #[test]
    fn port_is_stable_and_in_range() {
        let a = ssh_port_for("rpmgate-req1-x86_64", (10000, 15000));
        let b = ssh_port_for("rpmgate-req1-x86_64", (10000, 15000));
        assert_eq!(a, b);
        assert!((10000..15000).contains(&a));
        assert_eq!(ssh_port_for("x", (2222, 2223)), 2222);
    }
}
