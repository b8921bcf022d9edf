//! `mock` build roots.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::{ProjectConfig, RepoConfig};
use crate::domain::{Arch, BuildArtifact, DomainError, Evr};
use crate::render::{self, ProxyConfig, RenderContext};

use super::error::{BuildError, BuildResult};
use super::root::{BuildRoot, BuildRootProvider, PackageSpec};

const SYSTEM_MOCK_DIR: &str = "/etc/mock";
const SYSTEM_MOCK_FILES: &[&str] = &["logging.ini", "site-defaults.cfg"];
const LOG_TAIL_LINES: usize = 30;

/// Lines mock and dnf print when build requirements cannot be satisfied.
const DEPENDENCY_MARKERS: &[&str] = &[
    "No matching package to install",
    "nothing provides",
    "Failed build dependencies",
    "conflicting requests",
    "Problem: package",
];

/// Map a failed mock run to a build error.
pub fn classify_failure(package: &str, output: &str) -> BuildError {
    if let Some(line) = output
        .lines()
        .find(|line| DEPENDENCY_MARKERS.iter().any(|m| line.contains(m)))
    {
        return BuildError::DependencyUnresolved {
            package: package.to_string(),
            detail: line.trim().to_string(),
        };
    }
    let lines: Vec<&str> = output.lines().collect();
    let tail = lines[lines.len().saturating_sub(LOG_TAIL_LINES)..].join("\n");
    BuildError::CompileFailed {
        package: package.to_string(),
        detail: tail,
    }
}

/// Renders mock configs into a private config directory per root.
#[derive(Debug, Clone)]
pub struct MockProvider {
    mock: String,
    rpm: String,
    config_dir: PathBuf,
    project: String,
    proxy: ProxyConfig,
    timeout: Duration,
}

impl MockProvider {
    pub fn new(config: &ProjectConfig, config_dir: impl Into<PathBuf>) -> Self {
        Self {
            mock: config.build.mock.clone(),
            rpm: config.build.rpm.clone(),
            config_dir: config_dir.into(),
            project: config.name.clone(),
            proxy: ProxyConfig {
                proxy: config.proxy.clone(),
                no_proxy: config.no_proxy.clone(),
            },
            timeout: Duration::from_secs(config.build.timeout),
        }
    }

    fn install_support_files(dir: &Path) -> std::io::Result<()> {
        for file in SYSTEM_MOCK_FILES {
            let system = Path::new(SYSTEM_MOCK_DIR).join(file);
            let target = dir.join(file);
            if system.exists() {
                std::fs::copy(&system, &target)?;
            } else if !target.exists() {
                std::fs::write(&target, "")?;
            }
        }
        Ok(())
    }
}

impl BuildRootProvider for MockProvider {
    fn create(&self, arch: &Arch, slot: usize, repos: &[RepoConfig]) -> BuildResult<Box<dyn BuildRoot>> {
        let root = format!("rpmgate-{}-{}-{}", self.project, arch, slot);
        let ctx = RenderContext {
            name: root.clone(),
            arch: arch.clone(),
            repos: repos.to_vec(),
            proxy: self.proxy.clone(),
        };
        let dir = self.config_dir.join(&root);
        std::fs::create_dir_all(&dir)?;
        Self::install_support_files(&dir)?;
        std::fs::write(dir.join(format!("{root}.cfg")), render::mock_config(&ctx))?;
        debug!(root = %root, dir = %dir.display(), "mock config rendered");

        Ok(Box::new(MockBuildRoot {
            mock: self.mock.clone(),
            rpm: self.rpm.clone(),
            config_dir: dir,
            root,
            timeout: self.timeout,
        }))
    }
}

/// One mock chroot.
#[derive(Debug)]
pub struct MockBuildRoot {
    mock: String,
    rpm: String,
    config_dir: PathBuf,
    root: String,
    timeout: Duration,
}

impl MockBuildRoot {
    fn base(&self) -> Command {
        let mut cmd = Command::new(&self.mock);
        cmd.arg(format!("--configdir={}", self.config_dir.display()))
            .arg("-r")
            .arg(&self.root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    /// Run mock; `Ok` carries the combined output of a successful run.
    async fn run(&self, package: &str, mut cmd: Command, resultdir: &Path) -> BuildResult<String> {
        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| BuildError::CompileFailed {
                package: package.to_string(),
                detail: format!("mock timed out after {}s", self.timeout.as_secs()),
            })?
            .map_err(|e| BuildError::Setup(format!("{}: {e}", self.mock)))?;

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        if output.status.success() {
            return Ok(text);
        }
        for log in ["root.log", "build.log"] {
            if let Ok(extra) = tokio::fs::read_to_string(resultdir.join(log)).await {
                text.push_str(&extra);
            }
        }
        Err(classify_failure(package, &text))
    }
}

/// `rpm -qp` query format; `EPOCHNUM` is `0` for packages without `Epoch:`.
const EVR_QUERY_FORMAT: &str = "%{EPOCHNUM}:%{VERSION}-%{RELEASE}";

/// Parse the output of an [`EVR_QUERY_FORMAT`] query.
pub fn parse_header_evr(output: &str) -> Result<Evr, DomainError> {
    output.trim().parse()
}

async fn rpms_in(dir: &Path) -> BuildResult<Vec<PathBuf>> {
    let mut found = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().is_some_and(|e| e == "rpm") {
            found.push(path);
        }
    }
    found.sort();
    Ok(found)
}

#[async_trait]
impl BuildRoot for MockBuildRoot {
    async fn reset(&mut self) -> BuildResult<()> {
        let output = self
            .base()
            .arg("--clean")
            .output()
            .await
            .map_err(|e| BuildError::Setup(format!("{}: {e}", self.mock)))?;
        if !output.status.success() {
            return Err(BuildError::Setup(format!(
                "mock --clean failed for {}: {}",
                self.root,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    async fn build(&mut self, spec: &PackageSpec, outdir: &Path) -> BuildResult<Vec<PathBuf>> {
        let srpm_dir = outdir.join("srpm");
        tokio::fs::create_dir_all(&srpm_dir).await?;

        info!(root = %self.root, package = %spec.name, "building source rpm");
        let mut cmd = self.base();
        cmd.arg("--buildsrpm")
            .arg("--spec")
            .arg(&spec.spec)
            .arg("--sources")
            .arg(&spec.sources)
            .arg("--resultdir")
            .arg(&srpm_dir);
        self.run(&spec.name, cmd, &srpm_dir).await?;

        let srpm = rpms_in(&srpm_dir)
            .await?
            .into_iter()
            .find(|p| p.to_string_lossy().ends_with(".src.rpm"))
            .ok_or_else(|| BuildError::CompileFailed {
                package: spec.name.clone(),
                detail: "mock produced no source rpm".into(),
            })?;

        info!(root = %self.root, package = %spec.name, srpm = %srpm.display(), "rebuilding binary rpms");
        let mut cmd = self.base();
        cmd.arg("--rebuild").arg(&srpm).arg("--resultdir").arg(outdir);
        self.run(&spec.name, cmd, outdir).await?;

        let mut produced = rpms_in(outdir).await?;
        if !produced.iter().any(|p| p.to_string_lossy().ends_with(".src.rpm")) {
            let target = outdir.join(srpm.file_name().unwrap_or_default());
            tokio::fs::rename(&srpm, &target).await?;
            produced.push(target);
        }
        Ok(produced)
    }

    async fn describe(&mut self, rpm: &Path, build_id: &str) -> BuildResult<BuildArtifact> {
        let mut artifact = BuildArtifact::from_path(rpm, build_id)?;
        let output = Command::new(&self.rpm)
            .args(["-qp", "--nosignature", "--nodigest", "--queryformat", EVR_QUERY_FORMAT])
            .arg(rpm)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| BuildError::Setup(format!("{}: {e}", self.rpm)))?;
        if !output.status.success() {
            return Err(BuildError::Setup(format!(
                "cannot read header of {}: {}",
                rpm.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        let evr = parse_header_evr(&String::from_utf8_lossy(&output.stdout))?;
        if evr.version != artifact.key.evr.version || evr.release != artifact.key.evr.release {
            return Err(DomainError::InvalidRpmName(format!(
                "{} does not match its header {evr}",
                rpm.display()
            ))
            .into());
        }
        artifact.key.evr = evr;
        Ok(artifact)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dependency_failures_are_recognised() {
        let out = "Start: dnf install\nNo matching package to install: 'libfoo-devel >= 2'\nFinish";
        match classify_failure("foo", out) {
            BuildError::DependencyUnresolved { package, detail } => {
                assert_eq!(package, "foo");
                assert!(detail.contains("libfoo-devel"));
            }
            other => panic!("expected DependencyUnresolved, got {other:?}"),
        }
    }

    #[test]
    fn other_failures_keep_log_tail() {
        let out: String = (0..100).map(|i| format!("line {i}\n")).collect();
        match classify_failure("foo", &out) {
            BuildError::CompileFailed { detail, .. } => {
                assert!(detail.starts_with("line 70"));
                assert!(detail.ends_with("line 99"));
            }
            other => panic!("expected CompileFailed, got {other:?}"),
        }
    }

    #[test]
    fn provider_renders_config_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config = ProjectConfig::from_toml_str("name = \"acme\"\narch = [\"x86_64\"]\n").unwrap();
        let provider = MockProvider::new(&config, dir.path());
        let arch: Arch = "x86_64".parse().unwrap();
        let repos = vec![RepoConfig::local("staging", "/tmp/stage")];
        provider.create(&arch, 1, &repos).unwrap();

        let root_dir = dir.path().join("rpmgate-acme-x86_64-1");
        let cfg = std::fs::read_to_string(root_dir.join("rpmgate-acme-x86_64-1.cfg")).unwrap();
        assert!(cfg.contains("config_opts['root'] = 'rpmgate-acme-x86_64-1'"));
        assert!(cfg.contains("[staging]"));
        assert!(root_dir.join("site-defaults.cfg").exists());
    }

    #[test]
    fn header_evr_keeps_epoch() {
        assert_eq!(parse_header_evr("1:1.0-1\n").unwrap(), Evr::new(1, "1.0", "1"));
        assert_eq!(parse_header_evr("0:2.0-3.el9").unwrap(), Evr::new(0, "2.0", "3.el9"));
        assert!(parse_header_evr("(none)").is_err());
    }

    #[cfg(unix)]
    fn fake_rpm(dir: &Path, stdout: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("rpm");
        std::fs::write(&path, format!("#!/bin/sh\nprintf '{stdout}'\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn describe_reads_epoch_from_header() {
        let dir = tempfile::tempdir().unwrap();
        let rpm = fake_rpm(dir.path(), "1:1.0-1");
        let config = ProjectConfig::from_toml_str(&format!(
            "name = \"acme\"\narch = [\"x86_64\"]\n[build]\nrpm = \"{}\"\n",
            rpm.display()
        ))
        .unwrap();
        let arch: Arch = "x86_64".parse().unwrap();
        let mut root = MockProvider::new(&config, dir.path().join("cfg"))
            .create(&arch, 0, &[])
            .unwrap();

        let package = dir.path().join("foo-1.0-1.x86_64.rpm");
        std::fs::write(&package, b"rpm").unwrap();
        let artifact = root.describe(&package, "b1").await.unwrap();
        assert_eq!(artifact.key.evr, Evr::new(1, "1.0", "1"));
        assert_eq!(artifact.key.name, "foo");

        let renamed = dir.path().join("foo-1.1-1.x86_64.rpm");
        std::fs::write(&renamed, b"rpm").unwrap();
        assert!(matches!(
            root.describe(&renamed, "b1").await,
            Err(BuildError::Output(_))
        ));
    }
}
