//! Repository metadata generators.
//!
//! A generator reads `<dir>/Packages/*.rpm` and writes `<dir>/repodata/`.
//! It either succeeds or leaves the directory unusable; the store throws a
//! failed directory away, so generators need not clean up after themselves.

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use rpmgate_core::PackageKey;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tokio::process::Command;
use tracing::debug;

use super::error::{RepoError, RepoResult};

pub const PACKAGES_DIR: &str = "Packages";
pub const REPODATA_DIR: &str = "repodata";

#[async_trait]
pub trait MetadataGenerator: Send + Sync {
    /// Regenerate `repodata/` for the packages in `dir`. `revision` is the
    /// generation number; identical inputs must give identical output.
    async fn generate(&self, dir: &Path, revision: u64) -> RepoResult<()>;

    fn name(&self) -> &str;
}

/// Runs `createrepo_c` with deterministic timestamps.
#[derive(Debug, Clone)]
pub struct CreaterepoGenerator {
    command: String,
}

impl CreaterepoGenerator {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl MetadataGenerator for CreaterepoGenerator {
    async fn generate(&self, dir: &Path, revision: u64) -> RepoResult<()> {
        let output = Command::new(&self.command)
            .arg("--quiet")
            .arg("--no-database")
            .arg("--revision")
            .arg(revision.to_string())
            .arg("--set-timestamp-to-revision")
            .arg(dir)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| RepoError::Generator(format!("failed to run {}: {e}", self.command)))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RepoError::Generator(format!(
                "{} exited with {}: {}",
                self.command,
                output.status,
                stderr.trim()
            )));
        }
        Ok(())
    }

    fn name(&self) -> &str {
        &self.command
    }
}

/// Self-contained JSON index: `repodata/primary.json` plus a `repomd.json`
/// carrying its checksum. Used where createrepo is not installed.
#[derive(Debug, Clone, Copy, Default)]
pub struct IndexGenerator;

#[derive(Serialize)]
struct IndexEntry {
    file: String,
    name: String,
    evr: String,
    arch: String,
    sha256: String,
    size: u64,
}

#[derive(Serialize)]
struct Primary {
    revision: u64,
    packages: Vec<IndexEntry>,
}

#[derive(Serialize)]
struct RepoMd<'a> {
    revision: u64,
    primary: RepoMdFile<'a>,
}

#[derive(Serialize)]
struct RepoMdFile<'a> {
    location: &'a str,
    sha256: String,
    size: usize,
}

impl IndexGenerator {
    fn generate_blocking(dir: &Path, revision: u64) -> RepoResult<()> {
        let mut files: Vec<PathBuf> = fs::read_dir(dir.join(PACKAGES_DIR))?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "rpm"))
            .collect();
        files.sort();

        let mut packages = Vec::with_capacity(files.len());
        for path in files {
            let file = path
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| RepoError::Generator(format!("bad file name {}", path.display())))?
                .to_string();
            let key = PackageKey::from_file_name(&file)
                .map_err(|e| RepoError::Generator(e.to_string()))?;
            let (sha256, size) = sha256_file(&path)?;
            packages.push(IndexEntry {
                file,
                name: key.name,
                evr: key.evr.to_string(),
                arch: key.arch.to_string(),
                sha256,
                size,
            });
        }

        let repodata = dir.join(REPODATA_DIR);
        fs::create_dir_all(&repodata)?;
        let primary = serde_json::to_vec_pretty(&Primary { revision, packages })?;
        write_atomic(&repodata.join("primary.json"), &primary)?;
        let repomd = RepoMd {
            revision,
            primary: RepoMdFile {
                location: "repodata/primary.json",
                sha256: hex::encode(Sha256::digest(&primary)),
                size: primary.len(),
            },
        };
        write_atomic(&repodata.join("repomd.json"), &serde_json::to_vec_pretty(&repomd)?)?;
        debug!(dir = %dir.display(), revision, "index written");
        Ok(())
    }
}

#[async_trait]
impl MetadataGenerator for IndexGenerator {
    async fn generate(&self, dir: &Path, revision: u64) -> RepoResult<()> {
        let dir = dir.to_path_buf();
        tokio::task::spawn_blocking(move || Self::generate_blocking(&dir, revision))
            .await
            .map_err(|e| RepoError::Generator(format!("index task failed: {e}")))?
    }

    fn name(&self) -> &str {
        "index"
    }
}

/// Hex sha256 and size of a file, streamed.
pub fn sha256_file(path: &Path) -> RepoResult<(String, u64)> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    let mut size = 0u64;
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((hex::encode(hasher.finalize()), size))
}

pub(crate) fn write_atomic(path: &Path, data: &[u8]) -> RepoResult<()> {
    let dir = path
        .parent()
        .ok_or_else(|| RepoError::Corrupt(format!("{} has no parent", path.display())))?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn index_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let pkgs = dir.path().join(PACKAGES_DIR);
        fs::create_dir_all(&pkgs).unwrap();
        fs::write(pkgs.join("foo-1.0-1.x86_64.rpm"), b"foo").unwrap();
        fs::write(pkgs.join("bar-2.0-1.noarch.rpm"), b"bar").unwrap();

        IndexGenerator.generate(dir.path(), 3).await.unwrap();
        let first = fs::read(dir.path().join("repodata/primary.json")).unwrap();
        IndexGenerator.generate(dir.path(), 3).await.unwrap();
        let second = fs::read(dir.path().join("repodata/primary.json")).unwrap();
        assert_eq!(first, second);

        let text = String::from_utf8(first).unwrap();
        assert!(text.find("bar-2.0-1.noarch.rpm").unwrap() < text.find("foo-1.0-1.x86_64.rpm").unwrap());
    }

    #[tokio::test]
    async fn foreign_files_are_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let pkgs = dir.path().join(PACKAGES_DIR);
        fs::create_dir_all(&pkgs).unwrap();
        fs::write(pkgs.join("not-an-rpm.rpm"), b"x").unwrap();
        let err = IndexGenerator.generate(dir.path(), 1).await.unwrap_err();
        assert!(matches!(err, RepoError::Generator(_)));
    }
}
