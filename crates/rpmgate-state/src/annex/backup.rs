//! Backup archives: gzip-compressed tar holding `blobs/<digest>` and one
//! `entries/<n>.json` per annex entry. A JSON manifest is written beside
//! each archive.

use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use uuid::Uuid;

use super::entry::AnnexEntry;
use super::error::{AnnexError, AnnexResult};

/// Which entries a backup covers. Bounds are inclusive UTC epoch seconds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackupSelector {
    pub since: Option<i64>,
    pub until: Option<i64>,
    pub artifact_prefix: Option<String>,
    /// Also include entries already covered by an earlier backup.
    pub include_backed_up: bool,
}

impl BackupSelector {
    /// Everything not yet backed up.
    pub fn pending() -> Self {
        Self::default()
    }

    pub fn all() -> Self {
        Self {
            include_backed_up: true,
            ..Self::default()
        }
    }

    pub fn since(mut self, ts: i64) -> Self {
        self.since = Some(ts);
        self
    }

    pub fn until(mut self, ts: i64) -> Self {
        self.until = Some(ts);
        self
    }

    pub fn matching(mut self, prefix: impl Into<String>) -> Self {
        self.artifact_prefix = Some(prefix.into());
        self
    }

    pub fn matches(&self, entry: &AnnexEntry) -> bool {
        (self.include_backed_up || !entry.backed_up)
            && self.since.map_or(true, |s| entry.timestamp >= s)
            && self.until.map_or(true, |u| entry.timestamp <= u)
            && self
                .artifact_prefix
                .as_deref()
                .map_or(true, |p| entry.artifact.starts_with(p))
    }
}

/// Describes one backup archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupManifest {
    pub id: Uuid,
    pub archive: PathBuf,
    /// UTC epoch seconds.
    pub created_at: i64,
    pub entries: Vec<AnnexEntry>,
}

impl BackupManifest {
    /// Sidecar path for an archive: `x.tar.gz` -> `x.manifest.json`.
    pub fn path_for(archive: &Path) -> PathBuf {
        let name = archive
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.trim_end_matches(".tar.gz"))
            .unwrap_or("backup");
        archive.with_file_name(format!("{name}.manifest.json"))
    }

    pub fn load(path: impl AsRef<Path>) -> AnnexResult<Self> {
        let raw = fs::read(path.as_ref())?;
        Ok(serde_json::from_slice(&raw)?)
    }

    pub(crate) fn save(&self) -> AnnexResult<PathBuf> {
        let path = Self::path_for(&self.archive);
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(&serde_json::to_vec_pretty(self)?)?;
        tmp.persist(&path).map_err(|e| e.error)?;
        Ok(path)
    }
}

/// Write `entries` and their blobs (read via `blob_path`) into `archive`.
pub(crate) fn write_archive(
    archive: &Path,
    entries: &[AnnexEntry],
    blob_path: impl Fn(&str) -> PathBuf,
) -> AnnexResult<()> {
    let dir = archive.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;
    let tmp = NamedTempFile::new_in(dir)?;
    let encoder = GzEncoder::new(tmp, Compression::default());
    let mut builder = tar::Builder::new(encoder);

    let mut written = BTreeSet::new();
    for entry in entries {
        if written.insert(entry.digest.as_str()) {
            let mut blob = File::open(blob_path(&entry.digest))?;
            builder.append_file(format!("blobs/{}", entry.digest), &mut blob)?;
        }
    }
    for (i, entry) in entries.iter().enumerate() {
        let json = serde_json::to_vec(entry)?;
        let mut header = tar::Header::new_gnu();
        header.set_size(json.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(entry.timestamp.max(0) as u64);
        header.set_cksum();
        builder.append_data(&mut header, format!("entries/{i:06}.json"), json.as_slice())?;
    }

    let tmp = builder.into_inner()?.finish()?;
    tmp.persist(archive).map_err(|e| e.error)?;
    Ok(())
}

/// Contents of a backup archive, blobs verified against their names.
pub(crate) struct ArchiveContents {
    pub blobs: Vec<(String, Vec<u8>)>,
    pub entries: Vec<AnnexEntry>,
}

pub(crate) fn read_archive(archive: &Path) -> AnnexResult<ArchiveContents> {
    let bad = |detail: String| AnnexError::BadArchive {
        archive: archive.display().to_string(),
        detail,
    };
    let file = File::open(archive).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => AnnexError::NotBackedUp(archive.display().to_string()),
        _ => AnnexError::Io(e),
    })?;
    let mut tar = tar::Archive::new(GzDecoder::new(file));

    let mut contents = ArchiveContents {
        blobs: Vec::new(),
        entries: Vec::new(),
    };
    for item in tar.entries()? {
        let mut item = item?;
        let path = item.path()?.to_string_lossy().into_owned();
        let mut data = Vec::new();
        item.read_to_end(&mut data)?;
        if let Some(digest) = path.strip_prefix("blobs/") {
            let actual = hex::encode(Sha256::digest(&data));
            if actual != digest {
                return Err(AnnexError::Corrupt {
                    digest: digest.to_string(),
                    detail: format!("archived content hashes to {actual}"),
                });
            }
            contents.blobs.push((digest.to_string(), data));
        } else if path.starts_with("entries/") {
            contents.entries.push(serde_json::from_slice(&data)?);
        } else {
            return Err(bad(format!("unexpected member {path}")));
        }
    }
    for entry in &contents.entries {
        if !contents.blobs.iter().any(|(d, _)| d == &entry.digest) {
            return Err(bad(format!("entry {} has no blob", entry.artifact)));
        }
    }
    Ok(contents)
}
