//! Content-addressed artifact archive.
//!
//! Layout: `<root>/objects/<first 2 hex chars>/<remaining hex chars>` for
//! blobs and `<root>/index.json` for entries. Identical content is stored
//! once; each new artifact name pointing at it adds an entry.

mod backup;
mod entry;
mod error;

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use rpmgate_core::obs::emit_annex_stored;
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::{info, warn};
use uuid::Uuid;

pub use backup::{BackupManifest, BackupSelector};
pub use entry::{parse_timestamp, AnnexEntry, TIMESTAMP_FORMAT};
pub use error::{AnnexError, AnnexResult};

type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

const INDEX: &str = "index.json";

pub struct Annex {
    root: PathBuf,
    objects_dir: PathBuf,
    backup_dir: PathBuf,
    entries: Mutex<Arc<Vec<AnnexEntry>>>,
    clock: Clock,
}

impl Annex {
    /// Open the annex at `root`, creating it if needed.
    pub fn open(root: impl AsRef<Path>, backup_dir: impl AsRef<Path>) -> AnnexResult<Self> {
        let root = root.as_ref().to_path_buf();
        let objects_dir = root.join("objects");
        fs::create_dir_all(&objects_dir)?;
        let mut entries: Vec<AnnexEntry> = match fs::read(root.join(INDEX)) {
            Ok(raw) => serde_json::from_slice(&raw)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        entries.sort_by_key(|e| e.timestamp);
        Ok(Self {
            root,
            objects_dir,
            backup_dir: backup_dir.as_ref().to_path_buf(),
            entries: Mutex::new(Arc::new(entries)),
            clock: Arc::new(|| chrono::Utc::now().timestamp()),
        })
    }

    /// Replace the time source (UTC epoch seconds).
    pub fn with_clock(mut self, clock: impl Fn() -> i64 + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn lock(&self) -> MutexGuard<'_, Arc<Vec<AnnexEntry>>> {
        self.entries.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn blob_path(&self, digest: &str) -> PathBuf {
        self.objects_dir.join(&digest[..2]).join(&digest[2..])
    }

    fn relative_blob_path(digest: &str) -> PathBuf {
        Path::new("objects").join(&digest[..2]).join(&digest[2..])
    }

    fn persist_index(&self, entries: &[AnnexEntry]) -> AnnexResult<()> {
        let mut tmp = NamedTempFile::new_in(&self.root)?;
        tmp.write_all(&serde_json::to_vec_pretty(entries)?)?;
        tmp.persist(self.root.join(INDEX)).map_err(|e| e.error)?;
        Ok(())
    }

    fn write_blob(&self, digest: &str, data: &[u8]) -> AnnexResult<bool> {
        let path = self.blob_path(digest);
        if path.exists() {
            return Ok(false);
        }
        let shard_dir = path.parent().unwrap_or(&self.objects_dir);
        fs::create_dir_all(shard_dir)?;
        let mut tmp = NamedTempFile::new_in(shard_dir)?;
        tmp.write_all(data)?;
        tmp.persist(&path).map_err(|e| e.error)?;
        Ok(true)
    }

    /// Store `data` under the name `artifact`.
    ///
    /// Storing the same bytes under the same name again returns the existing
    /// entry. Timestamps never go backwards, even if the clock does.
    pub fn store(&self, artifact: &str, data: &[u8]) -> AnnexResult<AnnexEntry> {
        let digest = hex::encode(Sha256::digest(data));
        let mut guard = self.lock();
        if let Some(existing) = guard
            .iter()
            .find(|e| e.digest == digest && e.artifact == artifact)
        {
            return Ok(existing.clone());
        }

        let fresh = self.write_blob(&digest, data)?;
        let last = guard.last().map_or(i64::MIN, |e| e.timestamp);
        let entry = AnnexEntry {
            digest: digest.clone(),
            artifact: artifact.to_string(),
            storage_path: Self::relative_blob_path(&digest),
            size: data.len() as u64,
            timestamp: (self.clock)().max(last),
            backed_up: false,
        };
        let mut next = (**guard).clone();
        next.push(entry.clone());
        self.persist_index(&next)?;
        *guard = Arc::new(next);

        emit_annex_stored(&digest, artifact, !fresh);
        Ok(entry)
    }

    /// Store the file at `path` under its file name.
    pub fn store_file(&self, path: impl AsRef<Path>) -> AnnexResult<AnnexEntry> {
        let path = path.as_ref();
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        let data = fs::read(path)?;
        self.store(&name, &data)
    }

    /// Content for `digest`, verified on read.
    pub fn get(&self, digest: &str) -> AnnexResult<Vec<u8>> {
        if digest.len() < 3 || !digest.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(AnnexError::NotFound(digest.to_string()));
        }
        let data = fs::read(self.blob_path(digest)).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => AnnexError::NotFound(digest.to_string()),
            _ => AnnexError::Io(e),
        })?;
        let actual = hex::encode(Sha256::digest(&data));
        if actual != digest {
            return Err(AnnexError::Corrupt {
                digest: digest.to_string(),
                detail: format!("content hashes to {actual}"),
            });
        }
        Ok(data)
    }

    /// Entries stored at or after `since`, oldest first.
    pub fn list(&self, since: Option<i64>) -> AnnexListing {
        AnnexListing {
            entries: Arc::clone(&*self.lock()),
            since,
        }
    }

    /// Archive the selected entries and mark them backed up.
    pub fn backup(&self, selector: &BackupSelector) -> AnnexResult<BackupManifest> {
        let mut guard = self.lock();
        let selected: Vec<AnnexEntry> = guard
            .iter()
            .filter(|e| selector.matches(e))
            .map(|e| AnnexEntry {
                backed_up: true,
                ..e.clone()
            })
            .collect();
        if selected.is_empty() {
            return Err(AnnexError::EmptySelection);
        }

        let created_at = (self.clock)();
        let id = Uuid::new_v4();
        let stamp = entry::utc(created_at).format("%Y%m%dT%H%M%SZ");
        let archive = self
            .backup_dir
            .join(format!("annex-{stamp}-{}.tar.gz", &id.simple().to_string()[..8]));
        backup::write_archive(&archive, &selected, |d| self.blob_path(d))?;

        let manifest = BackupManifest {
            id,
            archive,
            created_at,
            entries: selected,
        };
        manifest.save()?;

        let mut next = (**guard).clone();
        for entry in next.iter_mut() {
            if manifest.entries.iter().any(|m| m.same_reference(entry)) {
                entry.backed_up = true;
            }
        }
        self.persist_index(&next)?;
        *guard = Arc::new(next);

        info!(
            archive = %manifest.archive.display(),
            entries = manifest.entries.len(),
            "annex backup written"
        );
        Ok(manifest)
    }

    /// Bring the archive's entries and blobs back. Returns the archived
    /// entries, oldest first.
    pub fn restore(&self, manifest: &BackupManifest) -> AnnexResult<Vec<AnnexEntry>> {
        let contents = backup::read_archive(&manifest.archive)?;
        for expected in &manifest.entries {
            if !contents.entries.iter().any(|e| e.same_reference(expected)) {
                return Err(AnnexError::BadArchive {
                    archive: manifest.archive.display().to_string(),
                    detail: format!("missing entry for {}", expected.artifact),
                });
            }
        }

        let mut guard = self.lock();
        for (digest, data) in &contents.blobs {
            self.write_blob(digest, data)?;
        }
        let mut next = (**guard).clone();
        let mut restored = contents.entries;
        restored.sort_by_key(|e| e.timestamp);
        for entry in &restored {
            if !next.iter().any(|e| e.same_reference(entry)) {
                let at = next.partition_point(|e| e.timestamp <= entry.timestamp);
                next.insert(at, entry.clone());
            }
        }
        self.persist_index(&next)?;
        *guard = Arc::new(next);

        info!(archive = %manifest.archive.display(), entries = restored.len(), "annex restored");
        Ok(restored)
    }

    /// Delete the entries covered by `manifest`, then any blob no entry
    /// references any more. Requires the archive to still exist.
    pub fn purge(&self, manifest: &BackupManifest) -> AnnexResult<usize> {
        if !manifest.archive.exists() {
            return Err(AnnexError::NotBackedUp(manifest.archive.display().to_string()));
        }
        let mut guard = self.lock();
        let before = guard.len();
        let next: Vec<AnnexEntry> = guard
            .iter()
            .filter(|e| !(e.backed_up && manifest.entries.iter().any(|m| m.same_reference(e))))
            .cloned()
            .collect();
        let removed = before - next.len();

        self.persist_index(&next)?;
        for m in &manifest.entries {
            if !next.iter().any(|e| e.digest == m.digest) {
                if let Err(e) = fs::remove_file(self.blob_path(&m.digest)) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!(digest = %m.digest, error = %e, "failed to remove annex blob");
                    }
                }
            }
        }
        *guard = Arc::new(next);
        info!(archive = %manifest.archive.display(), removed, "annex purged");
        Ok(removed)
    }
}

/// A point-in-time listing. Iterating it again yields the same entries.
#[derive(Debug, Clone)]
pub struct AnnexListing {
    entries: Arc<Vec<AnnexEntry>>,
    since: Option<i64>,
}

impl AnnexListing {
    pub fn iter(&self) -> impl Iterator<Item = &AnnexEntry> + '_ {
        let start = self
            .since
            .map_or(0, |s| self.entries.partition_point(|e| e.timestamp < s));
        self.entries[start..].iter()
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }
}

impl<'a> IntoIterator for &'a AnnexListing {
    type Item = &'a AnnexEntry;
    type IntoIter = Box<dyn Iterator<Item = &'a AnnexEntry> + 'a>;

    fn into_iter(self) -> Self::IntoIter {
        Box::new(self.iter())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicI64, Ordering};

    use super::*;

    fn open() -> (tempfile::TempDir, Annex) {
        let dir = tempfile::tempdir().unwrap();
        let annex = Annex::open(dir.path().join("annex"), dir.path().join("backups")).unwrap();
        (dir, annex)
    }

    #[test]
    fn identical_content_is_stored_once() {
        let (dir, annex) = open();
        let a = annex.store("foo-1.0-1.x86_64.rpm", b"payload").unwrap();
        let again = annex.store("foo-1.0-1.x86_64.rpm", b"payload").unwrap();
        let b = annex.store("foo-copy.rpm", b"payload").unwrap();
        assert_eq!(a, again);
        assert_eq!(a.digest, b.digest);
        assert_eq!(annex.list(None).len(), 2);

        let shard = dir.path().join("annex/objects").join(&a.digest[..2]);
        assert_eq!(fs::read_dir(shard).unwrap().count(), 1);
        assert_eq!(annex.get(&a.digest).unwrap(), b"payload");
    }

    #[test]
    fn unknown_digest_is_not_found() {
        let (_dir, annex) = open();
        let missing = hex::encode(Sha256::digest(b"nothing"));
        assert!(matches!(annex.get(&missing), Err(AnnexError::NotFound(_))));
        assert!(matches!(annex.get("zz"), Err(AnnexError::NotFound(_))));
    }

    #[test]
    fn timestamps_never_go_backwards() {
        let now = Arc::new(AtomicI64::new(1_000));
        let clock = Arc::clone(&now);
        let (_dir, annex) = open();
        let annex = annex.with_clock(move || clock.load(Ordering::SeqCst));

        annex.store("a", b"a").unwrap();
        now.store(500, Ordering::SeqCst);
        annex.store("b", b"b").unwrap();
        now.store(2_000, Ordering::SeqCst);
        annex.store("c", b"c").unwrap();

        let ts: Vec<i64> = annex.list(None).iter().map(|e| e.timestamp).collect();
        assert_eq!(ts, vec![1_000, 1_000, 2_000]);
        let recent_listing = annex.list(Some(1_500));
        let recent: Vec<&str> = recent_listing
            .iter()
            .map(|e| e.artifact.as_str())
            .collect();
        assert_eq!(recent, vec!["c"]);
    }

    #[test]
    fn listing_is_a_stable_snapshot() {
        let (_dir, annex) = open();
        annex.store("a", b"a").unwrap();
        let listing = annex.list(None);
        annex.store("b", b"b").unwrap();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing.iter().count(), listing.iter().count());
        assert_eq!(annex.list(None).len(), 2);
    }

    #[test]
    fn index_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("annex");
        {
            let annex = Annex::open(&root, dir.path().join("b")).unwrap();
            annex.store("a", b"a").unwrap();
        }
        let annex = Annex::open(&root, dir.path().join("b")).unwrap();
        assert_eq!(annex.list(None).len(), 1);
    }

    #[test]
    fn backup_restore_purge_cycle() {
        let (_dir, annex) = open();
        let a = annex.store("a.rpm", b"alpha").unwrap();
        annex.store("b.rpm", b"beta").unwrap();

        let manifest = annex.backup(&BackupSelector::pending()).unwrap();
        assert_eq!(manifest.entries.len(), 2);
        assert!(manifest.archive.exists());
        assert!(annex.list(None).iter().all(|e| e.backed_up));
        assert!(matches!(
            annex.backup(&BackupSelector::pending()),
            Err(AnnexError::EmptySelection)
        ));

        let reloaded = BackupManifest::load(BackupManifest::path_for(&manifest.archive)).unwrap();
        assert_eq!(reloaded, manifest);

        assert_eq!(annex.purge(&manifest).unwrap(), 2);
        assert!(annex.list(None).is_empty());
        assert!(matches!(annex.get(&a.digest), Err(AnnexError::NotFound(_))));

        let restored = annex.restore(&manifest).unwrap();
        assert_eq!(restored.len(), 2);
        assert_eq!(annex.get(&a.digest).unwrap(), b"alpha");
        assert_eq!(annex.list(None).len(), 2);
    }

    #[test]
    fn purge_requires_archive() {
        let (_dir, annex) = open();
        annex.store("a.rpm", b"alpha").unwrap();
        let manifest = annex.backup(&BackupSelector::all()).unwrap();
        fs::remove_file(&manifest.archive).unwrap();
        assert!(matches!(annex.purge(&manifest), Err(AnnexError::NotBackedUp(_))));
        assert_eq!(annex.list(None).len(), 1);
    }

    #[test]
    fn purge_keeps_blobs_still_referenced() {
        let (_dir, annex) = open();
        let a = annex.store("a.rpm", b"same").unwrap();
        let manifest = annex.backup(&BackupSelector::all()).unwrap();
        annex.store("b.rpm", b"same").unwrap();
        assert_eq!(annex.purge(&manifest).unwrap(), 1);
        assert_eq!(annex.get(&a.digest).unwrap(), b"same");
    }
}
