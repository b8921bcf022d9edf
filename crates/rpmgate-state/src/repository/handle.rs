//! Client side of a repository actor.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rpmgate_core::{Arch, BuildArtifact, PackageKey};
use tokio::sync::{mpsc, oneshot, watch, Mutex, OwnedMutexGuard};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use super::actor::{Command, RepositoryActor, HISTORY, STAGING};
use super::error::{RepoError, RepoResult};
use super::generator::{sha256_file, MetadataGenerator};
use super::history::{History, HistoryLog};
use super::model::{ChangeOp, CommitResult, RepoSnapshot, RetentionPolicy, StagedChange};

const MAILBOX: usize = 16;

/// Cloneable handle to one (repository, architecture) pair.
///
/// All mutation goes through the actor behind this handle, one message at a
/// time. Reads (`snapshot`, `history`) never wait for a pending commit and
/// only ever see fully committed state.
#[derive(Clone)]
pub struct RepositoryHandle {
    name: String,
    arch: Arch,
    root: PathBuf,
    tx: mpsc::Sender<Command>,
    snapshot: watch::Receiver<Arc<RepoSnapshot>>,
    publish_lock: Arc<Mutex<()>>,
    retention: RetentionPolicy,
}

/// Exclusive right to stage and commit into one repository.
pub struct PublishGuard {
    _guard: OwnedMutexGuard<()>,
}

impl RepositoryHandle {
    /// Open (or create) the repository stored at `root` and start its actor.
    #[instrument(skip(root, generator), fields(root = %root.as_ref().display()))]
    pub async fn open(
        root: impl AsRef<Path>,
        name: &str,
        arch: Arch,
        generator: Arc<dyn MetadataGenerator>,
        retention: RetentionPolicy,
    ) -> RepoResult<Self> {
        let root = root.as_ref().to_path_buf();
        let (actor, snapshot) =
            RepositoryActor::load(root.clone(), name.to_string(), arch.clone(), generator).await?;
        let (tx, rx) = mpsc::channel(MAILBOX);
        tokio::spawn(actor.run(rx));
        debug!(generation = snapshot.borrow().generation, "repository opened");
        Ok(Self {
            name: name.to_string(),
            arch,
            root,
            tx,
            snapshot,
            publish_lock: Arc::new(Mutex::new(())),
            retention,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arch(&self) -> &Arch {
        &self.arch
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn retention(&self) -> RetentionPolicy {
        self.retention
    }

    /// Last fully committed state.
    pub fn snapshot(&self) -> Arc<RepoSnapshot> {
        Arc::clone(&*self.snapshot.borrow())
    }

    /// Directory of the current generation, for sharing into a guest.
    pub fn published_path(&self) -> PathBuf {
        self.snapshot().path.clone()
    }

    /// Copy `artifact` into the writer-private staging area.
    pub async fn stage(&self, artifact: &BuildArtifact) -> RepoResult<StagedChange> {
        let id = Uuid::new_v4();
        let staged_path = self
            .root
            .join(STAGING)
            .join(format!("{}-{}", id.simple(), artifact.file_name()));
        tokio::fs::copy(&artifact.path, &staged_path)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => {
                    RepoError::StagedFileMissing(artifact.path.display().to_string())
                }
                _ => RepoError::Io(e),
            })?;
        let hash_path = staged_path.clone();
        let hashed = tokio::task::spawn_blocking(move || sha256_file(&hash_path))
            .await
            .map_err(|e| RepoError::Corrupt(format!("hash task failed: {e}")))
            .and_then(|r| r);
        let (sha256, size) = match hashed {
            Ok(digest) => digest,
            Err(e) => {
                remove_staged(&staged_path).await;
                return Err(e);
            }
        };

        let mut staged = artifact.clone();
        staged.path = staged_path;
        Ok(StagedChange {
            id,
            op: ChangeOp::Add {
                artifact: staged,
                sha256,
                size,
            },
        })
    }

    /// Drop staged copies that will not be committed.
    pub async fn discard(&self, changes: &[StagedChange]) {
        let staging = self.root.join(STAGING);
        for change in changes {
            if let ChangeOp::Add { artifact, .. } = &change.op {
                if artifact.path.starts_with(&staging) {
                    remove_staged(&artifact.path).await;
                }
            }
        }
    }

    pub fn stage_removal(&self, key: PackageKey) -> StagedChange {
        StagedChange {
            id: Uuid::new_v4(),
            op: ChangeOp::Remove { key },
        }
    }

    /// Apply `changes` as one all-or-nothing transaction under the
    /// repository's default retention.
    pub async fn commit(&self, changes: Vec<StagedChange>) -> RepoResult<CommitResult> {
        self.commit_with(changes, self.retention).await
    }

    pub async fn commit_with(
        &self,
        changes: Vec<StagedChange>,
        retention: RetentionPolicy,
    ) -> RepoResult<CommitResult> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Commit {
            changes,
            retention,
            reply,
        })
        .await?;
        rx.await.map_err(|_| self.closed())?
    }

    pub async fn remove(&self, key: &PackageKey) -> RepoResult<CommitResult> {
        self.commit(vec![self.stage_removal(key.clone())]).await
    }

    /// Committed transactions as of now, oldest first.
    pub fn history(&self) -> History {
        History::new(&self.root.join(HISTORY), self.snapshot.borrow().history_len)
    }

    /// Take the single-writer lock for a stage+commit sequence.
    pub async fn lock_publish(&self) -> PublishGuard {
        PublishGuard {
            _guard: Arc::clone(&self.publish_lock).lock_owned().await,
        }
    }

    /// Check that published metadata matches a fresh regeneration.
    pub async fn verify(&self) -> RepoResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Verify { reply }).await?;
        rx.await.map_err(|_| self.closed())?
    }

    async fn send(&self, cmd: Command) -> RepoResult<()> {
        self.tx.send(cmd).await.map_err(|_| self.closed())
    }

    fn closed(&self) -> RepoError {
        RepoError::Closed(format!("{}/{}", self.name, self.arch))
    }
}

/// All repositories under one root directory, one actor per
/// (name, architecture). Opening the same pair twice yields the same handle.
pub struct RepositoryStore {
    root: PathBuf,
    generator: Arc<dyn MetadataGenerator>,
    retention: RetentionPolicy,
    handles: Mutex<HashMap<(String, Arch), RepositoryHandle>>,
}

impl RepositoryStore {
    pub fn new(
        root: impl Into<PathBuf>,
        generator: Arc<dyn MetadataGenerator>,
        retention: RetentionPolicy,
    ) -> Self {
        Self {
            root: root.into(),
            generator,
            retention,
            handles: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn generator(&self) -> Arc<dyn MetadataGenerator> {
        Arc::clone(&self.generator)
    }

    pub fn path_for(&self, name: &str, arch: &Arch) -> PathBuf {
        self.root.join(name).join(arch.as_str())
    }

    /// History of a repository without opening it. A repository that was
    /// never created has an empty history.
    pub fn history(&self, name: &str, arch: &Arch) -> RepoResult<History> {
        let path = self.path_for(name, arch).join(HISTORY);
        let log = HistoryLog::open(&path)?;
        Ok(History::new(&path, log.len()))
    }

    pub async fn open(&self, name: &str, arch: &Arch) -> RepoResult<RepositoryHandle> {
        let mut handles = self.handles.lock().await;
        if let Some(handle) = handles.get(&(name.to_string(), arch.clone())) {
            return Ok(handle.clone());
        }
        let handle = RepositoryHandle::open(
            self.path_for(name, arch),
            name,
            arch.clone(),
            Arc::clone(&self.generator),
            self.retention,
        )
        .await?;
        handles.insert((name.to_string(), arch.clone()), handle.clone());
        Ok(handle)
    }
}

async fn remove_staged(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "failed to remove staged copy");
        }
    }
}
