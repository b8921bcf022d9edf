//! The single writer of one (repository, architecture) pair.
//!
//! On-disk layout under the repository root:
//!
//! ```text
//! current -> generations/00000003      consumers read through this link
//! generations/<gen>/Packages/*.rpm
//! generations/<gen>/repodata/
//! generations/<gen>/manifest.json
//! staging/                            writer-private staged copies
//! history.jsonl
//! ```
//!
//! A commit builds the next generation beside the current one, regenerates
//! metadata there and only then swaps `current`. A failed regeneration
//! deletes the half-built directory, so the published state never changes.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rpmgate_core::obs::emit_commit;
use rpmgate_core::{Arch, PackageKey};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::error::{RepoError, RepoResult};
use super::generator::{write_atomic, MetadataGenerator, PACKAGES_DIR, REPODATA_DIR};
use super::history::HistoryLog;
use super::model::{
    ChangeOp, ChangeRecord, CommitResult, LivePackage, Manifest, RepoSnapshot, RetentionPolicy,
    StagedChange, Transaction, TransactionOutcome,
};

pub(crate) const CURRENT: &str = "current";
pub(crate) const GENERATIONS: &str = "generations";
pub(crate) const STAGING: &str = "staging";
pub(crate) const HISTORY: &str = "history.jsonl";
const MANIFEST: &str = "manifest.json";

/// Generations kept on disk besides the current one, for readers that
/// resolved the previous link just before a swap.
const KEEP_OLD_GENERATIONS: usize = 1;

pub(crate) enum Command {
    Commit {
        changes: Vec<StagedChange>,
        retention: RetentionPolicy,
        reply: oneshot::Sender<RepoResult<CommitResult>>,
    },
    Verify {
        reply: oneshot::Sender<RepoResult<()>>,
    },
}

pub(crate) struct RepositoryActor {
    name: String,
    arch: Arch,
    root: PathBuf,
    generator: Arc<dyn MetadataGenerator>,
    generation: u64,
    packages: BTreeMap<PackageKey, LivePackage>,
    history: HistoryLog,
    snapshot: watch::Sender<Arc<RepoSnapshot>>,
}

pub(crate) fn generation_dir(root: &Path, generation: u64) -> PathBuf {
    root.join(GENERATIONS).join(format!("{generation:08}"))
}

impl RepositoryActor {
    /// Load the repository at `root`, creating an empty generation 0 when
    /// there is none yet.
    pub(crate) async fn load(
        root: PathBuf,
        name: String,
        arch: Arch,
        generator: Arc<dyn MetadataGenerator>,
    ) -> RepoResult<(Self, watch::Receiver<Arc<RepoSnapshot>>)> {
        tokio::fs::create_dir_all(root.join(GENERATIONS)).await?;
        tokio::fs::create_dir_all(root.join(STAGING)).await?;

        let current = root.join(CURRENT);
        let (generation, packages) = if tokio::fs::symlink_metadata(&current).await.is_ok() {
            let target = tokio::fs::read_link(&current).await?;
            let generation = target
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.parse::<u64>().ok())
                .ok_or_else(|| RepoError::Corrupt(format!("bad current link {}", target.display())))?;
            let raw = tokio::fs::read(generation_dir(&root, generation).join(MANIFEST)).await?;
            let manifest: Manifest = serde_json::from_slice(&raw)?;
            if manifest.generation != generation || manifest.arch != arch {
                return Err(RepoError::Corrupt(format!(
                    "manifest of {} describes {} generation {}",
                    root.display(),
                    manifest.arch,
                    manifest.generation
                )));
            }
            let packages = manifest
                .packages
                .into_iter()
                .map(|p| (p.artifact.key.clone(), p))
                .collect();
            (generation, packages)
        } else {
            (0, BTreeMap::new())
        };

        let history = HistoryLog::open(root.join(HISTORY))?;
        let snapshot = RepoSnapshot {
            name: name.clone(),
            arch: arch.clone(),
            generation,
            path: generation_dir(&root, generation),
            packages: packages.clone(),
            history_len: history.len(),
        };
        let (tx, rx) = watch::channel(Arc::new(snapshot));

        let mut actor = Self {
            name,
            arch,
            root,
            generator,
            generation,
            packages,
            history,
            snapshot: tx,
        };
        if tokio::fs::symlink_metadata(&current).await.is_err() {
            let dir = actor.build_generation(0, &actor.packages.clone(), &[]).await?;
            actor.publish(0, dir).await?;
        }
        actor.clear_staging().await;
        Ok((actor, rx))
    }

    pub(crate) async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        while let Some(cmd) = rx.recv().await {
            match cmd {
                Command::Commit {
                    changes,
                    retention,
                    reply,
                } => {
                    let result = self.commit(changes, retention).await;
                    let _ = reply.send(result);
                }
                Command::Verify { reply } => {
                    let _ = reply.send(self.verify().await);
                }
            }
        }
        debug!(repo = %self.name, arch = %self.arch, "repository actor stopped");
    }

    async fn commit(
        &mut self,
        changes: Vec<StagedChange>,
        retention: RetentionPolicy,
    ) -> RepoResult<CommitResult> {
        let transaction_id = self.history.next_id();
        let records: Vec<_> = changes.iter().map(StagedChange::record).collect();

        let mut working = self.packages.clone();
        let mut rejected = Vec::new();
        let mut added = Vec::new();
        let mut removed = Vec::new();
        if changes.is_empty() {
            rejected.push("transaction has no changes".to_string());
        }
        for change in &changes {
            match &change.op {
                ChangeOp::Add {
                    artifact,
                    sha256,
                    size,
                } => {
                    let key = &artifact.key;
                    if let Some(reason) = self.refuse_add(&working, key) {
                        rejected.push(reason);
                        continue;
                    }
                    if !artifact.path.exists() {
                        self.discard_staged(&changes).await;
                        return Err(RepoError::StagedFileMissing(artifact.path.display().to_string()));
                    }
                    let mut live = artifact.clone();
                    live.path = Path::new(PACKAGES_DIR).join(key.file_name());
                    working.insert(
                        key.clone(),
                        LivePackage {
                            artifact: live,
                            sha256: sha256.clone(),
                            size: *size,
                        },
                    );
                    added.push(key.clone());
                }
                ChangeOp::Remove { key } => {
                    if working.remove(key).is_none() {
                        rejected.push(format!("{key} is not live"));
                    } else {
                        removed.push(key.clone());
                    }
                }
            }
        }

        if !rejected.is_empty() {
            self.discard_staged(&changes).await;
            let tx = Transaction {
                id: transaction_id,
                timestamp: chrono::Utc::now().timestamp(),
                outcome: TransactionOutcome::Rejected,
                generation: self.generation,
                changes: records,
                pruned: Vec::new(),
                detail: Some(rejected.join("; ")),
            };
            self.record(tx)?;
            warn!(repo = %self.name, arch = %self.arch, transaction_id, reasons = ?rejected, "transaction rejected");
            return Ok(CommitResult {
                transaction_id,
                generation: self.generation,
                outcome: TransactionOutcome::Rejected,
                added: Vec::new(),
                removed: Vec::new(),
                pruned: Vec::new(),
                rejected,
            });
        }

        let pruned = retention.apply(&mut working);
        let next = self.generation + 1;
        let built = self.build_generation(next, &working, &changes).await;
        self.discard_staged(&changes).await;

        let dir = match built {
            Ok(dir) => dir,
            Err(e) => {
                self.roll_back(transaction_id, records, &e)?;
                return Err(match e {
                    RepoError::Generator(detail) => RepoError::MetadataConflict {
                        transaction_id,
                        detail,
                    },
                    other => other,
                });
            }
        };

        // Live state moves only once `current` points at the new generation.
        if let Err(e) = self.publish(next, dir).await {
            self.roll_back(transaction_id, records, &e)?;
            return Err(e);
        }
        self.packages = working;
        let tx = Transaction {
            id: transaction_id,
            timestamp: chrono::Utc::now().timestamp(),
            outcome: TransactionOutcome::Committed,
            generation: next,
            changes: records,
            pruned: pruned.clone(),
            detail: None,
        };
        self.record(tx)?;
        self.prune_generations().await;

        info!(
            repo = %self.name,
            arch = %self.arch,
            transaction_id,
            generation = next,
            added = added.len(),
            removed = removed.len(),
            pruned = pruned.len(),
            "transaction committed"
        );
        Ok(CommitResult {
            transaction_id,
            generation: next,
            outcome: TransactionOutcome::Committed,
            added,
            removed,
            pruned,
            rejected: Vec::new(),
        })
    }

    fn refuse_add(&self, working: &BTreeMap<PackageKey, LivePackage>, key: &PackageKey) -> Option<String> {
        if key.arch.is_source() || !key.arch.installs_on(&self.arch) {
            return Some(format!("{key} does not belong in the {} repository", self.arch));
        }
        if working.contains_key(key) {
            return Some(format!("{key} is already live"));
        }
        let siblings = working.keys().filter(|k| k.name == key.name && k.arch == key.arch);
        if let Some(same) = siblings.clone().find(|k| k.evr.rpm_cmp(&key.evr) == Ordering::Equal) {
            return Some(format!("{key} has the same version as live {same}"));
        }
        siblings
            .filter(|k| k.evr.rpm_cmp(&key.evr) == Ordering::Greater)
            .max_by(|a, b| a.evr.cmp(&b.evr))
            .map(|newer| format!("{key} is older than live {newer}"))
    }

    /// Assemble generation `generation` in a scratch directory and regenerate
    /// its metadata. Returns the scratch directory; nothing is published.
    async fn build_generation(
        &self,
        generation: u64,
        packages: &BTreeMap<PackageKey, LivePackage>,
        staged: &[StagedChange],
    ) -> RepoResult<PathBuf> {
        let scratch = self
            .root
            .join(GENERATIONS)
            .join(format!(".{generation:08}-{}", Uuid::new_v4().simple()));
        let result = async {
            let pkg_dir = scratch.join(PACKAGES_DIR);
            tokio::fs::create_dir_all(&pkg_dir).await?;
            let current = generation_dir(&self.root, self.generation);
            for (key, live) in packages {
                let src = staged
                    .iter()
                    .find_map(|c| match &c.op {
                        ChangeOp::Add { artifact, .. } if &artifact.key == key => Some(artifact.path.clone()),
                        _ => None,
                    })
                    .unwrap_or_else(|| current.join(&live.artifact.path));
                link_or_copy(&src, &scratch.join(&live.artifact.path)).await?;
            }
            self.generator.generate(&scratch, generation).await?;
            let manifest = Manifest {
                repo: self.name.clone(),
                arch: self.arch.clone(),
                generation,
                packages: packages.values().cloned().collect(),
            };
            write_atomic(&scratch.join(MANIFEST), &serde_json::to_vec_pretty(&manifest)?)?;
            Ok(())
        }
        .await;

        match result {
            Ok(()) => Ok(scratch),
            Err(e) => {
                remove_dir(&scratch).await;
                Err(e)
            }
        }
    }

    /// Move a built generation into place and repoint `current` at it.
    ///
    /// On failure `current` and the in-memory generation are unchanged and
    /// neither the new generation directory nor the temporary link is left
    /// behind.
    async fn publish(&mut self, generation: u64, scratch: PathBuf) -> RepoResult<()> {
        let dir = generation_dir(&self.root, generation);
        remove_dir(&dir).await;
        if let Err(e) = tokio::fs::rename(&scratch, &dir).await {
            remove_dir(&scratch).await;
            return Err(e.into());
        }

        let link_tmp = self.root.join(format!(".{CURRENT}-{}", Uuid::new_v4().simple()));
        let target = Path::new(GENERATIONS).join(format!("{generation:08}"));
        let swapped = async {
            tokio::fs::symlink(&target, &link_tmp).await?;
            tokio::fs::rename(&link_tmp, self.root.join(CURRENT)).await
        }
        .await;
        if let Err(e) = swapped {
            if let Err(rm) = tokio::fs::remove_file(&link_tmp).await {
                if rm.kind() != std::io::ErrorKind::NotFound {
                    warn!(link = %link_tmp.display(), error = %rm, "failed to remove temporary link");
                }
            }
            if generation != self.generation {
                remove_dir(&dir).await;
            }
            return Err(e.into());
        }

        self.generation = generation;
        Ok(())
    }

    /// Record a transaction that changed nothing on disk.
    fn roll_back(
        &mut self,
        transaction_id: u64,
        records: Vec<ChangeRecord>,
        error: &RepoError,
    ) -> RepoResult<()> {
        let detail = error.to_string();
        let tx = Transaction {
            id: transaction_id,
            timestamp: chrono::Utc::now().timestamp(),
            outcome: TransactionOutcome::RolledBack,
            generation: self.generation,
            changes: records,
            pruned: Vec::new(),
            detail: Some(detail.clone()),
        };
        self.record(tx)?;
        warn!(repo = %self.name, arch = %self.arch, transaction_id, error = %detail, "commit rolled back");
        Ok(())
    }

    /// Append to history, then expose the new state to readers.
    fn record(&mut self, tx: Transaction) -> RepoResult<()> {
        self.history.append(&tx)?;
        emit_commit(&self.name, self.arch.as_str(), tx.id, tx.generation, tx.outcome.as_str());
        self.snapshot.send_replace(Arc::new(RepoSnapshot {
            name: self.name.clone(),
            arch: self.arch.clone(),
            generation: self.generation,
            path: generation_dir(&self.root, self.generation),
            packages: self.packages.clone(),
            history_len: self.history.len(),
        }));
        Ok(())
    }

    /// Regenerate metadata for the live set in a scratch directory and
    /// compare it byte for byte with the published metadata.
    async fn verify(&self) -> RepoResult<()> {
        let scratch = self.build_generation(self.generation, &self.packages, &[]).await?;
        let published = generation_dir(&self.root, self.generation).join(REPODATA_DIR);
        let fresh = scratch.join(REPODATA_DIR);
        let same = dirs_equal(&published, &fresh).await;
        remove_dir(&scratch).await;
        if same? {
            Ok(())
        } else {
            Err(RepoError::Inconsistent {
                repo: self.name.clone(),
                generation: self.generation,
            })
        }
    }

    async fn prune_generations(&self) {
        let oldest_kept = self.generation.saturating_sub(KEEP_OLD_GENERATIONS as u64);
        let Ok(mut entries) = tokio::fs::read_dir(self.root.join(GENERATIONS)).await else {
            return;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let stale = entry
                .file_name()
                .to_str()
                .and_then(|n| n.parse::<u64>().ok())
                .is_some_and(|g| g < oldest_kept);
            if stale {
                remove_dir(&entry.path()).await;
            }
        }
    }

    async fn discard_staged(&self, changes: &[StagedChange]) {
        for change in changes {
            if let ChangeOp::Add { artifact, .. } = &change.op {
                if artifact.path.starts_with(self.root.join(STAGING)) {
                    let _ = tokio::fs::remove_file(&artifact.path).await;
                }
            }
        }
    }

    async fn clear_staging(&self) {
        let staging = self.root.join(STAGING);
        remove_dir(&staging).await;
        if let Err(e) = tokio::fs::create_dir_all(&staging).await {
            warn!(dir = %staging.display(), error = %e, "failed to recreate staging area");
        }
    }
}

async fn link_or_copy(src: &Path, dest: &Path) -> RepoResult<()> {
    if tokio::fs::hard_link(src, dest).await.is_ok() {
        return Ok(());
    }
    tokio::fs::copy(src, dest).await?;
    Ok(())
}

async fn remove_dir(dir: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(dir).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(dir = %dir.display(), error = %e, "failed to remove directory");
        }
    }
}

/// Compares the regular files of two flat directories.
async fn dirs_equal(a: &Path, b: &Path) -> RepoResult<bool> {
    let list = |dir: PathBuf| async move {
        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            names.push(entry.file_name());
        }
        names.sort();
        Ok::<_, RepoError>(names)
    };
    let names = list(a.to_path_buf()).await?;
    if names != list(b.to_path_buf()).await? {
        return Ok(false);
    }
    for name in names {
        let (left, right) = (a.join(&name), b.join(&name));
        if tokio::fs::metadata(&left).await?.is_dir() {
            continue;
        }
        if tokio::fs::read(&left).await? != tokio::fs::read(&right).await? {
            return Ok(false);
        }
    }
    Ok(true)
}
