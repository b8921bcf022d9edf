//! Value types exchanged with the repository store.

use std::collections::BTreeMap;
use std::path::PathBuf;

use rpmgate_core::{Arch, BuildArtifact, PackageKey};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A proposed mutation. Invisible to readers until committed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedChange {
    pub id: Uuid,
    pub op: ChangeOp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ChangeOp {
    /// `artifact.path` points at the writer-private staged copy.
    Add {
        artifact: BuildArtifact,
        sha256: String,
        size: u64,
    },
    Remove { key: PackageKey },
}

impl StagedChange {
    pub fn key(&self) -> &PackageKey {
        match &self.op {
            ChangeOp::Add { artifact, .. } => &artifact.key,
            ChangeOp::Remove { key } => key,
        }
    }

    pub(crate) fn record(&self) -> ChangeRecord {
        let action = match self.op {
            ChangeOp::Add { .. } => ChangeAction::Add,
            ChangeOp::Remove { .. } => ChangeAction::Remove,
        };
        ChangeRecord {
            action,
            key: self.key().clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeAction {
    Add,
    Remove,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub action: ChangeAction,
    pub key: PackageKey,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionOutcome {
    /// Published as a new generation.
    Committed,
    /// Refused before touching disk; live set unchanged.
    Rejected,
    /// Metadata regeneration failed; previous generation kept.
    RolledBack,
}

impl TransactionOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            TransactionOutcome::Committed => "committed",
            TransactionOutcome::Rejected => "rejected",
            TransactionOutcome::RolledBack => "rolled_back",
        }
    }
}

/// One entry of a repository's append-only history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: u64,
    /// UTC seconds since the epoch.
    pub timestamp: i64,
    pub outcome: TransactionOutcome,
    /// Generation in effect once the transaction was recorded.
    pub generation: u64,
    pub changes: Vec<ChangeRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pruned: Vec<PackageKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// What a successful commit call did. Rejections are results, not errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitResult {
    pub transaction_id: u64,
    pub generation: u64,
    pub outcome: TransactionOutcome,
    pub added: Vec<PackageKey>,
    pub removed: Vec<PackageKey>,
    /// Older versions that fell out of the live set under retention.
    pub pruned: Vec<PackageKey>,
    pub rejected: Vec<String>,
}

impl CommitResult {
    pub fn is_committed(&self) -> bool {
        self.outcome == TransactionOutcome::Committed
    }
}

/// A package in the live set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LivePackage {
    /// `path` is relative to the generation directory.
    pub artifact: BuildArtifact,
    pub sha256: String,
    pub size: u64,
}

/// Written next to the metadata of every generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Manifest {
    pub repo: String,
    pub arch: Arch,
    pub generation: u64,
    pub packages: Vec<LivePackage>,
}

/// Last fully committed state of one repository.
#[derive(Debug, Clone)]
pub struct RepoSnapshot {
    pub name: String,
    pub arch: Arch,
    pub generation: u64,
    /// Directory holding `Packages/` and `repodata/` of this generation.
    pub path: PathBuf,
    pub packages: BTreeMap<PackageKey, LivePackage>,
    pub(crate) history_len: usize,
}

impl RepoSnapshot {
    pub fn contains(&self, key: &PackageKey) -> bool {
        self.packages.contains_key(key)
    }

    /// Live versions of `name`, lowest first.
    pub fn versions(&self, name: &str) -> Vec<&PackageKey> {
        self.packages.keys().filter(|k| k.name == name).collect()
    }

    /// Highest live version of `name`.
    pub fn latest(&self, name: &str) -> Option<&PackageKey> {
        self.packages
            .keys()
            .filter(|k| k.name == name)
            .max_by(|a, b| a.evr.cmp(&b.evr))
    }
}

/// How many versions of each (name, arch) stay live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub keep_versions: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self { keep_versions: 2 }
    }
}

impl RetentionPolicy {
    pub fn keep(keep_versions: usize) -> Self {
        Self {
            keep_versions: keep_versions.max(1),
        }
    }

    /// Drop all but the highest `keep_versions` of every (name, arch) group.
    /// Returns the dropped keys.
    pub fn apply(&self, packages: &mut BTreeMap<PackageKey, LivePackage>) -> Vec<PackageKey> {
        let mut groups: BTreeMap<(&str, &Arch), Vec<&PackageKey>> = BTreeMap::new();
        for key in packages.keys() {
            groups.entry((&key.name, &key.arch)).or_default().push(key);
        }
        let mut pruned = Vec::new();
        for mut keys in groups.into_values() {
            keys.sort_by(|a, b| a.evr.cmp(&b.evr));
            let excess = keys.len().saturating_sub(self.keep_versions);
            pruned.extend(keys.into_iter().take(excess).cloned());
        }
        for key in &pruned {
            packages.remove(key);
        }
        pruned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rpmgate_core::Evr;

    fn live(name: &str, version: &str, release: &str) -> (PackageKey, LivePackage) {
        let key = PackageKey::new(name, Evr::new(0, version, release), "x86_64".parse().unwrap());
        let artifact = BuildArtifact::from_path(format!("Packages/{}", key.file_name()), "b").unwrap();
        (
            key,
            LivePackage {
                artifact,
                sha256: String::new(),
                size: 0,
            },
        )
    }

    #[test]
    fn retention_keeps_highest_versions() {
        let mut set: BTreeMap<_, _> = [
            live("foo", "1.2", "3"),
            live("foo", "1.10", "1"),
            live("foo", "1.9", "1"),
            live("bar", "0.1", "1"),
        ]
        .into_iter()
        .collect();

        let pruned = RetentionPolicy::keep(2).apply(&mut set);
        assert_eq!(pruned.len(), 1);
        assert_eq!(pruned[0].evr, Evr::new(0, "1.2", "3"));
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn latest_uses_rpm_ordering() {
        let snapshot = RepoSnapshot {
            name: "r".into(),
            arch: "x86_64".parse().unwrap(),
            generation: 1,
            path: PathBuf::new(),
            packages: [live("foo", "1.2", "3"), live("foo", "1.10", "1")]
                .into_iter()
                .collect(),
            history_len: 0,
        };
        assert_eq!(snapshot.latest("foo").unwrap().evr.version, "1.10");
        assert_eq!(snapshot.versions("foo").len(), 2);
        assert!(snapshot.latest("bar").is_none());
    }
}
