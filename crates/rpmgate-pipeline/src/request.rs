//! Requests going in, progress and outcomes coming out.

use std::time::Duration;

use rpmgate_core::{Arch, ErrorClass, PackageKey, PackageSpec, TestOutcome, TestReport, TestResult, TestSuite};
use rpmgate_state::{CommitResult, RetentionPolicy};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::state::BranchState;

/// Default budget for the install-and-roll-back suite.
pub const BASIC_INSTALL_TIMEOUT: Duration = Duration::from_secs(1800);

/// Build, validate and publish a set of packages for some architectures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRequest {
    pub id: String,
    /// Built in order; later packages may depend on earlier ones.
    pub packages: Vec<PackageSpec>,
    /// Empty means every architecture in the project config.
    pub arches: Vec<Arch>,
    /// Suites run after the basic install check, in order.
    pub suites: Vec<TestSuite>,
    /// Overrides the repository's own policy for this request's commit.
    pub retention: Option<RetentionPolicy>,
    pub install_timeout: Duration,
}

impl BuildRequest {
    pub fn new(packages: Vec<PackageSpec>) -> Self {
        let id = Uuid::new_v4().simple().to_string();
        Self {
            id: id[..12].to_string(),
            packages,
            arches: Vec::new(),
            suites: Vec::new(),
            retention: None,
            install_timeout: BASIC_INSTALL_TIMEOUT,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn for_arches(mut self, arches: impl IntoIterator<Item = Arch>) -> Self {
        self.arches = arches.into_iter().collect();
        self
    }

    pub fn with_suite(mut self, suite: TestSuite) -> Self {
        self.suites.push(suite);
        self
    }

    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = Some(retention);
        self
    }

    pub fn with_install_timeout(mut self, timeout: Duration) -> Self {
        self.install_timeout = timeout;
        self
    }
}

/// Incremental progress of a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProgressEvent {
    Transition {
        arch: Arch,
        from: BranchState,
        to: BranchState,
    },
    Retry {
        arch: Arch,
        attempt: u32,
        reason: String,
    },
    Finished(BranchOutcome),
}

impl ProgressEvent {
    pub fn arch(&self) -> &Arch {
        match self {
            ProgressEvent::Transition { arch, .. } | ProgressEvent::Retry { arch, .. } => arch,
            ProgressEvent::Finished(outcome) => &outcome.arch,
        }
    }
}

/// Final word on one architecture.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchOutcome {
    pub arch: Arch,
    pub state: BranchState,
    /// Validation attempts made, retries included.
    pub attempts: u32,
    pub built: Vec<PackageKey>,
    /// Results of the last validation attempt.
    pub results: Vec<TestResult>,
    pub commit: Option<CommitResult>,
    /// Annex digests of every archived artifact.
    pub archived: Vec<String>,
    pub error: Option<String>,
    pub error_class: Option<ErrorClass>,
}

impl BranchOutcome {
    pub(crate) fn new(arch: Arch) -> Self {
        Self {
            arch,
            state: BranchState::Queued,
            attempts: 0,
            built: Vec::new(),
            results: Vec::new(),
            commit: None,
            archived: Vec::new(),
            error: None,
            error_class: None,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.state == BranchState::Archived
    }

    pub fn failed_suites(&self) -> Vec<&str> {
        self.results
            .iter()
            .filter(|r| r.classification != TestOutcome::Passed)
            .map(|r| r.suite_id.as_str())
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Succeeded,
    /// Some architectures archived, others did not.
    Partial,
    Failed,
}

/// Outcome of a whole request, one entry per architecture in fan-out order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestOutcome {
    pub request_id: String,
    pub branches: Vec<BranchOutcome>,
    pub duration_ms: u64,
}

impl RequestOutcome {
    pub fn status(&self) -> RequestStatus {
        let ok = self.succeeded_count();
        if ok == self.branches.len() && ok > 0 {
            RequestStatus::Succeeded
        } else if ok > 0 {
            RequestStatus::Partial
        } else {
            RequestStatus::Failed
        }
    }

    pub fn succeeded_count(&self) -> usize {
        self.branches.iter().filter(|b| b.succeeded()).count()
    }

    pub fn branch(&self, arch: &Arch) -> Option<&BranchOutcome> {
        self.branches.iter().find(|b| &b.arch == arch)
    }

    /// Test results of every branch, for text or JUnit output.
    pub fn report(&self) -> TestReport {
        let mut report = TestReport::new(format!("rpmgate-{}", self.request_id));
        for branch in &self.branches {
            report.extend(&branch.arch, branch.results.iter().cloned());
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn branch(arch: &str, state: BranchState) -> BranchOutcome {
        let mut b = BranchOutcome::new(arch.parse().unwrap());
        b.state = state;
        b
    }

    #[test]
    fn status_reflects_branches() {
        let mut outcome = RequestOutcome {
            request_id: "r".into(),
            branches: vec![
                branch("x86_64", BranchState::Archived),
                branch("aarch64", BranchState::Aborted),
            ],
            duration_ms: 0,
        };
        assert_eq!(outcome.status(), RequestStatus::Partial);
        outcome.branches[1].state = BranchState::Archived;
        assert_eq!(outcome.status(), RequestStatus::Succeeded);
        outcome.branches.iter_mut().for_each(|b| b.state = BranchState::RolledBack);
        assert_eq!(outcome.status(), RequestStatus::Failed);
    }

    #[test]
    fn request_ids_are_short_and_unique() {
        let a = BuildRequest::new(Vec::new());
        let b = BuildRequest::new(Vec::new());
        assert_eq!(a.id.len(), 12);
        assert_ne!(a.id, b.id);
    }
}
