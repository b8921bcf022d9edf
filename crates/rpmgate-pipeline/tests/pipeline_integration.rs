//! End-to-end coordinator tests against the fake hypervisor and build root.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use rpmgate_core::fakes::{BootBehavior, FakeBuildRoot, FakeHypervisor, FakeSigner};
use rpmgate_core::{
    Arch, BuildExecutor, ErrorClass, PackageSpec, ProjectConfig, TestOutcome, TestSuite,
};
use rpmgate_pipeline::{
    BranchState, BuildRequest, Coordinator, PipelineError, ProgressEvent, RequestStatus,
};
use rpmgate_state::fakes::FailingGenerator;
use rpmgate_state::{
    Annex, IndexGenerator, MetadataGenerator, RepositoryStore, RetentionPolicy, TransactionOutcome,
};
use tempfile::TempDir;

fn x86() -> Arch {
    "x86_64".parse().unwrap()
}

fn arm() -> Arch {
    "aarch64".parse().unwrap()
}

struct Harness {
    dir: TempDir,
    hv: FakeHypervisor,
    repos: Arc<RepositoryStore>,
    annex: Arc<Annex>,
}

impl Harness {
    fn new() -> Self {
        Self::with_generator(Arc::new(IndexGenerator))
    }

    fn with_generator(generator: Arc<dyn MetadataGenerator>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        for sub in ["images", "scratch", "out"] {
            std::fs::create_dir_all(dir.path().join(sub)).unwrap();
        }
        for arch in ["x86_64", "aarch64"] {
            std::fs::write(dir.path().join(format!("images/{arch}.qcow2")), b"qcow").unwrap();
        }
        let repos = Arc::new(RepositoryStore::new(
            dir.path().join("repo"),
            generator,
            RetentionPolicy::keep(2),
        ));
        let annex = Arc::new(Annex::open(dir.path().join("annex"), dir.path().join("backups")).unwrap());
        Self {
            dir,
            hv: FakeHypervisor::new(),
            repos,
            annex,
        }
    }

    fn path(&self, rel: &str) -> PathBuf {
        self.dir.path().join(rel)
    }

    fn config(&self, boot_timeout: u64, workers: usize) -> ProjectConfig {
        let images = self.path("images");
        ProjectConfig::from_toml_str(&format!(
            r#"
name = "acme"
arch = ["x86_64", "aarch64"]

[vm]
boot_timeout = {boot_timeout}
shutdown_timeout = 1

[vm.images]
x86_64 = "{x}"
aarch64 = "{a}"

[pipeline]
workers = {workers}
infra_retries = 1
"#,
            x = images.join("x86_64.qcow2").display(),
            a = images.join("aarch64.qcow2").display(),
        ))
        .unwrap()
    }

    fn coordinator(&self, config: ProjectConfig, builds: FakeBuildRoot, out: &str) -> Coordinator {
        let builder = BuildExecutor::new(Arc::new(builds), self.path(out), 1)
            .with_signer(Arc::new(FakeSigner::new("ACME")));
        Coordinator::new(
            config,
            Arc::new(self.hv.clone()),
            Arc::new(builder),
            Arc::clone(&self.repos),
            Arc::clone(&self.annex),
        )
        .with_scratch_dir(self.path("scratch"))
    }

    fn default_coordinator(&self, builds: FakeBuildRoot) -> Coordinator {
        self.coordinator(self.config(5, 2), builds, "out")
    }

    async fn live_len(&self, arch: &Arch) -> usize {
        self.repos.open("acme", arch).await.unwrap().snapshot().packages.len()
    }
}

fn foo() -> FakeBuildRoot {
    FakeBuildRoot::new().produces("foo", "1.0", "1")
}

fn request() -> BuildRequest {
    BuildRequest::new(vec![PackageSpec::new("foo", "/src/foo.spec", "/src")])
}

fn dir_is_empty(path: &Path) -> bool {
    std::fs::read_dir(path).map(|mut d| d.next().is_none()).unwrap_or(true)
}

#[tokio::test]
async fn both_arches_publish_and_archive() {
    let h = Harness::new();
    let coordinator = h.default_coordinator(foo().produces_noarch("foo-doc", "1.0", "1"));

    let mut handle = coordinator.submit(request()).unwrap();
    let events: Vec<ProgressEvent> = handle.progress().unwrap().collect().await;
    let outcome = handle.wait().await.unwrap();

    assert_eq!(outcome.status(), RequestStatus::Succeeded);
    for arch in [x86(), arm()] {
        let branch = outcome.branch(&arch).unwrap();
        assert_eq!(branch.state, BranchState::Archived);
        assert_eq!(branch.attempts, 1);
        assert!(branch.results.iter().all(|r| r.classification == TestOutcome::Passed));
        assert!(branch.commit.as_ref().unwrap().is_committed());
        // source, arch binary and noarch doc
        assert_eq!(branch.archived.len(), 3);
        assert_eq!(h.live_len(&arch).await, 2);
    }

    let x86_states: Vec<BranchState> = events
        .iter()
        .filter_map(|e| match e {
            ProgressEvent::Transition { arch, to, .. } if *arch == x86() => Some(*to),
            _ => None,
        })
        .collect();
    assert_eq!(
        x86_states,
        vec![
            BranchState::Building,
            BranchState::Validating,
            BranchState::Publishing,
            BranchState::Archived
        ]
    );
    assert!(matches!(events.last(), Some(ProgressEvent::Finished(_))));

    assert_eq!(h.hv.launches(), 2);
    assert_eq!(h.hv.live_guests(), 0);
    assert_eq!(coordinator.registry().live_count(), 0);
    assert!(h.hv.mounted().iter().any(|tag| tag == "rpmgate-staging"));
    assert_eq!(h.hv.exec_count_matching("basic-install"), 2);
    // identical source and noarch rpms are stored once
    assert_eq!(h.annex.list(None).len(), 4);
    assert!(dir_is_empty(&h.path("out")));
    assert!(dir_is_empty(&h.path("scratch")));
}

#[tokio::test]
async fn failed_validation_on_one_arch_is_partial_success() {
    let h = Harness::new();
    h.hv.script_exit_on("x86_64", "basic-install", 1, "Error: conflicting requests");
    let coordinator = h.default_coordinator(foo());

    let outcome = coordinator.run(request()).await.unwrap();
    assert_eq!(outcome.status(), RequestStatus::Partial);

    let failed = outcome.branch(&x86()).unwrap();
    assert_eq!(failed.state, BranchState::Aborted);
    assert_eq!(failed.error_class, Some(ErrorClass::Validation));
    assert_eq!(failed.attempts, 1);
    assert_eq!(failed.failed_suites(), vec!["basic-install"]);
    assert!(failed.results[0].log.contains("conflicting requests"));
    assert!(failed.commit.is_none());
    assert!(failed.archived.is_empty());
    assert_eq!(h.live_len(&x86()).await, 0);

    let passed = outcome.branch(&arm()).unwrap();
    assert_eq!(passed.state, BranchState::Archived);
    assert_eq!(h.live_len(&arm()).await, 1);

    let report = outcome.report();
    assert_eq!(report.count(TestOutcome::Failed), 1);
    assert_eq!(report.count(TestOutcome::Passed), 1);
}

#[tokio::test]
async fn fatal_suite_failure_skips_remaining_suites() {
    let h = Harness::new();
    h.hv.script_exit("smoke-check", 2, "smoke failed");
    let coordinator = h.default_coordinator(foo());

    let req = request()
        .for_arches([x86()])
        .with_suite(TestSuite::new("smoke-check", "foo --version", Duration::from_secs(30)).fatal())
        .with_suite(TestSuite::new("functional", "foo --selftest", Duration::from_secs(30)));
    let outcome = coordinator.run(req).await.unwrap();

    let branch = outcome.branch(&x86()).unwrap();
    assert_eq!(branch.state, BranchState::Aborted);
    let ids: Vec<&str> = branch.results.iter().map(|r| r.suite_id.as_str()).collect();
    assert_eq!(ids, vec!["basic-install", "smoke-check"]);
    assert_eq!(h.hv.exec_count_matching("foo --selftest"), 0);
}

#[tokio::test]
async fn boot_timeout_is_retried_once_then_aborts() {
    let h = Harness::new();
    h.hv.boot_for("aarch64", BootBehavior::Hang);
    let coordinator = h.coordinator(h.config(1, 2), foo(), "out");

    let outcome = coordinator.run(request()).await.unwrap();

    let branch = outcome.branch(&arm()).unwrap();
    assert_eq!(branch.state, BranchState::Aborted);
    assert_eq!(branch.error_class, Some(ErrorClass::Infrastructure));
    assert_eq!(branch.attempts, 2);
    assert!(branch.error.as_deref().unwrap().contains("did not become ready"));

    let arm_launches: Vec<String> = h
        .hv
        .launched_names()
        .into_iter()
        .filter(|n| n.contains("aarch64"))
        .collect();
    assert_eq!(arm_launches.len(), 2);
    assert!(arm_launches[1].ends_with("-retry1"));
    assert!(h.hv.execs().iter().all(|(guest, _)| !guest.contains("aarch64")));
    assert_eq!(h.hv.live_guests(), 0);

    assert_eq!(outcome.branch(&x86()).unwrap().state, BranchState::Archived);
    assert_eq!(h.live_len(&arm()).await, 0);
}

#[tokio::test]
async fn infrastructure_failure_recovers_on_fresh_session() {
    let h = Harness::new();
    h.hv.boot_once_for("x86_64", BootBehavior::Hang);
    let coordinator = h.coordinator(h.config(1, 2), foo(), "out");

    let mut handle = coordinator.submit(request().for_arches([x86()])).unwrap();
    let events: Vec<ProgressEvent> = handle.progress().unwrap().collect().await;
    let outcome = handle.wait().await.unwrap();

    let branch = outcome.branch(&x86()).unwrap();
    assert_eq!(branch.state, BranchState::Archived);
    assert_eq!(branch.attempts, 2);
    assert!(events
        .iter()
        .any(|e| matches!(e, ProgressEvent::Retry { attempt: 1, .. })));
    // built once, validated twice
    assert_eq!(branch.built.len(), 2);
    assert_eq!(h.hv.launches(), 2);
}

#[tokio::test]
async fn unreachable_guest_counts_as_infrastructure() {
    let h = Harness::new();
    h.hv.script_unreachable("basic-install");
    let coordinator = h.default_coordinator(foo());

    let outcome = coordinator.run(request().for_arches([x86()])).await.unwrap();
    let branch = outcome.branch(&x86()).unwrap();
    assert_eq!(branch.state, BranchState::Aborted);
    assert_eq!(branch.error_class, Some(ErrorClass::Infrastructure));
    assert_eq!(branch.attempts, 2);
    assert_eq!(branch.results[0].classification, TestOutcome::Error);
}

#[tokio::test]
async fn failed_share_mount_is_retried_as_infrastructure() {
    let h = Harness::new();
    h.hv.fail_mount("rpmgate-staging");
    let coordinator = h.default_coordinator(foo());

    let outcome = coordinator.run(request().for_arches([x86()])).await.unwrap();
    let branch = outcome.branch(&x86()).unwrap();
    assert_eq!(branch.state, BranchState::Aborted);
    assert_eq!(branch.error_class, Some(ErrorClass::Infrastructure));
    assert_eq!(branch.attempts, 2);
    assert!(branch.error.as_deref().unwrap().contains("mounting share rpmgate-staging failed"));
    assert_eq!(h.hv.launches(), 2);
    assert_eq!(h.hv.live_guests(), 0);
    assert_eq!(h.live_len(&x86()).await, 0);
}

#[tokio::test]
async fn build_failure_aborts_only_that_arch() {
    let h = Harness::new();
    let coordinator = h.default_coordinator(foo().failing_on("aarch64", "error: unknown type name"));

    let outcome = coordinator.run(request()).await.unwrap();

    let branch = outcome.branch(&arm()).unwrap();
    assert_eq!(branch.state, BranchState::Aborted);
    assert_eq!(branch.error_class, Some(ErrorClass::Build));
    assert_eq!(branch.attempts, 0);
    assert!(h.hv.launched_names().iter().all(|n| !n.contains("aarch64")));
    assert_eq!(outcome.branch(&x86()).unwrap().state, BranchState::Archived);
}

#[tokio::test]
async fn cancel_terminates_guests_and_publishes_nothing() {
    let h = Harness::new();
    h.hv.script_hang("basic-install");
    let coordinator = h.default_coordinator(foo());

    let handle = coordinator.submit(request()).unwrap();
    while h.hv.exec_count_matching("basic-install") < 2 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(h.hv.live_guests(), 2);
    handle.cancel();
    let outcome = handle.wait().await.unwrap();

    assert_eq!(outcome.status(), RequestStatus::Failed);
    for branch in &outcome.branches {
        assert_eq!(branch.state, BranchState::Aborted);
        assert_eq!(branch.error.as_deref(), Some("cancelled"));
    }
    assert_eq!(h.hv.live_guests(), 0);
    assert_eq!(coordinator.registry().live_count(), 0);
    assert_eq!(h.live_len(&x86()).await, 0);
    assert!(h.annex.list(None).is_empty());
    assert!(dir_is_empty(&h.path("out")));
}

#[tokio::test]
async fn cancelling_one_arch_leaves_the_other_running() {
    let h = Harness::new();
    h.hv.boot_for("aarch64", BootBehavior::Hang);
    let coordinator = h.coordinator(h.config(60, 2), foo(), "out");

    let mut handle = coordinator.submit(request()).unwrap();
    let mut progress = handle.progress().unwrap();
    while let Some(event) = progress.next().await {
        if let ProgressEvent::Finished(outcome) = &event {
            assert_eq!(outcome.arch, x86());
            break;
        }
    }
    assert!(handle.cancel_arch(&arm()));
    assert!(!handle.cancel_arch(&"ppc64le".parse().unwrap()));
    let outcome = handle.wait().await.unwrap();

    assert_eq!(outcome.status(), RequestStatus::Partial);
    assert_eq!(outcome.branch(&x86()).unwrap().state, BranchState::Archived);
    assert_eq!(outcome.branch(&arm()).unwrap().state, BranchState::Aborted);
    assert_eq!(h.hv.live_guests(), 0);
}

#[tokio::test]
async fn single_worker_runs_branches_one_at_a_time() {
    let h = Harness::new();
    let coordinator = h.coordinator(
        h.config(5, 1),
        foo().with_delay(Duration::from_millis(20)),
        "out",
    );

    let mut handle = coordinator.submit(request()).unwrap();
    let events: Vec<ProgressEvent> = handle.progress().unwrap().collect().await;
    handle.wait().await.unwrap();

    let first_finished = events
        .iter()
        .position(|e| matches!(e, ProgressEvent::Finished(_)))
        .unwrap();
    let building: Vec<usize> = events
        .iter()
        .enumerate()
        .filter(|(_, e)| matches!(e, ProgressEvent::Transition { to: BranchState::Building, .. }))
        .map(|(i, _)| i)
        .collect();
    assert_eq!(building.len(), 2);
    assert!(building[0] < first_finished);
    assert!(building[1] > first_finished);
}

#[tokio::test]
async fn epoch_bump_publishes_over_higher_version() {
    let h = Harness::new();
    let first = h.default_coordinator(FakeBuildRoot::new().produces("foo", "2.0", "1"));
    let outcome = first.run(request().for_arches([x86()])).await.unwrap();
    assert_eq!(outcome.status(), RequestStatus::Succeeded);

    let second = h.coordinator(
        h.config(5, 2),
        FakeBuildRoot::new().produces_with_epoch("foo", 1, "1.0", "1"),
        "out2",
    );
    let outcome = second.run(request().for_arches([x86()])).await.unwrap();
    assert_eq!(outcome.status(), RequestStatus::Succeeded);

    let branch = outcome.branch(&x86()).unwrap();
    assert_eq!(branch.commit.as_ref().unwrap().outcome, TransactionOutcome::Committed);
    let live = h.repos.open("acme", &x86()).await.unwrap().snapshot();
    let latest = live.latest("foo").unwrap();
    assert_eq!(latest.evr.epoch, 1);
    assert_eq!(latest.evr.version, "1.0");
}

#[tokio::test]
async fn older_version_is_rolled_back_at_publish() {
    let h = Harness::new();
    let first = h.default_coordinator(FakeBuildRoot::new().produces("foo", "1.10", "1"));
    let outcome = first.run(request().for_arches([x86()])).await.unwrap();
    assert_eq!(outcome.status(), RequestStatus::Succeeded);

    let second = h.coordinator(
        h.config(5, 2),
        FakeBuildRoot::new().produces("foo", "1.2", "1"),
        "out2",
    );
    let outcome = second.run(request().for_arches([x86()])).await.unwrap();

    let branch = outcome.branch(&x86()).unwrap();
    assert_eq!(branch.state, BranchState::RolledBack);
    assert_eq!(branch.error_class, Some(ErrorClass::Repository));
    let commit = branch.commit.as_ref().unwrap();
    assert_eq!(commit.outcome, TransactionOutcome::Rejected);
    assert!(branch.archived.is_empty());

    let live = h.repos.open("acme", &x86()).await.unwrap().snapshot();
    assert_eq!(live.latest("foo").unwrap().evr.version, "1.10");
}

#[tokio::test]
async fn metadata_failure_rolls_back_and_keeps_live_state() {
    // staging bootstrap, staging commit and live bootstrap succeed
    let h = Harness::with_generator(Arc::new(FailingGenerator::succeeding_first(3)));
    let coordinator = h.default_coordinator(foo());

    let outcome = coordinator.run(request().for_arches([x86()])).await.unwrap();

    let branch = outcome.branch(&x86()).unwrap();
    assert_eq!(branch.state, BranchState::RolledBack);
    assert_eq!(branch.error_class, Some(ErrorClass::Repository));
    assert!(branch.commit.is_none());

    let live = h.repos.open("acme", &x86()).await.unwrap();
    assert_eq!(live.snapshot().generation, 0);
    let outcomes: Vec<TransactionOutcome> = live
        .history()
        .iter()
        .unwrap()
        .map(|t| t.unwrap().outcome)
        .collect();
    assert_eq!(outcomes, vec![TransactionOutcome::RolledBack]);
    assert!(h.annex.list(None).is_empty());
}

#[tokio::test]
async fn request_retention_overrides_repository_default() {
    let h = Harness::new();
    for (i, version) in ["1.0", "1.1"].into_iter().enumerate() {
        let c = h.coordinator(
            h.config(5, 2),
            FakeBuildRoot::new().produces("foo", version, "1"),
            &format!("out{i}"),
        );
        c.run(request().for_arches([x86()])).await.unwrap();
    }
    assert_eq!(h.live_len(&x86()).await, 2);

    let c = h.coordinator(h.config(5, 2), FakeBuildRoot::new().produces("foo", "1.2", "1"), "out9");
    let outcome = c
        .run(
            request()
                .for_arches([x86()])
                .with_retention(RetentionPolicy::keep(1)),
        )
        .await
        .unwrap();
    let commit = outcome.branch(&x86()).unwrap().commit.clone().unwrap();
    assert_eq!(commit.pruned.len(), 2);
    assert_eq!(h.live_len(&x86()).await, 1);
}

#[tokio::test]
async fn configuration_errors_are_reported_at_submit() {
    let h = Harness::new();
    let coordinator = h.default_coordinator(foo());

    let unknown = coordinator
        .submit(request().for_arches(["ppc64le".parse().unwrap()]))
        .err()
        .unwrap();
    assert!(matches!(unknown, PipelineError::Config(_)));

    let empty = coordinator.submit(BuildRequest::new(Vec::new())).err().unwrap();
    assert!(matches!(empty, PipelineError::Config(_)));

    let mut config = h.config(5, 2);
    config.vm.images.remove(&arm());
    let missing = h.coordinator(config, foo(), "out").submit(request()).err().unwrap();
    assert!(missing.to_string().contains("no VM image configured for aarch64"));
    assert_eq!(h.hv.launches(), 0);
}
