//! Fan-out coordinator: one independent branch per target architecture.
//!
//! A branch builds every package of the request, stages the binaries into a
//! private repository, validates them in a fresh guest and, only if every
//! suite passed, commits them to the live repository and archives them.
//! Branches share nothing but the worker pool, so one architecture failing
//! never blocks or rolls back another.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{BoxStream, StreamExt};
use rpmgate_core::obs;
use rpmgate_core::render::{self, cloud_init_meta_data, cloud_init_user_data, guest_mount_point};
use rpmgate_core::vm::CloudInitSeed;
use rpmgate_core::{
    Arch, ArtifactSet, BuildArtifact, BuildExecutor, Classify, ConfigError, GuestCommand, Hypervisor,
    ProjectConfig, RenderContext, RepoConfig, SessionRegistry, SharedMount, TestOutcome,
    TestResult, TestRunner, TestSuite, VmDescriptor, VmSession,
};
use rpmgate_state::{Annex, RepositoryHandle, RepositoryStore, RetentionPolicy, StagedChange};
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

use crate::error::{PipelineError, PipelineResult};
use crate::request::{BranchOutcome, BuildRequest, ProgressEvent, RequestOutcome};
use crate::state::BranchState;

/// Name of the per-branch repository holding freshly built packages.
const STAGING_REPO: &str = "rpmgate-staging";

const PREPARE_TIMEOUT: Duration = Duration::from_secs(600);

/// 9p mount tags are limited to 31 bytes.
const MAX_TAG_LEN: usize = 31;

/// Hex digits of the name digest appended to shortened tags.
const TAG_DIGEST_LEN: usize = 8;

/// Runs requests against one project configuration.
///
/// Cheap to clone; clones share the worker pool, the session registry and
/// the repository store.
#[derive(Clone)]
pub struct Coordinator {
    config: Arc<ProjectConfig>,
    hypervisor: Arc<dyn Hypervisor>,
    builder: Arc<BuildExecutor>,
    repos: Arc<RepositoryStore>,
    annex: Arc<Annex>,
    registry: SessionRegistry,
    runner: TestRunner,
    workers: Arc<Semaphore>,
    scratch: PathBuf,
}

impl Coordinator {
    pub fn new(
        config: ProjectConfig,
        hypervisor: Arc<dyn Hypervisor>,
        builder: Arc<BuildExecutor>,
        repos: Arc<RepositoryStore>,
        annex: Arc<Annex>,
    ) -> Self {
        let workers = config.pipeline.workers.max(1);
        Self {
            config: Arc::new(config),
            hypervisor,
            builder,
            repos,
            annex,
            registry: SessionRegistry::new(),
            runner: TestRunner::new(),
            workers: Arc::new(Semaphore::new(workers)),
            scratch: std::env::temp_dir(),
        }
    }

    /// Directory for per-branch staging repositories. Defaults to the system
    /// temp dir; it must be shareable into guests.
    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch = dir.into();
        self
    }

    pub fn with_runner(mut self, runner: TestRunner) -> Self {
        self.runner = runner;
        self
    }

    pub fn config(&self) -> &ProjectConfig {
        &self.config
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn repositories(&self) -> &RepositoryStore {
        &self.repos
    }

    /// Start a request in the background.
    ///
    /// Configuration problems (no packages, unknown architecture, missing
    /// image) are reported here, before any branch starts.
    pub fn submit(&self, request: BuildRequest) -> PipelineResult<RequestHandle> {
        let arches = self.resolve_arches(&request)?;
        if request.packages.is_empty() {
            return Err(ConfigError::Invalid(format!("request {} has no packages", request.id)).into());
        }
        for arch in &arches {
            self.config.image_for(arch)?;
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mut cancels = HashMap::new();
        let mut branches = Vec::with_capacity(arches.len());
        for arch in arches {
            let (tx, rx) = watch::channel(false);
            cancels.insert(arch.clone(), tx);
            branches.push((arch, rx));
        }

        let id = request.id.clone();
        let span = obs::request_span(&id);
        let this = self.clone();
        let task = tokio::spawn(
            async move { this.drive(Arc::new(request), branches, events_tx).await }.instrument(span),
        );
        info!(request_id = %id, "request submitted");

        Ok(RequestHandle {
            id,
            events: Some(events_rx),
            cancels,
            task,
        })
    }

    /// Submit and wait for the outcome.
    pub async fn run(&self, request: BuildRequest) -> PipelineResult<RequestOutcome> {
        self.submit(request)?.wait().await
    }

    fn resolve_arches(&self, request: &BuildRequest) -> PipelineResult<Vec<Arch>> {
        if request.arches.is_empty() {
            return Ok(self.config.arch.clone());
        }
        let mut arches: Vec<Arch> = Vec::with_capacity(request.arches.len());
        for arch in &request.arches {
            if !self.config.arch.contains(arch) {
                return Err(ConfigError::UnlistedArch {
                    arch: arch.clone(),
                    section: format!("request {}", request.id),
                }
                .into());
            }
            if !arches.contains(arch) {
                arches.push(arch.clone());
            }
        }
        Ok(arches)
    }

    async fn drive(
        self,
        request: Arc<BuildRequest>,
        branches: Vec<(Arch, watch::Receiver<bool>)>,
        events: mpsc::UnboundedSender<ProgressEvent>,
    ) -> RequestOutcome {
        let started = Instant::now();
        let arches: Vec<Arch> = branches.iter().map(|(a, _)| a.clone()).collect();

        let tasks: Vec<_> = branches
            .into_iter()
            .map(|(arch, cancel)| {
                let this = self.clone();
                let request = Arc::clone(&request);
                let events = events.clone();
                tokio::spawn(
                    async move { this.run_branch(request, arch, cancel, events).await }
                        .in_current_span(),
                )
            })
            .collect();
        drop(events);

        let mut outcomes = Vec::with_capacity(tasks.len());
        for (joined, arch) in futures::future::join_all(tasks).await.into_iter().zip(arches) {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    warn!(arch = %arch, error = %e, "branch task died");
                    let mut outcome = BranchOutcome::new(arch);
                    let err = PipelineError::Join(e.to_string());
                    outcome.state = BranchState::Aborted;
                    outcome.error_class = Some(err.class());
                    outcome.error = Some(err.to_string());
                    outcomes.push(outcome);
                }
            }
        }

        let outcome = RequestOutcome {
            request_id: request.id.clone(),
            branches: outcomes,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        let succeeded = outcome.succeeded_count();
        obs::emit_request_finished(
            &request.id,
            succeeded,
            outcome.branches.len() - succeeded,
            outcome.duration_ms,
        );
        outcome
    }

    async fn run_branch(
        self,
        request: Arc<BuildRequest>,
        arch: Arch,
        mut cancel: watch::Receiver<bool>,
        events: mpsc::UnboundedSender<ProgressEvent>,
    ) -> BranchOutcome {
        let mut branch = Branch::new(&request.id, arch.clone(), events);

        let permit = tokio::select! {
            permit = Arc::clone(&self.workers).acquire_owned() => permit.ok(),
            _ = cancelled(&mut cancel) => None,
        };
        let Some(_permit) = permit else {
            return branch.finish(Some(PipelineError::Cancelled));
        };

        let mut sets = Vec::new();
        let validated = tokio::select! {
            res = self.build_and_validate(&request, &mut branch, &mut sets) => res,
            _ = cancelled(&mut cancel) => Err(PipelineError::Cancelled),
        };
        // Publishing is never interrupted; a cancel that lost the race to
        // validation still stops the branch here.
        let result = match validated {
            Ok(()) if *cancel.borrow() => Err(PipelineError::Cancelled),
            Ok(()) => self.publish_and_archive(&request, &mut branch, &sets).await,
            Err(e) => Err(e),
        };

        for set in &sets {
            self.builder.release(set).await;
        }
        branch.finish(result.err())
    }

    async fn build_and_validate(
        &self,
        request: &BuildRequest,
        branch: &mut Branch,
        sets: &mut Vec<ArtifactSet>,
    ) -> PipelineResult<()> {
        let arch = branch.arch().clone();
        branch.advance(BranchState::Building);

        let staging_dir = tempfile::Builder::new()
            .prefix("rpmgate-staging-")
            .tempdir_in(&self.scratch)?;
        let staging = RepositoryHandle::open(
            staging_dir.path(),
            STAGING_REPO,
            arch.clone(),
            self.repos.generator(),
            RetentionPolicy::keep(usize::MAX),
        )
        .await?;

        for spec in &request.packages {
            let mut repos = self.config.repos_for(&arch);
            if !sets.is_empty() {
                repos.insert(0, RepoConfig::local(STAGING_REPO, staging.published_path()));
            }
            let set = self.builder.build(spec, &arch, &repos).await?;
            branch.outcome.built.extend(set.iter().map(|a| a.key.clone()));

            let mut changes = Vec::new();
            for artifact in set.installable_on(&arch) {
                changes.push(staging.stage(artifact).await?);
            }
            sets.push(set);
            let commit = staging.commit(changes).await?;
            if !commit.is_committed() {
                return Err(PipelineError::Rejected {
                    transaction_id: commit.transaction_id,
                    reasons: commit.rejected,
                });
            }
        }

        branch.advance(BranchState::Validating);
        let mut packages: Vec<String> = sets.iter().flat_map(ArtifactSet::package_names).collect();
        packages.sort();
        packages.dedup();
        let mut suites = vec![TestSuite::basic_install(&packages, request.install_timeout)];
        suites.extend(request.suites.iter().cloned());

        let max_retries = self.config.pipeline.infra_retries;
        let mut attempt = 0;
        loop {
            let name = session_name(&self.config.name, &arch, &request.id, attempt);
            branch.outcome.attempts = attempt + 1;
            branch.outcome.results.clear();

            let err = match self.validate_once(&name, &arch, &staging, &suites).await {
                Ok(results) => {
                    let failed = suite_ids(&results, TestOutcome::Failed);
                    let incomplete = suite_ids(&results, TestOutcome::Error);
                    branch.outcome.results = results;
                    if !failed.is_empty() {
                        return Err(PipelineError::ValidationFailed(failed));
                    }
                    if incomplete.is_empty() {
                        return Ok(());
                    }
                    PipelineError::ValidationIncomplete(incomplete)
                }
                Err(e) => e,
            };

            if !err.class().is_retryable() || attempt >= max_retries {
                return Err(err);
            }
            attempt += 1;
            branch.retry(attempt, &err);
        }
    }

    /// One guest, start to stop. The guest is gone when this returns.
    async fn validate_once(
        &self,
        name: &str,
        arch: &Arch,
        staging: &RepositoryHandle,
        suites: &[TestSuite],
    ) -> PipelineResult<Vec<TestResult>> {
        let vm = &self.config.vm;
        let ctx = RenderContext::for_project(&self.config, name, arch)
            .with_repo(RepoConfig::local(STAGING_REPO, staging.published_path()));
        let mounts: Vec<SharedMount> = ctx
            .repos
            .iter()
            .filter_map(|repo| {
                let host = repo.path()?;
                Some(
                    SharedMount::new(mount_tag(&repo.name), host, guest_mount_point(&repo.name), vm.shared_fs_type)
                        .read_only(),
                )
            })
            .collect();

        let mut descriptor = VmDescriptor::new(name, arch.clone(), self.config.image_for(arch)?)
            .with_boot_timeout(vm.boot_timeout())
            .with_shutdown_timeout(vm.shutdown_timeout());
        descriptor.mounts = mounts.clone();
        descriptor.proxy = ctx.proxy.clone();
        descriptor.cpus = vm.cpus;
        descriptor.memory = vm.memory;
        descriptor.ready_marker = vm.ready_marker.clone();
        descriptor.seed = Some(CloudInitSeed {
            user_data: cloud_init_user_data(&ctx, vm.ssh_pubkey.as_deref(), &vm.ready_marker),
            meta_data: cloud_init_meta_data(&ctx, name),
        });

        let mut session = VmSession::start(&self.registry, self.hypervisor.as_ref(), descriptor).await?;
        let result = self.exercise(&mut session, &ctx, &mounts, suites).await;
        if let Err(e) = session.stop(false).await {
            warn!(session = %name, error = %e, "guest did not stop cleanly");
        }
        result
    }

    async fn exercise(
        &self,
        session: &mut VmSession,
        ctx: &RenderContext,
        mounts: &[SharedMount],
        suites: &[TestSuite],
    ) -> PipelineResult<Vec<TestResult>> {
        session.mount_all().await?;
        let prepare = GuestCommand::new(
            "prepare",
            render::prepare_script(ctx, &self.config.vm.address, mounts),
        );
        let prepared = session.exec(&prepare, PREPARE_TIMEOUT).await?;
        if !prepared.passed() {
            return Err(PipelineError::Prepare(tail(&prepared.log, 20)));
        }
        Ok(self.runner.run(session, suites).await)
    }

    async fn publish_and_archive(
        &self,
        request: &BuildRequest,
        branch: &mut Branch,
        sets: &[ArtifactSet],
    ) -> PipelineResult<()> {
        let arch = branch.arch().clone();
        branch.advance(BranchState::Publishing);

        let live = self.repos.open(&self.config.name, &arch).await?;
        let commit = {
            let _guard = live.lock_publish().await;
            let installable: Vec<&BuildArtifact> =
                sets.iter().flat_map(|s| s.installable_on(&arch)).collect();
            let changes = stage_all(&live, installable).await?;
            let retention = request.retention.unwrap_or_else(|| live.retention());
            live.commit_with(changes, retention).await?
        };
        let committed = commit.is_committed();
        let rejection = (!committed).then(|| PipelineError::Rejected {
            transaction_id: commit.transaction_id,
            reasons: commit.rejected.clone(),
        });
        branch.outcome.commit = Some(commit);
        if let Some(err) = rejection {
            return Err(err);
        }

        for artifact in sets.iter().flat_map(ArtifactSet::iter) {
            let annex = Arc::clone(&self.annex);
            let path = artifact.path.clone();
            let entry = tokio::task::spawn_blocking(move || annex.store_file(path))
                .await
                .map_err(|e| PipelineError::Join(e.to_string()))??;
            branch.outcome.archived.push(entry.digest);
        }
        branch.advance(BranchState::Archived);
        Ok(())
    }
}

/// Handle to a running request.
pub struct RequestHandle {
    id: String,
    events: Option<mpsc::UnboundedReceiver<ProgressEvent>>,
    cancels: HashMap<Arch, watch::Sender<bool>>,
    task: JoinHandle<RequestOutcome>,
}

impl RequestHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Progress events in the order they happened. Available once; the
    /// stream ends when every branch has finished.
    pub fn progress(&mut self) -> Option<BoxStream<'static, ProgressEvent>> {
        let rx = self.events.take()?;
        Some(
            futures::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|e| (e, rx)) })
                .boxed(),
        )
    }

    /// Cancel every branch still running. Guests and builds in flight are
    /// terminated; branches already publishing finish first.
    pub fn cancel(&self) {
        for tx in self.cancels.values() {
            let _ = tx.send(true);
        }
    }

    /// Cancel one architecture's branch. Returns false for an arch the
    /// request does not cover.
    pub fn cancel_arch(&self, arch: &Arch) -> bool {
        match self.cancels.get(arch) {
            Some(tx) => {
                let _ = tx.send(true);
                true
            }
            None => false,
        }
    }

    pub async fn wait(self) -> PipelineResult<RequestOutcome> {
        self.task.await.map_err(|e| PipelineError::Join(e.to_string()))
    }
}

/// Mutable side of one branch: its outcome so far and where events go.
struct Branch {
    request_id: String,
    outcome: BranchOutcome,
    events: mpsc::UnboundedSender<ProgressEvent>,
}

impl Branch {
    fn new(request_id: &str, arch: Arch, events: mpsc::UnboundedSender<ProgressEvent>) -> Self {
        Self {
            request_id: request_id.to_string(),
            outcome: BranchOutcome::new(arch),
            events,
        }
    }

    fn arch(&self) -> &Arch {
        &self.outcome.arch
    }

    fn advance(&mut self, next: BranchState) {
        let from = self.outcome.state;
        debug_assert!(from.can_transition_to(next), "{from} -> {next}");
        if !from.can_transition_to(next) {
            warn!(arch = %self.outcome.arch, from = %from, to = %next, "ignoring invalid branch transition");
            return;
        }
        self.outcome.state = next;
        obs::emit_branch_transition(&self.request_id, self.outcome.arch.as_str(), from.as_str(), next.as_str());
        let _ = self.events.send(ProgressEvent::Transition {
            arch: self.outcome.arch.clone(),
            from,
            to: next,
        });
    }

    fn retry(&mut self, attempt: u32, error: &PipelineError) {
        obs::emit_branch_retry(&self.request_id, self.outcome.arch.as_str(), attempt, error);
        let _ = self.events.send(ProgressEvent::Retry {
            arch: self.outcome.arch.clone(),
            attempt,
            reason: error.to_string(),
        });
    }

    /// Settle the terminal state and announce the outcome.
    ///
    /// A failure while publishing is a rollback as long as nothing was
    /// committed; once the commit landed the branch can only abort.
    fn finish(mut self, error: Option<PipelineError>) -> BranchOutcome {
        if let Some(err) = error {
            let committed = self.outcome.commit.as_ref().is_some_and(|c| c.is_committed());
            let terminal = if self.outcome.state == BranchState::Publishing && !committed {
                BranchState::RolledBack
            } else {
                BranchState::Aborted
            };
            debug!(arch = %self.outcome.arch, error = %err, "branch failed");
            self.outcome.error_class = Some(err.class());
            self.outcome.error = Some(err.to_string());
            self.advance(terminal);
        }
        let _ = self.events.send(ProgressEvent::Finished(self.outcome.clone()));
        self.outcome
    }
}

/// Resolves once `rx` reads true. Never resolves if the sender is gone.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Stage every artifact or none: copies already staged are discarded when a
/// later one fails.
async fn stage_all<'a>(
    live: &RepositoryHandle,
    artifacts: impl IntoIterator<Item = &'a BuildArtifact>,
) -> PipelineResult<Vec<StagedChange>> {
    let mut changes = Vec::new();
    for artifact in artifacts {
        match live.stage(artifact).await {
            Ok(change) => changes.push(change),
            Err(e) => {
                live.discard(&changes).await;
                return Err(e.into());
            }
        }
    }
    Ok(changes)
}

fn session_name(project: &str, arch: &Arch, request_id: &str, attempt: u32) -> String {
    if attempt == 0 {
        format!("{project}-{arch}-{request_id}")
    } else {
        format!("{project}-{arch}-{request_id}-retry{attempt}")
    }
}

/// Names that fit are used as is. Longer names keep a prefix and gain a
/// digest of the full name, so names sharing a long prefix stay distinct.
fn mount_tag(repo: &str) -> String {
    if repo.len() <= MAX_TAG_LEN {
        return repo.to_string();
    }
    let mut end = MAX_TAG_LEN - TAG_DIGEST_LEN - 1;
    while !repo.is_char_boundary(end) {
        end -= 1;
    }
    let digest = hex::encode(Sha256::digest(repo.as_bytes()));
    format!("{}-{}", &repo[..end], &digest[..TAG_DIGEST_LEN])
}

fn suite_ids(results: &[TestResult], outcome: TestOutcome) -> Vec<String> {
    results
        .iter()
        .filter(|r| r.classification == outcome)
        .map(|r| r.suite_id.clone())
        .collect()
}

fn tail(log: &str, lines: usize) -> String {
    let all: Vec<&str> = log.lines().collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}
