//! rpmgate - build, validate and publish RPM packages
//!
//! ## Commands
//!
//! - `validate`: build packages, validate them in VMs and publish on success
//! - `repo history`: show the transaction log of a repository
//! - `annex list`: list archived artifacts
//! - `annex backup`: write a backup archive of annex entries

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use futures::StreamExt;
use rpmgate_core::telemetry::init_tracing;
use rpmgate_core::{
    Arch, BuildExecutor, MockProvider, PackageSpec, ProjectConfig, QemuHypervisor, QemuOptions,
    RpmSigner, TestSuite,
};
use rpmgate_pipeline::{BuildRequest, Coordinator, ProgressEvent, RequestOutcome, RequestStatus};
use rpmgate_state::annex::parse_timestamp;
use rpmgate_state::{Annex, BackupSelector, CreaterepoGenerator, RepositoryStore, RetentionPolicy};
use serde::Serialize;
use tracing::{info, warn, Level};

#[derive(Parser)]
#[command(name = "rpmgate")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Build, validate and publish RPM packages", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Project configuration file
    #[arg(short, long, global = true, env = "RPMGATE_CONFIG", default_value = "rpmgate.toml")]
    config: PathBuf,

    /// Output format for command results
    #[arg(long, global = true, value_enum, default_value_t = Format::Text)]
    format: Format,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Build, validate and publish packages
    Validate {
        /// Spec files, built in the order given
        #[arg(required = true)]
        specs: Vec<PathBuf>,

        /// Sources directory (default: each spec's directory)
        #[arg(long)]
        sources: Option<PathBuf>,

        /// Target architecture; repeat for several (default: all configured)
        #[arg(short, long = "arch")]
        arches: Vec<Arch>,

        /// Extra test suite as ID=COMMAND; repeat for several
        #[arg(long = "suite", value_parser = parse_suite)]
        suites: Vec<(String, String)>,

        /// Like --suite, but a failure skips the remaining suites
        #[arg(long = "fatal-suite", value_parser = parse_suite)]
        fatal_suites: Vec<(String, String)>,

        /// Timeout for each extra suite, in seconds
        #[arg(long, default_value_t = 1800)]
        suite_timeout: u64,

        /// Keep this many versions per package live (default: from config)
        #[arg(long)]
        keep: Option<usize>,

        /// Write a JUnit XML report here
        #[arg(long)]
        junit: Option<PathBuf>,
    },

    /// Inspect published repositories
    Repo {
        #[command(subcommand)]
        action: RepoAction,
    },

    /// Inspect and back up the artifact annex
    Annex {
        #[command(subcommand)]
        action: AnnexAction,
    },
}

#[derive(Subcommand)]
enum RepoAction {
    /// Show the transaction log, oldest first
    History {
        #[arg(short, long)]
        arch: Arch,

        /// Repository name (default: project name)
        #[arg(long)]
        name: Option<String>,

        /// Show only the last N transactions
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },
}

#[derive(Subcommand)]
enum AnnexAction {
    /// List stored artifacts
    List {
        /// Only entries at or after this time (epoch seconds or RFC 3339)
        #[arg(long, value_parser = parse_time)]
        since: Option<i64>,
    },

    /// Archive entries into a compressed tarball
    Backup {
        #[arg(long, value_parser = parse_time)]
        since: Option<i64>,

        #[arg(long, value_parser = parse_time)]
        until: Option<i64>,

        /// Only artifacts whose name starts with this prefix
        #[arg(long = "match")]
        prefix: Option<String>,

        /// Include entries already covered by an earlier backup
        #[arg(long)]
        all: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    init_tracing(cli.json, level);

    let config = ProjectConfig::load(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;

    match cli.command {
        Commands::Validate {
            specs,
            sources,
            arches,
            suites,
            fatal_suites,
            suite_timeout,
            keep,
            junit,
        } => {
            let timeout = Duration::from_secs(suite_timeout);
            let mut request = BuildRequest::new(package_specs(&specs, sources.as_deref())?)
                .for_arches(arches);
            for (id, command) in suites {
                request = request.with_suite(TestSuite::new(id, command, timeout));
            }
            for (id, command) in fatal_suites {
                request = request.with_suite(TestSuite::new(id, command, timeout).fatal());
            }
            if let Some(n) = keep {
                request = request.with_retention(RetentionPolicy::keep(n));
            }
            cmd_validate(config, request, cli.format, junit.as_deref()).await
        }
        Commands::Repo { action } => match action {
            RepoAction::History { arch, name, limit } => {
                cmd_repo_history(&config, name.as_deref(), &arch, limit, cli.format)
            }
        },
        Commands::Annex { action } => match action {
            AnnexAction::List { since } => cmd_annex_list(&config, since, cli.format),
            AnnexAction::Backup {
                since,
                until,
                prefix,
                all,
            } => {
                let mut selector = if all {
                    BackupSelector::all()
                } else {
                    BackupSelector::pending()
                };
                selector.since = since;
                selector.until = until;
                selector.artifact_prefix = prefix;
                cmd_annex_backup(&config, &selector, cli.format)
            }
        },
    }
}

fn parse_suite(arg: &str) -> std::result::Result<(String, String), String> {
    match arg.split_once('=') {
        Some((id, command)) if !id.trim().is_empty() && !command.trim().is_empty() => {
            Ok((id.trim().to_string(), command.to_string()))
        }
        _ => Err(format!("expected ID=COMMAND, got '{arg}'")),
    }
}

fn parse_time(arg: &str) -> std::result::Result<i64, String> {
    parse_timestamp(arg).ok_or_else(|| format!("not epoch seconds or RFC 3339: '{arg}'"))
}

/// Package name is the spec's file stem; sources default to its directory.
fn package_specs(specs: &[PathBuf], sources: Option<&Path>) -> Result<Vec<PackageSpec>> {
    specs
        .iter()
        .map(|spec| {
            let name = spec
                .file_stem()
                .and_then(|s| s.to_str())
                .filter(|s| !s.is_empty())
                .with_context(|| format!("Cannot derive a package name from {}", spec.display()))?;
            let dir = match sources {
                Some(dir) => dir.to_path_buf(),
                None => spec
                    .parent()
                    .filter(|p| !p.as_os_str().is_empty())
                    .unwrap_or(Path::new("."))
                    .to_path_buf(),
            };
            Ok(PackageSpec::new(name, spec, dir))
        })
        .collect()
}

fn open_annex(config: &ProjectConfig) -> Result<Annex> {
    Annex::open(&config.annex.path, &config.annex.backup_dir)
        .with_context(|| format!("Failed to open annex at {}", config.annex.path.display()))
}

/// Wire the production collaborators and run one request.
async fn cmd_validate(
    config: ProjectConfig,
    request: BuildRequest,
    format: Format,
    junit: Option<&Path>,
) -> Result<()> {
    let work = std::env::temp_dir().join(format!("rpmgate-{}", request.id));
    let mock_dir = config.build.config_dir.clone().unwrap_or_else(|| work.join("mock"));
    let scratch = work.join("staging");
    std::fs::create_dir_all(&scratch)
        .with_context(|| format!("Failed to create {}", scratch.display()))?;

    let mut builder = BuildExecutor::new(
        Arc::new(MockProvider::new(&config, mock_dir)),
        work.join("results"),
        config.build.roots_per_arch,
    );
    if config.build.sign {
        let gpg = config
            .gpg
            .as_ref()
            .context("build.sign is set but the [gpg] section is missing")?;
        builder = builder.with_signer(Arc::new(RpmSigner::new(gpg)));
    }

    let repos = RepositoryStore::new(
        &config.repository.path,
        Arc::new(CreaterepoGenerator::new(&config.repository.createrepo)),
        RetentionPolicy::keep(config.repository.keep_versions),
    );
    let annex = open_annex(&config)?;
    let hypervisor = QemuHypervisor::new(QemuOptions::from_settings(&config.vm));

    let coordinator = Coordinator::new(
        config,
        Arc::new(hypervisor),
        Arc::new(builder),
        Arc::new(repos),
        Arc::new(annex),
    )
    .with_scratch_dir(&scratch);

    let mut handle = coordinator.submit(request).context("Request rejected")?;
    info!(request_id = %handle.id(), "validating");
    let mut progress = handle.progress().context("Progress stream already taken")?;
    let mut interrupted = false;
    loop {
        tokio::select! {
            event = progress.next() => match event {
                Some(event) => print_event(&event, format)?,
                None => break,
            },
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                warn!("interrupted; cancelling running branches");
                handle.cancel();
                interrupted = true;
            }
        }
    }
    let outcome = handle.wait().await.context("Coordinator task failed")?;

    if let Err(e) = std::fs::remove_dir_all(&work) {
        warn!(dir = %work.display(), error = %e, "failed to clean work directory");
    }
    if let Some(path) = junit {
        std::fs::write(path, outcome.report().junit())
            .with_context(|| format!("Failed to write {}", path.display()))?;
    }

    print_outcome(&outcome, format)?;
    match outcome.status() {
        RequestStatus::Succeeded => Ok(()),
        RequestStatus::Partial => bail!(
            "{} of {} architectures published",
            outcome.succeeded_count(),
            outcome.branches.len()
        ),
        RequestStatus::Failed => bail!("nothing was published"),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

fn print_event(event: &ProgressEvent, format: Format) -> Result<()> {
    if format == Format::Json {
        return print_json(event);
    }
    match event {
        ProgressEvent::Transition { arch, from, to } => println!("[{arch}] {from} -> {to}"),
        ProgressEvent::Retry { arch, attempt, reason } => {
            println!("[{arch}] retry {attempt}: {reason}")
        }
        ProgressEvent::Finished(branch) => match &branch.error {
            Some(error) => println!("[{}] {}: {error}", branch.arch, branch.state),
            None => println!("[{}] {}", branch.arch, branch.state),
        },
    }
    Ok(())
}

fn print_outcome(outcome: &RequestOutcome, format: Format) -> Result<()> {
    if format == Format::Json {
        return print_json(outcome);
    }
    println!();
    print!("{}", outcome.report().summary());
    println!();
    for branch in &outcome.branches {
        let status = if branch.succeeded() { "✓" } else { "✗" };
        match &branch.commit {
            Some(commit) => println!(
                "  {status} {} {} (transaction {}, generation {})",
                branch.arch,
                branch.state,
                commit.transaction_id,
                commit.generation
            ),
            None => println!("  {status} {} {}", branch.arch, branch.state),
        }
    }
    println!();
    println!("Request {} finished in {}ms", outcome.request_id, outcome.duration_ms);
    Ok(())
}

fn cmd_repo_history(
    config: &ProjectConfig,
    name: Option<&str>,
    arch: &Arch,
    limit: Option<usize>,
    format: Format,
) -> Result<()> {
    let name = name.unwrap_or(&config.name);
    let store = RepositoryStore::new(
        &config.repository.path,
        Arc::new(CreaterepoGenerator::new(&config.repository.createrepo)),
        RetentionPolicy::keep(config.repository.keep_versions),
    );
    let history = store
        .history(name, arch)
        .with_context(|| format!("Failed to read history of {name}/{arch}"))?;

    if history.is_empty() {
        if format == Format::Text {
            println!("No transactions for {name}/{arch}");
        }
        return Ok(());
    }

    let skip = limit.map_or(0, |n| history.len().saturating_sub(n));
    for tx in history.iter()?.skip(skip) {
        let tx = tx?;
        if format == Format::Json {
            print_json(&tx)?;
            continue;
        }
        let when = chrono::DateTime::from_timestamp(tx.timestamp, 0)
            .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
            .unwrap_or_else(|| tx.timestamp.to_string());
        println!(
            "transaction {} {} generation {} ({})",
            tx.id,
            tx.outcome.as_str(),
            tx.generation,
            when
        );
        for change in &tx.changes {
            println!("    {:?} {}", change.action, change.key);
        }
        for key in &tx.pruned {
            println!("    pruned {key}");
        }
        if let Some(detail) = &tx.detail {
            println!("    {detail}");
        }
    }
    Ok(())
}

fn cmd_annex_list(config: &ProjectConfig, since: Option<i64>, format: Format) -> Result<()> {
    let annex = open_annex(config)?;
    let listing = annex.list(since);

    if listing.is_empty() {
        if format == Format::Text {
            println!("No annex entries");
        }
        return Ok(());
    }
    for entry in listing.iter() {
        if format == Format::Json {
            print_json(entry)?;
            continue;
        }
        let backed_up = if entry.backed_up { "*" } else { " " };
        println!(
            "{} {}{} {:>10} {}",
            entry.display_time(),
            &entry.digest[..12.min(entry.digest.len())],
            backed_up,
            entry.size,
            entry.artifact
        );
    }
    Ok(())
}

fn cmd_annex_backup(config: &ProjectConfig, selector: &BackupSelector, format: Format) -> Result<()> {
    let annex = open_annex(config)?;
    let manifest = annex.backup(selector).context("Backup failed")?;
    if format == Format::Json {
        return print_json(&manifest);
    }
    println!(
        "Backed up {} entries to {}",
        manifest.entries.len(),
        manifest.archive.display()
    );
    Ok(())
}
