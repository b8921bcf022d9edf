use std::time::Duration;

use serde::{Deserialize, Serialize};

const LOG_DIR: &str = "/var/log/rpmgate";

/// How a suite ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestOutcome {
    Passed,
    /// The test ran and reported failure.
    Failed,
    /// Infrastructure prevented a verdict (timeout, unreachable guest).
    Error,
}

impl TestOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            TestOutcome::Passed => "passed",
            TestOutcome::Failed => "failed",
            TestOutcome::Error => "error",
        }
    }
}

/// Result of one suite run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResult {
    pub suite_id: String,
    /// `None` when the command never completed.
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    pub log: String,
    pub classification: TestOutcome,
}

impl TestResult {
    pub fn from_exit(suite_id: impl Into<String>, exit_code: i32, duration_ms: u64, log: String) -> Self {
        let classification = if exit_code == 0 {
            TestOutcome::Passed
        } else {
            TestOutcome::Failed
        };
        Self {
            suite_id: suite_id.into(),
            exit_code: Some(exit_code),
            duration_ms,
            log,
            classification,
        }
    }

    pub fn error(suite_id: impl Into<String>, duration_ms: u64, log: String) -> Self {
        Self {
            suite_id: suite_id.into(),
            exit_code: None,
            duration_ms,
            log,
            classification: TestOutcome::Error,
        }
    }

    pub fn passed(&self) -> bool {
        self.classification == TestOutcome::Passed
    }
}

/// A script to run in the guest, with the file its output is teed into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestCommand {
    pub id: String,
    pub script: String,
    /// Guest path holding the command's output while it runs.
    pub log_path: String,
}

impl GuestCommand {
    pub fn new(id: impl Into<String>, script: impl Into<String>) -> Self {
        let id = id.into();
        let log_path = default_log_path(&id);
        Self {
            id,
            script: script.into(),
            log_path,
        }
    }

    /// Script actually sent to the guest: output goes to the log file and is
    /// echoed back, and the original exit status is preserved.
    pub fn wrapped(&self) -> String {
        format!(
            "mkdir -p \"$(dirname '{log}')\"\n( cd /tmp\n{script}\n) > '{log}' 2>&1\nrc=$?\ncat '{log}'\nexit $rc\n",
            log = self.log_path,
            script = self.script,
        )
    }
}

fn default_log_path(id: &str) -> String {
    let safe: String = id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    format!("{LOG_DIR}/{safe}.log")
}

/// One ordered unit of validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestSuite {
    pub id: String,
    pub command: String,
    /// A failing fatal suite aborts the remaining ones.
    pub fatal: bool,
    pub timeout: Duration,
    /// Guest log path; defaults to `/var/log/rpmgate/<id>.log`.
    pub log_path: Option<String>,
}

impl TestSuite {
    pub fn new(id: impl Into<String>, command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            id: id.into(),
            command: command.into(),
            fatal: false,
            timeout,
            log_path: None,
        }
    }

    pub fn fatal(mut self) -> Self {
        self.fatal = true;
        self
    }

    pub fn with_log_path(mut self, path: impl Into<String>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    pub fn guest_command(&self) -> GuestCommand {
        let mut cmd = GuestCommand::new(&self.id, &self.command);
        if let Some(path) = &self.log_path {
            cmd.log_path = path.clone();
        }
        cmd
    }

    /// Install (or upgrade) the given packages and roll the transaction back.
    ///
    /// Always fatal: if the packages do not install, nothing else can run.
    pub fn basic_install(packages: &[String], timeout: Duration) -> Self {
        let list = packages.join(" ");
        let script = format!(
            "set -e\n\
             if [ -x /usr/bin/dnf ]; then YUM=dnf; else YUM=yum; fi\n\
             installed=\"\"\n\
             for pkg in {list}; do rpm -q \"$pkg\" >/dev/null 2>&1 && installed=\"$installed $pkg\"; done\n\
             if [ -n \"$installed\" ]; then $YUM -y -d1 upgrade {list}; else $YUM -y -d1 install {list}; fi\n\
             $YUM -y -d1 history undo last\n"
        );
        Self::new("basic-install", script, timeout).fatal()
    }
}
