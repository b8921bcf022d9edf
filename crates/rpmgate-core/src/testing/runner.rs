//! Ordered suite execution against one VM session.

use std::time::Duration;

use tracing::{info, warn};

use crate::vm::{SessionError, VmSession};

use super::suite::{TestOutcome, TestResult, TestSuite};

/// Runs suites strictly in order.
///
/// A fatal suite that does not pass stops the sequence; skipped suites
/// produce no result. Suites are never retried here: a retry needs a fresh
/// session, which is the coordinator's call.
#[derive(Debug, Clone)]
pub struct TestRunner {
    /// Budget for pulling a partial log after a timeout.
    pub log_fetch_timeout: Duration,
}

impl Default for TestRunner {
    fn default() -> Self {
        Self {
            log_fetch_timeout: Duration::from_secs(10),
        }
    }
}

impl TestRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn run(&self, session: &mut VmSession, suites: &[TestSuite]) -> Vec<TestResult> {
        let mut results = Vec::with_capacity(suites.len());

        for suite in suites {
            let result = self.run_one(session, suite).await;
            info!(
                session = %session.name(),
                suite = %suite.id,
                outcome = result.classification.as_str(),
                duration_ms = result.duration_ms,
                "suite finished"
            );
            let stop = suite.fatal && result.classification != TestOutcome::Passed;
            results.push(result);
            if stop {
                warn!(session = %session.name(), suite = %suite.id, "fatal suite did not pass; skipping the rest");
                break;
            }
        }
        results
    }

    async fn run_one(&self, session: &mut VmSession, suite: &TestSuite) -> TestResult {
        let command = suite.guest_command();
        match session.exec(&command, suite.timeout).await {
            Ok(result) => result,
            Err(SessionError::Timeout { limit_ms, .. }) => {
                let partial = match session
                    .read_guest_file(&command.log_path, self.log_fetch_timeout)
                    .await
                {
                    Ok(text) => text,
                    Err(e) => format!("<partial log unavailable: {e}>"),
                };
                let log = format!("{partial}\n<suite timed out after {limit_ms}ms>");
                TestResult::error(&suite.id, limit_ms, log)
            }
            Err(e) => TestResult::error(&suite.id, 0, e.to_string()),
        }
    }
}
