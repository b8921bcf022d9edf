//! Aggregated test results across architectures.

use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::domain::Arch;

use super::suite::{TestOutcome, TestResult};

/// One suite result tagged with the architecture it ran on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportEntry {
    pub arch: Arch,
    pub result: TestResult,
}

/// Results of one request, ready for a text summary or JUnit export.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TestReport {
    pub name: String,
    pub entries: Vec<ReportEntry>,
}

impl TestReport {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: Vec::new(),
        }
    }

    pub fn extend(&mut self, arch: &Arch, results: impl IntoIterator<Item = TestResult>) {
        self.entries.extend(results.into_iter().map(|result| ReportEntry {
            arch: arch.clone(),
            result,
        }));
    }

    pub fn count(&self, outcome: TestOutcome) -> usize {
        self.entries
            .iter()
            .filter(|e| e.result.classification == outcome)
            .count()
    }

    pub fn all_passed(&self) -> bool {
        self.entries.iter().all(|e| e.result.passed())
    }

    /// Plain-text table: name, arch, duration, result.
    pub fn summary(&self) -> String {
        let name_width = self
            .entries
            .iter()
            .map(|e| e.result.suite_id.len())
            .chain(std::iter::once("NAME".len()))
            .max()
            .unwrap_or(4);
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{:<name_width$}  {:<8}  {:>10}  {}",
            "NAME", "ARCH", "DURATION", "RESULT"
        );
        for entry in &self.entries {
            let _ = writeln!(
                out,
                "{:<name_width$}  {:<8}  {:>9.1}s  {}",
                entry.result.suite_id,
                entry.arch.as_str(),
                entry.result.duration_ms as f64 / 1000.0,
                entry.result.classification.as_str().to_uppercase(),
            );
        }
        let _ = write!(
            out,
            "{} passed, {} failed, {} errors",
            self.count(TestOutcome::Passed),
            self.count(TestOutcome::Failed),
            self.count(TestOutcome::Error)
        );
        out
    }

    /// JUnit XML document.
    pub fn junit(&self) -> String {
        let total_secs: f64 = self
            .entries
            .iter()
            .map(|e| e.result.duration_ms as f64 / 1000.0)
            .sum();
        let mut out = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
        let _ = writeln!(
            out,
            "<testsuite name=\"{}\" tests=\"{}\" failures=\"{}\" errors=\"{}\" time=\"{:.3}\">",
            xml_escape(&self.name),
            self.entries.len(),
            self.count(TestOutcome::Failed),
            self.count(TestOutcome::Error),
            total_secs
        );
        for entry in &self.entries {
            let result = &entry.result;
            let _ = write!(
                out,
                "  <testcase classname=\"{}.{}\" name=\"{}\" time=\"{:.3}\"",
                xml_escape(&self.name),
                entry.arch,
                xml_escape(&result.suite_id),
                result.duration_ms as f64 / 1000.0
            );
            let log = xml_escape(&result.log);
            match result.classification {
                TestOutcome::Passed => {
                    let _ = writeln!(out, ">\n    <system-out>{log}</system-out>\n  </testcase>");
                }
                TestOutcome::Failed => {
                    let code = result.exit_code.unwrap_or(-1);
                    let _ = writeln!(
                        out,
                        ">\n    <failure message=\"exit code {code}\">{log}</failure>\n  </testcase>"
                    );
                }
                TestOutcome::Error => {
                    let _ = writeln!(
                        out,
                        ">\n    <error message=\"infrastructure error\">{log}</error>\n  </testcase>"
                    );
                }
            }
        }
        out.push_str("</testsuite>\n");
        out
    }
}

/// Escape XML markup; characters XML 1.0 cannot carry at all are written
/// visibly as `#xNN`.
pub fn xml_escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            '\t' | '\n' | '\r' => out.push(c),
            c if (c as u32) < 0x20 || c == '\u{FFFE}' || c == '\u{FFFF}' => {
                let _ = write!(out, "#x{:02X}", c as u32);
            }
            c => out.push(c),
        }
    }
    out
}
