//! Test suites, the ordered runner and result reports.

pub mod report;
pub mod runner;
pub mod suite;

pub use report::{ReportEntry, TestReport};
pub use runner::TestRunner;
pub use suite::{GuestCommand, TestOutcome, TestResult, TestSuite};
