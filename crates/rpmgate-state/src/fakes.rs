//! Deterministic collaborators for repository tests.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::repository::{IndexGenerator, MetadataGenerator, RepoError, RepoResult};

/// Metadata generator that fails on demand.
///
/// Succeeds (behaving like [`IndexGenerator`]) for the first `successes`
/// calls and fails every call after that.
#[derive(Debug, Clone)]
pub struct FailingGenerator {
    successes: usize,
    calls: Arc<AtomicUsize>,
}

impl Default for FailingGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl FailingGenerator {
    /// Fails every call.
    pub fn new() -> Self {
        Self::succeeding_first(0)
    }

    pub fn succeeding_first(successes: usize) -> Self {
        Self {
            successes,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MetadataGenerator for FailingGenerator {
    async fn generate(&self, dir: &Path, revision: u64) -> RepoResult<()> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.successes {
            return IndexGenerator.generate(dir, revision).await;
        }
        Err(RepoError::Generator(format!(
            "simulated failure at revision {revision}"
        )))
    }

    fn name(&self) -> &str {
        "failing"
    }
}
