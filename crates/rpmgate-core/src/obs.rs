//! Structured lifecycle events.
//!
//! - `RequestSpan` RAII guard tagging everything inside a request
//! - one `emit_*` function per event kind, so field names stay consistent
//!   across crates and can be queried in JSON logs (`event = "..."`)

use tracing::{info, warn};

/// RAII guard that enters a request-scoped span.
///
/// ```ignore
/// let _span = RequestSpan::enter("req-42");
/// // everything logged here carries request_id = "req-42"
/// ```
pub struct RequestSpan {
    _span: tracing::span::EnteredSpan,
}

impl RequestSpan {
    pub fn enter(request_id: &str) -> Self {
        Self {
            _span: request_span(request_id).entered(),
        }
    }
}

/// Span for work that crosses task boundaries, attached with
/// `tracing::Instrument` where an entered guard cannot be held.
pub fn request_span(request_id: &str) -> tracing::Span {
    tracing::info_span!("rpmgate.request", request_id = %request_id)
}

/// A VM session changed state.
pub fn emit_session_state(session: &str, from: &str, to: &str) {
    info!(event = "session.state", session = %session, from = from, to = to);
}

/// A per-architecture branch changed state.
pub fn emit_branch_transition(request_id: &str, arch: &str, from: &str, to: &str) {
    info!(
        event = "branch.transition",
        request_id = %request_id,
        arch = %arch,
        from = from,
        to = to,
    );
}

/// A branch is being retried after an infrastructure failure.
pub fn emit_branch_retry(request_id: &str, arch: &str, attempt: u32, error: &dyn std::fmt::Display) {
    warn!(
        event = "branch.retry",
        request_id = %request_id,
        arch = %arch,
        attempt = attempt,
        error = %error,
    );
}

/// A repository transaction was recorded.
pub fn emit_commit(repo: &str, arch: &str, transaction_id: u64, generation: u64, outcome: &str) {
    info!(
        event = "repo.commit",
        repo = %repo,
        arch = %arch,
        transaction_id = transaction_id,
        generation = generation,
        outcome = outcome,
    );
}

/// An artifact entered the annex.
pub fn emit_annex_stored(digest: &str, artifact: &str, deduplicated: bool) {
    info!(
        event = "annex.stored",
        digest = %digest,
        artifact = %artifact,
        deduplicated = deduplicated,
    );
}

/// A request finished.
pub fn emit_request_finished(request_id: &str, succeeded: usize, failed: usize, duration_ms: u64) {
    info!(
        event = "request.finished",
        request_id = %request_id,
        succeeded = succeeded,
        failed = failed,
        duration_ms = duration_ms,
    );
}
