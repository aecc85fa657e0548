//! Structured lifecycle events for training runs.
//!
//! - `RunSpan` RAII guard tags everything logged during a run with its id
//! - `emit_*` functions log stage, candidate and promotion milestones

use tracing::{info, warn};

/// RAII guard that enters a run-scoped tracing span.
///
/// ```ignore
/// let _span = RunSpan::enter("run-12345");
/// // every event below carries run_id = "run-12345"
/// ```
pub struct RunSpan {
    _span: tracing::span::EnteredSpan,
}

impl RunSpan {
    pub fn enter(run_id: &str) -> Self {
        Self {
            _span: run_span(run_id).entered(),
        }
    }
}

/// The run-scoped span, for instrumenting futures that cross await points.
pub fn run_span(run_id: &str) -> tracing::Span {
    tracing::info_span!("tuneflow.run", run_id = %run_id)
}

pub fn emit_stage_started(stage: &str) {
    info!(event = "stage.started", stage = %stage);
}

/// Stage reached a terminal state.
pub fn emit_stage_finished(stage: &str, duration_ms: u64, success: bool) {
    info!(
        event = "stage.finished",
        stage = %stage,
        duration_ms = duration_ms,
        success = success,
    );
}

/// Stage was not submitted because a predecessor failed.
pub fn emit_stage_skipped(stage: &str, failed_predecessor: &str) {
    warn!(
        event = "stage.skipped",
        stage = %stage,
        failed_predecessor = %failed_predecessor,
    );
}

pub fn emit_candidate_scored(candidate: &str, overall_score: f64, error_rate: f64) {
    info!(
        event = "candidate.scored",
        candidate = %candidate,
        overall_score = overall_score,
        error_rate = error_rate,
    );
}

pub fn emit_candidate_skipped(candidate: &str, reason: &dyn std::fmt::Display) {
    warn!(event = "candidate.skipped", candidate = %candidate, reason = %reason);
}

/// Winner selected. `renamed` is false when the alias already existed.
pub fn emit_promotion(winner: &str, score: f64, renamed: bool) {
    info!(
        event = "candidate.promoted",
        winner = %winner,
        score = score,
        renamed = renamed,
    );
}

/// Best-effort volume deletion failed; the run status is unaffected.
pub fn emit_volume_cleanup_failed(volume: &str, error: &dyn std::fmt::Display) {
    warn!(event = "volume.cleanup_failed", volume = %volume, error = %error);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_span_create() {
        let _span = RunSpan::enter("test-run-id");
        emit_stage_started("sdg");
        emit_stage_finished("sdg", 12, true);
    }
}
