//! Progress-callback trait for per-paper, per-stage pipeline events.
//!
//! Inject an [`Arc<dyn PipelineProgressCallback>`] via
//! [`crate::config::PipelineConfigBuilder::progress_callback`] to receive
//! real-time events as papers move through the stages.
//!
//! # Why callbacks instead of channels?
//!
//! The callback approach is the least-invasive integration point: callers
//! can forward events to a progress bar, a WebSocket, or a database record
//! without the library knowing how the host application communicates. The
//! trait is `Send + Sync` because papers are processed concurrently.

use std::sync::Arc;

use crate::state::Stage;

/// Called by the pipeline as papers move through their stages.
///
/// All methods have default no-op implementations so callers only override
/// what they care about. When several papers run concurrently, per-paper
/// methods may be called from different tasks at once — implementations
/// must protect shared mutable state.
pub trait PipelineProgressCallback: Send + Sync {
    /// Called once before any paper is processed.
    fn on_run_start(&self, total_papers: usize) {
        let _ = total_papers;
    }

    /// Called just before a stage starts executing (not when skipped).
    fn on_stage_start(&self, paper_id: &str, stage: Stage) {
        let _ = (paper_id, stage);
    }

    /// Called when a stage commits.
    fn on_stage_complete(&self, paper_id: &str, stage: Stage) {
        let _ = (paper_id, stage);
    }

    /// Called when a stage is skipped because it is already completed.
    fn on_stage_skipped(&self, paper_id: &str, stage: Stage) {
        let _ = (paper_id, stage);
    }

    /// Called when a paper's run aborts at a failed stage.
    fn on_paper_error(&self, paper_id: &str, stage: Stage, error: &str) {
        let _ = (paper_id, stage, error);
    }

    /// Called when one paper's run finishes, successfully or not.
    fn on_paper_complete(&self, paper_id: &str, failed: bool) {
        let _ = (paper_id, failed);
    }

    /// Called once after every paper has been attempted.
    fn on_run_complete(&self, total_papers: usize, failed_papers: usize) {
        let _ = (total_papers, failed_papers);
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl PipelineProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::PipelineConfig`].
pub type ProgressCallback = Arc<dyn PipelineProgressCallback>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct TrackingCallback {
        stages: AtomicUsize,
        errors: AtomicUsize,
    }

    impl PipelineProgressCallback for TrackingCallback {
        fn on_stage_complete(&self, _paper_id: &str, _stage: Stage) {
            self.stages.fetch_add(1, Ordering::SeqCst);
        }

        fn on_paper_error(&self, _paper_id: &str, _stage: Stage, _error: &str) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn noop_callback_does_not_panic() {
        let cb = NoopProgressCallback;
        cb.on_run_start(2);
        cb.on_stage_start("p1", Stage::Figures);
        cb.on_stage_complete("p1", Stage::Figures);
        cb.on_stage_skipped("p1", Stage::Summary);
        cb.on_paper_error("p1", Stage::Summary, "boom");
        cb.on_paper_complete("p1", true);
        cb.on_run_complete(2, 1);
    }

    #[test]
    fn tracking_callback_receives_events() {
        let tracker = TrackingCallback {
            stages: AtomicUsize::new(0),
            errors: AtomicUsize::new(0),
        };
        tracker.on_stage_complete("p1", Stage::Figures);
        tracker.on_stage_complete("p1", Stage::Summary);
        tracker.on_paper_error("p2", Stage::Figures, "unreachable");
        assert_eq!(tracker.stages.load(Ordering::SeqCst), 2);
        assert_eq!(tracker.errors.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn arc_dyn_callback_works() {
        let cb: Arc<dyn PipelineProgressCallback> = Arc::new(NoopProgressCallback);
        cb.on_run_start(10);
        cb.on_paper_complete("p1", false);
    }
}
