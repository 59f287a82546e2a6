//! Error types for the paperpress library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`PaperPressError`] — **Fatal**: the pipeline cannot run at all
//!   (bad configuration, unknown paper id, state store unreadable).
//!   Returned as `Err(PaperPressError)` from the top-level `process*`
//!   functions.
//!
//! * [`StageError`] — **Non-fatal for the paper record**: one stage of one
//!   paper's pipeline failed. It is recorded into that stage's
//!   `last_error`, the stage stays `completed = false`, and the remaining
//!   stages for that paper are aborted. The next `process` call retries
//!   from the failed stage without redoing completed upstream work.
//!
//! The separation lets callers decide their own tolerance: abort a batch on
//! the first failed paper, or collect every [`StageError`] for a post-run
//! report while the rest of the batch keeps going.

use std::path::PathBuf;
use thiserror::Error;

use crate::state::Stage;

/// All fatal errors returned by the paperpress library.
///
/// Stage-level failures use [`StageError`] and are persisted on the stage
/// status rather than propagated here.
#[derive(Debug, Error)]
pub enum PaperPressError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// No record exists for the requested paper id.
    #[error("Unknown paper id '{paper_id}'\nImport it first or check the id.")]
    UnknownPaper { paper_id: String },

    /// The stage selection string could not be parsed.
    #[error("Invalid stage selection '{input}': expected 'all' or a comma list of figures, summary, markdown, info")]
    InvalidStageSelection { input: String },

    // ── Persistence errors ────────────────────────────────────────────────
    /// The per-paper state document could not be read or written.
    #[error("Failed to access stage state for '{paper_id}' at '{path}': {source}")]
    StateStore {
        paper_id: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A paper record could not be read or written.
    #[error("Failed to access record for '{paper_id}': {detail}")]
    RecordStore { paper_id: String, detail: String },

    /// A persisted document exists but does not deserialize.
    #[error("Corrupt persisted document at '{path}': {detail}")]
    CorruptDocument { path: PathBuf, detail: String },

    // ── LLM errors ────────────────────────────────────────────────────────
    /// The configured provider is not initialised (missing API key etc.).
    #[error("LLM provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Whether a stage failure is worth retrying within the same run.
///
/// Transient failures (timeouts, 429, 5xx) are retried with bounded backoff
/// inside the stage. Permanent failures (malformed source, 4xx) abort the
/// stage immediately; retrying the same request cannot help.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum FailureKind {
    Transient,
    Permanent,
}

/// A failure of one stage of one paper's pipeline.
///
/// Persisted (as its display form) into `StageStatus::last_error` and
/// surfaced in [`crate::output::PaperOutcome`]. The stage remains
/// `completed = false`, so the next scheduled run retries it.
#[derive(Debug, Clone, Error, serde::Serialize, serde::Deserialize)]
pub enum StageError {
    /// The paper's source document could not be fetched or read.
    #[error("{stage} stage: failed to read source '{source_ref}': {detail}")]
    SourceUnavailable {
        stage: Stage,
        source_ref: String,
        detail: String,
        kind: FailureKind,
    },

    /// A figure image could not be durably persisted.
    ///
    /// Fails the whole figures stage: no partial figure set is ever marked
    /// complete, and a retry re-extracts everything (extraction is cheap).
    #[error("figures stage: failed to store figure '{figure_id}': {detail}")]
    FigureWrite {
        figure_id: String,
        detail: String,
        kind: FailureKind,
    },

    /// The summarizer call failed after all retries.
    #[error("summary stage: LLM call failed after {retries} retries: {detail}")]
    SummarizerFailed {
        retries: u32,
        detail: String,
        kind: FailureKind,
    },

    /// A stage was requested but its upstream dependency has not completed.
    #[error("{stage} stage: upstream {missing} stage has not completed")]
    MissingUpstream { stage: Stage, missing: Stage },

    /// The stage output could not be written.
    #[error("{stage} stage: failed to persist output: {detail}")]
    OutputWrite {
        stage: Stage,
        detail: String,
        kind: FailureKind,
    },
}

impl StageError {
    /// The stage this error occurred in.
    pub fn stage(&self) -> Stage {
        match self {
            StageError::SourceUnavailable { stage, .. } => *stage,
            StageError::FigureWrite { .. } => Stage::Figures,
            StageError::SummarizerFailed { .. } => Stage::Summary,
            StageError::MissingUpstream { stage, .. } => *stage,
            StageError::OutputWrite { stage, .. } => *stage,
        }
    }

    /// Transient/permanent classification for retry decisions.
    pub fn kind(&self) -> FailureKind {
        match self {
            StageError::SourceUnavailable { kind, .. }
            | StageError::FigureWrite { kind, .. }
            | StageError::SummarizerFailed { kind, .. }
            | StageError::OutputWrite { kind, .. } => *kind,
            StageError::MissingUpstream { .. } => FailureKind::Permanent,
        }
    }
}

/// Classify an opaque upstream error message.
///
/// The provider layer surfaces errors as strings, so classification has to
/// sniff for the markers the APIs actually emit. Unrecognised errors count
/// as transient: a wasted retry is cheaper than a paper stuck on a blip.
pub fn classify_message(msg: &str) -> FailureKind {
    let m = msg.to_ascii_lowercase();
    let permanent = [
        "400",
        "401",
        "403",
        "404",
        "invalid api key",
        "unauthorized",
        "malformed",
    ];
    if permanent.iter().any(|p| m.contains(p)) {
        FailureKind::Permanent
    } else {
        FailureKind::Transient
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summarizer_failed_display() {
        let e = StageError::SummarizerFailed {
            retries: 3,
            detail: "HTTP 503".into(),
            kind: FailureKind::Transient,
        };
        let msg = e.to_string();
        assert!(msg.contains("after 3 retries"), "got: {msg}");
        assert!(msg.contains("503"));
    }

    #[test]
    fn missing_upstream_is_permanent() {
        let e = StageError::MissingUpstream {
            stage: Stage::Markdown,
            missing: Stage::Summary,
        };
        assert_eq!(e.kind(), FailureKind::Permanent);
        assert_eq!(e.stage(), Stage::Markdown);
    }

    #[test]
    fn figure_write_maps_to_figures_stage() {
        let e = StageError::FigureWrite {
            figure_id: "3".into(),
            detail: "disk full".into(),
            kind: FailureKind::Transient,
        };
        assert_eq!(e.stage(), Stage::Figures);
    }

    #[test]
    fn classify_rate_limit_as_transient() {
        assert_eq!(
            classify_message("HTTP 429 too many requests"),
            FailureKind::Transient
        );
        assert_eq!(classify_message("connection timed out"), FailureKind::Transient);
    }

    #[test]
    fn classify_auth_as_permanent() {
        assert_eq!(classify_message("HTTP 401 Unauthorized"), FailureKind::Permanent);
        assert_eq!(classify_message("invalid API key"), FailureKind::Permanent);
    }
}
