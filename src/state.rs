//! Per-paper stage state: the small finite-state machine that makes the
//! pipeline resumable.
//!
//! ## Why a state machine instead of ad hoc flags?
//!
//! Each paper carries one [`StageStatus`] per stage. Modelling "reprocess
//! from stage X" as a transition over the whole status set — rather than a
//! pile of independent booleans — gives a single well-defined answer to
//! "what runs next, what gets invalidated" and makes the completion
//! invariant auditable in one place: a stage is `completed` only after its
//! output has been durably persisted, and `completed = false` always means
//! "not yet produced", never "partially produced".
//!
//! ## Persistence
//!
//! [`StageStore`] keeps one JSON document per paper under
//! `{data_dir}/state/{paper_id}.json`, written atomically (temp + rename).
//! The upsert is keyed by `(paper_id, stage)`, so workers processing
//! *different* papers never contend. Two workers racing on the *same*
//! paper are serialized by [`PaperLocks`]; cross-process exclusion is a
//! single-writer deployment assumption.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::PaperPressError;

/// One named step of the per-paper pipeline, in dependency order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Figures,
    Summary,
    Markdown,
    Info,
}

impl Stage {
    /// All stages in dependency order.
    pub const ALL: [Stage; 4] = [Stage::Figures, Stage::Summary, Stage::Markdown, Stage::Info];

    /// Stages strictly after this one, i.e. everything that consumes its output.
    pub fn downstream(self) -> impl Iterator<Item = Stage> {
        Stage::ALL.into_iter().filter(move |s| *s > self)
    }

    /// The stage whose output this one consumes directly, if any.
    pub fn upstream(self) -> Option<Stage> {
        match self {
            Stage::Figures => None,
            Stage::Summary => Some(Stage::Figures),
            Stage::Markdown => Some(Stage::Summary),
            Stage::Info => Some(Stage::Markdown),
        }
    }

    pub fn parse(s: &str) -> Option<Stage> {
        match s.trim().to_ascii_lowercase().as_str() {
            "figures" => Some(Stage::Figures),
            "summary" => Some(Stage::Summary),
            "markdown" => Some(Stage::Markdown),
            "info" => Some(Stage::Info),
            _ => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Figures => "figures",
            Stage::Summary => "summary",
            Stage::Markdown => "markdown",
            Stage::Info => "info",
        };
        f.pad(s)
    }
}

/// Which stages a `process` call should run.
///
/// `All` runs whatever is not yet completed (never forces — repeating it is
/// a no-op once everything is done). `Only` *forces* the named stages and
/// invalidates every later stage that consumed their output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageSelection {
    All,
    Only(Vec<Stage>),
}

impl StageSelection {
    /// Parse `"all"` or a comma list like `"figures,summary"`.
    pub fn parse(s: &str) -> Result<Self, PaperPressError> {
        let trimmed = s.trim();
        if trimmed.eq_ignore_ascii_case("all") {
            return Ok(StageSelection::All);
        }
        let mut stages = Vec::new();
        for part in trimmed.split(',') {
            let stage = Stage::parse(part).ok_or_else(|| PaperPressError::InvalidStageSelection {
                input: s.to_string(),
            })?;
            if !stages.contains(&stage) {
                stages.push(stage);
            }
        }
        if stages.is_empty() {
            return Err(PaperPressError::InvalidStageSelection {
                input: s.to_string(),
            });
        }
        stages.sort();
        Ok(StageSelection::Only(stages))
    }

    /// Whether `stage` should run given its current completion flag.
    pub fn should_run(&self, stage: Stage, completed: bool) -> bool {
        match self {
            StageSelection::All => !completed,
            StageSelection::Only(stages) => stages.contains(&stage),
        }
    }

    /// The stages this selection forces to rerun regardless of completion.
    pub fn forced(&self) -> &[Stage] {
        match self {
            StageSelection::All => &[],
            StageSelection::Only(stages) => stages,
        }
    }
}

/// Completion record for one `(paper_id, stage)` pair.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageStatus {
    pub completed: bool,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl StageStatus {
    pub fn completed_at(at: DateTime<Utc>) -> Self {
        Self {
            completed: true,
            completed_at: Some(at),
            last_error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            completed: false,
            completed_at: None,
            last_error: Some(error.into()),
        }
    }
}

/// The full stage-status set for one paper.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PaperStages {
    #[serde(default)]
    stages: HashMap<Stage, StageStatus>,
}

impl PaperStages {
    pub fn status(&self, stage: Stage) -> StageStatus {
        self.stages.get(&stage).cloned().unwrap_or_default()
    }

    pub fn is_completed(&self, stage: Stage) -> bool {
        self.stages.get(&stage).map(|s| s.completed).unwrap_or(false)
    }

    /// Upsert one stage's status (created lazily on first attempt).
    pub fn set(&mut self, stage: Stage, status: StageStatus) {
        self.stages.insert(stage, status);
    }

    /// Invalidate `stage`: back to "not yet produced".
    pub fn invalidate(&mut self, stage: Stage) {
        self.stages.insert(stage, StageStatus::default());
    }

    /// Derive the state-machine position from the completion flags.
    ///
    /// A recorded `last_error` on the earliest incomplete stage reads as
    /// `Failed` — terminal for the run that recorded it, retried by the
    /// next one.
    pub fn state(&self) -> PaperState {
        for stage in Stage::ALL {
            let status = self.status(stage);
            if !status.completed {
                if status.last_error.is_some() {
                    return PaperState::Failed(stage);
                }
                return match stage.upstream() {
                    None => PaperState::Pending,
                    Some(Stage::Figures) => PaperState::FiguresDone,
                    Some(Stage::Summary) => PaperState::SummaryDone,
                    Some(Stage::Markdown) => PaperState::MarkdownDone,
                    Some(Stage::Info) => unreachable!("info has no downstream stage"),
                };
            }
        }
        PaperState::InfoDone
    }
}

/// Where a paper sits in the pipeline.
///
/// Transitions strictly follow stage order. `Failed` is terminal for the
/// run that produced it, not permanent: failed stages are never marked
/// complete, so the next `process` call retries from there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaperState {
    Pending,
    FiguresDone,
    SummaryDone,
    MarkdownDone,
    InfoDone,
    Failed(Stage),
}

impl PaperState {
    /// Fully published: every stage has committed.
    pub fn is_done(self) -> bool {
        self == PaperState::InfoDone
    }

    pub fn is_failed(self) -> bool {
        matches!(self, PaperState::Failed(_))
    }
}

// ── Persistence ──────────────────────────────────────────────────────────

/// JSON-document-per-paper stage-state store.
#[derive(Debug, Clone)]
pub struct StageStore {
    dir: PathBuf,
}

impl StageStore {
    /// Open (creating the directory if needed) under `{data_dir}/state`.
    pub fn open(data_dir: &Path) -> Result<Self, PaperPressError> {
        let dir = data_dir.join("state");
        std::fs::create_dir_all(&dir).map_err(|e| PaperPressError::StateStore {
            paper_id: String::new(),
            path: dir.clone(),
            source: e,
        })?;
        Ok(Self { dir })
    }

    fn path_for(&self, paper_id: &str) -> PathBuf {
        self.dir.join(format!("{paper_id}.json"))
    }

    /// Load a paper's stage set; a missing document is an empty set.
    pub fn load(&self, paper_id: &str) -> Result<PaperStages, PaperPressError> {
        let path = self.path_for(paper_id);
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(PaperStages::default())
            }
            Err(e) => {
                return Err(PaperPressError::StateStore {
                    paper_id: paper_id.to_string(),
                    path,
                    source: e,
                })
            }
        };
        serde_json::from_str(&raw).map_err(|e| PaperPressError::CorruptDocument {
            path,
            detail: e.to_string(),
        })
    }

    /// Persist a paper's stage set atomically (temp file + rename).
    pub fn save(&self, paper_id: &str, stages: &PaperStages) -> Result<(), PaperPressError> {
        let path = self.path_for(paper_id);
        let json = serde_json::to_string_pretty(stages)
            .map_err(|e| PaperPressError::Internal(format!("serialize stage state: {e}")))?;
        let tmp = path.with_extension("json.tmp");
        let io_err = |e| PaperPressError::StateStore {
            paper_id: paper_id.to_string(),
            path: path.clone(),
            source: e,
        };
        std::fs::write(&tmp, json).map_err(io_err)?;
        std::fs::rename(&tmp, &path).map_err(io_err)?;
        debug!("Persisted stage state for {}", paper_id);
        Ok(())
    }

    /// Upsert one `(paper_id, stage)` status.
    pub fn upsert(
        &self,
        paper_id: &str,
        stage: Stage,
        status: StageStatus,
    ) -> Result<PaperStages, PaperPressError> {
        let mut stages = self.load(paper_id)?;
        stages.set(stage, status);
        self.save(paper_id, &stages)?;
        Ok(stages)
    }
}

// ── Per-paper locking ────────────────────────────────────────────────────

/// In-process advisory locks, one per paper id.
///
/// A manual reprocess overlapping a scheduled run must not interleave stage
/// writes for the same paper. Workers on different papers take different
/// locks and never contend.
#[derive(Default)]
pub struct PaperLocks {
    locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl PaperLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// The lock guarding `paper_id`, created lazily.
    pub fn for_paper(&self, paper_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().expect("paper lock map poisoned");
        Arc::clone(
            locks
                .entry(paper_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn stage_order_and_downstream() {
        assert!(Stage::Figures < Stage::Summary);
        let after_summary: Vec<Stage> = Stage::Summary.downstream().collect();
        assert_eq!(after_summary, vec![Stage::Markdown, Stage::Info]);
        assert_eq!(Stage::Figures.upstream(), None);
        assert_eq!(Stage::Info.upstream(), Some(Stage::Markdown));
    }

    #[test]
    fn selection_parse() {
        assert_eq!(StageSelection::parse("all").unwrap(), StageSelection::All);
        assert_eq!(
            StageSelection::parse("summary, markdown").unwrap(),
            StageSelection::Only(vec![Stage::Summary, Stage::Markdown])
        );
        assert!(StageSelection::parse("summry").is_err());
        assert!(StageSelection::parse("").is_err());
    }

    #[test]
    fn all_selection_skips_completed() {
        let sel = StageSelection::All;
        assert!(sel.should_run(Stage::Figures, false));
        assert!(!sel.should_run(Stage::Figures, true));
        assert!(sel.forced().is_empty());
    }

    #[test]
    fn only_selection_forces() {
        let sel = StageSelection::Only(vec![Stage::Summary]);
        assert!(sel.should_run(Stage::Summary, true));
        assert!(!sel.should_run(Stage::Figures, false));
        assert_eq!(sel.forced(), &[Stage::Summary]);
    }

    #[test]
    fn state_derivation() {
        let mut stages = PaperStages::default();
        assert_eq!(stages.state(), PaperState::Pending);

        stages.set(Stage::Figures, StageStatus::completed_at(Utc::now()));
        assert_eq!(stages.state(), PaperState::FiguresDone);

        stages.set(Stage::Summary, StageStatus::failed("HTTP 503"));
        assert_eq!(stages.state(), PaperState::Failed(Stage::Summary));
        assert!(stages.state().is_failed());

        stages.set(Stage::Summary, StageStatus::completed_at(Utc::now()));
        stages.set(Stage::Markdown, StageStatus::completed_at(Utc::now()));
        stages.set(Stage::Info, StageStatus::completed_at(Utc::now()));
        assert_eq!(stages.state(), PaperState::InfoDone);
        assert!(stages.state().is_done());
    }

    #[test]
    fn invalidate_resets_to_not_produced() {
        let mut stages = PaperStages::default();
        stages.set(Stage::Markdown, StageStatus::completed_at(Utc::now()));
        stages.invalidate(Stage::Markdown);
        let status = stages.status(Stage::Markdown);
        assert!(!status.completed);
        assert!(status.completed_at.is_none());
        assert!(status.last_error.is_none());
    }

    #[test]
    fn store_round_trip_and_upsert() {
        let dir = TempDir::new().unwrap();
        let store = StageStore::open(dir.path()).unwrap();

        // Missing document reads as the empty set.
        let empty = store.load("p1").unwrap();
        assert_eq!(empty.state(), PaperState::Pending);

        store
            .upsert("p1", Stage::Figures, StageStatus::completed_at(Utc::now()))
            .unwrap();
        let loaded = store.load("p1").unwrap();
        assert!(loaded.is_completed(Stage::Figures));
        assert_eq!(loaded.state(), PaperState::FiguresDone);

        // Upsert on another paper does not touch p1.
        store
            .upsert("p2", Stage::Figures, StageStatus::failed("boom"))
            .unwrap();
        assert!(store.load("p1").unwrap().is_completed(Stage::Figures));
        assert_eq!(store.load("p2").unwrap().state(), PaperState::Failed(Stage::Figures));
    }

    #[tokio::test]
    async fn paper_locks_serialize_same_paper() {
        let locks = PaperLocks::new();
        let a = locks.for_paper("p1");
        let b = locks.for_paper("p1");
        let _held = a.lock().await;
        assert!(b.try_lock().is_err(), "same paper must contend");

        let other = locks.for_paper("p2");
        assert!(other.try_lock().is_ok(), "different papers must not contend");
    }
}
