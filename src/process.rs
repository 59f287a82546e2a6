//! The per-paper pipeline orchestrator.
//!
//! Drives a paper through figures → summary → markdown → info, persisting
//! a [`StageStatus`] after each stage. The ordering discipline is
//! write-before-commit: a stage's output is durably persisted (figure
//! store, record store, artifact file) *before* the stage is marked
//! completed, so `completed = false` always means the output does not
//! exist and can be produced from scratch.
//!
//! Completed stages are skipped unless explicitly forced, which is what
//! makes repeated runs cheap: `process(id, All)` on a finished paper
//! performs zero summarizer calls and zero figure-store writes. Forcing an
//! earlier stage invalidates the later stages that consumed its output —
//! they must not silently reuse state derived from inputs that changed.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::error::{FailureKind, PaperPressError, StageError};
use crate::output::{ContentBlock, PaperOutcome, PipelineStats, StageOutcome};
use crate::paper::{FigureRecord, PaperRecord};
use crate::pipeline::{assemble, encode, extract, resolve, summarize};
use crate::records::{JsonRecordStore, RecordStore, SiteIndexEntry};
use crate::state::{PaperLocks, PaperState, Stage, StageSelection, StageStatus, StageStore};
use crate::store::{FigureStore, LocalFigureStore, RemoteFigureStore, TieredFigureStore};

/// The pipeline: configuration plus the capability seams it drives.
pub struct Pipeline {
    config: PipelineConfig,
    stage_store: StageStore,
    record_store: Arc<dyn RecordStore>,
    figure_store: Arc<dyn FigureStore>,
    extractor: Arc<dyn extract::FigureExtractor>,
    summarizer: Arc<dyn summarize::Summarizer>,
    locks: PaperLocks,
    site_dir: PathBuf,
}

impl Pipeline {
    /// Wire up the production pipeline from configuration alone.
    ///
    /// Resolves the LLM provider eagerly so a misconfigured environment
    /// fails at startup, not on the first paper.
    pub fn new(config: PipelineConfig) -> Result<Self, PaperPressError> {
        let provider = config.resolve_provider()?;
        let summarizer = Arc::new(summarize::LlmSummarizer::new(
            provider,
            config.system_prompt.clone(),
            config.temperature,
            config.max_tokens,
            config.max_retries,
            config.retry_backoff_ms,
        ));
        let extractor =
            Arc::new(extract::HtmlFigureExtractor::new(config.download_timeout_secs).map_err(
                |e| PaperPressError::Internal(format!("extractor init: {e}")),
            )?);

        let local = LocalFigureStore::new(&config.data_dir, &config.public_base_url);
        let figure_store: Arc<dyn FigureStore> = match &config.remote_store_endpoint {
            Some(endpoint) => {
                let remote = RemoteFigureStore::new(
                    endpoint.clone(),
                    config.public_base_url.clone(),
                    config.download_timeout_secs,
                )
                .map_err(|e| PaperPressError::Internal(format!("remote store init: {e}")))?;
                Arc::new(TieredFigureStore::new(Some(Box::new(remote)), local))
            }
            None => Arc::new(TieredFigureStore::local_only(local)),
        };

        let record_store = Arc::new(JsonRecordStore::open(&config.data_dir)?);

        Self::with_components(config, record_store, figure_store, extractor, summarizer)
    }

    /// Wire up a pipeline with explicit components (tests, embedding hosts).
    pub fn with_components(
        config: PipelineConfig,
        record_store: Arc<dyn RecordStore>,
        figure_store: Arc<dyn FigureStore>,
        extractor: Arc<dyn extract::FigureExtractor>,
        summarizer: Arc<dyn summarize::Summarizer>,
    ) -> Result<Self, PaperPressError> {
        let stage_store = StageStore::open(&config.data_dir)?;
        let site_dir = config.data_dir.join("site");
        std::fs::create_dir_all(&site_dir).map_err(|e| {
            PaperPressError::Internal(format!("create {}: {e}", site_dir.display()))
        })?;
        Ok(Self {
            config,
            stage_store,
            record_store,
            figure_store,
            extractor,
            summarizer,
            locks: PaperLocks::new(),
            site_dir,
        })
    }

    /// The configured per-run concurrency bound.
    pub fn concurrency(&self) -> usize {
        self.config.concurrency
    }

    /// Register a newly discovered paper. Returns `false` (and leaves the
    /// existing record untouched) when the id is already known — records
    /// are immutable once fetched, except for pipeline-owned fields.
    pub async fn register(&self, paper: PaperRecord) -> Result<bool, PaperPressError> {
        if self.record_store.get(&paper.id).await?.is_some() {
            debug!("Paper {} already registered", paper.id);
            return Ok(false);
        }
        self.record_store.upsert(&paper).await?;
        info!("Registered paper {}", paper.id);
        Ok(true)
    }

    /// The paper record plus its stage-state set, for inspection.
    pub async fn inspect(
        &self,
        paper_id: &str,
    ) -> Result<(PaperRecord, crate::state::PaperStages), PaperPressError> {
        let paper = self
            .record_store
            .get(paper_id)
            .await?
            .ok_or_else(|| PaperPressError::UnknownPaper {
                paper_id: paper_id.to_string(),
            })?;
        let stages = self.stage_store.load(paper_id)?;
        Ok((paper, stages))
    }

    /// Ids of papers that have not reached `InfoDone`.
    pub async fn pending_papers(&self) -> Result<Vec<String>, PaperPressError> {
        let mut pending = Vec::new();
        for id in self.record_store.list_ids().await? {
            if !self.stage_store.load(&id)?.state().is_done() {
                pending.push(id);
            }
        }
        Ok(pending)
    }

    /// Run the selected stages for one paper.
    ///
    /// Holds the paper's advisory lock for the whole run, so a manual
    /// reprocess overlapping a scheduled run serializes instead of
    /// interleaving stage writes.
    pub async fn process(
        &self,
        paper_id: &str,
        selection: &StageSelection,
    ) -> Result<PaperOutcome, PaperPressError> {
        let lock = self.locks.for_paper(paper_id);
        let _guard = lock.lock().await;

        let total_start = Instant::now();
        let mut paper = self
            .record_store
            .get(paper_id)
            .await?
            .ok_or_else(|| PaperPressError::UnknownPaper {
                paper_id: paper_id.to_string(),
            })?;

        let mut stages_state = self.stage_store.load(paper_id)?;

        // Forcing an earlier stage invalidates everything downstream of it:
        // those stages consumed output that is about to change.
        if let Some(earliest) = selection.forced().iter().min() {
            let mut invalidated = false;
            for later in earliest.downstream() {
                if stages_state.is_completed(later) {
                    debug!("Paper {}: invalidating {} (upstream {} forced)", paper_id, later, earliest);
                    stages_state.invalidate(later);
                    invalidated = true;
                }
            }
            if invalidated {
                self.stage_store.save(paper_id, &stages_state)?;
            }
        }

        let cb = self.config.progress_callback.clone();
        let mut stage_outcomes: Vec<(Stage, StageOutcome)> = Vec::new();
        let mut stats = PipelineStats::default();

        for stage in Stage::ALL {
            let completed = stages_state.is_completed(stage);
            if !selection.should_run(stage, completed) {
                if completed && matches!(selection, StageSelection::All) {
                    stats.stages_skipped += 1;
                    stage_outcomes.push((stage, StageOutcome::Skipped));
                    if let Some(cb) = &cb {
                        cb.on_stage_skipped(paper_id, stage);
                    }
                }
                continue;
            }

            // A stage must never run against missing upstream output.
            if let Some(upstream) = stage.upstream() {
                if !stages_state.is_completed(upstream) {
                    let err = StageError::MissingUpstream {
                        stage,
                        missing: upstream,
                    };
                    stages_state =
                        self.stage_store
                            .upsert(paper_id, stage, StageStatus::failed(err.to_string()))?;
                    warn!("Paper {}: {}", paper_id, err);
                    if let Some(cb) = &cb {
                        cb.on_paper_error(paper_id, stage, &err.to_string());
                    }
                    stage_outcomes.push((stage, StageOutcome::Failed(err)));
                    break;
                }
            }

            if let Some(cb) = &cb {
                cb.on_stage_start(paper_id, stage);
            }
            info!("Paper {}: running {} stage", paper_id, stage);

            match self.run_stage(stage, &mut paper, &mut stats).await {
                Ok(()) => {
                    stages_state = self.stage_store.upsert(
                        paper_id,
                        stage,
                        StageStatus::completed_at(Utc::now()),
                    )?;
                    stats.stages_run += 1;
                    stage_outcomes.push((stage, StageOutcome::Completed));
                    if let Some(cb) = &cb {
                        cb.on_stage_complete(paper_id, stage);
                    }
                }
                Err(err) => {
                    // Record the failure, leave completed = false, abort the
                    // remaining stages for this paper.
                    stages_state =
                        self.stage_store
                            .upsert(paper_id, stage, StageStatus::failed(err.to_string()))?;
                    warn!("Paper {}: {} stage failed: {}", paper_id, stage, err);
                    if let Some(cb) = &cb {
                        cb.on_paper_error(paper_id, stage, &err.to_string());
                    }
                    stage_outcomes.push((stage, StageOutcome::Failed(err)));
                    break;
                }
            }
        }

        stats.total_duration_ms = total_start.elapsed().as_millis() as u64;

        // The run's terminal state: a failure ends the run at its stage even
        // when an earlier (unrequested) stage is also incomplete.
        let failed_stage = stage_outcomes.iter().find_map(|(stage, outcome)| {
            matches!(outcome, StageOutcome::Failed(_)).then_some(*stage)
        });
        let state = match failed_stage {
            Some(stage) => PaperState::Failed(stage),
            None => stages_state.state(),
        };
        if let Some(cb) = &cb {
            cb.on_paper_complete(paper_id, state.is_failed());
        }

        Ok(PaperOutcome {
            paper_id: paper_id.to_string(),
            state,
            stages: stage_outcomes,
            stats,
        })
    }

    /// Process many papers concurrently.
    ///
    /// Papers are embarrassingly parallel; `concurrency` bounds how many
    /// are in flight, which in practice bounds pressure on the LLM API.
    pub async fn process_many(
        &self,
        paper_ids: &[String],
        selection: &StageSelection,
    ) -> Vec<(String, Result<PaperOutcome, PaperPressError>)> {
        if let Some(cb) = &self.config.progress_callback {
            cb.on_run_start(paper_ids.len());
        }

        let results: Vec<(String, Result<PaperOutcome, PaperPressError>)> =
            stream::iter(paper_ids.iter().cloned())
                .map(|id| async move {
                    let outcome = self.process(&id, selection).await;
                    (id, outcome)
                })
                .buffer_unordered(self.config.concurrency)
                .collect()
                .await;

        if let Some(cb) = &self.config.progress_callback {
            let failed = results
                .iter()
                .filter(|(_, r)| match r {
                    Ok(outcome) => outcome.state.is_failed(),
                    Err(_) => true,
                })
                .count();
            cb.on_run_complete(results.len(), failed);
        }

        results
    }

    // ── Stage bodies ─────────────────────────────────────────────────────

    async fn run_stage(
        &self,
        stage: Stage,
        paper: &mut PaperRecord,
        stats: &mut PipelineStats,
    ) -> Result<(), StageError> {
        match stage {
            Stage::Figures => self.run_figures(paper, stats).await,
            Stage::Summary => self.run_summary(paper, stats).await,
            Stage::Markdown => self.run_markdown(paper, stats).await,
            Stage::Info => self.run_info(paper).await,
        }
    }

    /// Figures stage: extract, then write every image through the store
    /// before committing. A single write failure fails the whole stage —
    /// a retry re-extracts everything rather than completing a partial set.
    async fn run_figures(
        &self,
        paper: &mut PaperRecord,
        stats: &mut PipelineStats,
    ) -> Result<(), StageError> {
        let start = Instant::now();
        let extracted = self.extractor.extract(paper).await?;

        let mut records = Vec::with_capacity(extracted.len());
        for figure in &extracted {
            self.figure_store
                .put(&paper.id, &figure.figure_id, &figure.bytes)
                .await
                .map_err(|e| StageError::FigureWrite {
                    figure_id: figure.figure_id.clone(),
                    detail: e.to_string(),
                    kind: FailureKind::Transient,
                })?;
            let mut record = FigureRecord::new(&paper.id, &figure.figure_id);
            record.caption = figure.caption.clone();
            records.push(record);
        }

        // Re-created wholesale: the previous set (if any) is replaced, never
        // merged.
        paper.figures = records;
        paper.updated_at = Some(Utc::now());
        self.record_store
            .upsert(paper)
            .await
            .map_err(|e| StageError::OutputWrite {
                stage: Stage::Figures,
                detail: e.to_string(),
                kind: FailureKind::Transient,
            })?;

        stats.figures_extracted = paper.figures.len();
        stats.extract_duration_ms = start.elapsed().as_millis() as u64;
        Ok(())
    }

    /// Summary stage: the single external LLM call. Figure images are read
    /// back from the store and attached; a figure whose bytes are missing
    /// on both tiers degrades to caption-only for the request.
    async fn run_summary(
        &self,
        paper: &mut PaperRecord,
        stats: &mut PipelineStats,
    ) -> Result<(), StageError> {
        let mut images = Vec::with_capacity(paper.figures.len());
        for record in &paper.figures {
            match self.figure_store.get(&paper.id, &record.figure_id).await {
                Ok(Some(bytes)) => images.push(encode::encode_figure(&bytes)),
                Ok(None) => {
                    warn!(
                        "Paper {}: figure {} missing on both tiers; summarizing from caption only",
                        paper.id, record.figure_id
                    );
                }
                Err(e) => {
                    warn!(
                        "Paper {}: figure {} unreadable ({}); summarizing from caption only",
                        paper.id, record.figure_id, e
                    );
                }
            }
        }

        let response = self
            .summarizer
            .summarize(paper, &paper.figures, images)
            .await?;

        paper.summary_raw = Some(summarize::clean_summary(&response.text));
        paper.updated_at = Some(Utc::now());
        self.record_store
            .upsert(paper)
            .await
            .map_err(|e| StageError::OutputWrite {
                stage: Stage::Summary,
                detail: e.to_string(),
                kind: FailureKind::Transient,
            })?;

        stats.summary_input_tokens = response.input_tokens as u64;
        stats.summary_output_tokens = response.output_tokens as u64;
        stats.summary_duration_ms = response.duration_ms;
        Ok(())
    }

    /// Markdown stage: resolve references, assemble, write the artifact
    /// atomically. Regenerated deterministically on every run — the
    /// artifact is disposable, never a source of truth.
    async fn run_markdown(
        &self,
        paper: &mut PaperRecord,
        stats: &mut PipelineStats,
    ) -> Result<(), StageError> {
        let summary = paper.summary_raw.clone().ok_or(StageError::MissingUpstream {
            stage: Stage::Markdown,
            missing: Stage::Summary,
        })?;

        let resolved = resolve::resolve(&summary, &paper.figures);
        let urls: HashMap<String, String> = paper
            .figures
            .iter()
            .map(|f| {
                (
                    f.figure_id.clone(),
                    self.figure_store.url(&paper.id, &f.figure_id),
                )
            })
            .collect();

        let artifact = assemble::assemble(
            paper,
            &resolved,
            &urls,
            self.config.include_front_matter,
        );
        stats.broken_references = artifact
            .blocks
            .iter()
            .filter(|b| matches!(b, ContentBlock::BrokenReference { .. }))
            .count();

        let relative = format!("site/{}.md", paper.id);
        let path = self.site_dir.join(format!("{}.md", paper.id));
        let write_err = |e: std::io::Error| StageError::OutputWrite {
            stage: Stage::Markdown,
            detail: e.to_string(),
            kind: FailureKind::Transient,
        };
        let tmp = path.with_extension("md.tmp");
        tokio::fs::write(&tmp, artifact.render())
            .await
            .map_err(write_err)?;
        tokio::fs::rename(&tmp, &path).await.map_err(write_err)?;

        paper.artifact_path = Some(relative);
        paper.updated_at = Some(Utc::now());
        self.record_store
            .upsert(paper)
            .await
            .map_err(|e| StageError::OutputWrite {
                stage: Stage::Markdown,
                detail: e.to_string(),
                kind: FailureKind::Transient,
            })?;
        Ok(())
    }

    /// Info stage: publish the paper's row to the site index.
    async fn run_info(&self, paper: &mut PaperRecord) -> Result<(), StageError> {
        let artifact_path = paper.artifact_path.clone().ok_or(StageError::MissingUpstream {
            stage: Stage::Info,
            missing: Stage::Markdown,
        })?;

        let entry = SiteIndexEntry {
            paper_id: paper.id.clone(),
            title: paper.title.clone(),
            authors: paper.authors.clone(),
            artifact_path,
            figure_count: paper.figures.len(),
            published_at: Utc::now(),
        };
        self.record_store
            .publish_index(entry)
            .await
            .map_err(|e| StageError::OutputWrite {
                stage: Stage::Info,
                detail: e.to_string(),
                kind: FailureKind::Transient,
            })
    }
}
