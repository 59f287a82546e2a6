//! Integration tests for the per-paper pipeline.
//!
//! These tests run hermetically: a stub extractor and stub summarizer stand
//! in for the network and the LLM, and every store lives in a `tempfile`
//! directory. What they exercise is the orchestration itself — skip/force/
//! invalidate semantics, write-before-commit, failure isolation — plus the
//! end-to-end artifact shape.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use tempfile::TempDir;

use paperpress::error::{FailureKind, StageError};
use paperpress::pipeline::extract::{ExtractedFigure, FigureExtractor};
use paperpress::pipeline::summarize::{Summarizer, SummaryResponse};
use paperpress::records::{JsonRecordStore, RecordStore};
use paperpress::state::{PaperStages, StageStore};
use paperpress::store::{FigureStore, LocalFigureStore, StoreError};
use paperpress::{
    FigureRecord, PaperPressError, PaperRecord, PaperState, Pipeline, PipelineConfig, Stage,
    StageOutcome, StageSelection,
};
use edgequake_llm::ImageData;

// ── Test doubles ─────────────────────────────────────────────────────────────

/// Extractor returning a fixed figure set, counting invocations.
struct StubExtractor {
    figure_ids: Vec<&'static str>,
    calls: AtomicUsize,
}

impl StubExtractor {
    fn new(figure_ids: Vec<&'static str>) -> Arc<Self> {
        Arc::new(Self {
            figure_ids,
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl FigureExtractor for StubExtractor {
    async fn extract(&self, _paper: &PaperRecord) -> Result<Vec<ExtractedFigure>, StageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .figure_ids
            .iter()
            .map(|id| ExtractedFigure {
                figure_id: id.to_string(),
                bytes: format!("png-bytes-{id}").into_bytes(),
                caption: Some(format!("caption {id}")),
            })
            .collect())
    }
}

/// Summarizer returning fixed text, optionally failing its first call.
struct StubSummarizer {
    text: String,
    calls: AtomicUsize,
    fail_next: AtomicBool,
}

impl StubSummarizer {
    fn new(text: &str) -> Arc<Self> {
        Arc::new(Self {
            text: text.to_string(),
            calls: AtomicUsize::new(0),
            fail_next: AtomicBool::new(false),
        })
    }

    fn failing_once(text: &str) -> Arc<Self> {
        let s = Self::new(text);
        s.fail_next.store(true, Ordering::SeqCst);
        s
    }
}

#[async_trait]
impl Summarizer for StubSummarizer {
    async fn summarize(
        &self,
        _paper: &PaperRecord,
        _figures: &[FigureRecord],
        _images: Vec<ImageData>,
    ) -> Result<SummaryResponse, StageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(StageError::SummarizerFailed {
                retries: 0,
                detail: "HTTP 503 (stubbed outage)".into(),
                kind: FailureKind::Transient,
            });
        }
        Ok(SummaryResponse {
            text: self.text.clone(),
            input_tokens: 120,
            output_tokens: 80,
            retries: 0,
            duration_ms: 1,
        })
    }
}

/// Store wrapper counting writes, to verify idempotence.
struct CountingStore {
    inner: LocalFigureStore,
    puts: AtomicUsize,
}

#[async_trait]
impl FigureStore for CountingStore {
    async fn put(
        &self,
        paper_id: &str,
        figure_id: &str,
        bytes: &[u8],
    ) -> Result<String, StoreError> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.inner.put(paper_id, figure_id, bytes).await
    }

    async fn get(&self, paper_id: &str, figure_id: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.inner.get(paper_id, figure_id).await
    }

    fn url(&self, paper_id: &str, figure_id: &str) -> String {
        self.inner.url(paper_id, figure_id)
    }
}

// ── Harness ──────────────────────────────────────────────────────────────────

struct Harness {
    pipeline: Pipeline,
    extractor: Arc<StubExtractor>,
    summarizer: Arc<StubSummarizer>,
    store_puts: Arc<CountingStore>,
    // Keeps the data directory alive for the test's duration.
    dir: TempDir,
}

impl Harness {
    fn stage_flags(&self, paper_id: &str) -> PaperStages {
        StageStore::open(self.dir.path())
            .unwrap()
            .load(paper_id)
            .unwrap()
    }

    fn artifact(&self, paper_id: &str) -> String {
        std::fs::read_to_string(self.dir.path().join(format!("site/{paper_id}.md"))).unwrap()
    }
}

fn harness(figure_ids: Vec<&'static str>, summarizer: Arc<StubSummarizer>) -> Harness {
    let dir = TempDir::new().unwrap();
    let config = PipelineConfig::builder()
        .data_dir(dir.path())
        .public_base_url("https://papers.example.org")
        .include_front_matter(false)
        .concurrency(2)
        .build()
        .unwrap();

    let record_store = Arc::new(JsonRecordStore::open(dir.path()).unwrap());
    let store = Arc::new(CountingStore {
        inner: LocalFigureStore::new(dir.path(), "https://papers.example.org"),
        puts: AtomicUsize::new(0),
    });
    let extractor = StubExtractor::new(figure_ids);

    let pipeline = Pipeline::with_components(
        config,
        record_store,
        Arc::clone(&store) as Arc<dyn FigureStore>,
        Arc::clone(&extractor) as Arc<dyn FigureExtractor>,
        Arc::clone(&summarizer) as Arc<dyn Summarizer>,
    )
    .unwrap();

    Harness {
        pipeline,
        extractor,
        summarizer,
        store_puts: store,
        dir,
    }
}

async fn register(h: &Harness, paper_id: &str) {
    let mut paper = PaperRecord::new(
        paper_id,
        "Attention Is All You Need",
        "https://example.org/paper.html",
        Utc::now(),
    );
    paper.authors = vec!["A. Vaswani".into()];
    paper.abstract_text = "We propose a new architecture.".into();
    assert!(h.pipeline.register(paper).await.unwrap());
}

// ── Full-run tests ───────────────────────────────────────────────────────────

#[tokio::test]
async fn full_run_completes_every_stage() {
    let h = harness(
        vec!["1", "2"],
        StubSummarizer::new("Summary citing <FIGURE_ID>1</FIGURE_ID> and Figure 2."),
    );
    register(&h, "p1").await;

    let outcome = h.pipeline.process("p1", &StageSelection::All).await.unwrap();

    assert_eq!(outcome.state, PaperState::InfoDone);
    assert_eq!(outcome.stats.stages_run, 4);
    assert_eq!(outcome.stats.figures_extracted, 2);
    assert!(outcome
        .stages
        .iter()
        .all(|(_, o)| matches!(o, StageOutcome::Completed)));

    // Artifact published with both figures placed once.
    let md = h.artifact("p1");
    assert!(md.contains("![Figure 1](https://papers.example.org/figures/p1/1.png)"));
    assert!(md.contains("![Figure 2]"));
    assert!(!md.contains("FIGURE_ID"));

    // Site index carries the paper's row.
    let index = std::fs::read_to_string(h.dir.path().join("site/index.json")).unwrap();
    assert!(index.contains("\"p1\""));
    assert!(index.contains("site/p1.md"));
}

#[tokio::test]
async fn unknown_paper_is_fatal() {
    let h = harness(vec![], StubSummarizer::new("text"));
    let err = h
        .pipeline
        .process("nope", &StageSelection::All)
        .await
        .unwrap_err();
    assert!(matches!(err, PaperPressError::UnknownPaper { .. }));
}

// ── Idempotence ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn second_full_run_is_a_no_op() {
    let h = harness(vec!["1"], StubSummarizer::new("See Figure 1."));
    register(&h, "p1").await;

    h.pipeline.process("p1", &StageSelection::All).await.unwrap();
    let summarizer_calls = h.summarizer.calls.load(Ordering::SeqCst);
    let store_puts = h.store_puts.puts.load(Ordering::SeqCst);

    let outcome = h.pipeline.process("p1", &StageSelection::All).await.unwrap();

    // Zero new LLM calls, zero new figure writes, all four stages skipped.
    assert_eq!(h.summarizer.calls.load(Ordering::SeqCst), summarizer_calls);
    assert_eq!(h.store_puts.puts.load(Ordering::SeqCst), store_puts);
    assert_eq!(h.extractor.calls.load(Ordering::SeqCst), 1);
    assert_eq!(outcome.stats.stages_run, 0);
    assert_eq!(outcome.stats.stages_skipped, 4);
    assert_eq!(outcome.state, PaperState::InfoDone);
}

// ── Forcing & invalidation ───────────────────────────────────────────────────

#[tokio::test]
async fn forcing_summary_invalidates_downstream_only() {
    let h = harness(vec!["1"], StubSummarizer::new("See Figure 1."));
    register(&h, "p1").await;
    h.pipeline.process("p1", &StageSelection::All).await.unwrap();

    let outcome = h
        .pipeline
        .process("p1", &StageSelection::Only(vec![Stage::Summary]))
        .await
        .unwrap();

    // Summary re-ran; figures untouched; markdown/info invalidated but not run.
    assert_eq!(h.summarizer.calls.load(Ordering::SeqCst), 2);
    assert_eq!(h.extractor.calls.load(Ordering::SeqCst), 1);
    assert_eq!(outcome.state, PaperState::SummaryDone);

    let flags = h.stage_flags("p1");
    assert!(flags.is_completed(Stage::Figures));
    assert!(flags.is_completed(Stage::Summary));
    assert!(!flags.is_completed(Stage::Markdown));
    assert!(!flags.is_completed(Stage::Info));

    // A follow-up 'all' run rebuilds markdown/info without another LLM call.
    let outcome = h.pipeline.process("p1", &StageSelection::All).await.unwrap();
    assert_eq!(outcome.state, PaperState::InfoDone);
    assert_eq!(h.summarizer.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn forcing_figures_reruns_extraction_and_invalidates_all() {
    let h = harness(vec!["1"], StubSummarizer::new("See Figure 1."));
    register(&h, "p1").await;
    h.pipeline.process("p1", &StageSelection::All).await.unwrap();

    h.pipeline
        .process("p1", &StageSelection::Only(vec![Stage::Figures]))
        .await
        .unwrap();

    assert_eq!(h.extractor.calls.load(Ordering::SeqCst), 2);
    let flags = h.stage_flags("p1");
    assert!(flags.is_completed(Stage::Figures));
    assert!(!flags.is_completed(Stage::Summary));
    assert!(!flags.is_completed(Stage::Markdown));
}

// ── Failure semantics ────────────────────────────────────────────────────────

#[tokio::test]
async fn summarizer_failure_aborts_run_and_retries_cheaply() {
    let h = harness(
        vec!["1"],
        StubSummarizer::failing_once("See Figure 1."),
    );
    register(&h, "p1").await;

    let outcome = h.pipeline.process("p1", &StageSelection::All).await.unwrap();

    // Failed at summary; figures committed and stay valid.
    assert_eq!(outcome.state, PaperState::Failed(Stage::Summary));
    let failure = outcome.failure().expect("a stage failed");
    assert_eq!(failure.stage(), Stage::Summary);
    let flags = h.stage_flags("p1");
    assert!(flags.is_completed(Stage::Figures));
    assert!(!flags.is_completed(Stage::Summary));
    assert!(flags.status(Stage::Summary).last_error.is_some());

    // The run aborted at summary: markdown and info were never considered.
    assert!(outcome
        .stages
        .iter()
        .all(|(stage, _)| *stage == Stage::Figures || *stage == Stage::Summary));

    // The next scheduled run retries from the failed stage only.
    let outcome = h.pipeline.process("p1", &StageSelection::All).await.unwrap();
    assert_eq!(outcome.state, PaperState::InfoDone);
    assert_eq!(h.extractor.calls.load(Ordering::SeqCst), 1, "figures not re-run");
    assert_eq!(h.summarizer.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn stage_with_missing_upstream_fails_cleanly() {
    let h = harness(vec!["1"], StubSummarizer::new("See Figure 1."));
    register(&h, "p1").await;

    let outcome = h
        .pipeline
        .process("p1", &StageSelection::Only(vec![Stage::Markdown]))
        .await
        .unwrap();

    assert_eq!(outcome.state, PaperState::Failed(Stage::Markdown));
    assert!(matches!(
        outcome.failure(),
        Some(StageError::MissingUpstream {
            stage: Stage::Markdown,
            missing: Stage::Summary,
        })
    ));
    // The expensive stage was never attempted.
    assert_eq!(h.summarizer.calls.load(Ordering::SeqCst), 0);
}

// ── Reference handling end-to-end ────────────────────────────────────────────

#[tokio::test]
async fn duplicate_and_broken_references_in_final_artifact() {
    let h = harness(
        vec!["1", "2"],
        StubSummarizer::new(
            "...as shown in <FIGURE_ID>1</FIGURE_ID> and later Figure 1 again, plus Figure 5.",
        ),
    );
    register(&h, "p1").await;
    h.pipeline.process("p1", &StageSelection::All).await.unwrap();

    let md = h.artifact("p1");
    assert_eq!(md.matches("![Figure 1]").count(), 1, "figure 1 inserted once");
    assert!(md.contains("Figure 1 and later Figure 1 again"), "markup stripped");
    assert!(md.contains("Figure 5 is referenced"), "broken marker present");
    assert!(!md.contains("![Figure 5]"));
    assert!(!md.contains("![Figure 2]"), "figure 2 never referenced");
}

#[tokio::test]
async fn sub_figure_group_rendered_once_in_order() {
    let h = harness(
        vec!["7_a", "7_b", "7_c"],
        StubSummarizer::new("Figure 7.c first, then Figure 7.a, then Figure 7.b."),
    );
    register(&h, "p1").await;
    h.pipeline.process("p1", &StageSelection::All).await.unwrap();

    let md = h.artifact("p1");
    assert!(md.contains("**Figure 7**"));
    let a = md.find("![Figure 7.a]").expect("7.a present");
    let b = md.find("![Figure 7.b]").expect("7.b present");
    let c = md.find("![Figure 7.c]").expect("7.c present");
    assert!(a < b && b < c, "group ordered a, b, c regardless of text order");
    assert_eq!(md.matches("**Figure 7**").count(), 1);
}

// ── Batch APIs ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn process_many_handles_mixed_outcomes() {
    let h = harness(vec!["1"], StubSummarizer::new("See Figure 1."));
    register(&h, "p1").await;
    register(&h, "p2").await;

    let ids = vec!["p1".to_string(), "p2".to_string(), "ghost".to_string()];
    let results = h.pipeline.process_many(&ids, &StageSelection::All).await;

    assert_eq!(results.len(), 3);
    let by_id: HashMap<&str, &Result<_, _>> =
        results.iter().map(|(id, r)| (id.as_str(), r)).collect();
    assert_eq!(by_id["p1"].as_ref().unwrap().state, PaperState::InfoDone);
    assert_eq!(by_id["p2"].as_ref().unwrap().state, PaperState::InfoDone);
    assert!(by_id["ghost"].is_err());
}

#[tokio::test]
async fn pending_papers_excludes_published() {
    let h = harness(vec!["1"], StubSummarizer::new("See Figure 1."));
    register(&h, "p1").await;
    register(&h, "p2").await;

    h.pipeline.process("p1", &StageSelection::All).await.unwrap();

    assert_eq!(h.pipeline.pending_papers().await.unwrap(), vec!["p2"]);
}

#[tokio::test]
async fn stream_yields_every_outcome() {
    let h = harness(vec!["1"], StubSummarizer::new("See Figure 1."));
    register(&h, "p1").await;
    register(&h, "p2").await;

    let mut stream = paperpress::process_stream(
        &h.pipeline,
        vec!["p1".to_string(), "p2".to_string()],
        StageSelection::All,
    );

    let mut done = Vec::new();
    while let Some((id, result)) = stream.next().await {
        assert_eq!(result.unwrap().state, PaperState::InfoDone);
        done.push(id);
    }
    done.sort();
    assert_eq!(done, vec!["p1", "p2"]);
}
