//! # paperpress
//!
//! Resumable per-paper processing: figure extraction, LLM summaries, and
//! assembled Markdown artifacts for a research-paper site.
//!
//! ## Why this crate?
//!
//! Turning a bare paper reference into a published page involves expensive,
//! failure-prone steps (an LLM call, network fetches) and one genuinely
//! fiddly text problem: the generated summary cites figures in two
//! inconsistent notations, repeats itself, and sometimes cites figures that
//! were never extracted. This crate makes the whole transformation
//! resumable — a paper can fail at any stage and retry from exactly there —
//! and guarantees every cited figure lands in the final document at most
//! once.
//!
//! ## Pipeline Overview
//!
//! ```text
//! paper record
//!  │
//!  ├─ 1. figures   scan the source, fetch images, write through the store
//!  ├─ 2. summary   one multimodal LLM call (retry/backoff, never re-run
//!  │               unless forced — this is the expensive stage)
//!  ├─ 3. markdown  resolve figure references, assemble the artifact
//!  └─ 4. info      publish the paper's row to the site index
//! ```
//!
//! Each stage commits a durable [`state::StageStatus`] only after its output
//! is persisted; completed stages are skipped on re-runs, and forcing an
//! earlier stage invalidates the later ones that consumed its output.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use paperpress::{Pipeline, PipelineConfig, StageSelection};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Provider auto-detected from OPENAI_API_KEY / ANTHROPIC_API_KEY / …
//!     let config = PipelineConfig::builder().data_dir("./data").build()?;
//!     let pipeline = Pipeline::new(config)?;
//!
//!     let outcome = pipeline.process("2402.01234", &StageSelection::All).await?;
//!     println!("{}: {:?}", outcome.paper_id, outcome.state);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `paperpress` binary (clap + anyhow + tracing-subscriber) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! paperpress = { version = "0.4", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod error;
pub mod output;
pub mod paper;
pub mod pipeline;
pub mod process;
pub mod progress;
pub mod prompts;
pub mod records;
pub mod state;
pub mod store;
pub mod stream;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{PipelineConfig, PipelineConfigBuilder};
pub use error::{FailureKind, PaperPressError, StageError};
pub use output::{Artifact, ContentBlock, PaperOutcome, PipelineStats, StageOutcome};
pub use paper::{FigureRecord, PaperRecord};
pub use process::Pipeline;
pub use progress::{NoopProgressCallback, PipelineProgressCallback, ProgressCallback};
pub use state::{PaperState, Stage, StageSelection, StageStatus};
pub use stream::process_stream;
