//! Streaming batch API: emit paper outcomes as they complete.
//!
//! ## Why stream?
//!
//! Large batches take minutes (one LLM call per un-summarized paper). A
//! stream-based API lets callers update dashboards, write logs, or abort
//! early instead of waiting for the whole batch. Unlike the eager
//! [`crate::process::Pipeline::process_many`], [`process_stream`] yields
//! each [`PaperOutcome`] as its paper finishes. Outcomes arrive in
//! completion order, not input order — match them up by the paired id.

use std::pin::Pin;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tokio_stream::Stream;
use tracing::info;

use crate::error::PaperPressError;
use crate::output::PaperOutcome;
use crate::process::Pipeline;
use crate::state::StageSelection;

/// A boxed stream of per-paper results.
pub type OutcomeStream<'a> =
    Pin<Box<dyn Stream<Item = (String, Result<PaperOutcome, PaperPressError>)> + Send + 'a>>;

/// Process papers concurrently, yielding each outcome as it completes.
///
/// Concurrency is bounded by the pipeline's configured limit, same as the
/// eager API.
pub fn process_stream<'a>(
    pipeline: &'a Pipeline,
    paper_ids: Vec<String>,
    selection: StageSelection,
) -> OutcomeStream<'a> {
    info!("Streaming run over {} papers", paper_ids.len());
    let selection = Arc::new(selection);
    let concurrency = pipeline.concurrency();

    let s = stream::iter(paper_ids.into_iter().map(move |id| {
        let selection = Arc::clone(&selection);
        async move {
            let outcome = pipeline.process(&id, &selection).await;
            (id, outcome)
        }
    }))
    .buffer_unordered(concurrency);

    Box::pin(s)
}
