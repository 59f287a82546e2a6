//! Summary generation: the single external LLM call, with retry.
//!
//! This is the most expensive, highest-variance operation in the pipeline —
//! externally rate-limited and non-deterministic — which is exactly why the
//! orchestrator treats the stage as non-idempotent and never re-invokes it
//! unless `summary` is explicitly forced.
//!
//! ## Retry Strategy
//!
//! HTTP 429 / 503 errors from LLM APIs are transient and frequent under
//! concurrent load. Exponential backoff (`retry_backoff_ms * 2^attempt`)
//! avoids thundering-herd: with 500 ms base and 3 retries the wait sequence
//! is 500 ms → 1 s → 2 s, under 4 s of back-off per paper. Permanent
//! failures (4xx, malformed input) are not retried — the stage fails
//! immediately and records `last_error`.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, ImageData, LLMProvider};
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::time::{sleep, Duration};
use tracing::{debug, warn};

use crate::error::{classify_message, FailureKind, StageError};
use crate::paper::{FigureRecord, PaperRecord};
use crate::prompts::{summary_request, DEFAULT_SYSTEM_PROMPT};

/// Raw generated text plus call accounting.
#[derive(Debug, Clone)]
pub struct SummaryResponse {
    pub text: String,
    pub input_tokens: usize,
    pub output_tokens: usize,
    pub retries: u32,
    pub duration_ms: u64,
}

/// The black box: paper metadata + figure captions + figure images in,
/// raw generated text out.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(
        &self,
        paper: &PaperRecord,
        figures: &[FigureRecord],
        images: Vec<ImageData>,
    ) -> Result<SummaryResponse, StageError>;
}

/// Production summarizer over an edgequake-llm provider.
pub struct LlmSummarizer {
    provider: Arc<dyn LLMProvider>,
    system_prompt: Option<String>,
    temperature: f32,
    max_tokens: usize,
    max_retries: u32,
    retry_backoff_ms: u64,
}

impl LlmSummarizer {
    pub fn new(
        provider: Arc<dyn LLMProvider>,
        system_prompt: Option<String>,
        temperature: f32,
        max_tokens: usize,
        max_retries: u32,
        retry_backoff_ms: u64,
    ) -> Self {
        Self {
            provider,
            system_prompt,
            temperature,
            max_tokens,
            max_retries,
            retry_backoff_ms,
        }
    }
}

#[async_trait]
impl Summarizer for LlmSummarizer {
    async fn summarize(
        &self,
        paper: &PaperRecord,
        figures: &[FigureRecord],
        images: Vec<ImageData>,
    ) -> Result<SummaryResponse, StageError> {
        let start = Instant::now();
        let system_prompt = self
            .system_prompt
            .as_deref()
            .unwrap_or(DEFAULT_SYSTEM_PROMPT);

        let messages = vec![
            ChatMessage::system(system_prompt),
            ChatMessage::user_with_images(summary_request(paper, figures), images),
        ];

        let options = CompletionOptions {
            temperature: Some(self.temperature),
            max_tokens: Some(self.max_tokens),
            ..Default::default()
        };

        let mut last_err: Option<String> = None;
        let mut last_kind = FailureKind::Transient;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let backoff = self.retry_backoff_ms * 2u64.pow(attempt - 1);
                warn!(
                    "Paper {}: summary retry {}/{} after {}ms",
                    paper.id, attempt, self.max_retries, backoff
                );
                sleep(Duration::from_millis(backoff)).await;
            }

            match self.provider.chat(&messages, Some(&options)).await {
                Ok(response) => {
                    let duration = start.elapsed();
                    debug!(
                        "Paper {}: {} input tokens, {} output tokens, {:?}",
                        paper.id, response.prompt_tokens, response.completion_tokens, duration
                    );
                    return Ok(SummaryResponse {
                        text: response.content,
                        input_tokens: response.prompt_tokens as usize,
                        output_tokens: response.completion_tokens as usize,
                        retries: attempt,
                        duration_ms: duration.as_millis() as u64,
                    });
                }
                Err(e) => {
                    let msg = format!("{e}");
                    let kind = classify_message(&msg);
                    warn!(
                        "Paper {}: summary attempt {} failed — {}",
                        paper.id,
                        attempt + 1,
                        msg
                    );
                    last_err = Some(msg);
                    last_kind = kind;
                    if kind == FailureKind::Permanent {
                        break;
                    }
                }
            }
        }

        Err(StageError::SummarizerFailed {
            retries: self.max_retries,
            detail: last_err.unwrap_or_else(|| "Unknown error".to_string()),
            kind: last_kind,
        })
    }
}

// ── Deterministic cleanup of the generated text ──────────────────────────

static RE_OUTER_FENCES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```(?:markdown)?\n(.*)\n```\s*$").unwrap());

static RE_BLANK_LINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());

/// Clean raw generated text before reference resolution.
///
/// Cheap, deterministic passes that fix model quirks without touching
/// content — and in particular without touching figure references:
///
/// 1. Strip outer markdown fences (models sometimes disobey the prompt)
/// 2. Normalise line endings (CRLF → LF)
/// 3. Trim trailing whitespace per line
/// 4. Collapse 2+ consecutive blank lines down to 1 (paragraph splits
///    downstream rely on a single blank line)
/// 5. Strip invisible Unicode (zero-width spaces, BOM, soft hyphens)
pub fn clean_summary(input: &str) -> String {
    let s = strip_outer_fences(input);
    let s = s.replace("\r\n", "\n").replace('\r', "\n");
    let s = s
        .lines()
        .map(|line| line.trim_end())
        .collect::<Vec<_>>()
        .join("\n");
    let s = RE_BLANK_LINES.replace_all(&s, "\n\n").to_string();
    let s = s.replace(
        [
            '\u{200B}', '\u{FEFF}', '\u{00AD}', '\u{200C}', '\u{200D}', '\u{2060}',
        ],
        "",
    );
    s.trim().to_string()
}

fn strip_outer_fences(input: &str) -> String {
    if let Some(caps) = RE_OUTER_FENCES.captures(input.trim()) {
        caps[1].to_string()
    } else {
        input.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_fences_and_crlf() {
        let input = "```markdown\nFirst para.\r\n\r\nSecond para.\n```";
        assert_eq!(clean_summary(input), "First para.\n\nSecond para.");
    }

    #[test]
    fn collapses_blank_runs_to_one_blank_line() {
        assert_eq!(clean_summary("a\n\n\n\nb"), "a\n\nb");
    }

    #[test]
    fn preserves_figure_references() {
        let input = "See <FIGURE_ID>3.a</FIGURE_ID> and Figure 4.   \n\nMore.";
        let cleaned = clean_summary(input);
        assert!(cleaned.contains("<FIGURE_ID>3.a</FIGURE_ID>"));
        assert!(cleaned.contains("Figure 4."));
        assert!(!cleaned.contains("4.   "));
    }

    #[test]
    fn strips_invisible_chars() {
        assert_eq!(clean_summary("a\u{200B}b\u{FEFF}c"), "abc");
    }

    #[test]
    fn passthrough_without_fences() {
        assert_eq!(clean_summary("Plain text."), "Plain text.");
    }
}
