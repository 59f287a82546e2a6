//! System prompts for paper summarization.
//!
//! Centralising every prompt here serves two purposes:
//!
//! 1. **Single source of truth** — changing the summary behaviour (e.g.
//!    tightening the figure-citation rule) requires editing exactly one
//!    place.
//!
//! 2. **Testability** — unit tests can inspect prompts directly without a
//!    live model, making prompt regressions easy to catch.
//!
//! Callers can override the default via
//! [`crate::config::PipelineConfig::system_prompt`]; the constants here are
//! used only when no override is provided.

use crate::paper::{FigureRecord, PaperRecord};

/// Default system prompt for the summary stage.
///
/// The figure-citation rule asks for the tag notation, but the model
/// disobeys often enough that the resolver accepts the plain-text spelling
/// too — do not tighten this prompt and assume the tag form is exhaustive.
pub const DEFAULT_SYSTEM_PROMPT: &str = r#"You are an expert research communicator. Your task is to summarize an academic paper for a technical audience, using the paper's metadata and its extracted figures.

Follow these rules precisely:

1. CONTENT
   - Explain the problem, the approach, and the key results
   - Stay faithful to the abstract and figure captions; do not invent results
   - Write 3-6 paragraphs of flowing prose, no bullet lists

2. FIGURES
   - When a figure supports a claim, cite it inline as <FIGURE_ID>N</FIGURE_ID>
   - For sub-figures use <FIGURE_ID>N.s</FIGURE_ID>, e.g. <FIGURE_ID>3.a</FIGURE_ID>
   - Cite only figures that were provided; never invent figure numbers

3. OUTPUT FORMAT
   - Output ONLY the summary text
   - Do NOT wrap the output in ```markdown fences
   - Do NOT add headings, commentary, or a title line
   - Start directly with the first paragraph"#;

/// Build the user message for the summary call from paper metadata and
/// extracted figure captions.
pub fn summary_request(paper: &PaperRecord, figures: &[FigureRecord]) -> String {
    let mut msg = format!("Title: {}\n", paper.title);
    if !paper.authors.is_empty() {
        msg.push_str(&format!("Authors: {}\n", paper.authors.join(", ")));
    }
    msg.push_str(&format!("\nAbstract:\n{}\n", paper.abstract_text));

    if !figures.is_empty() {
        msg.push_str("\nExtracted figures (images attached in this order):\n");
        for figure in figures {
            let caption = figure.caption.as_deref().unwrap_or("(no caption)");
            msg.push_str(&format!(
                "- Figure {}: {}\n",
                figure.figure_id.replace('_', "."),
                caption
            ));
        }
    }

    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn request_lists_figures_with_dotted_ids() {
        let mut paper = PaperRecord::new("p1", "T", "https://example.org", Utc::now());
        paper.abstract_text = "An abstract.".into();
        let figures = vec![
            FigureRecord::new("p1", "1").with_caption("first"),
            FigureRecord::new("p1", "7_a"),
        ];
        let msg = summary_request(&paper, &figures);
        assert!(msg.contains("Title: T"));
        assert!(msg.contains("- Figure 1: first"));
        assert!(msg.contains("- Figure 7.a: (no caption)"));
    }

    #[test]
    fn request_omits_figures_section_when_empty() {
        let paper = PaperRecord::new("p1", "T", "https://example.org", Utc::now());
        let msg = summary_request(&paper, &[]);
        assert!(!msg.contains("Extracted figures"));
    }
}
