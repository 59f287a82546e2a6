//! Output types: the assembled artifact and per-paper run results.

use serde::{Deserialize, Serialize};

use crate::error::StageError;
use crate::state::{PaperState, Stage};

/// One block of the assembled document, in render order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContentBlock {
    /// A prose paragraph (reference markup already stripped).
    Prose(String),
    /// A single figure: image link plus caption line.
    Figure {
        figure_id: String,
        url: String,
        caption: Option<String>,
    },
    /// A sub-figure group rendered once, members in sub-index order.
    FigureGroup {
        base: String,
        members: Vec<GroupImage>,
    },
    /// A reference the extractor found no image for — visible, not fatal.
    BrokenReference { figure_id: String },
}

/// One image of a sub-figure group (or a note when its image is missing).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupImage {
    pub figure_id: String,
    pub sub: String,
    /// `None` renders as a missing-sub-figure note inside the group block.
    pub url: Option<String>,
    pub caption: Option<String>,
}

/// The assembled markdown document.
///
/// Invariant: the figure ids across all blocks contain no duplicates —
/// each id (or group) appears in exactly one block. Regenerated
/// deterministically on every markdown-stage run; never a source of truth.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Artifact {
    pub blocks: Vec<ContentBlock>,
}

impl Artifact {
    /// Every figure id placed in the document, group members included.
    pub fn figure_ids(&self) -> Vec<String> {
        let mut ids = Vec::new();
        for block in &self.blocks {
            match block {
                ContentBlock::Prose(_) => {}
                ContentBlock::Figure { figure_id, .. } => ids.push(figure_id.clone()),
                ContentBlock::FigureGroup { members, .. } => {
                    ids.extend(members.iter().map(|m| m.figure_id.clone()))
                }
                ContentBlock::BrokenReference { figure_id } => ids.push(figure_id.clone()),
            }
        }
        ids
    }

    /// Render to final markdown: blocks separated by blank lines, exactly
    /// one trailing newline.
    pub fn render(&self) -> String {
        let mut parts: Vec<String> = Vec::with_capacity(self.blocks.len());
        for block in &self.blocks {
            match block {
                ContentBlock::Prose(text) => parts.push(text.clone()),
                ContentBlock::Figure {
                    figure_id,
                    url,
                    caption,
                } => {
                    let label = format!("Figure {}", figure_id);
                    let mut s = format!("![{label}]({url})");
                    if let Some(caption) = caption {
                        s.push_str(&format!("\n\n*{label}: {caption}*"));
                    }
                    parts.push(s);
                }
                ContentBlock::FigureGroup { base, members } => {
                    let mut s = format!("**Figure {base}**\n");
                    for member in members {
                        let label = format!("Figure {}.{}", base, member.sub);
                        match &member.url {
                            Some(url) => s.push_str(&format!("\n![{label}]({url})")),
                            None => s.push_str(&format!(
                                "\n*{label} is referenced in the text, but no matching image was extracted.*"
                            )),
                        }
                    }
                    let captions: Vec<String> = members
                        .iter()
                        .filter_map(|m| {
                            m.caption
                                .as_ref()
                                .map(|c| format!("({}) {}", m.sub, c))
                        })
                        .collect();
                    if !captions.is_empty() {
                        s.push_str(&format!("\n\n*Figure {base}: {}*", captions.join("; ")));
                    }
                    parts.push(s);
                }
                ContentBlock::BrokenReference { figure_id } => {
                    parts.push(format!(
                        "> *Figure {} is referenced in the text, but no matching figure was extracted.*",
                        figure_id.replace('_', ".")
                    ));
                }
            }
        }
        let mut out = parts.join("\n\n");
        while out.ends_with('\n') {
            out.pop();
        }
        out.push('\n');
        out
    }
}

/// Result of running one stage within a `process` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StageOutcome {
    /// Already completed and not forced — no work performed.
    Skipped,
    Completed,
    Failed(StageError),
}

/// The result of one `process` call for one paper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaperOutcome {
    pub paper_id: String,
    /// Where the paper's state machine ended up after this run.
    pub state: PaperState,
    /// Per-stage outcomes in dependency order, only for stages the
    /// selection considered.
    pub stages: Vec<(Stage, StageOutcome)>,
    pub stats: PipelineStats,
}

impl PaperOutcome {
    /// The failure that aborted this run, if any.
    pub fn failure(&self) -> Option<&StageError> {
        self.stages.iter().find_map(|(_, outcome)| match outcome {
            StageOutcome::Failed(e) => Some(e),
            _ => None,
        })
    }
}

/// Run statistics, aggregated across the stages that actually ran.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineStats {
    pub stages_run: usize,
    pub stages_skipped: usize,
    pub figures_extracted: usize,
    pub broken_references: usize,
    pub summary_input_tokens: u64,
    pub summary_output_tokens: u64,
    pub extract_duration_ms: u64,
    pub summary_duration_ms: u64,
    pub total_duration_ms: u64,
}
