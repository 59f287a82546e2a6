//! Markdown assembly: prose plus resolved placements, each figure exactly
//! once.
//!
//! The assembler is a pure function of (prose, placements, figure URLs).
//! The "already inserted" tracking is an explicit set created per
//! invocation and threaded through the emit helpers — never module state —
//! so repeated runs and inconsistent upstream positions cannot leak
//! insertions across documents. Refusing to re-emit an id that is already
//! in the set is the last line of defense against duplicate figures, even
//! if the resolver hands over placements that disagree about positions.

use std::collections::{HashMap, HashSet};
use std::ops::Range;

use tracing::warn;

use crate::output::{Artifact, ContentBlock, GroupImage};
use crate::paper::PaperRecord;
use crate::pipeline::resolve::{Placement, PlacementKind, ResolvedReferences};

/// Assemble the final artifact.
///
/// Walks the prose in original order and splices each placement's block in
/// immediately after the paragraph containing its first reference. `urls`
/// maps normalized figure ids to public URLs (from the figure store).
pub fn assemble(
    paper: &PaperRecord,
    resolved: &ResolvedReferences,
    urls: &HashMap<String, String>,
    include_front_matter: bool,
) -> Artifact {
    let mut blocks: Vec<ContentBlock> = Vec::new();
    let mut emitted: HashSet<String> = HashSet::new();

    if include_front_matter {
        blocks.push(ContentBlock::Prose(front_matter(paper)));
    }

    let paragraphs = split_paragraphs(&resolved.prose);

    // Assign each placement to the paragraph containing its anchor.
    let mut per_paragraph: Vec<Vec<&Placement>> = vec![Vec::new(); paragraphs.len()];
    for placement in &resolved.placements {
        let idx = paragraphs
            .iter()
            .position(|(range, _)| placement.anchor < range.end)
            .unwrap_or(paragraphs.len().saturating_sub(1));
        if let Some(slot) = per_paragraph.get_mut(idx) {
            slot.push(placement);
        }
    }

    for (idx, (_, text)) in paragraphs.iter().enumerate() {
        let trimmed = text.trim();
        if !trimmed.is_empty() {
            blocks.push(ContentBlock::Prose(trimmed.to_string()));
        }
        for placement in &per_paragraph[idx] {
            emit(&mut blocks, &mut emitted, placement, urls);
        }
    }

    Artifact { blocks }
}

/// Emit one placement, honoring the no-duplicate-insertion invariant.
fn emit(
    blocks: &mut Vec<ContentBlock>,
    emitted: &mut HashSet<String>,
    placement: &Placement,
    urls: &HashMap<String, String>,
) {
    match &placement.kind {
        PlacementKind::Figure(record) => {
            if !emitted.insert(record.figure_id.clone()) {
                warn!("Refusing duplicate insertion of figure {}", record.figure_id);
                return;
            }
            match urls.get(&record.figure_id) {
                Some(url) => blocks.push(ContentBlock::Figure {
                    figure_id: record.figure_id.clone(),
                    url: url.clone(),
                    caption: record.caption.clone(),
                }),
                None => {
                    // An extracted figure with no resolvable URL cannot be
                    // rendered as an image; degrade the same way as a
                    // missing extraction.
                    warn!("No URL for figure {}", record.figure_id);
                    blocks.push(ContentBlock::BrokenReference {
                        figure_id: record.figure_id.clone(),
                    });
                }
            }
        }
        PlacementKind::Group { base, members } => {
            let fresh: Vec<GroupImage> = members
                .iter()
                .filter(|m| !emitted.contains(&m.figure_id))
                .map(|m| GroupImage {
                    figure_id: m.figure_id.clone(),
                    sub: m.sub.clone(),
                    url: m
                        .record
                        .as_ref()
                        .and_then(|r| urls.get(&r.figure_id))
                        .cloned(),
                    caption: m.record.as_ref().and_then(|r| r.caption.clone()),
                })
                .collect();
            if fresh.is_empty() {
                warn!("Refusing duplicate insertion of figure group {}", base);
                return;
            }
            for member in &fresh {
                emitted.insert(member.figure_id.clone());
            }
            blocks.push(ContentBlock::FigureGroup {
                base: base.clone(),
                members: fresh,
            });
        }
        PlacementKind::Broken { figure_id } => {
            if !emitted.insert(figure_id.clone()) {
                return;
            }
            blocks.push(ContentBlock::BrokenReference {
                figure_id: figure_id.clone(),
            });
        }
    }
}

/// Split text into paragraphs on blank lines, keeping byte ranges.
fn split_paragraphs(text: &str) -> Vec<(Range<usize>, &str)> {
    let mut out = Vec::new();
    let mut start = 0;
    while let Some(pos) = text[start..].find("\n\n") {
        let end = start + pos;
        out.push((start..end, &text[start..end]));
        let mut next = end;
        while next < text.len() && text.as_bytes()[next] == b'\n' {
            next += 1;
        }
        start = next;
    }
    if start < text.len() || out.is_empty() {
        out.push((start..text.len(), &text[start..]));
    }
    out
}

/// YAML front matter from the paper's metadata.
fn front_matter(paper: &PaperRecord) -> String {
    let mut yaml = String::from("---\n");
    yaml.push_str(&format!("title: \"{}\"\n", paper.title.replace('"', "\\\"")));
    if !paper.authors.is_empty() {
        yaml.push_str("authors:\n");
        for author in &paper.authors {
            yaml.push_str(&format!("  - \"{}\"\n", author.replace('"', "\\\"")));
        }
    }
    yaml.push_str(&format!("source: \"{}\"\n", paper.source_url));
    yaml.push_str(&format!("paper_id: \"{}\"\n", paper.id));
    yaml.push_str("---");
    yaml
}
