//! Figure-reference resolution: from raw generated text to a typed,
//! deduplicated, ordered placement list.
//!
//! ## Why regex scanning?
//!
//! The upstream text generator is not contract-bound to one notation. The
//! same model emits `<FIGURE_ID>3</FIGURE_ID>` in one paragraph and
//! `Figure 3` in the next, sometimes `Figure 7.a`, sometimes `Figure 7a`.
//! Scanning loosely-structured text is inherent to the problem; what this
//! module guarantees is that the rest of the pipeline never touches raw
//! text again — downstream consumers only see typed values.
//!
//! ## Matching rules
//!
//! Per scan position, the tag grammar wins over the plain-text grammar.
//! Malformed syntax (a tag that never closes, a lexeme that is not
//! `base[.sub]`) is "no reference at that span", never an error: resolution
//! only ever under-matches.
//!
//! Sub-index spellings normalize identically: `7.a` and `7a` both become
//! `(base = "7", sub = "a")`, id `"7_a"`. In plain text a digit sub-index
//! requires the separating period (`Figure 7.2`) — without it the digits
//! belong to the base (`Figure 72` is figure 72).

use std::collections::HashMap;
use std::ops::Range;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use crate::paper::FigureRecord;

/// Both reference grammars in one pass, tag branch first.
///
/// Tag lexeme: digits, optional period, optional single alphanumeric
/// sub-index. Plain text: `figure` (any case), digits, then either
/// `.{alnum}` or a bare trailing letter.
static RE_REFERENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?ix)
        <figure_id>\s*(?P<tbase>[0-9]+)(?:\.?(?P<tsub>[a-z0-9]))?\s*</figure_id>
        |
        \bfigure\s+(?P<pbase>[0-9]+)(?:\.(?P<psubdot>[a-z0-9])|(?P<psubbare>[a-z]))?\b
        ",
    )
    .expect("reference grammar must compile")
});

/// One reference found in the generated text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FigureReference {
    /// Byte range of the match in the markup-stripped prose.
    pub span: Range<usize>,
    pub base: String,
    pub sub: Option<String>,
    /// Whether the match used the tag notation.
    pub tagged: bool,
}

impl FigureReference {
    /// Normalized id: `base`, or `base_sub` for sub-figures.
    ///
    /// Two references with the same normalized id are the same logical
    /// reference regardless of notation.
    pub fn figure_id(&self) -> String {
        match &self.sub {
            Some(sub) => format!("{}_{}", self.base, sub),
            None => self.base.clone(),
        }
    }

    /// Plain-text rendering of the reference (`Figure 7.a`).
    pub fn display(&self) -> String {
        match &self.sub {
            Some(sub) => format!("Figure {}.{}", self.base, sub),
            None => format!("Figure {}", self.base),
        }
    }
}

/// A group member: one sub-figure reference, resolved or broken.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupMember {
    pub figure_id: String,
    pub sub: String,
    /// `None` when extraction found no image for this sub-figure.
    pub record: Option<FigureRecord>,
}

/// What gets spliced into the document for one first occurrence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlacementKind {
    /// A single figure with a matching extracted image.
    Figure(FigureRecord),
    /// All sub-figure references sharing one base, ordered by sub-index.
    Group { base: String, members: Vec<GroupMember> },
    /// A reference with no matching extracted image.
    Broken { figure_id: String },
}

/// A placement anchored at the first occurrence of its reference(s).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    /// Byte offset (into the stripped prose) of the anchoring occurrence.
    pub anchor: usize,
    pub kind: PlacementKind,
}

/// Resolver output: the markup-stripped prose plus typed placements.
///
/// The stable contract of this module — everything after resolution
/// consumes these values and never the raw text.
#[derive(Debug, Clone)]
pub struct ResolvedReferences {
    /// Prose with tag notation rewritten to plain `Figure N[.s]` text.
    pub prose: String,
    /// Every reference found, in scan order, spans into `prose`.
    pub references: Vec<FigureReference>,
    /// One placement per logical figure/group, in first-occurrence order.
    pub placements: Vec<Placement>,
}

/// Scan generated text for figure references.
///
/// Returns the markup-stripped prose and the references with spans into
/// it. Tag spans are rewritten to their plain-text display form so the
/// reference is readable once the markup is gone; plain-text matches are
/// left verbatim.
pub fn scan_references(raw: &str) -> (String, Vec<FigureReference>) {
    let mut prose = String::with_capacity(raw.len());
    let mut references = Vec::new();
    let mut copied_to = 0;

    for caps in RE_REFERENCE.captures_iter(raw) {
        let whole = caps.get(0).expect("match group 0");
        let (base, sub, tagged) = if let Some(tbase) = caps.name("tbase") {
            (
                tbase.as_str().to_string(),
                caps.name("tsub").map(|m| m.as_str().to_ascii_lowercase()),
                true,
            )
        } else {
            let base = caps.name("pbase").expect("plain base").as_str().to_string();
            let sub = caps
                .name("psubdot")
                .or_else(|| caps.name("psubbare"))
                .map(|m| m.as_str().to_ascii_lowercase());
            (base, sub, false)
        };

        prose.push_str(&raw[copied_to..whole.start()]);
        copied_to = whole.end();

        let reference = FigureReference {
            span: 0..0, // patched below once the output text is final
            base,
            sub,
            tagged,
        };
        let rendered = if tagged {
            reference.display()
        } else {
            whole.as_str().to_string()
        };
        let start = prose.len();
        prose.push_str(&rendered);
        references.push(FigureReference {
            span: start..prose.len(),
            ..reference
        });
    }
    prose.push_str(&raw[copied_to..]);

    (prose, references)
}

/// Resolve raw generated text against a paper's extracted figure set.
///
/// Dedup is by normalized id with first-occurrence-wins placement;
/// references sharing a base and a non-empty sub-index collapse into one
/// group placement ordered lexicographically by sub (a design choice, see
/// DESIGN.md). References without a matching [`FigureRecord`] become
/// broken placements — degraded, never dropped, never an error.
pub fn resolve(raw: &str, figures: &[FigureRecord]) -> ResolvedReferences {
    let (prose, references) = scan_references(raw);

    let by_id: HashMap<&str, &FigureRecord> =
        figures.iter().map(|f| (f.figure_id.as_str(), f)).collect();

    // First occurrence of each normalized id, in scan order.
    let mut first_seen: Vec<&FigureReference> = Vec::new();
    for reference in &references {
        let id = reference.figure_id();
        if !first_seen.iter().any(|r| r.figure_id() == id) {
            first_seen.push(reference);
        }
    }

    // Sub-figure references collapse into one placement per base, anchored
    // at the earliest member occurrence.
    let mut placements: Vec<Placement> = Vec::new();
    let mut grouped_bases: Vec<String> = Vec::new();

    for reference in &first_seen {
        match &reference.sub {
            None => {
                let id = reference.figure_id();
                let kind = match by_id.get(id.as_str()) {
                    Some(record) => PlacementKind::Figure((*record).clone()),
                    None => PlacementKind::Broken { figure_id: id },
                };
                placements.push(Placement {
                    anchor: reference.span.start,
                    kind,
                });
            }
            Some(_) => {
                if grouped_bases.contains(&reference.base) {
                    continue;
                }
                grouped_bases.push(reference.base.clone());

                let mut members: Vec<GroupMember> = first_seen
                    .iter()
                    .filter(|r| r.base == reference.base && r.sub.is_some())
                    .map(|r| {
                        let figure_id = r.figure_id();
                        GroupMember {
                            record: by_id.get(figure_id.as_str()).map(|f| (*f).clone()),
                            sub: r.sub.clone().expect("filtered on sub"),
                            figure_id,
                        }
                    })
                    .collect();
                members.sort_by(|a, b| a.sub.cmp(&b.sub));

                placements.push(Placement {
                    anchor: reference.span.start,
                    kind: PlacementKind::Group {
                        base: reference.base.clone(),
                        members,
                    },
                });
            }
        }
    }

    placements.sort_by_key(|p| p.anchor);

    debug!(
        "Resolved {} references into {} placements",
        references.len(),
        placements.len()
    );

    ResolvedReferences {
        prose,
        references,
        placements,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn figures(ids: &[&str]) -> Vec<FigureRecord> {
        ids.iter().map(|id| FigureRecord::new("p1", *id)).collect()
    }

    fn ids(resolved: &ResolvedReferences) -> Vec<String> {
        resolved
            .placements
            .iter()
            .map(|p| match &p.kind {
                PlacementKind::Figure(f) => f.figure_id.clone(),
                PlacementKind::Group { base, .. } => format!("group:{base}"),
                PlacementKind::Broken { figure_id } => format!("broken:{figure_id}"),
            })
            .collect()
    }

    #[test]
    fn tag_and_plain_notations_are_equivalent() {
        for text in [
            "See <FIGURE_ID>3.a</FIGURE_ID> here.",
            "See Figure 3a here.",
            "See Figure 3.a here.",
            "See figure 3.A here.",
        ] {
            let (_, refs) = scan_references(text);
            assert_eq!(refs.len(), 1, "in {text:?}");
            assert_eq!(refs[0].figure_id(), "3_a", "in {text:?}");
        }
    }

    #[test]
    fn plain_digit_sub_requires_period() {
        let (_, refs) = scan_references("Figure 7.2 differs from Figure 72.");
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[0].figure_id(), "7_2");
        assert_eq!(refs[1].figure_id(), "72");
    }

    #[test]
    fn tag_lexeme_without_period() {
        let (_, refs) = scan_references("<FIGURE_ID>7a</FIGURE_ID> and <FIGURE_ID>12</FIGURE_ID>");
        assert_eq!(refs[0].figure_id(), "7_a");
        assert_eq!(refs[1].figure_id(), "12");
    }

    #[test]
    fn unclosed_tag_is_no_reference() {
        let (prose, refs) = scan_references("broken <FIGURE_ID>3 and that is all");
        assert!(refs.is_empty());
        assert_eq!(prose, "broken <FIGURE_ID>3 and that is all");
    }

    #[test]
    fn junk_tag_lexeme_is_no_reference() {
        let (_, refs) = scan_references("<FIGURE_ID>see above</FIGURE_ID>");
        assert!(refs.is_empty());
    }

    #[test]
    fn tag_markup_is_stripped_to_plain_text() {
        let (prose, refs) = scan_references("As shown in <FIGURE_ID>1</FIGURE_ID>, things work.");
        assert_eq!(prose, "As shown in Figure 1, things work.");
        assert_eq!(&prose[refs[0].span.clone()], "Figure 1");
    }

    #[test]
    fn plain_text_left_verbatim() {
        let (prose, _) = scan_references("As shown in figure 4, things work.");
        assert_eq!(prose, "As shown in figure 4, things work.");
    }

    #[test]
    fn first_occurrence_wins_across_notations() {
        let resolved = resolve(
            "First <FIGURE_ID>1</FIGURE_ID>, then Figure 1 again, then FIGURE 1.",
            &figures(&["1"]),
        );
        assert_eq!(resolved.references.len(), 3);
        assert_eq!(ids(&resolved), vec!["1"]);
        assert_eq!(
            resolved.placements[0].anchor,
            resolved.references[0].span.start
        );
    }

    #[test]
    fn sub_figures_group_lexicographically() {
        // 7.c appears first in the text; the group still orders a, b, c.
        let resolved = resolve(
            "Figure 7.c shows decay, Figure 7.a the setup, Figure 7.b the ramp.",
            &figures(&["7_a", "7_b", "7_c"]),
        );
        assert_eq!(resolved.placements.len(), 1);
        match &resolved.placements[0].kind {
            PlacementKind::Group { base, members } => {
                assert_eq!(base, "7");
                let subs: Vec<&str> = members.iter().map(|m| m.sub.as_str()).collect();
                assert_eq!(subs, vec!["a", "b", "c"]);
                assert!(members.iter().all(|m| m.record.is_some()));
            }
            other => panic!("expected group, got {other:?}"),
        }
        // Anchored at the earliest member (7.c's occurrence).
        assert_eq!(resolved.placements[0].anchor, 0);
    }

    #[test]
    fn bare_base_and_sub_group_are_distinct_placements() {
        let resolved = resolve(
            "Figure 7 overall; Figure 7.a in detail.",
            &figures(&["7", "7_a"]),
        );
        assert_eq!(ids(&resolved), vec!["7", "group:7"]);
    }

    #[test]
    fn unmatched_reference_is_broken_not_fatal() {
        let resolved = resolve("Only Figure 99 is cited.", &figures(&["1"]));
        assert_eq!(ids(&resolved), vec!["broken:99"]);
    }

    #[test]
    fn group_member_without_image_is_kept_as_broken_member() {
        let resolved = resolve(
            "Figure 2.a and Figure 2.b.",
            &figures(&["2_a"]), // 2_b never extracted
        );
        match &resolved.placements[0].kind {
            PlacementKind::Group { members, .. } => {
                assert!(members[0].record.is_some());
                assert!(members[1].record.is_none());
            }
            other => panic!("expected group, got {other:?}"),
        }
    }

    #[test]
    fn spec_scenario_duplicate_and_missing() {
        let text = "...as shown in <FIGURE_ID>1</FIGURE_ID> and later Figure 1 again, plus Figure 5.";
        let resolved = resolve(text, &figures(&["1", "2"]));
        assert_eq!(ids(&resolved), vec!["1", "broken:5"]);
        assert!(resolved.prose.contains("Figure 1 and later Figure 1 again"));
        assert!(!resolved.prose.contains("FIGURE_ID"));
    }

    #[test]
    fn placements_ordered_by_first_occurrence() {
        let resolved = resolve(
            "Figure 3 then Figure 1 then Figure 2.",
            &figures(&["1", "2", "3"]),
        );
        assert_eq!(ids(&resolved), vec!["3", "1", "2"]);
    }
}
