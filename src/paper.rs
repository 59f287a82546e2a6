//! Paper and figure records.
//!
//! A [`PaperRecord`] is created once on discovery and is immutable except
//! for the fields the pipeline owns (`figures`, `summary_raw`,
//! `artifact_path`). [`FigureRecord`] rows are created during the figures
//! stage and never mutated — when that stage is explicitly reprocessed the
//! whole set is re-created wholesale.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One research paper, as discovered plus pipeline-owned fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaperRecord {
    /// Opaque, stable id (content hash or source id).
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub authors: Vec<String>,
    #[serde(default)]
    pub abstract_text: String,
    /// Where the source document lives: local path or HTTP/HTTPS URL.
    pub source_url: String,
    pub discovered_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,

    // ── Pipeline-owned ────────────────────────────────────────────────────
    /// Figures extracted by the figures stage, re-created wholesale on rerun.
    #[serde(default)]
    pub figures: Vec<FigureRecord>,
    /// Raw generated text from the summary stage, before reference resolution.
    #[serde(default)]
    pub summary_raw: Option<String>,
    /// Relative path of the assembled markdown artifact, set by the markdown stage.
    #[serde(default)]
    pub artifact_path: Option<String>,
}

impl PaperRecord {
    /// Minimal record for a freshly discovered paper.
    pub fn new(
        id: impl Into<String>,
        title: impl Into<String>,
        source_url: impl Into<String>,
        discovered_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            authors: Vec::new(),
            abstract_text: String::new(),
            source_url: source_url.into(),
            discovered_at,
            updated_at: None,
            figures: Vec::new(),
            summary_raw: None,
            artifact_path: None,
        }
    }

    /// Find a figure by its normalized id.
    pub fn figure(&self, figure_id: &str) -> Option<&FigureRecord> {
        self.figures.iter().find(|f| f.figure_id == figure_id)
    }
}

/// One extracted figure image, identified by `(paper_id, figure_id)`.
///
/// `figure_id` is either a bare index (`"1"`) or a composite sub-figure id
/// (`"7_a"`). Uniqueness is scoped to the paper. A sub-figure's
/// `parent_figure_id` names its group even when no parent image exists —
/// the group is virtual.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FigureRecord {
    pub figure_id: String,
    /// Object-storage key, `figures/{paper_id}/{figure_id}.png`.
    pub storage_key: String,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub parent_figure_id: Option<String>,
}

impl FigureRecord {
    pub fn new(paper_id: &str, figure_id: impl Into<String>) -> Self {
        let figure_id = figure_id.into();
        let storage_key = storage_key(paper_id, &figure_id);
        let parent_figure_id = figure_id
            .split_once('_')
            .map(|(base, _)| base.to_string());
        Self {
            figure_id,
            storage_key,
            caption: None,
            parent_figure_id,
        }
    }

    pub fn with_caption(mut self, caption: impl Into<String>) -> Self {
        self.caption = Some(caption.into());
        self
    }
}

/// Storage key for a figure image: `figures/{paper_id}/{figure_id}.png`.
///
/// Sub-figure ids already carry the `{base}_{sub}` shape, so the key format
/// for them comes out as `figures/{paper_id}/{base}_{sub}.png`.
pub fn storage_key(paper_id: &str, figure_id: &str) -> String {
    format!("figures/{paper_id}/{figure_id}.png")
}

/// Public URL for a storage key — a deterministic function of the key.
pub fn public_url(base_url: &str, storage_key: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), storage_key)
}
