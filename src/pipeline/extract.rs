//! Figure extraction: from a paper's source document to candidate figures.
//!
//! The default extractor consumes the HTML rendition publishers serve
//! (local file or URL), scans it for `<figure>` blocks, fetches the
//! referenced images, and normalises everything to PNG. Scanning markup
//! with regexes is deliberately tolerant: a block the scanner cannot make
//! sense of yields no figure rather than an error — a missing figure
//! degrades to a broken reference downstream, a failed stage blocks the
//! whole paper.
//!
//! Extraction is cheap and idempotent (unlike summarization), so the
//! figures stage re-extracts everything on retry; partial figure sets are
//! never committed.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::error::{FailureKind, StageError};
use crate::paper::PaperRecord;
use crate::pipeline::encode::normalise_to_png;
use crate::state::Stage;

/// One candidate figure produced by extraction.
#[derive(Debug, Clone)]
pub struct ExtractedFigure {
    /// Normalized id: `"3"`, or `"3_a"` for a sub-figure of a multi-image block.
    pub figure_id: String,
    /// PNG bytes, ready for the figure store.
    pub bytes: Vec<u8>,
    pub caption: Option<String>,
}

/// Produces candidate figures from a paper's source document.
#[async_trait]
pub trait FigureExtractor: Send + Sync {
    async fn extract(&self, paper: &PaperRecord) -> Result<Vec<ExtractedFigure>, StageError>;
}

// ── HTML scanning ────────────────────────────────────────────────────────

static RE_FIGURE_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<figure[^>]*>(.*?)</figure>").unwrap());

static RE_IMG_SRC: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)<img[^>]+src\s*=\s*["']([^"']+)["']"#).unwrap());

static RE_FIGCAPTION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<figcaption[^>]*>(.*?)</figcaption>").unwrap());

static RE_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<[^>]*>").unwrap());

/// Leading `Figure N` label in a caption, used to number the figure the way
/// the generated text will cite it.
static RE_CAPTION_NUMBER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*(?:figure|fig\.?)\s*(\d+)\s*[:.]?\s*").unwrap());

/// One `<figure>` block: its image sources and cleaned caption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FigureBlock {
    pub image_srcs: Vec<String>,
    pub caption: Option<String>,
    /// Figure number parsed from the caption label, if present.
    pub number: Option<String>,
}

/// Scan an HTML document for figure blocks.
pub fn scan_figure_blocks(html: &str) -> Vec<FigureBlock> {
    let mut blocks = Vec::new();
    for caps in RE_FIGURE_BLOCK.captures_iter(html) {
        let inner = &caps[1];
        let image_srcs: Vec<String> = RE_IMG_SRC
            .captures_iter(inner)
            .map(|c| c[1].to_string())
            .collect();
        if image_srcs.is_empty() {
            continue;
        }

        let raw_caption = RE_FIGCAPTION
            .captures(inner)
            .map(|c| clean_caption(&c[1]));
        let (number, caption) = match raw_caption {
            Some(raw) => {
                if let Some(num_caps) = RE_CAPTION_NUMBER.captures(&raw) {
                    let number = num_caps[1].to_string();
                    let rest = raw[num_caps.get(0).expect("group 0").end()..]
                        .trim()
                        .to_string();
                    (Some(number), (!rest.is_empty()).then_some(rest))
                } else {
                    (None, Some(raw))
                }
            }
            None => (None, None),
        };

        blocks.push(FigureBlock {
            image_srcs,
            caption,
            number,
        });
    }
    blocks
}

fn clean_caption(raw: &str) -> String {
    let no_tags = RE_TAG.replace_all(raw, " ");
    no_tags.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Assign figure ids to scanned blocks.
///
/// A block numbers itself from its caption label when present, else from
/// its position; two blocks claiming the same label fall back to position
/// so ids stay unique within the paper. Multi-image blocks fan out into
/// sub-figures `a`, `b`, … sharing the base number; more than 26 images in
/// one block is beyond the sub-index grammar, so extras are dropped
/// (logged, not fatal).
pub fn assign_ids(blocks: &[FigureBlock]) -> Vec<(String, String, Option<String>)> {
    let mut out = Vec::new();
    let mut used_bases: Vec<String> = Vec::new();
    for (position, block) in blocks.iter().enumerate() {
        let mut base = block
            .number
            .clone()
            .unwrap_or_else(|| (position + 1).to_string());
        if used_bases.contains(&base) {
            let mut n = position + 1;
            while used_bases.contains(&n.to_string()) {
                n += 1;
            }
            warn!("Duplicate figure label {}; renumbering block as {}", base, n);
            base = n.to_string();
        }
        used_bases.push(base.clone());

        if block.image_srcs.len() == 1 {
            out.push((base, block.image_srcs[0].clone(), block.caption.clone()));
            continue;
        }

        for (idx, src) in block.image_srcs.iter().enumerate() {
            if idx >= 26 {
                warn!("Figure {}: dropping image {} (sub-index past 'z')", base, idx + 1);
                continue;
            }
            let sub = (b'a' + idx as u8) as char;
            out.push((format!("{base}_{sub}"), src.clone(), block.caption.clone()));
        }
    }
    out
}

// ── Default extractor ────────────────────────────────────────────────────

/// Extracts figures from the paper's HTML rendition.
pub struct HtmlFigureExtractor {
    client: reqwest::Client,
    download_timeout_secs: u64,
}

impl HtmlFigureExtractor {
    pub fn new(download_timeout_secs: u64) -> Result<Self, StageError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(download_timeout_secs))
            .build()
            .map_err(|e| StageError::SourceUnavailable {
                stage: Stage::Figures,
                source_ref: String::new(),
                detail: e.to_string(),
                kind: FailureKind::Permanent,
            })?;
        Ok(Self {
            client,
            download_timeout_secs,
        })
    }

    fn is_url(s: &str) -> bool {
        s.starts_with("http://") || s.starts_with("https://")
    }

    async fn fetch_source(&self, source: &str) -> Result<String, StageError> {
        if Self::is_url(source) {
            info!("Downloading paper source: {}", source);
            let response = self.client.get(source).send().await.map_err(|e| {
                StageError::SourceUnavailable {
                    stage: Stage::Figures,
                    source_ref: source.to_string(),
                    detail: if e.is_timeout() {
                        format!("timed out after {}s", self.download_timeout_secs)
                    } else {
                        e.to_string()
                    },
                    kind: if e.is_timeout() {
                        FailureKind::Transient
                    } else {
                        FailureKind::Permanent
                    },
                }
            })?;
            let status = response.status();
            if !status.is_success() {
                return Err(StageError::SourceUnavailable {
                    stage: Stage::Figures,
                    source_ref: source.to_string(),
                    detail: format!("HTTP {status}"),
                    kind: if status.is_server_error() {
                        FailureKind::Transient
                    } else {
                        FailureKind::Permanent
                    },
                });
            }
            response
                .text()
                .await
                .map_err(|e| StageError::SourceUnavailable {
                    stage: Stage::Figures,
                    source_ref: source.to_string(),
                    detail: e.to_string(),
                    kind: FailureKind::Transient,
                })
        } else {
            tokio::fs::read_to_string(source)
                .await
                .map_err(|e| StageError::SourceUnavailable {
                    stage: Stage::Figures,
                    source_ref: source.to_string(),
                    detail: e.to_string(),
                    kind: FailureKind::Permanent,
                })
        }
    }

    /// Fetch one referenced image, resolving `src` against the source.
    async fn fetch_image(&self, source: &str, src: &str) -> Option<Vec<u8>> {
        if Self::is_url(src) {
            self.fetch_image_url(src).await
        } else if Self::is_url(source) {
            let joined = reqwest::Url::parse(source).ok()?.join(src).ok()?;
            self.fetch_image_url(joined.as_str()).await
        } else {
            let base: &Path = Path::new(source).parent().unwrap_or(Path::new("."));
            let path: PathBuf = base.join(src);
            match tokio::fs::read(&path).await {
                Ok(bytes) => Some(bytes),
                Err(e) => {
                    warn!("Failed to read image {}: {}", path.display(), e);
                    None
                }
            }
        }
    }

    async fn fetch_image_url(&self, url: &str) -> Option<Vec<u8>> {
        match self.client.get(url).send().await {
            Ok(response) if response.status().is_success() => {
                response.bytes().await.map(|b| b.to_vec()).ok()
            }
            Ok(response) => {
                warn!("Image fetch {} returned HTTP {}", url, response.status());
                None
            }
            Err(e) => {
                warn!("Image fetch {} failed: {}", url, e);
                None
            }
        }
    }
}

#[async_trait]
impl FigureExtractor for HtmlFigureExtractor {
    async fn extract(&self, paper: &PaperRecord) -> Result<Vec<ExtractedFigure>, StageError> {
        let html = self.fetch_source(&paper.source_url).await?;
        let blocks = scan_figure_blocks(&html);
        debug!("Paper {}: {} figure blocks in source", paper.id, blocks.len());

        let mut figures = Vec::new();
        for (figure_id, src, caption) in assign_ids(&blocks) {
            let Some(raw) = self.fetch_image(&paper.source_url, &src).await else {
                warn!("Paper {}: skipping figure {} (image unavailable)", paper.id, figure_id);
                continue;
            };
            match normalise_to_png(&raw) {
                Ok(bytes) => figures.push(ExtractedFigure {
                    figure_id,
                    bytes,
                    caption,
                }),
                Err(e) => {
                    warn!(
                        "Paper {}: skipping figure {} (not a decodable image: {})",
                        paper.id, figure_id, e
                    );
                }
            }
        }

        info!("Paper {}: extracted {} figures", paper.id, figures.len());
        Ok(figures)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        <html><body>
        <p>Intro</p>
        <figure>
          <img src="images/loss.png">
          <figcaption>Figure 2: <em>Training</em> loss.</figcaption>
        </figure>
        <figure class="wide">
          <img src='a.png'><img src='b.png'>
          <figcaption>Fig. 7. Ablations.</figcaption>
        </figure>
        <figure><p>no image here</p></figure>
        <figure><img src="plain.jpg"></figure>
        </body></html>
    "#;

    #[test]
    fn scan_finds_blocks_and_cleans_captions() {
        let blocks = scan_figure_blocks(SAMPLE);
        assert_eq!(blocks.len(), 3); // imageless block skipped

        assert_eq!(blocks[0].image_srcs, vec!["images/loss.png"]);
        assert_eq!(blocks[0].number.as_deref(), Some("2"));
        assert_eq!(blocks[0].caption.as_deref(), Some("Training loss."));

        assert_eq!(blocks[1].image_srcs.len(), 2);
        assert_eq!(blocks[1].number.as_deref(), Some("7"));

        assert_eq!(blocks[2].number, None);
        assert_eq!(blocks[2].caption, None);
    }

    #[test]
    fn assign_ids_caption_number_wins_over_position() {
        let blocks = scan_figure_blocks(SAMPLE);
        let ids: Vec<String> = assign_ids(&blocks).into_iter().map(|(id, _, _)| id).collect();
        // Third block has no caption label; it numbers by position (3).
        assert_eq!(ids, vec!["2", "7_a", "7_b", "3"]);
    }

    #[test]
    fn multi_image_block_fans_out_to_sub_figures() {
        let blocks = vec![FigureBlock {
            image_srcs: vec!["x.png".into(), "y.png".into(), "z.png".into()],
            caption: Some("Panels".into()),
            number: Some("4".into()),
        }];
        let assigned = assign_ids(&blocks);
        let ids: Vec<&str> = assigned.iter().map(|(id, _, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["4_a", "4_b", "4_c"]);
        assert!(assigned.iter().all(|(_, _, c)| c.as_deref() == Some("Panels")));
    }

    #[test]
    fn duplicate_caption_labels_renumber_by_position() {
        let block = |number: Option<&str>| FigureBlock {
            image_srcs: vec!["x.png".into()],
            caption: None,
            number: number.map(String::from),
        };
        let blocks = vec![block(Some("2")), block(Some("2")), block(None)];
        let ids: Vec<String> = assign_ids(&blocks).into_iter().map(|(id, _, _)| id).collect();
        // Second "2" renumbers past its label; the positional block then
        // renumbers past the occupied "3".
        assert_eq!(ids, vec!["2", "3", "4"]);
    }

    #[test]
    fn malformed_markup_under_matches() {
        let blocks = scan_figure_blocks("<figure><img src=broken.png></figure>");
        // Unquoted src does not match the grammar: no figure, no error.
        assert!(blocks.is_empty());
    }
}
