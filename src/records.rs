//! Paper-record persistence.
//!
//! The hosted relational store behind the website is an external
//! collaborator; the pipeline only needs "upsert/get record by id". That
//! capability is the [`RecordStore`] trait, with a JSON-document-per-paper
//! implementation for local runs and tests: one pretty-printed document per
//! paper under `{data_dir}/papers/`, plus a site index maintained by the
//! info stage under `{data_dir}/site/index.json`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::PaperPressError;
use crate::paper::PaperRecord;

/// Upsert/get capability over paper records, plus site-index publication
/// (the info stage's output).
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn upsert(&self, paper: &PaperRecord) -> Result<(), PaperPressError>;
    async fn get(&self, paper_id: &str) -> Result<Option<PaperRecord>, PaperPressError>;
    async fn list_ids(&self) -> Result<Vec<String>, PaperPressError>;
    async fn publish_index(&self, entry: SiteIndexEntry) -> Result<(), PaperPressError>;
}

/// One row of the published site index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteIndexEntry {
    pub paper_id: String,
    pub title: String,
    pub authors: Vec<String>,
    pub artifact_path: String,
    pub figure_count: usize,
    pub published_at: chrono::DateTime<chrono::Utc>,
}

/// JSON-documents-on-disk record store.
#[derive(Debug, Clone)]
pub struct JsonRecordStore {
    papers_dir: PathBuf,
    site_dir: PathBuf,
}

impl JsonRecordStore {
    pub fn open(data_dir: &Path) -> Result<Self, PaperPressError> {
        let papers_dir = data_dir.join("papers");
        let site_dir = data_dir.join("site");
        for dir in [&papers_dir, &site_dir] {
            std::fs::create_dir_all(dir).map_err(|e| PaperPressError::RecordStore {
                paper_id: String::new(),
                detail: format!("create {}: {e}", dir.display()),
            })?;
        }
        Ok(Self { papers_dir, site_dir })
    }

    fn path_for(&self, paper_id: &str) -> PathBuf {
        self.papers_dir.join(format!("{paper_id}.json"))
    }

    /// Directory the assembled markdown artifacts are published into.
    pub fn site_dir(&self) -> &Path {
        &self.site_dir
    }

    fn index_path(&self) -> PathBuf {
        self.site_dir.join("index.json")
    }

    /// Replace or append this paper's row in the site index.
    ///
    /// The index is tiny (one row per published paper); read-modify-write
    /// of the whole document keeps it human-diffable.
    pub fn upsert_index_entry(&self, entry: SiteIndexEntry) -> Result<(), PaperPressError> {
        let path = self.index_path();
        let mut entries: Vec<SiteIndexEntry> = match std::fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw).map_err(|e| PaperPressError::CorruptDocument {
                path: path.clone(),
                detail: e.to_string(),
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                return Err(PaperPressError::RecordStore {
                    paper_id: entry.paper_id,
                    detail: format!("read index: {e}"),
                })
            }
        };

        entries.retain(|e| e.paper_id != entry.paper_id);
        entries.push(entry);
        entries.sort_by(|a, b| a.paper_id.cmp(&b.paper_id));

        write_atomic(&path, &serde_json::to_vec_pretty(&entries).map_err(|e| {
            PaperPressError::Internal(format!("serialize site index: {e}"))
        })?)
        .map_err(|e| PaperPressError::RecordStore {
            paper_id: String::new(),
            detail: format!("write index: {e}"),
        })
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)
}

#[async_trait]
impl RecordStore for JsonRecordStore {
    async fn upsert(&self, paper: &PaperRecord) -> Result<(), PaperPressError> {
        let path = self.path_for(&paper.id);
        let json =
            serde_json::to_vec_pretty(paper).map_err(|e| PaperPressError::Internal(e.to_string()))?;
        write_atomic(&path, &json).map_err(|e| PaperPressError::RecordStore {
            paper_id: paper.id.clone(),
            detail: e.to_string(),
        })?;
        debug!("Upserted record for {}", paper.id);
        Ok(())
    }

    async fn get(&self, paper_id: &str) -> Result<Option<PaperRecord>, PaperPressError> {
        let path = self.path_for(paper_id);
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(PaperPressError::RecordStore {
                    paper_id: paper_id.to_string(),
                    detail: e.to_string(),
                })
            }
        };
        let paper = serde_json::from_str(&raw).map_err(|e| PaperPressError::CorruptDocument {
            path,
            detail: e.to_string(),
        })?;
        Ok(Some(paper))
    }

    async fn list_ids(&self) -> Result<Vec<String>, PaperPressError> {
        let mut ids = Vec::new();
        let entries = std::fs::read_dir(&self.papers_dir).map_err(|e| {
            PaperPressError::RecordStore {
                paper_id: String::new(),
                detail: e.to_string(),
            }
        })?;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(id) = name.strip_suffix(".json") {
                ids.push(id.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    async fn publish_index(&self, entry: SiteIndexEntry) -> Result<(), PaperPressError> {
        self.upsert_index_entry(entry)
    }
}
