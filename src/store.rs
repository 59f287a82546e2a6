//! Durable storage for extracted figure images.
//!
//! ## Tiering
//!
//! The pipeline prefers a remote object-storage tier (the one the website
//! serves from) but must keep working when it is down: a paper's figures
//! stage commits only after every image is durably persisted *somewhere*.
//! [`TieredFigureStore`] tries the primary tier first and falls back to a
//! local filesystem tier for both reads and writes. A read that hits only
//! the local tier opportunistically re-uploads to the primary, so the
//! remote tier heals without a dedicated repair job.
//!
//! A read that misses on both tiers is `Ok(None)` — "NotFound" is a normal
//! answer the resolver turns into a broken reference, never a crash.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::paper::{public_url, storage_key};

/// Blob storage for figure images, keyed by `(paper_id, figure_id)`.
#[async_trait]
pub trait FigureStore: Send + Sync {
    /// Persist image bytes; returns the public URL for the stored object.
    async fn put(
        &self,
        paper_id: &str,
        figure_id: &str,
        bytes: &[u8],
    ) -> Result<String, StoreError>;

    /// Fetch image bytes. `Ok(None)` means not found on any tier.
    async fn get(&self, paper_id: &str, figure_id: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Public URL for a figure, a deterministic function of the storage key.
    fn url(&self, paper_id: &str, figure_id: &str) -> String;
}

/// A storage-tier failure. Only `put` surfaces these to callers; reads
/// degrade to `Ok(None)` at the tiered level.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("figure store I/O at '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("figure store HTTP {status} for '{key}'")]
    Http { key: String, status: u16 },

    #[error("figure store request for '{key}' failed: {detail}")]
    Request { key: String, detail: String },
}

// ── Local tier ───────────────────────────────────────────────────────────

/// Filesystem tier under `{data_dir}/`; keys map directly to paths, so a
/// stored figure lands at `{data_dir}/figures/{paper_id}/{figure_id}.png`.
#[derive(Debug, Clone)]
pub struct LocalFigureStore {
    root: PathBuf,
    public_base: String,
}

impl LocalFigureStore {
    pub fn new(root: impl Into<PathBuf>, public_base: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            public_base: public_base.into(),
        }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

#[async_trait]
impl FigureStore for LocalFigureStore {
    async fn put(
        &self,
        paper_id: &str,
        figure_id: &str,
        bytes: &[u8],
    ) -> Result<String, StoreError> {
        let key = storage_key(paper_id, figure_id);
        let path = self.path_for(&key);
        let io_err = |e| StoreError::Io {
            path: path.clone(),
            source: e,
        };

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }

        // Atomic write: a crashed process must never leave a half-written
        // image that a later read would serve as a valid figure.
        let tmp = path.with_extension("png.tmp");
        tokio::fs::write(&tmp, bytes).await.map_err(io_err)?;
        tokio::fs::rename(&tmp, &path).await.map_err(io_err)?;

        debug!("Stored figure locally: {}", path.display());
        Ok(public_url(&self.public_base, &key))
    }

    async fn get(&self, paper_id: &str, figure_id: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let key = storage_key(paper_id, figure_id);
        let path = self.path_for(&key);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::Io { path, source: e }),
        }
    }

    fn url(&self, paper_id: &str, figure_id: &str) -> String {
        public_url(&self.public_base, &storage_key(paper_id, figure_id))
    }
}

// ── Remote tier ──────────────────────────────────────────────────────────

/// HTTP object-storage tier: `PUT {endpoint}/{key}` / `GET {endpoint}/{key}`.
pub struct RemoteFigureStore {
    client: reqwest::Client,
    endpoint: String,
    public_base: String,
}

impl RemoteFigureStore {
    pub fn new(
        endpoint: impl Into<String>,
        public_base: impl Into<String>,
        timeout_secs: u64,
    ) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| StoreError::Request {
                key: String::new(),
                detail: e.to_string(),
            })?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            public_base: public_base.into(),
        })
    }

    fn object_url(&self, key: &str) -> String {
        format!("{}/{}", self.endpoint.trim_end_matches('/'), key)
    }
}

#[async_trait]
impl FigureStore for RemoteFigureStore {
    async fn put(
        &self,
        paper_id: &str,
        figure_id: &str,
        bytes: &[u8],
    ) -> Result<String, StoreError> {
        let key = storage_key(paper_id, figure_id);
        let response = self
            .client
            .put(self.object_url(&key))
            .header(reqwest::header::CONTENT_TYPE, "image/png")
            .body(bytes.to_vec())
            .send()
            .await
            .map_err(|e| StoreError::Request {
                key: key.clone(),
                detail: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(StoreError::Http {
                key,
                status: response.status().as_u16(),
            });
        }

        debug!("Stored figure remotely: {}", key);
        Ok(public_url(&self.public_base, &key))
    }

    async fn get(&self, paper_id: &str, figure_id: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let key = storage_key(paper_id, figure_id);
        let response = self
            .client
            .get(self.object_url(&key))
            .send()
            .await
            .map_err(|e| StoreError::Request {
                key: key.clone(),
                detail: e.to_string(),
            })?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(StoreError::Http {
                key,
                status: response.status().as_u16(),
            });
        }

        let bytes = response.bytes().await.map_err(|e| StoreError::Request {
            key,
            detail: e.to_string(),
        })?;
        Ok(Some(bytes.to_vec()))
    }

    fn url(&self, paper_id: &str, figure_id: &str) -> String {
        public_url(&self.public_base, &storage_key(paper_id, figure_id))
    }
}

// ── Tiered store ─────────────────────────────────────────────────────────

/// Primary tier with local fallback and opportunistic repair.
pub struct TieredFigureStore {
    primary: Option<Box<dyn FigureStore>>,
    fallback: LocalFigureStore,
}

impl TieredFigureStore {
    pub fn new(primary: Option<Box<dyn FigureStore>>, fallback: LocalFigureStore) -> Self {
        Self { primary, fallback }
    }

    /// A purely local store (no primary configured).
    pub fn local_only(fallback: LocalFigureStore) -> Self {
        Self {
            primary: None,
            fallback,
        }
    }
}

#[async_trait]
impl FigureStore for TieredFigureStore {
    async fn put(
        &self,
        paper_id: &str,
        figure_id: &str,
        bytes: &[u8],
    ) -> Result<String, StoreError> {
        if let Some(primary) = &self.primary {
            match primary.put(paper_id, figure_id, bytes).await {
                Ok(url) => return Ok(url),
                Err(e) => {
                    warn!(
                        "Primary tier write failed for {}/{}: {} — falling back to local",
                        paper_id, figure_id, e
                    );
                }
            }
        }
        self.fallback.put(paper_id, figure_id, bytes).await
    }

    async fn get(&self, paper_id: &str, figure_id: &str) -> Result<Option<Vec<u8>>, StoreError> {
        if let Some(primary) = &self.primary {
            match primary.get(paper_id, figure_id).await {
                Ok(Some(bytes)) => return Ok(Some(bytes)),
                Ok(None) => {}
                Err(e) => {
                    warn!(
                        "Primary tier read failed for {}/{}: {} — trying local",
                        paper_id, figure_id, e
                    );
                }
            }
        }

        let local = self.fallback.get(paper_id, figure_id).await?;

        // Local hit while a primary exists: re-upload so the remote tier
        // converges without a separate repair pass. Failure here is benign.
        if let (Some(bytes), Some(primary)) = (local.as_ref(), &self.primary) {
            if let Err(e) = primary.put(paper_id, figure_id, bytes).await {
                debug!(
                    "Opportunistic re-upload of {}/{} failed: {}",
                    paper_id, figure_id, e
                );
            }
        }

        Ok(local)
    }

    fn url(&self, paper_id: &str, figure_id: &str) -> String {
        match &self.primary {
            Some(primary) => primary.url(paper_id, figure_id),
            None => self.fallback.url(paper_id, figure_id),
        }
    }
}
