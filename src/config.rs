//! Configuration for the per-paper pipeline.
//!
//! All behaviour is controlled through [`PipelineConfig`], built via its
//! [`PipelineConfigBuilder`]. Keeping every knob in one struct makes it
//! trivial to share configs across workers, log them, and diff two runs to
//! understand why their outputs differ.
//!
//! # Design choice: builder over constructor
//! A fifteen-field constructor is unreadable and breaks on every new field.
//! The builder lets callers set only what they care about and rely on
//! well-documented defaults for the rest.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use edgequake_llm::{LLMProvider, ProviderFactory};

use crate::error::PaperPressError;
use crate::progress::ProgressCallback;

/// Configuration for pipeline runs.
///
/// Built via [`PipelineConfig::builder()`] or [`PipelineConfig::default()`].
///
/// # Example
/// ```rust
/// use paperpress::PipelineConfig;
///
/// let config = PipelineConfig::builder()
///     .data_dir("./data")
///     .concurrency(4)
///     .model("gpt-4.1-nano")
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct PipelineConfig {
    /// Root of the pipeline's working tree: `state/`, `papers/`, `figures/`,
    /// `site/` all live under it. Default: `./data`.
    pub data_dir: PathBuf,

    /// Remote object-storage endpoint for the primary figure tier.
    /// `None` runs local-only (the fallback tier becomes the only tier).
    pub remote_store_endpoint: Option<String>,

    /// Public base URL figures are served from. Default: `/` (site-relative).
    pub public_base_url: String,

    /// Papers processed concurrently. Default: 4.
    ///
    /// The pipeline is embarrassingly parallel across papers; the practical
    /// bound is the LLM API rate limit, not CPU. Lower this on 429s.
    pub concurrency: usize,

    /// LLM model identifier, e.g. "gpt-4.1-nano". If None, provider default.
    pub model: Option<String>,

    /// LLM provider name (e.g. "openai", "anthropic").
    /// If None along with `provider`, uses `ProviderFactory::from_env()`.
    pub provider_name: Option<String>,

    /// Pre-constructed LLM provider. Takes precedence over `provider_name`.
    pub provider: Option<Arc<dyn LLMProvider>>,

    /// Sampling temperature for the summary completion. Default: 0.3.
    ///
    /// Low temperature keeps the summary faithful to the abstract and
    /// captions; higher values invent results.
    pub temperature: f32,

    /// Maximum tokens the LLM may generate per summary. Default: 2048.
    pub max_tokens: usize,

    /// Maximum retry attempts on a transient summarizer failure. Default: 3.
    ///
    /// Most 5xx and timeout errors are transient. Permanent errors (bad API
    /// key, 400) are not retried — they fail the stage immediately.
    pub max_retries: u32,

    /// Initial retry delay in milliseconds (exponential backoff). Default: 500.
    ///
    /// Doubles after each attempt: 500 ms → 1 s → 2 s, avoiding the
    /// thundering-herd problem when concurrent workers retry simultaneously
    /// against a recovering endpoint.
    pub retry_backoff_ms: u64,

    /// Custom summary system prompt. If None, uses the built-in default.
    pub system_prompt: Option<String>,

    /// Prepend YAML front matter to assembled artifacts. Default: true.
    pub include_front_matter: bool,

    /// Download timeout for source documents and images in seconds. Default: 120.
    pub download_timeout_secs: u64,

    /// Per-LLM-call timeout in seconds. Default: 60.
    pub api_timeout_secs: u64,

    /// Progress callback for per-stage events. Default: none.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            remote_store_endpoint: None,
            public_base_url: "/".to_string(),
            concurrency: 4,
            model: None,
            provider_name: None,
            provider: None,
            temperature: 0.3,
            max_tokens: 2048,
            max_retries: 3,
            retry_backoff_ms: 500,
            system_prompt: None,
            include_front_matter: true,
            download_timeout_secs: 120,
            api_timeout_secs: 60,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("data_dir", &self.data_dir)
            .field("remote_store_endpoint", &self.remote_store_endpoint)
            .field("public_base_url", &self.public_base_url)
            .field("concurrency", &self.concurrency)
            .field("model", &self.model)
            .field("provider_name", &self.provider_name)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("max_retries", &self.max_retries)
            .field("include_front_matter", &self.include_front_matter)
            .finish()
    }
}

impl PipelineConfig {
    /// Create a new builder.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }

    /// Resolve the LLM provider, from most-specific to least-specific.
    ///
    /// The fallback chain lets library users and CLI users each set exactly
    /// as much as they need:
    ///
    /// 1. **Pre-built provider** (`provider`) — used as-is; for tests and
    ///    callers needing custom middleware.
    /// 2. **Named provider + model** (`provider_name`) — the factory reads
    ///    the corresponding API key from the environment.
    /// 3. **Environment pair** (`EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL`)
    ///    — honoured before auto-detection so an explicit model choice wins
    ///    even when multiple API keys are present.
    /// 4. **Full auto-detection** (`ProviderFactory::from_env`), preferring
    ///    OpenAI when `OPENAI_API_KEY` is set.
    pub fn resolve_provider(&self) -> Result<Arc<dyn LLMProvider>, PaperPressError> {
        if let Some(ref provider) = self.provider {
            return Ok(Arc::clone(provider));
        }

        if let Some(ref name) = self.provider_name {
            let model = self.model.as_deref().unwrap_or("gpt-4.1-nano");
            return create_provider(name, model);
        }

        if let (Ok(prov), Ok(model)) = (
            std::env::var("EDGEQUAKE_LLM_PROVIDER"),
            std::env::var("EDGEQUAKE_MODEL"),
        ) {
            if !prov.is_empty() && !model.is_empty() {
                return create_provider(&prov, &model);
            }
        }

        if let Ok(openai_key) = std::env::var("OPENAI_API_KEY") {
            if !openai_key.is_empty() {
                let model = self.model.as_deref().unwrap_or("gpt-4.1-nano");
                return create_provider("openai", model);
            }
        }

        let (llm_provider, _embedding) =
            ProviderFactory::from_env().map_err(|e| PaperPressError::ProviderNotConfigured {
                provider: "auto".to_string(),
                hint: format!(
                    "No LLM provider could be auto-detected from environment.\n\
                    Set OPENAI_API_KEY, ANTHROPIC_API_KEY, or configure a provider.\n\
                    Error: {}",
                    e
                ),
            })?;

        Ok(llm_provider)
    }
}

/// Instantiate a named provider with the given model.
fn create_provider(
    provider_name: &str,
    model: &str,
) -> Result<Arc<dyn LLMProvider>, PaperPressError> {
    ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| {
        PaperPressError::ProviderNotConfigured {
            provider: provider_name.to_string(),
            hint: format!("{e}"),
        }
    })
}

/// Builder for [`PipelineConfig`].
#[derive(Debug)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.data_dir = dir.into();
        self
    }

    pub fn remote_store_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.config.remote_store_endpoint = Some(endpoint.into());
        self
    }

    pub fn public_base_url(mut self, url: impl Into<String>) -> Self {
        self.config.public_base_url = url.into();
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n.max(1);
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = Some(model.into());
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    pub fn provider(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.config.provider = Some(provider);
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.system_prompt = Some(prompt.into());
        self
    }

    pub fn include_front_matter(mut self, v: bool) -> Self {
        self.config.include_front_matter = v;
        self
    }

    pub fn download_timeout_secs(mut self, secs: u64) -> Self {
        self.config.download_timeout_secs = secs;
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs;
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PipelineConfig, PaperPressError> {
        let c = &self.config;
        if c.concurrency == 0 {
            return Err(PaperPressError::InvalidConfig("Concurrency must be ≥ 1".into()));
        }
        if c.data_dir.as_os_str().is_empty() {
            return Err(PaperPressError::InvalidConfig("data_dir must not be empty".into()));
        }
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults_and_clamps() {
        let config = PipelineConfig::builder()
            .concurrency(0)
            .temperature(5.0)
            .build()
            .unwrap();
        assert_eq!(config.concurrency, 1);
        assert_eq!(config.temperature, 2.0);
        assert!(config.include_front_matter);
    }

    #[test]
    fn builder_rejects_empty_data_dir() {
        assert!(PipelineConfig::builder().data_dir("").build().is_err());
    }
}
