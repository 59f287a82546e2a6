//! CLI binary for paperpress.
//!
//! A thin shim over the library crate that maps CLI flags to
//! `PipelineConfig`, drives the selected papers, and prints results.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use paperpress::{
    PaperRecord, Pipeline, PipelineConfig, PipelineProgressCallback, ProgressCallback, Stage,
    StageSelection,
};
use serde::Deserialize;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Terminal progress callback: one bar across the batch, per-stage log
/// lines. Works correctly when papers complete out of order (concurrent
/// mode).
struct CliProgressCallback {
    bar: ProgressBar,
    errors: AtomicUsize,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0); // length set in on_run_start
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} papers  ⏱ {elapsed_precise}  {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);
        bar.set_style(style);
        bar.set_prefix("Processing");
        bar.enable_steady_tick(Duration::from_millis(80));
        Arc::new(Self {
            bar,
            errors: AtomicUsize::new(0),
        })
    }
}

impl PipelineProgressCallback for CliProgressCallback {
    fn on_run_start(&self, total_papers: usize) {
        self.bar.set_length(total_papers as u64);
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("Processing {total_papers} papers…"))
        ));
    }

    fn on_stage_start(&self, paper_id: &str, stage: Stage) {
        self.bar.set_message(format!("{paper_id}: {stage}"));
    }

    fn on_stage_complete(&self, paper_id: &str, stage: Stage) {
        self.bar
            .println(format!("  {} {}  {}", green("✓"), paper_id, dim(&stage.to_string())));
    }

    fn on_paper_error(&self, paper_id: &str, stage: Stage, error: &str) {
        self.errors.fetch_add(1, Ordering::SeqCst);
        // Truncate very long error messages to keep output tidy.
        let msg = if error.len() > 80 {
            format!("{}\u{2026}", &error[..79])
        } else {
            error.to_string()
        };
        self.bar
            .println(format!("  {} {}  {}  {}", red("✗"), paper_id, stage, red(&msg)));
    }

    fn on_paper_complete(&self, _paper_id: &str, _failed: bool) {
        self.bar.inc(1);
    }

    fn on_run_complete(&self, total_papers: usize, failed_papers: usize) {
        self.bar.finish_and_clear();
        if failed_papers == 0 {
            eprintln!(
                "{} {} papers processed successfully",
                green("✔"),
                bold(&total_papers.to_string())
            );
        } else {
            eprintln!(
                "{} {}/{} papers processed  ({} failed)",
                if failed_papers == total_papers {
                    red("✘")
                } else {
                    cyan("⚠")
                },
                bold(&(total_papers - failed_papers).to_string()),
                total_papers,
                red(&failed_papers.to_string()),
            );
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Process every pending paper through every remaining stage
  paperpress --all-pending

  # Process one paper end to end
  paperpress 2402.01234

  # Re-run the summary (and everything downstream of it) for one paper
  paperpress --stages summary 2402.01234

  # Rebuild only the markdown artifacts for two papers
  paperpress --stages markdown 2402.01234 1706.03762

  # Register papers from a discovery dump, then process them
  paperpress --import discovered.json --all-pending

  # Inspect a paper's record and stage state (no processing, no API key)
  paperpress --inspect-only 2402.01234

STAGES:
  figures    extract figures from the source document, store the images
  summary    generate the LLM summary (the expensive stage; skipped once
             completed unless explicitly named in --stages)
  markdown   resolve figure references and assemble the final artifact
  info       publish the paper's entry to the site index

  Naming a stage in --stages forces it to re-run and invalidates every
  later stage that consumed its output. '--stages all' only runs what has
  not completed yet.

ENVIRONMENT VARIABLES:
  OPENAI_API_KEY          OpenAI API key
  ANTHROPIC_API_KEY       Anthropic API key
  GEMINI_API_KEY          Google Gemini API key
  EDGEQUAKE_LLM_PROVIDER  Override provider (openai, anthropic, gemini, …)
  EDGEQUAKE_MODEL         Override model ID

SETUP:
  1. Set API key:     export OPENAI_API_KEY=sk-...
  2. Import papers:   paperpress --import discovered.json
  3. Process:         paperpress --all-pending
"#;

/// Process research papers: extract figures, summarize, publish Markdown.
#[derive(Parser, Debug)]
#[command(
    name = "paperpress",
    version,
    about = "Process research papers: extract figures, summarize, publish Markdown",
    long_about = "Drive papers through the resumable processing pipeline \
(figures → summary → markdown → info). Completed stages are skipped, failed \
papers retry from the failed stage on the next run, and naming stages with \
--stages forces selective reprocessing.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Paper ids to process.
    paper_ids: Vec<String>,

    /// Process every paper that has not completed all stages.
    #[arg(long, conflicts_with = "paper_ids")]
    all_pending: bool,

    /// Stage selection: 'all', or a comma list like 'summary,markdown'
    /// (named stages are forced).
    #[arg(long, env = "PAPERPRESS_STAGES", default_value = "all")]
    stages: String,

    /// Register papers from a JSON file (array of {id, title, source_url, …}).
    #[arg(long)]
    import: Option<PathBuf>,

    /// Print a paper's record and stage state, then exit.
    #[arg(long, value_name = "PAPER_ID", conflicts_with_all = ["paper_ids", "all_pending"])]
    inspect_only: Option<String>,

    /// Pipeline working directory.
    #[arg(long, env = "PAPERPRESS_DATA_DIR", default_value = "./data")]
    data_dir: PathBuf,

    /// Remote object-storage endpoint for the primary figure tier.
    #[arg(long, env = "PAPERPRESS_REMOTE_STORE")]
    remote_store: Option<String>,

    /// Public base URL figures are served from.
    #[arg(long, env = "PAPERPRESS_PUBLIC_BASE_URL", default_value = "/")]
    public_base_url: String,

    /// LLM model ID (e.g. gpt-4.1-nano, claude-sonnet-4-20250514).
    #[arg(long, env = "EDGEQUAKE_MODEL")]
    model: Option<String>,

    /// LLM provider: openai, anthropic, gemini, azure, ollama.
    #[arg(long, env = "EDGEQUAKE_PROVIDER")]
    provider: Option<String>,

    /// Papers processed concurrently.
    #[arg(short, long, env = "PAPERPRESS_CONCURRENCY", default_value_t = 4)]
    concurrency: usize,

    /// Max LLM output tokens per summary.
    #[arg(long, env = "PAPERPRESS_MAX_TOKENS", default_value_t = 2048)]
    max_tokens: usize,

    /// LLM temperature (0.0–2.0).
    #[arg(long, env = "PAPERPRESS_TEMPERATURE", default_value_t = 0.3)]
    temperature: f32,

    /// Retries per summary call on transient LLM failure.
    #[arg(long, env = "PAPERPRESS_MAX_RETRIES", default_value_t = 3)]
    max_retries: u32,

    /// Omit YAML front matter from assembled artifacts.
    #[arg(long, env = "PAPERPRESS_NO_FRONT_MATTER")]
    no_front_matter: bool,

    /// Output structured JSON outcomes instead of human-readable text.
    #[arg(long, env = "PAPERPRESS_JSON")]
    json: bool,

    /// Disable the progress bar.
    #[arg(long, env = "PAPERPRESS_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "PAPERPRESS_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "PAPERPRESS_QUIET")]
    quiet: bool,

    /// Source/image download timeout in seconds.
    #[arg(long, env = "PAPERPRESS_DOWNLOAD_TIMEOUT", default_value_t = 120)]
    download_timeout: u64,

    /// Per-summary LLM call timeout in seconds.
    #[arg(long, env = "PAPERPRESS_API_TIMEOUT", default_value_t = 60)]
    api_timeout: u64,
}

/// One row of a discovery dump.
#[derive(Debug, Deserialize)]
struct ImportRecord {
    id: String,
    title: String,
    #[serde(default)]
    authors: Vec<String>,
    #[serde(default, alias = "abstract")]
    abstract_text: String,
    source_url: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // Suppress INFO-level library logs when the progress bar is active;
    // the bar provides all the feedback that matters to the user.
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_writer(io::stderr)
        .init();

    // ── Inspect-only mode (no provider needed) ───────────────────────────
    if let Some(ref paper_id) = cli.inspect_only {
        let config = build_config(&cli, None)?;
        // Inspection never calls the LLM; wire a pipeline without resolving
        // a provider by going through the component constructor is not
        // worth it — instead read the stores directly.
        let records = paperpress::records::JsonRecordStore::open(&config.data_dir)?;
        use paperpress::records::RecordStore;
        let paper = records
            .get(paper_id)
            .await?
            .with_context(|| format!("Unknown paper id '{paper_id}'"))?;
        let stages = paperpress::state::StageStore::open(&config.data_dir)?.load(paper_id)?;

        if cli.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "paper": paper,
                    "stages": stages,
                    "state": stages.state(),
                }))
                .context("Failed to serialise inspection")?
            );
        } else {
            println!("Paper:     {}", paper.id);
            println!("Title:     {}", paper.title);
            if !paper.authors.is_empty() {
                println!("Authors:   {}", paper.authors.join(", "));
            }
            println!("Source:    {}", paper.source_url);
            println!("Figures:   {}", paper.figures.len());
            println!("State:     {:?}", stages.state());
            for stage in Stage::ALL {
                let status = stages.status(stage);
                let mark = if status.completed { green("✓") } else { dim("·") };
                let when = status
                    .completed_at
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_default();
                print!("  {mark} {stage:<9} {}", dim(&when));
                if let Some(err) = &status.last_error {
                    print!("  {}", red(err));
                }
                println!();
            }
        }
        return Ok(());
    }

    // ── Import mode ──────────────────────────────────────────────────────
    let config = build_config(
        &cli,
        show_progress.then(|| CliProgressCallback::new() as ProgressCallback),
    )?;
    let pipeline = Pipeline::new(config).context("Failed to initialise pipeline")?;

    if let Some(ref path) = cli.import {
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read import file {:?}", path))?;
        let records: Vec<ImportRecord> =
            serde_json::from_str(&raw).context("Import file is not a JSON array of papers")?;
        let mut added = 0usize;
        let total = records.len();
        for record in records {
            let mut paper =
                PaperRecord::new(record.id, record.title, record.source_url, Utc::now());
            paper.authors = record.authors;
            paper.abstract_text = record.abstract_text;
            if pipeline.register(paper).await? {
                added += 1;
            }
        }
        if !cli.quiet {
            eprintln!(
                "{} Imported {} new papers ({} already known)",
                green("✔"),
                bold(&added.to_string()),
                total - added,
            );
        }
        if cli.paper_ids.is_empty() && !cli.all_pending {
            return Ok(());
        }
    }

    // ── Select papers ────────────────────────────────────────────────────
    let selection = StageSelection::parse(&cli.stages)?;
    let paper_ids: Vec<String> = if cli.all_pending {
        pipeline.pending_papers().await?
    } else {
        cli.paper_ids.clone()
    };

    if paper_ids.is_empty() {
        if !cli.quiet {
            eprintln!("Nothing to do.");
        }
        return Ok(());
    }

    // ── Run ──────────────────────────────────────────────────────────────
    let results = pipeline.process_many(&paper_ids, &selection).await;

    let mut any_failed = false;
    if cli.json {
        let outcomes: Vec<serde_json::Value> = results
            .iter()
            .map(|(id, result)| match result {
                Ok(outcome) => serde_json::json!({ "paper_id": id, "outcome": outcome }),
                Err(e) => serde_json::json!({ "paper_id": id, "error": e.to_string() }),
            })
            .collect();
        let stdout = io::stdout();
        let mut handle = stdout.lock();
        serde_json::to_writer_pretty(&mut handle, &outcomes)
            .context("Failed to serialise outcomes")?;
        handle.write_all(b"\n").ok();
    }

    for (id, result) in &results {
        match result {
            Ok(outcome) => {
                if outcome.state.is_failed() {
                    any_failed = true;
                }
                if !cli.quiet && !cli.json && !show_progress {
                    eprintln!(
                        "{id}: {:?}  ({} run, {} skipped, {}ms)",
                        outcome.state,
                        outcome.stats.stages_run,
                        outcome.stats.stages_skipped,
                        outcome.stats.total_duration_ms,
                    );
                }
            }
            Err(e) => {
                any_failed = true;
                if !cli.json {
                    eprintln!("{} {id}: {e}", red("✘"));
                }
            }
        }
    }

    if any_failed {
        std::process::exit(1);
    }
    Ok(())
}

/// Map CLI args to `PipelineConfig`.
fn build_config(cli: &Cli, progress: Option<ProgressCallback>) -> Result<PipelineConfig> {
    let mut builder = PipelineConfig::builder()
        .data_dir(&cli.data_dir)
        .public_base_url(&cli.public_base_url)
        .concurrency(cli.concurrency)
        .max_tokens(cli.max_tokens)
        .temperature(cli.temperature)
        .max_retries(cli.max_retries)
        .include_front_matter(!cli.no_front_matter)
        .download_timeout_secs(cli.download_timeout)
        .api_timeout_secs(cli.api_timeout);

    if let Some(ref endpoint) = cli.remote_store {
        builder = builder.remote_store_endpoint(endpoint);
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    let mut config = builder.build().context("Invalid configuration")?;

    // Apply fields the builder doesn't have setters for.
    config.model = cli.model.clone();
    config.provider_name = cli.provider.clone();

    Ok(config)
}
