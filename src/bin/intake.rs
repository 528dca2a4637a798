//! CLI binary for edgequake-intake.
//!
//! A thin shim over the library crate: it wires a data directory of JSON
//! records, a filesystem (or HTTP) object store and a spool-directory
//! analysis queue into a [`Pipeline`], then runs one message, drains a
//! JSON-lines stream of messages, or prints the state of a job.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use edgequake_intake::{
    Document, DocumentRepository, ErrorCategory, ExtractionConfig, FsObjectStorage,
    HttpObjectStorage, Job, JobMessage, JobRepository, JsonFileRepository, ObjectStorage,
    Pipeline, PipelineConfig, PipelineObserver, RunSummary, SpoolQueue, StandardEngine,
    VisionOcr, WorkerConfig, Worker,
};
use futures::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio_stream::wrappers::LinesStream;
use tracing::warn;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers ──────────────────────────────────────────────────────

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

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() > max {
        let head: String = s.chars().take(max - 1).collect();
        format!("{head}\u{2026}")
    } else {
        s.to_string()
    }
}

// ── CLI observer using indicatif ─────────────────────────────────────────────

/// Spinner plus one log line per settled job. Jobs finish out of order
/// under concurrency, so every line carries its job id.
struct CliObserver {
    bar: ProgressBar,
}

impl CliObserver {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {pos} settled  {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]),
        );
        bar.set_prefix("Intake");
        bar.enable_steady_tick(Duration::from_millis(80));
        Arc::new(Self { bar })
    }

    fn settle(&self) {
        self.bar.inc(1);
    }
}

impl PipelineObserver for CliObserver {
    fn on_job_start(&self, job_id: &str, attempt: u32) {
        if attempt == 1 {
            self.bar.set_message(format!("job {job_id}"));
        } else {
            self.bar.set_message(format!("job {job_id} (attempt {attempt})"));
        }
    }

    fn on_job_complete(&self, job_id: &str, summary: &RunSummary) {
        self.bar.println(format!(
            "  {} {:<24} {:<7} {}{}",
            green("✓"),
            job_id,
            summary.extraction_method.as_str(),
            dim(&format!("{:>6} chars", summary.text_length)),
            if summary.duplicate_enqueue {
                dim("  (already queued)")
            } else {
                String::new()
            },
        ));
        self.settle();
    }

    fn on_job_retry(&self, job_id: &str, attempt: u32, delay: Duration, error: &str) {
        self.bar.println(format!(
            "  {} {:<24} retry {} in {:.1}s  {}",
            cyan("↻"),
            job_id,
            attempt,
            delay.as_secs_f64(),
            dim(&truncate(error, 60)),
        ));
    }

    fn on_job_error(&self, job_id: &str, category: ErrorCategory, error: &str) {
        self.bar.println(format!(
            "  {} {:<24} {:<12} {}",
            red("✗"),
            job_id,
            category.as_str(),
            red(&truncate(error, 80)),
        ));
        self.settle();
    }

    fn on_batch_complete(&self, succeeded: usize, failed: usize) {
        self.bar.finish_and_clear();
        if failed == 0 {
            eprintln!(
                "{} {} job(s) handed off",
                green("✔"),
                bold(&succeeded.to_string())
            );
        } else {
            eprintln!(
                "{} {} handed off, {} dead-lettered",
                if succeeded == 0 { red("✘") } else { cyan("⚠") },
                bold(&succeeded.to_string()),
                red(&failed.to_string()),
            );
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Register an uploaded file (stored under <data-dir>/objects/scans/a.pdf)
  intake register --job job-1 --document doc-1 --storage-key scans/a.pdf \
      --mime-type application/pdf --tier pro

  # Run intake for one job
  intake run --job job-1 --document doc-1 --tier pro

  # Drain a JSON-lines file of {"jobId","documentId","tier"} messages
  intake work messages.jsonl --concurrency 8

  # Inspect a job and its document
  intake status --job job-1

DATA DIRECTORY LAYOUT:
  <data-dir>/records/jobs/<id>.json        Job records
  <data-dir>/records/documents/<id>.json   Document records
  <data-dir>/objects/<storage key>         Uploaded files (unless --storage-url)
  <data-dir>/queues/<queue name>/          Spooled analysis tasks, one per job
  <data-dir>/queues/<queue name>/keys/     Keys already enqueued (never remove)

ENVIRONMENT VARIABLES:
  OPENAI_API_KEY          OpenAI API key (OCR backend)
  ANTHROPIC_API_KEY       Anthropic API key
  EDGEQUAKE_LLM_PROVIDER  Override OCR provider
  EDGEQUAKE_MODEL         Override OCR model
  PDFIUM_LIB_PATH         Directory holding libpdfium
  RUST_LOG                Log filter (overrides --verbose / --quiet)
"#;

/// Document intake: extract text and hand it off to analysis exactly once.
#[derive(Parser, Debug)]
#[command(
    name = "intake",
    version,
    about = "Extract text from uploaded documents and hand it off to analysis exactly once",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct GlobalArgs {
    /// Directory for records, objects and the analysis queue spool.
    #[arg(long, global = true, env = "INTAKE_DATA_DIR", default_value = "intake-data")]
    data_dir: PathBuf,

    /// Fetch objects over HTTP(S) from this base URL instead of <data-dir>/objects.
    #[arg(long, global = true, env = "INTAKE_STORAGE_URL")]
    storage_url: Option<String>,

    /// Public base URL used for vision-fallback image links.
    #[arg(long, global = true, env = "INTAKE_PUBLIC_URL")]
    public_url: Option<String>,

    /// OCR provider: openai, anthropic, gemini, ollama, azure.
    #[arg(long, global = true, env = "INTAKE_OCR_PROVIDER")]
    ocr_provider: Option<String>,

    /// Vision model used for OCR.
    #[arg(long, global = true, env = "INTAKE_OCR_MODEL")]
    ocr_model: Option<String>,

    /// Disable the OCR backend; scanned input goes straight to vision fallback.
    #[arg(long, global = true, env = "INTAKE_NO_OCR")]
    no_ocr: bool,

    /// Directory holding the pdfium shared library.
    #[arg(long, global = true, env = "PDFIUM_LIB_PATH")]
    pdfium_lib_path: Option<PathBuf>,

    /// OCR confidence (0–100) below which vision fallback is used.
    #[arg(long, global = true, env = "INTAKE_OCR_MIN_CONFIDENCE", default_value_t = 60.0)]
    ocr_min_confidence: f32,

    /// Minimum non-whitespace characters for extracted text.
    #[arg(long, global = true, env = "INTAKE_MIN_CHARS", default_value_t = 20)]
    min_chars: usize,

    /// Minimum words for extracted text.
    #[arg(long, global = true, env = "INTAKE_MIN_WORDS", default_value_t = 3)]
    min_words: usize,

    /// Maximum share (0.0–1.0) of garbage characters.
    #[arg(long, global = true, env = "INTAKE_MAX_GARBAGE_RATIO", default_value_t = 0.30)]
    max_garbage_ratio: f32,

    /// Object download timeout in seconds.
    #[arg(long, global = true, env = "INTAKE_DOWNLOAD_TIMEOUT", default_value_t = 120)]
    download_timeout: u64,

    /// Extraction timeout in seconds.
    #[arg(long, global = true, env = "INTAKE_EXTRACTION_TIMEOUT", default_value_t = 300)]
    extraction_timeout: u64,

    /// Enqueue attempts per handoff.
    #[arg(long, global = true, env = "INTAKE_ENQUEUE_ATTEMPTS", default_value_t = 3)]
    enqueue_attempts: u32,

    /// Name of the analysis queue (spool sub-directory).
    #[arg(long, global = true, env = "INTAKE_ANALYSIS_QUEUE", default_value = "document-analysis")]
    analysis_queue: String,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "INTAKE_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, env = "INTAKE_QUIET")]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create Job and Document records for an uploaded file.
    Register {
        #[arg(long)]
        job: String,
        #[arg(long)]
        document: String,
        /// Object storage key of the uploaded file.
        #[arg(long)]
        storage_key: String,
        #[arg(long)]
        mime_type: String,
        #[arg(long, default_value = "free")]
        tier: String,
    },

    /// Run the intake stage for one job.
    Run {
        #[arg(long)]
        job: String,
        #[arg(long)]
        document: String,
        #[arg(long, default_value = "free")]
        tier: String,
    },

    /// Process a JSON-lines stream of job messages (file or stdin).
    Work {
        /// Input file; `-` or absent reads stdin.
        input: Option<PathBuf>,

        /// Jobs processed concurrently.
        #[arg(short, long, env = "INTAKE_CONCURRENCY", default_value_t = 4)]
        concurrency: usize,

        /// Runs per message before dead-lettering.
        #[arg(long, env = "INTAKE_MAX_ATTEMPTS", default_value_t = 3)]
        max_attempts: u32,

        /// Initial retry delay in milliseconds.
        #[arg(long, env = "INTAKE_RETRY_BACKOFF_MS", default_value_t = 1000)]
        retry_backoff_ms: u64,

        /// Print the full worker report as JSON on stdout.
        #[arg(long)]
        json: bool,

        /// Disable the progress spinner.
        #[arg(long, env = "INTAKE_NO_PROGRESS")]
        no_progress: bool,
    },

    /// Print a job and its document as JSON.
    Status {
        #[arg(long)]
        job: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let g = &cli.global;

    // The spinner gives the feedback that matters during `work`; keep
    // library logs quiet unless asked for.
    let spinner = matches!(cli.command, Command::Work { no_progress: false, json: false, .. })
        && !g.quiet;
    let filter = if g.verbose {
        "debug"
    } else if g.quiet || spinner {
        "error"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let records = Arc::new(JsonFileRepository::new(g.data_dir.join("records")));

    match &cli.command {
        Command::Register {
            job,
            document,
            storage_key,
            mime_type,
            tier,
        } => {
            let doc = Document::new(document.as_str(), storage_key.as_str(), mime_type.as_str());
            let record = Job::new(job.as_str(), document.as_str(), tier.as_str());
            records
                .save_document(&doc)
                .await
                .context("Failed to write document record")?;
            records
                .save_job(&record)
                .await
                .context("Failed to write job record")?;
            let message = JobMessage::new(job.as_str(), document.as_str(), tier.as_str());
            println!(
                "{}",
                serde_json::to_string(&message).context("Failed to serialise message")?
            );
        }

        Command::Run {
            job,
            document,
            tier,
        } => {
            let pipeline = build_pipeline(g, Arc::clone(&records))?;
            let message = JobMessage::new(job.as_str(), document.as_str(), tier.as_str());
            let summary = pipeline.run(&message).await.context("Intake run failed")?;
            println!(
                "{}",
                serde_json::to_string_pretty(&summary).context("Failed to serialise summary")?
            );
        }

        Command::Work {
            input,
            concurrency,
            max_attempts,
            retry_backoff_ms,
            json,
            ..
        } => {
            let pipeline = Arc::new(build_pipeline(g, Arc::clone(&records))?);
            let config = WorkerConfig {
                concurrency: *concurrency,
                max_attempts: *max_attempts,
                retry_backoff_ms: *retry_backoff_ms,
            };
            let mut worker = Worker::new(pipeline, config);
            if spinner {
                worker = worker.with_observer(CliObserver::new());
            }

            let reader = open_input(input.as_deref()).await?;
            let rejected = Arc::new(AtomicUsize::new(0));
            let counter = Arc::clone(&rejected);
            let messages = LinesStream::new(reader.lines()).filter_map(move |line| {
                let counter = Arc::clone(&counter);
                async move { parse_message(line, &counter) }
            });

            let report = worker.run(messages).await;

            if *json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&report).context("Failed to serialise report")?
                );
            } else if !g.quiet && !spinner {
                eprintln!(
                    "Handed off {} job(s), dead-lettered {}",
                    report.succeeded(),
                    report.failed()
                );
            }

            let rejected = rejected.load(Ordering::SeqCst);
            if rejected > 0 {
                eprintln!("{} {} unparseable line(s) skipped", cyan("⚠"), rejected);
            }
            if report.failed() > 0 {
                anyhow::bail!("{} message(s) dead-lettered", report.failed());
            }
        }

        Command::Status { job } => {
            let record = records
                .find_job(job)
                .await
                .context("Failed to read job record")?
                .with_context(|| format!("Job '{job}' not found"))?;
            let document = records
                .find_document(&record.document_id)
                .await
                .context("Failed to read document record")?;
            let status = serde_json::json!({ "job": record, "document": document });
            println!(
                "{}",
                serde_json::to_string_pretty(&status).context("Failed to serialise status")?
            );
        }
    }

    Ok(())
}

/// Map CLI args to `PipelineConfig`.
fn build_config(g: &GlobalArgs) -> Result<PipelineConfig> {
    let extraction = ExtractionConfig {
        ocr_min_confidence: g.ocr_min_confidence,
        pdfium_lib_path: g.pdfium_lib_path.clone(),
        ocr_provider: g.ocr_provider.clone(),
        ocr_model: g.ocr_model.clone(),
        ..Default::default()
    };
    PipelineConfig::builder()
        .min_chars(g.min_chars)
        .min_words(g.min_words)
        .max_garbage_ratio(g.max_garbage_ratio)
        .download_timeout_secs(g.download_timeout)
        .extraction_timeout_secs(g.extraction_timeout)
        .enqueue_max_attempts(g.enqueue_attempts)
        .analysis_queue(g.analysis_queue.as_str())
        .extraction(extraction)
        .build()
        .context("Invalid configuration")
}

fn build_pipeline(g: &GlobalArgs, records: Arc<JsonFileRepository>) -> Result<Pipeline> {
    let config = build_config(g)?;

    let storage: Arc<dyn ObjectStorage> = match g.storage_url {
        Some(ref url) => {
            let mut http = HttpObjectStorage::new(url.as_str(), config.download_timeout_secs)
                .context("Invalid storage URL")?;
            if let Some(ref public) = g.public_url {
                http = http.with_public_base_url(public.as_str());
            }
            Arc::new(http)
        }
        None => {
            let mut fs = FsObjectStorage::new(g.data_dir.join("objects"));
            if let Some(ref public) = g.public_url {
                fs = fs.with_public_base_url(public.as_str());
            }
            Arc::new(fs)
        }
    };

    let mut engine = StandardEngine::new(config.extraction.clone());
    if !g.no_ocr {
        match VisionOcr::from_config(&config.extraction) {
            Ok(ocr) => engine = engine.with_ocr(Arc::new(ocr)),
            Err(e) => warn!("OCR disabled, scanned input will use vision fallback: {}", e),
        }
    }

    let queue = SpoolQueue::new(g.data_dir.join("queues").join(&config.analysis_queue));

    Ok(Pipeline::new(
        storage,
        Arc::new(engine),
        records.clone(),
        records,
        Arc::new(queue),
        config,
    ))
}

async fn open_input(path: Option<&Path>) -> Result<Box<dyn AsyncBufRead + Unpin + Send>> {
    match path {
        Some(p) if p != Path::new("-") => {
            let file = tokio::fs::File::open(p)
                .await
                .with_context(|| format!("Failed to open {}", p.display()))?;
            Ok(Box::new(BufReader::new(file)))
        }
        _ => Ok(Box::new(BufReader::new(tokio::io::stdin()))),
    }
}

fn parse_message(line: io::Result<String>, rejected: &AtomicUsize) -> Option<JobMessage> {
    let line = match line {
        Ok(l) => l,
        Err(e) => {
            warn!("Failed to read message line: {}", e);
            rejected.fetch_add(1, Ordering::SeqCst);
            return None;
        }
    };
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return None;
    }
    match serde_json::from_str::<JobMessage>(trimmed) {
        Ok(message) => Some(message),
        Err(e) => {
            warn!("Skipping unparseable message: {}", e);
            rejected.fetch_add(1, Ordering::SeqCst);
            None
        }
    }
}
