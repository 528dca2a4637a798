//! # edgequake-intake
//!
//! Document intake and extraction with an exactly-once analysis handoff.
//!
//! A queue delivers "run intake for job J on document D". This crate loads
//! both records, downloads the file, extracts usable text (native text, a
//! vision-LLM OCR pass for scans, or a vision fallback when OCR is not
//! trustworthy), validates it, records the outcome, and hands an
//! [`AnalysisTask`] to the downstream analysis queue.
//!
//! Delivery is at-least-once, so any run may be repeated. The effect is
//! still exactly one analysis task per Job: every state change is
//! checkpointed before it is adopted, a completed extraction is reused on
//! retry, and the handoff is deduplicated by a key derived from the Job id.
//!
//! ## Pipeline Overview
//!
//! ```text
//! JobMessage
//!  │
//!  ├─ 1. Load     Job + Document (repositories)
//!  ├─ 2. Mark     extraction step in_progress (checkpoint)
//!  ├─ 3. Fetch    bytes from object storage (timeout)
//!  ├─ 4. Extract  native │ OCR │ vision fallback (timeout)
//!  ├─ 5. Validate length, garbage ratio, word count
//!  ├─ 6. Persist  Document outcome, then extraction step completed
//!  └─ 7. Handoff  enqueue under "analysis-for-<jobId>" (bounded retry)
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_intake::{
//!     InMemoryAnalysisQueue, InMemoryObjectStorage, InMemoryRepository, JobMessage,
//!     Pipeline, PipelineConfig, StandardEngine,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = PipelineConfig::default();
//!     let repo = Arc::new(InMemoryRepository::new());
//!     let pipeline = Pipeline::new(
//!         Arc::new(InMemoryObjectStorage::new()),
//!         Arc::new(StandardEngine::new(config.extraction.clone())),
//!         repo.clone(),
//!         repo,
//!         Arc::new(InMemoryAnalysisQueue::new()),
//!         config,
//!     );
//!     let summary = pipeline.run(&JobMessage::new("job-1", "doc-1", "free")).await?;
//!     println!("{} characters handed off", summary.text_length);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `intake` binary (clap + anyhow + indicatif + tracing-subscriber) |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod error;
pub mod extract;
pub mod handoff;
pub mod model;
pub mod orchestrator;
pub mod progress;
pub mod prompts;
pub mod repository;
pub mod state;
pub mod storage;
pub mod validation;
pub mod worker;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{ExtractionConfig, PipelineConfig, PipelineConfigBuilder, WorkerConfig};
pub use error::{ErrorCategory, PipelineError, QueueError};
pub use extract::ocr::{OcrBackend, OcrPage, VisionOcr};
pub use extract::{ExtractionEngine, StandardEngine};
pub use handoff::{
    idempotency_key, AnalysisQueue, EnqueueAck, Handoff, InMemoryAnalysisQueue, SpoolQueue,
};
pub use model::{
    AnalysisTask, Document, ExtractionMethod, ExtractionResult, ExtractionStatus, Job, JobMessage,
    JobStatus, OcrMetadata, ProcessingStep, RunSummary, StepName, StepStatus, MESSAGE_VERSION,
};
pub use orchestrator::Pipeline;
pub use progress::{NoopObserver, Observer, PipelineObserver};
pub use repository::{DocumentRepository, InMemoryRepository, JobRepository, JsonFileRepository};
pub use storage::{FsObjectStorage, HttpObjectStorage, InMemoryObjectStorage, ObjectStorage};
pub use validation::{Validation, ValidationPolicy};
pub use worker::{Completed, DeadLetter, Outcome, Worker, WorkerReport};
