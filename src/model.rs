//! Records and messages that flow through the intake pipeline.
//!
//! [`Job`] and [`Document`] are persisted between steps; [`ExtractionResult`]
//! is transient engine output; [`JobMessage`] and [`AnalysisTask`] are the two
//! wire contracts (inbound and outbound) and carry a `version` field.
//!
//! State changes on `Job` and `Document` live in [`crate::state`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Current version of [`JobMessage`] and [`AnalysisTask`].
pub const MESSAGE_VERSION: u32 = 1;

fn default_version() -> u32 {
    MESSAGE_VERSION
}

pub(crate) fn current_timestamp_ms() -> i64 {
    let since_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    since_epoch.as_millis() as i64
}

// ── Job ──────────────────────────────────────────────────────────────────

/// Overall lifecycle of a Job within this stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Queued,
    Processing,
    Failed,
    /// Extraction done and analysis handed off. Downstream analysis
    /// tracks its own status.
    StageCompleted,
}

/// A named, independently tracked phase of a Job.
///
/// Declaration order is pipeline order, which is also the order of
/// [`Job::processing_steps`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepName {
    Extraction,
    Handoff,
}

impl StepName {
    pub fn as_str(self) -> &'static str {
        match self {
            StepName::Extraction => "extraction",
            StepName::Handoff => "handoff",
        }
    }
}

impl fmt::Display for StepName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a single processing step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    NotStarted,
    InProgress,
    Completed,
    Failed,
}

impl StepStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::NotStarted => "not_started",
            StepStatus::InProgress => "in_progress",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, StepStatus::Completed | StepStatus::Failed)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted state of one step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingStep {
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<i64>,
}

/// A unit of intake work for one Document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub document_id: String,
    /// Service level, opaque to this subsystem.
    pub tier: String,
    #[serde(default)]
    pub status: JobStatus,
    #[serde(default)]
    pub processing_steps: BTreeMap<StepName, ProcessingStep>,
    /// Number of pipeline runs started for this Job.
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Job {
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        document_id: impl Into<String>,
        tier: impl Into<String>,
    ) -> Self {
        let now = current_timestamp_ms();
        Self {
            id: id.into(),
            document_id: document_id.into(),
            tier: tier.into(),
            status: JobStatus::Queued,
            processing_steps: BTreeMap::new(),
            attempts: 0,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Status of `step`; steps never touched read as `NotStarted`.
    pub fn step_status(&self, step: StepName) -> StepStatus {
        self.processing_steps
            .get(&step)
            .map(|s| s.status)
            .unwrap_or_default()
    }

    pub fn step(&self, step: StepName) -> Option<&ProcessingStep> {
        self.processing_steps.get(&step)
    }
}

// ── Document ─────────────────────────────────────────────────────────────

/// Extraction progress of a Document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
    /// Flagged as needing OCR before extraction started (e.g. by upload sniffing).
    OcrRequired,
    /// Completed via the OCR path.
    OcrCompleted,
}

/// Which strategy produced the extracted text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMethod {
    /// Text layer read directly from the file.
    Native,
    /// Page images transcribed by an OCR backend.
    Ocr,
    /// OCR unusable; downstream analysis reads the image itself.
    Vision,
}

impl ExtractionMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            ExtractionMethod::Native => "native",
            ExtractionMethod::Ocr => "ocr",
            ExtractionMethod::Vision => "vision",
        }
    }
}

impl fmt::Display for ExtractionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Details of an OCR pass, recorded on the Document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OcrMetadata {
    pub engine: String,
    pub language: String,
    /// Milliseconds spent in the extraction engine.
    pub processing_time: u64,
    #[serde(default)]
    pub warnings: Vec<String>,
}

/// An uploaded file and what has been extracted from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub id: String,
    pub storage_key: String,
    pub mime_type: String,
    /// Set if and only if the Job's `extraction` step is `completed`.
    #[serde(default)]
    pub extracted_text: Option<String>,
    #[serde(default)]
    pub extraction_status: ExtractionStatus,
    #[serde(default)]
    pub extraction_method: Option<ExtractionMethod>,
    /// The extraction engine reported that the text came from OCR.
    #[serde(default)]
    pub ocr_required: bool,
    /// 0–100, present only when the OCR path was taken and measured one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ocr_confidence: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ocr_metadata: Option<OcrMetadata>,
    /// Analysis must read the image rather than the text.
    #[serde(default)]
    pub vision_fallback: bool,
    pub updated_at: i64,
}

impl Document {
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        storage_key: impl Into<String>,
        mime_type: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            storage_key: storage_key.into(),
            mime_type: mime_type.into(),
            extracted_text: None,
            extraction_status: ExtractionStatus::Pending,
            extraction_method: None,
            ocr_required: false,
            ocr_confidence: None,
            ocr_metadata: None,
            vision_fallback: false,
            updated_at: current_timestamp_ms(),
        }
    }
}

// ── Extraction engine output ─────────────────────────────────────────────

/// What the extraction engine returns for one file. Never persisted as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionResult {
    pub text: String,
    pub ocr_required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ocr_confidence: Option<f32>,
    pub method: ExtractionMethod,
    /// Milliseconds.
    pub processing_time: u64,
    #[serde(default)]
    pub warnings: Vec<String>,
    pub fallback_to_vision: bool,
}

impl ExtractionResult {
    /// A plain native-text result.
    pub fn native(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ocr_required: false,
            ocr_confidence: None,
            method: ExtractionMethod::Native,
            processing_time: 0,
            warnings: Vec::new(),
            fallback_to_vision: false,
        }
    }

    /// An OCR result with the given confidence (0–100).
    pub fn ocr(text: impl Into<String>, confidence: f32) -> Self {
        Self {
            text: text.into(),
            ocr_required: true,
            ocr_confidence: Some(confidence.clamp(0.0, 100.0)),
            method: ExtractionMethod::Ocr,
            processing_time: 0,
            warnings: Vec::new(),
            fallback_to_vision: false,
        }
    }

    /// Mark this result as unusable as text; analysis must read the image.
    pub fn with_vision_fallback(mut self) -> Self {
        self.fallback_to_vision = true;
        self.method = ExtractionMethod::Vision;
        self
    }

    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }

    pub fn with_processing_time(mut self, ms: u64) -> Self {
        self.processing_time = ms;
        self
    }
}

// ── Wire contracts ───────────────────────────────────────────────────────

/// Inbound message: "run intake for this job".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobMessage {
    #[serde(default = "default_version")]
    pub version: u32,
    pub job_id: String,
    pub document_id: String,
    pub tier: String,
}

impl JobMessage {
    pub fn new(
        job_id: impl Into<String>,
        document_id: impl Into<String>,
        tier: impl Into<String>,
    ) -> Self {
        Self {
            version: MESSAGE_VERSION,
            job_id: job_id.into(),
            document_id: document_id.into(),
            tier: tier.into(),
        }
    }
}

/// Outbound message: the downstream analysis task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisTask {
    #[serde(default = "default_version")]
    pub version: u32,
    pub job_id: String,
    pub document_id: String,
    /// Extracted text, or the vision placeholder instruction when the
    /// text is empty under vision fallback.
    pub extracted_text: String,
    pub tier: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ocr_confidence: Option<f32>,
    pub extraction_method: ExtractionMethod,
    /// Present only under vision fallback.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}

/// Success summary of one pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub success: bool,
    /// Character count of the extracted text (0 for an empty vision fallback).
    pub text_length: usize,
    pub ocr_required: bool,
    pub extraction_method: ExtractionMethod,
    pub idempotency_key: String,
    /// The queue already held a task under this key.
    pub duplicate_enqueue: bool,
    /// Extraction was skipped because a previous run already completed it.
    pub resumed: bool,
}
