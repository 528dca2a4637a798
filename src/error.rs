//! Error types for the edgequake-intake library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`PipelineError`]: fatal for this run. The pipeline stage cannot
//!   finish (job missing, text rejected, storage down, enqueue exhausted).
//!   Returned as `Err(PipelineError)` from [`crate::Pipeline::run`] after the
//!   failure has been recorded on the Job.
//!
//! * [`QueueError`]: non-fatal. A single enqueue attempt failed. The
//!   handoff retries transient ones and only surfaces the last as
//!   [`PipelineError::EnqueueFailed`] once its attempt budget is spent.
//!
//! Every [`PipelineError`] maps to an [`ErrorCategory`] so the outer queue can
//! decide on retry or dead-lettering without parsing messages.

use crate::model::{StepName, StepStatus};
use thiserror::Error;

/// Coarse error classes used by retry policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Job or Document missing. Retrying cannot change the outcome.
    NotFound,
    /// The input itself is unusable (rejected text, unsupported or corrupt file).
    Validation,
    /// Storage, extraction engine or persistence hiccup. Safe to re-run the stage.
    TransientIo,
    /// The analysis handoff exhausted its own attempt budget.
    Enqueue,
    /// Programming or configuration error (illegal transition, bad config).
    Internal,
}

impl ErrorCategory {
    /// Whether re-running the whole stage may succeed.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorCategory::TransientIo | ErrorCategory::Enqueue)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCategory::NotFound => "not_found",
            ErrorCategory::Validation => "validation",
            ErrorCategory::TransientIo => "transient_io",
            ErrorCategory::Enqueue => "enqueue",
            ErrorCategory::Internal => "internal",
        }
    }
}

/// All fatal errors returned by a pipeline run.
#[derive(Debug, Error)]
pub enum PipelineError {
    // ── Lookup errors ─────────────────────────────────────────────────────
    /// No Job record with this id.
    #[error("Job '{job_id}' not found")]
    JobNotFound { job_id: String },

    /// No Document record with this id.
    #[error("Document '{document_id}' not found")]
    DocumentNotFound { document_id: String },

    // ── Input errors ──────────────────────────────────────────────────────
    /// Extracted text was rejected by the validation policy.
    #[error("Extracted text rejected: {reason}")]
    Validation { reason: String },

    /// No extraction strategy handles this MIME type.
    #[error("Unsupported MIME type '{mime_type}'")]
    UnsupportedMimeType { mime_type: String },

    /// The file was downloaded but cannot be parsed (corrupt or encrypted).
    #[error("Document is unreadable: {detail}")]
    UnreadableDocument { detail: String },

    /// Storage key escapes the storage root or is empty.
    #[error("Invalid storage key '{key}'")]
    InvalidStorageKey { key: String },

    /// A Job or Document id that cannot name a stored record.
    #[error("Invalid record id '{id}'")]
    InvalidRecordId { id: String },

    // ── Storage errors ────────────────────────────────────────────────────
    /// Object storage download exceeded the configured timeout.
    #[error("Download of '{key}' timed out after {secs}s")]
    StorageTimeout { key: String, secs: u64 },

    /// Object storage download failed for another reason.
    #[error("Failed to download '{key}': {reason}")]
    StorageFailed { key: String, reason: String },

    // ── Extraction errors ─────────────────────────────────────────────────
    /// The extraction engine did not answer in time.
    #[error("Extraction timed out after {secs}s")]
    ExtractionTimeout { secs: u64 },

    /// The extraction engine failed (pdfium binding, OCR provider, task panic).
    #[error("Extraction failed: {reason}")]
    ExtractionFailed { reason: String },

    // ── Persistence errors ────────────────────────────────────────────────
    /// A Job or Document write or read failed.
    #[error("Persistence error: {reason}")]
    Persistence { reason: String },

    // ── Handoff errors ────────────────────────────────────────────────────
    /// Every enqueue attempt for this key failed.
    #[error("Enqueue of '{key}' failed after {attempts} attempt(s): {reason}")]
    EnqueueFailed {
        key: String,
        attempts: u32,
        reason: String,
    },

    // ── Internal errors ───────────────────────────────────────────────────
    /// A processing step was asked to make an illegal move.
    #[error("Illegal transition for step '{step}': {from} -> {to}")]
    InvalidTransition {
        step: StepName,
        from: StepStatus,
        to: StepStatus,
    },

    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// Classify this error for the outer retry policy.
    pub fn category(&self) -> ErrorCategory {
        match self {
            PipelineError::JobNotFound { .. } | PipelineError::DocumentNotFound { .. } => {
                ErrorCategory::NotFound
            }
            PipelineError::Validation { .. }
            | PipelineError::UnsupportedMimeType { .. }
            | PipelineError::UnreadableDocument { .. }
            | PipelineError::InvalidStorageKey { .. }
            | PipelineError::InvalidRecordId { .. } => ErrorCategory::Validation,
            PipelineError::StorageTimeout { .. }
            | PipelineError::StorageFailed { .. }
            | PipelineError::ExtractionTimeout { .. }
            | PipelineError::ExtractionFailed { .. }
            | PipelineError::Persistence { .. } => ErrorCategory::TransientIo,
            PipelineError::EnqueueFailed { .. } => ErrorCategory::Enqueue,
            PipelineError::InvalidTransition { .. }
            | PipelineError::InvalidConfig(_)
            | PipelineError::Internal(_) => ErrorCategory::Internal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.category().is_retryable()
    }

    pub(crate) fn persistence(e: impl std::fmt::Display) -> Self {
        PipelineError::Persistence {
            reason: e.to_string(),
        }
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(e: serde_json::Error) -> Self {
        PipelineError::persistence(format!("serialisation: {e}"))
    }
}

/// A single failed enqueue attempt.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueueError {
    /// Broker unreachable or overloaded.
    #[error("queue unavailable: {0}")]
    Unavailable(String),

    /// Broker did not acknowledge in time.
    #[error("queue timed out after {ms}ms")]
    Timeout { ms: u64 },

    /// Broker refused the message; retrying will not help.
    #[error("queue rejected message: {0}")]
    Rejected(String),
}

impl QueueError {
    pub fn is_transient(&self) -> bool {
        !matches!(self, QueueError::Rejected(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_timeout_display_mentions_timeout() {
        let e = PipelineError::StorageTimeout {
            key: "uploads/a.pdf".into(),
            secs: 30,
        };
        let msg = e.to_string();
        assert!(msg.contains("timed out"), "got: {msg}");
        assert!(msg.contains("uploads/a.pdf"));
    }

    #[test]
    fn categories_split_fatal_from_transient() {
        let not_found = PipelineError::JobNotFound { job_id: "j".into() };
        assert_eq!(not_found.category(), ErrorCategory::NotFound);
        assert!(!not_found.is_retryable());

        let rejected = PipelineError::Validation {
            reason: "too short".into(),
        };
        assert_eq!(rejected.category(), ErrorCategory::Validation);
        assert!(!rejected.is_retryable());

        let io = PipelineError::Persistence {
            reason: "disk full".into(),
        };
        assert!(io.is_retryable());

        let enqueue = PipelineError::EnqueueFailed {
            key: "analysis-for-j".into(),
            attempts: 3,
            reason: "down".into(),
        };
        assert_eq!(enqueue.category(), ErrorCategory::Enqueue);
        assert!(enqueue.is_retryable());
    }

    #[test]
    fn invalid_transition_display() {
        let e = PipelineError::InvalidTransition {
            step: StepName::Extraction,
            from: StepStatus::NotStarted,
            to: StepStatus::Completed,
        };
        assert_eq!(
            e.to_string(),
            "Illegal transition for step 'extraction': not_started -> completed"
        );
        assert_eq!(e.category(), ErrorCategory::Internal);
    }

    #[test]
    fn rejected_queue_error_is_permanent() {
        assert!(!QueueError::Rejected("schema".into()).is_transient());
        assert!(QueueError::Timeout { ms: 100 }.is_transient());
        assert!(QueueError::Unavailable("503".into()).is_transient());
    }
}
