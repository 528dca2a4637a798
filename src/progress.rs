//! Observer trait for per-job worker events.
//!
//! Pass an [`Arc<dyn PipelineObserver>`] to [`crate::worker::Worker`] to
//! receive events as messages are processed. Callers forward them to a
//! progress bar, a metrics sink or a log; the library does not care.
//!
//! # Example
//!
//! ```rust
//! use edgequake_intake::{PipelineObserver, RunSummary};
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! #[derive(Default)]
//! struct Counter {
//!     done: AtomicUsize,
//! }
//!
//! impl PipelineObserver for Counter {
//!     fn on_job_complete(&self, job_id: &str, summary: &RunSummary) {
//!         self.done.fetch_add(1, Ordering::SeqCst);
//!         eprintln!("{job_id}: {} chars", summary.text_length);
//!     }
//! }
//! ```

use crate::error::ErrorCategory;
use crate::model::RunSummary;
use std::sync::Arc;
use std::time::Duration;

/// Called by the worker as it processes messages.
///
/// Messages run concurrently, so every method may be called from several
/// tasks at once; protect shared state with atomics or a `Mutex`. All
/// methods default to no-ops.
pub trait PipelineObserver: Send + Sync {
    /// A run for `job_id` is starting. `attempt` is 1-based.
    fn on_job_start(&self, job_id: &str, attempt: u32) {
        let _ = (job_id, attempt);
    }

    /// The stage completed and the analysis task was handed off.
    fn on_job_complete(&self, job_id: &str, summary: &RunSummary) {
        let _ = (job_id, summary);
    }

    /// A retryable failure; the message runs again after `delay`.
    fn on_job_retry(&self, job_id: &str, attempt: u32, delay: Duration, error: &str) {
        let _ = (job_id, attempt, delay, error);
    }

    /// The message is given up on and dead-lettered.
    fn on_job_error(&self, job_id: &str, category: ErrorCategory, error: &str) {
        let _ = (job_id, category, error);
    }

    /// Every message from the stream has been settled.
    fn on_batch_complete(&self, succeeded: usize, failed: usize) {
        let _ = (succeeded, failed);
    }
}

/// Observer that ignores every event.
pub struct NoopObserver;

impl PipelineObserver for NoopObserver {}

pub type Observer = Arc<dyn PipelineObserver>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ExtractionMethod;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Tracking {
        starts: AtomicUsize,
        completes: AtomicUsize,
        retries: AtomicUsize,
        errors: AtomicUsize,
    }

    impl PipelineObserver for Tracking {
        fn on_job_start(&self, _job_id: &str, _attempt: u32) {
            self.starts.fetch_add(1, Ordering::SeqCst);
        }

        fn on_job_complete(&self, _job_id: &str, _summary: &RunSummary) {
            self.completes.fetch_add(1, Ordering::SeqCst);
        }

        fn on_job_retry(&self, _job_id: &str, _attempt: u32, _delay: Duration, _error: &str) {
            self.retries.fetch_add(1, Ordering::SeqCst);
        }

        fn on_job_error(&self, _job_id: &str, _category: ErrorCategory, _error: &str) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn summary() -> RunSummary {
        RunSummary {
            success: true,
            text_length: 10,
            ocr_required: false,
            extraction_method: ExtractionMethod::Native,
            idempotency_key: "analysis-for-j".into(),
            duplicate_enqueue: false,
            resumed: false,
        }
    }

    #[test]
    fn noop_observer_does_not_panic() {
        let obs: Observer = Arc::new(NoopObserver);
        obs.on_job_start("j", 1);
        obs.on_job_complete("j", &summary());
        obs.on_job_retry("j", 2, Duration::from_millis(5), "storage down");
        obs.on_job_error("j", ErrorCategory::Validation, "empty");
        obs.on_batch_complete(1, 1);
    }

    #[test]
    fn tracking_observer_receives_events() {
        let t = Tracking::default();
        t.on_job_start("a", 1);
        t.on_job_retry("a", 2, Duration::ZERO, "timeout");
        t.on_job_start("a", 2);
        t.on_job_complete("a", &summary());
        t.on_job_start("b", 1);
        t.on_job_error("b", ErrorCategory::NotFound, "missing");

        assert_eq!(t.starts.load(Ordering::SeqCst), 3);
        assert_eq!(t.retries.load(Ordering::SeqCst), 1);
        assert_eq!(t.completes.load(Ordering::SeqCst), 1);
        assert_eq!(t.errors.load(Ordering::SeqCst), 1);
    }
}
