//! State Transition Manager.
//!
//! Every change to a [`Job`] or [`Document`] goes through a function here
//! that takes the current state by reference and returns the next state.
//! Nothing in this module performs I/O: the orchestrator persists the
//! returned value and only then adopts it, so the state machine can be
//! tested without storage and a crash always leaves the last committed
//! state on disk.
//!
//! ```text
//! step:  not_started ──▶ in_progress ──▶ completed
//!                         ▲    │
//!                         │    └───────▶ failed
//!                         └── (retry from failed, completed or a crashed in_progress)
//! ```
//!
//! No transition skips `in_progress`. Failing a step that never started
//! ([`Job::abort_step`]) records the start and the failure in one write.

use crate::error::PipelineError;
use crate::model::{
    current_timestamp_ms, Document, ExtractionMethod, ExtractionStatus, Job, JobStatus,
    OcrMetadata, ProcessingStep, StepName, StepStatus,
};

/// Whether a step may move from `from` to `to`.
///
/// Re-entering `in_progress` is allowed from every state: a retried run
/// reclaims a step left `in_progress` by a crashed worker, or redoes a
/// `failed` or `completed` one.
pub fn can_transition(from: StepStatus, to: StepStatus) -> bool {
    use StepStatus::*;
    match (from, to) {
        (_, InProgress) => true,
        (InProgress, Completed) | (InProgress, Failed) => true,
        _ => false,
    }
}

impl Job {
    /// Move `step` to `to`, stamping times and the error message.
    pub fn transition_step(
        &self,
        step: StepName,
        to: StepStatus,
        error: Option<String>,
        now_ms: i64,
    ) -> Result<Job, PipelineError> {
        let from = self.step_status(step);
        if !can_transition(from, to) {
            return Err(PipelineError::InvalidTransition { step, from, to });
        }

        let mut next = self.clone();
        let entry = next.processing_steps.entry(step).or_default();
        entry.status = to;
        match to {
            StepStatus::InProgress => {
                entry.started_at = Some(now_ms);
                entry.finished_at = None;
                entry.error_message = None;
            }
            StepStatus::Completed => {
                entry.finished_at = Some(now_ms);
                entry.error_message = None;
            }
            StepStatus::Failed => {
                entry.finished_at = Some(now_ms);
                entry.error_message = error;
            }
            StepStatus::NotStarted => {}
        }
        next.updated_at = now_ms;
        Ok(next)
    }

    pub fn start_step(&self, step: StepName) -> Result<Job, PipelineError> {
        self.transition_step(step, StepStatus::InProgress, None, current_timestamp_ms())
    }

    pub fn complete_step(&self, step: StepName) -> Result<Job, PipelineError> {
        self.transition_step(step, StepStatus::Completed, None, current_timestamp_ms())
    }

    pub fn fail_step(&self, step: StepName, error: impl Into<String>) -> Result<Job, PipelineError> {
        self.transition_step(
            step,
            StepStatus::Failed,
            Some(error.into()),
            current_timestamp_ms(),
        )
    }

    /// Fail `step` whatever its current state.
    ///
    /// A step that is not `in_progress` is opened first, so the recorded
    /// history still passes through `in_progress`. A step already
    /// `completed` is left untouched: its work is durable.
    pub fn abort_step(&self, step: StepName, error: impl Into<String>) -> Job {
        let now = current_timestamp_ms();
        let error = error.into();
        match self.step_status(step) {
            StepStatus::Completed => self.clone(),
            StepStatus::InProgress => self.force_failed(step, error, now),
            StepStatus::NotStarted | StepStatus::Failed => {
                let mut next = self.clone();
                next.processing_steps.insert(
                    step,
                    ProcessingStep {
                        status: StepStatus::InProgress,
                        error_message: None,
                        started_at: Some(now),
                        finished_at: None,
                    },
                );
                next.force_failed(step, error, now)
            }
        }
    }

    fn force_failed(&self, step: StepName, error: String, now: i64) -> Job {
        let mut next = self.clone();
        let entry = next.processing_steps.entry(step).or_default();
        entry.status = StepStatus::Failed;
        entry.error_message = Some(error);
        entry.finished_at = Some(now);
        next.updated_at = now;
        next
    }

    /// Enter `processing` for a new run and count the attempt.
    #[must_use]
    pub fn begin_run(&self) -> Job {
        let mut next = self.clone();
        next.status = JobStatus::Processing;
        next.attempts = next.attempts.saturating_add(1);
        next.error = None;
        next.updated_at = current_timestamp_ms();
        next
    }

    /// Finish the stage after a confirmed handoff.
    pub fn finish_stage(&self) -> Result<Job, PipelineError> {
        for step in [StepName::Extraction, StepName::Handoff] {
            if self.step_status(step) != StepStatus::Completed {
                return Err(PipelineError::Internal(format!(
                    "cannot complete stage for job '{}': step '{}' is {}",
                    self.id,
                    step,
                    self.step_status(step)
                )));
            }
        }
        let mut next = self.clone();
        next.status = JobStatus::StageCompleted;
        next.error = None;
        next.updated_at = current_timestamp_ms();
        Ok(next)
    }

    /// Mark the whole Job failed, recording the error on `step` as well.
    #[must_use]
    pub fn fail_run(&self, step: StepName, error: impl Into<String>) -> Job {
        let error = error.into();
        let mut next = self.abort_step(step, error.clone());
        next.status = JobStatus::Failed;
        next.error = Some(error);
        next
    }
}

impl Document {
    /// Clear any previous result and mark extraction under way.
    #[must_use]
    pub fn begin_extraction(&self) -> Document {
        let mut next = self.clone();
        next.extracted_text = None;
        next.extraction_status = ExtractionStatus::InProgress;
        next.extraction_method = None;
        next.ocr_required = false;
        next.ocr_confidence = None;
        next.ocr_metadata = None;
        next.vision_fallback = false;
        next.updated_at = current_timestamp_ms();
        next
    }

    /// Record text read directly from the file.
    pub fn complete_native(&self, text: impl Into<String>) -> Result<Document, PipelineError> {
        self.ensure_extracting("complete_native")?;
        let mut next = self.clone();
        next.extracted_text = Some(text.into());
        next.extraction_status = ExtractionStatus::Completed;
        next.extraction_method = Some(ExtractionMethod::Native);
        next.ocr_required = false;
        next.ocr_confidence = None;
        next.ocr_metadata = None;
        next.vision_fallback = false;
        next.updated_at = current_timestamp_ms();
        Ok(next)
    }

    /// Record text that came with engine metadata: an OCR pass, a vision
    /// fallback, or both.
    ///
    /// The status is `ocr_completed` only when `ocr_required` is set; a
    /// fallback over native text completes as `completed`. A confidence
    /// the engine did not measure stays `None`.
    pub fn complete_ocr(
        &self,
        text: impl Into<String>,
        confidence: Option<f32>,
        metadata: OcrMetadata,
        method: ExtractionMethod,
        ocr_required: bool,
        vision_fallback: bool,
    ) -> Result<Document, PipelineError> {
        self.ensure_extracting("complete_ocr")?;
        let mut next = self.clone();
        next.extracted_text = Some(text.into());
        next.extraction_status = if ocr_required {
            ExtractionStatus::OcrCompleted
        } else {
            ExtractionStatus::Completed
        };
        next.extraction_method = Some(method);
        next.ocr_required = ocr_required;
        next.ocr_confidence = confidence.map(|c| c.clamp(0.0, 100.0));
        next.ocr_metadata = Some(metadata);
        next.vision_fallback = vision_fallback;
        next.updated_at = current_timestamp_ms();
        Ok(next)
    }

    /// Extraction failed; no text survives.
    #[must_use]
    pub fn fail_extraction(&self) -> Document {
        let mut next = self.clone();
        next.extracted_text = None;
        next.extraction_status = ExtractionStatus::Failed;
        next.updated_at = current_timestamp_ms();
        next
    }

    /// Extraction finished in a previous run and its text is on record.
    pub fn has_completed_extraction(&self) -> bool {
        self.extracted_text.is_some()
            && matches!(
                self.extraction_status,
                ExtractionStatus::Completed | ExtractionStatus::OcrCompleted
            )
    }

    fn ensure_extracting(&self, op: &str) -> Result<(), PipelineError> {
        match self.extraction_status {
            ExtractionStatus::InProgress | ExtractionStatus::OcrRequired => Ok(()),
            other => Err(PipelineError::Internal(format!(
                "{op} on document '{}' in state {:?}",
                self.id, other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> Job {
        Job::new("job-1", "doc-1", "standard")
    }

    fn doc() -> Document {
        Document::new("doc-1", "uploads/doc-1.pdf", "application/pdf")
    }

    #[test]
    fn transition_table() {
        use StepStatus::*;
        assert!(can_transition(NotStarted, InProgress));
        assert!(can_transition(InProgress, Completed));
        assert!(can_transition(InProgress, Failed));
        assert!(can_transition(Failed, InProgress));
        assert!(can_transition(InProgress, InProgress));
        assert!(!can_transition(NotStarted, Completed));
        assert!(!can_transition(NotStarted, Failed));
        assert!(!can_transition(Completed, Failed));
        assert!(!can_transition(Failed, Completed));
    }

    #[test]
    fn completing_requires_in_progress() {
        let err = job().complete_step(StepName::Extraction).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::InvalidTransition {
                from: StepStatus::NotStarted,
                to: StepStatus::Completed,
                ..
            }
        ));
    }

    #[test]
    fn transitions_are_pure() {
        let original = job();
        let started = original.start_step(StepName::Extraction).unwrap();
        assert_eq!(original.step_status(StepName::Extraction), StepStatus::NotStarted);
        assert_eq!(started.step_status(StepName::Extraction), StepStatus::InProgress);
    }

    #[test]
    fn timestamps_and_error_recorded() {
        let j = job()
            .transition_step(StepName::Extraction, StepStatus::InProgress, None, 10)
            .unwrap()
            .transition_step(
                StepName::Extraction,
                StepStatus::Failed,
                Some("boom".into()),
                20,
            )
            .unwrap();
        let step = j.step(StepName::Extraction).unwrap();
        assert_eq!(step.started_at, Some(10));
        assert_eq!(step.finished_at, Some(20));
        assert_eq!(step.error_message.as_deref(), Some("boom"));

        let retried = j
            .transition_step(StepName::Extraction, StepStatus::InProgress, None, 30)
            .unwrap();
        let step = retried.step(StepName::Extraction).unwrap();
        assert_eq!(step.error_message, None);
        assert_eq!(step.finished_at, None);
    }

    #[test]
    fn abort_opens_unstarted_step() {
        let j = job().abort_step(StepName::Extraction, "document missing");
        let step = j.step(StepName::Extraction).unwrap();
        assert_eq!(step.status, StepStatus::Failed);
        assert!(step.started_at.is_some());
        assert_eq!(step.error_message.as_deref(), Some("document missing"));
    }

    #[test]
    fn abort_keeps_completed_step() {
        let j = job()
            .start_step(StepName::Extraction)
            .unwrap()
            .complete_step(StepName::Extraction)
            .unwrap();
        let failed = j.fail_run(StepName::Handoff, "queue down");
        assert_eq!(failed.step_status(StepName::Extraction), StepStatus::Completed);
        assert_eq!(failed.step_status(StepName::Handoff), StepStatus::Failed);
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("queue down"));
    }

    #[test]
    fn begin_run_counts_attempts() {
        let j = job().begin_run().begin_run();
        assert_eq!(j.attempts, 2);
        assert_eq!(j.status, JobStatus::Processing);
    }

    #[test]
    fn finish_stage_requires_both_steps() {
        let j = job()
            .start_step(StepName::Extraction)
            .unwrap()
            .complete_step(StepName::Extraction)
            .unwrap();
        assert!(j.finish_stage().is_err());

        let j = j
            .start_step(StepName::Handoff)
            .unwrap()
            .complete_step(StepName::Handoff)
            .unwrap()
            .finish_stage()
            .unwrap();
        assert_eq!(j.status, JobStatus::StageCompleted);
    }

    #[test]
    fn native_completion_sets_text() {
        let d = doc().begin_extraction().complete_native("hello world").unwrap();
        assert_eq!(d.extracted_text.as_deref(), Some("hello world"));
        assert_eq!(d.extraction_status, ExtractionStatus::Completed);
        assert_eq!(d.extraction_method, Some(ExtractionMethod::Native));
        assert!(d.has_completed_extraction());
    }

    #[test]
    fn ocr_completion_records_metadata() {
        let meta = OcrMetadata {
            engine: "vlm".into(),
            language: "eng".into(),
            processing_time: 1200,
            warnings: vec!["page 2 blurry".into()],
        };
        let d = doc()
            .begin_extraction()
            .complete_ocr(
                "scanned",
                Some(72.0),
                meta.clone(),
                ExtractionMethod::Ocr,
                true,
                false,
            )
            .unwrap();
        assert_eq!(d.extraction_status, ExtractionStatus::OcrCompleted);
        assert!(d.ocr_required);
        assert_eq!(d.ocr_confidence, Some(72.0));
        assert_eq!(d.ocr_metadata, Some(meta));
    }

    #[test]
    fn unmeasured_confidence_stays_absent() {
        let d = doc()
            .begin_extraction()
            .complete_ocr(
                "",
                None,
                OcrMetadata::default(),
                ExtractionMethod::Vision,
                true,
                true,
            )
            .unwrap();
        assert_eq!(d.ocr_confidence, None);
        assert!(d.vision_fallback);
    }

    #[test]
    fn fallback_over_native_text_is_not_ocr() {
        let d = doc()
            .begin_extraction()
            .complete_ocr(
                "thin text layer",
                None,
                OcrMetadata::default(),
                ExtractionMethod::Vision,
                false,
                true,
            )
            .unwrap();
        assert_eq!(d.extraction_status, ExtractionStatus::Completed);
        assert!(!d.ocr_required);
        assert!(d.has_completed_extraction());
    }

    #[test]
    fn completion_requires_extraction_under_way() {
        assert!(doc().complete_native("text").is_err());
    }

    #[test]
    fn begin_extraction_clears_previous_text() {
        let d = doc()
            .begin_extraction()
            .complete_native("old")
            .unwrap()
            .begin_extraction();
        assert_eq!(d.extracted_text, None);
        assert!(!d.has_completed_extraction());
    }

    #[test]
    fn failed_extraction_drops_text() {
        let d = doc().begin_extraction().fail_extraction();
        assert_eq!(d.extracted_text, None);
        assert_eq!(d.extraction_status, ExtractionStatus::Failed);
    }
}
