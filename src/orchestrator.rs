//! Pipeline orchestrator: one intake run for one Job.
//!
//! ```text
//! load Job + Document ─► begin run ─► extraction: in_progress (checkpoint)
//!        │                                  │
//!        │                  download ─► extract ─► clean ─► validate
//!        │                                  │
//!        │               Document completed (native | ocr) ─► extraction: completed
//!        │                                  │
//!        └── resume ──────────────► handoff: in_progress ─► enqueue ─► completed
//!                                                                    │
//!                                                   Job: stage_completed
//! ```
//!
//! Every new Job or Document state is persisted before the run adopts it.
//! A Job whose `handoff` step is already `completed` is never enqueued
//! again; the run only re-confirms the stage.
//! On any failure the step being worked on is failed, the Job is marked
//! `failed`, the Document loses any text whose extraction step did not
//! complete, and the original error is returned for the outer queue to
//! classify.

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::extract::cleanup::clean_text;
use crate::extract::ExtractionEngine;
use crate::handoff::{idempotency_key, AnalysisQueue, EnqueueAck, Handoff};
use crate::model::{
    AnalysisTask, Document, ExtractionMethod, Job, JobMessage, OcrMetadata, RunSummary, StepName,
    StepStatus, MESSAGE_VERSION,
};
use crate::repository::{DocumentRepository, JobRepository};
use crate::storage::ObjectStorage;
use std::sync::Arc;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Wires the collaborators of an intake run together.
pub struct Pipeline {
    storage: Arc<dyn ObjectStorage>,
    engine: Arc<dyn ExtractionEngine>,
    jobs: Arc<dyn JobRepository>,
    documents: Arc<dyn DocumentRepository>,
    handoff: Handoff,
    config: PipelineConfig,
}

/// What the run knows about extraction, read back from the Document.
#[derive(Debug, Clone, PartialEq)]
struct Extracted {
    text: String,
    ocr_required: bool,
    ocr_confidence: Option<f32>,
    method: ExtractionMethod,
    fallback_to_vision: bool,
}

impl Extracted {
    fn from_document(doc: &Document) -> Self {
        Self {
            text: doc.extracted_text.clone().unwrap_or_default(),
            ocr_required: doc.ocr_required,
            ocr_confidence: doc.ocr_confidence,
            method: doc.extraction_method.unwrap_or(ExtractionMethod::Native),
            fallback_to_vision: doc.vision_fallback,
        }
    }
}

/// Last committed state of a run, plus the step it is working on.
struct Progress {
    job: Job,
    document: Document,
    step: StepName,
}

impl Pipeline {
    pub fn new(
        storage: Arc<dyn ObjectStorage>,
        engine: Arc<dyn ExtractionEngine>,
        jobs: Arc<dyn JobRepository>,
        documents: Arc<dyn DocumentRepository>,
        queue: Arc<dyn AnalysisQueue>,
        config: PipelineConfig,
    ) -> Self {
        let handoff = Handoff::new(queue, &config);
        Self {
            storage,
            engine,
            jobs,
            documents,
            handoff,
            config,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run the intake stage for `message`.
    ///
    /// Safe to call any number of times for the same Job: a completed
    /// extraction is reused and the handoff is deduplicated by key, so at
    /// most one analysis task exists per Job.
    pub async fn run(&self, message: &JobMessage) -> Result<RunSummary, PipelineError> {
        if message.version > MESSAGE_VERSION {
            return Err(PipelineError::Validation {
                reason: format!(
                    "message version {} is newer than supported version {}",
                    message.version, MESSAGE_VERSION
                ),
            });
        }

        info!(
            job_id = %message.job_id,
            document_id = %message.document_id,
            tier = %message.tier,
            "Starting intake run"
        );

        let job = self
            .jobs
            .find_job(&message.job_id)
            .await?
            .ok_or_else(|| PipelineError::JobNotFound {
                job_id: message.job_id.clone(),
            })?;

        let document = match self.documents.find_document(&message.document_id).await? {
            Some(doc) => doc,
            None => {
                let err = PipelineError::DocumentNotFound {
                    document_id: message.document_id.clone(),
                };
                let failed = job.begin_run().fail_run(StepName::Extraction, err.to_string());
                if let Err(e) = self.jobs.save_job(&failed).await {
                    error!(job_id = %job.id, "Could not record failure: {}", e);
                }
                return Err(err);
            }
        };

        if job.document_id != document.id {
            warn!(
                job_id = %job.id,
                job_document = %job.document_id,
                message_document = %document.id,
                "Message names a different document than the job record"
            );
        }

        let job = self.commit_job(job.begin_run()).await?;
        let mut progress = Progress {
            job,
            document,
            step: StepName::Extraction,
        };

        match self.execute(&mut progress, message).await {
            Ok(summary) => {
                info!(
                    job_id = %message.job_id,
                    method = summary.extraction_method.as_str(),
                    text_length = summary.text_length,
                    duplicate = summary.duplicate_enqueue,
                    resumed = summary.resumed,
                    "Intake stage completed"
                );
                Ok(summary)
            }
            Err(err) => {
                warn!(
                    job_id = %message.job_id,
                    step = %progress.step,
                    category = err.category().as_str(),
                    "Intake run failed: {}",
                    err
                );
                self.record_failure(&progress, &err).await;
                Err(err)
            }
        }
    }

    async fn execute(
        &self,
        progress: &mut Progress,
        message: &JobMessage,
    ) -> Result<RunSummary, PipelineError> {
        let resumed = progress.job.step_status(StepName::Extraction) == StepStatus::Completed
            && progress.document.has_completed_extraction();

        if resumed {
            info!(job_id = %progress.job.id, "Extraction already completed, resuming at handoff");
        } else {
            self.extract(progress).await?;
        }
        let extracted = Extracted::from_document(&progress.document);

        progress.step = StepName::Handoff;
        let ack = if progress.job.step_status(StepName::Handoff) == StepStatus::Completed {
            info!(job_id = %progress.job.id, "Analysis task already handed off");
            EnqueueAck {
                key: idempotency_key(&progress.job.id),
                duplicate: true,
            }
        } else {
            progress.job = self
                .commit_job(progress.job.start_step(StepName::Handoff)?)
                .await?;
            let task = self.build_task(message, &progress.document, &extracted).await?;
            let ack = self.handoff.enqueue(&task).await?;
            progress.job = self
                .commit_job(progress.job.complete_step(StepName::Handoff)?)
                .await?;
            ack
        };

        progress.job = self.commit_job(progress.job.finish_stage()?).await?;

        Ok(RunSummary {
            success: true,
            text_length: extracted.text.chars().count(),
            ocr_required: extracted.ocr_required,
            extraction_method: extracted.method,
            idempotency_key: ack.key,
            duplicate_enqueue: ack.duplicate,
            resumed,
        })
    }

    /// Steps 2–7: checkpoint, download, extract, validate, persist.
    async fn extract(&self, progress: &mut Progress) -> Result<(), PipelineError> {
        progress.step = StepName::Extraction;
        progress.job = self
            .commit_job(progress.job.start_step(StepName::Extraction)?)
            .await?;
        progress.document = self
            .commit_document(progress.document.begin_extraction())
            .await?;

        let key = progress.document.storage_key.clone();
        let bytes = timeout(self.config.download_timeout(), self.storage.download_file(&key))
            .await
            .map_err(|_| PipelineError::StorageTimeout {
                key: key.clone(),
                secs: self.config.download_timeout_secs,
            })??;
        debug!(key = %key, bytes = bytes.len(), "Downloaded document");

        let result = timeout(
            self.config.extraction_timeout(),
            self.engine
                .extract_text(&bytes, &progress.document.mime_type),
        )
        .await
        .map_err(|_| PipelineError::ExtractionTimeout {
            secs: self.config.extraction_timeout_secs,
        })??;

        let text = clean_text(&result.text);
        if result.fallback_to_vision {
            debug!("Vision fallback, skipping text validation");
        } else {
            self.config.validation.validate(&text).into_result()?;
        }

        let next = if result.ocr_required || result.fallback_to_vision {
            let metadata = OcrMetadata {
                engine: self.engine.name().to_string(),
                language: self.config.extraction.ocr_language.clone(),
                processing_time: result.processing_time,
                warnings: result.warnings.clone(),
            };
            progress.document.complete_ocr(
                text,
                result.ocr_confidence,
                metadata,
                result.method,
                result.ocr_required,
                result.fallback_to_vision,
            )?
        } else {
            progress.document.complete_native(text)?
        };
        progress.document = self.commit_document(next).await?;

        progress.job = self
            .commit_job(progress.job.complete_step(StepName::Extraction)?)
            .await?;
        Ok(())
    }

    async fn build_task(
        &self,
        message: &JobMessage,
        document: &Document,
        extracted: &Extracted,
    ) -> Result<AnalysisTask, PipelineError> {
        let mut task = AnalysisTask {
            version: MESSAGE_VERSION,
            job_id: message.job_id.clone(),
            document_id: document.id.clone(),
            extracted_text: extracted.text.clone(),
            tier: message.tier.clone(),
            ocr_confidence: if extracted.ocr_required {
                extracted.ocr_confidence
            } else {
                None
            },
            extraction_method: extracted.method,
            image_url: None,
        };

        if extracted.fallback_to_vision {
            let key = &document.storage_key;
            let url = timeout(self.config.download_timeout(), self.storage.preview_url(key))
                .await
                .map_err(|_| PipelineError::StorageTimeout {
                    key: key.clone(),
                    secs: self.config.download_timeout_secs,
                })??;
            task.image_url = Some(url);
            if task.extracted_text.trim().is_empty() {
                task.extracted_text = self.config.vision_placeholder.clone();
            }
        }
        Ok(task)
    }

    async fn commit_job(&self, next: Job) -> Result<Job, PipelineError> {
        self.jobs.save_job(&next).await?;
        Ok(next)
    }

    async fn commit_document(&self, next: Document) -> Result<Document, PipelineError> {
        self.documents.save_document(&next).await?;
        Ok(next)
    }

    /// Best-effort write of the failure; the caller still gets the original error.
    async fn record_failure(&self, progress: &Progress, err: &PipelineError) {
        let job = progress.job.fail_run(progress.step, err.to_string());
        if let Err(e) = self.jobs.save_job(&job).await {
            error!(job_id = %job.id, "Could not record job failure: {}", e);
        }

        if job.step_status(StepName::Extraction) != StepStatus::Completed {
            let document = progress.document.fail_extraction();
            if let Err(e) = self.documents.save_document(&document).await {
                error!(document_id = %document.id, "Could not record extraction failure: {}", e);
            }
        }
    }
}
