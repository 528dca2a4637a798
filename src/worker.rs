//! Worker pool: the outer queue around [`Pipeline::run`].
//!
//! Messages are processed with bounded concurrency (`buffer_unordered`),
//! so completion order is not delivery order. A failed run is re-run only
//! when its [`ErrorCategory`] is retryable, after an exponential backoff
//! from [`WorkerConfig::backoff_for`]. Not-found, validation and internal
//! failures are dead-lettered after a single run; retryable ones once
//! `max_attempts` is spent.
//!
//! Re-running a message is safe because the pipeline resumes from its
//! last committed step and the handoff is keyed per Job. Two deliveries of
//! the same Job inside one worker are serialised by a per-job lock, so the
//! repositories never see interleaved writes for one Job.

use crate::config::WorkerConfig;
use crate::error::ErrorCategory;
use crate::model::{JobMessage, RunSummary};
use crate::orchestrator::Pipeline;
use crate::progress::{NoopObserver, Observer};
use futures::stream::{Stream, StreamExt};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{info, warn};

/// A message whose stage completed.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Completed {
    pub job_id: String,
    pub attempts: u32,
    pub summary: RunSummary,
}

/// A message the worker gave up on.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub message: JobMessage,
    pub attempts: u32,
    pub category: ErrorCategory,
    pub error: String,
}

/// Result of one message, after all its attempts.
#[derive(Debug, Clone)]
pub enum Outcome {
    Completed(Completed),
    DeadLettered(DeadLetter),
}

/// Everything a [`Worker::run`] settled.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerReport {
    pub completed: Vec<Completed>,
    pub dead_letters: Vec<DeadLetter>,
}

impl WorkerReport {
    pub fn succeeded(&self) -> usize {
        self.completed.len()
    }

    pub fn failed(&self) -> usize {
        self.dead_letters.len()
    }

    fn push(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Completed(c) => self.completed.push(c),
            Outcome::DeadLettered(d) => self.dead_letters.push(d),
        }
    }
}

pub struct Worker {
    pipeline: Arc<Pipeline>,
    config: WorkerConfig,
    observer: Observer,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Worker {
    pub fn new(pipeline: Arc<Pipeline>, config: WorkerConfig) -> Self {
        Self {
            pipeline,
            config,
            observer: Arc::new(NoopObserver),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_observer(mut self, observer: Observer) -> Self {
        self.observer = observer;
        self
    }

    /// Lock for `job_id`. Entries nobody else holds are pruned on the way.
    async fn job_lock(&self, job_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        Arc::clone(locks.entry(job_id.to_string()).or_default())
    }

    /// Run one message to completion or dead letter.
    pub async fn process(&self, message: JobMessage) -> Outcome {
        let lock = self.job_lock(&message.job_id).await;
        let _guard = lock.lock().await;

        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            self.observer.on_job_start(&message.job_id, attempt);
            match self.pipeline.run(&message).await {
                Ok(summary) => {
                    self.observer.on_job_complete(&message.job_id, &summary);
                    return Outcome::Completed(Completed {
                        job_id: message.job_id.clone(),
                        attempts: attempt,
                        summary,
                    });
                }
                Err(err) => {
                    let category = err.category();
                    let text = err.to_string();

                    if category.is_retryable() && attempt < max_attempts {
                        attempt += 1;
                        let delay = self.config.backoff_for(attempt);
                        warn!(
                            job_id = %message.job_id,
                            attempt,
                            max_attempts,
                            delay_ms = delay.as_millis() as u64,
                            "Retrying after {} error: {}",
                            category.as_str(),
                            text
                        );
                        self.observer
                            .on_job_retry(&message.job_id, attempt, delay, &text);
                        sleep(delay).await;
                        continue;
                    }

                    warn!(
                        job_id = %message.job_id,
                        attempts = attempt,
                        category = category.as_str(),
                        "Dead-lettering message: {}",
                        text
                    );
                    self.observer.on_job_error(&message.job_id, category, &text);
                    return Outcome::DeadLettered(DeadLetter {
                        message,
                        attempts: attempt,
                        category,
                        error: text,
                    });
                }
            }
        }
    }

    /// Drain `messages`, running up to `concurrency` of them at once.
    pub async fn run<S>(&self, messages: S) -> WorkerReport
    where
        S: Stream<Item = JobMessage>,
    {
        let concurrency = self.config.concurrency.max(1);
        let outcomes: Vec<Outcome> = messages
            .map(|message| self.process(message))
            .buffer_unordered(concurrency)
            .collect()
            .await;

        let mut report = WorkerReport::default();
        for outcome in outcomes {
            report.push(outcome);
        }

        info!(
            succeeded = report.succeeded(),
            failed = report.failed(),
            "Worker drained message stream"
        );
        self.observer
            .on_batch_complete(report.succeeded(), report.failed());
        report
    }
}
