//! Handoff protocol: enqueue the analysis task exactly once per Job.
//!
//! The pipeline runs under at-least-once delivery, so a Job may reach the
//! handoff more than once (a worker crashed after extraction, the outer
//! queue redelivered). Exactly-once effect comes from the key, not the
//! caller: every task is enqueued under [`idempotency_key`], and an
//! [`AnalysisQueue`] must treat a second enqueue with the same key as the
//! same logical task and acknowledge it as a duplicate.
//!
//! ## Retry Strategy
//!
//! Transient enqueue failures are retried inside [`Handoff::enqueue`] with
//! exponential backoff (`enqueue_backoff_ms * 2^attempt`), bounded by
//! `enqueue_max_attempts`. This retry covers the enqueue call only; it
//! never re-runs extraction. Permanent rejections are not retried.

use crate::config::{retry_delay, PipelineConfig};
use crate::error::{PipelineError, QueueError};
use crate::model::AnalysisTask;
use async_trait::async_trait;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Prefix of every analysis idempotency key.
pub const IDEMPOTENCY_PREFIX: &str = "analysis-for-";

/// Deterministic dedup key for the analysis task of `job_id`.
pub fn idempotency_key(job_id: &str) -> String {
    format!("{IDEMPOTENCY_PREFIX}{job_id}")
}

/// Acknowledgement of an enqueue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueueAck {
    pub key: String,
    /// A task with this key was already queued; nothing new was created.
    pub duplicate: bool,
}

/// A downstream queue with key-level deduplication.
#[async_trait]
pub trait AnalysisQueue: Send + Sync {
    /// Enqueue `task` under `key`. Repeating a key must not create a second task.
    async fn enqueue(&self, key: &str, task: &AnalysisTask) -> Result<EnqueueAck, QueueError>;
}

/// Bounded-retry wrapper around an [`AnalysisQueue`].
#[derive(Clone)]
pub struct Handoff {
    queue: Arc<dyn AnalysisQueue>,
    max_attempts: u32,
    backoff_ms: u64,
}

impl Handoff {
    pub fn new(queue: Arc<dyn AnalysisQueue>, config: &PipelineConfig) -> Self {
        Self {
            queue,
            max_attempts: config.enqueue_max_attempts.max(1),
            backoff_ms: config.enqueue_backoff_ms,
        }
    }

    /// Enqueue the task for `task.job_id`, retrying transient failures.
    pub async fn enqueue(&self, task: &AnalysisTask) -> Result<EnqueueAck, PipelineError> {
        let key = idempotency_key(&task.job_id);
        let mut last_err: Option<QueueError> = None;

        for attempt in 0..self.max_attempts {
            if attempt > 0 {
                let backoff = retry_delay(self.backoff_ms, attempt);
                warn!(
                    key = %key,
                    "Enqueue retry {}/{} after {}ms",
                    attempt,
                    self.max_attempts - 1,
                    backoff.as_millis()
                );
                sleep(backoff).await;
            }

            match self.queue.enqueue(&key, task).await {
                Ok(ack) => {
                    if ack.duplicate {
                        info!(key = %key, "Analysis task already queued; treating as delivered");
                    } else {
                        debug!(key = %key, attempt = attempt + 1, "Analysis task queued");
                    }
                    return Ok(ack);
                }
                Err(e) if e.is_transient() => {
                    warn!(key = %key, "Enqueue attempt {} failed: {}", attempt + 1, e);
                    last_err = Some(e);
                }
                Err(e) => {
                    return Err(PipelineError::EnqueueFailed {
                        key,
                        attempts: attempt + 1,
                        reason: e.to_string(),
                    });
                }
            }
        }

        Err(PipelineError::EnqueueFailed {
            key,
            attempts: self.max_attempts,
            reason: last_err
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown error".to_string()),
        })
    }
}

// ── In-memory queue ──────────────────────────────────────────────────────

#[derive(Default)]
struct MemoryQueueState {
    keys: HashSet<String>,
    tasks: Vec<(String, AnalysisTask)>,
}

/// Process-local queue. Used by tests and dry runs.
#[derive(Default)]
pub struct InMemoryAnalysisQueue {
    state: Mutex<MemoryQueueState>,
}

impl InMemoryAnalysisQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queued tasks in enqueue order.
    pub async fn tasks(&self) -> Vec<AnalysisTask> {
        self.state
            .lock()
            .await
            .tasks
            .iter()
            .map(|(_, t)| t.clone())
            .collect()
    }

    pub async fn get(&self, key: &str) -> Option<AnalysisTask> {
        self.state
            .lock()
            .await
            .tasks
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, t)| t.clone())
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.tasks.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl AnalysisQueue for InMemoryAnalysisQueue {
    async fn enqueue(&self, key: &str, task: &AnalysisTask) -> Result<EnqueueAck, QueueError> {
        let mut state = self.state.lock().await;
        let duplicate = !state.keys.insert(key.to_string());
        if !duplicate {
            state.tasks.push((key.to_string(), task.clone()));
        }
        Ok(EnqueueAck {
            key: key.to_string(),
            duplicate,
        })
    }
}

// ── Spool-directory queue ────────────────────────────────────────────────

/// A queue backed by a directory: one JSON file per key.
///
/// Task files are written to a temp file in the same directory and moved
/// into place with a no-clobber rename, so a key's file is either absent
/// or complete. A downstream consumer claims a task by renaming its file
/// away.
///
/// Claimed files leave no trace in the spool, so every enqueued key also
/// gets an empty marker under `keys/` that consumers never touch. A key
/// with a marker is a duplicate whether or not its task file is still
/// there. The marker is written after the task file, so a crash between
/// the two leaves the task file in place and the next enqueue completes
/// the marker.
pub struct SpoolQueue {
    dir: PathBuf,
}

const KEYS_DIR: &str = "keys";

impl SpoolQueue {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File a key is stored under.
    pub fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", encode_key(key)))
    }

    /// Marker recording that `key` was enqueued.
    pub fn marker_for(&self, key: &str) -> PathBuf {
        self.dir.join(KEYS_DIR).join(encode_key(key))
    }

    /// Read every spooled (unclaimed) task, sorted by file name.
    pub async fn list(&self) -> Result<Vec<AnalysisTask>, PipelineError> {
        let dir = self.dir.clone();
        tokio::task::spawn_blocking(move || list_blocking(&dir))
            .await
            .map_err(|e| PipelineError::Internal(format!("Spool listing task panicked: {e}")))?
    }
}

#[async_trait]
impl AnalysisQueue for SpoolQueue {
    async fn enqueue(&self, key: &str, task: &AnalysisTask) -> Result<EnqueueAck, QueueError> {
        let body = serde_json::to_vec_pretty(task)
            .map_err(|e| QueueError::Rejected(format!("cannot serialise task: {e}")))?;
        let dir = self.dir.clone();
        let target = self.path_for(key);
        let marker = self.marker_for(key);
        let key = key.to_string();

        tokio::task::spawn_blocking(move || spool_blocking(&dir, &target, &marker, &key, &body))
            .await
            .map_err(|e| QueueError::Unavailable(format!("spool task panicked: {e}")))?
    }
}

fn spool_blocking(
    dir: &Path,
    target: &Path,
    marker: &Path,
    key: &str,
    body: &[u8],
) -> Result<EnqueueAck, QueueError> {
    use std::io::Write;

    let unavailable = |e: std::io::Error| QueueError::Unavailable(e.to_string());
    let ack = |duplicate| EnqueueAck {
        key: key.to_string(),
        duplicate,
    };

    if marker.exists() {
        return Ok(ack(true));
    }
    std::fs::create_dir_all(dir.join(KEYS_DIR)).map_err(unavailable)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(unavailable)?;
    tmp.write_all(body)
        .and_then(|_| tmp.as_file().sync_all())
        .map_err(unavailable)?;

    let duplicate = match tmp.persist_noclobber(target) {
        Ok(_) => false,
        Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists => true,
        Err(e) => return Err(unavailable(e.error)),
    };

    match std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(marker)
    {
        Ok(file) => file.sync_all().map_err(unavailable)?,
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
        Err(e) => return Err(unavailable(e)),
    }
    Ok(ack(duplicate))
}

fn list_blocking(dir: &Path) -> Result<Vec<AnalysisTask>, PipelineError> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
        .map_err(PipelineError::persistence)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
        .collect();
    paths.sort();

    paths
        .iter()
        .map(|p| -> Result<AnalysisTask, PipelineError> {
            let bytes = std::fs::read(p).map_err(PipelineError::persistence)?;
            Ok(serde_json::from_slice(&bytes)?)
        })
        .collect()
}

/// Make a key safe as a file name, keeping distinct keys distinct.
fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for b in key.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' => out.push(b as char),
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ExtractionMethod, MESSAGE_VERSION};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn task(job_id: &str) -> AnalysisTask {
        AnalysisTask {
            version: MESSAGE_VERSION,
            job_id: job_id.into(),
            document_id: "doc-1".into(),
            extracted_text: "some text".into(),
            tier: "standard".into(),
            ocr_confidence: None,
            extraction_method: ExtractionMethod::Native,
            image_url: None,
        }
    }

    fn config(attempts: u32) -> PipelineConfig {
        PipelineConfig::builder()
            .enqueue_max_attempts(attempts)
            .enqueue_backoff_ms(1)
            .build()
            .unwrap()
    }

    /// Fails the first `failures` calls with the given error.
    struct FlakyQueue {
        failures: u32,
        error: QueueError,
        calls: AtomicU32,
        inner: InMemoryAnalysisQueue,
    }

    #[async_trait]
    impl AnalysisQueue for FlakyQueue {
        async fn enqueue(&self, key: &str, task: &AnalysisTask) -> Result<EnqueueAck, QueueError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                return Err(self.error.clone());
            }
            self.inner.enqueue(key, task).await
        }
    }

    fn flaky(failures: u32, error: QueueError) -> Arc<FlakyQueue> {
        Arc::new(FlakyQueue {
            failures,
            error,
            calls: AtomicU32::new(0),
            inner: InMemoryAnalysisQueue::new(),
        })
    }

    #[test]
    fn key_derivation_is_deterministic() {
        assert_eq!(idempotency_key("42"), "analysis-for-42");
        assert_eq!(idempotency_key("42"), idempotency_key("42"));
        assert_ne!(idempotency_key("42"), idempotency_key("43"));
    }

    #[tokio::test]
    async fn memory_queue_dedups_by_key() {
        let queue = InMemoryAnalysisQueue::new();
        let first = queue.enqueue("analysis-for-1", &task("1")).await.unwrap();
        let second = queue.enqueue("analysis-for-1", &task("1")).await.unwrap();
        assert!(!first.duplicate);
        assert!(second.duplicate);
        assert_eq!(queue.len().await, 1);
    }

    #[tokio::test]
    async fn handoff_retries_transient_failures() {
        let queue = flaky(2, QueueError::Unavailable("503".into()));
        let handoff = Handoff::new(queue.clone(), &config(3));
        let ack = handoff.enqueue(&task("7")).await.unwrap();
        assert_eq!(ack.key, "analysis-for-7");
        assert_eq!(queue.calls.load(Ordering::SeqCst), 3);
        assert_eq!(queue.inner.len().await, 1);
    }

    #[tokio::test]
    async fn handoff_gives_up_after_max_attempts() {
        let queue = flaky(10, QueueError::Timeout { ms: 50 });
        let handoff = Handoff::new(queue.clone(), &config(3));
        let err = handoff.enqueue(&task("7")).await.unwrap_err();
        match err {
            PipelineError::EnqueueFailed { key, attempts, .. } => {
                assert_eq!(key, "analysis-for-7");
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(queue.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn handoff_does_not_retry_rejection() {
        let queue = flaky(1, QueueError::Rejected("schema".into()));
        let handoff = Handoff::new(queue.clone(), &config(3));
        let err = handoff.enqueue(&task("7")).await.unwrap_err();
        assert!(matches!(err, PipelineError::EnqueueFailed { attempts: 1, .. }));
        assert_eq!(queue.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn spool_queue_writes_once_per_key() {
        let dir = tempfile::tempdir().unwrap();
        let queue = SpoolQueue::new(dir.path().join("analysis"));

        let first = queue.enqueue("analysis-for-a/b", &task("a/b")).await.unwrap();
        let second = queue.enqueue("analysis-for-a/b", &task("a/b")).await.unwrap();
        assert!(!first.duplicate);
        assert!(second.duplicate);

        let listed = queue.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].job_id, "a/b");
        assert!(queue.path_for("analysis-for-a/b").exists());
        assert!(queue.marker_for("analysis-for-a/b").exists());
    }

    #[tokio::test]
    async fn spool_queue_remembers_claimed_keys() {
        let dir = tempfile::tempdir().unwrap();
        let queue = SpoolQueue::new(dir.path().join("analysis"));
        queue.enqueue("analysis-for-9", &task("9")).await.unwrap();

        let claimed = dir.path().join("claimed-9.json");
        std::fs::rename(queue.path_for("analysis-for-9"), &claimed).unwrap();

        let again = queue.enqueue("analysis-for-9", &task("9")).await.unwrap();
        assert!(again.duplicate);
        assert!(queue.list().await.unwrap().is_empty());
        assert!(!queue.path_for("analysis-for-9").exists());
    }

    #[tokio::test]
    async fn spool_queue_completes_missing_marker() {
        let dir = tempfile::tempdir().unwrap();
        let queue = SpoolQueue::new(dir.path().join("analysis"));
        queue.enqueue("analysis-for-5", &task("5")).await.unwrap();
        std::fs::remove_file(queue.marker_for("analysis-for-5")).unwrap();

        let again = queue.enqueue("analysis-for-5", &task("5")).await.unwrap();
        assert!(again.duplicate);
        assert!(queue.marker_for("analysis-for-5").exists());
        assert_eq!(queue.list().await.unwrap().len(), 1);
    }

    #[test]
    fn encoded_keys_stay_distinct() {
        assert_ne!(encode_key("a/b"), encode_key("a_b"));
        assert_eq!(encode_key("analysis-for-1"), "analysis-for-1");
    }
}
