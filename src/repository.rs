//! Persistence for Job and Document records.
//!
//! Repositories only load and store whole records. Deciding what the next
//! record looks like is [`crate::state`]'s job, so a write here is always
//! "replace this record with that value", which is atomic per record in
//! both shipped implementations.

use crate::error::PipelineError;
use crate::model::{Document, Job};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::debug;

#[async_trait]
pub trait JobRepository: Send + Sync {
    async fn find_job(&self, id: &str) -> Result<Option<Job>, PipelineError>;
    async fn save_job(&self, job: &Job) -> Result<(), PipelineError>;
}

#[async_trait]
pub trait DocumentRepository: Send + Sync {
    async fn find_document(&self, id: &str) -> Result<Option<Document>, PipelineError>;
    async fn save_document(&self, document: &Document) -> Result<(), PipelineError>;
}

// ── In memory ────────────────────────────────────────────────────────────

/// Both repositories in process memory.
#[derive(Default)]
pub struct InMemoryRepository {
    jobs: RwLock<HashMap<String, Job>>,
    documents: RwLock<HashMap<String, Document>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobRepository for InMemoryRepository {
    async fn find_job(&self, id: &str) -> Result<Option<Job>, PipelineError> {
        Ok(self.jobs.read().await.get(id).cloned())
    }

    async fn save_job(&self, job: &Job) -> Result<(), PipelineError> {
        self.jobs.write().await.insert(job.id.clone(), job.clone());
        Ok(())
    }
}

#[async_trait]
impl DocumentRepository for InMemoryRepository {
    async fn find_document(&self, id: &str) -> Result<Option<Document>, PipelineError> {
        Ok(self.documents.read().await.get(id).cloned())
    }

    async fn save_document(&self, document: &Document) -> Result<(), PipelineError> {
        self.documents
            .write()
            .await
            .insert(document.id.clone(), document.clone());
        Ok(())
    }
}

// ── JSON files ───────────────────────────────────────────────────────────

/// One pretty-printed JSON file per record under `root/jobs` and
/// `root/documents`.
///
/// Writes go to a temp file in the target directory and are renamed over
/// the old record, so readers never see a half-written file.
pub struct JsonFileRepository {
    root: PathBuf,
}

impl JsonFileRepository {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, kind: &str, id: &str) -> Result<PathBuf, PipelineError> {
        if !is_record_id(id) {
            return Err(PipelineError::InvalidRecordId { id: id.to_string() });
        }
        Ok(self.root.join(kind).join(format!("{id}.json")))
    }

    /// Ids that cannot name a file were never stored, so they read as absent.
    async fn load<T>(&self, kind: &str, id: &str) -> Result<Option<T>, PipelineError>
    where
        T: DeserializeOwned + Send + 'static,
    {
        if !is_record_id(id) {
            debug!(kind, id, "Lookup with malformed record id");
            return Ok(None);
        }
        let path = self.path(kind, id)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(PipelineError::persistence(format!(
                "read {}: {e}",
                path.display()
            ))),
        }
    }

    async fn store<T>(&self, kind: &str, id: &str, record: &T) -> Result<(), PipelineError>
    where
        T: Serialize + Sync,
    {
        let path = self.path(kind, id)?;
        let body = serde_json::to_vec_pretty(record)?;
        tokio::task::spawn_blocking(move || write_atomic(&path, &body))
            .await
            .map_err(|e| PipelineError::Internal(format!("Write task panicked: {e}")))?
    }
}

fn is_record_id(id: &str) -> bool {
    !id.is_empty()
        && id != "."
        && id != ".."
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

fn write_atomic(path: &Path, body: &[u8]) -> Result<(), PipelineError> {
    let parent = path
        .parent()
        .ok_or_else(|| PipelineError::persistence(format!("{} has no parent", path.display())))?;
    std::fs::create_dir_all(parent).map_err(PipelineError::persistence)?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(PipelineError::persistence)?;
    tmp.write_all(body)
        .and_then(|_| tmp.as_file().sync_all())
        .map_err(PipelineError::persistence)?;
    tmp.persist(path)
        .map_err(|e| PipelineError::persistence(e.error))?;
    debug!("Wrote {}", path.display());
    Ok(())
}

#[async_trait]
impl JobRepository for JsonFileRepository {
    async fn find_job(&self, id: &str) -> Result<Option<Job>, PipelineError> {
        self.load("jobs", id).await
    }

    async fn save_job(&self, job: &Job) -> Result<(), PipelineError> {
        self.store("jobs", &job.id, job).await
    }
}

#[async_trait]
impl DocumentRepository for JsonFileRepository {
    async fn find_document(&self, id: &str) -> Result<Option<Document>, PipelineError> {
        self.load("documents", id).await
    }

    async fn save_document(&self, document: &Document) -> Result<(), PipelineError> {
        self.store("documents", &document.id, document).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{JobStatus, StepName};

    #[tokio::test]
    async fn memory_repository_round_trip() {
        let repo = InMemoryRepository::new();
        assert!(repo.find_job("j1").await.unwrap().is_none());

        let job = Job::new("j1", "d1", "free");
        repo.save_job(&job).await.unwrap();
        assert_eq!(repo.find_job("j1").await.unwrap(), Some(job));

        let doc = Document::new("d1", "k", "text/plain");
        repo.save_document(&doc).await.unwrap();
        assert_eq!(repo.find_document("d1").await.unwrap(), Some(doc));
    }

    #[tokio::test]
    async fn json_repository_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let job = Job::new("job-1", "doc-1", "pro")
            .begin_run()
            .start_step(StepName::Extraction)
            .unwrap();

        JsonFileRepository::new(dir.path())
            .save_job(&job)
            .await
            .unwrap();

        let reopened = JsonFileRepository::new(dir.path());
        let loaded = reopened.find_job("job-1").await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Processing);
        assert_eq!(loaded, job);
        assert!(dir.path().join("jobs/job-1.json").exists());
    }

    #[tokio::test]
    async fn json_repository_missing_record_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let repo = JsonFileRepository::new(dir.path());
        assert!(repo.find_document("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn json_repository_unsafe_ids_are_absent_not_transient() {
        let dir = tempfile::tempdir().unwrap();
        let repo = JsonFileRepository::new(dir.path());
        assert!(repo.find_job("../escape").await.unwrap().is_none());
        assert!(repo.find_document("a/b").await.unwrap().is_none());

        let err = repo
            .save_job(&Job::new("../escape", "d1", "free"))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidRecordId { .. }));
        assert!(!err.is_retryable());
        assert!(!dir.path().join("escape.json").exists());
    }

    #[tokio::test]
    async fn json_repository_overwrites_record() {
        let dir = tempfile::tempdir().unwrap();
        let repo = JsonFileRepository::new(dir.path());
        let doc = Document::new("d1", "k", "text/plain");
        repo.save_document(&doc).await.unwrap();
        let next = doc.begin_extraction().complete_native("hello").unwrap();
        repo.save_document(&next).await.unwrap();
        let loaded = repo.find_document("d1").await.unwrap().unwrap();
        assert_eq!(loaded.extracted_text.as_deref(), Some("hello"));
    }
}
