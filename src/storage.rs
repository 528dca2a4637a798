//! Object storage holding uploaded files.
//!
//! The pipeline needs two things from storage: the bytes behind a
//! `storageKey`, and a URL a vision model can fetch the file from when
//! text extraction falls back to vision. [`ObjectStorage`] is that seam;
//! this module ships a filesystem store, an HTTP store and an in-memory
//! store for tests.
//!
//! Download timeouts are enforced by the orchestrator around the call,
//! so every implementation gets the same [`PipelineError::StorageTimeout`]
//! behaviour; the HTTP store additionally sets the same timeout on its
//! client so stalled sockets are released.

use crate::error::PipelineError;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::Url;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Read access to uploaded files.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Fetch the bytes stored under `key`.
    async fn download_file(&self, key: &str) -> Result<Vec<u8>, PipelineError>;

    /// A URL from which the file under `key` can be viewed.
    async fn preview_url(&self, key: &str) -> Result<String, PipelineError>;
}

/// Join `key` onto a public base URL.
fn join_public_url(base: &str, key: &str) -> Result<String, PipelineError> {
    let base = if base.ends_with('/') {
        base.to_string()
    } else {
        format!("{base}/")
    };
    let url = Url::parse(&base)
        .and_then(|b| b.join(key.trim_start_matches('/')))
        .map_err(|e| PipelineError::InvalidConfig(format!("bad public URL '{base}': {e}")))?;
    Ok(url.to_string())
}

/// Encode bytes as a `data:` URI, sniffing image formats for the MIME type.
pub fn data_url(bytes: &[u8]) -> String {
    let mime = image::guess_format(bytes)
        .map(|f| f.to_mime_type())
        .unwrap_or_else(|_| {
            if bytes.starts_with(b"%PDF") {
                "application/pdf"
            } else {
                "application/octet-stream"
            }
        });
    format!("data:{};base64,{}", mime, STANDARD.encode(bytes))
}

// ── Filesystem ───────────────────────────────────────────────────────────

/// Files under a root directory; the key is the relative path.
pub struct FsObjectStorage {
    root: PathBuf,
    public_base_url: Option<String>,
}

impl FsObjectStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            public_base_url: None,
        }
    }

    /// Serve previews from `base_url/<key>` instead of inline `data:` URIs.
    pub fn with_public_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.public_base_url = Some(base_url.into());
        self
    }

    /// Resolve `key` under the root, refusing anything that escapes it.
    pub fn resolve(&self, key: &str) -> Result<PathBuf, PipelineError> {
        let rel = Path::new(key);
        let escapes = key.trim().is_empty()
            || rel
                .components()
                .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes {
            return Err(PipelineError::InvalidStorageKey {
                key: key.to_string(),
            });
        }
        Ok(self.root.join(rel))
    }
}

#[async_trait]
impl ObjectStorage for FsObjectStorage {
    async fn download_file(&self, key: &str) -> Result<Vec<u8>, PipelineError> {
        let path = self.resolve(key)?;
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| PipelineError::StorageFailed {
                key: key.to_string(),
                reason: e.to_string(),
            })?;
        debug!(key, bytes = bytes.len(), "Read object from {}", path.display());
        Ok(bytes)
    }

    async fn preview_url(&self, key: &str) -> Result<String, PipelineError> {
        if let Some(ref base) = self.public_base_url {
            self.resolve(key)?;
            return join_public_url(base, key);
        }
        let bytes = self.download_file(key).await?;
        Ok(data_url(&bytes))
    }
}

// ── HTTP ─────────────────────────────────────────────────────────────────

/// Objects served over HTTP(S) at `base_url/<key>`.
pub struct HttpObjectStorage {
    base_url: String,
    public_base_url: Option<String>,
    client: reqwest::Client,
    timeout_secs: u64,
}

impl HttpObjectStorage {
    pub fn new(base_url: impl Into<String>, timeout_secs: u64) -> Result<Self, PipelineError> {
        let base_url = base_url.into();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(PipelineError::InvalidConfig(format!(
                "storage URL must be http(s), got '{base_url}'"
            )));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| PipelineError::InvalidConfig(format!("HTTP client: {e}")))?;
        Ok(Self {
            base_url,
            public_base_url: None,
            client,
            timeout_secs,
        })
    }

    /// Hand out preview URLs under a different (e.g. CDN) base.
    pub fn with_public_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.public_base_url = Some(base_url.into());
        self
    }
}

#[async_trait]
impl ObjectStorage for HttpObjectStorage {
    async fn download_file(&self, key: &str) -> Result<Vec<u8>, PipelineError> {
        let url = join_public_url(&self.base_url, key)?;
        info!(key, "Downloading object from {}", url);

        let response = self.client.get(&url).send().await.map_err(|e| {
            if e.is_timeout() {
                PipelineError::StorageTimeout {
                    key: key.to_string(),
                    secs: self.timeout_secs,
                }
            } else {
                PipelineError::StorageFailed {
                    key: key.to_string(),
                    reason: e.to_string(),
                }
            }
        })?;

        if !response.status().is_success() {
            return Err(PipelineError::StorageFailed {
                key: key.to_string(),
                reason: format!("HTTP {}", response.status()),
            });
        }

        let bytes = response.bytes().await.map_err(|e| {
            if e.is_timeout() {
                PipelineError::StorageTimeout {
                    key: key.to_string(),
                    secs: self.timeout_secs,
                }
            } else {
                PipelineError::StorageFailed {
                    key: key.to_string(),
                    reason: e.to_string(),
                }
            }
        })?;
        Ok(bytes.to_vec())
    }

    async fn preview_url(&self, key: &str) -> Result<String, PipelineError> {
        let base = self.public_base_url.as_deref().unwrap_or(&self.base_url);
        join_public_url(base, key)
    }
}

// ── In memory ────────────────────────────────────────────────────────────

/// Process-local storage for tests and dry runs.
#[derive(Default)]
pub struct InMemoryObjectStorage {
    objects: RwLock<HashMap<String, Vec<u8>>>,
}

impl InMemoryObjectStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put(&self, key: impl Into<String>, bytes: impl Into<Vec<u8>>) {
        self.objects.write().await.insert(key.into(), bytes.into());
    }
}

#[async_trait]
impl ObjectStorage for InMemoryObjectStorage {
    async fn download_file(&self, key: &str) -> Result<Vec<u8>, PipelineError> {
        self.objects
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| PipelineError::StorageFailed {
                key: key.to_string(),
                reason: "object not found".to_string(),
            })
    }

    async fn preview_url(&self, key: &str) -> Result<String, PipelineError> {
        if self.objects.read().await.contains_key(key) {
            Ok(format!("memory://{key}"))
        } else {
            Err(PipelineError::StorageFailed {
                key: key.to_string(),
                reason: "object not found".to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn resolve_rejects_escaping_keys() {
        let storage = FsObjectStorage::new("/srv/uploads");
        assert_ok!(storage.resolve("2024/scan.pdf"));
        assert_err!(storage.resolve("../etc/passwd"));
        assert_err!(storage.resolve("/etc/passwd"));
        assert_err!(storage.resolve(""));
    }

    #[tokio::test]
    async fn fs_storage_reads_and_previews() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("uploads")).unwrap();
        std::fs::write(dir.path().join("uploads/a.txt"), b"hello").unwrap();

        let storage = FsObjectStorage::new(dir.path());
        let bytes = storage.download_file("uploads/a.txt").await.unwrap();
        assert_eq!(bytes, b"hello");

        let url = storage.preview_url("uploads/a.txt").await.unwrap();
        assert!(url.starts_with("data:application/octet-stream;base64,"));

        let public = FsObjectStorage::new(dir.path()).with_public_base_url("https://cdn.test/files");
        assert_eq!(
            public.preview_url("uploads/a.txt").await.unwrap(),
            "https://cdn.test/files/uploads/a.txt"
        );
    }

    #[tokio::test]
    async fn fs_storage_missing_object_is_storage_failure() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsObjectStorage::new(dir.path());
        let err = storage.download_file("nope.pdf").await.unwrap_err();
        assert!(matches!(err, PipelineError::StorageFailed { .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn data_url_sniffs_png() {
        let png = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0];
        assert!(data_url(&png).starts_with("data:image/png;base64,"));
        assert!(data_url(b"%PDF-1.7").starts_with("data:application/pdf;base64,"));
    }

    #[test]
    fn http_storage_requires_http_url() {
        assert!(HttpObjectStorage::new("ftp://files", 10).is_err());
        let storage = HttpObjectStorage::new("https://files.test/bucket", 10).unwrap();
        assert_eq!(storage.timeout_secs, 10);
    }

    #[tokio::test]
    async fn http_preview_joins_key() {
        let storage = HttpObjectStorage::new("https://files.test/bucket", 10).unwrap();
        assert_eq!(
            storage.preview_url("scans/p 1.png").await.unwrap(),
            "https://files.test/bucket/scans/p%201.png"
        );
    }

    #[tokio::test]
    async fn memory_storage_round_trip() {
        let storage = InMemoryObjectStorage::new();
        storage.put("k", b"bytes".to_vec()).await;
        assert_eq!(storage.download_file("k").await.unwrap(), b"bytes");
        assert_eq!(storage.preview_url("k").await.unwrap(), "memory://k");
        assert!(storage.preview_url("missing").await.is_err());
    }
}
