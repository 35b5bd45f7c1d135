//! Blob Store Adapter (C1). `put` is atomic per object, `get` after `put`
//! is read-your-writes, `delete` is idempotent, for arbitrary
//! bucket/key-addressed content.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use kb_error::{ErrorCode, KbError};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, instrument};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("object not found: {bucket}/{key}")]
    NotFound { bucket: String, key: String },
    #[error("blob store io error: {0}")]
    Io(String),
    #[error("blob store unavailable: {reason}")]
    Unavailable { reason: String },
}

impl From<BlobError> for KbError {
    fn from(err: BlobError) -> Self {
        match err {
            BlobError::NotFound { bucket, key } => {
                KbError::new(ErrorCode::NotFound, format!("object not found: {bucket}/{key}"))
                    .with_context("bucket", bucket)
                    .with_context("key", key)
            }
            BlobError::Io(msg) => KbError::new(ErrorCode::Unavailable, msg),
            BlobError::Unavailable { reason } => KbError::new(ErrorCode::Unavailable, reason),
        }
    }
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String, BlobError>;

    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, BlobError>;

    async fn delete(&self, bucket: &str, key: &str) -> Result<(), BlobError>;

    async fn presign(&self, bucket: &str, key: &str, ttl_secs: u64) -> Result<String, BlobError>;
}

fn etag_of(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut s = String::with_capacity(digest.len() * 2);
    for b in digest {
        s.push_str(&format!("{b:02x}"));
    }
    s
}

/// Reference implementation rooted at a directory on local disk, the
/// same "file-based store with a root directory" shape as the reference
/// workspace's receipt store.
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        LocalBlobStore { root: root.into() }
    }

    fn object_path(&self, bucket: &str, key: &str) -> PathBuf {
        self.root.join(bucket).join(key)
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    #[instrument(level = "debug", skip(self, bytes), fields(bucket, key, bytes = bytes.len()))]
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        bytes: Vec<u8>,
        _content_type: &str,
    ) -> Result<String, BlobError> {
        let path = self.object_path(bucket, key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| BlobError::Io(e.to_string()))?;
        }
        let etag = etag_of(&bytes);
        let tmp_path = path.with_extension("tmp");
        tokio::fs::write(&tmp_path, &bytes)
            .await
            .map_err(|e| BlobError::Io(e.to_string()))?;
        tokio::fs::rename(&tmp_path, &path)
            .await
            .map_err(|e| BlobError::Io(e.to_string()))?;
        debug!(etag, "object written");
        Ok(etag)
    }

    #[instrument(level = "debug", skip(self), fields(bucket, key))]
    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, BlobError> {
        let path = self.object_path(bucket, key);
        tokio::fs::read(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                BlobError::NotFound {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                }
            } else {
                BlobError::Io(e.to_string())
            }
        })
    }

    #[instrument(level = "debug", skip(self), fields(bucket, key))]
    async fn delete(&self, bucket: &str, key: &str) -> Result<(), BlobError> {
        let path = self.object_path(bucket, key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BlobError::Io(e.to_string())),
        }
    }

    async fn presign(&self, bucket: &str, key: &str, ttl_secs: u64) -> Result<String, BlobError> {
        let path = self.object_path(bucket, key);
        if !path.exists() {
            return Err(BlobError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            });
        }
        Ok(format!(
            "file://{}?ttl={}",
            path.display(),
            ttl_secs
        ))
    }
}

/// Decorator adding jittered retry/timeout around any [`BlobStore`], per
/// spec §4.1's "failures retried with exponential backoff; beyond
/// budget surfaces as a storage-unavailable error that stalls a running
/// task".
pub struct RetryingBlobStore<S: BlobStore> {
    inner: S,
    policy: kb_retry::RetryPolicy,
}

impl<S: BlobStore> RetryingBlobStore<S> {
    pub fn new(inner: S) -> Self {
        RetryingBlobStore {
            inner,
            policy: kb_retry::RetryPolicy::default(),
        }
    }

    pub fn with_policy(inner: S, policy: kb_retry::RetryPolicy) -> Self {
        RetryingBlobStore { inner, policy }
    }

    fn classify(err: &BlobError) -> kb_retry::RetryOutcome {
        match err {
            BlobError::NotFound { .. } => kb_retry::RetryOutcome::NonRetryable,
            BlobError::Io(_) | BlobError::Unavailable { .. } => kb_retry::RetryOutcome::Retryable,
        }
    }
}

#[async_trait]
impl<S: BlobStore> BlobStore for RetryingBlobStore<S> {
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String, BlobError> {
        kb_retry::retry(
            &self.policy,
            || self.inner.put(bucket, key, bytes.clone(), content_type),
            Self::classify,
        )
        .await
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, BlobError> {
        kb_retry::retry(&self.policy, || self.inner.get(bucket, key), Self::classify).await
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<(), BlobError> {
        kb_retry::retry(&self.policy, || self.inner.delete(bucket, key), Self::classify).await
    }

    async fn presign(&self, bucket: &str, key: &str, ttl_secs: u64) -> Result<String, BlobError> {
        kb_retry::retry(
            &self.policy,
            || self.inner.presign(bucket, key, ttl_secs),
            Self::classify,
        )
        .await
    }
}

pub fn raw_key(checksum: &str) -> String {
    format!("docs/{checksum}/raw")
}

pub fn page_image_key(version_id: Uuid, page_number: u32) -> String {
    format!("pages/{version_id}/{page_number}/image.png")
}

pub fn page_ocr_key(version_id: Uuid, page_number: u32) -> String {
    format!("pages/{version_id}/{page_number}/ocr.json")
}
