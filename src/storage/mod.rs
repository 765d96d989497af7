//! Physical blob storage.
//!
//! The engine talks to exactly one [`StorageBackend`], chosen at startup from
//! configuration by [`build_backend`]. Paths are opaque relative keys such as
//! `personal/alice/<sha256>`.

pub mod local;
pub mod s3;

use crate::config::StorageConfig;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::{StreamExt, stream::BoxStream};
use std::{io, sync::Arc, time::Duration};
use thiserror::Error;

pub use local::LocalBackend;
pub use s3::S3Backend;

/// Streamed blob body.
pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

const MAX_PATH_LEN: usize = 1024;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("blob `{path}` not found")]
    NotFound { path: String },
    #[error("invalid blob path `{path}`: {reason}")]
    InvalidPath { path: String, reason: &'static str },
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },
    #[error("backend returned HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("malformed backend response: {0}")]
    Protocol(String),
    #[error("backend misconfigured: {0}")]
    Config(String),
    #[error(transparent)]
    Request(#[from] reqwest::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Metadata about a stored blob.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlobStat {
    pub path: String,
    pub size: u64,
    pub mime_type: Option<String>,
    pub modified_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Write `data` at `path`, replacing anything already there.
    async fn store(&self, path: &str, data: Bytes, mime_type: &str) -> StorageResult<()>;

    /// Open a blob for streaming. Missing blobs yield [`StorageError::NotFound`].
    async fn get(&self, path: &str) -> StorageResult<ByteStream>;

    /// Remove a blob. Deleting a missing blob succeeds.
    async fn delete(&self, path: &str) -> StorageResult<()>;

    async fn exists(&self, path: &str) -> StorageResult<bool>;

    async fn stat(&self, path: &str) -> StorageResult<BlobStat>;

    /// Every blob under `prefix`, sorted by path. An empty prefix lists all.
    async fn list(&self, prefix: &str) -> StorageResult<Vec<BlobStat>>;

    /// Remove leftovers of interrupted writes last touched before `cutoff`.
    /// Backends whose writes are atomic server-side have nothing to purge.
    async fn purge_stale_temp(&self, _cutoff: DateTime<Utc>) -> StorageResult<usize> {
        Ok(0)
    }

    /// Time-limited direct download URL, when the backend supports one.
    async fn presigned_url(&self, path: &str, ttl: Duration) -> StorageResult<Option<String>>;

    fn backend_name(&self) -> &'static str;
}

/// Construct the configured backend.
pub fn build_backend(config: &StorageConfig) -> StorageResult<Arc<dyn StorageBackend>> {
    match config {
        StorageConfig::Local { root } => Ok(Arc::new(LocalBackend::new(root)?)),
        StorageConfig::S3(s3) => Ok(Arc::new(S3Backend::new(s3.clone())?)),
    }
}

/// Drain a stream into memory.
pub async fn collect_stream(mut stream: ByteStream) -> io::Result<Bytes> {
    let mut buf = BytesMut::new();
    while let Some(chunk) = stream.next().await {
        buf.extend_from_slice(&chunk?);
    }
    Ok(buf.freeze())
}

/// Reject paths that could escape the storage root or collide with
/// backend bookkeeping files.
pub fn ensure_path_safe(path: &str) -> StorageResult<()> {
    let invalid = |reason| {
        Err(StorageError::InvalidPath {
            path: path.to_string(),
            reason,
        })
    };
    if path.is_empty() {
        return invalid("empty");
    }
    if path.len() > MAX_PATH_LEN {
        return invalid("too long");
    }
    if path.starts_with('/') || path.ends_with('/') {
        return invalid("leading or trailing '/'");
    }
    if path
        .bytes()
        .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
    {
        return invalid("control character or backslash");
    }
    if path
        .split('/')
        .any(|segment| segment.is_empty() || segment.starts_with('.'))
    {
        return invalid("empty or dot-prefixed segment");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_safety() {
        assert!(ensure_path_safe("personal/alice/abc").is_ok());
        for bad in [
            "",
            "/abs",
            "trailing/",
            "a//b",
            "a/../b",
            "..",
            ".mime/x",
            "a\\b",
            "a\nb",
        ] {
            assert!(
                matches!(ensure_path_safe(bad), Err(StorageError::InvalidPath { .. })),
                "{bad:?} should be rejected"
            );
        }
        assert!(ensure_path_safe(&"a".repeat(MAX_PATH_LEN + 1)).is_err());
    }
}
