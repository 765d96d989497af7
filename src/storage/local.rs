//! Filesystem backend.
//!
//! Blobs live at `root/{path}`. Writes go to a temp file in the target
//! directory, are fsynced and then renamed into place, so readers never see
//! a partially written blob. The MIME type is kept in a sidecar tree under
//! `root/.mime/{path}`.

use super::{BlobStat, ByteStream, StorageBackend, StorageError, StorageResult, ensure_path_safe};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::{
    io::{self, ErrorKind, Write},
    path::{Path, PathBuf},
    time::Duration,
};
use tempfile::{Builder, NamedTempFile};
use tokio::fs::{self, File};
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

const MIME_DIR: &str = ".mime";
const TEMP_PREFIX: &str = ".tmp-";
/// A concurrent delete may prune the parent between `create_dir_all` and
/// the temp file creation.
const CREATE_ATTEMPTS: usize = 5;

fn write_atomic_blocking(target: &Path, data: &[u8]) -> io::Result<()> {
    let parent = target
        .parent()
        .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, "missing parent directory"))?;
    let mut tmp = create_temp_in(parent)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(target).map_err(|err| err.error)?;
    Ok(())
}

fn create_temp_in(parent: &Path) -> io::Result<NamedTempFile> {
    let mut attempt = 1;
    loop {
        let created = std::fs::create_dir_all(parent)
            .and_then(|_| Builder::new().prefix(TEMP_PREFIX).tempfile_in(parent));
        match created {
            Err(err) if err.kind() == ErrorKind::NotFound && attempt < CREATE_ATTEMPTS => {
                debug!(dir = %parent.display(), attempt, "parent pruned during write, retrying");
                attempt += 1;
            }
            other => return other,
        }
    }
}

#[derive(Clone, Debug)]
pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    /// Use `root` as the storage directory, creating it if needed.
    pub fn new(root: impl Into<PathBuf>) -> StorageResult<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn blob_path(&self, path: &str) -> StorageResult<PathBuf> {
        ensure_path_safe(path)?;
        Ok(self.root.join(path))
    }

    fn mime_path(&self, path: &str) -> PathBuf {
        self.root.join(MIME_DIR).join(path)
    }

    /// Runs on the blocking pool so a cancelled caller never strands a half
    /// written temp file: the write either lands or the temp file is dropped.
    async fn write_atomic(target: PathBuf, data: Bytes) -> StorageResult<()> {
        tokio::task::spawn_blocking(move || write_atomic_blocking(&target, &data))
            .await
            .map_err(|err| StorageError::Io(io::Error::other(err)))?
            .map_err(StorageError::Io)
    }

    /// Remove empty directories from `start` up to (not including) `stop`.
    async fn prune_empty_dirs(start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => match current.parent() {
                    Some(parent) => current = parent.to_path_buf(),
                    None => break,
                },
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!(dir = %current.display(), error = %err, "failed to prune directory");
                    break;
                }
            }
        }
    }

    async fn read_mime(&self, path: &str) -> Option<String> {
        fs::read_to_string(self.mime_path(path))
            .await
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    async fn stat_file(&self, path: &str, file_path: &Path) -> StorageResult<BlobStat> {
        let meta = fs::metadata(file_path).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                StorageError::NotFound {
                    path: path.to_string(),
                }
            } else {
                StorageError::Io(err)
            }
        })?;
        if !meta.is_file() {
            return Err(StorageError::NotFound {
                path: path.to_string(),
            });
        }
        Ok(BlobStat {
            path: path.to_string(),
            size: meta.len(),
            mime_type: self.read_mime(path).await,
            modified_at: meta.modified().ok().map(DateTime::<Utc>::from),
        })
    }
}

#[async_trait]
impl StorageBackend for LocalBackend {
    async fn store(&self, path: &str, data: Bytes, mime_type: &str) -> StorageResult<()> {
        let target = self.blob_path(path)?;
        let bytes = data.len();
        Self::write_atomic(target, data).await?;
        Self::write_atomic(
            self.mime_path(path),
            Bytes::copy_from_slice(mime_type.as_bytes()),
        )
        .await?;
        debug!(path, bytes, "stored blob");
        Ok(())
    }

    async fn get(&self, path: &str) -> StorageResult<ByteStream> {
        let target = self.blob_path(path)?;
        let file = File::open(&target).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                StorageError::NotFound {
                    path: path.to_string(),
                }
            } else {
                StorageError::Io(err)
            }
        })?;
        Ok(ReaderStream::new(file).boxed())
    }

    async fn delete(&self, path: &str) -> StorageResult<()> {
        let target = self.blob_path(path)?;
        match fs::remove_file(&target).await {
            Ok(_) => debug!(path, "removed blob"),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!(path, "blob already missing");
            }
            Err(err) => return Err(StorageError::Io(err)),
        }

        let mime = self.mime_path(path);
        if let Err(err) = fs::remove_file(&mime).await {
            if err.kind() != ErrorKind::NotFound {
                debug!(path, error = %err, "failed to remove mime sidecar");
            }
        }

        if let Some(parent) = target.parent() {
            Self::prune_empty_dirs(parent, &self.root).await;
        }
        if let Some(parent) = mime.parent() {
            Self::prune_empty_dirs(parent, &self.root.join(MIME_DIR)).await;
        }
        Ok(())
    }

    async fn exists(&self, path: &str) -> StorageResult<bool> {
        let target = self.blob_path(path)?;
        match fs::metadata(&target).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(StorageError::Io(err)),
        }
    }

    async fn stat(&self, path: &str) -> StorageResult<BlobStat> {
        let target = self.blob_path(path)?;
        self.stat_file(path, &target).await
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<BlobStat>> {
        let mut out = Vec::new();
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(StorageError::Io(err)),
            };
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name();
                if name.to_string_lossy().starts_with('.') {
                    continue;
                }
                let file_path = entry.path();
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    pending.push(file_path);
                    continue;
                }
                let Ok(relative) = file_path.strip_prefix(&self.root) else {
                    continue;
                };
                let key = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if !key.starts_with(prefix) {
                    continue;
                }
                match self.stat_file(&key, &file_path).await {
                    Ok(stat) => out.push(stat),
                    // Removed between read_dir and stat.
                    Err(StorageError::NotFound { .. }) => {}
                    Err(err) => return Err(err),
                }
            }
        }

        out.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(out)
    }

    async fn purge_stale_temp(&self, cutoff: DateTime<Utc>) -> StorageResult<usize> {
        let mut removed = 0;
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(StorageError::Io(err)),
            };
            while let Some(entry) = entries.next_entry().await? {
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    pending.push(entry.path());
                    continue;
                }
                if !entry.file_name().to_string_lossy().starts_with(TEMP_PREFIX) {
                    continue;
                }
                let stale = match entry.metadata().await.and_then(|m| m.modified()) {
                    Ok(modified) => DateTime::<Utc>::from(modified) <= cutoff,
                    Err(_) => false,
                };
                if !stale {
                    continue;
                }
                let file_path = entry.path();
                match fs::remove_file(&file_path).await {
                    Ok(_) => {
                        debug!(file = %file_path.display(), "removed stale temp file");
                        removed += 1;
                        if let Some(parent) = file_path.parent() {
                            Self::prune_empty_dirs(parent, &self.root).await;
                        }
                    }
                    Err(err) if err.kind() == ErrorKind::NotFound => {}
                    Err(err) => {
                        warn!(file = %file_path.display(), error = %err, "failed to remove stale temp file")
                    }
                }
            }
        }
        Ok(removed)
    }

    async fn presigned_url(&self, path: &str, _ttl: Duration) -> StorageResult<Option<String>> {
        ensure_path_safe(path)?;
        Ok(None)
    }

    fn backend_name(&self) -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::collect_stream;
    use tempfile::TempDir;

    fn setup_backend() -> (LocalBackend, TempDir) {
        let dir = TempDir::new().unwrap();
        let backend = LocalBackend::new(dir.path()).unwrap();
        (backend, dir)
    }

    #[tokio::test]
    async fn test_store_and_get_round_trip() {
        let (backend, _dir) = setup_backend();
        backend
            .store("personal/alice/h1", Bytes::from_static(b"hello"), "text/plain")
            .await
            .unwrap();

        let body = collect_stream(backend.get("personal/alice/h1").await.unwrap())
            .await
            .unwrap();
        assert_eq!(&body[..], b"hello");

        let stat = backend.stat("personal/alice/h1").await.unwrap();
        assert_eq!(stat.size, 5);
        assert_eq!(stat.mime_type.as_deref(), Some("text/plain"));
        assert!(stat.modified_at.is_some());
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let (backend, _dir) = setup_backend();
        let result = backend.get("personal/alice/missing").await;
        assert!(matches!(result, Err(StorageError::NotFound { .. })));
        assert!(!backend.exists("personal/alice/missing").await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_is_idempotent_and_prunes() {
        let (backend, dir) = setup_backend();
        backend
            .store("acme/bob/h2", Bytes::from_static(b"x"), "application/octet-stream")
            .await
            .unwrap();
        backend.delete("acme/bob/h2").await.unwrap();
        backend.delete("acme/bob/h2").await.unwrap();

        assert!(!backend.exists("acme/bob/h2").await.unwrap());
        assert!(!dir.path().join("acme").exists());
        assert!(!dir.path().join(MIME_DIR).join("acme").exists());
    }

    #[tokio::test]
    async fn test_overwrite_replaces_contents() {
        let (backend, _dir) = setup_backend();
        backend
            .store("p/o/h", Bytes::from_static(b"first"), "text/plain")
            .await
            .unwrap();
        backend
            .store("p/o/h", Bytes::from_static(b"second!"), "text/plain")
            .await
            .unwrap();
        assert_eq!(backend.stat("p/o/h").await.unwrap().size, 7);
    }

    #[tokio::test]
    async fn test_list_skips_bookkeeping_and_filters_prefix() {
        let (backend, _dir) = setup_backend();
        for path in ["personal/a/1", "personal/b/2", "acme/c/3"] {
            backend
                .store(path, Bytes::from_static(b"data"), "text/plain")
                .await
                .unwrap();
        }

        let all: Vec<_> = backend
            .list("")
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.path)
            .collect();
        assert_eq!(all, vec!["acme/c/3", "personal/a/1", "personal/b/2"]);

        let personal = backend.list("personal/").await.unwrap();
        assert_eq!(personal.len(), 2);
    }

    #[tokio::test]
    async fn test_rejects_traversal() {
        let (backend, _dir) = setup_backend();
        let result = backend
            .store("../escape", Bytes::from_static(b"x"), "text/plain")
            .await;
        assert!(matches!(result, Err(StorageError::InvalidPath { .. })));
    }

    fn temp_files(dir: &Path) -> Vec<PathBuf> {
        let mut found = Vec::new();
        let mut pending = vec![dir.to_path_buf()];
        while let Some(dir) = pending.pop() {
            let Ok(entries) = std::fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    pending.push(path);
                } else if entry.file_name().to_string_lossy().starts_with(TEMP_PREFIX) {
                    found.push(path);
                }
            }
        }
        found
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_store_survives_concurrent_prune() {
        let (backend, _dir) = setup_backend();
        for i in 0..100 {
            backend
                .store("personal/alice/victim", Bytes::from_static(b"old"), "text/plain")
                .await
                .unwrap();
            let path = format!("personal/alice/new{i}");

            let deleter = {
                let backend = backend.clone();
                tokio::spawn(async move { backend.delete("personal/alice/victim").await })
            };
            let storer = {
                let backend = backend.clone();
                let path = path.clone();
                tokio::spawn(async move {
                    backend
                        .store(&path, Bytes::from_static(b"new"), "text/plain")
                        .await
                })
            };

            deleter.await.unwrap().unwrap();
            storer.await.unwrap().unwrap();
            assert!(backend.exists(&path).await.unwrap());
            backend.delete(&path).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_timed_out_store_leaves_no_temp_file() {
        let (backend, dir) = setup_backend();
        let data = Bytes::from(vec![7u8; 8 * 1024 * 1024]);
        let result = tokio::time::timeout(
            Duration::from_millis(1),
            backend.store("personal/alice/big", data, "application/octet-stream"),
        )
        .await;
        assert!(!matches!(result, Ok(Err(_))));

        let mut leftovers = temp_files(dir.path());
        for _ in 0..100 {
            if leftovers.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
            leftovers = temp_files(dir.path());
        }
        assert!(leftovers.is_empty(), "temp files left behind: {leftovers:?}");
        assert!(backend.list("").await.unwrap().len() <= 1);
    }

    #[tokio::test]
    async fn test_purge_stale_temp_respects_cutoff() {
        let (backend, dir) = setup_backend();
        for sub in ["personal/alice", ".mime/personal/alice"] {
            let owner_dir = dir.path().join(sub);
            std::fs::create_dir_all(&owner_dir).unwrap();
            std::fs::write(owner_dir.join(".tmp-crashed"), b"partial").unwrap();
        }

        let past = Utc::now() - chrono::Duration::hours(1);
        assert_eq!(backend.purge_stale_temp(past).await.unwrap(), 0);
        assert_eq!(temp_files(dir.path()).len(), 2);

        let future = Utc::now() + chrono::Duration::minutes(1);
        assert_eq!(backend.purge_stale_temp(future).await.unwrap(), 2);
        assert!(temp_files(dir.path()).is_empty());
        assert!(!dir.path().join("personal").exists());
    }
}
