//! Upload, download, delete and reference-copy orchestration.
//!
//! Upload: validate → reserve quota → hash → acquire content → insert file
//! record → commit quota. Delete: remove file record → release content →
//! refund quota. Reference copy: new file record on existing content, no
//! bytes written.
//!
//! The steps after the ledger mutation run on a spawned task, so a caller
//! that goes away mid-request cannot leave a reference taken without a file
//! record, or a file record removed without its reference released.

use crate::{
    config::EngineConfig,
    db::{
        FileRecordRepository, SqliteContentRepository, SqliteFileRecordRepository,
        SqliteUsageRepository,
    },
    errors::{VaultError, VaultResult},
    models::{
        ContentHash, ContentLocation, FileRecord, FileRecordUpdate, NewContent, NewFileRecord,
        OwnerUsage, Scope, Visibility,
        scope::{storage_path, validate_identifier},
    },
    services::{
        hasher,
        ledger::{ContentLease, ContentLedger, LedgerSettings},
        quota::QuotaEnforcer,
        with_timeout,
    },
    storage::{ByteStream, StorageBackend, StorageError},
};
use bytes::Bytes;
use sqlx::SqlitePool;
use std::{sync::Arc, time::Duration};
use tracing::{error, info, warn};
use uuid::Uuid;

const MAX_DISPLAY_NAME_LEN: usize = 255;
const MAX_MIME_LEN: usize = 255;
const MAX_SHARE_TOKEN_LEN: usize = 128;
const DEFAULT_MIME: &str = "application/octet-stream";

#[derive(Clone, Debug)]
pub struct UploadRequest {
    pub owner_id: String,
    pub scope: Scope,
    pub folder_id: Option<String>,
    pub display_name: String,
    /// Falls back to `application/octet-stream`.
    pub mime_type: Option<String>,
    pub visibility: Visibility,
    pub data: Bytes,
}

/// Where a reference copy lands.
#[derive(Clone, Debug)]
pub struct CopyTarget {
    pub owner_id: String,
    pub folder_id: Option<String>,
    /// Keeps the source name when `None`.
    pub display_name: Option<String>,
}

pub struct Download {
    pub record: FileRecord,
    pub location: ContentLocation,
    pub stream: ByteStream,
}

#[derive(Clone, Debug)]
pub struct VaultLimits {
    pub max_upload_bytes: i64,
    pub storage_timeout: Duration,
}

#[derive(Clone)]
pub struct VaultService {
    ledger: ContentLedger,
    quota: QuotaEnforcer,
    files: Arc<dyn FileRecordRepository>,
    backend: Arc<dyn StorageBackend>,
    limits: VaultLimits,
}

impl VaultService {
    pub fn new(
        ledger: ContentLedger,
        quota: QuotaEnforcer,
        files: Arc<dyn FileRecordRepository>,
        backend: Arc<dyn StorageBackend>,
        limits: VaultLimits,
    ) -> Self {
        Self {
            ledger,
            quota,
            files,
            backend,
            limits,
        }
    }

    /// Wire the SQLite repositories over `pool`.
    pub fn from_pool(
        pool: SqlitePool,
        backend: Arc<dyn StorageBackend>,
        engine: &EngineConfig,
    ) -> Self {
        let ledger = ContentLedger::new(
            Arc::new(SqliteContentRepository::new(pool.clone())),
            backend.clone(),
            LedgerSettings {
                storage_timeout: engine.storage_timeout,
                wait_timeout: engine.content_wait_timeout,
                claim_lease: engine.claim_lease,
            },
        );
        let quota = QuotaEnforcer::new(
            Arc::new(SqliteUsageRepository::new(pool.clone())),
            engine.default_quota_bytes,
        );
        Self::new(
            ledger,
            quota,
            Arc::new(SqliteFileRecordRepository::new(pool)),
            backend,
            VaultLimits {
                max_upload_bytes: engine.max_upload_bytes,
                storage_timeout: engine.storage_timeout,
            },
        )
    }

    pub fn ledger(&self) -> &ContentLedger {
        &self.ledger
    }

    pub fn quota(&self) -> &QuotaEnforcer {
        &self.quota
    }

    pub fn files(&self) -> &Arc<dyn FileRecordRepository> {
        &self.files
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    pub async fn upload_content(&self, req: UploadRequest) -> VaultResult<FileRecord> {
        validate_identifier("owner id", &req.owner_id)?;
        req.scope.validate()?;
        validate_folder(req.folder_id.as_deref())?;
        validate_display_name(&req.display_name)?;
        let mime_type = normalize_mime(req.mime_type.as_deref())?;
        let size = req.data.len() as i64;
        if size > self.limits.max_upload_bytes {
            return Err(VaultError::Validation(format!(
                "upload of {size} bytes exceeds the {} byte limit",
                self.limits.max_upload_bytes
            )));
        }

        self.quota.reserve(&req.owner_id, size).await?;

        let hash = hasher::hash_bytes(&req.data);
        let content = NewContent {
            storage_path: storage_path(&req.scope, &req.owner_id, &hash),
            content_hash: hash.clone(),
            byte_size: size,
            mime_type: mime_type.clone(),
        };
        let lease = self.ledger.acquire_or_create(content, req.data).await?;
        let created = lease.created();

        let record = self
            .persist(
                NewFileRecord {
                    owner_id: req.owner_id,
                    folder_id: req.folder_id,
                    display_name: req.display_name,
                    mime_type,
                    content_hash: hash,
                    visibility: req.visibility,
                    logical_size: lease.location().byte_size,
                },
                lease,
            )
            .await?;

        info!(
            file_id = %record.id,
            owner_id = %record.owner_id,
            hash = %record.content_hash,
            bytes = record.logical_size,
            deduplicated = !created,
            "upload committed"
        );
        Ok(record)
    }

    /// Insert the file record, then commit the lease and charge quota, or
    /// roll the lease back if the insert fails.
    async fn persist(&self, new_record: NewFileRecord, lease: ContentLease) -> VaultResult<FileRecord> {
        let files = self.files.clone();
        let quota = self.quota.clone();
        tokio::spawn(async move {
            match files.insert(&new_record).await {
                Ok(record) => {
                    lease.commit();
                    if let Err(err) = quota.commit(&record.owner_id, record.logical_size).await {
                        warn!(
                            owner_id = %record.owner_id,
                            bytes = record.logical_size,
                            error = %err,
                            "usage not charged, left for reconciliation"
                        );
                    }
                    Ok(record)
                }
                Err(err) => {
                    warn!(
                        hash = %new_record.content_hash,
                        error = %err,
                        "file record insert failed, releasing content reference"
                    );
                    lease.rollback().await;
                    Err(VaultError::from(err))
                }
            }
        })
        .await?
    }

    pub async fn get_file(&self, file_id: Uuid) -> VaultResult<FileRecord> {
        self.files
            .get(file_id)
            .await?
            .ok_or_else(|| VaultError::NotFound(format!("file {file_id}")))
    }

    async fn owned_file(&self, file_id: Uuid, requester: &str) -> VaultResult<FileRecord> {
        let record = self.get_file(file_id).await?;
        if record.owner_id != requester {
            warn!(file_id = %file_id, requester, "access to file owned by someone else");
            return Err(VaultError::PermissionDenied(format!(
                "file {file_id} is not owned by {requester}"
            )));
        }
        Ok(record)
    }

    pub async fn download_content(&self, file_id: Uuid) -> VaultResult<Download> {
        let record = self.get_file(file_id).await?;
        let location = self.present_location(&record.content_hash).await?;

        let stream = match with_timeout(
            self.limits.storage_timeout,
            "get",
            &location.storage_path,
            self.backend.get(&location.storage_path),
        )
        .await
        {
            Ok(stream) => stream,
            Err(VaultError::StorageBackend {
                source: StorageError::NotFound { path },
                ..
            }) => {
                error!(hash = %record.content_hash, path = %path, "present content has no blob");
                return Err(VaultError::ContentNotFound(record.content_hash));
            }
            Err(err) => return Err(err),
        };

        if let Err(err) = self.files.increment_downloads(file_id).await {
            warn!(file_id = %file_id, error = %err, "failed to count download");
        }
        Ok(Download {
            record,
            location,
            stream,
        })
    }

    async fn present_location(&self, hash: &ContentHash) -> VaultResult<ContentLocation> {
        self.ledger.lookup(hash).await?.ok_or_else(|| {
            error!(hash = %hash, "file record points at content that is not present");
            VaultError::ContentNotFound(hash.clone())
        })
    }

    /// Remove a file. The file record deletion is the point of success; the
    /// content release and quota refund that follow never fail the call.
    pub async fn delete_content(&self, file_id: Uuid, requester: &str) -> VaultResult<FileRecord> {
        self.owned_file(file_id, requester).await?;

        let files = self.files.clone();
        let ledger = self.ledger.clone();
        let quota = self.quota.clone();
        tokio::spawn(async move {
            let Some(deleted) = files.delete(file_id).await? else {
                return Err(VaultError::NotFound(format!("file {file_id}")));
            };
            let outcome = ledger
                .release_or_queue(&deleted.content_hash, "delete")
                .await;
            if let Err(err) = quota.release(&deleted.owner_id, deleted.logical_size).await {
                warn!(
                    owner_id = %deleted.owner_id,
                    bytes = deleted.logical_size,
                    error = %err,
                    "usage not refunded, left for reconciliation"
                );
            }
            info!(
                file_id = %deleted.id,
                hash = %deleted.content_hash,
                outcome = ?outcome,
                "file deleted"
            );
            Ok(deleted)
        })
        .await?
    }

    /// New file record sharing the source's content. No bytes are written.
    pub async fn create_reference_copy(
        &self,
        source_id: Uuid,
        target: CopyTarget,
    ) -> VaultResult<FileRecord> {
        validate_identifier("owner id", &target.owner_id)?;
        validate_folder(target.folder_id.as_deref())?;
        if let Some(name) = &target.display_name {
            validate_display_name(name)?;
        }

        let source = self.get_file(source_id).await?;
        self.quota
            .reserve(&target.owner_id, source.logical_size)
            .await?;
        let lease = self.ledger.increment_existing(&source.content_hash).await?;

        let record = self
            .persist(
                NewFileRecord {
                    owner_id: target.owner_id,
                    folder_id: target.folder_id,
                    display_name: target.display_name.unwrap_or(source.display_name),
                    mime_type: source.mime_type,
                    content_hash: source.content_hash,
                    visibility: Visibility::Private,
                    logical_size: source.logical_size,
                },
                lease,
            )
            .await?;
        info!(
            source_id = %source_id,
            file_id = %record.id,
            hash = %record.content_hash,
            "reference copy created"
        );
        Ok(record)
    }

    pub async fn list_files(
        &self,
        owner_id: &str,
        folder_id: Option<&str>,
    ) -> VaultResult<Vec<FileRecord>> {
        Ok(self.files.list_by_owner(owner_id, folder_id).await?)
    }

    async fn update_owned(
        &self,
        file_id: Uuid,
        requester: &str,
        update: FileRecordUpdate,
    ) -> VaultResult<FileRecord> {
        self.owned_file(file_id, requester).await?;
        self.files
            .update(file_id, &update)
            .await
            .map_err(|err| match err.as_database_error() {
                // share_token is the only unique column an update touches.
                Some(db) if db.is_unique_violation() => {
                    VaultError::Validation("share token already in use".into())
                }
                _ => VaultError::Database(err),
            })?
            .ok_or_else(|| VaultError::NotFound(format!("file {file_id}")))
    }

    pub async fn rename_file(
        &self,
        file_id: Uuid,
        requester: &str,
        display_name: &str,
    ) -> VaultResult<FileRecord> {
        validate_display_name(display_name)?;
        self.update_owned(
            file_id,
            requester,
            FileRecordUpdate {
                display_name: Some(display_name.to_string()),
                ..FileRecordUpdate::default()
            },
        )
        .await
    }

    pub async fn move_file(
        &self,
        file_id: Uuid,
        requester: &str,
        folder_id: Option<&str>,
    ) -> VaultResult<FileRecord> {
        validate_folder(folder_id)?;
        self.update_owned(
            file_id,
            requester,
            FileRecordUpdate {
                folder_id: Some(folder_id.map(str::to_string)),
                ..FileRecordUpdate::default()
            },
        )
        .await
    }

    /// `Shared` needs a share token issued by the caller; other visibilities
    /// clear any existing token.
    pub async fn set_visibility(
        &self,
        file_id: Uuid,
        requester: &str,
        visibility: Visibility,
        share_token: Option<String>,
    ) -> VaultResult<FileRecord> {
        let share_token = match (visibility, share_token) {
            (Visibility::Shared, Some(token)) => {
                if token.is_empty()
                    || token.len() > MAX_SHARE_TOKEN_LEN
                    || !token.bytes().all(|b| b.is_ascii_graphic())
                {
                    return Err(VaultError::Validation("malformed share token".into()));
                }
                Some(token)
            }
            (Visibility::Shared, None) => {
                return Err(VaultError::Validation(
                    "shared visibility requires a share token".into(),
                ));
            }
            (_, _) => None,
        };
        self.update_owned(
            file_id,
            requester,
            FileRecordUpdate {
                visibility: Some(visibility),
                share_token: Some(share_token),
                ..FileRecordUpdate::default()
            },
        )
        .await
    }

    pub async fn find_by_share_token(&self, token: &str) -> VaultResult<FileRecord> {
        self.files
            .get_by_share_token(token)
            .await?
            .filter(|r| r.visibility == Visibility::Shared)
            .ok_or_else(|| VaultError::NotFound("share token".into()))
    }

    /// Direct backend URL for a file, when the backend can sign one.
    pub async fn presigned_download_url(
        &self,
        file_id: Uuid,
        ttl: Duration,
    ) -> VaultResult<Option<String>> {
        let record = self.get_file(file_id).await?;
        let location = self.present_location(&record.content_hash).await?;
        with_timeout(
            self.limits.storage_timeout,
            "presign",
            &location.storage_path,
            self.backend.presigned_url(&location.storage_path, ttl),
        )
        .await
    }

    pub async fn usage(&self, owner_id: &str) -> VaultResult<OwnerUsage> {
        validate_identifier("owner id", owner_id)?;
        self.quota.usage(owner_id).await
    }

    pub async fn set_quota(&self, owner_id: &str, quota_bytes: i64) -> VaultResult<OwnerUsage> {
        validate_identifier("owner id", owner_id)?;
        self.quota.set_quota(owner_id, quota_bytes).await
    }
}

fn validate_folder(folder_id: Option<&str>) -> VaultResult<()> {
    match folder_id {
        Some(folder) => validate_identifier("folder id", folder),
        None => Ok(()),
    }
}

fn validate_display_name(name: &str) -> VaultResult<()> {
    if name.trim().is_empty() {
        return Err(VaultError::Validation("display name must not be blank".into()));
    }
    if name.len() > MAX_DISPLAY_NAME_LEN {
        return Err(VaultError::Validation(format!(
            "display name exceeds {MAX_DISPLAY_NAME_LEN} bytes"
        )));
    }
    if name.chars().any(|c| c.is_control() || c == '/' || c == '\\') {
        return Err(VaultError::Validation(
            "display name contains a path separator or control character".into(),
        ));
    }
    Ok(())
}

fn normalize_mime(mime: Option<&str>) -> VaultResult<String> {
    let Some(mime) = mime.map(str::trim).filter(|m| !m.is_empty()) else {
        return Ok(DEFAULT_MIME.to_string());
    };
    let valid = mime.len() <= MAX_MIME_LEN
        && mime.contains('/')
        && mime.bytes().all(|b| b.is_ascii_graphic() || b == b' ');
    if !valid {
        return Err(VaultError::Validation(format!("malformed mime type `{mime}`")));
    }
    Ok(mime.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_name_rules() {
        assert!(validate_display_name("report (final).pdf").is_ok());
        assert!(validate_display_name("   ").is_err());
        assert!(validate_display_name("a/b").is_err());
        assert!(validate_display_name("tab\there").is_err());
        assert!(validate_display_name(&"n".repeat(256)).is_err());
    }

    #[test]
    fn test_mime_normalization() {
        assert_eq!(normalize_mime(None).unwrap(), DEFAULT_MIME);
        assert_eq!(normalize_mime(Some("  ")).unwrap(), DEFAULT_MIME);
        assert_eq!(
            normalize_mime(Some("Text/Plain; charset=utf-8")).unwrap(),
            "text/plain; charset=utf-8"
        );
        assert!(matches!(
            normalize_mime(Some("nonsense")),
            Err(VaultError::Validation(_))
        ));
    }
}
