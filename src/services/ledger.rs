//! Content ledger: reference-counted ownership of physical blobs.
//!
//! A hash moves Absent → Present(1) → Present(N) → Absent. Every change to
//! its count is a single atomic statement in [`ContentRepository`]. The blob
//! itself is written by whichever caller holds the row's write claim and
//! removed by whichever caller holds its delete claim, so no in-process lock
//! is needed and several vault instances may share one database.

use crate::{
    db::{ContentRepository, now_millis},
    errors::{VaultError, VaultResult},
    models::{ContentHash, ContentLocation, ContentRecord, ContentState, NewContent},
    services::with_timeout,
    storage::{StorageBackend, StorageError},
};
use bytes::Bytes;
use std::{sync::Arc, time::Duration};
use tokio::time::{Instant, sleep};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const INITIAL_POLL: Duration = Duration::from_millis(10);
const MAX_POLL: Duration = Duration::from_millis(250);

#[derive(Clone, Debug)]
pub struct LedgerSettings {
    pub storage_timeout: Duration,
    pub wait_timeout: Duration,
    pub claim_lease: Duration,
}

/// Result of dropping one reference.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Other references remain, or a live claim holder will finish the row.
    Retained { remaining: i64 },
    /// Last reference: blob and row are gone.
    Deleted,
    /// Last reference, but the blob could not be removed yet. The row stays
    /// in `deleting` for the reconciler.
    DeletePending,
    /// Last reference, but a new upload re-referenced the hash during deletion.
    Resurrected,
}

enum WriteOutcome {
    Present,
    /// Our lease expired mid-write and another caller now owns the claim.
    ClaimLost,
}

#[derive(Clone)]
pub struct ContentLedger {
    repo: Arc<dyn ContentRepository>,
    backend: Arc<dyn StorageBackend>,
    settings: LedgerSettings,
}

impl ContentLedger {
    pub fn new(
        repo: Arc<dyn ContentRepository>,
        backend: Arc<dyn StorageBackend>,
        settings: LedgerSettings,
    ) -> Self {
        Self {
            repo,
            backend,
            settings,
        }
    }

    pub fn repository(&self) -> &Arc<dyn ContentRepository> {
        &self.repo
    }

    fn lease_until(&self, now_ms: i64) -> i64 {
        now_ms + self.settings.claim_lease.as_millis() as i64
    }

    /// Take one reference on `content`, writing `data` if no blob exists yet.
    ///
    /// Exactly one concurrent caller per hash writes the blob. Every other
    /// caller waits, bounded by the wait timeout, until the blob is present;
    /// if the writer fails or its claim expires a waiter takes over the write.
    /// Any error leaves the reference count as it was before the call.
    pub async fn acquire_or_create(
        &self,
        content: NewContent,
        data: Bytes,
    ) -> VaultResult<ContentLease> {
        let token = Uuid::new_v4();
        let record = self
            .repo
            .upsert_increment(&content, token, self.lease_until(now_millis()))
            .await?;
        let hash = record.content_hash.clone();
        // From here on a dropped future releases the reference.
        let mut lease = ContentLease::new(self.clone(), record.location());

        let result = if record.claim_token == Some(token) {
            debug!(hash = %hash, path = %record.storage_path, "first reference, writing blob");
            match self.write_claimed(&record, token, &data).await {
                Ok(WriteOutcome::Present) => Ok(true),
                Ok(WriteOutcome::ClaimLost) => self.await_present(&hash, &data).await.map(|_| true),
                Err(err) => Err(err),
            }
        } else {
            debug!(
                hash = %hash,
                references = record.reference_count,
                "content already known, skipping write"
            );
            self.await_present(&hash, &data).await
        };

        match result {
            Ok(wrote) => {
                lease.created = wrote;
                Ok(lease)
            }
            Err(err) => {
                lease.rollback().await;
                Err(err)
            }
        }
    }

    /// Write the blob for a row whose claim `token` holds, then mark it present.
    async fn write_claimed(
        &self,
        record: &ContentRecord,
        token: Uuid,
        data: &Bytes,
    ) -> VaultResult<WriteOutcome> {
        let hash = &record.content_hash;
        let path = &record.storage_path;
        let stored = with_timeout(
            self.settings.storage_timeout,
            "store",
            path,
            self.backend.store(path, data.clone(), &record.mime_type),
        )
        .await;

        if let Err(err) = stored {
            warn!(hash = %hash, path = %path, error = %err, "blob write failed");
            if let Err(release_err) = self.repo.release_claim(hash, token).await {
                warn!(hash = %hash, error = %release_err, "failed to release write claim; it will expire");
            }
            return Err(err);
        }

        match self.repo.mark_present(hash, token).await? {
            Some(present) => {
                info!(hash = %hash, path = %path, bytes = present.byte_size, "content stored");
                if present.reference_count == 0 {
                    // Every reference went away while the write was in flight.
                    self.collect_unreferenced(hash).await;
                }
                Ok(WriteOutcome::Present)
            }
            None => {
                warn!(hash = %hash, "write claim expired before completion");
                Ok(WriteOutcome::ClaimLost)
            }
        }
    }

    /// Poll until the row is present, taking over the write when the current
    /// claim holder disappears. Returns whether this call wrote the blob.
    async fn await_present(&self, hash: &ContentHash, data: &Bytes) -> VaultResult<bool> {
        let deadline = Instant::now() + self.settings.wait_timeout;
        let mut delay = INITIAL_POLL;
        let mut wrote = false;

        loop {
            let Some(record) = self.repo.get(hash).await? else {
                error!(hash = %hash, "content row vanished while referenced");
                return Err(VaultError::ReferenceIntegrity {
                    hash: hash.clone(),
                    detail: "content row vanished while a reference was held".into(),
                });
            };
            if record.state == ContentState::Present {
                return Ok(wrote);
            }

            let now = now_millis();
            if !record.has_live_claim(now) {
                let token = Uuid::new_v4();
                if let Some(claimed) = self
                    .repo
                    .try_claim_write(hash, token, now, self.lease_until(now))
                    .await?
                {
                    info!(hash = %hash, state = %record.state, "taking over abandoned write");
                    wrote = true;
                    if let WriteOutcome::Present = self.write_claimed(&claimed, token, data).await? {
                        return Ok(true);
                    }
                    continue;
                }
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(hash = %hash, state = %record.state, "gave up waiting for content");
                return Err(VaultError::storage(
                    "await_content",
                    record.storage_path,
                    StorageError::Timeout {
                        operation: "await_content",
                        after: self.settings.wait_timeout,
                    },
                ));
            }
            sleep(delay.min(deadline - now)).await;
            delay = (delay * 2).min(MAX_POLL);
        }
    }

    /// Take one more reference on content that already has at least one.
    pub async fn increment_existing(&self, hash: &ContentHash) -> VaultResult<ContentLease> {
        match self.repo.increment_existing(hash).await? {
            Some(record) => {
                debug!(hash = %hash, references = record.reference_count, "reference added");
                Ok(ContentLease::new(self.clone(), record.location()))
            }
            None => Err(VaultError::ContentNotFound(hash.clone())),
        }
    }

    /// Drop one reference. The last reference deletes the blob and then the row.
    pub async fn release(&self, hash: &ContentHash) -> VaultResult<ReleaseOutcome> {
        let token = Uuid::new_v4();
        let now = now_millis();
        let Some(record) = self
            .repo
            .decrement_or_delete(hash, token, now, self.lease_until(now))
            .await?
        else {
            error!(hash = %hash, "release of unreferenced content");
            return Err(VaultError::ReferenceIntegrity {
                hash: hash.clone(),
                detail: "reference count is already zero or the content is absent".into(),
            });
        };

        if record.state == ContentState::Deleting && record.claim_token == Some(token) {
            return Ok(self.delete_claimed(&record, token).await);
        }
        debug!(hash = %hash, remaining = record.reference_count, "reference released");
        Ok(ReleaseOutcome::Retained {
            remaining: record.reference_count,
        })
    }

    /// Release, recording the attempt for the reconciler if it fails transiently.
    /// Never returns an error; integrity violations are logged.
    pub async fn release_or_queue(
        &self,
        hash: &ContentHash,
        reason: &str,
    ) -> Option<ReleaseOutcome> {
        match self.release(hash).await {
            Ok(outcome) => Some(outcome),
            Err(err @ VaultError::ReferenceIntegrity { .. }) => {
                error!(hash = %hash, reason, error = %err, "reference release rejected");
                None
            }
            Err(err) => {
                warn!(hash = %hash, reason, error = %err, "reference release failed, queueing retry");
                let message = err.to_string();
                if let Err(queue_err) = self
                    .repo
                    .enqueue_release(hash, reason, Some(&message))
                    .await
                {
                    error!(
                        hash = %hash,
                        reason,
                        error = %queue_err,
                        "could not queue reference release; count stays high until reconciled"
                    );
                }
                None
            }
        }
    }

    /// Delete the blob of a row this caller has claimed for deletion.
    ///
    /// The reference is already gone at this point, so failures are logged
    /// rather than returned: retrying the release would drop a second reference.
    async fn delete_claimed(&self, record: &ContentRecord, token: Uuid) -> ReleaseOutcome {
        let hash = &record.content_hash;
        let path = &record.storage_path;

        let deleted = with_timeout(
            self.settings.storage_timeout,
            "delete",
            path,
            self.backend.delete(path),
        )
        .await;
        if let Err(err) = deleted {
            warn!(hash = %hash, path = %path, error = %err, "blob delete failed, left for reconciliation");
            if let Err(release_err) = self.repo.release_claim(hash, token).await {
                warn!(hash = %hash, error = %release_err, "failed to release delete claim; it will expire");
            }
            return ReleaseOutcome::DeletePending;
        }

        match self.repo.finalize_delete(hash, token).await {
            Ok(true) => {
                info!(hash = %hash, path = %path, "content deleted");
                ReleaseOutcome::Deleted
            }
            Ok(false) => {
                info!(hash = %hash, "content re-referenced during delete, handing back to writer");
                if let Err(err) = self.repo.release_claim(hash, token).await {
                    warn!(hash = %hash, error = %err, "failed to release delete claim; it will expire");
                }
                ReleaseOutcome::Resurrected
            }
            Err(err) => {
                warn!(hash = %hash, error = %err, "failed to remove content row, left for reconciliation");
                ReleaseOutcome::DeletePending
            }
        }
    }

    /// Claim and delete a row with no references and no live claim.
    /// Returns `None` when the row is referenced or claimed by someone else.
    pub async fn collect_unreferenced(&self, hash: &ContentHash) -> Option<ReleaseOutcome> {
        let token = Uuid::new_v4();
        let now = now_millis();
        match self
            .repo
            .claim_delete(hash, token, now, self.lease_until(now))
            .await
        {
            Ok(Some(record)) => Some(self.delete_claimed(&record, token).await),
            Ok(None) => None,
            Err(err) => {
                warn!(hash = %hash, error = %err, "failed to claim unreferenced content");
                None
            }
        }
    }

    /// Finish a write whose claimant went away, if the blob made it to storage.
    /// Returns true when the row is now present.
    pub async fn recover_abandoned_write(&self, record: &ContentRecord) -> VaultResult<bool> {
        let hash = &record.content_hash;
        let token = Uuid::new_v4();
        let now = now_millis();
        let Some(claimed) = self
            .repo
            .try_claim_write(hash, token, now, self.lease_until(now))
            .await?
        else {
            return Ok(false);
        };

        let stat = with_timeout(
            self.settings.storage_timeout,
            "stat",
            &claimed.storage_path,
            self.backend.stat(&claimed.storage_path),
        )
        .await;
        let complete = matches!(&stat, Ok(s) if s.size as i64 == claimed.byte_size);
        if complete && self.repo.mark_present(hash, token).await?.is_some() {
            info!(hash = %hash, "recovered abandoned write");
            return Ok(true);
        }

        self.repo.release_claim(hash, token).await?;
        warn!(
            hash = %hash,
            path = %claimed.storage_path,
            "abandoned write has no complete blob; waiting for a new upload of this content"
        );
        Ok(false)
    }

    /// Location of present content, `None` otherwise.
    pub async fn lookup(&self, hash: &ContentHash) -> VaultResult<Option<ContentLocation>> {
        Ok(self
            .repo
            .get(hash)
            .await?
            .filter(|r| r.state == ContentState::Present && r.reference_count > 0)
            .map(|r| r.location()))
    }
}

/// One reference on a content row, held until committed.
///
/// Dropping an uncommitted lease, for example when the request future is
/// cancelled, releases the reference on a background task.
#[must_use = "an uncommitted lease releases its reference when dropped"]
pub struct ContentLease {
    ledger: ContentLedger,
    location: ContentLocation,
    created: bool,
    armed: bool,
}

impl std::fmt::Debug for ContentLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentLease")
            .field("location", &self.location)
            .field("created", &self.created)
            .field("armed", &self.armed)
            .finish_non_exhaustive()
    }
}

impl ContentLease {
    fn new(ledger: ContentLedger, location: ContentLocation) -> Self {
        Self {
            ledger,
            location,
            created: false,
            armed: true,
        }
    }

    pub fn location(&self) -> &ContentLocation {
        &self.location
    }

    /// Whether this call wrote the blob.
    pub fn created(&self) -> bool {
        self.created
    }

    /// Keep the reference.
    pub fn commit(mut self) -> ContentLocation {
        self.armed = false;
        self.location.clone()
    }

    /// Give the reference back now.
    pub async fn rollback(mut self) {
        self.armed = false;
        self.ledger
            .release_or_queue(&self.location.content_hash, "rollback")
            .await;
    }
}

impl Drop for ContentLease {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let ledger = self.ledger.clone();
        let hash = self.location.content_hash.clone();
        warn!(hash = %hash, "content lease dropped uncommitted, releasing reference");
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    ledger.release_or_queue(&hash, "cancelled").await;
                });
            }
            Err(_) => {
                error!(hash = %hash, "no runtime to release dropped lease; count stays high until reconciled");
            }
        }
    }
}
