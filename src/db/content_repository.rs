//! Content ledger storage.
//!
//! Every method is a single SQL statement so that concurrent callers, in this
//! process or another, observe each reference-count change atomically.

use crate::models::{ContentHash, ContentRecord, NewContent, PendingRelease};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

#[async_trait]
pub trait ContentRepository: Send + Sync {
    /// Insert the row with `reference_count = 1` in state `pending`, claimed
    /// by `token`, or increment an existing row. The returned record carries
    /// `token` only when this call created the row.
    async fn upsert_increment(
        &self,
        content: &NewContent,
        token: Uuid,
        lease_expires_at: i64,
    ) -> Result<ContentRecord, sqlx::Error>;

    /// Increment a row whose count is already positive.
    async fn increment_existing(
        &self,
        hash: &ContentHash,
    ) -> Result<Option<ContentRecord>, sqlx::Error>;

    /// Decrement a positive count. When the count reaches zero and no live
    /// claim exists, the row moves to `deleting` claimed by `token` in the
    /// same statement. Returns `None` if the row is absent or already zero.
    async fn decrement_or_delete(
        &self,
        hash: &ContentHash,
        token: Uuid,
        now_ms: i64,
        lease_expires_at: i64,
    ) -> Result<Option<ContentRecord>, sqlx::Error>;

    /// Take the write claim of a referenced, non-present row whose claim is
    /// absent or expired.
    async fn try_claim_write(
        &self,
        hash: &ContentHash,
        token: Uuid,
        now_ms: i64,
        lease_expires_at: i64,
    ) -> Result<Option<ContentRecord>, sqlx::Error>;

    /// Mark the blob durable. Fails (`None`) if `token` no longer holds the claim.
    async fn mark_present(
        &self,
        hash: &ContentHash,
        token: Uuid,
    ) -> Result<Option<ContentRecord>, sqlx::Error>;

    /// Drop a write or delete claim. A `deleting` row that was re-referenced
    /// meanwhile goes back to `pending` so a new writer can restore the blob.
    async fn release_claim(&self, hash: &ContentHash, token: Uuid) -> Result<bool, sqlx::Error>;

    /// Take the delete claim of an unreferenced row whose claim is absent or expired.
    async fn claim_delete(
        &self,
        hash: &ContentHash,
        token: Uuid,
        now_ms: i64,
        lease_expires_at: i64,
    ) -> Result<Option<ContentRecord>, sqlx::Error>;

    /// Remove the row if `token` holds the delete claim and it is still unreferenced.
    async fn finalize_delete(&self, hash: &ContentHash, token: Uuid) -> Result<bool, sqlx::Error>;

    async fn get(&self, hash: &ContentHash) -> Result<Option<ContentRecord>, sqlx::Error>;

    async fn list_all(&self) -> Result<Vec<ContentRecord>, sqlx::Error>;

    /// Compare-and-set used by drift repair.
    async fn set_reference_count(
        &self,
        hash: &ContentHash,
        expected: i64,
        new_count: i64,
    ) -> Result<bool, sqlx::Error>;

    async fn enqueue_release(
        &self,
        hash: &ContentHash,
        reason: &str,
        error: Option<&str>,
    ) -> Result<i64, sqlx::Error>;

    async fn pending_releases(&self, limit: i64) -> Result<Vec<PendingRelease>, sqlx::Error>;

    async fn complete_pending_release(&self, id: i64) -> Result<(), sqlx::Error>;

    async fn fail_pending_release(&self, id: i64, error: &str) -> Result<(), sqlx::Error>;
}

#[derive(Clone)]
pub struct SqliteContentRepository {
    pool: SqlitePool,
}

impl SqliteContentRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ContentRepository for SqliteContentRepository {
    async fn upsert_increment(
        &self,
        content: &NewContent,
        token: Uuid,
        lease_expires_at: i64,
    ) -> Result<ContentRecord, sqlx::Error> {
        let now = Utc::now();
        sqlx::query_as::<_, ContentRecord>(
            r#"
            INSERT INTO content_records (
                content_hash, storage_path, byte_size, mime_type, reference_count,
                state, claim_token, lease_expires_at, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, 1, 'pending', ?5, ?6, ?7, ?7)
            ON CONFLICT(content_hash) DO UPDATE SET
                reference_count = content_records.reference_count + 1,
                updated_at = excluded.updated_at
            RETURNING *
            "#,
        )
        .bind(&content.content_hash)
        .bind(&content.storage_path)
        .bind(content.byte_size)
        .bind(&content.mime_type)
        .bind(token)
        .bind(lease_expires_at)
        .bind(now)
        .fetch_one(&self.pool)
        .await
    }

    async fn increment_existing(
        &self,
        hash: &ContentHash,
    ) -> Result<Option<ContentRecord>, sqlx::Error> {
        sqlx::query_as::<_, ContentRecord>(
            "UPDATE content_records
             SET reference_count = reference_count + 1, updated_at = ?2
             WHERE content_hash = ?1 AND reference_count > 0
             RETURNING *",
        )
        .bind(hash)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await
    }

    async fn decrement_or_delete(
        &self,
        hash: &ContentHash,
        token: Uuid,
        now_ms: i64,
        lease_expires_at: i64,
    ) -> Result<Option<ContentRecord>, sqlx::Error> {
        // Right-hand sides see the pre-update row.
        sqlx::query_as::<_, ContentRecord>(
            r#"
            UPDATE content_records SET
                reference_count = reference_count - 1,
                state = CASE
                    WHEN reference_count = 1
                         AND (claim_token IS NULL OR lease_expires_at IS NULL OR lease_expires_at < ?2)
                    THEN 'deleting' ELSE state END,
                claim_token = CASE
                    WHEN reference_count = 1
                         AND (claim_token IS NULL OR lease_expires_at IS NULL OR lease_expires_at < ?2)
                    THEN ?3 ELSE claim_token END,
                lease_expires_at = CASE
                    WHEN reference_count = 1
                         AND (claim_token IS NULL OR lease_expires_at IS NULL OR lease_expires_at < ?2)
                    THEN ?4 ELSE lease_expires_at END,
                updated_at = ?5
            WHERE content_hash = ?1 AND reference_count > 0
            RETURNING *
            "#,
        )
        .bind(hash)
        .bind(now_ms)
        .bind(token)
        .bind(lease_expires_at)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await
    }

    async fn try_claim_write(
        &self,
        hash: &ContentHash,
        token: Uuid,
        now_ms: i64,
        lease_expires_at: i64,
    ) -> Result<Option<ContentRecord>, sqlx::Error> {
        sqlx::query_as::<_, ContentRecord>(
            r#"
            UPDATE content_records
            SET state = 'pending', claim_token = ?3, lease_expires_at = ?4, updated_at = ?5
            WHERE content_hash = ?1
              AND reference_count > 0
              AND state != 'present'
              AND (claim_token IS NULL OR lease_expires_at IS NULL OR lease_expires_at < ?2)
            RETURNING *
            "#,
        )
        .bind(hash)
        .bind(now_ms)
        .bind(token)
        .bind(lease_expires_at)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await
    }

    async fn mark_present(
        &self,
        hash: &ContentHash,
        token: Uuid,
    ) -> Result<Option<ContentRecord>, sqlx::Error> {
        sqlx::query_as::<_, ContentRecord>(
            "UPDATE content_records
             SET state = 'present', claim_token = NULL, lease_expires_at = NULL, updated_at = ?3
             WHERE content_hash = ?1 AND claim_token = ?2 AND state = 'pending'
             RETURNING *",
        )
        .bind(hash)
        .bind(token)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await
    }

    async fn release_claim(&self, hash: &ContentHash, token: Uuid) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE content_records SET
                state = CASE WHEN state = 'deleting' AND reference_count > 0
                             THEN 'pending' ELSE state END,
                claim_token = NULL,
                lease_expires_at = NULL,
                updated_at = ?3
            WHERE content_hash = ?1 AND claim_token = ?2
            "#,
        )
        .bind(hash)
        .bind(token)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn claim_delete(
        &self,
        hash: &ContentHash,
        token: Uuid,
        now_ms: i64,
        lease_expires_at: i64,
    ) -> Result<Option<ContentRecord>, sqlx::Error> {
        sqlx::query_as::<_, ContentRecord>(
            r#"
            UPDATE content_records
            SET state = 'deleting', claim_token = ?3, lease_expires_at = ?4, updated_at = ?5
            WHERE content_hash = ?1
              AND reference_count = 0
              AND (claim_token IS NULL OR lease_expires_at IS NULL OR lease_expires_at < ?2)
            RETURNING *
            "#,
        )
        .bind(hash)
        .bind(now_ms)
        .bind(token)
        .bind(lease_expires_at)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await
    }

    async fn finalize_delete(&self, hash: &ContentHash, token: Uuid) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "DELETE FROM content_records
             WHERE content_hash = ?1 AND claim_token = ?2 AND reference_count = 0",
        )
        .bind(hash)
        .bind(token)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn get(&self, hash: &ContentHash) -> Result<Option<ContentRecord>, sqlx::Error> {
        sqlx::query_as::<_, ContentRecord>("SELECT * FROM content_records WHERE content_hash = ?")
            .bind(hash)
            .fetch_optional(&self.pool)
            .await
    }

    async fn list_all(&self) -> Result<Vec<ContentRecord>, sqlx::Error> {
        sqlx::query_as::<_, ContentRecord>("SELECT * FROM content_records ORDER BY content_hash")
            .fetch_all(&self.pool)
            .await
    }

    async fn set_reference_count(
        &self,
        hash: &ContentHash,
        expected: i64,
        new_count: i64,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE content_records SET reference_count = ?3, updated_at = ?4
             WHERE content_hash = ?1 AND reference_count = ?2",
        )
        .bind(hash)
        .bind(expected)
        .bind(new_count)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn enqueue_release(
        &self,
        hash: &ContentHash,
        reason: &str,
        error: Option<&str>,
    ) -> Result<i64, sqlx::Error> {
        let now = Utc::now();
        sqlx::query_scalar(
            "INSERT INTO pending_releases (content_hash, reason, attempts, last_error, created_at, updated_at)
             VALUES (?1, ?2, 0, ?3, ?4, ?4)
             RETURNING id",
        )
        .bind(hash)
        .bind(reason)
        .bind(error)
        .bind(now)
        .fetch_one(&self.pool)
        .await
    }

    async fn pending_releases(&self, limit: i64) -> Result<Vec<PendingRelease>, sqlx::Error> {
        sqlx::query_as::<_, PendingRelease>("SELECT * FROM pending_releases ORDER BY id LIMIT ?")
            .bind(limit)
            .fetch_all(&self.pool)
            .await
    }

    async fn complete_pending_release(&self, id: i64) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM pending_releases WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn fail_pending_release(&self, id: i64, error: &str) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE pending_releases SET attempts = attempts + 1, last_error = ?2, updated_at = ?3
             WHERE id = ?1",
        )
        .bind(id)
        .bind(error)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
