use crate::models::OwnerUsage;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;

#[async_trait]
pub trait UsageRepository: Send + Sync {
    /// Fetch the owner's row, creating it with `default_quota` if absent.
    async fn ensure(&self, owner_id: &str, default_quota: i64) -> Result<OwnerUsage, sqlx::Error>;

    /// Atomically add `delta` bytes, creating the row if needed.
    async fn add(
        &self,
        owner_id: &str,
        delta: i64,
        default_quota: i64,
    ) -> Result<OwnerUsage, sqlx::Error>;

    /// Atomically subtract `delta` bytes, never going below zero.
    async fn subtract(&self, owner_id: &str, delta: i64)
    -> Result<Option<OwnerUsage>, sqlx::Error>;

    async fn set_quota(&self, owner_id: &str, quota_bytes: i64)
    -> Result<OwnerUsage, sqlx::Error>;

    /// Compare-and-set used by drift repair.
    async fn set_used(&self, owner_id: &str, expected: i64, used: i64)
    -> Result<bool, sqlx::Error>;

    async fn list_all(&self) -> Result<Vec<OwnerUsage>, sqlx::Error>;
}

#[derive(Clone)]
pub struct SqliteUsageRepository {
    pool: SqlitePool,
}

impl SqliteUsageRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UsageRepository for SqliteUsageRepository {
    async fn ensure(&self, owner_id: &str, default_quota: i64) -> Result<OwnerUsage, sqlx::Error> {
        sqlx::query_as::<_, OwnerUsage>(
            "INSERT INTO owner_usage (owner_id, used_bytes, quota_bytes, updated_at)
             VALUES (?1, 0, ?2, ?3)
             ON CONFLICT(owner_id) DO UPDATE SET owner_id = excluded.owner_id
             RETURNING *",
        )
        .bind(owner_id)
        .bind(default_quota)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
    }

    async fn add(
        &self,
        owner_id: &str,
        delta: i64,
        default_quota: i64,
    ) -> Result<OwnerUsage, sqlx::Error> {
        sqlx::query_as::<_, OwnerUsage>(
            "INSERT INTO owner_usage (owner_id, used_bytes, quota_bytes, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(owner_id) DO UPDATE SET
                 used_bytes = owner_usage.used_bytes + excluded.used_bytes,
                 updated_at = excluded.updated_at
             RETURNING *",
        )
        .bind(owner_id)
        .bind(delta)
        .bind(default_quota)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
    }

    async fn subtract(
        &self,
        owner_id: &str,
        delta: i64,
    ) -> Result<Option<OwnerUsage>, sqlx::Error> {
        sqlx::query_as::<_, OwnerUsage>(
            "UPDATE owner_usage SET used_bytes = MAX(used_bytes - ?2, 0), updated_at = ?3
             WHERE owner_id = ?1
             RETURNING *",
        )
        .bind(owner_id)
        .bind(delta)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await
    }

    async fn set_quota(
        &self,
        owner_id: &str,
        quota_bytes: i64,
    ) -> Result<OwnerUsage, sqlx::Error> {
        sqlx::query_as::<_, OwnerUsage>(
            "INSERT INTO owner_usage (owner_id, used_bytes, quota_bytes, updated_at)
             VALUES (?1, 0, ?2, ?3)
             ON CONFLICT(owner_id) DO UPDATE SET
                 quota_bytes = excluded.quota_bytes,
                 updated_at = excluded.updated_at
             RETURNING *",
        )
        .bind(owner_id)
        .bind(quota_bytes)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
    }

    async fn set_used(
        &self,
        owner_id: &str,
        expected: i64,
        used: i64,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE owner_usage SET used_bytes = ?3, updated_at = ?4
             WHERE owner_id = ?1 AND used_bytes = ?2",
        )
        .bind(owner_id)
        .bind(expected)
        .bind(used)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn list_all(&self) -> Result<Vec<OwnerUsage>, sqlx::Error> {
        sqlx::query_as::<_, OwnerUsage>("SELECT * FROM owner_usage ORDER BY owner_id")
            .fetch_all(&self.pool)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;

    #[tokio::test]
    async fn test_ensure_uses_default_once() {
        let repo = SqliteUsageRepository::new(test_pool().await);
        let first = repo.ensure("alice", 100).await.unwrap();
        assert_eq!((first.used_bytes, first.quota_bytes), (0, 100));

        let again = repo.ensure("alice", 999).await.unwrap();
        assert_eq!(again.quota_bytes, 100);
    }

    #[tokio::test]
    async fn test_add_and_subtract_clamp_at_zero() {
        let repo = SqliteUsageRepository::new(test_pool().await);
        let added = repo.add("bob", 40, 100).await.unwrap();
        assert_eq!(added.used_bytes, 40);
        let added = repo.add("bob", 2, 100).await.unwrap();
        assert_eq!(added.used_bytes, 42);

        let after = repo.subtract("bob", 50).await.unwrap().unwrap();
        assert_eq!(after.used_bytes, 0);
        assert!(repo.subtract("nobody", 1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_set_quota_and_cas() {
        let repo = SqliteUsageRepository::new(test_pool().await);
        repo.add("carol", 10, 100).await.unwrap();
        let updated = repo.set_quota("carol", 5).await.unwrap();
        assert_eq!((updated.used_bytes, updated.quota_bytes), (10, 5));

        assert!(!repo.set_used("carol", 9, 3).await.unwrap());
        assert!(repo.set_used("carol", 10, 3).await.unwrap());
        assert_eq!(repo.list_all().await.unwrap()[0].used_bytes, 3);
    }
}
