use crate::models::{ContentHash, FileRecord, FileRecordUpdate, NewFileRecord};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::{QueryBuilder, SqlitePool, sqlite::Sqlite};
use uuid::Uuid;

#[async_trait]
pub trait FileRecordRepository: Send + Sync {
    async fn insert(&self, record: &NewFileRecord) -> Result<FileRecord, sqlx::Error>;

    async fn get(&self, id: Uuid) -> Result<Option<FileRecord>, sqlx::Error>;

    /// Delete and return the record. `None` if it was already gone.
    async fn delete(&self, id: Uuid) -> Result<Option<FileRecord>, sqlx::Error>;

    /// Files of `owner_id`, optionally restricted to one folder, newest first.
    async fn list_by_owner(
        &self,
        owner_id: &str,
        folder_id: Option<&str>,
    ) -> Result<Vec<FileRecord>, sqlx::Error>;

    async fn update(
        &self,
        id: Uuid,
        update: &FileRecordUpdate,
    ) -> Result<Option<FileRecord>, sqlx::Error>;

    async fn increment_downloads(&self, id: Uuid) -> Result<(), sqlx::Error>;

    async fn get_by_share_token(&self, token: &str) -> Result<Option<FileRecord>, sqlx::Error>;

    /// Number of file records per referenced hash.
    async fn reference_counts(&self) -> Result<Vec<(ContentHash, i64)>, sqlx::Error>;

    /// Sum of `logical_size` per owner.
    async fn usage_by_owner(&self) -> Result<Vec<(String, i64)>, sqlx::Error>;
}

#[derive(Clone)]
pub struct SqliteFileRecordRepository {
    pool: SqlitePool,
}

impl SqliteFileRecordRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FileRecordRepository for SqliteFileRecordRepository {
    async fn insert(&self, record: &NewFileRecord) -> Result<FileRecord, sqlx::Error> {
        let now = Utc::now();
        sqlx::query_as::<_, FileRecord>(
            r#"
            INSERT INTO file_records (
                id, owner_id, folder_id, display_name, mime_type, content_hash,
                visibility, share_token, logical_size, download_count, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, NULL, ?8, 0, ?9, ?9)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&record.owner_id)
        .bind(&record.folder_id)
        .bind(&record.display_name)
        .bind(&record.mime_type)
        .bind(&record.content_hash)
        .bind(record.visibility)
        .bind(record.logical_size)
        .bind(now)
        .fetch_one(&self.pool)
        .await
    }

    async fn get(&self, id: Uuid) -> Result<Option<FileRecord>, sqlx::Error> {
        sqlx::query_as::<_, FileRecord>("SELECT * FROM file_records WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
    }

    async fn delete(&self, id: Uuid) -> Result<Option<FileRecord>, sqlx::Error> {
        sqlx::query_as::<_, FileRecord>("DELETE FROM file_records WHERE id = ? RETURNING *")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
    }

    async fn list_by_owner(
        &self,
        owner_id: &str,
        folder_id: Option<&str>,
    ) -> Result<Vec<FileRecord>, sqlx::Error> {
        let mut builder =
            QueryBuilder::<Sqlite>::new("SELECT * FROM file_records WHERE owner_id = ");
        builder.push_bind(owner_id);
        if let Some(folder) = folder_id {
            builder.push(" AND folder_id = ");
            builder.push_bind(folder);
        }
        builder.push(" ORDER BY created_at DESC, id");
        builder
            .build_query_as::<FileRecord>()
            .fetch_all(&self.pool)
            .await
    }

    async fn update(
        &self,
        id: Uuid,
        update: &FileRecordUpdate,
    ) -> Result<Option<FileRecord>, sqlx::Error> {
        let mut builder = QueryBuilder::<Sqlite>::new("UPDATE file_records SET updated_at = ");
        builder.push_bind(Utc::now());
        if let Some(name) = &update.display_name {
            builder.push(", display_name = ");
            builder.push_bind(name.clone());
        }
        if let Some(folder) = &update.folder_id {
            builder.push(", folder_id = ");
            builder.push_bind(folder.clone());
        }
        if let Some(visibility) = update.visibility {
            builder.push(", visibility = ");
            builder.push_bind(visibility);
        }
        if let Some(token) = &update.share_token {
            builder.push(", share_token = ");
            builder.push_bind(token.clone());
        }
        builder.push(" WHERE id = ");
        builder.push_bind(id);
        builder.push(" RETURNING *");
        builder
            .build_query_as::<FileRecord>()
            .fetch_optional(&self.pool)
            .await
    }

    async fn increment_downloads(&self, id: Uuid) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE file_records SET download_count = download_count + 1 WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_by_share_token(&self, token: &str) -> Result<Option<FileRecord>, sqlx::Error> {
        sqlx::query_as::<_, FileRecord>("SELECT * FROM file_records WHERE share_token = ?")
            .bind(token)
            .fetch_optional(&self.pool)
            .await
    }

    async fn reference_counts(&self) -> Result<Vec<(ContentHash, i64)>, sqlx::Error> {
        sqlx::query_as(
            "SELECT content_hash, COUNT(*) FROM file_records GROUP BY content_hash ORDER BY content_hash",
        )
        .fetch_all(&self.pool)
        .await
    }

    async fn usage_by_owner(&self) -> Result<Vec<(String, i64)>, sqlx::Error> {
        sqlx::query_as(
            "SELECT owner_id, COALESCE(SUM(logical_size), 0) FROM file_records GROUP BY owner_id ORDER BY owner_id",
        )
        .fetch_all(&self.pool)
        .await
    }
}
