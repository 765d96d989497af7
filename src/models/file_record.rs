//! Logical files that users see.

use crate::models::content::ContentHash;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Who may read a file.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum Visibility {
    #[default]
    Private,
    Public,
    Shared,
}

/// A user-facing file entry.
///
/// Many file records may point at the same [`ContentHash`]; the bytes are
/// owned by the content ledger, never by the record.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq)]
pub struct FileRecord {
    pub id: Uuid,

    /// Owning principal.
    pub owner_id: String,

    /// Containing folder, `None` for the owner's root.
    pub folder_id: Option<String>,

    pub display_name: String,

    pub mime_type: String,

    /// Non-owning reference into the content ledger.
    pub content_hash: ContentHash,

    pub visibility: Visibility,

    pub share_token: Option<String>,

    /// Byte size copied from the content at creation time.
    pub logical_size: i64,

    pub download_count: i64,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Insert payload for a file record.
#[derive(Clone, Debug)]
pub struct NewFileRecord {
    pub owner_id: String,
    pub folder_id: Option<String>,
    pub display_name: String,
    pub mime_type: String,
    pub content_hash: ContentHash,
    pub visibility: Visibility,
    pub logical_size: i64,
}

/// Partial update of mutable file metadata. `None` leaves a column unchanged.
#[derive(Clone, Debug, Default)]
pub struct FileRecordUpdate {
    pub display_name: Option<String>,
    /// `Some(None)` moves the file to the owner's root.
    pub folder_id: Option<Option<String>>,
    pub visibility: Option<Visibility>,
    /// `Some(None)` clears the share token.
    pub share_token: Option<Option<String>>,
}

impl FileRecordUpdate {
    pub fn is_empty(&self) -> bool {
        self.display_name.is_none()
            && self.folder_id.is_none()
            && self.visibility.is_none()
            && self.share_token.is_none()
    }
}
