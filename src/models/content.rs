//! Physical content tracked by the ledger.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::{fmt, str::FromStr};
use uuid::Uuid;

/// Length of a hex-encoded SHA-256 digest.
pub const CONTENT_HASH_LEN: usize = 64;

/// Lowercase hex SHA-256 digest identifying a piece of content.
///
/// The hash is the deduplication key: two uploads with the same bytes map to
/// the same `ContentHash` regardless of owner, scope or file name.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
#[serde(try_from = "String", into = "String")]
#[sqlx(transparent)]
pub struct ContentHash(String);

impl ContentHash {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("`{0}` is not a lowercase hex SHA-256 digest")]
pub struct InvalidContentHash(pub String);

impl FromStr for ContentHash {
    type Err = InvalidContentHash;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let valid = s.len() == CONTENT_HASH_LEN
            && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
        if valid {
            Ok(Self(s.to_string()))
        } else {
            Err(InvalidContentHash(s.to_string()))
        }
    }
}

impl TryFrom<String> for ContentHash {
    type Error = InvalidContentHash;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ContentHash> for String {
    fn from(hash: ContentHash) -> Self {
        hash.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle of a content row.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum ContentState {
    /// Referenced, but the blob is still being written.
    Pending,
    /// Blob is durable in the backend.
    Present,
    /// Reference count reached zero and the blob is being removed.
    Deleting,
}

impl ContentState {
    pub fn as_str(self) -> &'static str {
        match self {
            ContentState::Pending => "pending",
            ContentState::Present => "present",
            ContentState::Deleting => "deleting",
        }
    }
}

impl fmt::Display for ContentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of `content_records`.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct ContentRecord {
    /// SHA-256 of the bytes, primary key.
    pub content_hash: ContentHash,

    /// Backend path chosen by the upload that first created the row.
    pub storage_path: String,

    /// Size of the stored blob.
    pub byte_size: i64,

    pub mime_type: String,

    /// Number of file records pointing at this content.
    pub reference_count: i64,

    pub state: ContentState,

    /// Holder of the current write or delete claim, if any.
    pub claim_token: Option<Uuid>,

    /// Claim expiry in unix milliseconds.
    pub lease_expires_at: Option<i64>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ContentRecord {
    pub fn location(&self) -> ContentLocation {
        ContentLocation {
            content_hash: self.content_hash.clone(),
            storage_path: self.storage_path.clone(),
            byte_size: self.byte_size,
            mime_type: self.mime_type.clone(),
        }
    }

    /// True when a claim exists and has not expired at `now_ms`.
    pub fn has_live_claim(&self, now_ms: i64) -> bool {
        match (self.claim_token, self.lease_expires_at) {
            (Some(_), Some(expires)) => expires >= now_ms,
            _ => false,
        }
    }
}

/// Where a piece of content lives and how large it is.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ContentLocation {
    pub content_hash: ContentHash,
    pub storage_path: String,
    pub byte_size: i64,
    pub mime_type: String,
}

/// A reference release that failed and is waiting for the reconciler.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct PendingRelease {
    pub id: i64,
    pub content_hash: ContentHash,
    pub reason: String,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Values used when the first upload of a hash creates its row.
#[derive(Clone, Debug)]
pub struct NewContent {
    pub content_hash: ContentHash,
    pub storage_path: String,
    pub byte_size: i64,
    pub mime_type: String,
}
