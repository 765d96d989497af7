use crate::{models::ContentHash, storage::StorageError};
use thiserror::Error;

/// Errors surfaced by vault operations.
///
/// `StorageBackend` and `Database` are transient and may be retried by the
/// caller. `ReferenceIntegrity` means the ledger disagrees with the caller
/// about a reference and is never retried.
#[derive(Debug, Error)]
pub enum VaultError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error(
        "quota exceeded for owner `{owner_id}`: {used_bytes} used + {requested_bytes} requested > {quota_bytes}"
    )]
    QuotaExceeded {
        owner_id: String,
        used_bytes: i64,
        requested_bytes: i64,
        quota_bytes: i64,
    },

    #[error("storage backend failed during {operation} of `{path}`: {source}")]
    StorageBackend {
        operation: &'static str,
        path: String,
        #[source]
        source: StorageError,
    },

    #[error("content `{0}` does not exist")]
    ContentNotFound(ContentHash),

    #[error("reference integrity violation for `{hash}`: {detail}")]
    ReferenceIntegrity { hash: ContentHash, detail: String },

    #[error("{0} not found")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error("background task failed: {0}")]
    Internal(String),
}

pub type VaultResult<T> = Result<T, VaultError>;

impl VaultError {
    pub fn storage(operation: &'static str, path: impl Into<String>, source: StorageError) -> Self {
        VaultError::StorageBackend {
            operation,
            path: path.into(),
            source,
        }
    }

    /// Whether retrying the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            VaultError::StorageBackend { .. } | VaultError::Database(_) | VaultError::Internal(_)
        )
    }
}

impl From<tokio::task::JoinError> for VaultError {
    fn from(err: tokio::task::JoinError) -> Self {
        VaultError::Internal(err.to_string())
    }
}
