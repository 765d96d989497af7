pub mod hasher;
pub mod ledger;
pub mod quota;
pub mod reconcile;
pub mod vault;

use crate::{
    errors::{VaultError, VaultResult},
    storage::{StorageError, StorageResult},
};
use std::{future::Future, time::Duration};

/// Bound a backend call, mapping both failure and timeout to a retryable
/// [`VaultError::StorageBackend`].
pub(crate) async fn with_timeout<T>(
    timeout: Duration,
    operation: &'static str,
    path: &str,
    fut: impl Future<Output = StorageResult<T>>,
) -> VaultResult<T> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(VaultError::storage(operation, path, err)),
        Err(_) => Err(VaultError::storage(
            operation,
            path,
            StorageError::Timeout {
                operation,
                after: timeout,
            },
        )),
    }
}
