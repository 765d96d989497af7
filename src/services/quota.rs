//! Per-owner logical usage limits.
//!
//! `reserve` is a fast-fail read taken before any ledger mutation. It is not
//! a lock: concurrent uploads by one owner may each pass the check and
//! together overshoot the quota by at most the in-flight upload sizes.
//! `commit` and `release` are atomic adds on the usage row.

use crate::{
    db::UsageRepository,
    errors::{VaultError, VaultResult},
    models::OwnerUsage,
};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct QuotaEnforcer {
    repo: Arc<dyn UsageRepository>,
    default_quota: i64,
}

impl QuotaEnforcer {
    pub fn new(repo: Arc<dyn UsageRepository>, default_quota: i64) -> Self {
        Self {
            repo,
            default_quota,
        }
    }

    pub fn repository(&self) -> &Arc<dyn UsageRepository> {
        &self.repo
    }

    /// Fail with [`VaultError::QuotaExceeded`] if `delta` more bytes would not fit.
    pub async fn reserve(&self, owner_id: &str, delta: i64) -> VaultResult<OwnerUsage> {
        let usage = self.repo.ensure(owner_id, self.default_quota).await?;
        if usage.used_bytes.saturating_add(delta) > usage.quota_bytes {
            debug!(
                owner_id,
                used = usage.used_bytes,
                requested = delta,
                quota = usage.quota_bytes,
                "quota check failed"
            );
            return Err(VaultError::QuotaExceeded {
                owner_id: owner_id.to_string(),
                used_bytes: usage.used_bytes,
                requested_bytes: delta,
                quota_bytes: usage.quota_bytes,
            });
        }
        Ok(usage)
    }

    /// Charge `delta` bytes after the file record exists.
    pub async fn commit(&self, owner_id: &str, delta: i64) -> VaultResult<OwnerUsage> {
        Ok(self.repo.add(owner_id, delta, self.default_quota).await?)
    }

    /// Refund `delta` bytes, clamping at zero.
    pub async fn release(&self, owner_id: &str, delta: i64) -> VaultResult<()> {
        match self.repo.subtract(owner_id, delta).await? {
            Some(usage) => debug!(owner_id, used = usage.used_bytes, "quota released"),
            None => warn!(owner_id, delta, "quota release for owner without usage row"),
        }
        Ok(())
    }

    pub async fn usage(&self, owner_id: &str) -> VaultResult<OwnerUsage> {
        Ok(self.repo.ensure(owner_id, self.default_quota).await?)
    }

    pub async fn set_quota(&self, owner_id: &str, quota_bytes: i64) -> VaultResult<OwnerUsage> {
        if quota_bytes < 0 {
            return Err(VaultError::Validation("quota must not be negative".into()));
        }
        Ok(self.repo.set_quota(owner_id, quota_bytes).await?)
    }
}
