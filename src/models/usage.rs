use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Logical bytes charged to an owner against their quota.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq)]
pub struct OwnerUsage {
    pub owner_id: String,

    /// Sum of `logical_size` over the owner's files. Not deduplicated.
    pub used_bytes: i64,

    pub quota_bytes: i64,

    pub updated_at: DateTime<Utc>,
}

impl OwnerUsage {
    pub fn remaining(&self) -> i64 {
        (self.quota_bytes - self.used_bytes).max(0)
    }
}
