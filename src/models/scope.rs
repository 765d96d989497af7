//! Storage placement: `{scope}/{owner_id}/{content_hash}`.
//!
//! Scope and owner only decide where the first copy of some content is
//! written. They are never part of the deduplication key.

use crate::{errors::VaultError, models::content::ContentHash};
use serde::{Deserialize, Serialize};
use std::fmt;

const MAX_IDENT_LEN: usize = 128;
/// Top-level directories enterprise ids would collide with.
const RESERVED_SCOPE_SEGMENTS: &[&str] = &["personal", "health"];

/// Tenant scope an upload belongs to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Scope {
    Personal,
    Enterprise(String),
}

impl Scope {
    pub fn validate(&self) -> Result<(), VaultError> {
        match self {
            Scope::Personal => Ok(()),
            Scope::Enterprise(id) => {
                validate_identifier("enterprise id", id)?;
                if RESERVED_SCOPE_SEGMENTS.contains(&id.as_str()) {
                    return Err(VaultError::Validation(format!(
                        "enterprise id `{id}` is reserved"
                    )));
                }
                Ok(())
            }
        }
    }

    fn path_segment(&self) -> &str {
        match self {
            Scope::Personal => "personal",
            Scope::Enterprise(id) => id,
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path_segment())
    }
}

/// Build the backend path for a piece of content.
///
/// Callers must have validated `scope` and `owner_id` first.
pub fn storage_path(scope: &Scope, owner_id: &str, hash: &ContentHash) -> String {
    format!("{}/{}/{}", scope.path_segment(), owner_id, hash)
}

/// Owner, folder and enterprise identifiers become path segments, so they
/// are restricted to a conservative character set.
pub fn validate_identifier(what: &str, value: &str) -> Result<(), VaultError> {
    if value.is_empty() {
        return Err(VaultError::Validation(format!("{what} must not be empty")));
    }
    if value.len() > MAX_IDENT_LEN {
        return Err(VaultError::Validation(format!(
            "{what} exceeds {MAX_IDENT_LEN} bytes"
        )));
    }
    if value.starts_with('.') {
        return Err(VaultError::Validation(format!(
            "{what} must not start with '.'"
        )));
    }
    if !value
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'@'))
    {
        return Err(VaultError::Validation(format!(
            "{what} contains unsupported characters"
        )));
    }
    Ok(())
}
