//! Core data models for the vault.
//!
//! These entities map to database tables via `sqlx::FromRow` and serialize
//! as JSON via `serde`.

pub mod content;
pub mod file_record;
pub mod scope;
pub mod usage;

pub use content::{
    ContentHash, ContentLocation, ContentRecord, ContentState, NewContent, PendingRelease,
};
pub use file_record::{FileRecord, FileRecordUpdate, NewFileRecord, Visibility};
pub use scope::Scope;
pub use usage::OwnerUsage;
