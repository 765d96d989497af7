//! Multi-tenant file vault over a content-addressable, reference-counted
//! blob store.
//!
//! [`services::vault::VaultService`] is the entry point: uploads are hashed
//! and deduplicated through the [`services::ledger::ContentLedger`], charged
//! against per-owner quotas, and written to one [`storage::StorageBackend`].

pub mod config;
pub mod db;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
pub mod storage;
