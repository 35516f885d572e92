//! # ferry-store
//!
//! SQLite persistence for the relay, built on a synchronous `Database`
//! handle that wraps a `rusqlite::Connection`.
//!
//! The store is the deduplication authority for ingestion: every record is
//! keyed by its upstream external id, and re-inserting a known id is a no-op.
//! A batch is committed as one transaction together with its enrichment and
//! notification rows, so a failure leaves nothing of the batch behind.

pub mod authors;
pub mod blocklist;
pub mod database;
pub mod migrations;
pub mod models;
pub mod notifications;
pub mod records;

mod error;

pub use database::Database;
pub use error::StoreError;
pub use models::*;
