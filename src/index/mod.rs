//! Durable local index of media items and sync cursors.
//!
//! SQLite-backed mirror of the remote library. A sync page's item upserts,
//! deletions, and cursor advance commit as one transaction, so a crash
//! mid-sync leaves the store either before the page or fully past it,
//! never in between.

pub mod db;
pub mod error;
pub mod schema;
pub mod types;

pub use db::{IndexStats, LocalIndex, SqliteIndex};
pub use error::IndexError;
pub use types::{CursorUpdate, MediaItem, MediaKind, MediaOrigin, SyncCursor};
