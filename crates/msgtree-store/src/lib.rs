//! # msgtree-store
//!
//! Local Index for msgtree: a SQLite mirror of the directory tree and file
//! records that live in the remote storage channel.
//!
//! The crate exposes a synchronous [`Database`] handle wrapping a
//! `rusqlite::Connection`. Callers are expected to serialize writers
//! themselves; every multi-statement write goes through
//! [`Database::in_transaction`].

pub mod backup;
pub mod cursors;
pub mod database;
pub mod directories;
pub mod files;
pub mod locations;
pub mod migrations;
pub mod models;

mod error;

pub use backup::{ImportStats, IndexSnapshot};
pub use database::Database;
pub use error::{Result, StoreError};
pub use models::*;
