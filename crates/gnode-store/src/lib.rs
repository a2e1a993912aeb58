//! # gnode-store
//!
//! Versioned object storage for the gnode metadata service, backed by SQLite.
//!
//! Every entity is a chain of immutable versions with non-overlapping validity
//! intervals; exactly one version per entity is current. The crate exposes a
//! synchronous `Database` handle wrapping a `rusqlite::Connection` with typed
//! helpers for users, friendships, versions, explicit grants and the
//! identifier-only selection that backs list queries.

pub mod acl;
pub mod database;
pub mod migrations;
pub mod models;
pub mod selection;
pub mod timestamps;
pub mod users;
pub mod versions;

mod error;

pub use database::Database;
pub use error::{Result, StoreError};
pub use models::*;
pub use selection::{Lookup, Operand, Predicate, Selection, SqlValue};
