//! # gnode-shared
//!
//! Identifiers, closed enums and the pure access-control predicates shared by
//! the store, the query engine and the HTTP server.

pub mod access;
pub mod constants;
pub mod error;
pub mod types;

pub use access::AccessFacts;
pub use error::ParseEnumError;
pub use types::{AccessLevel, LifecycleState, LocalId, ResponseMode, UserId, Visibility};
