//! # gnode-rest
//!
//! Transport-independent REST semantics for the gnode metadata service:
//! the entity type registry and field descriptors, request parameter and
//! filter parsing, the serializer, and the [`QueryEngine`] that turns a
//! request into a [`Reply`] or a classified [`RestError`].
//!
//! Nothing here knows about HTTP; `gnode-server` maps replies and errors
//! onto status codes and the JSON envelope.

pub mod catalog;
pub mod fields;
pub mod filters;
pub mod messages;
pub mod params;
pub mod query;
pub mod registry;
pub mod serializer;

mod error;

pub use error::{RestError, Result};
pub use messages::MessageType;
pub use params::QueryOptions;
pub use query::{etag, QueryEngine, Reply, VersionTag};
pub use registry::{EntityType, Registry};
