//! Domain model structs persisted in the SQLite database.
//!
//! Every struct derives `Serialize` and `Deserialize` so it can be handed
//! straight to the request layer.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use gnode_shared::{AccessLevel, LifecycleState, LocalId, UserId, Visibility};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Relation payload of a version: field name → ordered target ids.
///
/// Single-valued references hold at most one element.
pub type Relations = BTreeMap<String, Vec<LocalId>>;

/// Scalar attribute payload of a version.
pub type Attributes = Map<String, Value>;

// ---------------------------------------------------------------------------
// User
// ---------------------------------------------------------------------------

/// An account that can own entities and receive shares.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub id: UserId,
    pub username: String,
    /// Opaque API token used for `Authorization: Token ...`.
    #[serde(skip_serializing)]
    pub api_token: String,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Version
// ---------------------------------------------------------------------------

/// One immutable snapshot of an entity, valid over `[starts_at, ends_at)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Version {
    /// Globally unique version identifier.
    pub guid: Uuid,
    /// Entity identifier shared by all versions.
    pub local_id: LocalId,
    /// Registry name of the entity type.
    pub entity_type: String,
    /// Immutable owner of the entity.
    pub owner: UserId,
    /// When the entity (its first version) was created.
    pub date_created: DateTime<Utc>,
    pub starts_at: DateTime<Utc>,
    /// `None` for the current version.
    pub ends_at: Option<DateTime<Utc>>,
    pub state: LifecycleState,
    pub visibility: Visibility,
    pub attributes: Attributes,
    pub relations: Relations,
}

impl Version {
    pub fn is_current(&self) -> bool {
        self.ends_at.is_none()
    }

    /// Whether `at` falls inside this version's validity interval.
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.starts_at <= at && self.ends_at.map_or(true, |end| at < end)
    }

    /// Targets of a relation field, empty when the field is unset.
    pub fn targets(&self, field: &str) -> &[LocalId] {
        self.relations.get(field).map(Vec::as_slice).unwrap_or(&[])
    }
}

// ---------------------------------------------------------------------------
// Mutations
// ---------------------------------------------------------------------------

/// Input for creating a brand-new entity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewEntity {
    pub entity_type: String,
    pub owner: UserId,
    pub visibility: Visibility,
    pub attributes: Attributes,
    pub relations: Relations,
}

/// Changes applied on top of the current version to produce the next one.
///
/// Attributes are merged key by key; every relation field present replaces
/// that field wholesale (append semantics are resolved by the caller).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct VersionChange {
    pub attributes: Attributes,
    pub relations: Relations,
    pub visibility: Option<Visibility>,
    pub state: Option<LifecycleState>,
}

impl VersionChange {
    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
            && self.relations.is_empty()
            && self.visibility.is_none()
            && self.state.is_none()
    }
}

// ---------------------------------------------------------------------------
// Access grant
// ---------------------------------------------------------------------------

/// An explicit share of one entity with one user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccessGrant {
    pub local_id: LocalId,
    pub user: UserId,
    pub username: String,
    pub level: AccessLevel,
}
