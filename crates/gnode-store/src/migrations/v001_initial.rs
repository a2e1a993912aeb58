//! v001 -- Initial schema creation.
//!
//! Creates users and friendships, the entity/version tables that hold the
//! bitemporal history, per-version relation rows, and explicit access grants.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Users
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS users (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    username   TEXT NOT NULL UNIQUE,
    api_token  TEXT NOT NULL UNIQUE,            -- opaque bearer token
    created_at TEXT NOT NULL                    -- RFC-3339, microseconds, UTC
);

-- ----------------------------------------------------------------
-- Friendships (stored in both directions)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS friendships (
    user_id    INTEGER NOT NULL,
    friend_id  INTEGER NOT NULL,
    created_at TEXT NOT NULL,

    PRIMARY KEY (user_id, friend_id),
    FOREIGN KEY (user_id)   REFERENCES users(id) ON DELETE CASCADE,
    FOREIGN KEY (friend_id) REFERENCES users(id) ON DELETE CASCADE
);

-- ----------------------------------------------------------------
-- Entities: identity and immutable ownership
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS entities (
    local_id    INTEGER PRIMARY KEY AUTOINCREMENT,
    entity_type TEXT NOT NULL,
    owner_id    INTEGER NOT NULL,
    created_at  TEXT NOT NULL,

    FOREIGN KEY (owner_id) REFERENCES users(id)
);

CREATE INDEX IF NOT EXISTS idx_entities_type_owner ON entities(entity_type, owner_id);

-- ----------------------------------------------------------------
-- Versions: immutable snapshots, [starts_at, ends_at)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS versions (
    guid       TEXT PRIMARY KEY NOT NULL,       -- UUID v4
    local_id   INTEGER NOT NULL,
    starts_at  TEXT NOT NULL,
    ends_at    TEXT,                            -- NULL = current
    state      INTEGER NOT NULL DEFAULT 10,     -- 10 active, 20 deleted, 30 archived
    visibility INTEGER NOT NULL DEFAULT 3,      -- 1 public, 2 friendly, 3 private
    attributes TEXT NOT NULL DEFAULT '{}',      -- JSON object

    FOREIGN KEY (local_id) REFERENCES entities(local_id)
);

-- At most one open-ended version per entity.
CREATE UNIQUE INDEX IF NOT EXISTS idx_versions_current
    ON versions(local_id) WHERE ends_at IS NULL;

CREATE INDEX IF NOT EXISTS idx_versions_interval ON versions(local_id, starts_at);

-- ----------------------------------------------------------------
-- Relations carried by a version
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS version_relations (
    guid      TEXT NOT NULL,
    field     TEXT NOT NULL,
    position  INTEGER NOT NULL,
    target_id INTEGER NOT NULL,

    PRIMARY KEY (guid, field, position),
    FOREIGN KEY (guid)      REFERENCES versions(guid),
    FOREIGN KEY (target_id) REFERENCES entities(local_id)
);

CREATE INDEX IF NOT EXISTS idx_relations_target ON version_relations(field, target_id);

-- ----------------------------------------------------------------
-- Explicit shares
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS access_grants (
    local_id INTEGER NOT NULL,
    user_id  INTEGER NOT NULL,
    level    INTEGER NOT NULL,                  -- 1 read, 2 write

    PRIMARY KEY (local_id, user_id),
    FOREIGN KEY (local_id) REFERENCES entities(local_id),
    FOREIGN KEY (user_id)  REFERENCES users(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_grants_user ON access_grants(user_id, level);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
