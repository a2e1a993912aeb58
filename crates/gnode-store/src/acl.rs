//! Explicit shares and the facts consumed by the access predicates.

use std::collections::{BTreeMap, HashSet};

use gnode_shared::{AccessFacts, AccessLevel, LocalId, UserId};
use rusqlite::{params, OptionalExtension};

use crate::database::Database;
use crate::error::Result;
use crate::models::{AccessGrant, Version};

impl Database {
    /// All grants on an entity, ordered by username.
    pub fn grants_for(&self, local_id: LocalId) -> Result<Vec<AccessGrant>> {
        let mut stmt = self.conn().prepare(
            "SELECT g.local_id, g.user_id, u.username, g.level
             FROM access_grants g
             JOIN users u ON u.id = g.user_id
             WHERE g.local_id = ?1
             ORDER BY u.username ASC",
        )?;

        let rows = stmt.query_map(params![local_id.0], |row| {
            let level_code: i64 = row.get(3)?;
            Ok(AccessGrant {
                local_id: LocalId(row.get(0)?),
                user: UserId(row.get(1)?),
                username: row.get(2)?,
                level: AccessLevel::from_code(level_code)
                    .ok_or(rusqlite::Error::IntegralValueOutOfRange(3, level_code))?,
            })
        })?;

        let mut grants = Vec::new();
        for row in rows {
            grants.push(row?);
        }
        Ok(grants)
    }

    /// The grant `user` holds on an entity, if any.
    pub fn grant_level(&self, local_id: LocalId, user: UserId) -> Result<Option<AccessLevel>> {
        let code: Option<i64> = self
            .conn()
            .query_row(
                "SELECT level FROM access_grants WHERE local_id = ?1 AND user_id = ?2",
                params![local_id.0, user.0],
                |row| row.get(0),
            )
            .optional()?;
        Ok(code.and_then(AccessLevel::from_code))
    }

    /// Replace the whole grant map of an entity.
    pub fn replace_grants(
        &self,
        local_id: LocalId,
        grants: &BTreeMap<UserId, AccessLevel>,
    ) -> Result<()> {
        self.atomic(|db| {
            db.conn().execute(
                "DELETE FROM access_grants WHERE local_id = ?1",
                params![local_id.0],
            )?;
            let mut stmt = db.conn().prepare_cached(
                "INSERT INTO access_grants (local_id, user_id, level) VALUES (?1, ?2, ?3)",
            )?;
            for (user, level) in grants {
                stmt.execute(params![local_id.0, user.0, level.code()])?;
            }
            tracing::info!(local_id = %local_id, grants = grants.len(), "grants replaced");
            Ok(())
        })
    }

    /// Gather everything [`gnode_shared::access`] needs to judge `user`
    /// against `version`.
    pub fn access_facts(&self, version: &Version, user: UserId) -> Result<AccessFacts> {
        let grant = self.grant_level(version.local_id, user)?;
        let friends_with_owner = user != version.owner && self.are_friends(user, version.owner)?;
        Ok(AccessFacts {
            owner: version.owner,
            visibility: version.visibility,
            grant,
            friends_with_owner,
        })
    }

    /// Entities of `entity_type` that `user` may edit: owned or shared with
    /// Write level.
    pub fn writable_ids(&self, entity_type: &str, user: UserId) -> Result<HashSet<LocalId>> {
        let mut stmt = self.conn().prepare(
            "SELECT local_id FROM entities WHERE entity_type = ?1 AND owner_id = ?2
             UNION
             SELECT g.local_id FROM access_grants g
             JOIN entities e ON e.local_id = g.local_id
             WHERE e.entity_type = ?1 AND g.user_id = ?2 AND g.level = ?3",
        )?;
        let rows = stmt.query_map(
            params![entity_type, user.0, AccessLevel::Write.code()],
            |row| row.get::<_, i64>(0),
        )?;

        let mut ids = HashSet::new();
        for row in rows {
            ids.insert(LocalId(row?));
        }
        Ok(ids)
    }
}
