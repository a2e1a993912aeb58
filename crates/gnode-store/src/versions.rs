//! Append-only version history.
//!
//! Entities are never updated in place. Every mutation closes the current
//! version (`ends_at = now`) and inserts its successor in the same
//! transaction; the partial unique index `idx_versions_current` guarantees at
//! most one open-ended version per entity.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use gnode_shared::{LifecycleState, LocalId, UserId, Visibility};
use rusqlite::{params, params_from_iter, types::Value as SqlValue};
use uuid::Uuid;

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{Attributes, NewEntity, Relations, Version, VersionChange};
use crate::timestamps;

/// Upper bound on bound parameters per `IN (...)` batch.
const IN_CHUNK: usize = 500;

const VERSION_SELECT: &str = "SELECT v.guid, v.local_id, e.entity_type, e.owner_id, e.created_at,
            v.starts_at, v.ends_at, v.state, v.visibility, v.attributes
     FROM versions v
     JOIN entities e ON e.local_id = v.local_id";

impl Database {
    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    /// Allocate a new entity and write its first (current, active) version.
    pub fn create_entity(&self, new: &NewEntity) -> Result<Version> {
        self.atomic(|db| {
            let now = timestamps::now();

            db.conn().execute(
                "INSERT INTO entities (entity_type, owner_id, created_at) VALUES (?1, ?2, ?3)",
                params![new.entity_type, new.owner.0, timestamps::encode(now)],
            )?;
            let local_id = LocalId(db.conn().last_insert_rowid());

            let version = Version {
                guid: Uuid::new_v4(),
                local_id,
                entity_type: new.entity_type.clone(),
                owner: new.owner,
                date_created: now,
                starts_at: now,
                ends_at: None,
                state: LifecycleState::Active,
                visibility: new.visibility,
                attributes: new.attributes.clone(),
                relations: prune_relations(new.relations.clone()),
            };
            db.insert_version(&version)?;

            tracing::info!(
                local_id = %local_id,
                entity_type = %new.entity_type,
                owner = %new.owner,
                "entity created"
            );
            Ok(version)
        })
    }

    // ------------------------------------------------------------------
    // Update
    // ------------------------------------------------------------------

    /// Append a version carrying `change` merged over the current one.
    ///
    /// Fails with [`StoreError::NotFound`] when the entity has no current
    /// version and [`StoreError::InvalidTransition`] when `change.state`
    /// is not reachable from the current state.
    pub fn update_entity(&self, local_id: LocalId, change: &VersionChange) -> Result<Version> {
        self.atomic(|db| {
            let current = db.resolve(local_id, None)?;

            if let Some(target) = change.state {
                if !current.state.can_transition_to(target) {
                    return Err(StoreError::InvalidTransition {
                        local_id,
                        from: current.state,
                        to: target,
                    });
                }
            }

            let mut attributes = current.attributes.clone();
            merge_attributes(&mut attributes, &change.attributes);

            let mut relations = current.relations.clone();
            for (field, targets) in &change.relations {
                relations.insert(field.clone(), targets.clone());
            }

            let next = Version {
                state: change.state.unwrap_or(current.state),
                visibility: change.visibility.unwrap_or(current.visibility),
                attributes,
                relations: prune_relations(relations),
                ..current.clone()
            };
            db.append_version(&current, next)
        })
    }

    /// Move an entity through its lifecycle.
    ///
    /// Active and Deleted may swap; anything may be archived; Archived is
    /// terminal. Re-applying the current Active/Deleted state writes nothing
    /// and returns the current version.
    pub fn set_state(&self, local_id: LocalId, target: LifecycleState) -> Result<Version> {
        self.atomic(|db| {
            let current = db.resolve(local_id, None)?;
            if !current.state.can_transition_to(target) {
                return Err(StoreError::InvalidTransition {
                    local_id,
                    from: current.state,
                    to: target,
                });
            }
            if current.state == target {
                return Ok(current);
            }

            let next = Version {
                state: target,
                ..current.clone()
            };
            let version = db.append_version(&current, next)?;
            tracing::info!(local_id = %local_id, state = ?target, "lifecycle state changed");
            Ok(version)
        })
    }

    /// Change the visibility level; a no-op when it is already set.
    pub fn set_visibility(&self, local_id: LocalId, visibility: Visibility) -> Result<Version> {
        self.atomic(|db| {
            let current = db.resolve(local_id, None)?;
            if current.visibility == visibility {
                return Ok(current);
            }
            let next = Version {
                visibility,
                ..current.clone()
            };
            db.append_version(&current, next)
        })
    }

    /// Close `current` and insert `next` as the new current version.
    fn append_version(&self, current: &Version, mut next: Version) -> Result<Version> {
        let starts_at = timestamps::successor_start(current.starts_at);

        let closed = self.conn().execute(
            "UPDATE versions SET ends_at = ?1 WHERE guid = ?2 AND ends_at IS NULL",
            params![timestamps::encode(starts_at), current.guid.to_string()],
        )?;
        if closed != 1 {
            return Err(StoreError::NotFound);
        }

        next.guid = Uuid::new_v4();
        next.starts_at = starts_at;
        next.ends_at = None;
        self.insert_version(&next)?;

        tracing::debug!(
            local_id = %next.local_id,
            previous = %current.guid,
            guid = %next.guid,
            "version appended"
        );
        Ok(next)
    }

    fn insert_version(&self, version: &Version) -> Result<()> {
        self.conn().execute(
            "INSERT INTO versions (guid, local_id, starts_at, ends_at, state, visibility, attributes)
             VALUES (?1, ?2, ?3, NULL, ?4, ?5, ?6)",
            params![
                version.guid.to_string(),
                version.local_id.0,
                timestamps::encode(version.starts_at),
                version.state.code(),
                version.visibility.code(),
                serde_json::to_string(&version.attributes)?,
            ],
        )?;

        let mut stmt = self.conn().prepare_cached(
            "INSERT INTO version_relations (guid, field, position, target_id)
             VALUES (?1, ?2, ?3, ?4)",
        )?;
        for (field, targets) in &version.relations {
            for (position, target) in targets.iter().enumerate() {
                stmt.execute(params![
                    version.guid.to_string(),
                    field,
                    position as i64,
                    target.0
                ])?;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    /// The current version, or the one whose interval contains `at_time`.
    ///
    /// Lifecycle state is not filtered here; callers decide which states
    /// they accept.
    pub fn resolve(&self, local_id: LocalId, at_time: Option<DateTime<Utc>>) -> Result<Version> {
        let mut versions = match at_time {
            None => self.query_versions(
                &format!("{VERSION_SELECT} WHERE v.local_id = ?1 AND v.ends_at IS NULL"),
                vec![SqlValue::Integer(local_id.0)],
            )?,
            Some(at) => self.query_versions(
                &format!(
                    "{VERSION_SELECT} WHERE v.local_id = ?1 AND v.starts_at <= ?2
                       AND (v.ends_at IS NULL OR v.ends_at > ?2)"
                ),
                vec![
                    SqlValue::Integer(local_id.0),
                    SqlValue::Text(timestamps::encode(at)),
                ],
            )?,
        };
        versions.pop().ok_or(StoreError::NotFound)
    }

    /// Every version of an entity, oldest first.
    pub fn history(&self, local_id: LocalId) -> Result<Vec<Version>> {
        let versions = self.query_versions(
            &format!("{VERSION_SELECT} WHERE v.local_id = ?1 ORDER BY v.starts_at ASC"),
            vec![SqlValue::Integer(local_id.0)],
        )?;
        if versions.is_empty() {
            return Err(StoreError::NotFound);
        }
        Ok(versions)
    }

    /// Full versions (with relations) for `ids`, in the order given.
    ///
    /// Ids without a version valid at `at_time` are skipped.
    pub fn materialize(
        &self,
        ids: &[LocalId],
        at_time: Option<DateTime<Utc>>,
    ) -> Result<Vec<Version>> {
        let mut by_id: HashMap<LocalId, Version> = HashMap::with_capacity(ids.len());

        for chunk in ids.chunks(IN_CHUNK) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let mut args: Vec<SqlValue> = chunk.iter().map(|id| SqlValue::Integer(id.0)).collect();

            let interval = match at_time {
                None => "v.ends_at IS NULL".to_string(),
                Some(at) => {
                    args.push(SqlValue::Text(timestamps::encode(at)));
                    let n = args.len();
                    format!("v.starts_at <= ?{n} AND (v.ends_at IS NULL OR v.ends_at > ?{n})")
                }
            };

            let sql = format!(
                "{VERSION_SELECT} WHERE v.local_id IN ({placeholders}) AND {interval}"
            );
            for version in self.query_versions(&sql, args)? {
                by_id.insert(version.local_id, version);
            }
        }

        Ok(ids.iter().filter_map(|id| by_id.remove(id)).collect())
    }

    /// Entities of `entity_type` whose version valid at `at_time` points at
    /// `target` through `field`, ordered by local id. Lifecycle state is
    /// restricted to `state`.
    pub fn referencing(
        &self,
        entity_type: &str,
        field: &str,
        target: LocalId,
        state: LifecycleState,
        at_time: Option<DateTime<Utc>>,
    ) -> Result<Vec<LocalId>> {
        let mut args = vec![
            SqlValue::Text(entity_type.to_string()),
            SqlValue::Text(field.to_string()),
            SqlValue::Integer(target.0),
            SqlValue::Integer(state.code() as i64),
        ];
        let interval = match at_time {
            None => "v.ends_at IS NULL".to_string(),
            Some(at) => {
                args.push(SqlValue::Text(timestamps::encode(at)));
                "v.starts_at <= ?5 AND (v.ends_at IS NULL OR v.ends_at > ?5)".to_string()
            }
        };

        let mut stmt = self.conn().prepare(&format!(
            "SELECT DISTINCT v.local_id
             FROM versions v
             JOIN entities e ON e.local_id = v.local_id
             JOIN version_relations r ON r.guid = v.guid
             WHERE e.entity_type = ?1 AND r.field = ?2 AND r.target_id = ?3
               AND v.state = ?4 AND {interval}
             ORDER BY v.local_id ASC"
        ))?;
        let rows = stmt.query_map(params_from_iter(args), |row| row.get::<_, i64>(0))?;

        let mut ids = Vec::new();
        for row in rows {
            ids.push(LocalId(row?));
        }
        Ok(ids)
    }

    /// Entity type and owner of a local id without loading any version.
    pub fn entity_header(&self, local_id: LocalId) -> Result<(String, UserId)> {
        self.conn()
            .query_row(
                "SELECT entity_type, owner_id FROM entities WHERE local_id = ?1",
                params![local_id.0],
                |row| Ok((row.get::<_, String>(0)?, UserId(row.get(1)?))),
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    fn query_versions(&self, sql: &str, args: Vec<SqlValue>) -> Result<Vec<Version>> {
        let mut stmt = self.conn().prepare(sql)?;
        let rows = stmt.query_map(params_from_iter(args), row_to_version)?;

        let mut versions = Vec::new();
        for row in rows {
            versions.push(row?);
        }
        self.attach_relations(&mut versions)?;
        Ok(versions)
    }

    /// Load relation rows for every version in one query per chunk.
    fn attach_relations(&self, versions: &mut [Version]) -> Result<()> {
        if versions.is_empty() {
            return Ok(());
        }
        let mut index: HashMap<Uuid, usize> = HashMap::with_capacity(versions.len());
        for (i, v) in versions.iter().enumerate() {
            index.insert(v.guid, i);
        }

        let guids: Vec<String> = versions.iter().map(|v| v.guid.to_string()).collect();
        for chunk in guids.chunks(IN_CHUNK) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let mut stmt = self.conn().prepare(&format!(
                "SELECT guid, field, target_id FROM version_relations
                 WHERE guid IN ({placeholders})
                 ORDER BY guid, field, position"
            ))?;
            let mut rows = stmt.query(params_from_iter(chunk.iter()))?;
            while let Some(row) = rows.next()? {
                let guid_str: String = row.get(0)?;
                let field: String = row.get(1)?;
                let target: i64 = row.get(2)?;
                let guid = Uuid::parse_str(&guid_str)?;
                if let Some(&i) = index.get(&guid) {
                    versions[i]
                        .relations
                        .entry(field)
                        .or_default()
                        .push(LocalId(target));
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Merge `changes` into `base` key by key.
fn merge_attributes(base: &mut Attributes, changes: &Attributes) {
    for (key, value) in changes {
        base.insert(key.clone(), value.clone());
    }
}

/// Empty relation fields are not stored.
fn prune_relations(mut relations: Relations) -> Relations {
    relations.retain(|_, targets| !targets.is_empty());
    relations
}

fn row_to_version(row: &rusqlite::Row<'_>) -> rusqlite::Result<Version> {
    let guid_str: String = row.get(0)?;
    let local_id: i64 = row.get(1)?;
    let entity_type: String = row.get(2)?;
    let owner_id: i64 = row.get(3)?;
    let created_str: String = row.get(4)?;
    let starts_str: String = row.get(5)?;
    let ends_str: Option<String> = row.get(6)?;
    let state_code: i64 = row.get(7)?;
    let visibility_code: i64 = row.get(8)?;
    let attributes_str: String = row.get(9)?;

    let guid = Uuid::parse_str(&guid_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let state = LifecycleState::from_code(state_code)
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(7, state_code))?;
    let visibility = Visibility::from_code(visibility_code)
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(8, visibility_code))?;
    let attributes: Attributes = serde_json::from_str(&attributes_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(9, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(Version {
        guid,
        local_id: LocalId(local_id),
        entity_type,
        owner: UserId(owner_id),
        date_created: timestamps::column(4, &created_str)?,
        starts_at: timestamps::column(5, &starts_str)?,
        ends_at: ends_str
            .as_deref()
            .map(|s| timestamps::column(6, s))
            .transpose()?,
        state,
        visibility,
        attributes,
        relations: Relations::new(),
    })
}
