//! The query engine.
//!
//! Reads run in two phases: an identifier-only selection (filters, lifecycle
//! state, point in time and the security clause, all in SQL), then windowing
//! and materialization of just the returned page. Mutations validate the
//! whole payload and every reference first and then write inside a single
//! store transaction, so a failed request leaves nothing behind.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use gnode_shared::{access, AccessFacts, AccessLevel, LifecycleState, LocalId, UserId, Visibility};
use gnode_store::{Database, NewEntity, Relations, Selection, StoreError, Version, VersionChange};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::error::{RestError, Result};
use crate::fields::{FieldDescriptor, FieldKind};
use crate::filters;
use crate::messages::MessageType;
use crate::params::QueryOptions;
use crate::registry::{EntityType, Registry};
use crate::serializer::{self, Payload, Serializer};

/// Outcome of a successful request, before HTTP framing.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub created: bool,
    pub message_type: MessageType,
    pub body: Map<String, Value>,
    /// Set when the reply renders exactly one version.
    pub version: Option<VersionTag>,
}

impl Reply {
    fn new(message_type: MessageType, body: Map<String, Value>) -> Self {
        Self {
            created: false,
            message_type,
            body,
            version: None,
        }
    }
}

/// Cache validators of a single-object reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionTag {
    pub etag: String,
    pub last_modified: DateTime<Utc>,
}

impl VersionTag {
    fn of(version: &Version) -> Self {
        Self {
            etag: etag(&version.guid),
            last_modified: version.starts_at,
        }
    }
}

/// BLAKE3 of the version guid, hex encoded.
pub fn etag(guid: &Uuid) -> String {
    hex::encode(blake3::hash(guid.as_bytes()).as_bytes())
}

pub struct QueryEngine<'a> {
    db: &'a Database,
    registry: &'a Registry,
}

impl<'a> QueryEngine<'a> {
    pub fn new(db: &'a Database, registry: &'a Registry) -> Self {
        Self { db, registry }
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    pub fn list(&self, type_name: &str, viewer: UserId, opts: &QueryOptions) -> Result<Reply> {
        let ty = self.registry.get(type_name)?;
        let ids = self.db.select_ids(&self.selection(ty, viewer, opts)?)?;

        let window = opts.window(ids.len());
        let page = self.db.materialize(&ids[window.clone()], opts.at_time)?;
        let selected = self.serializer(viewer, opts).serialize_all(&page)?;

        tracing::debug!(
            entity_type = ty.name,
            total = ids.len(),
            returned = selected.len(),
            "list query"
        );
        Ok(list_reply(ids.len(), window.start, selected, MessageType::ObjectSelected))
    }

    pub fn get(
        &self,
        type_name: &str,
        id: LocalId,
        viewer: UserId,
        opts: &QueryOptions,
    ) -> Result<Reply> {
        let ty = self.registry.get(type_name)?;
        let (current, facts) = self.locate(ty, id, viewer)?;

        let version = match opts.at_time {
            None => current,
            Some(at) => self.db.resolve(id, Some(at))?,
        };
        if version.state != opts.state {
            return Err(RestError::DoesNotExist);
        }
        self.require(access::accessible(viewer, &facts), id, viewer, "read")?;

        let object = self.serializer(viewer, opts).serialize(&version)?;
        let mut reply = list_reply(1, 0, vec![object], MessageType::ObjectSelected);
        reply.version = Some(VersionTag::of(&version));
        Ok(reply)
    }

    pub fn history(
        &self,
        type_name: &str,
        id: LocalId,
        viewer: UserId,
        opts: &QueryOptions,
    ) -> Result<Reply> {
        let ty = self.registry.get(type_name)?;
        let (_, facts) = self.locate(ty, id, viewer)?;
        self.require(access::accessible(viewer, &facts), id, viewer, "read")?;

        let versions = self.db.history(id)?;
        let selected = self.serializer(viewer, opts).serialize_all(&versions)?;
        Ok(list_reply(versions.len(), 0, selected, MessageType::ObjectSelected))
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    /// Create one object owned by `viewer`; replies with the stored object.
    pub fn create(
        &self,
        type_name: &str,
        viewer: UserId,
        body: &[u8],
        opts: &QueryOptions,
    ) -> Result<Reply> {
        let ty = self.registry.get(type_name)?;
        let payload = serializer::deserialize(ty, body)?;
        if payload.current_state.is_some() {
            return Err(RestError::PostDataInvalid(
                "current_state cannot be set on create".into(),
            ));
        }
        check_required(ty, &payload)?;
        self.check_references(ty, &payload, viewer)?;

        let mut relations = Relations::new();
        for (name, id) in &payload.single_refs {
            relations.insert(name.clone(), id.iter().copied().collect());
        }
        for (name, ids) in &payload.multi_refs {
            relations.insert(name.clone(), dedup(ids.iter().copied()));
        }

        let version = self.db.create_entity(&NewEntity {
            entity_type: ty.name.to_string(),
            owner: viewer,
            visibility: payload.safety_level.unwrap_or_default(),
            attributes: payload.attributes,
            relations,
        })?;
        tracing::info!(entity_type = ty.name, local_id = %version.local_id, owner = %viewer, "object created");

        let mut reply = self.get(ty.name, version.local_id, viewer, &fresh(opts, LifecycleState::Active))?;
        reply.created = true;
        reply.message_type = MessageType::ObjectCreated;
        Ok(reply)
    }

    /// Update one object. Restoring or archiving goes through `current_state`
    /// in the body; without it the object must be in the requested state.
    pub fn update(
        &self,
        type_name: &str,
        id: LocalId,
        viewer: UserId,
        body: &[u8],
        opts: &QueryOptions,
    ) -> Result<Reply> {
        let ty = self.registry.get(type_name)?;
        let payload = serializer::deserialize(ty, body)?;
        let (current, facts) = self.locate(ty, id, viewer)?;

        if payload.current_state.is_none() && current.state != opts.state {
            return Err(RestError::DoesNotExist);
        }
        self.require(access::accessible(viewer, &facts), id, viewer, "read")?;
        self.require(access::editable(viewer, &facts), id, viewer, "write")?;
        if payload.safety_level.is_some() {
            self.require(access::can_manage_acl(viewer, &facts), id, viewer, "acl")?;
        }
        self.check_references(ty, &payload, viewer)?;

        let change = change_for(&current, &payload, opts.m2m_append);
        let version = self.db.update_entity(id, &change)?;
        tracing::info!(entity_type = ty.name, local_id = %id, user = %viewer, "object updated");

        let mut reply = self.get(ty.name, id, viewer, &fresh(opts, version.state))?;
        reply.message_type = MessageType::ObjectUpdated;
        Ok(reply)
    }

    /// Apply one payload to every selected object.
    ///
    /// Fails with `NotAuthorized` when some selected object is not writable,
    /// unless `lenient` narrows the update to the writable subset.
    pub fn bulk_update(
        &self,
        type_name: &str,
        viewer: UserId,
        body: &[u8],
        opts: &QueryOptions,
    ) -> Result<Reply> {
        let ty = self.registry.get(type_name)?;
        let payload = serializer::deserialize(ty, body)?;
        if payload.current_state.is_some() {
            return Err(RestError::PostDataInvalid(
                "current_state cannot be changed in bulk".into(),
            ));
        }
        let writable = self.writable_selection(ty, viewer, opts)?;
        let window = opts.window(writable.len());
        let targets = &writable[window.clone()];
        self.check_references(ty, &payload, viewer)?;

        let updated = self.db.atomic(|db| {
            let mut out = Vec::with_capacity(targets.len());
            for id in targets {
                let current = db.resolve(*id, None)?;
                if payload.safety_level.is_some() && current.owner != viewer {
                    return Err(RestError::NotAuthorized);
                }
                let change = change_for(&current, &payload, opts.m2m_append);
                out.push(db.update_entity(*id, &change)?);
            }
            Ok::<_, RestError>(out)
        })?;
        tracing::info!(entity_type = ty.name, count = updated.len(), user = %viewer, "bulk update");

        let selected = self
            .serializer(viewer, &fresh(opts, opts.state))
            .serialize_all(&updated)?;
        Ok(list_reply(writable.len(), window.start, selected, MessageType::ObjectUpdated))
    }

    /// Soft delete. Deleting an already deleted object succeeds.
    pub fn delete(&self, type_name: &str, id: LocalId, viewer: UserId) -> Result<Reply> {
        let ty = self.registry.get(type_name)?;
        let (current, facts) = self.locate(ty, id, viewer)?;
        self.require(access::accessible(viewer, &facts), id, viewer, "read")?;
        self.require(access::editable(viewer, &facts), id, viewer, "write")?;

        if current.state != LifecycleState::Deleted {
            self.db.set_state(id, LifecycleState::Deleted)?;
            tracing::info!(entity_type = ty.name, local_id = %id, user = %viewer, "object deleted");
        }
        Ok(Reply::new(MessageType::Deleted, Map::new()))
    }

    /// Soft delete every selected object, under the same all-writable rule
    /// as [`QueryEngine::bulk_update`].
    pub fn bulk_delete(&self, type_name: &str, viewer: UserId, opts: &QueryOptions) -> Result<Reply> {
        let ty = self.registry.get(type_name)?;
        let targets = self.writable_selection(ty, viewer, opts)?;
        let window = opts.window(targets.len());
        let targets = &targets[window];

        self.db.atomic(|db| {
            for id in targets {
                db.set_state(*id, LifecycleState::Deleted)?;
            }
            Ok::<_, RestError>(())
        })?;
        tracing::info!(entity_type = ty.name, count = targets.len(), user = %viewer, "bulk delete");

        let mut body = Map::new();
        body.insert("objects_selected".into(), json!(targets.len()));
        Ok(Reply::new(MessageType::Deleted, body))
    }

    // ------------------------------------------------------------------
    // Access control list
    // ------------------------------------------------------------------

    pub fn acl(
        &self,
        type_name: &str,
        id: LocalId,
        viewer: UserId,
        opts: &QueryOptions,
    ) -> Result<Reply> {
        let ty = self.registry.get(type_name)?;
        let (current, facts) = self.locate(ty, id, viewer)?;
        if current.state != opts.state {
            return Err(RestError::DoesNotExist);
        }
        self.require(access::accessible(viewer, &facts), id, viewer, "read")?;

        let shared_with: Map<String, Value> = self
            .db
            .grants_for(id)?
            .into_iter()
            .map(|g| (g.username, json!(g.level.code())))
            .collect();

        let mut body = Map::new();
        body.insert("safety_level".into(), json!(current.visibility.code()));
        body.insert("shared_with".into(), Value::Object(shared_with));
        Ok(Reply::new(MessageType::ObjectSelected, body))
    }

    /// Change visibility and/or replace the grant map. With `cascade`, the
    /// same ACL is applied to child objects owned by the same user.
    pub fn update_acl(
        &self,
        type_name: &str,
        id: LocalId,
        viewer: UserId,
        body: &[u8],
        opts: &QueryOptions,
    ) -> Result<Reply> {
        let ty = self.registry.get(type_name)?;
        let (safety_level, grants) = self.parse_acl(body)?;
        let (current, facts) = self.locate(ty, id, viewer)?;
        if current.state != opts.state {
            return Err(RestError::DoesNotExist);
        }
        self.require(access::accessible(viewer, &facts), id, viewer, "read")?;
        self.require(access::can_manage_acl(viewer, &facts), id, viewer, "acl")?;

        let mut targets = vec![id];
        if opts.cascade {
            targets.extend(self.owned_descendants(ty, id, current.owner)?);
        }

        self.db.atomic(|db| {
            for target in &targets {
                if let Some(level) = safety_level {
                    db.set_visibility(*target, level)?;
                }
                if let Some(grants) = &grants {
                    db.replace_grants(*target, grants)?;
                }
            }
            Ok::<_, RestError>(())
        })?;
        tracing::info!(
            entity_type = ty.name,
            local_id = %id,
            objects = targets.len(),
            "acl updated"
        );

        self.acl(ty.name, id, viewer, opts)
    }

    fn parse_acl(
        &self,
        body: &[u8],
    ) -> Result<(Option<Visibility>, Option<BTreeMap<UserId, AccessLevel>>)> {
        let body = serializer::parse_body(body)?;
        let mut safety_level = None;
        let mut grants = None;

        for (key, value) in &body {
            match key.as_str() {
                "safety_level" => safety_level = Some(serializer::parse_safety_level(value)?),
                "shared_with" => {
                    let Value::Object(entries) = value else {
                        return Err(RestError::PostDataInvalid(
                            "'shared_with' must map usernames to access levels".into(),
                        ));
                    };
                    let mut map = BTreeMap::new();
                    for (username, level) in entries {
                        let user = match self.db.user_by_name(username) {
                            Ok(user) => user,
                            Err(StoreError::NotFound) => {
                                return Err(RestError::bad_parameter(
                                    "shared_with",
                                    format!("unknown user '{username}'"),
                                ))
                            }
                            Err(e) => return Err(e.into()),
                        };
                        map.insert(user.id, parse_access_level(level)?);
                    }
                    grants = Some(map);
                }
                other => {
                    return Err(RestError::PostDataInvalid(format!(
                        "unknown ACL key '{other}'"
                    )))
                }
            }
        }
        Ok((safety_level, grants))
    }

    /// Children (through declared child sets) owned by `owner`, recursively.
    /// Unbounded in depth; `seen` stops cycles.
    fn owned_descendants(
        &self,
        ty: &'static EntityType,
        root: LocalId,
        owner: UserId,
    ) -> Result<Vec<LocalId>> {
        let mut seen = HashSet::from([root]);
        let mut out = Vec::new();
        let mut frontier = vec![(ty, root)];

        while let Some((parent_ty, parent)) = frontier.pop() {
            for child in parent_ty.children {
                let child_ty = self.registry.get(child.entity_type)?;
                let ids = self.db.referencing(
                    child.entity_type,
                    child.field,
                    parent,
                    LifecycleState::Active,
                    None,
                )?;
                for id in ids {
                    if !seen.insert(id) {
                        continue;
                    }
                    let (_, child_owner) = self.db.entity_header(id)?;
                    if child_owner == owner {
                        out.push(id);
                        frontier.push((child_ty, id));
                    }
                }
            }
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn serializer(&self, viewer: UserId, opts: &QueryOptions) -> Serializer<'a> {
        Serializer::new(self.db, self.registry, viewer, opts)
    }

    fn selection(&self, ty: &EntityType, viewer: UserId, opts: &QueryOptions) -> Result<Selection> {
        Ok(Selection {
            entity_type: ty.name.to_string(),
            viewer,
            state: opts.state,
            at_time: opts.at_time,
            predicates: filters::compile(self.db, ty, viewer, &opts.filters)?,
        })
    }

    /// Selected ids narrowed to the writable ones, failing unless lenient
    /// when that drops anything.
    fn writable_selection(
        &self,
        ty: &EntityType,
        viewer: UserId,
        opts: &QueryOptions,
    ) -> Result<Vec<LocalId>> {
        let ids = self.db.select_ids(&self.selection(ty, viewer, opts)?)?;
        let writable = self.db.writable_ids(ty.name, viewer)?;
        let targets: Vec<LocalId> = ids.iter().copied().filter(|id| writable.contains(id)).collect();

        if targets.len() < ids.len() && !opts.lenient {
            tracing::debug!(
                entity_type = ty.name,
                selected = ids.len(),
                writable = targets.len(),
                user = %viewer,
                "bulk request touches read-only objects"
            );
            return Err(RestError::NotAuthorized);
        }
        Ok(targets)
    }

    /// Existence check: the entity exists and has the requested type.
    /// Returns its current version with the requester's access facts.
    fn locate(
        &self,
        ty: &EntityType,
        id: LocalId,
        viewer: UserId,
    ) -> Result<(Version, AccessFacts)> {
        let (entity_type, _) = self.db.entity_header(id)?;
        if entity_type != ty.name {
            return Err(RestError::DoesNotExist);
        }
        let current = self.db.resolve(id, None)?;
        let facts = self.db.access_facts(&current, viewer)?;
        Ok((current, facts))
    }

    fn require(&self, allowed: bool, id: LocalId, viewer: UserId, what: &str) -> Result<()> {
        if allowed {
            return Ok(());
        }
        tracing::debug!(local_id = %id, user = %viewer, access = what, "access denied");
        Err(RestError::NotAuthorized)
    }

    /// Every reference target must exist with the declared type, be active
    /// and readable; write-through links also need write access.
    fn check_references(&self, ty: &EntityType, payload: &Payload, viewer: UserId) -> Result<()> {
        for (field, id) in payload.references(ty) {
            self.check_reference(field, id, viewer)?;
        }
        Ok(())
    }

    fn check_reference(&self, field: &FieldDescriptor, id: LocalId, viewer: UserId) -> Result<()> {
        let FieldKind::Reference { target, write_through, .. } = field.kind else {
            return Ok(());
        };
        let wrong = || RestError::WrongReference {
            field: field.name.to_string(),
            target: id,
        };

        let current = match self.db.resolve(id, None) {
            Ok(v) => v,
            Err(StoreError::NotFound) => return Err(wrong()),
            Err(e) => return Err(e.into()),
        };
        if current.entity_type != target || current.state != LifecycleState::Active {
            return Err(wrong());
        }
        let facts = self.db.access_facts(&current, viewer)?;
        if !access::accessible(viewer, &facts) {
            return Err(wrong());
        }
        if write_through {
            self.require(access::editable(viewer, &facts), id, viewer, "write-through")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Free helpers
// ---------------------------------------------------------------------------

fn list_reply(total: usize, start: usize, selected: Vec<Value>, found: MessageType) -> Reply {
    let count = selected.len();
    let mut body = Map::new();
    body.insert("objects_total".into(), json!(total));
    body.insert("objects_selected".into(), json!(count));
    body.insert("selected_range".into(), json!([start, start + count]));
    let message_type = if count == 0 {
        body.insert("selected".into(), Value::Null);
        MessageType::NoObjectsFound
    } else {
        body.insert("selected".into(), Value::Array(selected));
        found
    };
    Reply::new(message_type, body)
}

/// Options for re-reading an object right after a write.
fn fresh(opts: &QueryOptions, state: LifecycleState) -> QueryOptions {
    QueryOptions {
        at_time: None,
        state,
        ..opts.clone()
    }
}

fn check_required(ty: &EntityType, payload: &Payload) -> Result<()> {
    for field in ty.fields.iter().filter(|f| f.required) {
        let present = match field.kind {
            FieldKind::Reference { many: false, .. } => {
                matches!(payload.single_refs.get(field.name), Some(Some(_)))
            }
            FieldKind::Reference { many: true, .. } => payload
                .multi_refs
                .get(field.name)
                .map_or(false, |ids| !ids.is_empty()),
            _ => payload
                .attributes
                .get(field.name)
                .map_or(false, |v| !v.is_null()),
        };
        if !present {
            return Err(RestError::bad_parameter(field.name, "this field is required"));
        }
    }
    Ok(())
}

/// Build the version change for `payload` on top of `current`.
fn change_for(current: &Version, payload: &Payload, m2m_append: bool) -> VersionChange {
    let mut change = VersionChange {
        attributes: payload.attributes.clone(),
        visibility: payload.safety_level,
        state: payload.current_state,
        ..Default::default()
    };
    for (name, id) in &payload.single_refs {
        change
            .relations
            .insert(name.clone(), id.iter().copied().collect());
    }
    for (name, ids) in &payload.multi_refs {
        let merged = if m2m_append {
            dedup(current.targets(name).iter().chain(ids.iter()).copied())
        } else {
            dedup(ids.iter().copied())
        };
        change.relations.insert(name.clone(), merged);
    }
    change
}

/// Order-preserving de-duplication.
fn dedup(ids: impl Iterator<Item = LocalId>) -> Vec<LocalId> {
    let mut seen = HashSet::new();
    ids.filter(|id| seen.insert(*id)).collect()
}

fn parse_access_level(value: &Value) -> Result<AccessLevel> {
    let parsed = match value {
        Value::Number(n) => n.as_i64().and_then(AccessLevel::from_code),
        Value::String(s) => s.parse().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| RestError::bad_parameter("shared_with", format!("invalid access level {value}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use gnode_store::User;

    struct Fixture {
        db: Database,
        registry: Registry,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                db: Database::open_in_memory().unwrap(),
                registry: Registry::builtin(),
            }
        }

        fn engine(&self) -> QueryEngine<'_> {
            QueryEngine::new(&self.db, &self.registry)
        }

        fn user(&self, name: &str) -> User {
            self.db.create_user(name).unwrap()
        }

        fn create(&self, ty: &str, owner: UserId, body: Value) -> LocalId {
            let reply = self
                .engine()
                .create(ty, owner, body.to_string().as_bytes(), &QueryOptions::default())
                .unwrap();
            serde_json::from_value(reply.body["selected"][0]["local_id"].clone()).unwrap()
        }
    }

    fn opts(pairs: &[(&str, &str)]) -> QueryOptions {
        let params: Vec<(String, String)> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        QueryOptions::parse(&params, 1000).unwrap()
    }

    fn body(value: Value) -> Vec<u8> {
        value.to_string().into_bytes()
    }

    #[test]
    fn private_read_write_grant_scenario() {
        let fx = Fixture::new();
        let u1 = fx.user("u1").id;
        let u2 = fx.user("u2").id;
        let engine = fx.engine();
        let id = fx.create("section", u1, json!({"name": "secret", "safety_level": 3}));

        assert!(matches!(
            engine.get("section", id, u2, &opts(&[])),
            Err(RestError::NotAuthorized)
        ));

        engine
            .update_acl("section", id, u1, &body(json!({"shared_with": {"u2": 1}})), &opts(&[]))
            .unwrap();
        assert!(engine.get("section", id, u2, &opts(&[])).is_ok());
        assert!(matches!(
            engine.update("section", id, u2, &body(json!({"name": "mine"})), &opts(&[])),
            Err(RestError::NotAuthorized)
        ));

        engine
            .update_acl("section", id, u1, &body(json!({"shared_with": {"u2": "write"}})), &opts(&[]))
            .unwrap();
        let before = fx.db.resolve(id, None).unwrap();
        let reply = engine
            .update("section", id, u2, &body(json!({"name": "mine"})), &opts(&[]))
            .unwrap();
        assert_eq!(reply.message_type, MessageType::ObjectUpdated);
        assert_eq!(reply.body["selected"][0]["fields"]["name"], "mine");

        let after = fx.db.resolve(id, None).unwrap();
        assert_ne!(after.guid, before.guid);
        assert!(after.starts_at > before.starts_at);
        assert_eq!(after.owner, u1);
    }

    #[test]
    fn existence_is_checked_before_access() {
        let fx = Fixture::new();
        let u1 = fx.user("u1").id;
        let u2 = fx.user("u2").id;
        let engine = fx.engine();
        let id = fx.create("section", u1, json!({"name": "s"}));

        assert!(matches!(
            engine.get("section", LocalId(9999), u2, &opts(&[])),
            Err(RestError::DoesNotExist)
        ));
        assert!(matches!(
            engine.get("property", id, u1, &opts(&[])),
            Err(RestError::DoesNotExist)
        ));
        assert!(matches!(
            engine.get("section", id, u2, &opts(&[])),
            Err(RestError::NotAuthorized)
        ));
        assert!(matches!(
            engine.get("gadget", id, u1, &opts(&[])),
            Err(RestError::InvalidObjectType(_))
        ));
    }

    #[test]
    fn pagination_covers_every_id_once() {
        let fx = Fixture::new();
        let u = fx.user("u").id;
        let engine = fx.engine();
        let mut created: Vec<LocalId> = (0..7)
            .map(|i| fx.create("block", u, json!({"name": format!("b{i}"), "index": i})))
            .collect();
        created.sort();

        let mut seen = Vec::new();
        let mut offset = 0;
        loop {
            let reply = engine
                .list(
                    "block",
                    u,
                    &opts(&[("offset", offset.to_string().as_str()), ("max_results", "3"), ("q", "info")]),
                )
                .unwrap();
            assert_eq!(reply.body["objects_total"], 7);
            let Value::Array(page) = &reply.body["selected"] else {
                break;
            };
            for obj in page {
                seen.push(serde_json::from_value::<LocalId>(obj["local_id"].clone()).unwrap());
            }
            offset += 3;
        }
        assert_eq!(seen, created);
    }

    #[test]
    fn filters_apply_before_windowing() {
        let fx = Fixture::new();
        let u = fx.user("u").id;
        let engine = fx.engine();
        for i in 0..5 {
            fx.create("block", u, json!({"name": format!("b{i}"), "index": i}));
        }
        let reply = engine
            .list("block", u, &opts(&[("index__gte", "2"), ("max_results", "2")]))
            .unwrap();
        assert_eq!(reply.body["objects_total"], 3);
        assert_eq!(reply.body["objects_selected"], 2);
        assert_eq!(reply.body["selected_range"], json!([0, 2]));

        let none = engine.list("block", u, &opts(&[("name", "zzz")])).unwrap();
        assert_eq!(none.message_type, MessageType::NoObjectsFound);
        assert_eq!(none.body["selected"], Value::Null);
    }

    #[test]
    fn m2m_append_and_overwrite() {
        let fx = Fixture::new();
        let u = fx.user("u").id;
        let engine = fx.engine();
        let f: Vec<LocalId> = (0..4)
            .map(|i| fx.create("datafile", u, json!({"title": format!("f{i}")})))
            .collect();
        let ds = fx.create("dataset", u, json!({"title": "d", "datafiles": [f[0], f[1]]}));

        engine
            .update("dataset", ds, u, &body(json!({"datafiles": [f[1], f[2]]})), &opts(&[]))
            .unwrap();
        assert_eq!(
            fx.db.resolve(ds, None).unwrap().targets("datafiles"),
            &[f[0], f[1], f[2]]
        );

        engine
            .update(
                "dataset",
                ds,
                u,
                &body(json!({"datafiles": [f[3]]})),
                &opts(&[("m2m_append", "0")]),
            )
            .unwrap();
        assert_eq!(fx.db.resolve(ds, None).unwrap().targets("datafiles"), &[f[3]]);
    }

    #[test]
    fn references_are_validated_before_writing() {
        let fx = Fixture::new();
        let owner = fx.user("owner").id;
        let other = fx.user("other").id;
        let engine = fx.engine();

        let private_file = fx.create("datafile", other, json!({"title": "p"}));
        let public_file = fx.create("datafile", other, json!({"title": "q", "safety_level": 1}));
        let section = fx.create("section", owner, json!({"name": "s"}));

        let missing = engine.create("dataset", owner, &body(json!({"title": "d", "datafiles": [424242]})), &opts(&[]));
        assert!(matches!(missing, Err(RestError::WrongReference { .. })));

        let hidden = engine.create("dataset", owner, &body(json!({"title": "d", "datafiles": [private_file]})), &opts(&[]));
        assert!(matches!(hidden, Err(RestError::WrongReference { .. })));

        // Readable but not editable: write-through links are refused.
        let read_only = engine.create("dataset", owner, &body(json!({"title": "d", "datafiles": [public_file]})), &opts(&[]));
        assert!(matches!(read_only, Err(RestError::NotAuthorized)));

        let wrong_type = engine.create("dataset", owner, &body(json!({"title": "d", "section": public_file})), &opts(&[]));
        assert!(matches!(wrong_type, Err(RestError::WrongReference { .. })));

        let ok = engine.create("dataset", owner, &body(json!({"title": "d", "section": section})), &opts(&[]));
        assert!(ok.is_ok());
        assert_eq!(
            fx.db.select_ids(&Selection::new("dataset", owner)).unwrap().len(),
            1
        );
    }

    #[test]
    fn required_fields_on_create() {
        let fx = Fixture::new();
        let u = fx.user("u").id;
        let engine = fx.engine();
        assert!(matches!(
            engine.create("section", u, &body(json!({"description": "x"})), &opts(&[])),
            Err(RestError::BadParameter { .. })
        ));
        assert!(matches!(
            engine.create("section", u, b"not json", &opts(&[])),
            Err(RestError::DataParsing(_))
        ));
    }

    #[test]
    fn bulk_update_requires_all_writable_unless_lenient() {
        let fx = Fixture::new();
        let u1 = fx.user("u1").id;
        let u2 = fx.user("u2").id;
        let engine = fx.engine();
        let mine = fx.create("block", u2, json!({"name": "mine"}));
        let theirs = fx.create("block", u1, json!({"name": "theirs", "safety_level": 1}));

        let strict = engine.bulk_update("block", u2, &body(json!({"index": 9})), &opts(&[("bulk_update", "1")]));
        assert!(matches!(strict, Err(RestError::NotAuthorized)));
        assert!(fx.db.resolve(mine, None).unwrap().attributes.get("index").is_none());

        let reply = engine
            .bulk_update(
                "block",
                u2,
                &body(json!({"index": 9})),
                &opts(&[("bulk_update", "1"), ("lenient", "1")]),
            )
            .unwrap();
        assert_eq!(reply.body["objects_selected"], 1);
        assert_eq!(fx.db.resolve(mine, None).unwrap().attributes["index"], json!(9));
        assert!(fx.db.resolve(theirs, None).unwrap().attributes.get("index").is_none());
    }

    #[test]
    fn bulk_update_rolls_back_on_a_late_failure() {
        let fx = Fixture::new();
        let u1 = fx.user("u1").id;
        let u2 = fx.user("u2").id;
        let engine = fx.engine();
        let mine = fx.create("block", u2, json!({"name": "mine"}));
        let granted = fx.create("block", u1, json!({"name": "granted"}));
        engine
            .update_acl("block", granted, u1, &body(json!({"shared_with": {"u2": "write"}})), &opts(&[]))
            .unwrap();

        // `mine` is written first; `granted` then refuses the visibility change.
        let result = engine.bulk_update(
            "block",
            u2,
            &body(json!({"index": 5, "safety_level": 1})),
            &opts(&[("bulk_update", "1")]),
        );
        assert!(matches!(result, Err(RestError::NotAuthorized)));

        let history = fx.db.history(mine).unwrap();
        assert_eq!(history.len(), 1);
        assert!(history[0].attributes.get("index").is_none());
        assert_eq!(fx.db.history(granted).unwrap().len(), 1);
    }

    #[test]
    fn bulk_update_reports_the_full_writable_count() {
        let fx = Fixture::new();
        let u = fx.user("u").id;
        let engine = fx.engine();
        fx.create("block", u, json!({"name": "a"}));
        fx.create("block", u, json!({"name": "b"}));

        let reply = engine
            .bulk_update(
                "block",
                u,
                &body(json!({"index": 1})),
                &opts(&[("bulk_update", "1"), ("max_results", "1")]),
            )
            .unwrap();
        assert_eq!(reply.body["objects_total"], 2);
        assert_eq!(reply.body["objects_selected"], 1);
        assert_eq!(reply.body["selected_range"], json!([0, 1]));
    }

    #[test]
    fn top_lists_tree_roots() {
        let fx = Fixture::new();
        let u1 = fx.user("u1").id;
        let u2 = fx.user("u2").id;
        let engine = fx.engine();

        let public_root = fx.create("section", u1, json!({"name": "pr", "safety_level": 1}));
        fx.create("section", u1, json!({"name": "pc", "safety_level": 1, "parent_section": public_root}));
        let hidden = fx.create("section", u1, json!({"name": "hidden"}));
        let granted = fx.create("section", u1, json!({"name": "granted", "parent_section": hidden}));
        engine
            .update_acl("section", granted, u1, &body(json!({"shared_with": {"u2": 1}})), &opts(&[]))
            .unwrap();
        let own_root = fx.create("section", u2, json!({"name": "own"}));
        fx.create("section", u2, json!({"name": "own child", "parent_section": own_root}));

        let ids = |reply: Reply| -> Vec<LocalId> {
            reply.body["selected"]
                .as_array()
                .unwrap()
                .iter()
                .map(|o| serde_json::from_value(o["local_id"].clone()).unwrap())
                .collect()
        };

        let owned = engine.list("section", u2, &opts(&[("top", "owned")])).unwrap();
        assert_eq!(ids(owned), vec![own_root]);

        let shared = engine.list("section", u2, &opts(&[("top", "shared")])).unwrap();
        assert_eq!(ids(shared), vec![public_root, granted]);

        assert!(matches!(
            engine.list("block", u2, &opts(&[("top", "owned")])),
            Err(RestError::WrongParams(_))
        ));
    }

    #[test]
    fn delete_restore_archive() {
        let fx = Fixture::new();
        let u = fx.user("u").id;
        let engine = fx.engine();
        let id = fx.create("section", u, json!({"name": "s"}));

        engine.delete("section", id, u).unwrap();
        engine.delete("section", id, u).unwrap();
        assert!(matches!(
            engine.get("section", id, u, &opts(&[])),
            Err(RestError::DoesNotExist)
        ));
        assert!(engine.get("section", id, u, &opts(&[("state", "deleted")])).is_ok());
        assert_eq!(
            engine.list("section", u, &opts(&[("state", "deleted")])).unwrap().body["objects_total"],
            1
        );

        let restored = engine
            .update("section", id, u, &body(json!({"current_state": 10})), &opts(&[]))
            .unwrap();
        assert_eq!(restored.body["selected"][0]["fields"]["name"], "s");

        engine
            .update("section", id, u, &body(json!({"current_state": "archived"})), &opts(&[]))
            .unwrap();
        assert!(matches!(
            engine.update("section", id, u, &body(json!({"current_state": 10})), &opts(&[])),
            Err(RestError::InvalidTransition { .. })
        ));
        assert!(matches!(
            engine.delete("section", id, u),
            Err(RestError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn bulk_delete_matches_filters() {
        let fx = Fixture::new();
        let u = fx.user("u").id;
        let engine = fx.engine();
        let keep = fx.create("block", u, json!({"name": "keep", "index": 1}));
        fx.create("block", u, json!({"name": "drop", "index": 2}));
        fx.create("block", u, json!({"name": "drop too", "index": 3}));

        let reply = engine.bulk_delete("block", u, &opts(&[("index__gt", "1")])).unwrap();
        assert_eq!(reply.body["objects_selected"], 2);
        let left = fx.db.select_ids(&Selection::new("block", u)).unwrap();
        assert_eq!(left, vec![keep]);
    }

    #[test]
    fn safety_level_belongs_to_owner() {
        let fx = Fixture::new();
        let u1 = fx.user("u1").id;
        let u2 = fx.user("u2").id;
        let engine = fx.engine();
        let id = fx.create("section", u1, json!({"name": "s"}));
        engine
            .update_acl("section", id, u1, &body(json!({"shared_with": {"u2": 2}})), &opts(&[]))
            .unwrap();

        assert!(matches!(
            engine.update("section", id, u2, &body(json!({"safety_level": 1})), &opts(&[])),
            Err(RestError::NotAuthorized)
        ));
        assert!(matches!(
            engine.update_acl("section", id, u2, &body(json!({"safety_level": 1})), &opts(&[])),
            Err(RestError::NotAuthorized)
        ));

        let acl = engine.acl("section", id, u2, &opts(&[])).unwrap();
        assert_eq!(acl.body["safety_level"], 3);
        assert_eq!(acl.body["shared_with"], json!({"u2": 2}));
    }

    #[test]
    fn acl_cascade_reaches_owned_children_only() {
        let fx = Fixture::new();
        let u1 = fx.user("u1").id;
        let u2 = fx.user("u2").id;
        let engine = fx.engine();
        let root = fx.create("section", u1, json!({"name": "root"}));
        let child = fx.create("section", u1, json!({"name": "child", "parent_section": root}));
        let grandchild = fx.create("section", u1, json!({"name": "gc", "parent_section": child}));
        let prop = fx.create("property", u1, json!({"name": "p", "section": child}));

        // u2 may link a section under root only with read access; grant it first.
        engine
            .update_acl("section", root, u1, &body(json!({"shared_with": {"u2": 1}})), &opts(&[]))
            .unwrap();
        let foreign = fx.create("section", u2, json!({"name": "foreign", "parent_section": root}));

        engine
            .update_acl(
                "section",
                root,
                u1,
                &body(json!({"safety_level": "public"})),
                &opts(&[("cascade", "1")]),
            )
            .unwrap();

        for id in [root, child, grandchild] {
            assert_eq!(fx.db.resolve(id, None).unwrap().visibility, Visibility::Public);
        }
        assert_eq!(fx.db.resolve(prop, None).unwrap().visibility, Visibility::Public);
        assert_eq!(fx.db.resolve(foreign, None).unwrap().visibility, Visibility::Private);
    }

    #[test]
    fn acl_cascade_walks_deep_trees() {
        let fx = Fixture::new();
        let u = fx.user("u").id;
        let engine = fx.engine();

        let mut chain = vec![fx.create("section", u, json!({"name": "s0"}))];
        for depth in 1..12 {
            let parent = chain[depth - 1];
            chain.push(fx.create(
                "section",
                u,
                json!({"name": format!("s{depth}"), "parent_section": parent}),
            ));
        }

        engine
            .update_acl(
                "section",
                chain[0],
                u,
                &body(json!({"safety_level": "public"})),
                &opts(&[("cascade", "1")]),
            )
            .unwrap();

        for (depth, id) in chain.iter().enumerate() {
            assert_eq!(
                fx.db.resolve(*id, None).unwrap().visibility,
                Visibility::Public,
                "depth {depth}"
            );
        }
    }

    #[test]
    fn acl_cascade_reaches_objects_attached_to_a_section() {
        let fx = Fixture::new();
        let u = fx.user("u").id;
        let engine = fx.engine();
        let root = fx.create("section", u, json!({"name": "root"}));
        let file = fx.create("datafile", u, json!({"title": "f", "section": root}));
        let dataset = fx.create("dataset", u, json!({"title": "d", "section": root}));
        let experiment = fx.create("experiment", u, json!({"title": "e", "section": root}));
        let block = fx.create("block", u, json!({"name": "b", "section": root}));
        let segment = fx.create("segment", u, json!({"name": "s", "block": block}));

        engine
            .update_acl(
                "section",
                root,
                u,
                &body(json!({"safety_level": "friendly"})),
                &opts(&[("cascade", "1")]),
            )
            .unwrap();

        for id in [root, file, dataset, experiment, block, segment] {
            assert_eq!(fx.db.resolve(id, None).unwrap().visibility, Visibility::Friendly);
        }
    }

    #[test]
    fn point_in_time_and_history() {
        let fx = Fixture::new();
        let u = fx.user("u").id;
        let engine = fx.engine();
        let id = fx.create("section", u, json!({"name": "A"}));
        let first = fx.db.resolve(id, None).unwrap();
        engine
            .update("section", id, u, &body(json!({"name": "B"})), &opts(&[]))
            .unwrap();

        let at = gnode_store::timestamps::encode(first.starts_at);
        let old = engine.get("section", id, u, &opts(&[("at_time", at.as_str())])).unwrap();
        assert_eq!(old.body["selected"][0]["fields"]["name"], "A");
        assert_eq!(old.version.unwrap().etag, etag(&first.guid));

        let now = engine.get("section", id, u, &opts(&[])).unwrap();
        assert_eq!(now.body["selected"][0]["fields"]["name"], "B");

        let history = engine.history("section", id, u, &opts(&[("q", "info")])).unwrap();
        assert_eq!(history.body["objects_total"], 2);
    }

    #[test]
    fn etag_is_stable_hex() {
        let guid = Uuid::new_v4();
        assert_eq!(etag(&guid), etag(&guid));
        assert_eq!(etag(&guid).len(), 64);
        assert_ne!(etag(&guid), etag(&Uuid::new_v4()));
    }
}
