//! Projection of versions into wire objects and parsing of request bodies.
//!
//! A serialized object looks like
//!
//! ```json
//! {"model": "section", "local_id": 12, "guid": "...",
//!  "permalink": "/api/section/12/", "fields": {...}}
//! ```
//!
//! The response mode decides which field groups appear in `fields`.
//! References render as permalinks, or, in cascade mode, as embedded objects
//! expanded recursively until an excluded field, an already visited object,
//! an unreadable target or the depth limit stops the expansion.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};
use gnode_shared::constants::MAX_CASCADE_DEPTH;
use gnode_shared::{access, LifecycleState, LocalId, ResponseMode, UserId, Visibility};
use gnode_store::{timestamps, Attributes, Database, StoreError, Version};
use serde_json::{json, Map, Value};

use crate::error::{RestError, Result};
use crate::fields::{parse_reference, FieldDescriptor, FieldGroup, FieldKind};
use crate::params::QueryOptions;
use crate::registry::{EntityType, Registry};

/// Keys rendered by the serializer that a body may echo back unchanged.
const READ_ONLY_KEYS: &[&str] = &[
    "model",
    "local_id",
    "guid",
    "permalink",
    "owner",
    "date_created",
    "starts_at",
    "ends_at",
];

pub fn permalink(entity_type: &str, local_id: LocalId) -> String {
    format!("/api/{entity_type}/{local_id}/")
}

pub struct Serializer<'a> {
    db: &'a Database,
    registry: &'a Registry,
    viewer: UserId,
    mode: ResponseMode,
    cascade: bool,
    at_time: Option<DateTime<Utc>>,
    usernames: HashMap<UserId, String>,
    readable: HashMap<LocalId, bool>,
}

impl<'a> Serializer<'a> {
    pub fn new(
        db: &'a Database,
        registry: &'a Registry,
        viewer: UserId,
        opts: &QueryOptions,
    ) -> Self {
        Self {
            db,
            registry,
            viewer,
            mode: opts.mode,
            cascade: opts.cascade,
            at_time: opts.at_time,
            usernames: HashMap::new(),
            readable: HashMap::new(),
        }
    }

    pub fn serialize_all(&mut self, versions: &[Version]) -> Result<Vec<Value>> {
        versions.iter().map(|v| self.serialize(v)).collect()
    }

    pub fn serialize(&mut self, version: &Version) -> Result<Value> {
        let mut visited = HashSet::from([version.local_id]);
        self.object(version, &mut visited, 0)
    }

    fn object(
        &mut self,
        version: &Version,
        visited: &mut HashSet<LocalId>,
        depth: usize,
    ) -> Result<Value> {
        let ty = self.registry.get(&version.entity_type)?;
        let mut fields = Map::new();

        if self.mode.includes_info() {
            fields.insert("owner".into(), json!(self.username(version.owner)?));
            fields.insert("safety_level".into(), json!(version.visibility.code()));
            fields.insert("current_state".into(), json!(version.state.code()));
            fields.insert(
                "date_created".into(),
                json!(timestamps::encode(version.date_created)),
            );
            fields.insert("starts_at".into(), json!(timestamps::encode(version.starts_at)));
            fields.insert(
                "ends_at".into(),
                json!(version.ends_at.map(timestamps::encode)),
            );
        }

        for field in ty.fields {
            let wanted = match field.group() {
                FieldGroup::Info => self.mode.includes_info(),
                FieldGroup::Data => self.mode.includes_data(),
                FieldGroup::Related => self.mode.includes_related(),
            };
            if !wanted {
                continue;
            }

            let value = match field.kind {
                FieldKind::Reference { target, many, .. } => {
                    let excluded = ty.excludes_cascade(field.name);
                    let mut rendered = Vec::new();
                    for id in version.targets(field.name) {
                        rendered.push(self.related(target, *id, excluded, visited, depth)?);
                    }
                    if many {
                        Value::Array(rendered)
                    } else {
                        rendered.into_iter().next().unwrap_or(Value::Null)
                    }
                }
                _ => version
                    .attributes
                    .get(field.name)
                    .map(|stored| field.serialize_value(stored))
                    .unwrap_or(Value::Null),
            };
            fields.insert(field.name.to_string(), value);
        }

        if self.mode.includes_related() {
            for child in ty.children {
                let ids = self.db.referencing(
                    child.entity_type,
                    child.field,
                    version.local_id,
                    LifecycleState::Active,
                    self.at_time,
                )?;
                let mut rendered = Vec::new();
                for id in ids {
                    if self.is_readable(id)? {
                        rendered.push(self.related(child.entity_type, id, false, visited, depth)?);
                    }
                }
                fields.insert(child.key(), Value::Array(rendered));
            }
        }

        Ok(json!({
            "model": ty.name,
            "local_id": version.local_id,
            "guid": version.guid,
            "permalink": permalink(ty.name, version.local_id),
            "fields": fields,
        }))
    }

    /// A permalink, or the embedded target when cascade allows it.
    fn related(
        &mut self,
        entity_type: &str,
        id: LocalId,
        excluded: bool,
        visited: &mut HashSet<LocalId>,
        depth: usize,
    ) -> Result<Value> {
        let link = Value::String(permalink(entity_type, id));
        if !self.cascade || excluded || depth >= MAX_CASCADE_DEPTH || visited.contains(&id) {
            return Ok(link);
        }
        if !self.is_readable(id)? {
            return Ok(link);
        }
        let version = match self.db.resolve(id, self.at_time) {
            Ok(v) if v.entity_type == entity_type && v.state == LifecycleState::Active => v,
            Ok(_) | Err(StoreError::NotFound) => return Ok(link),
            Err(e) => return Err(e.into()),
        };

        visited.insert(id);
        let embedded = self.object(&version, visited, depth + 1);
        visited.remove(&id);
        embedded
    }

    /// Read access judged on the current version, cached per serializer.
    fn is_readable(&mut self, id: LocalId) -> Result<bool> {
        if let Some(&known) = self.readable.get(&id) {
            return Ok(known);
        }
        let readable = match self.db.resolve(id, None) {
            Ok(current) => {
                let facts = self.db.access_facts(&current, self.viewer)?;
                access::accessible(self.viewer, &facts)
            }
            Err(StoreError::NotFound) => false,
            Err(e) => return Err(e.into()),
        };
        self.readable.insert(id, readable);
        Ok(readable)
    }

    fn username(&mut self, id: UserId) -> Result<String> {
        if let Some(name) = self.usernames.get(&id) {
            return Ok(name.clone());
        }
        let name = self.db.user_by_id(id)?.username;
        self.usernames.insert(id, name.clone());
        Ok(name)
    }
}

// ---------------------------------------------------------------------------
// Deserialization
// ---------------------------------------------------------------------------

/// A request body split into the buckets the mutation path handles
/// separately.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Payload {
    pub attributes: Attributes,
    /// `None` clears the reference.
    pub single_refs: BTreeMap<String, Option<LocalId>>,
    pub multi_refs: BTreeMap<String, Vec<LocalId>>,
    pub safety_level: Option<Visibility>,
    pub current_state: Option<LifecycleState>,
}

impl Payload {
    /// Every reference target with the descriptor it was given for.
    pub fn references<'t>(
        &'t self,
        ty: &'t EntityType,
    ) -> impl Iterator<Item = (&'static FieldDescriptor, LocalId)> + 't {
        let singles = self
            .single_refs
            .iter()
            .filter_map(|(name, id)| Some((name, (*id)?)));
        let multis = self
            .multi_refs
            .iter()
            .flat_map(|(name, ids)| ids.iter().map(move |id| (name, *id)));
        singles
            .chain(multis)
            .filter_map(move |(name, id)| Some((ty.field(name)?, id)))
    }
}

/// Parse a raw body into a JSON object, unwrapping a `{"fields": {...}}`
/// envelope.
pub fn parse_body(raw: &[u8]) -> Result<Map<String, Value>> {
    let value: Value =
        serde_json::from_slice(raw).map_err(|e| RestError::DataParsing(e.to_string()))?;
    let Value::Object(mut obj) = value else {
        return Err(RestError::DataParsing("body must be a JSON object".into()));
    };
    match obj.remove("fields") {
        Some(Value::Object(fields)) => Ok(fields),
        Some(_) => Err(RestError::DataParsing("'fields' must be an object".into())),
        None => Ok(obj),
    }
}

pub fn deserialize(ty: &EntityType, raw: &[u8]) -> Result<Payload> {
    let body = parse_body(raw)?;
    let mut payload = Payload::default();

    for (key, value) in &body {
        match key.as_str() {
            "safety_level" => payload.safety_level = Some(parse_safety_level(value)?),
            "current_state" => payload.current_state = Some(parse_state(value)?),
            k if READ_ONLY_KEYS.iter().any(|ro| *ro == k) => {}
            k if ty.children.iter().any(|c| c.key() == k) => {}
            _ => {
                let field = ty.field(key).ok_or_else(|| {
                    RestError::PostDataInvalid(format!("'{}' has no field '{key}'", ty.name))
                })?;
                deserialize_field(field, value, &mut payload)?;
            }
        }
    }
    Ok(payload)
}

fn deserialize_field(field: &FieldDescriptor, value: &Value, payload: &mut Payload) -> Result<()> {
    let FieldKind::Reference { many, .. } = field.kind else {
        let stored = field.deserialize_value(value)?;
        payload.attributes.insert(field.name.to_string(), stored);
        return Ok(());
    };

    if many {
        let ids = match value {
            Value::Null => Vec::new(),
            Value::Array(items) => items
                .iter()
                .map(|item| parse_reference(field.name, item))
                .collect::<Result<_>>()?,
            _ => return Err(RestError::bad_parameter(field.name, "parameter must be a list")),
        };
        payload.multi_refs.insert(field.name.to_string(), ids);
    } else {
        let id = match value {
            Value::Null if field.required => {
                return Err(RestError::bad_parameter(field.name, "this field is required"))
            }
            Value::Null => None,
            other => Some(parse_reference(field.name, other)?),
        };
        payload.single_refs.insert(field.name.to_string(), id);
    }
    Ok(())
}

pub fn parse_safety_level(value: &Value) -> Result<Visibility> {
    let parsed = match value {
        Value::Number(n) => n.as_i64().and_then(Visibility::from_code),
        Value::String(s) => s.parse().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| RestError::bad_parameter("safety_level", format!("invalid level {value}")))
}

fn parse_state(value: &Value) -> Result<LifecycleState> {
    let parsed = match value {
        Value::Number(n) => n.as_i64().and_then(LifecycleState::from_code),
        Value::String(s) => s.parse().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| RestError::bad_parameter("current_state", format!("invalid state {value}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog;
    use gnode_store::{NewEntity, Relations};

    fn setup() -> (Database, Registry, UserId) {
        let db = Database::open_in_memory().unwrap();
        let owner = db.create_user("owner").unwrap().id;
        (db, Registry::builtin(), owner)
    }

    fn section(db: &Database, owner: UserId, name: &str, parent: Option<LocalId>) -> Version {
        let mut relations = Relations::new();
        if let Some(p) = parent {
            relations.insert("parent_section".into(), vec![p]);
        }
        db.create_entity(&NewEntity {
            entity_type: "section".into(),
            owner,
            visibility: Visibility::Private,
            attributes: json!({ "name": name }).as_object().cloned().unwrap(),
            relations,
        })
        .unwrap()
    }

    fn opts(mode: ResponseMode, cascade: bool) -> QueryOptions {
        QueryOptions {
            mode,
            cascade,
            ..Default::default()
        }
    }

    #[test]
    fn object_shape_and_modes() {
        let (db, registry, owner) = setup();
        let root = section(&db, owner, "root", None);

        let info = Serializer::new(&db, &registry, owner, &opts(ResponseMode::Info, false))
            .serialize(&root)
            .unwrap();
        assert_eq!(info["model"], "section");
        assert_eq!(info["permalink"], format!("/api/section/{}/", root.local_id));
        assert_eq!(info["fields"]["name"], "root");
        assert_eq!(info["fields"]["owner"], "owner");
        assert_eq!(info["fields"]["safety_level"], 3);
        assert!(info["fields"].get("parent_section").is_none());
        assert!(info["fields"].get("section_set").is_none());

        let related = Serializer::new(&db, &registry, owner, &opts(ResponseMode::Related, false))
            .serialize(&root)
            .unwrap();
        assert!(related["fields"].get("name").is_none());
        assert_eq!(related["fields"]["parent_section"], Value::Null);
        assert_eq!(related["fields"]["section_set"], json!([]));
    }

    #[test]
    fn child_sets_list_readable_children() {
        let (db, registry, owner) = setup();
        let other = db.create_user("other").unwrap().id;
        let root = section(&db, owner, "root", None);
        let child = section(&db, owner, "child", Some(root.local_id));
        db.set_visibility(root.local_id, Visibility::Public).unwrap();

        let full = Serializer::new(&db, &registry, owner, &opts(ResponseMode::Full, false))
            .serialize(&db.resolve(root.local_id, None).unwrap())
            .unwrap();
        assert_eq!(
            full["fields"]["section_set"],
            json!([permalink("section", child.local_id)])
        );

        // The private child stays hidden from a stranger reading the public root.
        let stranger = Serializer::new(&db, &registry, other, &opts(ResponseMode::Full, false))
            .serialize(&db.resolve(root.local_id, None).unwrap())
            .unwrap();
        assert_eq!(stranger["fields"]["section_set"], json!([]));
    }

    #[test]
    fn cascade_embeds_children_but_not_excluded_parent() {
        let (db, registry, owner) = setup();
        let root = section(&db, owner, "root", None);
        let child = section(&db, owner, "child", Some(root.local_id));

        let out = Serializer::new(&db, &registry, owner, &opts(ResponseMode::Full, true))
            .serialize(&root)
            .unwrap();
        let embedded = &out["fields"]["section_set"][0];
        assert_eq!(embedded["local_id"], json!(child.local_id));
        assert_eq!(embedded["fields"]["name"], "child");
        assert_eq!(
            embedded["fields"]["parent_section"],
            json!(permalink("section", root.local_id))
        );
    }

    #[test]
    fn cascade_embeds_many_references() {
        let (db, registry, owner) = setup();
        let a = db
            .create_entity(&NewEntity {
                entity_type: "dataset".into(),
                owner,
                visibility: Visibility::Private,
                attributes: json!({"title": "a"}).as_object().cloned().unwrap(),
                relations: Relations::new(),
            })
            .unwrap();
        let mut relations = Relations::new();
        relations.insert("datasets".into(), vec![a.local_id]);
        let exp = db
            .create_entity(&NewEntity {
                entity_type: "experiment".into(),
                owner,
                visibility: Visibility::Private,
                attributes: json!({"title": "e"}).as_object().cloned().unwrap(),
                relations,
            })
            .unwrap();

        let out = Serializer::new(&db, &registry, owner, &opts(ResponseMode::Full, true))
            .serialize(&exp)
            .unwrap();
        assert_eq!(out["fields"]["datasets"][0]["fields"]["title"], "a");
    }

    #[test]
    fn deserialize_buckets_and_errors() {
        let ty = &catalog::DATASET;
        let payload = deserialize(
            ty,
            br#"{"fields": {"title": "t", "tags": "b,a", "section": "/api/section/3/",
                 "datafiles": [1, "2"], "safety_level": "public", "permalink": "x"}}"#,
        )
        .unwrap();
        assert_eq!(payload.attributes["tags"], json!(["a", "b"]));
        assert_eq!(payload.single_refs["section"], Some(LocalId(3)));
        assert_eq!(payload.multi_refs["datafiles"], vec![LocalId(1), LocalId(2)]);
        assert_eq!(payload.safety_level, Some(Visibility::Public));
        assert_eq!(payload.references(ty).count(), 3);

        assert!(matches!(deserialize(ty, b"[1,2]"), Err(RestError::DataParsing(_))));
        assert!(matches!(deserialize(ty, b"{not json"), Err(RestError::DataParsing(_))));
        assert!(matches!(
            deserialize(ty, br#"{"colour": "red"}"#),
            Err(RestError::PostDataInvalid(_))
        ));
        assert!(matches!(
            deserialize(ty, br#"{"datafiles": 5}"#),
            Err(RestError::BadParameter { .. })
        ));
        assert!(matches!(
            deserialize(ty, br#"{"safety_level": 9}"#),
            Err(RestError::BadParameter { .. })
        ));
    }
}
