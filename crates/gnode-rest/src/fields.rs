//! Field descriptor tables.
//!
//! Each entity type declares its fields once, as a `static` slice of
//! [`FieldDescriptor`]s. The serializer, the filter compiler and the mutation
//! path all dispatch on [`FieldKind`] instead of inspecting payloads.

use chrono::{NaiveDateTime, TimeZone, Utc};
use gnode_shared::LocalId;
use gnode_store::timestamps;
use serde_json::{Number, Value};

use crate::error::{RestError, Result};

/// Storage type of a plain attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlainType {
    Text,
    Integer,
    Float,
    Bool,
    /// Stored as fixed-width RFC 3339 UTC text.
    Datetime,
}

/// Which response-mode group a field is rendered in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldGroup {
    Info,
    Data,
    Related,
}

/// A named pair of serialize/deserialize functions for values whose wire
/// shape differs from the stored one.
pub struct SpecialHook {
    pub name: &'static str,
    pub group: FieldGroup,
    pub serialize: fn(&Value) -> Value,
    pub deserialize: fn(&str, &Value) -> Result<Value>,
}

impl std::fmt::Debug for SpecialHook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpecialHook").field("name", &self.name).finish()
    }
}

#[derive(Debug, Clone, Copy)]
pub enum FieldKind {
    Plain(PlainType),
    /// `{"data": <number>, "units": <text>}`.
    Data,
    Reference {
        target: &'static str,
        many: bool,
        /// Linking requires write access to the target, not just read.
        write_through: bool,
    },
    Special(&'static SpecialHook),
}

#[derive(Debug, Clone, Copy)]
pub struct FieldDescriptor {
    pub name: &'static str,
    pub kind: FieldKind,
    pub required: bool,
}

impl FieldDescriptor {
    pub const fn plain(name: &'static str, ty: PlainType) -> Self {
        Self {
            name,
            kind: FieldKind::Plain(ty),
            required: false,
        }
    }

    pub const fn text(name: &'static str) -> Self {
        Self::plain(name, PlainType::Text)
    }

    pub const fn data(name: &'static str) -> Self {
        Self {
            name,
            kind: FieldKind::Data,
            required: false,
        }
    }

    pub const fn reference(name: &'static str, target: &'static str) -> Self {
        Self {
            name,
            kind: FieldKind::Reference {
                target,
                many: false,
                write_through: false,
            },
            required: false,
        }
    }

    pub const fn many(name: &'static str, target: &'static str, write_through: bool) -> Self {
        Self {
            name,
            kind: FieldKind::Reference {
                target,
                many: true,
                write_through,
            },
            required: false,
        }
    }

    pub const fn special(name: &'static str, hook: &'static SpecialHook) -> Self {
        Self {
            name,
            kind: FieldKind::Special(hook),
            required: false,
        }
    }

    pub const fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn group(&self) -> FieldGroup {
        match self.kind {
            FieldKind::Plain(_) => FieldGroup::Info,
            FieldKind::Data => FieldGroup::Data,
            FieldKind::Reference { .. } => FieldGroup::Related,
            FieldKind::Special(hook) => hook.group,
        }
    }

    pub fn is_reference(&self) -> bool {
        matches!(self.kind, FieldKind::Reference { .. })
    }

    /// Validate a body value for a non-reference field and return the form
    /// to store. `null` clears the attribute.
    pub fn deserialize_value(&self, value: &Value) -> Result<Value> {
        if value.is_null() {
            if self.required {
                return Err(RestError::bad_parameter(self.name, "this field is required"));
            }
            return Ok(Value::Null);
        }
        match self.kind {
            FieldKind::Plain(ty) => deserialize_plain(self.name, ty, value),
            FieldKind::Data => deserialize_data(self.name, value),
            FieldKind::Special(hook) => (hook.deserialize)(self.name, value),
            FieldKind::Reference { .. } => Err(RestError::PostDataInvalid(format!(
                "'{}' is a reference",
                self.name
            ))),
        }
    }

    /// Render a stored value for a non-reference field.
    pub fn serialize_value(&self, stored: &Value) -> Value {
        match self.kind {
            FieldKind::Special(hook) if !stored.is_null() => (hook.serialize)(stored),
            _ => stored.clone(),
        }
    }
}

fn deserialize_plain(field: &str, ty: PlainType, value: &Value) -> Result<Value> {
    let ok = match ty {
        PlainType::Text => value.is_string(),
        PlainType::Integer => value.is_i64() || value.is_u64(),
        PlainType::Float => value.is_number(),
        PlainType::Bool => value.is_boolean(),
        PlainType::Datetime => {
            let raw = value
                .as_str()
                .ok_or_else(|| RestError::bad_parameter(field, "expected a datetime string"))?;
            let parsed = parse_datetime(raw)
                .ok_or_else(|| RestError::bad_parameter(field, format!("invalid datetime '{raw}'")))?;
            return Ok(Value::String(timestamps::encode(parsed)));
        }
    };
    if ok {
        Ok(value.clone())
    } else {
        Err(RestError::bad_parameter(
            field,
            format!("expected {}", plain_type_name(ty)),
        ))
    }
}

fn deserialize_data(field: &str, value: &Value) -> Result<Value> {
    let obj = value.as_object().ok_or_else(|| {
        RestError::bad_parameter(field, "must be an object with 'data' and 'units' keys")
    })?;
    let data = obj
        .get("data")
        .filter(|d| d.is_number())
        .ok_or_else(|| RestError::bad_parameter(field, "'data' must be a number"))?;
    let units = obj
        .get("units")
        .and_then(Value::as_str)
        .ok_or_else(|| RestError::bad_parameter(field, "'units' must be a string"))?;
    if obj.len() > 2 {
        return Err(RestError::bad_parameter(field, "only 'data' and 'units' are allowed"));
    }
    Ok(serde_json::json!({ "data": data, "units": units }))
}

fn plain_type_name(ty: PlainType) -> &'static str {
    match ty {
        PlainType::Text => "a string",
        PlainType::Integer => "an integer",
        PlainType::Float => "a number",
        PlainType::Bool => "a boolean",
        PlainType::Datetime => "a datetime",
    }
}

/// Accepts RFC 3339 or `YYYY-MM-DD HH:MM:SS` (taken as UTC).
pub fn parse_datetime(raw: &str) -> Option<chrono::DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// Parse a reference value: a bare id, a numeric string or a permalink
/// ending in `/<id>/`.
pub fn parse_reference(field: &str, value: &Value) -> Result<LocalId> {
    let bad = || RestError::bad_parameter(field, format!("cannot resolve reference {value}"));
    match value {
        Value::Number(n) => n.as_i64().map(LocalId).ok_or_else(bad),
        Value::String(s) => s
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .and_then(|last| last.parse().ok())
            .ok_or_else(bad),
        _ => Err(bad()),
    }
}

// ---------------------------------------------------------------------------
// Builtin special hooks
// ---------------------------------------------------------------------------

pub static TAGS: SpecialHook = SpecialHook {
    name: "tags",
    group: FieldGroup::Info,
    serialize: passthrough,
    deserialize: deserialize_tags,
};

pub static FLOAT_ARRAY: SpecialHook = SpecialHook {
    name: "float_array",
    group: FieldGroup::Data,
    serialize: passthrough,
    deserialize: deserialize_float_array,
};

fn passthrough(stored: &Value) -> Value {
    stored.clone()
}

/// Comma-separated string or list of strings, stored sorted and unique.
fn deserialize_tags(field: &str, value: &Value) -> Result<Value> {
    let mut tags: Vec<String> = match value {
        Value::String(s) => s.split(',').map(|t| t.trim().to_string()).collect(),
        Value::Array(items) => items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(|t| t.trim().to_string())
                    .ok_or_else(|| RestError::bad_parameter(field, "tags must be strings"))
            })
            .collect::<Result<_>>()?,
        _ => {
            return Err(RestError::bad_parameter(
                field,
                "expected a comma-separated string or a list",
            ))
        }
    };
    tags.retain(|t| !t.is_empty());
    tags.sort();
    tags.dedup();
    Ok(Value::Array(tags.into_iter().map(Value::String).collect()))
}

/// List of numbers or a comma-separated string of numbers.
fn deserialize_float_array(field: &str, value: &Value) -> Result<Value> {
    let bad = |details: String| RestError::BadFloatData {
        field: field.to_string(),
        details,
    };
    let numbers: Vec<f64> = match value {
        Value::Array(items) => items
            .iter()
            .map(|item| item.as_f64().ok_or_else(|| bad(format!("{item} is not a number"))))
            .collect::<Result<_>>()?,
        Value::String(s) => s
            .split(',')
            .map(|part| {
                part.trim()
                    .parse::<f64>()
                    .map_err(|_| bad(format!("'{}' is not a number", part.trim())))
            })
            .collect::<Result<_>>()?,
        other => return Err(bad(format!("expected a list, got {other}"))),
    };
    numbers
        .into_iter()
        .map(|n| {
            Number::from_f64(n)
                .map(Value::Number)
                .ok_or_else(|| bad(format!("{n} is not finite")))
        })
        .collect::<Result<Vec<_>>>()
        .map(Value::Array)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn plain_types_never_coerce() {
        let int = FieldDescriptor::plain("index", PlainType::Integer);
        assert_eq!(int.deserialize_value(&json!(3)).unwrap(), json!(3));
        assert!(matches!(
            int.deserialize_value(&json!("3")),
            Err(RestError::BadParameter { .. })
        ));

        let flag = FieldDescriptor::plain("is_template", PlainType::Bool);
        assert!(flag.deserialize_value(&json!(1)).is_err());

        let name = FieldDescriptor::text("name").required();
        assert!(name.deserialize_value(&Value::Null).is_err());
    }

    #[test]
    fn datetime_is_normalized() {
        let dt = FieldDescriptor::plain("filedatetime", PlainType::Datetime);
        let stored = dt.deserialize_value(&json!("2012-03-04 05:06:07")).unwrap();
        assert_eq!(stored, json!("2012-03-04T05:06:07.000000Z"));
        assert!(dt.deserialize_value(&json!("yesterday")).is_err());
    }

    #[test]
    fn data_field_requires_value_and_units() {
        let f = FieldDescriptor::data("t_start");
        assert_eq!(
            f.deserialize_value(&json!({"data": 1.5, "units": "ms"})).unwrap(),
            json!({"data": 1.5, "units": "ms"})
        );
        assert!(f.deserialize_value(&json!(1.5)).is_err());
        assert!(f.deserialize_value(&json!({"data": 1.5})).is_err());
        assert!(f.deserialize_value(&json!({"data": "x", "units": "ms"})).is_err());
    }

    #[test]
    fn tags_are_sorted_and_unique() {
        let f = FieldDescriptor::special("tags", &TAGS);
        assert_eq!(
            f.deserialize_value(&json!("b, a,b,,c")).unwrap(),
            json!(["a", "b", "c"])
        );
        assert_eq!(f.deserialize_value(&json!(["z", "y"])).unwrap(), json!(["y", "z"]));
        assert!(f.deserialize_value(&json!(5)).is_err());
    }

    #[test]
    fn float_array_rejects_garbage() {
        let f = FieldDescriptor::special("signal", &FLOAT_ARRAY);
        assert_eq!(f.deserialize_value(&json!("1, 2.5")).unwrap(), json!([1.0, 2.5]));
        assert!(matches!(
            f.deserialize_value(&json!("1, x")),
            Err(RestError::BadFloatData { .. })
        ));
        assert_eq!(f.group(), FieldGroup::Data);
    }

    #[test]
    fn references_accept_ids_and_permalinks() {
        assert_eq!(parse_reference("s", &json!(7)).unwrap(), LocalId(7));
        assert_eq!(parse_reference("s", &json!("12")).unwrap(), LocalId(12));
        assert_eq!(
            parse_reference("s", &json!("/api/section/42/")).unwrap(),
            LocalId(42)
        );
        assert!(parse_reference("s", &json!({"id": 1})).is_err());
    }
}
