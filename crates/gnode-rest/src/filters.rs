//! Declarative filter compilation.
//!
//! Turns leftover request parameters into store [`Predicate`]s. Supported
//! forms are `field`, `field__<lookup>` and the negated `not__field...`, plus
//! the builtin filters every type understands: `owner`, `visibility`,
//! `created_min` and `created_max`. Types that nest through a
//! `parent_section` self-reference also understand `top=owned|shared`.

use gnode_shared::{UserId, Visibility};
use gnode_store::{timestamps, Database, Lookup, Operand, Predicate, SqlValue, StoreError};

use crate::error::{RestError, Result};
use crate::fields::{parse_datetime, FieldDescriptor, FieldKind, PlainType};
use crate::params::parse_flag;
use crate::registry::EntityType;

const NEGATION_PREFIX: &str = "not__";
const PARENT_FIELD: &str = "parent_section";

pub fn compile(
    db: &Database,
    ty: &EntityType,
    viewer: UserId,
    params: &[(String, String)],
) -> Result<Vec<Predicate>> {
    let mut predicates = Vec::with_capacity(params.len());
    for (key, value) in params {
        if let Some(builtin) = builtin(db, ty, viewer, key, value)? {
            predicates.extend(builtin);
            continue;
        }

        let (negated, rest) = match key.strip_prefix(NEGATION_PREFIX) {
            Some(rest) => (true, rest),
            None => (false, key.as_str()),
        };
        let (name, lookup) = split_lookup(rest)?;
        let field = ty
            .field(name)
            .ok_or_else(|| RestError::WrongParams(format!("unknown parameter '{key}'")))?;

        let p = field_predicate(field, lookup, value)?;
        predicates.push(if negated { p.negate() } else { p });
    }
    Ok(predicates)
}

/// Builtin filters. `None` when `key` is not one of them.
fn builtin(
    db: &Database,
    ty: &EntityType,
    viewer: UserId,
    key: &str,
    value: &str,
) -> Result<Option<Vec<Predicate>>> {
    let p = match key {
        "top" => return top(ty, viewer, value).map(Some),
        "owner" => {
            let owner = match db.user_by_name(value.trim()) {
                Ok(user) => vec![SqlValue::Integer(user.id.0)],
                // Unknown users own nothing.
                Err(StoreError::NotFound) => Vec::new(),
                Err(e) => return Err(e.into()),
            };
            Predicate::new(Operand::Owner, Lookup::In, owner)
        }
        "visibility" => match value.trim() {
            "all" => match_all(),
            "shared" => Predicate::new(
                Operand::Owner,
                Lookup::Exact,
                vec![SqlValue::Integer(viewer.0)],
            )
            .negate(),
            other => {
                let level: Visibility = other.parse().map_err(|_| wrong(key, value))?;
                Predicate::new(
                    Operand::Visibility,
                    Lookup::Exact,
                    vec![SqlValue::Integer(level.code() as i64)],
                )
            }
        },
        "created_min" | "created_max" => {
            let at = parse_datetime(value).ok_or_else(|| wrong(key, value))?;
            let lookup = if key == "created_min" { Lookup::Gt } else { Lookup::Lt };
            Predicate::new(
                Operand::DateCreated,
                lookup,
                vec![SqlValue::Text(timestamps::encode(at))],
            )
        }
        _ => return Ok(None),
    };
    Ok(Some(vec![p]))
}

/// Roots of the viewer's own trees (`owned`), or shared objects whose parent
/// is not itself shared with the viewer (`shared`).
fn top(ty: &EntityType, viewer: UserId, value: &str) -> Result<Vec<Predicate>> {
    let nested = matches!(
        ty.field(PARENT_FIELD).map(|f| f.kind),
        Some(FieldKind::Reference { target, many: false, .. }) if target == ty.name
    );
    if !nested {
        return Err(RestError::WrongParams(format!(
            "'top' is not supported for {}",
            ty.name
        )));
    }

    let is_viewer = Predicate::new(
        Operand::Owner,
        Lookup::Exact,
        vec![SqlValue::Integer(viewer.0)],
    );
    let no_parent = |operand| Predicate::new(operand, Lookup::IsNull, vec![SqlValue::Integer(1)]);
    let predicates = match value.trim() {
        "owned" => vec![is_viewer, no_parent(Operand::Relation(PARENT_FIELD.into()))],
        "shared" => vec![
            is_viewer.negate(),
            no_parent(Operand::SharedRelation(PARENT_FIELD.into())),
        ],
        _ => return Err(wrong("top", value)),
    };
    Ok(predicates)
}

/// `visibility=all` restricts nothing; expressed as "owner is not null".
fn match_all() -> Predicate {
    Predicate::new(Operand::Owner, Lookup::IsNull, vec![SqlValue::Integer(0)])
}

fn split_lookup(key: &str) -> Result<(&str, Lookup)> {
    let Some((name, suffix)) = key.rsplit_once("__") else {
        return Ok((key, Lookup::Exact));
    };
    let lookup = match suffix {
        "exact" => Lookup::Exact,
        "lt" => Lookup::Lt,
        "lte" => Lookup::Lte,
        "gt" => Lookup::Gt,
        "gte" => Lookup::Gte,
        "in" => Lookup::In,
        "icontains" => Lookup::IContains,
        "isnull" => Lookup::IsNull,
        other => {
            return Err(RestError::WrongParams(format!(
                "unknown lookup '{other}' in '{key}'"
            )))
        }
    };
    Ok((name, lookup))
}

fn field_predicate(field: &FieldDescriptor, lookup: Lookup, raw: &str) -> Result<Predicate> {
    let key = field.name;
    if field.is_reference() && !matches!(lookup, Lookup::Exact | Lookup::In | Lookup::IsNull) {
        return Err(RestError::WrongParams(format!(
            "references support only exact, in and isnull: '{key}'"
        )));
    }

    let operand = match field.kind {
        FieldKind::Reference { .. } => Operand::Relation(field.name.to_string()),
        FieldKind::Data => Operand::Attribute {
            name: field.name.to_string(),
            key: Some("data".to_string()),
        },
        _ => Operand::Attribute {
            name: field.name.to_string(),
            key: None,
        },
    };

    let values = match lookup {
        Lookup::IsNull => vec![SqlValue::Integer(parse_flag(key, raw)? as i64)],
        Lookup::IContains => vec![SqlValue::Text(raw.to_string())],
        Lookup::In => raw
            .split(',')
            .map(|part| parse_operand_value(field, part))
            .collect::<Result<_>>()?,
        _ => vec![parse_operand_value(field, raw)?],
    };
    Ok(Predicate::new(operand, lookup, values))
}

/// Parse one filter value according to the field's stored type.
fn parse_operand_value(field: &FieldDescriptor, raw: &str) -> Result<SqlValue> {
    let raw = raw.trim();
    let key = field.name;
    let value = match field.kind {
        FieldKind::Plain(PlainType::Text) | FieldKind::Special(_) => SqlValue::Text(raw.to_string()),
        FieldKind::Plain(PlainType::Integer) => {
            SqlValue::Integer(raw.parse().map_err(|_| wrong(key, raw))?)
        }
        FieldKind::Plain(PlainType::Float) | FieldKind::Data => {
            SqlValue::Real(raw.parse().map_err(|_| wrong(key, raw))?)
        }
        FieldKind::Plain(PlainType::Bool) => SqlValue::Integer(parse_flag(key, raw)? as i64),
        FieldKind::Plain(PlainType::Datetime) => {
            let at = parse_datetime(raw).ok_or_else(|| wrong(key, raw))?;
            SqlValue::Text(timestamps::encode(at))
        }
        FieldKind::Reference { .. } => {
            let id = crate::fields::parse_reference(key, &serde_json::Value::String(raw.to_string()))
                .map_err(|_| wrong(key, raw))?;
            SqlValue::Integer(id.0)
        }
    };
    Ok(value)
}

fn wrong(key: &str, value: &str) -> RestError {
    RestError::WrongParams(format!("invalid value '{value}' for '{key}'"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog;

    fn params(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn lookups_and_negation() {
        let db = Database::open_in_memory().unwrap();
        let preds = compile(
            &db,
            &catalog::BLOCK,
            UserId(1),
            &params(&[("index__gte", "2"), ("not__name__icontains", "tmp")]),
        )
        .unwrap();

        assert_eq!(preds[0].lookup, Lookup::Gte);
        assert_eq!(preds[0].values, vec![SqlValue::Integer(2)]);
        assert!(!preds[0].negated);
        assert_eq!(preds[1].lookup, Lookup::IContains);
        assert!(preds[1].negated);
    }

    #[test]
    fn data_fields_compare_the_number() {
        let db = Database::open_in_memory().unwrap();
        let preds = compile(
            &db,
            &catalog::ANALOGSIGNAL,
            UserId(1),
            &params(&[("t_start__lt", "1.5")]),
        )
        .unwrap();
        assert_eq!(
            preds[0].operand,
            Operand::Attribute {
                name: "t_start".into(),
                key: Some("data".into())
            }
        );
        assert_eq!(preds[0].values, vec![SqlValue::Real(1.5)]);
    }

    #[test]
    fn reference_filters() {
        let db = Database::open_in_memory().unwrap();
        let preds = compile(
            &db,
            &catalog::SECTION,
            UserId(1),
            &params(&[("parent_section__in", "3,/api/section/4/")]),
        )
        .unwrap();
        assert_eq!(
            preds[0].values,
            vec![SqlValue::Integer(3), SqlValue::Integer(4)]
        );

        assert!(compile(
            &db,
            &catalog::SECTION,
            UserId(1),
            &params(&[("parent_section__gt", "3")])
        )
        .is_err());
    }

    #[test]
    fn unknown_or_unparsable_is_wrong_params() {
        let db = Database::open_in_memory().unwrap();
        for (k, v) in [
            ("colour", "red"),
            ("index__near", "1"),
            ("index", "one"),
            ("visibility", "secret"),
            ("created_min", "tomorrow"),
        ] {
            assert!(
                matches!(
                    compile(&db, &catalog::BLOCK, UserId(1), &params(&[(k, v)])),
                    Err(RestError::WrongParams(_))
                ),
                "{k}={v}"
            );
        }
    }

    #[test]
    fn top_applies_only_to_nested_types() {
        let db = Database::open_in_memory().unwrap();
        let owned = compile(&db, &catalog::SECTION, UserId(7), &params(&[("top", "owned")])).unwrap();
        assert_eq!(owned.len(), 2);
        assert_eq!(owned[0].operand, Operand::Owner);
        assert!(!owned[0].negated);
        assert_eq!(owned[1].operand, Operand::Relation("parent_section".into()));

        let shared = compile(&db, &catalog::SECTION, UserId(7), &params(&[("top", "shared")])).unwrap();
        assert!(shared[0].negated);
        assert_eq!(shared[1].operand, Operand::SharedRelation("parent_section".into()));
        assert_eq!(shared[1].lookup, Lookup::IsNull);

        for (ty, value) in [(&catalog::BLOCK, "owned"), (&catalog::SECTION, "everything")] {
            assert!(matches!(
                compile(&db, ty, UserId(7), &params(&[("top", value)])),
                Err(RestError::WrongParams(_))
            ));
        }
    }

    #[test]
    fn builtin_owner_and_visibility() {
        let db = Database::open_in_memory().unwrap();
        let alice = db.create_user("alice").unwrap();
        let preds = compile(
            &db,
            &catalog::SECTION,
            UserId(99),
            &params(&[("owner", "alice"), ("owner", "nobody"), ("visibility", "shared")]),
        )
        .unwrap();
        assert_eq!(preds[0].values, vec![SqlValue::Integer(alice.id.0)]);
        assert!(preds[1].values.is_empty());
        assert!(preds[2].negated);
    }
}
