//! Phase-1 selection: identifiers only.
//!
//! A [`Selection`] describes which entities a list request may touch:
//! entity type, lifecycle state, an optional point in time, declarative
//! predicates and the requesting user. It compiles to a single SQL statement
//! returning local ids ordered ascending. No attribute payload or relation
//! rows are loaded here; that happens later in [`Database::materialize`] for
//! the page actually returned.

use chrono::{DateTime, Utc};
use gnode_shared::{AccessLevel, LifecycleState, LocalId, UserId, Visibility};
use rusqlite::params_from_iter;

pub use rusqlite::types::Value as SqlValue;

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::timestamps;

/// Left-hand side of a predicate.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    /// A key of the version's attribute object, optionally a nested key
    /// (e.g. the `data` half of a value+unit pair).
    Attribute { name: String, key: Option<String> },
    /// A relation field; compared against target local ids.
    Relation(String),
    /// A relation field restricted to active targets the viewer reads but
    /// does not own. Supports `IsNull` only.
    SharedRelation(String),
    Owner,
    DateCreated,
    /// Visibility of the current version.
    Visibility,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    Exact,
    Lt,
    Lte,
    Gt,
    Gte,
    In,
    IContains,
    /// `values[0]` is `Integer(1)` for "is null", `Integer(0)` otherwise.
    IsNull,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    pub operand: Operand,
    pub lookup: Lookup,
    pub negated: bool,
    pub values: Vec<SqlValue>,
}

impl Predicate {
    pub fn new(operand: Operand, lookup: Lookup, values: Vec<SqlValue>) -> Self {
        Self {
            operand,
            lookup,
            negated: false,
            values,
        }
    }

    pub fn negate(mut self) -> Self {
        self.negated = !self.negated;
        self
    }
}

/// Everything phase 1 needs to produce the candidate identifier list.
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub entity_type: String,
    pub viewer: UserId,
    pub state: LifecycleState,
    pub at_time: Option<DateTime<Utc>>,
    pub predicates: Vec<Predicate>,
}

impl Selection {
    pub fn new(entity_type: impl Into<String>, viewer: UserId) -> Self {
        Self {
            entity_type: entity_type.into(),
            viewer,
            state: LifecycleState::Active,
            at_time: None,
            predicates: Vec::new(),
        }
    }

    pub fn with(mut self, predicate: Predicate) -> Self {
        self.predicates.push(predicate);
        self
    }
}

/// Accumulates SQL text and its positional parameters.
struct SqlBuilder {
    clauses: Vec<String>,
    params: Vec<SqlValue>,
}

impl SqlBuilder {
    fn new() -> Self {
        Self {
            clauses: Vec::new(),
            params: Vec::new(),
        }
    }

    fn bind(&mut self, value: SqlValue) -> String {
        self.params.push(value);
        format!("?{}", self.params.len())
    }

    fn bind_list(&mut self, values: &[SqlValue]) -> String {
        values
            .iter()
            .map(|v| self.bind(v.clone()))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl Database {
    /// Run phase 1 and return matching local ids in ascending order.
    pub fn select_ids(&self, selection: &Selection) -> Result<Vec<LocalId>> {
        let (sql, params) = compile(selection)?;
        tracing::debug!(sql = %sql, params = params.len(), "phase-1 selection");

        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(params), |row| row.get::<_, i64>(0))?;

        let mut ids = Vec::new();
        for row in rows {
            ids.push(LocalId(row?));
        }
        Ok(ids)
    }
}

fn compile(selection: &Selection) -> Result<(String, Vec<SqlValue>)> {
    let mut b = SqlBuilder::new();

    let ty = b.bind(SqlValue::Text(selection.entity_type.clone()));
    b.clauses.push(format!("e.entity_type = {ty}"));

    let state = b.bind(SqlValue::Integer(selection.state.code() as i64));
    b.clauses.push(format!("v.state = {state}"));

    match selection.at_time {
        None => b.clauses.push("v.ends_at IS NULL".to_string()),
        Some(at) => {
            let t = b.bind(SqlValue::Text(timestamps::encode(at)));
            b.clauses.push(format!(
                "v.starts_at <= {t} AND (v.ends_at IS NULL OR v.ends_at > {t})"
            ));
        }
    }

    // Security: always judged against the current version.
    let viewer = b.bind(SqlValue::Integer(selection.viewer.0));
    b.clauses.push(readable("e", "cur", &viewer));

    for predicate in &selection.predicates {
        let clause = compile_predicate(&mut b, predicate, &viewer)?;
        let clause = if predicate.negated {
            // NULL comparisons count as "not matching", so negation keeps them.
            format!("NOT COALESCE(({clause}), 0)")
        } else {
            clause
        };
        b.clauses.push(clause);
    }

    let sql = format!(
        "SELECT v.local_id
         FROM versions v
         JOIN entities e ON e.local_id = v.local_id
         JOIN versions cur ON cur.local_id = v.local_id AND cur.ends_at IS NULL
         WHERE {}
         ORDER BY v.local_id ASC",
        b.clauses.join("\n           AND ")
    );
    Ok((sql, b.params))
}

/// Owned, public, friendly-and-friend, or explicitly shared. `entity` and
/// `current` alias an `entities` row and its current `versions` row.
fn readable(entity: &str, current: &str, viewer: &str) -> String {
    format!(
        "({entity}.owner_id = {viewer}
          OR {current}.visibility = {public}
          OR ({current}.visibility = {friendly} AND EXISTS (
                SELECT 1 FROM friendships f
                WHERE f.user_id = {entity}.owner_id AND f.friend_id = {viewer}))
          OR EXISTS (
                SELECT 1 FROM access_grants g
                WHERE g.local_id = {entity}.local_id AND g.user_id = {viewer}
                  AND g.level IN ({read}, {write})))",
        public = Visibility::Public.code(),
        friendly = Visibility::Friendly.code(),
        read = AccessLevel::Read.code(),
        write = AccessLevel::Write.code(),
    )
}

fn compile_predicate(b: &mut SqlBuilder, p: &Predicate, viewer: &str) -> Result<String> {
    let expr = match &p.operand {
        Operand::Relation(field) => return compile_relation(b, field, p),
        Operand::SharedRelation(field) => return compile_shared_relation(b, field, p, viewer),
        Operand::Attribute { name, key } => {
            let path = match key {
                None => format!("$.\"{}\"", escape_path(name)),
                Some(k) => format!("$.\"{}\".\"{}\"", escape_path(name), escape_path(k)),
            };
            let path = b.bind(SqlValue::Text(path));
            format!("json_extract(v.attributes, {path})")
        }
        Operand::Owner => "e.owner_id".to_string(),
        Operand::DateCreated => "e.created_at".to_string(),
        Operand::Visibility => "cur.visibility".to_string(),
    };

    let single = |b: &mut SqlBuilder| -> Result<String> {
        let value = p
            .values
            .first()
            .cloned()
            .ok_or_else(|| StoreError::Invalid(format!("{:?} needs a value", p.lookup)))?;
        Ok(b.bind(value))
    };

    let clause = match p.lookup {
        Lookup::Exact => match p.values.first() {
            Some(SqlValue::Null) | None => format!("{expr} IS NULL"),
            Some(_) => format!("{expr} = {}", single(b)?),
        },
        Lookup::Lt => format!("{expr} < {}", single(b)?),
        Lookup::Lte => format!("{expr} <= {}", single(b)?),
        Lookup::Gt => format!("{expr} > {}", single(b)?),
        Lookup::Gte => format!("{expr} >= {}", single(b)?),
        Lookup::In => {
            if p.values.is_empty() {
                "0".to_string()
            } else {
                format!("{expr} IN ({})", b.bind_list(&p.values))
            }
        }
        Lookup::IContains => {
            let needle = match p.values.first() {
                Some(SqlValue::Text(s)) => s.to_lowercase(),
                _ => return Err(StoreError::Invalid("icontains needs text".into())),
            };
            let pattern = b.bind(SqlValue::Text(format!("%{}%", escape_like(&needle))));
            format!("LOWER(CAST({expr} AS TEXT)) LIKE {pattern} ESCAPE '\\'")
        }
        Lookup::IsNull => {
            if is_true(p.values.first()) {
                format!("{expr} IS NULL")
            } else {
                format!("{expr} IS NOT NULL")
            }
        }
    };
    Ok(clause)
}

fn compile_relation(b: &mut SqlBuilder, field: &str, p: &Predicate) -> Result<String> {
    let field = b.bind(SqlValue::Text(field.to_string()));
    let base = format!(
        "SELECT 1 FROM version_relations r WHERE r.guid = v.guid AND r.field = {field}"
    );

    let clause = match p.lookup {
        Lookup::Exact => match p.values.first() {
            Some(SqlValue::Null) | None => format!("NOT EXISTS ({base})"),
            Some(value) => {
                let target = b.bind(value.clone());
                format!("EXISTS ({base} AND r.target_id = {target})")
            }
        },
        Lookup::In => {
            if p.values.is_empty() {
                "0".to_string()
            } else {
                let list = b.bind_list(&p.values);
                format!("EXISTS ({base} AND r.target_id IN ({list}))")
            }
        }
        Lookup::IsNull => {
            if is_true(p.values.first()) {
                format!("NOT EXISTS ({base})")
            } else {
                format!("EXISTS ({base})")
            }
        }
        other => {
            return Err(StoreError::Invalid(format!(
                "lookup {other:?} is not supported on relations"
            )))
        }
    };
    Ok(clause)
}

fn compile_shared_relation(
    b: &mut SqlBuilder,
    field: &str,
    p: &Predicate,
    viewer: &str,
) -> Result<String> {
    if p.lookup != Lookup::IsNull {
        return Err(StoreError::Invalid(format!(
            "lookup {:?} is not supported on shared relations",
            p.lookup
        )));
    }
    let field = b.bind(SqlValue::Text(field.to_string()));
    let active = b.bind(SqlValue::Integer(LifecycleState::Active.code() as i64));
    let exists = format!(
        "EXISTS (
            SELECT 1 FROM version_relations r
            JOIN entities te ON te.local_id = r.target_id
            JOIN versions tc ON tc.local_id = r.target_id AND tc.ends_at IS NULL
            WHERE r.guid = v.guid AND r.field = {field}
              AND tc.state = {active}
              AND te.owner_id <> {viewer}
              AND {})",
        readable("te", "tc", viewer)
    );
    Ok(if is_true(p.values.first()) {
        format!("NOT {exists}")
    } else {
        exists
    })
}

fn is_true(value: Option<&SqlValue>) -> bool {
    matches!(value, Some(SqlValue::Integer(n)) if *n != 0)
}

fn escape_path(name: &str) -> String {
    name.replace('"', "")
}

fn escape_like(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}
