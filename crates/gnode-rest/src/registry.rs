//! Typed registry of entity types, resolved once at startup.

use std::collections::BTreeMap;

use crate::catalog;
use crate::error::{RestError, Result};
use crate::fields::{FieldDescriptor, FieldKind};

/// A reverse relation rendered as `<entity_type>_set`: every entity of
/// `entity_type` whose `field` points at the parent.
#[derive(Debug, Clone, Copy)]
pub struct ChildSet {
    pub entity_type: &'static str,
    pub field: &'static str,
}

impl ChildSet {
    pub fn key(&self) -> String {
        format!("{}_set", self.entity_type)
    }
}

#[derive(Debug)]
pub struct EntityType {
    pub name: &'static str,
    pub fields: &'static [FieldDescriptor],
    pub children: &'static [ChildSet],
    /// Reference fields never embedded in cascade mode.
    pub cascade_exclude: &'static [&'static str],
}

impl EntityType {
    pub fn field(&self, name: &str) -> Option<&'static FieldDescriptor> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn excludes_cascade(&self, field: &str) -> bool {
        self.cascade_exclude.iter().any(|f| *f == field)
    }
}

pub struct Registry {
    types: BTreeMap<&'static str, &'static EntityType>,
}

impl Registry {
    /// Registry holding every builtin entity type.
    pub fn builtin() -> Self {
        Self::from_types(catalog::ALL)
    }

    pub fn from_types(types: &[&'static EntityType]) -> Self {
        Self {
            types: types.iter().map(|t| (t.name, *t)).collect(),
        }
    }

    pub fn get(&self, name: &str) -> Result<&'static EntityType> {
        self.types
            .get(name)
            .copied()
            .ok_or_else(|| RestError::InvalidObjectType(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.types.keys().copied()
    }

    /// Check that every reference target and child set names a registered
    /// type and an existing reference field.
    pub fn validate(&self) -> std::result::Result<(), String> {
        for ty in self.types.values() {
            for field in ty.fields {
                if let FieldKind::Reference { target, .. } = field.kind {
                    if !self.types.contains_key(target) {
                        return Err(format!("{}.{} targets unknown type {target}", ty.name, field.name));
                    }
                }
            }
            for child in ty.children {
                let child_ty = self
                    .types
                    .get(child.entity_type)
                    .ok_or_else(|| format!("{} lists unknown child {}", ty.name, child.entity_type))?;
                match child_ty.field(child.field).map(|f| f.kind) {
                    Some(FieldKind::Reference { target, .. }) if target == ty.name => {}
                    _ => {
                        return Err(format!(
                            "{}.{} is not a reference to {}",
                            child.entity_type, child.field, ty.name
                        ))
                    }
                }
            }
            for excluded in ty.cascade_exclude {
                if !ty.field(excluded).map_or(false, FieldDescriptor::is_reference) {
                    return Err(format!("{} excludes unknown reference {excluded}", ty.name));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_registry_is_consistent() {
        let registry = Registry::builtin();
        registry.validate().unwrap();
        assert!(registry.names().any(|n| n == "section"));
    }

    #[test]
    fn unknown_type_is_classified() {
        let registry = Registry::builtin();
        assert!(matches!(
            registry.get("spaceship"),
            Err(RestError::InvalidObjectType(_))
        ));
    }
}
