//! Entity kinds, records, and the foreign-key schema registry.
//!
//! The dependency graph between entities is declared here: each kind lists
//! its single-column foreign keys and the kind they reference. Composite
//! keys are rejected at registration time rather than silently mis-verified
//! later.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::ids::EntityId;

/// Table/kind discriminator for persisted entities.
///
/// Lowercase, non-empty; doubles as the suffix of bus addresses.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntityKind(String);

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("entity kind must be non-empty lowercase: {value:?}")]
    BadKind { value: String },
    #[error("composite foreign keys are unsupported: {kind}.{columns:?}")]
    CompositeKey { kind: EntityKind, columns: Vec<String> },
    #[error("duplicate schema registration for kind {kind}")]
    DuplicateKind { kind: EntityKind },
}

impl EntityKind {
    pub fn new(value: impl Into<String>) -> Result<Self, SchemaError> {
        let value = value.into();
        let ok = !value.is_empty()
            && value
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
        if ok {
            Ok(Self(value))
        } else {
            Err(SchemaError::BadKind { value })
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Kind of the status records holding diagnostics for this kind's
    /// entities (e.g. `course` diagnostics live under `course_status`).
    #[must_use]
    pub fn status_kind(&self) -> EntityKind {
        Self(format!("{}_status", self.0))
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for EntityKind {
    type Error = SchemaError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<EntityKind> for String {
    fn from(kind: EntityKind) -> Self {
        kind.0
    }
}

/// A single-column foreign key: `column` in the owning record holds the id
/// of an entity of kind `references`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKey {
    pub column: String,
    pub references: EntityKind,
}

/// A persisted entity record, as returned by the storage collaborator.
///
/// Fields are an opaque JSON document; foreign-key columns are looked up in
/// it by name when walking the dependency graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub id: EntityId,
    pub kind: EntityKind,
    pub fields: Map<String, Value>,
}

impl EntityRecord {
    /// The referenced entity id held in a foreign-key column, if the column
    /// is present and non-null.
    #[must_use]
    pub fn foreign_id(&self, column: &str) -> Option<EntityId> {
        match self.fields.get(column) {
            Some(Value::Number(n)) => n.as_i64().map(EntityId::new),
            _ => None,
        }
    }
}

/// Registry of per-kind foreign keys.
///
/// Built once at setup; schema misconfiguration (composite keys, duplicate
/// kinds) is fatal here instead of producing wrong verification results
/// later.
#[derive(Debug, Default, Clone)]
pub struct Schema {
    foreign_keys: HashMap<EntityKind, Vec<ForeignKey>>,
}

impl Schema {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a kind and its foreign keys. Each key must span exactly one
    /// column.
    pub fn register(
        &mut self,
        kind: EntityKind,
        keys: Vec<(Vec<String>, EntityKind)>,
    ) -> Result<(), SchemaError> {
        if self.foreign_keys.contains_key(&kind) {
            return Err(SchemaError::DuplicateKind { kind });
        }
        let mut fks = Vec::with_capacity(keys.len());
        for (columns, references) in keys {
            match <[String; 1]>::try_from(columns) {
                Ok([column]) => fks.push(ForeignKey { column, references }),
                Err(columns) => {
                    return Err(SchemaError::CompositeKey { kind, columns });
                }
            }
        }
        self.foreign_keys.insert(kind, fks);
        Ok(())
    }

    /// Foreign keys of a kind. Unregistered kinds have none.
    #[must_use]
    pub fn foreign_keys(&self, kind: &EntityKind) -> &[ForeignKey] {
        self.foreign_keys.get(kind).map_or(&[], Vec::as_slice)
    }
}
