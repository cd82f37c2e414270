//! Storage collaborator contract.
//!
//! The pipeline talks to persistence through a two-operation contract:
//! `find_by_id` and `create`. No schema is prescribed beyond "records have
//! single-column foreign keys with known referenced kinds"; everything else
//! (engine internals, migrations, indexing) belongs to the collaborator.
//!
//! Diagnostic records are ordinary records in a per-entity status kind
//! (`course` diagnostics live under `course_status`), created through the
//! same contract and referenced by id from verification results.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;

use serde_json::{Map, Value};

use gradebus_types::{DiagnosticId, EntityId, EntityKind, EntityRecord};

pub type StorageFut<'a, T> = Pin<Box<dyn Future<Output = Result<T, StorageError>> + Send + 'a>>;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage backend failed: {message}")]
    Backend { message: String },
}

/// Proof that a persistence backend is safe for dynamic dispatch.
pub trait Storage: Send + Sync {
    /// Fetch a record by kind and id. Absence is `Ok(None)`, not an error.
    fn find_by_id(&self, kind: &EntityKind, id: EntityId) -> StorageFut<'_, Option<EntityRecord>>;

    /// Persist a new record, returning its assigned id.
    fn create(&self, kind: &EntityKind, fields: Map<String, Value>) -> StorageFut<'_, EntityId>;
}

/// Persist a diagnostic for `entity_id` under its kind's status kind.
///
/// The record carries the owning entity's id in `<kind>_id` and the
/// diagnostic body under `data`, so callers can later join diagnostics back
/// to the entity they describe.
pub async fn create_diagnostic(
    storage: &dyn Storage,
    kind: &EntityKind,
    entity_id: EntityId,
    data: Value,
) -> Result<DiagnosticId, StorageError> {
    let mut fields = Map::new();
    fields.insert(format!("{kind}_id"), Value::from(entity_id.value()));
    fields.insert("data".to_string(), data);
    let id = storage.create(&kind.status_kind(), fields).await?;
    Ok(DiagnosticId::new(id.value()))
}

#[derive(Debug, Default)]
struct Tables {
    records: HashMap<EntityKind, BTreeMap<i64, Map<String, Value>>>,
    next_id: i64,
}

/// In-memory backend used by tests and the demo binary.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    tables: Mutex<Tables>,
}

impl MemoryStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a record with a caller-chosen id.
    pub fn seed(&self, kind: &EntityKind, id: EntityId, fields: Map<String, Value>) {
        let mut tables = self.tables.lock().expect("memory storage poisoned");
        tables
            .records
            .entry(kind.clone())
            .or_default()
            .insert(id.value(), fields);
        tables.next_id = tables.next_id.max(id.value());
    }

    /// Number of records of a kind; handy for asserting diagnostic counts.
    #[must_use]
    pub fn count(&self, kind: &EntityKind) -> usize {
        let tables = self.tables.lock().expect("memory storage poisoned");
        tables.records.get(kind).map_or(0, BTreeMap::len)
    }
}

impl Storage for MemoryStorage {
    fn find_by_id(&self, kind: &EntityKind, id: EntityId) -> StorageFut<'_, Option<EntityRecord>> {
        let record = {
            let tables = self.tables.lock().expect("memory storage poisoned");
            tables
                .records
                .get(kind)
                .and_then(|table| table.get(&id.value()))
                .map(|fields| EntityRecord {
                    id,
                    kind: kind.clone(),
                    fields: fields.clone(),
                })
        };
        Box::pin(async move { Ok(record) })
    }

    fn create(&self, kind: &EntityKind, fields: Map<String, Value>) -> StorageFut<'_, EntityId> {
        let id = {
            let mut tables = self.tables.lock().expect("memory storage poisoned");
            tables.next_id += 1;
            let id = tables.next_id;
            tables.records.entry(kind.clone()).or_default().insert(id, fields);
            id
        };
        Box::pin(async move { Ok(EntityId::new(id)) })
    }
}
