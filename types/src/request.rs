//! Wire contract of the verify RPC.

use serde::{Deserialize, Serialize};

use crate::ids::EntityId;
use crate::schema::EntityKind;

/// A `(kind, id)` pair naming one entity on the in-flight verification
/// chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRef {
    pub kind: EntityKind,
    pub id: EntityId,
}

/// Request body accepted at `verify.<kind>` and `process.<kind>`.
///
/// `path` carries the chain of entities whose verification is already in
/// flight upstream of this request; a verifier that finds itself on the
/// path breaks the cycle instead of recursing. External callers send just
/// the id and leave `path` empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyRequest {
    pub id: EntityId,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub path: Vec<EntityRef>,
}

impl VerifyRequest {
    #[must_use]
    pub fn new(id: EntityId) -> Self {
        Self {
            id,
            path: Vec::new(),
        }
    }
}
