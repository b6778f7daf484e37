//! Entity identity: the (entity type, identifier) pair.

use crate::value::Value;
use std::fmt;
use std::hash::{Hash, Hasher};

/// The (entity-type, identifier-value) pair naming one row.
///
/// This is the only thing guaranteed known about an uninitialized
/// reference. It is immutable once constructed.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityIdentity {
    entity: &'static str,
    id: Value,
}

impl EntityIdentity {
    /// Create an identity for `entity` with identifier `id`.
    pub fn new(entity: &'static str, id: impl Into<Value>) -> Self {
        Self {
            entity,
            id: id.into(),
        }
    }

    /// The entity type name (may be a declared, non-concrete type).
    pub fn entity(&self) -> &'static str {
        self.entity
    }

    /// The identifier value.
    pub fn id(&self) -> &Value {
        &self.id
    }

    /// Same identifier, different entity type name.
    ///
    /// Used when a stand-in of a declared supertype learns its concrete type.
    #[must_use]
    pub fn with_entity(&self, entity: &'static str) -> Self {
        Self {
            entity,
            id: self.id.clone(),
        }
    }
}

// Identifier values are never NaN, so equality is reflexive.
impl Eq for EntityIdentity {}

impl Hash for EntityIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.entity.hash(state);
        self.id.hash_into(state);
    }
}

impl fmt::Display for EntityIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.entity, self.id)
    }
}
