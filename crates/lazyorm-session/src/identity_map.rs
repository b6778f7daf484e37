//! Identity Map pattern for tracking unique entity references per identity.
//!
//! The Identity Map ensures that each database row corresponds to exactly one
//! managed reference within a session. This provides:
//!
//! - **Uniqueness**: Same identity always returns the same reference
//! - **Cache**: Avoids redundant queries for the same entity
//! - **Consistency**: Loading through one holder is visible to all holders
//!
//! # Design
//!
//! Entries are keyed by the *root* type of the inheritance hierarchy plus the
//! identifier, so a proxy registered as `Animal#1` and a later lookup for
//! `Human#1` resolve to the same reference. Every entry carries an insertion
//! sequence number, which gives batch fetching a stable candidate order.

use crate::instance::EntityRef;
use lazyorm_core::{EntityIdentity, Value};
use std::collections::HashMap;
use std::fmt;

/// Identity-map key: (root entity type, identifier).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityKey(EntityIdentity);

impl EntityKey {
    /// Key for `id` within the hierarchy rooted at `root`.
    pub fn new(root: &'static str, id: Value) -> Self {
        Self(EntityIdentity::new(root, id))
    }

    /// Root entity type.
    pub fn root(&self) -> &'static str {
        self.0.entity()
    }

    /// Identifier value.
    pub fn id(&self) -> &Value {
        self.0.id()
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

struct IdentityEntry {
    reference: EntityRef,
    seq: u64,
}

/// Identity Map for tracking unique managed references.
#[derive(Default)]
pub struct IdentityMap {
    entries: HashMap<EntityKey, IdentityEntry>,
    next_seq: u64,
}

impl IdentityMap {
    /// Create a new empty identity map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a reference.
    ///
    /// If a reference with the same key already exists, returns the existing
    /// reference (the new one is ignored). Otherwise inserts and returns it.
    pub fn insert(&mut self, key: EntityKey, reference: EntityRef) -> EntityRef {
        if let Some(existing) = self.entries.get(&key) {
            return existing.reference.clone();
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert(
            key,
            IdentityEntry {
                reference: reference.clone(),
                seq,
            },
        );
        reference
    }

    /// Get the managed reference for a key.
    pub fn get(&self, key: &EntityKey) -> Option<&EntityRef> {
        self.entries.get(key).map(|e| &e.reference)
    }

    /// Check if a key is registered.
    pub fn contains(&self, key: &EntityKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Check if this exact reference is the managed one for its key.
    pub fn contains_ref(&self, key: &EntityKey, reference: &EntityRef) -> bool {
        self.get(key).is_some_and(|r| r.ptr_eq(reference))
    }

    /// Remove a reference from the identity map.
    pub fn remove(&mut self, key: &EntityKey) -> Option<EntityRef> {
        self.entries.remove(key).map(|e| e.reference)
    }

    /// Clear all entries, returning the evicted references.
    pub fn drain(&mut self) -> Vec<EntityRef> {
        self.entries.drain().map(|(_, e)| e.reference).collect()
    }

    /// Get the number of entries in the map.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the map is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// References within one hierarchy, in registration order.
    pub fn in_hierarchy(&self, root: &str) -> Vec<&EntityRef> {
        let mut entries: Vec<&IdentityEntry> = self
            .entries
            .iter()
            .filter(|(key, _)| key.root() == root)
            .map(|(_, entry)| entry)
            .collect();
        entries.sort_by_key(|e| e.seq);
        entries.into_iter().map(|e| &e.reference).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::Instance;
    use lazyorm_core::{AttributeInfo, EntityModel, MetadataRegistry};
    use std::sync::{Arc, Weak};

    fn registry() -> Arc<MetadataRegistry> {
        MetadataRegistry::builder()
            .entity(EntityModel::builder("Human").attribute(AttributeInfo::basic("sex")))
            .entity(EntityModel::builder("Dog").attribute(AttributeInfo::basic("breed")))
            .build()
            .unwrap()
    }

    fn placeholder(registry: &MetadataRegistry, entity: &str, id: i64) -> EntityRef {
        let model = Arc::clone(registry.model(entity).unwrap());
        EntityRef::Instance(Instance::placeholder(model, Value::from(id), Weak::new()))
    }

    #[test]
    fn test_insert_keeps_first_reference() {
        let registry = registry();
        let mut map = IdentityMap::new();
        let first = placeholder(&registry, "Human", 1);
        let second = placeholder(&registry, "Human", 1);

        let key = EntityKey::new("Human", Value::from(1_i64));
        let stored = map.insert(key.clone(), first.clone());
        assert!(stored.ptr_eq(&first));

        let stored = map.insert(key.clone(), second.clone());
        assert!(stored.ptr_eq(&first));
        assert!(map.contains_ref(&key, &first));
        assert!(!map.contains_ref(&key, &second));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_hierarchy_scan_is_ordered() {
        let registry = registry();
        let mut map = IdentityMap::new();
        for id in [3_i64, 1, 2] {
            map.insert(
                EntityKey::new("Human", Value::from(id)),
                placeholder(&registry, "Human", id),
            );
        }
        map.insert(
            EntityKey::new("Dog", Value::from(9_i64)),
            placeholder(&registry, "Dog", 9),
        );

        let ids: Vec<Value> = map
            .in_hierarchy("Human")
            .iter()
            .map(|r| r.as_instance().unwrap().identity().id().clone())
            .collect();
        assert_eq!(ids, vec![Value::from(3_i64), Value::from(1_i64), Value::from(2_i64)]);
    }

    #[test]
    fn test_remove_and_drain() {
        let registry = registry();
        let mut map = IdentityMap::new();
        let key = EntityKey::new("Human", Value::from(1_i64));
        map.insert(key.clone(), placeholder(&registry, "Human", 1));
        map.insert(
            EntityKey::new("Dog", Value::from(1_i64)),
            placeholder(&registry, "Dog", 1),
        );

        assert!(map.remove(&key).is_some());
        assert!(map.remove(&key).is_none());
        assert_eq!(map.drain().len(), 1);
        assert!(map.is_empty());
    }
}
