//! Merging detached state into the persistence context.
//!
//! The managed counterpart `M` of a detached reference `D` is looked up (or
//! registered as a placeholder) through the identity map, then:
//!
//! 1. an uninitialized `D` leaves `M` untouched and triggers no load;
//! 2. otherwise `M` gets its base group loaded (through batch fetching) if
//!    it has none yet;
//! 3. every group `D` has loaded is copied onto `M`, `D` winning per
//!    attribute, and marked initialized on `M`;
//! 4. groups only `M` has are left alone.
//!
//! The caller always gets `M` back. Associations are resolved through the
//! identity map, never by deep copy; targets flagged `cascade_merge` are
//! merged recursively with a per-call visited map so cycles terminate.

use crate::batch::Member;
use crate::collection::PersistentCollection;
use crate::context::ContextGuard;
use crate::identity_map::EntityKey;
use crate::instance::{AttributeValue, EntityRef, Instance, LazilyInterceptable, read_lock, write_lock};
use lazyorm_core::{AssociationKind, AttributeInfo, Error, OverallState, Result, TypeError, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// Groups loaded on the detached side, with their attribute values.
struct DetachedSnapshot {
    groups: Vec<usize>,
    values: Vec<(usize, Option<AttributeValue>)>,
}

fn take_snapshot(source: &Instance) -> Option<DetachedSnapshot> {
    let data = read_lock(&source.data);
    if !data.state.is_base_initialized() {
        return None;
    }
    let groups: Vec<usize> = data.state.loaded_groups().collect();
    let values = groups
        .iter()
        .flat_map(|&g| source.model().groups()[g].attribute_indices().iter().copied())
        .map(|index| (index, data.values[index].clone()))
        .collect();
    Some(DetachedSnapshot { groups, values })
}

impl ContextGuard<'_> {
    /// Reconcile `detached` with its managed counterpart and return the
    /// managed reference.
    pub(crate) fn merge_entity(
        &mut self,
        detached: &EntityRef,
        visited: &mut HashMap<EntityKey, EntityRef>,
    ) -> Result<EntityRef> {
        let identity = detached.identity().clone();
        let key = self.key_for(identity.entity(), identity.id())?;
        if let Some(merged) = visited.get(&key) {
            return Ok(merged.clone());
        }
        if detached.is_missing() {
            return Err(Error::not_found(&identity));
        }

        let managed = self.reference(detached.concrete_type(), identity.id().clone())?;
        visited.insert(key, managed.clone());
        if managed.ptr_eq(detached) {
            tracing::trace!(identity = %identity, "Merging a managed reference onto itself");
            return Ok(managed);
        }

        let Some(source) = detached.data_holder() else {
            tracing::trace!(identity = %identity, "Detached stand-in never loaded, nothing to merge");
            return Ok(managed);
        };
        if managed
            .data_holder()
            .is_some_and(|holder| Arc::ptr_eq(&holder, &source))
        {
            return Ok(managed);
        }
        let Some(snapshot) = take_snapshot(&source) else {
            tracing::trace!(identity = %identity, "Detached instance uninitialized, managed state kept");
            return Ok(managed);
        };

        if managed.needs_base() {
            self.batch_load_base(Member::of(&managed))?;
        }
        if managed.is_missing() {
            return Err(Error::not_found(&identity));
        }
        let target = managed
            .data_holder()
            .ok_or_else(|| Error::not_found(&identity))?;
        if target.entity_type() != source.entity_type() {
            return Err(Error::Type(TypeError {
                expected: target.entity_type(),
                actual: source.entity_type().to_string(),
                column: None,
                rust_type: None,
            }));
        }

        let mut resolved = Vec::with_capacity(snapshot.values.len());
        for (index, value) in snapshot.values {
            let attr = source.model().attributes()[index];
            let value = self.merge_value(&target, attr, value, visited)?;
            resolved.push((index, value));
        }

        let mut data = write_lock(&target.data);
        if data.state.is_missing() {
            return Err(Error::not_found(&identity));
        }
        let mut changed = 0_usize;
        for (index, value) in resolved {
            let attr = target.model().attributes()[index];
            let unchanged = data.values[index]
                .as_ref()
                .is_some_and(|current| current.same_as(&value));
            data.pending.retain(|(i, _)| *i != index);
            data.values[index] = Some(value);
            if !unchanged {
                data.mark_dirty(attr.name);
                changed += 1;
            }
        }
        for group in snapshot.groups {
            data.state.mark_index_initialized(group);
        }
        if data.state.overall() == OverallState::Initialized {
            data.intercepting = false;
        }
        tracing::debug!(identity = %target.identity(), changed, "Merged detached state");
        drop(data);

        Ok(managed)
    }

    /// Translate one detached attribute value into the managed world.
    fn merge_value(
        &mut self,
        target: &Instance,
        attr: AttributeInfo,
        value: Option<AttributeValue>,
        visited: &mut HashMap<EntityKey, EntityRef>,
    ) -> Result<AttributeValue> {
        let value = match value {
            Some(value) => value,
            None if attr.kind == AssociationKind::Basic => AttributeValue::Basic(Value::Null),
            None if attr.kind == AssociationKind::ToMany => return Ok(self.managed_collection(target, attr)),
            None => AttributeValue::ToOne(None),
        };

        match value {
            AttributeValue::Basic(v) => Ok(AttributeValue::Basic(v)),
            AttributeValue::ToOne(None) => Ok(AttributeValue::ToOne(None)),
            AttributeValue::ToOne(Some(reference)) => Ok(AttributeValue::ToOne(Some(
                self.merge_association(&reference, attr.cascade_merge, visited)?,
            ))),
            AttributeValue::ToMany(collection) => match collection.loaded_elements() {
                Some(elements) => {
                    let mut merged = Vec::with_capacity(elements.len());
                    for element in &elements {
                        merged.push(self.merge_association(element, attr.cascade_merge, visited)?);
                    }
                    Ok(AttributeValue::ToMany(PersistentCollection::initialized(
                        target.identity(),
                        attr.name,
                        collection.element_type(),
                        Arc::downgrade(self.inner),
                        merged,
                    )))
                }
                None => Ok(self.managed_collection(target, attr)),
            },
        }
    }

    /// The managed reference an association should point at after merge.
    ///
    /// A stand-in that is already initialized is replaced by its
    /// implementation, so the merged association may change shape.
    fn merge_association(
        &mut self,
        reference: &EntityRef,
        cascade: bool,
        visited: &mut HashMap<EntityKey, EntityRef>,
    ) -> Result<EntityRef> {
        let managed = if cascade {
            self.merge_entity(reference, visited)?
        } else {
            let identity = reference.identity();
            let key = self.key_for(identity.entity(), identity.id())?;
            match visited.get(&key) {
                Some(merged) => merged.clone(),
                None => self.reference(reference.concrete_type(), identity.id().clone())?,
            }
        };
        if let EntityRef::Proxy(proxy) = &managed {
            if let Some(implementation) = proxy.implementation() {
                return Ok(EntityRef::Instance(implementation));
            }
        }
        Ok(managed)
    }

    /// Keep the managed collection wrapper, or create a lazy one.
    fn managed_collection(&self, target: &Instance, attr: AttributeInfo) -> AttributeValue {
        let data = read_lock(&target.data);
        let existing = target
            .model()
            .attribute_index(attr.name)
            .and_then(|index| data.values[index].clone());
        match existing {
            Some(value @ AttributeValue::ToMany(_)) => value,
            _ => AttributeValue::ToMany(PersistentCollection::uninitialized(
                target.identity(),
                attr.name,
                attr.target.unwrap_or(target.entity_type()),
                Arc::downgrade(self.inner),
            )),
        }
    }
}
