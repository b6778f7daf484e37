//! Attribute interception: the read and write protocols.
//!
//! # Reads
//!
//! 1. A MISSING instance faults with `EntityNotFound`, whatever was loaded.
//! 2. An attribute whose group is loaded is returned directly.
//! 3. Otherwise the group is loaded:
//!    - base only (or a collection group on an uninitialized instance):
//!      through batch fetching;
//!    - another group on an uninitialized instance: one statement for that
//!      group plus base;
//!    - another group on a loaded instance: through batch fetching of that
//!      group.
//! 4. Collections: reading the attribute only creates the wrapper; reading
//!    its contents is a separate load.
//!
//! # Writes
//!
//! The identifier may only be "set" to its current value. Any other attribute
//! has its group loaded first, except for blind updates: with dynamic update
//! on, a base attribute of a still uninitialized instance is recorded without
//! loading and re-applied over the loaded values later.

use crate::batch::Member;
use crate::context::ContextGuard;
use crate::instance::{
    AttributeValue, EntityRef, Instance, LazilyInterceptable, Proxy, read_lock, write_lock,
};
use crate::collection::PersistentCollection;
use crate::swap::{PreparedRow, swap_in};
use lazyorm_core::{
    AssociationKind, EntityIdentity, Error, IdentityMutationError, OverallState, Result, TypeError,
    Value,
};
use std::sync::Arc;

fn check_identifier(identity: &EntityIdentity, value: AttributeValue) -> Result<()> {
    match value {
        AttributeValue::Basic(v) if v == *identity.id() => {
            tracing::trace!(identity = %identity, "Identifier set to its current value");
            Ok(())
        }
        AttributeValue::Basic(v) => Err(Error::IdentityMutation(IdentityMutationError {
            identity: identity.clone(),
            attempted: v,
        })),
        other => Err(Error::IdentityMutation(IdentityMutationError {
            identity: identity.clone(),
            attempted: Value::Text(other.kind_name().to_string()),
        })),
    }
}

fn is_collection_group(instance: &Instance, group: usize) -> bool {
    instance.model().groups()[group]
        .attribute_indices()
        .iter()
        .any(|&i| instance.model().attributes()[i].kind == AssociationKind::ToMany)
}

// ============================================================================
// Enhanced instance
// ============================================================================

impl Instance {
    /// The value of attribute `index` if its group is loaded.
    fn loaded_value(&self, index: usize) -> Result<Option<AttributeValue>> {
        let data = read_lock(&self.data);
        if data.state.is_missing() {
            return Err(Error::not_found(self.identity()));
        }
        let group = self.model().group_of(index);
        if !data.state.is_group_initialized(group) {
            return Ok(None);
        }
        let value = data.values[index].clone().unwrap_or_else(|| {
            let attr = self.model().attributes()[index];
            match attr.kind {
                AssociationKind::Basic => AttributeValue::Basic(Value::Null),
                AssociationKind::OwnedToOne | AssociationKind::InverseToOne => {
                    AttributeValue::ToOne(None)
                }
                AssociationKind::ToMany => AttributeValue::ToMany(PersistentCollection::uninitialized(
                    self.identity(),
                    attr.name,
                    attr.target.unwrap_or(self.entity_type()),
                    self.context_weak(),
                )),
            }
        });
        Ok(Some(value))
    }

    /// Create the wrapper for a collection group once base is loaded. No
    /// query, and no open context needed.
    fn attach_collection(&self, index: usize) -> bool {
        let mut data = write_lock(&self.data);
        let group = self.model().group_of(index).index();
        if !data.state.is_base_initialized() || data.state.is_missing() {
            return false;
        }
        if !data.state.is_index_initialized(group) {
            let attr = self.model().attributes()[index];
            let collection = PersistentCollection::uninitialized(
                self.identity(),
                attr.name,
                attr.target.unwrap_or(self.entity_type()),
                self.context_weak(),
            );
            data.values[index] = Some(AttributeValue::ToMany(collection));
            data.state.mark_index_initialized(group);
            if data.state.overall() == OverallState::Initialized {
                data.intercepting = false;
            }
            tracing::trace!(
                identity = %self.identity(),
                attribute = attr.name,
                "Collection reference initialized"
            );
        }
        true
    }

    /// Load whatever is needed to read attribute `index`.
    fn initialize_attribute(&self, index: usize) -> Result<()> {
        let attr = self.model().attributes()[index];
        let group = self.model().group_of(index).index();
        if group != 0 && is_collection_group(self, group) && self.attach_collection(index) {
            return Ok(());
        }

        let context = self
            .context()
            .ok_or_else(|| Error::context_closed(self.identity(), Some(attr.name)))?;
        {
            let mut guard = context.enter(self.identity(), Some(attr.name))?;
            guard.initialize_instance_group(self, group)?;
        }
        if group != 0 && is_collection_group(self, group) {
            self.attach_collection(index);
        }
        Ok(())
    }
}

impl ContextGuard<'_> {
    /// Make group `group` of `instance` available (collection groups only
    /// get their owner's base).
    pub(crate) fn initialize_instance_group(&mut self, instance: &Instance, group: usize) -> Result<()> {
        let (base_loaded, group_loaded) = {
            let data = read_lock(&instance.data);
            if data.state.is_missing() {
                return Err(Error::not_found(instance.identity()));
            }
            (
                data.state.is_base_initialized(),
                data.state.is_index_initialized(group),
            )
        };
        if group_loaded {
            tracing::trace!(identity = %instance.identity(), "Group already loaded");
            return Ok(());
        }

        let collection = is_collection_group(instance, group);
        if !base_loaded {
            if group == 0 || collection {
                return self.batch_load_base(Member::Instance(instance));
            }
            return self.load_instance_groups(instance, &[0, group]);
        }
        if collection {
            return Ok(());
        }
        self.batch_load_group(instance, group)
    }

    /// Load several groups of one instance in a single statement.
    pub(crate) fn load_instance_groups(&mut self, instance: &Instance, groups: &[usize]) -> Result<()> {
        let model = Arc::clone(instance.model());
        let requested: Vec<usize> = groups
            .iter()
            .copied()
            .filter(|&g| !is_collection_group(instance, g))
            .collect();
        let group_refs: Vec<_> = requested.iter().map(|&g| &model.groups()[g]).collect();

        let Some(row) = self.exec_load_groups(instance.identity(), &group_refs)? else {
            tracing::debug!(identity = %instance.identity(), "No row found, marking missing");
            instance.mark_missing();
            return Err(Error::not_found(instance.identity()));
        };
        if row.identity.entity() != instance.entity_type() {
            return Err(Error::Type(TypeError {
                expected: instance.entity_type(),
                actual: row.identity.entity().to_string(),
                column: None,
                rust_type: None,
            }));
        }

        let values = self.hydrate_staged(std::slice::from_ref(instance.identity()), |guard, staging| {
            guard.hydrate_values(&model, &row, groups, staging)
        })?;
        swap_in(
            instance,
            PreparedRow {
                model,
                groups: groups.to_vec(),
                values,
            },
        );
        Ok(())
    }
}

impl LazilyInterceptable for Instance {
    fn identity(&self) -> &EntityIdentity {
        Instance::identity(self)
    }

    fn overall_state(&self) -> OverallState {
        Instance::overall_state(self)
    }

    fn read(&self, attribute: &str) -> Result<AttributeValue> {
        if attribute == self.model().identifier() {
            return Ok(AttributeValue::Basic(self.identity().id().clone()));
        }
        let index = self.attribute_index(attribute)?;
        if let Some(value) = self.loaded_value(index)? {
            return Ok(value);
        }

        self.initialize_attribute(index)?;
        self.loaded_value(index)?.ok_or_else(|| {
            Error::Custom(format!(
                "attribute '{attribute}' of {} is still not loaded",
                self.identity()
            ))
        })
    }

    fn write(&self, attribute: &str, value: AttributeValue) -> Result<()> {
        if attribute == self.model().identifier() {
            return check_identifier(self.identity(), value);
        }
        let index = self.attribute_index(attribute)?;
        self.check_value_kind(index, &value)?;
        let attr = self.model().attributes()[index];
        let group = self.model().group_of(index);

        {
            let mut data = write_lock(&self.data);
            if data.state.is_missing() {
                return Err(Error::not_found(self.identity()));
            }
            if data.state.is_group_initialized(group) {
                data.store(index, attr.name, value);
                return Ok(());
            }
            if self.model().dynamic_update()
                && group.is_base()
                && data.state.overall() == OverallState::Uninitialized
            {
                tracing::trace!(
                    identity = %self.identity(),
                    attribute = attr.name,
                    "Blind update recorded without initializing"
                );
                data.pending.retain(|(i, _)| *i != index);
                data.pending.push((index, value));
                data.mark_dirty(attr.name);
                return Ok(());
            }
        }

        self.initialize_attribute(index)?;
        let mut data = write_lock(&self.data);
        if data.state.is_missing() {
            return Err(Error::not_found(self.identity()));
        }
        data.store(index, attr.name, value);
        Ok(())
    }
}

// ============================================================================
// Proxy stand-in
// ============================================================================

impl Proxy {
    /// The implementation, loading the base group first if needed.
    pub(crate) fn initialize(&self, attribute: Option<&'static str>) -> Result<Arc<Instance>> {
        if self.is_missing() {
            return Err(Error::not_found(self.identity()));
        }
        if let Some(implementation) = self.implementation() {
            return Ok(implementation);
        }

        let context = self
            .context()
            .ok_or_else(|| Error::context_closed(self.identity(), attribute))?;
        {
            let mut guard = context.enter(self.identity(), attribute)?;
            if self.needs_load() {
                guard.batch_load_base(Member::Proxy(self))?;
            }
        }
        self.implementation()
            .ok_or_else(|| Error::not_found(self.identity()))
    }

    fn static_name(&self, attribute: &str) -> Option<&'static str> {
        self.declared_model().attribute(attribute).map(|a| a.name)
    }
}

impl LazilyInterceptable for Proxy {
    fn identity(&self) -> &EntityIdentity {
        Proxy::identity(self)
    }

    fn overall_state(&self) -> OverallState {
        Proxy::overall_state(self)
    }

    fn read(&self, attribute: &str) -> Result<AttributeValue> {
        if attribute == self.declared_model().identifier() {
            return Ok(AttributeValue::Basic(self.identity().id().clone()));
        }
        self.initialize(self.static_name(attribute))?.read(attribute)
    }

    fn write(&self, attribute: &str, value: AttributeValue) -> Result<()> {
        if attribute == self.declared_model().identifier() {
            return check_identifier(self.identity(), value);
        }
        self.initialize(self.static_name(attribute))?.write(attribute, value)
    }
}

// ============================================================================
// EntityRef
// ============================================================================

impl LazilyInterceptable for EntityRef {
    fn identity(&self) -> &EntityIdentity {
        match self {
            EntityRef::Instance(i) => i.identity(),
            EntityRef::Proxy(p) => p.identity(),
        }
    }

    fn overall_state(&self) -> OverallState {
        match self {
            EntityRef::Instance(i) => i.overall_state(),
            EntityRef::Proxy(p) => p.overall_state(),
        }
    }

    fn read(&self, attribute: &str) -> Result<AttributeValue> {
        match self {
            EntityRef::Instance(i) => i.read(attribute),
            EntityRef::Proxy(p) => p.read(attribute),
        }
    }

    fn write(&self, attribute: &str, value: AttributeValue) -> Result<()> {
        match self {
            EntityRef::Instance(i) => i.write(attribute, value),
            EntityRef::Proxy(p) => p.write(attribute, value),
        }
    }
}

/// Load all remaining groups of `reference`.
pub(crate) fn force_initialize(reference: &EntityRef) -> Result<()> {
    let instance = match reference {
        EntityRef::Instance(i) => Arc::clone(i),
        EntityRef::Proxy(p) => p.initialize(None)?,
    };
    if instance.is_missing() {
        return Err(Error::not_found(instance.identity()));
    }
    if instance.overall_state() == OverallState::Initialized {
        return Ok(());
    }

    let context = instance
        .context()
        .ok_or_else(|| Error::context_closed(instance.identity(), None))?;
    {
        let mut guard = context.enter(instance.identity(), None)?;
        if !instance.is_initialized() {
            guard.batch_load_base(Member::Instance(instance.as_ref()))?;
        }
        let pending: Vec<usize> = read_lock(&instance.data)
            .state
            .pending_groups()
            .filter(|&g| !is_collection_group(&instance, g))
            .collect();
        if !pending.is_empty() {
            guard.load_instance_groups(&instance, &pending)?;
        }
    }

    let collections: Vec<usize> = instance
        .model()
        .attributes()
        .iter()
        .enumerate()
        .filter(|(_, a)| a.kind == AssociationKind::ToMany)
        .map(|(i, _)| i)
        .collect();
    for index in collections {
        instance.attach_collection(index);
    }
    Ok(())
}
