//! Populating placeholders with loaded data.
//!
//! Loading never hands the caller a new object for an identity that already
//! has a managed reference. Instead:
//!
//! - an enhanced instance has its attribute storage filled in place, and its
//!   interceptor detaches once every group is loaded;
//! - a proxy receives its implementation instance, built for the concrete
//!   type reported by the row.
//!
//! Row data is turned into attribute values first ([`ContextGuard::hydrate_values`]).
//! Everything a conversion would change in the context (placeholders it
//! registers, joined rows it swaps in) is collected in a [`Staging`] and only
//! applied once every row of the load has been converted, so a failure
//! leaves the identity map and all instances as they were.

use crate::collection::PersistentCollection;
use crate::context::ContextGuard;
use crate::identity_map::EntityKey;
use crate::instance::{AttributeValue, EntityRef, Instance, Proxy, write_lock};
use lazyorm_core::{
    AssociationKind, EntityIdentity, EntityModel, EntityRow, Error, NotFoundPolicy, OverallState,
    QueryError, Result, Value,
};
use std::sync::Arc;

/// Attribute values ready to be swapped into one instance.
pub(crate) struct PreparedRow {
    pub(crate) model: Arc<EntityModel>,
    pub(crate) groups: Vec<usize>,
    pub(crate) values: Vec<(usize, AttributeValue)>,
}

/// Context changes made by one load, held back until it succeeds.
#[derive(Default)]
pub(crate) struct Staging {
    /// Identities whose rows this load already hydrates.
    claimed: Vec<EntityKey>,
    /// Placeholders registered while hydrating.
    registered: Vec<EntityKey>,
    swaps: Vec<(EntityRef, PreparedRow)>,
}

impl Staging {
    fn claim(&mut self, key: EntityKey) -> bool {
        if self.claimed.contains(&key) {
            false
        } else {
            self.claimed.push(key);
            true
        }
    }
}

impl ContextGuard<'_> {
    /// Run `convert` for a load on behalf of `members`, then apply its staged
    /// changes if it succeeds or unregister its placeholders if it fails.
    pub(crate) fn hydrate_staged<T>(
        &mut self,
        members: &[EntityIdentity],
        convert: impl FnOnce(&mut Self, &mut Staging) -> Result<T>,
    ) -> Result<T> {
        let mut staging = Staging::default();
        for identity in members {
            let key = self.key_for(identity.entity(), identity.id())?;
            staging.claim(key);
        }

        match convert(self, &mut staging) {
            Ok(converted) => {
                for (reference, prepared) in staging.swaps {
                    match &reference {
                        EntityRef::Instance(instance) => swap_in(instance, prepared),
                        EntityRef::Proxy(proxy) => install_implementation(self, proxy, prepared),
                    }
                }
                Ok(converted)
            }
            Err(e) => {
                if !staging.registered.is_empty() {
                    tracing::debug!(
                        discarded = staging.registered.len(),
                        error = %e,
                        "Load failed, discarding staged placeholders"
                    );
                }
                for key in &staging.registered {
                    self.state.identity_map.remove(key);
                }
                Err(e)
            }
        }
    }

    /// Convert the columns of `groups` in `row` into attribute values of
    /// `model` (the row's concrete type).
    ///
    /// Owned to-one columns resolve to managed references or new
    /// placeholders; joined rows are hydrated through the identity map.
    pub(crate) fn hydrate_values(
        &mut self,
        model: &Arc<EntityModel>,
        row: &EntityRow,
        groups: &[usize],
        staging: &mut Staging,
    ) -> Result<Vec<(usize, AttributeValue)>> {
        let mut values = Vec::new();
        for &group in groups {
            for &index in model.groups()[group].attribute_indices() {
                let attr = model.attributes()[index];
                let value = match attr.kind {
                    AssociationKind::Basic => {
                        let column = row.row.get_by_name(attr.name).ok_or_else(|| {
                            missing_column(model.name(), attr.name)
                        })?;
                        AttributeValue::Basic(column.clone())
                    }
                    AssociationKind::OwnedToOne => {
                        let target = attr.target.unwrap_or(model.name());
                        if let Some(joined) = row.joined.get(attr.name) {
                            self.hydrate_joined(joined.as_ref(), target, staging)?
                        } else {
                            let fk = row.row.get_by_name(attr.name).ok_or_else(|| {
                                missing_column(model.name(), attr.name)
                            })?;
                            if fk.is_null() {
                                AttributeValue::ToOne(None)
                            } else if attr.not_found == NotFoundPolicy::Ignore {
                                self.resolve_ignored(target, fk, staging)?
                            } else {
                                AttributeValue::ToOne(Some(self.stage_reference(target, fk, staging)?))
                            }
                        }
                    }
                    AssociationKind::InverseToOne => {
                        let target = attr.target.unwrap_or(model.name());
                        let joined = row.joined.get(attr.name).ok_or_else(|| {
                            Error::Query(QueryError::protocol(format!(
                                "inverse association '{}.{}' must be supplied as a joined row",
                                model.name(),
                                attr.name
                            )))
                        })?;
                        self.hydrate_joined(joined.as_ref(), target, staging)?
                    }
                    AssociationKind::ToMany => {
                        AttributeValue::ToMany(PersistentCollection::uninitialized(
                            &row.identity,
                            attr.name,
                            attr.target.unwrap_or(model.name()),
                            Arc::downgrade(self.inner),
                        ))
                    }
                };
                values.push((index, value));
            }
        }
        Ok(values)
    }

    fn hydrate_joined(
        &mut self,
        joined: Option<&EntityRow>,
        target: &'static str,
        staging: &mut Staging,
    ) -> Result<AttributeValue> {
        match joined {
            Some(row) => Ok(AttributeValue::ToOne(Some(self.hydrate_entity(row, target, staging)?))),
            None => Ok(AttributeValue::ToOne(None)),
        }
    }

    fn stage_reference(
        &mut self,
        target: &'static str,
        id: &Value,
        staging: &mut Staging,
    ) -> Result<EntityRef> {
        if let Some(existing) = self.managed(target, id)? {
            self.check_compatible(&existing, target)?;
            return Ok(existing);
        }
        let key = self.key_for(target, id)?;
        let reference = self.reference(target, id.clone())?;
        staging.registered.push(key);
        Ok(reference)
    }

    /// Resolve an ignore-policy to-one whose row was not joined in.
    ///
    /// A managed reference is reused; otherwise the target's base group is
    /// loaded right away and a missing row becomes null. No placeholder is
    /// built, since it could not tell a missing target apart later.
    fn resolve_ignored(
        &mut self,
        target: &'static str,
        fk: &Value,
        staging: &mut Staging,
    ) -> Result<AttributeValue> {
        if let Some(existing) = self.managed(target, fk)? {
            if existing.is_missing() {
                return Ok(AttributeValue::ToOne(None));
            }
            self.check_compatible(&existing, target)?;
            return Ok(AttributeValue::ToOne(Some(existing)));
        }

        let model = Arc::clone(self.registry().model(target)?);
        let identity = EntityIdentity::new(model.name(), fk.clone());
        match self.exec_load_groups(&identity, &[model.base_group()])? {
            Some(row) => Ok(AttributeValue::ToOne(Some(self.hydrate_entity(&row, target, staging)?))),
            None => {
                tracing::trace!(identity = %identity, "Ignored missing association target");
                Ok(AttributeValue::ToOne(None))
            }
        }
    }

    /// Resolve a full base-group row to its managed reference.
    ///
    /// An existing uninitialized placeholder receives the data; an existing
    /// loaded reference wins over the row (identity stability); otherwise a
    /// new instance of the concrete type is registered. The swap itself is
    /// staged.
    pub(crate) fn hydrate_entity(
        &mut self,
        row: &EntityRow,
        declared: &'static str,
        staging: &mut Staging,
    ) -> Result<EntityRef> {
        self.check_concrete(row, declared)?;
        let model = Arc::clone(self.registry().model(row.identity.entity())?);
        let key = EntityKey::new(model.root(), row.identity.id().clone());

        let reference = match self.state.identity_map.get(&key).cloned() {
            Some(existing) => {
                self.check_compatible(&existing, model.name())?;
                existing
            }
            None => {
                let instance =
                    Instance::placeholder(Arc::clone(&model), row.identity.id().clone(), Arc::downgrade(self.inner));
                let reference = EntityRef::Instance(instance);
                self.state.identity_map.insert(key.clone(), reference.clone());
                staging.registered.push(key.clone());
                reference
            }
        };

        if !reference.needs_base() {
            tracing::trace!(identity = %row.identity, "Row already managed, keeping loaded state");
            return Ok(reference);
        }
        if !staging.claim(key) {
            return Ok(reference);
        }
        if let EntityRef::Instance(instance) = &reference {
            if instance.entity_type() != model.name() {
                return Err(Error::Type(lazyorm_core::TypeError {
                    expected: instance.entity_type(),
                    actual: model.name().to_string(),
                    column: None,
                    rust_type: None,
                }));
            }
        }
        let values = self.hydrate_values(&model, row, &[0], staging)?;
        staging.swaps.push((
            reference.clone(),
            PreparedRow {
                model,
                groups: vec![0],
                values,
            },
        ));
        Ok(reference)
    }
}

fn missing_column(entity: &str, attribute: &str) -> Error {
    Error::Query(QueryError::protocol(format!(
        "loaded row for '{entity}' has no column '{attribute}'"
    )))
}

/// Fill an instance's storage in place and mark the loaded groups.
///
/// Blind writes recorded before the load stay on top of the loaded values.
pub(crate) fn swap_in(instance: &Instance, prepared: PreparedRow) {
    let mut data = write_lock(&instance.data);
    if data.state.is_missing() {
        return;
    }

    let pending = std::mem::take(&mut data.pending);
    for (index, value) in prepared.values {
        data.values[index] = Some(value);
    }
    for group in &prepared.groups {
        data.state.mark_index_initialized(*group);
    }
    for (index, value) in pending {
        let group = instance.model().group_of(index).index();
        if data.state.is_index_initialized(group) {
            data.values[index] = Some(value);
        } else {
            data.pending.push((index, value));
        }
    }

    if data.state.overall() == OverallState::Initialized && data.intercepting {
        data.intercepting = false;
        tracing::trace!(identity = %instance.identity(), "Interceptor detached");
    }
}

/// Give a proxy its implementation, built from a base-group row.
pub(crate) fn install_implementation(guard: &ContextGuard<'_>, proxy: &Proxy, prepared: PreparedRow) {
    let implementation = Instance::placeholder(
        Arc::clone(&prepared.model),
        proxy.identity().id().clone(),
        Arc::downgrade(guard.inner),
    );
    swap_in(&implementation, prepared);

    let mut target = write_lock(&proxy.target);
    if target.implementation.is_none() && !target.missing {
        tracing::debug!(
            declared = proxy.identity().entity(),
            concrete = implementation.entity_type(),
            id = %proxy.identity().id(),
            "Proxy initialized"
        );
        target.implementation = Some(implementation);
    }
}
