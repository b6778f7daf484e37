//! Batch fetching of sibling placeholders.
//!
//! When one reference must load a group, other managed references of the same
//! hierarchy that need the same group are folded into the same statement, up
//! to the entity's batch size. With N pending siblings this turns N loads into
//! `ceil(N / batch_size)` statements.
//!
//! Rows are matched to members by identity, never by position. A member with
//! no row becomes MISSING on its own; only the member that triggered the load
//! reports `EntityNotFound`. Rows are all converted before any member is
//! touched, so a conversion failure leaves the whole batch pending.

use crate::context::ContextGuard;
use crate::instance::{EntityRef, Instance, Proxy};
use crate::swap::{PreparedRow, install_implementation, swap_in};
use lazyorm_core::{EntityIdentity, EntityModel, Error, Result, TypeError};
use std::sync::Arc;

/// One participant of a batch, borrowed for the duration of the load.
#[derive(Clone, Copy)]
pub(crate) enum Member<'a> {
    Instance(&'a Instance),
    Proxy(&'a Proxy),
}

impl<'a> Member<'a> {
    pub(crate) fn of(reference: &'a EntityRef) -> Self {
        match reference {
            EntityRef::Instance(i) => Member::Instance(i),
            EntityRef::Proxy(p) => Member::Proxy(p),
        }
    }

    fn identity(&self) -> &'a EntityIdentity {
        match *self {
            Member::Instance(i) => i.identity(),
            Member::Proxy(p) => p.identity(),
        }
    }

    fn model(&self) -> &'a Arc<EntityModel> {
        match *self {
            Member::Instance(i) => i.model(),
            Member::Proxy(p) => p.declared_model(),
        }
    }

    fn is_same(&self, reference: &EntityRef) -> bool {
        match (*self, reference) {
            (Member::Instance(a), EntityRef::Instance(b)) => std::ptr::eq(a, Arc::as_ptr(b)),
            (Member::Proxy(a), EntityRef::Proxy(b)) => std::ptr::eq(a, Arc::as_ptr(b)),
            _ => false,
        }
    }

    fn mark_missing(&self) {
        match self {
            Member::Instance(i) => i.mark_missing(),
            Member::Proxy(p) => p.mark_missing(),
        }
    }

    fn is_missing(&self) -> bool {
        match self {
            Member::Instance(i) => i.is_missing(),
            Member::Proxy(p) => p.is_missing(),
        }
    }
}

impl ContextGuard<'_> {
    /// Load the base group of `requester`, together with other uninitialized
    /// references of the same hierarchy.
    pub(crate) fn batch_load_base(&mut self, requester: Member<'_>) -> Result<()> {
        let model = Arc::clone(requester.model());
        let batch_size = self.batch_size_for(model.name())?;

        let candidates: Vec<EntityRef> = self
            .state
            .identity_map
            .in_hierarchy(model.root())
            .into_iter()
            .filter(|r| !requester.is_same(r) && r.needs_base())
            .take(batch_size - 1)
            .cloned()
            .collect();

        let mut members = Vec::with_capacity(candidates.len() + 1);
        members.push(requester);
        members.extend(candidates.iter().map(Member::of));

        let identities: Vec<EntityIdentity> =
            members.iter().map(|m| m.identity().clone()).collect();
        let mut rows = self.exec_load_batch(model.root(), &identities, model.base_group())?;

        let prepared = self.hydrate_staged(&identities, |guard, staging| {
            let mut prepared = Vec::with_capacity(members.len());
            for member in &members {
                let Some(row) = rows.remove(member.identity()) else {
                    prepared.push(None);
                    continue;
                };
                let concrete = match member {
                    Member::Instance(instance) => {
                        if row.identity.entity() != instance.entity_type() {
                            return Err(Error::Type(TypeError {
                                expected: instance.entity_type(),
                                actual: row.identity.entity().to_string(),
                                column: None,
                                rust_type: None,
                            }));
                        }
                        Arc::clone(instance.model())
                    }
                    Member::Proxy(proxy) => {
                        guard.check_concrete(&row, proxy.identity().entity())?;
                        Arc::clone(guard.registry().model(row.identity.entity())?)
                    }
                };
                let values = guard.hydrate_values(&concrete, &row, &[0], staging)?;
                prepared.push(Some(PreparedRow {
                    model: concrete,
                    groups: vec![0],
                    values,
                }));
            }
            Ok(prepared)
        })?;

        for (member, prepared) in members.iter().zip(prepared) {
            match (member, prepared) {
                (Member::Instance(instance), Some(prepared)) => swap_in(instance, prepared),
                (Member::Proxy(proxy), Some(prepared)) => install_implementation(self, proxy, prepared),
                (member, None) => {
                    tracing::debug!(identity = %member.identity(), "No row found, marking missing");
                    member.mark_missing();
                }
            }
        }

        if requester.is_missing() {
            Err(Error::not_found(requester.identity()))
        } else {
            Ok(())
        }
    }

    /// Load non-base group `group` of `requester` (whose base is loaded),
    /// together with other loaded instances of the same concrete type that
    /// still lack it.
    pub(crate) fn batch_load_group(&mut self, requester: &Instance, group: usize) -> Result<()> {
        let model = Arc::clone(requester.model());
        let batch_size = self.batch_size_for(model.name())?;

        let candidates: Vec<Arc<Instance>> = self
            .state
            .identity_map
            .in_hierarchy(model.root())
            .into_iter()
            .filter_map(EntityRef::data_holder)
            .filter(|holder| {
                !std::ptr::eq(requester, Arc::as_ptr(holder))
                    && holder.entity_type() == model.name()
                    && needs_group(holder, group)
            })
            .take(batch_size - 1)
            .collect();

        let mut members: Vec<&Instance> = Vec::with_capacity(candidates.len() + 1);
        members.push(requester);
        members.extend(candidates.iter().map(Arc::as_ref));

        let identities: Vec<EntityIdentity> =
            members.iter().map(|m| m.identity().clone()).collect();
        let mut rows = self.exec_load_batch(model.name(), &identities, &model.groups()[group])?;

        let prepared = self.hydrate_staged(&identities, |guard, staging| {
            let mut prepared = Vec::with_capacity(members.len());
            for member in &members {
                match rows.remove(member.identity()) {
                    Some(row) => {
                        let values = guard.hydrate_values(&model, &row, &[group], staging)?;
                        prepared.push(Some(PreparedRow {
                            model: Arc::clone(&model),
                            groups: vec![group],
                            values,
                        }));
                    }
                    None => prepared.push(None),
                }
            }
            Ok(prepared)
        })?;

        for (member, prepared) in members.iter().zip(prepared) {
            match prepared {
                Some(prepared) => swap_in(member, prepared),
                None => {
                    tracing::debug!(identity = %member.identity(), "No row found, marking missing");
                    member.mark_missing();
                }
            }
        }

        if requester.is_missing() {
            Err(Error::not_found(requester.identity()))
        } else {
            Ok(())
        }
    }
}

fn needs_group(instance: &Instance, group: usize) -> bool {
    let data = crate::instance::read_lock(&instance.data);
    data.state.is_base_initialized() && !data.state.is_index_initialized(group)
}
