//! The persistence context shared by a session and its instances.
//!
//! A [`Session`](crate::Session) owns the only strong reference to its
//! `ContextInner`; instances, proxies and collections keep a `Weak` one. A
//! dropped session therefore makes every later load fault with
//! `ContextClosed` instead of reaching a dangling loader.
//!
//! # Locking
//!
//! All loading runs while holding the context mutex ([`ContextGuard`]).
//! Instance and proxy locks are only ever taken *after* the context lock (or
//! alone, for inspection), and code holding the guard never calls the public
//! accessors that may load.

use crate::SessionConfig;
use crate::identity_map::{EntityKey, IdentityMap};
use crate::instance::{EntityRef, Instance, Proxy};
use crate::statistics::{FetchTracker, SessionStatistics};
use lazyorm_core::{
    ConfigError, EntityIdentity, EntityRow, Error, LazyGroup, Loader, MetadataRegistry, Result,
    TypeError, Value,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub(crate) struct ContextState {
    pub(crate) open: bool,
    pub(crate) identity_map: IdentityMap,
    loader: Box<dyn Loader>,
    pub(crate) statistics: SessionStatistics,
    pub(crate) tracker: FetchTracker,
    pub(crate) pending_deletes: Vec<EntityIdentity>,
}

pub(crate) struct ContextInner {
    pub(crate) registry: Arc<MetadataRegistry>,
    pub(crate) config: SessionConfig,
    state: Mutex<ContextState>,
}

impl ContextInner {
    pub(crate) fn new(
        registry: Arc<MetadataRegistry>,
        loader: Box<dyn Loader>,
        config: SessionConfig,
    ) -> Self {
        let tracker = FetchTracker::new()
            .with_threshold(config.n1_threshold)
            .with_enabled(config.track_fetches);
        Self {
            registry,
            config,
            state: Mutex::new(ContextState {
                open: true,
                identity_map: IdentityMap::new(),
                loader,
                statistics: SessionStatistics::default(),
                tracker,
                pending_deletes: Vec::new(),
            }),
        }
    }

    /// Lock the context regardless of whether it is still open.
    pub(crate) fn lock(self: &Arc<Self>) -> ContextGuard<'_> {
        ContextGuard {
            inner: self,
            state: self.state.lock().unwrap_or_else(PoisonError::into_inner),
        }
    }

    /// Lock the context for a load on behalf of `identity`.
    pub(crate) fn enter(
        self: &Arc<Self>,
        identity: &EntityIdentity,
        attribute: Option<&'static str>,
    ) -> Result<ContextGuard<'_>> {
        let guard = self.lock();
        if guard.state.open {
            Ok(guard)
        } else {
            Err(Error::context_closed(identity, attribute))
        }
    }
}

/// Exclusive access to an open context.
pub(crate) struct ContextGuard<'a> {
    pub(crate) inner: &'a Arc<ContextInner>,
    pub(crate) state: MutexGuard<'a, ContextState>,
}

impl ContextGuard<'_> {
    pub(crate) fn registry(&self) -> &Arc<MetadataRegistry> {
        &self.inner.registry
    }

    /// Batch size for placeholders of `entity`.
    pub(crate) fn batch_size_for(&self, entity: &str) -> Result<usize> {
        let declared = self.inner.registry.model(entity)?.batch_size();
        Ok(declared.unwrap_or(self.inner.config.default_batch_size).max(1))
    }

    pub(crate) fn key_for(&self, entity: &str, id: &Value) -> Result<EntityKey> {
        let root = self.inner.registry.root_of(entity)?;
        Ok(EntityKey::new(root, id.clone()))
    }

    /// The managed reference for `entity#id`, if any.
    pub(crate) fn managed(&self, entity: &str, id: &Value) -> Result<Option<EntityRef>> {
        let key = self.key_for(entity, id)?;
        Ok(self.state.identity_map.get(&key).cloned())
    }

    /// Look up the managed reference for `entity#id`, registering a new
    /// placeholder when there is none. Never queries.
    ///
    /// Leaf types get an enhanced-instance placeholder, other types a proxy.
    /// An existing reference is returned whatever its shape.
    pub(crate) fn reference(&mut self, entity: &str, id: Value) -> Result<EntityRef> {
        let model = Arc::clone(self.inner.registry.model(entity)?);
        let key = EntityKey::new(model.root(), id.clone());
        if let Some(existing) = self.state.identity_map.get(&key).cloned() {
            self.check_compatible(&existing, model.name())?;
            tracing::trace!(key = %key, "Reusing managed reference");
            return Ok(existing);
        }

        let reference = if model.is_leaf() {
            if model.is_abstract() {
                return Err(Error::Config(ConfigError::new(format!(
                    "abstract entity type '{}' has no subtypes to load",
                    model.name()
                ))));
            }
            EntityRef::Instance(Instance::placeholder(model, id, Arc::downgrade(self.inner)))
        } else {
            EntityRef::Proxy(Proxy::new(model, id, Arc::downgrade(self.inner)))
        };
        tracing::trace!(
            key = %key,
            proxy = reference.is_proxy(),
            "Registered placeholder"
        );
        self.state.identity_map.insert(key, reference.clone());
        Ok(reference)
    }

    /// A managed reference may be reused for `requested` when one type is a
    /// subtype of the other (a proxy of a supertype, or a loaded subtype).
    pub(crate) fn check_compatible(&self, existing: &EntityRef, requested: &'static str) -> Result<()> {
        let actual = existing.concrete_type();
        let registry = &self.inner.registry;
        if registry.is_subtype(actual, requested) || registry.is_subtype(requested, actual) {
            Ok(())
        } else {
            Err(Error::Type(TypeError {
                expected: requested,
                actual: actual.to_string(),
                column: None,
                rust_type: None,
            }))
        }
    }

    /// Validate that a loaded row's concrete type may stand for `declared`.
    pub(crate) fn check_concrete(&self, row: &EntityRow, declared: &'static str) -> Result<()> {
        let concrete = row.identity.entity();
        let registry = &self.inner.registry;
        let is_concrete = registry.model(concrete).is_ok_and(|m| !m.is_abstract());
        if is_concrete && registry.is_subtype(concrete, declared) {
            Ok(())
        } else {
            Err(Error::Type(TypeError {
                expected: declared,
                actual: concrete.to_string(),
                column: None,
                rust_type: None,
            }))
        }
    }

    // ------------------------------------------------------------------
    // Statement execution
    // ------------------------------------------------------------------

    pub(crate) fn exec_load_groups(
        &mut self,
        identity: &EntityIdentity,
        groups: &[&LazyGroup],
    ) -> Result<Option<EntityRow>> {
        let names: Vec<&str> = groups.iter().map(|g| g.name()).collect();
        tracing::debug!(
            entity = identity.entity(),
            id = %identity.id(),
            groups = ?names,
            "Loading lazy groups"
        );

        let row = self.state.loader.load_groups(identity, groups)?;
        self.state
            .statistics
            .record_statement(usize::from(row.is_some()));
        if let Some(last) = groups.last() {
            self.state.tracker.record_fetch(identity.entity(), last.name());
        }
        Ok(row)
    }

    pub(crate) fn exec_load_batch(
        &mut self,
        entity: &'static str,
        identities: &[EntityIdentity],
        group: &LazyGroup,
    ) -> Result<HashMap<EntityIdentity, EntityRow>> {
        if let [single] = identities {
            let row = self.exec_load_groups(single, &[group])?;
            return Ok(row
                .map(|row| HashMap::from([(single.clone(), row)]))
                .unwrap_or_default());
        }

        tracing::debug!(
            entity = entity,
            group = group.name(),
            batch_size = identities.len(),
            "Batch loading"
        );
        let rows = self.state.loader.load_batch(entity, identities, group)?;
        self.state.statistics.record_statement(rows.len());
        self.state.statistics.record_batch();
        Ok(rows)
    }

    pub(crate) fn exec_load_collection(
        &mut self,
        owner: &EntityIdentity,
        attribute: &'static str,
    ) -> Result<Vec<EntityRow>> {
        tracing::debug!(
            owner = %owner,
            attribute = attribute,
            "Loading collection"
        );
        let rows = self.state.loader.load_collection(owner, attribute)?;
        self.state.statistics.record_statement(rows.len());
        self.state.statistics.record_collection();
        self.state.tracker.record_fetch(owner.entity(), attribute);
        Ok(rows)
    }
}
