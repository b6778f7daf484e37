//! Persistence context and lazy loading for LazyORM.
//!
//! `lazyorm-session` is the **runtime layer**. A [`Session`] owns one
//! persistence context: the identity map, the storage [`Loader`], and the
//! fetch statistics. Every reference it hands out is lazy:
//!
//! - **Placeholders**: `get_reference` never queries. Leaf types get an
//!   enhanced [`Instance`], types with subtypes get a [`Proxy`] stand-in.
//! - **Lazy groups**: the first access to an attribute loads that
//!   attribute's group (and the base group if needed), nothing more.
//! - **Batch fetching**: other pending references of the same hierarchy are
//!   folded into the same statement, up to the entity's batch size.
//! - **Loading in place**: loaded data is swapped into the placeholder, so
//!   every holder of the reference sees it without being revisited.
//! - **Merge**: detached state is reconciled onto the managed reference.
//!
//! # Example
//!
//! ```ignore
//! let session = Session::new(registry, loader);
//!
//! // No query yet
//! let human = session.get_reference("Human", "A Human")?;
//! assert!(!human.is_initialized());
//!
//! // Loads the base group (batched with other pending humans)
//! let sex = human.get("sex")?;
//!
//! // Loads only the "age" group
//! let age = human.get("age")?;
//!
//! // Detached state wins over managed state
//! let managed = session.merge(&detached)?;
//! ```

mod batch;
pub mod collection;
mod context;
pub mod identity_map;
pub mod instance;
mod interceptor;
mod merge;
pub mod statistics;
mod swap;

pub use collection::PersistentCollection;
pub use identity_map::{EntityKey, IdentityMap};
pub use instance::{AttributeValue, EntityRef, Instance, LazilyInterceptable, Proxy};
pub use statistics::{FetchStats, FetchTracker, SessionStatistics};

use batch::Member;
use context::{ContextGuard, ContextInner};
use lazyorm_core::{EntityIdentity, Error, Loader, MetadataRegistry, Result, Value};
use std::collections::HashMap;
use std::sync::Arc;

// ============================================================================
// Session Configuration
// ============================================================================

/// Configuration for Session behavior.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Batch size for entity types that do not declare one (1 = no batching).
    pub default_batch_size: usize,
    /// Number of single fetches of one (entity, group) pair before the fetch
    /// tracker warns about a likely N+1 pattern.
    pub n1_threshold: usize,
    /// Whether the fetch tracker is active.
    pub track_fetches: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_batch_size: 1,
            n1_threshold: 3,
            track_fetches: true,
        }
    }
}

impl SessionConfig {
    /// Create the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the default batch size (builder pattern).
    #[must_use]
    pub fn with_default_batch_size(mut self, size: usize) -> Self {
        self.default_batch_size = size.max(1);
        self
    }

    /// Set the N+1 warning threshold (builder pattern).
    #[must_use]
    pub fn with_n1_threshold(mut self, threshold: usize) -> Self {
        self.n1_threshold = threshold;
        self
    }

    /// Enable or disable the fetch tracker (builder pattern).
    #[must_use]
    pub fn with_fetch_tracking(mut self, enabled: bool) -> Self {
        self.track_fetches = enabled;
        self
    }
}

// ============================================================================
// Session
// ============================================================================

/// One persistence context.
///
/// The session holds the only strong link to its context. Once it is closed
/// or dropped, any reference it handed out faults with `ContextClosed` on
/// the next access that needs a load; already loaded data stays readable.
pub struct Session {
    inner: Arc<ContextInner>,
}

impl Session {
    /// Create a session over `loader` with the default configuration.
    pub fn new(registry: Arc<MetadataRegistry>, loader: impl Loader + 'static) -> Self {
        Self::with_config(registry, loader, SessionConfig::default())
    }

    /// Create a session with custom configuration.
    pub fn with_config(
        registry: Arc<MetadataRegistry>,
        loader: impl Loader + 'static,
        config: SessionConfig,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner::new(registry, Box::new(loader), config)),
        }
    }

    /// The session configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// The mapping metadata.
    pub fn registry(&self) -> &Arc<MetadataRegistry> {
        &self.inner.registry
    }

    fn enter(&self, entity: &str, id: &Value) -> Result<ContextGuard<'_>> {
        let model = self.inner.registry.model(entity)?;
        let identity = EntityIdentity::new(model.name(), id.clone());
        self.inner.enter(&identity, None)
    }

    // ========================================================================
    // Loading
    // ========================================================================

    /// A reference to `entity#id` without loading anything.
    ///
    /// Returns the managed reference if there is one. Otherwise a new
    /// placeholder is registered: an enhanced instance for leaf types, a
    /// proxy stand-in for types with subtypes.
    #[tracing::instrument(level = "debug", skip(self, id))]
    pub fn get_reference(&self, entity: &str, id: impl Into<Value>) -> Result<EntityRef> {
        let id = id.into();
        let mut guard = self.enter(entity, &id)?;
        guard.reference(entity, id)
    }

    /// Find `entity#id`, loading its base group if needed.
    ///
    /// Returns `None` when the row does not exist. Loading the same identity
    /// twice yields the same reference.
    #[tracing::instrument(level = "debug", skip(self, id))]
    pub fn get(&self, entity: &str, id: impl Into<Value>) -> Result<Option<EntityRef>> {
        let id = id.into();
        let mut guard = self.enter(entity, &id)?;
        let reference = guard.reference(entity, id)?;
        if reference.is_missing() {
            return Ok(None);
        }
        if reference.needs_base() {
            match guard.batch_load_base(Member::of(&reference)) {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {
                    tracing::debug!("Entity not found");
                    return Ok(None);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(Some(reference))
    }

    /// Merge detached state into this session and return the managed
    /// reference (never `detached` itself, unless it already is the managed
    /// one).
    #[tracing::instrument(level = "debug", skip(self, detached), fields(identity = %detached.identity()))]
    pub fn merge(&self, detached: &EntityRef) -> Result<EntityRef> {
        let mut guard = self.inner.enter(detached.identity(), None)?;
        let mut visited = HashMap::new();
        guard.merge_entity(detached, &mut visited)
    }

    /// Load every remaining lazy group of `reference`.
    pub fn force_initialize(&self, reference: &EntityRef) -> Result<()> {
        reference.force_initialize()
    }

    /// The instance behind `reference`, initializing a stand-in if needed.
    pub fn unproxy(&self, reference: &EntityRef) -> Result<Arc<Instance>> {
        match reference {
            EntityRef::Instance(instance) => Ok(Arc::clone(instance)),
            EntityRef::Proxy(proxy) => proxy.initialize(None),
        }
    }

    // ========================================================================
    // Initialization State
    // ========================================================================

    /// Whether the entity itself (its base group) is loaded.
    pub fn is_initialized(&self, reference: &EntityRef) -> bool {
        reference.is_initialized()
    }

    /// Whether the named lazy group of `reference` is loaded.
    pub fn is_group_initialized(&self, reference: &EntityRef, group: &str) -> bool {
        reference.is_group_initialized(group)
    }

    /// Whether reading `attribute` would return without loading anything.
    pub fn is_property_initialized(&self, reference: &EntityRef, attribute: &str) -> bool {
        reference.is_property_initialized(attribute)
    }

    /// Attributes written through `reference`, blind updates included.
    pub fn dirty_attributes(&self, reference: &EntityRef) -> Vec<&'static str> {
        reference.dirty_attributes()
    }

    // ========================================================================
    // Context Membership
    // ========================================================================

    /// The key under which `reference` is managed by this session, if it is.
    ///
    /// A proxy's implementation counts as managed through its proxy.
    fn managed_key(guard: &ContextGuard<'_>, reference: &EntityRef) -> Option<(EntityKey, EntityRef)> {
        let identity = reference.identity();
        let key = guard.key_for(identity.entity(), identity.id()).ok()?;
        let managed = guard.managed(identity.entity(), identity.id()).ok()??;
        let same = managed.ptr_eq(reference)
            || matches!(
                (&managed, reference),
                (EntityRef::Proxy(proxy), EntityRef::Instance(instance))
                    if proxy.implementation().is_some_and(|i| Arc::ptr_eq(&i, instance))
            );
        same.then_some((key, managed))
    }

    /// Check if `reference` is managed by this session.
    pub fn contains(&self, reference: &EntityRef) -> bool {
        let guard = self.inner.lock();
        guard.state.open && Self::managed_key(&guard, reference).is_some()
    }

    /// Detach `reference` from the session.
    ///
    /// It leaves the identity map and loses its link to the context: loaded
    /// data stays readable, anything that needs a load faults with
    /// `ContextClosed`. Returns whether the reference was managed.
    #[tracing::instrument(level = "debug", skip(self, reference), fields(identity = %reference.identity()))]
    pub fn detach(&self, reference: &EntityRef) -> bool {
        let mut guard = self.inner.lock();
        let Some((key, managed)) = Self::managed_key(&guard, reference) else {
            tracing::debug!("Reference not managed, nothing to detach");
            return false;
        };
        guard.state.identity_map.remove(&key);
        managed.sever();
        true
    }

    /// Delete the entity behind `reference`.
    ///
    /// The base group is loaded first (a missing row faults with
    /// `EntityNotFound`), then the reference is detached and its identity
    /// recorded as a pending deletion.
    #[tracing::instrument(level = "debug", skip(self, reference), fields(identity = %reference.identity()))]
    pub fn delete(&self, reference: &EntityRef) -> Result<()> {
        let mut guard = self.inner.enter(reference.identity(), None)?;
        let Some((key, managed)) = Self::managed_key(&guard, reference) else {
            return Err(Error::Custom(format!(
                "cannot delete {}: not managed by this session",
                reference.identity()
            )));
        };
        if managed.is_missing() {
            return Err(Error::not_found(managed.identity()));
        }
        if managed.needs_base() {
            guard.batch_load_base(Member::of(&managed))?;
        }
        let identity = managed
            .data_holder()
            .map_or_else(|| managed.identity().clone(), |holder| holder.identity().clone());

        guard.state.identity_map.remove(&key);
        guard.state.pending_deletes.push(identity);
        managed.sever();
        tracing::debug!("Entity scheduled for deletion");
        Ok(())
    }

    /// Identities deleted in this session, in deletion order.
    pub fn pending_deletes(&self) -> Vec<EntityIdentity> {
        self.inner.lock().state.pending_deletes.clone()
    }

    /// Number of references in the identity map.
    pub fn managed_count(&self) -> usize {
        self.inner.lock().state.identity_map.len()
    }

    /// Close the session: every managed reference is detached and further
    /// loads fault with `ContextClosed`.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn close(&self) {
        let mut guard = self.inner.lock();
        if !guard.state.open {
            return;
        }
        guard.state.open = false;
        let evicted = guard.state.identity_map.drain();
        tracing::debug!(evicted = evicted.len(), "Session closed");
        for reference in evicted {
            reference.sever();
        }
    }

    /// Whether the session is still open.
    pub fn is_open(&self) -> bool {
        self.inner.lock().state.open
    }

    // ========================================================================
    // Statistics and N+1 Detection
    // ========================================================================

    /// Statement counters since the session was created or last cleared.
    pub fn statistics(&self) -> SessionStatistics {
        self.inner.lock().state.statistics
    }

    /// Reset the statement counters.
    pub fn clear_statistics(&self) {
        self.inner.lock().state.statistics.clear();
    }

    /// Per-(entity, group) single fetch counts.
    pub fn fetch_stats(&self) -> FetchStats {
        self.inner.lock().state.tracker.stats()
    }

    /// Reset the fetch tracker (call at the start of a new unit of work).
    pub fn reset_fetch_tracking(&self) {
        self.inner.lock().state.tracker.reset();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let guard = self.inner.lock();
        f.debug_struct("Session")
            .field("open", &guard.state.open)
            .field("managed", &guard.state.identity_map.len())
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}
