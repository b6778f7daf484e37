//! Lazy collections.
//!
//! A collection attribute has two levels of laziness. Reading the attribute
//! yields a [`PersistentCollection`] wrapper without any query; the contents
//! are fetched on the first operation that needs them (`len`, `elements`,
//! `contains`, `push`).

use crate::context::{ContextGuard, ContextInner};
use crate::instance::{EntityRef, read_lock, write_lock};
use lazyorm_core::{EntityIdentity, Error, Result};
use std::fmt;
use std::sync::{Arc, RwLock, Weak};

struct CollectionInner {
    owner: EntityIdentity,
    attribute: &'static str,
    target: &'static str,
    context: RwLock<Weak<ContextInner>>,
    elements: RwLock<Option<Vec<EntityRef>>>,
}

/// Wrapper around the contents of a to-many association.
#[derive(Clone)]
pub struct PersistentCollection {
    inner: Arc<CollectionInner>,
}

impl PersistentCollection {
    fn build(
        owner: &EntityIdentity,
        attribute: &'static str,
        target: &'static str,
        context: Weak<ContextInner>,
        elements: Option<Vec<EntityRef>>,
    ) -> Self {
        Self {
            inner: Arc::new(CollectionInner {
                owner: owner.clone(),
                attribute,
                target,
                context: RwLock::new(context),
                elements: RwLock::new(elements),
            }),
        }
    }

    pub(crate) fn uninitialized(
        owner: &EntityIdentity,
        attribute: &'static str,
        target: &'static str,
        context: Weak<ContextInner>,
    ) -> Self {
        Self::build(owner, attribute, target, context, None)
    }

    pub(crate) fn initialized(
        owner: &EntityIdentity,
        attribute: &'static str,
        target: &'static str,
        context: Weak<ContextInner>,
        elements: Vec<EntityRef>,
    ) -> Self {
        Self::build(owner, attribute, target, context, Some(elements))
    }

    /// Identity of the owning entity.
    pub fn owner(&self) -> &EntityIdentity {
        &self.inner.owner
    }

    /// Attribute name on the owner.
    pub fn attribute(&self) -> &'static str {
        self.inner.attribute
    }

    /// Declared element type.
    pub fn element_type(&self) -> &'static str {
        self.inner.target
    }

    /// Whether the contents have been loaded.
    pub fn is_initialized(&self) -> bool {
        read_lock(&self.inner.elements).is_some()
    }

    /// Is this the same wrapper object?
    pub fn ptr_eq(&self, other: &PersistentCollection) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Number of elements, loading the contents if needed.
    pub fn len(&self) -> Result<usize> {
        self.with_elements(|elements| elements.len())
    }

    /// Whether the collection is empty, loading the contents if needed.
    pub fn is_empty(&self) -> Result<bool> {
        self.with_elements(|elements| elements.is_empty())
    }

    /// All elements, loading the contents if needed.
    pub fn elements(&self) -> Result<Vec<EntityRef>> {
        self.with_elements(|elements| elements.to_vec())
    }

    /// Whether `element` (by reference) is in the collection.
    pub fn contains(&self, element: &EntityRef) -> Result<bool> {
        self.with_elements(|elements| elements.iter().any(|e| e.ptr_eq(element)))
    }

    /// Append an element, loading the contents first.
    pub fn push(&self, element: EntityRef) -> Result<()> {
        self.initialize()?;
        if let Some(elements) = write_lock(&self.inner.elements).as_mut() {
            elements.push(element);
        }
        Ok(())
    }

    /// Snapshot of the contents if loaded, without triggering anything.
    pub(crate) fn loaded_elements(&self) -> Option<Vec<EntityRef>> {
        read_lock(&self.inner.elements).clone()
    }

    pub(crate) fn sever(&self) {
        *write_lock(&self.inner.context) = Weak::new();
    }

    fn with_elements<T>(&self, f: impl FnOnce(&[EntityRef]) -> T) -> Result<T> {
        self.initialize()?;
        let elements = read_lock(&self.inner.elements);
        Ok(f(elements.as_deref().unwrap_or_default()))
    }

    fn initialize(&self) -> Result<()> {
        if self.is_initialized() {
            return Ok(());
        }
        let context = read_lock(&self.inner.context)
            .upgrade()
            .ok_or_else(|| Error::context_closed(self.owner(), Some(self.attribute())))?;
        let mut guard = context.enter(self.owner(), Some(self.attribute()))?;
        guard.initialize_collection(self)
    }
}

impl ContextGuard<'_> {
    /// Load the contents of `collection`; element rows are hydrated through
    /// the identity map.
    pub(crate) fn initialize_collection(&mut self, collection: &PersistentCollection) -> Result<()> {
        if collection.is_initialized() {
            return Ok(());
        }
        let rows = self.exec_load_collection(collection.owner(), collection.attribute())?;
        let elements = self.hydrate_staged(&[], |guard, staging| {
            let mut elements = Vec::with_capacity(rows.len());
            for row in &rows {
                elements.push(guard.hydrate_entity(row, collection.element_type(), staging)?);
            }
            Ok(elements)
        })?;

        let mut slot = write_lock(&collection.inner.elements);
        if slot.is_none() {
            tracing::debug!(
                owner = %collection.owner(),
                attribute = collection.attribute(),
                count = elements.len(),
                "Collection initialized"
            );
            *slot = Some(elements);
        }
        Ok(())
    }
}

impl fmt::Debug for PersistentCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let size = read_lock(&self.inner.elements).as_ref().map(Vec::len);
        f.debug_struct("PersistentCollection")
            .field("owner", &self.inner.owner)
            .field("attribute", &self.inner.attribute)
            .field("loaded", &size)
            .finish()
    }
}
