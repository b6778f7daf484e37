//! Entity references: enhanced instances and proxy stand-ins.
//!
//! A reference handed out by a session is an [`EntityRef`]. Its shape is fixed
//! when it is created:
//!
//! - **Enhanced instance** ([`Instance`]): used when the referenced type is a
//!   leaf of its inheritance tree, so the concrete type is already known. The
//!   placeholder *is* the entity; loading fills its attribute storage in place.
//! - **Proxy stand-in** ([`Proxy`]): used when the declared type has subtypes.
//!   The concrete type is only learned from the loaded row, so the proxy
//!   forwards to a separately allocated implementation instance once loaded.
//!
//! Either way, every holder of the reference observes the loaded state without
//! being revisited: loading mutates shared storage, it never reseats pointers.

use crate::collection::PersistentCollection;
use crate::context::ContextInner;
use lazyorm_core::{
    AssociationKind, EntityIdentity, EntityModel, Error, InitializationState, MetadataRegistry,
    OverallState, Result, TypeError, Value,
};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

pub(crate) fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// Attribute values
// ============================================================================

/// The value stored for one attribute.
#[derive(Debug, Clone)]
pub enum AttributeValue {
    /// Scalar value.
    Basic(Value),
    /// To-one association; `None` is a null association.
    ToOne(Option<EntityRef>),
    /// Collection wrapper (contents load separately).
    ToMany(PersistentCollection),
}

impl AttributeValue {
    /// Human-readable kind, for error messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            AttributeValue::Basic(_) => "basic value",
            AttributeValue::ToOne(_) => "to-one association",
            AttributeValue::ToMany(_) => "collection",
        }
    }

    /// The scalar value, if this is one.
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            AttributeValue::Basic(v) => Some(v),
            _ => None,
        }
    }

    /// Whether two values are the same: equal scalars, or the very same
    /// referenced objects.
    pub fn same_as(&self, other: &AttributeValue) -> bool {
        match (self, other) {
            (AttributeValue::Basic(a), AttributeValue::Basic(b)) => a == b,
            (AttributeValue::ToOne(None), AttributeValue::ToOne(None)) => true,
            (AttributeValue::ToOne(Some(a)), AttributeValue::ToOne(Some(b))) => a.ptr_eq(b),
            (AttributeValue::ToMany(a), AttributeValue::ToMany(b)) => a.ptr_eq(b),
            _ => false,
        }
    }

    fn fits(&self, kind: AssociationKind) -> bool {
        matches!(
            (self, kind),
            (AttributeValue::Basic(_), AssociationKind::Basic)
                | (
                    AttributeValue::ToOne(_),
                    AssociationKind::OwnedToOne | AssociationKind::InverseToOne
                )
                | (AttributeValue::ToMany(_), AssociationKind::ToMany)
        )
    }
}

impl From<Value> for AttributeValue {
    fn from(value: Value) -> Self {
        AttributeValue::Basic(value)
    }
}

impl From<Option<EntityRef>> for AttributeValue {
    fn from(value: Option<EntityRef>) -> Self {
        AttributeValue::ToOne(value)
    }
}

impl From<EntityRef> for AttributeValue {
    fn from(value: EntityRef) -> Self {
        AttributeValue::ToOne(Some(value))
    }
}

impl From<PersistentCollection> for AttributeValue {
    fn from(value: PersistentCollection) -> Self {
        AttributeValue::ToMany(value)
    }
}

pub(crate) fn kind_mismatch(attribute: &str, expected: &'static str, actual: &AttributeValue) -> Error {
    Error::Type(TypeError {
        expected,
        actual: actual.kind_name().to_string(),
        column: Some(attribute.to_string()),
        rust_type: None,
    })
}

// ============================================================================
// Interception capability
// ============================================================================

/// Attribute access that may transparently trigger loading.
///
/// Every getter or setter on a managed reference may run a query through the
/// owning session; see the crate docs for the exact read and write protocol.
pub trait LazilyInterceptable {
    /// The identity this reference was created for.
    fn identity(&self) -> &EntityIdentity;

    /// Coarse initialization state.
    fn overall_state(&self) -> OverallState;

    /// Read an attribute, loading its group first if needed.
    fn read(&self, attribute: &str) -> Result<AttributeValue>;

    /// Write an attribute, loading its group first if needed.
    fn write(&self, attribute: &str, value: AttributeValue) -> Result<()>;

    /// Read a scalar attribute.
    fn get(&self, attribute: &str) -> Result<Value> {
        match self.read(attribute)? {
            AttributeValue::Basic(v) => Ok(v),
            other => Err(kind_mismatch(attribute, "basic value", &other)),
        }
    }

    /// Read a to-one association.
    fn get_reference(&self, attribute: &str) -> Result<Option<EntityRef>> {
        match self.read(attribute)? {
            AttributeValue::ToOne(r) => Ok(r),
            other => Err(kind_mismatch(attribute, "to-one association", &other)),
        }
    }

    /// Read a collection wrapper (its contents stay unloaded).
    fn get_collection(&self, attribute: &str) -> Result<PersistentCollection> {
        match self.read(attribute)? {
            AttributeValue::ToMany(c) => Ok(c),
            other => Err(kind_mismatch(attribute, "collection", &other)),
        }
    }

    /// Write a scalar attribute.
    fn set<V: Into<Value>>(&self, attribute: &str, value: V) -> Result<()>
    where
        Self: Sized,
    {
        self.write(attribute, AttributeValue::Basic(value.into()))
    }

    /// Write a to-one association.
    fn set_reference(&self, attribute: &str, target: Option<EntityRef>) -> Result<()> {
        self.write(attribute, AttributeValue::ToOne(target))
    }
}

// ============================================================================
// Enhanced instance
// ============================================================================

pub(crate) struct InstanceData {
    pub(crate) state: InitializationState,
    /// Indexed like `EntityModel::attributes`; `None` until the group loads.
    pub(crate) values: Vec<Option<AttributeValue>>,
    /// Blind writes recorded before the base group was loaded.
    pub(crate) pending: Vec<(usize, AttributeValue)>,
    pub(crate) dirty: Vec<&'static str>,
    pub(crate) intercepting: bool,
}

impl InstanceData {
    pub(crate) fn store(&mut self, index: usize, name: &'static str, value: AttributeValue) {
        self.pending.retain(|(i, _)| *i != index);
        self.values[index] = Some(value);
        self.mark_dirty(name);
    }

    pub(crate) fn mark_dirty(&mut self, name: &'static str) {
        if !self.dirty.contains(&name) {
            self.dirty.push(name);
        }
    }
}

/// An entity instance whose attribute storage is filled in place.
pub struct Instance {
    model: Arc<EntityModel>,
    identity: EntityIdentity,
    pub(crate) data: RwLock<InstanceData>,
    context: RwLock<Weak<ContextInner>>,
}

impl Instance {
    fn with_state(
        model: Arc<EntityModel>,
        id: Value,
        state: InitializationState,
        values: Vec<Option<AttributeValue>>,
        context: Weak<ContextInner>,
    ) -> Self {
        let intercepting = state.overall() != OverallState::Initialized;
        Self {
            identity: EntityIdentity::new(model.name(), id),
            model,
            data: RwLock::new(InstanceData {
                state,
                values,
                pending: Vec::new(),
                dirty: Vec::new(),
                intercepting,
            }),
            context: RwLock::new(context),
        }
    }

    /// Uninitialized placeholder bound to a context.
    pub(crate) fn placeholder(
        model: Arc<EntityModel>,
        id: Value,
        context: Weak<ContextInner>,
    ) -> Arc<Self> {
        let state = InitializationState::new(&model);
        let values = vec![None; model.attributes().len()];
        Arc::new(Self::with_state(model, id, state, values, context))
    }

    /// A new, fully initialized instance that belongs to no session.
    ///
    /// Scalars start as NULL, to-ones as null and collections empty. Such
    /// instances are typically filled in and then passed to
    /// [`Session::merge`](crate::Session::merge).
    pub fn transient(
        registry: &MetadataRegistry,
        entity: &str,
        id: impl Into<Value>,
    ) -> Result<Arc<Self>> {
        let model = Arc::clone(registry.model(entity)?);
        if model.is_abstract() {
            return Err(Error::Config(lazyorm_core::ConfigError::new(format!(
                "cannot instantiate abstract entity type '{}'",
                model.name()
            ))));
        }
        let identity = EntityIdentity::new(model.name(), id);
        let values = model
            .attributes()
            .iter()
            .map(|attr| {
                Some(match attr.kind {
                    AssociationKind::Basic => AttributeValue::Basic(Value::Null),
                    AssociationKind::OwnedToOne | AssociationKind::InverseToOne => {
                        AttributeValue::ToOne(None)
                    }
                    AssociationKind::ToMany => AttributeValue::ToMany(
                        PersistentCollection::initialized(
                            &identity,
                            attr.name,
                            attr.target.unwrap_or(model.name()),
                            Weak::new(),
                            Vec::new(),
                        ),
                    ),
                })
            })
            .collect();
        let state = InitializationState::fully_initialized(&model);
        Ok(Arc::new(Self::with_state(
            model,
            identity.id().clone(),
            state,
            values,
            Weak::new(),
        )))
    }

    /// The (concrete) identity of this instance.
    pub fn identity(&self) -> &EntityIdentity {
        &self.identity
    }

    /// Concrete entity metadata.
    pub fn model(&self) -> &Arc<EntityModel> {
        &self.model
    }

    /// Concrete entity type name.
    pub fn entity_type(&self) -> &'static str {
        self.model.name()
    }

    /// Coarse initialization state.
    pub fn overall_state(&self) -> OverallState {
        read_lock(&self.data).state.overall()
    }

    /// Whether the base group is loaded (the entity itself is initialized).
    pub fn is_initialized(&self) -> bool {
        read_lock(&self.data).state.is_base_initialized()
    }

    /// Whether the named lazy group is loaded.
    pub fn is_group_initialized(&self, group: &str) -> bool {
        match self.model.group(group) {
            Some(g) => read_lock(&self.data).state.is_group_initialized(g),
            None => false,
        }
    }

    /// Whether reading `attribute` would return without loading anything.
    pub fn is_property_initialized(&self, attribute: &str) -> bool {
        if attribute == self.model.identifier() {
            return true;
        }
        match self.model.attribute_index(attribute) {
            Some(index) => read_lock(&self.data)
                .state
                .is_group_initialized(self.model.group_of(index)),
            None => false,
        }
    }

    /// Whether attribute access is still intercepted. Cleared once every
    /// group is loaded.
    pub fn has_interceptor(&self) -> bool {
        read_lock(&self.data).intercepting
    }

    /// Attributes written since the instance was created, in write order.
    pub fn dirty_attributes(&self) -> Vec<&'static str> {
        read_lock(&self.data).dirty.clone()
    }

    pub(crate) fn attribute_index(&self, attribute: &str) -> Result<usize> {
        self.model.attribute_index(attribute).ok_or_else(|| {
            Error::Config(lazyorm_core::ConfigError::new(format!(
                "unknown attribute '{}' on entity type '{}'",
                attribute,
                self.model.name()
            )))
        })
    }

    pub(crate) fn check_value_kind(&self, index: usize, value: &AttributeValue) -> Result<()> {
        let attr = &self.model.attributes()[index];
        if value.fits(attr.kind) {
            Ok(())
        } else {
            let expected = match attr.kind {
                AssociationKind::Basic => "basic value",
                AssociationKind::OwnedToOne | AssociationKind::InverseToOne => {
                    "to-one association"
                }
                AssociationKind::ToMany => "collection",
            };
            Err(kind_mismatch(attr.name, expected, value))
        }
    }

    pub(crate) fn context(&self) -> Option<Arc<ContextInner>> {
        read_lock(&self.context).upgrade()
    }

    pub(crate) fn context_weak(&self) -> Weak<ContextInner> {
        read_lock(&self.context).clone()
    }

    /// Cut the link to the owning context (and that of owned collections).
    pub(crate) fn sever(&self) {
        *write_lock(&self.context) = Weak::new();
        let data = read_lock(&self.data);
        for value in data.values.iter().flatten() {
            if let AttributeValue::ToMany(collection) = value {
                collection.sever();
            }
        }
    }

    pub(crate) fn mark_missing(&self) {
        write_lock(&self.data).state.mark_missing();
    }

    pub(crate) fn is_missing(&self) -> bool {
        read_lock(&self.data).state.is_missing()
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("identity", &self.identity)
            .field("state", &self.overall_state())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Proxy stand-in
// ============================================================================

#[derive(Default)]
pub(crate) struct ProxyTarget {
    pub(crate) implementation: Option<Arc<Instance>>,
    pub(crate) missing: bool,
}

/// A stand-in for an entity whose declared type has subtypes.
pub struct Proxy {
    declared: Arc<EntityModel>,
    identity: EntityIdentity,
    pub(crate) target: RwLock<ProxyTarget>,
    context: RwLock<Weak<ContextInner>>,
}

impl Proxy {
    pub(crate) fn new(declared: Arc<EntityModel>, id: Value, context: Weak<ContextInner>) -> Arc<Self> {
        Arc::new(Self {
            identity: EntityIdentity::new(declared.name(), id),
            declared,
            target: RwLock::new(ProxyTarget::default()),
            context: RwLock::new(context),
        })
    }

    /// Identity with the declared (possibly abstract) type.
    pub fn identity(&self) -> &EntityIdentity {
        &self.identity
    }

    /// Declared type metadata.
    pub fn declared_model(&self) -> &Arc<EntityModel> {
        &self.declared
    }

    /// The declared type until loaded, then the concrete type of the row.
    pub fn concrete_type(&self) -> &'static str {
        match &read_lock(&self.target).implementation {
            Some(implementation) => implementation.entity_type(),
            None => self.declared.name(),
        }
    }

    /// The loaded implementation, if any.
    pub fn implementation(&self) -> Option<Arc<Instance>> {
        read_lock(&self.target).implementation.clone()
    }

    /// Whether the implementation has been loaded.
    pub fn is_initialized(&self) -> bool {
        read_lock(&self.target).implementation.is_some()
    }

    /// Coarse initialization state (the implementation's once loaded).
    pub fn overall_state(&self) -> OverallState {
        let target = read_lock(&self.target);
        if target.missing {
            OverallState::Missing
        } else {
            match &target.implementation {
                Some(implementation) => implementation.overall_state(),
                None => OverallState::Uninitialized,
            }
        }
    }

    pub(crate) fn is_missing(&self) -> bool {
        read_lock(&self.target).missing
    }

    pub(crate) fn mark_missing(&self) {
        write_lock(&self.target).missing = true;
    }

    pub(crate) fn needs_load(&self) -> bool {
        let target = read_lock(&self.target);
        !target.missing && target.implementation.is_none()
    }

    pub(crate) fn context(&self) -> Option<Arc<ContextInner>> {
        read_lock(&self.context).upgrade()
    }

    pub(crate) fn sever(&self) {
        *write_lock(&self.context) = Weak::new();
        if let Some(implementation) = self.implementation() {
            implementation.sever();
        }
    }
}

impl fmt::Debug for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Proxy")
            .field("identity", &self.identity)
            .field("concrete_type", &self.concrete_type())
            .field("state", &self.overall_state())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// EntityRef
// ============================================================================

/// A shareable reference to a (possibly not yet loaded) entity.
///
/// Cloning is cheap and yields the same underlying object; use
/// [`ptr_eq`](Self::ptr_eq) for referential equality.
#[derive(Clone)]
pub enum EntityRef {
    /// Enhanced instance (leaf types).
    Instance(Arc<Instance>),
    /// Proxy stand-in (types with subtypes).
    Proxy(Arc<Proxy>),
}

impl EntityRef {
    /// Do both references point at the same object?
    pub fn ptr_eq(&self, other: &EntityRef) -> bool {
        match (self, other) {
            (EntityRef::Instance(a), EntityRef::Instance(b)) => Arc::ptr_eq(a, b),
            (EntityRef::Proxy(a), EntityRef::Proxy(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Is this a proxy stand-in?
    pub fn is_proxy(&self) -> bool {
        matches!(self, EntityRef::Proxy(_))
    }

    /// The enhanced instance, if this is one.
    pub fn as_instance(&self) -> Option<&Arc<Instance>> {
        match self {
            EntityRef::Instance(i) => Some(i),
            EntityRef::Proxy(_) => None,
        }
    }

    /// The proxy, if this is one.
    pub fn as_proxy(&self) -> Option<&Arc<Proxy>> {
        match self {
            EntityRef::Proxy(p) => Some(p),
            EntityRef::Instance(_) => None,
        }
    }

    /// Concrete type as currently known.
    pub fn concrete_type(&self) -> &'static str {
        match self {
            EntityRef::Instance(i) => i.entity_type(),
            EntityRef::Proxy(p) => p.concrete_type(),
        }
    }

    /// Whether the entity itself (its base group) is loaded.
    pub fn is_initialized(&self) -> bool {
        match self {
            EntityRef::Instance(i) => i.is_initialized(),
            EntityRef::Proxy(p) => p.is_initialized(),
        }
    }

    /// Whether the named lazy group is loaded.
    pub fn is_group_initialized(&self, group: &str) -> bool {
        self.data_holder()
            .is_some_and(|holder| holder.is_group_initialized(group))
    }

    /// Whether reading `attribute` would return without loading anything.
    pub fn is_property_initialized(&self, attribute: &str) -> bool {
        match self {
            EntityRef::Instance(i) => i.is_property_initialized(attribute),
            EntityRef::Proxy(p) => {
                attribute == p.declared.identifier()
                    || p.implementation()
                        .is_some_and(|i| i.is_property_initialized(attribute))
            }
        }
    }

    /// Attributes written through this reference.
    pub fn dirty_attributes(&self) -> Vec<&'static str> {
        self.data_holder()
            .map(|holder| holder.dirty_attributes())
            .unwrap_or_default()
    }

    /// Load every remaining lazy group now.
    ///
    /// The base group goes through batch fetching; the remaining groups are
    /// fetched together in one statement. Collection contents stay lazy.
    pub fn force_initialize(&self) -> Result<()> {
        crate::interceptor::force_initialize(self)
    }

    /// The instance that holds attribute data: the instance itself, or a
    /// proxy's implementation once loaded.
    pub(crate) fn data_holder(&self) -> Option<Arc<Instance>> {
        match self {
            EntityRef::Instance(i) => Some(Arc::clone(i)),
            EntityRef::Proxy(p) => p.implementation(),
        }
    }

    /// Still waiting for its base group?
    pub(crate) fn needs_base(&self) -> bool {
        match self {
            EntityRef::Instance(i) => i.overall_state() == OverallState::Uninitialized,
            EntityRef::Proxy(p) => p.needs_load(),
        }
    }

    pub(crate) fn is_missing(&self) -> bool {
        match self {
            EntityRef::Instance(i) => i.is_missing(),
            EntityRef::Proxy(p) => p.is_missing(),
        }
    }

    pub(crate) fn context(&self) -> Option<Arc<ContextInner>> {
        match self {
            EntityRef::Instance(i) => i.context(),
            EntityRef::Proxy(p) => p.context(),
        }
    }

    pub(crate) fn sever(&self) {
        match self {
            EntityRef::Instance(i) => i.sever(),
            EntityRef::Proxy(p) => p.sever(),
        }
    }
}

impl fmt::Debug for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityRef::Instance(i) => i.fmt(f),
            EntityRef::Proxy(p) => p.fmt(f),
        }
    }
}

impl From<Arc<Instance>> for EntityRef {
    fn from(instance: Arc<Instance>) -> Self {
        EntityRef::Instance(instance)
    }
}

impl From<Arc<Proxy>> for EntityRef {
    fn from(proxy: Arc<Proxy>) -> Self {
        EntityRef::Proxy(proxy)
    }
}
