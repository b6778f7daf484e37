//! Static mapping metadata: attributes, lazy groups and association kinds.
//!
//! Metadata is declared once per entity type with [`EntityModel::builder`]
//! and frozen into a [`MetadataRegistry`] at mapping-load time. After that it
//! is read-only and shared (`Arc`) by every persistence context, so lookups
//! never take a lock.
//!
//! # Group assignment
//!
//! Every non-identifier attribute belongs to exactly one [`LazyGroup`]:
//!
//! - an explicit `lazy_group("...")` wins;
//! - basic attributes and owned to-one associations default to the
//!   [`BASE_GROUP`], which also carries the identifier;
//! - inverse to-one associations and collections default to a group of their
//!   own, named after the attribute.
//!
//! The base group always has index 0; the remaining groups keep the order in
//! which their first attribute was declared (supertype attributes first).

use crate::error::{ConfigError, Error, Result};
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, OnceLock};

/// Name of the implicit group holding the identifier and eager attributes.
pub const BASE_GROUP: &str = "base";

/// Maximum number of lazy groups per entity type (one bit each).
pub const MAX_GROUPS: usize = 64;

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap_or_else(|e| {
            unreachable!("identifier pattern is a valid regex: {e}");
        })
    })
}

/// How an attribute relates to other entities.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum AssociationKind {
    /// Scalar value stored on this entity's row.
    #[default]
    Basic,
    /// To-one association whose foreign key lives on this side: a placeholder
    /// can be built from the FK column without any query.
    OwnedToOne,
    /// To-one association whose foreign key lives on the target side (mapped-by):
    /// even a placeholder needs a query.
    InverseToOne,
    /// Collection; one opaque lazy group with its own initialization flag.
    ToMany,
}

impl AssociationKind {
    /// Is this a to-one association (owned or inverse)?
    pub const fn is_to_one(self) -> bool {
        matches!(self, Self::OwnedToOne | Self::InverseToOne)
    }
}

/// What to do when an association's target row is absent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum NotFoundPolicy {
    /// Accessing the missing target faults with `EntityNotFound`.
    #[default]
    Fault,
    /// The association reads as null. Such associations are resolved inline
    /// with the owner's base group and never produce placeholders.
    Ignore,
}

/// Metadata about one mapped attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttributeInfo {
    /// Attribute name (also the loader column name).
    pub name: &'static str,
    /// Association kind.
    pub kind: AssociationKind,
    /// Target entity type for associations.
    pub target: Option<&'static str>,
    /// Explicit lazy group, if declared.
    pub lazy_group: Option<&'static str>,
    /// Not-found handling for to-one associations.
    pub not_found: NotFoundPolicy,
    /// Whether merge cascades into the associated instance(s).
    pub cascade_merge: bool,
}

impl AttributeInfo {
    const fn with_kind(
        name: &'static str,
        kind: AssociationKind,
        target: Option<&'static str>,
    ) -> Self {
        Self {
            name,
            kind,
            target,
            lazy_group: None,
            not_found: NotFoundPolicy::Fault,
            cascade_merge: false,
        }
    }

    /// A scalar attribute.
    pub const fn basic(name: &'static str) -> Self {
        Self::with_kind(name, AssociationKind::Basic, None)
    }

    /// A to-one association owning the foreign key.
    pub const fn owned_to_one(name: &'static str, target: &'static str) -> Self {
        Self::with_kind(name, AssociationKind::OwnedToOne, Some(target))
    }

    /// A to-one association mapped by the target's foreign key.
    pub const fn inverse_to_one(name: &'static str, target: &'static str) -> Self {
        Self::with_kind(name, AssociationKind::InverseToOne, Some(target))
    }

    /// A collection of `target` entities.
    pub const fn to_many(name: &'static str, target: &'static str) -> Self {
        Self::with_kind(name, AssociationKind::ToMany, Some(target))
    }

    /// Place the attribute in a named lazy group.
    pub const fn lazy_group(mut self, group: &'static str) -> Self {
        self.lazy_group = Some(group);
        self
    }

    /// Set the not-found policy.
    pub const fn not_found(mut self, policy: NotFoundPolicy) -> Self {
        self.not_found = policy;
        self
    }

    /// Cascade merge into this association.
    pub const fn cascade_merge(mut self, value: bool) -> Self {
        self.cascade_merge = value;
        self
    }
}

/// A named partition of an entity's attributes that is always initialized
/// as a unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LazyGroup {
    name: &'static str,
    index: usize,
    attributes: Vec<usize>,
}

impl LazyGroup {
    /// Group name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Position of the group in its entity's group list (base is 0).
    pub fn index(&self) -> usize {
        self.index
    }

    /// Is this the base group?
    pub fn is_base(&self) -> bool {
        self.index == 0
    }

    /// Indices (into [`EntityModel::attributes`]) of the member attributes.
    pub fn attribute_indices(&self) -> &[usize] {
        &self.attributes
    }
}

/// Frozen metadata for one entity type.
#[derive(Debug)]
pub struct EntityModel {
    name: &'static str,
    identifier: &'static str,
    attributes: Vec<AttributeInfo>,
    attribute_group: Vec<usize>,
    groups: Vec<LazyGroup>,
    batch_size: Option<usize>,
    dynamic_update: bool,
    is_abstract: bool,
    supertype: Option<&'static str>,
    root: &'static str,
    subtypes: Vec<&'static str>,
}

impl EntityModel {
    /// Start declaring an entity type.
    pub fn builder(name: &'static str) -> EntityModelBuilder {
        EntityModelBuilder::new(name)
    }

    /// Entity type name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Identifier attribute name.
    pub fn identifier(&self) -> &'static str {
        self.identifier
    }

    /// All attributes (inherited ones first), excluding the identifier.
    pub fn attributes(&self) -> &[AttributeInfo] {
        &self.attributes
    }

    /// Look up an attribute by name.
    pub fn attribute(&self, name: &str) -> Option<&AttributeInfo> {
        self.attribute_index(name).map(|i| &self.attributes[i])
    }

    /// Index of an attribute by name.
    pub fn attribute_index(&self, name: &str) -> Option<usize> {
        self.attributes.iter().position(|a| a.name == name)
    }

    /// Ordered lazy groups; index 0 is the base group.
    pub fn groups(&self) -> &[LazyGroup] {
        &self.groups
    }

    /// The base group.
    pub fn base_group(&self) -> &LazyGroup {
        &self.groups[0]
    }

    /// Look up a group by name.
    pub fn group(&self, name: &str) -> Option<&LazyGroup> {
        self.groups.iter().find(|g| g.name == name)
    }

    /// Group of the attribute at `index`.
    pub fn group_of(&self, index: usize) -> &LazyGroup {
        &self.groups[self.attribute_group[index]]
    }

    /// Declared batch size, if any.
    pub fn batch_size(&self) -> Option<usize> {
        self.batch_size
    }

    /// Whether updates only write changed columns (enables blind updates).
    pub fn dynamic_update(&self) -> bool {
        self.dynamic_update
    }

    /// Whether the type is abstract (never the concrete type of a row).
    pub fn is_abstract(&self) -> bool {
        self.is_abstract
    }

    /// Direct supertype.
    pub fn supertype(&self) -> Option<&'static str> {
        self.supertype
    }

    /// Root of the inheritance hierarchy (identity-map namespace).
    pub fn root(&self) -> &'static str {
        self.root
    }

    /// Direct subtypes.
    pub fn subtypes(&self) -> &[&'static str] {
        &self.subtypes
    }

    /// Leaf types get enhanced-instance placeholders; non-leaf types get
    /// proxy stand-ins.
    pub fn is_leaf(&self) -> bool {
        self.subtypes.is_empty()
    }
}

/// Builder for [`EntityModel`]; finished by [`MetadataRegistryBuilder::build`].
#[derive(Debug, Clone)]
pub struct EntityModelBuilder {
    name: &'static str,
    identifier: &'static str,
    attributes: Vec<AttributeInfo>,
    batch_size: Option<usize>,
    dynamic_update: bool,
    is_abstract: bool,
    supertype: Option<&'static str>,
}

impl EntityModelBuilder {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            identifier: "id",
            attributes: Vec::new(),
            batch_size: None,
            dynamic_update: false,
            is_abstract: false,
            supertype: None,
        }
    }

    /// Set the identifier attribute name (default `"id"`).
    pub fn identifier(mut self, name: &'static str) -> Self {
        self.identifier = name;
        self
    }

    /// Declare an attribute.
    pub fn attribute(mut self, attribute: AttributeInfo) -> Self {
        self.attributes.push(attribute);
        self
    }

    /// Set the batch-fetch size for placeholders of this type.
    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = Some(size);
        self
    }

    /// Enable dynamic update (changed columns only).
    pub fn dynamic_update(mut self, value: bool) -> Self {
        self.dynamic_update = value;
        self
    }

    /// Mark the type abstract.
    pub fn abstract_type(mut self, value: bool) -> Self {
        self.is_abstract = value;
        self
    }

    /// Declare the direct supertype; its attributes are inherited.
    pub fn extends(mut self, supertype: &'static str) -> Self {
        self.supertype = Some(supertype);
        self
    }
}

/// Read-only registry of entity metadata, indexed by entity type name.
#[derive(Debug)]
pub struct MetadataRegistry {
    models: HashMap<&'static str, Arc<EntityModel>>,
}

impl MetadataRegistry {
    /// Start building a registry.
    pub fn builder() -> MetadataRegistryBuilder {
        MetadataRegistryBuilder::default()
    }

    /// Metadata for `entity`; unknown types are configuration errors.
    pub fn model(&self, entity: &str) -> Result<&Arc<EntityModel>> {
        self.models.get(entity).ok_or_else(|| {
            Error::Config(ConfigError::new(format!("unknown entity type '{entity}'")))
        })
    }

    /// Whether `entity` is a known type.
    pub fn contains(&self, entity: &str) -> bool {
        self.models.contains_key(entity)
    }

    /// Ordered lazy groups of `entity`.
    pub fn groups_for(&self, entity: &str) -> Result<&[LazyGroup]> {
        Ok(self.model(entity)?.groups())
    }

    fn attribute_of(&self, entity: &str, attribute: &str) -> Result<&AttributeInfo> {
        self.model(entity)?.attribute(attribute).ok_or_else(|| {
            Error::Config(ConfigError::new(format!(
                "unknown attribute '{attribute}' on entity type '{entity}'"
            )))
        })
    }

    /// Association kind of `entity.attribute`.
    pub fn association_kind(&self, entity: &str, attribute: &str) -> Result<AssociationKind> {
        Ok(self.attribute_of(entity, attribute)?.kind)
    }

    /// Not-found policy of `entity.attribute`.
    pub fn not_found_policy(&self, entity: &str, attribute: &str) -> Result<NotFoundPolicy> {
        Ok(self.attribute_of(entity, attribute)?.not_found)
    }

    /// Declared batch size of `entity`, 1 when batching is not configured.
    pub fn batch_size(&self, entity: &str) -> Result<usize> {
        Ok(self.model(entity)?.batch_size().unwrap_or(1))
    }

    /// Whether `sub` is `sup` or one of its (transitive) subtypes.
    pub fn is_subtype(&self, sub: &str, sup: &str) -> bool {
        let mut current = Some(sub);
        while let Some(name) = current {
            if name == sup {
                return true;
            }
            current = self.models.get(name).and_then(|m| m.supertype);
        }
        false
    }

    /// Root type of `entity`'s hierarchy.
    pub fn root_of(&self, entity: &str) -> Result<&'static str> {
        Ok(self.model(entity)?.root())
    }

    /// Iterate over all registered models.
    pub fn models(&self) -> impl Iterator<Item = &Arc<EntityModel>> {
        self.models.values()
    }
}

/// Collects entity declarations and validates them into a registry.
#[derive(Debug, Default)]
pub struct MetadataRegistryBuilder {
    entities: Vec<EntityModelBuilder>,
}

impl MetadataRegistryBuilder {
    /// Add an entity declaration.
    pub fn entity(mut self, entity: EntityModelBuilder) -> Self {
        self.entities.push(entity);
        self
    }

    /// Validate all declarations and freeze them.
    pub fn build(self) -> Result<Arc<MetadataRegistry>> {
        let mut declared: HashMap<&'static str, EntityModelBuilder> = HashMap::new();
        for entity in self.entities {
            validate_declaration(&entity)?;
            if declared.contains_key(entity.name) {
                return Err(config_error(format!(
                    "entity type '{}' declared twice",
                    entity.name
                )));
            }
            declared.insert(entity.name, entity);
        }

        let mut subtypes: HashMap<&'static str, Vec<&'static str>> = HashMap::new();
        for entity in declared.values() {
            if let Some(sup) = entity.supertype {
                if !declared.contains_key(sup) {
                    return Err(config_error(format!(
                        "entity type '{}' extends unknown type '{}'",
                        entity.name, sup
                    )));
                }
                subtypes.entry(sup).or_default().push(entity.name);
            }
        }

        let mut models = HashMap::new();
        for name in declared.keys() {
            let chain = supertype_chain(&declared, *name)?;
            let model = freeze(&declared, &chain, subtypes.remove(name).unwrap_or_default())?;
            models.insert(*name, Arc::new(model));
        }

        for model in models.values() {
            for attr in &model.attributes {
                if let Some(target) = attr.target {
                    if !models.contains_key(target) {
                        return Err(config_error(format!(
                            "attribute '{}.{}' targets unknown entity type '{}'",
                            model.name, attr.name, target
                        )));
                    }
                }
            }
        }

        tracing::debug!(entities = models.len(), "Metadata registry built");
        Ok(Arc::new(MetadataRegistry { models }))
    }
}

fn config_error(message: String) -> Error {
    Error::Config(ConfigError::new(message))
}

fn check_name(kind: &str, name: &str) -> Result<()> {
    if name_pattern().is_match(name) {
        Ok(())
    } else {
        Err(config_error(format!("invalid {kind} name '{name}'")))
    }
}

fn validate_declaration(entity: &EntityModelBuilder) -> Result<()> {
    check_name("entity", entity.name)?;
    check_name("identifier", entity.identifier)?;
    if entity.batch_size == Some(0) {
        return Err(config_error(format!(
            "entity type '{}' declares batch size 0",
            entity.name
        )));
    }
    for attr in &entity.attributes {
        check_name("attribute", attr.name)?;
        if let Some(group) = attr.lazy_group {
            check_name("lazy group", group)?;
        }
        if attr.kind == AssociationKind::Basic && attr.target.is_some() {
            return Err(config_error(format!(
                "basic attribute '{}.{}' cannot have a target",
                entity.name, attr.name
            )));
        }
        if attr.not_found == NotFoundPolicy::Ignore {
            if attr.kind != AssociationKind::OwnedToOne {
                return Err(config_error(format!(
                    "not-found ignore is only supported on owned to-one associations ('{}.{}')",
                    entity.name, attr.name
                )));
            }
            if attr.lazy_group.is_some_and(|g| g != BASE_GROUP) {
                return Err(config_error(format!(
                    "'{}.{}' ignores missing targets and must be resolved with the base group",
                    entity.name, attr.name
                )));
            }
        }
    }
    Ok(())
}

/// Supertype chain from the root down to `name`.
fn supertype_chain(
    declared: &HashMap<&'static str, EntityModelBuilder>,
    name: &'static str,
) -> Result<Vec<&'static str>> {
    let mut chain = vec![name];
    let mut seen = HashSet::from([name]);
    let mut current = declared[name].supertype;
    while let Some(sup) = current {
        if !seen.insert(sup) {
            return Err(config_error(format!(
                "inheritance cycle through entity type '{sup}'"
            )));
        }
        chain.push(sup);
        current = declared[sup].supertype;
    }
    chain.reverse();
    Ok(chain)
}

fn freeze(
    declared: &HashMap<&'static str, EntityModelBuilder>,
    chain: &[&'static str],
    subtypes: Vec<&'static str>,
) -> Result<EntityModel> {
    let root = declared[chain[0]].clone();
    let own = &declared[chain[chain.len() - 1]];

    let mut attributes: Vec<AttributeInfo> = Vec::new();
    for name in chain {
        let entity = &declared[name];
        if entity.identifier != root.identifier {
            return Err(config_error(format!(
                "entity type '{}' must keep the identifier '{}' of its root '{}'",
                entity.name, root.identifier, root.name
            )));
        }
        for attr in &entity.attributes {
            if attr.name == root.identifier || attributes.iter().any(|a| a.name == attr.name) {
                return Err(config_error(format!(
                    "attribute '{}' declared twice on entity type '{}'",
                    attr.name, own.name
                )));
            }
            attributes.push(*attr);
        }
    }

    let mut groups = vec![LazyGroup {
        name: BASE_GROUP,
        index: 0,
        attributes: Vec::new(),
    }];
    let mut attribute_group = Vec::with_capacity(attributes.len());
    for (idx, attr) in attributes.iter().enumerate() {
        let group_name = match (attr.lazy_group, attr.kind) {
            (Some(group), _) => group,
            (None, AssociationKind::Basic | AssociationKind::OwnedToOne) => BASE_GROUP,
            (None, AssociationKind::InverseToOne | AssociationKind::ToMany) => attr.name,
        };
        let group_idx = match groups.iter().position(|g| g.name == group_name) {
            Some(pos) => pos,
            None => {
                groups.push(LazyGroup {
                    name: group_name,
                    index: groups.len(),
                    attributes: Vec::new(),
                });
                groups.len() - 1
            }
        };
        groups[group_idx].attributes.push(idx);
        attribute_group.push(group_idx);
    }

    if groups.len() > MAX_GROUPS {
        return Err(config_error(format!(
            "entity type '{}' declares {} lazy groups (max {})",
            own.name,
            groups.len(),
            MAX_GROUPS
        )));
    }

    for group in &groups {
        let has_collection = group
            .attributes
            .iter()
            .any(|&i| attributes[i].kind == AssociationKind::ToMany);
        if has_collection && (group.attributes.len() > 1 || group.is_base()) {
            return Err(config_error(format!(
                "collection group '{}' on entity type '{}' must hold exactly one collection",
                group.name, own.name
            )));
        }
    }

    Ok(EntityModel {
        name: own.name,
        identifier: root.identifier,
        attributes,
        attribute_group,
        groups,
        batch_size: own.batch_size,
        dynamic_update: own.dynamic_update,
        is_abstract: own.is_abstract,
        supertype: own.supertype,
        root: root.name,
        subtypes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Arc<MetadataRegistry> {
        MetadataRegistry::builder()
            .entity(
                EntityModel::builder("Document")
                    .attribute(AttributeInfo::basic("title"))
                    .attribute(AttributeInfo::basic("blob").lazy_group("content"))
                    .attribute(AttributeInfo::basic("summary").lazy_group("content"))
                    .attribute(AttributeInfo::basic("notes").lazy_group("extra"))
                    .attribute(AttributeInfo::owned_to_one("author", "Person"))
                    .attribute(AttributeInfo::to_many("revisions", "Person"))
                    .batch_size(10),
            )
            .entity(
                EntityModel::builder("Person")
                    .abstract_type(true)
                    .attribute(AttributeInfo::basic("name")),
            )
            .entity(
                EntityModel::builder("Employee")
                    .extends("Person")
                    .attribute(AttributeInfo::basic("salary")),
            )
            .build()
            .unwrap()
    }

    #[test]
    fn test_group_layout() {
        let registry = sample();
        let doc = registry.model("Document").unwrap();
        let names: Vec<_> = doc.groups().iter().map(LazyGroup::name).collect();
        assert_eq!(names, vec!["base", "content", "extra", "revisions"]);

        let content = doc.group("content").unwrap();
        assert_eq!(content.attribute_indices().len(), 2);
        assert!(doc.base_group().is_base());

        let author = doc.attribute_index("author").unwrap();
        assert!(doc.group_of(author).is_base());
        assert_eq!(registry.batch_size("Document").unwrap(), 10);
        assert_eq!(registry.batch_size("Person").unwrap(), 1);
    }

    #[test]
    fn test_inheritance() {
        let registry = sample();
        let person = registry.model("Person").unwrap();
        let employee = registry.model("Employee").unwrap();
        assert!(!person.is_leaf());
        assert!(employee.is_leaf());
        assert_eq!(employee.root(), "Person");
        assert_eq!(employee.attributes().len(), 2);
        assert!(registry.is_subtype("Employee", "Person"));
        assert!(!registry.is_subtype("Person", "Employee"));
    }

    #[test]
    fn test_lookup_errors() {
        let registry = sample();
        assert!(matches!(registry.model("Nope"), Err(Error::Config(_))));
        assert!(matches!(
            registry.association_kind("Document", "nope"),
            Err(Error::Config(_))
        ));
        assert_eq!(
            registry.association_kind("Document", "author").unwrap(),
            AssociationKind::OwnedToOne
        );
        assert_eq!(
            registry.not_found_policy("Document", "author").unwrap(),
            NotFoundPolicy::Fault
        );
    }

    #[test]
    fn test_invalid_declarations() {
        let bad_name = MetadataRegistry::builder()
            .entity(EntityModel::builder("Bad Name"))
            .build();
        assert!(matches!(bad_name, Err(Error::Config(_))));

        let ignore_lazy = MetadataRegistry::builder()
            .entity(
                EntityModel::builder("A").attribute(
                    AttributeInfo::owned_to_one("b", "A")
                        .not_found(NotFoundPolicy::Ignore)
                        .lazy_group("later"),
                ),
            )
            .build();
        assert!(ignore_lazy.is_err());

        let unknown_target = MetadataRegistry::builder()
            .entity(EntityModel::builder("A").attribute(AttributeInfo::owned_to_one("b", "B")))
            .build();
        assert!(unknown_target.is_err());

        let shared_collection = MetadataRegistry::builder()
            .entity(
                EntityModel::builder("A")
                    .attribute(AttributeInfo::to_many("bs", "A").lazy_group("g"))
                    .attribute(AttributeInfo::basic("x").lazy_group("g")),
            )
            .build();
        assert!(shared_collection.is_err());
    }
}
