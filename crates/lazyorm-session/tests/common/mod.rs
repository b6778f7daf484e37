//! Shared fixtures: an in-memory loader that records every statement, and
//! the mappings used across the integration tests.

#![allow(dead_code)]

use lazyorm_core::{
    AssociationKind, AttributeInfo, EntityIdentity, EntityModel, EntityRow, Error, LazyGroup,
    Loader, MetadataRegistry, NotFoundPolicy, QueryError, QueryErrorKind, Result, Row, Value,
};
use lazyorm_session::{Session, SessionConfig};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

// ============================================================================
// Recorded statements
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    Groups,
    Batch,
    Collection,
}

#[derive(Debug, Clone)]
pub struct Statement {
    pub kind: StatementKind,
    pub entity: &'static str,
    pub ids: Vec<Value>,
    /// Group names, or the collection attribute.
    pub groups: Vec<&'static str>,
}

// ============================================================================
// Mock loader
// ============================================================================

struct StoredRow {
    entity: &'static str,
    columns: HashMap<&'static str, Value>,
}

struct MockState {
    registry: Arc<MetadataRegistry>,
    /// Keyed by (root type, id).
    rows: HashMap<EntityIdentity, StoredRow>,
    /// (root owner identity, attribute) -> element ids.
    collections: HashMap<(EntityIdentity, &'static str), Vec<Value>>,
    statements: Vec<Statement>,
    fail_next: Option<String>,
    /// Nesting depth past which ignore-policy to-ones are sent as columns.
    join_depth: Option<usize>,
    /// Columns left out of the rows built for an identity.
    omitted: HashSet<(EntityIdentity, &'static str)>,
}

/// In-memory storage. Clones share state, so a test keeps one handle for
/// inspection and gives another to the session.
#[derive(Clone)]
pub struct MockDb {
    state: Arc<Mutex<MockState>>,
}

impl MockDb {
    pub fn new(registry: &Arc<MetadataRegistry>) -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                registry: Arc::clone(registry),
                rows: HashMap::new(),
                collections: HashMap::new(),
                statements: Vec::new(),
                fail_next: None,
                join_depth: None,
                omitted: HashSet::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().expect("mock state lock")
    }

    /// Store a row of concrete type `entity`.
    ///
    /// Owned to-one and inverse to-one attributes take the target id.
    pub fn insert(&self, entity: &'static str, id: impl Into<Value>, columns: &[(&'static str, Value)]) {
        let mut state = self.lock();
        let root = state.registry.root_of(entity).expect("known entity");
        state.rows.insert(
            EntityIdentity::new(root, id),
            StoredRow {
                entity,
                columns: columns.iter().cloned().collect(),
            },
        );
    }

    /// Set the element ids of a collection.
    pub fn insert_collection(
        &self,
        owner: &'static str,
        id: impl Into<Value>,
        attribute: &'static str,
        elements: Vec<Value>,
    ) {
        let mut state = self.lock();
        let root = state.registry.root_of(owner).expect("known entity");
        state
            .collections
            .insert((EntityIdentity::new(root, id), attribute), elements);
    }

    /// Update a stored column in place.
    pub fn update(&self, entity: &'static str, id: impl Into<Value>, column: &'static str, value: Value) {
        let mut state = self.lock();
        let root = state.registry.root_of(entity).expect("known entity");
        if let Some(row) = state.rows.get_mut(&EntityIdentity::new(root, id)) {
            row.columns.insert(column, value);
        }
    }

    /// Delete a stored row.
    pub fn remove(&self, entity: &'static str, id: impl Into<Value>) {
        let mut state = self.lock();
        let root = state.registry.root_of(entity).expect("known entity");
        state.rows.remove(&EntityIdentity::new(root, id));
    }

    /// Join ignore-policy targets only `depth` levels deep; below that their
    /// id is sent as a plain column. Required for cyclic mappings.
    pub fn limit_join_depth(&self, depth: usize) {
        self.lock().join_depth = Some(depth);
    }

    /// Leave `column` out of every row built for `entity#id`.
    pub fn omit_column(&self, entity: &'static str, id: impl Into<Value>, column: &'static str) {
        let mut state = self.lock();
        let root = state.registry.root_of(entity).expect("known entity");
        state.omitted.insert((EntityIdentity::new(root, id), column));
    }

    /// Make the next statement fail with a connection error.
    pub fn fail_next(&self, message: &str) {
        self.lock().fail_next = Some(message.to_string());
    }

    pub fn statements(&self) -> Vec<Statement> {
        self.lock().statements.clone()
    }

    pub fn statement_count(&self) -> usize {
        self.lock().statements.len()
    }

    pub fn last_statement(&self) -> Statement {
        self.lock().statements.last().cloned().expect("a statement was issued")
    }

    pub fn clear_statements(&self) {
        self.lock().statements.clear();
    }
}

impl MockState {
    fn begin(&mut self, statement: Statement) -> Result<()> {
        if let Some(message) = self.fail_next.take() {
            return Err(Error::Query(QueryError::new(QueryErrorKind::Connection, message)));
        }
        self.statements.push(statement);
        Ok(())
    }

    fn find(&self, identity: &EntityIdentity) -> Option<(&'static str, &StoredRow)> {
        let root = self.registry.root_of(identity.entity()).ok()?;
        let stored = self.rows.get(&EntityIdentity::new(root, identity.id().clone()))?;
        self.registry
            .is_subtype(stored.entity, identity.entity())
            .then_some((stored.entity, stored))
    }

    fn build(&self, identity: &EntityIdentity, groups: &[&'static str]) -> Option<EntityRow> {
        self.build_at(identity, groups, 0)
    }

    fn build_at(&self, identity: &EntityIdentity, groups: &[&'static str], depth: usize) -> Option<EntityRow> {
        let (concrete, stored) = self.find(identity)?;
        let model = self.registry.model(concrete).ok()?;
        let key = EntityIdentity::new(model.root(), identity.id().clone());
        let joins_ignored = self.join_depth.is_none_or(|max| depth < max);
        let mut columns = Vec::new();
        let mut joined = Vec::new();

        for group in groups.iter().filter_map(|name| model.group(name)) {
            for &index in group.attribute_indices() {
                let attr = model.attributes()[index];
                if self.omitted.contains(&(key.clone(), attr.name)) {
                    continue;
                }
                let value = stored.columns.get(attr.name).cloned().unwrap_or(Value::Null);
                match attr.kind {
                    AssociationKind::Basic => columns.push((attr.name, value)),
                    AssociationKind::OwnedToOne
                        if attr.not_found == NotFoundPolicy::Fault || !joins_ignored =>
                    {
                        columns.push((attr.name, value));
                    }
                    AssociationKind::OwnedToOne | AssociationKind::InverseToOne => {
                        let target = attr.target.expect("association target");
                        let row = if value.is_null() {
                            None
                        } else {
                            self.build_at(&EntityIdentity::new(target, value), &["base"], depth + 1)
                        };
                        joined.push((attr.name, row));
                    }
                    AssociationKind::ToMany => {}
                }
            }
        }

        let row = Row::from_pairs(columns);
        let mut entity_row = EntityRow::new(EntityIdentity::new(concrete, identity.id().clone()), row);
        for (name, target) in joined {
            entity_row = entity_row.with_joined(name, target);
        }
        Some(entity_row)
    }
}

impl Loader for MockDb {
    fn load_groups(
        &mut self,
        identity: &EntityIdentity,
        groups: &[&LazyGroup],
    ) -> Result<Option<EntityRow>> {
        let names: Vec<&'static str> = groups.iter().map(|g| g.name()).collect();
        let mut state = self.lock();
        state.begin(Statement {
            kind: StatementKind::Groups,
            entity: identity.entity(),
            ids: vec![identity.id().clone()],
            groups: names.clone(),
        })?;
        Ok(state.build(identity, &names))
    }

    fn load_batch(
        &mut self,
        entity: &'static str,
        identities: &[EntityIdentity],
        group: &LazyGroup,
    ) -> Result<HashMap<EntityIdentity, EntityRow>> {
        let mut state = self.lock();
        state.begin(Statement {
            kind: StatementKind::Batch,
            entity,
            ids: identities.iter().map(|i| i.id().clone()).collect(),
            groups: vec![group.name()],
        })?;
        Ok(identities
            .iter()
            .filter_map(|identity| {
                state
                    .build(identity, &[group.name()])
                    .map(|row| (identity.clone(), row))
            })
            .collect())
    }

    fn load_collection(
        &mut self,
        owner: &EntityIdentity,
        attribute: &'static str,
    ) -> Result<Vec<EntityRow>> {
        let mut state = self.lock();
        state.begin(Statement {
            kind: StatementKind::Collection,
            entity: owner.entity(),
            ids: vec![owner.id().clone()],
            groups: vec![attribute],
        })?;
        let model = state.registry.model(owner.entity())?;
        let target = model
            .attribute(attribute)
            .and_then(|a| a.target)
            .expect("collection target");
        let root = state.registry.root_of(owner.entity())?;
        let ids = state
            .collections
            .get(&(EntityIdentity::new(root, owner.id().clone()), attribute))
            .cloned()
            .unwrap_or_default();
        Ok(ids
            .into_iter()
            .filter_map(|id| state.build(&EntityIdentity::new(target, id), &["base"]))
            .collect())
    }
}

// ============================================================================
// Mappings
// ============================================================================

/// Humans with two lazy groups, a collection and an inverse one-to-one;
/// ledgers with dynamic update; orders with an ignore-policy customer;
/// employees with an ignore-policy manager of their own type; batched tags
/// and articles.
pub fn registry() -> Arc<MetadataRegistry> {
    MetadataRegistry::builder()
        .entity(
            EntityModel::builder("Human")
                .identifier("name")
                .attribute(AttributeInfo::basic("sex"))
                .attribute(AttributeInfo::basic("age").lazy_group("age"))
                .attribute(AttributeInfo::basic("photo").lazy_group("photo"))
                .attribute(AttributeInfo::to_many("friends", "Human"))
                .attribute(AttributeInfo::inverse_to_one("passport", "Passport")),
        )
        .entity(
            EntityModel::builder("Passport")
                .attribute(AttributeInfo::basic("number"))
                .attribute(AttributeInfo::owned_to_one("owner", "Human")),
        )
        .entity(
            EntityModel::builder("Ledger")
                .dynamic_update(true)
                .attribute(AttributeInfo::basic("balance"))
                .attribute(AttributeInfo::basic("notes").lazy_group("notes")),
        )
        .entity(EntityModel::builder("Customer").attribute(AttributeInfo::basic("email")))
        .entity(
            EntityModel::builder("Order")
                .attribute(AttributeInfo::basic("total"))
                .attribute(
                    AttributeInfo::owned_to_one("customer", "Customer")
                        .not_found(NotFoundPolicy::Ignore),
                ),
        )
        .entity(
            EntityModel::builder("Employee")
                .attribute(AttributeInfo::basic("name"))
                .attribute(
                    AttributeInfo::owned_to_one("manager", "Employee")
                        .not_found(NotFoundPolicy::Ignore),
                ),
        )
        .entity(
            EntityModel::builder("Tag")
                .batch_size(10)
                .attribute(AttributeInfo::basic("label")),
        )
        .entity(
            EntityModel::builder("Article")
                .batch_size(5)
                .attribute(AttributeInfo::basic("title"))
                .attribute(AttributeInfo::basic("body").lazy_group("body")),
        )
        .entity(
            EntityModel::builder("Post")
                .attribute(AttributeInfo::basic("title"))
                .attribute(AttributeInfo::owned_to_one("tag", "Tag")),
        )
        .build()
        .expect("valid mapping")
}

/// Animal > Primate > Human hierarchy referenced three times by one entity.
pub fn hierarchy_registry() -> Arc<MetadataRegistry> {
    MetadataRegistry::builder()
        .entity(
            EntityModel::builder("Animal")
                .identifier("name")
                .abstract_type(true)
                .attribute(AttributeInfo::basic("sex")),
        )
        .entity(
            EntityModel::builder("Primate")
                .identifier("name")
                .extends("Animal")
                .attribute(AttributeInfo::basic("height_inches")),
        )
        .entity(
            EntityModel::builder("Human")
                .identifier("name")
                .extends("Primate")
                .attribute(AttributeInfo::basic("nick_name")),
        )
        .entity(
            EntityModel::builder("OtherEntity")
                .attribute(AttributeInfo::owned_to_one("animal", "Animal").cascade_merge(true))
                .attribute(AttributeInfo::owned_to_one("primate", "Primate").cascade_merge(true))
                .attribute(AttributeInfo::owned_to_one("human", "Human").cascade_merge(true)),
        )
        .build()
        .expect("valid mapping")
}

pub fn session(registry: &Arc<MetadataRegistry>, db: &MockDb) -> Session {
    Session::with_config(
        Arc::clone(registry),
        db.clone(),
        SessionConfig::default(),
    )
}

/// Humans "A" (age 5), "B" (age 30) and "C"; "A" is friends with "B" and "C".
pub fn seed_humans(db: &MockDb) {
    db.insert(
        "Human",
        "A",
        &[
            ("sex", Value::from("F")),
            ("age", Value::from(5_i64)),
            ("photo", Value::Bytes(vec![1, 2, 3])),
        ],
    );
    db.insert(
        "Human",
        "B",
        &[("sex", Value::from("M")), ("age", Value::from(30_i64))],
    );
    db.insert("Human", "C", &[("sex", Value::from("F"))]);
    db.insert_collection("Human", "A", "friends", vec![Value::from("B"), Value::from("C")]);
}
