mod common;

use common::{MockDb, StatementKind, hierarchy_registry, registry, seed_humans, session};
use lazyorm_core::{OverallState, Value};
use lazyorm_session::{EntityRef, Instance, LazilyInterceptable};

fn transient_human(registry: &lazyorm_core::MetadataRegistry, sex: &str, age: i64) -> EntityRef {
    let human = Instance::transient(registry, "Human", "A").unwrap();
    human.set("sex", sex).unwrap();
    human.set("age", age).unwrap();
    EntityRef::from(human)
}

#[test]
fn merging_into_a_placeholder_loads_base_then_copies_detached_groups() {
    let registry = registry();
    let db = MockDb::new(&registry);
    db.insert("Human", "A", &[("sex", Value::from("F")), ("age", Value::from(1_i64))]);
    let session = session(&registry, &db);

    let managed = session.get_reference("Human", "A").unwrap();
    let detached = transient_human(&registry, "M", 5);
    let merged = session.merge(&detached).unwrap();

    assert!(merged.ptr_eq(&managed));
    assert!(!merged.ptr_eq(&detached));
    assert_eq!(db.statement_count(), 1);
    assert_eq!(db.last_statement().groups, vec!["base"]);

    assert_eq!(merged.get("age").unwrap(), Value::from(5_i64));
    assert_eq!(merged.get("sex").unwrap(), Value::from("M"));
    assert_eq!(merged.overall_state(), OverallState::Initialized);
    assert!(merged.get_collection("friends").unwrap().is_empty().unwrap());
    assert_eq!(db.statement_count(), 1);

    let again = transient_human(&registry, "M", 7);
    let merged = session.merge(&again).unwrap();
    assert!(merged.ptr_eq(&managed));
    assert_eq!(merged.get("age").unwrap(), Value::from(7_i64));
    assert_eq!(db.statement_count(), 1);
}

#[test]
fn merging_the_same_state_twice_is_idempotent() {
    let registry = registry();
    let db = MockDb::new(&registry);
    db.insert("Human", "A", &[("sex", Value::from("F")), ("age", Value::from(1_i64))]);
    let session = session(&registry, &db);

    let detached = transient_human(&registry, "M", 5);
    let first = session.merge(&detached).unwrap();
    let dirty = first.dirty_attributes();
    let second = session.merge(&detached).unwrap();

    assert!(first.ptr_eq(&second));
    assert_eq!(second.dirty_attributes(), dirty);
    assert_eq!(second.get("sex").unwrap(), Value::from("M"));
    assert_eq!(second.get("age").unwrap(), Value::from(5_i64));
    assert_eq!(db.statement_count(), 1);
}

#[test]
fn merging_a_managed_reference_returns_it_untouched() {
    let registry = registry();
    let db = MockDb::new(&registry);
    seed_humans(&db);
    let session = session(&registry, &db);

    let managed = session.get_reference("Human", "A").unwrap();
    let merged = session.merge(&managed).unwrap();
    assert!(merged.ptr_eq(&managed));
    assert!(!merged.is_initialized());
    assert_eq!(db.statement_count(), 0);
}

#[test]
fn uninitialized_detached_reference_triggers_no_load() {
    let registry = registry();
    let db = MockDb::new(&registry);
    seed_humans(&db);
    let first = session(&registry, &db);
    let second = session(&registry, &db);

    let detached = first.get_reference("Human", "A").unwrap();
    let merged = second.merge(&detached).unwrap();

    assert!(!merged.ptr_eq(&detached));
    assert!(second.contains(&merged));
    assert!(!merged.is_initialized());
    assert!(!detached.is_initialized());
    assert_eq!(db.statement_count(), 0);
}

#[test]
fn groups_loaded_only_on_the_managed_side_are_kept() {
    let registry = registry();
    let db = MockDb::new(&registry);
    seed_humans(&db);
    let first = session(&registry, &db);
    let second = session(&registry, &db);

    let detached = first.get("Human", "A").unwrap().unwrap();
    detached.set("sex", "X").unwrap();
    assert!(!detached.is_group_initialized("age"));

    let managed = second.get("Human", "A").unwrap().unwrap();
    assert_eq!(managed.get("age").unwrap(), Value::from(5_i64));
    db.clear_statements();

    let merged = second.merge(&detached).unwrap();
    assert!(merged.ptr_eq(&managed));
    assert_eq!(merged.get("sex").unwrap(), Value::from("X"));
    assert!(merged.is_group_initialized("age"));
    assert_eq!(merged.get("age").unwrap(), Value::from(5_i64));
    assert!(!merged.is_group_initialized("photo"));
    assert_eq!(merged.dirty_attributes(), vec!["sex"]);
    assert_eq!(db.statement_count(), 0);
}

#[test]
fn merging_onto_a_missing_row_faults() {
    let registry = registry();
    let db = MockDb::new(&registry);
    let session = session(&registry, &db);

    let detached = transient_human(&registry, "F", 3);
    let err = session.merge(&detached).unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(db.statement_count(), 1);
}

#[test]
fn merging_after_close_faults_with_context_closed() {
    let registry = registry();
    let db = MockDb::new(&registry);
    let session = session(&registry, &db);
    session.close();

    let detached = transient_human(&registry, "F", 3);
    assert!(session.merge(&detached).unwrap_err().is_context_closed());
    assert_eq!(db.statement_count(), 0);
}

#[test]
fn loaded_collections_are_rebound_to_managed_elements() {
    let registry = registry();
    let db = MockDb::new(&registry);
    seed_humans(&db);
    let first = session(&registry, &db);

    let detached = first.get("Human", "A").unwrap().unwrap();
    let friends = detached.get_collection("friends").unwrap();
    assert_eq!(friends.len().unwrap(), 2);
    first.close();
    db.clear_statements();

    let second = session(&registry, &db);
    let merged = second.merge(&detached).unwrap();
    assert_eq!(db.statement_count(), 1);
    assert_eq!(db.last_statement().kind, StatementKind::Groups);

    let collection = merged.get_collection("friends").unwrap();
    assert!(collection.is_initialized());
    assert!(!collection.ptr_eq(&friends));
    let elements = collection.elements().unwrap();
    assert_eq!(elements.len(), 2);
    let managed_b = second.get_reference("Human", "B").unwrap();
    assert!(elements[0].ptr_eq(&managed_b));
    assert!(!managed_b.is_initialized());
    assert_eq!(db.statement_count(), 1);
}

// ============================================================================
// Proxies and inheritance
// ============================================================================

#[test]
fn proxy_reports_its_concrete_type_once_loaded() {
    let registry = hierarchy_registry();
    let db = MockDb::new(&registry);
    db.insert(
        "Human",
        "A Human",
        &[
            ("sex", Value::from("F")),
            ("height_inches", Value::from(65_i64)),
            ("nick_name", Value::from("Jane")),
        ],
    );
    let session = session(&registry, &db);

    let animal = session.get_reference("Animal", "A Human").unwrap();
    assert!(animal.is_proxy());
    assert_eq!(animal.concrete_type(), "Animal");
    assert!(session.get_reference("Primate", "A Human").unwrap().ptr_eq(&animal));
    assert!(session.get_reference("Human", "A Human").unwrap().ptr_eq(&animal));
    assert_eq!(db.statement_count(), 0);

    session.force_initialize(&animal).unwrap();
    assert_eq!(animal.concrete_type(), "Human");
    assert_eq!(animal.overall_state(), OverallState::Initialized);
    assert_eq!(animal.get("nick_name").unwrap(), Value::from("Jane"));

    let implementation = session.unproxy(&animal).unwrap();
    assert_eq!(implementation.entity_type(), "Human");
    assert!(session.contains(&EntityRef::from(implementation)));
    assert_eq!(db.statement_count(), 1);
}

#[test]
fn abstract_and_unknown_types_are_rejected() {
    let registry = hierarchy_registry();
    let db = MockDb::new(&registry);
    let session = session(&registry, &db);

    assert!(Instance::transient(&registry, "Animal", "x").is_err());
    assert!(session.get_reference("Nope", "x").is_err());
}

#[test]
fn merged_associations_resolve_to_initialized_implementations() {
    let registry = hierarchy_registry();
    let db = MockDb::new(&registry);
    db.insert(
        "Human",
        "A Human",
        &[
            ("sex", Value::from("M")),
            ("height_inches", Value::from(70_i64)),
            ("nick_name", Value::from("Tarzan")),
        ],
    );
    db.insert(
        "OtherEntity",
        1_i64,
        &[
            ("animal", Value::from("A Human")),
            ("primate", Value::from("A Human")),
            ("human", Value::from("A Human")),
        ],
    );

    let first = session(&registry, &db);
    let entity = first.get("OtherEntity", 1_i64).unwrap().unwrap();
    assert_eq!(db.statement_count(), 1);

    let animal = entity.get_reference("animal").unwrap().unwrap();
    let primate = entity.get_reference("primate").unwrap().unwrap();
    let human = entity.get_reference("human").unwrap().unwrap();
    assert!(animal.is_proxy());
    assert!(animal.ptr_eq(&primate));
    assert!(animal.ptr_eq(&human));

    assert_eq!(animal.get("sex").unwrap(), Value::from("M"));
    assert_eq!(db.statement_count(), 2);
    assert_eq!(human.concrete_type(), "Human");
    first.close();
    db.clear_statements();

    let second = session(&registry, &db);
    let merged = second.merge(&entity).unwrap();
    assert_eq!(db.statement_count(), 2);

    let animal = merged.get_reference("animal").unwrap().unwrap();
    let primate = merged.get_reference("primate").unwrap().unwrap();
    let human = merged.get_reference("human").unwrap().unwrap();
    assert!(!animal.is_proxy());
    assert!(animal.ptr_eq(&primate));
    assert!(animal.ptr_eq(&human));
    assert_eq!(animal.concrete_type(), "Human");
    assert_eq!(animal.get("nick_name").unwrap(), Value::from("Tarzan"));
    assert!(second.contains(&animal));
    assert_eq!(db.statement_count(), 2);
}
