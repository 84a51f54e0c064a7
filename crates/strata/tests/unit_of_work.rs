//! Unit-of-work behavior against the in-memory store.

mod common;

use common::{MemoryDb, seed_customer, shop};
use strata::prelude::*;
use strata::{Association, UsageErrorKind};

fn customer(id: i64, name: &str) -> EntityRef {
    EntityRef::new(Entity::new("Customer").with_id(id).with("name", name))
}

#[test]
fn identity_map_holds_one_instance_per_key() {
    let db = MemoryDb::new();
    seed_customer(&db, 1, "ann");
    let factory = shop(&db, SessionConfig::default());
    let mut session = factory.open_session();

    let a = session.get("Customer", 1_i64).unwrap().unwrap();
    let b = session.load("Customer", 1_i64).unwrap();
    assert!(a.ptr_eq(&b));
    assert_eq!(db.statements("select").len(), 1);

    let impostor = customer(1, "someone else");
    let err = session.save(&impostor).unwrap_err();
    assert_eq!(err.usage_kind(), Some(UsageErrorKind::NonUniqueObject));
    assert_eq!(session.context().entity_count(), 1);
}

#[test]
fn insertions_run_before_deletions() {
    let db = MemoryDb::new();
    seed_customer(&db, 5, "eve");
    let factory = shop(&db, SessionConfig::default());
    let mut session = factory.open_session();

    let eve = session.get("Customer", 5_i64).unwrap().unwrap();
    session.delete(&eve).unwrap();
    session.save(&customer(6, "fay")).unwrap();
    db.clear_log();
    session.flush().unwrap();

    assert_eq!(
        db.log(),
        vec![
            "insert into customer (id, name, version) values (?, ?, ?)",
            "delete from customer_tags where customer_id = ?",
            "delete from customer where id = ? and version = ?",
        ]
    );
    assert_eq!(db.value("customer", 6, "name"), Some(Value::from("fay")));
    assert_eq!(db.value("customer", 5, "name"), None);
}

#[test]
fn referenced_entity_is_inserted_first() {
    let db = MemoryDb::new();
    let factory = shop(&db, SessionConfig::default());
    let mut session = factory.open_session();

    let account = EntityRef::new(Entity::new("Account").with("owner", "ann"));
    let payment = EntityRef::new(
        Entity::new("Payment")
            .with_id(10_i64)
            .with("amount", 25_i64)
            .with_reference("account", Association::to(&account)),
    );
    session.save(&payment).unwrap();
    let id = session.save(&account).unwrap();
    assert_eq!(id, Value::BigInt(1));
    session.flush().unwrap();

    assert_eq!(
        db.log(),
        vec![
            "select nextval('account_seq')",
            "insert into account (id, owner) values (?, ?)",
            "insert into payment (id, amount, account_id) values (?, ?, ?)",
        ]
    );
    assert_eq!(db.value("payment", 10, "account_id"), Some(Value::BigInt(1)));
}

#[test]
fn unsaved_reference_fails_flush() {
    let db = MemoryDb::new();
    let factory = shop(&db, SessionConfig::default());
    let mut session = factory.open_session();

    let stranger = EntityRef::new(Entity::new("Customer").with("name", "nobody"));
    let order = EntityRef::new(
        Entity::new("Order")
            .with_id(1_i64)
            .with_reference("customer", Association::to(&stranger)),
    );
    session.save(&order).unwrap();
    let err = session.flush().unwrap_err();
    assert_eq!(err.usage_kind(), Some(UsageErrorKind::TransientReference));
}

#[test]
fn dirty_entity_is_written_with_next_version() {
    let db = MemoryDb::new();
    seed_customer(&db, 1, "ann");
    let factory = shop(&db, SessionConfig::default());
    let mut session = factory.open_session();

    let ann = session.get("Customer", 1_i64).unwrap().unwrap();
    ann.write().set("name", "anne");
    db.clear_log();
    session.flush().unwrap();

    assert_eq!(
        db.log(),
        vec!["update customer set name = ?, version = ? where id = ? and version = ?"]
    );
    assert_eq!(db.value("customer", 1, "name"), Some(Value::from("anne")));
    assert_eq!(db.value("customer", 1, "version"), Some(Value::BigInt(1)));
    assert!(!session.is_dirty().unwrap());
}

#[test]
fn concurrent_change_breaks_session() {
    let db = MemoryDb::new();
    seed_customer(&db, 1, "ann");
    let factory = shop(&db, SessionConfig::default());
    let mut session = factory.open_session();

    session.begin_transaction().unwrap();
    let ann = session.get("Customer", 1_i64).unwrap().unwrap();
    db.set("customer", 1, "version", Value::BigInt(7));
    ann.write().set("name", "anne");

    let err = session.flush().unwrap_err();
    assert!(err.is_stale_state());
    assert!(session.is_broken());
    assert_eq!(
        session.get("Customer", 1_i64).unwrap_err().usage_kind(),
        Some(UsageErrorKind::SessionBroken)
    );
    session.rollback().unwrap();
    session.close().unwrap();
}

#[test]
fn rollback_discards_store_writes() {
    let db = MemoryDb::new();
    let factory = shop(&db, SessionConfig::default());
    let mut session = factory.open_session();

    session.begin_transaction().unwrap();
    session.save(&customer(1, "ann")).unwrap();
    session.commit().unwrap();
    assert_eq!(db.count("customer"), 1);

    session.begin_transaction().unwrap();
    session.save(&customer(2, "bob")).unwrap();
    session.flush().unwrap();
    assert_eq!(db.count("customer"), 2);
    session.rollback().unwrap();
    assert_eq!(db.count("customer"), 1);
}

#[test]
fn connection_returned_after_transaction() {
    let db = MemoryDb::new();
    let provider = db.provider();
    let mut metamodel = Metamodel::new();
    metamodel.register_entity(Arc::new(
        TablePersister::new("Customer", "customer").property(PropertyMapping::basic("name", SqlType::Text)),
    ));
    let factory = SessionFactory::builder(metamodel, provider.clone()).build().unwrap();
    let mut session = factory.open_session();

    session.begin_transaction().unwrap();
    session.save(&customer(1, "ann")).unwrap();
    assert_eq!(provider.outstanding(), 1);
    session.commit().unwrap();
    assert_eq!(provider.outstanding(), 0);
    assert!(!session.is_connected());
}

#[test]
fn collection_changes_are_written_incrementally() {
    let db = MemoryDb::new();
    let factory = shop(&db, SessionConfig::default());

    let mut session = factory.open_session();
    let tags = CollectionRef::new("Customer.tags", vec![Element::Value("a".into()), Element::Value("b".into())]);
    let ann = EntityRef::new(
        Entity::new("Customer")
            .with_id(1_i64)
            .with("name", "ann")
            .with_collection("tags", tags),
    );
    session.save(&ann).unwrap();
    session.flush().unwrap();
    session.close().unwrap();
    assert_eq!(db.count("customer_tags"), 2);

    let mut session = factory.open_session();
    let loaded = session.get("Customer", 1_i64).unwrap().unwrap();
    let tags = loaded.read().collection("tags").cloned().unwrap();
    session.initialize_collection(&tags).unwrap();
    assert_eq!(tags.read().len().unwrap(), 2);

    tags.write().push(Element::Value("c".into())).unwrap();
    db.clear_log();
    session.flush().unwrap();
    assert_eq!(db.log(), vec!["insert into customer_tags (customer_id, tag) values (?, ?)"]);
    assert_eq!(db.count("customer_tags"), 3);
}

#[test]
fn merge_copies_detached_state_onto_managed_instance() {
    let db = MemoryDb::new();
    seed_customer(&db, 1, "ann");
    let factory = shop(&db, SessionConfig::default());

    let detached = {
        let mut session = factory.open_session();
        let ann = session.get("Customer", 1_i64).unwrap().unwrap();
        session.close().unwrap();
        ann
    };
    detached.write().set("name", "anne");

    let mut session = factory.open_session();
    let managed = session.merge(&detached).unwrap();
    assert!(!managed.ptr_eq(&detached));
    assert_eq!(managed.read().get("name"), Some(&Value::from("anne")));
    session.flush().unwrap();
    assert_eq!(db.value("customer", 1, "name"), Some(Value::from("anne")));
}
