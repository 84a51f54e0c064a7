//! Scrollable results over the in-memory store.

mod common;

use common::{MemoryDb, seed_customer, shop};
use strata::UsageErrorKind;
use strata::prelude::*;

const ALL: &str = "select * from customer order by id";

fn store_with_customers(n: i64) -> MemoryDb {
    let db = MemoryDb::new();
    for id in 1..=n {
        seed_customer(&db, id, &format!("c{id}"));
    }
    db
}

fn current_id(results: &mut strata::ScrollableResults<'_>) -> Option<Value> {
    results
        .get()
        .unwrap()
        .and_then(|r| r.as_entity().and_then(EntityRef::id))
}

#[test]
fn previous_from_first_moves_before_the_start() {
    let db = store_with_customers(3);
    let factory = shop(&db, SessionConfig::default());
    let mut session = factory.open_session();
    let mut query = session.create_query(ALL).unwrap();
    let mut results = query.scroll(ScrollMode::Insensitive).unwrap();

    assert!(results.first().unwrap());
    assert!(results.is_first());
    assert_eq!(current_id(&mut results), Some(Value::BigInt(1)));
    assert!(!results.previous().unwrap());
    assert_eq!(results.position(), 0);
    assert!(results.get().unwrap().is_none());
}

#[test]
fn next_after_last_moves_past_the_end() {
    let db = store_with_customers(3);
    let factory = shop(&db, SessionConfig::default());
    let mut session = factory.open_session();
    let mut query = session.create_query(ALL).unwrap();
    let mut results = query.scroll(ScrollMode::Insensitive).unwrap();

    assert!(results.last().unwrap());
    assert!(results.is_last().unwrap());
    assert_eq!(current_id(&mut results), Some(Value::BigInt(3)));
    assert!(!results.next().unwrap());
    assert_eq!(results.position(), 4);

    assert!(results.previous().unwrap());
    assert_eq!(current_id(&mut results), Some(Value::BigInt(3)));
}

#[test]
fn row_number_minus_one_matches_last() {
    let db = store_with_customers(4);
    let factory = shop(&db, SessionConfig::default());
    let mut session = factory.open_session();
    let mut query = session.create_query(ALL).unwrap();
    let mut results = query.scroll(ScrollMode::Insensitive).unwrap();

    assert!(results.set_row_number(-1).unwrap());
    let by_number = (results.position(), current_id(&mut results));
    results.before_first().unwrap();
    assert!(results.last().unwrap());
    assert_eq!(by_number, (results.position(), current_id(&mut results)));

    assert!(results.set_row_number(2).unwrap());
    assert_eq!(current_id(&mut results), Some(Value::BigInt(2)));
}

#[test]
fn scroll_by_zero_is_an_error() {
    let db = store_with_customers(2);
    let factory = shop(&db, SessionConfig::default());
    let mut session = factory.open_session();
    let mut query = session.create_query(ALL).unwrap();
    let mut results = query.scroll(ScrollMode::Insensitive).unwrap();

    let err = results.scroll(0).unwrap_err();
    assert_eq!(err.usage_kind(), Some(UsageErrorKind::InvalidScroll));
    assert!(results.scroll(2).unwrap());
    assert_eq!(current_id(&mut results), Some(Value::BigInt(2)));
    assert!(results.scroll(-1).unwrap());
    assert_eq!(current_id(&mut results), Some(Value::BigInt(1)));
}

#[test]
fn forward_only_cursor_cannot_go_back() {
    let db = store_with_customers(2);
    let factory = shop(&db, SessionConfig::default());
    let mut session = factory.open_session();
    let mut query = session.create_query(ALL).unwrap();
    let mut results = query.scroll(ScrollMode::ForwardOnly).unwrap();

    assert!(results.next().unwrap());
    let err = results.previous().unwrap_err();
    assert_eq!(err.usage_kind(), Some(UsageErrorKind::ForwardOnly));
    assert!(results.next().unwrap());
    assert!(!results.next().unwrap());
}

#[test]
fn hydrated_rows_share_the_identity_map() {
    let db = store_with_customers(2);
    let factory = shop(&db, SessionConfig::default());
    let mut session = factory.open_session();
    let first = session.get("Customer", 1_i64).unwrap().unwrap();

    let mut query = session.create_query(ALL).unwrap();
    let mut results = query.scroll(ScrollMode::Insensitive).unwrap();
    assert!(results.next().unwrap());
    let row = results.get().unwrap().unwrap();
    assert!(row.as_entity().unwrap().ptr_eq(&first));
}

#[test]
fn connection_is_released_when_the_cursor_drops() {
    let db = store_with_customers(3);
    let factory = shop(&db, SessionConfig::default());
    let mut session = factory.open_session();
    {
        let mut query = session.create_query(ALL).unwrap();
        let mut results = query.scroll(ScrollMode::Insensitive).unwrap();
        assert!(results.next().unwrap());
        assert!(results.next().unwrap());
        assert!(!results.is_closed());
    }
    assert!(!session.is_connected());
    session.get("Customer", 3_i64).unwrap().unwrap();
    assert!(!session.is_connected());
}
