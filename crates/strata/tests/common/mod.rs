//! In-memory store shared by the integration tests.
//!
//! Interprets the SQL produced by the bundled table persisters and the
//! simple native statements the tests issue:
//!
//! - `insert into t (a, b) values (?, ?)`
//! - `update t set a = ?, b = ? where c = ? and d = ?`
//! - `delete from t where c = ?`
//! - `select * | a, b from t [where ...]` with `c = ?`, `c in (?, ...)`
//!   and `c = <integer>` conditions joined by `and`
//! - `select nextval('seq')`
//!
//! Every statement is journaled; transactions snapshot the tables at
//! `begin` and restore them on `rollback`.

#![allow(dead_code)]

use regex::Regex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use strata::{
    Connection, ConnectionProvider, ElementKind, IsolationLevel, Metamodel, NativeSqlTranslator,
    PropertyMapping, Row, RowStream, SessionConfig, SessionFactory, SqlType, Statement, StoreError,
    StoreResult, TableCollectionPersister, TablePersister, Value, VecRowStream,
};

fn regex(cell: &'static OnceLock<Regex>, pattern: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(pattern).unwrap())
}

fn insert_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(&RE, r"^insert into (\w+) \(([^)]*)\) values \(([^)]*)\)$")
}

fn update_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(&RE, r"^update (\w+) set (.+?)(?: where (.+))?$")
}

fn delete_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(&RE, r"^delete from (\w+)(?: where (.+))?$")
}

fn select_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(&RE, r"^select (.+?) from (\w+)(?: where (.+?))?(?: order by (\w+))?$")
}

fn nextval_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(&RE, r"^select nextval\('(\w+)'\)$")
}

fn in_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(&RE, r"^(\w+) in \(([?, ]+)\)$")
}

fn eq_param_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(&RE, r"^(\w+) = \?$")
}

fn eq_literal_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(&RE, r"^(\w+) = (-?\d+)$")
}

fn as_int(v: &Value) -> Option<i64> {
    match v {
        Value::TinyInt(i) => Some(i64::from(*i)),
        Value::SmallInt(i) => Some(i64::from(*i)),
        Value::Int(i) => Some(i64::from(*i)),
        Value::BigInt(i) => Some(*i),
        _ => None,
    }
}

fn same(a: &Value, b: &Value) -> bool {
    match (as_int(a), as_int(b)) {
        (Some(x), Some(y)) => x == y,
        _ => a.identity_eq(b),
    }
}

#[derive(Debug, Clone, Default)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl Table {
    fn column_index(&mut self, name: &str) -> usize {
        if let Some(i) = self.columns.iter().position(|c| c == name) {
            return i;
        }
        self.columns.push(name.to_string());
        for row in &mut self.rows {
            row.push(Value::Null);
        }
        self.columns.len() - 1
    }

    fn value(&self, row: &[Value], column: &str) -> Value {
        self.columns
            .iter()
            .position(|c| c == column)
            .and_then(|i| row.get(i).cloned())
            .unwrap_or(Value::Null)
    }
}

enum Condition {
    Eq(String, Value),
    In(String, Vec<Value>),
}

impl Condition {
    fn matches(&self, table: &Table, row: &[Value]) -> bool {
        match self {
            Condition::Eq(column, value) => same(&table.value(row, column), value),
            Condition::In(column, values) => {
                let current = table.value(row, column);
                values.iter().any(|v| same(&current, v))
            }
        }
    }
}

/// Parse a `where` clause, consuming parameters from `params`.
fn conditions(clause: Option<&str>, params: &mut impl Iterator<Item = Value>) -> Vec<Condition> {
    let Some(clause) = clause else {
        return Vec::new();
    };
    clause
        .split(" and ")
        .map(|part| {
            let part = part.trim().trim_start_matches('(').trim_end_matches(')');
            if let Some(c) = in_re().captures(part) {
                let n = c[2].matches('?').count();
                let values = (0..n).map(|_| params.next().unwrap()).collect();
                Condition::In(c[1].to_string(), values)
            } else if let Some(c) = eq_param_re().captures(part) {
                Condition::Eq(c[1].to_string(), params.next().unwrap())
            } else if let Some(c) = eq_literal_re().captures(part) {
                Condition::Eq(c[1].to_string(), Value::BigInt(c[2].parse().unwrap()))
            } else {
                panic!("unsupported condition: {part}")
            }
        })
        .collect()
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    pub tables: BTreeMap<String, Table>,
    backup: Option<BTreeMap<String, Table>>,
    pub log: Vec<String>,
    pub params: Vec<Vec<Value>>,
    next_key: i64,
    sequences: BTreeMap<String, i64>,
    fail_on: Option<String>,
}

impl MemoryStore {
    fn record(&mut self, stmt: &Statement) -> StoreResult<()> {
        self.log.push(stmt.sql.clone());
        self.params.push(stmt.params.clone());
        if self.fail_on.as_ref().is_some_and(|f| stmt.sql.contains(f.as_str())) {
            return Err(StoreError::new("duplicate key value violates unique constraint").with_sqlstate("23505"));
        }
        Ok(())
    }

    fn insert(&mut self, stmt: &Statement, generate: bool) -> Option<Value> {
        let c = insert_re().captures(&stmt.sql).unwrap();
        let table = self.tables.entry(c[1].to_string()).or_default();
        let mut row = vec![Value::Null; table.columns.len()];
        let mut generated = None;
        if generate {
            self.next_key += 1;
            let key = Value::BigInt(self.next_key);
            let i = table.column_index("id");
            row.resize(table.columns.len(), Value::Null);
            row[i] = key.clone();
            generated = Some(key);
        }
        for (column, value) in c[2].split(", ").zip(stmt.params.iter()) {
            let i = table.column_index(column);
            row.resize(table.columns.len(), Value::Null);
            row[i] = value.clone();
        }
        table.rows.push(row);
        generated
    }

    fn update(&mut self, stmt: &Statement) -> u64 {
        let c = update_re().captures(&stmt.sql).unwrap();
        let mut params = stmt.params.clone().into_iter();
        let assignments: Vec<(String, Value)> = c[2]
            .split(", ")
            .map(|a| {
                let (column, rhs) = a.split_once(" = ").unwrap();
                let value = if rhs == "?" {
                    params.next().unwrap()
                } else {
                    Value::Text(rhs.trim_matches('\'').to_string())
                };
                (column.to_string(), value)
            })
            .collect();
        let filter = conditions(c.get(3).map(|m| m.as_str()), &mut params);
        let Some(table) = self.tables.get_mut(&c[1]) else {
            return 0;
        };
        let indexes: Vec<usize> = assignments.iter().map(|(col, _)| table.column_index(col)).collect();
        let mut count = 0;
        for r in 0..table.rows.len() {
            table.rows[r].resize(table.columns.len(), Value::Null);
            if filter.iter().all(|f| f.matches(table, &table.rows[r])) {
                for (i, (_, value)) in indexes.iter().zip(&assignments) {
                    table.rows[r][*i] = value.clone();
                }
                count += 1;
            }
        }
        count
    }

    fn delete(&mut self, stmt: &Statement) -> u64 {
        let c = delete_re().captures(&stmt.sql).unwrap();
        let mut params = stmt.params.clone().into_iter();
        let filter = conditions(c.get(2).map(|m| m.as_str()), &mut params);
        let Some(table) = self.tables.get_mut(&c[1]) else {
            return 0;
        };
        let before = table.rows.len();
        let snapshot = table.clone();
        table
            .rows
            .retain(|row| !filter.iter().all(|f| f.matches(&snapshot, row)));
        (before - table.rows.len()) as u64
    }

    fn select(&mut self, stmt: &Statement) -> Vec<Row> {
        if let Some(c) = nextval_re().captures(&stmt.sql) {
            let next = self.sequences.entry(c[1].to_string()).or_insert(0);
            *next += 1;
            return vec![Row::new(vec!["nextval".into()], vec![Value::BigInt(*next)])];
        }
        let c = select_re().captures(&stmt.sql).unwrap();
        let mut params = stmt.params.clone().into_iter();
        let filter = conditions(c.get(3).map(|m| m.as_str()), &mut params);
        let Some(table) = self.tables.get(&c[2]) else {
            return Vec::new();
        };
        let columns: Vec<String> = if &c[1] == "*" {
            table.columns.clone()
        } else {
            c[1].split(", ").map(str::to_string).collect()
        };
        let mut rows: Vec<&Vec<Value>> = table
            .rows
            .iter()
            .filter(|row| filter.iter().all(|f| f.matches(table, row)))
            .collect();
        if let Some(order) = c.get(4) {
            rows.sort_by_key(|row| as_int(&table.value(row, order.as_str())));
        }
        let selected: Vec<Row> = rows
            .into_iter()
            .map(|row| {
                let values = columns.iter().map(|col| table.value(row, col)).collect();
                Row::new(columns.clone(), values)
            })
            .collect();
        let skip = stmt.first_row.unwrap_or(0);
        let take = stmt.max_rows.unwrap_or(usize::MAX);
        selected.into_iter().skip(skip).take(take).collect()
    }
}

/// Handle to a shared in-memory store.
#[derive(Debug, Clone, Default)]
pub struct MemoryDb {
    store: Arc<Mutex<MemoryStore>>,
}

impl MemoryDb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn provider(&self) -> Arc<MemoryProvider> {
        Arc::new(MemoryProvider {
            store: Arc::clone(&self.store),
            acquired: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
        })
    }

    /// Insert a row directly, bypassing the journal.
    pub fn seed(&self, table: &str, columns: &[&str], values: Vec<Value>) {
        let mut store = self.store.lock().unwrap();
        let table = store.tables.entry(table.to_string()).or_default();
        let mut row = vec![Value::Null; table.columns.len()];
        for (column, value) in columns.iter().zip(values) {
            let i = table.column_index(column);
            row.resize(table.columns.len(), Value::Null);
            row[i] = value;
        }
        table.rows.push(row);
    }

    /// Value of `column` in the row of `table` whose `id` is `id`.
    pub fn value(&self, table: &str, id: i64, column: &str) -> Option<Value> {
        let store = self.store.lock().unwrap();
        let table = store.tables.get(table)?;
        table
            .rows
            .iter()
            .find(|row| as_int(&table.value(row, "id")) == Some(id))
            .map(|row| table.value(row, column))
    }

    /// Overwrite one column of the row whose `id` is `id`.
    pub fn set(&self, table: &str, id: i64, column: &str, value: Value) {
        let mut store = self.store.lock().unwrap();
        let table = store.tables.get_mut(table).unwrap();
        let i = table.column_index(column);
        let id_index = table.column_index("id");
        for row in &mut table.rows {
            row.resize(i.max(id_index) + 1, Value::Null);
            if as_int(&row[id_index]) == Some(id) {
                row[i] = value.clone();
            }
        }
    }

    pub fn count(&self, table: &str) -> usize {
        self.store
            .lock()
            .unwrap()
            .tables
            .get(table)
            .map_or(0, |t| t.rows.len())
    }

    pub fn log(&self) -> Vec<String> {
        self.store.lock().unwrap().log.clone()
    }

    /// Journal entries that start with `prefix`.
    pub fn statements(&self, prefix: &str) -> Vec<String> {
        self.log().into_iter().filter(|s| s.starts_with(prefix)).collect()
    }

    pub fn last_params(&self) -> Vec<Value> {
        self.store.lock().unwrap().params.last().cloned().unwrap_or_default()
    }

    pub fn clear_log(&self) {
        let mut store = self.store.lock().unwrap();
        store.log.clear();
        store.params.clear();
    }

    /// Fail every statement containing `fragment` with a constraint violation.
    pub fn fail_on(&self, fragment: &str) {
        self.store.lock().unwrap().fail_on = Some(fragment.to_string());
    }
}

/// Provider lending connections to one [`MemoryDb`].
#[derive(Debug)]
pub struct MemoryProvider {
    store: Arc<Mutex<MemoryStore>>,
    acquired: AtomicUsize,
    released: AtomicUsize,
}

impl MemoryProvider {
    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    /// Connections lent and not yet returned.
    pub fn outstanding(&self) -> usize {
        self.acquired() - self.released.load(Ordering::SeqCst)
    }
}

impl ConnectionProvider for MemoryProvider {
    fn acquire(&self) -> StoreResult<Box<dyn Connection>> {
        self.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryConnection {
            store: Arc::clone(&self.store),
        }))
    }

    fn release(&self, _conn: Box<dyn Connection>) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

struct MemoryConnection {
    store: Arc<Mutex<MemoryStore>>,
}

impl Connection for MemoryConnection {
    fn query(&mut self, stmt: &Statement) -> StoreResult<Box<dyn RowStream>> {
        let mut store = self.store.lock().unwrap();
        store.record(stmt)?;
        Ok(Box::new(VecRowStream::new(store.select(stmt))))
    }

    fn execute(&mut self, stmt: &Statement) -> StoreResult<u64> {
        let mut store = self.store.lock().unwrap();
        store.record(stmt)?;
        let sql = stmt.sql.as_str();
        Ok(if sql.starts_with("insert") {
            store.insert(stmt, false);
            1
        } else if sql.starts_with("update") {
            store.update(stmt)
        } else if sql.starts_with("delete") {
            store.delete(stmt)
        } else {
            0
        })
    }

    fn insert(&mut self, stmt: &Statement) -> StoreResult<Option<Value>> {
        let mut store = self.store.lock().unwrap();
        store.record(stmt)?;
        Ok(store.insert(stmt, true))
    }

    fn begin(&mut self, _isolation: Option<IsolationLevel>) -> StoreResult<()> {
        let mut store = self.store.lock().unwrap();
        store.log.push("begin".into());
        store.params.push(Vec::new());
        store.backup = Some(store.tables.clone());
        Ok(())
    }

    fn commit(&mut self) -> StoreResult<()> {
        let mut store = self.store.lock().unwrap();
        store.log.push("commit".into());
        store.params.push(Vec::new());
        store.backup = None;
        Ok(())
    }

    fn rollback(&mut self) -> StoreResult<()> {
        let mut store = self.store.lock().unwrap();
        store.log.push("rollback".into());
        store.params.push(Vec::new());
        if let Some(tables) = store.backup.take() {
            store.tables = tables;
        }
        Ok(())
    }
}

// ============================================================================
// Mapping used across the integration tests
// ============================================================================

/// Customers with tags and a version column, orders referencing customers,
/// and sequence-keyed accounts referenced by payments.
pub fn shop(db: &MemoryDb, config: SessionConfig) -> Arc<SessionFactory> {
    let mut metamodel = Metamodel::new();
    metamodel.register_entity(Arc::new(
        TablePersister::new("Customer", "customer")
            .property(PropertyMapping::basic("name", SqlType::Text))
            .version("version")
            .property(PropertyMapping::collection("tags", "Customer.tags")),
    ));
    metamodel.register_entity(Arc::new(
        TablePersister::new("Order", "orders")
            .property(PropertyMapping::basic("total", SqlType::BigInt))
            .property(PropertyMapping::many_to_one("customer", "Customer")),
    ));
    metamodel.register_entity(Arc::new(
        TablePersister::new("Account", "account")
            .sequence("account_seq")
            .property(PropertyMapping::basic("owner", SqlType::Text)),
    ));
    metamodel.register_entity(Arc::new(
        TablePersister::new("Payment", "payment")
            .property(PropertyMapping::basic("amount", SqlType::BigInt))
            .property(PropertyMapping::many_to_one("account", "Account")),
    ));
    metamodel.register_collection(Arc::new(TableCollectionPersister::new(
        "Customer.tags",
        "Customer",
        "customer_tags",
        "customer_id",
        "tag",
        ElementKind::Value(SqlType::Text),
    )));

    let native = NativeSqlTranslator::new()
        .with_entity("customer", "Customer", "id")
        .with_entity("orders", "Order", "id")
        .with_collection("Customer.tags", "customer_tags", "customer_id", None)
        .with_filter("big_orders", "total = 100");

    SessionFactory::builder(metamodel, db.provider())
        .config(config)
        .native_translator(native)
        .named_query("customersByName", "select * from customer where name = :name")
        .build()
        .unwrap()
}

pub fn seed_customer(db: &MemoryDb, id: i64, name: &str) {
    db.seed(
        "customer",
        &["id", "name", "version"],
        vec![Value::BigInt(id), Value::from(name), Value::BigInt(0)],
    );
}
