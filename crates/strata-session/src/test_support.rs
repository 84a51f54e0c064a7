//! Recording persisters and a no-op connection for unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use strata_core::{
    CollectionPersister, Connection, ConnectionProvider, ElementKind, EntityPersister, Error, IdGeneration, LockMode,
    PropertyMapping, Result, Row, RowStream, SqlType, Statement, StoreError, StoreResult, Value,
    ValueKey, ValueType, VecRowStream,
};

pub type Journal = Arc<Mutex<Vec<String>>>;

pub fn journal() -> Journal {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn entries(journal: &Journal) -> Vec<String> {
    journal.lock().unwrap().clone()
}

/// Connection that records transaction calls and returns no rows.
#[derive(Debug, Default)]
pub struct NullConnection {
    pub log: Vec<String>,
}

impl Connection for NullConnection {
    fn query(&mut self, stmt: &Statement) -> StoreResult<Box<dyn RowStream>> {
        self.log.push(stmt.sql.clone());
        Ok(Box::new(VecRowStream::new(Vec::new())))
    }

    fn execute(&mut self, stmt: &Statement) -> StoreResult<u64> {
        self.log.push(stmt.sql.clone());
        Ok(0)
    }

    fn insert(&mut self, stmt: &Statement) -> StoreResult<Option<Value>> {
        self.log.push(stmt.sql.clone());
        Ok(None)
    }

    fn begin(&mut self, _isolation: Option<strata_core::IsolationLevel>) -> StoreResult<()> {
        self.log.push("begin".into());
        Ok(())
    }

    fn commit(&mut self) -> StoreResult<()> {
        self.log.push("commit".into());
        Ok(())
    }

    fn rollback(&mut self) -> StoreResult<()> {
        self.log.push("rollback".into());
        Ok(())
    }
}

/// Entity persister over an in-memory map that journals every write.
#[derive(Debug)]
pub struct JournalPersister {
    name: String,
    spaces: Vec<String>,
    properties: Vec<PropertyMapping>,
    id_type: ValueType,
    generation: IdGeneration,
    version: Option<String>,
    cache_region: Option<String>,
    journal: Journal,
    rows: Mutex<HashMap<ValueKey, Vec<Value>>>,
    next_id: AtomicI64,
    fail_on: Mutex<Option<Value>>,
}

impl JournalPersister {
    pub fn new(name: &str, journal: &Journal) -> Self {
        Self {
            name: name.to_string(),
            spaces: vec![name.to_lowercase()],
            properties: vec![PropertyMapping::basic("name", SqlType::Text)],
            id_type: ValueType::basic(SqlType::BigInt),
            generation: IdGeneration::Assigned,
            version: None,
            cache_region: None,
            journal: journal.clone(),
            rows: Mutex::new(HashMap::new()),
            next_id: AtomicI64::new(100),
            fail_on: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn property(mut self, mapping: PropertyMapping) -> Self {
        self.properties.push(mapping);
        self
    }

    #[must_use]
    pub fn generation(mut self, generation: IdGeneration) -> Self {
        self.generation = generation;
        self
    }

    #[must_use]
    pub fn versioned(mut self) -> Self {
        self.properties
            .push(PropertyMapping::basic("version", SqlType::BigInt));
        self.version = Some("version".into());
        self
    }

    #[must_use]
    pub fn cached(mut self, region: &str) -> Self {
        self.cache_region = Some(region.to_string());
        self
    }

    pub fn fail_on(&self, id: Value) {
        *self.fail_on.lock().unwrap() = Some(id);
    }

    pub fn seed(&self, id: Value, state: Vec<Value>) {
        self.rows.lock().unwrap().insert(ValueKey(id), state);
    }

    pub fn row(&self, id: &Value) -> Option<Vec<Value>> {
        self.rows.lock().unwrap().get(&ValueKey(id.clone())).cloned()
    }

    fn record(&self, op: &str, id: &Value) -> Result<()> {
        if self
            .fail_on
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|f| f.identity_eq(id))
        {
            return Err(Error::from_store(
                StoreError::new("constraint violated").with_sqlstate("23505"),
                Some(op),
            ));
        }
        self.journal
            .lock()
            .unwrap()
            .push(format!("{op} {}#{id}", self.name));
        Ok(())
    }
}

impl EntityPersister for JournalPersister {
    fn entity_name(&self) -> &str {
        &self.name
    }

    fn query_spaces(&self) -> &[String] {
        &self.spaces
    }

    fn properties(&self) -> &[PropertyMapping] {
        &self.properties
    }

    fn identifier_type(&self) -> &ValueType {
        &self.id_type
    }

    fn id_generation(&self) -> IdGeneration {
        self.generation
    }

    fn version_property(&self) -> Option<&str> {
        self.version.as_deref()
    }

    fn cache_region(&self) -> Option<&str> {
        self.cache_region.as_deref()
    }

    fn generate_id(&self, _conn: &mut dyn Connection) -> Result<Value> {
        Ok(Value::BigInt(self.next_id.fetch_add(1, Ordering::SeqCst)))
    }

    fn insert(&self, _conn: &mut dyn Connection, id: Option<&Value>, state: &[Value]) -> Result<Option<Value>> {
        let (id, generated) = match id {
            Some(id) => (id.clone(), None),
            None => {
                let id = Value::BigInt(self.next_id.fetch_add(1, Ordering::SeqCst));
                (id.clone(), Some(id))
            }
        };
        self.record("insert", &id)?;
        self.rows.lock().unwrap().insert(ValueKey(id), state.to_vec());
        Ok(generated)
    }

    fn update(&self, _conn: &mut dyn Connection, id: &Value, state: &[Value], _previous_version: Option<&Value>) -> Result<()> {
        self.record("update", id)?;
        self.rows.lock().unwrap().insert(ValueKey(id.clone()), state.to_vec());
        Ok(())
    }

    fn delete(&self, _conn: &mut dyn Connection, id: &Value, _version: Option<&Value>) -> Result<()> {
        self.record("delete", id)?;
        self.rows.lock().unwrap().remove(&ValueKey(id.clone()));
        Ok(())
    }

    fn load(&self, _conn: &mut dyn Connection, id: &Value, _lock: LockMode) -> Result<Option<Vec<Value>>> {
        self.journal
            .lock()
            .unwrap()
            .push(format!("load {}#{id}", self.name));
        Ok(self.row(id))
    }

    fn lock(&self, _conn: &mut dyn Connection, id: &Value, _version: Option<&Value>, lock: LockMode) -> Result<()> {
        self.journal
            .lock()
            .unwrap()
            .push(format!("lock {}#{id} {lock:?}", self.name));
        Ok(())
    }

    fn hydrate(&self, row: &Row) -> Result<(Value, Vec<Value>)> {
        let values = row.values();
        let id = values.first().cloned().unwrap_or(Value::Null);
        Ok((id, values.iter().skip(1).cloned().collect()))
    }
}

/// Collection persister that journals every write.
#[derive(Debug)]
pub struct JournalCollectionPersister {
    role: String,
    owner: String,
    kind: ElementKind,
    spaces: Vec<String>,
    journal: Journal,
    rows: Mutex<HashMap<ValueKey, Vec<Value>>>,
}

impl JournalCollectionPersister {
    pub fn new(role: &str, owner: &str, kind: ElementKind, journal: &Journal) -> Self {
        Self {
            role: role.to_string(),
            owner: owner.to_string(),
            kind,
            spaces: vec![role.replace('.', "_").to_lowercase()],
            journal: journal.clone(),
            rows: Mutex::new(HashMap::new()),
        }
    }

    fn record(&self, line: String) {
        self.journal.lock().unwrap().push(line);
    }
}

fn render(values: &[Value]) -> String {
    values
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

impl CollectionPersister for JournalCollectionPersister {
    fn role(&self) -> &str {
        &self.role
    }

    fn owner_entity(&self) -> &str {
        &self.owner
    }

    fn element_kind(&self) -> &ElementKind {
        &self.kind
    }

    fn query_spaces(&self) -> &[String] {
        &self.spaces
    }

    fn load(&self, _conn: &mut dyn Connection, owner_key: &Value) -> Result<Vec<Value>> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .get(&ValueKey(owner_key.clone()))
            .cloned()
            .unwrap_or_default())
    }

    fn recreate(&self, _conn: &mut dyn Connection, owner_key: &Value, elements: &[Value]) -> Result<()> {
        self.record(format!("recreate {}#{owner_key} [{}]", self.role, render(elements)));
        self.rows
            .lock()
            .unwrap()
            .insert(ValueKey(owner_key.clone()), elements.to_vec());
        Ok(())
    }

    fn update(&self, _conn: &mut dyn Connection, owner_key: &Value, removed: &[Value], added: &[Value]) -> Result<()> {
        self.record(format!(
            "update {}#{owner_key} -[{}] +[{}]",
            self.role,
            render(removed),
            render(added)
        ));
        Ok(())
    }

    fn remove(&self, _conn: &mut dyn Connection, owner_key: &Value) -> Result<()> {
        self.record(format!("remove {}#{owner_key}", self.role));
        self.rows.lock().unwrap().remove(&ValueKey(owner_key.clone()));
        Ok(())
    }
}

/// Provider whose connections share one statement journal and one queue of
/// scripted query results.
#[derive(Debug, Default)]
pub struct RecordingProvider {
    journal: Journal,
    results: Arc<Mutex<VecDeque<Vec<Row>>>>,
    acquired: AtomicUsize,
    released: AtomicUsize,
}

impl RecordingProvider {
    pub fn new(journal: &Journal) -> Arc<Self> {
        Arc::new(Self {
            journal: journal.clone(),
            ..Self::default()
        })
    }

    /// Rows returned by the next query.
    pub fn script(&self, rows: Vec<Row>) {
        self.results.lock().unwrap().push_back(rows);
    }

    /// Connections acquired and not yet released.
    pub fn outstanding(&self) -> usize {
        self.acquired.load(Ordering::SeqCst) - self.released.load(Ordering::SeqCst)
    }

    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }
}

impl ConnectionProvider for RecordingProvider {
    fn acquire(&self) -> StoreResult<Box<dyn Connection>> {
        self.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(RecordingConnection {
            journal: self.journal.clone(),
            results: Arc::clone(&self.results),
        }))
    }

    fn release(&self, _conn: Box<dyn Connection>) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

struct RecordingConnection {
    journal: Journal,
    results: Arc<Mutex<VecDeque<Vec<Row>>>>,
}

impl RecordingConnection {
    fn record(&self, line: String) {
        self.journal.lock().unwrap().push(line);
    }
}

impl Connection for RecordingConnection {
    fn query(&mut self, stmt: &Statement) -> StoreResult<Box<dyn RowStream>> {
        if stmt.callable {
            self.record(format!("call {} [{}]", stmt.sql, render(&stmt.params)));
        } else {
            self.record(format!("query {}", stmt.sql));
        }
        let rows = self.results.lock().unwrap().pop_front().unwrap_or_default();
        Ok(Box::new(VecRowStream::new(rows)))
    }

    fn execute(&mut self, stmt: &Statement) -> StoreResult<u64> {
        self.record(format!("execute {}", stmt.sql));
        Ok(1)
    }

    fn insert(&mut self, stmt: &Statement) -> StoreResult<Option<Value>> {
        self.record(format!("execute {}", stmt.sql));
        Ok(None)
    }

    fn begin(&mut self, _isolation: Option<strata_core::IsolationLevel>) -> StoreResult<()> {
        self.record("begin".into());
        Ok(())
    }

    fn commit(&mut self) -> StoreResult<()> {
        self.record("commit".into());
        Ok(())
    }

    fn rollback(&mut self) -> StoreResult<()> {
        self.record("rollback".into());
        Ok(())
    }
}
