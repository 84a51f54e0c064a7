//! Persisters that map an entity to one table and a collection to one link
//! table, generating plain SQL with `?` placeholders.

use std::fmt::Write as _;
use strata_core::{
    CascadeStyle, CollectionPersister, Connection, ElementKind, EntityPersister, Error,
    IdGeneration, LockMode, MappingErrorKind, PropertyMapping, Result, Row, SqlType,
    Statement, Value, ValueType,
};

// ============================================================================
// TablePersister
// ============================================================================

/// Maps one entity type to one table.
///
/// Basic and many-to-one properties are columns; collections live in their
/// own tables and are written by a [`TableCollectionPersister`].
#[derive(Debug, Clone)]
pub struct TablePersister {
    entity_name: String,
    root_entity_name: Option<String>,
    table: String,
    id_column: String,
    id_type: ValueType,
    generation: IdGeneration,
    sequence: Option<String>,
    properties: Vec<PropertyMapping>,
    version: Option<String>,
    cache_region: Option<String>,
    mutable: bool,
    spaces: Vec<String>,
}

impl TablePersister {
    /// Entity stored in `table`, identified by a `BigInt` column `id` the
    /// application assigns.
    pub fn new(entity_name: impl Into<String>, table: impl Into<String>) -> Self {
        let table = table.into();
        Self {
            entity_name: entity_name.into(),
            root_entity_name: None,
            spaces: vec![table.clone()],
            table,
            id_column: "id".to_string(),
            id_type: ValueType::basic(SqlType::BigInt),
            generation: IdGeneration::Assigned,
            sequence: None,
            properties: Vec::new(),
            version: None,
            cache_region: None,
            mutable: true,
        }
    }

    #[must_use]
    pub fn id_column(mut self, column: impl Into<String>) -> Self {
        self.id_column = column.into();
        self
    }

    #[must_use]
    pub fn id_type(mut self, id_type: ValueType) -> Self {
        self.id_type = id_type;
        self
    }

    /// Identifier produced by the store during insert.
    #[must_use]
    pub fn identity(mut self) -> Self {
        self.generation = IdGeneration::Identity;
        self
    }

    /// Identifier drawn from a sequence before insert.
    #[must_use]
    pub fn sequence(mut self, name: impl Into<String>) -> Self {
        self.generation = IdGeneration::Generated;
        self.sequence = Some(name.into());
        self
    }

    #[must_use]
    pub fn property(mut self, mapping: PropertyMapping) -> Self {
        self.properties.push(mapping);
        self
    }

    /// Optimistic version column. Declares a `BigInt` property of that name
    /// unless one exists already.
    #[must_use]
    pub fn version(mut self, property: impl Into<String>) -> Self {
        let property = property.into();
        if !self.properties.iter().any(|p| p.name == property) {
            self.properties
                .push(PropertyMapping::basic(property.clone(), SqlType::BigInt));
        }
        self.version = Some(property);
        self
    }

    #[must_use]
    pub fn cache_region(mut self, region: impl Into<String>) -> Self {
        self.cache_region = Some(region.into());
        self
    }

    #[must_use]
    pub fn immutable(mut self) -> Self {
        self.mutable = false;
        self
    }

    /// Name of the hierarchy root, for shared cache keys.
    #[must_use]
    pub fn root(mut self, entity_name: impl Into<String>) -> Self {
        self.root_entity_name = Some(entity_name.into());
        self
    }

    /// Extra table the entity reads from (for query-space matching).
    #[must_use]
    pub fn space(mut self, table: impl Into<String>) -> Self {
        self.spaces.push(table.into());
        self
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// (column, state index) of every property stored in the entity table.
    fn columns(&self) -> Vec<(&str, usize)> {
        self.properties
            .iter()
            .enumerate()
            .filter(|(_, p)| p.is_columnar())
            .map(|(i, p)| (p.column.as_str(), i))
            .collect()
    }

    fn version_column(&self) -> Option<&str> {
        let name = self.version.as_deref()?;
        self.properties
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.column.as_str())
    }

    fn select_list(&self) -> String {
        let mut cols = vec![self.id_column.as_str()];
        cols.extend(self.columns().into_iter().map(|(c, _)| c));
        cols.join(", ")
    }

    fn stale(&self, id: &Value, sql: &str) -> Error {
        Error::stale_state(
            format!(
                "Row was updated or deleted by another transaction: {}#{}",
                self.entity_name, id
            ),
            Some(sql),
        )
    }
}

fn run_execute(conn: &mut dyn Connection, stmt: &Statement) -> Result<u64> {
    tracing::trace!(sql = %stmt.sql, params = stmt.params.len(), "Executing statement");
    conn.execute(stmt)
        .map_err(|e| Error::from_store(e, Some(&stmt.sql)))
}

fn first_row(conn: &mut dyn Connection, stmt: &Statement) -> Result<Option<Row>> {
    tracing::trace!(sql = %stmt.sql, params = stmt.params.len(), "Executing query");
    let mut stream = conn
        .query(stmt)
        .map_err(|e| Error::from_store(e, Some(&stmt.sql)))?;
    let row = stream
        .next_row()
        .map_err(|e| Error::from_store(e, Some(&stmt.sql)));
    stream.close();
    row
}

fn all_rows(conn: &mut dyn Connection, stmt: &Statement) -> Result<Vec<Row>> {
    tracing::trace!(sql = %stmt.sql, params = stmt.params.len(), "Executing query");
    let mut stream = conn
        .query(stmt)
        .map_err(|e| Error::from_store(e, Some(&stmt.sql)))?;
    let mut rows = Vec::new();
    loop {
        match stream.next_row() {
            Ok(Some(row)) => rows.push(row),
            Ok(None) => break,
            Err(e) => {
                stream.close();
                return Err(Error::from_store(e, Some(&stmt.sql)));
            }
        }
    }
    stream.close();
    Ok(rows)
}

impl EntityPersister for TablePersister {
    fn entity_name(&self) -> &str {
        &self.entity_name
    }

    fn root_entity_name(&self) -> &str {
        self.root_entity_name.as_deref().unwrap_or(&self.entity_name)
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

    fn is_mutable(&self) -> bool {
        self.mutable
    }

    fn generate_id(&self, conn: &mut dyn Connection) -> Result<Value> {
        let Some(sequence) = &self.sequence else {
            return Err(Error::mapping(
                MappingErrorKind::MissingIdentifier,
                Some(&self.entity_name),
                format!("{} has no identifier sequence", self.entity_name),
            ));
        };
        let stmt = Statement::new(format!("select nextval('{sequence}')"), Vec::new());
        let row = first_row(conn, &stmt)?;
        match row.and_then(|r| r.get(0).cloned()) {
            Some(value) if !value.is_null() => Ok(self.id_type.coerce(value)),
            _ => Err(Error::mapping(
                MappingErrorKind::MissingIdentifier,
                Some(&self.entity_name),
                format!("sequence {sequence} returned no value"),
            )),
        }
    }

    fn insert(&self, conn: &mut dyn Connection, id: Option<&Value>, state: &[Value]) -> Result<Option<Value>> {
        let columns = self.columns();
        let mut names: Vec<&str> = Vec::with_capacity(columns.len() + 1);
        let mut params: Vec<Value> = Vec::with_capacity(columns.len() + 1);
        if let Some(id) = id {
            names.push(&self.id_column);
            params.push(id.clone());
        }
        for (column, index) in columns {
            names.push(column);
            params.push(state.get(index).cloned().unwrap_or(Value::Null));
        }
        let placeholders = vec!["?"; names.len()].join(", ");
        let sql = format!(
            "insert into {} ({}) values ({})",
            self.table,
            names.join(", "),
            placeholders
        );
        let stmt = Statement::new(sql, params);

        if id.is_some() {
            run_execute(conn, &stmt)?;
            return Ok(None);
        }
        tracing::trace!(sql = %stmt.sql, "Executing insert with generated key");
        let generated = conn
            .insert(&stmt)
            .map_err(|e| Error::from_store(e, Some(&stmt.sql)))?;
        Ok(generated.map(|v| self.id_type.coerce(v)))
    }

    fn update(&self, conn: &mut dyn Connection, id: &Value, state: &[Value], previous_version: Option<&Value>) -> Result<()> {
        let columns = self.columns();
        if columns.is_empty() {
            return Ok(());
        }
        let mut sql = format!("update {} set ", self.table);
        let mut params = Vec::with_capacity(columns.len() + 2);
        for (i, (column, index)) in columns.iter().enumerate() {
            if i > 0 {
                sql.push_str(", ");
            }
            let _ = write!(sql, "{column} = ?");
            params.push(state.get(*index).cloned().unwrap_or(Value::Null));
        }
        let _ = write!(sql, " where {} = ?", self.id_column);
        params.push(id.clone());
        if let (Some(column), Some(version)) = (self.version_column(), previous_version) {
            let _ = write!(sql, " and {column} = ?");
            params.push(version.clone());
        }
        let stmt = Statement::new(sql, params);
        if run_execute(conn, &stmt)? == 0 {
            return Err(self.stale(id, &stmt.sql));
        }
        Ok(())
    }

    fn delete(&self, conn: &mut dyn Connection, id: &Value, version: Option<&Value>) -> Result<()> {
        let mut sql = format!("delete from {} where {} = ?", self.table, self.id_column);
        let mut params = vec![id.clone()];
        if let (Some(column), Some(version)) = (self.version_column(), version) {
            let _ = write!(sql, " and {column} = ?");
            params.push(version.clone());
        }
        let stmt = Statement::new(sql, params);
        if run_execute(conn, &stmt)? == 0 {
            return Err(self.stale(id, &stmt.sql));
        }
        Ok(())
    }

    fn load(&self, conn: &mut dyn Connection, id: &Value, lock: LockMode) -> Result<Option<Vec<Value>>> {
        let sql = format!(
            "select {} from {} where {} = ?",
            self.select_list(),
            self.table,
            self.id_column
        );
        let mut stmt = Statement::new(sql, vec![id.clone()]);
        stmt.for_update = lock.is_pessimistic();
        match first_row(conn, &stmt)? {
            Some(row) => Ok(Some(self.hydrate(&row)?.1)),
            None => Ok(None),
        }
    }

    fn lock(&self, conn: &mut dyn Connection, id: &Value, version: Option<&Value>, lock: LockMode) -> Result<()> {
        if lock == LockMode::None {
            return Ok(());
        }
        let mut sql = format!(
            "select {} from {} where {} = ?",
            self.id_column, self.table, self.id_column
        );
        let mut params = vec![id.clone()];
        if let (Some(column), Some(version)) = (self.version_column(), version) {
            let _ = write!(sql, " and {column} = ?");
            params.push(version.clone());
        }
        let mut stmt = Statement::new(sql, params);
        stmt.for_update = lock.is_pessimistic();
        if first_row(conn, &stmt)?.is_none() {
            return Err(self.stale(id, &stmt.sql));
        }
        Ok(())
    }

    fn hydrate(&self, row: &Row) -> Result<(Value, Vec<Value>)> {
        let id = row
            .get_by_name(&self.id_column)
            .or_else(|| row.get(0))
            .cloned()
            .filter(|v| !v.is_null())
            .ok_or_else(|| {
                Error::mapping(
                    MappingErrorKind::MissingIdentifier,
                    Some(&self.entity_name),
                    format!("result row has no {} column", self.id_column),
                )
            })?;
        let state = self
            .properties
            .iter()
            .map(|p| {
                if p.is_columnar() {
                    row.get_by_name(&p.column).cloned().unwrap_or(Value::Null)
                } else {
                    Value::Null
                }
            })
            .collect();
        Ok((self.id_type.coerce(id), state))
    }
}

// ============================================================================
// TableCollectionPersister
// ============================================================================

/// Stores a collection as `(owner, element)` rows of one table.
#[derive(Debug, Clone)]
pub struct TableCollectionPersister {
    role: String,
    owner_entity: String,
    table: String,
    owner_column: String,
    element_column: String,
    element_kind: ElementKind,
    cascade: CascadeStyle,
    spaces: Vec<String>,
}

impl TableCollectionPersister {
    pub fn new(
        role: impl Into<String>,
        owner_entity: impl Into<String>,
        table: impl Into<String>,
        owner_column: impl Into<String>,
        element_column: impl Into<String>,
        element_kind: ElementKind,
    ) -> Self {
        let table = table.into();
        Self {
            role: role.into(),
            owner_entity: owner_entity.into(),
            spaces: vec![table.clone()],
            table,
            owner_column: owner_column.into(),
            element_column: element_column.into(),
            element_kind,
            cascade: CascadeStyle::NONE,
        }
    }

    #[must_use]
    pub fn cascade(mut self, cascade: CascadeStyle) -> Self {
        self.cascade = cascade;
        self
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    fn insert_rows(&self, owner_key: &Value, elements: &[Value]) -> Vec<Statement> {
        let sql = format!(
            "insert into {} ({}, {}) values (?, ?)",
            self.table, self.owner_column, self.element_column
        );
        elements
            .iter()
            .map(|e| Statement::new(sql.clone(), vec![owner_key.clone(), e.clone()]))
            .collect()
    }

    fn run_batch(conn: &mut dyn Connection, stmts: &[Statement]) -> Result<()> {
        let Some(first) = stmts.first() else {
            return Ok(());
        };
        tracing::trace!(sql = %first.sql, count = stmts.len(), "Executing collection batch");
        conn.batch(stmts)
            .map_err(|e| Error::from_store(e, Some(&first.sql)))?;
        Ok(())
    }
}

impl CollectionPersister for TableCollectionPersister {
    fn role(&self) -> &str {
        &self.role
    }

    fn owner_entity(&self) -> &str {
        &self.owner_entity
    }

    fn element_kind(&self) -> &ElementKind {
        &self.element_kind
    }

    fn query_spaces(&self) -> &[String] {
        &self.spaces
    }

    fn cascade(&self) -> CascadeStyle {
        self.cascade
    }

    fn load(&self, conn: &mut dyn Connection, owner_key: &Value) -> Result<Vec<Value>> {
        let sql = format!(
            "select {} from {} where {} = ?",
            self.element_column, self.table, self.owner_column
        );
        let stmt = Statement::new(sql, vec![owner_key.clone()]);
        Ok(all_rows(conn, &stmt)?
            .into_iter()
            .filter_map(|row| {
                row.get_by_name(&self.element_column)
                    .or_else(|| row.get(0))
                    .cloned()
            })
            .collect())
    }

    fn recreate(&self, conn: &mut dyn Connection, owner_key: &Value, elements: &[Value]) -> Result<()> {
        Self::run_batch(conn, &self.insert_rows(owner_key, elements))
    }

    fn update(&self, conn: &mut dyn Connection, owner_key: &Value, removed: &[Value], added: &[Value]) -> Result<()> {
        let delete_sql = format!(
            "delete from {} where {} = ? and {} = ?",
            self.table, self.owner_column, self.element_column
        );
        let deletes: Vec<Statement> = removed
            .iter()
            .map(|e| Statement::new(delete_sql.clone(), vec![owner_key.clone(), e.clone()]))
            .collect();
        Self::run_batch(conn, &deletes)?;
        Self::run_batch(conn, &self.insert_rows(owner_key, added))
    }

    fn remove(&self, conn: &mut dyn Connection, owner_key: &Value) -> Result<()> {
        let sql = format!("delete from {} where {} = ?", self.table, self.owner_column);
        run_execute(conn, &Statement::new(sql, vec![owner_key.clone()]))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use strata_core::{RowStream, StoreResult, VecRowStream};

    /// Records statements; answers queries and affected-row counts from
    /// scripted queues.
    #[derive(Default)]
    struct ScriptedConnection {
        statements: Vec<Statement>,
        rows: VecDeque<Vec<Row>>,
        counts: VecDeque<u64>,
        generated: Option<Value>,
    }

    impl Connection for ScriptedConnection {
        fn query(&mut self, stmt: &Statement) -> StoreResult<Box<dyn RowStream>> {
            self.statements.push(stmt.clone());
            Ok(Box::new(VecRowStream::new(self.rows.pop_front().unwrap_or_default())))
        }

        fn execute(&mut self, stmt: &Statement) -> StoreResult<u64> {
            self.statements.push(stmt.clone());
            Ok(self.counts.pop_front().unwrap_or(1))
        }

        fn insert(&mut self, stmt: &Statement) -> StoreResult<Option<Value>> {
            self.statements.push(stmt.clone());
            Ok(self.generated.clone())
        }

        fn begin(&mut self, _isolation: Option<strata_core::IsolationLevel>) -> StoreResult<()> {
            Ok(())
        }

        fn commit(&mut self) -> StoreResult<()> {
            Ok(())
        }

        fn rollback(&mut self) -> StoreResult<()> {
            Ok(())
        }
    }

    fn customers() -> TablePersister {
        TablePersister::new("Customer", "customers")
            .property(PropertyMapping::basic("name", SqlType::Text))
            .property(PropertyMapping::many_to_one("region", "Region"))
            .property(PropertyMapping::collection("orders", "Customer.orders"))
            .version("version")
    }

    #[test]
    fn test_insert_sql_skips_collections() {
        let persister = customers();
        let mut conn = ScriptedConnection::default();
        let state = vec![Value::from("Ann"), Value::BigInt(4), Value::Null, Value::BigInt(0)];
        persister
            .insert(&mut conn, Some(&Value::BigInt(1)), &state)
            .unwrap();
        let stmt = &conn.statements[0];
        assert_eq!(
            stmt.sql,
            "insert into customers (id, name, region_id, version) values (?, ?, ?, ?)"
        );
        assert_eq!(
            stmt.params,
            vec![Value::BigInt(1), Value::from("Ann"), Value::BigInt(4), Value::BigInt(0)]
        );
    }

    #[test]
    fn test_identity_insert_returns_generated_key() {
        let persister = TablePersister::new("Tag", "tags")
            .identity()
            .property(PropertyMapping::basic("label", SqlType::Text));
        let mut conn = ScriptedConnection {
            generated: Some(Value::Int(9)),
            ..Default::default()
        };
        let id = persister
            .insert(&mut conn, None, &[Value::from("x")])
            .unwrap();
        assert_eq!(id, Some(Value::BigInt(9)));
        assert_eq!(conn.statements[0].sql, "insert into tags (label) values (?)");
    }

    #[test]
    fn test_update_checks_version_and_row_count() {
        let persister = customers();
        let mut conn = ScriptedConnection::default();
        conn.counts.push_back(0);
        let state = vec![Value::from("Ann"), Value::Null, Value::Null, Value::BigInt(2)];
        let err = persister
            .update(&mut conn, &Value::BigInt(1), &state, Some(&Value::BigInt(1)))
            .unwrap_err();
        assert!(err.is_stale_state());
        assert_eq!(
            conn.statements[0].sql,
            "update customers set name = ?, region_id = ?, version = ? where id = ? and version = ?"
        );
        assert_eq!(err.sql(), Some(conn.statements[0].sql.as_str()));
    }

    #[test]
    fn test_load_hydrates_by_column_name() {
        let persister = customers();
        let row = Row::new(
            vec!["id".into(), "name".into(), "region_id".into(), "version".into()],
            vec![Value::Int(1), Value::from("Ann"), Value::BigInt(4), Value::BigInt(3)],
        );
        let mut conn = ScriptedConnection::default();
        conn.rows.push_back(vec![row]);
        let state = persister
            .load(&mut conn, &Value::BigInt(1), LockMode::Upgrade)
            .unwrap()
            .unwrap();
        assert_eq!(
            state,
            vec![Value::from("Ann"), Value::BigInt(4), Value::Null, Value::BigInt(3)]
        );
        assert!(conn.statements[0].for_update);
        assert_eq!(
            conn.statements[0].sql,
            "select id, name, region_id, version from customers where id = ?"
        );
    }

    #[test]
    fn test_lock_missing_row_is_stale() {
        let persister = customers();
        let mut conn = ScriptedConnection::default();
        let err = persister
            .lock(&mut conn, &Value::BigInt(1), Some(&Value::BigInt(1)), LockMode::Read)
            .unwrap_err();
        assert!(err.is_stale_state());
        assert!(!conn.statements[0].for_update);
    }

    #[test]
    fn test_sequence_generation() {
        let persister = TablePersister::new("Order", "orders").sequence("order_seq");
        let mut conn = ScriptedConnection::default();
        conn.rows
            .push_back(vec![Row::new(vec!["nextval".into()], vec![Value::Int(41)])]);
        assert_eq!(persister.generate_id(&mut conn).unwrap(), Value::BigInt(41));
        assert_eq!(conn.statements[0].sql, "select nextval('order_seq')");
        assert!(TablePersister::new("X", "x").generate_id(&mut conn).is_err());
    }

    #[test]
    fn test_collection_statements() {
        let persister = TableCollectionPersister::new(
            "Customer.tags",
            "Customer",
            "customer_tags",
            "customer_id",
            "tag",
            ElementKind::Value(SqlType::Text),
        );
        let mut conn = ScriptedConnection::default();
        persister
            .update(&mut conn, &Value::BigInt(1), &[Value::from("a")], &[Value::from("b")])
            .unwrap();
        persister.remove(&mut conn, &Value::BigInt(1)).unwrap();
        let sql: Vec<&str> = conn.statements.iter().map(|s| s.sql.as_str()).collect();
        assert_eq!(
            sql,
            vec![
                "delete from customer_tags where customer_id = ? and tag = ?",
                "insert into customer_tags (customer_id, tag) values (?, ?)",
                "delete from customer_tags where customer_id = ?",
            ]
        );
    }
}
