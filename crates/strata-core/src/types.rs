//! SQL type definitions, value types and the type registry.

use crate::error::{Error, MappingErrorKind, Result};
use crate::value::Value;
use std::collections::HashMap;

/// SQL data types of a single physical column.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SqlType {
    // Integer types
    TinyInt,
    SmallInt,
    Integer,
    BigInt,

    // Floating point
    Real,
    Double,

    // Fixed precision
    Decimal { precision: u8, scale: u8 },

    // Boolean
    Boolean,

    // String types
    VarChar(u32),
    Text,

    // Binary types
    Blob,

    // Date/time types
    Date,
    Time,
    Timestamp,
    TimestampTz,

    // UUID
    Uuid,

    // JSON
    Json,

    // Custom type name
    Custom(String),
}

impl SqlType {
    /// Get the SQL type name for this type.
    pub fn sql_name(&self) -> String {
        match self {
            SqlType::TinyInt => "TINYINT".to_string(),
            SqlType::SmallInt => "SMALLINT".to_string(),
            SqlType::Integer => "INTEGER".to_string(),
            SqlType::BigInt => "BIGINT".to_string(),
            SqlType::Real => "REAL".to_string(),
            SqlType::Double => "DOUBLE PRECISION".to_string(),
            SqlType::Decimal { precision, scale } => format!("DECIMAL({}, {})", precision, scale),
            SqlType::Boolean => "BOOLEAN".to_string(),
            SqlType::VarChar(len) => format!("VARCHAR({})", len),
            SqlType::Text => "TEXT".to_string(),
            SqlType::Blob => "BLOB".to_string(),
            SqlType::Date => "DATE".to_string(),
            SqlType::Time => "TIME".to_string(),
            SqlType::Timestamp => "TIMESTAMP".to_string(),
            SqlType::TimestampTz => "TIMESTAMPTZ".to_string(),
            SqlType::Uuid => "UUID".to_string(),
            SqlType::Json => "JSON".to_string(),
            SqlType::Custom(name) => name.clone(),
        }
    }

    /// Check if this type is numeric.
    pub const fn is_numeric(&self) -> bool {
        matches!(
            self,
            SqlType::TinyInt
                | SqlType::SmallInt
                | SqlType::Integer
                | SqlType::BigInt
                | SqlType::Real
                | SqlType::Double
                | SqlType::Decimal { .. }
        )
    }

    /// Check if this type is a date/time type.
    pub const fn is_temporal(&self) -> bool {
        matches!(
            self,
            SqlType::Date | SqlType::Time | SqlType::Timestamp | SqlType::TimestampTz
        )
    }

    /// Column type inferred from the shape of a plain value.
    ///
    /// Returns `None` for values that have no single-column type (`Null`,
    /// arrays and structured objects).
    pub fn of_value(value: &Value) -> Option<SqlType> {
        Some(match value {
            Value::Bool(_) => SqlType::Boolean,
            Value::TinyInt(_) => SqlType::TinyInt,
            Value::SmallInt(_) => SqlType::SmallInt,
            Value::Int(_) => SqlType::Integer,
            Value::BigInt(_) => SqlType::BigInt,
            Value::Float(_) => SqlType::Real,
            Value::Double(_) => SqlType::Double,
            Value::Decimal(_) => SqlType::Decimal {
                precision: 38,
                scale: 10,
            },
            Value::Text(_) => SqlType::Text,
            Value::Timestamp(_) => SqlType::Timestamp,
            Value::Null | Value::Array(_) | Value::Object(_) => return None,
        })
    }
}

/// Binding type of a parameter or property, possibly spanning several columns.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ValueType {
    /// A single column of the given SQL type.
    Basic(SqlType),
    /// A reference to a mapped entity, bound through its identifier columns.
    Entity { entity: String, id_span: usize },
    /// A registered multi-column value type.
    Component { name: String, columns: Vec<SqlType> },
    /// Generic fallback used for nulls whose type cannot be known.
    Untyped,
}

impl ValueType {
    pub fn basic(sql_type: SqlType) -> Self {
        ValueType::Basic(sql_type)
    }

    pub fn entity(entity: impl Into<String>) -> Self {
        ValueType::Entity {
            entity: entity.into(),
            id_span: 1,
        }
    }

    /// Number of physical columns a value of this type occupies.
    pub fn column_span(&self) -> usize {
        match self {
            ValueType::Basic(_) | ValueType::Untyped => 1,
            ValueType::Entity { id_span, .. } => *id_span,
            ValueType::Component { columns, .. } => columns.len(),
        }
    }

    pub fn name(&self) -> String {
        match self {
            ValueType::Basic(t) => t.sql_name(),
            ValueType::Entity { entity, .. } => format!("entity({entity})"),
            ValueType::Component { name, .. } => name.clone(),
            ValueType::Untyped => "untyped".to_string(),
        }
    }

    pub fn is_entity(&self) -> bool {
        matches!(self, ValueType::Entity { .. })
    }

    /// Normalize integer width to this type, so identifiers compare equal
    /// however the caller spelled them (`1` vs `1_i64`).
    pub fn coerce(&self, value: Value) -> Value {
        if matches!(value, Value::Bool(_)) {
            return value;
        }
        let (ValueType::Basic(sql_type), Some(n)) = (self, value.as_i64()) else {
            return value;
        };
        match sql_type {
            SqlType::BigInt => Value::BigInt(n),
            SqlType::Integer => i32::try_from(n).map(Value::Int).unwrap_or(value),
            SqlType::SmallInt => i16::try_from(n).map(Value::SmallInt).unwrap_or(value),
            _ => value,
        }
    }

    /// Split a value into the physical column values of this type.
    pub fn flatten(&self, value: &Value) -> Result<Vec<Value>> {
        let span = self.column_span();
        if value.is_null() {
            return Ok(vec![Value::Null; span]);
        }
        match self {
            ValueType::Basic(_) | ValueType::Untyped => Ok(vec![value.clone()]),
            ValueType::Entity { entity, id_span } => {
                let id = match value {
                    Value::Object(o) if o.descriptor == *entity => {
                        o.components.first().cloned().unwrap_or(Value::Null)
                    }
                    Value::Object(o) => {
                        return Err(Error::mapping(
                            MappingErrorKind::WrongShape,
                            Some(entity),
                            format!("expected a reference to {entity}, found {}", o.descriptor),
                        ));
                    }
                    other => other.clone(),
                };
                split_span(id, *id_span, entity)
            }
            ValueType::Component { name, columns } => match value {
                Value::Object(o) if o.components.len() == columns.len() => {
                    Ok(o.components.clone())
                }
                other => Err(Error::mapping(
                    MappingErrorKind::WrongShape,
                    None,
                    format!(
                        "value of type {} does not fit component {} ({} columns)",
                        other.type_name(),
                        name,
                        columns.len()
                    ),
                )),
            },
        }
    }
}

fn split_span(id: Value, span: usize, entity: &str) -> Result<Vec<Value>> {
    if span == 1 {
        return Ok(vec![id]);
    }
    match id {
        Value::Array(parts) if parts.len() == span => Ok(parts),
        Value::Null => Ok(vec![Value::Null; span]),
        other => Err(Error::mapping(
            MappingErrorKind::WrongShape,
            Some(entity),
            format!(
                "composite identifier of {entity} needs {span} columns, found {}",
                other.type_name()
            ),
        )),
    }
}

/// Resolves descriptors of structured values to mapped entity types.
///
/// Implemented by the metamodel; the binder consults it after the heuristic
/// registry has failed.
pub trait EntityResolver: Send + Sync {
    fn entity_type(&self, descriptor: &str) -> Option<ValueType>;
}

/// Registry of value types keyed by stable descriptors.
///
/// Plain values resolve through [`SqlType::of_value`]; structured values
/// resolve through the registered descriptors.
#[derive(Debug, Clone, Default)]
pub struct TypeRegistry {
    custom: HashMap<String, ValueType>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a structured value type under its descriptor.
    pub fn register(&mut self, descriptor: impl Into<String>, value_type: ValueType) {
        self.custom.insert(descriptor.into(), value_type);
    }

    #[must_use]
    pub fn with(mut self, descriptor: impl Into<String>, value_type: ValueType) -> Self {
        self.register(descriptor, value_type);
        self
    }

    pub fn get(&self, descriptor: &str) -> Option<&ValueType> {
        self.custom.get(descriptor)
    }

    /// Infer a type from the runtime shape of a value.
    pub fn heuristic(&self, value: &Value) -> Option<ValueType> {
        match value {
            Value::Object(o) => self.custom.get(&o.descriptor).cloned(),
            other => SqlType::of_value(other).map(ValueType::Basic),
        }
    }
}
