//! Dynamic SQL values.

use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};
use std::fmt;

/// A dynamically-typed SQL value.
///
/// This enum is the closed set of value kinds used for parameter binding,
/// entity state and result fetching. Anything that is not a plain column value
/// travels as [`Value::Object`] with a stable descriptor that the type registry
/// resolves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// NULL value
    Null,

    /// Boolean value
    Bool(bool),

    /// 8-bit signed integer
    TinyInt(i8),

    /// 16-bit signed integer
    SmallInt(i16),

    /// 32-bit signed integer
    Int(i32),

    /// 64-bit signed integer
    BigInt(i64),

    /// 32-bit floating point
    Float(f32),

    /// 64-bit floating point
    Double(f64),

    /// Arbitrary precision decimal (stored as string)
    Decimal(String),

    /// Text string
    Text(String),

    /// Timestamp (microseconds since epoch)
    Timestamp(i64),

    /// Array of values
    Array(Vec<Value>),

    /// Structured value identified by a descriptor (custom type or entity reference)
    Object(ObjectValue),
}

/// A structured value: a descriptor naming its shape plus its component values.
///
/// For entity references the descriptor is the entity name and the single
/// component is the identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectValue {
    pub descriptor: String,
    pub components: Vec<Value>,
}

impl ObjectValue {
    pub fn new(descriptor: impl Into<String>, components: Vec<Value>) -> Self {
        Self {
            descriptor: descriptor.into(),
            components,
        }
    }
}

impl Value {
    /// Check if this value is NULL.
    pub const fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Get the type name of this value.
    pub fn type_name(&self) -> &str {
        match self {
            Value::Null => "NULL",
            Value::Bool(_) => "BOOLEAN",
            Value::TinyInt(_) => "TINYINT",
            Value::SmallInt(_) => "SMALLINT",
            Value::Int(_) => "INTEGER",
            Value::BigInt(_) => "BIGINT",
            Value::Float(_) => "REAL",
            Value::Double(_) => "DOUBLE",
            Value::Decimal(_) => "DECIMAL",
            Value::Text(_) => "TEXT",
            Value::Timestamp(_) => "TIMESTAMP",
            Value::Array(_) => "ARRAY",
            Value::Object(o) => &o.descriptor,
        }
    }

    /// Build an object value.
    pub fn object(descriptor: impl Into<String>, components: Vec<Value>) -> Self {
        Value::Object(ObjectValue::new(descriptor, components))
    }

    /// Try to convert this value to an i64.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::TinyInt(v) => Some(i64::from(*v)),
            Value::SmallInt(v) => Some(i64::from(*v)),
            Value::Int(v) => Some(i64::from(*v)),
            Value::BigInt(v) => Some(*v),
            Value::Bool(v) => Some(if *v { 1 } else { 0 }),
            _ => None,
        }
    }

    /// Try to convert this value to an f64.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(f64::from(*v)),
            Value::Double(v) => Some(*v),
            Value::TinyInt(v) => Some(f64::from(*v)),
            Value::SmallInt(v) => Some(f64::from(*v)),
            Value::Int(v) => Some(f64::from(*v)),
            Value::BigInt(v) => Some(*v as f64),
            Value::Decimal(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Try to get this value as a string reference.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            Value::Decimal(s) => Some(s),
            _ => None,
        }
    }

    /// Identity comparison: like `==` but floats compare by bit pattern, so
    /// `NaN` identifiers are equal to themselves.
    pub fn identity_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Double(a), Value::Double(b)) => a.to_bits() == b.to_bits(),
            (Value::Array(a), Value::Array(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.identity_eq(y))
            }
            (Value::Object(a), Value::Object(b)) => {
                a.descriptor == b.descriptor
                    && a.components.len() == b.components.len()
                    && a
                        .components
                        .iter()
                        .zip(&b.components)
                        .all(|(x, y)| x.identity_eq(y))
            }
            _ => self == other,
        }
    }

    /// Hash this value consistently with [`Value::identity_eq`].
    pub fn hash_into(&self, hasher: &mut impl Hasher) {
        match self {
            Value::Null => 0u8.hash(hasher),
            Value::Bool(b) => {
                1u8.hash(hasher);
                b.hash(hasher);
            }
            Value::TinyInt(i) => {
                2u8.hash(hasher);
                i.hash(hasher);
            }
            Value::SmallInt(i) => {
                3u8.hash(hasher);
                i.hash(hasher);
            }
            Value::Int(i) => {
                4u8.hash(hasher);
                i.hash(hasher);
            }
            Value::BigInt(i) => {
                5u8.hash(hasher);
                i.hash(hasher);
            }
            Value::Float(f) => {
                6u8.hash(hasher);
                f.to_bits().hash(hasher);
            }
            Value::Double(f) => {
                7u8.hash(hasher);
                f.to_bits().hash(hasher);
            }
            Value::Decimal(s) => {
                8u8.hash(hasher);
                s.hash(hasher);
            }
            Value::Text(s) => {
                9u8.hash(hasher);
                s.hash(hasher);
            }
            Value::Timestamp(ts) => {
                13u8.hash(hasher);
                ts.hash(hasher);
            }
            Value::Array(arr) => {
                17u8.hash(hasher);
                arr.len().hash(hasher);
                for item in arr {
                    item.hash_into(hasher);
                }
            }
            Value::Object(o) => {
                18u8.hash(hasher);
                o.descriptor.hash(hasher);
                o.components.len().hash(hasher);
                for item in &o.components {
                    item.hash_into(hasher);
                }
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::TinyInt(v) => write!(f, "{v}"),
            Value::SmallInt(v) => write!(f, "{v}"),
            Value::Int(v) => write!(f, "{v}"),
            Value::BigInt(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Double(v) => write!(f, "{v}"),
            Value::Decimal(v) | Value::Text(v) => f.write_str(v),
            Value::Timestamp(v) => write!(f, "{v}"),
            Value::Array(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            Value::Object(o) => {
                write!(f, "{}(", o.descriptor)?;
                for (i, item) in o.components.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str(")")
            }
        }
    }
}

/// A `Value` usable as a hash-map key (identity semantics).
#[derive(Debug, Clone)]
pub struct ValueKey(pub Value);

impl PartialEq for ValueKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.identity_eq(&other.0)
    }
}

impl Eq for ValueKey {}

impl Hash for ValueKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash_into(state);
    }
}

// Conversion implementations
impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::BigInt(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}
