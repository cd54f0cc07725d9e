//! Dynamic property values.

use serde::{Deserialize, Serialize};

use crate::id::ObjectId;

/// A property value, array element, or collection entry.
///
/// Integers of every declared width are carried as `Int(i64)`; the declared
/// [`PrimitiveType`](crate::PrimitiveType) decides the permitted range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Char(char),
    Text(String),
    Bytes(Vec<u8>),
    /// An enum value, by type name and variant name.
    Enum { ty: String, variant: String },
    /// A type-valued property holding a class name.
    Class(String),
    /// A reference to another object or array in the same graph.
    Ref(ObjectId),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// The referenced node, if this is a reference.
    pub fn as_ref_id(&self) -> Option<ObjectId> {
        match self {
            Value::Ref(id) => Some(*id),
            _ => None,
        }
    }

    /// Builds an enum value.
    pub fn enumeration(ty: impl Into<String>, variant: impl Into<String>) -> Value {
        Value::Enum {
            ty: ty.into(),
            variant: variant.into(),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<ObjectId> for Value {
    fn from(v: ObjectId) -> Self {
        Value::Ref(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}
