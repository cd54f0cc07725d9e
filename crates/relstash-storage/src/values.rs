//! Conversion between in-memory values and single SQL column values.

use rusqlite::types::Value as SqlValue;

use relstash_core::{PrimitiveType, TypeIntrospector, TypeRef, Value, ROOT_CLASS};

use crate::error::StorageError;

/// SQL column type for a property of the given type.
pub(crate) fn sql_type(ty: &TypeRef) -> &'static str {
    match ty {
        TypeRef::Primitive(p) => match p {
            PrimitiveType::Bool
            | PrimitiveType::I8
            | PrimitiveType::I16
            | PrimitiveType::I32
            | PrimitiveType::I64 => "INTEGER",
            PrimitiveType::F32 | PrimitiveType::F64 => "REAL",
            PrimitiveType::Char | PrimitiveType::Text => "TEXT",
            PrimitiveType::Bytes => "BLOB",
        },
        TypeRef::Enum(_) | TypeRef::ClassName => "TEXT",
        TypeRef::Object(_) | TypeRef::Array(_) => "INTEGER",
    }
}

/// Short description of a value's kind, for mismatch errors.
pub(crate) fn describe(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(_) => "bool".to_string(),
        Value::Int(v) => format!("integer {v}"),
        Value::Float(_) => "float".to_string(),
        Value::Char(_) => "char".to_string(),
        Value::Text(_) => "text".to_string(),
        Value::Bytes(_) => "bytes".to_string(),
        Value::Enum { ty, .. } => format!("enum {ty}"),
        Value::Class(_) => "class name".to_string(),
        Value::Ref(id) => format!("reference to ObjectId({id})"),
    }
}

/// The natural inline type of a value, used for elements of arrays whose
/// component is the root class. `None` for nulls and references.
pub(crate) fn inline_type_of(value: &Value) -> Option<TypeRef> {
    let ty = match value {
        Value::Bool(_) => TypeRef::Primitive(PrimitiveType::Bool),
        Value::Int(_) => TypeRef::Primitive(PrimitiveType::I64),
        Value::Float(_) => TypeRef::Primitive(PrimitiveType::F64),
        Value::Char(_) => TypeRef::Primitive(PrimitiveType::Char),
        Value::Text(_) => TypeRef::Primitive(PrimitiveType::Text),
        Value::Bytes(_) => TypeRef::Primitive(PrimitiveType::Bytes),
        Value::Enum { ty, .. } => TypeRef::Enum(ty.clone()),
        Value::Class(_) => TypeRef::ClassName,
        Value::Null | Value::Ref(_) => return None,
    };
    Some(ty)
}

fn mismatch(ty: &TypeRef, value: &Value) -> StorageError {
    StorageError::TypeMismatch {
        expected: ty.name(),
        found: describe(value),
    }
}

/// Encodes an inline (non-reference) value for a column of type `ty`.
pub(crate) fn encode_inline(
    ty: &TypeRef,
    value: &Value,
    introspector: &dyn TypeIntrospector,
) -> Result<SqlValue, StorageError> {
    if value.is_null() {
        return Ok(SqlValue::Null);
    }
    match ty {
        TypeRef::Primitive(p) => {
            if !p.accepts(value) {
                return Err(mismatch(ty, value));
            }
            Ok(match (p, value) {
                (PrimitiveType::F32 | PrimitiveType::F64, Value::Int(v)) => SqlValue::Real(*v as f64),
                (_, Value::Bool(b)) => SqlValue::Integer(i64::from(*b)),
                (_, Value::Int(v)) => SqlValue::Integer(*v),
                (_, Value::Float(f)) => SqlValue::Real(*f),
                (_, Value::Char(c)) => SqlValue::Text(c.to_string()),
                (_, Value::Text(s)) => SqlValue::Text(s.clone()),
                (_, Value::Bytes(b)) => SqlValue::Blob(b.clone()),
                _ => return Err(mismatch(ty, value)),
            })
        }
        TypeRef::Enum(name) => match value {
            Value::Enum { ty: value_ty, variant } if value_ty == name => {
                let descriptor = introspector.enumeration(name).ok_or_else(|| {
                    StorageError::Core(relstash_core::CoreError::UnknownEnum { name: name.clone() })
                })?;
                if !descriptor.has_variant(variant) {
                    return Err(StorageError::Core(relstash_core::CoreError::UnknownEnumVariant {
                        ty: name.clone(),
                        variant: variant.clone(),
                    }));
                }
                Ok(SqlValue::Text(variant.clone()))
            }
            _ => Err(mismatch(ty, value)),
        },
        TypeRef::ClassName => match value {
            Value::Class(name) => Ok(SqlValue::Text(name.clone())),
            _ => Err(mismatch(ty, value)),
        },
        TypeRef::Object(_) | TypeRef::Array(_) => Err(mismatch(ty, value)),
    }
}

fn stored_mismatch(ty: &TypeRef, sql: &SqlValue) -> StorageError {
    StorageError::TypeMismatch {
        expected: ty.name(),
        found: format!("stored {:?}", sql.data_type()),
    }
}

/// Decodes a stored column value of declared type `ty`.
///
/// Integers are widened into float columns and range-checked against
/// narrower integral widths; enum and class names are resolved against the
/// introspector.
pub(crate) fn decode_inline(
    ty: &TypeRef,
    sql: SqlValue,
    introspector: &dyn TypeIntrospector,
) -> Result<Value, StorageError> {
    if matches!(sql, SqlValue::Null) {
        return Ok(Value::Null);
    }
    match ty {
        TypeRef::Primitive(p) => decode_primitive(*p, ty, sql),
        TypeRef::Enum(name) => {
            let SqlValue::Text(variant) = sql else {
                return Err(stored_mismatch(ty, &sql));
            };
            let descriptor = introspector
                .enumeration(name)
                .ok_or_else(|| StorageError::TypeResolution { name: name.clone() })?;
            if !descriptor.has_variant(&variant) {
                return Err(StorageError::TypeResolution {
                    name: format!("{name}::{variant}"),
                });
            }
            Ok(Value::Enum {
                ty: name.clone(),
                variant,
            })
        }
        TypeRef::ClassName => {
            let SqlValue::Text(name) = sql else {
                return Err(stored_mismatch(ty, &sql));
            };
            if name != ROOT_CLASS && introspector.class(&name).is_none() {
                return Err(StorageError::TypeResolution { name });
            }
            Ok(Value::Class(name))
        }
        TypeRef::Object(_) | TypeRef::Array(_) => Err(stored_mismatch(ty, &sql)),
    }
}

fn decode_primitive(p: PrimitiveType, ty: &TypeRef, sql: SqlValue) -> Result<Value, StorageError> {
    let value = match (p, sql) {
        (PrimitiveType::Bool, SqlValue::Integer(i)) => Value::Bool(i != 0),
        (PrimitiveType::F32, SqlValue::Real(f)) => Value::Float(f as f32 as f64),
        (PrimitiveType::F32 | PrimitiveType::F64, SqlValue::Integer(i)) => Value::Float(i as f64),
        (PrimitiveType::F64, SqlValue::Real(f)) => Value::Float(f),
        (PrimitiveType::Char, SqlValue::Text(s)) => {
            let mut chars = s.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) => Value::Char(c),
                _ => {
                    return Err(StorageError::TypeMismatch {
                        expected: ty.name(),
                        found: format!("text of length {}", s.chars().count()),
                    })
                }
            }
        }
        (PrimitiveType::Text, SqlValue::Text(s)) => Value::Text(s),
        (PrimitiveType::Bytes, SqlValue::Blob(b)) => Value::Bytes(b),
        (PrimitiveType::Bytes, SqlValue::Text(s)) => Value::Bytes(s.into_bytes()),
        (p, SqlValue::Integer(i)) => match p.integral_range() {
            Some((min, max)) if (min..=max).contains(&i) => Value::Int(i),
            _ => {
                return Err(StorageError::TypeMismatch {
                    expected: ty.name(),
                    found: format!("stored integer {i}"),
                })
            }
        },
        (_, other) => return Err(stored_mismatch(ty, &other)),
    };
    Ok(value)
}

/// Encodes a filter parameter without a declared column type.
pub(crate) fn encode_untyped(value: &Value) -> Result<SqlValue, StorageError> {
    Ok(match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Int(v) => SqlValue::Integer(*v),
        Value::Float(f) => SqlValue::Real(*f),
        Value::Char(c) => SqlValue::Text(c.to_string()),
        Value::Text(s) => SqlValue::Text(s.clone()),
        Value::Bytes(b) => SqlValue::Blob(b.clone()),
        Value::Enum { variant, .. } => SqlValue::Text(variant.clone()),
        Value::Class(name) => SqlValue::Text(name.clone()),
        Value::Ref(_) => {
            return Err(StorageError::TypeMismatch {
                expected: "inline filter value".to_string(),
                found: describe(value),
            })
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use relstash_core::{ClassDescriptor, ClassRegistry, EnumDescriptor};

    fn registry() -> ClassRegistry {
        let mut reg = ClassRegistry::new();
        reg.register(ClassDescriptor::new("Person")).unwrap();
        reg.register_enum(EnumDescriptor::new("Color", ["Red", "Green"]))
            .unwrap();
        reg
    }

    #[test]
    fn integers_widen_into_float_columns() {
        let reg = registry();
        let f64_ty = TypeRef::Primitive(PrimitiveType::F64);
        assert_eq!(
            encode_inline(&f64_ty, &Value::Int(3), &reg).unwrap(),
            SqlValue::Real(3.0)
        );
        assert_eq!(
            decode_inline(&f64_ty, SqlValue::Integer(3), &reg).unwrap(),
            Value::Float(3.0)
        );
    }

    #[test]
    fn narrow_integers_are_range_checked() {
        let reg = registry();
        let i8_ty = TypeRef::Primitive(PrimitiveType::I8);
        assert!(matches!(
            encode_inline(&i8_ty, &Value::Int(300), &reg),
            Err(StorageError::TypeMismatch { .. })
        ));
        assert!(matches!(
            decode_inline(&i8_ty, SqlValue::Integer(300), &reg),
            Err(StorageError::TypeMismatch { .. })
        ));
        assert_eq!(
            decode_inline(&i8_ty, SqlValue::Integer(-5), &reg).unwrap(),
            Value::Int(-5)
        );
    }

    #[test]
    fn enums_are_stored_by_variant_name() {
        let reg = registry();
        let ty = TypeRef::Enum("Color".into());
        let red = Value::enumeration("Color", "Red");
        assert_eq!(
            encode_inline(&ty, &red, &reg).unwrap(),
            SqlValue::Text("Red".into())
        );
        assert_eq!(
            decode_inline(&ty, SqlValue::Text("Red".into()), &reg).unwrap(),
            red
        );
        assert!(matches!(
            decode_inline(&ty, SqlValue::Text("Blue".into()), &reg),
            Err(StorageError::TypeResolution { .. })
        ));
    }

    #[test]
    fn class_names_must_resolve() {
        let reg = registry();
        assert_eq!(
            decode_inline(&TypeRef::ClassName, SqlValue::Text("Person".into()), &reg).unwrap(),
            Value::Class("Person".into())
        );
        assert!(matches!(
            decode_inline(&TypeRef::ClassName, SqlValue::Text("Gone".into()), &reg),
            Err(StorageError::TypeResolution { .. })
        ));
    }

    #[test]
    fn chars_round_trip_through_text() {
        let reg = registry();
        let ty = TypeRef::Primitive(PrimitiveType::Char);
        let sql = encode_inline(&ty, &Value::Char('λ'), &reg).unwrap();
        assert_eq!(decode_inline(&ty, sql, &reg).unwrap(), Value::Char('λ'));
    }
}
