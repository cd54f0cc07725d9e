//! Storage-facing type references.
//!
//! A [`TypeRef`] describes what a property or array component holds:
//! a primitive that fits in one column, an enum, a type-valued column, a
//! reference to an object of some class, or a nested array. Type names are
//! canonical strings with one `[]` suffix per array dimension, e.g.
//! `"i64[][]"` or `"Person[]"`.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::class::{TypeIntrospector, ROOT_CLASS};
use crate::error::CoreError;
use crate::value::Value;

/// Name used for type-valued (class name) properties.
pub const CLASS_TYPE_NAME: &str = "class";

/// Primitive types, each stored inline in a single column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PrimitiveType {
    Bool,
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
    Char,
    Text,
    Bytes,
}

impl PrimitiveType {
    /// All primitive types, in declaration order.
    pub const ALL: [PrimitiveType; 10] = [
        PrimitiveType::Bool,
        PrimitiveType::I8,
        PrimitiveType::I16,
        PrimitiveType::I32,
        PrimitiveType::I64,
        PrimitiveType::F32,
        PrimitiveType::F64,
        PrimitiveType::Char,
        PrimitiveType::Text,
        PrimitiveType::Bytes,
    ];

    /// Canonical lowercase name.
    pub fn name(self) -> &'static str {
        match self {
            PrimitiveType::Bool => "bool",
            PrimitiveType::I8 => "i8",
            PrimitiveType::I16 => "i16",
            PrimitiveType::I32 => "i32",
            PrimitiveType::I64 => "i64",
            PrimitiveType::F32 => "f32",
            PrimitiveType::F64 => "f64",
            PrimitiveType::Char => "char",
            PrimitiveType::Text => "text",
            PrimitiveType::Bytes => "bytes",
        }
    }

    /// Looks up a primitive by its canonical name.
    pub fn from_name(name: &str) -> Option<PrimitiveType> {
        Self::ALL.into_iter().find(|p| p.name() == name)
    }

    /// Inclusive value range for the integral types.
    pub fn integral_range(self) -> Option<(i64, i64)> {
        match self {
            PrimitiveType::I8 => Some((i8::MIN as i64, i8::MAX as i64)),
            PrimitiveType::I16 => Some((i16::MIN as i64, i16::MAX as i64)),
            PrimitiveType::I32 => Some((i32::MIN as i64, i32::MAX as i64)),
            PrimitiveType::I64 => Some((i64::MIN, i64::MAX)),
            _ => None,
        }
    }

    /// Whether `value` can be stored in a column of this type.
    ///
    /// `Null` is accepted everywhere. Integral values must fit the declared
    /// width; float columns also accept integers.
    pub fn accepts(self, value: &Value) -> bool {
        match (self, value) {
            (_, Value::Null) => true,
            (PrimitiveType::Bool, Value::Bool(_)) => true,
            (PrimitiveType::F32 | PrimitiveType::F64, Value::Float(_) | Value::Int(_)) => true,
            (PrimitiveType::Char, Value::Char(_)) => true,
            (PrimitiveType::Text, Value::Text(_)) => true,
            (PrimitiveType::Bytes, Value::Bytes(_)) => true,
            (p, Value::Int(v)) => match p.integral_range() {
                Some((min, max)) => (min..=max).contains(v),
                None => false,
            },
            _ => false,
        }
    }
}

impl fmt::Display for PrimitiveType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What a property or array component holds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TypeRef {
    /// A single-column primitive.
    Primitive(PrimitiveType),
    /// An enum, stored by variant name.
    Enum(String),
    /// A type-valued column, stored by class name.
    ClassName,
    /// A reference to an object whose class is (a subtype of) the named class.
    Object(String),
    /// An array with the given component type.
    Array(Box<TypeRef>),
}

impl TypeRef {
    /// Shorthand for `TypeRef::Object(name)`.
    pub fn object(name: impl Into<String>) -> TypeRef {
        TypeRef::Object(name.into())
    }

    /// Shorthand for `TypeRef::Array(component)`.
    pub fn array_of(component: TypeRef) -> TypeRef {
        TypeRef::Array(Box::new(component))
    }

    /// Canonical type name with one `[]` per array dimension.
    pub fn name(&self) -> String {
        match self {
            TypeRef::Primitive(p) => p.name().to_string(),
            TypeRef::Enum(name) | TypeRef::Object(name) => name.clone(),
            TypeRef::ClassName => CLASS_TYPE_NAME.to_string(),
            TypeRef::Array(component) => format!("{}[]", component.name()),
        }
    }

    /// Number of array dimensions (0 for non-arrays).
    pub fn rank(&self) -> usize {
        match self {
            TypeRef::Array(component) => 1 + component.rank(),
            _ => 0,
        }
    }

    /// True for references to objects or arrays, i.e. anything stored as a
    /// foreign key and tracked by an ownership edge.
    pub fn is_reference(&self) -> bool {
        matches!(self, TypeRef::Object(_) | TypeRef::Array(_))
    }

    /// True for types stored inline in one column.
    pub fn is_inline(&self) -> bool {
        !self.is_reference()
    }

    /// Parses a canonical type name.
    ///
    /// Enum and class names are told apart by asking `introspector`; the
    /// root class name always parses as an object reference.
    pub fn parse(name: &str, introspector: &dyn TypeIntrospector) -> Result<TypeRef, CoreError> {
        if let Some(component) = name.strip_suffix("[]") {
            return Ok(TypeRef::array_of(TypeRef::parse(component, introspector)?));
        }
        if name.is_empty() || name.contains('[') || name.contains(']') {
            return Err(CoreError::InvalidTypeName {
                name: name.to_string(),
            });
        }
        if let Some(p) = PrimitiveType::from_name(name) {
            return Ok(TypeRef::Primitive(p));
        }
        if name == CLASS_TYPE_NAME {
            return Ok(TypeRef::ClassName);
        }
        if introspector.enumeration(name).is_some() {
            return Ok(TypeRef::Enum(name.to_string()));
        }
        if name == ROOT_CLASS || introspector.class(name).is_some() {
            return Ok(TypeRef::Object(name.to_string()));
        }
        Err(CoreError::UnknownClass {
            name: name.to_string(),
        })
    }
}

impl fmt::Display for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::{ClassDescriptor, ClassRegistry, EnumDescriptor};
    use proptest::prelude::*;

    fn registry() -> ClassRegistry {
        let mut reg = ClassRegistry::new();
        reg.register(ClassDescriptor::new("Person")).unwrap();
        reg.register_enum(EnumDescriptor::new("Color", ["Red", "Green"]))
            .unwrap();
        reg
    }

    #[test]
    fn array_names_carry_one_suffix_per_dimension() {
        let t = TypeRef::array_of(TypeRef::array_of(TypeRef::Primitive(PrimitiveType::I64)));
        assert_eq!(t.name(), "i64[][]");
        assert_eq!(t.rank(), 2);
        assert!(t.is_reference());
    }

    #[test]
    fn parse_distinguishes_enums_from_classes() {
        let reg = registry();
        assert_eq!(
            TypeRef::parse("Color", &reg).unwrap(),
            TypeRef::Enum("Color".into())
        );
        assert_eq!(
            TypeRef::parse("Person[]", &reg).unwrap(),
            TypeRef::array_of(TypeRef::object("Person"))
        );
        assert_eq!(
            TypeRef::parse(ROOT_CLASS, &reg).unwrap(),
            TypeRef::object(ROOT_CLASS)
        );
        assert_eq!(TypeRef::parse("class", &reg).unwrap(), TypeRef::ClassName);
    }

    #[test]
    fn parse_rejects_unknown_and_malformed_names() {
        let reg = registry();
        assert!(matches!(
            TypeRef::parse("Ghost", &reg),
            Err(CoreError::UnknownClass { .. })
        ));
        assert!(matches!(
            TypeRef::parse("i64[", &reg),
            Err(CoreError::InvalidTypeName { .. })
        ));
        assert!(matches!(
            TypeRef::parse("[]", &reg),
            Err(CoreError::InvalidTypeName { .. })
        ));
    }

    #[test]
    fn accepts_checks_integral_width() {
        assert!(PrimitiveType::I8.accepts(&Value::Int(127)));
        assert!(!PrimitiveType::I8.accepts(&Value::Int(128)));
        assert!(PrimitiveType::F64.accepts(&Value::Int(3)));
        assert!(!PrimitiveType::Text.accepts(&Value::Int(3)));
        assert!(PrimitiveType::Text.accepts(&Value::Null));
    }

    fn arb_type_ref() -> impl Strategy<Value = TypeRef> {
        let leaf = prop_oneof![
            proptest::sample::select(PrimitiveType::ALL.to_vec()).prop_map(TypeRef::Primitive),
            Just(TypeRef::Enum("Color".into())),
            Just(TypeRef::ClassName),
            Just(TypeRef::object("Person")),
        ];
        leaf.prop_recursive(3, 4, 1, |inner| inner.prop_map(TypeRef::array_of))
    }

    proptest! {
        #[test]
        fn parse_inverts_name(t in arb_type_ref()) {
            let reg = registry();
            prop_assert_eq!(TypeRef::parse(&t.name(), &reg).unwrap(), t);
        }
    }
}
