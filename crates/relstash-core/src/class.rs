//! Class metadata and the type introspection seam.
//!
//! The storage engine never inspects Rust types directly. Everything it knows
//! about a class (its properties, supertype, capability interfaces, and
//! whether it can be constructed) comes through [`TypeIntrospector`].
//! [`ClassRegistry`] is the registration-based implementation: callers
//! describe their classes once, up front, with [`ClassDescriptor`] builders.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::error::CoreError;
use crate::graph::Instance;
use crate::types::TypeRef;

/// Name of the implicit universal supertype. Every class chain ends here.
pub const ROOT_CLASS: &str = "Object";

/// Implicit array property through which collection classes persist their
/// contents.
pub const ITEMS_PROPERTY: &str = "ITEMS";

/// Column names the storage layer owns in every class table.
pub const RESERVED_COLUMNS: [&str; 2] = ["ID", "REAL_CLASS"];

/// How a class participates in persistence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClassKind {
    /// A concrete class with named properties.
    Plain,
    /// A class that has rows (through its subclasses) but cannot be constructed.
    Abstract,
    /// A capability interface: no properties, never constructed.
    Interface,
    /// A concrete class with live list contents.
    List,
    /// A concrete class with live key/value contents.
    Map,
}

/// One persistent (or transient) property of a class level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyDescriptor {
    pub name: String,
    pub ty: TypeRef,
    /// Transient properties are never written or read.
    pub transient: bool,
}

impl PropertyDescriptor {
    pub fn new(name: impl Into<String>, ty: TypeRef) -> Self {
        PropertyDescriptor {
            name: name.into(),
            ty,
            transient: false,
        }
    }
}

/// Metadata for a single class level.
///
/// `properties` lists only what this level declares; inherited properties
/// belong to the superclass descriptor, mirroring the one-table-per-level
/// storage layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassDescriptor {
    pub name: String,
    pub kind: ClassKind,
    pub superclass: Option<String>,
    pub interfaces: Vec<String>,
    pub properties: Vec<PropertyDescriptor>,
}

impl ClassDescriptor {
    /// A plain concrete class extending the root class.
    pub fn new(name: impl Into<String>) -> Self {
        ClassDescriptor {
            name: name.into(),
            kind: ClassKind::Plain,
            superclass: None,
            interfaces: Vec::new(),
            properties: Vec::new(),
        }
    }

    /// A capability interface. `extends` on an interface adds super-interfaces.
    pub fn interface(name: impl Into<String>) -> Self {
        ClassDescriptor::new(name).kind(ClassKind::Interface)
    }

    pub fn kind(mut self, kind: ClassKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn extends(mut self, superclass: impl Into<String>) -> Self {
        self.superclass = Some(superclass.into());
        self
    }

    pub fn implements(mut self, interface: impl Into<String>) -> Self {
        self.interfaces.push(interface.into());
        self
    }

    pub fn property(mut self, name: impl Into<String>, ty: TypeRef) -> Self {
        self.properties.push(PropertyDescriptor::new(name, ty));
        self
    }

    pub fn transient_property(mut self, name: impl Into<String>, ty: TypeRef) -> Self {
        let mut prop = PropertyDescriptor::new(name, ty);
        prop.transient = true;
        self.properties.push(prop);
        self
    }

    pub fn is_interface(&self) -> bool {
        self.kind == ClassKind::Interface
    }

    pub fn is_collection(&self) -> bool {
        matches!(self.kind, ClassKind::List | ClassKind::Map)
    }

    /// Properties that are written to and read from this level's table.
    pub fn stored_properties(&self) -> impl Iterator<Item = &PropertyDescriptor> {
        self.properties.iter().filter(|p| !p.transient)
    }
}

/// Metadata for an enum type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnumDescriptor {
    pub name: String,
    pub variants: Vec<String>,
}

impl EnumDescriptor {
    pub fn new<I, S>(name: impl Into<String>, variants: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        EnumDescriptor {
            name: name.into(),
            variants: variants.into_iter().map(Into::into).collect(),
        }
    }

    pub fn has_variant(&self, variant: &str) -> bool {
        self.variants.iter().any(|v| v == variant)
    }
}

/// The type introspection provider consumed by the storage engine.
///
/// Implementors only answer the two lookups; the hierarchy walks are
/// provided on top of them.
pub trait TypeIntrospector {
    /// Looks up a class or interface by name. The root class is implicit and
    /// is not expected to be returned.
    fn class(&self, name: &str) -> Option<&ClassDescriptor>;

    /// Looks up an enum type by name.
    fn enumeration(&self, name: &str) -> Option<&EnumDescriptor>;

    fn require_class(&self, name: &str) -> Result<&ClassDescriptor, CoreError> {
        self.class(name).ok_or_else(|| CoreError::UnknownClass {
            name: name.to_string(),
        })
    }

    /// The class levels of `name`, leaf first, stopping before the root class.
    fn chain(&self, name: &str) -> Result<SmallVec<[&ClassDescriptor; 4]>, CoreError> {
        let mut levels: SmallVec<[&ClassDescriptor; 4]> = SmallVec::new();
        let mut current = Some(name.to_string());
        while let Some(level) = current.take() {
            if level == ROOT_CLASS {
                break;
            }
            if levels.iter().any(|d| d.name == level) {
                return Err(CoreError::CyclicInheritance { name: level });
            }
            let descriptor = self.require_class(&level)?;
            current = descriptor.superclass.clone();
            levels.push(descriptor);
        }
        Ok(levels)
    }

    /// Every interface `name` implements, directly, through a superclass, or
    /// through interface inheritance. Deduplicated, in discovery order.
    fn interfaces_of(&self, name: &str) -> Result<Vec<String>, CoreError> {
        let mut found: Vec<String> = Vec::new();
        let mut pending: Vec<String> = Vec::new();
        for level in self.chain(name)? {
            if level.is_interface() {
                continue;
            }
            pending.extend(level.interfaces.iter().cloned());
        }
        while let Some(interface) = pending.pop() {
            if found.contains(&interface) {
                continue;
            }
            let descriptor = self.require_class(&interface)?;
            pending.extend(descriptor.interfaces.iter().cloned());
            pending.extend(descriptor.superclass.iter().cloned());
            found.push(interface);
        }
        Ok(found)
    }

    /// All types a reference to `name` may legally be declared as: the class
    /// itself, its superclasses, its interfaces, and the root class.
    fn legal_reference_types(&self, name: &str) -> Result<Vec<String>, CoreError> {
        let mut types: Vec<String> = self.chain(name)?.iter().map(|d| d.name.clone()).collect();
        types.extend(self.interfaces_of(name)?);
        types.push(ROOT_CLASS.to_string());
        Ok(types)
    }

    /// True if any level of `name` stores a reference or array property.
    fn has_reference_properties(&self, name: &str) -> Result<bool, CoreError> {
        Ok(self
            .chain(name)?
            .iter()
            .any(|level| level.stored_properties().any(|p| p.ty.is_reference())))
    }

    /// True if `sub` is `sup` or inherits from / implements it.
    fn is_subtype(&self, sub: &str, sup: &str) -> Result<bool, CoreError> {
        if sup == ROOT_CLASS || sub == sup {
            return Ok(true);
        }
        Ok(self.legal_reference_types(sub)?.iter().any(|t| t == sup))
    }

    /// Creates an empty instance through the class's default construction path.
    fn instantiate(&self, name: &str) -> Result<Instance, CoreError> {
        let descriptor = self.require_class(name)?;
        let reason = match descriptor.kind {
            ClassKind::Interface => "interfaces have no construction path",
            ClassKind::Abstract => "abstract classes have no construction path",
            _ => return Ok(Instance::for_class(descriptor)),
        };
        Err(CoreError::NotInstantiable {
            name: name.to_string(),
            reason: reason.to_string(),
        })
    }
}

/// Registration-based [`TypeIntrospector`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClassRegistry {
    classes: IndexMap<String, ClassDescriptor>,
    enums: IndexMap<String, EnumDescriptor>,
}

impl ClassRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a class or interface.
    ///
    /// Collection classes get the implicit [`ITEMS_PROPERTY`] appended.
    pub fn register(&mut self, mut descriptor: ClassDescriptor) -> Result<(), CoreError> {
        self.check_name_free(&descriptor.name)?;
        for prop in &descriptor.properties {
            let reserved = RESERVED_COLUMNS
                .iter()
                .chain(std::iter::once(&ITEMS_PROPERTY))
                .any(|r| r.eq_ignore_ascii_case(&prop.name));
            if reserved {
                return Err(CoreError::ReservedPropertyName {
                    class: descriptor.name.clone(),
                    property: prop.name.clone(),
                });
            }
        }
        if descriptor.is_collection() {
            descriptor.properties.push(PropertyDescriptor::new(
                ITEMS_PROPERTY,
                TypeRef::array_of(TypeRef::object(ROOT_CLASS)),
            ));
        }
        if descriptor.is_interface() {
            descriptor.properties.clear();
        }
        self.classes.insert(descriptor.name.clone(), descriptor);
        Ok(())
    }

    /// Registers an enum type.
    pub fn register_enum(&mut self, descriptor: EnumDescriptor) -> Result<(), CoreError> {
        self.check_name_free(&descriptor.name)?;
        self.enums.insert(descriptor.name.clone(), descriptor);
        Ok(())
    }

    /// Iterates all registered classes in registration order.
    pub fn classes(&self) -> impl Iterator<Item = &ClassDescriptor> {
        self.classes.values()
    }

    /// Names are compared ignoring ASCII case; each class maps to its own
    /// table and SQL identifiers are case-insensitive.
    fn check_name_free(&self, name: &str) -> Result<(), CoreError> {
        let taken = name == ROOT_CLASS
            || self
                .classes
                .keys()
                .chain(self.enums.keys())
                .any(|existing| existing.eq_ignore_ascii_case(name));
        if taken {
            return Err(CoreError::DuplicateClass {
                name: name.to_string(),
            });
        }
        Ok(())
    }
}

impl TypeIntrospector for ClassRegistry {
    fn class(&self, name: &str) -> Option<&ClassDescriptor> {
        self.classes.get(name)
    }

    fn enumeration(&self, name: &str) -> Option<&EnumDescriptor> {
        self.enums.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PrimitiveType;

    fn registry() -> ClassRegistry {
        let mut reg = ClassRegistry::new();
        reg.register(ClassDescriptor::interface("Named")).unwrap();
        reg.register(ClassDescriptor::interface("Labelled").extends("Named"))
            .unwrap();
        reg.register(
            ClassDescriptor::new("Animal")
                .kind(ClassKind::Abstract)
                .implements("Labelled")
                .property("name", TypeRef::Primitive(PrimitiveType::Text)),
        )
        .unwrap();
        reg.register(
            ClassDescriptor::new("Dog")
                .extends("Animal")
                .property("owner", TypeRef::object("Person")),
        )
        .unwrap();
        reg.register(ClassDescriptor::new("Person")).unwrap();
        reg
    }

    #[test]
    fn chain_is_leaf_first() {
        let reg = registry();
        let names: Vec<&str> = reg
            .chain("Dog")
            .unwrap()
            .iter()
            .map(|d| d.name.as_str())
            .collect();
        assert_eq!(names, vec!["Dog", "Animal"]);
    }

    #[test]
    fn interfaces_are_inherited_transitively() {
        let reg = registry();
        let mut found = reg.interfaces_of("Dog").unwrap();
        found.sort();
        assert_eq!(found, vec!["Labelled", "Named"]);
        assert!(reg.is_subtype("Dog", "Named").unwrap());
        assert!(!reg.is_subtype("Person", "Named").unwrap());
    }

    #[test]
    fn legal_reference_types_end_at_root() {
        let reg = registry();
        let types = reg.legal_reference_types("Dog").unwrap();
        assert_eq!(types.first().map(String::as_str), Some("Dog"));
        assert_eq!(types.last().map(String::as_str), Some(ROOT_CLASS));
        assert!(types.iter().any(|t| t == "Animal"));
    }

    #[test]
    fn reference_properties_are_found_on_any_level() {
        let reg = registry();
        assert!(reg.has_reference_properties("Dog").unwrap());
        assert!(!reg.has_reference_properties("Person").unwrap());
    }

    #[test]
    fn abstract_and_interface_classes_are_not_instantiable() {
        let reg = registry();
        assert!(matches!(
            reg.instantiate("Animal"),
            Err(CoreError::NotInstantiable { .. })
        ));
        assert!(matches!(
            reg.instantiate("Named"),
            Err(CoreError::NotInstantiable { .. })
        ));
        assert_eq!(reg.instantiate("Dog").unwrap().class, "Dog");
    }

    #[test]
    fn reserved_and_duplicate_names_are_rejected() {
        let mut reg = registry();
        assert!(matches!(
            reg.register(ClassDescriptor::new("Person")),
            Err(CoreError::DuplicateClass { .. })
        ));
        assert!(matches!(
            reg.register(ClassDescriptor::new("PERSON")),
            Err(CoreError::DuplicateClass { .. })
        ));
        assert!(matches!(
            reg.register(
                ClassDescriptor::new("Bad").property("id", TypeRef::Primitive(PrimitiveType::I64))
            ),
            Err(CoreError::ReservedPropertyName { .. })
        ));
        assert!(matches!(
            reg.register(ClassDescriptor::new(ROOT_CLASS)),
            Err(CoreError::DuplicateClass { .. })
        ));
    }

    #[test]
    fn collection_classes_get_an_items_array() {
        let mut reg = ClassRegistry::new();
        reg.register(ClassDescriptor::new("Bag").kind(ClassKind::List))
            .unwrap();
        let bag = reg.class("Bag").unwrap();
        let items = bag.stored_properties().last().unwrap();
        assert_eq!(items.name, ITEMS_PROPERTY);
        assert_eq!(items.ty.name(), "Object[]");
    }

    #[test]
    fn cyclic_inheritance_is_reported() {
        let mut reg = ClassRegistry::new();
        reg.register(ClassDescriptor::new("A").extends("B")).unwrap();
        reg.register(ClassDescriptor::new("B").extends("A")).unwrap();
        assert!(matches!(
            reg.chain("A"),
            Err(CoreError::CyclicInheritance { .. })
        ));
    }
}
