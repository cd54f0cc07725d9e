pub mod class;
pub mod error;
pub mod graph;
pub mod id;
pub mod types;
pub mod value;

// Re-export commonly used types
pub use class::{
    ClassDescriptor, ClassKind, ClassRegistry, EnumDescriptor, PropertyDescriptor,
    TypeIntrospector, ITEMS_PROPERTY, ROOT_CLASS,
};
pub use error::CoreError;
pub use graph::{ArrayNode, Collection, Instance, Node, ObjectGraph};
pub use id::ObjectId;
pub use types::{PrimitiveType, TypeRef};
pub use value::Value;
