//! Core error types for relstash-core.
//!
//! Uses `thiserror` for structured, matchable error variants covering
//! all anticipated failure modes in the in-memory object model.

use crate::id::ObjectId;
use thiserror::Error;

/// Core errors produced by the relstash-core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Registering a class or enum under a name that is already taken.
    #[error("duplicate class name: '{name}'")]
    DuplicateClass { name: String },

    /// A class name is not known to the introspector.
    #[error("unknown class: '{name}'")]
    UnknownClass { name: String },

    /// An enum type name is not known to the introspector.
    #[error("unknown enum: '{name}'")]
    UnknownEnum { name: String },

    /// An enum value names a variant its type does not declare.
    #[error("enum '{ty}' has no variant '{variant}'")]
    UnknownEnumVariant { ty: String, variant: String },

    /// A type name could not be parsed into a [`TypeRef`](crate::TypeRef).
    #[error("invalid type name: '{name}'")]
    InvalidTypeName { name: String },

    /// A class cannot be created through its default construction path.
    #[error("class '{name}' cannot be instantiated: {reason}")]
    NotInstantiable { name: String, reason: String },

    /// A property uses a column name the storage layer reserves.
    #[error("class '{class}' declares reserved property name '{property}'")]
    ReservedPropertyName { class: String, property: String },

    /// A class hierarchy loops back on itself.
    #[error("class '{name}' inherits from itself")]
    CyclicInheritance { name: String },

    /// An ObjectId does not refer to a live arena slot.
    #[error("node not found: ObjectId({id})", id = id.0)]
    NodeNotFound { id: ObjectId },

    /// The node exists but is an array where an object was expected.
    #[error("ObjectId({id}) is not an object", id = id.0)]
    NotAnObject { id: ObjectId },

    /// The node exists but is an object where an array was expected.
    #[error("ObjectId({id}) is not an array", id = id.0)]
    NotAnArray { id: ObjectId },
}
