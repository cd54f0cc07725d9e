//! ObjectGraph: the arena holding every in-memory object and array.
//!
//! Objects refer to one another through [`Value::Ref`] handles rather than
//! language-level pointers, so cyclic and shared structures need no special
//! ownership tricks. The storage engine materializes loaded rows into the
//! same arena that callers build their graphs in, which is what lets one
//! session hand out exactly one instance per stored row.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::class::{ClassDescriptor, ClassKind};
use crate::error::CoreError;
use crate::id::ObjectId;
use crate::types::TypeRef;
use crate::value::Value;

static NULL: Value = Value::Null;

/// Live contents of a collection-class instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Collection {
    List(Vec<Value>),
    Map(Vec<(Value, Value)>),
}

impl Collection {
    pub fn len(&self) -> usize {
        match self {
            Collection::List(items) => items.len(),
            Collection::Map(entries) => entries.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The contents as a flat element sequence (map entries become key,
    /// value pairs).
    pub fn flatten(&self) -> Vec<Value> {
        match self {
            Collection::List(items) => items.clone(),
            Collection::Map(entries) => entries
                .iter()
                .flat_map(|(k, v)| [k.clone(), v.clone()])
                .collect(),
        }
    }

    /// Appends one element to a list. Maps take entries through
    /// [`insert`](Self::insert).
    pub fn push(&mut self, item: Value) {
        if let Collection::List(items) = self {
            items.push(item);
        }
    }

    pub fn insert(&mut self, key: Value, value: Value) {
        match self {
            Collection::Map(entries) => match entries.iter_mut().find(|(k, _)| *k == key) {
                Some(entry) => entry.1 = value,
                None => entries.push((key, value)),
            },
            Collection::List(items) => {
                items.push(key);
                items.push(value);
            }
        }
    }
}

/// An object: a class name plus property values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub class: String,
    fields: IndexMap<String, Value>,
    /// Present for list and map classes.
    pub contents: Option<Collection>,
}

impl Instance {
    /// An empty instance of `class` without collection contents.
    pub fn new(class: impl Into<String>) -> Self {
        Instance {
            class: class.into(),
            fields: IndexMap::new(),
            contents: None,
        }
    }

    /// An empty instance shaped for `descriptor` (collection classes get
    /// empty contents).
    pub fn for_class(descriptor: &ClassDescriptor) -> Self {
        let mut instance = Instance::new(descriptor.name.clone());
        instance.contents = match descriptor.kind {
            ClassKind::List => Some(Collection::List(Vec::new())),
            ClassKind::Map => Some(Collection::Map(Vec::new())),
            _ => None,
        };
        instance
    }

    /// Builder-style setter.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(name, value);
        self
    }

    /// Returns the property value, or `Null` if it was never set.
    pub fn get(&self, name: &str) -> &Value {
        self.fields.get(name).unwrap_or(&NULL)
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(name.into(), value.into());
    }

    pub fn fields(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.fields.iter()
    }
}

/// An array: a component type and ordered elements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArrayNode {
    pub component: TypeRef,
    pub elements: Vec<Value>,
}

impl ArrayNode {
    pub fn new(component: TypeRef, elements: Vec<Value>) -> Self {
        ArrayNode {
            component,
            elements,
        }
    }

    /// The array's own type, i.e. its component with one more `[]`.
    pub fn type_ref(&self) -> TypeRef {
        TypeRef::array_of(self.component.clone())
    }
}

/// A slot in the arena.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Node {
    Object(Instance),
    Array(ArrayNode),
}

impl Node {
    /// Handles referenced from this node, in field / element order.
    pub fn references(&self) -> Vec<ObjectId> {
        match self {
            Node::Object(instance) => {
                let mut refs: Vec<ObjectId> =
                    instance.fields.values().filter_map(Value::as_ref_id).collect();
                if let Some(contents) = &instance.contents {
                    refs.extend(contents.flatten().iter().filter_map(Value::as_ref_id));
                }
                refs
            }
            Node::Array(array) => array.elements.iter().filter_map(Value::as_ref_id).collect(),
        }
    }
}

/// Arena of objects and arrays addressed by [`ObjectId`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObjectGraph {
    nodes: Vec<Node>,
}

impl ObjectGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn add_object(&mut self, instance: Instance) -> ObjectId {
        self.push(Node::Object(instance))
    }

    pub fn add_array(&mut self, array: ArrayNode) -> ObjectId {
        self.push(Node::Array(array))
    }

    fn push(&mut self, node: Node) -> ObjectId {
        let id = ObjectId(self.nodes.len() as u32);
        self.nodes.push(node);
        id
    }

    pub fn node(&self, id: ObjectId) -> Result<&Node, CoreError> {
        self.nodes
            .get(id.0 as usize)
            .ok_or(CoreError::NodeNotFound { id })
    }

    pub fn node_mut(&mut self, id: ObjectId) -> Result<&mut Node, CoreError> {
        self.nodes
            .get_mut(id.0 as usize)
            .ok_or(CoreError::NodeNotFound { id })
    }

    pub fn object(&self, id: ObjectId) -> Result<&Instance, CoreError> {
        match self.node(id)? {
            Node::Object(instance) => Ok(instance),
            Node::Array(_) => Err(CoreError::NotAnObject { id }),
        }
    }

    pub fn object_mut(&mut self, id: ObjectId) -> Result<&mut Instance, CoreError> {
        match self.node_mut(id)? {
            Node::Object(instance) => Ok(instance),
            Node::Array(_) => Err(CoreError::NotAnObject { id }),
        }
    }

    pub fn array(&self, id: ObjectId) -> Result<&ArrayNode, CoreError> {
        match self.node(id)? {
            Node::Array(array) => Ok(array),
            Node::Object(_) => Err(CoreError::NotAnArray { id }),
        }
    }

    pub fn array_mut(&mut self, id: ObjectId) -> Result<&mut ArrayNode, CoreError> {
        match self.node_mut(id)? {
            Node::Array(array) => Ok(array),
            Node::Object(_) => Err(CoreError::NotAnArray { id }),
        }
    }

    /// Convenience: reads one property of an object.
    pub fn get(&self, id: ObjectId, name: &str) -> Result<&Value, CoreError> {
        Ok(self.object(id)?.get(name))
    }

    /// Convenience: writes one property of an object.
    pub fn set(
        &mut self,
        id: ObjectId,
        name: impl Into<String>,
        value: impl Into<Value>,
    ) -> Result<(), CoreError> {
        self.object_mut(id)?.set(name, value);
        Ok(())
    }

    /// Every node reachable from `root` (including `root`), in depth-first
    /// pre-order following fields and elements in declaration order.
    pub fn reachable(&self, root: ObjectId) -> Result<Vec<ObjectId>, CoreError> {
        let mut order = Vec::new();
        let mut seen = std::collections::HashSet::new();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            order.push(id);
            let refs = self.node(id)?.references();
            stack.extend(refs.into_iter().rev());
        }
        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PrimitiveType;

    #[test]
    fn unset_fields_read_as_null() {
        let mut graph = ObjectGraph::new();
        let id = graph.add_object(Instance::new("Person").with("name", "Ada"));
        assert_eq!(graph.get(id, "name").unwrap(), &Value::Text("Ada".into()));
        assert!(graph.get(id, "age").unwrap().is_null());
    }

    #[test]
    fn wrong_node_kind_is_reported() {
        let mut graph = ObjectGraph::new();
        let arr = graph.add_array(ArrayNode::new(
            TypeRef::Primitive(PrimitiveType::I64),
            vec![Value::Int(1)],
        ));
        assert!(matches!(graph.object(arr), Err(CoreError::NotAnObject { .. })));
        assert!(matches!(
            graph.node(ObjectId(99)),
            Err(CoreError::NodeNotFound { .. })
        ));
    }

    #[test]
    fn reachable_handles_cycles() {
        let mut graph = ObjectGraph::new();
        let a = graph.add_object(Instance::new("Node"));
        let b = graph.add_object(Instance::new("Node").with("next", a));
        graph.set(a, "next", b).unwrap();
        graph.set(a, "me", a).unwrap();
        assert_eq!(graph.reachable(a).unwrap(), vec![a, b]);
    }

    #[test]
    fn map_insert_replaces_existing_key() {
        let mut c = Collection::Map(Vec::new());
        c.insert("k".into(), Value::Int(1));
        c.insert("k".into(), Value::Int(2));
        assert_eq!(c.len(), 1);
        assert_eq!(c.flatten(), vec![Value::Text("k".into()), Value::Int(2)]);
    }
}
