//! Deterministic content fingerprints of object graphs using blake3.
//!
//! Used to tell whether an in-memory graph still matches what is stored:
//! both sides are reduced to the same canonical form and hashed.
//!
//! # Canonical form
//!
//! - Nodes are numbered in depth-first discovery order from the root, and
//!   references are replaced by those ordinals, so arena handles never
//!   affect the result.
//! - Only stored properties count: transient and undeclared fields are
//!   skipped, as is the `ITEMS` backing array (the live collection contents
//!   are hashed instead).
//! - Properties are sorted by name; nulls are omitted.
//! - Values of float-typed properties are widened and rounded to the
//!   declared width first, the same way a load would.
//! - Each node is serialized with `serde_json::to_vec`; no `HashMap` is ever
//!   iterated.

use std::collections::HashMap;

use serde::Serialize;

use relstash_core::{
    Node, ObjectGraph, ObjectId, PrimitiveType, TypeIntrospector, TypeRef, Value, ITEMS_PROPERTY,
};

use crate::error::StorageError;

#[derive(Serialize)]
enum CanonicalValue {
    Inline(Value),
    Widened(f64),
    Ref(usize),
}

#[derive(Serialize)]
enum CanonicalNode<'a> {
    Object {
        class: &'a str,
        fields: Vec<(String, CanonicalValue)>,
        contents: Option<Vec<CanonicalValue>>,
    },
    Array {
        component: String,
        elements: Vec<CanonicalValue>,
    },
}

/// Stored properties of `class` as `(name, type)`, sorted by name.
fn stored_properties(
    introspector: &dyn TypeIntrospector,
    class: &str,
) -> Result<Vec<(String, TypeRef)>, StorageError> {
    let mut props: Vec<(String, TypeRef)> = introspector
        .chain(class)?
        .iter()
        .flat_map(|level| level.stored_properties())
        .filter(|p| p.name != ITEMS_PROPERTY)
        .map(|p| (p.name.clone(), p.ty.clone()))
        .collect();
    props.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(props)
}

/// Child handles of a node in canonical order.
fn canonical_children(
    graph: &ObjectGraph,
    introspector: &dyn TypeIntrospector,
    id: ObjectId,
) -> Result<Vec<ObjectId>, StorageError> {
    Ok(match graph.node(id)? {
        Node::Object(instance) => {
            let mut children: Vec<ObjectId> = stored_properties(introspector, &instance.class)?
                .iter()
                .filter_map(|(name, _)| instance.get(name).as_ref_id())
                .collect();
            if let Some(contents) = &instance.contents {
                children.extend(contents.flatten().iter().filter_map(Value::as_ref_id));
            }
            children
        }
        Node::Array(array) => array.elements.iter().filter_map(Value::as_ref_id).collect(),
    })
}

fn canonical_value(
    value: &Value,
    ty: Option<&TypeRef>,
    ordinals: &HashMap<ObjectId, usize>,
) -> CanonicalValue {
    match (value, ty) {
        (Value::Ref(id), _) => CanonicalValue::Ref(ordinals.get(id).copied().unwrap_or(usize::MAX)),
        (Value::Int(v), Some(TypeRef::Primitive(PrimitiveType::F32))) => {
            CanonicalValue::Widened(*v as f32 as f64)
        }
        (Value::Float(f), Some(TypeRef::Primitive(PrimitiveType::F32))) => {
            CanonicalValue::Widened(*f as f32 as f64)
        }
        (Value::Int(v), Some(TypeRef::Primitive(PrimitiveType::F64))) => {
            CanonicalValue::Widened(*v as f64)
        }
        (Value::Float(f), _) => CanonicalValue::Widened(*f),
        _ => CanonicalValue::Inline(value.clone()),
    }
}

/// Computes a blake3 fingerprint of everything reachable from `root`.
///
/// Two graphs get the same fingerprint iff they have the same stored
/// property values and the same reference topology.
pub fn fingerprint(
    graph: &ObjectGraph,
    root: ObjectId,
    introspector: &dyn TypeIntrospector,
) -> Result<blake3::Hash, StorageError> {
    let mut order: Vec<ObjectId> = Vec::new();
    let mut ordinals: HashMap<ObjectId, usize> = HashMap::new();
    let mut stack = vec![root];
    while let Some(id) = stack.pop() {
        if ordinals.contains_key(&id) {
            continue;
        }
        ordinals.insert(id, order.len());
        order.push(id);
        let children = canonical_children(graph, introspector, id)?;
        stack.extend(children.into_iter().rev());
    }

    let mut hasher = blake3::Hasher::new();
    for id in order {
        let canonical = match graph.node(id)? {
            Node::Object(instance) => {
                let props = stored_properties(introspector, &instance.class)?;
                let fields = props
                    .iter()
                    .filter(|(name, _)| !instance.get(name).is_null())
                    .map(|(name, ty)| {
                        let value = instance.get(name);
                        (name.clone(), canonical_value(value, Some(ty), &ordinals))
                    })
                    .collect();
                let contents = instance.contents.as_ref().map(|c| {
                    c.flatten()
                        .iter()
                        .map(|v| canonical_value(v, None, &ordinals))
                        .collect()
                });
                CanonicalNode::Object {
                    class: &instance.class,
                    fields,
                    contents,
                }
            }
            Node::Array(array) => CanonicalNode::Array {
                component: array.component.name(),
                elements: array
                    .elements
                    .iter()
                    .map(|v| canonical_value(v, Some(&array.component), &ordinals))
                    .collect(),
            },
        };
        hasher.update(&serde_json::to_vec(&canonical)?);
    }
    Ok(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use relstash_core::{ClassDescriptor, ClassRegistry, Instance};

    fn registry() -> ClassRegistry {
        let mut reg = ClassRegistry::new();
        reg.register(
            ClassDescriptor::new("Node")
                .property("label", TypeRef::Primitive(PrimitiveType::Text))
                .property("weight", TypeRef::Primitive(PrimitiveType::F64))
                .property("next", TypeRef::object("Node"))
                .transient_property("visits", TypeRef::Primitive(PrimitiveType::I64)),
        )
        .unwrap();
        reg
    }

    fn ring(graph: &mut ObjectGraph, labels: &[&str]) -> ObjectId {
        let ids: Vec<ObjectId> = labels
            .iter()
            .map(|l| graph.add_object(Instance::new("Node").with("label", *l)))
            .collect();
        for (i, id) in ids.iter().enumerate() {
            graph.set(*id, "next", ids[(i + 1) % ids.len()]).unwrap();
        }
        ids[0]
    }

    #[test]
    fn fingerprint_ignores_arena_layout() {
        let reg = registry();
        let mut a = ObjectGraph::new();
        let root_a = ring(&mut a, &["x", "y", "z"]);
        let mut b = ObjectGraph::new();
        b.add_object(Instance::new("Node"));
        let root_b = ring(&mut b, &["x", "y", "z"]);
        assert_eq!(
            fingerprint(&a, root_a, &reg).unwrap(),
            fingerprint(&b, root_b, &reg).unwrap()
        );
    }

    #[test]
    fn fingerprint_sees_values_and_topology() {
        let reg = registry();
        let mut g = ObjectGraph::new();
        let root = ring(&mut g, &["x", "y"]);
        let before = fingerprint(&g, root, &reg).unwrap();

        g.set(root, "label", "changed").unwrap();
        let relabeled = fingerprint(&g, root, &reg).unwrap();
        assert_ne!(before, relabeled);

        g.set(root, "next", root).unwrap();
        assert_ne!(relabeled, fingerprint(&g, root, &reg).unwrap());
    }

    #[test]
    fn transient_fields_and_float_widening_do_not_count() {
        let reg = registry();
        let mut g = ObjectGraph::new();
        let a = g.add_object(Instance::new("Node").with("weight", 2));
        let b = g.add_object(
            Instance::new("Node")
                .with("weight", 2.0)
                .with("visits", 10i64),
        );
        assert_eq!(
            fingerprint(&g, a, &reg).unwrap(),
            fingerprint(&g, b, &reg).unwrap()
        );
    }
}
