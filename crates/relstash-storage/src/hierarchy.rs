//! The persisted class hierarchy as a petgraph digraph.
//!
//! `CLASS_HIERARCHY` collects one `superclass -> subclass` edge per class
//! level and interface the session has ever written. Loading it into a
//! [`DiGraph`] gives the transitive view of "every persisted class below X"
//! used by bulk deletes, which must consider every concrete subtype of the
//! class they were asked about.

use std::collections::HashMap;

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Dfs, Reversed};
use rusqlite::Connection;

use crate::error::StorageError;

/// Snapshot of `CLASS_HIERARCHY`.
#[derive(Debug, Default)]
pub struct ClassHierarchy {
    graph: DiGraph<String, ()>,
    index: HashMap<String, NodeIndex>,
}

impl ClassHierarchy {
    /// Reads every hierarchy edge.
    pub fn load(conn: &Connection) -> Result<Self, StorageError> {
        let mut hierarchy = ClassHierarchy::default();
        let mut stmt =
            conn.prepare_cached("SELECT SUPERCLASS, SUBCLASS FROM CLASS_HIERARCHY ORDER BY SUPERCLASS, SUBCLASS")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;
        for row in rows {
            let (superclass, subclass) = row?;
            hierarchy.add_edge(&superclass, &subclass);
        }
        Ok(hierarchy)
    }

    pub fn add_edge(&mut self, superclass: &str, subclass: &str) {
        let sup = self.node(superclass);
        let sub = self.node(subclass);
        self.graph.update_edge(sup, sub, ());
    }

    fn node(&mut self, name: &str) -> NodeIndex {
        if let Some(&idx) = self.index.get(name) {
            return idx;
        }
        let idx = self.graph.add_node(name.to_string());
        self.index.insert(name.to_string(), idx);
        idx
    }

    /// Every class known to inherit from or implement `class`, transitively,
    /// sorted by name. Does not include `class` itself.
    pub fn subclasses(&self, class: &str) -> Vec<String> {
        let Some(&start) = self.index.get(class) else {
            return Vec::new();
        };
        let mut found = Vec::new();
        let mut dfs = Dfs::new(&self.graph, start);
        while let Some(idx) = dfs.next(&self.graph) {
            if idx != start {
                found.push(self.graph[idx].clone());
            }
        }
        found.sort();
        found
    }

    /// Every class `class` inherits from or implements, transitively,
    /// sorted by name.
    pub fn superclasses(&self, class: &str) -> Vec<String> {
        let Some(&start) = self.index.get(class) else {
            return Vec::new();
        };
        let reversed = Reversed(&self.graph);
        let mut found = Vec::new();
        let mut dfs = Dfs::new(reversed, start);
        while let Some(idx) = dfs.next(reversed) {
            if idx != start {
                found.push(self.graph[idx].clone());
            }
        }
        found.sort();
        found
    }

    /// All class names in the hierarchy, sorted.
    pub fn classes(&self) -> Vec<String> {
        let mut names: Vec<String> = self.index.keys().cloned().collect();
        names.sort();
        names
    }

    /// All `(superclass, subclass)` edges, sorted.
    pub fn edges(&self) -> Vec<(String, String)> {
        let mut edges: Vec<(String, String)> = self
            .graph
            .edge_indices()
            .filter_map(|e| self.graph.edge_endpoints(e))
            .map(|(a, b)| (self.graph[a].clone(), self.graph[b].clone()))
            .collect();
        edges.sort();
        edges
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ClassHierarchy {
        let mut h = ClassHierarchy::default();
        h.add_edge("Object", "Animal");
        h.add_edge("Animal", "Dog");
        h.add_edge("Animal", "Cat");
        h.add_edge("Pet", "Dog");
        h
    }

    #[test]
    fn subclasses_are_transitive() {
        let h = sample();
        assert_eq!(h.subclasses("Object"), vec!["Animal", "Cat", "Dog"]);
        assert_eq!(h.subclasses("Pet"), vec!["Dog"]);
        assert!(h.subclasses("Dog").is_empty());
        assert!(h.subclasses("Unknown").is_empty());
    }

    #[test]
    fn superclasses_follow_reversed_edges() {
        let h = sample();
        assert_eq!(h.superclasses("Dog"), vec!["Animal", "Object", "Pet"]);
    }

    #[test]
    fn duplicate_edges_collapse() {
        let mut h = sample();
        h.add_edge("Animal", "Dog");
        assert_eq!(h.edges().len(), 4);
        assert_eq!(h.classes().len(), 5);
    }
}
