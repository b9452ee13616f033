//! Path — a sequence of alternating nodes and relationships.

use serde::{Deserialize, Serialize};

use super::{Node, Relationship};

/// A traversal result: `nodes` always holds one more element than
/// `relationships`, and `relationships[i]` connects `nodes[i]` to
/// `nodes[i + 1]` (in either direction for undirected matches).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Path {
    pub nodes: Vec<Node>,
    pub relationships: Vec<Relationship>,
}

impl Path {
    /// A zero-length path: one node, no relationships.
    pub fn single(node: Node) -> Self {
        Self { nodes: vec![node], relationships: Vec::new() }
    }

    /// Path length in Cypher terms: the number of relationships.
    pub fn len(&self) -> usize {
        self.relationships.len()
    }

    pub fn is_empty(&self) -> bool {
        self.relationships.is_empty()
    }

    /// Extend with one hop.
    pub fn append(&mut self, rel: Relationship, node: Node) {
        self.relationships.push(rel);
        self.nodes.push(node);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{NodeId, RelId};

    #[test]
    fn test_length_counts_relationships() {
        let mut path = Path::single(Node::new(NodeId(1)));
        assert_eq!(path.len(), 0);
        assert!(path.is_empty());

        path.append(
            Relationship::new(RelId(10), NodeId(1), NodeId(2), "KNOWS"),
            Node::new(NodeId(2)),
        );
        path.append(
            Relationship::new(RelId(11), NodeId(2), NodeId(3), "KNOWS"),
            Node::new(NodeId(3)),
        );
        assert_eq!(path.len(), 2);
        assert_eq!(path.nodes.len(), 3);
    }
}
