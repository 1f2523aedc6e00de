//! Knowledge-graph node and edge model.
//!
//! Nodes and edges never store a single flat description. Instead every
//! chunk that mentions an entity (or relation) contributes a *fragment*
//! keyed by its chunk id, and the visible fields are rebuilt from the
//! fragment set. Merging a new document means adding fragments; deleting a
//! document means dropping the fragments of its chunks. Neither operation
//! overwrites what other documents contributed.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use serde::{Deserialize, Serialize};

/// Entity type given to relation endpoints that were never extracted as
/// entities in their own right.
pub const UNKNOWN_ENTITY_TYPE: &str = "UNKNOWN";

/// Separator between merged description fragments.
pub const DESCRIPTION_SEP: &str = "\n";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityFragment {
    pub entity_type: String,
    pub description: String,
    pub file_path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationFragment {
    pub description: String,
    pub keywords: Vec<String>,
    pub weight: f64,
    pub file_path: String,
}

/// A graph entity, merged across every chunk that mentions it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    pub name: String,
    pub entity_type: String,
    pub description: String,
    pub fragments: BTreeMap<String, EntityFragment>,
}

impl GraphNode {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entity_type: UNKNOWN_ENTITY_TYPE.to_string(),
            description: String::new(),
            fragments: BTreeMap::new(),
        }
    }

    /// Add (or replace) the fragment contributed by `chunk_id`.
    pub fn absorb(&mut self, chunk_id: &str, fragment: EntityFragment) {
        self.fragments.insert(chunk_id.to_string(), fragment);
        self.refresh();
    }

    /// Drop fragments of the given chunks. Returns `false` when nothing is left.
    pub fn drop_chunks(&mut self, chunk_ids: &HashSet<String>) -> bool {
        self.fragments.retain(|k, _| !chunk_ids.contains(k));
        self.refresh();
        !self.fragments.is_empty()
    }

    pub fn source_chunks(&self) -> impl Iterator<Item = &String> {
        self.fragments.keys()
    }

    pub fn file_paths(&self) -> BTreeSet<&str> {
        self.fragments.values().map(|f| f.file_path.as_str()).collect()
    }

    fn refresh(&mut self) {
        // Majority vote; UNKNOWN only wins when nothing else was seen.
        let mut votes: BTreeMap<&str, usize> = BTreeMap::new();
        for f in self.fragments.values() {
            if f.entity_type != UNKNOWN_ENTITY_TYPE {
                *votes.entry(f.entity_type.as_str()).or_default() += 1;
            }
        }
        self.entity_type = votes
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
            .map(|(t, _)| t.to_string())
            .unwrap_or_else(|| UNKNOWN_ENTITY_TYPE.to_string());
        self.description = join_unique(self.fragments.values().map(|f| f.description.as_str()));
    }
}

/// An undirected relation between two entities.
///
/// `source <= target` always holds; use [`GraphEdge::key`] to normalize.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphEdge {
    pub source: String,
    pub target: String,
    pub description: String,
    pub keywords: Vec<String>,
    pub weight: f64,
    pub fragments: BTreeMap<String, RelationFragment>,
}

impl GraphEdge {
    pub fn new(a: &str, b: &str) -> Self {
        let (source, target) = Self::key(a, b);
        Self {
            source,
            target,
            description: String::new(),
            keywords: Vec::new(),
            weight: 0.0,
            fragments: BTreeMap::new(),
        }
    }

    /// Normalized (sorted) endpoint pair.
    pub fn key(a: &str, b: &str) -> (String, String) {
        if a <= b {
            (a.to_string(), b.to_string())
        } else {
            (b.to_string(), a.to_string())
        }
    }

    pub fn endpoints(&self) -> (String, String) {
        (self.source.clone(), self.target.clone())
    }

    pub fn absorb(&mut self, chunk_id: &str, fragment: RelationFragment) {
        self.fragments.insert(chunk_id.to_string(), fragment);
        self.refresh();
    }

    pub fn drop_chunks(&mut self, chunk_ids: &HashSet<String>) -> bool {
        self.fragments.retain(|k, _| !chunk_ids.contains(k));
        self.refresh();
        !self.fragments.is_empty()
    }

    pub fn source_chunks(&self) -> impl Iterator<Item = &String> {
        self.fragments.keys()
    }

    fn refresh(&mut self) {
        self.weight = self.fragments.values().map(|f| f.weight).sum();
        let keywords: BTreeSet<&str> = self
            .fragments
            .values()
            .flat_map(|f| f.keywords.iter().map(String::as_str))
            .collect();
        self.keywords = keywords.into_iter().map(str::to_string).collect();
        self.description = join_unique(self.fragments.values().map(|f| f.description.as_str()));
    }
}

/// The complete new state of every node and edge touched by one document.
///
/// Backends apply a batch atomically: either all of it lands or none.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphBatch {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
}

impl GraphBatch {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.edges.is_empty()
    }
}

/// What a chunk removal did to the graph.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GraphRemoval {
    /// Nodes that lost their last fragment and were deleted.
    pub removed_nodes: Vec<String>,
    /// Edges that lost their last fragment (or an endpoint) and were deleted.
    pub removed_edges: Vec<(String, String)>,
    /// Nodes that survived with fewer fragments.
    pub updated_nodes: Vec<GraphNode>,
    pub updated_edges: Vec<GraphEdge>,
}

/// Plain map-backed graph state.
///
/// Shared by the in-memory backend and by the SQLite backend's removal
/// logic, which loads the affected rows into one of these first.
#[derive(Debug, Clone, Default)]
pub struct GraphState {
    pub nodes: HashMap<String, GraphNode>,
    pub edges: HashMap<(String, String), GraphEdge>,
}

impl GraphState {
    pub fn apply(&mut self, batch: &GraphBatch) {
        for node in &batch.nodes {
            self.nodes.insert(node.name.clone(), node.clone());
        }
        for edge in &batch.edges {
            self.edges.insert(edge.endpoints(), edge.clone());
        }
    }

    pub fn degree(&self, name: &str) -> usize {
        self.edges
            .keys()
            .filter(|(s, t)| s == name || t == name)
            .count()
    }

    /// Drop every fragment contributed by `chunk_ids`.
    pub fn remove_chunks(&mut self, chunk_ids: &HashSet<String>) -> GraphRemoval {
        let mut removal = GraphRemoval::default();

        let touched_nodes: Vec<String> = self
            .nodes
            .values()
            .filter(|n| n.source_chunks().any(|c| chunk_ids.contains(c)))
            .map(|n| n.name.clone())
            .collect();
        for name in touched_nodes {
            if let Some(node) = self.nodes.get_mut(&name) {
                if node.drop_chunks(chunk_ids) {
                    removal.updated_nodes.push(node.clone());
                } else {
                    self.nodes.remove(&name);
                    removal.removed_nodes.push(name);
                }
            }
        }

        let removed: HashSet<&String> = removal.removed_nodes.iter().collect();
        let touched_edges: Vec<(String, String)> = self
            .edges
            .iter()
            .filter(|(key, e)| {
                removed.contains(&key.0)
                    || removed.contains(&key.1)
                    || e.source_chunks().any(|c| chunk_ids.contains(c))
            })
            .map(|(key, _)| key.clone())
            .collect();
        for key in touched_edges {
            let orphaned = removed.contains(&key.0) || removed.contains(&key.1);
            if let Some(edge) = self.edges.get_mut(&key) {
                if !orphaned && edge.drop_chunks(chunk_ids) {
                    removal.updated_edges.push(edge.clone());
                } else {
                    self.edges.remove(&key);
                    removal.removed_edges.push(key);
                }
            }
        }

        removal.removed_nodes.sort();
        removal.removed_edges.sort();
        removal
    }
}

fn join_unique<'a>(parts: impl Iterator<Item = &'a str>) -> String {
    let mut seen = HashSet::new();
    let mut out: Vec<&str> = Vec::new();
    for p in parts {
        let p = p.trim();
        if !p.is_empty() && seen.insert(p) {
            out.push(p);
        }
    }
    out.join(DESCRIPTION_SEP)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ent(t: &str, d: &str) -> EntityFragment {
        EntityFragment {
            entity_type: t.to_string(),
            description: d.to_string(),
            file_path: "a.md".to_string(),
        }
    }

    fn rel(d: &str, w: f64) -> RelationFragment {
        RelationFragment {
            description: d.to_string(),
            keywords: vec!["k".to_string()],
            weight: w,
            file_path: "a.md".to_string(),
        }
    }

    #[test]
    fn test_node_merges_fragments() {
        let mut n = GraphNode::new("Rust");
        n.absorb("c1", ent("LANGUAGE", "A systems language."));
        n.absorb("c2", ent("LANGUAGE", "Memory safe."));
        n.absorb("c3", ent("PROJECT", "A systems language."));
        assert_eq!(n.entity_type, "LANGUAGE");
        assert_eq!(n.description, "A systems language.\nMemory safe.");
    }

    #[test]
    fn test_unknown_type_loses_to_real_type() {
        let mut n = GraphNode::new("X");
        n.absorb("c1", ent(UNKNOWN_ENTITY_TYPE, ""));
        assert_eq!(n.entity_type, UNKNOWN_ENTITY_TYPE);
        n.absorb("c2", ent("PERSON", "someone"));
        assert_eq!(n.entity_type, "PERSON");
    }

    #[test]
    fn test_edge_key_is_order_independent() {
        assert_eq!(GraphEdge::key("b", "a"), GraphEdge::key("a", "b"));
        let e = GraphEdge::new("zeta", "alpha");
        assert_eq!(e.source, "alpha");
    }

    #[test]
    fn test_edge_weight_sums() {
        let mut e = GraphEdge::new("a", "b");
        e.absorb("c1", rel("uses", 1.0));
        e.absorb("c2", rel("depends on", 2.5));
        assert!((e.weight - 3.5).abs() < 1e-9);
        assert_eq!(e.keywords, vec!["k".to_string()]);
    }

    #[test]
    fn test_remove_chunks_is_exact() {
        let mut state = GraphState::default();
        let mut a = GraphNode::new("A");
        a.absorb("c1", ent("T", "from doc one"));
        a.absorb("c2", ent("T", "from doc two"));
        let mut b = GraphNode::new("B");
        b.absorb("c1", ent("T", "only doc one"));
        let mut e = GraphEdge::new("A", "B");
        e.absorb("c1", rel("r", 1.0));
        state.apply(&GraphBatch {
            nodes: vec![a, b],
            edges: vec![e],
        });
        assert_eq!(state.degree("A"), 1);

        let removal = state.remove_chunks(&HashSet::from(["c1".to_string()]));
        assert_eq!(removal.removed_nodes, vec!["B".to_string()]);
        assert_eq!(removal.removed_edges.len(), 1);
        let a = &state.nodes["A"];
        assert_eq!(a.description, "from doc two");
        assert_eq!(state.degree("A"), 0);
    }
}
