// SPDX-License-Identifier: Apache-2.0
//! Net-change deltas between two time points.
//!
//! A delta folds every journaled write in a half-open window into one
//! change-set per graph: stat values, node existence, node stats, edge
//! existence, edge stats, and whole-graph deletion. The same shape serves
//! keyframe reconstruction (apply a delta to an old keyframe to get a new
//! one) and change notification to the layers above.
//!
//! Folding rules carry precedence: a node reported deleted masks its stat
//! changes, a deleted edge masks its stat changes, and a deleted graph
//! masks everything under it.

use std::collections::BTreeMap;

use crate::ident::{EdgeRef, GraphName, NodeName, StatKey};

/// Changes to one graph between two times.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GraphDelta<V> {
    /// Graph-stat changes; `None` marks deletion of the stat.
    pub stats: BTreeMap<StatKey, Option<V>>,
    /// Node existence changes.
    pub nodes: BTreeMap<NodeName, bool>,
    /// Node-stat changes; `None` marks deletion of the stat.
    pub node_stats: BTreeMap<NodeName, BTreeMap<StatKey, Option<V>>>,
    /// Edge existence changes.
    pub edges: BTreeMap<EdgeRef, bool>,
    /// Edge-stat changes; `None` marks deletion of the stat.
    pub edge_stats: BTreeMap<EdgeRef, BTreeMap<StatKey, Option<V>>>,
}

impl<V> Default for GraphDelta<V> {
    fn default() -> Self {
        Self {
            stats: BTreeMap::new(),
            nodes: BTreeMap::new(),
            node_stats: BTreeMap::new(),
            edges: BTreeMap::new(),
            edge_stats: BTreeMap::new(),
        }
    }
}

impl<V> GraphDelta<V> {
    /// Whether the delta records no change at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stats.is_empty()
            && self.nodes.is_empty()
            && self.node_stats.is_empty()
            && self.edges.is_empty()
            && self.edge_stats.is_empty()
    }
}

/// What happened to a graph over the window.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum GraphChange<V> {
    /// The graph itself was deleted.
    Deleted,
    /// The graph survived with these changes.
    Updated(GraphDelta<V>),
}

/// Changes to every graph between two times.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct WorldDelta<V> {
    /// Per-graph changes, keyed by graph name.
    pub graphs: BTreeMap<GraphName, GraphChange<V>>,
}

impl<V> Default for WorldDelta<V> {
    fn default() -> Self {
        Self {
            graphs: BTreeMap::new(),
        }
    }
}

impl<V> WorldDelta<V> {
    /// Creates an empty delta.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the delta records no change at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.graphs.values().all(|c| match c {
            GraphChange::Deleted => false,
            GraphChange::Updated(d) => d.is_empty(),
        })
    }

    /// The delta for one graph, if it survived the window.
    #[must_use]
    pub fn updated(&self, graph: &GraphName) -> Option<&GraphDelta<V>> {
        match self.graphs.get(graph)? {
            GraphChange::Updated(d) => Some(d),
            GraphChange::Deleted => None,
        }
    }

    fn updated_mut(&mut self, graph: &GraphName) -> Option<&mut GraphDelta<V>> {
        let entry = self
            .graphs
            .entry(graph.clone())
            .or_insert_with(|| GraphChange::Updated(GraphDelta::default()));
        match entry {
            GraphChange::Updated(d) => Some(d),
            // Writes under a graph the delta already reports deleted are
            // masked.
            GraphChange::Deleted => None,
        }
    }

    /// Records that the graph was created or deleted over the window.
    pub fn set_graph_exists(&mut self, graph: &GraphName, exists: bool) {
        if exists {
            let entry = self
                .graphs
                .entry(graph.clone())
                .or_insert_with(|| GraphChange::Updated(GraphDelta::default()));
            if matches!(entry, GraphChange::Deleted) {
                *entry = GraphChange::Updated(GraphDelta::default());
            }
        } else {
            self.graphs.insert(graph.clone(), GraphChange::Deleted);
        }
    }

    /// Records a graph-stat change.
    pub fn set_graph_stat(&mut self, graph: &GraphName, key: StatKey, value: Option<V>) {
        if let Some(d) = self.updated_mut(graph) {
            d.stats.insert(key, value);
        }
    }

    /// Records a node existence change.
    pub fn set_node(&mut self, graph: &GraphName, node: NodeName, exists: bool) {
        if let Some(d) = self.updated_mut(graph) {
            if !exists {
                d.node_stats.remove(&node);
            }
            d.nodes.insert(node, exists);
        }
    }

    /// Records a node-stat change; masked when the delta already reports
    /// the node deleted.
    pub fn set_node_stat(
        &mut self,
        graph: &GraphName,
        node: &NodeName,
        key: StatKey,
        value: Option<V>,
    ) {
        if let Some(d) = self.updated_mut(graph) {
            if d.nodes.get(node) == Some(&false) {
                return;
            }
            d.node_stats
                .entry(node.clone())
                .or_default()
                .insert(key, value);
        }
    }

    /// Records an edge existence change.
    pub fn set_edge(&mut self, graph: &GraphName, edge: EdgeRef, exists: bool) {
        if let Some(d) = self.updated_mut(graph) {
            if !exists {
                d.edge_stats.remove(&edge);
            }
            d.edges.insert(edge, exists);
        }
    }

    /// Records an edge-stat change; masked when the delta already reports
    /// the edge deleted.
    pub fn set_edge_stat(
        &mut self,
        graph: &GraphName,
        edge: &EdgeRef,
        key: StatKey,
        value: Option<V>,
    ) {
        if let Some(d) = self.updated_mut(graph) {
            if d.edges.get(edge) == Some(&false) {
                return;
            }
            d.edge_stats
                .entry(edge.clone())
                .or_default()
                .insert(key, value);
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn node_deletion_masks_stat_changes() {
        let mut d: WorldDelta<i64> = WorldDelta::new();
        let g = GraphName::new("town");
        let n = NodeName::new("tavern");
        d.set_node_stat(&g, &n, StatKey::new("beer"), Some(3));
        d.set_node(&g, n.clone(), false);
        // A stat write arriving after the deletion is masked.
        d.set_node_stat(&g, &n, StatKey::new("beer"), Some(4));
        let gd = d.updated(&g).unwrap();
        assert_eq!(gd.nodes.get(&n), Some(&false));
        assert!(gd.node_stats.get(&n).is_none());
    }

    #[test]
    fn graph_deletion_masks_everything_under_it() {
        let mut d: WorldDelta<i64> = WorldDelta::new();
        let g = GraphName::new("town");
        d.set_graph_exists(&g, false);
        d.set_graph_stat(&g, StatKey::new("weather"), Some(1));
        assert_eq!(d.graphs.get(&g), Some(&GraphChange::Deleted));
        // Re-creation replaces the deletion marker.
        d.set_graph_exists(&g, true);
        assert!(d.updated(&g).is_some());
    }

    #[test]
    fn empty_deltas_know_they_are_empty() {
        let mut d: WorldDelta<i64> = WorldDelta::new();
        assert!(d.is_empty());
        d.set_graph_exists(&GraphName::new("g"), true);
        assert!(d.is_empty());
        d.set_node(&GraphName::new("g"), NodeName::new("n"), true);
        assert!(!d.is_empty());
    }
}
