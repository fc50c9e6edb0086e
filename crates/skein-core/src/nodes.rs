// SPDX-License-Identifier: Apache-2.0
//! Node existence over time.
//!
//! A [`NodesCache`] is a [`Cache`] whose value is bare presence: a node
//! exists (`Some(())`) or has been removed (`None`). Anything falsy the
//! caller passes is coerced to the deletion marker so the storage is
//! uniform with the other caches.
//!
//! Deleting a node implicitly contradicts any plan that asserts an edge
//! touching it; the engine composes this cache's own contradiction scan
//! with [`EdgesCache::node_contradictions`](crate::edges::EdgesCache::node_contradictions)
//! before committing the deletion.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::cache::{Cache, Retrieved, StoreParams};
use crate::errors::HistoryError;
use crate::ident::{GraphName, NodeName};
use crate::keycache::KeycacheMode;
use crate::time::{Branch, BranchGraph, Tick, Turn};

/// Existence rows as bulk loading delivers them.
pub type NodeLoadRow = (GraphName, NodeName, Branch, Turn, Tick, bool);

/// Time-aware node existence for every graph.
pub struct NodesCache {
    inner: Cache<GraphName, NodeName, ()>,
}

impl Default for NodesCache {
    fn default() -> Self {
        Self::new()
    }
}

impl NodesCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Cache::new("nodes"),
        }
    }

    /// Records that `node` exists (or not) in `graph` as of the given time.
    ///
    /// # Errors
    ///
    /// Propagates history-ordering violations; see [`Cache::store`].
    #[allow(clippy::too_many_arguments)]
    pub fn store(
        &mut self,
        graph_name: GraphName,
        node: NodeName,
        branch: &Branch,
        turn: Turn,
        tick: Tick,
        exists: bool,
        graph: &BranchGraph,
        params: StoreParams,
    ) -> Result<(), HistoryError> {
        let presence = exists.then_some(());
        self.inner
            .store(graph_name, node, branch, turn, tick, presence, graph, params)
    }

    /// Whether `node` exists in `graph_name` at the given time.
    #[must_use]
    pub fn node_exists(
        &self,
        graph_name: &GraphName,
        node: &NodeName,
        branch: &Branch,
        turn: Turn,
        tick: Tick,
        graph: &BranchGraph,
    ) -> bool {
        matches!(
            self.inner
                .base_retrieve(graph_name, node, branch, turn, tick, graph),
            Retrieved::Value(())
        )
    }

    /// The set of nodes extant in `graph_name` at the given time.
    pub fn nodes_at(
        &mut self,
        graph_name: &GraphName,
        branch: &Branch,
        turn: Turn,
        tick: Tick,
        graph: &BranchGraph,
        mode: KeycacheMode,
    ) -> Arc<BTreeSet<NodeName>> {
        self.inner
            .keys_at(graph_name, branch, turn, tick, graph, mode)
    }

    /// Number of nodes extant in `graph_name` at the given time.
    pub fn count_nodes(
        &mut self,
        graph_name: &GraphName,
        branch: &Branch,
        turn: Turn,
        tick: Tick,
        graph: &BranchGraph,
        mode: KeycacheMode,
    ) -> usize {
        self.inner
            .count_keys(graph_name, branch, turn, tick, graph, mode)
    }

    /// Bulk-loads pre-sorted existence rows.
    ///
    /// # Errors
    ///
    /// Propagates ordering violations from the append-only history.
    pub fn load(&mut self, rows: Vec<NodeLoadRow>, graph: &BranchGraph) -> Result<(), HistoryError> {
        let rows = rows
            .into_iter()
            .map(|(g, n, b, tn, tk, ex)| (g, n, b, tn, tk, ex.then_some(())))
            .collect();
        self.inner.load(rows, graph)
    }

    /// The underlying generic cache, for index-level operations the engine
    /// drives directly (journals, keyframes, truncation, rollback).
    #[must_use]
    pub fn raw(&self) -> &Cache<GraphName, NodeName, ()> {
        &self.inner
    }

    /// Mutable access to the underlying generic cache.
    pub fn raw_mut(&mut self) -> &mut Cache<GraphName, NodeName, ()> {
        &mut self.inner
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn params() -> StoreParams {
        StoreParams {
            planning: false,
            loading: false,
            keycache: KeycacheMode::plain(),
        }
    }

    #[test]
    fn falsy_existence_is_a_deletion_marker() {
        let g = BranchGraph::new();
        let trunk = Branch::trunk();
        let mut c = NodesCache::new();
        let graph = GraphName::new("town");
        let node = NodeName::new("tavern");
        c.store(graph.clone(), node.clone(), &trunk, Turn(0), Tick(0), true, &g, params())
            .unwrap();
        c.store(graph.clone(), node.clone(), &trunk, Turn(2), Tick(0), false, &g, params())
            .unwrap();
        assert!(c.node_exists(&graph, &node, &trunk, Turn(1), Tick(0), &g));
        assert!(!c.node_exists(&graph, &node, &trunk, Turn(2), Tick(0), &g));
        // Deleted is not the same as never-known, at the raw level.
        assert_eq!(
            c.raw()
                .base_retrieve(&graph, &node, &trunk, Turn(2), Tick(0), &g),
            Retrieved::Tombstone
        );
    }

    #[test]
    fn nodes_at_enumerates_the_living() {
        let g = BranchGraph::new();
        let trunk = Branch::trunk();
        let mut c = NodesCache::new();
        let graph = GraphName::new("town");
        for (name, t) in [("tavern", 0), ("well", 1), ("keep", 2)] {
            c.store(
                graph.clone(),
                NodeName::new(name),
                &trunk,
                Turn(t),
                Tick(0),
                true,
                &g,
                params(),
            )
            .unwrap();
        }
        c.store(
            graph.clone(),
            NodeName::new("well"),
            &trunk,
            Turn(3),
            Tick(0),
            false,
            &g,
            params(),
        )
        .unwrap();
        let now = c.nodes_at(&graph, &trunk, Turn(3), Tick(0), &g, KeycacheMode::plain());
        assert_eq!(
            now.iter().map(NodeName::as_str).collect::<Vec<_>>(),
            vec!["keep", "tavern"]
        );
        assert_eq!(
            c.count_nodes(&graph, &trunk, Turn(1), Tick(0), &g, KeycacheMode::plain()),
            2
        );
    }
}
