// SPDX-License-Identifier: Apache-2.0
//! Edge existence over time, with successor/predecessor indices.
//!
//! An edge is addressed by `(graph, orig, dest, idx)`: the entity is the
//! node pair and the key is the parallel-edge index, so enumeration over an
//! entity's keys answers "which parallel edges connect these two nodes?"
//!
//! On top of the generic cache this maintains the neighbor surfaces the
//! graph layer actually queries: `has_successor`/`iter_successors`/
//! `count_successors` and their predecessor mirrors, each backed by its own
//! forward-optimized key-set memo (`destcache`/`origcache`) scoped to
//! "neighbors of X" instead of "keys of X".

use std::collections::BTreeSet;
use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::cache::{Cache, Retrieved, StoreParams};
use crate::errors::HistoryError;
use crate::ident::{EdgeIdx, GraphName, NodeName};
use crate::keycache::{KeySetCache, KeycacheMode, KEYCACHE_MAXSIZE};
use crate::time::{Branch, BranchGraph, StopTime, Tick, Turn};

/// Entity address of an edge bundle: graph, origin, destination.
pub type EdgeEntity = (GraphName, NodeName, NodeName);

/// Existence rows as bulk loading delivers them.
pub type EdgeLoadRow = (
    GraphName,
    NodeName,
    NodeName,
    EdgeIdx,
    Branch,
    Turn,
    Tick,
    bool,
);

/// Which neighbor direction a scan walks.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum NeighborSide {
    /// Destinations reachable from an origin.
    Successors,
    /// Origins leading to a destination.
    Predecessors,
}

/// Time-aware edge existence for every graph, with neighbor indices.
pub struct EdgesCache {
    inner: Cache<EdgeEntity, EdgeIdx, ()>,
    /// Destinations ever seen per `(graph, orig)`.
    successors: FxHashMap<(GraphName, NodeName), BTreeSet<NodeName>>,
    /// Origins ever seen per `(graph, dest)`.
    predecessors: FxHashMap<(GraphName, NodeName), BTreeSet<NodeName>>,
    /// Memoized successor sets per `(graph, orig, branch)`.
    destcache: KeySetCache<(GraphName, NodeName, Branch), NodeName>,
    /// Memoized predecessor sets per `(graph, dest, branch)`.
    origcache: KeySetCache<(GraphName, NodeName, Branch), NodeName>,
}

impl Default for EdgesCache {
    fn default() -> Self {
        Self::new()
    }
}

impl EdgesCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Cache::new("edges"),
            successors: FxHashMap::default(),
            predecessors: FxHashMap::default(),
            destcache: KeySetCache::new(KEYCACHE_MAXSIZE),
            origcache: KeySetCache::new(KEYCACHE_MAXSIZE),
        }
    }

    /// Records that the edge `(orig, dest, idx)` exists (or not) in
    /// `graph_name` as of the given time, keeping both neighbor indices
    /// and their memos in sync.
    ///
    /// # Errors
    ///
    /// Propagates history-ordering violations; see [`Cache::store`].
    #[allow(clippy::too_many_arguments)]
    pub fn store(
        &mut self,
        graph_name: GraphName,
        orig: NodeName,
        dest: NodeName,
        idx: EdgeIdx,
        branch: &Branch,
        turn: Turn,
        tick: Tick,
        exists: bool,
        graph: &BranchGraph,
        params: StoreParams,
    ) -> Result<(), HistoryError> {
        let presence = exists.then_some(());
        self.inner.store(
            (graph_name.clone(), orig.clone(), dest.clone()),
            idx,
            branch,
            turn,
            tick,
            presence,
            graph,
            params,
        )?;
        self.successors
            .entry((graph_name.clone(), orig.clone()))
            .or_default()
            .insert(dest.clone());
        self.predecessors
            .entry((graph_name.clone(), dest.clone()))
            .or_default()
            .insert(orig.clone());
        if params.keycache.enabled && !params.loading {
            self.note_neighbor_write(
                &graph_name, &orig, &dest, branch, turn, tick, exists, graph, params,
            );
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn note_neighbor_write(
        &mut self,
        graph_name: &GraphName,
        orig: &NodeName,
        dest: &NodeName,
        branch: &Branch,
        turn: Turn,
        tick: Tick,
        exists: bool,
        graph: &BranchGraph,
        params: StoreParams,
    ) {
        // An edge toward a node that still has another parallel edge or
        // another connecting index is still a neighbor; derive presence
        // from the full index set rather than this one write.
        let dest_present = exists
            || self.any_live_index(graph_name, orig, dest, branch, turn, tick, graph);
        let dkey = (graph_name.clone(), orig.clone(), branch.clone());
        self.destcache.invalidate_from_turn(&dkey, turn);
        {
            let Self {
                inner,
                successors,
                destcache,
                ..
            } = self;
            destcache.note_write(
                &dkey,
                turn,
                tick,
                dest,
                dest_present,
                params.keycache.forward,
                |stop| {
                    neighbor_adds_dels(
                        inner,
                        successors,
                        NeighborSide::Successors,
                        graph_name,
                        orig,
                        graph,
                        branch,
                        turn,
                        tick,
                        stop,
                    )
                },
            );
        }
        let okey = (graph_name.clone(), dest.clone(), branch.clone());
        self.origcache.invalidate_from_turn(&okey, turn);
        let Self {
            inner,
            predecessors,
            origcache,
            ..
        } = self;
        origcache.note_write(
            &okey,
            turn,
            tick,
            orig,
            dest_present,
            params.keycache.forward,
            |stop| {
                neighbor_adds_dels(
                    inner,
                    predecessors,
                    NeighborSide::Predecessors,
                    graph_name,
                    dest,
                    graph,
                    branch,
                    turn,
                    tick,
                    stop,
                )
            },
        );
    }

    /// Whether any parallel edge between `orig` and `dest` is live at the
    /// given time.
    #[allow(clippy::too_many_arguments)]
    fn any_live_index(
        &self,
        graph_name: &GraphName,
        orig: &NodeName,
        dest: &NodeName,
        branch: &Branch,
        turn: Turn,
        tick: Tick,
        graph: &BranchGraph,
    ) -> bool {
        let entity = (graph_name.clone(), orig.clone(), dest.clone());
        self.inner.keys_ever(&entity).any(|idx| {
            matches!(
                self.inner
                    .base_retrieve(&entity, idx, branch, turn, tick, graph),
                Retrieved::Value(())
            )
        })
    }

    /// Whether the exact edge `(orig, dest, idx)` exists at the given time.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn edge_exists(
        &self,
        graph_name: &GraphName,
        orig: &NodeName,
        dest: &NodeName,
        idx: EdgeIdx,
        branch: &Branch,
        turn: Turn,
        tick: Tick,
        graph: &BranchGraph,
    ) -> bool {
        matches!(
            self.inner.base_retrieve(
                &(graph_name.clone(), orig.clone(), dest.clone()),
                &idx,
                branch,
                turn,
                tick,
                graph
            ),
            Retrieved::Value(())
        )
    }

    /// The set of destinations succeeding `orig` at the given time.
    #[allow(clippy::too_many_arguments)]
    pub fn successors_at(
        &mut self,
        graph_name: &GraphName,
        orig: &NodeName,
        branch: &Branch,
        turn: Turn,
        tick: Tick,
        graph: &BranchGraph,
        mode: KeycacheMode,
    ) -> Arc<BTreeSet<NodeName>> {
        let Self {
            inner,
            successors,
            destcache,
            ..
        } = self;
        let adds_dels = |stop: Option<(Turn, Tick)>| {
            neighbor_adds_dels(
                inner,
                successors,
                NeighborSide::Successors,
                graph_name,
                orig,
                graph,
                branch,
                turn,
                tick,
                stop,
            )
        };
        if !mode.enabled {
            return Arc::new(adds_dels(None).0);
        }
        destcache.get_or_build(
            &(graph_name.clone(), orig.clone(), branch.clone()),
            turn,
            tick,
            mode.forward,
            adds_dels,
        )
    }

    /// The set of origins preceding `dest` at the given time.
    #[allow(clippy::too_many_arguments)]
    pub fn predecessors_at(
        &mut self,
        graph_name: &GraphName,
        dest: &NodeName,
        branch: &Branch,
        turn: Turn,
        tick: Tick,
        graph: &BranchGraph,
        mode: KeycacheMode,
    ) -> Arc<BTreeSet<NodeName>> {
        let Self {
            inner,
            predecessors,
            origcache,
            ..
        } = self;
        let adds_dels = |stop: Option<(Turn, Tick)>| {
            neighbor_adds_dels(
                inner,
                predecessors,
                NeighborSide::Predecessors,
                graph_name,
                dest,
                graph,
                branch,
                turn,
                tick,
                stop,
            )
        };
        if !mode.enabled {
            return Arc::new(adds_dels(None).0);
        }
        origcache.get_or_build(
            &(graph_name.clone(), dest.clone(), branch.clone()),
            turn,
            tick,
            mode.forward,
            adds_dels,
        )
    }

    /// Whether any edge connects `orig` to `dest` at the given time,
    /// without needing the edge's index.
    #[allow(clippy::too_many_arguments)]
    pub fn has_successor(
        &mut self,
        graph_name: &GraphName,
        orig: &NodeName,
        dest: &NodeName,
        branch: &Branch,
        turn: Turn,
        tick: Tick,
        graph: &BranchGraph,
        mode: KeycacheMode,
    ) -> bool {
        self.successors_at(graph_name, orig, branch, turn, tick, graph, mode)
            .contains(dest)
    }

    /// Whether any edge connects `orig` to `dest` at the given time,
    /// querying from the destination side.
    #[allow(clippy::too_many_arguments)]
    pub fn has_predecessor(
        &mut self,
        graph_name: &GraphName,
        dest: &NodeName,
        orig: &NodeName,
        branch: &Branch,
        turn: Turn,
        tick: Tick,
        graph: &BranchGraph,
        mode: KeycacheMode,
    ) -> bool {
        self.predecessors_at(graph_name, dest, branch, turn, tick, graph, mode)
            .contains(orig)
    }

    /// Number of distinct successors of `orig` at the given time.
    #[allow(clippy::too_many_arguments)]
    pub fn count_successors(
        &mut self,
        graph_name: &GraphName,
        orig: &NodeName,
        branch: &Branch,
        turn: Turn,
        tick: Tick,
        graph: &BranchGraph,
        mode: KeycacheMode,
    ) -> usize {
        self.successors_at(graph_name, orig, branch, turn, tick, graph, mode)
            .len()
    }

    /// Number of distinct predecessors of `dest` at the given time.
    #[allow(clippy::too_many_arguments)]
    pub fn count_predecessors(
        &mut self,
        graph_name: &GraphName,
        dest: &NodeName,
        branch: &Branch,
        turn: Turn,
        tick: Tick,
        graph: &BranchGraph,
        mode: KeycacheMode,
    ) -> usize {
        self.predecessors_at(graph_name, dest, branch, turn, tick, graph, mode)
            .len()
    }

    /// Future times at which a plan asserts a live edge touching `node`.
    ///
    /// Deleting the node contradicts every one of them: the engine deletes
    /// those plans before committing the node's removal.
    pub fn node_contradictions(
        &self,
        graph_name: &GraphName,
        node: &NodeName,
        branch: &Branch,
        turn: Turn,
        tick: Tick,
    ) -> Vec<(Turn, Tick)> {
        let mut out = Vec::new();
        let as_orig = self
            .successors
            .get(&(graph_name.clone(), node.clone()))
            .into_iter()
            .flatten()
            .map(|dest| (graph_name.clone(), node.clone(), dest.clone()));
        let as_dest = self
            .predecessors
            .get(&(graph_name.clone(), node.clone()))
            .into_iter()
            .flatten()
            .map(|orig| (graph_name.clone(), orig.clone(), node.clone()));
        for entity in as_orig.chain(as_dest) {
            for idx in self.inner.keys_ever(&entity) {
                // Future writes that disagree with "absent" are exactly the
                // planned live edges.
                out.extend(self.inner.future_contradictions(
                    &entity, idx, branch, turn, tick, &None,
                ));
            }
        }
        out.sort_unstable();
        out.dedup();
        out
    }

    /// Bulk-loads pre-sorted existence rows, keeping the neighbor indices
    /// in sync.
    ///
    /// # Errors
    ///
    /// Propagates ordering violations from the append-only history.
    pub fn load(&mut self, rows: Vec<EdgeLoadRow>, graph: &BranchGraph) -> Result<(), HistoryError> {
        for (g, o, d, idx, b, tn, tk, ex) in rows {
            self.store(
                g,
                o,
                d,
                idx,
                &b,
                tn,
                tk,
                ex,
                graph,
                StoreParams {
                    planning: false,
                    loading: true,
                    keycache: KeycacheMode {
                        enabled: false,
                        forward: false,
                    },
                },
            )?;
        }
        Ok(())
    }

    /// Deletes all trace of the write at one exact time; see
    /// [`Cache::remove`].
    pub fn remove(&mut self, branch: &Branch, turn: Turn, tick: Tick) -> Option<(EdgeEntity, EdgeIdx)> {
        let removed = self.inner.remove(branch, turn, tick)?;
        let (graph_name, orig, dest) = removed.0.clone();
        self.destcache.rollback_from(
            &(graph_name.clone(), orig, branch.clone()),
            turn,
            tick,
        );
        self.origcache
            .rollback_from(&(graph_name, dest, branch.clone()), turn, tick);
        Some(removed)
    }

    /// Directional discard across every index; see [`Cache::truncate`].
    pub fn truncate(
        &mut self,
        branch: &Branch,
        turn: Turn,
        tick: Tick,
        direction: crate::window::Direction,
    ) {
        self.inner.truncate(branch, turn, tick, direction);
        self.destcache.remove_where(|(_, _, b)| b == branch);
        self.origcache.remove_where(|(_, _, b)| b == branch);
    }

    /// Removes every trace of `branch`; see [`Cache::remove_branch`].
    pub fn remove_branch(&mut self, branch: &Branch) {
        self.inner.remove_branch(branch);
        self.destcache.remove_where(|(_, _, b)| b == branch);
        self.origcache.remove_where(|(_, _, b)| b == branch);
    }

    /// The underlying generic cache, for index-level operations the engine
    /// drives directly (journals, keyframes, rollback bookkeeping).
    #[must_use]
    pub fn raw(&self) -> &Cache<EdgeEntity, EdgeIdx, ()> {
        &self.inner
    }

    /// Mutable access to the underlying generic cache.
    pub fn raw_mut(&mut self) -> &mut Cache<EdgeEntity, EdgeIdx, ()> {
        &mut self.inner
    }
}

/// Adds/dels over neighbors: a neighbor is added when at least one of its
/// parallel-edge indices resolved to live and none resolved to deleted,
/// deleted in the opposite case, and undecided (absent from both sets) when
/// indices disagree or nothing changed since the stop time.
#[allow(clippy::too_many_arguments)]
fn neighbor_adds_dels(
    inner: &Cache<EdgeEntity, EdgeIdx, ()>,
    index: &FxHashMap<(GraphName, NodeName), BTreeSet<NodeName>>,
    side: NeighborSide,
    graph_name: &GraphName,
    node: &NodeName,
    graph: &BranchGraph,
    branch: &Branch,
    turn: Turn,
    tick: Tick,
    stop: Option<(Turn, Tick)>,
) -> (BTreeSet<NodeName>, BTreeSet<NodeName>) {
    let mut added = BTreeSet::new();
    let mut deleted = BTreeSet::new();
    let stop_time = stop.map(|(st, sk)| StopTime {
        branch: branch.clone(),
        turn: st,
        tick: sk,
    });
    let Some(others) = index.get(&(graph_name.clone(), node.clone())) else {
        return (added, deleted);
    };
    for other in others {
        let entity = match side {
            NeighborSide::Successors => {
                (graph_name.clone(), node.clone(), other.clone())
            }
            NeighborSide::Predecessors => {
                (graph_name.clone(), other.clone(), node.clone())
            }
        };
        let (add_idx, del_idx) =
            inner.adds_dels(&entity, branch, turn, tick, graph, stop_time.as_ref());
        if !add_idx.is_empty() && del_idx.is_empty() {
            added.insert(other.clone());
        } else if !del_idx.is_empty() && add_idx.is_empty() {
            deleted.insert(other.clone());
        }
    }
    (added, deleted)
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

    fn simple_store(
        c: &mut EdgesCache,
        g: &BranchGraph,
        orig: &str,
        dest: &str,
        turn: i64,
        exists: bool,
    ) {
        c.store(
            GraphName::new("town"),
            NodeName::new(orig),
            NodeName::new(dest),
            EdgeIdx(0),
            &Branch::trunk(),
            Turn(turn),
            Tick(0),
            exists,
            g,
            params(),
        )
        .unwrap();
    }

    #[test]
    fn successors_and_predecessors_stay_in_sync() {
        let g = BranchGraph::new();
        let trunk = Branch::trunk();
        let mut c = EdgesCache::new();
        simple_store(&mut c, &g, "a", "b", 0, true);
        simple_store(&mut c, &g, "a", "c", 1, true);
        let town = GraphName::new("town");
        assert!(c.has_successor(
            &town,
            &NodeName::new("a"),
            &NodeName::new("b"),
            &trunk,
            Turn(1),
            Tick(0),
            &g,
            KeycacheMode::plain()
        ));
        assert!(c.has_predecessor(
            &town,
            &NodeName::new("b"),
            &NodeName::new("a"),
            &trunk,
            Turn(1),
            Tick(0),
            &g,
            KeycacheMode::plain()
        ));
        assert_eq!(
            c.count_successors(
                &town,
                &NodeName::new("a"),
                &trunk,
                Turn(1),
                Tick(0),
                &g,
                KeycacheMode::plain()
            ),
            2
        );
        // Before the b->c edge existed.
        assert_eq!(
            c.count_successors(
                &town,
                &NodeName::new("a"),
                &trunk,
                Turn(0),
                Tick(0),
                &g,
                KeycacheMode::plain()
            ),
            1
        );
    }

    #[test]
    fn edge_removal_removes_the_neighbor() {
        let g = BranchGraph::new();
        let trunk = Branch::trunk();
        let mut c = EdgesCache::new();
        simple_store(&mut c, &g, "a", "b", 0, true);
        simple_store(&mut c, &g, "a", "b", 2, false);
        let town = GraphName::new("town");
        assert!(c.edge_exists(
            &town,
            &NodeName::new("a"),
            &NodeName::new("b"),
            EdgeIdx(0),
            &trunk,
            Turn(1),
            Tick(0),
            &g
        ));
        assert!(!c.has_successor(
            &town,
            &NodeName::new("a"),
            &NodeName::new("b"),
            &trunk,
            Turn(2),
            Tick(0),
            &g,
            KeycacheMode::plain()
        ));
        assert!(!c.has_predecessor(
            &town,
            &NodeName::new("b"),
            &NodeName::new("a"),
            &trunk,
            Turn(2),
            Tick(0),
            &g,
            KeycacheMode::plain()
        ));
    }

    #[test]
    fn parallel_edge_keeps_neighbor_alive() {
        let g = BranchGraph::new();
        let trunk = Branch::trunk();
        let mut c = EdgesCache::new();
        let town = GraphName::new("town");
        for (idx, tick) in [(EdgeIdx(0), Tick(0)), (EdgeIdx(1), Tick(1))] {
            c.store(
                town.clone(),
                NodeName::new("a"),
                NodeName::new("b"),
                idx,
                &trunk,
                Turn(0),
                tick,
                true,
                &g,
                params(),
            )
            .unwrap();
        }
        // Remove one of the two parallel edges.
        c.store(
            town.clone(),
            NodeName::new("a"),
            NodeName::new("b"),
            EdgeIdx(0),
            &trunk,
            Turn(1),
            Tick(0),
            false,
            &g,
            params(),
        )
        .unwrap();
        assert!(c.has_successor(
            &town,
            &NodeName::new("a"),
            &NodeName::new("b"),
            &trunk,
            Turn(1),
            Tick(0),
            &g,
            KeycacheMode::plain()
        ));
    }

    #[test]
    fn node_contradictions_surface_planned_live_edges() {
        let g = BranchGraph::new();
        let trunk = Branch::trunk();
        let mut c = EdgesCache::new();
        // A future (planned) edge at turn 5.
        simple_store(&mut c, &g, "a", "b", 5, true);
        let contras = c.node_contradictions(
            &GraphName::new("town"),
            &NodeName::new("a"),
            &trunk,
            Turn(2),
            Tick(0),
        );
        assert_eq!(contras, vec![(Turn(5), Tick(0))]);
        // From the destination's side too.
        let contras = c.node_contradictions(
            &GraphName::new("town"),
            &NodeName::new("b"),
            &trunk,
            Turn(2),
            Tick(0),
        );
        assert_eq!(contras, vec![(Turn(5), Tick(0))]);
    }
}
