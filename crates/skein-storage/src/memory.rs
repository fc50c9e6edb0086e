// SPDX-License-Identifier: Apache-2.0
//! The in-memory backend.
//!
//! Rows live in `BTreeMap`s keyed `(branch, turn, tick, identity…)`, so
//! iteration within one branch is chronological for free — exactly the
//! order the loading contract requires. Windowed loads filter the full
//! map; this backend optimizes for clarity, not scale.

use std::collections::BTreeMap;

use skein_core::keyframe::GraphKeyframe;
use skein_core::{
    Branch, BranchRecord, EdgeIdx, EdgeRow, EdgeValRow, FactKind, GraphKind, GraphName, GraphRow,
    GraphValRow, KeyframeRow, LoadWindow, NodeName, NodeRow, NodeValRow, PlanId, StatKey,
    StorageBackend, StorageError, Tick, Time, Turn, UniversalRow,
};

type Coord = (Branch, Turn, Tick);

/// Everything a world needs persisted, held in ordered maps.
pub struct MemoryBackend<V> {
    graphs: BTreeMap<(Branch, Turn, Tick, GraphName), Option<GraphKind>>,
    graph_vals: BTreeMap<(Branch, Turn, Tick, GraphName, StatKey), Option<V>>,
    nodes: BTreeMap<(Branch, Turn, Tick, GraphName, NodeName), bool>,
    node_vals: BTreeMap<(Branch, Turn, Tick, GraphName, NodeName, StatKey), Option<V>>,
    edges: BTreeMap<(Branch, Turn, Tick, GraphName, NodeName, NodeName, EdgeIdx), bool>,
    #[allow(clippy::type_complexity)]
    edge_vals:
        BTreeMap<(Branch, Turn, Tick, GraphName, NodeName, NodeName, EdgeIdx, StatKey), Option<V>>,
    universals: BTreeMap<(Branch, Turn, Tick, StatKey), Option<V>>,
    keyframes: BTreeMap<(Branch, Turn, Tick, GraphName), GraphKeyframe<V>>,
    branches: BTreeMap<Branch, BranchRecord>,
    turns: BTreeMap<(Branch, Turn), (Tick, Tick)>,
    plans: BTreeMap<PlanId, Coord>,
    plan_ticks: BTreeMap<(PlanId, Turn, Tick), ()>,
    time: Option<Time>,
    commits: u64,
}

impl<V> Default for MemoryBackend<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> MemoryBackend<V> {
    /// Creates an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self {
            graphs: BTreeMap::new(),
            graph_vals: BTreeMap::new(),
            nodes: BTreeMap::new(),
            node_vals: BTreeMap::new(),
            edges: BTreeMap::new(),
            edge_vals: BTreeMap::new(),
            universals: BTreeMap::new(),
            keyframes: BTreeMap::new(),
            branches: BTreeMap::new(),
            turns: BTreeMap::new(),
            plans: BTreeMap::new(),
            plan_ticks: BTreeMap::new(),
            time: None,
            commits: 0,
        }
    }

    /// How many times `commit` has been called; tests assert on this.
    #[must_use]
    pub fn commit_count(&self) -> u64 {
        self.commits
    }

    /// Total fact rows currently stored, across every kind.
    #[must_use]
    pub fn row_count(&self) -> usize {
        self.graphs.len()
            + self.graph_vals.len()
            + self.nodes.len()
            + self.node_vals.len()
            + self.edges.len()
            + self.edge_vals.len()
            + self.universals.len()
    }
}

fn in_window(window: &LoadWindow, branch: &Branch, turn: Turn, tick: Tick) -> bool {
    *branch == window.branch && window.contains(turn, tick)
}

impl<V: Clone + PartialEq + std::fmt::Debug + Send + Sync> StorageBackend<V> for MemoryBackend<V> {
    fn store_graph(&mut self, row: GraphRow) -> Result<(), StorageError> {
        self.graphs
            .insert((row.branch, row.turn, row.tick, row.graph), row.kind);
        Ok(())
    }

    fn store_graph_val(&mut self, row: GraphValRow<V>) -> Result<(), StorageError> {
        self.graph_vals.insert(
            (row.branch, row.turn, row.tick, row.graph, row.key),
            row.value,
        );
        Ok(())
    }

    fn store_node(&mut self, row: NodeRow) -> Result<(), StorageError> {
        self.nodes.insert(
            (row.branch, row.turn, row.tick, row.graph, row.node),
            row.exists,
        );
        Ok(())
    }

    fn store_node_val(&mut self, row: NodeValRow<V>) -> Result<(), StorageError> {
        self.node_vals.insert(
            (row.branch, row.turn, row.tick, row.graph, row.node, row.key),
            row.value,
        );
        Ok(())
    }

    fn store_edge(&mut self, row: EdgeRow) -> Result<(), StorageError> {
        self.edges.insert(
            (
                row.branch, row.turn, row.tick, row.graph, row.orig, row.dest, row.idx,
            ),
            row.exists,
        );
        Ok(())
    }

    fn store_edge_val(&mut self, row: EdgeValRow<V>) -> Result<(), StorageError> {
        self.edge_vals.insert(
            (
                row.branch, row.turn, row.tick, row.graph, row.orig, row.dest, row.idx, row.key,
            ),
            row.value,
        );
        Ok(())
    }

    fn store_universal(&mut self, row: UniversalRow<V>) -> Result<(), StorageError> {
        self.universals
            .insert((row.branch, row.turn, row.tick, row.key), row.value);
        Ok(())
    }

    fn delete_at(
        &mut self,
        kind: FactKind,
        branch: &Branch,
        turn: Turn,
        tick: Tick,
    ) -> Result<(), StorageError> {
        let hit = |b: &Branch, tn: Turn, tk: Tick| b == branch && tn == turn && tk == tick;
        match kind {
            FactKind::Graphs => self.graphs.retain(|(b, tn, tk, _), _| !hit(b, *tn, *tk)),
            FactKind::GraphVal => self
                .graph_vals
                .retain(|(b, tn, tk, _, _), _| !hit(b, *tn, *tk)),
            FactKind::Nodes => self.nodes.retain(|(b, tn, tk, _, _), _| !hit(b, *tn, *tk)),
            FactKind::NodeVal => self
                .node_vals
                .retain(|(b, tn, tk, _, _, _), _| !hit(b, *tn, *tk)),
            FactKind::Edges => self
                .edges
                .retain(|(b, tn, tk, _, _, _, _), _| !hit(b, *tn, *tk)),
            FactKind::EdgeVal => self
                .edge_vals
                .retain(|(b, tn, tk, _, _, _, _, _), _| !hit(b, *tn, *tk)),
            FactKind::Universal => self
                .universals
                .retain(|(b, tn, tk, _), _| !hit(b, *tn, *tk)),
        }
        Ok(())
    }

    fn load_graphs(&mut self, window: &LoadWindow) -> Result<Vec<GraphRow>, StorageError> {
        Ok(self
            .graphs
            .iter()
            .filter(|((b, tn, tk, _), _)| in_window(window, b, *tn, *tk))
            .map(|((b, tn, tk, g), kind)| GraphRow {
                graph: g.clone(),
                branch: b.clone(),
                turn: *tn,
                tick: *tk,
                kind: *kind,
            })
            .collect())
    }

    fn load_graph_val(&mut self, window: &LoadWindow) -> Result<Vec<GraphValRow<V>>, StorageError> {
        Ok(self
            .graph_vals
            .iter()
            .filter(|((b, tn, tk, _, _), _)| in_window(window, b, *tn, *tk))
            .map(|((b, tn, tk, g, k), v)| GraphValRow {
                graph: g.clone(),
                key: k.clone(),
                branch: b.clone(),
                turn: *tn,
                tick: *tk,
                value: v.clone(),
            })
            .collect())
    }

    fn load_nodes(&mut self, window: &LoadWindow) -> Result<Vec<NodeRow>, StorageError> {
        Ok(self
            .nodes
            .iter()
            .filter(|((b, tn, tk, _, _), _)| in_window(window, b, *tn, *tk))
            .map(|((b, tn, tk, g, n), ex)| NodeRow {
                graph: g.clone(),
                node: n.clone(),
                branch: b.clone(),
                turn: *tn,
                tick: *tk,
                exists: *ex,
            })
            .collect())
    }

    fn load_node_val(&mut self, window: &LoadWindow) -> Result<Vec<NodeValRow<V>>, StorageError> {
        Ok(self
            .node_vals
            .iter()
            .filter(|((b, tn, tk, _, _, _), _)| in_window(window, b, *tn, *tk))
            .map(|((b, tn, tk, g, n, k), v)| NodeValRow {
                graph: g.clone(),
                node: n.clone(),
                key: k.clone(),
                branch: b.clone(),
                turn: *tn,
                tick: *tk,
                value: v.clone(),
            })
            .collect())
    }

    fn load_edges(&mut self, window: &LoadWindow) -> Result<Vec<EdgeRow>, StorageError> {
        Ok(self
            .edges
            .iter()
            .filter(|((b, tn, tk, _, _, _, _), _)| in_window(window, b, *tn, *tk))
            .map(|((b, tn, tk, g, o, d, i), ex)| EdgeRow {
                graph: g.clone(),
                orig: o.clone(),
                dest: d.clone(),
                idx: *i,
                branch: b.clone(),
                turn: *tn,
                tick: *tk,
                exists: *ex,
            })
            .collect())
    }

    fn load_edge_val(&mut self, window: &LoadWindow) -> Result<Vec<EdgeValRow<V>>, StorageError> {
        Ok(self
            .edge_vals
            .iter()
            .filter(|((b, tn, tk, _, _, _, _, _), _)| in_window(window, b, *tn, *tk))
            .map(|((b, tn, tk, g, o, d, i, k), v)| EdgeValRow {
                graph: g.clone(),
                orig: o.clone(),
                dest: d.clone(),
                idx: *i,
                key: k.clone(),
                branch: b.clone(),
                turn: *tn,
                tick: *tk,
                value: v.clone(),
            })
            .collect())
    }

    fn load_universal(&mut self, window: &LoadWindow) -> Result<Vec<UniversalRow<V>>, StorageError> {
        Ok(self
            .universals
            .iter()
            .filter(|((b, tn, tk, _), _)| in_window(window, b, *tn, *tk))
            .map(|((b, tn, tk, k), v)| UniversalRow {
                key: k.clone(),
                branch: b.clone(),
                turn: *tn,
                tick: *tk,
                value: v.clone(),
            })
            .collect())
    }

    fn store_keyframe(&mut self, row: KeyframeRow<V>) -> Result<(), StorageError> {
        self.keyframes
            .insert((row.branch, row.turn, row.tick, row.graph), row.payload);
        Ok(())
    }

    fn get_keyframe(
        &mut self,
        graph: &GraphName,
        branch: &Branch,
        turn: Turn,
        tick: Tick,
    ) -> Result<Option<GraphKeyframe<V>>, StorageError> {
        Ok(self
            .keyframes
            .get(&(branch.clone(), turn, tick, graph.clone()))
            .cloned())
    }

    fn keyframe_times(&mut self) -> Result<Vec<(GraphName, Branch, Turn, Tick)>, StorageError> {
        Ok(self
            .keyframes
            .keys()
            .map(|(b, tn, tk, g)| (g.clone(), b.clone(), *tn, *tk))
            .collect())
    }

    fn store_branch(
        &mut self,
        branch: &Branch,
        record: &BranchRecord,
    ) -> Result<(), StorageError> {
        self.branches.insert(branch.clone(), record.clone());
        Ok(())
    }

    fn load_branches(&mut self) -> Result<Vec<(Branch, BranchRecord)>, StorageError> {
        // Parents before children: peel off branches whose parent has
        // already been emitted.
        let mut remaining = self.branches.clone();
        let mut out = Vec::with_capacity(remaining.len());
        let mut emitted: Vec<Branch> = Vec::new();
        while !remaining.is_empty() {
            let ready: Vec<Branch> = remaining
                .iter()
                .filter(|(_, rec)| {
                    rec.parent
                        .as_ref()
                        .is_none_or(|p| emitted.contains(p) || !remaining.contains_key(p))
                })
                .map(|(b, _)| b.clone())
                .collect();
            if ready.is_empty() {
                return Err(StorageError::Backend(
                    "branch parentage contains a cycle".to_owned(),
                ));
            }
            for b in ready {
                if let Some(rec) = remaining.remove(&b) {
                    emitted.push(b.clone());
                    out.push((b, rec));
                }
            }
        }
        Ok(out)
    }

    fn store_turn(
        &mut self,
        branch: &Branch,
        turn: Turn,
        end_tick: Tick,
        plan_end_tick: Tick,
    ) -> Result<(), StorageError> {
        self.turns
            .insert((branch.clone(), turn), (end_tick, plan_end_tick));
        Ok(())
    }

    fn load_turns(&mut self) -> Result<Vec<(Branch, Turn, Tick, Tick)>, StorageError> {
        Ok(self
            .turns
            .iter()
            .map(|((b, tn), (end, plan_end))| (b.clone(), *tn, *end, *plan_end))
            .collect())
    }

    fn store_plan(
        &mut self,
        plan: PlanId,
        branch: &Branch,
        turn: Turn,
        tick: Tick,
    ) -> Result<(), StorageError> {
        self.plans.insert(plan, (branch.clone(), turn, tick));
        Ok(())
    }

    fn store_plan_tick(
        &mut self,
        plan: PlanId,
        turn: Turn,
        tick: Tick,
    ) -> Result<(), StorageError> {
        self.plan_ticks.insert((plan, turn, tick), ());
        Ok(())
    }

    fn load_plans(&mut self) -> Result<Vec<(PlanId, Branch, Turn, Tick)>, StorageError> {
        Ok(self
            .plans
            .iter()
            .map(|(p, (b, tn, tk))| (*p, b.clone(), *tn, *tk))
            .collect())
    }

    fn load_plan_ticks(&mut self) -> Result<Vec<(PlanId, Turn, Tick)>, StorageError> {
        Ok(self.plan_ticks.keys().copied().collect())
    }

    fn store_time(&mut self, time: &Time) -> Result<(), StorageError> {
        self.time = Some(time.clone());
        Ok(())
    }

    fn load_time(&mut self) -> Result<Option<Time>, StorageError> {
        Ok(self.time.clone())
    }

    fn commit(&mut self) -> Result<(), StorageError> {
        self.commits += 1;
        Ok(())
    }
}
