// SPDX-License-Identifier: Apache-2.0
//! The persistence boundary.
//!
//! The engine never speaks SQL or any wire format; it consumes this trait.
//! A backend persists individual fact rows as they are committed, answers
//! windowed bulk loads when history is paged back in, and stores keyframe
//! payloads and time-bookkeeping rows. `skein-storage` provides the
//! in-memory reference implementation; database-backed implementations
//! live outside this crate.
//!
//! No domain logic belongs here: contradiction handling, keyframe
//! windowing, and plan rollback all happen above this boundary.

use thiserror::Error;

use crate::ident::{EdgeIdx, GraphKind, GraphName, NodeName, PlanId, StatKey};
use crate::keyframe::GraphKeyframe;
use crate::time::{Branch, BranchRecord, Tick, Time, Turn};

/// A backend failure. Backends fold their native errors into this.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    /// The backend itself failed (I/O, connection, constraint).
    #[error("backend: {0}")]
    Backend(String),
    /// A row the engine expected to exist was missing.
    #[error("missing row: {0}")]
    Missing(String),
}

/// Which table a time-addressed deletion applies to.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FactKind {
    /// Graph existence rows.
    Graphs,
    /// Graph-stat rows.
    GraphVal,
    /// Node existence rows.
    Nodes,
    /// Node-stat rows.
    NodeVal,
    /// Edge existence rows.
    Edges,
    /// Edge-stat rows.
    EdgeVal,
    /// World-scoped stat rows.
    Universal,
}

/// A span of one branch's history to load: times `t` with
/// `from < t <= to`, where `None` bounds mean "from the beginning" and
/// "to the end." The lower bound is exclusive because the state *at* it
/// comes from a keyframe.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LoadWindow {
    /// Branch the span lives in.
    pub branch: Branch,
    /// Exclusive lower bound, or unbounded.
    pub from: Option<(Turn, Tick)>,
    /// Inclusive upper bound, or unbounded.
    pub to: Option<(Turn, Tick)>,
}

impl LoadWindow {
    /// Whether `(turn, tick)` falls inside the window.
    #[must_use]
    pub fn contains(&self, turn: Turn, tick: Tick) -> bool {
        self.from.is_none_or(|lo| (turn, tick) > lo)
            && self.to.is_none_or(|hi| (turn, tick) <= hi)
    }
}

/// Graph existence row. `kind` is `None` when the graph was deleted at
/// this time.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GraphRow {
    /// Graph addressed.
    pub graph: GraphName,
    /// Branch of the write.
    pub branch: Branch,
    /// Turn of the write.
    pub turn: Turn,
    /// Tick of the write.
    pub tick: Tick,
    /// Kind when created/alive, `None` when deleted.
    pub kind: Option<GraphKind>,
}

/// Graph-stat row.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GraphValRow<V> {
    /// Graph addressed.
    pub graph: GraphName,
    /// Stat key.
    pub key: StatKey,
    /// Branch of the write.
    pub branch: Branch,
    /// Turn of the write.
    pub turn: Turn,
    /// Tick of the write.
    pub tick: Tick,
    /// Value, `None` being the deletion marker.
    pub value: Option<V>,
}

/// Node existence row.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NodeRow {
    /// Graph addressed.
    pub graph: GraphName,
    /// Node addressed.
    pub node: NodeName,
    /// Branch of the write.
    pub branch: Branch,
    /// Turn of the write.
    pub turn: Turn,
    /// Tick of the write.
    pub tick: Tick,
    /// Whether the node exists as of this time.
    pub exists: bool,
}

/// Node-stat row.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NodeValRow<V> {
    /// Graph addressed.
    pub graph: GraphName,
    /// Node addressed.
    pub node: NodeName,
    /// Stat key.
    pub key: StatKey,
    /// Branch of the write.
    pub branch: Branch,
    /// Turn of the write.
    pub turn: Turn,
    /// Tick of the write.
    pub tick: Tick,
    /// Value, `None` being the deletion marker.
    pub value: Option<V>,
}

/// Edge existence row.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EdgeRow {
    /// Graph addressed.
    pub graph: GraphName,
    /// Origin node.
    pub orig: NodeName,
    /// Destination node.
    pub dest: NodeName,
    /// Parallel-edge index.
    pub idx: EdgeIdx,
    /// Branch of the write.
    pub branch: Branch,
    /// Turn of the write.
    pub turn: Turn,
    /// Tick of the write.
    pub tick: Tick,
    /// Whether the edge exists as of this time.
    pub exists: bool,
}

/// Edge-stat row.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EdgeValRow<V> {
    /// Graph addressed.
    pub graph: GraphName,
    /// Origin node.
    pub orig: NodeName,
    /// Destination node.
    pub dest: NodeName,
    /// Parallel-edge index.
    pub idx: EdgeIdx,
    /// Stat key.
    pub key: StatKey,
    /// Branch of the write.
    pub branch: Branch,
    /// Turn of the write.
    pub turn: Turn,
    /// Tick of the write.
    pub tick: Tick,
    /// Value, `None` being the deletion marker.
    pub value: Option<V>,
}

/// World-scoped stat row.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct UniversalRow<V> {
    /// Stat key.
    pub key: StatKey,
    /// Branch of the write.
    pub branch: Branch,
    /// Turn of the write.
    pub turn: Turn,
    /// Tick of the write.
    pub tick: Tick,
    /// Value, `None` being the deletion marker.
    pub value: Option<V>,
}

/// Keyframe row: one graph's full state at one exact time.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct KeyframeRow<V> {
    /// Graph snapshotted.
    pub graph: GraphName,
    /// Branch of the snapshot.
    pub branch: Branch,
    /// Turn of the snapshot.
    pub turn: Turn,
    /// Tick of the snapshot.
    pub tick: Tick,
    /// Full graph state.
    pub payload: GraphKeyframe<V>,
}

/// The storage backend the engine persists through and loads from.
///
/// Loaders must return rows in chronological `(turn, tick)` order within
/// the requested window; the engine orders branches itself (parents before
/// children).
///
/// `Send + Sync` is required so the engine can sit behind the world lock;
/// every method takes `&mut self`, so read guards never touch the backend
/// and a `!Sync` connection type only needs a mutex inside its impl.
pub trait StorageBackend<V>: Send + Sync {
    /// Persists a graph existence row.
    fn store_graph(&mut self, row: GraphRow) -> Result<(), StorageError>;
    /// Persists a graph-stat row.
    fn store_graph_val(&mut self, row: GraphValRow<V>) -> Result<(), StorageError>;
    /// Persists a node existence row.
    fn store_node(&mut self, row: NodeRow) -> Result<(), StorageError>;
    /// Persists a node-stat row.
    fn store_node_val(&mut self, row: NodeValRow<V>) -> Result<(), StorageError>;
    /// Persists an edge existence row.
    fn store_edge(&mut self, row: EdgeRow) -> Result<(), StorageError>;
    /// Persists an edge-stat row.
    fn store_edge_val(&mut self, row: EdgeValRow<V>) -> Result<(), StorageError>;
    /// Persists a world-scoped stat row.
    fn store_universal(&mut self, row: UniversalRow<V>) -> Result<(), StorageError>;

    /// Deletes whatever row of `kind` exists at the exact coordinate.
    /// Plan rollback calls this for every revoked tick.
    fn delete_at(
        &mut self,
        kind: FactKind,
        branch: &Branch,
        turn: Turn,
        tick: Tick,
    ) -> Result<(), StorageError>;

    /// Loads graph existence rows within a window.
    fn load_graphs(&mut self, window: &LoadWindow) -> Result<Vec<GraphRow>, StorageError>;
    /// Loads graph-stat rows within a window.
    fn load_graph_val(&mut self, window: &LoadWindow) -> Result<Vec<GraphValRow<V>>, StorageError>;
    /// Loads node existence rows within a window.
    fn load_nodes(&mut self, window: &LoadWindow) -> Result<Vec<NodeRow>, StorageError>;
    /// Loads node-stat rows within a window.
    fn load_node_val(&mut self, window: &LoadWindow) -> Result<Vec<NodeValRow<V>>, StorageError>;
    /// Loads edge existence rows within a window.
    fn load_edges(&mut self, window: &LoadWindow) -> Result<Vec<EdgeRow>, StorageError>;
    /// Loads edge-stat rows within a window.
    fn load_edge_val(&mut self, window: &LoadWindow) -> Result<Vec<EdgeValRow<V>>, StorageError>;
    /// Loads world-scoped stat rows within a window.
    fn load_universal(&mut self, window: &LoadWindow) -> Result<Vec<UniversalRow<V>>, StorageError>;

    /// Persists a keyframe payload.
    fn store_keyframe(&mut self, row: KeyframeRow<V>) -> Result<(), StorageError>;
    /// Loads the keyframe payload for one graph at an exact coordinate.
    fn get_keyframe(
        &mut self,
        graph: &GraphName,
        branch: &Branch,
        turn: Turn,
        tick: Tick,
    ) -> Result<Option<GraphKeyframe<V>>, StorageError>;
    /// Every `(graph, branch, turn, tick)` a keyframe exists at. Consulted
    /// once at startup to seed the schedule.
    fn keyframe_times(&mut self) -> Result<Vec<(GraphName, Branch, Turn, Tick)>, StorageError>;

    /// Persists a branch record.
    fn store_branch(&mut self, branch: &Branch, record: &BranchRecord)
        -> Result<(), StorageError>;
    /// Loads every branch record, parents before children.
    fn load_branches(&mut self) -> Result<Vec<(Branch, BranchRecord)>, StorageError>;
    /// Persists the committed and planned end ticks of one turn.
    fn store_turn(
        &mut self,
        branch: &Branch,
        turn: Turn,
        end_tick: Tick,
        plan_end_tick: Tick,
    ) -> Result<(), StorageError>;
    /// Persists a plan's identity and starting time.
    fn store_plan(
        &mut self,
        plan: PlanId,
        branch: &Branch,
        turn: Turn,
        tick: Tick,
    ) -> Result<(), StorageError>;
    /// Persists one tick claimed by a plan.
    fn store_plan_tick(&mut self, plan: PlanId, turn: Turn, tick: Tick)
        -> Result<(), StorageError>;
    /// Persists the current cursor, saved at commit.
    fn store_time(&mut self, time: &Time) -> Result<(), StorageError>;
    /// The cursor saved by the last commit, if any.
    fn load_time(&mut self) -> Result<Option<Time>, StorageError>;

    /// Loads the committed and planned end ticks of every stored turn.
    fn load_turns(&mut self) -> Result<Vec<(Branch, Turn, Tick, Tick)>, StorageError>;
    /// Loads every stored plan.
    fn load_plans(&mut self) -> Result<Vec<(PlanId, Branch, Turn, Tick)>, StorageError>;
    /// Loads every tick claimed by any plan.
    fn load_plan_ticks(&mut self) -> Result<Vec<(PlanId, Turn, Tick)>, StorageError>;

    /// Makes everything stored so far durable.
    fn commit(&mut self) -> Result<(), StorageError>;
}
