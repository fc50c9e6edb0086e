// SPDX-License-Identifier: Apache-2.0
//! The orchestrating engine: time cursor, plans, keyframes, and windowed
//! loading over the storage backend.
//!
//! Everything that mutates world state funnels through here. The engine
//! owns the branch registry and one cache per fact kind; it is the only
//! component that calls their `store` methods, and it wraps every store in
//! the full protocol: advance the tick, scan for contradicted plans and
//! delete them, write the cache, persist the row, then grow the branch
//! extent bookkeeping.
//!
//! Time travel funnels through the cursor setters, which validate the
//! destination against the branch tree (surfacing
//! [`OutOfTimelineError`] with both endpoints) and page history in via
//! [`load_at`](Engine::load_at) when the destination is outside the
//! resident window.

use std::collections::{BTreeMap, BTreeSet};

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, trace};

use crate::cache::{Cache, StoreParams};
use crate::delta::{GraphChange, WorldDelta};
use crate::edges::EdgesCache;
use crate::entityless::EntitylessCache;
use crate::errors::{
    EngineError, OutOfTimelineError, OutOfTimelineReason, RetrieveError,
};
use crate::ident::{EdgeIdx, EdgeRef, GraphKind, GraphName, NodeName, PlanId, StatKey};
use crate::keycache::KeycacheMode;
use crate::keyframe::{GraphKeyframe, KeyframeSchedule};
use crate::nodes::NodesCache;
use crate::storage::{
    EdgeRow, EdgeValRow, FactKind, GraphRow, GraphValRow, KeyframeRow, LoadWindow, NodeRow,
    NodeValRow, StorageBackend, UniversalRow,
};
use crate::time::{Branch, BranchGraph, Tick, Time, Turn};
use crate::window::Direction;

use std::sync::Arc;

/// Value bound for the engine: cache value requirements plus thread
/// mobility, so the whole engine can sit behind the world lock.
pub trait WorldValue: crate::cache::FactValue + Send + Sync {}
impl<T: crate::cache::FactValue + Send + Sync> WorldValue for T {}

/// Engine tuning knobs.
#[derive(Clone, Copy, Debug)]
pub struct EngineConfig {
    /// Bound on memoized key sets per cache.
    pub keycache_capacity: usize,
    /// Whether cursor moves past the committed end of time are rejected
    /// rather than treated as an implicit extension.
    pub enforce_end_of_time: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            keycache_capacity: crate::keycache::KEYCACHE_MAXSIZE,
            enforce_end_of_time: false,
        }
    }
}

/// A cursor move, delivered to time observers.
#[derive(Clone, Debug)]
pub struct TimeShift {
    /// Branch before the move.
    pub branch_then: Branch,
    /// Turn before the move.
    pub turn_then: Turn,
    /// Tick before the move.
    pub tick_then: Tick,
    /// Branch after the move.
    pub branch_now: Branch,
    /// Turn after the move.
    pub turn_now: Turn,
    /// Tick after the move.
    pub tick_now: Tick,
}

type Observer = Box<dyn Fn(&TimeShift) + Send + Sync>;

/// The versioned, branching temporal graph store.
pub struct Engine<V: WorldValue> {
    config: EngineConfig,
    backend: Box<dyn StorageBackend<V>>,
    branches: BranchGraph,
    turn_end: FxHashMap<(Branch, Turn), Tick>,
    turn_end_plan: FxHashMap<(Branch, Turn), Tick>,
    cur_branch: Branch,
    cur_turn: Turn,
    cur_tick: Tick,
    planning: bool,
    forward: bool,
    no_kc: bool,
    last_plan: u64,
    plans: FxHashMap<PlanId, Time>,
    plan_ticks: FxHashMap<PlanId, BTreeMap<Turn, BTreeSet<Tick>>>,
    time_plan: FxHashMap<(Branch, Turn, Tick), PlanId>,
    branches_plans: FxHashMap<Branch, FxHashSet<PlanId>>,
    plans_uncommitted: Vec<(PlanId, Branch, Turn, Tick)>,
    plan_ticks_uncommitted: Vec<(PlanId, Turn, Tick)>,
    /// Which caches hold a write at each coordinate; plan rollback
    /// consults this to find everything that needs undoing.
    where_cached: FxHashMap<(Branch, Turn, Tick), Vec<FactKind>>,
    schedule: KeyframeSchedule,
    /// Which graphs have a keyframe row at each coordinate.
    kf_graphs: FxHashMap<(Branch, Turn, Tick), BTreeSet<GraphName>>,
    /// Keyframe coordinates whose payloads are resident in the caches.
    keyframes_loaded: FxHashSet<(Branch, Turn, Tick)>,
    /// Keyframes created since the last commit.
    new_keyframes: Vec<(GraphName, Branch, Turn, Tick)>,
    /// Resident history window per branch.
    loaded: FxHashMap<Branch, ((Turn, Tick), (Turn, Tick))>,
    observers: Vec<Observer>,
    graphs: EntitylessCache<GraphName, GraphKind>,
    universal: EntitylessCache<StatKey, V>,
    graph_val: Cache<GraphName, StatKey, V>,
    nodes: NodesCache,
    node_val: Cache<(GraphName, NodeName), StatKey, V>,
    edges: EdgesCache,
    edge_val: Cache<(GraphName, NodeName, NodeName, EdgeIdx), StatKey, V>,
}

const TIME_MIN: (Turn, Tick) = (Turn(i64::MIN), Tick(i64::MIN));
const TIME_MAX: (Turn, Tick) = (Turn(i64::MAX), Tick(i64::MAX));

impl<V: WorldValue> Engine<V> {
    /// Opens a world over `backend`, loading branch, plan, and keyframe
    /// bookkeeping, restoring the saved cursor, and paging in the history
    /// bracketing it.
    ///
    /// # Errors
    ///
    /// Backend failures and malformed stored history.
    pub fn new(
        backend: Box<dyn StorageBackend<V>>,
        config: EngineConfig,
    ) -> Result<Self, EngineError> {
        let mut engine = Self {
            config,
            backend,
            branches: BranchGraph::new(),
            turn_end: FxHashMap::default(),
            turn_end_plan: FxHashMap::default(),
            cur_branch: Branch::trunk(),
            cur_turn: Turn(0),
            cur_tick: Tick(0),
            planning: false,
            forward: false,
            no_kc: false,
            last_plan: 0,
            plans: FxHashMap::default(),
            plan_ticks: FxHashMap::default(),
            time_plan: FxHashMap::default(),
            branches_plans: FxHashMap::default(),
            plans_uncommitted: Vec::new(),
            plan_ticks_uncommitted: Vec::new(),
            where_cached: FxHashMap::default(),
            schedule: KeyframeSchedule::new(),
            kf_graphs: FxHashMap::default(),
            keyframes_loaded: FxHashSet::default(),
            new_keyframes: Vec::new(),
            loaded: FxHashMap::default(),
            observers: Vec::new(),
            graphs: EntitylessCache::new("graphs"),
            universal: EntitylessCache::new("universal"),
            graph_val: Cache::with_keycache_capacity("graph_val", config.keycache_capacity),
            nodes: NodesCache::new(),
            node_val: Cache::with_keycache_capacity("node_val", config.keycache_capacity),
            edges: EdgesCache::new(),
            edge_val: Cache::with_keycache_capacity("edge_val", config.keycache_capacity),
        };
        engine.init_load()?;
        Ok(engine)
    }

    fn init_load(&mut self) -> Result<(), EngineError> {
        for (branch, record) in self.backend.load_branches()? {
            self.branches.insert_loaded(branch, record);
        }
        for (branch, turn, end, plan_end) in self.backend.load_turns()? {
            self.turn_end.insert((branch.clone(), turn), end);
            self.turn_end_plan.insert((branch, turn), plan_end);
        }
        for (plan, branch, turn, tick) in self.backend.load_plans()? {
            self.last_plan = self.last_plan.max(plan.0);
            self.plans
                .insert(plan, Time::new(branch.clone(), turn, tick));
            self.branches_plans.entry(branch).or_default().insert(plan);
        }
        for (plan, turn, tick) in self.backend.load_plan_ticks()? {
            if let Some(start) = self.plans.get(&plan) {
                let branch = start.branch.clone();
                self.plan_ticks
                    .entry(plan)
                    .or_default()
                    .entry(turn)
                    .or_default()
                    .insert(tick);
                self.time_plan.insert((branch, turn, tick), plan);
            }
        }
        for (graph, branch, turn, tick) in self.backend.keyframe_times()? {
            self.schedule.insert(&branch, turn, tick);
            self.kf_graphs
                .entry((branch, turn, tick))
                .or_default()
                .insert(graph);
        }
        if let Some(time) = self.backend.load_time()? {
            self.cur_branch = time.branch;
            self.cur_turn = time.turn;
            self.cur_tick = time.tick;
        }
        let (b, t, tk) = (self.cur_branch.clone(), self.cur_turn, self.cur_tick);
        self.load_at(&b, t, tk)
    }

    // ------------------------------------------------------------------
    // Time cursor

    /// The current time coordinate.
    #[must_use]
    pub fn time(&self) -> Time {
        Time::new(self.cur_branch.clone(), self.cur_turn, self.cur_tick)
    }

    /// The current branch.
    #[must_use]
    pub fn branch(&self) -> &Branch {
        &self.cur_branch
    }

    /// The current turn.
    #[must_use]
    pub fn turn(&self) -> Turn {
        self.cur_turn
    }

    /// The current tick.
    #[must_use]
    pub fn tick(&self) -> Tick {
        self.cur_tick
    }

    /// The branch registry.
    #[must_use]
    pub fn branch_graph(&self) -> &BranchGraph {
        &self.branches
    }

    /// The schedule of keyframe times.
    #[must_use]
    pub fn keyframe_schedule(&self) -> &KeyframeSchedule {
        &self.schedule
    }

    /// Registers a callback invoked after every branch or turn change.
    pub fn connect(&mut self, observer: impl Fn(&TimeShift) + Send + Sync + 'static) {
        self.observers.push(Box::new(observer));
    }

    fn notify(&self, then: (Branch, Turn, Tick)) {
        let shift = TimeShift {
            branch_then: then.0,
            turn_then: then.1,
            tick_then: then.2,
            branch_now: self.cur_branch.clone(),
            turn_now: self.cur_turn,
            tick_now: self.cur_tick,
        };
        for obs in &self.observers {
            obs(&shift);
        }
    }

    fn out_of_timeline(
        &self,
        reason: OutOfTimelineReason,
        branch_to: Branch,
        turn_to: Turn,
        tick_to: Tick,
    ) -> OutOfTimelineError {
        OutOfTimelineError {
            reason,
            branch_from: self.cur_branch.clone(),
            turn_from: self.cur_turn,
            tick_from: self.cur_tick,
            branch_to,
            turn_to,
            tick_to,
        }
    }

    /// Moves the cursor to `target`, forking it off the current time when
    /// it does not exist yet.
    ///
    /// # Errors
    ///
    /// [`EngineError::BranchDuringPlanning`] inside a plan;
    /// [`OutOfTimelineError`] when the current turn precedes the target
    /// branch's start.
    pub fn set_branch(&mut self, target: Branch) -> Result<(), EngineError> {
        if self.planning {
            return Err(EngineError::BranchDuringPlanning);
        }
        if target == self.cur_branch {
            self.cur_tick = self
                .turn_end_plan
                .get(&(target, self.cur_turn))
                .copied()
                .unwrap_or(Tick(0));
            return Ok(());
        }
        let then = (self.cur_branch.clone(), self.cur_turn, self.cur_tick);
        if self.branches.contains(&target) {
            let tick_now = self
                .turn_end_plan
                .get(&(target.clone(), self.cur_turn))
                .copied()
                .unwrap_or(Tick(0));
            let Some(rec) = self.branches.record(&target) else {
                return Err(crate::errors::TimelineError::NoSuchBranch(
                    target.as_str().to_owned(),
                )
                .into());
            };
            if self.cur_turn < rec.turn_start
                || (self.cur_turn == rec.turn_start && tick_now < rec.tick_start)
            {
                return Err(self
                    .out_of_timeline(
                        OutOfTimelineReason::BeforeBranchStart,
                        target,
                        self.cur_turn,
                        tick_now,
                    )
                    .into());
            }
            self.cur_branch = target;
            self.cur_tick = tick_now;
            self.ensure_loaded()?;
        } else {
            debug!(branch = %target, parent = %self.cur_branch, "fork branch");
            let parent = self.cur_branch.clone();
            self.branches
                .fork(target.clone(), &parent, self.cur_turn, self.cur_tick)?;
            if let Some(rec) = self.branches.record(&target) {
                self.backend.store_branch(&target, rec)?;
            }
            self.turn_end_plan
                .insert((target.clone(), self.cur_turn), self.cur_tick);
            self.turn_end
                .insert((target.clone(), self.cur_turn), self.cur_tick);
            self.cur_branch = target.clone();
            // The new branch has no history of its own yet; everything
            // about it is resident by construction.
            self.loaded
                .insert(target, ((self.cur_turn, self.cur_tick), TIME_MAX));
            self.copy_plans(&parent, self.cur_turn, self.cur_tick)?;
        }
        self.notify(then);
        Ok(())
    }

    /// Moves the cursor to `turn` within the current branch.
    ///
    /// # Errors
    ///
    /// [`OutOfTimelineError`] when the destination precedes the branch
    /// start, violates a forward context, or — with `enforce_end_of_time`
    /// — leaves the simulated span.
    pub fn set_turn(&mut self, turn: Turn) -> Result<(), EngineError> {
        if turn == self.cur_turn {
            self.cur_tick = self
                .turn_end_plan
                .get(&(self.cur_branch.clone(), turn))
                .copied()
                .unwrap_or(self.cur_tick);
            return Ok(());
        }
        let then = (self.cur_branch.clone(), self.cur_turn, self.cur_tick);
        let tick = self
            .turn_end_plan
            .get(&(self.cur_branch.clone(), turn))
            .copied()
            .unwrap_or(Tick(0));
        if self.forward && (turn < self.cur_turn || turn > Turn(self.cur_turn.0 + 1)) {
            return Err(self
                .out_of_timeline(
                    OutOfTimelineReason::ForwardContextViolated,
                    self.cur_branch.clone(),
                    turn,
                    tick,
                )
                .into());
        }
        let Some(rec) = self.branches.record(&self.cur_branch) else {
            return Err(crate::errors::TimelineError::NoSuchBranch(
                self.cur_branch.as_str().to_owned(),
            )
            .into());
        };
        if turn < rec.turn_start {
            return Err(self
                .out_of_timeline(
                    OutOfTimelineReason::BeforeBranchStart,
                    self.cur_branch.clone(),
                    turn,
                    tick,
                )
                .into());
        }
        if self.config.enforce_end_of_time && !self.planning && turn > Turn(rec.turn_end.0 + 1) {
            return Err(self
                .out_of_timeline(
                    OutOfTimelineReason::AfterEndOfTime,
                    self.cur_branch.clone(),
                    turn,
                    tick,
                )
                .into());
        }
        self.cur_turn = turn;
        self.cur_tick = tick;
        self.ensure_loaded()?;
        self.notify(then);
        Ok(())
    }

    /// Moves the cursor to `tick` within the current turn.
    ///
    /// # Errors
    ///
    /// [`OutOfTimelineError`] on backward movement in a forward context.
    pub fn set_tick(&mut self, tick: Tick) -> Result<(), EngineError> {
        if self.forward && tick < self.cur_tick {
            return Err(self
                .out_of_timeline(
                    OutOfTimelineReason::ForwardContextViolated,
                    self.cur_branch.clone(),
                    self.cur_turn,
                    tick,
                )
                .into());
        }
        let key = (self.cur_branch.clone(), self.cur_turn);
        if self.turn_end_plan.get(&key).copied().unwrap_or(Tick(0)) < tick {
            self.turn_end_plan.insert(key.clone(), tick);
        }
        if !self.planning {
            if self.turn_end.get(&key).copied().unwrap_or(Tick(0)) < tick {
                self.turn_end.insert(key, tick);
            }
            self.branches.extend(&self.cur_branch, self.cur_turn, tick);
        }
        self.cur_tick = tick;
        Ok(())
    }

    /// Advances the tick past everything recorded or planned in the
    /// current turn, enforcing that the cursor sits at the frontier of
    /// history, and returns the write coordinate. Inside a plan, the
    /// coordinate is additionally claimed for the plan.
    ///
    /// # Errors
    ///
    /// [`OutOfTimelineError`] when the cursor is not at the end of the
    /// branch ("you're in the past — go to the end, or fork").
    pub fn next_tick(&mut self) -> Result<Time, EngineError> {
        let bt = (self.cur_branch.clone(), self.cur_turn);
        let mut tick = Tick(self.cur_tick.0 + 1);
        if let Some(&planned_end) = self.turn_end_plan.get(&bt) {
            if tick <= planned_end {
                tick = Tick(planned_end.0 + 1);
            }
        }
        if self.turn_end.get(&bt).copied().unwrap_or(Tick(0)) > tick {
            return Err(self
                .out_of_timeline(
                    OutOfTimelineReason::NotAtFrontier,
                    self.cur_branch.clone(),
                    self.cur_turn,
                    tick,
                )
                .into());
        }
        let Some(rec) = self.branches.record(&self.cur_branch) else {
            return Err(crate::errors::TimelineError::NoSuchBranch(
                self.cur_branch.as_str().to_owned(),
            )
            .into());
        };
        if self.cur_turn < rec.turn_end {
            return Err(self
                .out_of_timeline(
                    OutOfTimelineReason::NotAtFrontier,
                    self.cur_branch.clone(),
                    self.cur_turn,
                    tick,
                )
                .into());
        }
        if self.planning {
            let plan = PlanId(self.last_plan);
            let already_claimed = self
                .plan_ticks
                .get(&plan)
                .and_then(|claimed| claimed.get(&self.cur_turn))
                .is_some_and(|ticks| ticks.contains(&tick));
            if already_claimed {
                return Err(self
                    .out_of_timeline(
                        OutOfTimelineReason::PlannedTimeOccupied,
                        self.cur_branch.clone(),
                        self.cur_turn,
                        tick,
                    )
                    .into());
            }
            self.plan_ticks
                .entry(plan)
                .or_default()
                .entry(self.cur_turn)
                .or_default()
                .insert(tick);
            self.plan_ticks_uncommitted.push((plan, self.cur_turn, tick));
            self.time_plan
                .insert((self.cur_branch.clone(), self.cur_turn, tick), plan);
        }
        self.turn_end_plan.insert(bt, tick);
        self.cur_tick = tick;
        Ok(self.time())
    }

    // ------------------------------------------------------------------
    // Contexts

    /// Runs `body` inside a planning context: every write in it is
    /// tentative, tagged with the returned [`PlanId`], and revocable as a
    /// unit via [`delete_plan`](Self::delete_plan).
    ///
    /// # Errors
    ///
    /// [`EngineError::AlreadyPlanning`] when nested; otherwise whatever
    /// `body` fails with.
    pub fn plan<T>(
        &mut self,
        body: impl FnOnce(&mut Self) -> Result<T, EngineError>,
    ) -> Result<(PlanId, T), EngineError> {
        if self.planning {
            return Err(EngineError::AlreadyPlanning);
        }
        self.last_plan += 1;
        let plan = PlanId(self.last_plan);
        let start = self.time();
        self.plans.insert(plan, start.clone());
        self.plans_uncommitted
            .push((plan, start.branch.clone(), start.turn, start.tick));
        self.branches_plans
            .entry(start.branch)
            .or_default()
            .insert(plan);
        self.planning = true;
        let was_forward = std::mem::take(&mut self.forward);
        let out = body(self);
        self.planning = false;
        self.forward = was_forward;
        out.map(|t| (plan, t))
    }

    /// Runs `body` with the forward optimization enabled: time may only
    /// move forward one turn at a time, and key-set memos copy forward
    /// incrementally. This is the simulation fast path.
    ///
    /// # Errors
    ///
    /// [`EngineError::AlreadyAdvancing`] when nested.
    pub fn advancing<T>(
        &mut self,
        body: impl FnOnce(&mut Self) -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        if self.forward {
            return Err(EngineError::AlreadyAdvancing);
        }
        self.forward = true;
        let out = body(self);
        self.forward = false;
        out
    }

    /// Runs `body` with key-set memoization disabled entirely: writes get
    /// cheaper, reads get slower. For mass state creation.
    ///
    /// # Errors
    ///
    /// [`EngineError::AlreadyBatching`] when nested.
    pub fn batch<T>(
        &mut self,
        body: impl FnOnce(&mut Self) -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        if self.no_kc {
            return Err(EngineError::AlreadyBatching);
        }
        self.no_kc = true;
        let out = body(self);
        self.no_kc = false;
        out
    }

    fn kc_mode(&self) -> KeycacheMode {
        KeycacheMode {
            enabled: !self.no_kc,
            forward: self.forward,
        }
    }

    fn store_params(&self) -> StoreParams {
        StoreParams {
            planning: self.planning,
            loading: false,
            keycache: self.kc_mode(),
        }
    }

    fn load_params() -> StoreParams {
        StoreParams {
            planning: false,
            loading: true,
            keycache: KeycacheMode {
                enabled: false,
                forward: false,
            },
        }
    }

    // ------------------------------------------------------------------
    // Plans

    /// Deletes the portion of `plan` that has yet to occur, removing every
    /// cache entry and persisted row it wrote at or after the present.
    pub fn delete_plan(&mut self, plan: PlanId) -> Result<(), EngineError> {
        let Some(start) = self.plans.get(&plan).cloned() else {
            return Ok(());
        };
        let branch = start.branch;
        let (now_turn, now_tick) = if branch == self.cur_branch {
            (self.cur_turn, self.cur_tick)
        } else {
            // A plan in another branch is entirely in that branch's future
            // relative to us; revoke all of it.
            (Turn(i64::MIN), Tick(i64::MIN))
        };
        let mut to_delete = Vec::new();
        if let Some(claimed) = self.plan_ticks.get(&plan) {
            for (&turn, ticks) in claimed {
                for &tick in ticks {
                    if turn > now_turn || (turn == now_turn && tick >= now_tick) {
                        to_delete.push((turn, tick));
                    }
                }
            }
        }
        debug!(%plan, branch = %branch, count = to_delete.len(), "delete plan");
        for (turn, tick) in to_delete {
            let kinds = self
                .where_cached
                .remove(&(branch.clone(), turn, tick))
                .unwrap_or_default();
            for kind in kinds {
                self.remove_cached_at(kind, &branch, turn, tick);
                self.backend.delete_at(kind, &branch, turn, tick)?;
            }
            self.time_plan.remove(&(branch.clone(), turn, tick));
            if let Some(claimed) = self.plan_ticks.get_mut(&plan) {
                if let Some(ticks) = claimed.get_mut(&turn) {
                    ticks.remove(&tick);
                    if ticks.is_empty() {
                        claimed.remove(&turn);
                    }
                }
                if claimed.is_empty() {
                    self.plan_ticks.remove(&plan);
                }
            }
        }
        Ok(())
    }

    fn remove_cached_at(&mut self, kind: FactKind, branch: &Branch, turn: Turn, tick: Tick) {
        match kind {
            FactKind::Graphs => {
                self.graphs.raw_mut().remove(branch, turn, tick);
            }
            FactKind::GraphVal => {
                self.graph_val.remove(branch, turn, tick);
            }
            FactKind::Nodes => {
                self.nodes.raw_mut().remove(branch, turn, tick);
            }
            FactKind::NodeVal => {
                self.node_val.remove(branch, turn, tick);
            }
            FactKind::Edges => {
                self.edges.remove(branch, turn, tick);
            }
            FactKind::EdgeVal => {
                self.edge_val.remove(branch, turn, tick);
            }
            FactKind::Universal => {
                self.universal.raw_mut().remove(branch, turn, tick);
            }
        }
    }

    /// Deletes every plan that claims one of `times` in `branch`.
    /// Committed (unplanned) writes at those times are left alone.
    fn delete_contradicted_plans(
        &mut self,
        branch: &Branch,
        times: &[(Turn, Tick)],
    ) -> Result<(), EngineError> {
        for &(turn, tick) in times {
            if let Some(&plan) = self.time_plan.get(&(branch.clone(), turn, tick)) {
                self.delete_plan(plan)?;
            }
        }
        Ok(())
    }

    /// Copies the not-yet-elapsed portion of every plan active at the fork
    /// point into the current (new) branch, under fresh plan ids.
    fn copy_plans(
        &mut self,
        branch_from: &Branch,
        turn_from: Turn,
        tick_from: Tick,
    ) -> Result<(), EngineError> {
        let source_plans: Vec<PlanId> = self
            .branches_plans
            .get(branch_from)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();
        for plan in source_plans {
            let Some(start) = self.plans.get(&plan) else {
                continue;
            };
            if (start.turn, start.tick) > (turn_from, tick_from) {
                continue;
            }
            let Some(claimed) = self.plan_ticks.get(&plan) else {
                continue;
            };
            let pending: Vec<(Turn, Tick)> = claimed
                .iter()
                .flat_map(|(&turn, ticks)| ticks.iter().map(move |&tick| (turn, tick)))
                .filter(|&(turn, tick)| (turn, tick) >= (turn_from, tick_from))
                .collect();
            if pending.is_empty() {
                continue;
            }
            self.last_plan += 1;
            let new_plan = PlanId(self.last_plan);
            let new_branch = self.cur_branch.clone();
            let (first_turn, first_tick) = pending[0];
            self.plans.insert(
                new_plan,
                Time::new(new_branch.clone(), first_turn, first_tick),
            );
            self.plans_uncommitted
                .push((new_plan, new_branch.clone(), first_turn, first_tick));
            self.branches_plans
                .entry(new_branch.clone())
                .or_default()
                .insert(new_plan);
            for (turn, tick) in pending {
                let kinds = self
                    .where_cached
                    .get(&(branch_from.clone(), turn, tick))
                    .cloned()
                    .unwrap_or_default();
                for kind in kinds {
                    self.copy_write_to_branch(kind, branch_from, turn, tick)?;
                    self.where_cached
                        .entry((new_branch.clone(), turn, tick))
                        .or_default()
                        .push(kind);
                }
                self.plan_ticks
                    .entry(new_plan)
                    .or_default()
                    .entry(turn)
                    .or_default()
                    .insert(tick);
                self.plan_ticks_uncommitted.push((new_plan, turn, tick));
                self.time_plan
                    .insert((new_branch.clone(), turn, tick), new_plan);
                let key = (new_branch.clone(), turn);
                if self.turn_end_plan.get(&key).copied().unwrap_or(Tick(0)) < tick {
                    self.turn_end_plan.insert(key, tick);
                }
            }
        }
        Ok(())
    }

    /// Replays one journaled write from `branch_from` into the current
    /// branch at the same `(turn, tick)`, as a planned write.
    fn copy_write_to_branch(
        &mut self,
        kind: FactKind,
        branch_from: &Branch,
        turn: Turn,
        tick: Tick,
    ) -> Result<(), EngineError> {
        let branch_to = self.cur_branch.clone();
        let params = StoreParams {
            planning: true,
            loading: false,
            keycache: self.kc_mode(),
        };
        match kind {
            FactKind::Graphs => {
                let Some(row) = self
                    .graphs
                    .raw()
                    .journal_for(branch_from, false)
                    .and_then(|j| j.retrieve_exact(turn, tick))
                    .cloned()
                else {
                    return Ok(());
                };
                self.backend.store_graph(GraphRow {
                    graph: row.key.clone(),
                    branch: branch_to.clone(),
                    turn,
                    tick,
                    kind: row.value,
                })?;
                self.graphs
                    .store(row.key, &branch_to, turn, tick, row.value, &self.branches, params)?;
            }
            FactKind::GraphVal => {
                let Some(row) = self
                    .graph_val
                    .journal_for(branch_from, false)
                    .and_then(|j| j.retrieve_exact(turn, tick))
                    .cloned()
                else {
                    return Ok(());
                };
                self.backend.store_graph_val(GraphValRow {
                    graph: row.entity.clone(),
                    key: row.key.clone(),
                    branch: branch_to.clone(),
                    turn,
                    tick,
                    value: row.value.clone(),
                })?;
                self.graph_val.store(
                    row.entity,
                    row.key,
                    &branch_to,
                    turn,
                    tick,
                    row.value,
                    &self.branches,
                    params,
                )?;
            }
            FactKind::Nodes => {
                let Some(row) = self
                    .nodes
                    .raw()
                    .journal_for(branch_from, false)
                    .and_then(|j| j.retrieve_exact(turn, tick))
                    .cloned()
                else {
                    return Ok(());
                };
                self.backend.store_node(NodeRow {
                    graph: row.entity.clone(),
                    node: row.key.clone(),
                    branch: branch_to.clone(),
                    turn,
                    tick,
                    exists: row.value.is_some(),
                })?;
                self.nodes.store(
                    row.entity,
                    row.key,
                    &branch_to,
                    turn,
                    tick,
                    row.value.is_some(),
                    &self.branches,
                    params,
                )?;
            }
            FactKind::NodeVal => {
                let Some(row) = self
                    .node_val
                    .journal_for(branch_from, false)
                    .and_then(|j| j.retrieve_exact(turn, tick))
                    .cloned()
                else {
                    return Ok(());
                };
                let (graph, node) = row.entity.clone();
                self.backend.store_node_val(NodeValRow {
                    graph,
                    node,
                    key: row.key.clone(),
                    branch: branch_to.clone(),
                    turn,
                    tick,
                    value: row.value.clone(),
                })?;
                self.node_val.store(
                    row.entity,
                    row.key,
                    &branch_to,
                    turn,
                    tick,
                    row.value,
                    &self.branches,
                    params,
                )?;
            }
            FactKind::Edges => {
                let Some(row) = self
                    .edges
                    .raw()
                    .journal_for(branch_from, false)
                    .and_then(|j| j.retrieve_exact(turn, tick))
                    .cloned()
                else {
                    return Ok(());
                };
                let (graph, orig, dest) = row.entity;
                self.backend.store_edge(EdgeRow {
                    graph: graph.clone(),
                    orig: orig.clone(),
                    dest: dest.clone(),
                    idx: row.key,
                    branch: branch_to.clone(),
                    turn,
                    tick,
                    exists: row.value.is_some(),
                })?;
                self.edges.store(
                    graph,
                    orig,
                    dest,
                    row.key,
                    &branch_to,
                    turn,
                    tick,
                    row.value.is_some(),
                    &self.branches,
                    params,
                )?;
            }
            FactKind::EdgeVal => {
                let Some(row) = self
                    .edge_val
                    .journal_for(branch_from, false)
                    .and_then(|j| j.retrieve_exact(turn, tick))
                    .cloned()
                else {
                    return Ok(());
                };
                let (graph, orig, dest, idx) = row.entity.clone();
                self.backend.store_edge_val(EdgeValRow {
                    graph,
                    orig,
                    dest,
                    idx,
                    key: row.key.clone(),
                    branch: branch_to.clone(),
                    turn,
                    tick,
                    value: row.value.clone(),
                })?;
                self.edge_val.store(
                    row.entity,
                    row.key,
                    &branch_to,
                    turn,
                    tick,
                    row.value,
                    &self.branches,
                    params,
                )?;
            }
            FactKind::Universal => {
                let Some(row) = self
                    .universal
                    .raw()
                    .journal_for(branch_from, false)
                    .and_then(|j| j.retrieve_exact(turn, tick))
                    .cloned()
                else {
                    return Ok(());
                };
                self.backend.store_universal(UniversalRow {
                    key: row.key.clone(),
                    branch: branch_to.clone(),
                    turn,
                    tick,
                    value: row.value.clone(),
                })?;
                self.universal.store(
                    row.key,
                    &branch_to,
                    turn,
                    tick,
                    row.value,
                    &self.branches,
                    params,
                )?;
            }
        }
        Ok(())
    }

    fn register_write(&mut self, kind: FactKind, turn: Turn, tick: Tick) {
        let coord = (self.cur_branch.clone(), turn, tick);
        let kinds = self.where_cached.entry(coord).or_default();
        if !kinds.contains(&kind) {
            kinds.push(kind);
        }
        if !self.planning {
            self.branches.extend(&self.cur_branch, turn, tick);
            let key = (self.cur_branch.clone(), turn);
            if self.turn_end.get(&key).copied().unwrap_or(Tick(0)) < tick {
                self.turn_end.insert(key, tick);
            }
        }
        let branch = self.cur_branch.clone();
        self.mark_loaded(&branch, (turn, tick), (turn, tick));
    }

    fn mark_loaded(&mut self, branch: &Branch, lo: (Turn, Tick), hi: (Turn, Tick)) {
        self.loaded
            .entry(branch.clone())
            .and_modify(|(l, h)| {
                if lo < *l {
                    *l = lo;
                }
                if hi > *h {
                    *h = hi;
                }
            })
            .or_insert((lo, hi));
    }

    // ------------------------------------------------------------------
    // Write API

    /// Creates a graph, snapshotting an eager empty keyframe for it so a
    /// fresh world is always bracketed.
    ///
    /// # Errors
    ///
    /// [`EngineError::GraphExists`] when a live graph already has the
    /// name.
    pub fn add_graph(&mut self, name: GraphName, kind: GraphKind) -> Result<Time, EngineError> {
        if self
            .graphs
            .contains_key_at(&name, &self.cur_branch, self.cur_turn, self.cur_tick, &self.branches)
        {
            return Err(EngineError::GraphExists(name));
        }
        let time = self.next_tick()?;
        let contras =
            self.graphs
                .future_contradictions(&name, &time.branch, time.turn, time.tick, &Some(kind));
        self.delete_contradicted_plans(&time.branch, &contras)?;
        let params = self.store_params();
        self.graphs.store(
            name.clone(),
            &time.branch,
            time.turn,
            time.tick,
            Some(kind),
            &self.branches,
            params,
        )?;
        self.backend.store_graph(GraphRow {
            graph: name.clone(),
            branch: time.branch.clone(),
            turn: time.turn,
            tick: time.tick,
            kind: Some(kind),
        })?;
        self.register_write(FactKind::Graphs, time.turn, time.tick);
        // Eager keyframe at creation: every scheduled coordinate carries a
        // complete world snapshot, so a fresh graph is always bracketed.
        self.snap_keyframe(true)?;
        Ok(time)
    }

    /// Deletes a graph: a tombstone in the registry plus removal of every
    /// live index entry under it. Journals survive so deltas spanning the
    /// deletion report it.
    ///
    /// # Errors
    ///
    /// [`EngineError::NoSuchGraph`] when no live graph has the name.
    pub fn del_graph(&mut self, name: &GraphName) -> Result<Time, EngineError> {
        if !self
            .graphs
            .contains_key_at(name, &self.cur_branch, self.cur_turn, self.cur_tick, &self.branches)
        {
            return Err(EngineError::NoSuchGraph(name.clone()));
        }
        let time = self.next_tick()?;
        let contras =
            self.graphs
                .future_contradictions(name, &time.branch, time.turn, time.tick, &None);
        self.delete_contradicted_plans(&time.branch, &contras)?;
        let params = self.store_params();
        self.graphs.store(
            name.clone(),
            &time.branch,
            time.turn,
            time.tick,
            None,
            &self.branches,
            params,
        )?;
        self.backend.store_graph(GraphRow {
            graph: name.clone(),
            branch: time.branch.clone(),
            turn: time.turn,
            tick: time.tick,
            kind: None,
        })?;
        self.register_write(FactKind::Graphs, time.turn, time.tick);
        let target = name.clone();
        self.graph_val.remove_entities_where(|g| *g == target);
        self.nodes.raw_mut().remove_entities_where(|g| *g == target);
        self.node_val.remove_entities_where(|(g, _)| *g == target);
        self.edges
            .raw_mut()
            .remove_entities_where(|(g, _, _)| *g == target);
        self.edge_val
            .remove_entities_where(|(g, _, _, _)| *g == target);
        Ok(time)
    }

    /// Sets (or, with `None`, deletes) a world-scoped stat.
    pub fn set_universal(&mut self, key: StatKey, value: Option<V>) -> Result<Time, EngineError> {
        let time = self.next_tick()?;
        let contras =
            self.universal
                .future_contradictions(&key, &time.branch, time.turn, time.tick, &value);
        self.delete_contradicted_plans(&time.branch, &contras)?;
        let params = self.store_params();
        self.universal.store(
            key.clone(),
            &time.branch,
            time.turn,
            time.tick,
            value.clone(),
            &self.branches,
            params,
        )?;
        self.backend.store_universal(UniversalRow {
            key,
            branch: time.branch.clone(),
            turn: time.turn,
            tick: time.tick,
            value,
        })?;
        self.register_write(FactKind::Universal, time.turn, time.tick);
        Ok(time)
    }

    /// Sets (or, with `None`, deletes) a graph stat.
    pub fn set_graph_stat(
        &mut self,
        graph: GraphName,
        key: StatKey,
        value: Option<V>,
    ) -> Result<Time, EngineError> {
        let time = self.next_tick()?;
        let contras = self.graph_val.future_contradictions(
            &graph,
            &key,
            &time.branch,
            time.turn,
            time.tick,
            &value,
        );
        self.delete_contradicted_plans(&time.branch, &contras)?;
        let params = self.store_params();
        self.graph_val.store(
            graph.clone(),
            key.clone(),
            &time.branch,
            time.turn,
            time.tick,
            value.clone(),
            &self.branches,
            params,
        )?;
        self.backend.store_graph_val(GraphValRow {
            graph,
            key,
            branch: time.branch.clone(),
            turn: time.turn,
            tick: time.tick,
            value,
        })?;
        self.register_write(FactKind::GraphVal, time.turn, time.tick);
        Ok(time)
    }

    /// Asserts or retracts the existence of a node.
    ///
    /// Retracting a node contradicts every plan asserting a live edge
    /// that touches it; those plans are deleted before the write.
    pub fn set_node(
        &mut self,
        graph: GraphName,
        node: NodeName,
        exists: bool,
    ) -> Result<Time, EngineError> {
        let time = self.next_tick()?;
        let presence = exists.then_some(());
        let mut contras = self.nodes.raw().future_contradictions(
            &graph,
            &node,
            &time.branch,
            time.turn,
            time.tick,
            &presence,
        );
        if !exists {
            contras.extend(self.edges.node_contradictions(
                &graph,
                &node,
                &time.branch,
                time.turn,
                time.tick,
            ));
        }
        self.delete_contradicted_plans(&time.branch, &contras)?;
        let params = self.store_params();
        self.nodes.store(
            graph.clone(),
            node.clone(),
            &time.branch,
            time.turn,
            time.tick,
            exists,
            &self.branches,
            params,
        )?;
        self.backend.store_node(NodeRow {
            graph,
            node,
            branch: time.branch.clone(),
            turn: time.turn,
            tick: time.tick,
            exists,
        })?;
        self.register_write(FactKind::Nodes, time.turn, time.tick);
        Ok(time)
    }

    /// Sets (or, with `None`, deletes) a node stat.
    pub fn set_node_stat(
        &mut self,
        graph: GraphName,
        node: NodeName,
        key: StatKey,
        value: Option<V>,
    ) -> Result<Time, EngineError> {
        let time = self.next_tick()?;
        let entity = (graph.clone(), node.clone());
        let contras = self.node_val.future_contradictions(
            &entity,
            &key,
            &time.branch,
            time.turn,
            time.tick,
            &value,
        );
        self.delete_contradicted_plans(&time.branch, &contras)?;
        let params = self.store_params();
        self.node_val.store(
            entity,
            key.clone(),
            &time.branch,
            time.turn,
            time.tick,
            value.clone(),
            &self.branches,
            params,
        )?;
        self.backend.store_node_val(NodeValRow {
            graph,
            node,
            key,
            branch: time.branch.clone(),
            turn: time.turn,
            tick: time.tick,
            value,
        })?;
        self.register_write(FactKind::NodeVal, time.turn, time.tick);
        Ok(time)
    }

    /// Asserts or retracts the existence of an edge.
    #[allow(clippy::too_many_arguments)]
    pub fn set_edge(
        &mut self,
        graph: GraphName,
        orig: NodeName,
        dest: NodeName,
        idx: EdgeIdx,
        exists: bool,
    ) -> Result<Time, EngineError> {
        let time = self.next_tick()?;
        let entity = (graph.clone(), orig.clone(), dest.clone());
        let presence = exists.then_some(());
        let contras = self.edges.raw().future_contradictions(
            &entity,
            &idx,
            &time.branch,
            time.turn,
            time.tick,
            &presence,
        );
        self.delete_contradicted_plans(&time.branch, &contras)?;
        let params = self.store_params();
        self.edges.store(
            graph.clone(),
            orig.clone(),
            dest.clone(),
            idx,
            &time.branch,
            time.turn,
            time.tick,
            exists,
            &self.branches,
            params,
        )?;
        self.backend.store_edge(EdgeRow {
            graph,
            orig,
            dest,
            idx,
            branch: time.branch.clone(),
            turn: time.turn,
            tick: time.tick,
            exists,
        })?;
        self.register_write(FactKind::Edges, time.turn, time.tick);
        Ok(time)
    }

    /// Sets (or, with `None`, deletes) an edge stat.
    pub fn set_edge_stat(
        &mut self,
        edge: (GraphName, NodeName, NodeName, EdgeIdx),
        key: StatKey,
        value: Option<V>,
    ) -> Result<Time, EngineError> {
        let time = self.next_tick()?;
        let contras = self.edge_val.future_contradictions(
            &edge,
            &key,
            &time.branch,
            time.turn,
            time.tick,
            &value,
        );
        self.delete_contradicted_plans(&time.branch, &contras)?;
        let (graph, orig, dest, idx) = edge.clone();
        let params = self.store_params();
        self.edge_val.store(
            edge,
            key.clone(),
            &time.branch,
            time.turn,
            time.tick,
            value.clone(),
            &self.branches,
            params,
        )?;
        self.backend.store_edge_val(EdgeValRow {
            graph,
            orig,
            dest,
            idx,
            key,
            branch: time.branch.clone(),
            turn: time.turn,
            tick: time.tick,
            value,
        })?;
        self.register_write(FactKind::EdgeVal, time.turn, time.tick);
        Ok(time)
    }

    // ------------------------------------------------------------------
    // Read API

    /// The graphs alive at a time.
    #[must_use]
    pub fn graphs_at(&self, branch: &Branch, turn: Turn, tick: Tick) -> BTreeSet<GraphName> {
        self.graphs
            .raw()
            .adds_dels(&(), branch, turn, tick, &self.branches, None)
            .0
    }

    /// A world-scoped stat at a time.
    pub fn universal_at(
        &self,
        key: &StatKey,
        branch: &Branch,
        turn: Turn,
        tick: Tick,
    ) -> Result<&V, RetrieveError> {
        self.universal.retrieve(key, branch, turn, tick, &self.branches)
    }

    /// A graph stat at a time.
    pub fn graph_stat_at(
        &self,
        graph: &GraphName,
        key: &StatKey,
        branch: &Branch,
        turn: Turn,
        tick: Tick,
    ) -> Result<&V, RetrieveError> {
        self.graph_val
            .retrieve(graph, key, branch, turn, tick, &self.branches)
    }

    /// A graph stat at the current time.
    pub fn graph_stat(&self, graph: &GraphName, key: &StatKey) -> Result<&V, RetrieveError> {
        self.graph_val.retrieve(
            graph,
            key,
            &self.cur_branch,
            self.cur_turn,
            self.cur_tick,
            &self.branches,
        )
    }

    /// Whether a node exists at a time.
    #[must_use]
    pub fn node_exists_at(
        &self,
        graph: &GraphName,
        node: &NodeName,
        branch: &Branch,
        turn: Turn,
        tick: Tick,
    ) -> bool {
        self.nodes
            .node_exists(graph, node, branch, turn, tick, &self.branches)
    }

    /// Whether a node exists at the current time.
    #[must_use]
    pub fn node_exists(&self, graph: &GraphName, node: &NodeName) -> bool {
        self.node_exists_at(graph, node, &self.cur_branch, self.cur_turn, self.cur_tick)
    }

    /// The nodes of a graph at a time.
    pub fn nodes_at(
        &mut self,
        graph: &GraphName,
        branch: &Branch,
        turn: Turn,
        tick: Tick,
    ) -> Arc<BTreeSet<NodeName>> {
        let mode = self.kc_mode();
        let Self {
            nodes, branches, ..
        } = self;
        nodes.nodes_at(graph, branch, turn, tick, branches, mode)
    }

    /// A node stat at a time.
    pub fn node_stat_at(
        &self,
        graph: &GraphName,
        node: &NodeName,
        key: &StatKey,
        branch: &Branch,
        turn: Turn,
        tick: Tick,
    ) -> Result<&V, RetrieveError> {
        self.node_val.retrieve(
            &(graph.clone(), node.clone()),
            key,
            branch,
            turn,
            tick,
            &self.branches,
        )
    }

    /// A node stat at the current time.
    pub fn node_stat(
        &self,
        graph: &GraphName,
        node: &NodeName,
        key: &StatKey,
    ) -> Result<&V, RetrieveError> {
        self.node_stat_at(graph, node, key, &self.cur_branch, self.cur_turn, self.cur_tick)
    }

    /// Whether an edge exists at a time.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn edge_exists_at(
        &self,
        graph: &GraphName,
        orig: &NodeName,
        dest: &NodeName,
        idx: EdgeIdx,
        branch: &Branch,
        turn: Turn,
        tick: Tick,
    ) -> bool {
        self.edges
            .edge_exists(graph, orig, dest, idx, branch, turn, tick, &self.branches)
    }

    /// An edge stat at a time.
    #[allow(clippy::too_many_arguments)]
    pub fn edge_stat_at(
        &self,
        graph: &GraphName,
        edge: &EdgeRef,
        key: &StatKey,
        branch: &Branch,
        turn: Turn,
        tick: Tick,
    ) -> Result<&V, RetrieveError> {
        self.edge_val.retrieve(
            &(
                graph.clone(),
                edge.orig.clone(),
                edge.dest.clone(),
                edge.idx,
            ),
            key,
            branch,
            turn,
            tick,
            &self.branches,
        )
    }

    /// The successors of a node at a time.
    pub fn successors_at(
        &mut self,
        graph: &GraphName,
        orig: &NodeName,
        branch: &Branch,
        turn: Turn,
        tick: Tick,
    ) -> Arc<BTreeSet<NodeName>> {
        let mode = self.kc_mode();
        let Self {
            edges, branches, ..
        } = self;
        edges.successors_at(graph, orig, branch, turn, tick, branches, mode)
    }

    /// The predecessors of a node at a time.
    pub fn predecessors_at(
        &mut self,
        graph: &GraphName,
        dest: &NodeName,
        branch: &Branch,
        turn: Turn,
        tick: Tick,
    ) -> Arc<BTreeSet<NodeName>> {
        let mode = self.kc_mode();
        let Self {
            edges, branches, ..
        } = self;
        edges.predecessors_at(graph, dest, branch, turn, tick, branches, mode)
    }

    /// The stat keys extant on a graph at a time.
    pub fn graph_stat_keys_at(
        &mut self,
        graph: &GraphName,
        branch: &Branch,
        turn: Turn,
        tick: Tick,
    ) -> Arc<BTreeSet<StatKey>> {
        let mode = self.kc_mode();
        let Self {
            graph_val,
            branches,
            ..
        } = self;
        graph_val.keys_at(graph, branch, turn, tick, branches, mode)
    }

    /// The stat keys extant on a node at a time.
    pub fn node_stat_keys_at(
        &mut self,
        graph: &GraphName,
        node: &NodeName,
        branch: &Branch,
        turn: Turn,
        tick: Tick,
    ) -> Arc<BTreeSet<StatKey>> {
        let mode = self.kc_mode();
        let Self {
            node_val, branches, ..
        } = self;
        node_val.keys_at(&(graph.clone(), node.clone()), branch, turn, tick, branches, mode)
    }

    /// Direct access to the node existence cache.
    #[must_use]
    pub fn nodes_cache(&self) -> &NodesCache {
        &self.nodes
    }

    /// Direct access to the edge existence cache.
    #[must_use]
    pub fn edges_cache(&self) -> &EdgesCache {
        &self.edges
    }

    /// Direct access to the graph-stat cache.
    #[must_use]
    pub fn graph_val_cache(&self) -> &Cache<GraphName, StatKey, V> {
        &self.graph_val
    }

    /// Direct access to the node-stat cache.
    #[must_use]
    pub fn node_val_cache(&self) -> &Cache<(GraphName, NodeName), StatKey, V> {
        &self.node_val
    }

    /// Direct access to the edge-stat cache.
    #[must_use]
    pub fn edge_val_cache(&self) -> &Cache<(GraphName, NodeName, NodeName, EdgeIdx), StatKey, V> {
        &self.edge_val
    }

    // ------------------------------------------------------------------
    // Deltas

    /// The net change between two times in one branch.
    ///
    /// Forward windows fold after-values in chronological order; backward
    /// windows fold before-values in reverse, reconstructing what each
    /// value was prior to every change. Both cover the half-open window
    /// `(earlier, later]`.
    #[must_use]
    pub fn get_delta(
        &self,
        branch: &Branch,
        turn_from: Turn,
        tick_from: Tick,
        turn_to: Turn,
        tick_to: Tick,
    ) -> WorldDelta<V> {
        let mut delta = WorldDelta::new();
        if (turn_from, tick_from) == (turn_to, tick_to) {
            return delta;
        }
        let backward = (turn_to, tick_to) < (turn_from, tick_from);
        let (lo, hi) = if backward {
            ((turn_to, tick_to), (turn_from, tick_from))
        } else {
            ((turn_from, tick_from), (turn_to, tick_to))
        };
        if let Some(j) = self.graphs.raw().journal_for(branch, backward) {
            j.scan_between(lo, hi, backward, |_, _, row| {
                delta.set_graph_exists(&row.key, row.value.is_some());
            });
        }
        if let Some(j) = self.graph_val.journal_for(branch, backward) {
            j.scan_between(lo, hi, backward, |_, _, row| {
                delta.set_graph_stat(&row.entity, row.key.clone(), row.value.clone());
            });
        }
        if let Some(j) = self.nodes.raw().journal_for(branch, backward) {
            j.scan_between(lo, hi, backward, |_, _, row| {
                delta.set_node(&row.entity, row.key.clone(), row.value.is_some());
            });
        }
        if let Some(j) = self.node_val.journal_for(branch, backward) {
            j.scan_between(lo, hi, backward, |_, _, row| {
                let (graph, node) = &row.entity;
                delta.set_node_stat(graph, node, row.key.clone(), row.value.clone());
            });
        }
        if let Some(j) = self.edges.raw().journal_for(branch, backward) {
            j.scan_between(lo, hi, backward, |_, _, row| {
                let (graph, orig, dest) = &row.entity;
                let edge = EdgeRef {
                    orig: orig.clone(),
                    dest: dest.clone(),
                    idx: row.key,
                };
                delta.set_edge(graph, edge, row.value.is_some());
            });
        }
        if let Some(j) = self.edge_val.journal_for(branch, backward) {
            j.scan_between(lo, hi, backward, |_, _, row| {
                let (graph, orig, dest, idx) = &row.entity;
                let edge = EdgeRef {
                    orig: orig.clone(),
                    dest: dest.clone(),
                    idx: *idx,
                };
                delta.set_edge_stat(graph, &edge, row.key.clone(), row.value.clone());
            });
        }
        delta
    }

    /// Single-turn delta: the fast path when both endpoints share a turn.
    #[must_use]
    pub fn turn_delta(
        &self,
        branch: &Branch,
        turn: Turn,
        tick_from: Tick,
        tick_to: Tick,
    ) -> WorldDelta<V> {
        self.get_delta(branch, turn, tick_from, turn, tick_to)
    }

    // ------------------------------------------------------------------
    // Keyframes

    /// Ensures a keyframe exists at the current time, returning the
    /// assembled per-graph snapshots unless `silent`.
    ///
    /// When no keyframe exists at the exact coordinate, the nearest prior
    /// one is found (recursing into parent branches and materializing
    /// intermediate snapshots at fork points), the delta from there to now
    /// is computed, and the new keyframe is its application — never a full
    /// rescan of history.
    pub fn snap_keyframe(
        &mut self,
        silent: bool,
    ) -> Result<Option<BTreeMap<GraphName, GraphKeyframe<V>>>, EngineError> {
        let (b, t, tk) = (self.cur_branch.clone(), self.cur_turn, self.cur_tick);
        if !self.schedule.contains(&b, t, tk) {
            debug!(branch = %b, turn = t.0, tick = tk.0, "snap keyframe");
            match self.recurse_delta_keyframes(b.clone(), t, tk)? {
                Some((base_t, base_tk)) if (base_t, base_tk) == (t, tk) => {}
                Some((base_t, base_tk)) => {
                    self.snap_keyframe_from_delta(&b, base_t, base_tk, t, tk)?;
                }
                None => {
                    self.snap_keyframe_de_novo(&b, t, tk)?;
                }
            }
        }
        if silent {
            return Ok(None);
        }
        let graphs = self
            .kf_graphs
            .get(&(b.clone(), t, tk))
            .cloned()
            .unwrap_or_default();
        let mut out = BTreeMap::new();
        for g in graphs {
            if let Some(kf) = self.assemble_keyframe(&g, &b, t, tk) {
                out.insert(g, kf);
            }
        }
        Ok(Some(out))
    }

    /// Guarantees a keyframe at or before `(turn, tick)` in `branch`,
    /// aliasing and materializing ancestors' snapshots down the lineage as
    /// needed, and returns its coordinate within `branch`. `None` means no
    /// keyframe exists anywhere up the lineage.
    fn recurse_delta_keyframes(
        &mut self,
        branch: Branch,
        turn: Turn,
        tick: Tick,
    ) -> Result<Option<(Turn, Tick)>, EngineError> {
        if let Some(found) = self.schedule.latest_at(&branch, turn, tick) {
            self.ensure_keyframe_resident(&branch, found.0, found.1)?;
            return Ok(Some(found));
        }
        let Some(rec) = self.branches.record(&branch) else {
            return Ok(None);
        };
        let Some(parent) = rec.parent.clone() else {
            return Ok(None);
        };
        let (fork_t, fork_tk) = (rec.turn_start, rec.tick_start);
        let Some((pbt, pbtk)) = self.recurse_delta_keyframes(parent.clone(), fork_t, fork_tk)?
        else {
            return Ok(None);
        };
        if (pbt, pbtk) != (fork_t, fork_tk) {
            // Materialize a snapshot at the fork point inside the parent so
            // the child can share it.
            self.snap_keyframe_from_delta(&parent, pbt, pbtk, fork_t, fork_tk)?;
        }
        self.alias_keyframe(&parent, &branch, fork_t, fork_tk);
        Ok(Some((fork_t, fork_tk)))
    }

    /// Builds the keyframe at `(branch, to)` by applying the journal delta
    /// to the keyframe at `(branch, from)`.
    fn snap_keyframe_from_delta(
        &mut self,
        branch: &Branch,
        turn_from: Turn,
        tick_from: Tick,
        turn_to: Turn,
        tick_to: Tick,
    ) -> Result<(), EngineError> {
        self.ensure_keyframe_resident(branch, turn_from, tick_from)?;
        let base_graphs = self
            .kf_graphs
            .get(&(branch.clone(), turn_from, tick_from))
            .cloned()
            .unwrap_or_default();
        let mut states: BTreeMap<GraphName, GraphKeyframe<V>> = BTreeMap::new();
        for g in &base_graphs {
            if let Some(kf) = self.assemble_keyframe(g, branch, turn_from, tick_from) {
                states.insert(g.clone(), kf);
            }
        }
        let delta = self.get_delta(branch, turn_from, tick_from, turn_to, tick_to);
        for (g, change) in &delta.graphs {
            match change {
                GraphChange::Deleted => {
                    states.remove(g);
                }
                GraphChange::Updated(gd) => {
                    states.entry(g.clone()).or_default().apply(gd);
                }
            }
        }
        let graph_names: BTreeSet<GraphName> = states.keys().cloned().collect();
        for (g, kf) in &states {
            self.set_graph_keyframe(g, branch, turn_to, tick_to, kf)?;
        }
        self.record_keyframe(branch, turn_to, tick_to, graph_names);
        Ok(())
    }

    /// Builds the very first keyframe by reading live state out of the
    /// caches — only ever needed for a world that has no snapshot at all.
    fn snap_keyframe_de_novo(
        &mut self,
        branch: &Branch,
        turn: Turn,
        tick: Tick,
    ) -> Result<(), EngineError> {
        let graphs = self.graphs_at(branch, turn, tick);
        for g in &graphs {
            let state = self.graph_state(g, branch, turn, tick);
            self.set_graph_keyframe(g, branch, turn, tick, &state)?;
        }
        self.record_keyframe(branch, turn, tick, graphs);
        Ok(())
    }

    fn record_keyframe(
        &mut self,
        branch: &Branch,
        turn: Turn,
        tick: Tick,
        graphs: BTreeSet<GraphName>,
    ) {
        self.schedule.insert(branch, turn, tick);
        self.keyframes_loaded
            .insert((branch.clone(), turn, tick));
        for g in &graphs {
            self.new_keyframes
                .push((g.clone(), branch.clone(), turn, tick));
        }
        self.kf_graphs
            .entry((branch.clone(), turn, tick))
            .or_default()
            .extend(graphs);
        // The registry and universal caches snapshot alongside the graphs.
        let live = self
            .graphs
            .raw()
            .adds_dels(&(), branch, turn, tick, &self.branches, None)
            .0;
        let mut registry = BTreeMap::new();
        for g in live {
            if let Ok(kind) = self.graphs.retrieve(&g, branch, turn, tick, &self.branches) {
                registry.insert(g, *kind);
            }
        }
        self.graphs
            .raw_mut()
            .set_keyframe((), branch, turn, tick, Arc::new(registry));
        let ukeys = self
            .universal
            .raw()
            .adds_dels(&(), branch, turn, tick, &self.branches, None)
            .0;
        let mut umap = BTreeMap::new();
        for k in ukeys {
            if let Ok(v) = self.universal.retrieve(&k, branch, turn, tick, &self.branches) {
                umap.insert(k, v.clone());
            }
        }
        self.universal
            .raw_mut()
            .set_keyframe((), branch, turn, tick, Arc::new(umap));
    }

    /// Shares `from_branch`'s keyframe at `(turn, tick)` into `to_branch`
    /// by reference. Keyframes are immutable once written, so aliasing is
    /// safe.
    fn alias_keyframe(&mut self, from_branch: &Branch, to_branch: &Branch, turn: Turn, tick: Tick) {
        self.graphs
            .raw_mut()
            .alias_keyframe(from_branch, to_branch, turn, tick);
        self.universal
            .raw_mut()
            .alias_keyframe(from_branch, to_branch, turn, tick);
        self.graph_val.alias_keyframe(from_branch, to_branch, turn, tick);
        self.nodes
            .raw_mut()
            .alias_keyframe(from_branch, to_branch, turn, tick);
        self.node_val.alias_keyframe(from_branch, to_branch, turn, tick);
        self.edges
            .raw_mut()
            .alias_keyframe(from_branch, to_branch, turn, tick);
        self.edge_val.alias_keyframe(from_branch, to_branch, turn, tick);
        self.schedule.insert(to_branch, turn, tick);
        let graphs = self
            .kf_graphs
            .get(&(from_branch.clone(), turn, tick))
            .cloned()
            .unwrap_or_default();
        for g in &graphs {
            self.new_keyframes
                .push((g.clone(), to_branch.clone(), turn, tick));
        }
        self.kf_graphs
            .insert((to_branch.clone(), turn, tick), graphs);
        self.keyframes_loaded
            .insert((to_branch.clone(), turn, tick));
    }

    /// Fans one graph's snapshot out into the per-entity keyframe maps of
    /// every cache.
    fn set_graph_keyframe(
        &mut self,
        graph: &GraphName,
        branch: &Branch,
        turn: Turn,
        tick: Tick,
        kf: &GraphKeyframe<V>,
    ) -> Result<(), EngineError> {
        let node_map: BTreeMap<NodeName, ()> =
            kf.nodes.iter().map(|n| (n.clone(), ())).collect();
        self.nodes
            .raw_mut()
            .set_keyframe(graph.clone(), branch, turn, tick, Arc::new(node_map));
        self.graph_val.set_keyframe(
            graph.clone(),
            branch,
            turn,
            tick,
            Arc::new(kf.stats.clone()),
        );
        for node in &kf.nodes {
            let stats = kf.node_stats.get(node).cloned().unwrap_or_default();
            self.node_val.set_keyframe(
                (graph.clone(), node.clone()),
                branch,
                turn,
                tick,
                Arc::new(stats),
            );
        }
        let mut grouped: BTreeMap<(NodeName, NodeName), BTreeMap<EdgeIdx, ()>> = BTreeMap::new();
        for edge in &kf.edges {
            grouped
                .entry((edge.orig.clone(), edge.dest.clone()))
                .or_default()
                .insert(edge.idx, ());
        }
        for ((orig, dest), idxs) in grouped {
            self.edges.raw_mut().set_keyframe(
                (graph.clone(), orig, dest),
                branch,
                turn,
                tick,
                Arc::new(idxs),
            );
        }
        for edge in &kf.edges {
            let stats = kf.edge_stats.get(edge).cloned().unwrap_or_default();
            self.edge_val.set_keyframe(
                (
                    graph.clone(),
                    edge.orig.clone(),
                    edge.dest.clone(),
                    edge.idx,
                ),
                branch,
                turn,
                tick,
                Arc::new(stats),
            );
        }
        Ok(())
    }

    /// Assembles the keyframe stored for one graph at an exact coordinate
    /// back into a [`GraphKeyframe`]. `None` when no keyframe for the
    /// graph exists there.
    #[must_use]
    pub fn assemble_keyframe(
        &self,
        graph: &GraphName,
        branch: &Branch,
        turn: Turn,
        tick: Tick,
    ) -> Option<GraphKeyframe<V>> {
        let node_map = self.nodes.raw().get_keyframe(graph, branch, turn, tick)?;
        let mut kf = GraphKeyframe {
            nodes: node_map.keys().cloned().collect(),
            ..GraphKeyframe::default()
        };
        if let Some(stats) = self.graph_val.get_keyframe(graph, branch, turn, tick) {
            kf.stats = (*stats).clone();
        }
        for node in &kf.nodes {
            if let Some(stats) = self.node_val.get_keyframe(
                &(graph.clone(), node.clone()),
                branch,
                turn,
                tick,
            ) {
                if !stats.is_empty() {
                    kf.node_stats.insert(node.clone(), (*stats).clone());
                }
            }
        }
        let edge_entities: Vec<(GraphName, NodeName, NodeName)> = self
            .edges
            .raw()
            .keyframe_entities()
            .filter(|(g, _, _)| g == graph)
            .cloned()
            .collect();
        for entity in edge_entities {
            if let Some(idxs) = self.edges.raw().get_keyframe(&entity, branch, turn, tick) {
                for idx in idxs.keys() {
                    kf.edges.insert(EdgeRef {
                        orig: entity.1.clone(),
                        dest: entity.2.clone(),
                        idx: *idx,
                    });
                }
            }
        }
        for edge in kf.edges.clone() {
            if let Some(stats) = self.edge_val.get_keyframe(
                &(
                    graph.clone(),
                    edge.orig.clone(),
                    edge.dest.clone(),
                    edge.idx,
                ),
                branch,
                turn,
                tick,
            ) {
                if !stats.is_empty() {
                    kf.edge_stats.insert(edge, (*stats).clone());
                }
            }
        }
        Some(kf)
    }

    /// Reads one graph's complete live state at a time out of the caches.
    #[must_use]
    pub fn graph_state(
        &self,
        graph: &GraphName,
        branch: &Branch,
        turn: Turn,
        tick: Tick,
    ) -> GraphKeyframe<V> {
        let mut kf = GraphKeyframe {
            nodes: self
                .nodes
                .raw()
                .adds_dels(graph, branch, turn, tick, &self.branches, None)
                .0,
            ..GraphKeyframe::default()
        };
        for key in self
            .graph_val
            .adds_dels(graph, branch, turn, tick, &self.branches, None)
            .0
        {
            if let Ok(v) = self
                .graph_val
                .retrieve(graph, &key, branch, turn, tick, &self.branches)
            {
                kf.stats.insert(key, v.clone());
            }
        }
        for node in &kf.nodes {
            let entity = (graph.clone(), node.clone());
            let mut stats = BTreeMap::new();
            for key in self
                .node_val
                .adds_dels(&entity, branch, turn, tick, &self.branches, None)
                .0
            {
                if let Ok(v) = self
                    .node_val
                    .retrieve(&entity, &key, branch, turn, tick, &self.branches)
                {
                    stats.insert(key, v.clone());
                }
            }
            if !stats.is_empty() {
                kf.node_stats.insert(node.clone(), stats);
            }
        }
        let edge_entities: Vec<(GraphName, NodeName, NodeName)> = self
            .edges
            .raw()
            .iter_entities()
            .filter(|(g, _, _)| g == graph)
            .cloned()
            .collect();
        for entity in edge_entities {
            for idx in self
                .edges
                .raw()
                .adds_dels(&entity, branch, turn, tick, &self.branches, None)
                .0
            {
                let edge = EdgeRef {
                    orig: entity.1.clone(),
                    dest: entity.2.clone(),
                    idx,
                };
                let full = (entity.0.clone(), entity.1.clone(), entity.2.clone(), idx);
                let mut stats = BTreeMap::new();
                for key in self
                    .edge_val
                    .adds_dels(&full, branch, turn, tick, &self.branches, None)
                    .0
                {
                    if let Ok(v) = self
                        .edge_val
                        .retrieve(&full, &key, branch, turn, tick, &self.branches)
                    {
                        stats.insert(key, v.clone());
                    }
                }
                if !stats.is_empty() {
                    kf.edge_stats.insert(edge.clone(), stats);
                }
                kf.edges.insert(edge);
            }
        }
        kf
    }

    fn ensure_keyframe_resident(
        &mut self,
        branch: &Branch,
        turn: Turn,
        tick: Tick,
    ) -> Result<(), EngineError> {
        if self
            .keyframes_loaded
            .contains(&(branch.clone(), turn, tick))
        {
            return Ok(());
        }
        let graphs = self
            .kf_graphs
            .get(&(branch.clone(), turn, tick))
            .cloned()
            .unwrap_or_default();
        for g in &graphs {
            if let Some(payload) = self.backend.get_keyframe(g, branch, turn, tick)? {
                self.set_graph_keyframe(g, branch, turn, tick, &payload)?;
            }
        }
        self.keyframes_loaded
            .insert((branch.clone(), turn, tick));
        Ok(())
    }

    // ------------------------------------------------------------------
    // Loading and unloading

    fn ensure_loaded(&mut self) -> Result<(), EngineError> {
        let (b, t, tk) = (self.cur_branch.clone(), self.cur_turn, self.cur_tick);
        if let Some((lo, hi)) = self.loaded.get(&b) {
            if (t, tk) >= *lo && (t, tk) <= *hi {
                return Ok(());
            }
        }
        self.load_at(&b, t, tk)
    }

    /// Pages in the history bracketing `(branch, turn, tick)`: rows
    /// strictly between the nearest keyframe at or before the target
    /// (searching the branch's ancestry) and the nearest keyframe after it
    /// in the same branch. With no keyframe anywhere, the entire history
    /// is loaded.
    pub fn load_at(&mut self, branch: &Branch, turn: Turn, tick: Tick) -> Result<(), EngineError> {
        debug!(branch = %branch, turn = turn.0, tick = tick.0, "load window");
        let lineage = self
            .branches
            .iter_parent_btt(branch, turn, tick, None);
        let mut base: Option<(Branch, Turn, Tick)> = None;
        for (ab, at, atk) in &lineage {
            if let Some((kt, ktk)) = self.schedule.latest_at(ab, *at, *atk) {
                base = Some((ab.clone(), kt, ktk));
                break;
            }
        }
        let future = self.schedule.earliest_from(branch, turn, tick);
        let windows = match &base {
            None => {
                // No keyframe anywhere: short or new game, load it all.
                let mut ws = Vec::new();
                for (ab, _, _) in lineage.iter().rev() {
                    ws.push(LoadWindow {
                        branch: ab.clone(),
                        from: None,
                        to: None,
                    });
                }
                ws
            }
            Some((kb, kt, ktk)) => {
                self.build_loading_windows(kb, *kt, *ktk, &lineage, future)
            }
        };
        for window in &windows {
            self.load_window(window)?;
        }
        if let Some((kb, kt, ktk)) = base {
            self.ensure_keyframe_resident(&kb, kt, ktk)?;
        }
        if let Some((ft, ftk)) = future {
            self.ensure_keyframe_resident(branch, ft, ftk)?;
        }
        for window in &windows {
            let lo = window.from.unwrap_or(TIME_MIN);
            let hi = window.to.unwrap_or(TIME_MAX);
            self.mark_loaded(&window.branch, lo, hi);
        }
        Ok(())
    }

    /// One window per branch segment along the ancestry path from the base
    /// keyframe down to the target, parents first.
    fn build_loading_windows(
        &self,
        base_branch: &Branch,
        base_turn: Turn,
        base_tick: Tick,
        lineage: &[(Branch, Turn, Tick)],
        future: Option<(Turn, Tick)>,
    ) -> Vec<LoadWindow> {
        let mut segments = Vec::new();
        // lineage[i] = (branch_i, time at which branch_{i-1} forked off it);
        // lineage[0] carries the target coordinate.
        for (i, (seg_branch, _, _)) in lineage.iter().enumerate() {
            let from = if seg_branch == base_branch {
                Some((base_turn, base_tick))
            } else {
                self.branches
                    .record(seg_branch)
                    .map(|rec| (rec.turn_start, rec.tick_start))
            };
            let to = if i == 0 {
                future
            } else {
                let (_, fork_t, fork_tk) = lineage[i - 1];
                Some((fork_t, fork_tk))
            };
            segments.push(LoadWindow {
                branch: seg_branch.clone(),
                from,
                to,
            });
            if seg_branch == base_branch {
                break;
            }
        }
        segments.reverse();
        segments
    }

    fn load_window(&mut self, window: &LoadWindow) -> Result<(), EngineError> {
        trace!(branch = %window.branch, "load rows");
        let graphs = self.backend.load_graphs(window)?;
        for row in graphs {
            self.where_cached
                .entry((row.branch.clone(), row.turn, row.tick))
                .or_default()
                .push(FactKind::Graphs);
            self.graphs.store(
                row.graph,
                &row.branch,
                row.turn,
                row.tick,
                row.kind,
                &self.branches,
                Self::load_params(),
            )?;
        }
        let rows = self.backend.load_graph_val(window)?;
        for row in rows {
            self.where_cached
                .entry((row.branch.clone(), row.turn, row.tick))
                .or_default()
                .push(FactKind::GraphVal);
            self.graph_val.store(
                row.graph,
                row.key,
                &row.branch,
                row.turn,
                row.tick,
                row.value,
                &self.branches,
                Self::load_params(),
            )?;
        }
        let rows = self.backend.load_nodes(window)?;
        for row in rows {
            self.where_cached
                .entry((row.branch.clone(), row.turn, row.tick))
                .or_default()
                .push(FactKind::Nodes);
            self.nodes.store(
                row.graph,
                row.node,
                &row.branch,
                row.turn,
                row.tick,
                row.exists,
                &self.branches,
                Self::load_params(),
            )?;
        }
        let rows = self.backend.load_node_val(window)?;
        for row in rows {
            self.where_cached
                .entry((row.branch.clone(), row.turn, row.tick))
                .or_default()
                .push(FactKind::NodeVal);
            self.node_val.store(
                (row.graph, row.node),
                row.key,
                &row.branch,
                row.turn,
                row.tick,
                row.value,
                &self.branches,
                Self::load_params(),
            )?;
        }
        let rows = self.backend.load_edges(window)?;
        for row in rows {
            self.where_cached
                .entry((row.branch.clone(), row.turn, row.tick))
                .or_default()
                .push(FactKind::Edges);
            self.edges.store(
                row.graph,
                row.orig,
                row.dest,
                row.idx,
                &row.branch,
                row.turn,
                row.tick,
                row.exists,
                &self.branches,
                Self::load_params(),
            )?;
        }
        let rows = self.backend.load_edge_val(window)?;
        for row in rows {
            self.where_cached
                .entry((row.branch.clone(), row.turn, row.tick))
                .or_default()
                .push(FactKind::EdgeVal);
            self.edge_val.store(
                (row.graph, row.orig, row.dest, row.idx),
                row.key,
                &row.branch,
                row.turn,
                row.tick,
                row.value,
                &self.branches,
                Self::load_params(),
            )?;
        }
        let rows = self.backend.load_universal(window)?;
        for row in rows {
            self.where_cached
                .entry((row.branch.clone(), row.turn, row.tick))
                .or_default()
                .push(FactKind::Universal);
            self.universal.store(
                row.key,
                &row.branch,
                row.turn,
                row.tick,
                row.value,
                &self.branches,
                Self::load_params(),
            )?;
        }
        Ok(())
    }

    /// Shrinks each cache's retained span to the keyframe bracket around
    /// the present: everything before the nearest keyframe at or before
    /// now, everything after the nearest keyframe after now, and every
    /// branch not on the lineage between them is discarded. Pending state
    /// is committed first, so nothing unloaded is lost.
    ///
    /// # Errors
    ///
    /// [`EngineError::NoKeyframe`] when no keyframe exists on the current
    /// lineage: unloading then would make history unreachable.
    pub fn unload(&mut self) -> Result<(), EngineError> {
        self.commit()?;
        if !self.schedule.any() {
            return Err(EngineError::NoKeyframe);
        }
        let (b, t, tk) = (self.cur_branch.clone(), self.cur_turn, self.cur_tick);
        let lineage = self.branches.iter_parent_btt(&b, t, tk, None);
        let mut base: Option<(usize, Turn, Tick)> = None;
        for (i, (ab, at, atk)) in lineage.iter().enumerate() {
            if let Some((kt, ktk)) = self.schedule.latest_at(ab, *at, *atk) {
                base = Some((i, kt, ktk));
                break;
            }
        }
        let Some((base_idx, base_t, base_tk)) = base else {
            return Err(EngineError::NoKeyframe);
        };
        let future = self.schedule.earliest_from(&b, t, tk);
        debug!(branch = %b, "unload");
        let kept: Vec<Branch> = lineage[..=base_idx]
            .iter()
            .map(|(br, _, _)| br.clone())
            .collect();
        let all_branches: Vec<Branch> =
            self.branches.iter().map(|(br, _)| br.clone()).collect();
        for branch in &all_branches {
            if !kept.contains(branch) {
                self.remove_branch_from_caches(branch);
                self.loaded.remove(branch);
                self.keyframes_loaded.retain(|(kb, _, _)| kb != branch);
            }
        }
        for (i, (seg_branch, _, _)) in lineage[..=base_idx].iter().enumerate() {
            let lo = if i == base_idx {
                self.truncate_caches(seg_branch, base_t, base_tk, Direction::Backward);
                (base_t, base_tk)
            } else {
                self.branches
                    .record(seg_branch)
                    .map_or(TIME_MIN, |rec| (rec.turn_start, rec.tick_start))
            };
            let hi = if i == 0 {
                if let Some((ft, ftk)) = future {
                    self.truncate_caches(seg_branch, ft, ftk, Direction::Forward);
                    (ft, ftk)
                } else {
                    TIME_MAX
                }
            } else {
                let (_, fork_t, fork_tk) = lineage[i - 1];
                self.truncate_caches(seg_branch, fork_t, fork_tk, Direction::Forward);
                (fork_t, fork_tk)
            };
            self.loaded.insert(seg_branch.clone(), (lo, hi));
            let seg = seg_branch.clone();
            self.keyframes_loaded.retain(|(kb, kt, ktk)| {
                *kb != seg || ((*kt, *ktk) >= lo && (*kt, *ktk) <= hi)
            });
        }
        Ok(())
    }

    fn remove_branch_from_caches(&mut self, branch: &Branch) {
        self.graphs.raw_mut().remove_branch(branch);
        self.universal.raw_mut().remove_branch(branch);
        self.graph_val.remove_branch(branch);
        self.nodes.raw_mut().remove_branch(branch);
        self.node_val.remove_branch(branch);
        self.edges.remove_branch(branch);
        self.edge_val.remove_branch(branch);
    }

    fn truncate_caches(&mut self, branch: &Branch, turn: Turn, tick: Tick, dir: Direction) {
        self.graphs.raw_mut().truncate(branch, turn, tick, dir);
        self.universal.raw_mut().truncate(branch, turn, tick, dir);
        self.graph_val.truncate(branch, turn, tick, dir);
        self.nodes.raw_mut().truncate(branch, turn, tick, dir);
        self.node_val.truncate(branch, turn, tick, dir);
        self.edges.truncate(branch, turn, tick, dir);
        self.edge_val.truncate(branch, turn, tick, dir);
    }

    // ------------------------------------------------------------------
    // Commit

    /// Flushes branch extents, turn extents, plans, and keyframes created
    /// since the last commit, then asks the backend to make everything
    /// durable. Individual fact rows are persisted as they are written and
    /// need no replay here.
    pub fn commit(&mut self) -> Result<(), EngineError> {
        debug!("commit");
        let time = self.time();
        self.backend.store_time(&time)?;
        let records: Vec<_> = self
            .branches
            .iter()
            .map(|(br, rec)| (br.clone(), rec.clone()))
            .collect();
        for (branch, rec) in records {
            self.backend.store_branch(&branch, &rec)?;
        }
        let turns: Vec<_> = self
            .turn_end_plan
            .iter()
            .map(|((branch, turn), &plan_end)| {
                let end = self
                    .turn_end
                    .get(&(branch.clone(), *turn))
                    .copied()
                    .unwrap_or(Tick(0));
                (branch.clone(), *turn, end, plan_end)
            })
            .collect();
        for (branch, turn, end, plan_end) in turns {
            self.backend.store_turn(&branch, turn, end, plan_end)?;
        }
        for (plan, branch, turn, tick) in std::mem::take(&mut self.plans_uncommitted) {
            self.backend.store_plan(plan, &branch, turn, tick)?;
        }
        for (plan, turn, tick) in std::mem::take(&mut self.plan_ticks_uncommitted) {
            self.backend.store_plan_tick(plan, turn, tick)?;
        }
        for (graph, branch, turn, tick) in std::mem::take(&mut self.new_keyframes) {
            if let Some(payload) = self.assemble_keyframe(&graph, &branch, turn, tick) {
                self.backend.store_keyframe(KeyframeRow {
                    graph,
                    branch,
                    turn,
                    tick,
                    payload,
                })?;
            }
        }
        self.backend.commit()?;
        Ok(())
    }
}
