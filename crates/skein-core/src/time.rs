// SPDX-License-Identifier: Apache-2.0
//! Time coordinates and the branch registry.
//!
//! Time is a tree. A coordinate is `(branch, turn, tick)`: the branch names
//! an alternate timeline, the turn is a full simulation step, and the tick
//! orders writes within a turn. Ordering is total only within one branch;
//! comparing times across branches requires walking branch parentage, which
//! [`BranchGraph`] memoizes.

use std::fmt;
use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::errors::TimelineError;

/// Name of one timeline branch.
///
/// The trunk branch has no parent; every other branch forks from its parent
/// at a recorded `(turn, tick)`.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Branch(Arc<str>);

impl Branch {
    /// The default root branch, named `trunk`.
    #[must_use]
    pub fn trunk() -> Self {
        Self(Arc::from("trunk"))
    }

    /// Wraps a string as a branch name.
    #[must_use]
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(Arc::from(name.as_ref()))
    }

    /// Returns the branch name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Branch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Branch {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// A revision number usable as a [`WindowDict`](crate::window::WindowDict)
/// key: totally ordered, copyable, and mappable to and from a plain integer
/// index (used for stride sampling and diagnostics).
pub trait Rev: Copy + Ord + fmt::Debug {
    /// The integer index of this revision.
    fn index(self) -> i64;

    /// Builds a revision from an integer index.
    fn from_index(i: i64) -> Self;

    /// The immediately preceding revision.
    #[must_use]
    fn pred(self) -> Self {
        Self::from_index(self.index() - 1)
    }

    /// The immediately following revision.
    #[must_use]
    fn succ(self) -> Self {
        Self::from_index(self.index() + 1)
    }
}

/// One full simulation step.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Turn(pub i64);

/// One sub-step within a turn, ordering the writes made during it.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Tick(pub i64);

impl Rev for Turn {
    fn index(self) -> i64 {
        self.0
    }

    fn from_index(i: i64) -> Self {
        Self(i)
    }
}

impl Rev for Tick {
    fn index(self) -> i64 {
        self.0
    }

    fn from_index(i: i64) -> Self {
        Self(i)
    }
}

impl fmt::Display for Turn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Tick {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A full time coordinate: branch, turn, and tick.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Time {
    /// Timeline branch.
    pub branch: Branch,
    /// Turn within the branch.
    pub turn: Turn,
    /// Tick within the turn.
    pub tick: Tick,
}

impl Time {
    /// Builds a time coordinate.
    #[must_use]
    pub fn new(branch: Branch, turn: Turn, tick: Tick) -> Self {
        Self { branch, turn, tick }
    }

    /// The origin of the trunk branch: `(trunk, 0, 0)`.
    #[must_use]
    pub fn origin() -> Self {
        Self::new(Branch::trunk(), Turn(0), Tick(0))
    }
}

impl fmt::Display for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.branch, self.turn, self.tick)
    }
}

/// Where a branch sits in the timeline tree: its parent, the fork point, and
/// the furthest `(turn, tick)` anything has been written in it.
///
/// The extent (`turn_end`, `tick_end`) grows monotonically as committed
/// writes occur; planned writes extend a separate bookkeeping value owned by
/// the engine, never the record here.
#[derive(Clone, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BranchRecord {
    /// Parent branch, or `None` for the trunk.
    pub parent: Option<Branch>,
    /// Turn at which this branch forked off its parent.
    pub turn_start: Turn,
    /// Tick at which this branch forked off its parent.
    pub tick_start: Tick,
    /// Last committed turn in this branch.
    pub turn_end: Turn,
    /// Last committed tick within `turn_end`.
    pub tick_end: Tick,
}

impl BranchRecord {
    /// Whether `(turn, tick)` falls before the start of this branch.
    #[must_use]
    pub fn starts_after(&self, turn: Turn, tick: Tick) -> bool {
        (turn, tick) < (self.turn_start, self.tick_start)
    }

    /// Whether `(turn, tick)` falls after the committed end of this branch.
    #[must_use]
    pub fn ends_before(&self, turn: Turn, tick: Tick) -> bool {
        (turn, tick) > (self.turn_end, self.tick_end)
    }
}

/// Bound for [`BranchGraph::iter_parent_btt`]: stop walking the lineage
/// instead of yielding any time at or before this coordinate within the stop
/// branch or its ancestors.
#[derive(Clone, Debug)]
pub struct StopTime {
    /// Branch the bound lives in.
    pub branch: Branch,
    /// Turn bound.
    pub turn: Turn,
    /// Tick bound.
    pub tick: Tick,
}

/// The branch registry: every branch's record, its children, and a memoized
/// set of its ancestors at any remove.
///
/// The parent chain of a branch is immutable once the branch is forked, so
/// ancestor sets are computed once at fork time rather than re-derived on
/// every lineage walk.
#[derive(Clone, Debug, Default)]
pub struct BranchGraph {
    records: FxHashMap<Branch, BranchRecord>,
    children: FxHashMap<Branch, FxHashSet<Branch>>,
    ancestors: FxHashMap<Branch, FxHashSet<Branch>>,
}

impl BranchGraph {
    /// Creates a registry containing only the trunk branch at `(0, 0)`.
    #[must_use]
    pub fn new() -> Self {
        let mut g = Self::default();
        g.records.insert(
            Branch::trunk(),
            BranchRecord {
                parent: None,
                turn_start: Turn(0),
                tick_start: Tick(0),
                turn_end: Turn(0),
                tick_end: Tick(0),
            },
        );
        g
    }

    /// Returns the record for `branch`, if it exists.
    #[must_use]
    pub fn record(&self, branch: &Branch) -> Option<&BranchRecord> {
        self.records.get(branch)
    }

    /// Whether `branch` is registered.
    #[must_use]
    pub fn contains(&self, branch: &Branch) -> bool {
        self.records.contains_key(branch)
    }

    /// Iterates over every registered branch and its record.
    pub fn iter(&self) -> impl Iterator<Item = (&Branch, &BranchRecord)> {
        self.records.iter()
    }

    /// Registers `child` as a fork of `parent` at `(turn, tick)`.
    ///
    /// # Errors
    ///
    /// Fails if `child` already exists or `parent` does not.
    pub fn fork(
        &mut self,
        child: Branch,
        parent: &Branch,
        turn: Turn,
        tick: Tick,
    ) -> Result<(), TimelineError> {
        if self.records.contains_key(&child) {
            return Err(TimelineError::BranchExists(child.as_str().to_owned()));
        }
        let Some(_) = self.records.get(parent) else {
            return Err(TimelineError::NoSuchBranch(parent.as_str().to_owned()));
        };
        self.records.insert(
            child.clone(),
            BranchRecord {
                parent: Some(parent.clone()),
                turn_start: turn,
                tick_start: tick,
                turn_end: turn,
                tick_end: tick,
            },
        );
        self.children
            .entry(parent.clone())
            .or_default()
            .insert(child.clone());
        // Ancestors of the child: the parent plus everything above it.
        let mut above = self
            .ancestors
            .get(parent)
            .cloned()
            .unwrap_or_default();
        above.insert(parent.clone());
        self.ancestors.insert(child, above);
        Ok(())
    }

    /// Registers a branch record loaded from storage, without validation
    /// beyond parentage memoization. Records must arrive parents-first.
    pub fn insert_loaded(&mut self, branch: Branch, record: BranchRecord) {
        if let Some(parent) = record.parent.clone() {
            self.children
                .entry(parent.clone())
                .or_default()
                .insert(branch.clone());
            let mut above = self.ancestors.get(&parent).cloned().unwrap_or_default();
            above.insert(parent);
            self.ancestors.insert(branch.clone(), above);
        }
        self.records.insert(branch, record);
    }

    /// Grows the committed extent of `branch` to `(turn, tick)` if that is
    /// later than the current extent.
    pub fn extend(&mut self, branch: &Branch, turn: Turn, tick: Tick) {
        if let Some(rec) = self.records.get_mut(branch) {
            if (turn, tick) > (rec.turn_end, rec.tick_end) {
                rec.turn_end = turn;
                rec.tick_end = tick;
            }
        }
    }

    /// Whether `ancestor` is an ancestor of `descendant` at any remove, or
    /// the same branch.
    #[must_use]
    pub fn is_ancestor(&self, ancestor: &Branch, descendant: &Branch) -> bool {
        if ancestor == descendant {
            return true;
        }
        self.ancestors
            .get(descendant)
            .is_some_and(|s| s.contains(ancestor))
    }

    /// Branches immediately descended from `branch`.
    pub fn child_branches<'a>(&'a self, branch: &Branch) -> impl Iterator<Item = &'a Branch> {
        self.children.get(branch).into_iter().flatten()
    }

    /// Walks from `(branch, turn, tick)` up the branch lineage.
    ///
    /// Yields the starting coordinate first, then for each ancestor branch
    /// the coordinate at which the previous branch forked off it. With a
    /// `stop` bound, the walk ends (without yielding) as soon as it would
    /// yield a time at or before the bound inside the bound's branch or any
    /// of the bound's ancestors.
    ///
    /// This is the resolution order for every time-travelling read: the
    /// nearest information wins, and a child branch inherits everything its
    /// parent knew up to the fork point.
    #[must_use]
    pub fn iter_parent_btt(
        &self,
        branch: &Branch,
        turn: Turn,
        tick: Tick,
        stop: Option<&StopTime>,
    ) -> Vec<(Branch, Turn, Tick)> {
        let mut out = vec![(branch.clone(), turn, tick)];
        let stop_branches: FxHashSet<Branch> = stop.map_or_else(FxHashSet::default, |s| {
            let mut set: FxHashSet<Branch> =
                self.ancestors.get(&s.branch).cloned().unwrap_or_default();
            set.insert(s.branch.clone());
            set
        });
        let mut cur = branch.clone();
        while let Some(rec) = self.records.get(&cur) {
            let Some(parent) = rec.parent.clone() else {
                break;
            };
            let (ft, fk) = (rec.turn_start, rec.tick_start);
            if let Some(s) = stop {
                if stop_branches.contains(&parent) && (ft, fk) <= (s.turn, s.tick) {
                    return out;
                }
            }
            out.push((parent.clone(), ft, fk));
            cur = parent;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fork(g: &mut BranchGraph, child: &str, parent: &str, turn: i64, tick: i64) {
        g.fork(Branch::new(child), &Branch::new(parent), Turn(turn), Tick(tick))
            .unwrap();
    }

    #[test]
    fn trunk_exists_from_the_start() {
        let g = BranchGraph::new();
        assert!(g.contains(&Branch::trunk()));
        assert!(g.record(&Branch::trunk()).unwrap().parent.is_none());
    }

    #[test]
    fn fork_rejects_duplicates_and_unknown_parents() {
        let mut g = BranchGraph::new();
        fork(&mut g, "alt", "trunk", 3, 0);
        assert!(g
            .fork(Branch::new("alt"), &Branch::trunk(), Turn(4), Tick(0))
            .is_err());
        assert!(g
            .fork(Branch::new("x"), &Branch::new("ghost"), Turn(0), Tick(0))
            .is_err());
    }

    #[test]
    fn ancestor_sets_are_transitive() {
        let mut g = BranchGraph::new();
        fork(&mut g, "alt", "trunk", 3, 0);
        fork(&mut g, "alt2", "alt", 5, 1);
        assert!(g.is_ancestor(&Branch::trunk(), &Branch::new("alt2")));
        assert!(g.is_ancestor(&Branch::new("alt"), &Branch::new("alt2")));
        assert!(!g.is_ancestor(&Branch::new("alt2"), &Branch::new("alt")));
    }

    #[test]
    fn lineage_walk_yields_fork_points() {
        let mut g = BranchGraph::new();
        fork(&mut g, "alt", "trunk", 3, 2);
        fork(&mut g, "alt2", "alt", 5, 1);
        let walk = g.iter_parent_btt(&Branch::new("alt2"), Turn(9), Tick(4), None);
        assert_eq!(
            walk,
            vec![
                (Branch::new("alt2"), Turn(9), Tick(4)),
                (Branch::new("alt"), Turn(5), Tick(1)),
                (Branch::trunk(), Turn(3), Tick(2)),
            ]
        );
    }

    #[test]
    fn lineage_walk_honors_stop_time() {
        let mut g = BranchGraph::new();
        fork(&mut g, "alt", "trunk", 3, 2);
        let stop = StopTime {
            branch: Branch::trunk(),
            turn: Turn(3),
            tick: Tick(2),
        };
        let walk = g.iter_parent_btt(&Branch::new("alt"), Turn(7), Tick(0), Some(&stop));
        // The fork point (trunk, 3, 2) is at the stop bound, so it is not
        // yielded.
        assert_eq!(walk, vec![(Branch::new("alt"), Turn(7), Tick(0))]);
    }

    #[test]
    fn extent_only_grows() {
        let mut g = BranchGraph::new();
        g.extend(&Branch::trunk(), Turn(4), Tick(7));
        g.extend(&Branch::trunk(), Turn(2), Tick(0));
        let rec = g.record(&Branch::trunk()).unwrap();
        assert_eq!((rec.turn_end, rec.tick_end), (Turn(4), Tick(7)));
    }
}
