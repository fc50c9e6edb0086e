// SPDX-License-Identifier: Apache-2.0
//! Keyframe payloads and the schedule of keyframe times.
//!
//! A keyframe is a complete snapshot of one graph at one exact coordinate.
//! Inside the caches it is fanned out into per-entity `Arc`-shared maps;
//! [`GraphKeyframe`] is the assembled, per-graph form used at the storage
//! boundary and by delta-based reconstruction. Keyframes are immutable once
//! written, which is what makes cross-branch aliasing by reference safe.
//!
//! [`KeyframeSchedule`] records where keyframes exist in time. Load and
//! unload windowing consult it for the nearest snapshot at-or-before and
//! at-or-after a target; reads consult the caches directly.

use std::collections::{BTreeMap, BTreeSet};

use rustc_hash::FxHashMap;

use crate::delta::GraphDelta;
use crate::ident::{EdgeRef, NodeName, StatKey};
use crate::time::{Branch, Tick, Turn};

/// A complete snapshot of one graph at one exact time.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GraphKeyframe<V> {
    /// Graph-level stats.
    pub stats: BTreeMap<StatKey, V>,
    /// Extant nodes.
    pub nodes: BTreeSet<NodeName>,
    /// Stats per extant node.
    pub node_stats: BTreeMap<NodeName, BTreeMap<StatKey, V>>,
    /// Extant edges.
    pub edges: BTreeSet<EdgeRef>,
    /// Stats per extant edge.
    pub edge_stats: BTreeMap<EdgeRef, BTreeMap<StatKey, V>>,
}

impl<V> Default for GraphKeyframe<V> {
    fn default() -> Self {
        Self {
            stats: BTreeMap::new(),
            nodes: BTreeSet::new(),
            node_stats: BTreeMap::new(),
            edges: BTreeSet::new(),
            edge_stats: BTreeMap::new(),
        }
    }
}

impl<V: Clone> GraphKeyframe<V> {
    /// Applies a delta on top of this snapshot, producing the state at the
    /// delta's far end. This is the reconstruction step behind
    /// delta-based keyframe creation.
    pub fn apply(&mut self, delta: &GraphDelta<V>) {
        for (key, change) in &delta.stats {
            match change {
                Some(v) => {
                    self.stats.insert(key.clone(), v.clone());
                }
                None => {
                    self.stats.remove(key);
                }
            }
        }
        for (node, exists) in &delta.nodes {
            if *exists {
                self.nodes.insert(node.clone());
            } else {
                self.nodes.remove(node);
                self.node_stats.remove(node);
            }
        }
        for (node, stats) in &delta.node_stats {
            let entry = self.node_stats.entry(node.clone()).or_default();
            for (key, change) in stats {
                match change {
                    Some(v) => {
                        entry.insert(key.clone(), v.clone());
                    }
                    None => {
                        entry.remove(key);
                    }
                }
            }
            if entry.is_empty() {
                self.node_stats.remove(node);
            }
        }
        for (edge, exists) in &delta.edges {
            if *exists {
                self.edges.insert(edge.clone());
            } else {
                self.edges.remove(edge);
                self.edge_stats.remove(edge);
            }
        }
        for (edge, stats) in &delta.edge_stats {
            let entry = self.edge_stats.entry(edge.clone()).or_default();
            for (key, change) in stats {
                match change {
                    Some(v) => {
                        entry.insert(key.clone(), v.clone());
                    }
                    None => {
                        entry.remove(key);
                    }
                }
            }
            if entry.is_empty() {
                self.edge_stats.remove(edge);
            }
        }
    }
}

/// Where keyframes exist, per branch: turn → set of ticks.
#[derive(Clone, Debug, Default)]
pub struct KeyframeSchedule {
    times: FxHashMap<Branch, BTreeMap<Turn, BTreeSet<Tick>>>,
}

impl KeyframeSchedule {
    /// Creates an empty schedule.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether any keyframe exists anywhere.
    #[must_use]
    pub fn any(&self) -> bool {
        self.times.values().any(|t| !t.is_empty())
    }

    /// Records a keyframe at an exact coordinate.
    pub fn insert(&mut self, branch: &Branch, turn: Turn, tick: Tick) {
        self.times
            .entry(branch.clone())
            .or_default()
            .entry(turn)
            .or_default()
            .insert(tick);
    }

    /// Whether a keyframe exists at exactly this coordinate.
    #[must_use]
    pub fn contains(&self, branch: &Branch, turn: Turn, tick: Tick) -> bool {
        self.times
            .get(branch)
            .and_then(|t| t.get(&turn))
            .is_some_and(|ticks| ticks.contains(&tick))
    }

    /// The latest keyframe time in `branch` at or before `(turn, tick)`.
    #[must_use]
    pub fn latest_at(&self, branch: &Branch, turn: Turn, tick: Tick) -> Option<(Turn, Tick)> {
        let turns = self.times.get(branch)?;
        for (&tn, ticks) in turns.range(..=turn).rev() {
            let bound = if tn == turn { tick } else { Tick(i64::MAX) };
            if let Some(&tk) = ticks.range(..=bound).next_back() {
                return Some((tn, tk));
            }
        }
        None
    }

    /// The earliest keyframe time in `branch` at or after `(turn, tick)`.
    #[must_use]
    pub fn earliest_from(&self, branch: &Branch, turn: Turn, tick: Tick) -> Option<(Turn, Tick)> {
        let turns = self.times.get(branch)?;
        for (&tn, ticks) in turns.range(turn..) {
            let bound = if tn == turn { tick } else { Tick(i64::MIN) };
            if let Some(&tk) = ticks.range(bound..).next() {
                return Some((tn, tk));
            }
        }
        None
    }

    /// Every recorded keyframe time, branch by branch.
    pub fn iter(&self) -> impl Iterator<Item = (&Branch, Turn, Tick)> {
        self.times.iter().flat_map(|(b, turns)| {
            turns
                .iter()
                .flat_map(move |(&tn, ticks)| ticks.iter().map(move |&tk| (b, tn, tk)))
        })
    }

    /// Forgets every keyframe in `branch`.
    pub fn remove_branch(&mut self, branch: &Branch) {
        self.times.remove(branch);
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::delta::WorldDelta;

    #[test]
    fn apply_delta_reconstructs_state() {
        let mut kf: GraphKeyframe<&'static str> = GraphKeyframe::default();
        kf.nodes.insert(NodeName::new("a"));
        kf.node_stats.insert(
            NodeName::new("a"),
            [(StatKey::new("hp"), "10")].into_iter().collect(),
        );
        kf.stats.insert(StatKey::new("weather"), "rain");

        let g = GraphName::new("town");
        let mut delta: WorldDelta<&'static str> = WorldDelta::new();
        delta.set_graph_stat(&g, StatKey::new("weather"), None);
        delta.set_node(&g, NodeName::new("b"), true);
        delta.set_node_stat(&g, &NodeName::new("a"), StatKey::new("hp"), Some("7"));
        let Some(gd) = delta.updated(&g) else {
            panic!("delta should be an update")
        };
        kf.apply(gd);

        assert!(kf.stats.is_empty());
        assert!(kf.nodes.contains(&NodeName::new("b")));
        assert_eq!(
            kf.node_stats.get(&NodeName::new("a")).unwrap()[&StatKey::new("hp")],
            "7"
        );
    }

    #[test]
    fn node_removal_drops_its_stats() {
        let mut kf: GraphKeyframe<i64> = GraphKeyframe::default();
        kf.nodes.insert(NodeName::new("a"));
        kf.node_stats
            .insert(NodeName::new("a"), [(StatKey::new("x"), 1)].into_iter().collect());
        let g = GraphName::new("town");
        let mut delta: WorldDelta<i64> = WorldDelta::new();
        delta.set_node(&g, NodeName::new("a"), false);
        let Some(gd) = delta.updated(&g) else {
            panic!("delta should be an update")
        };
        kf.apply(gd);
        assert!(kf.nodes.is_empty());
        assert!(kf.node_stats.is_empty());
    }

    #[test]
    fn schedule_finds_bracketing_keyframes() {
        let mut s = KeyframeSchedule::new();
        let trunk = Branch::trunk();
        s.insert(&trunk, Turn(2), Tick(0));
        s.insert(&trunk, Turn(5), Tick(3));
        s.insert(&trunk, Turn(5), Tick(7));
        assert_eq!(s.latest_at(&trunk, Turn(5), Tick(5)), Some((Turn(5), Tick(3))));
        assert_eq!(s.latest_at(&trunk, Turn(4), Tick(0)), Some((Turn(2), Tick(0))));
        assert_eq!(s.latest_at(&trunk, Turn(1), Tick(9)), None);
        assert_eq!(
            s.earliest_from(&trunk, Turn(5), Tick(4)),
            Some((Turn(5), Tick(7)))
        );
        assert_eq!(
            s.earliest_from(&trunk, Turn(3), Tick(0)),
            Some((Turn(5), Tick(3)))
        );
        assert_eq!(s.earliest_from(&trunk, Turn(6), Tick(0)), None);
        assert!(s.contains(&trunk, Turn(2), Tick(0)));
        assert!(!s.contains(&trunk, Turn(2), Tick(1)));
    }
}
