// SPDX-License-Identifier: Apache-2.0
//! Keyframes, deltas, and the load/unload window machinery.
#![allow(clippy::unwrap_used, clippy::panic)]

use skein_core::{
    Branch, EdgeIdx, Engine, EngineConfig, EngineError, GraphKind, GraphName, NodeName, StatKey,
    Turn,
};
use skein_storage::MemoryBackend;

fn engine() -> Engine<&'static str> {
    Engine::new(Box::new(MemoryBackend::new()), EngineConfig::default()).unwrap()
}

fn town() -> GraphName {
    GraphName::new("town")
}

/// A small world with nodes, edges, and stats spread over two turns.
fn populate(e: &mut Engine<&'static str>) {
    e.add_graph(town(), GraphKind::Directed).unwrap();
    e.set_node(town(), NodeName::new("tavern"), true).unwrap();
    e.set_node(town(), NodeName::new("well"), true).unwrap();
    e.set_node_stat(town(), NodeName::new("tavern"), StatKey::new("beer"), Some("plenty"))
        .unwrap();
    e.set_edge(town(), NodeName::new("tavern"), NodeName::new("well"), EdgeIdx(0), true)
        .unwrap();
    e.set_edge_stat(
        (town(), NodeName::new("tavern"), NodeName::new("well"), EdgeIdx(0)),
        StatKey::new("length"),
        Some("short"),
    )
    .unwrap();
    e.set_graph_stat(town(), StatKey::new("weather"), Some("rain")).unwrap();
    e.set_turn(Turn(1)).unwrap();
    e.set_node_stat(town(), NodeName::new("tavern"), StatKey::new("beer"), Some("low"))
        .unwrap();
    e.set_node(town(), NodeName::new("well"), false).unwrap();
}

#[test]
fn snapshot_matches_live_state() {
    let mut e = engine();
    populate(&mut e);
    let time = e.time();
    let snapped = e.snap_keyframe(false).unwrap().unwrap();
    let live = e.graph_state(&town(), &time.branch, time.turn, time.tick);
    assert_eq!(snapped.get(&town()), Some(&live));
    assert!(e
        .keyframe_schedule()
        .contains(&time.branch, time.turn, time.tick));
    // Snapping again at the same coordinate is a no-op that still returns
    // the snapshot.
    let again = e.snap_keyframe(false).unwrap().unwrap();
    assert_eq!(again.get(&town()), Some(&live));
}

#[test]
fn forward_delta_rebuilds_the_later_keyframe() {
    let mut e = engine();
    e.add_graph(town(), GraphKind::Directed).unwrap();
    let t1 = e.time();
    let base = e.snap_keyframe(false).unwrap().unwrap();
    // Mutate across a few turns.
    e.set_node(town(), NodeName::new("tavern"), true).unwrap();
    e.set_turn(Turn(2)).unwrap();
    e.set_node_stat(town(), NodeName::new("tavern"), StatKey::new("beer"), Some("plenty"))
        .unwrap();
    e.set_graph_stat(town(), StatKey::new("weather"), Some("sun")).unwrap();
    let t2 = e.time();
    let target = e.snap_keyframe(false).unwrap().unwrap();
    // Applying the forward delta to the old keyframe reconstructs the new.
    let delta = e.get_delta(&t1.branch, t1.turn, t1.tick, t2.turn, t2.tick);
    let mut rebuilt = base.get(&town()).cloned().unwrap_or_default();
    if let Some(gd) = delta.updated(&town()) {
        rebuilt.apply(gd);
    }
    assert_eq!(Some(&rebuilt), target.get(&town()));
}

#[test]
fn backward_delta_restores_the_earlier_keyframe() {
    let mut e = engine();
    populate(&mut e);
    let t1 = e.time();
    let early = e.snap_keyframe(false).unwrap().unwrap();
    e.set_turn(Turn(3)).unwrap();
    e.set_graph_stat(town(), StatKey::new("weather"), Some("storm")).unwrap();
    e.set_node(town(), NodeName::new("gate"), true).unwrap();
    e.set_node_stat(town(), NodeName::new("tavern"), StatKey::new("beer"), Some("out"))
        .unwrap();
    let t2 = e.time();
    let late = e.snap_keyframe(false).unwrap().unwrap();
    // Walk the pre-write journal back from t2 to t1.
    let delta = e.get_delta(&t2.branch, t2.turn, t2.tick, t1.turn, t1.tick);
    let mut rebuilt = late.get(&town()).cloned().unwrap_or_default();
    if let Some(gd) = delta.updated(&town()) {
        rebuilt.apply(gd);
    }
    assert_eq!(Some(&rebuilt), early.get(&town()));
}

#[test]
fn keyframe_alone_serves_reads_after_unload() {
    let mut e = engine();
    populate(&mut e);
    e.set_turn(Turn(10)).unwrap();
    e.set_graph_stat(town(), StatKey::new("weather"), Some("fog")).unwrap();
    e.snap_keyframe(true).unwrap();
    e.unload().unwrap();
    let trunk = Branch::trunk();
    // No writes after the keyframe: the keyframe alone answers.
    assert_eq!(
        e.graph_stat_at(&town(), &StatKey::new("weather"), &trunk, Turn(15), skein_core::Tick(0))
            .unwrap(),
        &"fog"
    );
    assert_eq!(
        e.node_stat_at(
            &town(),
            &NodeName::new("tavern"),
            &StatKey::new("beer"),
            &trunk,
            Turn(15),
            skein_core::Tick(0)
        )
        .unwrap(),
        &"low"
    );
    // The well was deleted before the keyframe; the keyframe confirms its
    // absence rather than resurrecting it.
    assert!(!e.node_exists_at(&town(), &NodeName::new("well"), &trunk, Turn(15), skein_core::Tick(0)));
}

#[test]
fn unload_without_any_keyframe_is_refused() {
    let mut e = engine();
    // A world with no graphs has no keyframes either.
    let err = e.unload().unwrap_err();
    assert!(matches!(err, EngineError::NoKeyframe));
}

#[test]
fn time_travel_after_unload_reloads_from_storage() {
    let mut e = engine();
    populate(&mut e);
    let before = e.time();
    let weather_then = e
        .graph_stat_at(&town(), &StatKey::new("weather"), &before.branch, before.turn, before.tick)
        .map(|v| *v)
        .unwrap();
    e.set_turn(Turn(10)).unwrap();
    e.set_graph_stat(town(), StatKey::new("weather"), Some("fog")).unwrap();
    e.snap_keyframe(true).unwrap();
    e.unload().unwrap();
    // Early history is no longer resident; travelling back pages it in
    // from the backend transparently.
    e.set_turn(before.turn).unwrap();
    assert_eq!(
        e.graph_stat_at(&town(), &StatKey::new("weather"), &before.branch, before.turn, before.tick)
            .unwrap(),
        &weather_then
    );
}

#[test]
fn child_branch_snapshots_alias_the_fork_point() {
    let mut e = engine();
    populate(&mut e);
    e.snap_keyframe(true).unwrap();
    let fork_time = e.time();
    e.set_branch(Branch::new("alt")).unwrap();
    // No writes in the child yet: its snapshot comes from the parent's
    // keyframe, shared by reference at the fork coordinate.
    let snapped = e.snap_keyframe(false).unwrap().unwrap();
    let parent_state = e.graph_state(&town(), &Branch::trunk(), fork_time.turn, fork_time.tick);
    assert_eq!(snapped.get(&town()), Some(&parent_state));
    assert!(e
        .keyframe_schedule()
        .contains(&Branch::new("alt"), fork_time.turn, fork_time.tick));
}

#[test]
fn deltas_report_graph_deletion() {
    let mut e = engine();
    populate(&mut e);
    let t1 = e.time();
    e.set_turn(Turn(4)).unwrap();
    e.del_graph(&town()).unwrap();
    let t2 = e.time();
    let delta = e.get_delta(&t1.branch, t1.turn, t1.tick, t2.turn, t2.tick);
    assert!(matches!(
        delta.graphs.get(&town()),
        Some(skein_core::GraphChange::Deleted)
    ));
}

#[test]
fn same_turn_delta_uses_the_tick_window() {
    let mut e = engine();
    e.add_graph(town(), GraphKind::Directed).unwrap();
    let start = e.time();
    e.set_graph_stat(town(), StatKey::new("a"), Some("1")).unwrap();
    let mid = e.time();
    e.set_graph_stat(town(), StatKey::new("b"), Some("2")).unwrap();
    let end = e.time();
    let full = e.turn_delta(&start.branch, start.turn, start.tick, end.tick);
    let tail = e.turn_delta(&start.branch, start.turn, mid.tick, end.tick);
    let full_town = full.updated(&town()).unwrap();
    assert_eq!(full_town.stats.len(), 2);
    let tail_town = tail.updated(&town()).unwrap();
    assert_eq!(tail_town.stats.len(), 1);
    assert!(tail_town.stats.contains_key(&StatKey::new("b")));
}
