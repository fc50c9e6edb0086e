// SPDX-License-Identifier: Apache-2.0
//! Cursor movement, branching, and the arrow of time.
#![allow(clippy::unwrap_used, clippy::panic)]

use skein_core::{
    Branch, Engine, EngineConfig, EngineError, GraphKind, GraphName, NodeName, OutOfTimelineReason,
    RetrieveError, StatKey, Turn,
};
use skein_storage::MemoryBackend;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn engine() -> Engine<&'static str> {
    Engine::new(Box::new(MemoryBackend::new()), EngineConfig::default()).unwrap()
}

fn town() -> GraphName {
    GraphName::new("town")
}

#[test]
fn values_are_readable_at_and_after_their_write_time() {
    let mut e = engine();
    e.add_graph(town(), GraphKind::Directed).unwrap();
    e.set_node(town(), NodeName::new("nodeX"), true).unwrap();
    let t_red = e
        .set_node_stat(town(), NodeName::new("nodeX"), StatKey::new("stat1"), Some("red"))
        .unwrap();
    let t_blue = e
        .set_node_stat(town(), NodeName::new("nodeX"), StatKey::new("stat1"), Some("blue"))
        .unwrap();
    let trunk = Branch::trunk();
    let red = e
        .node_stat_at(
            &town(),
            &NodeName::new("nodeX"),
            &StatKey::new("stat1"),
            &trunk,
            t_red.turn,
            t_red.tick,
        )
        .unwrap();
    assert_eq!(red, &"red");
    let blue = e
        .node_stat_at(
            &town(),
            &NodeName::new("nodeX"),
            &StatKey::new("stat1"),
            &trunk,
            t_blue.turn,
            t_blue.tick,
        )
        .unwrap();
    assert_eq!(blue, &"blue");
    // Later writes never disturb earlier reads.
    assert_eq!(
        e.node_stat_at(
            &town(),
            &NodeName::new("nodeX"),
            &StatKey::new("stat1"),
            &trunk,
            t_red.turn,
            t_red.tick,
        )
        .unwrap(),
        &"red"
    );
}

#[test]
fn deleting_a_stat_is_not_the_same_as_never_setting_it() {
    let mut e = engine();
    e.add_graph(town(), GraphKind::Directed).unwrap();
    let t_set = e
        .set_graph_stat(town(), StatKey::new("weather"), Some("rain"))
        .unwrap();
    let t_del = e.set_graph_stat(town(), StatKey::new("weather"), None).unwrap();
    let trunk = Branch::trunk();
    assert_eq!(
        e.graph_stat_at(&town(), &StatKey::new("weather"), &trunk, t_set.turn, t_set.tick)
            .unwrap(),
        &"rain"
    );
    assert_eq!(
        e.graph_stat_at(&town(), &StatKey::new("weather"), &trunk, t_del.turn, t_del.tick)
            .unwrap_err(),
        RetrieveError::Deleted
    );
    // A key no write ever mentioned resolves against the creation
    // keyframe, which confirms its absence.
    assert_eq!(
        e.graph_stat_at(&town(), &StatKey::new("never"), &trunk, t_del.turn, t_del.tick)
            .unwrap_err(),
        RetrieveError::NotInKeyframe
    );
}

#[test]
fn child_branches_inherit_until_they_diverge() {
    let mut e = engine();
    e.add_graph(town(), GraphKind::Directed).unwrap();
    let t_one = e.set_graph_stat(town(), StatKey::new("stat"), Some("1")).unwrap();
    // Fork an alternate history at the present and diverge there.
    e.set_branch(Branch::new("alt")).unwrap();
    let t_two = e.set_graph_stat(town(), StatKey::new("stat"), Some("2")).unwrap();
    let trunk = Branch::trunk();
    let alt = Branch::new("alt");
    // The trunk is untouched by the alternate's write.
    assert_eq!(
        e.graph_stat_at(&town(), &StatKey::new("stat"), &trunk, t_two.turn, t_two.tick)
            .unwrap(),
        &"1"
    );
    // The alternate sees its own write...
    assert_eq!(
        e.graph_stat_at(&town(), &StatKey::new("stat"), &alt, t_two.turn, t_two.tick)
            .unwrap(),
        &"2"
    );
    // ...and inherits the trunk's value before it.
    assert_eq!(
        e.graph_stat_at(&town(), &StatKey::new("stat"), &alt, t_one.turn, t_one.tick)
            .unwrap(),
        &"1"
    );
}

#[test]
fn writing_in_the_past_is_rejected_with_both_endpoints() {
    let mut e = engine();
    e.add_graph(town(), GraphKind::Directed).unwrap();
    e.set_turn(Turn(3)).unwrap();
    e.set_graph_stat(town(), StatKey::new("k"), Some("v")).unwrap();
    // Travel back and try to write at the frontier check.
    e.set_turn(Turn(1)).unwrap();
    let err = e.set_graph_stat(town(), StatKey::new("k"), Some("w")).unwrap_err();
    match err {
        EngineError::OutOfTimeline(e) => {
            assert_eq!(e.reason, OutOfTimelineReason::NotAtFrontier);
            assert_eq!(e.branch_from, Branch::trunk());
            assert_eq!(e.turn_from, Turn(1));
        }
        other => panic!("expected OutOfTimeline, got {other:?}"),
    }
}

#[test]
fn turns_before_a_branch_start_are_unreachable() {
    let mut e = engine();
    e.add_graph(town(), GraphKind::Directed).unwrap();
    e.set_turn(Turn(5)).unwrap();
    e.set_graph_stat(town(), StatKey::new("k"), Some("v")).unwrap();
    e.set_branch(Branch::new("alt")).unwrap();
    // "alt" forked at turn 5; turn 2 never existed for it.
    let err = e.set_turn(Turn(2)).unwrap_err();
    assert!(matches!(
        err,
        EngineError::OutOfTimeline(o) if o.reason == OutOfTimelineReason::BeforeBranchStart
    ));
}

#[test]
fn enforce_end_of_time_rejects_deep_future_jumps() {
    let mut e: Engine<&'static str> = Engine::new(
        Box::new(MemoryBackend::new()),
        EngineConfig {
            enforce_end_of_time: true,
            ..EngineConfig::default()
        },
    )
    .unwrap();
    e.add_graph(town(), GraphKind::Directed).unwrap();
    // One turn past the end is the normal way to simulate the next turn.
    e.set_turn(Turn(1)).unwrap();
    let err = e.set_turn(Turn(9)).unwrap_err();
    assert!(matches!(
        err,
        EngineError::OutOfTimeline(o) if o.reason == OutOfTimelineReason::AfterEndOfTime
    ));
}

#[test]
fn forward_context_forbids_backward_travel_and_turn_skips() {
    let mut e = engine();
    e.add_graph(town(), GraphKind::Directed).unwrap();
    e.set_turn(Turn(2)).unwrap();
    e.advancing(|e| {
        assert!(matches!(
            e.set_turn(Turn(1)),
            Err(EngineError::OutOfTimeline(o))
                if o.reason == OutOfTimelineReason::ForwardContextViolated
        ));
        assert!(matches!(
            e.set_turn(Turn(4)),
            Err(EngineError::OutOfTimeline(o))
                if o.reason == OutOfTimelineReason::ForwardContextViolated
        ));
        e.set_turn(Turn(3))
    })
    .unwrap();
    assert_eq!(e.turn(), Turn(3));
}

#[test]
fn observers_hear_every_branch_and_turn_change() {
    let mut e = engine();
    let count = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&count);
    e.connect(move |shift| {
        assert_ne!(
            (&shift.branch_then, shift.turn_then),
            (&shift.branch_now, shift.turn_now),
            "same-time moves must not signal"
        );
        seen.fetch_add(1, Ordering::SeqCst);
    });
    e.add_graph(town(), GraphKind::Directed).unwrap();
    e.set_turn(Turn(1)).unwrap();
    e.set_turn(Turn(2)).unwrap();
    e.set_branch(Branch::new("alt")).unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 3);
}

#[test]
fn universal_stats_live_outside_any_graph() {
    let mut e = engine();
    let t = e.set_universal(StatKey::new("year"), Some("1405")).unwrap();
    assert_eq!(
        e.universal_at(&StatKey::new("year"), &Branch::trunk(), t.turn, t.tick)
            .unwrap(),
        &"1405"
    );
}

#[test]
fn successor_queries_are_time_aware() {
    let mut e = engine();
    e.add_graph(town(), GraphKind::Directed).unwrap();
    for n in ["a", "b", "c"] {
        e.set_node(town(), NodeName::new(n), true).unwrap();
    }
    let t1 = e
        .set_edge(
            town(),
            NodeName::new("a"),
            NodeName::new("b"),
            skein_core::EdgeIdx(0),
            true,
        )
        .unwrap();
    let t2 = e
        .set_edge(
            town(),
            NodeName::new("a"),
            NodeName::new("c"),
            skein_core::EdgeIdx(0),
            true,
        )
        .unwrap();
    let trunk = Branch::trunk();
    let before = e.successors_at(&town(), &NodeName::new("a"), &trunk, t1.turn, t1.tick);
    assert_eq!(before.len(), 1);
    let after = e.successors_at(&town(), &NodeName::new("a"), &trunk, t2.turn, t2.tick);
    assert_eq!(after.len(), 2);
    let preds = e.predecessors_at(&town(), &NodeName::new("b"), &trunk, t2.turn, t2.tick);
    assert!(preds.contains(&NodeName::new("a")));
}

#[test]
fn graph_lifecycle_is_tracked_in_time() {
    let mut e = engine();
    let t_add = e.add_graph(town(), GraphKind::Directed).unwrap();
    assert!(e.graphs_at(&Branch::trunk(), t_add.turn, t_add.tick).contains(&town()));
    let t_del = e.del_graph(&town()).unwrap();
    assert!(!e.graphs_at(&Branch::trunk(), t_del.turn, t_del.tick).contains(&town()));
    // Re-adding under the same name is legal after deletion.
    let t_back = e.add_graph(town(), GraphKind::Directed).unwrap();
    assert!(e
        .graphs_at(&Branch::trunk(), t_back.turn, t_back.tick)
        .contains(&town()));
}
