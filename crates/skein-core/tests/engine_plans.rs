// SPDX-License-Identifier: Apache-2.0
//! Plans: tentative futures, contradiction rollback, and copying across
//! branch forks.
#![allow(clippy::unwrap_used, clippy::panic)]

use skein_core::{
    Branch, EdgeIdx, Engine, EngineConfig, GraphKind, GraphName, NodeName, RetrieveError, StatKey,
    Turn,
};
use skein_storage::MemoryBackend;

fn engine() -> Engine<&'static str> {
    Engine::new(Box::new(MemoryBackend::new()), EngineConfig::default()).unwrap()
}

fn town() -> GraphName {
    GraphName::new("town")
}

#[test]
fn planned_writes_read_back_until_revoked() {
    let mut e = engine();
    e.add_graph(town(), GraphKind::Directed).unwrap();
    let (plan, planned_time) = e
        .plan(|e| {
            e.set_turn(Turn(5))?;
            e.set_graph_stat(town(), StatKey::new("mood"), Some("hopeful"))
        })
        .unwrap();
    let trunk = Branch::trunk();
    assert_eq!(
        e.graph_stat_at(
            &town(),
            &StatKey::new("mood"),
            &trunk,
            planned_time.turn,
            planned_time.tick
        )
        .unwrap(),
        &"hopeful"
    );
    // Revoking the plan removes its whole future; what remains at that
    // time is the creation keyframe, which never knew the stat.
    e.set_turn(Turn(0)).unwrap();
    e.delete_plan(plan).unwrap();
    assert_eq!(
        e.graph_stat_at(
            &town(),
            &StatKey::new("mood"),
            &trunk,
            planned_time.turn,
            planned_time.tick
        )
        .unwrap_err(),
        RetrieveError::NotInKeyframe
    );
}

#[test]
fn contradicting_write_deletes_the_stale_plan() {
    let mut e = engine();
    e.add_graph(town(), GraphKind::Directed).unwrap();
    // Plan a value at turn 5.
    let (_, planned_time) = e
        .plan(|e| {
            e.set_turn(Turn(5))?;
            e.set_graph_stat(town(), StatKey::new("k"), Some("X"))
        })
        .unwrap();
    // Back at turn 3, the player changes their mind.
    e.set_turn(Turn(3)).unwrap();
    let committed = e.set_graph_stat(town(), StatKey::new("k"), Some("Y")).unwrap();
    let trunk = Branch::trunk();
    // The plan's future entry at turn 5 is gone before Y lands; what
    // governs turn 5 now is Y from turn 3.
    assert_eq!(
        e.graph_stat_at(
            &town(),
            &StatKey::new("k"),
            &trunk,
            planned_time.turn,
            planned_time.tick
        )
        .unwrap(),
        &"Y"
    );
    assert_eq!(
        e.graph_stat_at(&town(), &StatKey::new("k"), &trunk, committed.turn, committed.tick)
            .unwrap(),
        &"Y"
    );
}

#[test]
fn agreeing_write_leaves_the_plan_alone() {
    let mut e = engine();
    e.add_graph(town(), GraphKind::Directed).unwrap();
    let (_, planned_time) = e
        .plan(|e| {
            e.set_turn(Turn(5))?;
            e.set_graph_stat(town(), StatKey::new("k"), Some("same"))
        })
        .unwrap();
    e.set_turn(Turn(3)).unwrap();
    // An agreeing value is no contradiction, so the plan is not deleted —
    // and with the planned future still in place, writing behind it is a
    // history-ordering error rather than a silent overwrite.
    let err = e
        .set_graph_stat(town(), StatKey::new("k"), Some("same"))
        .unwrap_err();
    assert!(matches!(err, skein_core::EngineError::History(_)));
    let trunk = Branch::trunk();
    assert_eq!(
        e.graph_stat_at(
            &town(),
            &StatKey::new("k"),
            &trunk,
            planned_time.turn,
            planned_time.tick
        )
        .unwrap(),
        &"same"
    );
}

#[test]
fn deleting_a_node_invalidates_planned_edges_touching_it() {
    let mut e = engine();
    e.add_graph(town(), GraphKind::Directed).unwrap();
    e.set_node(town(), NodeName::new("a"), true).unwrap();
    e.set_node(town(), NodeName::new("b"), true).unwrap();
    // A plan asserts an edge a->b in the future.
    let (_, planned_time) = e
        .plan(|e| {
            e.set_turn(Turn(5))?;
            e.set_edge(town(), NodeName::new("a"), NodeName::new("b"), EdgeIdx(0), true)
        })
        .unwrap();
    let trunk = Branch::trunk();
    assert!(e.edge_exists_at(
        &town(),
        &NodeName::new("a"),
        &NodeName::new("b"),
        EdgeIdx(0),
        &trunk,
        planned_time.turn,
        planned_time.tick,
    ));
    // Deleting the node at turn 2 contradicts the planned edge; the plan
    // goes before the deletion commits.
    e.set_turn(Turn(2)).unwrap();
    e.set_node(town(), NodeName::new("a"), false).unwrap();
    assert!(!e.edge_exists_at(
        &town(),
        &NodeName::new("a"),
        &NodeName::new("b"),
        EdgeIdx(0),
        &trunk,
        planned_time.turn,
        planned_time.tick,
    ));
}

#[test]
fn plans_active_at_a_fork_are_copied_into_the_child() {
    let mut e = engine();
    e.add_graph(town(), GraphKind::Directed).unwrap();
    let (_, planned_time) = e
        .plan(|e| {
            e.set_turn(Turn(5))?;
            e.set_graph_stat(town(), StatKey::new("prophecy"), Some("fulfilled"))
        })
        .unwrap();
    e.set_turn(Turn(1)).unwrap();
    e.set_branch(Branch::new("alt")).unwrap();
    let alt = Branch::new("alt");
    // The child inherits the pending portion of the plan under a fresh id.
    assert_eq!(
        e.graph_stat_at(
            &town(),
            &StatKey::new("prophecy"),
            &alt,
            planned_time.turn,
            planned_time.tick
        )
        .unwrap(),
        &"fulfilled"
    );
    // Contradicting it inside the child deletes only the child's copy.
    e.set_turn(Turn(3)).unwrap();
    e.set_graph_stat(town(), StatKey::new("prophecy"), Some("broken")).unwrap();
    assert_eq!(
        e.graph_stat_at(
            &town(),
            &StatKey::new("prophecy"),
            &alt,
            planned_time.turn,
            planned_time.tick
        )
        .unwrap(),
        &"broken"
    );
    assert_eq!(
        e.graph_stat_at(
            &town(),
            &StatKey::new("prophecy"),
            &Branch::trunk(),
            planned_time.turn,
            planned_time.tick
        )
        .unwrap(),
        &"fulfilled"
    );
}

#[test]
fn nested_plans_are_rejected() {
    let mut e = engine();
    e.add_graph(town(), GraphKind::Directed).unwrap();
    let err = e
        .plan(|e| e.plan(|_| Ok(())).map(|_| ()))
        .unwrap_err();
    assert!(matches!(err, skein_core::EngineError::AlreadyPlanning));
}

#[test]
fn branch_changes_inside_plans_are_rejected() {
    let mut e = engine();
    e.add_graph(town(), GraphKind::Directed).unwrap();
    let err = e.plan(|e| e.set_branch(Branch::new("alt"))).unwrap_err();
    assert!(matches!(
        err,
        skein_core::EngineError::BranchDuringPlanning
    ));
}
