// SPDX-License-Identifier: Apache-2.0
//! The world lock and the background arranger.
#![allow(clippy::unwrap_used, clippy::panic)]

use skein_core::{
    Branch, CacheArranger, Engine, EngineConfig, GraphKind, GraphName, SharedEngine, StatKey, Time,
    Turn,
};
use skein_storage::MemoryBackend;

fn shared() -> SharedEngine<&'static str> {
    let engine: Engine<&'static str> =
        Engine::new(Box::new(MemoryBackend::new()), EngineConfig::default()).unwrap();
    SharedEngine::new(engine)
}

#[test]
fn many_threads_read_while_one_writes() {
    let world = shared();
    let town = GraphName::new("town");
    world.write(|e| {
        e.add_graph(town.clone(), GraphKind::Directed)?;
        e.set_graph_stat(town.clone(), StatKey::new("weather"), Some("rain"))
            .map(|_| ())
    })
    .unwrap();
    let readers: Vec<_> = (0..4)
        .map(|_| {
            let world = world.clone();
            let town = town.clone();
            std::thread::spawn(move || {
                world.read(|e| {
                    let t = e.time();
                    *e.graph_stat_at(&town, &StatKey::new("weather"), &t.branch, t.turn, t.tick)
                        .unwrap()
                })
            })
        })
        .collect();
    for r in readers {
        assert_eq!(r.join().unwrap(), "rain");
    }
}

#[test]
fn arranger_prewarm_is_correctness_neutral() {
    let world = shared();
    let town = GraphName::new("town");
    world.write(|e| {
        e.add_graph(town.clone(), GraphKind::Directed)?;
        e.set_turn(Turn(5))?;
        e.set_graph_stat(town.clone(), StatKey::new("k"), Some("v"))?;
        e.snap_keyframe(true)?;
        e.unload()
    })
    .unwrap();
    let arranger = CacheArranger::spawn(world.clone());
    assert!(arranger.request(Time::new(Branch::trunk(), Turn(1), skein_core::Tick(0))));
    // Dropping the handle joins the worker after it drains the request.
    drop(arranger);
    // Whether or not the warm-up beat us here, the read resolves.
    let got = world.read(|e| {
        e.graph_stat_at(&town, &StatKey::new("k"), &Branch::trunk(), Turn(6), skein_core::Tick(0))
            .map(|v| *v)
    });
    assert_eq!(got.unwrap(), "v");
}
