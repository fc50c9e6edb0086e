// SPDX-License-Identifier: Apache-2.0
//! skein-core: versioned, branching temporal graph store.
//!
//! Many directed graphs ("characters") evolve over a branching timeline of
//! `(branch, turn, tick)` coordinates. Any attribute of any graph, node,
//! or edge is resolvable at any time coordinate in amortized near-constant
//! time; periodic keyframe snapshots plus delta replay bound both memory
//! and how far back a read must search; plans (tentative future edits) are
//! revocable as a unit without corrupting committed history.
//!
//! The layering, leaves first: [`WindowDict`](window::WindowDict) is the
//! seek-optimized revision map; [`Cache`](cache::Cache) builds the
//! branch-aware multi-index store on top of it; [`NodesCache`], [`EdgesCache`],
//! and [`EntitylessCache`] specialize it for existence and global facts;
//! [`Engine`] orchestrates the time cursor, plans, keyframes, deltas, and
//! windowed loading over a [`StorageBackend`].
#![forbid(unsafe_code)]
#![deny(missing_docs, rust_2018_idioms, unused_must_use)]
#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::dbg_macro,
    clippy::print_stdout,
    clippy::print_stderr
)]
#![allow(
    clippy::must_use_candidate,
    clippy::return_self_not_must_use,
    clippy::missing_const_for_fn,
    clippy::redundant_pub_crate,
    clippy::module_name_repetitions,
    clippy::use_self,
    clippy::cognitive_complexity,
    clippy::type_complexity,
    clippy::redundant_clone,
    clippy::needless_collect,
    clippy::option_if_let_else,
    clippy::significant_drop_tightening,
    clippy::doc_markdown,
    clippy::too_long_first_doc_paragraph,
    clippy::unreadable_literal,
    clippy::trivially_copy_pass_by_ref,
    clippy::too_many_lines,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::similar_names,
    clippy::many_single_char_names,
    clippy::manual_let_else,
    clippy::needless_pass_by_value,
    clippy::too_many_arguments
)]

pub mod arrange;
pub mod cache;
pub mod delta;
pub mod edges;
pub mod entityless;
pub mod errors;
pub mod ident;
pub mod keycache;
pub mod keyframe;
pub mod nodes;
pub mod shared;
pub mod storage;
pub mod time;
pub mod turns;
pub mod window;

mod engine;

// Re-exports for the stable public API.
/// Background pre-warming of load windows.
pub use arrange::CacheArranger;
/// The generic branch-and-time-aware fact store.
pub use cache::{Cache, JournalRow, Retrieved, StoreParams};
/// Net-change deltas between two times.
pub use delta::{GraphChange, GraphDelta, WorldDelta};
/// Edge existence with successor/predecessor indices.
pub use edges::EdgesCache;
/// World-scoped facts.
pub use entityless::EntitylessCache;
/// The error taxonomy.
pub use errors::{
    EngineError, HistoryError, OutOfTimelineError, OutOfTimelineReason, RetrieveError,
    TimelineError,
};
/// Identifier newtypes.
pub use ident::{EdgeIdx, EdgeRef, GraphKind, GraphName, NodeName, PlanId, StatKey};
/// Keycache consultation mode.
pub use keycache::KeycacheMode;
/// Keyframe payloads and the schedule of keyframe times.
pub use keyframe::{GraphKeyframe, KeyframeSchedule};
/// Node existence.
pub use nodes::NodesCache;
/// The world lock.
pub use shared::SharedEngine;
/// The persistence boundary.
pub use storage::{
    EdgeRow, EdgeValRow, FactKind, GraphRow, GraphValRow, KeyframeRow, LoadWindow, NodeRow,
    NodeValRow, StorageBackend, StorageError, UniversalRow,
};
/// Time coordinates and the branch registry.
pub use time::{Branch, BranchGraph, BranchRecord, Rev, StopTime, Tick, Time, Turn};
/// Two-level turn → tick containers.
pub use turns::{SettingsTurnDict, TurnDict};
/// The seek-optimized revision map.
pub use window::{Direction, FuturistWindowDict, WindowDict};

/// The orchestrating engine and its configuration.
pub use engine::{Engine, EngineConfig, TimeShift, WorldValue};
