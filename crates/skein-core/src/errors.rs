// SPDX-License-Identifier: Apache-2.0
//! Error taxonomy for the temporal store.
//!
//! Three families of failure exist and callers genuinely react to them
//! differently, so each is a distinct type rather than a message string:
//!
//! - [`HistoryError`]: a revision-level lookup or write against a
//!   [`WindowDict`](crate::window::WindowDict) failed. Carries whether the
//!   value once existed and was deleted, which read paths use to stop
//!   searching ancestor branches.
//! - [`RetrieveError`]: the cache-level three-way outcome for a missing
//!   fact — deleted, absent from the governing keyframe, or never recorded.
//! - [`OutOfTimelineError`]: a cursor move left the valid range of a
//!   branch. Never recovered internally; it carries both endpoints so the
//!   caller can construct a branch-and-retry.

use thiserror::Error;

use crate::time::{Branch, Tick, Turn};

/// A revision-level failure in a windowed history container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HistoryError {
    /// The requested revision is earlier than everything recorded.
    #[error("revision {0} is before the start of recorded history")]
    BeforeHistory(i64),
    /// The value at the governing revision is a deletion marker.
    #[error("revision {0}: value was set, then deleted")]
    Deleted(i64),
    /// No entry exists at exactly the requested revision.
    #[error("no value recorded at revision {0}")]
    NotRecorded(i64),
    /// An append-only container already has history after this revision.
    #[error("already have history after revision {0}")]
    FutureWrite(i64),
    /// The container holds no history at all.
    #[error("no history")]
    Empty,
}

impl HistoryError {
    /// Whether this error means "existed, then was removed" as opposed to
    /// "never existed."
    #[must_use]
    pub fn deleted(&self) -> bool {
        matches!(self, Self::Deleted(_))
    }
}

/// Why a cache-level retrieval produced no value.
///
/// The three variants are deliberately distinguishable: the surrounding
/// rule engine treats "confirmed deleted" and "confirmed absent at a
/// keyframe" differently from "no information anywhere."
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RetrieveError {
    /// The fact was recorded and then explicitly deleted.
    #[error("set, then deleted")]
    Deleted,
    /// The governing keyframe exists but omits this key: confirmed absent
    /// as of that keyframe.
    #[error("absent from the governing keyframe")]
    NotInKeyframe,
    /// No write and no keyframe mentions this fact anywhere in the branch
    /// lineage.
    #[error("never recorded")]
    Unknown,
}

/// Why a cursor move was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum OutOfTimelineReason {
    /// Destination is before the start of the destination branch.
    BeforeBranchStart,
    /// Destination is past the committed end of time and the engine is
    /// configured to enforce it.
    AfterEndOfTime,
    /// A write was attempted somewhere other than the frontier of recorded
    /// history.
    NotAtFrontier,
    /// Backward movement or a turn skip inside a forward-only context.
    ForwardContextViolated,
    /// The time has already been claimed by the active plan.
    PlannedTimeOccupied,
}

/// A cursor move left the valid range of a branch.
///
/// Carries both endpoints of the attempted move; the surrounding system's
/// documented recovery is to fork a new branch at the source coordinate and
/// retry, which needs every field here.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error(
    "cannot move from ({branch_from}, {turn_from}, {tick_from}) \
     to ({branch_to}, {turn_to}, {tick_to}): {reason:?}"
)]
pub struct OutOfTimelineError {
    /// Why the move was rejected.
    pub reason: OutOfTimelineReason,
    /// Branch the cursor was on.
    pub branch_from: Branch,
    /// Turn the cursor was on.
    pub turn_from: Turn,
    /// Tick the cursor was on.
    pub tick_from: Tick,
    /// Branch the move targeted.
    pub branch_to: Branch,
    /// Turn the move targeted.
    pub turn_to: Turn,
    /// Tick the move targeted.
    pub tick_to: Tick,
}

/// Branch registry failures: malformed forks and unknown branches.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimelineError {
    /// Tried to fork a branch that already exists.
    #[error("branch {0:?} already exists")]
    BranchExists(String),
    /// Referenced a branch that was never created.
    #[error("no such branch: {0:?}")]
    NoSuchBranch(String),
}

/// Top-level engine failures.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A cursor move was rejected; see [`OutOfTimelineError`].
    #[error(transparent)]
    OutOfTimeline(#[from] OutOfTimelineError),
    /// A branch operation failed.
    #[error(transparent)]
    Timeline(#[from] TimelineError),
    /// A revision-level write was rejected.
    #[error(transparent)]
    History(#[from] HistoryError),
    /// A nested planning context was opened.
    #[error("already planning")]
    AlreadyPlanning,
    /// A branch change was attempted inside a planning context.
    #[error("cannot change branches while planning")]
    BranchDuringPlanning,
    /// A nested forward context was opened.
    #[error("already advancing")]
    AlreadyAdvancing,
    /// A nested batch context was opened.
    #[error("already in a batch")]
    AlreadyBatching,
    /// `unload` was called but no keyframe exists anywhere, so nothing can
    /// be safely discarded.
    #[error("cannot unload: no keyframe exists")]
    NoKeyframe,
    /// Referenced a graph that was never created.
    #[error("no such graph: {0}")]
    NoSuchGraph(crate::ident::GraphName),
    /// A graph with this name already exists.
    #[error("graph already exists: {0}")]
    GraphExists(crate::ident::GraphName),
    /// The storage backend failed.
    #[error("storage: {0}")]
    Storage(#[from] crate::storage::StorageError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deleted_flag_distinguishes_tombstones() {
        assert!(HistoryError::Deleted(3).deleted());
        assert!(!HistoryError::BeforeHistory(3).deleted());
        assert!(!HistoryError::Empty.deleted());
    }

    #[test]
    fn out_of_timeline_reports_both_endpoints() {
        let err = OutOfTimelineError {
            reason: OutOfTimelineReason::BeforeBranchStart,
            branch_from: Branch::trunk(),
            turn_from: Turn(5),
            tick_from: Tick(0),
            branch_to: Branch::new("alt"),
            turn_to: Turn(2),
            tick_to: Tick(0),
        };
        let msg = err.to_string();
        assert!(msg.contains("trunk"));
        assert!(msg.contains("alt"));
        assert!(msg.contains("BeforeBranchStart"));
    }
}
