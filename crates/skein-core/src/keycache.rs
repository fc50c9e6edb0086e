// SPDX-License-Identifier: Apache-2.0
//! Bounded memoization of "which keys exist here at this time" sets.
//!
//! One instance backs the per-entity key sets of every cache, and the
//! successor/destination mirrors of the edges cache. Memoized sets are
//! shared (`Arc`) frozen sets; the structure is bounded by an LRU so mass
//! time travel cannot grow it without limit.
//!
//! The forward-optimized path is the important part: when time advances
//! step by step within one branch (the common simulation pattern), the set
//! at the new time is derived from the nearest memoized set at or before it
//! plus the adds/deletes that occurred in between, rather than rebuilt from
//! a keyframe. Arbitrary jumps fall back to a full rebuild, which the
//! supplied closure performs by scanning from the nearest keyframe
//! boundary.

use std::collections::{BTreeSet, VecDeque};
use std::hash::Hash;
use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::time::{Tick, Turn};
use crate::turns::SettingsTurnDict;
use crate::window::Direction;

/// Default bound on memoized `(entity, branch, turn, tick)` sets.
pub const KEYCACHE_MAXSIZE: usize = 1024;

/// How the memo is consulted for one operation.
#[derive(Clone, Copy, Debug)]
pub struct KeycacheMode {
    /// Whether the memo may be read and written at all. Bulk loading turns
    /// it off and recomputes on demand afterwards.
    pub enabled: bool,
    /// Whether time is known to be advancing monotonically, enabling the
    /// incremental copy-forward path.
    pub forward: bool,
}

impl KeycacheMode {
    /// Memo on, no forward assumption.
    #[must_use]
    pub fn plain() -> Self {
        Self {
            enabled: true,
            forward: false,
        }
    }
}

/// Computes `(added, deleted)` key-set changes since an optional same-branch
/// stop time; with no stop time, `added` is the complete key set.
pub(crate) type AddsDels<S> = (BTreeSet<S>, BTreeSet<S>);

/// A bounded memo of frozen key sets, indexed by an owner key (entity +
/// branch) and a time coordinate.
#[derive(Debug)]
pub(crate) struct KeySetCache<I, S> {
    memo: FxHashMap<I, SettingsTurnDict<Arc<BTreeSet<S>>>>,
    lru: VecDeque<(I, Turn, Tick)>,
    lru_members: FxHashSet<(I, Turn, Tick)>,
    maxsize: usize,
}

impl<I, S> KeySetCache<I, S>
where
    I: Clone + Eq + Hash,
    S: Clone + Ord,
{
    pub(crate) fn new(maxsize: usize) -> Self {
        Self {
            memo: FxHashMap::default(),
            lru: VecDeque::new(),
            lru_members: FxHashSet::default(),
            maxsize: maxsize.max(1),
        }
    }

    /// Returns the key set in effect at `(turn, tick)`, building and
    /// memoizing it when absent.
    ///
    /// `adds_dels` receives the stop time to scan back to: `Some` of a
    /// same-branch coordinate on the incremental path, `None` for a full
    /// rebuild from the nearest keyframe boundary.
    pub(crate) fn get_or_build(
        &mut self,
        ikey: &I,
        turn: Turn,
        tick: Tick,
        forward: bool,
        adds_dels: impl FnOnce(Option<(Turn, Tick)>) -> AddsDels<S>,
    ) -> Arc<BTreeSet<S>> {
        self.touch(ikey, turn, tick);
        if let Some(entry) = self.memo.get(ikey) {
            if let Some(set) = entry.retrieve_exact(turn, tick) {
                return Arc::clone(set);
            }
            if forward {
                if let Some((pt, pk, base)) = entry.latest_at(turn, tick) {
                    let mut set = (**base).clone();
                    let (added, deleted) = adds_dels(Some((pt, pk)));
                    set.extend(added);
                    for d in &deleted {
                        set.remove(d);
                    }
                    let arc = Arc::new(set);
                    if let Some(entry) = self.memo.get_mut(ikey) {
                        entry.store_at(turn, tick, Arc::clone(&arc));
                    }
                    return arc;
                }
            }
        }
        let (added, _) = adds_dels(None);
        let arc = Arc::new(added);
        self.memo
            .entry(ikey.clone())
            .or_default()
            .store_at(turn, tick, Arc::clone(&arc));
        arc
    }

    /// Records that `item` became present or absent at `(turn, tick)`,
    /// deriving the new set from the one in effect just before the write.
    pub(crate) fn note_write(
        &mut self,
        ikey: &I,
        turn: Turn,
        tick: Tick,
        item: &S,
        present: bool,
        forward: bool,
        adds_dels: impl FnOnce(Option<(Turn, Tick)>) -> AddsDels<S>,
    ) {
        let cur = self.get_or_build(ikey, turn, tick, forward, adds_dels);
        let mut set = (*cur).clone();
        if present {
            set.insert(item.clone());
        } else {
            set.remove(item);
        }
        if let Some(entry) = self.memo.get_mut(ikey) {
            entry.store_at(turn, tick, Arc::new(set));
        }
    }

    /// Discards the memo for `turn` and everything after it. Editing the
    /// past invalidates every memoized set downstream of the edit.
    pub(crate) fn invalidate_from_turn(&mut self, ikey: &I, turn: Turn) {
        let empty = if let Some(entry) = self.memo.get_mut(ikey) {
            entry.truncate_from_turn(turn);
            entry.is_empty()
        } else {
            return;
        };
        if empty {
            self.memo.remove(ikey);
        }
    }

    /// Rollback form used by plan deletion: drops the memo at exactly
    /// `(turn, tick)` and everything after it, keeping earlier memos of the
    /// same turn.
    pub(crate) fn rollback_from(&mut self, ikey: &I, turn: Turn, tick: Tick) {
        let empty = if let Some(entry) = self.memo.get_mut(ikey) {
            let _ = entry.remove_exact(turn, tick);
            entry.truncate(turn, tick, Direction::Forward);
            entry.is_empty()
        } else {
            return;
        };
        if empty {
            self.memo.remove(ikey);
        }
    }

    /// Drops every memo whose owner key matches `pred`. Used when a branch
    /// is truncated or unloaded; recomputation is always safe.
    pub(crate) fn remove_where(&mut self, pred: impl Fn(&I) -> bool) {
        self.memo.retain(|k, _| !pred(k));
        let memo = &self.memo;
        self.lru.retain(|(k, _, _)| memo.contains_key(k));
        self.lru_members.retain(|(k, _, _)| memo.contains_key(k));
    }

    fn touch(&mut self, ikey: &I, turn: Turn, tick: Tick) {
        let full = (ikey.clone(), turn, tick);
        if self.lru_members.contains(&full) {
            return;
        }
        while self.lru.len() >= self.maxsize {
            let Some((evicted, etn, etk)) = self.lru.pop_front() else {
                break;
            };
            self.lru_members.remove(&(evicted.clone(), etn, etk));
            if let Some(entry) = self.memo.get_mut(&evicted) {
                let _ = entry.remove_exact(etn, etk);
                if entry.is_empty() {
                    self.memo.remove(&evicted);
                }
            }
        }
        self.lru.push_back(full.clone());
        self.lru_members.insert(full);
    }
}
