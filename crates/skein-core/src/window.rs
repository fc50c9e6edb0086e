// SPDX-License-Identifier: Apache-2.0
//! `WindowDict`: the time-indexed container underlying every cache index.
//!
//! A `WindowDict` maps revision numbers to values and answers "what value is
//! in effect at revision `r`?" — the value stored at the largest revision at
//! or before `r`. It is split into two stacks around a movable cursor:
//!
//! - `past`: entries at or before the cursor, ascending (top = most recent).
//! - `future`: entries after the cursor, descending (top = soonest).
//!
//! Repeated lookups at the same or neighboring revisions move only a few
//! entries between the stacks, so sequential access is amortized O(1); the
//! binary [`search`](WindowDict::search) variant serves random access and
//! repositions the cursor so that subsequent sequential access stays fast.
//!
//! Every entry lives in exactly one stack and the concatenation
//! `past ++ reverse(future)` is always globally ascending; all read-only
//! queries binary-search the stacks without touching the cursor, so shared
//! readers never contend.

use std::fmt;

use crate::errors::HistoryError;
use crate::time::Rev;

/// Which side of a revision [`WindowDict::truncate`] discards.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Direction {
    /// Discard everything strictly after the revision.
    Forward,
    /// Discard everything strictly before the revision; an entry at exactly
    /// the revision is kept as the new boundary.
    Backward,
}

/// A sorted, append-optimized map from revision to value with
/// "most recent at or before" lookup semantics.
#[derive(Clone, PartialEq, Eq)]
pub struct WindowDict<R, V> {
    /// Entries at or before the cursor, ascending.
    past: Vec<(R, V)>,
    /// Entries after the cursor, descending (last element is the soonest).
    future: Vec<(R, V)>,
}

impl<R: fmt::Debug, V: fmt::Debug> fmt::Debug for WindowDict<R, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.past.iter().map(|(r, v)| (r, v)))
            .entries(self.future.iter().rev().map(|(r, v)| (r, v)))
            .finish()
    }
}

impl<R, V> Default for WindowDict<R, V> {
    fn default() -> Self {
        Self {
            past: Vec::new(),
            future: Vec::new(),
        }
    }
}

impl<R: Rev, V> FromIterator<(R, V)> for WindowDict<R, V> {
    fn from_iter<T: IntoIterator<Item = (R, V)>>(iter: T) -> Self {
        let mut past: Vec<(R, V)> = iter.into_iter().collect();
        past.sort_by_key(|(r, _)| *r);
        Self {
            past,
            future: Vec::new(),
        }
    }
}

impl<R: Rev, V> WindowDict<R, V> {
    /// Creates an empty dict.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of recorded revisions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.past.len() + self.future.len()
    }

    /// Whether no revision is recorded. An empty dict fails every read.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.past.is_empty() && self.future.is_empty()
    }

    /// The earliest recorded revision.
    #[must_use]
    pub fn beginning(&self) -> Option<R> {
        self.past
            .first()
            .or_else(|| self.future.last())
            .map(|(r, _)| *r)
    }

    /// The latest recorded revision.
    #[must_use]
    pub fn end(&self) -> Option<R> {
        self.future
            .first()
            .or_else(|| self.past.last())
            .map(|(r, _)| *r)
    }

    /// The earliest recorded entry, independent of the cursor.
    #[must_use]
    pub fn earliest(&self) -> Option<(R, &V)> {
        self.past
            .first()
            .or_else(|| self.future.last())
            .map(|(r, v)| (*r, v))
    }

    /// The latest recorded entry, independent of the cursor.
    #[must_use]
    pub fn latest(&self) -> Option<(R, &V)> {
        self.future
            .first()
            .or_else(|| self.past.last())
            .map(|(r, v)| (*r, v))
    }

    /// Whether a lookup at `rev` can succeed, i.e. `rev` is at or after the
    /// earliest recorded revision.
    #[must_use]
    pub fn rev_gettable(&self, rev: R) -> bool {
        self.beginning().is_some_and(|b| rev >= b)
    }

    /// Whether an entry exists at exactly `rev`.
    #[must_use]
    pub fn contains(&self, rev: R) -> bool {
        self.past.binary_search_by_key(&rev, |(r, _)| *r).is_ok()
            || self
                .future
                .binary_search_by(|(r, _)| r.cmp(&rev).reverse())
                .is_ok()
    }

    /// The entry in effect at `rev`: the one with the largest revision at or
    /// before `rev`. Does not move the cursor.
    #[must_use]
    pub fn entry_at(&self, rev: R) -> Option<(R, &V)> {
        // Any future entry ≤ rev is later than every past entry.
        let fi = self.future.partition_point(|(r, _)| *r > rev);
        if let Some((r, v)) = self.future.get(fi) {
            return Some((*r, v));
        }
        let pi = self.past.partition_point(|(r, _)| *r <= rev);
        pi.checked_sub(1).map(|i| {
            let (r, v) = &self.past[i];
            (*r, v)
        })
    }

    /// The value in effect at `rev`, without moving the cursor.
    pub fn value_at(&self, rev: R) -> Result<&V, HistoryError> {
        self.entry_at(rev)
            .map(|(_, v)| v)
            .ok_or(HistoryError::BeforeHistory(rev.index()))
    }

    /// The value stored at exactly `rev`, if any.
    #[must_use]
    pub fn exact(&self, rev: R) -> Option<&V> {
        match self.past.binary_search_by_key(&rev, |(r, _)| *r) {
            Ok(i) => Some(&self.past[i].1),
            Err(_) => self
                .future
                .binary_search_by(|(r, _)| r.cmp(&rev).reverse())
                .ok()
                .map(|i| &self.future[i].1),
        }
    }

    /// Mutable access to the value stored at exactly `rev`, if any.
    #[must_use]
    pub fn exact_mut(&mut self, rev: R) -> Option<&mut V> {
        if let Ok(i) = self.past.binary_search_by_key(&rev, |(r, _)| *r) {
            return self.past.get_mut(i).map(|(_, v)| v);
        }
        if let Ok(i) = self
            .future
            .binary_search_by(|(r, _)| r.cmp(&rev).reverse())
        {
            return self.future.get_mut(i).map(|(_, v)| v);
        }
        None
    }

    /// The latest recorded revision at or before `rev`.
    #[must_use]
    pub fn rev_before(&self, rev: R) -> Option<R> {
        self.entry_at(rev).map(|(r, _)| r)
    }

    /// The earliest recorded revision strictly after `rev`.
    #[must_use]
    pub fn rev_after(&self, rev: R) -> Option<R> {
        let pi = self.past.partition_point(|(r, _)| *r <= rev);
        if let Some((r, _)) = self.past.get(pi) {
            return Some(*r);
        }
        let fi = self.future.partition_point(|(r, _)| *r > rev);
        fi.checked_sub(1).map(|i| self.future[i].0)
    }

    /// Repositions the cursor so that every past entry is at or before
    /// `rev` and every future entry is after it.
    ///
    /// Amortized O(1) across sequentially increasing or decreasing
    /// revisions; each entry crosses the cursor at most once per direction
    /// change.
    pub fn seek(&mut self, rev: R) {
        while self.future.last().is_some_and(|(r, _)| *r <= rev) {
            if let Some(e) = self.future.pop() {
                self.past.push(e);
            }
        }
        while self.past.last().is_some_and(|(r, _)| *r > rev) {
            if let Some(e) = self.past.pop() {
                self.future.push(e);
            }
        }
    }

    /// The value in effect at `rev`, seeking the cursor there.
    ///
    /// # Errors
    ///
    /// [`HistoryError::BeforeHistory`] when `rev` is earlier than everything
    /// recorded.
    pub fn get(&mut self, rev: R) -> Result<&V, HistoryError> {
        self.seek(rev);
        self.past
            .last()
            .map(|(_, v)| v)
            .ok_or(HistoryError::BeforeHistory(rev.index()))
    }

    /// Binary-search equivalent of [`get`](Self::get) for random access:
    /// repositions the cursor in O(log n) instead of walking entries one at
    /// a time, so a long jump does not pay a linear move.
    pub fn search(&mut self, rev: R) -> Result<&V, HistoryError> {
        let fi = self.future.partition_point(|(r, _)| *r > rev);
        if fi < self.future.len() {
            let moved = self.future.split_off(fi);
            self.past.extend(moved.into_iter().rev());
        } else {
            let pi = self.past.partition_point(|(r, _)| *r <= rev);
            if pi < self.past.len() {
                let moved = self.past.split_off(pi);
                self.future.extend(moved.into_iter().rev());
            }
        }
        self.past
            .last()
            .map(|(_, v)| v)
            .ok_or(HistoryError::BeforeHistory(rev.index()))
    }

    /// Inserts or overwrites the value at `rev`.
    pub fn set(&mut self, rev: R, value: V) {
        self.seek(rev);
        if let Some((r, v)) = self.past.last_mut() {
            if *r == rev {
                *v = value;
                return;
            }
        }
        self.past.push((rev, value));
    }

    /// Removes the entry at exactly `rev`.
    ///
    /// # Errors
    ///
    /// [`HistoryError::Empty`] on an empty dict,
    /// [`HistoryError::NotRecorded`] when no entry exists at exactly `rev`.
    pub fn delete(&mut self, rev: R) -> Result<(), HistoryError> {
        if self.is_empty() {
            return Err(HistoryError::Empty);
        }
        self.seek(rev);
        if self.past.last().is_some_and(|(r, _)| *r == rev) {
            self.past.pop();
            Ok(())
        } else {
            Err(HistoryError::NotRecorded(rev.index()))
        }
    }

    /// Irreversibly discards entries on one side of `rev`.
    ///
    /// `Forward` drops everything strictly after `rev`; `Backward` drops
    /// everything strictly before it, keeping an entry at exactly `rev` as
    /// the boundary.
    pub fn truncate(&mut self, rev: R, direction: Direction) {
        self.seek(rev);
        match direction {
            Direction::Forward => self.future.clear(),
            Direction::Backward => {
                if self.past.last().is_some_and(|(r, _)| *r == rev) {
                    // Keep only the boundary entry.
                    self.past.drain(..self.past.len() - 1);
                } else {
                    self.past.clear();
                }
            }
        }
    }

    /// Read-only view of everything at or before `rev`, iterating
    /// reverse-chronologically (nearest first).
    pub fn past(&mut self, rev: R) -> PastView<'_, R, V> {
        self.seek(rev);
        PastView(&self.past)
    }

    /// Read-only view of everything strictly after `rev`, iterating
    /// chronologically.
    pub fn future(&mut self, rev: R) -> FutureView<'_, R, V> {
        self.seek(rev);
        FutureView(&self.future)
    }

    /// All entries in ascending revision order, independent of the cursor.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = (R, &V)> + '_ {
        self.past
            .iter()
            .chain(self.future.iter().rev())
            .map(|(r, v)| (*r, v))
    }

    /// All recorded revisions in ascending order.
    pub fn revs(&self) -> impl DoubleEndedIterator<Item = R> + '_ {
        self.iter().map(|(r, _)| r)
    }

    /// Entries strictly after `rev`, ascending, without moving the cursor.
    pub fn iter_after(&self, rev: R) -> impl Iterator<Item = (R, &V)> + '_ {
        let pi = self.past.partition_point(|(r, _)| *r <= rev);
        let fi = self.future.partition_point(|(r, _)| *r > rev);
        self.past[pi..]
            .iter()
            .chain(self.future[..fi].iter().rev())
            .map(|(r, v)| (*r, v))
    }

    /// Entries at or before `rev`, ascending, without moving the cursor.
    pub fn iter_until(&self, rev: R) -> impl Iterator<Item = (R, &V)> + '_ {
        let pi = self.past.partition_point(|(r, _)| *r <= rev);
        let fi = self.future.partition_point(|(r, _)| *r > rev);
        self.past[..pi]
            .iter()
            .chain(self.future[fi..].iter().rev())
            .map(|(r, v)| (*r, v))
    }

    /// Entries in the range between `from` and `to`.
    ///
    /// With `from <= to`, yields ascending over `[from, to)`; with
    /// `from > to`, yields descending over `(to, from]` — like slicing with
    /// a start greater than the stop.
    pub fn range(&self, from: R, to: R) -> impl Iterator<Item = (R, &V)> + '_ {
        let ascending = from <= to;
        let (lo, hi, lo_incl, hi_incl) = if ascending {
            (from, to, true, false)
        } else {
            (to, from, false, true)
        };
        let p_lo = if lo_incl {
            self.past.partition_point(|(r, _)| *r < lo)
        } else {
            self.past.partition_point(|(r, _)| *r <= lo)
        };
        let p_hi = if hi_incl {
            self.past.partition_point(|(r, _)| *r <= hi)
        } else {
            self.past.partition_point(|(r, _)| *r < hi)
        };
        let f_start = if hi_incl {
            self.future.partition_point(|(r, _)| *r > hi)
        } else {
            self.future.partition_point(|(r, _)| *r >= hi)
        };
        let f_end = if lo_incl {
            self.future.partition_point(|(r, _)| *r >= lo)
        } else {
            self.future.partition_point(|(r, _)| *r > lo)
        };
        let chain = self.past[p_lo..p_hi.max(p_lo)]
            .iter()
            .chain(self.future[f_start.min(f_end)..f_end].iter().rev())
            .map(|(r, v)| (*r, v));
        if ascending {
            DirIter::Fwd(chain)
        } else {
            DirIter::Rev(chain.rev())
        }
    }

    /// Samples the effective value at every `step`-th revision from `from`
    /// toward `to` (exclusive), honoring direction.
    ///
    /// Each yielded item carries the sampled revision and the lookup result
    /// at that point; revisions before the start of history yield the error
    /// a direct lookup would.
    pub fn sampled(
        &self,
        from: R,
        to: R,
        step: i64,
    ) -> impl Iterator<Item = (R, Result<&V, HistoryError>)> + '_ {
        let step = if from <= to { step.abs() } else { -step.abs() };
        let mut i = from.index();
        let stop = to.index();
        std::iter::from_fn(move || {
            if step == 0 || (step > 0 && i >= stop) || (step < 0 && i <= stop) {
                return None;
            }
            let rev = R::from_index(i);
            i += step;
            Some((rev, self.value_at(rev)))
        })
    }
}

impl<R: Rev, V> WindowDict<R, Option<V>> {
    /// The live value in effect at `rev`, treating a stored `None` as a
    /// deletion marker.
    ///
    /// # Errors
    ///
    /// [`HistoryError::BeforeHistory`] when nothing is recorded at or
    /// before `rev`; [`HistoryError::Deleted`] when the governing entry is
    /// a deletion marker — distinguishable so callers can tell "never
    /// existed" from "existed, then removed."
    pub fn effective(&self, rev: R) -> Result<&V, HistoryError> {
        match self.entry_at(rev) {
            None => Err(HistoryError::BeforeHistory(rev.index())),
            Some((_, Some(v))) => Ok(v),
            Some((r, None)) => Err(HistoryError::Deleted(r.index())),
        }
    }
}

/// Iterator that is either forward or reversed, chosen at runtime.
enum DirIter<I> {
    Fwd(I),
    Rev(std::iter::Rev<I>),
}

impl<I: DoubleEndedIterator> Iterator for DirIter<I> {
    type Item = I::Item;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            Self::Fwd(i) => i.next(),
            Self::Rev(i) => i.next(),
        }
    }
}

/// Read-only view of a `WindowDict`'s past relative to the cursor.
///
/// Iterates reverse-chronologically: the entry nearest the cursor first.
pub struct PastView<'a, R, V>(&'a [(R, V)]);

impl<'a, R: Rev, V> PastView<'a, R, V> {
    /// Number of entries at or before the cursor.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the past is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The value stored at exactly `rev`, if present in the view.
    #[must_use]
    pub fn get(&self, rev: R) -> Option<&'a V> {
        self.0
            .binary_search_by_key(&rev, |(r, _)| *r)
            .ok()
            .map(|i| &self.0[i].1)
    }

    /// Whether an entry exists at exactly `rev` within the view.
    #[must_use]
    pub fn contains(&self, rev: R) -> bool {
        self.get(rev).is_some()
    }

    /// Entries, nearest-first.
    pub fn iter(&self) -> impl Iterator<Item = (R, &'a V)> + 'a {
        let stack = self.0;
        stack.iter().rev().map(|(r, v)| (*r, v))
    }

    /// Revisions, nearest-first.
    pub fn keys(&self) -> impl Iterator<Item = R> + 'a {
        let stack = self.0;
        stack.iter().rev().map(|(r, _)| *r)
    }

    /// Values, nearest-first.
    pub fn values(&self) -> impl Iterator<Item = &'a V> + 'a {
        let stack = self.0;
        stack.iter().rev().map(|(_, v)| v)
    }
}

/// Read-only view of a `WindowDict`'s future relative to the cursor.
///
/// Iterates chronologically: the entry soonest after the cursor first.
pub struct FutureView<'a, R, V>(&'a [(R, V)]);

impl<'a, R: Rev, V> FutureView<'a, R, V> {
    /// Number of entries after the cursor.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the future is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The value stored at exactly `rev`, if present in the view.
    #[must_use]
    pub fn get(&self, rev: R) -> Option<&'a V> {
        self.0
            .binary_search_by(|(r, _)| r.cmp(&rev).reverse())
            .ok()
            .map(|i| &self.0[i].1)
    }

    /// Whether an entry exists at exactly `rev` within the view.
    #[must_use]
    pub fn contains(&self, rev: R) -> bool {
        self.get(rev).is_some()
    }

    /// Entries, soonest-first.
    pub fn iter(&self) -> impl Iterator<Item = (R, &'a V)> + 'a {
        let stack = self.0;
        stack.iter().rev().map(|(r, v)| (*r, v))
    }

    /// Revisions, soonest-first.
    pub fn keys(&self) -> impl Iterator<Item = R> + 'a {
        let stack = self.0;
        stack.iter().rev().map(|(r, _)| *r)
    }

    /// Values, soonest-first.
    pub fn values(&self) -> impl Iterator<Item = &'a V> + 'a {
        let stack = self.0;
        stack.iter().rev().map(|(_, v)| v)
    }
}

/// A `WindowDict` that refuses to rewrite the past.
///
/// Writes are legal only at the current latest revision (overwrite in
/// place) or strictly after it (append). Any attempt to write behind an
/// already-present later revision fails, enforcing the arrow of time for
/// per-turn overwrite-in-place histories.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct FuturistWindowDict<R, V> {
    inner: WindowDict<R, V>,
}

impl<R, V> Default for FuturistWindowDict<R, V> {
    fn default() -> Self {
        Self {
            inner: WindowDict::default(),
        }
    }
}

impl<R: Rev, V> FuturistWindowDict<R, V> {
    /// Creates an empty dict.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: WindowDict::new(),
        }
    }

    /// Inserts at `rev`, which must be at or after the latest recorded
    /// revision.
    ///
    /// # Errors
    ///
    /// [`HistoryError::FutureWrite`] when any later revision is already
    /// recorded.
    pub fn set(&mut self, rev: R, value: V) -> Result<(), HistoryError> {
        if self.inner.end().is_some_and(|e| e > rev) {
            return Err(HistoryError::FutureWrite(rev.index()));
        }
        self.inner.set(rev, value);
        Ok(())
    }

    /// The value in effect at `rev`, seeking the cursor there.
    pub fn get(&mut self, rev: R) -> Result<&V, HistoryError> {
        self.inner.get(rev)
    }

    /// Removes the entry at exactly `rev`.
    pub fn delete(&mut self, rev: R) -> Result<(), HistoryError> {
        self.inner.delete(rev)
    }

    /// Directional discard; see [`WindowDict::truncate`].
    pub fn truncate(&mut self, rev: R, direction: Direction) {
        self.inner.truncate(rev, direction);
    }

    /// Mutable access to the underlying dict for maintenance paths that
    /// take responsibility for ordering (bulk load, rollback).
    pub(crate) fn inner_mut(&mut self) -> &mut WindowDict<R, V> {
        &mut self.inner
    }
}

impl<R, V> std::ops::Deref for FuturistWindowDict<R, V> {
    type Target = WindowDict<R, V>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl<R: Rev, V> FromIterator<(R, V)> for FuturistWindowDict<R, V> {
    fn from_iter<T: IntoIterator<Item = (R, V)>>(iter: T) -> Self {
        Self {
            inner: WindowDict::from_iter(iter),
        }
    }
}
