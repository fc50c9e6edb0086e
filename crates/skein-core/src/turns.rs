// SPDX-License-Identifier: Apache-2.0
//! Two-level time containers: turn → tick → value.
//!
//! [`SettingsTurnDict`] is the general form used by journals, keycaches, and
//! keyframe indices: both levels are plain [`WindowDict`]s. [`TurnDict`] is
//! the append-only form used by per-entity value histories: both levels are
//! [`FuturistWindowDict`]s, so committed history cannot be rewritten behind
//! the frontier.
//!
//! A value set once stays in effect into later turns until overwritten:
//! lookups that miss the exact turn fall back to the final value of the
//! latest earlier turn.

use crate::errors::HistoryError;
use crate::time::{Rev, Tick, Turn};
use crate::window::{Direction, FuturistWindowDict, WindowDict};

/// Read-only access to the plain window underneath a tick container.
///
/// Lets the two-level read helpers work over both the plain and the
/// append-only tick dict without duplicating the resolution logic.
pub trait AsWindow<R, V> {
    /// The underlying plain window.
    fn as_window(&self) -> &WindowDict<R, V>;
}

impl<R, V> AsWindow<R, V> for WindowDict<R, V> {
    fn as_window(&self) -> &WindowDict<R, V> {
        self
    }
}

impl<R, V> AsWindow<R, V> for FuturistWindowDict<R, V> {
    fn as_window(&self) -> &WindowDict<R, V> {
        self
    }
}

/// The coordinate and value of the write governing `(turn, tick)` in a
/// two-level container: the latest write at or before that time.
fn two_level_latest_at<'a, V, I>(
    outer: &'a WindowDict<Turn, I>,
    turn: Turn,
    tick: Tick,
) -> Option<(Turn, Tick, &'a V)>
where
    I: AsWindow<Tick, V>,
{
    if let Some(ticks) = outer.exact(turn) {
        if let Some((t, v)) = ticks.as_window().entry_at(tick) {
            return Some((turn, t, v));
        }
    }
    // Walk earlier turns until one has an entry; rollback can leave a
    // turn's tick dict transiently empty.
    if turn.index() == i64::MIN {
        return None;
    }
    let mut probe = turn.pred();
    while let Some((prev_turn, ticks)) = outer.entry_at(probe) {
        if let Some((t, v)) = ticks.as_window().latest() {
            return Some((prev_turn, t, v));
        }
        if prev_turn.index() == i64::MIN {
            break;
        }
        probe = prev_turn.pred();
    }
    None
}

/// The latest write anywhere in a two-level container.
fn two_level_latest<'a, V, I>(outer: &'a WindowDict<Turn, I>) -> Option<(Turn, Tick, &'a V)>
where
    I: AsWindow<Tick, V>,
{
    // Trailing empty tick dicts can exist transiently during rollback;
    // walk back until one has an entry.
    outer
        .iter()
        .rev()
        .find_map(|(turn, ticks)| ticks.as_window().latest().map(|(t, v)| (turn, t, v)))
}

/// The earliest write anywhere in a two-level container.
fn two_level_earliest<'a, V, I>(outer: &'a WindowDict<Turn, I>) -> Option<(Turn, Tick, &'a V)>
where
    I: AsWindow<Tick, V>,
{
    outer
        .iter()
        .find_map(|(turn, ticks)| ticks.as_window().earliest().map(|(t, v)| (turn, t, v)))
}

/// A turn-keyed [`WindowDict`] of tick-keyed [`WindowDict`]s.
///
/// This is the journal/keycache shape: writes may land at any coordinate.
#[derive(Clone, Debug)]
pub struct SettingsTurnDict<V> {
    turns: WindowDict<Turn, WindowDict<Tick, V>>,
}

impl<V> Default for SettingsTurnDict<V> {
    fn default() -> Self {
        Self {
            turns: WindowDict::default(),
        }
    }
}

impl<V> SettingsTurnDict<V> {
    /// Creates an empty container.
    #[must_use]
    pub fn new() -> Self {
        Self {
            turns: WindowDict::new(),
        }
    }

    /// Whether nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.turns.iter().all(|(_, t)| t.is_empty())
    }

    /// Stores `value` at `(turn, tick)`, creating the turn's sub-dict if
    /// absent.
    pub fn store_at(&mut self, turn: Turn, tick: Tick, value: V) {
        self.ticks_mut(turn).set(tick, value);
    }

    /// Mutable access to the tick dict of `turn`, creating it if absent.
    pub fn ticks_mut(&mut self, turn: Turn) -> &mut WindowDict<Tick, V> {
        if self.turns.exact(turn).is_none() {
            self.turns.set(turn, WindowDict::new());
        }
        // The entry was just ensured above.
        #[allow(clippy::unwrap_used)]
        self.turns.exact_mut(turn).unwrap()
    }

    /// The tick dict recorded at exactly `turn`, if any.
    #[must_use]
    pub fn ticks(&self, turn: Turn) -> Option<&WindowDict<Tick, V>> {
        self.turns.exact(turn)
    }

    /// The value in effect at `(turn, tick)`: within the exact turn when it
    /// has a write at or before `tick`, else the final value of the latest
    /// earlier turn.
    pub fn retrieve(&self, turn: Turn, tick: Tick) -> Result<&V, HistoryError> {
        two_level_latest_at(&self.turns, turn, tick)
            .map(|(_, _, v)| v)
            .ok_or(HistoryError::BeforeHistory(turn.index()))
    }

    /// The value stored at exactly `(turn, tick)`, if any.
    #[must_use]
    pub fn retrieve_exact(&self, turn: Turn, tick: Tick) -> Option<&V> {
        self.turns.exact(turn).and_then(|t| t.exact(tick))
    }

    /// Whether a write exists at exactly `(turn, tick)`.
    #[must_use]
    pub fn contains_exact(&self, turn: Turn, tick: Tick) -> bool {
        self.retrieve_exact(turn, tick).is_some()
    }

    /// The coordinate and value of the write governing `(turn, tick)`.
    #[must_use]
    pub fn latest_at(&self, turn: Turn, tick: Tick) -> Option<(Turn, Tick, &V)> {
        two_level_latest_at(&self.turns, turn, tick)
    }

    /// The latest write anywhere.
    #[must_use]
    pub fn latest(&self) -> Option<(Turn, Tick, &V)> {
        two_level_latest(&self.turns)
    }

    /// The earliest write anywhere.
    #[must_use]
    pub fn earliest(&self) -> Option<(Turn, Tick, &V)> {
        two_level_earliest(&self.turns)
    }

    /// Whether any write exists at or before `(turn, tick)`.
    #[must_use]
    pub fn settled_by(&self, turn: Turn, tick: Tick) -> bool {
        self.latest_at(turn, tick).is_some()
    }

    /// Removes the write at exactly `(turn, tick)`, dropping the turn's
    /// sub-dict when it empties.
    pub fn remove_exact(&mut self, turn: Turn, tick: Tick) -> Result<(), HistoryError> {
        let Some(ticks) = self.turns.exact_mut(turn) else {
            return Err(HistoryError::NotRecorded(turn.index()));
        };
        ticks.delete(tick)?;
        if ticks.is_empty() {
            let _ = self.turns.delete(turn);
        }
        Ok(())
    }

    /// Directionally discards everything beyond `(turn, tick)`.
    pub fn truncate(&mut self, turn: Turn, tick: Tick, direction: Direction) {
        let emptied = if let Some(ticks) = self.turns.exact_mut(turn) {
            ticks.truncate(tick, direction);
            ticks.is_empty()
        } else {
            false
        };
        self.turns.truncate(turn, direction);
        if emptied {
            let _ = self.turns.delete(turn);
        }
    }

    /// Drops the tick dict at exactly `turn` and everything after it.
    pub fn truncate_from_turn(&mut self, turn: Turn) {
        self.turns.truncate(turn, Direction::Forward);
        let _ = self.turns.delete(turn);
    }

    /// All writes in ascending `(turn, tick)` order.
    pub fn iter(&self) -> impl Iterator<Item = (Turn, Tick, &V)> + '_ {
        self.turns
            .iter()
            .flat_map(|(turn, ticks)| ticks.iter().map(move |(t, v)| (turn, t, v)))
    }

    /// All turns with a recorded tick dict, ascending.
    pub fn iter_turns(&self) -> impl Iterator<Item = (Turn, &WindowDict<Tick, V>)> + '_ {
        self.turns.iter()
    }

    /// Writes strictly after `(turn, tick)`, ascending.
    pub fn iter_after(
        &self,
        turn: Turn,
        tick: Tick,
    ) -> impl Iterator<Item = (Turn, Tick, &V)> + '_ {
        self.iter()
            .filter(move |&(tn, tk, _)| (tn, tk) > (turn, tick))
    }

    /// Calls `visit` for every write with `lo < (turn, tick) <= hi`,
    /// ascending when `reverse` is false and descending otherwise.
    ///
    /// This is the journal window scan behind delta computation: forward
    /// deltas fold after-values ascending, backward deltas fold pre-values
    /// descending over the same half-open window.
    pub fn scan_between(
        &self,
        lo: (Turn, Tick),
        hi: (Turn, Tick),
        reverse: bool,
        mut visit: impl FnMut(Turn, Tick, &V),
    ) {
        let in_window = |tn: Turn, tk: Tick| (tn, tk) > lo && (tn, tk) <= hi;
        if reverse {
            for (turn, ticks) in self.turns.iter().rev() {
                if turn < lo.0 || turn > hi.0 {
                    continue;
                }
                for (t, v) in ticks.iter().rev() {
                    if in_window(turn, t) {
                        visit(turn, t, v);
                    }
                }
            }
        } else {
            for (turn, ticks) in self.turns.iter() {
                if turn < lo.0 || turn > hi.0 {
                    continue;
                }
                for (t, v) in ticks.iter() {
                    if in_window(turn, t) {
                        visit(turn, t, v);
                    }
                }
            }
        }
    }
}

/// The append-only two-level container used for per-entity value histories.
///
/// Both levels are [`FuturistWindowDict`]s: writing a turn earlier than an
/// already-recorded later turn fails, and writes within a turn must first
/// truncate anything planned beyond them.
#[derive(Clone, Debug)]
pub struct TurnDict<V> {
    turns: FuturistWindowDict<Turn, FuturistWindowDict<Tick, V>>,
}

impl<V> Default for TurnDict<V> {
    fn default() -> Self {
        Self {
            turns: FuturistWindowDict::default(),
        }
    }
}

impl<V> TurnDict<V> {
    /// Creates an empty container.
    #[must_use]
    pub fn new() -> Self {
        Self {
            turns: FuturistWindowDict::new(),
        }
    }

    /// Whether nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.turns.iter().all(|(_, t)| t.is_empty())
    }

    /// Stores `value` at `(turn, tick)`, discarding any same-turn writes
    /// after `tick` first (per-turn overwrite-in-place).
    ///
    /// # Errors
    ///
    /// [`HistoryError::FutureWrite`] when `turn` is behind an
    /// already-recorded later turn.
    pub fn store_with_truncate(
        &mut self,
        turn: Turn,
        tick: Tick,
        value: V,
    ) -> Result<(), HistoryError> {
        if let Some(ticks) = self.turns.inner_mut().exact_mut(turn) {
            ticks.truncate(tick, Direction::Forward);
            ticks.set(tick, value)?;
            return Ok(());
        }
        let mut ticks = FuturistWindowDict::new();
        ticks.set(tick, value)?;
        self.turns.set(turn, ticks)
    }

    /// The tick dict recorded at exactly `turn`, if any.
    #[must_use]
    pub fn ticks(&self, turn: Turn) -> Option<&FuturistWindowDict<Tick, V>> {
        self.turns.exact(turn)
    }

    /// Inserts without the append-only guard. Reserved for bulk loading,
    /// which replays persisted rows into a container that may still hold
    /// later history kept across an unload.
    pub(crate) fn load_insert(&mut self, turn: Turn, tick: Tick, value: V) {
        let outer = self.turns.inner_mut();
        if outer.exact(turn).is_none() {
            outer.set(turn, FuturistWindowDict::new());
        }
        if let Some(ticks) = outer.exact_mut(turn) {
            ticks.inner_mut().set(tick, value);
        }
    }

    /// The value in effect at `(turn, tick)`, with cross-turn continuity.
    pub fn retrieve(&self, turn: Turn, tick: Tick) -> Result<&V, HistoryError> {
        two_level_latest_at(&self.turns, turn, tick)
            .map(|(_, _, v)| v)
            .ok_or(HistoryError::BeforeHistory(turn.index()))
    }

    /// The value stored at exactly `(turn, tick)`, if any.
    #[must_use]
    pub fn retrieve_exact(&self, turn: Turn, tick: Tick) -> Option<&V> {
        self.turns.exact(turn).and_then(|t| t.exact(tick))
    }

    /// The coordinate and value of the write governing `(turn, tick)`.
    #[must_use]
    pub fn latest_at(&self, turn: Turn, tick: Tick) -> Option<(Turn, Tick, &V)> {
        two_level_latest_at(&self.turns, turn, tick)
    }

    /// The latest write anywhere.
    #[must_use]
    pub fn latest(&self) -> Option<(Turn, Tick, &V)> {
        two_level_latest(&self.turns)
    }

    /// The earliest write anywhere.
    #[must_use]
    pub fn earliest(&self) -> Option<(Turn, Tick, &V)> {
        two_level_earliest(&self.turns)
    }

    /// Whether any write exists at or before `(turn, tick)`.
    #[must_use]
    pub fn settled_by(&self, turn: Turn, tick: Tick) -> bool {
        self.latest_at(turn, tick).is_some()
    }

    /// Removes the write at exactly `(turn, tick)`, dropping the turn's
    /// sub-dict when it empties. Used by plan rollback, which owns the
    /// ordering argument.
    pub fn remove_exact(&mut self, turn: Turn, tick: Tick) -> Result<(), HistoryError> {
        let Some(ticks) = self.turns.inner_mut().exact_mut(turn) else {
            return Err(HistoryError::NotRecorded(turn.index()));
        };
        ticks.delete(tick)?;
        if ticks.is_empty() {
            let _ = self.turns.inner_mut().delete(turn);
        }
        Ok(())
    }

    /// Directionally discards everything beyond `(turn, tick)`.
    pub fn truncate(&mut self, turn: Turn, tick: Tick, direction: Direction) {
        let emptied = if let Some(ticks) = self.turns.inner_mut().exact_mut(turn) {
            ticks.truncate(tick, direction);
            ticks.is_empty()
        } else {
            false
        };
        self.turns.truncate(turn, direction);
        if emptied {
            let _ = self.turns.inner_mut().delete(turn);
        }
    }

    /// All writes in ascending `(turn, tick)` order.
    pub fn iter(&self) -> impl Iterator<Item = (Turn, Tick, &V)> + '_ {
        self.turns
            .iter()
            .flat_map(|(turn, ticks)| ticks.iter().map(move |(t, v)| (turn, t, v)))
    }

    /// Writes strictly after `(turn, tick)`, ascending. This is the
    /// future-contradiction scan surface.
    pub fn iter_after(
        &self,
        turn: Turn,
        tick: Tick,
    ) -> impl Iterator<Item = (Turn, Tick, &V)> + '_ {
        self.iter()
            .filter(move |&(tn, tk, _)| (tn, tk) > (turn, tick))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn retrieve_falls_back_across_turn_boundaries() {
        let mut d: SettingsTurnDict<&'static str> = SettingsTurnDict::new();
        d.store_at(Turn(1), Tick(0), "one");
        d.store_at(Turn(1), Tick(4), "one-late");
        d.store_at(Turn(3), Tick(2), "three");
        // Within the exact turn.
        assert_eq!(d.retrieve(Turn(1), Tick(4)).unwrap(), &"one-late");
        // Exact turn exists but tick precedes every write in it: previous
        // turn's final value governs.
        assert_eq!(d.retrieve(Turn(3), Tick(0)).unwrap(), &"one-late");
        // No writes in the turn at all: latest earlier turn's final value.
        assert_eq!(d.retrieve(Turn(2), Tick(9)).unwrap(), &"one-late");
        assert_eq!(d.retrieve(Turn(7), Tick(0)).unwrap(), &"three");
        assert!(d.retrieve(Turn(0), Tick(9)).is_err());
    }

    #[test]
    fn retrieve_exact_requires_a_write_at_that_coordinate() {
        let mut d: SettingsTurnDict<u8> = SettingsTurnDict::new();
        d.store_at(Turn(2), Tick(1), 7);
        assert_eq!(d.retrieve_exact(Turn(2), Tick(1)), Some(&7));
        assert_eq!(d.retrieve_exact(Turn(2), Tick(2)), None);
        assert_eq!(d.retrieve_exact(Turn(1), Tick(1)), None);
    }

    #[test]
    fn remove_exact_drops_empty_turns() {
        let mut d: SettingsTurnDict<u8> = SettingsTurnDict::new();
        d.store_at(Turn(2), Tick(1), 7);
        d.remove_exact(Turn(2), Tick(1)).unwrap();
        assert!(d.is_empty());
        assert!(d.ticks(Turn(2)).is_none());
    }

    #[test]
    fn scan_between_covers_the_half_open_window() {
        let mut d: SettingsTurnDict<i32> = SettingsTurnDict::new();
        for (tn, tk, v) in [(0, 0, 1), (0, 3, 2), (1, 0, 3), (2, 2, 4), (3, 0, 5)] {
            d.store_at(Turn(tn), Tick(tk), v);
        }
        let mut seen = Vec::new();
        d.scan_between((Turn(0), Tick(0)), (Turn(2), Tick(2)), false, |tn, tk, v| {
            seen.push((tn.0, tk.0, *v));
        });
        // Excludes the write at the lower bound, includes the upper bound.
        assert_eq!(seen, vec![(0, 3, 2), (1, 0, 3), (2, 2, 4)]);
        let mut rev = Vec::new();
        d.scan_between((Turn(0), Tick(0)), (Turn(2), Tick(2)), true, |tn, tk, v| {
            rev.push((tn.0, tk.0, *v));
        });
        assert_eq!(rev, vec![(2, 2, 4), (1, 0, 3), (0, 3, 2)]);
    }

    #[test]
    fn turn_dict_truncates_before_overwriting() {
        let mut d: TurnDict<&'static str> = TurnDict::new();
        d.store_with_truncate(Turn(0), Tick(0), "a").unwrap();
        d.store_with_truncate(Turn(0), Tick(5), "b").unwrap();
        // Re-writing earlier in the same turn discards the later tick.
        d.store_with_truncate(Turn(0), Tick(2), "c").unwrap();
        assert_eq!(d.retrieve_exact(Turn(0), Tick(5)), None);
        assert_eq!(d.retrieve(Turn(0), Tick(9)).unwrap(), &"c");
    }

    #[test]
    fn turn_dict_rejects_earlier_turns() {
        let mut d: TurnDict<u8> = TurnDict::new();
        d.store_with_truncate(Turn(3), Tick(0), 1).unwrap();
        assert!(matches!(
            d.store_with_truncate(Turn(1), Tick(0), 2),
            Err(HistoryError::FutureWrite(_))
        ));
    }

    #[test]
    fn truncate_backward_keeps_bracket_boundary() {
        let mut d: SettingsTurnDict<u8> = SettingsTurnDict::new();
        for (tn, tk) in [(0, 0), (1, 1), (2, 0), (3, 4)] {
            d.store_at(Turn(tn), Tick(tk), 9);
        }
        d.truncate(Turn(2), Tick(0), Direction::Backward);
        assert_eq!(d.earliest().map(|(tn, tk, _)| (tn, tk)), Some((Turn(2), Tick(0))));
        assert_eq!(d.latest().map(|(tn, tk, _)| (tn, tk)), Some((Turn(3), Tick(4))));
    }
}
