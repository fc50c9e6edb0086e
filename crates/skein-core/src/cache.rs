// SPDX-License-Identifier: Apache-2.0
//! The branch-and-time-aware store for one kind of fact.
//!
//! One [`Cache`] holds every fact of a single kind — all graph stats, or all
//! node existence bits, or all edge stats — across every entity of that
//! kind, every branch, and all of loaded time. It maintains, in step:
//!
//! - the canonical per-`(entity, key)` branch histories (append-only
//!   [`TurnDict`]s of optional values, `None` being a deletion marker),
//! - a per-entity index of every key ever written, for enumeration,
//! - the write journal (`settings`/`presettings`: after- and before-values
//!   of every write, keyed by branch → turn → tick) that delta computation
//!   scans,
//! - per-entity keyframes: immutable, `Arc`-shared full key→value
//!   snapshots at exact coordinates, bounding how far back reads search,
//! - a bounded, forward-optimized memo of "what keys exist here now"
//!   ([`KeySetCache`]), and
//! - the reverse index from time coordinate to the `(entity, key)` written
//!   there, which plan rollback uses to find what to undo.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use tracing::trace;

use crate::errors::{HistoryError, RetrieveError};
use crate::keycache::{KeySetCache, KeycacheMode, KEYCACHE_MAXSIZE};
use crate::time::{Branch, BranchGraph, StopTime, Tick, Turn};
use crate::turns::{SettingsTurnDict, TurnDict};
use crate::window::Direction;

/// Bound for types usable as entity addresses in a cache.
pub trait EntityKey: Clone + Eq + Hash + Ord + fmt::Debug {}
impl<T: Clone + Eq + Hash + Ord + fmt::Debug> EntityKey for T {}

/// Bound for values stored in a cache: cloned into journals and keyframes,
/// compared for contradiction detection.
pub trait FactValue: Clone + PartialEq + fmt::Debug {}
impl<T: Clone + PartialEq + fmt::Debug> FactValue for T {}

/// One journal entry: which fact a write touched and the value it carried
/// (after-value in `settings`, before-value in `presettings`).
#[derive(Clone, Debug)]
pub struct JournalRow<E, K, V> {
    /// Entity the write addressed.
    pub entity: E,
    /// Key within the entity.
    pub key: K,
    /// Value written (or, in the pre-journal, the value displaced).
    /// `None` is the deletion marker.
    pub value: Option<V>,
}

/// A fully-loaded fact row, as bulk loading delivers them.
pub type LoadRow<E, K, V> = (E, K, Branch, Turn, Tick, Option<V>);

/// Outcome of a raw cache resolution, before conversion to a result.
///
/// The three non-value outcomes are deliberately distinct; see
/// [`RetrieveError`].
#[derive(Debug, PartialEq, Eq)]
pub enum Retrieved<'a, V> {
    /// A live value governs this time.
    Value(&'a V),
    /// A deletion marker governs this time.
    Tombstone,
    /// The governing keyframe omits the key: confirmed absent as of that
    /// keyframe.
    NotInKeyframe,
    /// Nothing anywhere in the lineage mentions this fact.
    Absence,
}

/// Write-time options threaded through [`Cache::store`].
#[derive(Clone, Copy, Debug)]
pub struct StoreParams {
    /// Whether the write belongs to a plan (tentative future).
    pub planning: bool,
    /// Whether the write replays rows from storage; loading never extends
    /// branch bookkeeping and never touches the keycache.
    pub loading: bool,
    /// Keycache consultation mode.
    pub keycache: KeycacheMode,
}

/// The authoritative temporal store for one kind of fact.
pub struct Cache<E, K, V> {
    name: &'static str,
    /// Canonical histories: `(entity, key)` → branch → turn → tick → value.
    histories: FxHashMap<(E, K), FxHashMap<Branch, TurnDict<Option<V>>>>,
    /// Every key ever written per entity, for enumeration scans.
    keys: FxHashMap<E, BTreeSet<K>>,
    /// Immutable keyframes: entity → branch → turn → tick → key→value map.
    keyframes: FxHashMap<E, FxHashMap<Branch, SettingsTurnDict<Arc<BTreeMap<K, V>>>>>,
    /// After-values of every write, per branch.
    settings: FxHashMap<Branch, SettingsTurnDict<JournalRow<E, K, V>>>,
    /// Before-values of every write, per branch.
    presettings: FxHashMap<Branch, SettingsTurnDict<JournalRow<E, K, V>>>,
    /// Reverse index: which `(entity, key)` was written at a coordinate.
    time_entity: FxHashMap<(Branch, Turn, Tick), (E, K)>,
    /// Memoized key sets.
    keycache: KeySetCache<(E, Branch), K>,
}

impl<E: EntityKey, K: EntityKey, V: FactValue> Cache<E, K, V> {
    /// Creates an empty cache named for diagnostics, with the default
    /// keycache bound.
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        Self::with_keycache_capacity(name, KEYCACHE_MAXSIZE)
    }

    /// Creates an empty cache with an explicit keycache bound.
    #[must_use]
    pub fn with_keycache_capacity(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            histories: FxHashMap::default(),
            keys: FxHashMap::default(),
            keyframes: FxHashMap::default(),
            settings: FxHashMap::default(),
            presettings: FxHashMap::default(),
            time_entity: FxHashMap::default(),
            keycache: KeySetCache::new(capacity),
        }
    }

    /// The diagnostic name of this cache.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Every entity that has ever had a key written.
    pub fn iter_entities(&self) -> impl Iterator<Item = &E> {
        self.keys.keys()
    }

    /// Every key ever written on `entity`, regardless of time.
    pub fn keys_ever(&self, entity: &E) -> impl Iterator<Item = &K> {
        self.keys.get(entity).into_iter().flatten()
    }

    /// Writes `value` as the fact for `(entity, key)` at the given time.
    ///
    /// The journal is updated with the before/after pair, the canonical
    /// history is written (discarding any same-turn writes after `tick`),
    /// and the keycache is incrementally updated or invalidated.
    ///
    /// Contradiction handling is the engine's job: it consults
    /// [`future_contradictions`](Self::future_contradictions) and deletes
    /// the conflicting plans *before* calling this.
    ///
    /// # Errors
    ///
    /// [`HistoryError::FutureWrite`] when the write would land behind
    /// committed later turns, or — in planning mode — behind ticks already
    /// planned after it within the same turn.
    pub fn store(
        &mut self,
        entity: E,
        key: K,
        branch: &Branch,
        turn: Turn,
        tick: Tick,
        value: Option<V>,
        graph: &BranchGraph,
        params: StoreParams,
    ) -> Result<(), HistoryError> {
        // Validate before journaling so a rejected write leaves no trace.
        // Loading replays already-validated rows and may interleave with
        // later history retained across an unload, so it skips the guard.
        if !params.loading {
            if let Some(td) = self
                .histories
                .get(&(entity.clone(), key.clone()))
                .and_then(|m| m.get(branch))
            {
                if params.planning {
                    if let Some(ticks) = td.ticks(turn) {
                        if ticks.end().is_some_and(|e| tick < e) {
                            return Err(HistoryError::FutureWrite(tick.0));
                        }
                    }
                }
                if td.ticks(turn).is_none() && td.latest().is_some_and(|(tn, _, _)| tn > turn) {
                    return Err(HistoryError::FutureWrite(turn.0));
                }
            }
        }
        trace!(
            cache = self.name,
            branch = %branch,
            turn = turn.0,
            tick = tick.0,
            deleting = value.is_none(),
            "store"
        );
        self.journal(&entity, &key, branch, turn, tick, value.clone(), graph);
        let entikey = (entity.clone(), key.clone());
        let td = self
            .histories
            .entry(entikey)
            .or_default()
            .entry(branch.clone())
            .or_default();
        if params.loading {
            td.load_insert(turn, tick, value.clone());
        } else {
            td.store_with_truncate(turn, tick, value.clone())?;
        }
        self.keys
            .entry(entity.clone())
            .or_default()
            .insert(key.clone());
        self.time_entity
            .insert((branch.clone(), turn, tick), (entity.clone(), key.clone()));
        if params.keycache.enabled && !params.loading {
            // Editing anywhere invalidates memoized key sets from this turn
            // on; the write itself is then re-memoized incrementally.
            let ikey = (entity.clone(), branch.clone());
            self.keycache.invalidate_from_turn(&ikey, turn);
            let Self {
                keycache,
                keys,
                histories,
                keyframes,
                ..
            } = self;
            keycache.note_write(
                &ikey,
                turn,
                tick,
                &key,
                value.is_some(),
                params.keycache.forward,
                |stop| {
                    adds_dels_scan(
                        keys, histories, keyframes, &entity, graph, branch, turn, tick,
                        stop.map(|(st, sk)| StopTime {
                            branch: branch.clone(),
                            turn: st,
                            tick: sk,
                        })
                        .as_ref(),
                    )
                },
            );
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn journal(
        &mut self,
        entity: &E,
        key: &K,
        branch: &Branch,
        turn: Turn,
        tick: Tick,
        value: Option<V>,
        graph: &BranchGraph,
    ) {
        // The before-value resolves across the full lineage: the first
        // write in a child branch displaces the value inherited from the
        // parent, and a backward delta must restore exactly that.
        let prev = match self.base_retrieve(entity, key, branch, turn, tick, graph) {
            Retrieved::Value(v) => Some(v.clone()),
            Retrieved::Tombstone | Retrieved::NotInKeyframe | Retrieved::Absence => None,
        };
        self.presettings
            .entry(branch.clone())
            .or_default()
            .store_at(
                turn,
                tick,
                JournalRow {
                    entity: entity.clone(),
                    key: key.clone(),
                    value: prev,
                },
            );
        self.settings.entry(branch.clone()).or_default().store_at(
            turn,
            tick,
            JournalRow {
                entity: entity.clone(),
                key: key.clone(),
                value,
            },
        );
    }

    /// Resolves the fact in effect at a time, walking ancestor branches.
    ///
    /// At every visited lineage point the nearer of {latest raw write,
    /// latest keyframe} governs, raw winning ties; a governing keyframe
    /// that omits the key is a confirmed absence, not a fall-through.
    #[must_use]
    pub fn base_retrieve(
        &self,
        entity: &E,
        key: &K,
        branch: &Branch,
        turn: Turn,
        tick: Tick,
        graph: &BranchGraph,
    ) -> Retrieved<'_, V> {
        let entikey = (entity.clone(), key.clone());
        let branches = self.histories.get(&entikey);
        let kf_branches = self.keyframes.get(entity);
        for (vb, vt, vtk) in graph.iter_parent_btt(branch, turn, tick, None) {
            let raw = branches
                .and_then(|m| m.get(&vb))
                .and_then(|td| td.latest_at(vt, vtk));
            let kf = kf_branches
                .and_then(|m| m.get(&vb))
                .and_then(|d| d.latest_at(vt, vtk));
            match pick_authority(raw, kf) {
                Authority::Raw(Some(v)) => return Retrieved::Value(v),
                Authority::Raw(None) => return Retrieved::Tombstone,
                Authority::Keyframe(map) => {
                    return map
                        .get(key)
                        .map_or(Retrieved::NotInKeyframe, Retrieved::Value)
                }
                Authority::Neither => {}
            }
        }
        Retrieved::Absence
    }

    /// Resolves the fact in effect at a time.
    ///
    /// # Errors
    ///
    /// Preserves the three-way distinction: [`RetrieveError::Deleted`],
    /// [`RetrieveError::NotInKeyframe`], [`RetrieveError::Unknown`].
    pub fn retrieve(
        &self,
        entity: &E,
        key: &K,
        branch: &Branch,
        turn: Turn,
        tick: Tick,
        graph: &BranchGraph,
    ) -> Result<&V, RetrieveError> {
        match self.base_retrieve(entity, key, branch, turn, tick, graph) {
            Retrieved::Value(v) => Ok(v),
            Retrieved::Tombstone => Err(RetrieveError::Deleted),
            Retrieved::NotInKeyframe => Err(RetrieveError::NotInKeyframe),
            Retrieved::Absence => Err(RetrieveError::Unknown),
        }
    }

    /// The set of keys extant on `entity` at a time, memoized.
    ///
    /// With `mode.enabled` false, the set is recomputed from the nearest
    /// keyframe boundary on every call instead.
    pub fn keys_at(
        &mut self,
        entity: &E,
        branch: &Branch,
        turn: Turn,
        tick: Tick,
        graph: &BranchGraph,
        mode: KeycacheMode,
    ) -> Arc<BTreeSet<K>> {
        let Self {
            keycache,
            keys,
            histories,
            keyframes,
            ..
        } = self;
        let adds_dels = |stop: Option<(Turn, Tick)>| {
            adds_dels_scan(
                keys, histories, keyframes, entity, graph, branch, turn, tick,
                stop.map(|(st, sk)| StopTime {
                    branch: branch.clone(),
                    turn: st,
                    tick: sk,
                })
                .as_ref(),
            )
        };
        if !mode.enabled {
            return Arc::new(adds_dels(None).0);
        }
        keycache.get_or_build(
            &(entity.clone(), branch.clone()),
            turn,
            tick,
            mode.forward,
            adds_dels,
        )
    }

    /// Number of keys extant on `entity` at a time.
    pub fn count_keys(
        &mut self,
        entity: &E,
        branch: &Branch,
        turn: Turn,
        tick: Tick,
        graph: &BranchGraph,
        mode: KeycacheMode,
    ) -> usize {
        self.keys_at(entity, branch, turn, tick, graph, mode).len()
    }

    /// Whether `(entity, key)` resolves to a live value at a time.
    #[must_use]
    pub fn contains_key_at(
        &self,
        entity: &E,
        key: &K,
        branch: &Branch,
        turn: Turn,
        tick: Tick,
        graph: &BranchGraph,
    ) -> bool {
        matches!(
            self.base_retrieve(entity, key, branch, turn, tick, graph),
            Retrieved::Value(_)
        )
    }

    /// The `(added, deleted)` key-set changes on `entity` since `stop`
    /// (exclusive), or — with no stop time — the full extant key set in
    /// `added`, folded from raw history and the nearest keyframe.
    #[must_use]
    pub fn adds_dels(
        &self,
        entity: &E,
        branch: &Branch,
        turn: Turn,
        tick: Tick,
        graph: &BranchGraph,
        stop: Option<&StopTime>,
    ) -> (BTreeSet<K>, BTreeSet<K>) {
        adds_dels_scan(
            &self.keys,
            &self.histories,
            &self.keyframes,
            entity,
            graph,
            branch,
            turn,
            tick,
            stop,
        )
    }

    /// Times strictly after `(turn, tick)` in this branch where the stored
    /// value for `(entity, key)` disagrees with `value`.
    ///
    /// Every such time that belongs to a plan must be rolled back before a
    /// write of `value` proceeds; times belonging to committed history are
    /// surfaced too, but committed history is never deleted by the caller.
    #[must_use]
    pub fn future_contradictions(
        &self,
        entity: &E,
        key: &K,
        branch: &Branch,
        turn: Turn,
        tick: Tick,
        value: &Option<V>,
    ) -> Vec<(Turn, Tick)> {
        let Some(td) = self
            .histories
            .get(&(entity.clone(), key.clone()))
            .and_then(|m| m.get(branch))
        else {
            return Vec::new();
        };
        td.iter_after(turn, tick)
            .filter(|(_, _, stored)| stored != &value)
            .map(|(tn, tk, _)| (tn, tk))
            .collect()
    }

    /// Deletes all trace of the write at one exact time, returning the
    /// `(entity, key)` it addressed. Plan rollback calls this for every
    /// revoked tick.
    pub fn remove(&mut self, branch: &Branch, turn: Turn, tick: Tick) -> Option<(E, K)> {
        let (entity, key) = self.time_entity.remove(&(branch.clone(), turn, tick))?;
        trace!(
            cache = self.name,
            branch = %branch,
            turn = turn.0,
            tick = tick.0,
            "remove"
        );
        let entikey = (entity.clone(), key.clone());
        if let Some(branches) = self.histories.get_mut(&entikey) {
            let emptied = if let Some(td) = branches.get_mut(branch) {
                let _ = td.remove_exact(turn, tick);
                td.is_empty()
            } else {
                false
            };
            if emptied {
                branches.remove(branch);
            }
            if branches.is_empty() {
                self.histories.remove(&entikey);
                if let Some(keyset) = self.keys.get_mut(&entity) {
                    keyset.remove(&key);
                    if keyset.is_empty() {
                        self.keys.remove(&entity);
                    }
                }
            }
        }
        for journal in [&mut self.settings, &mut self.presettings] {
            if let Some(d) = journal.get_mut(branch) {
                let _ = d.remove_exact(turn, tick);
                if d.is_empty() {
                    journal.remove(branch);
                }
            }
        }
        self.keycache
            .rollback_from(&(entity.clone(), branch.clone()), turn, tick);
        Some((entity, key))
    }

    /// Directionally discards history in `branch` across every index.
    /// `Forward` keeps everything at or before the coordinate; `Backward`
    /// keeps the coordinate itself and later. Used by `unload`.
    pub fn truncate(&mut self, branch: &Branch, turn: Turn, tick: Tick, direction: Direction) {
        for branches in self.histories.values_mut() {
            if let Some(td) = branches.get_mut(branch) {
                td.truncate(turn, tick, direction);
            }
        }
        self.histories.retain(|_, branches| {
            branches.retain(|_, td| !td.is_empty());
            !branches.is_empty()
        });
        for journal in [&mut self.settings, &mut self.presettings] {
            if let Some(d) = journal.get_mut(branch) {
                d.truncate(turn, tick, direction);
            }
        }
        for branches in self.keyframes.values_mut() {
            if let Some(d) = branches.get_mut(branch) {
                d.truncate(turn, tick, direction);
            }
        }
        self.time_entity.retain(|(b, tn, tk), _| {
            b != branch
                || match direction {
                    Direction::Forward => (*tn, *tk) <= (turn, tick),
                    Direction::Backward => (*tn, *tk) >= (turn, tick),
                }
        });
        // Memoized sets are cheap to rebuild; dropping them wholesale is
        // always safe.
        self.keycache.remove_where(|(_, b)| b == branch);
    }

    /// Removes every trace of `branch` from every index.
    pub fn remove_branch(&mut self, branch: &Branch) {
        self.histories.retain(|_, branches| {
            branches.remove(branch);
            !branches.is_empty()
        });
        self.settings.remove(branch);
        self.presettings.remove(branch);
        for branches in self.keyframes.values_mut() {
            branches.remove(branch);
        }
        self.keyframes.retain(|_, b| !b.is_empty());
        self.time_entity.retain(|(b, _, _), _| b != branch);
        self.keycache.remove_where(|(_, b)| b == branch);
        self.rebuild_keys_index();
    }

    /// Removes every fact whose entity matches `pred` (used when a whole
    /// character is deleted). Journals keep their rows: deltas spanning the
    /// removal still need to report it.
    pub fn remove_entities_where(&mut self, pred: impl Fn(&E) -> bool) {
        self.histories.retain(|(e, _), _| !pred(e));
        self.keyframes.retain(|e, _| !pred(e));
        self.keys.retain(|e, _| !pred(e));
        self.time_entity.retain(|_, (e, _)| !pred(e));
        self.keycache.remove_where(|(e, _)| pred(e));
    }

    /// Bulk-loads pre-sorted rows (chronological within each branch,
    /// parents before children). Keycache updates are suppressed; reads
    /// after a bulk load rebuild their memos on demand.
    ///
    /// # Errors
    ///
    /// Propagates ordering violations from the append-only history.
    pub fn load(
        &mut self,
        rows: Vec<LoadRow<E, K, V>>,
        graph: &BranchGraph,
    ) -> Result<(), HistoryError> {
        for (entity, key, branch, turn, tick, value) in rows {
            self.store(
                entity,
                key,
                &branch,
                turn,
                tick,
                value,
                graph,
                StoreParams {
                    planning: false,
                    loading: true,
                    keycache: KeycacheMode {
                        enabled: false,
                        forward: false,
                    },
                },
            )?;
        }
        Ok(())
    }

    /// The keyframe stored for `entity` at exactly this coordinate, if any.
    /// Keyframes are immutable; the returned `Arc` may be shared freely.
    #[must_use]
    pub fn get_keyframe(
        &self,
        entity: &E,
        branch: &Branch,
        turn: Turn,
        tick: Tick,
    ) -> Option<Arc<BTreeMap<K, V>>> {
        self.keyframes
            .get(entity)?
            .get(branch)?
            .retrieve_exact(turn, tick)
            .map(Arc::clone)
    }

    /// Stores (or aliases, when the `Arc` is shared) a keyframe for
    /// `entity` at an exact coordinate.
    pub fn set_keyframe(
        &mut self,
        entity: E,
        branch: &Branch,
        turn: Turn,
        tick: Tick,
        payload: Arc<BTreeMap<K, V>>,
    ) {
        self.keyframes
            .entry(entity)
            .or_default()
            .entry(branch.clone())
            .or_default()
            .store_at(turn, tick, payload);
    }

    /// Copies the keyframe `Arc`s recorded at an exact coordinate in
    /// `from` into `to`, for every entity that has one there. Keyframes
    /// are immutable, so the share is safe.
    pub fn alias_keyframe(&mut self, from: &Branch, to: &Branch, turn: Turn, tick: Tick) {
        let shared: Vec<(E, Arc<BTreeMap<K, V>>)> = self
            .keyframes
            .iter()
            .filter_map(|(entity, branches)| {
                branches
                    .get(from)
                    .and_then(|d| d.retrieve_exact(turn, tick))
                    .map(|payload| (entity.clone(), Arc::clone(payload)))
            })
            .collect();
        for (entity, payload) in shared {
            self.set_keyframe(entity, to, turn, tick, payload);
        }
    }

    /// Every entity that has at least one keyframe stored.
    pub fn keyframe_entities(&self) -> impl Iterator<Item = &E> {
        self.keyframes.keys()
    }

    /// The journal for `branch`: after-values, or before-values with
    /// `pre` set. Delta computation scans these.
    #[must_use]
    pub fn journal_for(
        &self,
        branch: &Branch,
        pre: bool,
    ) -> Option<&SettingsTurnDict<JournalRow<E, K, V>>> {
        if pre {
            self.presettings.get(branch)
        } else {
            self.settings.get(branch)
        }
    }

    /// The latest turn at or before `turn` on which `(entity, key)`
    /// changed in `branch`.
    #[must_use]
    pub fn turn_before(&self, entity: &E, key: &K, branch: &Branch, turn: Turn) -> Option<Turn> {
        self.histories
            .get(&(entity.clone(), key.clone()))?
            .get(branch)?
            .latest_at(turn, Tick(i64::MAX))
            .map(|(tn, _, _)| tn)
    }

    /// The earliest turn strictly after `turn` on which `(entity, key)`
    /// changes in `branch`.
    #[must_use]
    pub fn turn_after(&self, entity: &E, key: &K, branch: &Branch, turn: Turn) -> Option<Turn> {
        self.histories
            .get(&(entity.clone(), key.clone()))?
            .get(branch)?
            .iter()
            .map(|(tn, _, _)| tn)
            .find(|tn| *tn > turn)
    }

    fn rebuild_keys_index(&mut self) {
        self.keys.clear();
        for (e, k) in self.histories.keys() {
            self.keys.entry(e.clone()).or_default().insert(k.clone());
        }
    }
}

/// Which source governs a resolution point.
enum Authority<'a, K, V> {
    Raw(&'a Option<V>),
    Keyframe(&'a Arc<BTreeMap<K, V>>),
    Neither,
}

/// Picks the temporally nearer of a raw write and a keyframe; the raw
/// write wins ties, since a keyframe at the same instant describes the
/// state that includes it.
fn pick_authority<'a, K, V>(
    raw: Option<(Turn, Tick, &'a Option<V>)>,
    kf: Option<(Turn, Tick, &'a Arc<BTreeMap<K, V>>)>,
) -> Authority<'a, K, V> {
    match (raw, kf) {
        (Some((rt, rk, v)), Some((ft, fk, map))) => {
            if (ft, fk) > (rt, rk) {
                Authority::Keyframe(map)
            } else {
                Authority::Raw(v)
            }
        }
        (Some((_, _, v)), None) => Authority::Raw(v),
        (None, Some((_, _, map))) => Authority::Keyframe(map),
        (None, None) => Authority::Neither,
    }
}

/// The adds/dels scan shared by enumeration, the keycache, and store-time
/// incremental updates.
///
/// For each key ever written on the entity, the first lineage point with
/// information decides it: a live value adds it, a deletion marker deletes
/// it. When scanning unbounded (no stop time), keys recorded only in the
/// nearest ancestor keyframe are folded in afterwards.
#[allow(clippy::too_many_arguments)]
fn adds_dels_scan<E: EntityKey, K: EntityKey, V: FactValue>(
    keys: &FxHashMap<E, BTreeSet<K>>,
    histories: &FxHashMap<(E, K), FxHashMap<Branch, TurnDict<Option<V>>>>,
    keyframes: &FxHashMap<E, FxHashMap<Branch, SettingsTurnDict<Arc<BTreeMap<K, V>>>>>,
    entity: &E,
    graph: &BranchGraph,
    branch: &Branch,
    turn: Turn,
    tick: Tick,
    stop: Option<&StopTime>,
) -> (BTreeSet<K>, BTreeSet<K>) {
    let mut added = BTreeSet::new();
    let mut deleted = BTreeSet::new();
    let lineage = graph.iter_parent_btt(branch, turn, tick, stop);
    if let Some(keyset) = keys.get(entity) {
        for key in keyset {
            let Some(branches) = histories.get(&(entity.clone(), key.clone())) else {
                continue;
            };
            for (vb, vt, vtk) in &lineage {
                let Some(td) = branches.get(vb) else {
                    continue;
                };
                if let Some((_, _, value)) = td.latest_at(*vt, *vtk) {
                    if value.is_some() {
                        added.insert(key.clone());
                    } else {
                        deleted.insert(key.clone());
                    }
                    break;
                }
            }
        }
    }
    if stop.is_none() {
        if let Some(kf_branches) = keyframes.get(entity) {
            // Nearest keyframe only: a farther ancestor's keyframe may
            // mention keys this one has confirmed absent.
            'lineage: for (vb, vt, vtk) in &lineage {
                if let Some(d) = kf_branches.get(vb) {
                    if let Some((_, _, map)) = d.latest_at(*vt, *vtk) {
                        for key in map.keys() {
                            if !deleted.contains(key) {
                                added.insert(key.clone());
                            }
                        }
                        break 'lineage;
                    }
                }
            }
        }
    }
    (added, deleted)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::ident::{NodeName, StatKey};

    type TestCache = Cache<NodeName, StatKey, &'static str>;

    fn params() -> StoreParams {
        StoreParams {
            planning: false,
            loading: false,
            keycache: KeycacheMode::plain(),
        }
    }

    fn store(
        c: &mut TestCache,
        g: &BranchGraph,
        node: &str,
        key: &str,
        branch: &Branch,
        turn: i64,
        tick: i64,
        value: Option<&'static str>,
    ) {
        c.store(
            NodeName::new(node),
            StatKey::new(key),
            branch,
            Turn(turn),
            Tick(tick),
            value,
            g,
            params(),
        )
        .unwrap();
    }

    fn get<'a>(
        c: &'a TestCache,
        g: &BranchGraph,
        node: &str,
        key: &str,
        branch: &Branch,
        turn: i64,
        tick: i64,
    ) -> Result<&'a &'static str, RetrieveError> {
        c.retrieve(
            &NodeName::new(node),
            &StatKey::new(key),
            branch,
            Turn(turn),
            Tick(tick),
            g,
        )
    }

    #[test]
    fn stored_values_are_retrievable_at_and_after_their_time() {
        let g = BranchGraph::new();
        let trunk = Branch::trunk();
        let mut c = TestCache::new("test");
        store(&mut c, &g, "nodeX", "stat1", &trunk, 0, 0, Some("red"));
        store(&mut c, &g, "nodeX", "stat1", &trunk, 0, 5, Some("blue"));
        assert_eq!(get(&c, &g, "nodeX", "stat1", &trunk, 0, 2).unwrap(), &"red");
        assert_eq!(get(&c, &g, "nodeX", "stat1", &trunk, 0, 5).unwrap(), &"blue");
        assert_eq!(get(&c, &g, "nodeX", "stat1", &trunk, 3, 0).unwrap(), &"blue");
    }

    #[test]
    fn deletion_markers_flag_deleted_not_unknown() {
        let g = BranchGraph::new();
        let trunk = Branch::trunk();
        let mut c = TestCache::new("test");
        store(&mut c, &g, "n", "k", &trunk, 0, 0, Some("v"));
        store(&mut c, &g, "n", "k", &trunk, 1, 0, None);
        assert_eq!(get(&c, &g, "n", "k", &trunk, 0, 0).unwrap(), &"v");
        assert_eq!(
            get(&c, &g, "n", "k", &trunk, 1, 0).unwrap_err(),
            RetrieveError::Deleted
        );
        assert_eq!(
            get(&c, &g, "n", "other", &trunk, 1, 0).unwrap_err(),
            RetrieveError::Unknown
        );
    }

    #[test]
    fn child_branch_inherits_parent_values_before_divergence() {
        let mut g = BranchGraph::new();
        let trunk = Branch::trunk();
        let alt = Branch::new("alt");
        let mut c = TestCache::new("test");
        store(&mut c, &g, "n", "stat", &trunk, 0, 0, Some("1"));
        g.fork(alt.clone(), &trunk, Turn(0), Tick(0)).unwrap();
        store(&mut c, &g, "n", "stat", &alt, 0, 1, Some("2"));
        assert_eq!(get(&c, &g, "n", "stat", &trunk, 0, 1).unwrap(), &"1");
        assert_eq!(get(&c, &g, "n", "stat", &alt, 0, 1).unwrap(), &"2");
        // Before the child's own write, the parent's value governs.
        assert_eq!(get(&c, &g, "n", "stat", &alt, 0, 0).unwrap(), &"1");
    }

    #[test]
    fn keyframe_bridges_truncated_history() {
        let g = BranchGraph::new();
        let trunk = Branch::trunk();
        let mut c = TestCache::new("test");
        let kf: BTreeMap<StatKey, &'static str> =
            [(StatKey::new("k"), "v")].into_iter().collect();
        c.set_keyframe(NodeName::new("n"), &trunk, Turn(10), Tick(0), Arc::new(kf));
        // No raw history at all: the keyframe alone serves reads at and
        // after its time.
        assert_eq!(get(&c, &g, "n", "k", &trunk, 15, 0).unwrap(), &"v");
        assert_eq!(
            get(&c, &g, "n", "missing", &trunk, 15, 0).unwrap_err(),
            RetrieveError::NotInKeyframe
        );
        assert_eq!(
            get(&c, &g, "n", "k", &trunk, 9, 0).unwrap_err(),
            RetrieveError::Unknown
        );
    }

    #[test]
    fn raw_write_beats_older_keyframe_and_loses_to_newer() {
        let g = BranchGraph::new();
        let trunk = Branch::trunk();
        let mut c = TestCache::new("test");
        store(&mut c, &g, "n", "k", &trunk, 0, 0, Some("raw"));
        let kf: BTreeMap<StatKey, &'static str> =
            [(StatKey::new("k"), "framed")].into_iter().collect();
        c.set_keyframe(NodeName::new("n"), &trunk, Turn(5), Tick(0), Arc::new(kf));
        assert_eq!(get(&c, &g, "n", "k", &trunk, 3, 0).unwrap(), &"raw");
        assert_eq!(get(&c, &g, "n", "k", &trunk, 7, 0).unwrap(), &"framed");
        store(&mut c, &g, "n", "k", &trunk, 8, 0, Some("newer"));
        assert_eq!(get(&c, &g, "n", "k", &trunk, 9, 0).unwrap(), &"newer");
    }

    #[test]
    fn keys_at_reflects_adds_and_deletes() {
        let g = BranchGraph::new();
        let trunk = Branch::trunk();
        let mut c = TestCache::new("test");
        store(&mut c, &g, "n", "a", &trunk, 0, 0, Some("1"));
        store(&mut c, &g, "n", "b", &trunk, 0, 1, Some("2"));
        store(&mut c, &g, "n", "a", &trunk, 1, 0, None);
        let node = NodeName::new("n");
        let keys = c.keys_at(&node, &trunk, Turn(0), Tick(1), &g, KeycacheMode::plain());
        assert_eq!(keys.len(), 2);
        let keys = c.keys_at(&node, &trunk, Turn(1), Tick(0), &g, KeycacheMode::plain());
        assert_eq!(keys.iter().collect::<Vec<_>>(), vec![&StatKey::new("b")]);
        assert_eq!(
            c.count_keys(&node, &trunk, Turn(0), Tick(0), &g, KeycacheMode::plain()),
            1
        );
    }

    #[test]
    fn forward_mode_matches_full_recomputation() {
        let g = BranchGraph::new();
        let trunk = Branch::trunk();
        let mut c = TestCache::new("test");
        let node = NodeName::new("n");
        let fwd = KeycacheMode {
            enabled: true,
            forward: true,
        };
        for t in 0..6 {
            store(
                &mut c,
                &g,
                "n",
                &format!("k{t}"),
                &trunk,
                t,
                0,
                Some("v"),
            );
            let memo = c.keys_at(&node, &trunk, Turn(t), Tick(0), &g, fwd);
            let full = c.adds_dels(&node, &trunk, Turn(t), Tick(0), &g, None).0;
            assert_eq!(*memo, full, "divergence at turn {t}");
        }
    }

    #[test]
    fn future_contradictions_finds_disagreeing_writes() {
        let g = BranchGraph::new();
        let trunk = Branch::trunk();
        let mut c = TestCache::new("test");
        store(&mut c, &g, "n", "k", &trunk, 5, 0, Some("planned"));
        let contras = c.future_contradictions(
            &NodeName::new("n"),
            &StatKey::new("k"),
            &trunk,
            Turn(3),
            Tick(0),
            &Some("different"),
        );
        assert_eq!(contras, vec![(Turn(5), Tick(0))]);
        // An agreeing future write is not a contradiction.
        let agree = c.future_contradictions(
            &NodeName::new("n"),
            &StatKey::new("k"),
            &trunk,
            Turn(3),
            Tick(0),
            &Some("planned"),
        );
        assert!(agree.is_empty());
    }

    #[test]
    fn remove_erases_the_write_and_its_journal_rows() {
        let g = BranchGraph::new();
        let trunk = Branch::trunk();
        let mut c = TestCache::new("test");
        store(&mut c, &g, "n", "k", &trunk, 0, 0, Some("a"));
        store(&mut c, &g, "n", "k", &trunk, 2, 0, Some("b"));
        let removed = c.remove(&trunk, Turn(2), Tick(0)).unwrap();
        assert_eq!(removed, (NodeName::new("n"), StatKey::new("k")));
        assert_eq!(get(&c, &g, "n", "k", &trunk, 3, 0).unwrap(), &"a");
        assert!(c
            .journal_for(&trunk, false)
            .map(|j| j.retrieve_exact(Turn(2), Tick(0)).is_none())
            .unwrap_or(true));
    }

    #[test]
    fn truncate_backward_keeps_the_boundary_and_later() {
        let g = BranchGraph::new();
        let trunk = Branch::trunk();
        let mut c = TestCache::new("test");
        store(&mut c, &g, "n", "k", &trunk, 0, 0, Some("a"));
        store(&mut c, &g, "n", "k", &trunk, 5, 0, Some("b"));
        store(&mut c, &g, "n", "k", &trunk, 9, 0, Some("c"));
        c.truncate(&trunk, Turn(5), Tick(0), Direction::Backward);
        assert_eq!(
            get(&c, &g, "n", "k", &trunk, 4, 0).unwrap_err(),
            RetrieveError::Unknown
        );
        assert_eq!(get(&c, &g, "n", "k", &trunk, 5, 0).unwrap(), &"b");
        assert_eq!(get(&c, &g, "n", "k", &trunk, 9, 5).unwrap(), &"c");
    }

    #[test]
    fn planning_cannot_write_behind_planned_ticks() {
        let g = BranchGraph::new();
        let trunk = Branch::trunk();
        let mut c = TestCache::new("test");
        store(&mut c, &g, "n", "k", &trunk, 0, 5, Some("later"));
        let err = c
            .store(
                NodeName::new("n"),
                StatKey::new("k"),
                &trunk,
                Turn(0),
                Tick(2),
                Some("earlier"),
                &g,
                StoreParams {
                    planning: true,
                    loading: false,
                    keycache: KeycacheMode::plain(),
                },
            )
            .unwrap_err();
        assert!(matches!(err, HistoryError::FutureWrite(_)));
    }

    #[test]
    fn journal_records_before_and_after_values() {
        let g = BranchGraph::new();
        let trunk = Branch::trunk();
        let mut c = TestCache::new("test");
        store(&mut c, &g, "n", "k", &trunk, 0, 0, Some("first"));
        store(&mut c, &g, "n", "k", &trunk, 1, 0, Some("second"));
        let post = c.journal_for(&trunk, false).unwrap();
        assert_eq!(
            post.retrieve_exact(Turn(1), Tick(0)).unwrap().value,
            Some("second")
        );
        let pre = c.journal_for(&trunk, true).unwrap();
        assert_eq!(
            pre.retrieve_exact(Turn(1), Tick(0)).unwrap().value,
            Some("first")
        );
        assert_eq!(pre.retrieve_exact(Turn(0), Tick(0)).unwrap().value, None);
    }
}
