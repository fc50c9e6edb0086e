// SPDX-License-Identifier: Apache-2.0
//! Global facts: values scoped to the whole world rather than any entity.
//!
//! A thin forwarding wrapper over [`Cache`] with the unit entity. Used for
//! universal stats and for the graph-existence registry.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::cache::{Cache, StoreParams};
use crate::errors::{HistoryError, RetrieveError};
use crate::keycache::KeycacheMode;
use crate::time::{Branch, BranchGraph, Tick, Turn};

/// A [`Cache`] of world-scoped facts.
pub struct EntitylessCache<K, V> {
    inner: Cache<(), K, V>,
}

impl<K, V> EntitylessCache<K, V>
where
    K: crate::cache::EntityKey,
    V: crate::cache::FactValue,
{
    /// Creates an empty cache named for diagnostics.
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        Self {
            inner: Cache::new(name),
        }
    }

    /// Writes `value` as the fact for `key` at the given time.
    ///
    /// # Errors
    ///
    /// Propagates history-ordering violations; see [`Cache::store`].
    #[allow(clippy::too_many_arguments)]
    pub fn store(
        &mut self,
        key: K,
        branch: &Branch,
        turn: Turn,
        tick: Tick,
        value: Option<V>,
        graph: &BranchGraph,
        params: StoreParams,
    ) -> Result<(), HistoryError> {
        self.inner
            .store((), key, branch, turn, tick, value, graph, params)
    }

    /// Resolves the fact in effect at a time; see [`Cache::retrieve`].
    pub fn retrieve(
        &self,
        key: &K,
        branch: &Branch,
        turn: Turn,
        tick: Tick,
        graph: &BranchGraph,
    ) -> Result<&V, RetrieveError> {
        self.inner.retrieve(&(), key, branch, turn, tick, graph)
    }

    /// The set of keys extant at a time.
    pub fn keys_at(
        &mut self,
        branch: &Branch,
        turn: Turn,
        tick: Tick,
        graph: &BranchGraph,
        mode: KeycacheMode,
    ) -> Arc<BTreeSet<K>> {
        self.inner.keys_at(&(), branch, turn, tick, graph, mode)
    }

    /// Whether `key` resolves to a live value at a time.
    #[must_use]
    pub fn contains_key_at(
        &self,
        key: &K,
        branch: &Branch,
        turn: Turn,
        tick: Tick,
        graph: &BranchGraph,
    ) -> bool {
        self.inner
            .contains_key_at(&(), key, branch, turn, tick, graph)
    }

    /// Times strictly after the coordinate where the stored value
    /// disagrees with `value`; see [`Cache::future_contradictions`].
    #[must_use]
    pub fn future_contradictions(
        &self,
        key: &K,
        branch: &Branch,
        turn: Turn,
        tick: Tick,
        value: &Option<V>,
    ) -> Vec<(Turn, Tick)> {
        self.inner
            .future_contradictions(&(), key, branch, turn, tick, value)
    }

    /// The underlying generic cache.
    #[must_use]
    pub fn raw(&self) -> &Cache<(), K, V> {
        &self.inner
    }

    /// Mutable access to the underlying generic cache.
    pub fn raw_mut(&mut self) -> &mut Cache<(), K, V> {
        &mut self.inner
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::ident::StatKey;

    #[test]
    fn world_scoped_values_resolve_like_any_other() {
        let g = BranchGraph::new();
        let trunk = Branch::trunk();
        let mut c: EntitylessCache<StatKey, i64> = EntitylessCache::new("universal");
        c.store(
            StatKey::new("year"),
            &trunk,
            Turn(0),
            Tick(0),
            Some(1405),
            &g,
            StoreParams {
                planning: false,
                loading: false,
                keycache: KeycacheMode::plain(),
            },
        )
        .unwrap();
        assert_eq!(
            c.retrieve(&StatKey::new("year"), &trunk, Turn(3), Tick(0), &g)
                .unwrap(),
            &1405
        );
        assert!(c.contains_key_at(&StatKey::new("year"), &trunk, Turn(0), Tick(0), &g));
        assert_eq!(
            c.retrieve(&StatKey::new("era"), &trunk, Turn(3), Tick(0), &g)
                .unwrap_err(),
            RetrieveError::Unknown
        );
    }
}
