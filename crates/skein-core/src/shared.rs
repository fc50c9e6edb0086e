// SPDX-License-Identifier: Apache-2.0
//! The world lock.
//!
//! One `RwLock` serializes all world-mutating operations while letting any
//! number of threads read concurrently. Logical consistency across a
//! compound operation (a node store that must also invalidate edge plans,
//! say) comes from holding the write guard for the whole closure — callers
//! never see a half-applied mutation.
//!
//! Read paths in the caches are deliberately non-mutating (`&self` binary
//! searches), so shared readers under the read guard never contend on
//! interior state.

use std::sync::{Arc, RwLock};

use crate::engine::{Engine, WorldValue};

/// A shareable handle to an [`Engine`] behind the world lock.
pub struct SharedEngine<V: WorldValue> {
    inner: Arc<RwLock<Engine<V>>>,
}

impl<V: WorldValue> Clone for SharedEngine<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V: WorldValue> SharedEngine<V> {
    /// Wraps an engine in the world lock.
    #[must_use]
    pub fn new(engine: Engine<V>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(engine)),
        }
    }

    /// Runs `body` with shared read access.
    ///
    /// A poisoned lock is recovered rather than propagated: the caches'
    /// interior invariants hold at every await-free suspension point, so a
    /// panicked writer cannot leave them torn.
    pub fn read<T>(&self, body: impl FnOnce(&Engine<V>) -> T) -> T {
        let guard = self
            .inner
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        body(&guard)
    }

    /// Runs `body` with exclusive write access, holding the world lock for
    /// the whole compound operation.
    pub fn write<T>(&self, body: impl FnOnce(&mut Engine<V>) -> T) -> T {
        let mut guard = self
            .inner
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        body(&mut guard)
    }
}
