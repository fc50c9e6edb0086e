// SPDX-License-Identifier: Apache-2.0
//! Best-effort background cache pre-warming.
//!
//! A dedicated worker thread receives target times over a channel and
//! pages their history windows in ahead of the simulation reaching them.
//! This is strictly an optimization hint: every read path resolves
//! correctly through the synchronous loading fallback if the warm-up never
//! ran, and warm-up failures are logged and dropped, never surfaced.

use std::sync::mpsc;
use std::thread::JoinHandle;

use tracing::{debug, warn};

use crate::engine::WorldValue;
use crate::shared::SharedEngine;
use crate::time::Time;

/// Handle to the background arranger thread. Dropping it shuts the worker
/// down after it drains pending requests.
pub struct CacheArranger {
    sender: Option<mpsc::Sender<Time>>,
    worker: Option<JoinHandle<()>>,
}

impl CacheArranger {
    /// Spawns the worker over a shared engine handle.
    #[must_use]
    pub fn spawn<V>(engine: SharedEngine<V>) -> Self
    where
        V: WorldValue + 'static,
    {
        let (sender, receiver) = mpsc::channel::<Time>();
        let worker = std::thread::spawn(move || {
            while let Ok(target) = receiver.recv() {
                debug!(%target, "pre-warm");
                let outcome = engine.write(|e| {
                    let Time { branch, turn, tick } = target.clone();
                    e.load_at(&branch, turn, tick)
                });
                if let Err(err) = outcome {
                    // Best effort only; the synchronous path will retry.
                    warn!(%target, %err, "pre-warm failed");
                }
            }
        });
        Self {
            sender: Some(sender),
            worker: Some(worker),
        }
    }

    /// Asks the worker to pre-warm the window around `target`. Returns
    /// whether the request was accepted (it is not once the worker has
    /// shut down).
    pub fn request(&self, target: Time) -> bool {
        self.sender
            .as_ref()
            .is_some_and(|s| s.send(target).is_ok())
    }
}

impl Drop for CacheArranger {
    fn drop(&mut self) {
        drop(self.sender.take());
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
