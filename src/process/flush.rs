//! Flush acknowledgement rendezvous.
//!
//! A caller asks the engine to flush by writing a control record carrying a
//! fresh id, then blocks in [`FlushListener::wait_for_flush`]. The results
//! reader thread calls [`FlushListener::acknowledge_flush`] when the engine
//! reports that id as done. Acknowledgements are matched by id, so flushes
//! completing in any order reach the right waiter.

use std::collections::HashMap;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Default)]
struct Registry {
    /// Pending flush id -> acknowledged
    pending: HashMap<String, bool>,
    /// Set once the engine is gone; no flush can complete after this
    cleared: bool,
}

/// Registry of pending flushes shared by callers and the results reader.
#[derive(Debug, Default)]
pub struct FlushListener {
    registry: Mutex<Registry>,
    changed: Condvar,
}

impl FlushListener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `id` as pending.
    ///
    /// Call before the flush request reaches the engine so that an
    /// acknowledgement arriving before the caller starts waiting is kept.
    pub fn register(&self, id: &str) {
        let mut registry = self.lock();
        if !registry.cleared {
            registry.pending.entry(id.to_string()).or_insert(false);
        }
    }

    /// Block until `id` is acknowledged or `timeout` elapses.
    ///
    /// Returns `true` if the engine acknowledged the flush, `false` on
    /// timeout or when the listener is cleared. The id is forgotten either
    /// way. An id that was never registered is registered first. A timeout
    /// too large to form a deadline waits without one.
    pub fn wait_for_flush(&self, id: &str, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut registry = self.lock();
        if registry.cleared {
            return false;
        }
        registry.pending.entry(id.to_string()).or_insert(false);

        loop {
            match registry.pending.get(id) {
                Some(true) => {
                    registry.pending.remove(id);
                    return true;
                }
                Some(false) => {}
                None => return false,
            }
            if registry.cleared {
                return false;
            }

            registry = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        registry.pending.remove(id);
                        debug!(flush_id = id, "Flush wait timed out");
                        return false;
                    }
                    match self.changed.wait_timeout(registry, deadline - now) {
                        Ok((guard, _)) => guard,
                        Err(poisoned) => poisoned.into_inner().0,
                    }
                }
                None => self
                    .changed
                    .wait(registry)
                    .unwrap_or_else(PoisonError::into_inner),
            };
        }
    }

    /// Mark `id` as acknowledged and wake its waiter. Unknown ids are
    /// ignored.
    pub fn acknowledge_flush(&self, id: &str) {
        let mut registry = self.lock();
        match registry.pending.get_mut(id) {
            Some(acknowledged) => {
                *acknowledged = true;
                self.changed.notify_all();
            }
            None => debug!(flush_id = id, "Ignoring acknowledgement for unknown flush"),
        }
    }

    /// Drop a registration whose flush request never reached the engine.
    pub fn forget(&self, id: &str) {
        if self.lock().pending.remove(id).is_some() {
            self.changed.notify_all();
        }
    }

    /// Fail every pending flush and refuse new ones.
    ///
    /// Called when the engine process is going away so no caller stays
    /// blocked past its death.
    pub fn clear(&self) {
        let mut registry = self.lock();
        registry.cleared = true;
        registry.pending.clear();
        self.changed.notify_all();
    }

    pub fn is_cleared(&self) -> bool {
        self.lock().cleared
    }

    /// Number of registered flushes still awaiting a waiter.
    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
