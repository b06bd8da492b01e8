//! Single-slot result cache.
//!
//! Holds the one `CacheEntry` display surfaces see.  Cycles may overlap, so
//! every write goes through `publish`, which drops results from cycles that
//! started before the one already stored (or before the last `fence`).
//! Accepted entries are pushed to subscribers while the slot lock is held,
//! so push order always matches store order and a `snapshot` taken after a
//! push never sees an older entry.

use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::broadcast;
use tracing::debug;

use crate::protocol::{CacheEntry, CycleId};

const PUSH_CAPACITY: usize = 16;

struct Slot {
    entry: CacheEntry,
    /// Lowest cycle id still allowed to publish.
    floor: CycleId,
}

pub struct ResultCache {
    slot: RwLock<Slot>,
    push_tx: broadcast::Sender<CacheEntry>,
}

impl Default for ResultCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ResultCache {
    pub fn new() -> Self {
        let (push_tx, _) = broadcast::channel(PUSH_CAPACITY);
        Self {
            slot: RwLock::new(Slot {
                entry: CacheEntry::Uninitialized,
                floor: 0,
            }),
            push_tx,
        }
    }

    /// Store `entry` unless it is a superseded cycle result.  Returns whether
    /// the entry was accepted (and pushed).
    pub fn publish(&self, entry: CacheEntry) -> bool {
        let mut slot = self.write();
        if let Some(id) = entry.cycle_id() {
            if id < slot.floor {
                debug!(
                    "cache: dropping stale cycle {} (floor {})",
                    id, slot.floor
                );
                return false;
            }
            slot.floor = id + 1;
        }
        slot.entry = entry.clone();
        // No subscribers is fine; late surfaces pull with `snapshot`.
        let _ = self.push_tx.send(entry);
        true
    }

    /// Refuse results from every cycle with an id below `floor`.
    pub fn fence(&self, floor: CycleId) {
        let mut slot = self.write();
        slot.floor = slot.floor.max(floor);
    }

    /// Back to `Uninitialized`.  Not pushed: teardown is followed by a fresh
    /// initialize, which publishes on its own.
    pub fn reset(&self) {
        self.write().entry = CacheEntry::Uninitialized;
    }

    pub fn snapshot(&self) -> CacheEntry {
        self.read().entry.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheEntry> {
        self.push_tx.subscribe()
    }

    // A poisoned lock only means a panic elsewhere while holding it; the
    // slot itself is always left consistent.
    fn read(&self) -> RwLockReadGuard<'_, Slot> {
        self.slot.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Slot> {
        self.slot.write().unwrap_or_else(|e| e.into_inner())
    }
}
