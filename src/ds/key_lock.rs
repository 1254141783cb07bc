//! Per-key lock registry with bounded memory for churning keysets.
//!
//! Serializes mutations to the same key without keeping one mutex alive
//! per key ever seen. Lock slots are keyed by the key's hash and
//! reference-counted: a slot is created on first acquire and removed as
//! soon as the last holder releases it.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        KeyLockTable                              │
//! │                                                                  │
//! │   hash(key) ──► shard = hash & mask                              │
//! │                                                                  │
//! │   ┌─────────────┐ ┌─────────────┐       ┌─────────────┐          │
//! │   │   Shard 0   │ │   Shard 1   │  ...  │   Shard n   │          │
//! │   │ Mutex<map>  │ │ Mutex<map>  │       │ Mutex<map>  │          │
//! │   │ hash→slot   │ │ hash→slot   │       │ hash→slot   │          │
//! │   └─────────────┘ └─────────────┘       └─────────────┘          │
//! │                                                                  │
//! │   slot = { holders: usize, raw: Arc<RawMutex> }                  │
//! │                                                                  │
//! │   acquire: bump holders under the shard lock, then block on      │
//! │            the key mutex OUTSIDE it                              │
//! │   release: unlock the key mutex, then drop the slot when         │
//! │            holders reaches zero                                  │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Key Concepts
//!
//! - Two acquires for the same hash always block on the literal same
//!   mutex, even when the slot had to be created concurrently: slot
//!   creation is serialized by the shard lock.
//! - Distinct keys whose hashes collide share one lock. This causes
//!   unnecessary but harmless contention; mutual exclusion per key is
//!   still guaranteed. Known limitation, not a correctness issue.
//! - The table never grows beyond the number of currently-held (or
//!   currently-contended) locks, so long-lived caches with churning
//!   keysets do not leak lock slots.
//!
//! The key mutex is not reentrant: acquiring the same hash twice on one
//! thread deadlocks. The cache engine avoids this by checking its
//! reentrancy markers before touching the table.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::lock_api::RawMutex as _;
use parking_lot::{Mutex, RawMutex};
use rustc_hash::FxHashMap;

/// Default number of shards guarding the slot maps.
const DEFAULT_SHARDS: usize = 16;

/// Hashes a key with the std `DefaultHasher`.
///
/// The engine uses this one hash both for shard selection and as the
/// lock-slot identity.
pub fn hash_of<K: Hash + ?Sized>(key: &K) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

struct LockSlot {
    holders: usize,
    raw: Arc<RawMutex>,
}

/// Sharded, reference-counted registry of per-key mutexes.
pub struct KeyLockTable {
    shards: Box<[Mutex<FxHashMap<u64, LockSlot>>]>,
    mask: usize,
}

impl KeyLockTable {
    /// Creates a table with the default shard count.
    pub fn new() -> Self {
        Self::with_shards(DEFAULT_SHARDS)
    }

    /// Creates a table with `shards` shards, rounded up to a power of
    /// two and clamped to at least 1.
    pub fn with_shards(shards: usize) -> Self {
        let shards = shards.max(1).next_power_of_two();
        let shards = (0..shards)
            .map(|_| Mutex::new(FxHashMap::default()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let mask = shards.len() - 1;
        Self { shards, mask }
    }

    fn shard_for(&self, hash: u64) -> &Mutex<FxHashMap<u64, LockSlot>> {
        &self.shards[(hash as usize) & self.mask]
    }

    /// Blocks until the lock for `hash` is held, returning a guard that
    /// releases it on drop.
    pub fn acquire(&self, hash: u64) -> KeyGuard<'_> {
        let raw = {
            let mut shard = self.shard_for(hash).lock();
            let slot = shard.entry(hash).or_insert_with(|| LockSlot {
                holders: 0,
                raw: Arc::new(RawMutex::INIT),
            });
            slot.holders += 1;
            Arc::clone(&slot.raw)
        };
        // Block outside the shard lock so waiters on one key do not
        // stall unrelated keys in the same shard.
        raw.lock();
        KeyGuard {
            table: self,
            hash,
            raw,
            _not_send: PhantomData,
        }
    }

    /// Number of live lock slots (held or contended). Used by tests to
    /// assert the table does not grow without bound.
    pub fn slot_count(&self) -> usize {
        self.shards.iter().map(|shard| shard.lock().len()).sum()
    }

    fn release(&self, hash: u64) {
        let mut shard = self.shard_for(hash).lock();
        if let Some(slot) = shard.get_mut(&hash) {
            slot.holders -= 1;
            if slot.holders == 0 {
                shard.remove(&hash);
            }
        }
    }
}

impl Default for KeyLockTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Holds the per-key mutex for one hash; released on drop.
pub struct KeyGuard<'a> {
    table: &'a KeyLockTable,
    hash: u64,
    raw: Arc<RawMutex>,
    // The raw mutex must be unlocked on the thread that locked it.
    _not_send: PhantomData<*const ()>,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        // Safety: this guard is the proof that `raw` was locked by this
        // thread in `acquire`, and guards are neither Send nor Clone.
        unsafe { self.raw.unlock() };
        self.table.release(self.hash);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier};
    use std::thread;

    use super::*;

    #[test]
    fn slots_are_reclaimed_after_release() {
        let table = KeyLockTable::new();
        {
            let _a = table.acquire(hash_of(&"a"));
            let _b = table.acquire(hash_of(&"b"));
            assert_eq!(table.slot_count(), 2);
        }
        assert_eq!(table.slot_count(), 0);
    }

    #[test]
    fn same_hash_serializes_critical_sections() {
        let table = Arc::new(KeyLockTable::with_shards(4));
        let in_section = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let table = Arc::clone(&table);
                let in_section = Arc::clone(&in_section);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    for _ in 0..200 {
                        let _guard = table.acquire(42);
                        let seen = in_section.fetch_add(1, Ordering::SeqCst);
                        assert_eq!(seen, 0, "two threads inside one key's section");
                        in_section.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(table.slot_count(), 0);
    }

    #[test]
    fn distinct_hashes_do_not_block_each_other() {
        let table = KeyLockTable::new();
        let _a = table.acquire(1);
        // Must not deadlock: different hash, different mutex.
        let _b = table.acquire(2);
    }
}
