//! Concurrent bounded tier with Clock (second-chance) eviction.
//!
//! Approximates LRU without per-access list surgery: a read only flips
//! an atomic reference bit, so `get` needs nothing stronger than the
//! shared read lock.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        ClockTier<K, V>                           │
//! │                                                                  │
//! │   RwLock ┌────────────────────────────────────────────────────┐  │
//! │          │ index: FxHashMap<K, slot#>                         │  │
//! │          │ slots: Vec<Option<{key, Arc<V>, referenced}>>      │  │
//! │          │ hand:  next eviction candidate                     │  │
//! │          └────────────────────────────────────────────────────┘  │
//! │                                                                  │
//! │   get:  read lock, set referenced (atomic), clone Arc            │
//! │   put:  write lock; at capacity sweep from hand, clear           │
//! │         referenced bits, evict first unreferenced slot           │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Eviction is driven entirely by `put` under the tier's own write
//! lock, never by the engines' per-key locks; an engine observing a
//! previously-written key as absent is expected behavior.
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use mutcache::tier::ClockTier;
//! use mutcache::traits::Tier;
//!
//! let tier: ClockTier<u64, &str> = ClockTier::new(2);
//! tier.put(1, Arc::new("one"));
//! tier.put(2, Arc::new("two"));
//! tier.put(3, Arc::new("three")); // evicts one unreferenced entry
//! assert_eq!(tier.len(), 2);
//! ```

use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::error::ConfigError;
use crate::traits::{Tier, TierMetrics};

/// Tier operation counters, tracked with relaxed atomics.
#[derive(Debug, Default)]
struct TierCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    inserts: AtomicU64,
    updates: AtomicU64,
    removes: AtomicU64,
    evictions: AtomicU64,
}

impl TierCounters {
    fn snapshot(&self) -> TierMetrics {
        TierMetrics {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            inserts: self.inserts.load(Ordering::Relaxed),
            updates: self.updates.load(Ordering::Relaxed),
            removes: self.removes.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

struct Slot<K, V> {
    key: K,
    value: Arc<V>,
    referenced: AtomicBool,
}

struct ClockInner<K, V> {
    index: FxHashMap<K, usize>,
    slots: Vec<Option<Slot<K, V>>>,
    free: Vec<usize>,
    hand: usize,
}

impl<K, V> ClockInner<K, V>
where
    K: Eq + Hash,
{
    /// Frees one unreferenced slot, sweeping from the hand and clearing
    /// reference bits on the way. Only called when every slot is
    /// occupied, so the sweep terminates within two passes.
    fn evict_one(&mut self) -> usize {
        loop {
            let idx = self.hand;
            self.hand = (self.hand + 1) % self.slots.len();
            let victim = match &self.slots[idx] {
                None => continue,
                Some(slot) => !slot.referenced.swap(false, Ordering::Relaxed),
            };
            if victim {
                if let Some(slot) = self.slots[idx].take() {
                    self.index.remove(&slot.key);
                }
                return idx;
            }
        }
    }
}

/// Fixed-capacity concurrent tier with Clock eviction.
pub struct ClockTier<K, V> {
    inner: RwLock<ClockInner<K, V>>,
    counters: TierCounters,
    capacity: usize,
}

impl<K, V> ClockTier<K, V>
where
    K: Eq + Hash + Clone,
{
    /// Creates a tier holding at most `capacity` entries.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero. See [`try_new`](Self::try_new) for
    /// the fallible variant.
    pub fn new(capacity: usize) -> Self {
        match Self::try_new(capacity) {
            Ok(tier) => tier,
            Err(err) => panic!("{err}"),
        }
    }

    /// Fallible constructor for user-configurable capacities.
    ///
    /// Returns [`ConfigError`] if `capacity` is zero.
    pub fn try_new(capacity: usize) -> Result<Self, ConfigError> {
        if capacity == 0 {
            return Err(ConfigError::new("tier capacity must be greater than zero"));
        }
        Ok(Self {
            inner: RwLock::new(ClockInner {
                index: FxHashMap::default(),
                slots: Vec::with_capacity(capacity),
                free: Vec::new(),
                hand: 0,
            }),
            counters: TierCounters::default(),
            capacity,
        })
    }
}

impl<K, V> Tier<K, V> for ClockTier<K, V>
where
    K: Eq + Hash + Clone + Send + Sync,
    V: Send + Sync,
{
    fn get(&self, key: &K) -> Option<Arc<V>> {
        let inner = self.inner.read();
        let slot = inner
            .index
            .get(key)
            .and_then(|&idx| inner.slots[idx].as_ref());
        match slot {
            Some(slot) => {
                slot.referenced.store(true, Ordering::Relaxed);
                TierCounters::inc(&self.counters.hits);
                Some(Arc::clone(&slot.value))
            }
            None => {
                TierCounters::inc(&self.counters.misses);
                None
            }
        }
    }

    fn put(&self, key: K, value: Arc<V>) {
        let mut inner = self.inner.write();
        if let Some(&idx) = inner.index.get(&key) {
            if let Some(slot) = inner.slots[idx].as_mut() {
                slot.value = value;
                slot.referenced.store(true, Ordering::Relaxed);
                TierCounters::inc(&self.counters.updates);
                return;
            }
        }

        let idx = if let Some(idx) = inner.free.pop() {
            idx
        } else if inner.slots.len() < self.capacity {
            inner.slots.push(None);
            inner.slots.len() - 1
        } else {
            TierCounters::inc(&self.counters.evictions);
            inner.evict_one()
        };

        inner.index.insert(key.clone(), idx);
        inner.slots[idx] = Some(Slot {
            key,
            value,
            referenced: AtomicBool::new(true),
        });
        TierCounters::inc(&self.counters.inserts);
    }

    fn invalidate(&self, key: &K) {
        let mut inner = self.inner.write();
        if let Some(idx) = inner.index.remove(key) {
            inner.slots[idx] = None;
            inner.free.push(idx);
            TierCounters::inc(&self.counters.removes);
        }
    }

    fn len(&self) -> usize {
        self.inner.read().index.len()
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn entries(&self) -> Vec<(K, Arc<V>)> {
        self.inner
            .read()
            .slots
            .iter()
            .flatten()
            .map(|slot| (slot.key.clone(), Arc::clone(&slot.value)))
            .collect()
    }

    fn metrics(&self) -> TierMetrics {
        self.counters.snapshot()
    }
}
