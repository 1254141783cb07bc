//! # Trait hierarchy for the mutate-in-place cache subsystem
//!
//! Two capability boundaries meet here:
//!
//! ```text
//!   ┌───────────────────────────────────────────────────────────────┐
//!   │ Tier<K, V>                                                    │
//!   │                                                               │
//!   │   What the engine CONSUMES: a bounded, thread-safe key→value  │
//!   │   store with point operations and its own eviction policy.    │
//!   │   get / put / invalidate / len / capacity / entries           │
//!   └──────────────────────────────┬────────────────────────────────┘
//!                                  │ consumed by
//!                                  ▼
//!   ┌───────────────────────────────────────────────────────────────┐
//!   │ MutateCache<K, V>                                             │
//!   │                                                               │
//!   │   What the engines PROVIDE: atomic create-or-transform per    │
//!   │   key. modify / get_if_present / size / entries               │
//!   │   + provided: get_or_insert, modify_all                       │
//!   └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! Implementations of [`MutateCache`]: [`MutatingCache`](crate::engine::MutatingCache)
//! (single tier) and [`LeveledCache`](crate::engine::LeveledCache)
//! (level-routed tiers). The in-crate [`Tier`] implementation is
//! [`ClockTier`](crate::tier::ClockTier); any bounded concurrent map
//! with eviction can stand in.
//!
//! ## Thread Safety
//!
//! `Tier` implementations must be safe for concurrent readers and
//! writers on their own; the engine adds per-key mutual exclusion for
//! its read-transform-write cycle on top. Tier-internal eviction runs
//! outside the engine's key locks, so an engine must tolerate a key it
//! wrote being reported absent later.

use std::hash::Hash;
use std::sync::Arc;

use crate::engine::{CreatorFn, ModifyAllParams, ModifyParams};
use crate::error::{DynError, ModifyError};

/// Snapshot of tier-level operation counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TierMetrics {
    pub hits: u64,
    pub misses: u64,
    pub inserts: u64,
    pub updates: u64,
    pub removes: u64,
    pub evictions: u64,
}

/// Bounded key→value store consumed by the cache engines.
///
/// A tier owns values (`Arc<V>`) and enforces a fixed maximum capacity
/// with an eviction policy of its choosing. All operations take `&self`
/// and must be thread-safe.
pub trait Tier<K, V>: Send + Sync {
    /// Fetch a value by key.
    fn get(&self, key: &K) -> Option<Arc<V>>;

    /// Insert or replace the value for a key, evicting per policy if at
    /// capacity.
    fn put(&self, key: K, value: Arc<V>);

    /// Remove a key if present.
    fn invalidate(&self, key: &K);

    /// Current number of entries.
    fn len(&self) -> usize;

    /// Check if the tier is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of entries.
    fn capacity(&self) -> usize;

    /// Snapshot of the current entries. Racy by design: concurrent
    /// mutation may add or drop entries while the snapshot is taken.
    fn entries(&self) -> Vec<(K, Arc<V>)>;

    /// Snapshot the tier's operation counters.
    fn metrics(&self) -> TierMetrics {
        TierMetrics::default()
    }
}

/// Atomic create-or-transform cache operations.
///
/// `modify` is the only write path: every entry is produced or
/// transformed by a caller-supplied function under at-most-one
/// concurrent mutation per key. See
/// [`MutatingCache::modify`](crate::engine::MutatingCache::modify) for
/// the full contract.
pub trait MutateCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Atomically create or transform the entry for `key`.
    fn modify(&self, key: &K, params: &ModifyParams<'_, V>) -> Result<Option<Arc<V>>, ModifyError>;

    /// Read the current value without taking the per-key lock.
    fn get_if_present(&self, key: &K) -> Option<Arc<V>>;

    /// Total number of entries across all tiers.
    fn size(&self) -> u64;

    /// Racy snapshot of all current entries across all tiers.
    fn entries(&self) -> Vec<(K, Arc<V>)>;

    /// Returns the value for `key`, materializing it first if absent.
    ///
    /// Equivalent to `modify` with an identity modifier and
    /// `create_if_missing`, so an existing value is returned untouched.
    /// `creator` falls back to the configured default creator.
    fn get_or_insert(
        &self,
        key: &K,
        creator: Option<&CreatorFn<V>>,
    ) -> Result<Option<Arc<V>>, ModifyError> {
        let identity = |value: Arc<V>| -> Result<Option<Arc<V>>, DynError> { Ok(Some(value)) };
        let mut params = ModifyParams::new().modifier(&identity).create_if_missing(true);
        if let Some(creator) = creator {
            params = params.creator(creator);
        }
        self.modify(key, &params)
    }

    /// Calls `modify` on every current entry whose key and value pass
    /// the supplied predicates (an absent predicate accepts all).
    ///
    /// Not atomic as a whole: the entry set is snapshotted up front, so
    /// concurrent mutation may racily include or exclude entries. Each
    /// individual `modify` remains atomic for its key. The first error
    /// aborts the sweep.
    fn modify_all(&self, params: &ModifyAllParams<'_, K, V>) -> Result<(), ModifyError> {
        for (key, value) in self.entries() {
            if params.accepts(&key, &value) {
                self.modify(&key, &params.modify_params())?;
            }
        }
        Ok(())
    }
}
