//! Single-tier mutate-in-place cache engine.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────────┐
//! │                     MutatingCache<K, V>::modify                    │
//! │                                                                    │
//! │   reentrancy marker set for (thread, key)?                         │
//! │       │ yes: apply modifier to in-flight value, no lookup/lock     │
//! │       ▼ no                                                         │
//! │   ┌────────────────────────────────────────────────────────────┐   │
//! │   │ per-key lock (KeyLockTable, hash-interned)                 │   │
//! │   │                                                            │   │
//! │   │   value = tier.get(key)                                    │   │
//! │   │   absent + create_if_missing ──► creator()                 │   │
//! │   │   value available ──► modifier(value)                      │   │
//! │   │       None        ──► tier.invalidate(key)                 │   │
//! │   │       Some(new)   ──► write back only if created or        │   │
//! │   │                       !Arc::ptr_eq(new, value)             │   │
//! │   └────────────────────────────────────────────────────────────┘   │
//! └────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Key Concepts
//!
//! - **Identity change detection**: a modifier that mutates its input
//!   through interior mutability and returns the same `Arc` needs no
//!   write-back — the tier already holds that allocation. Structural
//!   equality is never consulted.
//! - **Per-key mutual exclusion**: two `modify` calls for the same key
//!   block on the literal same mutex, obtained by interning the key's
//!   hash in a reference-counted registry. Hash collisions map distinct
//!   keys onto one mutex: extra contention, never lost updates.
//! - **Reentrancy**: a modifier may call `modify` for its own key again
//!   on the same thread when the outer call opted in; the inner call
//!   sees the in-flight value and must return it identically.
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use mutcache::engine::{ModifyParams, MutatingCache};
//! use mutcache::error::DynError;
//! use mutcache::prelude::*;
//!
//! let cache = MutatingCache::<&str, i64>::builder()
//!     .tier(Arc::new(ClockTier::new(128)))
//!     .default_creator(|| Ok(Some(Arc::new(0))))
//!     .try_build()
//!     .unwrap();
//!
//! let add_one = |v: Arc<i64>| -> Result<Option<Arc<i64>>, DynError> {
//!     Ok(Some(Arc::new(*v + 1)))
//! };
//! let params = ModifyParams::new().modifier(&add_one).create_if_missing(true);
//! assert_eq!(*cache.modify(&"counter", &params).unwrap().unwrap(), 1);
//! assert_eq!(*cache.modify(&"counter", &params).unwrap().unwrap(), 2);
//! ```

use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use tracing::trace;

use crate::ds::hash_of;
use crate::engine::{CreatorFn, EngineCore, ModifierFn, ModifyParams};
use crate::error::{ConfigError, ModifyError};
use crate::traits::{MutateCache, Tier};

/// Cache wrapper around one bounded tier where every write goes through
/// an atomic create-or-transform cycle.
///
/// Constructed via [`MutatingCache::builder`]. Cheap to share behind an
/// `Arc`; all methods take `&self`.
pub struct MutatingCache<K, V> {
    core: EngineCore<K, V>,
    tier: Arc<dyn Tier<K, V>>,
}

impl<K, V> MutatingCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    pub fn builder() -> MutatingCacheBuilder<K, V> {
        MutatingCacheBuilder::new()
    }

    /// The tier backing this cache.
    pub fn tier(&self) -> &Arc<dyn Tier<K, V>> {
        &self.tier
    }
}

impl<K, V> fmt::Debug for MutatingCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutatingCache")
            .field("len", &self.tier.len())
            .field("capacity", &self.tier.capacity())
            .finish_non_exhaustive()
    }
}

impl<K, V> MutateCache<K, V> for MutatingCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Atomically create or transform the entry for `key`.
    ///
    /// See the [module docs](self) for the full pipeline. Returns the
    /// final value: `Ok(None)` when the entry was removed by the
    /// modifier, never created, or absent without `create_if_missing`.
    ///
    /// Errors from the creator or modifier propagate with the entry
    /// left in its pre-call state. A nested `modify` for the same key
    /// on this thread without the outer call having enabled
    /// `reentrant` deadlocks on the per-key mutex; enable reentrancy
    /// on the outer call instead.
    fn modify(&self, key: &K, params: &ModifyParams<'_, V>) -> Result<Option<Arc<V>>, ModifyError> {
        if let Some(result) = self.core.reentrant_call(key, params) {
            return result;
        }

        let _key_guard = self.core.locks.acquire(hash_of(key));

        let (value, created) = match self.tier.get(key) {
            Some(value) => (value, false),
            None if params.create_if_missing => match self.core.create(params)? {
                Some(value) => (value, true),
                // Creator declined; nothing is cached.
                None => return Ok(None),
            },
            None => return Ok(None),
        };

        match self.core.transform(key, &value, params)? {
            None => {
                trace!("modify removed entry");
                self.tier.invalidate(key);
                Ok(None)
            }
            Some(next) => {
                if created || !Arc::ptr_eq(&next, &value) {
                    self.tier.put(key.clone(), Arc::clone(&next));
                    trace!(created, "modify wrote entry");
                }
                Ok(Some(next))
            }
        }
    }

    fn get_if_present(&self, key: &K) -> Option<Arc<V>> {
        self.tier.get(key)
    }

    fn size(&self) -> u64 {
        self.tier.len() as u64
    }

    fn entries(&self) -> Vec<(K, Arc<V>)> {
        self.tier.entries()
    }
}

/// Builder for [`MutatingCache`]. `try_build` fails fast on missing
/// configuration.
pub struct MutatingCacheBuilder<K, V> {
    tier: Option<Arc<dyn Tier<K, V>>>,
    default_creator: Option<Box<CreatorFn<V>>>,
    default_modifier: Option<Box<ModifierFn<V>>>,
    lock_shards: usize,
}

impl<K, V> MutatingCacheBuilder<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    fn new() -> Self {
        Self {
            tier: None,
            default_creator: None,
            default_modifier: None,
            lock_shards: 16,
        }
    }

    /// The bounded tier holding the entries. Mandatory.
    pub fn tier(mut self, tier: Arc<dyn Tier<K, V>>) -> Self {
        self.tier = Some(tier);
        self
    }

    /// Creator used when a `modify` call requests creation and supplies
    /// no per-call creator.
    pub fn default_creator<F>(mut self, creator: F) -> Self
    where
        F: Fn() -> Result<Option<Arc<V>>, crate::error::DynError> + Send + Sync + 'static,
    {
        self.default_creator = Some(Box::new(creator));
        self
    }

    /// Modifier used when a `modify` call supplies no per-call
    /// modifier. Defaults to identity (value returned untouched).
    pub fn default_modifier<F>(mut self, modifier: F) -> Self
    where
        F: Fn(Arc<V>) -> Result<Option<Arc<V>>, crate::error::DynError> + Send + Sync + 'static,
    {
        self.default_modifier = Some(Box::new(modifier));
        self
    }

    /// Shard count for the per-key lock registry.
    pub fn lock_shards(mut self, shards: usize) -> Self {
        self.lock_shards = shards;
        self
    }

    pub fn try_build(self) -> Result<MutatingCache<K, V>, ConfigError> {
        let tier = self
            .tier
            .ok_or_else(|| ConfigError::new("no tier configured"))?;
        Ok(MutatingCache {
            core: EngineCore::new(self.default_creator, self.default_modifier, self.lock_shards),
            tier,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DynError;
    use crate::tier::ClockTier;

    fn counter_cache() -> MutatingCache<String, i64> {
        MutatingCache::builder()
            .tier(Arc::new(ClockTier::new(10)))
            .default_creator(|| Ok(Some(Arc::new(0))))
            .default_modifier(|v: Arc<i64>| Ok(Some(Arc::new(*v + 1))))
            .try_build()
            .unwrap()
    }

    #[test]
    fn builder_requires_a_tier() {
        let err = MutatingCache::<u64, u64>::builder().try_build().unwrap_err();
        assert!(err.to_string().contains("tier"));
    }

    #[test]
    fn modify_absent_without_create_is_a_noop() {
        let cache = counter_cache();
        let out = cache
            .modify(&"missing".to_string(), &ModifyParams::new())
            .unwrap();
        assert!(out.is_none());
        assert_eq!(cache.size(), 0);
    }

    #[test]
    fn modify_creates_then_applies_default_modifier() {
        let cache = counter_cache();
        let params = ModifyParams::new().create_if_missing(true);
        // Created as 0, default modifier adds one.
        assert_eq!(*cache.modify(&"k".to_string(), &params).unwrap().unwrap(), 1);
        assert_eq!(*cache.modify(&"k".to_string(), &params).unwrap().unwrap(), 2);
    }

    #[test]
    fn per_call_creator_and_modifier_override_defaults() {
        let cache = counter_cache();
        let creator = || -> Result<Option<Arc<i64>>, DynError> { Ok(Some(Arc::new(1))) };
        let identity = |v: Arc<i64>| -> Result<Option<Arc<i64>>, DynError> { Ok(Some(v)) };
        let params = ModifyParams::new()
            .creator(&creator)
            .modifier(&identity)
            .create_if_missing(true);
        assert_eq!(*cache.modify(&"k".to_string(), &params).unwrap().unwrap(), 1);
    }

    #[test]
    fn declining_creator_caches_nothing() {
        let cache = counter_cache();
        let none = || -> Result<Option<Arc<i64>>, DynError> { Ok(None) };
        let params = ModifyParams::new().creator(&none).create_if_missing(true);
        assert!(cache.modify(&"k".to_string(), &params).unwrap().is_none());
        assert!(cache.get_if_present(&"k".to_string()).is_none());
    }

    #[test]
    fn removing_modifier_evicts_the_entry() {
        let cache = counter_cache();
        let create = ModifyParams::new().create_if_missing(true);
        cache.modify(&"k".to_string(), &create).unwrap();
        assert_eq!(cache.size(), 1);

        let remove = |_: Arc<i64>| -> Result<Option<Arc<i64>>, DynError> { Ok(None) };
        let params = ModifyParams::new().modifier(&remove);
        assert!(cache.modify(&"k".to_string(), &params).unwrap().is_none());
        assert_eq!(cache.size(), 0);
    }

    #[test]
    fn modifier_error_leaves_entry_untouched() {
        let cache = counter_cache();
        let create = ModifyParams::new().create_if_missing(true);
        cache.modify(&"k".to_string(), &create).unwrap();

        let boom = |_: Arc<i64>| -> Result<Option<Arc<i64>>, DynError> { Err("boom".into()) };
        let params = ModifyParams::new().modifier(&boom);
        let err = cache.modify(&"k".to_string(), &params).unwrap_err();
        assert!(matches!(err, ModifyError::Modifier(_)));
        assert_eq!(*cache.get_if_present(&"k".to_string()).unwrap(), 1);
    }

    #[test]
    fn get_or_insert_uses_identity_not_default_modifier() {
        let cache = counter_cache();
        // Default creator yields 0; the default add-one modifier must
        // NOT run for get_or_insert.
        let out = cache.get_or_insert(&"k".to_string(), None).unwrap().unwrap();
        assert_eq!(*out, 0);

        let one = || -> Result<Option<Arc<i64>>, DynError> { Ok(Some(Arc::new(1))) };
        let out = cache
            .get_or_insert(&"other".to_string(), Some(&one))
            .unwrap()
            .unwrap();
        assert_eq!(*out, 1);

        // Existing entries come back untouched.
        let again = cache.get_or_insert(&"k".to_string(), None).unwrap().unwrap();
        assert_eq!(*again, 0);
    }
}
