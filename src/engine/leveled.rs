//! Level-routed multi-tier mutate-in-place cache engine.
//!
//! Extends the single-tier pipeline with placement: after every
//! mutation the entry's *level* is recomputed from `(key, new value)`
//! and the entry is stored in the tier whose interval contains that
//! level, migrating between tiers as the level changes.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                    LeveledCache<K, V>::modify                       │
//! │                                                                     │
//! │   (reentrancy fast path and per-key lock exactly as the             │
//! │    single-tier engine)                                              │
//! │                                                                     │
//! │   locate: scan tiers' get() — disjoint by contract, so at most      │
//! │           one holds the key                                         │
//! │   transform: creator / modifier as usual                            │
//! │                                                                     │
//! │   level = level_calculator(key, new_value)                          │
//! │                                                                     │
//! │   levels:   [0,1]──►tier A   [2,4]──►tier B   [5,MAX]──►tier C      │
//! │   no match ─────────────────►default tier (if configured)           │
//! │                                                                     │
//! │   tier changed OR identity changed:                                 │
//! │       old tier.invalidate(key)   (before the insert!)               │
//! │       new tier.put(key, value)                                      │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Consistency note
//!
//! A cross-tier move invalidates the old tier before inserting into the
//! new one, so a concurrent reader can transiently observe the key as
//! absent from every tier. Readers never see two live values for one
//! key. Tightening this to an atomic swap would change the lock-free
//! read contract of the tiers, so the window is kept and documented.
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use mutcache::engine::{LeveledCache, ModifyParams};
//! use mutcache::error::DynError;
//! use mutcache::prelude::*;
//!
//! let cache = LeveledCache::<&str, String>::builder()
//!     .level_calculator(|_key, value: &String| value.len() as i32)
//!     .level_tier(0, 3, "short", Arc::new(ClockTier::new(64)))
//!     .level_tier(4, i32::MAX, "long", Arc::new(ClockTier::new(16)))
//!     .try_build()
//!     .unwrap();
//!
//! let creator = || -> Result<Option<Arc<String>>, DynError> {
//!     Ok(Some(Arc::new("hi".to_string())))
//! };
//! let params = ModifyParams::new().creator(&creator).create_if_missing(true);
//! cache.modify(&"greeting", &params).unwrap();
//! let (tier, _) = cache.get_tier_and_value_if_present(&"greeting").unwrap();
//! assert_eq!(tier.name(), "short");
//!
//! let grow = |_: Arc<String>| -> Result<Option<Arc<String>>, DynError> {
//!     Ok(Some(Arc::new("hello world".to_string())))
//! };
//! cache
//!     .modify(&"greeting", &ModifyParams::new().modifier(&grow))
//!     .unwrap();
//! let (tier, _) = cache.get_tier_and_value_if_present(&"greeting").unwrap();
//! assert_eq!(tier.name(), "long");
//! ```

use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use tracing::debug;

use crate::ds::hash_of;
use crate::engine::{CreatorFn, EngineCore, LevelFn, ModifierFn, ModifyParams};
use crate::error::{ConfigError, ModifyError};
use crate::traits::{MutateCache, Tier};

struct TierSlot<K, V> {
    name: Arc<str>,
    tier: Arc<dyn Tier<K, V>>,
}

struct Interval {
    from: i32,
    to: i32,
    tier: usize,
}

/// A tier as reported by
/// [`LeveledCache::get_tier_and_value_if_present`].
pub struct TierRef<'a, K, V> {
    name: &'a str,
    tier: &'a Arc<dyn Tier<K, V>>,
}

impl<'a, K, V> TierRef<'a, K, V> {
    /// Name the tier was registered under (`"default"` for the default
    /// tier).
    pub fn name(&self) -> &'a str {
        self.name
    }

    /// Handle to the tier itself.
    pub fn handle(&self) -> &'a Arc<dyn Tier<K, V>> {
        self.tier
    }
}

/// Cache engine routing entries across level-bound tiers.
///
/// Constructed via [`LeveledCache::builder`]; construction fails fast
/// when no level calculator is set, no tier is configured, or the
/// configured intervals overlap.
pub struct LeveledCache<K, V> {
    core: EngineCore<K, V>,
    tiers: Vec<TierSlot<K, V>>,
    default_tier: Option<usize>,
    intervals: Vec<Interval>,
    level_fn: Box<LevelFn<K, V>>,
}

impl<K, V> LeveledCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    pub fn builder() -> LeveledCacheBuilder<K, V> {
        LeveledCacheBuilder::new()
    }

    /// Like [`get_if_present`](MutateCache::get_if_present), but also
    /// reports which tier currently holds the value.
    pub fn get_tier_and_value_if_present(&self, key: &K) -> Option<(TierRef<'_, K, V>, Arc<V>)> {
        let (idx, value) = self.locate(key)?;
        Some((self.tier_ref(idx), value))
    }

    /// The tier registered under `name`, if any.
    pub fn tier_named(&self, name: &str) -> Option<&Arc<dyn Tier<K, V>>> {
        self.tiers
            .iter()
            .find(|slot| &*slot.name == name)
            .map(|slot| &slot.tier)
    }

    fn tier_ref(&self, idx: usize) -> TierRef<'_, K, V> {
        let slot = &self.tiers[idx];
        TierRef {
            name: &slot.name,
            tier: &slot.tier,
        }
    }

    /// Scans all tiers for the key. Tiers are disjoint by contract, so
    /// the first hit is the only one.
    fn locate(&self, key: &K) -> Option<(usize, Arc<V>)> {
        self.tiers
            .iter()
            .enumerate()
            .find_map(|(idx, slot)| slot.tier.get(key).map(|value| (idx, value)))
    }

    fn tier_for_level(&self, level: i32) -> Option<usize> {
        self.intervals
            .iter()
            .find(|iv| iv.from <= level && level <= iv.to)
            .map(|iv| iv.tier)
            .or(self.default_tier)
    }
}

impl<K, V> fmt::Debug for LeveledCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeveledCache")
            .field("tiers", &self.tiers.len())
            .field("intervals", &self.intervals.len())
            .finish_non_exhaustive()
    }
}

impl<K, V> MutateCache<K, V> for LeveledCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Atomically create or transform the entry for `key`, then place
    /// it in the tier matching its recomputed level.
    ///
    /// Same contract as
    /// [`MutatingCache::modify`](crate::engine::MutatingCache::modify),
    /// plus migration: when the level's tier differs from the one
    /// currently holding the entry, the entry is invalidated there
    /// before being inserted into the new tier (see the module docs for
    /// the transient-miss window this opens). When the computed level
    /// is outside every interval and no default tier is configured, the
    /// value is returned but not cached.
    fn modify(&self, key: &K, params: &ModifyParams<'_, V>) -> Result<Option<Arc<V>>, ModifyError> {
        if let Some(result) = self.core.reentrant_call(key, params) {
            return result;
        }

        let _key_guard = self.core.locks.acquire(hash_of(key));

        let located = self.locate(key);
        let (old_idx, value, created) = match located {
            Some((idx, value)) => (Some(idx), value, false),
            None if params.create_if_missing => match self.core.create(params)? {
                Some(value) => (None, value, true),
                None => return Ok(None),
            },
            None => return Ok(None),
        };
        debug_assert!(created || old_idx.is_some());

        match self.core.transform(key, &value, params)? {
            None => {
                if let Some(idx) = old_idx {
                    self.tiers[idx].tier.invalidate(key);
                }
                Ok(None)
            }
            Some(next) => {
                let level = (self.level_fn)(key, next.as_ref());
                let new_idx = self.tier_for_level(level);
                let moved = old_idx != new_idx;
                if moved || !Arc::ptr_eq(&next, &value) {
                    // Old tier first; see the module consistency note.
                    if moved {
                        if let Some(idx) = old_idx {
                            self.tiers[idx].tier.invalidate(key);
                            debug!(
                                level,
                                from = &*self.tiers[idx].name,
                                to = new_idx.map(|i| &*self.tiers[i].name).unwrap_or("none"),
                                "entry migrated"
                            );
                        }
                    }
                    if let Some(idx) = new_idx {
                        self.tiers[idx].tier.put(key.clone(), Arc::clone(&next));
                    }
                }
                Ok(Some(next))
            }
        }
    }

    fn get_if_present(&self, key: &K) -> Option<Arc<V>> {
        self.locate(key).map(|(_, value)| value)
    }

    fn size(&self) -> u64 {
        self.tiers.iter().map(|slot| slot.tier.len() as u64).sum()
    }

    fn entries(&self) -> Vec<(K, Arc<V>)> {
        self.tiers
            .iter()
            .flat_map(|slot| slot.tier.entries())
            .collect()
    }
}

/// Builder for [`LeveledCache`]. `try_build` fails fast on missing or
/// inconsistent configuration.
pub struct LeveledCacheBuilder<K, V> {
    default_tier: Option<Arc<dyn Tier<K, V>>>,
    levels: Vec<(i32, i32, String, Arc<dyn Tier<K, V>>)>,
    level_fn: Option<Box<LevelFn<K, V>>>,
    default_creator: Option<Box<CreatorFn<V>>>,
    default_modifier: Option<Box<ModifierFn<V>>>,
    lock_shards: usize,
}

impl<K, V> LeveledCacheBuilder<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    fn new() -> Self {
        Self {
            default_tier: None,
            levels: Vec::new(),
            level_fn: None,
            default_creator: None,
            default_modifier: None,
            lock_shards: 16,
        }
    }

    /// Tier used for levels outside every configured interval.
    pub fn default_tier(mut self, tier: Arc<dyn Tier<K, V>>) -> Self {
        self.default_tier = Some(tier);
        self
    }

    /// Binds the inclusive level interval `[from, to]` to `tier`.
    pub fn level_tier(
        mut self,
        from: i32,
        to: i32,
        name: impl Into<String>,
        tier: Arc<dyn Tier<K, V>>,
    ) -> Self {
        self.levels.push((from, to, name.into(), tier));
        self
    }

    /// The level calculator, invoked once per modification. Mandatory.
    pub fn level_calculator<F>(mut self, level_fn: F) -> Self
    where
        F: Fn(&K, &V) -> i32 + Send + Sync + 'static,
    {
        self.level_fn = Some(Box::new(level_fn));
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
    /// modifier. Defaults to identity.
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

    pub fn try_build(self) -> Result<LeveledCache<K, V>, ConfigError> {
        let level_fn = self
            .level_fn
            .ok_or_else(|| ConfigError::new("no level calculator configured"))?;
        if self.default_tier.is_none() && self.levels.is_empty() {
            return Err(ConfigError::new("no tier configured"));
        }

        let mut tiers = Vec::new();
        let default_tier = self.default_tier.map(|tier| {
            tiers.push(TierSlot {
                name: Arc::from("default"),
                tier,
            });
            0
        });

        let mut levels = self.levels;
        levels.sort_by_key(|(from, _, _, _)| *from);
        let mut intervals: Vec<Interval> = Vec::with_capacity(levels.len());
        for (from, to, name, tier) in levels {
            if from > to {
                return Err(ConfigError::new(format!(
                    "empty level interval [{from}, {to}] for tier '{name}'"
                )));
            }
            if let Some(prev) = intervals.last() {
                if prev.to >= from {
                    return Err(ConfigError::new(format!(
                        "overlapping level intervals: [{}, {}] and [{from}, {to}]",
                        prev.from, prev.to
                    )));
                }
            }
            let idx = tiers.len();
            tiers.push(TierSlot {
                name: Arc::from(name),
                tier,
            });
            intervals.push(Interval {
                from,
                to,
                tier: idx,
            });
        }

        Ok(LeveledCache {
            core: EngineCore::new(self.default_creator, self.default_modifier, self.lock_shards),
            tiers,
            default_tier,
            intervals,
            level_fn,
        })
    }
}
