//! Composite-key grouping cache for the optimistic store.
//!
//! Records whose keys share a prefix (`prefix!suffix`) are cached
//! together as one [`GroupValue`] entry in a [`LeveledCache`], leveled
//! by the group's current member count — heavily-populated groups land
//! in the tiers reserved for higher levels while sparse groups contend
//! for the low tiers.
//!
//! ## Hydration
//!
//! A group starts *incomplete*: it holds only the suffixes that went
//! through this cache. [`get_all_with_prefix`] upgrades it lazily —
//! the creator scans the durable store for a brand-new group, the
//! modifier merges missing suffixes into an existing one — and marks it
//! complete, all inside the engine's `modify` for the prefix. Single
//! suffix `put`/`get` operate on one slot of the group map under that
//! same per-key lock; no separate synchronization exists anywhere in
//! this file.
//!
//! [`get_all_with_prefix`]: PrefixGroupCache::get_all_with_prefix

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::engine::{LeveledCache, ModifyParams};
use crate::error::{ConfigError, DynError, StoreError};
use crate::tier::ClockTier;
use crate::traits::MutateCache;
use crate::versioned::store::{CommitFn, DurableStore, StoreCache};
use crate::versioned::{StoreRequest, VersionedRecord};

struct GroupInner<P> {
    complete: bool,
    members: FxHashMap<String, VersionedRecord<P>>,
}

/// All cached records sharing one key prefix.
///
/// `complete == false` means the durable store may hold suffixes this
/// group does not. Mutated only while the owning cache entry's per-key
/// lock is held; the inner lock exists so concurrent readers can
/// snapshot safely.
pub struct GroupValue<P> {
    inner: RwLock<GroupInner<P>>,
}

impl<P: Clone> GroupValue<P> {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(GroupInner {
                complete: false,
                members: FxHashMap::default(),
            }),
        }
    }

    /// Whether a full durable-store scan has been merged in.
    pub fn is_complete(&self) -> bool {
        self.inner.read().complete
    }

    /// Number of cached suffixes; this is the group's level.
    pub fn len(&self) -> usize {
        self.inner.read().members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Owned copy of the record for `suffix`, if cached.
    pub fn get(&self, suffix: &str) -> Option<VersionedRecord<P>> {
        self.inner.read().members.get(suffix).cloned()
    }

    /// Owned copy of the whole suffix → record map.
    pub fn snapshot(&self) -> HashMap<String, VersionedRecord<P>> {
        self.inner
            .read()
            .members
            .iter()
            .map(|(suffix, record)| (suffix.clone(), record.clone()))
            .collect()
    }

    fn contains(&self, suffix: &str) -> bool {
        self.inner.read().members.contains_key(suffix)
    }

    fn insert(&self, suffix: String, record: VersionedRecord<P>) {
        self.inner.write().members.insert(suffix, record);
    }

    fn mark_complete(&self) {
        self.inner.write().complete = true;
    }
}

impl<P: Clone> Default for GroupValue<P> {
    fn default() -> Self {
        Self::new()
    }
}

/// [`StoreCache`] grouping records by key prefix in a leveled cache.
pub struct PrefixGroupCache<P> {
    groups: LeveledCache<String, GroupValue<P>>,
    durable: Arc<dyn DurableStore<String, P>>,
    splitter: char,
}

impl<P> PrefixGroupCache<P>
where
    P: Clone + Send + Sync + 'static,
{
    pub const DEFAULT_SPLITTER: char = '!';

    /// Creates a cache with one tier per `[from, to]` interval derived
    /// from `level_split_after` plus a default tier, every tier bounded
    /// by `tier_capacity` groups.
    ///
    /// `level_split_after = [2, i32::MAX]` yields intervals `[0, 2]`
    /// and `[3, i32::MAX]`.
    pub fn new(
        durable: Arc<dyn DurableStore<String, P>>,
        tier_capacity: usize,
        level_split_after: &[i32],
    ) -> Result<Self, ConfigError> {
        Self::with_splitter(
            durable,
            tier_capacity,
            level_split_after,
            Self::DEFAULT_SPLITTER,
        )
    }

    pub fn with_splitter(
        durable: Arc<dyn DurableStore<String, P>>,
        tier_capacity: usize,
        level_split_after: &[i32],
        splitter: char,
    ) -> Result<Self, ConfigError> {
        let mut builder = LeveledCache::builder()
            .level_calculator(|_prefix, group: &GroupValue<P>| group.len() as i32)
            .default_tier(Arc::new(ClockTier::try_new(tier_capacity)?));
        let mut from = 0i32;
        for &to in level_split_after {
            builder = builder.level_tier(
                from,
                to,
                format!("level {from}-{to}"),
                Arc::new(ClockTier::try_new(tier_capacity)?),
            );
            from = to.saturating_add(1);
        }
        Ok(Self {
            groups: builder.try_build()?,
            durable,
            splitter,
        })
    }

    /// The leveled engine holding the groups, for placement inspection.
    pub fn groups(&self) -> &LeveledCache<String, GroupValue<P>> {
        &self.groups
    }

    /// Splits a composite key at the first splitter occurrence. A key
    /// without a splitter maps to `(key, "")`.
    fn split<'k>(&self, key: &'k str) -> (&'k str, &'k str) {
        match key.find(self.splitter) {
            Some(idx) => (&key[..idx], &key[idx + self.splitter.len_utf8()..]),
            None => (key, ""),
        }
    }

    /// Returns owned copies of every record whose key starts with
    /// `prefix`, hydrating the group from the durable store first if it
    /// is not yet complete.
    pub fn get_all_with_prefix(
        &self,
        prefix: &str,
    ) -> Result<HashMap<String, VersionedRecord<P>>, StoreError> {
        let creator = || -> Result<Option<Arc<GroupValue<P>>>, DynError> {
            let group = GroupValue::new();
            self.hydrate(prefix, &group);
            group.mark_complete();
            Ok(Some(Arc::new(group)))
        };
        let modifier = |group: Arc<GroupValue<P>>| -> Result<Option<Arc<GroupValue<P>>>, DynError> {
            if !group.is_complete() {
                self.hydrate(prefix, &group);
                group.mark_complete();
            }
            Ok(Some(group))
        };
        let group = self
            .groups
            .modify(
                &prefix.to_string(),
                &ModifyParams::new()
                    .creator(&creator)
                    .modifier(&modifier)
                    .create_if_missing(true),
            )
            .map_err(StoreError::from_modify)?;
        // The creator always produces a group, so modify always returns
        // one; the snapshot is the caller's copy, never the cached map.
        Ok(group.map(|group| group.snapshot()).unwrap_or_default())
    }

    /// Merges every durable record under `prefix` that the group does
    /// not already hold.
    fn hydrate(&self, prefix: &str, group: &GroupValue<P>) {
        self.durable.for_each(&mut |key, record| {
            let (record_prefix, suffix) = self.split(key.as_str());
            if record_prefix == prefix && !group.contains(suffix) {
                group.insert(suffix.to_string(), record.clone());
            }
        });
    }
}

impl<P> StoreCache<String, P> for PrefixGroupCache<P>
where
    P: Clone + Send + Sync + 'static,
{
    fn put(
        &self,
        key: &String,
        request: &StoreRequest<P>,
        commit: CommitFn<'_, P>,
    ) -> Result<VersionedRecord<P>, StoreError> {
        let (prefix, suffix) = self.split(key.as_str());
        let accepted: Mutex<Option<VersionedRecord<P>>> = Mutex::new(None);
        let creator =
            || -> Result<Option<Arc<GroupValue<P>>>, DynError> { Ok(Some(Arc::new(GroupValue::new()))) };
        let modifier = |group: Arc<GroupValue<P>>| -> Result<Option<Arc<GroupValue<P>>>, DynError> {
            let record = commit(request).map_err(|err| -> DynError { Box::new(err) })?;
            group.insert(suffix.to_string(), record.clone());
            *accepted.lock() = Some(record);
            Ok(Some(group))
        };
        self.groups
            .modify(
                &prefix.to_string(),
                &ModifyParams::new()
                    .creator(&creator)
                    .modifier(&modifier)
                    .create_if_missing(true),
            )
            .map_err(StoreError::from_modify)?;
        Ok(accepted
            .into_inner()
            .expect("commit populated the accepted record"))
    }

    fn get(&self, key: &String) -> Option<VersionedRecord<P>> {
        let (prefix, suffix) = self.split(key.as_str());
        self.groups.get_if_present(&prefix.to_string())?.get(suffix)
    }

    fn version(&self, key: &String) -> Option<i64> {
        StoreCache::get(self, key).map(|record| record.version)
    }

    fn warm(&self, key: &String, record: &VersionedRecord<P>) {
        let (prefix, suffix) = self.split(key.as_str());
        let creator =
            || -> Result<Option<Arc<GroupValue<P>>>, DynError> { Ok(Some(Arc::new(GroupValue::new()))) };
        let modifier = |group: Arc<GroupValue<P>>| -> Result<Option<Arc<GroupValue<P>>>, DynError> {
            // A slot that reappeared through a concurrent writer is
            // authoritative; only fill genuinely missing slots.
            if !group.contains(suffix) {
                group.insert(suffix.to_string(), record.clone());
            }
            Ok(Some(group))
        };
        if let Err(err) = self.groups.modify(
            &prefix.to_string(),
            &ModifyParams::new()
                .creator(&creator)
                .modifier(&modifier)
                .create_if_missing(true),
        ) {
            debug!(error = %err, "swallowing group republish failure");
        }
    }

    fn serializes_by_key(&self) -> bool {
        true
    }
}
