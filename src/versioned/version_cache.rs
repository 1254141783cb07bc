//! Version-number cache for the optimistic store.
//!
//! Caches only the version per key — enough to answer the store's
//! version check without touching the durable map, at a fraction of the
//! memory of caching payloads. `get` always misses by design.
//!
//! The interesting part is the write path: the version check and the
//! durable write run *inside* the engine's modifier for the key, so the
//! engine's per-key lock is the store's serialization and
//! [`serializes_by_key`](StoreCache::serializes_by_key) is true. A
//! rejected check leaves no cache entry behind: created values are only
//! written back after the modifier succeeds.

use std::hash::Hash;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::engine::{ModifyParams, MutatingCache};
use crate::error::{ConfigError, DynError, StoreError};
use crate::tier::ClockTier;
use crate::traits::MutateCache;
use crate::versioned::store::{CommitFn, StoreCache};
use crate::versioned::{StoreRequest, VersionedRecord};

/// [`StoreCache`] holding only `key → version`.
pub struct VersionIndexCache<K> {
    versions: MutatingCache<K, i64>,
}

impl<K> VersionIndexCache<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    /// Creates a cache remembering at most `capacity` versions.
    pub fn new(capacity: usize) -> Result<Self, ConfigError> {
        let versions = MutatingCache::builder()
            .tier(Arc::new(ClockTier::try_new(capacity)?))
            .try_build()?;
        Ok(Self { versions })
    }
}

impl<K, P> StoreCache<K, P> for VersionIndexCache<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    P: Clone + Send + Sync + 'static,
{
    fn put(
        &self,
        key: &K,
        request: &StoreRequest<P>,
        commit: CommitFn<'_, P>,
    ) -> Result<VersionedRecord<P>, StoreError> {
        let accepted: Mutex<Option<VersionedRecord<P>>> = Mutex::new(None);
        // Placeholder for the create path; the modifier overwrites it
        // with the accepted version before anything is written back.
        let placeholder = || -> Result<Option<Arc<i64>>, DynError> { Ok(Some(Arc::new(-1))) };
        let modifier = |_: Arc<i64>| -> Result<Option<Arc<i64>>, DynError> {
            let record = commit(request).map_err(|err| -> DynError { Box::new(err) })?;
            let version = record.version;
            *accepted.lock() = Some(record);
            Ok(Some(Arc::new(version)))
        };
        self.versions
            .modify(
                key,
                &ModifyParams::new()
                    .creator(&placeholder)
                    .modifier(&modifier)
                    .create_if_missing(true),
            )
            .map_err(StoreError::from_modify)?;
        Ok(accepted
            .into_inner()
            .expect("commit populated the accepted record"))
    }

    /// Always `None`: this cache holds no payloads.
    fn get(&self, _key: &K) -> Option<VersionedRecord<P>> {
        None
    }

    fn version(&self, key: &K) -> Option<i64> {
        self.versions.get_if_present(key).map(|version| *version)
    }

    fn warm(&self, key: &K, record: &VersionedRecord<P>) {
        let version = record.version;
        let creator = move || -> Result<Option<Arc<i64>>, DynError> { Ok(Some(Arc::new(version))) };
        // Identity modifier: an already-cached version stays
        // authoritative over the republished one.
        let params = ModifyParams::new().creator(&creator).create_if_missing(true);
        if let Err(err) = self.versions.modify(key, &params) {
            debug!(error = %err, "swallowing version republish failure");
        }
    }

    fn serializes_by_key(&self) -> bool {
        true
    }
}
