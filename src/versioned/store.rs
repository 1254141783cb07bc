//! The optimistic store core: durable map, cache capability, version
//! check.
//!
//! ## Write path
//!
//! ```text
//! OptimisticStore::put(key, request)
//!     │
//!     │  cache.serializes_by_key()?  no ──► take own per-key lock
//!     ▼
//! cache.put(key, request, commit)
//!     │   the cache runs `commit` wherever its own per-key atomicity
//!     ▼   holds (e.g. inside an engine modifier)
//! commit: current version (cache fast path → full read fallback)
//!         ──► version check ──► durable write ──► accepted record
//! ```
//!
//! The version check and the durable write always execute inside
//! exactly one per-key critical section — either the store's own lock
//! or the cache's, never both, never neither.
//!
//! ## Read path
//!
//! `get` returns the cached record when present; on a miss it reads the
//! durable store and republishes into the cache best-effort. That
//! republish is the one place failures are swallowed (logged at debug
//! level): it is a warm-up side effect, not the operation the caller
//! asked for.

use std::hash::Hash;
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tracing::trace;

use crate::ds::{hash_of, KeyLockTable};
use crate::error::StoreError;
use crate::versioned::{Operation, StoreRequest, VersionedRecord};

/// Validates `request` against the store's `current` version and
/// assigns the accepted record's version.
fn check_version<P: Clone>(
    request: &StoreRequest<P>,
    current: Option<i64>,
) -> Result<VersionedRecord<P>, StoreError> {
    match request.operation() {
        Operation::New => {
            if current.is_some() {
                return Err(StoreError::AlreadyExists);
            }
            Ok(VersionedRecord::new(0, request.record().payload.clone()))
        }
        Operation::Update => {
            let current = current.ok_or(StoreError::DoesNotExist)?;
            let requested = request.record().version;
            if requested != current {
                trace!(requested, current, "update rejected on version conflict");
                return Err(StoreError::VersionConflict { requested, current });
            }
            Ok(VersionedRecord::new(
                requested + 1,
                request.record().payload.clone(),
            ))
        }
    }
}

/// The durable backing map ("the database").
///
/// Treated as expensive to read; the cache exists to keep `get` and
/// version lookups off this store.
pub trait DurableStore<K, P>: Send + Sync {
    /// Fetch a record by key, as an owned copy.
    fn get(&self, key: &K) -> Option<VersionedRecord<P>>;

    /// Insert or replace the record for a key.
    fn put(&self, key: K, record: VersionedRecord<P>);

    /// Visit every record. Iteration order is unspecified.
    fn for_each(&self, visit: &mut dyn FnMut(&K, &VersionedRecord<P>));
}

/// In-memory [`DurableStore`] stand-in.
pub struct MemoryStore<K, P> {
    records: RwLock<FxHashMap<K, VersionedRecord<P>>>,
}

impl<K, P> MemoryStore<K, P> {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(FxHashMap::default()),
        }
    }
}

impl<K, P> Default for MemoryStore<K, P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, P> DurableStore<K, P> for MemoryStore<K, P>
where
    K: Eq + Hash + Send + Sync,
    P: Clone + Send + Sync,
{
    fn get(&self, key: &K) -> Option<VersionedRecord<P>> {
        self.records.read().get(key).cloned()
    }

    fn put(&self, key: K, record: VersionedRecord<P>) {
        self.records.write().insert(key, record);
    }

    fn for_each(&self, visit: &mut dyn FnMut(&K, &VersionedRecord<P>)) {
        for (key, record) in self.records.read().iter() {
            visit(key, record);
        }
    }
}

/// Store-owned closure handed to [`StoreCache::put`]: version check
/// plus durable write, returning the accepted record.
pub type CommitFn<'a, P> =
    &'a (dyn Fn(&StoreRequest<P>) -> Result<VersionedRecord<P>, StoreError> + Send + Sync + 'a);

/// Cache capability consumed by [`OptimisticStore`].
///
/// `put` receives the store's `commit` closure and must run it inside
/// whatever critical section gives the implementation its per-key
/// atomicity, then absorb the accepted record into its own structure.
pub trait StoreCache<K, P>: Send + Sync {
    /// Run `commit` for `key` and cache its result.
    fn put(
        &self,
        key: &K,
        request: &StoreRequest<P>,
        commit: CommitFn<'_, P>,
    ) -> Result<VersionedRecord<P>, StoreError>;

    /// Cached record for `key`, as an owned copy.
    fn get(&self, key: &K) -> Option<VersionedRecord<P>>;

    /// Fast version lookup; `None` means the cache cannot answer.
    fn version(&self, key: &K) -> Option<i64>;

    /// Best-effort republish of an existing durable record after a read
    /// miss. Implementations swallow failures; the default does
    /// nothing.
    fn warm(&self, _key: &K, _record: &VersionedRecord<P>) {}

    /// Whether `put` already serializes callers per key, making the
    /// store's own key lock redundant.
    fn serializes_by_key(&self) -> bool {
        false
    }
}

/// Key/value store with optimistic locking, accelerated by a pluggable
/// cache.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use mutcache::error::StoreError;
/// use mutcache::versioned::{
///     MemoryStore, OptimisticStore, StoreRequest, VersionIndexCache,
/// };
///
/// let durable: Arc<MemoryStore<String, String>> = Arc::new(MemoryStore::new());
/// let cache = VersionIndexCache::new(1000).unwrap();
/// let store = OptimisticStore::new(durable, cache);
///
/// let created = store.put(&"k".to_string(), StoreRequest::create("a".to_string())).unwrap();
/// assert_eq!(created.version, 0);
///
/// let updated = store.put(&"k".to_string(), StoreRequest::update(0, "b".to_string())).unwrap();
/// assert_eq!(updated.version, 1);
///
/// // A stale update is rejected.
/// let err = store
///     .put(&"k".to_string(), StoreRequest::update(0, "c".to_string()))
///     .unwrap_err();
/// assert!(matches!(err, StoreError::VersionConflict { .. }));
/// ```
pub struct OptimisticStore<K, P, C> {
    durable: Arc<dyn DurableStore<K, P>>,
    cache: C,
    locks: KeyLockTable,
}

impl<K, P, C> OptimisticStore<K, P, C>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    P: Clone + Send + Sync + 'static,
    C: StoreCache<K, P>,
{
    pub fn new(durable: Arc<dyn DurableStore<K, P>>, cache: C) -> Self {
        Self {
            durable,
            cache,
            locks: KeyLockTable::new(),
        }
    }

    /// The pluggable cache, for inspection.
    pub fn cache(&self) -> &C {
        &self.cache
    }

    /// Applies `request` to `key`.
    ///
    /// `New` on an existing record fails with
    /// [`StoreError::AlreadyExists`]; `Update` on an absent record with
    /// [`StoreError::DoesNotExist`]; `Update` carrying a non-current
    /// version with [`StoreError::VersionConflict`]. On success the
    /// accepted record (version 0 for `New`, request version + 1 for
    /// `Update`) is durably written, cached, and returned.
    pub fn put(
        &self,
        key: &K,
        request: StoreRequest<P>,
    ) -> Result<VersionedRecord<P>, StoreError> {
        let commit = |request: &StoreRequest<P>| -> Result<VersionedRecord<P>, StoreError> {
            let accepted = check_version(request, self.current_version(key))?;
            self.durable.put(key.clone(), accepted.clone());
            Ok(accepted)
        };
        if self.cache.serializes_by_key() {
            self.cache.put(key, &request, &commit)
        } else {
            let _guard = self.locks.acquire(hash_of(key));
            self.cache.put(key, &request, &commit)
        }
    }

    /// Reads the record for `key`: cache hit, or durable read with a
    /// best-effort cache republish. The returned record is an owned
    /// copy.
    pub fn get(&self, key: &K) -> Option<VersionedRecord<P>> {
        if let Some(record) = self.cache.get(key) {
            return Some(record);
        }
        let record = self.durable.get(key)?;
        self.cache.warm(key, &record);
        Some(record)
    }

    fn current_version(&self, key: &K) -> Option<i64> {
        if let Some(version) = self.cache.version(key) {
            return Some(version);
        }
        self.cache
            .get(key)
            .or_else(|| self.durable.get(key))
            .map(|record| record.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_gets_version_zero() {
        let accepted = check_version(&StoreRequest::create("a"), None).unwrap();
        assert_eq!(accepted.version, 0);
    }

    #[test]
    fn new_on_existing_is_rejected() {
        let err = check_version(&StoreRequest::create("a"), Some(0)).unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists));
    }

    #[test]
    fn update_increments_the_request_version() {
        let accepted = check_version(&StoreRequest::update(4, "a"), Some(4)).unwrap();
        assert_eq!(accepted.version, 5);
    }

    #[test]
    fn update_on_absent_is_rejected() {
        let err = check_version(&StoreRequest::update(0, "a"), None).unwrap_err();
        assert!(matches!(err, StoreError::DoesNotExist));
    }

    #[test]
    fn stale_update_reports_both_versions() {
        let err = check_version(&StoreRequest::update(1, "a"), Some(3)).unwrap_err();
        match err {
            StoreError::VersionConflict { requested, current } => {
                assert_eq!(requested, 1);
                assert_eq!(current, 3);
            }
            other => panic!("expected version conflict, got {other:?}"),
        }
    }

    #[test]
    fn memory_store_returns_owned_copies() {
        let store: MemoryStore<String, String> = MemoryStore::new();
        store.put("k".into(), VersionedRecord::new(0, "v".into()));
        let mut copy = store.get(&"k".to_string()).unwrap();
        copy.payload.push_str("-mutated");
        assert_eq!(store.get(&"k".to_string()).unwrap().payload, "v");
    }
}
