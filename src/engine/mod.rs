//! Mutate-in-place cache engines.
//!
//! The engines replace plain insertion with [`modify`]: every entry is
//! produced or transformed by a caller-supplied function, executed with
//! at-most-one concurrent mutation per key. [`MutatingCache`] wraps a
//! single tier; [`LeveledCache`] routes entries across several bounded
//! tiers by a level recomputed on every mutation.
//!
//! Caller-supplied functions are passed as plain function values:
//!
//! - creator: `Fn() -> Result<Option<Arc<V>>, DynError>` — materializes
//!   an absent entry; `Ok(None)` declines to create.
//! - modifier: `Fn(Arc<V>) -> Result<Option<Arc<V>>, DynError>` —
//!   transforms the current value; `Ok(None)` removes the entry.
//!   Returning the *same* `Arc` (after mutating through interior
//!   mutability, or untouched) is the identity signal: the engine skips
//!   the redundant write-back.
//! - predicates: `Fn(&K) -> bool` / `Fn(&V) -> bool` for `modify_all`.
//!
//! [`modify`]: crate::traits::MutateCache::modify

pub mod cache;
pub mod leveled;

pub use cache::{MutatingCache, MutatingCacheBuilder};
pub use leveled::{LeveledCache, LeveledCacheBuilder, TierRef};

use std::hash::Hash;
use std::sync::Arc;

use crate::ds::{KeyLockTable, ReentryTable};
use crate::error::{DynError, ModifyError};

/// Materializes a value for an absent entry. `Ok(None)` declines.
pub type CreatorFn<'a, V> = dyn Fn() -> Result<Option<Arc<V>>, DynError> + Send + Sync + 'a;
/// Transforms the current value. `Ok(None)` removes the entry.
pub type ModifierFn<'a, V> = dyn Fn(Arc<V>) -> Result<Option<Arc<V>>, DynError> + Send + Sync + 'a;
/// Computes the placement level for a key/value pair.
pub type LevelFn<'a, K, V> = dyn Fn(&K, &V) -> i32 + Send + Sync + 'a;
/// Key filter for `modify_all`.
pub type KeyPredicateFn<'a, K> = dyn Fn(&K) -> bool + Send + Sync + 'a;
/// Value filter for `modify_all`.
pub type ValuePredicateFn<'a, V> = dyn Fn(&V) -> bool + Send + Sync + 'a;

/// Per-call inputs to [`modify`](crate::traits::MutateCache::modify).
///
/// A per-call creator/modifier overrides the builder default for this
/// call only.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use mutcache::engine::ModifyParams;
/// use mutcache::error::DynError;
///
/// let add_one = |v: Arc<i64>| -> Result<Option<Arc<i64>>, DynError> {
///     Ok(Some(Arc::new(*v + 1)))
/// };
/// let params = ModifyParams::new().modifier(&add_one).create_if_missing(true);
/// assert!(params.creates_if_missing());
/// ```
pub struct ModifyParams<'a, V> {
    pub(crate) creator: Option<&'a CreatorFn<'a, V>>,
    pub(crate) modifier: Option<&'a ModifierFn<'a, V>>,
    pub(crate) create_if_missing: bool,
    pub(crate) reentrant: bool,
}

impl<'a, V> ModifyParams<'a, V> {
    pub fn new() -> Self {
        Self {
            creator: None,
            modifier: None,
            create_if_missing: false,
            reentrant: false,
        }
    }

    /// Use `creator` instead of the default creator for this call.
    pub fn creator(mut self, creator: &'a CreatorFn<'a, V>) -> Self {
        self.creator = Some(creator);
        self
    }

    /// Use `modifier` instead of the default modifier for this call.
    pub fn modifier(mut self, modifier: &'a ModifierFn<'a, V>) -> Self {
        self.modifier = Some(modifier);
        self
    }

    /// Materialize the entry via the creator when absent.
    pub fn create_if_missing(mut self, create: bool) -> Self {
        self.create_if_missing = create;
        self
    }

    /// Mark the in-flight value so the modifier may recursively call
    /// `modify` for the same key on this thread.
    pub fn reentrant(mut self, reentrant: bool) -> Self {
        self.reentrant = reentrant;
        self
    }

    pub fn creates_if_missing(&self) -> bool {
        self.create_if_missing
    }
}

impl<V> Default for ModifyParams<'_, V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-call inputs to [`modify_all`](crate::traits::MutateCache::modify_all).
pub struct ModifyAllParams<'a, K, V> {
    key_predicate: Option<&'a KeyPredicateFn<'a, K>>,
    value_predicate: Option<&'a ValuePredicateFn<'a, V>>,
    modifier: Option<&'a ModifierFn<'a, V>>,
    create_if_missing: bool,
    reentrant: bool,
}

impl<'a, K, V> ModifyAllParams<'a, K, V> {
    pub fn new() -> Self {
        Self {
            key_predicate: None,
            value_predicate: None,
            modifier: None,
            create_if_missing: false,
            reentrant: false,
        }
    }

    /// Only entries whose key passes `predicate` are modified.
    pub fn key_predicate(mut self, predicate: &'a KeyPredicateFn<'a, K>) -> Self {
        self.key_predicate = Some(predicate);
        self
    }

    /// Only entries whose value passes `predicate` are modified.
    pub fn value_predicate(mut self, predicate: &'a ValuePredicateFn<'a, V>) -> Self {
        self.value_predicate = Some(predicate);
        self
    }

    /// Use `modifier` instead of the default modifier for every
    /// matching entry.
    pub fn modifier(mut self, modifier: &'a ModifierFn<'a, V>) -> Self {
        self.modifier = Some(modifier);
        self
    }

    pub fn create_if_missing(mut self, create: bool) -> Self {
        self.create_if_missing = create;
        self
    }

    pub fn reentrant(mut self, reentrant: bool) -> Self {
        self.reentrant = reentrant;
        self
    }

    pub(crate) fn accepts(&self, key: &K, value: &Arc<V>) -> bool {
        self.key_predicate.map_or(true, |p| p(key))
            && self.value_predicate.map_or(true, |p| p(value.as_ref()))
    }

    pub(crate) fn modify_params(&self) -> ModifyParams<'a, V> {
        ModifyParams {
            creator: None,
            modifier: self.modifier,
            create_if_missing: self.create_if_missing,
            reentrant: self.reentrant,
        }
    }
}

impl<K, V> Default for ModifyAllParams<'_, K, V> {
    fn default() -> Self {
        Self::new()
    }
}

/// State shared by both engines: builder defaults, the per-key lock
/// registry and the reentrancy markers.
pub(crate) struct EngineCore<K, V> {
    default_creator: Option<Box<CreatorFn<'static, V>>>,
    default_modifier: Box<ModifierFn<'static, V>>,
    pub(crate) locks: KeyLockTable,
    reentry: ReentryTable<K, V>,
}

impl<K, V> EngineCore<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    pub(crate) fn new(
        default_creator: Option<Box<CreatorFn<V>>>,
        default_modifier: Option<Box<ModifierFn<V>>>,
        lock_shards: usize,
    ) -> Self {
        Self {
            default_creator,
            // Unset default modifier means "return the value untouched".
            default_modifier: default_modifier
                .unwrap_or_else(|| Box::new(|value| Ok(Some(value)))),
            locks: KeyLockTable::with_shards(lock_shards),
            reentry: ReentryTable::new(),
        }
    }

    /// Reentrant fast path: if the calling thread is already modifying
    /// `key`, apply the modifier to the in-flight value without any
    /// lookup or locking. The modifier must return the identical `Arc`
    /// it received; anything else (including removal) fails with
    /// [`ModifyError::ReentrantReplace`].
    pub(crate) fn reentrant_call(
        &self,
        key: &K,
        params: &ModifyParams<'_, V>,
    ) -> Option<Result<Option<Arc<V>>, ModifyError>> {
        let current = self.reentry.in_flight(key)?;
        let modifier = params.modifier.unwrap_or(&*self.default_modifier);
        let result = match modifier(Arc::clone(&current)) {
            Err(err) => Err(ModifyError::from_modifier(err)),
            Ok(Some(next)) if Arc::ptr_eq(&next, &current) => Ok(Some(next)),
            Ok(_) => Err(ModifyError::ReentrantReplace),
        };
        Some(result)
    }

    /// Materializes a value for an absent entry.
    pub(crate) fn create(
        &self,
        params: &ModifyParams<'_, V>,
    ) -> Result<Option<Arc<V>>, ModifyError> {
        let creator = params
            .creator
            .or(self.default_creator.as_deref())
            .ok_or(ModifyError::MissingCreator)?;
        creator().map_err(ModifyError::from_creator)
    }

    /// Runs the modifier, with the reentrancy marker set for the
    /// duration when requested. The marker is cleared unconditionally,
    /// also on failure and panic.
    pub(crate) fn transform(
        &self,
        key: &K,
        value: &Arc<V>,
        params: &ModifyParams<'_, V>,
    ) -> Result<Option<Arc<V>>, ModifyError> {
        let modifier = params.modifier.unwrap_or(&*self.default_modifier);
        let _frame = params
            .reentrant
            .then(|| self.reentry.enter(key.clone(), Arc::clone(value)));
        modifier(Arc::clone(value)).map_err(ModifyError::from_modifier)
    }
}
