//! Optimistic-versioning key/value store built on the mutate-in-place
//! engines.
//!
//! [`OptimisticStore`] fronts a durable map with a pluggable cache and
//! detects write conflicts by version comparison instead of holding a
//! lock across the caller's read-modify-write gap:
//!
//! ```text
//!   put(key, New(payload))            ──► version 0, or AlreadyExists
//!   put(key, Update(v, payload))      ──► version v+1 if v is current,
//!                                          DoesNotExist / VersionConflict
//!                                          otherwise
//! ```
//!
//! Two cache implementations show the engines doing the store's
//! per-key serialization for free: [`VersionIndexCache`] (caches only
//! version numbers) and [`PrefixGroupCache`] (groups records sharing a
//! key prefix into one leveled entry).

pub mod group_cache;
pub mod store;
pub mod version_cache;

pub use group_cache::{GroupValue, PrefixGroupCache};
pub use store::{DurableStore, MemoryStore, OptimisticStore, StoreCache};
pub use version_cache::VersionIndexCache;

/// Requested write kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Create the record; fails with `AlreadyExists` if one exists.
    New,
    /// Replace the record; carries the version the caller read.
    Update,
}

/// A payload together with its store-assigned version.
///
/// Version 0 on first write; every accepted update stores the request's
/// version plus one. Records handed to callers are always owned copies,
/// so mutating one never affects stored state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedRecord<P> {
    pub version: i64,
    pub payload: P,
}

impl<P> VersionedRecord<P> {
    pub fn new(version: i64, payload: P) -> Self {
        Self { version, payload }
    }
}

/// One write request; exists only for the duration of one `put` call.
#[derive(Debug, Clone)]
pub struct StoreRequest<P> {
    op: Operation,
    record: VersionedRecord<P>,
}

impl<P> StoreRequest<P> {
    /// Request creation of a new record.
    pub fn create(payload: P) -> Self {
        Self {
            op: Operation::New,
            record: VersionedRecord::new(0, payload),
        }
    }

    /// Request an update against the version the caller last read.
    pub fn update(version: i64, payload: P) -> Self {
        Self {
            op: Operation::Update,
            record: VersionedRecord::new(version, payload),
        }
    }

    pub fn operation(&self) -> Operation {
        self.op
    }

    /// The payload and, for updates, the caller-carried version.
    pub fn record(&self) -> &VersionedRecord<P> {
        &self.record
    }
}
