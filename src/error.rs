//! Error types for the mutcache library.
//!
//! ## Key Components
//!
//! - [`ConfigError`]: Returned when builder configuration is invalid
//!   (no tier configured, no level calculator, overlapping intervals).
//! - [`ModifyError`]: Returned by a single `modify` call — either a
//!   contract violation detected by the engine or a failure propagated
//!   verbatim from a caller-supplied creator/modifier.
//! - [`StoreError`]: Expected, recoverable outcomes of the optimistic
//!   versioned store (`AlreadyExists`, `DoesNotExist`, `VersionConflict`).
//!
//! ## Propagation Policy
//!
//! Errors from caller-supplied functions are never swallowed by the
//! engine; they surface through [`ModifyError::Creator`] /
//! [`ModifyError::Modifier`] with the entry left in its pre-call state.
//! The one scoped exception is the best-effort cache republish performed
//! by the versioned store on a read miss, which logs and discards
//! failures (see `versioned::store`).

use std::fmt;

/// Boxed error type carried by caller-supplied creators and modifiers.
pub type DynError = Box<dyn std::error::Error + Send + Sync + 'static>;

// ---------------------------------------------------------------------------
// ConfigError
// ---------------------------------------------------------------------------

/// Error returned when builder configuration parameters are invalid.
///
/// Produced by `try_build()` methods on the engine builders. Carries a
/// human-readable description of which parameter failed validation.
///
/// # Example
///
/// ```
/// use mutcache::engine::MutatingCache;
///
/// // A builder with no tier configured fails fast.
/// let err = MutatingCache::<u64, u64>::builder().try_build().unwrap_err();
/// assert!(err.to_string().contains("tier"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError(String);

impl ConfigError {
    /// Creates a new `ConfigError` with the given description.
    #[inline]
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }

    /// Returns the error description.
    #[inline]
    pub fn message(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for ConfigError {}

// ---------------------------------------------------------------------------
// ModifyError
// ---------------------------------------------------------------------------

/// Error returned by a single `modify` call.
///
/// `ReentrantReplace` and `MissingCreator` are contract violations
/// detected by the engine itself; `Creator` and `Modifier` wrap failures
/// from caller-supplied functions, propagated without partial
/// application (nothing is written or removed for the key).
#[derive(Debug)]
pub enum ModifyError {
    /// A reentrant modifier returned a value that is not the identical
    /// object it received. The reentrancy contract requires in-place
    /// mutation so the outer call's object graph is never silently
    /// replaced; removal (`None`) counts as a replacement too.
    ReentrantReplace,
    /// The entry was absent, creation was requested, and neither a
    /// per-call nor a default creator is available.
    MissingCreator,
    /// The creator failed; the entry was not materialized.
    Creator(DynError),
    /// The modifier failed; the entry is left in its pre-call state.
    Modifier(DynError),
}

impl ModifyError {
    /// Wraps a creator failure, unwrapping a smuggled `ModifyError` from
    /// a nested `modify` call back into its original form.
    pub(crate) fn from_creator(err: DynError) -> Self {
        match err.downcast::<ModifyError>() {
            Ok(inner) => *inner,
            Err(err) => ModifyError::Creator(err),
        }
    }

    /// Wraps a modifier failure. A nested `modify` call that failed and
    /// was boxed into the outer modifier's error is unwrapped back into
    /// the original `ModifyError`, so e.g. a reentrancy violation
    /// surfaces identically from any nesting depth.
    pub(crate) fn from_modifier(err: DynError) -> Self {
        match err.downcast::<ModifyError>() {
            Ok(inner) => *inner,
            Err(err) => ModifyError::Modifier(err),
        }
    }
}

impl fmt::Display for ModifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModifyError::ReentrantReplace => f.write_str(
                "reentrant modifier replaced the in-flight value instead of returning it",
            ),
            ModifyError::MissingCreator => {
                f.write_str("entry is absent and no creator is configured")
            }
            ModifyError::Creator(err) => write!(f, "creator failed: {err}"),
            ModifyError::Modifier(err) => write!(f, "modifier failed: {err}"),
        }
    }
}

impl std::error::Error for ModifyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ModifyError::Creator(err) | ModifyError::Modifier(err) => {
                let err: &(dyn std::error::Error + 'static) = err.as_ref();
                Some(err)
            }
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// StoreError
// ---------------------------------------------------------------------------

/// Outcome of a rejected optimistic-store operation.
///
/// The first three variants are expected, caller-driven control flow:
/// callers recover by re-reading and reapplying. `Cache` wraps an engine
/// failure that surfaced through a store cache (not a version-protocol
/// outcome).
#[derive(Debug)]
pub enum StoreError {
    /// A `New` request found the key already versioned.
    AlreadyExists,
    /// An `Update` request found no existing record.
    DoesNotExist,
    /// An `Update` request carried a version that does not match the
    /// store's current version for the key.
    VersionConflict {
        /// Version carried by the request.
        requested: i64,
        /// Version currently held by the store.
        current: i64,
    },
    /// The backing cache engine failed outside the version protocol.
    Cache(ModifyError),
}

impl StoreError {
    /// Recovers a `StoreError` smuggled through the cache engine's
    /// modifier error channel; any other engine failure is surfaced as
    /// [`StoreError::Cache`].
    pub(crate) fn from_modify(err: ModifyError) -> Self {
        match err {
            ModifyError::Modifier(err) | ModifyError::Creator(err) => {
                match err.downcast::<StoreError>() {
                    Ok(inner) => *inner,
                    Err(err) => StoreError::Cache(ModifyError::Modifier(err)),
                }
            }
            other => StoreError::Cache(other),
        }
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::AlreadyExists => f.write_str("record already exists"),
            StoreError::DoesNotExist => f.write_str("record does not exist"),
            StoreError::VersionConflict { requested, current } => write!(
                f,
                "version conflict: request carried {requested}, store holds {current}"
            ),
            StoreError::Cache(err) => write!(f, "cache failure: {err}"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Cache(err) => Some(err),
            _ => None,
        }
    }
}
