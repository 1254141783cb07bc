pub mod key_lock;
pub mod reentry;

pub use key_lock::{hash_of, KeyGuard, KeyLockTable};
pub use reentry::{ReentryGuard, ReentryTable};
