//! Thread-scoped markers for reentrant `modify` calls.
//!
//! When a modifier itself calls `modify` for the key it is already
//! transforming, the engine must hand it the in-flight value instead of
//! deadlocking on the per-key mutex or re-reading the tier. The marker
//! records `(key, in-flight value)` per thread for the duration of the
//! outer modifier; the engine consults it at the top of every `modify`.
//!
//! Frames form a stack per thread so nested reentrant calls on
//! different keys keep their own markers. A frame is pushed before the
//! modifier runs and popped by a drop guard, so failures and panics
//! clear it too.

use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

struct Frame<K, V> {
    key: K,
    value: Arc<V>,
}

/// Registry of in-flight `(key, value)` frames, keyed by thread.
pub struct ReentryTable<K, V> {
    frames: Mutex<FxHashMap<ThreadId, Vec<Frame<K, V>>>>,
}

impl<K, V> ReentryTable<K, V>
where
    K: Eq + Clone,
{
    pub fn new() -> Self {
        Self {
            frames: Mutex::new(FxHashMap::default()),
        }
    }

    /// Returns the value currently being modified for `key` on the
    /// calling thread, if any. The most recent frame wins.
    pub fn in_flight(&self, key: &K) -> Option<Arc<V>> {
        let frames = self.frames.lock();
        let stack = frames.get(&thread::current().id())?;
        stack
            .iter()
            .rev()
            .find(|frame| frame.key == *key)
            .map(|frame| Arc::clone(&frame.value))
    }

    /// Marks `value` as in flight for `key` on the calling thread until
    /// the returned guard drops.
    pub fn enter(&self, key: K, value: Arc<V>) -> ReentryGuard<'_, K, V> {
        let mut frames = self.frames.lock();
        frames
            .entry(thread::current().id())
            .or_default()
            .push(Frame { key, value });
        ReentryGuard { table: self }
    }

    fn exit(&self) {
        let mut frames = self.frames.lock();
        let id = thread::current().id();
        if let Some(stack) = frames.get_mut(&id) {
            stack.pop();
            if stack.is_empty() {
                frames.remove(&id);
            }
        }
    }
}

impl<K, V> Default for ReentryTable<K, V>
where
    K: Eq + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Clears the frame pushed by [`ReentryTable::enter`] on drop.
pub struct ReentryGuard<'a, K, V>
where
    K: Eq + Clone,
{
    table: &'a ReentryTable<K, V>,
}

impl<K, V> Drop for ReentryGuard<'_, K, V>
where
    K: Eq + Clone,
{
    fn drop(&mut self) {
        self.table.exit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_visible_only_while_guard_lives() {
        let table: ReentryTable<&str, i64> = ReentryTable::new();
        assert!(table.in_flight(&"k").is_none());
        {
            let value = Arc::new(7);
            let _guard = table.enter("k", Arc::clone(&value));
            let seen = table.in_flight(&"k").unwrap();
            assert!(Arc::ptr_eq(&seen, &value));
            assert!(table.in_flight(&"other").is_none());
        }
        assert!(table.in_flight(&"k").is_none());
    }

    #[test]
    fn nested_frames_resolve_per_key() {
        let table: ReentryTable<&str, i64> = ReentryTable::new();
        let outer = Arc::new(1);
        let inner = Arc::new(2);
        let _outer_guard = table.enter("a", Arc::clone(&outer));
        {
            let _inner_guard = table.enter("b", Arc::clone(&inner));
            assert!(Arc::ptr_eq(&table.in_flight(&"a").unwrap(), &outer));
            assert!(Arc::ptr_eq(&table.in_flight(&"b").unwrap(), &inner));
        }
        assert!(table.in_flight(&"b").is_none());
        assert!(Arc::ptr_eq(&table.in_flight(&"a").unwrap(), &outer));
    }

    #[test]
    fn frames_are_invisible_to_other_threads() {
        let table: Arc<ReentryTable<&'static str, i64>> = Arc::new(ReentryTable::new());
        let value = Arc::new(5);
        let _guard = table.enter("k", value);
        let table2 = Arc::clone(&table);
        std::thread::spawn(move || {
            assert!(table2.in_flight(&"k").is_none());
        })
        .join()
        .unwrap();
    }
}
