use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use camino::{Utf8Path, Utf8PathBuf};

use crate::core::{lock, Hash32};
use crate::data::AnySet;

/// Identifies one task invocation: the task and its resolved configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct CacheKey {
    pub task: String,
    pub digest: String,
}

impl CacheKey {
    pub(crate) fn new(task: impl Into<String>, digest: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            digest: digest.into(),
        }
    }

    /// File holding the persisted result under `dir`. Always a direct child
    /// of `dir`, whatever the task is called.
    pub(crate) fn path_in(&self, dir: &Utf8Path) -> Utf8PathBuf {
        dir.join(format!("{}-{}.cbor", file_stem(&self.task), self.digest))
    }
}

fn is_safe(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Task names outside `[A-Za-z0-9_]` are escaped and suffixed with a hash of
/// the full name, so distinct tasks never share a file.
fn file_stem(task: &str) -> String {
    if !task.is_empty() && task.chars().all(is_safe) {
        return task.to_owned();
    }

    let escaped: String = task
        .chars()
        .map(|c| if is_safe(c) { c } else { '_' })
        .collect();
    let hash = Hash32::hash(task).to_hex();
    format!("{escaped}_{}", &hash[..16])
}

type Slot = Arc<Mutex<Option<AnySet>>>;

/// Task results shared across invocations.
///
/// Every key has its own slot. The first caller for a key computes while
/// holding the slot, concurrent callers for the same key wait for it and
/// receive the same set. A failed computation leaves the slot empty, and a
/// set whose items failed or were cancelled since is computed again.
#[derive(Default)]
pub(crate) struct ResultCache {
    slots: Mutex<HashMap<CacheKey, Slot>>,
}

impl ResultCache {
    /// Returns the cached set for `key`, or the one produced by `init`.
    /// The flag tells whether the set came from the cache.
    pub(crate) fn get_or_try_insert<E>(
        &self,
        key: &CacheKey,
        init: impl FnOnce() -> Result<AnySet, E>,
    ) -> Result<(AnySet, bool), E> {
        let slot = Arc::clone(lock(&self.slots).entry(key.clone()).or_default());
        let mut guard = lock(&slot);

        match &*guard {
            Some(set) if !set.is_spoiled() => return Ok((set.clone(), true)),
            Some(_) => tracing::debug!(task = %key.task, "cached result has failed items"),
            None => {}
        }

        let set = init()?;
        *guard = Some(set.clone());
        Ok((set, false))
    }

    pub(crate) fn clear(&self) {
        lock(&self.slots).clear();
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        lock(&self.slots)
            .values()
            .filter(|slot| lock(slot).is_some())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Data, DataSet};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn key(digest: &str) -> CacheKey {
        CacheKey::new("task", digest)
    }

    fn set(value: i32) -> AnySet {
        AnySet::new(DataSet::from_values([("x", value)]).unwrap())
    }

    #[test]
    fn test_hit_after_miss() {
        let cache = ResultCache::default();

        let (_, hit) = cache.get_or_try_insert(&key("a"), || Ok::<_, ()>(set(1))).unwrap();
        assert!(!hit);

        let (cached, hit) = cache.get_or_try_insert(&key("a"), || Ok::<_, ()>(set(2))).unwrap();
        assert!(hit);
        let value = cached.downcast::<i32>().unwrap().goal("x").unwrap().get().unwrap();
        assert_eq!(value, 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_failure_not_cached() {
        let cache = ResultCache::default();

        let err = cache.get_or_try_insert(&key("a"), || Err::<AnySet, _>("boom"));
        assert_eq!(err.err(), Some("boom"));
        assert_eq!(cache.len(), 0);

        let (_, hit) = cache.get_or_try_insert(&key("a"), || Ok::<_, ()>(set(1))).unwrap();
        assert!(!hit);
    }

    #[test]
    fn test_spoiled_recomputed() {
        let cache = ResultCache::default();

        let lazy = || {
            let mut builder = DataSet::builder();
            builder.add("x", Data::lazy(|_| Ok(1))).unwrap();
            Ok::<_, ()>(AnySet::new(builder.build()))
        };

        let (first, _) = cache.get_or_try_insert(&key("a"), lazy).unwrap();
        first.downcast::<i32>().unwrap().goal("x").unwrap().cancel();

        let (second, hit) = cache.get_or_try_insert(&key("a"), || Ok::<_, ()>(set(2))).unwrap();
        assert!(!hit);
        let value = second.downcast::<i32>().unwrap().goal("x").unwrap().get().unwrap();
        assert_eq!(value, 2);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_single_flight() {
        let cache = Arc::new(ResultCache::default());
        let calls = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let calls = Arc::clone(&calls);
                std::thread::spawn(move || {
                    cache
                        .get_or_try_insert(&key("shared"), || {
                            calls.fetch_add(1, Ordering::SeqCst);
                            std::thread::sleep(std::time::Duration::from_millis(20));
                            Ok::<_, ()>(set(7))
                        })
                        .unwrap()
                })
            })
            .collect();

        let hits = handles
            .into_iter()
            .map(|handle| handle.join().unwrap().1)
            .filter(|hit| *hit)
            .count();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(hits, 7);
    }

    #[test]
    fn test_clear() {
        let cache = ResultCache::default();
        cache.get_or_try_insert(&key("a"), || Ok::<_, ()>(set(1))).unwrap();
        cache.clear();
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_path() {
        let path = key("abc").path_in(Utf8Path::new(".cache/tasks"));
        assert_eq!(path, Utf8PathBuf::from(".cache/tasks/task-abc.cbor"));
    }

    #[test]
    fn test_path_stays_in_dir() {
        let dir = Utf8Path::new(".cache/tasks");
        for task in ["../evil/x", "/etc/passwd", "..", "", "a/b", r"a\b"] {
            let path = CacheKey::new(task, "abc").path_in(dir);
            assert_eq!(path.parent(), Some(dir), "{task}");
            assert!(!path.file_name().unwrap().contains(['/', '\\']));
        }

        let slash = CacheKey::new("a/b", "abc").path_in(dir);
        let underscore = CacheKey::new("a_b", "abc").path_in(dir);
        assert_ne!(slash, underscore);
    }
}
