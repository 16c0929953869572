use parking_lot::{Condvar, Mutex};
use std::cmp::Eq;
use std::collections::HashSet;
use std::hash::Hash;

/// A table of keyed locks. Holding the guard for a key excludes every other
/// holder of the same key while distinct keys proceed independently.
pub struct RAIIMutexTable<K> {
    map: Mutex<HashSet<K>>,
    released: Condvar,
}

pub struct RAIIMutexGuard<'a, K>
where
    K: Eq + Clone + Hash,
{
    parent: &'a RAIIMutexTable<K>,
    key: K,
}

impl<K> RAIIMutexTable<K>
where
    K: Eq + Clone + Hash,
{
    pub fn new() -> RAIIMutexTable<K> {
        RAIIMutexTable {
            map: Mutex::new(HashSet::new()),
            released: Condvar::new(),
        }
    }

    pub fn lock(&self, k: K) -> RAIIMutexGuard<'_, K> {
        let mut map_guard = self.map.lock();
        while map_guard.contains(&k) {
            self.released.wait(&mut map_guard);
        }
        map_guard.insert(k.clone());
        RAIIMutexGuard {
            parent: self,
            key: k,
        }
    }

    pub fn is_locked(&self, key: &K) -> bool {
        self.map.lock().contains(key)
    }

    fn unlock(&self, key: &K) {
        let mut map_guard = self.map.lock();
        debug_assert!(map_guard.contains(key));
        map_guard.remove(key);
        self.released.notify_all();
    }
}

impl<K> Default for RAIIMutexTable<K>
where
    K: Eq + Clone + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<'a, K> Drop for RAIIMutexGuard<'a, K>
where
    K: Eq + Clone + Hash,
{
    fn drop(&mut self) {
        self.parent.unlock(&self.key)
    }
}
