/* SPDX-License-Identifier: GPL-3.0-or-later */
/*! Tables of hooked Vulkan objects */
use crate::util::lock;
use ash::vk;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/** The loader dispatch table pointer stored in the first word of a
 * dispatchable handle. All handles derived from one instance (or one
 * device, including its queues and command buffers) share it. */
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DispatchKey(usize);

impl DispatchKey {
    /** Read the key out of a dispatchable handle.
     *
     * Safety: `handle` must be a live dispatchable Vulkan object. */
    pub unsafe fn of<H: vk::Handle>(handle: H) -> DispatchKey {
        let p = handle.as_raw() as usize as *const usize;
        DispatchKey(p.read())
    }

    pub fn from_raw(x: usize) -> DispatchKey {
        DispatchKey(x)
    }

    pub fn as_raw(&self) -> usize {
        self.0
    }
}

/** A mutex-guarded map from some key to shared object state.
 *
 * Walks (`find`, `retain`) hold the lock for the duration; callbacks must
 * not touch the same table. */
pub struct ObjectTable<K: Ord, V> {
    map: Mutex<BTreeMap<K, Arc<V>>>,
}

impl<K: Ord + Copy, V> ObjectTable<K, V> {
    pub const fn new() -> Self {
        ObjectTable {
            map: Mutex::new(BTreeMap::new()),
        }
    }

    /** Add an entry, replacing (and returning) any stale one with the same key */
    pub fn insert(&self, key: K, value: Arc<V>) -> Option<Arc<V>> {
        lock(&self.map).insert(key, value)
    }

    pub fn get(&self, key: K) -> Option<Arc<V>> {
        lock(&self.map).get(&key).cloned()
    }

    pub fn remove(&self, key: K) -> Option<Arc<V>> {
        lock(&self.map).remove(&key)
    }

    /** All entries, in key order, for which `pred` holds */
    pub fn filter(&self, pred: impl Fn(&V) -> bool) -> Vec<Arc<V>> {
        lock(&self.map).values().filter(|v| pred(v)).cloned().collect()
    }

    /** Remove and return all entries for which `pred` holds */
    pub fn remove_where(&self, pred: impl Fn(&V) -> bool) -> Vec<Arc<V>> {
        let mut map = lock(&self.map);
        let keys: Vec<K> = map
            .iter()
            .filter(|(_, v)| pred(v))
            .map(|(k, _)| *k)
            .collect();
        keys.iter().filter_map(|k| map.remove(k)).collect()
    }
}

impl<K: Ord + Copy, V> Default for ObjectTable<K, V> {
    fn default() -> Self {
        Self::new()
    }
}
