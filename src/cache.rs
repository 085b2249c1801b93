//! Per-node caches.
//!
//! Both the metadata and the chunk cache are LRU-by-access maps with
//! a byte budget and a dirty set. Dirty entries are pinned: they are
//! never evicted, because the cache is the only copy of the update
//! until the background writer persists it.

use std::collections::{BTreeMap, HashMap, HashSet};

pub mod chunk;
pub mod meta;

pub use chunk::ChunkCache;
pub use meta::MetaCache;

struct CacheEntry<V> {
    value: V,
    mem_size: usize,
    dirty: bool,
    seq: u64,
}

pub struct LruCache<V> {
    entries: HashMap<String, CacheEntry<V>>,
    // access order: oldest sequence number first
    order: BTreeMap<u64, String>,
    dirty_set: HashSet<String>,
    next_seq: u64,
    mem_used: usize,
    mem_dirty: usize,
    mem_target: usize,
    size_of: fn(&V) -> usize,
}

impl<V> LruCache<V> {
    pub fn new(mem_target: usize, size_of: fn(&V) -> usize) -> Self {
        LruCache {
            entries: HashMap::new(),
            order: BTreeMap::new(),
            dirty_set: HashSet::new(),
            next_seq: 0,
            mem_used: 0,
            mem_dirty: 0,
            mem_target,
            size_of,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn mem_used(&self) -> usize {
        self.mem_used
    }

    pub fn mem_dirty(&self) -> usize {
        self.mem_dirty
    }

    pub fn mem_target(&self) -> usize {
        self.mem_target
    }

    pub fn dirty_count(&self) -> usize {
        self.dirty_set.len()
    }

    pub fn is_dirty(&self, id: &str) -> bool {
        self.dirty_set.contains(id)
    }

    pub fn utilization_percent(&self) -> usize {
        if self.mem_target == 0 {
            return 0;
        }
        self.mem_used * 100 / self.mem_target
    }

    fn touch(&mut self, id: &str) {
        if let Some(entry) = self.entries.get_mut(id) {
            self.order.remove(&entry.seq);
            entry.seq = self.next_seq;
            self.order.insert(self.next_seq, id.to_string());
            self.next_seq += 1;
        }
    }

    /// Fetch, promoting the entry to most recently used.
    pub fn get(&mut self, id: &str) -> Option<&V> {
        if !self.entries.contains_key(id) {
            return None;
        }
        self.touch(id);
        self.entries.get(id).map(|entry| &entry.value)
    }

    /// Fetch without touching the access order.
    pub fn peek(&self, id: &str) -> Option<&V> {
        self.entries.get(id).map(|entry| &entry.value)
    }

    /// Mutable access for in-place updates, promoting the entry. The
    /// caller must not change the value's memory footprint.
    pub fn get_mut(&mut self, id: &str) -> Option<&mut V> {
        if !self.entries.contains_key(id) {
            return None;
        }
        self.touch(id);
        self.entries.get_mut(id).map(|entry| &mut entry.value)
    }

    /// Insert or replace; the entry starts clean (replacement keeps
    /// the dirty flag). Evicts least recently used clean entries when
    /// over target, never the entry just inserted.
    pub fn insert(&mut self, id: &str, value: V) {
        let mem_size = (self.size_of)(&value);
        let dirty = if let Some(old) = self.entries.remove(id) {
            self.order.remove(&old.seq);
            self.mem_used -= old.mem_size;
            if old.dirty {
                self.mem_dirty -= old.mem_size;
            }
            old.dirty
        } else {
            false
        };

        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert(id.to_string(), CacheEntry { value, mem_size, dirty, seq });
        self.order.insert(seq, id.to_string());
        self.mem_used += mem_size;
        if dirty {
            self.mem_dirty += mem_size;
        }

        if self.mem_used > self.mem_target {
            self.reduce(Some(id));
        }
    }

    fn reduce(&mut self, exclude: Option<&str>) {
        let mut victims = Vec::new();
        for (_, id) in self.order.iter() {
            if self.mem_used - victims.iter().map(|(_, size)| size).sum::<usize>()
                <= self.mem_target
            {
                break;
            }
            if Some(id.as_str()) == exclude {
                continue;
            }
            if let Some(entry) = self.entries.get(id) {
                if !entry.dirty {
                    victims.push((id.clone(), entry.mem_size));
                }
            }
        }
        for (id, _) in victims {
            log::debug!("cache evict: {}", id);
            self.remove(&id);
        }
    }

    pub fn set_dirty(&mut self, id: &str) {
        self.touch(id);
        if let Some(entry) = self.entries.get_mut(id) {
            if !entry.dirty {
                entry.dirty = true;
                self.mem_dirty += entry.mem_size;
                self.dirty_set.insert(id.to_string());
            }
        }
    }

    pub fn clear_dirty(&mut self, id: &str) {
        self.touch(id);
        if let Some(entry) = self.entries.get_mut(id) {
            if entry.dirty {
                entry.dirty = false;
                self.mem_dirty -= entry.mem_size;
                self.dirty_set.remove(id);
            }
        }
        if self.mem_used > self.mem_target {
            self.reduce(None);
        }
    }

    pub fn remove(&mut self, id: &str) -> Option<V> {
        let entry = self.entries.remove(id)?;
        self.order.remove(&entry.seq);
        self.mem_used -= entry.mem_size;
        if entry.dirty {
            self.mem_dirty -= entry.mem_size;
            self.dirty_set.remove(id);
            log::warn!("removing dirty entry from cache: {}", id);
        }
        Some(entry.value)
    }

    /// Ids in LRU order, oldest first.
    pub fn keys_lru(&self) -> Vec<String> {
        self.order.values().cloned().collect()
    }

    /// Verify internal bookkeeping; test support.
    #[cfg(test)]
    pub fn consistency_check(&self) {
        assert_eq!(self.order.len(), self.entries.len());
        let mut mem = 0;
        let mut dirty_mem = 0;
        let mut dirty = 0;
        for (id, entry) in &self.entries {
            assert_eq!(self.order.get(&entry.seq), Some(id));
            mem += entry.mem_size;
            if entry.dirty {
                dirty += 1;
                dirty_mem += entry.mem_size;
                assert!(self.dirty_set.contains(id));
            }
        }
        assert_eq!(mem, self.mem_used);
        assert_eq!(dirty_mem, self.mem_dirty);
        assert_eq!(dirty, self.dirty_set.len());
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn cache(target: usize) -> LruCache<Vec<u8>> {
        LruCache::new(target, |v| v.len())
    }

    #[test]
    fn test_insert_get() {
        let mut c = cache(100);
        c.insert("a", vec![1, 2, 3]);
        assert_eq!(c.get("a"), Some(&vec![1, 2, 3]));
        assert_eq!(c.get("b"), None);
        assert_eq!(c.mem_used(), 3);
        c.consistency_check();
    }

    #[test]
    fn test_lru_eviction() {
        let mut c = cache(10);
        c.insert("a", vec![0; 4]);
        c.insert("b", vec![0; 4]);
        // touch a so b becomes the eviction candidate
        c.get("a");
        c.insert("c", vec![0; 4]);
        assert!(c.contains("a"));
        assert!(!c.contains("b"));
        assert!(c.contains("c"));
        assert!(c.mem_used() <= 10);
        c.consistency_check();
    }

    #[test]
    fn test_dirty_pinning() {
        let mut c = cache(10);
        c.insert("a", vec![0; 8]);
        c.set_dirty("a");
        c.insert("b", vec![0; 8]);
        // a is dirty and pinned; over target but nothing evictable
        assert!(c.contains("a"));
        assert!(c.contains("b"));
        assert_eq!(c.mem_dirty(), 8);

        // clearing the flag frees it up
        c.clear_dirty("a");
        assert!(!c.contains("a"));
        assert!(c.contains("b"));
        c.consistency_check();
    }

    #[test]
    fn test_replace_keeps_dirty() {
        let mut c = cache(100);
        c.insert("a", vec![0; 4]);
        c.set_dirty("a");
        c.insert("a", vec![0; 8]);
        assert!(c.is_dirty("a"));
        assert_eq!(c.mem_used(), 8);
        assert_eq!(c.mem_dirty(), 8);
        c.consistency_check();
    }

    #[test]
    fn test_remove() {
        let mut c = cache(100);
        c.insert("a", vec![0; 4]);
        c.set_dirty("a");
        assert_eq!(c.remove("a"), Some(vec![0; 4]));
        assert_eq!(c.dirty_count(), 0);
        assert_eq!(c.mem_used(), 0);
        assert_eq!(c.remove("a"), None);
        c.consistency_check();
    }

    #[test]
    fn test_memory_bound_without_dirty() {
        let mut c = cache(20);
        for i in 0..50 {
            c.insert(&format!("k{}", i), vec![0; 6]);
            assert!(c.mem_used() <= 20, "over target after insert {}", i);
        }
        c.consistency_check();
    }
}
