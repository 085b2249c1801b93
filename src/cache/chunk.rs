//! Chunk cache: chunk id to its in-memory tile.

use crate::slab::Slab;

use super::LruCache;

pub struct ChunkCache {
    inner: LruCache<Slab>,
}

impl ChunkCache {
    pub fn new(mem_target: usize) -> Self {
        ChunkCache { inner: LruCache::new(mem_target, Slab::byte_len) }
    }

    pub fn contains(&self, chunk_id: &str) -> bool {
        self.inner.contains(chunk_id)
    }

    pub fn get(&mut self, chunk_id: &str) -> Option<Slab> {
        self.inner.get(chunk_id).cloned()
    }

    /// In-place access to the cached tile; selection writes keep the
    /// byte length fixed, so the cache accounting stays valid.
    pub fn get_mut(&mut self, chunk_id: &str) -> Option<&mut Slab> {
        self.inner.get_mut(chunk_id)
    }

    pub fn insert(&mut self, chunk_id: &str, arr: Slab) {
        self.inner.insert(chunk_id, arr);
    }

    pub fn set_dirty(&mut self, chunk_id: &str) {
        self.inner.set_dirty(chunk_id);
    }

    pub fn clear_dirty(&mut self, chunk_id: &str) {
        self.inner.clear_dirty(chunk_id);
    }

    pub fn is_dirty(&self, chunk_id: &str) -> bool {
        self.inner.is_dirty(chunk_id)
    }

    pub fn remove(&mut self, chunk_id: &str) -> Option<Slab> {
        self.inner.remove(chunk_id)
    }

    /// Room for `extra` more bytes without displacing dirty data.
    /// The chunk read path blocks on this before installing a new
    /// tile; the background writer frees dirty bytes over time.
    pub fn has_room(&self, extra: usize) -> bool {
        self.inner.mem_dirty() + extra <= self.inner.mem_target()
    }

    pub fn mem_used(&self) -> usize {
        self.inner.mem_used()
    }

    pub fn mem_dirty(&self) -> usize {
        self.inner.mem_dirty()
    }

    pub fn dirty_count(&self) -> usize {
        self.inner.dirty_count()
    }

    pub fn utilization_percent(&self) -> usize {
        self.inner.utilization_percent()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_byte_budget() {
        // 16 byte tiles, budget of 40: at most two clean tiles stay
        let mut cache = ChunkCache::new(40);
        for i in 0..5 {
            cache.insert(&format!("c-{}", i), Slab::zeroed(&[4], 4));
        }
        assert!(cache.mem_used() <= 40);
        assert!(cache.len() <= 2);
    }

    #[test]
    fn test_has_room_tracks_dirty_bytes() {
        let mut cache = ChunkCache::new(32);
        cache.insert("c-a", Slab::zeroed(&[4], 4));
        assert!(cache.has_room(16));
        cache.set_dirty("c-a");
        assert!(cache.has_room(16));
        cache.insert("c-b", Slab::zeroed(&[4], 4));
        cache.set_dirty("c-b");
        assert!(!cache.has_room(16));
        cache.clear_dirty("c-a");
        assert!(cache.has_room(16));
    }
}
