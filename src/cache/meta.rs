//! Metadata cache: object id (or domain key) to its JSON record.

use serde_json::Value;

use super::LruCache;

fn json_size(value: &Value) -> usize {
    // serialized length approximates the heap footprint well enough
    // for budget purposes
    serde_json::to_string(value).map(|s| s.len()).unwrap_or(0)
}

pub struct MetaCache {
    inner: LruCache<Value>,
}

impl MetaCache {
    pub fn new(mem_target: usize) -> Self {
        MetaCache { inner: LruCache::new(mem_target, json_size) }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.contains(id)
    }

    pub fn get(&mut self, id: &str) -> Option<Value> {
        self.inner.get(id).cloned()
    }

    pub fn insert(&mut self, id: &str, value: Value) {
        self.inner.insert(id, value);
    }

    pub fn set_dirty(&mut self, id: &str) {
        self.inner.set_dirty(id);
    }

    pub fn clear_dirty(&mut self, id: &str) {
        self.inner.clear_dirty(id);
    }

    pub fn is_dirty(&self, id: &str) -> bool {
        self.inner.is_dirty(id)
    }

    pub fn remove(&mut self, id: &str) -> Option<Value> {
        self.inner.remove(id)
    }

    pub fn dirty_count(&self) -> usize {
        self.inner.dirty_count()
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
    use serde_json::json;

    #[test]
    fn test_round_trip() {
        let mut cache = MetaCache::new(1024 * 1024);
        let obj = json!({"id": "g-1", "root": "g-1", "linkCount": 0});
        cache.insert("g-1", obj.clone());
        assert_eq!(cache.get("g-1"), Some(obj));
        assert!(cache.get("g-2").is_none());
    }

    #[test]
    fn test_dirty_cycle() {
        let mut cache = MetaCache::new(1024);
        cache.insert("g-1", json!({"a": 1}));
        cache.set_dirty("g-1");
        assert!(cache.is_dirty("g-1"));
        assert_eq!(cache.dirty_count(), 1);
        cache.clear_dirty("g-1");
        assert!(!cache.is_dirty("g-1"));
    }
}
