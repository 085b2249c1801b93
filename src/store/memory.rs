//! In-process object store, used by tests and single-node
//! development setups.

use std::collections::BTreeMap;
use std::sync::Mutex;

use super::{content_etag, unix_now, GetResult, ListEntry, ObjectStore, StoreError, StoreResult};

#[derive(Debug, Clone)]
struct Entry {
    data: Vec<u8>,
    etag: String,
    last_modified: u64,
}

#[derive(Default)]
pub struct MemoryStore {
    // BTreeMap keeps list() in key order for free
    objects: Mutex<BTreeMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl ObjectStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<GetResult> {
        let objects = self.objects.lock().unwrap();
        let entry = objects.get(key).ok_or(StoreError::NotFound)?;
        Ok(GetResult {
            data: entry.data.clone(),
            etag: entry.etag.clone(),
            last_modified: entry.last_modified,
        })
    }

    async fn get_range(&self, key: &str, offset: u64, length: u64) -> StoreResult<Vec<u8>> {
        let objects = self.objects.lock().unwrap();
        let entry = objects.get(key).ok_or(StoreError::NotFound)?;
        let start = offset as usize;
        let end = (offset + length) as usize;
        if end > entry.data.len() || start > end {
            return Err(StoreError::Malformed(format!(
                "range {}+{} beyond object size {}",
                offset,
                length,
                entry.data.len()
            )));
        }
        Ok(entry.data[start..end].to_vec())
    }

    async fn put(&self, key: &str, data: &[u8]) -> StoreResult<(String, u64)> {
        let etag = content_etag(data);
        let size = data.len() as u64;
        let mut objects = self.objects.lock().unwrap();
        objects.insert(
            key.to_string(),
            Entry { data: data.to_vec(), etag: etag.clone(), last_modified: unix_now() },
        );
        Ok((etag, size))
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        Ok(self.objects.lock().unwrap().contains_key(key))
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let mut objects = self.objects.lock().unwrap();
        objects.remove(key).map(|_| ()).ok_or(StoreError::NotFound)
    }

    async fn list(
        &self,
        prefix: &str,
        delimiter: Option<char>,
        stats: bool,
    ) -> StoreResult<Vec<ListEntry>> {
        let objects = self.objects.lock().unwrap();
        let mut out: Vec<ListEntry> = Vec::new();
        for (key, entry) in objects.range(prefix.to_string()..) {
            if !key.starts_with(prefix) {
                break;
            }
            if let Some(delim) = delimiter {
                if let Some(pos) = key[prefix.len()..].find(delim) {
                    let collapsed = format!("{}{}", &key[..prefix.len() + pos], delim);
                    if out.last().map(|e| e.key.as_str()) != Some(collapsed.as_str()) {
                        out.push(ListEntry {
                            key: collapsed,
                            etag: None,
                            last_modified: None,
                            size: None,
                        });
                    }
                    continue;
                }
            }
            out.push(ListEntry {
                key: key.clone(),
                etag: if stats { Some(entry.etag.clone()) } else { None },
                last_modified: if stats { Some(entry.last_modified) } else { None },
                size: if stats { Some(entry.data.len() as u64) } else { None },
            });
        }
        Ok(out)
    }
}
