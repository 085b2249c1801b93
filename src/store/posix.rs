//! Directory-backed object store. Keys map to relative paths under
//! the bucket root; writes go to a temp file in the same directory
//! followed by an atomic rename, so concurrent readers never observe
//! a partial object.

use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use super::{content_etag, GetResult, ListEntry, ObjectStore, StoreError, StoreResult};

pub struct PosixStore {
    root: PathBuf,
}

impl PosixStore {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        PosixStore { root: root.into() }
    }

    fn path_for(&self, key: &str) -> StoreResult<PathBuf> {
        if key.is_empty()
            || key.starts_with('/')
            || key.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..")
        {
            return Err(StoreError::Fatal(format!("invalid store key: {}", key)));
        }
        Ok(self.root.join(key))
    }

    fn io_err(context: &str, err: std::io::Error) -> StoreError {
        if err.kind() == std::io::ErrorKind::NotFound {
            StoreError::NotFound
        } else {
            StoreError::Transient(format!("{}: {}", context, err))
        }
    }
}

fn mtime_of(meta: &std::fs::Metadata) -> u64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[async_trait::async_trait]
impl ObjectStore for PosixStore {
    async fn get(&self, key: &str) -> StoreResult<GetResult> {
        let path = self.path_for(key)?;
        let data = tokio::fs::read(&path)
            .await
            .map_err(|err| Self::io_err("read", err))?;
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|err| Self::io_err("stat", err))?;
        let etag = content_etag(&data);
        Ok(GetResult { data, etag, last_modified: mtime_of(&meta) })
    }

    async fn get_range(&self, key: &str, offset: u64, length: u64) -> StoreResult<Vec<u8>> {
        let result = self.get(key).await?;
        let start = offset as usize;
        let end = (offset + length) as usize;
        if end > result.data.len() || start > end {
            return Err(StoreError::Malformed(format!(
                "range {}+{} beyond object size {}",
                offset,
                length,
                result.data.len()
            )));
        }
        Ok(result.data[start..end].to_vec())
    }

    async fn put(&self, key: &str, data: &[u8]) -> StoreResult<(String, u64)> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| StoreError::Transient(format!("mkdir: {}", err)))?;
        }
        let tmp = path.with_extension(format!("tmp.{}", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, data)
            .await
            .map_err(|err| StoreError::Transient(format!("write: {}", err)))?;
        if let Err(err) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(StoreError::Transient(format!("rename: {}", err)));
        }
        Ok((content_etag(data), data.len() as u64))
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        let path = self.path_for(key)?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(StoreError::Transient(format!("stat: {}", err))),
        }
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let path = self.path_for(key)?;
        tokio::fs::remove_file(&path)
            .await
            .map_err(|err| Self::io_err("unlink", err))
    }

    async fn list(
        &self,
        prefix: &str,
        delimiter: Option<char>,
        stats: bool,
    ) -> StoreResult<Vec<ListEntry>> {
        // walk the tree synchronously; this backend serves dev and
        // test setups where the tree is small
        let mut keys: Vec<(String, PathBuf)> = Vec::new();
        let mut stack = vec![self.root.clone()];
        while let Some(dir) = stack.pop() {
            let entries = match std::fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => return Err(StoreError::Transient(format!("readdir: {}", err))),
            };
            for entry in entries {
                let entry = entry.map_err(|err| StoreError::Transient(format!("readdir: {}", err)))?;
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else if let Ok(rel) = path.strip_prefix(&self.root) {
                    let key = rel
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy())
                        .collect::<Vec<_>>()
                        .join("/");
                    // in-flight writes are invisible until renamed
                    if key.starts_with(prefix) && !key.contains(".tmp.") {
                        keys.push((key, path));
                    }
                }
            }
        }
        keys.sort_by(|a, b| a.0.cmp(&b.0));

        let mut out: Vec<ListEntry> = Vec::new();
        for (key, path) in keys {
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
            let (etag, last_modified, size) = if stats {
                let meta = std::fs::metadata(&path)
                    .map_err(|err| StoreError::Transient(format!("stat: {}", err)))?;
                let data = std::fs::read(&path)
                    .map_err(|err| StoreError::Transient(format!("read: {}", err)))?;
                (Some(content_etag(&data)), Some(mtime_of(&meta)), Some(meta.len()))
            } else {
                (None, None, None)
            };
            out.push(ListEntry { key, etag, last_modified, size });
        }
        Ok(out)
    }
}
