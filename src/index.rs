//! Line-oriented index files.
//!
//! Listings never scan the bucket: each domain carries text indexes
//! (`.domains.txt`, `.groups.txt`, `.datasets.txt`, `.datatypes.txt`)
//! whose lines are `<id> <etag> <lastModified> <size>` (domain
//! indexes carry just the child path). Indexes are updated after the
//! fact by whichever node persisted the object, so they are
//! eventually consistent with the blobs themselves.

use crate::error::ServiceResult;
use crate::store::{Storage, StoreError};

#[derive(Debug, Clone, PartialEq)]
pub struct IndexLine {
    pub id: String,
    pub fields: Vec<String>,
}

impl IndexLine {
    fn render(&self) -> String {
        let mut line = self.id.clone();
        for field in &self.fields {
            line.push(' ');
            line.push_str(field);
        }
        line
    }
}

pub fn parse_index(data: &str) -> Vec<IndexLine> {
    let mut out = Vec::new();
    for line in data.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut parts = line.split_whitespace().map(str::to_string);
        if let Some(id) = parts.next() {
            out.push(IndexLine { id, fields: parts.collect() });
        }
    }
    out
}

fn render_index(lines: &[IndexLine]) -> String {
    let mut out = String::new();
    for line in lines {
        out.push_str(&line.render());
        out.push('\n');
    }
    out
}

async fn load(storage: &Storage, key: &str) -> ServiceResult<Vec<IndexLine>> {
    match storage.get(key).await {
        Ok(result) => Ok(parse_index(&String::from_utf8_lossy(&result.data))),
        Err(StoreError::NotFound) => Ok(Vec::new()),
        Err(err) => Err(err.into()),
    }
}

async fn save(storage: &Storage, key: &str, lines: &[IndexLine]) -> ServiceResult<()> {
    storage.put(key, render_index(lines).as_bytes()).await?;
    Ok(())
}

/// Insert or replace the line for `id`.
pub async fn update_line(
    storage: &Storage,
    key: &str,
    id: &str,
    fields: Vec<String>,
) -> ServiceResult<()> {
    let mut lines = load(storage, key).await?;
    let entry = IndexLine { id: id.to_string(), fields };
    match lines.iter_mut().find(|line| line.id == id) {
        Some(line) => *line = entry,
        None => lines.push(entry),
    }
    save(storage, key, &lines).await
}

/// Drop the line for `id`, if present.
pub async fn remove_line(storage: &Storage, key: &str, id: &str) -> ServiceResult<()> {
    let mut lines = load(storage, key).await?;
    let before = lines.len();
    lines.retain(|line| line.id != id);
    if lines.len() != before {
        save(storage, key, &lines).await?;
    }
    Ok(())
}

/// Ids from the index, sorted, after the optional `Marker`, at most
/// `limit` entries.
pub async fn list_ids(
    storage: &Storage,
    key: &str,
    marker: Option<&str>,
    limit: Option<usize>,
) -> ServiceResult<Vec<String>> {
    let mut ids: Vec<String> = load(storage, key).await?.into_iter().map(|l| l.id).collect();
    ids.sort();
    let mut out: Vec<String> = match marker {
        Some(marker) => ids.into_iter().skip_while(|id| id.as_str() <= marker).collect(),
        None => ids,
    };
    if let Some(limit) = limit {
        out.truncate(limit);
    }
    Ok(out)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::store::MemoryStore;
    use std::sync::Arc;

    fn storage() -> Storage {
        Storage::new(Arc::new(MemoryStore::new()), 4)
    }

    #[test]
    fn test_parse() {
        let lines = parse_index("g-1 abc 123 40\n\nd-2 def 456 80 3 1200\n");
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].id, "g-1");
        assert_eq!(lines[0].fields, vec!["abc", "123", "40"]);
        assert_eq!(lines[1].fields.len(), 5);
    }

    #[tokio::test]
    async fn test_update_and_remove() {
        let storage = storage();
        update_line(&storage, "idx", "g-1", vec!["e1".into(), "1".into(), "10".into()])
            .await
            .unwrap();
        update_line(&storage, "idx", "g-2", vec!["e2".into(), "2".into(), "20".into()])
            .await
            .unwrap();
        // replace g-1's line
        update_line(&storage, "idx", "g-1", vec!["e3".into(), "3".into(), "30".into()])
            .await
            .unwrap();

        let data = storage.get("idx").await.unwrap().data;
        let lines = parse_index(&String::from_utf8_lossy(&data));
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].fields[0], "e3");

        remove_line(&storage, "idx", "g-1").await.unwrap();
        let ids = list_ids(&storage, "idx", None, None).await.unwrap();
        assert_eq!(ids, vec!["g-2"]);
    }

    #[tokio::test]
    async fn test_list_marker_limit() {
        let storage = storage();
        for id in &["a", "b", "c", "d"] {
            update_line(&storage, "idx", id, Vec::new()).await.unwrap();
        }
        let ids = list_ids(&storage, "idx", Some("b"), Some(1)).await.unwrap();
        assert_eq!(ids, vec!["c"]);
        let ids = list_ids(&storage, "missing", None, None).await.unwrap();
        assert!(ids.is_empty());
    }
}
