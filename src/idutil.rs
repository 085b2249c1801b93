//! Object id handling: creation, validation, shard partitioning and
//! store key derivation.
//!
//! Every persistent entity is identified by a string id. Object ids
//! look like `g-<uuid>`, `d-<uuid>`, `t-<uuid>`; chunk ids append the
//! tile index tuple: `c-<uuid>_<i0>_<i1>...`. Domains are identified
//! by their path and handled in the `domain` module.

use lazy_static::lazy_static;
use regex::Regex;
use uuid::Uuid;

use crate::error::{ServiceError, ServiceResult};

pub const HEAD_NODE_KEY: &str = "headnode";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjClass {
    Group,
    Dataset,
    Datatype,
    Chunk,
}

impl ObjClass {
    pub fn prefix(self) -> char {
        match self {
            ObjClass::Group => 'g',
            ObjClass::Dataset => 'd',
            ObjClass::Datatype => 't',
            ObjClass::Chunk => 'c',
        }
    }

    /// REST collection name (`groups`, `datasets`, `datatypes`).
    pub fn collection(self) -> &'static str {
        match self {
            ObjClass::Group => "groups",
            ObjClass::Dataset => "datasets",
            ObjClass::Datatype => "datatypes",
            ObjClass::Chunk => "chunks",
        }
    }

    pub fn from_collection(name: &str) -> Option<Self> {
        match name {
            "groups" => Some(ObjClass::Group),
            "datasets" => Some(ObjClass::Dataset),
            "datatypes" => Some(ObjClass::Datatype),
            "chunks" => Some(ObjClass::Chunk),
            _ => None,
        }
    }
}

lazy_static! {
    static ref UUID_RE: Regex =
        Regex::new(r"^[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}$").unwrap();
}

/// First 5 hex digits of the md5 of the id. This is the shard key:
/// it routes the id to a data node and spreads store keys across the
/// backend's keyspace.
pub fn hash5(id: &str) -> String {
    let digest = md5::compute(id.as_bytes());
    format!("{:x}", digest)[..5].to_string()
}

/// Map an id (or a domain key) to a node index in `[0, count)`.
pub fn partition(id: &str, count: usize) -> usize {
    let hash_value = u32::from_str_radix(&hash5(id), 16).unwrap_or(0);
    hash_value as usize % count
}

/// Store key for an object id: the 5-char md5 prefix, a dash, and the
/// id itself. The prefix has no semantic meaning.
pub fn s3_key(id: &str) -> String {
    format!("{}-{}", hash5(id), id)
}

/// Store key for an object id or a domain key. Domain keys (they
/// contain `/`) are store keys already.
pub fn store_key(id: &str) -> String {
    if id.contains('/') {
        id.to_string()
    } else {
        s3_key(id)
    }
}

pub fn create_id(class: ObjClass) -> String {
    format!("{}-{}", class.prefix(), Uuid::new_v4())
}

pub fn class_of(id: &str) -> Option<ObjClass> {
    match id.as_bytes().first() {
        Some(b'g') => Some(ObjClass::Group),
        Some(b'd') => Some(ObjClass::Dataset),
        Some(b't') => Some(ObjClass::Datatype),
        Some(b'c') => Some(ObjClass::Chunk),
        _ => None,
    }
}

/// Check that `id` is a well formed object id, optionally of the
/// expected class.
pub fn validate_id(id: &str, expected: Option<ObjClass>) -> ServiceResult<()> {
    let class = class_of(id)
        .ok_or_else(|| ServiceError::BadRequest(format!("invalid id prefix: {}", id)))?;
    if let Some(expected) = expected {
        if class != expected {
            return Err(ServiceError::BadRequest(format!(
                "expected {} id, got: {}",
                expected.collection(),
                id
            )));
        }
    }
    if id.as_bytes().get(1) != Some(&b'-') {
        return Err(ServiceError::BadRequest(format!("invalid id: {}", id)));
    }

    if class == ObjClass::Chunk {
        let body = &id[2..];
        let sep = body
            .find('_')
            .ok_or_else(|| ServiceError::BadRequest(format!("chunk id has no index: {}", id)))?;
        let (uuid_part, index_part) = body.split_at(sep);
        if !UUID_RE.is_match(uuid_part) {
            return Err(ServiceError::BadRequest(format!("invalid chunk id: {}", id)));
        }
        for part in index_part[1..].split('_') {
            if part.is_empty() || part.parse::<u64>().is_err() {
                return Err(ServiceError::BadRequest(format!(
                    "invalid chunk index in id: {}",
                    id
                )));
            }
        }
    } else {
        if id.len() != 38 {
            return Err(ServiceError::BadRequest(format!("unexpected id length: {}", id)));
        }
        if !UUID_RE.is_match(&id[2..]) {
            return Err(ServiceError::BadRequest(format!("invalid id: {}", id)));
        }
    }
    Ok(())
}

/// Dataset id a chunk belongs to: strip the index suffix and rewrite
/// the prefix.
pub fn dataset_id_of(chunk_id: &str) -> ServiceResult<String> {
    validate_id(chunk_id, Some(ObjClass::Chunk))?;
    let sep = chunk_id.find('_').unwrap();
    Ok(format!("d-{}", &chunk_id[2..sep]))
}

/// Parse the `_`-separated tile index tuple out of a chunk id.
pub fn chunk_index(chunk_id: &str) -> ServiceResult<Vec<u64>> {
    let sep = chunk_id
        .find('_')
        .ok_or_else(|| ServiceError::BadRequest(format!("invalid chunk id: {}", chunk_id)))?;
    chunk_id[sep + 1..]
        .split('_')
        .map(|part| {
            part.parse::<u64>().map_err(|_| {
                ServiceError::BadRequest(format!("invalid chunk index in id: {}", chunk_id))
            })
        })
        .collect()
}

/// Chunk id for the given dataset and tile index.
pub fn chunk_id_for(dset_id: &str, index: &[u64]) -> String {
    let mut id = format!("c-{}", &dset_id[2..]);
    for i in index {
        id.push('_');
        id.push_str(&i.to_string());
    }
    id
}

#[cfg(test)]
mod test {
    use super::*;

    const DSET_ID: &str = "d-12345678-1234-1234-1234-1234567890ab";

    #[test]
    fn test_hash5() {
        // stable across nodes; 5 lowercase hex digits
        let h = hash5("g-12345678-1234-1234-1234-1234567890ab");
        assert_eq!(h.len(), 5);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(h, hash5("g-12345678-1234-1234-1234-1234567890ab"));
    }

    #[test]
    fn test_partition_range() {
        for count in 1..8 {
            for i in 0..50 {
                let id = create_id(ObjClass::Group);
                let p = partition(&id, count);
                assert!(p < count, "partition {} out of range for {} ({})", p, count, i);
            }
        }
    }

    #[test]
    fn test_s3_key() {
        let id = "g-12345678-1234-1234-1234-1234567890ab";
        let key = s3_key(id);
        assert_eq!(key.len(), 5 + 1 + id.len());
        assert!(key.ends_with(id));
        assert_eq!(&key[5..6], "-");
    }

    #[test]
    fn test_create_and_validate() {
        for class in &[ObjClass::Group, ObjClass::Dataset, ObjClass::Datatype] {
            let id = create_id(*class);
            assert_eq!(id.len(), 38);
            validate_id(&id, Some(*class)).unwrap();
            assert_eq!(class_of(&id), Some(*class));
        }
    }

    #[test]
    fn test_validate_rejects() {
        assert!(validate_id("x-12345678-1234-1234-1234-1234567890ab", None).is_err());
        assert!(validate_id("g-short", None).is_err());
        assert!(validate_id("g-12345678-1234-1234-1234-1234567890ZZ", None).is_err());
        assert!(validate_id(DSET_ID, Some(ObjClass::Group)).is_err());
    }

    #[test]
    fn test_chunk_ids() {
        let chunk_id = chunk_id_for(DSET_ID, &[6, 4]);
        assert_eq!(chunk_id, "c-12345678-1234-1234-1234-1234567890ab_6_4");
        validate_id(&chunk_id, Some(ObjClass::Chunk)).unwrap();
        assert_eq!(dataset_id_of(&chunk_id).unwrap(), DSET_ID);
        assert_eq!(chunk_index(&chunk_id).unwrap(), vec![6, 4]);
    }

    #[test]
    fn test_chunk_id_rejects() {
        assert!(validate_id("c-12345678-1234-1234-1234-1234567890ab", Some(ObjClass::Chunk)).is_err());
        assert!(validate_id("c-12345678-1234-1234-1234-1234567890ab_", Some(ObjClass::Chunk)).is_err());
        assert!(validate_id("c-12345678-1234-1234-1234-1234567890ab_a", Some(ObjClass::Chunk)).is_err());
    }
}
