//! Background store writer.
//!
//! Request handlers only mutate the caches and stamp the object id in
//! `dirty_ids`; this task walks the dirty map and persists entries
//! whose last mutation is older than `s3_sync_interval`. The
//! snapshot-then-clear of the dirty map happens under one lock so a
//! concurrent mutation re-marks the id and a later pass re-flushes
//! it; a write is never silently lost.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;

use crate::client;
use crate::codec;
use crate::domain;
use crate::error::{ServiceError, ServiceResult};
use crate::idutil::{self, ObjClass};
use crate::index;
use crate::node::NodeState;
use crate::store::unix_now;

const PENDING_WAIT: Duration = Duration::from_secs(2);
const PENDING_POLL: Duration = Duration::from_millis(100);

/// Wait for an in-flight write of the same key to finish, then claim
/// the pending-write slot. After the 2 s cap we proceed anyway:
/// writes to the same key are idempotent at the store.
async fn claim_pending_write(state: &NodeState, key: &str) {
    let wait_start = Instant::now();
    loop {
        {
            let mut pending = state.pending_writes.lock().unwrap();
            if !pending.contains_key(key) || wait_start.elapsed() >= PENDING_WAIT {
                pending.insert(key.to_string(), Instant::now());
                return;
            }
        }
        log::debug!("waiting for pending write of {}", key);
        tokio::time::sleep(PENDING_POLL).await;
    }
}

fn release_pending_write(state: &NodeState, key: &str) {
    state.pending_writes.lock().unwrap().remove(key);
}

/// Persist one dirty object (chunk or metadata) to the store.
pub async fn write_obj(state: &NodeState, id: &str) -> ServiceResult<()> {
    let key = idutil::store_key(id);
    claim_pending_write(state, &key).await;

    let result = if idutil::class_of(id) == Some(ObjClass::Chunk) && !id.contains('/') {
        write_chunk(state, id, &key).await
    } else {
        write_meta(state, id, &key).await
    };
    release_pending_write(state, &key);
    result
}

async fn write_chunk(state: &NodeState, chunk_id: &str, key: &str) -> ServiceResult<()> {
    let arr = {
        let mut cache = state.chunk_cache.lock().unwrap();
        match cache.get(chunk_id) {
            Some(arr) => {
                // entry may be evicted once the write lands
                cache.clear_dirty(chunk_id);
                arr
            }
            None => {
                return Err(ServiceError::Internal(format!(
                    "dirty chunk {} not in cache",
                    chunk_id
                )))
            }
        }
    };

    let dset_id = idutil::dataset_id_of(chunk_id)?;
    let deflate_level = state.deflate_map.lock().unwrap().get(&dset_id).copied();

    let bytes = match deflate_level {
        Some(level) => codec::deflate(arr.as_bytes(), level)?,
        None => arr.as_bytes().to_vec(),
    };

    if let Err(err) = state.storage.put(key, &bytes).await {
        log::error!("store write failed for chunk {}: {}", chunk_id, err);
        let mut cache = state.chunk_cache.lock().unwrap();
        if !cache.contains(chunk_id) {
            cache.insert(chunk_id, arr);
        }
        cache.set_dirty(chunk_id);
        return Err(err.into());
    }
    log::debug!("chunk {} written ({} bytes)", chunk_id, bytes.len());
    Ok(())
}

async fn write_meta(state: &NodeState, id: &str, key: &str) -> ServiceResult<()> {
    let obj_json = {
        let mut cache = state.meta_cache.lock().unwrap();
        match cache.get(id) {
            Some(value) => {
                cache.clear_dirty(id);
                value
            }
            None => {
                return Err(ServiceError::Internal(format!("dirty object {} not in cache", id)))
            }
        }
    };

    let (etag, size) = match state.storage.put_json(key, &obj_json).await {
        Ok(result) => result,
        Err(err) => {
            log::error!("store write failed for {}: {}", id, err);
            let mut cache = state.meta_cache.lock().unwrap();
            if !cache.contains(id) {
                cache.insert(id, obj_json);
            }
            cache.set_dirty(id);
            return Err(err.into());
        }
    };

    // keep the per-domain collection index current for listings
    if let Some(class) = idutil::class_of(id) {
        if class != ObjClass::Chunk && !id.contains('/') {
            if let Some(obj_domain) = obj_json.get("domain").and_then(|v| v.as_str()) {
                let index_key = domain::collection_index_key(obj_domain, class.collection());
                let fields = vec![etag, unix_now().to_string(), size.to_string()];
                if let Err(err) = index::update_line(&state.storage, &index_key, id, fields).await {
                    log::warn!("index update failed for {}: {}", id, err);
                }
            }
        }
    }
    Ok(())
}

/// Report persisted ids to the async GC collaborator, when one is
/// configured.
pub async fn notify_objects(state: &NodeState, ids: &[String]) {
    if ids.is_empty() {
        return;
    }
    if state.config.an_port == 0 {
        log::debug!("{} objects persisted (no async node configured)", ids.len());
        return;
    }
    let url = format!("http://{}:{}/objects", state.config.head_host, state.config.an_port);
    let body = json!({ "objs": ids });
    if let Err(err) = client::put_json(state, &url, &body).await {
        log::error!("async node notify failed: {}", err);
    }
}

/// One pass: flush every dirty id older than `age`.
pub async fn sync_pass(state: &NodeState, age: u64) -> ServiceResult<usize> {
    // snapshot and clear under a single lock acquisition
    let eligible: Vec<String> = {
        let mut dirty = state.dirty_ids.lock().unwrap();
        let picks: Vec<String> = dirty
            .iter()
            .filter(|(_, ts)| **ts <= age)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &picks {
            dirty.remove(id);
        }
        picks
    };

    if eligible.is_empty() {
        return Ok(0);
    }
    log::info!("sync pass: {} objects to write", eligible.len());

    let mut persisted = Vec::new();
    let mut failures = 0;
    for id in &eligible {
        match write_obj(state, id).await {
            Ok(()) => persisted.push(id.clone()),
            Err(err) => {
                log::warn!("sync write of {} failed, re-queueing: {}", id, err);
                // stamp with the current time so the retry waits a
                // full interval
                state.mark_dirty(id);
                failures += 1;
            }
        }
    }

    notify_objects(state, &persisted).await;
    if failures > 0 {
        log::warn!("sync pass: {} writes failed", failures);
    }
    Ok(persisted.len())
}

/// Periodic writer task for data nodes.
pub async fn run_sync_task(state: Arc<NodeState>) {
    let sleep = Duration::from_secs(state.config.node_sleep_time.max(1));
    loop {
        tokio::time::sleep(sleep).await;
        if !state.is_ready() {
            continue;
        }
        let age = unix_now().saturating_sub(state.config.s3_sync_interval);
        if let Err(err) = sync_pass(&state, age).await {
            log::error!("sync pass failed: {}", err);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::Config;
    use crate::node::NodeRole;
    use crate::slab::Slab;

    fn data_state() -> Arc<NodeState> {
        let mut config = Config::default();
        config.aws_s3_gateway = "memory://".to_string();
        NodeState::new(NodeRole::Data, config).unwrap()
    }

    #[tokio::test]
    async fn test_meta_flush_and_index() {
        let state = data_state();
        let id = "g-12345678-1234-1234-1234-1234567890ab";
        let obj = json!({"id": id, "domain": "/home/sample.h6", "linkCount": 0});
        {
            let mut cache = state.meta_cache.lock().unwrap();
            cache.insert(id, obj.clone());
            cache.set_dirty(id);
        }
        state.dirty_ids.lock().unwrap().insert(id.to_string(), 0);

        let written = sync_pass(&state, unix_now()).await.unwrap();
        assert_eq!(written, 1);
        assert!(state.dirty_ids.lock().unwrap().is_empty());
        assert!(!state.meta_cache.lock().unwrap().is_dirty(id));

        let stored = state.storage.get_json(&idutil::s3_key(id)).await.unwrap();
        assert_eq!(stored, obj);

        let ids = index::list_ids(
            &state.storage,
            &domain::collection_index_key("/home/sample.h6", "groups"),
            None,
            None,
        )
        .await
        .unwrap();
        assert_eq!(ids, vec![id.to_string()]);
    }

    #[tokio::test]
    async fn test_chunk_flush_with_deflate() {
        let state = data_state();
        let dset_id = "d-12345678-1234-1234-1234-1234567890ab";
        let chunk_id = format!("c-{}_0", &dset_id[2..]);
        state.deflate_map.lock().unwrap().insert(dset_id.to_string(), 5);

        let arr = Slab::filled(&[100], &7i32.to_le_bytes());
        {
            let mut cache = state.chunk_cache.lock().unwrap();
            cache.insert(&chunk_id, arr.clone());
            cache.set_dirty(&chunk_id);
        }
        state.dirty_ids.lock().unwrap().insert(chunk_id.clone(), 0);

        let written = sync_pass(&state, unix_now()).await.unwrap();
        assert_eq!(written, 1);

        let blob = state.storage.get(&idutil::s3_key(&chunk_id)).await.unwrap().data;
        assert!(blob.len() < arr.byte_len());
        assert_eq!(codec::inflate(&blob).unwrap(), arr.as_bytes());
    }

    #[tokio::test]
    async fn test_recent_updates_wait() {
        let state = data_state();
        let id = "g-12345678-1234-1234-1234-1234567890ab";
        {
            let mut cache = state.meta_cache.lock().unwrap();
            cache.insert(id, json!({"id": id}));
            cache.set_dirty(id);
        }
        state.mark_dirty(id);

        // age window excludes just-written entries
        let written = sync_pass(&state, unix_now().saturating_sub(100)).await.unwrap();
        assert_eq!(written, 0);
        assert!(state.dirty_ids.lock().unwrap().contains_key(id));
    }
}
