//! Data node: the authoritative owner of a shard of the id space.
//!
//! All object-store reads and writes for an id happen on the data
//! node the id hashes to; the in-memory caches here are the only
//! mutable copy. Handlers validate the routing invariant first: a
//! request for an id this node does not own is a bad request.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use hyper::{Body, Method, Request, Response};
use percent_encoding::percent_decode_str;
use serde_json::Value;

use crate::error::{ServiceError, ServiceResult};
use crate::idutil::{self, ObjClass};
use crate::node::NodeState;
use crate::server::{self, HandlerFuture, Router};
use crate::store::{unix_now, StoreError};
use crate::sync;

pub mod attr;
pub mod chunk;
pub mod dataset;
pub mod domain;
pub mod group;
pub mod link;

const PENDING_READ_WAIT: Duration = Duration::from_secs(2);
const PENDING_READ_POLL: Duration = Duration::from_millis(100);

/// Fetch an object's JSON (uuid id or domain key): tombstone check,
/// cache hit, or a store read with duplicate reads coalesced through
/// the pending-read map.
pub async fn get_metadata_obj(state: &NodeState, id: &str) -> ServiceResult<Value> {
    state.validate_in_partition(id)?;
    if state.is_deleted(id) {
        return Err(ServiceError::Gone);
    }

    let key = idutil::store_key(id);
    let wait_start = Instant::now();
    loop {
        if let Some(value) = state.meta_cache.lock().unwrap().get(id) {
            return Ok(value);
        }
        let claimed = {
            let mut pending = state.pending_reads.lock().unwrap();
            match pending.get(&key) {
                Some(started) if started.elapsed() < PENDING_READ_WAIT => false,
                _ => {
                    pending.insert(key.clone(), Instant::now());
                    true
                }
            }
        };
        if claimed {
            break;
        }
        if wait_start.elapsed() >= PENDING_READ_WAIT {
            // the other read appears stuck; take over
            state.pending_reads.lock().unwrap().insert(key.clone(), Instant::now());
            break;
        }
        log::debug!("waiting for pending read of {}", key);
        tokio::time::sleep(PENDING_READ_POLL).await;
    }

    let result = state.storage.get_json(&key).await;
    state.pending_reads.lock().unwrap().remove(&key);
    match result {
        Ok(value) => {
            state.meta_cache.lock().unwrap().insert(id, value.clone());
            Ok(value)
        }
        Err(StoreError::NotFound) => Err(ServiceError::NotFound),
        Err(err) => Err(err.into()),
    }
}

/// Does the object exist (cache or store), ignoring tombstones?
pub async fn check_metadata_obj(state: &NodeState, id: &str) -> ServiceResult<bool> {
    state.validate_in_partition(id)?;
    if state.is_deleted(id) {
        return Ok(false);
    }
    if state.meta_cache.lock().unwrap().contains(id) {
        return Ok(true);
    }
    Ok(state.storage.exists(&idutil::store_key(id)).await?)
}

/// Install an updated object in the cache and schedule (or force)
/// its persist.
pub async fn save_metadata_obj(
    state: &NodeState,
    id: &str,
    obj_json: Value,
    flush: bool,
) -> ServiceResult<()> {
    state.validate_in_partition(id)?;
    if state.is_deleted(id) {
        if id.contains('/') {
            // domains may be re-created after deletion
            state.deleted_ids.lock().unwrap().remove(id);
        } else {
            log::error!("save of deleted id {}", id);
            return Err(ServiceError::Internal(format!("{} has been deleted", id)));
        }
    }

    {
        let mut cache = state.meta_cache.lock().unwrap();
        cache.insert(id, obj_json);
        cache.set_dirty(id);
    }
    if flush {
        sync::write_obj(state, id).await?;
    } else {
        state.mark_dirty(id);
    }
    Ok(())
}

/// Tombstone and remove an object; the blob goes away immediately,
/// dangling references are the client's (and the GC collaborator's)
/// concern.
pub async fn delete_metadata_obj(state: &NodeState, id: &str) -> ServiceResult<()> {
    state.validate_in_partition(id)?;

    let obj_domain = {
        let mut cache = state.meta_cache.lock().unwrap();
        let obj_domain = cache
            .get(id)
            .and_then(|obj| obj.get("domain").and_then(Value::as_str).map(str::to_string));
        cache.remove(id);
        obj_domain
    };
    state.deleted_ids.lock().unwrap().insert(id.to_string());
    state.dirty_ids.lock().unwrap().remove(id);

    let key = idutil::store_key(id);
    match state.storage.delete(&key).await {
        Ok(()) => {}
        Err(StoreError::NotFound) => {
            log::info!("delete of {}: blob never written", id)
        }
        Err(err) => return Err(err.into()),
    }

    if let (Some(obj_domain), Some(class)) = (obj_domain, idutil::class_of(id)) {
        if class != ObjClass::Chunk {
            let index_key = crate::domain::collection_index_key(&obj_domain, class.collection());
            if let Err(err) = crate::index::remove_line(&state.storage, &index_key, id).await {
                log::warn!("index cleanup failed for {}: {}", id, err);
            }
        }
    }
    sync::notify_objects(state, &[id.to_string()]).await;
    Ok(())
}

/// POST create for groups, datasets and committed types. The record
/// arrives fully formed from the service node; an embedded
/// `link {id, name}` is applied atomically when the parent group
/// lives in this partition.
pub async fn create_obj(
    state: &NodeState,
    class: ObjClass,
    mut body: Value,
) -> ServiceResult<Value> {
    let id = body
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| ServiceError::BadRequest("missing id".to_string()))?
        .to_string();
    idutil::validate_id(&id, Some(class))?;
    state.validate_in_partition(&id)?;

    let _guard = state.meta_write_lock.lock().await;
    if state.meta_cache.lock().unwrap().contains(&id)
        || state.storage.exists(&idutil::s3_key(&id)).await?
    {
        return Err(ServiceError::Conflict(format!("{} already exists", id)));
    }

    let link = body.as_object_mut().and_then(|obj| obj.remove("link"));
    let now = unix_now();
    if let Some(obj) = body.as_object_mut() {
        obj.entry("created").or_insert_with(|| now.into());
        obj.entry("lastModified").or_insert_with(|| now.into());
    }

    if let Some(link) = link {
        let parent_id = link
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| ServiceError::BadRequest("link has no parent id".to_string()))?
            .to_string();
        let title = link
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| ServiceError::BadRequest("link has no name".to_string()))?
            .to_string();
        // the service node only embeds the link when the parent is
        // co-located with the new object
        state.validate_in_partition(&parent_id)?;
        let mut parent = get_metadata_obj(state, &parent_id).await?;
        link::insert_link(
            &mut parent,
            &title,
            serde_json::json!({
                "class": "H5L_TYPE_HARD",
                "id": id,
                "collection": class.collection(),
                "created": now,
            }),
        )?;
        save_metadata_obj(state, &id, body.clone(), false).await?;
        save_metadata_obj(state, &parent_id, parent, false).await?;
    } else {
        save_metadata_obj(state, &id, body.clone(), false).await?;
    }
    Ok(body)
}

fn decode_segment(seg: &str) -> ServiceResult<String> {
    percent_decode_str(seg)
        .decode_utf8()
        .map(|s| s.into_owned())
        .map_err(|_| ServiceError::BadRequest(format!("bad path segment: {}", seg)))
}

async fn route(
    state: Arc<NodeState>,
    req: Request<Body>,
) -> ServiceResult<Response<Body>> {
    let path = req.uri().path().to_string();
    let mut segments = Vec::new();
    for seg in path.split('/').filter(|seg| !seg.is_empty()) {
        segments.push(decode_segment(seg)?);
    }
    let segs: Vec<&str> = segments.iter().map(String::as_str).collect();
    let method = req.method().clone();

    match (&method, segs.as_slice()) {
        (&Method::GET, ["info"]) => server::ok_json(&server::node_info(&state)),

        (&Method::GET, ["domains"]) => domain::get_domain(&state, &req).await,
        (&Method::PUT, ["domains"]) => domain::put_domain(&state, req).await,
        (&Method::DELETE, ["domains"]) => domain::delete_domain(&state, req).await,
        (&Method::PUT, ["acls", user]) => {
            let user = user.to_string();
            domain::put_acl(&state, req, &user).await
        }
        (&Method::DELETE, ["acls", user]) => {
            let user = user.to_string();
            domain::delete_acl(&state, req, &user).await
        }

        (&Method::GET, [coll, id]) if ObjClass::from_collection(coll).is_some() => {
            let class = ObjClass::from_collection(coll).unwrap();
            match class {
                ObjClass::Chunk => chunk::get_chunk_req(&state, &req, id).await,
                _ => {
                    idutil::validate_id(id, Some(class))?;
                    let obj = get_metadata_obj(&state, id).await?;
                    server::ok_json(&obj)
                }
            }
        }
        (&Method::POST, ["groups"]) => group::post_group(&state, req).await,
        (&Method::POST, ["datasets"]) => dataset::post_dataset(&state, req).await,
        (&Method::POST, ["datatypes"]) => {
            let body = server::read_json(req).await?;
            let obj = create_obj(&state, ObjClass::Datatype, body).await?;
            server::created_json(&obj)
        }
        (&Method::DELETE, [coll, id]) if ObjClass::from_collection(coll).is_some() => {
            let class = ObjClass::from_collection(coll).unwrap();
            match class {
                ObjClass::Chunk => chunk::delete_chunk(&state, id).await,
                ObjClass::Dataset => dataset::delete_dataset(&state, id).await,
                _ => {
                    idutil::validate_id(id, Some(class))?;
                    delete_metadata_obj(&state, id).await?;
                    server::ok_json(&serde_json::json!({}))
                }
            }
        }

        (&Method::PUT, ["chunks", id]) => chunk::put_chunk(&state, req, id).await,
        (&Method::POST, ["chunks", id]) => chunk::post_chunk(&state, req, id).await,

        (&Method::PUT, ["datasets", id, "shape"]) => dataset::put_shape(&state, req, id).await,

        (&Method::GET, ["groups", id, "links"]) => link::get_links(&state, &req, id).await,
        (&Method::GET, ["groups", id, "links", title]) => {
            link::get_link(&state, id, title).await
        }
        (&Method::PUT, ["groups", id, "links", title]) => {
            let (id, title) = (id.to_string(), title.to_string());
            link::put_link(&state, req, &id, &title).await
        }
        (&Method::DELETE, ["groups", id, "links", title]) => {
            link::delete_link(&state, id, title).await
        }

        (&Method::GET, [coll, id, "attributes"]) if ObjClass::from_collection(coll).is_some() => {
            attr::get_attributes(&state, &req, coll, id).await
        }
        (&Method::GET, [coll, id, "attributes", name])
            if ObjClass::from_collection(coll).is_some() =>
        {
            attr::get_attribute(&state, coll, id, name).await
        }
        (&Method::PUT, [coll, id, "attributes", name])
            if ObjClass::from_collection(coll).is_some() =>
        {
            let (coll, id, name) = (coll.to_string(), id.to_string(), name.to_string());
            attr::put_attribute(&state, req, &coll, &id, &name).await
        }
        (&Method::DELETE, [coll, id, "attributes", name])
            if ObjClass::from_collection(coll).is_some() =>
        {
            attr::delete_attribute(&state, coll, id, name).await
        }

        _ => Err(ServiceError::NotFound),
    }
}

pub fn router() -> Router {
    Arc::new(|state: Arc<NodeState>, req: Request<Body>, _peer: SocketAddr| -> HandlerFuture {
        Box::pin(route(state, req))
    })
}
