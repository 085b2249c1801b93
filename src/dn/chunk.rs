//! Chunk data handlers.
//!
//! A chunk request carries the owning dataset's record as the `dset`
//! query parameter and a chunk-relative selection, so the data node
//! needs no metadata lookup of its own. The single read path
//! (`get_chunk`) coalesces concurrent store fetches of the same
//! chunk and blocks on cache pressure rather than displacing dirty
//! tiles.

use std::time::{Duration, Instant};

use hyper::{Body, Request, Response};
use serde_json::{json, Value};

use crate::boolparse::Expr;
use crate::codec;
use crate::dset;
use crate::error::{ServiceError, ServiceResult};
use crate::idutil::{self, ObjClass};
use crate::layout;
use crate::node::NodeState;
use crate::server;
use crate::slab::{Selection, Slab};
use crate::store::StoreError;

const PENDING_READ_WAIT: Duration = Duration::from_secs(2);
const PENDING_READ_POLL: Duration = Duration::from_millis(100);
const PRESSURE_POLL: Duration = Duration::from_millis(250);

fn dset_from_params(params: &std::collections::HashMap<String, String>) -> ServiceResult<Value> {
    let raw = params
        .get("dset")
        .ok_or_else(|| ServiceError::BadRequest("missing dset parameter".to_string()))?;
    serde_json::from_str(raw)
        .map_err(|err| ServiceError::BadRequest(format!("bad dset parameter: {}", err)))
}

fn record_deflate(state: &NodeState, chunk_id: &str, dset_json: &Value) {
    if let Some(level) = dset::deflate_level(dset_json) {
        if let Ok(dset_id) = idutil::dataset_id_of(chunk_id) {
            state.deflate_map.lock().unwrap().entry(dset_id).or_insert(level);
        }
    }
}

/// Fetch or initialize the chunk's tile.
///
/// Cache hit wins; otherwise the blob is read (waiting out any
/// duplicate in-flight read), decompressed and reshaped. A missing
/// blob yields a fill-value tile when `chunk_init` is set, and `None`
/// otherwise. Installing the tile blocks while the cache is full of
/// dirty data, up to `max_chunk_wait_time`.
pub async fn get_chunk(
    state: &NodeState,
    chunk_id: &str,
    dset_json: &Value,
    chunk_init: bool,
) -> ServiceResult<Option<Slab>> {
    let dims = dset::chunk_layout(dset_json)?;
    let itemsize = dset::item_size(dset_json)?;

    if let Some(arr) = state.chunk_cache.lock().unwrap().get(chunk_id) {
        return Ok(Some(arr));
    }

    let key = idutil::s3_key(chunk_id);
    let arr = if state.storage.exists(&key).await? {
        record_deflate(state, chunk_id, dset_json);

        let wait_start = Instant::now();
        let mut cached = None;
        loop {
            if let Some(arr) = state.chunk_cache.lock().unwrap().get(chunk_id) {
                cached = Some(arr);
                break;
            }
            let claimed = {
                let mut pending = state.pending_reads.lock().unwrap();
                match pending.get(chunk_id) {
                    Some(started) if started.elapsed() < PENDING_READ_WAIT => false,
                    _ => {
                        pending.insert(chunk_id.to_string(), Instant::now());
                        true
                    }
                }
            };
            if claimed || wait_start.elapsed() >= PENDING_READ_WAIT {
                break;
            }
            log::debug!("waiting for pending read of chunk {}", chunk_id);
            tokio::time::sleep(PENDING_READ_POLL).await;
        }

        match cached {
            Some(arr) => return Ok(Some(arr)),
            None => {
                let result = state.storage.get(&key).await;
                state.pending_reads.lock().unwrap().remove(chunk_id);
                let data = match result {
                    Ok(result) => result.data,
                    Err(StoreError::NotFound) => {
                        // deleted between the exists check and the read
                        return Ok(None);
                    }
                    Err(err) => return Err(err.into()),
                };
                let raw = if dset::deflate_level(dset_json).is_some() {
                    codec::inflate(&data)?
                } else {
                    data
                };
                Slab::from_bytes(&dims, itemsize, raw)?
            }
        }
    } else if chunk_init {
        let fill = dset::fill_bytes(dset_json)?;
        Slab::filled(&dims, &fill)
    } else {
        log::debug!("chunk {} not found", chunk_id);
        return Ok(None);
    };

    // room check before installing; dirty tiles cannot be displaced
    let need = arr.byte_len();
    let wait_start = Instant::now();
    let max_wait = Duration::from_secs(state.config.max_chunk_wait_time.max(1));
    loop {
        {
            let mut cache = state.chunk_cache.lock().unwrap();
            if cache.has_room(need) {
                cache.insert(chunk_id, arr.clone());
                return Ok(Some(arr));
            }
        }
        if wait_start.elapsed() >= max_wait {
            log::error!("no room in chunk cache for {} after {:?}", chunk_id, max_wait);
            return Err(ServiceError::Unavailable("chunk cache full of dirty data".to_string()));
        }
        log::warn!(
            "chunk cache full ({} dirty), waiting to install {}",
            state.chunk_cache.lock().unwrap().mem_dirty(),
            chunk_id
        );
        tokio::time::sleep(PRESSURE_POLL).await;
    }
}

fn validate_chunk_request(state: &NodeState, chunk_id: &str) -> ServiceResult<()> {
    idutil::validate_id(chunk_id, Some(ObjClass::Chunk))?;
    state.validate_in_partition(chunk_id)
}

/// PUT: write the selected region of the chunk.
pub async fn put_chunk(
    state: &NodeState,
    req: Request<Body>,
    chunk_id: &str,
) -> ServiceResult<Response<Body>> {
    validate_chunk_request(state, chunk_id)?;
    server::check_binary_content_type(&req)?;

    let params = server::query_params(&req);
    let dset_json = dset_from_params(&params)?;
    let dims = dset::chunk_layout(&dset_json)?;
    if dims.is_empty() {
        return Err(ServiceError::BadRequest("no dimensions in chunk request".to_string()));
    }
    let itemsize = dset::item_size(&dset_json)?;
    let sel = Selection::parse(params.get("select").map(String::as_str), &dims)?;

    let expected = sel.num_elements() as usize * itemsize;
    let input_bytes = server::read_body(req).await?;
    if input_bytes.len() != expected {
        return Err(ServiceError::BadRequest(format!(
            "expected {} bytes, got {}",
            expected,
            input_bytes.len()
        )));
    }
    let input = Slab::from_bytes(&sel.shape(), itemsize, input_bytes)?;

    record_deflate(state, chunk_id, &dset_json);
    let arr = get_chunk(state, chunk_id, &dset_json, true)
        .await?
        .ok_or_else(|| ServiceError::Internal("chunk init failed".to_string()))?;

    // mutate the cached tile in place under the lock, so concurrent
    // writes to the same chunk serialize instead of clobbering each
    // other
    {
        let mut cache = state.chunk_cache.lock().unwrap();
        if !cache.contains(chunk_id) {
            cache.insert(chunk_id, arr);
        }
        match cache.get_mut(chunk_id) {
            Some(slab) => slab.write_selection(&sel, &input)?,
            None => return Err(ServiceError::Internal("chunk vanished from cache".to_string())),
        }
        cache.set_dirty(chunk_id);
        log::debug!(
            "chunk {} dirty; cache {}% used, {} dirty entries",
            chunk_id,
            cache.utilization_percent(),
            cache.dirty_count()
        );
    }
    state.mark_dirty(chunk_id);

    server::created_json(&json!({}))
}

/// GET: read the selected region, or evaluate a boolean query over a
/// rank-1 compound chunk.
pub async fn get_chunk_req(
    state: &NodeState,
    req: &Request<Body>,
    chunk_id: &str,
) -> ServiceResult<Response<Body>> {
    validate_chunk_request(state, chunk_id)?;
    let params = server::query_params(req);
    let dset_json = dset_from_params(&params)?;
    let dims = dset::chunk_layout(&dset_json)?;
    if dims.is_empty() {
        return Err(ServiceError::BadRequest("no dimensions in chunk request".to_string()));
    }
    let sel = Selection::parse(params.get("select").map(String::as_str), &dims)?;

    let arr = match get_chunk(state, chunk_id, &dset_json, false).await? {
        Some(arr) => arr,
        None => return Err(ServiceError::NotFound),
    };

    if let Some(query) = params.get("query") {
        if dims.len() != 1 {
            return Err(ServiceError::BadRequest(
                "query selection requires a one dimensional dataset".to_string(),
            ));
        }
        let dtype = dset::dataset_type(&dset_json)?;
        let field_names = dtype.field_names();
        if field_names.is_empty() {
            return Err(ServiceError::BadRequest(
                "query selection requires a compound type".to_string(),
            ));
        }
        let limit: usize = params
            .get("Limit")
            .and_then(|l| l.parse().ok())
            .unwrap_or(0);
        let expr = Expr::parse(query)?;
        let origin = layout::chunk_coordinate(chunk_id, &dims)?[0];

        let window = arr.read_selection(&sel)?;
        let itemsize = window.itemsize();
        let mut indices = Vec::new();
        let mut values = Vec::new();
        for i in 0..window.num_elements() {
            let element = &window.as_bytes()[i * itemsize..(i + 1) * itemsize];
            let record = dtype.decode_value(element)?;
            let lookup = |name: &str| -> Option<Value> {
                let pos = field_names.iter().position(|f| f == name)?;
                record.get(pos).cloned()
            };
            if expr.evaluate(&lookup)? {
                indices.push(origin + sel.0[0].start + i as u64 * sel.0[0].step);
                values.push(record);
                if limit > 0 && values.len() >= limit {
                    break;
                }
            }
        }
        return server::ok_json(&json!({ "index": indices, "value": values }));
    }

    let out = arr.read_selection(&sel)?;
    server::binary_response(out.into_bytes())
}

/// POST: packed point access. `action=put` writes `(coord, value)`
/// records; otherwise the body is packed coordinates and the
/// response is the packed values. Coordinates are chunk-relative
/// little-endian u64 tuples.
pub async fn post_chunk(
    state: &NodeState,
    req: Request<Body>,
    chunk_id: &str,
) -> ServiceResult<Response<Body>> {
    validate_chunk_request(state, chunk_id)?;
    server::check_binary_content_type(&req)?;

    let params = server::query_params(&req);
    let dset_json = dset_from_params(&params)?;
    let dims = dset::chunk_layout(&dset_json)?;
    let rank = dims.len();
    if rank == 0 {
        return Err(ServiceError::BadRequest("no dimensions in chunk request".to_string()));
    }
    let itemsize = dset::item_size(&dset_json)?;
    let put_points = params.get("action").map(String::as_str) == Some("put");

    let input_bytes = server::read_body(req).await?;

    if put_points {
        let record_size = rank * 8 + itemsize;
        if input_bytes.is_empty() || input_bytes.len() % record_size != 0 {
            return Err(ServiceError::BadRequest(format!(
                "point payload size {} not a multiple of record size {}",
                input_bytes.len(),
                record_size
            )));
        }
        let num_points = input_bytes.len() / record_size;
        if let Some(count) = params.get("count").and_then(|c| c.parse::<usize>().ok()) {
            if count != num_points {
                return Err(ServiceError::BadRequest(format!(
                    "expected {} points, got {}",
                    count, num_points
                )));
            }
        }

        record_deflate(state, chunk_id, &dset_json);
        let arr = get_chunk(state, chunk_id, &dset_json, true)
            .await?
            .ok_or_else(|| ServiceError::Internal("chunk init failed".to_string()))?;
        {
            let mut cache = state.chunk_cache.lock().unwrap();
            if !cache.contains(chunk_id) {
                cache.insert(chunk_id, arr);
            }
            let slab = cache.get_mut(chunk_id).ok_or_else(|| {
                ServiceError::Internal("chunk vanished from cache".to_string())
            })?;
            for point in 0..num_points {
                let base = point * record_size;
                let coord = read_coord(&input_bytes[base..base + rank * 8], rank);
                let value = &input_bytes[base + rank * 8..base + record_size];
                slab.set_point(&coord, value)?;
            }
            cache.set_dirty(chunk_id);
        }
        state.mark_dirty(chunk_id);
        return server::ok_json(&json!({}));
    }

    // point read
    if input_bytes.is_empty() || input_bytes.len() % (rank * 8) != 0 {
        return Err(ServiceError::BadRequest("bad point coordinate payload".to_string()));
    }
    let num_points = input_bytes.len() / (rank * 8);
    let arr = match get_chunk(state, chunk_id, &dset_json, false).await? {
        Some(arr) => arr,
        None => return Err(ServiceError::NotFound),
    };
    let mut out = Vec::with_capacity(num_points * itemsize);
    for point in 0..num_points {
        let base = point * rank * 8;
        let coord = read_coord(&input_bytes[base..base + rank * 8], rank);
        out.extend_from_slice(arr.get_point(&coord)?);
    }
    server::binary_response(out)
}

fn read_coord(data: &[u8], rank: usize) -> Vec<u64> {
    (0..rank)
        .map(|dim| {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&data[dim * 8..dim * 8 + 8]);
            u64::from_le_bytes(buf)
        })
        .collect()
}

/// DELETE: drop the cached tile; only the GC collaborator calls
/// this, and it deletes the blob itself.
pub async fn delete_chunk(state: &NodeState, chunk_id: &str) -> ServiceResult<Response<Body>> {
    validate_chunk_request(state, chunk_id)?;
    state.chunk_cache.lock().unwrap().remove(chunk_id);
    state.dirty_ids.lock().unwrap().remove(chunk_id);
    if let Ok(dset_id) = idutil::dataset_id_of(chunk_id) {
        // chunks only go away when their dataset does
        state.deflate_map.lock().unwrap().remove(&dset_id);
    }
    server::ok_json(&json!({}))
}
