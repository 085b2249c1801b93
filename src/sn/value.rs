//! Dataset value operations: the hyperslab read/write engine and
//! point selections.
//!
//! A user selection is decomposed into per-chunk sub-requests, each
//! carrying the dataset record and a chunk-relative selection to the
//! data node that owns the chunk. Sub-requests run concurrently and
//! the first failure aborts the operation with that status; a 404 on
//! read is not a failure, it means the chunk was never written and
//! the fill value shows through.

use hyper::{Body, Request, Response};
use serde_json::{json, Value};

use crate::auth::{self, AclAction};
use crate::client;
use crate::domain as domain_util;
use crate::dset;
use crate::dtype::{DataType, Shape};
use crate::error::{ServiceError, ServiceResult};
use crate::idutil::{self, ObjClass};
use crate::layout;
use crate::node::NodeState;
use crate::server;
use crate::slab::{Selection, Slab};

use super::{encode_param, get_object_json, validate_action};

fn dset_param(dset_json: &Value) -> String {
    encode_param(&dset_json.to_string())
}

fn chunk_url(state: &NodeState, chunk_id: &str) -> ServiceResult<String> {
    let dn_url = state.dn_url_for(chunk_id)?;
    Ok(format!("{}/chunks/{}", dn_url, chunk_id))
}

/// Convert a (possibly nested) JSON value into a packed slab of the
/// given shape. The nesting is walked by shape so that compound and
/// array elements (themselves JSON arrays) are handed whole to the
/// element codec.
fn json_to_slab(value: &Value, shape: &[u64], dtype: &DataType) -> ServiceResult<Slab> {
    let itemsize = dtype
        .item_size()
        .ok_or_else(|| ServiceError::BadRequest("type has no fixed size".to_string()))?;
    let count: u64 = shape.iter().product();
    let mut data = Vec::with_capacity(count as usize * itemsize);

    fn walk(
        value: &Value,
        shape: &[u64],
        dtype: &DataType,
        out: &mut Vec<u8>,
    ) -> ServiceResult<()> {
        match shape.split_first() {
            None => dtype.encode_value(value, out),
            Some((dim, rest)) => {
                let items = value.as_array().ok_or_else(|| {
                    ServiceError::BadRequest("value nesting does not match selection".to_string())
                })?;
                if items.len() as u64 != *dim {
                    return Err(ServiceError::BadRequest(format!(
                        "value has {} elements where selection expects {}",
                        items.len(),
                        dim
                    )));
                }
                for item in items {
                    walk(item, rest, dtype, out)?;
                }
                Ok(())
            }
        }
    }

    if count == 1 && !value.is_array() {
        // allow a bare element for single-point selections
        dtype.encode_value(value, &mut data)?;
    } else {
        walk(value, shape, dtype, &mut data)?;
    }
    Slab::from_bytes(shape, itemsize, data)
}

/// Inverse of `json_to_slab`.
fn slab_to_json(slab: &Slab, dtype: &DataType) -> ServiceResult<Value> {
    fn build(
        data: &[u8],
        dims: &[u64],
        itemsize: usize,
        dtype: &DataType,
        pos: &mut usize,
    ) -> ServiceResult<Value> {
        match dims.split_first() {
            None => {
                let element = &data[*pos..*pos + itemsize];
                *pos += itemsize;
                dtype.decode_value(element)
            }
            Some((dim, rest)) => {
                let mut items = Vec::with_capacity(*dim as usize);
                for _ in 0..*dim {
                    items.push(build(data, rest, itemsize, dtype, pos)?);
                }
                Ok(Value::Array(items))
            }
        }
    }
    let mut pos = 0;
    build(slab.as_bytes(), slab.dims(), slab.itemsize(), dtype, &mut pos)
}

async fn write_chunk_hyperslab(
    state: &NodeState,
    chunk_id: String,
    dset_json: &Value,
    sel: &Selection,
    arr: &Slab,
    layout_dims: &[u64],
) -> ServiceResult<()> {
    let chunk_sel = layout::chunk_coverage(&chunk_id, sel, layout_dims)?;
    let data_sel = layout::data_coverage(&chunk_id, sel, layout_dims)?;
    let sub = arr.read_selection(&data_sel)?;

    let url = format!(
        "{}?dset={}&select={}",
        chunk_url(state, &chunk_id)?,
        dset_param(dset_json),
        encode_param(&chunk_sel.to_param()),
    );
    client::put_binary(state, &url, sub.into_bytes()).await
}

async fn read_chunk_hyperslab(
    state: &NodeState,
    chunk_id: String,
    dset_json: &Value,
    sel: &Selection,
    layout_dims: &[u64],
) -> ServiceResult<(Selection, Option<Vec<u8>>)> {
    let chunk_sel = layout::chunk_coverage(&chunk_id, sel, layout_dims)?;
    let data_sel = layout::data_coverage(&chunk_id, sel, layout_dims)?;

    let url = format!(
        "{}?dset={}&select={}",
        chunk_url(state, &chunk_id)?,
        dset_param(dset_json),
        encode_param(&chunk_sel.to_param()),
    );
    let data = client::get_binary(state, &url).await?;
    Ok((data_sel, data))
}

struct ValueContext {
    dset_json: Value,
    dtype: DataType,
    itemsize: usize,
    dims: Vec<u64>,
    layout_dims: Vec<u64>,
    scalar: bool,
}

async fn value_context(state: &NodeState, dset_id: &str) -> ServiceResult<ValueContext> {
    idutil::validate_id(dset_id, Some(ObjClass::Dataset))?;
    let dset_json = get_object_json(state, dset_id).await?;
    let shape = dset::dataset_shape(&dset_json)?;
    if shape == Shape::Null {
        return Err(ServiceError::BadRequest(
            "value operations not supported on null dataspace".to_string(),
        ));
    }
    let scalar = shape == Shape::Scalar;
    let dims = shape.value_dims().unwrap();
    let dtype = dset::dataset_type(&dset_json)?;
    let itemsize = dset::item_size(&dset_json)?;
    let layout_dims = dset::chunk_layout(&dset_json)?;
    Ok(ValueContext { dset_json, dtype, itemsize, dims, layout_dims, scalar })
}

fn check_chunk_budget(state: &NodeState, sel: &Selection, layout_dims: &[u64]) -> ServiceResult<()> {
    let num_chunks = layout::num_chunks(sel, layout_dims);
    if num_chunks > state.config.max_chunks_per_request {
        return Err(ServiceError::TooLarge(format!(
            "selection touches {} chunks (limit {})",
            num_chunks, state.config.max_chunks_per_request
        )));
    }
    Ok(())
}

/// GET /datasets/{id}/value
pub async fn get_value(
    state: &NodeState,
    req: &Request<Body>,
    dset_id: &str,
) -> ServiceResult<Response<Body>> {
    let user = auth::authenticate(state, req, true).await?;
    let domain_path = domain_util::domain_from_request(req)?;
    validate_action(state, &domain_path, &user, AclAction::Read).await?;

    let ctx = value_context(state, dset_id).await?;
    let params = server::query_params(req);
    let sel = Selection::parse(params.get("select").map(String::as_str), &ctx.dims)?;
    check_chunk_budget(state, &sel, &ctx.layout_dims)?;

    let fill = dset::fill_bytes(&ctx.dset_json)?;
    let mut arr = Slab::filled(&sel.shape(), &fill);

    let chunk_ids = layout::chunk_ids(dset_id, &sel, &ctx.layout_dims)?;
    let reads = chunk_ids
        .into_iter()
        .map(|chunk_id| read_chunk_hyperslab(state, chunk_id, &ctx.dset_json, &sel, &ctx.layout_dims));
    let results = futures::future::try_join_all(reads).await?;

    for (data_sel, data) in results {
        if let Some(data) = data {
            let sub = Slab::from_bytes(&data_sel.shape(), ctx.itemsize, data)?;
            arr.write_selection(&data_sel, &sub)?;
        }
    }

    let binary = req
        .headers()
        .get(hyper::header::ACCEPT)
        .and_then(|accept| accept.to_str().ok())
        .map(|accept| accept.contains("application/octet-stream"))
        .unwrap_or(false);
    if binary {
        return server::binary_response(arr.into_bytes());
    }

    let mut value = slab_to_json(&arr, &ctx.dtype)?;
    if ctx.scalar {
        // unwrap the rank-1 stand-in for scalar dataspaces
        value = value
            .as_array()
            .and_then(|items| items.first().cloned())
            .unwrap_or(value);
    }
    server::ok_json(&json!({ "value": value }))
}

/// PUT /datasets/{id}/value
pub async fn put_value(
    state: &NodeState,
    req: Request<Body>,
    dset_id: &str,
) -> ServiceResult<Response<Body>> {
    let user = auth::authenticate(state, &req, false).await?;
    let domain_path = domain_util::domain_from_request(&req)?;
    validate_action(state, &domain_path, &user, AclAction::Update).await?;

    let ctx = value_context(state, dset_id).await?;
    let params = server::query_params(&req);

    let binary_request = req
        .headers()
        .get(hyper::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.starts_with("application/octet-stream"))
        .unwrap_or(false);

    let body_bytes = server::read_body(req).await?;
    if body_bytes.is_empty() {
        return Err(ServiceError::BadRequest("PUT value with no body".to_string()));
    }

    let (select_param, input) = if binary_request {
        let sel = Selection::parse(params.get("select").map(String::as_str), &ctx.dims)?;
        let expected = sel.num_elements() as usize * ctx.itemsize;
        if body_bytes.len() != expected {
            return Err(ServiceError::BadRequest(format!(
                "expected {} bytes, got {}",
                expected,
                body_bytes.len()
            )));
        }
        let input = Slab::from_bytes(&sel.shape(), ctx.itemsize, body_bytes)?;
        (sel, input)
    } else {
        let body: Value = serde_json::from_slice(&body_bytes)
            .map_err(|err| ServiceError::BadRequest(format!("malformed JSON body: {}", err)))?;
        let select_raw = params
            .get("select")
            .cloned()
            .or_else(|| body.get("select").and_then(Value::as_str).map(str::to_string));
        let sel = Selection::parse(select_raw.as_deref(), &ctx.dims)?;

        let input = if let Some(value) = body.get("value") {
            json_to_slab(value, &sel.shape(), &ctx.dtype)?
        } else if let Some(encoded) = body.get("value_base64").and_then(Value::as_str) {
            let raw = base64::decode(encoded)
                .map_err(|_| ServiceError::BadRequest("bad value_base64".to_string()))?;
            let expected = sel.num_elements() as usize * ctx.itemsize;
            if raw.len() != expected {
                return Err(ServiceError::BadRequest(format!(
                    "expected {} bytes, got {}",
                    expected,
                    raw.len()
                )));
            }
            Slab::from_bytes(&sel.shape(), ctx.itemsize, raw)?
        } else {
            return Err(ServiceError::BadRequest(
                "PUT value needs value or value_base64".to_string(),
            ));
        };
        (sel, input)
    };
    let sel = select_param;

    if sel.num_elements() == 0 {
        return Err(ServiceError::BadRequest("selection is empty".to_string()));
    }
    check_chunk_budget(state, &sel, &ctx.layout_dims)?;

    let chunk_ids = layout::chunk_ids(dset_id, &sel, &ctx.layout_dims)?;
    let writes = chunk_ids.into_iter().map(|chunk_id| {
        write_chunk_hyperslab(state, chunk_id, &ctx.dset_json, &sel, &input, &ctx.layout_dims)
    });
    futures::future::try_join_all(writes).await?;

    server::ok_json(&json!({}))
}

fn parse_points(body: &Value, dims: &[u64]) -> ServiceResult<Vec<Vec<u64>>> {
    let rank = dims.len();
    let raw = body
        .get("points")
        .and_then(Value::as_array)
        .ok_or_else(|| ServiceError::BadRequest("missing points".to_string()))?;
    if raw.is_empty() {
        return Err(ServiceError::BadRequest("empty points".to_string()));
    }
    let mut points = Vec::with_capacity(raw.len());
    for point in raw {
        let coord: Vec<u64> = if rank == 1 {
            vec![point
                .as_u64()
                .ok_or_else(|| ServiceError::BadRequest("bad point coordinate".to_string()))?]
        } else {
            let parts: Option<Vec<u64>> = point
                .as_array()
                .map(|parts| parts.iter().map(Value::as_u64).collect())
                .unwrap_or(None);
            parts.ok_or_else(|| ServiceError::BadRequest("bad point coordinate".to_string()))?
        };
        if coord.len() != rank {
            return Err(ServiceError::BadRequest("point rank mismatch".to_string()));
        }
        for (c, dim) in coord.iter().zip(dims) {
            if c >= dim {
                return Err(ServiceError::BadRequest(format!(
                    "point coordinate {} out of bounds ({})",
                    c, dim
                )));
            }
        }
        points.push(coord);
    }
    Ok(points)
}

fn pack_coord(coord: &[u64], out: &mut Vec<u8>) {
    for c in coord {
        out.extend_from_slice(&c.to_le_bytes());
    }
}

/// POST /datasets/{id}/value — point selection. `{points}` reads;
/// `{points, value}` writes.
pub async fn post_value(
    state: &NodeState,
    req: Request<Body>,
    dset_id: &str,
) -> ServiceResult<Response<Body>> {
    let user = auth::authenticate(state, &req, true).await?;
    let domain_path = domain_util::domain_from_request(&req)?;

    let body = server::read_json(req).await?;
    let writing = body.get("value").is_some();
    let action = if writing { AclAction::Update } else { AclAction::Read };
    if writing && user == auth::DEFAULT_USER {
        return Err(ServiceError::Unauthorized);
    }
    validate_action(state, &domain_path, &user, action).await?;

    let ctx = value_context(state, dset_id).await?;
    let points = parse_points(&body, &ctx.dims)?;

    // group points by the chunk that holds them, remembering their
    // position in the request ordering
    let mut by_chunk: std::collections::HashMap<String, Vec<(usize, Vec<u64>)>> =
        std::collections::HashMap::new();
    for (pos, coord) in points.iter().enumerate() {
        let chunk_id = layout::chunk_id_for_point(dset_id, coord, &ctx.layout_dims)?;
        let origin = layout::chunk_coordinate(&chunk_id, &ctx.layout_dims)?;
        let rel: Vec<u64> = coord.iter().zip(&origin).map(|(c, o)| c - o).collect();
        by_chunk.entry(chunk_id).or_default().push((pos, rel));
    }
    if by_chunk.len() > state.config.max_chunks_per_request {
        return Err(ServiceError::TooLarge(format!(
            "points touch {} chunks (limit {})",
            by_chunk.len(),
            state.config.max_chunks_per_request
        )));
    }

    if writing {
        let values = body
            .get("value")
            .and_then(Value::as_array)
            .ok_or_else(|| ServiceError::BadRequest("value must be an array".to_string()))?;
        if values.len() != points.len() {
            return Err(ServiceError::BadRequest(format!(
                "{} values for {} points",
                values.len(),
                points.len()
            )));
        }

        let writes = by_chunk.into_iter().map(|(chunk_id, members)| {
            let mut payload = Vec::new();
            let count = members.len();
            let mut encode_err = None;
            for (pos, rel) in &members {
                pack_coord(rel, &mut payload);
                if let Err(err) = ctx.dtype.encode_value(&values[*pos], &mut payload) {
                    encode_err = Some(err);
                    break;
                }
            }
            let dset_json = &ctx.dset_json;
            let state = &*state;
            async move {
                if let Some(err) = encode_err {
                    return Err(err);
                }
                let url = format!(
                    "{}?dset={}&action=put&count={}",
                    chunk_url(state, &chunk_id)?,
                    dset_param(dset_json),
                    count,
                );
                client::post_binary(state, &url, payload).await.map(|_| ())
            }
        });
        futures::future::try_join_all(writes).await?;
        return server::ok_json(&json!({}));
    }

    // point read: reassemble values in request order, filling from
    // the fill value where the chunk was never written
    let fill = dset::fill_bytes(&ctx.dset_json)?;
    let mut out: Vec<Vec<u8>> = vec![fill.clone(); points.len()];

    let reads = by_chunk.into_iter().map(|(chunk_id, members)| {
        let mut payload = Vec::new();
        for (_, rel) in &members {
            pack_coord(rel, &mut payload);
        }
        let dset_json = &ctx.dset_json;
        let state = &*state;
        async move {
            let url = format!(
                "{}?dset={}",
                chunk_url(state, &chunk_id)?,
                dset_param(dset_json),
            );
            let data = client::post_binary_opt(state, &url, payload).await?;
            Ok::<_, ServiceError>((members, data))
        }
    });
    let results = futures::future::try_join_all(reads).await?;

    for (members, data) in results {
        if let Some(data) = data {
            if data.len() != members.len() * ctx.itemsize {
                return Err(ServiceError::Internal("short point response".to_string()));
            }
            for (i, (pos, _)) in members.iter().enumerate() {
                out[*pos] = data[i * ctx.itemsize..(i + 1) * ctx.itemsize].to_vec();
            }
        }
    }

    let mut values = Vec::with_capacity(out.len());
    for element in &out {
        values.push(ctx.dtype.decode_value(element)?);
    }
    server::ok_json(&json!({ "value": values }))
}
